//! The incident store: a pluggable place incidents live so the admin API
//! and the dispatcher can read/write them without caring whether storage
//! is in-memory or durable.
//!
//! The trait shape and the in-memory implementation are grounded on
//! `bangarang-streaming`'s `StreamBackend`/`InMemoryBackend` pair -- a
//! `DashMap`-backed store reached through `async_trait`. The file-backed
//! implementation borrows the same crate's `FileBackend` snapshot-to-disk
//! idiom, simplified to a single whole-store JSON file since incident
//! volume here is orders of magnitude below a message stream's.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::errors::{Error, Result};
use crate::event::Status;
use crate::incident::Incident;

/// Storage for incidents, keyed by [`Incident::index_name`].
#[async_trait]
pub trait Index: Send + Sync {
    async fn put(&self, incident: Incident) -> Result<()>;
    async fn get(&self, index_name: &str) -> Result<Option<Incident>>;
    async fn list(&self) -> Result<Vec<Incident>>;
    /// All incidents at or above `status`, keyed by index name -- matches
    /// the admin API's "all active incidents" read.
    async fn list_at_or_above(&self, status: Status) -> Result<HashMap<String, Incident>>;
    async fn delete(&self, index_name: &str) -> Result<Option<Incident>>;
}

/// Volatile store; everything is lost on process restart. The default for
/// tests and for deployments that don't need incident history to survive a
/// restart.
#[derive(Default)]
pub struct InMemoryIndex {
    incidents: DashMap<String, Incident>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Index for InMemoryIndex {
    async fn put(&self, incident: Incident) -> Result<()> {
        self.incidents.insert(incident.index_name.clone(), incident);
        Ok(())
    }

    async fn get(&self, index_name: &str) -> Result<Option<Incident>> {
        Ok(self.incidents.get(index_name).map(|e| e.clone()))
    }

    async fn list(&self) -> Result<Vec<Incident>> {
        Ok(self.incidents.iter().map(|e| e.clone()).collect())
    }

    async fn list_at_or_above(&self, status: Status) -> Result<HashMap<String, Incident>> {
        Ok(self
            .incidents
            .iter()
            .filter(|e| e.status >= status)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect())
    }

    async fn delete(&self, index_name: &str) -> Result<Option<Incident>> {
        Ok(self.incidents.remove(index_name).map(|(_, v)| v))
    }
}

/// Durable store: the whole incident table is kept in memory and mirrored
/// to a single JSON file on every mutation, reloaded at startup.
pub struct FileIndex {
    path: PathBuf,
    incidents: RwLock<HashMap<String, Incident>>,
}

impl FileIndex {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let incidents = match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)
                .map_err(|e| Error::IndexIo(format!("{}: corrupt snapshot: {e}", path.display())))?,
            Ok(_) => HashMap::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(Error::IndexIo(format!("{}: {e}", path.display()))),
        };

        Ok(FileIndex {
            path,
            incidents: RwLock::new(incidents),
        })
    }

    async fn persist(&self, incidents: &HashMap<String, Incident>) -> Result<()> {
        let bytes = serde_json::to_vec(incidents)?;
        let tmp_path = self.path.with_extension("tmp");
        let mut f = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| Error::IndexIo(format!("{}: {e}", tmp_path.display())))?;
        f.write_all(&bytes)
            .await
            .map_err(|e| Error::IndexIo(format!("{}: {e}", tmp_path.display())))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| Error::IndexIo(format!("{}: {e}", self.path.display())))?;
        Ok(())
    }
}

#[async_trait]
impl Index for FileIndex {
    async fn put(&self, incident: Incident) -> Result<()> {
        let mut incidents = self.incidents.write().await;
        incidents.insert(incident.index_name.clone(), incident);
        self.persist(&incidents).await
    }

    async fn get(&self, index_name: &str) -> Result<Option<Incident>> {
        Ok(self.incidents.read().await.get(index_name).cloned())
    }

    async fn list(&self) -> Result<Vec<Incident>> {
        Ok(self.incidents.read().await.values().cloned().collect())
    }

    async fn list_at_or_above(&self, status: Status) -> Result<HashMap<String, Incident>> {
        Ok(self
            .incidents
            .read()
            .await
            .iter()
            .filter(|(_, v)| v.status >= status)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn delete(&self, index_name: &str) -> Result<Option<Incident>> {
        let mut incidents = self.incidents.write().await;
        let removed = incidents.remove(index_name);
        if removed.is_some() {
            self.persist(&incidents).await?;
        }
        Ok(removed)
    }
}

/// Shared handle used throughout the dispatcher and admin API.
pub type SharedIndex = Arc<dyn Index>;
