//! Application configuration: the JSON document a deployment edits, plus a
//! file-watching reloader that feeds the dispatcher a fresh copy whenever
//! it changes on disk.
//!
//! Grounded on `pipeline/pause_test.go`'s JSON-unmarshaled `AppConfig`
//! (`api_port`, `escalations`, `keep_alive_age`, `escalations_dir`) for the
//! document shape, and on the watcher pattern in
//! `iodevs-net-git-gov`'s `monitor.rs` (a `notify::RecommendedWatcher`
//! bridged into an async channel) for the reload mechanism.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::errors::{Error, Result};
use crate::escalation::EscalationConfig;
use crate::policy::PolicyConfig;

/// Environment variable naming the config file to load at startup and
/// watch for changes.
pub const CONFIG_PATH_ENV: &str = "BANGARANG_CONFIG";

/// Default HTTP port for the admin API when `api_port` is unset.
pub const DEFAULT_API_PORT: u16 = 8101;

/// Default age after which a host that's stopped sending keep-alive
/// events is itself treated as a CRITICAL incident.
pub const DEFAULT_KEEP_ALIVE_AGE_SECS: u64 = 60;

/// Debounce window collapsing a burst of filesystem events (editors often
/// write a file in several syscalls) into a single reload.
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(250);

/// The full configuration document.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
    #[serde(default)]
    pub escalations: Vec<EscalationConfig>,
    #[serde(default = "default_keep_alive_age")]
    pub keep_alive_age_secs: u64,
    #[serde(default)]
    pub escalations_dir: Option<PathBuf>,
}

fn default_api_port() -> u16 {
    DEFAULT_API_PORT
}

fn default_keep_alive_age() -> u64 {
    DEFAULT_KEEP_ALIVE_AGE_SECS
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            api_port: DEFAULT_API_PORT,
            policies: Vec::new(),
            escalations: Vec::new(),
            keep_alive_age_secs: DEFAULT_KEEP_ALIVE_AGE_SECS,
            escalations_dir: None,
        }
    }
}

impl AppConfig {
    pub fn keep_alive_age(&self) -> Duration {
        Duration::from_secs(self.keep_alive_age_secs)
    }
}

/// Parse a config document from JSON bytes.
pub fn parse(bytes: &[u8]) -> Result<AppConfig> {
    serde_json::from_slice(bytes).map_err(|e| Error::ConfigInvalid(e.to_string()))
}

/// Load a config document from disk.
pub async fn load(path: &Path) -> Result<AppConfig> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", path.display())))?;
    parse(&bytes)
}

/// Path to load from, taken from `BANGARANG_CONFIG` if set.
pub fn configured_path() -> Option<PathBuf> {
    std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from)
}

/// Watch `path` for changes, sending each successfully parsed reload
/// through the returned channel. A reload that fails to parse is logged
/// and otherwise ignored -- the dispatcher keeps running on its last-good
/// config. The returned watcher must be kept alive for as long as
/// watching should continue.
pub fn watch(path: PathBuf) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<AppConfig>)> {
    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<()>();
    let (config_tx, config_rx) = mpsc::unbounded_channel::<AppConfig>();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if let Ok(event) = res {
            if event.kind.is_modify() || event.kind.is_create() {
                let _ = raw_tx.send(());
            }
        }
    })
    .map_err(|e| Error::Fatal(format!("could not start config watcher: {e}")))?;

    let watch_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    watcher
        .watch(watch_dir, RecursiveMode::NonRecursive)
        .map_err(|e| Error::Fatal(format!("could not watch {}: {e}", watch_dir.display())))?;

    tokio::spawn(async move {
        while raw_rx.recv().await.is_some() {
            tokio::time::sleep(RELOAD_DEBOUNCE).await;
            // Drain any events coalesced during the debounce window.
            while raw_rx.try_recv().is_ok() {}

            match load(&path).await {
                Ok(cfg) => {
                    info!(path = %path.display(), "config reloaded");
                    if config_tx.send(cfg).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(path = %path.display(), "config reload rejected, keeping previous: {e}"),
            }
        }
    });

    Ok((watcher, config_rx))
}
