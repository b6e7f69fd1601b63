//! An incident: one policy's verdict on one group of events, identified by
//! a stable digest of the policy name and the event's tag set.
//!
//! Grounded on `pipeline/pipeline_test.go`'s `NewIncident(policy, status,
//! event)` constructor and `api/incident.go`'s read/resolve surface. The
//! original keys incidents by an MD5 digest; this port uses SHA-256 via the
//! `sha2` crate already in the dependency stack -- both are
//! non-cryptographic uses (a deduplication key, not a security boundary),
//! so the substitution changes nothing observable beyond the hash's width.

use sha2::{Digest, Sha256};

use crate::event::{Event, Status};

/// One tracked incident.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Incident {
    /// Hex SHA-256 digest of `policy || tags.canonical_string()`. Stable
    /// for the same policy and tag set, so repeat events on the same group
    /// update the same incident rather than creating new ones.
    pub index_name: String,
    pub policy: String,
    pub status: Status,
    pub description: String,
    pub event: Event,
    pub created: i64,
    pub updated: i64,
}

impl Incident {
    /// Build a new incident from a policy's verdict on one event.
    pub fn new(policy: &str, status: Status, event: Event) -> Incident {
        let index_name = index_name_for(policy, &event);
        let description = describe(policy, status, &event);
        let now = event.time;
        Incident {
            index_name,
            policy: policy.to_string(),
            status,
            description,
            event,
            created: now,
            updated: now,
        }
    }

    /// Refresh this incident in place with a new verdict for the same
    /// group, bumping `updated` and re-deriving the description.
    pub fn update(&mut self, status: Status, event: Event) {
        self.status = status;
        self.description = describe(&self.policy, status, &event);
        self.updated = event.time;
        self.event = event;
    }
}

/// Digest used both as the incident's storage key and as its externally
/// visible id.
pub fn index_name_for(policy: &str, event: &Event) -> String {
    let mut hasher = Sha256::new();
    hasher.update(policy.as_bytes());
    hasher.update(event.tags.canonical_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn describe(policy: &str, status: Status, event: &Event) -> String {
    format!(
        "{policy}: {status} on {host} ({service}) metric={metric}",
        host = event.host(),
        service = event.service(),
        metric = event.metric,
    )
}
