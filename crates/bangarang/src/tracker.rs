//! Counters and the one-shot incident resolver side-table.
//!
//! Grounded on the `Pipeline.GetTracker()` surface exercised in
//! `pipeline/pipeline_test.go` and on `api/incident.go`'s
//! `tracker.GetIncidentResolver(in)` call during a manual resolve. A
//! resolver is registered per incident index name and consumed exactly
//! once -- by the admin API's delete handler, or discarded wholesale on a
//! config refresh -- rather than kept as a back-pointer on the `Incident`
//! itself, so incidents stay plain, serializable data.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::event::{Event, Status};
use crate::incident::Incident;

/// Aggregate counters surfaced at `GET /api/stats/system`.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct SystemStats {
    pub events_total: u64,
    pub incidents_total: u64,
}

/// Per-status counters surfaced at `GET /api/stats/event`.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct EventStats {
    pub events_total: u64,
    pub critical_total: u64,
    pub warning_total: u64,
    pub ok_total: u64,
    pub keep_alive_total: u64,
}

/// Process-lifetime counters plus the incident resolver side-table. Owned
/// by the dispatcher and shared read-only with the admin API through an
/// `Arc`.
#[derive(Default)]
pub struct Tracker {
    events_total: AtomicU64,
    incidents_total: AtomicU64,
    critical_total: AtomicU64,
    warning_total: AtomicU64,
    ok_total: AtomicU64,
    keep_alive_total: AtomicU64,
    resolvers: DashMap<String, oneshot::Sender<Incident>>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one inbound event. Keep-alive events are counted but never
    /// drive policy evaluation -- that skip happens in the dispatcher.
    pub fn record_event(&self, event: &Event) {
        self.events_total.fetch_add(1, Ordering::Relaxed);
        if event.is_keep_alive() {
            self.keep_alive_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record the verdict a policy's evaluation produced for an event.
    /// Called once per matching policy, after evaluation, since that's the
    /// only point at which the verdict is actually known.
    pub fn record_verdict(&self, status: Status) {
        match status {
            Status::Ok => self.ok_total.fetch_add(1, Ordering::Relaxed),
            Status::Warning => self.warning_total.fetch_add(1, Ordering::Relaxed),
            Status::Critical => self.critical_total.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_incident(&self) {
        self.incidents_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Register interest in an incident's eventual resolution. Overwrites
    /// any previous registration for the same index name -- only the
    /// latest caller's channel is fired.
    pub fn register_resolver(&self, index_name: &str) -> oneshot::Receiver<Incident> {
        let (tx, rx) = oneshot::channel();
        self.resolvers.insert(index_name.to_string(), tx);
        rx
    }

    /// Take (not peek) the resolver registered for `index_name`, if any.
    /// The admin API sends the resolved incident through it before
    /// reprocessing the incident as OK.
    pub fn get_incident_resolver(&self, index_name: &str) -> Option<oneshot::Sender<Incident>> {
        self.resolvers.remove(index_name).map(|(_, tx)| tx)
    }

    /// Drop all pending resolvers. Called on config refresh: the
    /// compiled policies a resolver was registered against no longer
    /// exist, so the registration would never be honored.
    pub fn clear_resolvers(&self) {
        self.resolvers.clear();
    }

    pub fn system_stats(&self) -> SystemStats {
        SystemStats {
            events_total: self.events_total.load(Ordering::Relaxed),
            incidents_total: self.incidents_total.load(Ordering::Relaxed),
        }
    }

    pub fn event_stats(&self) -> EventStats {
        EventStats {
            events_total: self.events_total.load(Ordering::Relaxed),
            critical_total: self.critical_total.load(Ordering::Relaxed),
            warning_total: self.warning_total.load(Ordering::Relaxed),
            ok_total: self.ok_total.load(Ordering::Relaxed),
            keep_alive_total: self.keep_alive_total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TagSet;

    fn event(status: Status) -> Event {
        let mut e = Event::new(1.0, TagSet::new());
        e.status = status;
        e
    }

    #[test]
    fn record_verdict_buckets_by_status() {
        let t = Tracker::new();
        t.record_event(&event(Status::Ok));
        t.record_event(&event(Status::Warning));
        t.record_event(&event(Status::Critical));
        t.record_event(&event(Status::Critical));
        t.record_verdict(Status::Ok);
        t.record_verdict(Status::Warning);
        t.record_verdict(Status::Critical);
        t.record_verdict(Status::Critical);

        let stats = t.event_stats();
        assert_eq!(stats.events_total, 4);
        assert_eq!(stats.ok_total, 1);
        assert_eq!(stats.warning_total, 1);
        assert_eq!(stats.critical_total, 2);
    }

    #[test]
    fn keep_alive_events_count_separately_and_skip_status_buckets() {
        let t = Tracker::new();
        let mut ka = Event::new(1.0, TagSet::new());
        ka.tags.set("service", crate::event::KEEP_ALIVE_SERVICE);
        t.record_event(&ka);

        let stats = t.event_stats();
        assert_eq!(stats.events_total, 1);
        assert_eq!(stats.keep_alive_total, 1);
        assert_eq!(stats.ok_total, 0);
    }

    #[tokio::test]
    async fn resolver_is_consumed_exactly_once() {
        let t = Tracker::new();
        let rx = t.register_resolver("group-1");

        assert!(t.get_incident_resolver("group-1").is_some());
        assert!(t.get_incident_resolver("group-1").is_none());

        drop(rx);
    }

    #[test]
    fn clear_resolvers_drops_all_pending() {
        let t = Tracker::new();
        t.register_resolver("a");
        t.register_resolver("b");
        t.clear_resolvers();
        assert!(t.get_incident_resolver("a").is_none());
        assert!(t.get_incident_resolver("b").is_none());
    }
}
