//! Prometheus counters for the dispatcher, registered defensively so that
//! constructing more than one `Metrics` in a process (every integration
//! test does this) never panics.
//!
//! Grounded on `bangarang-streaming`'s `metrics_utils.rs`: the upstream
//! `register_*!` macros panic on a duplicate name, so look the metric up
//! in a process-wide table first and reuse it, logging instead of
//! panicking if registration still fails for some other reason.

use std::sync::LazyLock;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use prometheus::{Counter, Opts};
use tracing::{debug, warn};

#[derive(Clone)]
struct CounterEntry {
    help: String,
    metric: Counter,
}

static COUNTERS: LazyLock<DashMap<String, CounterEntry>> = LazyLock::new(DashMap::new);

fn safe_counter(name: &str, help: &str) -> Counter {
    match COUNTERS.entry(name.to_string()) {
        Entry::Occupied(entry) => entry.get().metric.clone(),
        Entry::Vacant(entry) => {
            let opts = Opts::new(name, help);
            let metric = Counter::with_opts(opts).unwrap_or_else(|e| {
                warn!(metric = name, error = %e, "failed to create counter");
                Counter::new(format!("{name}_invalid"), help)
                    .unwrap_or_else(|_| Counter::new("bangarang_invalid_metric", "invalid").unwrap())
            });

            if let Err(e) = prometheus::default_registry().register(Box::new(metric.clone())) {
                match e {
                    prometheus::Error::AlreadyReg => {
                        debug!(metric = name, "counter already registered; continuing");
                    }
                    other => warn!(metric = name, error = %other, "counter registration failed"),
                }
            }

            entry.insert(CounterEntry {
                help: help.to_string(),
                metric: metric.clone(),
            });
            metric
        }
    }
}

/// Dispatcher-wide counters. Cheap to clone -- every field is a handle
/// into the process-wide Prometheus registry.
#[derive(Clone)]
pub struct Metrics {
    pub events_total: Counter,
    pub incidents_total: Counter,
    pub escalations_total: Counter,
    pub escalation_failures_total: Counter,
    pub config_reloads_total: Counter,
    pub config_reload_failures_total: Counter,
    pub tracker_evictions_total: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            events_total: safe_counter(
                "bangarang_events_total",
                "Total events processed by the dispatcher",
            ),
            incidents_total: safe_counter(
                "bangarang_incidents_total",
                "Total incidents created or updated",
            ),
            escalations_total: safe_counter(
                "bangarang_escalations_total",
                "Total escalations fired",
            ),
            escalation_failures_total: safe_counter(
                "bangarang_escalation_failures_total",
                "Total escalation destination send failures",
            ),
            config_reloads_total: safe_counter(
                "bangarang_config_reloads_total",
                "Total successful config hot-reloads",
            ),
            config_reload_failures_total: safe_counter(
                "bangarang_config_reload_failures_total",
                "Total rejected config hot-reloads",
            ),
            tracker_evictions_total: safe_counter(
                "bangarang_tracker_evictions_total",
                "Total condition trackers evicted for exceeding max_groups_per_condition",
            ),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructing_twice_does_not_panic() {
        let a = Metrics::new();
        let b = Metrics::new();
        a.events_total.inc();
        b.events_total.inc();
        assert_eq!(a.events_total.get(), b.events_total.get());
    }
}
