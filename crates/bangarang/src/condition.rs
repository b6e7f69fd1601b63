//! One threshold/statistical rule plus its per-group tracking state.
//!
//! Grounded on `alarm/condition.go`: a condition compiles a closed list of
//! predicate checks once, then for every event looks up (or creates) the
//! `EventTracker` for that event's group, updates the tracker's sliding
//! window, evaluates the predicates, and folds the result through an
//! occurrence counter before recording a 0/1 verdict on a short state
//! history ring.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::warn;

use crate::dataframe::DataFrame;
use crate::event::Event;

/// Size of the `states` ring every tracker keeps (last 10 OK/NOT-OK verdicts).
const STATUS_SIZE: usize = 10;

/// Default window size when a condition configures one below the minimum.
const DEFAULT_WINDOW_SIZE: usize = 2;

/// Default bound on distinct groups a single condition will track before
/// evicting the least-recently-observed one. Surfaced as
/// `max_groups_per_condition` in policy configuration.
const DEFAULT_MAX_GROUPS_PER_CONDITION: usize = 10_000;

/// Aggregation-bucket configuration: accumulate events into one rolling
/// bucket for `window_length`, evaluating only at the boundary.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct Aggregation {
    pub window_length: Duration,
}

/// One compiled predicate. Exactly one shape is active per condition.
#[derive(Debug, Clone)]
enum Check {
    Greater(f64),
    Less(f64),
    Exactly(f64),
    StdDev { sigma: f64 },
    DerivativeGreater(f64),
    DerivativeLess(f64),
    DerivativeExactly(f64),
}

struct AggState {
    next_closeout: Instant,
}

/// Per-group state a condition maintains across events in that group.
struct EventTracker {
    df: DataFrame,
    states: DataFrame,
    count: usize,
    occurrences: usize,
    agg: Option<AggState>,
    last_observed: Instant,
}

impl EventTracker {
    fn new(window_size: usize, aggregation: bool) -> Self {
        EventTracker {
            df: DataFrame::new(window_size),
            states: DataFrame::new(STATUS_SIZE),
            count: 0,
            occurrences: 0,
            agg: if aggregation {
                Some(AggState {
                    next_closeout: Instant::now(),
                })
            } else {
                None
            },
            last_observed: Instant::now(),
        }
    }
}

/// The declarative, serializable shape of a condition -- what a policy
/// document carries on disk.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ConditionConfig {
    pub greater: Option<f64>,
    pub less: Option<f64>,
    pub exactly: Option<f64>,
    #[serde(default)]
    pub simple: bool,
    #[serde(default)]
    pub std_dev: bool,
    #[serde(default)]
    pub derivative: bool,
    #[serde(default)]
    pub holt_winters: bool,
    pub escalation: String,
    pub occurrences: usize,
    pub window_size: usize,
    pub aggregation: Option<Aggregation>,
    #[serde(default)]
    pub max_groups: Option<usize>,
}

/// A compiled, runnable condition. Construct from a [`ConditionConfig`] via
/// [`Condition::compile`].
pub struct Condition {
    pub escalation: String,
    occurrences_required: usize,
    window_size: usize,
    aggregation: Option<Aggregation>,
    checks: Vec<Check>,
    trackers: LruCache<String, EventTracker>,
}

impl Condition {
    /// Compile a declarative condition: normalize `occurrences`/`window_size`,
    /// pick the one active check shape, and size the bounded tracker cache.
    pub fn compile(cfg: &ConditionConfig) -> Condition {
        let mut occurrences = cfg.occurrences;
        if occurrences < 1 {
            warn!(
                given = cfg.occurrences,
                "occurrences must be >= 1; clamping to 1"
            );
            occurrences = 1;
        }

        let mut window_size = cfg.window_size;
        if window_size < 2 {
            warn!(
                given = cfg.window_size,
                default = DEFAULT_WINDOW_SIZE,
                "window_size must be >= 2; using default"
            );
            window_size = DEFAULT_WINDOW_SIZE;
        }

        let max_groups = cfg
            .max_groups
            .unwrap_or(DEFAULT_MAX_GROUPS_PER_CONDITION)
            .max(1);

        Condition {
            escalation: cfg.escalation.clone(),
            occurrences_required: occurrences,
            window_size,
            aggregation: cfg.aggregation,
            checks: compile_checks(cfg),
            trackers: LruCache::new(NonZeroUsize::new(max_groups).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    fn ensure_tracker(&mut self, key: &str) {
        if self.trackers.contains(key) {
            return;
        }
        if self.trackers.len() >= self.trackers.cap().get() {
            if let Some((evicted_key, _)) = self.trackers.pop_lru() {
                warn!(
                    group = %evicted_key,
                    "evicting least-recently-observed condition tracker at capacity"
                );
            }
        }
        self.trackers.put(
            key.to_string(),
            EventTracker::new(self.window_size, self.aggregation.is_some()),
        );
    }

    /// Track one event for its group, returning whether the occurrence
    /// threshold has now been hit (`true`) or not.
    pub fn track_event(&mut self, event: &Event) -> bool {
        let key = event.index_name();
        self.ensure_tracker(&key);

        let satisfied = if let Some(agg) = self.aggregation {
            self.track_aggregated(&key, event.metric, agg)
        } else {
            self.track_simple(&key, event.metric)
        };

        self.occurrences_hit(&key, satisfied)
    }

    fn track_simple(&mut self, key: &str, metric: f64) -> bool {
        let checks = &self.checks;
        let window_size = self.window_size;
        let satisfied = {
            let t = self.trackers.peek(key).expect("tracker just ensured");
            checks
                .iter()
                .any(|c| evaluate_check(c, metric, t, window_size))
        };

        let t = self.trackers.get_mut(key).expect("tracker just ensured");
        t.df.push(metric);
        t.count += 1;
        t.last_observed = Instant::now();
        satisfied
    }

    /// Accumulate into the current bucket; only at a closeout boundary does
    /// the just-closed bucket's value get checked against the predicates.
    fn track_aggregated(&mut self, key: &str, metric: f64, agg: Aggregation) -> bool {
        let now = Instant::now();
        let t = self.trackers.get_mut(key).expect("tracker just ensured");
        let agg_state = t.agg.as_ref().expect("aggregation tracker has agg state");

        if now < agg_state.next_closeout {
            let bucket = t.df.index(0) + metric;
            // In-place update of the current bucket -- unlike `push`, this
            // does not shift the rest of the window.
            t.df.set(0, bucket);
            t.last_observed = now;
            return false;
        }

        // Closeout: the previous bucket's value is what gets judged.
        let closed_bucket = t.df.index(0);
        t.df.push(metric);
        t.agg = Some(AggState {
            next_closeout: now + agg.window_length,
        });
        t.last_observed = now;

        let checks = &self.checks;
        let window_size = self.window_size;
        let t = self.trackers.peek(key).expect("tracker just ensured");
        checks
            .iter()
            .any(|c| evaluate_check(c, closed_bucket, t, window_size))
    }

    fn occurrences_hit(&mut self, key: &str, satisfied: bool) -> bool {
        let t = self.trackers.get_mut(key).expect("tracker just ensured");
        if satisfied {
            t.occurrences += 1;
        } else {
            t.occurrences = 0;
        }

        let hit = t.occurrences >= self.occurrences_required;
        t.states.push(if hit { 1.0 } else { 0.0 });
        hit
    }

    /// True exactly on the edge between satisfied and not-satisfied for
    /// this event's group.
    pub fn state_changed(&mut self, event: &Event) -> bool {
        let key = event.index_name();
        self.ensure_tracker(&key);
        let t = self.trackers.peek(&key).expect("tracker just ensured");

        if t.count == 0 && t.states.index(0) != 0.0 {
            return true;
        }
        t.states.index(0) != t.states.index(1)
    }
}

fn evaluate_check(check: &Check, metric: f64, tracker: &EventTracker, window_size: usize) -> bool {
    match check {
        Check::Greater(v) => metric > *v,
        Check::Less(v) => metric < *v,
        #[allow(clippy::float_cmp)]
        Check::Exactly(v) => metric == *v,
        Check::StdDev { sigma } => {
            if tracker.count <= tracker.df.len() / 4 {
                return false;
            }
            if tracker.count >= tracker.df.len() {
                (metric - tracker.df.avg()).abs() > sigma * tracker.df.std_dev()
            } else {
                let sub = tracker.df.slice(tracker.df.len() - tracker.count, tracker.df.len() - 1);
                (metric - sub.avg()).abs() > sigma * tracker.df.std_dev()
            }
        }
        Check::DerivativeGreater(v) => {
            tracker.count >= window_size && metric - tracker.df.index(0) > *v
        }
        Check::DerivativeLess(v) => {
            tracker.count >= window_size && metric - tracker.df.index(0) < *v
        }
        #[allow(clippy::float_cmp)]
        Check::DerivativeExactly(v) => {
            tracker.count >= window_size && metric - tracker.df.index(0) == *v
        }
    }
}

fn is_simple(cfg: &ConditionConfig) -> bool {
    cfg.simple || !(cfg.std_dev || cfg.holt_winters || cfg.derivative)
}

fn compile_checks(cfg: &ConditionConfig) -> Vec<Check> {
    if !is_simple(cfg) {
        if cfg.std_dev {
            let sigma = cfg.greater.unwrap_or(5.0);
            return vec![Check::StdDev { sigma }];
        }
        if cfg.derivative {
            if let Some(v) = cfg.greater {
                return vec![Check::DerivativeGreater(v)];
            }
            if let Some(v) = cfg.less {
                return vec![Check::DerivativeLess(v)];
            }
            if let Some(v) = cfg.exactly {
                return vec![Check::DerivativeExactly(v)];
            }
            warn!("derivative condition requires one of greater/less/exactly; no check compiled");
            return vec![];
        }
        // holt_winters: reserved, validated but never evaluated.
        return vec![];
    }

    let mut checks = Vec::new();
    if let Some(v) = cfg.greater {
        checks.push(Check::Greater(v));
    }
    if let Some(v) = cfg.less {
        checks.push(Check::Less(v));
    }
    if let Some(v) = cfg.exactly {
        checks.push(Check::Exactly(v));
    }
    checks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TagSet;

    fn event_for(host: &str, metric: f64) -> Event {
        let mut tags = TagSet::new();
        tags.set("host", host);
        tags.set("service", "cpu");
        Event::new(metric, tags)
    }

    fn simple_crit(greater: f64, occurrences: usize) -> Condition {
        Condition::compile(&ConditionConfig {
            greater: Some(greater),
            escalation: "page".into(),
            occurrences,
            window_size: 2,
            ..Default::default()
        })
    }

    #[test]
    fn occurrence_threshold_requires_consecutive_hits() {
        let mut c = simple_crit(90.0, 3);
        let e = event_for("h1", 95.0);

        assert!(!c.track_event(&e)); // 1
        assert!(!c.track_event(&e)); // 2
        assert!(c.track_event(&e)); // 3 -> hit
    }

    #[test]
    fn a_single_miss_resets_the_counter() {
        let mut c = simple_crit(90.0, 3);
        let hit = event_for("h1", 95.0);
        let miss = event_for("h1", 10.0);

        assert!(!c.track_event(&hit));
        assert!(!c.track_event(&hit));
        assert!(!c.track_event(&miss));
        assert!(!c.track_event(&hit));
        assert!(!c.track_event(&hit));
        assert!(c.track_event(&hit));
    }

    #[test]
    fn groups_are_tracked_independently() {
        let mut c = simple_crit(90.0, 3);
        let a = event_for("a", 95.0);
        let b = event_for("b", 95.0);

        assert!(!c.track_event(&a));
        assert!(!c.track_event(&b));
        assert!(!c.track_event(&a));
        assert!(!c.track_event(&b));
        assert!(c.track_event(&a));
        assert!(c.track_event(&b));
    }

    #[test]
    fn state_changed_fires_only_on_the_edge() {
        let mut c = simple_crit(90.0, 1);
        let hit = event_for("h1", 95.0);
        let miss = event_for("h1", 10.0);

        assert!(c.track_event(&hit));
        assert!(c.state_changed(&hit)); // OK -> CRIT edge

        assert!(c.track_event(&hit));
        assert!(!c.state_changed(&hit)); // still CRIT, no edge

        assert!(!c.track_event(&miss));
        assert!(c.state_changed(&miss)); // CRIT -> OK edge
    }

    #[test]
    fn derivative_fires_once_window_is_full() {
        let mut c = Condition::compile(&ConditionConfig {
            derivative: true,
            greater: Some(5.0),
            escalation: "page".into(),
            occurrences: 1,
            window_size: 4,
            ..Default::default()
        });

        for _ in 0..4 {
            assert!(!c.track_event(&event_for("h1", 10.0)));
        }
        assert!(c.track_event(&event_for("h1", 20.0)));
    }

    #[test]
    fn derivative_does_not_fire_while_window_is_partially_full() {
        let mut c = Condition::compile(&ConditionConfig {
            derivative: true,
            greater: Some(5.0),
            escalation: "page".into(),
            occurrences: 1,
            window_size: 4,
            ..Default::default()
        });

        assert!(!c.track_event(&event_for("h1", 10.0)));
        assert!(!c.track_event(&event_for("h1", 11.0)));
    }

    #[test]
    fn std_dev_fires_on_an_outlier() {
        let mut c = Condition::compile(&ConditionConfig {
            std_dev: true,
            greater: Some(3.0),
            escalation: "page".into(),
            occurrences: 1,
            window_size: 20,
            ..Default::default()
        });

        // 20 tame samples hovering around 10.
        let samples = [
            9.0, 10.0, 11.0, 10.0, 9.0, 10.0, 11.0, 10.0, 9.0, 10.0, 11.0, 10.0, 9.0, 10.0, 11.0,
            10.0, 9.0, 10.0, 11.0, 10.0,
        ];
        for &s in &samples {
            assert!(!c.track_event(&event_for("h1", s)));
        }

        assert!(c.track_event(&event_for("h1", 100.0)));
    }

    #[test]
    fn aggregation_bucket_only_evaluates_at_closeout() {
        let mut c = Condition::compile(&ConditionConfig {
            greater: Some(100.0),
            escalation: "page".into(),
            occurrences: 1,
            window_size: 2,
            aggregation: Some(Aggregation {
                window_length: Duration::from_secs(3600),
            }),
            ..Default::default()
        });

        // First event opens the bucket (nextCloseout starts at "now").
        assert!(!c.track_event(&event_for("h1", 40.0)));
        // Still within the window: no evaluation happens mid-bucket.
        assert!(!c.track_event(&event_for("h1", 40.0)));
        assert!(!c.track_event(&event_for("h1", 40.0)));
    }

    #[test]
    fn max_groups_evicts_least_recently_observed() {
        let mut c = Condition::compile(&ConditionConfig {
            greater: Some(90.0),
            escalation: "page".into(),
            occurrences: 1,
            window_size: 2,
            max_groups: Some(2),
            ..Default::default()
        });

        c.track_event(&event_for("a", 1.0));
        c.track_event(&event_for("b", 1.0));
        c.track_event(&event_for("c", 1.0));

        assert_eq!(c.trackers.len(), 2);
        assert!(!c.trackers.contains("a"));
    }
}
