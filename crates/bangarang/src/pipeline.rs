//! The dispatcher: a single task that owns every policy's mutable tracking
//! state and drains one channel of work at a time.
//!
//! Grounded on the `Pipeline` struct exercised by `pipeline/pipeline_test.go`
//! (`escalations`, `policies`, `index`, `config`, `pauseChan`, `unpauseChan`,
//! `in`, `incidentInput` fields; `PassEvent`, `Pause`/`Unpause`,
//! `UpdateConfig`, `ViewConfig`, `GetTracker`, `Refresh`, `PutIncident`,
//! `ListIncidents`, `Dedupe` methods) and `pipeline/pause_test.go`'s
//! `Pass`/`Process` naming. Only this task ever mutates a `Condition`'s
//! tracker map; every other caller reaches it through channels, so no
//! lock is needed around policy evaluation itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::errors::{Error, Result};
use crate::escalation::Escalation;
use crate::event::Event;
use crate::incident::Incident;
use crate::index::SharedIndex;
use crate::metrics::Metrics;
use crate::policy::Policy;
use crate::tracker::Tracker;

const CHANNEL_CAPACITY: usize = 1024;

/// How often the dispatcher scans for hosts that have gone silent.
const KEEP_ALIVE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Handle to a running dispatcher. Cheap to clone; every clone shares the
/// same underlying task.
#[derive(Clone)]
pub struct Pipeline {
    events_tx: mpsc::Sender<Event>,
    incidents_tx: mpsc::Sender<Incident>,
    pause_tx: mpsc::Sender<()>,
    unpause_tx: mpsc::Sender<()>,
    refresh_tx: mpsc::Sender<AppConfig>,
    config: Arc<RwLock<AppConfig>>,
    tracker: Arc<Tracker>,
    index: SharedIndex,
}

impl Pipeline {
    /// Compile `config` and spawn the dispatcher task. Returns the handle
    /// plus the task's `JoinHandle` so callers can await shutdown.
    pub fn spawn(config: AppConfig, index: SharedIndex) -> Result<(Pipeline, tokio::task::JoinHandle<()>)> {
        let compiled = Compiled::from_config(&config)?;

        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (incidents_tx, incidents_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (pause_tx, pause_rx) = mpsc::channel(1);
        let (unpause_tx, unpause_rx) = mpsc::channel(1);
        let (refresh_tx, refresh_rx) = mpsc::channel(8);

        let tracker = Arc::new(Tracker::new());
        let shared_config = Arc::new(RwLock::new(config));

        let dispatcher = Dispatcher {
            compiled,
            paused: false,
            keep_alive_age: shared_config.read().keep_alive_age(),
            last_keep_alive: HashMap::new(),
            keep_alive_alerted: std::collections::HashSet::new(),
            index: index.clone(),
            tracker: tracker.clone(),
            metrics: Metrics::new(),
            events_rx,
            incidents_rx,
            pause_rx,
            unpause_rx,
            refresh_rx,
        };

        let handle = tokio::spawn(dispatcher.run());

        Ok((
            Pipeline {
                events_tx,
                incidents_tx,
                pause_tx,
                unpause_tx,
                refresh_tx,
                config: shared_config,
                tracker,
                index,
            },
            handle,
        ))
    }

    pub async fn pass_event(&self, event: Event) -> Result<()> {
        self.events_tx
            .send(event)
            .await
            .map_err(|_| Error::Fatal("dispatcher task is gone".into()))
    }

    /// Resubmit an incident directly, bypassing policy evaluation. Used by
    /// the admin API's manual-resolve path: the caller has already set the
    /// incident's status to OK and cleared its description.
    pub async fn process_incident(&self, incident: Incident) -> Result<()> {
        self.incidents_tx
            .send(incident)
            .await
            .map_err(|_| Error::Fatal("dispatcher task is gone".into()))
    }

    pub async fn pause(&self) -> Result<()> {
        self.pause_tx
            .send(())
            .await
            .map_err(|_| Error::Fatal("dispatcher task is gone".into()))
    }

    pub async fn unpause(&self) -> Result<()> {
        self.unpause_tx
            .send(())
            .await
            .map_err(|_| Error::Fatal("dispatcher task is gone".into()))
    }

    /// A read-only snapshot of the raw configuration document.
    pub fn view_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Apply `mutator` to a copy of the current configuration, validate it
    /// by compiling, and -- if it compiles -- publish it to the dispatcher.
    /// Returns the rejected config's error without touching the live one
    /// if compilation fails.
    pub async fn update_config(&self, mutator: impl FnOnce(&mut AppConfig)) -> Result<()> {
        let mut candidate = self.config.read().clone();
        mutator(&mut candidate);
        self.refresh(candidate).await
    }

    /// Replace the live configuration outright, subject to the same
    /// compile-validation as [`Pipeline::update_config`].
    pub async fn refresh(&self, new_config: AppConfig) -> Result<()> {
        Compiled::from_config(&new_config)?;
        *self.config.write() = new_config.clone();
        self.refresh_tx
            .send(new_config)
            .await
            .map_err(|_| Error::Fatal("dispatcher task is gone".into()))
    }

    pub fn tracker(&self) -> Arc<Tracker> {
        self.tracker.clone()
    }

    /// Currently active (non-OK) incidents.
    pub async fn list_incidents(&self) -> Result<Vec<Incident>> {
        Ok(self
            .index
            .list_at_or_above(crate::event::Status::Warning)
            .await?
            .into_values()
            .collect())
    }

    /// All incidents at or above `status`, keyed by index name -- backs
    /// the admin API's `GET /api/incident/*` listing.
    pub async fn list_incidents_at_or_above(
        &self,
        status: crate::event::Status,
    ) -> Result<HashMap<String, Incident>> {
        self.index.list_at_or_above(status).await
    }

    /// Fetch one incident by index name -- backs `GET /api/incident/{id}`.
    pub async fn get_incident(&self, index_name: &str) -> Result<Option<Incident>> {
        self.index.get(index_name).await
    }

    /// Take the resolver registered for `index_name`, if any, notifying
    /// the condition that originated it that this incident is resolved.
    pub fn take_incident_resolver(&self, index_name: &str) -> Option<tokio::sync::oneshot::Sender<Incident>> {
        self.tracker.get_incident_resolver(index_name)
    }
}

/// Compiled policies and escalations, recompiled wholesale on every
/// refresh rather than patched incrementally -- a config reload is rare
/// enough that simplicity wins over incremental diffing.
struct Compiled {
    /// Sorted by name for deterministic dispatch order; the original
    /// iterates a hash-randomized map, which this intentionally corrects.
    policies: Vec<Policy>,
    escalations: HashMap<String, Escalation>,
}

impl Compiled {
    fn from_config(config: &AppConfig) -> Result<Compiled> {
        let mut policies = config
            .policies
            .iter()
            .map(Policy::compile)
            .collect::<Result<Vec<_>>>()?;
        policies.sort_by(|a, b| a.name.cmp(&b.name));

        let escalations = config
            .escalations
            .iter()
            .map(|cfg| (cfg.name.clone(), Escalation::compile(cfg)))
            .collect();

        Ok(Compiled {
            policies,
            escalations,
        })
    }
}

/// Name under which a host's missed-keep-alive incident is filed. Doesn't
/// correspond to a configured policy; it's synthesized by the dispatcher
/// itself.
const KEEP_ALIVE_POLICY: &str = "keep_alive";

struct Dispatcher {
    compiled: Compiled,
    paused: bool,
    keep_alive_age: Duration,
    last_keep_alive: HashMap<String, std::time::Instant>,
    keep_alive_alerted: std::collections::HashSet<String>,
    index: SharedIndex,
    tracker: Arc<Tracker>,
    metrics: Metrics,
    events_rx: mpsc::Receiver<Event>,
    incidents_rx: mpsc::Receiver<Incident>,
    pause_rx: mpsc::Receiver<()>,
    unpause_rx: mpsc::Receiver<()>,
    refresh_rx: mpsc::Receiver<AppConfig>,
}

impl Dispatcher {
    async fn run(mut self) {
        let mut keep_alive_check = tokio::time::interval(KEEP_ALIVE_CHECK_INTERVAL);
        keep_alive_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // The events channel is the authoritative lifetime signal:
                // every `Pipeline` clone shares one sender, so it closing
                // means the last handle was dropped.
                maybe_event = self.events_rx.recv() => {
                    match maybe_event {
                        Some(event) if !self.paused => self.process_event(event).await,
                        Some(_) => {}
                        None => break,
                    }
                }
                Some(incident) = self.incidents_rx.recv() => {
                    self.put_incident(incident).await;
                }
                Some(()) = self.pause_rx.recv() => {
                    self.paused = true;
                    info!("dispatcher paused");
                }
                Some(()) = self.unpause_rx.recv() => {
                    self.paused = false;
                    info!("dispatcher unpaused");
                }
                Some(new_config) = self.refresh_rx.recv() => {
                    self.apply_refresh(new_config);
                }
                _ = keep_alive_check.tick() => {
                    if !self.paused {
                        self.check_keep_alives().await;
                    }
                }
            }
        }
    }

    /// Hosts that have stopped sending `KeepAlive` events for longer than
    /// `keep_alive_age` are themselves filed as CRITICAL incidents, exactly
    /// once per silence (re-armed only once the host is heard from again).
    async fn check_keep_alives(&mut self) {
        let now = std::time::Instant::now();
        let overdue: Vec<String> = self
            .last_keep_alive
            .iter()
            .filter(|(host, last_seen)| {
                now.duration_since(**last_seen) > self.keep_alive_age
                    && !self.keep_alive_alerted.contains(host.as_str())
            })
            .map(|(host, _)| host.clone())
            .collect();

        for host in overdue {
            let mut tags = crate::event::TagSet::new();
            tags.set("host", &host);
            tags.set("service", crate::event::KEEP_ALIVE_SERVICE);
            let event = Event::new(0.0, tags);

            let incident = Incident::new(KEEP_ALIVE_POLICY, crate::event::Status::Critical, event);
            if let Err(e) = self.index.put(incident.clone()).await {
                warn!("failed to persist keep-alive incident: {e}");
            }
            self.tracker.record_incident();
            self.tracker.register_resolver(&incident.index_name);
            self.metrics.incidents_total.inc();
            self.keep_alive_alerted.insert(host);
        }
    }

    fn apply_refresh(&mut self, new_config: AppConfig) {
        match Compiled::from_config(&new_config) {
            Ok(compiled) => {
                self.compiled = compiled;
                self.keep_alive_age = new_config.keep_alive_age();
                self.tracker.clear_resolvers();
                self.metrics.config_reloads_total.inc();
                info!("dispatcher applied a refreshed configuration");
            }
            Err(e) => {
                self.metrics.config_reload_failures_total.inc();
                warn!("rejected refreshed configuration, keeping previous: {e}");
            }
        }
    }

    async fn process_event(&mut self, mut event: Event) {
        self.tracker.record_event(&event);
        self.metrics.events_total.inc();

        if event.is_keep_alive() {
            let host = event.host().to_string();
            if self.keep_alive_alerted.remove(&host) {
                info!(%host, "keep-alive resumed, incident considered stale");
            }
            self.last_keep_alive.insert(host, std::time::Instant::now());
            return;
        }

        for policy in &mut self.compiled.policies {
            if !policy.matches(&event) {
                continue;
            }

            let escalation_name = policy.evaluate(&mut event);
            self.tracker.record_verdict(event.status);

            let Some(name) = escalation_name else {
                continue;
            };

            let incident = Incident::new(&policy.name, event.status, event.clone());

            if self.dedupe(&incident).await {
                continue;
            }

            if let Err(e) = self.index.put(incident.clone()).await {
                warn!("failed to persist incident: {e}");
            }
            self.tracker.record_incident();
            self.metrics.incidents_total.inc();

            if incident.status != crate::event::Status::Ok {
                self.tracker.register_resolver(&incident.index_name);
            }

            if let Some(escalation) = self.compiled.escalations.get(&name) {
                escalation.escalate(&incident).await;
                self.metrics.escalations_total.inc();
            } else {
                warn!(escalation = %name, policy = %policy.name, "policy references unknown escalation");
                self.metrics.escalation_failures_total.inc();
            }
        }
    }

    /// Resubmit an incident the admin API has already decided the final
    /// shape of (e.g. a manual resolve), storing it without re-running
    /// policy evaluation.
    async fn put_incident(&mut self, incident: Incident) {
        if let Err(e) = self.index.put(incident).await {
            warn!("failed to persist resubmitted incident: {e}");
            return;
        }
        self.tracker.record_incident();
        self.metrics.incidents_total.inc();
    }

    /// `true` if an identical incident (same index name and status) is
    /// already stored, so this one would be a no-op write.
    async fn dedupe(&self, incident: &Incident) -> bool {
        match self.index.get(&incident.index_name).await {
            Ok(Some(existing)) => existing.status == incident.status,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TagSet;
    use crate::index::InMemoryIndex;
    use crate::policy::PolicyConfig;
    use crate::condition::ConditionConfig;

    fn event_with(host: &str, service: &str, metric: f64) -> Event {
        let mut tags = TagSet::new();
        tags.set("host", host);
        tags.set("service", service);
        Event::new(metric, tags)
    }

    fn crit_policy(name: &str) -> PolicyConfig {
        PolicyConfig {
            name: name.to_string(),
            crit: Some(ConditionConfig {
                greater: Some(90.0),
                escalation: "page".into(),
                occurrences: 1,
                window_size: 2,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn an_event_crossing_threshold_creates_an_incident() {
        let config = AppConfig {
            policies: vec![crit_policy("cpu")],
            ..Default::default()
        };
        let index: SharedIndex = Arc::new(InMemoryIndex::new());
        let (pipeline, _handle) = Pipeline::spawn(config, index).unwrap();

        pipeline.pass_event(event_with("h1", "cpu", 95.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let incidents = pipeline.list_incidents().await.unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].status, crate::event::Status::Critical);
    }

    #[tokio::test]
    async fn a_non_escalating_event_never_creates_an_incident() {
        let config = AppConfig {
            policies: vec![crit_policy("cpu")],
            ..Default::default()
        };
        let index: SharedIndex = Arc::new(InMemoryIndex::new());
        let (pipeline, _handle) = Pipeline::spawn(config, index).unwrap();

        // First event on a fresh group is below the threshold -- matches
        // the policy but never escalates, so it must not produce an OK
        // incident or bump the incident counters.
        pipeline.pass_event(event_with("h1", "cpu", 1.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(pipeline.list_incidents().await.unwrap().is_empty());
        assert_eq!(pipeline.tracker().event_stats().incidents_total, 0);
    }

    #[tokio::test]
    async fn recovering_from_critical_resolves_the_incident() {
        let config = AppConfig {
            policies: vec![crit_policy("cpu")],
            ..Default::default()
        };
        let index: SharedIndex = Arc::new(InMemoryIndex::new());
        let (pipeline, _handle) = Pipeline::spawn(config, index).unwrap();

        pipeline.pass_event(event_with("h1", "cpu", 95.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            pipeline.list_incidents().await.unwrap()[0].status,
            crate::event::Status::Critical
        );

        pipeline.pass_event(event_with("h1", "cpu", 1.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The recovery is itself an escalation (the resolution), so it's
        // stored too, just with status Ok -- `list_incidents` only
        // surfaces active (non-OK) incidents, so it drops out here.
        assert!(pipeline.list_incidents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pausing_drops_incoming_events() {
        let config = AppConfig {
            policies: vec![crit_policy("cpu")],
            ..Default::default()
        };
        let index: SharedIndex = Arc::new(InMemoryIndex::new());
        let (pipeline, _handle) = Pipeline::spawn(config, index).unwrap();

        pipeline.pause().await.unwrap();
        pipeline.pass_event(event_with("h1", "cpu", 95.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(pipeline.list_incidents().await.unwrap().is_empty());

        pipeline.unpause().await.unwrap();
        pipeline.pass_event(event_with("h1", "cpu", 95.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pipeline.list_incidents().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refresh_with_bad_regex_is_rejected_and_previous_config_survives() {
        let config = AppConfig {
            policies: vec![crit_policy("cpu")],
            ..Default::default()
        };
        let index: SharedIndex = Arc::new(InMemoryIndex::new());
        let (pipeline, _handle) = Pipeline::spawn(config, index).unwrap();

        let mut bad = pipeline.view_config();
        bad.policies.push(PolicyConfig {
            name: "broken".into(),
            match_tags: std::collections::HashMap::from([("host".to_string(), "(".to_string())]),
            ..Default::default()
        });

        let err = pipeline.refresh(bad).await.unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid(_)));
        assert_eq!(pipeline.view_config().policies.len(), 1);
    }
}
