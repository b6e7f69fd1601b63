//! Alerting engine core: event ingestion, policy evaluation, incident
//! tracking, and the dispatcher that ties them together.

/// Application configuration and the file-watching hot-reloader.
pub mod config;
/// Threshold/statistical/derivative rule evaluation and per-group tracking.
pub mod condition;
/// Fixed-capacity sliding window used by conditions for rolling stats.
pub mod dataframe;
/// Crate-wide error taxonomy.
pub mod errors;
/// Named escalations and their notification destinations.
pub mod escalation;
/// The event that flows through the pipeline and its wire encodings.
pub mod event;
/// The incident an escalating condition produces.
pub mod incident;
/// Pluggable incident storage.
pub mod index;
/// Prometheus counters for the dispatcher.
pub mod metrics;
/// The dispatcher task and its public handle.
pub mod pipeline;
/// A named rule: match filters plus crit/warn conditions.
pub mod policy;
/// Process-lifetime counters and the incident resolver side-table.
pub mod tracker;

pub use config::AppConfig;
pub use errors::{Error, Result};
pub use event::{Event, Status, TagSet};
pub use incident::Incident;
pub use pipeline::Pipeline;
