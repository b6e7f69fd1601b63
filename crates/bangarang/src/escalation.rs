//! Named escalations: a list of destinations an incident gets sent to when
//! a policy's condition transitions into (or out of) an alerting state.
//!
//! Grounded on the destination-trait-plus-factory shape
//! `bangarang-streaming`'s backend traits use for pluggable transports.
//! Only the console destination is wired to a real sink (`tracing`); email
//! and pagerduty are documented stubs that log what they would have sent,
//! since standing up real SMTP/PagerDuty clients is outside this engine's
//! scope.

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::errors::{Error, Result};
use crate::incident::Incident;

/// One notification sink an escalation can fan an incident out to.
#[async_trait]
pub trait Destination: Send + Sync {
    async fn send(&self, incident: &Incident) -> Result<()>;
}

/// Logs the incident at a level matched to its status. The only
/// destination guaranteed to work with no external configuration.
pub struct ConsoleDestination;

#[async_trait]
impl Destination for ConsoleDestination {
    async fn send(&self, incident: &Incident) -> Result<()> {
        match incident.status {
            crate::event::Status::Critical => error!(
                policy = %incident.policy,
                index_name = %incident.index_name,
                "{}",
                incident.description
            ),
            crate::event::Status::Warning => warn!(
                policy = %incident.policy,
                index_name = %incident.index_name,
                "{}",
                incident.description
            ),
            crate::event::Status::Ok => info!(
                policy = %incident.policy,
                index_name = %incident.index_name,
                "{}",
                incident.description
            ),
        }
        Ok(())
    }
}

/// Declarative destination configuration as it comes in over config.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DestinationConfig {
    Console,
    Email { to: String },
    Pagerduty { service_key: String },
}

/// Destination that records what it would have delivered, for transports
/// this engine doesn't implement end-to-end.
struct StubDestination {
    transport: &'static str,
    target: String,
}

#[async_trait]
impl Destination for StubDestination {
    async fn send(&self, incident: &Incident) -> Result<()> {
        warn!(
            transport = self.transport,
            target = %self.target,
            policy = %incident.policy,
            "escalation destination not implemented; would have sent: {}",
            incident.description
        );
        Ok(())
    }
}

pub fn build_destination(cfg: &DestinationConfig) -> Box<dyn Destination> {
    match cfg {
        DestinationConfig::Console => Box::new(ConsoleDestination),
        DestinationConfig::Email { to } => Box::new(StubDestination {
            transport: "email",
            target: to.clone(),
        }),
        DestinationConfig::Pagerduty { service_key } => Box::new(StubDestination {
            transport: "pagerduty",
            target: service_key.clone(),
        }),
    }
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct EscalationConfig {
    pub name: String,
    pub destinations: Vec<DestinationConfig>,
}

/// A compiled, named escalation: the destinations it fans an incident out
/// to, in configuration order.
pub struct Escalation {
    pub name: String,
    destinations: Vec<Box<dyn Destination>>,
}

impl Escalation {
    pub fn compile(cfg: &EscalationConfig) -> Escalation {
        Escalation {
            name: cfg.name.clone(),
            destinations: cfg.destinations.iter().map(build_destination).collect(),
        }
    }

    /// Fan the incident out to every destination. A destination failure is
    /// logged and does not stop the remaining destinations from running.
    pub async fn escalate(&self, incident: &Incident) {
        for dest in &self.destinations {
            if let Err(e) = dest.send(incident).await {
                match e {
                    Error::DestinationSend(msg) => {
                        error!(escalation = %self.name, "destination send failed: {msg}")
                    }
                    other => error!(escalation = %self.name, "destination send failed: {other}"),
                }
            }
        }
    }
}
