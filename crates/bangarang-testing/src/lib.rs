// Allow unwrap in testing utilities - test code should panic on errors
#![allow(clippy::unwrap_used)]

//! Test doubles for the alerting engine: a recording escalation destination
//! and a small event-feed helper, shared by `bangarang`'s own tests and by
//! `bangarang-test-utils`'s end-to-end suite.

use std::sync::Arc;

use async_trait::async_trait;
use bangarang::errors::Result;
use bangarang::escalation::Destination;
use bangarang::{Event, Incident, Pipeline};
use parking_lot::Mutex;

/// A [`Destination`] that records every incident it's asked to send
/// instead of delivering it anywhere. Optionally fails the next `n` sends,
/// for exercising an escalation set's continue-past-failure behavior.
#[derive(Clone, Default)]
pub struct MockDestination {
    sent: Arc<Mutex<Vec<Incident>>>,
    fail_next: Arc<Mutex<usize>>,
}

impl MockDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls to [`Destination::send`] return an error instead
    /// of recording the incident.
    pub fn fail_next(&self, n: usize) {
        *self.fail_next.lock() = n;
    }

    pub fn sent(&self) -> Vec<Incident> {
        self.sent.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl Destination for MockDestination {
    async fn send(&self, incident: &Incident) -> Result<()> {
        let mut remaining = self.fail_next.lock();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(bangarang::errors::Error::DestinationSend(
                "mock destination configured to fail".into(),
            ));
        }
        drop(remaining);
        self.sent.lock().push(incident.clone());
        Ok(())
    }
}

/// Feeds a fixed sequence of events into a pipeline one at a time, useful
/// for asserting on the incident(s) produced at the end of a scenario.
pub async fn feed_events(pipeline: &Pipeline, events: impl IntoIterator<Item = Event>) -> Result<()> {
    for event in events {
        pipeline.pass_event(event).await?;
    }
    Ok(())
}

/// Builds an [`Event`] with the given host, service, and metric -- the
/// shape almost every condition/policy scenario needs.
pub fn event(host: &str, service: &str, metric: f64) -> Event {
    let mut tags = bangarang::event::TagSet::new();
    tags.set("host", host);
    tags.set("service", service);
    Event::new(metric, tags)
}
