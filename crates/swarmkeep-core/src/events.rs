//! Request events for observability.
//!
//! Every keystore and testdata request produces one [`RequestEvent`], on
//! the worker (consumer role) and on the coordinator (producer role). Failed
//! requests carry the error text so the surrounding load test can record
//! them as named failures.

use crate::protocol::MessageKind;
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Which side of the protocol emitted the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventRole {
    Consumer,
    Producer,
}

/// A single keystore or testdata request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestEvent {
    /// `None` for requests of an unknown or unparsable kind.
    pub kind: Option<MessageKind>,
    pub role: EventRole,
    pub identifier: String,
    pub action: Option<String>,
    pub key: Option<String>,
    pub response_time: Duration,
    pub error: Option<String>,
}

impl RequestEvent {
    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }

    pub fn kind_name(&self) -> &'static str {
        self.kind.map(|kind| kind.as_str()).unwrap_or("unknown")
    }

    /// Name under which the event is recorded, `"<identifier> <key>"`.
    pub fn name(&self) -> String {
        match &self.key {
            Some(key) => format!("{} {}", self.identifier, key),
            None => self.identifier.clone(),
        }
    }
}

/// Receiver of request events.
pub trait EventSink: Send + Sync + 'static {
    fn record(&self, event: RequestEvent);
}

/// Logs every event through `tracing`; failures at WARN.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: RequestEvent) {
        match &event.error {
            Some(error) => warn!(
                "{:?} {} request {} ({}) failed after {:?}: {}",
                event.role,
                event.kind_name(),
                event.name(),
                event.action.as_deref().unwrap_or("-"),
                event.response_time,
                error
            ),
            None => debug!(
                "{:?} {} request {} ({}) took {:?}",
                event.role,
                event.kind_name(),
                event.name(),
                event.action.as_deref().unwrap_or("-"),
                event.response_time
            ),
        }
    }
}

/// Collects events in memory.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<RequestEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RequestEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn failures(&self) -> Vec<RequestEvent> {
        self.events().into_iter().filter(|e| e.is_failure()).collect()
    }
}

impl EventSink for MemoryEventSink {
    fn record(&self, event: RequestEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
