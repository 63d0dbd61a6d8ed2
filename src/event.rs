//! The asynchronous event stream pushed to host subscribers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::report::{ProgressSnapshot, RequestRecord, TestSummary};
use crate::runner::EngineStatus;
use crate::EVENT_BUS_CAPACITY;

/// Everything a host can observe while a test runs. Each variant maps onto
/// one host event channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Engine lifecycle transition.
    Status { status: EngineStatus },
    /// Periodic throughput/latency snapshot (~every 500 ms and on
    /// status transitions).
    Progress(ProgressSnapshot),
    /// One request finished.
    Result(Box<RequestRecord>),
    /// The run is over; emitted exactly once, Error state included.
    Complete(Box<TestSummary>),
}

impl EngineEvent {
    /// The host-facing channel this event is delivered on.
    pub fn channel(&self) -> &'static str {
        match self {
            EngineEvent::Status { .. } => "test-status",
            EngineEvent::Progress(_) => "test-progress",
            EngineEvent::Result(_) => "test-result",
            EngineEvent::Complete(_) => "test-complete",
        }
    }
}

/// Fan-out of [`EngineEvent`]s to any number of subscribers. Slow consumers
/// lag and lose oldest events rather than back-pressuring the engine.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish to all current subscribers. A bus with nobody listening is
    /// not an error.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}
