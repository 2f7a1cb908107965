//! Consumers of coordinator events.
//!
//! The coordinator emits while holding its run table lock, so an
//! [`EventSink`] must return promptly and never block on I/O.

use crate::model::{SinkEvent, TestId};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One-way consumer of derived events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SinkEvent);
}

/// Discards all events.
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: SinkEvent) {}
}

/// Forwards events into an unbounded tokio channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: SinkEvent) {
        // A dropped receiver means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all events emitted so far.
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Events scoped to one test, in emission order.
    pub fn events_for(&self, test_id: &TestId) -> Vec<SinkEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.test_id() == Some(test_id))
            .collect()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: SinkEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Logs each event through `tracing`.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: SinkEvent) {
        match &event {
            SinkEvent::LogMessage { test_id, text, .. } => {
                tracing::trace!(test_id = %test_id, text = %text.trim_end(), "agent output");
            }
            SinkEvent::Screenshot { test_id, .. } => {
                tracing::trace!(test_id = %test_id, "frame");
            }
            SinkEvent::Error { message } => tracing::warn!(%message, "coordinator error"),
            SinkEvent::TestFinished {
                test_id, result, ..
            } => {
                tracing::info!(test_id = %test_id, status = ?result.status, errors = ?result.errors, "test finished");
            }
            _ => {
                if let Ok(json) = serde_json::to_string(&event) {
                    tracing::debug!(event = %json, "event");
                }
            }
        }
    }
}

/// Fans one event out to several sinks.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: SinkEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}
