//! Event Bus - broadcast fan-out of execution events
//!
//! The bus uses a tokio broadcast channel: every subscriber sees every event
//! emitted after it subscribed. Emitting with no subscribers drops the event.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::types::{ExecutionEvent, event_type};

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 10_000;

/// Receiver of execution notifications
///
/// Implementations must not block; the loop calls `notify` inline. Payloads
/// sent through an [`EventEmitter`] carry an `execution_id` field.
pub trait ObservabilitySink: Send + Sync {
    fn notify(&self, event_type: &str, payload: &Value);
}

/// Broadcast bus for execution events
pub struct EventBus {
    tx: broadcast::Sender<ExecutionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Fire-and-forget; a full channel drops the oldest events
    pub fn emit(&self, event: ExecutionEvent) {
        debug!(event_type = %event.event_type, execution_id = %event.execution_id, "EventBus::emit");
        let _ = self.tx.send(event);
    }

    /// Receive events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        debug!("EventBus::subscribe: new subscriber");
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

impl ObservabilitySink for EventBus {
    fn notify(&self, event_type: &str, payload: &Value) {
        let execution_id = payload.get("execution_id").and_then(Value::as_str).unwrap_or_default();
        self.emit(ExecutionEvent::new(execution_id, event_type, payload.clone()));
    }
}

/// Handle the loop emits through
///
/// Bound to one execution id. Without a sink every call is a no-op, and a
/// panicking sink is logged and swallowed.
#[derive(Clone, Default)]
pub struct EventEmitter {
    sink: Option<Arc<dyn ObservabilitySink>>,
    execution_id: String,
}

impl EventEmitter {
    pub fn new(sink: Option<Arc<dyn ObservabilitySink>>, execution_id: impl Into<String>) -> Self {
        Self {
            sink,
            execution_id: execution_id.into(),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn is_attached(&self) -> bool {
        self.sink.is_some()
    }

    /// Emit a raw event; object payloads get the execution id added
    pub fn emit(&self, event_type: &str, mut payload: Value) {
        let Some(sink) = &self.sink else {
            return;
        };
        if let Value::Object(map) = &mut payload {
            map.insert("execution_id".to_string(), Value::String(self.execution_id.clone()));
        }
        let delivered = catch_unwind(AssertUnwindSafe(|| {
            sink.notify(event_type, &payload);
        }));
        if delivered.is_err() {
            warn!(%event_type, execution_id = %self.execution_id, "Observability sink panicked, event dropped");
        }
    }

    // === Convenience methods ===

    pub fn loop_start(&self, iteration: u32) {
        self.emit(event_type::LOOP_START, serde_json::json!({ "iteration": iteration }));
    }

    pub fn tool(&self, id: &str, name: &str, args: &Value) {
        self.emit(
            event_type::TOOL,
            serde_json::json!({ "id": id, "name": name, "args": args }),
        );
    }

    pub fn tool_result(&self, id: &str, name: &str, is_error: bool, duration_ms: u64) {
        self.emit(
            event_type::TOOL_RESULT,
            serde_json::json!({ "id": id, "name": name, "is_error": is_error, "duration_ms": duration_ms }),
        );
    }

    pub fn reasoning(&self, text: &str) {
        self.emit(event_type::REASONING, serde_json::json!({ "text": text }));
    }

    pub fn advisory(&self, source: &str, message: &str) {
        self.emit(
            event_type::ADVISORY,
            serde_json::json!({ "source": source, "message": message }),
        );
    }

    pub fn terminal(&self, status: &str, tag: &str, iterations: u32) {
        self.emit(
            event_type::TERMINAL,
            serde_json::json!({ "status": status, "tag": tag, "iterations": iterations }),
        );
    }
}
