//! Operator notifications.
//!
//! The engine reports fetch and settle outcomes as named events with a JSON
//! payload. A UI shell subscribes through [`BroadcastEventSink`]; headless
//! hosts can use [`TracingEventSink`], which only logs.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{info, warn};

pub const LEDGER_UPDATED: &str = "ledger_updated";
pub const LEDGER_FETCH_FAILED: &str = "ledger_fetch_failed";
pub const LEDGER_SETTLE_SUCCESS: &str = "ledger_settle_success";
pub const LEDGER_SETTLE_FAILED: &str = "ledger_settle_failed";

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &str, payload: Value);
}

/// Logs every event; failures at warn level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &str, payload: Value) {
        if event.ends_with("_failed") {
            warn!(event = %event, payload = %payload, "ledger event");
        } else {
            info!(event = %event, payload = %payload, "ledger event");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEvent {
    pub event: String,
    pub payload: Value,
}

/// Fans events out to any number of subscribers. Events emitted with no
/// subscriber attached are dropped.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<LedgerEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(64)
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: &str, payload: Value) {
        let _ = self.tx.send(LedgerEvent {
            event: event.to_string(),
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_broadcast_delivers_to_subscribers() {
        let sink = BroadcastEventSink::default();
        let mut rx = sink.subscribe();
        sink.emit(LEDGER_SETTLE_SUCCESS, json!({ "groupKey": "k" }));
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.event, LEDGER_SETTLE_SUCCESS);
        assert_eq!(ev.payload["groupKey"], "k");
    }

    #[test]
    fn test_emit_without_subscribers_is_harmless() {
        let sink = BroadcastEventSink::new(0);
        sink.emit(LEDGER_UPDATED, json!({}));
        TracingEventSink.emit(LEDGER_FETCH_FAILED, json!({ "error": "offline" }));
    }
}
