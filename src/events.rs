//! Fire-and-forget lifecycle notifications.
//!
//! The core only announces that something happened. Delivering the event
//! anywhere (webhooks, websockets) is left to whoever subscribes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::debug;

pub const DOWNLOAD_COMPLETED: &str = "download.completed";
pub const DOWNLOAD_FAILED: &str = "download.failed";
pub const DOWNLOAD_CANCELLED: &str = "download.cancelled";
pub const CATALOG_REFRESH_COMPLETED: &str = "catalog_refresh.completed";
pub const CATALOG_REFRESH_FAILED: &str = "catalog_refresh.failed";
pub const SCHEDULE_EXECUTION_FAILED: &str = "schedule.execution_failed";

pub trait EventHook: Send + Sync {
    /// Must not block and must not fail.
    fn emit(&self, event: &str, data: Value);
}

/// Discards every event.
pub struct NoopEventHook;

impl EventHook for NoopEventHook {
    fn emit(&self, _event: &str, _data: Value) {}
}

#[derive(Debug, Clone, Serialize)]
pub struct CoreEvent {
    pub name: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl CoreEvent {
    pub fn as_json_value(&self) -> Value {
        json!({
            "event": self.name,
            "data": self.data,
            "timestamp": self.timestamp,
        })
    }
}

/// Fans events out to any number of subscribers over a broadcast channel.
///
/// Slow subscribers lose the oldest events; emitters never wait.
pub struct BroadcastEventHook {
    sender: broadcast::Sender<CoreEvent>,
}

impl BroadcastEventHook {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }
}

impl EventHook for BroadcastEventHook {
    fn emit(&self, event: &str, data: Value) {
        let event = CoreEvent {
            name: event.to_string(),
            data,
            timestamp: Utc::now(),
        };
        if self.sender.send(event).is_err() {
            debug!("No subscribers for event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let hook = BroadcastEventHook::new(8);
        let mut rx = hook.subscribe();

        hook.emit(DOWNLOAD_COMPLETED, json!({"download_id": "d1"}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, DOWNLOAD_COMPLETED);
        assert_eq!(event.data["download_id"], "d1");
        assert_eq!(event.as_json_value()["event"], DOWNLOAD_COMPLETED);
    }

    #[test]
    fn test_emit_without_subscribers_does_not_fail() {
        let hook = BroadcastEventHook::new(1);
        hook.emit(DOWNLOAD_FAILED, Value::Null);
        NoopEventHook.emit(DOWNLOAD_FAILED, Value::Null);
    }
}
