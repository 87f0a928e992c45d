//! Event broadcast for dispatched head updates and rescan requests.

use crate::dispatch::HeadEventSink;
use bbs_common::{HeadUpdate, RescanRequest};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_BUFFER: usize = 256;

pub const HEAD_UPDATED: &str = "head_updated";
pub const RESCAN_REQUESTED: &str = "rescan_requested";

/// Broadcast channel for daemon events (JSON lines).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<String>,
}

impl EventBus {
    /// Create a new event bus with the provided buffer size.
    ///
    /// The effective buffer is never smaller than `DEFAULT_BUFFER`.
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(DEFAULT_BUFFER);
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Emit a structured event with payload.
    pub fn emit<T: Serialize>(&self, event: &str, data: &T) {
        let payload = json!({
            "event": event,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        });
        match serde_json::to_string(&payload) {
            Ok(serialized) => {
                // No subscribers is not an error.
                let _ = self.sender.send(serialized);
            }
            Err(err) => warn!("Failed to serialize event {}: {}", event, err),
        }
    }
}

impl HeadEventSink for EventBus {
    fn head_updated(&self, update: &HeadUpdate) {
        self.emit(HEAD_UPDATED, update);
    }

    fn rescan_requested(&self, request: &RescanRequest) {
        self.emit(RESCAN_REQUESTED, request);
    }
}
