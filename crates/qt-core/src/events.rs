//! Tunnel status events
//!
//! The hosting application may report tunnel status to connected clients
//! through a `publish(event, payload, room)` primitive. The supervisor does
//! not depend on this; the caller publishes after each lifecycle step.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Room that every client joins
pub const DEFAULT_ROOM: &str = "global";

/// Event name used for tunnel status updates
pub const TUNNEL_STATUS_EVENT: &str = "tunnel_status";

/// Tunnel lifecycle as seen by clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TunnelStatus {
    /// Agent launched, waiting for a public URL
    Starting { port: u16 },

    /// A unique public URL was confirmed
    Established { url: String },

    /// Running, but the public URL could not be confirmed
    Degraded { url: String, reason: String },

    /// Establishment failed
    Failed { error: String },

    /// Tunnel torn down
    Stopped,
}

/// A published event as delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEnvelope {
    pub event: String,
    pub room: String,
    pub payload: serde_json::Value,
    /// Unix timestamp in milliseconds
    pub timestamp_ms: u64,
}

/// Broadcast primitive exposed by the transport layer
pub trait StatusPublisher: Send + Sync {
    /// Publish `payload` under `event` to every member of `room`
    fn publish(&self, event: &str, payload: serde_json::Value, room: &str);

    /// Publish a tunnel status update to the default room
    fn publish_status(&self, status: &TunnelStatus) {
        match serde_json::to_value(status) {
            Ok(payload) => self.publish(TUNNEL_STATUS_EVENT, payload, DEFAULT_ROOM),
            Err(e) => tracing::warn!("Failed to encode tunnel status: {}", e),
        }
    }
}

/// In-process publisher backed by a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<StatusEnvelope>,
}

impl BroadcastPublisher {
    /// Create a publisher retaining up to `capacity` undelivered events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEnvelope> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(64)
    }
}

impl StatusPublisher for BroadcastPublisher {
    fn publish(&self, event: &str, payload: serde_json::Value, room: &str) {
        let envelope = StatusEnvelope {
            event: event.to_string(),
            room: room.to_string(),
            payload,
            timestamp_ms: current_time_millis(),
        };
        // No subscribers is not an error
        let _ = self.tx.send(envelope);
    }
}

fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
