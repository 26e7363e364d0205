//! Shared runtime state: the subscriber connection state machine and
//! process uptime, read by the /health endpoint.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::RwLock;

pub type SharedState = Arc<SystemState>;

// ---------------------------------------------------------------------------
// Subscriber state machine
// ---------------------------------------------------------------------------

/// Lifecycle of the MQTT subscriber.
///
/// Disconnected → Connecting → Connected → (broker loss) Disconnected,
/// and on shutdown any state → Draining → Disconnected.  Draining is
/// terminal except for the final Disconnected: once the process decided to
/// stop, a late ConnAck must not flip it back to Connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
}

pub struct SystemState {
    started_at: Instant,
    connection: RwLock<ConnectionState>,
}

impl SystemState {
    pub fn new() -> SharedState {
        Arc::new(Self {
            started_at: Instant::now(),
            connection: RwLock::new(ConnectionState::Disconnected),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub async fn connection(&self) -> ConnectionState {
        *self.connection.read().await
    }

    /// Apply a transition.  Returns the state actually in effect afterwards
    /// (Draining absorbs everything except Disconnected).
    pub async fn set_connection(&self, next: ConnectionState) -> ConnectionState {
        let mut current = self.connection.write().await;
        let allowed = match (*current, next) {
            (ConnectionState::Draining, ConnectionState::Disconnected) => true,
            (ConnectionState::Draining, _) => false,
            _ => true,
        };
        if allowed {
            *current = next;
        }
        *current
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_disconnected() {
        let state = SystemState::new();
        assert_eq!(state.connection().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn normal_lifecycle() {
        let state = SystemState::new();
        state.set_connection(ConnectionState::Connecting).await;
        state.set_connection(ConnectionState::Connected).await;
        assert_eq!(state.connection().await, ConnectionState::Connected);
        state.set_connection(ConnectionState::Disconnected).await;
        assert_eq!(state.connection().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn draining_absorbs_reconnects() {
        let state = SystemState::new();
        state.set_connection(ConnectionState::Connected).await;
        state.set_connection(ConnectionState::Draining).await;

        // A late ConnAck must not resurrect the subscriber.
        let after = state.set_connection(ConnectionState::Connected).await;
        assert_eq!(after, ConnectionState::Draining);

        let done = state.set_connection(ConnectionState::Disconnected).await;
        assert_eq!(done, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn uptime_is_monotonic() {
        let state = SystemState::new();
        let a = state.uptime_secs();
        let b = state.uptime_secs();
        assert!(b >= a);
    }

    #[test]
    fn connection_state_serializes_lowercase() {
        let json = serde_json::to_value(ConnectionState::Draining).unwrap();
        assert_eq!(json, "draining");
    }
}
