//! Lifecycle event fan-out.
//!
//! External collaborators (CLI, GUI) subscribe explicitly instead of hanging
//! callbacks on each component: ordering is the channel's ordering, and
//! emitting with no subscribers is a visible no-op rather than a silent one.

use std::net::SocketAddr;

use tokio::sync::broadcast;

use warden_core::constants::EVENT_CHANNEL_CAPACITY;
use warden_core::protocol::{SessionId, SessionSummary};

/// Server lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ServerStarted {
        addr: SocketAddr,
    },
    ServerStopped,
    ClientConnected {
        session: SessionSummary,
    },
    /// Fired exactly once per session, no matter how many call sites race
    /// into `disconnect()`.
    ClientDisconnected {
        id: SessionId,
    },
    CommandExecuted {
        id: SessionId,
        command: String,
        response: String,
    },
}

/// Bounded broadcast channel of [`ServerEvent`]s.
///
/// Slow subscribers lag (and observe `RecvError::Lagged`) rather than
/// backpressuring the I/O paths that emit.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        EventBus { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Having zero subscribers is not an error.
    pub fn emit(&self, event: ServerEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(EVENT_CHANNEL_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.emit(ServerEvent::ServerStarted {
            addr: "127.0.0.1:9000".parse().unwrap(),
        });
        bus.emit(ServerEvent::ServerStopped);

        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerEvent::ServerStarted { .. }
        ));
        assert_eq!(rx.recv().await.unwrap(), ServerEvent::ServerStopped);
    }

    #[test]
    fn emit_without_subscribers_is_a_noop() {
        let bus = EventBus::new(8);
        bus.emit(ServerEvent::ServerStopped);
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::new(8);
        bus.emit(ServerEvent::ServerStopped);
        let mut rx = bus.subscribe();
        bus.emit(ServerEvent::ServerStarted {
            addr: "127.0.0.1:9000".parse().unwrap(),
        });
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerEvent::ServerStarted { .. }
        ));
    }
}
