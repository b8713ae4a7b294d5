//! Heartbeat-driven liveness sweeps over the session registry.
//!
//! Eviction is write-failure-driven: a session is dropped when the heartbeat
//! cannot be placed on the wire (or the session is already closed). A peer
//! whose reads are silently stalled is not detected until the OS errors the
//! socket; operators can see the gap via `last_seen`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use warden_core::protocol::SessionStatus;

use crate::registry::SessionRegistry;

/// Periodic sweep task over the registry.
pub struct HeartbeatMonitor;

impl HeartbeatMonitor {
    /// Spawn the sweep loop. It observes `shutdown` within one polling
    /// interval and never blocks the accept path.
    pub fn spawn(
        registry: Arc<SessionRegistry>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval() fires immediately; the first sweep should wait a
            // full period after start.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => Self::sweep(&registry).await,
                }
            }
            debug!("heartbeat monitor stopped");
        })
    }

    /// One pass: snapshot, probe every open session, then remove and
    /// disconnect the failures. Snapshotting first means no registry lock is
    /// held across socket writes.
    async fn sweep(registry: &SessionRegistry) {
        let sessions = registry.snapshot().await;
        let mut stale = Vec::new();

        for session in sessions {
            let status = session.status();
            if !status.is_open() {
                stale.push(session);
                continue;
            }
            // A session still in `Connecting` has its handshake in flight;
            // leave it for a later sweep.
            if status != SessionStatus::Online {
                continue;
            }
            if let Err(e) = session.send_heartbeat().await {
                warn!(id = %session.id(), error = %e, "heartbeat failed, evicting");
                stale.push(session);
            }
        }

        for session in stale {
            registry.remove(session.id()).await;
            session.disconnect().await;
        }
    }
}
