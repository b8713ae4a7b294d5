//! Server core: accept loop, lifecycle, command dispatch, and broadcast.
//!
//! Lifecycle is `Stopped → Starting → Running → Stopping → Stopped`, held in
//! an atomic so start/stop races resolve to exactly one winner. The accept
//! loop and the heartbeat monitor run as independent tasks cancelled through
//! one shared `watch` signal; per-session faults never reach either of them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use warden_core::constants::{HEARTBEAT_INTERVAL, SHUTDOWN_GRACE};
use warden_core::error::{Error, Result};
use warden_core::protocol::{Framing, SessionId, SessionSummary};

use crate::events::{EventBus, ServerEvent};
use crate::monitor::HeartbeatMonitor;
use crate::registry::SessionRegistry;
use crate::session::{BulkSink, ClientSession, SessionContext};

// =============================================================================
// Configuration
// =============================================================================

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Identifier advertised in handshake frames.
    pub server_id: String,
    /// Framing discipline for every session this server accepts.
    pub framing: Framing,
    pub heartbeat_interval: std::time::Duration,
    /// Bound on how long `stop()` waits for in-flight session shutdowns.
    pub shutdown_grace: std::time::Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            server_id: "warden".to_string(),
            framing: Framing::Text,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}

/// Point-in-time operational stats.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStats {
    pub running: bool,
    pub local_addr: Option<SocketAddr>,
    pub sessions: usize,
    pub started_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Lifecycle State
// =============================================================================

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServerState::Starting,
            2 => ServerState::Running,
            3 => ServerState::Stopping,
            _ => ServerState::Stopped,
        }
    }
}

// =============================================================================
// ServerCore
// =============================================================================

/// The control server: owns the registry, the accept loop, and the heartbeat
/// monitor for one listening socket.
pub struct ServerCore {
    config: ServerConfig,
    state: AtomicU8,
    registry: Arc<SessionRegistry>,
    events: EventBus,
    bulk_sink: Option<Arc<dyn BulkSink>>,

    shutdown_tx: StdMutex<Option<watch::Sender<bool>>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    local_addr: StdMutex<Option<SocketAddr>>,
    started_at: StdMutex<Option<DateTime<Utc>>>,
}

impl ServerCore {
    pub fn new(config: ServerConfig) -> Self {
        ServerCore {
            config,
            state: AtomicU8::new(ServerState::Stopped as u8),
            registry: Arc::new(SessionRegistry::new()),
            events: EventBus::default(),
            bulk_sink: None,
            shutdown_tx: StdMutex::new(None),
            tasks: StdMutex::new(Vec::new()),
            local_addr: StdMutex::new(None),
            started_at: StdMutex::new(None),
        }
    }

    /// Attach a receiver for completed bulk transfers (binary framing).
    pub fn with_bulk_sink(mut self, sink: Arc<dyn BulkSink>) -> Self {
        self.bulk_sink = Some(sink);
        self
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        ServerState::from_u8(self.state.load(Ordering::Acquire)) == ServerState::Running
    }

    /// Address actually bound, once running. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            running: self.is_running(),
            local_addr: self.local_addr(),
            sessions: self.registry.len().await,
            started_at: *self.started_at.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Bind and start serving. Returns the bound address.
    ///
    /// Fails with `AlreadyRunning` unless currently stopped; a bind failure
    /// rolls the lifecycle back and surfaces as `Bind`, fatal for this call
    /// but not for the process.
    pub async fn start(&self, addr: SocketAddr) -> Result<SocketAddr> {
        self.state
            .compare_exchange(
                ServerState::Stopped as u8,
                ServerState::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| Error::AlreadyRunning)?;

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.state
                    .store(ServerState::Stopped as u8, Ordering::Release);
                return Err(Error::Bind { addr, source: e });
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(local_addr) => local_addr,
            Err(e) => {
                self.state
                    .store(ServerState::Stopped as u8, Ordering::Release);
                return Err(Error::Bind { addr, source: e });
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = SessionContext {
            framing: self.config.framing,
            server_id: self.config.server_id.clone(),
            events: self.events.clone(),
            bulk_sink: self.bulk_sink.clone(),
        };

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.registry),
            ctx,
            self.events.clone(),
            shutdown_rx.clone(),
        ));
        let monitor_task = HeartbeatMonitor::spawn(
            Arc::clone(&self.registry),
            self.config.heartbeat_interval,
            shutdown_rx,
        );

        *self.shutdown_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(shutdown_tx);
        *self.tasks.lock().unwrap_or_else(|e| e.into_inner()) =
            vec![accept_task, monitor_task];
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(local_addr);
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());

        self.state
            .store(ServerState::Running as u8, Ordering::Release);
        info!(addr = %local_addr, framing = ?self.config.framing, "server started");
        self.events
            .emit(ServerEvent::ServerStarted { addr: local_addr });

        Ok(local_addr)
    }

    /// Stop serving. Idempotent; concurrent calls collapse to one teardown.
    ///
    /// Disconnects every session concurrently, bounded by the configured
    /// grace period: stragglers are abandoned (their sockets close when the
    /// last reference drops) rather than blocking shutdown.
    pub async fn stop(&self) {
        if self
            .state
            .compare_exchange(
                ServerState::Running as u8,
                ServerState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        info!("server stopping");

        if let Some(shutdown_tx) = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = shutdown_tx.send(true);
        }

        // The accept loop owns the listener; once it observes the signal the
        // listener drops and the port is released.
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            if tokio::time::timeout(std::time::Duration::from_secs(1), task)
                .await
                .is_err()
            {
                warn!("background task did not exit promptly");
            }
        }

        let sessions = self.registry.snapshot().await;
        let count = sessions.len();
        let disconnects = sessions.iter().map(|session| session.disconnect());
        if tokio::time::timeout(self.config.shutdown_grace, join_all(disconnects))
            .await
            .is_err()
        {
            warn!(
                grace_secs = self.config.shutdown_grace.as_secs(),
                "grace period expired, abandoning remaining sessions"
            );
        }
        self.registry.clear().await;

        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.state
            .store(ServerState::Stopped as u8, Ordering::Release);
        info!(sessions = count, "server stopped");
        self.events.emit(ServerEvent::ServerStopped);
    }

    // =========================================================================
    // Operator Surface
    // =========================================================================

    /// Send a command to one session.
    pub async fn send_command(&self, id: &SessionId, command: &str) -> Result<()> {
        let session = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| Error::UnknownClient(id.clone()))?;

        session.send_command(command).await?;
        self.events.emit(ServerEvent::CommandExecuted {
            id: id.clone(),
            command: command.to_string(),
            response: "Command sent".to_string(),
        });
        Ok(())
    }

    /// Send a command to every session; returns the number of successful
    /// sends. Per-session failures are logged, not propagated.
    pub async fn broadcast(&self, command: &str) -> usize {
        let sessions = self.registry.snapshot().await;
        let mut sent = 0;
        for session in sessions {
            match session.send_command(command).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    debug!(id = %session.id(), error = %e, "broadcast send failed");
                }
            }
        }
        sent
    }

    /// Disconnect one session on operator request.
    pub async fn disconnect_session(&self, id: &SessionId) -> Result<()> {
        let session = self
            .registry
            .remove(id)
            .await
            .ok_or_else(|| Error::UnknownClient(id.clone()))?;
        session.disconnect().await;
        Ok(())
    }

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        self.registry
            .snapshot()
            .await
            .iter()
            .map(|session| session.summary())
            .collect()
    }
}

// =============================================================================
// Accept Loop
// =============================================================================

/// Accept connections until the shutdown signal flips. Accept-level errors
/// are logged and skipped; only shutdown ends the loop.
async fn accept_loop(
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    ctx: SessionContext,
    events: EventBus,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, remote_addr) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                if *shutdown.borrow() {
                    break;
                }
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let session = Arc::new(ClientSession::new(stream, remote_addr, ctx.clone()));
        if !registry.add(Arc::clone(&session)).await {
            // Generated ids colliding is effectively impossible, but the
            // registry is the authority.
            warn!(id = %session.id(), "duplicate session id, rejecting connection");
            session.disconnect().await;
            continue;
        }

        info!(id = %session.id(), remote = %remote_addr, "client connected");
        events.emit(ServerEvent::ClientConnected {
            session: session.summary(),
        });

        // Independent read loop per session: its failure never propagates to
        // siblings or to this loop.
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            session.run().await;
            registry.remove(session.id()).await;
        });
    }
    debug!("accept loop exited");
}
