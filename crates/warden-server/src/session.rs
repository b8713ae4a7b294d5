//! Per-connection session state machine.
//!
//! Each accepted connection gets one `ClientSession` running an independent
//! read loop on its own task. Writes from any caller (operator commands,
//! heartbeat sweeps) funnel through a single mutex-guarded write half so
//! frames are placed on the wire atomically, never interleaved.
//!
//! Status transitions one way, `Connecting → Online → Disconnecting →
//! Closed`, driven by a compare-and-set on an atomic so that `disconnect()`
//! racing the read loop's own termination still tears down, and notifies,
//! exactly once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use warden_core::constants::{BINARY_HEADER_LEN, PROTOCOL_VERSION, READ_BUFFER_SIZE};
use warden_core::error::{Error, Result};
use warden_core::protocol::{
    AgentMessage, AgentMetadata, BinaryCodec, BinaryType, BulkImage, BulkTransfer, CommandPayload,
    Framing, HandshakePayload, HeartbeatPayload, HeartbeatResponsePayload, ServerMessage,
    SessionId, SessionStatus, SessionSummary, SystemInfoPayload, TextCodec,
};

use crate::events::{EventBus, ServerEvent};

// =============================================================================
// Collaborator Interfaces
// =============================================================================

/// Receiver for completed bulk transfers.
///
/// The session reassembles chunks but never interprets the bytes; whatever
/// turns them into an image lives behind this seam.
pub trait BulkSink: Send + Sync {
    fn bulk_complete(&self, id: &SessionId, image: BulkImage);
}

/// Construction context shared by every session of one server instance.
#[derive(Clone)]
pub struct SessionContext {
    pub framing: Framing,
    pub server_id: String,
    pub events: EventBus,
    pub bulk_sink: Option<Arc<dyn BulkSink>>,
}

// =============================================================================
// ClientSession
// =============================================================================

/// Server-side state for one accepted TCP connection.
pub struct ClientSession {
    id: SessionId,
    remote_addr: SocketAddr,
    ctx: SessionContext,

    status: AtomicU8,
    connected_at: DateTime<Utc>,
    /// Unix millis of the last successful read.
    last_seen_ms: AtomicI64,
    /// Last heartbeat round-trip estimate, clamped to >= 0.
    ping_ms: AtomicU32,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    commands_executed: AtomicU64,
    metadata: StdMutex<Option<AgentMetadata>>,

    /// Serialized send path: exactly one frame on the wire at a time.
    /// Taken (set to None) on disconnect so late writers fail fast.
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Taken once by the read loop.
    reader: Mutex<Option<OwnedReadHalf>>,
    /// Flipped on disconnect; unblocks an in-flight read.
    closed_tx: watch::Sender<bool>,
}

impl ClientSession {
    pub fn new(stream: TcpStream, remote_addr: SocketAddr, ctx: SessionContext) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (closed_tx, _) = watch::channel(false);
        let now = Utc::now();

        ClientSession {
            id: SessionId::generate(),
            remote_addr,
            ctx,
            status: AtomicU8::new(SessionStatus::Connecting.as_u8()),
            connected_at: now,
            last_seen_ms: AtomicI64::new(now.timestamp_millis()),
            ping_ms: AtomicU32::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            commands_executed: AtomicU64::new(0),
            metadata: StdMutex::new(None),
            writer: Mutex::new(Some(write_half)),
            reader: Mutex::new(Some(read_half)),
            closed_tx,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_online(&self) -> bool {
        self.status() == SessionStatus::Online
    }

    /// Point-in-time view for the operator surface.
    pub fn summary(&self) -> SessionSummary {
        let metadata = self
            .metadata
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        SessionSummary {
            id: self.id.clone(),
            remote_addr: self.remote_addr.to_string(),
            status: self.status(),
            connected_at: self.connected_at,
            last_seen: DateTime::from_timestamp_millis(self.last_seen_ms.load(Ordering::Relaxed))
                .unwrap_or_default(),
            ping_ms: self.ping_ms.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            commands_executed: self.commands_executed.load(Ordering::Relaxed),
            metadata,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Drive the session until termination: handshake, then the read loop for
    /// this session's framing discipline. Always ends in `disconnect()`.
    ///
    /// Runs on its own task so the accept loop never blocks on a session.
    pub async fn run(self: &Arc<Self>) {
        if self.ctx.framing == Framing::Text {
            if let Err(e) = self.send_handshake().await {
                warn!(id = %self.id, error = %e, "handshake failed");
                self.disconnect().await;
                return;
            }
        }

        // Online only if nothing disconnected us during the handshake.
        if self
            .status
            .compare_exchange(
                SessionStatus::Connecting.as_u8(),
                SessionStatus::Online.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        debug!(id = %self.id, remote = %self.remote_addr, "session online");

        let result = match self.ctx.framing {
            Framing::Text => self.read_text_frames().await,
            Framing::Binary => self.read_binary_frames().await,
        };

        match result {
            Ok(()) => debug!(id = %self.id, "read loop ended"),
            Err(e) => warn!(id = %self.id, error = %e, "read loop failed"),
        }

        self.disconnect().await;
    }

    /// Tear the session down and fire `ClientDisconnected` exactly once.
    ///
    /// Idempotent and safe under concurrent invocation: the first caller to
    /// win the status compare-and-set performs the teardown, everyone else
    /// returns immediately.
    pub async fn disconnect(&self) {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if current >= SessionStatus::Disconnecting.as_u8() {
                return;
            }
            match self.status.compare_exchange(
                current,
                SessionStatus::Disconnecting.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        // Transition and notify before the first await: a caller dropping
        // this future mid-teardown (shutdown grace expiry) must not lose the
        // notification or strand the status in `Disconnecting`.
        let _ = self.closed_tx.send(true);
        self.status
            .store(SessionStatus::Closed.as_u8(), Ordering::Release);
        debug!(id = %self.id, "session closed");
        self.ctx
            .events
            .emit(ServerEvent::ClientDisconnected {
                id: self.id.clone(),
            });

        // Best-effort writer teardown. The lock may be held by a write
        // parked on a full socket; in that case the socket closes when the
        // last session handle drops instead.
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    // =========================================================================
    // Send Paths
    // =========================================================================

    async fn send_handshake(&self) -> Result<()> {
        let msg = ServerMessage::Handshake(HandshakePayload {
            server_id: self.ctx.server_id.clone(),
            timestamp: utc_timestamp(),
            version: PROTOCOL_VERSION.to_string(),
        });
        self.send_text(&msg).await
    }

    /// Send a command to the agent, returning the generated command id.
    ///
    /// A write failure closes this session (and only this session).
    pub async fn send_command(&self, command: &str) -> Result<String> {
        let command_id = format!("{:08X}", rand::random::<u32>());
        let payload = CommandPayload {
            command: command.to_string(),
            command_id: Some(command_id.clone()),
        };
        let msg = ServerMessage::Command(payload);

        let result = match self.ctx.framing {
            Framing::Text => self.send_text(&msg).await,
            Framing::Binary => {
                let json = msg.to_json_bytes()?;
                let frame = BinaryCodec::encode(BinaryType::Command.code(), &json)?;
                self.send_frame(frame).await
            }
        };

        self.fail_session_on(result).await?;
        Ok(command_id)
    }

    /// Liveness probe issued by the heartbeat monitor.
    pub async fn send_heartbeat(&self) -> Result<()> {
        let result = match self.ctx.framing {
            Framing::Text => {
                let msg = ServerMessage::Heartbeat(HeartbeatPayload {
                    timestamp: utc_timestamp(),
                    sequence: None,
                });
                self.send_text(&msg).await
            }
            // The binary discipline has no heartbeat frame; the probe reduces
            // to "do we still hold a writable half".
            Framing::Binary => {
                if self.writer.lock().await.is_some() {
                    Ok(())
                } else {
                    Err(Error::ConnectionClosed)
                }
            }
        };

        self.fail_session_on(result).await
    }

    async fn send_text(&self, msg: &ServerMessage) -> Result<()> {
        let frame = TextCodec::encode(msg)?;
        self.send_frame(frame).await
    }

    /// The serialized write path. Holding the writer lock across the whole
    /// `write_all` is what guarantees frames never interleave byte-wise.
    async fn send_frame(&self, frame: Bytes) -> Result<()> {
        // The write half is released asynchronously after disconnect; late
        // writers must fail without racing that teardown.
        if !self.status().is_open() {
            return Err(Error::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        let Some(write_half) = writer.as_mut() else {
            return Err(Error::ConnectionClosed);
        };
        write_half.write_all(&frame).await?;
        self.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Session-fatal send errors tear this session down before propagating.
    async fn fail_session_on(&self, result: Result<()>) -> Result<()> {
        if let Err(e) = result {
            if e.is_session_fatal() {
                self.disconnect().await;
            }
            return Err(e);
        }
        Ok(())
    }

    // =========================================================================
    // Read Loops
    // =========================================================================

    /// Text discipline: accumulate, split on `\n`, dispatch by discriminator.
    async fn read_text_frames(&self) -> Result<()> {
        let Some(mut reader) = self.reader.lock().await.take() else {
            return Ok(());
        };
        let mut closed = self.closed_tx.subscribe();
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        loop {
            let n = tokio::select! {
                _ = closed.changed() => return Ok(()),
                read = reader.read_buf(&mut buf) => read?,
            };
            if n == 0 {
                // Peer half-close.
                return Ok(());
            }

            self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
            self.touch();

            loop {
                match TextCodec::decode(&mut buf) {
                    Ok(Some(msg)) => self.handle_message(msg).await?,
                    Ok(None) => break,
                    // The malformed line is already consumed; keep draining.
                    Err(e) => warn!(id = %self.id, error = %e, "discarding malformed frame"),
                }
            }
        }
    }

    async fn handle_message(&self, msg: AgentMessage) -> Result<()> {
        match msg {
            AgentMessage::Heartbeat(hb) => self.handle_heartbeat(hb).await?,
            AgentMessage::SystemInfo(info) => self.handle_system_info(info),
            AgentMessage::CommandResponse(resp) => {
                self.record_command_response(resp.command, resp.response);
            }
            AgentMessage::Error(err) => {
                warn!(id = %self.id, error = %err.error_message, "agent reported error");
            }
            AgentMessage::Unknown { kind } => {
                warn!(id = %self.id, kind = %kind, "ignoring unknown message type");
            }
        }
        Ok(())
    }

    async fn handle_heartbeat(&self, hb: HeartbeatPayload) -> Result<()> {
        // Clock skew can put the agent timestamp in the future; clamp to 0
        // rather than reporting a negative ping.
        if let Ok(sent_at) = DateTime::parse_from_rfc3339(&hb.timestamp) {
            let ping = (Utc::now() - sent_at.with_timezone(&Utc))
                .num_milliseconds()
                .clamp(0, u32::MAX as i64) as u32;
            self.ping_ms.store(ping, Ordering::Relaxed);
        }

        let reply = ServerMessage::HeartbeatResponse(HeartbeatResponsePayload {
            timestamp: utc_timestamp(),
            sequence: hb.sequence.unwrap_or_else(|| "0".to_string()),
        });
        self.send_text(&reply).await
    }

    fn handle_system_info(&self, info: SystemInfoPayload) {
        debug!(
            id = %self.id,
            os = %info.os,
            computer = %info.computer_name,
            "system info received"
        );
        let mut metadata = self.metadata.lock().unwrap_or_else(|e| e.into_inner());
        *metadata = Some(AgentMetadata {
            os: info.os,
            computer_name: info.computer_name,
            user_name: info.user_name,
            agent_version: info.agent_version,
        });
    }

    fn record_command_response(&self, command: String, response: String) {
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
        self.ctx.events.emit(ServerEvent::CommandExecuted {
            id: self.id.clone(),
            command,
            response,
        });
    }

    /// Binary discipline: fixed 8-byte header, exact-length payload, dispatch
    /// by type code. A framing violation is fatal: there is no resync point.
    async fn read_binary_frames(&self) -> Result<()> {
        let Some(mut reader) = self.reader.lock().await.take() else {
            return Ok(());
        };
        let mut closed = self.closed_tx.subscribe();
        let mut bulk: Option<BulkTransfer> = None;

        loop {
            let mut header = [0u8; BINARY_HEADER_LEN];
            let read = tokio::select! {
                _ = closed.changed() => return Ok(()),
                read = reader.read_exact(&mut header) => read,
            };
            match read {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }

            // Validate the bound before committing to the payload read.
            let (kind, len) = BinaryCodec::decode_header(header)?;

            let mut payload = vec![0u8; len];
            if len > 0 {
                tokio::select! {
                    _ = closed.changed() => return Ok(()),
                    read = reader.read_exact(&mut payload) => read?,
                };
            }

            self.bytes_received
                .fetch_add((BINARY_HEADER_LEN + len) as u64, Ordering::Relaxed);
            self.touch();

            self.handle_binary_frame(kind, Bytes::from(payload), &mut bulk)?;
        }
    }

    fn handle_binary_frame(
        &self,
        kind: i32,
        payload: Bytes,
        bulk: &mut Option<BulkTransfer>,
    ) -> Result<()> {
        match BinaryType::from_code(kind) {
            Some(BinaryType::Response) => self.handle_binary_response(payload, bulk)?,
            Some(BinaryType::Error) => {
                warn!(
                    id = %self.id,
                    error = %String::from_utf8_lossy(&payload),
                    "agent reported error"
                );
            }
            Some(BinaryType::Command) => {
                // Commands flow server → agent only.
                warn!(id = %self.id, "ignoring agent-originated command frame");
            }
            None => {
                warn!(id = %self.id, kind, "ignoring unknown binary frame type");
            }
        }
        Ok(())
    }

    /// `Response` frames are overloaded by the agent protocol: a bulk header
    /// announcement, a raw chunk while a transfer is active, or plain command
    /// output.
    fn handle_binary_response(
        &self,
        payload: Bytes,
        bulk: &mut Option<BulkTransfer>,
    ) -> Result<()> {
        if let Some(transfer) = bulk.as_mut() {
            if let Some(image) = transfer.push_chunk(&payload)? {
                debug!(
                    id = %self.id,
                    width = image.width,
                    height = image.height,
                    bytes = image.data.len(),
                    "bulk transfer complete"
                );
                *bulk = None;
                match &self.ctx.bulk_sink {
                    Some(sink) => sink.bulk_complete(&self.id, image),
                    None => debug!(id = %self.id, "no bulk sink attached, dropping image"),
                }
            }
            return Ok(());
        }

        if BulkTransfer::is_header(&payload) {
            let header = std::str::from_utf8(&payload)
                .map_err(|e| Error::framing(format!("bulk header is not UTF-8: {e}")))?;
            let transfer = BulkTransfer::from_header(header)?;
            debug!(
                id = %self.id,
                width = transfer.width(),
                height = transfer.height(),
                expected = transfer.expected(),
                "bulk transfer announced"
            );
            *bulk = Some(transfer);
            return Ok(());
        }

        self.record_command_response(
            String::new(),
            String::from_utf8_lossy(&payload).into_owned(),
        );
        Ok(())
    }

    fn touch(&self) {
        self.last_seen_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// UTC ISO-8601 with millisecond precision, the wire timestamp format.
pub(crate) fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
