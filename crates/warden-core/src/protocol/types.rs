//! Protocol-level identifier and state types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::SESSION_ID_LEN;

// =============================================================================
// Session Identity
// =============================================================================

/// Stable session identifier, generated at accept time.
///
/// Eight uppercase hex characters: unique enough for a registry scoped to one
/// server process, short enough for operators to type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        SessionId(format!("{:08X}", rand::random::<u32>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        SessionId(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        SessionId(s)
    }
}

// =============================================================================
// Session Status
// =============================================================================

/// Session connection status.
///
/// Transitions are one-way: `Connecting → Online → Disconnecting → Closed`.
/// `Closed` is terminal and re-entry is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum SessionStatus {
    /// Accepted, handshake not yet written.
    Connecting = 0,
    /// Handshake written, read loop running.
    Online = 1,
    /// Teardown in progress.
    Disconnecting = 2,
    /// Socket closed, resources released.
    Closed = 3,
}

impl SessionStatus {
    /// Check whether the session can still carry traffic.
    pub fn is_open(&self) -> bool {
        matches!(self, SessionStatus::Connecting | SessionStatus::Online)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode a status stored in an atomic. Out-of-range values collapse to
    /// `Closed`, the safe terminal state.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionStatus::Connecting,
            1 => SessionStatus::Online,
            2 => SessionStatus::Disconnecting,
            _ => SessionStatus::Closed,
        }
    }
}

// =============================================================================
// Framing Discipline
// =============================================================================

/// Which wire framing a listener (and every session it accepts) speaks.
///
/// The two encodings are disjoint and not self-describing across each other,
/// so the discipline is fixed by server role, never negotiated per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// Newline-delimited JSON.
    #[default]
    Text,
    /// Length-prefixed binary frames.
    Binary,
}

// =============================================================================
// Binary Frame Type Codes
// =============================================================================

/// Discriminator codes for binary frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum BinaryType {
    /// Server → agent command envelope.
    Command = 0,
    /// Agent → server response. Carries command output, a bulk-transfer
    /// header line, or a raw bulk chunk while a transfer is active.
    Response = 1,
    /// Agent → server error report.
    Error = 2,
}

impl BinaryType {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(BinaryType::Command),
            1 => Some(BinaryType::Response),
            2 => Some(BinaryType::Error),
            _ => None,
        }
    }
}

// =============================================================================
// Agent Metadata & Summaries
// =============================================================================

/// Fields reported by a `system_info` message. Absent until received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub os: String,
    pub computer_name: String,
    pub user_name: String,
    pub agent_version: String,
}

/// Point-in-time view of one session, for the operator surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub remote_addr: String,
    pub status: SessionStatus,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Last measured heartbeat round-trip, milliseconds, clamped to >= 0.
    pub ping_ms: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub commands_executed: u64,
    pub metadata: Option<AgentMetadata>,
}
