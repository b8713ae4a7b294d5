//! Protocol and configuration constants for warden.

use std::time::Duration;

// =============================================================================
// Protocol Constants
// =============================================================================

/// Protocol version advertised in the handshake frame.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Length of the binary frame header: `[i32 type LE][i32 length LE]`.
pub const BINARY_HEADER_LEN: usize = 8;

/// Maximum frame payload size (10 MiB).
///
/// A binary header declaring more than this is unrecoverable: the framing
/// has no resync point, so the connection must be closed.
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Prefix of a bulk-transfer announcement line (`SCREEN_IMAGE:<w>:<h>:<size>`).
pub const BULK_HEADER_PREFIX: &str = "SCREEN_IMAGE";

/// Maximum width or height accepted in a bulk-transfer header.
pub const MAX_BULK_DIMENSION: u32 = 16_384;

/// Number of hex characters in a session id.
pub const SESSION_ID_LEN: usize = 8;

// =============================================================================
// Timing Constants
// =============================================================================

/// Interval between heartbeat sweeps over the session registry.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Bounded grace period for in-flight session shutdowns during server stop.
/// Sessions still open afterwards are abandoned rather than blocking shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// =============================================================================
// Buffer Constants
// =============================================================================

/// Read buffer chunk size for session read loops.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the lifecycle event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
