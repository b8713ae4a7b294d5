//! Wire protocol for warden: message types, frame codecs, and bulk reassembly.
//!
//! Two framing disciplines coexist, fixed per listener (never negotiated):
//!
//! - **Text**: UTF-8 JSON objects terminated by `\n`, discriminated by a
//!   `"Type"` field.
//! - **Binary**: `[i32 type LE][i32 length LE]` header followed by `length`
//!   payload bytes, used for a parallel command channel and chunked bulk
//!   transfer.

pub mod bulk;
pub mod codec;
pub mod message;
pub mod types;

pub use bulk::{BulkImage, BulkTransfer};
pub use codec::{BinaryCodec, BinaryFrame, TextCodec};
pub use message::{
    AgentMessage, CommandPayload, CommandResponsePayload, ErrorPayload, HandshakePayload,
    HeartbeatPayload, HeartbeatResponsePayload, ServerMessage, SystemInfoPayload,
};
pub use types::{AgentMetadata, BinaryType, Framing, SessionId, SessionStatus, SessionSummary};
