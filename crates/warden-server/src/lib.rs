//! warden-server: TCP control server for remote agents.
//!
//! Provides:
//! - Per-session read/write state machines over both framing disciplines
//! - Concurrent session registry
//! - Heartbeat-driven liveness sweeps
//! - Server lifecycle, command dispatch, broadcast, and lifecycle events

pub mod cli;
pub mod events;
pub mod monitor;
pub mod registry;
pub mod server;
pub mod session;

pub use events::{EventBus, ServerEvent};
pub use registry::SessionRegistry;
pub use server::{ServerConfig, ServerCore, ServerStats};
pub use session::{BulkSink, ClientSession};
