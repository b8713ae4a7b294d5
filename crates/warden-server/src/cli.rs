//! Server CLI implementation.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};

use warden_core::protocol::Framing;
use warden_core::LogFormat;

use crate::server::ServerConfig;

/// Log output format for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => LogFormat::Text,
            CliLogFormat::Json => LogFormat::Json,
        }
    }
}

/// Wire framing discipline for the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum FramingArg {
    /// Newline-delimited JSON frames.
    #[default]
    Text,
    /// Length-prefixed binary frames.
    Binary,
}

impl From<FramingArg> for Framing {
    fn from(arg: FramingArg) -> Self {
        match arg {
            FramingArg::Text => Framing::Text,
            FramingArg::Binary => Framing::Binary,
        }
    }
}

/// warden server - TCP control endpoint for remote agents.
#[derive(Debug, Parser)]
#[command(
    name = "warden-server",
    version,
    about = "warden server - TCP control endpoint for remote agents"
)]
pub struct Cli {
    /// Address to listen on
    #[arg(short = 'b', long = "bind", default_value = "0.0.0.0")]
    pub bind_addr: IpAddr,

    /// Port to listen on
    #[arg(short = 'p', long = "port", default_value = "8443")]
    pub port: u16,

    /// Wire framing discipline (fixed per listener, never negotiated)
    #[arg(long = "framing", value_enum, default_value = "text")]
    pub framing: FramingArg,

    /// Identifier advertised in handshake frames
    #[arg(long = "server-id", default_value = "warden")]
    pub server_id: String,

    /// Seconds between heartbeat sweeps
    #[arg(long = "heartbeat-interval", default_value = "30", value_name = "SECONDS")]
    pub heartbeat_interval: u64,

    /// Seconds to wait for session shutdowns before abandoning them
    #[arg(long = "shutdown-grace", default_value = "5", value_name = "SECONDS")]
    pub shutdown_grace: u64,

    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,

    /// Log to file instead of stderr
    #[arg(long = "log-file", value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value = "text")]
    pub log_format: CliLogFormat,
}

impl Cli {
    /// The socket address to bind.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    /// Reject zero-valued intervals before they reach the timer layer.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval == 0 {
            return Err("--heartbeat-interval must be at least 1 second".to_string());
        }
        if self.shutdown_grace == 0 {
            return Err("--shutdown-grace must be at least 1 second".to_string());
        }
        Ok(())
    }

    /// Build the server configuration from the parsed arguments.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            server_id: self.server_id.clone(),
            framing: self.framing.into(),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval),
            shutdown_grace: Duration::from_secs(self.shutdown_grace),
        }
    }
}

/// Default bind address when none is given.
pub const DEFAULT_BIND: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
