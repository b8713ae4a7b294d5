//! warden server binary entry point.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use warden_server::cli::Cli;
use warden_server::{ServerCore, ServerEvent};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(message) = cli.validate() {
        eprintln!("{message}");
        std::process::exit(2);
    }

    if let Err(e) = warden_core::init_logging(
        cli.verbose,
        cli.log_file.as_deref(),
        cli.log_format.into(),
    ) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "warden-server starting");

    let server = Arc::new(ServerCore::new(cli.server_config()));

    // Surface lifecycle events in the log; a GUI or control socket would
    // subscribe the same way.
    let mut events = server.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    match server.start(cli.socket_addr()).await {
        Ok(addr) => info!(%addr, "listening"),
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown requested");
    server.stop().await;
}

fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::ServerStarted { addr } => info!(%addr, "event: server started"),
        ServerEvent::ServerStopped => info!("event: server stopped"),
        ServerEvent::ClientConnected { session } => {
            info!(id = %session.id, remote = %session.remote_addr, "event: client connected");
        }
        ServerEvent::ClientDisconnected { id } => info!(%id, "event: client disconnected"),
        ServerEvent::CommandExecuted {
            id,
            command,
            response,
        } => {
            info!(%id, %command, response_len = response.len(), "event: command executed");
        }
    }
}
