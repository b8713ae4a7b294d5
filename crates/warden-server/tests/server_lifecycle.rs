//! Server lifecycle: start/stop transitions, shutdown grace, registry
//! convergence, and disconnect idempotence.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

use warden_core::protocol::Framing;
use warden_core::Error;
use warden_server::session::SessionContext;
use warden_server::{ClientSession, EventBus, ServerConfig, ServerCore, ServerEvent};

const WAIT: Duration = Duration::from_secs(5);

fn test_config() -> ServerConfig {
    ServerConfig {
        server_id: "test-server".to_string(),
        framing: Framing::Text,
        heartbeat_interval: Duration::from_secs(60),
        shutdown_grace: Duration::from_secs(5),
    }
}

async fn start_server() -> (Arc<ServerCore>, SocketAddr) {
    let server = Arc::new(ServerCore::new(test_config()));
    let addr = server
        .start("127.0.0.1:0".parse().unwrap())
        .await
        .expect("server should bind an ephemeral port");
    (server, addr)
}

/// Connect a client and consume the handshake, which guarantees the session
/// is registered.
async fn connect_and_handshake(addr: SocketAddr) -> BufReader<TcpStream> {
    let stream = TcpStream::connect(addr).await.expect("connect");
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    timeout(WAIT, reader.read_line(&mut line))
        .await
        .expect("handshake within deadline")
        .expect("handshake read");
    assert!(line.contains("handshake"));
    reader
}

async fn next_event(
    rx: &mut broadcast::Receiver<ServerEvent>,
    mut pred: impl FnMut(&ServerEvent) -> bool,
) -> ServerEvent {
    loop {
        let event = timeout(WAIT, rx.recv())
            .await
            .expect("event within deadline")
            .expect("event channel open");
        if pred(&event) {
            return event;
        }
    }
}

#[tokio::test]
async fn start_reports_the_bound_address() {
    let (server, addr) = start_server().await;
    assert!(server.is_running());
    assert_eq!(server.local_addr(), Some(addr));
    assert_ne!(addr.port(), 0);

    let stats = server.stats().await;
    assert!(stats.running);
    assert_eq!(stats.sessions, 0);
    assert!(stats.started_at.is_some());

    server.stop().await;
    assert!(!server.is_running());
    assert_eq!(server.local_addr(), None);
}

#[tokio::test]
async fn second_start_fails_while_running() {
    let (server, _addr) = start_server().await;
    let err = server
        .start("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyRunning));
    server.stop().await;
}

#[tokio::test]
async fn bind_conflict_surfaces_and_leaves_the_server_stopped() {
    let (first, addr) = start_server().await;

    let second = ServerCore::new(test_config());
    let err = second.start(addr).await.unwrap_err();
    assert!(matches!(err, Error::Bind { .. }));
    assert!(!second.is_running());

    // The failed start must not poison the lifecycle.
    let other = second.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
    assert_ne!(other, addr);
    second.stop().await;
    first.stop().await;
}

#[tokio::test]
async fn server_restarts_after_stop() {
    let (server, _addr) = start_server().await;
    server.stop().await;

    let addr = server.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let _client = connect_and_handshake(addr).await;
    assert_eq!(server.list_sessions().await.len(), 1);
    server.stop().await;
}

#[tokio::test]
async fn registry_tracks_open_sessions_with_distinct_ids() {
    let (server, addr) = start_server().await;

    let mut clients = Vec::new();
    for _ in 0..8 {
        clients.push(connect_and_handshake(addr).await);
    }

    let sessions = server.list_sessions().await;
    assert_eq!(sessions.len(), 8);
    let ids: std::collections::HashSet<_> =
        sessions.iter().map(|s| s.id.clone()).collect();
    assert_eq!(ids.len(), 8);
    assert_eq!(server.stats().await.sessions, 8);

    server.stop().await;
}

#[tokio::test]
async fn stop_disconnects_every_session_exactly_once() {
    let (server, addr) = start_server().await;

    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(connect_and_handshake(addr).await);
    }
    let mut events = server.subscribe();

    let started = tokio::time::Instant::now();
    server.stop().await;
    assert!(
        started.elapsed() <= test_config().shutdown_grace + Duration::from_secs(1),
        "stop must complete within the grace period"
    );

    // Drain up to the ServerStopped marker and count disconnect events.
    let mut disconnects = 0;
    loop {
        match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            ServerEvent::ClientDisconnected { .. } => disconnects += 1,
            ServerEvent::ServerStopped => break,
            _ => {}
        }
    }
    assert_eq!(disconnects, 5);
    assert!(server.list_sessions().await.is_empty());
}

#[tokio::test]
async fn stop_notifies_sessions_whose_send_path_is_saturated() {
    let server = Arc::new(ServerCore::new(ServerConfig {
        shutdown_grace: Duration::from_millis(500),
        ..test_config()
    }));
    let addr = server
        .start("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();

    // The client never reads after the handshake, so writes eventually park
    // on a full socket while holding the session's writer lock.
    let _client = connect_and_handshake(addr).await;
    let id = server.list_sessions().await[0].id.clone();

    let payload = "x".repeat(1 << 20);
    let sender = Arc::clone(&server);
    let target = id.clone();
    tokio::spawn(async move {
        while sender.send_command(&target, &payload).await.is_ok() {}
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut events = server.subscribe();
    let started = tokio::time::Instant::now();
    server.stop().await;
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "stop must not hang on the blocked write"
    );

    // The grace expiry abandons the blocked teardown, but the notification
    // must already be out.
    let mut disconnects = 0;
    loop {
        match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            ServerEvent::ClientDisconnected { id: got } => {
                assert_eq!(got, id);
                disconnects += 1;
            }
            ServerEvent::ServerStopped => break,
            _ => {}
        }
    }
    assert_eq!(
        disconnects, 1,
        "the abandoned session must still fire ClientDisconnected"
    );
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (server, _addr) = start_server().await;
    let mut events = server.subscribe();

    server.stop().await;
    server.stop().await;

    let first = next_event(&mut events, |e| matches!(e, ServerEvent::ServerStopped)).await;
    assert_eq!(first, ServerEvent::ServerStopped);
    // A second teardown would have emitted a second marker.
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn disconnect_session_is_observable_once() {
    let (server, addr) = start_server().await;
    let _client = connect_and_handshake(addr).await;
    let mut events = server.subscribe();

    let id = server.list_sessions().await[0].id.clone();
    server.disconnect_session(&id).await.unwrap();

    let event = next_event(&mut events, |e| {
        matches!(e, ServerEvent::ClientDisconnected { .. })
    })
    .await;
    assert_eq!(event, ServerEvent::ClientDisconnected { id: id.clone() });
    assert!(server.list_sessions().await.is_empty());

    // The id is gone; a second operator action fails cleanly.
    let err = server.disconnect_session(&id).await.unwrap_err();
    assert!(matches!(err, Error::UnknownClient(_)));

    server.stop().await;
}

#[tokio::test]
async fn concurrent_disconnects_fire_one_event() {
    // Drive a session directly so both disconnect calls race on the same
    // handle, without the accept loop in between.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).await.unwrap();
    let (stream, remote_addr) = listener.accept().await.unwrap();

    let events = EventBus::default();
    let mut rx = events.subscribe();
    let ctx = SessionContext {
        framing: Framing::Text,
        server_id: "test-server".to_string(),
        events,
        bulk_sink: None,
    };
    let session = Arc::new(ClientSession::new(stream, remote_addr, ctx));

    tokio::join!(session.disconnect(), session.disconnect());
    session.disconnect().await;

    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert!(matches!(event, ServerEvent::ClientDisconnected { .. }));
    assert!(rx.try_recv().is_err(), "disconnect must notify exactly once");

    drop(client);
}
