//! End-to-end integration tests for TermBridge.
//!
//! These tests verify complete flows against real shells:
//! - Server startup and shutdown
//! - WebSocket terminal sessions
//! - Command injection over HTTP
//! - Shared sessions

#![cfg(unix)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use daemon::config::Config;
use daemon::network::{build_router, AppState};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
use daemon::session::{PtyTerminal, SessionManager, SessionMode};
use futures_util::{SinkExt, StreamExt};
use protocol::messages::{ErrorCode, InjectRequest, InjectResponse};
use protocol::ServerMessage;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Create a test configuration listening on a free local port.
fn create_test_config(mode: SessionMode) -> Config {
    let mut config = Config::default();
    config.server.bind_address = "127.0.0.1".to_string();
    config.server.port = 0;
    config.session.mode = mode;
    config.session.default_shell = "/bin/sh".to_string();
    config
}

async fn start_server(config: Config) -> (DaemonOrchestrator, SocketAddr) {
    let mut orchestrator = DaemonOrchestrator::new(config).unwrap();
    orchestrator.start().await.unwrap();
    let addr = orchestrator.local_addr().unwrap();
    (orchestrator, addr)
}

/// Opens a socket and returns it with the announced connection ID.
async fn connect(addr: SocketAddr) -> (Client, String, String) {
    let (mut ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    match next_control(&mut ws).await {
        Some(ServerMessage::Connected(connected)) => {
            (ws, connected.connection_id, connected.mode)
        }
        other => panic!("expected connected message, got {:?}", other),
    }
}

/// Next text frame, decoded. Output frames are skipped.
async fn next_control(ws: &mut Client) -> Option<ServerMessage> {
    loop {
        match timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return ServerMessage::from_json(&text).ok(),
            Ok(Some(Ok(Message::Binary(_)))) => continue,
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            _ => return None,
        }
    }
}

/// Collects output until `needle` appears.
async fn read_output_until(ws: &mut Client, needle: &str) -> bool {
    let mut seen = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        match timeout(Duration::from_millis(200), ws.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => {
                seen.push_str(&String::from_utf8_lossy(&data));
                if seen.contains(needle) {
                    return true;
                }
            }
            Ok(Some(Ok(_))) | Err(_) => continue,
            Ok(Some(Err(_))) | Ok(None) => return false,
        }
    }
    false
}

async fn inject(addr: SocketAddr, request: &InjectRequest) -> (StatusCode, InjectResponse) {
    let response = reqwest::Client::new()
        .post(format!("http://{}/api/command", addr))
        .json(request)
        .send()
        .await
        .unwrap();
    let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
    (status, response.json().await.unwrap())
}

async fn wait_for_sessions(orchestrator: &DaemonOrchestrator, expected: usize) -> bool {
    for _ in 0..50 {
        if orchestrator.session_manager().session_count() == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

// =============================================================================
// Orchestrator Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_orchestrator_start_and_stop() {
    let (mut orchestrator, addr) = start_server(create_test_config(SessionMode::Dedicated)).await;
    assert_eq!(orchestrator.state().await, OrchestratorState::Running);

    let health: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["mode"], "dedicated");
    assert_eq!(health["sessions"], 0);

    orchestrator.stop().await.unwrap();
    assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);

    // The listener is gone.
    assert!(reqwest::get(format!("http://{}/health", addr)).await.is_err());
}

#[tokio::test]
async fn test_orchestrator_stop_when_already_stopped() {
    let mut orchestrator =
        DaemonOrchestrator::new(create_test_config(SessionMode::Dedicated)).unwrap();

    assert!(orchestrator.stop().await.is_ok());
}

// =============================================================================
// WebSocket Session Tests
// =============================================================================

#[tokio::test]
async fn test_websocket_interactive_roundtrip() {
    let (mut orchestrator, addr) = start_server(create_test_config(SessionMode::Dedicated)).await;
    let mut events = orchestrator.subscribe();

    let (mut ws, connection_id, mode) = connect(addr).await;
    assert!(!connection_id.is_empty());
    assert_eq!(mode, "dedicated");
    assert_eq!(orchestrator.session_manager().session_count(), 1);

    ws.send(Message::Binary(b"echo e2e_$((40+2))\n".to_vec()))
        .await
        .unwrap();
    assert!(read_output_until(&mut ws, "e2e_42").await);

    let mut saw_connect = false;
    while let Ok(event) = events.try_recv() {
        if event == (OrchestratorEvent::ClientConnected { connection_id: connection_id.clone() }) {
            saw_connect = true;
        }
    }
    assert!(saw_connect);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_websocket_text_input_message() {
    let (mut orchestrator, addr) = start_server(create_test_config(SessionMode::Dedicated)).await;
    let (mut ws, _, _) = connect(addr).await;

    let frame = r#"{"type":"input","data":"echo text_$((1+1))","source":"automation"}"#;
    ws.send(Message::Text(frame.to_string())).await.unwrap();
    assert!(read_output_until(&mut ws, "text_2").await);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_websocket_ping() {
    let (mut orchestrator, addr) = start_server(create_test_config(SessionMode::Dedicated)).await;
    let (mut ws, _, _) = connect(addr).await;

    ws.send(Message::Text(r#"{"type":"ping","timestamp":7}"#.to_string()))
        .await
        .unwrap();
    match next_control(&mut ws).await {
        Some(ServerMessage::Pong(pong)) => assert_eq!(pong.timestamp, 7),
        other => panic!("expected pong, got {:?}", other),
    }

    ws.send(Message::Text("garbage".to_string())).await.unwrap();
    match next_control(&mut ws).await {
        Some(ServerMessage::Error(err)) => assert_eq!(err.code, ErrorCode::InvalidMessage),
        other => panic!("expected error, got {:?}", other),
    }

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_websocket_disconnect_tears_down_session() {
    let (mut orchestrator, addr) = start_server(create_test_config(SessionMode::Dedicated)).await;

    let (mut ws, connection_id, _) = connect(addr).await;
    assert!(orchestrator.session_manager().lookup(&connection_id).is_some());

    ws.close(None).await.unwrap();

    assert!(wait_for_sessions(&orchestrator, 0).await);
    assert!(orchestrator.session_manager().lookup(&connection_id).is_none());

    // Injection into the closed session now fails.
    let (status, body) = inject(addr, &InjectRequest::new(connection_id, "ls")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(!body.success);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_websocket_process_exit() {
    let (mut orchestrator, addr) = start_server(create_test_config(SessionMode::Dedicated)).await;
    let (mut ws, connection_id, _) = connect(addr).await;

    ws.send(Message::Binary(b"exit 3\n".to_vec())).await.unwrap();
    match next_control(&mut ws).await {
        Some(ServerMessage::Exited(exited)) => assert_eq!(exited.exit_code, Some(3)),
        other => panic!("expected exited, got {:?}", other),
    }

    // Still registered until the client disconnects.
    assert!(orchestrator.session_manager().lookup(&connection_id).is_some());
    ws.close(None).await.unwrap();
    assert!(wait_for_sessions(&orchestrator, 0).await);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_websocket_spawn_failure() {
    let mut config = create_test_config(SessionMode::Dedicated);
    config.session.default_shell = "/nonexistent/shell".to_string();
    let (mut orchestrator, addr) = start_server(config).await;

    let (mut ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    match next_control(&mut ws).await {
        Some(ServerMessage::Error(err)) => assert_eq!(err.code, ErrorCode::TerminalUnavailable),
        other => panic!("expected terminal_unavailable, got {:?}", other),
    }

    let closed = timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                _ => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());
    assert_eq!(orchestrator.session_manager().session_count(), 0);

    orchestrator.stop().await.unwrap();
}

// =============================================================================
// Command Injection Tests
// =============================================================================

#[tokio::test]
async fn test_inject_reaches_terminal() {
    let (mut orchestrator, addr) = start_server(create_test_config(SessionMode::Dedicated)).await;
    let (mut ws, connection_id, _) = connect(addr).await;

    let (status, body) = inject(
        addr,
        &InjectRequest::new(connection_id, "echo injected_$((6*7))"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.success);
    assert_eq!(body.message, "Command sent to terminal");

    assert!(read_output_until(&mut ws, "injected_42").await);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_inject_validation_and_unknown_session() {
    let (mut orchestrator, addr) = start_server(create_test_config(SessionMode::Dedicated)).await;

    let (status, body) = inject(addr, &InjectRequest::new("no-such-connection", "ls")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(!body.success);

    let (status, body) = inject(addr, &InjectRequest::default()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!body.success);

    assert_eq!(orchestrator.session_manager().session_count(), 0);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_dedicated_sessions_are_isolated() {
    let (mut orchestrator, addr) = start_server(create_test_config(SessionMode::Dedicated)).await;
    let (mut ws1, id1, _) = connect(addr).await;
    let (mut ws2, id2, _) = connect(addr).await;
    assert_ne!(id1, id2);
    assert_eq!(orchestrator.session_manager().session_count(), 2);

    inject(addr, &InjectRequest::new(id1, "echo only_$((1+0))_one")).await;
    inject(addr, &InjectRequest::new(id2, "echo only_$((1+1))_two")).await;

    assert!(read_output_until(&mut ws1, "only_1_one").await);
    assert!(read_output_until(&mut ws2, "only_2_two").await);

    orchestrator.stop().await.unwrap();
}

// =============================================================================
// Shared Session Tests
// =============================================================================

#[tokio::test]
async fn test_shared_mode_broadcasts_to_all_clients() {
    let (mut orchestrator, addr) = start_server(create_test_config(SessionMode::Shared)).await;
    assert_eq!(orchestrator.session_manager().session_count(), 1);

    let (mut ws1, _, mode) = connect(addr).await;
    let (mut ws2, _, _) = connect(addr).await;
    assert_eq!(mode, "shared");
    assert_eq!(orchestrator.session_manager().session_count(), 1);

    let request = InjectRequest {
        connection_id: None,
        command: Some("echo shared_$((2*21))".to_string()),
    };
    let (status, _) = inject(addr, &request).await;
    assert_eq!(status, StatusCode::OK);

    assert!(read_output_until(&mut ws1, "shared_42").await);
    assert!(read_output_until(&mut ws2, "shared_42").await);

    // One client leaving does not end the shared process.
    ws1.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(orchestrator.session_manager().session_count(), 1);

    ws2.send(Message::Binary(b"echo still_$((3+3))\n".to_vec()))
        .await
        .unwrap();
    assert!(read_output_until(&mut ws2, "still_6").await);

    orchestrator.stop().await.unwrap();
    assert_eq!(orchestrator.session_manager().session_count(), 0);
}

// =============================================================================
// Router Tests
// =============================================================================

#[tokio::test]
async fn test_router_without_listener() {
    let config = create_test_config(SessionMode::Dedicated);
    let sessions: Arc<SessionManager<PtyTerminal>> =
        Arc::new(SessionManager::from_config(&config.session));
    let (events, _) = broadcast::channel(16);
    let state = AppState::new(sessions, events, CancellationToken::new());
    let app = build_router(state, &config.server);

    let response = app
        .clone()
        .oneshot(Request::get("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(Request::get("/missing").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_static_dir_fallback() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>terminal</h1>").unwrap();

    let mut config = create_test_config(SessionMode::Dedicated);
    config.server.static_dir = Some(dir.path().to_path_buf());
    let sessions: Arc<SessionManager<PtyTerminal>> =
        Arc::new(SessionManager::from_config(&config.session));
    let (events, _) = broadcast::channel(16);
    let app = build_router(
        AppState::new(sessions, events, CancellationToken::new()),
        &config.server,
    );

    let response = app
        .clone()
        .oneshot(Request::get("/index.html").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"<h1>terminal</h1>");

    let response = app
        .oneshot(Request::get("/nope.js").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
