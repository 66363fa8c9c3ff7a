//! WebSocket terminal endpoint.
//!
//! Each accepted socket gets a fresh connection ID and is bound to a
//! session for its whole lifetime. Binary frames carry raw terminal bytes
//! in both directions; text frames carry JSON control messages.

use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use protocol::messages::{Connected, ErrorCode, Exited, InputSource};
use protocol::{ServerMessage, PROTOCOL_VERSION};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::AppState;
use crate::orchestrator::OrchestratorEvent;
use crate::session::{Attachment, ProcessStatus, Terminal};

type WsSender = SplitSink<WebSocket, Message>;

/// Upgrades the request and runs the connection.
pub async fn ws_handler<T: Terminal>(
    ws: WebSocketUpgrade,
    State(state): State<AppState<T>>,
) -> impl IntoResponse {
    let connection_id = Uuid::new_v4().to_string();
    debug!(connection_id = %connection_id, "WebSocket upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, state, connection_id))
}

async fn handle_socket<T: Terminal>(socket: WebSocket, state: AppState<T>, connection_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut attachment = match state.sessions.connect(&connection_id).await {
        Ok(attachment) => attachment,
        Err(e) => {
            error!(connection_id = %connection_id, error = %e, "Failed to start terminal");
            state.emit(OrchestratorEvent::Error {
                message: format!("terminal unavailable for {}: {}", connection_id, e),
            });
            let message = ServerMessage::error(
                ErrorCode::TerminalUnavailable,
                format!("Failed to start terminal: {}", e),
            );
            let _ = send_control(&mut ws_tx, &message).await;
            close(&mut ws_tx, close_code::ERROR, "terminal unavailable").await;
            return;
        }
    };

    state.emit(OrchestratorEvent::ClientConnected {
        connection_id: connection_id.clone(),
    });

    let connected = ServerMessage::Connected(Connected {
        connection_id: connection_id.clone(),
        mode: state.sessions.mode().to_string(),
        protocol_version: PROTOCOL_VERSION,
    });

    let reason = if send_control(&mut ws_tx, &connected).await.is_err() {
        "send failed"
    } else {
        run_connection(&state, &mut attachment, &mut ws_tx, &mut ws_rx).await
    };

    state.sessions.disconnect(&connection_id).await;
    drop(attachment);

    info!(connection_id = %connection_id, reason = reason, "Client disconnected");
    state.emit(OrchestratorEvent::ClientDisconnected {
        connection_id,
        reason: reason.to_string(),
    });
}

/// Pumps output to the socket and input to the session until either side
/// goes away. Returns why the connection ended.
async fn run_connection<T: Terminal>(
    state: &AppState<T>,
    attachment: &mut Attachment<T>,
    ws_tx: &mut WsSender,
    ws_rx: &mut futures_util::stream::SplitStream<WebSocket>,
) -> &'static str {
    let connection_id = attachment.connection_id.clone();
    let mut output_done = false;

    loop {
        tokio::select! {
            // Process output -> WebSocket
            chunk = attachment.output.recv(), if !output_done => {
                match chunk {
                    Some(data) => {
                        if ws_tx.send(Message::Binary(data.to_vec())).await.is_err() {
                            return "send failed";
                        }
                    }
                    None if attachment.output.was_evicted() => {
                        warn!(connection_id = %connection_id, "Client fell behind output, closing");
                        let message = ServerMessage::error(
                            ErrorCode::OutputOverflow,
                            "Output buffer overflow",
                        );
                        let _ = send_control(ws_tx, &message).await;
                        close(ws_tx, close_code::POLICY, "output overflow").await;
                        return "output overflow";
                    }
                    None => {
                        output_done = true;
                        let exit_code = exit_code(attachment.session.terminal()).await;
                        info!(connection_id = %connection_id, exit_code = ?exit_code, "Terminal process exited");
                        let message = ServerMessage::Exited(Exited { exit_code });
                        if send_control(ws_tx, &message).await.is_err() {
                            return "send failed";
                        }
                    }
                }
            }

            // WebSocket input -> process
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if let Err(e) = state.router.route(&connection_id, &data, InputSource::Interactive).await {
                            warn!(connection_id = %connection_id, error = %e, "Failed to route input");
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        match state.router.dispatch_text(&connection_id, &text).await {
                            Ok(Some(reply)) => {
                                if send_control(ws_tx, &reply).await.is_err() {
                                    return "send failed";
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!(connection_id = %connection_id, error = %e, "Rejected client message");
                                let reply = ServerMessage::Error(e.to_error_message());
                                if send_control(ws_tx, &reply).await.is_err() {
                                    return "send failed";
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return "client closed",
                    Some(Ok(_)) => continue, // Ping/Pong handled automatically
                    Some(Err(e)) => {
                        debug!(connection_id = %connection_id, error = %e, "WebSocket error");
                        return "socket error";
                    }
                }
            }

            _ = state.shutdown.cancelled() => {
                debug!(connection_id = %connection_id, "WebSocket received shutdown signal, closing");
                close(ws_tx, close_code::AWAY, "server shutting down").await;
                return "server shutdown";
            }
        }
    }
}

/// Exit code of a process whose output just ended.
///
/// The output stream can end slightly before the exit status is
/// observable, so this polls briefly.
async fn exit_code<T: Terminal>(terminal: &T) -> Option<i32> {
    for _ in 0..20 {
        match terminal.try_wait().await {
            Ok(ProcessStatus::Running) => tokio::time::sleep(Duration::from_millis(25)).await,
            Ok(status) => return status.exit_code(),
            Err(e) => {
                debug!(error = %e, "Failed to read exit status");
                return None;
            }
        }
    }
    None
}

async fn send_control(ws_tx: &mut WsSender, message: &ServerMessage) -> Result<(), axum::Error> {
    let text = match message.to_json() {
        Ok(text) => text,
        Err(e) => {
            error!(error = %e, "Failed to encode control message");
            return Ok(());
        }
    };
    ws_tx.send(Message::Text(text)).await
}

async fn close(ws_tx: &mut WsSender, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = ws_tx.send(Message::Close(Some(frame))).await;
    let _ = ws_tx.flush().await;
}
