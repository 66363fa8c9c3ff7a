//! Input router.
//!
//! This module provides the [`InputRouter`] that receives input from a
//! connection or from the command gateway, resolves the target session and
//! writes the bytes to its process. The origin of the input decides the
//! framing: interactive input is forwarded byte for byte, automation input
//! is submitted as a line.

use std::borrow::Cow;
use std::sync::Arc;

use protocol::messages::{ClientMessage, ErrorCode, ErrorMessage, InputSource, Pong};
use protocol::ServerMessage;
use tracing::{debug, warn};

use crate::session::{PtyTerminal, SessionError, SessionManager, Terminal};

/// Line terminator appended to automation input.
pub const LINE_TERMINATOR: u8 = b'\n';

/// Result type for message dispatch: an optional reply for the sender.
pub type RouterResult = Result<Option<ServerMessage>, RouterError>;

/// Errors that can occur during input routing.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Session-related error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RouterError {
    /// Convert the error to a protocol error message.
    pub fn to_error_message(&self) -> ErrorMessage {
        let code = match self {
            RouterError::InvalidRequest(_) => ErrorCode::InvalidMessage,
            RouterError::Session(_) => ErrorCode::Internal,
        };

        ErrorMessage {
            code,
            message: self.to_string(),
        }
    }
}

/// What happened to a piece of routed input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The bytes were written to the process.
    Written {
        /// Number of bytes written, including any appended terminator.
        bytes: usize,
    },
    /// No session is registered for the connection; the input was dropped.
    NoSession,
    /// The process has terminated; the input was dropped.
    ProcessClosed,
}

impl Delivery {
    /// Whether the input reached the process.
    pub fn is_written(&self) -> bool {
        matches!(self, Delivery::Written { .. })
    }
}

/// Routes input to the session bound to a connection.
pub struct InputRouter<T: Terminal = PtyTerminal> {
    sessions: Arc<SessionManager<T>>,
}

impl<T: Terminal> Clone for InputRouter<T> {
    fn clone(&self) -> Self {
        Self {
            sessions: Arc::clone(&self.sessions),
        }
    }
}

impl<T: Terminal> InputRouter<T> {
    /// Creates a router over the given session manager.
    pub fn new(sessions: Arc<SessionManager<T>>) -> Self {
        Self { sessions }
    }

    /// The session manager this router resolves sessions with.
    pub fn sessions(&self) -> &Arc<SessionManager<T>> {
        &self.sessions
    }

    /// Applies origin framing to a payload.
    pub fn frame(payload: &[u8], origin: InputSource) -> Cow<'_, [u8]> {
        match origin {
            InputSource::Interactive => Cow::Borrowed(payload),
            InputSource::Automation => {
                let mut framed = Vec::with_capacity(payload.len() + 1);
                framed.extend_from_slice(payload);
                framed.push(LINE_TERMINATOR);
                Cow::Owned(framed)
            }
        }
    }

    /// Writes input to the session bound to `connection_id`.
    ///
    /// Input for a missing session or a terminated process is dropped and
    /// reported through [`Delivery`]; only unexpected write failures are
    /// returned as errors.
    pub async fn route(
        &self,
        connection_id: &str,
        payload: &[u8],
        origin: InputSource,
    ) -> Result<Delivery, RouterError> {
        let Some(session) = self.sessions.lookup(connection_id) else {
            warn!(
                connection_id = %connection_id,
                ?origin,
                bytes = payload.len(),
                "Dropping input for unknown session"
            );
            return Ok(Delivery::NoSession);
        };

        let framed = Self::frame(payload, origin);
        match session.terminal().write(&framed).await {
            Ok(()) => {
                debug!(
                    connection_id = %connection_id,
                    ?origin,
                    bytes = framed.len(),
                    "Routed input"
                );
                Ok(Delivery::Written {
                    bytes: framed.len(),
                })
            }
            Err(SessionError::ProcessClosed) => {
                debug!(connection_id = %connection_id, "Dropping input for closed process");
                Ok(Delivery::ProcessClosed)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Handles a decoded control message from a connection.
    pub async fn dispatch(&self, connection_id: &str, message: ClientMessage) -> RouterResult {
        match message {
            ClientMessage::Input(input) => {
                self.route(connection_id, input.data.as_bytes(), input.source)
                    .await?;
                Ok(None)
            }
            ClientMessage::Ping(ping) => {
                debug!(timestamp = ping.timestamp, "Received ping");
                Ok(Some(ServerMessage::Pong(Pong {
                    timestamp: ping.timestamp,
                })))
            }
        }
    }

    /// Decodes and handles a text frame.
    pub async fn dispatch_text(&self, connection_id: &str, text: &str) -> RouterResult {
        let message = ClientMessage::from_json(text)
            .map_err(|e| RouterError::InvalidRequest(e.to_string()))?;
        self.dispatch(connection_id, message).await
    }
}
