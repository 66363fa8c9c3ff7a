//! Command gateway.
//!
//! Synchronous entry point for automation: resolve a session by connection
//! ID and submit one command to it through the [`InputRouter`].

use protocol::messages::{InjectRequest, InjectResponse, InputSource};
use thiserror::Error;

use crate::router::{Delivery, InputRouter, RouterError};
use crate::session::{PtyTerminal, SessionMode, Terminal, SHARED_SESSION_KEY};

/// Errors surfaced by [`CommandGateway::inject`].
#[derive(Error, Debug)]
pub enum GatewayError {
    /// A required field is missing or empty.
    #[error("{0}")]
    InvalidRequest(String),

    /// No session is registered under the given ID.
    #[error("No active session found for connection ID: {0}")]
    SessionNotFound(String),

    /// The write failed unexpectedly.
    #[error("failed to send command: {0}")]
    Internal(#[from] RouterError),
}

/// Injects commands into running sessions.
pub struct CommandGateway<T: Terminal = PtyTerminal> {
    router: InputRouter<T>,
}

impl<T: Terminal> Clone for CommandGateway<T> {
    fn clone(&self) -> Self {
        Self {
            router: self.router.clone(),
        }
    }
}

impl<T: Terminal> CommandGateway<T> {
    /// Creates a gateway that writes through `router`.
    pub fn new(router: InputRouter<T>) -> Self {
        Self { router }
    }

    /// Submits `request.command` to the session of `request.connection_id`.
    ///
    /// The command is written with a line terminator. Output is not
    /// captured; success means the bytes reached the process.
    pub async fn inject(&self, request: &InjectRequest) -> Result<InjectResponse, GatewayError> {
        let command = match request.command.as_deref() {
            Some(command) if !command.is_empty() => command,
            _ => {
                return Err(GatewayError::InvalidRequest(
                    "Missing required fields: connectionId and command".to_string(),
                ))
            }
        };

        let connection_id = match self.router.sessions().mode() {
            SessionMode::Shared => SHARED_SESSION_KEY,
            SessionMode::Dedicated => match request.connection_id.as_deref() {
                Some(id) if !id.is_empty() => id,
                _ => {
                    return Err(GatewayError::InvalidRequest(
                        "Missing required fields: connectionId and command".to_string(),
                    ))
                }
            },
        };

        match self
            .router
            .route(connection_id, command.as_bytes(), InputSource::Automation)
            .await?
        {
            Delivery::Written { .. } => {
                tracing::info!(connection_id = %connection_id, "Injected command");
                Ok(InjectResponse {
                    success: true,
                    message: "Command sent to terminal".to_string(),
                })
            }
            Delivery::NoSession | Delivery::ProcessClosed => {
                Err(GatewayError::SessionNotFound(connection_id.to_string()))
            }
        }
    }
}
