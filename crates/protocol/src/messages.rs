//! Protocol message definitions for TermBridge.
//!
//! Control messages are JSON objects with a `type` discriminator and travel
//! as WebSocket text frames. Terminal bytes travel as binary frames and have
//! no envelope.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Current protocol version, announced in [`Connected`].
pub const PROTOCOL_VERSION: u8 = 1;

/// Default terminal width for new sessions.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height for new sessions.
pub const DEFAULT_ROWS: u16 = 30;

// ============================================================================
// Client -> Server
// ============================================================================

/// Messages a client sends as text frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Terminal input, optionally tagged with its origin.
    Input(InputData),
    /// Keepalive.
    Ping(Ping),
}

/// Where a piece of input came from.
///
/// Interactive input is forwarded byte for byte. Automation input is a
/// complete command and is submitted with a trailing line terminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    /// Raw keystrokes typed by a user.
    #[default]
    Interactive,
    /// A command submitted by a script or the injection endpoint.
    Automation,
}

/// Terminal input carried in a text frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputData {
    /// The input text.
    pub data: String,
    /// Origin of the input; absent means interactive.
    #[serde(default)]
    pub source: InputSource,
}

/// Ping for keepalive and latency measurement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Client timestamp, echoed back in the pong.
    #[serde(default)]
    pub timestamp: u64,
}

impl ClientMessage {
    /// Decode a client message from a text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Err(ProtocolError::InvalidMessage("empty frame".to_string()));
        }
        Ok(serde_json::from_str(text)?)
    }

    /// Encode the message as JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Server -> Client
// ============================================================================

/// Messages the server sends as text frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The connection is bound to a terminal.
    Connected(Connected),
    /// The terminal process ended; no more output follows.
    Exited(Exited),
    /// Something went wrong for this connection.
    Error(ErrorMessage),
    /// Response to a ping.
    Pong(Pong),
}

/// Sent once after the connection is bound to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connected {
    /// Identifier to pass to the injection endpoint.
    pub connection_id: String,
    /// Session mode the server runs in (`dedicated` or `shared`).
    pub mode: String,
    /// Protocol version spoken by the server.
    pub protocol_version: u8,
}

/// Process exit notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exited {
    /// Exit code if known.
    pub exit_code: Option<i32>,
}

/// Error notification for the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
}

/// Error codes sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The terminal process could not be started.
    TerminalUnavailable,
    /// A text frame could not be understood.
    InvalidMessage,
    /// The client fell too far behind the output stream.
    OutputOverflow,
    /// Unexpected server-side failure.
    Internal,
}

/// Pong response to ping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    /// Timestamp copied from the ping.
    pub timestamp: u64,
}

impl ServerMessage {
    /// Build an error message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorMessage {
            code,
            message: message.into(),
        })
    }

    /// Decode a server message from a text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode the message as JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Injection endpoint
// ============================================================================

/// Body of `POST /api/command`.
///
/// Both fields are optional at the wire level so that missing fields can be
/// reported as a validation failure rather than a parse failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectRequest {
    /// Target connection. Not required when the server runs a shared session.
    #[serde(default, alias = "socketId")]
    pub connection_id: Option<String>,
    /// Command text; a line terminator is appended on submission.
    #[serde(default)]
    pub command: Option<String>,
}

impl InjectRequest {
    /// Convenience constructor for a targeted injection.
    pub fn new(connection_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            connection_id: Some(connection_id.into()),
            command: Some(command.into()),
        }
    }
}

/// Response of `POST /api/command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectResponse {
    /// Whether the command was written to the session.
    pub success: bool,
    /// Confirmation or failure reason.
    pub message: String,
}
