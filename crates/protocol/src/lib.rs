//! # TermBridge Protocol Library
//!
//! This crate defines the messages exchanged between the TermBridge daemon
//! and its clients.
//!
//! ## Overview
//!
//! TermBridge streams interactive shell sessions over a WebSocket. Two kinds
//! of frames travel on the socket:
//!
//! - **Binary frames** carry raw terminal bytes: keystrokes from the client,
//!   process output from the server.
//! - **Text frames** carry JSON control messages ([`ClientMessage`] and
//!   [`ServerMessage`]).
//!
//! A separate HTTP endpoint accepts [`InjectRequest`] bodies so that an
//! external caller can submit a command to a running session, answered
//! with an [`InjectResponse`].
//!
//! ```text
//! ┌──────────┐   binary: keystrokes / text: {"type":"input",..}   ┌──────────┐
//! │  client  │ ─────────────────────────────────────────────────▶ │  daemon  │
//! │          │ ◀───────────────────────────────────────────────── │          │
//! └──────────┘   binary: output / text: {"type":"connected",..}   └──────────┘
//!                                                                      ▲
//!              POST /api/command {"connectionId","command"}            │
//!  automation ─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientMessage, InputSource};
//!
//! let msg = ClientMessage::from_json(r#"{"type":"input","data":"ls\n"}"#).unwrap();
//! match msg {
//!     ClientMessage::Input(input) => {
//!         assert_eq!(input.data, "ls\n");
//!         assert_eq!(input.source, InputSource::Interactive);
//!     }
//!     _ => unreachable!(),
//! }
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Socket and HTTP message definitions
//! - [`error`]: Error types

pub mod error;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    ClientMessage, Connected, ErrorCode, ErrorMessage, Exited, InjectRequest, InjectResponse,
    InputData, InputSource, Ping, Pong, ServerMessage, DEFAULT_COLS, DEFAULT_ROWS,
    PROTOCOL_VERSION,
};
