//! Session management module.
//!
//! This module provides PTY spawning, output fan-out, the session registry
//! and the connect/disconnect lifecycle that ties them to connections.

pub mod manager;
#[cfg(test)]
pub(crate) mod mock;
pub mod multiplexer;
pub mod pty;
pub mod registry;

pub use manager::{Attachment, SessionManager, DEFAULT_MAX_SESSIONS};
pub use multiplexer::{
    OutputBroadcaster, OutputSubscription, SubscriberId, SubscriberStats,
    DEFAULT_SUBSCRIBER_CAPACITY,
};
pub use pty::{
    detect_shell, ConnectionId, ProcessStatus, PtyTerminal, SessionError, SpawnOptions, Terminal,
};
pub use registry::{Session, SessionMode, SessionRegistry, SHARED_SESSION_KEY};
