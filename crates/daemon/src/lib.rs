//! # TermBridge Server Library
//!
//! This crate exposes interactive shell sessions over the network: every
//! WebSocket client is bound to a live pseudo-terminal process, and an
//! HTTP endpoint lets automation inject commands into a running session.
//!
//! ## Overview
//!
//! - **Session Management**: spawn PTY processes, fan their output out to
//!   subscribers, and tie their lifetime to connections
//! - **Input Routing**: forward interactive keystrokes byte for byte and
//!   submit automation commands as lines
//! - **Command Gateway**: resolve a session by connection ID and inject a
//!   command synchronously
//! - **Network**: axum HTTP routes and the WebSocket terminal endpoint
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────┐     ┌───────────────────────────┐  │
//! │  │  WebSocket  /ws     │     │  POST /api/command        │  │
//! │  └─────────┬───────────┘     └─────────────┬─────────────┘  │
//! │            │                    Command Gateway             │
//! │            ▼                               ▼                │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │                     Input Router                      │  │
//! │  └───────────────────────────┬───────────────────────────┘  │
//! │  ┌───────────────────────────▼───────────────────────────┐  │
//! │  │   Session Manager ── Registry ── PTY ── Output Fan-out │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Serving until told to stop...
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY processes, output fan-out, registry and lifecycle
//! - [`router`]: Origin-aware input routing
//! - [`gateway`]: Command injection
//! - [`network`]: HTTP and WebSocket handlers
//! - [`orchestrator`]: Server lifecycle

pub mod config;
pub mod gateway;
pub mod network;
pub mod orchestrator;
pub mod router;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::{Config, ConfigError, EnvOverride};

// Re-export session types for convenience
pub use session::{
    Attachment, PtyTerminal, Session, SessionError, SessionManager, SessionMode,
    SessionRegistry, SpawnOptions, Terminal, SHARED_SESSION_KEY,
};

// Re-export routing types for convenience
pub use gateway::{CommandGateway, GatewayError};
pub use router::{Delivery, InputRouter, RouterError, RouterResult};

// Re-export network types for convenience
pub use network::{build_router, ApiError, AppState};

// Re-export orchestrator types for convenience
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
