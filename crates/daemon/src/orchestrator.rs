//! Server orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that initializes and
//! coordinates the server subsystems: session management, input routing,
//! the command gateway and the HTTP/WebSocket listener.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::network::{build_router, AppState};
use crate::session::{PtyTerminal, SessionManager, Terminal};

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A client connected and was bound to a session.
    ClientConnected { connection_id: String },
    /// A client went away and its session was torn down.
    ClientDisconnected {
        connection_id: String,
        reason: String,
    },
    /// Error occurred.
    Error { message: String },
}

/// Server orchestrator that manages all subsystems.
pub struct DaemonOrchestrator<T: Terminal = PtyTerminal> {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Session manager for terminal sessions.
    session_manager: Arc<SessionManager<T>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
    /// Address the listener is bound to, once running.
    local_addr: Option<SocketAddr>,
    /// The HTTP server task.
    server_task: Option<JoinHandle<()>>,
}

impl DaemonOrchestrator<PtyTerminal> {
    /// Creates a new orchestrator backed by native pseudo-terminals.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_terminal(config)
    }
}

impl<T: Terminal> DaemonOrchestrator<T> {
    /// Creates a new orchestrator for any terminal implementation.
    pub fn with_terminal(config: Config) -> Result<Self> {
        config.server.listen_addr().context("Invalid server address")?;

        let session_manager = Arc::new(SessionManager::from_config(&config.session));
        let (event_tx, _) = broadcast::channel(256);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            session_manager,
            shutdown_token: CancellationToken::new(),
            event_tx,
            local_addr: None,
            server_task: None,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the sessions subsystem and the HTTP listener.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        // A token cancelled by a previous stop would end the new server at once.
        if self.shutdown_token.is_cancelled() {
            self.shutdown_token = CancellationToken::new();
        }

        info!(mode = %self.session_manager.mode(), "Starting server orchestrator...");

        if let Err(e) = self.start_inner().await {
            error!("Startup failed: {:#}", e);
            self.emit_event(OrchestratorEvent::Error {
                message: format!("{:#}", e),
            });
            self.session_manager.shutdown().await;
            *self.state.write().await = OrchestratorState::Stopped;
            self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
            return Err(e);
        }

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        Ok(())
    }

    async fn start_inner(&mut self) -> Result<()> {
        self.session_manager
            .start()
            .await
            .context("Failed to start shared session")?;

        let addr = self.config.server.listen_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        let local_addr = listener.local_addr().context("Failed to read bound address")?;

        let app_state = AppState::new(
            Arc::clone(&self.session_manager),
            self.event_tx.clone(),
            self.shutdown_token.clone(),
        );
        let app = build_router(app_state, &self.config.server);

        let shutdown = self.shutdown_token.clone();
        let event_tx = self.event_tx.clone();
        self.server_task = Some(tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                error!("HTTP server error: {}", e);
                let _ = event_tx.send(OrchestratorEvent::Error {
                    message: format!("HTTP server error: {}", e),
                });
            }
            debug!("HTTP server task finished");
        }));

        self.local_addr = Some(local_addr);
        info!("HTTP server listening on http://{}", local_addr);

        Ok(())
    }

    /// Stops the server and terminates every session.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping server orchestrator...");

        // Signal shutdown to the listener and every connection task
        self.shutdown_token.cancel();

        let killed = self.session_manager.shutdown().await;
        debug!(sessions = killed, "Sessions terminated");

        if let Some(task) = self.server_task.take() {
            if let Err(e) = task.await {
                warn!("HTTP server task ended abnormally: {}", e);
            }
        }
        self.local_addr = None;

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Stopped;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Server orchestrator stopped");
        Ok(())
    }

    /// Emits an event to all subscribers.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the session manager.
    pub fn session_manager(&self) -> &Arc<SessionManager<T>> {
        &self.session_manager
    }

    /// Returns the bound listener address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns the configuration in use.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the number of connected clients.
    pub fn connection_count(&self) -> usize {
        self.session_manager.connection_count()
    }

    /// Returns a clone of the shutdown token.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mock::{MockTerminal, FAILING_SHELL};
    use crate::session::SessionMode;

    fn create_test_config() -> Config {
        let mut config = Config::default();
        config.server.bind_address = "127.0.0.1".to_string();
        config.server.port = 0;
        config
    }

    fn orchestrator(config: Config) -> DaemonOrchestrator<MockTerminal> {
        DaemonOrchestrator::with_terminal(config).unwrap()
    }

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let orchestrator = orchestrator(create_test_config());
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.local_addr().is_none());
        assert_eq!(orchestrator.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_bind_address_rejected() {
        let mut config = create_test_config();
        config.server.bind_address = "not an address".to_string();
        assert!(DaemonOrchestrator::<MockTerminal>::with_terminal(config).is_err());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let mut orchestrator = orchestrator(create_test_config());
        let mut events = orchestrator.subscribe();

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        let addr = orchestrator.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        assert!(orchestrator.start().await.is_err());

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.shutdown_token().is_cancelled());

        let mut states = Vec::new();
        while let Ok(OrchestratorEvent::StateChanged(state)) = events.try_recv() {
            states.push(state);
        }
        assert_eq!(
            states,
            vec![
                OrchestratorState::Starting,
                OrchestratorState::Running,
                OrchestratorState::ShuttingDown,
                OrchestratorState::Stopped,
            ]
        );

        // Stopping again is a no-op.
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let mut orchestrator = orchestrator(create_test_config());

        orchestrator.start().await.unwrap();
        orchestrator.stop().await.unwrap();
        orchestrator.start().await.unwrap();

        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        assert!(!orchestrator.shutdown_token().is_cancelled());

        let addr = orchestrator.local_addr().unwrap();
        let response = reqwest::get(format!("http://{}/health", addr)).await.unwrap();
        assert!(response.status().is_success());
        let health: serde_json::Value = response.json().await.unwrap();
        assert_eq!(health["status"], "ok");

        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_shared_mode_spawns_on_start() {
        let mut config = create_test_config();
        config.session.mode = SessionMode::Shared;
        let mut orchestrator = orchestrator(config);

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.session_manager().session_count(), 1);

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.session_manager().session_count(), 0);
    }

    #[tokio::test]
    async fn test_shared_mode_spawn_failure_aborts_start() {
        let mut config = create_test_config();
        config.session.mode = SessionMode::Shared;
        config.session.default_shell = FAILING_SHELL.to_string();
        let mut orchestrator = orchestrator(config);
        let mut events = orchestrator.subscribe();

        assert!(orchestrator.start().await.is_err());
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, OrchestratorEvent::Error { .. }) {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_stop_kills_sessions() {
        let mut orchestrator = orchestrator(create_test_config());
        orchestrator.start().await.unwrap();

        let attachment = orchestrator.session_manager().connect("c1").await.unwrap();
        orchestrator.stop().await.unwrap();

        assert_eq!(attachment.session.terminal().kill_count(), 1);
        assert_eq!(orchestrator.session_manager().session_count(), 0);
    }
}
