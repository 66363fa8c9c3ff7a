//! Network module: the HTTP and WebSocket surface of the server.
//!
//! - [`http`]: welcome, health and the command injection endpoint
//! - [`websocket`]: one terminal session per WebSocket connection

pub mod http;
pub mod websocket;

use std::sync::Arc;

use axum::http::{header, HeaderValue};
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::gateway::CommandGateway;
use crate::orchestrator::OrchestratorEvent;
use crate::router::InputRouter;
use crate::session::{PtyTerminal, SessionManager, Terminal};

pub use http::ApiError;

/// Shared state handed to every request handler.
pub struct AppState<T: Terminal = PtyTerminal> {
    /// Session lifecycle.
    pub sessions: Arc<SessionManager<T>>,
    /// Input routing for socket frames.
    pub router: InputRouter<T>,
    /// Command injection.
    pub gateway: CommandGateway<T>,
    /// Lifecycle events for observers.
    pub events: broadcast::Sender<OrchestratorEvent>,
    /// Cancelled when the server shuts down.
    pub shutdown: CancellationToken,
}

impl<T: Terminal> Clone for AppState<T> {
    fn clone(&self) -> Self {
        Self {
            sessions: Arc::clone(&self.sessions),
            router: self.router.clone(),
            gateway: self.gateway.clone(),
            events: self.events.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<T: Terminal> AppState<T> {
    /// Wires the router and gateway on top of a session manager.
    pub fn new(
        sessions: Arc<SessionManager<T>>,
        events: broadcast::Sender<OrchestratorEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        let router = InputRouter::new(Arc::clone(&sessions));
        let gateway = CommandGateway::new(router.clone());
        Self {
            sessions,
            router,
            gateway,
            events,
            shutdown,
        }
    }

    /// Publishes an event; having no listeners is fine.
    pub(crate) fn emit(&self, event: OrchestratorEvent) {
        let _ = self.events.send(event);
    }
}

/// Builds the HTTP application.
pub fn build_router<T: Terminal>(state: AppState<T>, config: &ServerConfig) -> Router {
    let mut app = Router::new()
        .route("/", get(http::welcome))
        .route("/health", get(http::health::<T>))
        .route("/api/command", post(http::inject::<T>))
        .route("/ws", get(websocket::ws_handler::<T>));

    app = match &config.static_dir {
        Some(dir) => {
            tracing::info!("Serving static files from {}", dir.display());
            app.fallback_service(
                ServeDir::new(dir)
                    .append_index_html_on_directories(true)
                    .not_found_service(axum::handler::HandlerWithoutStateExt::into_service(
                        http::not_found,
                    )),
            )
        }
        None => app.fallback(http::not_found),
    };

    let mut app = app
        .with_state(state)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("SAMEORIGIN"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(TraceLayer::new_for_http());

    if config.cors_permissive {
        app = app.layer(CorsLayer::permissive());
    }

    app
}
