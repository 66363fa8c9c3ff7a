//! Plain HTTP handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use protocol::{InjectRequest, InjectResponse};
use serde::Serialize;
use serde_json::json;

use super::AppState;
use crate::gateway::GatewayError;
use crate::session::Terminal;

/// Error returned by the JSON endpoints.
#[derive(Debug)]
pub enum ApiError {
    /// The body was not valid JSON for the endpoint.
    BadRequest(String),
    /// The gateway refused or failed the request.
    Gateway(GatewayError),
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError::Gateway(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Gateway(GatewayError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            ApiError::Gateway(GatewayError::SessionNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Gateway(GatewayError::Internal(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(detail) => format!("Invalid request body: {}", detail),
            ApiError::Gateway(err) => err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.message(), "Command injection failed");
        }
        let body = InjectResponse {
            success: false,
            message: self.message(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    mode: &'static str,
    sessions: usize,
    connections: usize,
}

pub(super) async fn welcome() -> Json<serde_json::Value> {
    Json(json!({ "message": "Welcome to the API" }))
}

pub(super) async fn health<T: Terminal>(State(state): State<AppState<T>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        mode: state.sessions.mode().as_str(),
        sessions: state.sessions.session_count(),
        connections: state.sessions.connection_count(),
    })
}

pub(super) async fn inject<T: Terminal>(
    State(state): State<AppState<T>>,
    payload: Result<Json<InjectRequest>, JsonRejection>,
) -> Result<Json<InjectResponse>, ApiError> {
    let Json(request) = payload?;
    let response = state.gateway.inject(&request).await?;
    Ok(Json(response))
}

pub(super) async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": { "message": "Not Found" } })),
    )
}
