//! Conversation HTTP API.
//!
//! - `POST /v1/turns`                  - run one user turn (`session_id` omitted starts a session)
//! - `POST /v1/sessions/{id}/reset`    - clear booking progress, keep the transcript
//! - `POST /v1/sessions/{id}/abort`    - end the session

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use concierge_agent::{BookingRuntime, RuntimeError, TurnReply};
use concierge_core::domain::session::{Session, SessionId};
use concierge_core::errors::{ApplicationError, InterfaceError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct ApiState {
    runtime: Arc<BookingRuntime>,
}

#[derive(Debug, Deserialize)]
pub struct TurnRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub text: String,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub session_id: SessionId,
    pub status: &'static str,
    pub node: String,
    pub epoch: u32,
}

impl From<&Session> for SessionState {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            status: session.status.as_str(),
            node: session.current_node.to_string(),
            epoch: session.epoch,
        }
    }
}

#[derive(Debug)]
pub struct ApiError(InterfaceError);

impl ApiError {
    fn from_runtime(error: RuntimeError, correlation_id: &str) -> Self {
        Self(ApplicationError::from(error).into_interface(correlation_id))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            InterfaceError::BadRequest { .. } => (StatusCode::BAD_REQUEST, "bad_request"),
            InterfaceError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            InterfaceError::ServiceUnavailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            InterfaceError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal")
        };
        if status.is_server_error() {
            error!(
                event_name = "api.request.failed",
                correlation_id = self.0.correlation_id(),
                error = %self.0,
                "request failed"
            );
        } else {
            warn!(
                event_name = "api.request.rejected",
                correlation_id = self.0.correlation_id(),
                error = %self.0,
                "request rejected"
            );
        }

        let body = json!({
            "error": {
                "code": code,
                "message": self.0.user_message(),
                "correlation_id": self.0.correlation_id(),
            }
        });
        (status, Json(body)).into_response()
    }
}

pub fn router(runtime: Arc<BookingRuntime>) -> Router {
    Router::new()
        .route("/v1/turns", post(submit_turn))
        .route("/v1/sessions/{id}/reset", post(reset_session))
        .route("/v1/sessions/{id}/abort", post(abort_session))
        .with_state(ApiState { runtime })
}

pub async fn submit_turn(
    State(state): State<ApiState>,
    Json(request): Json<TurnRequest>,
) -> Result<Json<TurnReply>, ApiError> {
    let correlation_id = Uuid::new_v4().to_string();
    let text = request.text.trim();
    if text.is_empty() {
        return Err(ApiError(InterfaceError::BadRequest {
            message: "text must not be empty".to_string(),
            correlation_id,
        }));
    }

    let session_id = request
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(SessionId::from)
        .unwrap_or_else(SessionId::generate);

    let reply = state
        .runtime
        .process_turn(&session_id, text)
        .await
        .map_err(|error| ApiError::from_runtime(error, &correlation_id))?;
    Ok(Json(reply))
}

pub async fn reset_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<SessionState>, ApiError> {
    let correlation_id = Uuid::new_v4().to_string();
    let session = state
        .runtime
        .reset(&SessionId::from(id.as_str()))
        .await
        .map_err(|error| ApiError::from_runtime(error, &correlation_id))?;
    Ok(Json(SessionState::from(&session)))
}

pub async fn abort_session(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<SessionState>, ApiError> {
    let correlation_id = Uuid::new_v4().to_string();
    let session = state
        .runtime
        .abort(&SessionId::from(id.as_str()))
        .await
        .map_err(|error| ApiError::from_runtime(error, &correlation_id))?;
    Ok(Json(SessionState::from(&session)))
}
