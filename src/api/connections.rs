//! Connection status API endpoints.
//!
//! Read path over the connection store for the UI and the extraction jobs,
//! plus the idempotent disconnect. No token material ever leaves these
//! endpoints.

use crate::auth::extract_bearer_token;
use crate::connections::{ConnectionStore, ConnectionSummary};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared application state for the connections API
#[derive(Clone)]
pub struct ConnectionsAppState {
    pub connection_store: Arc<ConnectionStore>,
    /// When enabled, callers may only act on their own user id
    pub auth_enabled: bool,
}

/// List connections response
#[derive(Serialize)]
pub struct ListConnectionsResponse {
    pub connections: Vec<ConnectionSummary>,
}

/// Response for DELETE /api/connections/:user_id/:provider
#[derive(Serialize)]
pub struct DisconnectResponse {
    pub success: bool,
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

enum AppError {
    Unauthorized(String),
    Forbidden(String),
    ServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (
            status,
            Json(ErrorResponse {
                error: error_message,
            }),
        )
            .into_response()
    }
}

/// Create connections API router
pub fn create_connections_router(state: ConnectionsAppState) -> Router {
    Router::new()
        .route("/api/connections/:user_id", get(list_connections))
        .route(
            "/api/connections/:user_id/:provider",
            delete(disconnect_provider),
        )
        .with_state(Arc::new(state))
}

/// Callers may only touch their own rows when auth is enabled.
fn authorize_user(
    state: &ConnectionsAppState,
    headers: &HeaderMap,
    user_id: &str,
) -> Result<(), AppError> {
    if !state.auth_enabled {
        return Ok(());
    }

    let caller = extract_bearer_token(headers)
        .map_err(|e| AppError::Unauthorized(format!("Invalid token: {:?}", e)))?;

    if caller != user_id {
        warn!(caller = %caller, user_id = %user_id, "Cross-user connection access denied");
        return Err(AppError::Forbidden(
            "Cannot access another user's connections".to_string(),
        ));
    }

    Ok(())
}

/// GET /api/connections/:user_id
///
/// Per-provider connection summaries. Pure read, safe to call on every
/// dashboard load.
async fn list_connections(
    State(state): State<Arc<ConnectionsAppState>>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ListConnectionsResponse>, AppError> {
    authorize_user(&state, &headers, &user_id)?;

    debug!(user_id = %user_id, "Listing connections");

    let connections = state
        .connection_store
        .list_for_user(&user_id)
        .map_err(|e| AppError::ServerError(format!("Failed to list connections: {}", e)))?;

    Ok(Json(ListConnectionsResponse { connections }))
}

/// DELETE /api/connections/:user_id/:provider
///
/// Idempotent disconnect: flips the row to `disconnected` and clears the
/// ciphertext. Succeeds even if nothing was connected. An in-flight
/// refresh for the pair discards its result once the row is gone.
async fn disconnect_provider(
    State(state): State<Arc<ConnectionsAppState>>,
    Path((user_id, provider)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<DisconnectResponse>, AppError> {
    authorize_user(&state, &headers, &user_id)?;

    state
        .connection_store
        .disconnect(&user_id, &provider)
        .map_err(|e| AppError::ServerError(format!("Failed to disconnect: {}", e)))?;

    info!(user_id = %user_id, provider = %provider, "Platform disconnected");

    Ok(Json(DisconnectResponse { success: true }))
}
