//! OAuth 2.0 authorization flow for platform connections.
//!
//! Implements the authorization code flow with PKCE:
//! 1. UI calls POST /api/connect/:provider (rate-limited)
//! 2. Service returns the provider authorization URL; the PKCE verifier
//!    travels inside the encrypted `state` parameter, so no server-side
//!    session exists between initiation and callback
//! 3. User authorizes on the provider's site
//! 4. Provider redirects to GET /api/oauth/callback
//! 5. State is decrypted and its nonce consumed; code + verifier are
//!    exchanged for tokens; tokens are stored encrypted
//! 6. Browser is redirected back to the user's return path

mod exchange;
pub mod pkce;
mod provider;
mod replay;
pub mod state;

pub use replay::{run_nonce_cleanup, InMemoryNonceStore, NonceStore};
pub use state::{AuthorizationState, STATE_TTL_SECONDS};

pub(crate) use exchange::refresh_grant;
pub(crate) use provider::get_provider_config;

use crate::auth::extract_bearer_token;
use crate::connections::ConnectionStore;
use crate::rate_limit::{RateDecision, RateLimiter};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Redirect, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Application error types for OAuth endpoints
enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    TooManyRequests { retry_after_seconds: u64 },
    ServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, retry_after) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg, None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            AppError::TooManyRequests {
                retry_after_seconds,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded, retry later".to_string(),
                Some(retry_after_seconds),
            ),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
        };

        let mut response = (
            status,
            Json(ErrorResponse {
                error: error_message,
            }),
        )
            .into_response();

        if let Some(seconds) = retry_after {
            if let Ok(value) = axum::http::HeaderValue::from_str(&seconds.to_string()) {
                response
                    .headers_mut()
                    .insert(axum::http::header::RETRY_AFTER, value);
            }
        }

        response
    }
}

/// Shared application state for the OAuth API
#[derive(Clone)]
pub struct OAuthAppState {
    pub connection_store: Arc<ConnectionStore>,
    pub nonce_store: Arc<dyn NonceStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub http_client: reqwest::Client,
    pub state_key: Vec<u8>,
    pub callback_base_url: String,
    pub state_ttl_seconds: i64,
}

/// Request body for POST /api/connect/:provider
#[derive(Deserialize)]
pub struct ConnectRequest {
    /// Where the UI wants the browser sent after the callback completes
    #[serde(default = "default_return_path")]
    pub return_path: String,
}

fn default_return_path() -> String {
    "/dashboard".to_string()
}

/// Response for POST /api/connect/:provider
#[derive(Serialize)]
pub struct ConnectResponse {
    pub auth_url: String,
}

/// OAuth callback query parameters
#[derive(Deserialize)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Create OAuth API router
pub fn create_oauth_router(state: OAuthAppState) -> Router {
    Router::new()
        .route("/api/connect/:provider", post(connect_start))
        .route("/api/oauth/callback", get(oauth_callback))
        .with_state(Arc::new(state))
}

/// POST /api/connect/:provider
///
/// Builds the provider authorization URL for the authenticated caller.
///
/// # Security
/// - Requires bearer token (caller identity)
/// - Rate-limited per (user, source address): this endpoint is cheap to
///   hammer and must not become an authorization-spam vector
/// - PKCE pair generated per request; verifier sealed into the state
async fn connect_start(
    State(app): State<Arc<OAuthAppState>>,
    Path(provider_name): Path<String>,
    headers: HeaderMap,
    body: Option<Json<ConnectRequest>>,
) -> Result<Json<ConnectResponse>, AppError> {
    debug!(provider = %provider_name, "Connect requested");

    if !provider::is_valid_provider(&provider_name) {
        warn!(provider = %provider_name, "Unknown provider");
        return Err(AppError::NotFound(format!(
            "Provider '{}' not supported",
            provider_name
        )));
    }

    let user_id = extract_bearer_token(&headers)
        .map_err(|e| AppError::Unauthorized(format!("Invalid token: {:?}", e)))?;

    let caller_key = format!("{}:{}", user_id, source_address(&headers));
    if let RateDecision::Limited { retry_after } = app.rate_limiter.check_and_consume(&caller_key)
    {
        warn!(user_id = %user_id, provider = %provider_name, "Connect rate limit hit");
        return Err(AppError::TooManyRequests {
            retry_after_seconds: retry_after.as_secs().max(1),
        });
    }

    let provider_config = provider::get_provider_config(&provider_name).ok_or_else(|| {
        error!(provider = %provider_name, "OAuth provider config not found (missing env vars?)");
        AppError::ServerError(format!(
            "OAuth not configured for provider '{}'. Set TWINLINK_OAUTH_{}_CLIENT_ID and TWINLINK_OAUTH_{}_CLIENT_SECRET environment variables.",
            provider_name,
            provider_name.to_uppercase(),
            provider_name.to_uppercase()
        ))
    })?;

    let return_path = body
        .map(|Json(req)| req.return_path)
        .unwrap_or_else(default_return_path);

    let pkce_pair = pkce::generate_challenge()
        .map_err(|e| AppError::ServerError(format!("Failed to generate PKCE pair: {}", e)))?;

    let payload = AuthorizationState::new(
        &user_id,
        &provider_name,
        &pkce_pair.verifier,
        &return_path,
    );
    let state_token = state::encode(&payload, &app.state_key)
        .map_err(|e| AppError::ServerError(format!("Failed to encode state: {}", e)))?;

    let redirect_uri = format!("{}/api/oauth/callback", app.callback_base_url);
    let auth_url = provider_config.build_auth_url(&state_token, &redirect_uri, &pkce_pair.challenge);

    info!(
        user_id = %user_id,
        provider = %provider_name,
        "Issued authorization URL"
    );

    Ok(Json(ConnectResponse { auth_url }))
}

/// GET /api/oauth/callback
///
/// Provider-invoked redirect. Validates and consumes the state, exchanges
/// the authorization code, stores encrypted tokens, and sends the browser
/// back to the return path carried in the state.
///
/// # Security
/// - State must decrypt and authenticate under the state key (CSRF defense)
/// - State nonce is single-use (replay defense)
/// - A failed exchange is never retried here; the authorization code is
///   single-use, so the user must restart the flow explicitly
async fn oauth_callback(
    State(app): State<Arc<OAuthAppState>>,
    Query(callback): Query<OAuthCallback>,
) -> Result<Response, AppError> {
    debug!("OAuth callback received");

    // Provider-reported errors (user denied consent, etc.)
    if let Some(error) = callback.error {
        let description = callback
            .error_description
            .unwrap_or_else(|| "Unknown error".to_string());
        warn!(error = %error, description = %description, "Provider reported authorization failure");
        return Err(AppError::BadRequest(format!(
            "Authorization failed: {} - {}",
            error, description
        )));
    }

    let code = callback
        .code
        .ok_or_else(|| AppError::BadRequest("Missing 'code' parameter".to_string()))?;
    let state_token = callback
        .state
        .ok_or_else(|| AppError::BadRequest("Missing 'state' parameter".to_string()))?;

    // Decrypt and validate state. Until this succeeds there is no trusted
    // return path, so failures surface as a plain 401.
    let flow = state::decode(&state_token, &app.state_key, app.state_ttl_seconds)
        .map_err(|e| {
            warn!(error = %e, "Invalid OAuth state");
            AppError::Unauthorized(
                "Invalid or expired OAuth state (possible CSRF attack)".to_string(),
            )
        })?;

    // Single-use nonce: a replayed state is rejected even inside the TTL
    if !app.nonce_store.mark_consumed(&flow.nonce) {
        warn!(user_id = %flow.user_id, provider = %flow.provider, "Replayed OAuth state rejected");
        return Err(AppError::Unauthorized(
            "Invalid or expired OAuth state (possible CSRF attack)".to_string(),
        ));
    }

    let return_path = sanitize_return_path(&flow.return_path);

    let provider_config = provider::get_provider_config(&flow.provider).ok_or_else(|| {
        error!(provider = %flow.provider, "OAuth provider config not found");
        AppError::ServerError(format!(
            "OAuth not configured for provider '{}'",
            flow.provider
        ))
    })?;

    // Redirect URI must match the one used in the authorization request
    let redirect_uri = format!("{}/api/oauth/callback", app.callback_base_url);

    debug!(user_id = %flow.user_id, provider = %flow.provider, "Exchanging authorization code");
    let tokens = match exchange::exchange_code(
        &app.http_client,
        &provider_config.token_url,
        &code,
        &flow.code_verifier,
        &redirect_uri,
        &provider_config.client_id,
        &provider_config.client_secret,
    )
    .await
    {
        Ok(t) => t,
        Err(e) => {
            error!(
                user_id = %flow.user_id,
                provider = %flow.provider,
                error = %e,
                "Token exchange failed"
            );
            // Any prior connection row stays untouched; the user retries
            // from the UI with a fresh authorization code
            return Ok(error_redirect(return_path, "token_exchange_failed"));
        }
    };

    // Best-effort display name for the confirmation screen
    let account = match &provider_config.identity_url {
        Some(url) => exchange::fetch_identity(&app.http_client, url, &tokens.access_token).await,
        None => None,
    };

    app.connection_store
        .upsert_tokens(&flow.user_id, &flow.provider, &tokens)
        .map_err(|e| {
            error!(
                user_id = %flow.user_id,
                provider = %flow.provider,
                error = %e,
                "Failed to store connection tokens"
            );
            AppError::ServerError(format!("Failed to store tokens: {}", e))
        })?;

    info!(
        user_id = %flow.user_id,
        provider = %flow.provider,
        has_refresh_token = tokens.refresh_token.is_some(),
        "OAuth flow completed successfully"
    );

    Ok(success_redirect(return_path, &flow.provider, account.as_deref()))
}

/// Return paths come out of the (authenticated) state payload, but are
/// still constrained to same-origin relative paths.
fn sanitize_return_path(path: &str) -> &str {
    if path.starts_with('/') && !path.starts_with("//") {
        path
    } else {
        "/"
    }
}

fn query_separator(path: &str) -> char {
    if path.contains('?') {
        '&'
    } else {
        '?'
    }
}

fn success_redirect(return_path: &str, provider: &str, account: Option<&str>) -> Response {
    let mut target = format!(
        "{}{}connected={}",
        return_path,
        query_separator(return_path),
        urlencoding::encode(provider)
    );
    if let Some(name) = account {
        target.push_str(&format!("&account={}", urlencoding::encode(name)));
    }
    Redirect::to(&target).into_response()
}

fn error_redirect(return_path: &str, kind: &str) -> Response {
    let target = format!(
        "{}{}error={}",
        return_path,
        query_separator(return_path),
        kind
    );
    Redirect::to(&target).into_response()
}

/// Rate-limit keying uses the forwarded client address when present
/// (the service normally sits behind a reverse proxy).
fn source_address(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "direct".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oauth_callback_deserialization() {
        // Success case
        let query = "code=auth_code_123&state=aa%3Abb%3Acc";
        let callback: OAuthCallback = serde_urlencoded::from_str(query).unwrap();
        assert_eq!(callback.code, Some("auth_code_123".to_string()));
        assert_eq!(callback.state, Some("aa:bb:cc".to_string()));
        assert_eq!(callback.error, None);

        // Error case
        let query = "error=access_denied&error_description=User+cancelled";
        let callback: OAuthCallback = serde_urlencoded::from_str(query).unwrap();
        assert_eq!(callback.error, Some("access_denied".to_string()));
        assert_eq!(
            callback.error_description,
            Some("User cancelled".to_string())
        );
        assert_eq!(callback.code, None);
    }

    #[test]
    fn test_connect_request_default_return_path() {
        let req: ConnectRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.return_path, "/dashboard");

        let req: ConnectRequest =
            serde_json::from_str(r#"{"return_path":"/get-started"}"#).unwrap();
        assert_eq!(req.return_path, "/get-started");
    }

    #[test]
    fn test_connect_response_serialization() {
        let response = ConnectResponse {
            auth_url: "https://accounts.spotify.com/authorize?response_type=code".to_string(),
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"auth_url\""));
        assert!(json.contains("accounts.spotify.com"));
    }

    #[test]
    fn test_sanitize_return_path() {
        assert_eq!(sanitize_return_path("/dashboard"), "/dashboard");
        assert_eq!(sanitize_return_path("/a/b?c=d"), "/a/b?c=d");
        // Protocol-relative and absolute URLs are not open-redirect targets
        assert_eq!(sanitize_return_path("//evil.example"), "/");
        assert_eq!(sanitize_return_path("https://evil.example"), "/");
        assert_eq!(sanitize_return_path(""), "/");
    }

    #[test]
    fn test_source_address() {
        let mut headers = HeaderMap::new();
        assert_eq!(source_address(&headers), "direct");

        headers.insert("x-forwarded-for", "203.0.113.9, 10.0.0.1".parse().unwrap());
        assert_eq!(source_address(&headers), "203.0.113.9");
    }
}
