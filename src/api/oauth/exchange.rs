//! Token endpoint calls: code exchange and refresh grants.
//!
//! All outbound calls go through the shared `reqwest::Client`, which is
//! built with a bounded timeout, so a hung provider fails the attempt instead
//! of blocking the handler or a scheduler tick.

use crate::connections::TokenSet;
use anyhow::{anyhow, Context, Result};
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::collections::HashMap;

/// Applied when a provider omits `expires_in` (github does). The row still
/// carries a concrete expiry; without a refresh token it simply never
/// enters the refresh lookahead.
const FALLBACK_EXPIRES_IN_SECONDS: i64 = 30 * 24 * 3600;

/// Token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Exchange an authorization code (plus PKCE verifier) for tokens.
///
/// # Arguments
/// * `client` - Shared HTTP client (carries the request timeout)
/// * `token_url` - Provider token endpoint
/// * `code` - Authorization code from the callback
/// * `code_verifier` - PKCE verifier recovered from the state payload
/// * `redirect_uri` - Must match the one sent in the authorization request
pub async fn exchange_code(
    client: &reqwest::Client,
    token_url: &str,
    code: &str,
    code_verifier: &str,
    redirect_uri: &str,
    client_id: &str,
    client_secret: &str,
) -> Result<TokenSet> {
    let mut form = HashMap::new();
    form.insert("grant_type", "authorization_code");
    form.insert("code", code);
    form.insert("code_verifier", code_verifier);
    form.insert("redirect_uri", redirect_uri);
    form.insert("client_id", client_id);
    form.insert("client_secret", client_secret);

    tracing::debug!("Exchanging authorization code at {}", token_url);

    let response = client
        .post(token_url)
        .header("Accept", "application/json")
        .form(&form)
        .send()
        .await
        .context("Failed to send token exchange request")?;

    parse_token_response(response, None).await
}

/// Obtain a new token set with `grant_type=refresh_token`.
///
/// If the provider does not rotate the refresh token, the one passed in is
/// kept in the returned set.
pub async fn refresh_grant(
    client: &reqwest::Client,
    token_url: &str,
    refresh_token: &str,
    client_id: &str,
    client_secret: &str,
) -> Result<TokenSet> {
    let mut form = HashMap::new();
    form.insert("grant_type", "refresh_token");
    form.insert("refresh_token", refresh_token);
    form.insert("client_id", client_id);
    form.insert("client_secret", client_secret);

    tracing::debug!("Requesting refresh grant at {}", token_url);

    let response = client
        .post(token_url)
        .header("Accept", "application/json")
        .form(&form)
        .send()
        .await
        .context("Failed to send token refresh request")?;

    parse_token_response(response, Some(refresh_token)).await
}

async fn parse_token_response(
    response: reqwest::Response,
    prior_refresh_token: Option<&str>,
) -> Result<TokenSet> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read body>".to_string());
        return Err(anyhow!(
            "Token endpoint returned status {}: {}",
            status,
            body
        ));
    }

    let token_response: TokenResponse = response
        .json()
        .await
        .context("Failed to parse token response")?;

    tracing::debug!(
        has_refresh_token = token_response.refresh_token.is_some(),
        expires_in = ?token_response.expires_in,
        "Token grant successful"
    );

    let expires_in = token_response
        .expires_in
        .unwrap_or(FALLBACK_EXPIRES_IN_SECONDS);

    // Keep the prior refresh token if the provider did not rotate it
    let refresh_token = token_response
        .refresh_token
        .or_else(|| prior_refresh_token.map(String::from));

    Ok(TokenSet {
        access_token: token_response.access_token,
        refresh_token,
        expires_at: Utc::now() + Duration::seconds(expires_in),
    })
}

/// Response fields commonly carrying a display name across providers.
#[derive(Deserialize)]
struct IdentityResponse {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    login: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

/// Best-effort fetch of a display name for the post-connect confirmation.
///
/// Never fails the flow: any error is logged and `None` returned.
pub async fn fetch_identity(
    client: &reqwest::Client,
    identity_url: &str,
    access_token: &str,
) -> Option<String> {
    let response = client
        .get(identity_url)
        .header("Accept", "application/json")
        .header("Authorization", format!("Bearer {}", access_token))
        .header("User-Agent", "twinlink")
        .send()
        .await;

    let response = match response {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => {
            tracing::warn!(status = %r.status(), "Identity endpoint returned non-success");
            return None;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Identity fetch failed");
            return None;
        }
    };

    let identity: IdentityResponse = match response.json().await {
        Ok(i) => i,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse identity response");
            return None;
        }
    };

    identity
        .display_name
        .or(identity.name)
        .or(identity.login)
        .or(identity.username)
        .or(identity.email)
}
