//! Encrypted OAuth `state` parameter.
//!
//! The state value is the CSRF/replay defense for the whole flow: every
//! callback must present a state that only this service could have
//! produced, for that user, issued recently. The payload is serialized to
//! JSON and sealed with AES-256-GCM into the `iv:tag:ciphertext` hex
//! format, so the PKCE verifier and return path ride inside the URL itself;
//! nothing is stored server-side between initiation and callback.

use crate::connections::encryption;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How long an issued state stays valid.
pub const STATE_TTL_SECONDS: i64 = 600;

/// Flow context carried through the provider redirect.
///
/// Ephemeral: created when the authorization URL is built, destroyed when
/// the callback validates it. Never persisted server-side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationState {
    pub user_id: String,
    pub provider: String,
    pub code_verifier: String,
    pub nonce: String,
    pub issued_at: DateTime<Utc>,
    pub return_path: String,
}

impl AuthorizationState {
    /// Builds a payload with a fresh nonce and the current timestamp.
    pub fn new(user_id: &str, provider: &str, code_verifier: &str, return_path: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            code_verifier: code_verifier.to_string(),
            nonce: Uuid::new_v4().to_string(),
            issued_at: Utc::now(),
            return_path: return_path.to_string(),
        }
    }
}

/// Serializes and encrypts a state payload with the state key.
pub fn encode(payload: &AuthorizationState, key: &[u8]) -> Result<String> {
    let json = serde_json::to_string(payload).context("Failed to serialize state payload")?;
    encryption::encrypt(&json, key)
}

/// Decrypts and validates a state token.
///
/// Fails if the wire format is malformed, authentication fails (tampered
/// ciphertext, wrong key, truncation), or `issued_at` is older than
/// `ttl_seconds`. Every failure mode is treated as an invalid state by the
/// callback handler; no partial recovery.
pub fn decode(token: &str, key: &[u8], ttl_seconds: i64) -> Result<AuthorizationState> {
    let json = encryption::decrypt(token, key)?;
    let payload: AuthorizationState =
        serde_json::from_str(&json).context("State payload is not valid JSON")?;

    let age = Utc::now() - payload.issued_at;
    if age > Duration::seconds(ttl_seconds) {
        return Err(anyhow!(
            "State expired: issued {}s ago, TTL is {}s",
            age.num_seconds(),
            ttl_seconds
        ));
    }

    Ok(payload)
}
