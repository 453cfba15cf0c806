//! Encrypted platform-connection storage.
//!
//! One `platform_connections` row per (user, provider) holds the OAuth
//! tokens for that connection, encrypted at rest with AES-256-GCM in the
//! `iv:tag:ciphertext` hex format. The store is the single owner of these
//! rows: the callback handler creates/replaces them, the refresh scheduler
//! rewrites them, and disconnect clears the ciphertext while keeping the
//! row for status reporting.
//!
//! # Security
//! - Access and refresh tokens are encrypted with a token key distinct
//!   from the state key
//! - Plaintext is decrypted on demand and never cached by the store
//! - Decryption failure is surfaced as [`TokenError::Corrupted`] and the
//!   row is forced into `error` status, never silently dropped

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod encryption;
mod store;

pub use store::ConnectionStore;

/// Connection lifecycle state for a (user, provider) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connected" => Some(ConnectionStatus::Connected),
            "disconnected" => Some(ConnectionStatus::Disconnected),
            "error" => Some(ConnectionStatus::Error),
            _ => None,
        }
    }
}

/// Decrypted OAuth tokens for one connection.
///
/// Only ever held transiently: by the callback handler right after an
/// exchange, or by the refresh scheduler for a single refresh attempt.
#[derive(Clone, Debug)]
pub struct TokenSet {
    /// OAuth access token (used for API requests)
    pub access_token: String,

    /// OAuth refresh token (used to obtain new access tokens)
    pub refresh_token: Option<String>,

    /// When the access token expires (UTC); always populated while connected
    pub expires_at: DateTime<Utc>,
}

/// Per-provider connection summary exposed to the UI and extraction jobs.
///
/// Never carries token material.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConnectionSummary {
    pub provider: String,
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_status: Option<String>,
    pub error_count: i64,
}

/// Store-level failures that callers must distinguish.
#[derive(Debug)]
pub enum TokenError {
    /// Ciphertext failed authentication or format validation (key rotation
    /// without migration, tampering). The row has been marked `error`.
    Corrupted(String),
    /// Underlying database failure.
    Database(anyhow::Error),
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Corrupted(msg) => write!(f, "token ciphertext corrupted: {}", msg),
            TokenError::Database(e) => write!(f, "connection store failure: {}", e),
        }
    }
}

impl std::error::Error for TokenError {}
