//! SQLite-backed storage for platform connections.
//!
//! Tokens are encrypted before they touch the database and decrypted on
//! demand. All writes go through upsert/targeted UPDATE statements so a row
//! is never left half-written.

use super::{encryption, ConnectionStatus, ConnectionSummary, TokenError, TokenSet};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

/// Encrypted connection storage.
///
/// # Schema
/// ```sql
/// CREATE TABLE platform_connections (
///     id INTEGER PRIMARY KEY,
///     user_id TEXT NOT NULL,
///     provider TEXT NOT NULL,
///     access_token TEXT,            -- iv:tag:ciphertext hex, NULL when disconnected
///     refresh_token TEXT,           -- iv:tag:ciphertext hex (optional)
///     expires_at TEXT,              -- ISO 8601 timestamp
///     status TEXT NOT NULL,         -- connected | disconnected | error
///     last_sync_at TEXT,
///     last_sync_status TEXT,
///     error_count INTEGER NOT NULL DEFAULT 0,
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL,
///     UNIQUE(user_id, provider)
/// );
/// ```
///
/// # Thread Safety
/// - Connection is wrapped in Mutex for safe concurrent access
/// - SQLite itself is thread-safe with serialized mode
pub struct ConnectionStore {
    conn: Mutex<Connection>,
    token_key: Vec<u8>,
}

impl ConnectionStore {
    /// Creates or opens a connection store.
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file (`:memory:` for tests)
    /// * `token_key_base64` - Base64-encoded 32-byte token encryption key
    pub fn new<P: AsRef<Path>>(db_path: P, token_key_base64: &str) -> Result<Self> {
        let key_bytes =
            encryption::validate_key(token_key_base64).context("Invalid token encryption key")?;

        let conn = Connection::open(db_path).context("Failed to open database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS platform_connections (
                id INTEGER PRIMARY KEY,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                access_token TEXT,
                refresh_token TEXT,
                expires_at TEXT,
                status TEXT NOT NULL,
                last_sync_at TEXT,
                last_sync_status TEXT,
                error_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, provider)
            )
            "#,
            [],
        )
        .context("Failed to create platform_connections table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_user_provider ON platform_connections(user_id, provider)",
            [],
        )
        .context("Failed to create index")?;

        Ok(Self {
            conn: Mutex::new(conn),
            token_key: key_bytes,
        })
    }

    /// Stores tokens for a (user, provider) pair, creating or replacing the row.
    ///
    /// The row comes out `connected` with a zeroed error count, used both
    /// for first-time connects and for reconnects after an error.
    pub fn upsert_tokens(&self, user_id: &str, provider: &str, tokens: &TokenSet) -> Result<()> {
        let access_ct = encryption::encrypt(&tokens.access_token, &self.token_key)
            .context("Failed to encrypt access token")?;

        let refresh_ct = match &tokens.refresh_token {
            Some(token) => Some(
                encryption::encrypt(token, &self.token_key)
                    .context("Failed to encrypt refresh token")?,
            ),
            None => None,
        };

        let now = Utc::now().to_rfc3339();

        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                INSERT INTO platform_connections (
                    user_id, provider,
                    access_token, refresh_token, expires_at,
                    status, error_count, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, 'connected', 0, ?6, ?6)
                ON CONFLICT(user_id, provider) DO UPDATE SET
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    expires_at = excluded.expires_at,
                    status = 'connected',
                    error_count = 0,
                    updated_at = excluded.updated_at
                "#,
                params![
                    user_id,
                    provider,
                    access_ct,
                    refresh_ct,
                    tokens.expires_at.to_rfc3339(),
                    now,
                ],
            )
            .context("Failed to store connection tokens")?;

        Ok(())
    }

    /// Retrieves and decrypts tokens for a connected (user, provider) pair.
    ///
    /// Returns `Ok(None)` when no row exists or the connection is not in
    /// `connected` status. Decryption failure marks the row `error` and
    /// returns [`TokenError::Corrupted`], never a silent disconnect.
    pub fn get(&self, user_id: &str, provider: &str) -> Result<Option<TokenSet>, TokenError> {
        let row = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                r#"
                SELECT access_token, refresh_token, expires_at, status
                FROM platform_connections
                WHERE user_id = ?1 AND provider = ?2
                "#,
                params![user_id, provider],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| TokenError::Database(e.into()))?
        };

        let Some((access_ct, refresh_ct, expires_at, status)) = row else {
            return Ok(None);
        };

        if ConnectionStatus::parse(&status) != Some(ConnectionStatus::Connected) {
            return Ok(None);
        }

        let (Some(access_ct), Some(expires_at)) = (access_ct, expires_at) else {
            // connected row missing ciphertext or expiry violates the store invariant
            self.corrupt(user_id, provider, "connected row missing token material");
            return Err(TokenError::Corrupted(
                "connected row missing token material".to_string(),
            ));
        };

        let access_token = match encryption::decrypt(&access_ct, &self.token_key) {
            Ok(t) => t,
            Err(e) => {
                self.corrupt(user_id, provider, &e.to_string());
                return Err(TokenError::Corrupted(e.to_string()));
            }
        };

        let refresh_token = match refresh_ct {
            Some(ct) => match encryption::decrypt(&ct, &self.token_key) {
                Ok(t) => Some(t),
                Err(e) => {
                    self.corrupt(user_id, provider, &e.to_string());
                    return Err(TokenError::Corrupted(e.to_string()));
                }
            },
            None => None,
        };

        let expires_at = DateTime::parse_from_rfc3339(&expires_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| TokenError::Database(e.into()))?;

        Ok(Some(TokenSet {
            access_token,
            refresh_token,
            expires_at,
        }))
    }

    /// Marks a connection as errored with a human-readable reason.
    pub fn mark_error(&self, user_id: &str, provider: &str, message: &str) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                UPDATE platform_connections
                SET status = 'error', last_sync_status = ?3, updated_at = ?4
                WHERE user_id = ?1 AND provider = ?2
                "#,
                params![user_id, provider, message, Utc::now().to_rfc3339()],
            )
            .context("Failed to mark connection error")?;
        Ok(())
    }

    /// Records one failed refresh attempt.
    ///
    /// Increments the error count; once the count reaches `threshold` the
    /// connection is demoted to `error` status, which removes it from the
    /// refresh scheduler's active set until the user reconnects.
    ///
    /// Returns the new error count.
    pub fn record_refresh_failure(
        &self,
        user_id: &str,
        provider: &str,
        message: &str,
        threshold: i64,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            r#"
            UPDATE platform_connections
            SET error_count = error_count + 1, last_sync_status = ?3, updated_at = ?4
            WHERE user_id = ?1 AND provider = ?2
            "#,
            params![user_id, provider, message, Utc::now().to_rfc3339()],
        )
        .context("Failed to record refresh failure")?;

        let count: i64 = conn
            .query_row(
                "SELECT error_count FROM platform_connections WHERE user_id = ?1 AND provider = ?2",
                params![user_id, provider],
                |row| row.get(0),
            )
            .context("Failed to read error count")?;

        if count >= threshold {
            conn.execute(
                r#"
                UPDATE platform_connections
                SET status = 'error', updated_at = ?3
                WHERE user_id = ?1 AND provider = ?2
                "#,
                params![user_id, provider, Utc::now().to_rfc3339()],
            )
            .context("Failed to demote connection to error")?;
        }

        Ok(count)
    }

    /// Disconnects a (user, provider) pair.
    ///
    /// Logical delete: the row flips to `disconnected` and both ciphertext
    /// fields are cleared. Idempotent: disconnecting a missing or already
    /// disconnected row succeeds.
    pub fn disconnect(&self, user_id: &str, provider: &str) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                UPDATE platform_connections
                SET status = 'disconnected',
                    access_token = NULL,
                    refresh_token = NULL,
                    expires_at = NULL,
                    updated_at = ?3
                WHERE user_id = ?1 AND provider = ?2
                "#,
                params![user_id, provider, Utc::now().to_rfc3339()],
            )
            .context("Failed to disconnect")?;
        Ok(())
    }

    /// Returns the current status of a (user, provider) pair, if a row exists.
    pub fn status(&self, user_id: &str, provider: &str) -> Result<Option<ConnectionStatus>> {
        let status: Option<String> = self
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT status FROM platform_connections WHERE user_id = ?1 AND provider = ?2",
                params![user_id, provider],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read connection status")?;

        Ok(status.and_then(|s| ConnectionStatus::parse(&s)))
    }

    /// Lists per-provider summaries for a user. Pure read, no token material.
    pub fn list_for_user(&self, user_id: &str) -> Result<Vec<ConnectionSummary>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT provider, status, expires_at, last_sync_at, last_sync_status, error_count
                FROM platform_connections
                WHERE user_id = ?1
                ORDER BY provider
                "#,
            )
            .context("Failed to prepare query")?;

        let summaries = stmt
            .query_map(params![user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .context("Failed to execute query")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read results")?;

        let mut out = Vec::with_capacity(summaries.len());
        for (provider, status, expires_at, last_sync_at, last_sync_status, error_count) in summaries
        {
            let Some(status) = ConnectionStatus::parse(&status) else {
                warn!(user_id = %user_id, provider = %provider, status = %status, "Skipping row with unknown status");
                continue;
            };
            out.push(ConnectionSummary {
                provider,
                status,
                expires_at: parse_ts(expires_at),
                last_sync_at: parse_ts(last_sync_at),
                last_sync_status,
                error_count,
            });
        }

        Ok(out)
    }

    /// Lists connected (user, provider) pairs whose tokens expire within the
    /// lookahead window. This is the refresh scheduler's work query; rows in
    /// `error` or `disconnected` status are excluded by construction.
    pub fn list_expiring(&self, within: Duration) -> Result<Vec<(String, String)>> {
        let cutoff = (Utc::now() + within).to_rfc3339();

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"
                SELECT user_id, provider
                FROM platform_connections
                WHERE status = 'connected' AND expires_at IS NOT NULL AND expires_at <= ?1
                ORDER BY expires_at
                "#,
            )
            .context("Failed to prepare query")?;

        let pairs = stmt
            .query_map(params![cutoff], |row| Ok((row.get(0)?, row.get(1)?)))
            .context("Failed to execute query")?
            .collect::<Result<Vec<(String, String)>, _>>()
            .context("Failed to read results")?;

        Ok(pairs)
    }

    /// Records the outcome of a data-extraction sync for a connection.
    ///
    /// Called by the (out-of-scope) extraction jobs through this crate's
    /// store handle; surfaced to the UI via [`ConnectionSummary`].
    pub fn record_sync(&self, user_id: &str, provider: &str, status_message: &str) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute(
                r#"
                UPDATE platform_connections
                SET last_sync_at = ?3, last_sync_status = ?4, updated_at = ?3
                WHERE user_id = ?1 AND provider = ?2
                "#,
                params![
                    user_id,
                    provider,
                    Utc::now().to_rfc3339(),
                    status_message
                ],
            )
            .context("Failed to record sync")?;
        Ok(())
    }

    fn corrupt(&self, user_id: &str, provider: &str, reason: &str) {
        warn!(
            user_id = %user_id,
            provider = %provider,
            reason = %reason,
            "Token ciphertext failed to decrypt, marking connection errored"
        );
        if let Err(e) = self.mark_error(user_id, provider, "token ciphertext corrupted") {
            warn!(user_id = %user_id, provider = %provider, error = %e, "Failed to mark corrupted connection");
        }
    }
}

fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    fn test_key() -> String {
        BASE64.encode([0u8; 32])
    }

    fn create_test_store() -> ConnectionStore {
        ConnectionStore::new(":memory:", &test_key()).expect("Failed to create test store")
    }

    fn test_tokens() -> TokenSet {
        TokenSet {
            access_token: "access-token-12345".to_string(),
            refresh_token: Some("refresh-token-67890".to_string()),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }

    #[test]
    fn test_upsert_and_get() {
        let store = create_test_store();
        let tokens = test_tokens();

        store
            .upsert_tokens("user1", "spotify", &tokens)
            .expect("Failed to store");

        let retrieved = store
            .get("user1", "spotify")
            .expect("Failed to get")
            .expect("Connection not found");

        assert_eq!(retrieved.access_token, tokens.access_token);
        assert_eq!(retrieved.refresh_token, tokens.refresh_token);
        assert_eq!(
            store.status("user1", "spotify").unwrap(),
            Some(ConnectionStatus::Connected)
        );
    }

    #[test]
    fn test_get_nonexistent() {
        let store = create_test_store();
        let result = store.get("user1", "spotify").expect("Failed to get");
        assert!(result.is_none());
    }

    #[test]
    fn test_upsert_replaces_tokens() {
        let store = create_test_store();
        store.upsert_tokens("user1", "spotify", &test_tokens()).unwrap();

        let newer = TokenSet {
            access_token: "new-access-token".to_string(),
            refresh_token: Some("new-refresh-token".to_string()),
            expires_at: Utc::now() + Duration::hours(2),
        };
        store.upsert_tokens("user1", "spotify", &newer).unwrap();

        let retrieved = store.get("user1", "spotify").unwrap().unwrap();
        assert_eq!(retrieved.access_token, newer.access_token);
        assert_eq!(retrieved.refresh_token, newer.refresh_token);
    }

    #[test]
    fn test_reconnect_resets_error_state() {
        let store = create_test_store();
        store.upsert_tokens("user1", "spotify", &test_tokens()).unwrap();
        store
            .record_refresh_failure("user1", "spotify", "provider down", 1)
            .unwrap();
        assert_eq!(
            store.status("user1", "spotify").unwrap(),
            Some(ConnectionStatus::Error)
        );

        // Reconnect via the callback path
        store.upsert_tokens("user1", "spotify", &test_tokens()).unwrap();
        assert_eq!(
            store.status("user1", "spotify").unwrap(),
            Some(ConnectionStatus::Connected)
        );

        let summary = &store.list_for_user("user1").unwrap()[0];
        assert_eq!(summary.error_count, 0);
    }

    #[test]
    fn test_tokens_encrypted_at_rest() {
        let store = create_test_store();
        let tokens = test_tokens();
        store.upsert_tokens("user1", "spotify", &tokens).unwrap();

        // Read the raw column and verify it is the three-part hex format,
        // not the plaintext token
        let raw: String = store
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT access_token FROM platform_connections WHERE user_id = 'user1'",
                [],
                |row| row.get(0),
            )
            .unwrap();

        assert_ne!(raw, tokens.access_token);
        assert!(!raw.contains(&tokens.access_token));
        assert_eq!(raw.split(':').count(), 3);
    }

    #[test]
    fn test_disconnect_is_logical_and_idempotent() {
        let store = create_test_store();
        store.upsert_tokens("user1", "spotify", &test_tokens()).unwrap();

        store.disconnect("user1", "spotify").unwrap();
        assert_eq!(
            store.status("user1", "spotify").unwrap(),
            Some(ConnectionStatus::Disconnected)
        );
        // Tokens are gone
        assert!(store.get("user1", "spotify").unwrap().is_none());

        // Ciphertext cleared in the row itself
        let raw: Option<String> = store
            .conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT access_token FROM platform_connections WHERE user_id = 'user1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(raw.is_none());

        // Disconnecting again (or a never-connected pair) still succeeds
        store.disconnect("user1", "spotify").unwrap();
        store.disconnect("user1", "youtube").unwrap();
    }

    #[test]
    fn test_corrupted_ciphertext_marks_error() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("connections.db");

        {
            let store = ConnectionStore::new(&db_path, &test_key()).unwrap();
            store.upsert_tokens("user1", "spotify", &test_tokens()).unwrap();
        }

        // Re-open with a different key: decryption must fail closed
        let other_key = BASE64.encode([9u8; 32]);
        let store = ConnectionStore::new(&db_path, &other_key).unwrap();

        let result = store.get("user1", "spotify");
        assert!(matches!(result, Err(TokenError::Corrupted(_))));

        // Connection forced into error status, not silently disconnected
        assert_eq!(
            store.status("user1", "spotify").unwrap(),
            Some(ConnectionStatus::Error)
        );
    }

    #[test]
    fn test_list_for_user() {
        let store = create_test_store();
        store.upsert_tokens("user1", "spotify", &test_tokens()).unwrap();
        store.upsert_tokens("user1", "github", &test_tokens()).unwrap();
        store.upsert_tokens("user2", "gmail", &test_tokens()).unwrap();

        store.disconnect("user1", "github").unwrap();

        let summaries = store.list_for_user("user1").unwrap();
        assert_eq!(summaries.len(), 2);

        let github = summaries.iter().find(|s| s.provider == "github").unwrap();
        assert_eq!(github.status, ConnectionStatus::Disconnected);
        assert!(github.expires_at.is_none());

        let spotify = summaries.iter().find(|s| s.provider == "spotify").unwrap();
        assert_eq!(spotify.status, ConnectionStatus::Connected);
        assert!(spotify.expires_at.is_some());

        assert!(store.list_for_user("user3").unwrap().is_empty());
    }

    #[test]
    fn test_list_expiring_selects_only_near_expiry_connected() {
        let store = create_test_store();

        // Expires in 5 minutes, inside a 10-minute lookahead
        store
            .upsert_tokens(
                "user1",
                "spotify",
                &TokenSet {
                    access_token: "a".to_string(),
                    refresh_token: Some("r".to_string()),
                    expires_at: Utc::now() + Duration::minutes(5),
                },
            )
            .unwrap();

        // Expires in 2 hours, outside the lookahead
        store
            .upsert_tokens(
                "user1",
                "youtube",
                &TokenSet {
                    access_token: "a".to_string(),
                    refresh_token: Some("r".to_string()),
                    expires_at: Utc::now() + Duration::hours(2),
                },
            )
            .unwrap();

        // Near expiry but disconnected, excluded
        store
            .upsert_tokens(
                "user2",
                "gmail",
                &TokenSet {
                    access_token: "a".to_string(),
                    refresh_token: Some("r".to_string()),
                    expires_at: Utc::now() + Duration::minutes(3),
                },
            )
            .unwrap();
        store.disconnect("user2", "gmail").unwrap();

        let pairs = store.list_expiring(Duration::minutes(10)).unwrap();
        assert_eq!(pairs, vec![("user1".to_string(), "spotify".to_string())]);
    }

    #[test]
    fn test_refresh_failure_threshold_demotes() {
        let store = create_test_store();
        store.upsert_tokens("user1", "spotify", &test_tokens()).unwrap();

        for attempt in 1..=4 {
            let count = store
                .record_refresh_failure("user1", "spotify", "timeout", 5)
                .unwrap();
            assert_eq!(count, attempt);
            assert_eq!(
                store.status("user1", "spotify").unwrap(),
                Some(ConnectionStatus::Connected),
                "still connected below threshold"
            );
        }

        let count = store
            .record_refresh_failure("user1", "spotify", "timeout", 5)
            .unwrap();
        assert_eq!(count, 5);
        assert_eq!(
            store.status("user1", "spotify").unwrap(),
            Some(ConnectionStatus::Error)
        );

        // Errored connections leave the refresh scheduler's active set
        assert!(store.list_expiring(Duration::hours(24)).unwrap().is_empty());
    }

    #[test]
    fn test_record_sync() {
        let store = create_test_store();
        store.upsert_tokens("user1", "spotify", &test_tokens()).unwrap();

        store.record_sync("user1", "spotify", "ok").unwrap();

        let summary = &store.list_for_user("user1").unwrap()[0];
        assert!(summary.last_sync_at.is_some());
        assert_eq!(summary.last_sync_status.as_deref(), Some("ok"));
    }

    #[test]
    fn test_invalid_token_key_rejected() {
        assert!(ConnectionStore::new(":memory:", "short").is_err());
        assert!(ConnectionStore::new(":memory:", "not-valid-base64!@#$").is_err());
    }
}
