//! Background token refresh.
//!
//! A single recurring task keeps every connected pair's access token valid
//! without user intervention. Each tick queries the store for connections
//! expiring inside the lookahead window and refreshes them; attempts fan
//! out concurrently across pairs but serialize per (user, provider): most
//! providers invalidate the old refresh token on rotation, so two
//! overlapping refreshes for one pair could strand the connection.
//!
//! Retry policy lives here and only here: a failed attempt increments the
//! row's error count and is retried on later ticks until the threshold
//! demotes the connection to `error`, which removes it from the active set
//! until the user reconnects.

use crate::api::oauth::{get_provider_config, refresh_grant};
use crate::connections::{ConnectionStatus, ConnectionStore, TokenError};
use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// What a single refresh attempt did.
#[derive(Debug, PartialEq)]
pub enum RefreshOutcome {
    /// New tokens obtained and stored.
    Refreshed,
    /// Another attempt renewed the pair while this one waited on the lock.
    SkippedFresh,
    /// Row missing, disconnected, or errored; nothing to do.
    SkippedNotConnected,
    /// Ciphertext failed to decrypt; the store marked the row `error`.
    Corrupted,
    /// Provider call failed (or the pair cannot be refreshed); error count updated.
    Failed { error_count: i64 },
}

/// Recurring refresh task over the connection store.
pub struct RefreshScheduler {
    store: Arc<ConnectionStore>,
    http_client: reqwest::Client,
    interval: Duration,
    lookahead: chrono::Duration,
    error_threshold: i64,
    /// Per-pair locks enforcing one in-flight refresh per (user, provider)
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RefreshScheduler {
    /// # Arguments
    /// * `http_client` - Shared client; must carry a bounded request timeout
    /// * `interval_seconds` - Tick period
    /// * `lookahead_seconds` - Refresh tokens expiring within this window
    /// * `error_threshold` - Consecutive failures before demotion to `error`
    pub fn new(
        store: Arc<ConnectionStore>,
        http_client: reqwest::Client,
        interval_seconds: u64,
        lookahead_seconds: i64,
        error_threshold: i64,
    ) -> Self {
        Self {
            store,
            http_client,
            interval: Duration::from_secs(interval_seconds),
            lookahead: chrono::Duration::seconds(lookahead_seconds),
            error_threshold,
            locks: DashMap::new(),
        }
    }

    /// Starts the tick loop (non-blocking).
    ///
    /// Returns a JoinHandle that can be aborted for graceful shutdown.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        info!(
            interval_secs = self.interval.as_secs(),
            lookahead_secs = self.lookahead.num_seconds(),
            "Starting refresh scheduler"
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            loop {
                interval.tick().await;
                Arc::clone(&self).run_tick().await;
            }
        })
    }

    /// Runs one scheduler tick: refresh every pair inside the lookahead.
    pub async fn run_tick(self: Arc<Self>) {
        let pairs = match self.store.list_expiring(self.lookahead) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Refresh tick: failed to list expiring connections");
                return;
            }
        };

        if pairs.is_empty() {
            debug!("Refresh tick: nothing expiring");
            return;
        }

        info!(count = pairs.len(), "Refresh tick: renewing expiring connections");

        let mut handles = Vec::with_capacity(pairs.len());
        for (user_id, provider) in pairs {
            let scheduler = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                match scheduler.refresh_pair(&user_id, &provider).await {
                    Ok(outcome) => {
                        debug!(
                            user_id = %user_id,
                            provider = %provider,
                            outcome = ?outcome,
                            "Refresh attempt finished"
                        );
                    }
                    Err(e) => {
                        warn!(
                            user_id = %user_id,
                            provider = %provider,
                            error = %e,
                            "Refresh attempt aborted"
                        );
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Refreshes one (user, provider) pair under its per-pair lock.
    ///
    /// Holding the lock, the row is re-read: a concurrent attempt may have
    /// already renewed it (skip), or the user may have disconnected (skip,
    /// the disconnect wins and no stale tokens are written back).
    pub async fn refresh_pair(&self, user_id: &str, provider: &str) -> Result<RefreshOutcome> {
        let key = format!("{}:{}", user_id, provider);
        let lock = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let tokens = match self.store.get(user_id, provider) {
            Ok(Some(t)) => t,
            Ok(None) => return Ok(RefreshOutcome::SkippedNotConnected),
            Err(TokenError::Corrupted(reason)) => {
                error!(
                    user_id = %user_id,
                    provider = %provider,
                    reason = %reason,
                    "Stored tokens corrupted, connection requires reconnect"
                );
                return Ok(RefreshOutcome::Corrupted);
            }
            Err(TokenError::Database(e)) => return Err(e),
        };

        // A concurrent refresh may have landed while we waited on the lock
        if tokens.expires_at > chrono::Utc::now() + self.lookahead {
            return Ok(RefreshOutcome::SkippedFresh);
        }

        let Some(refresh_token) = tokens.refresh_token else {
            // Nothing to renew with; retrying cannot help
            warn!(user_id = %user_id, provider = %provider, "Token expiring with no refresh token");
            self.store
                .mark_error(user_id, provider, "access token expired, no refresh token")?;
            return Ok(RefreshOutcome::Failed { error_count: 0 });
        };

        let Some(config) = get_provider_config(provider) else {
            let count = self.store.record_refresh_failure(
                user_id,
                provider,
                "provider not configured",
                self.error_threshold,
            )?;
            warn!(user_id = %user_id, provider = %provider, "Refresh skipped: provider not configured");
            return Ok(RefreshOutcome::Failed { error_count: count });
        };

        info!(user_id = %user_id, provider = %provider, "Refreshing OAuth token");

        match refresh_grant(
            &self.http_client,
            &config.token_url,
            &refresh_token,
            &config.client_id,
            &config.client_secret,
        )
        .await
        {
            Ok(new_tokens) => {
                // Disconnect during the provider call wins: discard the result
                if self.store.status(user_id, provider)? != Some(ConnectionStatus::Connected) {
                    info!(
                        user_id = %user_id,
                        provider = %provider,
                        "Connection gone mid-refresh, discarding result"
                    );
                    return Ok(RefreshOutcome::SkippedNotConnected);
                }

                self.store.upsert_tokens(user_id, provider, &new_tokens)?;
                info!(user_id = %user_id, provider = %provider, "OAuth token refreshed");
                Ok(RefreshOutcome::Refreshed)
            }
            Err(e) => {
                let count = self.store.record_refresh_failure(
                    user_id,
                    provider,
                    &e.to_string(),
                    self.error_threshold,
                )?;
                if count >= self.error_threshold {
                    error!(
                        user_id = %user_id,
                        provider = %provider,
                        error_count = count,
                        "Refresh failures reached threshold, connection demoted"
                    );
                } else {
                    warn!(
                        user_id = %user_id,
                        provider = %provider,
                        error_count = count,
                        error = %e,
                        "Token refresh failed, will retry next tick"
                    );
                }
                Ok(RefreshOutcome::Failed { error_count: count })
            }
        }
    }
}
