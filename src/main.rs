use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::info;
use twinlink::api::oauth::NonceStore;
use twinlink::api::{
    create_connections_router, create_oauth_router, run_nonce_cleanup, ConnectionsAppState,
    InMemoryNonceStore, OAuthAppState,
};
use twinlink::config::{load_config, AppConfig};
use twinlink::connections::{encryption, ConnectionStore};
use twinlink::rate_limit::RateLimiter;
use twinlink::refresh::RefreshScheduler;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "twinlink=info".into()),
        )
        .init();

    info!("Twinlink starting...");

    // Optional config file; defaults cover a local setup
    let config = match std::env::var("TWINLINK_CONFIG") {
        Ok(path) => load_config(&path)
            .map_err(|e| anyhow::anyhow!("Failed to load config from {}: {}", path, e))?,
        Err(_) => AppConfig::default(),
    };

    // Distinct keys for the state parameter and for tokens at rest
    let state_key_b64 = std::env::var("TWINLINK_STATE_KEY")
        .context("TWINLINK_STATE_KEY is required (base64-encoded 32-byte key)")?;
    let state_key = encryption::validate_key(&state_key_b64)
        .context("TWINLINK_STATE_KEY is not a valid key")?;

    let token_key_b64 = std::env::var("TWINLINK_TOKEN_KEY")
        .context("TWINLINK_TOKEN_KEY is required (base64-encoded 32-byte key)")?;

    info!(
        db_path = %config.storage.db_path,
        bind_addr = %config.server.bind_addr,
        "Configuration loaded"
    );

    let connection_store = Arc::new(
        ConnectionStore::new(&config.storage.db_path, &token_key_b64)
            .context("Failed to initialize connection store")?,
    );
    info!("Connection store initialized");

    // Consumed nonces only need to outlive the state TTL
    let nonce_store: Arc<dyn NonceStore> =
        Arc::new(InMemoryNonceStore::new(config.oauth.state_ttl_seconds * 2));
    let cleanup_handle = tokio::spawn(run_nonce_cleanup(
        Arc::clone(&nonce_store),
        config.oauth.nonce_cleanup_interval_seconds,
    ));

    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit.max_requests,
        Duration::from_secs(config.rate_limit.window_seconds),
    ));

    // Shared outbound client; the timeout bounds every provider call
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.refresh.http_timeout_seconds))
        .build()
        .context("Failed to build HTTP client")?;

    let scheduler = Arc::new(RefreshScheduler::new(
        Arc::clone(&connection_store),
        http_client.clone(),
        config.refresh.interval_seconds,
        config.refresh.lookahead_seconds,
        config.refresh.error_threshold,
    ));
    let scheduler_handle = scheduler.start();
    info!("Refresh scheduler started");

    let oauth_router = create_oauth_router(OAuthAppState {
        connection_store: Arc::clone(&connection_store),
        nonce_store,
        rate_limiter,
        http_client,
        state_key,
        callback_base_url: config.server.public_base_url.clone(),
        state_ttl_seconds: config.oauth.state_ttl_seconds,
    });

    let connections_router = create_connections_router(ConnectionsAppState {
        connection_store,
        auth_enabled: true,
    });

    let app = oauth_router
        .merge(connections_router)
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .context("Failed to bind server address")?;
    info!(addr = %config.server.bind_addr, "Twinlink API listening");

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    server_handle.abort();
    scheduler_handle.abort();
    cleanup_handle.abort();
    info!("Twinlink stopped");

    Ok(())
}
