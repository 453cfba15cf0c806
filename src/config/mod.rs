//! Service configuration.
//!
//! Tunables come from a TOML file with defaults for every field. Secrets
//! never live here: encryption keys and per-provider client credentials
//! are read from the environment at startup (`TWINLINK_STATE_KEY`,
//! `TWINLINK_TOKEN_KEY`, `TWINLINK_OAUTH_{PROVIDER}_CLIENT_ID/_SECRET`).

use serde::Deserialize;

/// Complete twinlink configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub oauth: OAuthFlowConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Externally reachable base URL; the OAuth redirect URI is built from it
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            public_base_url: default_public_base_url(),
        }
    }
}

/// Connection store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "connections.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Authorization-initiation rate limiting
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per caller key per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    /// Window length in seconds
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

fn default_max_requests() -> u32 {
    10
}

fn default_window_seconds() -> u64 {
    900
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_seconds: default_window_seconds(),
        }
    }
}

/// Refresh scheduler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Tick period in seconds
    #[serde(default = "default_refresh_interval")]
    pub interval_seconds: u64,
    /// Refresh tokens expiring within this many seconds
    #[serde(default = "default_lookahead")]
    pub lookahead_seconds: i64,
    /// Failures before a connection is demoted to error status
    #[serde(default = "default_error_threshold")]
    pub error_threshold: i64,
    /// Timeout for provider token-endpoint calls
    #[serde(default = "default_http_timeout")]
    pub http_timeout_seconds: u64,
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_lookahead() -> i64 {
    600
}

fn default_error_threshold() -> i64 {
    5
}

fn default_http_timeout() -> u64 {
    15
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_refresh_interval(),
            lookahead_seconds: default_lookahead(),
            error_threshold: default_error_threshold(),
            http_timeout_seconds: default_http_timeout(),
        }
    }
}

/// OAuth flow tunables
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthFlowConfig {
    /// State TTL in seconds
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: i64,
    /// How often the consumed-nonce set is swept
    #[serde(default = "default_nonce_cleanup_interval")]
    pub nonce_cleanup_interval_seconds: u64,
}

fn default_state_ttl() -> i64 {
    600
}

fn default_nonce_cleanup_interval() -> u64 {
    300
}

impl Default for OAuthFlowConfig {
    fn default() -> Self {
        Self {
            state_ttl_seconds: default_state_ttl(),
            nonce_cleanup_interval_seconds: default_nonce_cleanup_interval(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            rate_limit: RateLimitConfig::default(),
            refresh: RefreshConfig::default(),
            oauth: OAuthFlowConfig::default(),
        }
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &str) -> Result<AppConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.rate_limit.max_requests, 10);
        assert_eq!(config.rate_limit.window_seconds, 900);
        assert_eq!(config.refresh.interval_seconds, 300);
        assert_eq!(config.refresh.lookahead_seconds, 600);
        assert_eq!(config.refresh.error_threshold, 5);
        assert_eq!(config.oauth.state_ttl_seconds, 600);
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [server]
            bind_addr = "127.0.0.1:8080"
            public_base_url = "https://twin.example.com"

            [storage]
            db_path = "/var/lib/twinlink/connections.db"

            [rate_limit]
            max_requests = 5
            window_seconds = 60

            [refresh]
            interval_seconds = 120
            lookahead_seconds = 300
            error_threshold = 3
            http_timeout_seconds = 10

            [oauth]
            state_ttl_seconds = 300
        "#;

        let config: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.public_base_url, "https://twin.example.com");
        assert_eq!(config.storage.db_path, "/var/lib/twinlink/connections.db");
        assert_eq!(config.rate_limit.max_requests, 5);
        assert_eq!(config.refresh.error_threshold, 3);
        assert_eq!(config.oauth.state_ttl_seconds, 300);
    }

    #[test]
    fn test_partial_config() {
        // Missing sections use defaults
        let toml = r#"
            [rate_limit]
            max_requests = 3
        "#;

        let config: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.rate_limit.max_requests, 3);
        assert_eq!(config.rate_limit.window_seconds, 900); // Default
        assert_eq!(config.refresh.interval_seconds, 300); // Default
    }
}
