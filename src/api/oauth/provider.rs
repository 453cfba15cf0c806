//! OAuth provider registry.
//!
//! One data table keyed by provider id drives the whole flow: adding a
//! platform means adding an entry here, not a new code path. Client
//! credentials come from the environment
//! (`TWINLINK_OAUTH_{PROVIDER}_CLIENT_ID` / `_CLIENT_SECRET`), never from
//! code. Endpoint URLs can be overridden per provider
//! (`TWINLINK_OAUTH_{PROVIDER}_AUTH_URL` / `_TOKEN_URL`) for local
//! development against a stub authorization server.
//!
//! PKCE is sent to every provider, including those that treat it as
//! optional.

use serde::{Deserialize, Serialize};

/// OAuth provider configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// OAuth authorization endpoint URL
    pub auth_url: String,

    /// OAuth token exchange endpoint URL
    pub token_url: String,

    /// Identity endpoint for the post-connect confirmation (optional)
    pub identity_url: Option<String>,

    /// Required OAuth scopes
    pub scopes: Vec<String>,

    /// Client ID (from environment variable)
    pub client_id: String,

    /// Client secret (from environment variable)
    pub client_secret: String,
}

impl ProviderConfig {
    /// Builds the authorization request URL.
    pub fn build_auth_url(
        &self,
        state: &str,
        redirect_uri: &str,
        code_challenge: &str,
    ) -> String {
        let scopes = self.scopes.join(" ");
        format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&code_challenge={}&code_challenge_method=S256",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state),
            urlencoding::encode(code_challenge),
        )
    }
}

/// The platforms the twin can draw a signature from.
pub const AVAILABLE_PROVIDERS: &[&str] = &["spotify", "youtube", "github", "gmail", "discord"];

/// Get provider configuration by id.
///
/// Returns `None` when the provider is unknown or its client credentials
/// are not present in the environment.
pub fn get_provider_config(provider: &str) -> Option<ProviderConfig> {
    let env_prefix = provider.to_uppercase();
    let client_id = std::env::var(format!("TWINLINK_OAUTH_{}_CLIENT_ID", env_prefix)).ok()?;
    let client_secret =
        std::env::var(format!("TWINLINK_OAUTH_{}_CLIENT_SECRET", env_prefix)).ok()?;

    let (auth_url, token_url, identity_url, scopes) = match provider {
        "spotify" => (
            "https://accounts.spotify.com/authorize",
            "https://accounts.spotify.com/api/token",
            Some("https://api.spotify.com/v1/me"),
            vec!["user-read-recently-played", "user-top-read"],
        ),
        "youtube" => (
            "https://accounts.google.com/o/oauth2/v2/auth",
            "https://oauth2.googleapis.com/token",
            Some("https://openidconnect.googleapis.com/v1/userinfo"),
            vec!["https://www.googleapis.com/auth/youtube.readonly"],
        ),
        "github" => (
            "https://github.com/login/oauth/authorize",
            "https://github.com/login/oauth/access_token",
            Some("https://api.github.com/user"),
            vec!["repo", "read:user"],
        ),
        "gmail" => (
            "https://accounts.google.com/o/oauth2/v2/auth",
            "https://oauth2.googleapis.com/token",
            Some("https://openidconnect.googleapis.com/v1/userinfo"),
            vec!["https://www.googleapis.com/auth/gmail.readonly"],
        ),
        "discord" => (
            "https://discord.com/oauth2/authorize",
            "https://discord.com/api/oauth2/token",
            Some("https://discord.com/api/users/@me"),
            vec!["identify", "email"],
        ),
        _ => return None,
    };

    let auth_url = std::env::var(format!("TWINLINK_OAUTH_{}_AUTH_URL", env_prefix))
        .unwrap_or_else(|_| auth_url.to_string());
    let token_url = std::env::var(format!("TWINLINK_OAUTH_{}_TOKEN_URL", env_prefix))
        .unwrap_or_else(|_| token_url.to_string());
    let identity_url = std::env::var(format!("TWINLINK_OAUTH_{}_IDENTITY_URL", env_prefix))
        .ok()
        .or_else(|| identity_url.map(String::from));

    Some(ProviderConfig {
        auth_url,
        token_url,
        identity_url,
        scopes: scopes.into_iter().map(String::from).collect(),
        client_id,
        client_secret,
    })
}

/// Check if a provider id is known.
pub fn is_valid_provider(name: &str) -> bool {
    AVAILABLE_PROVIDERS.contains(&name)
}
