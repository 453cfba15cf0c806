// HTTP APIs: OAuth flow and connection status

pub mod connections;
pub mod oauth;

pub use connections::{create_connections_router, ConnectionsAppState};
pub use oauth::{create_oauth_router, run_nonce_cleanup, InMemoryNonceStore, OAuthAppState};
