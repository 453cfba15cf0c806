// HTTP APIs: OAuth flow and connection status
pub mod api;

// Caller identity extraction
pub mod auth;

// Service configuration
pub mod config;

// Encrypted platform-connection storage
pub mod connections;

// Authorization-initiation rate limiting
pub mod rate_limit;

// Background token refresh
pub mod refresh;
