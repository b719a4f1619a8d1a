//! Server configuration — all from environment variables.

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address for the WebSocket endpoint.
    pub listen_addr: String,
    /// Log level filter.
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            listen_addr: env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8443".into()),
            log_level: env::var("RUST_LOG")
                .unwrap_or_else(|_| "strandd=info,strand=info,tower_http=info".into()),
        }
    }
}
