//! Configuration module for Watchpost.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "watchpost.db")
    pub db_path: String,
    /// Delivery attempts before a queue item is marked failed (default: 5)
    pub max_retries: i64,
    /// Base delay for exponential backoff, in seconds (default: 1)
    pub base_retry_delay_secs: u64,
    /// Seconds a node may stay in `resuming` before the watchdog forces it
    /// back online (default: 300)
    pub resume_timeout_secs: u64,
    /// Seconds without a heartbeat before an online node is marked offline
    /// (default: 120)
    pub heartbeat_stale_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "watchpost.db".to_string(),
            max_retries: 5,
            base_retry_delay_secs: 1,
            resume_timeout_secs: 300,
            heartbeat_stale_secs: 120,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `WATCHPOST_HTTP_PORT`: HTTP port (default: 8080)
    /// - `WATCHPOST_DB_PATH`: Database file path (default: "watchpost.db")
    /// - `WATCHPOST_MAX_RETRIES`: Queue retry ceiling (default: 5)
    /// - `WATCHPOST_BASE_RETRY_DELAY`: Backoff base in seconds (default: 1)
    /// - `WATCHPOST_RESUME_TIMEOUT`: Stuck-resuming threshold in seconds (default: 300)
    /// - `WATCHPOST_HEARTBEAT_STALE`: Heartbeat staleness in seconds (default: 120)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(port_str) = env::var("WATCHPOST_HTTP_PORT") {
            if let Ok(port) = port_str.parse() {
                cfg.http_port = port;
            }
        }

        if let Ok(db_path) = env::var("WATCHPOST_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Ok(value) = env::var("WATCHPOST_MAX_RETRIES") {
            if let Ok(max_retries) = value.parse() {
                cfg.max_retries = max_retries;
            }
        }

        if let Ok(value) = env::var("WATCHPOST_BASE_RETRY_DELAY") {
            if let Ok(secs) = value.parse() {
                cfg.base_retry_delay_secs = secs;
            }
        }

        if let Ok(value) = env::var("WATCHPOST_RESUME_TIMEOUT") {
            if let Ok(secs) = value.parse() {
                cfg.resume_timeout_secs = secs;
            }
        }

        if let Ok(value) = env::var("WATCHPOST_HEARTBEAT_STALE") {
            if let Ok(secs) = value.parse() {
                cfg.heartbeat_stale_secs = secs;
            }
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "watchpost.db");
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.resume_timeout_secs, 300);
    }
}
