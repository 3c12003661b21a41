//! Configuration loaded from environment variables with sensible defaults.

use std::env;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "nodewatch.db")
    pub db_path: String,
    /// Metrics rollup cadence in seconds (default: 3600)
    pub aggregate_interval_secs: u64,
    /// Retention cleanup cadence in seconds (default: 86400)
    pub cleanup_interval_secs: u64,
    /// Settings cache refresh cadence in seconds (default: 60)
    pub settings_refresh_secs: u64,
    /// Bootstrap admin session token, if the operator set one.
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "nodewatch.db".to_string(),
            aggregate_interval_secs: 3600,
            cleanup_interval_secs: 86400,
            settings_refresh_secs: 60,
            admin_token: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from `NODEWATCH_*` environment variables.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(port) = env::var("NODEWATCH_HTTP_PORT") {
            if let Ok(port) = port.parse() {
                cfg.http_port = port;
            }
        }
        if let Ok(db_path) = env::var("NODEWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Ok(secs) = env::var("NODEWATCH_AGGREGATE_INTERVAL_SECS") {
            if let Ok(secs) = secs.parse() {
                cfg.aggregate_interval_secs = secs;
            }
        }
        if let Ok(secs) = env::var("NODEWATCH_CLEANUP_INTERVAL_SECS") {
            if let Ok(secs) = secs.parse() {
                cfg.cleanup_interval_secs = secs;
            }
        }
        if let Ok(secs) = env::var("NODEWATCH_SETTINGS_REFRESH_SECS") {
            if let Ok(secs) = secs.parse() {
                cfg.settings_refresh_secs = secs;
            }
        }
        if let Ok(token) = env::var("NODEWATCH_ADMIN_TOKEN") {
            if !token.is_empty() {
                cfg.admin_token = Some(token);
            }
        }

        cfg
    }

    pub fn aggregate_interval(&self) -> Duration {
        Duration::from_secs(self.aggregate_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn settings_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.settings_refresh_secs.max(1))
    }
}
