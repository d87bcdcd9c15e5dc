//! Server configuration, loaded from environment variables at startup.

use std::time::Duration;

use kiln_core::{DegradedQueuePolicy, LanePolicy, ReaperPolicy};

/// Runtime configuration for kiln-server.
///
/// Every field has a sensible default so the server works out-of-the-box
/// without any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:3000"`).
    pub bind_address: String,

    /// SQLite database URL (default: `"sqlite://kiln.db?mode=rwc"`).
    pub database_url: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Path to a model-catalog JSON file.  When unset the embedded default
    /// catalog is used.
    pub models_path: Option<String>,

    /// Base URL of the GPU worker fleet.
    pub worker_url: String,

    /// Accepted API keys (comma-separated).  Empty means authentication is
    /// disabled, for local development.
    pub api_keys: Vec<String>,

    /// Bearer token protecting the admin and worker-callback surfaces.
    /// Unset means those surfaces are open, for local development.
    pub admin_token: Option<String>,

    /// Serve Swagger UI at `/swagger-ui` (default: `true`).
    pub enable_swagger: bool,

    /// Comma-separated CORS origin allowlist; unset means wildcard.
    pub cors_allowed_origins: Option<String>,

    /// Degraded-queue depth limit.
    pub degraded_max_depth: usize,

    /// Degraded-queue maximum wait, in seconds.
    pub degraded_max_wait_secs: u64,

    /// Stale-task sweep cadence, in seconds.
    pub reaper_interval_secs: u64,

    /// Lane health-probe cadence, in seconds.
    pub probe_interval_secs: u64,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("KILN_BIND", "0.0.0.0:3000"),
            database_url: env_or("KILN_DATABASE_URL", "sqlite://kiln.db?mode=rwc"),
            log_level: env_or("KILN_LOG", "info"),
            log_json: env_flag("KILN_LOG_JSON", false),
            models_path: std::env::var("KILN_MODELS_PATH").ok(),
            worker_url: env_or("KILN_WORKER_URL", "http://127.0.0.1:8700"),
            api_keys: std::env::var("KILN_API_KEYS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
            admin_token: std::env::var("KILN_ADMIN_TOKEN").ok(),
            enable_swagger: env_flag("KILN_ENABLE_SWAGGER", true),
            cors_allowed_origins: std::env::var("KILN_CORS_ORIGINS").ok(),
            degraded_max_depth: parse_env("KILN_DEGRADED_MAX_DEPTH", 25),
            degraded_max_wait_secs: parse_env("KILN_DEGRADED_MAX_WAIT_SECS", 30),
            reaper_interval_secs: parse_env("KILN_REAPER_INTERVAL_SECS", 30),
            probe_interval_secs: parse_env("KILN_PROBE_INTERVAL_SECS", 15),
        }
    }

    pub fn degraded_policy(&self) -> DegradedQueuePolicy {
        DegradedQueuePolicy {
            max_depth: self.degraded_max_depth,
            max_wait: Duration::from_secs(self.degraded_max_wait_secs),
        }
    }

    pub fn reaper_policy(&self) -> ReaperPolicy {
        ReaperPolicy {
            interval: Duration::from_secs(self.reaper_interval_secs),
            ..ReaperPolicy::default()
        }
    }

    pub fn lane_policy(&self) -> LanePolicy {
        LanePolicy::default()
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
