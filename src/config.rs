//! Configuration module — environment-based configuration.

use std::env;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string. Absent selects the in-memory store.
    pub database_url: Option<String>,

    /// How often the dispatcher polls for due deliveries.
    pub dispatch_poll_interval_ms: u64,

    /// Default per-step timeout when a step doesn't set `config.timeoutMs`.
    pub default_step_timeout_ms: u64,

    /// HTTP endpoint `Tool` steps are routed to. Absent means `Tool` steps
    /// fail closed rather than pass through — unlike optional enrichment
    /// steps, a tool's output is load-bearing for downstream refs.
    pub tool_invoker_endpoint: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let dispatch_poll_interval_ms = env::var("DISPATCH_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1_000);

        let default_step_timeout_ms = env::var("DEFAULT_STEP_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30_000);

        Self {
            database_url: env::var("DATABASE_URL").ok(),
            dispatch_poll_interval_ms,
            default_step_timeout_ms,
            tool_invoker_endpoint: env::var("TOOL_INVOKER_ENDPOINT").ok(),
        }
    }
}
