//! Configuration module for environment variable parsing.

use std::env;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Seconds between scheduler passes
    pub poll_interval_secs: u64,

    /// Maximum number of due sends claimed per executor batch
    pub batch_limit: usize,

    /// Maximum number of sends dispatched concurrently within a batch
    pub dispatch_concurrency: usize,

    /// Mail provider request timeout in milliseconds
    pub transport_timeout_ms: u64,

    /// Public base URL for the tracking endpoints, e.g.
    /// "https://mail.example.com/t"
    pub base_tracking_url: String,

    /// Optional site base URL for resolving scheme-less links before
    /// wrapping
    pub site_base_url: Option<String>,

    /// Fallback redirect for click requests without a usable target
    pub fallback_redirect_url: String,

    /// Port for the tracking web server to listen on
    pub port: u16,

    /// Mail provider HTTP API endpoint
    pub provider_api_url: String,

    /// Optional bearer token for the mail provider API
    pub provider_api_key: Option<String>,

    /// Optional path to a JSON seed file (contacts, templates, campaigns)
    /// loaded into the in-memory store at startup
    pub seed_file: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Config {
            poll_interval_secs: parse_env("POLL_INTERVAL_SECS", 60),

            batch_limit: parse_env("DISPATCH_BATCH_LIMIT", 500),

            dispatch_concurrency: parse_env("DISPATCH_CONCURRENCY", 16),

            transport_timeout_ms: parse_env("TRANSPORT_TIMEOUT_MS", 8000),

            base_tracking_url: env::var("BASE_TRACKING_URL")
                .unwrap_or_else(|_| "http://localhost:8080/t".to_string()),

            site_base_url: env::var("SITE_BASE_URL").ok(),

            fallback_redirect_url: env::var("FALLBACK_REDIRECT_URL")
                .unwrap_or_else(|_| "http://localhost:8080/".to_string()),

            port: parse_env("PORT", 8080),

            provider_api_url: env::var("PROVIDER_API_URL")
                .unwrap_or_else(|_| "http://localhost:2525/messages".to_string()),

            provider_api_key: env::var("PROVIDER_API_KEY").ok(),

            seed_file: env::var("SEED_FILE").ok(),
        }
    }
}

/// Parse an environment variable, falling back to a default.
fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_default() {
        let result: u64 = parse_env("SENDLOOP_NONEXISTENT_VAR", 42);
        assert_eq!(result, 42);
    }
}
