//! Application configuration loaded from environment variables.

use std::time::Duration;

use saga::{OrchestratorConfig, ServiceDirectory};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid SAGA_SERVICE_URLS entry '{0}': expected service=url")]
    InvalidServiceUrl(String),
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `SAGA_SERVICE_URLS`: comma-separated `service=url` overrides
/// - `SAGA_CALL_DEADLINE_MS`: per-call deadline (default: `10000`)
/// - `SAGA_CLEANUP_MAX_AGE_HOURS`: age at which finished sagas are dropped (default: `24`)
/// - `SAGA_CLEANUP_INTERVAL_SECS`: background cleanup period (default: `3600`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub service_urls: Vec<(String, String)>,
    pub call_deadline: Duration,
    pub cleanup_max_age: Duration,
    pub cleanup_interval: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        let service_urls = match lookup("SAGA_SERVICE_URLS") {
            Some(raw) => parse_service_urls(&raw)?,
            None => Vec::new(),
        };

        Ok(Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            service_urls,
            call_deadline: number("SAGA_CALL_DEADLINE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.call_deadline),
            cleanup_max_age: number("SAGA_CLEANUP_MAX_AGE_HOURS")
                .map(|h| Duration::from_secs(h.saturating_mul(3600)))
                .unwrap_or(defaults.cleanup_max_age),
            cleanup_interval: number("SAGA_CLEANUP_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.cleanup_interval),
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_call_deadline(self.call_deadline)
            .with_cleanup_max_age(self.cleanup_max_age)
    }

    /// The built-in parking directory with configured base URLs applied.
    pub fn directory(&self) -> ServiceDirectory {
        let mut directory = ServiceDirectory::parking_defaults();
        for (service, url) in &self.service_urls {
            directory.set_service(service.as_str(), url.as_str());
        }
        directory
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            service_urls: Vec::new(),
            call_deadline: Duration::from_secs(10),
            cleanup_max_age: Duration::from_secs(24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

fn parse_service_urls(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((service, url)) if !service.trim().is_empty() && !url.trim().is_empty() => {
                Ok((service.trim().to_string(), url.trim().to_string()))
            }
            _ => Err(ConfigError::InvalidServiceUrl(entry.to_string())),
        })
        .collect()
}
