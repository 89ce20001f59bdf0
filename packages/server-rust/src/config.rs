//! Backend configuration.
//!
//! Every section has a `Default`; documents only need to name the fields they
//! override. Environment overrides are applied on top of the defaults by
//! [`BackendConfig::from_env`].

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

/// Environment variable overriding [`LoggingConfig::filter`].
pub const ENV_LOG: &str = "LINTD_LOG";
/// Environment variable overriding [`LoggingConfig::json`] (`true`/`false`/`1`/`0`).
pub const ENV_LOG_JSON: &str = "LINTD_LOG_JSON";
/// Environment variable overriding [`EngineConfig::analysis_expiration`], in milliseconds.
pub const ENV_ANALYSIS_EXPIRATION_MS: &str = "LINTD_ANALYSIS_EXPIRATION_MS";

/// Top-level backend configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub logging: LoggingConfig,
    pub engine: EngineConfig,
    pub cache: CacheConfig,
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `"info,lintd_server=debug"`. `RUST_LOG`
    /// takes precedence when set.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// Analysis engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Queued analyses older than this are canceled instead of executed.
    #[serde(with = "duration_ms", rename = "analysis_expiration_ms")]
    pub analysis_expiration: Duration,
    /// Name of the engine worker, used in logs.
    pub worker_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            analysis_expiration: Duration::from_secs(60),
            worker_name: "lintd-analysis-engine".to_string(),
        }
    }
}

/// Settings shared by the backend's loading caches.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Prefix for cache names; each cache's refresh thread is named
    /// `<prefix>-<cache>-refresh`.
    pub worker_name_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            worker_name_prefix: "lintd-cache".to_string(),
        }
    }
}

impl CacheConfig {
    /// Full name for the cache called `cache`.
    #[must_use]
    pub fn cache_name(&self, cache: &str) -> String {
        format!("{}-{cache}", self.worker_name_prefix)
    }
}

impl BackendConfig {
    /// Parses a JSON document. Missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if `json` is not valid JSON or a field has the wrong type.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Defaults overridden by the `LINTD_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Applies overrides looked up through `lookup`. Malformed values are
    /// ignored and the current value kept.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(filter) = lookup(ENV_LOG) {
            self.logging.filter = filter;
        }
        if let Some(raw) = lookup(ENV_LOG_JSON) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.logging.json = true,
                "0" | "false" | "no" => self.logging.json = false,
                _ => debug!(var = ENV_LOG_JSON, value = %raw, "ignoring malformed override"),
            }
        }
        if let Some(raw) = lookup(ENV_ANALYSIS_EXPIRATION_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => self.engine.analysis_expiration = Duration::from_millis(ms),
                Err(err) => {
                    debug!(var = ENV_ANALYSIS_EXPIRATION_MS, value = %raw, error = %err, "ignoring malformed override");
                }
            }
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
