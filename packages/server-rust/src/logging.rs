//! Process-wide `tracing` subscriber installation.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::LoggingConfig;

/// Errors from [`init`].
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

/// Builds the filter: `RUST_LOG` when set, the configured directive otherwise.
///
/// # Errors
///
/// Returns [`LoggingError::InvalidFilter`] if the configured directive does
/// not parse.
pub fn env_filter(config: &LoggingConfig) -> Result<EnvFilter, LoggingError> {
    if let Ok(from_env) = EnvFilter::try_from_default_env() {
        return Ok(from_env);
    }
    EnvFilter::try_new(&config.filter).map_err(|source| LoggingError::InvalidFilter {
        filter: config.filter.clone(),
        source,
    })
}

/// Installs the global subscriber: env filter, then a human-readable or JSON
/// formatting layer on stderr.
///
/// # Errors
///
/// Fails if the filter is invalid or a subscriber was already installed
/// (for instance by a second call).
pub fn init(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = env_filter(config)?;
    let base = Registry::default().with(filter);

    if config.json {
        base.with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_writer(std::io::stderr),
        )
        .try_init()?;
    } else {
        base.with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_writer(std::io::stderr),
        )
        .try_init()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_filter() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            filter: "lintd_server=notalevel".to_string(),
            json: false,
        };
        assert!(matches!(
            env_filter(&config),
            Err(LoggingError::InvalidFilter { .. })
        ));
    }

    #[test]
    fn second_init_fails_instead_of_panicking() {
        let config = LoggingConfig::default();
        let first = init(&config);
        let second = init(&config);
        // The first call may already lose to another test's subscriber.
        assert!(first.is_ok() || matches!(first, Err(LoggingError::AlreadyInitialized(_))));
        assert!(matches!(second, Err(LoggingError::AlreadyInitialized(_))));
    }
}
