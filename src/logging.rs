//! Structured logging initialization.
//!
//! The RUST_LOG environment variable takes precedence over the configured
//! level.

use crate::config::{LogFormat, LoggingConfig};

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global subscriber for `config`.
///
/// Fails if a global subscriber is already set.
///
/// ```no_run
/// use async_unary::config::LoggingConfig;
///
/// async_unary::logging::init(&LoggingConfig::default()).unwrap();
/// tracing::info!("ready");
/// ```
pub fn init(config: &LoggingConfig) -> Result<(), TryInitError> {
    let filter = filter(config);
    let timed = config.timestamps;
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Pretty => registry
            .with(timed.then(|| {
                fmt::layer()
                    .with_ansi(true)
                    .with_target(config.target)
                    .with_thread_names(config.thread_names)
            }))
            .with((!timed).then(|| {
                fmt::layer()
                    .with_ansi(true)
                    .with_target(config.target)
                    .with_thread_names(config.thread_names)
                    .without_time()
            }))
            .try_init(),
        LogFormat::Json => registry
            .with(timed.then(|| {
                fmt::layer()
                    .json()
                    .with_target(config.target)
                    .with_thread_names(config.thread_names)
            }))
            .with((!timed).then(|| {
                fmt::layer()
                    .json()
                    .with_target(config.target)
                    .with_thread_names(config.thread_names)
                    .without_time()
            }))
            .try_init(),
        LogFormat::Compact => registry
            .with(timed.then(|| {
                fmt::layer()
                    .compact()
                    .with_target(config.target)
                    .with_thread_names(config.thread_names)
            }))
            .with((!timed).then(|| {
                fmt::layer()
                    .compact()
                    .with_target(config.target)
                    .with_thread_names(config.thread_names)
                    .without_time()
            }))
            .try_init(),
    }
}

fn filter(config: &LoggingConfig) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let config = LoggingConfig {
            level: "warn".to_string(),
            format: LogFormat::Compact,
            timestamps: false,
            ..LoggingConfig::default()
        };
        // The first attempt may race another test for the global subscriber.
        let _ = init(&config);
        assert!(init(&config).is_err());
    }
}
