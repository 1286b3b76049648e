//! Tracing initialization with configurable logging formats.

use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogFormat, LogLevel, LoggingConfig, ObservabilityConfig};

/// Crates that are noisy at `info` and below.
const QUIET_DEPENDENCIES: &str = "hyper=warn,h2=warn,sqlx=warn,reqwest=warn,aws_config=warn,aws_smithy_runtime=warn,azure_core=warn";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level and filter.
/// Fails if a subscriber is already installed.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<(), TracingError> {
    let logging = &config.logging;
    let filter = build_env_filter(logging, std::env::var("RUST_LOG").ok().as_deref());

    tracing_subscriber::registry()
        .with(fmt_layer(logging).with_filter(filter))
        .try_init()
        .map_err(|e| TracingError::Init(e.to_string()))
}

fn fmt_layer(logging: &LoggingConfig) -> BoxedLayer {
    let base = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_file(logging.file_line)
        .with_line_number(logging.file_line);

    match (&logging.format, logging.timestamps) {
        (LogFormat::Pretty, true) => base.pretty().with_thread_ids(false).boxed(),
        (LogFormat::Pretty, false) => base
            .pretty()
            .with_thread_ids(false)
            .without_time()
            .boxed(),
        (LogFormat::Compact, true) => base.compact().with_target(true).boxed(),
        (LogFormat::Compact, false) => base.compact().with_target(true).without_time().boxed(),
        (LogFormat::Json, true) => base
            .json()
            .with_current_span(logging.include_spans)
            .boxed(),
        (LogFormat::Json, false) => base
            .json()
            .with_current_span(logging.include_spans)
            .without_time()
            .boxed(),
    }
}

fn level_directive(level: &LogLevel) -> &'static str {
    match level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

/// Build the filter from `RUST_LOG`, else the configured filter, else the
/// level with noisy dependencies quieted.
fn build_env_filter(config: &LoggingConfig, rust_log: Option<&str>) -> EnvFilter {
    let base_level = level_directive(&config.level);

    if let Some(env_filter) = rust_log {
        EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new(base_level))
    } else if let Some(filter) = &config.filter {
        let combined = format!("{base_level},{filter}");
        EnvFilter::try_new(combined).unwrap_or_else(|_| EnvFilter::new(base_level))
    } else {
        EnvFilter::new(format!("{base_level},{QUIET_DEPENDENCIES}"))
    }
}

/// Tracing initialization errors.
#[derive(Debug, thiserror::Error)]
pub enum TracingError {
    #[error("Failed to initialize tracing: {0}")]
    Init(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_quiets_dependencies() {
        let filter = build_env_filter(&LoggingConfig::default(), None).to_string();
        assert!(filter.contains("info"));
        assert!(filter.contains("sqlx=warn"));
    }

    #[test]
    fn test_configured_filter_is_appended() {
        let config = LoggingConfig {
            level: LogLevel::Debug,
            filter: Some("dbcleanup=trace".into()),
            ..Default::default()
        };
        let filter = build_env_filter(&config, None).to_string();
        assert!(filter.contains("debug"));
        assert!(filter.contains("dbcleanup=trace"));
    }

    #[test]
    fn test_rust_log_wins() {
        let config = LoggingConfig {
            filter: Some("dbcleanup=trace".into()),
            ..Default::default()
        };
        let filter = build_env_filter(&config, Some("warn")).to_string();
        assert_eq!(filter, "warn");
    }

    #[test]
    fn test_invalid_rust_log_falls_back_to_level() {
        let config = LoggingConfig {
            level: LogLevel::Error,
            ..Default::default()
        };
        let filter = build_env_filter(&config, Some("dbcleanup=loud")).to_string();
        assert_eq!(filter, "error");
    }
}
