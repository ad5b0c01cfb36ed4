// crates/observability/src/lib.rs
//! Tracing bootstrap shared by the binaries.
//!
//! Console output is compact text unless JSON is requested. When a log
//! directory is configured, a second JSON layer writes to a daily-rotated
//! file through a non-blocking writer; keep the returned guard alive for
//! the life of the process or buffered lines are lost on exit.

use std::path::Path;

use anyhow::Context;
use charart_core::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub const DEFAULT_FILTER: &str = "warn,charart=info";

/// Log file prefix inside the configured directory.
pub const LOG_FILE: &str = "charart.jsonl";

/// `RUST_LOG` wins, then the configured filter, then [`DEFAULT_FILTER`].
pub fn filter_directives(env: Option<String>, configured: Option<&str>) -> String {
    env.filter(|s| !s.trim().is_empty())
        .or_else(|| {
            configured
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

pub fn env_filter(config: &LoggingConfig) -> anyhow::Result<EnvFilter> {
    let directives = filter_directives(
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
        config.filter.as_deref(),
    );
    EnvFilter::try_new(&directives).with_context(|| format!("invalid log filter {directives:?}"))
}

/// Install the global subscriber.
pub fn init_tracing(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = env_filter(config)?;

    let console = if config.json {
        fmt::layer().json().with_current_span(true).boxed()
    } else {
        fmt::layer().compact().boxed()
    };

    let (file, guard) = match config.directory.as_deref() {
        Some(dir) => {
            let (writer, guard) = file_writer(dir)?;
            let layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .context("tracing subscriber already installed")?;

    Ok(guard)
}

fn file_writer(dir: &Path) -> anyhow::Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating log directory {}", dir.display()))?;
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE);
    Ok(tracing_appender::non_blocking(appender))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_filter_precedence() {
        assert_eq!(filter_directives(None, None), DEFAULT_FILTER);
        assert_eq!(filter_directives(None, Some("debug")), "debug");
        assert_eq!(
            filter_directives(Some("charart_core=trace".into()), Some("debug")),
            "charart_core=trace"
        );
        assert_eq!(filter_directives(Some("  ".into()), Some(" ")), DEFAULT_FILTER);
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }
}
