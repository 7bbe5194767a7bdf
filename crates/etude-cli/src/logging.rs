//! Tracing subscriber setup for the `etude` binary.
//!
//! `RUST_LOG` always wins; otherwise the level given on the command line is
//! used.

use clap::ValueEnum;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Output format of the log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Compact single-line output.
    #[default]
    Plain,
    /// Multi-line, colourised output with thread ids and line numbers.
    Pretty,
    /// One JSON object per line, for log shippers.
    Json,
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber. Call once, before the server starts.
pub fn init_logging(format: LogFormat, level: &str) {
    let registry = tracing_subscriber::registry().with(filter(level));
    match format {
        LogFormat::Plain => registry
            .with(tracing_subscriber::fmt::layer().with_thread_names(true))
            .init(),
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_line_number(true)
                    .with_thread_ids(true)
                    .with_target(true),
            )
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}
