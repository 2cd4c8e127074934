//! Structured logging for the collector.
//!
//! Records go to stderr, human readable or JSONL. stdout carries only
//! command payloads such as collection reports. Each collection runs inside
//! a `collect` span tagged with a run id from [`generate_run_id`].

pub mod config;

pub use config::{LogConfig, LogFormat, LogLevel};

use std::io::IsTerminal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Crate targets the default filter applies to.
const TARGETS: [&str; 3] = ["el_core", "el_common", "event_logger"];

fn default_filter(level: LogLevel) -> EnvFilter {
    let directives: Vec<String> = TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect();
    EnvFilter::new(directives.join(","))
}

/// Install the global subscriber. Later calls leave the first one in place.
///
/// A full `RUST_LOG` directive, when set, replaces the per-crate default.
pub fn init_logging(config: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(config.level));

    let installed = match config.format {
        LogFormat::Human => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_ansi(std::io::stderr().is_terminal()),
            )
            .try_init(),
        LogFormat::Jsonl => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    if installed.is_err() {
        tracing::debug!("logging already initialized");
    }
}

/// `run-` followed by 12 hex digits.
pub fn generate_run_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("run-{}", &hex[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_run_id() {
        let id1 = generate_run_id();
        let id2 = generate_run_id();

        assert!(id1.starts_with("run-"));
        assert_ne!(id1, id2);
        assert_eq!(id1.len(), 16);
        assert!(id1[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_default_filter_names_every_target() {
        let rendered = default_filter(LogLevel::Warn).to_string();
        for target in TARGETS {
            assert!(rendered.contains(&format!("{}=warn", target)), "{}", rendered);
        }
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        init_logging(&LogConfig::default());
        init_logging(&LogConfig::default());
    }
}
