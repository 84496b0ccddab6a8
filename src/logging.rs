use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::app::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "orchestrator.log";

/// Default directive when `RUST_LOG` is unset.
pub fn default_directive(level: &str) -> String {
    format!("ai_orchestrator={}", level.trim().to_ascii_lowercase())
}

fn make_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(level)))
}

/// Installs the global subscriber. `RUST_LOG` overrides the configured
/// level. When file logging is on, the returned guard must be held until
/// exit or buffered lines are lost. A disabled config installs nothing.
pub fn init_logging(config: &LoggingConfig, logs_dir: &Path) -> Option<WorkerGuard> {
    if !config.enabled {
        return None;
    }

    let (writer, guard) = if config.file {
        let appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        (BoxMakeWriter::new(non_blocking), Some(guard))
    } else {
        (BoxMakeWriter::new(std::io::stderr), None)
    };

    let filter = make_filter(&config.level);
    if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(writer)
            .with_current_span(false)
            .try_init()
            .ok();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_target(false)
            .with_ansi(!config.file)
            .try_init()
            .ok();
    }

    guard
}
