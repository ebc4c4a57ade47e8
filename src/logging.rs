// ============================================================================
// LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// A human-readable stdout stream plus a persisted log file, both filtered by
// the same level. `RUST_LOG` still wins when set.
// ============================================================================

use std::fs;

use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::error::{AgentError, AgentResult};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Keeps the file writer alive; dropping it flushes buffered records.
#[derive(Debug)]
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

/// Map a configured level name to a filter, defaulting to INFO.
pub fn level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> AgentResult<LogGuard> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter(&config.level).into())
        .from_env_lossy();

    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.stdout {
        layers.push(format_layer(&config.format, std::io::stdout, config.colors));
    }

    let mut file_guard = None;
    if config.file {
        fs::create_dir_all(&config.directory).map_err(|e| {
            AgentError::Logging(format!("cannot create {}: {}", config.directory.display(), e))
        })?;

        let appender = RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(config.file_name.as_str())
            .build(&config.directory)
            .map_err(|e| {
                AgentError::Logging(format!("cannot open {}: {}", config.file_path().display(), e))
            })?;

        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(format_layer(&config.format, writer, false));
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| AgentError::Logging(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "telemetry::init",
        level = %config.level,
        format = %config.format,
        file = %config.file_path().display(),
        "Logging initialized"
    );

    Ok(LogGuard { _file: file_guard })
}

fn format_layer<W>(format: &str, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    match format {
        "json" => layer.json().boxed(),
        "pretty" => layer.pretty().boxed(),
        _ => layer.compact().boxed(),
    }
}
