//! Logging infrastructure using tracing + tracing-subscriber
//!
//! Console output is always on; a rolling file is added when `[logging] file`
//! is set. `RUST_LOG` may still raise or lower individual modules.

use std::fs;
use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingSettings;
use crate::error::{Error, Result};

type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

/// Keeps the non-blocking file writer alive; drop flushes pending lines
pub struct LogGuards {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize the logging system
pub fn init_logging(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Result<LogGuards> {
    let level = determine_level(settings, verbose, quiet);

    let (file_layer, file_guard) = match settings.file {
        Some(ref log_file) => {
            let (layer, guard) =
                build_file_layer(log_file, settings.max_file_size_mb, settings.max_files, settings.json_format)?;
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(build_env_filter(level))
        .with(build_console_layer(settings.json_format))
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))?;

    tracing::debug!(level = %level, file = ?settings.file, json = settings.json_format, "Logging initialized");

    Ok(LogGuards { _file_guard: file_guard })
}

/// Minimal stderr logging for short-lived commands
pub fn init_simple(level: Level) -> Result<()> {
    tracing_subscriber::registry()
        .with(build_env_filter(level))
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))
}

/// CLI flags win over the configured level
fn determine_level(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => parse_level(&settings.level),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn parse_level(level_str: &str) -> Level {
    match level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn build_env_filter(level: Level) -> EnvFilter {
    let base = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    match format!("meshnote={}", level).parse() {
        Ok(directive) => base.add_directive(directive),
        Err(_) => base,
    }
}

fn build_console_layer<S>(json_format: bool) -> BoxedLayer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    if json_format {
        Box::new(fmt::layer().json().with_target(true).with_writer(std::io::stderr))
    } else {
        Box::new(
            fmt::layer()
                .with_target(true)
                .with_ansi(true)
                .compact()
                .with_writer(std::io::stderr),
        )
    }
}

/// Rolling file layer; tracing-appender rotates on time, so small size
/// limits map to hourly files and everything else to daily files
fn build_file_layer<S>(
    log_file: &str,
    max_size_mb: u64,
    max_files: u32,
    json_format: bool,
) -> Result<(BoxedLayer<S>, WorkerGuard)>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let path = Path::new(log_file);
    let directory = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(directory).map_err(|e| Error::IoWrite {
        path: directory.to_path_buf(),
        source: e,
    })?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("meshnote.log");

    let rotation = if max_size_mb > 0 && max_size_mb < 10 {
        Rotation::HOURLY
    } else {
        Rotation::DAILY
    };

    let appender = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(file_name)
        .filename_suffix("log")
        .max_log_files(max_files as usize)
        .build(directory)
        .map_err(|e| Error::Config(format!("Failed to create log file appender: {}", e)))?;

    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer: BoxedLayer<S> = if json_format {
        Box::new(
            fmt::layer()
                .json()
                .with_writer(writer)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_ansi(false),
        )
    } else {
        Box::new(
            fmt::layer()
                .with_writer(writer)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_ansi(false),
        )
    };

    Ok((layer, guard))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("TRACE"), Level::TRACE);
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("warning"), Level::WARN);
        assert_eq!(parse_level("error"), Level::ERROR);
        assert_eq!(parse_level("chatty"), Level::INFO);
    }

    #[test]
    fn test_cli_flags_override_settings() {
        let settings = LoggingSettings {
            level: "warn".to_string(),
            ..Default::default()
        };
        assert_eq!(determine_level(&settings, 0, false), Level::WARN);
        assert_eq!(determine_level(&settings, 1, false), Level::DEBUG);
        assert_eq!(determine_level(&settings, 3, false), Level::TRACE);
        assert_eq!(determine_level(&settings, 2, true), Level::ERROR);
    }

    #[test]
    fn test_file_layer_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("logs").join("mesh.log");

        let result = build_file_layer::<tracing_subscriber::Registry>(
            log_path.to_str().unwrap(),
            100,
            2,
            false,
        );

        assert!(result.is_ok());
        assert!(temp_dir.path().join("logs").exists());
    }
}
