//! Logging init: append to the configured log file, or stderr when none is
//! set (or the file cannot be opened).

use std::fs;
use std::io;
use std::path::Path;

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// Hands out writers for an append-mode log file; if the handle cannot be
/// duplicated, records fall back to stderr rather than being dropped.
struct LogSink(std::fs::File);

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = Box<dyn io::Write>;

    fn make_writer(&'a self) -> Self::Writer {
        match self.0.try_clone() {
            Ok(file) => Box::new(file),
            Err(_) => Box::new(io::stderr()),
        }
    }
}

/// Initialize structured logging. With a log file, all records append there;
/// on failure to open it, returns Err so the caller can fall back to stderr.
pub fn init_logging(level: &str, log_file: Option<&Path>) -> Result<()> {
    let Some(path) = log_file else {
        init_logging_stderr(level);
        return Ok(());
    };

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }
    let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    let writer: BoxMakeWriter = BoxMakeWriter::new(LogSink(file));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(writer)
        .with_ansi(false)
        .init();

    tracing::info!("logging initialized at {}", path.display());
    Ok(())
}

/// Stderr-only logging. Use when `init_logging` fails so startup never dies
/// over an unwritable log directory.
pub fn init_logging_stderr(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = level.trim().to_ascii_lowercase();
        let directive = match level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => level,
            _ => "info".to_string(),
        };
        EnvFilter::new(directive)
    })
}
