//! Process-wide tracing setup for hosts embedding the helios engine.
//!
//! Library crates only emit `tracing` events; whoever owns `main` decides where
//! they go by calling [`setup_logging`] once at startup.

use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, bail};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Default directory for rolling log files.
pub const DEFAULT_LOG_DIR: &str = "logs";

const LOG_FILE_PREFIX: &str = "helios";
const MAX_LOG_FILES: usize = 5;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs console and daily-rolling file logging under [`DEFAULT_LOG_DIR`].
///
/// `base_level` is an `EnvFilter` directive such as `"info"` or
/// `"helios=debug,warn"`; `RUST_LOG` takes precedence when set.
pub fn setup_logging(base_level: &str) -> anyhow::Result<()> {
    setup_logging_in(Path::new(DEFAULT_LOG_DIR), base_level)
}

/// Same as [`setup_logging`] with an explicit log directory.
///
/// Fails if logging was already initialized in this process.
pub fn setup_logging_in(log_dir: &Path, base_level: &str) -> anyhow::Result<()> {
    if LOG_GUARD.get().is_some() {
        bail!("logging already initialized");
    }

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(base_level))
        .with_context(|| format!("invalid log filter '{base_level}'"))?;

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(log_dir)
        .context("failed to create rolling log appender")?;

    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Warnings go to stderr as well so CLI hosts surface convergence problems.
    let console_writer = std::io::stdout.and(std::io::stderr.with_min_level(Level::WARN));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_ansi(true)
        .with_writer(console_writer);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("tracing subscriber already installed")?;

    if LOG_GUARD.set(guard).is_err() {
        bail!("logging already initialized");
    }
    Ok(())
}
