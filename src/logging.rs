//! Tracing setup for the servers and the client commands

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging for a long-running server
///
/// Log lines go to stderr and are appended to `log_file`, which also gets a
/// start banner with the time and the user the server runs as.
///
/// Returns a guard that must be kept alive for the duration of the program
pub fn init_server_logging<P: AsRef<Path>>(
    log_file: P,
    server: &str,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_path = log_file.as_ref();

    if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory at {}", parent.display()))?;
    }

    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("Failed to open log file at {}", log_path.display()))?;

    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let separator = "=".repeat(80);
    writeln!(file, "\n{}", separator)?;
    writeln!(file, "Ferry {} Started - {}", server, timestamp)?;
    writeln!(file, "USER={}", username)?;
    writeln!(file, "{}\n", separator)?;
    file.flush()?;

    // dropping the guard stops the writer thread
    let (file_writer, guard) = tracing_appender::non_blocking(file);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true);

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    tracing::info!(
        user = %username,
        server,
        log_file = %log_path.display(),
        "Logging initialized"
    );

    Ok(guard)
}

/// Initialize console-only logging (for push and pull)
pub fn init_console_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
