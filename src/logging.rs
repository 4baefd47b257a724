//! Logging setup for agentmux using tracing.

use anyhow::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging with file appender and console output.
pub fn init() -> Result<(WorkerGuard, PathBuf)> {
    let log_dir = get_log_dir()?;
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "agentmux.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,agentmux=debug"));

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    tracing::info!("agentmux logging initialized");
    tracing::info!("Log directory: {}", log_dir.display());

    Ok((guard, log_dir))
}

/// Get the log directory path.
pub fn get_log_dir() -> Result<PathBuf> {
    Ok(crate::config::get_home_dir()
        .map_err(|e| anyhow::anyhow!("{}", e))?
        .join("logs"))
}

/// Current rolling log file, if one has been written today.
///
/// The daily appender names files `agentmux.log.YYYY-MM-DD`.
pub fn current_log_file(log_dir: &std::path::Path) -> Option<PathBuf> {
    let today = chrono::Local::now().format("%Y-%m-%d").to_string();
    let path = log_dir.join(format!("agentmux.log.{}", today));
    if path.exists() {
        return Some(path);
    }
    // Fall back to the newest log file present.
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(log_dir).ok()?.flatten() {
        let path = entry.path();
        let name = path.file_name()?.to_string_lossy().to_string();
        if !name.starts_with("agentmux.log") {
            continue;
        }
        let modified = entry.metadata().ok()?.modified().ok()?;
        if newest.as_ref().map_or(true, |(ts, _)| modified > *ts) {
            newest = Some((modified, path.clone()));
        }
    }
    newest.map(|(_, p)| p)
}

/// Read the last `limit` lines of the current log file.
pub fn tail_log(log_dir: &std::path::Path, limit: usize) -> Vec<String> {
    let Some(path) = current_log_file(log_dir) else {
        return Vec::new();
    };
    let Ok(content) = std::fs::read_to_string(&path) else {
        return Vec::new();
    };
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(limit);
    lines[start..].iter().map(|l| l.to_string()).collect()
}
