//! Structured logging setup: console plus daily rolling file.

use std::path::Path;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Rolled log files kept before pruning.
const MAX_LOG_FILES: usize = 14;

/// Delete the oldest `pos.*` log files beyond [`MAX_LOG_FILES`]. The daily
/// roller embeds the date in the file name, so lexicographic order is
/// chronological.
pub fn prune_old_logs(log_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return;
    };
    let mut logs: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with("pos.")
        })
        .collect();
    if logs.len() <= MAX_LOG_FILES {
        return;
    }
    logs.sort_by_key(|entry| entry.file_name());
    let excess = logs.len() - MAX_LOG_FILES;
    for entry in logs.into_iter().take(excess) {
        if let Err(e) = std::fs::remove_file(entry.path()) {
            warn!("Failed to prune old log {}: {e}", entry.path().display());
        }
    }
}

/// Initialize structured logging (console + rolling file). Safe to call
/// more than once; later calls are no-ops.
pub fn init(log_dir: &Path) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,dinepos=debug"));

    prune_old_logs(log_dir);
    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, "pos");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    let initialized = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_ok();

    if initialized {
        // Keep the guard alive for the lifetime of the process; dropping
        // it would stop flushing file logs.
        std::mem::forget(guard);
        info!(
            version = env!("CARGO_PKG_VERSION"),
            built = env!("BUILD_TIMESTAMP"),
            git = env!("BUILD_GIT_SHA"),
            "DinePOS core logging initialized"
        );
    }
}
