use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_DIR_ENV: &str = "HUBDBX_LOG_DIR";
const LOG_FILE_PREFIX: &str = "hubdbx.log";
const MAX_RETAINED_LOGS: usize = 14;

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static PANIC_HOOK: OnceLock<()> = OnceLock::new();

/// Install the tracing subscriber: `RUST_LOG`-filtered stdout plus a
/// non-blocking daily-rotating file under `log_dir` (or `HUBDBX_LOG_DIR`).
/// Safe to call more than once; later calls are no-ops.
pub fn init(log_dir: Option<&Path>) -> Result<()> {
    if FILE_GUARD.get().is_some() {
        return Ok(());
    }

    let log_dir = resolve_log_dir(log_dir);
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    prune_old_logs(&log_dir);

    let appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = fmt::layer().with_target(false);
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_target(true)
        .with_ansi(false);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer);

    match subscriber.try_init() {
        Ok(_) => {
            let _ = FILE_GUARD.set(guard);
            install_panic_hook();
        }
        Err(_) => {
            // A subscriber is already installed elsewhere; drop the guard so
            // the writer thread exits.
            drop(guard);
        }
    }

    Ok(())
}

fn resolve_log_dir(explicit: Option<&Path>) -> PathBuf {
    if let Ok(dir) = env::var(LOG_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    match explicit {
        Some(dir) => dir.to_path_buf(),
        None => PathBuf::from("logs"),
    }
}

/// Keep the newest `MAX_RETAINED_LOGS` rotated files; best effort.
fn prune_old_logs(log_dir: &Path) {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return;
    };

    let mut rotated: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
        })
        .collect();
    if rotated.len() <= MAX_RETAINED_LOGS {
        return;
    }

    // The roller suffixes file names with the date, so name order is age order.
    rotated.sort();
    let excess = rotated.len() - MAX_RETAINED_LOGS;
    for path in rotated.into_iter().take(excess) {
        if let Err(err) = fs::remove_file(&path) {
            eprintln!("failed to remove old log file {}: {err}", path.display());
        }
    }
}

fn install_panic_hook() {
    PANIC_HOOK.get_or_init(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            tracing::error!(panic = %info, "process panicked");
            previous(info);
        }));
    });
}
