use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Global flag to control audio debug logging
pub static AUDIO_DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Set audio debug logging on/off
pub fn set_audio_debug(enabled: bool) {
    AUDIO_DEBUG_ENABLED.store(enabled, Ordering::Relaxed);
    println!(
        "🔧 Audio debug logging {}",
        if enabled { "ENABLED" } else { "DISABLED" }
    );
}

/// Check if audio debug logging is enabled
pub fn is_audio_debug_enabled() -> bool {
    AUDIO_DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Audio debug macro - only prints if audio debug is enabled
#[macro_export]
macro_rules! audio_debug {
    ($($arg:tt)*) => {
        if $crate::log::AUDIO_DEBUG_ENABLED.load(std::sync::atomic::Ordering::Relaxed) {
            println!($($arg)*);
        }
    };
}

/// Initialize the tracing subscriber for the process.
///
/// `debug` raises the default level filter; `QUIET_LOG` overrides it either
/// way. When `log_dir` is given, a daily-rotated append-only file layer is
/// added; the returned guard must be held for the lifetime of the process
/// so buffered log lines are flushed on shutdown.
pub fn init_logging(
    debug: bool,
    log_dir: Option<&Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_env("QUIET_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false));

    let guard = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "quiet.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))?;
            Some(guard)
        }
        None => {
            registry
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))?;
            None
        }
    };

    if debug {
        set_audio_debug(true);
    }

    Ok(guard)
}
