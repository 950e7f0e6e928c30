//! Structured logging for debugging canopy.
//!
//! Log levels:
//! - ERROR: Rejected transitions, store failures, dispatcher crashes
//! - WARN: Recoverable conditions (malformed stream messages, lagging subscribers)
//! - INFO: High-level notifications (startup, submissions, config updates)
//! - DEBUG: Every lifecycle transition and limiter decision
//! - TRACE: Individual event appends and stream frames
//!
//! Debug mode can be enabled with `--debug` flag or `CANOPY_DEBUG=1` env var.
//! `RUST_LOG` overrides both when set.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging to ~/.canopy/canopy.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_with_debug(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug || env_debug())));

    let registry = tracing_subscriber::registry().with(filter);

    match open_log_file() {
        Some(file) => {
            let _ = registry
                .with(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
                .try_init();
        }
        None => {
            let _ = registry
                .with(fmt::layer().with_writer(std::io::stderr).compact())
                .try_init();
        }
    }
}

/// Path of the log file, if a home directory is available.
pub fn log_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".canopy").join("canopy.log"))
}

fn env_debug() -> bool {
    std::env::var("CANOPY_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "canopy=debug"
    } else {
        "canopy=info"
    }
}

fn open_log_file() -> Option<File> {
    let path = log_path()?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).ok()?;
    }
    // Truncate file on startup
    File::create(path).ok()
}
