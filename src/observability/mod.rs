//! # Observability
//!
//! Tracing setup for the CLI plus the in-memory task log used to report a
//! deployment's step timeline.

pub mod task_log;

pub use task_log::{TaskLog, TaskLogEntry};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable overriding the log filter
pub const LOG_ENV: &str = "MIGRATA_LOG";

/// Filter used when `MIGRATA_LOG` is unset
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "migrata=debug"
    } else {
        "migrata=warn"
    }
}

/// Install the global subscriber. Logs go to stderr so stdout stays JSON.
///
/// Calling it twice is harmless; the second call keeps the first subscriber.
pub fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose),
        )
        .try_init();
}
