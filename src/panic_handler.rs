//! Panic Handler
//!
//! A panic in the middle of a deployment may leave a deployment row open
//! and a lock file behind. The handler makes sure the operator learns where
//! it happened:
//!
//! - prints the panic to stderr
//! - appends it to `migrata-crash.log` next to the project file

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::panic::{self, PanicHookInfo};
use std::path::{Path, PathBuf};

/// Crash log file name
pub const CRASH_LOG: &str = "migrata-crash.log";

/// Install the panic hook. Without a project directory only stderr is used.
pub fn init_panic_handler(project_dir: Option<PathBuf>) {
    let crash_log_path = project_dir.map(|d| d.join(CRASH_LOG));

    panic::set_hook(Box::new(move |info| {
        handle_panic(info, crash_log_path.as_deref());
    }));
}

fn handle_panic(info: &PanicHookInfo<'_>, crash_log_path: Option<&Path>) {
    let message = format_panic_info(info);

    eprintln!("\n{}", "=".repeat(80));
    eprintln!("MIGRATA FATAL ERROR - PANIC");
    eprintln!("{}", "=".repeat(80));
    eprintln!("{}", message);
    eprintln!("{}", "=".repeat(80));

    if let Some(path) = crash_log_path {
        if let Err(e) = write_crash_log(path, &message) {
            eprintln!("Failed to write crash log: {}", e);
        } else {
            eprintln!("Crash log written to: {}", path.display());
        }
    }

    eprintln!("\nA deployment may have been left open. Check 'migrata status' before retrying.");
}

fn format_panic_info(info: &PanicHookInfo<'_>) -> String {
    let mut msg = String::new();

    msg.push_str(&format!("Timestamp: {}\n", chrono::Utc::now().to_rfc3339()));

    if let Some(location) = info.location() {
        msg.push_str(&format!(
            "Location: {}:{}:{}\n",
            location.file(),
            location.line(),
            location.column()
        ));
    }

    msg.push_str(&format!("Message: {}\n", payload_message(info.payload())));

    let backtrace = std::backtrace::Backtrace::capture();
    match backtrace.status() {
        std::backtrace::BacktraceStatus::Captured => {
            msg.push_str(&format!("\nBacktrace:\n{}", backtrace));
        }
        _ => {
            msg.push_str("\nBacktrace: <not captured, set RUST_BACKTRACE=1>\n");
        }
    }

    msg
}

fn payload_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<unknown panic payload>"
    }
}

fn write_crash_log(path: &Path, message: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;

    writeln!(file, "\n{}", "=".repeat(80))?;
    writeln!(file, "{}", message)?;
    file.sync_all()?;

    Ok(())
}
