//! migrata command line entry point

use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use clap::Parser;
use tracing::warn;

use migrata::cli::{self, io::write_error, Cli};
use migrata::config::resolve_config_path;
use migrata::observability::init_tracing;
use migrata::panic_handler::init_panic_handler;

fn main() {
    let cli = Cli::parse();
    let verbose = cli.verbose;

    let project_dir = resolve_config_path(&cli.project)
        .parent()
        .map(|p| p.to_path_buf());
    init_panic_handler(project_dir);
    init_tracing(verbose);

    let interrupt = Arc::new(AtomicBool::new(false));
    watch_ctrl_c(Arc::clone(&interrupt));

    if let Err(e) = cli::run(cli, interrupt) {
        if write_error(&e, verbose).is_err() {
            eprintln!("Error: {}", e);
        }
        process::exit(e.exit_code());
    }
}

/// First Ctrl-C asks the running deployment to stop between steps so it can
/// unwind; a second one exits immediately.
fn watch_ctrl_c(flag: Arc<AtomicBool>) {
    let spawned = thread::Builder::new()
        .name("migrata-signal".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!(error = %e, "cannot watch for Ctrl-C");
                    return;
                }
            };
            runtime.block_on(async move {
                loop {
                    if tokio::signal::ctrl_c().await.is_err() {
                        return;
                    }
                    if flag.swap(true, Ordering::SeqCst) {
                        process::exit(130);
                    }
                    warn!("interrupt requested, finishing the current step");
                }
            });
        });
    if let Err(e) = spawned {
        warn!(error = %e, "cannot start signal thread");
    }
}
