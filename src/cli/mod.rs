//! Command line interface
//!
//! Results are JSON on stdout, errors JSON on stderr, exit code 1 on error.

pub mod args;
pub mod commands;
pub mod errors;
pub mod io;

pub use args::Cli;
pub use commands::run;
pub use errors::{CliError, CliResult};
