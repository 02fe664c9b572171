//! compcache.
//!
//! Maintenance command line for the compcache compilation cache: shows statistics, enforces the
//! configured size limits and clears or evicts cache entries.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod logging;
mod maintenance;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
