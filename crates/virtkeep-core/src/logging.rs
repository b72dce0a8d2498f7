//! Logging bootstrap shared by the virtkeep binaries.

use env_logger::Env;

/// Initialise the process-wide logger. `RUST_LOG` overrides `default_level`.
pub fn init(default_level: &str) {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .try_init();
}
