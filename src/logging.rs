//! Logging initialisation: `RUST_LOG`-driven `tracing` subscriber setup.

use tracing_subscriber::EnvFilter;

/// Initialise the global `tracing` subscriber. `RUST_LOG` takes precedence;
/// `default_level` (the CLI's `--log` global option) is used only when
/// `RUST_LOG` is unset.
pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
