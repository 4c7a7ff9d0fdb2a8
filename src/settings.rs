//! Process-wide defaults.
//!
//! The CLI argument stream *is* the kernel's configuration layer; this
//! struct only carries the handful of defaults that would otherwise be
//! magic numbers scattered through the stage runtime.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Default per-stage stop timeout.
    pub stop_timeout: Duration,
    /// Default rate-limiter window for `--limit-rate` when a stage doesn't
    /// override it.
    pub default_rate_limit_hz: Option<f64>,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(3),
            default_rate_limit_hz: None,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Overlay `KERNEL_*` environment variables on top of the defaults.
    pub fn from_env() -> Self {
        let mut settings = Settings::default();
        if let Ok(v) = std::env::var("KERNEL_STOP_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                settings.stop_timeout = Duration::from_millis(ms);
            }
        }
        if let Ok(v) = std::env::var("KERNEL_LOG") {
            settings.log_level = v;
        }
        settings
    }
}
