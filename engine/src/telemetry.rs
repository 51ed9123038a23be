//! Logging setup
//!
//! One `tracing-subscriber` registry per process: pretty output in debug
//! builds, JSON lines with the current span in release builds. Logs go to
//! stderr so that reports and `--json` output on stdout stay
//! machine-readable.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directive for `log_level`, scoped to this crate and its dependencies
pub fn filter_directive(log_level: &str) -> String {
    format!(
        "warn,infrabot_engine={level},infrabot={level},sqlx=warn",
        level = log_level
    )
}

/// Install the global subscriber
///
/// `RUST_LOG` wins when set; otherwise `log_level` (the `--log` flag or
/// `core.log_level`) applies to infrabot's own targets and everything else
/// stays at `warn`. Only the first call installs anything.
pub fn init_telemetry_with_level(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(log_level)));

    #[cfg(debug_assertions)]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .ok();
    }

    #[cfg(not(debug_assertions))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .ok();
    }
}
