//! Diagnostic logging.
//!
//! Logs go to stderr so that `--json` output on stdout stays machine readable.
//! User-facing progress is not logged here; it flows through the reporter seams.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Environment variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "BURN_WORKFLOW_LOG";

/// Install the global subscriber once. Later calls are no-ops.
pub fn init_logging(verbose: bool) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let directives = filter_directives(
            std::env::var(LOG_ENV).ok(),
            std::env::var("RUST_LOG").ok(),
            verbose,
        );
        let filter = EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new("warn"));

        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true)
                .with_filter(filter),
        );

        // Another subscriber may already be installed, e.g. by a test harness.
        if subscriber.try_init().is_err() {
            tracing::debug!("global tracing subscriber already initialized");
        }

        tracing::debug!(filter = %directives, "logging initialized");
    });
}

/// Pick the filter directives: explicit env wins, then `RUST_LOG`, then the
/// verbosity default.
fn filter_directives(own: Option<String>, rust_log: Option<String>, verbose: bool) -> String {
    own.filter(|s| !s.trim().is_empty())
        .or_else(|| rust_log.filter(|s| !s.trim().is_empty()))
        .unwrap_or_else(|| if verbose { "debug" } else { "warn" }.to_string())
}
