//! Logging setup for devio.
//!
//! Set the `DEVIO_LOG` environment variable to control verbosity. It takes the
//! usual `tracing` filter syntax:
//! - `DEVIO_LOG=debug` - lifecycle and transport setup
//! - `DEVIO_LOG=devio::transport=trace` - every request on every transport
//! - `DEVIO_LOG=devio::service=debug,warn` - service transitions only

use tracing_subscriber::EnvFilter;

/// Environment variable read by [`init`].
pub const LOG_ENV: &str = "DEVIO_LOG";

const DEFAULT_FILTER: &str = "warn";

/// Build the filter from `DEVIO_LOG`, falling back to `warn`.
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install a global fmt subscriber writing to stderr.
///
/// Safe to call more than once; only the first call installs anything.
/// Returns `true` if this call installed the subscriber.
pub fn init() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .is_ok()
}
