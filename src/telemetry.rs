//! Tracing initialization for embedding daemons and tests.

use tracing_subscriber::{fmt, EnvFilter};

/// Install a stderr subscriber honoring `LOG` (falling back to the given
/// default directive). Safe to call more than once; later calls lose.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::builder()
        .with_env_var("LOG")
        .try_from_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .try_init();
}
