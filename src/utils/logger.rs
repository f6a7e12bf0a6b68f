//! Logging bootstrap
//!
//! UMDT components log through `tracing`; embedding applications that do not
//! install their own subscriber can call [`init_logger`] once at startup.

use tracing_subscriber::EnvFilter;

/// Initialize a console subscriber with the given default level.
///
/// `RUST_LOG` overrides `level` when set. Calling this twice is harmless;
/// the second call is ignored.
pub fn init_logger(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("umdt={level}")));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
