// logging/src/lib.rs

//! A small helper to initialize tracing for bustapay.
//!
//! Usage:
//! ```rust,ignore
//! logging::init(false);
//! tracing::info!("receiver started");
//! tracing::debug!("detailed state: {:?}", some_struct);
//! ```

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber:
/// - Reads `RUST_LOG` for filter directives, falling back to `"bustapay=info"`
///   or, when `verbose` is set, `"bustapay=debug"`.
/// - Uses a pretty-printed, line-based formatter.
pub fn init(verbose: bool) {
    let default_directive = if verbose { "bustapay=debug" } else { "bustapay=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    fmt().with_env_filter(filter).init();
}
