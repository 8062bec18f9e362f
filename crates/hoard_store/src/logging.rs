//! Log output for applications embedding the store

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install a `fmt` subscriber on stderr filtered by `RUST_LOG`
///
/// Without `RUST_LOG` the level is `info`, or `debug` when `verbose` is set.
/// Does nothing if a global subscriber is already installed.
pub fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
