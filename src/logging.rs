//! Structured logging setup for the `fidx` binary.
//!
//! `RUST_LOG` wins when set; otherwise `--verbose` picks the level for this
//! crate and everything else stays at `warn`. Logs go to stderr so stdout is
//! left to command output.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Directive used when `RUST_LOG` is unset.
pub fn default_directive(verbosity: u8) -> String {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    format!("warn,file_indexer={},fidx={}", level, level)
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are no-ops.
pub fn init_tracing(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbosity > 0);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .try_init();
}
