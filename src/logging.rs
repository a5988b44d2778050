//! Process logging setup.
//!
//! Application code logs through `tracing`'s macros; this just wires the
//! subscriber. Grounded on the teacher's `gui/src/main.rs` init sequence
//! (`tracing_subscriber::fmt` + `EnvFilter`), collapsed to a single
//! `init_logging(level)` entry point since the YAML config names only one
//! level (spec.md §6 `log_level`) rather than the teacher's per-crate
//! directive list.

use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber. `level` is the default filter
/// directive used when `RUST_LOG` is unset; an explicit `RUST_LOG` always
/// wins.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
