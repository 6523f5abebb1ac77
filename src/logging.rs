//! Diagnostic logging to stderr.
//!
//! The level comes from `FBX_LOG` (any `EnvFilter` directive, e.g.
//! `feedback_harness=debug`), falling back to `warn`, or `debug` with
//! `--verbose` and `error` with `--quiet`. Command output stays on stdout.

use anyhow::anyhow;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "FBX_LOG";

/// Install the global subscriber. Call once, before any command runs.
pub fn init(quiet: bool, verbose: bool) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(filter(quiet, verbose))
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("failed to initialize tracing subscriber: {e}"))
}

fn filter(quiet: bool, verbose: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level(quiet, verbose)))
}

fn default_level(quiet: bool, verbose: bool) -> &'static str {
    if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "warn"
    }
}
