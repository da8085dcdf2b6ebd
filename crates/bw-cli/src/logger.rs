//! Logging setup
//!
//! The library crates log through the `log` facade. Records are bridged into a
//! `tracing` fmt subscriber writing to stderr so stdout stays clean for
//! command output.

use tracing_subscriber::EnvFilter;

/// Install the subscriber. `RUST_LOG` takes precedence; otherwise `verbose`
/// selects debug output for the blockwarden crates and warnings elsewhere.
pub fn init(verbose: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let filter = if verbose {
            "warn,bw_core=debug,bw_engine=debug,bw_cli=debug"
        } else {
            "warn"
        };
        EnvFilter::new(filter)
    });

    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("Failed to install logger: {e}");
    }
}
