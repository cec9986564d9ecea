//! Tracing setup shared by the binaries
//!
//! Verbosity comes from repeated `-v` flags. `RUST_LOG`, when set, wins over
//! the flag-derived level. Logs go to stderr so command output on stdout
//! stays machine-readable.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Level for a `-v` count
pub fn level_for(verbose: u8) -> Level {
    match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Install the global subscriber; a second call is a no-op
pub fn init(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for(verbose).as_str().to_ascii_lowercase()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
