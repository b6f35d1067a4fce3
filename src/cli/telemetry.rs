use anyhow::{Result, anyhow};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Map the number of `-v` flags to a log level
#[must_use]
pub const fn verbosity_level(count: u8) -> Level {
    match count {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Install the global fmt subscriber. `RUST_LOG` overrides `level`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed
pub fn init(level: Level) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow!("failed to initialize tracing: {e}"))
}
