use tracing::Level;

/// Parses a config log level; unknown names fall back to `info`.
pub fn parse_level(name: &str) -> Level {
    name.trim().parse().unwrap_or(Level::INFO)
}

/// Installs the global fmt subscriber. Safe to call more than once.
pub fn init(level: &str, verbose: bool) {
    let level = if verbose { Level::DEBUG } else { parse_level(level) };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}
