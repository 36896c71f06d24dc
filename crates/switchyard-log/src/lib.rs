// ABOUTME: Shared logging setup for switchyard binaries
// ABOUTME: init() for everything at INFO, init_for() to keep dependency noise at WARN

use tracing_subscriber::EnvFilter;

/// Standard logging to stderr. Default: INFO level, RUST_LOG override.
///
/// Stdout stays reserved for backend replies.
pub fn init() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();
}

/// Crate-filtered logging to stderr. Default: INFO for the named crate, WARN for everything else.
pub fn init_for(crate_name: &str) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter_for(crate_name))
        .init();
}

fn filter_for(crate_name: &str) -> EnvFilter {
    // Crate names use hyphens; tracing targets use underscores
    let directive = format!("{}=info", crate_name.replace('-', "_"));
    EnvFilter::from_default_env()
        .add_directive(tracing::Level::WARN.into())
        .add_directive(
            directive
                .parse()
                .unwrap_or_else(|_| tracing::Level::INFO.into()),
        )
}
