use tracing_subscriber::EnvFilter;

/// Install the process-wide tracing subscriber.
///
/// Debug builds print human-readable lines, release builds print JSON. The
/// level comes from `RUST_LOG` and defaults to `info`. Output goes to stderr
/// so command output on stdout stays machine-readable.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if cfg!(debug_assertions) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    }
}
