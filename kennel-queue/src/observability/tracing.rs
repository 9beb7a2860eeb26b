//! Subscriber setup for binaries and tests.

/// Install a global `tracing` subscriber filtered by `RUST_LOG` (default `info`).
///
/// `json` switches to one JSON object per line. Calling it twice is an
/// error because the global subscriber can only be set once.
#[cfg(feature = "tracing-basic")]
pub fn init_tracing(json: bool) -> crate::QueueResult<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| crate::QueueError::InvalidConfig(format!("tracing already initialised: {e}")))
}
