use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber for a host process.
///
/// Honors `RUST_LOG`; defaults to `agora=info`. Calling it twice is harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "agora=info".into()))
        .try_init();
}
