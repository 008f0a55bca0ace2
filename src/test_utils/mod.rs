pub(crate) mod mocks;

/// Installs a test subscriber so `tracing` output lands in the captured
/// test stdout. Safe to call from every test; only the first wins.
pub(crate) fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
