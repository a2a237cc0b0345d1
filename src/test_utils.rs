use std::sync::Once;

/// Installs a fmt subscriber once so failing tests show the crate's
/// tracing output. Safe to call from every test.
pub(crate) fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}
