//! Logging setup shared by the unit tests.

use std::sync::Once;

static INIT: Once = Once::new();

// Route `tracing` output through the test harness so it only shows up for failing tests.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .try_init();
    });
}
