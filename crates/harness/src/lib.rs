pub mod catalog;
pub mod world;

pub use catalog::FixtureCatalog;
pub use world::{at, day, monthly, TestWorld};

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static LOGGING: Once = Once::new();

/// Install a test-writer subscriber once per process. `RUST_LOG` picks the
/// filter; engine events at `info` and above are shown by default.
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("entitlement_engine=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
