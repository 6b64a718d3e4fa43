//! Tracing initialisation helpers for tests.
//!
//! Call [`init_test_tracing`] at the top of any test that emits tracing events
//! and wants them captured by the test harness. The subscriber is initialised
//! at most once per process, so every test may call it.

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset: PowerGate crates at debug,
/// everything else at warn.
pub const DEFAULT_TEST_FILTER: &str = "warn,powergate_core=debug,powergate_config=debug";

/// Initialise a subscriber writing to the test-harness writer.
///
/// `RUST_LOG` wins over [`DEFAULT_TEST_FILTER`].
///
/// ```ignore
/// #[tokio::test]
/// async fn my_test() {
///     powergate_test_utils::tracing_setup::init_test_tracing();
///     tracing::info!("captured by the harness");
/// }
/// ```
pub fn init_test_tracing() {
    init_test_tracing_with(DEFAULT_TEST_FILTER);
}

/// Like [`init_test_tracing`] with an explicit fallback filter.
pub fn init_test_tracing_with(fallback: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_test_writer()
        .try_init();
}
