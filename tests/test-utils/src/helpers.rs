//! Helpers for stress and concurrency tests

use std::thread;
use std::time::Duration;

use rand::Rng;

/// Initialise tracing output for a test binary
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    tracing::debug!("test logging initialised");
}

/// Sleep for a random few microseconds to shake out interleavings
pub fn sleep_jitter(max_micros: u64) {
    let micros = rand::thread_rng().gen_range(0..=max_micros);
    if micros == 0 {
        thread::yield_now();
    } else {
        thread::sleep(Duration::from_micros(micros));
    }
}
