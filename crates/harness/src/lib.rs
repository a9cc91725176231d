mod app;
mod listener;

pub use app::{LANGUAGES, TestApp, person_type, product_type, refs};
pub use listener::RecordingListener;

/// Route `tracing` output through the test writer. Safe to call from every
/// test; only the first call installs the subscriber.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
