use crate::settings::LoggingSettings;
use tracing_subscriber::FmtSubscriber;

/// Install the global tracing subscriber.
pub fn configure(settings: LoggingSettings) -> Result<(), anyhow::Error> {
    FmtSubscriber::builder()
        .with_ansi(true)
        .with_env_filter(settings.filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to setup tracing: {}", e))
}

/// Route test logs to the test writer, filtered by `RUST_LOG`. Safe to call
/// from many tests.
#[cfg(test)]
pub fn enable_logging() {
    let _ = FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
