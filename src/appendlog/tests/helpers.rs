use crate::appendlog::{AppendLog, AppendLogConfig};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize tracing controlled by `RUST_LOG`. Safe to call from every
/// test; only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Ten-byte rollover threshold: nearly every write seals a run.
pub fn tiny_config() -> AppendLogConfig {
    init_tracing();
    AppendLogConfig {
        threshold: 10,
        ..Default::default()
    }
}

/// Default-sized log.
pub fn default_config() -> AppendLogConfig {
    init_tracing();
    AppendLogConfig::default()
}

pub fn open(path: &Path, config: AppendLogConfig) -> AppendLog {
    AppendLog::open(path, config).unwrap()
}
