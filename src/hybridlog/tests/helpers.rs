use crate::hybridlog::{HybridLog, HybridLogConfig};
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

/// Three-slot ring: almost every write spills to disk.
pub fn tiny_config() -> HybridLogConfig {
    init_tracing();
    HybridLogConfig {
        mem_segment_len: 3,
        ro_lag_interval: 1,
        flush_interval: 1,
        ..Default::default()
    }
}

/// Small ring with room to exercise in-place updates before flushing.
pub fn small_config() -> HybridLogConfig {
    init_tracing();
    HybridLogConfig {
        mem_segment_len: 30,
        ro_lag_interval: 10,
        flush_interval: 10,
        ..Default::default()
    }
}

pub fn open(path: &Path, config: HybridLogConfig) -> HybridLog {
    HybridLog::open(path, config).unwrap()
}
