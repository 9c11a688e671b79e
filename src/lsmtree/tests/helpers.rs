use crate::lsmtree::{LsmTree, LsmTreeConfig};
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

/// Tiny memtable and dense fence sampling: every few writes flush, and
/// merges fire quickly.
pub fn granular_config() -> LsmTreeConfig {
    init_tracing();
    LsmTreeConfig {
        max_runs_per_level: 3,
        density_factor: 3,
        memtable_bytes_limit: 10,
        ..Default::default()
    }
}

/// Default-sized tree; writes stay in the memtable unless forced out.
pub fn default_config() -> LsmTreeConfig {
    init_tracing();
    LsmTreeConfig::default()
}

pub fn open(path: &Path, config: LsmTreeConfig) -> LsmTree {
    LsmTree::open(path, config).unwrap()
}
