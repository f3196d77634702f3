//! Engine configuration.

use std::path::PathBuf;

/// Tuning knobs for a [`CacheEngine`](crate::engine::CacheEngine) instance.
///
/// One config per engine handle; tests construct isolated instances with
/// whatever combination they need.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Run a garbage collection pass opportunistically after every
    /// queued-tier rebuild. Collection is always available on demand via
    /// `CacheEngine::collect_garbage` regardless of this flag.
    pub auto_gc: bool,

    /// Optional disk snapshot seeding the cached tier on open and receiving
    /// the base tier on `persist_snapshot`. The snapshot is a read-through
    /// convenience, never authoritative.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            auto_gc: true,
            snapshot_path: None,
        }
    }
}
