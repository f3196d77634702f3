//! Disk snapshot for the cached tier.
//!
//! The snapshot is a pass-through convenience, never authoritative: it
//! seeds the cached (read-only) tier on open and receives the confirmed
//! base tier on persist. Serialized as JSON because field values are
//! arbitrary JSON scalars already.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::store::record::{Record, RecordId};

/// Snapshot format version; bumped on layout changes.
const SNAPSHOT_VERSION: u32 = 1;

/// On-disk image of confirmed records plus the root-call index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    version: u32,
    pub records: HashMap<RecordId, Record>,
    pub roots: HashMap<String, RecordId>,
}

impl CacheSnapshot {
    pub fn new(records: HashMap<RecordId, Record>, roots: HashMap<String, RecordId>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            records,
            roots,
        }
    }
}

/// Load a snapshot from disk.
pub fn load(path: &Path) -> Result<CacheSnapshot> {
    let file = File::open(path)?;
    let snapshot: CacheSnapshot = serde_json::from_reader(BufReader::new(file))?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(CacheError::InvalidSnapshot(format!(
            "unsupported snapshot version {} (expected {})",
            snapshot.version, SNAPSHOT_VERSION
        )));
    }
    tracing::debug!(
        records = snapshot.records.len(),
        roots = snapshot.roots.len(),
        "loaded cache snapshot"
    );
    Ok(snapshot)
}

/// Persist a snapshot to disk.
pub fn save(path: &Path, snapshot: &CacheSnapshot) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer(BufWriter::new(file), snapshot)?;
    tracing::debug!(records = snapshot.records.len(), "persisted cache snapshot");
    Ok(())
}
