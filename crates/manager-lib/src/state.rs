//! Snapshot persistence with checksum validation
//!
//! A snapshot captures the pool configuration, every allocation record, and
//! each agent's profile plus runtime standing. On disk it travels inside an
//! envelope carrying a SHA-256 checksum of the serialized snapshot; writes
//! go through a temp file and rename, and loads reject any envelope whose
//! checksum no longer matches.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::agent::AgentState;
use crate::error::StateError;
use crate::models::{AgentResourceProfile, AllocationRecord, ResourceUnits};

/// Bumped when the snapshot layout changes shape
pub const SNAPSHOT_VERSION: u32 = 1;

/// Pool configuration and derived totals at snapshot time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub capacity: ResourceUnits,
    pub over_provisioning_factor: f64,
    /// Units held by active and reclaim-pending records when taken
    pub allocated: ResourceUnits,
}

/// One agent's profile and runtime standing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub profile: AgentResourceProfile,
    pub state: AgentState,
    pub health_score: f64,
    pub scale_factor: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation_id: Option<String>,
}

/// Full serialized manager state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u32,
    pub timestamp: i64,
    pub pool: PoolSnapshot,
    pub allocations: Vec<AllocationRecord>,
    pub agents: Vec<AgentSnapshot>,
}

impl StateSnapshot {
    /// SHA-256 over the compact JSON serialization
    pub fn checksum(&self) -> Result<String, StateError> {
        let bytes = serde_json::to_vec(self)?;
        Ok(compute_checksum(&bytes))
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotEnvelope {
    checksum: String,
    snapshot: StateSnapshot,
}

/// Write a snapshot to disk, checksummed and atomically renamed into place
pub fn save_snapshot(snapshot: &StateSnapshot, path: &Path) -> Result<(), StateError> {
    let envelope = SnapshotEnvelope {
        checksum: snapshot.checksum()?,
        snapshot: snapshot.clone(),
    };
    let bytes = serde_json::to_vec_pretty(&envelope)?;

    // Write to a temp file first so a crash never leaves a torn snapshot
    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;

    Ok(())
}

/// Read a snapshot back, rejecting it when the checksum does not match
pub fn load_snapshot(path: &Path) -> Result<StateSnapshot, StateError> {
    let bytes = fs::read(path)?;
    let envelope: SnapshotEnvelope = serde_json::from_slice(&bytes)?;

    let actual = envelope.snapshot.checksum()?;
    if actual != envelope.checksum {
        return Err(StateError::ChecksumMismatch {
            expected: envelope.checksum,
            actual,
        });
    }
    Ok(envelope.snapshot)
}

/// Compute SHA256 checksum of data
fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
