//! Ready markers and publish intents.
//!
//! Both records exist to make the publish protocol crash-recoverable:
//! an intent is written before any staging happens, and the `.READY`
//! marker is the proof that staging completed. The doctor reasons about
//! crashes entirely from which of the two survive.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::fsx;
use crate::model::types::{EngineKind, SnapshotId, WorktreeName};

// ---------------------------------------------------------------------------
// ReadyMarker
// ---------------------------------------------------------------------------

/// The `.READY` file at the root of a materialized snapshot.
///
/// A snapshot directory without a parseable marker whose id matches the
/// directory name is incomplete and collectable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyMarker {
    /// The snapshot this marker completes.
    pub snapshot_id: SnapshotId,
    /// When staging finished (RFC3339).
    pub completed_at: String,
    /// The payload root hash computed over the staged tree.
    pub payload_root_hash: String,
}

impl ReadyMarker {
    /// Durably write the marker into `snapshot_dir`.
    ///
    /// # Errors
    /// Returns an error on serialization or I/O failure.
    pub fn store(&self, snapshot_dir: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        fsx::atomic_write(
            &snapshot_dir.join(crate::hash::READY_MARKER),
            &bytes,
            fsx::DEFAULT_FILE_MODE,
        )
    }

    /// Load the marker from `snapshot_dir`, if present and parseable.
    ///
    /// Returns `Ok(None)` for a missing or malformed marker — both mean
    /// "incomplete snapshot" to every caller.
    ///
    /// # Errors
    /// Returns an error only on I/O failure other than not-found.
    pub fn load(snapshot_dir: &Path) -> Result<Option<Self>> {
        let path = snapshot_dir.join(crate::hash::READY_MARKER);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes).ok())
    }

    /// Whether `snapshot_dir` holds a valid marker for `expected_id`.
    #[must_use]
    pub fn is_valid_for(snapshot_dir: &Path, expected_id: &SnapshotId) -> bool {
        Self::load(snapshot_dir)
            .ok()
            .flatten()
            .is_some_and(|m| m.snapshot_id == *expected_id)
    }
}

// ---------------------------------------------------------------------------
// Intent
// ---------------------------------------------------------------------------

/// A record of an in-progress snapshot creation.
///
/// Present at `intents/<id>.json` only during publish or after a crash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    /// The snapshot id allocated for this publish.
    pub snapshot_id: SnapshotId,
    /// The worktree being snapshotted.
    pub worktree_name: WorktreeName,
    /// When the publish started (RFC3339).
    pub started_at: String,
    /// The engine selected for the clone.
    pub engine: EngineKind,
}

impl Intent {
    /// Durably write this intent to `path`.
    ///
    /// # Errors
    /// Returns an error on serialization or I/O failure.
    pub fn store(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        fsx::atomic_write(path, &bytes, fsx::DEFAULT_FILE_MODE)
    }

    /// Load an intent file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
