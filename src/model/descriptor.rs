//! Snapshot descriptors and their checksum discipline.
//!
//! A descriptor is the JSON metadata file published for every snapshot.
//! Its `descriptor_checksum` is the SHA-256 of the canonical-JSON encoding
//! of the descriptor with the `descriptor_checksum` and `integrity_state`
//! fields removed — those two are the only fields the verifier may rewrite
//! after publish, so they sit outside checksum coverage.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::canonical;
use crate::error::{JvsError, Result};
use crate::fsx;
use crate::model::types::{EngineKind, IntegrityState, SnapshotId, WorktreeName};

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// Snapshot metadata, stored at `descriptors/<id>.json`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// The snapshot this descriptor belongs to.
    pub snapshot_id: SnapshotId,
    /// The worktree `head` at creation time, or `None` for a first snapshot.
    pub parent_id: Option<SnapshotId>,
    /// The worktree this snapshot was taken from.
    pub worktree_name: WorktreeName,
    /// Creation time, RFC3339 with millisecond precision (`Z`).
    pub created_at: String,
    /// Free-text note supplied by the caller.
    pub note: String,
    /// Unordered tag set; duplicates collapse at construction.
    pub tags: Vec<String>,
    /// The engine that actually materialized the payload.
    pub engine: EngineKind,
    /// SHA-256 over the canonical enumeration of the payload tree.
    pub payload_root_hash: String,
    /// SHA-256 of the canonical reduced document (see module docs).
    pub descriptor_checksum: String,
    /// Verification status; outside checksum coverage.
    pub integrity_state: IntegrityState,
}

impl Descriptor {
    /// Build a descriptor with its checksum already computed.
    ///
    /// Tags are sorted and deduplicated here so that logically equal tag
    /// sets always produce the same checksum.
    ///
    /// # Errors
    /// Returns an error only if canonical serialization fails.
    #[allow(clippy::too_many_arguments)]
    pub fn sealed(
        snapshot_id: SnapshotId,
        parent_id: Option<SnapshotId>,
        worktree_name: WorktreeName,
        created_at: String,
        note: String,
        tags: Vec<String>,
        engine: EngineKind,
        payload_root_hash: String,
    ) -> Result<Self> {
        let mut tags = tags;
        tags.sort_unstable();
        tags.dedup();

        let mut descriptor = Self {
            snapshot_id,
            parent_id,
            worktree_name,
            created_at,
            note,
            tags,
            engine,
            payload_root_hash,
            descriptor_checksum: String::new(),
            integrity_state: IntegrityState::Verified,
        };
        descriptor.descriptor_checksum = descriptor.compute_checksum()?;
        Ok(descriptor)
    }

    /// Recompute the checksum from a fresh reduced document.
    ///
    /// # Errors
    /// Returns an error only if canonical serialization fails.
    pub fn compute_checksum(&self) -> Result<String> {
        let mut doc = serde_json::to_value(self)?;
        if let Some(map) = doc.as_object_mut() {
            map.remove("descriptor_checksum");
            map.remove("integrity_state");
        }
        let bytes = canonical::to_canonical_bytes(&doc)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Verify the stored checksum against a freshly computed one.
    ///
    /// # Errors
    /// Returns `DESCRIPTOR_CORRUPT` on mismatch.
    pub fn verify_checksum(&self) -> Result<()> {
        let expected = self.compute_checksum()?;
        if expected == self.descriptor_checksum {
            Ok(())
        } else {
            Err(JvsError::DescriptorCorrupt {
                snapshot_id: self.snapshot_id.as_str().to_owned(),
                detail: format!(
                    "checksum mismatch: stored {}, computed {expected}",
                    self.descriptor_checksum
                ),
            })
        }
    }

    /// Load and parse a descriptor file.
    ///
    /// # Errors
    /// Returns `DESCRIPTOR_CORRUPT` if the file cannot be parsed, or an I/O
    /// error if it cannot be read. Does not verify the checksum.
    pub fn load(path: &Path, id_hint: &str) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| JvsError::DescriptorCorrupt {
            snapshot_id: id_hint.to_owned(),
            detail: format!("unparseable descriptor: {e}"),
        })
    }

    /// Durably write this descriptor to `path`.
    ///
    /// # Errors
    /// Returns an error on serialization or I/O failure.
    pub fn store(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        fsx::atomic_write(path, &bytes, fsx::DEFAULT_FILE_MODE)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(tags: Vec<String>) -> Descriptor {
        Descriptor::sealed(
            SnapshotId::new("1700000000123-0a1b2c3d").unwrap(),
            None,
            WorktreeName::main(),
            "2026-02-19T12:00:00.000Z".to_owned(),
            "first".to_owned(),
            tags,
            EngineKind::Copy,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855".to_owned(),
        )
        .unwrap()
    }

    #[test]
    fn sealed_checksum_verifies() {
        let d = sample(vec![]);
        assert_eq!(d.descriptor_checksum.len(), 64);
        d.verify_checksum().unwrap();
    }

    #[test]
    fn checksum_is_deterministic_across_instances() {
        let a = sample(vec!["x".to_owned()]);
        let b = sample(vec!["x".to_owned()]);
        assert_eq!(a.descriptor_checksum, b.descriptor_checksum);
    }

    #[test]
    fn tags_are_sorted_and_deduplicated() {
        let d = sample(vec!["b".to_owned(), "a".to_owned(), "b".to_owned()]);
        assert_eq!(d.tags, vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn tag_order_does_not_change_checksum() {
        let a = sample(vec!["x".to_owned(), "y".to_owned()]);
        let b = sample(vec!["y".to_owned(), "x".to_owned()]);
        assert_eq!(a.descriptor_checksum, b.descriptor_checksum);
    }

    #[test]
    fn integrity_state_is_outside_coverage() {
        let mut d = sample(vec![]);
        d.integrity_state = IntegrityState::Tampered;
        d.verify_checksum().unwrap();
    }

    #[test]
    fn note_is_inside_coverage() {
        let mut d = sample(vec![]);
        d.note = "edited".to_owned();
        let err = d.verify_checksum().unwrap_err();
        assert_eq!(err.code(), "DESCRIPTOR_CORRUPT");
    }

    #[test]
    fn payload_hash_is_inside_coverage() {
        let mut d = sample(vec![]);
        d.payload_root_hash =
            "ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff".to_owned();
        assert!(d.verify_checksum().is_err());
    }

    #[test]
    fn store_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.json");
        let d = sample(vec!["release".to_owned()]);
        d.store(&path).unwrap();
        let loaded = Descriptor::load(&path, d.snapshot_id.as_str()).unwrap();
        assert_eq!(d, loaded);
        loaded.verify_checksum().unwrap();
    }

    #[test]
    fn load_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.json");
        std::fs::write(&path, b"not json").unwrap();
        let err = Descriptor::load(&path, "x").unwrap_err();
        assert_eq!(err.code(), "DESCRIPTOR_CORRUPT");
    }

    #[test]
    fn single_byte_tamper_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("d.json");
        let d = sample(vec![]);
        d.store(&path).unwrap();

        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw = raw.replace("\"note\": \"first\"", "\"note\": \"burst\"");
        std::fs::write(&path, raw).unwrap();

        let loaded = Descriptor::load(&path, d.snapshot_id.as_str()).unwrap();
        assert!(loaded.verify_checksum().is_err());
    }
}
