//! Hash-chained append-only audit log.
//!
//! Every mutating operation appends exactly one JSONL record to
//! `.jvs/audit/audit.jsonl`. Each record carries the hash of its
//! predecessor, so the file forms a tamper-evident chain: `prev_hash` of
//! line *n* equals `record_hash` of line *n−1*, and the first line points
//! at the all-zero hash.
//!
//! The record hash is the SHA-256 of the canonical-JSON encoding of every
//! field except `record_hash` itself. Appends are serialized process-wide
//! and fsynced before returning; a crash between write and fsync can tear
//! at most the final line, which non-strict validation tolerates.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::canonical;
use crate::error::{JvsError, Result};
use crate::hash::ZERO_HASH;
use crate::model::types::{SnapshotId, WorktreeName, now_rfc3339_millis};

// ---------------------------------------------------------------------------
// AuditEvent
// ---------------------------------------------------------------------------

/// The operation an audit record describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    SnapshotCreate,
    SnapshotDelete,
    Restore,
    LockAcquire,
    LockRelease,
    LockSteal,
    WorktreeCreate,
    WorktreeRename,
    WorktreeRemove,
    RefCreate,
    RefDelete,
    GcPlan,
    GcRun,
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SnapshotCreate => "snapshot_create",
            Self::SnapshotDelete => "snapshot_delete",
            Self::Restore => "restore",
            Self::LockAcquire => "lock_acquire",
            Self::LockRelease => "lock_release",
            Self::LockSteal => "lock_steal",
            Self::WorktreeCreate => "worktree_create",
            Self::WorktreeRename => "worktree_rename",
            Self::WorktreeRemove => "worktree_remove",
            Self::RefCreate => "ref_create",
            Self::RefDelete => "ref_delete",
            Self::GcPlan => "gc_plan",
            Self::GcRun => "gc_run",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// AuditRecord
// ---------------------------------------------------------------------------

/// One line of the audit log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// When the operation completed (RFC3339, milliseconds, UTC).
    pub timestamp: String,
    /// What happened.
    pub event_type: AuditEvent,
    /// The snapshot involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<SnapshotId>,
    /// The worktree involved, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_name: Option<WorktreeName>,
    /// Free-form details. `BTreeMap` keeps canonical JSON deterministic.
    pub details: BTreeMap<String, serde_json::Value>,
    /// `record_hash` of the previous line, or all zeros for the first.
    pub prev_hash: String,
    /// SHA-256 over the canonical JSON of all fields above.
    pub record_hash: String,
}

impl AuditRecord {
    /// Compute this record's hash from a fresh reduced document.
    ///
    /// # Errors
    /// Returns an error only if canonical serialization fails.
    pub fn compute_hash(&self) -> Result<String> {
        let mut doc = serde_json::to_value(self)?;
        if let Some(map) = doc.as_object_mut() {
            map.remove("record_hash");
        }
        let bytes = canonical::to_canonical_bytes(&doc)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

/// Handle to the repository's audit log.
///
/// Appends are serialized through an internal mutex; the chain tail is
/// re-read under the lock on every append, so multiple handles over the
/// same file stay consistent within one process.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    append_lock: Mutex<()>,
}

impl AuditLog {
    /// Wrap the log file at `path` (created on first append).
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self {
            path,
            append_lock: Mutex::new(()),
        }
    }

    /// Append one record and fsync.
    ///
    /// # Errors
    /// Returns an error on I/O failure or if the existing tail is
    /// unreadable.
    pub fn append(
        &self,
        event_type: AuditEvent,
        snapshot_id: Option<SnapshotId>,
        worktree_name: Option<WorktreeName>,
        details: BTreeMap<String, serde_json::Value>,
    ) -> Result<AuditRecord> {
        let guard = self
            .append_lock
            .lock()
            .map_err(|_| JvsError::Io(std::io::Error::other("audit append lock poisoned")))?;

        let prev_hash = self.tail_hash()?;
        let mut record = AuditRecord {
            timestamp: now_rfc3339_millis(),
            event_type,
            snapshot_id,
            worktree_name,
            details,
            prev_hash,
            record_hash: String::new(),
        };
        record.record_hash = record.compute_hash()?;

        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::options()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_all()?;

        drop(guard);
        Ok(record)
    }

    /// All parseable records in file order.
    ///
    /// # Errors
    /// Returns an error on I/O failure. Does not validate the chain.
    pub fn read_all(&self) -> Result<Vec<AuditRecord>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(record) = serde_json::from_str::<AuditRecord>(line) {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Validate the hash chain, returning the number of valid records.
    ///
    /// In non-strict mode a torn (unparseable) final line is tolerated —
    /// that is the benign crash-between-write-and-fsync case. Strict mode
    /// flags it.
    ///
    /// # Errors
    /// Returns `AUDIT_CHAIN_BROKEN` at the first record whose `prev_hash`
    /// or `record_hash` mismatches.
    pub fn validate(&self, strict: bool) -> Result<usize> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();

        let mut expected_prev = ZERO_HASH.to_owned();
        for (idx, line) in lines.iter().enumerate() {
            let record: AuditRecord = match serde_json::from_str(line) {
                Ok(r) => r,
                Err(e) => {
                    if !strict && idx == lines.len() - 1 {
                        // Torn tail from a crash before fsync.
                        return Ok(idx);
                    }
                    return Err(JvsError::AuditChainBroken {
                        line: idx + 1,
                        detail: format!("unparseable record: {e}"),
                    });
                }
            };
            if record.prev_hash != expected_prev {
                return Err(JvsError::AuditChainBroken {
                    line: idx + 1,
                    detail: format!(
                        "prev_hash {} does not match previous record_hash {expected_prev}",
                        record.prev_hash
                    ),
                });
            }
            let recomputed = record.compute_hash()?;
            if recomputed != record.record_hash {
                return Err(JvsError::AuditChainBroken {
                    line: idx + 1,
                    detail: "record_hash does not match record content".to_owned(),
                });
            }
            expected_prev = record.record_hash;
        }
        Ok(lines.len())
    }

    /// `record_hash` of the last complete line, or the zero hash.
    fn tail_hash(&self) -> Result<String> {
        let records = self.read_all()?;
        Ok(records
            .last()
            .map_or_else(|| ZERO_HASH.to_owned(), |r| r.record_hash.clone()))
    }
}

/// Build a details map from string pairs — the common case.
#[must_use]
pub fn details_from<const N: usize>(
    pairs: [(&str, serde_json::Value); N],
) -> BTreeMap<String, serde_json::Value> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn log_in(dir: &std::path::Path) -> AuditLog {
        AuditLog::new(dir.join("audit").join("audit.jsonl"))
    }

    #[test]
    fn first_record_points_at_zero_hash() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());
        let record = log
            .append(AuditEvent::SnapshotCreate, None, None, BTreeMap::new())
            .unwrap();
        assert_eq!(record.prev_hash, ZERO_HASH);
        assert_eq!(record.record_hash.len(), 64);
    }

    #[test]
    fn chain_links_and_validates() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());
        let first = log
            .append(AuditEvent::SnapshotCreate, None, None, BTreeMap::new())
            .unwrap();
        let second = log
            .append(
                AuditEvent::Restore,
                None,
                Some(WorktreeName::main()),
                details_from([("target", json!("x"))]),
            )
            .unwrap();
        assert_eq!(second.prev_hash, first.record_hash);
        assert_eq!(log.validate(true).unwrap(), 2);
    }

    #[test]
    fn tamper_is_detected() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());
        log.append(
            AuditEvent::SnapshotCreate,
            None,
            None,
            details_from([("note", json!("first"))]),
        )
        .unwrap();
        log.append(AuditEvent::GcPlan, None, None, BTreeMap::new())
            .unwrap();

        let path = dir.path().join("audit").join("audit.jsonl");
        let tampered = std::fs::read_to_string(&path)
            .unwrap()
            .replace("first", "forged");
        std::fs::write(&path, tampered).unwrap();

        let err = log.validate(true).unwrap_err();
        assert_eq!(err.code(), "AUDIT_CHAIN_BROKEN");
        assert!(format!("{err}").contains("line 1"));
    }

    #[test]
    fn torn_tail_tolerated_when_not_strict() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());
        log.append(AuditEvent::SnapshotCreate, None, None, BTreeMap::new())
            .unwrap();

        let path = dir.path().join("audit").join("audit.jsonl");
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"timestamp\":\"2026-");
        std::fs::write(&path, raw).unwrap();

        assert_eq!(log.validate(false).unwrap(), 1);
        assert!(log.validate(true).is_err());
    }

    #[test]
    fn missing_file_validates_empty() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());
        assert_eq!(log.validate(true).unwrap(), 0);
        assert!(log.read_all().unwrap().is_empty());
    }

    #[test]
    fn event_names_are_snake_case() {
        assert_eq!(
            serde_json::to_string(&AuditEvent::SnapshotCreate).unwrap(),
            "\"snapshot_create\""
        );
        assert_eq!(format!("{}", AuditEvent::LockSteal), "lock_steal");
    }

    #[test]
    fn optional_fields_are_omitted() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());
        log.append(AuditEvent::GcPlan, None, None, BTreeMap::new())
            .unwrap();
        let raw = std::fs::read_to_string(dir.path().join("audit").join("audit.jsonl")).unwrap();
        assert!(!raw.contains("snapshot_id"));
        assert!(!raw.contains("worktree_name"));
    }

    #[test]
    fn record_hash_covers_details() {
        let dir = tempdir().unwrap();
        let log = log_in(dir.path());
        let record = log
            .append(
                AuditEvent::SnapshotCreate,
                None,
                None,
                details_from([("engine", json!("copy"))]),
            )
            .unwrap();
        let mut altered = record;
        altered
            .details
            .insert("engine".to_owned(), json!("native"));
        assert_ne!(altered.compute_hash().unwrap(), altered.record_hash);
    }
}
