//! Error types for jvs.
//!
//! Defines [`JvsError`], the unified error type for all snapshot-engine
//! operations. Every variant carries a stable machine code (see
//! [`JvsError::code`]) that is quoted on exit and audit surfaces, plus a
//! human message with actionable guidance on how to recover.
//!
//! Concurrency errors (`LOCK_*`, `FENCING_MISMATCH`) may be retried or
//! escalated by the caller; integrity errors (`DESCRIPTOR_CORRUPT`,
//! `PAYLOAD_HASH_MISMATCH`, `AUDIT_CHAIN_BROKEN`, `FORMAT_UNSUPPORTED`)
//! always surface directly and are never auto-repaired.

use std::fmt;
use std::path::PathBuf;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, JvsError>;

// ---------------------------------------------------------------------------
// JvsError
// ---------------------------------------------------------------------------

/// Unified error type for snapshot-engine operations.
///
/// Each variant is self-contained: a caller receiving this error can tell
/// what happened and what to do next without additional context, and can
/// branch on [`JvsError::code`] without string-matching messages.
#[derive(Debug)]
pub enum JvsError {
    /// A valid, unexpired lock is held by someone else.
    LockConflict {
        /// The worktree whose lock is held.
        worktree: String,
        /// When the current holder's lease expires (RFC3339).
        holder_expires_at: String,
    },

    /// The caller's lease expired before the operation completed.
    LockExpired {
        /// The worktree whose lock expired.
        worktree: String,
    },

    /// The caller presented a nonce that does not match the stored lock.
    LockNotHeld {
        /// The worktree in question.
        worktree: String,
    },

    /// A fencing token no longer matches the current lock generation.
    FencingMismatch {
        /// The worktree in question.
        worktree: String,
        /// The token the caller started the operation under.
        presented: u64,
        /// The token currently persisted for the worktree.
        current: u64,
    },

    /// A descriptor failed checksum verification or could not be parsed.
    DescriptorCorrupt {
        /// The snapshot whose descriptor is corrupt.
        snapshot_id: String,
        /// What exactly failed (parse error, checksum mismatch, …).
        detail: String,
    },

    /// A snapshot payload no longer hashes to the descriptor's root hash.
    PayloadHashMismatch {
        /// The snapshot whose payload was checked.
        snapshot_id: String,
        /// The hash recorded in the descriptor.
        expected: String,
        /// The hash recomputed from the tree.
        actual: String,
    },

    /// The audit log's hash chain is broken.
    AuditChainBroken {
        /// One-based line number of the first bad record.
        line: usize,
        /// What mismatched.
        detail: String,
    },

    /// The repository's format version is newer than this build understands.
    FormatUnsupported {
        /// The version found on disk.
        found: u32,
        /// The highest version this build supports.
        supported: u32,
    },

    /// No snapshot matched the given id or query.
    SnapshotNotFound {
        /// The id or query that was looked up.
        query: String,
    },

    /// The requested worktree does not exist.
    WorktreeNotFound {
        /// The worktree name that was not found.
        name: String,
    },

    /// A free-form query matched more than one snapshot.
    AmbiguousQuery {
        /// The query as given.
        query: String,
        /// Ids of the candidates, best match first.
        candidates: Vec<String>,
    },

    /// A worktree or ref name failed validation.
    NameInvalid {
        /// The invalid name that was provided.
        name: String,
        /// Why the name is invalid.
        reason: String,
    },

    /// A path resolved outside the boundary it must stay within.
    PathEscape {
        /// The offending path.
        path: PathBuf,
    },

    /// A GC plan's protection set no longer matches the repository.
    GcPlanMismatch {
        /// The plan that was being executed.
        plan_id: String,
        /// What changed since the plan was written.
        detail: String,
    },

    /// The operation was cancelled before reaching its commit point.
    Cancelled {
        /// The operation that was cancelled.
        operation: String,
    },

    /// An unrecoverable filesystem failure.
    Io(std::io::Error),
}

impl JvsError {
    /// Stable machine code for this error class.
    ///
    /// Codes are part of the public contract: exit and audit surfaces quote
    /// them, and they never change between releases.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::LockConflict { .. } => "LOCK_CONFLICT",
            Self::LockExpired { .. } => "LOCK_EXPIRED",
            Self::LockNotHeld { .. } => "LOCK_NOT_HELD",
            Self::FencingMismatch { .. } => "FENCING_MISMATCH",
            Self::DescriptorCorrupt { .. } => "DESCRIPTOR_CORRUPT",
            Self::PayloadHashMismatch { .. } => "PAYLOAD_HASH_MISMATCH",
            Self::AuditChainBroken { .. } => "AUDIT_CHAIN_BROKEN",
            Self::FormatUnsupported { .. } => "FORMAT_UNSUPPORTED",
            Self::SnapshotNotFound { .. } => "SNAPSHOT_NOT_FOUND",
            Self::WorktreeNotFound { .. } => "WORKTREE_NOT_FOUND",
            Self::AmbiguousQuery { .. } => "AMBIGUOUS_QUERY",
            Self::NameInvalid { .. } => "NAME_INVALID",
            Self::PathEscape { .. } => "PATH_ESCAPE",
            Self::GcPlanMismatch { .. } => "GC_PLAN_MISMATCH",
            Self::Cancelled { .. } => "CANCELLED",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Whether this error belongs to the integrity class.
    ///
    /// Integrity errors always surface directly and are never auto-repaired
    /// by the doctor.
    #[must_use]
    pub const fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::DescriptorCorrupt { .. }
                | Self::PayloadHashMismatch { .. }
                | Self::AuditChainBroken { .. }
                | Self::FormatUnsupported { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Display — actionable error messages
// ---------------------------------------------------------------------------

impl fmt::Display for JvsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockConflict {
                worktree,
                holder_expires_at,
            } => {
                write!(
                    f,
                    "[LOCK_CONFLICT] worktree '{worktree}' is locked (lease expires {holder_expires_at}).\n  To fix: wait for the lease to expire, or steal the lock if the holder is gone."
                )
            }
            Self::LockExpired { worktree } => {
                write!(
                    f,
                    "[LOCK_EXPIRED] lease on worktree '{worktree}' expired before renewal.\n  To fix: re-acquire the lock and retry the operation."
                )
            }
            Self::LockNotHeld { worktree } => {
                write!(
                    f,
                    "[LOCK_NOT_HELD] caller does not hold the lock on worktree '{worktree}'.\n  To fix: acquire the lock before mutating this worktree."
                )
            }
            Self::FencingMismatch {
                worktree,
                presented,
                current,
            } => {
                write!(
                    f,
                    "[FENCING_MISMATCH] fencing token {presented} for worktree '{worktree}' is stale (current is {current}).\n  The lock was stolen while this operation ran; its effects must not be committed."
                )
            }
            Self::DescriptorCorrupt {
                snapshot_id,
                detail,
            } => {
                write!(
                    f,
                    "[DESCRIPTOR_CORRUPT] descriptor for snapshot {snapshot_id} failed verification: {detail}\n  Integrity damage is never auto-repaired."
                )
            }
            Self::PayloadHashMismatch {
                snapshot_id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "[PAYLOAD_HASH_MISMATCH] payload of snapshot {snapshot_id} does not match its descriptor.\n  expected: {expected}\n  actual:   {actual}"
                )
            }
            Self::AuditChainBroken { line, detail } => {
                write!(
                    f,
                    "[AUDIT_CHAIN_BROKEN] audit log chain breaks at line {line}: {detail}"
                )
            }
            Self::FormatUnsupported { found, supported } => {
                write!(
                    f,
                    "[FORMAT_UNSUPPORTED] repository format version {found} is newer than supported version {supported}.\n  To fix: upgrade jvs before opening this repository."
                )
            }
            Self::SnapshotNotFound { query } => {
                write!(
                    f,
                    "[SNAPSHOT_NOT_FOUND] no snapshot matches '{query}'.\n  To fix: list snapshots and check the id, tag, or note."
                )
            }
            Self::WorktreeNotFound { name } => {
                write!(
                    f,
                    "[WORKTREE_NOT_FOUND] worktree '{name}' does not exist.\n  To fix: list worktrees to see what is available."
                )
            }
            Self::AmbiguousQuery { query, candidates } => {
                write!(
                    f,
                    "[AMBIGUOUS_QUERY] '{query}' matches {} snapshots:",
                    candidates.len()
                )?;
                for c in candidates {
                    write!(f, "\n  - {c}")?;
                }
                write!(f, "\n  To fix: use a longer prefix or the full snapshot id.")
            }
            Self::NameInvalid { name, reason } => {
                write!(
                    f,
                    "[NAME_INVALID] invalid name '{name}': {reason}\n  Names may contain only letters, digits, '.', '_' and '-'."
                )
            }
            Self::PathEscape { path } => {
                write!(
                    f,
                    "[PATH_ESCAPE] path '{}' resolves outside the payload root",
                    path.display()
                )
            }
            Self::GcPlanMismatch { plan_id, detail } => {
                write!(
                    f,
                    "[GC_PLAN_MISMATCH] plan {plan_id} is stale: {detail}\n  To fix: discard the plan and compute a fresh one."
                )
            }
            Self::Cancelled { operation } => {
                write!(
                    f,
                    "[CANCELLED] {operation} was cancelled before its commit point"
                )
            }
            Self::Io(err) => {
                write!(
                    f,
                    "[IO_ERROR] {err}\n  To fix: check file permissions and disk space."
                )
            }
        }
    }
}

// ---------------------------------------------------------------------------
// std::error::Error / From impls
// ---------------------------------------------------------------------------

impl std::error::Error for JvsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for JvsError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for JvsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Io(std::io::Error::other(err))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn every_code_is_stable() {
        let err = JvsError::LockConflict {
            worktree: "main".to_owned(),
            holder_expires_at: "2026-01-01T00:00:00.000Z".to_owned(),
        };
        assert_eq!(err.code(), "LOCK_CONFLICT");

        let err = JvsError::FencingMismatch {
            worktree: "main".to_owned(),
            presented: 3,
            current: 4,
        };
        assert_eq!(err.code(), "FENCING_MISMATCH");

        let err = JvsError::GcPlanMismatch {
            plan_id: "p-1".to_owned(),
            detail: "ref set changed".to_owned(),
        };
        assert_eq!(err.code(), "GC_PLAN_MISMATCH");
    }

    #[test]
    fn display_quotes_the_code() {
        let err = JvsError::SnapshotNotFound {
            query: "deadbeef".to_owned(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("[SNAPSHOT_NOT_FOUND]"));
        assert!(msg.contains("deadbeef"));
    }

    #[test]
    fn display_ambiguous_lists_candidates() {
        let err = JvsError::AmbiguousQuery {
            query: "v1".to_owned(),
            candidates: vec![
                "0000000000001-aaaaaaaa".to_owned(),
                "0000000000002-bbbbbbbb".to_owned(),
            ],
        };
        let msg = format!("{err}");
        assert!(msg.contains("2 snapshots"));
        assert!(msg.contains("0000000000001-aaaaaaaa"));
        assert!(msg.contains("longer prefix"));
    }

    #[test]
    fn integrity_classification() {
        let corrupt = JvsError::DescriptorCorrupt {
            snapshot_id: "x".to_owned(),
            detail: "d".to_owned(),
        };
        assert!(corrupt.is_integrity());

        let lookup = JvsError::WorktreeNotFound {
            name: "ghost".to_owned(),
        };
        assert!(!lookup.is_integrity());
    }

    #[test]
    fn io_error_has_source() {
        let err = JvsError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "permission denied",
        ));
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.code(), "IO_ERROR");
    }

    #[test]
    fn from_serde_json_error_maps_to_io() {
        let bad: std::result::Result<serde_json::Value, _> = serde_json::from_str("{nope");
        let err: JvsError = bad.unwrap_err().into();
        assert_eq!(err.code(), "IO_ERROR");
    }
}
