//! Snapshot restoration.
//!
//! Two modes:
//!
//! - **Safe restore** (default) forks a brand-new worktree whose payload is
//!   a clone of the target snapshot; nothing about the current worktree
//!   changes.
//! - **In-place restore** swaps the live payload under a held lock. The
//!   target is cloned into a sibling staging directory, the fencing token
//!   is re-validated, and a pair of directory renames replaces the old
//!   payload — the payload root is always either the old tree or the new
//!   one, never half of each. `head` then moves to the target; `latest`
//!   stays, which is what makes restoring an older point a detach rather
//!   than a history rewrite.

use serde_json::json;

use crate::audit::{AuditEvent, AuditLog, details_from};
use crate::cancel::Cancel;
use crate::engine::Engine;
use crate::error::{JvsError, Result};
use crate::fsx;
use crate::layout::RepoLayout;
use crate::lock::LockManager;
use crate::model::types::{SnapshotId, WorktreeName};
use crate::worktree::{WorktreeConfig, WorktreeManager};

// ---------------------------------------------------------------------------
// Restorer
// ---------------------------------------------------------------------------

/// Runs both restore modes for one repository.
#[derive(Debug)]
pub struct Restorer<'a> {
    layout: &'a RepoLayout,
    engine: &'a Engine,
    locks: &'a LockManager,
    worktrees: &'a WorktreeManager,
    audit: &'a AuditLog,
}

impl<'a> Restorer<'a> {
    /// Wire a restorer over the repository's services.
    #[must_use]
    pub const fn new(
        layout: &'a RepoLayout,
        engine: &'a Engine,
        locks: &'a LockManager,
        worktrees: &'a WorktreeManager,
        audit: &'a AuditLog,
    ) -> Self {
        Self {
            layout,
            engine,
            locks,
            worktrees,
            audit,
        }
    }

    /// Fork a new worktree from `target`'s payload.
    ///
    /// The caller's current worktree is untouched; the new worktree starts
    /// attached at the target (`head == latest == target`).
    ///
    /// # Errors
    /// `SNAPSHOT_NOT_FOUND` when the target has no descriptor; an
    /// `AlreadyExists` I/O error when `new_name` is taken.
    pub fn restore_safe(
        &self,
        target: &SnapshotId,
        new_name: &WorktreeName,
        cancel: &Cancel,
    ) -> Result<WorktreeConfig> {
        self.require_descriptor(target)?;
        if self.layout.worktree_config_path(new_name).exists() {
            return Err(JvsError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("worktree '{new_name}' already exists"),
            )));
        }

        let payload = self.layout.payload_root(new_name);
        self.engine
            .clone_tree(&self.layout.snapshot_dir(target), &payload, cancel)?;
        strip_ready_marker(&payload)?;

        let config = self
            .worktrees
            .create_with_pointers(new_name, Some(target.clone()))?;

        self.audit.append(
            AuditEvent::Restore,
            Some(target.clone()),
            Some(new_name.clone()),
            details_from([("mode", json!("safe"))]),
        )?;
        tracing::info!(snapshot = %target, worktree = %new_name, "safe restore");
        Ok(config)
    }

    /// Swap `name`'s live payload for `target`'s, in place.
    ///
    /// Acquires the worktree lock for the duration and re-validates its
    /// fencing token immediately before any pointer change.
    ///
    /// # Errors
    /// `SNAPSHOT_NOT_FOUND`, `LOCK_CONFLICT`, `FENCING_MISMATCH`,
    /// `CANCELLED`, or I/O errors.
    pub fn restore_in_place(
        &self,
        name: &WorktreeName,
        target: &SnapshotId,
        cancel: &Cancel,
    ) -> Result<WorktreeConfig> {
        self.require_descriptor(target)?;
        let _ = self.worktrees.load(name)?;
        let lock = self.locks.acquire(name, "restore")?;

        let result = self.swap_locked(name, target, lock.fencing_token, cancel);
        let _ = self.locks.release(name, &lock.holder_nonce);
        result
    }

    fn swap_locked(
        &self,
        name: &WorktreeName,
        target: &SnapshotId,
        fencing_token: u64,
        cancel: &Cancel,
    ) -> Result<WorktreeConfig> {
        let payload = self.layout.payload_root(name);
        let staging = staging_payload_path(&payload);
        let retired = retired_payload_path(&payload);
        for leftover in [&staging, &retired] {
            if leftover.exists() {
                std::fs::remove_dir_all(leftover)?;
            }
        }

        let stage = || -> Result<WorktreeConfig> {
            self.engine
                .clone_tree(&self.layout.snapshot_dir(target), &staging, cancel)?;
            strip_ready_marker(&staging)?;
            cancel.check("in-place restore")?;

            // The clone may have outlived the lease.
            self.locks.validate_fencing(name, fencing_token)?;

            // Swap: the payload root is visible-old or visible-new, never
            // a partial mix.
            fsx::rename_and_sync(&payload, &retired)?;
            fsx::rename_and_sync(&staging, &payload)?;
            std::fs::remove_dir_all(&retired)?;

            let config = self.worktrees.set_head(name, target)?;
            self.audit.append(
                AuditEvent::Restore,
                Some(target.clone()),
                Some(name.clone()),
                details_from([("mode", json!("in-place"))]),
            )?;
            tracing::info!(snapshot = %target, worktree = %name, "in-place restore");
            Ok(config)
        };

        stage().inspect_err(|_| {
            // If the failure hit between the two swap renames, the live
            // payload path is absent and the old tree sits at `retired`.
            // Put it back before anything else; the payload root must be
            // visible-old or visible-new, never missing.
            if !payload.exists() && retired.exists() {
                let _ = fsx::rename_and_sync(&retired, &payload);
            }
            if staging.exists() {
                let _ = std::fs::remove_dir_all(&staging);
            }
        })
    }

    fn require_descriptor(&self, target: &SnapshotId) -> Result<()> {
        if self.layout.descriptor_path(target).exists() {
            Ok(())
        } else {
            Err(JvsError::SnapshotNotFound {
                query: target.as_str().to_owned(),
            })
        }
    }
}

/// `<payload>.restore-tmp` — where the in-place swap stages the clone.
pub(crate) fn staging_payload_path(payload: &std::path::Path) -> std::path::PathBuf {
    sibling(payload, "restore-tmp")
}

/// `<payload>.old-tmp` — where the swap parks the previous payload. A
/// hard crash between the two swap renames leaves the old tree here; the
/// doctor renames it back.
pub(crate) fn retired_payload_path(payload: &std::path::Path) -> std::path::PathBuf {
    sibling(payload, "old-tmp")
}

/// `<payload>.<suffix>` next to the payload root, on the same filesystem
/// so the swap renames stay atomic.
fn sibling(payload: &std::path::Path, suffix: &str) -> std::path::PathBuf {
    let mut name = payload
        .file_name()
        .map_or_else(|| "payload".to_owned(), |n| n.to_string_lossy().into_owned());
    name.push('.');
    name.push_str(suffix);
    payload.with_file_name(name)
}

/// The clone of a snapshot directory carries its `.READY`; payload roots
/// hold user data only.
fn strip_ready_marker(payload: &std::path::Path) -> Result<()> {
    let marker = payload.join(crate::hash::READY_MARKER);
    if marker.exists() {
        std::fs::remove_file(marker)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::lock::LockPolicy;
    use crate::model::types::EngineKind;
    use crate::snapshot::{SnapshotCreator, SnapshotOptions};
    use tempfile::tempdir;

    struct Rig {
        layout: RepoLayout,
        engine: Engine,
        locks: LockManager,
        worktrees: WorktreeManager,
        audit: AuditLog,
    }

    impl Rig {
        fn new(dir: &std::path::Path) -> Self {
            let layout = RepoLayout::init(dir).unwrap();
            let worktrees = WorktreeManager::new(layout.clone());
            worktrees.create(&WorktreeName::main()).unwrap();
            Self {
                engine: Engine::from_kind(EngineKind::Copy),
                locks: LockManager::new(layout.clone(), LockPolicy::default()),
                worktrees,
                audit: AuditLog::new(layout.audit_path()),
                layout,
            }
        }

        fn restorer(&self) -> Restorer<'_> {
            Restorer::new(
                &self.layout,
                &self.engine,
                &self.locks,
                &self.worktrees,
                &self.audit,
            )
        }

        fn snapshot(&self, note: &str) -> SnapshotId {
            SnapshotCreator::new(
                &self.layout,
                &self.engine,
                &self.locks,
                &self.worktrees,
                &self.audit,
            )
            .publish(
                &WorktreeName::main(),
                &SnapshotOptions {
                    note: note.to_owned(),
                    tags: vec![],
                },
                &Cancel::new(),
            )
            .unwrap()
            .descriptor
            .snapshot_id
        }

        fn write_main(&self, rel: &str, content: &[u8]) {
            std::fs::write(
                self.layout.payload_root(&WorktreeName::main()).join(rel),
                content,
            )
            .unwrap();
        }
    }

    #[test]
    fn safe_restore_forks_attached_worktree() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        rig.write_main("a.txt", b"hi");
        let id = rig.snapshot("first");

        let fork = WorktreeName::new("from-first").unwrap();
        let config = rig
            .restorer()
            .restore_safe(&id, &fork, &Cancel::new())
            .unwrap();

        assert!(config.is_attached());
        assert_eq!(config.head_snapshot_id, Some(id));
        let payload = rig.layout.payload_root(&fork);
        assert_eq!(std::fs::read(payload.join("a.txt")).unwrap(), b"hi");
        assert!(!payload.join(crate::hash::READY_MARKER).exists());
    }

    #[test]
    fn safe_restore_leaves_source_worktree_alone() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        rig.write_main("a.txt", b"hi");
        let id = rig.snapshot("first");
        rig.write_main("a.txt", b"dirty");

        rig.restorer()
            .restore_safe(&id, &WorktreeName::new("fork").unwrap(), &Cancel::new())
            .unwrap();

        let main_payload = rig.layout.payload_root(&WorktreeName::main());
        assert_eq!(std::fs::read(main_payload.join("a.txt")).unwrap(), b"dirty");
    }

    #[test]
    fn in_place_restore_swaps_payload_and_detaches() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        rig.write_main("a.txt", b"hi");
        let first = rig.snapshot("first");
        rig.write_main("a.txt", b"bye");
        let second = rig.snapshot("second");

        let config = rig
            .restorer()
            .restore_in_place(&WorktreeName::main(), &first, &Cancel::new())
            .unwrap();

        let payload = rig.layout.payload_root(&WorktreeName::main());
        assert_eq!(std::fs::read(payload.join("a.txt")).unwrap(), b"hi");
        assert_eq!(config.head_snapshot_id, Some(first));
        assert_eq!(config.latest_snapshot_id, Some(second));
        assert!(!config.is_attached());
        assert!(!payload.join(crate::hash::READY_MARKER).exists());
    }

    #[test]
    fn restore_unknown_snapshot_is_not_found() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        let ghost = SnapshotId::new("1700000000999-deadbeef").unwrap();
        let err = rig
            .restorer()
            .restore_in_place(&WorktreeName::main(), &ghost, &Cancel::new())
            .unwrap_err();
        assert_eq!(err.code(), "SNAPSHOT_NOT_FOUND");

        let err = rig
            .restorer()
            .restore_safe(&ghost, &WorktreeName::new("f").unwrap(), &Cancel::new())
            .unwrap_err();
        assert_eq!(err.code(), "SNAPSHOT_NOT_FOUND");
    }

    #[test]
    fn in_place_restore_refused_while_locked() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        rig.write_main("a.txt", b"hi");
        let id = rig.snapshot("first");
        rig.locks.acquire(&WorktreeName::main(), "other").unwrap();

        let err = rig
            .restorer()
            .restore_in_place(&WorktreeName::main(), &id, &Cancel::new())
            .unwrap_err();
        assert_eq!(err.code(), "LOCK_CONFLICT");
    }

    #[test]
    fn cancelled_in_place_restore_leaves_payload_untouched() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        rig.write_main("a.txt", b"hi");
        let id = rig.snapshot("first");
        rig.write_main("a.txt", b"live");

        let cancel = Cancel::new();
        cancel.cancel();
        let err = rig
            .restorer()
            .restore_in_place(&WorktreeName::main(), &id, &cancel)
            .unwrap_err();
        assert_eq!(err.code(), "CANCELLED");

        let payload = rig.layout.payload_root(&WorktreeName::main());
        assert_eq!(std::fs::read(payload.join("a.txt")).unwrap(), b"live");
        // No staging debris next to the payload root.
        assert!(!sibling(&payload, "restore-tmp").exists());
    }

    #[test]
    fn both_modes_append_audit_records() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        rig.write_main("a.txt", b"hi");
        let id = rig.snapshot("first");

        rig.restorer()
            .restore_safe(&id, &WorktreeName::new("fork").unwrap(), &Cancel::new())
            .unwrap();
        rig.restorer()
            .restore_in_place(&WorktreeName::main(), &id, &Cancel::new())
            .unwrap();

        let records = rig.audit.read_all().unwrap();
        let restores: Vec<_> = records
            .iter()
            .filter(|r| r.event_type == AuditEvent::Restore)
            .collect();
        assert_eq!(restores.len(), 2);
        assert_eq!(rig.audit.validate(true).unwrap(), records.len());
    }
}
