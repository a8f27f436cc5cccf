//! Snapshot creation — the publish protocol.
//!
//! Publishing promotes a live payload tree to a durable, addressable,
//! verifiable snapshot. The sequence is crash-recoverable at every point:
//!
//! 1. resolve the worktree config (refuse if missing)
//! 2. allocate a fresh snapshot id
//! 3. durably write the intent record
//! 4. clone the payload into `snapshots/<id>/` (staging)
//! 5. compute the payload root hash over staging
//! 6. build the descriptor (parent = current `head`) and its checksum
//! 7. write `.READY` into staging and fsync the whole tree
//! 8. re-validate the fencing token, then atomically publish the descriptor
//! 9. advance `latest` (and `head` if attached)
//! 10. append the audit record and remove the intent
//!
//! Before the descriptor lands, a crash leaves only collectable debris
//! (staging + intent). After it lands the snapshot exists; the doctor can
//! finish pointer advancement. Cancellation is honoured up to the
//! descriptor write and refused afterwards.

use serde_json::json;

use crate::audit::{AuditEvent, AuditLog, details_from};
use crate::cancel::Cancel;
use crate::engine::{CloneOutcome, Engine};
use crate::error::Result;
use crate::hash::payload_root_hash;
use crate::layout::RepoLayout;
use crate::lock::{LockManager, LockRecord};
use crate::model::types::now_rfc3339_millis;
use crate::model::{Descriptor, Intent, ReadyMarker, SnapshotId, WorktreeName};
use crate::worktree::{WorktreeConfig, WorktreeManager};

// ---------------------------------------------------------------------------
// Options / result
// ---------------------------------------------------------------------------

/// Caller-supplied snapshot metadata.
#[derive(Clone, Debug, Default)]
pub struct SnapshotOptions {
    /// Free-text note.
    pub note: String,
    /// Tags; duplicates collapse in the descriptor.
    pub tags: Vec<String>,
}

/// A successful publish.
#[derive(Clone, Debug)]
pub struct PublishResult {
    /// The published descriptor.
    pub descriptor: Descriptor,
    /// How the engine fared; callers surface degradations to operators.
    pub clone_outcome: CloneOutcome,
}

// ---------------------------------------------------------------------------
// SnapshotCreator
// ---------------------------------------------------------------------------

/// Runs the publish protocol for one repository.
#[derive(Debug)]
pub struct SnapshotCreator<'a> {
    layout: &'a RepoLayout,
    engine: &'a Engine,
    locks: &'a LockManager,
    worktrees: &'a WorktreeManager,
    audit: &'a AuditLog,
}

impl<'a> SnapshotCreator<'a> {
    /// Wire a creator over the repository's services.
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

    /// Publish a snapshot of `name`'s live payload.
    ///
    /// # Errors
    /// `WORKTREE_NOT_FOUND` for an unknown worktree, `LOCK_CONFLICT`
    /// while another operation holds the worktree, `CANCELLED` before the
    /// commit point, and I/O / fencing errors as they occur.
    pub fn publish(
        &self,
        name: &WorktreeName,
        opts: &SnapshotOptions,
        cancel: &Cancel,
    ) -> Result<PublishResult> {
        let config = self.worktrees.load(name)?;
        let lock = self.locks.acquire(name, "snapshot")?;

        let result = self.publish_locked(&config, &lock, opts, cancel);

        // Best effort: the lock may have expired or been stolen mid-run,
        // in which case the fencing check already decided the outcome.
        let _ = self.locks.release(name, &lock.holder_nonce);
        result
    }

    fn publish_locked(
        &self,
        config: &WorktreeConfig,
        lock: &LockRecord,
        opts: &SnapshotOptions,
        cancel: &Cancel,
    ) -> Result<PublishResult> {
        let name = &config.name;
        cancel.check("snapshot publish")?;

        let id = SnapshotId::generate();
        let intent = Intent {
            snapshot_id: id.clone(),
            worktree_name: name.clone(),
            started_at: now_rfc3339_millis(),
            engine: self.engine.kind(),
        };
        intent.store(&self.layout.intent_path(&id))?;

        let staging = self.layout.snapshot_dir(&id);
        let stage = || -> Result<(Descriptor, CloneOutcome)> {
            let clone_outcome =
                self.engine
                    .clone_tree(&self.layout.payload_root(name), &staging, cancel)?;
            if clone_outcome.degraded {
                tracing::warn!(
                    snapshot = %id,
                    worktree = %name,
                    degradations = ?clone_outcome.labels(),
                    "engine clone degraded"
                );
            }

            let root_hash = payload_root_hash(&staging, cancel)?;
            let descriptor = Descriptor::sealed(
                id.clone(),
                config.head_snapshot_id.clone(),
                name.clone(),
                now_rfc3339_millis(),
                opts.note.clone(),
                opts.tags.clone(),
                self.engine.kind(),
                root_hash.clone(),
            )?;

            cancel.check("snapshot publish")?;
            ReadyMarker {
                snapshot_id: id.clone(),
                completed_at: now_rfc3339_millis(),
                payload_root_hash: root_hash,
            }
            .store(&staging)?;
            crate::fsx::fsync_tree(&staging)?;

            // The clone may have outlived the lease; refuse to commit on a
            // stolen lock.
            self.locks.validate_fencing(name, lock.fencing_token)?;
            cancel.check("snapshot publish")?;
            Ok((descriptor, clone_outcome))
        };

        // Failures up to here abandon the publish entirely.
        let (descriptor, clone_outcome) =
            stage().inspect_err(|_| self.discard(&id, &staging))?;

        // Commit point: once the descriptor lands, the snapshot exists.
        // Later failures leave a published-but-unfinished state the doctor
        // can complete; they must never delete the staged history.
        descriptor.store(&self.layout.descriptor_path(&id))?;
        self.worktrees.advance(name, &id)?;

        self.audit.append(
            AuditEvent::SnapshotCreate,
            Some(id.clone()),
            Some(name.clone()),
            details_from([
                ("engine", json!(self.engine.kind().as_str())),
                ("degraded", json!(clone_outcome.degraded)),
                ("degradations", json!(clone_outcome.labels())),
                ("note", json!(opts.note)),
            ]),
        )?;
        std::fs::remove_file(self.layout.intent_path(&id))?;

        tracing::info!(snapshot = %id, worktree = %name, "snapshot published");
        Ok(PublishResult {
            descriptor,
            clone_outcome,
        })
    }

    /// Remove staging and intent after a failed or cancelled staging
    /// phase.
    fn discard(&self, id: &SnapshotId, staging: &std::path::Path) {
        if staging.exists() {
            let _ = std::fs::remove_dir_all(staging);
        }
        let intent = self.layout.intent_path(id);
        if intent.exists() {
            let _ = std::fs::remove_file(intent);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
