//! The embedding facade.
//!
//! [`Client`] is the typed surface over the whole engine: init/open,
//! snapshot, restore, history, verify, doctor, GC, refs, and worktree
//! management. It is re-entrant — all state lives on disk, and every
//! mutating call serializes through the per-worktree lock manager.
//!
//! Long-running calls take a [`Cancel`] handle that is propagated into
//! engine clones, payload hashing, and GC deletion loops.

use std::path::{Path, PathBuf};

use serde_json::json;

use crate::audit::{AuditEvent, AuditLog, details_from};
use crate::cancel::Cancel;
use crate::catalog;
use crate::engine::{self, Engine};
use crate::error::{JvsError, Result};
use crate::gc::{GarbageCollector, GcPlan, GcReport, RetentionPolicy};
use crate::layout::RepoLayout;
use crate::lock::{LockManager, LockPolicy, LockRecord};
use crate::model::types::{EngineKind, IntegrityState, RefName, SnapshotId, WorktreeName};
use crate::model::Descriptor;
use crate::refs;
use crate::restore::Restorer;
use crate::snapshot::{PublishResult, SnapshotCreator, SnapshotOptions};
use crate::verify::{self, DoctorReport};
use crate::worktree::{WorktreeConfig, WorktreeManager};

/// The literal that resolves to the current worktree's `head`.
pub const HEAD_QUERY: &str = "HEAD";

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// How to restore a snapshot.
#[derive(Clone, Debug)]
pub struct RestoreOptions {
    /// A snapshot id, id prefix, tag, note fragment, or the literal `HEAD`.
    pub query: String,
    /// Swap the current worktree's payload instead of forking.
    pub in_place: bool,
    /// Name for the forked worktree (safe mode); derived from the target's
    /// short id when omitted.
    pub new_worktree: Option<WorktreeName>,
}

/// What a restore did.
#[derive(Clone, Debug)]
pub enum RestoreOutcome {
    /// The target was already `head`; nothing changed.
    AlreadyAtTarget(WorktreeConfig),
    /// A new worktree was forked at the target.
    Forked(WorktreeConfig),
    /// The current worktree's payload was swapped in place.
    Swapped(WorktreeConfig),
}

/// GC invocation options.
#[derive(Clone, Copy, Debug, Default)]
pub struct GcOptions {
    /// Keep-set widening knobs.
    pub retention: RetentionPolicy,
    /// Execute the plan immediately after computing it.
    pub execute: bool,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A handle to one repository.
#[derive(Debug)]
pub struct Client {
    layout: RepoLayout,
    engine: Engine,
    locks: LockManager,
    worktrees: WorktreeManager,
    audit: AuditLog,
    current: WorktreeName,
}

impl Client {
    /// Initialize a fresh repository at `root` and open it.
    ///
    /// Creates the control plane, the `main` worktree, and the first audit
    /// record.
    ///
    /// # Errors
    /// Returns an error if `root` is already a repository or on I/O failure.
    pub fn init(root: &Path) -> Result<Self> {
        let layout = RepoLayout::init(root)?;
        let client = Self::assemble(layout);
        client.worktrees.create(&WorktreeName::main())?;
        client.audit.append(
            AuditEvent::WorktreeCreate,
            None,
            Some(WorktreeName::main()),
            details_from([("at", json!("init"))]),
        )?;
        tracing::info!(root = %root.display(), "repository initialized");
        Ok(client)
    }

    /// Open an existing repository.
    ///
    /// # Errors
    /// `FORMAT_UNSUPPORTED` for a newer on-disk format; I/O errors when
    /// `root` is not a repository.
    pub fn open(root: &Path) -> Result<Self> {
        Ok(Self::assemble(RepoLayout::open(root)?))
    }

    /// Open `root`, initializing it first if it is not yet a repository.
    ///
    /// # Errors
    /// As [`Client::init`] / [`Client::open`].
    pub fn open_or_init(root: &Path) -> Result<Self> {
        if root.join(crate::layout::CONTROL_DIR).exists() {
            Self::open(root)
        } else {
            Self::init(root)
        }
    }

    fn assemble(layout: RepoLayout) -> Self {
        let engine = engine::detect(layout.root());
        Self {
            engine,
            locks: LockManager::new(layout.clone(), LockPolicy::default()),
            worktrees: WorktreeManager::new(layout.clone()),
            audit: AuditLog::new(layout.audit_path()),
            layout,
            current: WorktreeName::main(),
        }
    }

    /// Replace the lock policy (lease TTL, skew tolerance).
    #[must_use]
    pub fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.locks = LockManager::new(self.layout.clone(), policy);
        self
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    /// The repository root directory.
    #[must_use]
    pub fn repo_root(&self) -> &Path {
        self.layout.root()
    }

    /// The opaque repository id.
    ///
    /// # Errors
    /// Returns an error if the scalar cannot be read.
    pub fn repo_id(&self) -> Result<String> {
        self.layout.repo_id()
    }

    /// The engine detection result for this repository.
    #[must_use]
    pub const fn engine_kind(&self) -> EngineKind {
        self.engine.kind()
    }

    /// The current worktree's payload root.
    #[must_use]
    pub fn worktree_payload_path(&self) -> PathBuf {
        self.layout.payload_root(&self.current)
    }

    /// The currently selected worktree.
    #[must_use]
    pub const fn current_worktree(&self) -> &WorktreeName {
        &self.current
    }

    /// Switch the client to another worktree.
    ///
    /// # Errors
    /// `WORKTREE_NOT_FOUND` if no such worktree exists.
    pub fn use_worktree(&mut self, name: &WorktreeName) -> Result<()> {
        let _ = self.worktrees.load(name)?;
        self.current = name.clone();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Publish a snapshot of the current worktree.
    ///
    /// # Errors
    /// See [`SnapshotCreator::publish`].
    pub fn snapshot(&self, opts: &SnapshotOptions, cancel: &Cancel) -> Result<PublishResult> {
        SnapshotCreator::new(
            &self.layout,
            &self.engine,
            &self.locks,
            &self.worktrees,
            &self.audit,
        )
        .publish(&self.current, opts, cancel)
    }

    /// The current worktree's lineage, newest first.
    ///
    /// # Errors
    /// Returns an error on I/O failure.
    pub fn history(&self, limit: usize) -> Result<Vec<Descriptor>> {
        let config = self.worktrees.load(&self.current)?;
        catalog::history(&self.layout, &config, limit)
    }

    /// The descriptor at the current worktree's lineage tip, if any.
    ///
    /// # Errors
    /// Returns an error on I/O failure.
    pub fn latest_snapshot(&self) -> Result<Option<Descriptor>> {
        let config = self.worktrees.load(&self.current)?;
        config
            .latest_snapshot_id
            .map(|id| catalog::load(&self.layout, &id))
            .transpose()
    }

    /// Whether the current worktree has published anything yet.
    ///
    /// # Errors
    /// Returns an error on I/O failure.
    pub fn has_snapshots(&self) -> Result<bool> {
        Ok(self.worktrees.load(&self.current)?.latest_snapshot_id.is_some())
    }

    // -----------------------------------------------------------------------
    // Restore
    // -----------------------------------------------------------------------

    /// Restore a snapshot, safely (fork) or in place.
    ///
    /// The query accepts an id, an id prefix, a tag, a note fragment, or
    /// the literal `HEAD`. Restoring `HEAD` in place is a no-op by
    /// definition — the payload already represents it.
    ///
    /// # Errors
    /// Lookup errors from resolution plus the mode's own errors.
    pub fn restore(&self, opts: &RestoreOptions, cancel: &Cancel) -> Result<RestoreOutcome> {
        let config = self.worktrees.load(&self.current)?;
        let target = self.resolve_query(&opts.query, &config)?;

        if opts.in_place {
            if config.head_snapshot_id.as_ref() == Some(&target) {
                return Ok(RestoreOutcome::AlreadyAtTarget(config));
            }
            let swapped = self
                .restorer()
                .restore_in_place(&self.current, &target, cancel)?;
            return Ok(RestoreOutcome::Swapped(swapped));
        }

        let new_name = match &opts.new_worktree {
            Some(name) => name.clone(),
            None => WorktreeName::new(&format!("restore-{}", target.short()))?,
        };
        let forked = self.restorer().restore_safe(&target, &new_name, cancel)?;
        Ok(RestoreOutcome::Forked(forked))
    }

    fn resolve_query(&self, query: &str, config: &WorktreeConfig) -> Result<SnapshotId> {
        if query == HEAD_QUERY {
            return config
                .head_snapshot_id
                .clone()
                .ok_or_else(|| JvsError::SnapshotNotFound {
                    query: HEAD_QUERY.to_owned(),
                });
        }
        Ok(catalog::resolve(&self.layout, query)?.snapshot_id)
    }

    const fn restorer(&self) -> Restorer<'_> {
        Restorer::new(
            &self.layout,
            &self.engine,
            &self.locks,
            &self.worktrees,
            &self.audit,
        )
    }

    // -----------------------------------------------------------------------
    // Verify / doctor
    // -----------------------------------------------------------------------

    /// Verify one snapshot by id or query.
    ///
    /// # Errors
    /// See [`verify::verify`].
    pub fn verify(
        &self,
        query: &str,
        check_payload: bool,
        cancel: &Cancel,
    ) -> Result<IntegrityState> {
        let id = catalog::resolve(&self.layout, query)?.snapshot_id;
        verify::verify(&self.layout, &id, check_payload, cancel)
    }

    /// Sweep the repository for inconsistencies.
    ///
    /// # Errors
    /// See [`verify::doctor`].
    pub fn doctor(&self, strict: bool, repair_runtime: bool) -> Result<DoctorReport> {
        verify::doctor(
            &self.layout,
            &self.locks,
            &self.worktrees,
            &self.audit,
            strict,
            repair_runtime,
        )
    }

    // -----------------------------------------------------------------------
    // GC
    // -----------------------------------------------------------------------

    /// Compute a GC plan, optionally executing it immediately.
    ///
    /// # Errors
    /// See [`GarbageCollector::plan`] / [`GarbageCollector::run`].
    pub fn gc(&self, opts: GcOptions, cancel: &Cancel) -> Result<(GcPlan, Option<GcReport>)> {
        let collector = self.collector();
        let plan = collector.plan(opts.retention)?;
        if !opts.execute {
            return Ok((plan, None));
        }
        let report = collector.run(&plan.plan_id, cancel)?;
        Ok((plan, Some(report)))
    }

    /// Execute a previously computed plan.
    ///
    /// # Errors
    /// See [`GarbageCollector::run`].
    pub fn run_gc(&self, plan_id: &str, cancel: &Cancel) -> Result<GcReport> {
        self.collector().run(plan_id, cancel)
    }

    const fn collector(&self) -> GarbageCollector<'_> {
        GarbageCollector::new(&self.layout, &self.worktrees, &self.audit)
    }

    // -----------------------------------------------------------------------
    // Refs
    // -----------------------------------------------------------------------

    /// Create a ref protecting the query's target.
    ///
    /// # Errors
    /// Lookup errors from resolution; `AlreadyExists` without `force`.
    pub fn ref_create(&self, name: &RefName, query: &str, force: bool) -> Result<()> {
        let target = catalog::resolve(&self.layout, query)?.snapshot_id;
        refs::create(&self.layout, name, &target, force)?;
        self.audit.append(
            AuditEvent::RefCreate,
            Some(target),
            None,
            details_from([("ref", json!(name.as_str()))]),
        )?;
        Ok(())
    }

    /// Delete a ref.
    ///
    /// # Errors
    /// Returns an error if the ref does not exist.
    pub fn ref_delete(&self, name: &RefName) -> Result<()> {
        refs::delete(&self.layout, name)?;
        self.audit.append(
            AuditEvent::RefDelete,
            None,
            None,
            details_from([("ref", json!(name.as_str()))]),
        )?;
        Ok(())
    }

    /// All refs and their targets.
    ///
    /// # Errors
    /// Returns an error on I/O failure.
    pub fn refs(&self) -> Result<Vec<(RefName, SnapshotId)>> {
        Ok(refs::list(&self.layout)?.into_iter().collect())
    }

    // -----------------------------------------------------------------------
    // Worktrees
    // -----------------------------------------------------------------------

    /// All worktree configs.
    ///
    /// # Errors
    /// Returns an error on I/O failure.
    pub fn worktrees(&self) -> Result<Vec<WorktreeConfig>> {
        self.worktrees.list()
    }

    /// Create a blank worktree.
    ///
    /// # Errors
    /// Returns an error if the name is taken or on I/O failure.
    pub fn create_worktree(&self, name: &WorktreeName) -> Result<WorktreeConfig> {
        let config = self.worktrees.create(name)?;
        self.audit.append(
            AuditEvent::WorktreeCreate,
            None,
            Some(name.clone()),
            details_from([("at", json!("blank"))]),
        )?;
        Ok(config)
    }

    /// Remove a worktree (never `main`).
    ///
    /// # Errors
    /// See [`WorktreeManager::remove`].
    pub fn remove_worktree(&mut self, name: &WorktreeName) -> Result<()> {
        self.worktrees.remove(name, &self.locks)?;
        if self.current == *name {
            self.current = WorktreeName::main();
        }
        self.audit.append(
            AuditEvent::WorktreeRemove,
            None,
            Some(name.clone()),
            std::collections::BTreeMap::new(),
        )?;
        Ok(())
    }

    /// Rename a worktree (never `main`).
    ///
    /// # Errors
    /// See [`WorktreeManager::rename`].
    pub fn rename_worktree(&mut self, old: &WorktreeName, new: &WorktreeName) -> Result<()> {
        self.worktrees.rename(old, new, &self.locks)?;
        if self.current == *old {
            self.current = new.clone();
        }
        self.audit.append(
            AuditEvent::WorktreeRename,
            None,
            Some(new.clone()),
            details_from([("from", json!(old.as_str()))]),
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Locks
    // -----------------------------------------------------------------------

    /// Acquire the current worktree's lock explicitly (for external tools
    /// that need a fenced critical section).
    ///
    /// # Errors
    /// `LOCK_CONFLICT` while held.
    pub fn acquire_lock(&self, purpose: &str) -> Result<LockRecord> {
        let record = self.locks.acquire(&self.current, purpose)?;
        self.audit.append(
            AuditEvent::LockAcquire,
            None,
            Some(self.current.clone()),
            details_from([("purpose", json!(purpose))]),
        )?;
        Ok(record)
    }

    /// Release an explicitly acquired lock.
    ///
    /// # Errors
    /// `LOCK_NOT_HELD` on nonce mismatch.
    pub fn release_lock(&self, record: &LockRecord) -> Result<()> {
        self.locks.release(&self.current, &record.holder_nonce)?;
        self.audit.append(
            AuditEvent::LockRelease,
            None,
            Some(self.current.clone()),
            std::collections::BTreeMap::new(),
        )?;
        Ok(())
    }

    /// Steal an expired lock on the current worktree.
    ///
    /// # Errors
    /// `LOCK_CONFLICT` while the holder is within its lease plus skew.
    pub fn steal_lock(&self, purpose: &str) -> Result<LockRecord> {
        let record = self.locks.steal(&self.current, purpose)?;
        self.audit.append(
            AuditEvent::LockSteal,
            None,
            Some(self.current.clone()),
            details_from([("purpose", json!(purpose))]),
        )?;
        Ok(record)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
