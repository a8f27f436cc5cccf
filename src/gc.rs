//! Two-phase garbage collection.
//!
//! **Plan** computes the keep set — every snapshot reachable from any
//! worktree's `latest` through `parent_id` links, every ref target, plus
//! whatever the retention knobs pin — and writes the ordered candidate
//! list to `gc/plans/<plan-id>.json` together with the protection set it
//! was computed under.
//!
//! **Run** reloads the plan, re-checks that the protection set still
//! matches the repository (refs unchanged, lineage tips unchanged), and
//! only then deletes: tombstone first, descriptor second, payload last via
//! rename-then-recursive-delete so the snapshot directory is always
//! visible-or-absent. Per-candidate failures land in the tombstone and
//! the run continues; re-running a partially failed plan is safe.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::{AuditEvent, AuditLog, details_from};
use crate::cancel::Cancel;
use crate::error::{JvsError, Result};
use crate::fsx;
use crate::layout::RepoLayout;
use crate::model::types::{RefName, SnapshotId, WorktreeName, now_rfc3339_millis};
use crate::refs;
use crate::worktree::WorktreeManager;

// ---------------------------------------------------------------------------
// Policy / plan / tombstone
// ---------------------------------------------------------------------------

/// Optional knobs that widen the keep set.
#[derive(Clone, Copy, Debug, Default)]
pub struct RetentionPolicy {
    /// Keep at least this many of each worktree's newest snapshots,
    /// reachable or not.
    pub min_keep_per_worktree: usize,
    /// Never collect snapshots younger than this.
    pub min_age_ms: i64,
}

/// A persisted GC plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcPlan {
    /// The plan's identity (also its filename stem).
    pub plan_id: String,
    /// When the plan was computed (RFC3339).
    pub created_at: String,
    /// Collectible snapshots, in id order.
    pub candidates: Vec<SnapshotId>,
    /// The ref set the keeps were computed under.
    pub protected_refs: BTreeMap<RefName, SnapshotId>,
    /// Each worktree's `latest` at plan time.
    pub lineage_tips: BTreeMap<WorktreeName, Option<SnapshotId>>,
}

/// The durable record of one snapshot's deletion (or attempted deletion).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    /// The snapshot that was collected.
    pub snapshot_id: SnapshotId,
    /// The plan the deletion belonged to.
    pub plan_id: String,
    /// When the deletion happened (RFC3339).
    pub deleted_at: String,
    /// The error, when the deletion failed partway.
    pub error: Option<String>,
}

/// Summary of one GC run.
#[derive(Clone, Debug, Default)]
pub struct GcReport {
    /// Candidates fully removed this run.
    pub removed: Vec<SnapshotId>,
    /// Candidates that failed, with the error text.
    pub failed: Vec<(SnapshotId, String)>,
    /// Candidates already gone (idempotent re-run).
    pub skipped: Vec<SnapshotId>,
}

// ---------------------------------------------------------------------------
// GarbageCollector
// ---------------------------------------------------------------------------

/// Plans and executes collection for one repository.
#[derive(Debug)]
pub struct GarbageCollector<'a> {
    layout: &'a RepoLayout,
    worktrees: &'a WorktreeManager,
    audit: &'a AuditLog,
}

impl<'a> GarbageCollector<'a> {
    /// Wire a collector over the repository's services.
    #[must_use]
    pub const fn new(
        layout: &'a RepoLayout,
        worktrees: &'a WorktreeManager,
        audit: &'a AuditLog,
    ) -> Self {
        Self {
            layout,
            worktrees,
            audit,
        }
    }

    /// Compute and persist a plan.
    ///
    /// # Errors
    /// Returns an error on I/O failure.
    pub fn plan(&self, retention: RetentionPolicy) -> Result<GcPlan> {
        let descriptors = crate::catalog::list(self.layout)?;
        let protected_refs = refs::list(self.layout)?;

        let mut keep: HashSet<SnapshotId> = HashSet::new();
        let mut lineage_tips = BTreeMap::new();

        // Lineage reachability from every worktree tip.
        let by_id: BTreeMap<&SnapshotId, &crate::model::Descriptor> =
            descriptors.iter().map(|d| (&d.snapshot_id, d)).collect();
        for config in self.worktrees.list()? {
            lineage_tips.insert(config.name.clone(), config.latest_snapshot_id.clone());
            let mut cursor = config.latest_snapshot_id.clone();
            let mut visited = HashSet::new();
            while let Some(id) = cursor {
                if !visited.insert(id.clone()) {
                    break;
                }
                keep.insert(id.clone());
                cursor = by_id.get(&id).and_then(|d| d.parent_id.clone());
            }
        }

        // Ref protection.
        for id in protected_refs.values() {
            keep.insert(id.clone());
        }

        // Retention knobs.
        if retention.min_keep_per_worktree > 0 {
            let mut per_worktree: BTreeMap<&WorktreeName, Vec<&SnapshotId>> = BTreeMap::new();
            for d in &descriptors {
                per_worktree
                    .entry(&d.worktree_name)
                    .or_default()
                    .push(&d.snapshot_id);
            }
            for ids in per_worktree.values_mut() {
                ids.sort();
                for id in ids.iter().rev().take(retention.min_keep_per_worktree) {
                    keep.insert((*id).clone());
                }
            }
        }
        if retention.min_age_ms > 0 {
            let cutoff = Utc::now().timestamp_millis() - retention.min_age_ms;
            for d in &descriptors {
                if d.snapshot_id.timestamp_ms() >= cutoff {
                    keep.insert(d.snapshot_id.clone());
                }
            }
        }

        let mut candidates: Vec<SnapshotId> = descriptors
            .iter()
            .map(|d| d.snapshot_id.clone())
            .filter(|id| !keep.contains(id))
            .collect();
        candidates.sort();

        let plan = GcPlan {
            plan_id: format!("plan-{}", SnapshotId::generate()),
            created_at: now_rfc3339_millis(),
            candidates,
            protected_refs,
            lineage_tips,
        };
        let bytes = serde_json::to_vec_pretty(&plan)?;
        fsx::atomic_write(
            &self.layout.gc_plan_path(&plan.plan_id),
            &bytes,
            fsx::DEFAULT_FILE_MODE,
        )?;

        self.audit.append(
            AuditEvent::GcPlan,
            None,
            None,
            details_from([
                ("plan_id", json!(plan.plan_id)),
                ("candidates", json!(plan.candidates.len())),
            ]),
        )?;
        tracing::info!(plan = %plan.plan_id, candidates = plan.candidates.len(), "gc plan written");
        Ok(plan)
    }

    /// Execute a previously written plan.
    ///
    /// # Errors
    /// `GC_PLAN_MISMATCH` when the plan is missing or its protection set
    /// no longer matches the repository. Per-candidate failures do not
    /// fail the run.
    pub fn run(&self, plan_id: &str, cancel: &Cancel) -> Result<GcReport> {
        let plan = self.load_plan(plan_id)?;
        self.check_still_valid(&plan)?;

        let mut report = GcReport::default();
        for id in &plan.candidates {
            cancel.check("gc run")?;
            let descriptor_path = self.layout.descriptor_path(id);
            let payload_dir = self.layout.snapshot_dir(id);
            if !descriptor_path.exists() && !payload_dir.exists() {
                report.skipped.push(id.clone());
                continue;
            }

            match self.collect_one(&plan, id) {
                Ok(()) => {
                    report.removed.push(id.clone());
                    self.audit.append(
                        AuditEvent::GcRun,
                        Some(id.clone()),
                        None,
                        details_from([("plan_id", json!(plan.plan_id))]),
                    )?;
                }
                Err(e) => {
                    let message = e.to_string();
                    self.write_tombstone(&plan, id, Some(message.clone()))?;
                    report.failed.push((id.clone(), message));
                }
            }
        }

        if report.failed.is_empty() {
            let plan_path = self.layout.gc_plan_path(plan_id);
            if plan_path.exists() {
                std::fs::remove_file(plan_path)?;
            }
        }
        tracing::info!(
            plan = %plan.plan_id,
            removed = report.removed.len(),
            failed = report.failed.len(),
            "gc run finished"
        );
        Ok(report)
    }

    /// Discard a plan without executing it.
    ///
    /// # Errors
    /// Returns an error if the plan file cannot be removed.
    pub fn discard(&self, plan_id: &str) -> Result<()> {
        validate_plan_id(plan_id)?;
        std::fs::remove_file(self.layout.gc_plan_path(plan_id))?;
        Ok(())
    }

    /// Remove tombstones older than `older_than_ms`. Retaining them
    /// forever is safe; pruning is an explicit operator action.
    ///
    /// # Errors
    /// Returns an error on I/O failure.
    pub fn prune_tombstones(&self, older_than_ms: i64) -> Result<usize> {
        let dir = self.layout.tombstones_dir();
        if !dir.exists() {
            return Ok(0);
        }
        let cutoff = Utc::now().timestamp_millis() - older_than_ms;
        let mut pruned = 0;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let Ok(raw) = std::fs::read(entry.path()) else {
                continue;
            };
            let Ok(tombstone) = serde_json::from_slice::<Tombstone>(&raw) else {
                continue;
            };
            if tombstone.snapshot_id.timestamp_ms() < cutoff {
                std::fs::remove_file(entry.path())?;
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn load_plan(&self, plan_id: &str) -> Result<GcPlan> {
        validate_plan_id(plan_id)?;
        let path = self.layout.gc_plan_path(plan_id);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JvsError::GcPlanMismatch {
                    plan_id: plan_id.to_owned(),
                    detail: "plan file does not exist (already run or discarded)".to_owned(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// The run-time staleness check: the exact protection set the plan was
    /// computed under must still hold.
    fn check_still_valid(&self, plan: &GcPlan) -> Result<()> {
        let current_refs = refs::list(self.layout)?;
        if current_refs != plan.protected_refs {
            return Err(JvsError::GcPlanMismatch {
                plan_id: plan.plan_id.clone(),
                detail: "ref set changed since the plan was written".to_owned(),
            });
        }

        let mut current_tips = BTreeMap::new();
        for config in self.worktrees.list()? {
            current_tips.insert(config.name.clone(), config.latest_snapshot_id.clone());
        }
        if current_tips != plan.lineage_tips {
            return Err(JvsError::GcPlanMismatch {
                plan_id: plan.plan_id.clone(),
                detail: "worktree lineage tips changed since the plan was written".to_owned(),
            });
        }
        Ok(())
    }

    fn collect_one(&self, plan: &GcPlan, id: &SnapshotId) -> Result<()> {
        self.write_tombstone(plan, id, None)?;

        let descriptor_path = self.layout.descriptor_path(id);
        if descriptor_path.exists() {
            std::fs::remove_file(&descriptor_path)?;
        }

        let payload_dir = self.layout.snapshot_dir(id);
        if payload_dir.exists() {
            // Rename out of the id namespace first: readers see the
            // directory whole or not at all, never half-deleted.
            let doomed = self
                .layout
                .snapshots_dir()
                .join(format!(".{id}.deleting"));
            if doomed.exists() {
                std::fs::remove_dir_all(&doomed)?;
            }
            fsx::rename_and_sync(&payload_dir, &doomed)?;
            std::fs::remove_dir_all(&doomed)?;
        }
        Ok(())
    }

    fn write_tombstone(
        &self,
        plan: &GcPlan,
        id: &SnapshotId,
        error: Option<String>,
    ) -> Result<()> {
        let tombstone = Tombstone {
            snapshot_id: id.clone(),
            plan_id: plan.plan_id.clone(),
            deleted_at: now_rfc3339_millis(),
            error,
        };
        let bytes = serde_json::to_vec_pretty(&tombstone)?;
        fsx::atomic_write(
            &self.layout.tombstone_path(id),
            &bytes,
            fsx::DEFAULT_FILE_MODE,
        )
    }
}

/// Plan ids become file names under the control plane; anything that
/// could traverse out of `gc/plans/` is refused outright.
fn validate_plan_id(plan_id: &str) -> Result<()> {
    if plan_id.is_empty()
        || plan_id.contains("..")
        || plan_id.contains(['/', '\\'])
    {
        return Err(JvsError::PathEscape {
            path: std::path::PathBuf::from(plan_id),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
