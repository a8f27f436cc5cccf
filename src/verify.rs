//! Integrity verification and the repository doctor.
//!
//! [`verify`] checks one snapshot: descriptor checksum always, payload
//! root hash on request. The only descriptor field it ever rewrites is
//! `integrity_state`.
//!
//! [`doctor`] sweeps the whole repository and reports findings by class.
//! Runtime debris (orphaned staging, orphaned intents, stale locks, head
//! orphans) can be repaired in the same pass when asked; integrity-class
//! findings are reported and never auto-repaired.

use std::fmt;

use chrono::Utc;

use crate::audit::AuditLog;
use crate::cancel::Cancel;
use crate::catalog;
use crate::error::{JvsError, Result};
use crate::hash::payload_root_hash;
use crate::layout::{FORMAT_VERSION, RepoLayout};
use crate::lock::LockManager;
use crate::model::types::{IntegrityState, SnapshotId};
use crate::model::{Descriptor, ReadyMarker};
use crate::worktree::WorktreeManager;

// ---------------------------------------------------------------------------
// verify
// ---------------------------------------------------------------------------

/// Verify one snapshot.
///
/// With `check_payload`, the payload tree is re-hashed and compared; a
/// successful check persists `integrity_state = verified`, a failed one
/// persists `tampered` before surfacing the error.
///
/// # Errors
/// `SNAPSHOT_NOT_FOUND`, `DESCRIPTOR_CORRUPT`, or
/// `PAYLOAD_HASH_MISMATCH`.
pub fn verify(
    layout: &RepoLayout,
    id: &SnapshotId,
    check_payload: bool,
    cancel: &Cancel,
) -> Result<IntegrityState> {
    let mut descriptor = catalog::load(layout, id)?;
    descriptor.verify_checksum()?;

    if !check_payload {
        return Ok(descriptor.integrity_state);
    }

    let actual = payload_root_hash(&layout.snapshot_dir(id), cancel)?;
    if actual == descriptor.payload_root_hash {
        descriptor.integrity_state = IntegrityState::Verified;
        descriptor.store(&layout.descriptor_path(id))?;
        Ok(IntegrityState::Verified)
    } else {
        descriptor.integrity_state = IntegrityState::Tampered;
        descriptor.store(&layout.descriptor_path(id))?;
        Err(JvsError::PayloadHashMismatch {
            snapshot_id: id.as_str().to_owned(),
            expected: descriptor.payload_root_hash,
            actual,
        })
    }
}

// ---------------------------------------------------------------------------
// Findings
// ---------------------------------------------------------------------------

/// The kind of problem a doctor sweep found.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FindingClass {
    /// Snapshot directory without a valid `.READY` or descriptor.
    OrphanStaging,
    /// Descriptor without a materialized snapshot behind it.
    OrphanDescriptor,
    /// Descriptor fails checksum verification or does not parse.
    DescriptorCorrupt,
    /// Leftover intent from a crashed or interrupted publish.
    OrphanIntent,
    /// Worktree `head` names a missing descriptor.
    HeadOrphan,
    /// A published, ready snapshot whose pointer advancement never ran.
    HeadBehindPublished,
    /// Worktree metadata exists but its payload root directory is gone.
    PayloadRootMissing,
    /// A `parent_id` walk revisited a snapshot.
    LineageCycle,
    /// The audit hash chain fails validation.
    AuditChainBroken,
    /// A lock record past expiry plus the skew tolerance.
    StaleLock,
    /// On-disk format version is newer than this build.
    FormatMismatch,
}

impl FindingClass {
    /// Whether this class is runtime debris the doctor may repair.
    #[must_use]
    pub const fn is_runtime_repairable(self) -> bool {
        matches!(
            self,
            Self::OrphanStaging
                | Self::OrphanIntent
                | Self::StaleLock
                | Self::HeadOrphan
                | Self::HeadBehindPublished
                | Self::PayloadRootMissing
        )
    }
}

impl fmt::Display for FindingClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OrphanStaging => "orphan-staging",
            Self::OrphanDescriptor => "orphan-descriptor",
            Self::DescriptorCorrupt => "descriptor-corrupt",
            Self::OrphanIntent => "orphan-intent",
            Self::HeadOrphan => "head-orphan",
            Self::HeadBehindPublished => "head-behind-published",
            Self::PayloadRootMissing => "payload-root-missing",
            Self::LineageCycle => "lineage-cycle",
            Self::AuditChainBroken => "audit-chain-broken",
            Self::StaleLock => "stale-lock",
            Self::FormatMismatch => "format-mismatch",
        };
        f.write_str(s)
    }
}

/// One doctor finding.
#[derive(Clone, Debug)]
pub struct Finding {
    /// What kind of problem this is.
    pub class: FindingClass,
    /// The snapshot involved, if any.
    pub snapshot_id: Option<String>,
    /// The worktree involved, if any.
    pub worktree: Option<String>,
    /// Human-readable specifics.
    pub detail: String,
    /// Whether a repair ran for this finding.
    pub repaired: bool,
}

/// The result of one doctor sweep.
#[derive(Clone, Debug, Default)]
pub struct DoctorReport {
    /// Everything found, in sweep order.
    pub findings: Vec<Finding>,
}

impl DoctorReport {
    /// Whether the sweep found nothing at all.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// Findings of one class.
    #[must_use]
    pub fn of_class(&self, class: FindingClass) -> Vec<&Finding> {
        self.findings.iter().filter(|f| f.class == class).collect()
    }
}

// ---------------------------------------------------------------------------
// doctor
// ---------------------------------------------------------------------------

/// Sweep the repository for inconsistencies.
///
/// `strict` tightens audit-chain validation (a torn tail becomes a
/// finding). `repair_runtime` executes the narrow, named fix for
/// runtime-repairable classes; everything else is only reported.
///
/// # Errors
/// Returns an error on I/O failure during the sweep itself. Findings are
/// never errors.
#[allow(clippy::too_many_lines)]
pub fn doctor(
    layout: &RepoLayout,
    locks: &LockManager,
    worktrees: &WorktreeManager,
    audit: &AuditLog,
    strict: bool,
    repair_runtime: bool,
) -> Result<DoctorReport> {
    let mut report = DoctorReport::default();

    // Format version.
    if let Ok(raw) = std::fs::read_to_string(layout.format_version_path())
        && let Ok(found) = raw.trim().parse::<u32>()
        && found > FORMAT_VERSION
    {
        report.findings.push(Finding {
            class: FindingClass::FormatMismatch,
            snapshot_id: None,
            worktree: None,
            detail: format!("format version {found} > supported {FORMAT_VERSION}"),
            repaired: false,
        });
    }

    // Staging ↔ descriptor pairing.
    let staged = layout.list_snapshot_dirs()?;
    let published = layout.list_descriptors()?;
    for id in &staged {
        let dir = layout.snapshot_dir(id);
        let ready = ReadyMarker::is_valid_for(&dir, id);
        let has_descriptor = published.contains(id);
        if ready && has_descriptor {
            continue;
        }
        let detail = if ready {
            "staged payload is ready but no descriptor was published".to_owned()
        } else {
            "staged payload has no valid ready marker".to_owned()
        };
        let mut repaired = false;
        if repair_runtime && !has_descriptor {
            std::fs::remove_dir_all(&dir)?;
            repaired = true;
        }
        report.findings.push(Finding {
            class: FindingClass::OrphanStaging,
            snapshot_id: Some(id.as_str().to_owned()),
            worktree: None,
            detail,
            repaired,
        });
    }
    let mut descriptors = Vec::new();
    for id in &published {
        let dir = layout.snapshot_dir(id);
        if !dir.exists() || !ReadyMarker::is_valid_for(&dir, id) {
            report.findings.push(Finding {
                class: FindingClass::OrphanDescriptor,
                snapshot_id: Some(id.as_str().to_owned()),
                worktree: None,
                detail: "descriptor exists but the payload is missing or incomplete".to_owned(),
                repaired: false,
            });
        }
        match Descriptor::load(&layout.descriptor_path(id), id.as_str()) {
            Ok(descriptor) => {
                if let Err(e) = descriptor.verify_checksum() {
                    report.findings.push(Finding {
                        class: FindingClass::DescriptorCorrupt,
                        snapshot_id: Some(id.as_str().to_owned()),
                        worktree: None,
                        detail: e.to_string(),
                        repaired: false,
                    });
                } else {
                    // Only checksum-valid descriptors may drive repairs.
                    descriptors.push(descriptor);
                }
            }
            Err(e) => report.findings.push(Finding {
                class: FindingClass::DescriptorCorrupt,
                snapshot_id: Some(id.as_str().to_owned()),
                worktree: None,
                detail: e.to_string(),
                repaired: false,
            }),
        }
    }

    // Intents.
    for id in layout.list_intents()? {
        let mut repaired = false;
        if repair_runtime {
            std::fs::remove_file(layout.intent_path(&id))?;
            repaired = true;
        }
        report.findings.push(Finding {
            class: FindingClass::OrphanIntent,
            snapshot_id: Some(id.as_str().to_owned()),
            worktree: None,
            detail: "intent left behind by an interrupted publish".to_owned(),
            repaired,
        });
    }

    // Worktree pointers and lineage cycles.
    for config in worktrees.list()? {
        if let Some(head) = &config.head_snapshot_id
            && !layout.descriptor_path(head).exists()
        {
            let mut repaired = false;
            if repair_runtime {
                let mut fixed = config.clone();
                let latest_ok = config
                    .latest_snapshot_id
                    .as_ref()
                    .is_some_and(|l| layout.descriptor_path(l).exists());
                fixed.head_snapshot_id = if latest_ok {
                    config.latest_snapshot_id.clone()
                } else {
                    None
                };
                worktrees.store(&fixed)?;
                repaired = true;
            }
            report.findings.push(Finding {
                class: FindingClass::HeadOrphan,
                snapshot_id: Some(head.as_str().to_owned()),
                worktree: Some(config.name.as_str().to_owned()),
                detail: "head names a missing descriptor".to_owned(),
                repaired,
            });
        }

        // A publish that crashed after its descriptor landed but before
        // pointer advancement: a ready, checksum-valid descriptor of this
        // worktree, child of the current head, newer than the current
        // latest. The repair finishes what the creator would have done.
        let behind = descriptors
            .iter()
            .filter(|d| {
                d.worktree_name == config.name
                    && d.parent_id == config.head_snapshot_id
                    && config
                        .latest_snapshot_id
                        .as_ref()
                        .is_none_or(|latest| d.snapshot_id > *latest)
                    && ReadyMarker::is_valid_for(
                        &layout.snapshot_dir(&d.snapshot_id),
                        &d.snapshot_id,
                    )
            })
            .max_by(|a, b| a.snapshot_id.cmp(&b.snapshot_id));
        if let Some(unadvanced) = behind {
            let mut repaired = false;
            if repair_runtime {
                worktrees.advance(&config.name, &unadvanced.snapshot_id)?;
                repaired = true;
            }
            report.findings.push(Finding {
                class: FindingClass::HeadBehindPublished,
                snapshot_id: Some(unadvanced.snapshot_id.as_str().to_owned()),
                worktree: Some(config.name.as_str().to_owned()),
                detail: "published snapshot was never advanced into the worktree pointers"
                    .to_owned(),
                repaired,
            });
        }

        // A payload root lost between the two renames of an in-place
        // restore swap. The previous tree is parked at the retired
        // sibling; renaming it back restores the pre-swap state.
        let payload = layout.payload_root(&config.name);
        if !payload.exists() {
            let retired = crate::restore::retired_payload_path(&payload);
            let mut repaired = false;
            if repair_runtime && retired.exists() {
                crate::fsx::rename_and_sync(&retired, &payload)?;
                let staging = crate::restore::staging_payload_path(&payload);
                if staging.exists() {
                    std::fs::remove_dir_all(&staging)?;
                }
                repaired = true;
            }
            report.findings.push(Finding {
                class: FindingClass::PayloadRootMissing,
                snapshot_id: None,
                worktree: Some(config.name.as_str().to_owned()),
                detail: "payload root directory is missing".to_owned(),
                repaired,
            });
        }

        let mut visited = std::collections::HashSet::new();
        let mut cursor = config.latest_snapshot_id.clone();
        while let Some(id) = cursor {
            if !visited.insert(id.clone()) {
                report.findings.push(Finding {
                    class: FindingClass::LineageCycle,
                    snapshot_id: Some(id.as_str().to_owned()),
                    worktree: Some(config.name.as_str().to_owned()),
                    detail: "parent chain revisits this snapshot".to_owned(),
                    repaired: false,
                });
                break;
            }
            cursor = Descriptor::load(&layout.descriptor_path(&id), id.as_str())
                .ok()
                .and_then(|d| d.parent_id);
        }
    }

    // Audit chain.
    if let Err(e) = audit.validate(strict) {
        report.findings.push(Finding {
            class: FindingClass::AuditChainBroken,
            snapshot_id: None,
            worktree: None,
            detail: e.to_string(),
            repaired: false,
        });
    }

    // Stale locks.
    let now = Utc::now();
    for name in layout.list_worktrees()? {
        let Some(record) = locks.load(&name)? else {
            continue;
        };
        if record.is_expired(now, locks.policy().clock_skew_ms) {
            let mut repaired = false;
            if repair_runtime {
                std::fs::remove_file(layout.lock_path(&name))?;
                let session = layout.session_path(&name);
                if session.exists() {
                    std::fs::remove_file(session)?;
                }
                repaired = true;
            }
            report.findings.push(Finding {
                class: FindingClass::StaleLock,
                snapshot_id: None,
                worktree: Some(name.as_str().to_owned()),
                detail: format!("lease expired at {}", record.expires_at),
                repaired,
            });
        }
    }

    Ok(report)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::lock::LockPolicy;
    use crate::model::types::{EngineKind, WorktreeName};
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

        fn snapshot(&self, note: &str) -> SnapshotId {
            std::fs::write(
                self.layout.payload_root(&WorktreeName::main()).join("f"),
                note.as_bytes(),
            )
            .unwrap();
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

        fn doctor(&self, repair: bool) -> DoctorReport {
            doctor(
                &self.layout,
                &self.locks,
                &self.worktrees,
                &self.audit,
                false,
                repair,
            )
            .unwrap()
        }
    }

    #[test]
    fn healthy_repo_is_clean() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        rig.snapshot("one");
        assert!(rig.doctor(false).is_clean());
    }

    #[test]
    fn verify_clean_snapshot_both_ways() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        let id = rig.snapshot("one");
        verify(&rig.layout, &id, false, &Cancel::new()).unwrap();
        let state = verify(&rig.layout, &id, true, &Cancel::new()).unwrap();
        assert_eq!(state, IntegrityState::Verified);
    }

    #[test]
    fn verify_detects_descriptor_tamper() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        let id = rig.snapshot("one");

        let path = rig.layout.descriptor_path(&id);
        let tampered = std::fs::read_to_string(&path)
            .unwrap()
            .replace("\"one\"", "\"two\"");
        std::fs::write(&path, tampered).unwrap();

        let err = verify(&rig.layout, &id, false, &Cancel::new()).unwrap_err();
        assert_eq!(err.code(), "DESCRIPTOR_CORRUPT");
    }

    #[test]
    fn verify_detects_payload_tamper_and_marks_tampered() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        let id = rig.snapshot("one");

        std::fs::write(rig.layout.snapshot_dir(&id).join("f"), b"mutated").unwrap();
        let err = verify(&rig.layout, &id, true, &Cancel::new()).unwrap_err();
        assert_eq!(err.code(), "PAYLOAD_HASH_MISMATCH");

        let descriptor =
            Descriptor::load(&rig.layout.descriptor_path(&id), id.as_str()).unwrap();
        assert_eq!(descriptor.integrity_state, IntegrityState::Tampered);
        // The rewrite itself kept the checksum valid.
        descriptor.verify_checksum().unwrap();
    }

    #[test]
    fn verify_unknown_snapshot_is_not_found() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        let ghost = SnapshotId::new("1700000000999-deadbeef").unwrap();
        let err = verify(&rig.layout, &ghost, false, &Cancel::new()).unwrap_err();
        assert_eq!(err.code(), "SNAPSHOT_NOT_FOUND");
    }

    #[test]
    fn doctor_finds_and_repairs_orphan_staging() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        let ghost = SnapshotId::new("1700000000999-deadbeef").unwrap();
        std::fs::create_dir_all(rig.layout.snapshot_dir(&ghost)).unwrap();

        let report = rig.doctor(false);
        assert_eq!(report.of_class(FindingClass::OrphanStaging).len(), 1);
        assert!(rig.layout.snapshot_dir(&ghost).exists());

        let report = rig.doctor(true);
        assert!(report.of_class(FindingClass::OrphanStaging)[0].repaired);
        assert!(!rig.layout.snapshot_dir(&ghost).exists());
    }

    #[test]
    fn doctor_finds_orphan_descriptor_without_repairing() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        let id = rig.snapshot("one");
        std::fs::remove_dir_all(rig.layout.snapshot_dir(&id)).unwrap();

        let report = rig.doctor(true);
        let findings = report.of_class(FindingClass::OrphanDescriptor);
        assert_eq!(findings.len(), 1);
        assert!(!findings[0].repaired);
        assert!(rig.layout.descriptor_path(&id).exists());
    }

    #[test]
    fn doctor_repairs_orphan_intent() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        let ghost = SnapshotId::new("1700000000999-deadbeef").unwrap();
        crate::model::Intent {
            snapshot_id: ghost.clone(),
            worktree_name: WorktreeName::main(),
            started_at: "2026-02-19T12:00:00.000Z".to_owned(),
            engine: EngineKind::Copy,
        }
        .store(&rig.layout.intent_path(&ghost))
        .unwrap();

        let report = rig.doctor(true);
        assert!(report.of_class(FindingClass::OrphanIntent)[0].repaired);
        assert!(rig.layout.list_intents().unwrap().is_empty());
    }

    #[test]
    fn doctor_repairs_head_orphan_to_latest() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        let id = rig.snapshot("one");
        let ghost = SnapshotId::new("1700000000999-deadbeef").unwrap();
        let mut config = rig.worktrees.load(&WorktreeName::main()).unwrap();
        config.head_snapshot_id = Some(ghost);
        rig.worktrees.store(&config).unwrap();

        let report = rig.doctor(true);
        assert!(report.of_class(FindingClass::HeadOrphan)[0].repaired);
        let fixed = rig.worktrees.load(&WorktreeName::main()).unwrap();
        assert_eq!(fixed.head_snapshot_id, Some(id));
    }

    #[test]
    fn doctor_advances_head_behind_published() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        let first = rig.snapshot("one");
        let second = rig.snapshot("two");

        // Rewind the pointers to the pre-publish position, exactly as a
        // crash between descriptor publish and advancement leaves them.
        let mut config = rig.worktrees.load(&WorktreeName::main()).unwrap();
        config.head_snapshot_id = Some(first.clone());
        config.latest_snapshot_id = Some(first);
        rig.worktrees.store(&config).unwrap();

        let report = rig.doctor(false);
        let findings = report.of_class(FindingClass::HeadBehindPublished);
        assert_eq!(findings.len(), 1);
        assert!(!findings[0].repaired);

        let report = rig.doctor(true);
        assert!(report.of_class(FindingClass::HeadBehindPublished)[0].repaired);
        let fixed = rig.worktrees.load(&WorktreeName::main()).unwrap();
        assert_eq!(fixed.head_snapshot_id, Some(second.clone()));
        assert_eq!(fixed.latest_snapshot_id, Some(second));

        // Idempotent: the repaired repo sweeps clean.
        assert!(
            rig.doctor(false)
                .of_class(FindingClass::HeadBehindPublished)
                .is_empty()
        );
    }

    #[test]
    fn doctor_advance_keeps_detached_head_in_place() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        let first = rig.snapshot("one");
        let second = rig.snapshot("two");

        // Detach to the first snapshot, publish a branch, then rewind
        // `latest` as a crash before advancement would leave it.
        rig.worktrees
            .set_head(&WorktreeName::main(), &first)
            .unwrap();
        let third = rig.snapshot("three");
        let mut config = rig.worktrees.load(&WorktreeName::main()).unwrap();
        config.latest_snapshot_id = Some(second);
        rig.worktrees.store(&config).unwrap();

        let report = rig.doctor(true);
        assert!(report.of_class(FindingClass::HeadBehindPublished)[0].repaired);
        let fixed = rig.worktrees.load(&WorktreeName::main()).unwrap();
        assert_eq!(fixed.head_snapshot_id, Some(first));
        assert_eq!(fixed.latest_snapshot_id, Some(third));
        assert!(!fixed.is_attached());
    }

    #[test]
    fn doctor_restores_missing_payload_root_from_retired_sibling() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        rig.snapshot("one");

        // Crash between the two swap renames: the payload sits at the
        // retired sibling and the staged clone is still around.
        let payload = rig.layout.payload_root(&WorktreeName::main());
        let retired = crate::restore::retired_payload_path(&payload);
        let staging = crate::restore::staging_payload_path(&payload);
        std::fs::rename(&payload, &retired).unwrap();
        std::fs::create_dir_all(&staging).unwrap();

        let report = rig.doctor(false);
        let findings = report.of_class(FindingClass::PayloadRootMissing);
        assert_eq!(findings.len(), 1);
        assert!(!findings[0].repaired);
        assert!(!payload.exists());

        let report = rig.doctor(true);
        assert!(report.of_class(FindingClass::PayloadRootMissing)[0].repaired);
        assert!(payload.join("f").exists());
        assert!(!retired.exists());
        assert!(!staging.exists());
    }

    #[test]
    fn missing_payload_without_retired_sibling_stays_unrepaired() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        rig.snapshot("one");
        let payload = rig.layout.payload_root(&WorktreeName::main());
        std::fs::remove_dir_all(&payload).unwrap();

        let report = rig.doctor(true);
        let findings = report.of_class(FindingClass::PayloadRootMissing);
        assert_eq!(findings.len(), 1);
        assert!(!findings[0].repaired);
    }

    #[test]
    fn doctor_reports_audit_break_without_repairing() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        rig.snapshot("one");
        rig.snapshot("two");

        let path = rig.layout.audit_path();
        let forged = std::fs::read_to_string(&path)
            .unwrap()
            .replace("one", "zzz");
        std::fs::write(&path, forged).unwrap();

        let report = rig.doctor(true);
        let findings = report.of_class(FindingClass::AuditChainBroken);
        assert_eq!(findings.len(), 1);
        assert!(!findings[0].repaired);
    }

    #[test]
    fn doctor_finds_format_mismatch() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        std::fs::write(rig.layout.format_version_path(), b"99").unwrap();
        let report = rig.doctor(true);
        let findings = report.of_class(FindingClass::FormatMismatch);
        assert_eq!(findings.len(), 1);
        assert!(!findings[0].repaired);
    }

    #[test]
    fn doctor_detects_lineage_cycle() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        let a = rig.snapshot("one");
        let b = rig.snapshot("two");

        // Corrupt: make the first snapshot's parent point at the second.
        let path = rig.layout.descriptor_path(&a);
        let mut d = Descriptor::load(&path, a.as_str()).unwrap();
        d.parent_id = Some(b);
        d.descriptor_checksum = d.compute_checksum().unwrap();
        d.store(&path).unwrap();

        let report = rig.doctor(false);
        assert_eq!(report.of_class(FindingClass::LineageCycle).len(), 1);
    }

    #[test]
    fn doctor_repairs_stale_lock() {
        let dir = tempdir().unwrap();
        let rig = Rig::new(dir.path());
        // A lease that lapsed long ago, as an abandoned holder would
        // leave it.
        let record = crate::lock::LockRecord {
            worktree_name: WorktreeName::main(),
            holder_nonce: "0123456789abcdef".to_owned(),
            session_id: "fedcba9876543210".to_owned(),
            acquired_at: "2020-01-01T00:00:00.000Z".to_owned(),
            expires_at: "2020-01-01T00:00:30.000Z".to_owned(),
            fencing_token: 7,
            purpose: "abandoned".to_owned(),
        };
        std::fs::write(
            rig.layout.lock_path(&WorktreeName::main()),
            serde_json::to_vec_pretty(&record).unwrap(),
        )
        .unwrap();

        let report = rig.doctor(false);
        assert_eq!(report.of_class(FindingClass::StaleLock).len(), 1);
        assert!(rig.locks.load(&WorktreeName::main()).unwrap().is_some());

        let report = rig.doctor(true);
        assert!(report.of_class(FindingClass::StaleLock)[0].repaired);
        assert!(rig.locks.load(&WorktreeName::main()).unwrap().is_none());
    }

    #[test]
    fn runtime_repairable_classification() {
        assert!(FindingClass::OrphanStaging.is_runtime_repairable());
        assert!(FindingClass::StaleLock.is_runtime_repairable());
        assert!(FindingClass::HeadBehindPublished.is_runtime_repairable());
        assert!(FindingClass::PayloadRootMissing.is_runtime_repairable());
        assert!(!FindingClass::OrphanDescriptor.is_runtime_repairable());
        assert!(!FindingClass::DescriptorCorrupt.is_runtime_repairable());
        assert!(!FindingClass::AuditChainBroken.is_runtime_repairable());
        assert!(!FindingClass::LineageCycle.is_runtime_repairable());
    }
}
