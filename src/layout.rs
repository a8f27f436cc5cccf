//! Repository layout and open/init checks.
//!
//! A repository is a directory holding the control plane under `.jvs/` and
//! one payload root per worktree:
//!
//! ```text
//! <root>/
//! ├── .jvs/
//! │   ├── repo_id                      ← opaque string
//! │   ├── format_version               ← decimal integer, currently 1
//! │   ├── snapshots/<id>/              ← payload tree + .READY at its root
//! │   ├── descriptors/<id>.json
//! │   ├── worktrees/<name>/config.json
//! │   ├── worktrees/<name>/.session    ← present while locked
//! │   ├── intents/<id>.json
//! │   ├── refs/<name>.json
//! │   ├── audit/audit.jsonl
//! │   └── gc/{plans,tombstones}/
//! ├── main/                            ← default worktree payload
//! └── worktrees/<name>/                ← forked worktree payloads
//! ```
//!
//! Payload roots hold only user data; no control-plane artifact is ever
//! placed there.

use std::path::{Path, PathBuf};

use rand::Rng as _;

use crate::error::{JvsError, Result};
use crate::fsx;
use crate::model::types::{RefName, SnapshotId, WorktreeName};

/// The highest on-disk format version this build can open.
pub const FORMAT_VERSION: u32 = 1;

/// Name of the control-plane directory under the repo root.
pub const CONTROL_DIR: &str = ".jvs";

// ---------------------------------------------------------------------------
// RepoLayout
// ---------------------------------------------------------------------------

/// Resolved paths for one repository.
///
/// Pure path arithmetic plus the init/open scalar checks — no other I/O.
#[derive(Clone, Debug)]
pub struct RepoLayout {
    root: PathBuf,
}

impl RepoLayout {
    /// Wrap a repository root. Performs no validation; see [`Self::open`].
    #[must_use]
    pub const fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// The repository root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `.jvs/` under the root.
    #[must_use]
    pub fn control_dir(&self) -> PathBuf {
        self.root.join(CONTROL_DIR)
    }

    /// `.jvs/repo_id`.
    #[must_use]
    pub fn repo_id_path(&self) -> PathBuf {
        self.control_dir().join("repo_id")
    }

    /// `.jvs/format_version`.
    #[must_use]
    pub fn format_version_path(&self) -> PathBuf {
        self.control_dir().join("format_version")
    }

    /// `.jvs/snapshots/`.
    #[must_use]
    pub fn snapshots_dir(&self) -> PathBuf {
        self.control_dir().join("snapshots")
    }

    /// `.jvs/snapshots/<id>/`.
    #[must_use]
    pub fn snapshot_dir(&self, id: &SnapshotId) -> PathBuf {
        self.snapshots_dir().join(id.as_str())
    }

    /// `.jvs/descriptors/`.
    #[must_use]
    pub fn descriptors_dir(&self) -> PathBuf {
        self.control_dir().join("descriptors")
    }

    /// `.jvs/descriptors/<id>.json`.
    #[must_use]
    pub fn descriptor_path(&self, id: &SnapshotId) -> PathBuf {
        self.descriptors_dir().join(format!("{id}.json"))
    }

    /// `.jvs/worktrees/`.
    #[must_use]
    pub fn worktrees_meta_dir(&self) -> PathBuf {
        self.control_dir().join("worktrees")
    }

    /// `.jvs/worktrees/<name>/`.
    #[must_use]
    pub fn worktree_meta_dir(&self, name: &WorktreeName) -> PathBuf {
        self.worktrees_meta_dir().join(name.as_str())
    }

    /// `.jvs/worktrees/<name>/config.json`.
    #[must_use]
    pub fn worktree_config_path(&self, name: &WorktreeName) -> PathBuf {
        self.worktree_meta_dir(name).join("config.json")
    }

    /// `.jvs/worktrees/<name>/lock.json` — the lease record.
    #[must_use]
    pub fn lock_path(&self, name: &WorktreeName) -> PathBuf {
        self.worktree_meta_dir(name).join("lock.json")
    }

    /// `.jvs/worktrees/<name>/.session` — present while locked.
    #[must_use]
    pub fn session_path(&self, name: &WorktreeName) -> PathBuf {
        self.worktree_meta_dir(name).join(".session")
    }

    /// `.jvs/worktrees/<name>/fencing` — persisted fencing counter.
    #[must_use]
    pub fn fencing_path(&self, name: &WorktreeName) -> PathBuf {
        self.worktree_meta_dir(name).join("fencing")
    }

    /// `.jvs/intents/`.
    #[must_use]
    pub fn intents_dir(&self) -> PathBuf {
        self.control_dir().join("intents")
    }

    /// `.jvs/intents/<id>.json`.
    #[must_use]
    pub fn intent_path(&self, id: &SnapshotId) -> PathBuf {
        self.intents_dir().join(format!("{id}.json"))
    }

    /// `.jvs/refs/`.
    #[must_use]
    pub fn refs_dir(&self) -> PathBuf {
        self.control_dir().join("refs")
    }

    /// `.jvs/refs/<name>.json`.
    #[must_use]
    pub fn ref_path(&self, name: &RefName) -> PathBuf {
        self.refs_dir().join(format!("{name}.json"))
    }

    /// `.jvs/audit/audit.jsonl`.
    #[must_use]
    pub fn audit_path(&self) -> PathBuf {
        self.control_dir().join("audit").join("audit.jsonl")
    }

    /// `.jvs/gc/plans/`.
    #[must_use]
    pub fn gc_plans_dir(&self) -> PathBuf {
        self.control_dir().join("gc").join("plans")
    }

    /// `.jvs/gc/plans/<plan-id>.json`.
    #[must_use]
    pub fn gc_plan_path(&self, plan_id: &str) -> PathBuf {
        self.gc_plans_dir().join(format!("{plan_id}.json"))
    }

    /// `.jvs/gc/tombstones/`.
    #[must_use]
    pub fn tombstones_dir(&self) -> PathBuf {
        self.control_dir().join("gc").join("tombstones")
    }

    /// `.jvs/gc/tombstones/<id>.json`.
    #[must_use]
    pub fn tombstone_path(&self, id: &SnapshotId) -> PathBuf {
        self.tombstones_dir().join(format!("{id}.json"))
    }

    /// The payload root for a worktree: `main/` for the default worktree,
    /// `worktrees/<name>/` for forks.
    #[must_use]
    pub fn payload_root(&self, name: &WorktreeName) -> PathBuf {
        if name.is_main() {
            self.root.join("main")
        } else {
            self.root.join("worktrees").join(name.as_str())
        }
    }

    // -----------------------------------------------------------------------
    // init / open
    // -----------------------------------------------------------------------

    /// Initialize a fresh repository at `root`.
    ///
    /// Creates the control-plane directory tree, the `main/` payload root,
    /// and the repo-level scalars. Idempotence is the caller's concern;
    /// an already-initialized root is refused.
    ///
    /// # Errors
    /// Returns an error if the root is already a repository or on I/O failure.
    pub fn init(root: &Path) -> Result<Self> {
        let layout = Self::new(root.to_path_buf());
        if layout.control_dir().exists() {
            return Err(JvsError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} is already a jvs repository", root.display()),
            )));
        }

        for dir in [
            layout.snapshots_dir(),
            layout.descriptors_dir(),
            layout.worktrees_meta_dir(),
            layout.intents_dir(),
            layout.refs_dir(),
            layout.control_dir().join("audit"),
            layout.gc_plans_dir(),
            layout.tombstones_dir(),
            layout.payload_root(&WorktreeName::main()),
            root.join("worktrees"),
        ] {
            std::fs::create_dir_all(&dir)?;
        }

        let repo_id = format!("{:032x}", rand::rng().random::<u128>());
        fsx::atomic_write(
            &layout.repo_id_path(),
            repo_id.as_bytes(),
            fsx::DEFAULT_FILE_MODE,
        )?;
        fsx::atomic_write(
            &layout.format_version_path(),
            FORMAT_VERSION.to_string().as_bytes(),
            fsx::DEFAULT_FILE_MODE,
        )?;
        fsx::fsync_dir(&layout.control_dir())?;
        Ok(layout)
    }

    /// Open an existing repository, checking the format version.
    ///
    /// # Errors
    /// Returns `FORMAT_UNSUPPORTED` if the on-disk version is newer than
    /// this build, or an I/O error if the root is not a repository.
    pub fn open(root: &Path) -> Result<Self> {
        let layout = Self::new(root.to_path_buf());
        let raw = std::fs::read_to_string(layout.format_version_path())?;
        let found: u32 = raw.trim().parse().map_err(|_| {
            JvsError::Io(std::io::Error::other(format!(
                "unparseable format_version: {raw:?}"
            )))
        })?;
        if found > FORMAT_VERSION {
            return Err(JvsError::FormatUnsupported {
                found,
                supported: FORMAT_VERSION,
            });
        }
        Ok(layout)
    }

    /// Read the opaque repository id.
    ///
    /// # Errors
    /// Returns an error if the scalar cannot be read.
    pub fn repo_id(&self) -> Result<String> {
        Ok(std::fs::read_to_string(self.repo_id_path())?
            .trim()
            .to_owned())
    }

    // -----------------------------------------------------------------------
    // Directory scans
    // -----------------------------------------------------------------------

    /// Ids of all directories under `snapshots/`, valid or not-yet-ready.
    ///
    /// # Errors
    /// Returns an error on I/O failure.
    pub fn list_snapshot_dirs(&self) -> Result<Vec<SnapshotId>> {
        Self::scan_ids(&self.snapshots_dir(), None)
    }

    /// Ids of all descriptor files.
    ///
    /// # Errors
    /// Returns an error on I/O failure.
    pub fn list_descriptors(&self) -> Result<Vec<SnapshotId>> {
        Self::scan_ids(&self.descriptors_dir(), Some(".json"))
    }

    /// Ids of all intent records.
    ///
    /// # Errors
    /// Returns an error on I/O failure.
    pub fn list_intents(&self) -> Result<Vec<SnapshotId>> {
        Self::scan_ids(&self.intents_dir(), Some(".json"))
    }

    /// Names of all worktrees with a metadata directory.
    ///
    /// # Errors
    /// Returns an error on I/O failure.
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeName>> {
        let dir = self.worktrees_meta_dir();
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if let Ok(parsed) = WorktreeName::new(&name) {
                out.push(parsed);
            }
        }
        out.sort();
        Ok(out)
    }

    /// Names of all refs.
    ///
    /// # Errors
    /// Returns an error on I/O failure.
    pub fn list_refs(&self) -> Result<Vec<RefName>> {
        let dir = self.refs_dir();
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if let Some(stem) = name.strip_suffix(".json")
                && let Ok(parsed) = RefName::new(stem)
            {
                out.push(parsed);
            }
        }
        out.sort();
        Ok(out)
    }

    fn scan_ids(dir: &Path, strip: Option<&str>) -> Result<Vec<SnapshotId>> {
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let stem = match strip {
                Some(suffix) => match name.strip_suffix(suffix) {
                    Some(s) => s,
                    None => continue,
                },
                None => name.as_str(),
            };
            if let Ok(id) = SnapshotId::new(stem) {
                out.push(id);
            }
        }
        out.sort();
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
