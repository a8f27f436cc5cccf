//! Worktree lifecycle and the head / latest pointer machine.
//!
//! A worktree is a payload root (`main/` or `worktrees/<name>/`) plus its
//! config at `.jvs/worktrees/<name>/config.json`. Two pointers drive all
//! lineage semantics:
//!
//! - `latest` — the tip of the worktree's lineage, advanced on publish.
//! - `head` — what the live payload currently represents, advanced on
//!   publish and by in-place restore.
//!
//! **Attached** ⟺ `head == latest`; anything else is **detached**. A
//! detached worktree may still be snapshotted — the new snapshot becomes
//! the new `latest` with `parent = head`, branching the lineage.

use serde::{Deserialize, Serialize};

use crate::error::{JvsError, Result};
use crate::fsx;
use crate::layout::RepoLayout;
use crate::lock::LockManager;
use crate::model::types::{SnapshotId, WorktreeName, now_rfc3339_millis};

// ---------------------------------------------------------------------------
// IsolationMode
// ---------------------------------------------------------------------------

/// How a worktree may be shared. Only `exclusive` exists today; the field
/// is persisted so the vocabulary can grow without a format bump.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// One writer at a time, serialized by the lock manager.
    #[default]
    Exclusive,
}

// ---------------------------------------------------------------------------
// WorktreeConfig
// ---------------------------------------------------------------------------

/// Per-worktree persistent state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeConfig {
    /// The worktree's name.
    pub name: WorktreeName,
    /// Creation time (RFC3339).
    pub created_at: String,
    /// Sharing mode; always `exclusive` in this format version.
    #[serde(default)]
    pub isolation: IsolationMode,
    /// What the live payload represents.
    pub head_snapshot_id: Option<SnapshotId>,
    /// The tip of the lineage.
    pub latest_snapshot_id: Option<SnapshotId>,
}

impl WorktreeConfig {
    /// Whether the worktree sits at its lineage tip.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.head_snapshot_id == self.latest_snapshot_id
    }
}

// ---------------------------------------------------------------------------
// WorktreeManager
// ---------------------------------------------------------------------------

/// Creates, loads, mutates, and removes worktrees.
#[derive(Clone, Debug)]
pub struct WorktreeManager {
    layout: RepoLayout,
}

impl WorktreeManager {
    /// Create a manager over `layout`.
    #[must_use]
    pub const fn new(layout: RepoLayout) -> Self {
        Self { layout }
    }

    /// Create a blank worktree: empty payload root, both pointers empty.
    ///
    /// Used for `main` at repo init and for blank forks.
    ///
    /// # Errors
    /// Returns an error if the worktree already exists or on I/O failure.
    pub fn create(&self, name: &WorktreeName) -> Result<WorktreeConfig> {
        self.create_with_pointers(name, None)
    }

    /// Create a worktree whose pointers start at `source` (payload is the
    /// caller's concern — the restorer clones it before calling this).
    ///
    /// # Errors
    /// Returns an error if the worktree already exists or on I/O failure.
    pub fn create_with_pointers(
        &self,
        name: &WorktreeName,
        source: Option<SnapshotId>,
    ) -> Result<WorktreeConfig> {
        let config_path = self.layout.worktree_config_path(name);
        if config_path.exists() {
            return Err(JvsError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("worktree '{name}' already exists"),
            )));
        }
        std::fs::create_dir_all(self.layout.worktree_meta_dir(name))?;
        std::fs::create_dir_all(self.layout.payload_root(name))?;

        let config = WorktreeConfig {
            name: name.clone(),
            created_at: now_rfc3339_millis(),
            isolation: IsolationMode::Exclusive,
            head_snapshot_id: source.clone(),
            latest_snapshot_id: source,
        };
        self.store(&config)?;
        Ok(config)
    }

    /// Load a worktree's config.
    ///
    /// # Errors
    /// `WORKTREE_NOT_FOUND` if the config is missing.
    pub fn load(&self, name: &WorktreeName) -> Result<WorktreeConfig> {
        let path = self.layout.worktree_config_path(name);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(JvsError::WorktreeNotFound {
                    name: name.as_str().to_owned(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Durably persist a config.
    ///
    /// # Errors
    /// Returns an error on serialization or I/O failure.
    pub fn store(&self, config: &WorktreeConfig) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(config)?;
        fsx::atomic_write(
            &self.layout.worktree_config_path(&config.name),
            &bytes,
            fsx::DEFAULT_FILE_MODE,
        )
    }

    /// Advance pointers after a publish: `latest` always moves to `id`;
    /// `head` follows only when the worktree was attached, so detached
    /// work keeps pointing where the user is.
    ///
    /// # Errors
    /// Propagates load/store failures.
    pub fn advance(&self, name: &WorktreeName, id: &SnapshotId) -> Result<WorktreeConfig> {
        let mut config = self.load(name)?;
        let was_attached = config.is_attached();
        config.latest_snapshot_id = Some(id.clone());
        if was_attached {
            config.head_snapshot_id = Some(id.clone());
        }
        self.store(&config)?;
        Ok(config)
    }

    /// Point `head` at `id` (in-place restore). `latest` is untouched, so
    /// restoring to an older snapshot detaches the worktree.
    ///
    /// # Errors
    /// Propagates load/store failures.
    pub fn set_head(&self, name: &WorktreeName, id: &SnapshotId) -> Result<WorktreeConfig> {
        let mut config = self.load(name)?;
        config.head_snapshot_id = Some(id.clone());
        self.store(&config)?;
        Ok(config)
    }

    /// Remove a worktree: payload root and metadata both go.
    ///
    /// `main` is irremovable. The lock record must be absent or already
    /// expired-and-stolen; an active lock refuses the removal.
    ///
    /// # Errors
    /// `NAME_INVALID` for `main`, `LOCK_CONFLICT` while locked,
    /// `WORKTREE_NOT_FOUND` if missing.
    pub fn remove(&self, name: &WorktreeName, locks: &LockManager) -> Result<()> {
        if name.is_main() {
            return Err(JvsError::NameInvalid {
                name: name.as_str().to_owned(),
                reason: "the main worktree cannot be removed".to_owned(),
            });
        }
        let _ = self.load(name)?;
        self.refuse_while_locked(name, locks)?;

        let payload = self.layout.payload_root(name);
        if payload.exists() {
            std::fs::remove_dir_all(&payload)?;
        }
        std::fs::remove_dir_all(self.layout.worktree_meta_dir(name))?;
        Ok(())
    }

    /// Rename a worktree, moving both payload root and metadata.
    ///
    /// # Errors
    /// `LOCK_CONFLICT` while any active lock exists; `NAME_INVALID` for
    /// `main`; standard lookup errors otherwise.
    pub fn rename(
        &self,
        old: &WorktreeName,
        new: &WorktreeName,
        locks: &LockManager,
    ) -> Result<WorktreeConfig> {
        if old.is_main() {
            return Err(JvsError::NameInvalid {
                name: old.as_str().to_owned(),
                reason: "the main worktree cannot be renamed".to_owned(),
            });
        }
        let mut config = self.load(old)?;
        if self.layout.worktree_config_path(new).exists() {
            return Err(JvsError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("worktree '{new}' already exists"),
            )));
        }
        self.refuse_while_locked(old, locks)?;

        fsx::rename_and_sync(&self.layout.payload_root(old), &self.layout.payload_root(new))?;
        fsx::rename_and_sync(
            &self.layout.worktree_meta_dir(old),
            &self.layout.worktree_meta_dir(new),
        )?;
        config.name = new.clone();
        self.store(&config)?;
        Ok(config)
    }

    /// All worktree configs, sorted by name.
    ///
    /// # Errors
    /// Returns an error on I/O failure.
    pub fn list(&self) -> Result<Vec<WorktreeConfig>> {
        let mut out = Vec::new();
        for name in self.layout.list_worktrees()? {
            if let Ok(config) = self.load(&name) {
                out.push(config);
            }
        }
        Ok(out)
    }

    fn refuse_while_locked(&self, name: &WorktreeName, locks: &LockManager) -> Result<()> {
        if let Some(record) = locks.load(name)?
            && !record.is_expired(chrono::Utc::now(), 0)
        {
            return Err(JvsError::LockConflict {
                worktree: name.as_str().to_owned(),
                holder_expires_at: record.expires_at,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
