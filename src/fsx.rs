//! Durable filesystem primitives.
//!
//! Every write of control-plane state (descriptors, ready markers, intents,
//! refs, lock records, audit lines) goes through this module. The contract
//! for [`atomic_write`] is the classic temp-then-rename sequence:
//!
//! 1. create a sibling temporary file in the target's directory
//! 2. write the bytes and set the mode
//! 3. fsync the file and close it
//! 4. rename over the target
//! 5. fsync the parent directory
//!
//! A failure at any step removes the temporary file and leaves the target
//! unchanged.

use std::fs::File;
use std::io::Write as _;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{JvsError, Result};

/// Default mode for control-plane files.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

// ---------------------------------------------------------------------------
// atomic_write
// ---------------------------------------------------------------------------

/// Atomically replace (or create) `path` with `bytes`.
///
/// The write is durable when this function returns: the file content is
/// fsynced before the rename, and the parent directory is fsynced after.
///
/// # Errors
/// Returns an error if the parent directory does not exist, or on any
/// underlying I/O failure. The target is never left half-written.
pub fn atomic_write(path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        JvsError::Io(std::io::Error::other(format!(
            "no parent directory for {}",
            path.display()
        )))
    })?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    set_mode(tmp.as_file(), mode)?;
    tmp.as_file().sync_all()?;

    // Rename over the target. NamedTempFile removes itself if this fails.
    tmp.persist(path)
        .map_err(|e| JvsError::Io(e.error))?;

    fsync_dir(parent)
}

#[cfg(unix)]
fn set_mode(file: &File, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt as _;
    file.set_permissions(std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
fn set_mode(_file: &File, _mode: u32) -> Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// rename_and_sync
// ---------------------------------------------------------------------------

/// Rename `old` to `new`, then fsync the parent of `new`.
///
/// # Errors
/// Returns an error if the rename or the directory fsync fails.
pub fn rename_and_sync(old: &Path, new: &Path) -> Result<()> {
    std::fs::rename(old, new)?;
    if let Some(parent) = new.parent() {
        fsync_dir(parent)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// fsync_dir / fsync_tree
// ---------------------------------------------------------------------------

/// Open `path` as a directory and fsync its handle.
///
/// # Errors
/// Returns an error if the directory cannot be opened or synced.
pub fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

/// Recursively fsync every regular file under `root`, then every directory.
///
/// Symlinks are skipped: the link itself has no independent data to sync,
/// and following it could leave the tree.
///
/// # Errors
/// Returns an error on any underlying I/O failure.
pub fn fsync_tree(root: &Path) -> Result<()> {
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let meta = std::fs::symlink_metadata(&path)?;
        if meta.is_symlink() {
            continue;
        }
        if meta.is_dir() {
            fsync_tree(&path)?;
        } else {
            File::open(&path)?.sync_all()?;
        }
    }
    fsync_dir(root)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
