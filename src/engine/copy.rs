//! Plain byte-wise copy engine — the universal fallback.
//!
//! Walks the source tree, recreates directories with their modes, copies
//! regular files byte for byte (preserving permission bits and
//! second-resolution modification times), and re-creates symlinks from
//! their target strings.
//!
//! Hardlink identity cannot be preserved without a second walk and
//! bookkeeping: when two entries share an inode, the content is copied to
//! every path and `hardlink` is recorded in the degradations.

use std::collections::HashSet;
use std::path::Path;

use crate::cancel::Cancel;
use crate::error::Result;
use crate::fsx;

use super::{CloneOutcome, Degradation};

/// The byte-wise copy engine.
#[derive(Clone, Copy, Debug, Default)]
pub struct CopyEngine;

impl CopyEngine {
    /// Create a copy engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Clone `src` into the not-yet-existing `dst` by byte-wise copy.
    ///
    /// # Errors
    /// Returns an error on I/O failure or cancellation.
    pub fn clone_tree(&self, src: &Path, dst: &Path, cancel: &Cancel) -> Result<CloneOutcome> {
        let mut outcome = CloneOutcome::clean();
        let mut seen_inodes = HashSet::new();

        std::fs::create_dir_all(dst)?;
        copy_entry_attrs(src, dst)?;
        copy_dir(src, dst, cancel, &mut seen_inodes, &mut outcome)?;

        fsx::fsync_tree(dst)?;
        Ok(outcome)
    }
}

fn copy_dir(
    src: &Path,
    dst: &Path,
    cancel: &Cancel,
    seen_inodes: &mut HashSet<u64>,
    outcome: &mut CloneOutcome,
) -> Result<()> {
    for entry in std::fs::read_dir(src)? {
        cancel.check("engine clone")?;
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let meta = std::fs::symlink_metadata(&src_path)?;

        if meta.is_symlink() {
            recreate_symlink(&src_path, &dst_path)?;
        } else if meta.is_dir() {
            std::fs::create_dir(&dst_path)?;
            copy_dir(&src_path, &dst_path, cancel, seen_inodes, outcome)?;
            copy_entry_attrs(&src_path, &dst_path)?;
        } else {
            if is_seen_hardlink(&meta, seen_inodes) {
                outcome.record(Degradation::Hardlink);
            }
            std::fs::copy(&src_path, &dst_path)?;
            copy_entry_attrs(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

/// Track file inodes; returns `true` when this inode was already copied.
#[cfg(unix)]
fn is_seen_hardlink(meta: &std::fs::Metadata, seen: &mut HashSet<u64>) -> bool {
    use std::os::unix::fs::MetadataExt as _;
    meta.nlink() > 1 && !seen.insert(meta.ino())
}

#[cfg(not(unix))]
fn is_seen_hardlink(_meta: &std::fs::Metadata, _seen: &mut HashSet<u64>) -> bool {
    false
}

/// Recreate a symlink from its target string.
#[cfg(unix)]
fn recreate_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = std::fs::read_link(src)?;
    std::os::unix::fs::symlink(target, dst)?;
    Ok(())
}

/// Best effort on non-Unix: copy the link target's content instead.
#[cfg(not(unix))]
fn recreate_symlink(src: &Path, dst: &Path) -> Result<()> {
    std::fs::copy(src, dst)?;
    Ok(())
}

/// Carry permission bits and the modification time over to `dst`.
///
/// Mtimes are preserved to one-second resolution; sub-second drift between
/// filesystems is expected and tolerated.
pub(super) fn copy_entry_attrs(src: &Path, dst: &Path) -> Result<()> {
    let meta = std::fs::metadata(src)?;
    std::fs::set_permissions(dst, meta.permissions())?;
    if meta.is_file()
        && let Ok(mtime) = meta.modified()
    {
        std::fs::File::options()
            .write(true)
            .open(dst)?
            .set_modified(mtime)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
