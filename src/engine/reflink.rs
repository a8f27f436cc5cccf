//! Per-file reflink engine.
//!
//! Walks the source tree like the copy engine, but asks the filesystem for
//! a logical copy of each regular file via `cp --reflink=always`. On Btrfs
//! and XFS the data blocks are shared until modified, making large-payload
//! clones nearly instant. A per-file reflink failure falls back to a byte
//! copy of that file only and tags the overall result with
//! `reflink-failed`; the clone still succeeds.

use std::path::Path;
use std::process::{Command, Stdio};

use crate::cancel::Cancel;
use crate::error::Result;
use crate::fsx;

use super::copy::copy_entry_attrs;
use super::{CloneOutcome, Degradation};

/// The per-file reflink engine.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReflinkEngine;

impl ReflinkEngine {
    /// Create a reflink engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Clone `src` into the not-yet-existing `dst`, reflinking file by file.
    ///
    /// # Errors
    /// Returns an error on I/O failure or cancellation.
    pub fn clone_tree(&self, src: &Path, dst: &Path, cancel: &Cancel) -> Result<CloneOutcome> {
        let mut outcome = CloneOutcome::clean();

        std::fs::create_dir_all(dst)?;
        copy_entry_attrs(src, dst)?;
        clone_dir(src, dst, cancel, &mut outcome)?;

        fsx::fsync_tree(dst)?;
        Ok(outcome)
    }
}

fn clone_dir(src: &Path, dst: &Path, cancel: &Cancel, outcome: &mut CloneOutcome) -> Result<()> {
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
            clone_dir(&src_path, &dst_path, cancel, outcome)?;
            copy_entry_attrs(&src_path, &dst_path)?;
        } else {
            if !reflink_file(&src_path, &dst_path) {
                outcome.record(Degradation::ReflinkFailed);
                std::fs::copy(&src_path, &dst_path)?;
            }
            copy_entry_attrs(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

/// Attempt a single-file reflink. Returns `false` on any failure.
fn reflink_file(src: &Path, dst: &Path) -> bool {
    Command::new("cp")
        .arg("--reflink=always")
        .arg(src)
        .arg(dst)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(unix)]
fn recreate_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = std::fs::read_link(src)?;
    std::os::unix::fs::symlink(target, dst)?;
    Ok(())
}

#[cfg(not(unix))]
fn recreate_symlink(src: &Path, dst: &Path) -> Result<()> {
    std::fs::copy(src, dst)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

/// Whether a single-file reflink succeeds in a scratch directory under
/// `inside` — used by detection, which must probe the repository's own
/// filesystem rather than the system temp dir.
#[must_use]
pub fn probe_file_reflink(inside: &Path) -> bool {
    let Ok(dir) = tempfile::tempdir_in(inside) else {
        return false;
    };
    let src = dir.path().join("probe-src");
    let dst = dir.path().join("probe-dst");
    if std::fs::write(&src, b"reflink-probe").is_err() {
        return false;
    }
    reflink_file(&src, &dst)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::hash::payload_root_hash;
    use tempfile::tempdir;

    #[test]
    fn clone_preserves_payload_hash_regardless_of_fallback() {
        let src = tempdir().unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub/big.bin"), vec![3_u8; 8192]).unwrap();
        std::fs::write(src.path().join("note.txt"), b"hello").unwrap();

        let work = tempdir().unwrap();
        let dst = work.path().join("clone");
        let outcome = ReflinkEngine::new()
            .clone_tree(src.path(), &dst, &Cancel::new())
            .unwrap();

        // On a non-CoW filesystem every file falls back; either way the
        // tree must be identical and the flag consistent with the labels.
        assert_eq!(outcome.degraded, !outcome.degradations.is_empty());
        for d in &outcome.degradations {
            assert_eq!(*d, Degradation::ReflinkFailed);
        }
        assert_eq!(
            payload_root_hash(src.path(), &Cancel::new()).unwrap(),
            payload_root_hash(&dst, &Cancel::new()).unwrap()
        );
    }

    #[test]
    fn fallback_label_is_recorded_once() {
        let src = tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(src.path().join(format!("f{i}.txt")), b"data").unwrap();
        }
        let work = tempdir().unwrap();
        let outcome = ReflinkEngine::new()
            .clone_tree(src.path(), &work.path().join("clone"), &Cancel::new())
            .unwrap();
        assert!(outcome.degradations.len() <= 1);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_survive() {
        let src = tempdir().unwrap();
        std::os::unix::fs::symlink("/etc/hosts", src.path().join("lnk")).unwrap();
        let work = tempdir().unwrap();
        let dst = work.path().join("clone");
        ReflinkEngine::new()
            .clone_tree(src.path(), &dst, &Cancel::new())
            .unwrap();
        assert_eq!(
            std::fs::read_link(dst.join("lnk")).unwrap(),
            std::path::PathBuf::from("/etc/hosts")
        );
    }

    #[test]
    fn probe_does_not_panic_or_litter() {
        let dir = tempdir().unwrap();
        let _ = probe_file_reflink(dir.path());
        // Whatever the filesystem said, the probe's scratch dir is gone.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
