//! Native whole-tree CoW engine.
//!
//! Delegates the entire clone to the filesystem in one external call
//! (`cp -a --reflink=always`), which on a CoW filesystem clones the tree
//! without copying data blocks. Three checks gate the fast path, each with
//! its own degradation label on failure:
//!
//! 1. mechanism availability (`cp` present) — `not-available`
//! 2. source and destination parent on the same CoW filesystem —
//!    `not-on-cow`
//! 3. the native clone call itself — `clone-failed`
//!
//! Any gate failure falls back to the byte-wise [`CopyEngine`]; the clone
//! still succeeds, tagged `degraded`.

use std::path::Path;
use std::process::{Command, Stdio};

use crate::cancel::Cancel;
use crate::error::Result;
use crate::fsx;

use super::copy::CopyEngine;
use super::reflink::probe_file_reflink;
use super::{CloneOutcome, Degradation};

/// The whole-tree native CoW engine.
#[derive(Clone, Copy, Debug, Default)]
pub struct NativeEngine;

impl NativeEngine {
    /// Create a native engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Clone `src` into the not-yet-existing `dst`.
    ///
    /// # Errors
    /// Returns an error on I/O failure or cancellation. Gate failures fall
    /// back to the copy engine and are reported as degradations.
    pub fn clone_tree(&self, src: &Path, dst: &Path, cancel: &Cancel) -> Result<CloneOutcome> {
        cancel.check("engine clone")?;

        if !command_available("cp") {
            return fall_back(src, dst, cancel, Degradation::NotAvailable);
        }
        if !same_cow_filesystem(src, dst) {
            return fall_back(src, dst, cancel, Degradation::NotOnCow);
        }
        if !native_clone(src, dst) {
            return fall_back(src, dst, cancel, Degradation::CloneFailed);
        }

        fsx::fsync_tree(dst)?;
        Ok(CloneOutcome::clean())
    }
}

/// Fall back to the copy engine, tagging the outcome with `label`.
fn fall_back(
    src: &Path,
    dst: &Path,
    cancel: &Cancel,
    label: Degradation,
) -> Result<CloneOutcome> {
    // A failed native attempt may have left a partial destination behind.
    if dst.exists() {
        std::fs::remove_dir_all(dst)?;
    }
    let mut outcome = CopyEngine::new().clone_tree(src, dst, cancel)?;
    outcome.record(label);
    Ok(outcome)
}

/// `src` and `dst`'s parent share a device, and that device answers a
/// reflink probe.
fn same_cow_filesystem(src: &Path, dst: &Path) -> bool {
    let Some(dst_parent) = dst.parent() else {
        return false;
    };
    if device_of(src) != device_of(dst_parent) {
        return false;
    }
    probe_file_reflink(dst_parent)
}

#[cfg(unix)]
fn device_of(path: &Path) -> Option<u64> {
    use std::os::unix::fs::MetadataExt as _;
    std::fs::metadata(path).ok().map(|m| m.dev())
}

#[cfg(not(unix))]
fn device_of(_path: &Path) -> Option<u64> {
    None
}

/// One-shot whole-tree clone. `-a` preserves modes, times, and symlinks.
fn native_clone(src: &Path, dst: &Path) -> bool {
    Command::new("cp")
        .args(["-a", "--reflink=always"])
        .arg(src)
        .arg(dst)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn command_available(cmd: &str) -> bool {
    Command::new("sh")
        .args(["-c", &format!("command -v {cmd} >/dev/null 2>&1")])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

/// Whether a whole-directory native clone works in a scratch directory
/// under `inside`. Detection's first gate.
#[must_use]
pub fn probe_dir_clone(inside: &Path) -> bool {
    if !command_available("cp") {
        return false;
    }
    let Ok(dir) = tempfile::tempdir_in(inside) else {
        return false;
    };
    let src = dir.path().join("probe-src");
    let dst = dir.path().join("probe-dst");
    if std::fs::create_dir(&src).is_err()
        || std::fs::write(src.join("f"), b"native-probe").is_err()
    {
        return false;
    }
    native_clone(&src, &dst)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
