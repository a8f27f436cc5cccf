//! Clone engines and auto-detection.
//!
//! An engine materializes one directory tree as a copy of another. After a
//! successful [`Engine::clone_tree`], the destination's payload root hash
//! equals the source's at the moment the clone started, file content and
//! symlink targets are preserved, permission bits and second-resolution
//! modification times are preserved, and the whole tree is durable.
//!
//! Three variants exist, best first:
//!
//! 1. [`NativeEngine`] — delegates the whole tree to the filesystem's CoW
//!    clone in one call.
//! 2. [`ReflinkEngine`] — walks the tree and reflinks file by file.
//! 3. [`CopyEngine`] — byte-wise copy; works everywhere.
//!
//! Degradations are part of the return value, not an error channel:
//! callers annotate descriptors and audit records with them.

pub mod copy;
pub mod native;
pub mod reflink;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cancel::Cancel;
use crate::error::Result;
use crate::model::types::EngineKind;

pub use copy::CopyEngine;
pub use native::NativeEngine;
pub use reflink::ReflinkEngine;

/// Environment variable that short-circuits engine detection.
///
/// Recognized values are `native`, `reflink`, and `copy`; anything else is
/// ignored. The override is taken at face value without validation.
pub const ENGINE_OVERRIDE_ENV: &str = "ENGINE_OVERRIDE";

// ---------------------------------------------------------------------------
// Degradation
// ---------------------------------------------------------------------------

/// A way in which a clone fell short of the engine's ideal behaviour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Degradation {
    /// The native CoW mechanism is not present on this host.
    NotAvailable,
    /// Source and destination are not on the same CoW filesystem.
    NotOnCow,
    /// The native clone call itself failed.
    CloneFailed,
    /// At least one per-file reflink fell back to a byte copy.
    ReflinkFailed,
    /// Hardlinked entries were copied as independent files.
    Hardlink,
}

impl Degradation {
    /// Stable label recorded in audit details.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotAvailable => "not-available",
            Self::NotOnCow => "not-on-cow",
            Self::CloneFailed => "clone-failed",
            Self::ReflinkFailed => "reflink-failed",
            Self::Hardlink => "hardlink",
        }
    }
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// CloneOutcome
// ---------------------------------------------------------------------------

/// The result of a successful clone.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloneOutcome {
    /// Whether the clone deviated from the engine's ideal path.
    pub degraded: bool,
    /// Deduplicated labels describing each deviation.
    pub degradations: Vec<Degradation>,
}

impl CloneOutcome {
    /// An outcome with no deviations.
    #[must_use]
    pub const fn clean() -> Self {
        Self {
            degraded: false,
            degradations: Vec::new(),
        }
    }

    /// Record a degradation, keeping the set deduplicated.
    pub fn record(&mut self, degradation: Degradation) {
        self.degraded = true;
        if !self.degradations.contains(&degradation) {
            self.degradations.push(degradation);
        }
    }

    /// Fold another outcome into this one.
    pub fn merge(&mut self, other: Self) {
        for d in other.degradations {
            self.record(d);
        }
    }

    /// Labels as strings, for audit details.
    #[must_use]
    pub fn labels(&self) -> Vec<String> {
        self.degradations.iter().map(|d| d.to_string()).collect()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// A concrete engine selected at detection time.
///
/// An enum rather than `Box<dyn …>` keeps dispatch static and the error
/// type monomorphic.
#[derive(Clone, Debug)]
pub enum Engine {
    /// Whole-tree native CoW clone.
    Native(NativeEngine),
    /// Per-file reflink clone.
    Reflink(ReflinkEngine),
    /// Plain byte-wise copy.
    Copy(CopyEngine),
}

impl Engine {
    /// Construct the engine for a resolved kind.
    #[must_use]
    pub const fn from_kind(kind: EngineKind) -> Self {
        match kind {
            EngineKind::Native => Self::Native(NativeEngine::new()),
            EngineKind::Reflink => Self::Reflink(ReflinkEngine::new()),
            EngineKind::Copy => Self::Copy(CopyEngine::new()),
        }
    }

    /// The identifier recorded in descriptors.
    #[must_use]
    pub const fn kind(&self) -> EngineKind {
        match self {
            Self::Native(_) => EngineKind::Native,
            Self::Reflink(_) => EngineKind::Reflink,
            Self::Copy(_) => EngineKind::Copy,
        }
    }

    /// Clone the tree at `src` into the not-yet-existing `dst`.
    ///
    /// # Errors
    /// Returns an error on I/O failure or cancellation. Degradations are
    /// reported in the outcome, never as errors.
    pub fn clone_tree(&self, src: &Path, dst: &Path, cancel: &Cancel) -> Result<CloneOutcome> {
        match self {
            Self::Native(e) => e.clone_tree(src, dst, cancel),
            Self::Reflink(e) => e.clone_tree(src, dst, cancel),
            Self::Copy(e) => e.clone_tree(src, dst, cancel),
        }
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Pick the best engine for a repository.
///
/// `ENGINE_OVERRIDE` short-circuits detection without validation. Otherwise:
/// native when a whole-directory CoW clone works inside the repo, reflink
/// when a single-file reflink works, copy as the universal fallback.
///
/// Probes run in a temporary directory inside the repository root — the
/// system temp dir may live on a different filesystem and would lie.
#[must_use]
pub fn detect(repo_root: &Path) -> Engine {
    if let Ok(value) = std::env::var(ENGINE_OVERRIDE_ENV)
        && let Some(kind) = EngineKind::from_override(&value)
    {
        return Engine::from_kind(kind);
    }

    if native::probe_dir_clone(repo_root) {
        return Engine::from_kind(EngineKind::Native);
    }
    if reflink::probe_file_reflink(repo_root) {
        return Engine::from_kind(EngineKind::Reflink);
    }
    Engine::from_kind(EngineKind::Copy)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn outcome_records_are_deduplicated() {
        let mut outcome = CloneOutcome::clean();
        outcome.record(Degradation::ReflinkFailed);
        outcome.record(Degradation::ReflinkFailed);
        outcome.record(Degradation::Hardlink);
        assert!(outcome.degraded);
        assert_eq!(
            outcome.degradations,
            vec![Degradation::ReflinkFailed, Degradation::Hardlink]
        );
    }

    #[test]
    fn merge_folds_and_dedupes() {
        let mut a = CloneOutcome::clean();
        a.record(Degradation::Hardlink);
        let mut b = CloneOutcome::clean();
        b.record(Degradation::Hardlink);
        b.record(Degradation::CloneFailed);
        a.merge(b);
        assert_eq!(
            a.degradations,
            vec![Degradation::Hardlink, Degradation::CloneFailed]
        );
    }

    #[test]
    fn clean_outcome_is_not_degraded() {
        let outcome = CloneOutcome::clean();
        assert!(!outcome.degraded);
        assert!(outcome.labels().is_empty());
    }

    #[test]
    fn degradation_labels_are_kebab_case() {
        assert_eq!(Degradation::NotOnCow.as_str(), "not-on-cow");
        assert_eq!(
            serde_json::to_string(&Degradation::ReflinkFailed).unwrap(),
            "\"reflink-failed\""
        );
    }

    #[test]
    fn engine_kind_round_trip() {
        for kind in [EngineKind::Native, EngineKind::Reflink, EngineKind::Copy] {
            assert_eq!(Engine::from_kind(kind).kind(), kind);
        }
    }
}
