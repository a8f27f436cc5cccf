//! Per-worktree lease locks with fencing.
//!
//! Locks are exclusive and lease-based: a record at
//! `.jvs/worktrees/<name>/lock.json` names a holder nonce, a session id,
//! and an expiry. Holders renew before expiry; anyone may steal once a
//! record is past expiry by at least the clock-skew tolerance. The lock
//! file is only ever replaced through atomic rename, so concurrent
//! stealers resolve to whichever rename lands last.
//!
//! The fencing token is a per-worktree monotonic counter, persisted
//! separately so it survives release. It increases on every acquire and
//! steal; a long operation revalidates its token before committing, which
//! turns "my lock was stolen mid-flight" into a detectable error instead
//! of a silent overwrite.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{JvsError, Result};
use crate::fsx;
use crate::layout::RepoLayout;
use crate::model::types::{WorktreeName, rfc3339_millis};

// ---------------------------------------------------------------------------
// LockPolicy
// ---------------------------------------------------------------------------

/// Lease timing knobs.
#[derive(Clone, Copy, Debug)]
pub struct LockPolicy {
    /// Lease length granted by acquire and renew.
    pub ttl_ms: i64,
    /// How far past expiry a lock must be before it is stealable. Also the
    /// slack applied when judging another holder's record, so a
    /// slightly-skewed clock never steals a healthy lease.
    pub clock_skew_ms: i64,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            clock_skew_ms: 2_000,
        }
    }
}

// ---------------------------------------------------------------------------
// LockRecord
// ---------------------------------------------------------------------------

/// The on-disk lease record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// The worktree this lease covers.
    pub worktree_name: WorktreeName,
    /// Random per-acquire nonce; renew and release must present it.
    pub holder_nonce: String,
    /// Random per-acquire session id, mirrored into `.session`.
    pub session_id: String,
    /// When the lease was granted (RFC3339).
    pub acquired_at: String,
    /// When the lease lapses (RFC3339).
    pub expires_at: String,
    /// The fencing generation this lease belongs to.
    pub fencing_token: u64,
    /// What the holder is doing, for operators reading the file.
    pub purpose: String,
}

impl LockRecord {
    /// Whether the lease has lapsed at `now`, with `slack_ms` of grace.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, slack_ms: i64) -> bool {
        parse_ts(&self.expires_at)
            .is_none_or(|exp| now >= exp + Duration::milliseconds(slack_ms))
    }
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn fresh_token() -> String {
    format!("{:016x}", rand::Rng::random::<u64>(&mut rand::rng()))
}

// ---------------------------------------------------------------------------
// LockManager
// ---------------------------------------------------------------------------

/// Serializes mutating operations per worktree.
#[derive(Clone, Debug)]
pub struct LockManager {
    layout: RepoLayout,
    policy: LockPolicy,
}

impl LockManager {
    /// Create a manager over `layout` with the given policy.
    #[must_use]
    pub const fn new(layout: RepoLayout, policy: LockPolicy) -> Self {
        Self { layout, policy }
    }

    /// The policy this manager enforces.
    #[must_use]
    pub const fn policy(&self) -> LockPolicy {
        self.policy
    }

    /// Acquire the lock for `name`.
    ///
    /// # Errors
    /// Returns `LOCK_CONFLICT` while a valid, unexpired record exists.
    pub fn acquire(&self, name: &WorktreeName, purpose: &str) -> Result<LockRecord> {
        self.acquire_at(name, purpose, Utc::now())
    }

    fn acquire_at(
        &self,
        name: &WorktreeName,
        purpose: &str,
        now: DateTime<Utc>,
    ) -> Result<LockRecord> {
        if let Some(existing) = self.load(name)?
            && !existing.is_expired(now, self.policy.clock_skew_ms)
        {
            return Err(JvsError::LockConflict {
                worktree: name.as_str().to_owned(),
                holder_expires_at: existing.expires_at,
            });
        }
        self.grant(name, purpose, now)
    }

    /// Extend the caller's lease.
    ///
    /// # Errors
    /// `LOCK_NOT_HELD` on nonce mismatch or a missing record;
    /// `LOCK_EXPIRED` when renewal is attempted past expiry.
    pub fn renew(&self, name: &WorktreeName, nonce: &str) -> Result<LockRecord> {
        self.renew_at(name, nonce, Utc::now())
    }

    fn renew_at(
        &self,
        name: &WorktreeName,
        nonce: &str,
        now: DateTime<Utc>,
    ) -> Result<LockRecord> {
        let Some(mut record) = self.load(name)? else {
            return Err(JvsError::LockNotHeld {
                worktree: name.as_str().to_owned(),
            });
        };
        if record.holder_nonce != nonce {
            return Err(JvsError::LockNotHeld {
                worktree: name.as_str().to_owned(),
            });
        }
        if record.is_expired(now, 0) {
            return Err(JvsError::LockExpired {
                worktree: name.as_str().to_owned(),
            });
        }
        record.expires_at = rfc3339_millis(now + Duration::milliseconds(self.policy.ttl_ms));
        self.store(name, &record)?;
        Ok(record)
    }

    /// Release the caller's lease and remove the session file.
    ///
    /// # Errors
    /// `LOCK_NOT_HELD` on nonce mismatch or a missing record.
    pub fn release(&self, name: &WorktreeName, nonce: &str) -> Result<()> {
        let Some(record) = self.load(name)? else {
            return Err(JvsError::LockNotHeld {
                worktree: name.as_str().to_owned(),
            });
        };
        if record.holder_nonce != nonce {
            return Err(JvsError::LockNotHeld {
                worktree: name.as_str().to_owned(),
            });
        }
        std::fs::remove_file(self.layout.lock_path(name))?;
        let session = self.layout.session_path(name);
        if session.exists() {
            std::fs::remove_file(session)?;
        }
        Ok(())
    }

    /// Take over an expired lease.
    ///
    /// # Errors
    /// `LOCK_CONFLICT` while the record is within expiry plus the skew
    /// tolerance.
    pub fn steal(&self, name: &WorktreeName, purpose: &str) -> Result<LockRecord> {
        self.steal_at(name, purpose, Utc::now())
    }

    fn steal_at(
        &self,
        name: &WorktreeName,
        purpose: &str,
        now: DateTime<Utc>,
    ) -> Result<LockRecord> {
        if let Some(existing) = self.load(name)?
            && !existing.is_expired(now, self.policy.clock_skew_ms)
        {
            return Err(JvsError::LockConflict {
                worktree: name.as_str().to_owned(),
                holder_expires_at: existing.expires_at,
            });
        }
        self.grant(name, purpose, now)
    }

    /// Check an external token against the current lock generation.
    ///
    /// # Errors
    /// `LOCK_NOT_HELD` when no lock exists; `FENCING_MISMATCH` when the
    /// presented token is not the current one.
    pub fn validate_fencing(&self, name: &WorktreeName, token: u64) -> Result<()> {
        let Some(record) = self.load(name)? else {
            return Err(JvsError::LockNotHeld {
                worktree: name.as_str().to_owned(),
            });
        };
        if record.fencing_token != token {
            return Err(JvsError::FencingMismatch {
                worktree: name.as_str().to_owned(),
                presented: token,
                current: record.fencing_token,
            });
        }
        Ok(())
    }

    /// The current lease record, if any.
    ///
    /// # Errors
    /// Returns an error on I/O failure. A malformed record reads as absent;
    /// the doctor reports it instead.
    pub fn load(&self, name: &WorktreeName) -> Result<Option<LockRecord>> {
        let path = self.layout.lock_path(name);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes).ok())
    }

    /// The persisted fencing counter (0 before the first acquire).
    ///
    /// # Errors
    /// Returns an error on I/O failure.
    pub fn fencing_token(&self, name: &WorktreeName) -> Result<u64> {
        let path = self.layout.fencing_path(name);
        match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(raw.trim().parse().unwrap_or(0)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Mint a new lease: bump the fencing counter, then atomically replace
    /// the record and session file.
    fn grant(&self, name: &WorktreeName, purpose: &str, now: DateTime<Utc>) -> Result<LockRecord> {
        std::fs::create_dir_all(self.layout.worktree_meta_dir(name))?;

        let token = self.fencing_token(name)? + 1;
        fsx::atomic_write(
            &self.layout.fencing_path(name),
            token.to_string().as_bytes(),
            fsx::DEFAULT_FILE_MODE,
        )?;

        let record = LockRecord {
            worktree_name: name.clone(),
            holder_nonce: fresh_token(),
            session_id: fresh_token(),
            acquired_at: rfc3339_millis(now),
            expires_at: rfc3339_millis(now + Duration::milliseconds(self.policy.ttl_ms)),
            fencing_token: token,
            purpose: purpose.to_owned(),
        };
        self.store(name, &record)?;
        fsx::atomic_write(
            &self.layout.session_path(name),
            format!("{}\n", record.session_id).as_bytes(),
            fsx::DEFAULT_FILE_MODE,
        )?;
        Ok(record)
    }

    fn store(&self, name: &WorktreeName, record: &LockRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        fsx::atomic_write(&self.layout.lock_path(name), &bytes, fsx::DEFAULT_FILE_MODE)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(dir: &std::path::Path) -> LockManager {
        let layout = RepoLayout::init(dir).unwrap();
        LockManager::new(layout, LockPolicy::default())
    }

    fn t0() -> DateTime<Utc> {
        parse_ts("2026-02-19T12:00:00.000Z").unwrap()
    }

    fn later(ms: i64) -> DateTime<Utc> {
        t0() + Duration::milliseconds(ms)
    }

    #[test]
    fn acquire_grants_and_writes_session() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let name = WorktreeName::main();
        let record = mgr.acquire_at(&name, "snapshot", t0()).unwrap();
        assert_eq!(record.fencing_token, 1);
        assert_eq!(record.holder_nonce.len(), 16);
        let session = std::fs::read_to_string(mgr.layout.session_path(&name)).unwrap();
        assert_eq!(session.trim(), record.session_id);
    }

    #[test]
    fn second_acquire_conflicts_while_healthy() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let name = WorktreeName::main();
        mgr.acquire_at(&name, "a", t0()).unwrap();
        let err = mgr.acquire_at(&name, "b", later(1_000)).unwrap_err();
        assert_eq!(err.code(), "LOCK_CONFLICT");
    }

    #[test]
    fn renew_extends_the_lease() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let name = WorktreeName::main();
        let record = mgr.acquire_at(&name, "a", t0()).unwrap();
        let renewed = mgr
            .renew_at(&name, &record.holder_nonce, later(10_000))
            .unwrap();
        assert!(parse_ts(&renewed.expires_at).unwrap() > parse_ts(&record.expires_at).unwrap());
        assert_eq!(renewed.fencing_token, record.fencing_token);
    }

    #[test]
    fn renew_with_wrong_nonce_is_not_held() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let name = WorktreeName::main();
        mgr.acquire_at(&name, "a", t0()).unwrap();
        let err = mgr.renew_at(&name, "0000000000000000", later(1)).unwrap_err();
        assert_eq!(err.code(), "LOCK_NOT_HELD");
    }

    #[test]
    fn renew_past_expiry_is_expired() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let name = WorktreeName::main();
        let record = mgr.acquire_at(&name, "a", t0()).unwrap();
        let err = mgr
            .renew_at(&name, &record.holder_nonce, later(31_000))
            .unwrap_err();
        assert_eq!(err.code(), "LOCK_EXPIRED");
    }

    #[test]
    fn release_requires_matching_nonce() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let name = WorktreeName::main();
        let record = mgr.acquire_at(&name, "a", t0()).unwrap();
        assert_eq!(
            mgr.release(&name, "ffffffffffffffff").unwrap_err().code(),
            "LOCK_NOT_HELD"
        );
        mgr.release(&name, &record.holder_nonce).unwrap();
        assert!(mgr.load(&name).unwrap().is_none());
        assert!(!mgr.layout.session_path(&name).exists());
    }

    #[test]
    fn steal_refused_within_skew_window() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let name = WorktreeName::main();
        mgr.acquire_at(&name, "a", t0()).unwrap();
        // Expired at +30s, but skew is 2s: +31s is still inside the window.
        let err = mgr.steal_at(&name, "b", later(31_000)).unwrap_err();
        assert_eq!(err.code(), "LOCK_CONFLICT");
    }

    #[test]
    fn steal_succeeds_past_expiry_plus_skew_and_bumps_fencing() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let name = WorktreeName::main();
        let first = mgr.acquire_at(&name, "a", t0()).unwrap();
        let stolen = mgr.steal_at(&name, "b", later(33_000)).unwrap();
        assert_eq!(stolen.fencing_token, first.fencing_token + 1);
        assert_ne!(stolen.holder_nonce, first.holder_nonce);

        // The original holder can no longer renew.
        let err = mgr
            .renew_at(&name, &first.holder_nonce, later(34_000))
            .unwrap_err();
        assert!(matches!(err.code(), "LOCK_NOT_HELD" | "LOCK_EXPIRED"));
    }

    #[test]
    fn fencing_is_monotonic_across_acquires() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let name = WorktreeName::main();
        let a = mgr.acquire_at(&name, "a", t0()).unwrap();
        mgr.release(&name, &a.holder_nonce).unwrap();
        let b = mgr.acquire_at(&name, "b", later(1_000)).unwrap();
        assert!(b.fencing_token > a.fencing_token);
    }

    #[test]
    fn validate_fencing_detects_steal() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let name = WorktreeName::main();
        let first = mgr.acquire_at(&name, "restore", t0()).unwrap();
        mgr.validate_fencing(&name, first.fencing_token).unwrap();

        mgr.steal_at(&name, "other", later(40_000)).unwrap();
        let err = mgr
            .validate_fencing(&name, first.fencing_token)
            .unwrap_err();
        assert_eq!(err.code(), "FENCING_MISMATCH");
    }

    #[test]
    fn validate_fencing_without_lock_is_not_held() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        let err = mgr
            .validate_fencing(&WorktreeName::main(), 1)
            .unwrap_err();
        assert_eq!(err.code(), "LOCK_NOT_HELD");
    }

    #[test]
    fn locks_are_independent_per_worktree() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.acquire_at(&WorktreeName::main(), "a", t0()).unwrap();
        let other = WorktreeName::new("exp").unwrap();
        mgr.acquire_at(&other, "b", t0()).unwrap();
    }
}
