//! Core identifier and enum types.
//!
//! Foundation types used throughout jvs: snapshot identifiers, worktree and
//! ref names, engine identifiers, and descriptor integrity state. All string
//! newtypes validate on construction and round-trip through serde as plain
//! strings.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng as _;
use serde::{Deserialize, Serialize};

use crate::error::{JvsError, Result};

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Format a timestamp as RFC3339 with millisecond precision and a `Z` suffix.
#[must_use]
pub fn rfc3339_millis(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current UTC time in the crate's canonical wire format.
#[must_use]
pub fn now_rfc3339_millis() -> String {
    rfc3339_millis(Utc::now())
}

// ---------------------------------------------------------------------------
// SnapshotId
// ---------------------------------------------------------------------------

/// A validated snapshot identifier: `<ms>-<rand>`.
///
/// `<ms>` is the 13-digit zero-padded Unix millisecond at creation and
/// `<rand>` is 8 lowercase hex characters from a cryptographic RNG. The id
/// is opaque to consumers; lexicographic order approximates creation order
/// but is advisory only.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapshotId(String);

impl SnapshotId {
    const MS_LEN: usize = 13;
    const RAND_LEN: usize = 8;

    /// Generate a fresh id from the current wall clock and the thread RNG.
    #[must_use]
    pub fn generate() -> Self {
        let ms = Utc::now().timestamp_millis().max(0);
        let suffix: u32 = rand::rng().random();
        Self(format!("{ms:013}-{suffix:08x}"))
    }

    /// Parse and validate an id string.
    ///
    /// # Errors
    /// Returns `NAME_INVALID` if the string does not match `<13 digits>-<8 hex>`.
    pub fn new(s: &str) -> Result<Self> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    /// The full id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first 8 characters, used in human-facing prefixes.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..8]
    }

    /// The creation millisecond encoded in the id.
    #[must_use]
    pub fn timestamp_ms(&self) -> i64 {
        self.0[..Self::MS_LEN].parse().unwrap_or(0)
    }

    fn validate(s: &str) -> Result<()> {
        let invalid = |reason: String| JvsError::NameInvalid {
            name: s.to_owned(),
            reason,
        };
        if s.len() != Self::MS_LEN + 1 + Self::RAND_LEN {
            return Err(invalid(format!(
                "snapshot id must be {} characters, got {}",
                Self::MS_LEN + 1 + Self::RAND_LEN,
                s.len()
            )));
        }
        let (ms, rest) = s.split_at(Self::MS_LEN);
        if !ms.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("timestamp part must be 13 decimal digits".to_owned()));
        }
        let Some(rand_part) = rest.strip_prefix('-') else {
            return Err(invalid("expected '-' after the timestamp part".to_owned()));
        };
        if !rand_part
            .bytes()
            .all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        {
            return Err(invalid(
                "random part must be 8 lowercase hex characters".to_owned(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SnapshotId {
    type Err = JvsError;
    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for SnapshotId {
    type Error = JvsError;
    fn try_from(s: String) -> Result<Self> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<SnapshotId> for String {
    fn from(id: SnapshotId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// Name validation (worktrees and refs share the rule)
// ---------------------------------------------------------------------------

const NAME_MAX_LEN: usize = 64;

fn validate_name(s: &str, what: &str) -> Result<()> {
    let invalid = |reason: String| JvsError::NameInvalid {
        name: s.to_owned(),
        reason,
    };
    if s.is_empty() {
        return Err(invalid(format!("{what} must not be empty")));
    }
    if s.len() > NAME_MAX_LEN {
        return Err(invalid(format!(
            "{what} must be at most {NAME_MAX_LEN} characters, got {}",
            s.len()
        )));
    }
    if s.contains("..") {
        return Err(invalid(format!("{what} must not contain '..'")));
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(invalid(format!(
            "{what} may contain only letters, digits, '.', '_' and '-'"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// WorktreeName
// ---------------------------------------------------------------------------

/// A validated worktree name.
///
/// Restricted to `[A-Za-z0-9._-]`, no `..`, no path separators. The name
/// `main` exists from repo init and cannot be removed.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorktreeName(String);

impl WorktreeName {
    /// Create a validated worktree name.
    ///
    /// # Errors
    /// Returns `NAME_INVALID` if the name violates the charset rule.
    pub fn new(s: &str) -> Result<Self> {
        validate_name(s, "worktree name")?;
        Ok(Self(s.to_owned()))
    }

    /// The default worktree created at repo init.
    #[must_use]
    pub fn main() -> Self {
        Self("main".to_owned())
    }

    /// Whether this is the irremovable default worktree.
    #[must_use]
    pub fn is_main(&self) -> bool {
        self.0 == "main"
    }

    /// The name as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorktreeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for WorktreeName {
    type Err = JvsError;
    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for WorktreeName {
    type Error = JvsError;
    fn try_from(s: String) -> Result<Self> {
        validate_name(&s, "worktree name")?;
        Ok(Self(s))
    }
}

impl From<WorktreeName> for String {
    fn from(name: WorktreeName) -> Self {
        name.0
    }
}

// ---------------------------------------------------------------------------
// RefName
// ---------------------------------------------------------------------------

/// A validated ref name — same charset rule as worktree names.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RefName(String);

impl RefName {
    /// Create a validated ref name.
    ///
    /// # Errors
    /// Returns `NAME_INVALID` if the name violates the charset rule.
    pub fn new(s: &str) -> Result<Self> {
        validate_name(s, "ref name")?;
        Ok(Self(s.to_owned()))
    }

    /// The name as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RefName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RefName {
    type Err = JvsError;
    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for RefName {
    type Error = JvsError;
    fn try_from(s: String) -> Result<Self> {
        validate_name(&s, "ref name")?;
        Ok(Self(s))
    }
}

impl From<RefName> for String {
    fn from(name: RefName) -> Self {
        name.0
    }
}

// ---------------------------------------------------------------------------
// EngineKind
// ---------------------------------------------------------------------------

/// The clone mechanism a snapshot was materialized with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Whole-tree clone delegated to the filesystem's native CoW support.
    Native,
    /// Per-file reflink (logical copy) with byte-copy fallback.
    Reflink,
    /// Plain byte-wise copy — universal fallback.
    Copy,
}

impl EngineKind {
    /// Stable identifier stored in descriptors and audit records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Reflink => "reflink",
            Self::Copy => "copy",
        }
    }

    /// Parse an `ENGINE_OVERRIDE` value. Unrecognized values are ignored.
    #[must_use]
    pub fn from_override(value: &str) -> Option<Self> {
        match value {
            "native" => Some(Self::Native),
            "reflink" => Some(Self::Reflink),
            "copy" => Some(Self::Copy),
            _ => None,
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// IntegrityState
// ---------------------------------------------------------------------------

/// The verification status recorded in a descriptor.
///
/// Excluded (together with the checksum itself) from checksum coverage, so
/// the verifier can rewrite it without invalidating the descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityState {
    /// Payload hash confirmed against the descriptor.
    Verified,
    /// Verification failed; the payload or descriptor was altered.
    Tampered,
    /// Not yet checked.
    #[default]
    Unknown,
}

impl IntegrityState {
    /// Stable wire identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Tampered => "tampered",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for IntegrityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
