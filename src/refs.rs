//! Named refs — durable pointers that protect snapshots from GC.
//!
//! A ref is a small JSON record at `.jvs/refs/<name>.json` naming one
//! snapshot. The GC planner treats every ref target as a root of the keep
//! set, so tagging a snapshot with a ref is the way to pin it outside its
//! lineage.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{JvsError, Result};
use crate::fsx;
use crate::layout::RepoLayout;
use crate::model::types::{RefName, SnapshotId, now_rfc3339_millis};

// ---------------------------------------------------------------------------
// RefRecord
// ---------------------------------------------------------------------------

/// One named ref.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefRecord {
    /// The ref's name.
    pub name: RefName,
    /// The snapshot this ref protects.
    pub snapshot_id: SnapshotId,
    /// When the ref was created (RFC3339).
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Create a ref pointing at `snapshot_id`.
///
/// Refuses to overwrite an existing ref unless `force` is set — silently
/// moving a protection pointer is how snapshots get collected by surprise.
///
/// # Errors
/// `SNAPSHOT_NOT_FOUND` if the target has no descriptor; an
/// `AlreadyExists` I/O error when the ref exists and `force` is off.
pub fn create(
    layout: &RepoLayout,
    name: &RefName,
    snapshot_id: &SnapshotId,
    force: bool,
) -> Result<RefRecord> {
    if !layout.descriptor_path(snapshot_id).exists() {
        return Err(JvsError::SnapshotNotFound {
            query: snapshot_id.as_str().to_owned(),
        });
    }
    let path = layout.ref_path(name);
    if path.exists() && !force {
        return Err(JvsError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            format!("ref '{name}' already exists (use force to move it)"),
        )));
    }

    let record = RefRecord {
        name: name.clone(),
        snapshot_id: snapshot_id.clone(),
        created_at: now_rfc3339_millis(),
    };
    let bytes = serde_json::to_vec_pretty(&record)?;
    fsx::atomic_write(&path, &bytes, fsx::DEFAULT_FILE_MODE)?;
    Ok(record)
}

/// Delete a ref.
///
/// # Errors
/// `SNAPSHOT_NOT_FOUND` is never returned here; a missing ref is an
/// `NotFound` I/O error.
pub fn delete(layout: &RepoLayout, name: &RefName) -> Result<()> {
    std::fs::remove_file(layout.ref_path(name))?;
    Ok(())
}

/// Read one ref record.
///
/// # Errors
/// Returns an error if the file is missing or unparseable.
pub fn read(layout: &RepoLayout, name: &RefName) -> Result<RefRecord> {
    read_path(&layout.ref_path(name))
}

fn read_path(path: &Path) -> Result<RefRecord> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// All refs as a name → target map (the GC protection set).
///
/// # Errors
/// Returns an error on I/O failure. Unparseable records are skipped;
/// the doctor reports them.
pub fn list(layout: &RepoLayout) -> Result<BTreeMap<RefName, SnapshotId>> {
    let mut out = BTreeMap::new();
    for name in layout.list_refs()? {
        if let Ok(record) = read(layout, &name) {
            out.insert(record.name, record.snapshot_id);
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
