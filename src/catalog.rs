//! Snapshot catalog: listing, lineage history, and query resolution.
//!
//! Resolution takes a free-form query and tries match buckets from most to
//! least specific: exact id, id prefix, exact tag, tag prefix, exact note,
//! note prefix, note substring. The first non-empty bucket decides; a
//! bucket with more than one hit is ambiguous and surfaces its candidates
//! for the caller to disambiguate.

use std::collections::HashSet;

use crate::error::{JvsError, Result};
use crate::layout::RepoLayout;
use crate::model::Descriptor;
use crate::model::types::SnapshotId;
use crate::worktree::WorktreeConfig;

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// All parseable descriptors, sorted by snapshot id.
///
/// Unparseable descriptor files are skipped here; the doctor reports them.
///
/// # Errors
/// Returns an error on I/O failure.
pub fn list(layout: &RepoLayout) -> Result<Vec<Descriptor>> {
    let mut out = Vec::new();
    for id in layout.list_descriptors()? {
        if let Ok(descriptor) = Descriptor::load(&layout.descriptor_path(&id), id.as_str()) {
            out.push(descriptor);
        }
    }
    Ok(out)
}

/// Load one descriptor by id.
///
/// # Errors
/// `SNAPSHOT_NOT_FOUND` when no descriptor file exists for the id.
pub fn load(layout: &RepoLayout, id: &SnapshotId) -> Result<Descriptor> {
    let path = layout.descriptor_path(id);
    if !path.exists() {
        return Err(JvsError::SnapshotNotFound {
            query: id.as_str().to_owned(),
        });
    }
    Descriptor::load(&path, id.as_str())
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// The worktree's lineage, newest first, walking `latest` through
/// `parent_id` links. Bounded by a visited set so a corrupted cycle
/// terminates instead of spinning.
///
/// # Errors
/// Returns an error on I/O failure.
pub fn history(
    layout: &RepoLayout,
    config: &WorktreeConfig,
    limit: usize,
) -> Result<Vec<Descriptor>> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    let mut cursor = config.latest_snapshot_id.clone();

    while let Some(id) = cursor {
        if out.len() >= limit || !visited.insert(id.clone()) {
            break;
        }
        let Ok(descriptor) = load(layout, &id) else {
            break;
        };
        cursor = descriptor.parent_id.clone();
        out.push(descriptor);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Match buckets from most to least specific. The bucket index doubles as
/// the score surfaced to interactive consumers.
fn buckets(query: &str, d: &Descriptor) -> Option<usize> {
    let id = d.snapshot_id.as_str();
    if id == query {
        return Some(0);
    }
    if id.starts_with(query) {
        return Some(1);
    }
    if d.tags.iter().any(|t| t == query) {
        return Some(2);
    }
    if d.tags.iter().any(|t| t.starts_with(query)) {
        return Some(3);
    }
    if d.note == query {
        return Some(4);
    }
    if d.note.starts_with(query) {
        return Some(5);
    }
    if d.note.contains(query) {
        return Some(6);
    }
    None
}

/// Resolve a free-form query to exactly one descriptor.
///
/// # Errors
/// `SNAPSHOT_NOT_FOUND` when nothing matches; `AMBIGUOUS_QUERY` with the
/// candidate ids when the best bucket holds more than one snapshot.
pub fn resolve(layout: &RepoLayout, query: &str) -> Result<Descriptor> {
    let scored: Vec<(usize, Descriptor)> = list(layout)?
        .into_iter()
        .filter_map(|d| buckets(query, &d).map(|score| (score, d)))
        .collect();

    let Some(best) = scored.iter().map(|(score, _)| *score).min() else {
        return Err(JvsError::SnapshotNotFound {
            query: query.to_owned(),
        });
    };
    let mut matches: Vec<Descriptor> = scored
        .into_iter()
        .filter(|(score, _)| *score == best)
        .map(|(_, d)| d)
        .collect();

    if matches.len() == 1 {
        Ok(matches.remove(0))
    } else {
        Err(JvsError::AmbiguousQuery {
            query: query.to_owned(),
            candidates: matches
                .iter()
                .map(|d| d.snapshot_id.as_str().to_owned())
                .collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
