//! Payload tree hashing.
//!
//! The payload root hash is a deterministic SHA-256 over a canonical
//! enumeration of a snapshot tree:
//!
//! 1. Walk the tree and collect every entry's path relative to the root,
//!    then sort bytewise (components joined with `/`).
//! 2. For each entry emit one length-prefixed record:
//!    kind tag (`f` | `d` | `l`), path bytes, POSIX permission bits
//!    (low 12), a content hash (file bytes for `f`, link target string for
//!    `l`, the empty-input digest for `d`), and the byte size for `f`.
//! 3. SHA-256 the concatenation of all records.
//!
//! The `.READY` marker at the tree root is excluded. Modification times are
//! deliberately not part of the enumeration; hardlink identity is not
//! preserved by the engines and therefore not encoded here either.

use std::io::Read as _;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::cancel::Cancel;
use crate::error::Result;

/// 64 hex zeros — the `prev_hash` of the first audit record.
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Name of the marker file excluded from enumeration.
pub const READY_MARKER: &str = ".READY";

// ---------------------------------------------------------------------------
// Entry records
// ---------------------------------------------------------------------------

enum EntryKind {
    File { size: u64 },
    Dir,
    Symlink,
}

impl EntryKind {
    const fn tag(&self) -> u8 {
        match self {
            Self::File { .. } => b'f',
            Self::Dir => b'd',
            Self::Symlink => b'l',
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Compute the payload root hash of the tree under `root`.
///
/// Returns a 64-character lowercase hex digest. An empty tree hashes to
/// the SHA-256 of the empty byte string.
///
/// # Errors
/// Returns an error on I/O failure or when `cancel` fires mid-walk.
pub fn payload_root_hash(root: &Path, cancel: &Cancel) -> Result<String> {
    let mut rel_paths = Vec::new();
    collect(root, root, &mut rel_paths)?;
    rel_paths.sort_unstable();

    let mut hasher = Sha256::new();
    for rel in &rel_paths {
        cancel.check("payload hash")?;
        let abs = root.join(rel);
        let meta = std::fs::symlink_metadata(&abs)?;

        let (kind, content_hash) = if meta.is_symlink() {
            let target = std::fs::read_link(&abs)?;
            (
                EntryKind::Symlink,
                digest_bytes(target.as_os_str().as_encoded_bytes()),
            )
        } else if meta.is_dir() {
            (EntryKind::Dir, digest_bytes(b""))
        } else {
            (EntryKind::File { size: meta.len() }, digest_file(&abs)?)
        };

        append_record(&mut hasher, &kind, rel.as_bytes(), mode_bits(&meta), &content_hash);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// SHA-256 of an in-memory byte slice, as raw digest bytes.
fn digest_bytes(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// SHA-256 of a file's content, streamed.
fn digest_file(path: &Path) -> Result<[u8; 32]> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

/// One length-prefixed record per entry, fed straight into the tree hasher.
fn append_record(
    hasher: &mut Sha256,
    kind: &EntryKind,
    path: &[u8],
    mode: u32,
    content_hash: &[u8; 32],
) {
    hasher.update([kind.tag()]);
    #[allow(clippy::cast_possible_truncation)]
    hasher.update((path.len() as u32).to_le_bytes());
    hasher.update(path);
    hasher.update(mode.to_le_bytes());
    hasher.update(content_hash);
    if let EntryKind::File { size } = kind {
        hasher.update(size.to_le_bytes());
    }
}

/// Low 12 permission bits of an entry's mode.
#[cfg(unix)]
fn mode_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt as _;
    meta.mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_bits(meta: &std::fs::Metadata) -> u32 {
    if meta.is_dir() { 0o755 } else { 0o644 }
}

/// Collect relative paths of every entry under `dir`, skipping the ready
/// marker at the root.
fn collect(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if dir == root && entry.file_name() == READY_MARKER {
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let rel_str = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        out.push(rel_str);

        let meta = std::fs::symlink_metadata(&path)?;
        if meta.is_dir() && !meta.is_symlink() {
            collect(root, &path, out)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
