//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;

use jvs::snapshot::SnapshotOptions;
use jvs::{Cancel, Client, Descriptor};

/// A throwaway repository with an open client.
pub struct TestRepo {
    pub dir: TempDir,
    pub client: Client,
}

impl TestRepo {
    /// Initialize a fresh repository in a temp directory.
    pub fn init() -> Result<Self> {
        let dir = TempDir::new().context("create temp dir")?;
        let client = Client::init(dir.path()).context("init repository")?;
        Ok(Self { dir, client })
    }

    /// The repository root.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Path inside the current worktree's payload.
    pub fn payload(&self, rel: &str) -> PathBuf {
        self.client.worktree_payload_path().join(rel)
    }

    /// Write a file into the current worktree's payload.
    pub fn write(&self, rel: &str, content: &[u8]) -> Result<()> {
        let path = self.payload(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content).with_context(|| format!("write {rel}"))
    }

    /// Read a file from the current worktree's payload.
    pub fn read(&self, rel: &str) -> Result<Vec<u8>> {
        std::fs::read(self.payload(rel)).with_context(|| format!("read {rel}"))
    }

    /// Snapshot the current worktree with a note.
    pub fn snapshot(&self, note: &str) -> Result<Descriptor> {
        Ok(self
            .client
            .snapshot(
                &SnapshotOptions {
                    note: note.to_owned(),
                    tags: vec![],
                },
                &Cancel::new(),
            )?
            .descriptor)
    }

    /// Snapshot with tags.
    pub fn snapshot_tagged(&self, note: &str, tags: &[&str]) -> Result<Descriptor> {
        Ok(self
            .client
            .snapshot(
                &SnapshotOptions {
                    note: note.to_owned(),
                    tags: tags.iter().map(|s| (*s).to_owned()).collect(),
                },
                &Cancel::new(),
            )?
            .descriptor)
    }

    /// Raw audit log lines.
    pub fn audit_lines(&self) -> Result<Vec<String>> {
        let path = self
            .root()
            .join(".jvs")
            .join("audit")
            .join("audit.jsonl");
        let raw = std::fs::read_to_string(path).context("read audit log")?;
        Ok(raw.lines().map(str::to_owned).collect())
    }
}
