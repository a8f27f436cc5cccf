//! jvs — a workspace snapshot engine.
//!
//! Captures, verifies, and restores full directory trees using filesystem
//! copy-on-write where available. Snapshots are materialized clones (no
//! pack files, no object graph); integrity comes from canonical-JSON
//! checksums, a payload root hash, and a hash-chained audit log.
//!
//! The embedding surface is [`client::Client`]; everything else is public
//! for tools that need the parts individually.

pub mod audit;
pub mod cancel;
pub mod canonical;
pub mod catalog;
pub mod client;
pub mod engine;
pub mod error;
pub mod fsx;
pub mod gc;
pub mod hash;
pub mod layout;
pub mod lock;
pub mod model;
pub mod refs;
pub mod restore;
pub mod snapshot;
pub mod telemetry;
pub mod verify;
pub mod worktree;

pub use cancel::Cancel;
pub use client::{Client, GcOptions, RestoreOptions, RestoreOutcome};
pub use error::{JvsError, Result};
pub use model::{Descriptor, EngineKind, IntegrityState, RefName, SnapshotId, WorktreeName};
pub use snapshot::{PublishResult, SnapshotOptions};
