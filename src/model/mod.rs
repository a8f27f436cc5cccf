//! Data model: identifiers, descriptors, and publish-protocol records.

pub mod descriptor;
pub mod marker;
pub mod types;

pub use descriptor::Descriptor;
pub use marker::{Intent, ReadyMarker};
pub use types::{EngineKind, IntegrityState, RefName, SnapshotId, WorktreeName};
