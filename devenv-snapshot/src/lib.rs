//! Snapshot storage for dev environment working volumes.
//!
//! - [`store`]: the [`ObjectStore`] capability plus filesystem and memory backends
//! - [`archive`]: deterministic tar.gz codec
//! - [`hydration`]: [`HydrationService`] moving trees between store and volume

pub mod archive;
pub mod hash_utils;
pub mod hydration;
pub mod store;

#[cfg(any(test, feature = "test-helpers"))]
pub mod faulty;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use hydration::{HydrationService, HydrationSource};
pub use store::{FsObjectStore, MemoryObjectStore, ObjectStore};

#[cfg(any(test, feature = "test-helpers"))]
pub use faulty::FaultyStore;

/// Immutable record of one verified snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub project_id: i64,
    pub key: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

pub fn snapshot_key(project_id: i64, content_hash: &str) -> String {
    format!("projects/{project_id}/snapshots/{content_hash}.tar.gz")
}

/// Mutable pointer to the newest verified snapshot of a project.
pub fn latest_key(project_id: i64) -> String {
    format!("projects/{project_id}/latest")
}
