//! Snapshot support for accelerated aggregate loading.
//!
//! A snapshot captures an aggregate's serialized domain state together with
//! the versions at capture, keyed by `(aggregate_id, aggregate_type)`.
//! Loading through a
//! [`SnapshotRepository`](crate::repository::SnapshotRepository) restores the
//! snapshot and replays only the event tail after it.

use std::future::Future;

use thiserror::Error;

use crate::event::Version;

pub mod inmemory;

/// Opaque aggregate state at a particular version.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub id: String,
    pub aggregate_type: String,
    /// Per-aggregate version at capture.
    pub version: Version,
    /// Store-global position at capture.
    pub global_version: Version,
    /// Serialized domain state.
    pub state: Vec<u8>,
}

/// Errors from snapshot handling.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// No snapshot stored for the aggregate. Recoverable: loads fall back to
    /// full event replay.
    #[error("snapshot not found")]
    NotFound,
    /// A snapshot was requested for an aggregate with uncommitted events.
    #[error("aggregate holds unsaved events")]
    UnsavedEvents,
    /// The aggregate has no id yet.
    #[error("aggregate id is empty")]
    EmptyId,
    /// The aggregate state could not be encoded or decoded.
    #[error("snapshot serialization failed: {0}")]
    Serialization(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The underlying snapshot storage failed.
    #[error("snapshot store failure: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Key-addressed storage of opaque aggregate state.
pub trait SnapshotStore: Send + Sync {
    /// Load the snapshot for `(id, aggregate_type)`.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::NotFound`] when no snapshot exists.
    fn get<'a>(
        &'a self,
        id: &'a str,
        aggregate_type: &'a str,
    ) -> impl Future<Output = Result<Snapshot, SnapshotError>> + Send + 'a;

    /// Persist a snapshot, replacing any previous one for the same key.
    fn save(&self, snapshot: Snapshot) -> impl Future<Output = Result<(), SnapshotError>> + Send;
}
