//! Event-store boundary.
//!
//! The store is the only persistent authority for ordering: it assigns
//! store-global positions at append and enforces per-aggregate version
//! uniqueness. Back-ends implement [`EventStore`]; the [`inmemory`] module
//! provides the reference implementation used by tests and examples.

use std::{future::Future, pin::Pin};

use futures_core::Stream;
use thiserror::Error;

use crate::event::{EventRecord, Version};

pub mod inmemory;

/// Single-pass stream of records read from a store.
///
/// End of stream is exhaustion; dropping the stream releases all back-end
/// resources, including on early termination.
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<EventRecord, StoreError>> + Send>>;

/// Errors surfaced by event-store back-ends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another writer appended to the same aggregate since the caller's last
    /// observed version; detected by the unique `(id, type, version)` index.
    #[error(
        "concurrent modification of {aggregate_type} {aggregate_id}: version {version} already exists"
    )]
    Concurrency {
        aggregate_id: String,
        aggregate_type: String,
        version: Version,
    },
    /// No events exist for the requested aggregate. Back-ends may return
    /// this instead of an empty stream; the load path treats both the same.
    #[error("no events found")]
    NotFound,
    /// The store has been closed.
    #[error("event store is closed")]
    Closed,
    /// A batch mixed aggregates or skipped versions. Caller bug.
    #[error("event batch is not a contiguous run of one aggregate's events")]
    InvalidBatch,
    /// Underlying I/O failure.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    /// The back-end failed to encode or decode a persisted row.
    #[error("storage serialization failure: {0}")]
    Serialization(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Append-only event persistence with global ordering.
///
/// Implementations must serialize conflicting writes for the same
/// `(aggregate_id, aggregate_type)`, either with a per-aggregate write lock
/// or by relying on a unique-index insert failure, and return
/// [`StoreError::Concurrency`] on collision.
pub trait EventStore: Send + Sync {
    /// Atomically append a batch of one aggregate's events.
    ///
    /// On success every record has been assigned a strictly increasing
    /// `global_version`, written back into the slice in order. On failure
    /// nothing from the batch is visible to [`get`](EventStore::get) or
    /// [`all`](EventStore::all).
    ///
    /// # Errors
    ///
    /// [`StoreError::Concurrency`] on a version collision,
    /// [`StoreError::InvalidBatch`] when the batch is not one aggregate's
    /// contiguous run, [`StoreError::Closed`] after `close`.
    fn save<'a>(
        &'a self,
        events: &'a mut [EventRecord],
    ) -> impl Future<Output = Result<(), StoreError>> + Send + 'a;

    /// Stream one aggregate's events with `version > after_version`, in
    /// ascending version order. Pass 0 to read from the beginning.
    fn get<'a>(
        &'a self,
        aggregate_id: &'a str,
        aggregate_type: &'a str,
        after_version: Version,
    ) -> impl Future<Output = Result<RecordStream, StoreError>> + Send + 'a;

    /// Stream up to `count` events with `global_version >= start`, in
    /// ascending global order.
    fn all(
        &self,
        start: Version,
        count: usize,
    ) -> impl Future<Output = Result<RecordStream, StoreError>> + Send + '_;

    /// Release the store. Later operations fail with [`StoreError::Closed`].
    fn close(&self);
}
