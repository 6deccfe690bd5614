//! In-memory event store.
//!
//! Reference implementation of [`EventStore`] suitable for tests and
//! development. Events live in one global vector (which defines global
//! ordering) with a per-aggregate index for stream reads.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::event::{EventRecord, Version};

use super::{EventStore, RecordStream, StoreError};

#[derive(Default)]
struct Inner {
    /// All records in global order; `global_version = index + 1`.
    records: Vec<EventRecord>,
    /// Indices into `records` per `(aggregate_id, aggregate_type)`.
    streams: HashMap<(String, String), Vec<usize>>,
    closed: bool,
}

/// In-memory reference store. Cloning shares the underlying storage.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<RwLock<Inner>>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for Store {
    async fn save(&self, events: &mut [EventRecord]) -> Result<(), StoreError> {
        let mut inner = self.inner.write().expect("event store lock poisoned");
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let Some(first) = events.first() else {
            return Ok(());
        };

        let key = (first.aggregate_id.clone(), first.aggregate_type.clone());
        for (offset, event) in events.iter().enumerate() {
            if event.aggregate_id != key.0
                || event.aggregate_type != key.1
                || event.version != first.version + offset as Version
            {
                return Err(StoreError::InvalidBatch);
            }
        }

        // The stream's length is its current version: versions are gapless
        // from 1.
        let current = inner
            .streams
            .get(&key)
            .map(|indices| indices.len() as Version)
            .unwrap_or(0);
        if first.version != current + 1 {
            return Err(StoreError::Concurrency {
                aggregate_id: key.0,
                aggregate_type: key.1,
                version: first.version,
            });
        }

        for event in events.iter_mut() {
            event.global_version = inner.records.len() as Version + 1;
            let index = inner.records.len();
            inner.records.push(event.clone());
            inner.streams.entry(key.clone()).or_default().push(index);
        }
        tracing::trace!(
            aggregate_id = %key.0,
            aggregate_type = %key.1,
            count = events.len(),
            "events appended"
        );
        Ok(())
    }

    async fn get(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
        after_version: Version,
    ) -> Result<RecordStream, StoreError> {
        let inner = self.inner.read().expect("event store lock poisoned");
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let key = (aggregate_id.to_string(), aggregate_type.to_string());
        let records: Vec<Result<EventRecord, StoreError>> = inner
            .streams
            .get(&key)
            .into_iter()
            .flatten()
            .map(|&index| &inner.records[index])
            .filter(|record| record.version > after_version)
            .map(|record| Ok(record.clone()))
            .collect();
        Ok(Box::pin(tokio_stream::iter(records)))
    }

    async fn all(&self, start: Version, count: usize) -> Result<RecordStream, StoreError> {
        let inner = self.inner.read().expect("event store lock poisoned");
        if inner.closed {
            return Err(StoreError::Closed);
        }
        let records: Vec<Result<EventRecord, StoreError>> = inner
            .records
            .iter()
            .filter(|record| record.global_version >= start)
            .take(count)
            .map(|record| Ok(record.clone()))
            .collect();
        Ok(Box::pin(tokio_stream::iter(records)))
    }

    fn close(&self) {
        self.inner.write().expect("event store lock poisoned").closed = true;
    }
}
