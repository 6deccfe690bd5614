//! Repositories.
//!
//! [`EventRepository`] orchestrates the save/load protocol against an event
//! store: it encodes uncommitted events, lets the store assign global
//! positions, publishes the committed events on the live stream, and rebuilds
//! aggregates by streaming and folding their history.
//! [`SnapshotRepository`] layers snapshot capture and snapshot-then-tail
//! loading on top.

use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio_stream::StreamExt as _;

use crate::{
    aggregate::{Aggregate, apply_history_event},
    codec::{Codec, JsonCodec},
    event::{Event, EventRecord, Version},
    register::{DecodeError, Register, short_type_name},
    snapshot::{Snapshot, SnapshotError, SnapshotStore},
    store::{EventStore, StoreError},
    stream::{EventStream, Subscription},
};

/// Errors from saving an aggregate's uncommitted events.
#[derive(Debug, Error)]
pub enum SaveError {
    /// The store rejected the batch; [`StoreError::Concurrency`] signals a
    /// lost optimistic-concurrency race.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// An event could not be encoded with the repository codec.
    #[error("failed to encode event: {0}")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// Snapshot capture after the event save failed
    /// ([`SnapshotRepository::save`] only).
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// One failure while folding stored history into an aggregate.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// The stream failed mid-iteration.
    #[error(transparent)]
    Store(StoreError),
    /// An event's reason has no registered payload type.
    #[error("event not registered: aggregate type {aggregate_type}, reason {reason}")]
    NotRegistered {
        aggregate_type: String,
        reason: String,
    },
    /// Payload or metadata bytes failed to decode.
    #[error("failed to decode event: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The stored history is not a contiguous version chain.
    #[error(transparent)]
    History(crate::aggregate::AggregateError),
}

/// Errors from loading an aggregate.
#[derive(Debug, Error)]
pub enum GetError {
    /// Neither a snapshot nor any events exist for the id.
    #[error("aggregate not found")]
    NotFound,
    /// The store could not start the read.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Replay failed after applying `applied` events; the count lets tests
    /// reproduce partial failures.
    #[error("history replay failed after {applied} events: {source}")]
    Load {
        applied: usize,
        #[source]
        source: ReplayError,
    },
    /// The snapshot store failed with something other than a miss.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

fn replay_error<E>(error: DecodeError<E>) -> ReplayError
where
    E: std::error::Error + Send + Sync + 'static,
{
    match error {
        DecodeError::NotRegistered {
            aggregate_type,
            reason,
        } => ReplayError::NotRegistered {
            aggregate_type,
            reason,
        },
        DecodeError::Payload(e) | DecodeError::Metadata(e) => ReplayError::Decode(Box::new(e)),
    }
}

/// Orchestrates aggregate persistence against an event store.
///
/// ```ignore
/// let mut register = Register::new();
/// register.aggregate::<Person>();
///
/// let repo = EventRepository::new(inmemory::Store::new(), register, JsonCodec);
///
/// let mut person = Person::default();
/// repo.bind(&mut person)?;
/// person.create("kalle")?;
/// repo.save(&mut person).await?;
///
/// let mut twin = Person::default();
/// repo.get(person.id(), &mut twin).await?;
/// ```
pub struct EventRepository<S, C = JsonCodec>
where
    C: Codec,
{
    store: S,
    register: Arc<Register<C>>,
    codec: C,
    stream: EventStream,
}

impl<S, C> EventRepository<S, C>
where
    S: EventStore,
    C: Codec,
{
    pub fn new(store: S, register: Register<C>, codec: C) -> Self {
        Self {
            store,
            register: Arc::new(register),
            codec,
            stream: EventStream::new(),
        }
    }

    /// The shared type register, for wiring up projection handlers.
    #[must_use]
    pub fn register(&self) -> &Arc<Register<C>> {
        &self.register
    }

    /// The underlying event store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The repository codec.
    #[must_use]
    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Bind an aggregate instance to its registered type.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::Unregistered`](crate::aggregate::AggregateError::Unregistered)
    /// when the aggregate type was never registered.
    pub fn bind<A: Aggregate>(
        &self,
        aggregate: &mut A,
    ) -> Result<(), crate::aggregate::AggregateError> {
        self.register.bind(aggregate)
    }

    /// Persist an aggregate's uncommitted events.
    ///
    /// No-op when the buffer is empty, making repeated saves idempotent. On
    /// success the store-assigned global versions are copied back, the
    /// aggregate's committed versions advance, every event is published to
    /// the live stream in order, and the buffer is cleared. On failure the
    /// aggregate is left untouched so the caller can reload and retry.
    ///
    /// # Errors
    ///
    /// [`SaveError::Store`] with [`StoreError::Concurrency`] when another
    /// writer won the race; [`SaveError::Encode`] when a payload cannot be
    /// encoded.
    #[tracing::instrument(skip(self, aggregate), fields(
        aggregate_type = aggregate.root().aggregate_type(),
        aggregate_id = aggregate.root().id(),
    ))]
    pub async fn save<A: Aggregate>(&self, aggregate: &mut A) -> Result<(), SaveError> {
        if aggregate.root().events().is_empty() {
            return Ok(());
        }

        let mut records: Vec<EventRecord> = Vec::with_capacity(aggregate.root().events().len());
        for event in aggregate.root().events() {
            records.push(
                event
                    .to_record(&self.codec)
                    .map_err(|e| SaveError::Encode(Box::new(e)))?,
            );
        }

        self.store.save(&mut records).await?;

        let globals: Vec<Version> = records.iter().map(|r| r.global_version).collect();
        let committed = aggregate.root_mut().commit(&globals);
        tracing::debug!(events = committed.len(), "aggregate events saved");
        self.stream.publish(&committed);
        Ok(())
    }

    /// Load an aggregate by replaying its event history.
    ///
    /// Events are requested after the aggregate's current version, so a
    /// snapshot-warmed aggregate only replays its tail.
    ///
    /// # Errors
    ///
    /// [`GetError::NotFound`] when the aggregate has no history at all;
    /// [`GetError::Load`] with the applied-event count on partial failure.
    #[tracing::instrument(skip(self, aggregate), fields(aggregate_id = id))]
    pub async fn get<A: Aggregate>(&self, id: &str, aggregate: &mut A) -> Result<(), GetError> {
        aggregate.root_mut().bind(short_type_name::<A>());
        let fresh = aggregate.root().version() == 0;
        let applied = self.replay(id, aggregate).await?;
        if fresh && applied == 0 {
            return Err(GetError::NotFound);
        }
        tracing::debug!(applied, version = aggregate.root().version(), "aggregate loaded");
        Ok(())
    }

    /// Stream, decode, and fold events after the aggregate's current version.
    /// Returns how many events were applied.
    pub(crate) async fn replay<A: Aggregate>(
        &self,
        id: &str,
        aggregate: &mut A,
    ) -> Result<usize, GetError> {
        let aggregate_type = short_type_name::<A>();
        let after = aggregate.root().version();
        let mut stream = match self.store.get(id, aggregate_type, after).await {
            Ok(stream) => stream,
            // A backend reporting "no events" is the same as an empty stream.
            Err(StoreError::NotFound) => return Ok(0),
            Err(e) => return Err(GetError::Store(e)),
        };

        let mut applied = 0usize;
        while let Some(item) = stream.next().await {
            let record = item.map_err(|e| GetError::Load {
                applied,
                source: ReplayError::Store(e),
            })?;
            let event = self
                .register
                .decode_record(&self.codec, &record)
                .map_err(|e| GetError::Load {
                    applied,
                    source: replay_error(e),
                })?;
            apply_history_event(aggregate, &event).map_err(|e| GetError::Load {
                applied,
                source: ReplayError::History(e),
            })?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Subscribe to every saved event.
    pub fn subscribe_all(&self, f: impl Fn(&Event) + Send + Sync + 'static) -> Subscription {
        self.stream.subscribe_all(f)
    }

    /// Subscribe to one aggregate instance's events.
    pub fn subscribe_aggregate<A: Aggregate>(
        &self,
        id: &str,
        f: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        self.stream.subscribe_aggregate(short_type_name::<A>(), id, f)
    }

    /// Subscribe to every event of one aggregate type.
    pub fn subscribe_aggregate_type<A: Aggregate>(
        &self,
        f: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        self.stream.subscribe_aggregate_type(short_type_name::<A>(), f)
    }

    /// Subscribe to every event whose payload is `T`.
    pub fn subscribe_reason<T: 'static>(
        &self,
        f: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        self.stream.subscribe_reason(short_type_name::<T>(), f)
    }
}

/// Event repository with snapshot-accelerated loading.
///
/// Wraps an [`EventRepository`] and a [`SnapshotStore`]. Aggregates used with
/// it must serialize their domain state (the embedded root is carried by the
/// snapshot itself, so mark the root field `#[serde(skip)]`).
pub struct SnapshotRepository<SS, S, C = JsonCodec>
where
    C: Codec,
{
    snapshots: SS,
    repository: EventRepository<S, C>,
}

impl<SS, S, C> SnapshotRepository<SS, S, C>
where
    SS: SnapshotStore,
    S: EventStore,
    C: Codec,
{
    pub fn new(snapshots: SS, repository: EventRepository<S, C>) -> Self {
        Self {
            snapshots,
            repository,
        }
    }

    /// The wrapped event repository.
    #[must_use]
    pub fn repository(&self) -> &EventRepository<S, C> {
        &self.repository
    }

    /// Save uncommitted events, then capture a snapshot of the now-clean
    /// aggregate.
    ///
    /// # Errors
    ///
    /// Event-save failures surface as for [`EventRepository::save`]; snapshot
    /// failures as [`SaveError::Snapshot`].
    pub async fn save<A>(&self, aggregate: &mut A) -> Result<(), SaveError>
    where
        A: Aggregate + Serialize + Sync,
    {
        self.repository.save(aggregate).await?;
        self.save_snapshot(aggregate).await?;
        Ok(())
    }

    /// Capture a snapshot of a clean aggregate.
    ///
    /// # Errors
    ///
    /// [`SnapshotError::UnsavedEvents`] when the aggregate still has
    /// uncommitted events; [`SnapshotError::EmptyId`] when it has no id.
    pub async fn save_snapshot<A>(&self, aggregate: &A) -> Result<(), SnapshotError>
    where
        A: Aggregate + Serialize + Sync,
    {
        let root = aggregate.root();
        if root.id().is_empty() {
            return Err(SnapshotError::EmptyId);
        }
        if !root.events().is_empty() {
            return Err(SnapshotError::UnsavedEvents);
        }
        let state = self
            .repository
            .codec
            .serialize(aggregate)
            .map_err(|e| SnapshotError::Serialization(Box::new(e)))?;
        let snapshot = Snapshot {
            id: root.id().to_string(),
            aggregate_type: short_type_name::<A>().to_string(),
            version: root.version(),
            global_version: root.global_version(),
            state,
        };
        tracing::debug!(
            aggregate_type = snapshot.aggregate_type,
            aggregate_id = snapshot.id,
            version = snapshot.version,
            "snapshot captured"
        );
        self.snapshots.save(snapshot).await
    }

    /// Load an aggregate, preferring a snapshot plus its event tail.
    ///
    /// A snapshot miss is not an error: the load falls back to full event
    /// replay. With neither a snapshot nor events, this is
    /// [`GetError::NotFound`].
    pub async fn get<A>(&self, id: &str, aggregate: &mut A) -> Result<(), GetError>
    where
        A: Aggregate + DeserializeOwned,
    {
        let aggregate_type = short_type_name::<A>();
        match self.snapshots.get(id, aggregate_type).await {
            Ok(snapshot) => {
                let snapshot_version = snapshot.version;
                let state: A =
                    self.repository
                        .codec
                        .deserialize(&snapshot.state)
                        .map_err(|e| GetError::Load {
                            applied: 0,
                            source: ReplayError::Decode(Box::new(e)),
                        })?;
                *aggregate = state;
                aggregate.root_mut().restore(
                    snapshot.id,
                    snapshot.aggregate_type,
                    snapshot.version,
                    snapshot.global_version,
                );
                let applied = self.repository.replay(id, aggregate).await?;
                tracing::debug!(
                    aggregate_id = id,
                    snapshot_version,
                    tail = applied,
                    "aggregate loaded from snapshot"
                );
                Ok(())
            }
            Err(SnapshotError::NotFound) => {
                tracing::debug!(aggregate_id = id, "snapshot miss, replaying full history");
                self.repository.get(id, aggregate).await
            }
            Err(e) => Err(GetError::Snapshot(e)),
        }
    }
}
