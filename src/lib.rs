#![doc = include_str!("../README.md")]

pub use eventum_core::{
    aggregate,
    aggregate::{Aggregate, AggregateError, AggregateRoot},
    cancel,
    cancel::{CancelHandle, CancelToken, cancellation},
    codec,
    codec::{Codec, JsonCodec},
    event,
    event::{Event, EventRecord, Metadata, Version},
    projection,
    projection::{
        CallbackFn, FetchFn, FetchFuture, Group, Projection, ProjectionError, ProjectionResult,
        Projections, TriggerHandle, race,
    },
    register,
    register::{EventRegistrator, Register},
    repository,
    repository::{EventRepository, GetError, ReplayError, SaveError, SnapshotRepository},
    snapshot,
    snapshot::{Snapshot, SnapshotError, SnapshotStore},
    stream,
    stream::{EventStream, Subscription},
};

/// Event-store boundary and reference implementations.
pub mod store {
    pub use eventum_core::store::{EventStore, RecordStream, StoreError, inmemory};
}
