//! Aggregate roots.
//!
//! An aggregate embeds an [`AggregateRoot`] that tracks identity, committed
//! versions, and the buffer of uncommitted events. Domain commands call
//! [`Aggregate::track_change`] with a payload value; the root assigns the next
//! per-aggregate version and immediately applies the event through
//! [`Aggregate::transition`] so in-memory state always reflects the tracked
//! history.
//!
//! The root never holds a back-reference to the concrete aggregate: the
//! provided trait methods receive the aggregate itself and dispatch through
//! it, keeping the ownership one-way.

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    codec::Codec,
    event::{Event, Metadata, Version},
    register::{EventRegistrator, short_type_name},
};

/// Errors raised by aggregate-local operations.
#[derive(Debug, Error)]
pub enum AggregateError {
    /// `track_change` or binding was attempted before the aggregate type was
    /// registered.
    #[error("aggregate type is not registered")]
    Unregistered,
    /// `set_id` was called on an aggregate that already has history.
    #[error("aggregate already has recorded history")]
    AlreadyExists,
    /// Replay encountered an event that does not continue the version chain.
    #[error("non-contiguous event history: expected version {expected}, got {actual}")]
    InvalidHistory { expected: Version, actual: Version },
    /// The event payload could not be erased for persistence.
    #[error("failed to encode event payload: {0}")]
    Serialization(#[source] serde_json::Error),
}

/// Per-instance state machine embedded by every aggregate.
///
/// A zero-value root is unbound; [`Register::bind`](crate::register::Register::bind)
/// (or a repository load) stamps it with its aggregate type name. Versions
/// start at 0 and only advance when events are committed or replayed.
#[derive(Clone, Debug, Default)]
pub struct AggregateRoot {
    id: String,
    aggregate_type: Option<String>,
    version: Version,
    global_version: Version,
    uncommitted: Vec<Event>,
}

impl AggregateRoot {
    /// The aggregate instance id; empty until set or until the first tracked
    /// event derives one.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The bound aggregate type name, if any.
    #[must_use]
    pub fn aggregate_type(&self) -> Option<&str> {
        self.aggregate_type.as_deref()
    }

    /// Last committed per-aggregate version.
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Last committed store-global position for this aggregate.
    #[must_use]
    pub fn global_version(&self) -> Version {
        self.global_version
    }

    /// The uncommitted event buffer, in tracking order.
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.uncommitted
    }

    /// Set the aggregate id before any history exists.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::AlreadyExists`] when the aggregate already
    /// has a committed version or uncommitted events.
    pub fn set_id(&mut self, id: impl Into<String>) -> Result<(), AggregateError> {
        if self.version != 0 || !self.uncommitted.is_empty() {
            return Err(AggregateError::AlreadyExists);
        }
        self.id = id.into();
        Ok(())
    }

    pub(crate) fn bind(&mut self, aggregate_type: &str) {
        if self.aggregate_type.is_none() {
            self.aggregate_type = Some(aggregate_type.to_string());
        }
    }

    /// Build the next uncommitted event, deriving an id when none is set.
    fn next_event<T>(
        &mut self,
        reason: &'static str,
        payload: T,
        metadata: Option<Metadata>,
    ) -> Result<Event, AggregateError>
    where
        T: Serialize + Send + Sync + 'static,
    {
        let Some(aggregate_type) = self.aggregate_type.clone() else {
            return Err(AggregateError::Unregistered);
        };
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        let version = self.version + self.uncommitted.len() as Version + 1;
        Event::tracked(
            self.id.clone(),
            aggregate_type,
            version,
            reason,
            payload,
            metadata,
        )
        .map_err(AggregateError::Serialization)
    }

    fn record(&mut self, event: Event) {
        self.uncommitted.push(event);
    }

    /// Stamp assigned global versions onto the buffer, advance the committed
    /// versions, and drain the buffer for publishing.
    pub(crate) fn commit(&mut self, global_versions: &[Version]) -> Vec<Event> {
        for (event, &global) in self.uncommitted.iter_mut().zip(global_versions) {
            event.set_global_version(global);
        }
        if let Some(last) = self.uncommitted.last() {
            self.version = last.version();
            self.global_version = last.global_version();
        }
        std::mem::take(&mut self.uncommitted)
    }

    /// Reset the root to a snapshot's identity and versions.
    pub(crate) fn restore(
        &mut self,
        id: String,
        aggregate_type: String,
        version: Version,
        global_version: Version,
    ) {
        self.id = id;
        self.aggregate_type = Some(aggregate_type);
        self.version = version;
        self.global_version = global_version;
        self.uncommitted.clear();
    }

    /// Advance committed state past one replayed event.
    fn advance(&mut self, event: &Event) {
        if self.id.is_empty() {
            self.id = event.aggregate_id().to_string();
        }
        if self.aggregate_type.is_none() {
            self.aggregate_type = Some(event.aggregate_type().to_string());
        }
        self.version = event.version();
        self.global_version = event.global_version();
    }
}

/// Apply one historical event to an aggregate, enforcing contiguity.
pub(crate) fn apply_history_event<A: Aggregate>(
    aggregate: &mut A,
    event: &Event,
) -> Result<(), AggregateError> {
    let expected = aggregate.root().version() + 1;
    if event.version() != expected {
        return Err(AggregateError::InvalidHistory {
            expected,
            actual: event.version(),
        });
    }
    aggregate.transition(event);
    aggregate.root_mut().advance(event);
    Ok(())
}

fn track<A, T>(aggregate: &mut A, payload: T, metadata: Option<Metadata>) -> Result<(), AggregateError>
where
    A: Aggregate,
    T: Serialize + Send + Sync + 'static,
{
    let reason = short_type_name::<T>();
    let event = aggregate.root_mut().next_event(reason, payload, metadata)?;
    aggregate.transition(&event);
    aggregate.root_mut().record(event);
    Ok(())
}

/// A unit of consistency whose state is the fold of its events.
///
/// Implementors embed an [`AggregateRoot`], fold events in
/// [`transition`](Aggregate::transition), and list their payload types in
/// [`register_events`](Aggregate::register_events):
///
/// ```ignore
/// #[derive(Default)]
/// struct Person {
///     root: AggregateRoot,
///     name: String,
///     age: u32,
/// }
///
/// impl Aggregate for Person {
///     fn root(&self) -> &AggregateRoot { &self.root }
///     fn root_mut(&mut self) -> &mut AggregateRoot { &mut self.root }
///
///     fn transition(&mut self, event: &Event) {
///         if let Some(born) = event.data_as::<Born>() {
///             self.name = born.name.clone();
///             self.age = 0;
///         } else if event.data_as::<AgedOneYear>().is_some() {
///             self.age += 1;
///         }
///     }
///
///     fn register_events<C: Codec>(registrator: &mut EventRegistrator<'_, C>) {
///         registrator.event::<Born>().event::<AgedOneYear>();
///     }
/// }
/// ```
pub trait Aggregate: Send {
    /// Borrow the embedded root.
    fn root(&self) -> &AggregateRoot;

    /// Mutably borrow the embedded root.
    fn root_mut(&mut self) -> &mut AggregateRoot;

    /// Fold one event into the aggregate's domain fields.
    ///
    /// Called for both freshly tracked events and replayed history; it must
    /// be a pure function of the event payload.
    fn transition(&mut self, event: &Event);

    /// List the payload types this aggregate emits.
    fn register_events<C: Codec>(registrator: &mut EventRegistrator<'_, C>);

    /// Record a new event and apply it immediately.
    ///
    /// The event's reason is the payload's short type name, its version is
    /// `committed version + uncommitted events + 1`, and its global version
    /// stays 0 until a repository save assigns one.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::Unregistered`] when the aggregate has not
    /// been bound, or [`AggregateError::Serialization`] when the payload
    /// cannot be encoded.
    fn track_change<T>(&mut self, payload: T) -> Result<(), AggregateError>
    where
        T: Serialize + Send + Sync + 'static,
        Self: Sized,
    {
        track(self, payload, None)
    }

    /// Like [`track_change`](Aggregate::track_change), with a caller-supplied
    /// metadata map carried alongside the payload.
    fn track_change_with_metadata<T>(
        &mut self,
        payload: T,
        metadata: Metadata,
    ) -> Result<(), AggregateError>
    where
        T: Serialize + Send + Sync + 'static,
        Self: Sized,
    {
        track(self, payload, Some(metadata))
    }

    /// Rebuild state by folding an ordered event history.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::InvalidHistory`] when an event does not
    /// continue the version chain `current + 1`.
    fn build_from_history<I>(&mut self, events: I) -> Result<(), AggregateError>
    where
        I: IntoIterator<Item = Event>,
        Self: Sized,
    {
        for event in events {
            apply_history_event(self, &event)?;
        }
        Ok(())
    }

    /// Set the aggregate id; only valid before any history exists.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::AlreadyExists`] otherwise.
    fn set_id(&mut self, id: impl Into<String>) -> Result<(), AggregateError>
    where
        Self: Sized,
    {
        self.root_mut().set_id(id)
    }

    /// The aggregate instance id.
    fn id(&self) -> &str {
        self.root().id()
    }

    /// The bound aggregate type name, if any.
    fn aggregate_type(&self) -> Option<&str> {
        self.root().aggregate_type()
    }

    /// Last committed per-aggregate version.
    fn version(&self) -> Version {
        self.root().version()
    }

    /// Last committed store-global position.
    fn global_version(&self) -> Version {
        self.root().global_version()
    }

    /// The uncommitted event buffer.
    fn events(&self) -> &[Event] {
        self.root().events()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{codec::JsonCodec, register::Register};

    #[derive(Debug, Serialize, Deserialize)]
    struct Born {
        name: String,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct AgedOneYear;

    #[derive(Default)]
    struct Person {
        root: AggregateRoot,
        name: String,
        age: u32,
    }

    impl Person {
        fn create(&mut self, name: &str) -> Result<(), AggregateError> {
            self.track_change(Born {
                name: name.to_string(),
            })
        }

        fn grow_older(&mut self) -> Result<(), AggregateError> {
            self.track_change(AgedOneYear)
        }
    }

    impl Aggregate for Person {
        fn root(&self) -> &AggregateRoot {
            &self.root
        }

        fn root_mut(&mut self) -> &mut AggregateRoot {
            &mut self.root
        }

        fn transition(&mut self, event: &Event) {
            if let Some(born) = event.data_as::<Born>() {
                self.name = born.name.clone();
                self.age = 0;
            } else if event.data_as::<AgedOneYear>().is_some() {
                self.age += 1;
            }
        }

        fn register_events<C: Codec>(registrator: &mut EventRegistrator<'_, C>) {
            registrator.event::<Born>().event::<AgedOneYear>();
        }
    }

    fn bound_person() -> Person {
        let mut register: Register<JsonCodec> = Register::new();
        register.aggregate::<Person>();
        let mut person = Person::default();
        register.bind(&mut person).unwrap();
        person
    }

    #[test]
    fn track_change_before_binding_fails() {
        let mut person = Person::default();
        assert!(matches!(
            person.create("kalle"),
            Err(AggregateError::Unregistered)
        ));
    }

    #[test]
    fn track_change_applies_and_buffers() {
        let mut person = bound_person();
        person.create("kalle").unwrap();

        assert_eq!(person.name, "kalle");
        assert_eq!(person.age, 0);
        assert_eq!(person.events().len(), 1);
        assert_eq!(person.events()[0].version(), 1);
        assert_eq!(person.events()[0].reason(), "Born");
        // Committed version only moves on save.
        assert_eq!(person.version(), 0);
    }

    #[test]
    fn tracked_versions_are_contiguous() {
        let mut person = bound_person();
        person.create("kalle").unwrap();
        for _ in 0..10 {
            person.grow_older().unwrap();
        }

        assert_eq!(person.age, 10);
        let versions: Vec<Version> = person.events().iter().map(Event::version).collect();
        assert_eq!(versions, (1..=11).collect::<Vec<_>>());
    }

    #[test]
    fn id_is_derived_at_first_event_when_unset() {
        let mut person = bound_person();
        person.create("kalle").unwrap();
        assert!(!person.id().is_empty());
    }

    #[test]
    fn set_id_only_before_history() {
        let mut person = bound_person();
        person.set_id("person-1").unwrap();
        person.create("kalle").unwrap();

        assert_eq!(person.id(), "person-1");
        assert!(matches!(
            person.set_id("person-2"),
            Err(AggregateError::AlreadyExists)
        ));
    }

    #[test]
    fn metadata_rides_along_with_the_event() {
        let mut person = bound_person();
        let mut metadata = Metadata::new();
        metadata.insert("actor".to_string(), serde_json::json!("test"));
        person
            .track_change_with_metadata(
                Born {
                    name: "kalle".to_string(),
                },
                metadata,
            )
            .unwrap();

        let recorded = &person.events()[0];
        assert_eq!(
            recorded.metadata().unwrap()["actor"],
            serde_json::json!("test")
        );
    }

    #[test]
    fn build_from_history_replays_contiguous_events() {
        let mut source = bound_person();
        source.set_id("p1").unwrap();
        source.create("kalle").unwrap();
        source.grow_older().unwrap();
        let mut history: Vec<Event> = source.events().to_vec();
        for (i, event) in history.iter_mut().enumerate() {
            event.set_global_version(i as Version + 1);
        }

        let mut twin = Person::default();
        twin.build_from_history(history).unwrap();

        assert_eq!(twin.name, "kalle");
        assert_eq!(twin.age, 1);
        assert_eq!(twin.id(), "p1");
        assert_eq!(twin.version(), 2);
        assert_eq!(twin.global_version(), 2);
    }

    #[test]
    fn build_from_history_rejects_gaps() {
        let mut source = bound_person();
        source.set_id("p1").unwrap();
        source.create("kalle").unwrap();
        source.grow_older().unwrap();
        source.grow_older().unwrap();
        let mut history: Vec<Event> = source.events().to_vec();
        history.remove(1);

        let mut twin = Person::default();
        let err = twin.build_from_history(history).unwrap_err();
        assert!(matches!(
            err,
            AggregateError::InvalidHistory {
                expected: 2,
                actual: 3
            }
        ));
    }
}
