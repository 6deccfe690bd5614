//! Type registry.
//!
//! Event payloads travel through stores as opaque bytes tagged with a
//! `reason` string. The [`Register`] maps `(aggregate type, reason)` pairs to
//! decode factories so the load path and the projection path can materialize
//! payloads back into their concrete types. Reasons are the short Rust type
//! names of the payload types, captured at registration.
//!
//! Registration happens once, during startup, before the register is shared;
//! afterwards it is read-only and safe to use from any number of tasks.

use std::{
    any::Any,
    collections::{HashMap, HashSet},
    sync::Arc,
};

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::{
    aggregate::{Aggregate, AggregateError},
    codec::Codec,
    event::{Event, EventRecord, Metadata},
};

/// A decoded, type-erased event payload.
pub(crate) type Payload = Arc<dyn Any + Send + Sync>;

type DecodeFn<C> = Box<dyn Fn(&C, &[u8]) -> Result<Payload, <C as Codec>::Error> + Send + Sync>;

/// Short name of a type, without module path or generic arguments.
///
/// `my_app::person::Born` becomes `"Born"`. Registered payload types must
/// have distinct short names within one aggregate type.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Failure while decoding a stored record into an [`Event`].
#[derive(Debug, Error)]
pub(crate) enum DecodeError<E: std::error::Error> {
    #[error("event not registered: aggregate type {aggregate_type}, reason {reason}")]
    NotRegistered {
        aggregate_type: String,
        reason: String,
    },
    #[error("failed to decode event payload: {0}")]
    Payload(#[source] E),
    #[error("failed to decode event metadata: {0}")]
    Metadata(#[source] E),
}

/// Maps reason strings to payload decode factories.
///
/// Build one register per process, add every aggregate with
/// [`Register::aggregate`], and share it (behind an `Arc`) with the
/// repository and any projection handlers.
pub struct Register<C: Codec> {
    aggregates: HashSet<&'static str>,
    events: HashMap<&'static str, HashMap<&'static str, DecodeFn<C>>>,
}

impl<C: Codec> Register<C> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            aggregates: HashSet::new(),
            events: HashMap::new(),
        }
    }

    /// Register an aggregate type and the payload types it emits.
    ///
    /// The aggregate's type name becomes its stable `aggregate_type` string,
    /// and [`Aggregate::register_events`] is walked to install one decode
    /// factory per payload type.
    pub fn aggregate<A: Aggregate>(&mut self) {
        let name = short_type_name::<A>();
        self.aggregates.insert(name);
        let mut registrator = EventRegistrator {
            events: self.events.entry(name).or_default(),
        };
        A::register_events(&mut registrator);
        tracing::debug!(aggregate_type = name, "aggregate registered");
    }

    /// Bind an aggregate instance to its registered type name.
    ///
    /// Binding is required before the first
    /// [`track_change`](Aggregate::track_change); loading through a
    /// repository binds implicitly.
    ///
    /// # Errors
    ///
    /// Returns [`AggregateError::Unregistered`] when the aggregate type was
    /// never added with [`Register::aggregate`].
    pub fn bind<A: Aggregate>(&self, aggregate: &mut A) -> Result<(), AggregateError> {
        let name = short_type_name::<A>();
        if !self.aggregates.contains(name) {
            return Err(AggregateError::Unregistered);
        }
        aggregate.root_mut().bind(name);
        Ok(())
    }

    /// Whether an aggregate type has been registered.
    #[must_use]
    pub fn aggregate_registered(&self, aggregate_type: &str) -> bool {
        self.aggregates.contains(aggregate_type)
    }

    /// Whether a decode factory exists for the given reason.
    #[must_use]
    pub fn event_registered(&self, aggregate_type: &str, reason: &str) -> bool {
        self.decoder(aggregate_type, reason).is_some()
    }

    fn decoder(&self, aggregate_type: &str, reason: &str) -> Option<&DecodeFn<C>> {
        self.events.get(aggregate_type)?.get(reason)
    }

    /// Decode a stored record into an [`Event`] with a materialized payload.
    pub(crate) fn decode_record(
        &self,
        codec: &C,
        record: &EventRecord,
    ) -> Result<Event, DecodeError<C::Error>> {
        let Some(decode) = self.decoder(&record.aggregate_type, &record.reason) else {
            return Err(DecodeError::NotRegistered {
                aggregate_type: record.aggregate_type.clone(),
                reason: record.reason.clone(),
            });
        };
        let payload = decode(codec, &record.data).map_err(DecodeError::Payload)?;
        let metadata = match &record.metadata {
            Some(bytes) => Some(
                codec
                    .deserialize::<Metadata>(bytes)
                    .map_err(DecodeError::Metadata)?,
            ),
            None => None,
        };
        Ok(Event::from_record(record, payload, metadata))
    }
}

impl<C: Codec> Default for Register<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects the payload types of one aggregate during registration.
///
/// Passed to [`Aggregate::register_events`]:
///
/// ```ignore
/// fn register_events<C: Codec>(registrator: &mut EventRegistrator<'_, C>) {
///     registrator.event::<Born>().event::<AgedOneYear>();
/// }
/// ```
pub struct EventRegistrator<'r, C: Codec> {
    events: &'r mut HashMap<&'static str, DecodeFn<C>>,
}

impl<C: Codec> EventRegistrator<'_, C> {
    /// Register one payload type; its short type name becomes the reason.
    pub fn event<T>(&mut self) -> &mut Self
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.events.insert(
            short_type_name::<T>(),
            Box::new(|codec, data| {
                codec
                    .deserialize::<T>(data)
                    .map(|payload| Arc::new(payload) as Payload)
            }),
        );
        self
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{aggregate::AggregateRoot, codec::JsonCodec};

    #[derive(Debug, Serialize, Deserialize)]
    struct Born {
        name: String,
    }

    #[derive(Default)]
    struct Person {
        root: AggregateRoot,
        name: String,
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
            }
        }

        fn register_events<C: Codec>(registrator: &mut EventRegistrator<'_, C>) {
            registrator.event::<Born>();
        }
    }

    fn record(reason: &str, data: &[u8]) -> EventRecord {
        EventRecord {
            aggregate_id: "p1".to_string(),
            aggregate_type: "Person".to_string(),
            version: 1,
            global_version: 1,
            reason: reason.to_string(),
            timestamp: Utc::now(),
            data: data.to_vec(),
            metadata: None,
        }
    }

    #[test]
    fn short_type_name_strips_path_and_generics() {
        assert_eq!(short_type_name::<Born>(), "Born");
        assert_eq!(short_type_name::<Vec<Born>>(), "Vec");
    }

    #[test]
    fn registered_events_are_found() {
        let mut register: Register<JsonCodec> = Register::new();
        register.aggregate::<Person>();

        assert!(register.aggregate_registered("Person"));
        assert!(register.event_registered("Person", "Born"));
        assert!(!register.event_registered("Person", "Died"));
        assert!(!register.event_registered("Robot", "Born"));
    }

    #[test]
    fn bind_rejects_unregistered_aggregate() {
        let register: Register<JsonCodec> = Register::new();
        let mut person = Person::default();
        assert!(matches!(
            register.bind(&mut person),
            Err(AggregateError::Unregistered)
        ));
    }

    #[test]
    fn decode_record_materializes_payload() {
        let mut register: Register<JsonCodec> = Register::new();
        register.aggregate::<Person>();

        let event = register
            .decode_record(&JsonCodec, &record("Born", br#"{"name":"kalle"}"#))
            .unwrap();
        assert_eq!(event.data_as::<Born>().unwrap().name, "kalle");
    }

    #[test]
    fn decode_record_rejects_unknown_reason() {
        let mut register: Register<JsonCodec> = Register::new();
        register.aggregate::<Person>();

        let result = register.decode_record(&JsonCodec, &record("Died", b"{}"));
        assert!(matches!(result, Err(DecodeError::NotRegistered { .. })));
    }

    #[test]
    fn decode_record_surfaces_payload_errors() {
        let mut register: Register<JsonCodec> = Register::new();
        register.aggregate::<Person>();

        let result = register.decode_record(&JsonCodec, &record("Born", b"not json"));
        assert!(matches!(result, Err(DecodeError::Payload(_))));
    }
}
