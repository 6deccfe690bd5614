//! Event values.
//!
//! Events exist in two forms. [`EventRecord`] is the wire form: an opaque
//! payload byte blob plus the header columns every store back-end persists.
//! [`Event`] is the decoded form that aggregates, subscribers, and projection
//! callbacks see: the same header with the payload materialized as its
//! registered concrete type, reachable through [`Event::data_as`].

use std::{any::Any, collections::HashMap, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::codec::Codec;

/// Per-aggregate and store-global monotonic event counter.
pub type Version = u64;

/// Decoded event metadata, keyed by caller-chosen names.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Wire form of an event, as persisted and returned by event stores.
///
/// Within one aggregate, `version` values form `1..N` with no gaps and
/// `(aggregate_id, aggregate_type, version)` is unique. `global_version` is
/// assigned by the store at append and is unique and strictly increasing
/// across the whole store; `0` means the record has not been committed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub version: Version,
    pub global_version: Version,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
    pub metadata: Option<Vec<u8>>,
}

/// Where an event's payload bytes come from when it is persisted.
#[derive(Clone)]
enum PayloadForm {
    /// Recorded locally via `track_change`; encoded by the repository codec
    /// at save time.
    Pending(serde_json::Value),
    /// Decoded from a stored record; the original bytes are retained.
    Stored(Vec<u8>),
}

/// An immutable record of one state change, with a decoded payload.
///
/// The payload is type-erased; downcast it with [`Event::data_as`] using the
/// type that was registered for this event's [`reason`](Event::reason):
///
/// ```ignore
/// fn transition(&mut self, event: &Event) {
///     if let Some(born) = event.data_as::<Born>() {
///         self.name = born.name.clone();
///     }
/// }
/// ```
#[derive(Clone)]
pub struct Event {
    pub(crate) aggregate_id: String,
    pub(crate) aggregate_type: String,
    pub(crate) version: Version,
    pub(crate) global_version: Version,
    pub(crate) reason: String,
    pub(crate) timestamp: DateTime<Utc>,
    payload: Arc<dyn Any + Send + Sync>,
    form: PayloadForm,
    metadata: Option<Metadata>,
}

impl Event {
    /// Build an uncommitted event from a freshly tracked payload.
    pub(crate) fn tracked<T>(
        aggregate_id: String,
        aggregate_type: String,
        version: Version,
        reason: &'static str,
        payload: T,
        metadata: Option<Metadata>,
    ) -> Result<Self, serde_json::Error>
    where
        T: Serialize + Send + Sync + 'static,
    {
        let value = serde_json::to_value(&payload)?;
        Ok(Self {
            aggregate_id,
            aggregate_type,
            version,
            global_version: 0,
            reason: reason.to_string(),
            timestamp: Utc::now(),
            payload: Arc::new(payload),
            form: PayloadForm::Pending(value),
            metadata,
        })
    }

    /// Rehydrate an event from a stored record and its decoded payload.
    pub(crate) fn from_record(
        record: &EventRecord,
        payload: Arc<dyn Any + Send + Sync>,
        metadata: Option<Metadata>,
    ) -> Self {
        Self {
            aggregate_id: record.aggregate_id.clone(),
            aggregate_type: record.aggregate_type.clone(),
            version: record.version,
            global_version: record.global_version,
            reason: record.reason.clone(),
            timestamp: record.timestamp,
            payload,
            form: PayloadForm::Stored(record.data.clone()),
            metadata,
        }
    }

    /// Encode this event into its wire form.
    pub(crate) fn to_record<C: Codec>(&self, codec: &C) -> Result<EventRecord, C::Error> {
        let data = match &self.form {
            PayloadForm::Pending(value) => codec.serialize(value)?,
            PayloadForm::Stored(bytes) => bytes.clone(),
        };
        let metadata = match &self.metadata {
            Some(map) => Some(codec.serialize(map)?),
            None => None,
        };
        Ok(EventRecord {
            aggregate_id: self.aggregate_id.clone(),
            aggregate_type: self.aggregate_type.clone(),
            version: self.version,
            global_version: self.global_version,
            reason: self.reason.clone(),
            timestamp: self.timestamp,
            data,
            metadata,
        })
    }

    pub(crate) fn set_global_version(&mut self, global_version: Version) {
        self.global_version = global_version;
    }

    /// Identifier of the aggregate instance this event belongs to.
    #[must_use]
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    /// Name of the aggregate kind this event belongs to.
    #[must_use]
    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    /// Per-aggregate version of this event, starting at 1.
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Store-global position, or 0 while the event is uncommitted.
    #[must_use]
    pub fn global_version(&self) -> Version {
        self.global_version
    }

    /// Short name of the payload kind, e.g. `"Born"`.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Wall-clock instant at which the event was tracked.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Decoded metadata, when the event carries any.
    #[must_use]
    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// Downcast the payload to the concrete type registered for this reason.
    ///
    /// Returns `None` when `T` does not match the payload's type.
    #[must_use]
    pub fn data_as<T: 'static>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("aggregate_id", &self.aggregate_id)
            .field("aggregate_type", &self.aggregate_type)
            .field("version", &self.version)
            .field("global_version", &self.global_version)
            .field("reason", &self.reason)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}
