//! Live event stream.
//!
//! A process-local broker that fans newly saved events out to subscribers.
//! Delivery is synchronous with respect to the publisher: a repository save
//! returns only after every matching subscriber has seen every event from
//! that save, in order. Asynchronous consumption belongs to projections, not
//! to stream semantics.
//!
//! Subscriber callbacks must not call back into a save on the same aggregate;
//! re-entrancy there is undefined. The subscriber map is mutex-guarded, but
//! callbacks run outside the lock, so subscribing or unsubscribing from
//! inside a callback is safe.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, Weak},
};

use crate::event::Event;

type SubscriberFn = Arc<dyn Fn(&Event) + Send + Sync>;
type SubscriberSlot = BTreeMap<u64, SubscriberFn>;

#[derive(Default)]
struct Inner {
    next_id: u64,
    all: SubscriberSlot,
    aggregates: HashMap<(String, String), SubscriberSlot>,
    types: HashMap<String, SubscriberSlot>,
    reasons: HashMap<String, SubscriberSlot>,
}

/// Where a subscription lives inside the broker.
enum Slot {
    All,
    Aggregate(String, String),
    Type(String),
    Reason(String),
}

/// Token controlling a subscription's lifetime.
///
/// Dropping the token does *not* remove the subscription; call
/// [`unsubscribe`](Subscription::unsubscribe). An unsubscribe during delivery
/// takes effect from the next event.
pub struct Subscription {
    inner: Weak<Mutex<Inner>>,
    slot: Slot,
    id: u64,
}

impl Subscription {
    /// Remove the subscription from the broker.
    pub fn unsubscribe(self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut inner = inner.lock().expect("event stream lock poisoned");
        match &self.slot {
            Slot::All => {
                inner.all.remove(&self.id);
            }
            Slot::Aggregate(aggregate_type, id) => {
                if let Some(slot) = inner
                    .aggregates
                    .get_mut(&(aggregate_type.clone(), id.clone()))
                {
                    slot.remove(&self.id);
                }
            }
            Slot::Type(aggregate_type) => {
                if let Some(slot) = inner.types.get_mut(aggregate_type) {
                    slot.remove(&self.id);
                }
            }
            Slot::Reason(reason) => {
                if let Some(slot) = inner.reasons.get_mut(reason) {
                    slot.remove(&self.id);
                }
            }
        }
    }
}

/// Multi-subscriber broker for live event fan-out.
#[derive(Clone, Default)]
pub struct EventStream {
    inner: Arc<Mutex<Inner>>,
}

impl EventStream {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, slot: Slot, subscriber: SubscriberFn) -> Subscription {
        let mut inner = self.inner.lock().expect("event stream lock poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        match &slot {
            Slot::All => {
                inner.all.insert(id, subscriber);
            }
            Slot::Aggregate(aggregate_type, aggregate_id) => {
                inner
                    .aggregates
                    .entry((aggregate_type.clone(), aggregate_id.clone()))
                    .or_default()
                    .insert(id, subscriber);
            }
            Slot::Type(aggregate_type) => {
                inner
                    .types
                    .entry(aggregate_type.clone())
                    .or_default()
                    .insert(id, subscriber);
            }
            Slot::Reason(reason) => {
                inner
                    .reasons
                    .entry(reason.clone())
                    .or_default()
                    .insert(id, subscriber);
            }
        }
        Subscription {
            inner: Arc::downgrade(&self.inner),
            slot,
            id,
        }
    }

    /// Subscribe to every published event.
    pub fn subscribe_all(&self, f: impl Fn(&Event) + Send + Sync + 'static) -> Subscription {
        self.insert(Slot::All, Arc::new(f))
    }

    /// Subscribe to one aggregate instance's events.
    pub fn subscribe_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        f: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        self.insert(
            Slot::Aggregate(aggregate_type.to_string(), aggregate_id.to_string()),
            Arc::new(f),
        )
    }

    /// Subscribe to every event of one aggregate type.
    pub fn subscribe_aggregate_type(
        &self,
        aggregate_type: &str,
        f: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        self.insert(Slot::Type(aggregate_type.to_string()), Arc::new(f))
    }

    /// Subscribe to every event carrying the given reason.
    pub fn subscribe_reason(
        &self,
        reason: &str,
        f: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        self.insert(Slot::Reason(reason.to_string()), Arc::new(f))
    }

    /// Deliver events to every matching subscriber, in order.
    ///
    /// The matching subscriber list is captured under the lock per event and
    /// invoked outside it, so callbacks never observe the lock held.
    pub fn publish(&self, events: &[Event]) {
        for event in events {
            let matching = self.matching_subscribers(event);
            tracing::trace!(
                aggregate_type = event.aggregate_type(),
                reason = event.reason(),
                global_version = event.global_version(),
                subscribers = matching.len(),
                "publishing event"
            );
            for subscriber in matching {
                subscriber(event);
            }
        }
    }

    /// Matching subscribers in subscription order.
    fn matching_subscribers(&self, event: &Event) -> Vec<SubscriberFn> {
        let inner = self.inner.lock().expect("event stream lock poisoned");
        let mut matching: Vec<(u64, SubscriberFn)> = Vec::new();
        matching.extend(inner.all.iter().map(|(&id, f)| (id, f.clone())));
        if let Some(slot) = inner.aggregates.get(&(
            event.aggregate_type().to_string(),
            event.aggregate_id().to_string(),
        )) {
            matching.extend(slot.iter().map(|(&id, f)| (id, f.clone())));
        }
        if let Some(slot) = inner.types.get(event.aggregate_type()) {
            matching.extend(slot.iter().map(|(&id, f)| (id, f.clone())));
        }
        if let Some(slot) = inner.reasons.get(event.reason()) {
            matching.extend(slot.iter().map(|(&id, f)| (id, f.clone())));
        }
        matching.sort_by_key(|(id, _)| *id);
        matching.into_iter().map(|(_, f)| f).collect()
    }
}
