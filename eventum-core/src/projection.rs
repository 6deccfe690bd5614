//! Projections.
//!
//! A projection is one cursor-driven consumer of the store's global event
//! order: a `fetch` closure producing a record stream from the cursor, a
//! callback applied to each decoded event, and a private trigger channel.
//! [`Group`] runs a fixed set of projections concurrently with pacing and
//! fan-out triggers; [`race`] drives projections to the end of a stale
//! stream and collects their results.
//!
//! ```text
//!   IDLE ──start──▶ RUNNING ──fetch empty──▶ WAITING
//!                      ▲  │                    │
//!                      │  └──error────▶ FAILED │
//!                      └────── trigger / pace ─┘
//!                         WAITING ──cancel──▶ STOPPED
//! ```

use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_stream::StreamExt as _;

use crate::{
    cancel::{CancelHandle, CancelToken, cancellation},
    codec::Codec,
    event::{Event, Version},
    register::{DecodeError, Register},
    store::{RecordStream, StoreError},
};

/// Future returned by a projection's fetch closure.
pub type FetchFuture = Pin<Box<dyn Future<Output = Result<RecordStream, StoreError>> + Send>>;

/// Produces the next batch of records, starting at the given cursor.
///
/// The typical fetch closes over a store handle and calls
/// `store.all(cursor, batch_size)`.
pub type FetchFn = Box<dyn FnMut(Version) -> FetchFuture + Send>;

/// Applied to every decoded event a projection handles.
pub type CallbackFn =
    Box<dyn FnMut(Event) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send>;

/// Terminal conditions of a projection run.
///
/// Cloneable so [`race`] can report the causing error alongside the
/// per-projection results.
#[derive(Clone, Debug, Error)]
pub enum ProjectionError {
    /// The run's cancellation token fired. Not a failure: groups expect this
    /// on `stop` and do not forward it to the error channel.
    #[error("projection cancelled")]
    Cancelled,
    /// A strict projection fetched an event with an unregistered reason.
    #[error(
        "event not registered: aggregate type {aggregate_type}, reason {reason}, global version {global_version}"
    )]
    EventNotRegistered {
        aggregate_type: String,
        reason: String,
        global_version: Version,
    },
    /// Fetch or iteration failed.
    #[error("event store error: {0}")]
    Store(Arc<StoreError>),
    /// An event's payload or metadata failed to decode.
    #[error("failed to decode event: {0}")]
    Decode(Arc<dyn std::error::Error + Send + Sync>),
    /// The projection callback rejected an event.
    #[error("projection callback failed: {0}")]
    Callback(Arc<dyn std::error::Error + Send + Sync>),
    /// A projection worker panicked.
    #[error("projection task panicked")]
    Panicked,
}

/// Outcome of a projection run.
#[derive(Clone, Debug)]
pub struct ProjectionResult {
    pub name: String,
    pub error: Option<ProjectionError>,
    /// The most recent successfully handled event; when the run handled
    /// nothing, the previous run's last event.
    pub last_handled_event: Option<Event>,
}

struct Trigger(Option<oneshot::Sender<()>>);

/// Out-of-band signal forcing a running projection to poll immediately.
///
/// Cloneable and usable from any task while the projection runs elsewhere.
#[derive(Clone)]
pub struct TriggerHandle {
    tx: mpsc::Sender<Trigger>,
}

impl TriggerHandle {
    /// Ask the projection to run as soon as possible.
    ///
    /// The trigger channel holds at most one pending trigger: this returns
    /// immediately when the slot is free and blocks until the projection
    /// picks up the pending trigger otherwise.
    pub async fn trigger_async(&self) {
        let _ = self.tx.send(Trigger(None)).await;
    }

    /// Trigger a run and wait until that run has drained the stream.
    pub async fn trigger_sync(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Trigger(Some(done_tx))).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Builds projections that share one register and codec.
pub struct Projections<C: Codec> {
    register: Arc<Register<C>>,
    codec: C,
    count: u32,
}

impl<C> Projections<C>
where
    C: Codec + Clone,
{
    pub fn new(register: Arc<Register<C>>, codec: C) -> Self {
        Self {
            register,
            codec,
            count: 0,
        }
    }

    /// Create a projection over `fetch` and `callback`.
    ///
    /// Projections are strict by default and named after their creation
    /// index.
    pub fn projection(&mut self, fetch: FetchFn, callback: CallbackFn) -> Projection<C> {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let projection = Projection {
            register: Arc::clone(&self.register),
            codec: self.codec.clone(),
            fetch,
            callback,
            cursor: 0,
            last_handled: None,
            trigger_tx,
            trigger_rx,
            strict: true,
            name: self.count.to_string(),
        };
        self.count += 1;
        projection
    }

    /// Bundle projections into a concurrently running [`Group`].
    #[must_use]
    pub fn group(&self, projections: Vec<Projection<C>>) -> Group<C> {
        Group::new(projections)
    }
}

/// One cursor-driven consumer over the store's global event order.
pub struct Projection<C: Codec> {
    register: Arc<Register<C>>,
    codec: C,
    fetch: FetchFn,
    callback: CallbackFn,
    cursor: Version,
    last_handled: Option<Event>,
    trigger_tx: mpsc::Sender<Trigger>,
    trigger_rx: mpsc::Receiver<Trigger>,
    /// Fail on events whose reason is unregistered instead of skipping them.
    pub strict: bool,
    pub name: String,
}

impl<C: Codec> Projection<C> {
    /// The next global position this projection will fetch from.
    #[must_use]
    pub fn cursor(&self) -> Version {
        self.cursor
    }

    /// Move the cursor, e.g. when resuming from an external checkpoint.
    pub fn seek(&mut self, cursor: Version) {
        self.cursor = cursor;
    }

    /// Handle for triggering this projection from other tasks.
    #[must_use]
    pub fn trigger_handle(&self) -> TriggerHandle {
        TriggerHandle {
            tx: self.trigger_tx.clone(),
        }
    }

    fn result(&self, error: Option<ProjectionError>) -> ProjectionResult {
        ProjectionResult {
            name: self.name.clone(),
            error,
            last_handled_event: self.last_handled.clone(),
        }
    }

    /// Drive one fetch to exhaustion.
    ///
    /// Returns whether any event was fetched, plus the run's result. The
    /// cursor advances past every fetched event that was handled or (in
    /// lenient mode) skipped, and never past a failed one, so a position is
    /// never delivered twice and a retriggered run resumes at the failure.
    pub async fn run_once(&mut self) -> (bool, ProjectionResult) {
        let mut stream = match (self.fetch)(self.cursor).await {
            Ok(stream) => stream,
            Err(e) => return (false, self.result(Some(ProjectionError::Store(Arc::new(e))))),
        };

        let mut ran = false;
        while let Some(item) = stream.next().await {
            let record = match item {
                Ok(record) => record,
                Err(e) => return (ran, self.result(Some(ProjectionError::Store(Arc::new(e))))),
            };
            ran = true;
            let next_cursor = record.global_version + 1;

            let event = match self.register.decode_record(&self.codec, &record) {
                Ok(event) => event,
                Err(DecodeError::NotRegistered {
                    aggregate_type,
                    reason,
                }) => {
                    if self.strict {
                        let error = ProjectionError::EventNotRegistered {
                            aggregate_type,
                            reason,
                            global_version: record.global_version,
                        };
                        return (ran, self.result(Some(error)));
                    }
                    self.cursor = next_cursor;
                    continue;
                }
                Err(DecodeError::Payload(e) | DecodeError::Metadata(e)) => {
                    return (
                        ran,
                        self.result(Some(ProjectionError::Decode(Arc::new(e)))),
                    );
                }
            };

            if let Err(e) = (self.callback)(event.clone()) {
                return (ran, self.result(Some(ProjectionError::Callback(Arc::from(e)))));
            }
            self.cursor = next_cursor;
            self.last_handled = Some(event);
        }
        (ran, self.result(None))
    }

    /// Loop [`run_once`](Projection::run_once) until the end of the stream or
    /// an error. Cancellation is checked between calls, never mid-callback.
    pub async fn run_to_end(&mut self, cancel: &CancelToken) -> ProjectionResult {
        loop {
            if cancel.is_cancelled() {
                return self.result(Some(ProjectionError::Cancelled));
            }
            let (ran, result) = self.run_once().await;
            if result.error.is_some() || !ran {
                return result;
            }
        }
    }

    /// Run until cancelled or failed.
    ///
    /// After each drain the projection parks and waits for whichever fires
    /// first: cancellation, the `pace` interval, or a trigger. Synchronous
    /// triggers are acknowledged after the drain they caused.
    pub async fn run(&mut self, cancel: &CancelToken, pace: Duration) -> ProjectionError {
        let mut pending_ack: Option<oneshot::Sender<()>> = None;
        loop {
            let result = self.run_to_end(cancel).await;
            if let Some(ack) = pending_ack.take() {
                let _ = ack.send(());
            }
            if let Some(error) = result.error {
                return error;
            }

            tokio::select! {
                () = cancel.cancelled() => return ProjectionError::Cancelled,
                () = tokio::time::sleep(pace) => {}
                trigger = self.trigger_rx.recv() => {
                    if let Some(Trigger(ack)) = trigger {
                        pending_ack = ack;
                    }
                }
            }
        }
    }
}

/// Runs a fixed set of projections concurrently.
///
/// Workers share one cancellation token; any worker ending with a
/// non-cancellation error emits it onto the group's error channel while the
/// rest keep running. `stop` is terminal: the workers consume the
/// projections, so a stopped group cannot be started again.
pub struct Group<C: Codec> {
    pace: Duration,
    projections: Vec<Projection<C>>,
    triggers: Vec<TriggerHandle>,
    workers: Vec<JoinHandle<()>>,
    cancel: Option<CancelHandle>,
    err_tx: Option<mpsc::UnboundedSender<ProjectionError>>,
    err_rx: mpsc::UnboundedReceiver<ProjectionError>,
    started: bool,
}

impl<C: Codec> Group<C> {
    fn new(projections: Vec<Projection<C>>) -> Self {
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        Self {
            pace: Duration::from_secs(10),
            projections,
            triggers: Vec::new(),
            workers: Vec::new(),
            cancel: None,
            err_tx: Some(err_tx),
            err_rx,
            started: false,
        }
    }

    /// Idle duration before a waiting worker re-polls. Default 10 seconds.
    #[must_use]
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }

    /// Ask every member to run as soon as possible; no-op before `start`.
    pub async fn trigger_async(&self) {
        if !self.started {
            return;
        }
        for trigger in &self.triggers {
            trigger.trigger_async().await;
        }
    }

    /// Trigger every member and wait until each has drained; no-op before
    /// `start`.
    pub async fn trigger_sync(&self) {
        if !self.started {
            return;
        }
        let waits: Vec<_> = self
            .triggers
            .iter()
            .cloned()
            .map(|trigger| tokio::spawn(async move { trigger.trigger_sync().await }))
            .collect();
        for wait in waits {
            let _ = wait.await;
        }
    }

    /// Cancel every worker and wait for them to finish. Idempotent.
    ///
    /// Once the last worker exits, the error channel closes.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
        self.triggers.clear();
        self.started = false;
        tracing::info!("projection group stopped");
    }

    /// Receiver of non-cancellation worker errors. Yields `None` once the
    /// group has stopped and the channel has drained.
    pub fn errors(&mut self) -> &mut mpsc::UnboundedReceiver<ProjectionError> {
        &mut self.err_rx
    }
}

impl<C> Group<C>
where
    C: Codec + 'static,
{
    /// Spawn one worker per projection. Redundant starts are no-ops.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        let (handle, token) = cancellation();
        let err_tx = self.err_tx.take();
        for mut projection in self.projections.drain(..) {
            self.triggers.push(projection.trigger_handle());
            let token = token.clone();
            let err_tx = err_tx.clone();
            let pace = self.pace;
            let name = projection.name.clone();
            self.workers.push(tokio::spawn(async move {
                let error = projection.run(&token, pace).await;
                if matches!(error, ProjectionError::Cancelled) {
                    tracing::debug!(projection = %name, "projection worker cancelled");
                } else {
                    tracing::error!(projection = %name, error = %error, "projection worker failed");
                    if let Some(err_tx) = err_tx {
                        let _ = err_tx.send(error);
                    }
                }
            }));
        }
        self.cancel = Some(handle);
        self.started = true;
        tracing::info!(workers = self.workers.len(), "projection group started");
    }
}

/// Drive each projection's [`run_to_end`](Projection::run_to_end)
/// concurrently over a stale stream.
///
/// Results come back in input order. With `cancel_on_error`, the first
/// non-cancellation error cancels the shared token so peers terminate early;
/// that first error is also returned.
pub async fn race<C>(
    cancel_on_error: bool,
    projections: Vec<Projection<C>>,
) -> (Vec<ProjectionResult>, Option<ProjectionError>)
where
    C: Codec + 'static,
{
    let (handle, token) = cancellation();
    let causing: Arc<Mutex<Option<ProjectionError>>> = Arc::new(Mutex::new(None));

    let tasks: Vec<(String, JoinHandle<ProjectionResult>)> = projections
        .into_iter()
        .map(|mut projection| {
            let name = projection.name.clone();
            let token = token.clone();
            let handle = handle.clone();
            let causing = Arc::clone(&causing);
            let task = tokio::spawn(async move {
                let result = projection.run_to_end(&token).await;
                if let Some(error) = &result.error {
                    if cancel_on_error && !matches!(error, ProjectionError::Cancelled) {
                        handle.cancel();
                        let mut causing = causing.lock().expect("race error lock poisoned");
                        if causing.is_none() {
                            *causing = Some(error.clone());
                        }
                    }
                }
                result
            });
            (name, task)
        })
        .collect();

    let mut results = Vec::with_capacity(tasks.len());
    for (name, task) in tasks {
        match task.await {
            Ok(result) => results.push(result),
            Err(_) => results.push(ProjectionResult {
                name,
                error: Some(ProjectionError::Panicked),
                last_handled_event: None,
            }),
        }
    }

    let causing = causing.lock().expect("race error lock poisoned").take();
    (results, causing)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{
        aggregate::{Aggregate, AggregateRoot},
        codec::JsonCodec,
        event::EventRecord,
        register::EventRegistrator,
        store::{EventStore, inmemory},
    };

    #[derive(Debug, Serialize, Deserialize)]
    struct Born {
        name: String,
    }

    #[derive(Default)]
    struct Person {
        root: AggregateRoot,
    }

    impl Aggregate for Person {
        fn root(&self) -> &AggregateRoot {
            &self.root
        }

        fn root_mut(&mut self) -> &mut AggregateRoot {
            &mut self.root
        }

        fn transition(&mut self, _event: &Event) {}

        fn register_events<C: Codec>(registrator: &mut EventRegistrator<'_, C>) {
            registrator.event::<Born>();
        }
    }

    fn record(version: Version, reason: &str) -> EventRecord {
        EventRecord {
            aggregate_id: "p1".to_string(),
            aggregate_type: "Person".to_string(),
            version,
            global_version: 0,
            reason: reason.to_string(),
            timestamp: Utc::now(),
            data: br#"{"name":"kalle"}"#.to_vec(),
            metadata: None,
        }
    }

    fn handler(store: &inmemory::Store) -> (Projections<JsonCodec>, FetchFn) {
        let mut register = Register::new();
        register.aggregate::<Person>();
        let projections = Projections::new(Arc::new(register), JsonCodec);

        let store = store.clone();
        let fetch: FetchFn = Box::new(move |cursor| {
            let store = store.clone();
            Box::pin(async move { store.all(cursor, 10).await })
        });
        (projections, fetch)
    }

    #[tokio::test]
    async fn run_once_advances_cursor_past_handled_events() {
        let store = inmemory::Store::new();
        store
            .save(&mut [record(1, "Born"), record(2, "Born")])
            .await
            .unwrap();

        let (mut projections, fetch) = handler(&store);
        let mut projection = projections.projection(fetch, Box::new(|_| Ok(())));

        let (ran, result) = projection.run_once().await;
        assert!(ran);
        assert!(result.error.is_none());
        assert_eq!(result.last_handled_event.unwrap().global_version(), 2);
        assert_eq!(projection.cursor(), 3);

        let (ran, _) = projection.run_once().await;
        assert!(!ran, "a drained stream must not re-deliver positions");
    }

    #[tokio::test]
    async fn strict_projection_fails_on_unregistered_reason() {
        let store = inmemory::Store::new();
        store.save(&mut [record(1, "Unknown")]).await.unwrap();

        let (mut projections, fetch) = handler(&store);
        let mut projection = projections.projection(fetch, Box::new(|_| Ok(())));

        let (_, result) = projection.run_once().await;
        assert!(matches!(
            result.error,
            Some(ProjectionError::EventNotRegistered { global_version: 1, .. })
        ));
    }

    #[tokio::test]
    async fn lenient_projection_skips_unregistered_without_stalling() {
        let store = inmemory::Store::new();
        store
            .save(&mut [record(1, "Unknown"), record(2, "Born")])
            .await
            .unwrap();

        let (mut projections, fetch) = handler(&store);
        let mut projection = projections.projection(fetch, Box::new(|_| Ok(())));
        projection.strict = false;

        let (ran, result) = projection.run_once().await;
        assert!(ran);
        assert!(result.error.is_none());
        assert_eq!(result.last_handled_event.unwrap().global_version(), 2);
        assert_eq!(projection.cursor(), 3);
    }

    #[tokio::test]
    async fn failed_callback_does_not_advance_the_cursor() {
        let store = inmemory::Store::new();
        store.save(&mut [record(1, "Born")]).await.unwrap();

        let (mut projections, fetch) = handler(&store);
        let mut projection =
            projections.projection(fetch, Box::new(|_| Err("projection rejected".into())));

        let (_, result) = projection.run_once().await;
        assert!(matches!(result.error, Some(ProjectionError::Callback(_))));
        assert_eq!(projection.cursor(), 0);
        assert!(result.last_handled_event.is_none());
    }

    #[tokio::test]
    async fn run_to_end_returns_cancelled_result() {
        let store = inmemory::Store::new();
        let (mut projections, fetch) = handler(&store);
        let mut projection = projections.projection(fetch, Box::new(|_| Ok(())));

        let (handle, token) = cancellation();
        handle.cancel();
        let result = projection.run_to_end(&token).await;
        assert!(matches!(result.error, Some(ProjectionError::Cancelled)));
    }

    #[test]
    fn projections_default_names_are_creation_indices() {
        let store = inmemory::Store::new();
        let (mut projections, fetch) = handler(&store);
        let first = projections.projection(fetch, Box::new(|_| Ok(())));

        let store2 = store.clone();
        let fetch2: FetchFn = Box::new(move |cursor| {
            let store = store2.clone();
            Box::pin(async move { store.all(cursor, 10).await })
        });
        let second = projections.projection(fetch2, Box::new(|_| Ok(())));

        assert_eq!(first.name, "0");
        assert_eq!(second.name, "1");
        assert!(first.strict);
    }
}
