//! Integration tests for the projection group lifecycle.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use eventum::{
    Aggregate, AggregateRoot, Codec, Event, EventRegistrator, EventRepository, FetchFn,
    JsonCodec, ProjectionError, Projections, Register,
    store::{EventStore, inmemory},
};
use serde::{Deserialize, Serialize};

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

fn repository() -> EventRepository<inmemory::Store> {
    let mut register = Register::new();
    register.aggregate::<Person>();
    EventRepository::new(inmemory::Store::new(), register, JsonCodec)
}

async fn seed(repo: &EventRepository<inmemory::Store>, count: usize) {
    for i in 0..count {
        let mut person = Person::default();
        repo.bind(&mut person).unwrap();
        person
            .track_change(Born {
                name: format!("person-{i}"),
            })
            .unwrap();
        repo.save(&mut person).await.unwrap();
    }
}

fn fetch_all(store: &inmemory::Store) -> FetchFn {
    let store = store.clone();
    Box::new(move |cursor| {
        let store = store.clone();
        Box::pin(async move { store.all(cursor, 10).await })
    })
}

fn counting_projections(
    repo: &EventRepository<inmemory::Store>,
    workers: usize,
) -> (Projections<JsonCodec>, Vec<eventum::Projection<JsonCodec>>, Vec<Arc<AtomicUsize>>) {
    let mut projections = Projections::new(repo.register().clone(), JsonCodec);
    let mut members = Vec::new();
    let mut counters = Vec::new();
    for _ in 0..workers {
        let counter = Arc::new(AtomicUsize::new(0));
        let sink = counter.clone();
        members.push(projections.projection(
            fetch_all(repo.store()),
            Box::new(move |_| {
                sink.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        ));
        counters.push(counter);
    }
    (projections, members, counters)
}

#[tokio::test]
async fn trigger_sync_returns_after_both_members_drain() {
    let repo = repository();
    seed(&repo, 5).await;

    let (projections, members, counters) = counting_projections(&repo, 2);
    let mut group = projections
        .group(members)
        .with_pace(Duration::from_millis(50));
    group.start();

    group.trigger_sync().await;
    for counter in &counters {
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    tokio::time::timeout(Duration::from_secs(5), group.stop())
        .await
        .expect("stop must join within bounded time");
}

#[tokio::test]
async fn stop_closes_the_error_channel_exactly_once() {
    let repo = repository();
    let (projections, members, _counters) = counting_projections(&repo, 2);
    let mut group = projections
        .group(members)
        .with_pace(Duration::from_millis(50));
    group.start();
    group.stop().await;

    // All workers are gone, so the channel is closed and stays closed.
    assert!(group.errors().recv().await.is_none());
    assert!(group.errors().recv().await.is_none());
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let repo = repository();
    seed(&repo, 1).await;

    let (projections, members, counters) = counting_projections(&repo, 1);
    let mut group = projections
        .group(members)
        .with_pace(Duration::from_millis(50));
    group.start();
    group.start();
    group.trigger_sync().await;
    assert_eq!(counters[0].load(Ordering::SeqCst), 1);

    group.stop().await;
    group.stop().await;
}

#[tokio::test]
async fn triggers_before_start_are_no_ops() {
    let repo = repository();
    let (projections, members, _counters) = counting_projections(&repo, 1);
    let group = projections.group(members);

    group.trigger_async().await;
    group.trigger_sync().await;
}

#[tokio::test]
async fn worker_errors_reach_the_error_channel() {
    let repo = repository();
    seed(&repo, 1).await;

    let mut projections = Projections::new(repo.register().clone(), JsonCodec);
    let failing = projections.projection(
        fetch_all(repo.store()),
        Box::new(|_| Err("projection backend down".into())),
    );
    let healthy_calls = Arc::new(AtomicUsize::new(0));
    let sink = healthy_calls.clone();
    let healthy = projections.projection(
        fetch_all(repo.store()),
        Box::new(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
    );

    let mut group = projections
        .group(vec![failing, healthy])
        .with_pace(Duration::from_millis(20));
    group.start();

    let error = tokio::time::timeout(Duration::from_secs(5), group.errors().recv())
        .await
        .expect("an error must arrive")
        .expect("channel still open while the group runs");
    assert!(matches!(error, ProjectionError::Callback(_)));

    // The healthy member keeps running after a peer fails.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if healthy_calls.load(Ordering::SeqCst) >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("healthy projection must make progress");

    group.stop().await;
}

#[tokio::test]
async fn trigger_async_nudges_waiting_members() {
    let repo = repository();
    let (projections, members, counters) = counting_projections(&repo, 2);
    let mut group = projections
        .group(members)
        .with_pace(Duration::from_secs(3600));
    group.start();
    // Let the initial drain of the empty stream finish.
    tokio::time::sleep(Duration::from_millis(50)).await;

    seed(&repo, 3).await;
    group.trigger_async().await;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if counters
                .iter()
                .all(|counter| counter.load(Ordering::SeqCst) == 3)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("both members must observe the triggered events");

    group.stop().await;
}
