//! Ranking scheduler flow: cluster-exclusive execution and snapshot
//! publication through the outbox.

use std::sync::Arc;
use std::time::Duration;

use writeflow::event::EventPayload;
use writeflow::ranking::RANKING_LOCK;
use writeflow::{
    CounterTotals, EntityId, EventEnvelope, EventType, LockManager, NodeId, OutboxWriter,
    RankingConfig, RankingMetric, RankingScheduler, Snowflake,
};
use writeflow_memory::{InMemoryLockManager, InMemoryStorage};

fn entity(id: i64) -> EntityId {
    EntityId::try_new(id).unwrap()
}

fn scheduler(
    storage: &Arc<InMemoryStorage>,
    locks: &Arc<InMemoryLockManager>,
) -> RankingScheduler<InMemoryStorage, InMemoryLockManager> {
    let ids = Arc::new(Snowflake::new(NodeId::try_new(0).unwrap()));
    let writer = Arc::new(OutboxWriter::new(
        Arc::clone(storage),
        ids,
        [EventType::RankingUpdated],
    ));
    RankingScheduler::new(
        Arc::clone(storage),
        writer,
        Arc::clone(locks),
        RankingConfig {
            top_n: 3,
            lock_at_least: Duration::ZERO,
            ..RankingConfig::default()
        },
    )
}

#[tokio::test]
async fn publishes_one_snapshot_per_nonempty_combination() {
    let storage = Arc::new(InMemoryStorage::new());
    let locks = Arc::new(InMemoryLockManager::new());
    storage.insert_aggregate(
        entity(1),
        CounterTotals {
            view_count: 30,
            like_count: 4,
        },
    );
    storage.insert_aggregate(
        entity(2),
        CounterTotals {
            view_count: 50,
            like_count: 2,
        },
    );

    let published = scheduler(&storage, &locks).run_once().await;
    // (views, likes) x (day, week).
    assert_eq!(published, 4);

    let records = storage.outbox_records();
    assert_eq!(records.len(), 4);
    assert!(records
        .iter()
        .all(|record| record.event_type == EventType::RankingUpdated));

    // Spot-check ordering of a views snapshot.
    let envelope = EventEnvelope::decode(&records[0].payload).unwrap();
    match envelope.typed_payload().unwrap() {
        EventPayload::RankingUpdated(payload) => {
            assert_eq!(payload.metric, RankingMetric::Views);
            assert_eq!(payload.entries[0].entity_id, entity(2));
            assert_eq!(payload.entries[0].score, 50);
            assert_eq!(payload.entries[1].entity_id, entity(1));
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[tokio::test]
async fn empty_rankings_publish_nothing() {
    let storage = Arc::new(InMemoryStorage::new());
    let locks = Arc::new(InMemoryLockManager::new());

    let published = scheduler(&storage, &locks).run_once().await;
    assert_eq!(published, 0);
    assert!(storage.outbox_records().is_empty());
}

#[tokio::test]
async fn tick_is_skipped_while_another_instance_holds_the_lock() {
    let storage = Arc::new(InMemoryStorage::new());
    let locks = Arc::new(InMemoryLockManager::new());
    storage.insert_aggregate(
        entity(1),
        CounterTotals {
            view_count: 10,
            like_count: 1,
        },
    );

    // Another replica is mid-run.
    let foreign_lease = locks
        .try_acquire(RANKING_LOCK, Duration::ZERO, Duration::from_secs(60))
        .await
        .expect("foreign acquire");

    let published = scheduler(&storage, &locks).run_once().await;
    assert_eq!(published, 0);
    assert!(storage.outbox_records().is_empty());

    // Once released, the next tick runs.
    locks.release(foreign_lease).await;
    let published = scheduler(&storage, &locks).run_once().await;
    assert_eq!(published, 4);
}
