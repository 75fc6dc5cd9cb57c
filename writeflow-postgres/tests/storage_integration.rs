//! Integration tests against a live `PostgreSQL`.
//!
//! Run with `DATABASE_URL` set and `cargo test -p writeflow-postgres -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use writeflow::event::{BoardReactionPayload, EventPayload};
use writeflow::{
    CounterTotals, EntityId, EventType, LockManager, NodeId, OutboxWriter, Snowflake, Storage,
    StorageError, UserId,
};
use writeflow_postgres::{connect, PostgresConfig, PostgresLockManager, PostgresStorage};

async fn storage() -> PostgresStorage {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL set");
    let pool = connect(&url, &PostgresConfig::default())
        .await
        .expect("postgres reachable");
    let storage = PostgresStorage::from_pool(pool);
    storage.setup_schema().await.expect("schema setup");
    storage
}

fn liked_payload(board: i64) -> EventPayload {
    EventPayload::BoardLiked(BoardReactionPayload {
        board_id: EntityId::try_new(board).unwrap(),
        user_id: UserId::try_new(7).unwrap(),
    })
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL"]
async fn outbox_append_commits_with_the_transaction() {
    let storage = Arc::new(storage().await);
    let ids = Arc::new(Snowflake::new(NodeId::try_new(5).unwrap()));
    let writer = OutboxWriter::new(Arc::clone(&storage), ids, [EventType::BoardLiked]);

    // Rolled back: no record.
    let mut uow = storage.begin().await.unwrap();
    let rolled_back_id = writer.publish(&mut uow, &liked_payload(1)).await.unwrap();
    storage.rollback(uow).await.unwrap();
    assert!(matches!(
        storage.bump_outbox_retry(rolled_back_id).await,
        Err(StorageError::RecordNotFound(_))
    ));

    // Committed: exactly one record, fetchable and deletable.
    let mut uow = storage.begin().await.unwrap();
    let committed_id = writer.publish(&mut uow, &liked_payload(1)).await.unwrap();
    storage.commit(uow).await.unwrap();

    let fetched = storage
        .fetch_relayable(Duration::ZERO, 3, 100)
        .await
        .unwrap();
    assert!(fetched.iter().any(|record| record.event_id == committed_id));

    storage.delete_outbox(committed_id).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL"]
async fn counter_deltas_apply_to_existing_rows_only() {
    let storage = storage().await;
    let entity = EntityId::try_new(920_001).unwrap();

    sqlx::query(
        "INSERT INTO counter_aggregates (entity_id, view_count, like_count)
         VALUES ($1, 0, 0)
         ON CONFLICT (entity_id) DO UPDATE SET view_count = 0, like_count = 0",
    )
    .bind(i64::from(entity))
    .execute(storage.pool())
    .await
    .unwrap();

    let mut uow = storage.begin().await.unwrap();
    let totals = storage
        .apply_counter_deltas(&mut uow, entity, 5, 2)
        .await
        .unwrap();
    assert_eq!(
        totals,
        CounterTotals {
            view_count: 5,
            like_count: 2,
        }
    );
    storage.commit(uow).await.unwrap();

    let missing = EntityId::try_new(920_404).unwrap();
    let mut uow = storage.begin().await.unwrap();
    assert!(matches!(
        storage.apply_counter_deltas(&mut uow, missing, 1, 0).await,
        Err(StorageError::EntityMissing(_))
    ));
    storage.rollback(uow).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL"]
async fn lock_admits_one_holder_at_a_time() {
    let storage = storage().await;
    let locks = PostgresLockManager::from_pool(storage.pool().clone());

    let name = "IntegrationTest_lockAdmitsOne";
    let lease = locks
        .try_acquire(name, Duration::ZERO, Duration::from_secs(30))
        .await
        .expect("first acquire");

    assert!(locks
        .try_acquire(name, Duration::ZERO, Duration::from_secs(30))
        .await
        .is_none());

    locks.release(lease).await;
    let reacquired = locks
        .try_acquire(name, Duration::ZERO, Duration::from_secs(30))
        .await;
    assert!(reacquired.is_some());
    if let Some(lease) = reacquired {
        locks.release(lease).await;
    }
}
