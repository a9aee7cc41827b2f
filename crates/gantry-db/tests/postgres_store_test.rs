//! Store-contract tests against PostgreSQL.
//!
//! Ignored by default: they need Docker (testcontainers) or an external
//! server via `GANTRY_TEST_PG_URL`. Run with `cargo test -- --ignored`.
//! Each test creates a uniquely-named database with migrations applied and
//! drops it on completion.

use chrono::{Duration, Utc};
use uuid::Uuid;

use gantry_db::models::{OperationFilter, OperationKind, OperationState};
use gantry_db::postgres::{PgOperationStore, PgOrchestrationStore};
use gantry_db::store::{OperationStore, OrchestrationStore, StoreError};

use gantry_test_utils::{
    create_test_db, drop_test_db, provision_operation, upgrade_orchestration,
    upgrade_runtime_operation,
};

#[tokio::test]
#[ignore = "requires a running PostgreSQL (docker or GANTRY_TEST_PG_URL)"]
async fn insert_update_roundtrip() {
    let (pool, db_name) = create_test_db().await;
    let store = PgOperationStore::new(pool.clone());

    let op = provision_operation("inst-1", "azure");
    let id = op.id;
    store.insert(op).await.unwrap();

    let mut loaded = store.get(id).await.unwrap();
    assert_eq!(loaded.state, OperationState::Pending);
    assert_eq!(loaded.version, 0);

    loaded.state = OperationState::InProgress;
    loaded.progress.insert("create_runtime".into(), Utc::now());
    loaded.updated_at = Utc::now();
    let updated = store.update(loaded).await.unwrap();
    assert_eq!(updated.version, 1);

    let reloaded = store.get(id).await.unwrap();
    assert_eq!(reloaded.state, OperationState::InProgress);
    assert!(reloaded.progress.contains_key("create_runtime"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (docker or GANTRY_TEST_PG_URL)"]
async fn stale_update_reports_conflict() {
    let (pool, db_name) = create_test_db().await;
    let store = PgOperationStore::new(pool.clone());

    let op = provision_operation("inst-1", "azure");
    let id = op.id;
    store.insert(op).await.unwrap();

    let first = store.get(id).await.unwrap();
    let second = store.get(id).await.unwrap();

    store.update(first).await.unwrap();
    match store.update(second).await {
        Err(StoreError::Conflict(conflicted)) => assert_eq!(conflicted, id),
        other => panic!("expected Conflict, got {other:?}"),
    }

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (docker or GANTRY_TEST_PG_URL)"]
async fn unfinished_listing_sorted_by_creation() {
    let (pool, db_name) = create_test_db().await;
    let store = PgOperationStore::new(pool.clone());

    let mut older = provision_operation("inst-old", "azure");
    older.created_at = Utc::now() - Duration::minutes(10);
    let older_id = older.id;
    let newer = provision_operation("inst-new", "azure");
    let newer_id = newer.id;

    store.insert(newer).await.unwrap();
    store.insert(older).await.unwrap();

    let unfinished = store
        .list_not_finished_by_kind(OperationKind::Provision)
        .await
        .unwrap();
    let ids: Vec<Uuid> = unfinished.iter().map(|op| op.id).collect();
    assert_eq!(ids, vec![older_id, newer_id]);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (docker or GANTRY_TEST_PG_URL)"]
async fn children_page_counts_match_memory_contract() {
    let (pool, db_name) = create_test_db().await;
    let store = PgOperationStore::new(pool.clone());
    let orchestration_id = Uuid::new_v4();

    for i in 0..4 {
        let mut child = upgrade_runtime_operation(orchestration_id, Uuid::new_v4());
        child.created_at = Utc::now() - Duration::minutes(10 - i);
        if i == 0 {
            child.state = OperationState::InProgress;
        }
        store.insert(child).await.unwrap();
    }

    let page = store
        .list_by_orchestration(orchestration_id, OperationFilter::default())
        .await
        .unwrap();
    assert_eq!(page.total, 4);
    assert_eq!(page.in_progress, 1);

    let paged = store
        .list_by_orchestration(
            orchestration_id,
            OperationFilter {
                page: Some(2),
                page_size: Some(3),
                ..OperationFilter::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(paged.operations.len(), 1);
    assert_eq!(paged.total, 4);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (docker or GANTRY_TEST_PG_URL)"]
async fn orchestration_roundtrip_preserves_parameters() {
    let (pool, db_name) = create_test_db().await;
    let store = PgOrchestrationStore::new(pool.clone());

    let orchestration = upgrade_orchestration(5);
    let id = orchestration.id;
    store.insert(orchestration).await.unwrap();

    let loaded = store.get(id).await.unwrap();
    assert_eq!(loaded.parameters.parallelism, 5);
    assert!(loaded.parameters.targets.include_all);
    assert_eq!(loaded.parameters.target_version, "2.5.0");
    assert_eq!(loaded.counters.total(), 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}
