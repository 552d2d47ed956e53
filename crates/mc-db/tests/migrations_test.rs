//! Migration smoke tests.

use mc_db::{Store, default_migrations_path};

#[tokio::test]
async fn migrations_create_all_tables() {
    let store = Store::open_in_memory().await.unwrap();
    store.migrate(default_migrations_path()).await.unwrap();

    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
    )
    .fetch_all(store.pool())
    .await
    .unwrap();
    let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();

    for expected in [
        "missions",
        "rounds",
        "plans",
        "plan_nodes",
        "work_units",
        "handoffs",
        "unit_events",
        "signals",
        "workers",
        "merge_requests",
        "snapshots",
    ] {
        assert!(names.contains(&expected), "missing table {expected}");
    }
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let store = Store::open_in_memory().await.unwrap();
    store.migrate(default_migrations_path()).await.unwrap();
    // A second run sees everything applied and does nothing.
    store.migrate(default_migrations_path()).await.unwrap();
}

#[tokio::test]
async fn file_backed_store_opens_with_wal() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("mc.db");
    let store = Store::open(&path).await.unwrap();
    store.migrate(default_migrations_path()).await.unwrap();

    let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(mode.to_lowercase(), "wal");

    let (fk,): (i64,) = sqlx::query_as("PRAGMA foreign_keys")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(fk, 1);

    store.close().await;
}
