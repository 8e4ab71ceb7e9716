//! Integration tests against a live Postgres instance.
//!
//! Gated on `TRAWL_TEST_DATABASE_URL`; every test returns early when the
//! variable is unset so the suite stays green without a database. Each
//! test works on its own table and pipe names, so tests can run in
//! parallel against one database.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{json, Map, Value};
use trawl_core::data::{AlertType, Data};
use trawl_store::postgres::{connect, PgStore};
use trawl_store::Store;

async fn test_store() -> Option<PgStore> {
    let url = std::env::var("TRAWL_TEST_DATABASE_URL").ok()?;
    let pool = connect(&url).await.expect("connecting to the test database");
    Some(PgStore::new(pool))
}

async fn fresh_table(store: &PgStore, table: &str) {
    sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
        .execute(store.pool())
        .await
        .expect("dropping test table");
    store
        .setup_schema(&[table.to_string()])
        .await
        .expect("setting up schema");
}

async fn insert_row(store: &PgStore, table: &str, id: &str, target: &str, payload: Value) {
    sqlx::query(&format!(
        "INSERT INTO {table} (id, asset, target, pipe, data) VALUES ($1, $1, $2, 'manual', $3)"
    ))
    .bind(id)
    .bind(target)
    .bind(payload)
    .execute(store.pool())
    .await
    .expect("seeding test row");
}

fn ids(rows: &[Data]) -> Vec<&str> {
    let mut ids: Vec<&str> = rows.iter().map(|row| row.id.as_str()).collect();
    ids.sort();
    ids
}

fn no_filter() -> BTreeMap<String, String> {
    BTreeMap::new()
}

fn no_threshold() -> BTreeMap<String, f64> {
    BTreeMap::new()
}

#[tokio::test]
async fn schema_setup_is_idempotent() {
    let Some(store) = test_store().await else { return };

    let tables = vec!["t_schema_domains".to_string(), "t_schema_services".to_string()];
    store.setup_schema(&tables).await.expect("first setup");
    store.setup_schema(&tables).await.expect("second setup");

    for table in ["t_schema_domains", "t_schema_services", "tasks", "alerts", "blocked"] {
        assert!(
            store.table_exists(table).await.expect("querying catalog"),
            "table {table} missing"
        );
    }
}

#[tokio::test]
async fn should_run_reflects_task_markers() {
    let Some(store) = test_store().await else { return };
    store.setup_schema(&[]).await.expect("schema");

    let pipe = "p_shouldrun";
    let ident = "shouldrun.example.com";

    assert!(store
        .should_run(pipe, ident, Duration::from_secs(3600))
        .await
        .unwrap());

    store.add_task(pipe, ident, None).await.expect("adding task");

    assert!(!store
        .should_run(pipe, ident, Duration::from_secs(3600))
        .await
        .unwrap());
    // a zero interval never hides anything
    assert!(store
        .should_run(pipe, ident, Duration::ZERO)
        .await
        .unwrap());
    // other pipes and idents are unaffected
    assert!(store
        .should_run("p_shouldrun_other", ident, Duration::from_secs(3600))
        .await
        .unwrap());
    assert!(store
        .should_run(pipe, "other.example.com", Duration::from_secs(3600))
        .await
        .unwrap());
}

#[tokio::test]
async fn retrieve_skips_excluded_rows() {
    let Some(store) = test_store().await else { return };
    let table = "t_retrieve_excluded";
    fresh_table(&store, table).await;

    insert_row(&store, table, "keep.example.com", "acme", json!({})).await;
    insert_row(&store, table, "drop.example.com", "acme", json!({})).await;
    sqlx::query(&format!(
        "UPDATE {table} SET exclude = TRUE WHERE id = 'drop.example.com'"
    ))
    .execute(store.pool())
    .await
    .unwrap();

    let rows = store
        .retrieve(table, "p_excl", &no_filter(), &no_threshold(), Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(ids(&rows), vec!["keep.example.com"]);
}

#[tokio::test]
async fn retrieve_hides_rows_with_recent_task_for_same_pipe_only() {
    let Some(store) = test_store().await else { return };
    let table = "t_retrieve_interval";
    fresh_table(&store, table).await;

    insert_row(&store, table, "host.example.com", "acme", json!({})).await;

    let pipe = "p_interval";
    let interval = Duration::from_secs(60);

    let rows = store
        .retrieve(table, pipe, &no_filter(), &no_threshold(), interval)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1, "row selectable before any task exists");

    store.add_task(pipe, "host.example.com", None).await.unwrap();
    let rows = store
        .retrieve(table, pipe, &no_filter(), &no_threshold(), interval)
        .await
        .unwrap();
    assert!(rows.is_empty(), "recent task hides the row");

    // a different pipe's task must not hide the row
    let rows = store
        .retrieve(table, "p_interval_other", &no_filter(), &no_threshold(), interval)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);

    // a different ident's task must not hide the row
    store
        .add_task("p_interval_third", "unrelated.example.com", None)
        .await
        .unwrap();
    let rows = store
        .retrieve(table, "p_interval_third", &no_filter(), &no_threshold(), interval)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn retrieve_applies_json_filter_equality() {
    let Some(store) = test_store().await else { return };
    let table = "t_retrieve_filter";
    fresh_table(&store, table).await;

    insert_row(&store, table, "a.example.com", "acme", json!({"proto": "https"})).await;
    insert_row(&store, table, "b.example.com", "acme", json!({"proto": "http"})).await;

    let mut filter = BTreeMap::new();
    filter.insert("proto".to_string(), "https".to_string());

    let rows = store
        .retrieve(table, "p_filter", &filter, &no_threshold(), Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(ids(&rows), vec!["a.example.com"]);
}

#[tokio::test]
async fn retrieve_applies_numeric_threshold() {
    let Some(store) = test_store().await else { return };
    let table = "t_retrieve_threshold";
    fresh_table(&store, table).await;

    insert_row(&store, table, "hi.example.com", "acme", json!({"score": 9})).await;
    insert_row(&store, table, "lo.example.com", "acme", json!({"score": 3})).await;

    let mut threshold = BTreeMap::new();
    threshold.insert("score".to_string(), 5.0);

    let rows = store
        .retrieve(table, "p_threshold", &no_filter(), &threshold, Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(ids(&rows), vec!["hi.example.com"]);
}

#[tokio::test]
async fn retrieve_by_target_scopes_rows() {
    let Some(store) = test_store().await else { return };
    let table = "t_retrieve_target";
    fresh_table(&store, table).await;

    insert_row(&store, table, "a.one.example.com", "one", json!({})).await;
    insert_row(&store, table, "b.one.example.com", "one", json!({})).await;
    insert_row(&store, table, "c.two.example.com", "two", json!({})).await;

    let rows = store
        .retrieve_by_target(table, &no_filter(), "one")
        .await
        .unwrap();
    assert_eq!(ids(&rows), vec!["a.one.example.com", "b.one.example.com"]);
}

#[tokio::test]
async fn save_is_insert_or_ignore() {
    let Some(store) = test_store().await else { return };
    let table = "t_save_ignore";
    fresh_table(&store, table).await;

    let data = Data {
        id: "seed".to_string(),
        asset: "seed.example.com".to_string(),
        target: "acme".to_string(),
        ..Default::default()
    };

    let inserted = store
        .save(table, "p_save", "new.example.com", &data, Map::new())
        .await
        .unwrap();
    assert!(inserted);

    let inserted = store
        .save(table, "p_save", "new.example.com", &data, Map::new())
        .await
        .unwrap();
    assert!(!inserted, "duplicate id must be ignored");

    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn save_overrides_asset_and_strips_it_from_payload() {
    let Some(store) = test_store().await else { return };
    let table = "t_save_override";
    fresh_table(&store, table).await;

    let data = Data {
        id: "seed".to_string(),
        asset: "input.example.com".to_string(),
        target: "acme".to_string(),
        ..Default::default()
    };

    let mut result = Map::new();
    result.insert("asset".to_string(), json!("rendered.example.com"));
    result.insert("port".to_string(), json!("443"));

    assert!(store
        .save(table, "p_override", "svc.example.com", &data, result)
        .await
        .unwrap());

    let (asset, payload): (String, Value) = sqlx::query_as(&format!(
        "SELECT asset, data FROM {table} WHERE id = 'svc.example.com'"
    ))
    .fetch_one(store.pool())
    .await
    .unwrap();

    assert_eq!(asset, "rendered.example.com");
    assert_eq!(payload, json!({"port": "443"}));
}

#[tokio::test]
async fn alerts_and_blocklist_round_trip() {
    let Some(store) = test_store().await else { return };
    store.setup_schema(&[]).await.unwrap();

    store
        .save_alert("p_alerts", "alert.example.com", "new asset", AlertType::Created)
        .await
        .unwrap();

    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM alerts WHERE pipe = 'p_alerts' AND type = 'CREATED'",
    )
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert!(count >= 1);

    sqlx::query("INSERT INTO blocked (domain) VALUES ('blocked.example.com') ON CONFLICT DO NOTHING")
        .execute(store.pool())
        .await
        .unwrap();
    let blocked = store.retrieve_blocked().await.unwrap();
    assert!(blocked.iter().any(|d| d == "blocked.example.com"));
}
