//! Integration tests for the PostgreSQL store.
//!
//! These need a reachable database and are ignored by default.
//!
//! Run with: `DATABASE_URL=postgres://... cargo test -p rebound-storage --test postgres_test -- --ignored`
//!
//! Each test creates its own tables (suffixed with a tag and the process id) and drops
//! them afterwards; migrations are applied by `PgStore::connect`.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use rebound_core::config::PostgresConfig;
use rebound_core::{EntitySpec, Record, ValidatedRecord};
use rebound_storage::{
    Advance, IdempotentLoader, LoadError, PgStore, Position, Stage, Store, StoreError, StoreTx,
    UnitOfWork, UpsertResult, WatermarkOrdering, WatermarkStore,
};
use sqlx::PgPool;

fn database_url() -> Option<String> {
    std::env::var("DATABASE_URL").ok().filter(|u| !u.is_empty())
}

async fn connect() -> Option<(Arc<PgStore>, PgPool)> {
    let Some(url) = database_url() else {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    };
    let config = PostgresConfig {
        url: Some(url.clone()),
        host: None,
        port: 5432,
        database: "rebound".into(),
        username: None,
        password: None,
        ssl_mode: "prefer".into(),
        max_connections: 4,
    };
    let store = PgStore::connect(&config).await.expect("connect PgStore");
    let admin = PgPool::connect(&url).await.expect("connect admin pool");
    Some((Arc::new(store), admin))
}

async fn exec(pool: &PgPool, sql: &str) {
    sqlx::query(sql).execute(pool).await.unwrap_or_else(|e| panic!("{sql}: {e}"));
}

async fn count(pool: &PgPool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT count(*) FROM \"{table}\""))
        .fetch_one(pool)
        .await
        .unwrap()
}

fn loader(store: &Arc<PgStore>) -> IdempotentLoader {
    IdempotentLoader::new(store.clone()).with_retry_delay(Duration::from_millis(10))
}

fn validated(entity: &Arc<EntitySpec>, record: Record) -> ValidatedRecord {
    ValidatedRecord { entity: Arc::clone(entity), record }
}

fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

// ── Upserts ──────────────────────────────────────────────────────────

#[tokio::test]
#[ignore]
async fn diff_aware_upsert_reports_insert_unchanged_update() {
    let Some((store, admin)) = connect().await else { return };
    let table = format!("it_scores_{}", std::process::id());
    exec(&admin, &format!("DROP TABLE IF EXISTS \"{table}\"")).await;
    exec(
        &admin,
        &format!(
            "CREATE TABLE \"{table}\" (
                id         TEXT PRIMARY KEY,
                score      INTEGER NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        ),
    )
    .await;
    let scores = EntitySpec::new(table.as_str(), ["id"], ["score"]).with_updated_at("updated_at");
    let loader = loader(&store);

    let first = loader.upsert(&scores, &Record::new().with("id", "A").with("score", 10)).await.unwrap();
    assert_eq!(first, UpsertResult { inserted: 1, updated: 0, unchanged: 0 });
    let stamp: chrono::DateTime<chrono::Utc> =
        sqlx::query_scalar(&format!("SELECT updated_at FROM \"{table}\" WHERE id = 'A'"))
            .fetch_one(&admin)
            .await
            .unwrap();

    let again = loader.upsert(&scores, &Record::new().with("id", "A").with("score", 10)).await.unwrap();
    assert_eq!(again, UpsertResult { inserted: 0, updated: 0, unchanged: 1 });
    let unchanged_stamp: chrono::DateTime<chrono::Utc> =
        sqlx::query_scalar(&format!("SELECT updated_at FROM \"{table}\" WHERE id = 'A'"))
            .fetch_one(&admin)
            .await
            .unwrap();
    assert_eq!(stamp, unchanged_stamp);

    let changed = loader.upsert(&scores, &Record::new().with("id", "A").with("score", 12)).await.unwrap();
    assert_eq!(changed, UpsertResult { inserted: 0, updated: 1, unchanged: 0 });
    let score: i32 = sqlx::query_scalar(&format!("SELECT score FROM \"{table}\" WHERE id = 'A'"))
        .fetch_one(&admin)
        .await
        .unwrap();
    assert_eq!(score, 12);
    assert_eq!(count(&admin, &table).await, 1);

    exec(&admin, &format!("DROP TABLE \"{table}\"")).await;
}

// ── Deferred foreign keys ────────────────────────────────────────────

async fn create_games_and_events(admin: &PgPool, tag: &str) -> (String, String) {
    let pid = std::process::id();
    let games = format!("it_games_{tag}_{pid}");
    let events = format!("it_events_{tag}_{pid}");
    exec(admin, &format!("DROP TABLE IF EXISTS \"{events}\"")).await;
    exec(admin, &format!("DROP TABLE IF EXISTS \"{games}\"")).await;
    exec(
        admin,
        &format!("CREATE TABLE \"{games}\" (game_id TEXT PRIMARY KEY, home_score INTEGER NOT NULL)"),
    )
    .await;
    exec(
        admin,
        &format!(
            "CREATE TABLE \"{events}\" (
                game_id  TEXT NOT NULL REFERENCES \"{games}\" (game_id) DEFERRABLE INITIALLY IMMEDIATE,
                event_no INTEGER NOT NULL,
                kind     TEXT,
                PRIMARY KEY (game_id, event_no)
            )"
        ),
    )
    .await;
    (games, events)
}

async fn drop_games_and_events(admin: &PgPool, games: &str, events: &str) {
    exec(admin, &format!("DROP TABLE IF EXISTS \"{events}\"")).await;
    exec(admin, &format!("DROP TABLE IF EXISTS \"{games}\"")).await;
}

#[tokio::test]
#[ignore]
async fn child_rows_may_precede_their_parent_within_a_unit() {
    let Some((store, admin)) = connect().await else { return };
    let (games, events) = create_games_and_events(&admin, "deferred").await;
    let game = Arc::new(EntitySpec::new(games.as_str(), ["game_id"], ["home_score"]));
    let event = Arc::new(
        EntitySpec::new(events.as_str(), ["game_id", "event_no"], ["kind"])
            .with_parent(games.as_str(), ["game_id"]),
    );

    let unit = UnitOfWork::new("game 0022400001").with_records(vec![
        validated(&event, Record::new().with("game_id", "0022400001").with("event_no", 1).with("kind", "tip")),
        validated(&event, Record::new().with("game_id", "0022400001").with("event_no", 2).with("kind", "shot")),
        validated(&game, Record::new().with("game_id", "0022400001").with("home_score", 101)),
    ]);
    let outcome = loader(&store).load_unit(&unit).await.unwrap();

    assert_eq!(outcome.result.inserted, 3);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(count(&admin, &games).await, 1);
    assert_eq!(count(&admin, &events).await, 2);

    drop_games_and_events(&admin, &games, &events).await;
}

#[tokio::test]
#[ignore]
async fn missing_parent_fails_at_commit_and_rolls_back_the_unit() {
    let Some((store, admin)) = connect().await else { return };
    let (games, events) = create_games_and_events(&admin, "orphan").await;
    let game = Arc::new(EntitySpec::new(games.as_str(), ["game_id"], ["home_score"]));
    let event = Arc::new(
        EntitySpec::new(events.as_str(), ["game_id", "event_no"], ["kind"])
            .with_parent(games.as_str(), ["game_id"]),
    );

    let unit = UnitOfWork::new("game 0022400002").with_records(vec![
        validated(&game, Record::new().with("game_id", "0022400002").with("home_score", 99)),
        validated(&event, Record::new().with("game_id", "0022400999").with("event_no", 1).with("kind", "tip")),
    ]);
    let err = loader(&store).load_unit(&unit).await.unwrap_err();

    match &err {
        LoadError::ConstraintViolation { source: StoreError::Constraint { .. }, .. } => {}
        other => panic!("expected a constraint violation, got {other:?}"),
    }
    assert!(!err.is_fatal());
    assert_eq!(count(&admin, &games).await, 0);
    assert_eq!(count(&admin, &events).await, 0);

    drop_games_and_events(&admin, &games, &events).await;
}

#[tokio::test]
#[ignore]
async fn not_null_violation_is_a_constraint_error_without_retry() {
    let Some((store, admin)) = connect().await else { return };
    let (games, events) = create_games_and_events(&admin, "notnull").await;
    let game = Arc::new(EntitySpec::new(games.as_str(), ["game_id"], ["home_score"]));

    let unit = UnitOfWork::new("games").with_records(vec![
        validated(&game, Record::new().with("game_id", "0022400003").with("home_score", 88)),
        validated(&game, Record::new().with("game_id", "0022400004").with("home_score", serde_json::Value::Null)),
    ]);
    let err = loader(&store).with_max_attempts(3).load_unit(&unit).await.unwrap_err();

    assert!(matches!(err, LoadError::ConstraintViolation { .. }), "{err:?}");
    assert_eq!(count(&admin, &games).await, 0);

    drop_games_and_events(&admin, &games, &events).await;
}

// ── Watermarks ───────────────────────────────────────────────────────

#[tokio::test]
#[ignore]
async fn watermark_advances_only_forward() {
    let Some((store, admin)) = connect().await else { return };
    let stage = Stage::new("it_backfill", WatermarkOrdering::Date);
    let key = format!("forward_{}", std::process::id());
    let watermarks = WatermarkStore::new(store.clone());

    let first = watermarks.advance(&stage, &key, &Position::Date(d("2024-01-14"))).await.unwrap();
    assert!(matches!(first, Advance::Advanced { from: None, .. }));
    let back = watermarks.advance(&stage, &key, &Position::Date(d("2024-01-07"))).await.unwrap();
    assert_eq!(back, Advance::Unchanged { current: Position::Date(d("2024-01-14")) });

    let stored = watermarks.get(&stage, &key).await.unwrap().unwrap();
    assert_eq!(stored.position, Position::Date(d("2024-01-14")));

    watermarks.force_set(&stage, &key, "2024-01-01").await.unwrap();
    let rows = watermarks.list(Some("it_backfill")).await.unwrap();
    assert!(rows.iter().any(|r| r.key == key && r.value == "2024-01-01"));

    sqlx::query("DELETE FROM ingest_watermarks WHERE stage = 'it_backfill' AND key = $1")
        .bind(&key)
        .execute(&admin)
        .await
        .unwrap();
}

#[tokio::test]
#[ignore]
async fn locked_watermark_read_serializes_concurrent_advances() {
    let Some((store, admin)) = connect().await else { return };
    let stage = Stage::new("it_backfill", WatermarkOrdering::Date);
    let key = format!("locked_{}", std::process::id());
    let watermarks = WatermarkStore::new(store.clone());
    watermarks.advance(&stage, &key, &Position::Date(d("2024-01-07"))).await.unwrap();

    let mut holder: Box<dyn StoreTx> = store.begin().await.unwrap();
    WatermarkStore::read_in(holder.as_mut(), &stage, &key, true).await.unwrap();

    let mut contender = {
        let watermarks = watermarks.clone();
        let (stage, key) = (stage.clone(), key.clone());
        tokio::spawn(async move {
            watermarks.advance(&stage, &key, &Position::Date(d("2024-01-14"))).await
        })
    };
    let blocked = tokio::time::timeout(Duration::from_millis(300), &mut contender).await;
    assert!(blocked.is_err(), "advance should wait for the row lock");

    WatermarkStore::advance_in(holder.as_mut(), &stage, &key, &Position::Date(d("2024-01-21")))
        .await
        .unwrap();
    holder.commit().await.unwrap();

    // The contender re-reads the committed row and must not move it back.
    let result = contender.await.unwrap().unwrap();
    assert_eq!(result, Advance::Unchanged { current: Position::Date(d("2024-01-21")) });
    let stored = watermarks.get(&stage, &key).await.unwrap().unwrap();
    assert_eq!(stored.position, Position::Date(d("2024-01-21")));

    sqlx::query("DELETE FROM ingest_watermarks WHERE stage = 'it_backfill' AND key = $1")
        .bind(&key)
        .execute(&admin)
        .await
        .unwrap();
}
