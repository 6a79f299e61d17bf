//! PostgreSQL store.
//!
//! Rows are upserted through `jsonb_populate_record`, so a record's JSON
//! values are cast by the target table's own column types. Updates carry an
//! `IS DISTINCT FROM` guard and report what happened via `xmax = 0`.

use rebound_core::config::PostgresConfig;
use rebound_core::{check_identifier, EntitySpec, Record};
use sqlx::postgres::{PgPoolOptions, Postgres};
use sqlx::types::Json;
use sqlx::{PgPool, Transaction};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::{RowOutcome, Store, StoreTx, WatermarkRow};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect and apply pending migrations.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect(&config.database_url())
            .await?;
        info!(host = %config.host(), database = %config.database, "PostgreSQL connected");

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(format!("migrations failed: {e}")))?;
        info!("Database migrations applied successfully");

        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET CONSTRAINTS ALL DEFERRED")
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgTx { tx }))
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl StoreTx for PgTx {
    async fn read_watermark(
        &mut self,
        stage: &str,
        key: &str,
        lock: bool,
    ) -> Result<Option<WatermarkRow>, StoreError> {
        let sql = if lock {
            "SELECT stage, key, value, updated_at FROM ingest_watermarks
             WHERE stage = $1 AND key = $2 FOR UPDATE"
        } else {
            "SELECT stage, key, value, updated_at FROM ingest_watermarks
             WHERE stage = $1 AND key = $2"
        };
        let row = sqlx::query_as::<_, WatermarkRow>(sql)
            .bind(stage)
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row)
    }

    async fn write_watermark(&mut self, stage: &str, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO ingest_watermarks (stage, key, value, updated_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (stage, key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(stage)
        .bind(key)
        .bind(value)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn list_watermarks(&mut self, stage: Option<&str>) -> Result<Vec<WatermarkRow>, StoreError> {
        let rows = sqlx::query_as::<_, WatermarkRow>(
            "SELECT stage, key, value, updated_at FROM ingest_watermarks
             WHERE ($1::text IS NULL OR stage = $1)
             ORDER BY stage, key",
        )
        .bind(stage)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(rows)
    }

    async fn upsert(&mut self, entity: &EntitySpec, record: &Record) -> Result<RowOutcome, StoreError> {
        if entity.natural_key(record).is_none() {
            return Err(StoreError::MissingKey { table: entity.table.clone() });
        }
        let sql = upsert_sql(entity)?;
        let inserted: Option<bool> = sqlx::query_scalar(&sql)
            .bind(Json(record.fields()))
            .fetch_optional(&mut *self.tx)
            .await?;
        let outcome = match inserted {
            Some(true) => RowOutcome::Inserted,
            Some(false) => RowOutcome::Updated,
            None => RowOutcome::Unchanged,
        };
        debug!(table = %entity.table, ?outcome, "Upsert");
        Ok(outcome)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn quote(ident: &str) -> Result<String, StoreError> {
    check_identifier(ident)?;
    Ok(format!("\"{ident}\""))
}

/// Diff-aware upsert statement for `entity`, taking the record as `$1::jsonb`.
/// Returns one row (`inserted` bool) when a row was written, none when the
/// stored row already matched.
pub fn upsert_sql(entity: &EntitySpec) -> Result<String, StoreError> {
    let table = quote(&entity.table)?;
    let key = entity.key.iter().map(|c| quote(c)).collect::<Result<Vec<_>, _>>()?;
    let cols = entity.columns.iter().map(|c| quote(c)).collect::<Result<Vec<_>, _>>()?;
    if key.is_empty() {
        return Err(StoreError::MissingKey { table: entity.table.clone() });
    }
    let all: Vec<&str> = key.iter().chain(cols.iter()).map(String::as_str).collect();
    let all = all.join(", ");

    let mut sql = format!(
        "INSERT INTO {table} ({all}) SELECT {all} FROM jsonb_populate_record(NULL::{table}, $1) \
         ON CONFLICT ({}) ",
        key.join(", ")
    );
    if cols.is_empty() {
        sql.push_str("DO NOTHING");
    } else {
        let mut assignments: Vec<String> =
            cols.iter().map(|c| format!("{c} = EXCLUDED.{c}")).collect();
        if let Some(stamp) = &entity.updated_at {
            assignments.push(format!("{} = now()", quote(stamp)?));
        }
        let stored: Vec<String> = cols.iter().map(|c| format!("{table}.{c}")).collect();
        let incoming: Vec<String> = cols.iter().map(|c| format!("EXCLUDED.{c}")).collect();
        sql.push_str(&format!(
            "DO UPDATE SET {} WHERE ({}) IS DISTINCT FROM ({})",
            assignments.join(", "),
            stored.join(", "),
            incoming.join(", ")
        ));
    }
    sql.push_str(" RETURNING (xmax = 0) AS inserted");
    Ok(sql)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_sql_guards_updates_with_is_distinct_from() {
        let games = EntitySpec::new("games", ["game_id"], ["home_score", "away_score"])
            .with_updated_at("updated_at");
        let sql = upsert_sql(&games).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO \"games\" (\"game_id\", \"home_score\", \"away_score\") \
             SELECT \"game_id\", \"home_score\", \"away_score\" \
             FROM jsonb_populate_record(NULL::\"games\", $1) \
             ON CONFLICT (\"game_id\") DO UPDATE SET \
             \"home_score\" = EXCLUDED.\"home_score\", \"away_score\" = EXCLUDED.\"away_score\", \
             \"updated_at\" = now() \
             WHERE (\"games\".\"home_score\", \"games\".\"away_score\") \
             IS DISTINCT FROM (EXCLUDED.\"home_score\", EXCLUDED.\"away_score\") \
             RETURNING (xmax = 0) AS inserted"
        );
    }

    #[test]
    fn key_only_entity_does_nothing_on_conflict() {
        let teams = EntitySpec::new("team_seasons", ["team_id", "season"], Vec::<String>::new());
        let sql = upsert_sql(&teams).unwrap();
        assert!(sql.contains("ON CONFLICT (\"team_id\", \"season\") DO NOTHING RETURNING"));
    }

    #[test]
    fn rejects_unsafe_identifiers() {
        let bad = EntitySpec::new("games", ["game_id"], ["score\"; drop table games; --"]);
        assert!(matches!(upsert_sql(&bad), Err(StoreError::InvalidIdentifier(_))));
    }
}
