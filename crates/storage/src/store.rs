//! Transactional store seam shared by the Postgres and in-memory backends.

use chrono::{DateTime, Utc};
use rebound_core::{EntitySpec, Record};
use serde::Serialize;

use crate::error::StoreError;

/// One persisted checkpoint row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct WatermarkRow {
    pub stage: String,
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

/// What a single-row upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Open a transaction with foreign keys deferred to commit.
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;

    fn backend_name(&self) -> &'static str;
}

#[async_trait::async_trait]
pub trait StoreTx: Send {
    /// `lock` takes a row lock held until commit or rollback.
    async fn read_watermark(
        &mut self,
        stage: &str,
        key: &str,
        lock: bool,
    ) -> Result<Option<WatermarkRow>, StoreError>;

    async fn write_watermark(&mut self, stage: &str, key: &str, value: &str)
        -> Result<(), StoreError>;

    async fn list_watermarks(&mut self, stage: Option<&str>)
        -> Result<Vec<WatermarkRow>, StoreError>;

    /// Insert by natural key, or update only when a non-key column differs.
    async fn upsert(&mut self, entity: &EntitySpec, record: &Record)
        -> Result<RowOutcome, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
