//! Idempotent, diff-aware persistence with one transaction per unit of work.

use std::ops::{Add, AddAssign};
use std::sync::Arc;
use std::time::Duration;

use rebound_core::{EntitySpec, Record, ValidatedRecord};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{LoadError, StoreError};
use crate::store::{RowOutcome, Store, StoreTx};
use crate::watermark::{rollback_quietly, Advance, Position, Stage, WatermarkStore};

/// Counts for one persistence call; the three always sum to the number of
/// records submitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertResult {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
}

impl UpsertResult {
    pub fn record(&mut self, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Inserted => self.inserted += 1,
            RowOutcome::Updated => self.updated += 1,
            RowOutcome::Unchanged => self.unchanged += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.unchanged
    }
}

impl Add for UpsertResult {
    type Output = UpsertResult;

    fn add(self, rhs: Self) -> Self {
        Self {
            inserted: self.inserted + rhs.inserted,
            updated: self.updated + rhs.updated,
            unchanged: self.unchanged + rhs.unchanged,
        }
    }
}

impl AddAssign for UpsertResult {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Watermark advance committed atomically with a unit's data.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub stage: Stage,
    pub key: String,
    pub position: Position,
}

/// Everything that must commit together, e.g. all rows of one game.
#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    pub label: String,
    pub records: Vec<ValidatedRecord>,
    pub checkpoint: Option<Checkpoint>,
}

impl UnitOfWork {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into(), ..Default::default() }
    }

    pub fn with_records(mut self, records: Vec<ValidatedRecord>) -> Self {
        self.records = records;
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOutcome {
    pub result: UpsertResult,
    pub checkpoint: Option<Advance>,
    /// Transactions attempted, including the successful one.
    pub attempts: u32,
}

pub struct IdempotentLoader {
    store: Arc<dyn Store>,
    max_attempts: u32,
    retry_delay: Duration,
}

// Result of one transaction attempt, before retry classification.
enum AttemptError {
    Store(StoreError),
    Watermark(LoadError),
}

impl IdempotentLoader {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            max_attempts: 3,
            retry_delay: Duration::from_millis(200),
        }
    }

    /// Whole-unit attempts on transient store errors; at least 1.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Base delay between unit attempts; grows linearly per attempt.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Upsert one record in its own transaction.
    pub async fn upsert(&self, entity: &EntitySpec, record: &Record) -> Result<UpsertResult, LoadError> {
        self.upsert_batch(entity, std::slice::from_ref(record)).await
    }

    /// Upsert many records of one entity in a single transaction.
    pub async fn upsert_batch(
        &self,
        entity: &EntitySpec,
        records: &[Record],
    ) -> Result<UpsertResult, LoadError> {
        let writes: Vec<(&EntitySpec, &Record)> = records.iter().map(|r| (entity, r)).collect();
        let outcome = self.run(&entity.table, &writes, None).await?;
        Ok(outcome.result)
    }

    /// Persist a unit of work and its optional checkpoint atomically. A
    /// transient failure rolls everything back and retries the whole unit;
    /// a constraint violation is returned without retry.
    pub async fn load_unit(&self, unit: &UnitOfWork) -> Result<UnitOutcome, LoadError> {
        let writes: Vec<(&EntitySpec, &Record)> = unit
            .records
            .iter()
            .map(|r| (r.entity.as_ref(), &r.record))
            .collect();
        self.run(&unit.label, &writes, unit.checkpoint.as_ref()).await
    }

    async fn run(
        &self,
        label: &str,
        writes: &[(&EntitySpec, &Record)],
        checkpoint: Option<&Checkpoint>,
    ) -> Result<UnitOutcome, LoadError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.attempt(label, writes, checkpoint).await {
                Ok((result, advance)) => {
                    debug!(
                        unit = label,
                        attempt,
                        inserted = result.inserted,
                        updated = result.updated,
                        unchanged = result.unchanged,
                        "Unit committed"
                    );
                    return Ok(UnitOutcome { result, checkpoint: advance, attempts: attempt });
                }
                Err(AttemptError::Watermark(e)) => return Err(e),
                Err(AttemptError::Store(e)) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.retry_delay * attempt;
                    warn!(
                        unit = label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient store error, retrying unit"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(AttemptError::Store(e)) => return Err(LoadError::from_store(label, attempt, e)),
            }
        }
    }

    async fn attempt(
        &self,
        label: &str,
        writes: &[(&EntitySpec, &Record)],
        checkpoint: Option<&Checkpoint>,
    ) -> Result<(UpsertResult, Option<Advance>), AttemptError> {
        let mut tx = self.store.begin().await.map_err(AttemptError::Store)?;
        match Self::apply(tx.as_mut(), label, writes, checkpoint).await {
            Ok(done) => {
                tx.commit().await.map_err(AttemptError::Store)?;
                Ok(done)
            }
            Err(e) => {
                rollback_quietly(tx).await;
                Err(e)
            }
        }
    }

    async fn apply(
        tx: &mut dyn StoreTx,
        label: &str,
        writes: &[(&EntitySpec, &Record)],
        checkpoint: Option<&Checkpoint>,
    ) -> Result<(UpsertResult, Option<Advance>), AttemptError> {
        let mut result = UpsertResult::default();
        for (entity, record) in writes {
            let outcome = tx.upsert(entity, record).await.map_err(AttemptError::Store)?;
            result.record(outcome);
        }

        let advance = match checkpoint {
            Some(cp) => Some(
                WatermarkStore::advance_in(tx, &cp.stage, &cp.key, &cp.position)
                    .await
                    .map_err(|e| match e {
                        crate::error::WatermarkError::Store(inner) => AttemptError::Store(inner),
                        other => AttemptError::Watermark(LoadError::Watermark {
                            unit: label.to_string(),
                            source: other,
                        }),
                    })?,
            ),
            None => None,
        };
        Ok((result, advance))
    }
}
