//! In-process store used for dry runs and tests.
//!
//! Each transaction writes to a private overlay that is merged on commit.
//! Parent references are checked at commit time, mirroring deferred foreign
//! keys, and a locked watermark read that was overtaken by another commit
//! fails the commit as a serialization conflict.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use indexmap::IndexMap;
use rebound_core::{EntitySpec, NaturalKey, Record};
use serde_json::Value;

use crate::error::StoreError;
use crate::store::{RowOutcome, Store, StoreTx, WatermarkRow};

#[derive(Debug, Clone)]
struct StoredRow {
    record: Record,
    /// Bumped on every committed write.
    version: u64,
}

#[derive(Debug, Clone)]
struct StoredWatermark {
    row: WatermarkRow,
    version: u64,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, IndexMap<NaturalKey, StoredRow>>,
    watermarks: BTreeMap<(String, String), StoredWatermark>,
    watermark_version: u64,
}

#[derive(Debug, Default)]
struct Faults {
    /// Next N commits that carry row writes fail as transient.
    transient_commits: u32,
    /// Next N watermark writes fail as non-retryable database errors.
    watermark_writes: u32,
}

#[derive(Debug, Default)]
struct Stats {
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    row_writes: AtomicUsize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    faults: Arc<Mutex<Faults>>,
    stats: Arc<Stats>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicked test thread must not wedge every other caller.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Fault injection ───────────────────────────────────────

    pub fn fail_next_commits(&self, n: u32) {
        lock(&self.faults).transient_commits = n;
    }

    pub fn fail_next_watermark_writes(&self, n: u32) {
        lock(&self.faults).watermark_writes = n;
    }

    // ── Inspection ────────────────────────────────────────────

    pub fn commits(&self) -> usize {
        self.stats.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.stats.rollbacks.load(Ordering::SeqCst)
    }

    /// Committed inserts plus updates that changed a row.
    pub fn row_writes(&self) -> usize {
        self.stats.row_writes.load(Ordering::SeqCst)
    }

    pub fn row_count(&self, table: &str) -> usize {
        lock(&self.state).tables.get(table).map(|t| t.len()).unwrap_or(0)
    }

    /// Committed row whose natural key matches `key_of`.
    pub fn row(&self, entity: &EntitySpec, key_of: &Record) -> Option<Record> {
        let key = entity.natural_key(key_of)?;
        lock(&self.state)
            .tables
            .get(&entity.table)
            .and_then(|t| t.get(&key))
            .map(|r| r.record.clone())
    }

    pub fn row_version(&self, entity: &EntitySpec, key_of: &Record) -> Option<u64> {
        let key = entity.natural_key(key_of)?;
        lock(&self.state)
            .tables
            .get(&entity.table)
            .and_then(|t| t.get(&key))
            .map(|r| r.version)
    }

    pub fn watermark_value(&self, stage: &str, key: &str) -> Option<String> {
        lock(&self.state)
            .watermarks
            .get(&(stage.to_string(), key.to_string()))
            .map(|w| w.row.value.clone())
    }

    /// Write a watermark bypassing validation, as an operator editing the
    /// table by hand would.
    pub fn put_watermark_raw(&self, stage: &str, key: &str, value: &str) {
        let mut state = lock(&self.state);
        state.watermark_version += 1;
        let version = state.watermark_version;
        state.watermarks.insert(
            (stage.to_string(), key.to_string()),
            StoredWatermark {
                row: WatermarkRow {
                    stage: stage.to_string(),
                    key: key.to_string(),
                    value: value.to_string(),
                    updated_at: Utc::now(),
                },
                version,
            },
        );
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        Ok(Box::new(MemoryTx {
            store: self.clone(),
            rows: IndexMap::new(),
            entities: HashMap::new(),
            watermarks: BTreeMap::new(),
            locked: HashMap::new(),
        }))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryTx {
    store: MemoryStore,
    /// table → key → incoming row (overlay).
    rows: IndexMap<String, IndexMap<NaturalKey, Record>>,
    entities: HashMap<String, EntitySpec>,
    watermarks: BTreeMap<(String, String), String>,
    /// Watermark versions observed by locking reads (None = absent).
    locked: HashMap<(String, String), Option<u64>>,
}

impl MemoryTx {
    /// Row as the store will hold it: key and declared columns only, absent
    /// columns as null.
    fn project(entity: &EntitySpec, record: &Record) -> Record {
        let mut out = Record::new();
        for column in entity.all_columns() {
            out.set(column.clone(), record.get(column).cloned().unwrap_or(Value::Null));
        }
        out
    }

    fn check_parents(&self, state: &State) -> Result<(), StoreError> {
        for (table, rows) in &self.rows {
            let Some(entity) = self.entities.get(table) else { continue };
            for parent in &entity.parents {
                for record in rows.values() {
                    let Some(parent_key) = entity.parent_key(parent, record) else { continue };
                    let pending = self
                        .rows
                        .get(&parent.table)
                        .is_some_and(|t| t.contains_key(&parent_key));
                    let committed = state
                        .tables
                        .get(&parent.table)
                        .is_some_and(|t| t.contains_key(&parent_key));
                    if !pending && !committed {
                        return Err(StoreError::Constraint {
                            constraint: format!("{}_{}_fkey", table, parent.table),
                            message: format!(
                                "key {} is not present in table \"{}\"",
                                parent_key, parent.table
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StoreTx for MemoryTx {
    async fn read_watermark(
        &mut self,
        stage: &str,
        key: &str,
        lock_row: bool,
    ) -> Result<Option<WatermarkRow>, StoreError> {
        let id = (stage.to_string(), key.to_string());
        let state = lock(&self.store.state);
        let committed = state.watermarks.get(&id).cloned();
        drop(state);

        if lock_row {
            self.locked
                .entry(id.clone())
                .or_insert(committed.as_ref().map(|w| w.version));
        }
        if let Some(value) = self.watermarks.get(&id) {
            return Ok(Some(WatermarkRow {
                stage: stage.to_string(),
                key: key.to_string(),
                value: value.clone(),
                updated_at: Utc::now(),
            }));
        }
        Ok(committed.map(|w| w.row))
    }

    async fn write_watermark(&mut self, stage: &str, key: &str, value: &str) -> Result<(), StoreError> {
        {
            let mut faults = lock(&self.store.faults);
            if faults.watermark_writes > 0 {
                faults.watermark_writes -= 1;
                return Err(StoreError::Database("injected watermark write failure".into()));
            }
        }
        self.watermarks.insert((stage.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn list_watermarks(&mut self, stage: Option<&str>) -> Result<Vec<WatermarkRow>, StoreError> {
        let state = lock(&self.store.state);
        Ok(state
            .watermarks
            .values()
            .filter(|w| stage.map_or(true, |s| w.row.stage == s))
            .map(|w| w.row.clone())
            .collect())
    }

    async fn upsert(&mut self, entity: &EntitySpec, record: &Record) -> Result<RowOutcome, StoreError> {
        entity.validate_identifiers()?;
        let key = entity
            .natural_key(record)
            .ok_or_else(|| StoreError::MissingKey { table: entity.table.clone() })?;
        let incoming = Self::project(entity, record);

        let existing = match self.rows.get(&entity.table).and_then(|t| t.get(&key)) {
            Some(pending) => Some(pending.clone()),
            None => lock(&self.store.state)
                .tables
                .get(&entity.table)
                .and_then(|t| t.get(&key))
                .map(|r| r.record.clone()),
        };

        let outcome = match existing {
            None => RowOutcome::Inserted,
            Some(stored) if entity.differs(&stored, &incoming) => RowOutcome::Updated,
            Some(_) => return Ok(RowOutcome::Unchanged),
        };

        self.entities
            .entry(entity.table.clone())
            .or_insert_with(|| entity.clone());
        self.rows
            .entry(entity.table.clone())
            .or_default()
            .insert(key, incoming);
        Ok(outcome)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let tx = *self;
        let store = tx.store.clone();

        if !tx.rows.is_empty() {
            let mut faults = lock(&store.faults);
            if faults.transient_commits > 0 {
                faults.transient_commits -= 1;
                store.stats.rollbacks.fetch_add(1, Ordering::SeqCst);
                return Err(StoreError::Transient("injected connection reset".into()));
            }
        }

        let mut state = lock(&store.state);
        for (id, seen) in &tx.locked {
            let now = state.watermarks.get(id).map(|w| w.version);
            if now != *seen {
                store.stats.rollbacks.fetch_add(1, Ordering::SeqCst);
                return Err(StoreError::Transient(
                    "could not serialize access due to concurrent update".into(),
                ));
            }
        }
        if let Err(e) = tx.check_parents(&state) {
            store.stats.rollbacks.fetch_add(1, Ordering::SeqCst);
            return Err(e);
        }

        let MemoryTx { rows, entities, watermarks, .. } = tx;
        let mut writes = 0;
        for (table, table_rows) in rows {
            let stamp = entities.get(&table).and_then(|e| e.updated_at.clone());
            let stored = state.tables.entry(table).or_default();
            for (key, mut record) in table_rows {
                let version = stored.get(&key).map(|r| r.version + 1).unwrap_or(1);
                if let Some(column) = &stamp {
                    record.set(column.clone(), Value::String(Utc::now().to_rfc3339()));
                }
                stored.insert(key, StoredRow { record, version });
                writes += 1;
            }
        }
        for ((stage, key), value) in watermarks {
            state.watermark_version += 1;
            let version = state.watermark_version;
            state.watermarks.insert(
                (stage.clone(), key.clone()),
                StoredWatermark {
                    row: WatermarkRow { stage, key, value, updated_at: Utc::now() },
                    version,
                },
            );
        }
        drop(state);

        store.stats.row_writes.fetch_add(writes, Ordering::SeqCst);
        store.stats.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.store.stats.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
