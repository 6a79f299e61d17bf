//! Durable `(stage, key) → position` checkpoints.
//!
//! A position is only ever moved forward under its stage's ordering, and
//! the read-modify-write happens inside the caller's transaction so the
//! checkpoint commits together with the data it guards.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::WatermarkError;
use crate::store::{Store, StoreTx, WatermarkRow};

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// How positions of a stage compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkOrdering {
    /// ISO `YYYY-MM-DD`, compared by calendar date.
    Date,
    /// Opaque identifiers compared byte-wise; ids must be fixed-width and
    /// zero-padded for this to match chronological order.
    Lexicographic,
}

impl fmt::Display for WatermarkOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatermarkOrdering::Date => f.write_str("date"),
            WatermarkOrdering::Lexicographic => f.write_str("lexicographic"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Position {
    Date(NaiveDate),
    Id(String),
}

impl Position {
    pub fn parse(ordering: WatermarkOrdering, value: &str) -> Result<Self, WatermarkError> {
        let invalid = || WatermarkError::InvalidValue { value: value.to_string(), ordering };
        match ordering {
            WatermarkOrdering::Date => NaiveDate::parse_from_str(value.trim(), DATE_FORMAT)
                .map(Position::Date)
                .map_err(|_| invalid()),
            WatermarkOrdering::Lexicographic => {
                if value.trim().is_empty() || value.trim() != value {
                    Err(invalid())
                } else {
                    Ok(Position::Id(value.to_string()))
                }
            }
        }
    }

    pub fn ordering(&self) -> WatermarkOrdering {
        match self {
            Position::Date(_) => WatermarkOrdering::Date,
            Position::Id(_) => WatermarkOrdering::Lexicographic,
        }
    }

    /// Comparison within one ordering; `None` across orderings.
    pub fn compare(&self, other: &Position) -> Option<Ordering> {
        match (self, other) {
            (Position::Date(a), Position::Date(b)) => Some(a.cmp(b)),
            (Position::Id(a), Position::Id(b)) => Some(a.as_bytes().cmp(b.as_bytes())),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Position::Date(d) => Some(*d),
            Position::Id(_) => None,
        }
    }

    pub fn as_id(&self) -> Option<&str> {
        match self {
            Position::Id(s) => Some(s),
            Position::Date(_) => None,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
            Position::Id(s) => f.write_str(s),
        }
    }
}

/// A named checkpoint stage and the ordering its positions follow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    pub ordering: WatermarkOrdering,
}

impl Stage {
    pub const SCHEDULE: &'static str = "schedule";
    pub const BACKFILL: &'static str = "backfill";

    pub fn new(name: impl Into<String>, ordering: WatermarkOrdering) -> Self {
        Self { name: name.into(), ordering }
    }

    /// `schedule` stage, date-ordered.
    pub fn schedule() -> Self {
        Self::new(Self::SCHEDULE, WatermarkOrdering::Date)
    }

    pub fn backfill(ordering: WatermarkOrdering) -> Self {
        Self::new(Self::BACKFILL, ordering)
    }
}

/// A parsed checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub stage: String,
    pub key: String,
    pub position: Position,
    pub updated_at: DateTime<Utc>,
}

impl Watermark {
    fn from_row(stage: &Stage, row: WatermarkRow) -> Result<Self, WatermarkError> {
        let position = Position::parse(stage.ordering, &row.value).map_err(|_| {
            WatermarkError::Corrupt {
                stage: row.stage.clone(),
                key: row.key.clone(),
                value: row.value.clone(),
                ordering: stage.ordering,
            }
        })?;
        Ok(Self {
            stage: row.stage,
            key: row.key,
            position,
            updated_at: row.updated_at,
        })
    }
}

/// Result of an advance attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// Moved forward from the previous position (if any).
    Advanced { from: Option<Position>, to: Position },
    /// Stored position was already at or past the requested one.
    Unchanged { current: Position },
}

#[derive(Clone)]
pub struct WatermarkStore {
    store: Arc<dyn Store>,
}

impl WatermarkStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Read inside an existing transaction. With `lock`, the row stays locked
    /// until the transaction ends.
    pub async fn read_in(
        tx: &mut dyn StoreTx,
        stage: &Stage,
        key: &str,
        lock: bool,
    ) -> Result<Option<Watermark>, WatermarkError> {
        match tx.read_watermark(&stage.name, key, lock).await? {
            Some(row) => Watermark::from_row(stage, row).map(Some),
            None => Ok(None),
        }
    }

    /// Move `(stage, key)` forward to `position` inside `tx`. Never moves it
    /// backwards; a corrupt stored value is an error, not a reset.
    pub async fn advance_in(
        tx: &mut dyn StoreTx,
        stage: &Stage,
        key: &str,
        position: &Position,
    ) -> Result<Advance, WatermarkError> {
        if position.ordering() != stage.ordering {
            return Err(WatermarkError::InvalidValue {
                value: position.to_string(),
                ordering: stage.ordering,
            });
        }

        let current = Self::read_in(tx, stage, key, true).await?;
        if let Some(current) = &current {
            if current.position.compare(position) != Some(Ordering::Less) {
                debug!(
                    stage = %stage.name,
                    key,
                    current = %current.position,
                    requested = %position,
                    "Watermark unchanged"
                );
                return Ok(Advance::Unchanged { current: current.position.clone() });
            }
        }

        tx.write_watermark(&stage.name, key, &position.to_string()).await?;
        info!(
            stage = %stage.name,
            key,
            from = current.as_ref().map(|w| w.position.to_string()).unwrap_or_default(),
            to = %position,
            "Watermark advanced"
        );
        Ok(Advance::Advanced {
            from: current.map(|w| w.position),
            to: position.clone(),
        })
    }

    /// `get(stage, key)` in its own read-only transaction.
    pub async fn get(&self, stage: &Stage, key: &str) -> Result<Option<Watermark>, WatermarkError> {
        let mut tx = self.store.begin().await?;
        let result = Self::read_in(tx.as_mut(), stage, key, false).await;
        tx.rollback().await?;
        result
    }

    /// `set(stage, key, position)` in its own transaction, monotonic.
    pub async fn advance(
        &self,
        stage: &Stage,
        key: &str,
        position: &Position,
    ) -> Result<Advance, WatermarkError> {
        let mut tx = self.store.begin().await?;
        match Self::advance_in(tx.as_mut(), stage, key, position).await {
            Ok(advance) => {
                tx.commit().await?;
                Ok(advance)
            }
            Err(e) => {
                rollback_quietly(tx).await;
                Err(e)
            }
        }
    }

    /// Operator escape hatch: overwrite the value regardless of monotonicity.
    /// The value must still parse under the stage's ordering.
    pub async fn force_set(
        &self,
        stage: &Stage,
        key: &str,
        value: &str,
    ) -> Result<Position, WatermarkError> {
        let position = Position::parse(stage.ordering, value)?;
        let mut tx = self.store.begin().await?;
        if let Err(e) = tx.write_watermark(&stage.name, key, &position.to_string()).await {
            rollback_quietly(tx).await;
            return Err(e.into());
        }
        tx.commit().await?;
        warn!(stage = %stage.name, key, value = %position, "Watermark force-set");
        Ok(position)
    }

    /// Raw rows, ordered by stage then key.
    pub async fn list(&self, stage: Option<&str>) -> Result<Vec<WatermarkRow>, WatermarkError> {
        let mut tx = self.store.begin().await?;
        let rows = tx.list_watermarks(stage).await;
        tx.rollback().await?;
        Ok(rows?)
    }
}

pub(crate) async fn rollback_quietly(tx: Box<dyn StoreTx>) {
    if let Err(e) = tx.rollback().await {
        warn!(error = %e, "Rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn date(s: &str) -> Position {
        Position::parse(WatermarkOrdering::Date, s).unwrap()
    }

    fn id(s: &str) -> Position {
        Position::parse(WatermarkOrdering::Lexicographic, s).unwrap()
    }

    fn store() -> (MemoryStore, WatermarkStore) {
        let mem = MemoryStore::new();
        let wm = WatermarkStore::new(Arc::new(mem.clone()));
        (mem, wm)
    }

    #[test]
    fn positions_compare_within_their_ordering() {
        assert_eq!(date("2024-01-07").compare(&date("2024-01-15")), Some(Ordering::Less));
        assert_eq!(id("0022400100").compare(&id("0022400099")), Some(Ordering::Greater));
        assert_eq!(date("2024-01-07").compare(&id("x")), None);
        assert!(Position::parse(WatermarkOrdering::Date, "2024-13-01").is_err());
        assert!(Position::parse(WatermarkOrdering::Lexicographic, "").is_err());
    }

    #[tokio::test]
    async fn get_absent_then_advance() {
        let (_, wm) = store();
        let stage = Stage::schedule();
        assert!(wm.get(&stage, "daily").await.unwrap().is_none());

        let adv = wm.advance(&stage, "daily", &date("2024-01-15")).await.unwrap();
        assert_eq!(adv, Advance::Advanced { from: None, to: date("2024-01-15") });
        let got = wm.get(&stage, "daily").await.unwrap().unwrap();
        assert_eq!(got.position, date("2024-01-15"));
    }

    #[tokio::test]
    async fn never_moves_backwards() {
        let (_, wm) = store();
        let stage = Stage::backfill(WatermarkOrdering::Lexicographic);
        wm.advance(&stage, "2024-25", &id("0022400200")).await.unwrap();

        let adv = wm.advance(&stage, "2024-25", &id("0022400100")).await.unwrap();
        assert_eq!(adv, Advance::Unchanged { current: id("0022400200") });
        let adv = wm.advance(&stage, "2024-25", &id("0022400200")).await.unwrap();
        assert!(matches!(adv, Advance::Unchanged { .. }));

        let got = wm.get(&stage, "2024-25").await.unwrap().unwrap();
        assert_eq!(got.position, id("0022400200"));
    }

    #[tokio::test]
    async fn corrupt_value_is_fatal_not_reset() {
        let (mem, wm) = store();
        mem.put_watermark_raw("schedule", "daily", "yesterday-ish");
        let stage = Stage::schedule();

        let err = wm.get(&stage, "daily").await.unwrap_err();
        assert!(matches!(err, WatermarkError::Corrupt { .. }));
        let err = wm.advance(&stage, "daily", &date("2024-01-15")).await.unwrap_err();
        assert!(matches!(err, WatermarkError::Corrupt { .. }));
        // Still the corrupt value: nothing was overwritten.
        assert_eq!(mem.watermark_value("schedule", "daily").as_deref(), Some("yesterday-ish"));
    }

    #[tokio::test]
    async fn force_set_moves_backwards_but_validates() {
        let (_, wm) = store();
        let stage = Stage::schedule();
        wm.advance(&stage, "daily", &date("2024-03-01")).await.unwrap();

        wm.force_set(&stage, "daily", "2024-01-01").await.unwrap();
        let got = wm.get(&stage, "daily").await.unwrap().unwrap();
        assert_eq!(got.position, date("2024-01-01"));

        let err = wm.force_set(&stage, "daily", "not-a-date").await.unwrap_err();
        assert!(matches!(err, WatermarkError::InvalidValue { .. }));
    }

    #[tokio::test]
    async fn mismatched_ordering_is_rejected() {
        let (_, wm) = store();
        let err = wm
            .advance(&Stage::schedule(), "daily", &id("0022400001"))
            .await
            .unwrap_err();
        assert!(matches!(err, WatermarkError::InvalidValue { .. }));
    }

    #[tokio::test]
    async fn list_filters_by_stage() {
        let (_, wm) = store();
        wm.advance(&Stage::schedule(), "daily", &date("2024-01-15")).await.unwrap();
        let backfill = Stage::backfill(WatermarkOrdering::Date);
        wm.advance(&backfill, "2023-24", &date("2024-01-07")).await.unwrap();
        wm.advance(&backfill, "2024-25", &date("2024-11-07")).await.unwrap();

        assert_eq!(wm.list(None).await.unwrap().len(), 3);
        let rows = wm.list(Some("backfill")).await.unwrap();
        assert_eq!(rows.iter().map(|r| r.key.as_str()).collect::<Vec<_>>(), vec!["2023-24", "2024-25"]);
    }
}
