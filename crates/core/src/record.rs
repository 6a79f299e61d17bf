//! Flat column → value records and the entity descriptors that give them
//! a natural key.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ReboundError;

/// Column name → JSON value, in insertion order.
pub type Fields = IndexMap<String, Value>;

/// One row destined for an entity table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: Fields,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: Fields) -> Self {
        Self { fields }
    }

    /// Builder-style setter.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(column.into(), value.into());
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn into_fields(self) -> Fields {
        self.fields
    }
}

/// Canonical, hashable form of a natural key (JSON array of the key values).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey(String);

impl NaturalKey {
    pub fn from_values<'a>(values: impl IntoIterator<Item = &'a Value>) -> Self {
        let values: Vec<&Value> = values.into_iter().collect();
        // Serializing a Vec<&Value> cannot fail.
        Self(serde_json::to_string(&values).unwrap_or_default())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Child columns that reference a parent table's natural key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentRef {
    pub table: String,
    /// Child columns, in the order of the parent's key columns.
    pub columns: Vec<String>,
}

/// Describes one entity table: its natural key and the columns the loader
/// compares when deciding whether an update is needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySpec {
    pub table: String,
    /// Natural key columns.
    pub key: Vec<String>,
    /// Non-key columns.
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub parents: Vec<ParentRef>,
    /// Timestamp column bumped only when a row actually changes.
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl EntitySpec {
    pub fn new(
        table: impl Into<String>,
        key: impl IntoIterator<Item = impl Into<String>>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            table: table.into(),
            key: key.into_iter().map(Into::into).collect(),
            columns: columns.into_iter().map(Into::into).collect(),
            parents: Vec::new(),
            updated_at: None,
        }
    }

    pub fn with_parent(
        mut self,
        table: impl Into<String>,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.parents.push(ParentRef {
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn with_updated_at(mut self, column: impl Into<String>) -> Self {
        self.updated_at = Some(column.into());
        self
    }

    /// Key columns followed by non-key columns.
    pub fn all_columns(&self) -> impl Iterator<Item = &String> {
        self.key.iter().chain(self.columns.iter())
    }

    pub fn is_key_column(&self, column: &str) -> bool {
        self.key.iter().any(|k| k == column)
    }

    pub fn is_known_column(&self, column: &str) -> bool {
        self.is_key_column(column) || self.columns.iter().any(|c| c == column)
    }

    /// Natural key of `record`, or `None` when a key column is missing or null.
    pub fn natural_key(&self, record: &Record) -> Option<NaturalKey> {
        let mut values = Vec::with_capacity(self.key.len());
        for column in &self.key {
            match record.get(column) {
                None | Some(Value::Null) => return None,
                Some(v) => values.push(v),
            }
        }
        Some(NaturalKey::from_values(values))
    }

    /// Key of the parent row `record` points at; `None` if any referencing
    /// column is null (a null reference is not checked).
    pub fn parent_key(&self, parent: &ParentRef, record: &Record) -> Option<NaturalKey> {
        let mut values = Vec::with_capacity(parent.columns.len());
        for column in &parent.columns {
            match record.get(column) {
                None | Some(Value::Null) => return None,
                Some(v) => values.push(v),
            }
        }
        Some(NaturalKey::from_values(values))
    }

    /// True when at least one non-key column of `incoming` differs from
    /// `stored`. Absent columns compare as null.
    pub fn differs(&self, stored: &Record, incoming: &Record) -> bool {
        self.columns.iter().any(|column| {
            let old = stored.get(column).unwrap_or(&Value::Null);
            let new = incoming.get(column).unwrap_or(&Value::Null);
            old != new
        })
    }

    /// Every table and column name must be a plain SQL identifier.
    pub fn validate_identifiers(&self) -> Result<(), ReboundError> {
        let parent_names = self
            .parents
            .iter()
            .flat_map(|p| std::iter::once(&p.table).chain(p.columns.iter()));
        std::iter::once(&self.table)
            .chain(self.all_columns())
            .chain(parent_names)
            .chain(self.updated_at.iter())
            .try_for_each(|name| check_identifier(name))?;

        if self.key.is_empty() {
            return Err(ReboundError::Manifest(format!(
                "entity '{}' declares no key columns",
                self.table
            )));
        }
        Ok(())
    }
}

/// Accepts `[A-Za-z_][A-Za-z0-9_]*`.
pub fn check_identifier(name: &str) -> Result<(), ReboundError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ReboundError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn games() -> EntitySpec {
        EntitySpec::new("games", ["game_id"], ["season", "home_score", "away_score"])
    }

    #[test]
    fn natural_key_requires_all_key_columns() {
        let spec = EntitySpec::new("events", ["game_id", "event_num"], ["kind"]);
        let full = Record::new().with("game_id", "0022400001").with("event_num", 3);
        let partial = Record::new().with("game_id", "0022400001");
        let null_key = Record::new().with("game_id", "0022400001").with("event_num", Value::Null);

        assert_eq!(spec.natural_key(&full).unwrap().as_str(), r#"["0022400001",3]"#);
        assert!(spec.natural_key(&partial).is_none());
        assert!(spec.natural_key(&null_key).is_none());
    }

    #[test]
    fn differs_ignores_key_columns_and_treats_missing_as_null() {
        let spec = games();
        let stored = Record::new().with("game_id", "A").with("home_score", 10);
        let same = Record::new().with("game_id", "A").with("home_score", 10).with("season", Value::Null);
        let changed = Record::new().with("game_id", "A").with("home_score", 12);

        assert!(!spec.differs(&stored, &same));
        assert!(spec.differs(&stored, &changed));
    }

    #[test]
    fn parent_key_matches_parent_natural_key() {
        let parent = games();
        let child = EntitySpec::new("events", ["game_id", "event_num"], ["kind"])
            .with_parent("games", ["game_id"]);
        let game = Record::new().with("game_id", "A");
        let event = Record::new().with("game_id", "A").with("event_num", 1);

        let pk = parent.natural_key(&game).unwrap();
        let fk = child.parent_key(&child.parents[0], &event).unwrap();
        assert_eq!(pk, fk);
    }

    #[test]
    fn identifiers_are_checked() {
        assert!(games().validate_identifiers().is_ok());
        let bad = EntitySpec::new("games; drop table x", ["game_id"], Vec::<String>::new());
        assert!(matches!(bad.validate_identifiers(), Err(ReboundError::InvalidIdentifier(_))));
        let keyless = EntitySpec::new("games", Vec::<String>::new(), ["a"]);
        assert!(matches!(keyless.validate_identifiers(), Err(ReboundError::Manifest(_))));
        assert!(check_identifier("_ok9").is_ok());
        assert!(check_identifier("9bad").is_err());
    }

    #[test]
    fn record_serializes_as_plain_object() {
        let r = Record::new().with("game_id", "A").with("home_score", 10);
        assert_eq!(serde_json::to_value(&r).unwrap(), json!({"game_id": "A", "home_score": 10}));
    }
}
