//! Catalog-driven validation: binds extracted rows to their entity and
//! normalizes them to the entity's declared columns.

use std::sync::Arc;

use indexmap::IndexMap;
use rebound_core::{
    DomainRecord, EntitySpec, Record, Transformer, Validated, ValidatedRecord, ValidationError,
    ValidationWarning,
};
use serde_json::Value;

pub struct CatalogTransformer {
    catalog: IndexMap<String, Arc<EntitySpec>>,
}

impl CatalogTransformer {
    pub fn new(catalog: IndexMap<String, Arc<EntitySpec>>) -> Self {
        Self { catalog }
    }
}

impl Transformer for CatalogTransformer {
    /// Unknown entities and missing or null key columns are errors. Columns
    /// the entity does not declare are dropped and declared columns absent
    /// from the row become `null`; both produce a warning.
    fn transform(&self, record: DomainRecord) -> Result<Validated, ValidationError> {
        let entity = self.catalog.get(&record.entity).ok_or_else(|| {
            ValidationError::new("unknown_entity", format!("no entity named '{}'", record.entity))
        })?;

        for column in &entity.key {
            match record.fields.get(column) {
                None | Some(Value::Null) => {
                    return Err(ValidationError::new(
                        "missing_key",
                        format!("{}.{column} is missing or null", entity.table),
                    ))
                }
                Some(Value::Object(_)) | Some(Value::Array(_)) => {
                    return Err(ValidationError::new(
                        "invalid_key",
                        format!("{}.{column} must be a scalar", entity.table),
                    ))
                }
                Some(_) => {}
            }
        }

        let mut fields = record.fields.into_fields();
        let mut normalized = Record::new();
        let mut missing = Vec::new();
        for column in entity.all_columns() {
            match fields.shift_remove(column) {
                Some(value) => normalized.set(column.clone(), value),
                None => {
                    missing.push(column.as_str());
                    normalized.set(column.clone(), Value::Null);
                }
            }
        }
        if let Some(stamp) = &entity.updated_at {
            fields.shift_remove(stamp);
        }

        let mut warnings = Vec::new();
        if !missing.is_empty() {
            warnings.push(ValidationWarning::new(
                "missing_column",
                format!("{}: {} set to null", entity.table, missing.join(", ")),
            ));
        }
        if !fields.is_empty() {
            let dropped: Vec<&str> = fields.keys().map(String::as_str).collect();
            warnings.push(ValidationWarning::new(
                "unknown_column",
                format!("{}: dropped {}", entity.table, dropped.join(", ")),
            ));
        }

        Ok(Validated {
            record: ValidatedRecord { entity: entity.clone(), record: normalized },
            warnings,
        })
    }
}
