use rebound_core::ReboundError;
use thiserror::Error;

use crate::watermark::WatermarkOrdering;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("constraint violation ({constraint}): {message}")]
    Constraint { constraint: String, message: String },

    #[error("record for '{table}' has a missing or null key column")]
    MissingKey { table: String },

    #[error("transient store error: {0}")]
    Transient(String),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Worth retrying the whole unit of work.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    /// Bad data reached the store; retrying cannot help.
    pub fn is_constraint(&self) -> bool {
        matches!(self, StoreError::Constraint { .. } | StoreError::MissingKey { .. })
    }
}

impl From<ReboundError> for StoreError {
    fn from(e: ReboundError) -> Self {
        match e {
            ReboundError::InvalidIdentifier(name) => StoreError::InvalidIdentifier(name),
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// SQLSTATE classes: 23 (integrity) is a data defect; 40001/40P01
/// (serialization, deadlock), 08 (connection) and 57P01-03 (shutdown) are
/// transient.
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
                if code.starts_with("23") {
                    StoreError::Constraint {
                        constraint: db.constraint().unwrap_or(code.as_str()).to_string(),
                        message: db.message().to_string(),
                    }
                } else if matches!(code.as_str(), "40001" | "40P01" | "57P01" | "57P02" | "57P03")
                    || code.starts_with("08")
                {
                    StoreError::Transient(format!("{code}: {}", db.message()))
                } else {
                    StoreError::Database(e.to_string())
                }
            }
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Transient(e.to_string()),
            _ => StoreError::Database(e.to_string()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatermarkError {
    /// Stored value does not parse under its stage's ordering. Fatal for the
    /// stage/key: progress is never silently reset.
    #[error("corrupt watermark {stage}/{key}: '{value}' is not a valid {ordering} position")]
    Corrupt {
        stage: String,
        key: String,
        value: String,
        ordering: WatermarkOrdering,
    },

    #[error("'{value}' is not a valid {ordering} position")]
    InvalidValue { value: String, ordering: WatermarkOrdering },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("constraint violation in {unit}: {source}")]
    ConstraintViolation { unit: String, source: StoreError },

    #[error("{unit} failed after {attempts} attempt(s): {source}")]
    TransientStoreError {
        unit: String,
        attempts: u32,
        source: StoreError,
    },

    #[error("{unit}: {source}")]
    Store { unit: String, source: StoreError },

    #[error("{unit}: {source}")]
    Watermark { unit: String, source: WatermarkError },
}

impl LoadError {
    pub(crate) fn from_store(unit: &str, attempts: u32, e: StoreError) -> Self {
        let unit = unit.to_string();
        if e.is_constraint() {
            LoadError::ConstraintViolation { unit, source: e }
        } else if e.is_transient() {
            LoadError::TransientStoreError { unit, attempts, source: e }
        } else {
            LoadError::Store { unit, source: e }
        }
    }

    /// Corrupt checkpoints and non-retryable store failures halt the job.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LoadError::Watermark { .. } | LoadError::Store { .. })
    }
}
