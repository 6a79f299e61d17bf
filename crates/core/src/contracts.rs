//! Contracts for the collaborators the engine drives but does not implement:
//! payload extraction and record validation.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::{EntitySpec, Record};

/// Body of a successful fetch, as handed to an [`Extractor`].
#[derive(Debug, Clone)]
pub struct RawPayload {
    pub url: String,
    pub status: u16,
    pub body: Bytes,
}

impl RawPayload {
    pub fn json(&self) -> Result<serde_json::Value, MalformedPayload> {
        serde_json::from_slice(&self.body)
            .map_err(|e| MalformedPayload(format!("{}: invalid JSON: {e}", self.url)))
    }
}

/// A record pulled out of a payload, not yet validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRecord {
    /// Target entity (table) name.
    pub entity: String,
    pub fields: Record,
}

impl DomainRecord {
    pub fn new(entity: impl Into<String>, fields: Record) -> Self {
        Self { entity: entity.into(), fields }
    }
}

/// A record that passed validation and is bound to its entity descriptor.
#[derive(Debug, Clone)]
pub struct ValidatedRecord {
    pub entity: Arc<EntitySpec>,
    pub record: Record,
}

/// Outcome of a successful transform: the record plus any recoverable
/// quality issues found along the way.
#[derive(Debug, Clone)]
pub struct Validated {
    pub record: ValidatedRecord,
    pub warnings: Vec<ValidationWarning>,
}

impl Validated {
    pub fn clean(record: ValidatedRecord) -> Self {
        Self { record, warnings: Vec::new() }
    }
}

/// Recoverable issue: the record proceeds with a fallback value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub kind: String,
    pub detail: String,
}

impl ValidationWarning {
    pub fn new(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { kind: kind.into(), detail: detail.into() }
    }
}

/// Unrecoverable validation failure; the record is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {detail}")]
pub struct ValidationError {
    pub kind: String,
    pub detail: String,
}

impl ValidationError {
    pub fn new(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { kind: kind.into(), detail: detail.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed payload: {0}")]
pub struct MalformedPayload(pub String);

/// Turns a raw payload into domain records. Pure, no I/O.
pub trait Extractor: Send + Sync {
    fn extract(&self, payload: &RawPayload) -> Result<Vec<DomainRecord>, MalformedPayload>;
}

/// Validates a domain record against business rules.
pub trait Transformer: Send + Sync {
    fn transform(&self, record: DomainRecord) -> Result<Validated, ValidationError>;
}
