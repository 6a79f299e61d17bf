//! Where entity identifiers and their payloads come from.
//!
//! A [`Source`] describes requests and parses responses; it never performs
//! I/O itself. The scheduler sends every request through the shared
//! rate-limited [`rebound_connector::FetchClient`].

use std::sync::Arc;

use indexmap::IndexSet;
use rebound_connector::FetchRequest;
use rebound_core::manifest::{EndpointSpec, SourceManifest};
use rebound_core::{DomainRecord, Extractor, MalformedPayload, RawPayload, Record};
use serde_json::Value;

use crate::chunk::Chunk;

/// One per-entity fetch and the extractor for its payload.
#[derive(Clone)]
pub struct EntityRequest {
    pub request: FetchRequest,
    pub extractor: Arc<dyn Extractor>,
}

pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    /// Discovery request listing the entity ids inside `chunk`.
    fn listing_request(&self, chunk: &Chunk) -> FetchRequest;

    /// Entity ids from a listing response, deduplicated in listing order.
    fn parse_listing(&self, payload: &RawPayload) -> Result<Vec<String>, MalformedPayload>;

    /// Everything to fetch for one entity id. All resulting records load
    /// as one unit of work.
    fn entity_requests(&self, id: &str) -> Vec<EntityRequest>;
}

// ── Manifest-driven JSON source ─────────────────────────────────

/// [`Source`] over a JSON HTTP API described by a [`SourceManifest`].
pub struct JsonSource {
    name: String,
    listing_url: String,
    ids_pointer: String,
    id_field: Option<String>,
    endpoints: Vec<(String, Arc<dyn Extractor>)>,
}

impl JsonSource {
    pub fn from_manifest(manifest: &SourceManifest) -> Self {
        Self {
            name: manifest.source.name.clone(),
            listing_url: manifest.listing.url.clone(),
            ids_pointer: manifest.listing.ids.clone(),
            id_field: manifest.listing.id_field.clone(),
            endpoints: manifest
                .endpoints
                .iter()
                .map(|e| (e.url.clone(), Arc::new(JsonRows::from_endpoint(e)) as Arc<dyn Extractor>))
                .collect(),
        }
    }

    fn request(&self, url: String) -> FetchRequest {
        FetchRequest::get(url).header("Accept", "application/json")
    }
}

impl Source for JsonSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn listing_request(&self, chunk: &Chunk) -> FetchRequest {
        let url = self
            .listing_url
            .replace("{start}", &chunk.start.to_string())
            .replace("{end}", &chunk.end.to_string());
        self.request(url)
    }

    fn parse_listing(&self, payload: &RawPayload) -> Result<Vec<String>, MalformedPayload> {
        let json = payload.json()?;
        let items = match json.pointer(&self.ids_pointer) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) => return Ok(Vec::new()),
            Some(_) => {
                return Err(MalformedPayload(format!(
                    "{}: '{}' is not an array",
                    payload.url, self.ids_pointer
                )))
            }
            None => {
                return Err(MalformedPayload(format!(
                    "{}: no value at '{}'",
                    payload.url, self.ids_pointer
                )))
            }
        };

        let mut ids = IndexSet::new();
        for item in items {
            let value = match (&self.id_field, item) {
                (Some(field), Value::Object(obj)) => obj.get(field),
                (_, other) => Some(other),
            };
            match value.and_then(id_string) {
                Some(id) => {
                    ids.insert(id);
                }
                None => {
                    return Err(MalformedPayload(format!(
                        "{}: listing entry {item} has no usable id",
                        payload.url
                    )))
                }
            }
        }
        Ok(ids.into_iter().collect())
    }

    fn entity_requests(&self, id: &str) -> Vec<EntityRequest> {
        self.endpoints
            .iter()
            .map(|(template, extractor)| EntityRequest {
                request: self.request(template.replace("{id}", id)),
                extractor: extractor.clone(),
            })
            .collect()
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Rows of one entity found at a JSON pointer: an object is one row, an
/// array of objects is many, `null` is none.
pub struct JsonRows {
    entity: String,
    pointer: String,
}

impl JsonRows {
    pub fn new(entity: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self { entity: entity.into(), pointer: pointer.into() }
    }

    pub fn from_endpoint(endpoint: &EndpointSpec) -> Self {
        Self::new(endpoint.entity.clone(), endpoint.rows.clone())
    }

    fn row(&self, payload: &RawPayload, value: Value) -> Result<DomainRecord, MalformedPayload> {
        match value {
            Value::Object(obj) => Ok(DomainRecord::new(
                self.entity.clone(),
                Record::from_fields(obj.into_iter().collect()),
            )),
            other => Err(MalformedPayload(format!(
                "{}: expected a {} row object, got {other}",
                payload.url, self.entity
            ))),
        }
    }
}

impl Extractor for JsonRows {
    fn extract(&self, payload: &RawPayload) -> Result<Vec<DomainRecord>, MalformedPayload> {
        let mut json = payload.json()?;
        let value = json
            .pointer_mut(&self.pointer)
            .map(Value::take)
            .ok_or_else(|| MalformedPayload(format!("{}: no value at '{}'", payload.url, self.pointer)))?;
        match value {
            Value::Null => Ok(Vec::new()),
            Value::Array(rows) => rows.into_iter().map(|row| self.row(payload, row)).collect(),
            row => Ok(vec![self.row(payload, row)?]),
        }
    }
}
