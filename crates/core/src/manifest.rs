//! TOML source manifest: where to discover entity ids for a date range, which
//! endpoints to fetch per id, and the entity catalog those rows load into.
//!
//! ```toml
//! [source]
//! name = "league-stats"
//!
//! [listing]
//! url = "https://stats.example/games?from={start}&to={end}"
//! ids = "/games"
//! id_field = "game_id"
//!
//! [[endpoints]]
//! url = "https://stats.example/games/{id}/summary"
//! entity = "games"
//! rows = "/game"
//!
//! [[entities]]
//! table = "games"
//! key = ["game_id"]
//! columns = ["game_date", "home_team", "away_team", "home_score", "away_score"]
//! updated_at = "updated_at"
//! ```

use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ReboundError;
use crate::record::EntitySpec;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceManifest {
    pub source: SourceInfo,
    pub listing: ListingSpec,
    #[serde(default)]
    pub endpoints: Vec<EndpointSpec>,
    #[serde(default)]
    pub entities: Vec<EntitySpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceInfo {
    pub name: String,
}

/// Discovery call for one chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingSpec {
    /// URL template with `{start}` and `{end}` (ISO dates).
    pub url: String,
    /// JSON pointer to the array of ids (or of objects carrying `id_field`).
    pub ids: String,
    #[serde(default)]
    pub id_field: Option<String>,
}

/// Per-entity-id fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// URL template with `{id}`.
    pub url: String,
    /// Target entity table.
    pub entity: String,
    /// JSON pointer to the row object or array of row objects.
    #[serde(default)]
    pub rows: String,
}

impl SourceManifest {
    pub fn from_toml(toml_str: &str) -> Result<Self, ReboundError> {
        let manifest: Self =
            toml::from_str(toml_str).map_err(|e| ReboundError::Manifest(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ReboundError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
            .map_err(|e| ReboundError::Manifest(format!("{}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<(), ReboundError> {
        if !self.listing.url.contains("{start}") || !self.listing.url.contains("{end}") {
            return Err(ReboundError::Manifest(
                "listing.url must contain {start} and {end}".to_string(),
            ));
        }
        if self.endpoints.is_empty() {
            return Err(ReboundError::Manifest("no [[endpoints]] declared".to_string()));
        }

        let catalog = self.catalog();
        if catalog.len() != self.entities.len() {
            return Err(ReboundError::Manifest("duplicate entity table".to_string()));
        }
        for entity in &self.entities {
            entity.validate_identifiers()?;
            for parent in &entity.parents {
                let target = catalog.get(&parent.table).ok_or_else(|| {
                    ReboundError::Manifest(format!(
                        "entity '{}' references unknown parent '{}'",
                        entity.table, parent.table
                    ))
                })?;
                if target.key.len() != parent.columns.len() {
                    return Err(ReboundError::Manifest(format!(
                        "entity '{}': reference to '{}' needs {} column(s)",
                        entity.table,
                        parent.table,
                        target.key.len()
                    )));
                }
            }
        }
        for endpoint in &self.endpoints {
            if !endpoint.url.contains("{id}") {
                return Err(ReboundError::Manifest(format!(
                    "endpoint '{}' must contain {{id}}",
                    endpoint.url
                )));
            }
            if !catalog.contains_key(&endpoint.entity) {
                return Err(ReboundError::Manifest(format!(
                    "endpoint '{}' targets unknown entity '{}'",
                    endpoint.url, endpoint.entity
                )));
            }
        }
        Ok(())
    }

    /// Entity descriptors keyed by table name.
    pub fn catalog(&self) -> IndexMap<String, Arc<EntitySpec>> {
        self.entities
            .iter()
            .map(|e| (e.table.clone(), Arc::new(e.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
[source]
name = "league"

[listing]
url = "http://api/games?from={start}&to={end}"
ids = "/games"
id_field = "game_id"

[[endpoints]]
url = "http://api/games/{id}"
entity = "games"
rows = "/game"

[[endpoints]]
url = "http://api/games/{id}/events"
entity = "events"
rows = "/events"

[[entities]]
table = "games"
key = ["game_id"]
columns = ["home_score", "away_score"]
updated_at = "updated_at"

[[entities]]
table = "events"
key = ["game_id", "event_num"]
columns = ["kind"]

[[entities.parents]]
table = "games"
columns = ["game_id"]
"#;

    #[test]
    fn parses_full_manifest() {
        let m = SourceManifest::from_toml(MANIFEST).unwrap();
        assert_eq!(m.source.name, "league");
        assert_eq!(m.endpoints.len(), 2);
        let catalog = m.catalog();
        assert_eq!(catalog["events"].parents[0].table, "games");
        assert_eq!(catalog["games"].updated_at.as_deref(), Some("updated_at"));
    }

    #[test]
    fn rejects_endpoint_for_unknown_entity() {
        let bad = MANIFEST.replace("entity = \"events\"", "entity = \"plays\"");
        let err = SourceManifest::from_toml(&bad).unwrap_err();
        assert!(err.to_string().contains("unknown entity 'plays'"));
    }

    #[test]
    fn rejects_parent_arity_mismatch() {
        let bad = MANIFEST.replace(
            "columns = [\"game_id\"]\n",
            "columns = [\"game_id\", \"event_num\"]\n",
        );
        assert!(SourceManifest::from_toml(&bad).is_err());
    }

    #[test]
    fn rejects_listing_without_placeholders() {
        let bad = MANIFEST.replace("?from={start}&to={end}", "");
        assert!(SourceManifest::from_toml(&bad).is_err());
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.toml");
        std::fs::write(&path, MANIFEST).unwrap();
        assert!(SourceManifest::from_file(&path).is_ok());
    }
}
