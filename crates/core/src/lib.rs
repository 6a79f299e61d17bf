pub mod config;
pub mod contracts;
pub mod error;
pub mod manifest;
pub mod record;
pub mod season;

pub use config::{BackfillMarker, Config};
pub use contracts::*;
pub use error::*;
pub use record::*;
pub use manifest::SourceManifest;
pub use season::Season;
