use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReboundError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Invalid season '{0}': expected YYYY-YY")]
    InvalidSeason(String),

    #[error("Invalid identifier '{0}': must match [A-Za-z_][A-Za-z0-9_]*")]
    InvalidIdentifier(String),

    #[error("{0}")]
    Other(String),
}
