use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("API error: {0}")]
    Api(String),

    #[error("Source unresolvable: {0}")]
    SourceUnresolvable(String),

    #[error("Source open failed: {0}")]
    SourceOpen(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
