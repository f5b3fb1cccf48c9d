//! Error types for elohim-files

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FileError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid content hash: {0}")]
    InvalidHash(String),

    #[error("Malformed frame: {0}")]
    Frame(String),

    #[error("Upstream fetch failed: {0}")]
    Upstream(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Catalog error: {0}")]
    Catalog(#[from] sled::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FileError {
    /// Whether the error means "no such file" rather than a fault
    pub fn is_not_found(&self) -> bool {
        match self {
            FileError::NotFound(_) => true,
            FileError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for FileError {
    fn from(err: reqwest::Error) -> Self {
        FileError::Upstream(err.to_string())
    }
}
