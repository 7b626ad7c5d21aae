use thiserror::Error;

#[derive(Error, Debug)]
pub enum DocmapError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Permission denied: {operation} is not allowed on '{entity}'")]
    Permission { entity: String, operation: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    #[error("Store failure: {0}")]
    StoreFailure(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl DocmapError {
    pub(crate) fn permission(entity: &str, operation: &str) -> Self {
        DocmapError::Permission {
            entity: entity.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Configuration and permission errors are raised before any store I/O.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            DocmapError::Configuration(_) | DocmapError::Permission { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DocmapError>;
