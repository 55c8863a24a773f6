use thiserror::Error;

/// Errors surfaced by a family store.
///
/// Asynchronous writes never return `Transaction` to the submitter; those
/// failures are logged by the write serializer and the job is dropped.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("failed to set up store for family '{family}': {source:#}")]
    Setup {
        family: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("transaction failed: {0:#}")]
    Transaction(#[from] anyhow::Error),

    #[error("store for family '{0}' is closed")]
    Closed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
            || matches!(self, StoreError::Storage(rusqlite::Error::QueryReturnedNoRows))
    }
}
