pub mod db;
pub mod store;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure of a store adapter. The cause is passed through untouched.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{key} not found")]
    NotFound { key: String },
    #[error("store operation on {target} failed: {source}")]
    Backend {
        target: String,
        #[source]
        source: BoxError,
    },
}

impl StoreError {
    pub fn backend(target: impl Into<String>, source: impl Into<BoxError>) -> Self {
        StoreError::Backend {
            target: target.into(),
            source: source.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}
