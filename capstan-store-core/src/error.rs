use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid store path '{0}'")]
    InvalidPath(String),

    #[error("invalid hash '{input}': {reason}")]
    InvalidHash { input: String, reason: String },

    #[error("path '{0}' is not valid")]
    PathNotValid(String),

    #[error("cannot read derivation '{0}'")]
    MissingDerivation(String),

    #[error("NAR hash mismatch for '{path}': expected {expected}, got {actual}")]
    HashMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("NAR size mismatch for '{path}': expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },
}

impl StoreError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Helper trait for attaching context to IO errors.
pub trait IoStoreContext<T> {
    fn store_context(self, context: impl Into<String>) -> Result<T, StoreError>;
}

impl<T> IoStoreContext<T> for std::io::Result<T> {
    fn store_context(self, context: impl Into<String>) -> Result<T, StoreError> {
        self.map_err(|e| StoreError::io(context, e))
    }
}
