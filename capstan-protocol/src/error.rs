use thiserror::Error;

use crate::version::ProtocolVersion;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid magic number: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },

    #[error("unsupported peer version {server} (want {min} through {max})")]
    IncompatibleVersion {
        server: ProtocolVersion,
        min: ProtocolVersion,
        max: ProtocolVersion,
    },

    #[error("string too long: {length} exceeds maximum {max}")]
    StringTooLong { length: u64, max: u64 },

    #[error("list too long: {length} exceeds maximum {max}")]
    ListTooLong { length: u64, max: u64 },

    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },

    #[error("peer reported an error: {message}")]
    Remote { message: String },
}

impl ProtocolError {
    pub fn malformed(what: &'static str, detail: impl ToString) -> Self {
        Self::Malformed {
            what,
            detail: detail.to_string(),
        }
    }
}

/// Helper trait for attaching context to IO errors.
pub trait IoErrorContext<T> {
    fn io_context(self, context: impl Into<String>) -> Result<T, ProtocolError>;
}

impl<T> IoErrorContext<T> for std::io::Result<T> {
    fn io_context(self, context: impl Into<String>) -> Result<T, ProtocolError> {
        self.map_err(|source| ProtocolError::Io {
            context: context.into(),
            source,
        })
    }
}
