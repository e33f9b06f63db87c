use thiserror::Error;

use capstan_protocol::ProtocolError;
use capstan_store_core::StoreError;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start remote worker: {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker has no stdio pipes")]
    MissingPipes,

    #[error("remote rejected path '{path}'")]
    UploadRejected { path: String },
}

impl SessionError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
