use thiserror::Error;

use capstan_nar::NarFormatError;
use capstan_protocol::ProtocolError;
use capstan_ssh_store::SessionError;
use capstan_store_core::StoreError;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("step cancelled")]
    Cancelled,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker returned info for '{path}', which is not a requested output")]
    UnexpectedPathInfo { path: String },

    #[error("NAR stream for '{path}' is malformed: {source}")]
    Nar {
        path: String,
        #[source]
        source: NarFormatError,
    },
}

impl DispatchError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the queue may retry the step after this failure. Transport
    /// and protocol trouble is retryable; a full disk is not, and a
    /// cancelled step must not come back.
    pub fn can_retry(&self) -> bool {
        fn disk_full(source: &std::io::Error) -> bool {
            source.kind() == std::io::ErrorKind::StorageFull
        }
        match self {
            DispatchError::Cancelled => false,
            DispatchError::Io { source, .. } => !disk_full(source),
            DispatchError::Store(StoreError::Io { source, .. }) => !disk_full(source),
            _ => true,
        }
    }
}
