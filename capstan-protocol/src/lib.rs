//! The serve-protocol codec.
//!
//! A length-prefixed, little-endian, 8-byte-aligned typed stream carrying
//! integers, padded byte strings, sequences and sets. Optional fields are
//! gated on the peer's negotiated minor version; see [`ProtocolVersion`].

pub mod build_result;
pub mod command;
pub mod error;
pub mod realisation;
pub mod serialization;
pub mod version;

pub use build_result::{BuildResult, BuildStatus};
pub use command::ServeCommand;
pub use error::{IoErrorContext, ProtocolError};
pub use realisation::{DrvOutput, Realisation};
pub use serialization::{Deserialize, Serialize};
pub use version::{
    ProtocolVersion, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION, SERVE_MAGIC_1, SERVE_MAGIC_2,
};

/// Export-stream framing magic used when uploading paths to peers that
/// predate the add-NAR record (serve minor < 5).
pub const EXPORT_MAGIC: u64 = 0x4558494e;
