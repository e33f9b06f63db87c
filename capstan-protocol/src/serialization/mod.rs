pub mod compound;
pub mod primitives;

use crate::error::ProtocolError;
use crate::version::ProtocolVersion;
use tokio::io::{AsyncRead, AsyncWrite};

/// Longest byte string we accept from the wire (NAR bodies are streamed
/// separately and never pass through the codec).
pub const MAX_STRING_SIZE: u64 = 64 * 1024 * 1024;
/// Longest collection we accept from the wire.
pub const MAX_LIST_SIZE: u64 = 1024 * 1024;

#[allow(async_fn_in_trait)]
pub trait Serialize {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ProtocolError>;
}

#[allow(async_fn_in_trait)]
pub trait Deserialize: Sized {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ProtocolError>;
}
