use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::AsyncWrite;

use crate::error::ProtocolError;
use crate::serialization::Serialize;
use crate::version::ProtocolVersion;

/// Commands understood by a serve-protocol worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum ServeCommand {
    QueryValidPaths = 1,
    QueryPathInfos = 2,
    DumpStorePath = 3,
    ImportPaths = 4,
    ExportPaths = 5,
    BuildPaths = 6,
    QueryClosure = 7,
    BuildDerivation = 8,
    AddToStoreNar = 9,
}

impl Serialize for ServeCommand {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ProtocolError> {
        u64::from(*self).serialize(writer, version).await
    }
}
