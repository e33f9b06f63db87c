use tokio::io::{AsyncRead, AsyncWrite};

use capstan_store_core::{BasicDerivation, DerivationOutput, StorePath, StorePathSet};

use crate::error::ProtocolError;
use crate::serialization::{Deserialize, Serialize};
use crate::version::ProtocolVersion;

impl Serialize for StorePath {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ProtocolError> {
        self.as_str().serialize(writer, version).await
    }
}

impl Deserialize for StorePath {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ProtocolError> {
        let printed = String::deserialize(reader, version).await?;
        if printed.is_empty() {
            return Err(ProtocolError::malformed("store path", "empty string"));
        }
        Ok(StorePath::new(printed))
    }
}

/// The serve-protocol layout of a build recipe: outputs as
/// `(name, path, hash_algo, hash)` tuples, then input sources, platform,
/// builder, arguments and environment pairs.
impl Serialize for BasicDerivation {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ProtocolError> {
        (self.outputs.len() as u64).serialize(writer, version).await?;
        for (name, output) in &self.outputs {
            name.serialize(writer, version).await?;
            match &output.path {
                Some(path) => path.serialize(writer, version).await?,
                None => "".serialize(writer, version).await?,
            }
            output.hash_algo.serialize(writer, version).await?;
            output.hash.serialize(writer, version).await?;
        }
        self.input_srcs.serialize(writer, version).await?;
        self.platform.serialize(writer, version).await?;
        self.builder.serialize(writer, version).await?;
        self.args.serialize(writer, version).await?;
        (self.env.len() as u64).serialize(writer, version).await?;
        for (key, value) in &self.env {
            key.serialize(writer, version).await?;
            value.serialize(writer, version).await?;
        }
        Ok(())
    }
}

impl Deserialize for BasicDerivation {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ProtocolError> {
        let mut drv = BasicDerivation::default();

        let nr_outputs = u64::deserialize(reader, version).await?;
        for _ in 0..nr_outputs {
            let name = String::deserialize(reader, version).await?;
            let printed = String::deserialize(reader, version).await?;
            let path = if printed.is_empty() {
                None
            } else {
                Some(StorePath::new(printed))
            };
            let hash_algo = String::deserialize(reader, version).await?;
            let hash = String::deserialize(reader, version).await?;
            drv.outputs.insert(
                name,
                DerivationOutput {
                    path,
                    hash_algo,
                    hash,
                },
            );
        }

        drv.input_srcs = <StorePathSet as Deserialize>::deserialize(reader, version).await?;
        drv.platform = String::deserialize(reader, version).await?;
        drv.builder = String::deserialize(reader, version).await?;
        drv.args = <Vec<String> as Deserialize>::deserialize(reader, version).await?;

        let nr_env = u64::deserialize(reader, version).await?;
        for _ in 0..nr_env {
            let key = String::deserialize(reader, version).await?;
            let value = String::deserialize(reader, version).await?;
            drv.env.insert(key, value);
        }

        // The derivation name does not travel over the wire; recover it from
        // the printed drv path if the caller needs it.
        Ok(drv)
    }
}
