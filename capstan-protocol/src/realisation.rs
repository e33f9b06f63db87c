//! Realisations: which concrete store path a derivation output resolved to.

use std::fmt;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite};

use capstan_store_core::StorePath;

use crate::error::ProtocolError;
use crate::serialization::{Deserialize, Serialize};
use crate::version::ProtocolVersion;

/// Key of a derivation output: `<drv hash>!<output name>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DrvOutput {
    pub drv_hash: String,
    pub output_name: String,
}

impl fmt::Display for DrvOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.drv_hash, self.output_name)
    }
}

impl FromStr for DrvOutput {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (drv_hash, output_name) = s
            .split_once('!')
            .ok_or_else(|| ProtocolError::malformed("drv output", format!("missing '!': {s}")))?;
        if drv_hash.is_empty() || output_name.is_empty() {
            return Err(ProtocolError::malformed("drv output", s));
        }
        Ok(Self {
            drv_hash: drv_hash.to_string(),
            output_name: output_name.to_string(),
        })
    }
}

impl serde::Serialize for DrvOutput {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for DrvOutput {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A single realised output. Travels over the wire as a JSON document.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Realisation {
    pub id: DrvOutput,
    pub out_path: StorePath,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<String>,
}

impl Serialize for DrvOutput {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ProtocolError> {
        self.to_string().serialize(writer, version).await
    }
}

impl Deserialize for DrvOutput {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ProtocolError> {
        String::deserialize(reader, version).await?.parse()
    }
}

impl Serialize for Realisation {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ProtocolError> {
        let json = serde_json::to_string(self)
            .map_err(|e| ProtocolError::malformed("realisation", e))?;
        json.serialize(writer, version).await
    }
}

impl Deserialize for Realisation {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ProtocolError> {
        let json = String::deserialize(reader, version).await?;
        serde_json::from_str(&json).map_err(|e| ProtocolError::malformed("realisation", e))
    }
}
