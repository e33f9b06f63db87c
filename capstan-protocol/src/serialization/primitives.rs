use std::collections::{BTreeMap, BTreeSet};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{IoErrorContext, ProtocolError};
use crate::serialization::{Deserialize, Serialize, MAX_LIST_SIZE, MAX_STRING_SIZE};
use crate::version::ProtocolVersion;

const ZEROS: [u8; 8] = [0u8; 8];

/// Bytes of zero padding after a `len`-byte string.
pub const fn padding(len: u64) -> usize {
    (len.wrapping_neg() & 7) as usize
}

impl Serialize for u64 {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        _version: ProtocolVersion,
    ) -> Result<(), ProtocolError> {
        writer
            .write_all(&self.to_le_bytes())
            .await
            .io_context("writing u64")
    }
}

impl Deserialize for u64 {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        _version: ProtocolVersion,
    ) -> Result<Self, ProtocolError> {
        let mut buf = [0u8; 8];
        reader
            .read_exact(&mut buf)
            .await
            .io_context("reading u64")?;
        Ok(u64::from_le_bytes(buf))
    }
}

impl Serialize for bool {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ProtocolError> {
        (*self as u64).serialize(writer, version).await
    }
}

impl Deserialize for bool {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ProtocolError> {
        Ok(u64::deserialize(reader, version).await? != 0)
    }
}

impl Serialize for [u8] {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ProtocolError> {
        let len = self.len() as u64;
        len.serialize(writer, version).await?;
        writer
            .write_all(self)
            .await
            .io_context("writing string data")?;
        let pad = padding(len);
        if pad > 0 {
            writer
                .write_all(&ZEROS[..pad])
                .await
                .io_context("writing string padding")?;
        }
        Ok(())
    }
}

impl Serialize for Vec<u8> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ProtocolError> {
        self.as_slice().serialize(writer, version).await
    }
}

impl Deserialize for Vec<u8> {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ProtocolError> {
        let len = u64::deserialize(reader, version).await?;
        if len > MAX_STRING_SIZE {
            return Err(ProtocolError::StringTooLong {
                length: len,
                max: MAX_STRING_SIZE,
            });
        }
        let mut buf = vec![0u8; len as usize + padding(len)];
        reader
            .read_exact(&mut buf)
            .await
            .io_context("reading string data")?;
        buf.truncate(len as usize);
        Ok(buf)
    }
}

impl Serialize for str {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ProtocolError> {
        self.as_bytes().serialize(writer, version).await
    }
}

impl Serialize for String {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ProtocolError> {
        self.as_bytes().serialize(writer, version).await
    }
}

impl Deserialize for String {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ProtocolError> {
        let bytes = Vec::<u8>::deserialize(reader, version).await?;
        String::from_utf8(bytes).map_err(|e| ProtocolError::malformed("string", e))
    }
}

async fn serialize_seq<'a, W, I, T>(
    iter: I,
    len: usize,
    writer: &mut W,
    version: ProtocolVersion,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    I: Iterator<Item = &'a T>,
    T: Serialize + 'a,
{
    if len as u64 > MAX_LIST_SIZE {
        return Err(ProtocolError::ListTooLong {
            length: len as u64,
            max: MAX_LIST_SIZE,
        });
    }
    (len as u64).serialize(writer, version).await?;
    for item in iter {
        item.serialize(writer, version).await?;
    }
    Ok(())
}

async fn read_len<R: AsyncRead + Unpin>(
    reader: &mut R,
    version: ProtocolVersion,
) -> Result<u64, ProtocolError> {
    let len = u64::deserialize(reader, version).await?;
    if len > MAX_LIST_SIZE {
        return Err(ProtocolError::ListTooLong {
            length: len,
            max: MAX_LIST_SIZE,
        });
    }
    Ok(len)
}

impl<T: Serialize> Serialize for [T] {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ProtocolError> {
        serialize_seq(self.iter(), self.len(), writer, version).await
    }
}

impl<T: Serialize> Serialize for Vec<T> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ProtocolError> {
        serialize_seq(self.iter(), self.len(), writer, version).await
    }
}

impl<T: Deserialize> Deserialize for Vec<T> {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ProtocolError> {
        let len = read_len(reader, version).await?;
        let mut result = Vec::with_capacity(len.min(4096) as usize);
        for _ in 0..len {
            result.push(T::deserialize(reader, version).await?);
        }
        Ok(result)
    }
}

impl<T: Serialize> Serialize for BTreeSet<T> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ProtocolError> {
        serialize_seq(self.iter(), self.len(), writer, version).await
    }
}

impl<T: Deserialize + Ord> Deserialize for BTreeSet<T> {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ProtocolError> {
        let len = read_len(reader, version).await?;
        let mut result = BTreeSet::new();
        for _ in 0..len {
            result.insert(T::deserialize(reader, version).await?);
        }
        Ok(result)
    }
}

impl<K: Serialize, V: Serialize> Serialize for BTreeMap<K, V> {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
    ) -> Result<(), ProtocolError> {
        if self.len() as u64 > MAX_LIST_SIZE {
            return Err(ProtocolError::ListTooLong {
                length: self.len() as u64,
                max: MAX_LIST_SIZE,
            });
        }
        (self.len() as u64).serialize(writer, version).await?;
        for (key, value) in self {
            key.serialize(writer, version).await?;
            value.serialize(writer, version).await?;
        }
        Ok(())
    }
}

impl<K: Deserialize + Ord, V: Deserialize> Deserialize for BTreeMap<K, V> {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
    ) -> Result<Self, ProtocolError> {
        let len = read_len(reader, version).await?;
        let mut result = BTreeMap::new();
        for _ in 0..len {
            let key = K::deserialize(reader, version).await?;
            let value = V::deserialize(reader, version).await?;
            result.insert(key, value);
        }
        Ok(result)
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::version::PROTOCOL_VERSION;
    use proptest::prelude::*;
    use std::io::Cursor;

    proptest! {
        #[test]
        fn bytes_roundtrip(data: Vec<u8>) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let mut buf = Vec::new();
                data.serialize(&mut buf, PROTOCOL_VERSION).await.unwrap();
                assert_eq!(buf.len() % 8, 0);
                let mut cursor = Cursor::new(buf);
                let back = Vec::<u8>::deserialize(&mut cursor, PROTOCOL_VERSION).await.unwrap();
                assert_eq!(data, back);
            });
        }
    }
}
