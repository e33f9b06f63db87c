//! SHA-256 digests with the nix-base32 printed form.
//!
//! The store model only ever deals in SHA-256: NAR hashes on the wire are
//! `sha256:<52 base32 chars>`, and some peers print the bare hex form
//! instead, so [`Hash::parse`] accepts both, with or without the algorithm
//! prefix.

use std::fmt;
use std::pin::Pin;
use std::task::{ready, Context as TaskContext, Poll};

use data_encoding::HEXLOWER_PERMISSIVE;
use pin_project_lite::pin_project;
use ring::digest;
use tokio::io::AsyncRead;

use crate::base32;
use crate::error::StoreError;

const SHA256_SIZE: usize = 32;
const SHA256_BASE32_LEN: usize = base32::encode_len(SHA256_SIZE);
const SHA256_HEX_LEN: usize = SHA256_SIZE * 2;

/// A SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; SHA256_SIZE]);

impl Hash {
    pub fn from_bytes(bytes: [u8; SHA256_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SHA256_SIZE] {
        &self.0
    }

    /// Digest a complete buffer.
    pub fn digest<B: AsRef<[u8]>>(data: B) -> Self {
        let mut ctx = HashContext::new();
        ctx.update(data.as_ref());
        ctx.finish()
    }

    /// Parse a digest in base32 or hex, with or without a `sha256:` prefix.
    pub fn parse(input: &str) -> Result<Self, StoreError> {
        let rest = input.strip_prefix("sha256:").unwrap_or(input);
        let bad = |reason: &str| StoreError::InvalidHash {
            input: input.to_string(),
            reason: reason.to_string(),
        };
        let bytes = match rest.len() {
            SHA256_BASE32_LEN => {
                base32::decode_string(rest.as_bytes()).map_err(|_| bad("invalid base32"))?
            }
            SHA256_HEX_LEN => {
                let mut out = vec![0u8; SHA256_SIZE];
                HEXLOWER_PERMISSIVE
                    .decode_mut(rest.as_bytes(), &mut out)
                    .map_err(|_| bad("invalid hex"))?;
                out
            }
            _ => return Err(bad("unexpected length")),
        };
        let mut digest = [0u8; SHA256_SIZE];
        digest.copy_from_slice(&bytes);
        Ok(Self(digest))
    }

    pub fn to_base32(&self) -> String {
        base32::encode_string(&self.0)
    }

    pub fn to_hex(&self) -> String {
        HEXLOWER_PERMISSIVE.encode(&self.0)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.to_base32())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({self})")
    }
}

/// Incremental SHA-256 context.
pub struct HashContext {
    ctx: digest::Context,
    bytes: u64,
}

impl fmt::Debug for HashContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashContext")
            .field("bytes", &self.bytes)
            .finish_non_exhaustive()
    }
}

impl HashContext {
    pub fn new() -> Self {
        Self {
            ctx: digest::Context::new(&digest::SHA256),
            bytes: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.ctx.update(data);
        self.bytes += data.len() as u64;
    }

    /// Total number of bytes fed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    pub fn finish(self) -> Hash {
        let digest = self.ctx.finish();
        let mut out = [0u8; SHA256_SIZE];
        out.copy_from_slice(digest.as_ref());
        Hash(out)
    }
}

impl Default for HashContext {
    fn default() -> Self {
        Self::new()
    }
}

pin_project! {
    /// Wraps an [`AsyncRead`] and digests every byte that passes through.
    ///
    /// The context is owned by the reader: drive the stream to EOF, then
    /// consume the wrapper with [`finish`](Self::finish) to obtain the
    /// digest (and [`bytes_hashed`](Self::bytes_hashed) for the length).
    pub struct HashingReader<R> {
        #[pin]
        inner: R,
        ctx: HashContext,
    }
}

impl<R> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            ctx: HashContext::new(),
        }
    }

    /// Bytes digested so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.ctx.bytes_hashed()
    }

    /// Finish the digest, discarding the underlying reader.
    pub fn finish(self) -> Hash {
        self.ctx.finish()
    }
}

impl<R: AsyncRead> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let already = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        this.ctx.update(&buf.filled()[already..]);
        Poll::Ready(Ok(()))
    }
}
