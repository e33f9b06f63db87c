//! Byte-counting adapters for the two halves of a transport.

use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pin_project! {
    /// Counts every byte read through it.
    pub struct CountingReader<R> {
        #[pin]
        inner: R,
        count: u64,
    }
}

impl<R> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }

    /// Total bytes read so far.
    pub fn bytes(&self) -> u64 {
        self.count
    }
}

impl<R: AsyncRead> AsyncRead for CountingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let result = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            *this.count += (buf.filled().len() - before) as u64;
        }
        result
    }
}

pin_project! {
    /// Counts every byte written through it.
    pub struct CountingWriter<W> {
        #[pin]
        inner: W,
        count: u64,
    }
}

impl<W> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    /// Total bytes written so far.
    pub fn bytes(&self) -> u64 {
        self.count
    }
}

impl<W: AsyncWrite> AsyncWrite for CountingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.project();
        let result = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &result {
            *this.count += *n as u64;
        }
        result
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    #[tokio::test]
    async fn counts_both_directions() {
        let mut writer = CountingWriter::new(Vec::new());
        writer.write_all(b"0123456789").await.unwrap();
        assert_eq!(writer.bytes(), 10);

        let mut reader = CountingReader::new(std::io::Cursor::new(b"abcde".to_vec()));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(reader.bytes(), 5);
        assert_eq!(out, b"abcde");
    }
}
