//! Buffered reader with peek support
//!
//! Both endpoints sniff bytes before deciding what a connection is: the
//! server peeks the magic prefix and the MUX header without consuming them,
//! and the read-loops on both sides parse frame headers incrementally. This
//! reader keeps a growable buffer in front of the stream so peeked bytes can
//! later be consumed or handed off wholesale to a task pump.

use bytes::{Buf, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Initial buffer capacity, sized to the DATA payload bound so one fill
/// usually covers a full frame.
const READ_BUF_SIZE: usize = 4 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// A buffered peek reader over the read half of a connection.
pub struct PeekReader {
    inner: BoxedReader,
    buf: BytesMut,
}

impl PeekReader {
    pub fn new<R>(inner: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            inner: Box::new(inner),
            buf: BytesMut::with_capacity(READ_BUF_SIZE),
        }
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Buffered bytes without consuming them.
    pub fn buffered_bytes(&self) -> &[u8] {
        &self.buf
    }

    async fn fill(&mut self) -> io::Result<usize> {
        if self.buf.capacity() - self.buf.len() < READ_BUF_SIZE / 2 {
            self.buf.reserve(READ_BUF_SIZE);
        }
        self.inner.read_buf(&mut self.buf).await
    }

    /// Buffer at least one more byte than is currently held.
    pub async fn fill_more(&mut self) -> io::Result<()> {
        if self.fill().await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(())
    }

    /// Peek exactly `n` bytes without consuming them.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buf.len() < n {
            if self.fill().await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
        Ok(&self.buf[..n])
    }

    /// Drop `n` buffered bytes.
    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n);
    }

    pub async fn read_u8(&mut self) -> io::Result<u8> {
        let b = self.peek(1).await?[0];
        self.consume(1);
        Ok(b)
    }

    pub async fn read_u16_be(&mut self) -> io::Result<u16> {
        let bytes = self.peek(2).await?;
        let v = u16::from_be_bytes([bytes[0], bytes[1]]);
        self.consume(2);
        Ok(v)
    }

    pub async fn read_u32_be(&mut self) -> io::Result<u32> {
        let bytes = self.peek(4).await?;
        let v = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        self.consume(4);
        Ok(v)
    }

    /// Consume exactly `n` bytes and return them.
    pub async fn read_bytes(&mut self, n: usize) -> io::Result<Bytes> {
        self.peek(n).await?;
        Ok(self.buf.split_to(n).freeze())
    }

    /// Return the next chunk of at most `max` bytes, reading from the stream
    /// only when the buffer is empty. EOF yields `UnexpectedEof`.
    pub async fn next_chunk(&mut self, max: usize) -> io::Result<Bytes> {
        if self.buf.is_empty() {
            if self.fill().await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
        let n = self.buf.len().min(max);
        Ok(self.buf.split_to(n).freeze())
    }

    /// Hand over everything currently buffered.
    pub fn take_buffered(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let data: &[u8] = b"hello world";
        let mut r = PeekReader::new(data);

        assert_eq!(r.peek(5).await.unwrap(), b"hello");
        assert_eq!(r.peek(5).await.unwrap(), b"hello");
        assert!(r.buffered() >= 5);

        r.consume(6);
        assert_eq!(r.read_bytes(5).await.unwrap().as_ref(), b"world");
    }

    #[tokio::test]
    async fn test_integer_reads() {
        let data: &[u8] = &[0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x01, 0x42];
        let mut r = PeekReader::new(data);

        assert_eq!(r.read_u32_be().await.unwrap(), u32::MAX);
        assert_eq!(r.read_u16_be().await.unwrap(), 1);
        assert_eq!(r.read_u8().await.unwrap(), 0x42);
        assert!(r.read_u8().await.is_err());
    }

    #[tokio::test]
    async fn test_next_chunk_prefers_buffer() {
        let data: &[u8] = b"abcdef";
        let mut r = PeekReader::new(data);

        r.peek(6).await.unwrap();
        let chunk = r.next_chunk(4).await.unwrap();
        assert_eq!(chunk.as_ref(), b"abcd");
        let chunk = r.next_chunk(4).await.unwrap();
        assert_eq!(chunk.as_ref(), b"ef");
    }

    #[tokio::test]
    async fn test_take_buffered() {
        let data: &[u8] = b"GET / HTTP/1.1\r\n";
        let mut r = PeekReader::new(data);
        r.peek(4).await.unwrap();
        let held = r.take_buffered();
        assert!(held.len() >= 4);
        assert_eq!(&held[..4], b"GET ");
    }
}
