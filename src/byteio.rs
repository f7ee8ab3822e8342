//! Primitive serialization helpers that `tokio::io::{AsyncReadExt, AsyncWriteExt}`
//! don't provide out of the box (RTMP's header fields are a mix of 24-bit
//! big-endian and occasional little-endian integers), plus a small
//! scratch-buffer pool so the chunk assembler doesn't allocate one `Vec`
//! per message.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads a 24-bit big-endian unsigned integer (RTMP timestamps and
/// message lengths are both carried this way).
pub async fn read_u24_be<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 3];
    r.read_exact(&mut buf).await?;
    Ok(((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | (buf[2] as u32))
}

pub async fn write_u24_be<W: AsyncWrite + Unpin>(w: &mut W, value: u32) -> io::Result<()> {
    let buf = [(value >> 16) as u8, (value >> 8) as u8, value as u8];
    w.write_all(&buf).await
}

/// Reads a 16-bit little-endian unsigned integer, used only for the
/// two-byte CSID extension of the basic chunk header.
pub async fn read_u16_le<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf).await?;
    Ok(u16::from_le_bytes(buf))
}

pub async fn write_u16_le<W: AsyncWrite + Unpin>(w: &mut W, value: u16) -> io::Result<()> {
    w.write_all(&value.to_le_bytes()).await
}

/// A LIFO pool of reusable byte buffers. One pool is owned per connection
/// (chunk-assembly buffers never cross connections), so no synchronization
/// is needed.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Vec<Vec<u8>>,
}

impl BufferPool {
    pub fn new() -> Self {
        BufferPool { free: Vec::new() }
    }

    /// Returns a buffer with at least `capacity` bytes of backing storage
    /// and a length of zero, reusing a freed one if available.
    pub fn acquire(&mut self, capacity: usize) -> Vec<u8> {
        match self.free.pop() {
            Some(mut buf) => {
                buf.clear();
                if buf.capacity() < capacity {
                    buf.reserve(capacity - buf.capacity());
                }
                buf
            }
            None => Vec::with_capacity(capacity),
        }
    }

    /// Returns a buffer to the pool for future reuse.
    pub fn release(&mut self, buf: Vec<u8>) {
        self.free.push(buf);
    }
}
