//! # Byte Sources and Targets
//!
//! Containers are parsed from a [`Source`] (a seekable byte stream) and
//! produced into a [`Target`] (an append-only sink). Both are small
//! object-safe async traits so demuxers and muxers can work over files,
//! in-memory buffers, or anything else that can satisfy the contract.
//!
//! Reads never fail at end-of-stream: [`Source::read`] returns a short or
//! empty buffer instead, and the typed helpers in [`SourceExt`] return
//! `Ok(None)`. Callers decide whether a truncation is fatal.
//!
//! ## Example
//!
//! ```rust
//! use remuxio::io::{BufSource, Source, SourceExt};
//!
//! # async fn example() -> remuxio::Result<()> {
//! let mut src = BufSource::new(vec![0x00, 0x00, 0x00, 0x18, b'f', b't', b'y', b'p']);
//! let size = src.read_u32().await?.unwrap();
//! let fourcc = src.read_fourcc().await?.unwrap();
//! assert_eq!(size, 24);
//! assert_eq!(&fourcc, b"ftyp");
//! # Ok(())
//! # }
//! ```

use crate::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

/// A seekable stream of bytes that containers are demuxed from.
///
/// The demuxer owns its source for its whole lifetime; closing the demuxer
/// closes the source.
#[async_trait]
pub trait Source: Send {
    /// Total size in bytes, when known
    fn size(&self) -> Option<u64>;

    /// Current read position
    fn position(&self) -> u64;

    /// Moves the read position. Seeks are assumed O(1).
    fn set_position(&mut self, pos: u64);

    /// Reads up to `n` bytes at the current position, advancing it.
    ///
    /// Returns a short or empty buffer at end-of-stream rather than an
    /// error.
    async fn read(&mut self, n: usize) -> Result<Bytes>;

    /// Releases the underlying resource
    async fn close(&mut self) -> Result<()>;
}

/// Typed big-endian (and selected little-endian) readers over a [`Source`].
///
/// Every method returns `Ok(None)` when the stream ends before the value is
/// complete, mirroring the short-read behavior of [`Source::read`].
#[async_trait]
pub trait SourceExt: Source {
    /// Reads exactly `n` bytes, or returns `None` if the stream is shorter.
    async fn read_exact(&mut self, n: usize) -> Result<Option<Bytes>> {
        let mut buf = BytesMut::with_capacity(n);
        while buf.len() < n {
            let chunk = self.read(n - buf.len()).await?;
            if chunk.is_empty() {
                return Ok(None);
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(Some(buf.freeze()))
    }

    /// Reads an unsigned 8-bit integer
    async fn read_u8(&mut self) -> Result<Option<u8>> {
        Ok(self.read_exact(1).await?.map(|b| b[0]))
    }

    /// Reads a big-endian unsigned 16-bit integer
    async fn read_u16(&mut self) -> Result<Option<u16>> {
        Ok(self
            .read_exact(2)
            .await?
            .map(|b| u16::from_be_bytes([b[0], b[1]])))
    }

    /// Reads a big-endian unsigned 24-bit integer
    async fn read_u24(&mut self) -> Result<Option<u32>> {
        Ok(self
            .read_exact(3)
            .await?
            .map(|b| ((b[0] as u32) << 16) | ((b[1] as u32) << 8) | b[2] as u32))
    }

    /// Reads a big-endian unsigned 32-bit integer
    async fn read_u32(&mut self) -> Result<Option<u32>> {
        Ok(self
            .read_exact(4)
            .await?
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]])))
    }

    /// Reads a big-endian unsigned 64-bit integer
    async fn read_u64(&mut self) -> Result<Option<u64>> {
        Ok(self.read_exact(8).await?.map(|b| {
            u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        }))
    }

    /// Reads a big-endian signed 16-bit integer
    async fn read_i16(&mut self) -> Result<Option<i16>> {
        Ok(self.read_u16().await?.map(|v| v as i16))
    }

    /// Reads a big-endian signed 32-bit integer
    async fn read_i32(&mut self) -> Result<Option<i32>> {
        Ok(self.read_u32().await?.map(|v| v as i32))
    }

    /// Reads a little-endian unsigned 32-bit integer (OGG headers)
    async fn read_u32_le(&mut self) -> Result<Option<u32>> {
        Ok(self
            .read_exact(4)
            .await?
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])))
    }

    /// Reads a little-endian unsigned 64-bit integer (OGG granule position)
    async fn read_u64_le(&mut self) -> Result<Option<u64>> {
        Ok(self.read_exact(8).await?.map(|b| {
            u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
        }))
    }

    /// Reads a four-character ASCII type tag
    async fn read_fourcc(&mut self) -> Result<Option<[u8; 4]>> {
        Ok(self
            .read_exact(4)
            .await?
            .map(|b| [b[0], b[1], b[2], b[3]]))
    }

    /// Advances the read position by `n` bytes
    fn skip(&mut self, n: u64) {
        let pos = self.position();
        self.set_position(pos + n);
    }
}

impl<S: Source + ?Sized> SourceExt for S {}

/// An append-only byte sink that muxers produce into.
#[async_trait]
pub trait Target: Send {
    /// Current write position (monotonically increasing)
    fn position(&self) -> u64;

    /// Appends bytes at the current write position
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Flushes and releases the underlying resource
    async fn close(&mut self) -> Result<()>;
}

/// An in-memory [`Source`] over a byte buffer.
#[derive(Debug, Clone)]
pub struct BufSource {
    data: Bytes,
    pos: u64,
}

impl BufSource {
    /// Creates a source over the given bytes
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
        }
    }
}

#[async_trait]
impl Source for BufSource {
    fn size(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn set_position(&mut self, pos: u64) {
        self.pos = pos;
    }

    async fn read(&mut self, n: usize) -> Result<Bytes> {
        let start = (self.pos as usize).min(self.data.len());
        let end = start.saturating_add(n).min(self.data.len());
        self.pos = end as u64;
        Ok(self.data.slice(start..end))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A [`Source`] backed by a file on disk.
pub struct FileSource {
    file: tokio::fs::File,
    pos: u64,
    size: u64,
    // Seek is deferred until the next read so position changes stay O(1).
    dirty: bool,
}

impl FileSource {
    /// Opens the file at `path` for reading
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        Ok(Self {
            file,
            pos: 0,
            size,
            dirty: false,
        })
    }
}

#[async_trait]
impl Source for FileSource {
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn set_position(&mut self, pos: u64) {
        if pos != self.pos {
            self.pos = pos;
            self.dirty = true;
        }
    }

    async fn read(&mut self, n: usize) -> Result<Bytes> {
        if self.dirty {
            self.file.seek(SeekFrom::Start(self.pos)).await?;
            self.dirty = false;
        }
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let read = self.file.read(&mut buf[filled..]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        buf.truncate(filled);
        self.pos += filled as u64;
        Ok(Bytes::from(buf))
    }

    async fn close(&mut self) -> Result<()> {
        self.file.shutdown().await?;
        Ok(())
    }
}

/// An in-memory [`Target`] that accumulates everything written to it.
#[derive(Debug, Default)]
pub struct BufTarget {
    buf: BytesMut,
}

impl BufTarget {
    /// Creates an empty buffer target
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes the target, returning the accumulated bytes
    pub fn finalize(self) -> Bytes {
        self.buf.freeze()
    }

    /// Borrows the accumulated bytes without consuming the target
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

#[async_trait]
impl Target for BufTarget {
    fn position(&self) -> u64 {
        self.buf.len() as u64
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A [`Target`] backed by a file on disk.
pub struct FileTarget {
    file: tokio::fs::File,
    pos: u64,
}

impl FileTarget {
    /// Creates (truncating) the file at `path` for writing
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = tokio::fs::File::create(path).await?;
        Ok(Self { file, pos: 0 })
    }
}

#[async_trait]
impl Target for FileTarget {
    fn position(&self) -> u64 {
        self.pos
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data).await?;
        self.pos += data.len() as u64;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.shutdown().await?;
        Ok(())
    }
}
