//! # Container Format Implementations
//!
//! Demuxers and muxers for the supported container families, plus
//! signature-based format detection:
//!
//! - **MP4/MOV**: ISO Base Media, progressive and fragmented
//! - **Matroska/WebM**: EBML-based containers
//! - **TS**: MPEG-2 Transport Stream
//! - **OGG**: page-framed streams
//!
//! ## Probing
//!
//! ```rust
//! use remuxio::format::{probe, ContainerFormat};
//!
//! let header = [0x1A, 0x45, 0xDF, 0xA3, 0, 0, 0, 0];
//! assert_eq!(probe(&header), Some(ContainerFormat::Matroska));
//! ```

use crate::av::{Packet, Track};
use crate::io::Source;
use crate::Result;
use std::future::Future;
use std::pin::Pin;

/// Matroska demuxing (EBML parsing, Segment traversal, block framing)
pub mod mkv;
/// ISO Base Media (MP4/MOV) demuxing and muxing
pub mod mp4;
/// OGG page framing
pub mod ogg;
/// MPEG Transport Stream demuxing and muxing
pub mod ts;

/// Common trait for format demuxers that extract elementary streams from
/// container formats.
///
/// A demuxer owns its [`Source`] for its whole lifetime; `close` releases
/// it. Packets come out in non-decreasing DTS order per track.
#[async_trait::async_trait]
pub trait Demuxer: Send {
    /// Returns the immutable track list discovered at open time
    async fn tracks(&mut self) -> Result<Vec<Track>>;

    /// Reads the next packet, or `None` at end of stream
    async fn read_packet(&mut self) -> Result<Option<Packet>>;

    /// Positions every track so the next packet delivered on it is the
    /// last keyframe at or before `time` (seconds)
    async fn seek(&mut self, time: f64) -> Result<()>;

    /// Descriptive metadata, for formats that carry any
    async fn metadata(&mut self) -> Result<crate::av::Metadata> {
        Ok(crate::av::Metadata::default())
    }

    /// Closes the demuxer and its source
    async fn close(&mut self) -> Result<()>;
}

/// Common trait for format muxers that package elementary streams into
/// container formats.
///
/// Packets must arrive in non-decreasing DTS order per track; interleaving
/// across tracks is unconstrained.
#[async_trait::async_trait]
pub trait Muxer: Send {
    /// Supplies descriptive metadata; formats without a metadata surface
    /// ignore it. Must be called before `write_header` to take effect.
    fn set_metadata(&mut self, _metadata: crate::av::Metadata) {}

    /// Writes the container header; must be called once, before any packet
    async fn write_header(&mut self, tracks: &[Track]) -> Result<()>;

    /// Writes one media packet
    async fn write_packet(&mut self, packet: &Packet) -> Result<()>;

    /// Flushes buffered data that can be emitted early (for fragmented
    /// formats this cuts a fragment)
    async fn flush(&mut self) -> Result<()>;

    /// Finalizes the container, flushing everything buffered
    async fn write_trailer(&mut self) -> Result<()>;
}

/// The container families the library can identify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerFormat {
    /// ISO Base Media with an MP4-family brand
    Mp4,
    /// ISO Base Media with the QuickTime brand
    Mov,
    /// Matroska
    Matroska,
    /// WebM (Matroska with the webm DocType)
    WebM,
    /// MPEG-2 Transport Stream
    MpegTs,
    /// OGG
    Ogg,
}

/// MP4-family major brands accepted by the probe.
const MP4_BRANDS: [&[u8; 4]; 19] = [
    b"isom", b"iso2", b"iso3", b"iso4", b"iso5", b"iso6", b"mp41", b"mp42", b"mp71", b"avc1",
    b"av01", b"hev1", b"hvc1", b"M4A ", b"M4V ", b"M4P ", b"M4B ", b"f4v ", b"f4a ",
];
const MP4_STREAMING_BRANDS: [&[u8; 4]; 3] = [b"dash", b"msdh", b"msix"];

/// Identifies the container format from the first bytes of a stream.
///
/// Never fails: any header it cannot place yields `None`.
pub fn probe(header: &[u8]) -> Option<ContainerFormat> {
    if header.len() >= 4 && &header[..4] == b"OggS" {
        return Some(ContainerFormat::Ogg);
    }
    if header.len() >= 4 && header[..4] == [0x1A, 0x45, 0xDF, 0xA3] {
        // DocType decides webm vs matroska; without it, default to Matroska
        return Some(ContainerFormat::Matroska);
    }
    if header.first() == Some(&0x47) {
        return Some(ContainerFormat::MpegTs);
    }
    if header.len() >= 12 && &header[4..8] == b"ftyp" {
        let brand: &[u8] = &header[8..12];
        if brand == b"qt  " {
            return Some(ContainerFormat::Mov);
        }
        if MP4_BRANDS.iter().any(|b| &b[..] == brand)
            || MP4_STREAMING_BRANDS.iter().any(|b| &b[..] == brand)
        {
            return Some(ContainerFormat::Mp4);
        }
    }
    None
}

type OpenFuture = Pin<Box<dyn Future<Output = Result<Box<dyn Demuxer>>> + Send>>;

/// One registered format: its signature check and demuxer factory.
pub struct FormatEntry {
    /// The format this entry recognizes
    pub format: ContainerFormat,
    /// Signature check over the first bytes of the stream
    pub probe: fn(&[u8]) -> bool,
    /// Builds a demuxer over the source
    pub open: fn(Box<dyn Source>) -> OpenFuture,
}

/// An immutable table of probe+factory pairs.
///
/// Constructed once (typically per process) and only read afterwards; the
/// library keeps no global registry.
pub struct FormatRegistry {
    entries: Vec<FormatEntry>,
}

impl FormatRegistry {
    /// Creates a registry containing every built-in format
    pub fn with_defaults() -> Self {
        let entries = vec![
            FormatEntry {
                format: ContainerFormat::Mp4,
                probe: |h| matches!(probe(h), Some(ContainerFormat::Mp4 | ContainerFormat::Mov)),
                open: |source| {
                    Box::pin(async move {
                        Ok(Box::new(mp4::Mp4Demuxer::open(source).await?) as Box<dyn Demuxer>)
                    })
                },
            },
            FormatEntry {
                format: ContainerFormat::Matroska,
                probe: |h| {
                    matches!(
                        probe(h),
                        Some(ContainerFormat::Matroska | ContainerFormat::WebM)
                    )
                },
                open: |source| {
                    Box::pin(async move {
                        Ok(Box::new(mkv::MkvDemuxer::open(source).await?) as Box<dyn Demuxer>)
                    })
                },
            },
            FormatEntry {
                format: ContainerFormat::MpegTs,
                probe: |h| probe(h) == Some(ContainerFormat::MpegTs),
                open: |source| {
                    Box::pin(async move {
                        Ok(Box::new(ts::TsDemuxer::open(source).await?) as Box<dyn Demuxer>)
                    })
                },
            },
            FormatEntry {
                format: ContainerFormat::Ogg,
                probe: |h| probe(h) == Some(ContainerFormat::Ogg),
                open: |source| {
                    Box::pin(async move {
                        Ok(Box::new(ogg::OggDemuxer::open(source).await?) as Box<dyn Demuxer>)
                    })
                },
            },
        ];
        Self { entries }
    }

    /// Creates an empty registry
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Adds a format entry (before the registry is shared)
    pub fn register(&mut self, entry: FormatEntry) {
        self.entries.push(entry);
    }

    /// Runs every registered probe against `header`
    pub fn identify(&self, header: &[u8]) -> Option<ContainerFormat> {
        self.entries
            .iter()
            .find(|e| (e.probe)(header))
            .map(|e| e.format)
    }

    /// Probes the source and opens the matching demuxer.
    ///
    /// The source is left positioned at the start for the demuxer.
    pub async fn open(&self, mut source: Box<dyn Source>) -> Result<Box<dyn Demuxer>> {
        use crate::io::SourceExt;

        source.set_position(0);
        let header = source
            .read_exact(12)
            .await?
            .ok_or_else(|| crate::RemuxError::Truncated("probe window".into()))?;
        source.set_position(0);

        let entry = self
            .entries
            .iter()
            .find(|e| (e.probe)(&header))
            .ok_or_else(|| crate::RemuxError::Unsupported("unrecognized container".into()))?;
        (entry.open)(source).await
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_signatures() {
        assert_eq!(probe(b"OggS\x00\x02"), Some(ContainerFormat::Ogg));
        assert_eq!(
            probe(&[0x1A, 0x45, 0xDF, 0xA3, 0xA3]),
            Some(ContainerFormat::Matroska)
        );
        assert_eq!(probe(&[0x47, 0x40, 0x00]), Some(ContainerFormat::MpegTs));

        let mut mp4 = vec![0, 0, 0, 24];
        mp4.extend_from_slice(b"ftypisom");
        assert_eq!(probe(&mp4), Some(ContainerFormat::Mp4));

        let mut mov = vec![0, 0, 0, 24];
        mov.extend_from_slice(b"ftypqt  ");
        assert_eq!(probe(&mov), Some(ContainerFormat::Mov));
    }

    #[test]
    fn test_probe_never_errors_on_garbage() {
        assert_eq!(probe(&[]), None);
        assert_eq!(probe(&[0x00]), None);
        assert_eq!(probe(b"RIFF....WAVE"), None);
        let mut unknown_brand = vec![0, 0, 0, 24];
        unknown_brand.extend_from_slice(b"ftypxxxx");
        assert_eq!(probe(&unknown_brand), None);
    }

    #[test]
    fn test_registry_identify() {
        let registry = FormatRegistry::with_defaults();
        assert_eq!(
            registry.identify(&[0x47, 0x11, 0x22]),
            Some(ContainerFormat::MpegTs)
        );
        assert_eq!(registry.identify(b"nothing here"), None);
    }
}
