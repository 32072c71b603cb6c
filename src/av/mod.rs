//! # Audio/Video Core Types
//!
//! The fundamental value types that containers exchange:
//!
//! - [`CodecId`]: container-neutral codec identification
//! - [`Track`]: an immutable description of one elementary stream
//! - [`Packet`]: one encoded access unit with timing
//!
//! A demuxer produces a `Vec<Track>` at open time and `Packet`s on demand;
//! a muxer accepts the same types. Nothing here decodes media.
//!
//! ## Example
//!
//! ```rust
//! use remuxio::av::{CodecId, Track, TrackKind, VideoParams};
//!
//! let track = Track::video(1, 0, CodecId::H264, VideoParams {
//!     width: 1920,
//!     height: 1080,
//!     frame_rate: Some(30.0),
//!     ..Default::default()
//! });
//! assert_eq!(track.kind, TrackKind::Video);
//! assert!(track.codec.is_video());
//! ```

/// Media packet handling and management
pub mod packet;
pub use packet::Packet;

/// Codec-copy conversion between a demuxer and a muxer
pub mod convert;
pub use convert::{ConvertOptions, Converter};

/// The broad kind of an elementary stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    /// Picture samples
    Video,
    /// Sound samples
    Audio,
    /// Timed text
    Subtitle,
}

/// Container-neutral codec tags.
///
/// Covers everything the supported containers can declare, whether or not
/// the library parses the codec's parameter sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum CodecId {
    H264,
    H265,
    Mpeg1,
    Mpeg2,
    Vp8,
    Vp9,
    Av1,
    Aac,
    Mp3,
    Ac3,
    Dts,
    TrueHd,
    Opus,
    Vorbis,
    Flac,
    PcmS16Le,
    PcmS16Be,
    /// Plain UTF-8 timed text
    Text,
    /// WebVTT subtitles
    WebVtt,
}

impl CodecId {
    /// Whether this codec carries video samples
    pub fn is_video(&self) -> bool {
        matches!(
            self,
            CodecId::H264
                | CodecId::H265
                | CodecId::Mpeg1
                | CodecId::Mpeg2
                | CodecId::Vp8
                | CodecId::Vp9
                | CodecId::Av1
        )
    }

    /// Whether this codec carries audio samples
    pub fn is_audio(&self) -> bool {
        matches!(
            self,
            CodecId::Aac
                | CodecId::Mp3
                | CodecId::Ac3
                | CodecId::Dts
                | CodecId::TrueHd
                | CodecId::Opus
                | CodecId::Vorbis
                | CodecId::Flac
                | CodecId::PcmS16Le
                | CodecId::PcmS16Be
        )
    }

    /// The track kind implied by the codec
    pub fn kind(&self) -> TrackKind {
        if self.is_video() {
            TrackKind::Video
        } else if self.is_audio() {
            TrackKind::Audio
        } else {
            TrackKind::Subtitle
        }
    }
}

/// Display rotation applied to a video track, in degrees clockwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    /// No rotation
    #[default]
    None,
    /// 90 degrees
    R90,
    /// 180 degrees
    R180,
    /// 270 degrees
    R270,
}

impl Rotation {
    /// Rotation in degrees
    pub fn degrees(&self) -> u32 {
        match self {
            Rotation::None => 0,
            Rotation::R90 => 90,
            Rotation::R180 => 180,
            Rotation::R270 => 270,
        }
    }
}

/// Video-specific track attributes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoParams {
    /// Coded width in pixels
    pub width: u32,
    /// Coded height in pixels
    pub height: u32,
    /// Frames per second, when the container or codec declares one
    pub frame_rate: Option<f64>,
    /// Display rotation
    pub rotation: Rotation,
}

/// Audio-specific track attributes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioParams {
    /// Samples per second
    pub sample_rate: u32,
    /// Channel count
    pub channels: u32,
    /// Bits per raw sample, when meaningful for the codec
    pub bits_per_sample: Option<u32>,
}

/// An immutable description of one elementary stream inside a container.
///
/// Created by the demuxer at open time; never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Track {
    /// Numeric track id, unique within the container
    pub id: u32,
    /// Zero-based position in the container's track list
    pub index: usize,
    /// Broad stream kind
    pub kind: TrackKind,
    /// Codec tag
    pub codec: CodecId,
    /// Codec-private initialization bytes (avcC, hvcC, ASC, …)
    pub codec_private: Option<bytes::Bytes>,
    /// ISO-639 three-letter language code
    pub language: Option<String>,
    /// Whether the track is flagged as default for its kind
    pub is_default: bool,
    /// Whether the track is flagged as forced
    pub is_forced: bool,
    /// Total duration in seconds, when the container declares one
    pub duration: Option<f64>,
    /// Video attributes, present when `kind == Video`
    pub video: Option<VideoParams>,
    /// Audio attributes, present when `kind == Audio`
    pub audio: Option<AudioParams>,
}

impl Track {
    /// Creates a video track description
    pub fn video(id: u32, index: usize, codec: CodecId, params: VideoParams) -> Self {
        Self {
            id,
            index,
            kind: TrackKind::Video,
            codec,
            codec_private: None,
            language: None,
            is_default: false,
            is_forced: false,
            duration: None,
            video: Some(params),
            audio: None,
        }
    }

    /// Creates an audio track description
    pub fn audio(id: u32, index: usize, codec: CodecId, params: AudioParams) -> Self {
        Self {
            id,
            index,
            kind: TrackKind::Audio,
            codec,
            codec_private: None,
            language: None,
            is_default: false,
            is_forced: false,
            duration: None,
            video: None,
            audio: Some(params),
        }
    }

    /// Creates a subtitle track description
    pub fn subtitle(id: u32, index: usize, codec: CodecId) -> Self {
        Self {
            id,
            index,
            kind: TrackKind::Subtitle,
            codec,
            codec_private: None,
            language: None,
            is_default: false,
            is_forced: false,
            duration: None,
            video: None,
            audio: None,
        }
    }

    /// Sets the codec-private bytes
    pub fn with_codec_private(mut self, data: impl Into<bytes::Bytes>) -> Self {
        self.codec_private = Some(data.into());
        self
    }

    /// Sets the language code
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Sets the default flag
    pub fn with_default(mut self, is_default: bool) -> Self {
        self.is_default = is_default;
        self
    }
}

/// Cover-art payload formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverArtFormat {
    /// JPEG image data
    Jpeg,
    /// PNG image data
    Png,
}

/// Container-level descriptive metadata (title, artist, cover art, …).
///
/// Read from `udta/meta/ilst` on the MP4 side; muxers that cannot express
/// a field simply drop it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    /// Work title
    pub title: Option<String>,
    /// Performing artist
    pub artist: Option<String>,
    /// Album artist
    pub album_artist: Option<String>,
    /// Album
    pub album: Option<String>,
    /// Genre
    pub genre: Option<String>,
    /// Release date or year
    pub date: Option<String>,
    /// Composer / writer
    pub composer: Option<String>,
    /// Copyright notice
    pub copyright: Option<String>,
    /// Freeform comment
    pub comment: Option<String>,
    /// Encoding tool
    pub encoder: Option<String>,
    /// Long description
    pub description: Option<String>,
    /// Cover art image and its format
    pub cover_art: Option<(bytes::Bytes, CoverArtFormat)>,
    /// Tags with no dedicated field, as (atom name, UTF-8 value)
    pub extra: Vec<([u8; 4], String)>,
}

impl Metadata {
    /// Whether no field carries a value
    pub fn is_empty(&self) -> bool {
        *self == Metadata::default()
    }
}

/// A named chapter mark for containers that can express them.
#[derive(Debug, Clone, PartialEq)]
pub struct Chapter {
    /// Start time in seconds
    pub start: f64,
    /// Chapter title
    pub title: String,
}
