//! ISO Base Media File Format (MP4/MOV) support.
//!
//! Three entry points:
//!
//! - [`Mp4Demuxer`]: reads progressive and fragmented files into tracks
//!   and packets by expanding the sample tables up front
//! - [`Mp4Muxer`]: progressive fast-start writer (`moov` before `mdat`),
//!   with QuickTime chapters and iTunes-style metadata
//! - [`FragmentedMp4Muxer`]: streaming `moof`/`mdat` writer
//!
//! Box-level plumbing (headers, containers, FourCC and language codecs)
//! lives in [`boxes`].

/// Box header parsing/serialization and shared helpers
pub mod boxes;

/// Progressive and fragmented file reading
pub mod demuxer;

/// Fragmented (moof/mdat) writing
pub mod fragmented;

/// Progressive fast-start writing
pub mod muxer;

pub use demuxer::{Mp4Demuxer, SampleEntry};
pub use fragmented::{FragmentedMp4Config, FragmentedMp4Muxer};
pub use muxer::{Mp4Brand, Mp4Muxer, Mp4MuxerConfig};
