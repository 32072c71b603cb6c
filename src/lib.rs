#![doc(html_root_url = "https://docs.rs/remuxio/0.1.0")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! # remuxio - Rust Container Toolkit
//!
//! `remuxio` reads and writes the common media container families without
//! touching the compressed samples inside them. It moves already-encoded
//! access units between byte streams and in-memory track/sample
//! descriptions, which makes it the right tool for codec-copy remuxing,
//! fast-start rewriting, and fragmented-MP4 packaging.
//!
//! ## Features
//!
//! ### Containers
//! - ISO Base Media (MP4, MOV/QuickTime, fragmented MP4, CMAF) demuxing
//!   and muxing, including fast-start `moov`-before-`mdat` output,
//!   QuickTime chapters and iTunes-style metadata
//! - Matroska/WebM (EBML) demuxing
//! - MPEG-2 Transport Stream demuxing and muxing
//! - OGG page framing
//!
//! ### Codec parameter parsing
//! - H.264/AVC SPS/PPS, H.265/HEVC VPS/SPS/PPS, AAC
//!   AudioSpecificConfig/ADTS: enough to populate sample descriptions
//!   and derive `avc1`/`hvc1`/`mp4a` codec strings. No decoding.
//!
//! ## Quick Start
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! remuxio = "0.1.0"
//! ```
//!
//! ### Codec-copy conversion example
//!
//! ```rust,no_run
//! use remuxio::av::convert::{Converter, ConvertOptions};
//! use remuxio::format::mp4::{Mp4Demuxer, Mp4Muxer};
//! use remuxio::io::{FileSource, FileTarget};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let source = FileSource::open("input.mp4").await?;
//!     let mut demuxer = Mp4Demuxer::open(Box::new(source)).await?;
//!
//!     let target = FileTarget::create("output.mp4").await?;
//!     let mut muxer = Mp4Muxer::new(target, Default::default());
//!
//!     let mut converter = Converter::new(ConvertOptions::default());
//!     converter.run(&mut demuxer, &mut muxer).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - `av`: track, packet and conversion-loop types
//! - `codec`: H.264/H.265/AAC parameter-set parsers and codec strings
//! - `format`: container demuxers and muxers plus the format registry
//! - `io`: abstract byte sources and targets
//! - `utils`: bitstream reader/writer and CRC implementations
//! - `error`: error types and the crate-wide `Result`

/// Audio/Video base types: tracks, packets and the conversion loop
pub mod av;

/// Codec parameter-set parsers for video and audio formats
pub mod codec;

/// Error types and utilities
pub mod error;

/// Container format implementations (MP4, Matroska, TS, OGG)
pub mod format;

/// Abstract byte sources and targets
pub mod io;

/// Common utilities: bitstream access and CRC
pub mod utils;

pub use error::{RemuxError, Result};
