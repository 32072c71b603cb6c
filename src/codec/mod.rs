//! # Codec Parameter Parsers
//!
//! Bitstream-level parsers for the codec configuration data containers
//! carry out-of-band: H.264 SPS/PPS, H.265 VPS/SPS/PPS and AAC
//! AudioSpecificConfig/ADTS. These populate sample descriptions, derive
//! RFC 6381 codec strings (`avc1.*`, `hvc1.*`, `mp4a.40.*`) and answer
//! keyframe questions. Nothing here decodes media samples.
//!
//! ## Supported Codecs
//!
//! ### H.264/AVC
//! - NAL unit parsing with Annex-B and length-prefixed framing
//! - SPS with cropping, VUI timing and sample aspect ratio
//! - `avcC` decoder configuration records
//!
//! ### H.265/HEVC
//! - Two-byte NAL headers, profile_tier_level, conformance window
//! - `hvcC` decoder configuration records
//!
//! ### AAC
//! - AudioSpecificConfig with SBR/PS signalling, ADTS framing, `esds`

#[doc = "AAC configuration parsing: AudioSpecificConfig, ADTS and esds"]
pub mod aac;

#[doc = "H.264/AVC parameter-set parsing: SPS/PPS and avcC records"]
pub mod h264;

#[doc = "H.265/HEVC parameter-set parsing: VPS/SPS/PPS and hvcC records"]
pub mod h265;

/// NAL framing shared by the video codecs: start codes, length prefixes
/// and emulation prevention
pub mod nal;
