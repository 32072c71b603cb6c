//! H.264/AVC parameter-set parsing.
//!
//! Parses SPS/PPS (dimensions, cropping, VUI timing, sample aspect ratio),
//! reads and writes `avcC` decoder configuration records, and derives RFC
//! 6381 `avc1.*` codec strings. Slice data is never touched.

/// NAL unit and parameter-set value types
pub mod types;

/// SPS/PPS/avcC parsers
pub mod parser;

pub use parser::{build_avc_config, parse_avc_config, parse_pps_rbsp, parse_sps_rbsp, H264Parser};
pub use types::{AvcDecoderConfig, NalUnit, NalUnitType, PpsInfo, SpsInfo};
