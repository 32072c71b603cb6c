//! H.265/HEVC parameter-set parsing.
//!
//! Parses VPS/SPS/PPS (profile_tier_level, conformance window, VUI timing),
//! reads and writes `hvcC` decoder configuration records, and derives
//! `hvc1.*` codec strings.

/// NAL unit and parameter-set value types
pub mod types;

/// VPS/SPS/PPS/hvcC parsers
pub mod parser;

pub use parser::{
    build_hevc_config, parse_hevc_config, parse_pps_rbsp, parse_sps_rbsp, parse_vps_rbsp,
    H265Parser,
};
pub use types::{HevcDecoderConfig, NalUnit, PpsInfo, ProfileTierLevel, SpsInfo, VpsInfo};
