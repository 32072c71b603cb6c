//! AAC configuration parsing.
//!
//! AudioSpecificConfig and ADTS header handling, SBR/PS detection
//! (explicit and via the sync extension), `esds` descriptor read/write and
//! `mp4a.40.*` codec strings. Raw AAC frames pass through untouched.

/// Configuration and frame value types
pub mod types;

/// AudioSpecificConfig / ADTS / esds parsers
pub mod parser;

pub use parser::{
    build_audio_specific_config, build_esds, build_esds_with_asc, parse_adts_header,
    parse_audio_specific_config, parse_esds, AacParser,
};
pub use types::{sample_rate_index, AacConfig, AacFrame, AdtsHeader, ProfileType};
