use bytes::Bytes;

/// One H.265 NAL unit with its parsed two-byte header.
#[derive(Debug, Clone)]
pub struct NalUnit {
    /// nal_unit_type, bits 1..7 of the first header byte
    pub nal_type: u8,
    /// nuh_layer_id
    pub layer_id: u8,
    /// nuh_temporal_id_plus1 − 1
    pub temporal_id: u8,
    /// Header bytes plus RBSP payload (emulation prevention removed)
    pub data: Bytes,
}

impl NalUnit {
    /// Wraps `data`, whose first two bytes must be the NAL header
    pub fn new(data: Bytes) -> Self {
        let b0 = data.first().copied().unwrap_or(0);
        let b1 = data.get(1).copied().unwrap_or(0);
        Self {
            nal_type: (b0 >> 1) & 0x3F,
            layer_id: ((b0 & 0x01) << 5) | (b1 >> 3),
            temporal_id: (b1 & 0x07).saturating_sub(1),
            data,
        }
    }

    /// Whether this unit starts a sync point (IDR, CRA or any BLA variant)
    pub fn is_keyframe(&self) -> bool {
        (nal_type::BLA_W_LP..=nal_type::CRA_NUT).contains(&self.nal_type)
    }
}

/// H.265 NAL unit type values (Rec. ITU-T H.265 Table 7-1)
#[allow(missing_docs)]
pub mod nal_type {
    pub const TRAIL_N: u8 = 0;
    pub const TRAIL_R: u8 = 1;
    pub const BLA_W_LP: u8 = 16;
    pub const BLA_W_RADL: u8 = 17;
    pub const BLA_N_LP: u8 = 18;
    pub const IDR_W_RADL: u8 = 19;
    pub const IDR_N_LP: u8 = 20;
    pub const CRA_NUT: u8 = 21;
    pub const VPS: u8 = 32;
    pub const SPS: u8 = 33;
    pub const PPS: u8 = 34;
    pub const AUD: u8 = 35;
    pub const PREFIX_SEI: u8 = 39;
    pub const SUFFIX_SEI: u8 = 40;
}

/// Parsed profile_tier_level general fields.
#[derive(Debug, Clone, Default)]
pub struct ProfileTierLevel {
    /// general_profile_space (0 for all published profiles)
    pub profile_space: u8,
    /// general_tier_flag: false = Main tier, true = High tier
    pub tier_flag: bool,
    /// general_profile_idc
    pub profile_idc: u8,
    /// general_profile_compatibility_flags (32 bits, MSB-first)
    pub compatibility_flags: u32,
    /// general_constraint_indicator_flags (48 bits)
    pub constraint_flags: u64,
    /// general_level_idc (level × 30)
    pub level_idc: u8,
}

impl ProfileTierLevel {
    /// RFC 6381 / ISO 14496-15 Annex E codec string, e.g. `hvc1.1.6.L93.B0`
    pub fn codec_string(&self) -> String {
        let space = match self.profile_space {
            1 => "A",
            2 => "B",
            3 => "C",
            _ => "",
        };
        let tier = if self.tier_flag { 'H' } else { 'L' };
        let mut s = format!(
            "hvc1.{}{}.{:X}.{}{}",
            space,
            self.profile_idc,
            self.compatibility_flags.reverse_bits(),
            tier,
            self.level_idc
        );

        // Constraint bytes, big-endian, trimmed of trailing zeros
        let bytes = [
            (self.constraint_flags >> 40) as u8,
            (self.constraint_flags >> 32) as u8,
            (self.constraint_flags >> 24) as u8,
            (self.constraint_flags >> 16) as u8,
            (self.constraint_flags >> 8) as u8,
            self.constraint_flags as u8,
        ];
        let trimmed = bytes
            .iter()
            .rposition(|&b| b != 0)
            .map(|last| &bytes[..=last])
            .unwrap_or(&[]);
        for b in trimmed {
            s.push_str(&format!(".{:X}", b));
        }

        s
    }
}

/// Parsed fields of an HEVC sequence parameter set.
#[derive(Debug, Clone, Default)]
pub struct SpsInfo {
    /// General profile/tier/level block
    pub profile_tier_level: ProfileTierLevel,
    /// chroma_format_idc
    pub chroma_format_idc: u32,
    /// Width after conformance-window cropping
    pub width: u32,
    /// Height after conformance-window cropping
    pub height: u32,
    /// bit_depth_luma_minus8 + 8
    pub bit_depth_luma: u32,
    /// bit_depth_chroma_minus8 + 8
    pub bit_depth_chroma: u32,
    /// Frames per second from VUI timing, when present
    pub frame_rate: Option<f64>,
    /// Sample aspect ratio from VUI, when present
    pub sample_aspect_ratio: Option<(u32, u32)>,
}

impl SpsInfo {
    /// Codec string from the embedded profile_tier_level
    pub fn codec_string(&self) -> String {
        self.profile_tier_level.codec_string()
    }
}

/// Parsed fields of an HEVC video parameter set.
#[derive(Debug, Clone, Default)]
pub struct VpsInfo {
    /// vps_max_sub_layers_minus1 + 1
    pub max_sub_layers: u8,
    /// General profile/tier/level block
    pub profile_tier_level: ProfileTierLevel,
}

/// Parsed fields of an HEVC picture parameter set.
#[derive(Debug, Clone, Default)]
pub struct PpsInfo {
    /// pps_pic_parameter_set_id
    pub pic_parameter_set_id: u32,
    /// pps_seq_parameter_set_id
    pub seq_parameter_set_id: u32,
    /// dependent_slice_segments_enabled_flag
    pub dependent_slice_segments_enabled: bool,
    /// cabac_init_present_flag
    pub cabac_init_present: bool,
}

/// HEVCDecoderConfigurationRecord, the `hvcC` box body.
#[derive(Debug, Clone, Default)]
pub struct HevcDecoderConfig {
    /// General profile/tier/level block
    pub profile_tier_level: ProfileTierLevel,
    /// chroma_format_idc
    pub chroma_format_idc: u8,
    /// bit_depth_luma_minus8
    pub bit_depth_luma_minus8: u8,
    /// bit_depth_chroma_minus8
    pub bit_depth_chroma_minus8: u8,
    /// NAL length-word size in bytes (1, 2 or 4)
    pub length_size: usize,
    /// Video parameter sets, with headers
    pub vps: Vec<Bytes>,
    /// Sequence parameter sets
    pub sps: Vec<Bytes>,
    /// Picture parameter sets
    pub pps: Vec<Bytes>,
}
