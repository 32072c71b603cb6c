use bytes::Bytes;

/// One H.264 NAL unit with its parsed header fields.
#[derive(Debug, Clone)]
pub struct NalUnit {
    /// nal_unit_type, low five bits of the header byte
    pub nal_type: u8,
    /// nal_ref_idc, bits 5..7 of the header byte
    pub nal_ref_idc: u8,
    /// Header byte plus RBSP payload (emulation prevention removed)
    pub data: Bytes,
}

impl NalUnit {
    /// Wraps `data`, whose first byte must be the NAL header
    pub fn new(data: Bytes) -> Self {
        let header = data.first().copied().unwrap_or(0);
        Self {
            nal_type: header & 0x1F,
            nal_ref_idc: (header >> 5) & 0x03,
            data,
        }
    }

    /// Whether this unit starts a sync point (IDR slice)
    pub fn is_keyframe(&self) -> bool {
        NalUnitType::from(self.nal_type) == NalUnitType::CodedSliceIdr
    }
}

/// H.264 NAL unit types (Rec. ITU-T H.264 Table 7-1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum NalUnitType {
    Unspecified = 0,
    CodedSliceNonIdr = 1,
    CodedSliceDataPartitionA = 2,
    CodedSliceDataPartitionB = 3,
    CodedSliceDataPartitionC = 4,
    CodedSliceIdr = 5,
    Sei = 6,
    Sps = 7,
    Pps = 8,
    AccessUnitDelimiter = 9,
    EndOfSequence = 10,
    EndOfStream = 11,
    FillerData = 12,
}

impl From<u8> for NalUnitType {
    fn from(value: u8) -> Self {
        match value {
            1 => NalUnitType::CodedSliceNonIdr,
            2 => NalUnitType::CodedSliceDataPartitionA,
            3 => NalUnitType::CodedSliceDataPartitionB,
            4 => NalUnitType::CodedSliceDataPartitionC,
            5 => NalUnitType::CodedSliceIdr,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::AccessUnitDelimiter,
            10 => NalUnitType::EndOfSequence,
            11 => NalUnitType::EndOfStream,
            12 => NalUnitType::FillerData,
            _ => NalUnitType::Unspecified,
        }
    }
}

/// Parsed fields of a sequence parameter set.
#[derive(Debug, Clone, Default)]
pub struct SpsInfo {
    /// profile_idc
    pub profile_idc: u8,
    /// The six constraint_set flags plus two reserved bits, as one byte
    pub constraint_flags: u8,
    /// level_idc
    pub level_idc: u8,
    /// chroma_format_idc (1 = 4:2:0 when absent)
    pub chroma_format_idc: u32,
    /// Cropped display width in pixels
    pub width: u32,
    /// Cropped display height in pixels
    pub height: u32,
    /// Frames per second from VUI timing, when present
    pub frame_rate: Option<f64>,
    /// Sample aspect ratio from VUI, when present
    pub sample_aspect_ratio: Option<(u32, u32)>,
}

impl SpsInfo {
    /// RFC 6381 codec string, e.g. `avc1.4d001f`
    pub fn codec_string(&self) -> String {
        format!(
            "avc1.{:02x}{:02x}{:02x}",
            self.profile_idc, self.constraint_flags, self.level_idc
        )
    }
}

/// Parsed fields of a picture parameter set.
#[derive(Debug, Clone, Default)]
pub struct PpsInfo {
    /// pic_parameter_set_id
    pub pic_parameter_set_id: u32,
    /// seq_parameter_set_id the PPS refers to
    pub seq_parameter_set_id: u32,
    /// CABAC (true) vs CAVLC (false)
    pub entropy_coding_mode_flag: bool,
}

/// AVCDecoderConfigurationRecord, the `avcC` box body.
#[derive(Debug, Clone)]
pub struct AvcDecoderConfig {
    /// AVCProfileIndication
    pub profile_idc: u8,
    /// profile_compatibility byte
    pub constraint_flags: u8,
    /// AVCLevelIndication
    pub level_idc: u8,
    /// NAL length-word size in bytes (1, 2 or 4)
    pub length_size: usize,
    /// Sequence parameter sets, with headers, without emulation stripping
    pub sps: Vec<Bytes>,
    /// Picture parameter sets
    pub pps: Vec<Bytes>,
}

/// Table E-1 sample aspect ratios, indexed by aspect_ratio_idc 1..=16.
pub(crate) const SAR_TABLE: [(u32, u32); 17] = [
    (0, 0), // 0 = unspecified
    (1, 1),
    (12, 11),
    (10, 11),
    (16, 11),
    (40, 33),
    (24, 11),
    (20, 11),
    (32, 11),
    (80, 33),
    (18, 11),
    (15, 11),
    (64, 33),
    (160, 99),
    (4, 3),
    (3, 2),
    (2, 1),
];

/// aspect_ratio_idc value signalling an explicit SAR pair
pub(crate) const SAR_EXTENDED: u32 = 255;
