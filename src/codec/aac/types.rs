/// AAC sample rates by sampling_frequency_index
pub const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Output channel counts by channel_configuration (config 7 carries 7.1)
pub const CHANNEL_COUNTS: [u32; 8] = [0, 1, 2, 3, 4, 5, 6, 8];

/// Returns the sampling_frequency_index for `rate`, when it is a standard one
pub fn sample_rate_index(rate: u32) -> Option<u8> {
    SAMPLE_RATES.iter().position(|&r| r == rate).map(|i| i as u8)
}

/// AAC ADTS profile values (audio_object_type − 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileType {
    /// AAC Main
    Main = 0,
    /// AAC Low Complexity
    Lc = 1,
    /// AAC Scalable Sample Rate
    Ssr = 2,
    /// AAC Long Term Prediction
    Ltp = 3,
}

impl From<u8> for ProfileType {
    fn from(value: u8) -> Self {
        match value {
            0 => ProfileType::Main,
            1 => ProfileType::Lc,
            2 => ProfileType::Ssr,
            3 => ProfileType::Ltp,
            _ => ProfileType::Lc,
        }
    }
}

/// Decoded AudioSpecificConfig.
#[derive(Debug, Clone, PartialEq)]
pub struct AacConfig {
    /// Audio object type, after the 31-escape extension
    pub audio_object_type: u8,
    /// sampling_frequency_index (15 means the rate was explicit)
    pub sample_rate_index: u8,
    /// Sampling frequency in Hz
    pub sample_rate: u32,
    /// channel_configuration
    pub channel_configuration: u8,
    /// Output channels, mapped through [`CHANNEL_COUNTS`]
    pub channels: u32,
    /// Whether SBR is signalled (explicitly via AOT 5/29 or by sync extension)
    pub sbr: bool,
    /// Whether parametric stereo is signalled
    pub ps: bool,
    /// Samples per frame (1024, or 960 when the frame-length flag is set)
    pub frame_length: u16,
}

impl Default for AacConfig {
    fn default() -> Self {
        Self {
            audio_object_type: 2, // AAC-LC
            sample_rate_index: 4, // 44100 Hz
            sample_rate: 44100,
            channel_configuration: 2,
            channels: 2,
            sbr: false,
            ps: false,
            frame_length: 1024,
        }
    }
}

impl AacConfig {
    /// RFC 6381 codec string, e.g. `mp4a.40.2`
    pub fn codec_string(&self) -> String {
        format!("mp4a.40.{}", self.audio_object_type)
    }
}

/// Parsed ADTS frame header (7 bytes, 9 with CRC).
#[derive(Debug, Clone)]
pub struct AdtsHeader {
    /// Sync word, must be 0xFFF
    pub sync_word: u32,
    /// 0 = MPEG-4, 1 = MPEG-2
    pub id: u8,
    /// Always 0
    pub layer: u8,
    /// True when no CRC follows the 7-byte header
    pub protection_absent: bool,
    /// Profile (audio_object_type − 1)
    pub profile: ProfileType,
    /// sampling_frequency_index
    pub sample_rate_index: u8,
    /// private_bit
    pub private_bit: bool,
    /// channel_configuration
    pub channel_configuration: u8,
    /// original/copy flag
    pub original_copy: bool,
    /// home flag
    pub home: bool,
    /// copyright_identification_bit
    pub copyright_id_bit: bool,
    /// copyright_identification_start
    pub copyright_id_start: bool,
    /// Whole frame length including the header, 13 bits
    pub frame_length: u16,
    /// adts_buffer_fullness
    pub buffer_fullness: u16,
    /// number_of_raw_data_blocks_in_frame − 1
    pub number_of_raw_blocks: u8,
}

impl AdtsHeader {
    /// Whether the sync word is intact
    pub fn sync_word_valid(&self) -> bool {
        self.sync_word == 0xFFF
    }

    /// Header length in bytes: 7, or 9 when a CRC is present
    pub fn header_len(&self) -> usize {
        if self.protection_absent {
            7
        } else {
            9
        }
    }

    /// Sample rate from the header's frequency index
    pub fn sample_rate(&self) -> Option<u32> {
        SAMPLE_RATES.get(self.sample_rate_index as usize).copied()
    }

    /// Serializes the 7-byte header
    pub fn to_bytes(&self) -> [u8; 7] {
        let mut bytes = [0u8; 7];

        bytes[0] = (self.sync_word >> 4) as u8;
        bytes[1] = ((self.sync_word & 0xF) << 4) as u8
            | ((self.id & 0x1) << 3)
            | ((self.layer & 0x3) << 1)
            | (self.protection_absent as u8);
        bytes[2] = ((self.profile as u8) << 6)
            | ((self.sample_rate_index & 0xF) << 2)
            | ((self.private_bit as u8) << 1)
            | ((self.channel_configuration >> 2) & 0x1);
        bytes[3] = ((self.channel_configuration & 0x3) << 6)
            | ((self.original_copy as u8) << 5)
            | ((self.home as u8) << 4)
            | ((self.copyright_id_bit as u8) << 3)
            | ((self.copyright_id_start as u8) << 2)
            | ((self.frame_length >> 11) & 0x3) as u8;
        bytes[4] = ((self.frame_length >> 3) & 0xFF) as u8;
        bytes[5] = ((self.frame_length & 0x7) << 5) as u8 | ((self.buffer_fullness >> 6) & 0x1F) as u8;
        bytes[6] = ((self.buffer_fullness & 0x3F) << 2) as u8 | (self.number_of_raw_blocks & 0x3);

        bytes
    }

    /// Builds an ADTS header framing `payload_len` bytes of raw AAC
    pub fn for_frame(config: &AacConfig, payload_len: usize) -> Self {
        Self {
            sync_word: 0xFFF,
            id: 0,
            layer: 0,
            protection_absent: true,
            profile: ProfileType::from(config.audio_object_type.saturating_sub(1)),
            sample_rate_index: config.sample_rate_index,
            private_bit: false,
            channel_configuration: config.channel_configuration,
            original_copy: false,
            home: false,
            copyright_id_bit: false,
            copyright_id_start: false,
            frame_length: (payload_len + 7) as u16,
            buffer_fullness: 0x7FF,
            number_of_raw_blocks: 0,
        }
    }
}

/// One raw AAC frame with the configuration it was parsed under.
#[derive(Debug, Clone)]
pub struct AacFrame {
    /// Stream configuration in effect for this frame
    pub config: AacConfig,
    /// Raw AAC payload without ADTS framing
    pub data: Vec<u8>,
}

impl AacFrame {
    /// Pairs `data` with `config`
    pub fn new(config: AacConfig, data: Vec<u8>) -> Self {
        Self { config, data }
    }
}
