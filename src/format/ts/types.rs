use crate::av::CodecId;
use bytes::{BufMut, BytesMut};

// PIDs
/// PID of the Program Association Table
pub const PID_PAT: u16 = 0x0000;
/// PID assigned to the Program Map Table by the muxer
pub const PID_PMT: u16 = 0x1000;
/// First elementary PID assigned by the muxer (video first)
pub const PID_ELEMENTARY_BASE: u16 = 0x0100;

// Table IDs
/// Table ID of the PAT
pub const TABLE_ID_PAT: u8 = 0x00;
/// Table ID of the PMT
pub const TABLE_ID_PMT: u8 = 0x02;

// Stream IDs used in PES headers
/// PES stream id for video elementary streams
pub const STREAM_ID_VIDEO: u8 = 0xE0;
/// PES stream id for audio elementary streams
pub const STREAM_ID_AUDIO: u8 = 0xC0;

/// Size of a Transport Stream packet in bytes
pub const TS_PACKET_SIZE: usize = 188;
/// Size of the fixed Transport Stream header in bytes
pub const TS_HEADER_SIZE: usize = 4;
/// Clock frequency for PTS/DTS values in Hz
pub const PTS_HZ: u64 = 90_000;
/// Clock frequency for the Program Clock Reference in Hz
pub const PCR_HZ: u64 = 27_000_000;

/// Maps a PMT stream_type to a codec tag.
pub fn codec_from_stream_type(stream_type: u8) -> Option<CodecId> {
    match stream_type {
        0x01 => Some(CodecId::Mpeg1),
        0x02 => Some(CodecId::Mpeg2),
        0x03 | 0x04 => Some(CodecId::Mp3),
        0x0F => Some(CodecId::Aac),
        0x1B => Some(CodecId::H264),
        0x24 => Some(CodecId::H265),
        0x81 => Some(CodecId::Ac3),
        0x82 => Some(CodecId::Dts),
        0x83 => Some(CodecId::TrueHd),
        _ => None,
    }
}

/// Maps a codec tag to its PMT stream_type.
pub fn stream_type_from_codec(codec: CodecId) -> Option<u8> {
    match codec {
        CodecId::Mpeg1 => Some(0x01),
        CodecId::Mpeg2 => Some(0x02),
        CodecId::Mp3 => Some(0x03),
        CodecId::Aac => Some(0x0F),
        CodecId::H264 => Some(0x1B),
        CodecId::H265 => Some(0x24),
        CodecId::Ac3 => Some(0x81),
        CodecId::Dts => Some(0x82),
        CodecId::TrueHd => Some(0x83),
        _ => None,
    }
}

/// One entry of the Program Association Table.
#[derive(Debug, Clone)]
pub struct PatEntry {
    /// Program number; 0 denotes the network PID
    pub program_number: u16,
    /// NIT PID when program_number is 0
    pub network_pid: u16,
    /// PMT PID for real programs
    pub program_map_pid: u16,
}

/// Program Association Table: maps program numbers to PMT PIDs.
#[derive(Debug, Clone, Default)]
pub struct Pat {
    /// Program entries in table order
    pub entries: Vec<PatEntry>,
}

impl Pat {
    /// Creates an empty PAT
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes the program loop (without section header or CRC)
    pub fn write_to(&self, buf: &mut BytesMut) {
        for entry in &self.entries {
            buf.put_u16(entry.program_number);
            let pid = if entry.program_number == 0 {
                entry.network_pid
            } else {
                entry.program_map_pid
            };
            buf.put_u16(pid & 0x1FFF | 7 << 13);
        }
    }
}

/// A descriptor attached to a program or elementary stream.
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// Descriptor tag
    pub tag: u8,
    /// Raw descriptor payload
    pub data: Vec<u8>,
}

/// One elementary-stream entry of the PMT.
#[derive(Debug, Clone)]
pub struct ElementaryStreamInfo {
    /// stream_type (encoding format)
    pub stream_type: u8,
    /// PID carrying the elementary stream
    pub elementary_pid: u16,
    /// ES-level descriptors
    pub descriptors: Vec<Descriptor>,
}

/// Program Map Table: the streams of one program.
#[derive(Debug, Clone, Default)]
pub struct Pmt {
    /// PID carrying the program clock reference
    pub pcr_pid: u16,
    /// Program-level descriptors
    pub program_descriptors: Vec<Descriptor>,
    /// Elementary streams in table order
    pub elementary_stream_infos: Vec<ElementaryStreamInfo>,
}

impl Pmt {
    /// Creates an empty PMT
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes the PMT body (without section header or CRC)
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.pcr_pid & 0x1FFF | 7 << 13);

        let prog_desc_len: usize = self
            .program_descriptors
            .iter()
            .map(|d| 2 + d.data.len())
            .sum();
        buf.put_u16((prog_desc_len as u16) & 0x3FF | 0xF << 12);
        for desc in &self.program_descriptors {
            buf.put_u8(desc.tag);
            buf.put_u8(desc.data.len() as u8);
            buf.put_slice(&desc.data);
        }

        for info in &self.elementary_stream_infos {
            buf.put_u8(info.stream_type);
            buf.put_u16(info.elementary_pid & 0x1FFF | 7 << 13);
            let es_desc_len: usize = info.descriptors.iter().map(|d| 2 + d.data.len()).sum();
            buf.put_u16((es_desc_len as u16) & 0x3FF | 0xF << 12);
            for desc in &info.descriptors {
                buf.put_u8(desc.tag);
                buf.put_u8(desc.data.len() as u8);
                buf.put_slice(&desc.data);
            }
        }
    }
}

/// Optional adaptation field of a TS packet.
#[derive(Debug, Clone, Default)]
pub struct AdaptationField {
    /// Field length byte (bytes following it)
    pub length: usize,
    /// Discontinuity indicator
    pub discontinuity: bool,
    /// Random access indicator (stream start or keyframe)
    pub random_access: bool,
    /// Elementary stream priority indicator
    pub es_priority: bool,
    /// Whether a PCR follows
    pub pcr_flag: bool,
    /// Whether an OPCR follows
    pub opcr_flag: bool,
    /// Splicing point flag
    pub splicing_point_flag: bool,
    /// Private data flag
    pub private_data_flag: bool,
    /// Extension flag
    pub extension_flag: bool,
    /// PCR in 27 MHz units (base × 300 + extension)
    pub pcr: Option<u64>,
    /// Original PCR in 27 MHz units
    pub opcr: Option<u64>,
    /// Packets until a splicing point
    pub splice_countdown: Option<i8>,
    /// Private data bytes
    pub private_data: Option<Vec<u8>>,
}

/// The fixed 4-byte Transport Stream packet header.
#[derive(Debug, Clone)]
pub struct TsHeader {
    /// Always 0x47
    pub sync_byte: u8,
    /// Uncorrectable-error flag
    pub transport_error: bool,
    /// Set when a PES packet or PSI section starts in this payload
    pub payload_unit_start: bool,
    /// Priority flag
    pub transport_priority: bool,
    /// 13-bit packet identifier
    pub pid: u16,
    /// Scrambling mode (0 = clear)
    pub scrambling_control: u8,
    /// Whether an adaptation field is present
    pub adaptation_field_exists: bool,
    /// Whether a payload is present
    pub contains_payload: bool,
    /// 4-bit continuity counter
    pub continuity_counter: u8,
}

impl Default for TsHeader {
    fn default() -> Self {
        Self {
            sync_byte: 0x47,
            transport_error: false,
            payload_unit_start: false,
            transport_priority: false,
            pid: 0,
            scrambling_control: 0,
            adaptation_field_exists: false,
            contains_payload: true,
            continuity_counter: 0,
        }
    }
}

impl TsHeader {
    /// Writes the 4-byte header
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.sync_byte);

        let mut b1 = 0u8;
        if self.transport_error {
            b1 |= 0x80;
        }
        if self.payload_unit_start {
            b1 |= 0x40;
        }
        if self.transport_priority {
            b1 |= 0x20;
        }
        b1 |= ((self.pid >> 8) & 0x1F) as u8;
        buf.put_u8(b1);
        buf.put_u8((self.pid & 0xFF) as u8);

        let mut b3 = self.scrambling_control << 6;
        if self.adaptation_field_exists {
            b3 |= 0x20;
        }
        if self.contains_payload {
            b3 |= 0x10;
        }
        b3 |= self.continuity_counter & 0x0F;
        buf.put_u8(b3);
    }
}

/// Converts a 27 MHz PCR value to seconds
pub fn pcr_to_seconds(pcr: u64) -> f64 {
    pcr as f64 / PCR_HZ as f64
}

/// Converts seconds to a 27 MHz PCR value
pub fn seconds_to_pcr(seconds: f64) -> u64 {
    (seconds * PCR_HZ as f64).round() as u64
}

/// Converts a 90 kHz PTS/DTS value to seconds
pub fn pts_to_seconds(pts: u64) -> f64 {
    pts as f64 / PTS_HZ as f64
}

/// Converts seconds to a 33-bit 90 kHz PTS/DTS value
pub fn seconds_to_pts(seconds: f64) -> u64 {
    (seconds * PTS_HZ as f64).round() as u64 & 0x1_FFFF_FFFF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_write() {
        let header = TsHeader {
            payload_unit_start: true,
            pid: 0x100,
            continuity_counter: 5,
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        assert_eq!(buf.as_ref(), &[0x47, 0x41, 0x00, 0x15]);
    }

    #[test]
    fn test_stream_type_map() {
        assert_eq!(codec_from_stream_type(0x1B), Some(CodecId::H264));
        assert_eq!(codec_from_stream_type(0x0F), Some(CodecId::Aac));
        assert_eq!(codec_from_stream_type(0x24), Some(CodecId::H265));
        assert_eq!(codec_from_stream_type(0x04), Some(CodecId::Mp3));
        assert_eq!(codec_from_stream_type(0x99), None);
        assert_eq!(stream_type_from_codec(CodecId::H264), Some(0x1B));
        assert_eq!(stream_type_from_codec(CodecId::Vp9), None);
    }

    #[test]
    fn test_pts_seconds_round_trip() {
        let pts = seconds_to_pts(1.5);
        assert_eq!(pts, 135_000);
        assert!((pts_to_seconds(pts) - 1.5).abs() < 1e-9);
    }
}
