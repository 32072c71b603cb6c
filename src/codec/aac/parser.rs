use super::types::{AacConfig, AacFrame, AdtsHeader, ProfileType, CHANNEL_COUNTS, SAMPLE_RATES};
use crate::utils::{BitReader, BitWriter};
use crate::{RemuxError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Marker value that extends the 5-bit audio object type field
const AOT_ESCAPE: u32 = 31;
/// sampling_frequency_index value signalling an explicit 24-bit rate
const FREQ_ESCAPE: u32 = 15;
/// Sync-extension signature carrying implicit SBR signalling
const SYNC_EXTENSION: u32 = 0x2B7;

/// Parses an AudioSpecificConfig as stored in `esds` or Matroska
/// CodecPrivate.
pub fn parse_audio_specific_config(data: &[u8]) -> Result<AacConfig> {
    let mut reader = BitReader::new(data);

    let mut audio_object_type = read_audio_object_type(&mut reader)?;
    let (mut sample_rate_index, mut sample_rate) = read_sampling_frequency(&mut reader)?;
    let channel_configuration = reader.read_bits(4)? as u8;

    let mut sbr = false;
    let mut ps = false;

    // Explicit SBR/PS: AOT 5 (HE-AAC) or 29 (HE-AAC v2) wraps the real AOT
    if audio_object_type == 5 || audio_object_type == 29 {
        sbr = true;
        ps = audio_object_type == 29;
        let (ext_index, ext_rate) = read_sampling_frequency(&mut reader)?;
        sample_rate_index = ext_index;
        sample_rate = ext_rate;
        audio_object_type = read_audio_object_type(&mut reader)?;
    }

    // GASpecificConfig for the AAC family
    let mut frame_length = 1024u16;
    if matches!(audio_object_type, 1 | 2 | 3 | 4 | 6 | 7 | 17 | 19 | 20 | 21 | 22 | 23) {
        if reader.read_bit()? {
            frame_length = 960;
        }
        if reader.read_bit()? {
            // dependsOnCoreCoder
            reader.read_bits(14)?; // coreCoderDelay
        }
        reader.read_bit()?; // extensionFlag
    }

    // Implicit SBR/PS via the sync extension
    if !sbr && reader.remaining_bits() >= 16 {
        if reader.peek_bits(11)? == SYNC_EXTENSION {
            reader.read_bits(11)?;
            let ext_type = read_audio_object_type(&mut reader)?;
            if ext_type == 5 {
                sbr = reader.read_bit()?;
                if sbr {
                    let (ext_index, ext_rate) = read_sampling_frequency(&mut reader)?;
                    sample_rate_index = ext_index;
                    sample_rate = ext_rate;
                }
                if reader.remaining_bits() >= 12 && reader.peek_bits(11)? == 0x548 {
                    reader.read_bits(11)?;
                    ps = reader.read_bit()?;
                }
            }
        }
    }

    let channels = CHANNEL_COUNTS
        .get(channel_configuration as usize)
        .copied()
        .ok_or_else(|| {
            RemuxError::Unsupported(format!(
                "AAC channel configuration {}",
                channel_configuration
            ))
        })?;

    Ok(AacConfig {
        audio_object_type,
        sample_rate_index,
        sample_rate,
        channel_configuration,
        channels,
        sbr,
        ps,
        frame_length,
    })
}

fn read_audio_object_type(reader: &mut BitReader) -> Result<u8> {
    let aot = reader.read_bits(5)?;
    if aot == AOT_ESCAPE {
        Ok((32 + reader.read_bits(6)?) as u8)
    } else {
        Ok(aot as u8)
    }
}

fn read_sampling_frequency(reader: &mut BitReader) -> Result<(u8, u32)> {
    let index = reader.read_bits(4)?;
    if index == FREQ_ESCAPE {
        let rate = reader.read_bits(24)?;
        Ok((15, rate))
    } else {
        let rate = SAMPLE_RATES
            .get(index as usize)
            .copied()
            .ok_or_else(|| RemuxError::Malformed(format!("AAC frequency index {}", index)))?;
        Ok((index as u8, rate))
    }
}

/// Serializes a two-byte (or longer, for escapes) AudioSpecificConfig.
pub fn build_audio_specific_config(config: &AacConfig) -> Result<Bytes> {
    let mut writer = BitWriter::new();

    write_audio_object_type(&mut writer, config.audio_object_type)?;
    if config.sample_rate_index == 15 {
        writer.write_bits(15, 4)?;
        writer.write_bits(config.sample_rate, 24)?;
    } else {
        writer.write_bits(config.sample_rate_index as u32, 4)?;
    }
    writer.write_bits(config.channel_configuration as u32, 4)?;
    // GASpecificConfig
    writer.write_bit(config.frame_length == 960);
    writer.write_bit(false); // dependsOnCoreCoder
    writer.write_bit(false); // extensionFlag

    Ok(Bytes::from(writer.finish()))
}

fn write_audio_object_type(writer: &mut BitWriter, aot: u8) -> Result<()> {
    if aot >= 32 {
        writer.write_bits(AOT_ESCAPE, 5)?;
        writer.write_bits(aot as u32 - 32, 6)?;
    } else {
        writer.write_bits(aot as u32, 5)?;
    }
    Ok(())
}

/// Incremental AAC parser over ADTS or raw frames.
#[derive(Debug, Default)]
pub struct AacParser {
    config: Option<AacConfig>,
}

impl AacParser {
    /// Creates a parser with no configuration seen yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses one frame, reading ADTS framing when present
    pub fn parse_frame(&mut self, data: &[u8]) -> Result<AacFrame> {
        if data.len() >= 7 {
            if let Ok(header) = parse_adts_header(data) {
                if header.sync_word_valid() {
                    let header_len = header.header_len();
                    let end = (header.frame_length as usize).min(data.len());
                    let frame_data = &data[header_len.min(end)..end];
                    let config = config_from_adts(&header);
                    self.config = Some(config.clone());
                    return Ok(AacFrame::new(config, frame_data.to_vec()));
                }
            }
        }

        if let Some(config) = &self.config {
            Ok(AacFrame::new(config.clone(), data.to_vec()))
        } else {
            Err(RemuxError::Malformed(
                "no AAC configuration available and data is not ADTS".into(),
            ))
        }
    }

    /// Seeds the parser with an out-of-band configuration
    pub fn set_config(&mut self, config: AacConfig) {
        self.config = Some(config);
    }

    /// The configuration currently in effect
    pub fn config(&self) -> Option<&AacConfig> {
        self.config.as_ref()
    }
}

/// Derives the stream configuration an ADTS header implies
pub fn config_from_adts(header: &AdtsHeader) -> AacConfig {
    let channel_configuration = header.channel_configuration;
    AacConfig {
        audio_object_type: header.profile as u8 + 1,
        sample_rate_index: header.sample_rate_index,
        sample_rate: header.sample_rate().unwrap_or(0),
        channel_configuration,
        channels: CHANNEL_COUNTS
            .get(channel_configuration as usize)
            .copied()
            .unwrap_or(channel_configuration as u32),
        sbr: false,
        ps: false,
        frame_length: 1024,
    }
}

/// Parses a 7/9-byte ADTS header.
pub fn parse_adts_header(data: &[u8]) -> Result<AdtsHeader> {
    if data.len() < 7 {
        return Err(RemuxError::Truncated("ADTS header".into()));
    }

    let mut reader = BitReader::new(data);

    let sync_word = reader.read_bits(12)?;
    if sync_word != 0xFFF {
        return Err(RemuxError::Malformed("invalid ADTS sync word".into()));
    }

    let id = reader.read_bits(1)? as u8;
    let layer = reader.read_bits(2)? as u8;
    let protection_absent = reader.read_bit()?;

    let profile = ProfileType::from(reader.read_bits(2)? as u8);
    let sample_rate_index = reader.read_bits(4)? as u8;
    let private_bit = reader.read_bit()?;
    let channel_configuration = reader.read_bits(3)? as u8;
    let original_copy = reader.read_bit()?;
    let home = reader.read_bit()?;

    let copyright_id_bit = reader.read_bit()?;
    let copyright_id_start = reader.read_bit()?;
    let frame_length = reader.read_bits(13)? as u16;
    let buffer_fullness = reader.read_bits(11)? as u16;
    let number_of_raw_blocks = reader.read_bits(2)? as u8;

    Ok(AdtsHeader {
        sync_word,
        id,
        layer,
        protection_absent,
        profile,
        sample_rate_index,
        private_bit,
        channel_configuration,
        original_copy,
        home,
        copyright_id_bit,
        copyright_id_start,
        frame_length,
        buffer_fullness,
        number_of_raw_blocks,
    })
}

// MPEG-4 descriptor tags used inside esds
const TAG_ES_DESCRIPTOR: u8 = 0x03;
const TAG_DECODER_CONFIG: u8 = 0x04;
const TAG_DECODER_SPECIFIC: u8 = 0x05;
const TAG_SL_CONFIG: u8 = 0x06;

/// Extracts the AudioSpecificConfig from an `esds` box body
/// (version/flags included).
pub fn parse_esds(data: &[u8]) -> Result<AacConfig> {
    if data.len() < 4 {
        return Err(RemuxError::Truncated("esds box body".into()));
    }
    let asc = find_decoder_specific_info(&data[4..])
        .ok_or_else(|| RemuxError::Malformed("esds without DecoderSpecificInfo".into()))?;
    parse_audio_specific_config(asc)
}

fn find_decoder_specific_info(data: &[u8]) -> Option<&[u8]> {
    let mut pos = 0;
    while pos < data.len() {
        let tag = data[pos];
        pos += 1;
        let (len, consumed) = read_descriptor_length(&data[pos..])?;
        pos += consumed;
        let end = pos.checked_add(len)?;
        if end > data.len() {
            return None;
        }
        match tag {
            TAG_DECODER_SPECIFIC => return Some(&data[pos..end]),
            // Container descriptors: ES carries a 3-byte header before its
            // children, DecoderConfig a 13-byte one
            TAG_ES_DESCRIPTOR => {
                if len < 3 {
                    return None;
                }
                pos += 3;
            }
            TAG_DECODER_CONFIG => {
                if len < 13 {
                    return None;
                }
                pos += 13;
            }
            _ => pos = end,
        }
    }
    None
}

fn read_descriptor_length(data: &[u8]) -> Option<(usize, usize)> {
    let mut len = 0usize;
    for (i, &b) in data.iter().take(4).enumerate() {
        len = (len << 7) | (b & 0x7F) as usize;
        if b & 0x80 == 0 {
            return Some((len, i + 1));
        }
    }
    None
}

/// Builds an `esds` box body (version/flags + ES_Descriptor) for `config`.
pub fn build_esds(config: &AacConfig) -> Result<Bytes> {
    let asc = build_audio_specific_config(config)?;
    build_esds_with_asc(&asc)
}

/// Builds an `esds` box body embedding an existing AudioSpecificConfig
/// verbatim.
pub fn build_esds_with_asc(asc: &[u8]) -> Result<Bytes> {
    let dec_specific_len = asc.len();
    let dec_config_len = 13 + 2 + dec_specific_len;
    let sl_len = 1;
    let es_len = 3 + 2 + dec_config_len + 2 + sl_len;

    let mut buf = BytesMut::new();
    buf.put_u32(0); // full-box version + flags

    buf.put_u8(TAG_ES_DESCRIPTOR);
    buf.put_u8(es_len as u8);
    buf.put_u16(1); // ES_ID
    buf.put_u8(0); // flags

    buf.put_u8(TAG_DECODER_CONFIG);
    buf.put_u8(dec_config_len as u8);
    buf.put_u8(0x40); // objectTypeIndication: MPEG-4 audio
    buf.put_u8(0x15); // streamType audio, upStream 0, reserved 1
    buf.put_slice(&[0, 0, 0]); // bufferSizeDB
    buf.put_u32(0); // maxBitrate
    buf.put_u32(0); // avgBitrate

    buf.put_u8(TAG_DECODER_SPECIFIC);
    buf.put_u8(dec_specific_len as u8);
    buf.put_slice(asc);

    buf.put_u8(TAG_SL_CONFIG);
    buf.put_u8(sl_len as u8);
    buf.put_u8(0x02);

    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_asc_lc_stereo() {
        // AOT 2 (LC), index 4 (44100), channels 2: 0x12 0x10
        let config = parse_audio_specific_config(&[0x12, 0x10]).unwrap();
        assert_eq!(config.audio_object_type, 2);
        assert_eq!(config.sample_rate, 44100);
        assert_eq!(config.channels, 2);
        assert!(!config.sbr);
        assert_eq!(config.codec_string(), "mp4a.40.2");
    }

    #[test]
    fn test_parse_asc_explicit_sbr() {
        // AOT 5 (HE-AAC), 24000 core -> ext index 3 (48000), channels 2,
        // inner AOT 2
        let mut w = BitWriter::new();
        w.write_bits(5, 5).unwrap();
        w.write_bits(6, 4).unwrap(); // 24000
        w.write_bits(2, 4).unwrap(); // channels
        w.write_bits(3, 4).unwrap(); // extension: 48000
        w.write_bits(2, 5).unwrap(); // inner AOT LC
        w.write_bit(false); // frame length 1024
        w.write_bit(false); // dependsOnCoreCoder
        w.write_bit(false); // extensionFlag
        let config = parse_audio_specific_config(&w.finish()).unwrap();
        assert!(config.sbr);
        assert!(!config.ps);
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.audio_object_type, 2);
    }

    #[test]
    fn test_parse_asc_implicit_sbr_sync_extension() {
        // LC 24000 stereo followed by the 0x2B7 sync extension marking SBR
        // up to 48000
        let mut w = BitWriter::new();
        w.write_bits(2, 5).unwrap();
        w.write_bits(6, 4).unwrap(); // 24000
        w.write_bits(2, 4).unwrap();
        w.write_bit(false);
        w.write_bit(false);
        w.write_bit(false);
        w.write_bits(0x2B7, 11).unwrap();
        w.write_bits(5, 5).unwrap(); // extension AOT = SBR
        w.write_bit(true); // sbrPresentFlag
        w.write_bits(3, 4).unwrap(); // 48000
        let config = parse_audio_specific_config(&w.finish()).unwrap();
        assert!(config.sbr);
        assert_eq!(config.sample_rate, 48000);
    }

    #[test]
    fn test_parse_asc_explicit_frequency() {
        let mut w = BitWriter::new();
        w.write_bits(2, 5).unwrap();
        w.write_bits(15, 4).unwrap(); // escape
        w.write_bits(12345, 24).unwrap();
        w.write_bits(1, 4).unwrap();
        w.write_bit(false);
        w.write_bit(false);
        w.write_bit(false);
        let config = parse_audio_specific_config(&w.finish()).unwrap();
        assert_eq!(config.sample_rate, 12345);
        assert_eq!(config.channels, 1);
    }

    #[test]
    fn test_asc_round_trip() {
        let config = AacConfig {
            audio_object_type: 2,
            sample_rate_index: 3,
            sample_rate: 48000,
            channel_configuration: 2,
            channels: 2,
            sbr: false,
            ps: false,
            frame_length: 1024,
        };
        let asc = build_audio_specific_config(&config).unwrap();
        assert_eq!(parse_audio_specific_config(&asc).unwrap(), config);
    }

    #[test]
    fn test_parse_adts_header() {
        // AAC-LC, 44.1 kHz, stereo
        let data = [0xFF, 0xF1, 0x50, 0x80, 0x43, 0x80, 0x00];
        let header = parse_adts_header(&data).unwrap();
        assert!(header.sync_word_valid());
        assert_eq!(header.profile, ProfileType::Lc);
        assert_eq!(header.sample_rate_index, 4);
        assert_eq!(header.channel_configuration, 2);
        assert_eq!(header.frame_length, 540);
    }

    #[test]
    fn test_parse_frame_strips_adts() {
        let config = AacConfig::default();
        let payload = [1u8, 2, 3, 4];
        let header = AdtsHeader::for_frame(&config, payload.len());
        let mut data = header.to_bytes().to_vec();
        data.extend_from_slice(&payload);

        let mut parser = AacParser::new();
        let frame = parser.parse_frame(&data).unwrap();
        assert_eq!(frame.data, payload);
        assert_eq!(frame.config.sample_rate, 44100);
    }

    #[test]
    fn test_invalid_sync_word() {
        let data = [0x00, 0x00, 0x50, 0x80, 0x43, 0x80, 0x00];
        assert!(parse_adts_header(&data).is_err());
    }

    #[test]
    fn test_esds_round_trip() {
        let config = AacConfig::default();
        let esds = build_esds(&config).unwrap();
        let parsed = parse_esds(&esds).unwrap();
        assert_eq!(parsed, config);
    }
}
