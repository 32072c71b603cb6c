use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;

use super::types::{AvcDecoderConfig, NalUnit, NalUnitType, PpsInfo, SpsInfo, SAR_EXTENDED, SAR_TABLE};
use crate::codec::nal::strip_emulation_prevention;
use crate::utils::BitReader;
use crate::{RemuxError, Result};

/// Profiles that carry the chroma-format / bit-depth / scaling-list block
/// in their SPS.
const HIGH_FAMILY_PROFILES: [u8; 13] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134, 135];

#[derive(Debug, Default)]
struct ParserState {
    sps: Option<SpsInfo>,
    pps: Option<PpsInfo>,
}

/// Incremental H.264 parameter-set parser.
///
/// Feed NAL units through [`H264Parser::parse_nalu`]; SPS and PPS contents
/// accumulate so later queries (dimensions, codec string) can be answered
/// once the stream has produced its parameter sets.
#[derive(Debug)]
pub struct H264Parser {
    state: Arc<Mutex<ParserState>>,
}

impl H264Parser {
    /// Creates a parser with no parameter sets seen yet
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ParserState::default())),
        }
    }

    /// Parses one NAL unit, updating SPS/PPS state when applicable
    pub fn parse_nalu(&mut self, data: &[u8]) -> Result<NalUnit> {
        if data.is_empty() {
            return Err(RemuxError::Truncated("empty NAL unit".into()));
        }
        let data = Bytes::from(strip_emulation_prevention(data));
        let nalu = NalUnit::new(data.clone());

        match NalUnitType::from(nalu.nal_type) {
            NalUnitType::Sps => {
                let sps = parse_sps_rbsp(&data[1..])?;
                log::debug!(
                    "h264 sps: profile={} level={} {}x{}",
                    sps.profile_idc,
                    sps.level_idc,
                    sps.width,
                    sps.height
                );
                self.state.lock().sps = Some(sps);
            }
            NalUnitType::Pps => {
                self.state.lock().pps = Some(parse_pps_rbsp(&data[1..])?);
            }
            _ => {}
        }

        Ok(nalu)
    }

    /// Cropped dimensions from the most recent SPS
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.state.lock().sps.as_ref().map(|sps| (sps.width, sps.height))
    }

    /// Frame rate from the most recent SPS VUI timing, when present
    pub fn frame_rate(&self) -> Option<f64> {
        self.state.lock().sps.as_ref().and_then(|sps| sps.frame_rate)
    }

    /// Codec string (`avc1.PPCCLL`) from the most recent SPS
    pub fn codec_string(&self) -> Option<String> {
        self.state.lock().sps.as_ref().map(|sps| sps.codec_string())
    }

    /// Whether the unit is an IDR slice
    pub fn is_keyframe(&self, nalu: &NalUnit) -> bool {
        nalu.is_keyframe()
    }
}

impl Default for H264Parser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses an SPS RBSP (NAL header already removed, emulation prevention
/// already stripped).
pub fn parse_sps_rbsp(data: &[u8]) -> Result<SpsInfo> {
    let mut reader = BitReader::new(data);

    let profile_idc = reader.read_bits(8)? as u8;
    let constraint_flags = reader.read_bits(8)? as u8;
    let level_idc = reader.read_bits(8)? as u8;
    reader.read_golomb()?; // seq_parameter_set_id

    let mut chroma_format_idc = 1u32;
    let mut separate_colour_plane = false;

    if HIGH_FAMILY_PROFILES.contains(&profile_idc) {
        chroma_format_idc = reader.read_golomb()?;
        if chroma_format_idc == 3 {
            separate_colour_plane = reader.read_bit()?;
        }
        reader.read_golomb()?; // bit_depth_luma_minus8
        reader.read_golomb()?; // bit_depth_chroma_minus8
        reader.read_bit()?; // qpprime_y_zero_transform_bypass_flag

        if reader.read_bit()? {
            // seq_scaling_matrix_present_flag
            let count = if chroma_format_idc != 3 { 8 } else { 12 };
            for i in 0..count {
                if reader.read_bit()? {
                    skip_scaling_list(&mut reader, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    reader.read_golomb()?; // log2_max_frame_num_minus4
    let pic_order_cnt_type = reader.read_golomb()?;

    if pic_order_cnt_type == 0 {
        reader.read_golomb()?; // log2_max_pic_order_cnt_lsb_minus4
    } else if pic_order_cnt_type == 1 {
        reader.read_bit()?; // delta_pic_order_always_zero_flag
        reader.read_signed_golomb()?; // offset_for_non_ref_pic
        reader.read_signed_golomb()?; // offset_for_top_to_bottom_field
        let cycle_len = reader.read_golomb()?;
        for _ in 0..cycle_len {
            reader.read_signed_golomb()?;
        }
    }

    reader.read_golomb()?; // max_num_ref_frames
    reader.read_bit()?; // gaps_in_frame_num_value_allowed_flag

    let pic_width_in_mbs = reader.read_golomb()? + 1;
    let pic_height_in_map_units = reader.read_golomb()? + 1;
    let frame_mbs_only = reader.read_bit()?;
    if !frame_mbs_only {
        reader.read_bit()?; // mb_adaptive_frame_field_flag
    }
    reader.read_bit()?; // direct_8x8_inference_flag

    let mut crop = (0u32, 0u32, 0u32, 0u32);
    if reader.read_bit()? {
        // frame_cropping_flag
        crop = (
            reader.read_golomb()?,
            reader.read_golomb()?,
            reader.read_golomb()?,
            reader.read_golomb()?,
        );
    }

    // Crop units depend on the chroma subsampling (Table 6-1); with
    // separate colour planes the luma grid applies.
    let chroma_array_type = if separate_colour_plane { 0 } else { chroma_format_idc };
    let (sub_width_c, sub_height_c) = match chroma_array_type {
        1 => (2, 2),
        2 => (2, 1),
        3 => (1, 1),
        _ => (1, 1),
    };
    let crop_unit_x = if chroma_array_type == 0 { 1 } else { sub_width_c };
    let crop_unit_y = (if chroma_array_type == 0 { 1 } else { sub_height_c })
        * (2 - frame_mbs_only as u32);

    let frame_height_in_mbs = (2 - frame_mbs_only as u32) * pic_height_in_map_units;
    let width = pic_width_in_mbs * 16 - crop_unit_x * (crop.0 + crop.1);
    let height = frame_height_in_mbs * 16 - crop_unit_y * (crop.2 + crop.3);

    let mut sps = SpsInfo {
        profile_idc,
        constraint_flags,
        level_idc,
        chroma_format_idc,
        width,
        height,
        frame_rate: None,
        sample_aspect_ratio: None,
    };

    if reader.remaining_bits() > 0 && reader.read_bit()? {
        // vui_parameters_present_flag
        parse_vui(&mut reader, &mut sps)?;
    }

    Ok(sps)
}

fn parse_vui(reader: &mut BitReader, sps: &mut SpsInfo) -> Result<()> {
    if reader.read_bit()? {
        // aspect_ratio_info_present_flag
        let idc = reader.read_bits(8)?;
        if idc == SAR_EXTENDED {
            let w = reader.read_bits(16)?;
            let h = reader.read_bits(16)?;
            sps.sample_aspect_ratio = Some((w, h));
        } else if (idc as usize) < SAR_TABLE.len() && idc > 0 {
            sps.sample_aspect_ratio = Some(SAR_TABLE[idc as usize]);
        }
    }

    if reader.read_bit()? {
        // overscan_info_present_flag
        reader.read_bit()?;
    }

    if reader.read_bit()? {
        // video_signal_type_present_flag
        reader.read_bits(3)?; // video_format
        reader.read_bit()?; // video_full_range_flag
        if reader.read_bit()? {
            // colour_description_present_flag
            reader.read_bits(24)?; // primaries, transfer, matrix
        }
    }

    if reader.read_bit()? {
        // chroma_loc_info_present_flag
        reader.read_golomb()?;
        reader.read_golomb()?;
    }

    if reader.read_bit()? {
        // timing_info_present_flag
        let num_units_in_tick = reader.read_bits(32)?;
        let time_scale = reader.read_bits(32)?;
        if num_units_in_tick > 0 {
            // AVC field-based timing: two ticks per frame
            sps.frame_rate = Some(time_scale as f64 / (2.0 * num_units_in_tick as f64));
        }
    }

    Ok(())
}

/// Parses a PPS RBSP (NAL header removed, emulation prevention stripped).
pub fn parse_pps_rbsp(data: &[u8]) -> Result<PpsInfo> {
    let mut reader = BitReader::new(data);

    Ok(PpsInfo {
        pic_parameter_set_id: reader.read_golomb()?,
        seq_parameter_set_id: reader.read_golomb()?,
        entropy_coding_mode_flag: reader.read_bit()?,
    })
}

fn skip_scaling_list(reader: &mut BitReader, size: usize) -> Result<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;

    for _ in 0..size {
        if next_scale != 0 {
            let delta_scale = reader.read_signed_golomb()?;
            next_scale = (last_scale + delta_scale + 256) % 256;
        }
        last_scale = if next_scale == 0 { last_scale } else { next_scale };
    }

    Ok(())
}

/// Parses an `avcC` AVCDecoderConfigurationRecord body.
pub fn parse_avc_config(data: &[u8]) -> Result<AvcDecoderConfig> {
    if data.len() < 7 {
        return Err(RemuxError::Truncated("avcC record".into()));
    }
    if data[0] != 1 {
        return Err(RemuxError::Malformed(format!(
            "avcC configurationVersion {}",
            data[0]
        )));
    }

    let profile_idc = data[1];
    let constraint_flags = data[2];
    let level_idc = data[3];
    let length_size = (data[4] & 0x03) as usize + 1;

    let mut pos = 5;
    let sps_count = (data[pos] & 0x1F) as usize;
    pos += 1;
    let mut sps = Vec::with_capacity(sps_count);
    for _ in 0..sps_count {
        let (set, next) = read_parameter_set(data, pos)?;
        sps.push(set);
        pos = next;
    }

    if pos >= data.len() {
        return Err(RemuxError::Truncated("avcC PPS count".into()));
    }
    let pps_count = data[pos] as usize;
    pos += 1;
    let mut pps = Vec::with_capacity(pps_count);
    for _ in 0..pps_count {
        let (set, next) = read_parameter_set(data, pos)?;
        pps.push(set);
        pos = next;
    }

    Ok(AvcDecoderConfig {
        profile_idc,
        constraint_flags,
        level_idc,
        length_size,
        sps,
        pps,
    })
}

fn read_parameter_set(data: &[u8], pos: usize) -> Result<(Bytes, usize)> {
    if pos + 2 > data.len() {
        return Err(RemuxError::Truncated("avcC parameter-set length".into()));
    }
    let len = ((data[pos] as usize) << 8) | data[pos + 1] as usize;
    let start = pos + 2;
    if start + len > data.len() {
        return Err(RemuxError::Truncated("avcC parameter-set body".into()));
    }
    Ok((Bytes::copy_from_slice(&data[start..start + len]), start + len))
}

/// Builds an `avcC` record from raw SPS/PPS NAL units (with headers).
pub fn build_avc_config(sps: &[&[u8]], pps: &[&[u8]], length_size: usize) -> Result<Bytes> {
    let first = sps
        .first()
        .ok_or_else(|| RemuxError::Config("avcC requires at least one SPS".into()))?;
    if first.len() < 4 {
        return Err(RemuxError::Truncated("SPS too short for avcC header".into()));
    }

    let mut buf = BytesMut::new();
    buf.put_u8(1); // configurationVersion
    buf.put_u8(first[1]); // AVCProfileIndication
    buf.put_u8(first[2]); // profile_compatibility
    buf.put_u8(first[3]); // AVCLevelIndication
    buf.put_u8(0xFC | ((length_size as u8 - 1) & 0x03));

    buf.put_u8(0xE0 | (sps.len() as u8 & 0x1F));
    for set in sps {
        buf.put_u16(set.len() as u16);
        buf.put_slice(set);
    }
    buf.put_u8(pps.len() as u8);
    for set in pps {
        buf.put_u16(set.len() as u16);
        buf.put_slice(set);
    }

    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::BitWriter;

    // Main profile 77, level 31, 1920x1088 uncropped,
    // no cropping, no VUI.
    fn build_test_sps_rbsp() -> Vec<u8> {
        let mut w = BitWriter::new();
        w.write_bits(77, 8).unwrap(); // profile_idc
        w.write_bits(0, 8).unwrap(); // constraint flags
        w.write_bits(31, 8).unwrap(); // level_idc
        w.write_golomb(0).unwrap(); // sps id
        w.write_golomb(0).unwrap(); // log2_max_frame_num_minus4
        w.write_golomb(2).unwrap(); // pic_order_cnt_type = 2
        w.write_golomb(1).unwrap(); // max_num_ref_frames
        w.write_bit(false); // gaps_in_frame_num
        w.write_golomb(119).unwrap(); // pic_width_in_mbs_minus1 (120 MBs)
        w.write_golomb(67).unwrap(); // pic_height_in_map_units_minus1 (68)
        w.write_bit(true); // frame_mbs_only_flag
        w.write_bit(false); // direct_8x8_inference_flag
        w.write_bit(false); // frame_cropping_flag
        w.write_bit(false); // vui_parameters_present_flag
        w.finish()
    }

    #[test]
    fn test_parse_sps_dimensions() {
        let sps = parse_sps_rbsp(&build_test_sps_rbsp()).unwrap();
        assert_eq!(sps.profile_idc, 77);
        assert_eq!(sps.level_idc, 31);
        assert_eq!(sps.width, 1920);
        assert_eq!(sps.height, 1088);
        assert_eq!(sps.frame_rate, None);
        assert_eq!(sps.codec_string(), "avc1.4d001f");
    }

    #[test]
    fn test_parse_sps_with_cropping() {
        // 1920x1080: same mb grid, crop_bottom = 4 (4:2:0 crop unit 2)
        let mut w = BitWriter::new();
        w.write_bits(77, 8).unwrap();
        w.write_bits(0, 8).unwrap();
        w.write_bits(31, 8).unwrap();
        w.write_golomb(0).unwrap();
        w.write_golomb(0).unwrap();
        w.write_golomb(2).unwrap();
        w.write_golomb(1).unwrap();
        w.write_bit(false);
        w.write_golomb(119).unwrap();
        w.write_golomb(67).unwrap();
        w.write_bit(true);
        w.write_bit(false);
        w.write_bit(true); // frame_cropping_flag
        w.write_golomb(0).unwrap(); // left
        w.write_golomb(0).unwrap(); // right
        w.write_golomb(0).unwrap(); // top
        w.write_golomb(4).unwrap(); // bottom -> 8 rows
        w.write_bit(false); // no VUI
        let sps = parse_sps_rbsp(&w.finish()).unwrap();
        assert_eq!(sps.width, 1920);
        assert_eq!(sps.height, 1080);
    }

    #[test]
    fn test_parse_sps_with_vui_timing() {
        let mut w = BitWriter::new();
        w.write_bits(66, 8).unwrap(); // baseline
        w.write_bits(0xC0, 8).unwrap();
        w.write_bits(30, 8).unwrap();
        w.write_golomb(0).unwrap();
        w.write_golomb(0).unwrap();
        w.write_golomb(2).unwrap();
        w.write_golomb(1).unwrap();
        w.write_bit(false);
        w.write_golomb(39).unwrap(); // 40 MBs = 640
        w.write_golomb(29).unwrap(); // 30 map units = 480
        w.write_bit(true);
        w.write_bit(false);
        w.write_bit(false); // no cropping
        w.write_bit(true); // VUI present
        w.write_bit(false); // no aspect ratio
        w.write_bit(false); // no overscan
        w.write_bit(false); // no video signal type
        w.write_bit(false); // no chroma loc
        w.write_bit(true); // timing info
        w.write_bits(1, 32).unwrap(); // num_units_in_tick
        w.write_bits(60, 32).unwrap(); // time_scale
        let sps = parse_sps_rbsp(&w.finish()).unwrap();
        assert_eq!(sps.width, 640);
        assert_eq!(sps.height, 480);
        assert_eq!(sps.frame_rate, Some(30.0));
    }

    #[test]
    fn test_parser_accumulates_state() {
        let mut parser = H264Parser::new();
        let mut nal = vec![0x67]; // SPS header
        nal.extend_from_slice(&build_test_sps_rbsp());
        parser.parse_nalu(&nal).unwrap();
        assert_eq!(parser.dimensions(), Some((1920, 1088)));
        assert_eq!(parser.codec_string().as_deref(), Some("avc1.4d001f"));
    }

    #[test]
    fn test_avcc_round_trip() {
        let sps: &[u8] = &[0x67, 0x4D, 0x00, 0x1F, 0xAB];
        let pps: &[u8] = &[0x68, 0xEE, 0x3C];
        let record = build_avc_config(&[sps], &[pps], 4).unwrap();
        let parsed = parse_avc_config(&record).unwrap();
        assert_eq!(parsed.profile_idc, 0x4D);
        assert_eq!(parsed.level_idc, 0x1F);
        assert_eq!(parsed.length_size, 4);
        assert_eq!(parsed.sps[0].as_ref(), sps);
        assert_eq!(parsed.pps[0].as_ref(), pps);
    }

    #[test]
    fn test_keyframe_detection() {
        let mut parser = H264Parser::new();
        let idr = parser.parse_nalu(&[0x65, 0x88]).unwrap();
        assert!(parser.is_keyframe(&idr));
        let non_idr = parser.parse_nalu(&[0x41, 0x9A]).unwrap();
        assert!(!parser.is_keyframe(&non_idr));
    }
}
