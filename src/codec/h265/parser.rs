use bytes::{BufMut, Bytes, BytesMut};

use super::types::{
    nal_type, HevcDecoderConfig, NalUnit, PpsInfo, ProfileTierLevel, SpsInfo, VpsInfo,
};
use crate::codec::nal::strip_emulation_prevention;
use crate::utils::BitReader;
use crate::{RemuxError, Result};

/// Incremental H.265 parameter-set parser.
///
/// Collects VPS/SPS/PPS as they are fed in; queries answer from the most
/// recently seen parameter sets.
#[derive(Debug, Default)]
pub struct H265Parser {
    vps: Option<VpsInfo>,
    sps: Option<SpsInfo>,
    pps: Option<PpsInfo>,
}

impl H265Parser {
    /// Creates a parser with no parameter sets seen yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses one NAL unit, updating parameter-set state when applicable
    pub fn parse_nalu(&mut self, data: &[u8]) -> Result<NalUnit> {
        if data.len() < 2 {
            return Err(RemuxError::Truncated("H.265 NAL header".into()));
        }
        let data = Bytes::from(strip_emulation_prevention(data));
        let nalu = NalUnit::new(data.clone());

        match nalu.nal_type {
            nal_type::VPS => {
                self.vps = Some(parse_vps_rbsp(&data[2..])?);
            }
            nal_type::SPS => {
                let sps = parse_sps_rbsp(&data[2..])?;
                log::debug!(
                    "h265 sps: profile={} level={} {}x{}",
                    sps.profile_tier_level.profile_idc,
                    sps.profile_tier_level.level_idc,
                    sps.width,
                    sps.height
                );
                self.sps = Some(sps);
            }
            nal_type::PPS => {
                self.pps = Some(parse_pps_rbsp(&data[2..])?);
            }
            _ => {}
        }

        Ok(nalu)
    }

    /// Cropped dimensions from the most recent SPS
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.sps.as_ref().map(|sps| (sps.width, sps.height))
    }

    /// Frame rate from the most recent SPS VUI timing, when present
    pub fn frame_rate(&self) -> Option<f64> {
        self.sps.as_ref().and_then(|sps| sps.frame_rate)
    }

    /// Codec string (`hvc1.*`) from the most recent SPS
    pub fn codec_string(&self) -> Option<String> {
        self.sps.as_ref().map(|sps| sps.codec_string())
    }

    /// Whether the unit is an IRAP sync point
    pub fn is_keyframe(&self, nalu: &NalUnit) -> bool {
        nalu.is_keyframe()
    }
}

fn parse_profile_tier_level(
    reader: &mut BitReader,
    max_sub_layers_minus1: u8,
) -> Result<ProfileTierLevel> {
    let profile_space = reader.read_bits(2)? as u8;
    let tier_flag = reader.read_bit()?;
    let profile_idc = reader.read_bits(5)? as u8;
    let compatibility_flags = reader.read_bits(32)?;
    let constraint_flags = reader.read_bits64(48)?;
    let level_idc = reader.read_bits(8)? as u8;

    let mut profile_present = [false; 8];
    let mut level_present = [false; 8];
    for i in 0..max_sub_layers_minus1 as usize {
        profile_present[i] = reader.read_bit()?;
        level_present[i] = reader.read_bit()?;
    }
    if max_sub_layers_minus1 > 0 {
        for _ in max_sub_layers_minus1..8 {
            reader.read_bits(2)?; // reserved_zero_2bits
        }
    }
    for i in 0..max_sub_layers_minus1 as usize {
        if profile_present[i] {
            // sub-layer profile block mirrors the general one
            reader.read_bits(8)?;
            reader.read_bits(32)?;
            reader.read_bits64(48)?;
        }
        if level_present[i] {
            reader.read_bits(8)?;
        }
    }

    Ok(ProfileTierLevel {
        profile_space,
        tier_flag,
        profile_idc,
        compatibility_flags,
        constraint_flags,
        level_idc,
    })
}

/// Parses a VPS RBSP (two-byte NAL header removed, emulation stripped).
pub fn parse_vps_rbsp(data: &[u8]) -> Result<VpsInfo> {
    let mut reader = BitReader::new(data);

    reader.read_bits(4)?; // vps_video_parameter_set_id
    reader.read_bits(2)?; // base_layer_internal / base_layer_available
    reader.read_bits(6)?; // vps_max_layers_minus1
    let max_sub_layers_minus1 = reader.read_bits(3)? as u8;
    reader.read_bit()?; // vps_temporal_id_nesting_flag
    reader.read_bits(16)?; // vps_reserved_0xffff_16bits

    let profile_tier_level = parse_profile_tier_level(&mut reader, max_sub_layers_minus1)?;

    Ok(VpsInfo {
        max_sub_layers: max_sub_layers_minus1 + 1,
        profile_tier_level,
    })
}

/// Parses an SPS RBSP (two-byte NAL header removed, emulation stripped).
pub fn parse_sps_rbsp(data: &[u8]) -> Result<SpsInfo> {
    let mut reader = BitReader::new(data);

    reader.read_bits(4)?; // sps_video_parameter_set_id
    let max_sub_layers_minus1 = reader.read_bits(3)? as u8;
    reader.read_bit()?; // sps_temporal_id_nesting_flag

    let profile_tier_level = parse_profile_tier_level(&mut reader, max_sub_layers_minus1)?;

    reader.read_golomb()?; // sps_seq_parameter_set_id
    let chroma_format_idc = reader.read_golomb()?;
    if chroma_format_idc == 3 {
        reader.read_bit()?; // separate_colour_plane_flag
    }

    let pic_width = reader.read_golomb()?;
    let pic_height = reader.read_golomb()?;

    let mut width = pic_width;
    let mut height = pic_height;
    if reader.read_bit()? {
        // conformance_window_flag
        let left = reader.read_golomb()?;
        let right = reader.read_golomb()?;
        let top = reader.read_golomb()?;
        let bottom = reader.read_golomb()?;
        let (sub_width_c, sub_height_c) = match chroma_format_idc {
            1 => (2, 2),
            2 => (2, 1),
            _ => (1, 1),
        };
        width = width.saturating_sub(sub_width_c * (left + right));
        height = height.saturating_sub(sub_height_c * (top + bottom));
    }

    let bit_depth_luma = reader.read_golomb()? + 8;
    let bit_depth_chroma = reader.read_golomb()? + 8;
    let log2_max_pic_order_cnt_lsb = reader.read_golomb()? + 4;

    let ordering_info_present = reader.read_bit()?;
    let first_layer = if ordering_info_present {
        0
    } else {
        max_sub_layers_minus1
    };
    for _ in first_layer..=max_sub_layers_minus1 {
        reader.read_golomb()?; // sps_max_dec_pic_buffering_minus1
        reader.read_golomb()?; // sps_max_num_reorder_pics
        reader.read_golomb()?; // sps_max_latency_increase_plus1
    }

    reader.read_golomb()?; // log2_min_luma_coding_block_size_minus3
    reader.read_golomb()?; // log2_diff_max_min_luma_coding_block_size
    reader.read_golomb()?; // log2_min_luma_transform_block_size_minus2
    reader.read_golomb()?; // log2_diff_max_min_luma_transform_block_size
    reader.read_golomb()?; // max_transform_hierarchy_depth_inter
    reader.read_golomb()?; // max_transform_hierarchy_depth_intra

    if reader.read_bit()? {
        // scaling_list_enabled_flag
        if reader.read_bit()? {
            skip_scaling_list_data(&mut reader)?;
        }
    }

    reader.read_bit()?; // amp_enabled_flag
    reader.read_bit()?; // sample_adaptive_offset_enabled_flag

    if reader.read_bit()? {
        // pcm_enabled_flag
        reader.read_bits(4)?; // pcm_sample_bit_depth_luma_minus1
        reader.read_bits(4)?; // pcm_sample_bit_depth_chroma_minus1
        reader.read_golomb()?; // log2_min_pcm_luma_coding_block_size_minus3
        reader.read_golomb()?; // log2_diff_max_min_pcm_luma_coding_block_size
        reader.read_bit()?; // pcm_loop_filter_disabled_flag
    }

    let num_short_term_rps = reader.read_golomb()?;
    if num_short_term_rps > 64 {
        return Err(RemuxError::Malformed(
            "num_short_term_ref_pic_sets exceeds 64".into(),
        ));
    }
    let mut num_delta_pocs = vec![0u32; num_short_term_rps as usize];
    for idx in 0..num_short_term_rps as usize {
        skip_short_term_ref_pic_set(&mut reader, idx, &mut num_delta_pocs)?;
    }

    if reader.read_bit()? {
        // long_term_ref_pics_present_flag
        let count = reader.read_golomb()?;
        for _ in 0..count {
            reader.read_bits(log2_max_pic_order_cnt_lsb.min(32) as u8)?; // lt_ref_pic_poc_lsb_sps
            reader.read_bit()?; // used_by_curr_pic_lt_sps_flag
        }
    }

    reader.read_bit()?; // sps_temporal_mvp_enabled_flag
    reader.read_bit()?; // strong_intra_smoothing_enabled_flag

    let mut sps = SpsInfo {
        profile_tier_level,
        chroma_format_idc,
        width,
        height,
        bit_depth_luma,
        bit_depth_chroma,
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
        if idc == crate::codec::h264::types::SAR_EXTENDED {
            let w = reader.read_bits(16)?;
            let h = reader.read_bits(16)?;
            sps.sample_aspect_ratio = Some((w, h));
        } else if (idc as usize) < crate::codec::h264::types::SAR_TABLE.len() && idc > 0 {
            sps.sample_aspect_ratio = Some(crate::codec::h264::types::SAR_TABLE[idc as usize]);
        }
    }

    if reader.read_bit()? {
        // overscan_info_present_flag
        reader.read_bit()?;
    }

    if reader.read_bit()? {
        // video_signal_type_present_flag
        reader.read_bits(3)?;
        reader.read_bit()?;
        if reader.read_bit()? {
            reader.read_bits(24)?;
        }
    }

    if reader.read_bit()? {
        // chroma_loc_info_present_flag
        reader.read_golomb()?;
        reader.read_golomb()?;
    }

    reader.read_bit()?; // neutral_chroma_indication_flag
    reader.read_bit()?; // field_seq_flag
    reader.read_bit()?; // frame_field_info_present_flag

    if reader.read_bit()? {
        // default_display_window_flag
        reader.read_golomb()?;
        reader.read_golomb()?;
        reader.read_golomb()?;
        reader.read_golomb()?;
    }

    if reader.read_bit()? {
        // vui_timing_info_present_flag
        let num_units_in_tick = reader.read_bits(32)?;
        let time_scale = reader.read_bits(32)?;
        if num_units_in_tick > 0 {
            // HEVC timing is frame-based: one tick per picture
            sps.frame_rate = Some(time_scale as f64 / num_units_in_tick as f64);
        }
    }

    Ok(())
}

fn skip_scaling_list_data(reader: &mut BitReader) -> Result<()> {
    for size_id in 0..4u32 {
        let step = if size_id == 3 { 3 } else { 1 };
        let mut matrix_id = 0;
        while matrix_id < 6 {
            if !reader.read_bit()? {
                // scaling_list_pred_mode_flag == 0
                reader.read_golomb()?; // scaling_list_pred_matrix_id_delta
            } else {
                let coef_num = 64u32.min(1 << (4 + (size_id << 1)));
                if size_id > 1 {
                    reader.read_signed_golomb()?; // scaling_list_dc_coef_minus8
                }
                for _ in 0..coef_num {
                    reader.read_signed_golomb()?; // scaling_list_delta_coef
                }
            }
            matrix_id += step;
        }
    }
    Ok(())
}

fn skip_short_term_ref_pic_set(
    reader: &mut BitReader,
    idx: usize,
    num_delta_pocs: &mut [u32],
) -> Result<()> {
    let inter_prediction = if idx != 0 { reader.read_bit()? } else { false };

    if inter_prediction {
        let ref_idx = idx - 1;
        reader.read_bit()?; // delta_rps_sign
        reader.read_golomb()?; // abs_delta_rps_minus1
        let mut kept = 0u32;
        for _ in 0..=num_delta_pocs[ref_idx] {
            let used = reader.read_bit()?;
            let use_delta = if !used { reader.read_bit()? } else { true };
            if used || use_delta {
                kept += 1;
            }
        }
        num_delta_pocs[idx] = kept;
    } else {
        let num_negative = reader.read_golomb()?;
        let num_positive = reader.read_golomb()?;
        if num_negative.saturating_add(num_positive) > 64 {
            return Err(RemuxError::Malformed("oversized short-term RPS".into()));
        }
        for _ in 0..num_negative + num_positive {
            reader.read_golomb()?; // delta_poc_minus1
            reader.read_bit()?; // used_by_curr_pic_flag
        }
        num_delta_pocs[idx] = num_negative + num_positive;
    }

    Ok(())
}

/// Parses a PPS RBSP (two-byte NAL header removed, emulation stripped).
pub fn parse_pps_rbsp(data: &[u8]) -> Result<PpsInfo> {
    let mut reader = BitReader::new(data);

    let pic_parameter_set_id = reader.read_golomb()?;
    let seq_parameter_set_id = reader.read_golomb()?;
    let dependent_slice_segments_enabled = reader.read_bit()?;
    reader.read_bit()?; // output_flag_present_flag
    reader.read_bits(3)?; // num_extra_slice_header_bits
    reader.read_bit()?; // sign_data_hiding_enabled_flag
    let cabac_init_present = reader.read_bit()?;

    Ok(PpsInfo {
        pic_parameter_set_id,
        seq_parameter_set_id,
        dependent_slice_segments_enabled,
        cabac_init_present,
    })
}

/// Parses an `hvcC` HEVCDecoderConfigurationRecord body.
pub fn parse_hevc_config(data: &[u8]) -> Result<HevcDecoderConfig> {
    if data.len() < 23 {
        return Err(RemuxError::Truncated("hvcC record".into()));
    }
    if data[0] != 1 {
        return Err(RemuxError::Malformed(format!(
            "hvcC configurationVersion {}",
            data[0]
        )));
    }

    let profile_tier_level = ProfileTierLevel {
        profile_space: (data[1] >> 6) & 0x03,
        tier_flag: (data[1] & 0x20) != 0,
        profile_idc: data[1] & 0x1F,
        compatibility_flags: u32::from_be_bytes([data[2], data[3], data[4], data[5]]),
        constraint_flags: ((data[6] as u64) << 40)
            | ((data[7] as u64) << 32)
            | ((data[8] as u64) << 24)
            | ((data[9] as u64) << 16)
            | ((data[10] as u64) << 8)
            | data[11] as u64,
        level_idc: data[12],
    };

    let chroma_format_idc = data[16] & 0x03;
    let bit_depth_luma_minus8 = data[17] & 0x07;
    let bit_depth_chroma_minus8 = data[18] & 0x07;
    let length_size = (data[21] & 0x03) as usize + 1;

    let mut config = HevcDecoderConfig {
        profile_tier_level,
        chroma_format_idc,
        bit_depth_luma_minus8,
        bit_depth_chroma_minus8,
        length_size,
        vps: Vec::new(),
        sps: Vec::new(),
        pps: Vec::new(),
    };

    let num_arrays = data[22] as usize;
    let mut pos = 23;
    for _ in 0..num_arrays {
        if pos + 3 > data.len() {
            return Err(RemuxError::Truncated("hvcC array header".into()));
        }
        let unit_type = data[pos] & 0x3F;
        let num_nalus = ((data[pos + 1] as usize) << 8) | data[pos + 2] as usize;
        pos += 3;
        for _ in 0..num_nalus {
            if pos + 2 > data.len() {
                return Err(RemuxError::Truncated("hvcC NAL length".into()));
            }
            let len = ((data[pos] as usize) << 8) | data[pos + 1] as usize;
            pos += 2;
            if pos + len > data.len() {
                return Err(RemuxError::Truncated("hvcC NAL body".into()));
            }
            let unit = Bytes::copy_from_slice(&data[pos..pos + len]);
            pos += len;
            match unit_type {
                nal_type::VPS => config.vps.push(unit),
                nal_type::SPS => config.sps.push(unit),
                nal_type::PPS => config.pps.push(unit),
                _ => {}
            }
        }
    }

    Ok(config)
}

/// Builds an `hvcC` record from parameter-set NAL units (with headers).
pub fn build_hevc_config(config: &HevcDecoderConfig) -> Result<Bytes> {
    if config.sps.is_empty() {
        return Err(RemuxError::Config("hvcC requires at least one SPS".into()));
    }

    let ptl = &config.profile_tier_level;
    let mut buf = BytesMut::new();
    buf.put_u8(1); // configurationVersion
    buf.put_u8((ptl.profile_space << 6) | ((ptl.tier_flag as u8) << 5) | (ptl.profile_idc & 0x1F));
    buf.put_u32(ptl.compatibility_flags);
    buf.put_slice(&[
        (ptl.constraint_flags >> 40) as u8,
        (ptl.constraint_flags >> 32) as u8,
        (ptl.constraint_flags >> 24) as u8,
        (ptl.constraint_flags >> 16) as u8,
        (ptl.constraint_flags >> 8) as u8,
        ptl.constraint_flags as u8,
    ]);
    buf.put_u8(ptl.level_idc);
    buf.put_u16(0xF000); // reserved + min_spatial_segmentation_idc
    buf.put_u8(0xFC); // reserved + parallelismType
    buf.put_u8(0xFC | (config.chroma_format_idc & 0x03));
    buf.put_u8(0xF8 | (config.bit_depth_luma_minus8 & 0x07));
    buf.put_u8(0xF8 | (config.bit_depth_chroma_minus8 & 0x07));
    buf.put_u16(0); // avgFrameRate
    // constantFrameRate=0, numTemporalLayers=1, temporalIdNested=0
    buf.put_u8((1 << 3) | ((config.length_size as u8 - 1) & 0x03));

    let arrays: [(u8, &Vec<Bytes>); 3] = [
        (nal_type::VPS, &config.vps),
        (nal_type::SPS, &config.sps),
        (nal_type::PPS, &config.pps),
    ];
    let non_empty = arrays.iter().filter(|(_, units)| !units.is_empty()).count();
    buf.put_u8(non_empty as u8);
    for (unit_type, units) in arrays {
        if units.is_empty() {
            continue;
        }
        buf.put_u8(0x80 | unit_type); // array_completeness set
        buf.put_u16(units.len() as u16);
        for unit in units {
            buf.put_u16(unit.len() as u16);
            buf.put_slice(unit);
        }
    }

    Ok(buf.freeze())
}
