use super::types::*;
use crate::av::CodecId;
use crate::{RemuxError, Result};

/// Parser for the fixed TS packet layer: headers, adaptation fields and
/// the PAT/PMT program tables.
#[derive(Debug, Default)]
pub struct TsPacketParser {}

impl TsPacketParser {
    /// Creates a parser
    pub fn new() -> Self {
        Self {}
    }

    /// Parses the 4-byte TS packet header
    pub fn parse_header(&self, data: &[u8]) -> Result<TsHeader> {
        if data.len() < TS_HEADER_SIZE {
            return Err(RemuxError::Truncated("TS packet header".into()));
        }
        if data[0] != 0x47 {
            return Err(RemuxError::Malformed("missing TS sync byte".into()));
        }

        Ok(TsHeader {
            sync_byte: data[0],
            transport_error: (data[1] & 0x80) != 0,
            payload_unit_start: (data[1] & 0x40) != 0,
            transport_priority: (data[1] & 0x20) != 0,
            pid: (((data[1] & 0x1F) as u16) << 8) | data[2] as u16,
            scrambling_control: (data[3] >> 6) & 0x03,
            adaptation_field_exists: (data[3] & 0x20) != 0,
            contains_payload: (data[3] & 0x10) != 0,
            continuity_counter: data[3] & 0x0F,
        })
    }

    /// Parses the adaptation field at `offset`, when the header declares
    /// one. A zero-length field parses to `None`.
    pub fn parse_adaptation_field(
        &self,
        data: &[u8],
        offset: usize,
    ) -> Result<Option<AdaptationField>> {
        if (data[3] & 0x20) == 0 {
            return Ok(None);
        }

        let field_length = data[offset] as usize;
        if field_length == 0 {
            return Ok(Some(AdaptationField {
                length: 0,
                ..Default::default()
            }));
        }
        if data.len() < offset + field_length + 1 {
            return Err(RemuxError::Truncated("adaptation field".into()));
        }

        let flags = data[offset + 1];
        let mut field = AdaptationField {
            length: field_length,
            discontinuity: (flags & 0x80) != 0,
            random_access: (flags & 0x40) != 0,
            es_priority: (flags & 0x20) != 0,
            pcr_flag: (flags & 0x10) != 0,
            opcr_flag: (flags & 0x08) != 0,
            splicing_point_flag: (flags & 0x04) != 0,
            private_data_flag: (flags & 0x02) != 0,
            extension_flag: (flags & 0x01) != 0,
            ..Default::default()
        };

        let mut pos = offset + 2;
        if field.pcr_flag {
            if data.len() < pos + 6 {
                return Err(RemuxError::Truncated("PCR".into()));
            }
            field.pcr = Some(read_pcr(&data[pos..]));
            pos += 6;
        }
        if field.opcr_flag {
            if data.len() < pos + 6 {
                return Err(RemuxError::Truncated("OPCR".into()));
            }
            field.opcr = Some(read_pcr(&data[pos..]));
            pos += 6;
        }
        if field.splicing_point_flag {
            if data.len() < pos + 1 {
                return Err(RemuxError::Truncated("splice countdown".into()));
            }
            field.splice_countdown = Some(data[pos] as i8);
            pos += 1;
        }
        if field.private_data_flag {
            if pos >= offset + 1 + field_length {
                return Err(RemuxError::Truncated("private data length".into()));
            }
            let private_len = data[pos] as usize;
            pos += 1;
            let remaining = offset + 1 + field_length - pos;
            if private_len <= remaining {
                field.private_data = Some(data[pos..pos + private_len].to_vec());
            }
        }

        Ok(Some(field))
    }

    /// Parses a PAT section (starting at table_id)
    pub fn parse_pat(&self, data: &[u8]) -> Result<Pat> {
        if data.len() < 8 {
            return Err(RemuxError::Truncated("PAT section".into()));
        }
        if data[0] != TABLE_ID_PAT {
            return Err(RemuxError::Malformed(format!(
                "PAT table id 0x{:02x}",
                data[0]
            )));
        }

        let section_length = ((data[1] as usize & 0x0F) << 8) | data[2] as usize;
        let total_length = 3 + section_length;
        if data.len() < total_length {
            return Err(RemuxError::Truncated("PAT shorter than section_length".into()));
        }

        let mut pat = Pat::new();
        // Past transport_stream_id, version and section numbers
        let mut pos = 8;
        while pos + 4 <= total_length - 4 {
            let program_number = ((data[pos] as u16) << 8) | data[pos + 1] as u16;
            let pid = ((data[pos + 2] as u16 & 0x1F) << 8) | data[pos + 3] as u16;
            pat.entries.push(PatEntry {
                program_number,
                network_pid: if program_number == 0 { pid } else { 0 },
                program_map_pid: if program_number != 0 { pid } else { 0 },
            });
            pos += 4;
        }

        Ok(pat)
    }

    /// Parses a PMT section (starting at table_id)
    pub fn parse_pmt(&self, data: &[u8]) -> Result<Pmt> {
        if data.len() < 12 {
            return Err(RemuxError::Truncated("PMT section".into()));
        }
        if data[0] != TABLE_ID_PMT {
            return Err(RemuxError::Malformed(format!(
                "PMT table id 0x{:02x}",
                data[0]
            )));
        }

        let section_length = ((data[1] as usize & 0x0F) << 8) | data[2] as usize;
        let total_length = 3 + section_length;
        if data.len() < total_length {
            return Err(RemuxError::Truncated("PMT shorter than section_length".into()));
        }

        let mut pmt = Pmt::new();
        let mut pos = 8;
        pmt.pcr_pid = ((data[pos] as u16 & 0x1F) << 8) | data[pos + 1] as u16;
        pos += 2;

        let program_info_length = ((data[pos] as usize & 0x0F) << 8) | data[pos + 1] as usize;
        pos += 2;
        if program_info_length > 0 {
            if pos + program_info_length > total_length - 4 {
                return Err(RemuxError::Malformed(
                    "program descriptors extend beyond the section".into(),
                ));
            }
            pmt.program_descriptors = parse_descriptors(&data[pos..pos + program_info_length])?;
            pos += program_info_length;
        }

        while pos + 5 <= total_length - 4 {
            let stream_type = data[pos];
            let elementary_pid = ((data[pos + 1] as u16 & 0x1F) << 8) | data[pos + 2] as u16;
            let es_info_length = ((data[pos + 3] as usize & 0x0F) << 8) | data[pos + 4] as usize;
            pos += 5;
            if pos + es_info_length > total_length - 4 {
                return Err(RemuxError::Malformed(
                    "ES descriptors extend beyond the section".into(),
                ));
            }
            let descriptors = parse_descriptors(&data[pos..pos + es_info_length])?;
            pos += es_info_length;

            pmt.elementary_stream_infos.push(ElementaryStreamInfo {
                stream_type,
                elementary_pid,
                descriptors,
            });
        }

        Ok(pmt)
    }
}

fn read_pcr(data: &[u8]) -> u64 {
    let base = ((data[0] as u64) << 25)
        | ((data[1] as u64) << 17)
        | ((data[2] as u64) << 9)
        | ((data[3] as u64) << 1)
        | ((data[4] & 0x80) as u64 >> 7);
    let ext = (((data[4] & 0x01) as u64) << 8) | data[5] as u64;
    base * 300 + ext
}

fn parse_descriptors(data: &[u8]) -> Result<Vec<Descriptor>> {
    let mut descriptors = Vec::new();
    let mut pos = 0;

    while pos + 2 <= data.len() {
        let tag = data[pos];
        let length = data[pos + 1] as usize;
        pos += 2;
        if pos + length > data.len() {
            return Err(RemuxError::Truncated("descriptor body".into()));
        }
        descriptors.push(Descriptor {
            tag,
            data: data[pos..pos + length].to_vec(),
        });
        pos += length;
    }

    Ok(descriptors)
}

/// Inspects a PES payload's start codes for a random access point.
///
/// H.264 looks for an IDR NAL, H.265 for IDR/BLA/CRA, MPEG-1/2 for an
/// I-picture coding type. Codecs without start codes report `true` (every
/// audio frame is a sync point).
pub fn sniff_keyframe(codec: CodecId, payload: &[u8]) -> bool {
    match codec {
        CodecId::H264 => find_nal_types(payload).any(|t| t & 0x1F == 5),
        CodecId::H265 => find_nal_types(payload).any(|t| {
            let nal_type = (t >> 1) & 0x3F;
            (16..=21).contains(&nal_type)
        }),
        CodecId::Mpeg1 | CodecId::Mpeg2 => {
            // picture_start_code 00 00 01 00, picture_coding_type at
            // bits 3..5 of the second header byte
            let mut i = 0;
            while i + 5 < payload.len() {
                if payload[i] == 0x00
                    && payload[i + 1] == 0x00
                    && payload[i + 2] == 0x01
                    && payload[i + 3] == 0x00
                {
                    let coding_type = (payload[i + 5] >> 3) & 0x07;
                    return coding_type == 1;
                }
                i += 1;
            }
            false
        }
        _ => true,
    }
}

/// Yields the byte after each `00 00 01` start code
fn find_nal_types(payload: &[u8]) -> impl Iterator<Item = u8> + '_ {
    payload.windows(4).filter_map(|w| {
        if w[0] == 0x00 && w[1] == 0x00 && w[2] == 0x01 {
            Some(w[3])
        } else {
            None
        }
    })
}
