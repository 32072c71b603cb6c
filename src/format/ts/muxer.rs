use super::pes::PesPacket;
use super::types::*;
use crate::av::{Packet, Track, TrackKind};
use crate::format::Muxer;
use crate::io::Target;
use crate::utils::Crc32Mpeg2;
use crate::{RemuxError, Result};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

/// PCR repetition interval in seconds (~25 updates per second)
const PCR_INTERVAL: f64 = 0.040;

#[derive(Debug, Clone)]
struct TsStream {
    track_id: u32,
    pid: u16,
    stream_id: u8,
}

/// MPEG Transport Stream muxer.
///
/// Assigns elementary PIDs from 0x100 in track order (PMT at 0x1000),
/// emits the CRC'd PAT and PMT, then packetizes each media packet into a
/// PES fragmented across 188-byte TS packets with adaptation-field
/// stuffing on the short tail.
pub struct TsMuxer<T: Target> {
    target: T,
    streams: Vec<TsStream>,
    continuity: HashMap<u16, u8>,
    crc: Crc32Mpeg2,
    pcr_pid: u16,
    last_pcr: Option<f64>,
    header_written: bool,
}

impl<T: Target> TsMuxer<T> {
    /// Creates a muxer writing to `target`
    pub fn new(target: T) -> Self {
        Self {
            target,
            streams: Vec::new(),
            continuity: HashMap::new(),
            crc: Crc32Mpeg2::new(),
            pcr_pid: PID_ELEMENTARY_BASE,
            last_pcr: None,
            header_written: false,
        }
    }

    /// Consumes the muxer, returning its target
    pub fn into_target(self) -> T {
        self.target
    }

    fn next_continuity(&mut self, pid: u16) -> u8 {
        let counter = self.continuity.entry(pid).or_insert(0);
        let value = *counter;
        *counter = (*counter + 1) & 0x0F;
        value
    }

    /// Writes one PSI section as a single stuffed TS packet.
    async fn write_section(&mut self, pid: u16, table_id: u8, body: &[u8]) -> Result<()> {
        let mut buf = BytesMut::with_capacity(TS_PACKET_SIZE);
        let header = TsHeader {
            payload_unit_start: true,
            pid,
            continuity_counter: self.next_continuity(pid),
            ..Default::default()
        };
        header.write_to(&mut buf);
        buf.put_u8(0); // pointer field

        let section_start = buf.len();
        let section_length = body.len() + 5 + 4;
        buf.put_u8(table_id);
        buf.put_u8(0xB0 | ((section_length >> 8) & 0x0F) as u8);
        buf.put_u8(section_length as u8);
        buf.put_u16(1); // table id extension (transport stream / program)
        buf.put_u8(0xC1); // version 0, current
        buf.put_u8(0); // section number
        buf.put_u8(0); // last section number
        buf.put_slice(body);

        // CRC from table_id through the end of the body
        let crc = self.crc.calculate(&buf[section_start..]);
        buf.put_u32(crc);

        buf.resize(TS_PACKET_SIZE, 0xFF);
        self.target.write(&buf).await
    }

    /// Fragments one serialized PES into TS packets.
    async fn write_pes(
        &mut self,
        pid: u16,
        pes: &[u8],
        keyframe: bool,
        pcr: Option<u64>,
    ) -> Result<()> {
        let mut pos = 0usize;
        let mut first = true;

        while first || pos < pes.len() {
            // Adaptation field content (after the length byte)
            let mut af_body: Option<Vec<u8>> = None;
            if first {
                let mut flags = 0u8;
                let mut extra = Vec::new();
                if keyframe {
                    flags |= 0x40; // random access indicator
                }
                if let Some(pcr) = pcr {
                    flags |= 0x10;
                    extra.extend_from_slice(&encode_pcr(pcr));
                }
                if flags != 0 {
                    let mut body = vec![flags];
                    body.extend_from_slice(&extra);
                    af_body = Some(body);
                }
            }

            let af_overhead = af_body.as_ref().map(|b| 1 + b.len()).unwrap_or(0);
            let mut room = TS_PACKET_SIZE - TS_HEADER_SIZE - af_overhead;
            let remaining = pes.len() - pos;
            if remaining < room {
                // Stuff the deficit into the adaptation field
                let deficit = room - remaining;
                match &mut af_body {
                    Some(body) => body.extend(std::iter::repeat(0xFF).take(deficit)),
                    None => {
                        af_body = Some(if deficit == 1 {
                            Vec::new()
                        } else {
                            let mut body = vec![0u8];
                            body.extend(std::iter::repeat(0xFF).take(deficit - 2));
                            body
                        });
                    }
                }
                room = remaining;
            }

            let mut buf = BytesMut::with_capacity(TS_PACKET_SIZE);
            let header = TsHeader {
                payload_unit_start: first,
                pid,
                adaptation_field_exists: af_body.is_some(),
                continuity_counter: self.next_continuity(pid),
                ..Default::default()
            };
            header.write_to(&mut buf);
            if let Some(body) = &af_body {
                buf.put_u8(body.len() as u8);
                buf.put_slice(body);
            }
            buf.put_slice(&pes[pos..pos + room]);
            debug_assert_eq!(buf.len(), TS_PACKET_SIZE);

            self.target.write(&buf).await?;
            pos += room;
            first = false;
        }

        Ok(())
    }
}

fn encode_pcr(pcr: u64) -> [u8; 6] {
    let base = pcr / 300;
    let ext = pcr % 300;
    [
        (base >> 25) as u8,
        (base >> 17) as u8,
        (base >> 9) as u8,
        (base >> 1) as u8,
        (((base & 1) << 7) as u8) | 0x7E | ((ext >> 8) as u8),
        ext as u8,
    ]
}

#[async_trait::async_trait]
impl<T: Target> Muxer for TsMuxer<T> {
    async fn write_header(&mut self, tracks: &[Track]) -> Result<()> {
        if self.header_written {
            return Err(RemuxError::Config("header already written".into()));
        }

        let mut pmt = Pmt::new();
        for (i, track) in tracks.iter().enumerate() {
            let stream_type = stream_type_from_codec(track.codec).ok_or_else(|| {
                RemuxError::Config(format!(
                    "codec {:?} cannot be carried in a transport stream",
                    track.codec
                ))
            })?;
            let pid = PID_ELEMENTARY_BASE + i as u16;
            let stream_id = if track.kind == TrackKind::Video {
                STREAM_ID_VIDEO
            } else {
                STREAM_ID_AUDIO
            };
            self.streams.push(TsStream {
                track_id: track.id,
                pid,
                stream_id,
            });
            pmt.elementary_stream_infos.push(ElementaryStreamInfo {
                stream_type,
                elementary_pid: pid,
                descriptors: Vec::new(),
            });
        }
        if self.streams.is_empty() {
            return Err(RemuxError::Config("no tracks to mux".into()));
        }
        self.pcr_pid = self.streams[0].pid;
        pmt.pcr_pid = self.pcr_pid;

        let mut pat = Pat::new();
        pat.entries.push(PatEntry {
            program_number: 1,
            network_pid: 0,
            program_map_pid: PID_PMT,
        });

        let mut pat_body = BytesMut::new();
        pat.write_to(&mut pat_body);
        self.write_section(PID_PAT, TABLE_ID_PAT, &pat_body).await?;

        let mut pmt_body = BytesMut::new();
        pmt.write_to(&mut pmt_body);
        self.write_section(PID_PMT, TABLE_ID_PMT, &pmt_body).await?;

        self.header_written = true;
        Ok(())
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        if !self.header_written {
            return Err(RemuxError::Config("write_packet before header".into()));
        }
        let stream = self
            .streams
            .iter()
            .find(|s| s.track_id == packet.track_id)
            .cloned()
            .ok_or_else(|| {
                RemuxError::Config(format!("packet for undeclared track {}", packet.track_id))
            })?;

        let pts = packet.presentation_time();
        let dts = packet.time;
        let mut pes = PesPacket::new(stream.stream_id, packet.data.to_vec()).with_pts(pts);
        if (pts - dts).abs() > f64::EPSILON {
            pes = pes.with_dts(dts);
        }
        let mut pes_bytes = BytesMut::with_capacity(pes.len());
        pes.write_to(&mut pes_bytes);

        // PCR travels on the PCR PID, repeated at the configured interval
        let pcr = if stream.pid == self.pcr_pid
            && self
                .last_pcr
                .map(|last| dts - last >= PCR_INTERVAL)
                .unwrap_or(true)
        {
            self.last_pcr = Some(dts);
            Some(seconds_to_pcr(dts.max(0.0)))
        } else {
            None
        };

        self.write_pes(stream.pid, &pes_bytes, packet.is_key, pcr).await
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write_trailer(&mut self) -> Result<()> {
        self.target.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::av::{CodecId, VideoParams};
    use crate::io::BufTarget;
    use crate::utils::Crc32Mpeg2;

    fn video_track() -> Track {
        Track::video(1, 0, CodecId::H264, VideoParams::default())
    }

    async fn mux(packets: &[Packet]) -> bytes::Bytes {
        let mut muxer = TsMuxer::new(BufTarget::new());
        muxer.write_header(&[video_track()]).await.unwrap();
        for packet in packets {
            muxer.write_packet(packet).await.unwrap();
        }
        muxer.write_trailer().await.unwrap();
        muxer.into_target().finalize()
    }

    #[tokio::test]
    async fn test_packets_are_188_bytes() {
        let file = mux(&[Packet::new(vec![0x11u8; 400])
            .with_track_id(1)
            .with_time(0.0)
            .with_key_flag(true)])
        .await;
        assert_eq!(file.len() % TS_PACKET_SIZE, 0);
        for chunk in file.chunks(TS_PACKET_SIZE) {
            assert_eq!(chunk[0], 0x47);
        }
    }

    #[tokio::test]
    async fn test_psi_crc_matches_reference() {
        let file = mux(&[]).await;
        let crc = Crc32Mpeg2::new();

        // First packet is the PAT: pointer field at offset 4
        let pat = &file[..TS_PACKET_SIZE];
        let section_start = 5 + pat[4] as usize;
        let section_length = (((pat[section_start + 1] & 0x0F) as usize) << 8)
            | pat[section_start + 2] as usize;
        let crc_at = section_start + 3 + section_length - 4;
        let expected = u32::from_be_bytes([
            pat[crc_at],
            pat[crc_at + 1],
            pat[crc_at + 2],
            pat[crc_at + 3],
        ]);
        assert_eq!(crc.calculate(&pat[section_start..crc_at]), expected);

        // Second packet is the PMT
        let pmt = &file[TS_PACKET_SIZE..2 * TS_PACKET_SIZE];
        let section_start = 5 + pmt[4] as usize;
        let section_length = (((pmt[section_start + 1] & 0x0F) as usize) << 8)
            | pmt[section_start + 2] as usize;
        let crc_at = section_start + 3 + section_length - 4;
        let expected = u32::from_be_bytes([
            pmt[crc_at],
            pmt[crc_at + 1],
            pmt[crc_at + 2],
            pmt[crc_at + 3],
        ]);
        assert_eq!(crc.calculate(&pmt[section_start..crc_at]), expected);
    }

    #[tokio::test]
    async fn test_continuity_counters_increment() {
        // A payload large enough for several TS packets on one PID
        let file = mux(&[Packet::new(vec![0x22u8; 1000])
            .with_track_id(1)
            .with_time(0.0)
            .with_key_flag(true)])
        .await;

        let mut counters = Vec::new();
        for chunk in file.chunks(TS_PACKET_SIZE) {
            let pid = (((chunk[1] & 0x1F) as u16) << 8) | chunk[2] as u16;
            if pid == PID_ELEMENTARY_BASE {
                counters.push(chunk[3] & 0x0F);
            }
        }
        assert!(counters.len() > 1);
        for pair in counters.windows(2) {
            assert_eq!(pair[1], (pair[0] + 1) & 0x0F);
        }
    }

    #[tokio::test]
    async fn test_unsupported_codec_rejected() {
        let mut muxer = TsMuxer::new(BufTarget::new());
        let track = Track::video(1, 0, CodecId::Vp9, VideoParams::default());
        let err = muxer.write_header(&[track]).await.unwrap_err();
        assert!(matches!(err, RemuxError::Config(_)));
    }

    #[tokio::test]
    async fn test_first_media_packet_carries_pcr() {
        let file = mux(&[Packet::new(vec![0x33u8; 10])
            .with_track_id(1)
            .with_time(1.0)
            .with_key_flag(true)])
        .await;
        // Third packet (after PAT and PMT) starts the PES
        let media = &file[2 * TS_PACKET_SIZE..3 * TS_PACKET_SIZE];
        assert_eq!(media[1] & 0x40, 0x40, "payload_unit_start");
        assert_eq!(media[3] & 0x20, 0x20, "adaptation field present");
        let af_flags = media[5];
        assert_eq!(af_flags & 0x10, 0x10, "PCR flag");
        assert_eq!(af_flags & 0x40, 0x40, "random access indicator");
    }
}
