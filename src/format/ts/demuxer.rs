use super::parser::{sniff_keyframe, TsPacketParser};
use super::pes::parse_pes;
use super::types::*;
use crate::av::{AudioParams, CodecId, Packet, Track, TrackKind, VideoParams};
use crate::format::Demuxer;
use crate::io::{Source, SourceExt};
use crate::{RemuxError, Result};
use bytes::Bytes;
use std::collections::HashMap;

/// Per-PID elementary stream state.
#[derive(Debug)]
struct EsStream {
    track_id: u32,
    codec: CodecId,
    /// PES bytes accumulated since the last payload_unit_start
    buffer: Vec<u8>,
}

/// MPEG Transport Stream demuxer.
///
/// Locates the PAT and the first program's PMT, then reassembles PES
/// packets per elementary PID. Timestamps come from the PES PTS/DTS
/// fields (90 kHz); keyframes are detected by start-code inspection of
/// the payload.
pub struct TsDemuxer {
    source: Box<dyn Source>,
    parser: TsPacketParser,
    tracks: Vec<Track>,
    streams: HashMap<u16, EsStream>,
    /// Packets a seek has positioned ahead of the stream cursor
    pending: std::collections::VecDeque<Packet>,
    done: bool,
}

impl TsDemuxer {
    /// Scans for PAT and PMT, then positions the stream for packet reads.
    pub async fn open(mut source: Box<dyn Source>) -> Result<Self> {
        source.set_position(0);
        let mut demuxer = Self {
            source,
            parser: TsPacketParser::new(),
            tracks: Vec::new(),
            streams: HashMap::new(),
            pending: std::collections::VecDeque::new(),
            done: false,
        };
        demuxer.read_program_tables().await?;
        demuxer.source.set_position(0);
        Ok(demuxer)
    }

    async fn read_program_tables(&mut self) -> Result<()> {
        let mut pmt_pid: Option<u16> = None;

        loop {
            let data = match self.next_ts_packet().await? {
                Some(p) => p,
                None => break,
            };
            let header = self.parser.parse_header(&data)?;
            if header.transport_error || !header.contains_payload {
                continue;
            }
            let payload_offset = self.payload_offset(&data, &header)?;

            if header.pid == PID_PAT && header.payload_unit_start {
                let table_offset = payload_offset + data[payload_offset] as usize + 1;
                let pat = self.parser.parse_pat(&data[table_offset..])?;
                // Program 0 is the network PID; the first real program wins
                pmt_pid = pat
                    .entries
                    .iter()
                    .find(|e| e.program_number != 0)
                    .map(|e| e.program_map_pid);
            } else if Some(header.pid) == pmt_pid && header.payload_unit_start {
                let table_offset = payload_offset + data[payload_offset] as usize + 1;
                let pmt = self.parser.parse_pmt(&data[table_offset..])?;
                self.build_tracks(&pmt);
                return Ok(());
            }
        }

        Err(RemuxError::Malformed(
            "stream ended before PAT/PMT were found".into(),
        ))
    }

    fn build_tracks(&mut self, pmt: &Pmt) {
        let mut saw_video = false;
        let mut saw_audio = false;

        for info in &pmt.elementary_stream_infos {
            let codec = match codec_from_stream_type(info.stream_type) {
                Some(c) => c,
                None => {
                    log::warn!(
                        "ignoring stream type 0x{:02x} on PID 0x{:x}",
                        info.stream_type,
                        info.elementary_pid
                    );
                    continue;
                }
            };
            let track_id = self.tracks.len() as u32 + 1;
            let mut track = match codec.kind() {
                TrackKind::Video => {
                    Track::video(track_id, self.tracks.len(), codec, VideoParams::default())
                }
                _ => Track::audio(track_id, self.tracks.len(), codec, AudioParams::default()),
            };
            // First track of each kind is the default
            let first_of_kind = match track.kind {
                TrackKind::Video => !std::mem::replace(&mut saw_video, true),
                _ => !std::mem::replace(&mut saw_audio, true),
            };
            track.is_default = first_of_kind;

            self.streams.insert(
                info.elementary_pid,
                EsStream {
                    track_id,
                    codec,
                    buffer: Vec::new(),
                },
            );
            self.tracks.push(track);
        }
    }

    /// Reads the next 188-byte packet, resynchronizing on 0x47.
    async fn next_ts_packet(&mut self) -> Result<Option<Bytes>> {
        loop {
            let first = match self.source.read_u8().await? {
                Some(b) => b,
                None => return Ok(None),
            };
            if first != 0x47 {
                continue;
            }
            let rest = self.source.read_exact(TS_PACKET_SIZE - 1).await?;
            return match rest {
                Some(rest) => {
                    let mut packet = Vec::with_capacity(TS_PACKET_SIZE);
                    packet.push(first);
                    packet.extend_from_slice(&rest);
                    Ok(Some(Bytes::from(packet)))
                }
                None => Ok(None),
            };
        }
    }

    fn payload_offset(&self, data: &[u8], header: &TsHeader) -> Result<usize> {
        let mut offset = TS_HEADER_SIZE;
        if header.adaptation_field_exists {
            if let Some(field) = self.parser.parse_adaptation_field(data, offset)? {
                offset += field.length + 1;
            }
        }
        if offset > data.len() {
            return Err(RemuxError::Malformed("adaptation field overruns packet".into()));
        }
        Ok(offset)
    }

    /// Turns a completed PES buffer into a Packet.
    fn make_packet(&self, track_id: u32, codec: CodecId, buffer: Vec<u8>) -> Result<Packet> {
        let pes = parse_pes(&buffer)?;
        let payload = Bytes::copy_from_slice(&buffer[pes.payload_start..]);

        let pts = pes.pts.map(pts_to_seconds);
        let dts = pes.dts.map(pts_to_seconds);
        let time = dts.or(pts).unwrap_or(0.0);
        let keyframe = sniff_keyframe(codec, &payload);

        let mut packet = Packet::new(payload)
            .with_track_id(track_id)
            .with_time(time)
            .with_key_flag(keyframe);
        if let (Some(pts), Some(dts)) = (pts, dts) {
            if pts != dts {
                packet = packet.with_composition_offset(pts - dts);
            }
        }
        Ok(packet)
    }
}

#[async_trait::async_trait]
impl Demuxer for TsDemuxer {
    async fn tracks(&mut self) -> Result<Vec<Track>> {
        Ok(self.tracks.clone())
    }

    async fn read_packet(&mut self) -> Result<Option<Packet>> {
        if let Some(packet) = self.pending.pop_front() {
            return Ok(Some(packet));
        }
        self.next_demuxed_packet().await
    }

    async fn seek(&mut self, time: f64) -> Result<()> {
        // A plain TS has no index; restart from the first sync byte and
        // reassemble forward, keeping everything from the last keyframe
        // with dts at or before the target
        self.source.set_position(0);
        self.done = false;
        self.pending.clear();
        for stream in self.streams.values_mut() {
            stream.buffer.clear();
        }

        let mut kept: std::collections::VecDeque<Packet> = std::collections::VecDeque::new();
        loop {
            let packet = match self.next_demuxed_packet().await? {
                Some(p) => p,
                None => break,
            };
            if packet.is_key && packet.time <= time {
                kept.clear();
                kept.push_back(packet);
            } else if packet.time > time {
                // Past the target: the remainder streams lazily
                kept.push_back(packet);
                break;
            } else if !kept.is_empty() {
                kept.push_back(packet);
            }
        }
        self.pending = kept;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.source.close().await
    }
}

impl TsDemuxer {
    /// Reassembles the next PES packet from the stream cursor.
    async fn next_demuxed_packet(&mut self) -> Result<Option<Packet>> {
        if self.done {
            return Ok(None);
        }
        loop {
            let data = match self.next_ts_packet().await? {
                Some(p) => p,
                None => {
                    // End of stream: flush PIDs that still hold an
                    // assembled PES, one per call
                    let pending = self
                        .streams
                        .values_mut()
                        .find(|s| !s.buffer.is_empty())
                        .map(|s| (s.track_id, s.codec, std::mem::take(&mut s.buffer)));
                    return match pending {
                        Some((track_id, codec, buffer)) => {
                            Ok(Some(self.make_packet(track_id, codec, buffer)?))
                        }
                        None => {
                            self.done = true;
                            Ok(None)
                        }
                    };
                }
            };
            let header = self.parser.parse_header(&data)?;
            if header.transport_error || !header.contains_payload {
                continue;
            }
            if !self.streams.contains_key(&header.pid) {
                continue;
            }
            let payload_offset = self.payload_offset(&data, &header)?;
            let payload = &data[payload_offset..];

            if header.payload_unit_start {
                // The previous PES on this PID is complete
                let stream = self.streams.get_mut(&header.pid).expect("stream exists");
                let completed = if stream.buffer.is_empty() {
                    None
                } else {
                    Some((
                        stream.track_id,
                        stream.codec,
                        std::mem::take(&mut stream.buffer),
                    ))
                };
                stream.buffer.extend_from_slice(payload);

                if let Some((track_id, codec, buffer)) = completed {
                    return Ok(Some(self.make_packet(track_id, codec, buffer)?));
                }
            } else {
                let stream = self.streams.get_mut(&header.pid).expect("stream exists");
                // A PES must begin with payload_unit_start; stray
                // continuation payloads are dropped
                if !stream.buffer.is_empty() {
                    stream.buffer.extend_from_slice(payload);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ts::muxer::TsMuxer;
    use crate::format::Muxer;
    use crate::io::{BufSource, BufTarget};

    async fn build_ts_with_two_streams() -> Bytes {
        let tracks = vec![
            Track::video(1, 0, CodecId::H264, VideoParams::default()),
            Track::audio(
                2,
                1,
                CodecId::Aac,
                AudioParams {
                    sample_rate: 48000,
                    channels: 2,
                    bits_per_sample: None,
                },
            ),
        ];
        let mut muxer = TsMuxer::new(BufTarget::new());
        muxer.write_header(&tracks).await.unwrap();

        // IDR access unit on video, plain frame on audio
        let video = Packet::new(vec![0x00, 0x00, 0x01, 0x65, 0x88, 0x80])
            .with_track_id(1)
            .with_time(0.0)
            .with_key_flag(true);
        let audio = Packet::new(vec![0xFFu8; 32])
            .with_track_id(2)
            .with_time(0.0)
            .with_key_flag(true);
        let video2 = Packet::new(vec![0x00, 0x00, 0x01, 0x41, 0x9A])
            .with_track_id(1)
            .with_time(1.0 / 30.0)
            .with_key_flag(false);
        muxer.write_packet(&video).await.unwrap();
        muxer.write_packet(&audio).await.unwrap();
        muxer.write_packet(&video2).await.unwrap();
        muxer.write_trailer().await.unwrap();
        muxer.into_target().finalize()
    }

    #[tokio::test]
    async fn test_program_discovery() {
        // Two tracks, h264 then aac, each default as first of kind
        let file = build_ts_with_two_streams().await;
        let mut demuxer = TsDemuxer::open(Box::new(BufSource::new(file))).await.unwrap();
        let tracks = demuxer.tracks().await.unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].id, 1);
        assert_eq!(tracks[0].codec, CodecId::H264);
        assert!(tracks[0].is_default);
        assert_eq!(tracks[1].id, 2);
        assert_eq!(tracks[1].codec, CodecId::Aac);
        assert!(tracks[1].is_default);
    }

    #[tokio::test]
    async fn test_pes_round_trip() {
        let file = build_ts_with_two_streams().await;
        let mut demuxer = TsDemuxer::open(Box::new(BufSource::new(file))).await.unwrap();
        demuxer.tracks().await.unwrap();

        let mut packets = Vec::new();
        while let Some(p) = demuxer.read_packet().await.unwrap() {
            packets.push(p);
        }
        assert_eq!(packets.len(), 3);

        let video: Vec<&Packet> = packets.iter().filter(|p| p.track_id == 1).collect();
        assert_eq!(video.len(), 2);
        assert!(video[0].is_key, "IDR payload must sniff as keyframe");
        assert!(!video[1].is_key);
        assert!((video[1].time - 1.0 / 30.0).abs() < 1e-3);

        let audio: Vec<&Packet> = packets.iter().filter(|p| p.track_id == 2).collect();
        assert_eq!(audio.len(), 1);
        assert_eq!(audio[0].data.len(), 32);
    }

    #[tokio::test]
    async fn test_seek_lands_on_keyframe() {
        // IDR at 0.0 and 1.0, non-IDR slices in between
        let track = Track::video(1, 0, CodecId::H264, VideoParams::default());
        let mut muxer = TsMuxer::new(BufTarget::new());
        muxer.write_header(&[track]).await.unwrap();
        for (i, time) in [0.0f64, 0.5, 1.0, 1.5].iter().enumerate() {
            let key = i % 2 == 0;
            let nal = if key { 0x65 } else { 0x41 };
            let packet = Packet::new(vec![0x00, 0x00, 0x01, nal, i as u8])
                .with_track_id(1)
                .with_time(*time)
                .with_key_flag(key);
            muxer.write_packet(&packet).await.unwrap();
        }
        muxer.write_trailer().await.unwrap();
        let file = muxer.into_target().finalize();

        let mut demuxer = TsDemuxer::open(Box::new(BufSource::new(file))).await.unwrap();
        // drain, then land between the keyframe at 1.0 and the slice at 1.5
        while demuxer.read_packet().await.unwrap().is_some() {}
        demuxer.seek(1.2).await.unwrap();

        let packet = demuxer.read_packet().await.unwrap().unwrap();
        assert!(packet.is_key);
        assert!((packet.time - 1.0).abs() < 1e-3);
        let packet = demuxer.read_packet().await.unwrap().unwrap();
        assert!(!packet.is_key);
        assert!((packet.time - 1.5).abs() < 1e-3);
        assert!(demuxer.read_packet().await.unwrap().is_none());
    }
}
