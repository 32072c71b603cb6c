use super::ebml::{
    child_elements, parse_float, parse_string, parse_uint, read_element_from, read_vlq, EbmlSize,
};
use crate::av::{AudioParams, CodecId, Packet, Track, TrackKind, VideoParams};
use crate::format::Demuxer;
use crate::io::{Source, SourceExt};
use crate::{RemuxError, Result};
use bytes::Bytes;

// Top-level and Segment-child element IDs
const ID_EBML: u32 = 0x1A45DFA3;
const ID_DOC_TYPE: u32 = 0x4282;
const ID_SEGMENT: u32 = 0x18538067;
const ID_INFO: u32 = 0x1549A966;
const ID_TIMESTAMP_SCALE: u32 = 0x2AD7B1;
const ID_DURATION: u32 = 0x4489;
const ID_TRACKS: u32 = 0x1654AE6B;
const ID_CLUSTER: u32 = 0x1F43B675;

// TrackEntry children
const ID_TRACK_ENTRY: u32 = 0xAE;
const ID_TRACK_NUMBER: u32 = 0xD7;
const ID_TRACK_TYPE: u32 = 0x83;
const ID_CODEC_ID: u32 = 0x86;
const ID_CODEC_PRIVATE: u32 = 0x63A2;
const ID_DEFAULT_DURATION: u32 = 0x23E383;
const ID_LANGUAGE: u32 = 0x22B59C;
const ID_FLAG_DEFAULT: u32 = 0x88;
const ID_FLAG_FORCED: u32 = 0x55AA;
const ID_VIDEO: u32 = 0xE0;
const ID_PIXEL_WIDTH: u32 = 0xB0;
const ID_PIXEL_HEIGHT: u32 = 0xBA;
const ID_AUDIO: u32 = 0xE1;
const ID_SAMPLING_FREQUENCY: u32 = 0xB5;
const ID_CHANNELS: u32 = 0x9F;
const ID_BIT_DEPTH: u32 = 0x6264;

// Cluster children
const ID_CLUSTER_TIMESTAMP: u32 = 0xE7;
const ID_SIMPLE_BLOCK: u32 = 0xA3;
const ID_BLOCK_GROUP: u32 = 0xA0;
const ID_BLOCK: u32 = 0xA1;
const ID_BLOCK_DURATION: u32 = 0x9B;
const ID_REFERENCE_BLOCK: u32 = 0xFB;

const TRACK_TYPE_VIDEO: u64 = 1;
const TRACK_TYPE_AUDIO: u64 = 2;
const TRACK_TYPE_SUBTITLE: u64 = 17;

/// Default TimestampScale: one millisecond in nanoseconds
const DEFAULT_TIMESTAMP_SCALE: u64 = 1_000_000;

/// One demuxed block, ready to become a packet.
#[derive(Debug, Clone)]
struct BlockItem {
    track_number: u64,
    time: f64,
    duration: Option<f64>,
    keyframe: bool,
    payload: Bytes,
}

/// A recorded Cluster position whose blocks are parsed on first touch.
#[derive(Debug)]
struct ClusterRef {
    offset: u64,
    size: u64,
    blocks: Option<Vec<BlockItem>>,
}

/// Matroska/WebM demuxer.
///
/// The Segment's Info and Tracks are read at open time; Cluster positions
/// are recorded but their blocks are parsed lazily, each cluster being
/// decoded and cached on first demand.
pub struct MkvDemuxer {
    source: Box<dyn Source>,
    doc_type: String,
    timestamp_scale: u64,
    tracks: Vec<Track>,
    clusters: Vec<ClusterRef>,
    cluster_index: usize,
    block_index: usize,
}

impl MkvDemuxer {
    /// Reads the EBML header and Segment structure.
    pub async fn open(mut source: Box<dyn Source>) -> Result<Self> {
        source.set_position(0);

        let (id, size) = read_element_from(source.as_mut())
            .await?
            .ok_or_else(|| RemuxError::Truncated("EBML header".into()))?;
        if id != ID_EBML {
            return Err(RemuxError::Malformed(format!(
                "first element 0x{:X} is not an EBML header",
                id
            )));
        }
        let header_size = size.require_known("EBML header")?;
        let header = source
            .read_exact(header_size as usize)
            .await?
            .ok_or_else(|| RemuxError::Truncated("EBML header body".into()))?;
        let doc_type = child_elements(&header)
            .find(|(id, _)| *id == ID_DOC_TYPE)
            .map(|(_, body)| parse_string(body))
            .unwrap_or_else(|| "matroska".to_string());

        let (id, segment_size) = read_element_from(source.as_mut())
            .await?
            .ok_or_else(|| RemuxError::Truncated("Segment".into()))?;
        if id != ID_SEGMENT {
            return Err(RemuxError::Malformed(format!(
                "expected Segment, found 0x{:X}",
                id
            )));
        }
        let segment_end = match segment_size {
            EbmlSize::Known(n) => Some(source.position() + n),
            EbmlSize::Unknown => None,
        };

        let mut timestamp_scale = DEFAULT_TIMESTAMP_SCALE;
        let mut duration_ticks: Option<f64> = None;
        let mut tracks = Vec::new();
        let mut clusters = Vec::new();

        loop {
            if let Some(end) = segment_end {
                if source.position() >= end {
                    break;
                }
            }
            let (id, size) = match read_element_from(source.as_mut()).await? {
                Some(e) => e,
                None => break,
            };
            match id {
                ID_INFO => {
                    let body_size = size.require_known("Info")?;
                    let body = source
                        .read_exact(body_size as usize)
                        .await?
                        .ok_or_else(|| RemuxError::Truncated("Info body".into()))?;
                    for (id, child) in child_elements(&body) {
                        match id {
                            ID_TIMESTAMP_SCALE => timestamp_scale = parse_uint(child).max(1),
                            ID_DURATION => duration_ticks = Some(parse_float(child)),
                            _ => {}
                        }
                    }
                }
                ID_TRACKS => {
                    let body_size = size.require_known("Tracks")?;
                    let body = source
                        .read_exact(body_size as usize)
                        .await?
                        .ok_or_else(|| RemuxError::Truncated("Tracks body".into()))?;
                    for (id, entry) in child_elements(&body) {
                        if id != ID_TRACK_ENTRY {
                            continue;
                        }
                        match parse_track_entry(entry, tracks.len()) {
                            Ok(track) => tracks.push(track),
                            Err(err) => log::warn!("skipping TrackEntry: {}", err),
                        }
                    }
                }
                ID_CLUSTER => {
                    // Blocks are not parsed until a read demands them
                    let body_size = size.require_known("Cluster")?;
                    clusters.push(ClusterRef {
                        offset: source.position(),
                        size: body_size,
                        blocks: None,
                    });
                    let pos = source.position();
                    source.set_position(pos + body_size);
                }
                _ => {
                    let body_size = size.require_known("Segment child")?;
                    let pos = source.position();
                    source.set_position(pos + body_size);
                }
            }
        }

        if tracks.is_empty() {
            return Err(RemuxError::Malformed("Segment declares no track".into()));
        }

        // Info duration applies to the whole Segment
        if let Some(ticks) = duration_ticks {
            let seconds = ticks * timestamp_scale as f64 / 1e9;
            for track in &mut tracks {
                track.duration = Some(seconds);
            }
        }

        Ok(Self {
            source,
            doc_type,
            timestamp_scale,
            tracks,
            clusters,
            cluster_index: 0,
            block_index: 0,
        })
    }

    /// The DocType from the EBML header (`matroska` or `webm`)
    pub fn doc_type(&self) -> &str {
        &self.doc_type
    }

    /// Nanoseconds per timestamp tick
    pub fn timestamp_scale(&self) -> u64 {
        self.timestamp_scale
    }

    async fn load_cluster(&mut self, index: usize) -> Result<()> {
        if self.clusters[index].blocks.is_some() {
            return Ok(());
        }
        let (offset, size) = (self.clusters[index].offset, self.clusters[index].size);
        self.source.set_position(offset);
        let body = self
            .source
            .read_exact(size as usize)
            .await?
            .ok_or_else(|| RemuxError::Truncated("Cluster body".into()))?;
        let blocks = parse_cluster(&body, self.timestamp_scale);
        self.clusters[index].blocks = Some(blocks);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Demuxer for MkvDemuxer {
    async fn tracks(&mut self) -> Result<Vec<Track>> {
        Ok(self.tracks.clone())
    }

    async fn read_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            if self.cluster_index >= self.clusters.len() {
                return Ok(None);
            }
            self.load_cluster(self.cluster_index).await?;
            let blocks = self.clusters[self.cluster_index]
                .blocks
                .as_ref()
                .expect("cluster loaded");
            if self.block_index >= blocks.len() {
                self.cluster_index += 1;
                self.block_index = 0;
                continue;
            }
            let block = blocks[self.block_index].clone();
            self.block_index += 1;

            let mut packet = Packet::new(block.payload)
                .with_track_id(block.track_number as u32)
                .with_time(block.time)
                .with_key_flag(block.keyframe);
            if let Some(duration) = block.duration {
                packet = packet.with_duration(duration);
            }
            return Ok(Some(packet));
        }
    }

    async fn seek(&mut self, time: f64) -> Result<()> {
        let mut target = (0usize, 0usize);
        'outer: for ci in 0..self.clusters.len() {
            self.load_cluster(ci).await?;
            let blocks = self.clusters[ci].blocks.as_ref().expect("cluster loaded");
            for (bi, block) in blocks.iter().enumerate() {
                if block.time > time {
                    break 'outer;
                }
                if block.keyframe {
                    target = (ci, bi);
                }
            }
        }
        self.cluster_index = target.0;
        self.block_index = target.1;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.source.close().await
    }
}

fn map_codec_id(codec_id: &str) -> Result<CodecId> {
    Ok(match codec_id {
        "V_MPEG4/ISO/AVC" => CodecId::H264,
        "V_MPEGH/ISO/HEVC" => CodecId::H265,
        "V_VP8" => CodecId::Vp8,
        "V_VP9" => CodecId::Vp9,
        "V_AV1" => CodecId::Av1,
        "A_OPUS" => CodecId::Opus,
        "A_VORBIS" => CodecId::Vorbis,
        "A_AAC" => CodecId::Aac,
        "A_MPEG/L3" => CodecId::Mp3,
        "A_FLAC" => CodecId::Flac,
        "A_AC3" => CodecId::Ac3,
        "A_PCM/INT/LIT" => CodecId::PcmS16Le,
        "A_PCM/INT/BIG" => CodecId::PcmS16Be,
        "S_TEXT/UTF8" => CodecId::Text,
        "S_TEXT/WEBVTT" => CodecId::WebVtt,
        other => {
            return Err(RemuxError::Unsupported(format!("Matroska codec {}", other)));
        }
    })
}

fn parse_track_entry(entry: &[u8], index: usize) -> Result<Track> {
    let mut track_number = 0u64;
    let mut track_type = 0u64;
    let mut codec_id = String::new();
    let mut codec_private: Option<Bytes> = None;
    let mut default_duration: Option<u64> = None;
    let mut language: Option<String> = None;
    let mut is_default = true;
    let mut is_forced = false;
    let mut video: Option<VideoParams> = None;
    let mut audio: Option<AudioParams> = None;

    for (id, body) in child_elements(entry) {
        match id {
            ID_TRACK_NUMBER => track_number = parse_uint(body),
            ID_TRACK_TYPE => track_type = parse_uint(body),
            ID_CODEC_ID => codec_id = parse_string(body),
            ID_CODEC_PRIVATE => codec_private = Some(Bytes::copy_from_slice(body)),
            ID_DEFAULT_DURATION => default_duration = Some(parse_uint(body)),
            ID_LANGUAGE => {
                let code = parse_string(body);
                if !code.is_empty() && code != "und" {
                    language = Some(code);
                }
            }
            ID_FLAG_DEFAULT => is_default = parse_uint(body) != 0,
            ID_FLAG_FORCED => is_forced = parse_uint(body) != 0,
            ID_VIDEO => {
                let mut params = VideoParams::default();
                for (id, child) in child_elements(body) {
                    match id {
                        ID_PIXEL_WIDTH => params.width = parse_uint(child) as u32,
                        ID_PIXEL_HEIGHT => params.height = parse_uint(child) as u32,
                        _ => {}
                    }
                }
                video = Some(params);
            }
            ID_AUDIO => {
                let mut params = AudioParams::default();
                for (id, child) in child_elements(body) {
                    match id {
                        ID_SAMPLING_FREQUENCY => {
                            params.sample_rate = parse_float(child).round() as u32
                        }
                        ID_CHANNELS => params.channels = parse_uint(child) as u32,
                        ID_BIT_DEPTH => params.bits_per_sample = Some(parse_uint(child) as u32),
                        _ => {}
                    }
                }
                audio = Some(params);
            }
            _ => {}
        }
    }

    if track_number == 0 {
        return Err(RemuxError::Malformed("TrackEntry without TrackNumber".into()));
    }

    let kind = match track_type {
        TRACK_TYPE_VIDEO => TrackKind::Video,
        TRACK_TYPE_AUDIO => TrackKind::Audio,
        TRACK_TYPE_SUBTITLE => TrackKind::Subtitle,
        other => {
            return Err(RemuxError::Unsupported(format!("track type {}", other)));
        }
    };
    let codec = map_codec_id(&codec_id)?;

    if kind == TrackKind::Video {
        let params = video.get_or_insert_with(VideoParams::default);
        // DefaultDuration is the frame interval in nanoseconds
        if let Some(nanos) = default_duration {
            if nanos > 0 {
                params.frame_rate = Some(1e9 / nanos as f64);
            }
        }
    }

    let mut track = Track {
        id: track_number as u32,
        index,
        kind,
        codec,
        codec_private,
        language,
        is_default,
        is_forced,
        duration: None,
        video,
        audio: None,
    };
    if kind == TrackKind::Audio {
        track.audio = audio.or_else(|| Some(AudioParams::default()));
        track.video = None;
    }
    Ok(track)
}

/// Parses all blocks in a cluster body, in order.
fn parse_cluster(body: &[u8], timestamp_scale: u64) -> Vec<BlockItem> {
    let mut cluster_base = 0u64;
    let mut blocks = Vec::new();

    for (id, child) in child_elements(body) {
        match id {
            ID_CLUSTER_TIMESTAMP => cluster_base = parse_uint(child),
            ID_SIMPLE_BLOCK => {
                match parse_block(child, cluster_base, timestamp_scale, None, None) {
                    Ok(block) => blocks.push(block),
                    Err(err) => log::warn!("skipping SimpleBlock: {}", err),
                }
            }
            ID_BLOCK_GROUP => {
                let mut block_body: Option<&[u8]> = None;
                let mut duration_ticks: Option<u64> = None;
                let mut has_reference = false;
                for (id, group_child) in child_elements(child) {
                    match id {
                        ID_BLOCK => block_body = Some(group_child),
                        ID_BLOCK_DURATION => duration_ticks = Some(parse_uint(group_child)),
                        ID_REFERENCE_BLOCK => has_reference = true,
                        _ => {}
                    }
                }
                if let Some(block_body) = block_body {
                    // A Block is not self-describing: keyframe unless a
                    // ReferenceBlock sibling marks it dependent
                    let keyframe = Some(!has_reference);
                    match parse_block(
                        block_body,
                        cluster_base,
                        timestamp_scale,
                        keyframe,
                        duration_ticks,
                    ) {
                        Ok(block) => blocks.push(block),
                        Err(err) => log::warn!("skipping Block: {}", err),
                    }
                }
            }
            _ => {}
        }
    }

    blocks
}

/// Parses SimpleBlock/Block framing:
/// `{vint trackNumber, i16 be timecode delta, u8 flags, payload}`.
fn parse_block(
    data: &[u8],
    cluster_base: u64,
    timestamp_scale: u64,
    keyframe_override: Option<bool>,
    duration_ticks: Option<u64>,
) -> Result<BlockItem> {
    let (track_number, vint_len) =
        read_vlq(data).ok_or_else(|| RemuxError::Malformed("block track number".into()))?;
    if data.len() < vint_len + 3 {
        return Err(RemuxError::Truncated("block header".into()));
    }
    let delta = i16::from_be_bytes([data[vint_len], data[vint_len + 1]]);
    let flags = data[vint_len + 2];

    let lacing = (flags >> 1) & 0x03;
    if lacing != 0 {
        return Err(RemuxError::Unsupported("laced block".into()));
    }

    let keyframe = keyframe_override.unwrap_or(flags & 0x80 != 0);
    let payload = Bytes::copy_from_slice(&data[vint_len + 3..]);

    let ticks = cluster_base as i64 + delta as i64;
    let scale = timestamp_scale as f64 / 1e9;
    Ok(BlockItem {
        track_number,
        time: ticks as f64 * scale,
        duration: duration_ticks.map(|d| d as f64 * scale),
        keyframe,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::mkv::ebml::write_vlq;
    use crate::io::BufSource;

    fn element(id: u32, body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let id_bytes = id.to_be_bytes();
        let skip = id_bytes.iter().take_while(|&&b| b == 0).count();
        out.extend_from_slice(&id_bytes[skip..]);
        out.extend_from_slice(&write_vlq(body.len() as u64).unwrap());
        out.extend_from_slice(body);
        out
    }

    fn uint_element(id: u32, value: u64) -> Vec<u8> {
        let bytes = value.to_be_bytes();
        let skip = bytes
            .iter()
            .take_while(|&&b| b == 0)
            .count()
            .min(bytes.len() - 1);
        element(id, &bytes[skip..])
    }

    /// A WebM with TimestampScale 1,000,000 and one cluster at Timestamp
    /// 500 holding a single keyframe SimpleBlock for track 1 at delta 10,
    /// payload "abc".
    fn build_test_webm() -> Vec<u8> {
        let mut ebml_body = Vec::new();
        ebml_body.extend_from_slice(&element(ID_DOC_TYPE, b"webm"));
        let ebml = element(ID_EBML, &ebml_body);

        let mut info_body = Vec::new();
        info_body.extend_from_slice(&uint_element(ID_TIMESTAMP_SCALE, 1_000_000));
        let info = element(ID_INFO, &info_body);

        let mut video_body = Vec::new();
        video_body.extend_from_slice(&uint_element(ID_PIXEL_WIDTH, 320));
        video_body.extend_from_slice(&uint_element(ID_PIXEL_HEIGHT, 240));
        let mut entry_body = Vec::new();
        entry_body.extend_from_slice(&uint_element(ID_TRACK_NUMBER, 1));
        entry_body.extend_from_slice(&uint_element(ID_TRACK_TYPE, TRACK_TYPE_VIDEO));
        entry_body.extend_from_slice(&element(ID_CODEC_ID, b"V_VP9"));
        entry_body.extend_from_slice(&element(ID_VIDEO, &video_body));
        let entry = element(ID_TRACK_ENTRY, &entry_body);
        let tracks = element(ID_TRACKS, &entry);

        // SimpleBlock: track 1, delta 10, flags 0x80, payload "abc"
        let mut sb = Vec::new();
        sb.extend_from_slice(&write_vlq(1).unwrap());
        sb.extend_from_slice(&10i16.to_be_bytes());
        sb.push(0x80);
        sb.extend_from_slice(b"abc");
        let mut cluster_body = Vec::new();
        cluster_body.extend_from_slice(&uint_element(ID_CLUSTER_TIMESTAMP, 500));
        cluster_body.extend_from_slice(&element(ID_SIMPLE_BLOCK, &sb));
        let cluster = element(ID_CLUSTER, &cluster_body);

        let mut segment_body = Vec::new();
        segment_body.extend_from_slice(&info);
        segment_body.extend_from_slice(&tracks);
        segment_body.extend_from_slice(&cluster);
        let segment = element(ID_SEGMENT, &segment_body);

        let mut file = ebml;
        file.extend_from_slice(&segment);
        file
    }

    #[tokio::test]
    async fn test_open_webm() {
        let file = build_test_webm();
        let mut demuxer = MkvDemuxer::open(Box::new(BufSource::new(file))).await.unwrap();
        assert_eq!(demuxer.doc_type(), "webm");
        assert_eq!(demuxer.timestamp_scale(), 1_000_000);

        let tracks = demuxer.tracks().await.unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id, 1);
        assert_eq!(tracks[0].codec, CodecId::Vp9);
        let video = tracks[0].video.as_ref().unwrap();
        assert_eq!((video.width, video.height), (320, 240));
    }

    #[tokio::test]
    async fn test_simple_block_timing() {
        // (500 + 10) ticks at 1 ms per tick: exactly one packet at 0.510 s
        let file = build_test_webm();
        let mut demuxer = MkvDemuxer::open(Box::new(BufSource::new(file))).await.unwrap();
        let packet = demuxer.read_packet().await.unwrap().unwrap();
        assert_eq!(packet.track_id, 1);
        assert!((packet.time - 0.510).abs() < 1e-9);
        assert!(packet.is_key);
        assert_eq!(packet.data.as_ref(), &[0x61, 0x62, 0x63]);
        assert!(demuxer.read_packet().await.unwrap().is_none());
    }

    #[test]
    fn test_block_group_reference_marks_dependent() {
        // BlockGroup with ReferenceBlock: not a keyframe
        let mut block = Vec::new();
        block.extend_from_slice(&write_vlq(2).unwrap());
        block.extend_from_slice(&0i16.to_be_bytes());
        block.push(0x00);
        block.extend_from_slice(b"xy");
        let mut group = Vec::new();
        group.extend_from_slice(&element(ID_BLOCK, &block));
        group.extend_from_slice(&uint_element(ID_BLOCK_DURATION, 40));
        group.extend_from_slice(&uint_element(ID_REFERENCE_BLOCK, 1));
        let mut cluster = Vec::new();
        cluster.extend_from_slice(&uint_element(ID_CLUSTER_TIMESTAMP, 0));
        cluster.extend_from_slice(&element(ID_BLOCK_GROUP, &group));

        let blocks = parse_cluster(&cluster, DEFAULT_TIMESTAMP_SCALE);
        assert_eq!(blocks.len(), 1);
        assert!(!blocks[0].keyframe);
        assert_eq!(blocks[0].duration, Some(0.040));

        // Without the reference the same group defaults to keyframe
        let mut group = Vec::new();
        group.extend_from_slice(&element(ID_BLOCK, &block));
        let mut cluster = Vec::new();
        cluster.extend_from_slice(&uint_element(ID_CLUSTER_TIMESTAMP, 0));
        cluster.extend_from_slice(&element(ID_BLOCK_GROUP, &group));
        let blocks = parse_cluster(&cluster, DEFAULT_TIMESTAMP_SCALE);
        assert!(blocks[0].keyframe);
    }

    #[test]
    fn test_codec_mapping() {
        assert_eq!(map_codec_id("V_MPEG4/ISO/AVC").unwrap(), CodecId::H264);
        assert_eq!(map_codec_id("A_OPUS").unwrap(), CodecId::Opus);
        assert_eq!(map_codec_id("A_PCM/INT/LIT").unwrap(), CodecId::PcmS16Le);
        assert!(map_codec_id("V_UNHEARD_OF").is_err());
    }

    #[tokio::test]
    async fn test_seek_to_keyframe() {
        let file = build_test_webm();
        let mut demuxer = MkvDemuxer::open(Box::new(BufSource::new(file))).await.unwrap();
        // drain, then seek back before the only block
        while demuxer.read_packet().await.unwrap().is_some() {}
        demuxer.seek(1.0).await.unwrap();
        let packet = demuxer.read_packet().await.unwrap().unwrap();
        assert!((packet.time - 0.510).abs() < 1e-9);
    }
}
