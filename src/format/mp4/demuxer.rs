use super::boxes::{
    self, children, find_child, find_path, from_fixed_16_16, read_box_header, unpack_language,
};
use crate::av::{
    AudioParams, CodecId, CoverArtFormat, Metadata, Packet, Rotation, Track, TrackKind,
    VideoParams,
};
use crate::codec::aac;
use crate::format::Demuxer;
use crate::io::{Source, SourceExt};
use crate::{RemuxError, Result};
use bytes::Bytes;

/// One expanded sample-table record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleEntry {
    /// Absolute file offset of the sample's first byte
    pub offset: u64,
    /// Sample size in bytes
    pub size: u32,
    /// Decode timestamp in seconds
    pub dts: f64,
    /// Duration in seconds
    pub duration: f64,
    /// Whether the sample is a sync sample
    pub keyframe: bool,
    /// Composition offset (CTS − DTS) in seconds
    pub cts_offset: f64,
}

/// Per-track iteration state: `seek` returns an exhausted cursor to ready.
#[derive(Debug)]
struct TrackCursor {
    samples: Vec<SampleEntry>,
    next: usize,
}

impl TrackCursor {
    fn peek(&self) -> Option<&SampleEntry> {
        self.samples.get(self.next)
    }
}

// trex defaults declared by a fragmented file's mvex
#[derive(Debug, Clone, Copy, Default)]
struct TrexDefaults {
    track_id: u32,
    duration: u32,
    size: u32,
    flags: u32,
}

/// ISO Base Media demuxer.
///
/// Opens progressive and fragmented files: the whole sample index is built
/// once at open time (stbl expansion, plus moof traversal for fragmented
/// input), after which packets are produced on demand, interleaved on
/// smallest DTS with ties broken by track id.
pub struct Mp4Demuxer {
    source: Box<dyn Source>,
    tracks: Vec<Track>,
    cursors: Vec<TrackCursor>,
    metadata: Metadata,
    major_brand: [u8; 4],
    fragmented: bool,
}

impl Mp4Demuxer {
    /// Reads the box tree and builds the sample index.
    pub async fn open(mut source: Box<dyn Source>) -> Result<Self> {
        let mut major_brand = *b"isom";
        let mut moov: Option<Bytes> = None;
        let mut moofs: Vec<(u64, Bytes)> = Vec::new();

        source.set_position(0);
        loop {
            let header = match read_box_header(source.as_mut()).await? {
                Some(h) => h,
                None => break,
            };
            match &header.box_type {
                b"ftyp" => {
                    let body = source
                        .read_exact(header.body_size() as usize)
                        .await?
                        .ok_or_else(|| RemuxError::Truncated("ftyp body".into()))?;
                    if body.len() >= 4 {
                        major_brand = [body[0], body[1], body[2], body[3]];
                    }
                }
                b"moov" => {
                    let body = source
                        .read_exact(header.body_size() as usize)
                        .await?
                        .ok_or_else(|| RemuxError::Truncated("moov body".into()))?;
                    moov = Some(body);
                }
                b"moof" => {
                    let body = source
                        .read_exact(header.body_size() as usize)
                        .await?
                        .ok_or_else(|| RemuxError::Truncated("moof body".into()))?;
                    moofs.push((header.start, body));
                }
                _ => {
                    source.set_position(header.end());
                }
            }
        }

        let moov = moov.ok_or_else(|| RemuxError::Malformed("file has no moov box".into()))?;
        let fragmented = !moofs.is_empty();

        let mut tracks = Vec::new();
        let mut cursors = Vec::new();
        let mut timescales = Vec::new();
        for (box_type, body) in children(&moov) {
            if &box_type != b"trak" {
                continue;
            }
            let index = tracks.len();
            match parse_trak(body, index) {
                Ok((track, timescale, samples)) => {
                    timescales.push(timescale);
                    tracks.push(track);
                    cursors.push(TrackCursor { samples, next: 0 });
                }
                Err(err) => {
                    log::warn!("skipping unreadable trak: {}", err);
                }
            }
        }
        if tracks.is_empty() {
            return Err(RemuxError::Malformed("moov declares no readable track".into()));
        }

        let trex = find_child(&moov, b"mvex")
            .map(parse_mvex)
            .unwrap_or_default();
        for (moof_start, moof) in &moofs {
            expand_moof(*moof_start, moof, &trex, &tracks, &timescales, &mut cursors)?;
        }

        // Fragmented durations live in the fragments, not mdhd
        if fragmented {
            for (track, cursor) in tracks.iter_mut().zip(&cursors) {
                if let Some(last) = cursor.samples.last() {
                    track.duration = Some(last.dts + last.duration);
                }
            }
        }

        let metadata = find_path(&moov, &[b"udta", b"meta", b"ilst"])
            .map(parse_ilst)
            .unwrap_or_default();

        Ok(Self {
            source,
            tracks,
            cursors,
            metadata,
            major_brand,
            fragmented,
        })
    }

    /// The file's major brand from `ftyp`
    pub fn major_brand(&self) -> [u8; 4] {
        self.major_brand
    }

    /// Whether the file carries `moof` fragments
    pub fn is_fragmented(&self) -> bool {
        self.fragmented
    }

    /// The expanded sample table of one track, by track index
    pub fn sample_table(&self, index: usize) -> Option<&[SampleEntry]> {
        self.cursors.get(index).map(|c| c.samples.as_slice())
    }
}

#[async_trait::async_trait]
impl Demuxer for Mp4Demuxer {
    async fn tracks(&mut self) -> Result<Vec<Track>> {
        Ok(self.tracks.clone())
    }

    async fn read_packet(&mut self) -> Result<Option<Packet>> {
        // Smallest next DTS wins; ties go to the lower track id
        let mut best: Option<(usize, f64, u32)> = None;
        for (i, cursor) in self.cursors.iter().enumerate() {
            if let Some(sample) = cursor.peek() {
                let id = self.tracks[i].id;
                let better = match best {
                    None => true,
                    Some((_, dts, best_id)) => {
                        sample.dts < dts || (sample.dts == dts && id < best_id)
                    }
                };
                if better {
                    best = Some((i, sample.dts, id));
                }
            }
        }

        let (index, _, _) = match best {
            Some(b) => b,
            None => return Ok(None),
        };
        let sample = *self.cursors[index].peek().expect("peeked sample");
        self.cursors[index].next += 1;

        self.source.set_position(sample.offset);
        let data = self
            .source
            .read_exact(sample.size as usize)
            .await?
            .ok_or_else(|| RemuxError::Truncated("sample body beyond end of file".into()))?;

        let mut packet = Packet::new(data)
            .with_track_id(self.tracks[index].id)
            .with_time(sample.dts)
            .with_duration(sample.duration)
            .with_key_flag(sample.keyframe);
        if sample.cts_offset != 0.0 {
            packet = packet.with_composition_offset(sample.cts_offset);
        }
        Ok(Some(packet))
    }

    async fn seek(&mut self, time: f64) -> Result<()> {
        for cursor in &mut self.cursors {
            let mut target = 0;
            for (i, sample) in cursor.samples.iter().enumerate() {
                if sample.dts > time {
                    break;
                }
                if sample.keyframe {
                    target = i;
                }
            }
            cursor.next = target;
        }
        Ok(())
    }

    async fn metadata(&mut self) -> Result<Metadata> {
        Ok(self.metadata.clone())
    }

    async fn close(&mut self) -> Result<()> {
        self.source.close().await
    }
}

fn parse_trak(trak: &[u8], index: usize) -> Result<(Track, u32, Vec<SampleEntry>)> {
    let tkhd = find_child(trak, b"tkhd")
        .ok_or_else(|| RemuxError::Malformed("trak without tkhd".into()))?;
    let (track_id, rotation) = parse_tkhd(tkhd)?;

    let mdia = find_child(trak, b"mdia")
        .ok_or_else(|| RemuxError::Malformed("trak without mdia".into()))?;
    let mdhd = find_child(mdia, b"mdhd")
        .ok_or_else(|| RemuxError::Malformed("mdia without mdhd".into()))?;
    let (timescale, duration, language) = parse_mdhd(mdhd)?;

    let hdlr = find_child(mdia, b"hdlr")
        .ok_or_else(|| RemuxError::Malformed("mdia without hdlr".into()))?;
    let kind = parse_hdlr(hdlr)?;

    let stbl = find_path(mdia, &[b"minf", b"stbl"])
        .ok_or_else(|| RemuxError::Malformed("mdia without stbl".into()))?;
    let stsd = find_child(stbl, b"stsd")
        .ok_or_else(|| RemuxError::Malformed("stbl without stsd".into()))?;
    let entry = parse_stsd(stsd, kind)?;

    let samples = expand_sample_table(stbl, timescale)?;

    let mut track = Track {
        id: track_id,
        index,
        kind,
        codec: entry.codec,
        codec_private: entry.codec_private,
        language,
        is_default: index == 0,
        is_forced: false,
        duration: (duration > 0).then(|| duration as f64 / timescale as f64),
        video: None,
        audio: None,
    };

    match kind {
        TrackKind::Video => {
            let frame_rate = derive_frame_rate(&samples);
            track.video = Some(VideoParams {
                width: entry.width,
                height: entry.height,
                frame_rate,
                rotation,
            });
        }
        TrackKind::Audio => {
            track.audio = Some(AudioParams {
                sample_rate: entry.sample_rate,
                channels: entry.channels,
                bits_per_sample: (entry.sample_size > 0).then_some(entry.sample_size as u32),
            });
        }
        TrackKind::Subtitle => {}
    }

    Ok((track, timescale, samples))
}

fn parse_tkhd(body: &[u8]) -> Result<(u32, Rotation)> {
    if body.len() < 4 {
        return Err(RemuxError::Truncated("tkhd".into()));
    }
    let version = body[0];
    // Offsets past creation/modification times depend on the version
    let (id_at, matrix_at) = match version {
        1 => (20usize, 52usize),
        _ => (12usize, 40usize),
    };
    if body.len() < matrix_at + 36 + 8 {
        return Err(RemuxError::Truncated("tkhd body".into()));
    }
    let track_id = u32::from_be_bytes([
        body[id_at],
        body[id_at + 1],
        body[id_at + 2],
        body[id_at + 3],
    ]);

    let m = |i: usize| {
        from_fixed_16_16(u32::from_be_bytes([
            body[matrix_at + i * 4],
            body[matrix_at + i * 4 + 1],
            body[matrix_at + i * 4 + 2],
            body[matrix_at + i * 4 + 3],
        ]))
    };
    // The 3x3 matrix stores rows (a b u / c d v / x y w); rotation comes
    // from the 2x2 block
    let (a, b, c, d) = (m(0), m(1), m(3), m(4));
    let close = |x: f64, y: f64| (x - y).abs() <= 0.01;
    let rotation = if close(a, 0.0) && close(b, 1.0) && close(c, -1.0) && close(d, 0.0) {
        Rotation::R90
    } else if close(a, -1.0) && close(b, 0.0) && close(c, 0.0) && close(d, -1.0) {
        Rotation::R180
    } else if close(a, 0.0) && close(b, -1.0) && close(c, 1.0) && close(d, 0.0) {
        Rotation::R270
    } else {
        Rotation::None
    };

    Ok((track_id, rotation))
}

fn parse_mdhd(body: &[u8]) -> Result<(u32, u64, Option<String>)> {
    if body.len() < 4 {
        return Err(RemuxError::Truncated("mdhd".into()));
    }
    let version = body[0];
    let (timescale_at, duration_len) = match version {
        1 => (20usize, 8usize),
        _ => (12usize, 4usize),
    };
    if body.len() < timescale_at + 4 + duration_len + 2 {
        return Err(RemuxError::Truncated("mdhd body".into()));
    }
    let timescale = u32::from_be_bytes([
        body[timescale_at],
        body[timescale_at + 1],
        body[timescale_at + 2],
        body[timescale_at + 3],
    ]);
    if timescale == 0 {
        return Err(RemuxError::Malformed("mdhd timescale of zero".into()));
    }
    let duration_at = timescale_at + 4;
    let duration = if duration_len == 8 {
        u64::from_be_bytes([
            body[duration_at],
            body[duration_at + 1],
            body[duration_at + 2],
            body[duration_at + 3],
            body[duration_at + 4],
            body[duration_at + 5],
            body[duration_at + 6],
            body[duration_at + 7],
        ])
    } else {
        u32::from_be_bytes([
            body[duration_at],
            body[duration_at + 1],
            body[duration_at + 2],
            body[duration_at + 3],
        ]) as u64
    };
    let language_at = duration_at + duration_len;
    let packed = u16::from_be_bytes([body[language_at], body[language_at + 1]]) & 0x7FFF;

    Ok((timescale, duration, unpack_language(packed)))
}

fn parse_hdlr(body: &[u8]) -> Result<TrackKind> {
    if body.len() < 12 {
        return Err(RemuxError::Truncated("hdlr".into()));
    }
    let handler = &body[8..12];
    match handler {
        b"vide" => Ok(TrackKind::Video),
        b"soun" => Ok(TrackKind::Audio),
        b"subt" | b"text" | b"sbtl" => Ok(TrackKind::Subtitle),
        other => Err(RemuxError::Unsupported(format!(
            "handler type '{}'",
            boxes::fourcc_str(&[other[0], other[1], other[2], other[3]])
        ))),
    }
}

#[derive(Debug)]
struct StsdEntry {
    codec: CodecId,
    codec_private: Option<Bytes>,
    width: u32,
    height: u32,
    channels: u32,
    sample_size: u16,
    sample_rate: u32,
}

/// Bytes of fixed sample-entry fields before nested boxes begin.
const VISUAL_ENTRY_FIELDS: usize = 78;
const AUDIO_ENTRY_FIELDS: usize = 28;

fn parse_stsd(body: &[u8], kind: TrackKind) -> Result<StsdEntry> {
    if body.len() < 8 {
        return Err(RemuxError::Truncated("stsd".into()));
    }
    let entry_count = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
    if entry_count == 0 {
        return Err(RemuxError::Malformed("stsd with no entries".into()));
    }
    // Only the first sample description is used
    let (format, entry_body) = children(&body[8..])
        .next()
        .ok_or_else(|| RemuxError::Truncated("stsd entry".into()))?;

    let mut entry = StsdEntry {
        codec: codec_from_sample_entry(&format)?,
        codec_private: None,
        width: 0,
        height: 0,
        channels: 0,
        sample_size: 0,
        sample_rate: 0,
    };

    match kind {
        TrackKind::Video => {
            if entry_body.len() < VISUAL_ENTRY_FIELDS {
                return Err(RemuxError::Truncated("visual sample entry".into()));
            }
            entry.width = u16::from_be_bytes([entry_body[24], entry_body[25]]) as u32;
            entry.height = u16::from_be_bytes([entry_body[26], entry_body[27]]) as u32;
            for (child_type, child) in children(&entry_body[VISUAL_ENTRY_FIELDS..]) {
                match &child_type {
                    b"avcC" | b"hvcC" | b"av1C" | b"vpcC" | b"esds" => {
                        entry.codec_private = Some(Bytes::copy_from_slice(child));
                    }
                    _ => {}
                }
            }
        }
        TrackKind::Audio => {
            if entry_body.len() < AUDIO_ENTRY_FIELDS {
                return Err(RemuxError::Truncated("audio sample entry".into()));
            }
            entry.channels = u16::from_be_bytes([entry_body[16], entry_body[17]]) as u32;
            entry.sample_size = u16::from_be_bytes([entry_body[18], entry_body[19]]);
            // 16.16 fixed point; the rate lives in the upper 16 bits
            entry.sample_rate = u16::from_be_bytes([entry_body[24], entry_body[25]]) as u32;
            for (child_type, child) in children(&entry_body[AUDIO_ENTRY_FIELDS..]) {
                if &child_type == b"esds" {
                    entry.codec_private = Some(Bytes::copy_from_slice(child));
                    if let Ok(config) = aac::parse_esds(child) {
                        if config.sample_rate > 0 {
                            entry.sample_rate = config.sample_rate;
                        }
                        entry.channels = config.channels;
                    }
                } else if &child_type == b"dOps" {
                    entry.codec_private = Some(Bytes::copy_from_slice(child));
                }
            }
        }
        TrackKind::Subtitle => {}
    }

    Ok(entry)
}

fn codec_from_sample_entry(format: &[u8; 4]) -> Result<CodecId> {
    match format {
        b"avc1" | b"avc3" => Ok(CodecId::H264),
        b"hvc1" | b"hev1" => Ok(CodecId::H265),
        b"av01" => Ok(CodecId::Av1),
        b"vp08" => Ok(CodecId::Vp8),
        b"vp09" => Ok(CodecId::Vp9),
        b"mp4a" => Ok(CodecId::Aac),
        b"Opus" => Ok(CodecId::Opus),
        b"fLaC" => Ok(CodecId::Flac),
        b".mp3" => Ok(CodecId::Mp3),
        b"ac-3" => Ok(CodecId::Ac3),
        b"sowt" => Ok(CodecId::PcmS16Le),
        b"twos" => Ok(CodecId::PcmS16Be),
        b"tx3g" | b"text" => Ok(CodecId::Text),
        b"wvtt" => Ok(CodecId::WebVtt),
        other => Err(RemuxError::Unsupported(format!(
            "sample entry '{}'",
            boxes::fourcc_str(other)
        ))),
    }
}

struct U32Table<'a> {
    data: &'a [u8],
}

impl<'a> U32Table<'a> {
    fn get(&self, index: usize) -> u32 {
        let at = index * 4;
        u32::from_be_bytes([
            self.data[at],
            self.data[at + 1],
            self.data[at + 2],
            self.data[at + 3],
        ])
    }
}

fn full_box_table(body: &[u8], name: &str) -> Result<(u32, usize)> {
    if body.len() < 8 {
        return Err(RemuxError::Truncated(name.into()));
    }
    let count = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
    Ok((count, 8))
}

/// Expands stts/ctts/stsc/stsz/stco|co64/stss into the flat per-track
/// sample vector.
fn expand_sample_table(stbl: &[u8], timescale: u32) -> Result<Vec<SampleEntry>> {
    let stts = find_child(stbl, b"stts")
        .ok_or_else(|| RemuxError::Malformed("stbl without stts".into()))?;
    let stsc = find_child(stbl, b"stsc")
        .ok_or_else(|| RemuxError::Malformed("stbl without stsc".into()))?;
    let stsz = find_child(stbl, b"stsz")
        .ok_or_else(|| RemuxError::Malformed("stbl without stsz".into()))?;
    let ctts = find_child(stbl, b"ctts");
    let stss = find_child(stbl, b"stss");

    // Sizes
    if stsz.len() < 12 {
        return Err(RemuxError::Truncated("stsz".into()));
    }
    let uniform_size = u32::from_be_bytes([stsz[4], stsz[5], stsz[6], stsz[7]]);
    let sample_count = u32::from_be_bytes([stsz[8], stsz[9], stsz[10], stsz[11]]) as usize;
    let size_of = |i: usize| -> Result<u32> {
        if uniform_size != 0 {
            Ok(uniform_size)
        } else {
            let at = 12 + i * 4;
            if at + 4 > stsz.len() {
                return Err(RemuxError::Truncated("stsz entry".into()));
            }
            Ok(u32::from_be_bytes([
                stsz[at],
                stsz[at + 1],
                stsz[at + 2],
                stsz[at + 3],
            ]))
        }
    };

    // Chunk offsets: stco or co64
    let (chunk_count, chunk_offset): (usize, Box<dyn Fn(usize) -> u64 + '_>) =
        if let Some(stco) = find_child(stbl, b"stco") {
            let (count, base) = full_box_table(stco, "stco")?;
            if stco.len() < base + count as usize * 4 {
                return Err(RemuxError::Truncated("stco entries".into()));
            }
            let table = U32Table { data: &stco[base..] };
            (count as usize, Box::new(move |i| table.get(i) as u64))
        } else if let Some(co64) = find_child(stbl, b"co64") {
            let (count, base) = full_box_table(co64, "co64")?;
            if co64.len() < base + count as usize * 8 {
                return Err(RemuxError::Truncated("co64 entries".into()));
            }
            let data = &co64[base..];
            (
                count as usize,
                Box::new(move |i| {
                    let at = i * 8;
                    u64::from_be_bytes([
                        data[at],
                        data[at + 1],
                        data[at + 2],
                        data[at + 3],
                        data[at + 4],
                        data[at + 5],
                        data[at + 6],
                        data[at + 7],
                    ])
                }),
            )
        } else {
            return Err(RemuxError::Malformed("stbl without stco or co64".into()));
        };

    // Decode deltas
    let (stts_count, stts_base) = full_box_table(stts, "stts")?;
    if stts.len() < stts_base + stts_count as usize * 8 {
        return Err(RemuxError::Truncated("stts entries".into()));
    }
    let stts_table = U32Table {
        data: &stts[stts_base..],
    };

    // Composition offsets
    let ctts_info = match ctts {
        Some(body) => {
            let (count, base) = full_box_table(body, "ctts")?;
            let version = body[0];
            if body.len() < base + count as usize * 8 {
                return Err(RemuxError::Truncated("ctts entries".into()));
            }
            Some((version, count as usize, U32Table { data: &body[base..] }))
        }
        None => None,
    };

    // Sync samples (1-based); absent means everything is a keyframe
    let stss_set: Option<Vec<u32>> = match stss {
        Some(body) => {
            let (count, base) = full_box_table(body, "stss")?;
            if body.len() < base + count as usize * 4 {
                return Err(RemuxError::Truncated("stss entries".into()));
            }
            let table = U32Table { data: &body[base..] };
            Some((0..count as usize).map(|i| table.get(i)).collect())
        }
        None => None,
    };

    // stsc entries: each applies from first_chunk until the next entry
    let (stsc_count, stsc_base) = full_box_table(stsc, "stsc")?;
    if stsc.len() < stsc_base + stsc_count as usize * 12 {
        return Err(RemuxError::Truncated("stsc entries".into()));
    }
    let stsc_table = U32Table {
        data: &stsc[stsc_base..],
    };
    let stsc_entry = |e: usize| (stsc_table.get(e * 3), stsc_table.get(e * 3 + 1));

    let mut samples = Vec::with_capacity(sample_count);

    // Timing state
    let mut stts_entry = 0usize;
    let mut stts_left = if stts_count > 0 { stts_table.get(0) } else { 0 };
    let mut dts_ticks = 0u64;

    let mut ctts_entry = 0usize;
    let mut ctts_left = ctts_info
        .as_ref()
        .map(|(_, count, t)| if *count > 0 { t.get(0) } else { 0 })
        .unwrap_or(0);

    let mut sample_index = 0usize;
    let mut stsc_idx = 0usize;

    'chunks: for chunk in 0..chunk_count {
        let chunk_number = chunk as u32 + 1;
        while stsc_idx + 1 < stsc_count as usize && stsc_entry(stsc_idx + 1).0 <= chunk_number {
            stsc_idx += 1;
        }
        let samples_in_chunk = if stsc_count > 0 { stsc_entry(stsc_idx).1 } else { 0 };

        let mut offset = chunk_offset(chunk);
        for _ in 0..samples_in_chunk {
            if sample_index >= sample_count {
                break 'chunks;
            }
            let size = size_of(sample_index)?;

            // Decode delta for this sample
            let mut delta = 0u32;
            if stts_entry < stts_count as usize {
                delta = stts_table.get(stts_entry * 2 + 1);
                if stts_left == 0 {
                    // exhausted entry with zero count: step forward
                    stts_entry += 1;
                    if stts_entry < stts_count as usize {
                        stts_left = stts_table.get(stts_entry * 2);
                        delta = stts_table.get(stts_entry * 2 + 1);
                    }
                }
            }

            // Composition offset for this sample
            let mut cts_ticks = 0i64;
            if let Some((version, count, table)) = &ctts_info {
                if ctts_entry < *count {
                    let raw = table.get(ctts_entry * 2 + 1);
                    cts_ticks = if *version == 1 {
                        raw as i32 as i64
                    } else {
                        raw as i64
                    };
                }
            }

            let keyframe = match &stss_set {
                Some(set) => set.binary_search(&(sample_index as u32 + 1)).is_ok(),
                None => true,
            };

            samples.push(SampleEntry {
                offset,
                size,
                dts: dts_ticks as f64 / timescale as f64,
                duration: delta as f64 / timescale as f64,
                keyframe,
                cts_offset: cts_ticks as f64 / timescale as f64,
            });

            offset += size as u64;
            dts_ticks += delta as u64;
            sample_index += 1;

            if stts_left > 0 {
                stts_left -= 1;
                if stts_left == 0 && stts_entry + 1 < stts_count as usize {
                    stts_entry += 1;
                    stts_left = stts_table.get(stts_entry * 2);
                }
            }
            if let Some((_, count, table)) = &ctts_info {
                if ctts_left > 0 {
                    ctts_left -= 1;
                    if ctts_left == 0 && ctts_entry + 1 < *count {
                        ctts_entry += 1;
                        ctts_left = table.get(ctts_entry * 2);
                    }
                }
            }
        }
    }

    Ok(samples)
}

fn derive_frame_rate(samples: &[SampleEntry]) -> Option<f64> {
    let first = samples.first()?;
    if first.duration > 0.0 {
        Some((1.0 / first.duration * 1000.0).round() / 1000.0)
    } else {
        None
    }
}

fn parse_mvex(mvex: &[u8]) -> Vec<TrexDefaults> {
    let mut defaults = Vec::new();
    for (box_type, body) in children(mvex) {
        if &box_type != b"trex" || body.len() < 24 {
            continue;
        }
        defaults.push(TrexDefaults {
            track_id: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
            duration: u32::from_be_bytes([body[12], body[13], body[14], body[15]]),
            size: u32::from_be_bytes([body[16], body[17], body[18], body[19]]),
            flags: u32::from_be_bytes([body[20], body[21], body[22], body[23]]),
        });
    }
    defaults
}

// tfhd flag bits
const TFHD_BASE_DATA_OFFSET: u32 = 0x000001;
const TFHD_SAMPLE_DESCRIPTION: u32 = 0x000002;
const TFHD_DEFAULT_DURATION: u32 = 0x000008;
const TFHD_DEFAULT_SIZE: u32 = 0x000010;
const TFHD_DEFAULT_FLAGS: u32 = 0x000020;
const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x020000;

// trun flag bits
const TRUN_DATA_OFFSET: u32 = 0x000001;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x000004;
const TRUN_SAMPLE_DURATION: u32 = 0x000100;
const TRUN_SAMPLE_SIZE: u32 = 0x000200;
const TRUN_SAMPLE_FLAGS: u32 = 0x000400;
const TRUN_SAMPLE_CTS: u32 = 0x000800;

const SAMPLE_IS_NON_SYNC: u32 = 0x0001_0000;

fn expand_moof(
    moof_start: u64,
    moof: &[u8],
    trex: &[TrexDefaults],
    tracks: &[Track],
    timescales: &[u32],
    cursors: &mut [TrackCursor],
) -> Result<()> {
    for (box_type, traf) in children(moof) {
        if &box_type != b"traf" {
            continue;
        }
        let tfhd = match find_child(traf, b"tfhd") {
            Some(b) => b,
            None => continue,
        };
        if tfhd.len() < 8 {
            return Err(RemuxError::Truncated("tfhd".into()));
        }
        let tf_flags = u32::from_be_bytes([0, tfhd[1], tfhd[2], tfhd[3]]);
        let track_id = u32::from_be_bytes([tfhd[4], tfhd[5], tfhd[6], tfhd[7]]);
        let index = match tracks.iter().position(|t| t.id == track_id) {
            Some(i) => i,
            None => {
                log::warn!("traf for undeclared track {}", track_id);
                continue;
            }
        };
        let timescale = timescales[index];
        let defaults = trex
            .iter()
            .find(|t| t.track_id == track_id)
            .copied()
            .unwrap_or_default();

        let mut at = 8usize;
        let mut base_offset = moof_start;
        if tf_flags & TFHD_BASE_DATA_OFFSET != 0 {
            if tfhd.len() < at + 8 {
                return Err(RemuxError::Truncated("tfhd base_data_offset".into()));
            }
            base_offset = u64::from_be_bytes([
                tfhd[at],
                tfhd[at + 1],
                tfhd[at + 2],
                tfhd[at + 3],
                tfhd[at + 4],
                tfhd[at + 5],
                tfhd[at + 6],
                tfhd[at + 7],
            ]);
            at += 8;
        } else if tf_flags & TFHD_DEFAULT_BASE_IS_MOOF == 0 {
            // Without either flag the base is the moof start as well for
            // the first traf; we keep that approximation
            base_offset = moof_start;
        }
        if tf_flags & TFHD_SAMPLE_DESCRIPTION != 0 {
            at += 4;
        }
        let mut default_duration = defaults.duration;
        if tf_flags & TFHD_DEFAULT_DURATION != 0 {
            if tfhd.len() < at + 4 {
                return Err(RemuxError::Truncated("tfhd default duration".into()));
            }
            default_duration =
                u32::from_be_bytes([tfhd[at], tfhd[at + 1], tfhd[at + 2], tfhd[at + 3]]);
            at += 4;
        }
        let mut default_size = defaults.size;
        if tf_flags & TFHD_DEFAULT_SIZE != 0 {
            if tfhd.len() < at + 4 {
                return Err(RemuxError::Truncated("tfhd default size".into()));
            }
            default_size = u32::from_be_bytes([tfhd[at], tfhd[at + 1], tfhd[at + 2], tfhd[at + 3]]);
            at += 4;
        }
        let mut default_flags = defaults.flags;
        if tf_flags & TFHD_DEFAULT_FLAGS != 0 {
            if tfhd.len() < at + 4 {
                return Err(RemuxError::Truncated("tfhd default flags".into()));
            }
            default_flags =
                u32::from_be_bytes([tfhd[at], tfhd[at + 1], tfhd[at + 2], tfhd[at + 3]]);
        }

        // Base decode time: tfdt when present, else continue from what the
        // track has accumulated
        let mut dts_ticks: u64 = match find_child(traf, b"tfdt") {
            Some(tfdt) if tfdt.len() >= 8 => {
                if tfdt[0] == 1 {
                    if tfdt.len() < 12 {
                        return Err(RemuxError::Truncated("tfdt v1".into()));
                    }
                    u64::from_be_bytes([
                        tfdt[4], tfdt[5], tfdt[6], tfdt[7], tfdt[8], tfdt[9], tfdt[10], tfdt[11],
                    ])
                } else {
                    u32::from_be_bytes([tfdt[4], tfdt[5], tfdt[6], tfdt[7]]) as u64
                }
            }
            _ => {
                let cursor = &cursors[index];
                cursor
                    .samples
                    .last()
                    .map(|s| ((s.dts + s.duration) * timescale as f64).round() as u64)
                    .unwrap_or(0)
            }
        };

        for (child_type, trun) in children(traf) {
            if &child_type != b"trun" {
                continue;
            }
            if trun.len() < 8 {
                return Err(RemuxError::Truncated("trun".into()));
            }
            let flags = u32::from_be_bytes([0, trun[1], trun[2], trun[3]]);
            let count = u32::from_be_bytes([trun[4], trun[5], trun[6], trun[7]]) as usize;
            let mut at = 8usize;

            let mut offset = base_offset;
            if flags & TRUN_DATA_OFFSET != 0 {
                if trun.len() < at + 4 {
                    return Err(RemuxError::Truncated("trun data_offset".into()));
                }
                let data_offset =
                    i32::from_be_bytes([trun[at], trun[at + 1], trun[at + 2], trun[at + 3]]);
                offset = (base_offset as i64 + data_offset as i64) as u64;
                at += 4;
            }

            let mut first_flags = None;
            if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
                if trun.len() < at + 4 {
                    return Err(RemuxError::Truncated("trun first_sample_flags".into()));
                }
                first_flags = Some(u32::from_be_bytes([
                    trun[at],
                    trun[at + 1],
                    trun[at + 2],
                    trun[at + 3],
                ]));
                at += 4;
            }

            for i in 0..count {
                let mut duration = default_duration;
                if flags & TRUN_SAMPLE_DURATION != 0 {
                    if trun.len() < at + 4 {
                        return Err(RemuxError::Truncated("trun sample duration".into()));
                    }
                    duration =
                        u32::from_be_bytes([trun[at], trun[at + 1], trun[at + 2], trun[at + 3]]);
                    at += 4;
                }
                let mut size = default_size;
                if flags & TRUN_SAMPLE_SIZE != 0 {
                    if trun.len() < at + 4 {
                        return Err(RemuxError::Truncated("trun sample size".into()));
                    }
                    size = u32::from_be_bytes([trun[at], trun[at + 1], trun[at + 2], trun[at + 3]]);
                    at += 4;
                }
                let mut sample_flags = default_flags;
                if flags & TRUN_SAMPLE_FLAGS != 0 {
                    if trun.len() < at + 4 {
                        return Err(RemuxError::Truncated("trun sample flags".into()));
                    }
                    sample_flags =
                        u32::from_be_bytes([trun[at], trun[at + 1], trun[at + 2], trun[at + 3]]);
                    at += 4;
                }
                if i == 0 {
                    if let Some(f) = first_flags {
                        sample_flags = f;
                    }
                }
                let mut cts_ticks = 0i64;
                if flags & TRUN_SAMPLE_CTS != 0 {
                    if trun.len() < at + 4 {
                        return Err(RemuxError::Truncated("trun sample cts".into()));
                    }
                    let raw = u32::from_be_bytes([trun[at], trun[at + 1], trun[at + 2], trun[at + 3]]);
                    cts_ticks = if trun[0] >= 1 { raw as i32 as i64 } else { raw as i64 };
                    at += 4;
                }

                cursors[index].samples.push(SampleEntry {
                    offset,
                    size,
                    dts: dts_ticks as f64 / timescale as f64,
                    duration: duration as f64 / timescale as f64,
                    keyframe: sample_flags & SAMPLE_IS_NON_SYNC == 0,
                    cts_offset: cts_ticks as f64 / timescale as f64,
                });

                offset += size as u64;
                dts_ticks += duration as u64;
            }

            base_offset = offset;
        }
    }

    Ok(())
}

fn parse_ilst(ilst: &[u8]) -> Metadata {
    let mut metadata = Metadata::default();
    for (atom, body) in children(ilst) {
        let Some((type_code, payload)) = read_data_atom(body) else {
            continue;
        };
        if &atom == b"covr" {
            let format = match type_code {
                13 => Some(CoverArtFormat::Jpeg),
                14 => Some(CoverArtFormat::Png),
                _ => None,
            };
            if let Some(format) = format {
                metadata.cover_art = Some((Bytes::copy_from_slice(payload), format));
            }
            continue;
        }
        if type_code != 1 {
            continue;
        }
        let Ok(text) = std::str::from_utf8(payload) else {
            continue;
        };
        let value = text.to_string();
        match &atom {
            b"\xa9nam" => metadata.title = Some(value),
            b"\xa9ART" => metadata.artist = Some(value),
            b"aART" => metadata.album_artist = Some(value),
            b"\xa9alb" => metadata.album = Some(value),
            b"\xa9gen" => metadata.genre = Some(value),
            b"\xa9day" => metadata.date = Some(value),
            b"\xa9wrt" => metadata.composer = Some(value),
            b"cprt" => metadata.copyright = Some(value),
            b"\xa9cmt" => metadata.comment = Some(value),
            b"\xa9too" => metadata.encoder = Some(value),
            b"desc" => metadata.description = Some(value),
            _ => metadata.extra.push((atom, value)),
        }
    }
    metadata
}

fn read_data_atom(item_body: &[u8]) -> Option<(u32, &[u8])> {
    for (box_type, body) in children(item_body) {
        if &box_type == b"data" && body.len() >= 8 {
            let type_code = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
            return Some((type_code, &body[8..]));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::mp4::boxes::{write_box, write_full_box};
    use crate::io::BufSource;
    use bytes::{BufMut, BytesMut};

    fn full_table(box_type: &[u8; 4], entries: &[u32]) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u32(entries.len() as u32 / entry_width(box_type));
        for &v in entries {
            body.put_u32(v);
        }
        write_full_box(box_type, 0, 0, &body)
    }

    fn entry_width(box_type: &[u8; 4]) -> u32 {
        match box_type {
            b"stts" | b"ctts" => 2,
            b"stsc" => 3,
            _ => 1,
        }
    }

    fn stsz_uniform(size: u32, count: u32) -> Bytes {
        let mut body = BytesMut::new();
        body.put_u32(size);
        body.put_u32(count);
        write_full_box(b"stsz", 0, 0, &body)
    }

    /// Ten 5-byte samples in one chunk at offset 24, one tick apart at
    /// timescale 1000: dts 0.000, 0.001, … 0.009.
    fn build_ten_sample_stbl() -> Vec<u8> {
        let mut stbl = BytesMut::new();
        stbl.extend_from_slice(&full_table(b"stts", &[10, 1]));
        stbl.extend_from_slice(&full_table(b"stsc", &[1, 1, 1]));
        stbl.extend_from_slice(&stsz_uniform(5, 10));
        stbl.extend_from_slice(&full_table(b"stco", &[24]));
        stbl.to_vec()
    }

    #[test]
    fn test_sample_table_expansion_single_chunk() {
        let stbl = build_ten_sample_stbl();
        let samples = expand_sample_table(&stbl, 1000).unwrap();
        assert_eq!(samples.len(), 10);
        for (i, sample) in samples.iter().enumerate() {
            assert_eq!(sample.offset, 24 + i as u64 * 5);
            assert_eq!(sample.size, 5);
            assert!((sample.dts - i as f64 * 0.001).abs() < 1e-9);
            assert!((sample.duration - 0.001).abs() < 1e-9);
            assert!(sample.keyframe, "no stss means every sample is a sync");
        }
    }

    #[test]
    fn test_sample_table_multi_chunk_stsc() {
        // Two stsc entries: chunks 1.. have 2 samples, chunks 3.. have 1
        let mut stbl = BytesMut::new();
        stbl.extend_from_slice(&full_table(b"stts", &[4, 100]));
        stbl.extend_from_slice(&full_table(b"stsc", &[1, 2, 1, 3, 1, 1]));
        stbl.extend_from_slice(&stsz_uniform(10, 4));
        stbl.extend_from_slice(&full_table(b"stco", &[0, 100, 200]));
        let samples = expand_sample_table(&stbl, 1000).unwrap();
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0].offset, 0);
        assert_eq!(samples[1].offset, 10);
        assert_eq!(samples[2].offset, 100);
        // chunk 3 applies the second entry: one sample
        assert_eq!(samples[3].offset, 200);
    }

    #[test]
    fn test_sample_table_stss_marks_keyframes() {
        let mut stbl = BytesMut::new();
        stbl.extend_from_slice(&full_table(b"stts", &[4, 100]));
        stbl.extend_from_slice(&full_table(b"stsc", &[1, 4, 1]));
        stbl.extend_from_slice(&stsz_uniform(10, 4));
        stbl.extend_from_slice(&full_table(b"stco", &[0]));
        stbl.extend_from_slice(&full_table(b"stss", &[1, 3]));
        let samples = expand_sample_table(&stbl, 1000).unwrap();
        let keys: Vec<bool> = samples.iter().map(|s| s.keyframe).collect();
        assert_eq!(keys, vec![true, false, true, false]);
    }

    #[test]
    fn test_ctts_signed_offsets() {
        let mut stbl = BytesMut::new();
        stbl.extend_from_slice(&full_table(b"stts", &[2, 100]));
        stbl.extend_from_slice(&full_table(b"stsc", &[1, 2, 1]));
        stbl.extend_from_slice(&stsz_uniform(10, 2));
        stbl.extend_from_slice(&full_table(b"stco", &[0]));
        // version 1 ctts with a negative offset
        let mut ctts_body = BytesMut::new();
        ctts_body.put_u32(2);
        ctts_body.put_u32(1);
        ctts_body.put_u32(200);
        ctts_body.put_u32(1);
        ctts_body.put_u32((-100i32) as u32);
        stbl.extend_from_slice(&write_full_box(b"ctts", 1, 0, &ctts_body));
        let samples = expand_sample_table(&stbl, 1000).unwrap();
        assert!((samples[0].cts_offset - 0.2).abs() < 1e-9);
        assert!((samples[1].cts_offset + 0.1).abs() < 1e-9);
    }

    fn build_minimal_mp4() -> Vec<u8> {
        // tkhd v0 body: version/flags + times + id + reserved + duration
        let mut tkhd = BytesMut::new();
        tkhd.put_u32(0); // version+flags
        tkhd.put_u32(0); // creation
        tkhd.put_u32(0); // modification
        tkhd.put_u32(1); // track id
        tkhd.put_u32(0); // reserved
        tkhd.put_u32(10); // duration
        tkhd.put_u64(0); // reserved
        tkhd.put_u16(0); // layer
        tkhd.put_u16(0); // alternate group
        tkhd.put_u16(0); // volume
        tkhd.put_u16(0); // reserved
        for v in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
            tkhd.put_u32(v);
        }
        tkhd.put_u32(16 << 16); // width
        tkhd.put_u32(16 << 16); // height
        let tkhd = write_box(b"tkhd", &tkhd);

        let mut mdhd = BytesMut::new();
        mdhd.put_u32(0);
        mdhd.put_u32(0);
        mdhd.put_u32(0);
        mdhd.put_u32(1000); // timescale
        mdhd.put_u32(10); // duration
        mdhd.put_u16(super::super::boxes::pack_language(Some("eng")));
        mdhd.put_u16(0);
        let mdhd = write_box(b"mdhd", &mdhd);

        let mut hdlr = BytesMut::new();
        hdlr.put_u32(0);
        hdlr.put_u32(0);
        hdlr.put_slice(b"vide");
        hdlr.put_slice(&[0u8; 12]);
        hdlr.put_u8(0);
        let hdlr = write_box(b"hdlr", &hdlr);

        // visual sample entry avc1 with no extension boxes
        let mut avc1 = BytesMut::new();
        avc1.put_slice(&[0u8; 6]);
        avc1.put_u16(1); // data_reference_index
        avc1.put_slice(&[0u8; 16]);
        avc1.put_u16(16); // width
        avc1.put_u16(16); // height
        avc1.put_u32(0x0048_0000);
        avc1.put_u32(0x0048_0000);
        avc1.put_u32(0);
        avc1.put_u16(1);
        avc1.put_slice(&[0u8; 32]);
        avc1.put_u16(0x0018);
        avc1.put_i16(-1);
        let avc1 = write_box(b"avc1", &avc1);
        let mut stsd = BytesMut::new();
        stsd.put_u32(0);
        stsd.put_u32(1);
        stsd.extend_from_slice(&avc1);
        let stsd = write_box(b"stsd", &stsd);

        let mut stbl = BytesMut::new();
        stbl.extend_from_slice(&stsd);
        stbl.extend_from_slice(&build_ten_sample_stbl());
        let stbl = write_box(b"stbl", &stbl);
        let minf = write_box(b"minf", &stbl);

        let mut mdia = BytesMut::new();
        mdia.extend_from_slice(&mdhd);
        mdia.extend_from_slice(&hdlr);
        mdia.extend_from_slice(&minf);
        let mdia = write_box(b"mdia", &mdia);

        let mut trak = BytesMut::new();
        trak.extend_from_slice(&tkhd);
        trak.extend_from_slice(&mdia);
        let trak = write_box(b"trak", &trak);
        let moov = write_box(b"moov", &trak);

        let ftyp = {
            let mut b = BytesMut::new();
            b.put_slice(b"isom");
            b.put_u32(0x200);
            b.put_slice(b"isomiso2");
            write_box(b"ftyp", &b)
        };

        // stco points at offset 24, right where mdat begins after the
        // 24-byte ftyp; the demuxer trusts the table
        let mut file = Vec::new();
        file.extend_from_slice(&ftyp);
        let mdat_payload = [0xABu8; 50];
        file.extend_from_slice(&write_box(b"mdat", &mdat_payload));
        file.extend_from_slice(&moov);
        file
    }

    #[tokio::test]
    async fn test_open_minimal_file() {
        let file = build_minimal_mp4();
        let mut demuxer = Mp4Demuxer::open(Box::new(BufSource::new(file))).await.unwrap();
        assert_eq!(demuxer.major_brand(), *b"isom");
        assert!(!demuxer.is_fragmented());

        let tracks = demuxer.tracks().await.unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id, 1);
        assert_eq!(tracks[0].kind, TrackKind::Video);
        assert_eq!(tracks[0].codec, CodecId::H264);
        assert_eq!(tracks[0].language.as_deref(), Some("eng"));
        let video = tracks[0].video.as_ref().unwrap();
        assert_eq!((video.width, video.height), (16, 16));

        // Ten packets, dts 0.000..0.009, offsets 24,29,...,69
        let table = demuxer.sample_table(0).unwrap().to_vec();
        assert_eq!(table.len(), 10);
        assert_eq!(table[0].offset, 24);
        assert_eq!(table[9].offset, 69);

        let mut count = 0;
        while let Some(packet) = demuxer.read_packet().await.unwrap() {
            assert_eq!(packet.data.len(), 5);
            assert!((packet.time - count as f64 * 0.001).abs() < 1e-9);
            assert!(packet.is_key);
            count += 1;
        }
        assert_eq!(count, 10);
    }

    #[tokio::test]
    async fn test_seek_rewinds_to_keyframe() {
        let file = build_minimal_mp4();
        let mut demuxer = Mp4Demuxer::open(Box::new(BufSource::new(file))).await.unwrap();
        while demuxer.read_packet().await.unwrap().is_some() {}
        demuxer.seek(0.005).await.unwrap();
        let packet = demuxer.read_packet().await.unwrap().unwrap();
        // every sample is a keyframe, so seek lands on dts 0.005 exactly
        assert!((packet.time - 0.005).abs() < 1e-9);
    }

    #[test]
    fn test_tkhd_rotation_matrix() {
        // 90-degree matrix: a=0 b=1 c=-1 d=0
        let mut tkhd = BytesMut::new();
        tkhd.put_u32(0);
        tkhd.put_u32(0);
        tkhd.put_u32(0);
        tkhd.put_u32(7);
        tkhd.put_u32(0);
        tkhd.put_u32(0);
        tkhd.put_u64(0);
        tkhd.put_u64(0);
        let matrix: [u32; 9] = [
            0,
            0x0001_0000,
            0,
            (-1i32 as u32) & 0xFFFF_0000,
            0,
            0,
            0,
            0,
            0x4000_0000,
        ];
        for v in matrix {
            tkhd.put_u32(v);
        }
        tkhd.put_u32(0);
        tkhd.put_u32(0);
        let (id, rotation) = parse_tkhd(&tkhd).unwrap();
        assert_eq!(id, 7);
        assert_eq!(rotation, Rotation::R90);
    }

    #[test]
    fn test_ilst_parse() {
        let mut data_body = BytesMut::new();
        data_body.put_u32(1); // type utf-8
        data_body.put_u32(0); // locale
        data_body.put_slice(b"A Title");
        let data = write_box(b"data", &data_body);
        let nam = write_box(b"\xa9nam", &data);
        let ilst = nam.to_vec();
        let metadata = parse_ilst(&ilst);
        assert_eq!(metadata.title.as_deref(), Some("A Title"));
    }
}
