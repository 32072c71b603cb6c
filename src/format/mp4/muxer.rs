use super::boxes::{pack_language, to_fixed_16_16, write_box, write_full_box};
use crate::av::{Chapter, CodecId, CoverArtFormat, Metadata, Packet, Track, TrackKind};
use crate::codec::aac;
use crate::format::Muxer;
use crate::io::Target;
use crate::{RemuxError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Major brand choices for the `ftyp` box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mp4Brand {
    /// Plain MP4 (`isom`)
    #[default]
    Isom,
    /// QuickTime movie (`qt  `)
    QuickTime,
    /// CMAF (`cmfc`)
    Cmaf,
}

impl Mp4Brand {
    pub(crate) fn major(&self) -> [u8; 4] {
        match self {
            Mp4Brand::Isom => *b"isom",
            Mp4Brand::QuickTime => *b"qt  ",
            Mp4Brand::Cmaf => *b"cmfc",
        }
    }

    pub(crate) fn compatible(&self) -> &'static [&'static [u8; 4]] {
        match self {
            Mp4Brand::Isom => &[b"isom", b"iso2", b"avc1", b"mp41"],
            Mp4Brand::QuickTime => &[b"qt  "],
            Mp4Brand::Cmaf => &[b"cmfc", b"iso6", b"isom"],
        }
    }
}

/// Configuration for the progressive MP4 muxer.
#[derive(Debug, Clone, Default)]
pub struct Mp4MuxerConfig {
    /// Brand written into `ftyp`
    pub brand: Mp4Brand,
}

/// Movie-header timescale (ticks per second)
pub(crate) const MOVIE_TIMESCALE: u32 = 1000;

/// Media timescale for a track: round(fps·1000) for video, the sample
/// rate for audio, 1000 for subtitles.
pub(crate) fn media_timescale(track: &Track) -> u32 {
    match track.kind {
        TrackKind::Video => track
            .video
            .as_ref()
            .and_then(|v| v.frame_rate)
            .map(|fps| (fps * 1000.0).round() as u32)
            .filter(|&ts| ts > 0)
            .unwrap_or(MOVIE_TIMESCALE),
        TrackKind::Audio => track
            .audio
            .as_ref()
            .map(|a| a.sample_rate)
            .filter(|&r| r > 0)
            .unwrap_or(MOVIE_TIMESCALE),
        TrackKind::Subtitle => MOVIE_TIMESCALE,
    }
}

#[derive(Debug, Clone, Copy)]
struct BufferedSample {
    payload_offset: u64,
    size: u32,
    dts_ticks: u64,
    explicit_duration: Option<u64>,
    cts_ticks: i64,
    keyframe: bool,
}

#[derive(Debug)]
struct TrackBuf {
    track: Track,
    timescale: u32,
    samples: Vec<BufferedSample>,
    /// Set on the synthesized chapter text track
    is_chapter_track: bool,
}

/// Progressive (fast-start) MP4/MOV muxer.
///
/// Sample payloads and metadata buffer in memory until
/// [`Muxer::write_trailer`], which emits `moov` before `mdat` so the
/// result streams immediately. Memory footprint is O(total payload).
pub struct Mp4Muxer<T: Target> {
    target: T,
    config: Mp4MuxerConfig,
    tracks: Vec<TrackBuf>,
    payload: BytesMut,
    metadata: Metadata,
    chapters: Vec<Chapter>,
    header_written: bool,
    finalized: bool,
}

impl<T: Target> Mp4Muxer<T> {
    /// Creates a muxer writing to `target`
    pub fn new(target: T, config: Mp4MuxerConfig) -> Self {
        Self {
            target,
            config,
            tracks: Vec::new(),
            payload: BytesMut::new(),
            metadata: Metadata::default(),
            chapters: Vec::new(),
            header_written: false,
            finalized: false,
        }
    }

    /// Adds a QuickTime chapter mark. Must be called before the trailer.
    pub fn add_chapter(&mut self, chapter: Chapter) {
        self.chapters.push(chapter);
    }

    /// Consumes the muxer, returning its target
    pub fn into_target(self) -> T {
        self.target
    }

    fn validate(&self, tracks: &[Track]) -> Result<()> {
        for track in tracks {
            if track.kind == TrackKind::Audio {
                let rate = track.audio.as_ref().map(|a| a.sample_rate).unwrap_or(0);
                if rate == 0 {
                    return Err(RemuxError::Config(format!(
                        "audio track {} has no sample rate",
                        track.id
                    )));
                }
            }
            if track.kind == TrackKind::Video && track.video.is_none() {
                return Err(RemuxError::Config(format!(
                    "video track {} has no dimensions",
                    track.id
                )));
            }
        }
        Ok(())
    }

    fn append_chapter_track(&mut self) {
        if self.chapters.is_empty() {
            return;
        }
        let movie_end = self
            .tracks
            .iter()
            .map(|t| t.duration_seconds())
            .fold(0.0f64, f64::max);
        let chapter_id = self.tracks.iter().map(|t| t.track.id).max().unwrap_or(0) + 1;

        let mut chapters = std::mem::take(&mut self.chapters);
        chapters.sort_by(|a, b| a.start.total_cmp(&b.start));

        let mut buf = TrackBuf {
            track: Track::subtitle(chapter_id, self.tracks.len(), CodecId::Text),
            timescale: MOVIE_TIMESCALE,
            samples: Vec::with_capacity(chapters.len()),
            is_chapter_track: true,
        };

        for (i, chapter) in chapters.iter().enumerate() {
            let end = chapters
                .get(i + 1)
                .map(|c| c.start)
                .unwrap_or_else(|| movie_end.max(chapter.start));
            let title = chapter.title.as_bytes();
            let payload_offset = self.payload.len() as u64;
            self.payload.put_u16(title.len() as u16);
            self.payload.put_slice(title);

            buf.samples.push(BufferedSample {
                payload_offset,
                size: title.len() as u32 + 2,
                dts_ticks: (chapter.start * MOVIE_TIMESCALE as f64).round() as u64,
                explicit_duration: Some(
                    ((end - chapter.start).max(0.0) * MOVIE_TIMESCALE as f64).round() as u64,
                ),
                cts_ticks: 0,
                keyframe: true,
            });
        }
        self.chapters = chapters;
        self.tracks.push(buf);
    }
}

impl TrackBuf {
    fn durations(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.samples.len());
        for (i, sample) in self.samples.iter().enumerate() {
            let d = match self.samples.get(i + 1) {
                Some(next) => next.dts_ticks.saturating_sub(sample.dts_ticks),
                None => sample
                    .explicit_duration
                    .or_else(|| out.last().copied())
                    .unwrap_or(0),
            };
            out.push(d);
        }
        out
    }

    fn media_duration(&self) -> u64 {
        match self.samples.last() {
            Some(last) => last.dts_ticks + self.durations().last().copied().unwrap_or(0),
            None => 0,
        }
    }

    fn duration_seconds(&self) -> f64 {
        self.media_duration() as f64 / self.timescale as f64
    }
}

#[async_trait::async_trait]
impl<T: Target> Muxer for Mp4Muxer<T> {
    fn set_metadata(&mut self, metadata: Metadata) {
        self.metadata = metadata;
    }

    async fn write_header(&mut self, tracks: &[Track]) -> Result<()> {
        if self.header_written {
            return Err(RemuxError::Config("header already written".into()));
        }
        self.validate(tracks)?;

        for track in tracks {
            self.tracks.push(TrackBuf {
                timescale: media_timescale(track),
                track: track.clone(),
                samples: Vec::new(),
                is_chapter_track: false,
            });
        }

        let ftyp = build_ftyp(self.config.brand);
        self.target.write(&ftyp).await?;
        self.header_written = true;
        Ok(())
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        if !self.header_written {
            return Err(RemuxError::Config("write_packet before header".into()));
        }
        let buf = self
            .tracks
            .iter_mut()
            .find(|t| t.track.id == packet.track_id)
            .ok_or_else(|| {
                RemuxError::Config(format!("packet for undeclared track {}", packet.track_id))
            })?;

        let ts = buf.timescale as f64;
        let payload_offset = self.payload.len() as u64;
        self.payload.put_slice(&packet.data);

        buf.samples.push(BufferedSample {
            payload_offset,
            size: packet.data.len() as u32,
            dts_ticks: (packet.time * ts).round() as u64,
            explicit_duration: packet.duration.map(|d| (d * ts).round() as u64),
            cts_ticks: (packet.composition_offset.unwrap_or(0.0) * ts).round() as i64,
            keyframe: packet.is_key,
        });
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        // Progressive output cannot emit anything before the trailer
        Ok(())
    }

    async fn write_trailer(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        if !self.header_written {
            return Err(RemuxError::Config("trailer before header".into()));
        }
        self.append_chapter_track();

        let payload_len = self.payload.len() as u64;
        let mdat_header_len: u64 = if payload_len > u32::MAX as u64 - 8 { 16 } else { 8 };
        // The co64-vs-stco choice must match across both passes, so decide
        // it up front with slack for the moov itself
        let use_co64 =
            self.target.position() + payload_len + (1 << 24) > u32::MAX as u64;

        // Pass 1: provisional moov to learn its size
        let provisional = build_moov(&self.tracks, &self.metadata, &self.chapters, 0, use_co64)?;
        let mdat_payload_start =
            self.target.position() + provisional.len() as u64 + mdat_header_len;

        // Pass 2: real chunk offsets
        let moov = build_moov(
            &self.tracks,
            &self.metadata,
            &self.chapters,
            mdat_payload_start,
            use_co64,
        )?;
        debug_assert_eq!(moov.len(), provisional.len());

        self.target.write(&moov).await?;

        let mut mdat_header = BytesMut::with_capacity(16);
        if mdat_header_len == 16 {
            mdat_header.put_u32(1);
            mdat_header.put_slice(b"mdat");
            mdat_header.put_u64(payload_len + 16);
        } else {
            mdat_header.put_u32(payload_len as u32 + 8);
            mdat_header.put_slice(b"mdat");
        }
        self.target.write(&mdat_header).await?;
        self.target.write(&self.payload).await?;

        self.finalized = true;
        self.target.close().await
    }
}

pub(crate) fn build_ftyp(brand: Mp4Brand) -> Bytes {
    let mut body = BytesMut::new();
    body.put_slice(&brand.major());
    body.put_u32(0x200); // minor version
    for compatible in brand.compatible() {
        body.put_slice(*compatible);
    }
    write_box(b"ftyp", &body)
}

fn build_moov(
    tracks: &[TrackBuf],
    metadata: &Metadata,
    chapters: &[Chapter],
    mdat_start: u64,
    use_co64: bool,
) -> Result<Bytes> {
    let movie_duration = tracks
        .iter()
        .map(|t| (t.duration_seconds() * MOVIE_TIMESCALE as f64).round() as u64)
        .max()
        .unwrap_or(0);

    let mut moov = BytesMut::new();
    moov.put_slice(&build_mvhd(
        movie_duration,
        tracks.iter().map(|t| t.track.id).max().unwrap_or(0) + 1,
    ));

    let chapter_track_id = tracks
        .iter()
        .find(|t| t.is_chapter_track)
        .map(|t| t.track.id);

    for buf in tracks {
        moov.put_slice(&build_trak(
            buf,
            movie_duration,
            mdat_start,
            use_co64,
            chapter_track_id,
        )?);
    }

    let udta = build_udta(metadata, chapters);
    if !udta.is_empty() {
        moov.put_slice(&udta);
    }

    Ok(write_box(b"moov", &moov))
}

/// Builds the `moov` of a fragmented file's init segment: empty sample
/// tables plus `mvex/trex` defaults, durations left zero.
pub(crate) fn build_init_moov(tracks: &[Track]) -> Result<Bytes> {
    let bufs: Vec<TrackBuf> = tracks
        .iter()
        .map(|t| TrackBuf {
            timescale: media_timescale(t),
            track: t.clone(),
            samples: Vec::new(),
            is_chapter_track: false,
        })
        .collect();

    let mut moov = BytesMut::new();
    moov.put_slice(&build_mvhd(
        0,
        tracks.iter().map(|t| t.id).max().unwrap_or(0) + 1,
    ));
    for buf in &bufs {
        moov.put_slice(&build_trak(buf, 0, 0, false, None)?);
    }

    let mut mvex = BytesMut::new();
    for track in tracks {
        let mut trex = BytesMut::new();
        trex.put_u32(track.id);
        trex.put_u32(1); // default_sample_description_index
        trex.put_u32(0); // default_sample_duration
        trex.put_u32(0); // default_sample_size
        trex.put_u32(crate::format::mp4::fragmented::SAMPLE_FLAGS_NON_SYNC);
        mvex.put_slice(&write_full_box(b"trex", 0, 0, &trex));
    }
    moov.put_slice(&write_box(b"mvex", &mvex));

    Ok(write_box(b"moov", &moov))
}

fn put_duration32_or_64(body: &mut BytesMut, version: u8, value: u64) {
    if version == 1 {
        body.put_u64(value);
    } else {
        body.put_u32(value as u32);
    }
}

fn build_mvhd(duration: u64, next_track_id: u32) -> Bytes {
    let version: u8 = if duration > u32::MAX as u64 { 1 } else { 0 };
    let now = super::boxes::mp4_timestamp_now();

    let mut body = BytesMut::new();
    put_duration32_or_64(&mut body, version, now); // creation
    put_duration32_or_64(&mut body, version, now); // modification
    body.put_u32(MOVIE_TIMESCALE);
    put_duration32_or_64(&mut body, version, duration);
    body.put_u32(0x0001_0000); // rate 1.0
    body.put_u16(0x0100); // volume 1.0
    body.put_u16(0); // reserved
    body.put_u64(0); // reserved
    for v in IDENTITY_MATRIX {
        body.put_u32(v);
    }
    body.put_slice(&[0u8; 24]); // pre_defined
    body.put_u32(next_track_id);
    write_full_box(b"mvhd", version, 0, &body)
}

const IDENTITY_MATRIX: [u32; 9] = [
    0x0001_0000,
    0,
    0,
    0,
    0x0001_0000,
    0,
    0,
    0,
    0x4000_0000,
];

fn build_trak(
    buf: &TrackBuf,
    movie_duration: u64,
    mdat_start: u64,
    use_co64: bool,
    chapter_track_id: Option<u32>,
) -> Result<Bytes> {
    let track = &buf.track;

    let mut trak = BytesMut::new();
    trak.put_slice(&build_tkhd(buf, movie_duration));

    // Audio tracks reference the chapter track
    if track.kind == TrackKind::Audio {
        if let Some(chapter_id) = chapter_track_id {
            let mut chap = BytesMut::new();
            chap.put_u32(chapter_id);
            let chap = write_box(b"chap", &chap);
            trak.put_slice(&write_box(b"tref", &chap));
        }
    }

    let mut mdia = BytesMut::new();
    mdia.put_slice(&build_mdhd(buf));
    mdia.put_slice(&build_hdlr_media(track.kind));
    mdia.put_slice(&build_minf(buf, mdat_start, use_co64)?);
    trak.put_slice(&write_box(b"mdia", &mdia));

    Ok(write_box(b"trak", &trak))
}

fn build_tkhd(buf: &TrackBuf, movie_duration: u64) -> Bytes {
    let track = &buf.track;
    let version: u8 = if movie_duration > u32::MAX as u64 { 1 } else { 0 };
    let now = super::boxes::mp4_timestamp_now();

    let mut body = BytesMut::new();
    put_duration32_or_64(&mut body, version, now);
    put_duration32_or_64(&mut body, version, now);
    body.put_u32(track.id);
    body.put_u32(0); // reserved
    put_duration32_or_64(&mut body, version, movie_duration);
    body.put_u64(0); // reserved
    body.put_u16(0); // layer
    body.put_u16(0); // alternate group
    body.put_u16(if track.kind == TrackKind::Audio { 0x0100 } else { 0 });
    body.put_u16(0); // reserved
    for v in IDENTITY_MATRIX {
        body.put_u32(v);
    }
    let (width, height) = track
        .video
        .as_ref()
        .map(|v| (v.width as f64, v.height as f64))
        .unwrap_or((0.0, 0.0));
    body.put_u32(to_fixed_16_16(width));
    body.put_u32(to_fixed_16_16(height));

    // flags: enabled | in movie
    write_full_box(b"tkhd", version, 0x000003, &body)
}

fn build_mdhd(buf: &TrackBuf) -> Bytes {
    let duration = buf.media_duration();
    let version: u8 = if duration > u32::MAX as u64 { 1 } else { 0 };
    let now = super::boxes::mp4_timestamp_now();

    let mut body = BytesMut::new();
    put_duration32_or_64(&mut body, version, now);
    put_duration32_or_64(&mut body, version, now);
    body.put_u32(buf.timescale);
    put_duration32_or_64(&mut body, version, duration);
    body.put_u16(pack_language(buf.track.language.as_deref()));
    body.put_u16(0); // pre_defined
    write_full_box(b"mdhd", version, 0, &body)
}

fn build_hdlr_media(kind: TrackKind) -> Bytes {
    let (handler, name): (&[u8; 4], &[u8]) = match kind {
        TrackKind::Video => (b"vide", b"VideoHandler\0"),
        TrackKind::Audio => (b"soun", b"SoundHandler\0"),
        TrackKind::Subtitle => (b"text", b"TextHandler\0"),
    };
    let mut body = BytesMut::new();
    body.put_u32(0); // pre_defined
    body.put_slice(handler);
    body.put_slice(&[0u8; 12]); // reserved
    body.put_slice(name);
    write_full_box(b"hdlr", 0, 0, &body)
}

fn build_minf(buf: &TrackBuf, mdat_start: u64, use_co64: bool) -> Result<Bytes> {
    let mut minf = BytesMut::new();

    match buf.track.kind {
        TrackKind::Video => {
            let mut vmhd = BytesMut::new();
            vmhd.put_u16(0); // graphics mode
            vmhd.put_slice(&[0u8; 6]); // opcolor
            minf.put_slice(&write_full_box(b"vmhd", 0, 1, &vmhd));
        }
        TrackKind::Audio => {
            let mut smhd = BytesMut::new();
            smhd.put_u16(0); // balance
            smhd.put_u16(0);
            minf.put_slice(&write_full_box(b"smhd", 0, 0, &smhd));
        }
        TrackKind::Subtitle => {
            minf.put_slice(&write_full_box(b"nmhd", 0, 0, &[]));
        }
    }

    // dinf/dref: single self-contained data reference
    let url = write_full_box(b"url ", 0, 1, &[]);
    let mut dref = BytesMut::new();
    dref.put_u32(1);
    dref.put_slice(&url);
    let dref = write_full_box(b"dref", 0, 0, &dref);
    minf.put_slice(&write_box(b"dinf", &dref));

    minf.put_slice(&build_stbl(buf, mdat_start, use_co64)?);

    Ok(write_box(b"minf", &minf))
}

fn build_stbl(buf: &TrackBuf, mdat_start: u64, use_co64: bool) -> Result<Bytes> {
    let mut stbl = BytesMut::new();
    stbl.put_slice(&build_stsd(&buf.track)?);

    let durations = buf.durations();

    // stts: run-length encoded durations
    let mut runs: Vec<(u32, u64)> = Vec::new();
    for &d in &durations {
        match runs.last_mut() {
            Some((count, delta)) if *delta == d => *count += 1,
            _ => runs.push((1, d)),
        }
    }
    let mut stts = BytesMut::new();
    stts.put_u32(runs.len() as u32);
    for (count, delta) in &runs {
        stts.put_u32(*count);
        stts.put_u32(*delta as u32);
    }
    stbl.put_slice(&write_full_box(b"stts", 0, 0, &stts));

    // ctts only when composition offsets exist
    if buf.samples.iter().any(|s| s.cts_ticks != 0) {
        let negative = buf.samples.iter().any(|s| s.cts_ticks < 0);
        let mut runs: Vec<(u32, i64)> = Vec::new();
        for sample in &buf.samples {
            match runs.last_mut() {
                Some((count, offset)) if *offset == sample.cts_ticks => *count += 1,
                _ => runs.push((1, sample.cts_ticks)),
            }
        }
        let mut ctts = BytesMut::new();
        ctts.put_u32(runs.len() as u32);
        for (count, offset) in &runs {
            ctts.put_u32(*count);
            ctts.put_u32(*offset as i32 as u32);
        }
        stbl.put_slice(&write_full_box(b"ctts", u8::from(negative), 0, &ctts));
    }

    // One sample per chunk
    let mut stsc = BytesMut::new();
    stsc.put_u32(1);
    stsc.put_u32(1); // first_chunk
    stsc.put_u32(1); // samples_per_chunk
    stsc.put_u32(1); // sample_description_index
    stbl.put_slice(&write_full_box(b"stsc", 0, 0, &stsc));

    // stsz: uniform when possible
    let uniform = buf
        .samples
        .first()
        .filter(|first| buf.samples.iter().all(|s| s.size == first.size))
        .map(|s| s.size);
    let mut stsz = BytesMut::new();
    stsz.put_u32(uniform.unwrap_or(0));
    stsz.put_u32(buf.samples.len() as u32);
    if uniform.is_none() {
        for sample in &buf.samples {
            stsz.put_u32(sample.size);
        }
    }
    stbl.put_slice(&write_full_box(b"stsz", 0, 0, &stsz));

    // Chunk offsets: running positions inside mdat
    if use_co64 {
        let mut co64 = BytesMut::new();
        co64.put_u32(buf.samples.len() as u32);
        for sample in &buf.samples {
            co64.put_u64(mdat_start + sample.payload_offset);
        }
        stbl.put_slice(&write_full_box(b"co64", 0, 0, &co64));
    } else {
        let mut stco = BytesMut::new();
        stco.put_u32(buf.samples.len() as u32);
        for sample in &buf.samples {
            stco.put_u32((mdat_start + sample.payload_offset) as u32);
        }
        stbl.put_slice(&write_full_box(b"stco", 0, 0, &stco));
    }

    // stss omitted when everything is a sync sample
    if buf.samples.iter().any(|s| !s.keyframe) {
        let keyframes: Vec<u32> = buf
            .samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.keyframe)
            .map(|(i, _)| i as u32 + 1)
            .collect();
        let mut stss = BytesMut::new();
        stss.put_u32(keyframes.len() as u32);
        for k in keyframes {
            stss.put_u32(k);
        }
        stbl.put_slice(&write_full_box(b"stss", 0, 0, &stss));
    }

    Ok(write_box(b"stbl", &stbl))
}

pub(crate) fn build_stsd(track: &Track) -> Result<Bytes> {
    let entry = match track.kind {
        TrackKind::Video => build_visual_entry(track)?,
        TrackKind::Audio => build_audio_entry(track)?,
        TrackKind::Subtitle => build_text_entry(track),
    };
    let mut stsd = BytesMut::new();
    stsd.put_u32(1);
    stsd.put_slice(&entry);
    Ok(write_full_box(b"stsd", 0, 0, &stsd))
}

fn sample_entry_fourcc(track: &Track) -> Result<[u8; 4]> {
    Ok(match track.codec {
        CodecId::H264 => *b"avc1",
        CodecId::H265 => *b"hvc1",
        CodecId::Av1 => *b"av01",
        CodecId::Vp9 => *b"vp09",
        CodecId::Aac => *b"mp4a",
        CodecId::Opus => *b"Opus",
        CodecId::Flac => *b"fLaC",
        CodecId::Mp3 => *b".mp3",
        CodecId::Ac3 => *b"ac-3",
        CodecId::PcmS16Le => *b"sowt",
        CodecId::PcmS16Be => *b"twos",
        CodecId::Text => *b"text",
        CodecId::WebVtt => *b"wvtt",
        other => {
            return Err(RemuxError::Config(format!(
                "codec {:?} cannot be stored in MP4",
                other
            )))
        }
    })
}

fn build_visual_entry(track: &Track) -> Result<Bytes> {
    let video = track
        .video
        .as_ref()
        .ok_or_else(|| RemuxError::Config("video track without parameters".into()))?;

    let mut entry = BytesMut::new();
    entry.put_slice(&[0u8; 6]); // reserved
    entry.put_u16(1); // data_reference_index
    entry.put_slice(&[0u8; 16]); // pre_defined + reserved
    entry.put_u16(video.width as u16);
    entry.put_u16(video.height as u16);
    entry.put_u32(0x0048_0000); // 72 dpi horizontal
    entry.put_u32(0x0048_0000); // 72 dpi vertical
    entry.put_u32(0); // reserved
    entry.put_u16(1); // frame count
    entry.put_slice(&[0u8; 32]); // compressor name
    entry.put_u16(0x0018); // depth
    entry.put_i16(-1); // pre_defined

    if let Some(private) = &track.codec_private {
        let config_type: &[u8; 4] = match track.codec {
            CodecId::H264 => b"avcC",
            CodecId::H265 => b"hvcC",
            CodecId::Av1 => b"av1C",
            CodecId::Vp9 => b"vpcC",
            _ => b"glbl",
        };
        entry.put_slice(&write_box(config_type, private));
    }

    Ok(write_box(&sample_entry_fourcc(track)?, &entry))
}

fn build_audio_entry(track: &Track) -> Result<Bytes> {
    let audio = track
        .audio
        .as_ref()
        .ok_or_else(|| RemuxError::Config("audio track without parameters".into()))?;

    let mut entry = BytesMut::new();
    entry.put_slice(&[0u8; 6]); // reserved
    entry.put_u16(1); // data_reference_index
    entry.put_slice(&[0u8; 8]); // reserved
    entry.put_u16(audio.channels as u16);
    entry.put_u16(audio.bits_per_sample.unwrap_or(16) as u16);
    entry.put_u16(0); // pre_defined
    entry.put_u16(0); // reserved
    entry.put_u32(audio.sample_rate << 16); // 16.16

    if track.codec == CodecId::Aac {
        let esds = match &track.codec_private {
            // Codec private data is either a ready esds body or a raw
            // AudioSpecificConfig, depending on the source container
            Some(private) if aac::parse_esds(private).is_ok() => {
                write_box(b"esds", private)
            }
            Some(private) => write_box(b"esds", &aac::build_esds_with_asc(private)?),
            None => {
                let config = aac::AacConfig {
                    sample_rate_index: aac::sample_rate_index(audio.sample_rate).unwrap_or(15),
                    sample_rate: audio.sample_rate,
                    channel_configuration: audio.channels.min(7) as u8,
                    channels: audio.channels,
                    ..Default::default()
                };
                write_box(b"esds", &aac::build_esds(&config)?)
            }
        };
        entry.put_slice(&esds);
    } else if let Some(private) = &track.codec_private {
        let config_type: &[u8; 4] = match track.codec {
            CodecId::Opus => b"dOps",
            CodecId::Flac => b"dfLa",
            _ => b"glbl",
        };
        entry.put_slice(&write_box(config_type, private));
    }

    Ok(write_box(&sample_entry_fourcc(track)?, &entry))
}

fn build_text_entry(track: &Track) -> Bytes {
    let mut entry = BytesMut::new();
    entry.put_slice(&[0u8; 6]); // reserved
    entry.put_u16(1); // data_reference_index
    entry.put_u32(1); // display flags
    entry.put_u32(0); // text justification
    entry.put_slice(&[0u8; 6]); // background color
    entry.put_u64(0); // default text box
    entry.put_slice(&[0u8; 8]); // reserved + font
    entry.put_slice(&[0u8; 6]); // foreground color
    let fourcc = sample_entry_fourcc(track).unwrap_or(*b"text");
    write_box(&fourcc, &entry)
}

fn build_udta(metadata: &Metadata, chapters: &[Chapter]) -> Bytes {
    let mut udta = BytesMut::new();

    if !chapters.is_empty() {
        udta.put_slice(&build_chpl(chapters));
    }

    if !metadata.is_empty() {
        udta.put_slice(&build_meta(metadata));
    }

    if udta.is_empty() {
        Bytes::new()
    } else {
        write_box(b"udta", &udta)
    }
}

/// Nero chapter list: {u64 start in 100 ns units, u8 title length, title}
fn build_chpl(chapters: &[Chapter]) -> Bytes {
    let mut body = BytesMut::new();
    body.put_u8(chapters.len().min(255) as u8);
    for chapter in chapters.iter().take(255) {
        body.put_u64((chapter.start * 1e7).round() as u64);
        let bytes = chapter.title.as_bytes();
        let len = bytes.len().min(255);
        body.put_u8(len as u8);
        body.put_slice(&bytes[..len]);
    }
    write_full_box(b"chpl", 1, 0, &body)
}

fn build_meta(metadata: &Metadata) -> Bytes {
    // hdlr for the metadata handler
    let mut hdlr = BytesMut::new();
    hdlr.put_u32(0);
    hdlr.put_slice(b"mdir");
    hdlr.put_slice(b"appl");
    hdlr.put_slice(&[0u8; 9]);
    let hdlr = write_full_box(b"hdlr", 0, 0, &hdlr);

    let mut ilst = BytesMut::new();
    let mut put_text = |atom: &[u8; 4], value: &Option<String>| {
        if let Some(text) = value {
            ilst.put_slice(&build_ilst_item(atom, 1, text.as_bytes()));
        }
    };
    put_text(b"\xa9nam", &metadata.title);
    put_text(b"\xa9ART", &metadata.artist);
    put_text(b"aART", &metadata.album_artist);
    put_text(b"\xa9alb", &metadata.album);
    put_text(b"\xa9gen", &metadata.genre);
    put_text(b"\xa9day", &metadata.date);
    put_text(b"\xa9wrt", &metadata.composer);
    put_text(b"cprt", &metadata.copyright);
    put_text(b"\xa9cmt", &metadata.comment);
    put_text(b"\xa9too", &metadata.encoder);
    put_text(b"desc", &metadata.description);
    for (atom, value) in &metadata.extra {
        ilst.put_slice(&build_ilst_item(atom, 1, value.as_bytes()));
    }
    if let Some((art, format)) = &metadata.cover_art {
        let type_code = match format {
            CoverArtFormat::Jpeg => 13,
            CoverArtFormat::Png => 14,
        };
        ilst.put_slice(&build_ilst_item(b"covr", type_code, art));
    }
    let ilst = write_box(b"ilst", &ilst);

    let mut meta = BytesMut::new();
    meta.put_slice(&hdlr);
    meta.put_slice(&ilst);
    write_full_box(b"meta", 0, 0, &meta)
}

fn build_ilst_item(atom: &[u8; 4], type_code: u32, payload: &[u8]) -> Bytes {
    let mut data = BytesMut::new();
    data.put_u32(type_code);
    data.put_u32(0); // locale
    data.put_slice(payload);
    let data = write_box(b"data", &data);
    write_box(atom, &data)
}
