use super::boxes::{write_box, write_full_box};
use super::muxer::{build_ftyp, build_init_moov, media_timescale, Mp4Brand};
use crate::av::{Packet, Track};
use crate::format::Muxer;
use crate::io::Target;
use crate::{RemuxError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// trun/tfhd sample flags for a non-sync sample
pub(crate) const SAMPLE_FLAGS_NON_SYNC: u32 = 0x0101_0000;
/// Sample flags for a sync sample
const SAMPLE_FLAGS_SYNC: u32 = 0;

const TFHD_DEFAULT_SAMPLE_DURATION: u32 = 0x000008;
const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x020000;

const TRUN_DATA_OFFSET: u32 = 0x000001;
const TRUN_SAMPLE_DURATION: u32 = 0x000100;
const TRUN_SAMPLE_SIZE: u32 = 0x000200;
const TRUN_SAMPLE_FLAGS: u32 = 0x000400;
const TRUN_SAMPLE_CTS: u32 = 0x000800;

/// Configuration for the fragmented MP4 muxer.
#[derive(Debug, Clone)]
pub struct FragmentedMp4Config {
    /// Brand written into `ftyp`
    pub brand: Mp4Brand,
    /// Target fragment duration in seconds
    pub fragment_duration: f64,
    /// Clamp fragments to half a second for low-latency streaming
    pub low_latency: bool,
    /// Emit an `mfra/mfro` trailer at finalize
    pub write_mfra: bool,
}

impl Default for FragmentedMp4Config {
    fn default() -> Self {
        Self {
            brand: Mp4Brand::Isom,
            fragment_duration: 2.0,
            low_latency: false,
            write_mfra: true,
        }
    }
}

impl FragmentedMp4Config {
    fn effective_fragment_duration(&self) -> f64 {
        if self.low_latency {
            self.fragment_duration.min(0.5)
        } else {
            self.fragment_duration
        }
    }
}

#[derive(Debug)]
struct PendingSample {
    data: Bytes,
    dts_ticks: u64,
    explicit_duration: Option<u64>,
    cts_ticks: i64,
    keyframe: bool,
}

#[derive(Debug)]
struct FragTrack {
    track: Track,
    timescale: u32,
    pending: Vec<PendingSample>,
    /// Sum of sample durations emitted in previous fragments, in media
    /// ticks; becomes the next fragment's tfdt base
    decode_time: u64,
}

impl FragTrack {
    fn durations(&self) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.pending.len());
        for (i, sample) in self.pending.iter().enumerate() {
            let d = match self.pending.get(i + 1) {
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
}

/// Fragmented MP4 (fMP4/CMAF-style) muxer.
///
/// The header is a streamable init segment (`ftyp` + `moov` with
/// `mvex/trex`); samples then accumulate per track and are cut into
/// `moof`/`mdat` pairs whenever the elapsed duration crosses the
/// configured fragment length, on [`Muxer::flush`], and at finalize.
pub struct FragmentedMp4Muxer<T: Target> {
    target: T,
    config: FragmentedMp4Config,
    tracks: Vec<FragTrack>,
    sequence_number: u32,
    fragment_start: Option<f64>,
    header_written: bool,
    finalized: bool,
}

impl<T: Target> FragmentedMp4Muxer<T> {
    /// Creates a muxer writing to `target`
    pub fn new(target: T, config: FragmentedMp4Config) -> Self {
        Self {
            target,
            config,
            tracks: Vec::new(),
            sequence_number: 1,
            fragment_start: None,
            header_written: false,
            finalized: false,
        }
    }

    /// Consumes the muxer, returning its target
    pub fn into_target(self) -> T {
        self.target
    }

    async fn emit_fragment(&mut self) -> Result<()> {
        if self.tracks.iter().all(|t| t.pending.is_empty()) {
            return Ok(());
        }

        // First pass with provisional offsets sizes the moof; the data
        // offsets are then recomputed against the real mdat position
        let provisional = self.build_moof(0)?;
        let moof = self.build_moof(provisional.len() as u64 + 8)?;
        debug_assert_eq!(moof.len(), provisional.len());

        let mut mdat = BytesMut::new();
        for track in &self.tracks {
            for sample in &track.pending {
                mdat.put_slice(&sample.data);
            }
        }

        self.target.write(&moof).await?;
        self.target.write(&write_box(b"mdat", &mdat)).await?;

        for track in &mut self.tracks {
            let emitted: u64 = track.durations().iter().sum();
            track.decode_time += emitted;
            track.pending.clear();
        }
        self.sequence_number += 1;
        self.fragment_start = None;
        Ok(())
    }

    fn build_moof(&self, data_base: u64) -> Result<Bytes> {
        let mut moof = BytesMut::new();

        let mut mfhd = BytesMut::new();
        mfhd.put_u32(self.sequence_number);
        moof.put_slice(&write_full_box(b"mfhd", 0, 0, &mfhd));

        // Data bytes of earlier tracks precede this track's run in mdat
        let mut run_offset = data_base;
        for track in self.tracks.iter().filter(|t| !t.pending.is_empty()) {
            moof.put_slice(&build_traf(track, run_offset));
            run_offset += track
                .pending
                .iter()
                .map(|s| s.data.len() as u64)
                .sum::<u64>();
        }

        Ok(write_box(b"moof", &moof))
    }
}

fn build_traf(track: &FragTrack, data_offset: u64) -> Bytes {
    let durations = track.durations();
    let uniform_duration = durations
        .first()
        .filter(|first| durations.iter().all(|d| d == *first))
        .copied();

    // tfhd: default-base-is-moof, plus the default duration when uniform
    let mut tfhd_flags = TFHD_DEFAULT_BASE_IS_MOOF;
    let mut tfhd = BytesMut::new();
    tfhd.put_u32(track.track.id);
    if let Some(d) = uniform_duration {
        tfhd_flags |= TFHD_DEFAULT_SAMPLE_DURATION;
        tfhd.put_u32(d as u32);
    }
    let tfhd = write_full_box(b"tfhd", 0, tfhd_flags, &tfhd);

    // tfdt version 1: 64-bit base media decode time
    let mut tfdt = BytesMut::new();
    tfdt.put_u64(track.decode_time);
    let tfdt = write_full_box(b"tfdt", 1, 0, &tfdt);

    // trun field selection from the batch
    let mut trun_flags = TRUN_DATA_OFFSET | TRUN_SAMPLE_SIZE;
    if uniform_duration.is_none() {
        trun_flags |= TRUN_SAMPLE_DURATION;
    }
    if track.pending.iter().any(|s| !s.keyframe) {
        trun_flags |= TRUN_SAMPLE_FLAGS;
    }
    if track.pending.iter().any(|s| s.cts_ticks != 0) {
        trun_flags |= TRUN_SAMPLE_CTS;
    }

    let mut trun = BytesMut::new();
    trun.put_u32(track.pending.len() as u32);
    trun.put_i32(data_offset as i32);
    for (i, sample) in track.pending.iter().enumerate() {
        if trun_flags & TRUN_SAMPLE_DURATION != 0 {
            trun.put_u32(durations[i] as u32);
        }
        trun.put_u32(sample.data.len() as u32);
        if trun_flags & TRUN_SAMPLE_FLAGS != 0 {
            trun.put_u32(if sample.keyframe {
                SAMPLE_FLAGS_SYNC
            } else {
                SAMPLE_FLAGS_NON_SYNC
            });
        }
        if trun_flags & TRUN_SAMPLE_CTS != 0 {
            trun.put_u32(sample.cts_ticks as i32 as u32);
        }
    }
    let version = u8::from(track.pending.iter().any(|s| s.cts_ticks < 0));
    let trun = write_full_box(b"trun", version, trun_flags, &trun);

    let mut traf = BytesMut::new();
    traf.put_slice(&tfhd);
    traf.put_slice(&tfdt);
    traf.put_slice(&trun);
    write_box(b"traf", &traf)
}

#[async_trait::async_trait]
impl<T: Target> Muxer for FragmentedMp4Muxer<T> {
    async fn write_header(&mut self, tracks: &[Track]) -> Result<()> {
        if self.header_written {
            return Err(RemuxError::Config("header already written".into()));
        }
        for track in tracks {
            self.tracks.push(FragTrack {
                timescale: media_timescale(track),
                track: track.clone(),
                pending: Vec::new(),
                decode_time: 0,
            });
        }

        self.target.write(&build_ftyp(self.config.brand)).await?;
        let moov = build_init_moov(tracks)?;
        self.target.write(&moov).await?;
        self.header_written = true;
        Ok(())
    }

    async fn write_packet(&mut self, packet: &Packet) -> Result<()> {
        if !self.header_written {
            return Err(RemuxError::Config("write_packet before header".into()));
        }

        // Cut the pending fragment once the configured duration elapsed
        if let Some(start) = self.fragment_start {
            if packet.time - start >= self.config.effective_fragment_duration() {
                self.emit_fragment().await?;
            }
        }
        if self.fragment_start.is_none() {
            self.fragment_start = Some(packet.time);
        }

        let track = self
            .tracks
            .iter_mut()
            .find(|t| t.track.id == packet.track_id)
            .ok_or_else(|| {
                RemuxError::Config(format!("packet for undeclared track {}", packet.track_id))
            })?;
        let ts = track.timescale as f64;
        track.pending.push(PendingSample {
            data: packet.data.clone(),
            dts_ticks: (packet.time * ts).round() as u64,
            explicit_duration: packet.duration.map(|d| (d * ts).round() as u64),
            cts_ticks: (packet.composition_offset.unwrap_or(0.0) * ts).round() as i64,
            keyframe: packet.is_key,
        });
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.emit_fragment().await
    }

    async fn write_trailer(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.emit_fragment().await?;

        if self.config.write_mfra {
            // mfra holding a single mfro whose body is the mfra total size
            let mut mfro = BytesMut::new();
            mfro.put_u32(24);
            let mfro = write_full_box(b"mfro", 0, 0, &mfro);
            self.target.write(&write_box(b"mfra", &mfro)).await?;
        }

        self.finalized = true;
        self.target.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::av::{CodecId, VideoParams};
    use crate::format::mp4::boxes::{children, find_child};
    use crate::format::mp4::Mp4Demuxer;
    use crate::format::Demuxer;
    use crate::io::{BufSource, BufTarget};

    fn video_track() -> Track {
        Track::video(
            1,
            0,
            CodecId::H264,
            VideoParams {
                width: 16,
                height: 16,
                frame_rate: Some(2.0),
                ..Default::default()
            },
        )
    }

    async fn mux_four_packets() -> Bytes {
        let config = FragmentedMp4Config {
            fragment_duration: 1.0,
            write_mfra: false,
            ..Default::default()
        };
        let mut muxer = FragmentedMp4Muxer::new(BufTarget::new(), config);
        muxer.write_header(&[video_track()]).await.unwrap();
        for i in 0..4 {
            let packet = Packet::new(vec![i as u8; 16])
                .with_track_id(1)
                .with_time(i as f64 * 0.5)
                .with_duration(0.5)
                .with_key_flag(i % 2 == 0);
            muxer.write_packet(&packet).await.unwrap();
        }
        muxer.write_trailer().await.unwrap();
        muxer.into_target().finalize()
    }

    #[tokio::test]
    async fn test_two_fragments_of_two_samples() {
        let file = mux_four_packets().await;
        let types: Vec<[u8; 4]> = children(&file).map(|(t, _)| t).collect();
        // Header then two moof/mdat pairs
        assert_eq!(
            types,
            vec![*b"ftyp", *b"moov", *b"moof", *b"mdat", *b"moof", *b"mdat"]
        );

        let moofs: Vec<&[u8]> = children(&file)
            .filter(|(t, _)| t == b"moof")
            .map(|(_, body)| body)
            .collect();

        // Sequence numbers start at 1 and increment
        for (i, moof) in moofs.iter().enumerate() {
            let mfhd = find_child(moof, b"mfhd").unwrap();
            let seq = u32::from_be_bytes([mfhd[4], mfhd[5], mfhd[6], mfhd[7]]);
            assert_eq!(seq, i as u32 + 1);
        }

        // tfdt of the second fragment equals one second in media ticks
        // (timescale 2000 = fps 2.0 * 1000)
        let traf = find_child(moofs[1], b"traf").unwrap();
        let tfdt = find_child(traf, b"tfdt").unwrap();
        assert_eq!(tfdt[0], 1, "tfdt must be version 1");
        let base = u64::from_be_bytes([
            tfdt[4], tfdt[5], tfdt[6], tfdt[7], tfdt[8], tfdt[9], tfdt[10], tfdt[11],
        ]);
        assert_eq!(base, 2000);
    }

    #[tokio::test]
    async fn test_fragmented_round_trip() {
        let file = mux_four_packets().await;
        let mut demuxer = Mp4Demuxer::open(Box::new(BufSource::new(file))).await.unwrap();
        assert!(demuxer.is_fragmented());

        let tracks = demuxer.tracks().await.unwrap();
        assert_eq!(tracks.len(), 1);

        let mut packets = Vec::new();
        while let Some(p) = demuxer.read_packet().await.unwrap() {
            packets.push(p);
        }
        assert_eq!(packets.len(), 4);
        for (i, p) in packets.iter().enumerate() {
            assert!((p.time - i as f64 * 0.5).abs() < 1e-6);
            assert_eq!(p.data.len(), 16);
            assert_eq!(p.is_key, i % 2 == 0);
        }
    }

    #[tokio::test]
    async fn test_flush_cuts_partial_fragment() {
        let config = FragmentedMp4Config {
            fragment_duration: 10.0,
            write_mfra: false,
            ..Default::default()
        };
        let mut muxer = FragmentedMp4Muxer::new(BufTarget::new(), config);
        muxer.write_header(&[video_track()]).await.unwrap();
        let packet = Packet::new(vec![1u8; 8])
            .with_track_id(1)
            .with_time(0.0)
            .with_duration(0.5)
            .with_key_flag(true);
        muxer.write_packet(&packet).await.unwrap();
        muxer.flush().await.unwrap();

        let file = muxer.into_target();
        let types: Vec<[u8; 4]> = children(file.as_slice()).map(|(t, _)| t).collect();
        assert!(types.contains(&*b"moof"));
    }

    #[tokio::test]
    async fn test_mfra_trailer() {
        let config = FragmentedMp4Config {
            write_mfra: true,
            ..Default::default()
        };
        let mut muxer = FragmentedMp4Muxer::new(BufTarget::new(), config);
        muxer.write_header(&[video_track()]).await.unwrap();
        muxer.write_trailer().await.unwrap();
        let file = muxer.into_target().finalize();
        let (last_type, mfra_body) = children(&file).last().unwrap();
        assert_eq!(last_type, *b"mfra");
        let mfro = find_child(mfra_body, b"mfro").unwrap();
        let size = u32::from_be_bytes([mfro[4], mfro[5], mfro[6], mfro[7]]);
        assert_eq!(size, 24);
    }

    #[tokio::test]
    async fn test_low_latency_clamps_duration() {
        let config = FragmentedMp4Config {
            fragment_duration: 2.0,
            low_latency: true,
            ..Default::default()
        };
        assert_eq!(config.effective_fragment_duration(), 0.5);
    }
}
