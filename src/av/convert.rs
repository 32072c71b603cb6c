use crate::av::{CodecId, Track, TrackKind};
use crate::format::{Demuxer, Muxer};
use crate::{RemuxError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Options for a codec-copy conversion.
///
/// The codec/bitrate/geometry fields are *requests*: this library never
/// re-encodes, so a request that differs from what the source carries is
/// reported as unsupported instead of silently ignored.
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Required output video codec
    pub video_codec: Option<CodecId>,
    /// Required output audio codec
    pub audio_codec: Option<CodecId>,
    /// Requested video bitrate (re-encode only, therefore rejected)
    pub video_bitrate: Option<u32>,
    /// Requested audio bitrate (re-encode only, therefore rejected)
    pub audio_bitrate: Option<u32>,
    /// Requested output width
    pub width: Option<u32>,
    /// Requested output height
    pub height: Option<u32>,
    /// Requested output frame rate
    pub frame_rate: Option<f64>,
    /// Requested output sample rate
    pub sample_rate: Option<u32>,
    /// Requested output channel count
    pub channels: Option<u32>,
    /// Produce fast-start output (progressive MP4)
    pub fast_start: bool,
    /// Produce fragmented output (fMP4)
    pub fragmented: bool,
    /// Copy container metadata to the output
    pub preserve_metadata: bool,
    /// Drop packets before this time (seconds); output is rebased to zero
    pub start_time: Option<f64>,
    /// Drop packets at or after this time (seconds)
    pub end_time: Option<f64>,
    /// Select the n-th video track instead of all of them
    pub video_track_index: Option<usize>,
    /// Select the n-th audio track instead of all of them
    pub audio_track_index: Option<usize>,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            video_codec: None,
            audio_codec: None,
            video_bitrate: None,
            audio_bitrate: None,
            width: None,
            height: None,
            frame_rate: None,
            sample_rate: None,
            channels: None,
            fast_start: true,
            fragmented: false,
            preserve_metadata: true,
            start_time: None,
            end_time: None,
            video_track_index: None,
            audio_track_index: None,
        }
    }
}

/// A shared cancellation flag checked before every packet dispatch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates an unset token
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; the running conversion aborts before its
    /// next packet dispatch
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Drives packets from a demuxer into a muxer without touching the
/// compressed payloads.
pub struct Converter {
    options: ConvertOptions,
    cancel: CancelToken,
}

impl Converter {
    /// Creates a converter with the given options
    pub fn new(options: ConvertOptions) -> Self {
        Self {
            options,
            cancel: CancelToken::new(),
        }
    }

    /// A token that cancels this conversion from another task
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Selects output tracks and verifies every option is satisfiable
    /// without re-encoding.
    fn select_tracks(&self, tracks: &[Track]) -> Result<Vec<Track>> {
        if self.options.video_bitrate.is_some() || self.options.audio_bitrate.is_some() {
            return Err(RemuxError::Unsupported(
                "bitrate change requires re-encoding".into(),
            ));
        }

        let mut selected = Vec::new();
        let mut video_seen = 0usize;
        let mut audio_seen = 0usize;
        for track in tracks {
            let keep = match track.kind {
                TrackKind::Video => {
                    let keep = self
                        .options
                        .video_track_index
                        .map(|want| want == video_seen)
                        .unwrap_or(true);
                    video_seen += 1;
                    keep
                }
                TrackKind::Audio => {
                    let keep = self
                        .options
                        .audio_track_index
                        .map(|want| want == audio_seen)
                        .unwrap_or(true);
                    audio_seen += 1;
                    keep
                }
                TrackKind::Subtitle => true,
            };
            if keep {
                selected.push(track.clone());
            }
        }

        for track in &selected {
            match track.kind {
                TrackKind::Video => {
                    if let Some(want) = self.options.video_codec {
                        if want != track.codec {
                            return Err(RemuxError::Unsupported(format!(
                                "converting {:?} to {:?} requires re-encoding",
                                track.codec, want
                            )));
                        }
                    }
                    let video = track.video.as_ref();
                    let src_w = video.map(|v| v.width);
                    let src_h = video.map(|v| v.height);
                    if self.options.width.is_some() && self.options.width != src_w
                        || self.options.height.is_some() && self.options.height != src_h
                    {
                        return Err(RemuxError::Unsupported(
                            "scaling requires re-encoding".into(),
                        ));
                    }
                    if let (Some(want), Some(params)) = (self.options.frame_rate, video) {
                        if params.frame_rate.map(|f| (f - want).abs() > 1e-6).unwrap_or(true) {
                            return Err(RemuxError::Unsupported(
                                "frame-rate change requires re-encoding".into(),
                            ));
                        }
                    }
                }
                TrackKind::Audio => {
                    if let Some(want) = self.options.audio_codec {
                        if want != track.codec {
                            return Err(RemuxError::Unsupported(format!(
                                "converting {:?} to {:?} requires re-encoding",
                                track.codec, want
                            )));
                        }
                    }
                    let audio = track.audio.as_ref();
                    if self.options.sample_rate.is_some()
                        && self.options.sample_rate != audio.map(|a| a.sample_rate)
                    {
                        return Err(RemuxError::Unsupported(
                            "resampling requires re-encoding".into(),
                        ));
                    }
                    if self.options.channels.is_some()
                        && self.options.channels != audio.map(|a| a.channels)
                    {
                        return Err(RemuxError::Unsupported(
                            "channel mixing requires re-encoding".into(),
                        ));
                    }
                }
                TrackKind::Subtitle => {}
            }
        }

        if selected.is_empty() {
            return Err(RemuxError::Config("no tracks selected".into()));
        }
        Ok(selected)
    }

    /// Runs the conversion to completion (or cancellation).
    pub async fn run(
        &mut self,
        demuxer: &mut (dyn Demuxer + '_),
        muxer: &mut (dyn Muxer + '_),
    ) -> Result<()> {
        let tracks = demuxer.tracks().await?;
        let selected = self.select_tracks(&tracks)?;

        if self.options.preserve_metadata {
            let metadata = demuxer.metadata().await?;
            if !metadata.is_empty() {
                muxer.set_metadata(metadata);
            }
        }

        // Renumber track indices for the output while keeping ids stable
        let output_tracks: Vec<Track> = selected
            .iter()
            .enumerate()
            .map(|(index, t)| {
                let mut t = t.clone();
                t.index = index;
                t
            })
            .collect();
        muxer.write_header(&output_tracks).await?;

        let start = self.options.start_time.unwrap_or(0.0);
        if start > 0.0 {
            demuxer.seek(start).await?;
        }
        let selected_ids: Vec<u32> = selected.iter().map(|t| t.id).collect();

        loop {
            if self.cancel.is_cancelled() {
                return Err(RemuxError::Cancelled);
            }
            let packet = match demuxer.read_packet().await? {
                Some(p) => p,
                None => break,
            };
            if !selected_ids.contains(&packet.track_id) {
                continue;
            }
            if let Some(end) = self.options.end_time {
                if packet.time >= end {
                    // Per-track DTS order makes everything after this
                    // packet out of range too
                    break;
                }
            }
            if packet.time < start {
                continue;
            }

            let mut packet = packet;
            if start > 0.0 {
                packet.time -= start;
                if let Some(pts) = packet.pts {
                    packet.pts = Some(pts - start);
                }
            }
            muxer.write_packet(&packet).await?;
        }

        muxer.write_trailer().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::av::{Packet, VideoParams};
    use crate::format::mp4::{Mp4Demuxer, Mp4Muxer, Mp4MuxerConfig};
    use crate::io::{BufSource, BufTarget};

    async fn build_input() -> bytes::Bytes {
        let track = Track::video(
            1,
            0,
            CodecId::H264,
            VideoParams {
                width: 16,
                height: 16,
                frame_rate: Some(10.0),
                ..Default::default()
            },
        );
        let mut muxer = Mp4Muxer::new(BufTarget::new(), Mp4MuxerConfig::default());
        use crate::format::Muxer as _;
        muxer.write_header(&[track]).await.unwrap();
        for i in 0..10 {
            let packet = Packet::new(vec![i as u8; 64])
                .with_track_id(1)
                .with_time(i as f64 * 0.1)
                .with_duration(0.1)
                .with_key_flag(true);
            muxer.write_packet(&packet).await.unwrap();
        }
        muxer.write_trailer().await.unwrap();
        muxer.into_target().finalize()
    }

    #[tokio::test]
    async fn test_codec_copy_round_trip() {
        let input = build_input().await;
        let mut demuxer = Mp4Demuxer::open(Box::new(BufSource::new(input))).await.unwrap();
        let mut muxer = Mp4Muxer::new(BufTarget::new(), Mp4MuxerConfig::default());

        let mut converter = Converter::new(ConvertOptions::default());
        converter.run(&mut demuxer, &mut muxer).await.unwrap();

        let output = muxer.into_target().finalize();
        let mut check = Mp4Demuxer::open(Box::new(BufSource::new(output))).await.unwrap();
        use crate::format::Demuxer as _;
        let tracks = check.tracks().await.unwrap();
        assert_eq!(tracks[0].codec, CodecId::H264);
        let mut count = 0;
        while let Some(p) = check.read_packet().await.unwrap() {
            assert_eq!(p.data.len(), 64);
            count += 1;
        }
        assert_eq!(count, 10);
    }

    #[tokio::test]
    async fn test_trim_window() {
        let input = build_input().await;
        let mut demuxer = Mp4Demuxer::open(Box::new(BufSource::new(input))).await.unwrap();
        let mut muxer = Mp4Muxer::new(BufTarget::new(), Mp4MuxerConfig::default());

        let options = ConvertOptions {
            start_time: Some(0.3),
            end_time: Some(0.7),
            ..Default::default()
        };
        Converter::new(options)
            .run(&mut demuxer, &mut muxer)
            .await
            .unwrap();

        let output = muxer.into_target().finalize();
        let mut check = Mp4Demuxer::open(Box::new(BufSource::new(output))).await.unwrap();
        let mut times = Vec::new();
        while let Some(p) = check.read_packet().await.unwrap() {
            times.push(p.time);
        }
        // Samples at source times 0.3..0.6, rebased to zero
        assert_eq!(times.len(), 4);
        assert!((times[0] - 0.0).abs() < 1e-6);
        assert!((times[3] - 0.3).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_cancellation_aborts() {
        let input = build_input().await;
        let mut demuxer = Mp4Demuxer::open(Box::new(BufSource::new(input))).await.unwrap();
        let mut muxer = Mp4Muxer::new(BufTarget::new(), Mp4MuxerConfig::default());

        let mut converter = Converter::new(ConvertOptions::default());
        converter.cancel_token().cancel();
        let err = converter.run(&mut demuxer, &mut muxer).await.unwrap_err();
        assert!(matches!(err, RemuxError::Cancelled));
    }

    #[tokio::test]
    async fn test_codec_change_rejected() {
        let input = build_input().await;
        let mut demuxer = Mp4Demuxer::open(Box::new(BufSource::new(input))).await.unwrap();
        let mut muxer = Mp4Muxer::new(BufTarget::new(), Mp4MuxerConfig::default());

        let options = ConvertOptions {
            video_codec: Some(CodecId::H265),
            ..Default::default()
        };
        let err = Converter::new(options)
            .run(&mut demuxer, &mut muxer)
            .await
            .unwrap_err();
        assert!(matches!(err, RemuxError::Unsupported(_)));
    }
}
