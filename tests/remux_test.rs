use remuxio::av::convert::{ConvertOptions, Converter};
use remuxio::av::{AudioParams, CodecId, Packet, Track, VideoParams};
use remuxio::format::mp4::{
    FragmentedMp4Config, FragmentedMp4Muxer, Mp4Demuxer, Mp4Muxer, Mp4MuxerConfig,
};
use remuxio::format::ts::{TsDemuxer, TsMuxer};
use remuxio::format::{probe, ContainerFormat, Demuxer, FormatRegistry, Muxer};
use remuxio::io::{BufSource, BufTarget};

fn h264_video_track() -> Track {
    Track::video(
        1,
        0,
        CodecId::H264,
        VideoParams {
            width: 64,
            height: 48,
            frame_rate: Some(25.0),
            ..Default::default()
        },
    )
}

fn aac_audio_track(id: u32, index: usize) -> Track {
    Track::audio(
        id,
        index,
        CodecId::Aac,
        AudioParams {
            sample_rate: 48000,
            channels: 2,
            bits_per_sample: None,
        },
    )
}

/// An IDR access unit in Annex-B framing, recognizable by the TS
/// keyframe sniffer.
fn idr_payload(filler: u8) -> Vec<u8> {
    let mut data = vec![0x00, 0x00, 0x01, 0x65];
    data.extend_from_slice(&[filler; 60]);
    data
}

fn non_idr_payload(filler: u8) -> Vec<u8> {
    let mut data = vec![0x00, 0x00, 0x01, 0x41];
    data.extend_from_slice(&[filler; 60]);
    data
}

async fn build_progressive_mp4() -> bytes::Bytes {
    let mut muxer = Mp4Muxer::new(BufTarget::new(), Mp4MuxerConfig::default());
    muxer
        .write_header(&[h264_video_track(), aac_audio_track(2, 1)])
        .await
        .unwrap();

    for i in 0..25 {
        let time = i as f64 / 25.0;
        let video = Packet::new(if i % 5 == 0 {
            idr_payload(i as u8)
        } else {
            non_idr_payload(i as u8)
        })
        .with_track_id(1)
        .with_time(time)
        .with_duration(1.0 / 25.0)
        .with_key_flag(i % 5 == 0);
        muxer.write_packet(&video).await.unwrap();

        let audio = Packet::new(vec![0x80u8 | (i as u8); 32])
            .with_track_id(2)
            .with_time(time)
            .with_duration(1.0 / 25.0)
            .with_key_flag(true);
        muxer.write_packet(&audio).await.unwrap();
    }
    muxer.write_trailer().await.unwrap();
    muxer.into_target().finalize()
}

#[tokio::test]
async fn probe_identifies_generated_files() {
    let mp4 = build_progressive_mp4().await;
    assert_eq!(probe(&mp4), Some(ContainerFormat::Mp4));

    let registry = FormatRegistry::with_defaults();
    let mut demuxer = registry.open(Box::new(BufSource::new(mp4))).await.unwrap();
    let tracks = demuxer.tracks().await.unwrap();
    assert_eq!(tracks.len(), 2);
    demuxer.close().await.unwrap();
}

#[tokio::test]
async fn mp4_round_trip_preserves_samples() {
    let mp4 = build_progressive_mp4().await;
    let mut input = Mp4Demuxer::open(Box::new(BufSource::new(mp4))).await.unwrap();

    // Collect the original packet inventory
    let mut original = Vec::new();
    while let Some(p) = input.read_packet().await.unwrap() {
        original.push(p);
    }
    input.seek(0.0).await.unwrap();

    let mut output = Mp4Muxer::new(BufTarget::new(), Mp4MuxerConfig::default());
    let mut converter = Converter::new(ConvertOptions::default());
    converter.run(&mut input, &mut output).await.unwrap();

    let remuxed = output.into_target().finalize();
    let mut check = Mp4Demuxer::open(Box::new(BufSource::new(remuxed))).await.unwrap();
    let tracks = check.tracks().await.unwrap();
    assert_eq!(tracks.len(), 2);
    assert_eq!(tracks[0].codec, CodecId::H264);
    assert_eq!(tracks[1].codec, CodecId::Aac);

    let mut remuxed_packets = Vec::new();
    while let Some(p) = check.read_packet().await.unwrap() {
        remuxed_packets.push(p);
    }
    assert_eq!(remuxed_packets.len(), original.len());

    for track_id in [1u32, 2] {
        let before: Vec<&Packet> = original.iter().filter(|p| p.track_id == track_id).collect();
        let after: Vec<&Packet> = remuxed_packets
            .iter()
            .filter(|p| p.track_id == track_id)
            .collect();
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(&after) {
            assert_eq!(b.data, a.data);
            assert_eq!(b.is_key, a.is_key);
            assert!((b.time - a.time).abs() < 1e-3, "dts drift on track {}", track_id);
        }
    }
}

#[tokio::test]
async fn mp4_to_ts_to_mp4() {
    let mp4 = build_progressive_mp4().await;
    let mut input = Mp4Demuxer::open(Box::new(BufSource::new(mp4))).await.unwrap();

    let mut ts_muxer = TsMuxer::new(BufTarget::new());
    Converter::new(ConvertOptions::default())
        .run(&mut input, &mut ts_muxer)
        .await
        .unwrap();
    let ts = ts_muxer.into_target().finalize();
    assert_eq!(probe(&ts), Some(ContainerFormat::MpegTs));
    assert_eq!(ts.len() % 188, 0);

    let mut ts_demuxer = TsDemuxer::open(Box::new(BufSource::new(ts))).await.unwrap();
    let tracks = ts_demuxer.tracks().await.unwrap();
    assert_eq!(tracks.len(), 2);
    assert_eq!(tracks[0].codec, CodecId::H264);
    assert_eq!(tracks[1].codec, CodecId::Aac);

    let mut video = 0;
    let mut audio = 0;
    let mut video_keys = 0;
    while let Some(p) = ts_demuxer.read_packet().await.unwrap() {
        match p.track_id {
            1 => {
                video += 1;
                if p.is_key {
                    video_keys += 1;
                }
            }
            2 => audio += 1,
            other => panic!("unexpected track {}", other),
        }
    }
    assert_eq!(video, 25);
    assert_eq!(audio, 25);
    // Every fifth video access unit was an IDR
    assert_eq!(video_keys, 5);
}

#[tokio::test]
async fn fragmented_output_from_progressive_input() {
    let mp4 = build_progressive_mp4().await;
    let mut input = Mp4Demuxer::open(Box::new(BufSource::new(mp4))).await.unwrap();

    let config = FragmentedMp4Config {
        fragment_duration: 0.2,
        ..Default::default()
    };
    let mut muxer = FragmentedMp4Muxer::new(BufTarget::new(), config);
    let options = ConvertOptions {
        fragmented: true,
        ..Default::default()
    };
    Converter::new(options).run(&mut input, &mut muxer).await.unwrap();

    let fmp4 = muxer.into_target().finalize();
    let mut check = Mp4Demuxer::open(Box::new(BufSource::new(fmp4))).await.unwrap();
    assert!(check.is_fragmented());

    let mut count = 0;
    let mut last_dts_per_track = std::collections::HashMap::new();
    while let Some(p) = check.read_packet().await.unwrap() {
        let last = last_dts_per_track.entry(p.track_id).or_insert(f64::MIN);
        assert!(p.time >= *last, "dts must be non-decreasing per track");
        *last = p.time;
        count += 1;
    }
    assert_eq!(count, 50);
}

#[tokio::test]
async fn track_selection_drops_audio() {
    let mp4 = build_progressive_mp4().await;
    let mut input = Mp4Demuxer::open(Box::new(BufSource::new(mp4))).await.unwrap();

    let mut output = Mp4Muxer::new(BufTarget::new(), Mp4MuxerConfig::default());
    let options = ConvertOptions {
        audio_track_index: Some(9), // no such audio track: keep none
        ..Default::default()
    };
    Converter::new(options).run(&mut input, &mut output).await.unwrap();

    let remuxed = output.into_target().finalize();
    let mut check = Mp4Demuxer::open(Box::new(BufSource::new(remuxed))).await.unwrap();
    let tracks = check.tracks().await.unwrap();
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].codec, CodecId::H264);
}

#[tokio::test]
async fn seek_delivers_keyframe_first() {
    let mp4 = build_progressive_mp4().await;
    let mut demuxer = Mp4Demuxer::open(Box::new(BufSource::new(mp4))).await.unwrap();
    demuxer.tracks().await.unwrap();

    // 0.55 s sits between the keyframes at 0.4 and 0.6
    demuxer.seek(0.55).await.unwrap();
    let packet = loop {
        let p = demuxer.read_packet().await.unwrap().unwrap();
        if p.track_id == 1 {
            break p;
        }
    };
    assert!(packet.is_key);
    assert!((packet.time - 0.4).abs() < 1e-6);
}
