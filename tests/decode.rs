// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decodes synthetic streams end to end on the emulated device.

use std::num::NonZeroUsize;

use vkvideo_cts::bitstream_utils::AnnexBDemuxer;
use vkvideo_cts::bitstream_utils::IvfDemuxer;
use vkvideo_cts::codec::synthesizer::StreamSynthesizer;
use vkvideo_cts::decoder::base::VideoBaseDecoder;
use vkvideo_cts::decoder::DecodeError;
use vkvideo_cts::decoder::DecoderConfig;
use vkvideo_cts::device::emulated::EmulatedDevice;
use vkvideo_cts::device::DeviceStatus;
use vkvideo_cts::processor::create_basic_decoder;
use vkvideo_cts::processor::FrameProcessor;
use vkvideo_cts::utils::frame_crc32;
use vkvideo_cts::CodecOperation;
use vkvideo_cts::Resolution;

const CODECS: [CodecOperation; 4] = [
    CodecOperation::DecodeH264,
    CodecOperation::DecodeH265,
    CodecOperation::DecodeAv1,
    CodecOperation::DecodeVp9,
];

fn synth(codec: CodecOperation) -> StreamSynthesizer {
    StreamSynthesizer::new(codec, Resolution::from((176, 144)))
}

/// Decodes `synth` with `config`, returning the CRC of every displayed frame.
fn decode(synth: &StreamSynthesizer, config: DecoderConfig) -> Vec<String> {
    let device = EmulatedDevice::new(Default::default());
    let decoder = VideoBaseDecoder::new(device.clone(), synth.profile().codec, config);
    let mut processor =
        FrameProcessor::with_synthetic_parser(Box::new(AnnexBDemuxer::new(synth.annexb())), decoder);
    let crcs = processor.frame_crcs().unwrap();

    drop(processor);
    assert_eq!(device.live_objects(), 0);
    crcs
}

fn assert_same_frames(actual: &[String], expected: &[String]) {
    assert_eq!(actual.len(), expected.len());
    for (i, (actual, expected)) in actual.iter().zip(expected).enumerate() {
        assert_eq!(actual, expected, "at frame {}", i);
    }
}

#[test]
fn every_codec_decodes_every_frame() {
    let _ = env_logger::try_init();

    for codec in CODECS {
        let synth = synth(codec).num_frames(24).gop_size(8);
        let device = EmulatedDevice::new(Default::default());
        let decoder = create_basic_decoder(device.clone(), &synth.profile(), 0, false).unwrap();
        let mut processor = FrameProcessor::with_synthetic_parser(
            Box::new(AnnexBDemuxer::new(synth.annexb())),
            decoder,
        );

        assert_eq!(processor.frame_crcs().unwrap().len(), 24, "{:?}", codec);
        assert_eq!(device.stats().decodes, 24, "{:?}", codec);
        assert_eq!(device.stats().sessions_created, 1, "{:?}", codec);
    }
}

#[test]
fn out_of_order_recording_keeps_output() {
    let _ = env_logger::try_init();

    for codec in CODECS {
        let synth = synth(codec).num_frames(16).b_frames(2);
        let expected = decode(&synth, Default::default());
        let actual = decode(
            &synth,
            DecoderConfig {
                out_of_order_decoding: true,
                frames_to_check: 4,
                ..Default::default()
            },
        );
        assert_same_frames(&actual, &expected);
    }
}

#[test]
fn decoding_options_keep_output() {
    let configs = [
        DecoderConfig {
            layered_dpb: true,
            ..Default::default()
        },
        DecoderConfig {
            use_inline_session_params: true,
            ..Default::default()
        },
        DecoderConfig {
            query_decode_status: true,
            ..Default::default()
        },
        DecoderConfig {
            query_decode_status: true,
            use_inline_queries: true,
            ..Default::default()
        },
        DecoderConfig {
            reset_codec_no_session_params: true,
            ..Default::default()
        },
        DecoderConfig {
            resources_without_profiles: true,
            ..Default::default()
        },
    ];

    for codec in CODECS {
        let synth = synth(codec).num_frames(12).b_frames(1);
        let expected = decode(&synth, Default::default());
        for config in &configs {
            let actual = decode(&synth, config.clone());
            assert_same_frames(&actual, &expected);
        }
    }
}

#[test]
fn intra_only_streams_decode_without_setup_references() {
    let _ = env_logger::try_init();

    for codec in CODECS {
        let synth = synth(codec).num_frames(8).gop_size(1);
        let expected = decode(&synth, Default::default());

        let device = EmulatedDevice::new(Default::default());
        let config = DecoderConfig {
            intra_only_decoding_no_setup_ref: true,
            ..Default::default()
        };
        let decoder = VideoBaseDecoder::new(device.clone(), codec, config);
        let mut processor = FrameProcessor::with_synthetic_parser(
            Box::new(AnnexBDemuxer::new(synth.annexb())),
            decoder,
        );

        let actual = processor.frame_crcs().unwrap();
        assert_eq!(actual.len(), 8, "{:?}", codec);
        assert_same_frames(&actual, &expected);
        assert_eq!(
            processor.decoder().dpb().slots().len(),
            0,
            "{:?}",
            codec
        );
        assert_eq!(device.stats().decodes, 8, "{:?}", codec);
    }
}

#[test]
fn resolution_change_recreates_session() {
    let _ = env_logger::try_init();

    for codec in CODECS {
        let synth = synth(codec)
            .num_frames(20)
            .resolution_change(10, Resolution::from((352, 288)));
        let device = EmulatedDevice::new(Default::default());
        let decoder = create_basic_decoder(device.clone(), &synth.profile(), 0, true).unwrap();
        let mut processor = FrameProcessor::with_synthetic_parser(
            Box::new(AnnexBDemuxer::new(synth.annexb())),
            decoder,
        );

        assert_eq!(processor.frame_crcs().unwrap().len(), 20, "{:?}", codec);
        assert_eq!(device.stats().sessions_created, 2, "{:?}", codec);
        drop(processor);
        assert_eq!(device.live_objects(), 0);
    }
}

#[test]
fn parameter_updates_keep_output() {
    for codec in [CodecOperation::DecodeH264, CodecOperation::DecodeH265] {
        let synth = synth(codec)
            .num_frames(30)
            .gop_size(10)
            .parameter_updates(true);
        let expected = decode(&synth, Default::default());
        for trigger in [1, 2, 5] {
            let actual = decode(
                &synth,
                DecoderConfig {
                    picture_parameter_update_trigger: NonZeroUsize::new(trigger),
                    ..Default::default()
                },
            );
            assert_same_frames(&actual, &expected);
        }
    }
}

#[test]
fn query_failure_is_reported() {
    let synth = synth(CodecOperation::DecodeH264).num_frames(10);
    let device = EmulatedDevice::new(Default::default());
    let config = DecoderConfig {
        query_decode_status: true,
        ..Default::default()
    };
    let decoder = VideoBaseDecoder::new(device.clone(), CodecOperation::DecodeH264, config);
    let mut processor =
        FrameProcessor::with_synthetic_parser(Box::new(AnnexBDemuxer::new(synth.annexb())), decoder);

    let frame = processor.get_next_frame().unwrap().unwrap();
    processor.release_frame(frame);
    device.fail_next("get_query_pool_results", DeviceStatus::DeviceLost);

    let err = loop {
        match processor.get_next_frame() {
            Ok(Some(frame)) => processor.release_frame(frame),
            Ok(None) => panic!("stream ended without the injected failure"),
            Err(e) => break e,
        }
    };
    match err {
        DecodeError::Device(e) => assert_eq!(e.status, DeviceStatus::DeviceLost),
        e => panic!("unexpected error {:?}", e),
    }
}

#[test]
fn film_grain_changes_output_only() {
    let synth = synth(CodecOperation::DecodeAv1).num_frames(8).film_grain(true);
    let with_grain = decode(&synth, Default::default());
    let without_grain = decode(
        &synth,
        DecoderConfig {
            force_disable_film_grain: true,
            ..Default::default()
        },
    );

    assert_eq!(with_grain.len(), 8);
    assert_eq!(without_grain.len(), 8);
    for (i, (a, b)) in with_grain.iter().zip(&without_grain).enumerate() {
        assert_ne!(a, b, "at frame {}", i);
    }
}

#[test]
fn h264_stream_features() {
    let _ = env_logger::try_init();

    let streams = [
        synth(CodecOperation::DecodeH264).num_frames(10).interlaced(true),
        synth(CodecOperation::DecodeH264)
            .num_frames(12)
            .frame_num_gap_at(5),
        synth(CodecOperation::DecodeH264)
            .num_frames(20)
            .max_refs(2)
            .long_term_reference(true),
    ];
    assert_eq!(decode(&streams[0], Default::default()).len(), 10);
    assert_eq!(decode(&streams[1], Default::default()).len(), 12);
    assert_eq!(decode(&streams[2], Default::default()).len(), 20);
}

#[test]
fn av1_hidden_frames_are_displayed() {
    let synth = synth(CodecOperation::DecodeAv1)
        .num_frames(12)
        .gop_size(6)
        .hidden_frames(true);
    assert_eq!(decode(&synth, Default::default()).len(), 12);
}

#[test]
fn ivf_matches_annexb() {
    for codec in [CodecOperation::DecodeVp9, CodecOperation::DecodeAv1] {
        let synth = synth(codec).num_frames(10);
        let expected = decode(&synth, Default::default());

        let device = EmulatedDevice::new(Default::default());
        let decoder = create_basic_decoder(device, &synth.profile(), 0, false).unwrap();
        let mut processor = FrameProcessor::with_synthetic_parser(
            Box::new(IvfDemuxer::new(synth.ivf()).unwrap()),
            decoder,
        );
        assert_same_frames(&processor.frame_crcs().unwrap(), &expected);
    }
}

#[test]
fn frames_held_by_the_client_stay_valid() {
    let synth = synth(CodecOperation::DecodeH265).num_frames(10).b_frames(2);
    let expected = decode(&synth, Default::default());

    let device = EmulatedDevice::new(Default::default());
    let decoder = create_basic_decoder(device, &synth.profile(), 0, false).unwrap();
    let mut processor =
        FrameProcessor::with_synthetic_parser(Box::new(AnnexBDemuxer::new(synth.annexb())), decoder);

    // Hold on to the first frame until every other frame was read.
    let first = processor.get_next_frame().unwrap().unwrap();
    let mut crcs = vec![String::new()];
    while let Some(frame) = processor.get_next_frame().unwrap() {
        crcs.push(frame_crc32(
            &processor.read_frame(&frame).unwrap(),
        ));
        processor.release_frame(frame);
    }
    crcs[0] = frame_crc32(&processor.read_frame(&first).unwrap());
    processor.release_frame(first);

    assert_same_frames(&crcs, &expected);
}
