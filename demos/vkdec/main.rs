// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! vkdec, a simple decoder program running streams through the emulated video device. Capable of
//! computing MD5 checksums of the decoded frames.

use std::fs::File;
use std::io::Read;

use vkvideo_cts::bitstream_utils::AnnexBDemuxer;
use vkvideo_cts::bitstream_utils::Demuxer;
use vkvideo_cts::bitstream_utils::IvfDemuxer;
use vkvideo_cts::codec::synthesizer::StreamSynthesizer;
use vkvideo_cts::decoder::base::VideoBaseDecoder;
use vkvideo_cts::decoder::DecoderConfig;
use vkvideo_cts::device::emulated::EmulatedDevice;
use vkvideo_cts::processor::FrameProcessor;
use vkvideo_cts::utils::frame_crc32;

use crate::util::Args;
use crate::util::InputFormat;
use crate::util::Md5Computation;

mod util;

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let demuxer: Box<dyn Demuxer> = match &args.input {
        Some(path) => {
            let mut input = File::open(path).expect("error opening input file");
            let mut buf = Vec::new();
            input.read_to_end(&mut buf).expect("error reading input file");
            match args.input_format {
                InputFormat::AnnexB => Box::new(AnnexBDemuxer::new(buf)),
                InputFormat::Ivf => Box::new(IvfDemuxer::new(buf).expect("malformed IVF file")),
            }
        }
        None => {
            let mut synth = StreamSynthesizer::new(args.codec, args.resolution)
                .num_frames(args.frames)
                .b_frames(args.b_frames);
            if let Some(extent) = args.resolution_change {
                synth = synth.resolution_change(args.frames / 2, extent);
            }
            match args.input_format {
                InputFormat::AnnexB => Box::new(AnnexBDemuxer::new(synth.annexb())),
                InputFormat::Ivf => {
                    Box::new(IvfDemuxer::new(synth.ivf()).expect("malformed IVF stream"))
                }
            }
        }
    };

    let config = DecoderConfig {
        frames_to_check: args.frames_to_check,
        layered_dpb: args.layered_dpb,
        query_decode_status: args.query_status,
        use_inline_session_params: args.inline_params,
        out_of_order_decoding: args.out_of_order.is_some(),
        resolution_change: args.resolution_change.is_some(),
        ..Default::default()
    };

    let device = EmulatedDevice::new(Default::default());
    let decoder = VideoBaseDecoder::new(device.clone(), args.codec, config);
    let mut processor = FrameProcessor::with_synthetic_parser(demuxer, decoder);

    if let Some(count) = args.out_of_order {
        processor
            .decode_frame_out_of_order(count)
            .expect("error decoding out of order");
    }

    let mut stream_md5 = md5::Context::new();
    let mut num_frames = 0;
    while let Some(frame) = processor.get_next_frame().expect("error decoding stream") {
        let data = processor.read_frame(&frame).expect("error reading frame");
        match args.compute_md5 {
            None => println!("{:4} {}", frame.display_order, frame_crc32(&data)),
            Some(Md5Computation::Frame) => println!("{:x}", md5::compute(&data)),
            Some(Md5Computation::Stream) => stream_md5.consume(&data),
        }
        processor.release_frame(frame);
        num_frames += 1;
    }

    if args.compute_md5 == Some(Md5Computation::Stream) {
        println!("{:x}", stream_md5.compute());
    }

    log::info!(
        "decoded {} frames, {} decode operations",
        num_frames,
        device.stats().decodes
    );
}
