#![no_main]

use vkvideo_cts::bitstream_utils::IvfDemuxer;
use vkvideo_cts::bitstream_utils::IvfFileHeader;
use vkvideo_cts::decoder::base::VideoBaseDecoder;
use vkvideo_cts::device::emulated::EmulatedDevice;
use vkvideo_cts::processor::FrameProcessor;
use vkvideo_cts::CodecOperation;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(demuxer) = IvfDemuxer::new(data.to_vec()) else {
        return;
    };
    let codec = match demuxer.header().codec {
        IvfFileHeader::CODEC_H264 => CodecOperation::DecodeH264,
        IvfFileHeader::CODEC_H265 => CodecOperation::DecodeH265,
        IvfFileHeader::CODEC_AV1 => CodecOperation::DecodeAv1,
        _ => CodecOperation::DecodeVp9,
    };

    let device = EmulatedDevice::new(Default::default());
    let decoder = VideoBaseDecoder::new(device, codec, Default::default());
    let mut processor = FrameProcessor::with_synthetic_parser(Box::new(demuxer), decoder);

    let _ = processor.frame_crcs();
});
