#![no_main]

use vkvideo_cts::bitstream_utils::AnnexBDemuxer;
use vkvideo_cts::decoder::base::VideoBaseDecoder;
use vkvideo_cts::device::emulated::EmulatedDevice;
use vkvideo_cts::processor::FrameProcessor;
use vkvideo_cts::CodecOperation;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&codec, stream)) = data.split_first() else {
        return;
    };
    let Some(codec) = CodecOperation::n(codec % 4) else {
        return;
    };

    let device = EmulatedDevice::new(Default::default());
    let decoder = VideoBaseDecoder::new(device, codec, Default::default());
    let mut processor =
        FrameProcessor::with_synthetic_parser(Box::new(AnnexBDemuxer::new(stream.to_vec())), decoder);

    let _ = processor.frame_crcs();
});
