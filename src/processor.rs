// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Drives a demuxer, a parser and a decoder together.
//!
//! [`FrameProcessor`] pulls chunks from its [`Demuxer`], has its [`VideoParser`] turn them into
//! calls on the decoder, and hands decoded frames out in display order. Frames obtained with
//! [`FrameProcessor::get_next_frame`] must be given back with
//! [`FrameProcessor::release_frame`], or the decoder eventually runs out of pictures.

use std::rc::Rc;
use std::time::Duration;

use log::debug;
use log::trace;

use crate::bitstream_utils::Demuxer;
use crate::codec::parser::SyntheticParser;
use crate::decoder::base::VideoBaseDecoder;
use crate::decoder::frame_buffer::DecodedFrame;
use crate::decoder::BitstreamPacket;
use crate::decoder::DecodeError;
use crate::decoder::DecodeResult;
use crate::decoder::DecoderConfig;
use crate::decoder::VideoParser;
use crate::device::VideoDevice;
use crate::utils::frame_crc32;
use crate::VideoProfile;

/// How long to wait for the decode of a displayed frame.
const FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// Creates a decoder for `profile` with the configuration of a basic decode test.
///
/// Streams with a resolution change get a new session and DPB on every sequence.
pub fn create_basic_decoder(
    device: Rc<dyn VideoDevice>,
    profile: &VideoProfile,
    frames_to_check: usize,
    resolution_change: bool,
) -> DecodeResult<VideoBaseDecoder> {
    let caps = device
        .video_capabilities(profile)
        .map_err(|e| DecodeError::NotSupported(format!("{:?}: {}", profile, e)))?;
    debug!(
        "{:?} decoder on device {}: up to {}x{}, {} DPB slots",
        profile.codec,
        device.id(),
        caps.max_coded_extent.width,
        caps.max_coded_extent.height,
        caps.max_dpb_slots
    );

    let config = DecoderConfig {
        frames_to_check,
        resolution_change,
        ..Default::default()
    };

    Ok(VideoBaseDecoder::new(device, profile.codec, config))
}

pub struct FrameProcessor {
    demuxer: Box<dyn Demuxer>,
    parser: Box<dyn VideoParser>,
    decoder: VideoBaseDecoder,
    /// Timestamp of the next chunk.
    next_timestamp: u64,
    end_of_stream: bool,
    frames_returned: usize,
}

impl FrameProcessor {
    pub fn new(
        demuxer: Box<dyn Demuxer>,
        parser: Box<dyn VideoParser>,
        decoder: VideoBaseDecoder,
    ) -> Self {
        Self {
            demuxer,
            parser,
            decoder,
            next_timestamp: 0,
            end_of_stream: false,
            frames_returned: 0,
        }
    }

    /// A processor parsing synthetic streams.
    pub fn with_synthetic_parser(demuxer: Box<dyn Demuxer>, decoder: VideoBaseDecoder) -> Self {
        Self::new(demuxer, Box::new(SyntheticParser::new()), decoder)
    }

    pub fn decoder(&self) -> &VideoBaseDecoder {
        &self.decoder
    }

    pub fn decoder_mut(&mut self) -> &mut VideoBaseDecoder {
        &mut self.decoder
    }

    pub fn end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// Parses the next chunk of the stream. Returns `false` once the stream is exhausted, after
    /// all pending decodes have been submitted and completed.
    pub fn parse_next_chunk(&mut self) -> DecodeResult<bool> {
        if self.end_of_stream {
            return Ok(false);
        }

        let chunk = self.demuxer.next_chunk()?;
        let packet = BitstreamPacket {
            data: chunk.as_deref().unwrap_or_default(),
            timestamp: self.next_timestamp,
            end_of_stream: chunk.is_none(),
        };
        trace!(
            "chunk {} of {} bytes",
            packet.timestamp,
            packet.data.len()
        );
        self.next_timestamp += 1;
        self.parser.parse_packet(&packet, &mut self.decoder)?;

        if packet.end_of_stream {
            debug!(
                "end of stream after {} chunks, {} pictures",
                packet.timestamp,
                self.decoder.pictures_decoded()
            );
            self.end_of_stream = true;
            self.decoder.flush()?;
            return Ok(false);
        }

        Ok(true)
    }

    /// Parses until `count` more pictures have been handed to the decoder, or the stream ends.
    /// Returns the number of pictures that were.
    pub fn buffer_frames(&mut self, count: usize) -> DecodeResult<usize> {
        let start = self.decoder.pictures_decoded();
        while self.decoder.pictures_decoded() - start < count as u64 {
            if !self.parse_next_chunk()? {
                break;
            }
        }

        Ok((self.decoder.pictures_decoded() - start) as usize)
    }

    /// Buffers `count` pictures, then submits all pictures the decoder holds back at once with
    /// their command buffers recorded out of order.
    pub fn decode_frame_out_of_order(&mut self, count: usize) -> DecodeResult<usize> {
        let buffered = self.buffer_frames(count)?;
        self.decoder.decode_frames_out_of_order()?;
        Ok(buffered)
    }

    /// Number of decoded frames waiting to be returned by [`Self::get_next_frame`].
    pub fn get_buffered_display_count(&self) -> usize {
        self.decoder.displayable_count()
    }

    /// Returns the next frame in display order, once its decode has completed. Returns `None`
    /// at the end of the stream, or once the configured number of frames to check was returned.
    pub fn get_next_frame(&mut self) -> DecodeResult<Option<DecodedFrame>> {
        let frames_to_check = self.decoder.config().frames_to_check;
        if frames_to_check > 0 && self.frames_returned >= frames_to_check {
            return Ok(None);
        }

        loop {
            if self.decoder.displayable_count() > 0 {
                // The frame may still sit in the decoder's cache.
                if self.decoder.num_cached() > 0 {
                    self.decoder.flush()?;
                }
                let Some(frame) = self.decoder.dequeue_decoded_frame() else {
                    return Ok(None);
                };
                if let Some(fence) = frame.frame_complete_fence {
                    self.decoder
                        .device()
                        .wait_for_fence(fence, FRAME_TIMEOUT)?;
                }
                self.frames_returned += 1;
                return Ok(Some(frame));
            }

            if !self.parse_next_chunk()? {
                return Ok(None);
            }
        }
    }

    /// Reads the contents of a decoded frame.
    pub fn read_frame(&self, frame: &DecodedFrame) -> DecodeResult<Vec<u8>> {
        Ok(self.decoder.device().read_picture(&frame.output)?)
    }

    /// Gives a frame returned by [`Self::get_next_frame`] back to the decoder.
    pub fn release_frame(&mut self, mut frame: DecodedFrame) {
        self.decoder.release_displayed_frame(&mut frame);
    }

    /// Decodes the rest of the stream, returning the CRC32 of each frame in display order.
    pub fn frame_crcs(&mut self) -> DecodeResult<Vec<String>> {
        let mut crcs = Vec::new();
        while let Some(frame) = self.get_next_frame()? {
            crcs.push(frame_crc32(&self.read_frame(&frame)?));
            self.release_frame(frame);
        }

        Ok(crcs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream_utils::AnnexBDemuxer;
    use crate::bitstream_utils::MemoryDemuxer;
    use crate::codec::synthesizer::StreamSynthesizer;
    use crate::device::emulated::EmulatedDevice;
    use crate::device::emulated::EmulatedDeviceConfig;
    use crate::CodecOperation;

    fn processor(synth: &StreamSynthesizer, device: Rc<EmulatedDevice>) -> FrameProcessor {
        let decoder = create_basic_decoder(device, &synth.profile(), 0, false).unwrap();
        FrameProcessor::with_synthetic_parser(Box::new(AnnexBDemuxer::new(synth.annexb())), decoder)
    }

    #[test]
    fn frames_come_out_in_display_order() {
        let _ = env_logger::try_init();
        let synth = StreamSynthesizer::new(CodecOperation::DecodeH264, (176, 144).into())
            .num_frames(12)
            .b_frames(2);
        let mut processor = processor(&synth, EmulatedDevice::new(Default::default()));

        let mut display_orders = Vec::new();
        let mut decode_orders = Vec::new();
        while let Some(frame) = processor.get_next_frame().unwrap() {
            display_orders.push(frame.display_order);
            decode_orders.push(frame.decode_order);
            processor.release_frame(frame);
        }
        assert_eq!(display_orders, (0..12).collect::<Vec<u64>>());
        // B pictures are decoded after the P picture following them.
        assert!(decode_orders.windows(2).any(|w| w[0] > w[1]));
        assert!(processor.end_of_stream());
        assert!(processor.get_next_frame().unwrap().is_none());
    }

    #[test]
    fn frames_to_check_limits_output() {
        let synth = StreamSynthesizer::new(CodecOperation::DecodeVp9, (176, 144).into())
            .num_frames(10);
        let device = EmulatedDevice::new(Default::default());
        let decoder = create_basic_decoder(device, &synth.profile(), 4, false).unwrap();
        let mut processor = FrameProcessor::with_synthetic_parser(
            Box::new(MemoryDemuxer::new(synth.access_units())),
            decoder,
        );

        assert_eq!(processor.frame_crcs().unwrap().len(), 4);
    }

    #[test]
    fn buffer_frames_stops_at_end_of_stream() {
        let synth = StreamSynthesizer::new(CodecOperation::DecodeAv1, (176, 144).into())
            .num_frames(5);
        let mut processor = processor(&synth, EmulatedDevice::new(Default::default()));

        assert_eq!(processor.buffer_frames(3).unwrap(), 3);
        assert_eq!(processor.get_buffered_display_count(), 3);
        assert_eq!(processor.buffer_frames(10).unwrap(), 2);
        assert!(processor.end_of_stream());
        assert_eq!(processor.frame_crcs().unwrap().len(), 5);
    }

    #[test]
    fn unsupported_codec_is_reported() {
        let device = EmulatedDevice::new(EmulatedDeviceConfig {
            codecs: vec![CodecOperation::DecodeH264],
            ..Default::default()
        });
        let profile = VideoProfile::new(CodecOperation::DecodeAv1, 0);

        assert!(matches!(
            create_basic_decoder(device, &profile, 0, false),
            Err(DecodeError::NotSupported(_))
        ));
    }

    #[test]
    fn cached_decoding_matches_immediate_decoding() {
        let synth = StreamSynthesizer::new(CodecOperation::DecodeH265, (176, 144).into())
            .num_frames(20)
            .b_frames(1);
        let expected = processor(&synth, EmulatedDevice::new(Default::default()))
            .frame_crcs()
            .unwrap();

        let device = EmulatedDevice::new(Default::default());
        let config = DecoderConfig {
            out_of_order_decoding: true,
            ..Default::default()
        };
        let decoder = VideoBaseDecoder::new(device, CodecOperation::DecodeH265, config);
        let mut processor = FrameProcessor::with_synthetic_parser(
            Box::new(AnnexBDemuxer::new(synth.annexb())),
            decoder,
        );
        processor.decode_frame_out_of_order(4).unwrap();
        let crcs = processor.frame_crcs().unwrap();

        assert_eq!(crcs.len(), expected.len());
        for (i, (crc, expected)) in crcs.iter().zip(&expected).enumerate() {
            assert_eq!(crc, expected, "at frame {}", i);
        }
    }
}
