// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Parser for synthetic streams.
//!
//! The parser keeps the reference model a real parser keeps for each codec: H.264 sliding window
//! and long-term marking with non-existing frames filling `frame_num` gaps, H.265 reference
//! picture sets, and the AV1 and VP9 reference store. It reorders pictures for display using
//! the reorder depth of the sequence.

use std::collections::HashMap;
use std::rc::Rc;

use log::debug;
use log::trace;

use crate::bitstream_utils::unescape_unit;
use crate::bitstream_utils::UnitIterator;
use crate::codec::av1::Av1FrameType;
use crate::codec::av1::Av1PictureData;
use crate::codec::av1::Av1SequenceHeader;
use crate::codec::h264::H264DpbEntry;
use crate::codec::h264::H264PictureData;
use crate::codec::h264::H264Pps;
use crate::codec::h264::H264Sps;
use crate::codec::h264::BOTTOM_FIELD;
use crate::codec::h264::FRAME;
use crate::codec::h264::TOP_FIELD;
use crate::codec::h265::H265PictureData;
use crate::codec::h265::H265Pps;
use crate::codec::h265::H265Sps;
use crate::codec::h265::H265Vps;
use crate::codec::h265::MAX_NUM_REF_PICS;
use crate::codec::synthesizer::ParameterSetUnit;
use crate::codec::synthesizer::PictureFlags;
use crate::codec::synthesizer::PictureType;
use crate::codec::synthesizer::PictureUnit;
use crate::codec::synthesizer::SequenceUnit;
use crate::codec::synthesizer::SyntheticUnit;
use crate::codec::synthesizer::MAX_FRAME_NUM;
use crate::codec::vp9::Vp9FrameType;
use crate::codec::vp9::Vp9PictureData;
use crate::codec::CodecPictureData;
use crate::codec::ParameterSetKind;
use crate::codec::ParameterSetPayload;
use crate::codec::PictureData;
use crate::codec::SequenceInfo;
use crate::codec::StdParameterSet;
use crate::decoder::frame_buffer::PictureBuffer;
use crate::decoder::BitstreamPacket;
use crate::decoder::DecodeError;
use crate::decoder::DecodeResult;
use crate::decoder::VideoDecodeClient;
use crate::decoder::VideoParser;
use crate::CodecOperation;
use crate::NUM_REF_FRAMES;

fn invalid(msg: impl Into<String>) -> DecodeError {
    DecodeError::InvalidParameters(msg.into())
}

/// Properties the decoder needs to know about a sequence.
pub fn sequence_info(seq: &SequenceUnit) -> SequenceInfo {
    let max_refs = seq.max_num_refs as u32;
    let reorder = seq.num_reorder_frames as u32;
    let (min_num_decode_surfaces, min_num_dpb_slots) = match seq.codec {
        CodecOperation::DecodeH264 | CodecOperation::DecodeH265 => {
            (max_refs + reorder + 2, max_refs + 1)
        }
        // The store may hold 8 different pictures.
        CodecOperation::DecodeAv1 | CodecOperation::DecodeVp9 => {
            (NUM_REF_FRAMES as u32 + reorder + 2, 0)
        }
    };

    SequenceInfo {
        codec: seq.codec,
        std_profile: seq.std_profile as u32,
        chroma_subsampling: seq.chroma_subsampling,
        bit_depth_luma_minus8: seq.bit_depth_luma_minus8,
        bit_depth_chroma_minus8: seq.bit_depth_chroma_minus8,
        progressive: seq.progressive,
        coded_extent: seq.coded_extent,
        min_num_decode_surfaces,
        min_num_dpb_slots,
        film_grain: seq.film_grain,
    }
}

fn parameter_set_payload(
    seq: &SequenceUnit,
    unit: &ParameterSetUnit,
) -> DecodeResult<ParameterSetPayload> {
    if unit.kind.codec() != seq.codec {
        return Err(invalid(format!(
            "{:?} parameter set in a {:?} sequence",
            unit.kind, seq.codec
        )));
    }

    let extent = seq.coded_extent;
    let width_in_mbs = extent.width.div_ceil(16) as u16;
    let height_in_mbs = extent.height.div_ceil(16) as u16;
    let payload = match unit.kind {
        ParameterSetKind::H264Sps => ParameterSetPayload::H264Sps(H264Sps {
            seq_parameter_set_id: unit.sps_id,
            profile_idc: seq.std_profile,
            level_idc: 41,
            chroma_format_idc: seq.chroma_subsampling as u8,
            bit_depth_luma_minus8: seq.bit_depth_luma_minus8,
            bit_depth_chroma_minus8: seq.bit_depth_chroma_minus8,
            log2_max_frame_num_minus4: (MAX_FRAME_NUM.trailing_zeros() - 4) as u8,
            pic_order_cnt_type: 0,
            max_num_ref_frames: seq.max_num_refs,
            pic_width_in_mbs_minus1: width_in_mbs.saturating_sub(1),
            pic_height_in_map_units_minus1: if seq.progressive {
                height_in_mbs.saturating_sub(1)
            } else {
                height_in_mbs.div_ceil(2).saturating_sub(1)
            },
            frame_mbs_only_flag: seq.progressive,
        }),
        ParameterSetKind::H264Pps => ParameterSetPayload::H264Pps(H264Pps {
            pic_parameter_set_id: unit.pps_id,
            seq_parameter_set_id: unit.sps_id,
            entropy_coding_mode_flag: unit.pps_id % 2 == 0,
            ..Default::default()
        }),
        ParameterSetKind::H265Vps => ParameterSetPayload::H265Vps(H265Vps {
            video_parameter_set_id: unit.vps_id,
            max_sub_layers_minus1: 0,
        }),
        ParameterSetKind::H265Sps => ParameterSetPayload::H265Sps(H265Sps {
            video_parameter_set_id: unit.vps_id,
            seq_parameter_set_id: unit.sps_id,
            general_profile_idc: seq.std_profile,
            chroma_format_idc: seq.chroma_subsampling as u8,
            bit_depth_luma_minus8: seq.bit_depth_luma_minus8,
            bit_depth_chroma_minus8: seq.bit_depth_chroma_minus8,
            pic_width_in_luma_samples: extent.width,
            pic_height_in_luma_samples: extent.height,
            log2_max_pic_order_cnt_lsb_minus4: 4,
            sps_max_dec_pic_buffering_minus1: seq.max_num_refs,
        }),
        ParameterSetKind::H265Pps => ParameterSetPayload::H265Pps(H265Pps {
            video_parameter_set_id: unit.vps_id,
            seq_parameter_set_id: unit.sps_id,
            pic_parameter_set_id: unit.pps_id,
            ..Default::default()
        }),
        ParameterSetKind::Av1SequenceHeader => {
            ParameterSetPayload::Av1SequenceHeader(Av1SequenceHeader {
                seq_profile: seq.std_profile,
                bit_depth: 8 + seq.bit_depth_luma_minus8,
                max_frame_width_minus_1: extent.width.saturating_sub(1) as u16,
                max_frame_height_minus_1: extent.height.saturating_sub(1) as u16,
                enable_order_hint: true,
                order_hint_bits_minus_1: 7,
                film_grain_params_present: seq.film_grain,
            })
        }
    };

    Ok(payload)
}

/// A decoded picture waiting for its turn to be displayed.
struct PendingPicture {
    order: i32,
    picture: PictureBuffer,
    timestamp: u64,
}

/// Outputs pictures in ascending order once more than `depth` of them are pending.
#[derive(Default)]
struct DisplayQueue {
    pending: Vec<PendingPicture>,
    depth: usize,
}

impl DisplayQueue {
    fn push(
        &mut self,
        pending: PendingPicture,
        client: &mut dyn VideoDecodeClient,
    ) -> DecodeResult<()> {
        self.pending.push(pending);
        while self.pending.len() > self.depth {
            self.output_next(client)?;
        }
        Ok(())
    }

    fn output_next(&mut self, client: &mut dyn VideoDecodeClient) -> DecodeResult<()> {
        let Some(next) = self
            .pending
            .iter()
            .enumerate()
            .min_by_key(|(_, p)| p.order)
            .map(|(i, _)| i)
        else {
            return Ok(());
        };
        let pending = self.pending.remove(next);
        client.display_picture(&pending.picture, pending.timestamp)
    }

    fn flush(&mut self, client: &mut dyn VideoDecodeClient) -> DecodeResult<()> {
        while !self.pending.is_empty() {
            self.output_next(client)?;
        }
        Ok(())
    }
}

struct H264Reference {
    /// `None` for frames missing from the stream.
    picture: Option<PictureBuffer>,
    frame_num: u16,
    long_term_frame_idx: Option<u8>,
    used_for_reference: u8,
    field_order_cnt: [i32; 2],
}

/// A first field waiting for its second field.
struct FirstField {
    picture: PictureBuffer,
    frame_num: u16,
    bottom: bool,
    order: i32,
    timestamp: u64,
}

#[derive(Default)]
struct H264State {
    refs: Vec<H264Reference>,
    prev_ref_frame_num: u16,
    idr_pic_id: u16,
    first_field: Option<FirstField>,
}

impl H264State {
    /// Makes room for a new reference by dropping the oldest short-term one.
    fn sliding_window(&mut self, max_num_ref_frames: usize) {
        while !self.refs.is_empty() && self.refs.len() >= max_num_ref_frames.max(1) {
            let oldest = self
                .refs
                .iter()
                .position(|r| r.long_term_frame_idx.is_none())
                .unwrap_or(0);
            let dropped = self.refs.remove(oldest);
            trace!("frame_num {} is no longer a reference", dropped.frame_num);
        }
    }

    /// Inserts non-existing frames for the `frame_num` values skipped before `frame_num`.
    fn fill_frame_num_gap(&mut self, frame_num: u16, max_num_ref_frames: usize) {
        let expected = (self.prev_ref_frame_num + 1) % MAX_FRAME_NUM;
        if frame_num == self.prev_ref_frame_num || frame_num == expected {
            return;
        }

        debug!(
            "frame_num gap: expected {}, got {}",
            expected, frame_num
        );
        let mut missing = expected;
        while missing != frame_num {
            self.sliding_window(max_num_ref_frames);
            self.refs.push(H264Reference {
                picture: None,
                frame_num: missing,
                long_term_frame_idx: None,
                used_for_reference: FRAME,
                field_order_cnt: [0, 0],
            });
            self.prev_ref_frame_num = missing;
            missing = (missing + 1) % MAX_FRAME_NUM;
        }
    }

    fn dpb(&self) -> Vec<H264DpbEntry> {
        self.refs
            .iter()
            .map(|r| H264DpbEntry {
                picture: r.picture.clone(),
                frame_idx: r
                    .long_term_frame_idx
                    .map(i32::from)
                    .unwrap_or(r.frame_num as i32),
                is_long_term: r.long_term_frame_idx.is_some(),
                not_existing: r.picture.is_none(),
                used_for_reference: r.used_for_reference,
                field_order_cnt: r.field_order_cnt,
            })
            .collect()
    }
}

struct H265Reference {
    picture: PictureBuffer,
    pic_order_cnt: i32,
    long_term: bool,
}

#[derive(Clone)]
struct StoreEntry {
    picture: PictureBuffer,
    order_hint: u8,
}

/// Parses synthetic streams produced by
/// [`StreamSynthesizer`](crate::codec::synthesizer::StreamSynthesizer).
#[derive(Default)]
pub struct SyntheticParser {
    sequence: Option<SequenceUnit>,
    /// Whether the current sequence was reported to the client.
    sequence_started: bool,
    parameter_sets: HashMap<(ParameterSetKind, u8), Rc<StdParameterSet>>,
    h264: H264State,
    h265: Vec<H265Reference>,
    store: [Option<StoreEntry>; NUM_REF_FRAMES],
    display: DisplayQueue,
    pictures_parsed: usize,
}

impl SyntheticParser {
    pub fn new() -> Self {
        Default::default()
    }

    /// The sequence being parsed.
    pub fn sequence(&self) -> Option<&SequenceUnit> {
        self.sequence.as_ref()
    }

    /// Number of pictures handed to the client for decoding.
    pub fn pictures_parsed(&self) -> usize {
        self.pictures_parsed
    }

    fn parse_unit(
        &mut self,
        unit: &[u8],
        timestamp: u64,
        client: &mut dyn VideoDecodeClient,
    ) -> DecodeResult<()> {
        let unescaped = unescape_unit(unit);
        match SyntheticUnit::parse(&unescaped)? {
            SyntheticUnit::Sequence(seq) => {
                self.end_sequence(client)?;
                debug!(
                    "new {:?} sequence of {}x{}",
                    seq.codec, seq.coded_extent.width, seq.coded_extent.height
                );
                self.display.depth = seq.num_reorder_frames as usize;
                self.sequence = Some(seq);
                self.sequence_started = false;
                Ok(())
            }
            SyntheticUnit::ParameterSet(set) => self.update_parameter_set(&set, client),
            SyntheticUnit::Picture(picture) => self.parse_picture(picture, timestamp, client),
            SyntheticUnit::EndOfSequence => self.end_sequence(client),
            SyntheticUnit::Unknown(_) => {
                client.unhandled_nalu(unit);
                Ok(())
            }
        }
    }

    /// Outputs every pending picture and forgets all references.
    fn end_sequence(&mut self, client: &mut dyn VideoDecodeClient) -> DecodeResult<()> {
        self.flush_first_field(client)?;
        self.display.flush(client)?;
        self.h264.refs.clear();
        self.h265.clear();
        self.store = Default::default();
        Ok(())
    }

    fn update_parameter_set(
        &mut self,
        unit: &ParameterSetUnit,
        client: &mut dyn VideoDecodeClient,
    ) -> DecodeResult<()> {
        let seq = self
            .sequence
            .as_ref()
            .ok_or_else(|| invalid("parameter set before any sequence"))?;
        let set = StdParameterSet::new(
            parameter_set_payload(seq, unit)?,
            unit.update_sequence_count,
        );
        trace!("parameter set {:?}", set.key());
        client.update_picture_parameters(&set)?;
        self.parameter_sets
            .insert((set.kind(), set.node_id() as u8), set);
        Ok(())
    }

    fn parameter_set(&self, kind: ParameterSetKind, id: u8) -> DecodeResult<Rc<StdParameterSet>> {
        self.parameter_sets
            .get(&(kind, id))
            .cloned()
            .ok_or_else(|| invalid(format!("picture uses missing {:?} {}", kind, id)))
    }

    fn parse_picture(
        &mut self,
        unit: PictureUnit,
        timestamp: u64,
        client: &mut dyn VideoDecodeClient,
    ) -> DecodeResult<()> {
        let seq = self
            .sequence
            .clone()
            .ok_or_else(|| invalid("picture before any sequence"))?;
        if !self.sequence_started {
            client.begin_sequence(&sequence_info(&seq))?;
            self.sequence_started = true;
        }

        match seq.codec {
            CodecOperation::DecodeH264 => self.parse_h264(&seq, unit, timestamp, client),
            CodecOperation::DecodeH265 => self.parse_h265(&seq, unit, timestamp, client),
            CodecOperation::DecodeAv1 | CodecOperation::DecodeVp9 => {
                self.parse_store_frame(&seq, unit, timestamp, client)
            }
        }
    }

    /// Hands `unit` to the client for decoding into `current`.
    fn submit(
        &mut self,
        client: &mut dyn VideoDecodeClient,
        unit: &PictureUnit,
        current: &PictureBuffer,
        codec: CodecPictureData,
        timestamp: u64,
        second_field: bool,
    ) -> DecodeResult<()> {
        let bitstream = client.get_bitstream_buffer(unit.payload.len(), &unit.payload)?;
        let field = unit.flags.contains(PictureFlags::FIELD);
        let picture = PictureData {
            current: Rc::clone(current),
            codec,
            bitstream,
            bitstream_offset: 0,
            bitstream_len: unit.payload.len(),
            slice_offsets: vec![0],
            progressive_frame: !field,
            field_pic_flag: field,
            bottom_field_flag: unit.flags.contains(PictureFlags::BOTTOM_FIELD),
            second_field,
            top_field_first: true,
            ref_pic_flag: unit.flags.contains(PictureFlags::REFERENCE),
            intra_pic_flag: matches!(
                unit.picture_type,
                PictureType::Intra | PictureType::IntraOnly
            ),
            timestamp,
        };
        client.decode_picture(&picture)?;
        self.pictures_parsed += 1;
        Ok(())
    }

    /// Displays a first field whose second field never came.
    fn flush_first_field(&mut self, client: &mut dyn VideoDecodeClient) -> DecodeResult<()> {
        if let Some(first) = self.h264.first_field.take() {
            debug!("unpaired field with frame_num {}", first.frame_num);
            self.display.push(
                PendingPicture {
                    order: first.order,
                    picture: first.picture,
                    timestamp: first.timestamp,
                },
                client,
            )?;
        }
        Ok(())
    }

    fn parse_h264(
        &mut self,
        seq: &SequenceUnit,
        unit: PictureUnit,
        timestamp: u64,
        client: &mut dyn VideoDecodeClient,
    ) -> DecodeResult<()> {
        let pps = self.parameter_set(ParameterSetKind::H264Pps, unit.parameter_set_id)?;
        let sps = self.parameter_set(
            ParameterSetKind::H264Sps,
            pps.sps_id().unwrap_or_default(),
        )?;
        let max_num_ref_frames = seq.max_num_refs as usize;
        let field = unit.flags.contains(PictureFlags::FIELD);
        let bottom = unit.flags.contains(PictureFlags::BOTTOM_FIELD);
        let idr = unit.flags.contains(PictureFlags::IDR);

        let second_field = match &self.h264.first_field {
            Some(first) => {
                field && !idr && first.bottom != bottom && first.frame_num == unit.frame_num
            }
            None => false,
        };

        let current = if second_field {
            match &self.h264.first_field {
                Some(first) => Rc::clone(&first.picture),
                None => return Err(invalid("second field without a first field")),
            }
        } else {
            self.flush_first_field(client)?;
            if idr {
                self.display.flush(client)?;
                self.h264.refs.clear();
                self.h264.prev_ref_frame_num = 0;
                self.h264.idr_pic_id = self.h264.idr_pic_id.wrapping_add(1);
            } else {
                self.h264
                    .fill_frame_num_gap(unit.frame_num, max_num_ref_frames);
            }
            client.alloc_picture_buffer(seq.coded_extent)?
        };

        let curr_field_order_cnt = match (field, bottom) {
            (false, _) => [unit.order, unit.order],
            (true, false) => [unit.order, 0],
            (true, true) => [0, unit.order],
        };
        let data = H264PictureData {
            sps,
            pps,
            frame_num: unit.frame_num,
            idr_pic_flag: idr,
            idr_pic_id: self.h264.idr_pic_id,
            curr_field_order_cnt,
            dpb: self.h264.dpb(),
        };
        self.submit(
            client,
            &unit,
            &current,
            CodecPictureData::H264(data),
            timestamp,
            second_field,
        )?;

        if unit.flags.contains(PictureFlags::REFERENCE) {
            let used_for_reference = match (field, bottom) {
                (false, _) => FRAME,
                (true, false) => TOP_FIELD,
                (true, true) => BOTTOM_FIELD,
            };
            let paired = if second_field {
                self.h264.refs.iter_mut().find(|r| {
                    r.picture
                        .as_ref()
                        .is_some_and(|p| Rc::ptr_eq(p, &current))
                })
            } else {
                None
            };

            match paired {
                Some(reference) => {
                    reference.used_for_reference |= used_for_reference;
                    reference.field_order_cnt[bottom as usize] = unit.order;
                }
                None => {
                    let long_term_frame_idx = unit
                        .flags
                        .contains(PictureFlags::LONG_TERM)
                        .then_some(unit.refresh_frame_flags);
                    if long_term_frame_idx.is_some() {
                        self.h264
                            .refs
                            .retain(|r| r.long_term_frame_idx != long_term_frame_idx);
                    }
                    self.h264.sliding_window(max_num_ref_frames);
                    self.h264.refs.push(H264Reference {
                        picture: Some(Rc::clone(&current)),
                        frame_num: unit.frame_num,
                        long_term_frame_idx,
                        used_for_reference,
                        field_order_cnt: curr_field_order_cnt,
                    });
                }
            }
            self.h264.prev_ref_frame_num = unit.frame_num;
        }

        if second_field {
            if let Some(first) = self.h264.first_field.take() {
                self.display.push(
                    PendingPicture {
                        order: first.order.min(unit.order),
                        picture: current,
                        timestamp: first.timestamp,
                    },
                    client,
                )?;
            }
        } else if field {
            self.h264.first_field = Some(FirstField {
                picture: current,
                frame_num: unit.frame_num,
                bottom,
                order: unit.order,
                timestamp,
            });
        } else {
            self.display.push(
                PendingPicture {
                    order: unit.order,
                    picture: current,
                    timestamp,
                },
                client,
            )?;
        }

        Ok(())
    }

    fn parse_h265(
        &mut self,
        seq: &SequenceUnit,
        unit: PictureUnit,
        timestamp: u64,
        client: &mut dyn VideoDecodeClient,
    ) -> DecodeResult<()> {
        let pps = self.parameter_set(ParameterSetKind::H265Pps, unit.parameter_set_id)?;
        let sps = self.parameter_set(
            ParameterSetKind::H265Sps,
            pps.sps_id().unwrap_or_default(),
        )?;
        let vps = self.parameter_set(
            ParameterSetKind::H265Vps,
            pps.vps_id().unwrap_or_default(),
        )?;
        let idr = unit.flags.contains(PictureFlags::IDR);
        if unit.rps.len() > MAX_NUM_REF_PICS {
            return Err(invalid(format!(
                "reference picture set of {} pictures",
                unit.rps.len()
            )));
        }

        if idr {
            self.display.flush(client)?;
            self.h265.clear();
        } else {
            // Pictures left out of the reference picture set are no longer references.
            self.h265.retain(|r| {
                unit.rps
                    .iter()
                    .any(|e| e.pic_order_cnt == r.pic_order_cnt)
            });
            for reference in self.h265.iter_mut() {
                reference.long_term = unit
                    .rps
                    .iter()
                    .any(|e| e.pic_order_cnt == reference.pic_order_cnt && e.long_term);
            }
        }

        let mut data = H265PictureData {
            vps,
            sps,
            pps,
            irap_pic_flag: unit.picture_type == PictureType::Intra,
            idr_pic_flag: idr,
            curr_pic_order_cnt_val: unit.order,
            ref_pics: Default::default(),
            pic_order_cnt_val: [0; MAX_NUM_REF_PICS],
            is_long_term: [false; MAX_NUM_REF_PICS],
            ref_pic_set_st_curr_before: Vec::new(),
            ref_pic_set_st_curr_after: Vec::new(),
            ref_pic_set_lt_curr: Vec::new(),
        };
        for (i, entry) in unit.rps.iter().enumerate() {
            let reference = self
                .h265
                .iter()
                .find(|r| r.pic_order_cnt == entry.pic_order_cnt);
            let Some(reference) = reference else {
                if entry.used_by_curr {
                    return Err(invalid(format!(
                        "missing reference picture with POC {}",
                        entry.pic_order_cnt
                    )));
                }
                debug!("reference picture with POC {} is missing", entry.pic_order_cnt);
                continue;
            };

            data.ref_pics[i] = Some(Rc::clone(&reference.picture));
            data.pic_order_cnt_val[i] = entry.pic_order_cnt;
            data.is_long_term[i] = entry.long_term;
            if !entry.used_by_curr {
                continue;
            }
            let list = if entry.long_term {
                &mut data.ref_pic_set_lt_curr
            } else if entry.pic_order_cnt < unit.order {
                &mut data.ref_pic_set_st_curr_before
            } else {
                &mut data.ref_pic_set_st_curr_after
            };
            list.push(i as u8);
        }

        let current = client.alloc_picture_buffer(seq.coded_extent)?;
        self.submit(
            client,
            &unit,
            &current,
            CodecPictureData::H265(data),
            timestamp,
            false,
        )?;

        if unit.flags.contains(PictureFlags::REFERENCE) {
            self.h265.push(H265Reference {
                picture: Rc::clone(&current),
                pic_order_cnt: unit.order,
                long_term: false,
            });
        }
        self.display.push(
            PendingPicture {
                order: unit.order,
                picture: current,
                timestamp,
            },
            client,
        )
    }

    /// AV1 and VP9 frames.
    fn parse_store_frame(
        &mut self,
        seq: &SequenceUnit,
        unit: PictureUnit,
        timestamp: u64,
        client: &mut dyn VideoDecodeClient,
    ) -> DecodeResult<()> {
        if unit.picture_type == PictureType::ShowExisting {
            let idx = unit.ref_frame_idx[0] as usize;
            let entry = self
                .store
                .get(idx)
                .cloned()
                .flatten()
                .ok_or_else(|| invalid(format!("showing empty reference frame {}", idx)))?;
            trace!("showing existing frame {}", idx);
            return client.display_picture(&entry.picture, timestamp);
        }

        let ref_frames: [Option<PictureBuffer>; NUM_REF_FRAMES] =
            std::array::from_fn(|i| self.store[i].as_ref().map(|e| Rc::clone(&e.picture)));
        let ref_order_hint: [u8; NUM_REF_FRAMES] =
            std::array::from_fn(|i| self.store[i].as_ref().map_or(0, |e| e.order_hint));
        let show_frame = unit.flags.contains(PictureFlags::SHOW);
        let order_hint = unit.order as u8;

        let codec = match seq.codec {
            CodecOperation::DecodeAv1 => {
                let frame_type = match unit.picture_type {
                    PictureType::Intra => Av1FrameType::KeyFrame,
                    PictureType::IntraOnly => Av1FrameType::IntraOnlyFrame,
                    PictureType::Switch => Av1FrameType::SwitchFrame,
                    _ => Av1FrameType::InterFrame,
                };
                CodecPictureData::Av1(Av1PictureData {
                    sequence_header: self
                        .parameter_set(ParameterSetKind::Av1SequenceHeader, 0)?,
                    frame_type,
                    show_frame,
                    order_hint,
                    refresh_frame_flags: unit.refresh_frame_flags,
                    ref_frame_idx: unit.ref_frame_idx,
                    ref_frames,
                    ref_order_hint,
                    apply_grain: seq.film_grain && unit.flags.contains(PictureFlags::FILM_GRAIN),
                })
            }
            _ => {
                let mut ref_frame_idx = [0; 3];
                ref_frame_idx.copy_from_slice(&unit.ref_frame_idx[..3]);
                CodecPictureData::Vp9(Vp9PictureData {
                    profile: seq.std_profile,
                    frame_type: if unit.picture_type == PictureType::Intra {
                        Vp9FrameType::KeyFrame
                    } else {
                        Vp9FrameType::InterFrame
                    },
                    intra_only: unit.picture_type == PictureType::IntraOnly,
                    show_frame,
                    refresh_frame_flags: unit.refresh_frame_flags,
                    ref_frame_idx,
                    ref_frames,
                })
            }
        };

        let current = client.alloc_picture_buffer(seq.coded_extent)?;
        self.submit(client, &unit, &current, codec, timestamp, false)?;

        for (i, entry) in self.store.iter_mut().enumerate() {
            if unit.refresh_frame_flags & (1 << i) != 0 {
                *entry = Some(StoreEntry {
                    picture: Rc::clone(&current),
                    order_hint,
                });
            }
        }
        if show_frame {
            client.display_picture(&current, timestamp)?;
        }

        Ok(())
    }
}

impl VideoParser for SyntheticParser {
    fn parse_packet(
        &mut self,
        packet: &BitstreamPacket,
        client: &mut dyn VideoDecodeClient,
    ) -> DecodeResult<()> {
        for unit in UnitIterator::new(packet.data) {
            self.parse_unit(unit, packet.timestamp, client)?;
        }
        if packet.end_of_stream {
            self.end_sequence(client)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::codec::synthesizer::RpsEntry;
    use crate::codec::synthesizer::StreamSynthesizer;
    use crate::decoder::base::VideoBaseDecoder;
    use crate::decoder::bitstream::SharedBitstreamBuffer;
    use crate::decoder::parameters::SessionParameters;
    use crate::device::emulated::EmulatedDevice;
    use crate::Resolution;

    #[derive(Debug, PartialEq)]
    struct Decoded {
        picture: usize,
        second_field: bool,
        /// Frame index or POC of each reference, and whether it is a non-existing frame.
        references: Vec<(i32, bool)>,
    }

    /// Forwards everything to a decoder, recording what the parser asked for. Displayed pictures
    /// are only recorded.
    struct Recorder {
        decoder: VideoBaseDecoder,
        decoded: Vec<Decoded>,
        displayed: Vec<(u64, usize)>,
        unhandled: usize,
    }

    impl Recorder {
        fn new(codec: CodecOperation) -> Self {
            let device = EmulatedDevice::new(Default::default());
            Self {
                decoder: VideoBaseDecoder::new(device, codec, Default::default()),
                decoded: Vec::new(),
                displayed: Vec::new(),
                unhandled: 0,
            }
        }

        fn displayed_timestamps(&self) -> Vec<u64> {
            self.displayed.iter().map(|(ts, _)| *ts).collect()
        }
    }

    impl VideoDecodeClient for Recorder {
        fn begin_sequence(&mut self, info: &SequenceInfo) -> DecodeResult<u32> {
            self.decoder.begin_sequence(info)
        }

        fn alloc_picture_buffer(&mut self, extent: Resolution) -> DecodeResult<PictureBuffer> {
            self.decoder.alloc_picture_buffer(extent)
        }

        fn decode_picture(&mut self, picture: &PictureData) -> DecodeResult<()> {
            let references = match &picture.codec {
                CodecPictureData::H264(h264) => h264
                    .dpb
                    .iter()
                    .map(|e| (e.frame_idx, e.not_existing))
                    .collect(),
                CodecPictureData::H265(h265) => h265
                    .ref_pics
                    .iter()
                    .zip(h265.pic_order_cnt_val)
                    .filter(|(p, _)| p.is_some())
                    .map(|(_, poc)| (poc, false))
                    .collect(),
                _ => Vec::new(),
            };
            self.decoded.push(Decoded {
                picture: picture.current.index(),
                second_field: picture.second_field,
                references,
            });
            self.decoder.decode_picture(picture)
        }

        fn update_picture_parameters(
            &mut self,
            set: &Rc<StdParameterSet>,
        ) -> DecodeResult<Rc<RefCell<SessionParameters>>> {
            self.decoder.update_picture_parameters(set)
        }

        fn display_picture(&mut self, picture: &PictureBuffer, timestamp: u64) -> DecodeResult<()> {
            self.displayed.push((timestamp, picture.index()));
            Ok(())
        }

        fn unhandled_nalu(&mut self, _data: &[u8]) {
            self.unhandled += 1;
        }

        fn get_bitstream_buffer(
            &mut self,
            size: usize,
            data: &[u8],
        ) -> DecodeResult<SharedBitstreamBuffer> {
            self.decoder.get_bitstream_buffer(size, data)
        }
    }

    /// Parses `synth` one access unit at a time, using the decode index as timestamp.
    fn run(synth: &StreamSynthesizer) -> (Recorder, SyntheticParser) {
        let _ = env_logger::try_init();
        let mut recorder = Recorder::new(synth.profile().codec);
        let mut parser = SyntheticParser::new();
        let access_units = synth.access_units();
        for (timestamp, data) in access_units.iter().enumerate() {
            let packet = BitstreamPacket {
                data,
                timestamp: timestamp as u64,
                end_of_stream: false,
            };
            parser.parse_packet(&packet, &mut recorder).unwrap();
        }
        let eos = BitstreamPacket {
            data: &[],
            timestamp: access_units.len() as u64,
            end_of_stream: true,
        };
        parser.parse_packet(&eos, &mut recorder).unwrap();

        (recorder, parser)
    }

    fn units(units: &[SyntheticUnit]) -> Vec<u8> {
        let mut out = Vec::new();
        for unit in units {
            unit.write_into(&mut out);
        }
        out
    }

    #[test]
    fn h264_b_frames_are_reordered() {
        let synth = StreamSynthesizer::new(CodecOperation::DecodeH264, (176, 144).into())
            .num_frames(7)
            .gop_size(7)
            .b_frames(2);
        let (recorder, parser) = run(&synth);

        assert_eq!(parser.pictures_parsed(), 7);
        assert_eq!(recorder.displayed_timestamps(), vec![0, 2, 3, 1, 5, 6, 4]);
    }

    #[test]
    fn h264_sliding_window() {
        let synth = StreamSynthesizer::new(CodecOperation::DecodeH264, (176, 144).into())
            .num_frames(5)
            .max_refs(2);
        let (recorder, _) = run(&synth);

        let frame_idx = recorder
            .decoded
            .iter()
            .map(|d| d.references.iter().map(|r| r.0).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        assert_eq!(
            frame_idx,
            vec![vec![], vec![0], vec![0, 1], vec![1, 2], vec![2, 3]]
        );
    }

    #[test]
    fn h264_gap_inserts_non_existing_frames() {
        let synth = StreamSynthesizer::new(CodecOperation::DecodeH264, (176, 144).into())
            .num_frames(4)
            .frame_num_gap_at(1);
        let (recorder, _) = run(&synth);

        assert_eq!(recorder.decoded.len(), 4);
        assert_eq!(
            recorder.decoded[2].references,
            vec![(0, false), (1, false), (2, true)]
        );
        assert_eq!(
            recorder.decoded[3].references,
            vec![(0, false), (1, false), (2, true), (3, false)]
        );
        assert_eq!(recorder.displayed.len(), 4);
    }

    #[test]
    fn h264_long_term_reference_survives_the_window() {
        let synth = StreamSynthesizer::new(CodecOperation::DecodeH264, (176, 144).into())
            .num_frames(5)
            .max_refs(1)
            .long_term_reference(true);
        let (recorder, _) = run(&synth);

        // The IDR picture is long-term frame index 0.
        assert_eq!(recorder.decoded[4].references, vec![(0, false), (3, false)]);
    }

    #[test]
    fn h264_fields_share_a_picture() {
        let synth = StreamSynthesizer::new(CodecOperation::DecodeH264, (176, 144).into())
            .num_frames(3)
            .interlaced(true);
        let (recorder, parser) = run(&synth);

        assert_eq!(parser.pictures_parsed(), 6);
        let decoded = &recorder.decoded;
        for pair in decoded.chunks(2) {
            assert_eq!(pair[0].picture, pair[1].picture);
            assert!(!pair[0].second_field);
            assert!(pair[1].second_field);
        }
        // The second field sees the first one as a reference.
        assert_eq!(decoded[1].references, vec![(0, false)]);
        assert_eq!(recorder.displayed_timestamps(), vec![0, 2, 4]);
        assert_eq!(recorder.displayed[1].1, decoded[2].picture);
    }

    #[test]
    fn h265_references_follow_the_rps() {
        let synth = StreamSynthesizer::new(CodecOperation::DecodeH265, (176, 144).into())
            .num_frames(6)
            .gop_size(6)
            .max_refs(2)
            .b_frames(1);
        let (recorder, _) = run(&synth);

        let pocs = recorder
            .decoded
            .iter()
            .map(|d| d.references.iter().map(|r| r.0).collect::<Vec<_>>())
            .collect::<Vec<_>>();
        // Decode order is I0 P4 B2 P8 B6 P10.
        assert_eq!(
            pocs,
            vec![vec![], vec![0], vec![0, 4], vec![0, 4], vec![4, 8], vec![4, 8]]
        );
        assert_eq!(recorder.displayed_timestamps(), vec![0, 2, 1, 4, 3, 5]);
    }

    #[test]
    fn h265_missing_reference_is_an_error() {
        let seq = SequenceUnit {
            codec: CodecOperation::DecodeH265,
            std_profile: 1,
            chroma_subsampling: Default::default(),
            bit_depth_luma_minus8: 0,
            bit_depth_chroma_minus8: 0,
            progressive: true,
            coded_extent: (176, 144).into(),
            max_num_refs: 2,
            num_reorder_frames: 0,
            film_grain: false,
        };
        let set = |kind| {
            SyntheticUnit::ParameterSet(ParameterSetUnit {
                kind,
                vps_id: 0,
                sps_id: 0,
                pps_id: 0,
                update_sequence_count: 0,
            })
        };
        let stream = units(&[
            SyntheticUnit::Sequence(seq),
            set(ParameterSetKind::H265Vps),
            set(ParameterSetKind::H265Sps),
            set(ParameterSetKind::H265Pps),
            SyntheticUnit::Picture(PictureUnit {
                picture_type: PictureType::Inter,
                flags: PictureFlags::REFERENCE | PictureFlags::SHOW,
                order: 8,
                rps: vec![RpsEntry {
                    pic_order_cnt: 4,
                    used_by_curr: true,
                    long_term: false,
                }],
                payload: vec![1, 2, 3],
                ..Default::default()
            }),
        ]);

        let mut recorder = Recorder::new(CodecOperation::DecodeH265);
        let packet = BitstreamPacket {
            data: &stream,
            timestamp: 0,
            end_of_stream: false,
        };
        assert!(matches!(
            SyntheticParser::new().parse_packet(&packet, &mut recorder),
            Err(DecodeError::InvalidParameters(_))
        ));
    }

    #[test]
    fn av1_shows_hidden_frames() {
        let synth = StreamSynthesizer::new(CodecOperation::DecodeAv1, (176, 144).into())
            .num_frames(5)
            .hidden_frames(true);
        let (recorder, parser) = run(&synth);

        assert_eq!(parser.pictures_parsed(), 5);
        assert_eq!(recorder.displayed_timestamps(), vec![0, 2, 3, 4, 5]);
        // The last frame shown is the hidden one.
        assert_eq!(recorder.displayed[4].1, recorder.decoded[1].picture);
    }

    #[test]
    fn vp9_frames_are_shown_in_decode_order() {
        let synth = StreamSynthesizer::new(CodecOperation::DecodeVp9, (176, 144).into())
            .num_frames(10)
            .gop_size(4);
        let (recorder, parser) = run(&synth);

        assert_eq!(parser.pictures_parsed(), 10);
        assert_eq!(
            recorder.displayed_timestamps(),
            (0..10).collect::<Vec<u64>>()
        );
    }

    #[test]
    fn unknown_units_go_to_the_client() {
        let stream = units(&[SyntheticUnit::Unknown(0x30), SyntheticUnit::Unknown(0x31)]);
        let mut recorder = Recorder::new(CodecOperation::DecodeVp9);
        let packet = BitstreamPacket {
            data: &stream,
            timestamp: 0,
            end_of_stream: true,
        };
        SyntheticParser::new()
            .parse_packet(&packet, &mut recorder)
            .unwrap();
        assert_eq!(recorder.unhandled, 2);
    }

    #[test]
    fn pictures_need_a_sequence() {
        let stream = units(&[SyntheticUnit::Picture(PictureUnit {
            payload: vec![1],
            ..Default::default()
        })]);
        let mut recorder = Recorder::new(CodecOperation::DecodeVp9);
        let packet = BitstreamPacket {
            data: &stream,
            timestamp: 0,
            end_of_stream: false,
        };
        assert!(SyntheticParser::new()
            .parse_packet(&packet, &mut recorder)
            .is_err());
    }
}
