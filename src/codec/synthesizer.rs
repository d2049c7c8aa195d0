// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A compact synthetic elementary stream, and a generator for it.
//!
//! Conformance tests need streams exercising the reference structures of every codec without
//! carrying real clips around. A synthetic stream describes, for each picture, exactly what a
//! real parser would have derived from the slice headers: picture type, order count, frame
//! number, reference picture set and reference store updates. Pictures carry an opaque payload
//! standing in for the slice data.
//!
//! Units use Annex-B framing: a 4-byte start code followed by the escaped unit. The first byte of
//! a unit is its type, followed by a big-endian body:
//!
//! * `0x01` sequence: codec, profile, chroma, bit depths, progressive, width, height, number of
//!   references, reorder depth, film grain.
//! * `0x02` parameter set: kind, VPS, SPS and PPS IDs, update sequence count.
//! * `0x03` picture: type, flags, order, frame number, parameter set ID, refresh flags, 7
//!   reference indices, the reference picture set and the payload.
//! * `0x04` end of sequence.

use std::io::Cursor;
use std::io::Read;

use anyhow::anyhow;
use anyhow::Context;
use bitflags::bitflags;
use byteorder::BigEndian;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use enumn::N;
use rand::rngs::StdRng;
use rand::Rng;
use rand::RngCore;
use rand::SeedableRng;

use crate::bitstream_utils::escape_unit;
use crate::bitstream_utils::write_ivf;
use crate::bitstream_utils::IvfFileHeader;
use crate::bitstream_utils::START_CODE;
use crate::codec::ParameterSetKind;
use crate::ChromaSubsampling;
use crate::CodecOperation;
use crate::Resolution;
use crate::VideoProfile;
use crate::NUM_REF_FRAMES;

/// `frame_num` wraps at this value in synthetic H.264 streams.
pub const MAX_FRAME_NUM: u16 = 256;

/// Number of reference indices carried by each picture unit.
pub const MAX_REF_FRAME_IDX: usize = 7;

#[derive(N, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum UnitType {
    Sequence = 1,
    ParameterSet = 2,
    Picture = 3,
    EndOfSequence = 4,
}

/// Start of a coded video sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceUnit {
    pub codec: CodecOperation,
    pub std_profile: u8,
    pub chroma_subsampling: ChromaSubsampling,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub progressive: bool,
    pub coded_extent: Resolution,
    /// Largest number of reference pictures a picture uses.
    pub max_num_refs: u8,
    /// Number of pictures that may precede another in decode order but follow it in display
    /// order.
    pub num_reorder_frames: u8,
    pub film_grain: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParameterSetUnit {
    pub kind: ParameterSetKind,
    pub vps_id: u8,
    pub sps_id: u8,
    pub pps_id: u8,
    pub update_sequence_count: u32,
}

/// Type of a picture. The meaning of each value depends on the codec.
#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum PictureType {
    /// I picture, AV1 and VP9 key frame.
    #[default]
    Intra = 0,
    /// P or B picture, AV1 and VP9 inter frame.
    Inter = 1,
    /// AV1 and VP9 intra-only frame.
    IntraOnly = 2,
    /// AV1 switch frame.
    Switch = 3,
    /// AV1 and VP9 frame showing a picture of the reference store without decoding anything.
    ShowExisting = 4,
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
    pub struct PictureFlags: u8 {
        const REFERENCE = 1 << 0;
        const IDR = 1 << 1;
        const FIELD = 1 << 2;
        const BOTTOM_FIELD = 1 << 3;
        /// H.264: the picture is marked long-term, with `refresh_frame_flags` as index.
        const LONG_TERM = 1 << 4;
        const SHOW = 1 << 5;
        const FILM_GRAIN = 1 << 6;
    }
}

/// An entry of an H.265 reference picture set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RpsEntry {
    pub pic_order_cnt: i32,
    pub used_by_curr: bool,
    pub long_term: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureUnit {
    pub picture_type: PictureType,
    pub flags: PictureFlags,
    /// Picture order count for H.264 and H.265, order hint for AV1.
    pub order: i32,
    pub frame_num: u16,
    /// PPS the picture refers to.
    pub parameter_set_id: u8,
    /// Reference store slots refreshed by the picture. The long-term frame index for H.264.
    pub refresh_frame_flags: u8,
    pub ref_frame_idx: [u8; MAX_REF_FRAME_IDX],
    pub rps: Vec<RpsEntry>,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyntheticUnit {
    Sequence(SequenceUnit),
    ParameterSet(ParameterSetUnit),
    Picture(PictureUnit),
    EndOfSequence,
    /// A unit of a type this format does not define.
    Unknown(u8),
}

impl SyntheticUnit {
    /// Writes the unit, start code included, at the end of `out`.
    pub fn write_into(&self, out: &mut Vec<u8>) {
        let mut unit = Vec::new();
        // Writing into a Vec cannot fail.
        let _ = self.write_unescaped(&mut unit);
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(&escape_unit(&unit));
    }

    fn write_unescaped(&self, w: &mut Vec<u8>) -> std::io::Result<()> {
        match self {
            SyntheticUnit::Sequence(seq) => {
                w.write_u8(UnitType::Sequence as u8)?;
                w.write_u8(seq.codec as u8)?;
                w.write_u8(seq.std_profile)?;
                w.write_u8(seq.chroma_subsampling as u8)?;
                w.write_u8(seq.bit_depth_luma_minus8)?;
                w.write_u8(seq.bit_depth_chroma_minus8)?;
                w.write_u8(seq.progressive as u8)?;
                w.write_u16::<BigEndian>(seq.coded_extent.width as u16)?;
                w.write_u16::<BigEndian>(seq.coded_extent.height as u16)?;
                w.write_u8(seq.max_num_refs)?;
                w.write_u8(seq.num_reorder_frames)?;
                w.write_u8(seq.film_grain as u8)?;
            }
            SyntheticUnit::ParameterSet(set) => {
                w.write_u8(UnitType::ParameterSet as u8)?;
                w.write_u8(set.kind as u8)?;
                w.write_u8(set.vps_id)?;
                w.write_u8(set.sps_id)?;
                w.write_u8(set.pps_id)?;
                w.write_u32::<BigEndian>(set.update_sequence_count)?;
            }
            SyntheticUnit::Picture(pic) => {
                w.write_u8(UnitType::Picture as u8)?;
                w.write_u8(pic.picture_type as u8)?;
                w.write_u8(pic.flags.bits())?;
                w.write_i32::<BigEndian>(pic.order)?;
                w.write_u16::<BigEndian>(pic.frame_num)?;
                w.write_u8(pic.parameter_set_id)?;
                w.write_u8(pic.refresh_frame_flags)?;
                w.extend_from_slice(&pic.ref_frame_idx);
                w.write_u8(pic.rps.len() as u8)?;
                for entry in &pic.rps {
                    w.write_i32::<BigEndian>(entry.pic_order_cnt)?;
                    w.write_u8(entry.used_by_curr as u8 | (entry.long_term as u8) << 1)?;
                }
                w.write_u16::<BigEndian>(pic.payload.len() as u16)?;
                w.extend_from_slice(&pic.payload);
            }
            SyntheticUnit::EndOfSequence => w.write_u8(UnitType::EndOfSequence as u8)?,
            SyntheticUnit::Unknown(unit_type) => w.write_u8(*unit_type)?,
        }

        Ok(())
    }

    /// Parses an unescaped unit, start code excluded.
    pub fn parse(unit: &[u8]) -> anyhow::Result<Self> {
        let mut r = Cursor::new(unit);
        let unit_type = r.read_u8().context("empty unit")?;
        let Some(unit_type) = UnitType::n(unit_type) else {
            return Ok(SyntheticUnit::Unknown(unit_type));
        };

        let unit = match unit_type {
            UnitType::Sequence => {
                let codec = r.read_u8()?;
                let codec = CodecOperation::n(codec)
                    .ok_or_else(|| anyhow!("invalid codec {}", codec))?;
                let std_profile = r.read_u8()?;
                let chroma = r.read_u8()?;
                let chroma_subsampling = ChromaSubsampling::n(chroma)
                    .ok_or_else(|| anyhow!("invalid chroma subsampling {}", chroma))?;
                SyntheticUnit::Sequence(SequenceUnit {
                    codec,
                    std_profile,
                    chroma_subsampling,
                    bit_depth_luma_minus8: r.read_u8()?,
                    bit_depth_chroma_minus8: r.read_u8()?,
                    progressive: r.read_u8()? != 0,
                    coded_extent: Resolution {
                        width: r.read_u16::<BigEndian>()? as u32,
                        height: r.read_u16::<BigEndian>()? as u32,
                    },
                    max_num_refs: r.read_u8()?,
                    num_reorder_frames: r.read_u8()?,
                    film_grain: r.read_u8()? != 0,
                })
            }
            UnitType::ParameterSet => {
                let kind = r.read_u8()?;
                let kind = ParameterSetKind::n(kind)
                    .ok_or_else(|| anyhow!("invalid parameter set kind {}", kind))?;
                SyntheticUnit::ParameterSet(ParameterSetUnit {
                    kind,
                    vps_id: r.read_u8()?,
                    sps_id: r.read_u8()?,
                    pps_id: r.read_u8()?,
                    update_sequence_count: r.read_u32::<BigEndian>()?,
                })
            }
            UnitType::Picture => {
                let picture_type = r.read_u8()?;
                let picture_type = PictureType::n(picture_type)
                    .ok_or_else(|| anyhow!("invalid picture type {}", picture_type))?;
                let flags = PictureFlags::from_bits_truncate(r.read_u8()?);
                let order = r.read_i32::<BigEndian>()?;
                let frame_num = r.read_u16::<BigEndian>()?;
                let parameter_set_id = r.read_u8()?;
                let refresh_frame_flags = r.read_u8()?;
                let mut ref_frame_idx = [0; MAX_REF_FRAME_IDX];
                r.read_exact(&mut ref_frame_idx)?;

                let num_rps = r.read_u8()?;
                let mut rps = Vec::with_capacity(num_rps as usize);
                for _ in 0..num_rps {
                    let pic_order_cnt = r.read_i32::<BigEndian>()?;
                    let flags = r.read_u8()?;
                    rps.push(RpsEntry {
                        pic_order_cnt,
                        used_by_curr: flags & 1 != 0,
                        long_term: flags & 2 != 0,
                    });
                }

                let payload_len = r.read_u16::<BigEndian>()?;
                let mut payload = vec![0; payload_len as usize];
                r.read_exact(&mut payload)
                    .context("picture payload is truncated")?;

                SyntheticUnit::Picture(PictureUnit {
                    picture_type,
                    flags,
                    order,
                    frame_num,
                    parameter_set_id,
                    refresh_frame_flags,
                    ref_frame_idx,
                    rps,
                    payload,
                })
            }
            UnitType::EndOfSequence => SyntheticUnit::EndOfSequence,
        };

        Ok(unit)
    }
}

/// Generates synthetic streams.
///
/// H.264 and H.265 streams are made of GOPs starting with an IDR picture, with `b_frames`
/// non-reference B pictures between P pictures. AV1 and VP9 streams start each GOP with a key
/// frame refreshing the whole reference store, and rotate inter frames over the first three
/// store slots.
#[derive(Clone, Debug)]
pub struct StreamSynthesizer {
    codec: CodecOperation,
    extent: Resolution,
    num_frames: usize,
    gop_size: usize,
    b_frames: usize,
    max_refs: u8,
    chroma_subsampling: ChromaSubsampling,
    bit_depth_minus8: u8,
    interlaced: bool,
    long_term_reference: bool,
    frame_num_gap_at: Option<usize>,
    film_grain: bool,
    hidden_frames: bool,
    resolution_change: Option<(usize, Resolution)>,
    parameter_updates: bool,
    seed: u64,
}

/// State of the picture being generated within a sequence.
#[derive(Default)]
struct SegmentState {
    /// Pictures generated so far, in decode order.
    pictures: Vec<PictureUnit>,
    next_frame_num: u16,
    ref_pocs: Vec<i32>,
    long_term_poc: Option<i32>,
    inter_frames: usize,
}

impl StreamSynthesizer {
    pub fn new(codec: CodecOperation, extent: Resolution) -> Self {
        Self {
            codec,
            extent,
            num_frames: 30,
            gop_size: 15,
            b_frames: 0,
            max_refs: 4,
            chroma_subsampling: ChromaSubsampling::Yuv420,
            bit_depth_minus8: 0,
            interlaced: false,
            long_term_reference: false,
            frame_num_gap_at: None,
            film_grain: false,
            hidden_frames: false,
            resolution_change: None,
            parameter_updates: false,
            seed: 0,
        }
    }

    /// Number of frames displayed by the stream.
    pub fn num_frames(mut self, num_frames: usize) -> Self {
        self.num_frames = num_frames;
        self
    }

    pub fn gop_size(mut self, gop_size: usize) -> Self {
        self.gop_size = gop_size.max(1);
        self
    }

    /// H.264 and H.265: number of B pictures between two P pictures.
    pub fn b_frames(mut self, b_frames: usize) -> Self {
        self.b_frames = b_frames;
        self
    }

    /// H.264 and H.265: number of reference pictures kept.
    pub fn max_refs(mut self, max_refs: u8) -> Self {
        self.max_refs = max_refs.clamp(1, 8);
        self
    }

    pub fn chroma_subsampling(mut self, chroma_subsampling: ChromaSubsampling) -> Self {
        self.chroma_subsampling = chroma_subsampling;
        self
    }

    pub fn bit_depth(mut self, bit_depth: u8) -> Self {
        self.bit_depth_minus8 = bit_depth.saturating_sub(8);
        self
    }

    /// H.264: codes every frame as a pair of fields. B pictures are not used.
    pub fn interlaced(mut self, interlaced: bool) -> Self {
        self.interlaced = interlaced;
        self
    }

    /// H.264 and H.265: keeps each IDR picture as a long-term reference for its GOP.
    pub fn long_term_reference(mut self, long_term_reference: bool) -> Self {
        self.long_term_reference = long_term_reference;
        self
    }

    /// H.264: skips a `frame_num` value before the `n`-th P picture of the stream.
    pub fn frame_num_gap_at(mut self, n: usize) -> Self {
        self.frame_num_gap_at = Some(n);
        self
    }

    /// AV1: applies film grain to every frame.
    pub fn film_grain(mut self, film_grain: bool) -> Self {
        self.film_grain = film_grain;
        self
    }

    /// AV1 and VP9: codes every fourth frame ahead of time as a hidden frame, displayed later by
    /// a show-existing frame.
    pub fn hidden_frames(mut self, hidden_frames: bool) -> Self {
        self.hidden_frames = hidden_frames;
        self
    }

    /// Starts a new sequence of `extent` at displayed frame `at`.
    pub fn resolution_change(mut self, at: usize, extent: Resolution) -> Self {
        self.resolution_change = Some((at, extent));
        self
    }

    /// Resends the parameter sets with a new update sequence count at every GOP.
    pub fn parameter_updates(mut self, parameter_updates: bool) -> Self {
        self.parameter_updates = parameter_updates;
        self
    }

    /// Seed of the payload generator.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn interlaced_h264(&self) -> bool {
        self.interlaced && self.codec == CodecOperation::DecodeH264
    }

    fn uses_b_frames(&self) -> bool {
        matches!(
            self.codec,
            CodecOperation::DecodeH264 | CodecOperation::DecodeH265
        ) && !self.interlaced_h264()
    }

    fn std_profile(&self) -> u8 {
        match self.codec {
            CodecOperation::DecodeH264 if self.interlaced_h264() => crate::h264_profile::HIGH as u8,
            CodecOperation::DecodeH264 => crate::h264_profile::MAIN as u8,
            CodecOperation::DecodeH265 => 1,
            CodecOperation::DecodeAv1 | CodecOperation::DecodeVp9 => 0,
        }
    }

    /// Profile a decoder of the generated stream needs.
    pub fn profile(&self) -> VideoProfile {
        VideoProfile {
            chroma_subsampling: self.chroma_subsampling,
            luma_bit_depth: 8 + self.bit_depth_minus8,
            chroma_bit_depth: 8 + self.bit_depth_minus8,
            interlaced: self.interlaced_h264(),
            film_grain: self.film_grain && self.codec == CodecOperation::DecodeAv1,
            ..VideoProfile::new(self.codec, self.std_profile() as u32)
        }
    }

    fn sequence_unit(&self, extent: Resolution) -> SequenceUnit {
        let (max_num_refs, num_reorder_frames) = match self.codec {
            CodecOperation::DecodeH264 | CodecOperation::DecodeH265 => (
                self.max_refs + self.long_term_reference as u8,
                if self.uses_b_frames() {
                    self.b_frames as u8
                } else {
                    0
                },
            ),
            CodecOperation::DecodeAv1 | CodecOperation::DecodeVp9 => (NUM_REF_FRAMES as u8, 0),
        };

        SequenceUnit {
            codec: self.codec,
            std_profile: self.std_profile(),
            chroma_subsampling: self.chroma_subsampling,
            bit_depth_luma_minus8: self.bit_depth_minus8,
            bit_depth_chroma_minus8: self.bit_depth_minus8,
            progressive: !self.interlaced_h264(),
            coded_extent: extent,
            max_num_refs,
            num_reorder_frames,
            film_grain: self.film_grain && self.codec == CodecOperation::DecodeAv1,
        }
    }

    fn parameter_sets(&self, update_sequence_count: u32) -> Vec<SyntheticUnit> {
        let set = |kind, pps_id| {
            SyntheticUnit::ParameterSet(ParameterSetUnit {
                kind,
                vps_id: 0,
                sps_id: 0,
                pps_id,
                update_sequence_count,
            })
        };

        match self.codec {
            CodecOperation::DecodeH264 => vec![
                set(ParameterSetKind::H264Sps, 0),
                set(ParameterSetKind::H264Pps, 0),
                set(ParameterSetKind::H264Pps, 1),
            ],
            CodecOperation::DecodeH265 => vec![
                set(ParameterSetKind::H265Vps, 0),
                set(ParameterSetKind::H265Sps, 0),
                set(ParameterSetKind::H265Pps, 0),
                set(ParameterSetKind::H265Pps, 1),
            ],
            CodecOperation::DecodeAv1 => vec![set(ParameterSetKind::Av1SequenceHeader, 0)],
            CodecOperation::DecodeVp9 => vec![],
        }
    }

    fn payload(&self, rng: &mut StdRng) -> Vec<u8> {
        let mut payload = vec![0; rng.gen_range(32..256)];
        rng.fill_bytes(&mut payload);
        payload
    }

    /// Generates the units of the stream.
    pub fn units(&self) -> Vec<SyntheticUnit> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut units = Vec::new();
        let mut segments = vec![(0, self.extent)];
        if let Some((at, extent)) = self.resolution_change {
            if at > 0 && at < self.num_frames {
                segments.push((at, extent));
            }
        }
        let mut update_sequence_count = 0;
        let mut p_pictures = 0;

        for (i, &(start, extent)) in segments.iter().enumerate() {
            let end = segments
                .get(i + 1)
                .map(|&(start, _)| start)
                .unwrap_or(self.num_frames);
            units.push(SyntheticUnit::Sequence(self.sequence_unit(extent)));
            units.extend(self.parameter_sets(update_sequence_count));
            update_sequence_count += 1;

            let mut state = SegmentState::default();
            let mut gop_start = 0;
            while gop_start < end - start {
                let gop_end = (gop_start + self.gop_size).min(end - start);
                if gop_start > 0 && self.parameter_updates {
                    units.extend(self.parameter_sets(update_sequence_count));
                    update_sequence_count += 1;
                }
                match self.codec {
                    CodecOperation::DecodeH264 | CodecOperation::DecodeH265 => self.gop_h26x(
                        &mut state,
                        gop_start,
                        gop_end,
                        &mut p_pictures,
                        &mut rng,
                    ),
                    CodecOperation::DecodeAv1 | CodecOperation::DecodeVp9 => {
                        self.gop_store(&mut state, gop_start, gop_end, &mut rng)
                    }
                }
                units.extend(state.pictures.drain(..).map(SyntheticUnit::Picture));
                gop_start = gop_end;
            }
            units.push(SyntheticUnit::EndOfSequence);
        }

        units
    }

    /// Emits the pictures of the GOP covering displayed frames `start..end` of a segment.
    fn gop_h26x(
        &self,
        state: &mut SegmentState,
        start: usize,
        end: usize,
        p_pictures: &mut usize,
        rng: &mut StdRng,
    ) {
        state.next_frame_num = 0;
        state.ref_pocs.clear();
        state.long_term_poc = None;

        self.h26x_picture(state, PictureType::Intra, start, start, true, rng);
        let step = if self.uses_b_frames() {
            self.b_frames + 1
        } else {
            1
        };

        let mut pos = start;
        while pos + 1 < end {
            let anchor = pos + step;
            if anchor >= end {
                for tail in pos + 1..end {
                    self.h26x_p_picture(state, start, tail, p_pictures, rng);
                }
                break;
            }
            self.h26x_p_picture(state, start, anchor, p_pictures, rng);
            for b in pos + 1..anchor {
                self.h26x_picture(state, PictureType::Inter, start, b, false, rng);
            }
            pos = anchor;
        }
    }

    fn h26x_p_picture(
        &self,
        state: &mut SegmentState,
        gop_start: usize,
        pos: usize,
        p_pictures: &mut usize,
        rng: &mut StdRng,
    ) {
        if self.frame_num_gap_at == Some(*p_pictures) && self.codec == CodecOperation::DecodeH264 {
            state.next_frame_num = (state.next_frame_num + 1) % MAX_FRAME_NUM;
        }
        *p_pictures += 1;
        self.h26x_picture(state, PictureType::Inter, gop_start, pos, true, rng);
    }

    fn h26x_picture(
        &self,
        state: &mut SegmentState,
        picture_type: PictureType,
        gop_start: usize,
        pos: usize,
        reference: bool,
        rng: &mut StdRng,
    ) {
        let idr = pos == gop_start;
        let poc = 2 * (pos - gop_start) as i32;
        let mut flags = PictureFlags::SHOW;
        flags.set(PictureFlags::REFERENCE, reference);
        flags.set(PictureFlags::IDR, idr);
        let long_term = idr && self.long_term_reference;
        let parameter_set_id = u8::from(!idr && reference);

        let mut picture = PictureUnit {
            picture_type,
            flags,
            order: poc,
            frame_num: if idr { 0 } else { state.next_frame_num },
            parameter_set_id,
            ..Default::default()
        };

        if self.codec == CodecOperation::DecodeH265 {
            if !idr {
                picture.rps = state
                    .long_term_poc
                    .iter()
                    .map(|&poc| RpsEntry {
                        pic_order_cnt: poc,
                        used_by_curr: true,
                        long_term: true,
                    })
                    .chain(state.ref_pocs.iter().map(|&poc| RpsEntry {
                        pic_order_cnt: poc,
                        used_by_curr: true,
                        long_term: false,
                    }))
                    .collect();
            }
            if reference {
                if long_term {
                    state.long_term_poc = Some(poc);
                } else {
                    state.ref_pocs.push(poc);
                    let keep = self.max_refs as usize;
                    if state.ref_pocs.len() > keep {
                        state.ref_pocs.drain(..state.ref_pocs.len() - keep);
                    }
                }
            }
        } else {
            picture.flags.set(PictureFlags::LONG_TERM, long_term);
        }

        if self.interlaced_h264() {
            let mut top = picture.clone();
            top.flags |= PictureFlags::FIELD;
            top.payload = self.payload(rng);
            let mut bottom = picture;
            bottom.flags |= PictureFlags::FIELD | PictureFlags::BOTTOM_FIELD;
            bottom.flags.remove(PictureFlags::IDR);
            bottom.order = poc + 1;
            bottom.payload = self.payload(rng);
            state.pictures.push(top);
            state.pictures.push(bottom);
        } else {
            picture.payload = self.payload(rng);
            state.pictures.push(picture);
        }

        if reference {
            let frame_num = if idr { 0 } else { state.next_frame_num };
            state.next_frame_num = (frame_num + 1) % MAX_FRAME_NUM;
        }
    }

    /// Emits the frames of the AV1 or VP9 GOP covering displayed frames `start..end`.
    fn gop_store(&self, state: &mut SegmentState, start: usize, end: usize, rng: &mut StdRng) {
        let mut grain = PictureFlags::empty();
        grain.set(
            PictureFlags::FILM_GRAIN,
            self.film_grain && self.codec == CodecOperation::DecodeAv1,
        );
        // Store slot holding hidden frames.
        let hidden_slot = match self.codec {
            CodecOperation::DecodeAv1 => 6,
            _ => 7,
        };
        let order_hint = |pos: usize| ((pos - start) % 256) as i32;

        state.pictures.push(PictureUnit {
            picture_type: PictureType::Intra,
            flags: PictureFlags::SHOW | PictureFlags::REFERENCE | grain,
            order: order_hint(start),
            refresh_frame_flags: 0xff,
            payload: self.payload(rng),
            ..Default::default()
        });

        let mut inter = |state: &mut SegmentState, pos: usize, show: bool, slot: u8| {
            let mut flags = PictureFlags::REFERENCE | grain;
            flags.set(PictureFlags::SHOW, show);
            state.pictures.push(PictureUnit {
                picture_type: PictureType::Inter,
                flags,
                order: order_hint(pos),
                refresh_frame_flags: 1 << slot,
                ref_frame_idx: [0, 1, 2, 3, 4, 5, 6],
                payload: self.payload(rng),
                ..Default::default()
            });
            if show {
                state.inter_frames += 1;
            }
        };

        let mut pos = start + 1;
        while pos < end {
            if self.hidden_frames && pos + 3 < end {
                inter(state, pos + 3, false, hidden_slot);
                for shown in pos..pos + 3 {
                    let slot = (state.inter_frames % 3) as u8;
                    inter(state, shown, true, slot);
                }
                let mut ref_frame_idx = [0; MAX_REF_FRAME_IDX];
                ref_frame_idx[0] = hidden_slot;
                state.pictures.push(PictureUnit {
                    picture_type: PictureType::ShowExisting,
                    flags: PictureFlags::SHOW,
                    order: order_hint(pos + 3),
                    ref_frame_idx,
                    ..Default::default()
                });
                pos += 4;
            } else {
                let slot = (state.inter_frames % 3) as u8;
                inter(state, pos, true, slot);
                pos += 1;
            }
        }
    }

    /// The stream with each unit preceded by a start code.
    pub fn annexb(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for unit in self.units() {
            unit.write_into(&mut out);
        }
        out
    }

    /// The stream split into access units: each picture unit together with the units preceding
    /// it. Trailing units join the last access unit.
    pub fn access_units(&self) -> Vec<Vec<u8>> {
        let mut access_units = Vec::new();
        let mut current = Vec::new();
        for unit in self.units() {
            let is_picture = matches!(unit, SyntheticUnit::Picture(_));
            unit.write_into(&mut current);
            if is_picture {
                access_units.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            match access_units.last_mut() {
                Some(last) => last.extend_from_slice(&current),
                None => access_units.push(current),
            }
        }

        access_units
    }

    /// The stream in an IVF container, one access unit per frame.
    pub fn ivf(&self) -> Vec<u8> {
        let fourcc = match self.codec {
            CodecOperation::DecodeH264 => IvfFileHeader::CODEC_H264,
            CodecOperation::DecodeH265 => IvfFileHeader::CODEC_H265,
            CodecOperation::DecodeAv1 => IvfFileHeader::CODEC_AV1,
            CodecOperation::DecodeVp9 => IvfFileHeader::CODEC_VP9,
        };
        let access_units = self.access_units();
        write_ivf(
            fourcc,
            self.extent.width as u16,
            self.extent.height as u16,
            access_units.iter().map(Vec::as_slice),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream_utils::unescape_unit;
    use crate::bitstream_utils::UnitIterator;

    fn pictures(synth: &StreamSynthesizer) -> Vec<PictureUnit> {
        synth
            .units()
            .into_iter()
            .filter_map(|unit| match unit {
                SyntheticUnit::Picture(picture) => Some(picture),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn units_survive_framing() {
        let synth = StreamSynthesizer::new(CodecOperation::DecodeH265, (176, 144).into())
            .num_frames(12)
            .b_frames(2);
        let stream = synth.annexb();
        let parsed = UnitIterator::new(&stream)
            .map(|unit| SyntheticUnit::parse(&unescape_unit(unit)).unwrap())
            .collect::<Vec<_>>();

        assert_eq!(parsed, synth.units());
    }

    #[test]
    fn unknown_units_are_kept() {
        assert_eq!(
            SyntheticUnit::parse(&[0x42, 1, 2]).unwrap(),
            SyntheticUnit::Unknown(0x42)
        );
        assert!(SyntheticUnit::parse(&[]).is_err());
        // Picture cut in the middle of its header.
        assert!(SyntheticUnit::parse(&[UnitType::Picture as u8, 1, 0]).is_err());
    }

    #[test]
    fn h264_b_frames_follow_their_anchor() {
        let synth = StreamSynthesizer::new(CodecOperation::DecodeH264, (176, 144).into())
            .num_frames(7)
            .gop_size(7)
            .b_frames(2);
        let order = pictures(&synth)
            .iter()
            .map(|p| p.order)
            .collect::<Vec<_>>();
        assert_eq!(order, vec![0, 6, 2, 4, 12, 8, 10]);

        let frame_num = pictures(&synth)
            .iter()
            .map(|p| p.frame_num)
            .collect::<Vec<_>>();
        assert_eq!(frame_num, vec![0, 1, 2, 2, 2, 3, 3]);
    }

    #[test]
    fn h264_frame_num_gap() {
        let synth = StreamSynthesizer::new(CodecOperation::DecodeH264, (176, 144).into())
            .num_frames(4)
            .frame_num_gap_at(1);
        let frame_num = pictures(&synth)
            .iter()
            .map(|p| p.frame_num)
            .collect::<Vec<_>>();
        assert_eq!(frame_num, vec![0, 1, 3, 4]);
    }

    #[test]
    fn h264_fields_come_in_pairs() {
        let synth = StreamSynthesizer::new(CodecOperation::DecodeH264, (176, 144).into())
            .num_frames(2)
            .interlaced(true);
        let pictures = pictures(&synth);
        assert_eq!(pictures.len(), 4);
        assert!(pictures[0].flags.contains(PictureFlags::FIELD | PictureFlags::IDR));
        assert!(pictures[1].flags.contains(PictureFlags::BOTTOM_FIELD));
        assert!(!pictures[1].flags.contains(PictureFlags::IDR));
        assert_eq!(pictures[2].frame_num, 1);
        assert_eq!(pictures[3].frame_num, 1);
        assert!(synth.profile().interlaced);
    }

    #[test]
    fn h265_rps_is_a_sliding_window() {
        let synth = StreamSynthesizer::new(CodecOperation::DecodeH265, (176, 144).into())
            .num_frames(5)
            .max_refs(2)
            .long_term_reference(true);
        let rps = pictures(&synth)
            .iter()
            .map(|p| {
                p.rps
                    .iter()
                    .map(|e| (e.pic_order_cnt, e.long_term))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();
        assert_eq!(rps[0], vec![]);
        assert_eq!(rps[1], vec![(0, true)]);
        assert_eq!(rps[3], vec![(0, true), (2, false), (4, false)]);
        assert_eq!(rps[4], vec![(0, true), (4, false), (6, false)]);
    }

    #[test]
    fn av1_hidden_frames_are_shown_later() {
        let synth = StreamSynthesizer::new(CodecOperation::DecodeAv1, (176, 144).into())
            .num_frames(5)
            .hidden_frames(true);
        let pictures = pictures(&synth);
        let types = pictures
            .iter()
            .map(|p| (p.picture_type, p.flags.contains(PictureFlags::SHOW)))
            .collect::<Vec<_>>();
        assert_eq!(
            types,
            vec![
                (PictureType::Intra, true),
                (PictureType::Inter, false),
                (PictureType::Inter, true),
                (PictureType::Inter, true),
                (PictureType::Inter, true),
                (PictureType::ShowExisting, true),
            ]
        );
        assert_eq!(pictures[5].ref_frame_idx[0], 6);
        assert_eq!(pictures[1].refresh_frame_flags, 1 << 6);
    }

    #[test]
    fn resolution_change_starts_a_sequence() {
        let synth = StreamSynthesizer::new(CodecOperation::DecodeVp9, (176, 144).into())
            .num_frames(6)
            .resolution_change(3, (352, 288).into());
        let extents = synth
            .units()
            .into_iter()
            .filter_map(|unit| match unit {
                SyntheticUnit::Sequence(seq) => Some(seq.coded_extent),
                _ => None,
            })
            .collect::<Vec<Resolution>>();
        assert_eq!(
            extents,
            vec![Resolution::from((176, 144)), Resolution::from((352, 288))]
        );
    }

    #[test]
    fn access_units_hold_one_picture() {
        let synth = StreamSynthesizer::new(CodecOperation::DecodeAv1, (176, 144).into())
            .num_frames(4);
        let access_units = synth.access_units();
        assert_eq!(access_units.len(), 4);
        assert_eq!(access_units.concat(), synth.annexb());
    }
}
