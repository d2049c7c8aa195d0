// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-codec data produced by a bitstream parser and consumed by the decoder.
//!
//! The parser reports stream-level information through [`SequenceInfo`], parameter sets through
//! [`StdParameterSet`] and each picture through [`PictureData`]. The `Std*` structures passed
//! on to the device live in the codec submodules.

pub mod av1;
pub mod h264;
pub mod h265;
pub mod parser;
pub mod synthesizer;
pub mod vp9;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::rc::Weak;

use enumn::N;

use crate::codec::av1::Av1PictureData;
use crate::codec::av1::Av1PictureInfo;
use crate::codec::av1::Av1ReferenceInfo;
use crate::codec::av1::Av1SequenceHeader;
use crate::codec::h264::H264PictureData;
use crate::codec::h264::H264PictureInfo;
use crate::codec::h264::H264Pps;
use crate::codec::h264::H264ReferenceInfo;
use crate::codec::h264::H264Sps;
use crate::codec::h265::H265PictureData;
use crate::codec::h265::H265PictureInfo;
use crate::codec::h265::H265Pps;
use crate::codec::h265::H265ReferenceInfo;
use crate::codec::h265::H265Sps;
use crate::codec::h265::H265Vps;
use crate::codec::vp9::Vp9PictureData;
use crate::codec::vp9::Vp9PictureInfo;
use crate::decoder::bitstream::SharedBitstreamBuffer;
use crate::decoder::frame_buffer::PictureBuffer;
use crate::decoder::parameters::SessionParameters;
use crate::ChromaSubsampling;
use crate::CodecOperation;
use crate::Resolution;

/// Stream-level properties reported by the parser when a new sequence starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequenceInfo {
    pub codec: CodecOperation,
    /// Codec specific profile, e.g. `profile_idc` for H.264.
    pub std_profile: u32,
    pub chroma_subsampling: ChromaSubsampling,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub progressive: bool,
    pub coded_extent: Resolution,
    /// Number of picture buffers the stream needs in flight to be decoded.
    pub min_num_decode_surfaces: u32,
    /// Number of DPB slots the stream needs, setup slot included. 0 if unknown.
    pub min_num_dpb_slots: u32,
    pub film_grain: bool,
}

/// Kinds of codec parameter sets.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ParameterSetKind {
    H265Vps = 0,
    H264Sps = 1,
    H265Sps = 2,
    H264Pps = 3,
    H265Pps = 4,
    Av1SequenceHeader = 5,
}

impl ParameterSetKind {
    pub fn codec(&self) -> CodecOperation {
        match self {
            ParameterSetKind::H264Sps | ParameterSetKind::H264Pps => CodecOperation::DecodeH264,
            ParameterSetKind::H265Vps | ParameterSetKind::H265Sps | ParameterSetKind::H265Pps => {
                CodecOperation::DecodeH265
            }
            ParameterSetKind::Av1SequenceHeader => CodecOperation::DecodeAv1,
        }
    }
}

/// Identifies a parameter set within a session parameters object. Fields that are not part of
/// the key of `kind` are zero.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterSetKey {
    pub kind: ParameterSetKind,
    pub vps_id: u8,
    pub sps_id: u8,
    pub pps_id: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParameterSetPayload {
    H264Sps(H264Sps),
    H264Pps(H264Pps),
    H265Vps(H265Vps),
    H265Sps(H265Sps),
    H265Pps(H265Pps),
    Av1SequenceHeader(Av1SequenceHeader),
}

/// A parsed parameter set, shared between the parser and the decoder.
///
/// The decoder records the session parameters object the set was committed to as the set's
/// client object, which is how pictures find the object holding the sets they use. Objects hold
/// their sets, so the set only keeps a weak reference back.
pub struct StdParameterSet {
    payload: ParameterSetPayload,
    /// Non-zero when this set replaces a previously sent set with the same ID.
    update_sequence_count: u32,
    client: RefCell<Weak<RefCell<SessionParameters>>>,
    parent: RefCell<Option<Rc<StdParameterSet>>>,
}

impl fmt::Debug for StdParameterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdParameterSet")
            .field("payload", &self.payload)
            .field("update_sequence_count", &self.update_sequence_count)
            .finish()
    }
}

impl StdParameterSet {
    pub fn new(payload: ParameterSetPayload, update_sequence_count: u32) -> Rc<Self> {
        Rc::new(Self {
            payload,
            update_sequence_count,
            client: Default::default(),
            parent: Default::default(),
        })
    }

    pub fn payload(&self) -> &ParameterSetPayload {
        &self.payload
    }

    pub fn kind(&self) -> ParameterSetKind {
        match &self.payload {
            ParameterSetPayload::H264Sps(_) => ParameterSetKind::H264Sps,
            ParameterSetPayload::H264Pps(_) => ParameterSetKind::H264Pps,
            ParameterSetPayload::H265Vps(_) => ParameterSetKind::H265Vps,
            ParameterSetPayload::H265Sps(_) => ParameterSetKind::H265Sps,
            ParameterSetPayload::H265Pps(_) => ParameterSetKind::H265Pps,
            ParameterSetPayload::Av1SequenceHeader(_) => ParameterSetKind::Av1SequenceHeader,
        }
    }

    pub fn update_sequence_count(&self) -> u32 {
        self.update_sequence_count
    }

    /// The VPS this set is or refers to.
    pub fn vps_id(&self) -> Option<u8> {
        match &self.payload {
            ParameterSetPayload::H265Vps(vps) => Some(vps.video_parameter_set_id),
            ParameterSetPayload::H265Sps(sps) => Some(sps.video_parameter_set_id),
            ParameterSetPayload::H265Pps(pps) => Some(pps.video_parameter_set_id),
            _ => None,
        }
    }

    /// The SPS this set is or refers to.
    pub fn sps_id(&self) -> Option<u8> {
        match &self.payload {
            ParameterSetPayload::H264Sps(sps) => Some(sps.seq_parameter_set_id),
            ParameterSetPayload::H264Pps(pps) => Some(pps.seq_parameter_set_id),
            ParameterSetPayload::H265Sps(sps) => Some(sps.seq_parameter_set_id),
            ParameterSetPayload::H265Pps(pps) => Some(pps.seq_parameter_set_id),
            _ => None,
        }
    }

    /// The PPS this set is.
    pub fn pps_id(&self) -> Option<u8> {
        match &self.payload {
            ParameterSetPayload::H264Pps(pps) => Some(pps.pic_parameter_set_id),
            ParameterSetPayload::H265Pps(pps) => Some(pps.pic_parameter_set_id),
            _ => None,
        }
    }

    /// The ID of this set within its own kind.
    pub fn node_id(&self) -> u32 {
        let id = match self.kind() {
            ParameterSetKind::H265Vps => self.vps_id(),
            ParameterSetKind::H264Sps | ParameterSetKind::H265Sps => self.sps_id(),
            ParameterSetKind::H264Pps | ParameterSetKind::H265Pps => self.pps_id(),
            ParameterSetKind::Av1SequenceHeader => Some(0),
        };
        id.map(u32::from).unwrap_or_default()
    }

    pub fn key(&self) -> ParameterSetKey {
        let kind = self.kind();
        let (vps_id, sps_id, pps_id) = match kind {
            ParameterSetKind::H265Vps => (self.vps_id(), None, None),
            ParameterSetKind::H264Sps => (None, self.sps_id(), None),
            ParameterSetKind::H264Pps => (None, self.sps_id(), self.pps_id()),
            ParameterSetKind::H265Sps => (self.vps_id(), self.sps_id(), None),
            ParameterSetKind::H265Pps => (self.vps_id(), self.sps_id(), self.pps_id()),
            ParameterSetKind::Av1SequenceHeader => (None, None, None),
        };

        ParameterSetKey {
            kind,
            vps_id: vps_id.unwrap_or_default(),
            sps_id: sps_id.unwrap_or_default(),
            pps_id: pps_id.unwrap_or_default(),
        }
    }

    /// Returns the session parameters object this set was committed to, if it is still alive.
    pub fn client_object(&self) -> Option<Rc<RefCell<SessionParameters>>> {
        self.client.borrow().upgrade()
    }

    pub fn set_client_object(&self, client: Option<Rc<RefCell<SessionParameters>>>) {
        *self.client.borrow_mut() = client.as_ref().map(Rc::downgrade).unwrap_or_default();
    }

    /// The set one level up in the VPS/SPS/PPS hierarchy, if it has been seen.
    pub fn parent(&self) -> Option<Rc<StdParameterSet>> {
        self.parent.borrow().clone()
    }

    pub(crate) fn set_parent(&self, parent: Option<Rc<StdParameterSet>>) {
        *self.parent.borrow_mut() = parent;
    }
}

/// Codec specific part of [`PictureData`].
#[derive(Clone, Debug)]
pub enum CodecPictureData {
    H264(H264PictureData),
    H265(H265PictureData),
    Av1(Av1PictureData),
    Vp9(Vp9PictureData),
}

impl CodecPictureData {
    pub fn codec(&self) -> CodecOperation {
        match self {
            CodecPictureData::H264(_) => CodecOperation::DecodeH264,
            CodecPictureData::H265(_) => CodecOperation::DecodeH265,
            CodecPictureData::Av1(_) => CodecOperation::DecodeAv1,
            CodecPictureData::Vp9(_) => CodecOperation::DecodeVp9,
        }
    }

    /// The parameter sets the picture is decoded with, in VPS, SPS, PPS order.
    pub fn parameter_sets(&self) -> Vec<Rc<StdParameterSet>> {
        match self {
            CodecPictureData::H264(h264) => vec![h264.sps.clone(), h264.pps.clone()],
            CodecPictureData::H265(h265) => {
                vec![h265.vps.clone(), h265.sps.clone(), h265.pps.clone()]
            }
            CodecPictureData::Av1(av1) => vec![av1.sequence_header.clone()],
            CodecPictureData::Vp9(_) => vec![],
        }
    }
}

/// Everything the parser knows about a picture to decode.
#[derive(Clone, Debug)]
pub struct PictureData {
    /// Picture buffer the picture is decoded into.
    pub current: PictureBuffer,
    pub codec: CodecPictureData,
    pub bitstream: SharedBitstreamBuffer,
    pub bitstream_offset: usize,
    pub bitstream_len: usize,
    /// Offsets of each slice, relative to `bitstream_offset`.
    pub slice_offsets: Vec<u32>,
    pub progressive_frame: bool,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub second_field: bool,
    pub top_field_first: bool,
    /// Whether the picture is used as reference by later pictures.
    pub ref_pic_flag: bool,
    pub intra_pic_flag: bool,
    pub timestamp: u64,
}

/// Codec specific picture information handed to the device with a decode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodecPictureInfo {
    H264(H264PictureInfo),
    H265(H265PictureInfo),
    Av1(Av1PictureInfo),
    Vp9(Vp9PictureInfo),
}

impl CodecPictureInfo {
    pub fn codec(&self) -> CodecOperation {
        match self {
            CodecPictureInfo::H264(_) => CodecOperation::DecodeH264,
            CodecPictureInfo::H265(_) => CodecOperation::DecodeH265,
            CodecPictureInfo::Av1(_) => CodecOperation::DecodeAv1,
            CodecPictureInfo::Vp9(_) => CodecOperation::DecodeVp9,
        }
    }

    /// Keys of the parameter sets the device needs to decode this picture.
    pub fn required_parameter_sets(&self) -> Vec<ParameterSetKey> {
        let key = |kind, vps_id, sps_id, pps_id| ParameterSetKey {
            kind,
            vps_id,
            sps_id,
            pps_id,
        };

        match self {
            CodecPictureInfo::H264(info) => vec![
                key(ParameterSetKind::H264Sps, 0, info.seq_parameter_set_id, 0),
                key(
                    ParameterSetKind::H264Pps,
                    0,
                    info.seq_parameter_set_id,
                    info.pic_parameter_set_id,
                ),
            ],
            CodecPictureInfo::H265(info) => vec![
                key(ParameterSetKind::H265Vps, info.video_parameter_set_id, 0, 0),
                key(
                    ParameterSetKind::H265Sps,
                    info.video_parameter_set_id,
                    info.seq_parameter_set_id,
                    0,
                ),
                key(
                    ParameterSetKind::H265Pps,
                    info.video_parameter_set_id,
                    info.seq_parameter_set_id,
                    info.pic_parameter_set_id,
                ),
            ],
            CodecPictureInfo::Av1(_) => vec![key(ParameterSetKind::Av1SequenceHeader, 0, 0, 0)],
            CodecPictureInfo::Vp9(_) => vec![],
        }
    }
}

/// Codec specific information about a DPB slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ReferenceInfo {
    #[default]
    None,
    H264(H264ReferenceInfo),
    H265(H265ReferenceInfo),
    Av1(Av1ReferenceInfo),
}

impl ReferenceInfo {
    /// Whether the slot stands for a picture missing from the stream.
    pub fn is_non_existing(&self) -> bool {
        match self {
            ReferenceInfo::H264(info) => info
                .flags
                .contains(h264::H264ReferenceFlags::IS_NON_EXISTING),
            _ => false,
        }
    }
}
