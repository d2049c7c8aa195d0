// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::rc::Rc;

use bitflags::bitflags;

use crate::codec::StdParameterSet;
use crate::decoder::frame_buffer::PictureBuffer;

/// `used_for_reference` bit for the top field.
pub const TOP_FIELD: u8 = 1;
/// `used_for_reference` bit for the bottom field.
pub const BOTTOM_FIELD: u8 = 2;
/// `used_for_reference` value of a frame or complementary field pair.
pub const FRAME: u8 = TOP_FIELD | BOTTOM_FIELD;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct H264Sps {
    pub seq_parameter_set_id: u8,
    pub profile_idc: u8,
    pub level_idc: u8,
    pub chroma_format_idc: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub max_num_ref_frames: u8,
    pub pic_width_in_mbs_minus1: u16,
    pub pic_height_in_map_units_minus1: u16,
    pub frame_mbs_only_flag: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct H264Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub entropy_coding_mode_flag: bool,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub pic_init_qp_minus26: i8,
}

/// An entry of the parser's decoded picture buffer.
#[derive(Clone, Debug, Default)]
pub struct H264DpbEntry {
    /// `None` for non-existing frames.
    pub picture: Option<PictureBuffer>,
    /// `FrameNum` for short-term references, `LongTermFrameIdx` for long-term ones.
    pub frame_idx: i32,
    pub is_long_term: bool,
    /// Frame inferred from a gap in `frame_num`.
    pub not_existing: bool,
    /// Combination of [`TOP_FIELD`] and [`BOTTOM_FIELD`]; 0 if unused.
    pub used_for_reference: u8,
    pub field_order_cnt: [i32; 2],
}

#[derive(Clone, Debug)]
pub struct H264PictureData {
    pub sps: Rc<StdParameterSet>,
    pub pps: Rc<StdParameterSet>,
    pub frame_num: u16,
    pub idr_pic_flag: bool,
    pub idr_pic_id: u16,
    pub curr_field_order_cnt: [i32; 2],
    /// Reference pictures, at most [`crate::MAX_DPB_REF_SLOTS`].
    pub dpb: Vec<H264DpbEntry>,
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
    pub struct H264PictureFlags: u32 {
        const FIELD_PIC = 1;
        const BOTTOM_FIELD = 1 << 1;
        const IS_INTRA = 1 << 2;
        const IS_REFERENCE = 1 << 3;
        const IDR_PIC = 1 << 4;
        const COMPLEMENTARY_FIELD_PAIR = 1 << 5;
    }
}

/// Picture information handed to the device for an H.264 decode.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct H264PictureInfo {
    pub flags: H264PictureFlags,
    pub seq_parameter_set_id: u8,
    pub pic_parameter_set_id: u8,
    pub frame_num: u16,
    pub idr_pic_id: u16,
    pub pic_order_cnt: [i32; 2],
    pub slice_offsets: Vec<u32>,
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
    pub struct H264ReferenceFlags: u32 {
        const TOP_FIELD = 1;
        const BOTTOM_FIELD = 1 << 1;
        const USED_FOR_LONG_TERM_REFERENCE = 1 << 2;
        const IS_NON_EXISTING = 1 << 3;
    }
}

/// Information about a DPB slot holding an H.264 reference.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct H264ReferenceInfo {
    pub flags: H264ReferenceFlags,
    pub frame_num: u16,
    pub pic_order_cnt: [i32; 2],
}
