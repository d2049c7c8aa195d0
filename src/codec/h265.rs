// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::rc::Rc;

use bitflags::bitflags;

use crate::codec::StdParameterSet;
use crate::decoder::frame_buffer::PictureBuffer;

/// Maximum number of entries of the H.265 reference picture set.
pub const MAX_NUM_REF_PICS: usize = 16;
/// Size of the `RefPicSet*` arrays of [`H265PictureInfo`].
pub const MAX_NUM_LIST_REF: usize = 8;
/// Value of unused `RefPicSet*` entries.
pub const NO_REFERENCE_PICTURE: u8 = 0xff;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct H265Vps {
    pub video_parameter_set_id: u8,
    pub max_sub_layers_minus1: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct H265Sps {
    pub video_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub general_profile_idc: u8,
    pub chroma_format_idc: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub pic_width_in_luma_samples: u32,
    pub pic_height_in_luma_samples: u32,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub sps_max_dec_pic_buffering_minus1: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct H265Pps {
    pub video_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub pic_parameter_set_id: u8,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
}

#[derive(Clone, Debug)]
pub struct H265PictureData {
    pub vps: Rc<StdParameterSet>,
    pub sps: Rc<StdParameterSet>,
    pub pps: Rc<StdParameterSet>,
    pub irap_pic_flag: bool,
    pub idr_pic_flag: bool,
    pub curr_pic_order_cnt_val: i32,
    /// The reference picture set. Entries are `None` when unused.
    pub ref_pics: [Option<PictureBuffer>; MAX_NUM_REF_PICS],
    pub pic_order_cnt_val: [i32; MAX_NUM_REF_PICS],
    pub is_long_term: [bool; MAX_NUM_REF_PICS],
    /// Indices into `ref_pics`.
    pub ref_pic_set_st_curr_before: Vec<u8>,
    pub ref_pic_set_st_curr_after: Vec<u8>,
    pub ref_pic_set_lt_curr: Vec<u8>,
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
    pub struct H265PictureFlags: u32 {
        const IRAP_PIC = 1;
        const IDR_PIC = 1 << 1;
        const IS_REFERENCE = 1 << 2;
    }
}

/// Picture information handed to the device for an H.265 decode.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct H265PictureInfo {
    pub flags: H265PictureFlags,
    pub video_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub pic_parameter_set_id: u8,
    pub pic_order_cnt_val: i32,
    /// DPB slot indices, padded with [`NO_REFERENCE_PICTURE`].
    pub ref_pic_set_st_curr_before: [u8; MAX_NUM_LIST_REF],
    pub ref_pic_set_st_curr_after: [u8; MAX_NUM_LIST_REF],
    pub ref_pic_set_lt_curr: [u8; MAX_NUM_LIST_REF],
    pub slice_segment_offsets: Vec<u32>,
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
    pub struct H265ReferenceFlags: u32 {
        const USED_FOR_LONG_TERM_REFERENCE = 1;
        const UNUSED_FOR_REFERENCE = 1 << 1;
    }
}

/// Information about a DPB slot holding an H.265 reference.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct H265ReferenceInfo {
    pub flags: H265ReferenceFlags,
    pub pic_order_cnt_val: i32,
}
