// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::rc::Rc;

use enumn::N;

use crate::codec::StdParameterSet;
use crate::decoder::frame_buffer::PictureBuffer;
use crate::NUM_REF_FRAMES;

/// Number of references an inter frame names (LAST_FRAME to ALTREF_FRAME).
pub const REFS_PER_FRAME: usize = 7;

#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Av1FrameType {
    #[default]
    KeyFrame = 0,
    InterFrame = 1,
    IntraOnlyFrame = 2,
    SwitchFrame = 3,
}

impl Av1FrameType {
    pub fn is_intra(&self) -> bool {
        matches!(self, Av1FrameType::KeyFrame | Av1FrameType::IntraOnlyFrame)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Av1SequenceHeader {
    pub seq_profile: u8,
    pub bit_depth: u8,
    pub max_frame_width_minus_1: u16,
    pub max_frame_height_minus_1: u16,
    pub enable_order_hint: bool,
    pub order_hint_bits_minus_1: u8,
    pub film_grain_params_present: bool,
}

#[derive(Clone, Debug)]
pub struct Av1PictureData {
    pub sequence_header: Rc<StdParameterSet>,
    pub frame_type: Av1FrameType,
    pub show_frame: bool,
    pub order_hint: u8,
    pub refresh_frame_flags: u8,
    /// Index into `ref_frames` for each of LAST_FRAME..ALTREF_FRAME.
    pub ref_frame_idx: [u8; REFS_PER_FRAME],
    /// The reference frame store before this frame is decoded.
    pub ref_frames: [Option<PictureBuffer>; NUM_REF_FRAMES],
    pub ref_order_hint: [u8; NUM_REF_FRAMES],
    pub apply_grain: bool,
}

/// Picture information handed to the device for an AV1 decode.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Av1PictureInfo {
    pub frame_type: Av1FrameType,
    pub order_hint: u8,
    pub refresh_frame_flags: u8,
    pub apply_grain: bool,
    /// DPB slot used for each of LAST_FRAME..ALTREF_FRAME, or -1.
    pub reference_name_slot_indices: [i32; REFS_PER_FRAME],
    pub tile_offsets: Vec<u32>,
}

/// Information about a DPB slot holding an AV1 reference.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Av1ReferenceInfo {
    pub frame_type: Av1FrameType,
    pub order_hint: u8,
}
