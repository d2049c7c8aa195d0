// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::decoder::frame_buffer::PictureBuffer;
use crate::NUM_REF_FRAMES;

/// Number of references an inter frame names (LAST, GOLDEN, ALTREF).
pub const REFS_PER_FRAME: usize = 3;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Vp9FrameType {
    #[default]
    KeyFrame,
    InterFrame,
}

#[derive(Clone, Debug)]
pub struct Vp9PictureData {
    pub profile: u8,
    pub frame_type: Vp9FrameType,
    pub intra_only: bool,
    pub show_frame: bool,
    pub refresh_frame_flags: u8,
    pub ref_frame_idx: [u8; REFS_PER_FRAME],
    /// The reference frame store before this frame is decoded.
    pub ref_frames: [Option<PictureBuffer>; NUM_REF_FRAMES],
}

/// Picture information handed to the device for a VP9 decode.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vp9PictureInfo {
    pub profile: u8,
    pub frame_type: Vp9FrameType,
    pub intra_only: bool,
    pub refresh_frame_flags: u8,
    /// DPB slot used for each of LAST, GOLDEN and ALTREF, or -1.
    pub reference_name_slot_indices: [i32; REFS_PER_FRAME],
}
