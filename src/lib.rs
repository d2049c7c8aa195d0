// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Conformance harness for hardware video decode sessions.
//!
//! The crate drives a [`device::VideoDevice`] through complete decode sequences: it owns the
//! decoded picture buffer slot bookkeeping, the lifetime of video sessions and session
//! parameters objects, and the recording and submission of per-frame decode commands, either
//! frame by frame or buffered and recorded out of order.

pub mod bitstream_utils;
pub mod codec;
pub mod decoder;
pub mod device;
pub mod processor;
pub mod utils;

use std::str::FromStr;

use enumn::N;

/// Maximum number of reference pictures a single decode operation may use.
pub const MAX_DPB_REF_SLOTS: usize = 16;
/// Maximum number of DPB slots, i.e. reference pictures plus the setup slot of the current
/// picture.
pub const MAX_DPB_REF_AND_SETUP_SLOTS: usize = MAX_DPB_REF_SLOTS + 1;
/// Number of entries of the AV1 and VP9 reference frame stores.
pub const NUM_REF_FRAMES: usize = 8;
/// Maximum number of picture buffers a decoder may allocate.
pub const MAX_PICTURE_BUFFERS: usize = 32;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can contain `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    /// Returns the smallest resolution that can contain both `self` and `other`.
    pub fn union(&self, other: Self) -> Self {
        Self {
            width: self.width.max(other.width),
            height: self.height.max(other.height),
        }
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

/// Video codec operations a decode session can be created for.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CodecOperation {
    DecodeH264 = 0,
    DecodeH265 = 1,
    DecodeAv1 = 2,
    DecodeVp9 = 3,
}

impl CodecOperation {
    /// Maximum number of DPB slots, setup slot included, used by streams of this codec.
    pub fn max_dpb_slots(&self) -> usize {
        match self {
            CodecOperation::DecodeAv1 => NUM_REF_FRAMES + 1,
            _ => MAX_DPB_REF_AND_SETUP_SLOTS,
        }
    }

    /// Whether the codec carries parameter sets that must be bound through a session parameters
    /// object.
    pub fn uses_session_parameters(&self) -> bool {
        !matches!(self, CodecOperation::DecodeVp9)
    }
}

impl FromStr for CodecOperation {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" => Ok(CodecOperation::DecodeH264),
            "h265" | "H265" | "hevc" => Ok(CodecOperation::DecodeH265),
            "av1" | "AV1" => Ok(CodecOperation::DecodeAv1),
            "vp9" | "VP9" => Ok(CodecOperation::DecodeVp9),
            _ => Err("unrecognized codec. Valid values: h264, h265, av1, vp9"),
        }
    }
}

#[derive(N, Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChromaSubsampling {
    Monochrome = 0,
    #[default]
    Yuv420 = 1,
    Yuv422 = 2,
    Yuv444 = 3,
}

/// Picture formats used for decode output and DPB images.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PictureFormat {
    /// 8-bit 4:2:0, two planes.
    Nv12,
    /// 10-bit 4:2:0, two planes.
    P010,
    /// 12-bit 4:2:0, two planes.
    P012,
    /// 8-bit 4:2:2, two planes.
    Nv16,
    /// 8-bit 4:4:4, three planes.
    Yuv444,
    /// 8-bit luma only.
    Y8,
}

impl PictureFormat {
    /// Returns the format able to hold pictures of `profile`, if any.
    pub fn for_profile(profile: &VideoProfile) -> Option<Self> {
        match (profile.chroma_subsampling, profile.luma_bit_depth) {
            (ChromaSubsampling::Yuv420, 8) => Some(PictureFormat::Nv12),
            (ChromaSubsampling::Yuv420, 10) => Some(PictureFormat::P010),
            (ChromaSubsampling::Yuv420, 12) => Some(PictureFormat::P012),
            (ChromaSubsampling::Yuv422, 8) => Some(PictureFormat::Nv16),
            (ChromaSubsampling::Yuv444, 8) => Some(PictureFormat::Yuv444),
            (ChromaSubsampling::Monochrome, 8) => Some(PictureFormat::Y8),
            _ => None,
        }
    }
}

/// A video profile: the codec operation plus everything a device needs to size and format
/// sessions and images for it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct VideoProfile {
    pub codec: CodecOperation,
    pub chroma_subsampling: ChromaSubsampling,
    pub luma_bit_depth: u8,
    pub chroma_bit_depth: u8,
    /// Codec specific profile, e.g. `profile_idc` for H.264.
    pub std_profile: u32,
    /// Whether pictures may be coded as separate fields.
    pub interlaced: bool,
    pub film_grain: bool,
}

impl VideoProfile {
    /// An 8-bit 4:2:0 progressive profile for `codec`.
    pub fn new(codec: CodecOperation, std_profile: u32) -> Self {
        Self {
            codec,
            chroma_subsampling: ChromaSubsampling::Yuv420,
            luma_bit_depth: 8,
            chroma_bit_depth: 8,
            std_profile,
            interlaced: false,
            film_grain: false,
        }
    }
}

/// H.264 `profile_idc` values.
pub mod h264_profile {
    pub const BASELINE: u32 = 66;
    pub const MAIN: u32 = 77;
    pub const HIGH: u32 = 100;
}
