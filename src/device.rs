// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The capability surface of a video decode device.
//!
//! [`VideoDevice`] is the only way the rest of the crate talks to hardware. It exposes video
//! sessions, session parameters objects, images, bitstream buffers, command buffers and the
//! synchronization primitives needed to submit decode work, in the shape a low-level graphics
//! API offers them.

pub mod emulated;

use std::rc::Rc;
use std::time::Duration;

use bitflags::bitflags;
use thiserror::Error;

use crate::codec::CodecPictureInfo;
use crate::codec::ReferenceInfo;
use crate::codec::StdParameterSet;
use crate::PictureFormat;
use crate::Resolution;
use crate::VideoProfile;

/// Result codes a device call can fail with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceStatus {
    NotReady,
    Timeout,
    OutOfHostMemory,
    OutOfDeviceMemory,
    InitializationFailed,
    DeviceLost,
    FormatNotSupported,
    FeatureNotPresent,
    VideoProfileOperationNotSupported,
    VideoPictureLayoutNotSupported,
    InvalidVideoStdParameters,
    /// The call violated a usage rule of the API.
    ValidationFailed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{call} failed: {status:?}")]
pub struct DeviceError {
    /// Name of the device call that failed.
    pub call: &'static str,
    pub status: DeviceStatus,
}

impl DeviceError {
    pub fn new(call: &'static str, status: DeviceStatus) -> Self {
        Self { call, status }
    }
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

macro_rules! device_handles {
    ($($(#[$attr:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$attr])*
            #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);
        )*
    };
}

device_handles!(
    SessionHandle,
    ParametersHandle,
    ImageHandle,
    BufferHandle,
    CommandPoolHandle,
    CommandBufferHandle,
    FenceHandle,
    SemaphoreHandle,
    QueryPoolHandle,
);

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
    pub struct VideoCapabilityFlags: u32 {
        const PROTECTED_CONTENT = 1;
        /// Each DPB slot may be backed by a distinct image.
        const SEPARATE_REFERENCE_IMAGES = 1 << 1;
        /// Images can be created without naming the video profile they are used with.
        const PROFILE_INDEPENDENT_IMAGES = 1 << 2;
        const INLINE_QUERIES = 1 << 3;
        const INLINE_SESSION_PARAMETERS = 1 << 4;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
    pub struct DecodeCapabilityFlags: u32 {
        /// The decode output may be written to the DPB image of the current picture.
        const DPB_AND_OUTPUT_COINCIDE = 1;
        /// The decode output may be written to an image distinct from the DPB.
        const DPB_AND_OUTPUT_DISTINCT = 1 << 1;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
    pub struct ImageUsage: u32 {
        const DECODE_DST = 1;
        const DECODE_DPB = 1 << 1;
        const TRANSFER_SRC = 1 << 2;
        const SAMPLED = 1 << 3;
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
    pub struct SessionCreateFlags: u32 {
        const INLINE_QUERIES = 1;
        const INLINE_SESSION_PARAMETERS = 1 << 1;
    }
}

/// What a device can do for a given [`VideoProfile`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoCapabilities {
    pub flags: VideoCapabilityFlags,
    pub decode_flags: DecodeCapabilityFlags,
    pub min_bitstream_buffer_offset_alignment: u64,
    pub min_bitstream_buffer_size_alignment: u64,
    pub picture_access_granularity: Resolution,
    pub min_coded_extent: Resolution,
    pub max_coded_extent: Resolution,
    pub max_dpb_slots: u32,
    pub max_active_reference_pictures: u32,
    /// Formats usable for DPB images, preferred first.
    pub dpb_formats: Vec<PictureFormat>,
    /// Formats usable for decode output images, preferred first.
    pub output_formats: Vec<PictureFormat>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionCreateInfo {
    pub queue_family: u32,
    pub flags: SessionCreateFlags,
    pub profile: VideoProfile,
    pub picture_format: PictureFormat,
    pub max_coded_extent: Resolution,
    pub reference_picture_format: PictureFormat,
    pub max_dpb_slots: u32,
    pub max_active_reference_pictures: u32,
}

/// Creation parameters of a session parameters object.
#[derive(Clone, Debug)]
pub struct ParametersCreateInfo {
    pub session: SessionHandle,
    /// Object whose parameter sets are inherited. Sets in `sets` replace inherited ones with the
    /// same key.
    pub template: Option<ParametersHandle>,
    pub sets: Vec<Rc<StdParameterSet>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageCreateInfo {
    /// `None` for profile independent images.
    pub profile: Option<VideoProfile>,
    pub format: PictureFormat,
    pub extent: Resolution,
    pub array_layers: u32,
    pub usage: ImageUsage,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    #[default]
    Undefined,
    DecodeDst,
    DecodeDpb,
}

/// A picture inside an image: the image plus the array layer and extent decode operations
/// address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct PictureResource {
    pub image: ImageHandle,
    pub base_array_layer: u32,
    pub coded_extent: Resolution,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: ImageHandle,
    pub base_array_layer: u32,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub size: u64,
}

/// A DPB slot referenced by a decode operation, or bound when beginning a coding scope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReferenceSlot {
    /// Slot index, or -1 for the picture about to be set up by the next decode.
    pub slot_index: i32,
    pub resource: Option<PictureResource>,
    pub info: ReferenceInfo,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BeginCodingInfo {
    pub session: SessionHandle,
    pub parameters: Option<ParametersHandle>,
    pub reference_slots: Vec<ReferenceSlot>,
}

#[derive(Clone, Debug)]
pub struct DecodeInfo {
    pub src_buffer: BufferHandle,
    pub src_offset: u64,
    pub src_range: u64,
    pub dst: PictureResource,
    pub setup_slot: Option<ReferenceSlot>,
    pub reference_slots: Vec<ReferenceSlot>,
    pub picture_info: CodecPictureInfo,
    /// Parameter sets supplied with the decode instead of through a parameters object.
    pub inline_parameters: Vec<Rc<StdParameterSet>>,
    /// Query written by the decode itself, without begin/end query commands.
    pub inline_query: Option<(QueryPoolHandle, u32)>,
}

/// Commands that can be recorded into a decode command buffer.
#[derive(Clone, Debug)]
pub enum VideoCommand {
    ResetQueryPool {
        pool: QueryPoolHandle,
        first_query: u32,
        query_count: u32,
    },
    BeginCoding(BeginCodingInfo),
    /// Resets the session state, deactivating every DPB slot.
    ControlReset,
    PipelineBarrier {
        buffer_barriers: Vec<BufferBarrier>,
        image_barriers: Vec<ImageBarrier>,
    },
    BeginQuery {
        pool: QueryPoolHandle,
        query: u32,
    },
    Decode(DecodeInfo),
    EndQuery {
        pool: QueryPoolHandle,
        query: u32,
    },
    EndCoding,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SubmitInfo {
    pub command_buffer: CommandBufferHandle,
    pub wait_semaphore: Option<SemaphoreHandle>,
    pub signal_semaphore: Option<SemaphoreHandle>,
    pub fence: Option<FenceHandle>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FenceStatus {
    Signaled,
    Unsignaled,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueryResultStatus {
    Error,
    NotReady,
    Complete,
    InsufficientBitstreamBufferRange,
}

/// Operations of a device able to decode video.
///
/// All handles returned by a device are only meaningful to that device. Objects are destroyed
/// explicitly; the owners in this crate do so from their `Drop` implementations.
pub trait VideoDevice {
    /// Identifier distinguishing this device from any other one.
    fn id(&self) -> u64;
    /// Queue family decode work is submitted to.
    fn decode_queue_family(&self) -> u32;

    fn video_capabilities(&self, profile: &VideoProfile) -> DeviceResult<VideoCapabilities>;

    /// Creates a session and binds its memory.
    fn create_video_session(&self, info: &SessionCreateInfo) -> DeviceResult<SessionHandle>;
    fn destroy_video_session(&self, session: SessionHandle);

    fn create_session_parameters(
        &self,
        info: &ParametersCreateInfo,
    ) -> DeviceResult<ParametersHandle>;
    /// Adds `sets` to `parameters`. `update_sequence_count` must be one more than the count of
    /// the previous update, starting at 1.
    fn update_session_parameters(
        &self,
        parameters: ParametersHandle,
        update_sequence_count: u32,
        sets: &[Rc<StdParameterSet>],
    ) -> DeviceResult<()>;
    fn destroy_session_parameters(&self, parameters: ParametersHandle);

    fn create_image(&self, info: &ImageCreateInfo) -> DeviceResult<ImageHandle>;
    fn destroy_image(&self, image: ImageHandle);

    /// Creates a host visible buffer usable as decode source.
    fn create_bitstream_buffer(&self, size: u64) -> DeviceResult<BufferHandle>;
    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> DeviceResult<()>;
    fn fill_buffer(&self, buffer: BufferHandle, offset: u64, size: u64, value: u8)
        -> DeviceResult<()>;
    fn destroy_buffer(&self, buffer: BufferHandle);

    fn create_command_pool(&self, queue_family: u32) -> DeviceResult<CommandPoolHandle>;
    fn allocate_command_buffers(
        &self,
        pool: CommandPoolHandle,
        count: usize,
    ) -> DeviceResult<Vec<CommandBufferHandle>>;
    /// Destroys `pool` and every command buffer allocated from it.
    fn destroy_command_pool(&self, pool: CommandPoolHandle);
    /// Replaces the content of `command_buffer` with `commands`.
    fn record_command_buffer(
        &self,
        command_buffer: CommandBufferHandle,
        commands: Vec<VideoCommand>,
    ) -> DeviceResult<()>;

    fn create_fence(&self, signaled: bool) -> DeviceResult<FenceHandle>;
    fn reset_fence(&self, fence: FenceHandle) -> DeviceResult<()>;
    fn fence_status(&self, fence: FenceHandle) -> DeviceResult<FenceStatus>;
    /// Waits until `fence` is signaled, failing with [`DeviceStatus::Timeout`] after `timeout`.
    fn wait_for_fence(&self, fence: FenceHandle, timeout: Duration) -> DeviceResult<()>;
    fn destroy_fence(&self, fence: FenceHandle);

    fn create_semaphore(&self) -> DeviceResult<SemaphoreHandle>;
    fn destroy_semaphore(&self, semaphore: SemaphoreHandle);

    fn create_query_pool(
        &self,
        profile: &VideoProfile,
        query_count: u32,
    ) -> DeviceResult<QueryPoolHandle>;
    /// Returns the result status of `query`, waiting for it to become available.
    fn query_decode_status(
        &self,
        pool: QueryPoolHandle,
        query: u32,
    ) -> DeviceResult<QueryResultStatus>;
    fn destroy_query_pool(&self, pool: QueryPoolHandle);

    fn queue_submit(&self, submit: &SubmitInfo) -> DeviceResult<()>;

    /// Reads back the content of `resource`.
    fn read_picture(&self, resource: &PictureResource) -> DeviceResult<Vec<u8>>;
}
