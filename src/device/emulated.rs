// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A software [`VideoDevice`].
//!
//! Command buffers are executed synchronously when submitted. Instead of pixels, each decode
//! writes a CRC32 digest of its bitstream range and of the content of every picture it
//! references, so any mistake in reference management changes the output of all the pictures
//! predicted from it. Usage rules a conformant driver relies on (slot activation, codec reset,
//! parameter set presence, layouts) are checked and reported as
//! [`DeviceStatus::ValidationFailed`].

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use log::debug;
use log::error;
use log::trace;

use crate::codec::CodecPictureInfo;
use crate::codec::ParameterSetKey;
use crate::codec::StdParameterSet;
use crate::device::BeginCodingInfo;
use crate::device::BufferHandle;
use crate::device::CommandBufferHandle;
use crate::device::CommandPoolHandle;
use crate::device::DecodeCapabilityFlags;
use crate::device::DecodeInfo;
use crate::device::DeviceError;
use crate::device::DeviceResult;
use crate::device::DeviceStatus;
use crate::device::FenceHandle;
use crate::device::FenceStatus;
use crate::device::ImageBarrier;
use crate::device::ImageCreateInfo;
use crate::device::ImageHandle;
use crate::device::ImageLayout;
use crate::device::ParametersCreateInfo;
use crate::device::ParametersHandle;
use crate::device::PictureResource;
use crate::device::QueryPoolHandle;
use crate::device::QueryResultStatus;
use crate::device::SemaphoreHandle;
use crate::device::SessionCreateFlags;
use crate::device::SessionCreateInfo;
use crate::device::SessionHandle;
use crate::device::SubmitInfo;
use crate::device::VideoCapabilities;
use crate::device::VideoCapabilityFlags;
use crate::device::VideoCommand;
use crate::device::VideoDevice;
use crate::CodecOperation;
use crate::PictureFormat;
use crate::Resolution;
use crate::VideoProfile;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Queue family the emulated device decodes on.
pub const DECODE_QUEUE_FAMILY: u32 = 0;

/// What the emulated device claims to support.
#[derive(Clone, Debug)]
pub struct EmulatedDeviceConfig {
    pub codecs: Vec<CodecOperation>,
    pub flags: VideoCapabilityFlags,
    pub decode_flags: DecodeCapabilityFlags,
    pub min_coded_extent: Resolution,
    pub max_coded_extent: Resolution,
    pub max_dpb_slots: u32,
    pub max_active_reference_pictures: u32,
    pub bitstream_offset_alignment: u64,
    pub bitstream_size_alignment: u64,
}

impl Default for EmulatedDeviceConfig {
    fn default() -> Self {
        Self {
            codecs: vec![
                CodecOperation::DecodeH264,
                CodecOperation::DecodeH265,
                CodecOperation::DecodeAv1,
                CodecOperation::DecodeVp9,
            ],
            flags: VideoCapabilityFlags::SEPARATE_REFERENCE_IMAGES
                | VideoCapabilityFlags::PROFILE_INDEPENDENT_IMAGES
                | VideoCapabilityFlags::INLINE_QUERIES
                | VideoCapabilityFlags::INLINE_SESSION_PARAMETERS,
            decode_flags: DecodeCapabilityFlags::DPB_AND_OUTPUT_COINCIDE
                | DecodeCapabilityFlags::DPB_AND_OUTPUT_DISTINCT,
            min_coded_extent: Resolution {
                width: 16,
                height: 16,
            },
            max_coded_extent: Resolution {
                width: 4096,
                height: 4096,
            },
            max_dpb_slots: crate::MAX_DPB_REF_AND_SETUP_SLOTS as u32,
            max_active_reference_pictures: crate::MAX_DPB_REF_SLOTS as u32,
            bitstream_offset_alignment: 256,
            bitstream_size_alignment: 256,
        }
    }
}

/// Counters of the work an [`EmulatedDevice`] has performed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EmulatedStats {
    pub sessions_created: usize,
    pub sessions_destroyed: usize,
    pub parameters_created: usize,
    pub parameters_updated: usize,
    pub parameters_destroyed: usize,
    pub codec_resets: usize,
    pub decodes: usize,
    pub submissions: usize,
}

struct Session {
    info: SessionCreateInfo,
    reset_done: bool,
    /// Resource each active DPB slot was set up with.
    slots: Vec<Option<PictureResource>>,
}

struct Parameters {
    session: SessionHandle,
    keys: BTreeSet<ParameterSetKey>,
    update_sequence_count: u32,
}

struct Image {
    layers: Vec<Vec<u8>>,
    layouts: Vec<ImageLayout>,
}

/// Coding scope being executed.
struct BoundScope {
    session: SessionHandle,
    parameters: Option<ParametersHandle>,
    info: BeginCodingInfo,
}

#[derive(Default)]
struct Execution {
    scope: Option<BoundScope>,
    active_query: Option<(QueryPoolHandle, u32)>,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    sessions: HashMap<SessionHandle, Session>,
    parameters: HashMap<ParametersHandle, Parameters>,
    images: HashMap<ImageHandle, Image>,
    buffers: HashMap<BufferHandle, Vec<u8>>,
    command_pools: HashMap<CommandPoolHandle, Vec<CommandBufferHandle>>,
    command_buffers: HashMap<CommandBufferHandle, Vec<VideoCommand>>,
    fences: HashMap<FenceHandle, bool>,
    semaphores: HashMap<SemaphoreHandle, bool>,
    query_pools: HashMap<QueryPoolHandle, Vec<QueryResultStatus>>,
    injected_failure: Option<(&'static str, DeviceStatus)>,
    stats: EmulatedStats,
}

impl State {
    fn new_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn check_injected(&mut self, call: &'static str) -> DeviceResult<()> {
        match self.injected_failure {
            Some((injected, status)) if injected == call => {
                self.injected_failure = None;
                Err(DeviceError::new(call, status))
            }
            _ => Ok(()),
        }
    }

    fn picture_content(&self, resource: &PictureResource) -> Option<&[u8]> {
        self.images
            .get(&resource.image)
            .and_then(|image| image.layers.get(resource.base_array_layer as usize))
            .map(|layer| layer.as_slice())
    }

    fn picture_layout(&self, resource: &PictureResource) -> Option<ImageLayout> {
        self.images
            .get(&resource.image)
            .and_then(|image| image.layouts.get(resource.base_array_layer as usize))
            .copied()
    }

    fn write_picture(&mut self, resource: &PictureResource, content: Vec<u8>) -> bool {
        match self
            .images
            .get_mut(&resource.image)
            .and_then(|image| image.layers.get_mut(resource.base_array_layer as usize))
        {
            Some(layer) => {
                *layer = content;
                true
            }
            None => false,
        }
    }
}

fn invalid(call: &'static str, reason: impl AsRef<str>) -> DeviceError {
    error!("{}: {}", call, reason.as_ref());
    DeviceError::new(call, DeviceStatus::ValidationFailed)
}

/// A [`VideoDevice`] implemented in software.
pub struct EmulatedDevice {
    id: u64,
    config: EmulatedDeviceConfig,
    state: RefCell<State>,
}

impl EmulatedDevice {
    pub fn new(config: EmulatedDeviceConfig) -> Rc<Self> {
        Rc::new(Self {
            id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
            config,
            state: Default::default(),
        })
    }

    pub fn config(&self) -> &EmulatedDeviceConfig {
        &self.config
    }

    /// Makes the next call named `call` fail with `status`.
    pub fn fail_next(&self, call: &'static str, status: DeviceStatus) {
        self.state.borrow_mut().injected_failure = Some((call, status));
    }

    pub fn stats(&self) -> EmulatedStats {
        self.state.borrow().stats.clone()
    }

    /// Number of sessions, parameters objects, images and buffers currently alive.
    pub fn live_objects(&self) -> usize {
        let state = self.state.borrow();
        state.sessions.len() + state.parameters.len() + state.images.len() + state.buffers.len()
    }

    /// The resources the DPB slots of `session` are currently set up with.
    pub fn active_slots(&self, session: SessionHandle) -> Vec<Option<PictureResource>> {
        self.state
            .borrow()
            .sessions
            .get(&session)
            .map(|s| s.slots.clone())
            .unwrap_or_default()
    }

    fn begin_coding(
        &self,
        state: &mut State,
        exec: &mut Execution,
        info: BeginCodingInfo,
    ) -> DeviceResult<()> {
        const CALL: &str = "cmd_begin_video_coding";

        if exec.scope.is_some() {
            return Err(invalid(CALL, "coding scope already begun"));
        }
        let session = state
            .sessions
            .get(&info.session)
            .ok_or_else(|| invalid(CALL, "unknown session"))?;

        if let Some(parameters) = info.parameters {
            match state.parameters.get(&parameters) {
                Some(p) if p.session == info.session => (),
                Some(_) => return Err(invalid(CALL, "parameters belong to another session")),
                None => return Err(invalid(CALL, "unknown session parameters")),
            }
        }

        for slot in &info.reference_slots {
            if slot.slot_index >= session.info.max_dpb_slots as i32 {
                return Err(invalid(
                    CALL,
                    format!("slot index {} out of range", slot.slot_index),
                ));
            }
            if let Some(resource) = &slot.resource {
                if !state.images.contains_key(&resource.image) {
                    return Err(invalid(CALL, "bound reference picture has no image"));
                }
            }
            if slot.slot_index >= 0 && !slot.info.is_non_existing() {
                let active = &session.slots[slot.slot_index as usize];
                if active.is_none() || *active != slot.resource {
                    return Err(invalid(
                        CALL,
                        format!("slot {} is not active with this picture", slot.slot_index),
                    ));
                }
            }
        }

        exec.scope = Some(BoundScope {
            session: info.session,
            parameters: info.parameters,
            info,
        });

        Ok(())
    }

    fn control_reset(&self, state: &mut State, exec: &mut Execution) -> DeviceResult<()> {
        let scope = exec
            .scope
            .as_ref()
            .ok_or_else(|| invalid("cmd_control_video_coding", "outside of a coding scope"))?;
        if let Some(session) = state.sessions.get_mut(&scope.session) {
            session.reset_done = true;
            session.slots.iter_mut().for_each(|slot| *slot = None);
        }
        state.stats.codec_resets += 1;

        Ok(())
    }

    fn pipeline_barrier(&self, state: &mut State, barriers: &[ImageBarrier]) -> DeviceResult<()> {
        const CALL: &str = "cmd_pipeline_barrier";

        for barrier in barriers {
            let image = state
                .images
                .get_mut(&barrier.image)
                .ok_or_else(|| invalid(CALL, "unknown image"))?;
            let layout = image
                .layouts
                .get_mut(barrier.base_array_layer as usize)
                .ok_or_else(|| invalid(CALL, "array layer out of range"))?;
            if barrier.old_layout != ImageLayout::Undefined && barrier.old_layout != *layout {
                return Err(invalid(
                    CALL,
                    format!(
                        "old layout {:?} does not match current layout {:?}",
                        barrier.old_layout, layout
                    ),
                ));
            }
            *layout = barrier.new_layout;
        }

        Ok(())
    }

    fn decode(&self, state: &mut State, exec: &mut Execution, info: DecodeInfo) -> DeviceResult<()> {
        const CALL: &str = "cmd_decode_video";

        let scope = exec
            .scope
            .as_ref()
            .ok_or_else(|| invalid(CALL, "decode outside of a coding scope"))?;
        let session = state
            .sessions
            .get(&scope.session)
            .ok_or_else(|| invalid(CALL, "unknown session"))?;

        if !session.reset_done {
            return Err(invalid(CALL, "session decoded from before being reset"));
        }
        if info.picture_info.codec() != session.info.profile.codec {
            return Err(invalid(CALL, "picture info does not match the session codec"));
        }
        if info.reference_slots.len() > session.info.max_active_reference_pictures as usize {
            return Err(invalid(
                CALL,
                format!("{} active references", info.reference_slots.len()),
            ));
        }

        let mut keys = scope
            .parameters
            .and_then(|p| state.parameters.get(&p))
            .map(|p| p.keys.clone())
            .unwrap_or_default();
        if !info.inline_parameters.is_empty() {
            if !session
                .info
                .flags
                .contains(SessionCreateFlags::INLINE_SESSION_PARAMETERS)
            {
                return Err(invalid(CALL, "inline parameters on a session without support"));
            }
            keys.extend(info.inline_parameters.iter().map(|set| set.key()));
        }
        for key in info.picture_info.required_parameter_sets() {
            if !keys.contains(&key) {
                error!("{}: missing parameter set {:?}", CALL, key);
                return Err(DeviceError::new(CALL, DeviceStatus::InvalidVideoStdParameters));
            }
        }

        let is_bound = |slot_index: i32, resource: &Option<PictureResource>| {
            scope.info.reference_slots.iter().any(|bound| {
                (bound.slot_index == slot_index || bound.slot_index < 0)
                    && bound.resource == *resource
            })
        };

        for reference in &info.reference_slots {
            let index = usize::try_from(reference.slot_index)
                .ok()
                .filter(|i| *i < session.slots.len())
                .ok_or_else(|| invalid(CALL, "reference slot index out of range"))?;
            if !is_bound(reference.slot_index, &reference.resource) {
                return Err(invalid(CALL, format!("reference slot {} is not bound", index)));
            }
            if reference.info.is_non_existing() {
                continue;
            }
            if session.slots[index].is_none() || session.slots[index] != reference.resource {
                return Err(invalid(CALL, format!("reference slot {} is not active", index)));
            }
            let layout = reference
                .resource
                .as_ref()
                .and_then(|r| state.picture_layout(r));
            if layout != Some(ImageLayout::DecodeDpb) {
                return Err(invalid(CALL, format!("reference layout is {:?}", layout)));
            }
        }

        let setup = match &info.setup_slot {
            Some(setup) => {
                let index = usize::try_from(setup.slot_index)
                    .ok()
                    .filter(|i| *i < session.slots.len())
                    .ok_or_else(|| invalid(CALL, "setup slot index out of range"))?;
                let resource = setup
                    .resource
                    .ok_or_else(|| invalid(CALL, "setup slot without picture"))?;
                if !is_bound(setup.slot_index, &setup.resource) {
                    return Err(invalid(CALL, "setup picture is not bound"));
                }
                if state.picture_layout(&resource) != Some(ImageLayout::DecodeDpb) {
                    return Err(invalid(CALL, "setup picture is not in DPB layout"));
                }
                Some((index, resource))
            }
            None => None,
        };

        let coincide = setup.map(|(_, r)| r == info.dst).unwrap_or(false);
        let expected_dst_layout = if coincide {
            ImageLayout::DecodeDpb
        } else {
            ImageLayout::DecodeDst
        };
        if state.picture_layout(&info.dst) != Some(expected_dst_layout) {
            return Err(invalid(CALL, "output picture has the wrong layout"));
        }
        let apply_grain = matches!(&info.picture_info, CodecPictureInfo::Av1(av1) if av1.apply_grain);
        if apply_grain && coincide {
            return Err(invalid(CALL, "film grain output must not be the DPB picture"));
        }

        let src = state
            .buffers
            .get(&info.src_buffer)
            .ok_or_else(|| invalid(CALL, "unknown bitstream buffer"))?;
        let start = info.src_offset as usize;
        let end = start + info.src_range as usize;
        if end > src.len() {
            return Err(invalid(CALL, "bitstream range exceeds buffer"));
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&src[start..end]);
        for reference in &info.reference_slots {
            if let Some(content) = reference
                .resource
                .as_ref()
                .and_then(|r| state.picture_content(r))
            {
                hasher.update(content);
            }
        }
        let reconstructed = hasher.finalize().to_le_bytes().to_vec();
        let output = if apply_grain {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&reconstructed);
            hasher.update(b"film grain");
            hasher.finalize().to_le_bytes().to_vec()
        } else {
            reconstructed.clone()
        };

        if let Some((index, resource)) = setup {
            state.write_picture(&resource, reconstructed);
            if let Some(session) = state.sessions.get_mut(&scope.session) {
                // A picture can only be live in one slot.
                for slot in session.slots.iter_mut() {
                    if *slot == Some(resource) {
                        *slot = None;
                    }
                }
                session.slots[index] = Some(resource);
            }
        }
        if !coincide && !state.write_picture(&info.dst, output) {
            return Err(invalid(CALL, "unknown output picture"));
        }

        for (pool, query) in info.inline_query.into_iter().chain(exec.active_query) {
            if let Some(status) = state
                .query_pools
                .get_mut(&pool)
                .and_then(|queries| queries.get_mut(query as usize))
            {
                *status = QueryResultStatus::Complete;
            }
        }

        state.stats.decodes += 1;
        trace!("decoded into {:?}", info.dst);

        Ok(())
    }

    fn execute(
        &self,
        state: &mut State,
        exec: &mut Execution,
        command: VideoCommand,
    ) -> DeviceResult<()> {
        match command {
            VideoCommand::ResetQueryPool {
                pool,
                first_query,
                query_count,
            } => {
                let queries = state
                    .query_pools
                    .get_mut(&pool)
                    .ok_or_else(|| invalid("cmd_reset_query_pool", "unknown query pool"))?;
                let first = first_query as usize;
                let last = first + query_count as usize;
                if last > queries.len() {
                    return Err(invalid("cmd_reset_query_pool", "query range out of bounds"));
                }
                queries[first..last]
                    .iter_mut()
                    .for_each(|q| *q = QueryResultStatus::NotReady);
                Ok(())
            }
            VideoCommand::BeginCoding(info) => self.begin_coding(state, exec, info),
            VideoCommand::ControlReset => self.control_reset(state, exec),
            VideoCommand::PipelineBarrier { image_barriers, .. } => {
                self.pipeline_barrier(state, &image_barriers)
            }
            VideoCommand::BeginQuery { pool, query } => {
                if exec.active_query.is_some() {
                    return Err(invalid("cmd_begin_query", "query already active"));
                }
                exec.active_query = Some((pool, query));
                Ok(())
            }
            VideoCommand::Decode(info) => self.decode(state, exec, info),
            VideoCommand::EndQuery { pool, query } => match exec.active_query.take() {
                Some(active) if active == (pool, query) => Ok(()),
                _ => Err(invalid("cmd_end_query", "query not active")),
            },
            VideoCommand::EndCoding => match exec.scope.take() {
                Some(_) => Ok(()),
                None => Err(invalid("cmd_end_video_coding", "no coding scope")),
            },
        }
    }
}

impl VideoDevice for EmulatedDevice {
    fn id(&self) -> u64 {
        self.id
    }

    fn decode_queue_family(&self) -> u32 {
        DECODE_QUEUE_FAMILY
    }

    fn video_capabilities(&self, profile: &VideoProfile) -> DeviceResult<VideoCapabilities> {
        const CALL: &str = "get_video_capabilities";

        self.state.borrow_mut().check_injected(CALL)?;
        if !self.config.codecs.contains(&profile.codec) {
            return Err(DeviceError::new(
                CALL,
                DeviceStatus::VideoProfileOperationNotSupported,
            ));
        }
        let format = PictureFormat::for_profile(profile)
            .ok_or_else(|| DeviceError::new(CALL, DeviceStatus::FormatNotSupported))?;
        let max_dpb_slots = self
            .config
            .max_dpb_slots
            .min(profile.codec.max_dpb_slots() as u32);

        Ok(VideoCapabilities {
            flags: self.config.flags,
            decode_flags: self.config.decode_flags,
            min_bitstream_buffer_offset_alignment: self.config.bitstream_offset_alignment,
            min_bitstream_buffer_size_alignment: self.config.bitstream_size_alignment,
            picture_access_granularity: Resolution {
                width: 16,
                height: 16,
            },
            min_coded_extent: self.config.min_coded_extent,
            max_coded_extent: self.config.max_coded_extent,
            max_dpb_slots,
            max_active_reference_pictures: self
                .config
                .max_active_reference_pictures
                .min(max_dpb_slots.saturating_sub(1)),
            dpb_formats: vec![format],
            output_formats: vec![format],
        })
    }

    fn create_video_session(&self, info: &SessionCreateInfo) -> DeviceResult<SessionHandle> {
        const CALL: &str = "create_video_session";

        self.state.borrow_mut().check_injected(CALL)?;
        let caps = self.video_capabilities(&info.profile)?;
        if info.queue_family != DECODE_QUEUE_FAMILY {
            return Err(invalid(CALL, "queue family does not support decode"));
        }
        if !caps.max_coded_extent.can_contain(info.max_coded_extent)
            || !info.max_coded_extent.can_contain(caps.min_coded_extent)
        {
            return Err(invalid(CALL, "coded extent out of range"));
        }
        if info.max_dpb_slots > caps.max_dpb_slots
            || info.max_active_reference_pictures > caps.max_active_reference_pictures
        {
            return Err(invalid(CALL, "DPB exceeds capabilities"));
        }
        if !caps.output_formats.contains(&info.picture_format)
            || !caps.dpb_formats.contains(&info.reference_picture_format)
        {
            return Err(DeviceError::new(CALL, DeviceStatus::FormatNotSupported));
        }
        if info.flags.contains(SessionCreateFlags::INLINE_QUERIES)
            && !caps.flags.contains(VideoCapabilityFlags::INLINE_QUERIES)
        {
            return Err(DeviceError::new(CALL, DeviceStatus::FeatureNotPresent));
        }
        if info
            .flags
            .contains(SessionCreateFlags::INLINE_SESSION_PARAMETERS)
            && !caps
                .flags
                .contains(VideoCapabilityFlags::INLINE_SESSION_PARAMETERS)
        {
            return Err(DeviceError::new(CALL, DeviceStatus::FeatureNotPresent));
        }

        let mut state = self.state.borrow_mut();
        let handle = SessionHandle(state.new_handle());
        state.sessions.insert(
            handle,
            Session {
                info: info.clone(),
                reset_done: false,
                slots: vec![None; info.max_dpb_slots as usize],
            },
        );
        state.stats.sessions_created += 1;
        debug!("created session {:?} for {:?}", handle, info.profile);

        Ok(handle)
    }

    fn destroy_video_session(&self, session: SessionHandle) {
        let mut state = self.state.borrow_mut();
        if state.sessions.remove(&session).is_some() {
            state.stats.sessions_destroyed += 1;
        }
    }

    fn create_session_parameters(
        &self,
        info: &ParametersCreateInfo,
    ) -> DeviceResult<ParametersHandle> {
        const CALL: &str = "create_video_session_parameters";

        let mut state = self.state.borrow_mut();
        state.check_injected(CALL)?;
        let codec = state
            .sessions
            .get(&info.session)
            .map(|s| s.info.profile.codec)
            .ok_or_else(|| invalid(CALL, "unknown session"))?;

        let mut keys = match info.template {
            Some(template) => match state.parameters.get(&template) {
                Some(t) if t.session == info.session => t.keys.clone(),
                Some(_) => return Err(invalid(CALL, "template belongs to another session")),
                None => return Err(invalid(CALL, "unknown template")),
            },
            None => BTreeSet::new(),
        };
        for set in &info.sets {
            if set.kind().codec() != codec {
                return Err(DeviceError::new(CALL, DeviceStatus::InvalidVideoStdParameters));
            }
            keys.insert(set.key());
        }

        let handle = ParametersHandle(state.new_handle());
        state.parameters.insert(
            handle,
            Parameters {
                session: info.session,
                keys,
                update_sequence_count: 0,
            },
        );
        state.stats.parameters_created += 1;

        Ok(handle)
    }

    fn update_session_parameters(
        &self,
        parameters: ParametersHandle,
        update_sequence_count: u32,
        sets: &[Rc<StdParameterSet>],
    ) -> DeviceResult<()> {
        const CALL: &str = "update_video_session_parameters";

        let mut state = self.state.borrow_mut();
        state.check_injected(CALL)?;
        let object = state
            .parameters
            .get_mut(&parameters)
            .ok_or_else(|| invalid(CALL, "unknown session parameters"))?;
        if update_sequence_count != object.update_sequence_count + 1 {
            return Err(invalid(
                CALL,
                format!(
                    "update sequence count {} after {}",
                    update_sequence_count, object.update_sequence_count
                ),
            ));
        }
        for set in sets {
            if object.keys.contains(&set.key()) {
                return Err(invalid(CALL, format!("{:?} is already present", set.key())));
            }
        }
        object.keys.extend(sets.iter().map(|set| set.key()));
        object.update_sequence_count = update_sequence_count;
        state.stats.parameters_updated += 1;

        Ok(())
    }

    fn destroy_session_parameters(&self, parameters: ParametersHandle) {
        let mut state = self.state.borrow_mut();
        if state.parameters.remove(&parameters).is_some() {
            state.stats.parameters_destroyed += 1;
        }
    }

    fn create_image(&self, info: &ImageCreateInfo) -> DeviceResult<ImageHandle> {
        const CALL: &str = "create_image";

        let mut state = self.state.borrow_mut();
        state.check_injected(CALL)?;
        if info.profile.is_none()
            && !self
                .config
                .flags
                .contains(VideoCapabilityFlags::PROFILE_INDEPENDENT_IMAGES)
        {
            return Err(DeviceError::new(CALL, DeviceStatus::FormatNotSupported));
        }
        if info.array_layers == 0 {
            return Err(invalid(CALL, "image without layers"));
        }

        let handle = ImageHandle(state.new_handle());
        state.images.insert(
            handle,
            Image {
                layers: vec![Vec::new(); info.array_layers as usize],
                layouts: vec![ImageLayout::Undefined; info.array_layers as usize],
            },
        );

        Ok(handle)
    }

    fn destroy_image(&self, image: ImageHandle) {
        self.state.borrow_mut().images.remove(&image);
    }

    fn create_bitstream_buffer(&self, size: u64) -> DeviceResult<BufferHandle> {
        const CALL: &str = "create_buffer";

        let mut state = self.state.borrow_mut();
        state.check_injected(CALL)?;
        let handle = BufferHandle(state.new_handle());
        state.buffers.insert(handle, vec![0; size as usize]);

        Ok(handle)
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> DeviceResult<()> {
        const CALL: &str = "write_buffer";

        let mut state = self.state.borrow_mut();
        let memory = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| invalid(CALL, "unknown buffer"))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > memory.len() {
            return Err(DeviceError::new(CALL, DeviceStatus::OutOfDeviceMemory));
        }
        memory[start..end].copy_from_slice(data);

        Ok(())
    }

    fn fill_buffer(
        &self,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
        value: u8,
    ) -> DeviceResult<()> {
        const CALL: &str = "fill_buffer";

        let mut state = self.state.borrow_mut();
        let memory = state
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| invalid(CALL, "unknown buffer"))?;
        let start = offset as usize;
        let end = start + size as usize;
        if end > memory.len() {
            return Err(DeviceError::new(CALL, DeviceStatus::OutOfDeviceMemory));
        }
        memory[start..end].fill(value);

        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        self.state.borrow_mut().buffers.remove(&buffer);
    }

    fn create_command_pool(&self, queue_family: u32) -> DeviceResult<CommandPoolHandle> {
        const CALL: &str = "create_command_pool";

        let mut state = self.state.borrow_mut();
        state.check_injected(CALL)?;
        if queue_family != DECODE_QUEUE_FAMILY {
            return Err(invalid(CALL, "queue family does not support decode"));
        }
        let handle = CommandPoolHandle(state.new_handle());
        state.command_pools.insert(handle, Vec::new());

        Ok(handle)
    }

    fn allocate_command_buffers(
        &self,
        pool: CommandPoolHandle,
        count: usize,
    ) -> DeviceResult<Vec<CommandBufferHandle>> {
        const CALL: &str = "allocate_command_buffers";

        let mut state = self.state.borrow_mut();
        state.check_injected(CALL)?;
        if !state.command_pools.contains_key(&pool) {
            return Err(invalid(CALL, "unknown command pool"));
        }
        let handles = (0..count)
            .map(|_| CommandBufferHandle(state.new_handle()))
            .collect::<Vec<_>>();
        for handle in &handles {
            state.command_buffers.insert(*handle, Vec::new());
        }
        if let Some(buffers) = state.command_pools.get_mut(&pool) {
            buffers.extend(handles.iter().copied());
        }

        Ok(handles)
    }

    fn destroy_command_pool(&self, pool: CommandPoolHandle) {
        let mut state = self.state.borrow_mut();
        if let Some(buffers) = state.command_pools.remove(&pool) {
            for buffer in buffers {
                state.command_buffers.remove(&buffer);
            }
        }
    }

    fn record_command_buffer(
        &self,
        command_buffer: CommandBufferHandle,
        commands: Vec<VideoCommand>,
    ) -> DeviceResult<()> {
        const CALL: &str = "record_command_buffer";

        let mut state = self.state.borrow_mut();
        state.check_injected(CALL)?;
        let recorded = state
            .command_buffers
            .get_mut(&command_buffer)
            .ok_or_else(|| invalid(CALL, "unknown command buffer"))?;
        *recorded = commands;

        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> DeviceResult<FenceHandle> {
        let mut state = self.state.borrow_mut();
        state.check_injected("create_fence")?;
        let handle = FenceHandle(state.new_handle());
        state.fences.insert(handle, signaled);

        Ok(handle)
    }

    fn reset_fence(&self, fence: FenceHandle) -> DeviceResult<()> {
        let mut state = self.state.borrow_mut();
        state.check_injected("reset_fences")?;
        let signaled = state
            .fences
            .get_mut(&fence)
            .ok_or_else(|| invalid("reset_fences", "unknown fence"))?;
        *signaled = false;

        Ok(())
    }

    fn fence_status(&self, fence: FenceHandle) -> DeviceResult<FenceStatus> {
        match self.state.borrow().fences.get(&fence) {
            Some(true) => Ok(FenceStatus::Signaled),
            Some(false) => Ok(FenceStatus::Unsignaled),
            None => Err(invalid("get_fence_status", "unknown fence")),
        }
    }

    fn wait_for_fence(&self, fence: FenceHandle, _timeout: Duration) -> DeviceResult<()> {
        let mut state = self.state.borrow_mut();
        state.check_injected("wait_for_fences")?;
        // Work completes at submission, so an unsignaled fence will never be signaled.
        match state.fences.get(&fence) {
            Some(true) => Ok(()),
            Some(false) => Err(DeviceError::new("wait_for_fences", DeviceStatus::Timeout)),
            None => Err(invalid("wait_for_fences", "unknown fence")),
        }
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        self.state.borrow_mut().fences.remove(&fence);
    }

    fn create_semaphore(&self) -> DeviceResult<SemaphoreHandle> {
        let mut state = self.state.borrow_mut();
        state.check_injected("create_semaphore")?;
        let handle = SemaphoreHandle(state.new_handle());
        state.semaphores.insert(handle, false);

        Ok(handle)
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        self.state.borrow_mut().semaphores.remove(&semaphore);
    }

    fn create_query_pool(
        &self,
        profile: &VideoProfile,
        query_count: u32,
    ) -> DeviceResult<QueryPoolHandle> {
        const CALL: &str = "create_query_pool";

        let mut state = self.state.borrow_mut();
        state.check_injected(CALL)?;
        if !self.config.codecs.contains(&profile.codec) {
            return Err(DeviceError::new(
                CALL,
                DeviceStatus::VideoProfileOperationNotSupported,
            ));
        }
        let handle = QueryPoolHandle(state.new_handle());
        state
            .query_pools
            .insert(handle, vec![QueryResultStatus::NotReady; query_count as usize]);

        Ok(handle)
    }

    fn query_decode_status(
        &self,
        pool: QueryPoolHandle,
        query: u32,
    ) -> DeviceResult<QueryResultStatus> {
        const CALL: &str = "get_query_pool_results";

        let mut state = self.state.borrow_mut();
        state.check_injected(CALL)?;
        state
            .query_pools
            .get(&pool)
            .and_then(|queries| queries.get(query as usize))
            .copied()
            .ok_or_else(|| invalid(CALL, "query out of range"))
    }

    fn destroy_query_pool(&self, pool: QueryPoolHandle) {
        self.state.borrow_mut().query_pools.remove(&pool);
    }

    fn queue_submit(&self, submit: &SubmitInfo) -> DeviceResult<()> {
        const CALL: &str = "queue_submit";

        let mut state = self.state.borrow_mut();
        state.check_injected(CALL)?;
        let commands = state
            .command_buffers
            .get(&submit.command_buffer)
            .cloned()
            .ok_or_else(|| invalid(CALL, "unknown command buffer"))?;
        if let Some(semaphore) = submit.wait_semaphore {
            if !state.semaphores.contains_key(&semaphore) {
                return Err(invalid(CALL, "unknown wait semaphore"));
            }
        }
        if let Some(fence) = submit.fence {
            match state.fences.get(&fence) {
                Some(false) => (),
                Some(true) => return Err(invalid(CALL, "fence is already signaled")),
                None => return Err(invalid(CALL, "unknown fence")),
            }
        }

        let mut exec = Execution::default();
        for command in commands {
            self.execute(&mut state, &mut exec, command)
                .map_err(|e| DeviceError::new(CALL, e.status))?;
        }
        if exec.scope.is_some() {
            return Err(invalid(CALL, "command buffer ends inside a coding scope"));
        }

        if let Some(semaphore) = submit.signal_semaphore {
            state.semaphores.insert(semaphore, true);
        }
        if let Some(fence) = submit.fence {
            state.fences.insert(fence, true);
        }
        state.stats.submissions += 1;

        Ok(())
    }

    fn read_picture(&self, resource: &PictureResource) -> DeviceResult<Vec<u8>> {
        self.state
            .borrow()
            .picture_content(resource)
            .map(|content| content.to_vec())
            .ok_or_else(|| invalid("read_picture", "unknown picture"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::H264PictureInfo;
    use crate::codec::h264::H264Pps;
    use crate::codec::h264::H264Sps;
    use crate::codec::ParameterSetPayload;
    use crate::codec::ReferenceInfo;
    use crate::device::ImageUsage;
    use crate::device::ReferenceSlot;

    fn session_info(profile: VideoProfile) -> SessionCreateInfo {
        SessionCreateInfo {
            queue_family: DECODE_QUEUE_FAMILY,
            flags: SessionCreateFlags::empty(),
            profile,
            picture_format: PictureFormat::Nv12,
            max_coded_extent: Resolution {
                width: 320,
                height: 240,
            },
            reference_picture_format: PictureFormat::Nv12,
            max_dpb_slots: 4,
            max_active_reference_pictures: 3,
        }
    }

    fn sets() -> Vec<Rc<StdParameterSet>> {
        vec![
            StdParameterSet::new(ParameterSetPayload::H264Sps(H264Sps::default()), 0),
            StdParameterSet::new(ParameterSetPayload::H264Pps(H264Pps::default()), 0),
        ]
    }

    fn picture(device: &EmulatedDevice) -> PictureResource {
        let image = device
            .create_image(&ImageCreateInfo {
                profile: None,
                format: PictureFormat::Nv12,
                extent: Resolution {
                    width: 320,
                    height: 240,
                },
                array_layers: 1,
                usage: ImageUsage::DECODE_DPB | ImageUsage::DECODE_DST,
            })
            .unwrap();

        PictureResource {
            image,
            base_array_layer: 0,
            coded_extent: Resolution {
                width: 320,
                height: 240,
            },
        }
    }

    /// Records an intra decode of `payload` into `resource`, set up in `slot`.
    fn intra_decode(
        device: &EmulatedDevice,
        session: SessionHandle,
        parameters: ParametersHandle,
        resource: PictureResource,
        slot: i32,
        reset: bool,
    ) -> Vec<VideoCommand> {
        let buffer = device.create_bitstream_buffer(256).unwrap();
        device.write_buffer(buffer, 0, &[1, 2, 3, 4]).unwrap();
        let setup = ReferenceSlot {
            slot_index: slot,
            resource: Some(resource),
            info: ReferenceInfo::None,
        };
        let mut commands = vec![VideoCommand::BeginCoding(BeginCodingInfo {
            session,
            parameters: Some(parameters),
            reference_slots: vec![ReferenceSlot {
                slot_index: -1,
                ..setup.clone()
            }],
        })];
        if reset {
            commands.push(VideoCommand::ControlReset);
        }
        commands.extend([
            VideoCommand::PipelineBarrier {
                buffer_barriers: vec![],
                image_barriers: vec![ImageBarrier {
                    image: resource.image,
                    base_array_layer: 0,
                    old_layout: ImageLayout::Undefined,
                    new_layout: ImageLayout::DecodeDpb,
                }],
            },
            VideoCommand::Decode(DecodeInfo {
                src_buffer: buffer,
                src_offset: 0,
                src_range: 256,
                dst: resource,
                setup_slot: Some(setup),
                reference_slots: vec![],
                picture_info: CodecPictureInfo::H264(H264PictureInfo::default()),
                inline_parameters: vec![],
                inline_query: None,
            }),
            VideoCommand::EndCoding,
        ]);

        commands
    }

    fn submit(device: &EmulatedDevice, commands: Vec<VideoCommand>) -> DeviceResult<()> {
        let pool = device.create_command_pool(DECODE_QUEUE_FAMILY).unwrap();
        let cmd = device.allocate_command_buffers(pool, 1).unwrap()[0];
        device.record_command_buffer(cmd, commands).unwrap();
        let fence = device.create_fence(false).unwrap();
        device.queue_submit(&SubmitInfo {
            command_buffer: cmd,
            wait_semaphore: None,
            signal_semaphore: None,
            fence: Some(fence),
        })?;
        assert_eq!(device.fence_status(fence), Ok(FenceStatus::Signaled));
        Ok(())
    }

    #[test]
    fn decode_requires_codec_reset() {
        let device = EmulatedDevice::new(Default::default());
        let profile = VideoProfile::new(CodecOperation::DecodeH264, 100);
        let session = device.create_video_session(&session_info(profile)).unwrap();
        let parameters = device
            .create_session_parameters(&ParametersCreateInfo {
                session,
                template: None,
                sets: sets(),
            })
            .unwrap();
        let resource = picture(&device);

        let err = submit(
            &device,
            intra_decode(&device, session, parameters, resource, 0, false),
        )
        .unwrap_err();
        assert_eq!(err.status, DeviceStatus::ValidationFailed);

        submit(
            &device,
            intra_decode(&device, session, parameters, resource, 0, true),
        )
        .unwrap();
        assert_eq!(device.active_slots(session)[0], Some(resource));
        assert_eq!(device.read_picture(&resource).unwrap().len(), 4);
    }

    #[test]
    fn decode_requires_parameter_sets() {
        let device = EmulatedDevice::new(Default::default());
        let profile = VideoProfile::new(CodecOperation::DecodeH264, 100);
        let session = device.create_video_session(&session_info(profile)).unwrap();
        let parameters = device
            .create_session_parameters(&ParametersCreateInfo {
                session,
                template: None,
                sets: sets()[..1].to_vec(),
            })
            .unwrap();
        let resource = picture(&device);

        let err = submit(
            &device,
            intra_decode(&device, session, parameters, resource, 0, true),
        )
        .unwrap_err();
        assert_eq!(err.status, DeviceStatus::InvalidVideoStdParameters);
    }

    #[test]
    fn parameters_update_sequence() {
        let device = EmulatedDevice::new(Default::default());
        let profile = VideoProfile::new(CodecOperation::DecodeH264, 100);
        let session = device.create_video_session(&session_info(profile)).unwrap();
        let sets = sets();
        let parameters = device
            .create_session_parameters(&ParametersCreateInfo {
                session,
                template: None,
                sets: sets[..1].to_vec(),
            })
            .unwrap();

        // Skipping a count is invalid, as is adding a key twice.
        assert!(device
            .update_session_parameters(parameters, 2, &sets[1..])
            .is_err());
        device
            .update_session_parameters(parameters, 1, &sets[1..])
            .unwrap();
        assert!(device
            .update_session_parameters(parameters, 2, &sets[1..])
            .is_err());
        assert_eq!(device.stats().parameters_updated, 1);
    }

    #[test]
    fn session_creation_checks_capabilities() {
        let device = EmulatedDevice::new(Default::default());
        let profile = VideoProfile::new(CodecOperation::DecodeAv1, 0);
        let mut info = session_info(profile);
        info.max_dpb_slots = 17;
        assert!(device.create_video_session(&info).is_err());
        info.max_dpb_slots = 9;
        info.max_active_reference_pictures = 8;
        assert!(device.create_video_session(&info).is_ok());
    }

    #[test]
    fn injected_failure_fires_once() {
        let device = EmulatedDevice::new(Default::default());
        device.fail_next("create_fence", DeviceStatus::OutOfHostMemory);
        assert_eq!(
            device.create_fence(true),
            Err(DeviceError::new("create_fence", DeviceStatus::OutOfHostMemory))
        );
        assert!(device.create_fence(true).is_ok());
    }
}
