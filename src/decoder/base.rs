// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoder driving a [`VideoDevice`] from parser callbacks.
//!
//! [`VideoBaseDecoder`] implements [`VideoDecodeClient`]. For each sequence it creates or reuses
//! a [`VideoSession`], sizes the DPB slot table, the picture pool and the per-frame contexts.
//! For each picture it maps the references to DPB slots and captures everything the decode
//! needs in a [`CachedDecodeParameters`]. In [`DecodeMode::Immediate`] the decode is then
//! recorded and submitted right away; in [`DecodeMode::Cached`] it is kept until
//! [`VideoBaseDecoder::decode_frames_out_of_order`] records a whole batch in shuffled order.

mod h264;
mod h265;
mod store;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use log::debug;
use log::error;
use log::trace;
use log::warn;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::codec::CodecPictureData;
use crate::codec::CodecPictureInfo;
use crate::codec::PictureData;
use crate::codec::SequenceInfo;
use crate::codec::StdParameterSet;
use crate::decoder::bitstream::BitstreamBufferPool;
use crate::decoder::bitstream::SharedBitstreamBuffer;
use crate::decoder::dpb::DpbTracker;
use crate::decoder::frame_buffer::DecodedFrame;
use crate::decoder::frame_buffer::FrameBuffer;
use crate::decoder::frame_buffer::ImagePoolConfig;
use crate::decoder::frame_buffer::Picture;
use crate::decoder::frame_buffer::PictureBuffer;
use crate::decoder::frame_data::FrameDataPool;
use crate::decoder::parameters::SessionParameters;
use crate::decoder::policy::ConfigPolicy;
use crate::decoder::policy::SessionPolicy;
use crate::decoder::session::VideoSession;
use crate::decoder::DecodeError;
use crate::decoder::DecodeMode;
use crate::decoder::DecodeResult;
use crate::decoder::DecoderConfig;
use crate::decoder::VideoDecodeClient;
use crate::device::BeginCodingInfo;
use crate::device::BufferBarrier;
use crate::device::DecodeCapabilityFlags;
use crate::device::DecodeInfo;
use crate::device::FenceStatus;
use crate::device::ImageBarrier;
use crate::device::ImageLayout;
use crate::device::PictureResource;
use crate::device::QueryPoolHandle;
use crate::device::QueryResultStatus;
use crate::device::ReferenceSlot;
use crate::device::SessionCreateFlags;
use crate::device::SessionCreateInfo;
use crate::device::SubmitInfo;
use crate::device::VideoCapabilities;
use crate::device::VideoCapabilityFlags;
use crate::device::VideoCommand;
use crate::device::VideoDevice;
use crate::utils::align_up;
use crate::ChromaSubsampling;
use crate::CodecOperation;
use crate::PictureFormat;
use crate::Resolution;
use crate::VideoProfile;
use crate::MAX_PICTURE_BUFFERS;

/// How long to wait for the previous decode of a frame slot before giving up.
const FRAME_FENCE_TIMEOUT: Duration = Duration::from_millis(100);

/// Picture buffers allocated on top of what the stream needs, so the consumer can hold a few
/// decoded frames.
const EXTRA_PICTURE_BUFFERS: usize = 4;

/// Seed of the order cached decodes are recorded in.
const OUT_OF_ORDER_SEED: u64 = 42;

/// The DPB slots a decode uses, as computed by the per-codec fill functions.
pub(crate) struct DpbState {
    pub(crate) reference_slots: Vec<ReferenceSlot>,
    pub(crate) setup_slot: Option<ReferenceSlot>,
    pub(crate) picture_info: CodecPictureInfo,
    /// Pictures backing `reference_slots`.
    pub(crate) references: Vec<PictureBuffer>,
}

/// The properties of a sequence that decide how sessions and images are created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DetectedVideoFormat {
    pub codec: CodecOperation,
    pub chroma_subsampling: ChromaSubsampling,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub progressive: bool,
    pub film_grain: bool,
    pub coded_extent: Resolution,
}

impl DetectedVideoFormat {
    pub fn new(info: &SequenceInfo) -> Self {
        Self {
            codec: info.codec,
            chroma_subsampling: info.chroma_subsampling,
            bit_depth_luma_minus8: info.bit_depth_luma_minus8,
            bit_depth_chroma_minus8: info.bit_depth_chroma_minus8,
            progressive: info.progressive,
            film_grain: info.film_grain,
            coded_extent: info.coded_extent,
        }
    }

    /// Whether pictures of `other` need a different picture format or profile.
    pub fn format_changed(&self, other: &Self) -> bool {
        self.codec != other.codec
            || self.chroma_subsampling != other.chroma_subsampling
            || self.bit_depth_luma_minus8 != other.bit_depth_luma_minus8
            || self.bit_depth_chroma_minus8 != other.bit_depth_chroma_minus8
            || self.progressive != other.progressive
            || self.film_grain != other.film_grain
    }
}

/// Everything needed to record and submit the decode of one picture.
///
/// The pictures, bitstream buffer and parameters object are held until the decode completes.
#[derive(Debug)]
pub struct CachedDecodeParameters {
    /// Position of the picture in decode order.
    pub pic_num: u64,
    /// Frame data slot the decode is recorded and submitted with.
    pub frame_slot: usize,
    pub perform_codec_reset: bool,
    pub current: PictureBuffer,
    pub bitstream: SharedBitstreamBuffer,
    pub src_offset: u64,
    pub src_range: u64,
    pub picture_info: CodecPictureInfo,
    /// Parameter sets the picture uses, in VPS, SPS, PPS order.
    pub parameter_sets: Vec<Rc<StdParameterSet>>,
    pub reference_slots: Vec<ReferenceSlot>,
    pub setup_slot: Option<ReferenceSlot>,
    /// Slots bound when beginning the coding scope: the references plus the setup slot with
    /// index -1.
    pub begin_slots: Vec<ReferenceSlot>,
    pub dst: PictureResource,
    pub image_barriers: Vec<ImageBarrier>,
    pub buffer_barrier: BufferBarrier,
    /// The parameters object bound for the decode, once resolved.
    pub parameters: Option<Rc<RefCell<SessionParameters>>>,
    pub references: Vec<PictureBuffer>,
}

/// Decoder turning parser callbacks into decode work on a [`VideoDevice`].
pub struct VideoBaseDecoder {
    device: Rc<dyn VideoDevice>,
    codec: CodecOperation,
    config: DecoderConfig,
    policy: Box<dyn SessionPolicy>,
    profile: Option<VideoProfile>,
    capabilities: Option<VideoCapabilities>,
    video_format: Option<DetectedVideoFormat>,
    session: Option<Rc<VideoSession>>,
    dpb: DpbTracker<Picture>,
    frame_buffer: FrameBuffer,
    frame_data: FrameDataPool,
    /// Decode submitted from each frame data slot, kept until its fence is waited for.
    in_flight: Vec<Option<CachedDecodeParameters>>,
    query_pool: Option<QueryPoolHandle>,
    bitstream_pool: Option<Rc<RefCell<BitstreamBufferPool>>>,
    current_parameters: Option<Rc<RefCell<SessionParameters>>>,
    /// Objects moved to the current session on behalf of older parameter sets.
    migrated_parameters: Vec<Rc<RefCell<SessionParameters>>>,
    parameter_update_count: usize,
    /// Whether the next decode must reset the codec first.
    reset_decoder: bool,
    pic_num_in_decode_order: u64,
    cached: Vec<CachedDecodeParameters>,
}

impl VideoBaseDecoder {
    /// Creates a decoder for streams of `codec`, with the [`ConfigPolicy`] of `config`.
    pub fn new(device: Rc<dyn VideoDevice>, codec: CodecOperation, config: DecoderConfig) -> Self {
        let policy = Box::new(ConfigPolicy::new(&config));

        Self {
            frame_buffer: FrameBuffer::new(Rc::clone(&device)),
            frame_data: FrameDataPool::new(Rc::clone(&device)),
            device,
            codec,
            config,
            policy,
            profile: None,
            capabilities: None,
            video_format: None,
            session: None,
            dpb: DpbTracker::new(codec.max_dpb_slots()),
            in_flight: Vec::new(),
            query_pool: None,
            bitstream_pool: None,
            current_parameters: None,
            migrated_parameters: Vec::new(),
            parameter_update_count: 0,
            reset_decoder: false,
            pic_num_in_decode_order: 0,
            cached: Vec::new(),
        }
    }

    /// Replaces the policy deciding when sessions and parameters objects are recreated.
    pub fn with_policy(mut self, policy: Box<dyn SessionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn device(&self) -> &Rc<dyn VideoDevice> {
        &self.device
    }

    pub fn codec(&self) -> CodecOperation {
        self.codec
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// The profile of the current sequence.
    pub fn profile(&self) -> Option<&VideoProfile> {
        self.profile.as_ref()
    }

    pub fn video_format(&self) -> Option<&DetectedVideoFormat> {
        self.video_format.as_ref()
    }

    pub fn session(&self) -> Option<&Rc<VideoSession>> {
        self.session.as_ref()
    }

    pub fn dpb(&self) -> &DpbTracker<Picture> {
        &self.dpb
    }

    pub fn frame_buffer(&self) -> &FrameBuffer {
        &self.frame_buffer
    }

    pub fn frame_buffer_mut(&mut self) -> &mut FrameBuffer {
        &mut self.frame_buffer
    }

    pub fn current_parameters(&self) -> Option<&Rc<RefCell<SessionParameters>>> {
        self.current_parameters.as_ref()
    }

    /// Number of decodes waiting to be recorded.
    pub fn num_cached(&self) -> usize {
        self.cached.len()
    }

    /// Number of pictures handed to [`VideoDecodeClient::decode_picture`] so far.
    pub fn pictures_decoded(&self) -> u64 {
        self.pic_num_in_decode_order
    }

    pub fn dequeue_decoded_frame(&mut self) -> Option<DecodedFrame> {
        self.frame_buffer.dequeue_decoded_picture()
    }

    pub fn release_displayed_frame(&mut self, frame: &mut DecodedFrame) {
        self.frame_buffer.release_displayed_frame(frame)
    }

    pub fn displayable_count(&self) -> usize {
        self.frame_buffer.displayable_count()
    }

    /// Decodes every cached picture and waits for all submitted decodes to complete.
    pub fn flush(&mut self) -> DecodeResult<()> {
        self.decode_frames_out_of_order()?;
        for slot in 0..self.in_flight.len() {
            if self.in_flight[slot].is_some() {
                self.wait_for_frame_fences(slot)?;
            }
        }

        Ok(())
    }

    /// Records the cached decodes in a shuffled order, then submits them in decode order.
    ///
    /// Two cached decodes are always recorded swapped. Each decode is recorded into the command
    /// buffer of its own frame slot, so only the recording order changes.
    pub fn decode_frames_out_of_order(&mut self) -> DecodeResult<()> {
        let mut batch = std::mem::take(&mut self.cached);
        if batch.is_empty() {
            return Ok(());
        }

        for params in batch.iter_mut() {
            self.wait_for_frame_fences(params.frame_slot)?;
            self.apply_picture_parameters(params)?;
        }

        let mut order = (0..batch.len()).collect::<Vec<_>>();
        if order.len() == 2 {
            order.swap(0, 1);
        } else {
            order.shuffle(&mut StdRng::seed_from_u64(OUT_OF_ORDER_SEED));
        }
        debug!("recording {} cached decodes in order {:?}", batch.len(), order);
        for &index in &order {
            self.record_command_buffer(&batch[index])?;
        }

        for params in batch {
            self.submit_queue(&params)?;
            self.query_decode_results(&params)?;
            let slot = params.frame_slot;
            self.in_flight[slot] = Some(params);
        }

        Ok(())
    }

    /// Waits for the previous decode submitted from `slot` and releases what it held.
    fn wait_for_frame_fences(&mut self, slot: usize) -> DecodeResult<()> {
        let fence = self.frame_data.frame_data(slot).fence;
        self.device.wait_for_fence(fence, FRAME_FENCE_TIMEOUT)?;
        if let Some(done) = self.in_flight[slot].take() {
            trace!("decode of picture {} retired from slot {}", done.pic_num, slot);
        }

        Ok(())
    }

    /// Releases what completed decodes held, without waiting.
    fn retire_completed(&mut self) -> DecodeResult<()> {
        for slot in 0..self.in_flight.len() {
            if self.in_flight[slot].is_none() {
                continue;
            }
            let fence = self.frame_data.frame_data(slot).fence;
            if self.device.fence_status(fence)? == FenceStatus::Signaled {
                self.in_flight[slot] = None;
            }
        }

        Ok(())
    }

    /// Resolves the parameters object the decode binds, moving it to the current session if it
    /// was created for another one.
    fn apply_picture_parameters(&mut self, params: &mut CachedDecodeParameters) -> DecodeResult<()> {
        if !self.codec.uses_session_parameters() || self.config.use_inline_session_params {
            return Ok(());
        }
        let session = self.session.clone().ok_or(DecodeError::NoSession)?;

        let owner = params
            .parameter_sets
            .last()
            .and_then(|set| set.client_object())
            .or_else(|| self.current_parameters.clone())
            .ok_or_else(|| {
                DecodeError::InvalidParameters(format!(
                    "no parameters object holds the sets of picture {}",
                    params.pic_num
                ))
            })?;

        let owner = if owner.borrow().bound_session_matches(&session) {
            owner
        } else {
            let migrated = SessionParameters::migrate(&owner, &session)?;
            let is_current = self
                .current_parameters
                .as_ref()
                .map(|current| Rc::ptr_eq(current, &owner))
                .unwrap_or(true);
            if is_current {
                self.current_parameters = Some(Rc::clone(&migrated));
            } else {
                self.migrated_parameters.push(Rc::clone(&migrated));
            }
            migrated
        };

        owner.borrow_mut().flush_picture_parameters_queue(&session)?;
        {
            let owner = owner.borrow();
            if let Some(missing) = params
                .parameter_sets
                .iter()
                .find(|set| !owner.has_id(set.kind(), set.node_id()))
            {
                return Err(DecodeError::InvalidParameters(format!(
                    "parameters object {:?} lacks {:?}",
                    owner.id(),
                    missing.key()
                )));
            }
        }
        params.parameters = Some(owner);

        Ok(())
    }

    fn record_command_buffer(&self, params: &CachedDecodeParameters) -> DecodeResult<()> {
        let session = self.session.as_ref().ok_or(DecodeError::NoSession)?;
        let inline_parameters = self.config.use_inline_session_params;

        let query = match self.query_pool {
            Some(pool) if self.config.query_decode_status => Some((pool, params.frame_slot as u32)),
            _ => None,
        };
        let inline_query = query.filter(|_| self.config.use_inline_queries);

        let mut commands = Vec::new();
        if let Some((pool, query)) = query {
            commands.push(VideoCommand::ResetQueryPool {
                pool,
                first_query: query,
                query_count: 1,
            });
        }

        let begin = BeginCodingInfo {
            session: session.handle(),
            parameters: if inline_parameters {
                None
            } else {
                params.parameters.as_ref().and_then(|p| p.borrow().handle())
            },
            reference_slots: params.begin_slots.clone(),
        };
        if params.perform_codec_reset && !self.policy.bind_parameters_on_reset() {
            commands.push(VideoCommand::BeginCoding(BeginCodingInfo {
                session: session.handle(),
                parameters: None,
                reference_slots: Vec::new(),
            }));
            commands.push(VideoCommand::ControlReset);
            commands.push(VideoCommand::EndCoding);
            commands.push(VideoCommand::BeginCoding(begin));
        } else {
            commands.push(VideoCommand::BeginCoding(begin));
            if params.perform_codec_reset {
                commands.push(VideoCommand::ControlReset);
            }
        }

        commands.push(VideoCommand::PipelineBarrier {
            buffer_barriers: vec![params.buffer_barrier],
            image_barriers: params.image_barriers.clone(),
        });

        let separate_query = if inline_query.is_none() { query } else { None };
        if let Some((pool, query)) = separate_query {
            commands.push(VideoCommand::BeginQuery { pool, query });
        }
        commands.push(VideoCommand::Decode(DecodeInfo {
            src_buffer: params.bitstream.handle(),
            src_offset: params.src_offset,
            src_range: params.src_range,
            dst: params.dst,
            setup_slot: params.setup_slot.clone(),
            reference_slots: params.reference_slots.clone(),
            picture_info: params.picture_info.clone(),
            inline_parameters: if inline_parameters {
                params.parameter_sets.clone()
            } else {
                Vec::new()
            },
            inline_query,
        }));
        if let Some((pool, query)) = separate_query {
            commands.push(VideoCommand::EndQuery { pool, query });
        }
        commands.push(VideoCommand::EndCoding);

        trace!(
            "recording {} commands for picture {} in frame slot {}",
            commands.len(),
            params.pic_num,
            params.frame_slot
        );
        self.device.record_command_buffer(
            self.frame_data.get_command_buffer(params.frame_slot),
            commands,
        )?;

        Ok(())
    }

    fn submit_queue(&self, params: &CachedDecodeParameters) -> DecodeResult<()> {
        let frame = *self.frame_data.frame_data(params.frame_slot);
        self.device.reset_fence(frame.fence)?;
        self.device
            .queue_submit(&SubmitInfo {
                command_buffer: frame.command_buffer,
                wait_semaphore: None,
                signal_semaphore: Some(frame.semaphore),
                fence: Some(frame.fence),
            })
            .map_err(|e| {
                error!("decode of picture {} failed: {}", params.pic_num, e);
                e
            })?;

        let mut state = params.current.state_mut();
        state.submitted = true;
        state.frame_complete_fence = Some(frame.fence);

        Ok(())
    }

    fn query_decode_results(&self, params: &CachedDecodeParameters) -> DecodeResult<()> {
        let Some(pool) = self.query_pool.filter(|_| self.config.query_decode_status) else {
            return Ok(());
        };

        let status = self
            .device
            .query_decode_status(pool, params.frame_slot as u32)?;
        if status != QueryResultStatus::Complete {
            error!("decode of picture {} reported {:?}", params.pic_num, status);
            return Err(DecodeError::DecodeQueryFailed { status });
        }

        Ok(())
    }

    fn decode_picture_with_parameters(
        &mut self,
        mut params: CachedDecodeParameters,
    ) -> DecodeResult<()> {
        self.wait_for_frame_fences(params.frame_slot)?;
        self.apply_picture_parameters(&mut params)?;
        self.record_command_buffer(&params)?;
        self.submit_queue(&params)?;
        self.query_decode_results(&params)?;
        let slot = params.frame_slot;
        self.in_flight[slot] = Some(params);

        Ok(())
    }

    fn recreate_query_pool(&mut self, profile: &VideoProfile) -> DecodeResult<()> {
        if let Some(pool) = self.query_pool.take() {
            self.device.destroy_query_pool(pool);
        }
        if self.config.query_decode_status {
            self.query_pool = Some(
                self.device
                    .create_query_pool(profile, self.frame_data.len() as u32)?,
            );
        }

        Ok(())
    }

    fn bitstream_pool(&mut self) -> Rc<RefCell<BitstreamBufferPool>> {
        let size_alignment = self
            .capabilities
            .as_ref()
            .map(|caps| caps.min_bitstream_buffer_size_alignment as usize)
            .unwrap_or(1);
        let pool = self.bitstream_pool.get_or_insert_with(|| {
            BitstreamBufferPool::new(
                Rc::clone(&self.device),
                self.config.bitstream_buffer_size,
                size_alignment,
            )
        });

        Rc::clone(pool)
    }

    /// Checks that the device can decode `profile` the way the configuration asks.
    fn check_capabilities(
        &self,
        info: &SequenceInfo,
        profile: &VideoProfile,
        format: PictureFormat,
        caps: &VideoCapabilities,
    ) -> DecodeResult<()> {
        if !caps.max_coded_extent.can_contain(info.coded_extent)
            || !info.coded_extent.can_contain(caps.min_coded_extent)
        {
            return Err(DecodeError::NotSupported(format!(
                "coded extent {}x{} outside of {}x{}..{}x{}",
                info.coded_extent.width,
                info.coded_extent.height,
                caps.min_coded_extent.width,
                caps.min_coded_extent.height,
                caps.max_coded_extent.width,
                caps.max_coded_extent.height
            )));
        }
        if !caps.dpb_formats.contains(&format) || !caps.output_formats.contains(&format) {
            return Err(DecodeError::NotSupported(format!(
                "{:?} pictures for {:?}",
                format, profile
            )));
        }

        let required = [
            (
                self.config.resources_without_profiles,
                VideoCapabilityFlags::PROFILE_INDEPENDENT_IMAGES,
            ),
            (
                self.config.use_inline_queries,
                VideoCapabilityFlags::INLINE_QUERIES,
            ),
            (
                self.config.use_inline_session_params,
                VideoCapabilityFlags::INLINE_SESSION_PARAMETERS,
            ),
        ];
        for (wanted, flag) in required {
            if wanted && !caps.flags.contains(flag) {
                return Err(DecodeError::NotSupported(format!("{:?}", flag)));
            }
        }

        Ok(())
    }
}

impl VideoDecodeClient for VideoBaseDecoder {
    fn begin_sequence(&mut self, info: &SequenceInfo) -> DecodeResult<u32> {
        if info.codec != self.codec {
            return Err(DecodeError::NotSupported(format!(
                "{:?} sequence on a {:?} decoder",
                info.codec, self.codec
            )));
        }

        let profile = VideoProfile {
            codec: info.codec,
            chroma_subsampling: info.chroma_subsampling,
            luma_bit_depth: 8 + info.bit_depth_luma_minus8,
            chroma_bit_depth: 8 + info.bit_depth_chroma_minus8,
            std_profile: info.std_profile,
            interlaced: !info.progressive,
            film_grain: info.film_grain,
        };
        let format = PictureFormat::for_profile(&profile)
            .ok_or_else(|| DecodeError::NotSupported(format!("no picture format for {:?}", profile)))?;
        let caps = self.device.video_capabilities(&profile)?;
        self.check_capabilities(info, &profile, format, &caps)?;

        let codec_max_slots = self.codec.max_dpb_slots() as u32;
        let dpb_slots = if self.config.intra_only_decoding_no_setup_ref {
            0
        } else {
            let wanted = match info.min_num_dpb_slots {
                0 => codec_max_slots,
                n => n,
            };
            wanted.min(codec_max_slots).min(caps.max_dpb_slots)
        };

        let film_grain = info.film_grain && !self.config.force_disable_film_grain;
        let separate_output = film_grain
            || !caps
                .decode_flags
                .contains(DecodeCapabilityFlags::DPB_AND_OUTPUT_COINCIDE);
        if separate_output
            && !caps
                .decode_flags
                .contains(DecodeCapabilityFlags::DPB_AND_OUTPUT_DISTINCT)
        {
            return Err(DecodeError::NotSupported(
                "decode output distinct from the DPB".into(),
            ));
        }
        let layered_dpb = self.config.layered_dpb
            || !caps
                .flags
                .contains(VideoCapabilityFlags::SEPARATE_REFERENCE_IMAGES);

        let detected = DetectedVideoFormat::new(info);
        if let Some(previous) = &self.video_format {
            if previous.format_changed(&detected) {
                debug!("video format changed: {:?} -> {:?}", previous, detected);
            }
            if previous.coded_extent != detected.coded_extent {
                debug!(
                    "coded extent changed: {}x{} -> {}x{}",
                    previous.coded_extent.width,
                    previous.coded_extent.height,
                    detected.coded_extent.width,
                    detected.coded_extent.height
                );
            }
        }

        // Work of the previous sequence must not run against a replaced session.
        self.flush()?;

        let mut flags = SessionCreateFlags::empty();
        flags.set(
            SessionCreateFlags::INLINE_QUERIES,
            self.config.use_inline_queries,
        );
        flags.set(
            SessionCreateFlags::INLINE_SESSION_PARAMETERS,
            self.config.use_inline_session_params,
        );
        let session_info = SessionCreateInfo {
            queue_family: self.device.decode_queue_family(),
            flags,
            profile,
            picture_format: format,
            max_coded_extent: info.coded_extent,
            reference_picture_format: format,
            max_dpb_slots: dpb_slots,
            max_active_reference_pictures: caps
                .max_active_reference_pictures
                .min(dpb_slots.saturating_sub(1)),
        };

        let compatible = self
            .session
            .as_ref()
            .map(|session| session.is_compatible(self.device.id(), &session_info))
            .unwrap_or(false);
        let new_session = self.session.is_none() || self.policy.recreate_session(compatible);
        if new_session {
            self.dpb.init(dpb_slots as usize, false);
            // The previous session goes away once its parameters objects do.
            self.session = Some(VideoSession::create(&self.device, session_info)?);
            self.migrated_parameters.clear();
            self.reset_decoder = true;
        } else {
            let size = self.dpb.init(dpb_slots as usize, true);
            debug!("reusing video session with {} DPB slots", size);
        }

        let cached_frames = match self.config.decode_mode() {
            DecodeMode::Cached => self.config.frames_to_check,
            DecodeMode::Immediate => 0,
        };
        let num_pictures = ((info.min_num_decode_surfaces as usize).max(dpb_slots as usize + 1)
            + EXTRA_PICTURE_BUFFERS
            + cached_frames)
            .min(MAX_PICTURE_BUFFERS);
        let (num_pictures, images_recreated) =
            self.frame_buffer.init_image_pool(&ImagePoolConfig {
                profile: if self.config.resources_without_profiles {
                    None
                } else {
                    Some(profile)
                },
                dpb_format: format,
                output_format: format,
                extent: info.coded_extent,
                num_pictures,
                layered_dpb,
                separate_output,
            })?;
        if images_recreated && !new_session {
            // Slots of the reused session refer to images that are gone.
            self.dpb.init(dpb_slots as usize, false);
            self.reset_decoder = true;
        }

        let frame_data_recreated = if self.frame_data.is_empty() {
            self.frame_data.resize(num_pictures)?;
            true
        } else if self.frame_data.len() < num_pictures {
            debug!(
                "replacing {} frame data slots with {}",
                self.frame_data.len(),
                num_pictures
            );
            self.frame_data = FrameDataPool::new(Rc::clone(&self.device));
            self.frame_data.resize(num_pictures)?;
            true
        } else {
            false
        };
        if frame_data_recreated {
            self.in_flight = (0..self.frame_data.len()).map(|_| None).collect();
        }
        if new_session || frame_data_recreated || self.profile != Some(profile) {
            self.recreate_query_pool(&profile)?;
        }

        debug!(
            "sequence {:?} {}x{}: {} DPB slots, {} picture buffers",
            profile.codec,
            info.coded_extent.width,
            info.coded_extent.height,
            self.dpb.slots().len(),
            num_pictures
        );
        self.profile = Some(profile);
        self.capabilities = Some(caps);
        self.video_format = Some(detected);

        Ok(self.dpb.slots().len() as u32)
    }

    fn alloc_picture_buffer(&mut self, extent: Resolution) -> DecodeResult<PictureBuffer> {
        match self.frame_buffer.extent() {
            Some(pool_extent) if pool_extent.can_contain(extent) => (),
            Some(pool_extent) => {
                return Err(DecodeError::InvalidParameters(format!(
                    "picture of {}x{} requested from a {}x{} pool",
                    extent.width, extent.height, pool_extent.width, pool_extent.height
                )))
            }
            None => return Err(DecodeError::NoSession),
        }

        self.retire_completed()?;
        match self.frame_buffer.reserve_picture_buffer() {
            Err(DecodeError::OutOfPictureBuffers) => {
                // Pictures may still be held by pending decodes.
                self.flush()?;
                self.frame_buffer.reserve_picture_buffer()
            }
            result => result,
        }
    }

    fn decode_picture(&mut self, picture: &PictureData) -> DecodeResult<()> {
        if self.session.is_none() {
            return Err(DecodeError::NoSession);
        }
        if picture.codec.codec() != self.codec {
            return Err(DecodeError::InvalidParameters(format!(
                "{:?} picture on a {:?} decoder",
                picture.codec.codec(),
                self.codec
            )));
        }

        let age = self.pic_num_in_decode_order as i32;
        let current = Rc::clone(&picture.current);
        let state = match &picture.codec {
            CodecPictureData::H264(h264) => {
                h264::fill_dpb_h264_state(&mut self.dpb, picture, h264, age)?
            }
            CodecPictureData::H265(h265) => {
                h265::fill_dpb_h265_state(&mut self.dpb, picture, h265, age)?
            }
            CodecPictureData::Av1(av1) => {
                // Film grain needs an output distinct from the reference picture.
                let apply_grain = av1.apply_grain
                    && !self.config.force_disable_film_grain
                    && current.has_separate_output();
                store::fill_dpb_av1_state(&mut self.dpb, picture, av1, apply_grain, age)?
            }
            CodecPictureData::Vp9(vp9) => {
                store::fill_dpb_vp9_state(&mut self.dpb, picture, vp9, age)?
            }
        };

        let setup_resource = state.setup_slot.as_ref().and_then(|slot| slot.resource);
        let dst = current.output_resource();
        let mut image_barriers = Vec::new();
        {
            let mut pic_state = current.state_mut();
            if let Some(resource) = setup_resource {
                if pic_state.dpb_layout != ImageLayout::DecodeDpb {
                    image_barriers.push(ImageBarrier {
                        image: resource.image,
                        base_array_layer: resource.base_array_layer,
                        old_layout: ImageLayout::Undefined,
                        new_layout: ImageLayout::DecodeDpb,
                    });
                    pic_state.dpb_layout = ImageLayout::DecodeDpb;
                }
            }
            if setup_resource != Some(dst) {
                let layout = if current.has_separate_output() {
                    &mut pic_state.output_layout
                } else {
                    &mut pic_state.dpb_layout
                };
                if *layout != ImageLayout::DecodeDst {
                    image_barriers.push(ImageBarrier {
                        image: dst.image,
                        base_array_layer: dst.base_array_layer,
                        old_layout: ImageLayout::Undefined,
                        new_layout: ImageLayout::DecodeDst,
                    });
                    *layout = ImageLayout::DecodeDst;
                }
            }
        }

        let mut begin_slots = state.reference_slots.clone();
        if let Some(setup) = &state.setup_slot {
            begin_slots.push(ReferenceSlot {
                slot_index: -1,
                ..setup.clone()
            });
        }

        let (offset_alignment, size_alignment) = self
            .capabilities
            .as_ref()
            .map(|caps| {
                (
                    caps.min_bitstream_buffer_offset_alignment.max(1) as usize,
                    caps.min_bitstream_buffer_size_alignment.max(1) as usize,
                )
            })
            .unwrap_or((1, 1));
        if picture.bitstream_offset % offset_alignment != 0 {
            return Err(DecodeError::InvalidParameters(format!(
                "bitstream offset {} is not aligned to {}",
                picture.bitstream_offset, offset_alignment
            )));
        }
        let available = picture
            .bitstream
            .capacity()
            .saturating_sub(picture.bitstream_offset);
        if picture.bitstream_len > available {
            return Err(DecodeError::BitstreamBufferTooSmall {
                needed: picture.bitstream_len,
                capacity: available,
            });
        }
        let src_range = align_up(picture.bitstream_len, size_alignment).min(available);

        let frame_slot = self.frame_data.next_slot();
        let perform_codec_reset = std::mem::take(&mut self.reset_decoder);
        let params = CachedDecodeParameters {
            pic_num: self.pic_num_in_decode_order,
            frame_slot,
            perform_codec_reset,
            current,
            bitstream: Rc::clone(&picture.bitstream),
            src_offset: picture.bitstream_offset as u64,
            src_range: src_range as u64,
            picture_info: state.picture_info,
            parameter_sets: picture.codec.parameter_sets(),
            reference_slots: state.reference_slots,
            setup_slot: state.setup_slot,
            begin_slots,
            dst,
            image_barriers,
            buffer_barrier: BufferBarrier {
                buffer: picture.bitstream.handle(),
                offset: picture.bitstream_offset as u64,
                size: src_range as u64,
            },
            parameters: None,
            references: state.references,
        };
        trace!(
            "picture {} (buffer {}): setup {:?}, {} references, frame slot {}",
            params.pic_num,
            params.current.index(),
            params.setup_slot.as_ref().map(|slot| slot.slot_index),
            params.reference_slots.len(),
            frame_slot
        );
        self.pic_num_in_decode_order += 1;

        match self.config.decode_mode() {
            DecodeMode::Immediate => self.decode_picture_with_parameters(params),
            DecodeMode::Cached => {
                self.cached.push(params);
                if self.cached.len() >= self.frame_data.len() {
                    self.decode_frames_out_of_order()?;
                }
                Ok(())
            }
        }
    }

    fn update_picture_parameters(
        &mut self,
        set: &Rc<StdParameterSet>,
    ) -> DecodeResult<Rc<RefCell<SessionParameters>>> {
        if !self.codec.uses_session_parameters() || set.kind().codec() != self.codec {
            return Err(DecodeError::InvalidParameters(format!(
                "{:?} on a {:?} decoder",
                set.kind(),
                self.codec
            )));
        }

        self.parameter_update_count += 1;
        let trigger = self.policy.parameters_reset_trigger();
        if trigger.map(|t| t.get()) == Some(self.parameter_update_count) {
            if let Some(current) = self.current_parameters.take() {
                debug!(
                    "dropping session parameters {:?} after {} updates",
                    current.borrow().id(),
                    self.parameter_update_count
                );
                self.current_parameters = Some(SessionParameters::fork(&current));
            }
        }

        let pending = SessionParameters::add_picture_parameters(
            &self.device,
            self.session.as_ref(),
            set,
            &mut self.current_parameters,
        )?;
        trace!("{:?} added, {} sets pending", set.key(), pending);

        let current = self
            .current_parameters
            .clone()
            .ok_or(DecodeError::NoSession)?;
        set.set_client_object(Some(Rc::clone(&current)));

        Ok(current)
    }

    fn display_picture(&mut self, picture: &PictureBuffer, timestamp: u64) -> DecodeResult<()> {
        let display_order = self
            .frame_buffer
            .queue_decoded_picture_for_display(picture, timestamp);
        trace!(
            "picture buffer {} displayed as frame {}",
            picture.index(),
            display_order
        );

        Ok(())
    }

    fn unhandled_nalu(&mut self, data: &[u8]) {
        warn!(
            "ignoring unit of {} bytes starting with {:02x?}",
            data.len(),
            &data[..data.len().min(8)]
        );
    }

    fn get_bitstream_buffer(
        &mut self,
        size: usize,
        data: &[u8],
    ) -> DecodeResult<SharedBitstreamBuffer> {
        let pool = self.bitstream_pool();
        BitstreamBufferPool::get_buffer(&pool, size, data)
    }
}

impl Drop for VideoBaseDecoder {
    fn drop(&mut self) {
        if let Some(pool) = self.query_pool.take() {
            self.device.destroy_query_pool(pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::vp9::Vp9FrameType;
    use crate::codec::vp9::Vp9PictureData;
    use crate::device::emulated::EmulatedDevice;
    use crate::device::DeviceStatus;
    use crate::NUM_REF_FRAMES;

    fn sequence(codec: CodecOperation, width: u32, height: u32) -> SequenceInfo {
        SequenceInfo {
            codec,
            std_profile: match codec {
                CodecOperation::DecodeH264 => crate::h264_profile::BASELINE,
                _ => 0,
            },
            chroma_subsampling: ChromaSubsampling::Yuv420,
            bit_depth_luma_minus8: 0,
            bit_depth_chroma_minus8: 0,
            progressive: true,
            coded_extent: Resolution { width, height },
            min_num_decode_surfaces: 4,
            min_num_dpb_slots: 0,
            film_grain: false,
        }
    }

    type Store = [Option<PictureBuffer>; NUM_REF_FRAMES];

    /// Decodes a VP9 frame referencing store entries 0, 1 and 2, and refreshes the store with
    /// it.
    fn decode_vp9(decoder: &mut VideoBaseDecoder, store: &mut Store, key_frame: bool) -> PictureBuffer {
        let payload = [key_frame as u8, 0x9a, 0x55, decoder.pic_num_in_decode_order as u8];
        let current = decoder
            .alloc_picture_buffer(Resolution {
                width: 320,
                height: 240,
            })
            .unwrap();
        let bitstream = decoder.get_bitstream_buffer(payload.len(), &payload).unwrap();
        let refresh_frame_flags = if key_frame { 0xff } else { 0x01 };
        let picture = PictureData {
            current: Rc::clone(&current),
            codec: CodecPictureData::Vp9(Vp9PictureData {
                profile: 0,
                frame_type: if key_frame {
                    Vp9FrameType::KeyFrame
                } else {
                    Vp9FrameType::InterFrame
                },
                intra_only: false,
                show_frame: true,
                refresh_frame_flags,
                ref_frame_idx: [0, 1, 2],
                ref_frames: store.clone(),
            }),
            bitstream,
            bitstream_offset: 0,
            bitstream_len: payload.len(),
            slice_offsets: vec![0],
            progressive_frame: true,
            field_pic_flag: false,
            bottom_field_flag: false,
            second_field: false,
            top_field_first: false,
            ref_pic_flag: true,
            intra_pic_flag: key_frame,
            timestamp: 0,
        };
        decoder.decode_picture(&picture).unwrap();

        for (i, entry) in store.iter_mut().enumerate() {
            if refresh_frame_flags & (1 << i) != 0 {
                *entry = Some(Rc::clone(&current));
            }
        }
        current
    }

    fn read_output(decoder: &VideoBaseDecoder, picture: &PictureBuffer) -> Vec<u8> {
        decoder
            .device()
            .read_picture(&picture.output_resource())
            .unwrap()
    }

    #[test]
    fn compatible_sequence_reuses_session() {
        let device = EmulatedDevice::new(Default::default());
        let mut decoder =
            VideoBaseDecoder::new(device.clone(), CodecOperation::DecodeH264, Default::default());

        let info = sequence(CodecOperation::DecodeH264, 1920, 1080);
        assert_eq!(decoder.begin_sequence(&info).unwrap(), 17);
        let session = Rc::clone(decoder.session().unwrap());
        let refs = Rc::strong_count(&session);

        assert_eq!(decoder.begin_sequence(&info).unwrap(), 17);
        assert!(Rc::ptr_eq(&session, decoder.session().unwrap()));
        assert_eq!(Rc::strong_count(&session), refs);
        assert_eq!(device.stats().sessions_created, 1);
    }

    #[test]
    fn larger_sequence_gets_new_session() {
        let device = EmulatedDevice::new(Default::default());
        let mut decoder =
            VideoBaseDecoder::new(device.clone(), CodecOperation::DecodeH264, Default::default());

        decoder
            .begin_sequence(&sequence(CodecOperation::DecodeH264, 640, 480))
            .unwrap();
        decoder
            .begin_sequence(&sequence(CodecOperation::DecodeH264, 320, 240))
            .unwrap();
        assert_eq!(device.stats().sessions_created, 1);

        decoder
            .begin_sequence(&sequence(CodecOperation::DecodeH264, 1280, 720))
            .unwrap();
        assert_eq!(device.stats().sessions_created, 2);
        assert_eq!(device.stats().sessions_destroyed, 1);
    }

    #[test]
    fn always_recreate_dpb_recreates_session() {
        let device = EmulatedDevice::new(Default::default());
        let config = DecoderConfig {
            always_recreate_dpb: true,
            ..Default::default()
        };
        let mut decoder = VideoBaseDecoder::new(device.clone(), CodecOperation::DecodeH264, config);

        let info = sequence(CodecOperation::DecodeH264, 320, 240);
        decoder.begin_sequence(&info).unwrap();
        decoder.begin_sequence(&info).unwrap();
        assert_eq!(device.stats().sessions_created, 2);
    }

    #[test]
    fn codec_mismatch_is_not_supported() {
        let device = EmulatedDevice::new(Default::default());
        let mut decoder =
            VideoBaseDecoder::new(device, CodecOperation::DecodeH264, Default::default());

        assert!(matches!(
            decoder.begin_sequence(&sequence(CodecOperation::DecodeVp9, 320, 240)),
            Err(DecodeError::NotSupported(_))
        ));
        assert!(decoder.session().is_none());
    }

    #[test]
    fn intra_only_without_setup_has_no_slots() {
        let device = EmulatedDevice::new(Default::default());
        let config = DecoderConfig {
            intra_only_decoding_no_setup_ref: true,
            ..Default::default()
        };
        let mut decoder = VideoBaseDecoder::new(device.clone(), CodecOperation::DecodeVp9, config);
        assert_eq!(
            decoder
                .begin_sequence(&sequence(CodecOperation::DecodeVp9, 320, 240))
                .unwrap(),
            0
        );

        let mut store = Store::default();
        let picture = decode_vp9(&mut decoder, &mut store, true);
        assert_eq!(device.stats().decodes, 1);
        assert!(!read_output(&decoder, &picture).is_empty());

        // Key frames following a refresh of the store still need no slot.
        let second = decode_vp9(&mut decoder, &mut store, true);
        let third = decode_vp9(&mut decoder, &mut store, true);
        assert_eq!(device.stats().decodes, 3);
        for picture in [&picture, &second, &third] {
            assert_eq!(decoder.dpb().get_pic_dpb_slot(picture.index()), None);
        }
        assert_ne!(read_output(&decoder, &second), read_output(&decoder, &third));
    }

    #[test]
    fn vp9_inter_frames_use_references() {
        let device = EmulatedDevice::new(Default::default());
        let mut decoder =
            VideoBaseDecoder::new(device.clone(), CodecOperation::DecodeVp9, Default::default());
        decoder
            .begin_sequence(&sequence(CodecOperation::DecodeVp9, 320, 240))
            .unwrap();

        let mut store = Store::default();
        let key = decode_vp9(&mut decoder, &mut store, true);
        let inter = decode_vp9(&mut decoder, &mut store, false);
        assert_eq!(device.stats().decodes, 2);
        assert_eq!(device.stats().codec_resets, 1);

        // The key frame is still referenced through store entries 1 and 2.
        assert!(decoder.dpb().get_pic_dpb_slot(key.index()).is_some());
        assert!(decoder.dpb().get_pic_dpb_slot(inter.index()).is_some());
        assert_ne!(read_output(&decoder, &key), read_output(&decoder, &inter));
    }

    #[test]
    fn cached_decodes_match_immediate_ones() {
        let outputs = |out_of_order_decoding| {
            let device = EmulatedDevice::new(Default::default());
            let config = DecoderConfig {
                out_of_order_decoding,
                frames_to_check: 4,
                ..Default::default()
            };
            let mut decoder =
                VideoBaseDecoder::new(device.clone(), CodecOperation::DecodeVp9, config);
            decoder
                .begin_sequence(&sequence(CodecOperation::DecodeVp9, 320, 240))
                .unwrap();

            let mut store = Store::default();
            let pictures = (0..4)
                .map(|i| decode_vp9(&mut decoder, &mut store, i == 0))
                .collect::<Vec<_>>();
            if out_of_order_decoding {
                assert_eq!(decoder.num_cached(), 4);
                assert_eq!(device.stats().decodes, 0);
            }
            decoder.flush().unwrap();
            assert_eq!(decoder.num_cached(), 0);
            assert_eq!(device.stats().decodes, 4);

            pictures
                .iter()
                .map(|picture| read_output(&decoder, picture))
                .collect::<Vec<_>>()
        };

        assert_eq!(outputs(false), outputs(true));
    }

    #[test]
    fn query_failures_surface() {
        let device = EmulatedDevice::new(Default::default());
        let config = DecoderConfig {
            query_decode_status: true,
            ..Default::default()
        };
        let mut decoder = VideoBaseDecoder::new(device.clone(), CodecOperation::DecodeVp9, config);
        decoder
            .begin_sequence(&sequence(CodecOperation::DecodeVp9, 320, 240))
            .unwrap();

        let mut store = Store::default();
        decode_vp9(&mut decoder, &mut store, true);

        device.fail_next("get_query_pool_results", DeviceStatus::DeviceLost);
        let current = decoder
            .alloc_picture_buffer(Resolution {
                width: 320,
                height: 240,
            })
            .unwrap();
        let bitstream = decoder.get_bitstream_buffer(4, &[1, 2, 3, 4]).unwrap();
        let picture = PictureData {
            current,
            codec: CodecPictureData::Vp9(Vp9PictureData {
                profile: 0,
                frame_type: Vp9FrameType::InterFrame,
                intra_only: false,
                show_frame: true,
                refresh_frame_flags: 0,
                ref_frame_idx: [0, 0, 0],
                ref_frames: store.clone(),
            }),
            bitstream,
            bitstream_offset: 0,
            bitstream_len: 4,
            slice_offsets: vec![0],
            progressive_frame: true,
            field_pic_flag: false,
            bottom_field_flag: false,
            second_field: false,
            top_field_first: false,
            ref_pic_flag: false,
            intra_pic_flag: false,
            timestamp: 1,
        };
        match decoder.decode_picture(&picture) {
            Err(DecodeError::Device(e)) => assert_eq!(e.status, DeviceStatus::DeviceLost),
            r => panic!("unexpected result {:?}", r),
        }
    }

    #[test]
    fn vp9_has_no_parameter_sets() {
        let device = EmulatedDevice::new(Default::default());
        let mut decoder =
            VideoBaseDecoder::new(device, CodecOperation::DecodeVp9, Default::default());
        let sps = StdParameterSet::new(
            crate::codec::ParameterSetPayload::H264Sps(Default::default()),
            0,
        );

        assert!(matches!(
            decoder.update_picture_parameters(&sps),
            Err(DecodeError::InvalidParameters(_))
        ));
    }

    #[test]
    fn parameter_update_trigger_starts_a_new_object() {
        use crate::codec::h264::H264Pps;
        use crate::codec::h264::H264Sps;
        use crate::codec::ParameterSetPayload;

        let device = EmulatedDevice::new(Default::default());
        let config = DecoderConfig {
            picture_parameter_update_trigger: std::num::NonZeroUsize::new(3),
            ..Default::default()
        };
        let mut decoder = VideoBaseDecoder::new(device.clone(), CodecOperation::DecodeH264, config);
        decoder
            .begin_sequence(&sequence(CodecOperation::DecodeH264, 320, 240))
            .unwrap();

        let sps = StdParameterSet::new(ParameterSetPayload::H264Sps(H264Sps::default()), 0);
        let pps0 = StdParameterSet::new(ParameterSetPayload::H264Pps(H264Pps::default()), 0);
        let pps1 = StdParameterSet::new(
            ParameterSetPayload::H264Pps(H264Pps {
                pic_parameter_set_id: 1,
                ..Default::default()
            }),
            0,
        );
        decoder.update_picture_parameters(&sps).unwrap();
        decoder.update_picture_parameters(&pps0).unwrap();
        let first = Rc::clone(decoder.current_parameters().unwrap());
        assert_eq!(device.stats().parameters_created, 1);

        decoder.update_picture_parameters(&pps1).unwrap();
        let current = decoder.current_parameters().unwrap();
        assert!(!Rc::ptr_eq(&first, current));
        // The sets already known move over to the new object.
        assert!(Rc::ptr_eq(&sps.client_object().unwrap(), current));
        assert!(current.borrow().has_id(pps0.kind(), pps0.node_id()));
        assert_eq!(device.stats().parameters_created, 2);

        drop(first);
        assert_eq!(device.stats().parameters_destroyed, 1);
    }

    #[test]
    fn dropping_everything_releases_device_objects() {
        let device = EmulatedDevice::new(Default::default());
        let mut decoder =
            VideoBaseDecoder::new(device.clone(), CodecOperation::DecodeVp9, Default::default());
        decoder
            .begin_sequence(&sequence(CodecOperation::DecodeVp9, 320, 240))
            .unwrap();

        let mut store = Store::default();
        for i in 0..3 {
            let picture = decode_vp9(&mut decoder, &mut store, i == 0);
            decoder.display_picture(&picture, i).unwrap();
        }
        let mut frame = decoder.dequeue_decoded_frame().unwrap();
        decoder.release_displayed_frame(&mut frame);
        assert!(device.live_objects() > 0);

        drop(store);
        drop(decoder);
        assert_eq!(device.live_objects(), 0);
        let stats = device.stats();
        assert_eq!(stats.sessions_created, stats.sessions_destroyed);
    }
}
