// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decode core.
//!
//! [`base::VideoBaseDecoder`] receives the callbacks of a bitstream parser through the
//! [`VideoDecodeClient`] trait and turns them into decode work for a
//! [`VideoDevice`](crate::device::VideoDevice): it keeps the DPB slot bookkeeping
//! ([`dpb`]), owns the video session ([`session`]) and its session parameters objects
//! ([`parameters`]), and records decode commands using per-frame contexts from
//! [`frame_data`].

pub mod base;
pub mod bitstream;
pub mod dpb;
pub mod frame_buffer;
pub mod frame_data;
pub mod parameters;
pub mod policy;
pub mod session;

use std::cell::RefCell;
use std::num::NonZeroUsize;
use std::rc::Rc;

use thiserror::Error;

use crate::codec::PictureData;
use crate::codec::SequenceInfo;
use crate::codec::StdParameterSet;
use crate::decoder::bitstream::SharedBitstreamBuffer;
use crate::decoder::frame_buffer::PictureBuffer;
use crate::decoder::parameters::ParametersError;
use crate::decoder::parameters::SessionParameters;
use crate::device::DeviceError;
use crate::device::QueryResultStatus;
use crate::Resolution;

/// Size of the bitstream buffers handed to the parser, unless configured otherwise.
pub const DEFAULT_BITSTREAM_BUFFER_SIZE: usize = 2 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("ran out of DPB slots")]
    OutOfDpbSlots,
    #[error("ran out of picture buffers")]
    OutOfPictureBuffers,
    #[error("no video session has been created")]
    NoSession,
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("decode query reported {status:?}")]
    DecodeQueryFailed { status: QueryResultStatus },
    #[error("bitstream of {needed} bytes does not fit in a {capacity} bytes buffer")]
    BitstreamBufferTooSmall { needed: usize, capacity: usize },
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Parameters(#[from] ParametersError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Whether decode commands are recorded and submitted as pictures arrive, or buffered to be
/// recorded later in a different order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodeMode {
    #[default]
    Immediate,
    Cached,
}

/// Test configuration of a [`base::VideoBaseDecoder`].
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Number of frames the test intends to check. Bounds how many frames cached mode buffers.
    pub frames_to_check: usize,
    /// Back the DPB with a single image with one array layer per picture.
    pub layered_dpb: bool,
    /// Query and check the result status of each decode operation.
    pub query_decode_status: bool,
    /// Use queries written by the decode command itself.
    pub use_inline_queries: bool,
    /// Pass parameter sets with each decode instead of through a parameters object.
    pub use_inline_session_params: bool,
    /// Reset the codec in a coding scope that binds no session parameters.
    pub reset_codec_no_session_params: bool,
    /// Create images without a video profile.
    pub resources_without_profiles: bool,
    /// Buffer decodes and record them out of order, see [`DecodeMode::Cached`].
    pub out_of_order_decoding: bool,
    /// Create a new session and DPB on every sequence.
    pub always_recreate_dpb: bool,
    /// Decode intra-only streams without setting up reference pictures.
    pub intra_only_decoding_no_setup_ref: bool,
    /// Discard the current session parameters object after that many parameter set updates.
    pub picture_parameter_update_trigger: Option<NonZeroUsize>,
    pub force_disable_film_grain: bool,
    /// The stream changes resolution mid-way. Implies [`Self::always_recreate_dpb`].
    pub resolution_change: bool,
    pub bitstream_buffer_size: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            frames_to_check: 0,
            layered_dpb: false,
            query_decode_status: false,
            use_inline_queries: false,
            use_inline_session_params: false,
            reset_codec_no_session_params: false,
            resources_without_profiles: false,
            out_of_order_decoding: false,
            always_recreate_dpb: false,
            intra_only_decoding_no_setup_ref: false,
            picture_parameter_update_trigger: None,
            force_disable_film_grain: false,
            resolution_change: false,
            bitstream_buffer_size: DEFAULT_BITSTREAM_BUFFER_SIZE,
        }
    }
}

impl DecoderConfig {
    pub fn decode_mode(&self) -> DecodeMode {
        if self.out_of_order_decoding {
            DecodeMode::Cached
        } else {
            DecodeMode::Immediate
        }
    }
}

/// Callbacks a bitstream parser invokes while walking a stream.
///
/// For each sequence the parser calls `begin_sequence` first, then `alloc_picture_buffer` and
/// `decode_picture` for each picture, and `display_picture` once a decoded picture is due for
/// output. Parameter sets are reported through `update_picture_parameters` before the first
/// picture using them.
pub trait VideoDecodeClient {
    /// Starts a new sequence. Returns the number of DPB slots the decoder configured.
    fn begin_sequence(&mut self, info: &SequenceInfo) -> DecodeResult<u32>;

    /// Returns a picture buffer able to hold a picture of `extent`.
    fn alloc_picture_buffer(&mut self, extent: Resolution) -> DecodeResult<PictureBuffer>;

    fn decode_picture(&mut self, picture: &PictureData) -> DecodeResult<()>;

    /// Records a new or updated parameter set. Returns the session parameters object the set
    /// will be committed to, which also becomes the set's client object.
    fn update_picture_parameters(
        &mut self,
        set: &Rc<StdParameterSet>,
    ) -> DecodeResult<Rc<RefCell<SessionParameters>>>;

    fn display_picture(&mut self, picture: &PictureBuffer, timestamp: u64) -> DecodeResult<()>;

    /// Called for units of the stream the parser does not handle.
    fn unhandled_nalu(&mut self, data: &[u8]);

    /// Returns a bitstream buffer holding `data` at offset 0, with room for at least `size`
    /// bytes.
    fn get_bitstream_buffer(
        &mut self,
        size: usize,
        data: &[u8],
    ) -> DecodeResult<SharedBitstreamBuffer>;
}

/// A chunk of elementary stream handed to a [`VideoParser`].
#[derive(Clone, Copy, Debug)]
pub struct BitstreamPacket<'a> {
    pub data: &'a [u8],
    pub timestamp: u64,
    /// Set on the packet ending the stream, which may be empty.
    pub end_of_stream: bool,
}

/// A parser walking an elementary stream and reporting what it finds to a
/// [`VideoDecodeClient`].
pub trait VideoParser {
    fn parse_packet(
        &mut self,
        packet: &BitstreamPacket,
        client: &mut dyn VideoDecodeClient,
    ) -> DecodeResult<()>;
}
