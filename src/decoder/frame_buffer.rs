// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Picture buffers and the pool they come from.
//!
//! A [`Picture`] is backed by a DPB picture resource and, when decode output cannot be written
//! to the DPB, by a separate output resource. Pictures are shared as [`PictureBuffer`]s between
//! the parser, the DPB slots and the display queue; the [`FrameBuffer`] hands out again pictures
//! nobody else holds anymore.

use std::cell::Ref;
use std::cell::RefCell;
use std::cell::RefMut;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use log::debug;
use log::trace;

use crate::decoder::DecodeError;
use crate::decoder::DecodeResult;
use crate::device::FenceHandle;
use crate::device::ImageCreateInfo;
use crate::device::ImageHandle;
use crate::device::ImageLayout;
use crate::device::ImageUsage;
use crate::device::PictureResource;
use crate::device::VideoDevice;
use crate::PictureFormat;
use crate::Resolution;
use crate::VideoProfile;
use crate::MAX_PICTURE_BUFFERS;

/// An image of the device, destroyed when dropped.
pub struct DeviceImage {
    device: Rc<dyn VideoDevice>,
    handle: ImageHandle,
}

impl DeviceImage {
    fn create(device: &Rc<dyn VideoDevice>, info: &ImageCreateInfo) -> DecodeResult<Rc<Self>> {
        let handle = device.create_image(info)?;
        Ok(Rc::new(Self {
            device: Rc::clone(device),
            handle,
        }))
    }

    pub fn handle(&self) -> ImageHandle {
        self.handle
    }
}

impl Drop for DeviceImage {
    fn drop(&mut self) {
        self.device.destroy_image(self.handle);
    }
}

/// Per-use state of a picture, reset each time the picture is reserved.
#[derive(Clone, Debug, Default)]
pub struct PictureState {
    /// Position in decode order of the picture decoded into this buffer.
    pub decode_order: u64,
    pub display_order: Option<u64>,
    pub timestamp: u64,
    /// Whether the decode of the picture has been submitted to the device.
    pub submitted: bool,
    /// Signaled once the submission decoding the picture completes.
    pub frame_complete_fence: Option<FenceHandle>,
    pub dpb_layout: ImageLayout,
    pub output_layout: ImageLayout,
    /// Set once the consumer of the displayed picture has released it.
    pub consumer_done: bool,
}

/// A picture buffer of a [`FrameBuffer`].
pub struct Picture {
    index: usize,
    // Kept alive for `dpb`.
    _dpb_image: Rc<DeviceImage>,
    dpb: PictureResource,
    output: Option<(Rc<DeviceImage>, PictureResource)>,
    state: RefCell<PictureState>,
}

impl fmt::Debug for Picture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Picture")
            .field("index", &self.index)
            .field("dpb", &self.dpb)
            .field("output", &self.output.as_ref().map(|(_, r)| r))
            .finish()
    }
}

impl Picture {
    /// Index of the picture in its pool, below [`MAX_PICTURE_BUFFERS`].
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn dpb_resource(&self) -> PictureResource {
        self.dpb
    }

    /// The resource decode output is written to.
    pub fn output_resource(&self) -> PictureResource {
        self.output.as_ref().map(|(_, r)| *r).unwrap_or(self.dpb)
    }

    pub fn has_separate_output(&self) -> bool {
        self.output.is_some()
    }

    pub fn state(&self) -> Ref<PictureState> {
        self.state.borrow()
    }

    pub fn state_mut(&self) -> RefMut<PictureState> {
        self.state.borrow_mut()
    }
}

pub type PictureBuffer = Rc<Picture>;

/// How the pictures of a [`FrameBuffer`] are created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImagePoolConfig {
    /// `None` to create images without a video profile.
    pub profile: Option<VideoProfile>,
    pub dpb_format: PictureFormat,
    pub output_format: PictureFormat,
    pub extent: Resolution,
    pub num_pictures: usize,
    /// Back all DPB pictures with one image, one array layer per picture.
    pub layered_dpb: bool,
    /// Give each picture an output image distinct from its DPB image.
    pub separate_output: bool,
}

impl ImagePoolConfig {
    /// Whether pictures created for `self` can be used where `other` is requested.
    fn can_serve(&self, other: &ImagePoolConfig) -> bool {
        self.profile == other.profile
            && self.dpb_format == other.dpb_format
            && self.output_format == other.output_format
            && self.layered_dpb == other.layered_dpb
            && self.separate_output == other.separate_output
            && self.extent.can_contain(other.extent)
            && self.num_pictures >= other.num_pictures
    }
}

/// A decoded picture handed out in display order.
///
/// The picture cannot be reused for decoding until the frame is released or dropped.
#[derive(Debug)]
pub struct DecodedFrame {
    pub picture: Option<PictureBuffer>,
    pub picture_index: usize,
    pub display_order: u64,
    pub decode_order: u64,
    pub timestamp: u64,
    pub output: PictureResource,
    pub frame_complete_fence: Option<FenceHandle>,
}

/// Pool of picture buffers and queue of pictures waiting to be displayed.
pub struct FrameBuffer {
    device: Rc<dyn VideoDevice>,
    config: Option<ImagePoolConfig>,
    pictures: Vec<PictureBuffer>,
    decode_order_count: u64,
    display_order_count: u64,
    display_queue: VecDeque<PictureBuffer>,
}

impl FrameBuffer {
    pub fn new(device: Rc<dyn VideoDevice>) -> Self {
        Self {
            device,
            config: None,
            pictures: Vec::new(),
            decode_order_count: 0,
            display_order_count: 0,
            display_queue: VecDeque::new(),
        }
    }

    /// Makes the pool able to serve pictures described by `config`, creating new pictures if
    /// the current ones cannot. Returns the number of pictures and whether they were recreated.
    pub fn init_image_pool(&mut self, config: &ImagePoolConfig) -> DecodeResult<(usize, bool)> {
        assert!(config.num_pictures > 0 && config.num_pictures <= MAX_PICTURE_BUFFERS);

        if let Some(current) = &self.config {
            if current.can_serve(config) {
                return Ok((self.pictures.len(), false));
            }
        }

        // Pictures still held elsewhere stay valid until released.
        self.pictures.clear();
        self.config = None;

        let dpb_usage = if config.separate_output {
            ImageUsage::DECODE_DPB
        } else {
            ImageUsage::DECODE_DPB | ImageUsage::DECODE_DST | ImageUsage::TRANSFER_SRC
        };
        let image_info = |usage, format, layers| ImageCreateInfo {
            profile: config.profile,
            format,
            extent: config.extent,
            array_layers: layers,
            usage,
        };

        let layered = if config.layered_dpb {
            Some(DeviceImage::create(
                &self.device,
                &image_info(dpb_usage, config.dpb_format, config.num_pictures as u32),
            )?)
        } else {
            None
        };

        for index in 0..config.num_pictures {
            let (dpb_image, layer) = match &layered {
                Some(image) => (Rc::clone(image), index as u32),
                None => (
                    DeviceImage::create(&self.device, &image_info(dpb_usage, config.dpb_format, 1))?,
                    0,
                ),
            };
            let dpb = PictureResource {
                image: dpb_image.handle(),
                base_array_layer: layer,
                coded_extent: config.extent,
            };

            let output = if config.separate_output {
                let image = DeviceImage::create(
                    &self.device,
                    &image_info(
                        ImageUsage::DECODE_DST | ImageUsage::TRANSFER_SRC,
                        config.output_format,
                        1,
                    ),
                )?;
                let resource = PictureResource {
                    image: image.handle(),
                    base_array_layer: 0,
                    coded_extent: config.extent,
                };
                Some((image, resource))
            } else {
                None
            };

            self.pictures.push(Rc::new(Picture {
                index,
                _dpb_image: dpb_image,
                dpb,
                output,
                state: Default::default(),
            }));
        }

        debug!(
            "created {} picture buffers of {}x{}{}{}",
            config.num_pictures,
            config.extent.width,
            config.extent.height,
            if config.layered_dpb { ", layered" } else { "" },
            if config.separate_output {
                ", separate output"
            } else {
                ""
            }
        );
        self.config = Some(config.clone());

        Ok((self.pictures.len(), true))
    }

    pub fn len(&self) -> usize {
        self.pictures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pictures.is_empty()
    }

    pub fn extent(&self) -> Option<Resolution> {
        self.config.as_ref().map(|c| c.extent)
    }

    /// Returns the first picture nobody else holds, numbered next in decode order.
    pub fn reserve_picture_buffer(&mut self) -> DecodeResult<PictureBuffer> {
        let picture = self
            .pictures
            .iter()
            .find(|p| Rc::strong_count(p) == 1)
            .cloned()
            .ok_or(DecodeError::OutOfPictureBuffers)?;

        {
            let mut state = picture.state_mut();
            let (dpb_layout, output_layout) = (state.dpb_layout, state.output_layout);
            *state = PictureState {
                decode_order: self.decode_order_count,
                dpb_layout,
                output_layout,
                ..Default::default()
            };
        }
        self.decode_order_count += 1;
        trace!("reserved picture buffer {}", picture.index());

        Ok(picture)
    }

    /// Queues `picture` for display and returns its display order.
    pub fn queue_decoded_picture_for_display(
        &mut self,
        picture: &PictureBuffer,
        timestamp: u64,
    ) -> u64 {
        let display_order = self.display_order_count;
        self.display_order_count += 1;
        {
            let mut state = picture.state_mut();
            state.display_order = Some(display_order);
            state.timestamp = timestamp;
        }
        self.display_queue.push_back(Rc::clone(picture));

        display_order
    }

    /// Returns the picture at the head of the display queue without dequeuing it.
    pub fn peek_display_queue(&self) -> Option<&PictureBuffer> {
        self.display_queue.front()
    }

    pub fn dequeue_decoded_picture(&mut self) -> Option<DecodedFrame> {
        let picture = self.display_queue.pop_front()?;
        let state = picture.state().clone();

        Some(DecodedFrame {
            picture_index: picture.index(),
            display_order: state.display_order.unwrap_or_default(),
            decode_order: state.decode_order,
            timestamp: state.timestamp,
            output: picture.output_resource(),
            frame_complete_fence: state.frame_complete_fence,
            picture: Some(picture),
        })
    }

    /// Gives the picture of `frame` back to the pool.
    pub fn release_displayed_frame(&mut self, frame: &mut DecodedFrame) {
        if let Some(picture) = frame.picture.take() {
            picture.state_mut().consumer_done = true;
            trace!("released picture buffer {}", picture.index());
        }
    }

    pub fn displayable_count(&self) -> usize {
        self.display_queue.len()
    }

    /// Forgets all pictures waiting for display.
    pub fn flush_display_queue(&mut self) {
        self.display_queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::emulated::EmulatedDevice;
    use crate::CodecOperation;

    fn config(num_pictures: usize) -> ImagePoolConfig {
        ImagePoolConfig {
            profile: Some(VideoProfile::new(CodecOperation::DecodeH264, 100)),
            dpb_format: PictureFormat::Nv12,
            output_format: PictureFormat::Nv12,
            extent: Resolution {
                width: 320,
                height: 240,
            },
            num_pictures,
            layered_dpb: false,
            separate_output: false,
        }
    }

    #[test]
    fn reserve_skips_held_pictures() {
        let device = EmulatedDevice::new(Default::default());
        let mut frame_buffer = FrameBuffer::new(device);
        assert_eq!(frame_buffer.init_image_pool(&config(3)).unwrap(), (3, true));

        let a = frame_buffer.reserve_picture_buffer().unwrap();
        let b = frame_buffer.reserve_picture_buffer().unwrap();
        let c = frame_buffer.reserve_picture_buffer().unwrap();
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));
        assert_eq!(c.state().decode_order, 2);
        assert!(matches!(
            frame_buffer.reserve_picture_buffer(),
            Err(DecodeError::OutOfPictureBuffers)
        ));

        drop(b);
        assert_eq!(frame_buffer.reserve_picture_buffer().unwrap().index(), 1);
    }

    #[test]
    fn display_queue_holds_pictures() {
        let device = EmulatedDevice::new(Default::default());
        let mut frame_buffer = FrameBuffer::new(device);
        frame_buffer.init_image_pool(&config(1)).unwrap();

        let picture = frame_buffer.reserve_picture_buffer().unwrap();
        assert_eq!(frame_buffer.queue_decoded_picture_for_display(&picture, 33), 0);
        drop(picture);
        assert!(frame_buffer.reserve_picture_buffer().is_err());

        let mut frame = frame_buffer.dequeue_decoded_picture().unwrap();
        assert_eq!(frame.timestamp, 33);
        assert_eq!(frame.display_order, 0);
        assert!(frame_buffer.reserve_picture_buffer().is_err());
        frame_buffer.release_displayed_frame(&mut frame);
        assert!(frame.picture.is_none());
        let picture = frame_buffer.reserve_picture_buffer().unwrap();
        // Reserving starts a new use of the picture.
        assert!(!picture.state().consumer_done);
        assert!(frame_buffer.dequeue_decoded_picture().is_none());
    }

    #[test]
    fn layered_pool_shares_one_image() {
        let device = EmulatedDevice::new(Default::default());
        let mut frame_buffer = FrameBuffer::new(device.clone());
        let mut layered = config(4);
        layered.layered_dpb = true;
        layered.separate_output = true;
        frame_buffer.init_image_pool(&layered).unwrap();

        let pictures = (0..4)
            .map(|_| frame_buffer.reserve_picture_buffer().unwrap())
            .collect::<Vec<_>>();
        let image = pictures[0].dpb_resource().image;
        for (layer, picture) in pictures.iter().enumerate() {
            assert_eq!(picture.dpb_resource().image, image);
            assert_eq!(picture.dpb_resource().base_array_layer, layer as u32);
            assert!(picture.has_separate_output());
            assert_ne!(picture.output_resource(), picture.dpb_resource());
        }
        // One DPB image plus an output image per picture.
        assert_eq!(device.live_objects(), 5);

        drop(pictures);
        drop(frame_buffer);
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn compatible_pool_is_kept() {
        let device = EmulatedDevice::new(Default::default());
        let mut frame_buffer = FrameBuffer::new(device);
        frame_buffer.init_image_pool(&config(6)).unwrap();

        let mut smaller = config(4);
        smaller.extent = Resolution {
            width: 176,
            height: 144,
        };
        assert_eq!(frame_buffer.init_image_pool(&smaller).unwrap(), (6, false));
        assert_eq!(frame_buffer.init_image_pool(&config(8)).unwrap(), (8, true));
    }
}
