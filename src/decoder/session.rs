// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::rc::Rc;

use log::debug;

use crate::device::DeviceResult;
use crate::device::SessionCreateInfo;
use crate::device::SessionHandle;
use crate::device::VideoDevice;

/// A video session of a device.
///
/// Sessions are shared between the decoder and the session parameters objects created for them,
/// and are destroyed once the last of them lets go. A session is never modified: decoding a
/// stream it cannot handle requires a new one.
pub struct VideoSession {
    device: Rc<dyn VideoDevice>,
    handle: SessionHandle,
    info: SessionCreateInfo,
}

impl fmt::Debug for VideoSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoSession")
            .field("device", &self.device.id())
            .field("handle", &self.handle)
            .field("info", &self.info)
            .finish()
    }
}

impl VideoSession {
    pub fn create(device: &Rc<dyn VideoDevice>, info: SessionCreateInfo) -> DeviceResult<Rc<Self>> {
        let handle = device.create_video_session(&info)?;
        debug!(
            "created video session {:?}: {:?} {}x{}, {} DPB slots",
            handle,
            info.profile.codec,
            info.max_coded_extent.width,
            info.max_coded_extent.height,
            info.max_dpb_slots
        );

        Ok(Rc::new(Self {
            device: Rc::clone(device),
            handle,
            info,
        }))
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn info(&self) -> &SessionCreateInfo {
        &self.info
    }

    pub fn device(&self) -> &Rc<dyn VideoDevice> {
        &self.device
    }

    /// Whether this session can be used in place of one created with `info` on the device
    /// identified by `device_id`.
    ///
    /// Device, queue family, profile, formats and flags must match, while the session's extent
    /// and DPB limits only need to be at least as large as requested.
    pub fn is_compatible(&self, device_id: u64, info: &SessionCreateInfo) -> bool {
        self.device.id() == device_id
            && self.info.queue_family == info.queue_family
            && self.info.flags == info.flags
            && self.info.profile == info.profile
            && self.info.picture_format == info.picture_format
            && self.info.reference_picture_format == info.reference_picture_format
            && self.info.max_coded_extent.can_contain(info.max_coded_extent)
            && self.info.max_dpb_slots >= info.max_dpb_slots
            && self.info.max_active_reference_pictures >= info.max_active_reference_pictures
    }
}

impl Drop for VideoSession {
    fn drop(&mut self) {
        debug!("destroying video session {:?}", self.handle);
        self.device.destroy_video_session(self.handle);
    }
}
