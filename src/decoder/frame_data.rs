// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::rc::Rc;

use log::debug;

use crate::device::CommandBufferHandle;
use crate::device::CommandPoolHandle;
use crate::device::DeviceResult;
use crate::device::FenceHandle;
use crate::device::SemaphoreHandle;
use crate::device::VideoDevice;

/// What is needed to record and submit the decode of one frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameData {
    pub command_buffer: CommandBufferHandle,
    /// Signaled when the decode submitted from this slot completes.
    pub fence: FenceHandle,
    pub semaphore: SemaphoreHandle,
}

/// A fixed set of [`FrameData`], handed out round-robin.
///
/// The number of slots bounds how many frames can be in flight. A slot must only be reused after
/// its fence has signaled.
pub struct FrameDataPool {
    device: Rc<dyn VideoDevice>,
    command_pool: Option<CommandPoolHandle>,
    slots: Vec<FrameData>,
    next_slot: usize,
}

impl FrameDataPool {
    pub fn new(device: Rc<dyn VideoDevice>) -> Self {
        Self {
            device,
            command_pool: None,
            slots: Vec::new(),
            next_slot: 0,
        }
    }

    /// Creates `count` slots on the first call. Later calls return the current size and must
    /// not ask for more.
    pub fn resize(&mut self, count: usize) -> DeviceResult<usize> {
        if self.command_pool.is_some() {
            assert!(
                count <= self.slots.len(),
                "frame data pool of {} cannot grow to {}",
                self.slots.len(),
                count
            );
            return Ok(self.slots.len());
        }

        let command_pool = self
            .device
            .create_command_pool(self.device.decode_queue_family())?;
        self.command_pool = Some(command_pool);
        let command_buffers = self.device.allocate_command_buffers(command_pool, count)?;
        for command_buffer in command_buffers {
            // Signaled so that the first wait on each slot returns immediately.
            let fence = self.device.create_fence(true)?;
            let semaphore = self.device.create_semaphore()?;
            self.slots.push(FrameData {
                command_buffer,
                fence,
                semaphore,
            });
        }
        debug!("created {} frame data slots", count);

        Ok(self.slots.len())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get_command_buffer(&self, slot: usize) -> CommandBufferHandle {
        assert!(slot < self.slots.len(), "frame data slot {} out of range", slot);
        self.slots[slot].command_buffer
    }

    pub fn frame_data(&self, slot: usize) -> &FrameData {
        &self.slots[slot]
    }

    /// Returns the slot to use for the next frame.
    pub fn next_slot(&mut self) -> usize {
        assert!(!self.slots.is_empty(), "frame data pool not sized");
        let slot = self.next_slot;
        self.next_slot = (self.next_slot + 1) % self.slots.len();

        slot
    }
}

impl Drop for FrameDataPool {
    fn drop(&mut self) {
        for frame in self.slots.drain(..) {
            self.device.destroy_fence(frame.fence);
            self.device.destroy_semaphore(frame.semaphore);
        }
        if let Some(command_pool) = self.command_pool.take() {
            self.device.destroy_command_pool(command_pool);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::emulated::EmulatedDevice;
    use crate::device::FenceStatus;

    fn pool() -> FrameDataPool {
        FrameDataPool::new(EmulatedDevice::new(Default::default()))
    }

    #[test]
    fn sized_once() {
        let mut pool = pool();
        assert_eq!(pool.resize(4).unwrap(), 4);
        assert_eq!(pool.resize(2).unwrap(), 4);
        assert_eq!(pool.resize(4).unwrap(), 4);
        assert_eq!(pool.len(), 4);
    }

    #[test]
    #[should_panic]
    fn cannot_grow() {
        let mut pool = pool();
        pool.resize(4).unwrap();
        let _ = pool.resize(5);
    }

    #[test]
    fn round_robin() {
        let mut pool = pool();
        pool.resize(3).unwrap();
        let slots = (0..7).map(|_| pool.next_slot()).collect::<Vec<_>>();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);

        let buffers = (0..3).map(|i| pool.get_command_buffer(i)).collect::<Vec<_>>();
        assert_ne!(buffers[0], buffers[1]);
        assert_ne!(buffers[1], buffers[2]);
    }

    #[test]
    fn fences_start_signaled() {
        let device = EmulatedDevice::new(Default::default());
        let mut pool = FrameDataPool::new(device.clone());
        pool.resize(2).unwrap();
        for slot in 0..2 {
            assert_eq!(
                device.fence_status(pool.frame_data(slot).fence),
                Ok(FenceStatus::Signaled)
            );
        }
    }

    #[test]
    #[should_panic]
    fn command_buffer_out_of_range() {
        let mut pool = pool();
        pool.resize(2).unwrap();
        pool.get_command_buffer(2);
    }
}
