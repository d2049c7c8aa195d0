// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::rc::Weak;

use log::debug;
use log::trace;

use crate::decoder::DecodeError;
use crate::decoder::DecodeResult;
use crate::device::BufferHandle;
use crate::device::VideoDevice;
use crate::utils::align_up;

/// A device buffer holding the bitstream of a picture, obtained from a [`BitstreamBufferPool`].
///
/// The buffer is returned to its pool when dropped, provided the pool still exists.
pub struct PooledBitstreamBuffer {
    buffer: BufferHandle,
    capacity: usize,
    data_size: usize,
    device: Rc<dyn VideoDevice>,
    pool: Weak<RefCell<BitstreamBufferPool>>,
}

impl fmt::Debug for PooledBitstreamBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBitstreamBuffer")
            .field("buffer", &self.buffer)
            .field("capacity", &self.capacity)
            .field("data_size", &self.data_size)
            .finish()
    }
}

impl PooledBitstreamBuffer {
    pub fn handle(&self) -> BufferHandle {
        self.buffer
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes written at the start of the buffer.
    pub fn data_size(&self) -> usize {
        self.data_size
    }
}

impl Drop for PooledBitstreamBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.borrow_mut()
                .free
                .push_back((self.buffer, self.capacity));
            return;
        }

        trace!("dropping stale bitstream buffer {:?}", self.buffer);
        self.device.destroy_buffer(self.buffer);
    }
}

pub type SharedBitstreamBuffer = Rc<PooledBitstreamBuffer>;

/// A pool of bitstream buffers, to avoid allocating one per picture.
pub struct BitstreamBufferPool {
    device: Rc<dyn VideoDevice>,
    /// Capacity of newly created buffers, unless a larger one is requested.
    buffer_size: usize,
    size_alignment: usize,
    free: VecDeque<(BufferHandle, usize)>,
}

impl BitstreamBufferPool {
    pub fn new(
        device: Rc<dyn VideoDevice>,
        buffer_size: usize,
        size_alignment: usize,
    ) -> Rc<RefCell<Self>> {
        let size_alignment = size_alignment.max(1);
        Rc::new(RefCell::new(Self {
            device,
            buffer_size: align_up(buffer_size, size_alignment),
            size_alignment,
            free: VecDeque::new(),
        }))
    }

    /// Number of buffers waiting in the pool.
    pub fn num_free(&self) -> usize {
        self.free.len()
    }

    /// Returns a buffer with room for `size` bytes, holding `data` at its start and zeroes after
    /// it.
    ///
    /// `pool` is the smart pointer holding `self`, so returned buffers can find their way back.
    pub fn get_buffer(
        pool: &Rc<RefCell<Self>>,
        size: usize,
        data: &[u8],
    ) -> DecodeResult<SharedBitstreamBuffer> {
        if data.len() > size {
            return Err(DecodeError::BitstreamBufferTooSmall {
                needed: data.len(),
                capacity: size,
            });
        }

        let mut this = pool.borrow_mut();
        let needed = align_up(size, this.size_alignment);
        let reused = this
            .free
            .iter()
            .position(|(_, capacity)| *capacity >= needed)
            .and_then(|index| this.free.remove(index));
        let (buffer, capacity) = match reused {
            Some(reused) => reused,
            None => {
                let capacity = this.buffer_size.max(needed);
                let buffer = this.device.create_bitstream_buffer(capacity as u64)?;
                debug!("created bitstream buffer of {} bytes", capacity);
                (buffer, capacity)
            }
        };
        let device = Rc::clone(&this.device);
        drop(this);

        let pooled = PooledBitstreamBuffer {
            buffer,
            capacity,
            data_size: data.len(),
            device: Rc::clone(&device),
            pool: Rc::downgrade(pool),
        };
        device.write_buffer(buffer, 0, data)?;
        device.fill_buffer(
            buffer,
            data.len() as u64,
            (capacity - data.len()) as u64,
            0,
        )?;

        Ok(Rc::new(pooled))
    }
}

impl Drop for BitstreamBufferPool {
    fn drop(&mut self) {
        for (buffer, _) in self.free.drain(..) {
            self.device.destroy_buffer(buffer);
        }
    }
}
