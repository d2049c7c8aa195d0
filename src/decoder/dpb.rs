// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! DPB slot bookkeeping.
//!
//! [`DpbSlots`] is the table of DPB slots of a video session. [`DpbTracker`] adds the mapping
//! from picture buffer indices to the slot each picture currently occupies.

use std::collections::VecDeque;
use std::rc::Rc;

use log::trace;
use log::warn;

use crate::MAX_PICTURE_BUFFERS;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DpbSlotState {
    #[default]
    Free,
    /// Allocated for a picture that has not been set up in it yet.
    Reserved,
    InUse,
}

/// A DPB slot, holding at most one picture.
#[derive(Debug)]
pub struct DpbSlot<T> {
    state: DpbSlotState,
    picture: Option<Rc<T>>,
    /// ID of the picture the slot was last claimed for.
    age: i32,
}

impl<T> Default for DpbSlot<T> {
    fn default() -> Self {
        Self {
            state: DpbSlotState::Free,
            picture: None,
            age: 0,
        }
    }
}

impl<T> DpbSlot<T> {
    pub fn state(&self) -> DpbSlotState {
        self.state
    }

    pub fn is_in_use(&self) -> bool {
        self.state != DpbSlotState::Free
    }

    pub fn is_available(&self) -> bool {
        !self.is_in_use()
    }

    pub fn age(&self) -> i32 {
        self.age
    }

    pub fn reserve(&mut self) {
        self.state = DpbSlotState::Reserved;
    }

    pub fn mark_in_use(&mut self, age: i32) {
        self.age = age;
        self.state = DpbSlotState::InUse;
    }

    /// Releases the picture and frees the slot.
    pub fn invalidate(&mut self) {
        self.picture = None;
        self.state = DpbSlotState::Free;
    }

    pub fn picture_resource(&self) -> Option<&Rc<T>> {
        self.picture.as_ref()
    }

    /// Replaces the picture of the slot, returning the previous one.
    pub fn set_picture_resource(&mut self, picture: Option<Rc<T>>, age: i32) -> Option<Rc<T>> {
        self.age = age;
        std::mem::replace(&mut self.picture, picture)
    }
}

/// A fixed capacity table of DPB slots.
///
/// Slots are handed out from a FIFO of free indices. The bits of the in-use mask are exactly
/// the slots not in the free queue.
#[derive(Debug)]
pub struct DpbSlots<T> {
    slots: Vec<DpbSlot<T>>,
    free_slots: VecDeque<u8>,
    in_use_mask: u32,
    max_slots: usize,
}

impl<T> DpbSlots<T> {
    /// Creates an empty table that can be sized up to `max_slots`.
    pub fn new(max_slots: usize) -> Self {
        assert!(max_slots <= u32::BITS as usize);

        Self {
            slots: Vec::new(),
            free_slots: VecDeque::new(),
            in_use_mask: 0,
            max_slots,
        }
    }

    /// Sizes the table to `size` slots and returns the resulting size.
    ///
    /// Without `reconfigure` every slot is released first. With it, existing slots are kept and
    /// the table only grows: a smaller `size` leaves it unchanged.
    pub fn init(&mut self, size: usize, reconfigure: bool) -> usize {
        assert!(size <= self.max_slots);

        if !reconfigure {
            self.deinit();
        }

        if reconfigure && size < self.slots.len() {
            return self.slots.len();
        }

        let old_size = self.slots.len();
        self.slots.resize_with(size, Default::default);
        self.free_slots.extend((old_size..size).map(|i| i as u8));
        trace!("DPB slot table sized {} -> {}", old_size, size);

        self.slots.len()
    }

    pub fn deinit(&mut self) {
        self.slots.iter_mut().for_each(DpbSlot::invalidate);
        self.slots.clear();
        self.free_slots.clear();
        self.in_use_mask = 0;
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    /// Takes the next free slot and reserves it. Returns `None` when all slots are in use.
    pub fn allocate_slot(&mut self) -> Option<u8> {
        let Some(slot) = self.free_slots.pop_front() else {
            warn!("no more DPB slots are available out of {}", self.slots.len());
            return None;
        };

        self.in_use_mask |= 1 << slot;
        self.slots[slot as usize].reserve();

        Some(slot)
    }

    /// Releases the picture of `slot` and returns the slot to the free queue.
    ///
    /// Panics if `slot` is not in use.
    pub fn free_slot(&mut self, slot: u8) {
        let index = slot as usize;
        assert!(index < self.slots.len(), "slot {} out of range", slot);
        assert!(self.slots[index].is_in_use(), "slot {} is not in use", slot);
        assert!(self.in_use_mask & (1 << slot) != 0);

        self.slots[index].invalidate();
        self.free_slots.push_back(slot);
        self.in_use_mask &= !(1 << slot);
    }

    /// Sets `picture` as the content of `slot`, freeing any other slot still holding it.
    pub fn map_picture_resource(&mut self, picture: Option<Rc<T>>, slot: u8, age: i32) {
        for index in 0..self.slots.len() {
            if index == slot as usize {
                self.slots[index].set_picture_resource(picture.clone(), age);
            } else if let Some(picture) = &picture {
                let holds_picture = self.slots[index]
                    .picture_resource()
                    .map(|p| Rc::ptr_eq(p, picture))
                    .unwrap_or(false);
                if holds_picture && self.slots[index].is_in_use() {
                    self.free_slot(index as u8);
                }
            }
        }
    }

    /// Returns the slot currently holding `picture`.
    pub fn get_slot_of_picture_resource(&self, picture: &Rc<T>) -> Option<u8> {
        self.slots
            .iter()
            .position(|slot| {
                slot.picture_resource()
                    .map(|p| Rc::ptr_eq(p, picture))
                    .unwrap_or(false)
            })
            .map(|index| index as u8)
    }

    pub fn get_picture_resource(&self, slot: u8) -> Option<&Rc<T>> {
        self.slots
            .get(slot as usize)
            .and_then(DpbSlot::picture_resource)
    }

    pub fn slot(&self, slot: u8) -> &DpbSlot<T> {
        &self.slots[slot as usize]
    }

    pub fn slot_mut(&mut self, slot: u8) -> &mut DpbSlot<T> {
        &mut self.slots[slot as usize]
    }

    /// Bit `n` is set if slot `n` is in use.
    pub fn slot_in_use_mask(&self) -> u32 {
        self.in_use_mask
    }

    pub fn num_free_slots(&self) -> usize {
        self.free_slots.len()
    }
}

/// Maps picture buffer indices to the DPB slot each picture occupies.
#[derive(Debug)]
pub struct DpbTracker<T> {
    slots: DpbSlots<T>,
    picture_to_slot: [Option<u8>; MAX_PICTURE_BUFFERS],
    /// Bit `n` is set if picture `n` occupies a slot.
    slots_mask: u32,
    /// Bit `n` is set if picture `n` was decoded as a field.
    field_pic_mask: u32,
}

impl<T> DpbTracker<T> {
    pub fn new(max_slots: usize) -> Self {
        Self {
            slots: DpbSlots::new(max_slots),
            picture_to_slot: [None; MAX_PICTURE_BUFFERS],
            slots_mask: 0,
            field_pic_mask: 0,
        }
    }

    pub fn slots(&self) -> &DpbSlots<T> {
        &self.slots
    }

    pub fn slots_mut(&mut self) -> &mut DpbSlots<T> {
        &mut self.slots
    }

    /// Sizes the slot table, see [`DpbSlots::init`]. A full reinitialization also forgets every
    /// picture to slot mapping.
    pub fn init(&mut self, size: usize, reconfigure: bool) -> usize {
        if !reconfigure {
            self.picture_to_slot = [None; MAX_PICTURE_BUFFERS];
            self.slots_mask = 0;
            self.field_pic_mask = 0;
        }

        self.slots.init(size, reconfigure)
    }

    pub fn get_pic_dpb_slot(&self, pic_idx: usize) -> Option<u8> {
        self.picture_to_slot[pic_idx]
    }

    /// Maps `pic_idx` to `slot`, returning the previous slot. Unmapping a picture frees its
    /// slot.
    pub fn set_pic_dpb_slot(&mut self, pic_idx: usize, slot: Option<u8>) -> Option<u8> {
        let old_slot = std::mem::replace(&mut self.picture_to_slot[pic_idx], slot);

        match slot {
            Some(_) => self.slots_mask |= 1 << pic_idx,
            None => {
                self.slots_mask &= !(1 << pic_idx);
                if let Some(old_slot) = old_slot {
                    self.slots.free_slot(old_slot);
                }
            }
        }

        old_slot
    }

    /// Unmaps every picture whose bit is not set in `valid_mask`, freeing their slots. Returns
    /// the mask of pictures still mapped.
    pub fn reset_pic_dpb_slots(&mut self, valid_mask: u32) -> u32 {
        let reset_mask = self.slots_mask & !valid_mask;
        for pic_idx in 0..MAX_PICTURE_BUFFERS {
            if reset_mask & (1 << pic_idx) != 0 {
                trace!("releasing DPB slot of picture {}", pic_idx);
                self.set_pic_dpb_slot(pic_idx, None);
            }
        }

        self.slots_mask
    }

    /// Returns the slot of `pic_idx`, allocating one and setting `picture` up in it if the
    /// picture has none. The slot is marked in use by picture `age`.
    pub fn get_or_allocate_slot(
        &mut self,
        pic_idx: usize,
        picture: &Rc<T>,
        age: i32,
    ) -> Option<u8> {
        let slot = match self.get_pic_dpb_slot(pic_idx) {
            Some(slot) => slot,
            None => {
                let slot = self.slots.allocate_slot()?;
                self.set_pic_dpb_slot(pic_idx, Some(slot));
                self.slots
                    .map_picture_resource(Some(Rc::clone(picture)), slot, age);
                trace!("picture {} assigned DPB slot {}", pic_idx, slot);
                slot
            }
        };
        self.slots.slot_mut(slot).mark_in_use(age);

        Some(slot)
    }

    pub fn field_pic_flag(&self, pic_idx: usize) -> bool {
        self.field_pic_mask & (1 << pic_idx) != 0
    }

    /// Sets the field flag of `pic_idx`, returning the previous value.
    pub fn set_field_pic_flag(&mut self, pic_idx: usize, field: bool) -> bool {
        let old = self.field_pic_flag(pic_idx);
        if field {
            self.field_pic_mask |= 1 << pic_idx;
        } else {
            self.field_pic_mask &= !(1 << pic_idx);
        }

        old
    }

    pub fn mapped_pictures_mask(&self) -> u32 {
        self.slots_mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_free_queue_complements_mask<T>(slots: &DpbSlots<T>) {
        let mut from_queue = 0u32;
        for &slot in &slots.free_slots {
            assert_eq!(from_queue & (1 << slot), 0, "slot {} queued twice", slot);
            from_queue |= 1 << slot;
        }
        let all = if slots.len() == 32 {
            u32::MAX
        } else {
            (1u32 << slots.len()) - 1
        };
        assert_eq!(from_queue ^ slots.slot_in_use_mask(), all);
    }

    #[test]
    fn allocation_exhausts_at_capacity() {
        let mut slots = DpbSlots::<u32>::new(17);
        assert_eq!(slots.init(4, false), 4);

        let allocated = (0..4).map(|_| slots.allocate_slot()).collect::<Vec<_>>();
        assert_eq!(allocated, vec![Some(0), Some(1), Some(2), Some(3)]);
        assert_eq!(slots.allocate_slot(), None);
        // Exhaustion is not transient.
        assert_eq!(slots.allocate_slot(), None);
        check_free_queue_complements_mask(&slots);
    }

    #[test]
    fn free_queue_complements_in_use_mask() {
        let mut slots = DpbSlots::<u32>::new(17);
        slots.init(8, false);

        // A fixed pseudo-random sequence of allocations and frees.
        let mut seed = 0x2545f491u32;
        let mut allocated = Vec::new();
        for _ in 0..200 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if seed % 3 != 0 {
                if let Some(slot) = slots.allocate_slot() {
                    allocated.push(slot);
                } else {
                    assert_eq!(allocated.len(), 8);
                }
            } else if !allocated.is_empty() {
                let slot = allocated.swap_remove(seed as usize % allocated.len());
                slots.free_slot(slot);
            }
            check_free_queue_complements_mask(&slots);
            assert!(allocated.len() <= slots.len());
        }
    }

    #[test]
    #[should_panic]
    fn freeing_a_free_slot_panics() {
        let mut slots = DpbSlots::<u32>::new(17);
        slots.init(4, false);
        slots.free_slot(2);
    }

    #[test]
    fn reconfigure_only_grows() {
        let mut slots = DpbSlots::<u32>::new(17);
        slots.init(4, false);
        let a = slots.allocate_slot().unwrap();
        let b = slots.allocate_slot().unwrap();
        let picture = Rc::new(7);
        slots.map_picture_resource(Some(picture.clone()), a, 0);

        assert_eq!(slots.init(2, true), 4);
        assert_eq!(slots.init(6, true), 6);
        assert!(slots.slot(a).is_in_use());
        assert!(slots.slot(b).is_in_use());
        assert_eq!(slots.get_slot_of_picture_resource(&picture), Some(a));
        assert_eq!(slots.num_free_slots(), 4);
        check_free_queue_complements_mask(&slots);

        // A full init releases everything.
        assert_eq!(slots.init(3, false), 3);
        assert_eq!(slots.slot_in_use_mask(), 0);
        assert_eq!(Rc::strong_count(&picture), 1);
        check_free_queue_complements_mask(&slots);
    }

    #[test]
    fn picture_lives_in_one_slot() {
        let mut slots = DpbSlots::<u32>::new(17);
        slots.init(4, false);
        let a = slots.allocate_slot().unwrap();
        let b = slots.allocate_slot().unwrap();
        let picture = Rc::new(1);

        slots.map_picture_resource(Some(picture.clone()), a, 0);
        slots.map_picture_resource(Some(picture.clone()), b, 1);

        assert!(slots.slot(a).is_available());
        assert!(slots.get_picture_resource(a).is_none());
        assert_eq!(slots.get_slot_of_picture_resource(&picture), Some(b));
        assert_eq!(slots.slot(b).age(), 1);
        // The table and the test hold the only references.
        assert_eq!(Rc::strong_count(&picture), 2);
        check_free_queue_complements_mask(&slots);
    }

    #[test]
    fn tracker_resets_unlisted_pictures() {
        let mut tracker = DpbTracker::<u32>::new(17);
        tracker.init(17, false);
        let pictures = (0..4).map(Rc::new).collect::<Vec<_>>();

        for (idx, picture) in pictures.iter().enumerate() {
            assert_eq!(
                tracker.get_or_allocate_slot(idx, picture, idx as i32),
                Some(idx as u8)
            );
        }
        // Asking again returns the same slot.
        assert_eq!(tracker.get_or_allocate_slot(2, &pictures[2], 9), Some(2));
        assert_eq!(tracker.slots().slot(2).age(), 9);

        assert_eq!(tracker.reset_pic_dpb_slots(0b0101), 0b0101);
        assert_eq!(tracker.get_pic_dpb_slot(1), None);
        assert_eq!(tracker.get_pic_dpb_slot(2), Some(2));
        assert_eq!(tracker.slots().slot_in_use_mask(), 0b0101);
        assert_eq!(Rc::strong_count(&pictures[1]), 1);

        // Released slots go to the back of the free queue.
        let picture = Rc::new(10);
        assert_eq!(tracker.get_or_allocate_slot(10, &picture, 10), Some(4));
    }

    #[test]
    fn tracker_field_flags() {
        let mut tracker = DpbTracker::<u32>::new(17);
        assert!(!tracker.set_field_pic_flag(3, true));
        assert!(tracker.field_pic_flag(3));
        assert!(!tracker.field_pic_flag(2));
        assert!(tracker.set_field_pic_flag(3, false));
        assert!(!tracker.field_pic_flag(3));
    }
}
