// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! DPB slot assignment for codecs with a reference frame store (AV1 and VP9).
//!
//! Every picture of the store keeps a slot for as long as it is in the store, whether or not
//! the current frame uses it. Only the slots the current frame names are passed as references.

use std::rc::Rc;

use crate::codec::av1;
use crate::codec::av1::Av1PictureData;
use crate::codec::av1::Av1PictureInfo;
use crate::codec::av1::Av1ReferenceInfo;
use crate::codec::vp9;
use crate::codec::vp9::Vp9FrameType;
use crate::codec::vp9::Vp9PictureData;
use crate::codec::vp9::Vp9PictureInfo;
use crate::codec::CodecPictureInfo;
use crate::codec::PictureData;
use crate::codec::ReferenceInfo;
use crate::decoder::base::DpbState;
use crate::decoder::dpb::DpbTracker;
use crate::decoder::frame_buffer::Picture;
use crate::decoder::frame_buffer::PictureBuffer;
use crate::decoder::DecodeError;
use crate::decoder::DecodeResult;
use crate::device::ReferenceSlot;
use crate::NUM_REF_FRAMES;

/// Slots of the store and of the current picture.
struct StoreSlots {
    store: [Option<u8>; NUM_REF_FRAMES],
    setup: Option<u8>,
}

fn assign_store_slots(
    dpb: &mut DpbTracker<Picture>,
    current: &PictureBuffer,
    ref_frames: &[Option<PictureBuffer>; NUM_REF_FRAMES],
    age: i32,
) -> DecodeResult<StoreSlots> {
    let mut valid_mask = 1 << current.index();
    for picture in ref_frames.iter().flatten() {
        valid_mask |= 1 << picture.index();
    }
    dpb.reset_pic_dpb_slots(valid_mask);

    // Without a DPB the store pictures are never used as references.
    let mut store = [None; NUM_REF_FRAMES];
    if dpb.slots().is_empty() {
        return Ok(StoreSlots { store, setup: None });
    }

    for (slot, picture) in store.iter_mut().zip(ref_frames) {
        if let Some(picture) = picture {
            *slot = Some(
                dpb.get_or_allocate_slot(picture.index(), picture, age)
                    .ok_or(DecodeError::OutOfDpbSlots)?,
            );
        }
    }

    let setup = Some(
        dpb.get_or_allocate_slot(current.index(), current, age)
            .ok_or(DecodeError::OutOfDpbSlots)?,
    );

    Ok(StoreSlots { store, setup })
}

/// Resolves the slot each reference name uses, and lists each used slot once.
fn name_references<const N: usize>(
    ref_frame_idx: &[u8; N],
    ref_frames: &[Option<PictureBuffer>; NUM_REF_FRAMES],
    slots: &StoreSlots,
    info: impl Fn(usize) -> ReferenceInfo,
) -> DecodeResult<([i32; N], Vec<ReferenceSlot>, Vec<PictureBuffer>)> {
    let mut name_slots = [-1; N];
    let mut reference_slots: Vec<ReferenceSlot> = Vec::new();
    let mut references = Vec::new();

    for (name_slot, &idx) in name_slots.iter_mut().zip(ref_frame_idx) {
        let idx = idx as usize;
        let (Some(slot), Some(picture)) = (
            slots.store.get(idx).copied().flatten(),
            ref_frames.get(idx).and_then(Option::as_ref),
        ) else {
            return Err(DecodeError::InvalidParameters(format!(
                "reference frame {} is empty",
                idx
            )));
        };
        *name_slot = slot as i32;
        if reference_slots
            .iter()
            .all(|r| r.slot_index != slot as i32)
        {
            reference_slots.push(ReferenceSlot {
                slot_index: slot as i32,
                resource: Some(picture.dpb_resource()),
                info: info(idx),
            });
            references.push(Rc::clone(picture));
        }
    }

    Ok((name_slots, reference_slots, references))
}

fn setup_slot(slot: Option<u8>, current: &PictureBuffer, info: ReferenceInfo) -> Option<ReferenceSlot> {
    slot.map(|slot| ReferenceSlot {
        slot_index: slot as i32,
        resource: Some(current.dpb_resource()),
        info,
    })
}

pub(crate) fn fill_dpb_av1_state(
    dpb: &mut DpbTracker<Picture>,
    picture: &PictureData,
    data: &Av1PictureData,
    apply_grain: bool,
    age: i32,
) -> DecodeResult<DpbState> {
    let slots = assign_store_slots(dpb, &picture.current, &data.ref_frames, age)?;

    let (reference_name_slot_indices, reference_slots, references) =
        if data.frame_type.is_intra() {
            ([-1; av1::REFS_PER_FRAME], Vec::new(), Vec::new())
        } else {
            name_references(&data.ref_frame_idx, &data.ref_frames, &slots, |idx| {
                ReferenceInfo::Av1(Av1ReferenceInfo {
                    frame_type: Default::default(),
                    order_hint: data.ref_order_hint[idx],
                })
            })?
        };

    Ok(DpbState {
        reference_slots,
        setup_slot: setup_slot(
            slots.setup,
            &picture.current,
            ReferenceInfo::Av1(Av1ReferenceInfo {
                frame_type: data.frame_type,
                order_hint: data.order_hint,
            }),
        ),
        picture_info: CodecPictureInfo::Av1(Av1PictureInfo {
            frame_type: data.frame_type,
            order_hint: data.order_hint,
            refresh_frame_flags: data.refresh_frame_flags,
            apply_grain,
            reference_name_slot_indices,
            tile_offsets: picture.slice_offsets.clone(),
        }),
        references,
    })
}

pub(crate) fn fill_dpb_vp9_state(
    dpb: &mut DpbTracker<Picture>,
    picture: &PictureData,
    data: &Vp9PictureData,
    age: i32,
) -> DecodeResult<DpbState> {
    let slots = assign_store_slots(dpb, &picture.current, &data.ref_frames, age)?;

    let intra = data.frame_type == Vp9FrameType::KeyFrame || data.intra_only;
    let (reference_name_slot_indices, reference_slots, references) = if intra {
        ([-1; vp9::REFS_PER_FRAME], Vec::new(), Vec::new())
    } else {
        name_references(&data.ref_frame_idx, &data.ref_frames, &slots, |_| {
            ReferenceInfo::None
        })?
    };

    Ok(DpbState {
        reference_slots,
        setup_slot: setup_slot(slots.setup, &picture.current, ReferenceInfo::None),
        picture_info: CodecPictureInfo::Vp9(Vp9PictureInfo {
            profile: data.profile,
            frame_type: data.frame_type,
            intra_only: data.intra_only,
            refresh_frame_flags: data.refresh_frame_flags,
            reference_name_slot_indices,
        }),
        references,
    })
}
