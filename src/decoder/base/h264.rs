// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::rc::Rc;

use log::trace;

use crate::codec::h264::H264DpbEntry;
use crate::codec::h264::H264PictureData;
use crate::codec::h264::H264PictureFlags;
use crate::codec::h264::H264PictureInfo;
use crate::codec::h264::H264ReferenceFlags;
use crate::codec::h264::H264ReferenceInfo;
use crate::codec::h264::BOTTOM_FIELD;
use crate::codec::h264::FRAME;
use crate::codec::h264::TOP_FIELD;
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
use crate::MAX_DPB_REF_SLOTS;

fn reference_info(entry: &H264DpbEntry) -> H264ReferenceInfo {
    let mut flags = H264ReferenceFlags::empty();
    if entry.used_for_reference != FRAME {
        flags.set(
            H264ReferenceFlags::TOP_FIELD,
            entry.used_for_reference & TOP_FIELD != 0,
        );
        flags.set(
            H264ReferenceFlags::BOTTOM_FIELD,
            entry.used_for_reference & BOTTOM_FIELD != 0,
        );
    }
    flags.set(
        H264ReferenceFlags::USED_FOR_LONG_TERM_REFERENCE,
        entry.is_long_term,
    );
    flags.set(H264ReferenceFlags::IS_NON_EXISTING, entry.not_existing);

    H264ReferenceInfo {
        flags,
        frame_num: entry.frame_idx as u16,
        pic_order_cnt: entry.field_order_cnt,
    }
}

fn existing_picture(entry: &H264DpbEntry) -> Option<&PictureBuffer> {
    if entry.not_existing {
        None
    } else {
        entry.picture.as_ref()
    }
}

/// Picks the picture standing in for the non-existing frame `missing`: the closest preceding
/// short-term reference in `frame_num` order, any existing reference otherwise.
fn substitute_picture<'a>(
    refs: &[&'a H264DpbEntry],
    missing: &H264DpbEntry,
) -> Option<&'a PictureBuffer> {
    let mut best = None;
    let mut best_diff = i32::MAX;
    for entry in refs {
        let Some(picture) = existing_picture(*entry) else {
            continue;
        };
        let mut diff = missing.frame_idx - entry.frame_idx;
        if diff <= 0 || entry.is_long_term {
            diff = 0xffff;
        }
        if diff < best_diff {
            best_diff = diff;
            best = Some(picture);
        }
    }

    best
}

/// Maps the references of an H.264 picture and the picture itself to DPB slots.
///
/// Pictures that stopped being references lose their slot. Non-existing frames get a slot no
/// picture occupies and are backed by a substitute picture, as nothing is ever decoded into them.
pub(crate) fn fill_dpb_h264_state(
    dpb: &mut DpbTracker<Picture>,
    picture: &PictureData,
    h264: &H264PictureData,
    age: i32,
) -> DecodeResult<DpbState> {
    let refs = h264
        .dpb
        .iter()
        .filter(|entry| entry.used_for_reference != 0)
        .collect::<Vec<_>>();
    if refs.len() > MAX_DPB_REF_SLOTS {
        return Err(DecodeError::InvalidParameters(format!(
            "{} H.264 reference pictures",
            refs.len()
        )));
    }

    let current = &picture.current;
    let mut valid_mask = 1 << current.index();
    for picture in refs.iter().filter_map(|entry| existing_picture(entry)) {
        valid_mask |= 1 << picture.index();
    }
    dpb.reset_pic_dpb_slots(valid_mask);

    let mut slots = Vec::with_capacity(refs.len());
    let mut references = Vec::with_capacity(refs.len());
    for entry in &refs {
        match existing_picture(entry) {
            Some(reference) => {
                let slot = dpb
                    .get_or_allocate_slot(reference.index(), reference, age)
                    .ok_or(DecodeError::OutOfDpbSlots)?;
                slots.push(Some(ReferenceSlot {
                    slot_index: slot as i32,
                    resource: Some(reference.dpb_resource()),
                    info: ReferenceInfo::H264(reference_info(entry)),
                }));
                references.push(Rc::clone(reference));
            }
            None => slots.push(None),
        }
    }

    dpb.set_field_pic_flag(current.index(), picture.field_pic_flag);
    let setup_slot = if dpb.slots().is_empty() {
        None
    } else {
        let slot = dpb
            .get_or_allocate_slot(current.index(), current, age)
            .ok_or(DecodeError::OutOfDpbSlots)?;
        let mut flags = H264ReferenceFlags::empty();
        if picture.field_pic_flag {
            if picture.bottom_field_flag {
                flags |= H264ReferenceFlags::BOTTOM_FIELD;
            } else {
                flags |= H264ReferenceFlags::TOP_FIELD;
            }
        }
        Some(ReferenceSlot {
            slot_index: slot as i32,
            resource: Some(current.dpb_resource()),
            info: ReferenceInfo::H264(H264ReferenceInfo {
                flags,
                frame_num: h264.frame_num,
                pic_order_cnt: h264.curr_field_order_cnt,
            }),
        })
    };

    // Non-existing frames take slots nothing else uses.
    let mut taken = dpb.slots().slot_in_use_mask();
    for (entry, slot) in refs.iter().zip(slots.iter_mut()) {
        if slot.is_some() {
            continue;
        }
        let index = (0..dpb.slots().len())
            .find(|i| taken & (1 << i) == 0)
            .ok_or(DecodeError::OutOfDpbSlots)?;
        taken |= 1 << index;
        let substitute = substitute_picture(&refs, entry).unwrap_or(current);
        trace!(
            "non-existing frame {} in DPB slot {} backed by picture {}",
            entry.frame_idx,
            index,
            substitute.index()
        );
        *slot = Some(ReferenceSlot {
            slot_index: index as i32,
            resource: Some(substitute.dpb_resource()),
            info: ReferenceInfo::H264(reference_info(entry)),
        });
        references.push(Rc::clone(substitute));
    }

    let mut flags = H264PictureFlags::empty();
    flags.set(H264PictureFlags::FIELD_PIC, picture.field_pic_flag);
    flags.set(H264PictureFlags::BOTTOM_FIELD, picture.bottom_field_flag);
    flags.set(H264PictureFlags::IS_INTRA, picture.intra_pic_flag);
    flags.set(H264PictureFlags::IS_REFERENCE, picture.ref_pic_flag);
    flags.set(H264PictureFlags::IDR_PIC, h264.idr_pic_flag);
    flags.set(
        H264PictureFlags::COMPLEMENTARY_FIELD_PAIR,
        picture.second_field,
    );

    Ok(DpbState {
        reference_slots: slots.into_iter().flatten().collect(),
        setup_slot,
        picture_info: CodecPictureInfo::H264(H264PictureInfo {
            flags,
            seq_parameter_set_id: h264.sps.sps_id().unwrap_or_default(),
            pic_parameter_set_id: h264.pps.pps_id().unwrap_or_default(),
            frame_num: h264.frame_num,
            idr_pic_id: h264.idr_pic_id,
            pic_order_cnt: h264.curr_field_order_cnt,
            slice_offsets: picture.slice_offsets.clone(),
        }),
        references,
    })
}
