// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::rc::Rc;

use crate::codec::h265::H265PictureData;
use crate::codec::h265::H265PictureFlags;
use crate::codec::h265::H265PictureInfo;
use crate::codec::h265::H265ReferenceFlags;
use crate::codec::h265::H265ReferenceInfo;
use crate::codec::h265::MAX_NUM_LIST_REF;
use crate::codec::h265::MAX_NUM_REF_PICS;
use crate::codec::h265::NO_REFERENCE_PICTURE;
use crate::codec::CodecPictureInfo;
use crate::codec::PictureData;
use crate::codec::ReferenceInfo;
use crate::decoder::base::DpbState;
use crate::decoder::dpb::DpbTracker;
use crate::decoder::frame_buffer::Picture;
use crate::decoder::DecodeError;
use crate::decoder::DecodeResult;
use crate::device::ReferenceSlot;

/// Translates indices into `ref_pics` to DPB slot indices, padding with
/// [`NO_REFERENCE_PICTURE`].
fn remap_list(
    list: &[u8],
    frm_list_to_dpb: &[Option<u8>; MAX_NUM_REF_PICS],
) -> DecodeResult<[u8; MAX_NUM_LIST_REF]> {
    if list.len() > MAX_NUM_LIST_REF {
        return Err(DecodeError::InvalidParameters(format!(
            "H.265 reference list of {} entries",
            list.len()
        )));
    }

    let mut remapped = [NO_REFERENCE_PICTURE; MAX_NUM_LIST_REF];
    for (dst, &index) in remapped.iter_mut().zip(list) {
        *dst = frm_list_to_dpb
            .get(index as usize)
            .copied()
            .flatten()
            .ok_or_else(|| {
                DecodeError::InvalidParameters(format!(
                    "H.265 reference list names missing picture {}",
                    index
                ))
            })?;
    }

    Ok(remapped)
}

/// Maps the reference picture set of an H.265 picture and the picture itself to DPB slots.
pub(crate) fn fill_dpb_h265_state(
    dpb: &mut DpbTracker<Picture>,
    picture: &PictureData,
    h265: &H265PictureData,
    age: i32,
) -> DecodeResult<DpbState> {
    let current = &picture.current;

    let mut valid_mask = 1 << current.index();
    for reference in h265.ref_pics.iter().flatten() {
        valid_mask |= 1 << reference.index();
    }
    dpb.reset_pic_dpb_slots(valid_mask);

    let mut frm_list_to_dpb = [None; MAX_NUM_REF_PICS];
    let mut reference_slots = Vec::new();
    let mut references = Vec::new();
    for (i, reference) in h265.ref_pics.iter().enumerate() {
        let Some(reference) = reference else {
            continue;
        };
        let slot = dpb
            .get_or_allocate_slot(reference.index(), reference, age)
            .ok_or(DecodeError::OutOfDpbSlots)?;
        frm_list_to_dpb[i] = Some(slot);

        let mut flags = H265ReferenceFlags::empty();
        flags.set(
            H265ReferenceFlags::USED_FOR_LONG_TERM_REFERENCE,
            h265.is_long_term[i],
        );
        reference_slots.push(ReferenceSlot {
            slot_index: slot as i32,
            resource: Some(reference.dpb_resource()),
            info: ReferenceInfo::H265(H265ReferenceInfo {
                flags,
                pic_order_cnt_val: h265.pic_order_cnt_val[i],
            }),
        });
        references.push(Rc::clone(reference));
    }

    let ref_pic_set_st_curr_before =
        remap_list(&h265.ref_pic_set_st_curr_before, &frm_list_to_dpb)?;
    let ref_pic_set_st_curr_after =
        remap_list(&h265.ref_pic_set_st_curr_after, &frm_list_to_dpb)?;
    let ref_pic_set_lt_curr =
        remap_list(&h265.ref_pic_set_lt_curr, &frm_list_to_dpb)?;

    let setup_slot = if dpb.slots().is_empty() {
        None
    } else {
        let slot = dpb
            .get_or_allocate_slot(current.index(), current, age)
            .ok_or(DecodeError::OutOfDpbSlots)?;
        let mut flags = H265ReferenceFlags::empty();
        flags.set(
            H265ReferenceFlags::UNUSED_FOR_REFERENCE,
            !picture.ref_pic_flag,
        );
        Some(ReferenceSlot {
            slot_index: slot as i32,
            resource: Some(current.dpb_resource()),
            info: ReferenceInfo::H265(H265ReferenceInfo {
                flags,
                pic_order_cnt_val: h265.curr_pic_order_cnt_val,
            }),
        })
    };

    let mut flags = H265PictureFlags::empty();
    flags.set(H265PictureFlags::IRAP_PIC, h265.irap_pic_flag);
    flags.set(H265PictureFlags::IDR_PIC, h265.idr_pic_flag);
    flags.set(H265PictureFlags::IS_REFERENCE, picture.ref_pic_flag);

    Ok(DpbState {
        reference_slots,
        setup_slot,
        picture_info: CodecPictureInfo::H265(H265PictureInfo {
            flags,
            video_parameter_set_id: h265.vps.vps_id().unwrap_or_default(),
            seq_parameter_set_id: h265.sps.sps_id().unwrap_or_default(),
            pic_parameter_set_id: h265.pps.pps_id().unwrap_or_default(),
            pic_order_cnt_val: h265.curr_pic_order_cnt_val,
            ref_pic_set_st_curr_before,
            ref_pic_set_st_curr_after,
            ref_pic_set_lt_curr,
            slice_segment_offsets: picture.slice_offsets.clone(),
        }),
        references,
    })
}
