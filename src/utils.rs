// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.
//!
//! This module is for anything that doesn't fit into the other top-level modules. Try not to add
//! new code here unless it really doesn't belong anywhere else.

/// Rounds `value` up to the next multiple of `alignment`. An alignment of 0 is treated as 1.
pub fn align_up(value: usize, alignment: usize) -> usize {
    let alignment = alignment.max(1);
    value.div_ceil(alignment) * alignment
}

/// Rounds `value` down to the previous multiple of `alignment`. An alignment of 0 is treated as
/// 1.
pub fn align_down(value: usize, alignment: usize) -> usize {
    let alignment = alignment.max(1);
    value - value % alignment
}

/// CRC32 of a decoded frame, formatted the way decode tests compare frames.
pub fn frame_crc32(frame: &[u8]) -> String {
    format!("{:08x}", crc32fast::hash(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(7, 0), 7);
        assert_eq!(align_down(511, 256), 256);
        assert_eq!(align_down(5, 0), 5);
    }

    #[test]
    fn crc_is_zero_padded() {
        assert_eq!(frame_crc32(&[]), "00000000");
        assert_eq!(frame_crc32(b"123456789"), "cbf43926");
    }
}
