// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Demuxers delivering elementary stream chunks, and helpers for Annex-B style units.
//!
//! A unit starts with the 4-byte start code `00 00 00 01`. Its content is escaped so that it
//! never contains `00 00 0x` with `x <= 3`: an emulation prevention byte `03` is inserted after
//! any two zero bytes followed by such a byte.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::io::Cursor;
use std::io::Read;
use std::io::Write;

use anyhow::anyhow;
use anyhow::Context;
use byteorder::LittleEndian;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;
use bytes::Bytes;
use log::debug;

/// Start code preceding each unit.
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Source of elementary stream chunks.
pub trait Demuxer {
    /// Returns the next chunk of the stream, or `None` once the stream is exhausted.
    fn next_chunk(&mut self) -> anyhow::Result<Option<Bytes>>;
}

/// Returns the position of the first start code in `data` at or after `from`.
pub fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(START_CODE.len())
        .position(|w| w == START_CODE)
        .map(|pos| pos + from)
}

/// Inserts emulation prevention bytes into `data`.
pub fn escape_unit(data: &[u8]) -> Vec<u8> {
    let mut escaped = Vec::with_capacity(data.len() + data.len() / 64);
    let mut zeroes = 0;
    for &byte in data {
        if zeroes >= 2 && byte <= 3 {
            escaped.push(3);
            zeroes = 0;
        }
        escaped.push(byte);
        zeroes = if byte == 0 { zeroes + 1 } else { 0 };
    }

    escaped
}

/// Removes the emulation prevention bytes of `data`. Borrows `data` if it has none.
pub fn unescape_unit(data: &[u8]) -> Cow<[u8]> {
    let has_epb = data.windows(3).any(|w| w == [0, 0, 3]);
    if !has_epb {
        return Cow::Borrowed(data);
    }

    let mut unescaped = Vec::with_capacity(data.len());
    let mut zeroes = 0;
    for &byte in data {
        if zeroes >= 2 && byte == 3 {
            zeroes = 0;
            continue;
        }
        unescaped.push(byte);
        zeroes = if byte == 0 { zeroes + 1 } else { 0 };
    }

    Cow::Owned(unescaped)
}

/// Iterator over the units of a chunk, start codes excluded.
pub struct UnitIterator<'a> {
    data: &'a [u8],
    pos: Option<usize>,
}

impl<'a> UnitIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: find_start_code(data, 0),
        }
    }
}

impl<'a> Iterator for UnitIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.pos? + START_CODE.len();
        self.pos = find_start_code(self.data, start);
        let end = self.pos.unwrap_or(self.data.len());

        Some(&self.data[start..end])
    }
}

/// Delivers one unit, start code included, per chunk.
pub struct AnnexBDemuxer {
    data: Bytes,
    pos: Option<usize>,
}

impl AnnexBDemuxer {
    pub fn new(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let pos = find_start_code(&data, 0);
        if pos.map(|p| p > 0).unwrap_or(!data.is_empty()) {
            debug!("skipping {} bytes before the first start code", pos.unwrap_or(data.len()));
        }

        Self { data, pos }
    }
}

impl Demuxer for AnnexBDemuxer {
    fn next_chunk(&mut self) -> anyhow::Result<Option<Bytes>> {
        let Some(pos) = self.pos else {
            return Ok(None);
        };
        self.pos = find_start_code(&self.data, pos + START_CODE.len());
        let end = self.pos.unwrap_or(self.data.len());

        Ok(Some(self.data.slice(pos..end)))
    }
}

/// Delivers chunks that are already split.
#[derive(Default)]
pub struct MemoryDemuxer {
    chunks: VecDeque<Bytes>,
}

impl MemoryDemuxer {
    pub fn new<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
        }
    }

    pub fn push(&mut self, chunk: impl Into<Bytes>) {
        self.chunks.push_back(chunk.into());
    }

    pub fn remaining(&self) -> usize {
        self.chunks.len()
    }
}

impl Demuxer for MemoryDemuxer {
    fn next_chunk(&mut self) -> anyhow::Result<Option<Bytes>> {
        Ok(self.chunks.pop_front())
    }
}

/// Header of an IVF file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IvfFileHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub header_size: u16,
    pub codec: [u8; 4],
    pub width: u16,
    pub height: u16,
    pub framerate: u32,
    pub timescale: u32,
    pub frame_count: u32,
    pub unused: u32,
}

impl Default for IvfFileHeader {
    fn default() -> Self {
        Self {
            magic: Self::MAGIC,
            version: 0,
            header_size: Self::SIZE as u16,
            codec: Self::CODEC_VP9,
            width: 320,
            height: 240,
            framerate: 1,
            timescale: 1000,
            frame_count: 1,
            unused: Default::default(),
        }
    }
}

impl IvfFileHeader {
    pub const SIZE: usize = 32;
    pub const MAGIC: [u8; 4] = *b"DKIF";
    pub const CODEC_H264: [u8; 4] = *b"H264";
    pub const CODEC_H265: [u8; 4] = *b"H265";
    pub const CODEC_VP9: [u8; 4] = *b"VP90";
    pub const CODEC_AV1: [u8; 4] = *b"AV01";

    pub fn new(codec: [u8; 4], width: u16, height: u16, framerate: u32, frame_count: u32) -> Self {
        let default = Self::default();

        Self {
            codec,
            width,
            height,
            framerate: framerate * default.timescale,
            frame_count,
            ..default
        }
    }

    pub fn write_into(&self, writer: &mut impl Write) -> std::io::Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_u16::<LittleEndian>(self.version)?;
        writer.write_u16::<LittleEndian>(self.header_size)?;
        writer.write_all(&self.codec)?;
        writer.write_u16::<LittleEndian>(self.width)?;
        writer.write_u16::<LittleEndian>(self.height)?;
        writer.write_u32::<LittleEndian>(self.framerate)?;
        writer.write_u32::<LittleEndian>(self.timescale)?;
        writer.write_u32::<LittleEndian>(self.frame_count)?;
        writer.write_u32::<LittleEndian>(self.unused)?;

        Ok(())
    }

    pub fn parse(reader: &mut impl Read) -> anyhow::Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != Self::MAGIC {
            return Err(anyhow!("not an IVF file: magic {:02x?}", magic));
        }
        let version = reader.read_u16::<LittleEndian>()?;
        let header_size = reader.read_u16::<LittleEndian>()?;
        let mut codec = [0u8; 4];
        reader.read_exact(&mut codec)?;

        Ok(Self {
            magic,
            version,
            header_size,
            codec,
            width: reader.read_u16::<LittleEndian>()?,
            height: reader.read_u16::<LittleEndian>()?,
            framerate: reader.read_u32::<LittleEndian>()?,
            timescale: reader.read_u32::<LittleEndian>()?,
            frame_count: reader.read_u32::<LittleEndian>()?,
            unused: reader.read_u32::<LittleEndian>()?,
        })
    }
}

/// Header of a frame of an IVF file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IvfFrameHeader {
    pub frame_size: u32,
    pub timestamp: u64,
}

impl IvfFrameHeader {
    pub const SIZE: usize = 12;

    pub fn write_into(&self, writer: &mut impl Write) -> std::io::Result<()> {
        writer.write_u32::<LittleEndian>(self.frame_size)?;
        writer.write_u64::<LittleEndian>(self.timestamp)?;

        Ok(())
    }
}

/// Delivers the frames of an IVF file.
pub struct IvfDemuxer {
    header: IvfFileHeader,
    data: Bytes,
    pos: usize,
}

impl IvfDemuxer {
    pub fn new(data: impl Into<Bytes>) -> anyhow::Result<Self> {
        let data = data.into();
        let header = IvfFileHeader::parse(&mut Cursor::new(&data[..])).context("reading IVF header")?;
        let pos = header.header_size as usize;
        if pos < IvfFileHeader::SIZE || pos > data.len() {
            return Err(anyhow!("invalid IVF header size {}", pos));
        }
        debug!(
            "IVF stream {:?} {}x{}, {} frames",
            String::from_utf8_lossy(&header.codec),
            header.width,
            header.height,
            header.frame_count
        );

        Ok(Self { header, data, pos })
    }

    pub fn header(&self) -> &IvfFileHeader {
        &self.header
    }

    /// Returns the next frame and its timestamp.
    pub fn next_frame(&mut self) -> anyhow::Result<Option<(u64, Bytes)>> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&self.data[self.pos..]);
        let frame_size = cursor
            .read_u32::<LittleEndian>()
            .context("truncated IVF frame header")? as usize;
        let timestamp = cursor
            .read_u64::<LittleEndian>()
            .context("truncated IVF frame header")?;
        let start = self.pos + IvfFrameHeader::SIZE;
        let end = start + frame_size;
        if end > self.data.len() {
            return Err(anyhow!(
                "IVF frame of {} bytes at offset {} exceeds the stream",
                frame_size,
                self.pos
            ));
        }
        self.pos = end;

        Ok(Some((timestamp, self.data.slice(start..end))))
    }
}

impl Demuxer for IvfDemuxer {
    fn next_chunk(&mut self) -> anyhow::Result<Option<Bytes>> {
        Ok(self.next_frame()?.map(|(_, frame)| frame))
    }
}

/// Wraps `frames` into an IVF file.
pub fn write_ivf<'a>(
    codec: [u8; 4],
    width: u16,
    height: u16,
    frames: impl ExactSizeIterator<Item = &'a [u8]>,
) -> Vec<u8> {
    let mut out = Vec::new();
    let header = IvfFileHeader::new(codec, width, height, 30, frames.len() as u32);
    // Writing to a Vec cannot fail.
    let _ = header.write_into(&mut out);
    for (timestamp, frame) in frames.enumerate() {
        let _ = IvfFrameHeader {
            frame_size: frame.len() as u32,
            timestamp: timestamp as u64,
        }
        .write_into(&mut out);
        out.extend_from_slice(frame);
    }

    out
}
