// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;
use std::str::FromStr;

use argh::FromArgs;

use vkvideo_cts::CodecOperation;
use vkvideo_cts::Resolution;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum InputFormat {
    AnnexB,
    Ivf,
}

impl FromStr for InputFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "annexb" => Ok(InputFormat::AnnexB),
            "ivf" => Ok(InputFormat::Ivf),
            _ => Err("unrecognized input format. Valid values: annexb, ivf"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Md5Computation {
    Stream,
    Frame,
}

impl FromStr for Md5Computation {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(Md5Computation::Stream),
            "frame" => Ok(Md5Computation::Frame),
            _ => Err("unrecognized MD5 computation option. Valid values: stream, frame"),
        }
    }
}

/// Parses a `WIDTHxHEIGHT` string.
pub fn parse_resolution(s: &str) -> Result<Resolution, String> {
    let (width, height) = s
        .split_once('x')
        .ok_or_else(|| format!("malformed resolution {}", s))?;
    let width = width
        .parse::<u32>()
        .map_err(|e| format!("bad width {}: {}", width, e))?;
    let height = height
        .parse::<u32>()
        .map_err(|e| format!("bad height {}: {}", height, e))?;
    Ok(Resolution::from((width, height)))
}

/// Decodes a stream on the emulated video device. Without an input file a synthetic stream is
/// generated.
#[derive(Debug, FromArgs)]
pub struct Args {
    /// input file, a synthetic stream is generated if absent
    #[argh(positional)]
    pub input: Option<PathBuf>,

    /// container of the input file (annexb or ivf). Default: annexb
    #[argh(option, default = "InputFormat::AnnexB")]
    pub input_format: InputFormat,

    /// codec of the stream (h264, h265, av1 or vp9)
    #[argh(option)]
    pub codec: CodecOperation,

    /// number of frames to synthesize. Default: 30
    #[argh(option, default = "30")]
    pub frames: usize,

    /// number of B pictures between reference pictures of synthesized H.26x streams
    #[argh(option, default = "0")]
    pub b_frames: usize,

    /// coded extent of synthesized streams. Default: 176x144
    #[argh(option, default = "Resolution::from((176, 144))", from_str_fn(parse_resolution))]
    pub resolution: Resolution,

    /// change the resolution of the synthesized stream half-way to this extent
    #[argh(option, from_str_fn(parse_resolution))]
    pub resolution_change: Option<Resolution>,

    /// number of frames to check, 0 for all of them
    #[argh(option, default = "0")]
    pub frames_to_check: usize,

    /// buffer this many pictures and record their decodes out of order
    #[argh(option)]
    pub out_of_order: Option<usize>,

    /// check the status of every decode operation
    #[argh(switch)]
    pub query_status: bool,

    /// back the DPB with a single layered image
    #[argh(switch)]
    pub layered_dpb: bool,

    /// pass parameter sets inline with each decode
    #[argh(switch)]
    pub inline_params: bool,

    /// whether to display the MD5 of the decoded stream, and at which granularity (stream or
    /// frame)
    #[argh(option)]
    pub compute_md5: Option<Md5Computation>,
}
