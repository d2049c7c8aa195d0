// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Policies deciding when the decoder replaces its session and parameters objects.
//!
//! The defaults only recreate what cannot be reused. Tests stressing object churn in the driver
//! plug in a policy that forces recreation more often.

use std::fmt;
use std::num::NonZeroUsize;

use crate::decoder::DecoderConfig;

pub trait SessionPolicy: fmt::Debug {
    /// Whether a new session must be created for a sequence. `compatible` tells whether the
    /// current session can decode it.
    fn recreate_session(&self, compatible: bool) -> bool {
        !compatible
    }

    /// Whether the coding scope resetting the codec binds the session parameters object.
    fn bind_parameters_on_reset(&self) -> bool {
        true
    }

    /// Number of parameter set updates after which the current session parameters object is
    /// dropped and a new one started.
    fn parameters_reset_trigger(&self) -> Option<NonZeroUsize> {
        None
    }
}

/// The policy a [`DecoderConfig`] asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigPolicy {
    always_recreate_session: bool,
    reset_codec_no_session_params: bool,
    parameters_reset_trigger: Option<NonZeroUsize>,
}

impl ConfigPolicy {
    pub fn new(config: &DecoderConfig) -> Self {
        Self {
            always_recreate_session: config.always_recreate_dpb || config.resolution_change,
            reset_codec_no_session_params: config.reset_codec_no_session_params,
            parameters_reset_trigger: config.picture_parameter_update_trigger,
        }
    }
}

impl SessionPolicy for ConfigPolicy {
    fn recreate_session(&self, compatible: bool) -> bool {
        self.always_recreate_session || !compatible
    }

    fn bind_parameters_on_reset(&self) -> bool {
        !self.reset_codec_no_session_params
    }

    fn parameters_reset_trigger(&self) -> Option<NonZeroUsize> {
        self.parameters_reset_trigger
    }
}
