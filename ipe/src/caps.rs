// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! Hardware capabilities.
//!
//! Every IPE revision has a fixed set of limits.  They are looked up once after chip-version
//! detection and never change afterwards.

use super::types::Dimension;

/// An IPE hardware revision.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ChipVersion {
    /// Titan 150.
    Titan150,
    /// Titan 160.
    Titan160,
    /// Titan 170.
    Titan170,
    /// Titan 175.
    Titan175,
    /// Titan 480.
    Titan480,
}

/// Whether the ICA geometric-warp stage is in use, which lowers the maximum input size.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IcaMode {
    /// ICA is enabled.
    Enabled,
    /// ICA is bypassed.
    Disabled,
}

/// Whether an output is UBWC-compressed, which changes the scaling limits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UbwcMode {
    /// Linear output.
    Linear,
    /// UBWC output.
    Ubwc,
}

/// The static limits of one hardware revision.
#[derive(Clone, Debug, PartialEq)]
pub struct Capability {
    /// Maximum input size, indexed by [`IcaMode`].
    pub max_input: [Dimension; 2],
    /// Minimum input size with a single pass.
    pub min_input: Dimension,
    /// Minimum input size when more than one downscale pass is active.
    pub min_input_multipass: Dimension,
    /// Maximum output/input ratio, indexed by [`UbwcMode`].
    pub max_upscale: [f64; 2],
    /// Maximum input/output ratio, indexed by [`UbwcMode`].
    pub max_downscale: [f64; 2],
    /// Minimum size of a UBWC output.
    pub min_output_ubwc: Dimension,
    /// Minimum size of a reference (loop-back) buffer.
    pub min_reference: Dimension,
    /// Number of IPE cores.
    pub num_cores: u32,
    /// The fraction of core cycles doing useful pixel work.
    pub clock_efficiency: f64,
    /// The UBWC version the cores implement.
    pub ubwc_version: u32,
    /// Maximum upscale the ICA stage can apply on its own.
    pub ica_max_upscale: f64,
}

const TITAN_150: Capability = Capability {
    max_input: [Dimension::new(4096, 3072), Dimension::new(5376, 4032)],
    min_input: Dimension::new(30, 26),
    min_input_multipass: Dimension::new(384, 288),
    max_upscale: [1.0, 1.0],
    max_downscale: [16.0, 16.0],
    min_output_ubwc: Dimension::new(128, 64),
    min_reference: Dimension::new(30, 26),
    num_cores: 1,
    clock_efficiency: 0.85,
    ubwc_version: 2,
    ica_max_upscale: 1.0,
};

const TITAN_170: Capability = Capability {
    max_input: [Dimension::new(8192, 6144), Dimension::new(14592, 8192)],
    min_input: Dimension::new(30, 26),
    min_input_multipass: Dimension::new(512, 384),
    max_upscale: [2.0, 1.5],
    max_downscale: [64.0, 24.0],
    min_output_ubwc: Dimension::new(128, 64),
    min_reference: Dimension::new(30, 26),
    num_cores: 2,
    clock_efficiency: 0.92,
    ubwc_version: 2,
    ica_max_upscale: 1.5,
};

const TITAN_175: Capability = Capability {
    ubwc_version: 3,
    ..TITAN_170
};

const TITAN_480: Capability = Capability {
    min_input_multipass: Dimension::new(640, 480),
    min_output_ubwc: Dimension::new(256, 128),
    clock_efficiency: 0.95,
    ubwc_version: 4,
    ica_max_upscale: 2.0,
    ..TITAN_170
};

impl Capability {
    /// Returns the limits of a hardware revision.
    pub fn for_chip(chip: ChipVersion) -> &'static Capability {
        match chip {
            ChipVersion::Titan150 | ChipVersion::Titan160 => &TITAN_150,
            ChipVersion::Titan170 => &TITAN_170,
            ChipVersion::Titan175 => &TITAN_175,
            ChipVersion::Titan480 => &TITAN_480,
        }
    }

    /// Returns the maximum input size for an ICA mode.
    pub fn max_input(&self, mode: IcaMode) -> Dimension {
        match mode {
            IcaMode::Enabled => self.max_input[0],
            IcaMode::Disabled => self.max_input[1],
        }
    }

    /// Returns the maximum upscale ratio for a UBWC mode.
    pub fn max_upscale(&self, mode: UbwcMode) -> f64 {
        self.max_upscale[mode as usize]
    }

    /// Returns the maximum downscale ratio for a UBWC mode.
    pub fn max_downscale(&self, mode: UbwcMode) -> f64 {
        self.max_downscale[mode as usize]
    }

    /// Returns the effective input bounds.
    ///
    /// Multi-pass processing tightens the minimum because of striping-library limits.
    pub fn input_limits(&self, mode: IcaMode, multipass: bool) -> InputLimits {
        InputLimits {
            min: if multipass {
                self.min_input_multipass
            } else {
                self.min_input
            },
            max: self.max_input(mode),
        }
    }
}

/// The effective input bounds after accounting for the number of active passes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct InputLimits {
    /// Minimum input size.
    pub min: Dimension,
    /// Maximum input size.
    pub max: Dimension,
}
