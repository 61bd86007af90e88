// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! Per-node configuration.

use super::types::{Dimension, PASS_COUNT};

/// The processing profile of a node instance.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum Profile {
    /// Full noise and post processing.
    #[default]
    Default,
    /// Noise processing only.
    Nps,
    /// Post processing only.
    Pps,
    /// Scaling only.
    Scale,
    /// Full processing without the zoom crop.
    NoZoomCrop,
    /// Full processing with a 10-bit HDR output.
    Hdr10,
}

/// The multi-frame stage a node instance implements.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ProcessingType {
    /// Single-frame processing.
    #[default]
    Default,
    /// MFNR pre-filter.
    MfnrPrefilter,
    /// MFNR blend.
    MfnrBlend,
    /// MFNR post-filter.
    MfnrPostfilter,
    /// MFSR pre-filter.
    MfsrPrefilter,
    /// MFSR blend.
    MfsrBlend,
    /// MFSR post-filter.
    MfsrPostfilter,
}

impl ProcessingType {
    /// Returns true for the MFSR stages before the final post-filter.
    pub fn is_mfsr_intermediate(&self) -> bool {
        matches!(self, ProcessingType::MfsrPrefilter | ProcessingType::MfsrBlend)
    }

    /// Returns true for the stages that temporal-filter against a reference frame.
    pub fn is_temporal(&self) -> bool {
        matches!(
            self,
            ProcessingType::MfnrPrefilter
                | ProcessingType::MfnrBlend
                | ProcessingType::MfsrPrefilter
                | ProcessingType::MfsrBlend
        )
    }
}

bitflags::bitflags! {
    /// Stabilization and temporal-filter features of a node instance.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct StabilizationType: u32 {
        /// Hardware EIS 2.0.
        const EIS2 = 1 << 0;
        /// Hardware EIS 3.0.
        const EIS3 = 1 << 1;
        /// Software EIS 2.0.
        const SWEIS2 = 1 << 2;
        /// Software EIS 3.0.
        const SWEIS3 = 1 << 3;
        /// Motion-compensated temporal filtering.
        const MCTF = 1 << 4;
    }
}

impl StabilizationType {
    /// Returns true if hardware EIS is active.
    pub fn is_hw_eis(&self) -> bool {
        self.intersects(Self::EIS2 | Self::EIS3)
    }

    /// Returns true if software EIS is active.
    pub fn is_sw_eis(&self) -> bool {
        self.intersects(Self::SWEIS2 | Self::SWEIS3)
    }

    /// Returns true if any kind of EIS is active.
    pub fn is_eis(&self) -> bool {
        self.is_hw_eis() || self.is_sw_eis()
    }
}

/// The configuration of one node instance.
///
/// This is set once when the node is built.
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceProperty {
    /// The processing profile.
    pub profile: Profile,
    /// The multi-frame stage.
    pub processing: ProcessingType,
    /// Stabilization features.
    pub stabilization: StabilizationType,
    /// Number of active downscale passes, 1 to 4.
    pub num_passes: u32,
    /// EIS margin requested on each axis, as a fraction of the output size.
    pub eis_margin: (f64, f64),
    /// A fixed border cropped away on top of the EIS margin.
    pub additional_crop_offset: Dimension,
    /// Whether fixed-FOV correction is enabled.
    pub fovc: bool,
    /// Whether the node runs in a realtime (preview/video) pipeline.
    pub realtime: bool,
}

impl Default for InstanceProperty {
    fn default() -> Self {
        Self {
            profile: Profile::Default,
            processing: ProcessingType::Default,
            stabilization: StabilizationType::empty(),
            num_passes: 1,
            eis_margin: (0.0, 0.0),
            additional_crop_offset: Dimension::default(),
            fovc: false,
            realtime: true,
        }
    }
}

impl InstanceProperty {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the profile.
    pub fn profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }

    /// Sets the processing type.
    pub fn processing(mut self, processing: ProcessingType) -> Self {
        self.processing = processing;
        self
    }

    /// Sets the stabilization features.
    pub fn stabilization(mut self, stabilization: StabilizationType) -> Self {
        self.stabilization = stabilization;
        self
    }

    /// Sets the number of active downscale passes.
    pub fn num_passes(mut self, num_passes: u32) -> Self {
        self.num_passes = num_passes.clamp(1, PASS_COUNT as u32);
        self
    }

    /// Sets the EIS margin fractions.
    pub fn eis_margin(mut self, width: f64, height: f64) -> Self {
        self.eis_margin = (width, height);
        self
    }

    /// Sets the additional crop border.
    pub fn additional_crop_offset(mut self, offset: Dimension) -> Self {
        self.additional_crop_offset = offset;
        self
    }

    /// Enables fixed-FOV correction.
    pub fn fovc(mut self, enable: bool) -> Self {
        self.fovc = enable;
        self
    }

    /// Selects realtime or offline operation.
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Returns true if the node loops its output back as the next reference frame.
    pub fn uses_loopback(&self) -> bool {
        self.profile != Profile::Pps
            && self.profile != Profile::Scale
            && (self.stabilization.contains(StabilizationType::MCTF)
                || self.processing.is_temporal())
    }

    /// Returns true if more than one downscale pass is active.
    pub fn is_multipass(&self) -> bool {
        self.num_passes > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stabilization() {
        let st = StabilizationType::EIS3 | StabilizationType::MCTF;
        assert!(st.is_hw_eis());
        assert!(!st.is_sw_eis());
        assert!(st.is_eis());
        assert!(!StabilizationType::MCTF.is_eis());
        assert!(StabilizationType::SWEIS2.is_sw_eis());
    }

    #[test]
    fn test_loopback() {
        assert!(!InstanceProperty::new().uses_loopback());
        assert!(InstanceProperty::new()
            .stabilization(StabilizationType::MCTF)
            .uses_loopback());
        assert!(InstanceProperty::new()
            .processing(ProcessingType::MfnrBlend)
            .uses_loopback());
        assert!(!InstanceProperty::new()
            .processing(ProcessingType::MfnrPostfilter)
            .uses_loopback());
        assert!(!InstanceProperty::new()
            .profile(Profile::Pps)
            .stabilization(StabilizationType::MCTF)
            .uses_loopback());
    }

    #[test]
    fn test_num_passes() {
        assert_eq!(InstanceProperty::new().num_passes(0).num_passes, 1);
        assert_eq!(InstanceProperty::new().num_passes(9).num_passes, 4);
        assert!(InstanceProperty::new().num_passes(3).is_multipass());
    }
}
