// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! Calibration constants.
//!
//! These values come from product tuning rather than from first principles.  They are kept
//! together so that a product can override them without touching the algorithms.

/// Product calibration supplied to a node.
#[derive(Clone, Debug, PartialEq)]
pub struct Tuning {
    /// Crop-to-output ratios in this inclusive band snap to an exact centered 1:1 crop.
    pub near_unity_band: (f64, f64),
    /// Aspect ratios that negotiation never corrects.
    pub standard_aspect_ratios: [f64; 8],
    /// Tolerance used for every aspect-ratio comparison.
    pub aspect_ratio_epsilon: f64,
    /// Requests that must elapse after the first one before a FOV-correction factor is used.
    pub fovc_min_request_dependency: u64,
    /// Margin reserved on each side for FOV correction, as a fraction.
    pub fovc_margin: f64,
    /// Alignment of the negotiated input size.
    pub input_alignment: u32,
    /// Number of slots of a reference ring.
    pub reference_ring_size: usize,
    /// Number of slots of a reference ring when reference dumps are enabled.
    pub reference_ring_size_debug: usize,
    /// Maximum number of cores a request may use.
    pub max_cores: u32,
    /// Bandwidth calibration.
    pub bandwidth: BandwidthTuning,
}

/// Compression ratios indexed by bit depth and UBWC version.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RatioTable {
    /// 8-bit ratios for UBWC versions 2, 3 and 4.
    pub bit8: [f64; 3],
    /// 10-bit ratios for UBWC versions 2, 3 and 4.
    pub bit10: [f64; 3],
}

impl RatioTable {
    /// Returns the ratio for a bit depth and a UBWC version.
    pub fn get(&self, bit_depth: u32, ubwc_version: u32) -> f64 {
        let idx = ubwc_version.clamp(2, 4) as usize - 2;
        if bit_depth > 8 {
            self.bit10[idx]
        } else {
            self.bit8[idx]
        }
    }
}

/// Calibration of the clock/bandwidth estimator.
#[derive(Clone, Debug, PartialEq)]
pub struct BandwidthTuning {
    /// Multiplier applied to every read and write estimate.
    pub sw_margin: f64,
    /// Snapshot read overhead of the 1:64, 1:16, 1:4 and 1:1 tiers.
    pub jpeg_overhead: [f64; 4],
    /// Realtime EIS/PD read overhead of the 1:16, 1:4 and 1:1 tiers.
    pub realtime_overhead: [f64; 3],
    /// Below this input height, realtime reads pay a partial-read term.
    pub partial_read_height: u32,
    /// The partial-read term at height zero, as a fraction of the 1:1 read.
    pub partial_read_fraction: f64,
    /// Input read ratios below UHD.
    pub input_ratio: RatioTable,
    /// Input read ratios at UHD and above.
    pub input_ratio_uhd: RatioTable,
    /// Display write ratios.
    pub preview_ratio: RatioTable,
    /// Video write ratios.
    pub video_ratio: RatioTable,
    /// Reference read and write ratios below UHD.
    pub mctf_ratio: RatioTable,
    /// Reference read and write ratios at UHD and above.
    pub mctf_ratio_uhd: RatioTable,
    /// Width from which a frame counts as UHD.
    pub uhd_width: u32,
}

impl Default for BandwidthTuning {
    fn default() -> Self {
        Self {
            sw_margin: 1.1,
            jpeg_overhead: [1.0, 1.0, 1.03, 1.1],
            realtime_overhead: [1.0, 1.02, 1.06],
            partial_read_height: 1080,
            partial_read_fraction: 0.05,
            input_ratio: RatioTable {
                bit8: [1.5, 1.6, 1.7],
                bit10: [2.0, 2.1, 2.2],
            },
            input_ratio_uhd: RatioTable {
                bit8: [1.6, 1.7, 1.8],
                bit10: [2.2, 2.3, 2.4],
            },
            preview_ratio: RatioTable {
                bit8: [1.3, 1.4, 1.5],
                bit10: [1.7, 1.8, 1.9],
            },
            video_ratio: RatioTable {
                bit8: [1.4, 1.5, 1.6],
                bit10: [1.9, 2.0, 2.1],
            },
            mctf_ratio: RatioTable {
                bit8: [1.6, 1.7, 1.8],
                bit10: [1.6, 1.7, 1.8],
            },
            mctf_ratio_uhd: RatioTable {
                bit8: [1.8, 1.9, 2.0],
                bit10: [1.8, 1.9, 2.0],
            },
            uhd_width: 3840,
        }
    }
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            near_unity_band: (1.0, 1.05),
            standard_aspect_ratios: [
                1.0,
                5.0 / 4.0,
                4.0 / 3.0,
                3.0 / 2.0,
                5.0 / 3.0,
                16.0 / 9.0,
                18.0 / 9.0,
                21.0 / 9.0,
            ],
            aspect_ratio_epsilon: 0.01,
            fovc_min_request_dependency: 4,
            fovc_margin: 0.03,
            input_alignment: 4,
            reference_ring_size: 2,
            reference_ring_size_debug: 4,
            max_cores: 2,
            bandwidth: Default::default(),
        }
    }
}

impl Tuning {
    /// Returns true if `ratio` is close to one of the standard aspect ratios.
    pub fn is_standard_aspect_ratio(&self, ratio: f64) -> bool {
        self.standard_aspect_ratios
            .iter()
            .any(|r| (r - ratio).abs() <= self.aspect_ratio_epsilon)
    }

    /// Returns true if `ratio` falls in the near-unity snap band.
    pub fn is_near_unity(&self, ratio: f64) -> bool {
        let (lo, hi) = self.near_unity_band;
        (lo..=hi).contains(&ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_ratios() {
        let tuning = Tuning::default();
        assert!(tuning.is_standard_aspect_ratio(1920.0 / 1080.0));
        assert!(tuning.is_standard_aspect_ratio(4032.0 / 3024.0));
        assert!(tuning.is_standard_aspect_ratio(2.0));
        assert!(!tuning.is_standard_aspect_ratio(1.9));
        assert!(!tuning.is_standard_aspect_ratio(1.1));
    }

    #[test]
    fn test_near_unity() {
        let tuning = Tuning::default();
        assert!(tuning.is_near_unity(1.0));
        assert!(tuning.is_near_unity(1.02));
        assert!(tuning.is_near_unity(1.05));
        assert!(!tuning.is_near_unity(0.99));
        assert!(!tuning.is_near_unity(1.06));
    }

    #[test]
    fn test_ratio_table() {
        let table = Tuning::default().bandwidth.preview_ratio;
        assert_eq!(table.get(8, 2), 1.3);
        assert_eq!(table.get(10, 4), 1.9);
        assert_eq!(table.get(8, 1), 1.3);
        assert_eq!(table.get(10, 9), 1.9);
    }
}
