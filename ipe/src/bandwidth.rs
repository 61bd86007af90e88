// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! Clock and bandwidth estimation.
//!
//! The estimate is recomputed for every request and stamped into the generic blob.  Reads and
//! writes are estimated twice, once as if nothing were compressed and once with the UBWC
//! compression ratios applied.

use super::caps::Capability;
use super::formats::Format;
use super::tuning::{BandwidthTuning, RatioTable};
use super::types::{Dimension, Pass, RequestId};
use log::trace;

/// An image read or written by a request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Plane {
    /// The size.
    pub dim: Dimension,
    /// The format.
    pub format: Format,
}

impl Plane {
    fn bytes(&self) -> f64 {
        self.dim.area() as f64 * self.format.bytes_per_pixel()
    }
}

/// The per-request input of the estimator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BandwidthInput {
    /// The full input.
    pub input: Plane,
    /// The display output, if enabled.
    pub display: Option<Plane>,
    /// The video output, if enabled.
    pub video: Option<Plane>,
    /// The full-resolution reference, if loop-back is active.
    pub reference: Option<Plane>,
    /// Nominal frame rate.
    pub fps: u32,
    /// Request id distance to the previous request.
    pub request_delta: RequestId,
    /// Realtime or snapshot.
    pub realtime: bool,
    /// Number of active downscale passes.
    pub num_passes: u32,
    /// Pixels the stripe program reads, if the frame is striped.
    pub stripe_pixels: Option<u64>,
    /// Number of cores the stripes are spread over.
    pub num_cores: u32,
}

/// The clock and bandwidth request of one frame.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BandwidthEstimate {
    /// Compressed read bandwidth in bytes per second.
    pub read_compressed: u64,
    /// Uncompressed read bandwidth in bytes per second.
    pub read_uncompressed: u64,
    /// Compressed write bandwidth in bytes per second.
    pub write_compressed: u64,
    /// Uncompressed write bandwidth in bytes per second.
    pub write_uncompressed: u64,
    /// Total compressed bandwidth.
    pub total_compressed: u64,
    /// Total uncompressed bandwidth.
    pub total_uncompressed: u64,
    /// Core cycles needed for one frame.
    pub frame_cycles: u64,
    /// Time budget of one frame in ns.
    pub budget_ns: u64,
    /// Core clock in Hz.
    pub clock_hz: u64,
}

const SNAPSHOT_TIERS: [Pass; 4] = [Pass::Dc64, Pass::Dc16, Pass::Dc4, Pass::Full];
const REALTIME_TIERS: [Pass; 3] = [Pass::Dc16, Pass::Dc4, Pass::Full];

fn tier_fraction(pass: Pass) -> f64 {
    1.0 / pass.factor() as f64
}

fn ratio(
    table: &RatioTable,
    uhd_table: &RatioTable,
    plane: &Plane,
    caps: &Capability,
    uhd_width: u32,
) -> f64 {
    if !plane.format.is_ubwc() {
        return 1.0;
    }

    let table = if plane.dim.width >= uhd_width {
        uhd_table
    } else {
        table
    };

    table.get(plane.format.bit_depth(), caps.ubwc_version)
}

struct Estimate {
    compressed: f64,
    uncompressed: f64,
}

fn read_bytes(input: &BandwidthInput, caps: &Capability, tuning: &BandwidthTuning) -> Estimate {
    let src = input.input.bytes();
    let passes = input.num_passes.max(1) as usize;

    let tiers: Vec<(Pass, f64)> = if input.realtime {
        REALTIME_TIERS.into_iter().zip(tuning.realtime_overhead).collect()
    } else {
        SNAPSHOT_TIERS.into_iter().zip(tuning.jpeg_overhead).collect()
    };

    // only the full-resolution read is compressed
    let mut scaled = 0.0;
    let mut full = 0.0;
    for (pass, overhead) in tiers.into_iter().filter(|(pass, _)| pass.index() < passes) {
        let term = src * tier_fraction(pass) * overhead;
        if pass == Pass::Full {
            full = term;
        } else {
            scaled += term;
        }
    }

    let height = input.input.dim.height;
    if input.realtime && height < tuning.partial_read_height {
        let missing =
            (tuning.partial_read_height - height) as f64 / tuning.partial_read_height as f64;
        scaled += src * tuning.partial_read_fraction * missing;
    }

    let input_ratio = ratio(
        &tuning.input_ratio,
        &tuning.input_ratio_uhd,
        &input.input,
        caps,
        tuning.uhd_width,
    );
    let mut est = Estimate {
        compressed: scaled + full / input_ratio,
        uncompressed: scaled + full,
    };

    if let Some(reference) = &input.reference {
        let mctf = ratio(
            &tuning.mctf_ratio,
            &tuning.mctf_ratio_uhd,
            reference,
            caps,
            tuning.uhd_width,
        );
        est.uncompressed += reference.bytes();
        est.compressed += reference.bytes() / mctf;
    }

    est
}

fn write_bytes(input: &BandwidthInput, caps: &Capability, tuning: &BandwidthTuning) -> Estimate {
    let outputs = [
        (input.display, &tuning.preview_ratio, &tuning.preview_ratio),
        (input.video, &tuning.video_ratio, &tuning.video_ratio),
        (input.reference, &tuning.mctf_ratio, &tuning.mctf_ratio_uhd),
    ];

    let mut est = Estimate {
        compressed: 0.0,
        uncompressed: 0.0,
    };
    for (plane, table, uhd_table) in outputs {
        let Some(plane) = plane else {
            continue;
        };
        let bytes = plane.bytes();
        est.uncompressed += bytes;
        est.compressed += bytes / ratio(table, uhd_table, &plane, caps, tuning.uhd_width);
    }

    est
}

/// Estimates the clock and bandwidth of a request.
pub fn estimate(
    input: &BandwidthInput,
    caps: &Capability,
    tuning: &BandwidthTuning,
) -> BandwidthEstimate {
    let fps = if input.request_delta > 1 {
        input.fps.max(1) as f64 / input.request_delta as f64
    } else {
        input.fps.max(1) as f64
    };

    let pixels = input.stripe_pixels.unwrap_or(input.input.dim.area());
    let mut cycles = pixels as f64 / caps.clock_efficiency;
    if input.stripe_pixels.is_some() && input.num_cores > 1 {
        cycles /= 2.0;
    }

    let read = read_bytes(input, caps, tuning);
    let write = write_bytes(input, caps, tuning);
    let per_second = |bytes: f64| (bytes * tuning.sw_margin * fps) as u64;

    let est = BandwidthEstimate {
        read_compressed: per_second(read.compressed),
        read_uncompressed: per_second(read.uncompressed),
        write_compressed: per_second(write.compressed),
        write_uncompressed: per_second(write.uncompressed),
        total_compressed: per_second(read.compressed + write.compressed),
        total_uncompressed: per_second(read.uncompressed + write.uncompressed),
        frame_cycles: cycles as u64,
        budget_ns: (1e9 / fps) as u64,
        clock_hz: (cycles * fps) as u64,
    };
    trace!("bandwidth estimate {:?}", est);

    est
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::ChipVersion;

    fn input() -> BandwidthInput {
        BandwidthInput {
            input: Plane {
                dim: Dimension::new(1920, 1080),
                format: Format::UbwcTp10,
            },
            display: Some(Plane {
                dim: Dimension::new(1920, 1080),
                format: Format::UbwcNv12,
            }),
            video: None,
            reference: None,
            fps: 30,
            request_delta: 1,
            realtime: true,
            num_passes: 1,
            stripe_pixels: None,
            num_cores: 1,
        }
    }

    fn caps() -> &'static Capability {
        Capability::for_chip(ChipVersion::Titan480)
    }

    #[test]
    fn budget() {
        let tuning = BandwidthTuning::default();
        let est = estimate(&input(), caps(), &tuning);
        assert_eq!(est.budget_ns, 33_333_333);
        assert_eq!(est.frame_cycles, (1920.0 * 1080.0 / 0.95) as u64);
        assert!(est.read_compressed < est.read_uncompressed);
        assert!(est.write_compressed < est.write_uncompressed);
        let sum = est.read_uncompressed + est.write_uncompressed;
        assert!(est.total_uncompressed >= sum && est.total_uncompressed <= sum + 1);
    }

    #[test]
    fn frame_drop_scales_fps() {
        let tuning = BandwidthTuning::default();
        let base = estimate(&input(), caps(), &tuning);
        let dropped = estimate(
            &BandwidthInput {
                request_delta: 2,
                ..input()
            },
            caps(),
            &tuning,
        );

        assert_eq!(dropped.budget_ns, 66_666_666);
        assert!(dropped.read_uncompressed * 2 <= base.read_uncompressed + 2);
        assert!(dropped.read_uncompressed * 2 + 2 >= base.read_uncompressed);
        assert_eq!(dropped.frame_cycles, base.frame_cycles);
    }

    #[test]
    fn striping_halves_cycles() {
        let tuning = BandwidthTuning::default();
        let pixels = 2048 * 1080;
        let single = estimate(
            &BandwidthInput {
                stripe_pixels: Some(pixels),
                ..input()
            },
            caps(),
            &tuning,
        );
        let dual = estimate(
            &BandwidthInput {
                stripe_pixels: Some(pixels),
                num_cores: 2,
                ..input()
            },
            caps(),
            &tuning,
        );

        assert_eq!(single.frame_cycles, (pixels as f64 / 0.95) as u64);
        assert_eq!(dual.frame_cycles, (pixels as f64 / 0.95 / 2.0) as u64);
    }

    #[test]
    fn linear_formats_are_not_compressed() {
        let tuning = BandwidthTuning::default();
        let linear = BandwidthInput {
            input: Plane {
                dim: Dimension::new(1920, 1080),
                format: Format::Nv12,
            },
            display: Some(Plane {
                dim: Dimension::new(1280, 720),
                format: Format::Nv12,
            }),
            ..input()
        };

        let est = estimate(&linear, caps(), &tuning);
        assert_eq!(est.read_compressed, est.read_uncompressed);
        assert_eq!(est.write_compressed, est.write_uncompressed);
    }

    #[test]
    fn tiers_and_reference() {
        let tuning = BandwidthTuning::default();
        let single = estimate(&input(), caps(), &tuning);
        let multi = estimate(
            &BandwidthInput {
                num_passes: 3,
                ..input()
            },
            caps(),
            &tuning,
        );
        assert!(multi.read_uncompressed > single.read_uncompressed);

        let snapshot = estimate(
            &BandwidthInput {
                realtime: false,
                num_passes: 4,
                ..input()
            },
            caps(),
            &tuning,
        );
        assert!(snapshot.read_uncompressed > 0);

        let mctf = estimate(
            &BandwidthInput {
                reference: Some(Plane {
                    dim: Dimension::new(1920, 1080),
                    format: Format::UbwcTp10,
                }),
                ..input()
            },
            caps(),
            &tuning,
        );
        assert!(mctf.read_compressed > single.read_compressed);
        assert!(mctf.write_uncompressed > single.write_uncompressed);
    }
}
