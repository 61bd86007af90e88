// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! Buffer negotiation.
//!
//! Negotiation runs once at pipeline setup.  The requirements of all consumers of every output
//! port are merged into a single input requirement, and the final output sizes are derived back
//! from it.

use super::caps::{Capability, IcaMode, InputLimits, UbwcMode};
use super::formats::Format;
use super::instance::{InstanceProperty, Profile};
use super::tuning::Tuning;
use super::types::{Dimension, Error, Result};
use log::debug;

/// An output port of the node.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum OutputPort {
    /// The display (preview) output.
    Display,
    /// The video output.
    Video,
}

/// The size requirement of one buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BufferRequirement {
    /// The preferred size.
    pub optimal: Dimension,
    /// The smallest acceptable size.
    pub min: Dimension,
    /// The largest acceptable size.
    pub max: Dimension,
    /// Required pixel alignment of both sides.
    pub alignment: u32,
}

impl BufferRequirement {
    /// Creates an unbounded requirement for `optimal`.
    pub fn new(optimal: Dimension) -> Self {
        Self {
            optimal,
            min: Dimension::new(1, 1),
            max: Dimension::new(u32::MAX, u32::MAX),
            alignment: 1,
        }
    }

    /// Sets the minimum size.
    pub fn min(mut self, min: Dimension) -> Self {
        self.min = min;
        self
    }

    /// Sets the maximum size.
    pub fn max(mut self, max: Dimension) -> Self {
        self.max = max;
        self
    }

    /// Sets the alignment.
    pub fn alignment(mut self, alignment: u32) -> Self {
        self.alignment = alignment.max(1);
        self
    }

    /// Returns true if `min <= optimal <= max` on both axes.
    pub fn is_ordered(&self) -> bool {
        self.min.fits_in(self.optimal) && self.optimal.fits_in(self.max)
    }
}

/// The requirements of all consumers of one output port.
#[derive(Clone, Debug, PartialEq)]
pub struct PortRequirement {
    /// The port.
    pub port: OutputPort,
    /// The format the port produces.
    pub format: Format,
    /// One requirement per downstream consumer.
    pub consumers: Vec<BufferRequirement>,
}

/// The outcome of a successful negotiation.
#[derive(Clone, Debug, PartialEq)]
pub struct Negotiated {
    /// The merged input requirement.
    pub input: BufferRequirement,
    /// The final size of every produced port.
    pub outputs: Vec<(OutputPort, Dimension)>,
    /// The input bounds for the active number of passes.
    pub limits: InputLimits,
    /// Pixels added to the input for stabilization.  FOV correction and alignment padding are
    /// not included.
    pub margin: Dimension,
}

impl Negotiated {
    /// Returns the negotiated size of a port.
    pub fn output(&self, port: OutputPort) -> Option<Dimension> {
        self.outputs
            .iter()
            .find(|(p, _)| *p == port)
            .map(|(_, dim)| *dim)
    }
}

struct MergedPort {
    port: OutputPort,
    req: BufferRequirement,
    aspect_ratio: f64,
    ubwc: UbwcMode,
}

fn merge_port(port: &PortRequirement, caps: &Capability) -> Result<Option<MergedPort>> {
    let Some(first) = port.consumers.first() else {
        return Ok(None);
    };

    let mut req = *first;
    let mut aspect_ratio = first.optimal.aspect_ratio();
    for consumer in &port.consumers[1..] {
        req.optimal.width = req.optimal.width.max(consumer.optimal.width);
        req.optimal.height = req.optimal.height.max(consumer.optimal.height);
        req.min.width = req.min.width.max(consumer.min.width);
        req.min.height = req.min.height.max(consumer.min.height);
        req.max.width = req.max.width.min(consumer.max.width);
        req.max.height = req.max.height.min(consumer.max.height);
        req.alignment = req.alignment.max(consumer.alignment);
        aspect_ratio = aspect_ratio.max(consumer.optimal.aspect_ratio());
    }

    let ubwc = if port.format.is_ubwc() {
        if !caps.min_output_ubwc.fits_in(req.max) {
            return Error::negotiation("port cannot reach the UBWC minimum size");
        }
        req.min.width = req.min.width.max(caps.min_output_ubwc.width);
        req.min.height = req.min.height.max(caps.min_output_ubwc.height);
        UbwcMode::Ubwc
    } else {
        UbwcMode::Linear
    };

    if !req.min.fits_in(req.max) {
        return Error::negotiation("consumer bounds do not overlap");
    }

    Ok(Some(MergedPort {
        port: port.port,
        req,
        aspect_ratio,
        ubwc,
    }))
}

fn clamp_dim(dim: Dimension, min: Dimension, max: Dimension) -> Dimension {
    Dimension::new(
        dim.width.clamp(min.width, max.width),
        dim.height.clamp(min.height, max.height),
    )
}

fn to_u32(val: f64) -> u32 {
    // absorb float noise so that exact products do not round up
    (val - 1e-6).ceil().clamp(0.0, u32::MAX as f64) as u32
}

fn scale(dim: Dimension, factor: f64) -> Dimension {
    Dimension::new(to_u32(dim.width as f64 * factor), to_u32(dim.height as f64 * factor))
}

fn ica_mode(props: &InstanceProperty) -> IcaMode {
    match props.profile {
        Profile::NoZoomCrop | Profile::Scale => IcaMode::Disabled,
        _ => IcaMode::Enabled,
    }
}

/// Merges the requirements of every output port into one input requirement.
pub fn negotiate(
    ports: &[PortRequirement],
    sensor_aspect_ratio: Option<f64>,
    props: &InstanceProperty,
    caps: &Capability,
    tuning: &Tuning,
) -> Result<Negotiated> {
    let merged = ports
        .iter()
        .filter_map(|port| merge_port(port, caps).transpose())
        .collect::<Result<Vec<_>>>()?;
    if merged.is_empty() {
        return Error::negotiation("no output port has a consumer");
    }

    let limits = caps.input_limits(ica_mode(props), props.is_multipass());
    let eps = tuning.aspect_ratio_epsilon;

    // optimal
    let mut optimal = Dimension::default();
    let mut prev_ratio: Option<f64> = None;
    for port in &merged {
        optimal.width = optimal.width.max(port.req.optimal.width);
        optimal.height = optimal.height.max(port.req.optimal.height);

        let differs = prev_ratio.is_some_and(|prev| (prev - port.aspect_ratio).abs() > eps);
        if let Some(sensor) = sensor_aspect_ratio.filter(|r| *r > 0.0 && differs) {
            if optimal.aspect_ratio() > sensor {
                optimal.height = to_u32(optimal.width as f64 / sensor);
            } else {
                optimal.width = to_u32(optimal.height as f64 * sensor);
            }
        }
        prev_ratio = Some(port.aspect_ratio);
    }

    let dominant = merged
        .iter()
        .max_by_key(|port| port.req.optimal.area())
        .map_or(0.0, |port| port.aspect_ratio);
    let ratio = optimal.aspect_ratio();
    if dominant > 0.0 && !tuning.is_standard_aspect_ratio(ratio) && (ratio - dominant).abs() > eps
    {
        if ratio > dominant {
            optimal.height = to_u32(optimal.width as f64 / dominant);
        } else {
            optimal.width = to_u32(optimal.height as f64 * dominant);
        }
        debug!("corrected input aspect ratio {:.3} to {:.3}", ratio, dominant);
    }

    // bounds
    let mut min = limits.min;
    let mut max = limits.max;
    for port in &merged {
        let port_min = scale(port.req.min, 1.0 / caps.max_upscale(port.ubwc));
        min.width = min.width.max(port_min.width);
        min.height = min.height.max(port_min.height);

        let port_max = scale(port.req.max, caps.max_downscale(port.ubwc));
        max.width = max.width.min(port_max.width);
        max.height = max.height.min(port_max.height);
    }
    if !min.fits_in(max) {
        return Error::negotiation("input minimum exceeds input maximum");
    }

    let unpadded = clamp_dim(optimal, min, max);

    // margins
    let mut padded = unpadded;
    if props.stabilization.is_eis() {
        let (mw, mh) = props.eis_margin;
        padded = Dimension::new(
            to_u32(padded.width as f64 * (1.0 + mw)),
            to_u32(padded.height as f64 * (1.0 + mh)),
        );
    }
    let margin = Dimension::new(
        padded.width.saturating_sub(unpadded.width),
        padded.height.saturating_sub(unpadded.height),
    );
    if props.fovc {
        padded = scale(padded, 1.0 + 2.0 * tuning.fovc_margin);
    }

    let align = tuning.input_alignment.max(1);
    let upper = if min.fits_in(max.align_down(align)) {
        max.align_down(align)
    } else {
        max
    };
    let input = clamp_dim(padded.align_up(align), min, upper);
    let margin = Dimension::new(margin.width.min(input.width), margin.height.min(input.height));

    let outputs = merged
        .iter()
        .map(|port| {
            (
                port.port,
                clamp_dim(port.req.optimal, port.req.min, port.req.max),
            )
        })
        .collect();

    debug!(
        "negotiated input {} (min {}, max {}, margin {})",
        input, min, max, margin
    );

    Ok(Negotiated {
        input: BufferRequirement {
            optimal: input,
            min,
            max,
            alignment: align,
        },
        outputs,
        limits,
        margin,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::ChipVersion;
    use crate::instance::StabilizationType;

    fn caps() -> &'static Capability {
        Capability::for_chip(ChipVersion::Titan170)
    }

    fn consumer(width: u32, height: u32) -> BufferRequirement {
        BufferRequirement::new(Dimension::new(width, height))
            .min(Dimension::new(320, 240))
            .max(Dimension::new(4096, 3072))
    }

    fn port(port: OutputPort, width: u32, height: u32) -> PortRequirement {
        PortRequirement {
            port,
            format: Format::Nv12,
            consumers: vec![consumer(width, height)],
        }
    }

    #[test]
    fn two_ports_use_dominant_ratio() {
        let ports = [
            port(OutputPort::Display, 1920, 1080),
            port(OutputPort::Video, 640, 480),
        ];
        let res = negotiate(&ports, None, &InstanceProperty::new(), caps(), &Tuning::default())
            .unwrap();

        let input = res.input;
        assert!(input.optimal.width >= 1920);
        assert!((input.optimal.aspect_ratio() - 16.0 / 9.0).abs() <= 0.01);
        assert!(input.is_ordered());
        assert!(input.optimal.fits_in(Dimension::new(4096, 3072)));
        assert_eq!(input.optimal, Dimension::new(1920, 1080));
        assert_eq!(res.output(OutputPort::Video), Some(Dimension::new(640, 480)));
        assert_eq!(res.margin, Dimension::default());
    }

    #[test]
    fn consumers_merge() {
        let ports = [PortRequirement {
            port: OutputPort::Display,
            format: Format::Nv12,
            consumers: vec![
                consumer(1280, 720).max(Dimension::new(1920, 1080)),
                consumer(1920, 1080).min(Dimension::new(640, 360)),
            ],
        }];
        let res = negotiate(&ports, None, &InstanceProperty::new(), caps(), &Tuning::default())
            .unwrap();
        assert_eq!(res.output(OutputPort::Display), Some(Dimension::new(1920, 1080)));
        assert_eq!(res.input.optimal, Dimension::new(1920, 1080));
    }

    #[test]
    fn sensor_ratio_rederives() {
        let ports = [
            port(OutputPort::Display, 1920, 1080),
            port(OutputPort::Video, 1440, 1080),
        ];
        let res = negotiate(
            &ports,
            Some(4.0 / 3.0),
            &InstanceProperty::new(),
            caps(),
            &Tuning::default(),
        )
        .unwrap();
        assert_eq!(res.input.optimal, Dimension::new(1920, 1440));
    }

    #[test]
    fn odd_ratio_is_corrected() {
        let ports = [
            port(OutputPort::Display, 1920, 1080),
            port(OutputPort::Video, 1000, 1200),
        ];
        let res = negotiate(&ports, None, &InstanceProperty::new(), caps(), &Tuning::default())
            .unwrap();
        assert_eq!(res.input.optimal, Dimension::new(2136, 1200));
    }

    #[test]
    fn shared_ratio_is_kept() {
        let tuning = Tuning::default();
        for (w, h) in [(1600, 1200), (1920, 1080), (1000, 600), (2000, 1000)] {
            let ports = [
                port(OutputPort::Display, w, h),
                port(OutputPort::Video, w / 2, h / 2),
            ];
            let res = negotiate(&ports, None, &InstanceProperty::new(), caps(), &tuning).unwrap();
            let expected = w as f64 / h as f64;
            let ratio = res.input.optimal.aspect_ratio();
            assert!((ratio - expected).abs() <= tuning.aspect_ratio_epsilon);
        }
    }

    #[test]
    fn bounds_stay_ordered() {
        let sizes = [
            (16, 16),
            (320, 240),
            (1280, 720),
            (4000, 3000),
            (8000, 100),
            (100, 8000),
        ];
        let props = InstanceProperty::new()
            .stabilization(StabilizationType::EIS3)
            .eis_margin(0.1, 0.1)
            .fovc(true);

        for n in 1..=sizes.len() {
            let ports: Vec<PortRequirement> = sizes[..n]
                .iter()
                .enumerate()
                .map(|(i, (w, h))| PortRequirement {
                    port: if i % 2 == 0 {
                        OutputPort::Display
                    } else {
                        OutputPort::Video
                    },
                    format: Format::Nv12,
                    consumers: vec![BufferRequirement::new(Dimension::new(*w, *h))],
                })
                .collect();
            for props in [InstanceProperty::new(), props.clone()] {
                let res = negotiate(&ports, None, &props, caps(), &Tuning::default()).unwrap();
                assert!(res.input.is_ordered(), "{:?}", res.input);
            }
        }
    }

    #[test]
    fn margins() {
        let ports = [port(OutputPort::Display, 1920, 1080)];
        let props = InstanceProperty::new()
            .stabilization(StabilizationType::EIS2)
            .eis_margin(0.1, 0.1);
        let res = negotiate(&ports, None, &props, caps(), &Tuning::default()).unwrap();
        assert_eq!(res.input.optimal, Dimension::new(2112, 1188));
        assert_eq!(res.margin, Dimension::new(192, 108));

        let props = InstanceProperty::new().fovc(true);
        let res = negotiate(&ports, None, &props, caps(), &Tuning::default()).unwrap();
        assert_eq!(res.input.optimal, Dimension::new(2036, 1148));
        assert_eq!(res.input.optimal.width % 4, 0);
        assert_eq!(res.margin, Dimension::default());
    }

    #[test]
    fn margin_excludes_fovc() {
        let ports = [port(OutputPort::Display, 1920, 1080)];
        let props = InstanceProperty::new()
            .stabilization(StabilizationType::EIS3)
            .eis_margin(0.1, 0.1)
            .fovc(true);
        let res = negotiate(&ports, None, &props, caps(), &Tuning::default()).unwrap();
        assert!(res.input.optimal.width > 2112);
        assert_eq!(res.margin, Dimension::new(192, 108));
    }

    #[test]
    fn ubwc_minimum() {
        let ports = [PortRequirement {
            port: OutputPort::Display,
            format: Format::UbwcNv12,
            consumers: vec![BufferRequirement::new(Dimension::new(64, 32))
                .max(Dimension::new(96, 48))],
        }];
        let res = negotiate(&ports, None, &InstanceProperty::new(), caps(), &Tuning::default());
        assert!(matches!(res, Err(Error::Negotiation(_))));

        let ports = [PortRequirement {
            port: OutputPort::Display,
            format: Format::UbwcNv12,
            consumers: vec![BufferRequirement::new(Dimension::new(64, 32))],
        }];
        let res = negotiate(&ports, None, &InstanceProperty::new(), caps(), &Tuning::default())
            .unwrap();
        assert_eq!(res.output(OutputPort::Display), Some(Dimension::new(128, 64)));
    }

    #[test]
    fn unsatisfiable() {
        let res = negotiate(&[], None, &InstanceProperty::new(), caps(), &Tuning::default());
        assert!(res.is_err());

        let ports = [PortRequirement {
            port: OutputPort::Display,
            format: Format::Nv12,
            consumers: vec![
                consumer(640, 480).min(Dimension::new(1920, 1080)),
                consumer(640, 480).max(Dimension::new(1280, 720)),
            ],
        }];
        let res = negotiate(&ports, None, &InstanceProperty::new(), caps(), &Tuning::default());
        assert!(matches!(res, Err(Error::Negotiation(_))));

        // one port needs more upscale than another allows downscale
        let ports = [
            PortRequirement {
                port: OutputPort::Display,
                format: Format::Nv12,
                consumers: vec![BufferRequirement::new(Dimension::new(16000, 16))
                    .min(Dimension::new(16000, 16))],
            },
            PortRequirement {
                port: OutputPort::Video,
                format: Format::Nv12,
                consumers: vec![BufferRequirement::new(Dimension::new(100, 16))
                    .max(Dimension::new(100, 16))],
            },
        ];
        let res = negotiate(&ports, None, &InstanceProperty::new(), caps(), &Tuning::default());
        assert!(matches!(res, Err(Error::Negotiation(_))));
    }
}
