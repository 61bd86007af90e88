// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! Zoom, crop and stabilization.
//!
//! The resolver computes the ICA1 window of a request from upstream crop metadata and the ICA2
//! window from the crop of the previous request.  Everything carried from one request to the next
//! lives in [`RequestHistory`], which is passed in and handed back updated.

use super::backends::{PropertyKey, PropertyStore, PropertyValue};
use super::caps::Capability;
use super::instance::{InstanceProperty, ProcessingType, Profile};
use super::tuning::Tuning;
use super::types::{Dimension, Rect, RequestId, Result};
use log::{info, warn};

/// The kind of node that produced the input frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParentStage {
    /// The realtime capture front end.
    Ife,
    /// A node outside the camera pipeline.
    External {
        /// Whether the node publishes its own crop.
        crop_dependency: bool,
    },
    /// The pre-processing stage.
    Bps,
    /// An offline or snapshot pipeline.
    Offline,
    /// Anything else.
    Other,
}

/// A crop window together with the frame it applies to.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ZoomWindow {
    /// The crop.
    pub rect: Rect,
    /// The full frame.
    pub full: Dimension,
}

impl ZoomWindow {
    /// Returns the window covering all of `full`.
    pub fn full(full: Dimension) -> Self {
        Self {
            rect: Rect::full(full),
            full,
        }
    }

    /// Returns true for the all-zero window that disables a warp stage.
    pub fn is_zeroed(&self) -> bool {
        *self == Self::default()
    }
}

/// State carried from one request to the next.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RequestHistory {
    /// The ICA1 crop of the previous request.
    pub previous_crop: Option<ZoomWindow>,
    /// The MFSR intermediate size of the previous request.
    pub prev_intermediate: Option<Dimension>,
    /// The previous request id.
    pub last_request: Option<RequestId>,
    /// The first request id of the node.
    pub first_request: Option<RequestId>,
    /// The cached FOV-correction factor.
    pub fovc_factor: Option<f64>,
}

impl RequestHistory {
    /// Returns true if `request_id` directly follows the previous request.
    pub fn is_consecutive(&self, request_id: RequestId) -> bool {
        self.last_request
            .is_some_and(|last| request_id.checked_sub(last) == Some(1))
    }
}

/// The per-request input of the resolver.
#[derive(Clone, Copy, Debug)]
pub struct ZoomContext<'a> {
    /// The request id.
    pub request_id: RequestId,
    /// The producer of the input frame.
    pub parent: ParentStage,
    /// The node configuration.
    pub props: &'a InstanceProperty,
    /// The full input size.
    pub full_input: Dimension,
    /// The largest output size.
    pub full_output: Dimension,
    /// EIS margin, in pixels, included in the input.
    pub margin: Dimension,
    /// Whether reference ports are active for the request.
    pub loopback_active: bool,
}

/// The resolved windows and scale ratios of a request.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ZoomResult {
    /// The current-frame window.
    pub ica1: ZoomWindow,
    /// The reference-frame window.  Zeroed when there is no reference.
    pub ica2: ZoomWindow,
    /// Upstream scaler ratio.
    pub pre_scale: f64,
    /// Crop width over output width.
    pub post_scale: f64,
    /// The MFSR working size, for the pre-filter stage only.
    pub intermediate: Option<Dimension>,
    /// Set when the intermediate size changed and the device must be reconfigured.
    pub reconfigure: bool,
}

fn crop_of(store: &dyn PropertyStore, key: PropertyKey, request_id: RequestId) -> Option<Rect> {
    match store.get(key, request_id, 0) {
        Some(PropertyValue::Crop(rect)) => Some(rect),
        _ => None,
    }
}

fn scale_output_crop(store: &dyn PropertyStore, request_id: RequestId) -> Option<Rect> {
    crop_of(store, PropertyKey::ScaleOutputCrop, request_id)
        .or_else(|| crop_of(store, PropertyKey::InputScaleOutputCrop, request_id))
}

fn scale_axis(val: u32, to: u32, from: u32) -> u32 {
    if from == 0 {
        val
    } else {
        (val as u64 * to as u64 / from as u64) as u32
    }
}

fn rescale(rect: Rect, from: Dimension, to: Dimension) -> Rect {
    Rect::new(
        scale_axis(rect.left, to.width, from.width),
        scale_axis(rect.top, to.height, from.height),
        scale_axis(rect.width, to.width, from.width),
        scale_axis(rect.height, to.height, from.height),
    )
}

fn reference_crop(
    ctx: &ZoomContext,
    store: &dyn PropertyStore,
    tuning: &Tuning,
) -> Option<Rect> {
    let Some(PropertyValue::RefCrop { window, ref_dim }) =
        store.get(PropertyKey::RefCropWindow, ctx.request_id, 0)
    else {
        return None;
    };

    let crop = rescale(window, ref_dim, ctx.full_input);
    if ctx.full_output.width > 0 {
        let ratio = crop.width as f64 / ctx.full_output.width as f64;
        if tuning.is_near_unity(ratio) {
            return Some(Rect::centered(ctx.full_output, ctx.full_input));
        }
    }

    if !crop.within(ctx.full_input) {
        warn!(
            "request {}: crop {:?} exceeds input {}, using full frame",
            ctx.request_id, crop, ctx.full_input
        );
        return Some(Rect::full(ctx.full_input));
    }

    Some(crop)
}

fn derives_crop(props: &InstanceProperty) -> bool {
    matches!(props.profile, Profile::Pps | Profile::Default | Profile::Hdr10)
        || props.processing.is_mfsr_intermediate()
}

fn upstream_crop(
    ctx: &ZoomContext,
    store: &dyn PropertyStore,
    tuning: &Tuning,
    history: &mut RequestHistory,
) -> Rect {
    let rid = ctx.request_id;

    let crop = match ctx.parent {
        ParentStage::Ife => {
            let first = history.first_request.unwrap_or(rid);
            if ctx.props.fovc && rid.saturating_sub(first) >= tuning.fovc_min_request_dependency {
                if let Some(PropertyValue::Factor(factor)) =
                    store.get(PropertyKey::FovcFactor, rid, 1)
                {
                    if factor > 0.0 && factor < 1.0 {
                        history.fovc_factor = Some(factor);
                    }
                }
            }
            crop_of(store, PropertyKey::ResidualCrop, rid)
        }
        ParentStage::External {
            crop_dependency: true,
        } => crop_of(store, PropertyKey::ChiNodeCrop, rid),
        ParentStage::Bps | ParentStage::Offline => {
            reference_crop(ctx, store, tuning).or_else(|| scale_output_crop(store, rid))
        }
        _ => scale_output_crop(store, rid),
    };

    match crop {
        Some(crop) if crop.within(ctx.full_input) => crop,
        Some(crop) => {
            warn!("request {}: ignoring crop {:?} outside the input", rid, crop);
            Rect::full(ctx.full_input)
        }
        None => Rect::full(ctx.full_input),
    }
}

fn stabilize(ctx: &ZoomContext, crop: Rect) -> Rect {
    let stabilization = ctx.props.stabilization;
    let extra = ctx.props.additional_crop_offset;

    let mut crop = if stabilization.is_hw_eis() {
        let reduced = Dimension::new(
            ctx.full_input.width.saturating_sub(ctx.margin.width),
            ctx.full_input.height.saturating_sub(ctx.margin.height),
        );
        rescale(crop, ctx.full_input, reduced)
    } else if stabilization.is_sw_eis() {
        Rect {
            width: crop.width / 16 * 16,
            height: crop.height / 16 * 16,
            ..crop
        }
    } else {
        return crop;
    };

    crop.left += extra.width / 2;
    crop.top += extra.height / 2;

    crop
}

fn apply_fovc(crop: Rect, factor: f64) -> Rect {
    let width = (crop.width as f64 * (1.0 - factor)) as u32;
    let height = (crop.height as f64 * (1.0 - factor)) as u32;

    Rect::new(
        crop.left + (crop.width - width) / 2,
        crop.top + (crop.height - height) / 2,
        width,
        height,
    )
}

fn even_ceil(val: f64) -> u32 {
    let val = val.ceil().max(0.0) as u32;
    val + (val & 1)
}

/// Resolves the zoom windows of a request.
///
/// Returns the windows together with the history to pass to the next request.
pub fn resolve(
    ctx: &ZoomContext,
    store: &dyn PropertyStore,
    tuning: &Tuning,
    caps: &Capability,
    history: &RequestHistory,
) -> Result<(ZoomResult, RequestHistory)> {
    let mut next = *history;

    let crop = if derives_crop(ctx.props) {
        let crop = upstream_crop(ctx, store, tuning, &mut next);
        let crop = stabilize(ctx, crop);
        match next.fovc_factor {
            Some(factor) if ctx.props.fovc => apply_fovc(crop, factor),
            _ => crop,
        }
    } else {
        Rect::full(ctx.full_input)
    };

    let ica1 = ZoomWindow {
        rect: crop,
        full: ctx.full_input,
    };
    let ica2 = if ctx.loopback_active {
        history.previous_crop.unwrap_or_default()
    } else {
        ZoomWindow::default()
    };

    let pre_scale = match store.get(PropertyKey::ScalerOutput, ctx.request_id, 0) {
        Some(PropertyValue::Scaler { input, output }) if output.width > 0 => {
            input.width as f64 / output.width as f64
        }
        _ => 1.0,
    };
    let post_scale = if ctx.full_output.width > 0 {
        crop.width as f64 / ctx.full_output.width as f64
    } else {
        1.0
    };

    let mut intermediate = None;
    let mut reconfigure = false;
    if ctx.props.processing == ProcessingType::MfsrPrefilter {
        let dim = Dimension::new(
            even_ceil(crop.width as f64 * caps.ica_max_upscale).min(ctx.full_output.width),
            even_ceil(crop.height as f64 * caps.ica_max_upscale).min(ctx.full_output.height),
        );
        if history.prev_intermediate != Some(dim) {
            info!(
                "request {}: intermediate size changed to {}",
                ctx.request_id, dim
            );
            reconfigure = true;
        }
        next.prev_intermediate = Some(dim);
        intermediate = Some(dim);
    }

    next.previous_crop = Some(ica1);
    next.last_request = Some(ctx.request_id);
    next.first_request = history.first_request.or(Some(ctx.request_id));

    Ok((
        ZoomResult {
            ica1,
            ica2,
            pre_scale,
            post_scale,
            intermediate,
            reconfigure,
        },
        next,
    ))
}
