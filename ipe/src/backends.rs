// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! Collaborator interfaces.
//!
//! The compiler reaches hardware, metadata and memory only through the traits in this module.
//! [`memory`] has in-process implementations of all of them.

pub mod memory;

use super::cmd::{FrameBuffers, Patch};
use super::formats::{self, Format};
use super::layout::PlaneAlignment;
use super::types::{Dimension, Error, ImageBuffer, ImageHandle, Rect, RequestId, Result, Size};

/// The size of an allocation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Extent {
    /// A plain buffer of a byte size.
    Buffer(Size),
    /// An image of a width and a height.
    Image(u32, u32),
}

impl Extent {
    /// Returns the extent of an image of `dim`.
    pub fn image(dim: Dimension) -> Self {
        Self::Image(dim.width, dim.height)
    }

    pub(crate) fn is_empty(&self) -> bool {
        match self {
            Extent::Buffer(size) => *size == 0,
            Extent::Image(width, height) => *width == 0 || *height == 0,
        }
    }
}

impl Default for Extent {
    fn default() -> Self {
        Self::Buffer(0)
    }
}

/// Describes an allocation request to a [`BufferManager`].
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Description {
    /// The image format.  Plain buffers have none.
    pub format: Option<Format>,
    /// The allocation size.
    pub extent: Extent,
}

impl Description {
    /// Creates an empty description.
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the image format.
    pub fn format(mut self, fmt: Format) -> Self {
        self.format = Some(fmt);
        self
    }

    /// Sets the extent.
    pub fn extent(mut self, extent: Extent) -> Self {
        self.extent = extent;
        self
    }

    /// Returns true if the description is self-consistent and non-empty.
    pub fn is_valid(&self) -> bool {
        let kind_matches = match self.extent {
            Extent::Buffer(_) => self.format.is_none(),
            Extent::Image(..) => self.format.is_some(),
        };

        kind_matches && !self.extent.is_empty()
    }

    /// Returns the byte size of the allocation, using the packed layout for images.
    pub fn size(&self) -> Result<Size> {
        if !self.is_valid() {
            return Error::user();
        }

        match (self.extent, self.format) {
            (Extent::Buffer(size), _) => Ok(size),
            (Extent::Image(width, height), Some(fmt)) => {
                let align = PlaneAlignment::NONE;
                Ok(formats::packed_layout(fmt, width, height, align)?.size)
            }
            (Extent::Image(..), None) => Error::user(),
        }
    }
}

/// Identifies an acquired device context.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DeviceHandle(pub u64);

/// A fence that signals when the firmware is done with a request.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Fence(pub u64);

/// What a device context is acquired with.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceDescriptor {
    /// The negotiated input size.
    pub input: Dimension,
    /// The encoded Config-IO structure.
    pub config_io: Vec<u8>,
}

/// A compiled request on its way to the firmware.
#[derive(Clone, Copy, Debug)]
pub struct Packet<'a> {
    /// The request id.
    pub request_id: RequestId,
    /// The sealed command buffers.
    pub buffers: &'a FrameBuffers,
    /// The cross-buffer addresses to fill in.
    pub patches: &'a [Patch],
    /// The image buffers the patches may point to.
    pub images: &'a [ImageBuffer],
    /// The generic blob.
    pub blob: &'a [u8],
}

/// The device driver boundary.
pub trait DeviceDriver: Send + Sync {
    /// Acquires a device context.
    fn acquire(&self, desc: &DeviceDescriptor) -> Result<DeviceHandle>;

    /// Places the buffers of a packet, resolves its patches and queues it.
    fn submit(&self, handle: DeviceHandle, packet: &Packet) -> Result<Fence>;

    /// Releases a device context.
    fn release(&self, _handle: DeviceHandle) {}
}

/// Keys of the properties the compiler reads and publishes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PropertyKey {
    /// Residual crop of the upstream capture stage.
    ResidualCrop,
    /// Crop published by an external node.
    ChiNodeCrop,
    /// Reference crop window with its reference size.
    RefCropWindow,
    /// Crop of the most recent scale output.
    ScaleOutputCrop,
    /// Crop of the input or offline scale output.
    InputScaleOutputCrop,
    /// Fixed-FOV correction factor.
    FovcFactor,
    /// Upstream scaler input and output sizes.
    ScalerOutput,
    /// AEC gain.
    AecGain,
    /// ICA warp parameters.
    IcaWarp,
    /// Gamma curve.
    GammaCurve,
    /// The crop the node applied, published for downstream nodes.
    AppliedCrop,
}

/// A property value.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    /// A crop rectangle.
    Crop(Rect),
    /// A crop window in the coordinates of a reference size.
    RefCrop {
        /// The window.
        window: Rect,
        /// The size the window refers to.
        ref_dim: Dimension,
    },
    /// A scalar factor.
    Factor(f64),
    /// Scaler sizes.
    Scaler {
        /// The scaler input.
        input: Dimension,
        /// The scaler output.
        output: Dimension,
    },
    /// A sensor gain.
    Gain(f32),
    /// Opaque data.
    Blob(Vec<u8>),
}

/// The metadata/property store boundary.
pub trait PropertyStore: Send + Sync {
    /// Returns the value of `key` published for request `request_id - offset`.
    fn get(&self, key: PropertyKey, request_id: RequestId, offset: u64) -> Option<PropertyValue>;

    /// Publishes a value for a request.
    fn publish(
        &self,
        _key: PropertyKey,
        _request_id: RequestId,
        _value: PropertyValue,
    ) -> Result<()> {
        Err(Error::NoSupport)
    }
}

/// The buffer manager boundary.
///
/// Buffers are reference-counted.  Allocation hands out one reference per buffer; a buffer is
/// freed when its last reference is released.
pub trait BufferManager: Send + Sync {
    /// Allocates `count` buffers.
    fn allocate(&self, desc: &Description, count: usize) -> Result<Vec<ImageBuffer>>;

    /// Takes another reference to a buffer.
    fn acquire(&self, handle: ImageHandle) -> Result<()>;

    /// Drops a reference to a buffer.
    fn release(&self, handle: ImageHandle);
}

/// Identifies a striping-library context.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct StripingHandle(pub u64);

/// The geometry a striping context is created for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StripingConfig {
    /// The full input size.
    pub input: Dimension,
    /// The largest output size.
    pub output: Dimension,
    /// The input format.
    pub format: Format,
    /// Number of active downscale passes.
    pub num_passes: u32,
    /// Number of cores to split the frame across.
    pub num_cores: u32,
}

/// The per-request window handed to the striping library.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StripeWindow {
    /// The crop applied to the input.
    pub crop: Rect,
    /// The output size.
    pub output: Dimension,
}

/// A stripe program.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StripeProgram {
    /// The encoded program, copied into the striping command buffer.
    pub bytes: Vec<u8>,
    /// The number of pixels the cores read, overlap included.
    pub pixel_count: u64,
}

/// The striping library boundary.
pub trait StripingLibrary: Send + Sync {
    /// Creates a context.
    fn create_context(&self, config: &StripingConfig) -> Result<StripingHandle>;

    /// Splits a window into stripes.
    fn execute(&self, handle: StripingHandle, window: &StripeWindow) -> Result<StripeProgram>;

    /// Destroys a context.
    fn destroy_context(&self, _handle: StripingHandle) {}
}
