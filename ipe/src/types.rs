// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! Simple types.
//!
//! This module defines the error type and the small geometric types shared by every stage of the
//! compiler.

use std::{fmt, io, num, result};

/// The error type for IPE operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The output port requirements cannot be satisfied by any input size.
    #[error("negotiation failed: {0}")]
    Negotiation(&'static str),
    /// A scratch, reference or command buffer could not be allocated.
    #[error("out of resources: {0}")]
    Exhausted(&'static str),
    /// A request could not be compiled.  Nothing was submitted.
    #[error("compile failed: {0}")]
    Compile(&'static str),
    /// The device driver rejected a packet.
    #[error("submission rejected with code {0}")]
    Submit(i32),
    /// The firmware reported a processing error for a request.
    #[error("hardware error on request {0}")]
    Hardware(RequestId),
    /// A validation error indicating a bad user input.
    #[error("bad user input")]
    InvalidParam,
    /// Indicates an unsupported operation.
    #[error("unsupported")]
    NoSupport,
    /// A validation error indicating a bad integer.
    #[error("bad integer conversion")]
    IntegerConversion,
    /// A generic IO error.
    #[error("{0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn negotiation<T>(s: &'static str) -> Result<T> {
        Err(Error::Negotiation(s))
    }

    pub(crate) fn exhausted<T>(s: &'static str) -> Result<T> {
        Err(Error::Exhausted(s))
    }

    pub(crate) fn compile<T>(s: &'static str) -> Result<T> {
        Err(Error::Compile(s))
    }

    pub(crate) fn user<T>() -> Result<T> {
        Err(Error::InvalidParam)
    }
}

impl From<num::TryFromIntError> for Error {
    fn from(_err: num::TryFromIntError) -> Self {
        Self::IntegerConversion
    }
}

/// A specialized `Result` type for IPE operations.
pub type Result<T> = result::Result<T, Error>;

/// The type for byte sizes.
pub type Size = u64;

/// A monotonically increasing capture request id.
pub type RequestId = u64;

/// A width and a height in pixels.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Dimension {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimension {
    /// Creates a dimension.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Returns true if either side is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Returns width / height, or 0 for an empty dimension.
    pub fn aspect_ratio(&self) -> f64 {
        if self.height == 0 {
            0.0
        } else {
            self.width as f64 / self.height as f64
        }
    }

    /// Returns the pixel count.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Rounds both sides up to a multiple of `align`.
    pub fn align_up(&self, align: u32) -> Self {
        Self::new(
            self.width.next_multiple_of(align),
            self.height.next_multiple_of(align),
        )
    }

    /// Rounds both sides down to a multiple of `align`.
    pub fn align_down(&self, align: u32) -> Self {
        Self::new(self.width / align * align, self.height / align * align)
    }

    /// Returns true if both sides fit in `other`.
    pub fn fits_in(&self, other: Dimension) -> bool {
        self.width <= other.width && self.height <= other.height
    }

    /// Divides both sides by `factor`, rounding up.
    pub fn div_ceil(&self, factor: u32) -> Self {
        Self::new(self.width.div_ceil(factor), self.height.div_ceil(factor))
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A rectangle in pixels.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Rect {
    /// Left edge.
    pub left: u32,
    /// Top edge.
    pub top: u32,
    /// Width.
    pub width: u32,
    /// Height.
    pub height: u32,
}

impl Rect {
    /// Creates a rectangle.
    pub const fn new(left: u32, top: u32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// Returns a rectangle covering all of `dim`.
    pub fn full(dim: Dimension) -> Self {
        Self::new(0, 0, dim.width, dim.height)
    }

    /// Returns a rectangle of `size` centered in `bounds`.
    pub fn centered(size: Dimension, bounds: Dimension) -> Self {
        Self::new(
            (bounds.width.saturating_sub(size.width)) / 2,
            (bounds.height.saturating_sub(size.height)) / 2,
            size.width,
            size.height,
        )
    }

    /// Returns the size of the rectangle.
    pub fn size(&self) -> Dimension {
        Dimension::new(self.width, self.height)
    }

    /// Returns true if the rectangle is non-empty and lies within `bounds`.
    pub fn within(&self, bounds: Dimension) -> bool {
        self.width > 0
            && self.height > 0
            && self.left as u64 + self.width as u64 <= bounds.width as u64
            && self.top as u64 + self.height as u64 <= bounds.height as u64
    }
}

/// A downscale pass of the noise-processing chain.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Pass {
    /// Full resolution.
    Full,
    /// 1:4 downscale.
    Dc4,
    /// 1:16 downscale.
    Dc16,
    /// 1:64 downscale.
    Dc64,
}

/// The number of downscale passes.
pub const PASS_COUNT: usize = 4;

impl Pass {
    /// All passes, from full resolution down.
    pub const ALL: [Pass; PASS_COUNT] = [Pass::Full, Pass::Dc4, Pass::Dc16, Pass::Dc64];

    /// Returns the pass index.
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Returns the linear downscale factor relative to the full pass.
    pub fn factor(&self) -> u32 {
        1 << (2 * self.index())
    }

    /// Returns the size of this pass for a full-resolution size.
    pub fn scale(&self, full: Dimension) -> Dimension {
        full.div_ceil(self.factor())
    }
}

/// An opaque handle to an image buffer owned by a buffer manager.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ImageHandle(pub u64);

/// An image buffer together with its allocated byte size.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ImageBuffer {
    /// The manager-issued handle.
    pub handle: ImageHandle,
    /// The allocated size in bytes.
    pub size: Size,
}
