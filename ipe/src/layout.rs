// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! Image plane layouts.
//!
//! The firmware addresses every image plane through an offset and a stride.  Config-IO records
//! and buffer allocations both derive them from the packed layout of a format.

use super::types::Size;

/// The maximum number of planes of an IPE image format.
pub const MAX_PLANES: usize = 2;

/// Alignment of the planes of an image.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PlaneAlignment {
    /// Plane offset alignment.
    pub offset: Size,
    /// Plane stride alignment.
    pub stride: Size,
    /// Plane size alignment.
    pub size: Size,
}

impl PlaneAlignment {
    /// No alignment.
    pub const NONE: Self = Self {
        offset: 1,
        stride: 1,
        size: 1,
    };

    /// Tiled UBWC planes need 128-byte strides and page-aligned planes.
    pub const UBWC: Self = Self {
        offset: 4096,
        stride: 128,
        size: 4096,
    };

    /// Returns an alignment with only the stride aligned.
    pub fn stride(stride: Size) -> Self {
        Self {
            stride: stride.max(1),
            ..Self::NONE
        }
    }

    /// Returns the stricter of two alignments.
    pub fn max(self, other: Self) -> Self {
        Self {
            offset: self.offset.max(other.offset),
            stride: self.stride.max(other.stride),
            size: self.size.max(other.size),
        }
    }
}

impl Default for PlaneAlignment {
    fn default() -> Self {
        Self::NONE
    }
}

/// The physical layout of an image buffer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Layout {
    /// Total size in bytes.
    pub size: Size,
    /// Number of planes.
    pub plane_count: u32,
    /// Byte offset of each plane.
    pub offsets: [Size; MAX_PLANES],
    /// Byte stride of each plane.
    pub strides: [Size; MAX_PLANES],
}
