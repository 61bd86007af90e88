// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

use super::layout::{Layout, PlaneAlignment};
use super::types::{Error, Result, Size};
use std::fmt;

/// An image format understood by the IPE.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Format {
    /// 8-bit 4:2:0, interleaved CbCr.
    Nv12,
    /// 8-bit 4:2:0, interleaved CrCb.
    Nv21,
    /// 10-bit 4:2:0 in 16-bit containers.
    P010,
    /// UBWC-compressed NV12.
    UbwcNv12,
    /// UBWC-compressed tightly packed 10-bit 4:2:0.
    UbwcTp10,
    /// 8-bit luma only.
    Y8,
    /// Packed 10-bit downscaled format used by the reference passes.
    Pd10,
}

// firmware format codes
mod consts {
    pub const FW_FORMAT_NV12: u32 = 0x1;
    pub const FW_FORMAT_NV21: u32 = 0x2;
    pub const FW_FORMAT_P010: u32 = 0x3;
    pub const FW_FORMAT_UBWC_NV12: u32 = 0x10;
    pub const FW_FORMAT_UBWC_TP10: u32 = 0x11;
    pub const FW_FORMAT_Y8: u32 = 0x20;
    pub const FW_FORMAT_PD10: u32 = 0x30;
}

pub(crate) const KNOWN_FORMATS: [Format; 7] = [
    Format::Nv12,
    Format::Nv21,
    Format::P010,
    Format::UbwcNv12,
    Format::UbwcTp10,
    Format::Y8,
    Format::Pd10,
];

impl Format {
    /// Returns true for UBWC-compressed formats.
    pub fn is_ubwc(&self) -> bool {
        matches!(self, Format::UbwcNv12 | Format::UbwcTp10)
    }

    /// Returns the per-component bit depth.
    pub fn bit_depth(&self) -> u32 {
        match self {
            Format::Nv12 | Format::Nv21 | Format::UbwcNv12 | Format::Y8 => 8,
            Format::P010 | Format::UbwcTp10 | Format::Pd10 => 10,
        }
    }

    /// Returns the average uncompressed bytes per pixel, chroma included.
    pub fn bytes_per_pixel(&self) -> f64 {
        match self {
            Format::Nv12 | Format::Nv21 | Format::UbwcNv12 => 1.5,
            Format::P010 => 3.0,
            Format::UbwcTp10 => 2.0,
            Format::Y8 => 1.0,
            Format::Pd10 => 2.0,
        }
    }

    /// Returns the firmware format code.
    pub fn firmware_code(&self) -> u32 {
        match self {
            Format::Nv12 => consts::FW_FORMAT_NV12,
            Format::Nv21 => consts::FW_FORMAT_NV21,
            Format::P010 => consts::FW_FORMAT_P010,
            Format::UbwcNv12 => consts::FW_FORMAT_UBWC_NV12,
            Format::UbwcTp10 => consts::FW_FORMAT_UBWC_TP10,
            Format::Y8 => consts::FW_FORMAT_Y8,
            Format::Pd10 => consts::FW_FORMAT_PD10,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Format::Nv12 => "NV12",
            Format::Nv21 => "NV21",
            Format::P010 => "P010",
            Format::UbwcNv12 => "UBWC_NV12",
            Format::UbwcTp10 => "UBWC_TP10",
            Format::Y8 => "Y8",
            Format::Pd10 => "PD10",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

struct FormatClass {
    plane_count: u8,
    block_size: [u8; 2],
    block_extent: [(u8, u8); 2],
}

fn format_class(fmt: Format) -> &'static FormatClass {
    const FORMAT_CLASS_1B: FormatClass = FormatClass {
        plane_count: 1,
        block_size: [1, 0],
        block_extent: [(1, 1), (1, 1)],
    };
    const FORMAT_CLASS_2PLANE_420_3B: FormatClass = FormatClass {
        plane_count: 2,
        block_size: [1, 2],
        block_extent: [(1, 1), (2, 2)],
    };
    const FORMAT_CLASS_2PLANE_420_6B: FormatClass = FormatClass {
        block_size: [2, 4],
        ..FORMAT_CLASS_2PLANE_420_3B
    };
    // 3 pixels per 4 bytes
    const FORMAT_CLASS_2PLANE_420_TP10: FormatClass = FormatClass {
        plane_count: 2,
        block_size: [4, 4],
        block_extent: [(3, 1), (3, 2)],
    };
    // one 2x2 luma block plus its chroma in 8 bytes
    const FORMAT_CLASS_PD10: FormatClass = FormatClass {
        plane_count: 1,
        block_size: [8, 0],
        block_extent: [(2, 2), (1, 1)],
    };

    match fmt {
        Format::Y8 => &FORMAT_CLASS_1B,
        Format::Nv12 | Format::Nv21 | Format::UbwcNv12 => &FORMAT_CLASS_2PLANE_420_3B,
        Format::P010 => &FORMAT_CLASS_2PLANE_420_6B,
        Format::UbwcTp10 => &FORMAT_CLASS_2PLANE_420_TP10,
        Format::Pd10 => &FORMAT_CLASS_PD10,
    }
}

/// Returns the number of planes of a format.
pub fn plane_count(fmt: Format) -> u32 {
    format_class(fmt).plane_count as u32
}

/// Returns the plane alignment a format requires.
pub fn plane_alignment(fmt: Format) -> PlaneAlignment {
    if fmt.is_ubwc() {
        PlaneAlignment::UBWC
    } else {
        PlaneAlignment::NONE
    }
}

/// Computes the packed layout of an image.
///
/// `align` is applied on top of the alignment the format requires.
pub fn packed_layout(
    fmt: Format,
    width: u32,
    height: u32,
    align: PlaneAlignment,
) -> Result<Layout> {
    if width == 0 || height == 0 {
        return Error::user();
    }

    let fmt_class = format_class(fmt);

    let align = align.max(plane_alignment(fmt));
    let mut layout = Layout {
        plane_count: fmt_class.plane_count as u32,
        ..Default::default()
    };

    let mut offset: Size = 0;
    for plane in 0..(fmt_class.plane_count as usize) {
        let (bw, bh) = fmt_class.block_extent[plane];
        let bs = fmt_class.block_size[plane] as Size;

        let width = width.div_ceil(bw as u32) as Size;
        let height = height.div_ceil(bh as u32) as Size;

        offset = offset.next_multiple_of(align.offset);

        let stride = (width * bs).next_multiple_of(align.stride);
        let size = (stride * height).next_multiple_of(align.size);

        layout.offsets[plane] = offset;
        layout.strides[plane] = stride;
        offset += size;
    }

    layout.size = offset;

    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name() {
        assert_eq!(format!("{}", Format::UbwcTp10), "UBWC_TP10");
        assert_eq!(format!("{}", Format::Nv12), "NV12");
    }

    #[test]
    fn properties() {
        for fmt in KNOWN_FORMATS {
            assert!(plane_count(fmt) >= 1);
            assert!(fmt.bytes_per_pixel() > 0.0);
            assert_eq!(plane_alignment(fmt) == PlaneAlignment::UBWC, fmt.is_ubwc());
        }
        assert_eq!(Format::P010.bit_depth(), 10);
        assert_eq!(Format::UbwcNv12.bit_depth(), 8);
    }

    #[test]
    fn firmware_codes_are_unique() {
        let mut codes: Vec<u32> = KNOWN_FORMATS.iter().map(|f| f.firmware_code()).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), KNOWN_FORMATS.len());
    }

    #[test]
    fn packed_layout() {
        let w = 10;
        let h = 10;
        let layout = Layout {
            size: (w * h) as Size,
            plane_count: 1,
            offsets: [0, 0],
            strides: [w as Size, 0],
        };
        let none = PlaneAlignment::NONE;
        assert_eq!(super::packed_layout(Format::Y8, w, h, none).unwrap(), layout);

        let nv12 = super::packed_layout(Format::Nv12, 64, 32, none).unwrap();
        assert_eq!(nv12.plane_count, 2);
        assert_eq!(nv12.offsets[1], 64 * 32);
        assert_eq!(nv12.strides[1], 64);
        assert_eq!(nv12.size, 64 * 32 * 3 / 2);

        let align = PlaneAlignment::stride(16);
        let aligned = super::packed_layout(Format::Y8, w, h, align).unwrap();
        assert_eq!(aligned.strides[0], 16);
        assert_eq!(aligned.size, 16 * h as Size);

        assert!(super::packed_layout(Format::Y8, 0, h, none).is_err());
    }

    #[test]
    fn ubwc_layout() {
        let none = PlaneAlignment::NONE;
        let layout = super::packed_layout(Format::UbwcNv12, 1920, 1080, none).unwrap();
        assert_eq!(layout.strides[0], 1920);
        assert_eq!(layout.offsets[1] % 4096, 0);
        assert_eq!(layout.size % 4096, 0);

        let tp10 = super::packed_layout(Format::UbwcTp10, 1920, 1080, none).unwrap();
        assert_eq!(tp10.strides[0], (640 * 4 as Size).next_multiple_of(128));
    }
}
