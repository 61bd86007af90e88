// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! Generic-blob and Config-IO encoding.
//!
//! The generic blob travels next to the command buffers of a packet and carries typed records
//! the firmware applies before processing the frame.  Config-IO describes every port of the
//! device context.

use super::bandwidth::BandwidthEstimate;
use super::cdm::PortSlot;
use super::formats::{self, Format};
use super::layout::PlaneAlignment;
use super::types::{Dimension, Error, ImageBuffer, Result};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

/// Size of a blob record header.
pub const BLOB_HEADER_SIZE: usize = 8;
/// Size of a Config-IO header.
pub const CONFIG_IO_HEADER_SIZE: usize = 8;
/// Size of a Config-IO port record.
pub const CONFIG_IO_RECORD_SIZE: usize = 28;

const BLOB_TYPE_CLOCK_BANDWIDTH: u32 = 1;
const BLOB_TYPE_MEMORY_MAP_UPDATE: u32 = 2;
const BLOB_TYPE_CONFIG_IO_UPDATE: u32 = 3;

/// Firmware port id of a port slot.
fn port_id(port: PortSlot) -> u32 {
    port.index() as u32
}

/// The configuration of one port.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortConfig {
    /// The port.
    pub port: PortSlot,
    /// The format.
    pub format: Format,
    /// The size.
    pub dim: Dimension,
}

/// The Config-IO structure.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ConfigIo {
    /// Number of active downscale passes.
    pub num_passes: u32,
    /// The ports.
    pub ports: Vec<PortConfig>,
}

impl ConfigIo {
    /// Creates an empty Config-IO.
    pub fn new(num_passes: u32) -> Self {
        Self {
            num_passes,
            ports: Vec::new(),
        }
    }

    /// Adds a port.
    pub fn port(mut self, port: PortSlot, format: Format, dim: Dimension) -> Self {
        self.ports.push(PortConfig { port, format, dim });
        self
    }

    /// Replaces the size of a port.  Returns false if the port is not configured.
    pub fn update(&mut self, port: PortSlot, dim: Dimension) -> bool {
        match self.ports.iter_mut().find(|cfg| cfg.port == port) {
            Some(cfg) => {
                cfg.dim = dim;
                true
            }
            None => false,
        }
    }

    /// Encodes the structure.
    ///
    /// Strides come from the packed layout of each port, so UBWC ports carry their aligned
    /// stride.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf =
            Vec::with_capacity(CONFIG_IO_HEADER_SIZE + CONFIG_IO_RECORD_SIZE * self.ports.len());

        buf.write_u32::<LittleEndian>(u32::try_from(self.ports.len())?)?;
        buf.write_u32::<LittleEndian>(self.num_passes)?;
        for cfg in &self.ports {
            let (width, height) = (cfg.dim.width, cfg.dim.height);
            let layout = formats::packed_layout(cfg.format, width, height, PlaneAlignment::NONE)?;

            buf.write_u32::<LittleEndian>(port_id(cfg.port))?;
            buf.write_u32::<LittleEndian>(cfg.format.firmware_code())?;
            buf.write_u32::<LittleEndian>(cfg.dim.width)?;
            buf.write_u32::<LittleEndian>(cfg.dim.height)?;
            buf.write_u32::<LittleEndian>(u32::try_from(layout.strides[0])?)?;
            buf.write_u32::<LittleEndian>(layout.plane_count)?;
            buf.write_u32::<LittleEndian>(cfg.format.is_ubwc() as u32)?;
        }

        Ok(buf)
    }
}

/// A generic-blob record.
#[derive(Clone, Debug, PartialEq)]
pub enum BlobRecord {
    /// The clock and bandwidth the frame needs.
    ClockBandwidth(BandwidthEstimate),
    /// The scratch buffer the firmware may use.
    MemoryMapUpdate(ImageBuffer),
    /// A re-encoded Config-IO.
    ConfigIoUpdate(Vec<u8>),
}

impl BlobRecord {
    fn blob_type(&self) -> u32 {
        match self {
            BlobRecord::ClockBandwidth(_) => BLOB_TYPE_CLOCK_BANDWIDTH,
            BlobRecord::MemoryMapUpdate(_) => BLOB_TYPE_MEMORY_MAP_UPDATE,
            BlobRecord::ConfigIoUpdate(_) => BLOB_TYPE_CONFIG_IO_UPDATE,
        }
    }

    fn payload(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            BlobRecord::ClockBandwidth(est) => {
                buf.write_u64::<LittleEndian>(est.budget_ns)?;
                buf.write_u64::<LittleEndian>(est.frame_cycles)?;
                buf.write_u64::<LittleEndian>(est.clock_hz)?;
                buf.write_u64::<LittleEndian>(est.read_compressed)?;
                buf.write_u64::<LittleEndian>(est.read_uncompressed)?;
                buf.write_u64::<LittleEndian>(est.write_compressed)?;
                buf.write_u64::<LittleEndian>(est.write_uncompressed)?;
                buf.write_u64::<LittleEndian>(est.total_compressed)?;
                buf.write_u64::<LittleEndian>(est.total_uncompressed)?;
            }
            BlobRecord::MemoryMapUpdate(scratch) => {
                buf.write_u64::<LittleEndian>(scratch.handle.0)?;
                buf.write_u64::<LittleEndian>(scratch.size)?;
            }
            BlobRecord::ConfigIoUpdate(config_io) => buf.extend_from_slice(config_io),
        }

        Ok(buf)
    }
}

/// A generic blob under construction.
#[derive(Clone, Debug, Default)]
pub struct GenericBlob {
    buf: Vec<u8>,
}

impl GenericBlob {
    /// Creates an empty blob.
    pub fn new() -> Self {
        Default::default()
    }

    /// Appends a record.  The payload is zero-padded to a multiple of 4 bytes.
    pub fn push(&mut self, record: &BlobRecord) -> Result<()> {
        let mut payload = record.payload()?;
        payload.resize(payload.len().next_multiple_of(4), 0);

        self.buf.write_u32::<LittleEndian>(record.blob_type())?;
        self.buf.write_u32::<LittleEndian>(u32::try_from(payload.len())?)?;
        self.buf.extend_from_slice(&payload);

        Ok(())
    }

    /// Returns the encoded blob.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Returns true if no record was pushed.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Splits an encoded blob into `(type, payload)` pairs.
pub fn parse_blob(mut bytes: &[u8]) -> Result<Vec<(u32, &[u8])>> {
    let mut records = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < BLOB_HEADER_SIZE {
            return Error::user();
        }

        let blob_type = LittleEndian::read_u32(&bytes[0..4]);
        let size = LittleEndian::read_u32(&bytes[4..8]) as usize;
        let end = BLOB_HEADER_SIZE + size;
        if bytes.len() < end {
            return Error::user();
        }

        records.push((blob_type, &bytes[BLOB_HEADER_SIZE..end]));
        bytes = &bytes[end..];
    }

    Ok(records)
}
