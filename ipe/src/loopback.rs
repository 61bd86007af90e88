// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! Reference (loop-back) buffers.
//!
//! Temporal filtering reads the output of the previous request as its reference.  Every active
//! downscale pass owns a small ring of buffers: a request writes one slot and reads the slot
//! before it.

use super::backends::{BufferManager, Description, Extent};
use super::caps::Capability;
use super::cdm::PortSlot;
use super::compiler::ImageBinding;
use super::formats::Format;
use super::types::{Dimension, Error, ImageBuffer, Pass, RequestId, Result};
use super::zoom::RequestHistory;
use log::{debug, info};

/// The lifecycle of the reference rings.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RingState {
    /// No ring exists.
    #[default]
    Disabled,
    /// Rings are allocated but no request used them yet.
    Created,
    /// Requests are using the rings.
    Active,
    /// The rings were released.
    Destroyed,
}

/// The ring of one downscale pass.
#[derive(Clone, Debug, PartialEq)]
pub struct ReferenceRing {
    /// The pass.
    pub pass: Pass,
    /// The size of every buffer.
    pub dim: Dimension,
    /// The format of every buffer.
    pub format: Format,
    /// The buffers.
    pub buffers: Vec<ImageBuffer>,
}

/// The ring slots of one frame of a request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SlotPair {
    /// The slot the frame writes.
    pub output: usize,
    /// The slot the frame reads.
    pub input: usize,
}

/// Returns the ring slots of every frame of a request.
///
/// A request owns `batch_size` consecutive slots, wrapping around the ring.  A ring smaller than
/// the batch is reused within the batch.  The input slot always precedes the output slot.
pub fn ring_slots(ring_size: usize, request_id: RequestId, batch_size: u32) -> Vec<SlotPair> {
    if ring_size == 0 {
        return Vec::new();
    }

    let batch = batch_size.max(1) as usize;
    let base = if ring_size >= batch {
        ((request_id % ring_size as RequestId) as usize * batch) % ring_size
    } else {
        0
    };

    (0..batch)
        .map(|idx| {
            let output = (base + idx) % ring_size;
            SlotPair {
                output,
                input: (output + ring_size - 1) % ring_size,
            }
        })
        .collect()
}

fn reference_format(pass: Pass) -> Format {
    match pass {
        Pass::Full => Format::UbwcTp10,
        _ => Format::Pd10,
    }
}

/// Owns the reference rings of a node.
#[derive(Debug, Default)]
pub struct LoopbackManager {
    state: RingState,
    ring_size: usize,
    rings: Vec<ReferenceRing>,
}

impl LoopbackManager {
    /// Creates a manager with no rings.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the state.
    pub fn state(&self) -> RingState {
        self.state
    }

    /// Returns the rings, one per pass from full resolution down.
    pub fn rings(&self) -> &[ReferenceRing] {
        &self.rings
    }

    /// Returns the number of slots per ring.
    pub fn ring_size(&self) -> usize {
        self.ring_size
    }

    /// Allocates a ring of `ring_size` buffers for each pass that meets the reference minimum.
    ///
    /// Allocation stops at the first pass that is too small.  If an allocation fails, every ring
    /// allocated so far is released.
    pub fn create(
        &mut self,
        full: Dimension,
        num_passes: u32,
        ring_size: usize,
        caps: &Capability,
        mgr: &dyn BufferManager,
    ) -> Result<()> {
        if self.state != RingState::Disabled {
            return Error::user();
        }
        if ring_size == 0 {
            return Error::exhausted("empty reference ring");
        }

        for pass in Pass::ALL.iter().take(num_passes as usize) {
            let dim = pass.scale(full);
            if !caps.min_reference.fits_in(dim) {
                debug!("{:?} reference {} is below the minimum, stopping", pass, dim);
                break;
            }

            let format = reference_format(*pass);
            let desc = Description::new().format(format).extent(Extent::image(dim));
            let buffers = match mgr.allocate(&desc, ring_size) {
                Ok(buffers) => buffers,
                Err(err) => {
                    self.release_all(mgr);
                    return Err(err);
                }
            };

            debug!(
                "allocated {} {} reference buffers of {} for {:?}",
                ring_size, format, dim, pass
            );
            self.rings.push(ReferenceRing {
                pass: *pass,
                dim,
                format,
                buffers,
            });
        }

        if !self.rings.is_empty() {
            self.ring_size = ring_size;
            self.state = RingState::Created;
        }

        Ok(())
    }

    /// Returns the image bindings of a request.
    ///
    /// Reference inputs are left out when the previous request is not `request_id - 1`, since
    /// the reference it left behind is stale or missing.
    pub fn bindings(
        &mut self,
        request_id: RequestId,
        batch_size: u32,
        history: &RequestHistory,
    ) -> Vec<ImageBinding> {
        if !matches!(self.state, RingState::Created | RingState::Active) {
            return Vec::new();
        }
        self.state = RingState::Active;

        let reference_valid = history.is_consecutive(request_id);
        if !reference_valid {
            info!("request {}: no valid reference, skipping reference input", request_id);
        }

        let slots = ring_slots(self.ring_size, request_id, batch_size);
        let mut bindings = Vec::new();
        for ring in &self.rings {
            for (frame, slot) in slots.iter().enumerate() {
                let frame = frame as u32;
                bindings.push(ImageBinding {
                    frame,
                    port: PortSlot::RefOutput(ring.pass),
                    image: ring.buffers[slot.output],
                });
                if reference_valid {
                    bindings.push(ImageBinding {
                        frame,
                        port: PortSlot::RefInput(ring.pass),
                        image: ring.buffers[slot.input],
                    });
                }
            }
        }

        bindings
    }

    fn release_all(&mut self, mgr: &dyn BufferManager) {
        for ring in self.rings.drain(..) {
            for buf in ring.buffers {
                mgr.release(buf.handle);
            }
        }
    }

    /// Releases every ring.
    pub fn destroy(&mut self, mgr: &dyn BufferManager) {
        if self.state == RingState::Disabled || self.state == RingState::Destroyed {
            return;
        }

        self.release_all(mgr);
        self.state = RingState::Destroyed;
    }
}
