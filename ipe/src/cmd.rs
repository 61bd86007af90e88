// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! Command buffers and patch descriptors.
//!
//! The compiler writes into plain byte buffers and never knows where they will live in device
//! memory.  Every cross-buffer address is recorded as a [`Patch`] and resolved by the device
//! driver once buffers have been placed.

use super::types::{Error, ImageHandle, RequestId, Result, Size};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::HashMap;

/// Identifies a buffer that can be the source or the target of a patch.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum BufferId {
    /// The frame-process buffer: header, program arrays and frame sets.
    FrameProcess,
    /// The IQ-settings struct.
    IqSettings,
    /// Register-random-access programs of the IQ modules.
    Generic,
    /// DMI headers of the LUT programs.
    DmiHeader,
    /// Per-pass noise-processing programs.
    Nps,
    /// The stripe program produced by the striping library.
    Striping,
    /// An image buffer owned by a buffer manager.
    Image(ImageHandle),
}

/// A growable command buffer with a fixed capacity.
#[derive(Clone, Debug)]
pub struct CmdBuffer {
    id: BufferId,
    data: Vec<u8>,
    capacity: usize,
    sealed: bool,
}

impl CmdBuffer {
    /// Creates an empty command buffer.
    pub fn new(id: BufferId, capacity: usize) -> Self {
        Self {
            id,
            data: Vec::with_capacity(capacity),
            capacity,
            sealed: false,
        }
    }

    /// Returns the buffer id.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Returns the number of bytes written.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns true once the buffer has been sealed.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Returns the written bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Discards the contents and unseals the buffer.
    pub fn reset(&mut self) {
        self.data.clear();
        self.sealed = false;
    }

    /// Seals the buffer.  No further writes are accepted.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Appends `len` zero bytes and returns their offset.
    pub fn reserve(&mut self, len: usize) -> Result<usize> {
        if self.sealed {
            return Error::compile("write to a sealed command buffer");
        }
        let offset = self.data.len();
        if offset + len > self.capacity {
            return Error::exhausted("command buffer overflow");
        }
        self.data.resize(offset + len, 0);
        Ok(offset)
    }

    /// Appends dwords and returns the offset of the first one.
    pub fn write_dwords(&mut self, dwords: &[u32]) -> Result<usize> {
        let offset = self.reserve(dwords.len() * 4)?;
        LittleEndian::write_u32_into(dwords, &mut self.data[offset..]);
        Ok(offset)
    }

    /// Appends raw bytes and returns their offset.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<usize> {
        let offset = self.reserve(bytes.len())?;
        self.data[offset..].copy_from_slice(bytes);
        Ok(offset)
    }

    /// Overwrites already-reserved bytes at `offset`.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        if self.sealed {
            return Error::compile("write to a sealed command buffer");
        }
        match self.data.get_mut(offset..offset + bytes.len()) {
            Some(dst) => {
                dst.copy_from_slice(bytes);
                Ok(())
            }
            None => Error::compile("write out of bounds"),
        }
    }

    /// Overwrites a dword at `offset`.
    pub fn set_u32(&mut self, offset: usize, val: u32) -> Result<()> {
        if self.sealed {
            return Error::compile("write to a sealed command buffer");
        }
        if offset + 4 > self.data.len() {
            return Error::compile("dword write out of bounds");
        }
        LittleEndian::write_u32(&mut self.data[offset..], val);
        Ok(())
    }

    /// Reads a dword at `offset`.
    pub fn u32_at(&self, offset: usize) -> Option<u32> {
        self.data
            .get(offset..offset + 4)
            .map(LittleEndian::read_u32)
    }
}

/// A relative address fixup.
///
/// The 32-bit field at `src_offset` in `src` must receive the device address of `dst` plus
/// `dst_offset`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Patch {
    /// The buffer holding the address field.
    pub src: BufferId,
    /// Byte offset of the address field.
    pub src_offset: usize,
    /// The buffer being pointed to.
    pub dst: BufferId,
    /// Byte offset inside the target buffer.
    pub dst_offset: usize,
}

/// An ordered list of patches that validates targets as they are added.
#[derive(Clone, Debug, Default)]
pub struct PatchList {
    patches: Vec<Patch>,
}

impl PatchList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds a patch.  `dst_size` is the current size of the target buffer.
    pub fn add(
        &mut self,
        src: BufferId,
        src_offset: usize,
        dst: BufferId,
        dst_offset: usize,
        dst_size: Size,
    ) -> Result<()> {
        if dst_size == 0 {
            return Error::compile("patch target has no backing buffer");
        }
        if dst_offset as Size >= dst_size {
            return Error::compile("patch target out of bounds");
        }

        self.patches.push(Patch {
            src,
            src_offset,
            dst,
            dst_offset,
        });

        Ok(())
    }

    /// Returns the patches.
    pub fn as_slice(&self) -> &[Patch] {
        &self.patches
    }

    /// Returns the number of patches.
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    /// Returns true if there is no patch.
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Drops all patches.
    pub fn clear(&mut self) {
        self.patches.clear();
    }

    /// Takes the patches out of the list.
    pub fn take(&mut self) -> Vec<Patch> {
        std::mem::take(&mut self.patches)
    }
}

/// The placement of a buffer in device memory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Region {
    /// Device address of the first byte.
    pub address: u64,
    /// Size in bytes.
    pub size: Size,
}

/// A patch resolved against a placement map.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResolvedPatch {
    /// The buffer holding the address field.
    pub src: BufferId,
    /// Byte offset of the address field.
    pub src_offset: usize,
    /// The device address to write.
    pub address: u64,
}

/// Resolves patches against the placement of every buffer.
///
/// Fails if a buffer was not placed or if a resolved address would fall outside its target.
pub fn resolve_patches(
    patches: &[Patch],
    regions: &HashMap<BufferId, Region>,
) -> Result<Vec<ResolvedPatch>> {
    patches
        .iter()
        .map(|patch| {
            let src = regions
                .get(&patch.src)
                .ok_or(Error::Compile("patch source was not placed"))?;
            if patch.src_offset as Size + 4 > src.size {
                return Error::compile("patch source field out of bounds");
            }

            let dst = regions
                .get(&patch.dst)
                .ok_or(Error::Compile("patch target was not placed"))?;
            if patch.dst_offset as Size >= dst.size {
                return Error::compile("patch target out of bounds");
            }

            Ok(ResolvedPatch {
                src: patch.src,
                src_offset: patch.src_offset,
                address: dst.address + patch.dst_offset as u64,
            })
        })
        .collect()
}

/// Capacities of the per-request command buffers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PoolSizes {
    /// Frame-process buffer capacity.
    pub frame_process: usize,
    /// IQ-settings buffer capacity.
    pub iq_settings: usize,
    /// Generic program buffer capacity.
    pub generic: usize,
    /// DMI header buffer capacity.
    pub dmi_header: usize,
    /// Noise-processing program buffer capacity.
    pub nps: usize,
    /// Stripe program buffer capacity.
    pub striping: usize,
}

/// The set of command buffers owned by one in-flight request.
#[derive(Clone, Debug)]
pub struct FrameBuffers {
    /// The frame-process buffer.
    pub frame_process: CmdBuffer,
    /// The IQ-settings buffer.
    pub iq_settings: CmdBuffer,
    /// Register programs.
    pub generic: CmdBuffer,
    /// DMI headers.
    pub dmi_header: CmdBuffer,
    /// Per-pass noise-processing programs.
    pub nps: CmdBuffer,
    /// The stripe program.
    pub striping: CmdBuffer,
}

impl FrameBuffers {
    fn new(sizes: &PoolSizes) -> Self {
        Self {
            frame_process: CmdBuffer::new(BufferId::FrameProcess, sizes.frame_process),
            iq_settings: CmdBuffer::new(BufferId::IqSettings, sizes.iq_settings),
            generic: CmdBuffer::new(BufferId::Generic, sizes.generic),
            dmi_header: CmdBuffer::new(BufferId::DmiHeader, sizes.dmi_header),
            nps: CmdBuffer::new(BufferId::Nps, sizes.nps),
            striping: CmdBuffer::new(BufferId::Striping, sizes.striping),
        }
    }

    /// Discards everything written for the current request.
    pub fn reset(&mut self) {
        for buf in self.iter_mut() {
            buf.reset();
        }
    }

    /// Returns the buffer with `id`, if it is a command buffer.
    pub fn get(&self, id: BufferId) -> Option<&CmdBuffer> {
        self.iter().find(|buf| buf.id() == id)
    }

    /// Iterates over the command buffers in commit order.
    pub fn iter(&self) -> impl Iterator<Item = &CmdBuffer> {
        [
            &self.frame_process,
            &self.iq_settings,
            &self.generic,
            &self.dmi_header,
            &self.nps,
            &self.striping,
        ]
        .into_iter()
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut CmdBuffer> {
        [
            &mut self.frame_process,
            &mut self.iq_settings,
            &mut self.generic,
            &mut self.dmi_header,
            &mut self.nps,
            &mut self.striping,
        ]
        .into_iter()
    }
}

struct PoolSlot {
    owner: Option<RequestId>,
    buffers: FrameBuffers,
}

/// A pool of per-request command buffers sized to the in-flight depth.
///
/// A request owns slot `request_id % depth` from checkout until it is recycled.
pub struct FramePool {
    slots: Vec<PoolSlot>,
}

impl FramePool {
    /// Creates a pool of `depth` buffer sets.
    pub fn new(depth: usize, sizes: &PoolSizes) -> Result<Self> {
        if depth == 0 {
            return Error::exhausted("empty command buffer pool");
        }

        let slots = (0..depth)
            .map(|_| PoolSlot {
                owner: None,
                buffers: FrameBuffers::new(sizes),
            })
            .collect();

        Ok(Self { slots })
    }

    /// Returns the in-flight depth.
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    fn slot_index(&self, request_id: RequestId) -> usize {
        (request_id % self.slots.len() as RequestId) as usize
    }

    /// Checks out the buffers of a request.
    ///
    /// Checking out the same request twice returns the same, reset buffers.
    pub fn checkout(&mut self, request_id: RequestId) -> Result<&mut FrameBuffers> {
        let idx = self.slot_index(request_id);
        let slot = &mut self.slots[idx];

        match slot.owner {
            Some(owner) if owner != request_id => {
                return Error::exhausted("command buffer slot still in flight");
            }
            _ => (),
        }

        slot.owner = Some(request_id);
        slot.buffers.reset();

        Ok(&mut slot.buffers)
    }

    /// Returns the buffers of a checked-out request.
    pub fn get(&self, request_id: RequestId) -> Option<&FrameBuffers> {
        let slot = &self.slots[self.slot_index(request_id)];
        (slot.owner == Some(request_id)).then_some(&slot.buffers)
    }

    /// Returns a request's buffers to the pool.  Returns false if it was not checked out.
    pub fn recycle(&mut self, request_id: RequestId) -> bool {
        let idx = self.slot_index(request_id);
        let slot = &mut self.slots[idx];

        if slot.owner != Some(request_id) {
            return false;
        }

        slot.owner = None;
        slot.buffers.reset();

        true
    }

    /// Returns the requests currently checked out, in increasing order.
    pub fn in_flight(&self) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self.slots.iter().filter_map(|s| s.owner).collect();
        ids.sort();
        ids
    }
}
