// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! In-process collaborators.
//!
//! These back the demo and the tests.  The driver places buffers at synthetic addresses and
//! resolves patches exactly the way a real driver would, so a bad patch still fails submission.

use super::{
    BufferManager, Description, DeviceDescriptor, DeviceDriver, DeviceHandle, Fence, Packet,
    PropertyKey, PropertyStore, PropertyValue, StripeProgram, StripeWindow, StripingConfig,
    StripingHandle, StripingLibrary,
};
use crate::cmd::{self, BufferId, Region, ResolvedPatch};
use crate::types::{Error, ImageBuffer, ImageHandle, RequestId, Result, Size};
use byteorder::{LittleEndian, WriteBytesExt};
use log::{debug, trace};
use std::collections::HashMap;
use std::sync::Mutex;

/// A property store backed by a map.
#[derive(Default)]
pub struct MemoryPropertyStore {
    values: Mutex<HashMap<(PropertyKey, RequestId), PropertyValue>>,
}

impl MemoryPropertyStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Default::default()
    }
}

impl PropertyStore for MemoryPropertyStore {
    fn get(&self, key: PropertyKey, request_id: RequestId, offset: u64) -> Option<PropertyValue> {
        let target = request_id.checked_sub(offset)?;
        self.values.lock().unwrap().get(&(key, target)).cloned()
    }

    fn publish(&self, key: PropertyKey, request_id: RequestId, value: PropertyValue) -> Result<()> {
        self.values.lock().unwrap().insert((key, request_id), value);
        Ok(())
    }
}

#[derive(Default)]
struct BufferState {
    next_handle: u64,
    refs: HashMap<ImageHandle, (u32, Size)>,
    limit: Option<usize>,
    allocations: usize,
}

/// A reference-counting buffer manager that hands out synthetic handles.
#[derive(Default)]
pub struct MemoryBufferManager {
    state: Mutex<BufferState>,
}

impl MemoryBufferManager {
    /// Creates a manager without an allocation limit.
    pub fn new() -> Self {
        Default::default()
    }

    /// Fails allocations once `limit` buffers are alive.
    pub fn limit(self, limit: usize) -> Self {
        self.state.lock().unwrap().limit = Some(limit);
        self
    }

    /// Returns the number of live buffers.
    pub fn live(&self) -> usize {
        self.state.lock().unwrap().refs.len()
    }

    /// Returns the number of buffers ever allocated.
    pub fn allocations(&self) -> usize {
        self.state.lock().unwrap().allocations
    }

    /// Returns the reference count of a buffer.
    pub fn refs(&self, handle: ImageHandle) -> u32 {
        self.state
            .lock()
            .unwrap()
            .refs
            .get(&handle)
            .map_or(0, |(refs, _)| *refs)
    }
}

impl BufferManager for MemoryBufferManager {
    fn allocate(&self, desc: &Description, count: usize) -> Result<Vec<ImageBuffer>> {
        let size = desc.size()?;
        let mut state = self.state.lock().unwrap();

        if let Some(limit) = state.limit {
            if state.refs.len() + count > limit {
                return Error::exhausted("buffer manager limit reached");
            }
        }

        let bufs = (0..count)
            .map(|_| {
                state.next_handle += 1;
                let handle = ImageHandle(state.next_handle);
                state.refs.insert(handle, (1, size));
                ImageBuffer { handle, size }
            })
            .collect();
        state.allocations += count;

        Ok(bufs)
    }

    fn acquire(&self, handle: ImageHandle) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match state.refs.get_mut(&handle) {
            Some((refs, _)) => {
                *refs += 1;
                Ok(())
            }
            None => Error::user(),
        }
    }

    fn release(&self, handle: ImageHandle) {
        let mut state = self.state.lock().unwrap();
        let Some((refs, _)) = state.refs.get_mut(&handle) else {
            return;
        };

        *refs -= 1;
        if *refs == 0 {
            state.refs.remove(&handle);
            trace!("freed buffer {:?}", handle);
        }
    }
}

/// A packet accepted by [`RecordingDriver`].
#[derive(Clone, Debug)]
pub struct Submission {
    /// The request id.
    pub request_id: RequestId,
    /// The fence handed back.
    pub fence: Fence,
    /// The resolved patches.
    pub patches: Vec<ResolvedPatch>,
    /// Where every buffer was placed.
    pub regions: HashMap<BufferId, Region>,
    /// A copy of the frame-process buffer.
    pub frame_process: Vec<u8>,
    /// A copy of the register programs.
    pub generic: Vec<u8>,
    /// A copy of the generic blob.
    pub blob: Vec<u8>,
}

#[derive(Default)]
struct DriverState {
    next_handle: u64,
    acquired: Option<DeviceHandle>,
    descriptor: Option<DeviceDescriptor>,
    next_fence: u64,
    reject: Option<i32>,
    submissions: Vec<Submission>,
}

const CMD_BASE: u64 = 0x1000_0000;
const IMAGE_BASE: u64 = 0x8000_0000;
const REGION_ALIGN: u64 = 0x1_0000;

/// A device driver that records every accepted packet.
#[derive(Default)]
pub struct RecordingDriver {
    state: Mutex<DriverState>,
}

impl RecordingDriver {
    /// Creates a driver.
    pub fn new() -> Self {
        Default::default()
    }

    /// Makes the next submission fail with `code`.
    pub fn reject_next(&self, code: i32) {
        self.state.lock().unwrap().reject = Some(code);
    }

    /// Returns the accepted packets.
    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().unwrap().submissions.clone()
    }

    /// Returns the descriptor of the acquired device.
    pub fn descriptor(&self) -> Option<DeviceDescriptor> {
        self.state.lock().unwrap().descriptor.clone()
    }

    /// Returns true while a device is acquired.
    pub fn is_acquired(&self) -> bool {
        self.state.lock().unwrap().acquired.is_some()
    }

    fn place(packet: &Packet) -> HashMap<BufferId, Region> {
        let mut regions = HashMap::new();

        let mut address = CMD_BASE;
        for buf in packet.buffers.iter().filter(|buf| !buf.is_empty()) {
            let size = buf.len() as Size;
            regions.insert(buf.id(), Region { address, size });
            address = (address + size).next_multiple_of(REGION_ALIGN);
        }

        let mut address = IMAGE_BASE;
        for image in packet.images {
            regions.insert(
                BufferId::Image(image.handle),
                Region {
                    address,
                    size: image.size,
                },
            );
            address = (address + image.size).next_multiple_of(REGION_ALIGN);
        }

        regions
    }
}

impl DeviceDriver for RecordingDriver {
    fn acquire(&self, desc: &DeviceDescriptor) -> Result<DeviceHandle> {
        let mut state = self.state.lock().unwrap();
        if state.acquired.is_some() {
            return Err(Error::NoSupport);
        }

        state.next_handle += 1;
        let handle = DeviceHandle(state.next_handle);
        state.acquired = Some(handle);
        state.descriptor = Some(desc.clone());

        Ok(handle)
    }

    fn submit(&self, handle: DeviceHandle, packet: &Packet) -> Result<Fence> {
        let mut state = self.state.lock().unwrap();
        if state.acquired != Some(handle) {
            return Error::user();
        }
        if let Some(code) = state.reject.take() {
            return Err(Error::Submit(code));
        }

        let regions = Self::place(packet);
        let patches = cmd::resolve_patches(packet.patches, &regions)?;

        state.next_fence += 1;
        let fence = Fence(state.next_fence);
        state.submissions.push(Submission {
            request_id: packet.request_id,
            fence,
            patches,
            regions,
            frame_process: packet.buffers.frame_process.as_bytes().to_vec(),
            generic: packet.buffers.generic.as_bytes().to_vec(),
            blob: packet.blob.to_vec(),
        });
        debug!("request {} queued on {:?}", packet.request_id, fence);

        Ok(fence)
    }

    fn release(&self, handle: DeviceHandle) {
        let mut state = self.state.lock().unwrap();
        if state.acquired == Some(handle) {
            state.acquired = None;
        }
    }
}

/// Columns each stripe reads past its boundary.
pub const STRIPE_OVERLAP: u32 = 64;

/// A striping library that cuts the crop into equal vertical stripes, one per core.
#[derive(Default)]
pub struct LinearStriping {
    contexts: Mutex<HashMap<StripingHandle, StripingConfig>>,
    next_handle: Mutex<u64>,
}

impl LinearStriping {
    /// Creates the library.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the number of live contexts.
    pub fn live(&self) -> usize {
        self.contexts.lock().unwrap().len()
    }

    /// Returns the number of contexts created so far.
    pub fn created(&self) -> u64 {
        *self.next_handle.lock().unwrap()
    }

    /// Returns the configurations of the live contexts.
    pub fn configs(&self) -> Vec<StripingConfig> {
        self.contexts.lock().unwrap().values().copied().collect()
    }
}

impl StripingLibrary for LinearStriping {
    fn create_context(&self, config: &StripingConfig) -> Result<StripingHandle> {
        if config.input.is_empty() || config.num_cores == 0 {
            return Error::user();
        }

        let mut next = self.next_handle.lock().unwrap();
        *next += 1;
        let handle = StripingHandle(*next);
        self.contexts.lock().unwrap().insert(handle, *config);

        Ok(handle)
    }

    fn execute(&self, handle: StripingHandle, window: &StripeWindow) -> Result<StripeProgram> {
        let contexts = self.contexts.lock().unwrap();
        let Some(config) = contexts.get(&handle) else {
            return Error::user();
        };
        if !window.crop.within(config.input) {
            return Error::compile("stripe window outside the input");
        }

        let stripes = config.num_cores;
        let stripe_width = window.crop.width.div_ceil(stripes);
        let mut bytes = Vec::new();
        let mut pixel_count = 0;
        bytes.write_u32::<LittleEndian>(stripes)?;
        for idx in 0..stripes {
            let left = window.crop.left + idx * stripe_width;
            let right = (left + stripe_width).min(window.crop.left + window.crop.width);
            let read_left = left.saturating_sub(if idx > 0 { STRIPE_OVERLAP } else { 0 });
            let read_right = if idx + 1 < stripes {
                (right + STRIPE_OVERLAP).min(config.input.width)
            } else {
                right
            };

            bytes.write_u32::<LittleEndian>(read_left)?;
            bytes.write_u32::<LittleEndian>(read_right - read_left)?;
            bytes.write_u32::<LittleEndian>(window.crop.top)?;
            bytes.write_u32::<LittleEndian>(window.crop.height)?;
            pixel_count += (read_right - read_left) as u64 * window.crop.height as u64;
        }
        bytes.write_u32::<LittleEndian>(window.output.width)?;
        bytes.write_u32::<LittleEndian>(window.output.height)?;

        Ok(StripeProgram { bytes, pixel_count })
    }

    fn destroy_context(&self, handle: StripingHandle) {
        self.contexts.lock().unwrap().remove(&handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::Extent;
    use crate::formats::Format;
    use crate::types::{Dimension, Rect};

    #[test]
    fn property_offsets() {
        let store = MemoryPropertyStore::new();
        store
            .publish(PropertyKey::AecGain, 4, PropertyValue::Gain(2.0))
            .unwrap();

        assert_eq!(
            store.get(PropertyKey::AecGain, 5, 1),
            Some(PropertyValue::Gain(2.0))
        );
        assert_eq!(store.get(PropertyKey::AecGain, 5, 0), None);
        assert_eq!(store.get(PropertyKey::AecGain, 0, 1), None);
        assert_eq!(store.get(PropertyKey::GammaCurve, 4, 0), None);
    }

    #[test]
    fn buffer_refcount() {
        let mgr = MemoryBufferManager::new().limit(3);
        let desc = Description::new()
            .format(Format::Nv12)
            .extent(Extent::image(Dimension::new(64, 32)));

        let bufs = mgr.allocate(&desc, 2).unwrap();
        assert_eq!(bufs[0].size, 3072);
        assert_eq!(mgr.live(), 2);
        assert!(mgr.allocate(&desc, 2).is_err());

        mgr.acquire(bufs[0].handle).unwrap();
        mgr.release(bufs[0].handle);
        assert_eq!(mgr.refs(bufs[0].handle), 1);
        mgr.release(bufs[0].handle);
        assert_eq!(mgr.live(), 1);
        assert!(mgr.acquire(bufs[0].handle).is_err());
        assert_eq!(mgr.allocations(), 2);
    }

    #[test]
    fn striping() {
        let lib = LinearStriping::new();
        let config = StripingConfig {
            input: Dimension::new(1920, 1080),
            output: Dimension::new(1920, 1080),
            format: Format::Nv12,
            num_passes: 1,
            num_cores: 2,
        };
        let handle = lib.create_context(&config).unwrap();
        let window = StripeWindow {
            crop: Rect::full(config.input),
            output: config.output,
        };

        let program = lib.execute(handle, &window).unwrap();
        assert_eq!(program.pixel_count, (1920 + 2 * 64) * 1080);
        assert_eq!(program.bytes.len(), 4 + 2 * 16 + 8);

        let outside = StripeWindow {
            crop: Rect::new(1, 0, 1920, 1080),
            ..window
        };
        assert!(lib.execute(handle, &outside).is_err());

        lib.destroy_context(handle);
        assert_eq!(lib.live(), 0);
        assert!(lib.execute(handle, &window).is_err());
    }
}
