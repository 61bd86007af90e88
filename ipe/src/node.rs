// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! The IPE node.
//!
//! A node owns everything one IPE instance needs across requests: the negotiated sizes, the
//! device context, the scratch buffer, the striping context, the reference rings, the command
//! buffer pool and the request history.  Requests go through [`IpeNode::execute_process_request`]
//! and come back through [`IpeNode::handle_event`] when their fences signal.

use super::backends::{
    BufferManager, Description, DeviceDescriptor, DeviceDriver, DeviceHandle, Extent, Fence,
    Packet, PropertyKey, PropertyStore, PropertyValue, StripeWindow, StripingConfig,
    StripingHandle, StripingLibrary,
};
use super::bandwidth::{self, BandwidthInput, Plane};
use super::blob::{BlobRecord, ConfigIo, GenericBlob};
use super::caps::{Capability, ChipVersion};
use super::cdm::PortSlot;
use super::cmd::{FramePool, PoolSizes};
use super::compiler::{CompileRequest, Compiler, ImageBinding};
use super::debug::{DebugDataService, DebugDataWriter, DebugDump, DebugRecord};
use super::formats::Format;
use super::instance::InstanceProperty;
use super::iq::{self, ModuleKind, ModuleMask, TuningInput};
use super::loopback::LoopbackManager;
use super::negotiate::{self, Negotiated, OutputPort, PortRequirement};
use super::tuning::Tuning;
use super::types::{Dimension, Error, ImageBuffer, RequestId, Result, Size};
use super::zoom::{self, ParentStage, RequestHistory, ZoomContext};
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Default command buffer capacities.
pub const DEFAULT_POOL_SIZES: PoolSizes = PoolSizes {
    frame_process: 16 * 1024,
    iq_settings: 4 * 1024,
    generic: 64 * 1024,
    dmi_header: 4 * 1024,
    nps: 16 * 1024,
    striping: 16 * 1024,
};

const DEFAULT_SCRATCH_SIZE: Size = 256 * 1024;
const DEFAULT_DEPTH: usize = 8;
const DEFAULT_FPS: u32 = 30;

/// A property a request waits for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Dependency {
    /// The property.
    pub key: PropertyKey,
    /// How many requests back the value must come from.
    pub offset: u64,
}

/// The result of executing a request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// The request was compiled and queued.
    Submitted(Fence),
    /// Some properties are not published yet.  Execute the request again once they are.
    NotReady(Vec<Dependency>),
}

/// A capture request.
#[derive(Clone, Debug, Default)]
pub struct ProcessRequest {
    /// The request id.
    pub request_id: RequestId,
    /// Number of frames in the batch.
    pub batch_size: u32,
    /// The input and output images.
    pub images: Vec<ImageBinding>,
    /// Modules disabled for this request.
    pub disabled: ModuleMask,
}

impl ProcessRequest {
    /// Creates a single-frame request.
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            batch_size: 1,
            ..Default::default()
        }
    }

    /// Sets the batch size.
    pub fn batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Binds an image to a port of a frame.
    pub fn image(mut self, frame: u32, port: PortSlot, image: ImageBuffer) -> Self {
        self.images.push(ImageBinding { frame, port, image });
        self
    }

    /// Disables modules for this request.
    pub fn disable(mut self, modules: ModuleMask) -> Self {
        self.disabled |= modules;
        self
    }
}

/// A completion event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    /// A fence signaled success.
    FenceSignaled(Fence),
    /// A fence signaled a processing error.
    FenceFailed(Fence),
    /// A flush started.
    Flush,
    /// The flush finished.
    FlushDone,
}

/// What to do in response to an event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Action {
    /// Return the request's buffers to the pool.
    Recycle(RequestId),
    /// Report the request as failed upstream.
    ReportFailed(RequestId),
    /// Dump the request's buffers.
    Dump(RequestId),
}

/// The completion state of a node.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompletionState {
    /// Requests holding pool buffers, with their fence if they were queued.
    pub in_flight: BTreeMap<RequestId, Option<Fence>>,
    /// Whether a flush is in progress.
    pub flushing: bool,
    /// Whether failed requests are dumped.
    pub dump_on_error: bool,
}

impl CompletionState {
    fn take_fence(&mut self, fence: Fence) -> Option<RequestId> {
        let rid = self
            .in_flight
            .iter()
            .find(|(_, f)| **f == Some(fence))
            .map(|(rid, _)| *rid)?;
        self.in_flight.remove(&rid);
        Some(rid)
    }
}

/// Applies a completion event.
///
/// Every request is recycled exactly once, either when its fence signals or when a flush
/// starts.  Fence errors during a flush are expected and only recycle the request.
pub fn on_event(mut state: CompletionState, event: Event) -> (CompletionState, Vec<Action>) {
    let mut actions = Vec::new();

    match event {
        Event::FenceSignaled(fence) => match state.take_fence(fence) {
            Some(rid) => actions.push(Action::Recycle(rid)),
            None => warn!("unknown fence {:?} signaled", fence),
        },
        Event::FenceFailed(fence) => match state.take_fence(fence) {
            Some(rid) if state.flushing => {
                info!("request {} failed during flush", rid);
                actions.push(Action::Recycle(rid));
            }
            Some(rid) => {
                error!("{}", Error::Hardware(rid));
                if state.dump_on_error {
                    actions.push(Action::Dump(rid));
                }
                actions.push(Action::ReportFailed(rid));
                actions.push(Action::Recycle(rid));
            }
            None => warn!("unknown fence {:?} failed", fence),
        },
        Event::Flush => {
            state.flushing = true;
            actions.extend(state.in_flight.keys().map(|rid| Action::Recycle(*rid)));
            state.in_flight.clear();
        }
        Event::FlushDone => state.flushing = false,
    }

    (state, actions)
}

/// The lifecycle of a node.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum NodeState {
    /// Built, nothing negotiated.
    #[default]
    Created,
    /// Buffer sizes are negotiated.
    Negotiated,
    /// Hardware resources are acquired.
    Acquired,
    /// Hardware resources are released.
    Released,
}

/// A builder for [`IpeNode`].
#[derive(Default)]
pub struct Builder {
    props: InstanceProperty,
    chip: Option<ChipVersion>,
    depth: Option<usize>,
    fps: Option<u32>,
    tuning: Tuning,
    parent: Option<ParentStage>,
    input_format: Option<Format>,
    sensor_aspect_ratio: Option<f64>,
    ports: Vec<PortRequirement>,
    pool_sizes: Option<PoolSizes>,
    scratch_size: Option<Size>,
    driver: Option<Arc<dyn DeviceDriver>>,
    store: Option<Arc<dyn PropertyStore>>,
    buffers: Option<Arc<dyn BufferManager>>,
    striping: Option<Arc<dyn StripingLibrary>>,
    debug: Option<Arc<DebugDataService>>,
}

impl Builder {
    /// Creates a node builder.
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the instance properties.
    pub fn props(mut self, props: InstanceProperty) -> Self {
        self.props = props;
        self
    }

    /// Sets the detected chip version.
    pub fn chip(mut self, chip: ChipVersion) -> Self {
        self.chip = Some(chip);
        self
    }

    /// Sets the in-flight depth of the pipeline.
    pub fn depth(mut self, depth: usize) -> Self {
        self.depth = Some(depth);
        self
    }

    /// Sets the nominal frame rate.
    pub fn fps(mut self, fps: u32) -> Self {
        self.fps = Some(fps);
        self
    }

    /// Overrides the calibration constants.
    pub fn tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Sets the producer of the input frames.
    pub fn parent(mut self, parent: ParentStage) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Sets the input format.
    pub fn input_format(mut self, format: Format) -> Self {
        self.input_format = Some(format);
        self
    }

    /// Sets the sensor aspect ratio.
    pub fn sensor_aspect_ratio(mut self, ratio: f64) -> Self {
        self.sensor_aspect_ratio = Some(ratio);
        self
    }

    /// Adds an output port.
    pub fn port(mut self, port: PortRequirement) -> Self {
        self.ports.push(port);
        self
    }

    /// Overrides the command buffer capacities.
    pub fn pool_sizes(mut self, sizes: PoolSizes) -> Self {
        self.pool_sizes = Some(sizes);
        self
    }

    /// Overrides the scratch buffer size.
    pub fn scratch_size(mut self, size: Size) -> Self {
        self.scratch_size = Some(size);
        self
    }

    /// Sets the device driver.
    pub fn driver(mut self, driver: Arc<dyn DeviceDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Sets the property store.
    pub fn store(mut self, store: Arc<dyn PropertyStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the buffer manager.
    pub fn buffers(mut self, buffers: Arc<dyn BufferManager>) -> Self {
        self.buffers = Some(buffers);
        self
    }

    /// Sets the striping library.  Frames are not striped without one.
    pub fn striping(mut self, striping: Arc<dyn StripingLibrary>) -> Self {
        self.striping = Some(striping);
        self
    }

    /// Sets the debug-data service.
    pub fn debug(mut self, service: Arc<DebugDataService>) -> Self {
        self.debug = Some(service);
        self
    }

    /// Builds an `IpeNode`.
    pub fn build(self) -> Result<IpeNode> {
        let (Some(driver), Some(store), Some(buffers)) = (self.driver, self.store, self.buffers)
        else {
            return Error::user();
        };
        if self.ports.is_empty() || self.depth == Some(0) {
            return Error::user();
        }

        let chip = self.chip.unwrap_or(ChipVersion::Titan480);
        let completion = CompletionState {
            dump_on_error: self.debug.is_some(),
            ..Default::default()
        };

        Ok(IpeNode {
            props: self.props,
            chip,
            caps: Capability::for_chip(chip),
            depth: self.depth.unwrap_or(DEFAULT_DEPTH),
            fps: self.fps.unwrap_or(DEFAULT_FPS),
            tuning: self.tuning,
            parent: self.parent.unwrap_or(ParentStage::Ife),
            input_format: self.input_format.unwrap_or(Format::UbwcTp10),
            sensor_aspect_ratio: self.sensor_aspect_ratio,
            ports: self.ports,
            pool_sizes: self.pool_sizes.unwrap_or(DEFAULT_POOL_SIZES),
            scratch_size: self.scratch_size.unwrap_or(DEFAULT_SCRATCH_SIZE),
            driver,
            store,
            buffers,
            striping: self.striping,
            debug: self.debug,
            state: NodeState::Created,
            negotiated: None,
            device: None,
            scratch: None,
            striping_ctx: None,
            config_io: ConfigIo::default(),
            loopback: LoopbackManager::new(),
            pool: None,
            compiler: None,
            writer: None,
            history: RequestHistory::default(),
            completion,
        })
    }
}

/// An IPE node instance.
pub struct IpeNode {
    props: InstanceProperty,
    chip: ChipVersion,
    caps: &'static Capability,
    depth: usize,
    fps: u32,
    tuning: Tuning,
    parent: ParentStage,
    input_format: Format,
    sensor_aspect_ratio: Option<f64>,
    ports: Vec<PortRequirement>,
    pool_sizes: PoolSizes,
    scratch_size: Size,

    driver: Arc<dyn DeviceDriver>,
    store: Arc<dyn PropertyStore>,
    buffers: Arc<dyn BufferManager>,
    striping: Option<Arc<dyn StripingLibrary>>,
    debug: Option<Arc<DebugDataService>>,

    state: NodeState,
    negotiated: Option<Negotiated>,
    device: Option<DeviceHandle>,
    scratch: Option<ImageBuffer>,
    striping_ctx: Option<StripingHandle>,
    config_io: ConfigIo,
    loopback: LoopbackManager,
    pool: Option<FramePool>,
    compiler: Option<Compiler>,
    writer: Option<Arc<DebugDataWriter>>,
    history: RequestHistory,
    completion: CompletionState,
}

fn output_slot(port: OutputPort) -> PortSlot {
    match port {
        OutputPort::Display => PortSlot::Display,
        OutputPort::Video => PortSlot::Video,
    }
}

impl IpeNode {
    /// Returns the lifecycle state.
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Returns the negotiation result.
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    /// Returns the history the next request starts from.
    pub fn history(&self) -> &RequestHistory {
        &self.history
    }

    /// Returns the reference rings.
    pub fn loopback(&self) -> &LoopbackManager {
        &self.loopback
    }

    /// Returns the completion state.
    pub fn completion(&self) -> &CompletionState {
        &self.completion
    }

    /// Returns the requests holding pool buffers, in increasing order.
    pub fn in_flight(&self) -> Vec<RequestId> {
        self.pool.as_ref().map_or_else(Vec::new, |pool| pool.in_flight())
    }

    /// Returns the scratch buffer.
    pub fn scratch(&self) -> Option<ImageBuffer> {
        self.scratch
    }

    /// Negotiates the input size from the output ports.
    pub fn negotiate(&mut self) -> Result<&Negotiated> {
        if self.state != NodeState::Created && self.state != NodeState::Negotiated {
            return Error::user();
        }

        let negotiated = negotiate::negotiate(
            &self.ports,
            self.sensor_aspect_ratio,
            &self.props,
            self.caps,
            &self.tuning,
        )?;
        self.state = NodeState::Negotiated;

        Ok(self.negotiated.insert(negotiated))
    }

    fn input_dim(&self) -> Dimension {
        self.negotiated
            .as_ref()
            .map_or(Dimension::default(), |n| n.input.optimal)
    }

    fn largest_output(&self) -> Dimension {
        self.negotiated
            .as_ref()
            .and_then(|n| n.outputs.iter().map(|(_, dim)| *dim).max_by_key(|dim| dim.area()))
            .unwrap_or_default()
    }

    fn port_format(&self, port: OutputPort) -> Option<Format> {
        self.ports.iter().find(|p| p.port == port).map(|p| p.format)
    }

    fn build_config_io(&self) -> ConfigIo {
        let mut cfg = ConfigIo::new(self.props.num_passes).port(
            PortSlot::Input,
            self.input_format,
            self.input_dim(),
        );

        if let Some(negotiated) = &self.negotiated {
            for (port, dim) in &negotiated.outputs {
                if let Some(format) = self.port_format(*port) {
                    cfg = cfg.port(output_slot(*port), format, *dim);
                }
            }
        }
        for ring in self.loopback.rings() {
            cfg = cfg
                .port(PortSlot::RefOutput(ring.pass), ring.format, ring.dim)
                .port(PortSlot::RefInput(ring.pass), ring.format, ring.dim);
        }

        cfg
    }

    fn num_cores(&self) -> u32 {
        self.caps.num_cores.min(self.tuning.max_cores).max(1)
    }

    fn striping_config(&self, output: Dimension) -> StripingConfig {
        StripingConfig {
            input: self.input_dim(),
            output,
            format: self.input_format,
            num_passes: self.props.num_passes,
            num_cores: self.num_cores(),
        }
    }

    // MFSR intermediate size changed: new Config-IO and a striping context for the new size
    fn reconfigure(
        &mut self,
        rid: RequestId,
        intermediate: Dimension,
        blob: &mut GenericBlob,
    ) -> Result<()> {
        let slot = [PortSlot::Display, PortSlot::Video]
            .into_iter()
            .find(|slot| self.config_io.update(*slot, intermediate));
        info!("request {}: reconfiguring {:?} to {}", rid, slot, intermediate);
        blob.push(&BlobRecord::ConfigIoUpdate(self.config_io.encode()?))?;

        if let Some(striping) = &self.striping {
            if let Some(handle) = self.striping_ctx.take() {
                striping.destroy_context(handle);
            }
            let config = self.striping_config(intermediate);
            self.striping_ctx = Some(striping.create_context(&config)?);
        }

        Ok(())
    }

    /// Acquires the hardware resources of the node.
    ///
    /// Negotiates first if that has not happened.  On failure, everything acquired so far is
    /// released again.
    pub fn acquire(&mut self) -> Result<()> {
        match self.state {
            NodeState::Created => {
                self.negotiate()?;
            }
            NodeState::Negotiated => (),
            _ => return Error::user(),
        }

        if let Err(err) = self.acquire_resources() {
            error!("failed to acquire resources: {}", err);
            self.teardown();
            return Err(err);
        }
        self.state = NodeState::Acquired;

        Ok(())
    }

    fn acquire_resources(&mut self) -> Result<()> {
        let desc = Description::new().extent(Extent::Buffer(self.scratch_size));
        let scratch = self.buffers.allocate(&desc, 1)?;
        self.scratch = scratch.first().copied();

        if self.props.uses_loopback() {
            let ring_size = if self.debug.is_some() {
                self.tuning.reference_ring_size_debug
            } else {
                self.tuning.reference_ring_size
            };
            self.loopback.create(
                self.input_dim(),
                self.props.num_passes,
                ring_size,
                self.caps,
                self.buffers.as_ref(),
            )?;
        }

        self.config_io = self.build_config_io();
        let desc = DeviceDescriptor {
            input: self.input_dim(),
            config_io: self.config_io.encode()?,
        };
        self.device = Some(self.driver.acquire(&desc)?);

        if let Some(striping) = &self.striping {
            let config = self.striping_config(self.largest_output());
            self.striping_ctx = Some(striping.create_context(&config)?);
        }

        self.pool = Some(FramePool::new(self.depth, &self.pool_sizes)?);
        self.compiler = Some(Compiler::new(
            iq::instantiate(&self.props, self.chip),
            self.num_cores(),
        ));
        self.writer = self.debug.as_ref().map(|svc| svc.acquire());

        debug!(
            "acquired node: input {}, {} reference rings, depth {}",
            self.input_dim(),
            self.loopback.rings().len(),
            self.depth
        );

        Ok(())
    }

    fn teardown(&mut self) {
        if self.writer.take().is_some() {
            if let Some(svc) = &self.debug {
                svc.release();
            }
        }
        self.compiler = None;
        self.pool = None;
        if let (Some(striping), Some(handle)) = (&self.striping, self.striping_ctx.take()) {
            striping.destroy_context(handle);
        }
        if let Some(handle) = self.device.take() {
            self.driver.release(handle);
        }
        self.loopback.destroy(self.buffers.as_ref());
        self.loopback = LoopbackManager::new();
        if let Some(scratch) = self.scratch.take() {
            self.buffers.release(scratch.handle);
        }
    }

    fn is_first_request(&self) -> bool {
        self.history.last_request.is_none()
    }

    /// Returns the properties a request waits for that are not published yet.
    pub fn missing_dependencies(&self, req: &ProcessRequest) -> Vec<Dependency> {
        let Some(compiler) = &self.compiler else {
            return Vec::new();
        };
        let enabled = compiler.module_mask() - req.disabled;
        let first = self.is_first_request();

        let mut deps = Vec::new();
        if !first && enabled.intersects(ModuleKind::Ltm.mask() | ModuleKind::Gtm.mask()) {
            deps.push(Dependency {
                key: PropertyKey::AecGain,
                offset: 1,
            });
        }
        if enabled.contains(ModuleKind::Ica1.mask()) && self.props.stabilization.is_eis() {
            deps.push(Dependency {
                key: PropertyKey::IcaWarp,
                offset: 0,
            });
        }
        if !first && enabled.contains(ModuleKind::Gamma.mask()) {
            deps.push(Dependency {
                key: PropertyKey::GammaCurve,
                offset: 1,
            });
        }
        if self.parent
            == (ParentStage::External {
                crop_dependency: true,
            })
        {
            deps.push(Dependency {
                key: PropertyKey::ChiNodeCrop,
                offset: 0,
            });
        }

        deps.retain(|dep| self.store.get(dep.key, req.request_id, dep.offset).is_none());
        deps
    }

    /// Compiles and submits a request.
    ///
    /// Returns [`Outcome::NotReady`] without touching any state when a dependency is missing, so
    /// the request can be executed again once it is published.
    pub fn execute_process_request(&mut self, req: &ProcessRequest) -> Result<Outcome> {
        if self.state != NodeState::Acquired {
            return Error::user();
        }

        let deps = self.missing_dependencies(req);
        if !deps.is_empty() {
            debug!("request {} waits for {:?}", req.request_id, deps);
            return Ok(Outcome::NotReady(deps));
        }

        let rid = req.request_id;
        let aec_gain = match self.store.get(PropertyKey::AecGain, rid, 1) {
            Some(PropertyValue::Gain(gain)) => gain,
            _ => 1.0,
        };

        let references = self.loopback.bindings(rid, req.batch_size, &self.history);
        let reference_bound = references
            .iter()
            .any(|b| matches!(b.port, PortSlot::RefInput(_)));
        let full_output = self.largest_output();
        let ctx = ZoomContext {
            request_id: rid,
            parent: self.parent,
            props: &self.props,
            full_input: self.input_dim(),
            full_output,
            margin: self.negotiated.as_ref().map_or(Dimension::default(), |n| n.margin),
            loopback_active: reference_bound,
        };
        let (zoom, next_history) =
            zoom::resolve(&ctx, self.store.as_ref(), &self.tuning, self.caps, &self.history)?;

        let mut blob = GenericBlob::new();
        if let Some(intermediate) = zoom.intermediate.filter(|_| zoom.reconfigure) {
            self.reconfigure(rid, intermediate, &mut blob)?;
        }

        let stripe = match (&self.striping, self.striping_ctx) {
            (Some(striping), Some(handle)) => {
                let window = StripeWindow {
                    crop: zoom.ica1.rect,
                    output: zoom.intermediate.unwrap_or(full_output),
                };
                Some(striping.execute(handle, &window)?)
            }
            _ => None,
        };

        let mut images = req.images.clone();
        images.extend_from_slice(&references);

        let tuning = TuningInput {
            request_id: rid,
            disabled: req.disabled,
            num_passes: self.props.num_passes,
            aec_gain,
            ica1: zoom.ica1,
            ica2: zoom.ica2,
            pre_scale: zoom.pre_scale,
            post_scale: zoom.post_scale,
        };
        let compile_req = CompileRequest {
            tuning,
            batch_size: req.batch_size,
            max_cores: self.num_cores(),
            images: &images,
            stripe: stripe.as_ref().map(|s| s.bytes.as_slice()),
        };

        let estimate = bandwidth::estimate(
            &self.bandwidth_input(rid, &references, stripe.as_ref().map(|s| s.pixel_count)),
            self.caps,
            &self.tuning.bandwidth,
        );
        blob.push(&BlobRecord::ClockBandwidth(estimate))?;
        if let Some(scratch) = self.scratch {
            blob.push(&BlobRecord::MemoryMapUpdate(scratch))?;
        }

        let (Some(pool), Some(compiler), Some(device)) =
            (self.pool.as_mut(), self.compiler.as_mut(), self.device)
        else {
            return Error::user();
        };

        let bufs = pool.checkout(rid)?;
        let compiled = match compiler.compile(&compile_req, bufs) {
            Ok(compiled) => compiled,
            Err(err) => {
                pool.recycle(rid);
                return Err(err);
            }
        };

        let image_buffers: Vec<ImageBuffer> = images.iter().map(|b| b.image).collect();
        let packet = Packet {
            request_id: rid,
            buffers: bufs,
            patches: &compiled.patches,
            images: &image_buffers,
            blob: blob.as_bytes(),
        };

        let fence = match self.driver.submit(device, &packet) {
            Ok(fence) => fence,
            Err(err) => {
                error!("failed to submit request {}: {}", rid, err);
                // the buffers go back through the fence or flush path
                self.completion.in_flight.insert(rid, None);
                return Err(err);
            }
        };

        if let Some(writer) = &self.writer {
            writer.record(DebugRecord {
                request_id: rid,
                modules: compiled.programmed,
                programs: compiled.arrays.iter().map(|a| a.active_count()).sum(),
                patches: compiled.patches.len(),
            });
        }

        self.completion.in_flight.insert(rid, Some(fence));
        self.history = next_history;

        let applied = PropertyValue::Crop(zoom.ica1.rect);
        if let Err(err) = self.store.publish(PropertyKey::AppliedCrop, rid, applied) {
            debug!("request {}: applied crop not published: {}", rid, err);
        }

        Ok(Outcome::Submitted(fence))
    }

    fn bandwidth_input(
        &self,
        rid: RequestId,
        references: &[ImageBinding],
        stripe_pixels: Option<u64>,
    ) -> BandwidthInput {
        let output = |port: OutputPort| {
            let dim = self.negotiated.as_ref()?.output(port)?;
            let format = self.port_format(port)?;
            Some(Plane { dim, format })
        };
        let reference = match (references.is_empty(), self.loopback.rings().first()) {
            (false, Some(ring)) => Some(Plane {
                dim: ring.dim,
                format: ring.format,
            }),
            _ => None,
        };

        BandwidthInput {
            input: Plane {
                dim: self.input_dim(),
                format: self.input_format,
            },
            display: output(OutputPort::Display),
            video: output(OutputPort::Video),
            reference,
            fps: self.fps,
            request_delta: self
                .history
                .last_request
                .map_or(1, |last| rid.saturating_sub(last).max(1)),
            realtime: self.props.realtime,
            num_passes: self.props.num_passes,
            stripe_pixels,
            num_cores: self.num_cores(),
        }
    }

    /// Applies a completion event and carries out the resulting actions.
    ///
    /// The actions are returned so the caller can report failed requests upstream.
    pub fn handle_event(&mut self, event: Event) -> Vec<Action> {
        let (state, actions) = on_event(std::mem::take(&mut self.completion), event);
        self.completion = state;

        for action in &actions {
            match action {
                Action::Dump(rid) => self.dump(*rid),
                Action::Recycle(rid) => {
                    if let Some(pool) = self.pool.as_mut() {
                        if !pool.recycle(*rid) {
                            warn!("request {} was not checked out", rid);
                        }
                    }
                }
                Action::ReportFailed(_) => (),
            }
        }

        actions
    }

    fn dump(&self, rid: RequestId) {
        let (Some(writer), Some(bufs)) = (&self.writer, self.pool.as_ref().and_then(|p| p.get(rid)))
        else {
            return;
        };

        writer.dump(DebugDump {
            request_id: rid,
            frame_process: bufs.frame_process.as_bytes().to_vec(),
            iq_settings: bufs.iq_settings.as_bytes().to_vec(),
        });
    }

    /// Recycles every request in flight.
    pub fn flush(&mut self) -> Vec<Action> {
        let actions = self.handle_event(Event::Flush);
        info!("flushed {} requests", actions.len());
        actions
    }

    /// Ends a flush.
    pub fn flush_done(&mut self) {
        self.handle_event(Event::FlushDone);
    }

    /// Releases the hardware resources of the node.
    pub fn release(&mut self) {
        if self.state != NodeState::Acquired {
            return;
        }

        self.flush();
        self.flush_done();
        self.teardown();
        self.state = NodeState::Released;
    }
}

impl Drop for IpeNode {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::{
        LinearStriping, MemoryBufferManager, MemoryPropertyStore, RecordingDriver,
    };
    use crate::blob::parse_blob;
    use crate::cmd::BufferId;
    use crate::instance::{ProcessingType, StabilizationType};
    use crate::negotiate::BufferRequirement;
    use crate::types::{Pass, Rect};
    use byteorder::{ByteOrder, LittleEndian};

    struct Env {
        driver: Arc<RecordingDriver>,
        store: Arc<MemoryPropertyStore>,
        buffers: Arc<MemoryBufferManager>,
        striping: Arc<LinearStriping>,
    }

    impl Env {
        fn new() -> Self {
            Self::with_buffers(MemoryBufferManager::new())
        }

        fn with_buffers(buffers: MemoryBufferManager) -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            Self {
                driver: Arc::new(RecordingDriver::new()),
                store: Arc::new(MemoryPropertyStore::new()),
                buffers: Arc::new(buffers),
                striping: Arc::new(LinearStriping::new()),
            }
        }

        fn builder(&self, props: InstanceProperty) -> Builder {
            Builder::new()
                .props(props)
                .chip(ChipVersion::Titan480)
                .depth(4)
                .port(PortRequirement {
                    port: OutputPort::Display,
                    format: Format::UbwcNv12,
                    consumers: vec![BufferRequirement::new(Dimension::new(1920, 1080))],
                })
                .driver(self.driver.clone())
                .store(self.store.clone())
                .buffers(self.buffers.clone())
                .striping(self.striping.clone())
        }

        fn publish_all(&self, rid: RequestId) {
            self.store
                .publish(PropertyKey::AecGain, rid, PropertyValue::Gain(1.5))
                .unwrap();
            self.store
                .publish(PropertyKey::GammaCurve, rid, PropertyValue::Blob(vec![0; 16]))
                .unwrap();
        }

        fn request(&self, rid: RequestId) -> ProcessRequest {
            let images = self
                .buffers
                .allocate(&Description::new().extent(Extent::Buffer(4096)), 2)
                .unwrap();
            ProcessRequest::new(rid)
                .image(0, PortSlot::Input, images[0])
                .image(0, PortSlot::Display, images[1])
        }
    }

    fn submitted(outcome: Outcome) -> Fence {
        match outcome {
            Outcome::Submitted(fence) => fence,
            Outcome::NotReady(deps) => panic!("not ready: {:?}", deps),
        }
    }

    fn mctf() -> InstanceProperty {
        InstanceProperty::new().stabilization(StabilizationType::MCTF)
    }

    // the eight window registers of an ICA block in a register program
    fn window_regs(generic: &[u8], kind: ModuleKind) -> Vec<u32> {
        let dwords: Vec<u32> = generic.chunks_exact(4).map(LittleEndian::read_u32).collect();
        let base = 0x1000 * kind.uid();
        let start = dwords
            .windows(3)
            .position(|w| w[0] == base && w[2] == base + 4)
            .unwrap();
        (0..8).map(|reg| dwords[start + 1 + 2 * reg]).collect()
    }

    fn publish_crop(env: &Env, rid: RequestId, crop: Rect) {
        env.store
            .publish(PropertyKey::ResidualCrop, rid, PropertyValue::Crop(crop))
            .unwrap();
    }

    #[test]
    fn lifecycle() {
        let env = Env::new();
        let mut node = env.builder(InstanceProperty::new()).build().unwrap();
        assert_eq!(node.state(), NodeState::Created);
        assert!(node.execute_process_request(&env.request(1)).is_err());

        node.acquire().unwrap();
        assert_eq!(node.state(), NodeState::Acquired);
        assert_eq!(node.negotiated().unwrap().input.optimal, Dimension::new(1920, 1080));
        assert!(env.driver.is_acquired());
        assert!(!env.driver.descriptor().unwrap().config_io.is_empty());
        assert_eq!(env.striping.live(), 1);
        assert!(node.scratch().is_some());

        let live = env.buffers.live();
        node.release();
        assert_eq!(node.state(), NodeState::Released);
        assert!(!env.driver.is_acquired());
        assert_eq!(env.striping.live(), 0);
        assert_eq!(env.buffers.live(), live - 1);
    }

    #[test]
    fn builder_requires_collaborators() {
        assert!(Builder::new().build().is_err());

        let env = Env::new();
        assert!(env.builder(InstanceProperty::new()).depth(0).build().is_err());
    }

    #[test]
    fn failed_acquire_cleans_up() {
        let env = Env::with_buffers(MemoryBufferManager::new().limit(2));
        let mut node = env.builder(mctf()).build().unwrap();

        assert!(matches!(node.acquire(), Err(Error::Exhausted(_))));
        assert_eq!(node.state(), NodeState::Negotiated);
        assert_eq!(env.buffers.live(), 0);
        assert!(!env.driver.is_acquired());
        assert_eq!(env.striping.live(), 0);
        assert!(node.loopback().rings().is_empty());
    }

    #[test]
    fn submits_compiled_request() {
        let env = Env::new();
        let mut node = env.builder(InstanceProperty::new()).build().unwrap();
        node.acquire().unwrap();

        let fence = submitted(node.execute_process_request(&env.request(1)).unwrap());
        assert_eq!(node.in_flight(), vec![1]);
        assert_eq!(node.history().last_request, Some(1));

        let subs = env.driver.submissions();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].fence, fence);
        assert!(subs[0].regions.contains_key(&BufferId::Striping));

        let records = parse_blob(&subs[0].blob).unwrap();
        let types: Vec<u32> = records.iter().map(|(t, _)| *t).collect();
        assert_eq!(types, vec![1, 2]);

        assert_eq!(node.handle_event(Event::FenceSignaled(fence)), vec![Action::Recycle(1)]);
        assert!(node.in_flight().is_empty());
    }

    #[test]
    fn missing_dependency_is_idempotent() {
        let env = Env::new();
        let mut node = env.builder(InstanceProperty::new()).build().unwrap();
        node.acquire().unwrap();

        // nothing to wait for on the first request
        submitted(node.execute_process_request(&env.request(1)).unwrap());

        let req = env.request(2);
        for _ in 0..2 {
            match node.execute_process_request(&req).unwrap() {
                Outcome::NotReady(deps) => {
                    assert!(deps.contains(&Dependency {
                        key: PropertyKey::AecGain,
                        offset: 1,
                    }));
                }
                Outcome::Submitted(_) => panic!("submitted without dependencies"),
            }
            assert_eq!(node.in_flight(), vec![1]);
            assert_eq!(node.history().last_request, Some(1));
        }
        assert_eq!(env.driver.submissions().len(), 1);

        env.publish_all(1);
        submitted(node.execute_process_request(&req).unwrap());
        assert_eq!(node.in_flight(), vec![1, 2]);
    }

    #[test]
    fn disabled_modules_drop_dependencies() {
        let env = Env::new();
        let mut node = env.builder(InstanceProperty::new()).build().unwrap();
        node.acquire().unwrap();
        submitted(node.execute_process_request(&env.request(1)).unwrap());

        let req = env
            .request(2)
            .disable(ModuleKind::Ltm.mask() | ModuleKind::Gtm.mask() | ModuleKind::Gamma.mask());
        assert!(node.missing_dependencies(&req).is_empty());
        submitted(node.execute_process_request(&req).unwrap());
    }

    #[test]
    fn failed_fence_dumps_and_reports() {
        let env = Env::new();
        let svc = DebugDataService::create();
        let mut node = env
            .builder(InstanceProperty::new())
            .debug(svc.clone())
            .build()
            .unwrap();
        node.acquire().unwrap();
        assert_eq!(svc.refs(), 1);

        let fence = submitted(node.execute_process_request(&env.request(1)).unwrap());
        let writer = svc.writer().unwrap();
        assert_eq!(writer.records().len(), 1);

        let actions = node.handle_event(Event::FenceFailed(fence));
        assert_eq!(
            actions,
            vec![Action::Dump(1), Action::ReportFailed(1), Action::Recycle(1)]
        );
        assert_eq!(writer.dumps().len(), 1);
        assert!(!writer.dumps()[0].frame_process.is_empty());
        assert!(node.in_flight().is_empty());

        drop(node);
        assert_eq!(svc.refs(), 0);
    }

    #[test]
    fn flush_recycles_everything() {
        let env = Env::new();
        let mut node = env.builder(InstanceProperty::new()).build().unwrap();
        node.acquire().unwrap();

        submitted(node.execute_process_request(&env.request(1)).unwrap());
        env.publish_all(1);
        let fence = submitted(node.execute_process_request(&env.request(2)).unwrap());

        let actions = node.flush();
        assert_eq!(actions, vec![Action::Recycle(1), Action::Recycle(2)]);
        assert!(node.in_flight().is_empty());

        // late errors during the flush are not reported
        assert!(node.handle_event(Event::FenceFailed(fence)).is_empty());
        node.flush_done();
        assert!(!node.completion().flushing);
    }

    #[test]
    fn submission_failure_recycles_on_flush() {
        let env = Env::new();
        let mut node = env.builder(InstanceProperty::new()).build().unwrap();
        node.acquire().unwrap();

        env.driver.reject_next(-22);
        let res = node.execute_process_request(&env.request(1));
        assert!(matches!(res, Err(Error::Submit(-22))));
        assert_eq!(node.in_flight(), vec![1]);
        assert_eq!(node.completion().in_flight.get(&1), Some(&None));
        assert_eq!(node.history().last_request, None);

        assert_eq!(node.flush(), vec![Action::Recycle(1)]);
        assert!(node.in_flight().is_empty());
    }

    #[test]
    fn reference_chain() {
        let env = Env::new();
        let mut node = env.builder(mctf()).build().unwrap();
        node.acquire().unwrap();
        assert_eq!(node.loopback().rings().len(), 1);
        let ring = node.loopback().rings()[0].buffers.clone();

        let image_keys = |rid: RequestId| {
            let sub = env
                .driver
                .submissions()
                .into_iter()
                .find(|s| s.request_id == rid)
                .unwrap();
            ring.iter()
                .map(|buf| sub.regions.contains_key(&BufferId::Image(buf.handle)))
                .collect::<Vec<bool>>()
        };

        // first request: writes slot 1, no reference input
        submitted(node.execute_process_request(&env.request(5)).unwrap());
        assert_eq!(image_keys(5), vec![false, true]);

        env.publish_all(5);
        submitted(node.execute_process_request(&env.request(6)).unwrap());
        assert_eq!(image_keys(6), vec![true, true]);

        // a gap leaves only the output bound
        env.publish_all(9);
        submitted(node.execute_process_request(&env.request(10)).unwrap());
        assert_eq!(image_keys(10), vec![true, false]);
    }

    #[test]
    fn intermediate_change_reconfigures() {
        let env = Env::new();
        let props = InstanceProperty::new().processing(ProcessingType::MfsrPrefilter);
        let mut node = env.builder(props).build().unwrap();
        node.acquire().unwrap();

        submitted(node.execute_process_request(&env.request(1)).unwrap());
        env.publish_all(1);
        submitted(node.execute_process_request(&env.request(2)).unwrap());

        let subs = env.driver.submissions();
        let types = |idx: usize| -> Vec<u32> {
            parse_blob(&subs[idx].blob)
                .unwrap()
                .iter()
                .map(|(t, _)| *t)
                .collect()
        };
        assert_eq!(types(0), vec![3, 1, 2]);
        assert_eq!(types(1), vec![1, 2]);
        assert_eq!(node.history().prev_intermediate, Some(Dimension::new(1920, 1080)));
    }

    #[test]
    fn crop_reaches_ica1_program() {
        let full = Rect::new(0, 0, 1920, 1080);
        let zoomed = Rect::new(480, 270, 960, 540);

        let mut generic = Vec::new();
        for crop in [full, zoomed] {
            let env = Env::new();
            let mut node = env.builder(InstanceProperty::new()).build().unwrap();
            node.acquire().unwrap();
            publish_crop(&env, 1, crop);

            submitted(node.execute_process_request(&env.request(1)).unwrap());
            assert_eq!(
                env.store.get(PropertyKey::AppliedCrop, 1, 0),
                Some(PropertyValue::Crop(crop))
            );
            generic.push(env.driver.submissions()[0].generic.clone());
        }

        assert_ne!(generic[0], generic[1]);
        let regs = window_regs(&generic[1], ModuleKind::Ica1);
        assert_eq!(&regs[..6], &[480, 270, 960, 540, 1920, 1080]);
        // post scale is crop width over output width, in Q16
        assert_eq!(regs[7], 0x8000);
        assert_eq!(window_regs(&generic[0], ModuleKind::Ica1)[2], 1920);
    }

    #[test]
    fn ica2_follows_previous_crop() {
        let env = Env::new();
        let mut node = env.builder(mctf()).build().unwrap();
        node.acquire().unwrap();

        let first = Rect::new(0, 0, 1600, 900);
        let second = Rect::new(160, 90, 1600, 900);
        publish_crop(&env, 5, first);
        publish_crop(&env, 6, second);
        publish_crop(&env, 10, second);

        let ica2 = |rid: RequestId| {
            let sub = env
                .driver
                .submissions()
                .into_iter()
                .find(|s| s.request_id == rid)
                .unwrap();
            window_regs(&sub.generic, ModuleKind::Ica2)
        };

        // nothing to warp against on the first request
        submitted(node.execute_process_request(&env.request(5)).unwrap());
        assert_eq!(ica2(5), vec![0; 8]);

        env.publish_all(5);
        submitted(node.execute_process_request(&env.request(6)).unwrap());
        assert_eq!(&ica2(6)[..6], &[0, 0, 1600, 900, 1920, 1080]);

        // the reference of request 9 never existed
        env.publish_all(9);
        submitted(node.execute_process_request(&env.request(10)).unwrap());
        assert_eq!(ica2(10), vec![0; 8]);
        assert_eq!(node.history().previous_crop.map(|w| w.rect), Some(second));
    }

    #[test]
    fn eis_margin_excludes_fovc() {
        let env = Env::new();
        let props = InstanceProperty::new()
            .stabilization(StabilizationType::EIS3)
            .eis_margin(0.1, 0.1)
            .fovc(true);
        let mut node = env.builder(props).build().unwrap();

        let negotiated = node.negotiate().unwrap();
        assert_eq!(negotiated.margin, Dimension::new(192, 108));
        assert!(negotiated.input.optimal.width > 1920 + 192);
    }

    #[test]
    fn intermediate_change_recreates_striping() {
        let env = Env::new();
        let props = InstanceProperty::new().processing(ProcessingType::MfsrPrefilter);
        let mut node = env.builder(props).build().unwrap();
        node.acquire().unwrap();
        assert_eq!(env.striping.created(), 1);

        submitted(node.execute_process_request(&env.request(1)).unwrap());
        assert_eq!(env.striping.created(), 2);
        assert_eq!(env.striping.configs()[0].output, Dimension::new(1920, 1080));

        env.publish_all(1);
        publish_crop(&env, 2, Rect::new(0, 0, 800, 450));
        submitted(node.execute_process_request(&env.request(2)).unwrap());
        assert_eq!(env.striping.created(), 3);
        assert_eq!(env.striping.live(), 1);
        assert_eq!(env.striping.configs()[0].output, Dimension::new(1600, 900));
        assert_eq!(node.history().prev_intermediate, Some(Dimension::new(1600, 900)));

        // same size again: nothing to redo
        env.publish_all(2);
        publish_crop(&env, 3, Rect::new(100, 100, 800, 450));
        submitted(node.execute_process_request(&env.request(3)).unwrap());
        assert_eq!(env.striping.created(), 3);
    }

    #[test]
    fn reducer() {
        let mut state = CompletionState::default();
        state.in_flight.insert(3, Some(Fence(30)));
        state.in_flight.insert(4, None);

        let (state, actions) = on_event(state, Event::FenceSignaled(Fence(99)));
        assert!(actions.is_empty());

        let (state, actions) = on_event(state, Event::FenceFailed(Fence(30)));
        assert_eq!(actions, vec![Action::ReportFailed(3), Action::Recycle(3)]);

        let (state, actions) = on_event(state, Event::Flush);
        assert_eq!(actions, vec![Action::Recycle(4)]);
        assert!(state.flushing && state.in_flight.is_empty());

        let (state, _) = on_event(state, Event::FlushDone);
        assert!(!state.flushing);
    }

    #[test]
    fn ring_grows_for_dumps() {
        let env = Env::new();
        let mut node = env.builder(mctf()).build().unwrap();
        node.acquire().unwrap();
        assert_eq!(node.loopback().ring_size(), 2);
        node.release();

        let mut node = env
            .builder(mctf())
            .debug(DebugDataService::create())
            .build()
            .unwrap();
        node.acquire().unwrap();
        assert_eq!(node.loopback().ring_size(), 4);
        assert_eq!(node.loopback().rings()[0].pass, Pass::Full);
    }
}
