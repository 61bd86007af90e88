// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! The per-request program compiler.
//!
//! Compiling a request walks `Idle -> HeaderWritten -> ProgramArraysPopulated -> BuffersPatched
//! -> Committed`.  The first failing step abandons the request: the buffers are reset, the
//! compiler goes back to `Idle` and nothing is handed to the device driver.

use super::cdm::{
    header, program_addr_offset, CdmProgramArray, FrameProcessLayout, PortSlot, Stage, HEADER_SIZE,
};
use super::cmd::{BufferId, CmdBuffer, FrameBuffers, Patch, PatchList};
use super::iq::{IqModule, ModuleBuffers, ModuleMask, TuningInput};
use super::types::{Error, ImageBuffer, RequestId, Result, Size};
use byteorder::{LittleEndian, WriteBytesExt};
use log::{debug, error};

/// The progress of the request being compiled.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CompileStage {
    /// No request in progress.
    #[default]
    Idle,
    /// The frame-process header has been written.
    HeaderWritten,
    /// The IQ modules have run and every program array is encoded.
    ProgramArraysPopulated,
    /// Every cross-buffer address has a patch.
    BuffersPatched,
    /// Every command buffer is sealed.
    Committed,
}

/// An image bound to a port slot of one frame of the batch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ImageBinding {
    /// The frame of the batch.
    pub frame: u32,
    /// The port slot.
    pub port: PortSlot,
    /// The image.
    pub image: ImageBuffer,
}

/// The per-request input of the compiler.
#[derive(Clone, Debug)]
pub struct CompileRequest<'a> {
    /// The tuning input handed to every IQ module.
    pub tuning: TuningInput,
    /// Number of frames in the batch.
    pub batch_size: u32,
    /// Configured core cap.
    pub max_cores: u32,
    /// The images of the request.
    pub images: &'a [ImageBinding],
    /// The stripe program, if the striping library produced one.
    pub stripe: Option<&'a [u8]>,
}

impl CompileRequest<'_> {
    /// Returns the request id.
    pub fn request_id(&self) -> RequestId {
        self.tuning.request_id
    }
}

/// A compiled request, ready for submission.
#[derive(Clone, Debug)]
pub struct Compiled {
    /// The request id.
    pub request_id: RequestId,
    /// Every cross-buffer address of the request.
    pub patches: Vec<Patch>,
    /// The program arrays, in stage order.
    pub arrays: Vec<CdmProgramArray>,
    /// The frame-process layout.
    pub layout: FrameProcessLayout,
    /// The modules that programmed registers.
    pub programmed: ModuleMask,
}

/// Byte size of the fixed part of the IQ-settings struct.
pub const IQ_SETTINGS_HEADER_SIZE: usize = 12;
/// Byte size of one module record of the IQ-settings struct.
pub const IQ_SETTINGS_RECORD_SIZE: usize = 12;

/// Compiles requests for one node.
pub struct Compiler {
    modules: Vec<Box<dyn IqModule>>,
    hw_cores: u32,
    stage: CompileStage,
}

fn buffer_size(buf: &CmdBuffer) -> Size {
    buf.len() as Size
}

impl Compiler {
    /// Creates a compiler over the instantiated modules of a node.
    pub fn new(modules: Vec<Box<dyn IqModule>>, hw_cores: u32) -> Self {
        Self {
            modules,
            hw_cores,
            stage: CompileStage::Idle,
        }
    }

    /// Returns the stage reached by the last compilation.
    pub fn stage(&self) -> CompileStage {
        self.stage
    }

    /// Returns the instantiated modules.
    pub fn modules(&self) -> &[Box<dyn IqModule>] {
        &self.modules
    }

    /// Returns the instantiated modules as a mask.
    pub fn module_mask(&self) -> ModuleMask {
        self.modules
            .iter()
            .fold(ModuleMask::empty(), |mask, m| mask | m.kind().mask())
    }

    /// Compiles a request into `bufs`.
    ///
    /// On failure `bufs` is left empty.
    pub fn compile(&mut self, req: &CompileRequest, bufs: &mut FrameBuffers) -> Result<Compiled> {
        self.stage = CompileStage::Idle;
        bufs.reset();

        let res = self.run(req, bufs);
        match res {
            Ok(_) => debug!(
                "compiled request {} through {:?}",
                req.request_id(),
                self.stage
            ),
            Err(ref err) => {
                error!("failed to compile request {}: {}", req.request_id(), err);
                bufs.reset();
                self.stage = CompileStage::Idle;
            }
        }

        res
    }

    fn run(&mut self, req: &CompileRequest, bufs: &mut FrameBuffers) -> Result<Compiled> {
        let layout = self.write_header(req, &mut bufs.frame_process)?;
        self.stage = CompileStage::HeaderWritten;

        let programmed = self.execute_modules(req, bufs)?;
        let arrays = self.write_arrays(req, &layout, &mut bufs.frame_process)?;
        self.write_iq_settings(req, programmed, &mut bufs.iq_settings)?;
        if let Some(stripe) = req.stripe {
            bufs.striping.write_bytes(stripe)?;
        }
        self.stage = CompileStage::ProgramArraysPopulated;

        let patches = self.patch(req, &layout, &arrays, bufs)?;
        self.stage = CompileStage::BuffersPatched;

        bufs.frame_process.seal();
        bufs.iq_settings.seal();
        bufs.generic.seal();
        bufs.dmi_header.seal();
        bufs.nps.seal();
        bufs.striping.seal();
        self.stage = CompileStage::Committed;

        Ok(Compiled {
            request_id: req.request_id(),
            patches,
            arrays,
            layout,
            programmed,
        })
    }

    fn write_header(
        &self,
        req: &CompileRequest,
        buf: &mut CmdBuffer,
    ) -> Result<FrameProcessLayout> {
        if req.batch_size == 0 {
            return Error::compile("empty batch");
        }

        let layout = FrameProcessLayout::new(req.batch_size);
        buf.reserve(layout.size)?;

        buf.set_u32(header::REQUEST_ID, req.request_id() as u32)?;
        buf.set_u32(header::MAX_CORES, req.max_cores.min(self.hw_cores).max(1))?;
        buf.set_u32(header::TARGET_TIME, 0)?;
        buf.set_u32(header::NUM_PASSES, req.tuning.num_passes)?;
        buf.set_u32(header::BATCH_SIZE, layout.batch_size)?;
        buf.set_u32(header::FRAME_SETS_OFFSET, u32::try_from(layout.frame_sets_offset)?)?;
        for (idx, offset) in layout.array_offsets.iter().enumerate() {
            buf.set_u32(header::ARRAY_OFFSETS + 4 * idx, u32::try_from(*offset)?)?;
        }

        Ok(layout)
    }

    fn execute_modules(
        &mut self,
        req: &CompileRequest,
        bufs: &mut FrameBuffers,
    ) -> Result<ModuleMask> {
        let mut module_bufs = ModuleBuffers {
            generic: &mut bufs.generic,
            dmi_header: &mut bufs.dmi_header,
            nps: &mut bufs.nps,
        };

        let mut programmed = ModuleMask::empty();
        for module in self.modules.iter_mut() {
            let kind = module.kind();
            if !req.tuning.is_enabled(kind) {
                continue;
            }
            module.execute(&req.tuning, &mut module_bufs)?;
            programmed |= kind.mask();
        }

        Ok(programmed)
    }

    fn write_arrays(
        &self,
        req: &CompileRequest,
        layout: &FrameProcessLayout,
        buf: &mut CmdBuffer,
    ) -> Result<Vec<CdmProgramArray>> {
        Stage::ALL
            .iter()
            .map(|stage| {
                let array = CdmProgramArray::build(*stage, &self.modules, &req.tuning)?;
                buf.write_at(layout.array_offset(*stage), &array.encode()?)?;
                Ok(array)
            })
            .collect()
    }

    fn write_iq_settings(
        &self,
        req: &CompileRequest,
        programmed: ModuleMask,
        buf: &mut CmdBuffer,
    ) -> Result<()> {
        let programmed_modules = self
            .modules
            .iter()
            .filter(|m| programmed.contains(m.kind().mask()));

        let mut settings = Vec::new();
        settings.write_u32::<LittleEndian>(programmed.bits())?;
        settings.write_u32::<LittleEndian>(programmed.bits().count_ones())?;
        settings.write_f32::<LittleEndian>(req.tuning.aec_gain)?;
        for module in programmed_modules {
            settings.write_u32::<LittleEndian>(module.kind().uid())?;
            settings.write_u32::<LittleEndian>(u32::try_from(module.cmd_length())?)?;
            settings.write_u32::<LittleEndian>(module.lut_count())?;
        }

        buf.write_bytes(&settings)?;

        Ok(())
    }

    fn patch(
        &self,
        req: &CompileRequest,
        layout: &FrameProcessLayout,
        arrays: &[CdmProgramArray],
        bufs: &FrameBuffers,
    ) -> Result<Vec<Patch>> {
        let mut patches = PatchList::new();
        let fp = BufferId::FrameProcess;

        patches.add(
            fp,
            header::IQ_SETTINGS_ADDR,
            BufferId::IqSettings,
            0,
            buffer_size(&bufs.iq_settings),
        )?;
        patches.add(
            fp,
            header::PROGRAM_ARRAY_BASE,
            fp,
            HEADER_SIZE,
            buffer_size(&bufs.frame_process),
        )?;
        if req.stripe.is_some() {
            patches.add(
                fp,
                header::STRIPING_ADDR,
                BufferId::Striping,
                0,
                buffer_size(&bufs.striping),
            )?;
        }

        for array in arrays {
            let base = layout.array_offset(array.stage());
            for (idx, program) in array.programs().iter().enumerate() {
                let Some((dst, dst_offset)) = program.target else {
                    continue;
                };
                let dst_size = bufs.get(dst).map_or(0, buffer_size);
                patches.add(fp, base + program_addr_offset(idx), dst, dst_offset, dst_size)?;
            }
        }

        for binding in req.images {
            if binding.frame >= layout.batch_size {
                return Error::compile("image bound to a frame outside the batch");
            }
            patches.add(
                fp,
                layout.port_offset(binding.frame, binding.port),
                BufferId::Image(binding.image.handle),
                0,
                binding.image.size,
            )?;
        }

        Ok(patches.take())
    }
}
