// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! CDM program arrays and the frame-process buffer layout.
//!
//! The frame-process buffer starts with a fixed header.  The program arrays of all stages follow
//! at offsets that only depend on the stage/slot table, so that the firmware can find every array
//! without a per-request allocation.  The frame sets, one per batched frame, come last.
//!
//! Every stage has a fixed list of slots.  A slot becomes a real program when its modules are
//! enabled for the request, and a `Skip` program otherwise, so the firmware walker always finds
//! the same number of programs per stage.

use super::cmd::BufferId;
use super::iq::{IqModule, ModuleKind, TuningInput, DMI_HEADER_DWORDS};
use super::types::{Error, Pass, Result, PASS_COUNT};
use byteorder::{LittleEndian, WriteBytesExt};

/// A processing stage with its own program array.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Stage {
    /// Register programs before local tone mapping.
    PreLtm,
    /// Register programs after local tone mapping.
    PostLtm,
    /// ANR of one downscale pass.
    Anr(Pass),
    /// TF of one downscale pass.
    Tf(Pass),
    /// Current-frame warp.
    Ica1,
    /// Reference-frame warp.
    Ica2,
}

/// The number of stages.
pub const STAGE_COUNT: usize = 2 + 2 * PASS_COUNT + 2;

/// What a program slot covers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Slot {
    /// The register programs of a group of modules, in table order.
    Generic(&'static [ModuleKind]),
    /// The LUT programs of one module.
    Lut(ModuleKind),
}

const PRE_LTM_MODULES: &[ModuleKind] = &[ModuleKind::Cac, ModuleKind::Cst, ModuleKind::Ltm];
const POST_LTM_MODULES: &[ModuleKind] = &[
    ModuleKind::ColorCorrect,
    ModuleKind::Gtm,
    ModuleKind::Gamma,
    ModuleKind::Lut2d,
    ModuleKind::ChromaEnhance,
    ModuleKind::ChromaSuppress,
    ModuleKind::Sce,
    ModuleKind::Asf,
    ModuleKind::Upscaler,
    ModuleKind::GrainAdder,
];

const PRE_LTM_SLOTS: &[Slot] = &[Slot::Generic(PRE_LTM_MODULES), Slot::Lut(ModuleKind::Ltm)];
const POST_LTM_SLOTS: &[Slot] = &[
    Slot::Generic(POST_LTM_MODULES),
    Slot::Lut(ModuleKind::Gtm),
    Slot::Lut(ModuleKind::Gamma),
    Slot::Lut(ModuleKind::Lut2d),
    Slot::Lut(ModuleKind::Asf),
    Slot::Lut(ModuleKind::GrainAdder),
];
const ANR_SLOTS: &[Slot] = &[Slot::Generic(&[ModuleKind::Anr])];
const TF_SLOTS: &[Slot] = &[Slot::Generic(&[ModuleKind::Tf])];
const ICA1_SLOTS: &[Slot] = &[Slot::Generic(&[ModuleKind::Ica1]), Slot::Lut(ModuleKind::Ica1)];
const ICA2_SLOTS: &[Slot] = &[Slot::Generic(&[ModuleKind::Ica2]), Slot::Lut(ModuleKind::Ica2)];

impl Stage {
    /// All stages, in frame-process order.
    pub const ALL: [Stage; STAGE_COUNT] = [
        Stage::PreLtm,
        Stage::PostLtm,
        Stage::Anr(Pass::Full),
        Stage::Anr(Pass::Dc4),
        Stage::Anr(Pass::Dc16),
        Stage::Anr(Pass::Dc64),
        Stage::Tf(Pass::Full),
        Stage::Tf(Pass::Dc4),
        Stage::Tf(Pass::Dc16),
        Stage::Tf(Pass::Dc64),
        Stage::Ica1,
        Stage::Ica2,
    ];

    /// Returns the position of the stage in [`Stage::ALL`].
    pub fn index(&self) -> usize {
        match self {
            Stage::PreLtm => 0,
            Stage::PostLtm => 1,
            Stage::Anr(pass) => 2 + pass.index(),
            Stage::Tf(pass) => 2 + PASS_COUNT + pass.index(),
            Stage::Ica1 => 2 + 2 * PASS_COUNT,
            Stage::Ica2 => 3 + 2 * PASS_COUNT,
        }
    }

    /// Returns the fixed slots of the stage.
    pub fn slots(&self) -> &'static [Slot] {
        match self {
            Stage::PreLtm => PRE_LTM_SLOTS,
            Stage::PostLtm => POST_LTM_SLOTS,
            Stage::Anr(_) => ANR_SLOTS,
            Stage::Tf(_) => TF_SLOTS,
            Stage::Ica1 => ICA1_SLOTS,
            Stage::Ica2 => ICA2_SLOTS,
        }
    }

    fn pass(&self) -> Option<Pass> {
        match self {
            Stage::Anr(pass) | Stage::Tf(pass) => Some(*pass),
            _ => None,
        }
    }
}

/// The type of a CDM program.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgramType {
    /// Register random-access writes.
    Generic,
    /// A placeholder the firmware walks over.
    Skip,
    /// DMI writes of a module's LUTs.
    Lut(ModuleKind),
}

impl ProgramType {
    /// Returns the firmware encoding.
    pub fn firmware_code(&self) -> u32 {
        match self {
            ProgramType::Generic => 0,
            ProgramType::Skip => 1,
            ProgramType::Lut(kind) => 0x100 | kind.uid(),
        }
    }
}

/// One program of a program array.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CdmProgram {
    /// Set for programs that write a single register.  This compiler never emits them.
    pub has_single_reg: bool,
    /// The program type.
    pub program_type: ProgramType,
    /// The uid of the first module the program covers.
    pub uid: u32,
    /// The command bytes the program executes.
    pub target: Option<(BufferId, usize)>,
    /// Byte length of the command minus one.
    pub length: u32,
}

impl CdmProgram {
    /// Returns a skip program.
    pub fn skip() -> Self {
        Self {
            has_single_reg: false,
            program_type: ProgramType::Skip,
            uid: 0,
            target: None,
            length: 0,
        }
    }

    /// Returns true for a skip program.
    pub fn is_skip(&self) -> bool {
        self.program_type == ProgramType::Skip
    }
}

/// Byte size of the array header: program count and active count.
pub const ARRAY_HEADER_SIZE: usize = 8;
/// Byte size of one encoded program.
pub const PROGRAM_SIZE: usize = 24;
/// Byte offset of the address field inside an encoded program.
pub const PROGRAM_ADDR_OFFSET: usize = 12;

/// The program array of one stage.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CdmProgramArray {
    stage: Stage,
    programs: Vec<CdmProgram>,
}

fn length_minus_one(bytes: usize) -> Result<u32> {
    match bytes.checked_sub(1) {
        Some(len) => Ok(u32::try_from(len)?),
        None => Error::compile("empty program"),
    }
}

fn find<'a>(modules: &'a [Box<dyn IqModule>], kind: ModuleKind) -> Option<&'a dyn IqModule> {
    modules.iter().find(|m| m.kind() == kind).map(|m| m.as_ref())
}

fn generic_program(
    group: &[ModuleKind],
    pass: Option<Pass>,
    modules: &[Box<dyn IqModule>],
    input: &TuningInput,
) -> Result<CdmProgram> {
    if let Some(pass) = pass {
        if pass.index() >= input.num_passes as usize {
            return Ok(CdmProgram::skip());
        }
    }

    let mut first: Option<(ModuleKind, usize)> = None;
    let mut end = 0;
    for kind in group {
        let Some(module) = find(modules, *kind).filter(|_| input.is_enabled(*kind)) else {
            continue;
        };

        let data = module.module_data();
        let offset = match pass {
            Some(pass) => data.per_pass_offsets[pass.index()],
            None => data.reg_offset,
        };
        let Some(offset) = offset else {
            return Error::compile("enabled module has no register program");
        };

        match first {
            None => first = Some((*kind, offset)),
            Some(_) if offset != end => {
                return Error::compile("register programs of a stage are not contiguous");
            }
            Some(_) => (),
        }
        end = offset + data.cmd_length;
    }

    let Some((kind, start)) = first else {
        return Ok(CdmProgram::skip());
    };

    Ok(CdmProgram {
        has_single_reg: false,
        program_type: ProgramType::Generic,
        uid: kind.uid(),
        target: Some((
            if pass.is_some() {
                BufferId::Nps
            } else {
                BufferId::Generic
            },
            start,
        )),
        length: length_minus_one(end - start)?,
    })
}

fn lut_program(
    kind: ModuleKind,
    modules: &[Box<dyn IqModule>],
    input: &TuningInput,
) -> Result<CdmProgram> {
    let Some(module) = find(modules, kind).filter(|m| input.is_enabled(kind) && m.lut_count() > 0)
    else {
        return Ok(CdmProgram::skip());
    };

    let Some(offset) = module.lut_offset() else {
        return Error::compile("enabled module has no DMI headers");
    };
    let bytes = module.lut_count() as usize * DMI_HEADER_DWORDS as usize * 4;

    Ok(CdmProgram {
        has_single_reg: false,
        program_type: ProgramType::Lut(kind),
        uid: kind.uid(),
        target: Some((BufferId::DmiHeader, offset)),
        length: length_minus_one(bytes)?,
    })
}

impl CdmProgramArray {
    /// Builds the array of a stage from the modules executed for a request.
    pub fn build(
        stage: Stage,
        modules: &[Box<dyn IqModule>],
        input: &TuningInput,
    ) -> Result<Self> {
        let programs = stage
            .slots()
            .iter()
            .map(|slot| match slot {
                Slot::Generic(group) => generic_program(group, stage.pass(), modules, input),
                Slot::Lut(kind) => lut_program(*kind, modules, input),
            })
            .collect::<Result<_>>()?;

        Ok(Self { stage, programs })
    }

    /// Returns the stage.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Returns the programs, skips included.
    pub fn programs(&self) -> &[CdmProgram] {
        &self.programs
    }

    /// Returns the number of programs the firmware walks.
    pub fn num_programs(&self) -> usize {
        self.programs.len()
    }

    /// Returns the number of non-skipped programs.
    pub fn active_count(&self) -> usize {
        self.programs.iter().filter(|p| !p.is_skip()).count()
    }

    /// Returns the encoded size of the array.
    pub fn encoded_size(&self) -> usize {
        array_size(self.stage)
    }

    /// Encodes the array.  Address fields are left zero for patching.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_size());

        buf.write_u32::<LittleEndian>(u32::try_from(self.num_programs())?)?;
        buf.write_u32::<LittleEndian>(u32::try_from(self.active_count())?)?;
        for program in &self.programs {
            buf.write_u32::<LittleEndian>(program.has_single_reg as u32)?;
            buf.write_u32::<LittleEndian>(program.program_type.firmware_code())?;
            buf.write_u32::<LittleEndian>(program.uid)?;
            buf.write_u32::<LittleEndian>(0)?;
            buf.write_u32::<LittleEndian>(program.length)?;
            buf.write_u32::<LittleEndian>(0)?;
        }

        Ok(buf)
    }
}

/// Returns the byte offset of the address field of program `idx` inside an encoded array.
pub fn program_addr_offset(idx: usize) -> usize {
    ARRAY_HEADER_SIZE + idx * PROGRAM_SIZE + PROGRAM_ADDR_OFFSET
}

fn array_size(stage: Stage) -> usize {
    ARRAY_HEADER_SIZE + stage.slots().len() * PROGRAM_SIZE
}

/// A port slot of a frame set.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PortSlot {
    /// The full-resolution input.
    Input,
    /// The display output.
    Display,
    /// The video output.
    Video,
    /// The reference output of a pass.
    RefOutput(Pass),
    /// The reference input of a pass.
    RefInput(Pass),
}

/// The number of port slots of a frame set.
pub const PORT_SLOTS: usize = 3 + 2 * PASS_COUNT;

impl PortSlot {
    /// Returns the position of the slot in a frame set.
    pub fn index(&self) -> usize {
        match self {
            PortSlot::Input => 0,
            PortSlot::Display => 1,
            PortSlot::Video => 2,
            PortSlot::RefOutput(pass) => 3 + pass.index(),
            PortSlot::RefInput(pass) => 3 + PASS_COUNT + pass.index(),
        }
    }
}

/// Frame-process header field offsets.
pub mod header {
    /// Request id, low 32 bits.
    pub const REQUEST_ID: usize = 0;
    /// Number of cores the request may use.
    pub const MAX_CORES: usize = 4;
    /// Target completion time in ns.  Zero means no deadline.
    pub const TARGET_TIME: usize = 8;
    /// Address of the IQ-settings struct.
    pub const IQ_SETTINGS_ADDR: usize = 12;
    /// Address of the stripe program, zero when there is none.
    pub const STRIPING_ADDR: usize = 16;
    /// Address of the first program array.
    pub const PROGRAM_ARRAY_BASE: usize = 20;
    /// Number of active downscale passes.
    pub const NUM_PASSES: usize = 24;
    /// Number of frames in the batch.
    pub const BATCH_SIZE: usize = 28;
    /// Offset of the first frame set.
    pub const FRAME_SETS_OFFSET: usize = 32;
    /// Offsets of the program arrays, one per stage.
    pub const ARRAY_OFFSETS: usize = 36;
}

/// Byte size of the frame-process header.
pub const HEADER_SIZE: usize = 88;

/// The byte layout of a frame-process buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameProcessLayout {
    /// Offset of each stage's program array.
    pub array_offsets: [usize; STAGE_COUNT],
    /// Offset of the first frame set.
    pub frame_sets_offset: usize,
    /// Number of frame sets.
    pub batch_size: u32,
    /// Total size.
    pub size: usize,
}

impl FrameProcessLayout {
    /// Computes the layout for a batch size.
    pub fn new(batch_size: u32) -> Self {
        let mut array_offsets = [0; STAGE_COUNT];
        let mut offset = HEADER_SIZE;
        for stage in Stage::ALL {
            array_offsets[stage.index()] = offset;
            offset += array_size(stage);
        }

        let frame_sets_offset = offset;
        let batch_size = batch_size.max(1);
        let size = frame_sets_offset + batch_size as usize * PORT_SLOTS * 4;

        Self {
            array_offsets,
            frame_sets_offset,
            batch_size,
            size,
        }
    }

    /// Returns the offset of a stage's program array.
    pub fn array_offset(&self, stage: Stage) -> usize {
        self.array_offsets[stage.index()]
    }

    /// Returns the offset of a port address in a frame set.
    pub fn port_offset(&self, frame: u32, port: PortSlot) -> usize {
        self.frame_sets_offset + (frame as usize * PORT_SLOTS + port.index()) * 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::ChipVersion;
    use crate::cmd::CmdBuffer;
    use crate::instance::{InstanceProperty, ProcessingType, Profile, StabilizationType};
    use crate::iq::{self, ModuleBuffers, ModuleMask};

    fn execute(props: &InstanceProperty, input: &TuningInput) -> Vec<Box<dyn IqModule>> {
        let mut generic = CmdBuffer::new(BufferId::Generic, 1 << 14);
        let mut dmi_header = CmdBuffer::new(BufferId::DmiHeader, 1 << 12);
        let mut nps = CmdBuffer::new(BufferId::Nps, 1 << 14);
        let mut bufs = ModuleBuffers {
            generic: &mut generic,
            dmi_header: &mut dmi_header,
            nps: &mut nps,
        };

        let mut modules = iq::instantiate(props, ChipVersion::Titan480);
        for module in modules.iter_mut() {
            if input.is_enabled(module.kind()) {
                module.execute(input, &mut bufs).unwrap();
            }
        }

        modules
    }

    fn input(disabled: ModuleMask, num_passes: u32) -> TuningInput {
        TuningInput {
            request_id: 3,
            disabled,
            num_passes,
            aec_gain: 2.0,
            ..Default::default()
        }
    }

    #[test]
    fn stage_table() {
        for (idx, stage) in Stage::ALL.iter().enumerate() {
            assert_eq!(stage.index(), idx);
            assert!(!stage.slots().is_empty());
        }
        assert_eq!(Stage::PostLtm.slots().len(), 6);
    }

    #[test]
    fn program_count_is_slot_count() {
        let props = InstanceProperty::new()
            .stabilization(StabilizationType::MCTF)
            .num_passes(4);
        let masks = [
            ModuleMask::empty(),
            ModuleMask::GAMMA | ModuleMask::LTM,
            ModuleMask::all(),
            ModuleMask::TF | ModuleMask::ICA2 | ModuleMask::ASF,
        ];

        for disabled in masks {
            let input = input(disabled, 4);
            let modules = execute(&props, &input);
            for stage in Stage::ALL {
                let array = CdmProgramArray::build(stage, &modules, &input).unwrap();
                assert_eq!(array.num_programs(), stage.slots().len());
                assert!(array.active_count() <= array.num_programs());
                assert_eq!(array.encode().unwrap().len(), array.encoded_size());
            }
        }
    }

    #[test]
    fn tf_disabled_yields_skips() {
        let props = InstanceProperty::new()
            .processing(ProcessingType::MfnrBlend)
            .num_passes(4);
        let input = input(ModuleMask::TF, 4);
        let modules = execute(&props, &input);

        for pass in Pass::ALL {
            let array = CdmProgramArray::build(Stage::Tf(pass), &modules, &input).unwrap();
            assert_eq!(array.num_programs(), 1);
            assert_eq!(array.active_count(), 0);
            assert!(array.programs()[0].is_skip());

            let anr = CdmProgramArray::build(Stage::Anr(pass), &modules, &input).unwrap();
            assert_eq!(anr.active_count(), 1);
        }
    }

    #[test]
    fn inactive_passes_are_skipped() {
        let props = InstanceProperty::new().num_passes(2);
        let input = input(ModuleMask::empty(), 2);
        let modules = execute(&props, &input);

        let active: Vec<usize> = Pass::ALL
            .iter()
            .map(|pass| {
                CdmProgramArray::build(Stage::Anr(*pass), &modules, &input)
                    .unwrap()
                    .active_count()
            })
            .collect();
        assert_eq!(active, vec![1, 1, 0, 0]);
    }

    #[test]
    fn program_lengths() {
        let props = InstanceProperty::new();
        let input = input(ModuleMask::COLOR_CORRECT, 1);
        let modules = execute(&props, &input);

        let array = CdmProgramArray::build(Stage::PostLtm, &modules, &input).unwrap();
        let generic = array.programs()[0];
        let expected: usize = modules
            .iter()
            .filter(|m| POST_LTM_MODULES.contains(&m.kind()) && input.is_enabled(m.kind()))
            .map(|m| m.cmd_length())
            .sum();
        assert_eq!(generic.program_type, ProgramType::Generic);
        assert_eq!(generic.uid, ModuleKind::Gtm.uid());
        assert_eq!(generic.length as usize, expected - 1);

        let gamma = array.programs()[2];
        assert_eq!(gamma.program_type, ProgramType::Lut(ModuleKind::Gamma));
        assert_eq!(gamma.length, 3 * DMI_HEADER_DWORDS * 4 - 1);
        assert_eq!(gamma.target.map(|t| t.0), Some(BufferId::DmiHeader));
    }

    #[test]
    fn no_zoom_crop_skips_ica() {
        let props = InstanceProperty::new().profile(Profile::NoZoomCrop);
        let input = input(ModuleMask::empty(), 1);
        let modules = execute(&props, &input);

        let array = CdmProgramArray::build(Stage::Ica1, &modules, &input).unwrap();
        assert_eq!(array.active_count(), 0);
        assert_eq!(array.num_programs(), 2);
    }

    #[test]
    fn layout() {
        let layout = FrameProcessLayout::new(1);
        assert_eq!(layout.array_offset(Stage::PreLtm), HEADER_SIZE);
        assert_eq!(
            layout.array_offset(Stage::PostLtm),
            HEADER_SIZE + ARRAY_HEADER_SIZE + 2 * PROGRAM_SIZE
        );
        assert!(header::ARRAY_OFFSETS + 4 * STAGE_COUNT <= HEADER_SIZE);
        assert_eq!(layout.size, layout.frame_sets_offset + PORT_SLOTS * 4);

        let batched = FrameProcessLayout::new(4);
        assert_eq!(batched.array_offsets, layout.array_offsets);
        assert_eq!(
            batched.port_offset(1, PortSlot::Input),
            batched.frame_sets_offset + PORT_SLOTS * 4
        );
        assert_eq!(FrameProcessLayout::new(0).batch_size, 1);
        assert_eq!(program_addr_offset(1), 8 + 24 + 12);
    }
}
