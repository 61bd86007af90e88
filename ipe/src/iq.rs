// Copyright 2024 Google LLC
// SPDX-License-Identifier: MIT

//! IQ modules.
//!
//! An IQ module is one optional hardware processing block.  The compiler only cares about how
//! many register bytes and LUTs a module programs and where it wrote them; the tuning math that
//! decides the register values is opaque to it.
//!
//! [`MODULE_TABLE`] lists every module in register-programming order.  Modules are instantiated
//! from it per node, filtered by profile, path and hardware support.

use super::caps::ChipVersion;
use super::cmd::CmdBuffer;
use super::instance::{InstanceProperty, Profile};
use super::types::{Pass, RequestId, Result, PASS_COUNT};
use super::zoom::ZoomWindow;
use log::trace;

/// The kind of an IQ module.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ModuleKind {
    /// Geometric warp of the current frame.
    Ica1,
    /// Geometric warp of the reference frame.
    Ica2,
    /// Adaptive noise reduction, one program per pass.
    Anr,
    /// Temporal filter, one program per pass.
    Tf,
    /// Chromatic aberration correction.
    Cac,
    /// Color space transform.
    Cst,
    /// Local tone mapping.
    Ltm,
    /// Color correction.
    ColorCorrect,
    /// Global tone mapping.
    Gtm,
    /// Gamma.
    Gamma,
    /// 2D LUT.
    Lut2d,
    /// Chroma enhancement.
    ChromaEnhance,
    /// Chroma suppression.
    ChromaSuppress,
    /// Skin color enhancement.
    Sce,
    /// Adaptive spatial filter.
    Asf,
    /// Upscaler.
    Upscaler,
    /// Grain adder.
    GrainAdder,
}

impl ModuleKind {
    /// Returns the firmware uid of the module.
    pub fn uid(&self) -> u32 {
        *self as u32 + 1
    }

    /// Returns the bit of the module in a [`ModuleMask`].
    pub fn mask(&self) -> ModuleMask {
        ModuleMask::from_bits_truncate(1 << (*self as u32))
    }

    /// Returns true if the module programs one register block per downscale pass.
    pub fn is_per_pass(&self) -> bool {
        matches!(self, ModuleKind::Anr | ModuleKind::Tf)
    }

    fn register_base(&self) -> u32 {
        0x1000 * (*self as u32 + 1)
    }
}

bitflags::bitflags! {
    /// A set of IQ modules.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct ModuleMask: u32 {
        /// ICA1.
        const ICA1 = 1 << 0;
        /// ICA2.
        const ICA2 = 1 << 1;
        /// ANR.
        const ANR = 1 << 2;
        /// TF.
        const TF = 1 << 3;
        /// CAC.
        const CAC = 1 << 4;
        /// CST.
        const CST = 1 << 5;
        /// LTM.
        const LTM = 1 << 6;
        /// Color correction.
        const COLOR_CORRECT = 1 << 7;
        /// GTM.
        const GTM = 1 << 8;
        /// Gamma.
        const GAMMA = 1 << 9;
        /// 2D LUT.
        const LUT2D = 1 << 10;
        /// Chroma enhancement.
        const CHROMA_ENHANCE = 1 << 11;
        /// Chroma suppression.
        const CHROMA_SUPPRESS = 1 << 12;
        /// SCE.
        const SCE = 1 << 13;
        /// ASF.
        const ASF = 1 << 14;
        /// Upscaler.
        const UPSCALER = 1 << 15;
        /// Grain adder.
        const GRAIN_ADDER = 1 << 16;
    }
}

bitflags::bitflags! {
    /// The hardware revisions that implement a module.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct HwSupport: u32 {
        /// Titan 150 and 160.
        const TITAN150 = 1 << 0;
        /// Titan 170.
        const TITAN170 = 1 << 1;
        /// Titan 175.
        const TITAN175 = 1 << 2;
        /// Titan 480.
        const TITAN480 = 1 << 3;
    }
}

impl From<ChipVersion> for HwSupport {
    fn from(chip: ChipVersion) -> Self {
        match chip {
            ChipVersion::Titan150 | ChipVersion::Titan160 => HwSupport::TITAN150,
            ChipVersion::Titan170 => HwSupport::TITAN170,
            ChipVersion::Titan175 => HwSupport::TITAN175,
            ChipVersion::Titan480 => HwSupport::TITAN480,
        }
    }
}

/// Which logical path a module sits on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModulePath {
    /// The current-frame path.
    Input,
    /// The reference-frame path.
    Reference,
}

/// The number of dwords of a CDM DMI header.
pub const DMI_HEADER_DWORDS: u32 = 3;

const CDM_OPCODE_REG_RANDOM: u32 = 0x3;
const CDM_OPCODE_DMI32: u32 = 0x6;
const LUT_ENTRY_BYTES: u32 = 256;
const ICA_WINDOW_REGS: usize = 8;

/// The input an IQ module programs its registers from.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TuningInput {
    /// The request being compiled.
    pub request_id: RequestId,
    /// Modules disabled for this request.
    pub disabled: ModuleMask,
    /// Number of active downscale passes.
    pub num_passes: u32,
    /// The AEC gain of the previous request.
    pub aec_gain: f32,
    /// The current-frame warp window.
    pub ica1: ZoomWindow,
    /// The reference-frame warp window.  Zeroed when there is no reference.
    pub ica2: ZoomWindow,
    /// Upstream scaler ratio.
    pub pre_scale: f64,
    /// Crop width over output width.
    pub post_scale: f64,
}

impl TuningInput {
    /// Returns true if `kind` is enabled for this request.
    pub fn is_enabled(&self, kind: ModuleKind) -> bool {
        !self.disabled.contains(kind.mask())
    }
}

/// Where a module wrote its programs for the current request.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ModuleData {
    /// Offset of the register program in the generic buffer.
    pub reg_offset: Option<usize>,
    /// Offset of each pass program in the NPS buffer.
    pub per_pass_offsets: [Option<usize>; PASS_COUNT],
    /// Byte length of one register program.
    pub cmd_length: usize,
    /// Offset of the first DMI header in the DMI header buffer.
    pub lut_offset: Option<usize>,
}

/// The shared command buffers modules write into.
pub struct ModuleBuffers<'a> {
    /// Register programs.
    pub generic: &'a mut CmdBuffer,
    /// DMI headers.
    pub dmi_header: &'a mut CmdBuffer,
    /// Per-pass programs.
    pub nps: &'a mut CmdBuffer,
}

/// The capability interface of an IQ module.
pub trait IqModule: Send {
    /// Returns the module kind.
    fn kind(&self) -> ModuleKind;

    /// Returns the byte length of one register program.
    fn cmd_length(&self) -> usize;

    /// Returns the number of LUTs the module programs.
    fn lut_count(&self) -> u32;

    /// Returns the offset of the module's DMI headers from the last execution.
    fn lut_offset(&self) -> Option<usize> {
        self.module_data().lut_offset
    }

    /// Writes the module's programs for a request.
    fn execute(&mut self, input: &TuningInput, bufs: &mut ModuleBuffers) -> Result<()>;

    /// Returns where the last execution wrote its programs.
    fn module_data(&self) -> ModuleData;
}

/// The static description of a module.
pub struct ModuleDescriptor {
    /// The module kind.
    pub kind: ModuleKind,
    /// The logical path.
    pub path: ModulePath,
    /// Hardware revisions implementing the module.
    pub support: HwSupport,
    /// Number of registers programmed per program.
    pub reg_count: u32,
    /// Number of LUTs programmed.
    pub lut_count: u32,
    /// Creates an instance of the module.
    pub create: fn(&'static ModuleDescriptor) -> Box<dyn IqModule>,
}

const ALL_CHIPS: HwSupport = HwSupport::all();
const TITAN17X: HwSupport = HwSupport::TITAN170
    .union(HwSupport::TITAN175)
    .union(HwSupport::TITAN480);
const TITAN175_UP: HwSupport = HwSupport::TITAN175.union(HwSupport::TITAN480);

macro_rules! module {
    ($kind:ident, $path:ident, $support:expr, $regs:literal, $luts:literal) => {
        ModuleDescriptor {
            kind: ModuleKind::$kind,
            path: ModulePath::$path,
            support: $support,
            reg_count: $regs,
            lut_count: $luts,
            create: RegisterBlock::create,
        }
    };
}

/// Every IQ module, in register-programming order.
pub static MODULE_TABLE: [ModuleDescriptor; 17] = [
    module!(Ica1, Input, ALL_CHIPS, 24, 3),
    module!(Ica2, Reference, TITAN17X, 24, 3),
    module!(Anr, Input, ALL_CHIPS, 48, 0),
    module!(Tf, Input, ALL_CHIPS, 32, 0),
    module!(Cac, Input, TITAN17X, 8, 0),
    module!(Cst, Input, ALL_CHIPS, 12, 0),
    module!(Ltm, Input, ALL_CHIPS, 16, 6),
    module!(ColorCorrect, Input, ALL_CHIPS, 10, 0),
    module!(Gtm, Input, ALL_CHIPS, 4, 1),
    module!(Gamma, Input, ALL_CHIPS, 2, 3),
    module!(Lut2d, Input, TITAN17X, 6, 8),
    module!(ChromaEnhance, Input, ALL_CHIPS, 6, 0),
    module!(ChromaSuppress, Input, ALL_CHIPS, 6, 0),
    module!(Sce, Input, ALL_CHIPS, 8, 0),
    module!(Asf, Input, ALL_CHIPS, 40, 7),
    module!(Upscaler, Input, ALL_CHIPS, 12, 0),
    module!(GrainAdder, Input, TITAN175_UP, 4, 3),
];

/// Returns the descriptor of a module kind.
pub fn descriptor(kind: ModuleKind) -> &'static ModuleDescriptor {
    &MODULE_TABLE[kind as usize]
}

fn profile_wants(profile: Profile, kind: ModuleKind) -> bool {
    use ModuleKind::*;

    match profile {
        Profile::Default | Profile::Hdr10 => true,
        Profile::Nps => matches!(kind, Ica1 | Ica2 | Anr | Tf),
        Profile::Pps => !matches!(kind, Anr | Tf | Ica2),
        Profile::Scale => kind == Upscaler,
        Profile::NoZoomCrop => kind != Ica1,
    }
}

/// Instantiates the modules a node needs, in register-programming order.
pub fn instantiate(props: &InstanceProperty, chip: ChipVersion) -> Vec<Box<dyn IqModule>> {
    let hw = HwSupport::from(chip);
    let loopback = props.uses_loopback();

    MODULE_TABLE
        .iter()
        .filter(|desc| desc.support.contains(hw))
        .filter(|desc| {
            loopback || (desc.path != ModulePath::Reference && desc.kind != ModuleKind::Tf)
        })
        .filter(|desc| profile_wants(props.profile, desc.kind))
        .map(|desc| (desc.create)(desc))
        .collect()
}

/// A module that programs a fixed register block and an optional set of LUTs.
///
/// Register values are derived from the tuning input; the derivation stands in for the tuning
/// math of the real block.
pub struct RegisterBlock {
    desc: &'static ModuleDescriptor,
    data: ModuleData,
}

impl RegisterBlock {
    fn create(desc: &'static ModuleDescriptor) -> Box<dyn IqModule> {
        Box::new(Self {
            desc,
            data: ModuleData::default(),
        })
    }

    fn register_program(&self, input: &TuningInput, pass: u32) -> Vec<u32> {
        let kind = self.desc.kind;
        let gain = (input.aec_gain.max(0.0) * 256.0) as u32;
        let window = match kind {
            ModuleKind::Ica1 => window_registers(&input.ica1, input),
            ModuleKind::Ica2 => window_registers(&input.ica2, input),
            _ => Vec::new(),
        };

        let mut dwords = Vec::with_capacity(1 + 2 * self.desc.reg_count as usize);
        dwords.push((CDM_OPCODE_REG_RANDOM << 24) | self.desc.reg_count);
        for reg in 0..self.desc.reg_count {
            dwords.push(kind.register_base() + 4 * reg);
            dwords.push(match window.get(reg as usize) {
                Some(val) => *val,
                None => gain.wrapping_mul(reg + 1) ^ (pass << 16) ^ kind.uid(),
            });
        }

        dwords
    }

    fn dmi_headers(&self) -> Vec<u32> {
        let kind = self.desc.kind;

        (0..self.desc.lut_count)
            .flat_map(|lut| {
                [
                    (CDM_OPCODE_DMI32 << 24) | (LUT_ENTRY_BYTES - 1),
                    lut * LUT_ENTRY_BYTES,
                    (kind.uid() << 8) | lut,
                ]
            })
            .collect()
    }
}

fn q16(val: f64) -> u32 {
    (val.max(0.0) * 65536.0) as u32
}

// crop, full frame and Q16 scale ratios; a zeroed window disables the warp
fn window_registers(window: &ZoomWindow, input: &TuningInput) -> Vec<u32> {
    if window.is_zeroed() {
        return vec![0; ICA_WINDOW_REGS];
    }

    vec![
        window.rect.left,
        window.rect.top,
        window.rect.width,
        window.rect.height,
        window.full.width,
        window.full.height,
        q16(input.pre_scale),
        q16(input.post_scale),
    ]
}

impl IqModule for RegisterBlock {
    fn kind(&self) -> ModuleKind {
        self.desc.kind
    }

    fn cmd_length(&self) -> usize {
        (1 + 2 * self.desc.reg_count as usize) * 4
    }

    fn lut_count(&self) -> u32 {
        self.desc.lut_count
    }

    fn execute(&mut self, input: &TuningInput, bufs: &mut ModuleBuffers) -> Result<()> {
        let mut data = ModuleData {
            cmd_length: self.cmd_length(),
            ..Default::default()
        };

        if self.desc.kind.is_per_pass() {
            for pass in Pass::ALL.iter().take(input.num_passes as usize) {
                let program = self.register_program(input, pass.index() as u32);
                data.per_pass_offsets[pass.index()] = Some(bufs.nps.write_dwords(&program)?);
            }
        } else {
            let program = self.register_program(input, 0);
            data.reg_offset = Some(bufs.generic.write_dwords(&program)?);
        }

        if self.desc.lut_count > 0 {
            data.lut_offset = Some(bufs.dmi_header.write_dwords(&self.dmi_headers())?);
        }

        trace!(
            "{:?} programmed {} bytes and {} LUTs for request {}",
            self.desc.kind,
            data.cmd_length,
            self.desc.lut_count,
            input.request_id
        );
        self.data = data;

        Ok(())
    }

    fn module_data(&self) -> ModuleData {
        self.data
    }
}
