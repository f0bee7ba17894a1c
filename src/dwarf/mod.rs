mod cfa;
mod error;
mod memory;
mod op;
mod section;

pub use error::{DwarfErrorCode, DwarfErrorData};
pub use section::DwarfSection;

pub(crate) use cfa::DwarfCfa;
pub(crate) use op::DwarfOp;

use std::collections::HashMap;

/// Virtual column holding the CFA rule in a location table.
pub(crate) const CFA_REG: u32 = 1 << 30;

/// Pseudo register number managed runtimes use to publish the DEX PC
/// through CFI (`' DEX'`). Values assigned to it land in `Regs::dex_pc`.
pub(crate) const DEX_PC_REG: u32 = 0x2044_4558;

/// One register's location in the caller frame. A register with no entry
/// in the table keeps its current value ("same value").
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum DwarfLocation {
    Undefined,
    /// Memory at CFA + n.
    Offset(i64),
    /// The value CFA + n itself.
    ValOffset(i64),
    /// Value of another register plus an offset. Also the encoding of the
    /// CFA rule, where the offset is meaningful; plain DW_CFA_register
    /// rules carry offset 0.
    Register { reg: u32, offset: i64 },
    /// DWARF expression computing an address to load from. The bytes live
    /// at `[end_offset - length, end_offset)` in the unwind section.
    Expression { length: u64, end_offset: u64 },
    /// DWARF expression computing the value directly.
    ValExpression { length: u64, end_offset: u64 },
}

/// The location table produced for one PC: the CFA rule plus per-register
/// locations, valid over `[pc_start, pc_end)`.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct DwarfLocations {
    pub pc_start: u64,
    pub pc_end: u64,
    pub regs: HashMap<u32, DwarfLocation>,
}

/// A parsed Common Information Entry.
#[derive(Clone, Debug, Default)]
pub(crate) struct DwarfCie {
    pub version: u8,
    pub fde_address_encoding: u8,
    pub lsda_encoding: u8,
    pub segment_size: u8,
    pub augmentation_has_data: bool,
    pub is_signal_frame: bool,
    pub cfa_instructions_offset: u64,
    pub cfa_instructions_end: u64,
    pub code_alignment_factor: u64,
    pub data_alignment_factor: i64,
    pub return_address_register: u64,
}

/// A parsed Frame Description Entry covering `[pc_start, pc_end)`.
#[derive(Clone, Debug, Default)]
pub(crate) struct DwarfFde {
    pub cie_offset: u64,
    pub cfa_instructions_offset: u64,
    pub cfa_instructions_end: u64,
    pub pc_start: u64,
    pub pc_end: u64,
    pub lsda_address: u64,
}
