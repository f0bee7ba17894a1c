use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::memory::Memory;
use crate::regs::Regs;

use super::memory::{
    DwarfMemory, DW_EH_PE_ABSPTR, DW_EH_PE_OMIT, DW_EH_PE_SDATA4, DW_EH_PE_UDATA4,
    DW_EH_PE_ULEB128,
};
use super::{
    DwarfCfa, DwarfCie, DwarfErrorCode, DwarfErrorData, DwarfFde, DwarfLocation, DwarfLocations,
    DwarfOp, CFA_REG, DEX_PC_REG,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionKind {
    EhFrame,
    DebugFrame,
}

/// A parsed `.eh_frame_hdr` binary-search table.
struct EhFrameHdrTable {
    table_encoding: u8,
    /// File offset of the first table entry.
    entries_offset: u64,
    /// Base for datarel-encoded table values: the header's vaddr.
    data_offset: i64,
    fde_count: u64,
}

/// One unwind section (`.eh_frame` or `.debug_frame`), with caches for
/// parsed CIEs and FDEs and a PC index that comes either from an
/// `.eh_frame_hdr` table or from a lazy linear walk of the section.
///
/// All offsets are file offsets within the ELF memory; `section_bias`
/// (sh_addr - sh_offset) converts them into the virtual address space
/// that relative PCs live in.
pub struct DwarfSection {
    memory: Arc<dyn Memory>,
    kind: SectionKind,
    big_endian: bool,
    address_size: u8,
    entries_offset: u64,
    entries_end: u64,
    section_bias: i64,
    hdr: Option<EhFrameHdrTable>,
    cie_entries: Mutex<HashMap<u64, Arc<DwarfCie>>>,
    fde_entries: Mutex<HashMap<u64, Arc<DwarfFde>>>,
    cie_loc_regs: Mutex<HashMap<u64, Arc<DwarfLocations>>>,
    /// (pc_start, pc_end, fde_offset) sorted by pc_start; built on first
    /// use when no header table exists.
    linear_index: Mutex<Option<Arc<Vec<(u64, u64, u64)>>>>,
    last_error: Mutex<DwarfErrorData>,
}

impl DwarfSection {
    pub fn new_eh_frame(
        memory: Arc<dyn Memory>,
        offset: u64,
        size: u64,
        section_bias: i64,
        big_endian: bool,
        address_size: u8,
    ) -> DwarfSection {
        DwarfSection {
            memory,
            kind: SectionKind::EhFrame,
            big_endian,
            address_size,
            entries_offset: offset,
            entries_end: offset + size,
            section_bias,
            hdr: None,
            cie_entries: Mutex::new(HashMap::new()),
            fde_entries: Mutex::new(HashMap::new()),
            cie_loc_regs: Mutex::new(HashMap::new()),
            linear_index: Mutex::new(None),
            last_error: Mutex::new(DwarfErrorData::default()),
        }
    }

    /// Build an `.eh_frame` section driven by the `.eh_frame_hdr`
    /// binary-search table. Returns `None` when the header is malformed
    /// or advertises no FDEs, in which case the caller should fall back
    /// to a plain [`new_eh_frame`](DwarfSection::new_eh_frame) section.
    #[allow(clippy::too_many_arguments)]
    pub fn new_eh_frame_with_hdr(
        memory: Arc<dyn Memory>,
        hdr_offset: u64,
        hdr_size: u64,
        hdr_section_bias: i64,
        eh_frame_offset: u64,
        eh_frame_size: u64,
        eh_frame_section_bias: i64,
        big_endian: bool,
        address_size: u8,
    ) -> Option<DwarfSection> {
        let mut cursor = DwarfMemory::new(&memory, big_endian, address_size);
        cursor.set_cur_offset(hdr_offset);
        let hdr_vaddr = (hdr_offset as i64).wrapping_add(hdr_section_bias);
        cursor.set_data_offset(hdr_vaddr);
        cursor.set_pc_offset(hdr_section_bias);

        let version = cursor.read_u8()?;
        if version != 1 {
            return None;
        }
        let eh_frame_ptr_encoding = cursor.read_u8()?;
        let fde_count_encoding = cursor.read_u8()?;
        let table_encoding = cursor.read_u8()?;
        if fde_count_encoding == DW_EH_PE_OMIT || table_encoding == DW_EH_PE_OMIT {
            return None;
        }
        // Binary search needs fixed-size table entries.
        encoded_size(table_encoding, address_size)?;
        // The eh_frame pointer is not needed for the table walk, but it
        // must still be decoded to advance past it.
        if eh_frame_ptr_encoding != DW_EH_PE_OMIT {
            cursor.read_encoded(eh_frame_ptr_encoding)?;
        }
        let fde_count = cursor.read_encoded(fde_count_encoding)?;
        if fde_count == 0 {
            return None;
        }
        let entries_offset = cursor.cur_offset();
        if entries_offset >= hdr_offset + hdr_size {
            return None;
        }

        Some(DwarfSection {
            memory,
            kind: SectionKind::EhFrame,
            big_endian,
            address_size,
            entries_offset: eh_frame_offset,
            entries_end: eh_frame_offset + eh_frame_size,
            section_bias: eh_frame_section_bias,
            hdr: Some(EhFrameHdrTable {
                table_encoding,
                entries_offset,
                data_offset: hdr_vaddr,
                fde_count,
            }),
            cie_entries: Mutex::new(HashMap::new()),
            fde_entries: Mutex::new(HashMap::new()),
            cie_loc_regs: Mutex::new(HashMap::new()),
            linear_index: Mutex::new(None),
            last_error: Mutex::new(DwarfErrorData::default()),
        })
    }

    pub fn new_debug_frame(
        memory: Arc<dyn Memory>,
        offset: u64,
        size: u64,
        section_bias: i64,
        big_endian: bool,
        address_size: u8,
    ) -> DwarfSection {
        DwarfSection {
            memory,
            kind: SectionKind::DebugFrame,
            big_endian,
            address_size,
            entries_offset: offset,
            entries_end: offset + size,
            section_bias,
            hdr: None,
            cie_entries: Mutex::new(HashMap::new()),
            fde_entries: Mutex::new(HashMap::new()),
            cie_loc_regs: Mutex::new(HashMap::new()),
            linear_index: Mutex::new(None),
            last_error: Mutex::new(DwarfErrorData::default()),
        }
    }

    pub fn last_error(&self) -> DwarfErrorData {
        *self.last_error.lock().unwrap()
    }

    fn set_last_error(&self, code: DwarfErrorCode, address: u64) {
        *self.last_error.lock().unwrap() = DwarfErrorData::new(code, address);
    }

    fn cursor(&self) -> DwarfMemory<'_> {
        DwarfMemory::new(&self.memory, self.big_endian, self.address_size)
    }

    /// Unwind one frame: find the FDE covering `pc`, build its location
    /// table and apply it. On success the registers describe the caller;
    /// `finished` is set when this was the outermost frame.
    pub fn step(
        &self,
        pc: u64,
        regs: &mut Regs,
        process_memory: &dyn Memory,
        finished: &mut bool,
        is_signal_frame: &mut bool,
    ) -> bool {
        let Some(fde) = self.fde_from_pc(pc) else {
            return false;
        };
        let Some(cie) = self.cie_from_offset(fde.cie_offset) else {
            return false;
        };
        *is_signal_frame = cie.is_signal_frame;

        let mut loc_regs = DwarfLocations::default();
        if !self.location_info(&cie, &fde, pc, &mut loc_regs) {
            return false;
        }
        self.eval(&cie, &loc_regs, process_memory, regs, finished)
    }

    /// True when any FDE of this section covers `pc`.
    pub fn covers_pc(&self, pc: u64) -> bool {
        self.fde_from_pc(pc).is_some()
    }

    fn fde_from_pc(&self, pc: u64) -> Option<Arc<DwarfFde>> {
        let offset = match &self.hdr {
            Some(hdr) => self.fde_offset_from_hdr(hdr, pc)?,
            None => self.fde_offset_from_index(pc)?,
        };
        let fde = self.fde_from_offset(offset)?;
        // The range is half open: pc_start is covered, pc_end is not.
        if pc < fde.pc_start || pc >= fde.pc_end {
            self.set_last_error(DwarfErrorCode::None, 0);
            return None;
        }
        Some(fde)
    }

    /// Binary search of the `.eh_frame_hdr` table. Each entry is a pair of
    /// encoded values (initial PC, FDE pointer), sorted by initial PC.
    fn fde_offset_from_hdr(&self, hdr: &EhFrameHdrTable, pc: u64) -> Option<u64> {
        let read_entry = |index: u64| -> Option<(u64, u64)> {
            let mut cursor = self.cursor();
            cursor.set_data_offset(hdr.data_offset);
            cursor.set_pc_offset(self.section_bias);
            let entry_size = 2 * encoded_size(hdr.table_encoding, self.address_size)? as u64;
            cursor.set_cur_offset(hdr.entries_offset + index * entry_size);
            let pc_value = cursor.read_encoded(hdr.table_encoding)?;
            let fde_value = cursor.read_encoded(hdr.table_encoding)?;
            Some((pc_value, fde_value))
        };

        let mut first = 0u64;
        let mut last = hdr.fde_count;
        while first < last {
            let current = (first + last) / 2;
            let (entry_pc, entry_fde) = match read_entry(current) {
                Some(entry) => entry,
                None => {
                    self.set_last_error(DwarfErrorCode::MemoryInvalid, hdr.entries_offset);
                    return None;
                }
            };
            if pc == entry_pc {
                return Some(vaddr_to_offset(entry_fde, self.section_bias));
            }
            if pc < entry_pc {
                last = current;
            } else {
                first = current + 1;
            }
        }
        if first == 0 {
            self.set_last_error(DwarfErrorCode::None, 0);
            return None;
        }
        let (_, entry_fde) = read_entry(first - 1)?;
        Some(vaddr_to_offset(entry_fde, self.section_bias))
    }

    /// Linear index lookup, building the index on first use.
    fn fde_offset_from_index(&self, pc: u64) -> Option<u64> {
        let index = {
            let mut guard = self.linear_index.lock().unwrap();
            if guard.is_none() {
                *guard = Some(Arc::new(self.build_linear_index()?));
            }
            guard.as_ref().unwrap().clone()
        };
        if index.is_empty() {
            self.set_last_error(DwarfErrorCode::NoFdes, 0);
            return None;
        }
        let pos = index.partition_point(|(pc_start, _, _)| *pc_start <= pc);
        if pos == 0 {
            return None;
        }
        let (_, pc_end, fde_offset) = index[pos - 1];
        (pc < pc_end).then_some(fde_offset)
    }

    /// Walk every entry in the section, collecting FDE ranges. Zero-length
    /// FDEs are dropped; overlapping FDEs make the section malformed.
    fn build_linear_index(&self) -> Option<Vec<(u64, u64, u64)>> {
        let mut cursor = self.cursor();
        cursor.set_cur_offset(self.entries_offset);
        let mut entries = Vec::new();
        while cursor.cur_offset() + 4 <= self.entries_end {
            let entry_offset = cursor.cur_offset();
            let Some(value32) = cursor.read_u32() else {
                self.set_last_error(DwarfErrorCode::MemoryInvalid, entry_offset);
                return None;
            };
            // A zero length marks the end of eh_frame data.
            if value32 == 0 {
                break;
            }
            let (length, id_size) = if value32 == u32::MAX {
                (cursor.read_u64()?, 8u64)
            } else {
                (value32 as u64, 4u64)
            };
            let next_offset = cursor.cur_offset() + length;
            let id = if id_size == 8 {
                cursor.read_u64()?
            } else {
                cursor.read_u32()? as u64
            };
            if !self.is_cie_id(id, id_size) {
                // An FDE; parse it through the cache for its PC range.
                if let Some(fde) = self.fde_from_offset(entry_offset) {
                    if fde.pc_start < fde.pc_end {
                        entries.push((fde.pc_start, fde.pc_end, entry_offset));
                    }
                } else {
                    return None;
                }
            }
            cursor.set_cur_offset(next_offset);
        }
        entries.sort_unstable_by_key(|(pc_start, _, _)| *pc_start);
        for pair in entries.windows(2) {
            if pair[1].0 < pair[0].1 {
                // Overlapping FDEs make the whole section unusable.
                self.set_last_error(DwarfErrorCode::IllegalValue, pair[1].2);
                return None;
            }
        }
        Some(entries)
    }

    fn is_cie_id(&self, id: u64, id_size: u64) -> bool {
        match self.kind {
            SectionKind::EhFrame => id == 0,
            SectionKind::DebugFrame => {
                if id_size == 8 {
                    id == u64::MAX
                } else {
                    id == u32::MAX as u64
                }
            }
        }
    }

    pub(crate) fn cie_from_offset(&self, offset: u64) -> Option<Arc<DwarfCie>> {
        if let Some(cie) = self.cie_entries.lock().unwrap().get(&offset) {
            return Some(cie.clone());
        }
        let cie = Arc::new(self.parse_cie(offset)?);
        self.cie_entries
            .lock()
            .unwrap()
            .insert(offset, cie.clone());
        Some(cie)
    }

    fn parse_cie(&self, offset: u64) -> Option<DwarfCie> {
        let mut cursor = self.cursor();
        cursor.set_cur_offset(offset);
        let value32 = cursor.read_u32().or_else(|| {
            self.set_last_error(DwarfErrorCode::MemoryInvalid, offset);
            None
        })?;
        let (length, id_size) = if value32 == u32::MAX {
            (cursor.read_u64()?, 8)
        } else {
            (value32 as u64, 4)
        };
        let cfa_instructions_end = cursor.cur_offset() + length;

        let id = if id_size == 8 {
            cursor.read_u64()?
        } else {
            cursor.read_u32()? as u64
        };
        if !self.is_cie_id(id, id_size) {
            self.set_last_error(DwarfErrorCode::IllegalValue, offset);
            return None;
        }

        let mut cie = DwarfCie {
            cfa_instructions_end,
            fde_address_encoding: DW_EH_PE_ABSPTR,
            lsda_encoding: DW_EH_PE_OMIT,
            ..Default::default()
        };
        cie.version = cursor.read_u8()?;
        if !matches!(cie.version, 1 | 3 | 4 | 5) {
            self.set_last_error(DwarfErrorCode::UnsupportedVersion, offset);
            return None;
        }
        let augmentation = cursor.read_cstring()?;
        if matches!(cie.version, 4 | 5) {
            // Address and segment size bytes.
            let _address_size = cursor.read_u8()?;
            cie.segment_size = cursor.read_u8()?;
        }
        cie.code_alignment_factor = cursor.read_uleb128()?;
        cie.data_alignment_factor = cursor.read_sleb128()?;
        cie.return_address_register = if cie.version == 1 {
            cursor.read_u8()? as u64
        } else {
            cursor.read_uleb128()?
        };

        if augmentation.first() == Some(&b'z') {
            cie.augmentation_has_data = true;
            let aug_length = cursor.read_uleb128()?;
            let aug_end = cursor.cur_offset() + aug_length;
            for &ch in &augmentation[1..] {
                match ch {
                    b'L' => cie.lsda_encoding = cursor.read_u8()?,
                    b'P' => {
                        let encoding = cursor.read_u8()?;
                        // The personality routine is not used for
                        // unwinding; decode it only to skip it.
                        cursor.set_pc_offset(self.section_bias);
                        cursor.read_encoded(encoding)?;
                    }
                    b'R' => cie.fde_address_encoding = cursor.read_u8()?,
                    b'S' => cie.is_signal_frame = true,
                    _ => break,
                }
            }
            cursor.set_cur_offset(aug_end);
        }
        cie.cfa_instructions_offset = cursor.cur_offset();
        Some(cie)
    }

    pub(crate) fn fde_from_offset(&self, offset: u64) -> Option<Arc<DwarfFde>> {
        if let Some(fde) = self.fde_entries.lock().unwrap().get(&offset) {
            return Some(fde.clone());
        }
        let fde = Arc::new(self.parse_fde(offset)?);
        self.fde_entries
            .lock()
            .unwrap()
            .insert(offset, fde.clone());
        Some(fde)
    }

    fn parse_fde(&self, offset: u64) -> Option<DwarfFde> {
        let mut cursor = self.cursor();
        cursor.set_cur_offset(offset);
        let value32 = cursor.read_u32().or_else(|| {
            self.set_last_error(DwarfErrorCode::MemoryInvalid, offset);
            None
        })?;
        let (length, id_size) = if value32 == u32::MAX {
            (cursor.read_u64()?, 8u64)
        } else {
            (value32 as u64, 4u64)
        };
        let cfa_instructions_end = cursor.cur_offset() + length;

        let id_field_offset = cursor.cur_offset();
        let id = if id_size == 8 {
            cursor.read_u64()?
        } else {
            cursor.read_u32()? as u64
        };
        if self.is_cie_id(id, id_size) {
            self.set_last_error(DwarfErrorCode::IllegalValue, offset);
            return None;
        }
        let cie_offset = match self.kind {
            // In eh_frame the CIE pointer is relative to this field.
            SectionKind::EhFrame => id_field_offset.checked_sub(id)?,
            SectionKind::DebugFrame => self.entries_offset.checked_add(id)?,
        };
        let cie = self.cie_from_offset(cie_offset)?;
        if cie.segment_size != 0 {
            // Segmented targets are not supported.
            self.set_last_error(DwarfErrorCode::NotImplemented, offset);
            return None;
        }

        cursor.set_pc_offset(self.section_bias);
        let pc_start = cursor.read_encoded(cie.fde_address_encoding)?;
        // The range field uses the value format of the encoding without
        // any relative base.
        let pc_length = cursor.read_encoded(cie.fde_address_encoding & 0x0f)?;

        let mut fde = DwarfFde {
            cie_offset,
            pc_start,
            pc_end: pc_start.wrapping_add(pc_length),
            ..Default::default()
        };
        if cie.augmentation_has_data {
            let aug_length = cursor.read_uleb128()?;
            let aug_end = cursor.cur_offset() + aug_length;
            if cie.lsda_encoding != DW_EH_PE_OMIT {
                if let Some(lsda) = cursor.read_encoded(cie.lsda_encoding) {
                    fde.lsda_address = lsda;
                }
            }
            cursor.set_cur_offset(aug_end);
        }
        fde.cfa_instructions_offset = cursor.cur_offset();
        fde.cfa_instructions_end = cfa_instructions_end;
        Some(fde)
    }

    /// Build the location table for `pc`, running the CIE's initial
    /// instructions (cached per CIE) and then the FDE program.
    fn location_info(
        &self,
        cie: &Arc<DwarfCie>,
        fde: &DwarfFde,
        pc: u64,
        loc_regs: &mut DwarfLocations,
    ) -> bool {
        let initial = {
            let cached = self
                .cie_loc_regs
                .lock()
                .unwrap()
                .get(&fde.cie_offset)
                .cloned();
            match cached {
                Some(initial) => initial,
                None => {
                    let mut initial = DwarfLocations::default();
                    let mut cfa = DwarfCfa::new(self.cursor(), cie, fde, None);
                    // Initial instructions are row-independent; run them
                    // all so the cached table fits every PC.
                    if !cfa.get_location_info(
                        u64::MAX,
                        cie.cfa_instructions_offset,
                        cie.cfa_instructions_end,
                        &mut initial,
                    ) {
                        *self.last_error.lock().unwrap() = cfa.last_error();
                        return false;
                    }
                    let initial = Arc::new(initial);
                    self.cie_loc_regs
                        .lock()
                        .unwrap()
                        .insert(fde.cie_offset, initial.clone());
                    initial
                }
            }
        };

        loc_regs.regs = initial.regs.clone();
        let mut cfa = DwarfCfa::new(self.cursor(), cie, fde, Some(&initial));
        if !cfa.get_location_info(
            pc,
            fde.cfa_instructions_offset,
            fde.cfa_instructions_end,
            loc_regs,
        ) {
            *self.last_error.lock().unwrap() = cfa.last_error();
            return false;
        }
        true
    }

    /// Apply a location table: compute the CFA, evaluate every register
    /// rule against the current register values, then install the caller's
    /// PC (from the return-address register) and SP (the CFA).
    fn eval(
        &self,
        cie: &DwarfCie,
        loc_regs: &DwarfLocations,
        process_memory: &dyn Memory,
        regs: &mut Regs,
        finished: &mut bool,
    ) -> bool {
        let total_regs = regs.total_regs() as u64;
        if cie.return_address_register >= total_regs {
            self.set_last_error(DwarfErrorCode::IllegalValue, 0);
            return false;
        }
        let Some(cfa_loc) = loc_regs.regs.get(&CFA_REG) else {
            self.set_last_error(DwarfErrorCode::CfaNotDefined, 0);
            return false;
        };

        regs.set_dex_pc(0);
        // Rules read the callee's register values, not values already
        // overwritten by other rules.
        let prev_regs = regs.clone();

        let cfa = match cfa_loc {
            DwarfLocation::Register { reg, offset } => {
                let Some(value) = prev_regs.get(*reg).filter(|_| (*reg as u64) < total_regs)
                else {
                    self.set_last_error(DwarfErrorCode::IllegalValue, 0);
                    return false;
                };
                self.mask(value.wrapping_add(*offset as u64))
            }
            DwarfLocation::ValExpression { length, end_offset } => {
                let Some(value) =
                    self.eval_expression(*length, *end_offset, process_memory, &prev_regs)
                else {
                    return false;
                };
                value
            }
            _ => {
                self.set_last_error(DwarfErrorCode::IllegalValue, 0);
                return false;
            }
        };

        let mut return_address_undefined = false;
        for (&reg, loc) in &loc_regs.regs {
            if reg == CFA_REG {
                continue;
            }
            let is_pseudo = reg as u64 >= total_regs;
            if is_pseudo && reg != DEX_PC_REG {
                continue;
            }
            let value = match loc {
                DwarfLocation::Undefined => {
                    if reg as u64 == cie.return_address_register {
                        return_address_undefined = true;
                    }
                    continue;
                }
                DwarfLocation::Offset(offset) => {
                    let addr = self.mask(cfa.wrapping_add(*offset as u64));
                    let Some(value) = self.read_word(process_memory, addr) else {
                        self.set_last_error(DwarfErrorCode::MemoryInvalid, addr);
                        return false;
                    };
                    value
                }
                DwarfLocation::ValOffset(offset) => self.mask(cfa.wrapping_add(*offset as u64)),
                DwarfLocation::Register { reg: src, offset } => {
                    let Some(value) =
                        prev_regs.get(*src).filter(|_| (*src as u64) < total_regs)
                    else {
                        self.set_last_error(DwarfErrorCode::IllegalValue, 0);
                        return false;
                    };
                    self.mask(value.wrapping_add(*offset as u64))
                }
                DwarfLocation::Expression { length, end_offset } => {
                    let Some(addr) =
                        self.eval_expression(*length, *end_offset, process_memory, &prev_regs)
                    else {
                        return false;
                    };
                    let Some(value) = self.read_word(process_memory, addr) else {
                        self.set_last_error(DwarfErrorCode::MemoryInvalid, addr);
                        return false;
                    };
                    value
                }
                DwarfLocation::ValExpression { length, end_offset } => {
                    let Some(value) =
                        self.eval_expression(*length, *end_offset, process_memory, &prev_regs)
                    else {
                        return false;
                    };
                    value
                }
            };
            if is_pseudo {
                regs.set_dex_pc(value);
            } else {
                regs.set(reg, value);
            }
        }

        if return_address_undefined {
            regs.set_pc(0);
        } else {
            let ra = regs.get(cie.return_address_register as u32).unwrap_or(0);
            regs.set_pc(ra);
        }
        regs.set_sp(cfa);
        // A zero PC means the outermost frame has been reached.
        *finished = regs.pc() == 0;
        true
    }

    fn eval_expression(
        &self,
        length: u64,
        end_offset: u64,
        process_memory: &dyn Memory,
        regs: &Regs,
    ) -> Option<u64> {
        let mut op = DwarfOp::new(self.cursor(), process_memory, regs, self.address_size);
        if !op.eval(end_offset.checked_sub(length)?, end_offset) {
            *self.last_error.lock().unwrap() = op.last_error();
            return None;
        }
        if op.stack_size() == 0 {
            self.set_last_error(DwarfErrorCode::IllegalState, end_offset);
            return None;
        }
        let top = op.stack_at(0).unwrap();
        if op.is_register() {
            if top >= regs.total_regs() as u64 {
                self.set_last_error(DwarfErrorCode::IllegalValue, end_offset);
                return None;
            }
            return regs.get(top as u32);
        }
        Some(top)
    }

    fn read_word(&self, memory: &dyn Memory, addr: u64) -> Option<u64> {
        let mut buf = [0u8; 8];
        let size = self.address_size as usize;
        if !memory.read_fully(addr, &mut buf[..size]) {
            return None;
        }
        Some(if self.big_endian {
            let mut full = [0u8; 8];
            full[8 - size..].copy_from_slice(&buf[..size]);
            u64::from_be_bytes(full)
        } else {
            u64::from_le_bytes(buf)
        })
    }

    fn mask(&self, value: u64) -> u64 {
        if self.address_size == 4 {
            value & u32::MAX as u64
        } else {
            value
        }
    }
}

fn vaddr_to_offset(vaddr: u64, section_bias: i64) -> u64 {
    vaddr.wrapping_sub(section_bias as u64)
}

/// Byte size of a fixed-width table encoding; variable-width encodings
/// cannot be used for binary search.
fn encoded_size(encoding: u8, address_size: u8) -> Option<usize> {
    match encoding & 0x0f {
        DW_EH_PE_ABSPTR => Some(address_size as usize),
        DW_EH_PE_UDATA4 | DW_EH_PE_SDATA4 => Some(4),
        super::memory::DW_EH_PE_UDATA2 | super::memory::DW_EH_PE_SDATA2 => Some(2),
        super::memory::DW_EH_PE_UDATA8 | super::memory::DW_EH_PE_SDATA8 => Some(8),
        DW_EH_PE_ULEB128 => None,
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use crate::memory::MemoryBuffer;
    use crate::regs::x86_64::*;
    use crate::regs::Regs;

    /// Assembles an x86_64 `.eh_frame` with one CIE (CFA = rsp + 8,
    /// return address at CFA - 8, augmented "zR") and FDEs appended by
    /// the tests.
    struct FrameBuilder {
        data: Vec<u8>,
        cie_offset: u64,
        signal_frame: bool,
    }

    impl FrameBuilder {
        fn new() -> FrameBuilder {
            FrameBuilder {
                data: Vec::new(),
                cie_offset: 0,
                signal_frame: false,
            }
        }

        fn signal_frame(mut self) -> FrameBuilder {
            self.signal_frame = true;
            self
        }

        fn start_entry(&mut self) -> usize {
            let start = self.data.len();
            self.data.extend_from_slice(&[0u8; 4]);
            start
        }

        fn finish_entry(&mut self, start: usize) {
            while (self.data.len() - start) % 4 != 0 {
                self.data.push(0x00); // DW_CFA_nop
            }
            let length = (self.data.len() - start - 4) as u32;
            self.data[start..start + 4].copy_from_slice(&length.to_le_bytes());
        }

        fn add_cie(&mut self) {
            let start = self.start_entry();
            self.cie_offset = start as u64;
            self.data.extend_from_slice(&0u32.to_le_bytes()); // CIE id
            self.data.push(1); // version
            if self.signal_frame {
                self.data.extend_from_slice(b"zRS\0");
            } else {
                self.data.extend_from_slice(b"zR\0");
            }
            self.data.push(1); // code alignment
            self.data.push(0x78); // data alignment -8
            self.data.push(X86_64_REG_PC as u8); // return address register
            self.data.push(1); // augmentation data length
            self.data.push(DW_EH_PE_ABSPTR); // fde encoding
            // def_cfa rsp, 8; offset r16, 1
            self.data.extend_from_slice(&[0x0c, 0x07, 0x08, 0x90, 0x01]);
            self.finish_entry(start);
        }

        fn add_fde(&mut self, pc_start: u64, pc_len: u64, instructions: &[u8]) -> u64 {
            let start = self.start_entry();
            let cie_pointer = (start as u64 + 4 - self.cie_offset) as u32;
            self.data.extend_from_slice(&cie_pointer.to_le_bytes());
            self.data.extend_from_slice(&pc_start.to_le_bytes());
            self.data.extend_from_slice(&pc_len.to_le_bytes());
            self.data.push(0); // augmentation data length
            self.data.extend_from_slice(instructions);
            self.finish_entry(start);
            start as u64
        }

        fn section(self) -> DwarfSection {
            let size = self.data.len() as u64;
            let memory: Arc<dyn Memory> = Arc::new(MemoryBuffer::new(self.data));
            DwarfSection::new_eh_frame(memory, 0, size, 0, false, 8)
        }
    }

    fn regs_with(sp: u64, pc: u64) -> Regs {
        let mut regs = Regs::new(Arch::X86_64);
        regs.set(X86_64_REG_SP, sp);
        regs.set(X86_64_REG_PC, pc);
        regs
    }

    fn stack_with(words: &[(u64, u64)]) -> MemoryBuffer {
        let mut data = vec![0u8; 0x100];
        for (addr, value) in words {
            data[*addr as usize..*addr as usize + 8].copy_from_slice(&value.to_le_bytes());
        }
        MemoryBuffer::new(data)
    }

    #[test]
    fn fde_range_is_half_open() {
        let mut builder = FrameBuilder::new();
        builder.add_cie();
        builder.add_fde(0x1000, 0x100, &[]);
        let section = builder.section();
        assert!(section.covers_pc(0x1000));
        assert!(section.covers_pc(0x10ff));
        assert!(!section.covers_pc(0x1100));
        assert!(!section.covers_pc(0xfff));
    }

    #[test]
    fn step_applies_the_location_table() {
        let mut builder = FrameBuilder::new();
        builder.add_cie();
        builder.add_fde(0x1000, 0x100, &[]);
        let section = builder.section();

        let stack = stack_with(&[(0x40, 0x123456)]);
        let mut regs = regs_with(0x40, 0x1010);
        let mut finished = false;
        let mut is_signal_frame = false;
        assert!(section.step(0x1010, &mut regs, &stack, &mut finished, &mut is_signal_frame));
        assert!(!finished);
        assert!(!is_signal_frame);
        // CFA = rsp + 8; return address loaded from CFA - 8.
        assert_eq!(regs.sp(), 0x48);
        assert_eq!(regs.pc(), 0x123456);
    }

    #[test]
    fn zero_return_address_finishes() {
        let mut builder = FrameBuilder::new();
        builder.add_cie();
        builder.add_fde(0x1000, 0x100, &[]);
        let section = builder.section();
        let stack = stack_with(&[]);
        let mut regs = regs_with(0x40, 0x1010);
        let mut finished = false;
        let mut is_signal_frame = false;
        assert!(section.step(0x1010, &mut regs, &stack, &mut finished, &mut is_signal_frame));
        assert!(finished);
        assert_eq!(regs.pc(), 0);
    }

    #[test]
    fn rows_advance_with_the_program() {
        let mut builder = FrameBuilder::new();
        builder.add_cie();
        // advance_loc 8, then the CFA moves to rsp + 16.
        builder.add_fde(0x1000, 0x100, &[0x48, 0x0e, 0x10]);
        let section = builder.section();

        let stack = stack_with(&[(0x48, 0xabcd)]);
        let mut regs = regs_with(0x40, 0x1009);
        let mut finished = false;
        let mut is_signal_frame = false;
        assert!(section.step(0x1009, &mut regs, &stack, &mut finished, &mut is_signal_frame));
        assert_eq!(regs.sp(), 0x50);
        assert_eq!(regs.pc(), 0xabcd);

        // Before the advance the original row still applies.
        let stack = stack_with(&[(0x40, 0x1111)]);
        let mut regs = regs_with(0x40, 0x1004);
        assert!(section.step(0x1004, &mut regs, &stack, &mut finished, &mut is_signal_frame));
        assert_eq!(regs.sp(), 0x48);
        assert_eq!(regs.pc(), 0x1111);
    }

    #[test]
    fn signal_frame_flag_comes_from_the_cie() {
        let mut builder = FrameBuilder::new().signal_frame();
        builder.add_cie();
        builder.add_fde(0x1000, 0x100, &[]);
        let section = builder.section();
        let stack = stack_with(&[(0x40, 0x1)]);
        let mut regs = regs_with(0x40, 0x1010);
        let mut finished = false;
        let mut is_signal_frame = false;
        assert!(section.step(0x1010, &mut regs, &stack, &mut finished, &mut is_signal_frame));
        assert!(is_signal_frame);
    }

    #[test]
    fn no_fde_at_pc_fails_without_progress() {
        let mut builder = FrameBuilder::new();
        builder.add_cie();
        builder.add_fde(0x1000, 0x100, &[]);
        let section = builder.section();
        let stack = stack_with(&[]);
        let mut regs = regs_with(0x40, 0x4000);
        let mut finished = false;
        let mut is_signal_frame = false;
        assert!(!section.step(0x4000, &mut regs, &stack, &mut finished, &mut is_signal_frame));
        assert_eq!(regs.sp(), 0x40);
    }

    #[test]
    fn zero_length_fdes_are_not_indexed() {
        let mut builder = FrameBuilder::new();
        builder.add_cie();
        builder.add_fde(0x1000, 0, &[]);
        let section = builder.section();
        assert!(!section.covers_pc(0x1000));
    }

    #[test]
    fn overlapping_fdes_poison_the_section() {
        let mut builder = FrameBuilder::new();
        builder.add_cie();
        builder.add_fde(0x1000, 0x100, &[]);
        builder.add_fde(0x1080, 0x100, &[]);
        let section = builder.section();
        assert!(!section.covers_pc(0x1000));
        assert_eq!(section.last_error().code, DwarfErrorCode::IllegalValue);
    }

    #[test]
    fn repeated_evaluation_is_idempotent() {
        let mut builder = FrameBuilder::new();
        builder.add_cie();
        builder.add_fde(0x1000, 0x100, &[0x48, 0x0e, 0x10]);
        let section = builder.section();
        let stack = stack_with(&[(0x48, 0xabcd)]);
        let before = regs_with(0x40, 0x1009);
        let mut results = Vec::new();
        for _ in 0..3 {
            let mut regs = before.clone();
            let mut finished = false;
            let mut is_signal = false;
            assert!(section.step(0x1009, &mut regs, &stack, &mut finished, &mut is_signal));
            results.push((regs.pc(), regs.sp()));
        }
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn malformed_hdr_falls_back_to_none() {
        // A header advertising zero FDEs is unusable and must report so,
        // letting the caller build a linear index instead.
        let mut data = vec![0u8; 16];
        data[0] = 1; // version
        data[1] = DW_EH_PE_OMIT; // eh_frame_ptr encoding
        data[2] = DW_EH_PE_UDATA4; // fde count encoding
        data[3] = DW_EH_PE_SDATA4 | super::super::memory::DW_EH_PE_DATAREL;
        // fde_count = 0 at offset 4.
        let memory: Arc<dyn Memory> = Arc::new(MemoryBuffer::new(data));
        assert!(DwarfSection::new_eh_frame_with_hdr(memory, 0, 16, 0, 0x100, 0x100, 0, false, 8)
            .is_none());
    }

    #[test]
    fn hdr_binary_search_finds_the_fde() {
        let mut builder = FrameBuilder::new();
        builder.add_cie();
        let fde_a = builder.add_fde(0x1000, 0x100, &[]);
        let fde_b = builder.add_fde(0x2000, 0x100, &[0x0e, 0x10]);
        let eh_frame = builder.data.clone();

        // Section image: header at 0, eh_frame at 0x100.
        let mut data = vec![0u8; 0x100];
        data[0] = 1;
        data[1] = DW_EH_PE_OMIT;
        data[2] = DW_EH_PE_UDATA4;
        data[3] = DW_EH_PE_SDATA4 | super::super::memory::DW_EH_PE_DATAREL;
        data[4..8].copy_from_slice(&2u32.to_le_bytes());
        let mut entry = 8;
        for (pc, fde) in [(0x1000u32, fde_a), (0x2000, fde_b)] {
            data[entry..entry + 4].copy_from_slice(&pc.to_le_bytes());
            let fde_vaddr = (fde + 0x100) as u32;
            data[entry + 4..entry + 8].copy_from_slice(&fde_vaddr.to_le_bytes());
            entry += 8;
        }
        data.extend_from_slice(&eh_frame);
        let size = data.len() as u64;
        let memory: Arc<dyn Memory> = Arc::new(MemoryBuffer::new(data));
        let section = DwarfSection::new_eh_frame_with_hdr(
            memory,
            0,
            0x100,
            0,
            0x100,
            size - 0x100,
            0,
            false,
            8,
        )
        .unwrap();

        // The table start is inclusive and each range half open.
        assert!(section.covers_pc(0x1000));
        assert!(section.covers_pc(0x10ff));
        assert!(!section.covers_pc(0x1100));
        assert!(!section.covers_pc(0xfff));
        assert!(section.covers_pc(0x2050));
        assert!(!section.covers_pc(0x2100));

        let stack = stack_with(&[(0x40, 0x77), (0x48, 0x99)]);
        let mut regs = regs_with(0x40, 0x2010);
        let mut finished = false;
        let mut is_signal = false;
        assert!(section.step(0x2010, &mut regs, &stack, &mut finished, &mut is_signal));
        // def_cfa_offset 16 applies from the function start.
        assert_eq!(regs.sp(), 0x50);
        assert_eq!(regs.pc(), 0x99);
    }

    #[test]
    fn debug_frame_uses_absolute_cie_offsets() {
        // CIE: id 0xffffffff, version 3, no augmentation.
        let mut cie = Vec::new();
        cie.extend_from_slice(&u32::MAX.to_le_bytes());
        cie.push(3); // version
        cie.push(0); // augmentation ""
        cie.push(1); // code alignment
        cie.push(0x78); // data alignment -8
        cie.push(X86_64_REG_PC as u8); // return address register
        cie.extend_from_slice(&[0x0c, 0x07, 0x08, 0x90, 0x01]);
        while cie.len() % 4 != 0 {
            cie.push(0); // DW_CFA_nop
        }

        // FDE referencing the CIE by its absolute section offset, 0.
        let mut fde = Vec::new();
        fde.extend_from_slice(&0u32.to_le_bytes());
        fde.extend_from_slice(&0x3000u64.to_le_bytes());
        fde.extend_from_slice(&0x100u64.to_le_bytes());

        let mut data = Vec::new();
        data.extend_from_slice(&(cie.len() as u32).to_le_bytes());
        data.extend_from_slice(&cie);
        data.extend_from_slice(&(fde.len() as u32).to_le_bytes());
        data.extend_from_slice(&fde);

        let size = data.len() as u64;
        let memory: Arc<dyn Memory> = Arc::new(MemoryBuffer::new(data));
        let section = DwarfSection::new_debug_frame(memory, 0, size, 0, false, 8);
        assert!(section.covers_pc(0x3000));
        assert!(!section.covers_pc(0x3100));

        let stack = stack_with(&[(0x40, 0x4242)]);
        let mut regs = regs_with(0x40, 0x3010);
        let mut finished = false;
        let mut is_signal = false;
        assert!(section.step(0x3010, &mut regs, &stack, &mut finished, &mut is_signal));
        assert_eq!(regs.pc(), 0x4242);
    }
}

