use crate::error::{ErrorCode, ErrorData};
use crate::memory::Memory;
use crate::regs::arm::{ARM_REG_LR, ARM_REG_PC, ARM_REG_SP};
use crate::regs::Regs;

// Source: Exception Handling ABI for the ARM Architecture (EHABI),
// section 9.3 and 10.
const EXIDX_CANT_UNWIND: u32 = 0x1;
const EXIDX_INLINE_MASK: u32 = 1 << 31;
const ENTRY_SIZE: u64 = 8;

/// Sign-extend a prel31 field and add the address of the field itself.
fn prel31_to_addr(field_addr: u32, value: u32) -> u32 {
    let offset = ((value << 1) as i32) >> 1;
    field_addr.wrapping_add(offset as u32)
}

/// The `.ARM.exidx` engine for 32-bit ARM. Looks up the index entry
/// covering a PC, extracts its unwinding bytecode (inline or via
/// `.ARM.extab`) and interprets it against the register file.
///
/// `memory` is the ELF memory addressed by file offsets; `bias` converts
/// the index's virtual addresses into those offsets.
pub(crate) struct ArmExidx<'a> {
    memory: &'a dyn Memory,
    /// File offset of the first index entry.
    offset: u64,
    /// Number of 8-byte index entries.
    count: u64,
    /// sh_addr - sh_offset of the index and table sections.
    bias: i64,
    last_error: ErrorData,
}

impl<'a> ArmExidx<'a> {
    pub fn new(memory: &'a dyn Memory, offset: u64, size: u64, bias: i64) -> ArmExidx<'a> {
        ArmExidx {
            memory,
            offset,
            count: size / ENTRY_SIZE,
            bias,
            last_error: ErrorData::default(),
        }
    }

    pub fn last_error(&self) -> ErrorData {
        self.last_error
    }

    fn read_u32_at_offset(&mut self, offset: u64) -> Option<u32> {
        let mut buf = [0u8; 4];
        if !self.memory.read_fully(offset, &mut buf) {
            self.last_error = ErrorData::new(ErrorCode::InvalidMemory, offset);
            return None;
        }
        Some(u32::from_le_bytes(buf))
    }

    /// Read a u32 at a virtual address by rebasing into the file memory.
    fn read_u32_at_vaddr(&mut self, vaddr: u32) -> Option<u32> {
        let offset = (vaddr as u64).wrapping_sub(self.bias as u64);
        self.read_u32_at_offset(offset)
    }

    fn entry_field_vaddr(&self, index: u64) -> u32 {
        ((self.offset + index * ENTRY_SIZE) as i64).wrapping_add(self.bias) as u32
    }

    /// Binary search for the entry whose function covers `pc` (a virtual
    /// address). The entries are sorted by function start address.
    fn find_entry(&mut self, pc: u32) -> Option<u64> {
        if self.count == 0 {
            self.last_error = ErrorData::new(ErrorCode::UnwindInfo, 0);
            return None;
        }
        let mut first = 0u64;
        let mut last = self.count;
        while first < last {
            let current = (first + last) / 2;
            let word = self.read_u32_at_offset(self.offset + current * ENTRY_SIZE)?;
            let fn_addr = prel31_to_addr(self.entry_field_vaddr(current), word);
            if pc == fn_addr {
                return Some(current);
            }
            if pc < fn_addr {
                last = current;
            } else {
                first = current + 1;
            }
        }
        if first == 0 {
            self.last_error = ErrorData::new(ErrorCode::UnwindInfo, pc as u64);
            return None;
        }
        Some(first - 1)
    }

    /// Collect the unwinding opcode bytes for an index entry.
    /// Returns `None` with no error for CANT_UNWIND.
    fn extract_bytecode(&mut self, index: u64, finished: &mut bool) -> Option<Vec<u8>> {
        let value_offset = self.offset + index * ENTRY_SIZE + 4;
        let value = self.read_u32_at_offset(value_offset)?;
        if value == EXIDX_CANT_UNWIND {
            *finished = true;
            return None;
        }

        if value & EXIDX_INLINE_MASK != 0 {
            // Compact inline entry: personality 0, three opcode bytes.
            let personality = (value >> 24) & 0x7f;
            if personality != 0 {
                self.last_error = ErrorData::new(ErrorCode::Unsupported, value_offset);
                return None;
            }
            return Some(vec![
                ((value >> 16) & 0xff) as u8,
                ((value >> 8) & 0xff) as u8,
                (value & 0xff) as u8,
            ]);
        }

        // Generic entry: prel31 pointer into .ARM.extab.
        let field_vaddr = self.entry_field_vaddr(index).wrapping_add(4);
        let extab_vaddr = prel31_to_addr(field_vaddr, value);
        let header = self.read_u32_at_vaddr(extab_vaddr)?;

        let mut bytes = Vec::new();
        let mut word_vaddr;
        let word_count;
        if header & EXIDX_INLINE_MASK == 0 {
            // Generic model: prel31 personality routine, then a word with
            // the opcode count in its top byte and three opcode bytes.
            let data = self.read_u32_at_vaddr(extab_vaddr.wrapping_add(4))?;
            word_count = (data >> 24) & 0xff;
            bytes.push(((data >> 16) & 0xff) as u8);
            bytes.push(((data >> 8) & 0xff) as u8);
            bytes.push((data & 0xff) as u8);
            word_vaddr = extab_vaddr.wrapping_add(8);
        } else {
            // ARM compact model.
            let personality = (header >> 24) & 0x0f;
            match personality {
                0 => {
                    bytes.push(((header >> 16) & 0xff) as u8);
                    bytes.push(((header >> 8) & 0xff) as u8);
                    bytes.push((header & 0xff) as u8);
                    return Some(bytes);
                }
                1 | 2 => {
                    word_count = (header >> 16) & 0xff;
                    bytes.push(((header >> 8) & 0xff) as u8);
                    bytes.push((header & 0xff) as u8);
                    word_vaddr = extab_vaddr.wrapping_add(4);
                }
                _ => {
                    self.last_error = ErrorData::new(ErrorCode::Unsupported, extab_vaddr as u64);
                    return None;
                }
            }
        }
        for _ in 0..word_count {
            let word = self.read_u32_at_vaddr(word_vaddr)?;
            bytes.push(((word >> 24) & 0xff) as u8);
            bytes.push(((word >> 16) & 0xff) as u8);
            bytes.push(((word >> 8) & 0xff) as u8);
            bytes.push((word & 0xff) as u8);
            word_vaddr = word_vaddr.wrapping_add(4);
        }
        Some(bytes)
    }

    /// Interpret the opcode bytes: pop registers from the stack at the
    /// virtual stack pointer, then install the PC (from LR if the
    /// bytecode did not pop it) and the final vsp as SP.
    fn run_bytecode(
        &mut self,
        bytes: &[u8],
        regs: &mut Regs,
        process_memory: &dyn Memory,
    ) -> Option<(bool, bool)> {
        fn pop_mask(
            process_memory: &dyn Memory,
            mask: u16,
            base_reg: u32,
            vsp: &mut u32,
            regs: &mut Regs,
        ) -> Result<(), u64> {
            for bit in 0..16u32 {
                if mask & (1 << bit) == 0 {
                    continue;
                }
                let mut buf = [0u8; 4];
                if !process_memory.read_fully(*vsp as u64, &mut buf) {
                    return Err(*vsp as u64);
                }
                regs.set(base_reg + bit, u32::from_le_bytes(buf) as u64);
                *vsp = vsp.wrapping_add(4);
            }
            Ok(())
        }

        let mut vsp = regs.sp() as u32;
        let mut pc_set = false;
        let mut sp_set = false;
        let mut iter = bytes.iter().copied().peekable();

        while let Some(op) = iter.next() {
            match op {
                // vsp += (x << 2) + 4
                0x00..=0x3f => vsp = vsp.wrapping_add((((op & 0x3f) as u32) << 2) + 4),
                // vsp -= (x << 2) + 4
                0x40..=0x7f => vsp = vsp.wrapping_sub((((op & 0x3f) as u32) << 2) + 4),
                // Pop r4-r15 under a mask.
                0x80..=0x8f => {
                    let Some(next) = iter.next() else {
                        self.last_error = ErrorData::new(ErrorCode::UnwindInfo, 0);
                        return None;
                    };
                    let mask = (((op & 0x0f) as u16) << 8) | next as u16;
                    if mask == 0 {
                        // "Refuse to unwind" encoding.
                        return Some((true, pc_set));
                    }
                    // The mask starts at r4.
                    if let Err(addr) = pop_mask(process_memory, mask, 4, &mut vsp, regs) {
                        self.last_error = ErrorData::new(ErrorCode::InvalidMemory, addr);
                        return None;
                    }
                    if mask & (1 << (13 - 4)) != 0 {
                        sp_set = true;
                    }
                    if mask & (1 << (15 - 4)) != 0 {
                        pc_set = true;
                    }
                }
                // vsp = r[n]
                0x90..=0x9f => {
                    let reg = (op & 0x0f) as u32;
                    if reg == 13 || reg == 15 {
                        self.last_error = ErrorData::new(ErrorCode::UnwindInfo, 0);
                        return None;
                    }
                    vsp = regs.get(reg).unwrap_or(0) as u32;
                }
                // Pop r4-r[4+n], optionally r14.
                0xa0..=0xaf => {
                    let n = (op & 0x07) as u16;
                    let mut mask: u16 = ((1 << (n + 1)) - 1) as u16;
                    if op & 0x08 != 0 {
                        mask |= 1 << (14 - 4);
                    }
                    if let Err(addr) = pop_mask(process_memory, mask, 4, &mut vsp, regs) {
                        self.last_error = ErrorData::new(ErrorCode::InvalidMemory, addr);
                        return None;
                    }
                }
                // Finish.
                0xb0 => break,
                // Pop r0-r3 under a mask.
                0xb1 => {
                    let Some(next) = iter.next() else {
                        self.last_error = ErrorData::new(ErrorCode::UnwindInfo, 0);
                        return None;
                    };
                    if next == 0 || next & 0xf0 != 0 {
                        self.last_error = ErrorData::new(ErrorCode::UnwindInfo, 0);
                        return None;
                    }
                    if let Err(addr) = pop_mask(process_memory, next as u16, 0, &mut vsp, regs) {
                        self.last_error = ErrorData::new(ErrorCode::InvalidMemory, addr);
                        return None;
                    }
                }
                // vsp += 0x204 + (uleb128 << 2)
                0xb2 => {
                    let mut result = 0u32;
                    let mut shift = 0u32;
                    loop {
                        let Some(byte) = iter.next() else {
                            self.last_error = ErrorData::new(ErrorCode::UnwindInfo, 0);
                            return None;
                        };
                        if shift > 28 {
                            self.last_error = ErrorData::new(ErrorCode::UnwindInfo, 0);
                            return None;
                        }
                        result |= ((byte & 0x7f) as u32) << shift;
                        if byte & 0x80 == 0 {
                            break;
                        }
                        shift += 7;
                    }
                    vsp = vsp.wrapping_add(0x204_u32.wrapping_add(result << 2));
                }
                // Pop VFP registers; only the vsp adjustment matters.
                0xb3 | 0xc8 | 0xc9 => {
                    let Some(next) = iter.next() else {
                        self.last_error = ErrorData::new(ErrorCode::UnwindInfo, 0);
                        return None;
                    };
                    let count = (next & 0x0f) as u32 + 1;
                    // FSTMFDX (0xb3) writes an extra word.
                    let extra = if op == 0xb3 { 4 } else { 0 };
                    vsp = vsp.wrapping_add(8 * count + extra);
                }
                0xb8..=0xbf => {
                    let count = (op & 0x07) as u32 + 1;
                    vsp = vsp.wrapping_add(8 * count + 4);
                }
                0xd0..=0xd7 => {
                    let count = (op & 0x07) as u32 + 1;
                    vsp = vsp.wrapping_add(8 * count);
                }
                _ => {
                    self.last_error = ErrorData::new(ErrorCode::Unsupported, op as u64);
                    return None;
                }
            }
            if sp_set {
                // A popped r13 becomes the stack pointer once the pops
                // that loaded it are done.
                vsp = regs.get(ARM_REG_SP).unwrap_or(0) as u32;
                sp_set = false;
            }
        }

        regs.set(ARM_REG_SP, vsp as u64);
        Some((false, pc_set))
    }

    /// Unwind one frame. `pc` is the relative PC (virtual address space of
    /// the ELF). Follows the same contract as the DWARF engine's step.
    pub fn step(
        &mut self,
        pc: u64,
        regs: &mut Regs,
        process_memory: &dyn Memory,
        finished: &mut bool,
    ) -> bool {
        let index = match self.find_entry(pc as u32) {
            Some(index) => index,
            None => return false,
        };
        let bytes = match self.extract_bytecode(index, finished) {
            Some(bytes) => bytes,
            None => return *finished,
        };
        let Some((refused, pc_set)) = self.run_bytecode(&bytes, regs, process_memory) else {
            return false;
        };
        if refused {
            *finished = true;
            return true;
        }
        if !pc_set {
            let lr = regs.get(ARM_REG_LR).unwrap_or(0);
            regs.set(ARM_REG_PC, lr);
        }
        *finished = regs.pc() == 0;
        true
    }

    /// True when the index has an entry covering `pc` that is not
    /// CANT_UNWIND.
    pub fn covers_pc(&mut self, pc: u64) -> bool {
        let Some(index) = self.find_entry(pc as u32) else {
            return false;
        };
        match self.read_u32_at_offset(self.offset + index * ENTRY_SIZE + 4) {
            Some(value) => value != EXIDX_CANT_UNWIND,
            None => false,
        }
    }
}
