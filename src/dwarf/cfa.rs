use super::memory::DwarfMemory;
use super::{DwarfCie, DwarfErrorCode, DwarfErrorData, DwarfFde, DwarfLocation, DwarfLocations, CFA_REG};

#[allow(non_upper_case_globals)]
mod opcodes {
    // High-two-bit opcodes; the low six bits carry an operand.
    pub const DW_CFA_advance_loc: u8 = 0x40;
    pub const DW_CFA_offset: u8 = 0x80;
    pub const DW_CFA_restore: u8 = 0xc0;

    pub const DW_CFA_nop: u8 = 0x00;
    pub const DW_CFA_set_loc: u8 = 0x01;
    pub const DW_CFA_advance_loc1: u8 = 0x02;
    pub const DW_CFA_advance_loc2: u8 = 0x03;
    pub const DW_CFA_advance_loc4: u8 = 0x04;
    pub const DW_CFA_offset_extended: u8 = 0x05;
    pub const DW_CFA_restore_extended: u8 = 0x06;
    pub const DW_CFA_undefined: u8 = 0x07;
    pub const DW_CFA_same_value: u8 = 0x08;
    pub const DW_CFA_register: u8 = 0x09;
    pub const DW_CFA_remember_state: u8 = 0x0a;
    pub const DW_CFA_restore_state: u8 = 0x0b;
    pub const DW_CFA_def_cfa: u8 = 0x0c;
    pub const DW_CFA_def_cfa_register: u8 = 0x0d;
    pub const DW_CFA_def_cfa_offset: u8 = 0x0e;
    pub const DW_CFA_def_cfa_expression: u8 = 0x0f;
    pub const DW_CFA_expression: u8 = 0x10;
    pub const DW_CFA_offset_extended_sf: u8 = 0x11;
    pub const DW_CFA_def_cfa_sf: u8 = 0x12;
    pub const DW_CFA_def_cfa_offset_sf: u8 = 0x13;
    pub const DW_CFA_val_offset: u8 = 0x14;
    pub const DW_CFA_val_offset_sf: u8 = 0x15;
    pub const DW_CFA_val_expression: u8 = 0x16;
    pub const DW_CFA_GNU_args_size: u8 = 0x2e;
    pub const DW_CFA_GNU_negative_offset_extended: u8 = 0x2f;
}
use opcodes::*;

/// Executes a call-frame-instruction program, building the location table
/// in effect at a target PC. The CIE's initial instructions and the FDE's
/// instructions run through the same interpreter; for the FDE run the
/// table produced by the CIE is both the starting state and the state
/// `DW_CFA_restore` restores to.
pub(crate) struct DwarfCfa<'a> {
    memory: DwarfMemory<'a>,
    cie: &'a DwarfCie,
    fde: &'a DwarfFde,
    cie_loc_regs: Option<&'a DwarfLocations>,
    state_stack: Vec<std::collections::HashMap<u32, DwarfLocation>>,
    cur_pc: u64,
    last_error: DwarfErrorData,
}

impl<'a> DwarfCfa<'a> {
    pub fn new(
        memory: DwarfMemory<'a>,
        cie: &'a DwarfCie,
        fde: &'a DwarfFde,
        cie_loc_regs: Option<&'a DwarfLocations>,
    ) -> Self {
        DwarfCfa {
            memory,
            cie,
            fde,
            cie_loc_regs,
            state_stack: Vec::new(),
            cur_pc: 0,
            last_error: DwarfErrorData::default(),
        }
    }

    pub fn last_error(&self) -> DwarfErrorData {
        self.last_error
    }

    /// Run the instructions in `[start_offset, end_offset)` until the row
    /// for `pc` is complete, leaving the result in `loc_regs`.
    pub fn get_location_info(
        &mut self,
        pc: u64,
        start_offset: u64,
        end_offset: u64,
        loc_regs: &mut DwarfLocations,
    ) -> bool {
        self.state_stack.clear();
        self.cur_pc = self.fde.pc_start;
        loc_regs.pc_start = self.cur_pc;
        loc_regs.pc_end = self.fde.pc_end;
        self.memory.set_cur_offset(start_offset);

        while self.memory.cur_offset() < end_offset && self.cur_pc <= pc {
            let op_offset = self.memory.cur_offset();
            let Some(op) = self.memory.read_u8() else {
                return self.fail(DwarfErrorCode::MemoryInvalid, op_offset);
            };
            if !self.decode(op, op_offset, pc, loc_regs) {
                return false;
            }
        }
        if self.cur_pc <= pc {
            // The final row runs to the end of the FDE's range.
            loc_regs.pc_start = self.cur_pc;
            loc_regs.pc_end = self.fde.pc_end;
        }
        true
    }

    fn fail(&mut self, code: DwarfErrorCode, address: u64) -> bool {
        self.last_error = DwarfErrorData::new(code, address);
        false
    }

    fn advance(&mut self, delta: u64, pc: u64, loc_regs: &mut DwarfLocations) {
        let next_pc = self
            .cur_pc
            .wrapping_add(delta.wrapping_mul(self.cie.code_alignment_factor));
        if self.cur_pc <= pc && pc < next_pc {
            loc_regs.pc_start = self.cur_pc;
            loc_regs.pc_end = next_pc;
        }
        self.cur_pc = next_pc;
    }

    fn restore(&mut self, reg: u32, op_offset: u64, loc_regs: &mut DwarfLocations) -> bool {
        let Some(cie_loc_regs) = self.cie_loc_regs else {
            // Restore within the CIE's own initial instructions.
            return self.fail(DwarfErrorCode::IllegalState, op_offset);
        };
        match cie_loc_regs.regs.get(&reg) {
            Some(loc) => loc_regs.regs.insert(reg, loc.clone()),
            None => loc_regs.regs.remove(&reg),
        };
        true
    }

    fn decode(&mut self, op: u8, op_offset: u64, pc: u64, loc_regs: &mut DwarfLocations) -> bool {
        macro_rules! operand {
            ($read:ident) => {
                match self.memory.$read() {
                    Some(value) => value,
                    None => return self.fail(DwarfErrorCode::MemoryInvalid, op_offset),
                }
            };
        }

        match op & 0xc0 {
            DW_CFA_advance_loc => {
                self.advance((op & 0x3f) as u64, pc, loc_regs);
                return true;
            }
            DW_CFA_offset => {
                let offset = operand!(read_uleb128);
                let reg = (op & 0x3f) as u32;
                let value = (offset as i64).wrapping_mul(self.cie.data_alignment_factor);
                loc_regs.regs.insert(reg, DwarfLocation::Offset(value));
                return true;
            }
            DW_CFA_restore => {
                return self.restore((op & 0x3f) as u32, op_offset, loc_regs);
            }
            _ => {}
        }

        match op {
            DW_CFA_nop => true,
            DW_CFA_set_loc => {
                let encoding = self.cie.fde_address_encoding;
                let Some(new_pc) = self.memory.read_encoded(encoding) else {
                    return self.fail(DwarfErrorCode::MemoryInvalid, op_offset);
                };
                if new_pc < self.cur_pc {
                    // Location values must always grow.
                    return self.fail(DwarfErrorCode::IllegalValue, op_offset);
                }
                if self.cur_pc <= pc && pc < new_pc {
                    loc_regs.pc_start = self.cur_pc;
                    loc_regs.pc_end = new_pc;
                }
                self.cur_pc = new_pc;
                true
            }
            DW_CFA_advance_loc1 => {
                let delta = operand!(read_u8);
                self.advance(delta as u64, pc, loc_regs);
                true
            }
            DW_CFA_advance_loc2 => {
                let delta = operand!(read_u16);
                self.advance(delta as u64, pc, loc_regs);
                true
            }
            DW_CFA_advance_loc4 => {
                let delta = operand!(read_u32);
                self.advance(delta as u64, pc, loc_regs);
                true
            }
            DW_CFA_offset_extended | DW_CFA_val_offset => {
                let reg = operand!(read_uleb128) as u32;
                let offset = operand!(read_uleb128);
                let value = (offset as i64).wrapping_mul(self.cie.data_alignment_factor);
                let loc = if op == DW_CFA_offset_extended {
                    DwarfLocation::Offset(value)
                } else {
                    DwarfLocation::ValOffset(value)
                };
                loc_regs.regs.insert(reg, loc);
                true
            }
            DW_CFA_offset_extended_sf | DW_CFA_val_offset_sf => {
                let reg = operand!(read_uleb128) as u32;
                let offset = operand!(read_sleb128);
                let value = offset.wrapping_mul(self.cie.data_alignment_factor);
                let loc = if op == DW_CFA_offset_extended_sf {
                    DwarfLocation::Offset(value)
                } else {
                    DwarfLocation::ValOffset(value)
                };
                loc_regs.regs.insert(reg, loc);
                true
            }
            DW_CFA_restore_extended => {
                let reg = operand!(read_uleb128) as u32;
                self.restore(reg, op_offset, loc_regs)
            }
            DW_CFA_undefined => {
                let reg = operand!(read_uleb128) as u32;
                loc_regs.regs.insert(reg, DwarfLocation::Undefined);
                true
            }
            DW_CFA_same_value => {
                let reg = operand!(read_uleb128) as u32;
                loc_regs.regs.remove(&reg);
                true
            }
            DW_CFA_register => {
                let reg = operand!(read_uleb128) as u32;
                let src = operand!(read_uleb128) as u32;
                loc_regs
                    .regs
                    .insert(reg, DwarfLocation::Register { reg: src, offset: 0 });
                true
            }
            DW_CFA_remember_state => {
                self.state_stack.push(loc_regs.regs.clone());
                true
            }
            DW_CFA_restore_state => match self.state_stack.pop() {
                Some(state) => {
                    loc_regs.regs = state;
                    true
                }
                None => {
                    log::warn!("restore_state while the state stack is empty");
                    true
                }
            },
            DW_CFA_def_cfa => {
                let reg = operand!(read_uleb128) as u32;
                let offset = operand!(read_uleb128) as i64;
                loc_regs
                    .regs
                    .insert(CFA_REG, DwarfLocation::Register { reg, offset });
                true
            }
            DW_CFA_def_cfa_sf => {
                let reg = operand!(read_uleb128) as u32;
                let offset = operand!(read_sleb128);
                let offset = offset.wrapping_mul(self.cie.data_alignment_factor);
                loc_regs
                    .regs
                    .insert(CFA_REG, DwarfLocation::Register { reg, offset });
                true
            }
            DW_CFA_def_cfa_register => {
                let reg = operand!(read_uleb128) as u32;
                match loc_regs.regs.get_mut(&CFA_REG) {
                    Some(DwarfLocation::Register { reg: cfa_reg, .. }) => {
                        *cfa_reg = reg;
                        true
                    }
                    _ => self.fail(DwarfErrorCode::IllegalState, op_offset),
                }
            }
            DW_CFA_def_cfa_offset => {
                let offset = operand!(read_uleb128) as i64;
                match loc_regs.regs.get_mut(&CFA_REG) {
                    Some(DwarfLocation::Register { offset: cfa_offset, .. }) => {
                        *cfa_offset = offset;
                        true
                    }
                    _ => self.fail(DwarfErrorCode::IllegalState, op_offset),
                }
            }
            DW_CFA_def_cfa_offset_sf => {
                let offset = operand!(read_sleb128).wrapping_mul(self.cie.data_alignment_factor);
                match loc_regs.regs.get_mut(&CFA_REG) {
                    Some(DwarfLocation::Register { offset: cfa_offset, .. }) => {
                        *cfa_offset = offset;
                        true
                    }
                    _ => self.fail(DwarfErrorCode::IllegalState, op_offset),
                }
            }
            DW_CFA_def_cfa_expression => {
                let length = operand!(read_uleb128);
                let end_offset = self.memory.cur_offset().wrapping_add(length);
                self.memory.set_cur_offset(end_offset);
                loc_regs.regs.insert(
                    CFA_REG,
                    DwarfLocation::ValExpression { length, end_offset },
                );
                true
            }
            DW_CFA_expression | DW_CFA_val_expression => {
                let reg = operand!(read_uleb128) as u32;
                let length = operand!(read_uleb128);
                let end_offset = self.memory.cur_offset().wrapping_add(length);
                self.memory.set_cur_offset(end_offset);
                let loc = if op == DW_CFA_expression {
                    DwarfLocation::Expression { length, end_offset }
                } else {
                    DwarfLocation::ValExpression { length, end_offset }
                };
                loc_regs.regs.insert(reg, loc);
                true
            }
            DW_CFA_GNU_args_size => {
                // Only relevant to exception cleanup, not to the table.
                operand!(read_uleb128);
                true
            }
            DW_CFA_GNU_negative_offset_extended => {
                let reg = operand!(read_uleb128) as u32;
                let offset = operand!(read_uleb128) as i64;
                loc_regs.regs.insert(reg, DwarfLocation::Offset(-offset));
                true
            }
            _ => self.fail(DwarfErrorCode::NotImplemented, op_offset),
        }
    }
}
