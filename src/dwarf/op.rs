use arrayvec::ArrayVec;

use crate::memory::Memory;
use crate::regs::Regs;

use super::memory::DwarfMemory;
use super::{DwarfErrorCode, DwarfErrorData};

const STACK_CAPACITY: usize = 512;
const MAX_ITERATIONS: u32 = 1000;

// DW_OP opcodes handled by the evaluator. The lit/reg/breg families are
// matched by range.
const DW_OP_ADDR: u8 = 0x03;
const DW_OP_DEREF: u8 = 0x06;
const DW_OP_CONST1U: u8 = 0x08;
const DW_OP_CONST1S: u8 = 0x09;
const DW_OP_CONST2U: u8 = 0x0a;
const DW_OP_CONST2S: u8 = 0x0b;
const DW_OP_CONST4U: u8 = 0x0c;
const DW_OP_CONST4S: u8 = 0x0d;
const DW_OP_CONST8U: u8 = 0x0e;
const DW_OP_CONST8S: u8 = 0x0f;
const DW_OP_CONSTU: u8 = 0x10;
const DW_OP_CONSTS: u8 = 0x11;
const DW_OP_DUP: u8 = 0x12;
const DW_OP_DROP: u8 = 0x13;
const DW_OP_OVER: u8 = 0x14;
const DW_OP_PICK: u8 = 0x15;
const DW_OP_SWAP: u8 = 0x16;
const DW_OP_ROT: u8 = 0x17;
const DW_OP_ABS: u8 = 0x19;
const DW_OP_AND: u8 = 0x1a;
const DW_OP_DIV: u8 = 0x1b;
const DW_OP_MINUS: u8 = 0x1c;
const DW_OP_MOD: u8 = 0x1d;
const DW_OP_MUL: u8 = 0x1e;
const DW_OP_NEG: u8 = 0x1f;
const DW_OP_NOT: u8 = 0x20;
const DW_OP_OR: u8 = 0x21;
const DW_OP_PLUS: u8 = 0x22;
const DW_OP_PLUS_UCONST: u8 = 0x23;
const DW_OP_SHL: u8 = 0x24;
const DW_OP_SHR: u8 = 0x25;
const DW_OP_SHRA: u8 = 0x26;
const DW_OP_XOR: u8 = 0x27;
const DW_OP_BRA: u8 = 0x28;
const DW_OP_EQ: u8 = 0x29;
const DW_OP_GE: u8 = 0x2a;
const DW_OP_GT: u8 = 0x2b;
const DW_OP_LE: u8 = 0x2c;
const DW_OP_LT: u8 = 0x2d;
const DW_OP_NE: u8 = 0x2e;
const DW_OP_SKIP: u8 = 0x2f;
const DW_OP_LIT0: u8 = 0x30;
const DW_OP_LIT31: u8 = 0x4f;
const DW_OP_REG0: u8 = 0x50;
const DW_OP_REG31: u8 = 0x6f;
const DW_OP_BREG0: u8 = 0x70;
const DW_OP_BREG31: u8 = 0x8f;
const DW_OP_REGX: u8 = 0x90;
const DW_OP_BREGX: u8 = 0x92;
const DW_OP_DEREF_SIZE: u8 = 0x94;
const DW_OP_NOP: u8 = 0x96;

/// Evaluates a DWARF expression over a bounded stack of address-sized
/// values, with the unwind section as instruction source, the process
/// memory as the dereference oracle and the register file as the register
/// oracle.
pub(crate) struct DwarfOp<'a, 'r> {
    memory: DwarfMemory<'a>,
    regular_memory: &'a dyn Memory,
    regs: &'r Regs,
    stack: ArrayVec<u64, STACK_CAPACITY>,
    address_mask: u64,
    address_size: u8,
    is_register: bool,
    last_error: DwarfErrorData,
}

impl<'a, 'r> DwarfOp<'a, 'r> {
    pub fn new(
        memory: DwarfMemory<'a>,
        regular_memory: &'a dyn Memory,
        regs: &'r Regs,
        address_size: u8,
    ) -> Self {
        DwarfOp {
            memory,
            regular_memory,
            regs,
            stack: ArrayVec::new(),
            address_mask: if address_size == 4 {
                u32::MAX as u64
            } else {
                u64::MAX
            },
            address_size,
            is_register: false,
            last_error: DwarfErrorData::default(),
        }
    }

    pub fn last_error(&self) -> DwarfErrorData {
        self.last_error
    }

    /// True when the expression named a register rather than computing a
    /// value; the stack top is then the register number.
    pub fn is_register(&self) -> bool {
        self.is_register
    }

    pub fn stack_at(&self, index: usize) -> Option<u64> {
        if index < self.stack.len() {
            Some(self.stack[self.stack.len() - 1 - index])
        } else {
            None
        }
    }

    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    /// Run the expression bytes in `[start, end)`.
    pub fn eval(&mut self, start: u64, end: u64) -> bool {
        if start > end {
            return self.fail(DwarfErrorCode::IllegalValue, start);
        }
        self.is_register = false;
        self.stack.clear();
        self.memory.set_cur_offset(start);
        let mut iterations = 0u32;
        while self.memory.cur_offset() < end {
            if !self.decode() {
                return false;
            }
            // A backward branch can loop forever; bound the work.
            iterations += 1;
            if iterations == MAX_ITERATIONS {
                return self.fail(DwarfErrorCode::TooManyIterations, self.memory.cur_offset());
            }
        }
        true
    }

    fn fail(&mut self, code: DwarfErrorCode, address: u64) -> bool {
        self.last_error = DwarfErrorData::new(code, address);
        false
    }

    fn push(&mut self, value: u64) -> bool {
        if self.stack.try_push(value & self.address_mask).is_err() {
            return self.fail(DwarfErrorCode::StackIndexNotValid, self.memory.cur_offset());
        }
        true
    }

    fn pop(&mut self) -> Option<u64> {
        let offset = self.memory.cur_offset();
        match self.stack.pop() {
            Some(value) => Some(value),
            None => {
                self.fail(DwarfErrorCode::StackIndexNotValid, offset);
                None
            }
        }
    }

    /// Sign-extend a stack value to i64 under the current address size.
    fn signed(&self, value: u64) -> i64 {
        if self.address_size == 4 {
            value as u32 as i32 as i64
        } else {
            value as i64
        }
    }

    fn read_memory(&mut self, addr: u64, size: usize) -> Option<u64> {
        let mut buf = [0u8; 8];
        if !self.regular_memory.read_fully(addr, &mut buf[..size]) {
            self.fail(DwarfErrorCode::MemoryInvalid, addr);
            return None;
        }
        Some(u64::from_le_bytes(buf))
    }

    fn reg_value(&mut self, reg: u64) -> Option<u64> {
        match self.regs.get(reg as u32) {
            Some(value) if (reg as usize) < self.regs.total_regs() => Some(value),
            _ => {
                self.fail(DwarfErrorCode::IllegalValue, self.memory.cur_offset());
                None
            }
        }
    }

    fn binary_op(&mut self, op: u8) -> bool {
        let Some(b) = self.pop() else { return false };
        let Some(a) = self.pop() else { return false };
        let (sa, sb) = (self.signed(a), self.signed(b));
        let result = match op {
            DW_OP_AND => a & b,
            DW_OP_DIV => {
                if b == 0 {
                    return self.fail(DwarfErrorCode::IllegalValue, self.memory.cur_offset());
                }
                sa.wrapping_div(sb) as u64
            }
            DW_OP_MINUS => a.wrapping_sub(b),
            DW_OP_MOD => {
                if b == 0 {
                    return self.fail(DwarfErrorCode::IllegalValue, self.memory.cur_offset());
                }
                a % b
            }
            DW_OP_MUL => a.wrapping_mul(b),
            DW_OP_OR => a | b,
            DW_OP_PLUS => a.wrapping_add(b),
            DW_OP_SHL => {
                if b >= 64 {
                    0
                } else {
                    a.wrapping_shl(b as u32)
                }
            }
            DW_OP_SHR => {
                if b >= 64 {
                    0
                } else {
                    (a & self.address_mask).wrapping_shr(b as u32)
                }
            }
            DW_OP_SHRA => {
                if b >= 64 {
                    if sa < 0 {
                        u64::MAX
                    } else {
                        0
                    }
                } else {
                    sa.wrapping_shr(b as u32) as u64
                }
            }
            DW_OP_XOR => a ^ b,
            DW_OP_EQ => (sa == sb) as u64,
            DW_OP_GE => (sa >= sb) as u64,
            DW_OP_GT => (sa > sb) as u64,
            DW_OP_LE => (sa <= sb) as u64,
            DW_OP_LT => (sa < sb) as u64,
            DW_OP_NE => (sa != sb) as u64,
            _ => unreachable!(),
        };
        self.push(result)
    }

    fn branch(&mut self, offset: i16) -> bool {
        let target = self
            .memory
            .cur_offset()
            .wrapping_add(offset as i64 as u64);
        self.memory.set_cur_offset(target);
        true
    }

    fn decode(&mut self) -> bool {
        let op_offset = self.memory.cur_offset();
        let Some(op) = self.memory.read_u8() else {
            return self.fail(DwarfErrorCode::MemoryInvalid, op_offset);
        };
        macro_rules! operand {
            ($read:ident) => {
                match self.memory.$read() {
                    Some(value) => value,
                    None => return self.fail(DwarfErrorCode::MemoryInvalid, op_offset),
                }
            };
        }
        match op {
            DW_OP_ADDR => {
                let value = operand!(read_address);
                self.push(value)
            }
            DW_OP_DEREF => {
                let Some(addr) = self.pop() else { return false };
                let size = self.address_size as usize;
                match self.read_memory(addr, size) {
                    Some(value) => self.push(value),
                    None => false,
                }
            }
            DW_OP_DEREF_SIZE => {
                let size = operand!(read_u8);
                if size == 0 || size > 8 {
                    return self.fail(DwarfErrorCode::IllegalValue, op_offset);
                }
                let Some(addr) = self.pop() else { return false };
                match self.read_memory(addr, size as usize) {
                    Some(value) => self.push(value),
                    None => false,
                }
            }
            DW_OP_CONST1U => {
                let value = operand!(read_u8);
                self.push(value as u64)
            }
            DW_OP_CONST1S => {
                let value = operand!(read_u8);
                self.push(value as i8 as i64 as u64)
            }
            DW_OP_CONST2U => {
                let value = operand!(read_u16);
                self.push(value as u64)
            }
            DW_OP_CONST2S => {
                let value = operand!(read_u16);
                self.push(value as i16 as i64 as u64)
            }
            DW_OP_CONST4U => {
                let value = operand!(read_u32);
                self.push(value as u64)
            }
            DW_OP_CONST4S => {
                let value = operand!(read_u32);
                self.push(value as i32 as i64 as u64)
            }
            DW_OP_CONST8U | DW_OP_CONST8S => {
                let value = operand!(read_u64);
                self.push(value)
            }
            DW_OP_CONSTU => {
                let value = operand!(read_uleb128);
                self.push(value)
            }
            DW_OP_CONSTS => {
                let value = operand!(read_sleb128);
                self.push(value as u64)
            }
            DW_OP_DUP => match self.stack_at(0) {
                Some(value) => self.push(value),
                None => self.fail(DwarfErrorCode::StackIndexNotValid, op_offset),
            },
            DW_OP_DROP => self.pop().is_some(),
            DW_OP_OVER => match self.stack_at(1) {
                Some(value) => self.push(value),
                None => self.fail(DwarfErrorCode::StackIndexNotValid, op_offset),
            },
            DW_OP_PICK => {
                let index = operand!(read_u8);
                match self.stack_at(index as usize) {
                    Some(value) => self.push(value),
                    None => self.fail(DwarfErrorCode::StackIndexNotValid, op_offset),
                }
            }
            DW_OP_SWAP => {
                let len = self.stack.len();
                if len < 2 {
                    return self.fail(DwarfErrorCode::StackIndexNotValid, op_offset);
                }
                self.stack.swap(len - 1, len - 2);
                true
            }
            DW_OP_ROT => {
                let len = self.stack.len();
                if len < 3 {
                    return self.fail(DwarfErrorCode::StackIndexNotValid, op_offset);
                }
                // top, second, third -> second, third, top
                self.stack.swap(len - 1, len - 2);
                self.stack.swap(len - 2, len - 3);
                true
            }
            DW_OP_ABS => {
                let Some(value) = self.pop() else { return false };
                let value = self.signed(value).unsigned_abs();
                self.push(value)
            }
            DW_OP_NEG => {
                let Some(value) = self.pop() else { return false };
                self.push(self.signed(value).wrapping_neg() as u64)
            }
            DW_OP_NOT => {
                let Some(value) = self.pop() else { return false };
                self.push(!value)
            }
            DW_OP_PLUS_UCONST => {
                let operand = operand!(read_uleb128);
                let Some(value) = self.pop() else { return false };
                self.push(value.wrapping_add(operand))
            }
            DW_OP_AND | DW_OP_DIV | DW_OP_MINUS | DW_OP_MOD | DW_OP_MUL | DW_OP_OR
            | DW_OP_PLUS | DW_OP_SHL | DW_OP_SHR | DW_OP_SHRA | DW_OP_XOR | DW_OP_EQ
            | DW_OP_GE | DW_OP_GT | DW_OP_LE | DW_OP_LT | DW_OP_NE => self.binary_op(op),
            DW_OP_BRA => {
                let offset = operand!(read_u16) as i16;
                let Some(condition) = self.pop() else {
                    return false;
                };
                if condition != 0 {
                    self.branch(offset)
                } else {
                    true
                }
            }
            DW_OP_SKIP => {
                let offset = operand!(read_u16) as i16;
                self.branch(offset)
            }
            DW_OP_LIT0..=DW_OP_LIT31 => self.push((op - DW_OP_LIT0) as u64),
            DW_OP_REG0..=DW_OP_REG31 => {
                self.is_register = true;
                self.push((op - DW_OP_REG0) as u64)
            }
            DW_OP_REGX => {
                let reg = operand!(read_uleb128);
                self.is_register = true;
                self.push(reg)
            }
            DW_OP_BREG0..=DW_OP_BREG31 => {
                let offset = operand!(read_sleb128);
                let Some(value) = self.reg_value((op - DW_OP_BREG0) as u64) else {
                    return false;
                };
                self.push(value.wrapping_add(offset as u64))
            }
            DW_OP_BREGX => {
                let reg = operand!(read_uleb128);
                let offset = operand!(read_sleb128);
                let Some(value) = self.reg_value(reg) else {
                    return false;
                };
                self.push(value.wrapping_add(offset as u64))
            }
            DW_OP_NOP => true,
            _ => self.fail(DwarfErrorCode::NotImplemented, op_offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use crate::memory::MemoryBuffer;
    use crate::regs::x86_64::*;

    fn eval(expr: &[u8], stack_mem: &[(u64, u64)], regs: &Regs) -> Result<u64, DwarfErrorCode> {
        let section = MemoryBuffer::new(expr.to_vec());
        let mut process = vec![0u8; 0x200];
        for (addr, value) in stack_mem {
            process[*addr as usize..*addr as usize + 8].copy_from_slice(&value.to_le_bytes());
        }
        let process = MemoryBuffer::new(process);
        let mut op = DwarfOp::new(DwarfMemory::new(&section, false, 8), &process, regs, 8);
        if !op.eval(0, expr.len() as u64) {
            return Err(op.last_error().code);
        }
        op.stack_at(0).ok_or(DwarfErrorCode::StackIndexNotValid)
    }

    fn regs() -> Regs {
        Regs::new(Arch::X86_64)
    }

    #[test]
    fn literals_and_arithmetic() {
        // lit8 lit3 minus -> 5
        assert_eq!(eval(&[0x38, 0x33, 0x1c], &[], &regs()), Ok(5));
        // lit8 lit3 mul -> 24
        assert_eq!(eval(&[0x38, 0x33, 0x1e], &[], &regs()), Ok(24));
        // const1s -1 abs -> 1
        assert_eq!(eval(&[0x09, 0xff, 0x19], &[], &regs()), Ok(1));
        // division by zero fails
        assert_eq!(
            eval(&[0x38, 0x30, 0x1b], &[], &regs()),
            Err(DwarfErrorCode::IllegalValue)
        );
    }

    #[test]
    fn stack_manipulation() {
        // lit1 lit2 swap minus -> 2 - 1 = 1
        assert_eq!(eval(&[0x31, 0x32, 0x16, 0x1c], &[], &regs()), Ok(1));
        // lit1 lit2 over -> copies 1
        assert_eq!(eval(&[0x31, 0x32, 0x14], &[], &regs()), Ok(1));
        // lit5 lit6 lit7 rot -> top becomes 6
        assert_eq!(eval(&[0x35, 0x36, 0x37, 0x17], &[], &regs()), Ok(6));
        // pick 2 -> copies third entry
        assert_eq!(eval(&[0x35, 0x36, 0x37, 0x15, 0x02], &[], &regs()), Ok(5));
        // drop on empty stack fails
        assert_eq!(
            eval(&[0x13], &[], &regs()),
            Err(DwarfErrorCode::StackIndexNotValid)
        );
    }

    #[test]
    fn comparisons_are_signed() {
        // const1s -1 lit1 lt -> 1
        assert_eq!(eval(&[0x09, 0xff, 0x31, 0x2d], &[], &regs()), Ok(1));
        // lit1 const1s -1 gt -> 1
        assert_eq!(eval(&[0x31, 0x09, 0xff, 0x2b], &[], &regs()), Ok(1));
    }

    #[test]
    fn breg_adds_signed_offset() {
        let mut regs = regs();
        regs.set(X86_64_REG_SP, 0x100);
        // breg7 -8 -> 0xf8
        assert_eq!(eval(&[0x77, 0x78], &[], &regs), Ok(0xf8));
    }

    #[test]
    fn deref_reads_process_memory() {
        // lit16 deref
        assert_eq!(
            eval(&[0x40, 0x06], &[(0x10, 0xcafe)], &regs()),
            Ok(0xcafe)
        );
        // deref_size 2
        assert_eq!(
            eval(&[0x40, 0x94, 0x02], &[(0x10, 0x11223344)], &regs()),
            Ok(0x3344)
        );
    }

    #[test]
    fn bra_skips_when_nonzero() {
        // lit1 bra +1 (skip the lit2) lit3 -> 3
        assert_eq!(
            eval(&[0x31, 0x28, 0x01, 0x00, 0x32, 0x33], &[], &regs()),
            Ok(3)
        );
        // lit0 bra -> falls through, lit2 on top before lit3
        assert_eq!(
            eval(&[0x30, 0x28, 0x01, 0x00, 0x32, 0x33], &[], &regs()),
            Ok(3)
        );
    }

    #[test]
    fn infinite_loop_is_bounded() {
        // skip -3: branches back onto itself forever.
        assert_eq!(
            eval(&[0x2f, 0xfd, 0xff], &[], &regs()),
            Err(DwarfErrorCode::TooManyIterations)
        );
    }

    #[test]
    fn reg_names_a_register() {
        let section = MemoryBuffer::new(vec![0x56]); // DW_OP_reg6
        let process = MemoryBuffer::new(Vec::new());
        let regs = regs();
        let mut op = DwarfOp::new(DwarfMemory::new(&section, false, 8), &process, &regs, 8);
        assert!(op.eval(0, 1));
        assert!(op.is_register());
        assert_eq!(op.stack_at(0), Some(6));
    }

    #[test]
    fn unknown_opcode_fails() {
        assert_eq!(
            eval(&[0xa9], &[], &regs()),
            Err(DwarfErrorCode::NotImplemented)
        );
    }

    #[test]
    fn thirty_two_bit_wraparound() {
        let section = MemoryBuffer::new(vec![0x0c, 0xff, 0xff, 0xff, 0xff, 0x31, 0x22]);
        let process = MemoryBuffer::new(Vec::new());
        let regs = Regs::new(Arch::X86);
        let mut op = DwarfOp::new(DwarfMemory::new(&section, false, 4), &process, &regs, 4);
        assert!(op.eval(0, 7));
        // const4u 0xffffffff plus lit1 wraps to zero at 32 bits.
        assert_eq!(op.stack_at(0), Some(0));
    }
}
