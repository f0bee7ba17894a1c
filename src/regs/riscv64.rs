use crate::elf::Elf;
use crate::memory::Memory;

use super::{restore_regs_from_memory, Regs};

pub const RISCV64_REG_PC: u32 = 0;
pub const RISCV64_REG_RA: u32 = 1;
pub const RISCV64_REG_SP: u32 = 2;
pub const RISCV64_REG_COUNT: usize = 32;

pub(crate) const REGISTER_NAMES: &[&str] = &[
    "pc", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4", "a5",
    "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4", "t5",
    "t6",
];

// __kernel_rt_sigreturn:
//   li a7, __NR_rt_sigreturn
//   scall
const SIGRETURN: [u8; 8] = [0x93, 0x08, 0xb0, 0x08, 0x73, 0x00, 0x00, 0x00];

// sizeof(siginfo_t) + offsetof(ucontext_t, uc_mcontext).
const SIGINFO_SIZE: u64 = 0x80;
const MCONTEXT_OFFSET: u64 = 0xb0;

pub(super) fn step_if_signal_handler(
    regs: &mut Regs,
    rel_pc: u64,
    elf: &Elf,
    process_memory: &dyn Memory,
) -> bool {
    let mut data = [0u8; 8];
    if !elf.memory().read_fully(rel_pc, &mut data) || data != SIGRETURN {
        return false;
    }

    // The riscv64 mcontext begins with the pc, followed by x1..x31, which
    // matches the register numbering exactly.
    let base = regs.sp() + SIGINFO_SIZE + MCONTEXT_OFFSET;
    restore_regs_from_memory(regs, RISCV64_REG_PC, base, RISCV64_REG_COUNT, 8, process_memory)
}
