use crate::elf::Elf;
use crate::memory::Memory;

use super::{restore_regs_from_memory, Regs};

pub const ARM64_REG_R0: u32 = 0;
pub const ARM64_REG_R29: u32 = 29;
pub const ARM64_REG_LR: u32 = 30;
pub const ARM64_REG_SP: u32 = 31;
pub const ARM64_REG_PC: u32 = 32;
pub const ARM64_REG_PSTATE: u32 = 33;
pub const ARM64_REG_COUNT: usize = 34;

pub(crate) const REGISTER_NAMES: &[&str] = &[
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "x29", "lr", "sp", "pc", "pst",
];

// __kernel_rt_sigreturn:
//   mov x8, #0x8b
//   svc #0
const SIGRETURN: [u32; 2] = [0xd2801168, 0xd4000001];

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
    if !elf.memory().read_fully(rel_pc, &mut data) {
        return false;
    }
    if u32::from_le_bytes(data[..4].try_into().unwrap()) != SIGRETURN[0]
        || u32::from_le_bytes(data[4..].try_into().unwrap()) != SIGRETURN[1]
    {
        return false;
    }

    // Skip the fault_address word at the start of the mcontext; x0..x30,
    // sp and pc follow it directly.
    let base = regs.sp() + SIGINFO_SIZE + MCONTEXT_OFFSET + 8;
    restore_regs_from_memory(regs, ARM64_REG_R0, base, 33, 8, process_memory)
}
