use crate::elf::Elf;
use crate::memory::Memory;

use super::{restore_regs_from_memory, Regs};

pub const ARM_REG_R0: u32 = 0;
pub const ARM_REG_SP: u32 = 13;
pub const ARM_REG_LR: u32 = 14;
pub const ARM_REG_PC: u32 = 15;
pub const ARM_REG_COUNT: usize = 16;

pub(crate) const REGISTER_NAMES: &[&str] = &[
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "ip", "sp", "lr",
    "pc",
];

// The kernel-provided return trampolines, in ARM and Thumb encodings:
//   mov r7, #0x77 / svc #0x770000 / svc #0x2777  (sigreturn)
//   mov r7, #0xad / svc #0xad0000 / svc #0x27ad  (rt_sigreturn)
const SIGRETURN: [u32; 3] = [0xe3a07077, 0xef900077, 0xdf002777];
const RT_SIGRETURN: [u32; 3] = [0xe3a070ad, 0xef9000ad, 0xdf0027ad];

// sigcontext: trap_no, error_code, oldmask precede arm_r0.
const SIGCONTEXT_REGS_OFFSET: u64 = 0xc;
// rt frame: siginfo_t, then ucontext up to uc_mcontext.
const RT_SIGINFO_SIZE: u64 = 0x80;
const RT_MCONTEXT_OFFSET: u64 = 0x14;

pub(super) fn step_if_signal_handler(
    regs: &mut Regs,
    rel_pc: u64,
    elf: &Elf,
    process_memory: &dyn Memory,
) -> bool {
    let mut buf = [0u8; 4];
    if !elf.memory().read_fully(rel_pc, &mut buf) {
        return false;
    }
    let data = u32::from_le_bytes(buf);

    let context = if SIGRETURN.contains(&data) {
        regs.sp() + SIGCONTEXT_REGS_OFFSET
    } else if RT_SIGRETURN.contains(&data) {
        regs.sp() + RT_SIGINFO_SIZE + RT_MCONTEXT_OFFSET + SIGCONTEXT_REGS_OFFSET
    } else {
        return false;
    };

    restore_regs_from_memory(regs, ARM_REG_R0, context, ARM_REG_COUNT, 4, process_memory)
}
