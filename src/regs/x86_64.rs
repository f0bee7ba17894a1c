use crate::elf::Elf;
use crate::memory::Memory;

use super::Regs;

pub const X86_64_REG_RAX: u32 = 0;
pub const X86_64_REG_RDX: u32 = 1;
pub const X86_64_REG_RCX: u32 = 2;
pub const X86_64_REG_RBX: u32 = 3;
pub const X86_64_REG_RSI: u32 = 4;
pub const X86_64_REG_RDI: u32 = 5;
pub const X86_64_REG_RBP: u32 = 6;
pub const X86_64_REG_SP: u32 = 7;
pub const X86_64_REG_R8: u32 = 8;
pub const X86_64_REG_R15: u32 = 15;
pub const X86_64_REG_PC: u32 = 16;
pub const X86_64_REG_COUNT: usize = 17;

pub(crate) const REGISTER_NAMES: &[&str] = &[
    "rax", "rdx", "rcx", "rbx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15", "rip",
];

// __restore_rt:
//   mov rax, 0xf
//   syscall
const RT_SIGRETURN: [u8; 9] = [0x48, 0xc7, 0xc0, 0x0f, 0x00, 0x00, 0x00, 0x0f, 0x05];

// The ucontext sits at the handler's stack pointer; uc_mcontext at 0x28.
const MCONTEXT_OFFSET: u64 = 0x28;

// sigcontext layout: r8 r9 r10 r11 r12 r13 r14 r15 rdi rsi rbp rbx rdx rax
// rcx rsp rip.
const SIGCONTEXT_ORDER: [u32; 17] = [
    X86_64_REG_R8,
    9,
    10,
    11,
    12,
    13,
    14,
    X86_64_REG_R15,
    X86_64_REG_RDI,
    X86_64_REG_RSI,
    X86_64_REG_RBP,
    X86_64_REG_RBX,
    X86_64_REG_RDX,
    X86_64_REG_RAX,
    X86_64_REG_RCX,
    X86_64_REG_SP,
    X86_64_REG_PC,
];

pub(super) fn step_if_signal_handler(
    regs: &mut Regs,
    rel_pc: u64,
    elf: &Elf,
    process_memory: &dyn Memory,
) -> bool {
    let mut data = [0u8; 9];
    if !elf.memory().read_fully(rel_pc, &mut data) || data != RT_SIGRETURN {
        return false;
    }

    let context = regs.sp() + MCONTEXT_OFFSET;
    let mut buf = [0u8; 17 * 8];
    if !process_memory.read_fully(context, &mut buf) {
        return false;
    }
    for (i, reg) in SIGCONTEXT_ORDER.iter().enumerate() {
        let value = u64::from_le_bytes(buf[i * 8..(i + 1) * 8].try_into().unwrap());
        regs.set(*reg, value);
    }
    true
}
