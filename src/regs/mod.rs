pub mod arm;
pub mod arm64;
pub mod riscv64;
pub mod x86;
pub mod x86_64;

use crate::arch::Arch;
use crate::elf::Elf;
use crate::memory::Memory;

/// The register file of one thread: a fixed-length array of address-sized
/// values indexed by the architecture's DWARF register numbering.
///
/// On arm32 and x86 the values are still stored as `u64`; the engines mask
/// arithmetic down to 32 bits where the architecture requires it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Regs {
    arch: Arch,
    regs: Vec<u64>,
    /// PC of the most recent DEX bytecode frame, produced by CFI that
    /// targets the DEX pseudo register. Zero when absent.
    dex_pc: u64,
}

impl Regs {
    pub fn new(arch: Arch) -> Regs {
        Regs {
            arch,
            regs: vec![0; arch.register_count()],
            dex_pc: 0,
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn total_regs(&self) -> usize {
        self.regs.len()
    }

    pub fn get(&self, reg: u32) -> Option<u64> {
        self.regs.get(reg as usize).copied()
    }

    pub fn set(&mut self, reg: u32, value: u64) {
        if let Some(slot) = self.regs.get_mut(reg as usize) {
            *slot = value;
        }
    }

    pub fn pc(&self) -> u64 {
        self.regs[self.arch.pc_reg() as usize] & self.arch.ptrauth_mask()
    }

    pub fn sp(&self) -> u64 {
        self.regs[self.arch.sp_reg() as usize]
    }

    pub fn set_pc(&mut self, pc: u64) {
        let reg = self.arch.pc_reg();
        self.set(reg, pc);
    }

    pub fn set_sp(&mut self, sp: u64) {
        let reg = self.arch.sp_reg();
        self.set(reg, sp);
    }

    pub fn dex_pc(&self) -> u64 {
        self.dex_pc
    }

    pub fn set_dex_pc(&mut self, dex_pc: u64) {
        self.dex_pc = dex_pc;
    }

    /// Last-resort unwind: set the PC from the architecture's return
    /// address register, or from the word at the top of the stack on x86.
    /// Fails when that would not change the PC.
    pub fn set_pc_from_return_address(&mut self, process_memory: &dyn Memory) -> bool {
        let ra = match self.arch.ra_reg() {
            Some(reg) => self.regs[reg as usize] & self.arch.ptrauth_mask(),
            None => {
                let mut buf = [0u8; 8];
                let size = self.arch.pointer_size();
                if !process_memory.read_fully(self.sp(), &mut buf[..size]) {
                    return false;
                }
                u64::from_le_bytes(buf) & if size == 4 { u32::MAX as u64 } else { u64::MAX }
            }
        };
        if self.pc() == ra {
            return false;
        }
        self.set_pc(ra);
        true
    }

    /// Iterate over registers with their canonical names, in the order the
    /// snapshot format writes them.
    pub fn iterate<F: FnMut(&'static str, u64)>(&self, mut f: F) {
        let names = register_names(self.arch);
        for (i, &name) in names.iter().enumerate() {
            f(name, self.regs[i]);
        }
    }

    /// Detect a kernel signal-return trampoline at `rel_pc` inside `elf`
    /// and, if found, restore every register from the signal context on
    /// the stack. The trampoline bytes are read from the ELF memory; the
    /// context is read from process memory.
    pub fn step_if_signal_handler(
        &mut self,
        rel_pc: u64,
        elf: &Elf,
        process_memory: &dyn Memory,
    ) -> bool {
        match self.arch {
            Arch::Arm => arm::step_if_signal_handler(self, rel_pc, elf, process_memory),
            Arch::Arm64 => arm64::step_if_signal_handler(self, rel_pc, elf, process_memory),
            Arch::X86 => x86::step_if_signal_handler(self, rel_pc, elf, process_memory),
            Arch::X86_64 => x86_64::step_if_signal_handler(self, rel_pc, elf, process_memory),
            Arch::Riscv64 => riscv64::step_if_signal_handler(self, rel_pc, elf, process_memory),
            Arch::Unknown => false,
        }
    }
}

pub(crate) fn register_names(arch: Arch) -> &'static [&'static str] {
    match arch {
        Arch::Arm => arm::REGISTER_NAMES,
        Arch::Arm64 => arm64::REGISTER_NAMES,
        Arch::X86 => x86::REGISTER_NAMES,
        Arch::X86_64 => x86_64::REGISTER_NAMES,
        Arch::Riscv64 => riscv64::REGISTER_NAMES,
        Arch::Unknown => &[],
    }
}

/// Read `count` little-endian words of `word_size` bytes from
/// `process_memory` at `addr` into consecutive registers starting at
/// `first_reg`. Shared by the per-arch signal-context restorers.
pub(crate) fn restore_regs_from_memory(
    regs: &mut Regs,
    first_reg: u32,
    addr: u64,
    count: usize,
    word_size: usize,
    process_memory: &dyn Memory,
) -> bool {
    let mut buf = vec![0u8; count * word_size];
    if !process_memory.read_fully(addr, &mut buf) {
        return false;
    }
    for i in 0..count {
        let chunk = &buf[i * word_size..(i + 1) * word_size];
        let value = match word_size {
            4 => u32::from_le_bytes(chunk.try_into().unwrap()) as u64,
            _ => u64::from_le_bytes(chunk.try_into().unwrap()),
        };
        regs.set(first_reg + i as u32, value);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryOfflineBuffer;

    #[test]
    fn pc_read_strips_pointer_authentication_bits() {
        let mut regs = Regs::new(Arch::Arm64);
        // Authentication hash in the top byte.
        regs.set(arm64::ARM64_REG_PC, 0xff00_0064_d09d_4fd8);
        assert_eq!(regs.pc(), 0x64_d09d_4fd8);
    }

    #[test]
    fn x86_64_return_address_comes_from_the_stack() {
        let mut regs = Regs::new(Arch::X86_64);
        regs.set(x86_64::X86_64_REG_SP, 0x1000);
        let stack = 0x12345678u64.to_le_bytes();
        let memory = MemoryOfflineBuffer::new(stack.to_vec(), 0x1000);
        assert!(regs.set_pc_from_return_address(&memory));
        assert_eq!(regs.pc(), 0x12345678);
        // A second attempt no longer changes the PC and must fail.
        assert!(!regs.set_pc_from_return_address(&memory));
    }

    #[test]
    fn arm64_return_address_comes_from_lr() {
        let mut regs = Regs::new(Arch::Arm64);
        regs.set(arm64::ARM64_REG_LR, 0x7000);
        let memory = MemoryOfflineBuffer::new(Vec::new(), 0);
        assert!(regs.set_pc_from_return_address(&memory));
        assert_eq!(regs.pc(), 0x7000);
    }

    #[test]
    fn register_iteration_uses_canonical_names() {
        let regs = Regs::new(Arch::Arm64);
        let mut names = Vec::new();
        regs.iterate(|name, _| names.push(name));
        assert_eq!(names.len(), arm64::ARM64_REG_COUNT);
        assert_eq!(names[0], "x0");
        assert_eq!(names[31], "sp");
        assert_eq!(names[32], "pc");
        assert_eq!(names[33], "pst");
    }
}
