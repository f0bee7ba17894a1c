use crate::regs::{arm, arm64, riscv64, x86, x86_64};

/// The CPU architectures this crate can unwind.
///
/// Each tag fixes the register numbering (which follows the DWARF numbering
/// of the architecture), the indices of the stack pointer and program
/// counter, and the register used as a last-resort return address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Arch {
    #[default]
    Unknown,
    Arm,
    Arm64,
    X86,
    X86_64,
    Riscv64,
}

impl Arch {
    pub fn from_elf_machine(machine: u16, is_64: bool) -> Arch {
        use object::elf;
        match (machine, is_64) {
            (elf::EM_ARM, false) => Arch::Arm,
            (elf::EM_AARCH64, true) => Arch::Arm64,
            (elf::EM_386, false) => Arch::X86,
            (elf::EM_X86_64, true) => Arch::X86_64,
            (elf::EM_RISCV, true) => Arch::Riscv64,
            _ => Arch::Unknown,
        }
    }

    /// Number of registers tracked for this architecture.
    pub fn register_count(self) -> usize {
        match self {
            Arch::Arm => arm::ARM_REG_COUNT,
            Arch::Arm64 => arm64::ARM64_REG_COUNT,
            Arch::X86 => x86::X86_REG_COUNT,
            Arch::X86_64 => x86_64::X86_64_REG_COUNT,
            Arch::Riscv64 => riscv64::RISCV64_REG_COUNT,
            Arch::Unknown => 0,
        }
    }

    pub fn sp_reg(self) -> u32 {
        match self {
            Arch::Arm => arm::ARM_REG_SP,
            Arch::Arm64 => arm64::ARM64_REG_SP,
            Arch::X86 => x86::X86_REG_SP,
            Arch::X86_64 => x86_64::X86_64_REG_SP,
            Arch::Riscv64 => riscv64::RISCV64_REG_SP,
            Arch::Unknown => 0,
        }
    }

    pub fn pc_reg(self) -> u32 {
        match self {
            Arch::Arm => arm::ARM_REG_PC,
            Arch::Arm64 => arm64::ARM64_REG_PC,
            Arch::X86 => x86::X86_REG_PC,
            Arch::X86_64 => x86_64::X86_64_REG_PC,
            Arch::Riscv64 => riscv64::RISCV64_REG_PC,
            Arch::Unknown => 0,
        }
    }

    /// The register holding the return address when no unwind info applies,
    /// or `None` when the return address lives on the stack (x86 family).
    pub fn ra_reg(self) -> Option<u32> {
        match self {
            Arch::Arm => Some(arm::ARM_REG_LR),
            Arch::Arm64 => Some(arm64::ARM64_REG_LR),
            Arch::Riscv64 => Some(riscv64::RISCV64_REG_RA),
            Arch::X86 | Arch::X86_64 | Arch::Unknown => None,
        }
    }

    /// Pointer width of the architecture, in bytes.
    pub fn pointer_size(self) -> usize {
        match self {
            Arch::Arm | Arch::X86 => 4,
            Arch::Arm64 | Arch::X86_64 | Arch::Riscv64 => 8,
            Arch::Unknown => 8,
        }
    }

    /// Mask applied to PC and LR reads before lookup, stripping pointer
    /// authentication bits on architectures that have them. The kept bits
    /// cover the whole user address range.
    pub fn ptrauth_mask(self) -> u64 {
        match self {
            Arch::Arm64 => (1 << 55) - 1,
            _ => u64::MAX,
        }
    }
}
