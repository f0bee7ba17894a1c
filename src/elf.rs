use std::sync::{Arc, Mutex};

use crate::arch::Arch;
use crate::error::ErrorData;
use crate::map_info::MapInfo;
use crate::memory::{Memory, MemoryRange};
use crate::memory_xz::MemoryXz;
use crate::regs::Regs;
use crate::shared_string::SharedString;

mod interface {
    use crate::arch::Arch;
    use crate::error::ErrorData;
    use crate::memory::Memory;
    use crate::regs::Regs;

    /// The class-erased face of `ElfInterface<Elf32/Elf64>`, so `Elf` can
    /// hold either without threading the class through every caller.
    pub(crate) trait Interface: Send + Sync {
        fn arch(&self) -> Arch;
        fn load_bias(&self) -> i64;
        fn last_error(&self) -> ErrorData;
        fn step_dwarf(
            &self,
            pc: u64,
            regs: &mut Regs,
            process_memory: &dyn Memory,
            finished: &mut bool,
            is_signal_frame: &mut bool,
        ) -> bool;
        fn step_exidx(
            &self,
            pc: u64,
            regs: &mut Regs,
            process_memory: &dyn Memory,
            finished: &mut bool,
        ) -> bool;
        fn is_valid_pc(&self, pc: u64) -> bool;
        fn function_name(&self, addr: u64) -> Option<(String, u64)>;
        fn global_variable_offset(&self, name: &str) -> Option<u64>;
        fn soname(&self) -> Option<String>;
        fn build_id(&self) -> Option<Vec<u8>>;
        fn gnu_debugdata_info(&self) -> Option<(u64, u64)>;
    }
}
pub(crate) use interface::Interface;

macro_rules! forward_interface {
    ($ty:ty) => {
        impl Interface for $ty {
            fn arch(&self) -> Arch {
                self.arch()
            }
            fn load_bias(&self) -> i64 {
                self.load_bias()
            }
            fn last_error(&self) -> ErrorData {
                self.last_error()
            }
            fn step_dwarf(
                &self,
                pc: u64,
                regs: &mut Regs,
                process_memory: &dyn Memory,
                finished: &mut bool,
                is_signal_frame: &mut bool,
            ) -> bool {
                self.step_dwarf(pc, regs, process_memory, finished, is_signal_frame)
            }
            fn step_exidx(
                &self,
                pc: u64,
                regs: &mut Regs,
                process_memory: &dyn Memory,
                finished: &mut bool,
            ) -> bool {
                self.step_exidx(pc, regs, process_memory, finished)
            }
            fn is_valid_pc(&self, pc: u64) -> bool {
                self.is_valid_pc(pc)
            }
            fn function_name(&self, addr: u64) -> Option<(String, u64)> {
                self.function_name(addr)
            }
            fn global_variable_offset(&self, name: &str) -> Option<u64> {
                self.global_variable_offset(name)
            }
            fn soname(&self) -> Option<String> {
                self.soname()
            }
            fn build_id(&self) -> Option<Vec<u8>> {
                self.build_id()
            }
            fn gnu_debugdata_info(&self) -> Option<(u64, u64)> {
                self.gnu_debugdata_info()
            }
        }
    };
}
forward_interface!(crate::elf_interface::ElfInterface32);
forward_interface!(crate::elf_interface::ElfInterface64);

/// An ELF image and everything unwinding needs from it. Construction
/// never fails; an unparseable image yields an invalid `Elf` that answers
/// all queries negatively, so a map is only ever probed once.
pub struct Elf {
    memory: Arc<dyn Memory>,
    interface: Option<Box<dyn Interface>>,
    /// Inner ELF parsed from the decompressed `.gnu_debugdata`, consulted
    /// only when the outer image has no unwind info at the PC.
    gnu_debugdata_interface: Option<Box<dyn Interface>>,
    valid: Mutex<bool>,
    arch: Arch,
    load_bias: i64,
    last_error: Mutex<ErrorData>,
}

fn make_interface(memory: &Arc<dyn Memory>) -> Option<Box<dyn Interface>> {
    use crate::elf_interface::{ElfInterface32, ElfInterface64};
    let mut ident = [0u8; 5];
    if !memory.read_fully(0, &mut ident) {
        return None;
    }
    match ident[4] {
        object::elf::ELFCLASS32 => {
            ElfInterface32::new(memory.clone()).map(|i| Box::new(i) as Box<dyn Interface>)
        }
        object::elf::ELFCLASS64 => {
            ElfInterface64::new(memory.clone()).map(|i| Box::new(i) as Box<dyn Interface>)
        }
        _ => None,
    }
}

impl Elf {
    pub fn new(memory: Arc<dyn Memory>) -> Elf {
        let interface = make_interface(&memory);
        let (arch, load_bias) = interface
            .as_ref()
            .map(|i| (i.arch(), i.load_bias()))
            .unwrap_or((Arch::Unknown, 0));
        let gnu_debugdata_interface = interface.as_ref().and_then(|outer| {
            let (offset, size) = outer.gnu_debugdata_info()?;
            let xz = MemoryXz::new(&*memory, offset, size)?;
            let inner: Arc<dyn Memory> = Arc::new(xz);
            make_interface(&inner)
        });
        Elf {
            valid: Mutex::new(interface.is_some()),
            interface,
            gnu_debugdata_interface,
            memory,
            arch,
            load_bias,
            last_error: Mutex::new(ErrorData::default()),
        }
    }

    pub fn valid(&self) -> bool {
        *self.valid.lock().unwrap()
    }

    /// Mark this ELF unusable (e.g. its architecture does not match the
    /// process being unwound). It stays attached to its map so the map is
    /// not re-probed.
    pub fn invalidate(&self) {
        *self.valid.lock().unwrap() = false;
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn load_bias(&self) -> i64 {
        self.load_bias
    }

    pub fn memory(&self) -> &Arc<dyn Memory> {
        &self.memory
    }

    pub fn last_error(&self) -> ErrorData {
        *self.last_error.lock().unwrap()
    }

    /// Convert an absolute PC into this image's virtual address space.
    pub fn get_rel_pc(&self, pc: u64, map_info: &MapInfo) -> u64 {
        pc.wrapping_sub(map_info.start())
            .wrapping_add(map_info.elf_offset())
            .wrapping_add(self.load_bias as u64)
    }

    /// True when some unwind table of this image covers `pc`.
    pub fn is_valid_pc(&self, pc: u64) -> bool {
        if !self.valid() {
            return false;
        }
        if let Some(interface) = &self.interface {
            if interface.is_valid_pc(pc) {
                return true;
            }
        }
        if let Some(inner) = &self.gnu_debugdata_interface {
            if inner.is_valid_pc(pc) {
                return true;
            }
        }
        false
    }

    /// Unwind one frame at `rel_pc`. Engine priority: the image's own
    /// DWARF sections, then the mini-debug `.debug_frame`, then the ARM
    /// exception index.
    pub fn step(
        &self,
        rel_pc: u64,
        regs: &mut Regs,
        process_memory: &dyn Memory,
        finished: &mut bool,
        is_signal_frame: &mut bool,
    ) -> bool {
        if !self.valid() {
            return false;
        }
        let Some(interface) = &self.interface else {
            return false;
        };
        if interface.step_dwarf(rel_pc, regs, process_memory, finished, is_signal_frame) {
            return true;
        }
        *self.last_error.lock().unwrap() = interface.last_error();
        if let Some(inner) = &self.gnu_debugdata_interface {
            if inner.step_dwarf(rel_pc, regs, process_memory, finished, is_signal_frame) {
                return true;
            }
            *self.last_error.lock().unwrap() = inner.last_error();
        }
        if self.arch == Arch::Arm {
            if interface.step_exidx(rel_pc, regs, process_memory, finished) {
                return true;
            }
            *self.last_error.lock().unwrap() = interface.last_error();
        }
        false
    }

    /// Find the function symbol containing `addr`, consulting the outer
    /// symbol tables first and the mini-debug image second.
    pub fn get_function_name(&self, addr: u64) -> Option<(SharedString, u64)> {
        if !self.valid() {
            return None;
        }
        let lookup = |interface: &Box<dyn Interface>| {
            interface
                .function_name(addr)
                .map(|(name, offset)| (SharedString::from(name), offset))
        };
        self.interface
            .as_ref()
            .and_then(lookup)
            .or_else(|| self.gnu_debugdata_interface.as_ref().and_then(lookup))
    }

    /// File offset of a global object symbol, for the JIT descriptor
    /// discovery protocol.
    pub fn get_global_variable_offset(&self, name: &str) -> Option<u64> {
        if !self.valid() {
            return None;
        }
        self.interface.as_ref()?.global_variable_offset(name)
    }

    pub fn get_soname(&self) -> Option<String> {
        if !self.valid() {
            return None;
        }
        self.interface.as_ref()?.soname()
    }

    /// The raw GNU build-id bytes, or `None` when the image carries no
    /// build-id note.
    pub fn get_build_id(&self) -> Option<Vec<u8>> {
        self.interface.as_ref()?.build_id()
    }

    /// Static helper: parse only enough of `memory` to get the load bias.
    pub fn get_load_bias_from_memory(memory: &Arc<dyn Memory>) -> i64 {
        make_interface(memory).map_or(0, |i| i.load_bias())
    }

    /// Static helper: is there a parseable ELF at the start of `memory`?
    pub fn is_valid_elf(memory: &dyn Memory) -> bool {
        let mut magic = [0u8; 4];
        memory.read_fully(0, &mut magic) && magic == crate::elf_interface::ELF_MAGIC
    }

    /// Static helper: the file size an ELF at `memory` spans, computed
    /// from its section headers (the dynamic linker typically maps only
    /// the loadable part; the symbol data beyond it is still in the
    /// file). Returns `None` when there is no ELF here.
    pub fn get_info(memory: &dyn Memory) -> Option<u64> {
        if !Self::is_valid_elf(memory) {
            return None;
        }
        let mut ident = [0u8; 6];
        if !memory.read_fully(0, &mut ident) {
            return None;
        }
        let big_endian = ident[5] == object::elf::ELFDATA2MSB;
        let read_u16 = |offset: u64| -> Option<u64> {
            let mut buf = [0u8; 2];
            memory.read_fully(offset, &mut buf).then(|| {
                (if big_endian {
                    u16::from_be_bytes(buf)
                } else {
                    u16::from_le_bytes(buf)
                }) as u64
            })
        };
        let (shoff_offset, shentsize_offset, shnum_offset) =
            if ident[4] == object::elf::ELFCLASS64 {
                (0x28u64, 0x3au64, 0x3cu64)
            } else {
                (0x20u64, 0x2eu64, 0x30u64)
            };
        let shoff = if ident[4] == object::elf::ELFCLASS64 {
            let mut buf = [0u8; 8];
            if !memory.read_fully(shoff_offset, &mut buf) {
                return None;
            }
            if big_endian {
                u64::from_be_bytes(buf)
            } else {
                u64::from_le_bytes(buf)
            }
        } else {
            let mut buf = [0u8; 4];
            if !memory.read_fully(shoff_offset, &mut buf) {
                return None;
            }
            (if big_endian {
                u32::from_be_bytes(buf)
            } else {
                u32::from_le_bytes(buf)
            }) as u64
        };
        let shentsize = read_u16(shentsize_offset)?;
        let shnum = read_u16(shnum_offset)?;
        Some(shoff + shentsize * shnum)
    }

    /// Build the memory view for a JIT symfile spanning
    /// `[start, start + size)` in the target process.
    pub fn memory_from_process(
        process_memory: Arc<dyn Memory>,
        start: u64,
        size: u64,
    ) -> Arc<dyn Memory> {
        Arc::new(MemoryRange::new(process_memory, start, size, 0))
    }
}
