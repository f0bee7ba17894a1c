use std::sync::{Arc, Mutex};

use crate::arch::Arch;
use crate::dex::{DexCache, DexFile};
use crate::elf::Elf;
use crate::maps::Maps;
use crate::map_info::{PROT_READ, PROT_WRITE};
use crate::memory::Memory;
use crate::shared_string::SharedString;

// This implements the reader side of the JIT Compilation Interface.
// See https://sourceware.org/gdb/onlinedocs/gdb/JIT-Interface.html
//
// Managed runtimes publish in-memory ELF files through it, and list the
// DEX files in use through an identically shaped descriptor.

const JIT_DESCRIPTOR_VERSION: u32 = 1;

/// A symbol-bearing file discovered through a debug descriptor.
pub trait GlobalDebugSymfile: Sized + Send + Sync {
    fn load(
        maps: &Maps,
        memory: &Arc<dyn Memory>,
        addr: u64,
        size: u64,
        dex_cache: Option<&DexCache>,
    ) -> Option<Arc<Self>>;
    fn is_valid_pc(&self, pc: u64) -> bool;
    fn get_function_name(&self, pc: u64) -> Option<(SharedString, u64)>;
}

impl GlobalDebugSymfile for Elf {
    fn load(
        _maps: &Maps,
        memory: &Arc<dyn Memory>,
        addr: u64,
        size: u64,
        _dex_cache: Option<&DexCache>,
    ) -> Option<Arc<Self>> {
        let elf = Elf::new(Elf::memory_from_process(memory.clone(), addr, size));
        elf.valid().then(|| Arc::new(elf))
    }

    fn is_valid_pc(&self, pc: u64) -> bool {
        self.is_valid_pc(pc)
    }

    fn get_function_name(&self, pc: u64) -> Option<(SharedString, u64)> {
        self.get_function_name(pc)
    }
}

struct State<T> {
    initialized: bool,
    entry_addr: u64,
    entries: Vec<Arc<T>>,
}

/// Reader for one process-global debug descriptor: finds the descriptor
/// variable through the dynamic symbols of the runtime libraries, then
/// walks its linked list of symfile entries on demand. Entries are
/// append-only once discovered; a node that fails to parse disables the
/// walk permanently.
pub struct GlobalDebug<T> {
    memory: Arc<dyn Memory>,
    arch: Arch,
    variable_name: &'static str,
    search_libs: Vec<String>,
    dex_cache: Option<Arc<DexCache>>,
    state: Mutex<State<T>>,
}

/// Reader for `__jit_debug_descriptor` (in-memory ELF symfiles).
pub type JitDebug = GlobalDebug<Elf>;

impl JitDebug {
    pub fn new(arch: Arch, memory: Arc<dyn Memory>) -> JitDebug {
        GlobalDebug::with_variable(arch, memory, "__jit_debug_descriptor")
    }
}

/// Reader for `__dex_debug_descriptor` (DEX files known to the runtime).
pub struct DexFiles {
    global: GlobalDebug<DexFile>,
}

impl DexFiles {
    /// The weak `cache` deduplicates DEX realizations process-wide.
    pub fn new(arch: Arch, memory: Arc<dyn Memory>, cache: Arc<DexCache>) -> DexFiles {
        let mut global = GlobalDebug::with_variable(arch, memory, "__dex_debug_descriptor");
        global.dex_cache = Some(cache);
        DexFiles { global }
    }

    pub fn set_search_libs(&mut self, libs: Vec<String>) {
        self.global.set_search_libs(libs);
    }

    /// Resolve the method containing `dex_pc` across every known DEX.
    pub fn get_function_name(&self, maps: &Maps, dex_pc: u64) -> Option<(SharedString, u64)> {
        let dex = self.global.find(maps, dex_pc)?;
        dex.get_function_name(dex_pc)
    }
}

impl<T: GlobalDebugSymfile> GlobalDebug<T> {
    fn with_variable(arch: Arch, memory: Arc<dyn Memory>, variable_name: &'static str) -> Self {
        GlobalDebug {
            memory,
            arch,
            variable_name,
            search_libs: vec!["libart.so".into(), "libartd.so".into()],
            dex_cache: None,
            state: Mutex::new(State {
                initialized: false,
                entry_addr: 0,
                entries: Vec::new(),
            }),
        }
    }

    /// Restrict descriptor discovery to the given libraries (matched by
    /// file basename). An empty list searches every map.
    pub fn set_search_libs(&mut self, libs: Vec<String>) {
        self.search_libs = libs;
    }

    fn matches_search_libs(&self, name: &str) -> bool {
        if self.search_libs.is_empty() {
            return true;
        }
        let basename = name.rsplit('/').next().unwrap_or(name);
        self.search_libs.iter().any(|lib| lib == basename)
    }

    fn read_pointer(&self, addr: u64) -> Option<u64> {
        let size = self.arch.pointer_size();
        let mut buf = [0u8; 8];
        if !self.memory.read_fully(addr, &mut buf[..size]) {
            return None;
        }
        let value = u64::from_le_bytes(buf);
        Some(if size == 4 { value & u32::MAX as u64 } else { value })
    }

    fn read_u32(&self, addr: u64) -> Option<u32> {
        let mut buf = [0u8; 4];
        self.memory
            .read_fully(addr, &mut buf)
            .then(|| u32::from_le_bytes(buf))
    }

    /// Field offsets of a JITCodeEntry for this architecture. The 64-bit
    /// symfile size is packed on x86 and 8-byte aligned elsewhere.
    fn entry_layout(&self) -> (u64, u64) {
        let ptr = self.arch.pointer_size() as u64;
        let symfile_addr = 2 * ptr;
        let symfile_size = match self.arch {
            Arch::X86 => 12,
            _ if ptr == 4 => 16,
            _ => 24,
        };
        (symfile_addr, symfile_size)
    }

    /// Validate the descriptor and return the head of the entry list.
    fn read_descriptor(&self, addr: u64) -> Option<u64> {
        let version = self.read_u32(addr)?;
        if version != JIT_DESCRIPTOR_VERSION {
            log::debug!("{}: unknown descriptor version {version}", self.variable_name);
            return None;
        }
        // Skip the action flag and the relevant-entry pointer.
        let first_entry_addr = addr + 8 + self.arch.pointer_size() as u64;
        let first_entry = self.read_pointer(first_entry_addr)?;
        (first_entry != 0).then_some(first_entry)
    }

    /// Read one list node, returning (next, symfile_addr, symfile_size).
    fn read_entry(&self, addr: u64) -> Option<(u64, u64, u64)> {
        let (addr_offset, size_offset) = self.entry_layout();
        let next = self.read_pointer(addr)?;
        let symfile_addr = self.read_pointer(addr + addr_offset)?;
        let mut buf = [0u8; 8];
        if !self.memory.read_fully(addr + size_offset, &mut buf) {
            return None;
        }
        Some((next, symfile_addr, u64::from_le_bytes(buf)))
    }

    /// Locate the descriptor variable by scanning the dynamic symbols of
    /// the candidate libraries' ELFs.
    fn init(&self, maps: &Maps, state: &mut State<T>) {
        state.initialized = true;
        for index in 0..maps.len() {
            let info = maps.get(index).unwrap().clone();
            // The descriptor lives in a writable data segment.
            if info.flags() & (PROT_READ | PROT_WRITE) != (PROT_READ | PROT_WRITE) {
                continue;
            }
            if info.name().is_empty() || !self.matches_search_libs(info.name()) {
                continue;
            }
            let elf = maps.get_elf(index, Some(&self.memory), self.arch);
            let Some(offset) = elf.get_global_variable_offset(self.variable_name) else {
                continue;
            };
            if offset == 0 {
                continue;
            }
            // The symbol's file offset must fall inside this map to turn
            // it into an absolute address.
            let offset_end = info.offset() + info.end() - info.start();
            if offset < info.offset() || offset >= offset_end {
                continue;
            }
            let addr = info.start() + offset - info.offset();
            if let Some(first_entry) = self.read_descriptor(addr) {
                state.entry_addr = first_entry;
                return;
            }
        }
    }

    /// Return the symfile covering `pc`, advancing the entry list as far
    /// as needed. Previously discovered entries are consulted first.
    pub fn find(&self, maps: &Maps, pc: u64) -> Option<Arc<T>> {
        // One lock spans discovery and traversal; this object is touched
        // rarely enough that finer locking buys nothing.
        let mut state = self.state.lock().unwrap();
        if !state.initialized {
            self.init(maps, &mut state);
        }

        for entry in &state.entries {
            if entry.is_valid_pc(pc) {
                return Some(entry.clone());
            }
        }

        while state.entry_addr != 0 {
            let Some((next, start, size)) = self.read_entry(state.entry_addr) else {
                state.entry_addr = 0;
                return None;
            };
            state.entry_addr = next;

            match T::load(maps, &self.memory, start, size, self.dex_cache.as_deref()) {
                Some(symfile) => {
                    state.entries.push(symfile.clone());
                    if symfile.is_valid_pc(pc) {
                        return Some(symfile);
                    }
                }
                None => {
                    // The list is not in a format we understand; do not
                    // attempt to process any further entries.
                    log::debug!(
                        "{}: entry at {start:#x} failed to parse, disabling",
                        self.variable_name
                    );
                    state.entry_addr = 0;
                    return None;
                }
            }
        }
        None
    }
}
