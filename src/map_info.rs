use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::arch::Arch;
use crate::elf::Elf;
use crate::memory::{Memory, MemoryBuffer, MemoryFileAtOffset, MemoryRange, MemoryRanges};
use crate::shared_string::SharedString;

pub const PROT_READ: u16 = 0x1;
pub const PROT_WRITE: u16 = 0x2;
pub const PROT_EXEC: u16 = 0x4;
/// The map is a device mapping; reading through it can hang the caller.
pub const MAPS_FLAGS_DEVICE_MAP: u16 = 0x8000;

const LOAD_BIAS_UNSET: i64 = i64::MAX;

struct ElfState {
    elf: Option<Arc<Elf>>,
    /// Distance from the start of the ELF file to this mapping's file
    /// offset. Non-zero only when no ELF starts at `offset` itself.
    elf_offset: u64,
    /// File offset at which the ELF that covers this mapping starts.
    elf_start_offset: u64,
    /// The attached ELF reads from process memory, not from a file.
    memory_backed_elf: bool,
}

/// A single address-range descriptor of a process mapping, with the
/// lazily materialized ELF association. The prev/next links are arena
/// indices into the owning [`Maps`](crate::maps::Maps); they skip blank
/// entries (anonymous gaps with no offset and no protection).
pub struct MapInfo {
    start: u64,
    end: u64,
    offset: u64,
    flags: u16,
    name: SharedString,
    pub(crate) prev_map: Option<usize>,
    pub(crate) prev_real_map: Option<usize>,
    pub(crate) next_real_map: Option<usize>,
    state: Mutex<ElfState>,
    load_bias: AtomicI64,
    build_id: OnceLock<SharedString>,
}

/// Process-wide cache sharing ELF objects between maps of the same file,
/// keyed by (path, ELF start offset). Opt-in: pass one to
/// [`Maps::set_elf_cache`](crate::maps::Maps::set_elf_cache).
#[derive(Default)]
pub struct ElfCache {
    entries: Mutex<HashMap<(String, u64), Arc<Elf>>>,
}

impl ElfCache {
    pub fn new() -> Arc<ElfCache> {
        Arc::new(ElfCache::default())
    }
}

impl MapInfo {
    pub fn new(start: u64, end: u64, offset: u64, flags: u16, name: impl Into<SharedString>) -> MapInfo {
        MapInfo {
            start,
            end,
            offset,
            flags,
            name: name.into(),
            prev_map: None,
            prev_real_map: None,
            next_real_map: None,
            state: Mutex::new(ElfState {
                elf: None,
                elf_offset: 0,
                elf_start_offset: 0,
                memory_backed_elf: false,
            }),
            load_bias: AtomicI64::new(LOAD_BIAS_UNSET),
            build_id: OnceLock::new(),
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn name(&self) -> &SharedString {
        &self.name
    }

    pub fn elf_offset(&self) -> u64 {
        self.state.lock().unwrap().elf_offset
    }

    pub fn elf_start_offset(&self) -> u64 {
        self.state.lock().unwrap().elf_start_offset
    }

    pub fn memory_backed_elf(&self) -> bool {
        self.state.lock().unwrap().memory_backed_elf
    }

    /// The attached ELF, if one has been materialized already.
    pub fn elf(&self) -> Option<Arc<Elf>> {
        self.state.lock().unwrap().elf.clone()
    }

    /// A blank map carries no protection, no offset and no name; the
    /// real-map links skip those.
    pub fn is_blank(&self) -> bool {
        self.offset == 0 && self.flags == 0 && self.name.is_empty()
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    fn file_memory(&self, offset: u64, size: Option<u64>) -> Option<Box<dyn Memory>> {
        let memory = MemoryFileAtOffset::new(Path::new(self.name.as_str()), offset, size)?;
        Some(Box::new(memory))
    }

    /// See if the previous map is a read-only mapping of the start of the
    /// same ELF file that this map continues.
    fn file_memory_from_previous_read_only(
        &self,
        prev_real: &MapInfo,
        state: &mut ElfState,
    ) -> Option<Box<dyn Memory>> {
        if prev_real.flags != PROT_READ {
            return None;
        }
        let map_size = self.end - prev_real.end;
        let memory = self.file_memory(prev_real.offset, Some(map_size))?;
        let max_size = Elf::get_info(&*memory)?;
        if max_size < map_size {
            return None;
        }
        let memory = self.file_memory(prev_real.offset, Some(max_size))?;
        state.elf_offset = self.offset - prev_real.offset;
        state.elf_start_offset = prev_real.offset;
        Some(memory)
    }

    fn get_file_memory(
        &self,
        prev_real: Option<&MapInfo>,
        state: &mut ElfState,
    ) -> Option<Box<dyn Memory>> {
        if self.offset == 0 {
            return self.file_memory(0, None);
        }

        // A non-zero offset means either an ELF embedded in some other
        // file at this offset, an executable segment of an ELF whose
        // start lives in the preceding read-only map, or a whole-file ELF
        // mapped with the offset to remember.
        let map_size = self.end - self.start;
        let memory = self.file_memory(self.offset, Some(map_size))?;
        if let Some(max_size) = Elf::get_info(&*memory) {
            state.elf_start_offset = self.offset;
            if max_size > map_size {
                // The linker only maps the loadable part; remap to cover
                // the symbol data past it.
                if let Some(memory) = self.file_memory(self.offset, Some(max_size)) {
                    return Some(memory);
                }
                if let Some(memory) = self.file_memory(self.offset, Some(map_size)) {
                    return Some(memory);
                }
                state.elf_start_offset = 0;
                return None;
            }
            return Some(memory);
        }

        // No ELF at the offset; try the whole file.
        if let Some(memory) = self.file_memory(0, None) {
            if Elf::is_valid_elf(&*memory) {
                state.elf_offset = self.offset;
                // Remember where the ELF starts unless this is the r-x
                // half of a preceding r-- map.
                let splits_previous = prev_real.is_some_and(|prev| {
                    prev.offset == 0 && prev.flags == PROT_READ && prev.name == self.name
                });
                if !splits_previous {
                    state.elf_start_offset = self.offset;
                }
                return Some(memory);
            }
        }

        if let Some(prev_real) = prev_real {
            if let Some(memory) = self.file_memory_from_previous_read_only(prev_real, state) {
                return Some(memory);
            }
        }

        self.file_memory(self.offset, Some(map_size))
    }

    /// Build the Memory an ELF for this map is read through, preferring
    /// the backing file, then process memory, then ranges stitched with a
    /// neighbor map of the same file.
    fn create_memory(
        &self,
        process_memory: Option<&Arc<dyn Memory>>,
        prev_real: Option<&MapInfo>,
        next_real: Option<&MapInfo>,
        state: &mut ElfState,
    ) -> Option<Box<dyn Memory>> {
        if self.end <= self.start {
            return None;
        }
        state.elf_offset = 0;

        // Never read through device maps.
        if self.flags & MAPS_FLAGS_DEVICE_MAP != 0 {
            return None;
        }

        if !self.name.is_empty() {
            if let Some(memory) = self.get_file_memory(prev_real, state) {
                return Some(memory);
            }
        }

        let process_memory = process_memory?;
        state.memory_backed_elf = true;

        let memory = MemoryRange::new(process_memory.clone(), self.start, self.end - self.start, 0);
        if Elf::is_valid_elf(&memory) {
            // When the linker used a read-only rosegment, the mapped ELF
            // continues in the following map of the same file.
            let next = match next_real {
                Some(next)
                    if self.offset == 0
                        && !self.name.is_empty()
                        && next.name == self.name
                        && next.offset > self.offset =>
                {
                    next
                }
                _ => return Some(Box::new(memory)),
            };
            let mut ranges = MemoryRanges::new();
            ranges.insert(MemoryRange::new(
                process_memory.clone(),
                self.start,
                self.end - self.start,
                0,
            ));
            ranges.insert(MemoryRange::new(
                process_memory.clone(),
                next.start,
                next.end - next.start,
                next.offset - self.offset,
            ));
            return Some(Box::new(ranges));
        }

        // The ELF may start in the preceding read-only map of the same
        // file.
        let prev = match prev_real {
            Some(prev)
                if self.offset != 0
                    && !self.name.is_empty()
                    && prev.name == self.name
                    && prev.offset < self.offset =>
            {
                prev
            }
            _ => {
                state.memory_backed_elf = false;
                return None;
            }
        };
        state.elf_offset = self.offset - prev.offset;
        state.elf_start_offset = prev.offset;
        let mut ranges = MemoryRanges::new();
        ranges.insert(MemoryRange::new(
            process_memory.clone(),
            prev.start,
            prev.end - prev.start,
            0,
        ));
        ranges.insert(MemoryRange::new(
            process_memory.clone(),
            self.start,
            self.end - self.start,
            state.elf_offset,
        ));
        Some(Box::new(ranges))
    }

    /// The single serialized materialization point for this map's ELF.
    /// Always returns an `Elf`; a map that cannot produce one gets an
    /// invalid `Elf` attached so it is never probed again.
    pub fn get_elf(
        &self,
        process_memory: Option<&Arc<dyn Memory>>,
        expected_arch: Arch,
        prev_real: Option<&MapInfo>,
        next_real: Option<&MapInfo>,
        cache: Option<&ElfCache>,
    ) -> Arc<Elf> {
        let elf = {
            let mut state = self.state.lock().unwrap();
            if let Some(elf) = &state.elf {
                return elf.clone();
            }

            let cache_entries = cache.filter(|_| !self.name.is_empty()).map(|c| &c.entries);
            if let Some(entries) = cache_entries {
                if let Some(elf) = self.cache_get(&entries.lock().unwrap(), &mut state) {
                    state.elf = Some(elf.clone());
                    return elf;
                }
            }

            let memory = self.create_memory(process_memory, prev_real, next_real, &mut state);

            // The memory construction computed the final elf offsets;
            // another thread may have cached the same file meanwhile.
            if let Some(entries) = cache_entries {
                if let Some(elf) = self.cache_get(&entries.lock().unwrap(), &mut state) {
                    state.elf = Some(elf.clone());
                    return elf;
                }
            }

            let memory: Arc<dyn Memory> = match memory {
                Some(memory) => Arc::from(memory),
                None => Arc::new(MemoryBuffer::new(Vec::new())),
            };
            let elf = Arc::new(Elf::new(memory));
            if elf.valid() && expected_arch != elf.arch() {
                // Arch mismatch; keep the object to prevent reattempts.
                elf.invalidate();
            }
            state.elf = Some(elf.clone());

            if let Some(entries) = cache_entries {
                entries.lock().unwrap().insert(
                    (self.name.to_string(), state.elf_start_offset),
                    elf.clone(),
                );
            }

            if !elf.valid() {
                state.elf_start_offset = self.offset;
                return elf;
            }
            elf
        };

        // A read-only map followed by a read-execute map of the same ELF
        // share one object.
        if let Some(prev_real) = prev_real {
            let elf_start_offset = self.elf_start_offset();
            if elf_start_offset != self.offset
                && prev_real.offset == elf_start_offset
                && prev_real.name == self.name
            {
                let adopted = {
                    let mut prev_state = prev_real.state.lock().unwrap();
                    match &prev_state.elf {
                        None => {
                            prev_state.elf = Some(elf.clone());
                            prev_state.memory_backed_elf = self.memory_backed_elf();
                            None
                        }
                        Some(prev_elf) => Some(prev_elf.clone()),
                    }
                };
                if let Some(prev_elf) = adopted {
                    // Discard this ELF and use the predecessor's instead.
                    self.state.lock().unwrap().elf = Some(prev_elf.clone());
                    return prev_elf;
                }
            }
        }
        elf
    }

    fn cache_get(
        &self,
        entries: &HashMap<(String, u64), Arc<Elf>>,
        state: &mut ElfState,
    ) -> Option<Arc<Elf>> {
        let name = self.name.to_string();
        if let Some(elf) = entries.get(&(name.clone(), state.elf_start_offset)) {
            if state.elf_start_offset == 0 && self.offset != 0 {
                // Whole-file ELF shared by several maps.
                state.elf_offset = self.offset;
            }
            return Some(elf.clone());
        }
        if state.elf_start_offset == 0 && self.offset != 0 {
            if let Some(elf) = entries.get(&(name, self.offset)) {
                state.elf_start_offset = self.offset;
                return Some(elf.clone());
            }
        }
        None
    }

    /// The load bias of this map's ELF, cached in an atomic. Reads only
    /// the program headers when the full ELF has not been needed yet.
    pub fn get_load_bias(
        &self,
        process_memory: Option<&Arc<dyn Memory>>,
        prev_real: Option<&MapInfo>,
        next_real: Option<&MapInfo>,
    ) -> i64 {
        let cached = self.load_bias.load(Ordering::Acquire);
        if cached != LOAD_BIAS_UNSET {
            return cached;
        }

        let mut state = self.state.lock().unwrap();
        if let Some(elf) = &state.elf {
            let bias = if elf.valid() { elf.load_bias() } else { 0 };
            self.load_bias.store(bias, Ordering::Release);
            return bias;
        }
        let bias = match self.create_memory(process_memory, prev_real, next_real, &mut state) {
            Some(memory) => {
                let memory: Arc<dyn Memory> = Arc::from(memory);
                Elf::get_load_bias_from_memory(&memory)
            }
            None => 0,
        };
        self.load_bias.store(bias, Ordering::Release);
        bias
    }

    /// The raw build-id of this map's ELF. The winning computation is
    /// published once; every caller sees the same string.
    pub fn get_build_id(&self) -> SharedString {
        self.build_id
            .get_or_init(|| {
                let elf = self.state.lock().unwrap().elf.clone();
                let raw = match elf {
                    Some(elf) => elf.get_build_id(),
                    None => {
                        // Only a file-backed view carries the section
                        // data needed for the note.
                        let mut state = ElfState {
                            elf: None,
                            elf_offset: 0,
                            elf_start_offset: 0,
                            memory_backed_elf: false,
                        };
                        self.get_file_memory(None, &mut state)
                            .map(|memory| {
                                let memory: Arc<dyn Memory> = Arc::from(memory);
                                Elf::new(memory).get_build_id()
                            })
                            .unwrap_or(None)
                    }
                };
                match raw {
                    // Build-ids are raw bytes; store them losslessly.
                    Some(bytes) => {
                        SharedString::new(bytes.iter().map(|b| *b as char).collect::<String>())
                    }
                    None => SharedString::default(),
                }
            })
            .clone()
    }

    /// The build-id as lowercase hex, empty when there is none.
    pub fn get_printable_build_id(&self) -> String {
        self.get_build_id()
            .as_str()
            .chars()
            .map(|c| format!("{:02x}", c as u32 as u8))
            .collect()
    }

    /// Resolve a function name through the attached ELF, if any.
    pub fn get_function_name(&self, addr: u64) -> Option<(SharedString, u64)> {
        let elf = self.state.lock().unwrap().elf.clone()?;
        elf.get_function_name(addr)
    }
}

impl std::fmt::Display for MapInfo {
    /// One `/proc/<pid>/maps` line, matching what the parser accepts.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:x}-{:x} {}{}{}p {:08x} 00:00 0",
            self.start,
            self.end,
            if self.flags & PROT_READ != 0 { 'r' } else { '-' },
            if self.flags & PROT_WRITE != 0 { 'w' } else { '-' },
            if self.flags & PROT_EXEC != 0 { 'x' } else { '-' },
            self.offset,
        )?;
        if !self.name.is_empty() {
            write!(f, " {}", self.name)?;
        }
        Ok(())
    }
}
