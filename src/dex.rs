use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use crate::jit_debug::GlobalDebugSymfile;
use crate::map_info::MapInfo;
use crate::maps::Maps;
use crate::memory::{Memory, MemoryBuffer, MemoryFileAtOffset};
use crate::shared_string::SharedString;

const DEX_MAGIC: &[u8; 4] = b"dex\n";
const DEX_HEADER_SIZE: u64 = 0x70;
/// Offset of a code item's instruction array within the item.
const CODE_ITEM_INSNS_OFFSET: u64 = 0x10;
/// Refuse to copy absurdly large alleged DEX files out of a process.
const MAX_DEX_SIZE: u64 = 256 * 1024 * 1024;

/// Process-wide weak cache of realized DEX files, keyed by
/// (path, file offset, size) so the same file mapped into many maps is
/// only realized once. Weak references keep each DEX's lifetime tied to
/// the maps that use it.
#[derive(Default)]
pub struct DexCache {
    entries: Mutex<HashMap<(String, u64, u64), Weak<DexFile>>>,
}

impl DexCache {
    pub fn new() -> Arc<DexCache> {
        Arc::new(DexCache::default())
    }
}

struct DexHeader {
    file_size: u32,
    string_ids_off: u32,
    string_ids_size: u32,
    type_ids_off: u32,
    type_ids_size: u32,
    method_ids_off: u32,
    method_ids_size: u32,
    class_defs_off: u32,
    class_defs_size: u32,
}

struct MethodCache {
    /// Keyed by the end offset of each method's code so an upper-bound
    /// lookup finds the covering method.
    methods: BTreeMap<u64, (u64, SharedString)>,
    scanned: bool,
}

/// One DEX image realized from a target process, with method-name
/// resolution by code offset.
pub struct DexFile {
    memory: Box<dyn Memory>,
    base_addr: u64,
    file_size: u64,
    header: DexHeader,
    cache: Mutex<MethodCache>,
}

impl DexFile {
    /// Realize the DEX spanning `[base_addr, base_addr + file_size)` of
    /// the target process: directly from the backing file when `map_info`
    /// covers the range, by a heap copy of process memory otherwise.
    pub fn create(
        base_addr: u64,
        file_size: u64,
        memory: &Arc<dyn Memory>,
        map_info: Option<&MapInfo>,
        cache: Option<&DexCache>,
    ) -> Option<Arc<DexFile>> {
        if file_size == 0 || file_size > MAX_DEX_SIZE {
            return None;
        }

        let cache_key = map_info.and_then(|info| {
            if info.name().is_empty() {
                return None;
            }
            let offset_in_file = base_addr.checked_sub(info.start())? + info.offset();
            Some((info.name().to_string(), offset_in_file, file_size))
        });
        if let (Some(cache), Some(key)) = (cache, &cache_key) {
            if let Some(dex) = cache.entries.lock().unwrap().get(key).and_then(Weak::upgrade) {
                return Some(dex);
            }
        }

        // Prefer mapping the file; fall back to copying process memory.
        let mut dex_memory: Option<Box<dyn Memory>> = None;
        if let Some(info) = map_info {
            if !info.name().is_empty()
                && info.contains(base_addr)
                && file_size <= info.end() - base_addr
            {
                let offset_in_file = (base_addr - info.start()) + info.offset();
                dex_memory = MemoryFileAtOffset::new(
                    Path::new(info.name().as_str()),
                    offset_in_file,
                    Some(file_size),
                )
                .map(|m| Box::new(m) as Box<dyn Memory>);
            }
        }
        let dex_memory = match dex_memory {
            Some(memory) => memory,
            None => {
                let mut copy = vec![0u8; file_size as usize];
                if !memory.read_fully(base_addr, &mut copy) {
                    return None;
                }
                Box::new(MemoryBuffer::new(copy))
            }
        };

        let header = Self::parse_header(&*dex_memory, file_size)?;
        let dex = Arc::new(DexFile {
            memory: dex_memory,
            base_addr,
            file_size,
            header,
            cache: Mutex::new(MethodCache {
                methods: BTreeMap::new(),
                scanned: false,
            }),
        });
        if let (Some(cache), Some(key)) = (cache, cache_key) {
            cache
                .entries
                .lock()
                .unwrap()
                .insert(key, Arc::downgrade(&dex));
        }
        Some(dex)
    }

    fn parse_header(memory: &dyn Memory, file_size: u64) -> Option<DexHeader> {
        let mut magic = [0u8; 8];
        if !memory.read_fully(0, &mut magic) || &magic[..4] != DEX_MAGIC {
            return None;
        }
        if file_size < DEX_HEADER_SIZE {
            return None;
        }
        let read_u32 = |offset: u64| -> Option<u32> {
            let mut buf = [0u8; 4];
            memory.read_fully(offset, &mut buf).then(|| u32::from_le_bytes(buf))
        };
        let header = DexHeader {
            file_size: read_u32(0x20)?,
            string_ids_size: read_u32(0x38)?,
            string_ids_off: read_u32(0x3c)?,
            type_ids_size: read_u32(0x40)?,
            type_ids_off: read_u32(0x44)?,
            method_ids_size: read_u32(0x58)?,
            method_ids_off: read_u32(0x5c)?,
            class_defs_size: read_u32(0x60)?,
            class_defs_off: read_u32(0x64)?,
        };
        if header.file_size as u64 > file_size {
            return None;
        }
        Some(header)
    }

    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    pub fn size(&self) -> u64 {
        self.file_size
    }

    fn read_u16_at(&self, offset: u64) -> Option<u16> {
        let mut buf = [0u8; 2];
        self.memory
            .read_fully(offset, &mut buf)
            .then(|| u16::from_le_bytes(buf))
    }

    fn read_u32_at(&self, offset: u64) -> Option<u32> {
        let mut buf = [0u8; 4];
        self.memory
            .read_fully(offset, &mut buf)
            .then(|| u32::from_le_bytes(buf))
    }

    fn read_uleb128(&self, offset: &mut u64) -> Option<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let mut buf = [0u8; 1];
            if !self.memory.read_fully(*offset, &mut buf) || shift >= 64 {
                return None;
            }
            *offset += 1;
            value |= ((buf[0] & 0x7f) as u64) << shift;
            if buf[0] & 0x80 == 0 {
                return Some(value);
            }
            shift += 7;
        }
    }

    /// Read the MUTF-8 string with the given string id.
    fn string_at_idx(&self, idx: u32) -> Option<String> {
        if idx >= self.header.string_ids_size {
            return None;
        }
        let id_offset = self.header.string_ids_off as u64 + idx as u64 * 4;
        let mut data_offset = self.read_u32_at(id_offset)? as u64;
        // The string data starts with its utf16 length.
        self.read_uleb128(&mut data_offset)?;
        self.memory.read_string(data_offset, 4096)
    }

    /// The dotted method name `class.method` for a method id.
    fn method_name(&self, method_idx: u64) -> Option<String> {
        if method_idx >= self.header.method_ids_size as u64 {
            return None;
        }
        let id_offset = self.header.method_ids_off as u64 + method_idx * 8;
        let class_idx = self.read_u16_at(id_offset)?;
        let name_idx = self.read_u32_at(id_offset + 4)?;
        let name = self.string_at_idx(name_idx)?;
        if class_idx as u32 >= self.header.type_ids_size {
            return Some(name);
        }
        let descriptor_idx =
            self.read_u32_at(self.header.type_ids_off as u64 + class_idx as u64 * 4)?;
        let descriptor = self.string_at_idx(descriptor_idx)?;
        // "Lcom/example/Cls;" becomes "com.example.Cls".
        let class_name = descriptor
            .strip_prefix('L')
            .and_then(|s| s.strip_suffix(';'))
            .map(|s| s.replace('/', "."))
            .unwrap_or(descriptor);
        Some(format!("{class_name}.{name}"))
    }

    /// Walk every class definition, recording each method's code extent
    /// into the cache.
    fn scan_methods(&self, cache: &mut MethodCache) {
        cache.scanned = true;
        for class_index in 0..self.header.class_defs_size as u64 {
            // class_def_item is 32 bytes; class_data_off is its 7th word.
            let def_offset = self.header.class_defs_off as u64 + class_index * 32;
            let Some(class_data_off) = self.read_u32_at(def_offset + 24) else {
                return;
            };
            if class_data_off == 0 {
                continue;
            }
            let mut offset = class_data_off as u64;
            let Some(static_fields) = self.read_uleb128(&mut offset) else {
                return;
            };
            let Some(instance_fields) = self.read_uleb128(&mut offset) else {
                return;
            };
            let Some(direct_methods) = self.read_uleb128(&mut offset) else {
                return;
            };
            let Some(virtual_methods) = self.read_uleb128(&mut offset) else {
                return;
            };
            for _ in 0..static_fields + instance_fields {
                if self.read_uleb128(&mut offset).is_none()
                    || self.read_uleb128(&mut offset).is_none()
                {
                    return;
                }
            }
            let mut method_idx = 0u64;
            for _ in 0..direct_methods + virtual_methods {
                let Some(idx_diff) = self.read_uleb128(&mut offset) else {
                    return;
                };
                let Some(_access) = self.read_uleb128(&mut offset) else {
                    return;
                };
                let Some(code_off) = self.read_uleb128(&mut offset) else {
                    return;
                };
                method_idx += idx_diff;
                if code_off == 0 {
                    continue;
                }
                let Some(insns_size) = self.read_u32_at(code_off + 12) else {
                    continue;
                };
                let start = code_off + CODE_ITEM_INSNS_OFFSET;
                let end = start + insns_size as u64 * 2;
                if let Some(name) = self.method_name(method_idx) {
                    cache.methods.insert(end, (start, SharedString::from(name)));
                }
            }
        }
    }

    /// The method containing the file offset `dex_offset`, from the
    /// per-DEX cache keyed by method end offset.
    fn method_at_offset(&self, dex_offset: u64) -> Option<(SharedString, u64)> {
        let mut cache = self.cache.lock().unwrap();
        if !cache.scanned {
            self.scan_methods(&mut cache);
        }
        let (_, (start, name)) = cache.methods.range(dex_offset + 1..).next()?;
        (*start <= dex_offset).then(|| (name.clone(), dex_offset - start))
    }
}

impl GlobalDebugSymfile for DexFile {
    fn load(
        maps: &Maps,
        memory: &Arc<dyn Memory>,
        addr: u64,
        size: u64,
        dex_cache: Option<&DexCache>,
    ) -> Option<Arc<Self>> {
        let map_info = maps.find(addr).and_then(|i| maps.get(i)).map(|m| &**m);
        DexFile::create(addr, size, memory, map_info, dex_cache)
    }

    fn is_valid_pc(&self, pc: u64) -> bool {
        pc >= self.base_addr && pc < self.base_addr + self.file_size
    }

    fn get_function_name(&self, pc: u64) -> Option<(SharedString, u64)> {
        self.method_at_offset(pc.checked_sub(self.base_addr)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_u32(data: &mut [u8], offset: usize, value: u32) {
        data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Hand-assemble a minimal dex: one class, one method "Main.run"
    /// with a 4-instruction code item.
    fn build_dex() -> Vec<u8> {
        let mut data = vec![0u8; 0x200];
        data[..8].copy_from_slice(b"dex\n035\0");
        put_u32(&mut data, 0x20, 0x200); // file_size
        put_u32(&mut data, 0x24, 0x70); // header_size
        put_u32(&mut data, 0x28, 0x12345678); // endian_tag
        // string_ids: 2 entries at 0x70: "run", "LMain;"
        put_u32(&mut data, 0x38, 2);
        put_u32(&mut data, 0x3c, 0x70);
        put_u32(&mut data, 0x70, 0x100); // -> "run"
        put_u32(&mut data, 0x74, 0x108); // -> "LMain;"
        data[0x100] = 3; // utf16 length
        data[0x101..0x104].copy_from_slice(b"run");
        data[0x104] = 0;
        data[0x108] = 6;
        data[0x109..0x10f].copy_from_slice(b"LMain;");
        data[0x10f] = 0;
        // type_ids: 1 entry at 0x80 -> string 1
        put_u32(&mut data, 0x40, 1);
        put_u32(&mut data, 0x44, 0x80);
        put_u32(&mut data, 0x80, 1);
        // method_ids: 1 entry at 0x90: class 0, proto 0, name string 0
        put_u32(&mut data, 0x58, 1);
        put_u32(&mut data, 0x5c, 0x90);
        data[0x90] = 0; // class_idx
        data[0x92] = 0; // proto_idx
        put_u32(&mut data, 0x94, 0); // name_idx
        // class_defs: 1 entry at 0xa0, class_data_off at +24
        put_u32(&mut data, 0x60, 1);
        put_u32(&mut data, 0x64, 0xa0);
        put_u32(&mut data, 0xa0 + 24, 0x120);
        // class_data at 0x120: 0 statics, 0 instance, 1 direct, 0 virtual
        data[0x120] = 0;
        data[0x121] = 0;
        data[0x122] = 1;
        data[0x123] = 0;
        // direct method: idx_diff 0, access 1, code_off 0x140
        data[0x124] = 0;
        data[0x125] = 1;
        data[0x126] = 0xc0;
        data[0x127] = 0x02; // uleb 0x140
        // code item at 0x140: insns_size (u32 at +12) = 4 (8 bytes)
        put_u32(&mut data, 0x140 + 12, 4);
        data
    }

    #[test]
    fn resolves_method_by_code_offset() {
        let process: Arc<dyn Memory> = Arc::new(MemoryBuffer::new(build_dex()));
        let dex = DexFile::create(0, 0x200, &process, None, None).unwrap();
        // Inside the insns range [0x150, 0x158).
        let (name, offset) = dex.get_function_name(0x154).unwrap();
        assert_eq!(name.as_str(), "Main.run");
        assert_eq!(offset, 4);
        // Outside any method.
        assert!(dex.get_function_name(0x1f0).is_none());
        assert!(dex.get_function_name(0x100).is_none());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = build_dex();
        data[0] = b'x';
        let process: Arc<dyn Memory> = Arc::new(MemoryBuffer::new(data));
        assert!(DexFile::create(0, 0x200, &process, None, None).is_none());
    }

    #[test]
    fn weak_cache_deduplicates() {
        let process: Arc<dyn Memory> = Arc::new(MemoryBuffer::new(build_dex()));
        let cache = DexCache::new();
        let map = MapInfo::new(0, 0x1000, 0, crate::map_info::PROT_READ, "/fake/classes.dex");
        // The file path does not exist, so realization copies process
        // memory, but the cache key is still the (path, offset, size).
        let dex1 = DexFile::create(0, 0x200, &process, Some(&map), Some(&cache)).unwrap();
        let dex2 = DexFile::create(0, 0x200, &process, Some(&map), Some(&cache)).unwrap();
        assert!(Arc::ptr_eq(&dex1, &dex2));
    }
}
