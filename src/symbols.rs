use std::sync::{Arc, Mutex};

use object::elf;
use object::read::elf::{FileHeader, Sym};
use object::Endianness;

use crate::memory::Memory;

const MAX_SYMBOL_NAME: usize = 4096;

#[derive(Clone, Copy)]
struct FuncInfo {
    start: u64,
    end: u64,
    name_offset: u64,
}

/// One symbol table (`.symtab` or `.dynsym`) with its string table. The
/// function symbols are read once, sorted by address and cached; name
/// strings are read on demand.
pub(crate) struct Symbols {
    offset: u64,
    count: u64,
    entry_size: u64,
    str_offset: u64,
    str_end: u64,
    funcs: Mutex<Option<Arc<Vec<FuncInfo>>>>,
}

impl Symbols {
    pub fn new(offset: u64, size: u64, entry_size: u64, str_offset: u64, str_size: u64) -> Symbols {
        Symbols {
            offset,
            count: if entry_size != 0 { size / entry_size } else { 0 },
            entry_size,
            str_offset,
            str_end: str_offset.saturating_add(str_size),
            funcs: Mutex::new(None),
        }
    }

    fn read_sym<Elf: FileHeader<Endian = Endianness>>(
        &self,
        memory: &dyn Memory,
        index: u64,
    ) -> Option<Elf::Sym> {
        crate::elf_interface::read_pod::<Elf::Sym>(memory, self.offset + index * self.entry_size)
    }

    fn func_infos<Elf: FileHeader<Endian = Endianness>>(
        &self,
        memory: &dyn Memory,
        endian: Endianness,
    ) -> Arc<Vec<FuncInfo>> {
        let mut guard = self.funcs.lock().unwrap();
        if let Some(funcs) = guard.as_ref() {
            return funcs.clone();
        }
        let mut funcs = Vec::new();
        for i in 0..self.count {
            let Some(sym) = self.read_sym::<Elf>(memory, i) else {
                break;
            };
            let size: u64 = sym.st_size(endian).into();
            if sym.st_type() != elf::STT_FUNC || size == 0 {
                continue;
            }
            let start: u64 = sym.st_value(endian).into();
            funcs.push(FuncInfo {
                start,
                end: start.saturating_add(size),
                name_offset: sym.st_name(endian) as u64,
            });
        }
        funcs.sort_unstable_by_key(|f| f.start);
        let funcs = Arc::new(funcs);
        *guard = Some(funcs.clone());
        funcs
    }

    /// Find the function symbol whose `[start, end)` contains `addr` and
    /// return its name and the offset of `addr` within it.
    pub fn get_func_name<Elf: FileHeader<Endian = Endianness>>(
        &self,
        memory: &dyn Memory,
        endian: Endianness,
        addr: u64,
    ) -> Option<(String, u64)> {
        let funcs = self.func_infos::<Elf>(memory, endian);
        let pos = funcs.partition_point(|f| f.start <= addr);
        if pos == 0 {
            return None;
        }
        let func = funcs[pos - 1];
        if addr >= func.end {
            return None;
        }
        let name_addr = self.str_offset.checked_add(func.name_offset)?;
        if name_addr >= self.str_end {
            return None;
        }
        let max = (self.str_end - name_addr).min(MAX_SYMBOL_NAME as u64) as usize;
        let name = memory.read_string(name_addr, max)?;
        (!name.is_empty()).then_some((name, addr - func.start))
    }

    /// Linear scan for a global object symbol with the exact `name`.
    /// Returns its address (st_value).
    pub fn get_global<Elf: FileHeader<Endian = Endianness>>(
        &self,
        memory: &dyn Memory,
        endian: Endianness,
        name: &str,
    ) -> Option<u64> {
        for i in 0..self.count {
            let sym = self.read_sym::<Elf>(memory, i)?;
            if sym.st_type() != elf::STT_OBJECT {
                continue;
            }
            let name_addr = self.str_offset.checked_add(sym.st_name(endian) as u64)?;
            if name_addr >= self.str_end {
                continue;
            }
            let max = (self.str_end - name_addr).min(MAX_SYMBOL_NAME as u64) as usize;
            if let Some(sym_name) = memory.read_string(name_addr, max) {
                if sym_name == name {
                    return Some(sym.st_value(endian).into());
                }
            }
        }
        None
    }
}
