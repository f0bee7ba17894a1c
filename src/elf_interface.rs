use std::sync::{Arc, Mutex};

use object::elf;
use object::read::elf::{Dyn, FileHeader, ProgramHeader, SectionHeader};
use object::Endianness;

use crate::arch::Arch;
use crate::dwarf::DwarfSection;
use crate::error::{ErrorCode, ErrorData};
use crate::exidx::ArmExidx;
use crate::memory::Memory;
use crate::regs::Regs;
use crate::symbols::Symbols;

const PT_ARM_EXIDX: u32 = 0x7000_0001;
const SHT_ARM_EXIDX: u32 = 0x7000_0001;
const NT_GNU_BUILD_ID: u32 = 3;
const MAX_SONAME: usize = 512;

pub(crate) const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
/// e_ident indices for the class and data-encoding bytes.
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;

/// Read one Pod struct out of a [`Memory`] at `offset`. The scratch
/// buffer is u64-backed so the cast is properly aligned.
pub(crate) fn read_pod<T: object::pod::Pod>(memory: &dyn Memory, offset: u64) -> Option<T> {
    let size = std::mem::size_of::<T>();
    let mut buf = vec![0u64; size.div_ceil(8)];
    let bytes = object::pod::bytes_of_slice_mut(&mut buf);
    if !memory.read_fully(offset, &mut bytes[..size]) {
        return None;
    }
    Some(*object::pod::from_bytes::<T>(&bytes[..size]).ok()?.0)
}

#[derive(Clone, Copy, Default)]
struct SectionInfo {
    offset: u64,
    size: u64,
    /// sh_addr - sh_offset; converts file offsets to virtual addresses.
    bias: i64,
}

/// A `[p_vaddr, p_vaddr + p_filesz)` to file-offset mapping.
#[derive(Clone, Copy)]
struct LoadSegment {
    vaddr: u64,
    filesz: u64,
    offset: u64,
}

/// The class-independent view of an ELF image that unwinding needs:
/// load bias, unwind sections, symbol tables, build-id, soname. All data
/// is reached through the ELF `Memory`, which is addressed by file
/// offsets, so images that only exist in a target process work the same
/// as images read from disk.
pub(crate) struct ElfInterface<Elf: FileHeader<Endian = Endianness>> {
    memory: Arc<dyn Memory>,
    endian: Endianness,
    arch: Arch,
    load_bias: i64,
    loads: Vec<LoadSegment>,
    eh_frame: Option<DwarfSection>,
    debug_frame: Option<DwarfSection>,
    gnu_debugdata: Option<SectionInfo>,
    exidx: Option<SectionInfo>,
    symbols: Vec<Symbols>,
    build_id_note: Option<SectionInfo>,
    dynamic: Option<SectionInfo>,
    soname: Mutex<Option<Option<String>>>,
    last_error: Mutex<ErrorData>,
    _header: std::marker::PhantomData<Elf>,
}

pub(crate) type ElfInterface32 = ElfInterface<elf::FileHeader32<Endianness>>;
pub(crate) type ElfInterface64 = ElfInterface<elf::FileHeader64<Endianness>>;

impl<Elf: FileHeader<Endian = Endianness>> ElfInterface<Elf> {
    /// Parse the headers of the image in `memory`. Returns `None` when
    /// the image is not a supported ELF of this class.
    pub fn new(memory: Arc<dyn Memory>) -> Option<Self> {
        let header: Elf = read_pod(&*memory, 0)?;
        let ident = object::pod::bytes_of(&header);
        if ident[..4] != ELF_MAGIC[..] {
            return None;
        }
        let class = if std::mem::size_of::<Elf>() == std::mem::size_of::<elf::FileHeader64<Endianness>>()
        {
            elf::ELFCLASS64
        } else {
            elf::ELFCLASS32
        };
        if ident[EI_CLASS] != class {
            return None;
        }
        let endian = match ident[EI_DATA] {
            elf::ELFDATA2LSB => Endianness::Little,
            elf::ELFDATA2MSB => Endianness::Big,
            _ => return None,
        };
        let arch = Arch::from_elf_machine(header.e_machine(endian), class == elf::ELFCLASS64);
        if arch == Arch::Unknown {
            return None;
        }

        let mut iface = ElfInterface {
            memory,
            endian,
            arch,
            load_bias: 0,
            loads: Vec::new(),
            eh_frame: None,
            debug_frame: None,
            gnu_debugdata: None,
            exidx: None,
            symbols: Vec::new(),
            build_id_note: None,
            dynamic: None,
            soname: Mutex::new(None),
            last_error: Mutex::new(ErrorData::default()),
            _header: std::marker::PhantomData,
        };
        let mut eh_frame_hdr = None;
        let mut eh_frame = None;
        iface.read_program_headers(&header, &mut eh_frame_hdr);
        iface.read_section_headers(&header, &mut eh_frame_hdr, &mut eh_frame);
        iface.build_dwarf_sections(eh_frame_hdr, eh_frame);
        Some(iface)
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn load_bias(&self) -> i64 {
        self.load_bias
    }

    pub fn last_error(&self) -> ErrorData {
        *self.last_error.lock().unwrap()
    }

    fn address_size(&self) -> u8 {
        if self.arch.pointer_size() == 4 {
            4
        } else {
            8
        }
    }

    fn big_endian(&self) -> bool {
        self.endian == Endianness::Big
    }

    fn read_program_headers(&mut self, header: &Elf, eh_frame_hdr: &mut Option<SectionInfo>) {
        let phoff: u64 = header.e_phoff(self.endian).into();
        let phentsize = header.e_phentsize(self.endian) as u64;
        let phnum = header.e_phnum(self.endian) as u64;
        if phoff == 0 || phentsize < std::mem::size_of::<Elf::ProgramHeader>() as u64 {
            return;
        }
        let mut exec_bias_found = false;
        for i in 0..phnum {
            let Some(phdr) = read_pod::<Elf::ProgramHeader>(&*self.memory, phoff + i * phentsize)
            else {
                break;
            };
            let p_type = phdr.p_type(self.endian);
            let vaddr: u64 = phdr.p_vaddr(self.endian).into();
            let offset: u64 = phdr.p_offset(self.endian).into();
            let filesz: u64 = phdr.p_filesz(self.endian).into();
            let memsz: u64 = phdr.p_memsz(self.endian).into();
            match p_type {
                elf::PT_LOAD => {
                    self.loads.push(LoadSegment {
                        vaddr,
                        filesz,
                        offset,
                    });
                    // The load bias comes from the first executable
                    // loadable segment.
                    if !exec_bias_found && phdr.p_flags(self.endian) & elf::PF_X != 0 {
                        self.load_bias = vaddr as i64 - offset as i64;
                        exec_bias_found = true;
                    }
                }
                elf::PT_GNU_EH_FRAME => {
                    *eh_frame_hdr = Some(SectionInfo {
                        offset,
                        size: memsz,
                        bias: vaddr as i64 - offset as i64,
                    });
                }
                elf::PT_DYNAMIC => {
                    self.dynamic = Some(SectionInfo {
                        offset,
                        size: memsz,
                        bias: vaddr as i64 - offset as i64,
                    });
                }
                PT_ARM_EXIDX if self.arch == Arch::Arm => {
                    self.exidx = Some(SectionInfo {
                        offset,
                        size: memsz,
                        bias: vaddr as i64 - offset as i64,
                    });
                }
                _ => {}
            }
        }
    }

    fn read_section_headers(
        &mut self,
        header: &Elf,
        eh_frame_hdr: &mut Option<SectionInfo>,
        eh_frame: &mut Option<SectionInfo>,
    ) {
        let endian = self.endian;
        let memory = self.memory.clone();
        let shoff: u64 = header.e_shoff(endian).into();
        let shentsize = header.e_shentsize(endian) as u64;
        let shnum = header.e_shnum(endian) as u64;
        if shoff == 0 || shentsize < std::mem::size_of::<Elf::SectionHeader>() as u64 {
            return;
        }
        let read_shdr = |index: u64| -> Option<Elf::SectionHeader> {
            read_pod::<Elf::SectionHeader>(&*memory, shoff + index * shentsize)
        };
        // Names come from the section header string table.
        let shstr = header.e_shstrndx(endian) as u64;
        let shstr_info = read_shdr(shstr).map(|shdr| {
            let offset: u64 = shdr.sh_offset(endian).into();
            let size: u64 = shdr.sh_size(endian).into();
            (offset, size)
        });
        let section_name = |name_offset: u64| -> Option<String> {
            let (offset, size) = shstr_info?;
            if name_offset >= size {
                return None;
            }
            let max = (size - name_offset).min(128) as usize;
            memory.read_string(offset + name_offset, max)
        };

        let mut strtabs = Vec::new();
        let mut symtabs = Vec::new();
        for i in 0..shnum {
            let Some(shdr) = read_shdr(i) else { break };
            let sh_type = shdr.sh_type(endian);
            let offset: u64 = shdr.sh_offset(endian).into();
            let size: u64 = shdr.sh_size(endian).into();
            let addr: u64 = shdr.sh_addr(endian).into();
            let info = SectionInfo {
                offset,
                size,
                bias: addr as i64 - offset as i64,
            };
            match sh_type {
                elf::SHT_SYMTAB | elf::SHT_DYNSYM => {
                    symtabs.push(shdr);
                }
                elf::SHT_STRTAB => strtabs.push((i, offset, size)),
                elf::SHT_PROGBITS | elf::SHT_NOTE | SHT_ARM_EXIDX => {
                    let Some(name) = section_name(shdr.sh_name(endian) as u64) else {
                        continue;
                    };
                    match name.as_str() {
                        ".eh_frame_hdr" => *eh_frame_hdr = Some(info),
                        ".eh_frame" => *eh_frame = Some(info),
                        ".debug_frame" => {
                            self.debug_frame = Some(DwarfSection::new_debug_frame(
                                self.memory.clone(),
                                offset,
                                size,
                                info.bias,
                                self.big_endian(),
                                self.address_size(),
                            ));
                        }
                        ".gnu_debugdata" => self.gnu_debugdata = Some(info),
                        ".ARM.exidx" => self.exidx = Some(info),
                        ".note.gnu.build-id" => self.build_id_note = Some(info),
                        _ => {}
                    }
                }
                _ => {}
            }
        }
        for shdr in symtabs {
            let link = shdr.sh_link(endian) as u64;
            let Some(&(_, str_offset, str_size)) =
                strtabs.iter().find(|(index, _, _)| *index == link)
            else {
                continue;
            };
            let offset: u64 = shdr.sh_offset(endian).into();
            let size: u64 = shdr.sh_size(endian).into();
            let entsize: u64 = shdr.sh_entsize(endian).into();
            self.symbols
                .push(Symbols::new(offset, size, entsize, str_offset, str_size));
        }
    }

    fn build_dwarf_sections(
        &mut self,
        eh_frame_hdr: Option<SectionInfo>,
        eh_frame: Option<SectionInfo>,
    ) {
        if let Some(hdr) = eh_frame_hdr {
            let frame = eh_frame.unwrap_or(SectionInfo {
                offset: 0,
                size: 0,
                bias: hdr.bias,
            });
            self.eh_frame = DwarfSection::new_eh_frame_with_hdr(
                self.memory.clone(),
                hdr.offset,
                hdr.size,
                hdr.bias,
                frame.offset,
                frame.size,
                frame.bias,
                self.big_endian(),
                self.address_size(),
            );
        }
        if self.eh_frame.is_none() {
            // No header table (or a malformed/empty one): index the raw
            // section linearly.
            if let Some(frame) = eh_frame {
                self.eh_frame = Some(DwarfSection::new_eh_frame(
                    self.memory.clone(),
                    frame.offset,
                    frame.size,
                    frame.bias,
                    self.big_endian(),
                    self.address_size(),
                ));
            }
        }
    }

    /// Map a virtual address to its file offset through the loadable
    /// segments.
    fn vaddr_to_offset(&self, vaddr: u64) -> Option<u64> {
        for load in &self.loads {
            if vaddr >= load.vaddr && vaddr < load.vaddr + load.filesz {
                return Some(vaddr - load.vaddr + load.offset);
            }
        }
        None
    }

    /// Try the DWARF engines at `pc` (a relative PC in this image's
    /// virtual address space): `.eh_frame` first, then `.debug_frame`.
    pub fn step_dwarf(
        &self,
        pc: u64,
        regs: &mut Regs,
        process_memory: &dyn Memory,
        finished: &mut bool,
        is_signal_frame: &mut bool,
    ) -> bool {
        for section in [&self.eh_frame, &self.debug_frame].into_iter().flatten() {
            if section.step(pc, regs, process_memory, finished, is_signal_frame) {
                return true;
            }
            let error = section.last_error();
            if error.code != crate::dwarf::DwarfErrorCode::None {
                *self.last_error.lock().unwrap() =
                    ErrorData::new(error.code.into(), error.address);
            } else {
                *self.last_error.lock().unwrap() = ErrorData::new(ErrorCode::UnwindInfo, pc);
            }
        }
        false
    }

    /// Try the ARM exception index at `pc`.
    pub fn step_exidx(
        &self,
        pc: u64,
        regs: &mut Regs,
        process_memory: &dyn Memory,
        finished: &mut bool,
    ) -> bool {
        let Some(exidx) = &self.exidx else {
            return false;
        };
        let mut engine = ArmExidx::new(&self.memory, exidx.offset, exidx.size, exidx.bias);
        if engine.step(pc, regs, process_memory, finished) {
            return true;
        }
        *self.last_error.lock().unwrap() = engine.last_error();
        false
    }

    pub fn is_valid_pc(&self, pc: u64) -> bool {
        for section in [&self.eh_frame, &self.debug_frame].into_iter().flatten() {
            if section.covers_pc(pc) {
                return true;
            }
        }
        if let Some(exidx) = &self.exidx {
            let mut engine = ArmExidx::new(&self.memory, exidx.offset, exidx.size, exidx.bias);
            if engine.covers_pc(pc) {
                return true;
            }
        }
        false
    }

    /// Resolve a function symbol containing `addr` (virtual address).
    pub fn function_name(&self, addr: u64) -> Option<(String, u64)> {
        for symbols in &self.symbols {
            if let Some(result) =
                symbols.get_func_name::<Elf>(&self.memory, self.endian, addr)
            {
                return Some(result);
            }
        }
        None
    }

    /// Find a global object symbol and return its file offset.
    pub fn global_variable_offset(&self, name: &str) -> Option<u64> {
        for symbols in &self.symbols {
            if let Some(vaddr) = symbols.get_global::<Elf>(&self.memory, self.endian, name) {
                return self.vaddr_to_offset(vaddr);
            }
        }
        None
    }

    /// The DT_SONAME string, read from the dynamic segment.
    pub fn soname(&self) -> Option<String> {
        let mut cached = self.soname.lock().unwrap();
        if let Some(result) = cached.as_ref() {
            return result.clone();
        }
        let result = self.read_soname();
        *cached = Some(result.clone());
        result
    }

    fn read_soname(&self) -> Option<String> {
        let dynamic = self.dynamic.as_ref()?;
        let entry_size = std::mem::size_of::<Elf::Dyn>() as u64;
        let count = dynamic.size / entry_size;
        let mut strtab_vaddr = None;
        let mut strtab_size = None;
        let mut soname_offset = None;
        for i in 0..count {
            let dyn_entry: Elf::Dyn =
                read_pod(&*self.memory, dynamic.offset + i * entry_size)?;
            let tag: u64 = dyn_entry.d_tag(self.endian).into();
            let value: u64 = dyn_entry.d_val(self.endian).into();
            match tag as u32 {
                elf::DT_NULL => break,
                elf::DT_STRTAB => strtab_vaddr = Some(value),
                elf::DT_STRSZ => strtab_size = Some(value),
                elf::DT_SONAME => soname_offset = Some(value),
                _ => {}
            }
        }
        let offset = self.vaddr_to_offset(strtab_vaddr?)?;
        let soname_offset = soname_offset?;
        if soname_offset >= strtab_size? {
            return None;
        }
        self.memory
            .read_string(offset + soname_offset, MAX_SONAME)
    }

    /// The GNU build-id bytes from the build-id note, if present.
    pub fn build_id(&self) -> Option<Vec<u8>> {
        let note = self.build_id_note.as_ref()?;
        // Note headers are three u32 fields in both ELF classes.
        let mut offset = note.offset;
        let end = note.offset + note.size;
        while offset + 12 <= end {
            let mut buf = [0u8; 12];
            if !self.memory.read_fully(offset, &mut buf) {
                return None;
            }
            let read_u32 = |chunk: &[u8]| -> u32 {
                let bytes: [u8; 4] = chunk.try_into().unwrap();
                match self.endian {
                    Endianness::Little => u32::from_le_bytes(bytes),
                    Endianness::Big => u32::from_be_bytes(bytes),
                }
            };
            let namesz = read_u32(&buf[0..4]) as u64;
            let descsz = read_u32(&buf[4..8]) as u64;
            let n_type = read_u32(&buf[8..12]);
            let name_offset = offset + 12;
            let desc_offset = name_offset + namesz.div_ceil(4) * 4;
            if n_type == NT_GNU_BUILD_ID && namesz == 4 {
                let mut name = [0u8; 4];
                if self.memory.read_fully(name_offset, &mut name) && &name == b"GNU\0" {
                    let mut desc = vec![0u8; descsz as usize];
                    if self.memory.read_fully(desc_offset, &mut desc) {
                        return Some(desc);
                    }
                    return None;
                }
            }
            offset = desc_offset + descsz.div_ceil(4) * 4;
        }
        None
    }

    /// The `.gnu_debugdata` extent, for building the inner ELF.
    pub fn gnu_debugdata_info(&self) -> Option<(u64, u64)> {
        self.gnu_debugdata.map(|info| (info.offset, info.size))
    }
}
