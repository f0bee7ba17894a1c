use std::fmt::Write as _;
use std::sync::Arc;

use crate::arch::Arch;
use crate::elf::Elf;
use crate::error::{ErrorCode, ErrorData};
use crate::jit_debug::{DexFiles, JitDebug};
use crate::map_info::{MapInfo, MAPS_FLAGS_DEVICE_MAP};
use crate::maps::Maps;
use crate::memory::Memory;
use crate::regs::Regs;
use crate::shared_string::SharedString;

pub const DEFAULT_MAX_FRAMES: usize = 512;

/// One resolved call frame.
#[derive(Clone, Debug, Default)]
pub struct FrameData {
    /// Index of the frame, 0 being the frame of the current PC.
    pub num: usize,
    /// PC relative to the containing map (load-bias adjusted).
    pub rel_pc: u64,
    pub pc: u64,
    pub sp: u64,
    pub function_name: Option<SharedString>,
    pub function_offset: u64,
    pub map_name: SharedString,
    /// File offset at which the map's ELF starts; non-zero for embedded
    /// ELFs (e.g. inside an apk).
    pub map_elf_start_offset: u64,
    pub map_exact_offset: u64,
    pub map_start: u64,
    pub map_end: u64,
    pub map_load_bias: i64,
    pub map_flags: u16,
}

/// The frame-by-frame unwind driver: resolves the PC to a map, selects an
/// unwind engine, computes the caller frame and repeats until the stack
/// is exhausted, an error is fatal, or the frame cap is hit.
pub struct Unwinder<'a> {
    max_frames: usize,
    maps: &'a Maps,
    regs: Regs,
    process_memory: Arc<dyn Memory>,
    jit_debug: Option<&'a JitDebug>,
    dex_files: Option<&'a DexFiles>,
    frames: Vec<FrameData>,
    last_error: ErrorData,
    resolve_names: bool,
    display_build_id: bool,
}

impl<'a> Unwinder<'a> {
    pub fn new(
        max_frames: usize,
        maps: &'a Maps,
        regs: Regs,
        process_memory: Arc<dyn Memory>,
    ) -> Unwinder<'a> {
        Unwinder {
            max_frames,
            maps,
            regs,
            process_memory,
            jit_debug: None,
            dex_files: None,
            frames: Vec::new(),
            last_error: ErrorData::default(),
            resolve_names: true,
            display_build_id: false,
        }
    }

    pub fn set_jit_debug(&mut self, jit_debug: &'a JitDebug) {
        self.jit_debug = Some(jit_debug);
    }

    pub fn set_dex_files(&mut self, dex_files: &'a DexFiles) {
        self.dex_files = Some(dex_files);
    }

    /// Disable symbol resolution; frames then carry no function names.
    pub fn set_resolve_names(&mut self, resolve: bool) {
        self.resolve_names = resolve;
    }

    /// Append `(BuildId: …)` to formatted frames.
    pub fn set_display_build_id(&mut self, display: bool) {
        self.display_build_id = display;
    }

    /// Replace the registers, e.g. to re-run the unwind on a clone.
    pub fn set_regs(&mut self, regs: Regs) {
        self.regs = regs;
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[FrameData] {
        &self.frames
    }

    pub fn last_error(&self) -> ErrorData {
        self.last_error
    }

    /// How far the lookup PC backs up from a return address to land
    /// inside the call instruction.
    fn pc_adjustment(rel_pc: u64, elf: &Elf, arch: Arch) -> u64 {
        match arch {
            Arch::Arm => {
                if rel_pc < 5 {
                    return 0;
                }
                if rel_pc & 1 != 0 {
                    // Thumb; the instruction is 2 or 4 bytes.
                    let mut buf = [0u8; 4];
                    if !elf.memory().read_fully(rel_pc - 5, &mut buf) {
                        return 2;
                    }
                    let value = u32::from_le_bytes(buf);
                    if value & 0xe000_f000 != 0xe000_f000 {
                        return 2;
                    }
                }
                4
            }
            Arch::Arm64 => {
                if rel_pc < 4 {
                    0
                } else {
                    4
                }
            }
            Arch::Riscv64 => {
                if rel_pc < 2 {
                    0
                } else {
                    2
                }
            }
            Arch::X86 | Arch::X86_64 => {
                if rel_pc == 0 {
                    0
                } else {
                    1
                }
            }
            Arch::Unknown => 0,
        }
    }

    fn fill_in_map_fields(frame: &mut FrameData, info: &MapInfo, load_bias: i64) {
        frame.map_name = info.name().clone();
        frame.map_elf_start_offset = info.elf_start_offset();
        frame.map_exact_offset = info.offset();
        frame.map_start = info.start();
        frame.map_end = info.end();
        frame.map_flags = info.flags();
        frame.map_load_bias = load_bias;
    }

    /// A DEX PC produced by the CFI of a managed runtime becomes its own
    /// interleaved frame, resolved through the DEX symbol resolver.
    fn fill_in_dex_frame(&mut self) {
        let dex_pc = self.regs.dex_pc();
        let mut frame = FrameData {
            num: self.frames.len(),
            pc: dex_pc,
            sp: self.regs.sp(),
            rel_pc: dex_pc,
            ..Default::default()
        };
        if let Some(index) = self.maps.find(dex_pc) {
            let info = self.maps.get(index).unwrap();
            frame.rel_pc = dex_pc - info.start();
            Self::fill_in_map_fields(&mut frame, info, 0);
        }
        if self.resolve_names {
            if let Some(dex_files) = self.dex_files {
                if let Some((name, offset)) = dex_files.get_function_name(self.maps, dex_pc) {
                    frame.function_name = Some(name);
                    frame.function_offset = offset;
                }
            }
        }
        self.frames.push(frame);
    }

    fn fill_in_frame(
        &mut self,
        info: Option<&MapInfo>,
        elf: Option<&Elf>,
        rel_pc: u64,
        symbol_pc: u64,
        pc_adjustment: u64,
        load_bias: i64,
    ) {
        let mut frame = FrameData {
            num: self.frames.len(),
            rel_pc: rel_pc - pc_adjustment,
            pc: self.regs.pc() - pc_adjustment,
            sp: self.regs.sp(),
            ..Default::default()
        };
        if let Some(info) = info {
            Self::fill_in_map_fields(&mut frame, info, load_bias);
        }
        if self.resolve_names {
            if let Some(elf) = elf {
                if let Some((name, offset)) = elf.get_function_name(symbol_pc) {
                    frame.function_name = Some(name);
                    frame.function_offset = offset;
                }
            }
        }
        self.frames.push(frame);
    }

    /// Walk the stack. `initial_map_names_to_skip` drops leading frames
    /// whose map basename matches (e.g. the sampler's own library);
    /// `map_suffixes_to_ignore` aborts the walk on matching map name
    /// suffixes (e.g. odex/oat files with misleading unwind data).
    pub fn unwind(
        &mut self,
        initial_map_names_to_skip: Option<&[&str]>,
        map_suffixes_to_ignore: Option<&[&str]>,
    ) {
        self.frames.clear();
        self.last_error = ErrorData::default();

        let arch = self.regs.arch();
        let mut return_address_attempt = false;
        let mut adjust_pc = false;

        while self.frames.len() < self.max_frames {
            let cur_pc = self.regs.pc();
            let cur_sp = self.regs.sp();

            let map_index = self.maps.find(cur_pc);
            let mut elf = None;
            let mut rel_pc = cur_pc;
            let mut step_pc = cur_pc;
            let mut pc_adjustment = 0;
            let mut load_bias = 0;
            let mut jit_elf = None;

            match map_index {
                None => {
                    self.last_error = ErrorData::new(ErrorCode::InvalidMap, cur_pc);
                }
                Some(index) => {
                    let info = self.maps.get(index).unwrap().clone();
                    if let Some(suffixes) = map_suffixes_to_ignore {
                        let name = info.name();
                        if suffixes
                            .iter()
                            .any(|suffix| name.rsplit('.').next() == Some(*suffix))
                        {
                            break;
                        }
                    }
                    let map_elf = self.maps.get_elf(index, Some(&self.process_memory), arch);
                    load_bias = map_elf.load_bias();
                    rel_pc = map_elf.get_rel_pc(cur_pc, &info);
                    pc_adjustment = if adjust_pc {
                        Self::pc_adjustment(rel_pc, &map_elf, arch)
                    } else {
                        0
                    };
                    step_pc = rel_pc - pc_adjustment;

                    // Dynamically produced code is found through the JIT
                    // debug interface ahead of the file-backed ELF.
                    if let Some(jit_debug) = self.jit_debug {
                        let adjusted_pc = cur_pc - pc_adjustment;
                        if let Some(found) = jit_debug.find(self.maps, adjusted_pc) {
                            // JIT symfiles are linked at their runtime
                            // addresses, so the absolute PC is the lookup
                            // key.
                            step_pc = adjusted_pc;
                            jit_elf = Some(found);
                        }
                    }
                    elf = Some((map_elf, info));
                }
            }

            // A pending DEX PC gets its own frame before the native one.
            if self.regs.dex_pc() != 0 {
                self.fill_in_dex_frame();
                self.regs.set_dex_pc(0);
                if self.frames.len() == self.max_frames {
                    self.last_error = ErrorData::new(ErrorCode::MaxFrames, 0);
                    break;
                }
            }

            let skip_frame = self.frames.is_empty()
                && initial_map_names_to_skip.is_some_and(|names| {
                    let map_name = elf
                        .as_ref()
                        .map(|(_, info)| info.name().as_str())
                        .unwrap_or("");
                    let basename = map_name.rsplit('/').next().unwrap_or(map_name);
                    names.iter().any(|name| *name == basename)
                });
            if !skip_frame {
                let frame_elf = jit_elf
                    .as_deref()
                    .or_else(|| elf.as_ref().map(|(elf, _)| &**elf));
                // JIT symfiles are symbolized by absolute PC.
                let symbol_pc = step_pc;
                let info = elf.as_ref().map(|(_, info)| &**info);
                self.fill_in_frame(info, frame_elf, rel_pc, symbol_pc, pc_adjustment, load_bias);
                if self.frames.len() == self.max_frames {
                    break;
                }
            }

            let Some((map_elf, info)) = elf else {
                // The PC was not in any map; nothing can step from here.
                break;
            };

            adjust_pc = true;
            let mut stepped = false;
            let mut finished = false;
            let mut is_signal_frame = false;
            if info.flags() & MAPS_FLAGS_DEVICE_MAP == 0 {
                let step_elf = jit_elf.as_deref().unwrap_or(&map_elf);
                if self
                    .regs
                    .step_if_signal_handler(rel_pc, step_elf, &self.process_memory)
                {
                    stepped = true;
                    is_signal_frame = true;
                } else if step_elf.step(
                    step_pc,
                    &mut self.regs,
                    &self.process_memory,
                    &mut finished,
                    &mut is_signal_frame,
                ) {
                    stepped = true;
                } else {
                    let error = step_elf.last_error();
                    if error.code != ErrorCode::None {
                        self.last_error = error;
                    } else {
                        self.last_error = ErrorData::new(ErrorCode::UnwindInfo, step_pc);
                    }
                }
            }

            if finished {
                break;
            }

            if !stepped {
                if return_address_attempt {
                    // The speculative LR frame led nowhere; drop it
                    // unless the unwind plausibly ended in non-mapped
                    // code.
                    if self.frames.len() > 2
                        || (!self.frames.is_empty()
                            && self.maps.find(self.frames[0].pc).is_some())
                    {
                        self.frames.pop();
                    }
                    break;
                }
                if !self
                    .regs
                    .set_pc_from_return_address(&self.process_memory)
                {
                    break;
                }
                return_address_attempt = true;
            } else {
                return_address_attempt = false;
            }

            // Loop guards: no progress, or the stack pointer moving the
            // wrong way on a normal step.
            if self.regs.pc() == cur_pc && self.regs.sp() == cur_sp {
                self.last_error = ErrorData::new(ErrorCode::RepeatedFrame, cur_pc);
                break;
            }
            if stepped && !is_signal_frame && self.regs.sp() < cur_sp {
                self.last_error = ErrorData::new(ErrorCode::RepeatedFrame, cur_pc);
                break;
            }
        }

        if self.frames.len() == self.max_frames && self.last_error.code == ErrorCode::None {
            self.last_error = ErrorData::new(ErrorCode::MaxFrames, 0);
        }
    }

    /// Render one frame as
    /// `  #NN pc OFFSET  MAP_NAME (FUNC+DELTA) (BuildId: HEX)`.
    pub fn format_frame(&self, index: usize) -> String {
        let Some(frame) = self.frames.get(index) else {
            return String::new();
        };
        let width = self.regs.arch().pointer_size() * 2;
        let mut out = format!("  #{:02} pc {:0width$x}  ", frame.num, frame.rel_pc);

        if frame.map_start == frame.map_end {
            out.push_str("<unknown>");
        } else if frame.map_name.is_empty() {
            let _ = write!(out, "<anonymous:{:x}>", frame.map_start);
        } else {
            let name = frame.map_name.as_str();
            out.push_str(name.rsplit('/').next().unwrap_or(name));
        }
        if frame.map_elf_start_offset != 0 {
            let _ = write!(out, " (offset 0x{:x})", frame.map_elf_start_offset);
        }
        if let Some(function_name) = &frame.function_name {
            if frame.function_offset != 0 {
                let _ = write!(out, " ({}+{})", function_name, frame.function_offset);
            } else {
                let _ = write!(out, " ({})", function_name);
            }
        }
        if self.display_build_id && frame.map_start != frame.map_end {
            if let Some(map_index) = self.maps.find(frame.pc) {
                let build_id = self.maps.get(map_index).unwrap().get_printable_build_id();
                if !build_id.is_empty() {
                    let _ = write!(out, " (BuildId: {build_id})");
                }
            }
        }
        out
    }

    /// All frames, one formatted line each.
    pub fn format_frames(&self) -> String {
        let mut out = String::new();
        for i in 0..self.frames.len() {
            out.push_str(&self.format_frame(i));
            out.push('\n');
        }
        out
    }
}
