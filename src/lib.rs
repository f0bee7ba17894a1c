//! A stack-unwinding core for crash reporters, profilers and debuggers.
//!
//! Given a snapshot of a thread (its registers, a view of its address
//! space and the process memory map), [`Unwinder`] walks backwards from
//! the current program counter one frame at a time, using DWARF
//! call-frame information, the ARM exception index, or the JIT debug
//! interface, until the call stack is exhausted.
//!
//! The same engine drives live-process unwinds (through
//! [`MemoryRemote`]/[`MemoryLocal`]) and offline unwinds of captured
//! snapshots (see [`offline`]).

mod arch;
mod dex;
mod dwarf;
mod elf;
mod elf_interface;
mod error;
mod exidx;
mod jit_debug;
mod map_info;
mod maps;
mod memory;
mod memory_xz;
pub mod offline;
mod regs;
mod shared_string;
mod symbols;
mod unwinder;

pub use arch::Arch;
pub use dex::{DexCache, DexFile};
pub use elf::Elf;
pub use error::{ErrorCode, ErrorData};
pub use jit_debug::{DexFiles, GlobalDebugSymfile, JitDebug};
pub use map_info::{ElfCache, MapInfo, MAPS_FLAGS_DEVICE_MAP, PROT_EXEC, PROT_READ, PROT_WRITE};
pub use maps::Maps;
pub use memory::{
    Memory, MemoryBuffer, MemoryCache, MemoryFileAtOffset, MemoryLocal, MemoryOffline,
    MemoryOfflineBuffer, MemoryOfflineParts, MemoryRange, MemoryRanges, MemoryRemote,
};
pub use memory_xz::MemoryXz;
pub use regs::{arm, arm64, riscv64, x86, x86_64, Regs};
pub use shared_string::SharedString;
pub use unwinder::{FrameData, Unwinder, DEFAULT_MAX_FRAMES};
