use std::path::Path;
use std::sync::Arc;

use crate::arch::Arch;
use crate::maps::Maps;
use crate::memory::{Memory, MemoryOffline, MemoryOfflineParts};
use crate::regs::{register_names, Regs};

/// Loads the stable on-disk snapshot format: `maps.txt` in the
/// `/proc/<pid>/maps` text format, `regs.txt` with one `name: HEX` line
/// per register, `stack.data` (or `stack0.data, stack1.data, …`) each
/// starting with the base address of the raw bytes that follow, and any
/// ELF files `maps.txt` refers to, resolved relative to the snapshot
/// directory.
pub struct OfflineSnapshot {
    pub maps: Maps,
    pub regs: Regs,
    pub process_memory: Arc<dyn Memory>,
}

#[derive(thiserror::Error, Debug)]
pub enum SnapshotError {
    #[error("Failed to read {0}: {1}")]
    Io(String, #[source] std::io::Error),

    #[error("Malformed maps.txt")]
    MalformedMaps,

    #[error("Malformed register line: {0}")]
    MalformedRegs(String),

    #[error("Register {0} is not part of the {1:?} register set")]
    UnknownRegister(String, Arch),

    #[error("Malformed stack data in {0}")]
    MalformedStack(String),

    #[error("No stack data files found")]
    NoStackData,
}

impl OfflineSnapshot {
    pub fn load(dir: &Path, arch: Arch) -> Result<OfflineSnapshot, SnapshotError> {
        Ok(OfflineSnapshot {
            maps: load_maps(dir)?,
            regs: load_regs(dir, arch)?,
            process_memory: Arc::new(load_stack(dir)?),
        })
    }
}

pub fn load_maps(dir: &Path) -> Result<Maps, SnapshotError> {
    let path = dir.join("maps.txt");
    let buffer = std::fs::read_to_string(&path)
        .map_err(|e| SnapshotError::Io(path.display().to_string(), e))?;
    Maps::parse(&buffer).ok_or(SnapshotError::MalformedMaps)
}

/// Parse `regs.txt` against the architecture's canonical register names
/// (e.g. arm64 `x0..x28, sp, lr, pc, pst`).
pub fn load_regs(dir: &Path, arch: Arch) -> Result<Regs, SnapshotError> {
    let path = dir.join("regs.txt");
    let buffer = std::fs::read_to_string(&path)
        .map_err(|e| SnapshotError::Io(path.display().to_string(), e))?;
    let names = register_names(arch);
    let mut regs = Regs::new(arch);
    for line in buffer.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| SnapshotError::MalformedRegs(line.to_string()))?;
        let name = name.trim();
        let value = u64::from_str_radix(value.trim(), 16)
            .map_err(|_| SnapshotError::MalformedRegs(line.to_string()))?;
        let index = names
            .iter()
            .position(|n| *n == name)
            .ok_or_else(|| SnapshotError::UnknownRegister(name.to_string(), arch))?;
        regs.set(index as u32, value);
    }
    Ok(regs)
}

/// Load `stack.data`, or the numbered `stack<i>.data` sequence.
pub fn load_stack(dir: &Path) -> Result<MemoryOfflineParts, SnapshotError> {
    let mut parts = MemoryOfflineParts::new();
    let single = dir.join("stack.data");
    if single.is_file() {
        parts.add(
            MemoryOffline::from_file(&single)
                .ok_or_else(|| SnapshotError::MalformedStack(single.display().to_string()))?,
        );
        return Ok(parts);
    }
    for i in 0.. {
        let path = dir.join(format!("stack{i}.data"));
        if !path.is_file() {
            break;
        }
        parts.add(
            MemoryOffline::from_file(&path)
                .ok_or_else(|| SnapshotError::MalformedStack(path.display().to_string()))?,
        );
    }
    if parts.is_empty() {
        return Err(SnapshotError::NoStackData);
    }
    Ok(parts)
}

/// Assemble process memory for a JIT snapshot from every
/// `descriptor/entry/jit/stack` data file in the directory.
pub fn load_jit_memory(dir: &Path) -> Result<MemoryOfflineParts, SnapshotError> {
    let mut parts = MemoryOfflineParts::new();
    let entries = std::fs::read_dir(dir)
        .map_err(|e| SnapshotError::Io(dir.display().to_string(), e))?;
    let mut paths: Vec<_> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                return false;
            };
            let Some(stem) = name.strip_suffix(".data") else {
                return false;
            };
            let stem = stem.trim_end_matches(|c: char| c.is_ascii_digit());
            matches!(stem, "descriptor" | "entry" | "jit" | "stack")
        })
        .collect();
    paths.sort();
    for path in &paths {
        parts.add(
            MemoryOffline::from_file(path)
                .ok_or_else(|| SnapshotError::MalformedStack(path.display().to_string()))?,
        );
    }
    if parts.is_empty() {
        return Err(SnapshotError::NoStackData);
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::arm64::*;
    use std::io::Write;

    #[test]
    fn loads_arm64_registers() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("regs.txt")).unwrap();
        writeln!(file, "x0: 4").unwrap();
        writeln!(file, "x29: 1000").unwrap();
        writeln!(file, "sp: 7fe0d84040").unwrap();
        writeln!(file, "lr: 64d09d5078").unwrap();
        writeln!(file, "pc: 64d09d4fd8").unwrap();
        writeln!(file, "pst: 20000000").unwrap();
        drop(file);
        let regs = load_regs(dir.path(), Arch::Arm64).unwrap();
        assert_eq!(regs.get(ARM64_REG_R0), Some(4));
        assert_eq!(regs.get(ARM64_REG_R29), Some(0x1000));
        assert_eq!(regs.sp(), 0x7fe0_d840_40);
        assert_eq!(regs.pc(), 0x64d0_9d4f_d8);
        assert_eq!(regs.get(ARM64_REG_PSTATE), Some(0x2000_0000));
    }

    #[test]
    fn rejects_registers_of_the_wrong_arch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("regs.txt"), "rip: 1234\n").unwrap();
        match load_regs(dir.path(), Arch::Arm64) {
            Err(SnapshotError::UnknownRegister(name, Arch::Arm64)) => assert_eq!(name, "rip"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn loads_numbered_stack_parts() {
        let dir = tempfile::tempdir().unwrap();
        for (i, base) in [(0u32, 0x1000u64), (1, 0x8000)] {
            let mut file =
                std::fs::File::create(dir.path().join(format!("stack{i}.data"))).unwrap();
            file.write_all(&base.to_le_bytes()).unwrap();
            file.write_all(&[i as u8; 16]).unwrap();
        }
        let parts = load_stack(dir.path()).unwrap();
        let mut buf = [0u8; 4];
        assert!(parts.read_fully(0x1004, &mut buf));
        assert_eq!(buf, [0; 4]);
        assert!(parts.read_fully(0x8004, &mut buf));
        assert_eq!(buf, [1; 4]);
        assert_eq!(parts.read(0x9000, &mut buf), 0);
    }

    #[test]
    fn missing_stack_data_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_stack(dir.path()),
            Err(SnapshotError::NoStackData)
        ));
    }
}
