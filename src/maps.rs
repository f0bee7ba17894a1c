use std::fmt::Write as _;
use std::sync::Arc;

use crate::arch::Arch;
use crate::elf::Elf;
use crate::map_info::{ElfCache, MapInfo, MAPS_FLAGS_DEVICE_MAP, PROT_EXEC, PROT_READ, PROT_WRITE};
use crate::memory::Memory;

/// The ordered set of mappings of one process, parsed from the
/// `/proc/<pid>/maps` text format (live, from a buffer, or built
/// synthetically). Lookup by address is a binary search; the entries are
/// an arena the per-map prev/next links index into.
#[derive(Default)]
pub struct Maps {
    entries: Vec<Arc<MapInfo>>,
    elf_cache: Option<Arc<ElfCache>>,
}

impl Maps {
    pub fn new() -> Maps {
        Maps::default()
    }

    /// Parse the text of a maps file. Fails when any line is malformed.
    pub fn parse(buffer: &str) -> Option<Maps> {
        let mut maps = Maps::new();
        for line in buffer.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let info = parse_line(line)?;
            maps.add_map_info(info);
        }
        Some(maps)
    }

    pub fn from_pid(pid: u32) -> Option<Maps> {
        let buffer = std::fs::read_to_string(format!("/proc/{pid}/maps")).ok()?;
        Maps::parse(&buffer)
    }

    pub fn local() -> Option<Maps> {
        let buffer = std::fs::read_to_string("/proc/self/maps").ok()?;
        Maps::parse(&buffer)
    }

    /// Opt this maps object into a process-wide ELF cache.
    pub fn set_elf_cache(&mut self, cache: Arc<ElfCache>) {
        self.elf_cache = Some(cache);
    }

    /// Append a synthetic map. Entries must be added in address order.
    pub fn add(&mut self, start: u64, end: u64, offset: u64, flags: u16, name: &str) {
        self.add_map_info(MapInfo::new(start, end, offset, flags, name));
    }

    fn add_map_info(&mut self, mut info: MapInfo) {
        let index = self.entries.len();
        info.prev_map = index.checked_sub(1);
        info.prev_real_map = self
            .entries
            .iter()
            .enumerate()
            .rev()
            .find(|(_, entry)| !entry.is_blank())
            .map(|(i, _)| i);
        let info = Arc::new(info);
        if !info.is_blank() {
            // Wire up the next-real link of every trailing entry that has
            // not seen a real successor yet.
            for entry in self.entries.iter_mut().rev() {
                if Arc::get_mut(entry).is_none() {
                    break;
                }
                let entry = Arc::get_mut(entry).unwrap();
                if entry.next_real_map.is_some() {
                    break;
                }
                entry.next_real_map = Some(index);
            }
        }
        self.entries.push(info);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<MapInfo>> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<MapInfo>> {
        self.entries.iter()
    }

    /// Find the map containing `addr`.
    pub fn find(&self, addr: u64) -> Option<usize> {
        let pos = self.entries.partition_point(|entry| entry.start() <= addr);
        if pos == 0 {
            return None;
        }
        let index = pos - 1;
        self.entries[index].contains(addr).then_some(index)
    }

    fn neighbors(&self, index: usize) -> (Option<&MapInfo>, Option<&MapInfo>) {
        let info = &self.entries[index];
        let prev = info.prev_real_map.map(|i| &*self.entries[i]);
        let next = info.next_real_map.map(|i| &*self.entries[i]);
        (prev, next)
    }

    /// Materialize the ELF of the map at `index` (see `MapInfo::get_elf`
    /// for the protocol).
    pub fn get_elf(
        &self,
        index: usize,
        process_memory: Option<&Arc<dyn Memory>>,
        expected_arch: Arch,
    ) -> Arc<Elf> {
        let (prev, next) = self.neighbors(index);
        self.entries[index].get_elf(
            process_memory,
            expected_arch,
            prev,
            next,
            self.elf_cache.as_deref(),
        )
    }

    pub fn get_load_bias(
        &self,
        index: usize,
        process_memory: Option<&Arc<dyn Memory>>,
    ) -> i64 {
        let (prev, next) = self.neighbors(index);
        self.entries[index].get_load_bias(process_memory, prev, next)
    }

    /// Serialize back into the text format `parse` accepts.
    pub fn to_buffer(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            let _ = writeln!(out, "{entry}");
        }
        out
    }
}

fn parse_perms(perms: &str) -> Option<u16> {
    let bytes = perms.as_bytes();
    if bytes.len() != 4 {
        return None;
    }
    let mut flags = 0u16;
    match bytes[0] {
        b'r' => flags |= PROT_READ,
        b'-' => {}
        _ => return None,
    }
    match bytes[1] {
        b'w' => flags |= PROT_WRITE,
        b'-' => {}
        _ => return None,
    }
    match bytes[2] {
        b'x' => flags |= PROT_EXEC,
        b'-' => {}
        _ => return None,
    }
    if !matches!(bytes[3], b'p' | b's' | b'-') {
        return None;
    }
    Some(flags)
}

/// Parse one maps line:
/// `START-END PERMS OFFSET DEV INO [PATH]`.
fn parse_line(line: &str) -> Option<MapInfo> {
    let mut fields = line.splitn(6, char::is_whitespace);
    let range = fields.next()?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let name = fields.next().map(str::trim).unwrap_or("");

    let (start, end) = range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    if end <= start {
        return None;
    }
    let mut flags = parse_perms(perms)?;
    let offset = u64::from_str_radix(offset, 16).ok()?;

    if name.starts_with("/dev/") && !name.starts_with("/dev/ashmem/") {
        flags |= MAPS_FLAGS_DEVICE_MAP;
    }
    Some(MapInfo::new(start, end, offset, flags, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
1000-2000 r--p 00000000 00:00 0 /system/lib/libc.so
2000-3000 ---p 00000000 00:00 0 /system/lib/libc.so
3000-4000 r-xp 00003000 00:00 0 /system/lib/libc.so
5000-6000 rw-p 00000000 00:00 0
7000-8000 r-xp 00000000 00:00 0 [stack]
9000-a000 rw-p 00000000 00:00 0 /dev/binder
";

    #[test]
    fn parses_all_fields() {
        let maps = Maps::parse(MAPS).unwrap();
        assert_eq!(maps.len(), 6);
        let info = maps.get(0).unwrap();
        assert_eq!(info.start(), 0x1000);
        assert_eq!(info.end(), 0x2000);
        assert_eq!(info.offset(), 0);
        assert_eq!(info.flags(), PROT_READ);
        assert_eq!(info.name().as_str(), "/system/lib/libc.so");
        let exec = maps.get(2).unwrap();
        assert_eq!(exec.offset(), 0x3000);
        assert_eq!(exec.flags(), PROT_READ | PROT_EXEC);
        let stack = maps.get(4).unwrap();
        assert_eq!(stack.name().as_str(), "[stack]");
        let device = maps.get(5).unwrap();
        assert_ne!(device.flags() & MAPS_FLAGS_DEVICE_MAP, 0);
    }

    #[test]
    fn find_is_a_binary_search_over_half_open_ranges() {
        let maps = Maps::parse(MAPS).unwrap();
        assert_eq!(maps.find(0x1000), Some(0));
        assert_eq!(maps.find(0x1fff), Some(0));
        assert_eq!(maps.find(0x2000), Some(1));
        assert_eq!(maps.find(0x4000), None);
        assert_eq!(maps.find(0x500), None);
        assert_eq!(maps.find(0x7abc), Some(4));
    }

    #[test]
    fn real_map_links_skip_blank_entries() {
        let maps = Maps::parse(
            "1000-2000 r--p 00000000 00:00 0 libc.so
2000-3000 ---p 00000000 00:00 0
3000-4000 r-xp 00003000 00:00 0 libc.so
",
        )
        .unwrap();
        let last = maps.get(2).unwrap();
        // The blank middle map is skipped.
        assert_eq!(last.prev_map, Some(1));
        assert_eq!(last.prev_real_map, Some(0));
        let first = maps.get(0).unwrap();
        assert_eq!(first.next_real_map, Some(2));
        let middle = maps.get(1).unwrap();
        assert_eq!(middle.next_real_map, Some(2));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(Maps::parse("garbage").is_none());
        assert!(Maps::parse("2000-1000 r--p 00000000 00:00 0\n").is_none());
        assert!(Maps::parse("1000-2000 zzzz 00000000 00:00 0\n").is_none());
    }

    #[test]
    fn round_trips_through_serialization() {
        let maps = Maps::parse(MAPS).unwrap();
        let text = maps.to_buffer();
        let reparsed = Maps::parse(&text).unwrap();
        assert_eq!(reparsed.len(), maps.len());
        for (a, b) in maps.iter().zip(reparsed.iter()) {
            assert_eq!(a.start(), b.start());
            assert_eq!(a.end(), b.end());
            assert_eq!(a.offset(), b.offset());
            assert_eq!(a.flags(), b.flags());
            assert_eq!(a.name(), b.name());
        }
    }
}
