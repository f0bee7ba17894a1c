use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use memmap2::Mmap;

/// Uniform random-access byte reads over some backing store: a file, a live
/// process, a snapshot buffer, or a composition of those.
///
/// `read` places up to `dst.len()` bytes into `dst` and returns how many it
/// actually placed; a short read is not an error. Every implementation
/// treats `addr + len` overflow as a failed read.
pub trait Memory: Send + Sync {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize;

    /// Like [`read`](Memory::read), but only succeeds when the full length
    /// was read.
    fn read_fully(&self, addr: u64, dst: &mut [u8]) -> bool {
        self.read(addr, dst) == dst.len()
    }

    /// Read a null-terminated string starting at `addr`, scanning at most
    /// `max_read` bytes. Scans in a local window first so the common short
    /// string costs one read; only re-reads when the string straddles the
    /// window.
    fn read_string(&self, addr: u64, max_read: usize) -> Option<String> {
        let mut buffer = [0u8; 256];
        let mut offset = 0usize;
        while offset < max_read {
            let want = buffer.len().min(max_read - offset);
            let cur = addr.checked_add(offset as u64)?;
            let size = self.read(cur, &mut buffer[..want]);
            if size == 0 {
                return None;
            }
            if let Some(len) = buffer[..size].iter().position(|&b| b == 0) {
                return if offset == 0 {
                    String::from_utf8(buffer[..len].to_vec()).ok()
                } else {
                    let mut full = vec![0u8; offset + len];
                    self.read_fully(addr, &mut full)
                        .then(|| String::from_utf8(full).ok())
                        .flatten()
                };
            }
            offset += size;
        }
        None
    }
}

impl Memory for Box<dyn Memory> {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        (**self).read(addr, dst)
    }
}

impl Memory for Arc<dyn Memory> {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        (**self).read(addr, dst)
    }
}

fn end_addr(addr: u64, len: usize) -> Option<u64> {
    addr.checked_add(len as u64)
}

/// An owned byte buffer addressed from zero.
#[derive(Default)]
pub struct MemoryBuffer {
    raw: Vec<u8>,
}

impl MemoryBuffer {
    pub fn new(raw: Vec<u8>) -> Self {
        MemoryBuffer { raw }
    }

    pub fn size(&self) -> u64 {
        self.raw.len() as u64
    }
}

impl Memory for MemoryBuffer {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        if addr >= self.raw.len() as u64 {
            return 0;
        }
        let start = addr as usize;
        let len = dst.len().min(self.raw.len() - start);
        dst[..len].copy_from_slice(&self.raw[start..start + len]);
        len
    }
}

/// A read-only mapping of a region of a file, addressed from zero at
/// `offset` within the file. The mapping lives as long as the object.
pub struct MemoryFileAtOffset {
    map: Mmap,
    /// Offset of address zero within the mapping (the mapping itself is
    /// page aligned, the requested offset usually is not).
    start: usize,
    size: usize,
}

impl MemoryFileAtOffset {
    pub fn new(path: &Path, offset: u64, max_size: Option<u64>) -> Option<Self> {
        let file = File::open(path).ok()?;
        let file_size = file.metadata().ok()?.len();
        if offset >= file_size {
            return None;
        }
        let page_mask = page_size() as u64 - 1;
        let aligned_offset = offset & !page_mask;
        let misalign = (offset & page_mask) as usize;
        let mut map_len = (file_size - aligned_offset) as usize;
        if let Some(max) = max_size {
            let capped = max.checked_add(misalign as u64)?;
            if (capped as usize) < map_len {
                map_len = capped as usize;
            }
        }
        let map = unsafe {
            memmap2::MmapOptions::new()
                .offset(aligned_offset)
                .len(map_len)
                .map(&file)
                .ok()?
        };
        Some(MemoryFileAtOffset {
            map,
            start: misalign,
            size: map_len - misalign,
        })
    }

    pub fn size(&self) -> u64 {
        self.size as u64
    }
}

impl Memory for MemoryFileAtOffset {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        if addr >= self.size as u64 {
            return 0;
        }
        let offset = self.start + addr as usize;
        let len = dst.len().min(self.size - addr as usize);
        dst[..len].copy_from_slice(&self.map[offset..offset + len]);
        len
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn process_vm_read(pid: libc::pid_t, addr: u64, dst: &mut [u8]) -> usize {
    // process_vm_readv does not split a transfer inside one iovec, so the
    // remote side is split on page boundaries to get the longest possible
    // partial read.
    const MAX_IOVECS: usize = 64;
    let page = page_size() as u64;
    let mut total_read = 0usize;
    let mut cur = addr;
    let mut remaining = dst.len();
    while remaining > 0 {
        let dst_iov = libc::iovec {
            iov_base: unsafe { dst.as_mut_ptr().add(total_read) as *mut libc::c_void },
            iov_len: remaining,
        };
        let mut src_iovs = [libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        }; MAX_IOVECS];
        let mut iovecs_used = 0;
        let mut batch_len = 0usize;
        while remaining > 0 && iovecs_used < MAX_IOVECS {
            let misalignment = cur & (page - 1);
            let iov_len = ((page - misalignment) as usize).min(remaining);
            src_iovs[iovecs_used] = libc::iovec {
                iov_base: cur as *mut libc::c_void,
                iov_len,
            };
            remaining -= iov_len;
            batch_len += iov_len;
            cur = match cur.checked_add(iov_len as u64) {
                Some(next) => next,
                None => return total_read,
            };
            iovecs_used += 1;
        }
        let rc = unsafe {
            libc::process_vm_readv(pid, &dst_iov, 1, src_iovs.as_ptr(), iovecs_used as _, 0)
        };
        if rc == -1 {
            return total_read;
        }
        total_read += rc as usize;
        if (rc as usize) < batch_len {
            return total_read;
        }
    }
    total_read
}

fn proc_mem_read(pid: libc::pid_t, addr: u64, dst: &mut [u8]) -> usize {
    use std::os::unix::fs::FileExt;
    let path = format!("/proc/{pid}/mem");
    match File::open(path) {
        Ok(file) => file.read_at(dst, addr).unwrap_or(0),
        Err(_) => 0,
    }
}

const READ_UNDECIDED: u8 = 0;
const READ_VM: u8 = 1;
const READ_PROC_MEM: u8 = 2;

/// Reads another process's memory. Prefers the scatter/gather
/// `process_vm_readv` syscall; on failure falls back to `/proc/<pid>/mem`.
/// Whichever mechanism first returns bytes is latched for all later reads.
pub struct MemoryRemote {
    pid: libc::pid_t,
    read_redirect: AtomicU8,
}

impl MemoryRemote {
    pub fn new(pid: libc::pid_t) -> Self {
        MemoryRemote {
            pid,
            read_redirect: AtomicU8::new(READ_UNDECIDED),
        }
    }
}

impl Memory for MemoryRemote {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        if end_addr(addr, dst.len()).is_none() {
            return 0;
        }
        match self.read_redirect.load(Ordering::Relaxed) {
            READ_VM => process_vm_read(self.pid, addr, dst),
            READ_PROC_MEM => proc_mem_read(self.pid, addr, dst),
            _ => {
                let bytes = process_vm_read(self.pid, addr, dst);
                if bytes > 0 {
                    self.read_redirect.store(READ_VM, Ordering::Relaxed);
                    return bytes;
                }
                let bytes = proc_mem_read(self.pid, addr, dst);
                if bytes > 0 {
                    self.read_redirect.store(READ_PROC_MEM, Ordering::Relaxed);
                }
                bytes
            }
        }
    }
}

/// Reads the current process's address space.
pub struct MemoryLocal;

impl Memory for MemoryLocal {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        if end_addr(addr, dst.len()).is_none() {
            return 0;
        }
        process_vm_read(unsafe { libc::getpid() }, addr, dst)
    }
}

/// A sub-window of an underlying memory, rebased: reads at
/// `[offset, offset + length)` map to `[begin, begin + length)` in the
/// underlying memory. Reads outside the window return zero bytes.
pub struct MemoryRange {
    memory: Arc<dyn Memory>,
    begin: u64,
    length: u64,
    offset: u64,
}

impl MemoryRange {
    pub fn new(memory: Arc<dyn Memory>, begin: u64, length: u64, offset: u64) -> Self {
        MemoryRange {
            memory,
            begin,
            length,
            offset,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }
}

impl Memory for MemoryRange {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        if addr < self.offset {
            return 0;
        }
        let read_offset = addr - self.offset;
        if read_offset >= self.length {
            return 0;
        }
        let len = dst.len().min((self.length - read_offset) as usize);
        let read_addr = match read_offset.checked_add(self.begin) {
            Some(addr) => addr,
            None => return 0,
        };
        self.memory.read(read_addr, &mut dst[..len])
    }
}

/// Multiple [`MemoryRange`] windows composed into one address space,
/// dispatched by the upper bound of each window. Reads are not stitched
/// across windows.
#[derive(Default)]
pub struct MemoryRanges {
    maps: BTreeMap<u64, MemoryRange>,
}

impl MemoryRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, range: MemoryRange) {
        let last_addr = range
            .offset()
            .checked_add(range.length())
            .unwrap_or(u64::MAX);
        self.maps.insert(last_addr, range);
    }
}

impl Memory for MemoryRanges {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        let Some(next) = addr.checked_add(1) else {
            return 0;
        };
        if let Some((_, range)) = self.maps.range(next..).next() {
            return range.read(addr, dst);
        }
        0
    }
}

/// A contiguous snapshot buffer covering `[start, start + len)` of a
/// process's address space.
pub struct MemoryOfflineBuffer {
    data: Vec<u8>,
    start: u64,
}

impl MemoryOfflineBuffer {
    pub fn new(data: Vec<u8>, start: u64) -> Self {
        MemoryOfflineBuffer { data, start }
    }
}

impl Memory for MemoryOfflineBuffer {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        let end = self.start + self.data.len() as u64;
        if addr < self.start || addr >= end {
            return 0;
        }
        let offset = (addr - self.start) as usize;
        let len = dst.len().min((end - addr) as usize);
        dst[..len].copy_from_slice(&self.data[offset..offset + len]);
        len
    }
}

/// One stack snapshot file: an address-sized little-endian base address
/// followed by the raw bytes of that range.
pub struct MemoryOffline {
    memory: MemoryRange,
}

impl MemoryOffline {
    pub fn from_file(path: &Path) -> Option<Self> {
        let file = MemoryFileAtOffset::new(path, 0, None)?;
        let size = file.size().checked_sub(8)?;
        let file: Arc<dyn Memory> = Arc::new(file);
        let mut buf = [0u8; 8];
        if !file.read_fully(0, &mut buf) {
            return None;
        }
        let start = u64::from_le_bytes(buf);
        Some(MemoryOffline {
            memory: MemoryRange::new(file, 8, size, start),
        })
    }
}

impl Memory for MemoryOffline {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        self.memory.read(addr, dst)
    }
}

/// Several offline memories; the first one that yields bytes for an
/// address wins. Reads do not cross from one part into another.
#[derive(Default)]
pub struct MemoryOfflineParts {
    memories: Vec<MemoryOffline>,
}

impl MemoryOfflineParts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, memory: MemoryOffline) {
        self.memories.push(memory);
    }

    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }
}

impl Memory for MemoryOfflineParts {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        for memory in &self.memories {
            let bytes = memory.read(addr, dst);
            if bytes != 0 {
                return bytes;
            }
        }
        0
    }
}

const CACHE_BITS: u32 = 12;
const CACHE_SIZE: usize = 1 << CACHE_BITS;
const CACHE_MASK: u64 = (CACHE_SIZE - 1) as u64;
/// Reads above this size skip the cache entirely.
const CACHE_READ_LIMIT: usize = 64;

/// A page-granularity read-through cache for the small reads the unwind
/// engines make. A miss populates the page with one full-page read; a read
/// spanning a page boundary fetches at most one extra page.
pub struct MemoryCache {
    inner: Arc<dyn Memory>,
    cache: Mutex<HashMap<u64, Box<[u8; CACHE_SIZE]>>>,
}

impl MemoryCache {
    pub fn new(inner: Arc<dyn Memory>) -> Self {
        MemoryCache {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Copy from the page containing `addr`, populating it on miss.
    /// Returns how many of the requested bytes were served.
    fn read_cached(&self, addr: u64, dst: &mut [u8]) -> Option<usize> {
        let page = addr >> CACHE_BITS;
        let mut cache = self.cache.lock().unwrap();
        if !cache.contains_key(&page) {
            let mut data = Box::new([0u8; CACHE_SIZE]);
            if !self.inner.read_fully(page << CACHE_BITS, &mut data[..]) {
                return None;
            }
            cache.insert(page, data);
        }
        let data = cache.get(&page).unwrap();
        let in_page = (addr & CACHE_MASK) as usize;
        let len = dst.len().min(CACHE_SIZE - in_page);
        dst[..len].copy_from_slice(&data[in_page..in_page + len]);
        Some(len)
    }
}

impl Memory for MemoryCache {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        if dst.len() > CACHE_READ_LIMIT || end_addr(addr, dst.len()).is_none() {
            return self.inner.read(addr, dst);
        }
        let first = match self.read_cached(addr, dst) {
            Some(len) => len,
            None => return self.inner.read(addr, dst),
        };
        if first == dst.len() {
            return first;
        }
        // The read crossed into the next page; a small read can cross at
        // most one boundary, so no loop is needed.
        let rest = &mut dst[first..];
        let next_addr = addr + first as u64;
        match self.read_cached(next_addr, rest) {
            Some(len) => first + len,
            None => first + self.inner.read(next_addr, rest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn buffer_partial_and_out_of_range_reads() {
        let memory = MemoryBuffer::new(vec![1, 2, 3, 4, 5]);
        let mut dst = [0u8; 8];
        assert_eq!(memory.read(0, &mut dst), 5);
        assert_eq!(&dst[..5], &[1, 2, 3, 4, 5]);
        assert_eq!(memory.read(3, &mut dst), 2);
        assert_eq!(&dst[..2], &[4, 5]);
        assert_eq!(memory.read(5, &mut dst), 0);
        assert!(!memory.read_fully(2, &mut dst[..4]));
        assert!(memory.read_fully(2, &mut dst[..3]));
    }

    #[test]
    fn read_string_within_first_window() {
        let mut data = b"_function_name_".to_vec();
        data.push(0);
        let memory = MemoryBuffer::new(data);
        assert_eq!(
            memory.read_string(0, 256).as_deref(),
            Some("_function_name_")
        );
        assert_eq!(memory.read_string(1, 256).as_deref(), Some("function_name_"));
        // Bounded search that never sees the terminator fails.
        assert_eq!(memory.read_string(0, 4), None);
    }

    #[test]
    fn read_string_straddling_the_scan_window() {
        let mut data = vec![b'a'; 300];
        data.push(0);
        let memory = MemoryBuffer::new(data);
        let s = memory.read_string(0, 400).unwrap();
        assert_eq!(s.len(), 300);
        assert!(s.bytes().all(|b| b == b'a'));
    }

    #[test]
    fn range_rebases_and_bounds() {
        let inner: Arc<dyn Memory> = Arc::new(MemoryBuffer::new((0u8..100).collect()));
        let range = MemoryRange::new(inner, 50, 10, 0x1000);
        let mut dst = [0u8; 4];
        assert!(range.read_fully(0x1000, &mut dst));
        assert_eq!(dst, [50, 51, 52, 53]);
        // Below and beyond the window.
        assert_eq!(range.read(0xfff, &mut dst), 0);
        assert_eq!(range.read(0x100a, &mut dst), 0);
        // Truncated at the window end.
        assert_eq!(range.read(0x1008, &mut dst), 2);
    }

    #[test]
    fn ranges_dispatch_by_upper_bound() {
        let inner: Arc<dyn Memory> = Arc::new(MemoryBuffer::new((0u8..100).collect()));
        let mut ranges = MemoryRanges::new();
        ranges.insert(MemoryRange::new(inner.clone(), 0, 10, 0x1000));
        ranges.insert(MemoryRange::new(inner, 50, 10, 0x2000));
        let mut byte = [0u8; 1];
        assert!(ranges.read_fully(0x1009, &mut byte));
        assert_eq!(byte[0], 9);
        assert!(ranges.read_fully(0x2000, &mut byte));
        assert_eq!(byte[0], 50);
        assert_eq!(ranges.read(0x100a, &mut byte), 0);
        assert_eq!(ranges.read(0x3000, &mut byte), 0);
    }

    #[test]
    fn overflowing_read_fails() {
        let memory = MemoryRemote::new(1);
        let mut dst = [0u8; 16];
        assert_eq!(memory.read(u64::MAX - 4, &mut dst), 0);
    }

    #[test]
    fn cache_matches_underlying_reads() {
        let data: Vec<u8> = (0..(3 * CACHE_SIZE)).map(|i| (i % 251) as u8).collect();
        let plain = MemoryBuffer::new(data.clone());
        let cached = MemoryCache::new(Arc::new(MemoryBuffer::new(data)));
        for addr in [0u64, 1, 100, CACHE_SIZE as u64 - 3, CACHE_SIZE as u64] {
            let mut a = [0u8; 16];
            let mut b = [0u8; 16];
            assert_eq!(cached.read(addr, &mut a), plain.read(addr, &mut b));
            assert_eq!(a, b);
        }
    }

    #[test]
    fn cache_read_spanning_a_page_boundary() {
        let data: Vec<u8> = (0..(2 * CACHE_SIZE)).map(|i| (i % 256) as u8).collect();
        let cached = MemoryCache::new(Arc::new(MemoryBuffer::new(data.clone())));
        let addr = CACHE_SIZE as u64 - 8;
        let mut dst = [0u8; 16];
        assert!(cached.read_fully(addr, &mut dst));
        assert_eq!(&dst[..], &data[addr as usize..addr as usize + 16]);
    }

    #[test]
    fn cache_miss_on_short_page_delegates() {
        // The backing store is shorter than one cache page, so the page
        // populate fails and the cache must fall back to a plain read.
        let cached = MemoryCache::new(Arc::new(MemoryBuffer::new(vec![7u8; 32])));
        let mut dst = [0u8; 8];
        assert!(cached.read_fully(8, &mut dst));
        assert_eq!(dst, [7u8; 8]);
    }

    #[test]
    fn offline_file_reads_at_stated_base() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&0xd000_0000u64.to_le_bytes()).unwrap();
        file.write_all(&[9, 8, 7, 6]).unwrap();
        file.flush().unwrap();
        let memory = MemoryOffline::from_file(file.path()).unwrap();
        let mut dst = [0u8; 4];
        assert!(memory.read_fully(0xd000_0000, &mut dst));
        assert_eq!(dst, [9, 8, 7, 6]);
        assert_eq!(memory.read(0xcfff_ffff, &mut dst), 0);
        assert_eq!(memory.read(0xd000_0004, &mut dst), 0);
    }

    #[test]
    fn file_at_offset_respects_offset_and_size() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0u8..200).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        let memory = MemoryFileAtOffset::new(file.path(), 100, Some(50)).unwrap();
        let mut dst = [0u8; 4];
        assert!(memory.read_fully(0, &mut dst));
        assert_eq!(dst, [100, 101, 102, 103]);
        assert_eq!(memory.read(50, &mut dst), 0);
        assert!(MemoryFileAtOffset::new(file.path(), 200, None).is_none());
    }
}
