use std::sync::Mutex;

use crate::memory::Memory;

const XZ_MAGIC: [u8; 6] = [0xfd, b'7', b'z', b'X', b'Z', 0x00];
const XZ_FOOTER_MAGIC: [u8; 2] = [b'Y', b'Z'];
const XZ_HEADER_SIZE: usize = 12;
const XZ_FOOTER_SIZE: usize = 12;

/// Refuse to even look at blobs above this size.
const MAX_COMPRESSED_SIZE: u64 = 1 << 30;

struct XzBlock {
    /// Decompressed bytes, populated on first use.
    decompressed_data: Option<Vec<u8>>,
    decompressed_size: u32,
    /// Offset of the block within the compressed blob.
    compressed_offset: u32,
    /// Size of the block in the blob, rounded up to 4-byte alignment.
    compressed_size: u32,
    /// Size of the block without padding, as recorded in the index.
    unpadded_size: u32,
    /// Offset of the 12-byte header of the stream this block belongs to.
    stream_header_offset: u32,
}

/// Serves reads out of an XZ-compressed blob (the `.gnu_debugdata`
/// mini-debug section) by decompressing one block at a time, on demand.
///
/// The block index is built once by a backward scan over the stream
/// footers and indexes; no data is decompressed until it is read. All
/// blocks except possibly the last must share one power-of-two
/// decompressed size so that block lookup is a shift; blobs that violate
/// this are decompressed and merged up front.
pub struct MemoryXz {
    compressed: Vec<u8>,
    blocks: Mutex<Vec<XzBlock>>,
    block_size_log2: u32,
    size: u64,
}

impl MemoryXz {
    pub fn new(memory: &dyn Memory, addr: u64, size: u64) -> Option<Self> {
        if size == 0 || size >= MAX_COMPRESSED_SIZE {
            return None;
        }
        let mut compressed = vec![0u8; size as usize];
        if !memory.read_fully(addr, &mut compressed) {
            return None;
        }

        let blocks = read_block_index(&compressed)?;
        let mut xz = MemoryXz {
            compressed,
            size: blocks.iter().map(|b| b.decompressed_size as u64).sum(),
            blocks: Mutex::new(blocks),
            // 31 so a single block is always block zero; a uniform
            // multi-block blob overrides this with the real shift.
            block_size_log2: 31,
        };

        // Pick the shift for block lookup, or merge everything when the
        // block sizes disagree.
        {
            let mut blocks = xz.blocks.lock().unwrap();
            if blocks.len() > 1 {
                let first = blocks[0].decompressed_size;
                let uniform = first.is_power_of_two()
                    && blocks[..blocks.len() - 1]
                        .iter()
                        .all(|b| b.decompressed_size == first)
                    && blocks.last().unwrap().decompressed_size <= first;
                if uniform {
                    xz.block_size_log2 = first.trailing_zeros();
                } else {
                    log::debug!(
                        "inconsistent xz block sizes, decompressing all {} blocks up front",
                        blocks.len()
                    );
                    let mut data = Vec::with_capacity(xz.size as usize);
                    for block in blocks.iter_mut() {
                        decompress_block(&xz.compressed, block)?;
                        data.extend_from_slice(block.decompressed_data.as_ref().unwrap());
                    }
                    let merged = XzBlock {
                        decompressed_size: data.len() as u32,
                        decompressed_data: Some(data),
                        compressed_offset: 0,
                        compressed_size: 0,
                        unpadded_size: 0,
                        stream_header_offset: 0,
                    };
                    *blocks = vec![merged];
                    // 31 so that the shift can never index past block 0.
                    xz.block_size_log2 = 31;
                }
            }
        }
        Some(xz)
    }

    /// Total decompressed size of the blob.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Memory for MemoryXz {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        if addr >= self.size {
            return 0;
        }
        let mut blocks = self.blocks.lock().unwrap();
        let mut copied = 0usize;
        let mut addr = addr;
        let mut index = (addr >> self.block_size_log2) as usize;
        while copied < dst.len() && index < blocks.len() {
            let block_start = (index as u64) << self.block_size_log2;
            let block = &mut blocks[index];
            if block.decompressed_data.is_none()
                && decompress_block(&self.compressed, block).is_none()
            {
                break;
            }
            let data = block.decompressed_data.as_ref().unwrap();
            let offset = (addr - block_start) as usize;
            let len = (dst.len() - copied).min(data.len() - offset);
            dst[copied..copied + len].copy_from_slice(&data[offset..offset + len]);
            copied += len;
            addr += len as u64;
            index += 1;
        }
        copied
    }
}

fn round_up4(value: u64) -> u64 {
    (value + 3) & !3
}

/// Decode an XZ multibyte integer (7 bits per byte, high bit continues).
fn read_varint(data: &[u8], offset: &mut usize) -> Option<u64> {
    let mut value = 0u64;
    for shift in 0..9 {
        let byte = *data.get(*offset)?;
        *offset += 1;
        value |= ((byte & 0x7f) as u64) << (shift * 7);
        if byte & 0x80 == 0 {
            if byte == 0 && shift != 0 {
                return None;
            }
            return Some(value);
        }
    }
    None
}

/// Walk the blob backwards over the stream footers, decoding each stream's
/// index to learn every block's compressed and decompressed extent. Only
/// the headers are read; nothing is decompressed.
fn read_block_index(compressed: &[u8]) -> Option<Vec<XzBlock>> {
    let mut streams = Vec::new();
    let mut end = compressed.len();
    while end > 0 {
        // Streams may be separated by 4-byte null padding.
        while end >= 4 && compressed[end - 4..end] == [0, 0, 0, 0] {
            end -= 4;
        }
        if end == 0 {
            break;
        }
        if end < XZ_HEADER_SIZE + XZ_FOOTER_SIZE {
            return None;
        }
        let footer = &compressed[end - XZ_FOOTER_SIZE..end];
        if footer[10..12] != XZ_FOOTER_MAGIC {
            return None;
        }
        let backward_size =
            (u32::from_le_bytes(footer[4..8].try_into().unwrap()) as u64 + 1) * 4;
        let index_start = (end - XZ_FOOTER_SIZE).checked_sub(backward_size as usize)?;

        // Index: indicator, record count, then (unpadded, uncompressed)
        // varint pairs per block.
        let index = &compressed[index_start..end - XZ_FOOTER_SIZE];
        if index.first() != Some(&0) {
            return None;
        }
        let mut offset = 1usize;
        let count = read_varint(index, &mut offset)?;
        let mut records = Vec::with_capacity(count as usize);
        let mut total_compressed = 0u64;
        for _ in 0..count {
            let unpadded = read_varint(index, &mut offset)?;
            let uncompressed = read_varint(index, &mut offset)?;
            total_compressed += round_up4(unpadded);
            records.push((unpadded, uncompressed));
        }

        let blocks_start = index_start.checked_sub(total_compressed as usize)?;
        let header_offset = blocks_start.checked_sub(XZ_HEADER_SIZE)?;
        if compressed[header_offset..header_offset + 6] != XZ_MAGIC {
            return None;
        }

        let mut block_offset = blocks_start as u64;
        let mut blocks = Vec::with_capacity(records.len());
        for (unpadded, uncompressed) in records {
            let compressed_size = round_up4(unpadded);
            blocks.push(XzBlock {
                decompressed_data: None,
                decompressed_size: u32::try_from(uncompressed).ok()?,
                compressed_offset: u32::try_from(block_offset).ok()?,
                compressed_size: u32::try_from(compressed_size).ok()?,
                unpadded_size: u32::try_from(unpadded).ok()?,
                stream_header_offset: u32::try_from(header_offset).ok()?,
            });
            block_offset += compressed_size;
        }
        streams.push(blocks);
        end = header_offset;
    }

    if streams.is_empty() {
        return None;
    }
    // Streams were collected back to front.
    let mut blocks = Vec::new();
    for stream in streams.into_iter().rev() {
        blocks.extend(stream);
    }
    Some(blocks)
}

/// Decompress one block by framing it as a complete single-block XZ
/// stream: the original stream header, the block bytes, and a fresh
/// index and footer.
fn decompress_block(compressed: &[u8], block: &mut XzBlock) -> Option<()> {
    let header_offset = block.stream_header_offset as usize;
    let header = compressed.get(header_offset..header_offset + XZ_HEADER_SIZE)?;
    let start = block.compressed_offset as usize;
    let data = compressed.get(start..start + block.compressed_size as usize)?;

    let mut index = vec![0u8];
    write_varint(&mut index, 1);
    write_varint(&mut index, block.unpadded_size as u64);
    write_varint(&mut index, block.decompressed_size as u64);
    while index.len() % 4 != 0 {
        index.push(0);
    }
    index.extend_from_slice(&crc32fast::hash(&index).to_le_bytes());

    let backward_size = (index.len() as u32 / 4) - 1;
    let mut footer_body = Vec::with_capacity(6);
    footer_body.extend_from_slice(&backward_size.to_le_bytes());
    footer_body.extend_from_slice(&header[6..8]);

    let mut stream = Vec::with_capacity(XZ_HEADER_SIZE + data.len() + index.len() + XZ_FOOTER_SIZE);
    stream.extend_from_slice(header);
    stream.extend_from_slice(data);
    stream.extend_from_slice(&index);
    stream.extend_from_slice(&crc32fast::hash(&footer_body).to_le_bytes());
    stream.extend_from_slice(&footer_body);
    stream.extend_from_slice(&XZ_FOOTER_MAGIC);

    let mut decompressed = Vec::with_capacity(block.decompressed_size as usize);
    let mut cursor = std::io::Cursor::new(stream);
    if lzma_rs::xz_decompress(&mut cursor, &mut decompressed).is_err() {
        log::warn!("failed to decompress mini-debug block");
        return None;
    }
    if decompressed.len() != block.decompressed_size as usize {
        return None;
    }
    block.decompressed_data = Some(decompressed);
    Some(())
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 0x7f, 0x80, 0x3fff, 0x4000, 0x98765] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            let mut offset = 0;
            assert_eq!(read_varint(&buf, &mut offset), Some(value));
            assert_eq!(offset, buf.len());
        }
    }

    #[test]
    fn rejects_garbage() {
        let memory = crate::memory::MemoryBuffer::new(vec![0xffu8; 64]);
        assert!(MemoryXz::new(&memory, 0, 64).is_none());
        assert!(MemoryXz::new(&memory, 0, 0).is_none());
    }
}
