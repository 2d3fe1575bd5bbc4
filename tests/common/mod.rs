//! Builders that lay out partition images byte-by-byte, so the tests pin
//! the on-disk formats rather than round-tripping through the library.
#![allow(dead_code)] // each test binary uses a different subset

pub const IMAGE_MAGIC: &[u8; 16] = b"partclone-image\0";
pub const BITMAP_MAGIC: &[u8; 8] = b"BiTmAgIc";

/// Deterministic, non-zero content for the `n`-th *stored* block.
pub fn stored_block(n: usize, block_size: usize) -> Vec<u8> {
    let fill = (n as u8).wrapping_mul(37).wrapping_add(1);
    let mut block = vec![fill; block_size];
    // Make the block's first bytes position-dependent so shifted reads
    // cannot pass by accident.
    block[0] = n as u8;
    block
}

/// Builds a V1 ("0001") image: 40-byte header, byte-wide usage map, the
/// 8-byte trailer marker, then one 4-byte check value after every stored
/// block.
pub fn build_v1(block_size: u32, usage_map: &[u8], device_size: u64) -> Vec<u8> {
    let mut image = Vec::new();

    image.extend_from_slice(IMAGE_MAGIC);
    image.extend_from_slice(b"0001");
    image.extend_from_slice(&block_size.to_le_bytes());
    image.extend_from_slice(&(usage_map.len() as u64).to_le_bytes());
    image.extend_from_slice(&device_size.to_le_bytes());
    assert_eq!(image.len(), 40);

    image.extend_from_slice(usage_map);
    image.extend_from_slice(BITMAP_MAGIC);

    let mut stored = 0usize;
    for &byte in usage_map {
        if byte == 1 {
            image.extend_from_slice(&stored_block(stored, block_size as usize));
            image.extend_from_slice(&[0xCC; 4]);
            stored += 1;
        }
    }

    image
}

/// Builds a V2 ("0002") image: 48-byte header, LSB-first packed bitmap,
/// its IEEE CRC-32, then stored blocks with a checksum after every
/// `blocks_per_checksum` of them.
pub fn build_v2(
    block_size: u32,
    total_blocks: u64,
    bitmap: &[u8],
    checksum_size: u32,
    blocks_per_checksum: u32,
) -> Vec<u8> {
    assert_eq!(bitmap.len() as u64, total_blocks.div_ceil(8));

    let mut image = Vec::new();

    image.extend_from_slice(IMAGE_MAGIC);
    image.extend_from_slice(b"0002");
    image.extend_from_slice(&block_size.to_le_bytes());
    image.extend_from_slice(&total_blocks.to_le_bytes());
    image.extend_from_slice(&(total_blocks * u64::from(block_size)).to_le_bytes());
    image.extend_from_slice(&checksum_size.to_le_bytes());
    image.extend_from_slice(&blocks_per_checksum.to_le_bytes());
    assert_eq!(image.len(), 48);

    image.extend_from_slice(bitmap);
    image.extend_from_slice(&crc32fast::hash(bitmap).to_le_bytes());

    let mut stored = 0usize;
    for block in 0..total_blocks {
        let bit = (bitmap[(block >> 3) as usize] >> (block & 7)) & 1;
        if bit == 1 {
            image.extend_from_slice(&stored_block(stored, block_size as usize));
            stored += 1;
            if blocks_per_checksum > 0 && stored % blocks_per_checksum as usize == 0 {
                image.extend_from_slice(&vec![0xCC; checksum_size as usize]);
            }
        }
    }

    image
}

/// Packs per-block usage flags LSB-first.
pub fn pack_bits(used: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; used.len().div_ceil(8)];
    for (i, &bit) in used.iter().enumerate() {
        if bit {
            bytes[i >> 3] |= 1 << (i & 7);
        }
    }
    bytes
}

/// Which blocks of an LSB-first packed bitmap are used.
pub fn bitmap_bits(bitmap: &[u8], total_blocks: u64) -> Vec<bool> {
    (0..total_blocks)
        .map(|b| (bitmap[(b >> 3) as usize] >> (b & 7)) & 1 == 1)
        .collect()
}
