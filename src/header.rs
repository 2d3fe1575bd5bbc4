use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// 16-byte marker opening every partition image.
pub(crate) const IMAGE_MAGIC: &[u8; 16] = b"partclone-image\0";

/// 8-byte marker closing the V1 usage map.
pub(crate) const BITMAP_MAGIC: &[u8; 8] = b"BiTmAgIc";

/// Size of the per-group checksum in V1 images (one CRC-32 per block).
pub(crate) const CRC_SIZE: usize = 4;

/// The outer header prefix shared by both versions: magic plus the 4-byte
/// ASCII version stamp that selects the format handler.
pub(crate) const OUTER_HEADER_SIZE: usize = IMAGE_MAGIC.len() + 4;

/// V1 ("0001") header (40 bytes).
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct V1HeaderRaw {
    /// 0x00: "partclone-image\0"
    pub magic: [u8; 16],
    /// 0x10: "0001"
    pub version: [u8; 4],
    /// 0x14: Block size in bytes.
    pub block_size: U32,
    /// 0x18: Number of logical blocks on the imaged device.
    pub total_blocks: U64,
    /// 0x20: Device size in bytes (advisory).
    pub device_size: U64,
}

/// V2 ("0002") header (48 bytes): the V1 fields plus a configurable
/// checksum region.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct V2HeaderRaw {
    /// 0x00: "partclone-image\0"
    pub magic: [u8; 16],
    /// 0x10: "0002"
    pub version: [u8; 4],
    /// 0x14: Block size in bytes.
    pub block_size: U32,
    /// 0x18: Number of logical blocks on the imaged device.
    pub total_blocks: U64,
    /// 0x20: Device size in bytes (advisory).
    pub device_size: U64,
    /// 0x28: Bytes of checksum after each group of stored blocks.
    pub checksum_size: U32,
    /// 0x2C: Stored blocks per checksum group; 0 means no checksums.
    pub blocks_per_checksum: U32,
}

pub(crate) const V1_HEADER_SIZE: usize = size_of::<V1HeaderRaw>();
pub(crate) const V2_HEADER_SIZE: usize = size_of::<V2HeaderRaw>();

/// Header fields normalized across format versions.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ImageHeader {
    pub block_size: u32,
    pub total_blocks: u64,
    pub device_size: u64,
    pub checksum_size: u32,
    pub blocks_per_checksum: u32,
    /// Byte offset where stored block data begins.
    pub head_size: u64,
}

impl ImageHeader {
    pub(crate) fn from_v1(raw: &V1HeaderRaw) -> Self {
        let total_blocks = raw.total_blocks.get();

        Self {
            block_size: raw.block_size.get(),
            total_blocks,
            device_size: raw.device_size.get(),
            checksum_size: CRC_SIZE as u32,
            blocks_per_checksum: 1,
            head_size: V1_HEADER_SIZE as u64 + total_blocks + BITMAP_MAGIC.len() as u64,
        }
    }

    pub(crate) fn from_v2(raw: &V2HeaderRaw) -> Self {
        let total_blocks = raw.total_blocks.get();

        Self {
            block_size: raw.block_size.get(),
            total_blocks,
            device_size: raw.device_size.get(),
            checksum_size: raw.checksum_size.get(),
            blocks_per_checksum: raw.blocks_per_checksum.get(),
            head_size: V2_HEADER_SIZE as u64 + total_blocks.div_ceil(8) + CRC_SIZE as u64,
        }
    }

    /// Bytes in the V2 packed bitmap.
    pub(crate) fn bitmap_size(&self) -> u64 {
        self.total_blocks.div_ceil(8)
    }

    /// Byte offset of the `n`-th *stored* block, accounting for the
    /// checksums interleaved after every `blocks_per_checksum` blocks.
    pub(crate) fn stored_block_offset(&self, n: u64) -> u64 {
        let mut offset = self.head_size + n * u64::from(self.block_size);

        if self.blocks_per_checksum > 0 {
            offset += (n / u64::from(self.blocks_per_checksum)) * u64::from(self.checksum_size);
        }

        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_sizes_are_fixed() {
        assert_eq!(V1_HEADER_SIZE, 40);
        assert_eq!(V2_HEADER_SIZE, 48);
        assert_eq!(OUTER_HEADER_SIZE, 20);
    }

    #[test]
    fn v1_offsets_interleave_one_crc_per_block() {
        let raw = V1HeaderRaw {
            magic: *IMAGE_MAGIC,
            version: *b"0001",
            block_size: U32::new(4096),
            total_blocks: U64::new(8),
            device_size: U64::new(0),
        };
        let header = ImageHeader::from_v1(&raw);

        assert_eq!(header.head_size, 40 + 8 + 8);
        assert_eq!(header.stored_block_offset(0), header.head_size);
        // Each stored block is followed by its 4-byte check value.
        assert_eq!(header.stored_block_offset(1), header.head_size + 4096 + 4);
        assert_eq!(header.stored_block_offset(3), header.head_size + 3 * (4096 + 4));
    }

    #[test]
    fn v2_offsets_respect_checksum_groups() {
        let raw = V2HeaderRaw {
            magic: *IMAGE_MAGIC,
            version: *b"0002",
            block_size: U32::new(512),
            total_blocks: U64::new(17),
            device_size: U64::new(0),
            checksum_size: U32::new(4),
            blocks_per_checksum: U32::new(4),
        };
        let header = ImageHeader::from_v2(&raw);

        assert_eq!(header.bitmap_size(), 3);
        assert_eq!(header.head_size, 48 + 3 + 4);
        assert_eq!(header.stored_block_offset(3), header.head_size + 3 * 512);
        // Block 4 sits past the first checksum group.
        assert_eq!(header.stored_block_offset(4), header.head_size + 4 * 512 + 4);
        assert_eq!(header.stored_block_offset(9), header.head_size + 9 * 512 + 2 * 4);
    }

    #[test]
    fn zero_blocks_per_checksum_means_no_checksum_region() {
        let raw = V2HeaderRaw {
            magic: *IMAGE_MAGIC,
            version: *b"0002",
            block_size: U32::new(512),
            total_blocks: U64::new(8),
            device_size: U64::new(0),
            checksum_size: U32::new(4),
            blocks_per_checksum: U32::new(0),
        };
        let header = ImageHeader::from_v2(&raw);

        assert_eq!(header.stored_block_offset(5), header.head_size + 5 * 512);
    }
}
