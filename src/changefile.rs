//! Change-file overlay: a sidecar capturing block writes so the base image
//! is never modified.
//!
//! The sidecar layout is self-describing:
//!
//! - Header (40 bytes)
//! - Block table: one little-endian u64 per logical block, holding the
//!   absolute byte offset of that block's stored data, or 0 when the block
//!   has never been written here.
//! - Data area: block-size slabs appended as blocks are first written.
//!
//! The engine consults the overlay before the base image on every read, so
//! a written block permanently shadows whatever the image stores for it.

use std::io;
use std::path::Path;

use snafu::{ResultExt, Snafu, ensure};
use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::backend::{Backend, BackendFile, OpenMode};

const CF_MAGIC: &[u8; 8] = b"ChAnGeFi";
const CF_VERSION: u32 = 1;
const CF_HEADER_SIZE: usize = size_of::<CfHeaderRaw>();

/// Streaming buffer size for loading the block table.
const TABLE_CHUNK: usize = 64 * 1024;

#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct CfHeaderRaw {
    /// 0x00: "ChAnGeFi"
    magic: [u8; 8],
    /// 0x08: Format version (1).
    version: U32,
    /// 0x0C: Header size in bytes.
    header_size: U32,
    /// 0x10: Block size; must match the image.
    block_size: U32,
    /// 0x14: Reserved.
    reserved: U32,
    /// 0x18: Number of logical blocks; must match the image.
    total_blocks: U64,
    /// 0x20: Byte offset where data slabs begin.
    data_offset: U64,
}

/// Errors raised by the change-file overlay.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ChangeFileError {
    #[snafu(display("i/o failed"))]
    Io { source: io::Error },

    #[snafu(display("invalid change file: {reason}"))]
    InvalidFormat { reason: &'static str },

    #[snafu(display(
        "change file geometry ({cf_block_size} x {cf_total_blocks}) does not match \
         the image ({block_size} x {total_blocks})"
    ))]
    GeometryMismatch {
        cf_block_size: u32,
        cf_total_blocks: u64,
        block_size: u32,
        total_blocks: u64,
    },

    #[snafu(display("block table does not fit in memory"))]
    TableTooLarge,

    #[snafu(display("block {block} out of range ({total_blocks} blocks)"))]
    OutOfRange { block: u64, total_blocks: u64 },

    #[snafu(display("integer overflow while computing byte offsets"))]
    OffsetOverflow,
}

/// An open change-file overlay.
///
/// All block addressing is positional; the image context owns the only
/// cursor.
#[derive(Debug)]
pub struct ChangeFile<F> {
    file: F,
    block_size: u32,
    total_blocks: u64,
    data_offset: u64,
    /// In-memory copy of the block table. 0 = no override.
    table: Vec<u64>,
    /// Slabs currently in the data area; the next allocation appends.
    allocated: u64,
}

impl<F: BackendFile> ChangeFile<F> {
    /// Creates a fresh overlay at `path`, dimensioned for an image with
    /// `total_blocks` blocks of `block_size` bytes each.
    pub fn create<B: Backend<File = F>>(
        backend: &B,
        path: &Path,
        block_size: u32,
        total_blocks: u64,
    ) -> Result<Self, ChangeFileError> {
        let (data_offset, entries) = layout(total_blocks)?;

        let mut file = backend
            .open(path, OpenMode::ReadWriteCreate)
            .context(IoSnafu)?;

        // Drop any stale content, then zero the table region in one go.
        file.set_len(0).context(IoSnafu)?;
        file.set_len(data_offset).context(IoSnafu)?;

        let header = CfHeaderRaw {
            magic: *CF_MAGIC,
            version: U32::new(CF_VERSION),
            header_size: U32::new(CF_HEADER_SIZE as u32),
            block_size: U32::new(block_size),
            reserved: U32::new(0),
            total_blocks: U64::new(total_blocks),
            data_offset: U64::new(data_offset),
        };
        file.write_at(0, header.as_bytes()).context(IoSnafu)?;

        let mut table = Vec::new();
        table
            .try_reserve_exact(entries)
            .map_err(|_| ChangeFileError::TableTooLarge)?;
        table.resize(entries, 0);

        Ok(Self {
            file,
            block_size,
            total_blocks,
            data_offset,
            table,
            allocated: 0,
        })
    }

    /// Opens an existing overlay at `path` and checks that it belongs to an
    /// image with the given geometry.
    pub fn open<B: Backend<File = F>>(
        backend: &B,
        path: &Path,
        block_size: u32,
        total_blocks: u64,
    ) -> Result<Self, ChangeFileError> {
        let mut file = backend.open(path, OpenMode::ReadWrite).context(IoSnafu)?;

        let mut header_bytes = [0u8; CF_HEADER_SIZE];
        file.read_at(0, &mut header_bytes).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                ChangeFileError::InvalidFormat {
                    reason: "truncated header",
                }
            } else {
                ChangeFileError::Io { source: e }
            }
        })?;
        let header = CfHeaderRaw::read_from_bytes(&header_bytes)
            .expect("header buffer is correctly sized");

        ensure!(
            &header.magic == CF_MAGIC,
            InvalidFormatSnafu { reason: "bad magic" }
        );
        ensure!(
            header.version.get() == CF_VERSION,
            InvalidFormatSnafu {
                reason: "unsupported version"
            }
        );
        ensure!(
            header.header_size.get() as usize == CF_HEADER_SIZE,
            InvalidFormatSnafu {
                reason: "unexpected header size"
            }
        );
        ensure!(
            header.reserved.get() == 0,
            InvalidFormatSnafu {
                reason: "reserved field set"
            }
        );
        ensure!(
            header.block_size.get() == block_size && header.total_blocks.get() == total_blocks,
            GeometryMismatchSnafu {
                cf_block_size: header.block_size.get(),
                cf_total_blocks: header.total_blocks.get(),
                block_size,
                total_blocks,
            }
        );

        let (data_offset, entries) = layout(total_blocks)?;
        ensure!(
            header.data_offset.get() == data_offset,
            InvalidFormatSnafu {
                reason: "unexpected data offset"
            }
        );

        // Stream the block table in; a truncated file fails here rather
        // than during some later read.
        let mut table = Vec::new();
        table
            .try_reserve_exact(entries)
            .map_err(|_| ChangeFileError::TableTooLarge)?;

        let mut buf = vec![0u8; TABLE_CHUNK];
        let mut offset = CF_HEADER_SIZE as u64;
        let mut remaining = entries * 8;
        while remaining > 0 {
            let read_len = remaining.min(buf.len());
            file.read_at(offset, &mut buf[..read_len]).map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    ChangeFileError::InvalidFormat {
                        reason: "truncated block table",
                    }
                } else {
                    ChangeFileError::Io { source: e }
                }
            })?;
            for chunk in buf[..read_len].chunks_exact(8) {
                table.push(u64::from_le_bytes(
                    chunk.try_into().expect("chunks are 8 bytes"),
                ));
            }
            offset += read_len as u64;
            remaining -= read_len;
        }

        let file_len = file.len().context(IoSnafu)?;
        let allocated = file_len.saturating_sub(data_offset) / u64::from(block_size.max(1));

        Ok(Self {
            file,
            block_size,
            total_blocks,
            data_offset,
            table,
            allocated,
        })
    }

    /// Validates the on-disk structure: every table entry must point at a
    /// distinct, slab-aligned offset inside the data area.
    pub fn verify(&mut self) -> Result<(), ChangeFileError> {
        let file_len = self.file.len().context(IoSnafu)?;
        ensure!(
            file_len >= self.data_offset,
            InvalidFormatSnafu {
                reason: "data region out of bounds"
            }
        );

        let block_size = u64::from(self.block_size);
        ensure!(
            block_size > 0,
            InvalidFormatSnafu {
                reason: "zero block size"
            }
        );

        let slab_area = file_len - self.data_offset;
        ensure!(
            slab_area % block_size == 0,
            InvalidFormatSnafu {
                reason: "data area is not a whole number of blocks"
            }
        );

        let slabs = slab_area / block_size;
        let slabs_usize =
            usize::try_from(slabs).map_err(|_| ChangeFileError::TableTooLarge)?;
        let mut seen = Vec::new();
        seen.try_reserve_exact(slabs_usize)
            .map_err(|_| ChangeFileError::TableTooLarge)?;
        seen.resize(slabs_usize, false);

        let mut referenced = 0u64;
        for &phys in &self.table {
            if phys == 0 {
                continue;
            }

            ensure!(
                phys >= self.data_offset,
                InvalidFormatSnafu {
                    reason: "block offset before data region"
                }
            );
            let rel = phys - self.data_offset;
            ensure!(
                rel % block_size == 0,
                InvalidFormatSnafu {
                    reason: "misaligned block offset"
                }
            );
            let slab = rel / block_size;
            ensure!(
                slab < slabs,
                InvalidFormatSnafu {
                    reason: "block offset out of bounds"
                }
            );
            let slab = slab as usize;
            ensure!(
                !seen[slab],
                InvalidFormatSnafu {
                    reason: "duplicate block offset"
                }
            );
            seen[slab] = true;
            referenced += 1;
        }

        ensure!(
            referenced == slabs,
            InvalidFormatSnafu {
                reason: "orphaned data blocks"
            }
        );

        self.allocated = slabs;
        Ok(())
    }

    /// Whether `block` has an override stored here.
    pub fn block_present(&self, block: u64) -> bool {
        usize::try_from(block)
            .ok()
            .and_then(|i| self.table.get(i))
            .is_some_and(|&phys| phys != 0)
    }

    /// Reads the override for `block` into `buf`.
    ///
    /// Returns `false` (leaving `buf` untouched) when the block has never
    /// been written here; the engine falls through to the base image.
    pub fn read_block(&mut self, block: u64, buf: &mut [u8]) -> Result<bool, ChangeFileError> {
        debug_assert_eq!(buf.len(), self.block_size as usize);

        let phys = self.table[self.index(block)?];
        if phys == 0 {
            return Ok(false);
        }

        self.file.read_at(phys, buf).context(IoSnafu)?;
        Ok(true)
    }

    /// Stores `buf` as the override for `block`, allocating a slab on the
    /// block's first write.
    pub fn write_block(&mut self, block: u64, buf: &[u8]) -> Result<(), ChangeFileError> {
        debug_assert_eq!(buf.len(), self.block_size as usize);

        let index = self.index(block)?;
        let phys = self.table[index];

        if phys != 0 {
            return self.file.write_at(phys, buf).context(IoSnafu);
        }

        let phys = self
            .allocated
            .checked_mul(u64::from(self.block_size))
            .and_then(|rel| self.data_offset.checked_add(rel))
            .ok_or(ChangeFileError::OffsetOverflow)?;

        // Slab first, table entry second: a crash in between leaves an
        // orphan slab, never a pointer to garbage.
        self.file.write_at(phys, buf).context(IoSnafu)?;
        let entry_offset = CF_HEADER_SIZE as u64 + index as u64 * 8;
        self.file
            .write_at(entry_offset, &phys.to_le_bytes())
            .context(IoSnafu)?;

        self.table[index] = phys;
        self.allocated += 1;
        Ok(())
    }

    /// Flushes pending writes to durable storage.
    pub fn sync(&mut self) -> Result<(), ChangeFileError> {
        self.file.flush().context(IoSnafu)
    }

    /// Flushes and closes the overlay.
    pub fn finish(mut self) -> Result<(), ChangeFileError> {
        self.sync()
    }

    fn index(&self, block: u64) -> Result<usize, ChangeFileError> {
        ensure!(
            block < self.total_blocks,
            OutOfRangeSnafu {
                block,
                total_blocks: self.total_blocks,
            }
        );
        usize::try_from(block).map_err(|_| ChangeFileError::TableTooLarge)
    }
}

/// Computes `(data_offset, table_entries)` for a given block count.
fn layout(total_blocks: u64) -> Result<(u64, usize), ChangeFileError> {
    let entries =
        usize::try_from(total_blocks).map_err(|_| ChangeFileError::TableTooLarge)?;
    let table_bytes = total_blocks
        .checked_mul(8)
        .ok_or(ChangeFileError::OffsetOverflow)?;
    let data_offset = (CF_HEADER_SIZE as u64)
        .checked_add(table_bytes)
        .ok_or(ChangeFileError::OffsetOverflow)?;

    Ok((data_offset, entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemBackend;

    const BLOCK_SIZE: u32 = 512;
    const TOTAL_BLOCKS: u64 = 16;

    fn block(fill: u8) -> Vec<u8> {
        vec![fill; BLOCK_SIZE as usize]
    }

    #[test]
    fn create_write_read_round_trip() {
        let backend = MemBackend::new();
        let mut cf =
            ChangeFile::create(&backend, Path::new("a.cf"), BLOCK_SIZE, TOTAL_BLOCKS).unwrap();

        let mut buf = block(0);
        assert!(!cf.read_block(3, &mut buf).unwrap());
        assert!(!cf.block_present(3));

        cf.write_block(3, &block(0xAB)).unwrap();
        assert!(cf.block_present(3));
        assert!(cf.read_block(3, &mut buf).unwrap());
        assert_eq!(buf, block(0xAB));

        // Rewrite reuses the slab.
        cf.write_block(3, &block(0xCD)).unwrap();
        assert!(cf.read_block(3, &mut buf).unwrap());
        assert_eq!(buf, block(0xCD));
        assert_eq!(cf.allocated, 1);
    }

    #[test]
    fn reopen_sees_persisted_overrides() {
        let backend = MemBackend::new();
        let path = Path::new("a.cf");

        let mut cf = ChangeFile::create(&backend, path, BLOCK_SIZE, TOTAL_BLOCKS).unwrap();
        cf.write_block(0, &block(0x11)).unwrap();
        cf.write_block(9, &block(0x22)).unwrap();
        cf.sync().unwrap();
        drop(cf);

        let mut cf = ChangeFile::open(&backend, path, BLOCK_SIZE, TOTAL_BLOCKS).unwrap();
        cf.verify().unwrap();

        let mut buf = block(0);
        assert!(cf.read_block(9, &mut buf).unwrap());
        assert_eq!(buf, block(0x22));
        assert!(!cf.read_block(1, &mut buf).unwrap());
    }

    #[test]
    fn open_rejects_mismatched_geometry() {
        let backend = MemBackend::new();
        let path = Path::new("a.cf");

        ChangeFile::create(&backend, path, BLOCK_SIZE, TOTAL_BLOCKS).unwrap();

        let err = ChangeFile::open(&backend, path, BLOCK_SIZE * 2, TOTAL_BLOCKS).unwrap_err();
        assert!(matches!(err, ChangeFileError::GeometryMismatch { .. }));
    }

    #[test]
    fn verify_rejects_out_of_bounds_table_entry() {
        let backend = MemBackend::new();
        let path = Path::new("a.cf");

        let mut cf = ChangeFile::create(&backend, path, BLOCK_SIZE, TOTAL_BLOCKS).unwrap();
        cf.write_block(2, &block(0x33)).unwrap();
        drop(cf);

        // Point block 2's table entry past the end of the file.
        let mut raw = backend.snapshot(path).unwrap();
        let entry = CF_HEADER_SIZE + 2 * 8;
        raw[entry..entry + 8].copy_from_slice(&(u64::MAX / 2).to_le_bytes());
        backend.insert(path, raw);

        let mut cf = ChangeFile::open(&backend, path, BLOCK_SIZE, TOTAL_BLOCKS).unwrap();
        assert!(matches!(
            cf.verify().unwrap_err(),
            ChangeFileError::InvalidFormat { .. }
        ));
    }

    #[test]
    fn writes_out_of_range_are_rejected() {
        let backend = MemBackend::new();
        let mut cf =
            ChangeFile::create(&backend, Path::new("a.cf"), BLOCK_SIZE, TOTAL_BLOCKS).unwrap();

        let err = cf.write_block(TOTAL_BLOCKS, &block(0)).unwrap_err();
        assert!(matches!(err, ChangeFileError::OutOfRange { .. }));
    }
}
