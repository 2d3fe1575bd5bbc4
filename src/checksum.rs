//! CRC-32 flavours used by the image formats.
//!
//! V2 images protect the packed usage bitmap with a standard IEEE CRC-32.
//! V1 images carry per-block check values produced by a historically buggy
//! routine (see [`BlockCrc`]); reproducing that walk bit-for-bit is required
//! to match check values in images that exist in the wild.

/// Standard IEEE CRC-32 (reflected, init and xor-out `0xFFFFFFFF`) over `buf`.
///
/// This is the value stored little-endian after a V2 usage bitmap.
#[must_use]
pub fn ieee_crc32(buf: &[u8]) -> u32 {
    crc32fast::hash(buf)
}

/// Accumulator for V1 per-block check values.
///
/// The imaging tool that defined the V1 format folds the buffer's *first*
/// byte into the register once per buffer byte; the remaining bytes are
/// never visited. The quirk is part of the format: a proper CRC over the
/// buffer would not match any existing image.
pub struct BlockCrc {
    table: [u32; 256],
}

impl BlockCrc {
    /// Initial register value.
    pub const SEED: u32 = 0xFFFF_FFFF;

    #[must_use]
    pub fn new() -> Self {
        // Standard reflected CRC-32 table, polynomial 0xEDB88320.
        let mut table = [0u32; 256];

        for (i, entry) in table.iter_mut().enumerate() {
            let mut crc = i as u32;
            for _ in 0..8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
            }
            *entry = crc;
        }

        Self { table }
    }

    /// Folds `buf` into `crc`, first byte only, `buf.len()` times.
    #[must_use]
    pub fn update(&self, mut crc: u32, buf: &[u8]) -> u32 {
        for _ in 0..buf.len() {
            let c = u32::from(buf[0]);
            crc = (crc >> 8) ^ self.table[((crc ^ c) & 0xff) as usize];
        }

        crc
    }
}

impl Default for BlockCrc {
    fn default() -> Self {
        Self::new()
    }
}
