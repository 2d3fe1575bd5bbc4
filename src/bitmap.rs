use std::collections::TryReserveError;

/// One prefix-sum entry per `2^10` = 1024 blocks.
pub(crate) const DEFAULT_STRIDE_FACTOR: u32 = 10;

/// Dense per-block usage map with a sparse prefix-sum index.
///
/// One byte per logical block: `1` means the block's contents are stored in
/// the image, anything else means reads return zeros. Images in the wild
/// contain map bytes other than 0 or 1 with no documented meaning; they are
/// treated as *not used* and counted so callers can be told about them.
///
/// `sum_count[k]` holds the number of used blocks before block
/// `k << factor`, so converting a block number into its stored-block index
/// costs one lookup plus a walk of at most `2^factor - 1` map bytes.
pub(crate) struct UsageMap {
    map: Vec<u8>,
    sum_count: Vec<u64>,
    factor: u32,
    anomalous: u64,
}

impl UsageMap {
    /// Builds the prefix-sum index over a dense byte map.
    pub(crate) fn build(map: Vec<u8>, factor: u32) -> Result<Self, TryReserveError> {
        let entries = (map.len() >> factor) + 1;
        let mut sum_count = Vec::new();
        sum_count.try_reserve_exact(entries)?;

        let stride_mask = (1usize << factor) - 1;
        let mut nset = 0u64;
        let mut anomalous = 0u64;

        for (i, &byte) in map.iter().enumerate() {
            if i & stride_mask == 0 {
                sum_count.push(nset);
            }
            if byte == 1 {
                nset += 1;
            } else if byte != 0 {
                anomalous += 1;
            }
        }

        // Entries past the last stride boundary (reachable via a seek to
        // the end-of-image position) hold the full count.
        while sum_count.len() < entries {
            sum_count.push(nset);
        }

        Ok(Self {
            map,
            sum_count,
            factor,
            anomalous,
        })
    }

    /// Whether `block`'s contents are stored in the image. Strictly the
    /// byte value 1; anomalous bytes read as unused.
    pub(crate) fn is_used(&self, block: u64) -> bool {
        self.map[block as usize] == 1
    }

    /// Number of map bytes that were neither 0 nor 1.
    pub(crate) fn anomalous_bytes(&self) -> u64 {
        self.anomalous
    }

    /// Number of used blocks strictly before `block`.
    ///
    /// `block` may equal the total block count.
    pub(crate) fn count_before(&self, block: u64) -> u64 {
        let mut count = self.sum_count[(block >> self.factor) as usize];
        let stride_start = block & !((1u64 << self.factor) - 1);

        for b in stride_start..block {
            if self.map[b as usize] == 1 {
                count += 1;
            }
        }

        count
    }
}

/// Expands an LSB-first packed bitmap into a dense byte map.
pub(crate) fn expand_bits(bits: &[u8], total_blocks: usize) -> Result<Vec<u8>, TryReserveError> {
    let mut map = Vec::new();
    map.try_reserve_exact(total_blocks)?;

    for i in 0..total_blocks {
        map.push((bits[i >> 3] >> (i & 7)) & 1);
    }

    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_sums_match_full_count_at_every_stride_boundary() {
        // factor 2 => stride 4, so a 17-block map exercises the tail entry.
        let map: Vec<u8> = vec![1, 0, 1, 1, 0, 0, 1, 0, 1, 1, 1, 0, 0, 1, 0, 1, 1];
        let usage = UsageMap::build(map.clone(), 2).unwrap();

        for k in 0..=(map.len() >> 2) {
            let boundary = k << 2;
            let expected = map[..boundary].iter().filter(|&&b| b == 1).count() as u64;
            assert_eq!(usage.count_before(boundary as u64), expected, "boundary {boundary}");
        }
    }

    #[test]
    fn count_before_every_position() {
        let map: Vec<u8> = vec![0, 1, 1, 0, 1, 0, 0, 1, 1];
        let usage = UsageMap::build(map.clone(), 2).unwrap();

        for b in 0..=map.len() {
            let expected = map[..b].iter().filter(|&&v| v == 1).count() as u64;
            assert_eq!(usage.count_before(b as u64), expected, "block {b}");
        }
    }

    #[test]
    fn bytes_other_than_one_are_unused_and_counted() {
        let usage = UsageMap::build(vec![1, 2, 0, 0xff, 1], 2).unwrap();

        assert!(usage.is_used(0));
        assert!(!usage.is_used(1));
        assert!(!usage.is_used(3));
        assert!(usage.is_used(4));
        assert_eq!(usage.anomalous_bytes(), 2);
        assert_eq!(usage.count_before(5), 2);
    }

    #[test]
    fn count_before_handles_exact_stride_multiples() {
        // 8 blocks, factor 2: the end-of-map position sits on a boundary
        // with no byte at its own index.
        let map = vec![1u8; 8];
        let usage = UsageMap::build(map, 2).unwrap();
        assert_eq!(usage.count_before(8), 8);
    }

    #[test]
    fn expand_bits_is_lsb_first() {
        let map = expand_bits(&[0b1011_0100, 0b0100_1011, 0b1], 17).unwrap();

        let expected: Vec<u8> = vec![
            0, 0, 1, 0, 1, 1, 0, 1, // 0b10110100
            1, 1, 0, 1, 0, 0, 1, 0, // 0b01001011
            1,
        ];
        assert_eq!(map, expected);
    }
}
