//! Property tests for block addressing: whatever the usage map and
//! checksum geometry, every logical block must read back as its stored
//! contents (used) or zeros (unused), by sweep or by random seek.

use proptest::prelude::*;

use partclone_image::{Image, MemBackend};

mod common;
use common::{build_v1, build_v2, pack_bits, stored_block};

fn expected_device(used: &[bool], block_size: usize) -> Vec<u8> {
    let mut device = vec![0u8; used.len() * block_size];
    let mut stored = 0usize;
    for (block, &bit) in used.iter().enumerate() {
        if bit {
            device[block * block_size..][..block_size]
                .copy_from_slice(&stored_block(stored, block_size));
            stored += 1;
        }
    }
    device
}

fn open_mem(raw: Vec<u8>) -> Image<MemBackend> {
    let backend = MemBackend::new();
    backend.insert("img", raw);
    let mut image = Image::open(backend, "img").unwrap();
    image.verify().unwrap();
    image
}

proptest! {
    #[test]
    fn v2_blocks_read_back_under_any_checksum_geometry(
        used in proptest::collection::vec(any::<bool>(), 1..64),
        checksum_size in 0u32..9,
        blocks_per_checksum in 0u32..5,
        seeks in proptest::collection::vec(any::<prop::sample::Index>(), 1..8),
    ) {
        const BLOCK_SIZE: usize = 128;

        let bitmap = pack_bits(&used);
        let mut image = open_mem(build_v2(
            BLOCK_SIZE as u32,
            used.len() as u64,
            &bitmap,
            checksum_size,
            blocks_per_checksum,
        ));
        let expected = expected_device(&used, BLOCK_SIZE);

        // Full sequential sweep.
        let mut buf = vec![0u8; expected.len()];
        image.seek(0).unwrap();
        image.read_blocks(&mut buf).unwrap();
        prop_assert_eq!(&buf, &expected);

        // Random single-block seeks must agree with the sweep.
        let mut one = vec![0u8; BLOCK_SIZE];
        for index in seeks {
            let block = index.index(used.len());
            image.seek(block as u64).unwrap();
            image.read_blocks(&mut one).unwrap();
            prop_assert_eq!(&one, &expected[block * BLOCK_SIZE..][..BLOCK_SIZE]);
        }
    }

    #[test]
    fn v1_blocks_read_back_with_anomalous_map_bytes(
        map in proptest::collection::vec(0u8..3, 1..64),
        start in any::<prop::sample::Index>(),
    ) {
        const BLOCK_SIZE: usize = 128;

        let mut image = open_mem(build_v1(BLOCK_SIZE as u32, &map, 0));
        // Map bytes other than 1 (including the anomalous value 2) read
        // as unused.
        let used: Vec<bool> = map.iter().map(|&b| b == 1).collect();
        let expected = expected_device(&used, BLOCK_SIZE);

        // Sweep from an arbitrary starting block to the end.
        let start = start.index(map.len());
        let mut buf = vec![0u8; (map.len() - start) * BLOCK_SIZE];
        image.seek(start as u64).unwrap();
        image.read_blocks(&mut buf).unwrap();
        prop_assert_eq!(&buf, &expected[start * BLOCK_SIZE..]);
    }
}
