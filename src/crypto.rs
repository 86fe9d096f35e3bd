//! Hashing helpers for mining
//!
//! Double SHA-256 for headers, coinbase and cycles, merkle folding, and the
//! BLAKE2b key schedule handed to GPU solvers.

use crate::types::{Cycle, TARGET_WORDS};
use blake2::{Blake2b, Digest as _};
use blake2::digest::consts::U32;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use sha2::{Digest, Sha256};

type Blake2b256 = Blake2b<U32>;

/// SHA-256 applied twice
pub fn double_hash(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Fold a coinbase up a merkle path
///
/// The root starts as the double hash of the coinbase; every branch is
/// appended to the running root and the pair is double hashed again.
pub fn merkle_root(coinbase: &[u8], branches: &[[u8; 32]]) -> [u8; 32] {
    let mut root = double_hash(coinbase);
    let mut pair = [0u8; 64];
    for branch in branches {
        pair[..32].copy_from_slice(&root);
        pair[32..].copy_from_slice(branch);
        root = double_hash(&pair);
    }
    root
}

/// Merkle path for the first leaf of a block
///
/// `txids` are the hashes of every transaction after the coinbase, in block
/// order and internal byte order.
pub fn merkle_steps(txids: &[[u8; 32]]) -> Vec<[u8; 32]> {
    let mut steps = Vec::new();
    // `None` marks the coinbase slot whose hash is not known yet
    let mut level: Vec<Option<[u8; 32]>> = std::iter::once(None)
        .chain(txids.iter().copied().map(Some))
        .collect();

    while level.len() > 1 {
        if let Some(Some(sibling)) = level.get(1) {
            steps.push(*sibling);
        }
        if level.len() % 2 == 1 {
            let last = level[level.len() - 1];
            level.push(last);
        }

        let mut next = vec![None];
        let mut pair = [0u8; 64];
        for chunk in level[2..].chunks(2) {
            if let [Some(left), Some(right)] = chunk {
                pair[..32].copy_from_slice(left);
                pair[32..].copy_from_slice(right);
                next.push(Some(double_hash(&pair)));
            }
        }
        level = next;
    }

    steps
}

/// Serialize a cycle the way nodes do: compact-size length, then each edge
/// as little-endian u32
pub fn pack_cycle(cycle: &Cycle) -> Vec<u8> {
    let edges = cycle.edges();
    let mut packed = Vec::with_capacity(9 + edges.len() * 4);
    write_compact_size(&mut packed, edges.len() as u64);
    for edge in edges {
        // writes into a Vec cannot fail
        let _ = packed.write_u32::<LittleEndian>(*edge);
    }
    packed
}

/// Double hash of the packed cycle, as target-comparable words
pub fn cycle_hash(cycle: &Cycle) -> [u32; TARGET_WORDS] {
    hash_words(&double_hash(&pack_cycle(cycle)))
}

/// Read a 32-byte digest as eight little-endian words
pub fn hash_words(hash: &[u8; 32]) -> [u32; TARGET_WORDS] {
    let mut words = [0u32; TARGET_WORDS];
    LittleEndian::read_u32_into(hash, &mut words);
    words
}

/// Derive the 128-bit key used by device solvers from a header hash
pub fn derive_device_keys(header_hash_hex: &str) -> (u64, u64) {
    let digest = Blake2b256::digest(header_hash_hex.as_bytes());
    (
        LittleEndian::read_u64(&digest[0..8]),
        LittleEndian::read_u64(&digest[8..16]),
    )
}

fn write_compact_size(out: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xFC => out.push(n as u8),
        0xFD..=0xFFFF => {
            out.push(0xFD);
            let _ = out.write_u16::<LittleEndian>(n as u16);
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.push(0xFE);
            let _ = out.write_u32::<LittleEndian>(n as u32);
        }
        _ => {
            out.push(0xFF);
            let _ = out.write_u64::<LittleEndian>(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_hash_known_vector() {
        // sha256d("hello")
        assert_eq!(
            hex::encode(double_hash(b"hello")),
            "9595c9df90075148eb06860365df33584b75bff782a510c6cd4883a419833d50"
        );
    }

    #[test]
    fn test_merkle_root_without_branches() {
        let coinbase = b"coinbase transaction bytes";
        assert_eq!(merkle_root(coinbase, &[]), double_hash(coinbase));
    }

    #[test]
    fn test_merkle_root_folds_in_order() {
        let coinbase = b"cb";
        let a = [1u8; 32];
        let b = [2u8; 32];

        let mut pair = [0u8; 64];
        pair[..32].copy_from_slice(&double_hash(coinbase));
        pair[32..].copy_from_slice(&a);
        let after_a = double_hash(&pair);
        pair[..32].copy_from_slice(&after_a);
        pair[32..].copy_from_slice(&b);

        assert_eq!(merkle_root(coinbase, &[a, b]), double_hash(&pair));
        assert_ne!(merkle_root(coinbase, &[a, b]), merkle_root(coinbase, &[b, a]));
    }

    #[test]
    fn test_merkle_steps_reproduce_full_tree_root() {
        let coinbase = b"coinbase";
        let txids: Vec<[u8; 32]> = (1..=4u8).map(|i| [i; 32]).collect();

        // full tree over [cb, t1, t2, t3, t4] with odd-level duplication
        let pair_hash = |l: &[u8; 32], r: &[u8; 32]| {
            let mut pair = [0u8; 64];
            pair[..32].copy_from_slice(l);
            pair[32..].copy_from_slice(r);
            double_hash(&pair)
        };
        let cb = double_hash(coinbase);
        let l1 = [
            pair_hash(&cb, &txids[0]),
            pair_hash(&txids[1], &txids[2]),
            pair_hash(&txids[3], &txids[3]),
        ];
        let l2 = [pair_hash(&l1[0], &l1[1]), pair_hash(&l1[2], &l1[2])];
        let root = pair_hash(&l2[0], &l2[1]);

        let steps = merkle_steps(&txids);
        assert_eq!(steps.len(), 3);
        assert_eq!(merkle_root(coinbase, &steps), root);
    }

    #[test]
    fn test_merkle_steps_empty_block() {
        assert!(merkle_steps(&[]).is_empty());
    }

    #[test]
    fn test_pack_cycle_layout() {
        let cycle = Cycle::new(vec![1, 0x0203_0405]);
        assert_eq!(pack_cycle(&cycle), vec![2, 1, 0, 0, 0, 5, 4, 3, 2]);
    }

    #[test]
    fn test_hash_words_little_endian() {
        let mut hash = [0u8; 32];
        hash[28..].copy_from_slice(&[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(hash_words(&hash)[7], 0x1234_5678);
    }

    #[test]
    fn test_device_keys_deterministic() {
        let a = derive_device_keys("00ff");
        assert_eq!(a, derive_device_keys("00ff"));
        assert_ne!(a, derive_device_keys("00fe"));
    }
}
