// SPDX-License-Identifier: Apache-2.0
// Copyright 2023-2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Node block authentication.

use super::layout::{BLOCK_SIZE, BlockHash, HASH_SIZE};
use digest::Digest as _;
use subtle::ConstantTimeEq as _;

/// Digest primitive node blocks get authenticated with.
///
/// The hash stored in a [`Type1Node`](super::layout::Type1Node) descriptor
/// covers the full contents of the block it refers to.
pub trait BlockHasher {
    /// Compute the hash over `block`.
    fn calc_hash(&self, block: &[u8]) -> BlockHash;

    /// Verify `block` against an `expected` hash.
    ///
    /// The comparison is done in constant time.
    fn check_hash(&self, block: &[u8], expected: &BlockHash) -> bool {
        if block.len() != BLOCK_SIZE {
            return false;
        }
        let hash = self.calc_hash(block);
        bool::from(hash[..].ct_eq(&expected[..]))
    }
}

/// SHA-256 [`BlockHasher`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Sha256BlockHasher;

impl BlockHasher for Sha256BlockHasher {
    fn calc_hash(&self, block: &[u8]) -> BlockHash {
        let digest = sha2::Sha256::digest(block);
        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&digest);
        hash
    }
}

#[test]
fn test_sha256_block_hasher() {
    let hasher = Sha256BlockHasher;
    let mut block = [0u8; BLOCK_SIZE];
    block[17] = 0x42;
    let hash = hasher.calc_hash(&block);
    assert!(hasher.check_hash(&block, &hash));

    let mut tampered = block;
    tampered[BLOCK_SIZE - 1] ^= 1;
    assert_ne!(hasher.calc_hash(&tampered), hash);
    assert!(!hasher.check_hash(&tampered, &hash));

    assert!(!hasher.check_hash(&block[..BLOCK_SIZE - 1], &hash));
}

#[test]
fn test_sha256_block_hasher_known_answer() {
    // SHA-256("abc").
    let expected: BlockHash = [
        0xba, 0x78, 0x16, 0xbf, 0x8f, 0x01, 0xcf, 0xea, 0x41, 0x41, 0x40, 0xde, 0x5d, 0xae, 0x22, 0x23, 0xb0, 0x03,
        0x61, 0xa3, 0x96, 0x17, 0x7a, 0x9c, 0xb4, 0x10, 0xff, 0x61, 0xf2, 0x00, 0x15, 0xad,
    ];
    assert_eq!(Sha256BlockHasher.calc_hash(b"abc"), expected);
}
