// SPDX-License-Identifier: Apache-2.0
// Copyright 2023-2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! On-storage format of the meta tree's nodes.
//!
//! A node block is an array of [`TREE_MAX_DEGREE`] fixed size records of
//! [`NODE_RECORD_SIZE`] bytes each, all little-endian. Inner nodes store
//! [`Type1Node`] child descriptors, leaf nodes store [`Type2Node`] entries
//! describing one physical block each. A record is valid if and only if it is
//! not all-zeroes.

use core::{convert, fmt};

/// Size of a node block, the unit of IO.
pub const BLOCK_SIZE: usize = 4096;

/// Size of a [`BlockHash`].
pub const HASH_SIZE: usize = 32;

/// Size of a single encoded [`NodeRecord`].
pub const NODE_RECORD_SIZE: usize = 64;

/// Maximum number of records in a node block.
pub const TREE_MAX_DEGREE: usize = BLOCK_SIZE / NODE_RECORD_SIZE;

/// Maximum tree height supported, counting the leaf level.
pub const TREE_MAX_LEVEL: u32 = 6;

/// Level of the leaf nodes, whose records are [`Type2Node`]s.
pub const LEAF_LEVEL: u32 = 1;

/// Lowest level made of inner nodes with [`Type1Node`] records.
pub const LOWEST_INNER_LEVEL: u32 = 2;

/// Physical block address on the backing [`NvChip`](crate::chip::NvChip).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysicalBlockAddress {
    pba: u64,
}

impl PhysicalBlockAddress {
    pub const INVALID: Self = Self { pba: u64::MAX };

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl convert::From<u64> for PhysicalBlockAddress {
    fn from(value: u64) -> Self {
        Self { pba: value }
    }
}

impl convert::From<PhysicalBlockAddress> for u64 {
    fn from(value: PhysicalBlockAddress) -> Self {
        value.pba
    }
}

impl fmt::Debug for PhysicalBlockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.pba)
        } else {
            f.write_str("INVALID")
        }
    }
}

impl fmt::Display for PhysicalBlockAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Version counter of the block store.
///
/// A node or record stamped with the current generation has been written (or
/// allocated) within the ongoing generation and may be modified in place.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug)]
pub struct Generation {
    generation: u64,
}

impl Generation {
    pub const INVALID: Self = Self { generation: 0 };
}

impl convert::From<u64> for Generation {
    fn from(value: u64) -> Self {
        Self { generation: value }
    }
}

impl convert::From<Generation> for u64 {
    fn from(value: Generation) -> Self {
        value.generation
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.generation)
    }
}

/// Digest over a node block's full contents.
pub type BlockHash = [u8; HASH_SIZE];

/// Common interface of the fixed size records stored in node blocks.
pub trait NodeRecord: Copy + Default + fmt::Debug {
    /// Decode from a [`NODE_RECORD_SIZE`] sized slice.
    fn decode(src: &[u8]) -> Self;

    /// Encode into a [`NODE_RECORD_SIZE`] sized slice.
    fn encode(&self, dst: &mut [u8]);

    /// Whether the record is in use.
    fn is_valid(&self) -> bool;
}

fn read_u64_le(src: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&src[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn read_u32_le(src: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&src[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

/// Descriptor of a child node, stored in inner nodes and used for the root.
///
/// Encoded as `pba: u64`, `gen: u64`, `hash: [u8; 32]`, followed by 16 bytes of
/// padding.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Type1Node {
    pub pba: PhysicalBlockAddress,
    pub generation: Generation,
    pub hash: BlockHash,
}

impl Type1Node {
    pub fn new(pba: PhysicalBlockAddress, generation: Generation, hash: BlockHash) -> Self {
        Self { pba, generation, hash }
    }
}

impl NodeRecord for Type1Node {
    fn decode(src: &[u8]) -> Self {
        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&src[16..16 + HASH_SIZE]);
        Self {
            pba: PhysicalBlockAddress::from(read_u64_le(src, 0)),
            generation: Generation::from(read_u64_le(src, 8)),
            hash,
        }
    }

    fn encode(&self, dst: &mut [u8]) {
        dst[..NODE_RECORD_SIZE].fill(0);
        dst[0..8].copy_from_slice(&u64::from(self.pba).to_le_bytes());
        dst[8..16].copy_from_slice(&u64::from(self.generation).to_le_bytes());
        dst[16..16 + HASH_SIZE].copy_from_slice(&self.hash);
    }

    fn is_valid(&self) -> bool {
        *self != Self::default()
    }
}

/// Leaf entry describing one physical block of the pool.
///
/// Encoded as `pba: u64`, `last_vba: u64`, `alloc_gen: u64`, `free_gen: u64`,
/// `last_key_id: u32`, `reserved: u8`, followed by 27 bytes of padding.
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Type2Node {
    pub pba: PhysicalBlockAddress,
    pub last_vba: u64,
    pub alloc_gen: Generation,
    pub free_gen: Generation,
    pub last_key_id: u32,
    pub reserved: bool,
}

impl Type2Node {
    /// Whether the entry's block may be handed out within `current_gen`.
    pub fn is_usable(&self, current_gen: Generation) -> bool {
        self.is_valid() && self.alloc_gen != current_gen
    }

    /// Swap in the block being given up in return for the harvested one.
    ///
    /// Returns the harvested block's address. `last_vba` and `last_key_id`
    /// are retained.
    pub fn exchange(
        &mut self,
        pba: PhysicalBlockAddress,
        current_gen: Generation,
        reserved: bool,
    ) -> PhysicalBlockAddress {
        let harvested_pba = self.pba;
        self.pba = pba;
        self.alloc_gen = current_gen;
        self.free_gen = current_gen;
        self.reserved = reserved;
        harvested_pba
    }
}

impl NodeRecord for Type2Node {
    fn decode(src: &[u8]) -> Self {
        Self {
            pba: PhysicalBlockAddress::from(read_u64_le(src, 0)),
            last_vba: read_u64_le(src, 8),
            alloc_gen: Generation::from(read_u64_le(src, 16)),
            free_gen: Generation::from(read_u64_le(src, 24)),
            last_key_id: read_u32_le(src, 32),
            reserved: src[36] != 0,
        }
    }

    fn encode(&self, dst: &mut [u8]) {
        dst[..NODE_RECORD_SIZE].fill(0);
        dst[0..8].copy_from_slice(&u64::from(self.pba).to_le_bytes());
        dst[8..16].copy_from_slice(&self.last_vba.to_le_bytes());
        dst[16..24].copy_from_slice(&u64::from(self.alloc_gen).to_le_bytes());
        dst[24..32].copy_from_slice(&u64::from(self.free_gen).to_le_bytes());
        dst[32..36].copy_from_slice(&self.last_key_id.to_le_bytes());
        dst[36] = self.reserved as u8;
    }

    fn is_valid(&self) -> bool {
        *self != Self::default()
    }
}

/// Decode a node block into its records.
///
/// At most `records.len()` records get decoded, `block` must have room for
/// all of them.
pub fn decode_node_block<R: NodeRecord>(block: &[u8], records: &mut [R]) {
    for (record, src) in records.iter_mut().zip(block.chunks_exact(NODE_RECORD_SIZE)) {
        *record = R::decode(src);
    }
}

/// Encode records into a node block.
///
/// Any trailing block space not covered by `records` gets zeroed, i.e. reads
/// back as invalid records.
pub fn encode_node_block<R: NodeRecord>(records: &[R], block: &mut [u8]) {
    let records_size = records.len() * NODE_RECORD_SIZE;
    for (record, dst) in records.iter().zip(block.chunks_exact_mut(NODE_RECORD_SIZE)) {
        record.encode(dst);
    }
    let padding_start = records_size.min(block.len());
    block[padding_start..].fill(0);
}

#[test]
fn test_type1_node_layout() {
    let node = Type1Node::new(PhysicalBlockAddress::from(0x0102u64), Generation::from(7u64), [0xeeu8; HASH_SIZE]);
    let mut buf = [0xffu8; NODE_RECORD_SIZE];
    node.encode(&mut buf);
    assert_eq!(&buf[0..8], &[0x02, 0x01, 0, 0, 0, 0, 0, 0]);
    assert_eq!(&buf[8..16], &[7, 0, 0, 0, 0, 0, 0, 0]);
    assert!(buf[16..48].iter().all(|b| *b == 0xee));
    assert!(buf[48..].iter().all(|b| *b == 0));
    assert_eq!(Type1Node::decode(&buf), node);
    assert!(node.is_valid());
    assert!(!Type1Node::decode(&[0u8; NODE_RECORD_SIZE]).is_valid());
}

#[test]
fn test_type2_node_layout() {
    let node = Type2Node {
        pba: PhysicalBlockAddress::from(500u64),
        last_vba: 0x11,
        alloc_gen: Generation::from(3u64),
        free_gen: Generation::from(4u64),
        last_key_id: 0x0a0b0c0d,
        reserved: true,
    };
    let mut buf = [0xffu8; NODE_RECORD_SIZE];
    node.encode(&mut buf);
    assert_eq!(&buf[0..8], &500u64.to_le_bytes());
    assert_eq!(&buf[32..36], &[0x0d, 0x0c, 0x0b, 0x0a]);
    assert_eq!(buf[36], 1);
    assert!(buf[37..].iter().all(|b| *b == 0));
    assert_eq!(Type2Node::decode(&buf), node);

    // Any single non-zero byte makes a record valid.
    let mut buf = [0u8; NODE_RECORD_SIZE];
    assert!(!Type2Node::decode(&buf).is_valid());
    buf[36] = 1;
    assert!(Type2Node::decode(&buf).is_valid());
}

#[test]
fn test_type2_node_exchange() {
    let current_gen = Generation::from(5u64);
    let mut node = Type2Node {
        pba: PhysicalBlockAddress::from(500u64),
        last_vba: 42,
        alloc_gen: Generation::from(3u64),
        free_gen: Generation::from(3u64),
        last_key_id: 9,
        reserved: false,
    };
    assert!(node.is_usable(current_gen));
    let harvested = node.exchange(PhysicalBlockAddress::from(900u64), current_gen, true);
    assert_eq!(harvested, PhysicalBlockAddress::from(500u64));
    assert_eq!(node.pba, PhysicalBlockAddress::from(900u64));
    assert_eq!(node.alloc_gen, current_gen);
    assert_eq!(node.free_gen, current_gen);
    assert_eq!(node.last_vba, 42);
    assert_eq!(node.last_key_id, 9);
    assert!(node.reserved);
    assert!(!node.is_usable(current_gen));
    assert!(!Type2Node::default().is_usable(current_gen));
}

#[test]
fn test_node_block_codec_pads() {
    let records = [
        Type1Node::new(PhysicalBlockAddress::from(1u64), Generation::from(1u64), [1u8; HASH_SIZE]),
        Type1Node::new(PhysicalBlockAddress::from(2u64), Generation::from(2u64), [2u8; HASH_SIZE]),
    ];
    let mut block = [0x5au8; BLOCK_SIZE];
    encode_node_block(&records, &mut block);
    assert!(block[2 * NODE_RECORD_SIZE..].iter().all(|b| *b == 0));

    let mut decoded = [Type1Node::default(); TREE_MAX_DEGREE];
    decode_node_block(&block, &mut decoded);
    assert_eq!(&decoded[..2], &records);
    assert!(decoded[2..].iter().all(|r| !r.is_valid()));

    // Records not fitting into the block are dropped.
    let mut short_block = [0x5au8; NODE_RECORD_SIZE];
    encode_node_block(&records, &mut short_block);
    assert_eq!(Type1Node::decode(&short_block), records[0]);
}
