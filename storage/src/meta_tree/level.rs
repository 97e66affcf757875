// SPDX-License-Identifier: Apache-2.0
// Copyright 2023-2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Per-level walk state of a [`MetaTree`](super::MetaTree) channel.

use super::hash::BlockHasher;
use super::layout::{self, Generation, NodeRecord, TREE_MAX_DEGREE, Type1Node};

/// Processing state of one level's node during a walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub(super) enum LevelState {
    /// No node loaded at this level.
    #[default]
    Invalid,
    /// The node's block is to be read.
    Read,
    /// The node's block has been read and authenticated.
    ReadComplete,
    /// The node is to be written back.
    Write,
    /// The write-back has completed.
    WriteComplete,
    /// Processing of the node has completed without modifications.
    Complete,
}

/// The node currently being processed at one level, together with its
/// decoded records.
///
/// The same state machine drives inner levels with [`Type1Node`] records and
/// the leaf level with [`Type2Node`](layout::Type2Node) records.
#[derive(Clone)]
pub(super) struct LevelInfo<R: NodeRecord> {
    /// Descriptor of the node, as found in its parent.
    pub(super) node: Type1Node,
    pub(super) entries: [R; TREE_MAX_DEGREE],
    /// Next child to descend into, inner levels only.
    pub(super) index: usize,
    pub(super) state: LevelState,
    /// Records have been modified and the node must be written back.
    pub(super) dirty: bool,
    /// The node has been written within the current generation already and
    /// may be updated in place.
    pub(super) volatile: bool,
}

impl<R: NodeRecord> Default for LevelInfo<R> {
    fn default() -> Self {
        Self {
            node: Type1Node::default(),
            entries: [R::default(); TREE_MAX_DEGREE],
            index: 0,
            state: LevelState::Invalid,
            dirty: false,
            volatile: false,
        }
    }
}

impl<R: NodeRecord> LevelInfo<R> {
    pub(super) fn reset(&mut self) {
        self.node = Type1Node::default();
        self.entries.fill(R::default());
        self.index = 0;
        self.state = LevelState::Invalid;
        self.dirty = false;
        self.volatile = false;
    }

    /// Load the node described by `node` for processing.
    pub(super) fn arm(&mut self, node: Type1Node, current_gen: Generation) {
        self.reset();
        self.node = node;
        self.volatile = node.generation == current_gen;
        self.state = LevelState::Read;
    }

    /// Authenticate and decode the node's block just read.
    ///
    /// Returns `false` and leaves the level untouched on hash mismatch.
    pub(super) fn complete_read<H: BlockHasher>(&mut self, block: &[u8], hasher: &H) -> bool {
        if !hasher.check_hash(block, &self.node.hash) {
            return false;
        }
        layout::decode_node_block(block, &mut self.entries);
        self.state = LevelState::ReadComplete;
        true
    }

    /// Encode the node's records into `block` for writing it back.
    ///
    /// Updates the node's descriptor to the current generation and the fresh
    /// block hash and returns it for storing into the parent.
    pub(super) fn prepare_write<H: BlockHasher>(
        &mut self,
        block: &mut [u8],
        hasher: &H,
        current_gen: Generation,
    ) -> Type1Node {
        layout::encode_node_block(&self.entries, block);
        self.node.generation = current_gen;
        self.node.hash = hasher.calc_hash(block);
        self.node
    }
}

#[cfg(test)]
use super::hash::Sha256BlockHasher;
#[cfg(test)]
use super::layout::{BLOCK_SIZE, PhysicalBlockAddress, Type2Node};

#[test]
fn test_level_info_arm() {
    let mut level_info = LevelInfo::<Type2Node>::default();
    level_info.dirty = true;
    level_info.index = 3;

    let node = Type1Node::new(PhysicalBlockAddress::from(7u64), Generation::from(5u64), [0u8; 32]);
    level_info.arm(node, Generation::from(5u64));
    assert_eq!(level_info.state, LevelState::Read);
    assert!(level_info.volatile);
    assert!(!level_info.dirty);
    assert_eq!(level_info.index, 0);

    level_info.arm(node, Generation::from(6u64));
    assert!(!level_info.volatile);
}

#[test]
fn test_level_info_read_write() {
    let hasher = Sha256BlockHasher;
    let current_gen = Generation::from(9u64);

    let mut writer = LevelInfo::<Type2Node>::default();
    writer.arm(
        Type1Node::new(PhysicalBlockAddress::from(1u64), Generation::from(2u64), [0u8; 32]),
        current_gen,
    );
    writer.entries[1] = Type2Node {
        pba: PhysicalBlockAddress::from(77u64),
        alloc_gen: Generation::from(2u64),
        free_gen: Generation::from(2u64),
        ..Type2Node::default()
    };
    let mut block = [0u8; BLOCK_SIZE];
    let updated = writer.prepare_write(&mut block, &hasher, current_gen);
    assert_eq!(updated.pba, PhysicalBlockAddress::from(1u64));
    assert_eq!(updated.generation, current_gen);
    assert_eq!(updated.hash, hasher.calc_hash(&block));

    let mut reader = LevelInfo::<Type2Node>::default();
    reader.arm(updated, current_gen);
    assert!(reader.complete_read(&block, &hasher));
    assert_eq!(reader.state, LevelState::ReadComplete);
    assert_eq!(reader.entries[1], writer.entries[1]);
    assert!(!reader.entries[0].is_valid());

    let mut reader = LevelInfo::<Type2Node>::default();
    reader.arm(updated, current_gen);
    block[100] ^= 0x80;
    assert!(!reader.complete_read(&block, &hasher));
    assert_eq!(reader.state, LevelState::Read);
}
