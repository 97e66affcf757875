// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

extern crate alloc;
use alloc::{vec, vec::Vec};

use super::{
    MetaTree, MetaTreeCompletedRequest, MetaTreeConfig, MetaTreeIoOp, MetaTreeIoResult, MetaTreeRequest,
    TreeGeometry,
    hash::{BlockHasher as _, Sha256BlockHasher},
    layout::{self, BLOCK_SIZE, Generation, NodeRecord, PhysicalBlockAddress, TREE_MAX_DEGREE, Type1Node, Type2Node},
};
use crate::chip::test::TestNvChip;

const META_TREE_TEST_CHIP_BLOCKS: u64 = 1024;

type TestMetaTree = MetaTree<Sha256BlockHasher>;

fn meta_tree_test_pba(pba: u64) -> PhysicalBlockAddress {
    PhysicalBlockAddress::from(pba)
}

fn meta_tree_test_gen(generation: u64) -> Generation {
    Generation::from(generation)
}

/// A leaf entry for the block at `pba`, last allocated in `alloc_gen`.
fn meta_tree_test_entry(pba: u64, alloc_gen: u64) -> Type2Node {
    Type2Node {
        pba: meta_tree_test_pba(pba),
        last_vba: pba + 0x10000,
        alloc_gen: meta_tree_test_gen(alloc_gen),
        free_gen: meta_tree_test_gen(alloc_gen),
        last_key_id: 1,
        reserved: false,
    }
}

/// The entry `original` is expected to have turned into after an exchange.
fn meta_tree_test_exchanged_entry(original: &Type2Node, pba: u64, current_gen: u64, reserved: bool) -> Type2Node {
    Type2Node {
        pba: meta_tree_test_pba(pba),
        alloc_gen: meta_tree_test_gen(current_gen),
        free_gen: meta_tree_test_gen(current_gen),
        reserved,
        ..*original
    }
}

enum MetaTreeTestNode {
    Inner {
        pba: u64,
        generation: u64,
        children: Vec<MetaTreeTestNode>,
    },
    Leaf {
        pba: u64,
        generation: u64,
        entries: Vec<Type2Node>,
    },
}

fn meta_tree_test_new_chip() -> TestNvChip {
    TestNvChip::new(META_TREE_TEST_CHIP_BLOCKS)
}

/// Write out a tree bottom-up and return its root descriptor.
fn meta_tree_test_write_tree(chip: &TestNvChip, node: &MetaTreeTestNode) -> Type1Node {
    let mut block = vec![0u8; BLOCK_SIZE];
    let (pba, generation) = match node {
        MetaTreeTestNode::Inner {
            pba,
            generation,
            children,
        } => {
            let records: Vec<Type1Node> = children
                .iter()
                .map(|child| meta_tree_test_write_tree(chip, child))
                .collect();
            layout::encode_node_block(&records, &mut block);
            (*pba, *generation)
        }
        MetaTreeTestNode::Leaf {
            pba,
            generation,
            entries,
        } => {
            layout::encode_node_block(entries, &mut block);
            (*pba, *generation)
        }
    };
    chip.set_block(meta_tree_test_pba(pba), &block);
    Type1Node::new(
        meta_tree_test_pba(pba),
        meta_tree_test_gen(generation),
        Sha256BlockHasher.calc_hash(&block),
    )
}

/// Read back and authenticate a node's records.
fn meta_tree_test_read_node<R: NodeRecord>(chip: &TestNvChip, node: &Type1Node) -> Vec<R> {
    let block = chip.block(node.pba).unwrap();
    assert!(Sha256BlockHasher.check_hash(&block, &node.hash));
    let mut records = vec![R::default(); TREE_MAX_DEGREE];
    layout::decode_node_block(&block, &mut records);
    records
}

/// Authenticate the whole tree and collect the valid entries of all of its
/// leaves, in order.
fn meta_tree_test_collect_entries(chip: &TestNvChip, node: &Type1Node, level: u32) -> Vec<Type2Node> {
    if level == layout::LEAF_LEVEL {
        return meta_tree_test_read_node::<Type2Node>(chip, node)
            .into_iter()
            .filter(|entry| entry.is_valid())
            .collect();
    }
    let mut entries = Vec::new();
    for child in meta_tree_test_read_node::<Type1Node>(chip, node)
        .into_iter()
        .filter(|child| child.is_valid())
    {
        entries.extend(meta_tree_test_collect_entries(chip, &child, level - 1));
    }
    entries
}

fn meta_tree_test_new_meta_tree(channels: usize) -> TestMetaTree {
    MetaTree::new(&MetaTreeConfig::new(channels).unwrap(), Sha256BlockHasher).unwrap()
}

fn meta_tree_test_request(
    root: Type1Node,
    max_level: u32,
    edges: u32,
    current_gen: u64,
    old_pba: u64,
) -> MetaTreeRequest {
    let leaves = u64::from(edges).pow(max_level);
    MetaTreeRequest::new(
        root,
        TreeGeometry::new(max_level, edges, leaves).unwrap(),
        meta_tree_test_gen(current_gen),
        meta_tree_test_pba(old_pba),
    )
}

/// Pick up and synchronously serve one generated block IO request, if any.
fn meta_tree_test_serve_io(meta_tree: &mut TestMetaTree, chip: &TestNvChip) -> bool {
    let io_request = match meta_tree.peek_generated_request() {
        Some(io_request) => io_request,
        None => return false,
    };
    let channel = io_request.channel;
    meta_tree.drop_generated_request(channel).unwrap();
    match io_request.op {
        MetaTreeIoOp::Read => {
            let mut buf = vec![0u8; BLOCK_SIZE];
            match chip.read_block(io_request.pba, &mut buf) {
                Ok(()) => meta_tree
                    .generated_request_complete(channel, MetaTreeIoResult::ReadDone(&buf))
                    .unwrap(),
                Err(e) => meta_tree
                    .generated_request_complete(channel, MetaTreeIoResult::Failed(e))
                    .unwrap(),
            }
        }
        MetaTreeIoOp::Write => {
            let data = meta_tree.generated_request_data(channel).unwrap().to_vec();
            match chip.write_block(io_request.pba, &data) {
                Ok(()) => meta_tree
                    .generated_request_complete(channel, MetaTreeIoResult::WriteDone)
                    .unwrap(),
                Err(e) => meta_tree
                    .generated_request_complete(channel, MetaTreeIoResult::Failed(e))
                    .unwrap(),
            }
        }
    }
    true
}

/// Tick the `meta_tree` until it has generated a block IO request.
fn meta_tree_test_execute_until_io(meta_tree: &mut TestMetaTree) {
    while meta_tree.peek_generated_request().is_none() {
        assert!(meta_tree.execute());
    }
}

/// Drive all submitted requests to completion and retire them.
fn meta_tree_test_run(meta_tree: &mut TestMetaTree, chip: &TestNvChip) -> Vec<MetaTreeCompletedRequest> {
    let mut completed = Vec::new();
    loop {
        let mut progress = meta_tree.execute();
        while meta_tree_test_serve_io(meta_tree, chip) {
            progress = true;
        }
        while let Some(completed_request) = meta_tree.peek_completed_request() {
            meta_tree.drop_completed_request(completed_request.channel).unwrap();
            completed.push(completed_request);
            progress = true;
        }
        if !progress {
            break;
        }
    }
    completed
}

/// Process a single request on a fresh [`MetaTree`].
fn meta_tree_test_allocate(chip: &TestNvChip, request: MetaTreeRequest) -> MetaTreeCompletedRequest {
    let mut meta_tree = meta_tree_test_new_meta_tree(1);
    meta_tree.submit_request(request).unwrap();
    let mut completed = meta_tree_test_run(&mut meta_tree, chip);
    assert_eq!(completed.len(), 1);
    assert!(meta_tree.ready_to_submit_request());
    completed.pop().unwrap()
}
