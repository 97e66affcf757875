// SPDX-License-Identifier: Apache-2.0
// Copyright 2023-2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Request processing slot of a [`MetaTree`](super::MetaTree).
//!
//! A [`Channel`] walks a single tree for one request at a time. The walk
//! descends depth-first from the root, exchanging usable leaf entries for the
//! blocks of nodes that may not get updated in place and finally for the
//! block the request gives up. Modified nodes are written back bottom-up.

extern crate alloc;
use alloc::{boxed::Box, vec::Vec};

use super::hash::BlockHasher;
use super::layout::{
    self, LEAF_LEVEL, LOWEST_INNER_LEVEL, NodeRecord as _, PhysicalBlockAddress, TREE_MAX_LEVEL, Type1Node, Type2Node,
};
use super::level::{LevelInfo, LevelState};
use super::{
    MetaTreeChannelId, MetaTreeCompletedRequest, MetaTreeError, MetaTreeIoOp, MetaTreeIoRequest, MetaTreeIoResult,
    MetaTreeRequest,
};
use crate::meta_tree_err_internal;
use tracing::{debug, trace, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum ChannelState {
    /// Free for a new request.
    Invalid,
    /// Walking the tree.
    Update,
    /// A node failed authentication, completion is pending.
    TreeHashMismatch,
    /// Done, awaiting retrieval of the result.
    Complete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum LocalRequestState {
    /// Waiting to get picked up.
    Pending,
    /// Picked up, waiting for completion.
    InProgress,
}

/// Block IO the channel's walk is blocked on.
#[derive(Clone, Copy, Debug)]
pub(super) struct LocalRequest {
    pub(super) state: LocalRequestState,
    pub(super) op: MetaTreeIoOp,
    pub(super) pba: PhysicalBlockAddress,
    pub(super) level: u32,
}

pub(super) struct Channel {
    id: MetaTreeChannelId,
    pub(super) state: ChannelState,
    request: Option<MetaTreeRequest>,
    /// Authoritative root, gets updated once the top-level node has been
    /// written back.
    pub(super) root: Type1Node,
    /// Inner levels' state, indexed by level. Entries below
    /// [`LOWEST_INNER_LEVEL`] are unused.
    pub(super) level_n_nodes: [LevelInfo<Type1Node>; TREE_MAX_LEVEL as usize + 1],
    pub(super) level_1_node: LevelInfo<Type2Node>,
    pub(super) local_request: Option<LocalRequest>,
    block: Box<[u8]>,
    /// The request's block has been granted.
    pub(super) finished: bool,
    pub(super) new_pba: PhysicalBlockAddress,
    pub(super) exchanges: u32,
    result: Option<Result<PhysicalBlockAddress, MetaTreeError>>,
}

impl Channel {
    pub(super) fn new(id: MetaTreeChannelId) -> Result<Self, MetaTreeError> {
        let mut block = Vec::new();
        block.try_reserve_exact(layout::BLOCK_SIZE)?;
        block.resize(layout::BLOCK_SIZE, 0u8);
        Ok(Self {
            id,
            state: ChannelState::Invalid,
            request: None,
            root: Type1Node::default(),
            level_n_nodes: core::array::from_fn(|_| LevelInfo::default()),
            level_1_node: LevelInfo::default(),
            local_request: None,
            block: block.into_boxed_slice(),
            finished: false,
            new_pba: PhysicalBlockAddress::INVALID,
            exchanges: 0,
            result: None,
        })
    }

    /// Take on a new request and arm the root node for reading.
    pub(super) fn start(&mut self, request: MetaTreeRequest) {
        for level_info in self.level_n_nodes.iter_mut() {
            level_info.reset();
        }
        self.level_1_node.reset();
        self.local_request = None;
        self.finished = false;
        self.new_pba = PhysicalBlockAddress::INVALID;
        self.exchanges = 0;
        self.result = None;
        self.root = request.root;

        let max_level = request.geometry.max_level();
        if max_level == LEAF_LEVEL {
            self.level_1_node.arm(request.root, request.current_gen);
        } else {
            self.level_n_nodes[max_level as usize].arm(request.root, request.current_gen);
        }
        self.request = Some(request);
        self.state = ChannelState::Update;
    }

    /// Return the channel to the pool of free ones.
    pub(super) fn release(&mut self) {
        self.request = None;
        self.result = None;
        self.local_request = None;
        self.state = ChannelState::Invalid;
    }

    pub(super) fn completed_request(&self) -> Option<MetaTreeCompletedRequest> {
        if self.state != ChannelState::Complete {
            return None;
        }
        Some(MetaTreeCompletedRequest {
            channel: self.id,
            root: self.root,
            result: self.result?,
            exchanges: self.exchanges,
        })
    }

    pub(super) fn generated_request(&self) -> Option<MetaTreeIoRequest> {
        match self.local_request {
            Some(local_request) if local_request.state == LocalRequestState::Pending => Some(MetaTreeIoRequest {
                channel: self.id,
                op: local_request.op,
                pba: local_request.pba,
                level: local_request.level,
            }),
            _ => None,
        }
    }

    /// Mark the pending block IO as picked up by the host.
    pub(super) fn take_generated_request(&mut self) -> Result<(), MetaTreeError> {
        match self.local_request.as_mut() {
            Some(local_request) if local_request.state == LocalRequestState::Pending => {
                local_request.state = LocalRequestState::InProgress;
                Ok(())
            }
            _ => Err(MetaTreeError::InvalidChannel),
        }
    }

    /// Serialized node block to be written for the generated write request.
    pub(super) fn generated_request_data(&self) -> Result<&[u8], MetaTreeError> {
        match self.local_request {
            Some(LocalRequest {
                op: MetaTreeIoOp::Write,
                ..
            }) => Ok(&self.block),
            _ => Err(MetaTreeError::InvalidChannel),
        }
    }

    fn generate_request(&mut self, op: MetaTreeIoOp, level: u32, pba: PhysicalBlockAddress) {
        trace!(channel = self.id.index(), level, pba = u64::from(pba), ?op, "meta_tree_generate_request");
        self.local_request = Some(LocalRequest {
            state: LocalRequestState::Pending,
            op,
            pba,
            level,
        });
    }

    fn complete(&mut self, result: Result<PhysicalBlockAddress, MetaTreeError>) {
        debug!(
            channel = self.id.index(),
            root_pba = u64::from(self.root.pba),
            exchanges = self.exchanges,
            ?result,
            "meta_tree_complete"
        );
        self.local_request = None;
        self.result = Some(result);
        self.state = ChannelState::Complete;
    }

    /// The top-level node has been processed, conclude the walk.
    fn complete_walk(&mut self) {
        let result = if self.finished {
            Ok(self.new_pba)
        } else {
            Err(MetaTreeError::NoBlockAvailable)
        };
        self.complete(result);
    }

    /// Advance the walk by one step.
    ///
    /// Returns whether any progress has been made.
    pub(super) fn execute<H: BlockHasher>(&mut self, hasher: &H) -> bool {
        if self.local_request.is_some() {
            return false;
        }

        match self.state {
            ChannelState::Invalid | ChannelState::Complete => false,
            ChannelState::TreeHashMismatch => {
                self.state = ChannelState::Complete;
                true
            }
            ChannelState::Update => {
                let result = match self.request {
                    Some(request) => {
                        if self.level_1_node.state != LevelState::Invalid {
                            self.handle_level_1_node(&request, hasher)
                        } else {
                            self.handle_level_n_nodes(&request, hasher)
                        }
                    }
                    None => Err(meta_tree_err_internal!()),
                };
                match result {
                    Ok(progress) => progress,
                    Err(e) => {
                        self.complete(Err(e));
                        true
                    }
                }
            }
        }
    }

    fn handle_level_1_node<H: BlockHasher>(
        &mut self,
        request: &MetaTreeRequest,
        hasher: &H,
    ) -> Result<bool, MetaTreeError> {
        match self.level_1_node.state {
            LevelState::Invalid => Ok(false),
            LevelState::Read => {
                self.generate_request(MetaTreeIoOp::Read, LEAF_LEVEL, self.level_1_node.node.pba);
                Ok(true)
            }
            LevelState::ReadComplete => {
                if !self.finished && self.handle_level_0_nodes(request) {
                    return Ok(true);
                }
                self.level_1_node.state = if self.level_1_node.dirty {
                    LevelState::Write
                } else {
                    LevelState::Complete
                };
                trace!(
                    channel = self.id.index(),
                    level = LEAF_LEVEL,
                    state = ?self.level_1_node.state,
                    "meta_tree_level_state"
                );
                Ok(true)
            }
            LevelState::Write => {
                // A dirty leaf has always been relocated first, hence is volatile.
                if !self.level_1_node.volatile {
                    return Err(meta_tree_err_internal!());
                }
                let node = self
                    .level_1_node
                    .prepare_write(&mut self.block, hasher, request.current_gen);
                self.update_parent(request, LEAF_LEVEL, node)?;
                self.generate_request(MetaTreeIoOp::Write, LEAF_LEVEL, node.pba);
                Ok(true)
            }
            LevelState::WriteComplete | LevelState::Complete => {
                let written = self.level_1_node.state == LevelState::WriteComplete;
                let node = self.level_1_node.node;
                self.level_1_node.reset();
                self.ascend(request, LEAF_LEVEL, written.then_some(node))?;
                Ok(true)
            }
        }
    }

    /// Exchange at most one usable leaf entry.
    ///
    /// The leaf itself gets relocated first, then the inner nodes on the path
    /// not yet written in the current generation, bottom-up, and only then the
    /// request's block is granted. Returns whether an exchange has been made.
    fn handle_level_0_nodes(&mut self, request: &MetaTreeRequest) -> bool {
        let current_gen = request.current_gen;
        let edges = request.geometry.edges() as usize;
        let index = match self.level_1_node.entries[..edges]
            .iter()
            .position(|entry| entry.is_usable(current_gen))
        {
            Some(index) => index,
            None => return false,
        };

        let max_level = request.geometry.max_level();
        let entry = &mut self.level_1_node.entries[index];
        if !self.level_1_node.volatile {
            let harvested_pba = entry.exchange(self.level_1_node.node.pba, current_gen, false);
            debug!(
                channel = self.id.index(),
                level = LEAF_LEVEL,
                old_pba = u64::from(self.level_1_node.node.pba),
                new_pba = u64::from(harvested_pba),
                "meta_tree_relocate_node"
            );
            self.level_1_node.node.pba = harvested_pba;
            self.level_1_node.volatile = true;
        } else if let Some(level) =
            (LOWEST_INNER_LEVEL..=max_level).find(|level| !self.level_n_nodes[*level as usize].volatile)
        {
            let level_info = &mut self.level_n_nodes[level as usize];
            let harvested_pba = entry.exchange(level_info.node.pba, current_gen, false);
            debug!(
                channel = self.id.index(),
                level,
                old_pba = u64::from(level_info.node.pba),
                new_pba = u64::from(harvested_pba),
                "meta_tree_relocate_node"
            );
            level_info.node.pba = harvested_pba;
            level_info.volatile = true;
        } else {
            let harvested_pba = entry.exchange(request.old_pba, current_gen, true);
            debug!(
                channel = self.id.index(),
                old_pba = u64::from(request.old_pba),
                new_pba = u64::from(harvested_pba),
                "meta_tree_grant_block"
            );
            self.new_pba = harvested_pba;
            self.finished = true;
        }

        self.level_1_node.dirty = true;
        self.exchanges = self.exchanges.saturating_add(1);
        true
    }

    fn handle_level_n_nodes<H: BlockHasher>(
        &mut self,
        request: &MetaTreeRequest,
        hasher: &H,
    ) -> Result<bool, MetaTreeError> {
        let max_level = request.geometry.max_level();
        let edges = request.geometry.edges() as usize;
        for level in LOWEST_INNER_LEVEL..=max_level {
            let level_info = &mut self.level_n_nodes[level as usize];
            match level_info.state {
                LevelState::Invalid => continue,
                LevelState::Read => {
                    let pba = level_info.node.pba;
                    self.generate_request(MetaTreeIoOp::Read, level, pba);
                }
                LevelState::ReadComplete => {
                    let child = level_info.entries.get(level_info.index).copied().unwrap_or_default();
                    if !self.finished && level_info.index < edges && child.is_valid() {
                        trace!(
                            channel = self.id.index(),
                            level,
                            index = level_info.index,
                            child_pba = u64::from(child.pba),
                            "meta_tree_descend"
                        );
                        if level == LOWEST_INNER_LEVEL {
                            self.level_1_node.arm(child, request.current_gen);
                        } else {
                            self.level_n_nodes[level as usize - 1].arm(child, request.current_gen);
                        }
                    } else if !level_info.dirty {
                        level_info.state = LevelState::Complete;
                    } else if !level_info.volatile {
                        // Children have been relocated, but the node itself
                        // could not be and must not get overwritten in place.
                        warn!(
                            channel = self.id.index(),
                            level,
                            pba = u64::from(level_info.node.pba),
                            "meta_tree_node_not_relocatable"
                        );
                        self.complete(Err(MetaTreeError::NoBlockAvailable));
                    } else {
                        level_info.state = LevelState::Write;
                    }
                }
                LevelState::Write => {
                    let node = level_info.prepare_write(&mut self.block, hasher, request.current_gen);
                    self.update_parent(request, level, node)?;
                    self.generate_request(MetaTreeIoOp::Write, level, node.pba);
                }
                LevelState::WriteComplete | LevelState::Complete => {
                    let written = level_info.state == LevelState::WriteComplete;
                    let node = level_info.node;
                    level_info.reset();
                    self.ascend(request, level, written.then_some(node))?;
                }
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Store a written node's updated descriptor into its parent.
    ///
    /// The top-level node's descriptor becomes the new root only once its
    /// write has completed.
    fn update_parent(&mut self, request: &MetaTreeRequest, level: u32, node: Type1Node) -> Result<(), MetaTreeError> {
        if level == request.geometry.max_level() {
            return Ok(());
        }
        let parent = self
            .level_n_nodes
            .get_mut(level as usize + 1)
            .ok_or_else(|| meta_tree_err_internal!())?;
        let entry = parent
            .entries
            .get_mut(parent.index)
            .ok_or_else(|| meta_tree_err_internal!())?;
        *entry = node;
        parent.dirty = true;
        Ok(())
    }

    /// Done with the node at `level`, continue with its parent's next child
    /// or conclude the walk at the top.
    fn ascend(
        &mut self,
        request: &MetaTreeRequest,
        level: u32,
        written: Option<Type1Node>,
    ) -> Result<(), MetaTreeError> {
        if level == request.geometry.max_level() {
            if let Some(root) = written {
                self.root = root;
            }
            self.complete_walk();
        } else {
            let parent = self
                .level_n_nodes
                .get_mut(level as usize + 1)
                .ok_or_else(|| meta_tree_err_internal!())?;
            parent.index += 1;
        }
        Ok(())
    }

    /// Feed back the result of the block IO previously taken with
    /// [`take_generated_request()`](Self::take_generated_request).
    pub(super) fn complete_generated_request<H: BlockHasher>(
        &mut self,
        result: MetaTreeIoResult<'_>,
        hasher: &H,
    ) -> Result<(), MetaTreeError> {
        let local_request = match self.local_request {
            Some(local_request) if local_request.state == LocalRequestState::InProgress => local_request,
            _ => return Err(MetaTreeError::UnexpectedCompletion),
        };

        match (local_request.op, result) {
            (_, MetaTreeIoResult::Failed(e)) => {
                warn!(
                    channel = self.id.index(),
                    level = local_request.level,
                    pba = u64::from(local_request.pba),
                    error = ?e,
                    "meta_tree_io_failure"
                );
                self.complete(Err(MetaTreeError::from(e)));
            }
            (MetaTreeIoOp::Read, MetaTreeIoResult::ReadDone(data)) => {
                if data.len() != self.block.len() {
                    return Err(MetaTreeError::BufferSizeMismatch);
                }
                self.local_request = None;
                self.block.copy_from_slice(data);
                let authenticated = if local_request.level == LEAF_LEVEL {
                    self.level_1_node.complete_read(&self.block, hasher)
                } else {
                    self.level_n_nodes
                        .get_mut(local_request.level as usize)
                        .ok_or_else(|| meta_tree_err_internal!())?
                        .complete_read(&self.block, hasher)
                };
                if authenticated {
                    trace!(
                        channel = self.id.index(),
                        level = local_request.level,
                        pba = u64::from(local_request.pba),
                        "meta_tree_read_complete"
                    );
                } else {
                    warn!(
                        channel = self.id.index(),
                        level = local_request.level,
                        pba = u64::from(local_request.pba),
                        "meta_tree_hash_mismatch"
                    );
                    self.result = Some(Err(MetaTreeError::HashMismatch {
                        level: local_request.level,
                        pba: local_request.pba,
                    }));
                    self.state = ChannelState::TreeHashMismatch;
                }
            }
            (MetaTreeIoOp::Write, MetaTreeIoResult::WriteDone) => {
                self.local_request = None;
                let state = if local_request.level == LEAF_LEVEL {
                    &mut self.level_1_node.state
                } else {
                    &mut self
                        .level_n_nodes
                        .get_mut(local_request.level as usize)
                        .ok_or_else(|| meta_tree_err_internal!())?
                        .state
                };
                *state = LevelState::WriteComplete;
            }
            _ => return Err(MetaTreeError::UnexpectedCompletion),
        }
        Ok(())
    }
}
