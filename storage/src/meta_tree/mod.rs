// SPDX-License-Identifier: Apache-2.0
// Copyright 2023-2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Block allocation from the meta tree.
//!
//! The meta tree is a hash-authenticated, copy-on-write tree whose leaf
//! entries describe a pool of spare physical blocks. A [`MetaTree`] hands
//! out one of these blocks per [request](MetaTreeRequest) in return for a
//! block the requester gives up, which gets recorded in the entry's place.
//!
//! Nodes last written in an older generation must not get modified in place.
//! Before such a node on the walked path gets written back, it is relocated to
//! another block harvested from the tree itself. Only once the whole path is
//! safe to write, the requester's block gets granted.
//!
//! [`MetaTree`] doesn't do any IO on its own. Instead, it generates block
//! [read and write requests](MetaTreeIoRequest) for the host to carry out and
//! report back. Up to a [configured](MetaTreeConfig) number of requests can be
//! processed concurrently, each in its own channel.
//! [`MetaTreeAllocatePbaFuture`] drives a single request against an
//! [`NvChip`](crate::chip::NvChip).

extern crate alloc;
use alloc::vec::Vec;

mod allocate;
mod channel;
pub mod config;
pub mod hash;
pub mod layout;
mod level;

#[cfg(test)]
mod test;

use crate::chip::NvChipIoError;
use channel::{Channel, ChannelState};
use core::convert;
use tracing::debug;

pub use allocate::{MetaTreeAllocatePbaFuture, MetaTreeAllocatePbaOutput, MetaTreeFutureAsCoreFuture};
pub use config::{MetaTreeConfig, TreeGeometry};
pub use hash::{BlockHasher, Sha256BlockHasher};
pub use layout::{Generation, PhysicalBlockAddress, Type1Node, Type2Node};

/// Error type returned by the [`MetaTree`] API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaTreeError {
    /// Logic error.
    Internal,

    /// A memory allocation has failed.
    MemoryAllocationFailure,

    /// A block IO has failed.
    IoError(NvChipIoError),

    /// A node's block doesn't match the hash stored in its descriptor.
    HashMismatch { level: u32, pba: PhysicalBlockAddress },

    /// The tree had no usable entries left for completing the request.
    NoBlockAvailable,

    /// All channels are busy.
    ChannelsExhausted,

    /// The channel doesn't exist or isn't in a state suitable for the
    /// operation.
    InvalidChannel,

    /// Completion reported for a block IO not in progress or of a different
    /// kind.
    UnexpectedCompletion,

    /// Block IO data buffer of wrong size.
    BufferSizeMismatch,

    /// Tree dimensions out of the supported range.
    InvalidGeometry,

    /// Invalid [`MetaTreeConfig`] parameters.
    InvalidConfig,
}

impl convert::From<NvChipIoError> for MetaTreeError {
    fn from(value: NvChipIoError) -> Self {
        match value {
            NvChipIoError::Internal => Self::Internal,
            NvChipIoError::MemoryAllocationFailure => Self::MemoryAllocationFailure,
            e => Self::IoError(e),
        }
    }
}

impl convert::From<alloc::collections::TryReserveError> for MetaTreeError {
    fn from(_value: alloc::collections::TryReserveError) -> Self {
        Self::MemoryAllocationFailure
    }
}

/// Debugging friendly helper for instantiating [`MetaTreeError::Internal`].
///
/// Panics if `cfg!(debug_assertions)` is on, to allow for debugger examination
/// at the point the logic error has happened. Otherwise a
/// [`MetaTreeError::Internal`] is returned.
#[macro_export]
macro_rules! meta_tree_err_internal {
    () => {{
        if cfg!(debug_assertions) {
            panic!("MetaTreeError::Internal");
        } else {
            $crate::meta_tree::MetaTreeError::Internal
        }
    }};
}

/// Identifies the channel a request is being processed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetaTreeChannelId {
    index: usize,
}

impl MetaTreeChannelId {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Block allocation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaTreeRequest {
    /// Descriptor of the tree's root node.
    pub root: Type1Node,
    pub geometry: TreeGeometry,
    /// The block store's ongoing generation.
    pub current_gen: Generation,
    /// The block given up in return, to be recorded as reserved.
    pub old_pba: PhysicalBlockAddress,
}

impl MetaTreeRequest {
    pub fn new(
        root: Type1Node,
        geometry: TreeGeometry,
        current_gen: Generation,
        old_pba: PhysicalBlockAddress,
    ) -> Self {
        Self {
            root,
            geometry,
            current_gen,
            old_pba,
        }
    }
}

/// Outcome of a request, obtained from
/// [`peek_completed_request()`](MetaTree::peek_completed_request).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaTreeCompletedRequest {
    pub channel: MetaTreeChannelId,
    /// The tree's root descriptor to use from now on.
    ///
    /// Differs from the request's root only if the top-level node has been
    /// written back.
    pub root: Type1Node,
    /// The granted block on success.
    pub result: Result<PhysicalBlockAddress, MetaTreeError>,
    /// Number of leaf entries exchanged, including the final grant.
    pub exchanges: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaTreeIoOp {
    Read,
    Write,
}

/// Block IO to be carried out by the host on behalf of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetaTreeIoRequest {
    pub channel: MetaTreeChannelId,
    pub op: MetaTreeIoOp,
    pub pba: PhysicalBlockAddress,
    /// Tree level of the node being transferred.
    pub level: u32,
}

/// Result of a [`MetaTreeIoRequest`], reported back via
/// [`generated_request_complete()`](MetaTree::generated_request_complete).
#[derive(Clone, Copy, Debug)]
pub enum MetaTreeIoResult<'a> {
    /// The block's contents have been read.
    ReadDone(&'a [u8]),
    WriteDone,
    /// The IO has failed. Completes the request with the error converted
    /// into a [`MetaTreeError`].
    Failed(NvChipIoError),
}

/// Meta tree block allocation engine.
///
/// Purely event driven: the host submits requests, then alternates between
/// calling [`execute()`](Self::execute), serving the [generated block
/// IO](Self::peek_generated_request) and collecting [completed
/// requests](Self::peek_completed_request).
pub struct MetaTree<H: BlockHasher> {
    channels: Vec<Channel>,
    hasher: H,
}

impl<H: BlockHasher> MetaTree<H> {
    /// Create a new `MetaTree` instance.
    ///
    /// All channels and their buffers get allocated upfront.
    pub fn new(config: &MetaTreeConfig, hasher: H) -> Result<Self, MetaTreeError> {
        let mut channels = Vec::new();
        channels.try_reserve_exact(config.channels())?;
        for index in 0..config.channels() {
            channels.push(Channel::new(MetaTreeChannelId { index })?);
        }
        Ok(Self { channels, hasher })
    }

    /// Whether a channel is available for [submitting](Self::submit_request)
    /// a request to.
    pub fn ready_to_submit_request(&self) -> bool {
        self.channels.iter().any(|channel| channel.state == ChannelState::Invalid)
    }

    /// Submit a request for processing.
    ///
    /// Returns [`MetaTreeError::ChannelsExhausted`] if all channels are busy.
    pub fn submit_request(&mut self, request: MetaTreeRequest) -> Result<MetaTreeChannelId, MetaTreeError> {
        let index = self
            .channels
            .iter()
            .position(|channel| channel.state == ChannelState::Invalid)
            .ok_or(MetaTreeError::ChannelsExhausted)?;
        debug!(
            channel = index,
            root_pba = u64::from(request.root.pba),
            generation = u64::from(request.current_gen),
            max_level = request.geometry.max_level(),
            "meta_tree_submit"
        );
        self.channels[index].start(request);
        Ok(MetaTreeChannelId { index })
    }

    /// Advance each channel's processing by at most one step.
    ///
    /// Channels waiting for block IO to complete are skipped. Returns whether
    /// any progress has been made.
    pub fn execute(&mut self) -> bool {
        let mut progress = false;
        for channel in self.channels.iter_mut() {
            progress |= channel.execute(&self.hasher);
        }
        progress
    }

    fn channel(&self, channel: MetaTreeChannelId) -> Result<&Channel, MetaTreeError> {
        self.channels.get(channel.index).ok_or(MetaTreeError::InvalidChannel)
    }

    fn channel_mut(&mut self, channel: MetaTreeChannelId) -> Result<&mut Channel, MetaTreeError> {
        self.channels.get_mut(channel.index).ok_or(MetaTreeError::InvalidChannel)
    }

    /// Get the first completed request, if any.
    pub fn peek_completed_request(&self) -> Option<MetaTreeCompletedRequest> {
        self.channels.iter().find_map(|channel| channel.completed_request())
    }

    /// Get a specific channel's completed request, if it has completed.
    pub fn completed_request(&self, channel: MetaTreeChannelId) -> Option<MetaTreeCompletedRequest> {
        self.channel(channel).ok()?.completed_request()
    }

    /// Retire a completed request, freeing up its channel.
    pub fn drop_completed_request(&mut self, channel: MetaTreeChannelId) -> Result<(), MetaTreeError> {
        let channel = self.channel_mut(channel)?;
        if channel.state != ChannelState::Complete {
            return Err(MetaTreeError::InvalidChannel);
        }
        channel.release();
        Ok(())
    }

    /// Get the first block IO not yet picked up, if any.
    pub fn peek_generated_request(&self) -> Option<MetaTreeIoRequest> {
        self.channels.iter().find_map(|channel| channel.generated_request())
    }

    /// Get a specific channel's block IO not yet picked up, if any.
    pub fn generated_request(&self, channel: MetaTreeChannelId) -> Option<MetaTreeIoRequest> {
        self.channel(channel).ok()?.generated_request()
    }

    /// Serialized node block for a channel's generated write.
    ///
    /// Remains valid until the write's completion has been reported.
    pub fn generated_request_data(&self, channel: MetaTreeChannelId) -> Result<&[u8], MetaTreeError> {
        self.channel(channel)?.generated_request_data()
    }

    /// Mark a channel's generated block IO as picked up.
    ///
    /// The result is expected to get reported back via
    /// [`generated_request_complete()`](Self::generated_request_complete)
    /// eventually.
    pub fn drop_generated_request(&mut self, channel: MetaTreeChannelId) -> Result<(), MetaTreeError> {
        self.channel_mut(channel)?.take_generated_request()
    }

    /// Report back the result of a channel's block IO.
    ///
    /// A failed IO or a read block failing authentication completes the
    /// request with an error. Protocol violations are returned as an error
    /// and leave the channel's state unmodified.
    pub fn generated_request_complete(
        &mut self,
        channel: MetaTreeChannelId,
        result: MetaTreeIoResult<'_>,
    ) -> Result<(), MetaTreeError> {
        let channel = self.channels.get_mut(channel.index).ok_or(MetaTreeError::InvalidChannel)?;
        channel.complete_generated_request(result, &self.hasher)
    }
}
