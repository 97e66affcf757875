// SPDX-License-Identifier: Apache-2.0
// Copyright 2023-2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Implementation of [`MetaTreeAllocatePbaFuture`].

extern crate alloc;
use alloc::vec::Vec;

use super::{
    MetaTree, MetaTreeChannelId, MetaTreeError, MetaTreeIoOp, MetaTreeIoRequest, MetaTreeIoResult, MetaTreeRequest,
    hash::BlockHasher,
    layout::{BLOCK_SIZE, PhysicalBlockAddress, Type1Node},
};
use crate::chip::{self, NvChipIoError};
use core::{future, mem, pin, task};
use tracing::trace;

/// Result of a [`MetaTreeAllocatePbaFuture`].
///
/// A two-level [`Result`] like for the [`NvChip`](chip::NvChip) futures:
/// * `Err(e)` - The outer level [`Result`] is set to [`Err`] upon encountering
///   an internal error or a violation of the [`MetaTree`] protocol.
/// * `Ok((root, result))` - Otherwise, the tree's root descriptor to use from
///   now on is returned together with the request's result, the granted
///   block on success.
pub type MetaTreeAllocatePbaOutput =
    Result<(Type1Node, Result<PhysicalBlockAddress, MetaTreeError>), MetaTreeError>;

/// Allocate a block from the meta tree.
///
/// Submits the request to a [`MetaTree`] as soon as a channel is available and
/// serves the generated node block reads and writes from a
/// [`NvChip`](chip::NvChip) until the request has completed.
///
/// Any number of `MetaTreeAllocatePbaFuture`s may get polled concurrently on
/// the same [`MetaTree`], as long as they refer to disjoint trees.
pub struct MetaTreeAllocatePbaFuture<C: chip::NvChip> {
    fut_state: MetaTreeAllocatePbaFutureState<C>,
}

enum MetaTreeAllocatePbaFutureState<C: chip::NvChip> {
    Init {
        request: MetaTreeRequest,
    },
    Walk {
        channel: MetaTreeChannelId,
        buf: Vec<u8>,
    },
    Read {
        channel: MetaTreeChannelId,
        read_fut: C::ReadFuture<MetaTreeBlockReadNvChipRequest>,
    },
    Write {
        channel: MetaTreeChannelId,
        write_fut: C::WriteFuture<MetaTreeBlockWriteNvChipRequest>,
    },
    Done,
}

impl<C: chip::NvChip> Unpin for MetaTreeAllocatePbaFuture<C> {}

impl<C: chip::NvChip> MetaTreeAllocatePbaFuture<C> {
    /// Instantiate a [`MetaTreeAllocatePbaFuture`].
    ///
    /// # Arguments:
    ///
    /// * `request` - The allocation request to process.
    pub fn new(request: MetaTreeRequest) -> Self {
        Self {
            fut_state: MetaTreeAllocatePbaFutureState::Init { request },
        }
    }

    /// Poll the [`MetaTreeAllocatePbaFuture`] to completion.
    ///
    /// # Arguments:
    ///
    /// * `chip` - The storage the tree's nodes are located on.
    /// * `meta_tree` - The [`MetaTree`] instance to process the request with.
    ///   Must be the same one for all invocations.
    /// * `cx` - The context of an asynchronous task.
    pub fn poll<H: BlockHasher>(
        self: pin::Pin<&mut Self>,
        chip: &C,
        meta_tree: &mut MetaTree<H>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<MetaTreeAllocatePbaOutput> {
        let this = pin::Pin::into_inner(self);
        loop {
            match &mut this.fut_state {
                MetaTreeAllocatePbaFutureState::Init { request } => {
                    if !meta_tree.ready_to_submit_request() {
                        cx.waker().wake_by_ref();
                        return task::Poll::Pending;
                    }
                    let channel = match meta_tree.submit_request(*request) {
                        Ok(channel) => channel,
                        Err(e) => {
                            this.fut_state = MetaTreeAllocatePbaFutureState::Done;
                            return task::Poll::Ready(Err(e));
                        }
                    };
                    this.fut_state = MetaTreeAllocatePbaFutureState::Walk {
                        channel,
                        buf: Vec::new(),
                    };
                }
                MetaTreeAllocatePbaFutureState::Walk { channel, buf } => {
                    let channel = *channel;
                    if let Some(completed) = meta_tree.completed_request(channel) {
                        this.fut_state = MetaTreeAllocatePbaFutureState::Done;
                        if let Err(e) = meta_tree.drop_completed_request(channel) {
                            return task::Poll::Ready(Err(e));
                        }
                        return task::Poll::Ready(Ok((completed.root, completed.result)));
                    }

                    if let Some(io_request) = meta_tree.generated_request(channel) {
                        let buf = mem::take(buf);
                        match Self::start_block_io(chip, meta_tree, &io_request, buf) {
                            Ok(next_state) => this.fut_state = next_state,
                            Err(e) => {
                                this.fut_state = MetaTreeAllocatePbaFutureState::Done;
                                return task::Poll::Ready(Err(e));
                            }
                        }
                        continue;
                    }

                    if !meta_tree.execute() {
                        // Waiting for some other channel's IO to make
                        // progress.
                        cx.waker().wake_by_ref();
                        return task::Poll::Pending;
                    }
                }
                MetaTreeAllocatePbaFutureState::Read { channel, read_fut } => {
                    let channel = *channel;
                    let (buf, result) = match chip::NvChipFuture::poll(pin::Pin::new(read_fut), chip, cx) {
                        task::Poll::Ready(Ok((request, result))) => (request.dst_buf, result),
                        // The request is lost, continue with a fresh buffer.
                        task::Poll::Ready(Err(e)) => (Vec::new(), Err(e)),
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    let result = match result {
                        Ok(()) => meta_tree.generated_request_complete(channel, MetaTreeIoResult::ReadDone(&buf)),
                        Err(e) => meta_tree.generated_request_complete(channel, MetaTreeIoResult::Failed(e)),
                    };
                    if let Err(e) = result {
                        this.fut_state = MetaTreeAllocatePbaFutureState::Done;
                        return task::Poll::Ready(Err(e));
                    }
                    this.fut_state = MetaTreeAllocatePbaFutureState::Walk { channel, buf };
                }
                MetaTreeAllocatePbaFutureState::Write { channel, write_fut } => {
                    let channel = *channel;
                    let (buf, result) = match chip::NvChipFuture::poll(pin::Pin::new(write_fut), chip, cx) {
                        task::Poll::Ready(Ok((request, result))) => (request.src_buf, result),
                        task::Poll::Ready(Err(e)) => (Vec::new(), Err(e)),
                        task::Poll::Pending => return task::Poll::Pending,
                    };
                    let result = match result {
                        Ok(()) => meta_tree.generated_request_complete(channel, MetaTreeIoResult::WriteDone),
                        Err(e) => meta_tree.generated_request_complete(channel, MetaTreeIoResult::Failed(e)),
                    };
                    if let Err(e) = result {
                        this.fut_state = MetaTreeAllocatePbaFutureState::Done;
                        return task::Poll::Ready(Err(e));
                    }
                    this.fut_state = MetaTreeAllocatePbaFutureState::Walk { channel, buf };
                }
                MetaTreeAllocatePbaFutureState::Done => unreachable!("Attempt to poll completed future."),
            }
        }
    }

    /// Pick up a generated block IO request and initiate it on the `chip`.
    ///
    /// IO failing to get initiated is reported back to the `meta_tree` right
    /// away.
    fn start_block_io<H: BlockHasher>(
        chip: &C,
        meta_tree: &mut MetaTree<H>,
        io_request: &MetaTreeIoRequest,
        buf: Vec<u8>,
    ) -> Result<MetaTreeAllocatePbaFutureState<C>, MetaTreeError> {
        let channel = io_request.channel;
        let mut buf = Self::block_buf(buf)?;
        trace!(
            channel = channel.index(),
            level = io_request.level,
            pba = u64::from(io_request.pba),
            op = ?io_request.op,
            "meta_tree_block_io"
        );

        let (buf, e) = match io_request.op {
            MetaTreeIoOp::Read => {
                meta_tree.drop_generated_request(channel)?;
                let request = MetaTreeBlockReadNvChipRequest {
                    pba: io_request.pba,
                    dst_buf: buf,
                };
                match chip.read(request) {
                    Ok(Ok(read_fut)) => return Ok(MetaTreeAllocatePbaFutureState::Read { channel, read_fut }),
                    Ok(Err((request, e))) => (request.dst_buf, e),
                    Err(e) => (Vec::new(), e),
                }
            }
            MetaTreeIoOp::Write => {
                buf.copy_from_slice(meta_tree.generated_request_data(channel)?);
                meta_tree.drop_generated_request(channel)?;
                let request = MetaTreeBlockWriteNvChipRequest {
                    pba: io_request.pba,
                    src_buf: buf,
                };
                match chip.write(request) {
                    Ok(Ok(write_fut)) => return Ok(MetaTreeAllocatePbaFutureState::Write { channel, write_fut }),
                    Ok(Err((request, e))) => (request.src_buf, e),
                    Err(e) => (Vec::new(), e),
                }
            }
        };

        meta_tree.generated_request_complete(channel, MetaTreeIoResult::Failed(e))?;
        Ok(MetaTreeAllocatePbaFutureState::Walk { channel, buf })
    }

    /// Repurpose `buf` as a block sized IO buffer.
    fn block_buf(mut buf: Vec<u8>) -> Result<Vec<u8>, MetaTreeError> {
        if buf.len() != BLOCK_SIZE {
            buf.clear();
            buf.try_reserve_exact(BLOCK_SIZE)?;
            buf.resize(BLOCK_SIZE, 0u8);
        }
        Ok(buf)
    }
}

/// [`NvChipReadRequest`](chip::NvChipReadRequest) implementation used
/// internally by [`MetaTreeAllocatePbaFuture`].
struct MetaTreeBlockReadNvChipRequest {
    pba: PhysicalBlockAddress,
    dst_buf: Vec<u8>,
}

impl chip::NvChipReadRequest for MetaTreeBlockReadNvChipRequest {
    fn pba(&self) -> PhysicalBlockAddress {
        self.pba
    }

    fn get_destination_buffer(&mut self) -> Result<&mut [u8], NvChipIoError> {
        Ok(&mut self.dst_buf)
    }
}

/// [`NvChipWriteRequest`](chip::NvChipWriteRequest) implementation used
/// internally by [`MetaTreeAllocatePbaFuture`].
struct MetaTreeBlockWriteNvChipRequest {
    pba: PhysicalBlockAddress,
    src_buf: Vec<u8>,
}

impl chip::NvChipWriteRequest for MetaTreeBlockWriteNvChipRequest {
    fn pba(&self) -> PhysicalBlockAddress {
        self.pba
    }

    fn get_source_buffer(&self) -> Result<&[u8], NvChipIoError> {
        Ok(&self.src_buf)
    }
}

/// Wrapper around a [`MetaTreeAllocatePbaFuture`] implementing the standard
/// Rust [`Future`](future::Future) trait.
pub struct MetaTreeFutureAsCoreFuture<'a, C: chip::NvChip, H: BlockHasher> {
    chip: &'a C,
    meta_tree: &'a mut MetaTree<H>,
    fut: MetaTreeAllocatePbaFuture<C>,
}

impl<'a, C: chip::NvChip, H: BlockHasher> MetaTreeFutureAsCoreFuture<'a, C, H> {
    /// Wrap a [`MetaTreeAllocatePbaFuture`] in a new
    /// [`MetaTreeFutureAsCoreFuture`].
    ///
    /// # Arguments:
    ///
    /// * `chip` - The storage the tree's nodes are located on.
    /// * `meta_tree` - The [`MetaTree`] instance to process the request with.
    /// * `fut` - The [`MetaTreeAllocatePbaFuture`] to wrap.
    pub fn new(chip: &'a C, meta_tree: &'a mut MetaTree<H>, fut: MetaTreeAllocatePbaFuture<C>) -> Self {
        Self { chip, meta_tree, fut }
    }
}

impl<'a, C: chip::NvChip, H: BlockHasher> future::Future for MetaTreeFutureAsCoreFuture<'a, C, H> {
    type Output = MetaTreeAllocatePbaOutput;

    fn poll(self: pin::Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);
        pin::Pin::new(&mut this.fut).poll(this.chip, this.meta_tree, cx)
    }
}
