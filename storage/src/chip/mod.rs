// SPDX-License-Identifier: Apache-2.0
// Copyright 2023-2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Definition of the [`NvChip`] trait, the block device abstraction the
//! [`MetaTree`](crate::meta_tree::MetaTree) I/O requests get served from.

#[cfg(test)]
pub mod test;

use crate::meta_tree::layout::PhysicalBlockAddress;
use core::{marker, pin, task};

/// Error type returned by [`NvChip`] primitives.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NvChipIoError {
    /// Logic error.
    Internal,

    /// A memory allocation has failed.
    MemoryAllocationFailure,

    /// Read or write beyond the underlying physical storage's bounds.
    IoBlockOutOfRange,

    /// Read from a block never written to before.
    IoBlockNotMapped,

    /// Source or destination buffer doesn't match the
    /// [block size](crate::meta_tree::layout::BLOCK_SIZE).
    IoBufferSizeMismatch,

    /// Unspecified IO failure.
    IoFailure,
}

/// Future trait implemented by all [`NvChip`] related futures.
///
/// `NvChipFuture` differs from the standard [Rust
/// `Future`](core::future::Future) only in that it takes an additional `chip`
/// argument, thereby avoiding the need to store a reference to the
/// [`NvChip`] instance in each future.
pub trait NvChipFuture<C: ?Sized + NvChip> {
    type Output;

    /// Poll on a [`NvChipFuture`].
    ///
    /// Completely analogous to the standard [Rust
    /// `Future::poll()`](core::future::Future::poll), except for the
    /// additional `chip` argument.
    ///
    /// # Arguments:
    ///
    /// * `chip` -The [`NvChip`] instance the [`NvChipFuture`] had been obtained
    ///   from.
    /// * `cx` - The context of an asynchronous task.
    fn poll(self: pin::Pin<&mut Self>, chip: &C, cx: &mut task::Context<'_>) -> task::Poll<Self::Output>;
}

/// Trait defining an interface to block device like storage backends holding
/// the meta tree's node blocks.
///
/// IO is always done in units of whole
/// [blocks](crate::meta_tree::layout::BLOCK_SIZE), addressed by their
/// [`PhysicalBlockAddress`].
///
/// The `NvChip` methods don't return [`Future`](core::future::Future)s, but
/// [`NvChipFuture`]s. Implementations may assume a specific `async` executor
/// to be deployed with. For example, if targetting some minimal executor like
/// [`Pollster`](https://docs.rs/pollster/latest/pollster/), it would be
/// absolutely legitimate to block the current's thread's execution for IO.
///
/// Initiating a read from a block with a write to it still pending, or
/// initiating two overlapping writes, results in implementation defined
/// behavior. The meta tree never does either: a channel has at most one
/// request in flight, and concurrent channels are expected to walk disjoint
/// trees.
pub trait NvChip: marker::Unpin + 'static {
    /// The current size of the backing NV memory in units of
    /// [blocks](crate::meta_tree::layout::BLOCK_SIZE).
    fn chip_io_blocks(&self) -> u64;

    /// `NvChip` implementation specific [future](NvChipFuture) type
    /// instantiated through [`read()`](Self::read).
    ///
    /// A two-level [`Result`] is returned upon [future](NvChipFuture)
    /// completion.
    /// * `Err(e)` - The outer level [`Result`] is set to [`Err`] upon
    ///   encountering an internal error `e`. The [`request`](NvChipReadRequest)
    ///   originally provided to [`read()`](Self::read) is lost.
    /// * `Ok((request, ...))` - Otherwise the outer level [`Result`] is set to
    ///   [`Ok`] and a pair of the input [`request`](NvChipReadRequest) and the
    ///   operation result will get returned within:
    ///     * `Ok((request, Err(e)))` - In case of an error, the error reason
    ///       `e` is returned in an [`Err`].
    ///     * `Ok((request, Ok(())))` - Otherwise, `Ok(())` will get returned
    ///       for the operation result on success.
    type ReadFuture<R: NvChipReadRequest>: NvChipFuture<Self, Output = Result<(R, Result<(), NvChipIoError>), NvChipIoError>>
        + marker::Unpin;

    /// Read a block from physical storage.
    ///
    /// The destination buffer ownership is getting transferred to the
    /// [`ReadFuture`](Self::ReadFuture) in the form of a
    /// [`NvChipReadRequest`] for the duration of the operation and eventually
    /// returned back.
    ///
    /// # Arguments:
    ///
    /// * `request` - The [`NvChipReadRequest`] describing where to read from as
    ///   well as providing access to the destination buffer receiving the
    ///   result.
    #[allow(clippy::type_complexity)]
    fn read<R: NvChipReadRequest>(
        &self,
        request: R,
    ) -> Result<Result<Self::ReadFuture<R>, (R, NvChipIoError)>, NvChipIoError>;

    /// `NvChip` implementation specific [future](NvChipFuture) type
    /// instantiated through [`write()`](Self::write).
    ///
    /// The completion value has the same two-level structure as the one of
    /// [`ReadFuture`](Self::ReadFuture).
    type WriteFuture<R: NvChipWriteRequest>: NvChipFuture<Self, Output = Result<(R, Result<(), NvChipIoError>), NvChipIoError>>
        + marker::Unpin;

    /// Write a block to physical storage.
    ///
    /// The source buffer ownership is getting transferred to the
    /// [`WriteFuture`](Self::WriteFuture) in the form of a
    /// [`NvChipWriteRequest`] for the duration of the operation and eventually
    /// returned back.
    ///
    /// # Arguments:
    ///
    /// * `request` - The [`NvChipWriteRequest`] describing where to write to as
    ///   well as providing access to the source buffer to take the data from.
    #[allow(clippy::type_complexity)]
    fn write<R: NvChipWriteRequest>(
        &self,
        request: R,
    ) -> Result<Result<Self::WriteFuture<R>, (R, NvChipIoError)>, NvChipIoError>;
}

/// Trait defining the common interface to [`NvChip`] write requests to be
/// submitted to [`write()`](NvChip::write).
///
/// The [`NvChipWriteRequest`] instance is always getting returned again one
/// way or the other out of [`write()`](NvChip::write) or the associated
/// [`WriteFuture`](NvChip::WriteFuture) respectively.
pub trait NvChipWriteRequest {
    /// The physical destination block.
    fn pba(&self) -> PhysicalBlockAddress;

    /// Get access to the source buffer.
    fn get_source_buffer(&self) -> Result<&[u8], NvChipIoError>;
}

/// Trait defining the common interface to [`NvChip`] read requests to be
/// submitted to [`read()`](NvChip::read).
///
/// The [`NvChipReadRequest`] instance is always getting returned again one
/// way or the other out of [`read()`](NvChip::read) or the associated
/// [`ReadFuture`](NvChip::ReadFuture) respectively.
pub trait NvChipReadRequest {
    /// The physical source block.
    fn pba(&self) -> PhysicalBlockAddress;

    /// Get access to the destination buffer.
    fn get_destination_buffer(&mut self) -> Result<&mut [u8], NvChipIoError>;
}
