// SPDX-License-Identifier: Apache-2.0
// Copyright 2023-2025 SUSE LLC
// Author: Nicolai Stange <nstange@suse.de>

//! Implementation of [`TestNvChip`].

extern crate alloc;
use alloc::{boxed::Box, vec, vec::Vec};

use crate::chip::{self, NvChipIoError};
use crate::meta_tree::layout::{BLOCK_SIZE, PhysicalBlockAddress};
use core::{cell, mem, ops, pin, task};
use ops::DerefMut as _;

/// In-memory [`NvChip`](chip::NvChip) emulation for use with testing.
///
/// Besides serving block IO, a `TestNvChip` provides raw block access for
/// setting up trees and inspecting their on-storage state, as well as fault
/// injection for individual blocks.
pub struct TestNvChip {
    chip_io_blocks: cell::RefCell<Vec<Option<Box<[u8]>>>>,
    failing_reads: cell::RefCell<Vec<PhysicalBlockAddress>>,
    failing_writes: cell::RefCell<Vec<PhysicalBlockAddress>>,
}

impl TestNvChip {
    /// Create a new `TestNvChip` instance.
    ///
    /// # Arguments:
    ///
    /// * `chip_io_blocks_count`: The desired size of the emulated storage in
    ///   units of blocks.
    pub fn new(chip_io_blocks_count: u64) -> Self {
        let mut chip_io_blocks = Vec::new();
        let chip_io_blocks_count = usize::try_from(chip_io_blocks_count).unwrap();
        chip_io_blocks.resize(chip_io_blocks_count, None);
        Self {
            chip_io_blocks: cell::RefCell::new(chip_io_blocks),
            failing_reads: cell::RefCell::new(Vec::new()),
            failing_writes: cell::RefCell::new(Vec::new()),
        }
    }

    /// Create a snapshot clone.
    ///
    /// Injected faults are not carried over.
    pub fn snapshot(&self) -> Self {
        let cloned_chip_io_blocks = self.chip_io_blocks.borrow().clone();
        Self {
            chip_io_blocks: cell::RefCell::new(cloned_chip_io_blocks),
            failing_reads: cell::RefCell::new(Vec::new()),
            failing_writes: cell::RefCell::new(Vec::new()),
        }
    }

    /// Make any subsequent read from `pba` fail with
    /// [`NvChipIoError::IoFailure`].
    pub fn fail_reads_at(&self, pba: PhysicalBlockAddress) {
        self.failing_reads.borrow_mut().push(pba);
    }

    /// Make any subsequent write to `pba` fail with
    /// [`NvChipIoError::IoFailure`].
    pub fn fail_writes_at(&self, pba: PhysicalBlockAddress) {
        self.failing_writes.borrow_mut().push(pba);
    }

    /// Raw access to a block's current contents, bypassing fault injection.
    pub fn block(&self, pba: PhysicalBlockAddress) -> Option<Vec<u8>> {
        let chip_io_blocks = self.chip_io_blocks.borrow();
        let index = usize::try_from(u64::from(pba)).ok()?;
        chip_io_blocks.get(index)?.as_ref().map(|block| block.to_vec())
    }

    /// Raw block update, bypassing fault injection.
    pub fn set_block(&self, pba: PhysicalBlockAddress, data: &[u8]) {
        assert_eq!(data.len(), BLOCK_SIZE);
        let index = usize::try_from(u64::from(pba)).unwrap();
        self.chip_io_blocks.borrow_mut()[index] = Some(Box::from(data));
    }

    /// Flip a single bit in a block's stored contents.
    pub fn flip_bit(&self, pba: PhysicalBlockAddress, bit: usize) {
        let index = usize::try_from(u64::from(pba)).unwrap();
        let mut chip_io_blocks = self.chip_io_blocks.borrow_mut();
        let block = chip_io_blocks[index].as_mut().unwrap();
        block[bit / 8] ^= 1u8 << (bit % 8);
    }

    fn block_index(&self, pba: PhysicalBlockAddress) -> Result<usize, NvChipIoError> {
        let index = usize::try_from(u64::from(pba)).map_err(|_| NvChipIoError::IoBlockOutOfRange)?;
        if index >= self.chip_io_blocks.borrow().len() {
            return Err(NvChipIoError::IoBlockOutOfRange);
        }
        Ok(index)
    }

    /// Serve a single block read synchronously, honoring injected faults.
    pub fn read_block(&self, pba: PhysicalBlockAddress, dst: &mut [u8]) -> Result<(), NvChipIoError> {
        if dst.len() != BLOCK_SIZE {
            return Err(NvChipIoError::IoBufferSizeMismatch);
        }
        if self.failing_reads.borrow().contains(&pba) {
            return Err(NvChipIoError::IoFailure);
        }
        let index = self.block_index(pba)?;
        let chip_io_blocks = self.chip_io_blocks.borrow();
        let chip_io_block = match chip_io_blocks[index].as_ref() {
            Some(chip_io_block) => chip_io_block,
            None => return Err(NvChipIoError::IoBlockNotMapped),
        };
        dst.copy_from_slice(chip_io_block);
        Ok(())
    }

    /// Serve a single block write synchronously, honoring injected faults.
    pub fn write_block(&self, pba: PhysicalBlockAddress, src: &[u8]) -> Result<(), NvChipIoError> {
        if src.len() != BLOCK_SIZE {
            return Err(NvChipIoError::IoBufferSizeMismatch);
        }
        if self.failing_writes.borrow().contains(&pba) {
            return Err(NvChipIoError::IoFailure);
        }
        let index = self.block_index(pba)?;
        self.chip_io_blocks.borrow_mut()[index] = Some(Box::from(src));
        Ok(())
    }

    fn process_read_request(&self, request: &mut dyn chip::NvChipReadRequest) -> Result<(), NvChipIoError> {
        let pba = request.pba();
        self.read_block(pba, request.get_destination_buffer()?)
    }

    fn process_write_request(&self, request: &dyn chip::NvChipWriteRequest) -> Result<(), NvChipIoError> {
        self.write_block(request.pba(), request.get_source_buffer()?)
    }
}

impl chip::NvChip for TestNvChip {
    fn chip_io_blocks(&self) -> u64 {
        u64::try_from(self.chip_io_blocks.borrow().len()).unwrap()
    }

    type ReadFuture<R: chip::NvChipReadRequest> = TestNvChipReadFuture<R>;
    fn read<R: chip::NvChipReadRequest>(
        &self,
        request: R,
    ) -> Result<Result<Self::ReadFuture<R>, (R, NvChipIoError)>, NvChipIoError> {
        Ok(Ok(TestNvChipReadFuture::Init { request }))
    }

    type WriteFuture<R: chip::NvChipWriteRequest> = TestNvChipWriteFuture<R>;
    fn write<R: chip::NvChipWriteRequest>(
        &self,
        request: R,
    ) -> Result<Result<Self::WriteFuture<R>, (R, NvChipIoError)>, NvChipIoError> {
        Ok(Ok(TestNvChipWriteFuture::Init { request }))
    }
}

/// [`NvChip::ReadFuture`](chip::NvChip::ReadFuture) type for the [`TestNvChip`]
/// implementation.
pub enum TestNvChipReadFuture<R: chip::NvChipReadRequest> {
    Init { request: R },
    PolledOnce { request: R },
    Done,
}

impl<R: chip::NvChipReadRequest> Unpin for TestNvChipReadFuture<R> {}

impl<R: chip::NvChipReadRequest> chip::NvChipFuture<TestNvChip> for TestNvChipReadFuture<R> {
    type Output = Result<(R, Result<(), NvChipIoError>), NvChipIoError>;

    fn poll(mut self: pin::Pin<&mut Self>, chip: &TestNvChip, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        let this = mem::replace(self.deref_mut(), Self::Done);
        match this {
            Self::Init { request } => {
                *self = Self::PolledOnce { request };
                cx.waker().wake_by_ref();
                task::Poll::Pending
            }
            Self::PolledOnce { mut request } => {
                let result = chip.process_read_request(&mut request);
                task::Poll::Ready(Ok((request, result)))
            }
            Self::Done => {
                unreachable!("Attempt to poll completed future.")
            }
        }
    }
}

/// [`NvChip::WriteFuture`](chip::NvChip::WriteFuture) type for the
/// [`TestNvChip`] implementation.
pub enum TestNvChipWriteFuture<R: chip::NvChipWriteRequest> {
    Init { request: R },
    PolledOnce { request: R },
    Done,
}

impl<R: chip::NvChipWriteRequest> Unpin for TestNvChipWriteFuture<R> {}

impl<R: chip::NvChipWriteRequest> chip::NvChipFuture<TestNvChip> for TestNvChipWriteFuture<R> {
    type Output = Result<(R, Result<(), NvChipIoError>), NvChipIoError>;

    fn poll(mut self: pin::Pin<&mut Self>, chip: &TestNvChip, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        let this = mem::replace(self.deref_mut(), Self::Done);
        match this {
            Self::Init { request } => {
                *self = Self::PolledOnce { request };
                cx.waker().wake_by_ref();
                task::Poll::Pending
            }
            Self::PolledOnce { request } => {
                let result = chip.process_write_request(&request);
                task::Poll::Ready(Ok((request, result)))
            }
            Self::Done => {
                unreachable!("Attempt to poll completed future.")
            }
        }
    }
}

#[cfg(test)]
struct TestNvChipFuture<'a, F: chip::NvChipFuture<TestNvChip> + Unpin> {
    chip: &'a TestNvChip,
    chip_fut: F,
}

#[cfg(test)]
impl<'a, F: chip::NvChipFuture<TestNvChip> + Unpin> core::future::Future for TestNvChipFuture<'a, F> {
    type Output = F::Output;

    fn poll(self: pin::Pin<&mut Self>, cx: &mut task::Context<'_>) -> task::Poll<Self::Output> {
        let this = pin::Pin::into_inner(self);
        F::poll(pin::Pin::new(&mut this.chip_fut), this.chip, cx)
    }
}

#[cfg(test)]
struct TestBlockRequest {
    pba: PhysicalBlockAddress,
    buf: Vec<u8>,
}

#[cfg(test)]
impl chip::NvChipReadRequest for TestBlockRequest {
    fn pba(&self) -> PhysicalBlockAddress {
        self.pba
    }

    fn get_destination_buffer(&mut self) -> Result<&mut [u8], NvChipIoError> {
        Ok(&mut self.buf)
    }
}

#[cfg(test)]
impl chip::NvChipWriteRequest for TestBlockRequest {
    fn pba(&self) -> PhysicalBlockAddress {
        self.pba
    }

    fn get_source_buffer(&self) -> Result<&[u8], NvChipIoError> {
        Ok(&self.buf)
    }
}

#[test]
fn test_nv_chip_rw() {
    use chip::NvChip as _;

    let chip = TestNvChip::new(8);
    let pba = PhysicalBlockAddress::from(3u64);

    let mut data = vec![0u8; BLOCK_SIZE];
    for (i, b) in data.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    let write_request = TestBlockRequest { pba, buf: data.clone() };
    let write_fut = chip.write(write_request).unwrap().map_err(|(_, e)| e).unwrap();
    let (_, result) = pollster::block_on(TestNvChipFuture {
        chip: &chip,
        chip_fut: write_fut,
    })
    .unwrap();
    result.unwrap();

    let read_request = TestBlockRequest {
        pba,
        buf: vec![0u8; BLOCK_SIZE],
    };
    let read_fut = chip.read(read_request).unwrap().map_err(|(_, e)| e).unwrap();
    let (read_request, result) = pollster::block_on(TestNvChipFuture {
        chip: &chip,
        chip_fut: read_fut,
    })
    .unwrap();
    result.unwrap();
    assert_eq!(read_request.buf, data);

    // Never written.
    let read_request = TestBlockRequest {
        pba: PhysicalBlockAddress::from(4u64),
        buf: vec![0u8; BLOCK_SIZE],
    };
    let read_fut = chip.read(read_request).unwrap().map_err(|(_, e)| e).unwrap();
    let (_, result) = pollster::block_on(TestNvChipFuture {
        chip: &chip,
        chip_fut: read_fut,
    })
    .unwrap();
    assert_eq!(result, Err(NvChipIoError::IoBlockNotMapped));
}

#[test]
fn test_nv_chip_faults() {
    let chip = TestNvChip::new(4);
    let pba = PhysicalBlockAddress::from(1u64);
    let data = vec![0xa5u8; BLOCK_SIZE];
    chip.write_block(pba, &data).unwrap();

    let snapshot = chip.snapshot();
    chip.fail_reads_at(pba);
    let mut buf = vec![0u8; BLOCK_SIZE];
    assert_eq!(chip.read_block(pba, &mut buf), Err(NvChipIoError::IoFailure));
    snapshot.read_block(pba, &mut buf).unwrap();
    assert_eq!(buf, data);

    chip.fail_writes_at(pba);
    assert_eq!(chip.write_block(pba, &buf), Err(NvChipIoError::IoFailure));
    assert_eq!(
        chip.write_block(PhysicalBlockAddress::from(4u64), &buf),
        Err(NvChipIoError::IoBlockOutOfRange)
    );
    assert_eq!(
        chip.write_block(PhysicalBlockAddress::from(2u64), &buf[..16]),
        Err(NvChipIoError::IoBufferSizeMismatch)
    );

    chip.flip_bit(pba, 9);
    assert_eq!(chip.block(pba).unwrap()[1], 0xa5 ^ 0x02);
}
