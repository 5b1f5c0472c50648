use std::{
    convert::TryFrom,
    ops,
    sync::atomic::{self, AtomicUsize},
};

use crate::{allocate_block_bytes, extents::MAX_BLOCKS, BLOCK_SIZE};

/// The kind of a given block. Apart from logging, this documents what the caller expects the
/// block to contain.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BlockKind {
    /// The contents of a file.
    Data,

    /// An extent index, mapping the contents of a file to data blocks.
    Index,
}

/// The underlying disk of a varfs filesystem, addressed in filesystem blocks rather than device
/// sectors.
pub struct Disk<D> {
    inner: D,
    info: varfs::DiskInfo,
    block_count: u32,
    sync: bool,
    held: AtomicUsize,
}

impl<D> Disk<D> {
    pub fn into_inner(self) -> D {
        self.inner
    }
    pub fn inner(&self) -> &D {
        &self.inner
    }
    pub fn info(&self) -> varfs::DiskInfo {
        self.info
    }
    /// The number of filesystem blocks on the disk, including block 0, which is never handed out.
    pub fn block_count(&self) -> u32 {
        self.block_count
    }
    /// The number of buffers that are currently acquired and not yet released.
    pub fn held_buffers(&self) -> usize {
        self.held.load(atomic::Ordering::Acquire)
    }
    fn block_offset(block: u32) -> u64 {
        u64::from(block) * BLOCK_SIZE as u64
    }
}

impl<D: varfs::DeviceRo> Disk<D> {
    pub fn new(inner: D, options: &varfs::Options) -> Result<Self, varfs::DeviceError> {
        let info = inner.disk_info_blocking()?;

        let block_count = u32::try_from(info.size() / BLOCK_SIZE as u64)
            .unwrap_or(u32::max_value())
            .min(MAX_BLOCKS);

        if u64::from(block_count) * (BLOCK_SIZE as u64) < info.size() {
            log::debug!(
                "only the first {} blocks of the {} byte device are addressable",
                block_count,
                info.size()
            );
        }

        Ok(Self {
            inner,
            info,
            block_count,
            sync: options.sync,
            held: AtomicUsize::new(0),
        })
    }

    /// Read a whole block, bypassing the buffers.
    pub fn read_block(&self, block: u32, buffer: &mut [u8]) -> Result<(), varfs::DeviceError> {
        debug_assert!(block < self.block_count);
        debug_assert_eq!(buffer.len(), BLOCK_SIZE);

        retrying(|| self.inner.read_blocking(Self::block_offset(block), buffer))
    }
}

/// Repeat a device operation for as long as it fails with an error that asks for a retry.
fn retrying<T, F>(mut operation: F) -> Result<T, varfs::DeviceError>
where
    F: FnMut() -> Result<T, varfs::DeviceError>,
{
    loop {
        match operation() {
            Err(err) if err.should_retry() => {
                log::trace!("retrying an interrupted device call: {}", err)
            }
            other => return other,
        }
    }
}

impl<D: varfs::Device> Disk<D> {
    /// Write a whole block, bypassing the buffers.
    pub fn write_block(&self, block: u32, buffer: &[u8]) -> Result<(), varfs::DeviceError> {
        debug_assert!(block < self.block_count);
        debug_assert_eq!(buffer.len(), BLOCK_SIZE);

        retrying(|| self.inner.write_blocking(Self::block_offset(block), buffer))
    }

    /// Acquire the buffer of a block, reading its current contents from the disk. The buffer is
    /// released when dropped.
    pub fn acquire(&self, kind: BlockKind, block: u32) -> Result<BlockBuf<'_, D>, varfs::DeviceError> {
        let mut bytes = allocate_block_bytes();
        self.read_block(block, &mut bytes)?;

        Ok(self.hold(kind, block, bytes))
    }
    /// Acquire the buffer of a block without reading it, starting out zeroed. Only meant for
    /// blocks that were just allocated, whose previous contents are meaningless.
    pub fn acquire_zeroed(&self, kind: BlockKind, block: u32) -> BlockBuf<'_, D> {
        debug_assert!(block < self.block_count);

        self.hold(kind, block, allocate_block_bytes())
    }
    fn hold(&self, kind: BlockKind, block: u32, bytes: Box<[u8]>) -> BlockBuf<'_, D> {
        self.held.fetch_add(1, atomic::Ordering::AcqRel);

        BlockBuf {
            disk: self,
            kind,
            block,
            bytes,
            dirty: false,
        }
    }

    /// Wait until every block written so far has reached the device.
    pub fn sync(&self) -> Result<(), varfs::DeviceError> {
        self.inner.sync()
    }
}

/// An acquired block buffer.
///
/// Modifications are written back by [`BlockBuf::flush`] when the filesystem is mounted with the
/// `sync` option, and otherwise when the buffer is released with [`BlockBuf::release`], which
/// reports a failed write. Dropping a dirty buffer still writes it back, but can only log a
/// failure, so every path that reports success releases its buffers explicitly.
pub struct BlockBuf<'a, D: varfs::Device> {
    disk: &'a Disk<D>,
    kind: BlockKind,
    block: u32,
    bytes: Box<[u8]>,
    dirty: bool,
}

impl<'a, D: varfs::Device> BlockBuf<'a, D> {
    pub fn block(&self) -> u32 {
        self.block
    }
    pub fn kind(&self) -> BlockKind {
        self.kind
    }
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
    /// Mutable access to the buffer contents, marking the buffer dirty.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.mark_dirty();
        &mut self.bytes
    }
    /// Force the modifications of this buffer to the disk, if the filesystem writes
    /// synchronously. A failed write is not retried, neither here nor at release.
    pub fn flush(&mut self) -> Result<(), varfs::DeviceError> {
        if self.dirty && self.disk.sync {
            self.write_back()?;
        }
        Ok(())
    }
    /// Write the modifications of this buffer to the disk now, whatever the mount options. Used
    /// where later writes depend on this block being on the disk.
    pub fn write_back(&mut self) -> Result<(), varfs::DeviceError> {
        if !self.dirty {
            return Ok(());
        }
        self.dirty = false;
        log::trace!("writing back {:?} block {}", self.kind, self.block);

        self.disk.write_block(self.block, &self.bytes)
    }
    /// Release the buffer, writing back any modifications that haven't been written yet. A
    /// failed write is not retried.
    pub fn release(mut self) -> Result<(), varfs::DeviceError> {
        self.write_back()
    }
    /// Release the buffer, dropping any modifications that haven't been written yet.
    pub fn discard(mut self) {
        self.dirty = false;
    }
}

impl<D: varfs::Device> ops::Deref for BlockBuf<'_, D> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl<D: varfs::Device> Drop for BlockBuf<'_, D> {
    fn drop(&mut self) {
        if let Err(err) = self.write_back() {
            log::error!(
                "{:?} block {} couldn't be written back when dropped: {}",
                self.kind,
                self.block,
                err
            );
        }
        self.disk.held.fetch_sub(1, atomic::Ordering::AcqRel);
    }
}
