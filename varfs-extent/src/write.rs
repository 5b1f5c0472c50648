use std::{cmp, error, fmt};

use crate::{
    allocator::BlockAllocator,
    disk::{BlockBuf, BlockKind},
    extents::{Extent, ExtentIndex},
    file::{FileIoError, FileState},
    Filesystem, MAX_FILE_SIZE, MAX_USED,
};

/// A write that failed after `written` bytes had already reached the file.
#[derive(Debug)]
pub struct ShortWrite {
    pub written: usize,
    pub error: FileIoError,
}

impl From<FileIoError> for ShortWrite {
    fn from(error: FileIoError) -> Self {
        Self { written: 0, error }
    }
}

impl fmt::Display for ShortWrite {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (after writing {} bytes)", self.error, self.written)
    }
}

impl error::Error for ShortWrite {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.error)
    }
}

/// The state of a single write, holding the index block of the file from the first lookup until
/// the last byte has been written.
///
/// Data blocks are released, and thereby written, before the index entries pointing at them are
/// stored. Unless the filesystem is mounted `sync`, the index block itself is only written once the
/// whole write is done, by [`Writer::finish`].
struct Writer<'a, D: varfs::Device, A> {
    filesystem: &'a Filesystem<D, A>,
    file: &'a mut FileState,
    /// The file state matching the index on the disk when the write started.
    original: FileState,
    index_buf: BlockBuf<'a, D>,
    index: ExtentIndex,
    /// Blocks allocated by this write and referenced by the in-memory index.
    allocated: Vec<u32>,
    position: usize,
    residual: u64,
}

impl<'a, D: varfs::Device, A: BlockAllocator> Writer<'a, D, A> {
    fn store_index(&mut self) -> Result<(), FileIoError> {
        self.filesystem.store_index(&mut self.index_buf, &self.index)
    }
    /// Persist a modified index, restoring the previous one if that fails.
    fn commit(&mut self, previous: ExtentIndex) -> Result<(), FileIoError> {
        if let Err(err) = self.store_index() {
            self.index = previous;
            return Err(err);
        }
        Ok(())
    }

    /// Allocate a block and append it to the index, with its first `used` bytes zeroed.
    fn append_extent(&mut self, used: usize) -> Result<(), FileIoError> {
        if self.index.is_full() {
            return Err(FileIoError::IndexFull);
        }
        let block = self.filesystem.allocate_block()?;

        if let Err(err) = self.attach_block(block, used) {
            self.filesystem.allocator.free(block);
            return Err(err);
        }
        self.allocated.push(block);
        self.file.block_count += 1;
        self.file.size += used as u64;

        Ok(())
    }
    fn attach_block(&mut self, block: u32, used: usize) -> Result<(), FileIoError> {
        let extent = Extent::new(block, used)?;

        if used > 0 {
            let mut data = self.filesystem.disk.acquire_zeroed(BlockKind::Data, block);
            data.mark_dirty();
            data.release()?;
        }

        let previous = self.index.clone();
        self.index.push(extent)?;
        self.commit(previous)
    }

    /// Zero the bytes of an extent from its current used size up to `used`, and extend it.
    fn pad(&mut self, position: usize, used: usize) -> Result<(), FileIoError> {
        let extent = self.index.get(position);
        if used <= extent.used() {
            return Ok(());
        }

        let mut data = self.filesystem.disk.acquire(BlockKind::Data, extent.block())?;
        for byte in &mut data.bytes_mut()[extent.used()..used] {
            *byte = 0;
        }
        data.release()?;

        let previous = self.index.clone();
        self.index.set(position, extent.with_used(used)?)?;
        self.commit(previous)?;

        self.file.size += (used - extent.used()) as u64;
        Ok(())
    }

    /// Walk the index to `offset`, allocating and zero-padding extents when the offset lies past
    /// the end of the file.
    ///
    /// This stops either inside an extent, or at the end of the last one, or at the position
    /// following the last extent with a residual of zero.
    fn locate(&mut self, offset: u64) -> Result<(), FileIoError> {
        let mut position = 0;
        let mut residual = offset;

        loop {
            if position == self.index.len() {
                if residual == 0 {
                    break;
                }
                self.append_extent(cmp::min(residual, MAX_USED as u64) as usize)?;
            }
            let used = self.index.get(position).used() as u64;

            if residual < used {
                break;
            }
            if position + 1 == self.index.len() {
                if residual < MAX_USED as u64 {
                    self.pad(position, residual as usize)?;
                    break;
                }
                self.pad(position, MAX_USED)?;
            }

            residual -= self.index.get(position).used() as u64;
            position += 1;
        }

        self.position = position;
        self.residual = residual;

        log::trace!(
            "offset {} of the file with index block {} is at extent {}, residual {}",
            offset,
            self.file.index_block,
            position,
            residual
        );
        Ok(())
    }

    /// Split the current extent at the residual offset, moving its tail into a new block that
    /// becomes the next extent. The write then continues at the start of the tail.
    fn split(&mut self) -> Result<(), FileIoError> {
        if self.index.is_full() {
            return Err(FileIoError::IndexFull);
        }
        let extent = self.index.get(self.position);
        let residual = self.residual as usize;
        let tail_block = self.filesystem.allocate_block()?;

        if let Err(err) = self.attach_tail(extent, residual, tail_block) {
            self.filesystem.allocator.free(tail_block);
            return Err(err);
        }
        self.allocated.push(tail_block);
        self.file.block_count += 1;

        log::debug!(
            "split the extent at block {} after {} of {} bytes, tail moved to block {}",
            extent.block(),
            residual,
            extent.used(),
            tail_block
        );

        self.position += 1;
        self.residual = 0;
        Ok(())
    }
    fn attach_tail(&mut self, extent: Extent, residual: usize, tail_block: u32) -> Result<(), FileIoError> {
        let head = extent.with_used(residual)?;
        let tail = Extent::new(tail_block, extent.used() - residual)?;

        {
            let source = self.filesystem.disk.acquire(BlockKind::Data, extent.block())?;
            let mut target = self.filesystem.disk.acquire_zeroed(BlockKind::Data, tail_block);

            target.bytes_mut()[..tail.used()].copy_from_slice(&source[residual..extent.used()]);
            target.release()?;
        }

        let previous = self.index.clone();
        self.index.set(self.position, head)?;
        self.index.insert(self.position + 1, tail)?;
        self.commit(previous)
    }

    /// Write as much of `bytes` as fits into the current extent, allocating it if the end of the
    /// index has been reached. Only the last extent can grow; any other extent is overwritten
    /// within its used range.
    fn fill_extent(&mut self, bytes: &[u8]) -> Result<usize, FileIoError> {
        let fresh = self.position == self.index.len();
        if fresh {
            self.append_extent(0)?;
        }

        let extent = self.index.get(self.position);
        let residual = self.residual as usize;
        let capacity = if self.position + 1 == self.index.len() {
            MAX_USED - residual
        } else {
            extent.used() - residual
        };
        let to_write = cmp::min(bytes.len(), capacity);

        if to_write > 0 {
            let mut data = if fresh {
                self.filesystem.disk.acquire_zeroed(BlockKind::Data, extent.block())
            } else {
                self.filesystem.disk.acquire(BlockKind::Data, extent.block())?
            };
            data.bytes_mut()[residual..residual + to_write].copy_from_slice(&bytes[..to_write]);
            data.release()?;
        }

        let used = cmp::max(extent.used(), residual + to_write);
        if used != extent.used() {
            let previous = self.index.clone();
            self.index.set(self.position, extent.with_used(used)?)?;
            self.commit(previous)?;

            self.file.size += (used - extent.used()) as u64;
        }

        self.position += 1;
        self.residual = 0;

        Ok(to_write)
    }
    fn fill(&mut self, bytes: &[u8]) -> Result<usize, ShortWrite> {
        let mut written = 0;

        while written < bytes.len() {
            match self.fill_extent(&bytes[written..]) {
                Ok(bytes_written) => written += bytes_written,
                Err(error) => {
                    if error.is_out_of_space() {
                        log::debug!("out of space after writing {} bytes: {}", written, error);
                    }
                    return Err(ShortWrite { written, error });
                }
            }
        }
        Ok(written)
    }
    fn run(&mut self, offset: u64, bytes: &[u8]) -> Result<usize, ShortWrite> {
        self.locate(offset)?;

        let used = self.index.get(self.position).used() as u64;
        if self.residual > 0 && self.residual < used {
            self.split()?;
        }

        self.fill(bytes)
    }

    /// Release the index block, writing it back if it is still dirty.
    ///
    /// If that fails, the index on the disk is still the one the write started from: the file
    /// state is restored to match it, and the blocks this write allocated are freed again.
    fn finish(self, result: Result<usize, ShortWrite>) -> Result<usize, ShortWrite> {
        let Writer {
            filesystem,
            file,
            original,
            index_buf,
            allocated,
            ..
        } = self;

        let err = match index_buf.release() {
            Ok(()) => return result,
            Err(err) => err,
        };
        log::debug!(
            "index block {} couldn't be written back, dropping the write: {}",
            file.index_block,
            err
        );

        *file = original;
        for block in allocated {
            filesystem.allocator.free(block);
        }

        Err(ShortWrite {
            written: 0,
            error: match result {
                Ok(_) => err.into(),
                Err(ShortWrite { error, .. }) => error,
            },
        })
    }
}

impl FileState {
    /// Write bytes at `offset`, or at the end of the file when appending. Existing bytes are
    /// overwritten, and writing past the end of the file fills the gap with zeros.
    ///
    /// If an error occurs after some bytes have been written, the error carries the number of
    /// bytes that made it to the file.
    pub fn write<D: varfs::Device, A: BlockAllocator>(
        &mut self,
        filesystem: &Filesystem<D, A>,
        offset: u64,
        buffer: &[u8],
        append: bool,
    ) -> Result<usize, ShortWrite> {
        let offset = if append { self.size } else { offset };

        if offset >= MAX_FILE_SIZE {
            return Err(FileIoError::FileTooLarge(offset).into());
        }
        if buffer.is_empty() {
            return Ok(0);
        }
        filesystem.check_writable()?;

        let (index_buf, index) = filesystem.load_index(self)?;
        let mut writer = Writer {
            filesystem,
            original: *self,
            file: self,
            index_buf,
            index,
            allocated: Vec::new(),
            position: 0,
            residual: 0,
        };

        let result = writer.run(offset, buffer);
        writer.finish(result)
    }
}
