use std::cmp;

use quick_error::quick_error;

use crate::{
    allocator::BlockAllocator,
    disk::BlockKind,
    extents::{ExtentError, ExtentIndex, ExtentUsage},
    Filesystem,
};

quick_error! {
    #[derive(Debug)]
    pub enum FileIoError {
        DiskIoError(err: varfs::DeviceError) {
            from()
            description("disk i/o error")
            cause(err)
            display("disk i/o error: {}", err)
        }
        ParseError(err: scroll::Error) {
            from()
            description("extent index parsing error")
            cause(err)
            display("extent index parsing error: {}", err)
        }
        InvalidEntry(err: ExtentError) {
            description("invalid extent entry")
            cause(err)
            display("invalid extent entry: {}", err)
        }
        IndexFull {
            description("the extent index of the file is full")
        }
        NoFreeBlocks {
            description("no free blocks left to allocate")
        }
        FileTooLarge(offset: u64) {
            description("offset beyond the maximum file size")
            display("offset {} is beyond the maximum file size ({})", offset, crate::MAX_FILE_SIZE)
        }
        OutOfRange(offset: u64) {
            description("offset not covered by any entry of a full extent index")
            display("offset {} is not covered by any entry of a full extent index", offset)
        }
        SizeMismatch(size: u64, mapped: u64) {
            description("file size doesn't match its extents")
            display("file size {} doesn't match the {} bytes held by its extents", size, mapped)
        }
        Unmapped(position: usize) {
            description("file size covers an offset without a mapped extent")
            display("file size covers an offset without a mapped extent (entry {})", position)
        }
        ReadonlyFs {
            description("read-only filesystem")
        }
    }
}

impl From<ExtentError> for FileIoError {
    fn from(err: ExtentError) -> Self {
        match err {
            ExtentError::IndexFull => Self::IndexFull,
            other => Self::InvalidEntry(other),
        }
    }
}

impl FileIoError {
    pub fn is_out_of_space(&self) -> bool {
        match self {
            Self::IndexFull | Self::NoFreeBlocks => true,
            _ => false,
        }
    }
    pub fn into_varfs_error_or_with<F: Fn(Self)>(self, internal_error_handler: F) -> varfs::Error {
        match self {
            Self::IndexFull | Self::NoFreeBlocks => varfs::Error::NoSpace,
            Self::FileTooLarge(_) => varfs::Error::FileTooBig,
            Self::OutOfRange(_) => varfs::Error::OutOfRange,
            Self::ReadonlyFs => varfs::Error::ReadonlyFs,
            _ => {
                internal_error_handler(self);
                varfs::Error::Io
            }
        }
    }
}

/// The state of a single file. The size and block count are owned by the caller and persisted
/// alongside the index block number; the extents themselves live in the index block.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct FileState {
    /// The logical size of the file, in bytes. Always equal to the sum of the used sizes of its
    /// extents.
    pub size: u64,
    /// The number of data blocks referenced by the index.
    pub block_count: u32,
    /// The block holding the extent index of the file.
    pub index_block: u32,
}

impl FileState {
    pub fn new(index_block: u32) -> Self {
        Self {
            size: 0,
            block_count: 0,
            index_block,
        }
    }

    /// Read at most one extent worth of bytes, starting at `offset`. Returns zero at or past the
    /// end of the file.
    pub fn read<D: varfs::Device, A: BlockAllocator>(
        &self,
        filesystem: &Filesystem<D, A>,
        offset: u64,
        buffer: &mut [u8],
    ) -> Result<usize, FileIoError> {
        if offset >= self.size || buffer.is_empty() {
            return Ok(0);
        }

        // The index buffer is released before the data block is acquired.
        let index = filesystem.load_index(self)?.1;

        let (position, residual) = match index.find(offset) {
            Some(found) => found,
            None => return Err(FileIoError::OutOfRange(offset)),
        };
        let extent = index.get(position);

        if extent.is_unallocated() || residual >= extent.used() as u64 {
            return Err(FileIoError::Unmapped(position));
        }
        let residual = residual as usize;
        let bytes_to_read = cmp::min(buffer.len(), extent.used() - residual);

        let data = filesystem.disk.acquire(BlockKind::Data, extent.block())?;
        buffer[..bytes_to_read].copy_from_slice(&data[residual..residual + bytes_to_read]);

        Ok(bytes_to_read)
    }
    /// Read until either the buffer is full or the end of the file is reached.
    pub fn read_all<D: varfs::Device, A: BlockAllocator>(
        &self,
        filesystem: &Filesystem<D, A>,
        offset: u64,
        buffer: &mut [u8],
    ) -> Result<usize, FileIoError> {
        let mut bytes_read = 0;

        while bytes_read < buffer.len() {
            match self.read(filesystem, offset + bytes_read as u64, &mut buffer[bytes_read..])? {
                0 => break,
                n => bytes_read += n,
            }
        }
        Ok(bytes_read)
    }

    /// Free every data block of the file, leaving an empty index behind.
    pub fn truncate<D: varfs::Device, A: BlockAllocator>(
        &mut self,
        filesystem: &Filesystem<D, A>,
    ) -> Result<(), FileIoError> {
        filesystem.check_writable()?;

        let (mut index_buf, mut index) = filesystem.load_index(self)?;
        let released = index.split_off(0);
        if released.is_empty() {
            return Ok(());
        }

        // The emptied index has to be on the disk before any of its blocks can be reused.
        filesystem.store_index(&mut index_buf, &index)?;
        index_buf.release()?;

        self.size = 0;
        self.block_count = 0;
        for extent in &released {
            filesystem.allocator.free(extent.block());
        }
        log::debug!(
            "truncated the file with index block {}, releasing {} blocks",
            self.index_block,
            released.len()
        );
        Ok(())
    }

    pub fn usage<D: varfs::Device, A: BlockAllocator>(
        &self,
        filesystem: &Filesystem<D, A>,
    ) -> Result<ExtentUsage, FileIoError> {
        Ok(self.extents(filesystem)?.usage())
    }
    /// Load the extent index of the file.
    pub fn extents<D: varfs::Device, A: BlockAllocator>(
        &self,
        filesystem: &Filesystem<D, A>,
    ) -> Result<ExtentIndex, FileIoError> {
        Ok(filesystem.load_index(self)?.1)
    }
}
