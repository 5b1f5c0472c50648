use std::sync::atomic::{self, AtomicU64};

use bitflags::bitflags;
use chashmap::CHashMap;

pub mod allocator;
pub mod defrag;
pub mod disk;
pub mod extents;
pub mod file;
pub mod write;

pub use allocator::{BitmapAllocator, BlockAllocator};
pub use disk::{BlockBuf, BlockKind, Disk};
pub use extents::{Extent, ExtentIndex, ExtentUsage};
pub use file::{FileIoError, FileState};
pub use write::ShortWrite;

/// The size of every block, both data blocks and extent index blocks.
pub const BLOCK_SIZE: usize = 4096;

/// The number of extents an index block can hold.
pub const INDEX_CAPACITY: usize = BLOCK_SIZE / extents::ENTRY_SIZE;

/// The largest number of bytes a single extent can hold. The last byte of every block is never
/// used.
pub const MAX_USED: usize = BLOCK_SIZE - 1;

/// The largest possible file, with every extent of a full index filled.
pub const MAX_FILE_SIZE: u64 = (INDEX_CAPACITY * MAX_USED) as u64;

pub fn allocate_block_bytes() -> Box<[u8]> {
    vec![0u8; BLOCK_SIZE].into_boxed_slice()
}

trait ConvertToVarfsError<T> {
    fn into_varfs_result(self, warning_start: &'static str) -> varfs::Result<T>;
}
impl<T> ConvertToVarfsError<T> for Result<T, FileIoError> {
    fn into_varfs_result(self, warning_start: &'static str) -> varfs::Result<T> {
        self.map_err(|err| {
            err.into_varfs_error_or_with(|err| {
                log::warn!("{}, because of an internal error: {}", warning_start, err)
            })
        })
    }
}

bitflags! {
    /// The ways a file handle can be used, given when the file is opened.
    pub struct OpenFlags: u32 {
        /// The file can be written to through the handle.
        const WRITE = 0x1;
        /// Every write goes to the end of the file, regardless of the offset it was given.
        const APPEND = 0x2;
        /// Discard the contents of the file when it is opened for writing.
        const TRUNCATE = 0x4;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHandle {
    fh: u64,
    offset: u64,
    flags: OpenFlags,
    file: FileState,
}

pub struct Filesystem<D, A = BitmapAllocator> {
    pub disk: Disk<D>,
    pub allocator: A,
    pub general_options: varfs::Options,
    pub(crate) fhs: CHashMap<u64, FileHandle>,
    pub(crate) last_fh: AtomicU64,
}

impl<D: varfs::Device> Filesystem<D> {
    /// Mount a device, tracking free blocks in memory. Every block but block 0 starts out free.
    pub fn mount(device: D, general_options: varfs::Options) -> Result<Self, FileIoError> {
        let disk = Disk::new(device, &general_options)?;
        let allocator = BitmapAllocator::new(disk.block_count());

        Ok(Self::from_parts(disk, allocator, general_options))
    }
}

impl<D: varfs::Device, A: BlockAllocator> Filesystem<D, A> {
    /// Mount a device, with block allocation left to an allocator of the enclosing filesystem.
    pub fn with_allocator(
        device: D,
        allocator: A,
        general_options: varfs::Options,
    ) -> Result<Self, FileIoError> {
        let disk = Disk::new(device, &general_options)?;

        Ok(Self::from_parts(disk, allocator, general_options))
    }
    fn from_parts(disk: Disk<D>, allocator: A, general_options: varfs::Options) -> Self {
        log::debug!(
            "mounted a {} block device ({} free) with {:?}",
            disk.block_count(),
            allocator.free_count(),
            general_options
        );

        Self {
            disk,
            allocator,
            general_options,
            fhs: CHashMap::new(),
            last_fh: AtomicU64::new(0),
        }
    }
    /// Unmount the filesystem, returning the device. Handles that are still open are dropped,
    /// and so are their file states.
    pub fn unmount(self) -> Result<D, FileIoError> {
        if !self.fhs.is_empty() {
            log::warn!("unmounting with {} open file handles", self.fhs.len());
        }
        self.sync()?;

        Ok(self.disk.into_inner())
    }
    pub fn sync(&self) -> Result<(), FileIoError> {
        if !self.general_options.immutable {
            self.disk.sync()?;
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> Result<(), FileIoError> {
        if self.general_options.is_writable() {
            Ok(())
        } else {
            Err(FileIoError::ReadonlyFs)
        }
    }
    pub(crate) fn allocate_block(&self) -> Result<u32, FileIoError> {
        self.allocator.allocate().ok_or(FileIoError::NoFreeBlocks)
    }
    pub(crate) fn load_index(
        &self,
        file: &FileState,
    ) -> Result<(BlockBuf<'_, D>, ExtentIndex), FileIoError> {
        let buffer = self.disk.acquire(BlockKind::Index, file.index_block)?;
        let index = ExtentIndex::parse(&buffer)?;

        Ok((buffer, index))
    }
    pub(crate) fn store_index(
        &self,
        buffer: &mut BlockBuf<'_, D>,
        index: &ExtentIndex,
    ) -> Result<(), FileIoError> {
        ExtentIndex::serialize(index, buffer.bytes_mut())?;
        buffer.flush()?;
        Ok(())
    }

    /// Allocate the index block of a new, empty file.
    pub fn create_file(&self) -> Result<FileState, FileIoError> {
        self.check_writable()?;

        let index_block = self.allocate_block()?;
        let mut buffer = self.disk.acquire_zeroed(BlockKind::Index, index_block);
        buffer.mark_dirty();

        if let Err(err) = buffer.release() {
            self.allocator.free(index_block);
            return Err(err.into());
        }
        log::debug!("created a file with index block {}", index_block);

        Ok(FileState::new(index_block))
    }
    /// Free every block of a file, including its index block.
    pub fn remove_file(&self, mut file: FileState) -> Result<(), FileIoError> {
        file.truncate(self)?;
        self.allocator.free(file.index_block);

        log::debug!("removed the file with index block {}", file.index_block);
        Ok(())
    }

    /// Open a file, handing its state over to the filesystem until it is closed.
    pub fn open_file(&self, mut file: FileState, flags: OpenFlags) -> varfs::Result<u64> {
        if flags.contains(OpenFlags::WRITE) {
            if !self.general_options.is_writable() {
                return Err(varfs::Error::ReadonlyFs);
            }
            if flags.contains(OpenFlags::TRUNCATE) {
                file.truncate(self)
                    .into_varfs_result("File couldn't be truncated when opened")?;
            }
        }

        let fh = self.last_fh.fetch_add(1, atomic::Ordering::Relaxed);

        self.fhs.insert(
            fh,
            FileHandle {
                fh,
                offset: 0,
                flags,
                file,
            },
        );

        Ok(fh)
    }
    /// Close a file handle, giving back the file state for the caller to persist.
    pub fn close(&self, fh: u64) -> varfs::Result<FileState> {
        match self.fhs.remove(&fh) {
            Some(handle) => {
                log::trace!("closed file handle {} at offset {}", handle.fh, handle.offset);
                Ok(handle.file)
            }
            None => Err(varfs::Error::BadFd),
        }
    }
    pub fn fh_offset(&self, fh: u64) -> varfs::Result<u64> {
        match self.fhs.get(&fh) {
            Some(handle) => Ok(handle.offset),
            None => Err(varfs::Error::BadFd),
        }
    }
    /// Move the offset of a handle. Offsets past the largest possible file are invalid.
    pub fn set_fh_offset(&self, fh: u64, offset: u64) -> varfs::Result<()> {
        if offset > MAX_FILE_SIZE {
            return Err(varfs::Error::Invalid);
        }
        match self.fhs.get_mut(&fh) {
            Some(mut handle) => {
                handle.offset = offset;
                Ok(())
            }
            None => Err(varfs::Error::BadFd),
        }
    }
    pub fn fh_file(&self, fh: u64) -> varfs::Result<FileState> {
        match self.fhs.get(&fh) {
            Some(handle) => Ok(handle.file),
            None => Err(varfs::Error::BadFd),
        }
    }

    /// Read bytes from a file. At most one extent is read, so fewer bytes than requested may be
    /// returned even before the end of the file.
    pub fn read(&self, fh: u64, offset: u64, buffer: &mut [u8]) -> varfs::Result<usize> {
        let mut handle = self.fhs.get_mut(&fh).ok_or(varfs::Error::BadFd)?;

        let bytes_read = handle
            .file
            .read(self, offset, buffer)
            .into_varfs_result("File couldn't be read")?;

        handle.offset = offset + bytes_read as u64;

        Ok(bytes_read)
    }
    /// Write bytes to a file. If only part of the bytes could be written before an error
    /// occurred, the number of bytes written is returned and the error is logged.
    pub fn write(&self, fh: u64, offset: u64, buffer: &[u8]) -> varfs::Result<usize> {
        let mut handle = self.fhs.get_mut(&fh).ok_or(varfs::Error::BadFd)?;

        if !handle.flags.contains(OpenFlags::WRITE) {
            return Err(varfs::Error::BadFdState);
        }
        let append = handle.flags.contains(OpenFlags::APPEND);
        let offset = if append { handle.file.size } else { offset };

        let bytes_written = match handle.file.write(self, offset, buffer, append) {
            Ok(bytes_written) => bytes_written,
            Err(ShortWrite { written, error }) if written > 0 => {
                log::debug!("short write of {} out of {} bytes: {}", written, buffer.len(), error);
                written
            }
            Err(ShortWrite { error, .. }) => {
                return Err::<usize, _>(error).into_varfs_result("File couldn't be written to")
            }
        };

        handle.offset = offset + bytes_written as u64;

        Ok(bytes_written)
    }
    pub fn defragment(&self, fh: u64) -> varfs::Result<()> {
        let mut handle = self.fhs.get_mut(&fh).ok_or(varfs::Error::BadFd)?;

        handle
            .file
            .defragment(self)
            .into_varfs_result("File couldn't be defragmented")
    }
    pub fn usage(&self, fh: u64) -> varfs::Result<ExtentUsage> {
        let handle = self.fhs.get(&fh).ok_or(varfs::Error::BadFd)?;

        handle
            .file
            .usage(self)
            .into_varfs_result("Extent usage couldn't be computed")
    }
    /// List the extents of a file, logging each one of them.
    pub fn list_extents(&self, fh: u64) -> varfs::Result<Vec<Extent>> {
        let handle = self.fhs.get(&fh).ok_or(varfs::Error::BadFd)?;

        let index = handle
            .file
            .extents(self)
            .into_varfs_result("Extents couldn't be listed")?;

        for (position, (block, used)) in index.pairs().enumerate() {
            log::info!("extent {}: block {}, {} bytes used", position, block, used);
        }
        Ok(index.iter().collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    use rand::{rngs::StdRng, Rng, SeedableRng};
    use varfs::{Device, DeviceRo};

    pub type MemoryDevice = varfs::BasicDevice<io::Cursor<Vec<u8>>>;

    pub fn memory_device(blocks: u32) -> MemoryDevice {
        let _ = env_logger::try_init();

        varfs::BasicDevice::new(io::Cursor::new(vec![0u8; blocks as usize * BLOCK_SIZE]))
    }
    pub fn filesystem(blocks: u32) -> Filesystem<MemoryDevice> {
        Filesystem::mount(memory_device(blocks), varfs::Options::default()).unwrap()
    }

    /// Random test data, the same for every run with the same seed.
    pub fn pattern(len: usize, seed: u32) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        StdRng::seed_from_u64(u64::from(seed)).fill(&mut bytes[..]);
        bytes
    }

    /// Read the whole logical contents of a file.
    pub fn contents<D: varfs::Device, A: BlockAllocator>(
        filesystem: &Filesystem<D, A>,
        file: &FileState,
    ) -> Vec<u8> {
        let mut buffer = vec![0u8; file.size as usize];
        assert_eq!(file.read_all(filesystem, 0, &mut buffer).unwrap(), buffer.len());
        buffer
    }

    /// Check that the index, the file state and the allocator agree with each other, and that
    /// no buffer has been leaked.
    pub fn check_consistency<D: varfs::Device>(filesystem: &Filesystem<D>, file: &FileState) {
        let index = file.extents(filesystem).unwrap();

        assert_eq!(index.total_used(), file.size);
        assert_eq!(index.len(), file.block_count as usize);

        let mut blocks = index.iter().map(Extent::block).collect::<Vec<_>>();
        blocks.push(file.index_block);
        blocks.sort();
        blocks.dedup();
        assert_eq!(blocks.len(), index.len() + 1);
        assert!(blocks.iter().all(|&block| filesystem.allocator.is_allocated(block)));

        assert_eq!(filesystem.disk.held_buffers(), 0);
    }

    /// A device that starts failing every access once told to.
    #[derive(Debug)]
    pub struct FaultyDevice {
        inner: MemoryDevice,
        fail_reads: AtomicBool,
        writes_left: AtomicUsize,
    }

    impl FaultyDevice {
        pub fn new(blocks: u32) -> Self {
            Self {
                inner: memory_device(blocks),
                fail_reads: AtomicBool::new(false),
                writes_left: AtomicUsize::new(usize::max_value()),
            }
        }
        pub fn fail_reads(&self, fail: bool) {
            self.fail_reads.store(fail, atomic::Ordering::SeqCst);
        }
        /// Let `count` more writes succeed, and fail every write after them.
        pub fn fail_writes_after(&self, count: usize) {
            self.writes_left.store(count, atomic::Ordering::SeqCst);
        }
        fn injected() -> varfs::DeviceError {
            io::Error::new(io::ErrorKind::Other, "injected failure").into()
        }
    }

    impl DeviceRo for FaultyDevice {
        fn read_blocking(&self, offset: u64, buffer: &mut [u8]) -> Result<(), varfs::DeviceError> {
            if self.fail_reads.load(atomic::Ordering::SeqCst) {
                return Err(Self::injected());
            }
            self.inner.read_blocking(offset, buffer)
        }
        fn disk_info_blocking(&self) -> Result<varfs::DiskInfo, varfs::DeviceError> {
            self.inner.disk_info_blocking()
        }
    }
    impl Device for FaultyDevice {
        fn write_blocking(&self, offset: u64, buffer: &[u8]) -> Result<(), varfs::DeviceError> {
            let allowed = self
                .writes_left
                .fetch_update(atomic::Ordering::SeqCst, atomic::Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok();

            if !allowed {
                return Err(Self::injected());
            }
            self.inner.write_blocking(offset, buffer)
        }
        fn sync(&self) -> Result<(), varfs::DeviceError> {
            self.inner.sync()
        }
    }

    fn read_through_handle(filesystem: &Filesystem<MemoryDevice>, fh: u64, len: usize) -> Vec<u8> {
        let mut buffer = vec![0u8; len];
        let mut done = 0;

        while done < len {
            let offset = filesystem.fh_offset(fh).unwrap();
            let bytes_read = filesystem.read(fh, offset, &mut buffer[done..]).unwrap();
            assert_ne!(bytes_read, 0);
            done += bytes_read;
        }
        buffer
    }

    #[test]
    fn handles() {
        let filesystem = filesystem(64);
        let file = filesystem.create_file().unwrap();

        let fh = filesystem.open_file(file, OpenFlags::WRITE).unwrap();
        let data = pattern(10_000, 1);

        assert_eq!(filesystem.write(fh, 0, &data).unwrap(), data.len());
        assert_eq!(filesystem.fh_offset(fh).unwrap(), data.len() as u64);

        filesystem.set_fh_offset(fh, 0).unwrap();
        assert_eq!(read_through_handle(&filesystem, fh, data.len()), data);

        let mut buffer = [0u8; 16];
        assert_eq!(filesystem.read(fh, data.len() as u64, &mut buffer).unwrap(), 0);

        assert_eq!(filesystem.usage(fh).unwrap().used_blocks, 3);
        assert_eq!(filesystem.list_extents(fh).unwrap().len(), 3);

        let file = filesystem.close(fh).unwrap();
        assert_eq!(file.size, data.len() as u64);
        check_consistency(&filesystem, &file);
    }

    #[test]
    fn bad_handles() {
        let filesystem = filesystem(8);
        let file = filesystem.create_file().unwrap();

        let mut buffer = [0u8; 4];
        assert_eq!(filesystem.read(7, 0, &mut buffer), Err(varfs::Error::BadFd));
        assert_eq!(filesystem.write(7, 0, b"data"), Err(varfs::Error::BadFd));
        assert_eq!(filesystem.defragment(7), Err(varfs::Error::BadFd));
        assert_eq!(filesystem.usage(7), Err(varfs::Error::BadFd));
        assert_eq!(filesystem.fh_offset(7), Err(varfs::Error::BadFd));

        let fh = filesystem.open_file(file, OpenFlags::empty()).unwrap();
        assert_eq!(filesystem.set_fh_offset(fh, MAX_FILE_SIZE + 1), Err(varfs::Error::Invalid));
        filesystem.set_fh_offset(fh, MAX_FILE_SIZE).unwrap();
        assert_eq!(filesystem.write(fh, 0, b"data"), Err(varfs::Error::BadFdState));

        filesystem.close(fh).unwrap();
        assert_eq!(filesystem.close(fh), Err(varfs::Error::BadFd));
    }

    #[test]
    fn append_handle() {
        let filesystem = filesystem(16);
        let file = filesystem.create_file().unwrap();
        let fh = filesystem
            .open_file(file, OpenFlags::WRITE | OpenFlags::APPEND)
            .unwrap();

        filesystem.write(fh, 0, b"first").unwrap();
        // The offset is ignored when appending.
        filesystem.write(fh, 0, b" second").unwrap();
        assert_eq!(filesystem.fh_offset(fh).unwrap(), 12);

        let file = filesystem.close(fh).unwrap();
        assert_eq!(contents(&filesystem, &file), b"first second");
    }

    #[test]
    fn truncate_on_open() {
        let filesystem = filesystem(16);
        let mut file = filesystem.create_file().unwrap();
        file.write(&filesystem, 0, &pattern(9000, 2), false).unwrap();
        assert_eq!(filesystem.allocator.free_count(), 15 - 4);

        // Truncation requires write access.
        let fh = filesystem.open_file(file, OpenFlags::TRUNCATE).unwrap();
        let file = filesystem.close(fh).unwrap();
        assert_eq!(file.size, 9000);

        let fh = filesystem
            .open_file(file, OpenFlags::WRITE | OpenFlags::TRUNCATE)
            .unwrap();
        let file = filesystem.fh_file(fh).unwrap();
        assert_eq!((file.size, file.block_count), (0, 0));
        assert_eq!(filesystem.allocator.free_count(), 15 - 1);
        check_consistency(&filesystem, &file);
    }

    #[test]
    fn short_write_through_handle() {
        let filesystem = filesystem(4);
        let file = filesystem.create_file().unwrap();
        let fh = filesystem.open_file(file, OpenFlags::WRITE).unwrap();

        // Only two data blocks are left.
        let data = pattern(3 * MAX_USED, 3);
        assert_eq!(filesystem.write(fh, 0, &data).unwrap(), 2 * MAX_USED);
        assert_eq!(filesystem.write(fh, 2 * MAX_USED as u64, &data), Err(varfs::Error::NoSpace));
        assert_eq!(
            filesystem.write(fh, MAX_FILE_SIZE, b"x"),
            Err(varfs::Error::FileTooBig)
        );

        let file = filesystem.close(fh).unwrap();
        assert_eq!(contents(&filesystem, &file), &data[..2 * MAX_USED]);
    }

    #[test]
    fn read_only_mount() {
        let device = memory_device(8);
        let filesystem = Filesystem::mount(device, varfs::Options::default()).unwrap();
        let mut file = filesystem.create_file().unwrap();
        file.write(&filesystem, 0, b"persisted", false).unwrap();

        let device = filesystem.unmount().unwrap();
        let options = varfs::Options::parse("ro").unwrap();
        let filesystem = Filesystem::with_allocator(device, BitmapAllocator::new(8), options).unwrap();

        assert_eq!(
            filesystem.open_file(file, OpenFlags::WRITE),
            Err(varfs::Error::ReadonlyFs)
        );
        assert!(matches!(filesystem.create_file(), Err(FileIoError::ReadonlyFs)));
        assert!(matches!(
            file.write(&filesystem, 0, b"x", false),
            Err(ShortWrite { written: 0, error: FileIoError::ReadonlyFs })
        ));

        let fh = filesystem.open_file(file, OpenFlags::empty()).unwrap();
        assert_eq!(read_through_handle(&filesystem, fh, 9), b"persisted");
    }

    #[test]
    fn internal_errors_map_to_io() {
        let filesystem = Filesystem::mount(FaultyDevice::new(8), varfs::Options::default()).unwrap();
        let file = filesystem.create_file().unwrap();
        let fh = filesystem.open_file(file, OpenFlags::WRITE).unwrap();

        filesystem.disk.inner().fail_writes_after(0);
        assert_eq!(filesystem.write(fh, 0, b"data"), Err(varfs::Error::Io));

        filesystem.disk.inner().fail_reads(true);
        assert_eq!(filesystem.usage(fh), Err(varfs::Error::Io));
        assert_eq!(filesystem.disk.held_buffers(), 0);
    }

    #[test]
    fn create_and_remove() {
        let filesystem = filesystem(8);
        assert_eq!(filesystem.allocator.free_count(), 7);

        let mut file = filesystem.create_file().unwrap();
        file.write(&filesystem, 0, &pattern(5000, 4), false).unwrap();
        assert_eq!(filesystem.allocator.free_count(), 4);

        filesystem.remove_file(file).unwrap();
        assert_eq!(filesystem.allocator.free_count(), 7);
    }

    #[test]
    fn asynchronous_create() {
        let options = varfs::Options::parse("async").unwrap();
        let filesystem = Filesystem::mount(FaultyDevice::new(8), options).unwrap();
        filesystem.disk.inner().fail_writes_after(0);

        assert!(matches!(filesystem.create_file(), Err(FileIoError::DiskIoError(_))));
        assert_eq!(filesystem.allocator.free_count(), 7);
    }

    #[test]
    fn failed_create_frees_the_index_block() {
        let filesystem = Filesystem::mount(FaultyDevice::new(8), varfs::Options::default()).unwrap();
        filesystem.disk.inner().fail_writes_after(0);

        assert!(matches!(filesystem.create_file(), Err(FileIoError::DiskIoError(_))));
        assert_eq!(filesystem.allocator.free_count(), 7);
        assert_eq!(filesystem.disk.held_buffers(), 0);
    }
}
