pub extern crate libc;

use std::io::{self, prelude::*};
use std::sync::{Mutex, MutexGuard};
use std::{fmt, ops};

pub struct DeviceError {
    inner: Box<dyn IoError>,
}
impl DeviceError {
    pub fn inner(&self) -> &dyn IoError {
        &*self.inner
    }
    pub fn should_retry(&self) -> bool {
        self.inner.should_retry()
    }
}
impl fmt::Debug for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}
impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.inner, f)
    }
}
impl std::error::Error for DeviceError {}

impl<E: IoError> From<E> for DeviceError {
    fn from(err: E) -> Self {
        Self {
            inner: Box::new(err),
        }
    }
}

/// A trait which allows device I/O errors to get some kind of abstraction.
pub trait IoError: fmt::Debug + fmt::Display + std::error::Error + 'static {
    /// Returns whether the operations that failed because of this error should retry. This
    /// corresponds to something like EINTR, not EAGAIN or EWOULDBLOCK.
    fn should_retry(&self) -> bool;
}

impl IoError for io::Error {
    fn should_retry(&self) -> bool {
        self.kind() == io::ErrorKind::Interrupted
    }
}

/// Information about a physical disk.
#[derive(Clone, Copy, Debug)]
pub struct DiskInfo {
    /// The size of a sector, which is the smallest unit the device can address.
    pub block_size: u64,
    pub block_count: u64,
}

impl DiskInfo {
    pub fn size(&self) -> u64 {
        self.block_size * self.block_count
    }
}

/// A readonly block device, such as the file /dev/sda, typically implemented by the frontend.
///
/// This trait doesn't require a seeking method, since all reads are supposed to be atomic (as in
/// that the seek and read call cannot be divided).
///
/// This trait only uses shared references to self, so it's up to the implementer to use locking,
/// atomic I/O if possible, or single-threaded interior mutability.
pub trait DeviceRo: fmt::Debug {
    /// Read bytes from the device at a specific offset, blocking. All bytes have to be read,
    /// unlike _read(2)_.
    ///
    /// There is no guarantee whatsoever that any offset and any size will succeed; implementations
    /// are allowed to fail if the offset is not properly aligned to a sector. Callers in this
    /// workspace only ever read whole filesystem blocks.
    fn read_blocking(&self, offset: u64, buffer: &mut [u8]) -> Result<(), DeviceError>;

    /// Retrieve the sector size and the number of sectors of the device. This method is blocking
    /// and may not return immediately.
    fn disk_info_blocking(&self) -> Result<DiskInfo, DeviceError>;
}

/// A read-write device, based on blocking system calls.
pub trait Device: DeviceRo {
    /// Write bytes to the device at a specific offset, blocking. All bytes have to be written,
    /// unlike _write(2)_.
    fn write_blocking(&self, offset: u64, buffer: &[u8]) -> Result<(), DeviceError>;

    /// Wait until previous writes have been fully written to disk.
    fn sync(&self) -> Result<(), DeviceError>;
}

/// A device backed by anything that is `Read + Seek` (and optionally `Write`), such as a regular
/// file or an in-memory cursor.
pub struct BasicDevice<D> {
    device: Mutex<D>,
}
impl<D> BasicDevice<D> {
    const BLOCK_SIZE: u64 = 512;

    pub fn new(inner: D) -> Self {
        Self {
            device: Mutex::new(inner),
        }
    }
    pub fn into_inner(self) -> D {
        // A poisoned lock still holds a usable device; the panic that poisoned it already
        // surfaced elsewhere.
        match self.device.into_inner() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
    fn lock(&self) -> io::Result<MutexGuard<'_, D>> {
        self.device
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "device lock poisoned"))
    }
}

impl<D> fmt::Debug for BasicDevice<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(device)")
    }
}

impl<D: Read + Seek> DeviceRo for BasicDevice<D> {
    fn read_blocking(&self, offset: u64, buffer: &mut [u8]) -> Result<(), DeviceError> {
        let mut guard = self.lock()?;

        let _ = guard.seek(io::SeekFrom::Start(offset))?;
        guard.read_exact(buffer)?;

        Ok(())
    }

    fn disk_info_blocking(&self) -> Result<DiskInfo, DeviceError> {
        let size = self.lock()?.seek(io::SeekFrom::End(0))?;

        Ok(DiskInfo {
            block_size: Self::BLOCK_SIZE,
            block_count: size / Self::BLOCK_SIZE,
        })
    }
}
impl<D: Read + Seek + Write> Device for BasicDevice<D> {
    fn write_blocking(&self, offset: u64, mut buffer: &[u8]) -> Result<(), DeviceError> {
        let mut guard = self.lock()?;

        let _ = guard.seek(io::SeekFrom::Start(offset))?;

        while !buffer.is_empty() {
            match guard.write(buffer) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "expected device to write all bytes",
                    )
                    .into())
                }
                Ok(n) => buffer = &buffer[n..],
                Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }
    fn sync(&self) -> Result<(), DeviceError> {
        self.lock()?.flush().map_err(Into::into)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    BadFd,
    BadFdState,
    Invalid,
    NoSpace,
    FileTooBig,
    OutOfRange,
    ReadonlyFs,
    Io,
}
impl Error {
    #[cfg(unix)]
    pub fn errno(&self) -> i32 {
        match self {
            Self::BadFd => libc::EBADF,
            Self::BadFdState => libc::EBADFD,
            Self::Invalid => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            // Reading past the last representable extent is reported the same way as writing
            // past the maximum file size.
            Self::FileTooBig | Self::OutOfRange => libc::EFBIG,
            Self::ReadonlyFs => libc::EROFS,
            Self::Io => libc::EIO,
        }
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::BadFd => write!(formatter, "bad file descriptor"),
            Error::BadFdState => write!(formatter, "bad file descriptor state"),
            Error::Invalid => write!(formatter, "invalid argument"),
            Error::NoSpace => write!(formatter, "no space left on device"),
            Error::FileTooBig => write!(formatter, "file too big"),
            Error::OutOfRange => write!(formatter, "offset out of range"),
            Error::ReadonlyFs => write!(formatter, "read-only filesystem"),
            Error::Io => write!(formatter, "i/o error"),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// General options, applying to every file of a mounted filesystem. These loosely follow the
/// options documented in mount(8).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Options {
    /// Files are writable
    pub write: bool,
    /// Every modified block is forced to the device as soon as it has been changed, rather than
    /// when its buffer is released.
    pub sync: bool,
    /// The underlying disk won't be touched at all. Implies a read-only mount.
    pub immutable: bool,
}
impl Default for Options {
    fn default() -> Self {
        Self {
            write: true,
            sync: true,
            immutable: false,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum OptionsParseError<'a> {
    UnknownOption(&'a str),
}
impl fmt::Display for OptionsParseError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let OptionsParseError::UnknownOption(option) = self;
        write!(f, "unknown option: `{}`", option)
    }
}
impl std::error::Error for OptionsParseError<'_> {}

impl Options {
    /// Parse a comma-separated option string, such as `ro,async`. Options that appear later
    /// override earlier ones.
    pub fn parse<'a>(options_str: &'a str) -> Result<Self, OptionsParseError<'a>> {
        let mut options = Self::default();

        for option in options_str.split(',') {
            match option.trim() {
                "" | "defaults" => (),
                "ro" => options.write = false,
                "rw" => options.write = true,
                "sync" => options.sync = true,
                "async" => options.sync = false,
                "immutable" => options.immutable = true,
                other => return Err(OptionsParseError::UnknownOption(other)),
            }
        }

        Ok(options)
    }
    pub fn is_writable(&self) -> bool {
        self.write && !self.immutable
    }
}

pub fn div_round_up<T>(numer: T, denom: T) -> T
where
    T: ops::Add<Output = T> + Copy + ops::Div<Output = T> + ops::Rem<Output = T> + From<u8> + PartialEq,
{
    if numer % denom != T::from(0u8) {
        numer / denom + T::from(1u8)
    } else {
        numer / denom
    }
}
