use std::fmt;

use arrayvec::ArrayVec;
use quick_error::quick_error;
use scroll::{Pread, Pwrite};

use crate::{INDEX_CAPACITY, MAX_USED};

pub mod usage;

pub use usage::ExtentUsage;

/// The number of low bits of an entry holding the physical block number.
pub const BLOCK_NUMBER_BITS: u32 = 20;

/// The number of high bits of an entry holding the used size.
pub const USED_SIZE_BITS: u32 = 12;

/// The exclusive upper bound of block numbers that an extent can refer to.
pub const MAX_BLOCKS: u32 = 1 << BLOCK_NUMBER_BITS;

const BLOCK_NUMBER_MASK: u32 = MAX_BLOCKS - 1;

/// The size of a single packed entry.
pub const ENTRY_SIZE: usize = 4;

quick_error! {
    #[derive(Debug, PartialEq, Eq)]
    pub enum ExtentError {
        BlockOutOfRange(block: u32) {
            description("block number cannot be stored in an extent entry")
            display("block number {} cannot be stored in an extent entry (must be within 1..{})", block, MAX_BLOCKS)
        }
        UsedOutOfRange(used: usize) {
            description("used size exceeds the usable capacity of a block")
            display("used size {} exceeds the usable capacity of a block ({})", used, MAX_USED)
        }
        IndexFull {
            description("the extent index has no free entry left")
        }
        PositionOutOfBounds(position: usize, len: usize) {
            description("extent position out of bounds")
            display("extent position {} out of bounds, the index holds {} extents", position, len)
        }
    }
}

/// A single entry of an extent index: a physical block, together with the number of bytes at the
/// start of that block that hold file data.
///
/// On disk, an entry is a 32-bit word with the used size in the upper 12 bits and the block
/// number in the lower 20 bits. A word of zero terminates the index.
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct Extent {
    raw: u32,
}

impl Extent {
    /// The terminating entry, referring to no block at all.
    pub const UNALLOCATED: Self = Self { raw: 0 };

    pub fn new(block: u32, used: usize) -> Result<Self, ExtentError> {
        if block == 0 || block >= MAX_BLOCKS {
            return Err(ExtentError::BlockOutOfRange(block));
        }
        if used > MAX_USED {
            return Err(ExtentError::UsedOutOfRange(used));
        }
        Ok(Self {
            raw: (used as u32) << BLOCK_NUMBER_BITS | block,
        })
    }
    pub fn decode(raw: u32) -> Self {
        Self { raw }
    }
    pub fn encode(self) -> u32 {
        self.raw
    }
    pub fn block(self) -> u32 {
        self.raw & BLOCK_NUMBER_MASK
    }
    /// The number of bytes at the start of the block that belong to the file.
    pub fn used(self) -> usize {
        (self.raw >> BLOCK_NUMBER_BITS) as usize
    }
    /// The number of bytes that can still be appended to this extent.
    pub fn spare(self) -> usize {
        MAX_USED - self.used()
    }
    pub fn is_unallocated(self) -> bool {
        self.raw == 0
    }
    pub fn is_full(self) -> bool {
        self.used() == MAX_USED
    }
    pub fn with_used(self, used: usize) -> Result<Self, ExtentError> {
        Self::new(self.block(), used)
    }
}

impl fmt::Debug for Extent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Extent")
            .field("block", &self.block())
            .field("used", &self.used())
            .finish()
    }
}

/// The ordered list of extents of a file, stored in a block of its own.
///
/// Extent `i` holds the bytes that immediately follow those held by extents `0..i`, so the
/// logical offset of any extent is the sum of the used sizes before it. The list is bounded by
/// the number of entries that fit in one block, and never contains unallocated entries; the
/// terminating zero only exists in the serialized form.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExtentIndex {
    extents: ArrayVec<[Extent; INDEX_CAPACITY]>,
}

impl ExtentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the index from the raw bytes of an index block.
    pub fn parse(bytes: &[u8]) -> Result<Self, scroll::Error> {
        let mut extents = ArrayVec::new();
        let mut offset = 0;
        let mut terminated = false;

        for _ in 0..INDEX_CAPACITY {
            let extent = Extent::decode(bytes.gread_with(&mut offset, scroll::LE)?);

            if extent.is_unallocated() {
                terminated = true;
                continue;
            }
            if terminated {
                return Err(scroll::Error::BadInput {
                    size: ENTRY_SIZE,
                    msg: "allocated extent after the end of the index",
                });
            }
            if extent.block() == 0 {
                return Err(scroll::Error::BadInput {
                    size: ENTRY_SIZE,
                    msg: "extent with a used size but without a block",
                });
            }
            extents.push(extent);
        }

        Ok(Self { extents })
    }
    /// Write the index into the raw bytes of an index block, zeroing every unused entry.
    pub fn serialize(this: &Self, bytes: &mut [u8]) -> Result<(), scroll::Error> {
        let mut offset = 0;

        for position in 0..INDEX_CAPACITY {
            bytes.gwrite_with(this.get(position).encode(), &mut offset, scroll::LE)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }
    pub fn is_full(&self) -> bool {
        self.extents.is_full()
    }
    /// Get the extent at `position`, or the unallocated entry past the end of the list.
    pub fn get(&self, position: usize) -> Extent {
        self.extents
            .get(position)
            .copied()
            .unwrap_or(Extent::UNALLOCATED)
    }
    pub fn set(&mut self, position: usize, extent: Extent) -> Result<(), ExtentError> {
        let len = self.len();

        match self.extents.get_mut(position) {
            Some(slot) => {
                *slot = extent;
                Ok(())
            }
            None => Err(ExtentError::PositionOutOfBounds(position, len)),
        }
    }
    pub fn push(&mut self, extent: Extent) -> Result<(), ExtentError> {
        self.extents
            .try_push(extent)
            .map_err(|_| ExtentError::IndexFull)
    }
    pub fn pop(&mut self) -> Option<Extent> {
        self.extents.pop()
    }
    /// Insert an extent at `position`, shifting every later extent one entry to the right.
    pub fn insert(&mut self, position: usize, extent: Extent) -> Result<(), ExtentError> {
        if position > self.len() {
            return Err(ExtentError::PositionOutOfBounds(position, self.len()));
        }
        self.extents
            .try_insert(position, extent)
            .map_err(|_| ExtentError::IndexFull)
    }
    /// Remove the extent at `position`, shifting every later extent one entry to the left.
    pub fn remove(&mut self, position: usize) -> Result<Extent, ExtentError> {
        if position >= self.len() {
            return Err(ExtentError::PositionOutOfBounds(position, self.len()));
        }
        Ok(self.extents.remove(position))
    }
    /// Remove every extent from `position` onwards, returning them in order.
    pub fn split_off(&mut self, position: usize) -> Vec<Extent> {
        if position >= self.len() {
            return Vec::new();
        }
        self.extents.drain(position..).collect()
    }
    pub fn iter(&self) -> impl Iterator<Item = Extent> + '_ {
        self.extents.iter().copied()
    }
    /// The number of file bytes held by all extents together.
    pub fn total_used(&self) -> u64 {
        self.iter().map(|extent| extent.used() as u64).sum()
    }

    /// Resolve a logical offset into the position of the extent holding it, and the offset
    /// within that extent.
    ///
    /// The walk stops at the first extent whose used range contains the offset. The last extent
    /// is landed on regardless of its size, so offsets at or past the end of the file resolve to
    /// it (or to position 0 for an empty index). `None` is returned when every entry of a full
    /// index has been walked without finding the offset.
    pub fn find(&self, offset: u64) -> Option<(usize, u64)> {
        let mut residual = offset;

        for position in 0..INDEX_CAPACITY {
            let used = self.get(position).used() as u64;
            let next_is_terminator =
                position + 1 < INDEX_CAPACITY && self.get(position + 1).is_unallocated();

            if residual < used || next_is_terminator {
                return Some((position, residual));
            }
            residual -= used;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::BLOCK_SIZE;

    fn index_of(extents: &[(u32, usize)]) -> ExtentIndex {
        let mut index = ExtentIndex::new();
        for &(block, used) in extents {
            index.push(Extent::new(block, used).unwrap()).unwrap();
        }
        index
    }

    #[test]
    fn packing() {
        let extent = Extent::new(0xABCDE, 4095).unwrap();
        assert_eq!(extent.encode(), 0xFFFA_BCDE);
        assert_eq!(extent.block(), 0xABCDE);
        assert_eq!(extent.used(), 4095);
        assert!(extent.is_full());
        assert_eq!(extent.spare(), 0);

        let extent = Extent::decode(10 << 20 | 7);
        assert_eq!((extent.block(), extent.used()), (7, 10));
        assert_eq!(extent.spare(), MAX_USED - 10);

        // A block without any data is still allocated.
        let extent = Extent::new(1, 0).unwrap();
        assert!(!extent.is_unallocated());
        assert_eq!(extent.encode(), 1);
        assert!(Extent::UNALLOCATED.is_unallocated());
    }

    #[test]
    fn packing_limits() {
        assert_eq!(Extent::new(0, 10), Err(ExtentError::BlockOutOfRange(0)));
        assert_eq!(
            Extent::new(MAX_BLOCKS, 10),
            Err(ExtentError::BlockOutOfRange(MAX_BLOCKS))
        );
        assert!(Extent::new(MAX_BLOCKS - 1, 10).is_ok());
        assert_eq!(
            Extent::new(5, BLOCK_SIZE),
            Err(ExtentError::UsedOutOfRange(BLOCK_SIZE))
        );
        assert_eq!(
            Extent::new(5, 3).unwrap().with_used(MAX_USED + 1),
            Err(ExtentError::UsedOutOfRange(MAX_USED + 1))
        );
    }

    #[test]
    fn parse_and_serialize() {
        let index = index_of(&[(3, 4095), (9, 12), (4, 0)]);
        let mut block = vec![0xFFu8; BLOCK_SIZE];

        ExtentIndex::serialize(&index, &mut block).unwrap();

        assert_eq!(&block[..4], &[0x03, 0x00, 0xF0, 0xFF]);
        assert_eq!(&block[4..8], &[0x09, 0x00, 0xC0, 0x00]);
        assert_eq!(&block[8..12], &[0x04, 0x00, 0x00, 0x00]);
        assert!(block[12..].iter().all(|&byte| byte == 0));

        assert_eq!(ExtentIndex::parse(&block).unwrap(), index);
        assert!(ExtentIndex::parse(&vec![0u8; BLOCK_SIZE]).unwrap().is_empty());
    }

    #[test]
    fn parse_rejects_malformed_blocks() {
        let mut block = vec![0u8; BLOCK_SIZE];
        block[8..12].copy_from_slice(&(5u32 << 20 | 2).to_le_bytes());
        assert!(ExtentIndex::parse(&block).is_err());

        let mut block = vec![0u8; BLOCK_SIZE];
        block[..4].copy_from_slice(&(5u32 << 20).to_le_bytes());
        assert!(ExtentIndex::parse(&block).is_err());

        assert!(ExtentIndex::parse(&[0u8; 16]).is_err());
    }

    #[test]
    fn shift_insert_and_remove() {
        let mut index = index_of(&[(1, 10), (2, 20), (3, 30)]);

        index.insert(1, Extent::new(7, 5).unwrap()).unwrap();
        assert_eq!(
            index.iter().map(Extent::block).collect::<Vec<_>>(),
            [1, 7, 2, 3]
        );
        index.insert(4, Extent::new(8, 1).unwrap()).unwrap();
        assert_eq!(index.get(4).block(), 8);
        assert_eq!(
            index.insert(6, Extent::new(9, 1).unwrap()),
            Err(ExtentError::PositionOutOfBounds(6, 5))
        );

        assert_eq!(index.remove(0).unwrap().block(), 1);
        assert_eq!(
            index.iter().map(Extent::block).collect::<Vec<_>>(),
            [7, 2, 3, 8]
        );
        assert_eq!(index.remove(4), Err(ExtentError::PositionOutOfBounds(4, 4)));
        assert!(index.get(4).is_unallocated());

        let tail = index.split_off(2);
        assert_eq!(tail.iter().map(|extent| extent.block()).collect::<Vec<_>>(), [3, 8]);
        assert_eq!(index.len(), 2);
        assert!(index.split_off(2).is_empty());
        assert_eq!(index.total_used(), 25);
    }

    #[test]
    fn capacity() {
        let mut index = ExtentIndex::new();
        for block in 1..=INDEX_CAPACITY as u32 {
            index.push(Extent::new(block, 1).unwrap()).unwrap();
        }
        assert!(index.is_full());
        assert_eq!(
            index.push(Extent::new(5000, 1).unwrap()),
            Err(ExtentError::IndexFull)
        );
        assert_eq!(
            index.insert(0, Extent::new(5000, 1).unwrap()),
            Err(ExtentError::IndexFull)
        );
        assert_eq!(index.len(), INDEX_CAPACITY);
    }

    #[test]
    fn find() {
        let index = index_of(&[(1, 10), (2, 0), (3, 5), (4, 4095)]);

        assert_eq!(index.find(0), Some((0, 0)));
        assert_eq!(index.find(9), Some((0, 9)));
        // Empty extents are walked over.
        assert_eq!(index.find(10), Some((2, 0)));
        assert_eq!(index.find(14), Some((2, 4)));
        assert_eq!(index.find(15), Some((3, 0)));
        // The last extent is landed on even past its used range.
        assert_eq!(index.find(15 + 4095), Some((3, 4095)));
        assert_eq!(index.find(100_000), Some((3, 100_000 - 15)));

        assert_eq!(ExtentIndex::new().find(0), Some((0, 0)));
        assert_eq!(ExtentIndex::new().find(42), Some((0, 42)));
    }

    #[test]
    fn find_in_full_index() {
        let mut index = ExtentIndex::new();
        for block in 1..=INDEX_CAPACITY as u32 {
            index.push(Extent::new(block, 100).unwrap()).unwrap();
        }
        let size = 100 * INDEX_CAPACITY as u64;

        assert_eq!(index.find(size - 1), Some((INDEX_CAPACITY - 1, 99)));
        assert_eq!(index.find(size), None);
    }
}
