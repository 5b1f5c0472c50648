use std::fmt;

use crate::{
    extents::{Extent, ExtentIndex},
    BLOCK_SIZE,
};

/// How well the blocks of a file are filled, computed from its extent index alone.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct ExtentUsage {
    /// The number of data blocks referenced by the index.
    pub used_blocks: usize,
    /// The number of blocks holding less than the maximum number of bytes.
    pub partial_blocks: usize,
    /// The number of bytes wasted in partial blocks. The reserved last byte of a partial block
    /// counts as wasted; a full block wastes nothing.
    pub internal_fragmentation: u64,
}

impl ExtentUsage {
    fn account(mut self, extent: Extent) -> Self {
        self.used_blocks += 1;

        if !extent.is_full() {
            self.partial_blocks += 1;
            self.internal_fragmentation += (BLOCK_SIZE - extent.used()) as u64;
        }
        self
    }
}

impl fmt::Display for ExtentUsage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} blocks, {} partially filled, {} bytes of internal fragmentation",
            self.used_blocks, self.partial_blocks, self.internal_fragmentation
        )
    }
}

/// An iterator used primarily for debugging, that emits the block number and used size of every
/// extent, in file order.
pub struct Pairs<'a> {
    index: &'a ExtentIndex,
    position: usize,
}

impl ExtentIndex {
    pub fn usage(&self) -> ExtentUsage {
        self.iter().fold(ExtentUsage::default(), ExtentUsage::account)
    }
    pub fn pairs(&self) -> Pairs<'_> {
        Pairs {
            index: self,
            position: 0,
        }
    }
}

impl<'a> Iterator for Pairs<'a> {
    type Item = (u32, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.index.len() {
            return None;
        }
        let extent = self.index.get(self.position);
        self.position += 1;

        Some((extent.block(), extent.used()))
    }
    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.index.len().saturating_sub(self.position);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Pairs<'_> {}
