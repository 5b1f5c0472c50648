use std::{
    ops::Range,
    sync::{Mutex, MutexGuard, PoisonError},
};

/// A pool of free blocks.
///
/// Blocks are allocated while buffers borrowed from the same filesystem are held, so this trait
/// only uses shared references to self, leaving locking to the implementor.
pub trait BlockAllocator {
    /// Take one free block out of the pool, or return `None` if every block is in use.
    fn allocate(&self) -> Option<u32>;

    /// Return a block to the pool.
    fn free(&self, block: u32);

    /// The number of blocks that can still be allocated.
    fn free_count(&self) -> u32;
}

/// A bitmap with one bit per block, set for blocks that are in use.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Bitmap {
    bytes: Box<[u8]>,
    len: u32,
}

impl Bitmap {
    pub fn new(len: u32) -> Self {
        Self {
            bytes: vec![0u8; varfs::div_round_up(len, 8) as usize].into_boxed_slice(),
            len,
        }
    }
    pub fn len(&self) -> u32 {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub fn get(&self, index: u32) -> bool {
        debug_assert!(index < self.len);
        self.bytes[index as usize / 8] & (1 << (index % 8)) != 0
    }
    pub fn set(&mut self, index: u32, value: bool) {
        debug_assert!(index < self.len);
        let byte = &mut self.bytes[index as usize / 8];
        *byte &= !(1 << (index % 8));
        *byte |= (value as u8) << (index % 8);
    }
    pub fn reserve(&mut self, range: Range<u32>) {
        for index in range {
            self.set(index, true)
        }
    }
    /// Find the first clear bit at or after `start`, wrapping around to the beginning.
    pub fn find_first_unset(&self, start: u32) -> Option<u32> {
        let start = if start < self.len { start } else { 0 };

        (start..self.len)
            .chain(0..start)
            .find(|&index| !self.get(index))
    }
    pub fn count_unset(&self) -> u32 {
        (0..self.len).filter(|&index| !self.get(index)).count() as u32
    }
}

/// The default allocator, keeping an in-memory bitmap of the blocks of the disk.
///
/// Block 0 is always reserved, as it means "no block" within an extent index. Allocation is
/// next-fit: searching starts after the most recently allocated block.
#[derive(Debug)]
pub struct BitmapAllocator {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    bitmap: Bitmap,
    next: u32,
    free: u32,
}

impl BitmapAllocator {
    pub fn new(block_count: u32) -> Self {
        Self::with_reserved(block_count, 0..1)
    }
    /// Create an allocator where the blocks in `reserved` (as well as block 0) are never
    /// handed out, e.g. because they hold metadata of the enclosing filesystem.
    pub fn with_reserved(block_count: u32, reserved: Range<u32>) -> Self {
        let mut bitmap = Bitmap::new(block_count);

        if block_count > 0 {
            bitmap.set(0, true);
        }
        bitmap.reserve(reserved.start.min(block_count)..reserved.end.min(block_count));

        Self::from_bitmap(bitmap)
    }
    pub fn from_bitmap(bitmap: Bitmap) -> Self {
        let free = bitmap.count_unset();

        Self {
            state: Mutex::new(State {
                bitmap,
                next: 0,
                free,
            }),
        }
    }
    /// A copy of the current bitmap, for the caller to store.
    pub fn bitmap(&self) -> Bitmap {
        self.lock().bitmap.clone()
    }
    pub fn is_allocated(&self, block: u32) -> bool {
        let state = self.lock();
        block < state.bitmap.len() && state.bitmap.get(block)
    }
    fn lock(&self) -> MutexGuard<'_, State> {
        // The bitmap is updated with a single call to `set`, so a panic elsewhere can't leave it
        // half-modified.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BlockAllocator for BitmapAllocator {
    fn allocate(&self) -> Option<u32> {
        let mut state = self.lock();

        let block = match state.bitmap.find_first_unset(state.next) {
            Some(block) => block,
            None => {
                log::debug!("no free block left out of {}", state.bitmap.len());
                return None;
            }
        };
        state.bitmap.set(block, true);
        state.next = block + 1;
        state.free -= 1;

        log::trace!("allocated block {} ({} free blocks left)", block, state.free);
        Some(block)
    }
    fn free(&self, block: u32) {
        let mut state = self.lock();

        if block == 0 || block >= state.bitmap.len() || !state.bitmap.get(block) {
            log::warn!("block {} was freed but was never allocated", block);
            return;
        }
        state.bitmap.set(block, false);
        state.free += 1;

        log::trace!("freed block {} ({} free blocks left)", block, state.free);
    }
    fn free_count(&self) -> u32 {
        self.lock().free
    }
}
