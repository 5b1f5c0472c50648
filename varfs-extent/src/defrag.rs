//! Repacking the extents of a file, so that every extent but the last one is full.

use std::cmp;

use crate::{
    allocator::BlockAllocator,
    disk::{BlockBuf, BlockKind},
    extents::{Extent, ExtentIndex},
    file::{FileIoError, FileState},
    Filesystem,
};

impl FileState {
    /// Move bytes from later extents into the spare room of earlier ones, in a single pass, and
    /// free the blocks left empty at the end. The contents and size of the file stay the same.
    ///
    /// A failure stops the pass, leaving the file partially repacked but consistent.
    pub fn defragment<D: varfs::Device, A: BlockAllocator>(
        &mut self,
        filesystem: &Filesystem<D, A>,
    ) -> Result<(), FileIoError> {
        filesystem.check_writable()?;

        let (mut index_buf, mut index) = filesystem.load_index(self)?;
        let mapped = index.total_used();
        if mapped != self.size {
            return Err(FileIoError::SizeMismatch(self.size, mapped));
        }
        let blocks_before = self.block_count;

        let mut freed = Freed::default();
        let result = repack(filesystem, &mut index_buf, &mut index, self.size, &mut freed);

        // Whatever was repacked before a failure is kept, as long as the index makes it to the
        // disk. Only then are the blocks it no longer references safe to reuse.
        let err = match index_buf.release() {
            Ok(()) => {
                self.block_count = index.len() as u32;
                for block in freed.retired {
                    filesystem.allocator.free(block);
                }
                result.err()
            }
            Err(err) => {
                for block in freed.copies {
                    filesystem.allocator.free(block);
                }
                Some(result.err().unwrap_or_else(|| err.into()))
            }
        };
        if let Some(err) = err {
            return Err(err);
        }

        log::debug!(
            "defragmented the file with index block {} from {} to {} blocks",
            self.index_block,
            blocks_before,
            self.block_count
        );
        Ok(())
    }
}

/// Blocks set aside during a pass, to be freed depending on whether the index reaches the disk.
#[derive(Default)]
struct Freed {
    /// Blocks no longer referenced by the in-memory index.
    retired: Vec<u32>,
    /// Blocks allocated for the pass and referenced by the in-memory index.
    copies: Vec<u32>,
}

fn repack<D: varfs::Device, A: BlockAllocator>(
    filesystem: &Filesystem<D, A>,
    index_buf: &mut BlockBuf<'_, D>,
    index: &mut ExtentIndex,
    size: u64,
    freed: &mut Freed,
) -> Result<(), FileIoError> {
    let mut covered = 0;
    let mut position = 0;

    while position < index.len() {
        if covered >= size {
            let mut shortened = index.clone();
            let trailing = shortened.split_off(position);
            filesystem.store_index(index_buf, &shortened)?;

            *index = shortened;
            freed.retired.extend(trailing.iter().map(|extent| extent.block()));
            log::trace!("released {} empty trailing extents", trailing.len());
            break;
        }
        let extent = index.get(position);

        if !extent.is_full() {
            let wanted = size - covered - extent.used() as u64;
            fill_from_donors(filesystem, index_buf, index, position, wanted, freed)?;
        }
        covered += index.get(position).used() as u64;
        position += 1;
    }
    Ok(())
}

/// Fill the extent at `target_position` with up to `wanted` bytes taken from the start of the
/// extents after it.
///
/// Donors are never modified in place. What's left of a partially moved donor is copied to the
/// start of a new block, which replaces the donor in the same index update that grows the target.
fn fill_from_donors<D: varfs::Device, A: BlockAllocator>(
    filesystem: &Filesystem<D, A>,
    index_buf: &mut BlockBuf<'_, D>,
    index: &mut ExtentIndex,
    target_position: usize,
    wanted: u64,
    freed: &mut Freed,
) -> Result<(), FileIoError> {
    if wanted == 0 {
        return Ok(());
    }
    let mut target_extent = index.get(target_position);
    let mut target = filesystem.disk.acquire(BlockKind::Data, target_extent.block())?;
    let mut moved = 0;

    for donor_position in target_position + 1..index.len() {
        if target_extent.is_full() || moved >= wanted {
            break;
        }
        let donor_extent = index.get(donor_position);
        if donor_extent.used() == 0 {
            continue;
        }

        let target_used = target_extent.used();
        let count = cmp::min(
            cmp::min(target_extent.spare(), donor_extent.used()) as u64,
            wanted - moved,
        ) as usize;

        let relocated = count < donor_extent.used();
        let replacement = {
            let donor = filesystem.disk.acquire(BlockKind::Data, donor_extent.block())?;
            target.bytes_mut()[target_used..target_used + count].copy_from_slice(&donor[..count]);
            target.write_back()?;

            if !relocated {
                donor_extent.with_used(0)?
            } else if let Some(extent) = relocate(filesystem, &donor[count..donor_extent.used()])? {
                extent
            } else {
                log::debug!(
                    "no free block to move the rest of block {} to, leaving it as is",
                    donor_extent.block()
                );
                break;
            }
        };

        let mut updated = index.clone();
        target_extent = target_extent.with_used(target_used + count)?;
        updated.set(target_position, target_extent)?;
        updated.set(donor_position, replacement)?;

        if let Err(err) = filesystem.store_index(index_buf, &updated) {
            if relocated {
                filesystem.allocator.free(replacement.block());
            }
            return Err(err);
        }
        *index = updated;

        if relocated {
            freed.retired.push(donor_extent.block());
            freed.copies.push(replacement.block());
        }
        log::trace!(
            "moved {} bytes from block {} to block {}",
            count,
            donor_extent.block(),
            target_extent.block()
        );
        moved += count as u64;
    }

    Ok(())
}

/// Copy bytes to the start of a newly allocated block, returning the extent holding them, or
/// `None` if no block is free.
fn relocate<D: varfs::Device, A: BlockAllocator>(
    filesystem: &Filesystem<D, A>,
    bytes: &[u8],
) -> Result<Option<Extent>, FileIoError> {
    let block = match filesystem.allocator.allocate() {
        Some(block) => block,
        None => return Ok(None),
    };
    let extent = match Extent::new(block, bytes.len()) {
        Ok(extent) => extent,
        Err(err) => {
            filesystem.allocator.free(block);
            return Err(err.into());
        }
    };

    let mut copy = filesystem.disk.acquire_zeroed(BlockKind::Data, block);
    copy.bytes_mut()[..bytes.len()].copy_from_slice(bytes);

    if let Err(err) = copy.release() {
        filesystem.allocator.free(block);
        return Err(err.into());
    }
    Ok(Some(extent))
}
