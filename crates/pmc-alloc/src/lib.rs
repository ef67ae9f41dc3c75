#![forbid(unsafe_code)]
//! Block allocation for the persistent-memory device.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap**: raw bit manipulation on the device block bitmap.
//! 2. **BitmapAllocator**: next-fit single-block allocation plus naturally
//!    aligned runs for 2M / 1G block types, behind the superblock lock.
//! 3. **FreeRequestQueue**: the bounded LIFO of deferred block-free jobs,
//!    see [`queue`].

pub mod queue;

use parking_lot::Mutex;
use pmc_error::{PmcError, Result};
use pmc_types::{BlockNumber, BlockType};
use serde::Serialize;

pub use queue::{DEFAULT_QUEUE_CAPACITY, FreeRequest, FreeRequestQueue};

// ── Bitmap operations ───────────────────────────────────────────────────────

#[expect(
    clippy::cast_possible_truncation,
    reason = "bitmaps are in-memory slices; their bit count fits in usize"
)]
fn split(idx: u64) -> (usize, u32) {
    ((idx / 8) as usize, (idx % 8) as u32)
}

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u64) -> bool {
    let (byte_idx, bit_idx) = split(idx);
    bitmap
        .get(byte_idx)
        .is_some_and(|byte| (byte >> bit_idx) & 1 == 1)
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u64) {
    let (byte_idx, bit_idx) = split(idx);
    if let Some(byte) = bitmap.get_mut(byte_idx) {
        *byte |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u64) {
    let (byte_idx, bit_idx) = split(idx);
    if let Some(byte) = bitmap.get_mut(byte_idx) {
        *byte &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u64) -> u64 {
    (0..count).filter(|&idx| !bitmap_get(bitmap, idx)).count() as u64
}

/// First free bit in `[start, count)`, wrapping around to `[0, start)`.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u64, start: u64) -> Option<u64> {
    (start..count)
        .chain(0..start.min(count))
        .find(|&idx| !bitmap_get(bitmap, idx))
}

/// First run of `n` free bits in `[0, count)` whose start is a multiple of
/// `align`.
#[must_use]
pub fn bitmap_find_aligned_run(bitmap: &[u8], count: u64, n: u64, align: u64) -> Option<u64> {
    if n == 0 {
        return Some(0);
    }
    let align = align.max(1);
    let mut start = 0_u64;
    while start.checked_add(n)? <= count {
        match (start..start + n).find(|&idx| bitmap_get(bitmap, idx)) {
            None => return Some(start),
            // Skip to the next aligned slot past the used bit.
            Some(used) => start = (used / align + 1) * align,
        }
    }
    None
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// Allocation interface the transaction manager drives.
///
/// Implementations serialize their own metadata; callers never hold an
/// allocator lock across a transaction.
pub trait BlockAllocator: Send + Sync {
    /// Allocate one block of `block_type` (a naturally aligned run of
    /// `block_type.blocks_4k()` device blocks). Fails with `NoSpace`.
    fn alloc_block(&self, block_type: BlockType) -> Result<BlockNumber>;

    /// Return a block previously handed out by `alloc_block`.
    fn free_block(&self, block: BlockNumber, block_type: BlockType) -> Result<()>;

    /// Free device blocks.
    fn free_count(&self) -> u64;
}

/// Snapshot of allocator occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocStats {
    pub total_blocks: u64,
    pub reserved_blocks: u64,
    pub free_blocks: u64,
}

#[derive(Debug)]
struct AllocState {
    bitmap: Vec<u8>,
    free: u64,
    cursor: u64,
}

/// Bitmap allocator over the device's 4 KiB blocks.
///
/// The first `reserved` blocks (superblock, log area) are never handed out.
#[derive(Debug)]
pub struct BitmapAllocator {
    total: u64,
    reserved: u64,
    state: Mutex<AllocState>,
}

impl BitmapAllocator {
    pub fn new(total: u64, reserved: u64) -> Result<Self> {
        if reserved >= total {
            return Err(PmcError::InvalidArgument(format!(
                "reserved blocks ({reserved}) must be below total ({total})"
            )));
        }
        let bytes = usize::try_from(total.div_ceil(8))
            .map_err(|_| PmcError::InvalidArgument(format!("{total} blocks overflow")))?;
        let mut bitmap = vec![0_u8; bytes];
        for idx in 0..reserved {
            bitmap_set(&mut bitmap, idx);
        }
        Ok(Self {
            total,
            reserved,
            state: Mutex::new(AllocState {
                bitmap,
                free: total - reserved,
                cursor: reserved,
            }),
        })
    }

    #[must_use]
    pub fn total_blocks(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub fn is_allocated(&self, block: BlockNumber) -> bool {
        bitmap_get(&self.state.lock().bitmap, block.0)
    }

    #[must_use]
    pub fn stats(&self) -> AllocStats {
        AllocStats {
            total_blocks: self.total,
            reserved_blocks: self.reserved,
            free_blocks: self.state.lock().free,
        }
    }

    /// Mark an explicit block as in use. Used when rebuilding occupancy
    /// from file block maps after a simulated crash.
    pub fn mark_used(&self, block: BlockNumber, block_type: BlockType) -> Result<()> {
        let run = block_type.blocks_4k();
        self.check_run(block, run)?;
        let mut state = self.state.lock();
        for idx in block.0..block.0 + run {
            if !bitmap_get(&state.bitmap, idx) {
                bitmap_set(&mut state.bitmap, idx);
                state.free -= 1;
            }
        }
        drop(state);
        Ok(())
    }

    /// Forget all occupancy except the reserved prefix, then mark `used`.
    pub fn rebuild(&self, used: &[(BlockNumber, BlockType)]) -> Result<()> {
        for &(block, block_type) in used {
            self.check_run(block, block_type.blocks_4k())?;
        }
        let mut state = self.state.lock();
        state.bitmap.iter_mut().for_each(|byte| *byte = 0);
        for idx in 0..self.reserved {
            bitmap_set(&mut state.bitmap, idx);
        }
        state.free = self.total - self.reserved;
        state.cursor = self.reserved;
        for &(block, block_type) in used {
            for idx in block.0..block.0 + block_type.blocks_4k() {
                if !bitmap_get(&state.bitmap, idx) {
                    bitmap_set(&mut state.bitmap, idx);
                    state.free -= 1;
                }
            }
        }
        let free = state.free;
        drop(state);
        tracing::debug!(target: "pmc::alloc", used = used.len(), free, "allocator rebuilt");
        Ok(())
    }

    fn check_run(&self, block: BlockNumber, run: u64) -> Result<()> {
        let end = block.0.checked_add(run);
        if block.0 < self.reserved || end.is_none_or(|end| end > self.total) {
            return Err(PmcError::Corruption {
                block: block.0,
                detail: format!("run of {run} outside data area"),
            });
        }
        Ok(())
    }
}

impl BlockAllocator for BitmapAllocator {
    fn alloc_block(&self, block_type: BlockType) -> Result<BlockNumber> {
        let run = block_type.blocks_4k();
        let mut state = self.state.lock();
        if state.free < run {
            return Err(PmcError::NoSpace);
        }
        let found = if run == 1 {
            bitmap_find_free(&state.bitmap, self.total, state.cursor)
        } else {
            bitmap_find_aligned_run(&state.bitmap, self.total, run, run)
        };
        let Some(start) = found else {
            return Err(PmcError::NoSpace);
        };
        for idx in start..start + run {
            bitmap_set(&mut state.bitmap, idx);
        }
        state.free -= run;
        state.cursor = if start + run >= self.total {
            self.reserved
        } else {
            start + run
        };
        let free = state.free;
        drop(state);

        tracing::trace!(
            target: "pmc::alloc",
            block = start,
            block_type = %block_type,
            free,
            "alloc_block"
        );
        Ok(BlockNumber(start))
    }

    fn free_block(&self, block: BlockNumber, block_type: BlockType) -> Result<()> {
        let run = block_type.blocks_4k();
        self.check_run(block, run)?;
        let mut state = self.state.lock();
        if let Some(idx) = (block.0..block.0 + run).find(|&idx| !bitmap_get(&state.bitmap, idx)) {
            return Err(PmcError::Corruption {
                block: idx,
                detail: "double free".into(),
            });
        }
        for idx in block.0..block.0 + run {
            bitmap_clear(&mut state.bitmap, idx);
        }
        state.free += run;
        let free = state.free;
        drop(state);

        tracing::trace!(
            target: "pmc::alloc",
            block = block.0,
            block_type = %block_type,
            free,
            "free_block"
        );
        Ok(())
    }

    fn free_count(&self) -> u64 {
        self.state.lock().free
    }
}
