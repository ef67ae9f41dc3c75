//! In-memory inodes with a separate durable image.
//!
//! `state` is what running code sees. `durable` is what survives a power
//! failure: pointer publishes write both, every other field reaches
//! `durable` when the owning transaction commits.

use parking_lot::{Mutex, MutexGuard, RwLock};
use pmc_error::{PmcError, Result};
use pmc_journal::InodeImage;
use pmc_types::{
    BlockNumber, BlockType, InodeNumber, PAGE_SIZE, PageIndex, S_IFDIR, S_IFMT, S_IFREG, S_ISGID,
    S_ISUID, S_IXGRP,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Blocks were allocated past EOF (fallocate with KEEP_SIZE).
pub const EOFBLOCKS_FL: u32 = 0x0040_0000;
/// Attribute changes, including the set-ID strip, are refused.
pub const IMMUTABLE_FL: u32 = 0x0000_0010;

pub(crate) fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}

/// Identity of the caller of a sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    /// Holds the capability to keep set-ID bits on write.
    pub fsetid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InodeState {
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub flags: u32,
    pub mtime_ns: u64,
    pub ctime_ns: u64,
    pub block_type: BlockType,
    /// File block index (in units of `block_type`) to first device block.
    pub blocks: BTreeMap<u64, BlockNumber>,
}

impl InodeState {
    fn image(&self, ino: InodeNumber) -> InodeImage {
        InodeImage {
            ino,
            size: self.size,
            mode: self.mode,
            flags: self.flags,
            mtime_ns: self.mtime_ns,
            ctime_ns: self.ctime_ns,
            block_type: self.block_type,
        }
    }

    fn apply(&mut self, image: &InodeImage) {
        self.size = image.size;
        self.mode = image.mode;
        self.flags = image.flags;
        self.mtime_ns = image.mtime_ns;
        self.ctime_ns = image.ctime_ns;
        self.block_type = image.block_type;
    }

    /// File block holding file page `index`, and the page's offset in it.
    #[must_use]
    pub fn locate(&self, index: PageIndex) -> (u64, u64) {
        let per_block = self.block_type.pages_per_block();
        (index.0 / per_block, (index.0 % per_block) * PAGE_SIZE)
    }

    /// Device byte offset backing file page `index`, or `None` for a hole.
    #[must_use]
    pub fn device_offset(&self, index: PageIndex) -> Option<u64> {
        let (file_block, in_block) = self.locate(index);
        self.blocks
            .get(&file_block)
            .map(|block| block.0 * PAGE_SIZE + in_block)
    }
}

#[derive(Debug)]
pub struct Inode {
    ino: InodeNumber,
    update_lock: Mutex<()>,
    state: RwLock<InodeState>,
    durable: Mutex<InodeState>,
    mapped: AtomicUsize,
}

impl Inode {
    pub(crate) fn new(ino: InodeNumber, mode: u32, uid: u32, block_type: BlockType) -> Self {
        let now = now_ns();
        let state = InodeState {
            size: 0,
            mode,
            uid,
            flags: 0,
            mtime_ns: now,
            ctime_ns: now,
            block_type,
            blocks: BTreeMap::new(),
        };
        Self {
            ino,
            update_lock: Mutex::new(()),
            durable: Mutex::new(state.clone()),
            state: RwLock::new(state),
            mapped: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    /// Serializes syncs, fallocate and hint changes on this file.
    pub fn lock_update(&self) -> MutexGuard<'_, ()> {
        self.update_lock.lock()
    }

    #[must_use]
    pub fn snapshot(&self) -> InodeState {
        self.state.read().clone()
    }

    /// The inode as it would be found after a power failure.
    #[must_use]
    pub fn durable_snapshot(&self) -> InodeState {
        self.durable.lock().clone()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.state.read().size
    }

    #[must_use]
    pub fn block_type(&self) -> BlockType {
        self.state.read().block_type
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.state.read().mode & S_IFMT == S_IFDIR
    }

    #[must_use]
    pub fn block_of(&self, file_block: u64) -> Option<BlockNumber> {
        self.state.read().blocks.get(&file_block).copied()
    }

    #[must_use]
    pub fn image(&self) -> InodeImage {
        self.state.read().image(self.ino)
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut InodeState) -> R) -> R {
        f(&mut self.state.write())
    }

    /// Reset every logged field, in both views.
    pub(crate) fn apply_image(&self, image: &InodeImage) {
        self.state.write().apply(image);
        self.durable.lock().apply(image);
    }

    /// Atomically repoint one file block. Readers see either the old or
    /// the new block, never a mix.
    pub(crate) fn publish_pointer(&self, file_block: u64, block: BlockNumber) {
        self.state.write().blocks.insert(file_block, block);
        self.durable.lock().blocks.insert(file_block, block);
    }

    pub(crate) fn restore_pointer(&self, file_block: u64, old: Option<BlockNumber>) {
        let mut state = self.state.write();
        let mut durable = self.durable.lock();
        match old {
            Some(block) => {
                state.blocks.insert(file_block, block);
                durable.blocks.insert(file_block, block);
            }
            None => {
                state.blocks.remove(&file_block);
                durable.blocks.remove(&file_block);
            }
        }
    }

    /// Make the non-pointer fields durable.
    pub(crate) fn persist_metadata(&self) {
        let image = self.image();
        self.durable.lock().apply(&image);
    }

    /// Drop everything that never became durable.
    pub(crate) fn power_fail(&self) {
        let durable = self.durable.lock().clone();
        *self.state.write() = durable;
    }

    pub(crate) fn touch(&self) {
        let now = now_ns();
        let mut state = self.state.write();
        state.mtime_ns = now;
        state.ctime_ns = now;
    }

    /// Clear set-user-ID, and set-group-ID when group-executable, before
    /// data changes. Returns whether any bit was removed.
    pub(crate) fn remove_suid(&self, creds: Credentials) -> Result<bool> {
        let mut state = self.state.write();
        let mut kill = 0;
        if state.mode & S_ISUID != 0 {
            kill |= S_ISUID;
        }
        if state.mode & (S_ISGID | S_IXGRP) == (S_ISGID | S_IXGRP) {
            kill |= S_ISGID;
        }
        if kill == 0 || creds.fsetid || state.mode & S_IFMT != S_IFREG {
            return Ok(false);
        }
        if state.flags & IMMUTABLE_FL != 0 {
            return Err(PmcError::PermissionDenied);
        }
        state.mode &= !kill;
        drop(state);
        tracing::debug!(target: "pmc::inode", ino = self.ino.0, kill, "removed set-id bits");
        Ok(true)
    }

    /// Pick the block type for a file that will grow to `new_size`.
    ///
    /// Ignored once the file owns data blocks; returns whether the hint
    /// was applied.
    pub fn set_blocksize_hint(&self, new_size: u64) -> bool {
        let _update = self.update_lock.lock();
        let mut state = self.state.write();
        if !state.blocks.is_empty() {
            return false;
        }
        let block_type = BlockType::for_file_size(new_size);
        state.block_type = block_type;
        drop(state);
        self.durable.lock().block_type = block_type;
        tracing::debug!(
            target: "pmc::inode",
            ino = self.ino.0,
            new_size,
            %block_type,
            "block size hint set"
        );
        true
    }

    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.mapped.load(Ordering::Acquire) > 0
    }

    pub(crate) fn map_ref(&self) {
        self.mapped.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn map_unref(&self) {
        self.mapped.fetch_sub(1, Ordering::AcqRel);
    }

    /// Durable pointers, for rebuilding allocator occupancy.
    pub(crate) fn durable_blocks(&self) -> Vec<(BlockNumber, BlockType)> {
        let durable = self.durable.lock();
        durable
            .blocks
            .values()
            .map(|block| (*block, durable.block_type))
            .collect()
    }
}
