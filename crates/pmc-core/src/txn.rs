//! Transaction manager.
//!
//! A [`Transaction`] groups the block mutations of one sync. New blocks are
//! copied and written while the file still points at the old ones; commit
//! flushes them, fences, and only then repoints the file block by block.
//! Until commit every change can be undone from the log, which lives in the
//! filesystem's log area so it survives a simulated power failure.

use parking_lot::RwLockReadGuard;
use pmc_error::{PmcError, Result};
use pmc_journal::{BeforeImage, LogEntry, LogReservation, PointerSwap, TxnState, replay_undo};
use pmc_mmap::{DirtyPageSource, TrackedEntry};
use pmc_types::{BlockNumber, BlockType, PAGE_SIZE, PageIndex, TxnId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::fault::FailPoint;
use crate::fs::PmemFs;
use crate::inode::Inode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingSwap {
    old: Option<BlockNumber>,
    new: BlockNumber,
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommitSummary {
    pub txn: TxnId,
    pub log_entries: usize,
    /// Pointer swaps plus in-place data images.
    pub before_images: usize,
    pub published: usize,
    pub retired: usize,
    pub deferred_free: bool,
}

/// Where [`Transaction::write_back`] put one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWrite {
    /// Device offset of the written page.
    pub offset: u64,
    /// Store generation of the cached page that was copied.
    pub generation: u64,
}

#[must_use = "a transaction aborts when dropped without commit"]
pub struct Transaction<'fs> {
    fs: &'fs PmemFs,
    id: TxnId,
    inode: Arc<Inode>,
    block_type: BlockType,
    state: TxnState,
    defer_free: bool,
    fail_points: bool,
    /// Every block allocated so far; returned to the allocator on abort.
    new_blocks: Vec<BlockNumber>,
    /// File block -> pending repoint, published at commit.
    swaps: BTreeMap<u64, PendingSwap>,
    /// Device ranges written in place, flushed at commit.
    in_place: Vec<(u64, usize)>,
    reservation: Option<LogReservation<'fs>>,
    _gate: RwLockReadGuard<'fs, ()>,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("ino", &self.inode.ino())
            .field("state", &self.state)
            .field("new_blocks", &self.new_blocks.len())
            .field("swaps", &self.swaps.len())
            .finish_non_exhaustive()
    }
}

impl<'fs> Transaction<'fs> {
    /// Open a transaction on `inode` with room for `max_log_entries` log
    /// entries.
    pub fn begin(
        fs: &'fs PmemFs,
        inode: Arc<Inode>,
        max_log_entries: usize,
        block_type: BlockType,
    ) -> Result<Self> {
        if fs.is_degraded() {
            return Err(PmcError::Degraded);
        }
        let gate = fs.txn_gate();
        let reservation = fs.log_area().reserve(max_log_entries)?;
        let id = fs.next_txn_id();
        fs.open_log(id, max_log_entries);
        tracing::debug!(
            target: "pmc::txn",
            txn = id.0,
            ino = inode.ino().0,
            max_log_entries,
            %block_type,
            "begin"
        );
        Ok(Self {
            fs,
            id,
            inode,
            block_type,
            state: TxnState::Open,
            defer_free: false,
            fail_points: false,
            new_blocks: Vec::new(),
            swaps: BTreeMap::new(),
            in_place: Vec::new(),
            reservation: Some(reservation),
            _gate: gate,
        })
    }

    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> TxnState {
        self.state
    }

    #[must_use]
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    /// Blocks allocated so far.
    #[must_use]
    pub fn new_blocks(&self) -> &[BlockNumber] {
        &self.new_blocks
    }

    /// Entries currently in this transaction's log.
    #[must_use]
    pub fn log_len(&self) -> usize {
        self.fs.log_len(self.id)
    }

    /// Free replaced blocks through the shared queue instead of inline.
    pub fn set_defer_free(&mut self, defer: bool) {
        self.defer_free = defer;
    }

    /// Consult the fault injector at the commit-phase fail points.
    pub fn set_fail_points(&mut self, enabled: bool) {
        self.fail_points = enabled;
    }

    fn commit_fail_point(&self, point: FailPoint) -> Result<()> {
        if self.fail_points {
            self.fs.fail_point(point)
        } else {
            Ok(())
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == TxnState::Open {
            Ok(())
        } else {
            Err(PmcError::InvalidState {
                txn: self.id.0,
                state: self.state.as_str(),
            })
        }
    }

    /// Record an undo entry. Must precede the mutation it describes.
    pub fn append_log(&mut self, entry: LogEntry) -> Result<()> {
        self.ensure_open()?;
        self.fs.append_log(self.id, entry)
    }

    /// Log the inode's current fields.
    pub fn log_inode(&mut self) -> Result<()> {
        let image = self.inode.image();
        self.append_log(LogEntry::Inode(image))
    }

    fn file_block(&self, index: PageIndex) -> (u64, u64) {
        let per_block = self.block_type.pages_per_block();
        (index.0 / per_block, (index.0 % per_block) * PAGE_SIZE)
    }

    /// Give file page `index` a private copy of its block.
    ///
    /// The old block is copied (a hole becomes a zeroed block) and stays
    /// live until commit repoints the file. A block already copied in this
    /// transaction is reused.
    pub fn cow_block(&mut self, index: PageIndex) -> Result<BlockNumber> {
        self.ensure_open()?;
        let (file_block, _) = self.file_block(index);
        if let Some(swap) = self.swaps.get(&file_block) {
            return Ok(swap.new);
        }
        let old = self.inode.block_of(file_block);
        let new = self.install_block(file_block, old)?;
        self.fs.counters().record_cow();
        Ok(new)
    }

    fn install_block(&mut self, file_block: u64, old: Option<BlockNumber>) -> Result<BlockNumber> {
        let new = {
            let _superblock = self.fs.lock_superblock();
            let new = self.fs.alloc_block_locked(self.block_type)?;
            self.new_blocks.push(new);
            match old {
                Some(old) => self.fs.copy_blocks(old, new, self.block_type)?,
                None => self.fs.zero_blocks(new, self.block_type)?,
            }
            new
        };
        self.append_log(LogEntry::Pointer(PointerSwap {
            ino: self.inode.ino(),
            file_block,
            old,
            new,
            block_type: self.block_type,
        }))?;
        self.swaps.insert(file_block, PendingSwap { old, new });
        tracing::trace!(
            target: "pmc::txn",
            txn = self.id.0,
            file_block,
            old = old.map(|b| b.0),
            new = new.0,
            "install block"
        );
        Ok(new)
    }

    /// Allocate zeroed blocks for the holes in
    /// `[start_block, start_block + count)`. Returns how many were filled.
    pub fn alloc_blocks(&mut self, start_block: u64, count: u64) -> Result<u64> {
        self.ensure_open()?;
        let mut allocated = 0;
        for file_block in start_block..start_block.saturating_add(count) {
            if self.swaps.contains_key(&file_block) || self.inode.block_of(file_block).is_some() {
                continue;
            }
            self.install_block(file_block, None)?;
            allocated += 1;
        }
        Ok(allocated)
    }

    /// Copy the cached page behind `entry` into the block that will back
    /// it after commit.
    ///
    /// A page whose block was not copied in this transaction is written in
    /// place, after logging its old content.
    pub fn write_back(
        &mut self,
        source: &dyn DirtyPageSource,
        entry: &TrackedEntry,
        emulate: bool,
    ) -> Result<PageWrite> {
        self.ensure_open()?;
        let (file_block, in_block) = self.file_block(entry.index);
        let pending = self.swaps.get(&file_block).copied();
        let (block, in_place) = match (pending, self.inode.block_of(file_block)) {
            (Some(swap), _) => (swap.new, false),
            (None, Some(current)) => (current, true),
            (None, None) => (self.cow_block(entry.index)?, false),
        };
        let offset = block.0 * PAGE_SIZE + in_block;
        let page_len = PAGE_SIZE as usize;

        let mut page = vec![0_u8; page_len];
        let generation = source
            .read_page(entry, &mut page)
            .map_err(|err| write_back_error(entry, err))?;

        if in_place {
            let mut old = vec![0_u8; page_len];
            self.fs.pmem().read(offset, &mut old)?;
            self.append_log(LogEntry::Data(BeforeImage::new(
                block,
                self.block_type,
                in_block,
                old,
            )))?;
            self.in_place.push((offset, page_len));
        }

        self.fs
            .pmem()
            .write(offset, &page)
            .map_err(|err| write_back_error(entry, err))?;
        if emulate {
            self.fs.latency().emulate_latency(page_len);
        }
        self.fs.counters().record_write_back();
        tracing::trace!(
            target: "pmc::txn",
            txn = self.id.0,
            index = entry.index.0,
            block = block.0,
            in_place,
            generation,
            "write_back"
        );
        Ok(PageWrite { offset, generation })
    }

    fn flush_all(&self) -> Result<()> {
        let pmem = self.fs.pmem();
        let block_len = usize::try_from(self.block_type.size())
            .map_err(|_| PmcError::InvalidArgument("block size overflows usize".to_owned()))?;
        for swap in self.swaps.values() {
            pmem.flush_buffer(swap.new.0 * PAGE_SIZE, block_len, false)?;
        }
        for &(offset, len) in &self.in_place {
            pmem.flush_buffer(offset, len, false)?;
        }
        pmem.fence();
        Ok(())
    }

    /// Make the transaction durable and visible.
    ///
    /// New data is flushed and fenced before the first pointer moves. A
    /// failure from here on is not rolled back: the filesystem is marked
    /// degraded and the log is kept for [`PmemFs::revalidate`].
    pub fn commit(&mut self) -> Result<CommitSummary> {
        self.ensure_open()?;
        let log_entries = self.fs.log_len(self.id);
        let before_images = self.fs.log_before_images(self.id);

        if let Err(err) = self
            .commit_fail_point(FailPoint::CommitFlush)
            .and_then(|()| self.flush_all())
        {
            return Err(self.fail_commit(err));
        }

        let swaps: Vec<(u64, PendingSwap)> = self.swaps.iter().map(|(k, v)| (*k, *v)).collect();
        for (n, (file_block, swap)) in swaps.into_iter().enumerate() {
            if n > 0 {
                if let Err(err) = self.commit_fail_point(FailPoint::CommitPublish) {
                    return Err(self.fail_commit(err));
                }
            }
            let _superblock = self.fs.lock_superblock();
            self.inode.publish_pointer(file_block, swap.new);
        }
        self.inode.persist_metadata();

        self.state = TxnState::Committed;
        self.fs.close_log(self.id);
        self.reservation = None;

        let retired: Vec<BlockNumber> = self.swaps.values().filter_map(|swap| swap.old).collect();
        let retired_count = retired.len();
        self.fs
            .retire(self.id, retired, self.block_type, self.defer_free);
        self.fs.counters().record_commit();

        tracing::debug!(
            target: "pmc::txn",
            txn = self.id.0,
            published = self.swaps.len(),
            retired = retired_count,
            in_place = self.in_place.len(),
            "commit"
        );
        Ok(CommitSummary {
            txn: self.id,
            log_entries,
            before_images,
            published: self.swaps.len(),
            retired: retired_count,
            deferred_free: self.defer_free,
        })
    }

    fn fail_commit(&mut self, err: PmcError) -> PmcError {
        self.state = TxnState::Aborted;
        self.fs.mark_degraded();
        self.fs.counters().record_commit_failure();
        tracing::error!(
            target: "pmc::txn",
            txn = self.id.0,
            error = %err,
            "commit failed; filesystem degraded until revalidated"
        );
        err
    }

    /// Roll back: restore every logged image and return all new blocks.
    ///
    /// Safe to call more than once and from any error path. A no-op once
    /// the transaction has committed.
    pub fn abort(&mut self) {
        match self.state {
            TxnState::Aborted => return,
            TxnState::Committed => {
                tracing::warn!(target: "pmc::txn", txn = self.id.0, "abort after commit ignored");
                return;
            }
            TxnState::Open => {}
        }
        self.state = TxnState::Aborted;

        if let Some(log) = self.fs.close_log(self.id) {
            if let Err(err) = replay_undo(&log, self.fs) {
                self.fs.mark_degraded();
                tracing::error!(
                    target: "pmc::txn",
                    txn = self.id.0,
                    error = %err,
                    "undo replay failed during abort"
                );
            }
        }
        self.reservation = None;

        let freed = self.new_blocks.len();
        let blocks = std::mem::take(&mut self.new_blocks);
        self.fs.retire(self.id, blocks, self.block_type, true);
        self.swaps.clear();
        self.in_place.clear();
        self.fs.counters().record_abort();
        tracing::warn!(target: "pmc::txn", txn = self.id.0, freed, "abort");
    }

    /// Walk away as if power were lost right now: nothing is rolled back
    /// and the log stays in the log area for recovery.
    pub fn abandon(mut self) {
        self.state = TxnState::Aborted;
        tracing::debug!(target: "pmc::txn", txn = self.id.0, "abandoned");
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == TxnState::Open {
            self.abort();
        }
    }
}

fn write_back_error(entry: &TrackedEntry, err: PmcError) -> PmcError {
    match err {
        PmcError::WriteBackFailed { .. } => err,
        other => PmcError::WriteBackFailed {
            page: entry.index.0,
            detail: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tests::{test_fs, write_file};
    use pmc_alloc::BlockAllocator;

    #[test]
    fn begin_fails_when_log_area_is_exhausted() {
        let fs = test_fs();
        let inode = write_file(&fs, &[b'a'; 4096]);
        let capacity = fs.config().log_capacity_entries;
        let err = Transaction::begin(&fs, inode, capacity + 1, BlockType::FourK)
            .expect_err("oversized");
        assert!(matches!(err, PmcError::OutOfLogSpace { .. }));
    }

    #[test]
    fn append_past_reservation_is_log_full() {
        let fs = test_fs();
        let inode = write_file(&fs, &[b'a'; 4096]);
        let mut txn = Transaction::begin(&fs, inode, 1, BlockType::FourK).expect("begin");
        txn.log_inode().expect("first entry");
        assert_eq!(
            txn.log_inode(),
            Err(PmcError::LogFull { capacity: 1 })
        );
    }

    #[test]
    fn double_commit_is_rejected() {
        let fs = test_fs();
        let inode = write_file(&fs, &[b'a'; 4096]);
        let mut txn = Transaction::begin(&fs, inode, 4, BlockType::FourK).expect("begin");
        txn.commit().expect("commit");
        let err = txn.commit().expect_err("second commit");
        assert_eq!(
            err,
            PmcError::InvalidState {
                txn: txn.id().0,
                state: "committed"
            }
        );
        // Abort after commit changes nothing.
        txn.abort();
        assert_eq!(txn.state(), TxnState::Committed);
    }

    #[test]
    fn cow_keeps_old_block_until_commit() {
        let fs = test_fs();
        let inode = write_file(&fs, &[b'a'; 4096]);
        let old = inode.block_of(0).expect("block");

        let mut txn = Transaction::begin(&fs, Arc::clone(&inode), 8, BlockType::FourK)
            .expect("begin");
        let new = txn.cow_block(PageIndex(0)).expect("cow");
        assert_ne!(new, old);
        assert_eq!(txn.cow_block(PageIndex(0)).expect("again"), new);
        assert_eq!(inode.block_of(0), Some(old));

        let summary = txn.commit().expect("commit");
        assert_eq!(inode.block_of(0), Some(new));
        assert_eq!(summary.published, 1);
        assert_eq!(summary.retired, 1);
        assert!(!fs.allocator().is_allocated(old));
    }

    #[test]
    fn abort_restores_inode_and_queues_new_blocks() {
        let fs = test_fs();
        let inode = write_file(&fs, &[b'a'; 4096]);
        let before = inode.snapshot();
        let free_before = fs.allocator().free_count();

        let mut txn = Transaction::begin(&fs, Arc::clone(&inode), 8, BlockType::FourK)
            .expect("begin");
        txn.log_inode().expect("log inode");
        inode.touch();
        let x = txn.cow_block(PageIndex(0)).expect("cow");
        txn.abort();
        txn.abort();

        assert_eq!(inode.snapshot(), before);
        assert!(fs.allocator().is_allocated(x));
        assert_eq!(fs.reclaim_all(), 1);
        assert!(!fs.allocator().is_allocated(x));
        assert_eq!(fs.allocator().free_count(), free_before);
    }

    #[test]
    fn dropped_transaction_aborts() {
        let fs = test_fs();
        let inode = write_file(&fs, &[b'a'; 4096]);
        {
            let mut txn = Transaction::begin(&fs, Arc::clone(&inode), 8, BlockType::FourK)
                .expect("begin");
            txn.cow_block(PageIndex(0)).expect("cow");
        }
        assert_eq!(fs.stats().aborts, 1);
        assert_eq!(fs.log_area().available(), fs.config().log_capacity_entries);
    }
}
