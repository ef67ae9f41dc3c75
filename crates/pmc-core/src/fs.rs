//! Filesystem context.
//!
//! [`PmemFs`] owns everything a sync touches: the medium, the block
//! allocator, the log area and the active logs, the inodes, and the
//! injected latency and fault strategies. It is passed explicitly into
//! every operation; there is no process-wide filesystem state beyond the
//! shared free-request queue handed in through [`FsEnv`].

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use pmc_alloc::{BitmapAllocator, BlockAllocator, FreeRequest, FreeRequestQueue};
use pmc_error::{PmcError, Result};
use pmc_journal::{
    BeforeImage, InodeImage, LogArea, LogEntry, PointerSwap, TxnLog, UndoReport, UndoTarget,
    replay_undo,
};
use pmc_mmap::MemMapping;
use pmc_pmem::{DelaySource, FlushStats, LatencyEmulator, PersistentMemory, SpinDelay};
use pmc_types::{
    BlockNumber, BlockType, FsId, InodeNumber, MAX_INODE_LOG_ENTRIES, PAGE_SIZE, PageIndex,
    S_IFMT, S_IFREG, TxnId, VirtAddr, align_up,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::config::FsConfig;
use crate::fault::{CrashLatch, FailPoint, FaultInjector, NoFaults, RandomCrash};
use crate::inode::{Credentials, EOFBLOCKS_FL, Inode};
use crate::txn::Transaction;

/// fallocate: allocate without changing the file size.
pub const FALLOC_FL_KEEP_SIZE: u32 = 0x01;

static NEXT_FS_ID: AtomicU64 = AtomicU64::new(1);

/// Collaborators injected into a filesystem.
#[derive(Debug, Clone)]
pub struct FsEnv {
    pub queue: Arc<FreeRequestQueue>,
    pub delay: Arc<dyn DelaySource>,
    pub faults: Arc<dyn FaultInjector>,
}

impl FsEnv {
    /// Spinning delay, a private queue, and random crashes when enabled.
    #[must_use]
    pub fn for_config(config: &FsConfig) -> Self {
        let faults: Arc<dyn FaultInjector> = if config.crash.enabled {
            Arc::new(RandomCrash::from_config(&config.crash))
        } else {
            Arc::new(NoFaults)
        };
        Self {
            queue: Arc::new(FreeRequestQueue::with_capacity(config.free_queue_capacity)),
            delay: Arc::new(SpinDelay::new(config.latency)),
            faults,
        }
    }

    #[must_use]
    pub fn with_queue(mut self, queue: Arc<FreeRequestQueue>) -> Self {
        self.queue = queue;
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Arc<dyn DelaySource>) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn with_faults(mut self, faults: Arc<dyn FaultInjector>) -> Self {
        self.faults = faults;
        self
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    syncs: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
    commit_failures: AtomicU64,
    cowed_blocks: AtomicU64,
    written_pages: AtomicU64,
    deferred_frees: AtomicU64,
    freed_blocks: AtomicU64,
    injected_faults: AtomicU64,
    recoveries: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_sync(&self) {
        Self::bump(&self.syncs, 1);
    }

    pub(crate) fn record_commit(&self) {
        Self::bump(&self.commits, 1);
    }

    pub(crate) fn record_abort(&self) {
        Self::bump(&self.aborts, 1);
    }

    pub(crate) fn record_commit_failure(&self) {
        Self::bump(&self.commit_failures, 1);
    }

    pub(crate) fn record_cow(&self) {
        Self::bump(&self.cowed_blocks, 1);
    }

    pub(crate) fn record_write_back(&self) {
        Self::bump(&self.written_pages, 1);
    }
}

/// Point-in-time counters for one filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FsStats {
    pub fs: FsId,
    pub syncs: u64,
    pub commits: u64,
    pub aborts: u64,
    pub commit_failures: u64,
    pub cowed_blocks: u64,
    pub written_pages: u64,
    /// Blocks handed to the free-request queue instead of freed inline.
    pub deferred_frees: u64,
    pub freed_blocks: u64,
    pub injected_faults: u64,
    pub recoveries: u64,
    pub emulated_ns: u64,
    pub free_blocks: u64,
    pub log_available: usize,
    pub active_logs: usize,
    pub retired_pending: usize,
    pub degraded: bool,
    pub flush: FlushStats,
}

/// Result of replaying the active logs.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub logs_replayed: usize,
    pub undo: UndoReport,
    pub blocks_in_use: usize,
}

/// An open file, optionally mapped.
#[derive(Debug)]
pub struct FileHandle {
    inode: Arc<Inode>,
    creds: Credentials,
    mapping: Mutex<Option<Arc<MemMapping>>>,
}

impl FileHandle {
    #[must_use]
    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    #[must_use]
    pub fn credentials(&self) -> Credentials {
        self.creds
    }

    #[must_use]
    pub fn with_credentials(mut self, creds: Credentials) -> Self {
        self.creds = creds;
        self
    }

    #[must_use]
    pub fn mapping(&self) -> Option<Arc<MemMapping>> {
        self.mapping.lock().clone()
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if self.mapping.get_mut().take().is_some() {
            self.inode.map_unref();
        }
    }
}

/// Choose a mapping address aligned for `block_type`.
///
/// A fixed mapping must already be aligned in both address and length;
/// otherwise the hint is rounded up.
pub fn get_unmapped_area(
    hint: VirtAddr,
    len: u64,
    block_type: BlockType,
    fixed: bool,
) -> Result<VirtAddr> {
    let align = block_type.mmap_alignment();
    if fixed {
        if !hint.is_aligned(align) || len % align != 0 {
            return Err(PmcError::InvalidArgument(format!(
                "fixed mapping {hint}+{len:#x} not aligned to {block_type}"
            )));
        }
        return Ok(hint);
    }
    align_up(hint.0, align)
        .map(VirtAddr)
        .ok_or_else(|| PmcError::InvalidArgument(format!("no aligned area above {hint}")))
}

pub struct PmemFs {
    id: FsId,
    config: FsConfig,
    pmem: PersistentMemory,
    alloc: BitmapAllocator,
    log_area: LogArea,
    /// Logs of transactions that have not committed or aborted. Survives
    /// [`PmemFs::power_fail`].
    active_logs: Mutex<BTreeMap<TxnId, TxnLog>>,
    /// Shared by open transactions, exclusive for recovery.
    txn_gate: RwLock<()>,
    superblock: Mutex<()>,
    queue: Arc<FreeRequestQueue>,
    retired: Mutex<HashMap<TxnId, Vec<(BlockNumber, BlockType)>>>,
    latency: LatencyEmulator,
    faults: Arc<dyn FaultInjector>,
    latch: CrashLatch,
    inodes: RwLock<BTreeMap<InodeNumber, Arc<Inode>>>,
    next_ino: AtomicU64,
    next_txn: AtomicU64,
    degraded: AtomicBool,
    counters: Counters,
}

impl fmt::Debug for PmemFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PmemFs")
            .field("id", &self.id)
            .field("block_count", &self.config.block_count)
            .field("inodes", &self.inodes.read().len())
            .field("degraded", &self.is_degraded())
            .finish_non_exhaustive()
    }
}

impl PmemFs {
    /// Build a filesystem with the collaborators `config` implies.
    pub fn new(config: FsConfig) -> Result<Arc<Self>> {
        let env = FsEnv::for_config(&config);
        Self::with_env(config, env)
    }

    pub fn with_env(config: FsConfig, env: FsEnv) -> Result<Arc<Self>> {
        config.validate()?;
        let pmem = PersistentMemory::new(config.block_count)?;
        let alloc = BitmapAllocator::new(config.block_count, config.reserved_blocks)?;
        let id = FsId(NEXT_FS_ID.fetch_add(1, Ordering::Relaxed));
        tracing::info!(
            target: "pmc::fs",
            fs = id.0,
            blocks = config.block_count,
            reserved = config.reserved_blocks,
            log_entries = config.log_capacity_entries,
            "filesystem created"
        );
        Ok(Arc::new(Self {
            id,
            log_area: LogArea::new(config.log_capacity_entries),
            latency: LatencyEmulator::new(config.latency, env.delay),
            pmem,
            alloc,
            active_logs: Mutex::new(BTreeMap::new()),
            txn_gate: RwLock::new(()),
            superblock: Mutex::new(()),
            queue: env.queue,
            retired: Mutex::new(HashMap::new()),
            faults: env.faults,
            latch: CrashLatch::default(),
            inodes: RwLock::new(BTreeMap::new()),
            next_ino: AtomicU64::new(2),
            next_txn: AtomicU64::new(1),
            degraded: AtomicBool::new(false),
            counters: Counters::default(),
            config,
        }))
    }

    #[must_use]
    pub fn id(&self) -> FsId {
        self.id
    }

    #[must_use]
    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    #[must_use]
    pub fn pmem(&self) -> &PersistentMemory {
        &self.pmem
    }

    #[must_use]
    pub fn allocator(&self) -> &BitmapAllocator {
        &self.alloc
    }

    #[must_use]
    pub fn log_area(&self) -> &LogArea {
        &self.log_area
    }

    #[must_use]
    pub fn latency(&self) -> &LatencyEmulator {
        &self.latency
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<FreeRequestQueue> {
        &self.queue
    }

    #[must_use]
    pub fn crash_latch(&self) -> &CrashLatch {
        &self.latch
    }

    pub fn reset_crash_latch(&self) {
        self.latch.reset();
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub(crate) fn mark_degraded(&self) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            tracing::warn!(target: "pmc::fs", fs = self.id.0, "filesystem marked degraded");
        }
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.counters
    }

    pub(crate) fn next_txn_id(&self) -> TxnId {
        TxnId(self.next_txn.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn txn_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.txn_gate.read_recursive()
    }

    pub(crate) fn lock_superblock(&self) -> MutexGuard<'_, ()> {
        self.superblock.lock()
    }

    // ── Inodes and handles ──────────────────────────────────────────────

    /// Create an inode with the given type and permission bits.
    pub fn create_inode(&self, mode: u32, uid: u32) -> Result<Arc<Inode>> {
        if mode & S_IFMT == 0 {
            return Err(PmcError::InvalidArgument(format!(
                "mode {mode:#o} has no file type"
            )));
        }
        let ino = InodeNumber(self.next_ino.fetch_add(1, Ordering::Relaxed));
        let inode = Arc::new(Inode::new(ino, mode, uid, self.config.default_block_type));
        self.inodes.write().insert(ino, Arc::clone(&inode));
        tracing::debug!(target: "pmc::fs", ino = ino.0, mode, "inode created");
        Ok(inode)
    }

    /// Create a regular file with permission bits `perm`.
    pub fn create_file(&self, perm: u32, uid: u32) -> Result<Arc<Inode>> {
        self.create_inode(S_IFREG | (perm & 0o7777), uid)
    }

    pub fn inode(&self, ino: InodeNumber) -> Result<Arc<Inode>> {
        self.inodes
            .read()
            .get(&ino)
            .cloned()
            .ok_or_else(|| PmcError::NotFound(format!("inode {ino}")))
    }

    pub fn open(&self, ino: InodeNumber) -> Result<FileHandle> {
        Ok(FileHandle {
            inode: self.inode(ino)?,
            creds: Credentials::default(),
            mapping: Mutex::new(None),
        })
    }

    /// Map the first `len` bytes of the file. Returns the mapping address.
    pub fn mmap(&self, handle: &FileHandle, hint: VirtAddr, len: u64, fixed: bool) -> Result<VirtAddr> {
        if len == 0 {
            return Err(PmcError::InvalidArgument("zero-length mapping".to_owned()));
        }
        let block_type = handle.inode.block_type();
        let addr = get_unmapped_area(hint, len, block_type, fixed)?;
        let mapping = MemMapping::new(addr, PageIndex(0), len.div_ceil(PAGE_SIZE))?;
        if handle.mapping.lock().replace(Arc::new(mapping)).is_none() {
            handle.inode.map_ref();
        }
        tracing::debug!(
            target: "pmc::fs",
            ino = handle.inode.ino().0,
            %addr,
            len,
            %block_type,
            "mmap"
        );
        Ok(addr)
    }

    pub fn munmap(&self, handle: &FileHandle) {
        if handle.mapping.lock().take().is_some() {
            handle.inode.map_unref();
            tracing::debug!(target: "pmc::fs", ino = handle.inode.ino().0, "munmap");
        }
    }

    /// Store through the mapping, faulting pages in from the medium first.
    pub fn write_mapped(&self, handle: &FileHandle, offset: u64, data: &[u8]) -> Result<()> {
        let mapping = self.mapped_range(handle, offset, data.len())?;
        let addr = self.fault_range(handle, &mapping, offset, data.len())?;
        mapping.store(addr, data)
    }

    /// Load through the mapping.
    pub fn read_mapped(&self, handle: &FileHandle, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mapping = self.mapped_range(handle, offset, buf.len())?;
        let addr = self.fault_range(handle, &mapping, offset, buf.len())?;
        mapping.load(addr, buf)
    }

    fn mapped_range(&self, handle: &FileHandle, offset: u64, len: usize) -> Result<Arc<MemMapping>> {
        let mapping = handle
            .mapping()
            .ok_or_else(|| PmcError::InvalidArgument("file is not mapped".to_owned()))?;
        let map_start = mapping.first_index().byte_offset();
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| PmcError::InvalidArgument("range overflows u64".to_owned()))?;
        if offset < map_start || end > map_start + mapping.len_bytes() {
            return Err(PmcError::InvalidArgument(format!(
                "range {offset}..{end} outside mapping"
            )));
        }
        Ok(mapping)
    }

    fn fault_range(
        &self,
        handle: &FileHandle,
        mapping: &MemMapping,
        offset: u64,
        len: usize,
    ) -> Result<VirtAddr> {
        let first = PageIndex::containing(offset);
        let last = PageIndex::containing(offset + (len as u64).max(1) - 1);
        let mut page = vec![0_u8; PAGE_SIZE as usize];
        for index in first.0..=last.0 {
            let index = PageIndex(index);
            let addr = mapping
                .addr_of(index)
                .ok_or_else(|| PmcError::InvalidArgument(format!("page {index} not mapped")))?;
            if !mapping.is_present(addr) {
                self.read_at(&handle.inode, index.byte_offset(), &mut page)?;
                mapping.fault_in(addr, &page)?;
            }
        }
        let rel = offset - mapping.first_index().byte_offset();
        Ok(VirtAddr(mapping.base().0 + rel))
    }

    /// Read file content as currently visible. Holes read as zeroes.
    pub fn read_at(&self, inode: &Inode, offset: u64, buf: &mut [u8]) -> Result<()> {
        let state = inode.snapshot();
        read_blocks(&state.blocks, state.block_type, offset, buf, |dev, out| {
            self.pmem.read(dev, out)
        })
    }

    /// Read file content as it would be found after a power failure.
    pub fn read_durable_at(&self, inode: &Inode, offset: u64, buf: &mut [u8]) -> Result<()> {
        let state = inode.durable_snapshot();
        read_blocks(&state.blocks, state.block_type, offset, buf, |dev, out| {
            self.pmem.read_durable(dev, out)
        })
    }

    /// Give `inode` a block type suited to a file of `new_size` bytes.
    pub fn set_blocksize_hint(&self, inode: &Inode, new_size: u64) -> bool {
        inode.set_blocksize_hint(new_size)
    }

    // ── Failure points ──────────────────────────────────────────────────

    /// Consult the fault injector at `point`.
    ///
    /// Once a fault has fired, later points pass until the crash latch is
    /// reset.
    pub fn fail_point(&self, point: FailPoint) -> Result<()> {
        if self.latch.has_fired() || !self.faults.should_fail(point) {
            return Ok(());
        }
        self.latch.fire(&self.superblock);
        Counters::bump(&self.counters.injected_faults, 1);
        tracing::warn!(target: "pmc::fault", fs = self.id.0, %point, "injected fault");
        Err(PmcError::InjectedFault {
            point: point.to_string(),
        })
    }

    // ── Transaction log area ────────────────────────────────────────────

    pub(crate) fn open_log(&self, txn: TxnId, capacity: usize) {
        self.active_logs.lock().insert(txn, TxnLog::new(txn, capacity));
    }

    pub(crate) fn append_log(&self, txn: TxnId, entry: LogEntry) -> Result<()> {
        let mut logs = self.active_logs.lock();
        let log = logs.get_mut(&txn).ok_or(PmcError::InvalidState {
            txn: txn.0,
            state: "closed",
        })?;
        log.append(entry)
    }

    pub(crate) fn log_len(&self, txn: TxnId) -> usize {
        self.active_logs.lock().get(&txn).map_or(0, TxnLog::len)
    }

    pub(crate) fn log_before_images(&self, txn: TxnId) -> usize {
        self.active_logs
            .lock()
            .get(&txn)
            .map_or(0, TxnLog::before_images)
    }

    pub(crate) fn close_log(&self, txn: TxnId) -> Option<TxnLog> {
        self.active_logs.lock().remove(&txn)
    }

    #[must_use]
    pub fn active_log_count(&self) -> usize {
        self.active_logs.lock().len()
    }

    // ── Blocks ──────────────────────────────────────────────────────────

    /// Allocate with the superblock lock held. Falls back to reclaiming
    /// this filesystem's retired blocks when the device looks full.
    pub(crate) fn alloc_block_locked(&self, block_type: BlockType) -> Result<BlockNumber> {
        match self.alloc.alloc_block(block_type) {
            Err(PmcError::NoSpace) => {
                let reclaimed = self.reclaim_all_locked();
                if reclaimed == 0 {
                    return Err(PmcError::NoSpace);
                }
                tracing::debug!(
                    target: "pmc::fs",
                    fs = self.id.0,
                    reclaimed,
                    "reclaimed retired blocks to satisfy allocation"
                );
                self.alloc.alloc_block(block_type)
            }
            other => other,
        }
    }

    pub(crate) fn copy_blocks(&self, src: BlockNumber, dst: BlockNumber, block_type: BlockType) -> Result<()> {
        for n in 0..block_type.blocks_4k() {
            self.pmem
                .copy_block(BlockNumber(src.0 + n), BlockNumber(dst.0 + n))?;
        }
        Ok(())
    }

    pub(crate) fn zero_blocks(&self, block: BlockNumber, block_type: BlockType) -> Result<()> {
        let len = usize::try_from(block_type.size())
            .map_err(|_| PmcError::InvalidArgument("block size overflows usize".to_owned()))?;
        self.pmem.zero(self.pmem.block_offset(block)?, len)
    }

    /// Hand blocks no longer referenced by `txn` back to the allocator,
    /// through the free-request queue when `defer` is set.
    pub(crate) fn retire(&self, txn: TxnId, blocks: Vec<BlockNumber>, block_type: BlockType, defer: bool) {
        if blocks.is_empty() {
            return;
        }
        let blocks: Vec<(BlockNumber, BlockType)> =
            blocks.into_iter().map(|block| (block, block_type)).collect();
        if !defer {
            let _superblock = self.lock_superblock();
            self.free_locked(&blocks);
            return;
        }

        let count = blocks.len() as u64;
        self.retired.lock().entry(txn).or_default().extend(blocks);
        match self.queue.enqueue(FreeRequest::new(self.id, txn)) {
            Ok(full) => {
                Counters::bump(&self.counters.deferred_frees, count);
                if full {
                    tracing::debug!(target: "pmc::fs", fs = self.id.0, "free-request queue now full");
                }
            }
            Err(err) => {
                tracing::warn!(
                    target: "pmc::fs",
                    fs = self.id.0,
                    txn = txn.0,
                    error = %err,
                    "deferred free rejected; freeing inline"
                );
                self.reclaim_txn(txn);
            }
        }
    }

    fn free_locked(&self, blocks: &[(BlockNumber, BlockType)]) -> usize {
        let mut freed = 0;
        for &(block, block_type) in blocks {
            match self.alloc.free_block(block, block_type) {
                Ok(()) => freed += 1,
                Err(err) => {
                    self.mark_degraded();
                    tracing::error!(
                        target: "pmc::fs",
                        fs = self.id.0,
                        block = block.0,
                        error = %err,
                        "block free failed"
                    );
                }
            }
        }
        Counters::bump(&self.counters.freed_blocks, freed as u64);
        freed
    }

    /// Free the blocks retired by `txn`. Returns how many were freed.
    pub fn reclaim_txn(&self, txn: TxnId) -> usize {
        let Some(blocks) = self.retired.lock().remove(&txn) else {
            return 0;
        };
        let _superblock = self.lock_superblock();
        self.free_locked(&blocks)
    }

    /// Free every retired block of this filesystem.
    pub fn reclaim_all(&self) -> usize {
        let _superblock = self.lock_superblock();
        self.reclaim_all_locked()
    }

    fn reclaim_all_locked(&self) -> usize {
        let retired: Vec<_> = self.retired.lock().drain().collect();
        retired
            .iter()
            .map(|(_, blocks)| self.free_locked(blocks))
            .sum()
    }

    // ── fallocate ───────────────────────────────────────────────────────

    /// Allocate blocks for `[offset, offset + len)`. Returns how many holes
    /// were filled.
    ///
    /// Only `FALLOC_FL_KEEP_SIZE` is accepted in `mode`. Blocks allocated
    /// before an allocation failure are kept.
    pub fn fallocate(&self, inode: &Arc<Inode>, mode: u32, offset: u64, len: u64) -> Result<u64> {
        if mode & !FALLOC_FL_KEEP_SIZE != 0 {
            return Err(PmcError::Unsupported(format!("fallocate mode {mode:#x}")));
        }
        if inode.is_dir() {
            return Err(PmcError::IsDirectory);
        }
        if len == 0 {
            return Err(PmcError::InvalidArgument("zero-length fallocate".to_owned()));
        }
        let keep_size = mode & FALLOC_FL_KEEP_SIZE != 0;
        let new_size = offset
            .checked_add(len)
            .ok_or_else(|| PmcError::InvalidArgument("fallocate range overflows".to_owned()))?;

        let _update = inode.lock_update();
        let block_type = inode.block_type();
        let mask = block_type.size() - 1;
        let start_block = offset >> block_type.shift();
        let num_blocks = ((offset & mask) + len + mask) >> block_type.shift();
        let max_log_entries = usize::try_from(num_blocks)
            .ok()
            .and_then(|n| n.checked_add(MAX_INODE_LOG_ENTRIES))
            .ok_or_else(|| PmcError::InvalidArgument("fallocate range too large".to_owned()))?;

        let mut txn = Transaction::begin(self, Arc::clone(inode), max_log_entries, block_type)?;
        txn.log_inode()?;
        let allocated = txn.alloc_blocks(start_block, num_blocks);
        inode.touch();
        inode.update(|state| {
            if allocated.is_err() || keep_size {
                state.flags |= EOFBLOCKS_FL;
            }
            if !keep_size && new_size > state.size {
                state.size = new_size;
            }
        });
        txn.commit()?;

        let filled = allocated?;
        tracing::debug!(
            target: "pmc::fs",
            ino = inode.ino().0,
            offset,
            len,
            keep_size,
            filled,
            "fallocate"
        );
        Ok(filled)
    }

    // ── Crash simulation and recovery ───────────────────────────────────

    /// Lose everything not yet durable on the medium and in every inode.
    pub fn power_fail(&self) {
        self.pmem.power_fail();
        for inode in self.inodes.read().values() {
            inode.power_fail();
        }
        tracing::warn!(target: "pmc::fs", fs = self.id.0, "power failure");
    }

    /// Roll back every transaction still in the log area and rebuild block
    /// occupancy. Run after [`PmemFs::power_fail`].
    ///
    /// Must not be called while the calling thread holds an open
    /// transaction.
    pub fn recover(&self) -> Result<RecoveryReport> {
        self.replay_active_logs("recover")
    }

    /// Restore a consistent state after a failed commit and clear the
    /// degraded flag.
    pub fn revalidate(&self) -> Result<RecoveryReport> {
        self.replay_active_logs("revalidate")
    }

    fn replay_active_logs(&self, reason: &'static str) -> Result<RecoveryReport> {
        let _gate = self.txn_gate.write();
        let logs = std::mem::take(&mut *self.active_logs.lock());
        let mut report = RecoveryReport::default();
        for log in logs.values().rev() {
            let undo = replay_undo(log, self)?;
            report.undo.data_restored += undo.data_restored;
            report.undo.inodes_restored += undo.inodes_restored;
            report.undo.pointers_restored += undo.pointers_restored;
            report.logs_replayed += 1;
        }

        let used: Vec<(BlockNumber, BlockType)> = self
            .inodes
            .read()
            .values()
            .flat_map(|inode| inode.durable_blocks())
            .collect();
        {
            let _superblock = self.lock_superblock();
            self.retired.lock().clear();
            self.alloc.rebuild(&used)?;
        }
        report.blocks_in_use = used.len();
        self.degraded.store(false, Ordering::Release);
        Counters::bump(&self.counters.recoveries, 1);
        tracing::info!(
            target: "pmc::fs",
            fs = self.id.0,
            reason,
            logs = report.logs_replayed,
            data = report.undo.data_restored,
            pointers = report.undo.pointers_restored,
            blocks_in_use = report.blocks_in_use,
            "active logs replayed"
        );
        Ok(report)
    }

    #[must_use]
    pub fn stats(&self) -> FsStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let c = &self.counters;
        FsStats {
            fs: self.id,
            syncs: load(&c.syncs),
            commits: load(&c.commits),
            aborts: load(&c.aborts),
            commit_failures: load(&c.commit_failures),
            cowed_blocks: load(&c.cowed_blocks),
            written_pages: load(&c.written_pages),
            deferred_frees: load(&c.deferred_frees),
            freed_blocks: load(&c.freed_blocks),
            injected_faults: load(&c.injected_faults),
            recoveries: load(&c.recoveries),
            emulated_ns: self.latency.total_emulated_ns(),
            free_blocks: self.alloc.free_count(),
            log_available: self.log_area.available(),
            active_logs: self.active_log_count(),
            retired_pending: self.retired.lock().values().map(Vec::len).sum(),
            degraded: self.is_degraded(),
            flush: self.pmem.stats(),
        }
    }
}

impl UndoTarget for PmemFs {
    fn restore_data(&self, image: &BeforeImage) -> Result<()> {
        let offset = self.pmem.block_offset(image.block)? + image.offset;
        self.pmem.write(offset, &image.data)?;
        self.pmem.flush_buffer(offset, image.data.len(), true)
    }

    fn restore_inode(&self, image: &InodeImage) -> Result<()> {
        self.inode(image.ino)?.apply_image(image);
        Ok(())
    }

    fn restore_pointer(&self, swap: &PointerSwap) -> Result<()> {
        self.inode(swap.ino)?
            .restore_pointer(swap.file_block, swap.old);
        Ok(())
    }
}

fn read_blocks(
    blocks: &BTreeMap<u64, BlockNumber>,
    block_type: BlockType,
    offset: u64,
    buf: &mut [u8],
    mut read: impl FnMut(u64, &mut [u8]) -> Result<()>,
) -> Result<()> {
    let block_size = block_type.size();
    let mut done = 0_usize;
    while done < buf.len() {
        let pos = offset + done as u64;
        let file_block = pos / block_size;
        let in_block = pos % block_size;
        let chunk = usize::try_from((block_size - in_block).min((buf.len() - done) as u64))
            .map_err(|_| PmcError::InvalidArgument("chunk overflows usize".to_owned()))?;
        let out = &mut buf[done..done + chunk];
        match blocks.get(&file_block) {
            Some(block) => read(block.0 * PAGE_SIZE + in_block, out)?,
            None => out.fill(0),
        }
        done += chunk;
    }
    Ok(())
}
