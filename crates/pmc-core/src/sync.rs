//! Sync dispatch and the COW-sync orchestrator.
//!
//! `fsync` codes below [`COW_SYNC_BASE`] take the plain flush path; codes
//! from there up select a [`CowSyncMode`]. The numeric codes and msync flag
//! bits are shared with callers outside this crate and are fixed:
//!
//! | code | msync flag | mode                         |
//! |------|------------|------------------------------|
//! | 0-10 |            | plain flush                  |
//! | 11   |            | atomic-mapping commit, flush |
//! | 12   | none       | `CowWriteback`               |
//! | 13   | `0x008`    | `CowWritebackEmulated`       |
//! | 14   | `0x010`    | `WritebackOnly`              |
//! | 15   | `0x020`    | `CowOnly`                    |
//! | 16   | `0x040`    | `CowWritebackDeferredFree`   |
//! | 17   | `0x080`    | `CowWritebackFlush`          |
//! | 18   | `0x100`    | `FlushSuppressed`            |

use pmc_error::{PmcError, Result};
use pmc_mmap::{DirtyPageSource, MemMapping, scan_dirty};
use pmc_pmem::cache_line_span;
use pmc_types::{MAX_INODE_LOG_ENTRIES, PAGE_SHIFT, PAGE_SIZE, PageIndex, TxnId, VirtAddr};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::fault::FailPoint;
use crate::fs::{FileHandle, PmemFs};
use crate::inode::Credentials;
use crate::txn::{CommitSummary, Transaction};

pub const MS_ASYNC: u32 = 0x001;
pub const MS_INVALIDATE: u32 = 0x002;
pub const MS_SYNC: u32 = 0x004;
pub const MS_COW_EMULATED: u32 = 0x008;
pub const MS_WRITEBACK_ONLY: u32 = 0x010;
pub const MS_COW_ONLY: u32 = 0x020;
pub const MS_DEFERRED_FREE: u32 = 0x040;
pub const MS_PAGE_FLUSH: u32 = 0x080;
pub const MS_FLUSH_SUPPRESSED: u32 = 0x100;

const MS_COW_MASK: u32 = MS_COW_EMULATED
    | MS_WRITEBACK_ONLY
    | MS_COW_ONLY
    | MS_DEFERRED_FREE
    | MS_PAGE_FLUSH
    | MS_FLUSH_SUPPRESSED;

/// Smallest fsync code that selects a COW-sync.
pub const COW_SYNC_BASE: u32 = 12;
/// fsync code that commits an atomic mapping before flushing.
pub const ATOMIC_MAPPING_CODE: u32 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CowSyncMode {
    /// COW and write-back, no latency emulation.
    CowWriteback,
    CowWritebackEmulated,
    /// Write into the current blocks; nothing is copied.
    WritebackOnly,
    /// Copy blocks but leave the dirty pages for a later write-back.
    CowOnly,
    /// Like `CowWritebackEmulated`, freeing replaced blocks through the queue.
    CowWritebackDeferredFree,
    /// Flush each page as it is written back, without a fence.
    CowWritebackFlush,
    FlushSuppressed,
}

impl CowSyncMode {
    pub const ALL: [Self; 7] = [
        Self::CowWriteback,
        Self::CowWritebackEmulated,
        Self::WritebackOnly,
        Self::CowOnly,
        Self::CowWritebackDeferredFree,
        Self::CowWritebackFlush,
        Self::FlushSuppressed,
    ];

    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Self::CowWriteback => 12,
            Self::CowWritebackEmulated => 13,
            Self::WritebackOnly => 14,
            Self::CowOnly => 15,
            Self::CowWritebackDeferredFree => 16,
            Self::CowWritebackFlush => 17,
            Self::FlushSuppressed => 18,
        }
    }

    pub fn from_code(code: u32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.code() == code)
            .ok_or_else(|| PmcError::InvalidArgument(format!("unknown cow sync code {code}")))
    }

    /// msync flag bit selecting this mode; `CowWriteback` has none.
    #[must_use]
    pub fn msync_flag(self) -> Option<u32> {
        match self {
            Self::CowWriteback => None,
            Self::CowWritebackEmulated => Some(MS_COW_EMULATED),
            Self::WritebackOnly => Some(MS_WRITEBACK_ONLY),
            Self::CowOnly => Some(MS_COW_ONLY),
            Self::CowWritebackDeferredFree => Some(MS_DEFERRED_FREE),
            Self::CowWritebackFlush => Some(MS_PAGE_FLUSH),
            Self::FlushSuppressed => Some(MS_FLUSH_SUPPRESSED),
        }
    }

    /// Map msync flags to a mode. The lowest COW bit wins.
    pub fn from_msync_flags(flags: u32) -> Result<Self> {
        if flags & !(MS_ASYNC | MS_INVALIDATE | MS_SYNC | MS_COW_MASK) != 0 {
            return Err(PmcError::InvalidArgument(format!(
                "unknown msync flags {flags:#x}"
            )));
        }
        if flags & MS_ASYNC != 0 && flags & MS_SYNC != 0 {
            return Err(PmcError::InvalidArgument(
                "MS_ASYNC and MS_SYNC are exclusive".to_owned(),
            ));
        }
        Ok(Self::ALL
            .into_iter()
            .find(|mode| mode.msync_flag().is_some_and(|bit| flags & bit != 0))
            .unwrap_or(Self::CowWriteback))
    }

    #[must_use]
    pub fn cow(self) -> bool {
        self != Self::WritebackOnly
    }

    #[must_use]
    pub fn write_back(self) -> bool {
        self != Self::CowOnly
    }

    #[must_use]
    pub fn emulate(self) -> bool {
        self != Self::CowWriteback
    }

    #[must_use]
    pub fn per_page_flush(self) -> bool {
        self == Self::CowWritebackFlush
    }

    #[must_use]
    pub fn deferred_free(self) -> bool {
        self == Self::CowWritebackDeferredFree
    }
}

impl fmt::Display for CowSyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CowWriteback => "cow-writeback",
            Self::CowWritebackEmulated => "cow-writeback-emulated",
            Self::WritebackOnly => "writeback-only",
            Self::CowOnly => "cow-only",
            Self::CowWritebackDeferredFree => "cow-writeback-deferred-free",
            Self::CowWritebackFlush => "cow-writeback-flush",
            Self::FlushSuppressed => "flush-suppressed",
        };
        f.write_str(name)
    }
}

/// What an fsync code asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncMode {
    Flush,
    AtomicMapping,
    Cow(CowSyncMode),
}

impl SyncMode {
    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            0..=10 => Ok(Self::Flush),
            ATOMIC_MAPPING_CODE => Ok(Self::AtomicMapping),
            _ => CowSyncMode::from_code(code).map(Self::Cow),
        }
    }
}

/// Outcome of one COW-sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub txn: TxnId,
    pub mode: CowSyncMode,
    pub pages_scanned: u64,
    pub dirty: usize,
    pub resolution_failures: u64,
    pub cowed: usize,
    pub written: usize,
    pub cleaned: usize,
    /// Written pages stored to again before commit finished; still dirty.
    pub redirtied: usize,
    pub commit: CommitSummary,
}

/// Make the dirty pages of `[start, end]` durable as one transaction.
///
/// `end` is inclusive. On any failure before commit the transaction is
/// rolled back and the file reads exactly as before the call.
pub fn cow_sync(
    fs: &PmemFs,
    handle: &FileHandle,
    start: VirtAddr,
    end: VirtAddr,
    mode: CowSyncMode,
    creds: Credentials,
) -> Result<SyncReport> {
    if fs.is_degraded() {
        return Err(PmcError::Degraded);
    }
    let mapping = handle
        .mapping()
        .ok_or_else(|| PmcError::InvalidArgument("file is not mapped".to_owned()))?;
    let end_exclusive = end
        .0
        .checked_add(1)
        .filter(|end| *end > start.0)
        .ok_or_else(|| PmcError::InvalidArgument(format!("empty sync range {start}..={end}")))?;
    let num_blocks = usize::try_from(((end_exclusive - start.0) >> PAGE_SHIFT) + 1)
        .map_err(|_| PmcError::InvalidArgument("sync range too large".to_owned()))?;
    let max_log_entries = MAX_INODE_LOG_ENTRIES + num_blocks + 2;

    let inode = Arc::clone(handle.inode());
    let _update = inode.lock_update();
    fs.counters().record_sync();

    let mut txn = Transaction::begin(fs, Arc::clone(&inode), max_log_entries, inode.block_type())?;
    txn.set_defer_free(mode.deferred_free());
    txn.set_fail_points(true);
    let sync = SyncRun {
        fs,
        mapping: &mapping,
        start,
        end: VirtAddr(end_exclusive),
        expected: num_blocks,
        mode,
        creds,
    };
    match sync.run(&mut txn) {
        Ok(report) => {
            tracing::info!(
                target: "pmc::sync",
                txn = report.txn.0,
                ino = inode.ino().0,
                %mode,
                dirty = report.dirty,
                cowed = report.cowed,
                written = report.written,
                "cow sync committed"
            );
            Ok(report)
        }
        Err(err) => {
            txn.abort();
            tracing::warn!(
                target: "pmc::sync",
                txn = txn.id().0,
                ino = inode.ino().0,
                %mode,
                error = %err,
                "cow sync failed"
            );
            Err(err)
        }
    }
}

struct SyncRun<'a> {
    fs: &'a PmemFs,
    mapping: &'a MemMapping,
    start: VirtAddr,
    end: VirtAddr,
    expected: usize,
    mode: CowSyncMode,
    creds: Credentials,
}

impl SyncRun<'_> {
    fn run(&self, txn: &mut Transaction<'_>) -> Result<SyncReport> {
        let fs = self.fs;
        fs.fail_point(FailPoint::AfterBegin)?;

        txn.log_inode()?;
        txn.inode().remove_suid(self.creds)?;
        fs.fail_point(FailPoint::AfterSuidStrip)?;
        txn.inode().touch();

        let scan = scan_dirty(self.mapping, self.start, self.end, self.expected)?;
        fs.fail_point(FailPoint::AfterScan)?;

        let mut cowed = 0;
        if self.mode.cow() {
            for entry in &scan.entries {
                fs.fail_point(FailPoint::BeforeCow)?;
                txn.cow_block(entry.index)?;
                cowed += 1;
            }
        }

        let mut writes = Vec::with_capacity(scan.entries.len());
        if self.mode.write_back() {
            for entry in &scan.entries {
                fs.fail_point(FailPoint::BeforeWriteBack)?;
                let write = txn.write_back(self.mapping, entry, self.mode.emulate())?;
                if self.mode.per_page_flush() {
                    fs.pmem()
                        .flush_buffer(write.offset, PAGE_SIZE as usize, false)?;
                }
                writes.push((entry, write.generation));
            }
        }
        let written = writes.len();

        fs.fail_point(FailPoint::BeforeCommit)?;
        let commit = txn.commit()?;

        // Only pages untouched since their copy may lose the dirty bit.
        let mut cleaned = 0;
        let mut redirtied = 0;
        for (entry, generation) in writes {
            match self.mapping.mark_clean(entry, generation) {
                Ok(true) => cleaned += 1,
                Ok(false) => {
                    redirtied += 1;
                    tracing::debug!(
                        target: "pmc::sync",
                        addr = %entry.addr,
                        "page stored to during sync; left dirty"
                    );
                }
                Err(err) => tracing::warn!(
                    target: "pmc::sync",
                    addr = %entry.addr,
                    error = %err,
                    "page left dirty after commit"
                ),
            }
        }

        Ok(SyncReport {
            txn: txn.id(),
            mode: self.mode,
            pages_scanned: scan.pages_scanned,
            dirty: scan.dirty(),
            resolution_failures: scan.resolution_failures,
            cowed,
            written,
            cleaned,
            redirtied,
            commit,
        })
    }
}

/// fsync entry point. `end` is inclusive and clamped to the file size.
pub fn fsync(fs: &PmemFs, handle: &FileHandle, start: u64, end: u64, code: u32) -> Result<()> {
    let mode = SyncMode::from_code(code)?;
    let inode = handle.inode();
    if !inode.is_mapped() {
        fs.pmem().fence();
        tracing::trace!(target: "pmc::sync", ino = inode.ino().0, "unmapped file; barrier only");
        return Ok(());
    }
    match mode {
        SyncMode::Flush => flush_range(fs, handle, start, end),
        SyncMode::AtomicMapping => {
            cow_sync_file_range(fs, handle, start, end, CowSyncMode::CowWriteback)?;
            flush_range(fs, handle, start, end)
        }
        SyncMode::Cow(mode) => cow_sync_file_range(fs, handle, start, end, mode).map(|_| ()),
    }
}

/// [`fsync`] with the result as `0` or a negative errno.
pub fn fsync_status(fs: &PmemFs, handle: &FileHandle, start: u64, end: u64, code: u32) -> i32 {
    match fsync(fs, handle, start, end, code) {
        Ok(()) => 0,
        Err(err) => err.to_status(),
    }
}

/// Run a COW-sync over the mapped part of the file range `[start, end]`.
fn cow_sync_file_range(
    fs: &PmemFs,
    handle: &FileHandle,
    start: u64,
    end: u64,
    mode: CowSyncMode,
) -> Result<SyncReport> {
    let mapping = handle
        .mapping()
        .ok_or_else(|| PmcError::InvalidArgument("file is not mapped".to_owned()))?;
    let map_start = mapping.first_index().byte_offset();
    let map_end = map_start + mapping.len_bytes();
    let lo = start.max(map_start);
    let hi = end.saturating_add(1).min(map_end);
    if lo >= hi {
        return Err(PmcError::NoData);
    }
    let base = mapping.base().0;
    let first = VirtAddr(base + (lo - map_start));
    let last = VirtAddr(base + (hi - 1 - map_start));
    cow_sync(fs, handle, first, last, mode, handle.credentials())
}

/// Flush the file's blocks covering `[start, end]` and fence once.
fn flush_range(fs: &PmemFs, handle: &FileHandle, start: u64, end: u64) -> Result<()> {
    let state = handle.inode().snapshot();
    let end_exclusive = end.saturating_add(1).min(state.size);
    if state.size == 0 || start >= end_exclusive {
        return Err(PmcError::NoData);
    }
    let span = cache_line_span(start, end_exclusive - start);
    let pmem = fs.pmem();
    let mut chunks = 0_u64;
    let mut offset = span.start;
    while offset < span.end {
        let index = PageIndex::containing(offset);
        let chunk_end = (index.byte_offset() + PAGE_SIZE).min(span.end);
        if let Some(device) = state.device_offset(index) {
            let len = usize::try_from(chunk_end - offset)
                .map_err(|_| PmcError::InvalidArgument("chunk overflows usize".to_owned()))?;
            pmem.flush_buffer(device + (offset - index.byte_offset()), len, false)?;
            chunks += 1;
        }
        offset = chunk_end;
    }
    pmem.fence();
    tracing::debug!(
        target: "pmc::sync",
        ino = handle.inode().ino().0,
        start = span.start,
        end = span.end,
        chunks,
        "flush fsync"
    );
    Ok(())
}
