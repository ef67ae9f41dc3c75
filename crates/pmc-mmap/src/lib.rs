#![forbid(unsafe_code)]
//! Page-table dirty tracking for memory-mapped files.
//!
//! [`DirtyPageSource`] is the capability the sync path uses to look at a
//! mapping's page-table entries: resolve one address, read the cached page
//! behind it, and clear its dirty bit. [`scan_dirty`] walks a virtual range
//! through that capability and keeps only present, valid, dirty entries.
//!
//! [`MemMapping`] is the in-memory implementation with deterministic dirty
//! bits.

mod mapping;

use pmc_error::{PmcError, Result};
use pmc_types::{FrameNumber, PAGE_SIZE, PageIndex, VirtAddr};
use serde::Serialize;

pub use mapping::MemMapping;

/// Classification of one page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PteState {
    /// Nothing mapped at this address.
    Absent,
    /// Mapped, but the frame number does not name a valid page.
    Invalid,
    Present {
        frame: FrameNumber,
        index: PageIndex,
        dirty: bool,
    },
}

/// One page carried from the scan into the COW / write-back phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrackedEntry {
    pub addr: VirtAddr,
    pub frame: FrameNumber,
    /// Page index within the mapped file.
    pub index: PageIndex,
}

/// Access to the page-table state of one mapping.
///
/// Every method takes and releases the per-entry lock internally; no lock is
/// held between calls.
pub trait DirtyPageSource: Send + Sync {
    /// Resolve and classify the entry mapping `addr`.
    ///
    /// `Err(PageResolution)` means the walk itself failed; the scanner
    /// counts it and moves on.
    fn resolve(&self, addr: VirtAddr) -> Result<PteState>;

    /// Copy the cached page content of a tracked entry into `buf`.
    ///
    /// Returns the page's store generation at the time of the copy.
    fn read_page(&self, entry: &TrackedEntry, buf: &mut [u8]) -> Result<u64>;

    /// Clear the dirty bit of `entry` if nothing was stored into the page
    /// since the copy that returned `generation`.
    ///
    /// `Ok(false)` leaves the page dirty for the next sync.
    fn mark_clean(&self, entry: &TrackedEntry, generation: u64) -> Result<bool>;
}

/// Result of one scan.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub entries: Vec<TrackedEntry>,
    pub pages_scanned: u64,
    pub absent: u64,
    pub invalid: u64,
    pub clean: u64,
    pub resolution_failures: u64,
}

impl ScanReport {
    #[must_use]
    pub fn dirty(&self) -> usize {
        self.entries.len()
    }
}

/// Walk `[start, end)` in page steps and collect the dirty entries.
///
/// The result list is reserved up front for `expected` entries; if that
/// reservation fails the scan fails with `AllocationFailed` before touching
/// any entry. The list still grows past `expected` if more dirty pages turn
/// up.
pub fn scan_dirty(
    source: &dyn DirtyPageSource,
    start: VirtAddr,
    end: VirtAddr,
    expected: usize,
) -> Result<ScanReport> {
    let mut report = ScanReport::default();
    report.entries.try_reserve_exact(expected).map_err(|err| {
        PmcError::AllocationFailed(format!("tracked entry list of {expected}: {err}"))
    })?;

    let mut addr = start.page_align_down();
    while addr < end {
        report.pages_scanned += 1;
        match source.resolve(addr) {
            Ok(PteState::Absent) => report.absent += 1,
            Ok(PteState::Invalid) => report.invalid += 1,
            Ok(PteState::Present { dirty: false, .. }) => report.clean += 1,
            Ok(PteState::Present {
                frame,
                index,
                dirty: true,
            }) => {
                tracing::trace!(target: "pmc::mmap", %addr, index = index.0, "dirty page");
                report.entries.push(TrackedEntry { addr, frame, index });
            }
            Err(err) if err.is_skippable() => {
                tracing::debug!(target: "pmc::mmap", %addr, error = %err, "skipping unresolvable page");
                report.resolution_failures += 1;
            }
            Err(err) => return Err(err),
        }
        let Some(next) = addr.checked_add(PAGE_SIZE) else {
            break;
        };
        addr = next;
    }

    tracing::debug!(
        target: "pmc::mmap",
        %start,
        %end,
        scanned = report.pages_scanned,
        dirty = report.entries.len(),
        absent = report.absent,
        invalid = report.invalid,
        failures = report.resolution_failures,
        "scan complete"
    );
    Ok(report)
}
