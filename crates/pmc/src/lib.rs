#![forbid(unsafe_code)]
//! pmc public API facade.
//!
//! Re-exports `pmc-core` together with the identifier, error, medium and
//! mapping types its API is expressed in. This is the crate the CLI and
//! downstream consumers depend on.

pub use pmc_core::*;

pub use pmc_alloc::{BitmapAllocator, BlockAllocator, FreeRequest, FreeRequestQueue};
pub use pmc_error::{PmcError, Result};
pub use pmc_mmap::{DirtyPageSource, MemMapping, PteState, ScanReport, TrackedEntry, scan_dirty};
pub use pmc_pmem::{
    DelaySource, FlushStats, LatencyEmulator, LatencyModel, NoDelay, PersistentMemory,
    RecordingDelay, SpinDelay,
};
pub use pmc_types::{
    BlockNumber, BlockType, FsId, InodeNumber, PAGE_SIZE, PageIndex, TxnId, VirtAddr,
};
