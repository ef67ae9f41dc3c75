#![forbid(unsafe_code)]
//! Copy-on-write sync and transactions for a persistent-memory file system.
//!
//! ## Flow of a COW-sync
//!
//! 1. Lock the inode, open a [`Transaction`] sized for the range.
//! 2. Log the inode, strip set-ID bits, touch timestamps.
//! 3. Scan the mapping for dirty pages.
//! 4. Copy each dirty page's block to a fresh block ([`Transaction::cow_block`]).
//! 5. Write the cached pages into the fresh blocks.
//! 6. Commit: flush and fence the new data, then repoint the file.
//!
//! Any failure before step 6 rolls the transaction back. A failure inside
//! commit leaves the filesystem degraded until [`PmemFs::revalidate`].

pub mod config;
pub mod fault;
pub mod fs;
pub mod inode;
pub mod reclaim;
pub mod sync;
pub mod txn;

pub use config::{CrashConfig, FsConfig};
pub use fault::{CrashLatch, FailAt, FailPoint, FaultInjector, NoFaults, RandomCrash};
pub use fs::{
    FALLOC_FL_KEEP_SIZE, FileHandle, FsEnv, FsStats, PmemFs, RecoveryReport, get_unmapped_area,
};
pub use inode::{Credentials, EOFBLOCKS_FL, IMMUTABLE_FL, Inode, InodeState};
pub use reclaim::{ReclaimHandle, ReclaimWorker};
pub use sync::{
    ATOMIC_MAPPING_CODE, COW_SYNC_BASE, CowSyncMode, SyncMode, SyncReport, cow_sync, fsync,
    fsync_status,
};
pub use txn::{CommitSummary, PageWrite, Transaction};
