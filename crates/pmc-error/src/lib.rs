#![forbid(unsafe_code)]
//! Error types for pmc.
//!
//! # Error Taxonomy
//!
//! `PmcError` is the single error type returned by every public surface of the
//! workspace: the transaction manager, the COW-sync orchestrator, the fsync
//! entry point and the allocator. Only one variant is non-fatal:
//! `PageResolution` is absorbed by the dirty-page scanner and never reaches a
//! sync caller. Every other variant raised between `begin` and `commit`
//! aborts the owning transaction before it propagates.
//!
//! ## errno Mapping
//!
//! Every `PmcError` variant maps to exactly one POSIX errno via
//! [`PmcError::to_errno`]. The mapping is exhaustive (no wildcard arms) so
//! adding a new variant is a compile error until its errno is assigned.
//!
//! | Variant | errno | Constant |
//! |---------|-------|----------|
//! | `OutOfLogSpace` | `ENOSPC` | 28 |
//! | `LogFull` | `ENOBUFS` | 105 |
//! | `NoSpace` | `ENOSPC` | 28 |
//! | `AllocationFailed` | `ENOMEM` | 12 |
//! | `PageResolution` | `EFAULT` | 14 |
//! | `WriteBackFailed` | `EIO` | 5 |
//! | `PermissionDenied` | `EPERM` | 1 |
//! | `QueueFull` | `EAGAIN` | 11 |
//! | `NoData` | `ENODATA` | 61 |
//! | `InvalidState` | `EINVAL` | 22 |
//! | `InjectedFault` | `EIO` | 5 |
//! | `Degraded` | `EIO` | 5 |
//! | `Corruption` | `EIO` | 5 |
//! | `InvalidArgument` | `EINVAL` | 22 |
//! | `Unsupported` | `EOPNOTSUPP` | 95 |
//! | `NotFound` | `ENOENT` | 2 |
//! | `IsDirectory` | `ENODEV` | 19 |
//!
//! The fsync entry point reports failures as a negative errno, see
//! [`PmcError::to_status`].

use thiserror::Error;

/// Unified error type for all pmc operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PmcError {
    /// The per-filesystem log area cannot reserve the requested entry count.
    #[error("out of log space: requested {requested} entries, {available} available")]
    OutOfLogSpace { requested: usize, available: usize },

    /// A transaction tried to append past the capacity reserved at `begin`.
    #[error("transaction log full ({capacity} entries)")]
    LogFull { capacity: usize },

    /// No free block is available, even after reclaiming retired blocks.
    #[error("no space left on device")]
    NoSpace,

    /// A bounded allocation (tracked-entry list, transaction state) failed.
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    /// The page-table entry for an address could not be resolved.
    ///
    /// Non-fatal during a scan: the entry is skipped and counted.
    #[error("page-table resolution failed at {addr:#x}")]
    PageResolution { addr: u64 },

    /// Copying cached page content into persistent memory failed.
    #[error("write-back failed for page {page}: {detail}")]
    WriteBackFailed { page: u64, detail: String },

    /// The set-user/group-ID bits could not be removed.
    #[error("permission denied")]
    PermissionDenied,

    /// The deferred free-request queue is at capacity.
    #[error("free-request queue full ({capacity} entries)")]
    QueueFull { capacity: usize },

    /// Nothing to flush: empty file or empty range.
    #[error("no data in range")]
    NoData,

    /// A transaction lifecycle rule was violated (e.g. double commit).
    #[error("transaction {txn} is {state}")]
    InvalidState { txn: u64, state: &'static str },

    /// An injected fault fired at a named failure point.
    #[error("injected fault at {point}")]
    InjectedFault { point: String },

    /// A previous commit failed; state must be revalidated first.
    #[error("filesystem degraded after failed commit; revalidation required")]
    Degraded,

    /// Allocator or log metadata is inconsistent.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The operation is not defined for directories.
    #[error("is a directory")]
    IsDirectory,
}

impl PmcError {
    /// Convert this error into a POSIX errno.
    ///
    /// Policy notes:
    /// - `LogFull` → `ENOBUFS`: distinguishes a mis-sized transaction from a
    ///   log area that is simply busy (`OutOfLogSpace` → `ENOSPC`).
    /// - `QueueFull` → `EAGAIN`: callers fall back to a synchronous free, so
    ///   this errno only surfaces if the fallback is disabled.
    /// - `IsDirectory` → `ENODEV`: matches what fallocate reports for
    ///   directories on this filesystem.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::OutOfLogSpace { .. } | Self::NoSpace => libc::ENOSPC,
            Self::LogFull { .. } => libc::ENOBUFS,
            Self::AllocationFailed(_) => libc::ENOMEM,
            Self::PageResolution { .. } => libc::EFAULT,
            Self::WriteBackFailed { .. }
            | Self::InjectedFault { .. }
            | Self::Degraded
            | Self::Corruption { .. } => libc::EIO,
            Self::PermissionDenied => libc::EPERM,
            Self::QueueFull { .. } => libc::EAGAIN,
            Self::NoData => libc::ENODATA,
            Self::InvalidState { .. } | Self::InvalidArgument(_) => libc::EINVAL,
            Self::Unsupported(_) => libc::EOPNOTSUPP,
            Self::NotFound(_) => libc::ENOENT,
            Self::IsDirectory => libc::ENODEV,
        }
    }

    /// Negative errno, as returned by the fsync entry point.
    #[must_use]
    pub fn to_status(&self) -> libc::c_int {
        -self.to_errno()
    }

    /// Whether a scan may skip past this error and continue.
    #[must_use]
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::PageResolution { .. })
    }
}

/// Result alias using `PmcError`.
pub type Result<T> = std::result::Result<T, PmcError>;
