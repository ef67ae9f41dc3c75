#![forbid(unsafe_code)]
//! Identifier newtypes and geometry constants shared by every pmc crate.
//!
//! Units are carried in the type: a [`PageIndex`] is a file-relative 4 KiB
//! page, a [`BlockNumber`] is a physical 4 KiB slot on the persistent-memory
//! device, and a [`VirtAddr`] is a user virtual address inside a mapping.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Base page size used by mappings and the device.
pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Cache-line size assumed by the flush primitive.
pub const CACHELINE_SIZE: u64 = 64;

pub const SIZE_2M: u64 = 0x20_0000;
pub const SIZE_1G: u64 = 0x4000_0000;

/// Log entries reserved per transaction for the inode itself.
pub const MAX_INODE_LOG_ENTRIES: usize = 2;

/// Set-user-ID and set-group-ID mode bits.
pub const S_ISUID: u32 = 0o4000;
pub const S_ISGID: u32 = 0o2000;
pub const S_IXGRP: u32 = 0o0010;
pub const S_IFDIR: u32 = 0o040_000;
pub const S_IFREG: u32 = 0o100_000;
pub const S_IFMT: u32 = 0o170_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

/// Identifies one mounted filesystem instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FsId(pub u64);

/// Physical page frame backing a virtual page in a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FrameNumber(pub u64);

/// File-relative page index (`page->index`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageIndex(pub u64);

impl PageIndex {
    /// Byte offset of this page within its file.
    #[must_use]
    pub fn byte_offset(self) -> u64 {
        self.0 << PAGE_SHIFT
    }

    /// Page containing the given file byte offset.
    #[must_use]
    pub fn containing(offset: u64) -> Self {
        Self(offset >> PAGE_SHIFT)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User virtual address inside a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    #[must_use]
    pub fn page_align_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    #[must_use]
    pub fn is_aligned(self, align: u64) -> bool {
        debug_assert!(align.is_power_of_two());
        self.0 & (align - 1) == 0
    }

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Per-file block granularity hint.
///
/// Data blocks of a file are allocated as naturally aligned runs of
/// `blocks_4k()` device blocks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum BlockType {
    #[default]
    #[serde(rename = "4k")]
    FourK,
    #[serde(rename = "2m")]
    TwoM,
    #[serde(rename = "1g")]
    OneG,
}

impl BlockType {
    /// Size of one block of this type in bytes.
    #[must_use]
    pub fn size(self) -> u64 {
        match self {
            Self::FourK => PAGE_SIZE,
            Self::TwoM => SIZE_2M,
            Self::OneG => SIZE_1G,
        }
    }

    #[must_use]
    pub fn shift(self) -> u32 {
        self.size().trailing_zeros()
    }

    /// Number of 4 KiB device blocks covered by one block of this type.
    #[must_use]
    pub fn blocks_4k(self) -> u64 {
        self.size() / PAGE_SIZE
    }

    /// Number of mapping pages covered by one block of this type.
    #[must_use]
    pub fn pages_per_block(self) -> u64 {
        self.blocks_4k()
    }

    /// Pick the granularity for a file expected to grow to `new_size` bytes.
    #[must_use]
    pub fn for_file_size(new_size: u64) -> Self {
        if new_size >= SIZE_1G {
            Self::OneG
        } else if new_size >= SIZE_2M {
            Self::TwoM
        } else {
            Self::FourK
        }
    }

    /// Alignment a mapping of a file with this hint must honour.
    #[must_use]
    pub fn mmap_alignment(self) -> u64 {
        self.size()
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FourK => "4K",
            Self::TwoM => "2M",
            Self::OneG => "1G",
        };
        f.write_str(name)
    }
}

/// Round `value` up to a multiple of `align` (a power of two).
#[must_use]
pub fn align_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

/// Round `value` down to a multiple of `align` (a power of two).
#[must_use]
pub fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}
