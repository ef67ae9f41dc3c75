#![forbid(unsafe_code)]
//! Undo log for COW-sync transactions.
//!
//! A transaction records, before it mutates anything that is not newly
//! allocated, what the thing looked like:
//!
//! - [`InodeImage`]: the inode fields the sync touches (size, times, mode,
//!   flags, block-type hint).
//! - [`PointerSwap`]: one file block pointer about to move from an old
//!   physical block to a freshly copied one.
//! - [`BeforeImage`]: old content of a byte range inside a block that is
//!   written in place.
//!
//! [`TxnLog`] is append-only and bounded by the capacity reserved from the
//! per-filesystem [`LogArea`] at `begin`. After a crash, [`replay_undo`]
//! walks a log newest-first against an [`UndoTarget`] and puts everything
//! back.

mod area;

use pmc_error::{PmcError, Result};
use pmc_types::{BlockNumber, BlockType, InodeNumber, TxnId};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use area::{LogArea, LogReservation};

/// Lifecycle of a transaction. `Committed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnState {
    Open,
    Committed,
    Aborted,
}

impl TxnState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inode fields a sync may change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeImage {
    pub ino: InodeNumber,
    pub size: u64,
    pub mode: u32,
    pub flags: u32,
    pub mtime_ns: u64,
    pub ctime_ns: u64,
    pub block_type: BlockType,
}

/// A file block pointer about to be republished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerSwap {
    pub ino: InodeNumber,
    /// File-relative block index, in units of `block_type`.
    pub file_block: u64,
    /// `None` when the pointer was a hole.
    pub old: Option<BlockNumber>,
    pub new: BlockNumber,
    pub block_type: BlockType,
}

/// Old content of a byte range inside one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeforeImage {
    pub block: BlockNumber,
    pub block_type: BlockType,
    /// Byte offset of `data` within the block.
    pub offset: u64,
    pub data: Vec<u8>,
    pub crc32c: u32,
}

impl BeforeImage {
    #[must_use]
    pub fn new(block: BlockNumber, block_type: BlockType, offset: u64, data: Vec<u8>) -> Self {
        let crc32c = crc32c::crc32c(&data);
        Self {
            block,
            block_type,
            offset,
            data,
            crc32c,
        }
    }

    /// Whether `data` still matches the checksum taken at capture.
    #[must_use]
    pub fn verify(&self) -> bool {
        crc32c::crc32c(&self.data) == self.crc32c
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntry {
    Inode(InodeImage),
    Pointer(PointerSwap),
    Data(BeforeImage),
}

/// Append-only log owned by one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnLog {
    txn: TxnId,
    capacity: usize,
    entries: Vec<LogEntry>,
}

impl TxnLog {
    #[must_use]
    pub fn new(txn: TxnId, capacity: usize) -> Self {
        Self {
            txn,
            capacity,
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn txn(&self) -> TxnId {
        self.txn
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity - self.entries.len()
    }

    /// Append an entry; `LogFull` once the reserved capacity is used up.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        if self.entries.len() >= self.capacity {
            return Err(PmcError::LogFull {
                capacity: self.capacity,
            });
        }
        tracing::trace!(
            target: "pmc::journal",
            txn = self.txn.0,
            kind = entry_kind(&entry),
            len = self.entries.len() + 1,
            "log append"
        );
        self.entries.push(entry);
        Ok(())
    }

    #[must_use]
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Pointer swaps in append order.
    pub fn pointer_swaps(&self) -> impl Iterator<Item = &PointerSwap> {
        self.entries.iter().filter_map(|entry| match entry {
            LogEntry::Pointer(swap) => Some(swap),
            _ => None,
        })
    }

    /// Entries that capture old block content: COWed pointers plus in-place
    /// data images.
    #[must_use]
    pub fn before_images(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry, LogEntry::Pointer(_) | LogEntry::Data(_)))
            .count()
    }
}

fn entry_kind(entry: &LogEntry) -> &'static str {
    match entry {
        LogEntry::Inode(_) => "inode",
        LogEntry::Pointer(_) => "pointer",
        LogEntry::Data(_) => "data",
    }
}

/// Store a log is replayed against.
pub trait UndoTarget {
    /// Write `image.data` back at `image.offset` inside `image.block`.
    fn restore_data(&self, image: &BeforeImage) -> Result<()>;

    /// Reset the inode fields recorded in `image`.
    fn restore_inode(&self, image: &InodeImage) -> Result<()>;

    /// Point `swap.file_block` back at `swap.old`.
    fn restore_pointer(&self, swap: &PointerSwap) -> Result<()>;
}

/// Counts from one replay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UndoReport {
    pub data_restored: usize,
    pub inodes_restored: usize,
    pub pointers_restored: usize,
}

/// Undo every entry of `log`, newest first.
///
/// A data image whose checksum no longer matches stops the replay with
/// `Corruption`; nothing older than it is applied.
pub fn replay_undo(log: &TxnLog, target: &dyn UndoTarget) -> Result<UndoReport> {
    let mut report = UndoReport::default();
    for entry in log.entries().iter().rev() {
        match entry {
            LogEntry::Data(image) => {
                if !image.verify() {
                    return Err(PmcError::Corruption {
                        block: image.block.0,
                        detail: format!("before-image checksum mismatch in txn {}", log.txn()),
                    });
                }
                target.restore_data(image)?;
                report.data_restored += 1;
            }
            LogEntry::Inode(image) => {
                target.restore_inode(image)?;
                report.inodes_restored += 1;
            }
            LogEntry::Pointer(swap) => {
                target.restore_pointer(swap)?;
                report.pointers_restored += 1;
            }
        }
    }
    tracing::debug!(
        target: "pmc::journal",
        txn = log.txn().0,
        data = report.data_restored,
        inodes = report.inodes_restored,
        pointers = report.pointers_restored,
        "undo replay complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    /// Block store plus a single inode, enough to replay logs against.
    #[derive(Default)]
    struct MemStore {
        blocks: Mutex<BTreeMap<u64, Vec<u8>>>,
        inode: Mutex<Option<InodeImage>>,
        pointers: Mutex<BTreeMap<u64, Option<BlockNumber>>>,
    }

    impl UndoTarget for MemStore {
        fn restore_data(&self, image: &BeforeImage) -> Result<()> {
            let mut blocks = self.blocks.lock();
            let block = blocks.entry(image.block.0).or_insert_with(|| vec![0; 16]);
            let start = usize::try_from(image.offset).expect("offset");
            block[start..start + image.data.len()].copy_from_slice(&image.data);
            Ok(())
        }

        fn restore_inode(&self, image: &InodeImage) -> Result<()> {
            *self.inode.lock() = Some(image.clone());
            Ok(())
        }

        fn restore_pointer(&self, swap: &PointerSwap) -> Result<()> {
            self.pointers.lock().insert(swap.file_block, swap.old);
            Ok(())
        }
    }

    fn inode_image(size: u64) -> InodeImage {
        InodeImage {
            ino: InodeNumber(2),
            size,
            mode: 0o100_644,
            flags: 0,
            mtime_ns: 1,
            ctime_ns: 1,
            block_type: BlockType::FourK,
        }
    }

    #[test]
    fn append_past_capacity_is_log_full() {
        let mut log = TxnLog::new(TxnId(1), 2);
        log.append(LogEntry::Inode(inode_image(0))).expect("first");
        log.append(LogEntry::Inode(inode_image(1))).expect("second");
        assert_eq!(log.remaining(), 0);
        assert_eq!(
            log.append(LogEntry::Inode(inode_image(2))),
            Err(PmcError::LogFull { capacity: 2 })
        );
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn replay_runs_newest_first() {
        let store = MemStore::default();
        let mut log = TxnLog::new(TxnId(7), 8);
        // Two images of the same range: the oldest must win.
        log.append(LogEntry::Data(BeforeImage::new(
            BlockNumber(3),
            BlockType::FourK,
            4,
            vec![1, 1],
        )))
        .expect("append");
        log.append(LogEntry::Data(BeforeImage::new(
            BlockNumber(3),
            BlockType::FourK,
            4,
            vec![2, 2],
        )))
        .expect("append");
        log.append(LogEntry::Inode(inode_image(4096))).expect("append");
        log.append(LogEntry::Pointer(PointerSwap {
            ino: InodeNumber(2),
            file_block: 0,
            old: Some(BlockNumber(3)),
            new: BlockNumber(9),
            block_type: BlockType::FourK,
        }))
        .expect("append");

        let report = replay_undo(&log, &store).expect("replay");
        assert_eq!(report.data_restored, 2);
        assert_eq!(report.pointers_restored, 1);
        assert_eq!(report.inodes_restored, 1);
        assert_eq!(log.before_images(), 3);

        assert_eq!(store.blocks.lock()[&3][4..6], [1, 1]);
        assert_eq!(store.pointers.lock()[&0], Some(BlockNumber(3)));
        assert_eq!(store.inode.lock().as_ref().map(|i| i.size), Some(4096));
    }

    #[test]
    fn corrupted_image_stops_replay() {
        let store = MemStore::default();
        let mut log = TxnLog::new(TxnId(1), 4);
        let mut image = BeforeImage::new(BlockNumber(1), BlockType::FourK, 0, vec![5; 4]);
        image.data[0] = 6;
        log.append(LogEntry::Data(image)).expect("append");
        let err = replay_undo(&log, &store).expect_err("corrupt");
        assert!(matches!(err, PmcError::Corruption { block: 1, .. }));
        assert!(store.blocks.lock().is_empty());
    }

    #[test]
    fn state_names() {
        assert_eq!(TxnState::Committed.to_string(), "committed");
        assert!(TxnState::Aborted.is_terminal());
        assert!(!TxnState::Open.is_terminal());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Overlapping in-place writes and pointer moves, each logged before
        /// it is applied, replay back to the starting state.
        #[test]
        fn replay_restores_starting_state(
            writes in proptest::collection::vec((0_usize..12, 1_usize..5, any::<u8>()), 0..24),
            moves in proptest::collection::vec((0_u64..4, 100_u64..200), 0..12),
        ) {
            let store = MemStore::default();
            let original: Vec<u8> = (0..16).collect();
            store.blocks.lock().insert(3, original.clone());
            let start: BTreeMap<u64, Option<BlockNumber>> =
                (0..4).map(|fb| (fb, (fb % 2 == 0).then_some(BlockNumber(fb + 10)))).collect();
            *store.pointers.lock() = start.clone();

            let mut log = TxnLog::new(TxnId(1), writes.len() + moves.len());
            for (offset, len, byte) in writes {
                let mut blocks = store.blocks.lock();
                let block = blocks.get_mut(&3).expect("block");
                let old = block[offset..offset + len].to_vec();
                log.append(LogEntry::Data(BeforeImage::new(
                    BlockNumber(3),
                    BlockType::FourK,
                    offset as u64,
                    old,
                )))
                .expect("append");
                block[offset..offset + len].fill(byte);
            }
            for (file_block, new) in moves {
                let mut pointers = store.pointers.lock();
                let old = pointers.get(&file_block).copied().flatten();
                log.append(LogEntry::Pointer(PointerSwap {
                    ino: InodeNumber(2),
                    file_block,
                    old,
                    new: BlockNumber(new),
                    block_type: BlockType::FourK,
                }))
                .expect("append");
                pointers.insert(file_block, Some(BlockNumber(new)));
            }

            replay_undo(&log, &store).expect("replay");
            prop_assert_eq!(&store.blocks.lock()[&3], &original);
            prop_assert_eq!(&*store.pointers.lock(), &start);
        }
    }
}
