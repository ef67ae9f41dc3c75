use parking_lot::Mutex;
use pmc_alloc::BlockAllocator;
use pmc_core::{
    CowSyncMode, CrashConfig, Credentials, FailAt, FailPoint, FaultInjector, FileHandle, FsConfig,
    FsEnv, NoFaults, PmemFs, RandomCrash, SyncReport, Transaction, cow_sync,
};
use pmc_error::PmcError;
use pmc_mmap::{MemMapping, scan_dirty};
use pmc_pmem::NoDelay;
use pmc_types::{PAGE_SIZE, PageIndex, VirtAddr};
use proptest::prelude::*;
use std::sync::Arc;

const PAGES: u64 = 4;

fn fs_with(faults: Arc<dyn FaultInjector>) -> Arc<PmemFs> {
    let config = FsConfig {
        block_count: 512,
        reserved_blocks: 16,
        log_capacity_entries: 128,
        ..FsConfig::default()
    };
    let env = FsEnv::for_config(&config)
        .with_delay(Arc::new(NoDelay))
        .with_faults(faults);
    PmemFs::with_env(config, env).expect("fs")
}

fn mapped_file(fs: &PmemFs) -> (FileHandle, VirtAddr) {
    let inode = fs.create_file(0o4755, 1000).expect("create");
    fs.fallocate(&inode, 0, 0, PAGES * PAGE_SIZE).expect("fallocate");
    let state = inode.snapshot();
    for n in 0..PAGES {
        let device = state.device_offset(PageIndex(n)).expect("allocated");
        let fill = vec![b'A' + n as u8; PAGE_SIZE as usize];
        fs.pmem().write(device, &fill).expect("write");
        fs.pmem().flush_buffer(device, fill.len(), true).expect("flush");
    }
    let handle = fs.open(inode.ino()).expect("open");
    let base = fs
        .mmap(&handle, VirtAddr(0x6000_0000), PAGES * PAGE_SIZE, false)
        .expect("mmap");
    (handle, base)
}

fn dirty_two_pages(fs: &PmemFs, handle: &FileHandle) {
    fs.write_mapped(handle, 16, b"page zero update").expect("store");
    fs.write_mapped(handle, 2 * PAGE_SIZE + 16, b"page two update").expect("store");
}

fn contents(fs: &PmemFs, handle: &FileHandle) -> Vec<u8> {
    let mut buf = vec![0_u8; (PAGES * PAGE_SIZE) as usize];
    fs.read_at(handle.inode(), 0, &mut buf).expect("read");
    buf
}

fn sync_all(
    fs: &PmemFs,
    handle: &FileHandle,
    base: VirtAddr,
    mode: CowSyncMode,
) -> pmc_error::Result<SyncReport> {
    cow_sync(
        fs,
        handle,
        base,
        VirtAddr(base.0 + PAGES * PAGE_SIZE - 1),
        mode,
        Credentials::default(),
    )
}

/// Everything a reader or the allocator could observe about the file.
#[derive(Debug, PartialEq, Eq)]
struct Observed {
    bytes: Vec<u8>,
    durable: Vec<u8>,
    blocks: Vec<(u64, u64)>,
    mode: u32,
    mtime_ns: u64,
    free_blocks: u64,
}

fn observe(fs: &PmemFs, handle: &FileHandle) -> Observed {
    let state = handle.inode().snapshot();
    let mut durable = vec![0_u8; (PAGES * PAGE_SIZE) as usize];
    fs.read_durable_at(handle.inode(), 0, &mut durable).expect("read");
    Observed {
        bytes: contents(fs, handle),
        durable,
        blocks: state.blocks.iter().map(|(k, v)| (*k, v.0)).collect(),
        mode: state.mode,
        mtime_ns: state.mtime_ns,
        free_blocks: fs.allocator().free_count(),
    }
}

#[test]
fn every_pre_commit_fault_leaves_file_unchanged() {
    for mode in [CowSyncMode::CowWriteback, CowSyncMode::WritebackOnly] {
        for point in FailPoint::PRE_COMMIT {
            if point == FailPoint::BeforeCow && !mode.cow() {
                continue;
            }
            // Per-page points also fire on the second page, after the first
            // page's copy or in-place write.
            let visits: &[u64] = match point {
                FailPoint::BeforeCow | FailPoint::BeforeWriteBack => &[1, 2],
                _ => &[1],
            };
            for &nth in visits {
                let fs = fs_with(Arc::new(FailAt::nth(point, nth)));
                let (handle, base) = mapped_file(&fs);
                dirty_two_pages(&fs, &handle);
                let before = observe(&fs, &handle);

                let err = sync_all(&fs, &handle, base, mode).expect_err("fault");
                assert_eq!(
                    err,
                    PmcError::InjectedFault {
                        point: point.to_string()
                    },
                    "{mode} at {point} #{nth}"
                );
                assert_eq!(fs.active_log_count(), 0, "{mode} at {point} #{nth}");
                fs.reclaim_all();
                assert_eq!(observe(&fs, &handle), before, "{mode} at {point} #{nth}");

                fs.power_fail();
                fs.recover().expect("recover");
                assert_eq!(
                    observe(&fs, &handle),
                    before,
                    "{mode} at {point} #{nth} after crash"
                );
                assert!(handle.mapping().expect("mapped").is_dirty(base));
            }
        }
    }
}

#[test]
fn abandoned_transaction_rolls_back_after_power_failure() {
    let fs = fs_with(Arc::new(NoFaults));
    let (handle, base) = mapped_file(&fs);
    dirty_two_pages(&fs, &handle);
    let before = observe(&fs, &handle);
    let mapping = handle.mapping().expect("mapped");

    let inode = Arc::clone(handle.inode());
    let block_type = inode.block_type();
    let mut txn = Transaction::begin(&fs, inode, 16, block_type).expect("begin");
    txn.log_inode().expect("log inode");
    let scan = scan_dirty(&*mapping, base, mapping.end(), 4).expect("scan");
    assert_eq!(scan.dirty(), 2);
    // Page zero is COWed, page two is overwritten in place.
    txn.cow_block(scan.entries[0].index).expect("cow");
    for entry in &scan.entries {
        txn.write_back(&*mapping, entry, false).expect("write back");
    }
    fs.pmem().fence();
    txn.abandon();
    assert_eq!(fs.active_log_count(), 1);
    assert_ne!(contents(&fs, &handle), before.bytes);

    fs.power_fail();
    let report = fs.recover().expect("recover");
    assert_eq!(report.logs_replayed, 1);
    assert_eq!(report.undo.data_restored, 1);
    assert_eq!(report.undo.pointers_restored, 1);
    assert_eq!(observe(&fs, &handle), before);
    assert_eq!(fs.active_log_count(), 0);
}

#[test]
fn failed_flush_in_commit_degrades_until_revalidated() {
    let fs = fs_with(Arc::new(FailAt::new(FailPoint::CommitFlush)));
    let (handle, base) = mapped_file(&fs);
    dirty_two_pages(&fs, &handle);
    let before = observe(&fs, &handle);

    let err = sync_all(&fs, &handle, base, CowSyncMode::CowWriteback).expect_err("fault");
    assert!(matches!(err, PmcError::InjectedFault { .. }));
    assert!(fs.is_degraded());
    assert_eq!(fs.stats().commit_failures, 1);
    assert_eq!(
        sync_all(&fs, &handle, base, CowSyncMode::CowWriteback),
        Err(PmcError::Degraded)
    );
    assert_eq!(fs.fallocate(handle.inode(), 0, 0, PAGE_SIZE), Err(PmcError::Degraded));

    let report = fs.revalidate().expect("revalidate");
    assert_eq!(report.logs_replayed, 1);
    assert!(!fs.is_degraded());
    assert_eq!(observe(&fs, &handle), before);

    let ok = sync_all(&fs, &handle, base, CowSyncMode::CowWriteback).expect("sync");
    assert_eq!(ok.dirty, 2);
    let mut buf = [0_u8; 16];
    fs.read_durable_at(handle.inode(), 16, &mut buf).expect("read");
    assert_eq!(&buf, b"page zero update");
}

#[test]
fn crash_between_pointer_publishes_recovers_old_pointers() {
    let fs = fs_with(Arc::new(FailAt::new(FailPoint::CommitPublish)));
    let (handle, base) = mapped_file(&fs);
    dirty_two_pages(&fs, &handle);
    let before = observe(&fs, &handle);

    sync_all(&fs, &handle, base, CowSyncMode::CowWriteback).expect_err("fault");
    assert!(fs.is_degraded());
    // The first pointer already moved.
    assert_ne!(observe(&fs, &handle).blocks, before.blocks);

    fs.power_fail();
    fs.recover().expect("recover");
    assert!(!fs.is_degraded());
    assert_eq!(observe(&fs, &handle), before);
}

#[test]
fn crash_latch_suppresses_repeat_crashes_until_reset() {
    let crash = CrashConfig {
        enabled: true,
        total_outcomes: 4,
        likelihood: 4,
        seed: Some(7),
    };
    let fs = fs_with(Arc::new(RandomCrash::from_config(&crash)));
    let (handle, base) = mapped_file(&fs);
    dirty_two_pages(&fs, &handle);

    let err = sync_all(&fs, &handle, base, CowSyncMode::CowWriteback).expect_err("crash");
    assert_eq!(
        err,
        PmcError::InjectedFault {
            point: FailPoint::AfterBegin.to_string()
        }
    );
    assert!(fs.crash_latch().has_fired());

    sync_all(&fs, &handle, base, CowSyncMode::CowWriteback).expect("latched");

    fs.reset_crash_latch();
    dirty_two_pages(&fs, &handle);
    assert!(sync_all(&fs, &handle, base, CowSyncMode::CowWriteback).is_err());
    assert_eq!(fs.stats().injected_faults, 2);
}

/// Stores into the mapping once, when a sync reaches `BeforeCommit`.
#[derive(Debug, Default)]
struct StoreBeforeCommit {
    target: Mutex<Option<(Arc<MemMapping>, VirtAddr, &'static [u8])>>,
}

impl FaultInjector for StoreBeforeCommit {
    fn should_fail(&self, point: FailPoint) -> bool {
        if point == FailPoint::BeforeCommit {
            if let Some((mapping, addr, data)) = self.target.lock().take() {
                mapping.store(addr, data).expect("concurrent store");
            }
        }
        false
    }
}

#[test]
fn store_after_write_back_keeps_page_dirty() {
    let racer = Arc::new(StoreBeforeCommit::default());
    let faults: Arc<dyn FaultInjector> = racer.clone();
    let fs = fs_with(faults);
    let (handle, base) = mapped_file(&fs);
    fs.write_mapped(&handle, 0, b"EARLY").expect("store");
    let mapping = handle.mapping().expect("mapped");
    *racer.target.lock() = Some((Arc::clone(&mapping), base, &b"LATE"[..]));

    let report = sync_all(&fs, &handle, base, CowSyncMode::CowWriteback).expect("sync");
    assert_eq!((report.written, report.cleaned, report.redirtied), (1, 0, 1));
    let mut durable = [0_u8; 5];
    fs.read_durable_at(handle.inode(), 0, &mut durable).expect("read");
    assert_eq!(&durable, b"EARLY");
    assert!(mapping.is_dirty(base));

    let report = sync_all(&fs, &handle, base, CowSyncMode::CowWriteback).expect("resync");
    assert_eq!((report.dirty, report.cleaned, report.redirtied), (1, 1, 0));
    fs.read_durable_at(handle.inode(), 0, &mut durable).expect("read");
    assert_eq!(&durable, b"LATEY");
    assert!(!mapping.is_dirty(base));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// A fault on the nth visit of any pre-commit point, followed by a power
    /// failure, never changes what the file reads back.
    #[test]
    fn fault_then_power_failure_is_atomic(
        point_idx in 0_usize..6,
        nth in 1_u64..3,
        dirty in proptest::collection::btree_set(0_u64..PAGES, 1..=PAGES as usize),
        mode_idx in 0_usize..7,
    ) {
        let point = FailPoint::PRE_COMMIT[point_idx];
        let mode = CowSyncMode::ALL[mode_idx];
        let fs = fs_with(Arc::new(FailAt::nth(point, nth)));
        let (handle, base) = mapped_file(&fs);
        for page in &dirty {
            fs.write_mapped(&handle, page * PAGE_SIZE + 8, b"new bytes").expect("store");
        }
        let before = observe(&fs, &handle);

        match sync_all(&fs, &handle, base, mode) {
            Err(err) => {
                prop_assert!(
                    matches!(err, PmcError::InjectedFault { .. }),
                    "unexpected error {:?}",
                    err
                );
                fs.power_fail();
                fs.recover().expect("recover");
                prop_assert_eq!(observe(&fs, &handle), before);
            }
            Ok(report) => {
                // The point was never reached `nth` times.
                fs.power_fail();
                fs.recover().expect("recover");
                let after = contents(&fs, &handle);
                if mode.write_back() {
                    for page in &dirty {
                        let at = (page * PAGE_SIZE + 8) as usize;
                        prop_assert_eq!(&after[at..at + 9], b"new bytes");
                    }
                } else {
                    prop_assert_eq!(after, before.bytes);
                }
                prop_assert_eq!(report.dirty, dirty.len());
            }
        }
    }
}
