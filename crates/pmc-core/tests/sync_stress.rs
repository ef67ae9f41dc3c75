use pmc_alloc::BlockAllocator;
use pmc_core::{CowSyncMode, Credentials, FileHandle, FsConfig, FsEnv, PmemFs, ReclaimWorker, cow_sync};
use pmc_pmem::NoDelay;
use pmc_types::{PAGE_SIZE, VirtAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

const PAGES_PER_FILE: u64 = 4;

fn lcg_next(state: &mut u64) -> u64 {
    *state = state
        .wrapping_mul(6_364_136_223_846_793_005)
        .wrapping_add(1);
    *state
}

fn stress_fs(queue_capacity: usize) -> Arc<PmemFs> {
    let config = FsConfig {
        block_count: 1024,
        reserved_blocks: 16,
        log_capacity_entries: 512,
        free_queue_capacity: queue_capacity,
        ..FsConfig::default()
    };
    let env = FsEnv::for_config(&config).with_delay(Arc::new(NoDelay));
    PmemFs::with_env(config, env).expect("fs")
}

fn mapped_file(fs: &PmemFs, pages: u64, hint: u64) -> (FileHandle, VirtAddr) {
    let inode = fs.create_file(0o644, 1000).expect("create");
    fs.fallocate(&inode, 0, 0, pages * PAGE_SIZE).expect("fallocate");
    let handle = fs.open(inode.ino()).expect("open");
    let base = fs
        .mmap(&handle, VirtAddr(hint), pages * PAGE_SIZE, false)
        .expect("mmap");
    (handle, base)
}

fn sync_page(fs: &PmemFs, handle: &FileHandle, base: VirtAddr, page: u64, mode: CowSyncMode) {
    let start = VirtAddr(base.0 + page * PAGE_SIZE);
    let end = VirtAddr(start.0 + PAGE_SIZE - 1);
    cow_sync(fs, handle, start, end, mode, Credentials::default()).expect("sync");
}

fn page_bytes(fs: &PmemFs, handle: &FileHandle, page: u64) -> Vec<u8> {
    let mut buf = vec![0_u8; PAGE_SIZE as usize];
    fs.read_durable_at(handle.inode(), page * PAGE_SIZE, &mut buf)
        .expect("read");
    buf
}

/// Free blocks plus blocks owned by files must cover the whole usable
/// device once nothing is retired.
fn assert_blocks_accounted(fs: &PmemFs, files: &[&FileHandle]) {
    fs.reclaim_all();
    let stats = fs.stats();
    assert_eq!(stats.retired_pending, 0);
    let owned: u64 = files
        .iter()
        .map(|handle| handle.inode().snapshot().blocks.len() as u64)
        .sum();
    let usable = fs.config().block_count - fs.config().reserved_blocks;
    assert_eq!(fs.allocator().free_count() + owned, usable);
}

#[test]
fn independent_files_sync_concurrently() {
    const WRITERS: u64 = 4;
    const OPS: u64 = 40;

    let fs = stress_fs(100);
    let files: Vec<(FileHandle, VirtAddr)> = (0..WRITERS)
        .map(|n| mapped_file(&fs, PAGES_PER_FILE, 0x1000_0000 * (n + 1)))
        .collect();
    let files = Arc::new(files);
    let synced = Arc::new(AtomicU64::new(0));

    let threads: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let fs = Arc::clone(&fs);
            let files = Arc::clone(&files);
            let synced = Arc::clone(&synced);
            thread::spawn(move || {
                let (handle, base) = &files[usize::try_from(writer).expect("fits")];
                let mut rng = 0x9E37_79B9_7F4A_7C15 ^ writer;
                for op in 0..OPS {
                    let page = lcg_next(&mut rng) % PAGES_PER_FILE;
                    let byte = u8::try_from((writer * 31 + op) % 251).expect("fits");
                    let data = vec![byte; 64];
                    fs.write_mapped(handle, page * PAGE_SIZE, &data)
                        .expect("store");
                    let mode = if op % 3 == 0 {
                        CowSyncMode::WritebackOnly
                    } else {
                        CowSyncMode::CowWriteback
                    };
                    sync_page(&fs, handle, *base, page, mode);
                    synced.fetch_add(1, Ordering::Relaxed);
                    assert_eq!(&page_bytes(&fs, handle, page)[..64], data.as_slice());
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().expect("writer thread");
    }

    let stats = fs.stats();
    assert_eq!(synced.load(Ordering::Relaxed), WRITERS * OPS);
    assert_eq!(stats.commits, WRITERS * OPS + WRITERS);
    assert_eq!(stats.aborts, 0);
    assert!(!stats.degraded);
    assert_eq!(stats.active_logs, 0);
    let handles: Vec<&FileHandle> = files.iter().map(|(handle, _)| handle).collect();
    assert_blocks_accounted(&fs, &handles);
}

#[test]
fn shared_handle_pages_sync_concurrently() {
    const WRITERS: u64 = 4;
    const OPS: u64 = 30;

    let fs = stress_fs(100);
    let (handle, base) = mapped_file(&fs, WRITERS, 0x5000_0000);
    let handle = Arc::new(handle);

    let threads: Vec<_> = (0..WRITERS)
        .map(|page| {
            let fs = Arc::clone(&fs);
            let handle = Arc::clone(&handle);
            thread::spawn(move || {
                for op in 0..OPS {
                    let byte = u8::try_from((page * 17 + op) % 251).expect("fits");
                    fs.write_mapped(&handle, page * PAGE_SIZE + 128, &[byte; 32])
                        .expect("store");
                    sync_page(&fs, &handle, base, page, CowSyncMode::CowWriteback);
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().expect("writer thread");
    }

    for page in 0..WRITERS {
        let last = u8::try_from((page * 17 + OPS - 1) % 251).expect("fits");
        assert_eq!(&page_bytes(&fs, &handle, page)[128..160], &[last; 32]);
    }
    let mapping = handle.mapping().expect("mapped");
    assert_eq!(mapping.dirty_pages(), 0);
    assert!(!fs.is_degraded());
    assert_blocks_accounted(&fs, &[&*handle]);
}

#[test]
fn deferred_frees_drain_through_background_worker() {
    const WRITERS: u64 = 3;
    const OPS: u64 = 50;

    // A small queue forces some retirements onto the inline path.
    let fs = stress_fs(8);
    let worker = Arc::new(ReclaimWorker::new(Arc::clone(fs.queue())));
    worker.register(&fs);
    let reclaim = Arc::clone(&worker).spawn(Duration::from_millis(1));

    let files: Arc<Vec<(FileHandle, VirtAddr)>> = Arc::new(
        (0..WRITERS)
            .map(|n| mapped_file(&fs, PAGES_PER_FILE, 0x2000_0000 * (n + 1)))
            .collect(),
    );
    let threads: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let fs = Arc::clone(&fs);
            let files = Arc::clone(&files);
            thread::spawn(move || {
                let (handle, base) = &files[usize::try_from(writer).expect("fits")];
                for op in 0..OPS {
                    let page = op % PAGES_PER_FILE;
                    fs.write_mapped(handle, page * PAGE_SIZE, &op.to_le_bytes())
                        .expect("store");
                    sync_page(&fs, handle, *base, page, CowSyncMode::CowWritebackDeferredFree);
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().expect("writer thread");
    }
    reclaim.stop();

    let stats = fs.stats();
    assert!(!stats.degraded);
    assert_eq!(stats.cowed_blocks, WRITERS * OPS);
    assert_eq!(stats.retired_pending, 0);
    assert!(worker.reclaimed() > 0);
    assert!(fs.queue().is_empty());
    let handles: Vec<&FileHandle> = files.iter().map(|(handle, _)| handle).collect();
    assert_blocks_accounted(&fs, &handles);
}
