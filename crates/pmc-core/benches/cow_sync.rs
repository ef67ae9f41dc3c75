//! Benchmark: COW-sync modes against the plain flush path.
//!
//! Each iteration dirties four pages of a sixteen-page mapping and makes
//! them durable. Latency emulation is disabled so the numbers reflect the
//! transaction and copy overhead only.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use pmc_core::{CowSyncMode, Credentials, FileHandle, FsConfig, FsEnv, PmemFs, cow_sync, fsync};
use pmc_pmem::NoDelay;
use pmc_types::{PAGE_SIZE, VirtAddr};
use std::sync::Arc;

const PAGES: u64 = 16;
const DIRTY: [u64; 4] = [1, 5, 9, 13];

fn bench_fs() -> Arc<PmemFs> {
    let config = FsConfig {
        block_count: 4096,
        reserved_blocks: 16,
        log_capacity_entries: 256,
        ..FsConfig::default()
    };
    let env = FsEnv::for_config(&config).with_delay(Arc::new(NoDelay));
    PmemFs::with_env(config, env).expect("fs")
}

fn mapped(fs: &PmemFs) -> (FileHandle, VirtAddr) {
    let inode = fs.create_file(0o644, 0).expect("create");
    fs.fallocate(&inode, 0, 0, PAGES * PAGE_SIZE).expect("fallocate");
    let handle = fs.open(inode.ino()).expect("open");
    let base = fs
        .mmap(&handle, VirtAddr(0x7f00_0000_0000), PAGES * PAGE_SIZE, false)
        .expect("mmap");
    (handle, base)
}

fn dirty(fs: &PmemFs, handle: &FileHandle, round: u64) {
    for page in DIRTY {
        fs.write_mapped(handle, page * PAGE_SIZE + 64, &round.to_le_bytes())
            .expect("store");
    }
}

fn bench_cow_modes(c: &mut Criterion) {
    let mut group = c.benchmark_group("cow_sync");
    for mode in [
        CowSyncMode::CowWriteback,
        CowSyncMode::WritebackOnly,
        CowSyncMode::CowWritebackFlush,
        CowSyncMode::CowWritebackDeferredFree,
    ] {
        let fs = bench_fs();
        let (handle, base) = mapped(&fs);
        let end = VirtAddr(base.0 + PAGES * PAGE_SIZE - 1);
        let mut round = 0_u64;
        group.bench_with_input(BenchmarkId::from_parameter(mode), &mode, |b, &mode| {
            b.iter(|| {
                round += 1;
                dirty(&fs, &handle, round);
                let report = cow_sync(&fs, &handle, base, end, mode, Credentials::default())
                    .expect("sync");
                black_box(report);
                fs.reclaim_all();
            });
        });
    }
    group.finish();
}

fn bench_flush_path(c: &mut Criterion) {
    let fs = bench_fs();
    let (handle, _base) = mapped(&fs);
    let mut round = 0_u64;
    c.bench_function("fsync_flush", |b| {
        b.iter(|| {
            round += 1;
            dirty(&fs, &handle, round);
            fsync(&fs, &handle, 0, PAGES * PAGE_SIZE - 1, black_box(0)).expect("fsync");
        });
    });
}

criterion_group!(benches, bench_cow_modes, bench_flush_path);
criterion_main!(benches);
