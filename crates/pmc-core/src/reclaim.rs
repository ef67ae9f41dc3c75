//! Background reclaim of blocks retired through the free-request queue.

use parking_lot::Mutex;
use pmc_alloc::FreeRequestQueue;
use pmc_types::FsId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::fs::PmemFs;

/// Drains one shared [`FreeRequestQueue`] on behalf of every registered
/// filesystem.
#[derive(Debug)]
pub struct ReclaimWorker {
    queue: Arc<FreeRequestQueue>,
    filesystems: Mutex<HashMap<FsId, Weak<PmemFs>>>,
    reclaimed: AtomicU64,
    orphaned: AtomicU64,
}

impl ReclaimWorker {
    #[must_use]
    pub fn new(queue: Arc<FreeRequestQueue>) -> Self {
        Self {
            queue,
            filesystems: Mutex::new(HashMap::new()),
            reclaimed: AtomicU64::new(0),
            orphaned: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<FreeRequestQueue> {
        &self.queue
    }

    pub fn register(&self, fs: &Arc<PmemFs>) {
        self.filesystems.lock().insert(fs.id(), Arc::downgrade(fs));
    }

    pub fn unregister(&self, fs: FsId) {
        self.filesystems.lock().remove(&fs);
    }

    /// Blocks freed so far.
    #[must_use]
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }

    /// Requests dropped because their filesystem was gone.
    #[must_use]
    pub fn orphaned(&self) -> u64 {
        self.orphaned.load(Ordering::Relaxed)
    }

    /// Serve every queued request once. Returns the number of blocks freed.
    pub fn reclaim_pending(&self) -> usize {
        let mut freed = 0;
        while let Some(request) = self.queue.dequeue() {
            let fs = self
                .filesystems
                .lock()
                .get(&request.fs)
                .and_then(Weak::upgrade);
            match fs {
                Some(fs) => freed += fs.reclaim_txn(request.txn),
                None => {
                    self.orphaned.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        target: "pmc::reclaim",
                        fs = request.fs.0,
                        txn = request.txn.0,
                        "dropping request for unknown filesystem"
                    );
                }
            }
        }
        if freed > 0 {
            self.reclaimed.fetch_add(freed as u64, Ordering::Relaxed);
            tracing::debug!(target: "pmc::reclaim", freed, "reclaimed retired blocks");
        }
        freed
    }

    /// Poll the queue every `interval` on a background thread.
    #[must_use]
    pub fn spawn(self: Arc<Self>, interval: Duration) -> ReclaimHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let worker = self;
        let thread = std::thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                std::thread::sleep(interval);
                worker.reclaim_pending();
            }
            // Final pass so nothing queued before stop is left behind.
            worker.reclaim_pending();
        });
        tracing::info!(target: "pmc::reclaim", interval_ms = interval.as_millis(), "reclaim worker started");
        ReclaimHandle {
            stop,
            thread: Some(thread),
        }
    }
}

/// Stops the background worker when dropped.
#[derive(Debug)]
pub struct ReclaimHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ReclaimHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(target: "pmc::reclaim", "reclaim worker panicked");
            }
        }
    }
}

impl Drop for ReclaimHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FsEnv;
    use crate::fs::tests::test_config;
    use pmc_alloc::FreeRequest;
    use pmc_pmem::NoDelay;
    use pmc_types::{BlockNumber, BlockType, TxnId};

    fn shared_fs(queue: &Arc<FreeRequestQueue>) -> Arc<PmemFs> {
        let config = test_config();
        let env = FsEnv::for_config(&config)
            .with_delay(Arc::new(NoDelay))
            .with_queue(Arc::clone(queue));
        PmemFs::with_env(config, env).expect("fs")
    }

    #[test]
    fn serves_requests_for_registered_filesystems() {
        let queue = Arc::new(FreeRequestQueue::default());
        let worker = ReclaimWorker::new(Arc::clone(&queue));
        let a = shared_fs(&queue);
        let b = shared_fs(&queue);
        worker.register(&a);
        worker.register(&b);

        let inode = a.create_file(0o644, 0).expect("file");
        a.fallocate(&inode, 0, 0, 8192).expect("fallocate");
        let blocks: Vec<BlockNumber> = inode.snapshot().blocks.values().copied().collect();
        inode.restore_pointer(0, None);
        inode.restore_pointer(1, None);
        a.retire(TxnId(7), blocks.clone(), BlockType::FourK, true);
        queue
            .enqueue(FreeRequest::new(b.id(), TxnId(7)))
            .expect("enqueue");

        assert_eq!(worker.reclaim_pending(), 2);
        assert!(blocks.iter().all(|block| !a.allocator().is_allocated(*block)));
        assert!(queue.is_empty());
        assert_eq!(worker.reclaimed(), 2);
    }

    #[test]
    fn drops_requests_for_vanished_filesystems() {
        let queue = Arc::new(FreeRequestQueue::default());
        let worker = ReclaimWorker::new(Arc::clone(&queue));
        let fs = shared_fs(&queue);
        worker.register(&fs);
        let id = fs.id();
        drop(fs);
        queue.enqueue(FreeRequest::new(id, TxnId(1))).expect("enqueue");
        assert_eq!(worker.reclaim_pending(), 0);
        assert_eq!(worker.orphaned(), 1);
    }

    #[test]
    fn background_thread_drains_on_stop() {
        let queue = Arc::new(FreeRequestQueue::default());
        let worker = Arc::new(ReclaimWorker::new(Arc::clone(&queue)));
        let fs = shared_fs(&queue);
        worker.register(&fs);
        let handle = Arc::clone(&worker).spawn(Duration::from_millis(1));

        let inode = fs.create_file(0o644, 0).expect("file");
        fs.fallocate(&inode, 0, 0, 4096).expect("fallocate");
        let block = inode.block_of(0).expect("block");
        inode.restore_pointer(0, None);
        fs.retire(TxnId(3), vec![block], BlockType::FourK, true);

        handle.stop();
        assert!(!fs.allocator().is_allocated(block));
        assert_eq!(worker.reclaimed(), 1);
    }
}
