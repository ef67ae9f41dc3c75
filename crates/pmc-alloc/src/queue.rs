//! Bounded LIFO of deferred block-free requests.
//!
//! A fixed array of slots indexed by an atomic cursor. Producers and
//! consumers reserve an index with a compare-and-swap on the cursor and then
//! hand the request through the slot itself, so no mutex is taken on either
//! side. Pop order is last-in first-out; requests only name a
//! (filesystem, transaction) pair whose retired blocks need freeing, so the
//! order they are serviced in does not matter.
//!
//! A slot reserved by a producer may briefly still hold the value a consumer
//! is about to take (the consumer claimed the index first). Both sides spin
//! on the slot until it is in the state they expect.

use crossbeam_utils::atomic::AtomicCell;
use pmc_error::{PmcError, Result};
use pmc_types::{FsId, TxnId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Capacity of the shared queue when none is configured.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// One deferred reclamation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FreeRequest {
    pub fs: FsId,
    pub txn: TxnId,
}

impl FreeRequest {
    #[must_use]
    pub fn new(fs: FsId, txn: TxnId) -> Self {
        Self { fs, txn }
    }
}

pub struct FreeRequestQueue {
    slots: Box<[AtomicCell<Option<FreeRequest>>]>,
    cursor: AtomicUsize,
}

impl std::fmt::Debug for FreeRequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeRequestQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

impl Default for FreeRequestQueue {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }
}

impl FreeRequestQueue {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (0..capacity).map(|_| AtomicCell::new(None)).collect();
        Self {
            slots,
            cursor: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Requests currently reserved in the queue. Racy under contention.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push a request.
    ///
    /// Returns `Ok(true)` when this push filled the last slot, `Ok(false)`
    /// while room remains, and `QueueFull` when there was no slot at all;
    /// the caller must then free synchronously.
    pub fn enqueue(&self, request: FreeRequest) -> Result<bool> {
        let capacity = self.capacity();
        let mut cur = self.cursor.load(Ordering::Acquire);
        let idx = loop {
            if cur >= capacity {
                tracing::warn!(
                    target: "pmc::alloc",
                    capacity,
                    fs = request.fs.0,
                    txn = request.txn.0,
                    "free-request queue full"
                );
                return Err(PmcError::QueueFull { capacity });
            }
            match self.cursor.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break cur,
                Err(actual) => cur = actual,
            }
        };

        let slot = &self.slots[idx];
        while slot.compare_exchange(None, Some(request)).is_err() {
            std::hint::spin_loop();
        }
        tracing::trace!(target: "pmc::alloc", idx, txn = request.txn.0, "enqueue free request");
        Ok(idx + 1 == capacity)
    }

    /// Pop the most recently pushed request, or `None` when empty.
    pub fn dequeue(&self) -> Option<FreeRequest> {
        let mut cur = self.cursor.load(Ordering::Acquire);
        let idx = loop {
            if cur == 0 {
                return None;
            }
            match self.cursor.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break cur - 1,
                Err(actual) => cur = actual,
            }
        };

        let slot = &self.slots[idx];
        loop {
            if let Some(request) = slot.swap(None) {
                return Some(request);
            }
            std::hint::spin_loop();
        }
    }

    /// Pop everything currently queued.
    pub fn drain(&self) -> Vec<FreeRequest> {
        std::iter::from_fn(|| self.dequeue()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn req(n: u64) -> FreeRequest {
        FreeRequest::new(FsId(1), TxnId(n))
    }

    #[test]
    fn empty_queue_dequeues_none() {
        let queue = FreeRequestQueue::with_capacity(4);
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn lifo_order() {
        let queue = FreeRequestQueue::with_capacity(4);
        for n in 1..=3 {
            assert!(!queue.enqueue(req(n)).expect("enqueue"));
        }
        assert_eq!(queue.dequeue(), Some(req(3)));
        assert_eq!(queue.dequeue(), Some(req(2)));
        queue.enqueue(req(9)).expect("enqueue");
        assert_eq!(queue.dequeue(), Some(req(9)));
        assert_eq!(queue.dequeue(), Some(req(1)));
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn boundary_push_reports_full_and_overflow_is_rejected() {
        let queue = FreeRequestQueue::default();
        assert_eq!(queue.capacity(), DEFAULT_QUEUE_CAPACITY);
        for n in 0..99 {
            assert!(!queue.enqueue(req(n)).expect("room"));
        }
        assert!(queue.enqueue(req(99)).expect("last slot"));
        assert_eq!(
            queue.enqueue(req(100)),
            Err(PmcError::QueueFull { capacity: 100 })
        );
        assert_eq!(queue.len(), 100);
        assert_eq!(queue.dequeue(), Some(req(99)));
    }

    #[test]
    fn zero_capacity_queue_is_always_full() {
        let queue = FreeRequestQueue::with_capacity(0);
        assert!(queue.enqueue(req(1)).is_err());
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn concurrent_producers_and_consumers_lose_nothing() {
        let queue = Arc::new(FreeRequestQueue::with_capacity(64));
        let producers: Vec<_> = (0..4_u64)
            .map(|t| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut pushed = Vec::new();
                    for n in 0..200 {
                        let request = req(t * 1000 + n);
                        while queue.enqueue(request).is_err() {
                            thread::yield_now();
                        }
                        pushed.push(request);
                    }
                    pushed
                })
            })
            .collect();
        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut popped = Vec::new();
                    while popped.len() < 400 {
                        match queue.dequeue() {
                            Some(request) => popped.push(request),
                            None => thread::yield_now(),
                        }
                    }
                    popped
                })
            })
            .collect();

        let pushed: HashSet<_> = producers
            .into_iter()
            .flat_map(|h| h.join().expect("producer"))
            .collect();
        let popped: Vec<_> = consumers
            .into_iter()
            .flat_map(|h| h.join().expect("consumer"))
            .collect();
        assert_eq!(popped.len(), 800);
        assert_eq!(popped.iter().copied().collect::<HashSet<_>>(), pushed);
        assert!(queue.is_empty());
    }
}
