//! Injectable failure points.
//!
//! The sync and commit paths call [`PmemFs::fail_point`](crate::PmemFs::fail_point)
//! before each risky step. A [`FaultInjector`] decides whether that step
//! fails. A fired fault goes through the crash latch: later probabilistic
//! faults are suppressed until [`CrashLatch::reset`], and the superblock lock
//! is briefly cycled so a block mutation in flight on another thread can
//! finish first.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::config::CrashConfig;

/// Discrete steps of a COW-sync where a fault can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailPoint {
    AfterBegin,
    AfterSuidStrip,
    AfterScan,
    BeforeCow,
    BeforeWriteBack,
    BeforeCommit,
    /// Inside commit, before new data is flushed.
    CommitFlush,
    /// Inside commit, between two pointer publishes.
    CommitPublish,
}

impl FailPoint {
    /// Points that abort the transaction when they fire.
    pub const PRE_COMMIT: [Self; 6] = [
        Self::AfterBegin,
        Self::AfterSuidStrip,
        Self::AfterScan,
        Self::BeforeCow,
        Self::BeforeWriteBack,
        Self::BeforeCommit,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AfterBegin => "after-begin",
            Self::AfterSuidStrip => "after-suid-strip",
            Self::AfterScan => "after-scan",
            Self::BeforeCow => "before-cow",
            Self::BeforeWriteBack => "before-write-back",
            Self::BeforeCommit => "before-commit",
            Self::CommitFlush => "commit-flush",
            Self::CommitPublish => "commit-publish",
        }
    }

    /// Faults at these points hit a commit already under way.
    #[must_use]
    pub fn is_commit_phase(self) -> bool {
        matches!(self, Self::CommitFlush | Self::CommitPublish)
    }
}

impl fmt::Display for FailPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy consulted at every failure point.
pub trait FaultInjector: Send + Sync + fmt::Debug {
    fn should_fail(&self, point: FailPoint) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoFaults;

impl FaultInjector for NoFaults {
    fn should_fail(&self, _point: FailPoint) -> bool {
        false
    }
}

/// Fails the `nth` time (1-based) `point` is reached, once.
#[derive(Debug)]
pub struct FailAt {
    point: FailPoint,
    nth: u64,
    hits: AtomicU64,
}

impl FailAt {
    #[must_use]
    pub fn new(point: FailPoint) -> Self {
        Self::nth(point, 1)
    }

    #[must_use]
    pub fn nth(point: FailPoint, nth: u64) -> Self {
        Self {
            point,
            nth,
            hits: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}

impl FaultInjector for FailAt {
    fn should_fail(&self, point: FailPoint) -> bool {
        point == self.point && self.hits.fetch_add(1, Ordering::Relaxed) + 1 == self.nth
    }
}

/// Crashes with probability `(likelihood + 1) / total_outcomes` per point.
pub struct RandomCrash {
    total_outcomes: u32,
    likelihood: u32,
    rng: Mutex<StdRng>,
}

impl fmt::Debug for RandomCrash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RandomCrash")
            .field("total_outcomes", &self.total_outcomes)
            .field("likelihood", &self.likelihood)
            .finish_non_exhaustive()
    }
}

impl RandomCrash {
    #[must_use]
    pub fn from_config(config: &CrashConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            total_outcomes: config.total_outcomes.max(1),
            likelihood: config.likelihood,
            rng: Mutex::new(rng),
        }
    }
}

impl FaultInjector for RandomCrash {
    fn should_fail(&self, point: FailPoint) -> bool {
        let roll = self.rng.lock().random_range(0..self.total_outcomes);
        let crash = roll <= self.likelihood;
        if crash {
            tracing::debug!(target: "pmc::fault", %point, roll, "random crash roll hit");
        }
        crash
    }
}

/// Records that an injected crash already fired.
#[derive(Debug, Default)]
pub struct CrashLatch {
    errors: AtomicU64,
}

/// Attempts at the superblock lock before giving up on the quiesce step.
const QUIESCE_ATTEMPTS: u32 = 10;
const QUIESCE_SLEEP: Duration = Duration::from_millis(1);

impl CrashLatch {
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.errors.load(Ordering::Acquire) > 0
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.errors.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.errors.store(0, Ordering::Release);
    }

    /// Latch the fault, then wait for the superblock lock to be free once.
    ///
    /// The lock is polled with `try_lock` and a short sleep so a thread that
    /// already holds it does not deadlock here. Returns whether the lock was
    /// observed free.
    pub(crate) fn fire(&self, superblock: &Mutex<()>) -> bool {
        self.errors.fetch_add(1, Ordering::AcqRel);
        for _ in 0..QUIESCE_ATTEMPTS {
            if let Some(guard) = superblock.try_lock() {
                drop(guard);
                return true;
            }
            std::thread::sleep(QUIESCE_SLEEP);
        }
        tracing::debug!(target: "pmc::fault", "superblock lock busy; skipping quiesce");
        false
    }
}
