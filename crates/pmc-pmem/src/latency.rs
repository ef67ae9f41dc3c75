//! Bandwidth-based access latency emulation.
//!
//! Persistent memory is modelled as DRAM with a lower write bandwidth. Every
//! byte copied into the medium costs the difference between the two
//! bandwidths:
//!
//! ```text
//! extra_ns = bytes * (1 - pcm_bw / dram_bw) / pcm_bw        (bw in GB/s)
//! ```
//!
//! The delay itself is delegated to a [`DelaySource`] so tests can run with
//! no delay at all, or record what would have been spent.

use parking_lot::Mutex;
use pmc_error::{PmcError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Bandwidth and clock parameters of the emulated medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyModel {
    /// Modelled persistent-memory write bandwidth (MB/s).
    pub pcm_bandwidth_mb: u32,
    /// Modelled DRAM bandwidth (MB/s).
    pub dram_bandwidth_mb: u32,
    /// CPU frequency used to convert nanoseconds into cycles (MHz).
    pub cpu_freq_mhz: u32,
    /// Serialize emulated accesses, as if the medium had a single channel.
    pub serialize_channel: bool,
}

impl Default for LatencyModel {
    fn default() -> Self {
        Self {
            pcm_bandwidth_mb: 1200,
            dram_bandwidth_mb: 7000,
            cpu_freq_mhz: 3000,
            serialize_channel: true,
        }
    }
}

impl LatencyModel {
    pub fn validate(&self) -> Result<()> {
        if self.pcm_bandwidth_mb == 0 || self.dram_bandwidth_mb == 0 {
            return Err(PmcError::InvalidArgument(
                "latency bandwidths must be non-zero".to_owned(),
            ));
        }
        if self.cpu_freq_mhz == 0 {
            return Err(PmcError::InvalidArgument(
                "cpu_freq_mhz must be non-zero".to_owned(),
            ));
        }
        Ok(())
    }

    /// Extra nanoseconds a copy of `bytes` costs on the emulated medium.
    ///
    /// Zero when the medium is at least as fast as DRAM.
    #[must_use]
    #[expect(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "delay model is approximate; negative results are clamped to zero"
    )]
    pub fn extra_latency_ns(&self, bytes: usize) -> u64 {
        if bytes == 0 || self.pcm_bandwidth_mb == 0 || self.dram_bandwidth_mb == 0 {
            return 0;
        }
        let pcm = f64::from(self.pcm_bandwidth_mb) / 1000.0;
        let dram = f64::from(self.dram_bandwidth_mb) / 1000.0;
        let ns = bytes as f64 * (1.0 - pcm / dram) / pcm;
        if ns <= 0.0 { 0 } else { ns as u64 }
    }

    #[must_use]
    pub fn ns_to_cycles(&self, ns: u64) -> u64 {
        ns.saturating_mul(u64::from(self.cpu_freq_mhz)) / 1000
    }

    #[must_use]
    pub fn cycles_to_ns(&self, cycles: u64) -> u64 {
        if self.cpu_freq_mhz == 0 {
            return 0;
        }
        cycles.saturating_mul(1000) / u64::from(self.cpu_freq_mhz)
    }
}

/// Monotonic cycle counter.
pub trait CycleClock: Send + Sync {
    fn cycles(&self) -> u64;
}

/// Cycle counter derived from the monotonic wall clock.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicCycles {
    origin: Instant,
    cpu_freq_mhz: u32,
}

impl MonotonicCycles {
    #[must_use]
    pub fn new(cpu_freq_mhz: u32) -> Self {
        Self {
            origin: Instant::now(),
            cpu_freq_mhz,
        }
    }
}

impl CycleClock for MonotonicCycles {
    fn cycles(&self) -> u64 {
        let ns = u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX);
        ns.saturating_mul(u64::from(self.cpu_freq_mhz)) / 1000
    }
}

/// Something that can make the calling thread spend `ns` nanoseconds.
pub trait DelaySource: Send + Sync + fmt::Debug {
    fn delay_ns(&self, ns: u64);
}

/// Busy-waits on a cycle counter until the requested cycles have elapsed.
pub struct SpinDelay<C: CycleClock = MonotonicCycles> {
    clock: C,
    model: LatencyModel,
}

impl SpinDelay<MonotonicCycles> {
    #[must_use]
    pub fn new(model: LatencyModel) -> Self {
        Self::with_clock(MonotonicCycles::new(model.cpu_freq_mhz), model)
    }
}

impl<C: CycleClock> SpinDelay<C> {
    pub fn with_clock(clock: C, model: LatencyModel) -> Self {
        Self { clock, model }
    }
}

impl<C: CycleClock> fmt::Debug for SpinDelay<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinDelay")
            .field("cpu_freq_mhz", &self.model.cpu_freq_mhz)
            .finish_non_exhaustive()
    }
}

impl<C: CycleClock> DelaySource for SpinDelay<C> {
    fn delay_ns(&self, ns: u64) {
        let cycles = self.model.ns_to_cycles(ns);
        let start = self.clock.cycles();
        // Unserialized counter reads; the delay may overlap the copy.
        while self.clock.cycles().saturating_sub(start) < cycles {
            std::hint::spin_loop();
        }
    }
}

/// Spends no time at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDelay;

impl DelaySource for NoDelay {
    fn delay_ns(&self, _ns: u64) {}
}

/// Records requested delays without waiting.
#[derive(Debug, Default)]
pub struct RecordingDelay {
    total_ns: AtomicU64,
    calls: AtomicU64,
}

impl RecordingDelay {
    #[must_use]
    pub fn total_ns(&self) -> u64 {
        self.total_ns.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl DelaySource for RecordingDelay {
    fn delay_ns(&self, ns: u64) {
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.calls.fetch_add(1, Ordering::Relaxed);
    }
}

/// Converts byte counts into delays on a shared delay source.
#[derive(Debug)]
pub struct LatencyEmulator {
    model: LatencyModel,
    delay: Arc<dyn DelaySource>,
    channel: Mutex<()>,
    emulated_ns: AtomicU64,
}

impl LatencyEmulator {
    #[must_use]
    pub fn new(model: LatencyModel, delay: Arc<dyn DelaySource>) -> Self {
        Self {
            model,
            delay,
            channel: Mutex::new(()),
            emulated_ns: AtomicU64::new(0),
        }
    }

    /// Emulator that busy-waits for the modelled time.
    #[must_use]
    pub fn spinning(model: LatencyModel) -> Self {
        Self::new(model, Arc::new(SpinDelay::new(model)))
    }

    #[must_use]
    pub fn model(&self) -> &LatencyModel {
        &self.model
    }

    /// Spend the extra time a copy of `bytes` costs; returns the nanoseconds
    /// requested from the delay source.
    pub fn emulate_latency(&self, bytes: usize) -> u64 {
        let ns = self.model.extra_latency_ns(bytes);
        if ns == 0 {
            return 0;
        }
        if self.model.serialize_channel {
            let _channel = self.channel.lock();
            self.delay.delay_ns(ns);
        } else {
            self.delay.delay_ns(ns);
        }
        self.emulated_ns.fetch_add(ns, Ordering::Relaxed);
        tracing::trace!(target: "pmc::latency", bytes, ns, "emulated access latency");
        ns
    }

    /// Total nanoseconds emulated since creation.
    #[must_use]
    pub fn total_emulated_ns(&self) -> u64 {
        self.emulated_ns.load(Ordering::Relaxed)
    }
}
