#![forbid(unsafe_code)]
//! Persistent-memory medium with an explicit durability model.
//!
//! Stores land in a CPU-visible image. They only survive a power failure once
//! the covering cache lines have been flushed *and* a store fence has drained
//! the flushed lines to the media:
//!
//! ```text
//!   write()          flush_buffer()        fence()
//! ─────────► dirty ───────────────► in-flight ─────────► durable
//! ```
//!
//! A flush without a fence leaves its lines in flight; they become durable at
//! the next fence issued by anyone (the "implicit ordering event"). A power
//! failure discards dirty and in-flight lines alike.
//!
//! See [`latency`] for the bandwidth-based access delay model.

pub mod latency;

use parking_lot::Mutex;
use pmc_error::{PmcError, Result};
use pmc_types::{BlockNumber, CACHELINE_SIZE, PAGE_SIZE};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

pub use latency::{
    CycleClock, DelaySource, LatencyEmulator, LatencyModel, MonotonicCycles, NoDelay,
    RecordingDelay, SpinDelay,
};

/// Byte range of whole cache lines covering `[offset, offset + len)`.
///
/// The start is rounded down so a partial leading line is included; the end
/// is rounded up. An empty input yields an empty range.
#[must_use]
pub fn cache_line_span(offset: u64, len: u64) -> Range<u64> {
    if len == 0 {
        return offset..offset;
    }
    let start = offset & !(CACHELINE_SIZE - 1);
    let end = offset.saturating_add(len);
    let end = end.saturating_add(CACHELINE_SIZE - 1) & !(CACHELINE_SIZE - 1);
    start..end
}

/// Counters describing flush traffic on a medium.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushStats {
    pub flush_calls: u64,
    pub lines_flushed: u64,
    pub fences: u64,
}

#[derive(Debug)]
struct MediumState {
    visible: Vec<u8>,
    durable: Vec<u8>,
    dirty: BTreeSet<u64>,
    in_flight: BTreeMap<u64, Vec<u8>>,
}

impl MediumState {
    fn drain_in_flight(&mut self) -> usize {
        let drained = self.in_flight.len();
        for (line, bytes) in std::mem::take(&mut self.in_flight) {
            let start = line_index(line);
            self.durable[start..start + bytes.len()].copy_from_slice(&bytes);
        }
        drained
    }
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "line offsets are bounded by the medium length, which is a usize"
)]
fn line_index(line: u64) -> usize {
    line as usize
}

/// Byte-addressable persistent medium carved into 4 KiB blocks.
#[derive(Debug)]
pub struct PersistentMemory {
    block_count: u64,
    state: Mutex<MediumState>,
    flush_calls: AtomicU64,
    lines_flushed: AtomicU64,
    fences: AtomicU64,
}

impl PersistentMemory {
    /// Create a zeroed, fully durable medium of `block_count` blocks.
    pub fn new(block_count: u64) -> Result<Self> {
        let len = block_count
            .checked_mul(PAGE_SIZE)
            .and_then(|len| usize::try_from(len).ok())
            .ok_or_else(|| {
                PmcError::InvalidArgument(format!("medium of {block_count} blocks overflows"))
            })?;
        Ok(Self {
            block_count,
            state: Mutex::new(MediumState {
                visible: vec![0_u8; len],
                durable: vec![0_u8; len],
                dirty: BTreeSet::new(),
                in_flight: BTreeMap::new(),
            }),
            flush_calls: AtomicU64::new(0),
            lines_flushed: AtomicU64::new(0),
            fences: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn block_size(&self) -> u64 {
        PAGE_SIZE
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.block_count * PAGE_SIZE
    }

    /// Byte offset of `block` on the medium.
    pub fn block_offset(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(PmcError::InvalidArgument(format!(
                "block {block} beyond medium of {} blocks",
                self.block_count
            )));
        }
        Ok(block.0 * PAGE_SIZE)
    }

    fn checked_range(&self, offset: u64, len: usize) -> Result<Range<usize>> {
        let len_u64 = u64::try_from(len)
            .map_err(|_| PmcError::InvalidArgument("length overflows u64".to_owned()))?;
        let end = offset
            .checked_add(len_u64)
            .ok_or_else(|| PmcError::InvalidArgument("range overflows u64".to_owned()))?;
        if end > self.len_bytes() {
            return Err(PmcError::InvalidArgument(format!(
                "access out of bounds: offset={offset} len={len} medium_len={}",
                self.len_bytes()
            )));
        }
        let start = usize::try_from(offset)
            .map_err(|_| PmcError::InvalidArgument("offset overflows usize".to_owned()))?;
        Ok(start..start + len)
    }

    /// Load `buf.len()` bytes from the CPU-visible image.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let range = self.checked_range(offset, buf.len())?;
        let state = self.state.lock();
        buf.copy_from_slice(&state.visible[range]);
        drop(state);
        Ok(())
    }

    /// Load bytes as they would read back after a power failure.
    pub fn read_durable(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let range = self.checked_range(offset, buf.len())?;
        let state = self.state.lock();
        buf.copy_from_slice(&state.durable[range]);
        drop(state);
        Ok(())
    }

    /// Store bytes. The covering lines are dirty until flushed.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let range = self.checked_range(offset, data.len())?;
        let span = cache_line_span(offset, data.len() as u64);
        let mut state = self.state.lock();
        state.visible[range].copy_from_slice(data);
        let mut line = span.start;
        while line < span.end {
            state.dirty.insert(line);
            line += CACHELINE_SIZE;
        }
        drop(state);
        Ok(())
    }

    /// Store zeroes over `[offset, offset + len)`.
    pub fn zero(&self, offset: u64, len: usize) -> Result<()> {
        self.write(offset, &vec![0_u8; len])
    }

    /// Copy one whole block to another through the CPU-visible image.
    pub fn copy_block(&self, src: BlockNumber, dst: BlockNumber) -> Result<()> {
        let src_off = self.block_offset(src)?;
        let dst_off = self.block_offset(dst)?;
        let mut buf = vec![0_u8; PAGE_SIZE as usize];
        self.read(src_off, &mut buf)?;
        self.write(dst_off, &buf)
    }

    /// Flush every cache line covering `[offset, offset + len)`.
    ///
    /// With `fence` the flushed lines (and any earlier in-flight lines) are
    /// durable on return. Without it they stay in flight until the next
    /// fence; callers that need ordering must pass `fence = true`.
    pub fn flush_buffer(&self, offset: u64, len: usize, fence: bool) -> Result<()> {
        self.checked_range(offset, len)?;
        let span = cache_line_span(offset, len as u64);
        let mut flushed = 0_u64;
        let mut state = self.state.lock();
        let mut line = span.start;
        while line < span.end {
            if state.dirty.remove(&line) {
                let start = line_index(line);
                let bytes = state.visible[start..start + CACHELINE_SIZE as usize].to_vec();
                state.in_flight.insert(line, bytes);
                flushed += 1;
            }
            line += CACHELINE_SIZE;
        }
        let drained = if fence { state.drain_in_flight() } else { 0 };
        drop(state);

        self.flush_calls.fetch_add(1, Ordering::Relaxed);
        self.lines_flushed.fetch_add(flushed, Ordering::Relaxed);
        if fence {
            self.fences.fetch_add(1, Ordering::Relaxed);
        }
        tracing::trace!(
            target: "pmc::pmem",
            offset,
            len,
            fence,
            lines = flushed,
            drained,
            "flush_buffer"
        );
        Ok(())
    }

    /// Flush one whole block.
    pub fn flush_block(&self, block: BlockNumber, fence: bool) -> Result<()> {
        let offset = self.block_offset(block)?;
        self.flush_buffer(offset, PAGE_SIZE as usize, fence)
    }

    /// Store fence: every in-flight line becomes durable.
    pub fn fence(&self) {
        let drained = self.state.lock().drain_in_flight();
        self.fences.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(target: "pmc::pmem", drained, "fence");
    }

    /// Simulate a power failure: only durable lines survive.
    pub fn power_fail(&self) {
        let mut state = self.state.lock();
        let lost_dirty = state.dirty.len();
        let lost_in_flight = state.in_flight.len();
        state.dirty.clear();
        state.in_flight.clear();
        let durable = state.durable.clone();
        state.visible = durable;
        drop(state);
        tracing::debug!(
            target: "pmc::pmem",
            lost_dirty,
            lost_in_flight,
            "power failure simulated"
        );
    }

    /// Whether every line covering the range is durable.
    pub fn is_durable(&self, offset: u64, len: usize) -> Result<bool> {
        self.checked_range(offset, len)?;
        let span = cache_line_span(offset, len as u64);
        let state = self.state.lock();
        let pending = state.dirty.range(span.clone()).next().is_some()
            || state.in_flight.range(span).next().is_some();
        drop(state);
        Ok(!pending)
    }

    #[must_use]
    pub fn stats(&self) -> FlushStats {
        FlushStats {
            flush_calls: self.flush_calls.load(Ordering::Relaxed),
            lines_flushed: self.lines_flushed.load(Ordering::Relaxed),
            fences: self.fences.load(Ordering::Relaxed),
        }
    }
}
