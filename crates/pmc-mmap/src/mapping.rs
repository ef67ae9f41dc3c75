use crate::{DirtyPageSource, PteState, TrackedEntry};
use parking_lot::Mutex;
use pmc_error::{PmcError, Result};
use pmc_types::{FrameNumber, PAGE_SIZE, PageIndex, VirtAddr};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct PteSlot {
    frame: Option<FrameNumber>,
    valid: bool,
    dirty: bool,
    /// Force `resolve` to fail, as if the walk hit a torn-down table.
    poisoned: bool,
    /// Mapping-wide sequence number of the last store into this page.
    generation: u64,
    data: Vec<u8>,
}

/// A file mapping held entirely in memory.
///
/// Each page has its own entry lock. Cached page content lives next to the
/// entry; `store` sets the dirty bit the way a hardware write would and
/// stamps the page with a fresh store generation.
#[derive(Debug)]
pub struct MemMapping {
    base: VirtAddr,
    first_index: PageIndex,
    slots: Vec<Mutex<PteSlot>>,
    next_frame: AtomicU64,
    stores: AtomicU64,
}

impl MemMapping {
    /// Map `pages` pages at `base`, starting at file page `first_index`.
    pub fn new(base: VirtAddr, first_index: PageIndex, pages: u64) -> Result<Self> {
        if !base.is_aligned(PAGE_SIZE) {
            return Err(PmcError::InvalidArgument(format!(
                "mapping base {base} is not page aligned"
            )));
        }
        let count = usize::try_from(pages)
            .map_err(|_| PmcError::InvalidArgument(format!("{pages} pages overflow")))?;
        if pages
            .checked_mul(PAGE_SIZE)
            .and_then(|len| base.checked_add(len))
            .is_none()
        {
            return Err(PmcError::InvalidArgument(
                "mapping overflows the address space".to_owned(),
            ));
        }
        let slots = (0..count).map(|_| Mutex::new(PteSlot::default())).collect();
        Ok(Self {
            base,
            first_index,
            slots,
            next_frame: AtomicU64::new(1),
            stores: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    /// File page mapped at `base`.
    #[must_use]
    pub fn first_index(&self) -> PageIndex {
        self.first_index
    }

    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.slots.len() as u64 * PAGE_SIZE
    }

    /// One past the last mapped byte.
    #[must_use]
    pub fn end(&self) -> VirtAddr {
        VirtAddr(self.base.0 + self.len_bytes())
    }

    /// Virtual address of file page `index`, if it falls inside the mapping.
    #[must_use]
    pub fn addr_of(&self, index: PageIndex) -> Option<VirtAddr> {
        let rel = index.0.checked_sub(self.first_index.0)?;
        if rel >= self.slots.len() as u64 {
            return None;
        }
        Some(VirtAddr(self.base.0 + rel * PAGE_SIZE))
    }

    fn slot_index(&self, addr: VirtAddr) -> Result<usize> {
        let rel = addr
            .0
            .checked_sub(self.base.0)
            .filter(|rel| *rel < self.len_bytes())
            .ok_or(PmcError::PageResolution { addr: addr.0 })?;
        usize::try_from(rel / PAGE_SIZE).map_err(|_| PmcError::PageResolution { addr: addr.0 })
    }

    fn page_index(&self, slot: usize) -> PageIndex {
        PageIndex(self.first_index.0 + slot as u64)
    }

    fn with_slot<T>(&self, addr: VirtAddr, f: impl FnOnce(&mut PteSlot) -> Result<T>) -> Result<T> {
        let idx = self.slot_index(addr)?;
        let mut slot = self.slots[idx].lock();
        f(&mut slot)
    }

    /// Install a clean page at `addr` holding `content` (zero-padded).
    pub fn fault_in(&self, addr: VirtAddr, content: &[u8]) -> Result<FrameNumber> {
        let frame = FrameNumber(self.next_frame.fetch_add(1, Ordering::Relaxed));
        self.with_slot(addr, |slot| {
            let mut data = vec![0_u8; PAGE_SIZE as usize];
            let n = content.len().min(data.len());
            data[..n].copy_from_slice(&content[..n]);
            *slot = PteSlot {
                frame: Some(frame),
                valid: true,
                dirty: false,
                poisoned: false,
                generation: 0,
                data,
            };
            Ok(())
        })?;
        tracing::trace!(target: "pmc::mmap", %addr, frame = frame.0, "fault_in");
        Ok(frame)
    }

    #[must_use]
    pub fn is_present(&self, addr: VirtAddr) -> bool {
        self.with_slot(addr, |slot| Ok(slot.frame.is_some()))
            .unwrap_or(false)
    }

    #[must_use]
    pub fn is_dirty(&self, addr: VirtAddr) -> bool {
        self.with_slot(addr, |slot| Ok(slot.frame.is_some() && slot.dirty))
            .unwrap_or(false)
    }

    /// Number of present, dirty pages.
    #[must_use]
    pub fn dirty_pages(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| {
                let slot = slot.lock();
                slot.frame.is_some() && slot.dirty
            })
            .count()
    }

    /// CPU store into the mapping. Every touched page must be present.
    pub fn store(&self, addr: VirtAddr, data: &[u8]) -> Result<()> {
        let generation = self.stores.fetch_add(1, Ordering::Relaxed) + 1;
        self.for_each_chunk(addr, data.len(), |slot, in_page, range| {
            if slot.frame.is_none() || !slot.valid {
                return Err(PmcError::PageResolution { addr: addr.0 });
            }
            slot.data[in_page..in_page + range.len()].copy_from_slice(&data[range]);
            slot.dirty = true;
            slot.generation = generation;
            Ok(())
        })
    }

    /// CPU load from the mapping. Every touched page must be present.
    pub fn load(&self, addr: VirtAddr, buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        self.for_each_chunk(addr, len, |slot, in_page, range| {
            if slot.frame.is_none() {
                return Err(PmcError::PageResolution { addr: addr.0 });
            }
            buf[range.clone()].copy_from_slice(&slot.data[in_page..in_page + range.len()]);
            Ok(())
        })
    }

    fn for_each_chunk(
        &self,
        addr: VirtAddr,
        len: usize,
        mut f: impl FnMut(&mut PteSlot, usize, std::ops::Range<usize>) -> Result<()>,
    ) -> Result<()> {
        let mut done = 0_usize;
        while done < len {
            let cur = addr
                .checked_add(done as u64)
                .ok_or(PmcError::PageResolution { addr: addr.0 })?;
            #[expect(
                clippy::cast_possible_truncation,
                reason = "offset within a page is below PAGE_SIZE"
            )]
            let in_page = (cur.0 % PAGE_SIZE) as usize;
            let chunk = (PAGE_SIZE as usize - in_page).min(len - done);
            self.with_slot(cur, |slot| f(slot, in_page, done..done + chunk))?;
            done += chunk;
        }
        Ok(())
    }

    /// Drop the page at `addr`; its entry becomes absent.
    pub fn unmap(&self, addr: VirtAddr) -> Result<()> {
        self.with_slot(addr, |slot| {
            *slot = PteSlot::default();
            Ok(())
        })
    }

    /// Keep the entry but make its frame number invalid.
    pub fn invalidate(&self, addr: VirtAddr) -> Result<()> {
        self.with_slot(addr, |slot| {
            slot.valid = false;
            Ok(())
        })
    }

    /// Make resolution of `addr` fail (or succeed again).
    pub fn fail_resolution(&self, addr: VirtAddr, fail: bool) -> Result<()> {
        self.with_slot(addr, |slot| {
            slot.poisoned = fail;
            Ok(())
        })
    }
}

impl DirtyPageSource for MemMapping {
    fn resolve(&self, addr: VirtAddr) -> Result<PteState> {
        let Ok(idx) = self.slot_index(addr) else {
            return Ok(PteState::Absent);
        };
        let slot = self.slots[idx].lock();
        if slot.poisoned {
            return Err(PmcError::PageResolution { addr: addr.0 });
        }
        let state = match slot.frame {
            None => PteState::Absent,
            Some(_) if !slot.valid => PteState::Invalid,
            Some(frame) => PteState::Present {
                frame,
                index: self.page_index(idx),
                dirty: slot.dirty,
            },
        };
        drop(slot);
        Ok(state)
    }

    fn read_page(&self, entry: &TrackedEntry, buf: &mut [u8]) -> Result<u64> {
        self.with_slot(entry.addr, |slot| {
            if slot.frame != Some(entry.frame) {
                return Err(PmcError::WriteBackFailed {
                    page: entry.index.0,
                    detail: format!("frame {} no longer mapped", entry.frame.0),
                });
            }
            let n = buf.len().min(slot.data.len());
            buf[..n].copy_from_slice(&slot.data[..n]);
            Ok(slot.generation)
        })
    }

    fn mark_clean(&self, entry: &TrackedEntry, generation: u64) -> Result<bool> {
        self.with_slot(entry.addr, |slot| {
            if slot.frame != Some(entry.frame) || slot.generation != generation {
                return Ok(false);
            }
            slot.dirty = false;
            Ok(true)
        })
    }
}
