use parking_lot::Mutex;
use pmc_error::{PmcError, Result};
use std::fmt;

/// Per-filesystem log region with a fixed number of entry slots.
///
/// Open transactions hold a [`LogReservation`]; dropping it returns the
/// slots.
pub struct LogArea {
    capacity: usize,
    in_use: Mutex<usize>,
}

impl fmt::Debug for LogArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogArea")
            .field("capacity", &self.capacity)
            .field("in_use", &*self.in_use.lock())
            .finish()
    }
}

impl LogArea {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            in_use: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.capacity - *self.in_use.lock()
    }

    /// Reserve `entries` slots, or fail with `OutOfLogSpace` without
    /// reserving anything.
    pub fn reserve(&self, entries: usize) -> Result<LogReservation<'_>> {
        let mut in_use = self.in_use.lock();
        let available = self.capacity - *in_use;
        if entries > available {
            return Err(PmcError::OutOfLogSpace {
                requested: entries,
                available,
            });
        }
        *in_use += entries;
        drop(in_use);
        tracing::trace!(target: "pmc::journal", entries, "log space reserved");
        Ok(LogReservation {
            area: self,
            entries,
        })
    }
}

/// Slots held in a [`LogArea`] until dropped.
pub struct LogReservation<'a> {
    area: &'a LogArea,
    entries: usize,
}

impl LogReservation<'_> {
    #[must_use]
    pub fn entries(&self) -> usize {
        self.entries
    }
}

impl fmt::Debug for LogReservation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogReservation")
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

impl Drop for LogReservation<'_> {
    fn drop(&mut self) {
        let mut in_use = self.area.in_use.lock();
        *in_use = in_use.saturating_sub(self.entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_is_returned_on_drop() {
        let area = LogArea::new(10);
        let first = area.reserve(6).expect("first");
        assert_eq!(area.available(), 4);
        let err = area.reserve(5).expect_err("too big");
        assert_eq!(
            err,
            PmcError::OutOfLogSpace {
                requested: 5,
                available: 4
            }
        );
        drop(first);
        assert_eq!(area.available(), 10);
        let second = area.reserve(10).expect("whole area");
        assert_eq!(second.entries(), 10);
    }

    #[test]
    fn oversized_request_never_fits() {
        let area = LogArea::new(3);
        assert!(area.reserve(4).is_err());
        assert_eq!(area.available(), 3);
    }
}
