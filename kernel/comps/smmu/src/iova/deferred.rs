// SPDX-License-Identifier: MPL-2.0

use bitvec::prelude::*;

use crate::prelude::*;

/// One of the two alternating generations of deferred releases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Epoch {
    Ping,
    Pong,
}

impl Epoch {
    fn index(self) -> usize {
        match self {
            Epoch::Ping => 0,
            Epoch::Pong => 1,
        }
    }

    fn other(self) -> Self {
        match self {
            Epoch::Ping => Epoch::Pong,
            Epoch::Pong => Epoch::Ping,
        }
    }
}

/// A closed epoch waiting for its sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct Sweep {
    pub(super) epoch: Epoch,
    /// Tells apart successive closings of the same epoch.
    seq: u64,
}

/// Ranges released by their users, whose translations may still be cached.
///
/// A released range is tagged with the current epoch. Once the pages pending
/// in the current epoch reach the watermark, the epoch is closed and handed
/// to a sweep, and releases go to the other epoch. The sweep invalidates the
/// whole address space once and then gives every range of the closed epoch
/// back to the pool. Only one sweep is outstanding at a time.
pub(super) struct DeferredSlots {
    base: Daddr,
    current: Epoch,
    /// One bit per page of the window, set at the first page of a slot.
    slots: [BitVec; 2],
    /// The number of pages of the slot starting at each page.
    nr_pages: Vec<u32>,
    /// The number of pages pending in each epoch.
    outstanding: [usize; 2],
    sweeping: Option<Sweep>,
    nr_closed: u64,
    watermark: usize,
}

impl DeferredSlots {
    pub(super) fn new(window: &Range<Daddr>, watermark_permille: u32) -> Self {
        let nr_granules = window.len() / PAGE_SIZE;
        let watermark = (nr_granules * watermark_permille as usize / 1000).max(1);
        Self {
            base: window.start,
            current: Epoch::Ping,
            slots: [bitvec![0; nr_granules], bitvec![0; nr_granules]],
            nr_pages: vec![0; nr_granules],
            outstanding: [0; 2],
            sweeping: None,
            nr_closed: 0,
            watermark,
        }
    }

    /// Adds a released range to the current epoch.
    ///
    /// Returns whether the epoch was closed and a sweep should be started.
    pub(super) fn insert(&mut self, range: &Range<Daddr>) -> Result<bool> {
        let granule = self.granule(range.start);
        if self.slots[0][granule] || self.slots[1][granule] {
            error!(
                "[SMMU]: {:#x}..{:#x} released twice",
                range.start, range.end
            );
            return Err(Error::DoubleFree);
        }
        self.put(self.current, granule, range.len() / PAGE_SIZE);
        Ok(self.try_close())
    }

    /// Puts back a range taken by [`Self::claim`] without closing the epoch.
    pub(super) fn restore(&mut self, range: &Range<Daddr>) {
        let granule = self.granule(range.start);
        self.put(self.current, granule, range.len() / PAGE_SIZE);
    }

    /// Takes a pending range of exactly `size` bytes, aligned to `align`.
    pub(super) fn claim(&mut self, size: usize, align: usize) -> Option<Range<Daddr>> {
        let pages = size / PAGE_SIZE;
        for epoch in [self.current, self.current.other()] {
            let index = epoch.index();
            let found = self.slots[index].iter_ones().find(|&granule| {
                self.nr_pages[granule] as usize == pages
                    && (self.base + granule * PAGE_SIZE) % align == 0
            });
            if let Some(granule) = found {
                self.slots[index].set(granule, false);
                self.outstanding[index] -= pages;
                let start = self.base + granule * PAGE_SIZE;
                return Some(start..start + size);
            }
        }
        None
    }

    /// Returns the epoch that waits for a sweep.
    pub(super) fn sweeping(&self) -> Option<Sweep> {
        self.sweeping
    }

    /// Closes the current epoch even below the watermark, unless a sweep is
    /// already outstanding or there is nothing to sweep.
    ///
    /// Returns whether a sweep is outstanding afterwards.
    pub(super) fn force_close(&mut self) -> bool {
        if self.sweeping.is_some() {
            return true;
        }
        if self.outstanding[self.current.index()] == 0 {
            return false;
        }
        self.close();
        true
    }

    /// Removes every range of the swept epoch, ends the sweep, and returns
    /// the ranges.
    ///
    /// Must only be called after an invalidation that started after `sweep`
    /// was observed. Returns `None` if another caller finished `sweep`.
    pub(super) fn finish_sweep(&mut self, sweep: Sweep) -> Option<Vec<Range<Daddr>>> {
        if self.sweeping != Some(sweep) {
            return None;
        }
        let index = sweep.epoch.index();
        let ranges = self.slots[index]
            .iter_ones()
            .map(|granule| {
                let start = self.base + granule * PAGE_SIZE;
                start..start + self.nr_pages[granule] as usize * PAGE_SIZE
            })
            .collect();
        self.slots[index].fill(false);
        self.outstanding[index] = 0;
        self.sweeping = None;
        Some(ranges)
    }

    /// Closes the current epoch if it reached the watermark.
    pub(super) fn try_close(&mut self) -> bool {
        if self.sweeping.is_some() || self.outstanding[self.current.index()] < self.watermark {
            return false;
        }
        self.close();
        true
    }

    pub(super) fn is_pending(&self, range: &Range<Daddr>) -> bool {
        let granule = self.granule(range.start);
        self.slots[0][granule] || self.slots[1][granule]
    }

    pub(super) fn pending_pages(&self) -> usize {
        self.outstanding[0] + self.outstanding[1]
    }

    fn close(&mut self) {
        self.sweeping = Some(Sweep {
            epoch: self.current,
            seq: self.nr_closed,
        });
        self.nr_closed += 1;
        self.current = self.current.other();
    }

    fn put(&mut self, epoch: Epoch, granule: usize, pages: usize) {
        let index = epoch.index();
        self.slots[index].set(granule, true);
        self.nr_pages[granule] = pages as u32;
        self.outstanding[index] += pages;
    }

    fn granule(&self, addr: Daddr) -> usize {
        (addr - self.base) / PAGE_SIZE
    }
}
