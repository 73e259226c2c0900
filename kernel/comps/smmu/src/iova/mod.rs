// SPDX-License-Identifier: MPL-2.0

//! The allocator of IO virtual addresses of a domain.

mod deferred;
mod range_alloc;

use self::{deferred::DeferredSlots, range_alloc::RangeAllocator};
use crate::{config::FreePolicy, prelude::*, tlb::IotlbFlush};

/// How a released range goes back to the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Release {
    /// The caller has already invalidated the translations of the range.
    Immediate,
    /// The translations of the range may still be cached. The range is
    /// reused only after an invalidation of the whole address space, unless
    /// the domain frees ranges immediately.
    Deferred,
}

/// The outcome of a sweep of deferred releases.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Reclaimed {
    /// The number of bytes given back to the pool.
    pub(crate) freed: usize,
    /// Another epoch was closed and waits for its own sweep.
    pub(crate) requeue: bool,
}

pub(crate) struct IovaAllocator {
    inner: spin::Mutex<Inner>,
}

struct Inner {
    pool: RangeAllocator,
    deferred: Option<DeferredSlots>,
}

impl IovaAllocator {
    pub(crate) fn new(window: Range<Daddr>, policy: FreePolicy) -> Self {
        let deferred = match policy {
            FreePolicy::Immediate => None,
            FreePolicy::Deferred { watermark_permille } => {
                Some(DeferredSlots::new(&window, watermark_permille))
            }
        };
        Self {
            inner: spin::Mutex::new(Inner {
                pool: RangeAllocator::new(window),
                deferred,
            }),
        }
    }

    /// Reserves `size` bytes aligned to `align`.
    ///
    /// A pending deferred range of exactly the same size is reused first. In
    /// that case the address space is invalidated through `flusher` before
    /// the range is returned. Never blocks on the hardware otherwise.
    pub(crate) fn reserve(
        &self,
        size: usize,
        align: usize,
        flusher: &dyn IotlbFlush,
    ) -> Result<Range<Daddr>> {
        if size == 0 || size % PAGE_SIZE != 0 || !align.is_power_of_two() || align < PAGE_SIZE {
            return Err(Error::InvalidArgs);
        }

        let mut inner = self.inner.lock();
        let reused = inner
            .deferred
            .as_mut()
            .and_then(|deferred| deferred.claim(size, align));
        let Some(range) = reused else {
            return inner.pool.alloc(size, align);
        };
        drop(inner);

        if let Err(err) = flusher.flush_all() {
            if let Some(deferred) = self.inner.lock().deferred.as_mut() {
                deferred.restore(&range);
            }
            return Err(err);
        }
        trace!(
            "[SMMU]: reused deferred range {:#x}..{:#x}",
            range.start, range.end
        );
        Ok(range)
    }

    /// Reserves exactly `start..start + size`.
    pub(crate) fn reserve_at(&self, start: Daddr, size: usize) -> Result<Range<Daddr>> {
        if size == 0 || size % PAGE_SIZE != 0 || start % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgs);
        }
        let end = start.checked_add(size).ok_or(Error::OutOfRange)?;
        self.inner.lock().pool.alloc_specific(start..end)?;
        Ok(start..end)
    }

    /// Releases a range returned by [`Self::reserve`] or
    /// [`Self::reserve_at`].
    ///
    /// Returns whether a sweep of deferred releases should be started.
    pub(crate) fn release(&self, range: Range<Daddr>, release: Release) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.is_live(&range) {
            error!(
                "[SMMU]: releasing {:#x}..{:#x}, which is not live",
                range.start, range.end
            );
            return Err(Error::DoubleFree);
        }

        let Inner { pool, deferred } = &mut *inner;
        match (release, deferred.as_mut()) {
            (Release::Deferred, Some(deferred)) => deferred.insert(&range),
            _ => pool.free(range).map(|_| false),
        }
    }

    /// Runs the outstanding sweep of deferred releases, if any.
    ///
    /// The invalidation happens outside the lock. If it fails, the sweep
    /// stays outstanding.
    pub(crate) fn reclaim(&self, flusher: &dyn IotlbFlush) -> Result<Reclaimed> {
        let sweep = {
            let inner = self.inner.lock();
            match inner.deferred.as_ref().and_then(|deferred| deferred.sweeping()) {
                Some(sweep) => sweep,
                None => return Ok(Reclaimed::default()),
            }
        };

        flusher.flush_all()?;

        let mut inner = self.inner.lock();
        let Inner { pool, deferred } = &mut *inner;
        let Some(deferred) = deferred.as_mut() else {
            return Ok(Reclaimed::default());
        };
        let Some(ranges) = deferred.finish_sweep(sweep) else {
            // Swept concurrently.
            return Ok(Reclaimed::default());
        };

        let mut freed = 0;
        for range in ranges {
            let len = range.len();
            if pool.free(range).is_ok() {
                freed += len;
            }
        }
        let requeue = deferred.try_close();
        debug!(
            "[SMMU]: swept {:?} epoch, {:#x} bytes reclaimed",
            sweep.epoch, freed
        );

        Ok(Reclaimed { freed, requeue })
    }

    /// Returns whether a closed epoch waits for its sweep.
    pub(crate) fn has_sweep(&self) -> bool {
        self.inner
            .lock()
            .deferred
            .as_ref()
            .is_some_and(|deferred| deferred.sweeping().is_some())
    }

    /// Sweeps every pending deferred release.
    pub(crate) fn drain(&self, flusher: &dyn IotlbFlush) -> Result<usize> {
        let mut freed = 0;
        // The outstanding sweep, if any, and then the current epoch.
        for _ in 0..2 {
            let has_sweep = self
                .inner
                .lock()
                .deferred
                .as_mut()
                .is_some_and(|deferred| deferred.force_close());
            if !has_sweep {
                break;
            }
            freed += self.reclaim(flusher)?.freed;
        }
        Ok(freed)
    }

    /// Returns the number of bytes that can be reserved right now.
    pub(crate) fn free_size(&self) -> usize {
        self.inner.lock().pool.free_size()
    }

    /// Returns the number of bytes released but not yet swept.
    pub(crate) fn pending_size(&self) -> usize {
        self.inner
            .lock()
            .deferred
            .as_ref()
            .map_or(0, |deferred| deferred.pending_pages() * PAGE_SIZE)
    }

    /// Returns whether `range` is exactly a reserved, unreleased range.
    pub(crate) fn is_live(&self, range: &Range<Daddr>) -> bool {
        self.inner.lock().is_live(range)
    }

    /// Returns the reserved, unreleased ranges.
    pub(crate) fn live_ranges(&self) -> Vec<Range<Daddr>> {
        let inner = self.inner.lock();
        inner
            .pool
            .allocated_ranges()
            .filter(|range| inner.is_live(range))
            .collect()
    }
}

impl Inner {
    fn is_live(&self, range: &Range<Daddr>) -> bool {
        // A pending deferred range stays allocated in the pool.
        self.pool.is_allocated(range)
            && !self
                .deferred
                .as_ref()
                .is_some_and(|deferred| deferred.is_pending(range))
    }
}
