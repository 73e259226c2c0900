// SPDX-License-Identifier: MPL-2.0

//! Deduplication of shared-buffer mappings.
//!
//! A buffer shared among the devices of a domain is mapped once. Later
//! requests for the same buffer take a reference to the existing mapping,
//! which is torn down when the last reference is dropped.

use alloc::collections::btree_map::Entry;

use crate::prelude::*;

/// The identity of a shared buffer, as assigned by its owner.
pub type BufferId = u64;

#[derive(Debug)]
struct CacheEntry {
    range: Range<Daddr>,
    refcnt: usize,
}

pub(crate) struct MappingCache {
    entries: spin::Mutex<BTreeMap<BufferId, CacheEntry>>,
}

impl MappingCache {
    pub(crate) fn new() -> Self {
        Self {
            entries: spin::Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the mapping of `id`, creating it with `build` on a miss.
    ///
    /// `build` runs without the lock held. If another caller created the
    /// mapping meanwhile, the one just built is given to `teardown` and the
    /// existing one is used.
    pub(crate) fn get_or_create(
        &self,
        id: BufferId,
        build: impl FnOnce() -> Result<Range<Daddr>>,
        teardown: impl FnOnce(Range<Daddr>) -> Result<()>,
    ) -> Result<Daddr> {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.refcnt += 1;
            return Ok(entry.range.start);
        }

        let range = build()?;

        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&id) {
            entry.refcnt += 1;
            let start = entry.range.start;
            drop(entries);
            debug!(
                "[SMMU]: buffer {:#x} was mapped concurrently, dropping {:#x}..{:#x}",
                id, range.start, range.end
            );
            if let Err(err) = teardown(range) {
                warn!("[SMMU]: failed to drop a duplicate mapping: {:?}", err);
            }
            return Ok(start);
        }

        let start = range.start;
        entries.insert(
            id,
            CacheEntry { range, refcnt: 1 },
        );
        Ok(start)
    }

    /// Drops a reference to the mapping of `id`, tearing the mapping down
    /// with `teardown` if it was the last one.
    ///
    /// If `teardown` fails, the last reference is kept, so that releasing
    /// `id` again retries the teardown.
    pub(crate) fn release(
        &self,
        id: BufferId,
        teardown: impl FnOnce(Range<Daddr>) -> Result<()>,
    ) -> Result<()> {
        let range = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&id) else {
                error!("[SMMU]: releasing buffer {:#x}, which is not mapped", id);
                return Err(Error::NotMapped);
            };
            if entry.refcnt > 1 {
                entry.refcnt -= 1;
                return Ok(());
            }
            let Some(entry) = entries.remove(&id) else {
                return Ok(());
            };
            trace!("[SMMU]: last reference to buffer {:#x} dropped", id);
            entry.range
        };

        teardown(range.clone()).inspect_err(|err| {
            warn!(
                "[SMMU]: failed to tear down buffer {:#x} at {:#x}..{:#x}: {:?}",
                id, range.start, range.end, err
            );
            match self.entries.lock().entry(id) {
                Entry::Vacant(vacant) => {
                    vacant.insert(CacheEntry {
                        range: range.clone(),
                        refcnt: 1,
                    });
                }
                Entry::Occupied(_) => error!(
                    "[SMMU]: buffer {:#x} was mapped again, {:#x}..{:#x} must be unmapped directly",
                    id, range.start, range.end
                ),
            }
        })
    }

    pub(crate) fn refcount(&self, id: BufferId) -> Option<usize> {
        self.entries.lock().get(&id).map(|entry| entry.refcnt)
    }

    /// Returns whether a cached mapping starts at `iova`.
    pub(crate) fn contains_iova(&self, iova: Daddr) -> bool {
        self.entries
            .lock()
            .values()
            .any(|entry| entry.range.start == iova)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
