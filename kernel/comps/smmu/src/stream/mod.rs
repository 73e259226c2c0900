// SPDX-License-Identifier: MPL-2.0

//! The stream table, which binds devices to their translation contexts.

mod ste;

use core::sync::atomic::{AtomicU64, Ordering, fence};

pub use self::ste::Privilege;
pub(crate) use self::ste::{CD_WORDS, ContextDescriptor, STE_WORDS, StreamConfig, StreamTableEntry};
use crate::{
    hal::Hal,
    mm::CoherentPages,
    prelude::*,
    registers::{BASE_RA, genmask},
};

/// The identifier of the device (or device function) issuing a transaction.
pub type StreamId = u32;

/// A linear stream table.
pub(crate) struct StreamTable {
    pages: CoherentPages,
    sid_bits: u32,
}

impl StreamTable {
    /// Creates a table for `1 << sid_bits` streams, all set to `default`.
    ///
    /// The entries are written without invalidation, so the table must not
    /// be in use by the hardware yet.
    pub(crate) fn new(hal: &Arc<dyn Hal>, sid_bits: u32, default: StreamConfig) -> Result<Self> {
        let size = (1usize << sid_bits) * STE_WORDS * size_of::<u64>();
        let pages = CoherentPages::alloc(hal, size.div_ceil(PAGE_SIZE))?;
        let table = Self { pages, sid_bits };

        let ste = StreamTableEntry::new(default);
        for sid in 0..table.nr_streams() {
            for (slot, word) in table.slots(sid).iter().zip(ste.words()) {
                slot.store(*word, Ordering::Relaxed);
            }
        }
        fence(Ordering::Release);

        Ok(table)
    }

    pub(crate) fn nr_streams(&self) -> StreamId {
        1 << self.sid_bits
    }

    pub(crate) fn contains(&self, sid: StreamId) -> bool {
        sid < self.nr_streams()
    }

    /// Returns the value of the `STRTAB_BASE` register.
    pub(crate) fn base_register_value(&self) -> u64 {
        BASE_RA | (self.pages.paddr() as u64 & genmask(51, 6))
    }

    /// Returns the value of the `STRTAB_BASE_CFG` register.
    pub(crate) fn cfg_register_value(&self) -> u32 {
        // Linear format (0b00 in bits [17:16]).
        self.sid_bits
    }

    #[cfg(test)]
    pub(crate) fn read(&self, sid: StreamId) -> Result<StreamTableEntry> {
        let slots = self.checked_slots(sid)?;
        let mut words = [0u64; STE_WORDS];
        for (word, slot) in words.iter_mut().zip(slots) {
            *word = slot.load(Ordering::Acquire);
        }
        Ok(StreamTableEntry::from_words(words))
    }

    /// Replaces the entry of `sid` with `new`.
    ///
    /// `invalidate` must drop the cached copy of the entry and wait for that
    /// to complete. The hardware never observes a half-written live entry:
    /// a live entry is first made invalid, then the new entry is populated
    /// while still invalid, and finally word 0 makes it live.
    ///
    /// If an invalidation fails, the entry is left invalid and the
    /// transactions of the stream are terminated.
    pub(crate) fn write(
        &self,
        sid: StreamId,
        new: &StreamTableEntry,
        invalidate: impl Fn(StreamId) -> Result<()>,
    ) -> Result<()> {
        let slots = self.checked_slots(sid)?;
        let result = Self::replace(sid, slots, new, invalidate);
        if result.is_err() {
            slots[0].store(0, Ordering::Release);
        }
        result
    }

    fn replace(
        sid: StreamId,
        slots: &[AtomicU64],
        new: &StreamTableEntry,
        invalidate: impl Fn(StreamId) -> Result<()>,
    ) -> Result<()> {
        if slots[0].load(Ordering::Acquire) & 1 != 0 {
            slots[0].store(0, Ordering::Release);
            invalidate(sid)?;
        }

        for (slot, word) in slots[1..].iter().zip(&new.words()[1..]) {
            slot.store(*word, Ordering::Relaxed);
        }
        fence(Ordering::Release);
        invalidate(sid)?;

        slots[0].store(new.words()[0], Ordering::Release);
        invalidate(sid)
    }

    fn checked_slots(&self, sid: StreamId) -> Result<&[AtomicU64]> {
        if !self.contains(sid) {
            error!(
                "[SMMU]: stream ID {:#x} is beyond the stream table ({} streams)",
                sid,
                self.nr_streams()
            );
            return Err(Error::UnknownDevice);
        }
        Ok(self.slots(sid))
    }

    fn slots(&self, sid: StreamId) -> &[AtomicU64] {
        let base = sid as usize * STE_WORDS;
        &self.pages.words()[base..base + STE_WORDS]
    }
}
