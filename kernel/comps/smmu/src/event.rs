// SPDX-License-Identifier: MPL-2.0

//! The event queue, through which the SMMU reports faults.

use core::sync::atomic::Ordering;

use int_to_c_enum::TryFromInt;

use crate::{
    domain::Asid,
    hal::Hal,
    mm::CoherentPages,
    page_table::PteSnapshot,
    prelude::*,
    registers::{EVTQ_CONS, EVTQ_PROD, QUEUE_OVERFLOW, SmmuRegisters, queue_base},
    stream::StreamId,
};

/// The number of 64-bit words of an event record.
pub(crate) const EVT_WORDS: usize = 4;

/// The kind of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromInt)]
#[repr(u8)]
pub enum EventId {
    UnsupportedUpstreamTransaction = 0x01,
    BadStreamId = 0x02,
    SteFetch = 0x03,
    BadSte = 0x04,
    BadAtsTranslationRequest = 0x05,
    StreamDisabled = 0x06,
    TranslationForbidden = 0x07,
    BadSubstreamId = 0x08,
    CdFetch = 0x09,
    BadCd = 0x0a,
    WalkExternalAbort = 0x0b,
    Translation = 0x10,
    AddressSize = 0x11,
    Access = 0x12,
    Permission = 0x13,
    TlbConflict = 0x20,
    CfgConflict = 0x21,
    PageRequest = 0x24,
}

impl EventId {
    /// Returns whether the event is a fault of a stage-1 translation.
    pub fn is_translation_fault(&self) -> bool {
        matches!(
            self,
            EventId::Translation | EventId::AddressSize | EventId::Access | EventId::Permission
        )
    }
}

/// An event record.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct EventRecord([u64; EVT_WORDS]);

impl EventRecord {
    const RNW: u64 = 1 << 35;
    const PNU: u64 = 1 << 36;
    const IND: u64 = 1 << 37;

    pub const fn from_words(words: [u64; EVT_WORDS]) -> Self {
        Self(words)
    }

    /// Creates a record of a translation-related fault.
    pub fn new_fault(id: EventId, sid: StreamId, iova: Daddr, access: FaultAccess) -> Self {
        let mut words = [0u64; EVT_WORDS];
        words[0] = id as u64 | ((sid as u64) << 32);
        if access == FaultAccess::Read {
            words[1] |= Self::RNW;
        }
        words[2] = iova as u64;
        Self(words)
    }

    pub fn words(&self) -> &[u64; EVT_WORDS] {
        &self.0
    }

    /// Returns the kind of the event, if known.
    pub fn id(&self) -> Option<EventId> {
        EventId::try_from(self.0[0] as u8).ok()
    }

    pub fn stream_id(&self) -> StreamId {
        (self.0[0] >> 32) as StreamId
    }

    /// Returns the input address of the faulting transaction.
    pub fn input_addr(&self) -> Daddr {
        self.0[2] as Daddr
    }

    pub fn access(&self) -> FaultAccess {
        if self.0[1] & Self::RNW != 0 {
            FaultAccess::Read
        } else {
            FaultAccess::Write
        }
    }

    pub fn is_privileged(&self) -> bool {
        self.0[1] & Self::PNU != 0
    }

    pub fn is_instruction(&self) -> bool {
        self.0[1] & Self::IND != 0
    }
}

impl core::fmt::Debug for EventRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventRecord")
            .field("id", &self.id())
            .field("raw_id", &format_args!("{:#x}", self.0[0] as u8))
            .field("stream_id", &format_args!("{:#x}", self.stream_id()))
            .field("input_addr", &format_args!("{:#x}", self.input_addr()))
            .field("raw", &format_args!("{:#018x?}", self.0))
            .finish()
    }
}

/// The direction of a faulting transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultAccess {
    Read,
    Write,
}

/// A translation fault, with what the driver knows about its address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FaultReport {
    pub event: EventId,
    pub stream_id: StreamId,
    pub iova: Daddr,
    pub access: FaultAccess,
    pub privileged: bool,
    pub instruction: bool,
    /// The ASID of the domain the stream is bound to.
    pub asid: Option<Asid>,
    /// The page table entries of the domain around `iova`.
    pub ptes: Option<PteSnapshot>,
}

/// Receives the translation faults reported by an SMMU.
pub trait FaultObserver: Send + Sync {
    fn on_fault(&self, report: &FaultReport);
}

pub(crate) struct EventQueue {
    ring: CoherentPages,
    shift: u32,
    /// The consumer index, including the overflow acknowledgement flag.
    cons: spin::Mutex<u32>,
    last: spin::Mutex<Option<EventRecord>>,
}

impl EventQueue {
    pub(crate) fn new(hal: &Arc<dyn Hal>, shift: u32) -> Result<Self> {
        let size = (1usize << shift) * EVT_WORDS * size_of::<u64>();
        Ok(Self {
            ring: CoherentPages::alloc(hal, size.div_ceil(PAGE_SIZE))?,
            shift,
            cons: spin::Mutex::new(0),
            last: spin::Mutex::new(None),
        })
    }

    /// Returns the value of the `EVTQ_BASE` register.
    pub(crate) fn base_register_value(&self) -> u64 {
        queue_base(self.ring.paddr(), self.shift)
    }

    /// Consumes every pending record and returns how many were handled.
    ///
    /// A record identical to the one before it is dropped. The records are
    /// handled before the consumer index is written back, so the slots stay
    /// intact while `handle` runs.
    pub(crate) fn drain(&self, regs: &SmmuRegisters, mut handle: impl FnMut(&EventRecord)) -> usize {
        let mut cons_guard = self.cons.lock();

        let prod_reg = regs.read32(EVTQ_PROD);
        if (prod_reg ^ *cons_guard) & QUEUE_OVERFLOW != 0 {
            warn!("[SMMU]: event queue overflowed, some events were lost");
        }

        let prod = prod_reg & self.prod_mask();
        let mut cons = *cons_guard & self.prod_mask();
        let mut nr_handled = 0;
        while cons != prod {
            let record = self.read_record(cons);
            let is_duplicate = {
                let mut last = self.last.lock();
                let is_duplicate = *last == Some(record);
                *last = Some(record);
                is_duplicate
            };
            if is_duplicate {
                trace!("[SMMU]: dropping repeated event {:?}", record);
            } else {
                handle(&record);
                nr_handled += 1;
            }
            cons = self.inc(cons);
        }

        let cons = cons | (prod_reg & QUEUE_OVERFLOW);
        *cons_guard = cons;
        regs.write32(EVTQ_CONS, cons);
        nr_handled
    }

    /// Returns the most recently consumed record.
    pub(crate) fn last_record(&self) -> Option<EventRecord> {
        *self.last.lock()
    }

    fn read_record(&self, cons: u32) -> EventRecord {
        let base = (cons & ((1 << self.shift) - 1)) as usize * EVT_WORDS;
        let mut words = [0u64; EVT_WORDS];
        for (word, slot) in words.iter_mut().zip(&self.ring.words()[base..base + EVT_WORDS]) {
            *word = slot.load(Ordering::Acquire);
        }
        EventRecord(words)
    }

    fn prod_mask(&self) -> u32 {
        (2 << self.shift) - 1
    }

    fn inc(&self, cons: u32) -> u32 {
        (cons + 1) & self.prod_mask()
    }
}
