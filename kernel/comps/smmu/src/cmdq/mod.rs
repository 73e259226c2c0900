// SPDX-License-Identifier: MPL-2.0

//! The command queue.
//!
//! Any number of CPUs may submit commands concurrently without taking a lock.
//! A submitter first reserves slots by advancing the shared producer cursor
//! with a compare-and-swap, writes its commands, and then publishes them by
//! toggling their bits in a software valid map. The submitter that finds the
//! cursor unowned becomes the owner of everything reserved until it closes
//! the batch: it waits for the previous owner, waits for the batch to be
//! valid, and rings the doorbell once for the whole batch.
//!
//! A submission may end with `CMD_SYNC`, in which case the submitter waits
//! until the hardware has consumed the sync, and thereby every command
//! queued before it.

mod command;
mod lock;
mod poll;

use core::{
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering, fence},
    time::Duration,
};

use int_to_c_enum::TryFromInt;

pub use self::command::Command;
pub(crate) use self::{command::CMD_WORDS, poll::QueuePoll};
use self::lock::CmdqLock;
use crate::{
    hal::Hal,
    mm::CoherentPages,
    prelude::*,
    registers::{CMDQ_CONS, CMDQ_PROD, SmmuRegisters, queue_base},
};

/// The errors of command submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdqError {
    /// The hardware did not consume the commands in time.
    Timeout,
    /// The SMMU is in service failure mode.
    Disabled,
    /// More commands than the queue can hold at once.
    BatchTooLarge,
}

/// Marks the producer cursor as owned by a submitter that has not closed
/// its batch yet.
const OWNED_FLAG: u32 = 1 << 31;

const CONS_ERR_SHIFT: u32 = 24;
const CONS_ERR_MASK: u32 = 0x7f;

/// The error code the hardware reports in `CMDQ_CONS`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromInt)]
#[repr(u8)]
enum ConsumerError {
    None = 0,
    /// The command is illegal.
    Illegal = 1,
    /// An abort was raised when fetching the command.
    Abort = 2,
    /// An ATC invalidation timed out.
    AtcInvalidationSync = 3,
}

/// The packed `{cons, prod}` cursor, as seen by software.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Cursor {
    prod: u32,
    cons: u32,
}

impl Cursor {
    fn from_raw(raw: u64) -> Self {
        Self {
            prod: raw as u32,
            cons: (raw >> 32) as u32,
        }
    }

    fn into_raw(self) -> u64 {
        ((self.cons as u64) << 32) | self.prod as u64
    }
}

/// The software and hardware positions of the queue, for diagnostics.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CmdqSnapshot {
    pub(crate) prod: u32,
    pub(crate) cons: u32,
    pub(crate) owner_prod: u32,
    pub(crate) hw_prod: u32,
    pub(crate) hw_cons: u32,
}

pub(crate) struct CommandQueue {
    ring: CoherentPages,
    shift: u32,
    cursor: AtomicU64,
    /// The producer index published by the latest owner.
    owner_prod: AtomicU32,
    /// One bit per slot; a slot is valid when its bit differs from the wrap
    /// bit of its producer index.
    valid_map: Box<[AtomicU64]>,
    lock: CmdqLock,
    recovery: spin::Mutex<()>,
    halted: AtomicBool,
    disabled: AtomicBool,
    regs: SmmuRegisters,
    hal: Arc<dyn Hal>,
    timeout: Duration,
}

impl CommandQueue {
    pub(crate) fn new(
        hal: &Arc<dyn Hal>,
        regs: SmmuRegisters,
        shift: u32,
        timeout: Duration,
    ) -> Result<Self> {
        let nr_entries = 1usize << shift;
        let nr_pages = (nr_entries * CMD_WORDS * size_of::<u64>()).div_ceil(PAGE_SIZE);
        let ring = CoherentPages::alloc(hal, nr_pages)?;
        let valid_map = (0..nr_entries.div_ceil(u64::BITS as usize))
            .map(|_| AtomicU64::new(0))
            .collect();

        Ok(Self {
            ring,
            shift,
            cursor: AtomicU64::new(0),
            owner_prod: AtomicU32::new(0),
            valid_map,
            lock: CmdqLock::new(),
            recovery: spin::Mutex::new(()),
            halted: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            regs,
            hal: hal.clone(),
            timeout,
        })
    }

    /// Returns the value of the `CMDQ_BASE` register.
    pub(crate) fn base_register_value(&self) -> u64 {
        queue_base(self.ring.paddr(), self.shift)
    }

    pub(crate) fn nr_entries(&self) -> u32 {
        1 << self.shift
    }

    /// Returns the largest number of commands one `submit` accepts.
    ///
    /// Half of the ring, so that a batch never waits for itself.
    pub(crate) fn max_batch(&self) -> usize {
        (self.nr_entries() / 2) as usize - 1
    }

    /// Submits `cmds`, followed by `CMD_SYNC` if `sync` is set, and waits for
    /// the sync to complete.
    pub(crate) fn submit(&self, cmds: &[Command], sync: bool) -> core::result::Result<(), CmdqError> {
        let n = cmds.len() + sync as usize;
        if n == 0 {
            return Ok(());
        }
        if n > self.max_batch() + 1 {
            return Err(CmdqError::BatchTooLarge);
        }
        let n = n as u32;

        let mut poll = QueuePoll::new(&*self.hal, self.timeout);
        self.wait_while_halted(&mut poll)?;

        // 1. Reserve slots.
        let mut cur = Cursor::from_raw(self.cursor.load(Ordering::Relaxed));
        let head = loop {
            while !self.has_space(cur, n) {
                cur = self.wait_for_space(n, &mut poll)?;
            }
            let head = Cursor {
                prod: self.inc_prod_n(cur.prod, n) | OWNED_FLAG,
                cons: cur.cons,
            };
            match self.cursor.compare_exchange(
                cur.into_raw(),
                head.into_raw(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break head,
                Err(actual) => cur = Cursor::from_raw(actual),
            }
        };
        let is_owner = cur.prod & OWNED_FLAG == 0;
        let start = cur.prod & !OWNED_FLAG;
        let end = head.prod & !OWNED_FLAG;

        // 2. Write the commands.
        for (i, cmd) in cmds.iter().enumerate() {
            self.write_slot(self.inc_prod_n(start, i as u32), cmd.encode());
        }
        let sync_prod = if sync {
            let prod = self.inc_prod_n(start, cmds.len() as u32);
            self.write_slot(prod, Command::Sync.encode());
            // Keeps the cached consumer index from moving past the sync
            // before it is observed.
            self.lock.shared_lock();
            Some(prod)
        } else {
            None
        };

        // 3. Publish the slots.
        self.set_valid_map(start, end);

        // 4. Ring the doorbell for the whole batch.
        if is_owner {
            while self.owner_prod.load(Ordering::Acquire) != start {
                core::hint::spin_loop();
            }

            // Closes the batch. Later submitters become the next owner.
            let prod = Cursor::from_raw(
                self.cursor
                    .fetch_and(!(OWNED_FLAG as u64), Ordering::Relaxed),
            )
            .prod
                & !OWNED_FLAG;

            self.poll_valid_map(start, prod);

            // The commands must reach memory before the SMMU sees the new
            // producer index.
            fence(Ordering::SeqCst);
            self.regs.write32(CMDQ_PROD, prod);

            self.owner_prod.store(prod, Ordering::Release);
        }

        // 5. Wait for the sync to be consumed.
        let Some(sync_prod) = sync_prod else {
            return Ok(());
        };
        match self.poll_until_consumed(sync_prod) {
            Ok(cons) => {
                if !self.lock.shared_tryunlock() {
                    self.update_cached_cons(cons);
                    self.lock.shared_unlock();
                }
                Ok(())
            }
            Err(err) => {
                self.lock.shared_unlock();
                Err(err)
            }
        }
    }

    /// Skips the command that stopped the hardware.
    ///
    /// Called from the global error handler before `CMDQ_ERR` is
    /// acknowledged. The offending command is replaced by `CMD_SYNC`, so the
    /// hardware resumes with the next command once the error is acknowledged.
    pub(crate) fn skip_error(&self) {
        let _guard = self.recovery.lock();
        self.halted.store(true, Ordering::Release);

        let cons = self.regs.read32(CMDQ_CONS);
        let code = ((cons >> CONS_ERR_SHIFT) & CONS_ERR_MASK) as u8;
        match ConsumerError::try_from(code) {
            Ok(ConsumerError::None) => {
                warn!("[SMMU]: CMDQ error reported without an error code");
            }
            Ok(ConsumerError::Illegal) | Ok(ConsumerError::Abort) => {}
            Ok(ConsumerError::AtcInvalidationSync) => {
                // Retrying an ATC invalidation may time out again. Resume
                // with the next command.
                warn!("[SMMU]: ATC invalidation timed out");
                self.halted.store(false, Ordering::Release);
                return;
            }
            Err(_) => {
                error!("[SMMU]: unknown CMDQ error code {:#x}", code);
            }
        }

        let words = self.read_slot(cons);
        error!(
            "[SMMU]: skipping command in error state at {:#x}: {:?} ({:#018x?})",
            cons & self.prod_mask(),
            Command::decode(words),
            words
        );
        self.write_slot(cons, Command::Sync.encode());
        fence(Ordering::SeqCst);

        self.halted.store(false, Ordering::Release);
    }

    /// Fails every pending and future submission.
    pub(crate) fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    pub(crate) fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub(crate) fn snapshot(&self) -> CmdqSnapshot {
        let cur = Cursor::from_raw(self.cursor.load(Ordering::Relaxed));
        CmdqSnapshot {
            prod: cur.prod,
            cons: cur.cons,
            owner_prod: self.owner_prod.load(Ordering::Relaxed),
            hw_prod: self.regs.read32(CMDQ_PROD),
            hw_cons: self.regs.read32(CMDQ_CONS),
        }
    }

    fn ensure_enabled(&self) -> core::result::Result<(), CmdqError> {
        if self.is_disabled() {
            return Err(CmdqError::Disabled);
        }
        Ok(())
    }

    fn wait_while_halted(&self, poll: &mut QueuePoll) -> core::result::Result<(), CmdqError> {
        while self.halted.load(Ordering::Acquire) {
            self.ensure_enabled()?;
            poll.poll().map_err(|_| CmdqError::Timeout)?;
        }
        self.ensure_enabled()
    }

    /// Waits until the queue has room for `n` slots.
    fn wait_for_space(
        &self,
        n: u32,
        poll: &mut QueuePoll,
    ) -> core::result::Result<Cursor, CmdqError> {
        loop {
            if self.lock.exclusive_trylock() {
                let cons = self.regs.read32(CMDQ_CONS);
                self.update_cached_cons(cons);
                self.lock.exclusive_unlock();
            }

            let cur = Cursor::from_raw(self.cursor.load(Ordering::Relaxed));
            if self.has_space(cur, n) {
                return Ok(cur);
            }

            self.ensure_enabled()?;
            if poll.poll().is_err() {
                warn!("[SMMU]: CMDQ stays full: {:?}", self.snapshot());
                return Err(CmdqError::Timeout);
            }
        }
    }

    /// Waits until the hardware consumer index passes `prod`, and returns
    /// the last index read.
    fn poll_until_consumed(&self, prod: u32) -> core::result::Result<u32, CmdqError> {
        let mut poll = QueuePoll::new(&*self.hal, self.timeout);
        let mut cons = Cursor::from_raw(self.cursor.load(Ordering::Relaxed)).cons;
        loop {
            if self.is_consumed(cons, prod) {
                return Ok(cons);
            }
            self.ensure_enabled()?;
            poll.poll().map_err(|_| CmdqError::Timeout)?;
            cons = self.regs.read32(CMDQ_CONS);
        }
    }

    fn update_cached_cons(&self, cons: u32) {
        let cons = cons & self.prod_mask();
        let mut raw = self.cursor.load(Ordering::Relaxed);
        loop {
            let mut cur = Cursor::from_raw(raw);
            cur.cons = cons;
            match self.cursor.compare_exchange_weak(
                raw,
                cur.into_raw(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => raw = actual,
            }
        }
    }

    fn write_slot(&self, prod: u32, words: [u64; CMD_WORDS]) {
        let base = self.idx(prod) as usize * CMD_WORDS;
        let slot = &self.ring.words()[base..base + CMD_WORDS];
        for (entry, word) in slot.iter().zip(words) {
            entry.store(word, Ordering::Relaxed);
        }
    }

    fn read_slot(&self, prod: u32) -> [u64; CMD_WORDS] {
        let base = self.idx(prod) as usize * CMD_WORDS;
        let slot = &self.ring.words()[base..base + CMD_WORDS];
        [slot[0].load(Ordering::Relaxed), slot[1].load(Ordering::Relaxed)]
    }

    fn set_valid_map(&self, start: u32, end: u32) {
        self.for_each_valid_word(start, end, |word, mask, _| {
            word.fetch_xor(mask, Ordering::Release);
        });
    }

    fn poll_valid_map(&self, start: u32, end: u32) {
        self.for_each_valid_word(start, end, |word, mask, prod| {
            // Bits of slots in an even lap are set when valid.
            let valid = if self.wrp(prod) == 0 { mask } else { 0 };
            while word.load(Ordering::Acquire) & mask != valid {
                core::hint::spin_loop();
            }
        });
    }

    /// Visits the valid map words covering `start..end`, with the mask of
    /// the covered bits and the producer index of the first of them.
    fn for_each_valid_word(&self, start: u32, end: u32, mut f: impl FnMut(&AtomicU64, u64, u32)) {
        let bits_per_word = self.nr_entries().min(u64::BITS);
        let end_word = self.idx(end) / u64::BITS;
        let end_bit = self.idx(end) % u64::BITS;

        let mut prod = start;
        loop {
            let word = self.idx(prod) / u64::BITS;
            let bit = self.idx(prod) % u64::BITS;
            let limit = if word == end_word && bit < end_bit {
                end_bit
            } else {
                bits_per_word
            };
            let width = limit - bit;
            let mask = if width == u64::BITS {
                u64::MAX
            } else {
                ((1u64 << width) - 1) << bit
            };

            f(&self.valid_map[word as usize], mask, prod);

            prod = self.inc_prod_n(prod, width);
            if prod == end {
                return;
            }
        }
    }

    fn idx(&self, prod: u32) -> u32 {
        prod & ((1 << self.shift) - 1)
    }

    fn wrp(&self, prod: u32) -> u32 {
        prod & (1 << self.shift)
    }

    fn prod_mask(&self) -> u32 {
        (2 << self.shift) - 1
    }

    fn inc_prod_n(&self, prod: u32, n: u32) -> u32 {
        let next = (self.wrp(prod) | self.idx(prod)) + n;
        (prod & OWNED_FLAG) | self.wrp(next) | self.idx(next)
    }

    fn has_space(&self, cur: Cursor, n: u32) -> bool {
        let prod = self.idx(cur.prod);
        let cons = self.idx(cur.cons);
        let space = if self.wrp(cur.prod) == self.wrp(cur.cons) {
            self.nr_entries() - (prod - cons)
        } else {
            cons - prod
        };
        space >= n
    }

    /// Returns whether the slot at `prod` has been consumed by `cons`.
    fn is_consumed(&self, cons: u32, prod: u32) -> bool {
        if self.wrp(cons) == self.wrp(prod) {
            self.idx(cons) > self.idx(prod)
        } else {
            self.idx(cons) <= self.idx(prod)
        }
    }
}
