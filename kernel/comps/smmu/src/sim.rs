// SPDX-License-Identifier: MPL-2.0

//! A simulated platform and SMMU for tests.
//!
//! Host memory stands in for physical memory: a physical address is the
//! address of a host allocation, so the simulated unit reads the queues
//! directly. A consumer thread executes the commands the driver publishes.

use core::{
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};
use std::{
    alloc::{Layout, alloc_zeroed, dealloc},
    thread::JoinHandle,
    time::Instant,
};

use crate::{
    cmdq::{CMD_WORDS, Command},
    config::SmmuConfig,
    device::Smmu,
    event::{EVT_WORDS, EventRecord},
    hal::{Hal, Work},
    prelude::*,
    registers::{
        CMDQ_BASE, CMDQ_CONS, CMDQ_PROD, CR0, CR0ACK, Control, EVTQ_BASE, EVTQ_CONS, EVTQ_PROD,
        GERROR, GERRORN, GlobalErrors, IDR0, IDR1, IDR5, IRQ_CTRL, IRQ_CTRLACK, Idr0, Idr5, Mmio,
        QUEUE_OVERFLOW, STRTAB_BASE, genmask,
    },
    stream::{STE_WORDS, StreamId, StreamTableEntry},
};

pub(crate) struct SimHal {
    start: Instant,
    live_windows: AtomicUsize,
    live_pages: AtomicUsize,
    /// The number of `signal_pending` calls before a signal arrives, or a
    /// negative value if none will.
    signal_budget: AtomicI64,
    work: spin::Mutex<Vec<Arc<dyn Work>>>,
}

impl SimHal {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            start: Instant::now(),
            live_windows: AtomicUsize::new(0),
            live_pages: AtomicUsize::new(0),
            signal_budget: AtomicI64::new(-1),
            work: spin::Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn live_windows(&self) -> usize {
        self.live_windows.load(Ordering::Relaxed)
    }

    pub(crate) fn live_pages(&self) -> usize {
        self.live_pages.load(Ordering::Relaxed)
    }

    /// Delivers a signal after `nr_checks` more checks.
    pub(crate) fn signal_after(&self, nr_checks: i64) {
        self.signal_budget.store(nr_checks, Ordering::Relaxed);
    }

    pub(crate) fn clear_signal(&self) {
        self.signal_budget.store(-1, Ordering::Relaxed);
    }

    pub(crate) fn nr_queued_work(&self) -> usize {
        self.work.lock().len()
    }

    /// Runs the queued work items, and returns how many ran.
    pub(crate) fn run_queued_work(&self) -> usize {
        let work = core::mem::take(&mut *self.work.lock());
        for item in &work {
            item.run();
        }
        work.len()
    }
}

impl Hal for SimHal {
    fn alloc_pages(&self, nr_pages: usize) -> Result<Paddr> {
        let layout =
            Layout::from_size_align(nr_pages * PAGE_SIZE, PAGE_SIZE).map_err(|_| Error::InvalidArgs)?;
        // SAFETY: The layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(Error::NoMemory);
        }
        self.live_pages.fetch_add(nr_pages, Ordering::Relaxed);
        Ok(ptr as Paddr)
    }

    unsafe fn free_pages(&self, paddr: Paddr, nr_pages: usize) {
        let layout = Layout::from_size_align(nr_pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        self.live_pages.fetch_sub(nr_pages, Ordering::Relaxed);
        // SAFETY: The pages were allocated by `alloc_pages` with this layout.
        unsafe { dealloc(paddr as *mut u8, layout) };
    }

    fn map_window(&self, paddr: Paddr, _size: usize) -> Result<NonNull<u8>> {
        let vaddr = NonNull::new(paddr as *mut u8).ok_or(Error::InvalidArgs)?;
        self.live_windows.fetch_add(1, Ordering::Relaxed);
        Ok(vaddr)
    }

    unsafe fn unmap_window(&self, _vaddr: NonNull<u8>, _size: usize) {
        self.live_windows.fetch_sub(1, Ordering::Relaxed);
    }

    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn delay(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn signal_pending(&self) -> bool {
        let budget = self.signal_budget.load(Ordering::Relaxed);
        if budget < 0 {
            return false;
        }
        if budget == 0 {
            return true;
        }
        self.signal_budget.fetch_sub(1, Ordering::Relaxed);
        false
    }

    fn queue_work(&self, work: Arc<dyn Work>) {
        self.work.lock().push(work);
    }
}

/// The register file of a simulated SMMU.
pub(crate) struct SimSmmu {
    regs: spin::Mutex<BTreeMap<usize, u64>>,
    commands: spin::Mutex<Vec<Command>>,
    doorbells: spin::Mutex<Vec<u32>>,
    nr_syncs: AtomicUsize,
    paused: AtomicBool,
    /// The consumer stopped at an erroneous command.
    halted: AtomicBool,
    failed: AtomicBool,
    fail_next: spin::Mutex<Option<u8>>,
    gerror_handler: spin::Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    stop: AtomicBool,
}

/// Stops the consumer thread when dropped.
pub(crate) struct Consumer {
    hw: Arc<SimSmmu>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.hw.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl SimSmmu {
    pub(crate) const SID_BITS: u32 = 16;
    pub(crate) const QUEUE_SHIFT: u32 = 19;

    pub(crate) fn new() -> Arc<Self> {
        let idr0 = Idr0::S1P | Idr0::TTF_AARCH64 | Idr0::COHACC | Idr0::ASID16;
        let idr1 = Self::SID_BITS | (Self::QUEUE_SHIFT << 16) | (Self::QUEUE_SHIFT << 21);
        let mut regs = BTreeMap::new();
        regs.insert(IDR0, idr0.bits() as u64);
        regs.insert(IDR1, idr1 as u64);
        regs.insert(IDR5, Idr5::GRAN4K.bits() as u64);

        Arc::new(Self {
            regs: spin::Mutex::new(regs),
            commands: spin::Mutex::new(Vec::new()),
            doorbells: spin::Mutex::new(Vec::new()),
            nr_syncs: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            fail_next: spin::Mutex::new(None),
            gerror_handler: spin::Mutex::new(None),
            stop: AtomicBool::new(false),
        })
    }

    /// Starts executing commands in a thread.
    pub(crate) fn spawn_consumer(self: &Arc<Self>) -> Consumer {
        let hw = self.clone();
        let thread = std::thread::spawn(move || {
            while !hw.stop.load(Ordering::Acquire) {
                if !hw.consume() {
                    std::thread::sleep(Duration::from_micros(20));
                }
            }
        });
        Consumer {
            hw: self.clone(),
            thread: Some(thread),
        }
    }

    pub(crate) fn set_gerror_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        *self.gerror_handler.lock() = Some(Arc::new(handler));
    }

    pub(crate) fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub(crate) fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    /// Makes the next command fail with the error `code`.
    pub(crate) fn fail_next_command(&self, code: u8) {
        *self.fail_next.lock() = Some(code);
    }

    /// Enters service failure mode.
    pub(crate) fn trigger_service_failure(&self) {
        self.failed.store(true, Ordering::Release);
        self.toggle_gerror(GlobalErrors::SFM_ERR);
        self.raise_gerror();
    }

    /// Returns the commands executed so far.
    pub(crate) fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    pub(crate) fn clear_commands(&self) {
        self.commands.lock().clear();
    }

    /// Returns the values written to `CMDQ_PROD` so far.
    pub(crate) fn doorbells(&self) -> Vec<u32> {
        self.doorbells.lock().clone()
    }

    pub(crate) fn nr_syncs(&self) -> usize {
        self.nr_syncs.load(Ordering::Acquire)
    }

    pub(crate) fn reg(&self, offset: usize) -> u64 {
        self.regs.lock().get(&offset).copied().unwrap_or(0)
    }

    fn set_reg(&self, offset: usize, value: u64) {
        self.regs.lock().insert(offset, value);
    }

    /// Reads the stream table entry of `sid` from the table the driver
    /// installed.
    pub(crate) fn stream_entry(&self, sid: StreamId) -> StreamTableEntry {
        let table = (self.reg(STRTAB_BASE) & genmask(51, 6)) as usize;
        let entry = table + sid as usize * STE_WORDS * size_of::<u64>();
        let mut words = [0u64; STE_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            // SAFETY: The entry lies in the stream table allocated by the
            // driver, which is only accessed atomically.
            let slot = unsafe { &*((entry + i * size_of::<u64>()) as *const AtomicU64) };
            *word = slot.load(Ordering::Acquire);
        }
        StreamTableEntry::from_words(words)
    }

    /// Writes an event record, as the hardware does on a fault.
    ///
    /// If the queue is full, the record is lost and the overflow flag is
    /// toggled.
    pub(crate) fn inject_event(&self, record: EventRecord) {
        let base = self.reg(EVTQ_BASE);
        let shift = (base & 0x1f) as u32;
        let ring = (base & genmask(51, 5)) as usize;
        let mask = (2u32 << shift) - 1;
        let idx_mask = (1u32 << shift) - 1;

        let prod_reg = self.reg(EVTQ_PROD) as u32;
        let prod = prod_reg & mask;
        let cons = self.reg(EVTQ_CONS) as u32 & mask;
        if prod & idx_mask == cons & idx_mask && prod != cons {
            self.set_reg(EVTQ_PROD, (prod_reg ^ QUEUE_OVERFLOW) as u64);
            return;
        }

        let slot = ring + (prod & idx_mask) as usize * EVT_WORDS * size_of::<u64>();
        for (i, word) in record.words().iter().enumerate() {
            // SAFETY: The slot lies in the event queue allocated by the
            // driver, which is only accessed atomically.
            let entry = unsafe { &*((slot + i * size_of::<u64>()) as *const AtomicU64) };
            entry.store(*word, Ordering::Release);
        }
        let next = (prod + 1) & mask;
        self.set_reg(EVTQ_PROD, ((prod_reg & QUEUE_OVERFLOW) | next) as u64);
    }

    /// Executes the published commands. Returns whether any was executed.
    fn consume(&self) -> bool {
        let enabled = Control::from_bits_truncate(self.reg(CR0) as u32).contains(Control::CMDQEN);
        if !enabled || self.failed.load(Ordering::Acquire) {
            return false;
        }

        let base = self.reg(CMDQ_BASE);
        let shift = (base & 0x1f) as u32;
        let ring = (base & genmask(51, 5)) as usize;
        let mask = (2u32 << shift) - 1;
        let idx_mask = (1u32 << shift) - 1;

        let mut progress = false;
        loop {
            if self.paused.load(Ordering::Acquire)
                || self.halted.load(Ordering::Acquire)
                || self.failed.load(Ordering::Acquire)
            {
                return progress;
            }
            let prod = self.reg(CMDQ_PROD) as u32 & mask;
            let cons = self.reg(CMDQ_CONS) as u32 & mask;
            if prod == cons {
                return progress;
            }

            let fail = self.fail_next.lock().take();
            if let Some(code) = fail {
                self.halted.store(true, Ordering::Release);
                self.set_reg(CMDQ_CONS, ((code as u64) << 24) | cons as u64);
                self.toggle_gerror(GlobalErrors::CMDQ_ERR);
                self.raise_gerror();
                // Retries the slot, which the handler may have rewritten.
                continue;
            }

            let slot = ring + (cons & idx_mask) as usize * CMD_WORDS * size_of::<u64>();
            let mut words = [0u64; CMD_WORDS];
            for (i, word) in words.iter_mut().enumerate() {
                // SAFETY: The slot lies in the command queue allocated by the
                // driver, which is only accessed atomically.
                let entry = unsafe { &*((slot + i * size_of::<u64>()) as *const AtomicU64) };
                *word = entry.load(Ordering::Acquire);
            }
            if let Ok(cmd) = Command::decode(words) {
                if cmd == Command::Sync {
                    self.nr_syncs.fetch_add(1, Ordering::AcqRel);
                }
                self.commands.lock().push(cmd);
            }

            self.set_reg(CMDQ_CONS, ((cons + 1) & mask) as u64);
            progress = true;
        }
    }

    fn toggle_gerror(&self, error: GlobalErrors) {
        let gerror = self.reg(GERROR) as u32;
        self.set_reg(GERROR, (gerror ^ error.bits()) as u64);
    }

    fn raise_gerror(&self) {
        let handler = self.gerror_handler.lock().clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}

impl Mmio for SimSmmu {
    fn read32(&self, offset: usize) -> u32 {
        self.reg(offset) as u32
    }

    fn write32(&self, offset: usize, value: u32) {
        self.set_reg(offset, value as u64);
        match offset {
            CR0 => self.set_reg(CR0ACK, value as u64),
            IRQ_CTRL => self.set_reg(IRQ_CTRLACK, value as u64),
            CMDQ_PROD => self.doorbells.lock().push(value),
            GERRORN => {
                let gerror = self.reg(GERROR) as u32;
                if (gerror ^ value) & GlobalErrors::CMDQ_ERR.bits() == 0 {
                    self.halted.store(false, Ordering::Release);
                }
            }
            _ => {}
        }
    }

    fn read64(&self, offset: usize) -> u64 {
        self.reg(offset)
    }

    fn write64(&self, offset: usize, value: u64) {
        self.set_reg(offset, value);
    }
}

/// An SMMU driving a simulated unit.
pub(crate) struct SimEnv {
    pub(crate) hal: Arc<SimHal>,
    pub(crate) hw: Arc<SimSmmu>,
    pub(crate) smmu: Arc<Smmu>,
    _consumer: Consumer,
}

impl SimEnv {
    pub(crate) fn boot() -> Self {
        Self::boot_with(SmmuConfig::default())
    }

    pub(crate) fn boot_with(config: SmmuConfig) -> Self {
        let hal = SimHal::new();
        let hw = SimSmmu::new();
        let consumer = hw.spawn_consumer();
        let smmu = Smmu::probe(hal.clone(), hw.clone(), config).unwrap();

        let weak = Arc::downgrade(&smmu);
        hw.set_gerror_handler(move || {
            if let Some(smmu) = weak.upgrade() {
                smmu.handle_gerror_irq();
            }
        });

        Self {
            hal,
            hw,
            smmu,
            _consumer: consumer,
        }
    }
}
