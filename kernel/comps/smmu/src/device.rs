// SPDX-License-Identifier: MPL-2.0

//! The SMMU instance.

use id_alloc::IdAlloc;

use crate::{
    cmdq::{CmdqError, Command, CommandQueue, QueuePoll},
    config::{DomainOptions, SmmuConfig},
    domain::{Asid, IommuDomain},
    event::{EventId, EventQueue, EventRecord, FaultObserver, FaultReport},
    hal::Hal,
    prelude::*,
    registers::{
        CMDQ_BASE, CMDQ_CONS, CMDQ_PROD, CR0, CR0ACK, CR1, CR1_CACHEABLE_WB_ISH, CR2,
        CR2_PTM_RECINVSID, Control, EVTQ_BASE, EVTQ_CONS, EVTQ_PROD, Features, GERROR, GERRORN,
        GlobalErrors, IRQ_CTRL, IRQ_CTRLACK, IrqControl, Mmio, STRTAB_BASE, STRTAB_BASE_CFG,
        SmmuRegisters,
    },
    stream::{StreamConfig, StreamId, StreamTable, StreamTableEntry},
};

/// An SMMU.
///
/// Every piece of driver state belongs to an instance: there is one per
/// translation unit, created by [`Smmu::probe`]. Bound domains keep the
/// instance alive; [`Smmu::shutdown`] detaches them. The unit is disabled
/// when the instance is dropped.
pub struct Smmu {
    hal: Arc<dyn Hal>,
    regs: SmmuRegisters,
    config: SmmuConfig,
    features: Features,
    cmdq: CommandQueue,
    evtq: EventQueue,
    strtab: StreamTable,
    asids: spin::Mutex<IdAlloc>,
    /// Serializes the writers of the stream table. Held across the
    /// invalidations of an entry.
    ste_lock: spin::Mutex<()>,
    /// Held only to look up or update the map, never while waiting for the
    /// hardware.
    bindings: spin::RwLock<BTreeMap<StreamId, Arc<IommuDomain>>>,
    observers: spin::RwLock<Vec<Arc<dyn FaultObserver>>>,
}

impl Smmu {
    /// Resets and enables the SMMU whose registers are behind `mmio`.
    ///
    /// The sizes in `config` are clamped to what the hardware supports.
    pub fn probe(hal: Arc<dyn Hal>, mmio: Arc<dyn Mmio>, config: SmmuConfig) -> Result<Arc<Self>> {
        let regs = SmmuRegisters::new(mmio);
        let features = Features::probe(&regs)?;
        let config = SmmuConfig {
            cmdq_shift: config.cmdq_shift.min(features.cmdq_shift),
            evtq_shift: config.evtq_shift.min(features.evtq_shift),
            sid_bits: config.sid_bits.min(features.sid_bits),
            ..config
        };
        if config.cmdq_shift < 2 {
            error!(
                "[SMMU]: a command queue of {} entries is too small",
                1 << config.cmdq_shift
            );
            return Err(Error::Unsupported);
        }

        write_cr0(&regs, &*hal, Control::empty(), &config)?;
        regs.write32(CR1, CR1_CACHEABLE_WB_ISH);
        regs.write32(CR2, CR2_PTM_RECINVSID);

        let default = if config.bypass_unbound {
            StreamConfig::Bypass
        } else {
            StreamConfig::Abort
        };
        let strtab = StreamTable::new(&hal, config.sid_bits, default)?;
        let cmdq = CommandQueue::new(&hal, regs.clone(), config.cmdq_shift, config.poll_timeout)?;
        let evtq = EventQueue::new(&hal, config.evtq_shift)?;

        let mut asids = IdAlloc::with_capacity(1 << features.asid_bits);
        // ASID 0 is never handed out.
        let _ = asids.alloc();

        let smmu = Arc::new(Self {
            hal,
            regs,
            config,
            features,
            cmdq,
            evtq,
            strtab,
            asids: spin::Mutex::new(asids),
            ste_lock: spin::Mutex::new(()),
            bindings: spin::RwLock::new(BTreeMap::new()),
            observers: spin::RwLock::new(Vec::new()),
        });
        // On failure, dropping the instance disables the unit again.
        smmu.enable()?;

        info!(
            "[SMMU]: enabled with {} streams, {} command slots, {} event slots, {}-bit ASIDs",
            smmu.strtab.nr_streams(),
            smmu.cmdq.nr_entries(),
            1 << smmu.config.evtq_shift,
            smmu.features.asid_bits
        );
        Ok(smmu)
    }

    fn enable(&self) -> Result<()> {
        let regs = &self.regs;

        regs.write64(STRTAB_BASE, self.strtab.base_register_value());
        regs.write32(STRTAB_BASE_CFG, self.strtab.cfg_register_value());

        regs.write64(CMDQ_BASE, self.cmdq.base_register_value());
        regs.write32(CMDQ_PROD, 0);
        regs.write32(CMDQ_CONS, 0);
        let mut enables = Control::CMDQEN;
        self.write_cr0(enables)?;

        // Nothing configured before the reset may stay cached.
        self.issue_cmds(&[Command::CfgiAll, Command::TlbiNsnhAll], true)?;

        regs.write64(EVTQ_BASE, self.evtq.base_register_value());
        regs.write32(EVTQ_PROD, 0);
        regs.write32(EVTQ_CONS, 0);
        enables |= Control::EVTQEN;
        self.write_cr0(enables)?;

        let irqs = IrqControl::GERROR_IRQEN | IrqControl::EVTQ_IRQEN;
        regs.write32(IRQ_CTRL, irqs.bits());
        let mut poll = QueuePoll::new(&*self.hal, self.config.poll_timeout);
        while regs.read32(IRQ_CTRLACK) != irqs.bits() {
            if poll.poll().is_err() {
                error!("[SMMU]: interrupt enables were not acknowledged");
                return Err(Error::Timeout);
            }
        }

        enables |= Control::SMMUEN;
        self.write_cr0(enables)
    }

    /// Creates a domain.
    pub fn create_domain(self: &Arc<Self>, options: &DomainOptions) -> Result<Arc<IommuDomain>> {
        if self.is_disabled() {
            return Err(Error::DeviceDisabled);
        }
        let asid = self.alloc_asid()?;
        IommuDomain::new(self.clone(), asid, options).inspect_err(|_| self.free_asid(asid))
    }

    /// Binds the stream `sid` to `domain`.
    ///
    /// A stream bound to another domain is moved. A domain that is not
    /// shared accepts a single stream.
    ///
    /// If the stream table entry cannot be written, the stream is left
    /// unbound and its transactions are terminated.
    pub fn attach(&self, sid: StreamId, domain: &Arc<IommuDomain>) -> Result<()> {
        if !core::ptr::eq(Arc::as_ptr(domain.smmu()), self) {
            error!("[SMMU]: attaching stream {:#x} to a foreign domain", sid);
            return Err(Error::InvalidArgs);
        }
        self.check_sid(sid)?;

        let guard = self.ste_lock.lock();
        if self
            .bindings
            .read()
            .get(&sid)
            .is_some_and(|bound| Arc::ptr_eq(bound, domain))
        {
            return Ok(());
        }

        domain.bind(sid)?;
        let ste = StreamTableEntry::new(StreamConfig::Translate {
            cd: domain.cd_paddr(),
            cd_cacheable: self.features.coherent,
            privilege: domain.privilege(),
        });
        let result = self.write_ste(sid, &ste);
        let old = {
            let mut bindings = self.bindings.write();
            match result {
                Ok(()) => bindings.insert(sid, domain.clone()),
                Err(_) => bindings.remove(&sid),
            }
        };
        if let Some(old) = &old {
            old.unbind(sid);
        }
        if let Err(err) = result {
            domain.unbind(sid);
            drop(guard);
            error!(
                "[SMMU]: failed to bind stream {:#x} to ASID {}, the stream is unbound: {:?}",
                sid,
                domain.asid(),
                err
            );
            return Err(err);
        }
        drop(guard);

        debug!("[SMMU]: stream {:#x} bound to ASID {}", sid, domain.asid());
        Ok(())
    }

    /// Unbinds the stream `sid`, giving it the default configuration.
    pub fn detach(&self, sid: StreamId) -> Result<()> {
        let default = if self.config.bypass_unbound {
            StreamConfig::Bypass
        } else {
            StreamConfig::Abort
        };
        self.configure(sid, default)
    }

    /// Lets the transactions of `sid` through untranslated.
    pub fn set_bypass(&self, sid: StreamId) -> Result<()> {
        self.configure(sid, StreamConfig::Bypass)
    }

    /// Terminates the transactions of `sid`.
    pub fn set_abort(&self, sid: StreamId) -> Result<()> {
        self.configure(sid, StreamConfig::Abort)
    }

    fn configure(&self, sid: StreamId, config: StreamConfig) -> Result<()> {
        self.check_sid(sid)?;
        let guard = self.ste_lock.lock();
        // A failed write leaves the entry invalid, which binds nothing either.
        let result = self.write_ste(sid, &StreamTableEntry::new(config));
        let old = self.bindings.write().remove(&sid);
        if let Some(old) = &old {
            old.unbind(sid);
        }
        drop(guard);

        // The domain may be destroyed here, outside the lock.
        if let Some(old) = old {
            debug!("[SMMU]: stream {:#x} unbound from ASID {}", sid, old.asid());
        }
        result
    }

    /// Returns the domain `sid` is bound to.
    pub fn domain_of(&self, sid: StreamId) -> Option<Arc<IommuDomain>> {
        self.bindings.read().get(&sid).cloned()
    }

    /// Registers an observer of translation faults.
    pub fn register_fault_observer(&self, observer: Arc<dyn FaultObserver>) {
        self.observers.write().push(observer);
    }

    /// Handles the event queue interrupt, and returns the number of events
    /// handled.
    pub fn handle_event_irq(&self) -> usize {
        self.evtq.drain(&self.regs, |record| match record.id() {
            Some(id) if id.is_translation_fault() => self.report_fault(id, record),
            Some(id) => warn!("[SMMU]: event {:?}: {:?}", id, record),
            None => error!("[SMMU]: unknown event: {:?}", record),
        })
    }

    /// Handles the global error interrupt, and returns whether an error was
    /// active.
    pub fn handle_gerror_irq(&self) -> bool {
        let gerror = self.regs.read32(GERROR);
        let active = self.regs.gerror() ^ self.regs.gerrorn();
        if active.is_empty() {
            return false;
        }

        if active.contains(GlobalErrors::SFM_ERR) {
            error!("[SMMU]: service failure, disabling the unit");
            self.cmdq.disable();
            self.regs.write32(CR0, 0);
        }
        if active.contains(GlobalErrors::CMDQ_ERR) {
            self.cmdq.skip_error();
        }
        let others = active - (GlobalErrors::SFM_ERR | GlobalErrors::CMDQ_ERR);
        if !others.is_empty() {
            warn!("[SMMU]: global errors: {:?}", others);
        }

        self.regs.write32(GERRORN, gerror);
        true
    }

    /// Returns whether the unit has failed and rejects every command.
    pub fn is_disabled(&self) -> bool {
        self.cmdq.is_disabled()
    }

    /// Detaches every stream and disables the unit.
    pub fn shutdown(&self) {
        let bound: Vec<StreamId> = self.bindings.read().keys().copied().collect();
        for sid in bound {
            // The stream is unbound even if this fails.
            if let Err(err) = self.detach(sid) {
                warn!("[SMMU]: failed to detach stream {:#x}: {:?}", sid, err);
            }
        }
        if let Err(err) = self.write_cr0(Control::empty()) {
            warn!("[SMMU]: failed to disable the unit: {:?}", err);
        }
        self.cmdq.disable();
    }

    pub fn hal(&self) -> &Arc<dyn Hal> {
        &self.hal
    }

    /// Issues `cmds`, in chunks that fit the queue. Only the last chunk is
    /// followed by `CMD_SYNC`.
    pub(crate) fn issue_cmds(&self, cmds: &[Command], sync: bool) -> Result<()> {
        if cmds.is_empty() {
            return self.submit(&[], sync);
        }
        let mut chunks = cmds.chunks(self.cmdq.max_batch()).peekable();
        while let Some(chunk) = chunks.next() {
            let is_last = chunks.peek().is_none();
            self.submit(chunk, sync && is_last)?;
        }
        Ok(())
    }

    pub(crate) fn free_asid(&self, asid: Asid) {
        self.asids.lock().free(asid as usize);
    }

    fn submit(&self, cmds: &[Command], sync: bool) -> Result<()> {
        self.cmdq.submit(cmds, sync).map_err(|err| {
            if err == CmdqError::Timeout {
                let snapshot = self.cmdq.snapshot();
                error!(
                    "[SMMU]: CMD_SYNC timed out: prod {:#x}, cons {:#x}, owner prod {:#x}, \
                     CMDQ_PROD {:#x}, CMDQ_CONS {:#x}, last event: {:?}",
                    snapshot.prod,
                    snapshot.cons,
                    snapshot.owner_prod,
                    snapshot.hw_prod,
                    snapshot.hw_cons,
                    self.evtq.last_record()
                );
            }
            err.into()
        })
    }

    fn alloc_asid(&self) -> Result<Asid> {
        let Some(asid) = self.asids.lock().alloc() else {
            warn!("[SMMU]: out of ASIDs");
            return Err(Error::NotEnoughResources);
        };
        Ok(asid as Asid)
    }

    fn check_sid(&self, sid: StreamId) -> Result<()> {
        if !self.strtab.contains(sid) {
            error!(
                "[SMMU]: unknown stream {:#x}, the table covers {} streams",
                sid,
                self.strtab.nr_streams()
            );
            return Err(Error::UnknownDevice);
        }
        Ok(())
    }

    fn write_ste(&self, sid: StreamId, ste: &StreamTableEntry) -> Result<()> {
        self.strtab.write(sid, ste, |sid| {
            self.issue_cmds(&[Command::CfgiSte { sid, leaf: true }], true)
        })
    }

    fn write_cr0(&self, value: Control) -> Result<()> {
        write_cr0(&self.regs, &*self.hal, value, &self.config)
    }

    fn report_fault(&self, event: EventId, record: &EventRecord) {
        let stream_id = record.stream_id();
        let iova = record.input_addr();
        // An interrupt must not wait for a stream table update to finish.
        let domain = match self.bindings.try_read() {
            Some(bindings) => bindings.get(&stream_id).cloned(),
            None => {
                warn!(
                    "[SMMU]: bindings are being updated, reporting a fault of stream {:#x} unbound",
                    stream_id
                );
                None
            }
        };
        let report = FaultReport {
            event,
            stream_id,
            iova,
            access: record.access(),
            privileged: record.is_privileged(),
            instruction: record.is_instruction(),
            asid: domain.as_ref().map(|domain| domain.asid()),
            ptes: domain.as_ref().map(|domain| domain.dump(iova)),
        };
        error!("[SMMU]: translation fault: {:#x?}", report);

        for observer in self.observers.read().iter() {
            observer.on_fault(&report);
        }
    }
}

impl Drop for Smmu {
    fn drop(&mut self) {
        if let Err(err) = self.write_cr0(Control::empty()) {
            warn!("[SMMU]: failed to disable the unit: {:?}", err);
        }
    }
}

impl core::fmt::Debug for Smmu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Smmu")
            .field("config", &self.config)
            .field("features", &self.features)
            .field("disabled", &self.is_disabled())
            .finish()
    }
}

/// Writes `CR0` and waits for the hardware to acknowledge it.
fn write_cr0(regs: &SmmuRegisters, hal: &dyn Hal, value: Control, config: &SmmuConfig) -> Result<()> {
    regs.write32(CR0, value.bits());
    let mut poll = QueuePoll::new(hal, config.poll_timeout);
    while regs.read32(CR0ACK) != value.bits() {
        if poll.poll().is_err() {
            error!(
                "[SMMU]: CR0 {:?} was not acknowledged, CR0ACK is {:#x}",
                value,
                regs.read32(CR0ACK)
            );
            return Err(Error::Timeout);
        }
    }
    Ok(())
}
