// SPDX-License-Identifier: MPL-2.0

//! IOMMU domains, the device address spaces.

use core::sync::atomic::{AtomicBool, Ordering, fence};

use align_ext::AlignExt;
use smallvec::SmallVec;

use crate::{
    cmdq::Command,
    config::{DomainOptions, FreePolicy},
    device::Smmu,
    hal::{SecureAttestor, Work},
    iova::{IovaAllocator, Release},
    mapping_cache::{BufferId, MappingCache},
    mm::{BLOCK_SIZE, CoherentPages, PhysSegment},
    page_table::{IAS_BITS, IoPageTable, IommuProt, PteSnapshot},
    prelude::*,
    stream::{CD_WORDS, ContextDescriptor, Privilege, StreamId},
    tlb::{IotlbFlush, IotlbGather, WalkFlush},
};

/// An address space identifier, which tags the translations of a domain in
/// the IOTLB.
pub type Asid = u16;

/// A snapshot of the address space accounting of a domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DomainStats {
    /// Bytes that can be reserved right now.
    pub free_size: usize,
    /// Bytes unmapped under the deferred policy and not yet reclaimed.
    pub pending_size: usize,
    pub nr_live_ranges: usize,
    pub nr_shared_buffers: usize,
    pub nr_table_pages: usize,
}

/// A device address space.
///
/// A domain is created by [`Smmu::create_domain`] and bound to devices with
/// [`Smmu::attach`]. It is destroyed when the last device is detached and the
/// last handle is dropped: its translations are invalidated and its ASID and
/// tables are given back.
pub struct IommuDomain {
    smmu: Arc<Smmu>,
    asid: Asid,
    shared: bool,
    free_policy: FreePolicy,
    privilege: Privilege,
    attestor: Option<Arc<dyn SecureAttestor>>,
    page_table: IoPageTable,
    iova: IovaAllocator,
    cache: MappingCache,
    cd: CoherentPages,
    devices: spin::Mutex<BTreeSet<StreamId>>,
    /// The protected part of each mapping of a protected domain, keyed by
    /// the start of the mapping.
    protected: spin::Mutex<BTreeMap<Daddr, Range<Daddr>>>,
    reclaim_work: Arc<ReclaimWork>,
}

impl IommuDomain {
    pub(crate) fn new(smmu: Arc<Smmu>, asid: Asid, options: &DomainOptions) -> Result<Arc<Self>> {
        let hal = smmu.hal().clone();
        let page_table = IoPageTable::new(
            &hal,
            options.window.clone(),
            options.max_table_pages,
            options.block_mappings,
        )?;

        // The descriptor is written once. It is referenced by no stream yet,
        // so no invalidation is needed.
        let cd = CoherentPages::alloc(&hal, 1)?;
        let desc = ContextDescriptor::new(page_table.root_paddr(), asid, IAS_BITS);
        let slots = &cd.words()[..CD_WORDS];
        for (slot, word) in slots[1..].iter().zip(&desc.words()[1..]) {
            slot.store(*word, Ordering::Relaxed);
        }
        fence(Ordering::Release);
        slots[0].store(desc.words()[0], Ordering::Release);

        let iova = IovaAllocator::new(options.window.clone(), options.free_policy);

        debug!(
            "[SMMU]: created domain with ASID {} for {:#x?}",
            asid, options.window
        );

        Ok(Arc::new_cyclic(|weak| Self {
            smmu,
            asid,
            shared: options.shared,
            free_policy: options.free_policy,
            privilege: options.privilege,
            attestor: options.attestor.clone(),
            page_table,
            iova,
            cache: MappingCache::new(),
            cd,
            devices: spin::Mutex::new(BTreeSet::new()),
            protected: spin::Mutex::new(BTreeMap::new()),
            reclaim_work: Arc::new(ReclaimWork {
                domain: weak.clone(),
                queued: AtomicBool::new(false),
            }),
        }))
    }

    pub fn asid(&self) -> Asid {
        self.asid
    }

    /// Returns the window of device addresses the domain translates.
    pub fn window(&self) -> &Range<Daddr> {
        self.page_table.window()
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    pub fn is_protected(&self) -> bool {
        self.attestor.is_some()
    }

    /// Returns the streams bound to the domain.
    pub fn devices(&self) -> Vec<StreamId> {
        self.devices.lock().iter().copied().collect()
    }

    /// Maps `size` bytes of physically contiguous memory at `paddr`, and
    /// returns the device address of the mapping.
    ///
    /// If `iova_hint` is given, the mapping is placed exactly there.
    pub fn map(
        &self,
        iova_hint: Option<Daddr>,
        paddr: Paddr,
        size: usize,
        prot: IommuProt,
    ) -> Result<Daddr> {
        if size == 0 || paddr % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgs);
        }
        let size = size.align_up(PAGE_SIZE);

        let range = match iova_hint {
            Some(iova) => self.iova.reserve_at(iova, size)?,
            None => self.iova.reserve(size, self.alignment(paddr, size), self)?,
        };
        let segment = PhysSegment::new(paddr, size);
        let mut gather = IotlbGather::new();
        if let Err(err) = self.populate(range.start, &[segment], prot, 0, &mut gather) {
            self.discard(range, gather);
            return Err(err);
        }

        trace!(
            "[SMMU]: ASID {} mapped {:#x}..{:#x} -> {:#x}",
            self.asid, range.start, range.end, paddr
        );
        Ok(range.start)
    }

    /// Maps a scatter list to contiguous device addresses, and returns the
    /// device address of the mapping.
    ///
    /// In a protected domain, the pages after the first `header_skip` ones
    /// are mapped as protected and registered with the attestor before they
    /// become reachable. The header pages are mapped with `prot` as is.
    pub fn map_scatter(
        &self,
        segments: &[PhysSegment],
        prot: IommuProt,
        header_skip: usize,
    ) -> Result<Daddr> {
        let size = scatter_size(segments)?;
        let header_size = header_skip.checked_mul(PAGE_SIZE).ok_or(Error::InvalidArgs)?;
        if header_size > size {
            return Err(Error::InvalidArgs);
        }

        let range = self
            .iova
            .reserve(size, self.alignment(segments[0].paddr(), size), self)?;

        if let Some(attestor) = self.attestor.as_ref().filter(|_| header_size < size) {
            let body = range.start + header_size..range.end;
            let body_segments = skip_bytes(segments, header_size);
            if let Err(err) = attestor.protect(body.clone(), &body_segments) {
                error!(
                    "[SMMU]: failed to protect {:#x}..{:#x}: {:?}",
                    body.start, body.end, err
                );
                // Nothing is mapped yet.
                let _ = self.iova.release(range, Release::Immediate);
                return Err(Error::AttestationFailed);
            }
            self.protected.lock().insert(range.start, body);
        }

        let mut gather = IotlbGather::new();
        if let Err(err) = self.populate(range.start, segments, prot, header_size, &mut gather) {
            self.discard(range, gather);
            return Err(err);
        }

        trace!(
            "[SMMU]: ASID {} mapped {} segments at {:#x}..{:#x}",
            self.asid,
            segments.len(),
            range.start,
            range.end
        );
        Ok(range.start)
    }

    /// Unmaps a mapping created by [`Self::map`] or [`Self::map_scatter`].
    ///
    /// `iova` and `size` must describe the whole mapping.
    pub fn unmap(&self, iova: Daddr, size: usize) -> Result<()> {
        let end = iova
            .checked_add(size.align_up(PAGE_SIZE))
            .ok_or(Error::OutOfRange)?;
        let range = iova..end;
        if !self.iova.is_live(&range) {
            error!(
                "[SMMU]: ASID {} unmapping {:#x}..{:#x}, which is not mapped",
                self.asid, range.start, range.end
            );
            return Err(Error::DoubleFree);
        }
        if self.cache.contains_iova(iova) {
            error!(
                "[SMMU]: ASID {} unmapping {:#x}, which belongs to a shared buffer",
                self.asid, iova
            );
            return Err(Error::Busy);
        }
        self.teardown(range)
    }

    /// Maps a shared buffer, or takes another reference to its mapping.
    pub fn map_shared_buffer(
        &self,
        id: BufferId,
        segments: &[PhysSegment],
        prot: IommuProt,
    ) -> Result<Daddr> {
        self.cache.get_or_create(
            id,
            || {
                let size = scatter_size(segments)?;
                let iova = self.map_scatter(segments, prot, 0)?;
                Ok(iova..iova + size)
            },
            |range| self.teardown(range),
        )
    }

    /// Drops a reference to the mapping of a shared buffer. The last
    /// reference unmaps it.
    ///
    /// If unmapping fails, the buffer keeps its last reference and can be
    /// released again.
    pub fn unmap_shared_buffer(&self, id: BufferId) -> Result<()> {
        self.cache.release(id, |range| self.teardown(range))
    }

    /// Returns the number of references to the mapping of a shared buffer.
    pub fn shared_buffer_refcount(&self, id: BufferId) -> Option<usize> {
        self.cache.refcount(id)
    }

    /// Translates a device address with the page table of the domain.
    pub fn iova_to_phys(&self, iova: Daddr) -> Option<Paddr> {
        self.page_table.translate(iova).map(|(paddr, _)| paddr)
    }

    /// Invalidates every cached translation of the domain.
    pub fn flush_all(&self) -> Result<()> {
        self.smmu
            .issue_cmds(&[Command::TlbiNhAsid { asid: self.asid }], true)
    }

    /// Invalidates the cached translations of `iova..iova + size`.
    pub fn flush_range(&self, iova: Daddr, size: usize) -> Result<()> {
        let end = iova
            .checked_add(size.align_up(PAGE_SIZE))
            .ok_or(Error::OutOfRange)?;
        let window = self.window();
        if iova < window.start || end > window.end {
            return Err(Error::OutOfRange);
        }

        let mut gather = IotlbGather::new();
        gather.add_range(iova.align_down(PAGE_SIZE)..end);
        self.flush_gather(&gather)
    }

    /// Reclaims every range unmapped under the deferred policy, and returns
    /// the number of bytes reclaimed.
    pub fn reclaim_deferred(&self) -> Result<usize> {
        self.iova.drain(self)
    }

    pub fn stats(&self) -> DomainStats {
        DomainStats {
            free_size: self.iova.free_size(),
            pending_size: self.iova.pending_size(),
            nr_live_ranges: self.iova.live_ranges().len(),
            nr_shared_buffers: self.cache.len(),
            nr_table_pages: self.page_table.nr_table_pages(),
        }
    }

    pub(crate) fn smmu(&self) -> &Arc<Smmu> {
        &self.smmu
    }

    pub(crate) fn privilege(&self) -> Privilege {
        self.privilege
    }

    pub(crate) fn cd_paddr(&self) -> Paddr {
        self.cd.paddr()
    }

    /// Records that `sid` is bound to the domain.
    pub(crate) fn bind(&self, sid: StreamId) -> Result<()> {
        let mut devices = self.devices.lock();
        if !self.shared && devices.iter().any(|&bound| bound != sid) {
            warn!(
                "[SMMU]: ASID {} is not shared, rejecting stream {:#x}",
                self.asid, sid
            );
            return Err(Error::Busy);
        }
        devices.insert(sid);
        Ok(())
    }

    pub(crate) fn unbind(&self, sid: StreamId) {
        self.devices.lock().remove(&sid);
    }

    /// Captures the page table entries around a faulting address.
    pub(crate) fn dump(&self, iova: Daddr) -> PteSnapshot {
        self.page_table.dump(iova)
    }

    fn alignment(&self, paddr: Paddr, size: usize) -> usize {
        if paddr % BLOCK_SIZE == 0 && size >= BLOCK_SIZE {
            BLOCK_SIZE
        } else {
            PAGE_SIZE
        }
    }

    /// Writes the page table entries of a mapping at `iova`. The first
    /// `header_size` bytes are never mapped as protected.
    ///
    /// Entries rolled back on failure are added to `gather`.
    fn populate(
        &self,
        iova: Daddr,
        segments: &[PhysSegment],
        prot: IommuProt,
        header_size: usize,
        gather: &mut IotlbGather,
    ) -> Result<()> {
        let body_prot = if self.is_protected() {
            prot | IommuProt::PROTECTED
        } else {
            prot
        };

        let mut offset = 0;
        for segment in segments {
            let mut done = 0;
            while done < segment.len() {
                let (len, prot) = if offset < header_size {
                    ((header_size - offset).min(segment.len() - done), prot)
                } else {
                    (segment.len() - done, body_prot)
                };
                self.page_table.map(
                    iova + offset,
                    segment.paddr() + done,
                    len,
                    prot,
                    self,
                    gather,
                )?;
                done += len;
                offset += len;
            }
        }
        Ok(())
    }

    /// Gives back a reserved range whose population failed.
    fn discard(&self, range: Range<Daddr>, mut gather: IotlbGather) {
        if let Err(err) = self
            .page_table
            .unmap(range.start, range.len(), &mut gather)
        {
            error!(
                "[SMMU]: failed to clear {:#x}..{:#x}: {:?}",
                range.start, range.end, err
            );
        }
        if let Err(err) = self.flush_gather(&gather) {
            error!(
                "[SMMU]: leaking {:#x}..{:#x}, its translations may be cached: {:?}",
                range.start, range.end, err
            );
            return;
        }
        // Failures are logged by `unprotect`.
        let _ = self.unprotect(range.start);
        if let Err(err) = self.iova.release(range, Release::Immediate) {
            error!("[SMMU]: failed to give back a discarded range: {:?}", err);
        }
    }

    /// Clears the entries of a live range and releases it.
    fn teardown(&self, range: Range<Daddr>) -> Result<()> {
        let mut gather = IotlbGather::new();
        self.page_table
            .unmap(range.start, range.len(), &mut gather)?;
        if gather.is_empty() {
            // The entries were cleared by an earlier attempt that failed to
            // invalidate them.
            gather.add_range(range.clone());
        }

        let is_protected = self.protected.lock().contains_key(&range.start);
        if self.free_policy == FreePolicy::Immediate || is_protected {
            // Protected pages must be unreachable before they are released.
            self.flush_gather(&gather)?;
            let unprotected = self.unprotect(range.start);
            self.iova.release(range, Release::Immediate)?;
            return unprotected;
        }

        if self.iova.release(range, Release::Deferred)? {
            self.queue_reclaim();
        }
        Ok(())
    }

    /// Lifts the protection of the mapping at `iova`, if it has one.
    fn unprotect(&self, iova: Daddr) -> Result<()> {
        let Some(body) = self.protected.lock().remove(&iova) else {
            return Ok(());
        };
        let Some(attestor) = self.attestor.as_ref() else {
            return Ok(());
        };
        attestor.unprotect(body.clone()).map_err(|err| {
            error!(
                "[SMMU]: failed to unprotect {:#x}..{:#x}: {:?}",
                body.start, body.end, err
            );
            Error::AttestationFailed
        })
    }

    fn flush_gather(&self, gather: &IotlbGather) -> Result<()> {
        if gather.is_empty() {
            return Ok(());
        }
        self.smmu.issue_cmds(&gather.commands(self.asid), true)
    }

    fn queue_reclaim(&self) {
        if self.reclaim_work.queued.swap(true, Ordering::AcqRel) {
            return;
        }
        self.smmu.hal().queue_work(self.reclaim_work.clone());
    }
}

impl IotlbFlush for IommuDomain {
    fn flush_all(&self) -> Result<()> {
        IommuDomain::flush_all(self)
    }
}

impl WalkFlush for IommuDomain {
    fn flush_walk(&self, range: Range<Daddr>) -> Result<()> {
        // A non-leaf invalidation at any address of a 2MiB region drops the
        // cached level-2 descriptor of the region.
        let cmds: SmallVec<[Command; 4]> = range
            .step_by(BLOCK_SIZE)
            .map(|addr| Command::TlbiNhVa {
                asid: self.asid,
                addr,
                leaf: false,
            })
            .collect();
        self.smmu.issue_cmds(&cmds, true)
    }
}

impl Drop for IommuDomain {
    fn drop(&mut self) {
        if let Err(err) = self.flush_all() {
            warn!(
                "[SMMU]: failed to flush ASID {} on destruction: {:?}",
                self.asid, err
            );
        }
        let protected = core::mem::take(self.protected.get_mut());
        if let Some(attestor) = self.attestor.as_ref() {
            for body in protected.into_values() {
                if let Err(err) = attestor.unprotect(body) {
                    warn!("[SMMU]: failed to unprotect on destruction: {:?}", err);
                }
            }
        }
        self.smmu.free_asid(self.asid);
        debug!("[SMMU]: destroyed domain with ASID {}", self.asid);
    }
}

impl core::fmt::Debug for IommuDomain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IommuDomain")
            .field("asid", &self.asid)
            .field("window", self.window())
            .field("shared", &self.shared)
            .field("free_policy", &self.free_policy)
            .field("protected", &self.is_protected())
            .field("devices", &*self.devices.lock())
            .finish()
    }
}

/// Sweeps the deferred releases of a domain.
struct ReclaimWork {
    domain: Weak<IommuDomain>,
    queued: AtomicBool,
}

impl Work for ReclaimWork {
    fn run(&self) {
        let Some(domain) = self.domain.upgrade() else {
            return;
        };

        let result = loop {
            match domain.iova.reclaim(&*domain) {
                Ok(reclaimed) if reclaimed.requeue => continue,
                result => break result,
            }
        };

        self.queued.store(false, Ordering::Release);
        match result {
            // An epoch closed while the flag was still set.
            Ok(_) if domain.iova.has_sweep() => domain.queue_reclaim(),
            Ok(_) => {}
            // The next release that closes an epoch, or `reclaim_deferred`,
            // retries the sweep.
            Err(err) => warn!(
                "[SMMU]: ASID {} failed to reclaim deferred ranges: {:?}",
                domain.asid, err
            ),
        }
    }
}

/// Returns the total size of a scatter list of page-aligned segments.
fn scatter_size(segments: &[PhysSegment]) -> Result<usize> {
    if segments.is_empty() {
        return Err(Error::InvalidArgs);
    }
    let mut size: usize = 0;
    for segment in segments {
        if segment.is_empty() || !segment.is_page_aligned() {
            error!("[SMMU]: {:?} is not a page-aligned segment", segment);
            return Err(Error::InvalidArgs);
        }
        size = size.checked_add(segment.len()).ok_or(Error::InvalidArgs)?;
    }
    Ok(size)
}

/// Returns the segments covering a scatter list without its first `skip`
/// bytes.
fn skip_bytes(segments: &[PhysSegment], mut skip: usize) -> Vec<PhysSegment> {
    let mut remaining = Vec::with_capacity(segments.len());
    for segment in segments {
        if skip >= segment.len() {
            skip -= segment.len();
            continue;
        }
        remaining.push(PhysSegment::new(
            segment.paddr() + skip,
            segment.len() - skip,
        ));
        skip = 0;
    }
    remaining
}
