// SPDX-License-Identifier: MPL-2.0

//! The stage-1 page table of a domain.
//!
//! The table uses the 4KiB-granule format with three levels, translating a
//! 39-bit input address. Every table covering the window of the domain is
//! allocated when the page table is created, so that mapping and unmapping
//! never allocate. The tables live in three flat arrays of pages, one per
//! level, and a table is addressed by its index in its array.
//!
//! The leaf tables are touched by every map and unmap, so they stay mapped
//! to the CPU. The root and the level-2 tables are only mapped into
//! temporary CPU windows when they are written.

mod entry;

use core::sync::atomic::{AtomicU8, AtomicU64, Ordering, fence};

use smallvec::SmallVec;

pub use self::entry::IommuProt;
pub(crate) use self::entry::MAIR;
use self::entry::Pte;
use crate::{
    hal::Hal,
    mm::{BLOCK_SIZE, CoherentPages, PhysPages},
    prelude::*,
    tlb::{IotlbGather, WalkFlush},
};

/// The number of entries of a table.
const NR_ENTRIES: usize = 512;

/// The number of input address bits the table translates.
pub(crate) const IAS_BITS: u32 = 39;

const L1_SHIFT: usize = 30;
const L2_SHIFT: usize = 21;

/// The level-2 entry of a 2MiB region points to its leaf table.
const REGION_LINKED: u8 = 0;
/// The level-2 entry of a 2MiB region is invalid.
const REGION_UNLINKED: u8 = 1;
/// The level-2 entry of a 2MiB region is being rewritten.
const REGION_BUSY: u8 = 2;
/// The level-2 entry of a 2MiB region is a block descriptor.
const REGION_BLOCK: u8 = 3;

/// The errors of page table operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageTableError {
    /// The address is not covered by the window of the table.
    OutOfRange(Daddr),
    /// The address or size is not aligned to the page size.
    Unaligned(usize),
    /// The address is already mapped.
    AlreadyMapped(Daddr),
    /// Only a part of the block mapping at the address would be unmapped.
    WouldSplitBlock(Daddr),
    /// A table descriptor points outside the table arena.
    Corrupted(Paddr),
}

/// The descriptors relevant to a faulting address.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PteSnapshot {
    pub iova: Daddr,
    /// The descriptors read along the walk, starting from the root.
    pub walk: SmallVec<[u64; 3]>,
    /// The leaf descriptors around `iova`, in address order.
    pub neighbors: SmallVec<[(Daddr, u64); 5]>,
}

const fn pte_index(iova: Daddr, level: u8) -> usize {
    (iova >> (12 + 9 * (3 - level as usize))) & (NR_ENTRIES - 1)
}

/// The result of a table walk.
#[derive(Default)]
struct Walk {
    ptes: SmallVec<[Pte; 3]>,
    leaf_table: Option<usize>,
}

pub(crate) struct IoPageTable {
    window: Range<Daddr>,
    root: PhysPages,
    /// Level-2 tables, one for each 1GiB region touching the window.
    l2_tables: PhysPages,
    /// Leaf tables, one for each 2MiB region touching the window.
    leaf_tables: CoherentPages,
    /// The level-1 index of the first level-2 table.
    first_l1: usize,
    /// The index of the 2MiB region of the first leaf table.
    first_region: usize,
    regions: Box<[AtomicU8]>,
    block_mappings: bool,
    hal: Arc<dyn Hal>,
}

impl IoPageTable {
    /// Creates a page table translating `window`.
    ///
    /// Fails with [`Error::NoMemory`] if the tables take more than
    /// `max_table_pages` pages.
    pub(crate) fn new(
        hal: &Arc<dyn Hal>,
        window: Range<Daddr>,
        max_table_pages: usize,
        block_mappings: bool,
    ) -> Result<Self> {
        if window.is_empty() || window.start % PAGE_SIZE != 0 || window.end % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgs);
        }
        if window.end > 1 << IAS_BITS {
            return Err(PageTableError::OutOfRange(window.end).into());
        }

        let first_l1 = window.start >> L1_SHIFT;
        let nr_l2_tables = ((window.end - 1) >> L1_SHIFT) - first_l1 + 1;
        let first_region = window.start >> L2_SHIFT;
        let nr_leaf_tables = ((window.end - 1) >> L2_SHIFT) - first_region + 1;
        let nr_pages = 1 + nr_l2_tables + nr_leaf_tables;
        if nr_pages > max_table_pages {
            error!(
                "[SMMU]: page table for {:#x?} needs {} pages, budget is {}",
                window, nr_pages, max_table_pages
            );
            return Err(Error::NoMemory);
        }

        let root = PhysPages::alloc(hal, 1)?;
        let l2_tables = PhysPages::alloc(hal, nr_l2_tables)?;
        let leaf_tables = CoherentPages::alloc(hal, nr_leaf_tables)?;

        {
            let root_window = root.map()?;
            for i in 0..nr_l2_tables {
                let pte = Pte::new_table(l2_tables.paddr() + i * PAGE_SIZE);
                root_window.words()[first_l1 + i].store(pte.raw(), Ordering::Relaxed);
            }
        }
        {
            let l2_window = l2_tables.map()?;
            for i in 0..nr_leaf_tables {
                let region = first_region + i;
                let table = (region >> (L1_SHIFT - L2_SHIFT)) - first_l1;
                let pte = Pte::new_table(leaf_tables.paddr() + i * PAGE_SIZE);
                l2_window.words()[table * NR_ENTRIES + region % NR_ENTRIES]
                    .store(pte.raw(), Ordering::Relaxed);
            }
        }
        fence(Ordering::Release);

        debug!(
            "[SMMU]: page table for {:#x?} preallocated with {} pages",
            window, nr_pages
        );

        Ok(Self {
            window,
            root,
            l2_tables,
            leaf_tables,
            first_l1,
            first_region,
            regions: (0..nr_leaf_tables)
                .map(|_| AtomicU8::new(REGION_LINKED))
                .collect(),
            block_mappings,
            hal: hal.clone(),
        })
    }

    pub(crate) fn root_paddr(&self) -> Paddr {
        self.root.paddr()
    }

    pub(crate) fn window(&self) -> &Range<Daddr> {
        &self.window
    }

    pub(crate) fn nr_table_pages(&self) -> usize {
        1 + self.l2_tables.nr_pages() + self.leaf_tables.nr_pages()
    }

    /// Maps `iova..iova + size` to `paddr..paddr + size`.
    ///
    /// Uses a block descriptor for every 2MiB-aligned block of both ranges,
    /// unless block mappings are disabled. Replacing a leaf table with a
    /// block goes through `flush` to drop the cached walks.
    ///
    /// On failure, including cancellation, the entries written so far are
    /// cleared again and their ranges are added to `gather`.
    pub(crate) fn map(
        &self,
        iova: Daddr,
        paddr: Paddr,
        size: usize,
        prot: IommuProt,
        flush: &dyn WalkFlush,
        gather: &mut IotlbGather,
    ) -> Result<()> {
        self.check_range(iova, size)?;
        if paddr % PAGE_SIZE != 0 {
            return Err(PageTableError::Unaligned(paddr).into());
        }
        if !prot.intersects(IommuProt::READ | IommuProt::WRITE) {
            return Err(Error::InvalidArgs);
        }

        let mut mapped = 0;
        let result = self.map_from(iova, paddr, size, prot, flush, &mut mapped);
        if result.is_err() && mapped > 0 {
            if let Err(err) = self.unmap(iova, mapped, gather) {
                error!(
                    "[SMMU]: failed to roll back mapping at {:#x}: {:?}",
                    iova, err
                );
            }
        }
        result
    }

    fn map_from(
        &self,
        iova: Daddr,
        paddr: Paddr,
        size: usize,
        prot: IommuProt,
        flush: &dyn WalkFlush,
        mapped: &mut usize,
    ) -> Result<()> {
        while *mapped < size {
            if self.hal.signal_pending() {
                return Err(Error::Interrupted);
            }

            let va = iova + *mapped;
            let pa = paddr + *mapped;
            if self.block_mappings
                && va % BLOCK_SIZE == 0
                && pa % BLOCK_SIZE == 0
                && size - *mapped >= BLOCK_SIZE
            {
                self.map_block(va, pa, prot, flush)?;
                *mapped += BLOCK_SIZE;
            } else {
                self.map_page(va, pa, prot)?;
                *mapped += PAGE_SIZE;
            }
        }
        Ok(())
    }

    fn map_page(&self, va: Daddr, pa: Paddr, prot: IommuProt) -> Result<()> {
        self.ensure_linked(va)?;
        self.leaf_slot(va)
            .compare_exchange(
                0,
                Pte::new_page(pa, prot).raw(),
                Ordering::Release,
                Ordering::Relaxed,
            )
            .map_err(|_| PageTableError::AlreadyMapped(va))?;
        Ok(())
    }

    /// Makes sure that the region of `va` is backed by its leaf table.
    fn ensure_linked(&self, va: Daddr) -> Result<()> {
        let region = self.region_index(va);
        let state = &self.regions[region];
        loop {
            match state.compare_exchange(
                REGION_UNLINKED,
                REGION_BUSY,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // An invalid entry is never cached, so the table can be
                    // linked without an invalidation.
                    let result = self.write_l2(va, Pte::new_table(self.leaf_table_paddr(region)));
                    let new_state = if result.is_ok() {
                        REGION_LINKED
                    } else {
                        REGION_UNLINKED
                    };
                    state.store(new_state, Ordering::Release);
                    return result;
                }
                Err(REGION_LINKED) => return Ok(()),
                Err(REGION_BLOCK) => return Err(PageTableError::AlreadyMapped(va).into()),
                Err(_) => core::hint::spin_loop(),
            }
        }
    }

    fn map_block(&self, va: Daddr, pa: Paddr, prot: IommuProt, flush: &dyn WalkFlush) -> Result<()> {
        let state = &self.regions[self.region_index(va)];
        loop {
            let old = state.load(Ordering::Acquire);
            match old {
                REGION_BLOCK => return Err(PageTableError::AlreadyMapped(va).into()),
                REGION_BUSY => {
                    core::hint::spin_loop();
                    continue;
                }
                _ => {}
            }
            if state
                .compare_exchange(old, REGION_BUSY, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }

            let (new_state, result) = self.install_block(va, pa, prot, old == REGION_LINKED, flush);
            state.store(new_state, Ordering::Release);
            return result;
        }
    }

    /// Writes a block descriptor, and returns the resulting region state.
    fn install_block(
        &self,
        va: Daddr,
        pa: Paddr,
        prot: IommuProt,
        linked: bool,
        flush: &dyn WalkFlush,
    ) -> (u8, Result<()>) {
        let region = self.region_index(va);
        if linked {
            // The whole region belongs to this mapping, so its leaf table
            // must be empty.
            if let Some(i) = self
                .leaf_table(region)
                .iter()
                .position(|slot| slot.load(Ordering::Acquire) != 0)
            {
                let err = PageTableError::AlreadyMapped(va + i * PAGE_SIZE);
                return (REGION_LINKED, Err(err.into()));
            }

            // Break before make: the walk caches may hold the table entry.
            if let Err(err) = self.write_l2(va, Pte::default()) {
                return (REGION_LINKED, Err(err));
            }
            if let Err(err) = flush.flush_walk(va..va + BLOCK_SIZE) {
                let relinked = self.write_l2(va, Pte::new_table(self.leaf_table_paddr(region)));
                let state = if relinked.is_ok() {
                    REGION_LINKED
                } else {
                    REGION_UNLINKED
                };
                return (state, Err(err));
            }
        }

        match self.write_l2(va, Pte::new_block(pa, prot)) {
            Ok(()) => (REGION_BLOCK, Ok(())),
            Err(err) => (REGION_UNLINKED, Err(err)),
        }
    }

    /// Unmaps `iova..iova + size` and returns the number of bytes that were
    /// mapped.
    ///
    /// Block mappings must be unmapped as a whole. A removed block leaves its
    /// region unlinked until the next page mapping in it, so that the caller
    /// can invalidate the block before the leaf table becomes reachable.
    pub(crate) fn unmap(&self, iova: Daddr, size: usize, gather: &mut IotlbGather) -> Result<usize> {
        self.check_range(iova, size)?;
        let end = iova + size;

        let mut va = iova;
        while va < end {
            let next = (va & !(BLOCK_SIZE - 1)) + BLOCK_SIZE;
            if self.regions[self.region_index(va)].load(Ordering::Acquire) == REGION_BLOCK
                && (va % BLOCK_SIZE != 0 || end < next)
            {
                error!(
                    "[SMMU]: unmapping {:#x}..{:#x} would split the block at {:#x}",
                    iova,
                    end,
                    va & !(BLOCK_SIZE - 1)
                );
                return Err(PageTableError::WouldSplitBlock(va).into());
            }
            va = next;
        }

        let mut unmapped = 0;
        let mut va = iova;
        while va < end {
            let region = self.region_index(va);
            let next = ((va & !(BLOCK_SIZE - 1)) + BLOCK_SIZE).min(end);

            let state = &self.regions[region];
            if state
                .compare_exchange(REGION_BLOCK, REGION_BUSY, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                if let Err(err) = self.write_l2(va, Pte::default()) {
                    state.store(REGION_BLOCK, Ordering::Release);
                    return Err(err);
                }
                state.store(REGION_UNLINKED, Ordering::Release);
                gather.add_range(va..next);
                unmapped += next - va;
                va = next;
                continue;
            }

            let first = pte_index(va, 3);
            let slots = &self.leaf_table(region)[first..first + (next - va) / PAGE_SIZE];
            for (i, slot) in slots.iter().enumerate() {
                if Pte::from_raw(slot.swap(0, Ordering::Release)).is_present() {
                    let page = va + i * PAGE_SIZE;
                    gather.add_range(page..page + PAGE_SIZE);
                    unmapped += PAGE_SIZE;
                }
            }
            va = next;
        }

        Ok(unmapped)
    }

    /// Translates `iova` by walking the table as the hardware does.
    pub(crate) fn translate(&self, iova: Daddr) -> Option<(Paddr, IommuProt)> {
        let walk = self.walk(iova);
        let pte = walk.ptes.last()?;
        if !pte.is_present() {
            return None;
        }
        match walk.ptes.len() {
            3 => Some((pte.paddr() + iova % PAGE_SIZE, pte.prot())),
            2 => Some((pte.paddr() + iova % BLOCK_SIZE, pte.prot())),
            _ => None,
        }
    }

    /// Captures the descriptors relevant to a fault at `iova`.
    pub(crate) fn dump(&self, iova: Daddr) -> PteSnapshot {
        let walk = self.walk(iova);
        let mut snapshot = PteSnapshot {
            iova,
            walk: walk.ptes.iter().map(Pte::raw).collect(),
            neighbors: SmallVec::new(),
        };

        if let Some(table) = walk.leaf_table {
            let index = pte_index(iova, 3);
            let leaf_table = self.leaf_table(table);
            let page = iova & !(PAGE_SIZE - 1);
            for i in index.saturating_sub(2)..(index + 3).min(NR_ENTRIES) {
                let addr = page - index * PAGE_SIZE + i * PAGE_SIZE;
                snapshot
                    .neighbors
                    .push((addr, leaf_table[i].load(Ordering::Acquire)));
            }
        }
        snapshot
    }

    fn walk(&self, iova: Daddr) -> Walk {
        let mut walk = Walk::default();
        if !self.window.contains(&iova) {
            return walk;
        }

        let Ok(root_window) = self.root.map() else {
            return walk;
        };
        let l1 = Pte::from_raw(root_window.words()[pte_index(iova, 1)].load(Ordering::Acquire));
        drop(root_window);
        walk.ptes.push(l1);
        if !l1.is_table(1) {
            return walk;
        }

        let Some(table) = self.table_index(self.l2_tables.paddr(), self.l2_tables.nr_pages(), l1)
        else {
            return walk;
        };
        let Ok(l2_window) = self.l2_tables.map_page(table) else {
            return walk;
        };
        let l2 = Pte::from_raw(l2_window.words()[pte_index(iova, 2)].load(Ordering::Acquire));
        drop(l2_window);
        walk.ptes.push(l2);
        if !l2.is_table(2) {
            return walk;
        }

        let Some(table) =
            self.table_index(self.leaf_tables.paddr(), self.leaf_tables.nr_pages(), l2)
        else {
            return walk;
        };
        walk.ptes
            .push(Pte::from_raw(self.leaf_table(table)[pte_index(iova, 3)].load(Ordering::Acquire)));
        walk.leaf_table = Some(table);
        walk
    }

    /// Returns the arena index of the table a descriptor points to.
    fn table_index(&self, base: Paddr, nr_pages: usize, pte: Pte) -> Option<usize> {
        let paddr = pte.paddr();
        if paddr < base || paddr >= base + nr_pages * PAGE_SIZE {
            error!(
                "[SMMU]: {:?} points outside the table arena: {:?}",
                pte,
                PageTableError::Corrupted(paddr)
            );
            return None;
        }
        Some((paddr - base) / PAGE_SIZE)
    }

    fn check_range(&self, iova: Daddr, size: usize) -> core::result::Result<(), PageTableError> {
        if iova % PAGE_SIZE != 0 {
            return Err(PageTableError::Unaligned(iova));
        }
        if size == 0 || size % PAGE_SIZE != 0 {
            return Err(PageTableError::Unaligned(size));
        }
        let end = iova.checked_add(size).ok_or(PageTableError::OutOfRange(iova))?;
        if iova < self.window.start || end > self.window.end {
            return Err(PageTableError::OutOfRange(iova));
        }
        Ok(())
    }

    fn write_l2(&self, va: Daddr, pte: Pte) -> Result<()> {
        let table = (va >> L1_SHIFT) - self.first_l1;
        let l2_window = self.l2_tables.map_page(table)?;
        l2_window.words()[pte_index(va, 2)].store(pte.raw(), Ordering::Release);
        Ok(())
    }

    fn region_index(&self, va: Daddr) -> usize {
        (va >> L2_SHIFT) - self.first_region
    }

    fn leaf_table(&self, region: usize) -> &[AtomicU64] {
        &self.leaf_tables.words()[region * NR_ENTRIES..(region + 1) * NR_ENTRIES]
    }

    fn leaf_table_paddr(&self, region: usize) -> Paddr {
        self.leaf_tables.paddr() + region * PAGE_SIZE
    }

    fn leaf_slot(&self, va: Daddr) -> &AtomicU64 {
        &self.leaf_table(self.region_index(va))[pte_index(va, 3)]
    }
}
