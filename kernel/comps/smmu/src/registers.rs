// SPDX-License-Identifier: MPL-2.0

//! The register interface of the SMMU.

use core::ptr::NonNull;

use bitflags::bitflags;
use volatile::VolatilePtr;

use crate::prelude::*;

pub(crate) const IDR0: usize = 0x00;
pub(crate) const IDR1: usize = 0x04;
pub(crate) const IDR5: usize = 0x14;
pub(crate) const CR0: usize = 0x20;
pub(crate) const CR0ACK: usize = 0x24;
pub(crate) const CR1: usize = 0x28;
pub(crate) const CR2: usize = 0x2c;
pub(crate) const IRQ_CTRL: usize = 0x50;
pub(crate) const IRQ_CTRLACK: usize = 0x54;
pub(crate) const GERROR: usize = 0x60;
pub(crate) const GERRORN: usize = 0x64;
pub(crate) const STRTAB_BASE: usize = 0x80;
pub(crate) const STRTAB_BASE_CFG: usize = 0x88;
pub(crate) const CMDQ_BASE: usize = 0x90;
pub(crate) const CMDQ_PROD: usize = 0x98;
pub(crate) const CMDQ_CONS: usize = 0x9c;
pub(crate) const EVTQ_BASE: usize = 0xa0;
pub(crate) const EVTQ_PROD: usize = 0x100a8;
pub(crate) const EVTQ_CONS: usize = 0x100ac;

/// The size of the register frame covering every register above.
pub(crate) const MMIO_SIZE: usize = 0x20000;

/// Read-allocate hint of the queue and stream table base registers.
pub(crate) const BASE_RA: u64 = 1 << 62;

/// The overflow flag of the event queue producer index, and its
/// acknowledgement in the consumer index.
pub(crate) const QUEUE_OVERFLOW: u32 = 1 << 31;

/// Table and queue memory is inner and outer write-back cacheable and
/// inner shareable.
pub(crate) const CR1_CACHEABLE_WB_ISH: u32 = (3 << 10) | (1 << 8) | (1 << 6) | (3 << 4) | (1 << 2) | 1;

/// Private TLB maintenance and invalid stream IDs recorded as events.
pub(crate) const CR2_PTM_RECINVSID: u32 = (1 << 2) | (1 << 1);

/// Raw access to the register frame of an SMMU.
pub trait Mmio: Send + Sync {
    fn read32(&self, offset: usize) -> u32;
    fn write32(&self, offset: usize, value: u32);
    fn read64(&self, offset: usize) -> u64;
    fn write64(&self, offset: usize, value: u64);
}

/// A memory-mapped register frame.
#[derive(Debug)]
pub struct IoMem {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: The registers are only accessed with volatile operations, which
// the hardware serializes.
unsafe impl Send for IoMem {}
// SAFETY: See above.
unsafe impl Sync for IoMem {}

impl IoMem {
    /// Creates an instance from the virtual address of the register frame.
    ///
    /// # Safety
    ///
    /// `base` must map the whole register frame of an SMMU, both of its 64KiB
    /// pages, for the lifetime of the returned object, and nothing else may
    /// drive the registers.
    pub unsafe fn new(base: NonNull<u8>) -> Self {
        Self {
            base,
            size: MMIO_SIZE,
        }
    }

    fn ptr<T>(&self, offset: usize) -> VolatilePtr<'_, T> {
        assert!(offset % size_of::<T>() == 0 && offset + size_of::<T>() <= self.size);
        // SAFETY: The offset is in bounds and aligned, as checked above.
        let ptr = unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) };
        // SAFETY: The constructor guarantees that the frame is valid MMIO.
        unsafe { VolatilePtr::new(ptr.cast::<T>()) }
    }
}

impl Mmio for IoMem {
    fn read32(&self, offset: usize) -> u32 {
        self.ptr::<u32>(offset).read()
    }

    fn write32(&self, offset: usize, value: u32) {
        self.ptr::<u32>(offset).write(value)
    }

    fn read64(&self, offset: usize) -> u64 {
        self.ptr::<u64>(offset).read()
    }

    fn write64(&self, offset: usize, value: u64) {
        self.ptr::<u64>(offset).write(value)
    }
}

/// The register frame shared by the driver components.
#[derive(Clone)]
pub(crate) struct SmmuRegisters {
    mmio: Arc<dyn Mmio>,
}

impl SmmuRegisters {
    pub(crate) fn new(mmio: Arc<dyn Mmio>) -> Self {
        Self { mmio }
    }

    pub(crate) fn read32(&self, offset: usize) -> u32 {
        self.mmio.read32(offset)
    }

    pub(crate) fn write32(&self, offset: usize, value: u32) {
        self.mmio.write32(offset, value)
    }

    pub(crate) fn write64(&self, offset: usize, value: u64) {
        self.mmio.write64(offset, value)
    }

    pub(crate) fn gerror(&self) -> GlobalErrors {
        GlobalErrors::from_bits_truncate(self.read32(GERROR))
    }

    pub(crate) fn gerrorn(&self) -> GlobalErrors {
        GlobalErrors::from_bits_truncate(self.read32(GERRORN))
    }
}

bitflags! {
    /// Global control of the SMMU.
    pub(crate) struct Control: u32 {
        /// Enables translation of incoming transactions.
        const SMMUEN =      1 << 0;
        /// Enables the event queue.
        const EVTQEN =      1 << 2;
        /// Enables the command queue.
        const CMDQEN =      1 << 3;
    }
}

bitflags! {
    /// Interrupt enables.
    pub(crate) struct IrqControl: u32 {
        const GERROR_IRQEN =    1 << 0;
        const PRIQ_IRQEN =      1 << 1;
        const EVTQ_IRQEN =      1 << 2;
    }
}

bitflags! {
    /// Global errors. An error is active while its bit in `GERROR` differs from
    /// the one in `GERRORN`.
    pub(crate) struct GlobalErrors: u32 {
        /// The command queue stopped at an erroneous command.
        const CMDQ_ERR =        1 << 0;
        /// An event queue write was aborted.
        const EVTQ_ABT_ERR =    1 << 2;
        const PRIQ_ABT_ERR =    1 << 3;
        const MSI_CMDQ_ABT =    1 << 4;
        const MSI_EVTQ_ABT =    1 << 5;
        const MSI_PRIQ_ABT =    1 << 6;
        const MSI_GERROR_ABT =  1 << 7;
        /// The SMMU entered service failure mode. All traffic is terminated.
        const SFM_ERR =         1 << 8;
    }
}

bitflags! {
    /// Features reported in `IDR0`.
    pub(crate) struct Idr0: u32 {
        const S2P =     1 << 0;
        const S1P =     1 << 1;
        /// AArch64 translation table format.
        const TTF_AARCH64 = 1 << 3;
        const COHACC =  1 << 4;
        const BTM =     1 << 5;
        const ASID16 =  1 << 12;
    }
}

bitflags! {
    /// Features reported in `IDR5`.
    pub(crate) struct Idr5: u32 {
        const GRAN4K =  1 << 4;
        const GRAN16K = 1 << 5;
        const GRAN64K = 1 << 6;
    }
}

/// The hardware limits the driver configuration is clamped to.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Features {
    pub(crate) asid_bits: u32,
    pub(crate) sid_bits: u32,
    pub(crate) cmdq_shift: u32,
    pub(crate) evtq_shift: u32,
    pub(crate) coherent: bool,
}

impl Features {
    pub(crate) fn probe(regs: &SmmuRegisters) -> Result<Self> {
        let idr0 = Idr0::from_bits_truncate(regs.read32(IDR0));
        let idr1 = regs.read32(IDR1);
        let idr5 = Idr5::from_bits_truncate(regs.read32(IDR5));

        if !idr0.contains(Idr0::S1P) {
            error!("[SMMU]: stage-1 translation is not supported");
            return Err(Error::Unsupported);
        }
        if !idr0.contains(Idr0::TTF_AARCH64) || !idr5.contains(Idr5::GRAN4K) {
            error!("[SMMU]: 4KiB AArch64 translation tables are not supported");
            return Err(Error::Unsupported);
        }

        Ok(Self {
            asid_bits: if idr0.contains(Idr0::ASID16) { 16 } else { 8 },
            sid_bits: idr1 & 0x3f,
            evtq_shift: (idr1 >> 16) & 0x1f,
            cmdq_shift: (idr1 >> 21) & 0x1f,
            coherent: idr0.contains(Idr0::COHACC),
        })
    }
}

/// Encodes the base register of a queue with `1 << shift` entries.
pub(crate) fn queue_base(paddr: Paddr, shift: u32) -> u64 {
    BASE_RA | (paddr as u64 & genmask(51, 5)) | shift as u64
}

/// Returns a mask with bits `low..=high` set.
pub(crate) const fn genmask(high: u32, low: u32) -> u64 {
    (u64::MAX >> (63 - high)) & (u64::MAX << low)
}
