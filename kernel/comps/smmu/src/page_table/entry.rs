// SPDX-License-Identifier: MPL-2.0

use bitflags::bitflags;

use crate::{prelude::*, registers::genmask};

bitflags! {
    /// The access permissions and memory attributes of a device mapping.
    pub struct IommuProt: u32 {
        const READ =        1 << 0;
        const WRITE =       1 << 1;
        /// Device accesses are coherent with the CPU caches.
        const CACHE =       1 << 2;
        const NOEXEC =      1 << 3;
        /// Only privileged transactions may use the mapping.
        const PRIV =        1 << 4;
        /// The target is device memory.
        const MMIO =        1 << 5;
        /// The target is part of a protected buffer.
        const PROTECTED =   1 << 6;
    }
}

const ATTR_IDX_CACHE: u64 = 0;
const ATTR_IDX_DEVICE: u64 = 1;
const ATTR_IDX_NC: u64 = 2;
const ATTR_IDX_PROTECTED: u64 = 3;

/// The memory attributes selected by the attribute indexes of the entries:
/// write-back cacheable, device nGnRE, and non-cacheable for both plain
/// non-coherent and protected memory.
pub(crate) const MAIR: u64 = 0xff | (0x04 << 8) | (0x44 << 16) | (0x44 << 24);

/// A descriptor of the 4KiB-granule stage-1 table format.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct Pte(u64);

impl Pte {
    const VALID: u64 = 1 << 0;
    /// Table descriptor at levels 1 and 2, page descriptor at level 3.
    const TABLE_OR_PAGE: u64 = 1 << 1;
    const ATTR_IDX_SHIFT: u32 = 2;
    const ATTR_IDX_MASK: u64 = 0b111 << 2;
    const AP_UNPRIV: u64 = 1 << 6;
    const AP_RDONLY: u64 = 1 << 7;
    const SH_OS: u64 = 0b10 << 8;
    const SH_IS: u64 = 0b11 << 8;
    const AF: u64 = 1 << 10;
    const NG: u64 = 1 << 11;
    const PXN: u64 = 1 << 53;
    const UXN: u64 = 1 << 54;
    const ADDR_MASK: u64 = genmask(47, 12);

    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) const fn raw(&self) -> u64 {
        self.0
    }

    pub(crate) fn new_table(paddr: Paddr) -> Self {
        Self((paddr as u64 & Self::ADDR_MASK) | Self::TABLE_OR_PAGE | Self::VALID)
    }

    pub(crate) fn new_page(paddr: Paddr, prot: IommuProt) -> Self {
        Self(
            (paddr as u64 & Self::ADDR_MASK)
                | Self::attributes(prot)
                | Self::TABLE_OR_PAGE
                | Self::VALID,
        )
    }

    pub(crate) fn new_block(paddr: Paddr, prot: IommuProt) -> Self {
        Self((paddr as u64 & Self::ADDR_MASK) | Self::attributes(prot) | Self::VALID)
    }

    fn attributes(prot: IommuProt) -> u64 {
        let mut bits = Self::AF | Self::NG;
        if !prot.contains(IommuProt::WRITE) {
            bits |= Self::AP_RDONLY;
        }
        if !prot.contains(IommuProt::PRIV) {
            bits |= Self::AP_UNPRIV;
        }
        if prot.contains(IommuProt::NOEXEC) {
            bits |= Self::UXN | Self::PXN;
        }

        let attr_idx = if prot.contains(IommuProt::MMIO) {
            ATTR_IDX_DEVICE
        } else if prot.contains(IommuProt::PROTECTED) {
            ATTR_IDX_PROTECTED
        } else if prot.contains(IommuProt::CACHE) {
            ATTR_IDX_CACHE
        } else {
            ATTR_IDX_NC
        };
        bits |= attr_idx << Self::ATTR_IDX_SHIFT;
        bits |= if attr_idx == ATTR_IDX_CACHE {
            Self::SH_IS
        } else {
            Self::SH_OS
        };
        bits
    }

    pub(crate) fn is_present(&self) -> bool {
        self.0 & Self::VALID != 0
    }

    /// Returns whether the entry points to a next-level table.
    pub(crate) fn is_table(&self, level: u8) -> bool {
        level < 3 && self.is_present() && self.0 & Self::TABLE_OR_PAGE != 0
    }

    pub(crate) fn paddr(&self) -> Paddr {
        (self.0 & Self::ADDR_MASK) as Paddr
    }

    /// Recovers the protection of a leaf entry.
    pub(crate) fn prot(&self) -> IommuProt {
        let mut prot = IommuProt::READ;
        if self.0 & Self::AP_RDONLY == 0 {
            prot |= IommuProt::WRITE;
        }
        if self.0 & Self::AP_UNPRIV == 0 {
            prot |= IommuProt::PRIV;
        }
        if self.0 & Self::UXN != 0 {
            prot |= IommuProt::NOEXEC;
        }
        match (self.0 & Self::ATTR_IDX_MASK) >> Self::ATTR_IDX_SHIFT {
            ATTR_IDX_CACHE => prot |= IommuProt::CACHE,
            ATTR_IDX_DEVICE => prot |= IommuProt::MMIO,
            ATTR_IDX_PROTECTED => prot |= IommuProt::PROTECTED,
            _ => {}
        }
        prot
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pte({:#018x})", self.0)
    }
}
