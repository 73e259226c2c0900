// SPDX-License-Identifier: MPL-2.0

//! Stream table entries and context descriptors.

use crate::{domain::Asid, page_table::MAIR, prelude::*, registers::genmask};

/// The number of 64-bit words of a stream table entry.
pub(crate) const STE_WORDS: usize = 8;

/// The number of 64-bit words of a context descriptor.
pub(crate) const CD_WORDS: usize = 8;

/// How privileged the transactions of a stream are treated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Privilege {
    /// Use the privilege attribute of each incoming transaction.
    #[default]
    Inherit,
    Unprivileged,
    Privileged,
}

impl Privilege {
    fn privcfg(self) -> u64 {
        match self {
            Privilege::Inherit => 0b00,
            Privilege::Unprivileged => 0b10,
            Privilege::Privileged => 0b11,
        }
    }
}

/// The configuration a stream table entry selects for its stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StreamConfig {
    /// Terminate every transaction.
    Abort,
    /// Let every transaction through untranslated.
    Bypass,
    /// Translate through the stage-1 context at `cd`.
    Translate {
        cd: Paddr,
        cd_cacheable: bool,
        privilege: Privilege,
    },
}

const STE_V: u64 = 1 << 0;
const STE_CFG_SHIFT: u32 = 1;
const STE_CFG_ABORT: u64 = 0b000;
const STE_CFG_BYPASS: u64 = 0b100;
const STE_CFG_S1_TRANS: u64 = 0b101;
const STE_S1FMT_LINEAR: u64 = 0b00 << 4;
const STE_S1CTXPTR_MASK: u64 = genmask(51, 6);

/// Inner and outer write-back, read/write-allocate.
const STE_CACHE_WBRA: u64 = 0b01;
const STE_SH_ISH: u64 = 0b11;
const STE_S1CIR_SHIFT: u32 = 2;
const STE_S1COR_SHIFT: u32 = 4;
const STE_S1CSH_SHIFT: u32 = 6;
const STE_SHCFG_INCOMING: u64 = 0b01 << 44;
const STE_PRIVCFG_SHIFT: u32 = 48;

/// A stream table entry.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct StreamTableEntry([u64; STE_WORDS]);

impl StreamTableEntry {
    pub(crate) fn new(config: StreamConfig) -> Self {
        let mut words = [0u64; STE_WORDS];
        match config {
            StreamConfig::Abort => {
                words[0] = STE_V | (STE_CFG_ABORT << STE_CFG_SHIFT);
            }
            StreamConfig::Bypass => {
                words[0] = STE_V | (STE_CFG_BYPASS << STE_CFG_SHIFT);
                words[1] = STE_SHCFG_INCOMING;
            }
            StreamConfig::Translate {
                cd,
                cd_cacheable,
                privilege,
            } => {
                words[0] = STE_V
                    | (STE_CFG_S1_TRANS << STE_CFG_SHIFT)
                    | STE_S1FMT_LINEAR
                    | (cd as u64 & STE_S1CTXPTR_MASK);
                if cd_cacheable {
                    words[1] |= (STE_CACHE_WBRA << STE_S1CIR_SHIFT)
                        | (STE_CACHE_WBRA << STE_S1COR_SHIFT)
                        | (STE_SH_ISH << STE_S1CSH_SHIFT);
                }
                words[1] |= privilege.privcfg() << STE_PRIVCFG_SHIFT;
            }
        }
        Self(words)
    }

    #[cfg(test)]
    pub(crate) fn from_words(words: [u64; STE_WORDS]) -> Self {
        Self(words)
    }

    pub(crate) fn words(&self) -> &[u64; STE_WORDS] {
        &self.0
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.0[0] & STE_V != 0
    }

    /// Decodes the configuration, if the entry is valid and understood.
    pub(crate) fn config(&self) -> Option<StreamConfig> {
        if !self.is_valid() {
            return None;
        }
        match (self.0[0] >> STE_CFG_SHIFT) & 0b111 {
            STE_CFG_ABORT => Some(StreamConfig::Abort),
            STE_CFG_BYPASS => Some(StreamConfig::Bypass),
            STE_CFG_S1_TRANS => {
                let privilege = match (self.0[1] >> STE_PRIVCFG_SHIFT) & 0b11 {
                    0b10 => Privilege::Unprivileged,
                    0b11 => Privilege::Privileged,
                    _ => Privilege::Inherit,
                };
                Some(StreamConfig::Translate {
                    cd: (self.0[0] & STE_S1CTXPTR_MASK) as Paddr,
                    cd_cacheable: (self.0[1] >> STE_S1CIR_SHIFT) & 0b11 != 0,
                    privilege,
                })
            }
            _ => None,
        }
    }
}

impl core::fmt::Debug for StreamTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StreamTableEntry")
            .field("config", &self.config())
            .field("raw", &format_args!("{:#018x?}", self.0))
            .finish()
    }
}

/// A stage-1 context descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ContextDescriptor([u64; CD_WORDS]);

const CD_TG0_4K: u64 = 0b00 << 6;
const CD_IRGN0_WBWA: u64 = 0b01 << 8;
const CD_ORGN0_WBWA: u64 = 0b01 << 10;
const CD_SH0_ISH: u64 = 0b11 << 12;
const CD_EPD1: u64 = 1 << 30;
const CD_V: u64 = 1 << 31;
/// 48-bit intermediate physical addresses.
const CD_IPS_48: u64 = 0b101 << 32;
const CD_AA64: u64 = 1 << 41;
/// Faults are recorded and the transaction is terminated with an abort.
const CD_R: u64 = 1 << 45;
const CD_A: u64 = 1 << 46;
/// The ASID is not shared with CPU page tables.
const CD_ASET: u64 = 1 << 47;
const CD_ASID_SHIFT: u32 = 48;
const CD_TTB0_MASK: u64 = genmask(51, 4);

impl ContextDescriptor {
    /// Creates a descriptor for a table rooted at `ttb0` translating
    /// `ias_bits` bits of input address.
    pub(crate) fn new(ttb0: Paddr, asid: Asid, ias_bits: u32) -> Self {
        let mut words = [0u64; CD_WORDS];
        words[0] = (64 - ias_bits as u64)
            | CD_TG0_4K
            | CD_IRGN0_WBWA
            | CD_ORGN0_WBWA
            | CD_SH0_ISH
            | CD_EPD1
            | CD_V
            | CD_IPS_48
            | CD_AA64
            | CD_R
            | CD_A
            | CD_ASET
            | ((asid as u64) << CD_ASID_SHIFT);
        words[1] = ttb0 as u64 & CD_TTB0_MASK;
        words[3] = MAIR;
        Self(words)
    }

    pub(crate) fn words(&self) -> &[u64; CD_WORDS] {
        &self.0
    }

    #[cfg(test)]
    pub(crate) fn asid(&self) -> Asid {
        (self.0[0] >> CD_ASID_SHIFT) as Asid
    }

    #[cfg(test)]
    pub(crate) fn ttb0(&self) -> Paddr {
        (self.0[1] & CD_TTB0_MASK) as Paddr
    }
}
