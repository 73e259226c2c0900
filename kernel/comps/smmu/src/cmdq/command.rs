// SPDX-License-Identifier: MPL-2.0

use int_to_c_enum::TryFromInt;

use crate::{domain::Asid, prelude::*, registers::genmask, stream::StreamId};

/// The number of 64-bit words of a command.
pub(crate) const CMD_WORDS: usize = 2;

/// The operation code in the lowest byte of a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromInt)]
#[repr(u8)]
pub(crate) enum Opcode {
    PrefetchCfg = 0x01,
    CfgiSte = 0x03,
    CfgiAll = 0x04,
    CfgiCd = 0x05,
    TlbiNhAsid = 0x11,
    TlbiNhVa = 0x12,
    TlbiNsnhAll = 0x30,
    Sync = 0x46,
}

/// A command understood by the SMMU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Prefetches the configuration of a stream.
    PrefetchCfg { sid: StreamId },
    /// Invalidates the cached stream table entry of a stream.
    CfgiSte { sid: StreamId, leaf: bool },
    /// Invalidates every cached stream table entry and context descriptor.
    CfgiAll,
    /// Invalidates a cached context descriptor.
    CfgiCd { sid: StreamId, ssid: u32, leaf: bool },
    /// Invalidates every translation tagged with an ASID.
    TlbiNhAsid { asid: Asid },
    /// Invalidates the translations of one address.
    ///
    /// A non-leaf invalidation also drops the cached walks leading to it.
    TlbiNhVa { asid: Asid, addr: Daddr, leaf: bool },
    /// Invalidates every non-secure, non-hypervisor translation.
    TlbiNsnhAll,
    /// Completes once every command before it has taken effect.
    Sync,
}

const LEAF: u64 = 1;
const CFGI_ALL_RANGE: u64 = 31;

impl Command {
    pub(crate) fn opcode(&self) -> Opcode {
        match self {
            Command::PrefetchCfg { .. } => Opcode::PrefetchCfg,
            Command::CfgiSte { .. } => Opcode::CfgiSte,
            Command::CfgiAll => Opcode::CfgiAll,
            Command::CfgiCd { .. } => Opcode::CfgiCd,
            Command::TlbiNhAsid { .. } => Opcode::TlbiNhAsid,
            Command::TlbiNhVa { .. } => Opcode::TlbiNhVa,
            Command::TlbiNsnhAll => Opcode::TlbiNsnhAll,
            Command::Sync => Opcode::Sync,
        }
    }

    /// Encodes the command into its in-queue representation.
    pub(crate) fn encode(&self) -> [u64; CMD_WORDS] {
        let mut words = [self.opcode() as u64, 0];
        match *self {
            Command::PrefetchCfg { sid } => {
                words[0] |= (sid as u64) << 32;
            }
            Command::CfgiSte { sid, leaf } => {
                words[0] |= (sid as u64) << 32;
                words[1] |= leaf as u64;
            }
            Command::CfgiAll => {
                words[1] |= CFGI_ALL_RANGE;
            }
            Command::CfgiCd { sid, ssid, leaf } => {
                words[0] |= ((ssid as u64) << 12) & genmask(31, 12);
                words[0] |= (sid as u64) << 32;
                words[1] |= leaf as u64;
            }
            Command::TlbiNhAsid { asid } => {
                words[0] |= (asid as u64) << 48;
            }
            Command::TlbiNhVa { asid, addr, leaf } => {
                words[0] |= (asid as u64) << 48;
                words[1] |= (addr as u64 & genmask(63, 12)) | leaf as u64;
            }
            Command::TlbiNsnhAll | Command::Sync => {}
        }
        words
    }

    /// Decodes a command read back from the queue.
    ///
    /// Returns the opcode byte if it is unknown to the driver.
    pub(crate) fn decode(words: [u64; CMD_WORDS]) -> core::result::Result<Self, u8> {
        let raw_opcode = words[0] as u8;
        let opcode = Opcode::try_from(raw_opcode).map_err(|_| raw_opcode)?;
        let sid = (words[0] >> 32) as StreamId;
        let asid = (words[0] >> 48) as Asid;
        let leaf = words[1] & LEAF != 0;

        let cmd = match opcode {
            Opcode::PrefetchCfg => Command::PrefetchCfg { sid },
            Opcode::CfgiSte => Command::CfgiSte { sid, leaf },
            Opcode::CfgiAll => Command::CfgiAll,
            Opcode::CfgiCd => Command::CfgiCd {
                sid,
                ssid: ((words[0] & genmask(31, 12)) >> 12) as u32,
                leaf,
            },
            Opcode::TlbiNhAsid => Command::TlbiNhAsid { asid },
            Opcode::TlbiNhVa => Command::TlbiNhVa {
                asid,
                addr: (words[1] & genmask(63, 12)) as Daddr,
                leaf,
            },
            Opcode::TlbiNsnhAll => Command::TlbiNsnhAll,
            Opcode::Sync => Command::Sync,
        };
        Ok(cmd)
    }
}
