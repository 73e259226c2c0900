// SPDX-License-Identifier: MPL-2.0

//! The address-space and command-protocol engine of SMMUv3-style IOMMUs.
//!
//! An [`Smmu`] owns one translation unit: its command queue, event queue and
//! stream table. Devices, identified by their stream IDs, are bound to
//! [`IommuDomain`]s. A domain is one device address space; it hands out IO
//! virtual addresses, populates the page table the hardware walks, and keeps
//! the hardware translation caches coherent with the table.
//!
//! The crate does not touch any global state. The platform is reached through
//! the [`Hal`] and [`Mmio`] traits, so that the same engine can be embedded in
//! different kernels (and driven by a simulated unit in tests).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod cmdq;
mod config;
mod device;
mod domain;
mod error;
mod event;
mod hal;
mod iova;
mod mapping_cache;
mod mm;
mod page_table;
pub mod prelude;
mod registers;
mod stream;
mod tlb;

#[cfg(test)]
mod sim;
#[cfg(test)]
mod test;

pub use self::{
    cmdq::{Command, CmdqError},
    config::{DomainOptions, FreePolicy, SmmuConfig},
    device::Smmu,
    domain::{Asid, DomainStats, IommuDomain},
    error::Error,
    event::{EventId, EventRecord, FaultAccess, FaultObserver, FaultReport},
    hal::{Hal, SecureAttestor, Work},
    mapping_cache::BufferId,
    mm::{BLOCK_SIZE, Daddr, PAGE_SIZE, Paddr, PhysSegment},
    page_table::{IommuProt, PageTableError, PteSnapshot},
    prelude::Result,
    registers::{IoMem, Mmio},
    stream::{Privilege, StreamId},
    tlb::IotlbFlushOp,
};
