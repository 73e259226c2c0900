// SPDX-License-Identifier: MPL-2.0

//! Driver and domain configuration.

use core::time::Duration;

use crate::{hal::SecureAttestor, prelude::*, stream::Privilege};

/// The configuration of an SMMU instance, resolved once at probe time.
///
/// Queue and stream table sizes are clamped to what the hardware supports.
#[derive(Clone, Debug)]
pub struct SmmuConfig {
    /// Log2 of the number of command queue entries.
    pub cmdq_shift: u32,
    /// Log2 of the number of event queue entries.
    pub evtq_shift: u32,
    /// The number of stream ID bits covered by the stream table.
    pub sid_bits: u32,
    /// How long to wait for the hardware before giving up.
    pub poll_timeout: Duration,
    /// Let the transactions of unbound streams through untranslated, instead
    /// of aborting them.
    pub bypass_unbound: bool,
}

impl Default for SmmuConfig {
    fn default() -> Self {
        Self {
            cmdq_shift: 8,
            evtq_shift: 7,
            sid_bits: 8,
            poll_timeout: Duration::from_secs(1),
            bypass_unbound: false,
        }
    }
}

/// How a domain gives unmapped ranges back to its allocator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FreePolicy {
    /// Invalidate the translations of each unmapped range before it can be
    /// reused.
    Immediate,
    /// Batch the invalidations: ranges are reused after the whole address
    /// space is invalidated, which happens once the pending ranges reach
    /// `watermark_permille` thousandths of the window.
    Deferred { watermark_permille: u32 },
}

/// Options for creating an [`IommuDomain`](crate::IommuDomain).
#[derive(Clone)]
pub struct DomainOptions {
    pub(crate) window: Range<Daddr>,
    pub(crate) free_policy: FreePolicy,
    pub(crate) shared: bool,
    pub(crate) block_mappings: bool,
    pub(crate) max_table_pages: usize,
    pub(crate) privilege: Privilege,
    pub(crate) attestor: Option<Arc<dyn SecureAttestor>>,
}

impl DomainOptions {
    /// The default budget for the preallocated page tables, in pages.
    pub const DEFAULT_MAX_TABLE_PAGES: usize = 1 << 14;

    /// Creates options for a domain translating `window`.
    ///
    /// By default, the domain serves a single device, frees immediately and
    /// uses block mappings.
    pub fn new(window: Range<Daddr>) -> Self {
        Self {
            window,
            free_policy: FreePolicy::Immediate,
            shared: false,
            block_mappings: true,
            max_table_pages: Self::DEFAULT_MAX_TABLE_PAGES,
            privilege: Privilege::Inherit,
            attestor: None,
        }
    }

    /// Sets how unmapped ranges are given back.
    pub fn free_policy(&mut self, policy: FreePolicy) -> &mut Self {
        self.free_policy = policy;
        self
    }

    /// Sets whether more than one device may be bound to the domain.
    pub fn shared(&mut self, shared: bool) -> &mut Self {
        self.shared = shared;
        self
    }

    /// Sets whether 2MiB block mappings may be used.
    pub fn block_mappings(&mut self, enabled: bool) -> &mut Self {
        self.block_mappings = enabled;
        self
    }

    /// Sets the budget for the preallocated page tables, in pages.
    pub fn max_table_pages(&mut self, max_table_pages: usize) -> &mut Self {
        self.max_table_pages = max_table_pages;
        self
    }

    /// Sets how privileged the transactions of bound devices are treated.
    pub fn privilege(&mut self, privilege: Privilege) -> &mut Self {
        self.privilege = privilege;
        self
    }

    /// Makes the domain protected. The pages of scatter-list mappings are
    /// registered with `attestor`.
    pub fn protected(&mut self, attestor: Arc<dyn SecureAttestor>) -> &mut Self {
        self.attestor = Some(attestor);
        self
    }
}

impl core::fmt::Debug for DomainOptions {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DomainOptions")
            .field("window", &self.window)
            .field("free_policy", &self.free_policy)
            .field("shared", &self.shared)
            .field("block_mappings", &self.block_mappings)
            .field("max_table_pages", &self.max_table_pages)
            .field("privilege", &self.privilege)
            .field("protected", &self.attestor.is_some())
            .finish()
    }
}
