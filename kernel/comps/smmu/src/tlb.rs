// SPDX-License-Identifier: MPL-2.0

//! IOTLB maintenance.

use smallvec::SmallVec;

use crate::{cmdq::Command, domain::Asid, prelude::*};

/// Invalidates cached walks over an address range.
///
/// Used to break a table descriptor before a block descriptor replaces it.
pub(crate) trait WalkFlush {
    fn flush_walk(&self, range: Range<Daddr>) -> Result<()>;
}

/// Invalidates every translation of an address space and waits for it.
pub(crate) trait IotlbFlush {
    fn flush_all(&self) -> Result<()>;
}

/// The operation to flush IOTLB entries of one address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IotlbFlushOp {
    /// Flush all the entries of the address space.
    All,
    /// Flush the entries for the specified device address range.
    Range(Range<Daddr>),
}

impl IotlbFlushOp {
    fn optimize_for_large_range(self) -> Self {
        match self {
            IotlbFlushOp::Range(range) => {
                if range.len() > FLUSH_ALL_RANGE_THRESHOLD {
                    IotlbFlushOp::All
                } else {
                    IotlbFlushOp::Range(range)
                }
            }
            _ => self,
        }
    }
}

/// If a flushing request exceeds this threshold, we flush all.
const FLUSH_ALL_RANGE_THRESHOLD: usize = 32 * PAGE_SIZE;

/// If the number of pending requests exceeds this threshold, we flush all the
/// entries instead of flushing them one by one.
const FLUSH_ALL_OPS_THRESHOLD: usize = 32;

/// Gathers the IOTLB flushes needed after modifying a page table.
#[derive(Debug, Default)]
pub(crate) struct IotlbGather {
    need_flush_all: bool,
    flush_ops: SmallVec<[IotlbFlushOp; 4]>,
}

impl IotlbGather {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records that the translations of `range` became stale.
    ///
    /// Merges with the previous range if the two are adjacent.
    pub(crate) fn add_range(&mut self, range: Range<Daddr>) {
        if self.need_flush_all {
            return;
        }
        if let Some(IotlbFlushOp::Range(last)) = self.flush_ops.last_mut() {
            if last.end == range.start {
                let merged = last.start..range.end;
                self.flush_ops.pop();
                self.issue(IotlbFlushOp::Range(merged));
                return;
            }
        }
        self.issue(IotlbFlushOp::Range(range));
    }

    pub(crate) fn issue(&mut self, op: IotlbFlushOp) {
        if self.need_flush_all {
            return;
        }

        let op = op.optimize_for_large_range();

        if op == IotlbFlushOp::All || self.flush_ops.len() >= FLUSH_ALL_OPS_THRESHOLD {
            self.flush_ops.clear();
            self.need_flush_all = true;
        } else {
            self.flush_ops.push(op);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        !self.need_flush_all && self.flush_ops.is_empty()
    }

    /// Returns the invalidation commands for the address space of `asid`.
    pub(crate) fn commands(&self, asid: Asid) -> Vec<Command> {
        if self.need_flush_all {
            return vec![Command::TlbiNhAsid { asid }];
        }

        let mut cmds = Vec::new();
        for op in &self.flush_ops {
            match op {
                IotlbFlushOp::All => cmds.push(Command::TlbiNhAsid { asid }),
                IotlbFlushOp::Range(range) => {
                    cmds.extend(range.clone().step_by(PAGE_SIZE).map(|addr| Command::TlbiNhVa {
                        asid,
                        addr,
                        leaf: true,
                    }));
                }
            }
        }
        cmds
    }
}
