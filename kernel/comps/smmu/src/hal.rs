// SPDX-License-Identifier: MPL-2.0

//! The platform services the driver depends on.

use core::{ops::Range, ptr::NonNull, time::Duration};

use crate::{
    mm::{Daddr, Paddr, PhysSegment},
    prelude::*,
};

/// The hardware abstraction layer of the embedding kernel.
///
/// All memory handed to the SMMU (queues, the stream table, context
/// descriptors and page tables) is obtained from and returned to the HAL.
/// The driver never assumes that physical memory is permanently mapped: it
/// accesses such memory through CPU windows created by [`Hal::map_window`].
pub trait Hal: Send + Sync + 'static {
    /// Allocates `nr_pages` physically contiguous pages, filled with zeros.
    fn alloc_pages(&self, nr_pages: usize) -> Result<Paddr>;

    /// Frees pages allocated by [`Hal::alloc_pages`].
    ///
    /// # Safety
    ///
    /// The pages must have been allocated with the same `nr_pages`, and must
    /// be referenced neither by the hardware nor by any live CPU window.
    unsafe fn free_pages(&self, paddr: Paddr, nr_pages: usize);

    /// Makes `size` bytes starting at `paddr` visible to the CPU.
    ///
    /// The returned address is page aligned and stays valid until
    /// [`Hal::unmap_window`] is called.
    fn map_window(&self, paddr: Paddr, size: usize) -> Result<NonNull<u8>>;

    /// Tears down a window created by [`Hal::map_window`].
    ///
    /// # Safety
    ///
    /// `vaddr` and `size` must come from a prior call to [`Hal::map_window`],
    /// and no reference into the window may outlive this call.
    unsafe fn unmap_window(&self, vaddr: NonNull<u8>, size: usize);

    /// Returns a monotonic timestamp.
    fn now(&self) -> Duration;

    /// Waits for at least `duration`.
    fn delay(&self, duration: Duration);

    /// Returns whether the current task has been asked to abort.
    fn signal_pending(&self) -> bool {
        false
    }

    /// Runs `work` later in a context that may block.
    fn queue_work(&self, work: Arc<dyn Work>);
}

/// A deferred piece of work.
pub trait Work: Send + Sync {
    fn run(&self);
}

/// The secure-memory attestation service of protected domains.
///
/// Pages of a protected buffer are reported before the device can reach
/// them, and released only after their translations are gone.
pub trait SecureAttestor: Send + Sync {
    /// Marks `segments`, mapped at `iova`, as protected.
    fn protect(&self, iova: Range<Daddr>, segments: &[PhysSegment]) -> Result<()>;

    /// Lifts the protection previously established for `iova`.
    fn unprotect(&self, iova: Range<Daddr>) -> Result<()>;
}
