// SPDX-License-Identifier: MPL-2.0

//! Physical memory owned by the driver and the CPU windows onto it.

use core::{ptr::NonNull, sync::atomic::AtomicU64};

use crate::{hal::Hal, prelude::*};

/// A physical address.
pub type Paddr = usize;

/// A device address, also known as an IO virtual address.
pub type Daddr = usize;

/// The size of the translation granule.
pub const PAGE_SIZE: usize = 4096;

/// The size of a level-2 block mapping.
pub const BLOCK_SIZE: usize = 512 * PAGE_SIZE;

/// A physically contiguous piece of a scatter list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PhysSegment {
    paddr: Paddr,
    len: usize,
}

impl PhysSegment {
    pub const fn new(paddr: Paddr, len: usize) -> Self {
        Self { paddr, len }
    }

    pub const fn paddr(&self) -> Paddr {
        self.paddr
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns whether both the start and the length are page aligned.
    pub const fn is_page_aligned(&self) -> bool {
        self.paddr % PAGE_SIZE == 0 && self.len % PAGE_SIZE == 0
    }
}

/// Physically contiguous pages allocated from the HAL.
///
/// The pages are returned to the HAL when dropped.
pub(crate) struct PhysPages {
    hal: Arc<dyn Hal>,
    paddr: Paddr,
    nr_pages: usize,
}

impl PhysPages {
    pub(crate) fn alloc(hal: &Arc<dyn Hal>, nr_pages: usize) -> Result<Self> {
        if nr_pages == 0 {
            return Err(Error::InvalidArgs);
        }
        let paddr = hal.alloc_pages(nr_pages)?;
        Ok(Self {
            hal: hal.clone(),
            paddr,
            nr_pages,
        })
    }

    pub(crate) fn paddr(&self) -> Paddr {
        self.paddr
    }

    pub(crate) fn nr_pages(&self) -> usize {
        self.nr_pages
    }

    /// Maps all the pages into a temporary CPU window.
    pub(crate) fn map(&self) -> Result<CpuWindow> {
        CpuWindow::new(&self.hal, self.paddr, self.nr_pages * PAGE_SIZE)
    }

    /// Maps the `index`-th page into a temporary CPU window.
    pub(crate) fn map_page(&self, index: usize) -> Result<CpuWindow> {
        if index >= self.nr_pages {
            return Err(Error::InvalidArgs);
        }
        CpuWindow::new(&self.hal, self.paddr + index * PAGE_SIZE, PAGE_SIZE)
    }
}

impl Drop for PhysPages {
    fn drop(&mut self) {
        // SAFETY: The pages were allocated with the same count. Their owners
        // stop the hardware from using them before dropping them, and every
        // window borrows from `self`.
        unsafe { self.hal.free_pages(self.paddr, self.nr_pages) };
    }
}

/// A CPU-visible window onto physical pages.
///
/// The window is unmapped when dropped, so that every exit path of a scope
/// that acquired a window, including error paths, gives it back.
pub(crate) struct CpuWindow {
    hal: Arc<dyn Hal>,
    vaddr: NonNull<u8>,
    size: usize,
}

// SAFETY: The window is only accessed through atomic words.
unsafe impl Send for CpuWindow {}
// SAFETY: The window is only accessed through atomic words.
unsafe impl Sync for CpuWindow {}

impl CpuWindow {
    fn new(hal: &Arc<dyn Hal>, paddr: Paddr, size: usize) -> Result<Self> {
        let vaddr = hal.map_window(paddr, size)?;
        Ok(Self {
            hal: hal.clone(),
            vaddr,
            size,
        })
    }

    /// Returns the content of the window as 64-bit words.
    pub(crate) fn words(&self) -> &[AtomicU64] {
        // SAFETY: The window is page aligned, its size is a multiple of the
        // word size, and it stays mapped while `self` is borrowed.
        // `AtomicU64` has the same in-memory representation as `u64`.
        unsafe {
            core::slice::from_raw_parts(
                self.vaddr.as_ptr().cast::<AtomicU64>(),
                self.size / size_of::<u64>(),
            )
        }
    }
}

impl Drop for CpuWindow {
    fn drop(&mut self) {
        // SAFETY: The window came from `map_window` with the same size. The
        // borrows of `words` end with the borrow of `self`.
        unsafe { self.hal.unmap_window(self.vaddr, self.size) };
    }
}

/// Pages that stay mapped to the CPU for their whole lifetime.
///
/// Used for the structures that the driver touches on every operation: the
/// queues, the stream table, context descriptors and leaf page tables.
pub(crate) struct CoherentPages {
    // Dropped before `pages`.
    window: CpuWindow,
    pages: PhysPages,
}

impl CoherentPages {
    pub(crate) fn alloc(hal: &Arc<dyn Hal>, nr_pages: usize) -> Result<Self> {
        let pages = PhysPages::alloc(hal, nr_pages)?;
        let window = pages.map()?;
        Ok(Self { window, pages })
    }

    pub(crate) fn paddr(&self) -> Paddr {
        self.pages.paddr()
    }

    pub(crate) fn nr_pages(&self) -> usize {
        self.pages.nr_pages()
    }

    pub(crate) fn words(&self) -> &[AtomicU64] {
        self.window.words()
    }
}
