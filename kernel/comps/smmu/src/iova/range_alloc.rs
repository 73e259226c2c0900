// SPDX-License-Identifier: MPL-2.0

use align_ext::AlignExt;

use crate::prelude::*;

/// A first-fit allocator of address ranges.
///
/// Free ranges are kept coalesced. Allocated ranges are remembered, so that
/// only a range handed out earlier can be freed, and only once.
pub(crate) struct RangeAllocator {
    range: Range<Daddr>,
    /// Free ranges, by start.
    free_list: BTreeMap<Daddr, usize>,
    /// Allocated ranges, by start.
    allocated: BTreeMap<Daddr, usize>,
    free_size: usize,
}

impl RangeAllocator {
    pub(crate) fn new(range: Range<Daddr>) -> Self {
        let mut free_list = BTreeMap::new();
        if !range.is_empty() {
            free_list.insert(range.start, range.len());
        }
        Self {
            free_size: range.len(),
            range,
            free_list,
            allocated: BTreeMap::new(),
        }
    }

    pub(crate) fn free_size(&self) -> usize {
        self.free_size
    }

    /// Allocates `size` bytes starting at a multiple of `align`.
    pub(crate) fn alloc(&mut self, size: usize, align: usize) -> Result<Range<Daddr>> {
        let found = self.free_list.iter().find_map(|(&start, &len)| {
            let aligned = start.align_up(align);
            let end = aligned.checked_add(size)?;
            (end <= start + len).then_some((start, aligned))
        });
        let Some((free_start, start)) = found else {
            return Err(Error::NoSpace);
        };

        self.carve(free_start, start..start + size);
        Ok(start..start + size)
    }

    /// Allocates exactly `range`.
    pub(crate) fn alloc_specific(&mut self, range: Range<Daddr>) -> Result<()> {
        if range.is_empty() || range.start < self.range.start || range.end > self.range.end {
            return Err(Error::OutOfRange);
        }
        let Some((&free_start, &len)) = self.free_list.range(..=range.start).next_back() else {
            return Err(Error::Overlap);
        };
        if free_start + len < range.end {
            return Err(Error::Overlap);
        }

        self.carve(free_start, range);
        Ok(())
    }

    /// Frees a range returned by [`Self::alloc`] or [`Self::alloc_specific`].
    pub(crate) fn free(&mut self, range: Range<Daddr>) -> Result<()> {
        if self.allocated.get(&range.start) != Some(&range.len()) {
            error!(
                "[SMMU]: freeing {:#x}..{:#x}, which is not allocated",
                range.start, range.end
            );
            return Err(Error::DoubleFree);
        }
        self.allocated.remove(&range.start);
        self.free_size += range.len();

        let mut start = range.start;
        let mut len = range.len();
        if let Some((&prev_start, &prev_len)) = self.free_list.range(..start).next_back() {
            if prev_start + prev_len == start {
                self.free_list.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.free_list.get(&(start + len)) {
            self.free_list.remove(&(start + len));
            len += next_len;
        }
        self.free_list.insert(start, len);
        Ok(())
    }

    /// Returns whether `range` is exactly an allocated range.
    pub(crate) fn is_allocated(&self, range: &Range<Daddr>) -> bool {
        self.allocated.get(&range.start) == Some(&range.len())
    }

    pub(crate) fn allocated_ranges(&self) -> impl Iterator<Item = Range<Daddr>> + '_ {
        self.allocated.iter().map(|(&start, &len)| start..start + len)
    }

    /// Takes `range` out of the free range starting at `free_start`.
    fn carve(&mut self, free_start: Daddr, range: Range<Daddr>) {
        let Some(len) = self.free_list.remove(&free_start) else {
            return;
        };
        if range.start > free_start {
            self.free_list.insert(free_start, range.start - free_start);
        }
        let free_end = free_start + len;
        if range.end < free_end {
            self.free_list.insert(range.end, free_end - range.end);
        }
        self.free_size -= range.len();
        self.allocated.insert(range.start, range.len());
    }
}
