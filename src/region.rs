use std::collections::{BTreeMap, BTreeSet};

use log::{debug, trace};

use crate::buffer::{BufferArena, BufferHandle, BufferRecord};
use crate::error::AllocError;
use crate::page::{is_page_aligned, page_align_up, page_floor, PageAllocator, PageMap};
use crate::size::sanitized_size;

/// Region size cap: 4 MiB, per the source's `SZ_4M` clamp in `binder_alloc_mmap`.
pub const MAX_REGION_SIZE: usize = 4 * 1024 * 1024;

/// A mapping request: an optional fixed start (unused by the hosted
/// implementation, kept for interface parity with the source's `vma`) and
/// the requested size, clamped to [`MAX_REGION_SIZE`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MapArea {
    pub size: usize,
}

/// Live region state: everything that exists only once `mmap` has run.
pub(crate) struct Region {
    len: usize,
    backing: Vec<u8>,
    page_map: PageMap,
    arena: BufferArena,
    free_set: BTreeSet<(usize, BufferHandle)>,
    allocated_set: BTreeMap<usize, BufferHandle>,
    head: BufferHandle,
    tail: BufferHandle,
}

impl Region {
    fn page_size(&self) -> usize { self.page_map.page_size() }

    fn buffer_end(&self, handle: BufferHandle) -> usize {
        match self.arena.get(handle).next {
            Some(next) => self.arena.get(next).user_data,
            None => self.len,
        }
    }

    fn buffer_size(&self, handle: BufferHandle) -> usize {
        self.buffer_end(handle) - self.arena.get(handle).user_data
    }

    /// Materializes every page in `[start, end)` not already resident.
    /// Pages freshly materialized by this call (and only those; a page
    /// already resident on entry, e.g. shared with a live neighbour, is
    /// left alone) are recorded into `newly_materialized` as they succeed,
    /// so a caller that needs to unwind a failed allocation can undo
    /// exactly what this call did and nothing more.
    fn materialize_range(
        &mut self,
        pages: &dyn PageAllocator,
        start: usize,
        end: usize,
        newly_materialized: &mut Vec<usize>,
    ) -> Result<(), AllocError> {
        if end <= start {
            return Ok(());
        }
        let page_size = self.page_size();
        let mut addr = start;
        while addr < end {
            let index = addr / page_size;
            if !self.page_map.is_materialized(index) {
                pages.materialize_page(index)?;
                self.page_map.set_materialized(index, true);
                newly_materialized.push(index);
                trace!("materialized page {} at offset {:#x}", index, addr);
            }
            addr += page_size;
        }
        Ok(())
    }

    fn release_range(&mut self, start: usize, end: usize) {
        if end <= start {
            return;
        }
        let page_size = self.page_size();
        let mut addr = start;
        while addr < end {
            let index = addr / page_size;
            if self.page_map.is_materialized(index) {
                self.page_map.set_materialized(index, false);
                trace!("released page {} at offset {:#x}", index, addr);
            }
            addr += page_size;
        }
    }

    /// Release every page wholly contained within `handle`'s current span.
    ///
    /// This single sweep, run once coalescing has settled on a final
    /// surviving buffer, subsumes both the source's pre-coalesce
    /// "release pages wholly contained in the freed buffer" step and its
    /// per-neighbour shared-page check during `delete_free_buffer`: a page
    /// only partially covered by the surviving span is, by construction,
    /// still owned in part by whatever buffer sits on the other side of
    /// the boundary, free or live, so excluding it here is exactly the
    /// shared-page rule. See DESIGN.md for why the two were unified.
    fn release_wholly_contained(&mut self, handle: BufferHandle) {
        let page_size = self.page_size();
        let user_data = self.arena.get(handle).user_data;
        let end = self.buffer_end(handle);
        let start = page_align_up(user_data, page_size);
        let floor_end = page_floor(end, page_size);
        self.release_range(start, floor_end);
    }

    /// Splice `handle` out of the address-ordered list and destroy its
    /// record. Does not touch the free set; callers remove free buffers
    /// from the free set themselves before splicing them out.
    fn splice_out(&mut self, handle: BufferHandle) {
        let (prev, next) = {
            let rec = self.arena.get(handle);
            (rec.prev, rec.next)
        };
        match prev {
            Some(p) => self.arena.get_mut(p).next = next,
            None => self.head = next.expect("cannot splice out the only buffer in the region"),
        }
        match next {
            Some(n) => self.arena.get_mut(n).prev = prev,
            None => self.tail = prev.expect("cannot splice out the only buffer in the region"),
        }
        self.arena.remove(handle);
    }

    pub(crate) fn new_buf_locked(
        &mut self,
        pages: &dyn PageAllocator,
        data_size: usize,
        offsets_size: usize,
        size: usize,
        is_async: bool,
        spare: BufferRecord,
    ) -> Result<BufferHandle, AllocError> {
        let chosen = self
            .free_set
            .iter()
            .map(|&(_, h)| h)
            .find(|&h| self.buffer_size(h) >= size)
            .ok_or(AllocError::NoSpace)?;

        let hole_size = self.buffer_size(chosen);
        let chosen_user_data = self.arena.get(chosen).user_data;
        self.free_set.remove(&(chosen_user_data, chosen));

        let mut remainder_handle = None;
        if hole_size > size {
            let mut remainder = spare;
            remainder.user_data = chosen_user_data + size;
            remainder.free = true;
            let old_next = self.arena.get(chosen).next;
            let handle = self.arena.insert(remainder);
            remainder_handle = Some(handle);

            self.arena.get_mut(chosen).next = Some(handle);
            self.arena.get_mut(handle).prev = Some(chosen);
            self.arena.get_mut(handle).next = old_next;
            match old_next {
                Some(n) => self.arena.get_mut(n).prev = Some(handle),
                None => self.tail = handle,
            }
            self.free_set.insert((chosen_user_data + size, handle));
        }
        // else: `spare` is simply dropped, unused.

        let has_page_addr = page_floor(chosen_user_data + hole_size, self.page_size());
        let mut end_page_addr = page_align_up(chosen_user_data + size, self.page_size());
        if end_page_addr > has_page_addr {
            end_page_addr = has_page_addr;
        }
        let start_page_addr = page_floor(chosen_user_data, self.page_size());
        let mut newly_materialized = Vec::new();
        if let Err(e) = self.materialize_range(pages, start_page_addr, end_page_addr, &mut newly_materialized) {
            // Roll back: un-materialize exactly the pages this call just
            // materialized (leaving untouched any page that was already
            // resident, e.g. shared with a live neighbour), undo the split
            // (if any), and restore `chosen` as the sole free hole it was
            // before this call. A failed allocation must leave the region
            // unchanged.
            for index in newly_materialized {
                self.page_map.set_materialized(index, false);
            }
            if let Some(handle) = remainder_handle {
                self.free_set.remove(&(chosen_user_data + size, handle));
                self.splice_out(handle);
            }
            self.free_set.insert((chosen_user_data, chosen));
            return Err(e);
        }

        {
            let rec = self.arena.get_mut(chosen);
            rec.free = false;
            rec.allow_user_free = false;
            rec.has_transaction = false;
            rec.async_transaction = is_async;
            rec.clear_on_free = false;
            rec.data_size = data_size;
            rec.offsets_size = offsets_size;
        }
        self.allocated_set.insert(chosen_user_data, chosen);
        trace!("alloc buffer user_data={:#x} size={}", chosen_user_data, size);
        Ok(chosen)
    }

    pub(crate) fn prepare_to_free_locked(&mut self, user_ptr: usize) -> Option<BufferHandle> {
        let handle = *self.allocated_set.get(&user_ptr)?;
        let rec = self.arena.get_mut(handle);
        if !rec.allow_user_free {
            log::error!("pid buffer at {:#x} not authorised for user free", user_ptr);
            debug_assert!(false, "buffer not authorised for user free");
            return None;
        }
        rec.allow_user_free = false;
        Some(handle)
    }

    pub(crate) fn free_buf_locked(&mut self, handle: BufferHandle) {
        {
            let rec = self.arena.get(handle);
            assert!(!rec.free, "double free of buffer");
            assert!(!rec.has_transaction, "free of buffer with a live transaction");
            assert!(rec.user_data < self.len, "buffer user_data outside region");
            let logical_size = sanitized_size(rec.data_size, rec.offsets_size, 0);
            assert!(
                logical_size <= self.buffer_size(handle),
                "buffer's recorded data/offsets size exceeds its hole"
            );
        }

        if self.arena.get(handle).clear_on_free {
            self.clear_buffer_bytes(handle);
            self.arena.get_mut(handle).clear_on_free = false;
        }

        self.arena.get_mut(handle).free = true;
        let user_data = self.arena.get(handle).user_data;
        self.allocated_set.remove(&user_data);

        let mut survivor = handle;

        if let Some(next) = self.arena.get(survivor).next {
            if self.arena.get(next).free {
                let next_user_data = self.arena.get(next).user_data;
                self.free_set.remove(&(next_user_data, next));
                self.splice_out(next);
            }
        }

        if let Some(prev) = self.arena.get(survivor).prev {
            if self.arena.get(prev).free {
                self.splice_out(survivor);
                survivor = prev;
            }
        }

        self.release_wholly_contained(survivor);
        let survivor_user_data = self.arena.get(survivor).user_data;
        self.free_set.insert((survivor_user_data, survivor));
        trace!("free buffer settled at user_data={:#x}", survivor_user_data);
    }

    pub(crate) fn copy_to_buffer_locked(
        &mut self,
        handle: BufferHandle,
        offset: usize,
        src: &[u8],
    ) -> Result<(), AllocError> {
        let rec = self.arena.get(handle);
        let size = self.buffer_size(handle);
        let safe = size >= offset.saturating_add(src.len())
            && offset % 4 == 0
            && !rec.free
            && (!rec.allow_user_free || !rec.has_transaction);
        if !safe {
            return Err(AllocError::InvalidArgument);
        }
        self.walk_pages(handle, offset, src.len(), |region, dst_range, cursor| {
            let len = dst_range_len(&dst_range);
            region.backing[dst_range].copy_from_slice(&src[cursor..cursor + len]);
        });
        Ok(())
    }

    pub(crate) fn copy_from_buffer_locked(
        &mut self,
        handle: BufferHandle,
        offset: usize,
        dst: &mut [u8],
    ) -> Result<(), AllocError> {
        let rec = self.arena.get(handle);
        let size = self.buffer_size(handle);
        let safe = size >= offset.saturating_add(dst.len())
            && offset % 4 == 0
            && !rec.free
            && (!rec.allow_user_free || !rec.has_transaction);
        if !safe {
            return Err(AllocError::InvalidArgument);
        }
        self.walk_pages(handle, offset, dst.len(), |region, src_range, cursor| {
            let len = dst_range_len(&src_range);
            dst[cursor..cursor + len].copy_from_slice(&region.backing[src_range]);
        });
        Ok(())
    }

    fn walk_pages(
        &mut self,
        handle: BufferHandle,
        offset: usize,
        bytes: usize,
        mut step: impl FnMut(&mut Self, std::ops::Range<usize>, usize),
    ) {
        let page_size = self.page_size();
        let base = self.arena.get(handle).user_data;
        let mut remaining = bytes;
        let mut buffer_offset = offset;
        let mut cursor = 0usize;

        while remaining > 0 {
            let space_offset = base + buffer_offset;
            let in_page_offset = space_offset % page_size;
            let chunk = remaining.min(page_size - in_page_offset);
            let range = space_offset..space_offset + chunk;
            step(self, range, cursor);
            remaining -= chunk;
            buffer_offset += chunk;
            cursor += chunk;
        }
    }

    pub(crate) fn clear_buffer_bytes(&mut self, handle: BufferHandle) {
        let len = self.buffer_size(handle);
        self.walk_pages(handle, 0, len, |region, range, _cursor| {
            region.backing[range].fill(0);
        });
    }

    pub(crate) fn live_buffer_handles(&self) -> Vec<BufferHandle> {
        self.allocated_set.values().copied().collect()
    }

    /// Free every still-live buffer through the normal free path (so they
    /// coalesce the same as a caller-driven `free_buf` would), then drain
    /// the now fully-free address-ordered list. Returns what each live
    /// buffer looked like just before it was freed, for leak reporting.
    pub(crate) fn deferred_release_locked(&mut self) -> Vec<BufferRecord> {
        let live = self.live_buffer_handles();
        let mut leaked = Vec::with_capacity(live.len());
        for handle in live {
            leaked.push(self.arena.get(handle).clone());
            self.free_buf_locked(handle);
        }
        self.drain_all_records();
        leaked
    }

    pub(crate) fn drain_all_records(&mut self) -> Vec<(BufferHandle, BufferRecord)> {
        let mut out = Vec::new();
        let mut cursor = Some(self.head);
        while let Some(h) = cursor {
            let rec = self.arena.get(h);
            cursor = rec.next;
            out.push((h, self.arena.remove(h)));
        }
        out
    }

    pub(crate) fn resident_page_count(&self) -> usize { self.page_map.resident_count() }

    pub(crate) fn page_map_len(&self) -> usize { self.page_map.len() }

    pub(crate) fn len(&self) -> usize { self.len }

    pub(crate) fn set_clear_on_free(&mut self, handle: BufferHandle, value: bool) {
        self.arena.get_mut(handle).clear_on_free = value;
    }

    pub(crate) fn set_transaction(&mut self, handle: BufferHandle, present: bool) {
        self.arena.get_mut(handle).has_transaction = present;
    }

    pub(crate) fn set_allow_user_free(&mut self, handle: BufferHandle, value: bool) {
        self.arena.get_mut(handle).allow_user_free = value;
    }

    pub(crate) fn buffer_user_data(&self, handle: BufferHandle) -> usize { self.arena.get(handle).user_data }
    pub(crate) fn buffer_data_size(&self, handle: BufferHandle) -> usize { self.arena.get(handle).data_size }
    pub(crate) fn buffer_offsets_size(&self, handle: BufferHandle) -> usize { self.arena.get(handle).offsets_size }
    pub(crate) fn buffer_is_async(&self, handle: BufferHandle) -> bool { self.arena.get(handle).async_transaction }
}

fn dst_range_len(r: &std::ops::Range<usize>) -> usize { r.end - r.start }

pub(crate) fn map_new_region(pages: &dyn PageAllocator, area: MapArea) -> Result<Region, AllocError> {
    let page_size = pages.page_size();
    let len = area.size.min(MAX_REGION_SIZE);
    let len = page_align_up(len, page_size).min(page_align_up(MAX_REGION_SIZE, page_size));
    debug_assert!(is_page_aligned(len, page_size), "region length must be page-aligned after rounding");
    let backing = pages.alloc_region(len)?;
    let page_map = PageMap::new(len, page_size);
    let mut arena = BufferArena::default();
    let whole_region = arena.insert(BufferRecord::hole(0));
    let mut free_set = BTreeSet::new();
    free_set.insert((0usize, whole_region));
    debug!("mapped region of {} bytes ({} pages)", len, len / page_size);
    Ok(Region {
        len,
        backing,
        page_map,
        arena,
        free_set,
        allocated_set: BTreeMap::new(),
        head: whole_region,
        tail: whole_region,
    })
}

pub(crate) fn sanitize(data_size: usize, offsets_size: usize, secctx_size: usize) -> usize {
    sanitized_size(data_size, offsets_size, secctx_size)
}
