//! Per-process shared-memory buffer allocator for a Binder-style IPC
//! transport.
//!
//! Each process that talks to the driver gets exactly one [`BinderAlloc`],
//! backed by one contiguous mapped region (up to 4 MiB) that is carved up
//! into the buffers the transport lends across the process boundary. The
//! region is a flat byte arena with lazily materialised pages and a
//! first-fit free list; see `DESIGN.md` for how that differs from the
//! intrusive-list, page-table-walking original this crate is modelled on.

mod buffer;
mod error;
mod page;
mod region;
mod size;

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

pub use buffer::BufferHandle;
pub use error::AllocError;
pub use page::{PageAllocator, SystemPageAllocator};
pub use region::MapArea;

use buffer::BufferRecord;
use region::Region;

/// Fixed parameters for a single allocator instance.
///
/// Mirrors the small bundle of arguments the source passes into
/// `binder_alloc_init`/`binder_alloc_mmap` individually; bundling them here
/// keeps `BinderAlloc::new` from growing an unreadable parameter list as the
/// ambient configuration surface (page allocator choice, owning pid) grows.
#[derive(Clone)]
pub struct BinderAllocConfig {
    /// Identifier of the process this allocator serves. Used only for
    /// diagnostics: log lines and the description carried by errors.
    pub pid: u32,
    /// Backing-page collaborator. Defaults to [`SystemPageAllocator`].
    pub pages: Arc<dyn PageAllocator>,
}

impl BinderAllocConfig {
    pub fn new(pid: u32) -> Self {
        BinderAllocConfig { pid, pages: Arc::new(SystemPageAllocator::default()) }
    }

    pub fn with_pages(pid: u32, pages: Arc<dyn PageAllocator>) -> Self {
        BinderAllocConfig { pid, pages }
    }
}

/// Description of a lent buffer, returned to callers that need to know
/// where it lives and how big the caller-visible parts are.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferInfo {
    pub handle: BufferHandle,
    pub user_data: usize,
    pub data_size: usize,
    pub offsets_size: usize,
    pub is_async: bool,
}

/// One process's allocator over one shared-memory region.
///
/// The region itself lives behind a `Mutex`, the same collaborator the
/// source takes the `binder_alloc::mutex` role of; everything here is
/// `new_buf`/`free_buf`/`prepare_to_free` safe to call from multiple
/// threads.
pub struct BinderAlloc {
    pid: u32,
    pages: Arc<dyn PageAllocator>,
    region: Mutex<Option<Region>>,
}

impl BinderAlloc {
    /// Construct an allocator with no backing region yet. Matches
    /// `binder_alloc_init`: cheap, infallible, and does not touch memory.
    pub fn init(config: BinderAllocConfig) -> Self {
        debug!("binder_alloc: init for pid {}", config.pid);
        BinderAlloc { pid: config.pid, pages: config.pages, region: Mutex::new(None) }
    }

    pub fn pid(&self) -> u32 { self.pid }

    /// Map the backing region. Fails with [`AllocError::AlreadyMapped`] if
    /// called twice, and with [`AllocError::OutOfMemory`] if the backing
    /// allocation or bookkeeping tables cannot be obtained, leaving the
    /// allocator unmapped either way (the source's unwind-on-failure path
    /// in `binder_alloc_mmap`).
    pub fn mmap(&self, area: MapArea) -> Result<(), AllocError> {
        let mut guard = self.region.lock().expect("region mutex poisoned");
        if guard.is_some() {
            warn!("pid {}: mmap called on an already-mapped region", self.pid);
            return Err(AllocError::AlreadyMapped);
        }
        let mapped = region::map_new_region(self.pages.as_ref(), area)?;
        info!("pid {}: mapped {} byte region", self.pid, mapped.len());
        *guard = Some(mapped);
        Ok(())
    }

    /// Tear down the region immediately. Any buffers still outstanding are
    /// simply dropped along with their records; callers are expected to
    /// have gone through [`BinderAlloc::deferred_release`] first if they
    /// need per-buffer cleanup notifications.
    pub fn unmap(&self, _area: MapArea) {
        let mut guard = self.region.lock().expect("region mutex poisoned");
        if guard.take().is_some() {
            info!("pid {}: unmapped region", self.pid);
        }
    }

    /// Release the region and report every buffer that was still live at
    /// the time, for a caller (e.g. a transaction layer) that needs to run
    /// teardown notifications before the memory actually disappears.
    /// Mirrors `binder_alloc_deferred_release`.
    pub fn deferred_release(&self) -> Vec<BufferInfo> {
        let mut guard = self.region.lock().expect("region mutex poisoned");
        let Some(mut region) = guard.take() else {
            return Vec::new();
        };
        let resident = region.resident_page_count();
        let total = region.page_map_len();
        let handles = region.live_buffer_handles();
        let records = region.deferred_release_locked();
        let leaked: Vec<BufferInfo> = handles
            .into_iter()
            .zip(records)
            .map(|(handle, rec)| BufferInfo {
                handle,
                user_data: rec.user_data,
                data_size: rec.data_size,
                offsets_size: rec.offsets_size,
                is_async: rec.async_transaction,
            })
            .collect();
        if !leaked.is_empty() {
            warn!(
                "pid {}: released region with {} outstanding buffer(s), {}/{} pages resident",
                self.pid,
                leaked.len(),
                resident,
                total
            );
        } else {
            debug!("pid {}: released region cleanly ({} pages resident)", self.pid, resident);
        }
        leaked
    }

    /// Allocate a new buffer sized to fit `data_size` + `offsets_size` +
    /// `secctx_size` bytes, first-fit from the free list, splitting the
    /// chosen hole if it is larger than needed.
    pub fn new_buf(
        &self,
        data_size: usize,
        offsets_size: usize,
        secctx_size: usize,
        is_async: bool,
    ) -> Result<BufferInfo, AllocError> {
        let size = region::sanitize(data_size, offsets_size, secctx_size);
        if size == 0 {
            return Err(AllocError::InvalidArgument);
        }
        let mut guard = self.region.lock().expect("region mutex poisoned");
        let region = guard.as_mut().ok_or(AllocError::InvalidArgument)?;
        let handle = region.new_buf_locked(
            self.pages.as_ref(),
            data_size,
            offsets_size,
            size,
            is_async,
            BufferRecord::hole(0),
        )?;
        Ok(BufferInfo {
            handle,
            user_data: region.buffer_user_data(handle),
            data_size: region.buffer_data_size(handle),
            offsets_size: region.buffer_offsets_size(handle),
            is_async: region.buffer_is_async(handle),
        })
    }

    /// Authorise a buffer for the user-initiated free path, matching
    /// `binder_alloc_prepare_to_free`. Returns `None` if there is no live
    /// buffer at `user_data`, or if it is already authorised (a protocol
    /// error logged but not propagated, as in the source).
    pub fn prepare_to_free(&self, user_data: usize) -> Option<BufferHandle> {
        let mut guard = self.region.lock().expect("region mutex poisoned");
        let region = guard.as_mut()?;
        region.prepare_to_free_locked(user_data)
    }

    /// Mark a transaction as pending or resolved on a buffer, gating the
    /// free path's `has_transaction` assertion and the mid-flight copy
    /// window in `copy_to_buffer`/`copy_from_buffer`.
    pub fn set_transaction(&self, handle: BufferHandle, present: bool) {
        let mut guard = self.region.lock().expect("region mutex poisoned");
        if let Some(region) = guard.as_mut() {
            region.set_transaction(handle, present);
        }
    }

    pub fn set_clear_on_free(&self, handle: BufferHandle, value: bool) {
        let mut guard = self.region.lock().expect("region mutex poisoned");
        if let Some(region) = guard.as_mut() {
            region.set_clear_on_free(handle, value);
        }
    }

    pub fn set_allow_user_free(&self, handle: BufferHandle, value: bool) {
        let mut guard = self.region.lock().expect("region mutex poisoned");
        if let Some(region) = guard.as_mut() {
            region.set_allow_user_free(handle, value);
        }
    }

    /// Release a buffer back to the free list, coalescing with free
    /// neighbours and releasing any pages that end up wholly outside every
    /// remaining live buffer. Panics on the internal misuse the source
    /// treats as a kernel bug: freeing an already-free buffer or one with a
    /// live transaction.
    pub fn free_buf(&self, handle: BufferHandle) {
        let mut guard = self.region.lock().expect("region mutex poisoned");
        if let Some(region) = guard.as_mut() {
            region.free_buf_locked(handle);
        }
    }

    /// Copy `src` into the buffer at `offset`. Fails with
    /// [`AllocError::InvalidArgument`] if the buffer is free, the copy
    /// would run past its end, the offset is not 4-byte aligned, or the
    /// buffer is mid-teardown (authorised for user free with no pending
    /// transaction).
    pub fn copy_to_buffer(&self, handle: BufferHandle, offset: usize, src: &[u8]) -> Result<(), AllocError> {
        let mut guard = self.region.lock().expect("region mutex poisoned");
        let region = guard.as_mut().ok_or(AllocError::InvalidArgument)?;
        region.copy_to_buffer_locked(handle, offset, src)
    }

    /// Copy out of the buffer at `offset`, under the same safety checks as
    /// [`BinderAlloc::copy_to_buffer`].
    pub fn copy_from_buffer(&self, handle: BufferHandle, offset: usize, dst: &mut [u8]) -> Result<(), AllocError> {
        let mut guard = self.region.lock().expect("region mutex poisoned");
        let region = guard.as_mut().ok_or(AllocError::InvalidArgument)?;
        region.copy_from_buffer_locked(handle, offset, dst)
    }

    /// Number of buffers currently lent out, for diagnostics/tests.
    pub fn live_buffer_count(&self) -> usize {
        let guard = self.region.lock().expect("region mutex poisoned");
        guard.as_ref().map(|r| r.live_buffer_handles().len()).unwrap_or(0)
    }

    /// Count of pages currently backed by real memory, for diagnostics.
    pub fn resident_page_count(&self) -> usize {
        let guard = self.region.lock().expect("region mutex poisoned");
        guard.as_ref().map(|r| r.resident_page_count()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::test_support::FaultInjectingPageAllocator;

    fn alloc(region_size: usize) -> BinderAlloc {
        let a = BinderAlloc::init(BinderAllocConfig::new(1));
        a.mmap(MapArea { size: region_size }).unwrap();
        a
    }

    #[test]
    fn mmap_twice_fails() {
        let a = alloc(16 * 1024);
        assert_eq!(a.mmap(MapArea { size: 4096 }), Err(AllocError::AlreadyMapped));
    }

    #[test]
    fn new_buf_before_mmap_is_invalid_argument() {
        let a = BinderAlloc::init(BinderAllocConfig::new(1));
        assert_eq!(a.new_buf(8, 0, 0, false), Err(AllocError::InvalidArgument));
    }

    #[test]
    fn allocate_free_and_roundtrip_copy() {
        let a = alloc(16 * 1024);
        let info = a.new_buf(64, 0, 0, false).unwrap();
        assert_eq!(a.live_buffer_count(), 1);

        let payload = [0xABu8; 64];
        a.copy_to_buffer(info.handle, 0, &payload).unwrap();
        let mut out = [0u8; 64];
        a.copy_from_buffer(info.handle, 0, &mut out).unwrap();
        assert_eq!(payload, out);

        a.free_buf(info.handle);
        assert_eq!(a.live_buffer_count(), 0);
    }

    #[test]
    fn freeing_fully_drains_resident_pages() {
        let a = alloc(16 * 1024);
        let first = a.new_buf(104, 0, 0, false).unwrap();
        let second = a.new_buf(200, 0, 0, false).unwrap();
        assert!(a.resident_page_count() > 0);

        a.free_buf(first.handle);
        a.free_buf(second.handle);
        assert_eq!(a.resident_page_count(), 0, "no live buffers should leave no resident pages");
    }

    #[test]
    fn exhausting_the_region_reports_no_space() {
        let a = alloc(4096);
        assert!(a.new_buf(4096, 0, 0, false).is_ok());
        assert_eq!(a.new_buf(8, 0, 0, false), Err(AllocError::NoSpace));
    }

    #[test]
    fn misaligned_copy_offset_is_rejected() {
        let a = alloc(4096);
        let info = a.new_buf(64, 0, 0, false).unwrap();
        let mut out = [0u8; 4];
        assert_eq!(a.copy_from_buffer(info.handle, 1, &mut out), Err(AllocError::InvalidArgument));
    }

    #[test]
    fn copy_past_buffer_end_is_rejected() {
        let a = alloc(4096);
        let info = a.new_buf(64, 0, 0, false).unwrap();
        let mut out = [0u8; 128];
        assert_eq!(a.copy_from_buffer(info.handle, 0, &mut out), Err(AllocError::InvalidArgument));
    }

    #[test]
    fn deferred_release_reports_outstanding_buffers() {
        let a = alloc(16 * 1024);
        let info = a.new_buf(32, 0, 0, true).unwrap();
        let leaked = a.deferred_release();
        assert_eq!(leaked.len(), 1);
        assert_eq!(leaked[0].user_data, info.user_data);
        assert!(leaked[0].is_async);
        assert_eq!(a.live_buffer_count(), 0);
    }

    #[test]
    fn prepare_to_free_requires_a_live_buffer() {
        let a = alloc(4096);
        assert!(a.prepare_to_free(0).is_none());
        let info = a.new_buf(32, 0, 0, false).unwrap();
        a.set_allow_user_free(info.handle, true);
        assert_eq!(a.prepare_to_free(info.user_data), Some(info.handle));
    }

    #[test]
    fn mmap_reports_allocator_failure() {
        let pages = Arc::new(FaultInjectingPageAllocator::new(4096, 0));
        let a = BinderAlloc::init(BinderAllocConfig::with_pages(1, pages));
        assert_eq!(a.mmap(MapArea { size: 16 * 1024 }), Err(AllocError::OutOfMemory));
    }

    #[test]
    fn new_buf_rolls_back_the_split_on_materialize_failure() {
        let pages = Arc::new(FaultInjectingPageAllocator::failing_materialize_after(4096, 0));
        let a = BinderAlloc::init(BinderAllocConfig::with_pages(1, pages));
        a.mmap(MapArea { size: 8192 }).unwrap();

        // Splits the whole-region hole into [0, 4096) + [4096, 8192); the
        // materialize call for page 0 then fails.
        assert_eq!(a.new_buf(4096, 0, 0, false), Err(AllocError::OutOfMemory));
        assert_eq!(a.live_buffer_count(), 0);
        assert_eq!(a.resident_page_count(), 0);

        // The hole must be exactly as whole as before the failed split, or
        // a request for the entire region would not fit.
        assert!(a.new_buf(8192, 0, 0, false).is_ok());
    }
}
