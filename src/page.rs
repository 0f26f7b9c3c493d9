use crate::error::AllocError;

/// The physical-page backing collaborator.
///
/// The allocator never touches real physical memory itself; it asks this
/// trait for a page-aligned backing region at `mmap` time and treats every
/// page inside it as lazily "materialised" bookkeeping from then on. A real
/// kernel port backs this with actual page-table manipulation; the hosted
/// implementation here (`SystemPageAllocator`) just hands back zeroed heap
/// memory, since userspace has no separate notion of a physical page.
pub trait PageAllocator: Send + Sync {
    /// Page size in bytes. Must be a power of two.
    fn page_size(&self) -> usize;

    /// Allocate a zeroed, page-aligned backing region of `size` bytes.
    fn alloc_region(&self, size: usize) -> Result<Vec<u8>, AllocError>;

    /// Materialise (back with physical memory) the page at `page_index`
    /// within a previously allocated region. Infallible in the hosted
    /// implementation, since the whole region is already backed; a port
    /// that defers real physical commit can fail here.
    fn materialize_page(&self, page_index: usize) -> Result<(), AllocError> {
        let _ = page_index;
        Ok(())
    }
}

/// Default collaborator: backs the region with an ordinary heap allocation.
#[derive(Debug, Clone, Copy)]
pub struct SystemPageAllocator {
    page_size: usize,
}

impl SystemPageAllocator {
    pub fn new(page_size: usize) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        SystemPageAllocator { page_size }
    }
}

impl Default for SystemPageAllocator {
    fn default() -> Self { SystemPageAllocator::new(4096) }
}

impl PageAllocator for SystemPageAllocator {
    fn page_size(&self) -> usize { self.page_size }

    fn alloc_region(&self, size: usize) -> Result<Vec<u8>, AllocError> {
        // A real port would request page-aligned memory from the platform;
        // a Vec<u8> is always suitably aligned for byte-granular access here.
        Vec::try_reserve_exact(&mut Vec::<u8>::new(), size)
            .map_err(|_| AllocError::OutOfMemory)?;
        Ok(vec![0u8; size])
    }
}

/// Flat residency map mirroring the region at page granularity.
pub(crate) struct PageMap {
    materialized: Vec<bool>,
    page_size: usize,
}

impl PageMap {
    pub(crate) fn new(region_len: usize, page_size: usize) -> Self {
        debug_assert_eq!(region_len % page_size, 0, "region length must be a multiple of page size");
        PageMap { materialized: vec![false; region_len / page_size], page_size }
    }

    pub(crate) fn page_size(&self) -> usize { self.page_size }

    pub(crate) fn is_materialized(&self, page_index: usize) -> bool { self.materialized[page_index] }

    pub(crate) fn set_materialized(&mut self, page_index: usize, value: bool) {
        self.materialized[page_index] = value;
    }

    pub(crate) fn len(&self) -> usize { self.materialized.len() }

    /// Count of currently-materialised pages, used for deferred-release
    /// diagnostics.
    pub(crate) fn resident_count(&self) -> usize { self.materialized.iter().filter(|m| **m).count() }
}

pub(crate) fn page_floor(addr: usize, page_size: usize) -> usize { addr & !(page_size - 1) }

pub(crate) fn page_align_up(addr: usize, page_size: usize) -> usize {
    (addr + page_size - 1) & !(page_size - 1)
}

pub(crate) fn is_page_aligned(addr: usize, page_size: usize) -> bool { addr & (page_size - 1) == 0 }

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Page allocator double that can be told to fail the Nth region
    /// allocation or the Nth page materialization, to exercise `mmap`'s and
    /// `new_buf`'s unwind-on-failure paths. A counter at `usize::MAX` never
    /// runs down far enough to fail within a test.
    pub struct FaultInjectingPageAllocator {
        page_size: usize,
        fail_after: AtomicUsize,
        fail_materialize_after: AtomicUsize,
    }

    impl FaultInjectingPageAllocator {
        pub fn new(page_size: usize, fail_after: usize) -> Self {
            FaultInjectingPageAllocator {
                page_size,
                fail_after: AtomicUsize::new(fail_after),
                fail_materialize_after: AtomicUsize::new(usize::MAX),
            }
        }

        pub fn failing_materialize_after(page_size: usize, fail_after: usize) -> Self {
            FaultInjectingPageAllocator {
                page_size,
                fail_after: AtomicUsize::new(usize::MAX),
                fail_materialize_after: AtomicUsize::new(fail_after),
            }
        }
    }

    fn countdown_fails(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| if v == 0 { None } else { Some(v - 1) })
            .is_err()
    }

    impl PageAllocator for FaultInjectingPageAllocator {
        fn page_size(&self) -> usize { self.page_size }

        fn alloc_region(&self, size: usize) -> Result<Vec<u8>, AllocError> {
            if countdown_fails(&self.fail_after) {
                return Err(AllocError::OutOfMemory);
            }
            Ok(vec![0u8; size])
        }

        fn materialize_page(&self, _page_index: usize) -> Result<(), AllocError> {
            if countdown_fails(&self.fail_materialize_after) {
                return Err(AllocError::OutOfMemory);
            }
            Ok(())
        }
    }

    #[test]
    fn page_floor_and_align_up() {
        assert_eq!(page_floor(0, 4096), 0);
        assert_eq!(page_floor(4095, 4096), 0);
        assert_eq!(page_floor(4096, 4096), 4096);
        assert_eq!(page_align_up(0, 4096), 0);
        assert_eq!(page_align_up(1, 4096), 4096);
        assert_eq!(page_align_up(4096, 4096), 4096);
        assert!(is_page_aligned(0, 4096));
        assert!(!is_page_aligned(1, 4096));
    }
}
