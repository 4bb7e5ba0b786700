//! The tied-together allocator state (`Heap<P>`), its process-wide instance,
//! and the public `malloc`/`free`/`realloc`/`memalign` surface plus a
//! `GlobalAlloc` adapter.

use crate::alloc;
use crate::block::MIN_PAYLOAD_ALIGN;
use crate::dealloc;
use crate::error::{self, AllocError};
use crate::freelist::FreeLists;
use crate::memalign;
use crate::page_source::{PageSource, StaticPageSource};
use crate::realloc;
use crate::region::Region;
use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

/// Region manager plus free-list index: everything C4–C8 operate over.
pub(crate) struct Heap<P: PageSource> {
    region: Region<P>,
    lists: FreeLists,
}

impl<P: PageSource> Heap<P> {
    pub const fn new(source: P) -> Self {
        Self {
            region: Region::new(source),
            lists: FreeLists::new(),
        }
    }

    pub fn malloc(&mut self, payload_size: usize) -> Result<Option<usize>, AllocError> {
        alloc::malloc(&mut self.region, &mut self.lists, payload_size)
    }

    pub fn free(&mut self, payload_addr: usize) {
        dealloc::free(&mut self.region, &mut self.lists, payload_addr);
    }

    pub fn realloc(
        &mut self,
        payload_addr: Option<usize>,
        new_payload_size: usize,
    ) -> Result<Option<usize>, AllocError> {
        realloc::realloc(&mut self.region, &mut self.lists, payload_addr, new_payload_size)
    }

    pub fn memalign(&mut self, payload_size: usize, align: usize) -> Result<Option<usize>, AllocError> {
        memalign::memalign(&mut self.region, &mut self.lists, payload_size, align)
    }
}

#[cfg(test)]
impl<P: PageSource> Heap<P> {
    /// Crate-private introspection used by the property tests in
    /// [`crate::invariants`] to walk the block chain and free lists directly;
    /// never exposed outside `cfg(test)`.
    pub(crate) fn region(&self) -> &Region<P> {
        &self.region
    }

    pub(crate) fn lists(&self) -> &FreeLists {
        &self.lists
    }
}

impl<const CAPACITY: usize> Heap<StaticPageSource<CAPACITY>> {
    /// Patch the global instance's backing storage pointer in on first use
    /// (see [`ensure_init`]); a `static` initializer has no way to take the
    /// address of another `static mut` item directly.
    fn set_storage(&mut self, storage: *mut u8) {
        unsafe {
            self.region.source_mut().set_storage(storage);
        }
    }
}

/// A single-threaded interior-mutability wrapper exposing the teacher's
/// `with_lock` closure shape without the actual spin-lock machinery:
/// thread safety is an explicit non-goal here, so carrying unused
/// interlocking would misrepresent the concurrency model this crate
/// actually implements.
struct HeapCell<T> {
    inner: UnsafeCell<T>,
}

// Safety: every access goes through `with_mut`, and this crate's own
// concurrency model (see the crate's non-goals) is single-threaded
// cooperative; callers provide their own external synchronization if they
// share a `Heap` across threads.
unsafe impl<T> Sync for HeapCell<T> {}

impl<T> HeapCell<T> {
    const fn new(value: T) -> Self {
        Self {
            inner: UnsafeCell::new(value),
        }
    }

    fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(unsafe { &mut *self.inner.get() })
    }
}

/// Total size of the statically reserved heap backing the global allocator.
const HEAP_SIZE: usize = 64 * 1024 * 1024;

/// Backing storage for the process-wide heap, placed in its own `.bss`
/// section the way the teacher reserves `HEAP`.
#[repr(align(16))]
struct HeapMem([u8; HEAP_SIZE]);

static mut HEAP: HeapMem = HeapMem([0; HEAP_SIZE]);

static GLOBAL_HEAP: HeapCell<Heap<StaticPageSource<HEAP_SIZE>>> =
    HeapCell::new(Heap::new(unsafe { StaticPageSource::new(ptr::null_mut()) }));

/// One-time storage-pointer fixup flag: `StaticPageSource::new` needs
/// `HEAP`'s address, which a `static` initializer cannot obtain from
/// another `static mut` item, so the pointer starts out null and is patched
/// in on first use instead.
static DID_INIT: AtomicBool = AtomicBool::new(false);

fn ensure_init() {
    if !DID_INIT.load(Ordering::Acquire) {
        GLOBAL_HEAP.with_mut(|heap| {
            if !DID_INIT.load(Ordering::Relaxed) {
                let start = unsafe { (&raw mut HEAP.0).cast::<u8>() };
                heap.set_storage(start);
                DID_INIT.store(true, Ordering::Release);
            }
        });
    }
}

fn collapse(result: Result<Option<usize>, AllocError>) -> Option<usize> {
    match result {
        Ok(addr) => addr,
        Err(err) => {
            error::set_from(err);
            None
        }
    }
}

/// `malloc(size) -> ptr | null`. `size == 0` returns null without touching
/// the error indicator.
#[must_use]
pub fn malloc(size: usize) -> *mut u8 {
    ensure_init();
    GLOBAL_HEAP.with_mut(|heap| collapse(heap.malloc(size))).map_or(ptr::null_mut(), |addr| addr as *mut u8)
}

/// `free(ptr)`. `ptr` must be a live payload address returned by
/// `malloc`/`realloc`/`memalign` and not yet freed; a null pointer is a
/// no-op. Any other violation aborts the process (see [`crate::dealloc`]).
pub fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    ensure_init();
    GLOBAL_HEAP.with_mut(|heap| heap.free(ptr as usize));
}

/// `realloc(ptr, size) -> ptr | null`.
#[must_use]
pub fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    ensure_init();
    let addr = if ptr.is_null() { None } else { Some(ptr as usize) };
    GLOBAL_HEAP
        .with_mut(|heap| collapse(heap.realloc(addr, size)))
        .map_or(ptr::null_mut(), |addr| addr as *mut u8)
}

/// `memalign(size, align) -> ptr | null`.
#[must_use]
pub fn memalign(size: usize, align: usize) -> *mut u8 {
    ensure_init();
    GLOBAL_HEAP
        .with_mut(|heap| collapse(heap.memalign(size, align)))
        .map_or(ptr::null_mut(), |addr| addr as *mut u8)
}

/// Adapter exposing the process-wide heap through `core::alloc::GlobalAlloc`.
///
/// `Layout`s whose alignment exceeds [`MIN_PAYLOAD_ALIGN`] route through
/// `memalign`; everything else goes through plain `malloc`, which already
/// guarantees `MIN_PAYLOAD_ALIGN`-aligned payloads.
pub struct SegHeapAllocator;

// Not installed under `cfg(test)`: the hosted test harness needs its own
// (thread-safe) allocator for the std runtime, `Vec`, etc. Binaries that
// embed this crate for real install it themselves via the same attribute.
#[cfg(not(any(test, doctest)))]
#[global_allocator]
static GLOBAL_ALLOCATOR: SegHeapAllocator = SegHeapAllocator;

unsafe impl GlobalAlloc for SegHeapAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MIN_PAYLOAD_ALIGN {
            memalign(layout.size(), layout.align())
        } else {
            malloc(layout.size())
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        free(ptr);
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let p = unsafe { self.alloc(layout) };
        if !p.is_null() {
            unsafe { ptr::write_bytes(p, 0, layout.size()) };
        }
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_source::test_support::VecPageSource;

    #[test]
    fn heap_round_trips_malloc_free() {
        let mut heap = Heap::new(VecPageSource::with_max_pages(4));
        let p = heap.malloc(16).unwrap().unwrap();
        heap.free(p);
    }

    #[test]
    fn heap_malloc_zero_returns_none() {
        let mut heap = Heap::new(VecPageSource::with_max_pages(4));
        assert!(heap.malloc(0).unwrap().is_none());
    }
}
