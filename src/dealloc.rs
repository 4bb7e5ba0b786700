//! Free engine (C6): pointer validation and the fatal-abort contract.

use crate::block::{BlockView, HEADER_SIZE, MIN_PAYLOAD_ALIGN, Q};
use crate::coalesce;
use crate::freelist::FreeLists;
use crate::page_source::PageSource;
use crate::placement;
use crate::region::Region;
use log::error;

/// Validate `payload_addr` against every precondition `free`/`realloc` place
/// on a client-supplied pointer. Returns the block's header address on
/// success.
///
/// Any failure here is a client contract violation, not a recoverable
/// error: the caller must abort rather than propagate a `Result`.
fn validate_for_free<P: PageSource>(region: &Region<P>, payload_addr: usize) -> Option<usize> {
    if payload_addr % MIN_PAYLOAD_ALIGN != 0 {
        return None;
    }

    let header_addr = payload_addr.checked_sub(HEADER_SIZE)?;
    if header_addr <= region.prologue_addr() || header_addr >= region.epilogue_addr() {
        return None;
    }

    let view = BlockView::at(header_addr);
    let tag = unsafe { view.header() };
    if !tag.this_alloc() {
        return None;
    }
    if tag.size() < Q || tag.size() % Q != 0 {
        return None;
    }
    if header_addr + tag.size() > region.epilogue_addr() {
        return None;
    }

    // Only the "previous block is free" claim has anything to cross-check
    // against: a free block is the only kind with a footer, so a boundary-tag
    // read immediately before our header is only meaningful in that case. An
    // allocated predecessor (including the prologue) leaves no redundant
    // footer to compare against, so that claim is trusted as bookkeeping.
    if !tag.prev_alloc() {
        let prev = unsafe { view.prev() };
        let prev_tag = unsafe { prev.header() };
        if prev_tag.this_alloc() {
            return None;
        }
    }

    Some(header_addr)
}

/// `free(p)`. Aborts the process on any contract violation; never returns
/// in that case.
pub(crate) fn free<P: PageSource>(region: &mut Region<P>, lists: &mut FreeLists, payload_addr: usize) {
    let Some(header_addr) = validate_for_free(region, payload_addr) else {
        error!("free: invalid pointer 0x{payload_addr:x}, aborting");
        abort();
    };

    let view = BlockView::at(header_addr);
    let tag = unsafe { view.header() };
    let size = tag.size();
    unsafe {
        view.write_free(size, tag.prev_alloc());
    }

    let (addr, merged_size) = unsafe { coalesce::coalesce(region, lists, header_addr, size) };
    placement::place_free(region, lists, addr, merged_size);
}

/// Terminate the process in response to a client contract violation. This
/// crate carries no `std::process::abort` dependency: in a freestanding
/// build the embedder's panic handler (compiled with `panic = "abort"`)
/// takes over, and the same `panic!` is caught as a test failure here.
pub(crate) fn abort() -> ! {
    panic!("heap contract violation")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::malloc;
    use crate::freelist::FreeLists;
    use crate::page_source::test_support::VecPageSource;

    fn setup() -> (Region<VecPageSource>, FreeLists) {
        (Region::new(VecPageSource::with_max_pages(4)), FreeLists::new())
    }

    #[test]
    fn free_of_malloced_block_returns_it_to_a_list() {
        let (mut region, mut lists) = setup();
        let p = malloc(&mut region, &mut lists, 4).unwrap().unwrap();
        free(&mut region, &mut lists, p);
        assert!(lists.has_wilderness());
    }

    #[test]
    fn validate_rejects_misaligned_pointer() {
        let (region, _lists) = setup();
        assert!(validate_for_free(&region, 1).is_none());
    }

    #[test]
    #[should_panic]
    fn free_of_garbage_pointer_aborts() {
        let (mut region, mut lists) = setup();
        let _ = malloc(&mut region, &mut lists, 4).unwrap().unwrap();
        free(&mut region, &mut lists, 16);
    }

    #[test]
    #[should_panic]
    fn double_free_aborts() {
        let (mut region, mut lists) = setup();
        let p = malloc(&mut region, &mut lists, 4).unwrap().unwrap();
        free(&mut region, &mut lists, p);
        free(&mut region, &mut lists, p);
    }
}
