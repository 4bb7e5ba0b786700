//! Coalescing engine (C5).
//!
//! Merges a free block — not yet linked into any free list — with whichever
//! of its physical neighbors are also free. Any neighbor that participates
//! is first unlinked from its own list; the caller is responsible for
//! inserting the merged result (see [`crate::placement::place_free`]), so
//! this module never needs to know about the wilderness special case.

use crate::block::{BlockView, Tag};
use crate::freelist::FreeLists;
use crate::page_source::PageSource;
use crate::region::Region;

/// Merge the free block at `addr` (of `size` bytes, header/footer already
/// written, not yet linked) with any free neighbors. Returns the merged
/// block's address and size.
///
/// # Safety
/// `addr` must name a block whose header and footer are already written as
/// free, and that is not currently linked into any free list.
pub(crate) unsafe fn coalesce<P: PageSource>(
    region: &Region<P>,
    lists: &mut FreeLists,
    addr: usize,
    size: usize,
) -> (usize, usize) {
    let block = BlockView::at(addr);
    let mut merged_addr = addr;
    let mut merged_size = size;
    let mut prev_alloc = unsafe { block.header() }.prev_alloc();

    if !prev_alloc {
        let prev = unsafe { block.prev() };
        let prev_tag = unsafe { prev.header() };
        unsafe {
            lists.unlink(prev.header_addr());
        }
        merged_addr = prev.header_addr();
        merged_size += prev_tag.size();
        prev_alloc = prev_tag.prev_alloc();
    }

    let succ_addr = addr + size;
    let next_is_epilogue = succ_addr == region.epilogue_addr();
    let next_alloc = next_is_epilogue || unsafe { BlockView::at(succ_addr).header() }.this_alloc();

    if !next_alloc {
        let next = BlockView::at(succ_addr);
        let next_tag = unsafe { next.header() };
        unsafe {
            lists.unlink(next.header_addr());
        }
        merged_size += next_tag.size();
    }

    let merged = BlockView::at(merged_addr);
    unsafe {
        merged.write_free(merged_size, prev_alloc);
    }

    // The merged run absorbed at most its immediate neighbors, so whatever
    // now follows it is allocated (or the epilogue): §3 invariant 3
    // guarantees no two adjacent free blocks ever coexist, so that
    // successor cannot itself be free. Only its PREV_BLOCK_ALLOCATED bit
    // needs clearing.
    let after_addr = merged_addr + merged_size;
    let after = BlockView::at(after_addr);
    let after_tag: Tag = unsafe { after.header() };
    unsafe {
        after.set_header(after_tag.with_prev_alloc(false));
    }

    (merged_addr, merged_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Q;
    use crate::freelist::FreeLists;
    use crate::page_source::test_support::VecPageSource;

    #[test]
    fn merges_with_both_neighbors_when_both_free() {
        let mut lists = FreeLists::new();
        let mut region = Region::new(VecPageSource::with_max_pages(1));
        region.init(&mut lists).unwrap();

        // Wilderness block spans from just after the prologue to the
        // epilogue. Carve it into three adjacent blocks of equal size by
        // hand, marking the middle one allocated, to set up a coalesce.
        let wilderness_addr = lists.take_wilderness().unwrap();
        let wilderness_size = unsafe { BlockView::at(wilderness_addr).header() }.size();
        let chunk = Q * 4;
        assert!(wilderness_size >= chunk * 3);

        let a = BlockView::at(wilderness_addr);
        let b = BlockView::at(wilderness_addr + chunk);
        let c = BlockView::at(wilderness_addr + 2 * chunk);
        unsafe {
            a.write_free(chunk, true);
            b.set_header(crate::block::Tag::new(chunk, false, true));
            c.write_free(wilderness_size - 2 * chunk, false);
        }

        let (addr, size) = unsafe { coalesce(&region, &mut lists, wilderness_addr, chunk) };
        assert_eq!(addr, wilderness_addr);
        assert!(size < chunk * 2, "should not have merged with allocated b");

        // Now free b and coalesce it: it should absorb both a's leftover
        // region (already merged into one free block at `addr`) and c.
        unsafe {
            b.write_free(chunk, true);
        }
        let (addr2, size2) = unsafe { coalesce(&region, &mut lists, b.header_addr(), chunk) };
        assert_eq!(addr2, addr);
        assert_eq!(size2, wilderness_size);
    }
}
