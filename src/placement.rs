//! Small helpers shared by every engine that hands a block to, or takes one
//! from, the free-list index: where a free block belongs, and how to flip a
//! neighbor's `PREV_BLOCK_ALLOCATED` bit.

use crate::block::{BlockView, Tag};
use crate::freelist::{FreeLists, WILDERNESS_LIST};
use crate::page_source::PageSource;
use crate::region::Region;

/// Insert a free block into the index it belongs to.
///
/// A block that physically abuts the epilogue is the wilderness block and
/// always goes to list 9, regardless of its size; every other free block is
/// routed by `list_index(size)`.
pub(crate) fn place_free<P: PageSource>(
    region: &Region<P>,
    lists: &mut FreeLists,
    addr: usize,
    size: usize,
) {
    if addr + size == region.epilogue_addr() {
        lists.insert_into(WILDERNESS_LIST, addr);
    } else {
        lists.insert(addr, size);
    }
}

/// Set the `PREV_BLOCK_ALLOCATED` bit of the block at `addr` (which may be
/// the epilogue). Mirrors the update into the footer too when that block is
/// free, since header and footer must agree.
pub(crate) fn set_prev_alloc_bit<P: PageSource>(addr: usize, region: &Region<P>, prev_alloc: bool) {
    let view = BlockView::at(addr);
    let tag: Tag = unsafe { view.header() };
    let updated = tag.with_prev_alloc(prev_alloc);
    unsafe {
        view.set_header(updated);
    }
    if addr != region.epilogue_addr() && !tag.this_alloc() {
        unsafe {
            view.set_footer(tag.size(), updated);
        }
    }
}
