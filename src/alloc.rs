//! Allocation engine (C4): size computation, candidate search, splitting.

use crate::block::{BlockView, HEADER_SIZE, Q, Tag, align_up};
use crate::coalesce;
use crate::error::AllocError;
use crate::freelist::FreeLists;
use crate::page_source::PageSource;
use crate::placement;
use crate::region::Region;
use log::trace;

/// Smallest block size that can hold `payload_size` bytes of payload plus a
/// header, rounded up to a `Q`-multiple and never below the minimum block
/// size.
#[must_use]
pub(crate) fn required_block_size(payload_size: usize) -> usize {
    align_up(core::cmp::max(payload_size, Q / 2) + HEADER_SIZE, Q)
}

/// `malloc(payload_size)`. `payload_size == 0` returns `Ok(None)` (no block,
/// no error), matching the external contract that a zero-size request
/// returns null without touching the error indicator.
pub(crate) fn malloc<P: PageSource>(
    region: &mut Region<P>,
    lists: &mut FreeLists,
    payload_size: usize,
) -> Result<Option<usize>, AllocError> {
    if payload_size == 0 {
        return Ok(None);
    }
    let size = required_block_size(payload_size);
    let addr = allocate_block(region, lists, size)?;
    Ok(Some(BlockView::at(addr).payload_addr()))
}

/// Produce an allocated block of exactly `size` bytes (header included),
/// growing the region as needed. Returns the block's header address.
pub(crate) fn allocate_block<P: PageSource>(
    region: &mut Region<P>,
    lists: &mut FreeLists,
    size: usize,
) -> Result<usize, AllocError> {
    if !region.is_initialized() {
        region.init(lists)?;
    }

    loop {
        if let Some(candidate) =
            lists.find_first_fit(size, |addr| unsafe { BlockView::at(addr).header() }.size())
        {
            unsafe {
                lists.unlink(candidate);
            }
            return Ok(place_allocation(region, lists, candidate, size));
        }

        let (free_addr, free_size) = region.grow()?;
        let (addr, merged_size) = unsafe { coalesce::coalesce(region, lists, free_addr, free_size) };
        placement::place_free(region, lists, addr, merged_size);
    }
}

/// Carve an allocated block of `required` bytes out of the free block at
/// `candidate` (already unlinked from its list), splitting off and
/// reinserting a trailing remainder when one large enough to avoid a
/// splinter remains. Returns `candidate` (the allocated block's address).
pub(crate) fn place_allocation<P: PageSource>(
    region: &Region<P>,
    lists: &mut FreeLists,
    candidate: usize,
    required: usize,
) -> usize {
    let view = BlockView::at(candidate);
    let total = unsafe { view.header() }.size();
    let prev_alloc = unsafe { view.header() }.prev_alloc();
    let remainder = total - required;

    if remainder >= Q {
        unsafe {
            view.set_header(Tag::new(required, prev_alloc, true));
        }
        let remainder_addr = candidate + required;
        let remainder_view = BlockView::at(remainder_addr);
        unsafe {
            remainder_view.write_free(remainder, true);
        }
        placement::place_free(region, lists, remainder_addr, remainder);
        trace!("split block at 0x{candidate:x}: {required} allocated, {remainder} free");
    } else {
        unsafe {
            view.set_header(Tag::new(total, prev_alloc, true));
        }
        placement::set_prev_alloc_bit(candidate + total, region, true);
    }
    candidate
}
