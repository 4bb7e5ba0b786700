//! Realloc engine (C7): in-place grow/shrink when possible, otherwise
//! allocate-copy-free.

use crate::alloc::{allocate_block, malloc, required_block_size};
use crate::block::{BlockView, HEADER_SIZE, Q, Tag};
use crate::coalesce;
use crate::dealloc::free;
use crate::error::AllocError;
use crate::freelist::FreeLists;
use crate::page_source::PageSource;
use crate::placement;
use crate::region::Region;

/// `realloc(payload_addr, new_payload_size)`.
///
/// `payload_addr == None` behaves as a fresh `malloc`. `new_payload_size ==
/// 0` frees the block (if any) and returns `Ok(None)`.
pub(crate) fn realloc<P: PageSource>(
    region: &mut Region<P>,
    lists: &mut FreeLists,
    payload_addr: Option<usize>,
    new_payload_size: usize,
) -> Result<Option<usize>, AllocError> {
    let Some(payload_addr) = payload_addr else {
        return malloc(region, lists, new_payload_size);
    };

    if new_payload_size == 0 {
        free(region, lists, payload_addr);
        return Ok(None);
    }

    let block = BlockView::at(payload_addr - HEADER_SIZE);
    let header_addr = block.header_addr();
    let old_size = unsafe { block.header() }.size();
    let new_size = required_block_size(new_payload_size);

    if new_size > old_size {
        grow(region, lists, header_addr, old_size, new_payload_size, new_size)
    } else if new_size == old_size {
        Ok(Some(payload_addr))
    } else {
        shrink(region, lists, header_addr, old_size, new_size);
        Ok(Some(payload_addr))
    }
}

/// `S' > S`: allocate fresh, copy, free the old block. On failure, the old
/// block is left untouched and the failure propagates.
fn grow<P: PageSource>(
    region: &mut Region<P>,
    lists: &mut FreeLists,
    header_addr: usize,
    old_size: usize,
    new_payload_size: usize,
    new_size: usize,
) -> Result<Option<usize>, AllocError> {
    let new_header = allocate_block(region, lists, new_size)?;
    let new_payload = BlockView::at(new_header).payload_addr();
    let old_payload = header_addr + HEADER_SIZE;
    let old_payload_bytes = old_size - HEADER_SIZE;
    let copy_len = core::cmp::min(old_payload_bytes, new_payload_size);

    unsafe {
        core::ptr::copy_nonoverlapping(old_payload as *const u8, new_payload as *mut u8, copy_len);
    }

    free(region, lists, old_payload);
    Ok(Some(new_payload))
}

/// `S' < S`: shrink in place when the remainder would be a real block,
/// otherwise leave the splinter in place unchanged.
fn shrink<P: PageSource>(
    region: &Region<P>,
    lists: &mut FreeLists,
    header_addr: usize,
    old_size: usize,
    new_size: usize,
) {
    let remainder = old_size - new_size;
    if remainder < Q {
        return;
    }

    let view = BlockView::at(header_addr);
    let prev_alloc = unsafe { view.header() }.prev_alloc();
    unsafe {
        view.set_header(Tag::new(new_size, prev_alloc, true));
    }

    let remainder_addr = header_addr + new_size;
    let remainder_view = BlockView::at(remainder_addr);
    unsafe {
        remainder_view.write_free(remainder, true);
    }

    let (addr, merged_size) = unsafe { coalesce::coalesce(region, lists, remainder_addr, remainder) };
    placement::place_free(region, lists, addr, merged_size);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::malloc;
    use crate::page_source::test_support::VecPageSource;

    fn setup() -> (Region<VecPageSource>, FreeLists) {
        (Region::new(VecPageSource::with_max_pages(8)), FreeLists::new())
    }

    #[test]
    fn grow_preserves_prefix_bytes_and_returns_new_pointer() {
        let (mut region, mut lists) = setup();
        let p = malloc(&mut region, &mut lists, 4).unwrap().unwrap();
        unsafe {
            core::ptr::write(p as *mut u32, 0x1234_5678);
        }
        let q = realloc(&mut region, &mut lists, Some(p), 9000).unwrap().unwrap();
        let value = unsafe { core::ptr::read(q as *const u32) };
        assert_eq!(value, 0x1234_5678);
    }

    #[test]
    fn shrink_leaves_a_splinter_untouched() {
        let (mut region, mut lists) = setup();
        let p = malloc(&mut region, &mut lists, 64).unwrap().unwrap();
        let q = realloc(&mut region, &mut lists, Some(p), 60).unwrap().unwrap();
        assert_eq!(p, q);
    }

    #[test]
    fn shrink_splits_when_remainder_is_large_enough() {
        let (mut region, mut lists) = setup();
        let p = malloc(&mut region, &mut lists, 512).unwrap().unwrap();
        let q = realloc(&mut region, &mut lists, Some(p), 4).unwrap().unwrap();
        assert_eq!(p, q);
        // the remainder of the shrink should have produced a free block.
        let mut any_free = false;
        lists.for_each(|_, _| any_free = true);
        assert!(any_free);
    }

    #[test]
    fn zero_size_frees_and_returns_none() {
        let (mut region, mut lists) = setup();
        let p = malloc(&mut region, &mut lists, 32).unwrap().unwrap();
        let result = realloc(&mut region, &mut lists, Some(p), 0).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn null_pointer_behaves_as_malloc() {
        let (mut region, mut lists) = setup();
        let result = realloc(&mut region, &mut lists, None, 16).unwrap();
        assert!(result.is_some());
    }
}
