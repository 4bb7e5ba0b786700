//! Region manager (C2): lazy initialization, prologue/epilogue sentinels,
//! and page-at-a-time growth.

use crate::block::{BlockView, HEADER_SIZE, Q, align_up};
use crate::error::AllocError;
use crate::freelist::FreeLists;
use crate::page_source::PageSource;
use crate::placement;
use log::{trace, warn};

/// Everything the allocator needs besides the free-list index: region
/// bounds and the page source that grows them.
pub(crate) struct Region<P: PageSource> {
    source: P,
    /// Address of the prologue header. `0` until the first page is granted.
    prologue: usize,
    /// Address of the epilogue header (its "low end").
    epilogue: usize,
}

impl<P: PageSource> Region<P> {
    pub const fn new(source: P) -> Self {
        Self {
            source,
            prologue: 0,
            epilogue: 0,
        }
    }

    pub const fn is_initialized(&self) -> bool {
        self.prologue != 0
    }

    pub(crate) fn source_mut(&mut self) -> &mut P {
        &mut self.source
    }

    pub fn region_start(&self) -> usize {
        self.source.region_start()
    }

    pub fn region_end(&self) -> usize {
        self.source.region_end()
    }

    pub const fn epilogue_addr(&self) -> usize {
        self.epilogue
    }

    pub const fn prologue_addr(&self) -> usize {
        self.prologue
    }

    /// First use: request one page, place the prologue so the first payload
    /// lands on a 16-byte boundary, place the epilogue at the new high end,
    /// and publish the interior as the wilderness block on list 9.
    pub fn init(&mut self, lists: &mut FreeLists) -> Result<(), AllocError> {
        let page = self.source.grow_by_one_page().ok_or(AllocError::OutOfMemory)?;

        // The payload of the first real block must be 16-byte aligned: its
        // header sits at `prologue_addr + Q`, and `Q` is itself a multiple of
        // 16, so that header (and hence its payload, 8 bytes further on)
        // keeps whatever residue mod 16 the prologue's own header has. For
        // the payload (`header + HEADER_SIZE`) to land on a 16-byte boundary,
        // the header must be `== 8 (mod 16)`, so the prologue's header is
        // placed 8 bytes past the nearest 16-byte boundary, not on it.
        let prologue_addr = align_up(page, 16) + HEADER_SIZE;
        let prologue = BlockView::at(prologue_addr);
        unsafe {
            // Prologue: allocated, size Q, no real predecessor so
            // prev_alloc is vacuously true (nothing can coalesce past it).
            prologue.set_header(crate::block::Tag::new(Q, true, true));
        }

        let free_addr = prologue_addr + Q;
        let page_end = page + crate::page_source::PAGE_SZ;
        let epilogue_addr = page_end - HEADER_SIZE;
        let free_size = epilogue_addr - free_addr;

        let free_block = BlockView::at(free_addr);
        unsafe {
            free_block.write_free(free_size, true);
        }
        self.install_epilogue(epilogue_addr, true);

        self.prologue = prologue_addr;
        self.epilogue = epilogue_addr;
        placement::place_free(self, lists, free_addr, free_size);
        trace!(
            "region initialized: prologue=0x{prologue_addr:x} epilogue=0x{epilogue_addr:x} wilderness_size={free_size}"
        );
        Ok(())
    }

    fn install_epilogue(&self, addr: usize, prev_alloc: bool) {
        let epilogue = BlockView::at(addr);
        unsafe {
            epilogue.set_header(crate::block::Tag::new(0, prev_alloc, true));
        }
    }

    /// Grow the region by exactly one page. The old epilogue's header
    /// becomes the new free block's header; the epilogue is rewritten at
    /// the new high end. Returns the new free block's address and size,
    /// uncoalesced — callers (C5) merge it with the existing wilderness
    /// block, if any.
    ///
    /// On failure, the region is left exactly as it was (nothing to undo:
    /// a page that was never granted never touched any invariant).
    pub fn grow(&mut self) -> Result<(usize, usize), AllocError> {
        let old_epilogue = self.epilogue;
        let prev_alloc = unsafe { BlockView::at(old_epilogue).header().prev_alloc() };

        let page = self
            .source
            .grow_by_one_page()
            .ok_or(AllocError::OutOfMemory)?;
        debug_assert_eq!(
            page,
            old_epilogue + HEADER_SIZE,
            "page source must grow contiguously at region_end"
        );

        let new_epilogue = page + crate::page_source::PAGE_SZ - HEADER_SIZE;
        let new_free_size = new_epilogue - old_epilogue;

        let new_free = BlockView::at(old_epilogue);
        unsafe {
            new_free.write_free(new_free_size, prev_alloc);
        }
        self.install_epilogue(new_epilogue, false);
        self.epilogue = new_epilogue;

        warn!(
            "region grown by one page: new_epilogue=0x{new_epilogue:x} new_free_size={new_free_size}"
        );
        Ok((old_epilogue, new_free_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_source::test_support::VecPageSource;

    #[test]
    fn init_places_prologue_epilogue_and_one_wilderness_block() {
        let mut lists = FreeLists::new();
        let mut region = Region::new(VecPageSource::with_max_pages(4));
        region.init(&mut lists).unwrap();

        assert!(region.is_initialized());
        assert!(lists.has_wilderness());
        assert_eq!(region.epilogue_addr() + HEADER_SIZE, region.region_end());

        let prologue = unsafe { BlockView::at(region.prologue_addr()).header() };
        assert_eq!(prologue.size(), Q);
        assert!(prologue.this_alloc());

        let epilogue = unsafe { BlockView::at(region.epilogue_addr()).header() };
        assert_eq!(epilogue.size(), 0);
        assert!(epilogue.this_alloc());
    }

    #[test]
    fn grow_extends_region_and_reports_new_free_block() {
        let mut lists = FreeLists::new();
        let mut region = Region::new(VecPageSource::with_max_pages(4));
        region.init(&mut lists).unwrap();
        let before = region.region_end();

        let (addr, size) = region.grow().unwrap();
        assert_eq!(addr, before - HEADER_SIZE);
        assert_eq!(size, crate::page_source::PAGE_SZ);
        assert_eq!(region.region_end(), before + crate::page_source::PAGE_SZ);
    }

    #[test]
    fn grow_fails_cleanly_once_source_is_exhausted() {
        let mut lists = FreeLists::new();
        let mut region = Region::new(VecPageSource::with_max_pages(1));
        region.init(&mut lists).unwrap();
        assert!(matches!(region.grow(), Err(AllocError::OutOfMemory)));
    }
}
