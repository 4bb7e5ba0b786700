//! Property tests over random legal operation sequences (`spec.md` §8's
//! "universal invariants"), in the style of `wasmtime`'s
//! `gc::enabled::free_list` proptest module: generate a sequence of
//! malloc/free/realloc operations, replay them against a small heap, and
//! re-check every structural invariant after each step rather than only at
//! the end.

use crate::block::{BlockView, Q, Tag};
use crate::freelist::{WILDERNESS_LIST, list_index};
use crate::heap::Heap;
use crate::page_source::test_support::VecPageSource;
use proptest::prelude::*;
use std::collections::HashMap;

/// One step of a random operation sequence. Indices into the `live` vector
/// kept by the driver are taken modulo its current length, so any index is
/// "valid" — it just might not refer to the block a human reader expects.
#[derive(Clone, Debug)]
enum Op {
    Malloc(usize),
    Free(usize),
    Realloc(usize, usize),
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    proptest::collection::vec(
        prop_oneof![
            (1usize..=2000).prop_map(Op::Malloc),
            (0usize..16).prop_map(Op::Free),
            (0usize..16, 0usize..2000).prop_map(|(i, s)| Op::Realloc(i, s)),
        ],
        1..80,
    )
}

/// A snapshot of one block's tag fields, walked from the prologue up to (but
/// not including) the epilogue.
struct BlockRecord {
    addr: usize,
    size: usize,
    this_alloc: bool,
    prev_alloc: bool,
}

/// Walk the block chain from the prologue to the epilogue. Returns `None` if
/// the heap has never been touched (nothing to check yet).
fn walk(heap: &Heap<VecPageSource>) -> Option<(Vec<BlockRecord>, Tag)> {
    let region = heap.region();
    if !region.is_initialized() {
        return None;
    }

    let epilogue_addr = region.epilogue_addr();
    let mut addr = region.prologue_addr();
    let mut blocks = Vec::new();
    while addr < epilogue_addr {
        let view = BlockView::at(addr);
        let tag = unsafe { view.header() };
        assert!(tag.size() >= Q, "every real block is at least Q bytes");
        blocks.push(BlockRecord {
            addr,
            size: tag.size(),
            this_alloc: tag.this_alloc(),
            prev_alloc: tag.prev_alloc(),
        });
        addr += tag.size();
    }
    assert_eq!(addr, epilogue_addr, "block chain must land exactly on the epilogue, no overshoot");

    let epilogue_tag = unsafe { BlockView::at(epilogue_addr).header() };
    assert_eq!(epilogue_tag.size(), 0, "epilogue is always a 0-byte header");
    assert!(epilogue_tag.this_alloc(), "epilogue's THIS_BLOCK_ALLOCATED is always set");

    Some((blocks, epilogue_tag))
}

/// Re-check every invariant `spec.md` §8 lists as a "universal invariant",
/// given the heap's current state.
fn check_invariants(heap: &Heap<VecPageSource>) {
    let Some((blocks, epilogue_tag)) = walk(heap) else {
        return;
    };

    // Invariant: PREV_BLOCK_ALLOCATED of block B equals THIS_BLOCK_ALLOCATED
    // of block B-1. Checked across the whole chain, including the seam into
    // the epilogue.
    let mut prev_this_alloc = true; // the prologue, always allocated
    for block in &blocks {
        assert_eq!(
            block.prev_alloc, prev_this_alloc,
            "block 0x{:x}'s PREV_BLOCK_ALLOCATED disagrees with its predecessor",
            block.addr
        );
        prev_this_alloc = block.this_alloc;
    }
    assert_eq!(
        epilogue_tag.prev_alloc(),
        prev_this_alloc,
        "epilogue's PREV_BLOCK_ALLOCATED disagrees with the last real block"
    );

    // Invariant: every free block's header and footer agree, and no two
    // physically adjacent blocks are both free.
    let mut prev_free = false;
    for block in &blocks {
        if !block.this_alloc {
            let view = BlockView::at(block.addr);
            let footer = unsafe { view.footer(block.size) };
            let header = unsafe { view.header() };
            assert_eq!(header, footer, "free block 0x{:x} header/footer mismatch", block.addr);
            assert!(!prev_free, "two adjacent free blocks at/before 0x{:x}", block.addr);
        }
        prev_free = !block.this_alloc;
    }

    // Invariant: every free block is reachable from exactly one free-list
    // sentinel, consistent with its size (or the wilderness list, iff it
    // abuts the epilogue).
    let region = heap.region();
    let epilogue_addr = region.epilogue_addr();
    let mut listed: HashMap<usize, usize> = HashMap::new();
    heap.lists().for_each(|index, addr| {
        let prior = listed.insert(addr, index);
        assert!(prior.is_none(), "block 0x{addr:x} is linked into more than one free list");
    });

    let mut wilderness_count = 0;
    for block in &blocks {
        if block.this_alloc {
            assert!(!listed.contains_key(&block.addr), "allocated block 0x{:x} also appears on a free list", block.addr);
            continue;
        }
        let index = listed
            .remove(&block.addr)
            .unwrap_or_else(|| panic!("free block 0x{:x} is not linked into any free list", block.addr));
        let abuts_epilogue = block.addr + block.size == epilogue_addr;
        if abuts_epilogue {
            assert_eq!(index, WILDERNESS_LIST, "wilderness block must be on list 9");
            wilderness_count += 1;
        } else {
            assert_eq!(
                index,
                list_index(block.size),
                "block 0x{:x} of size {} is on list {index}, expected {}",
                block.addr,
                block.size,
                list_index(block.size)
            );
        }
    }
    assert!(wilderness_count <= 1, "free-list 9 must hold at most one block");
    assert!(listed.is_empty(), "free list contains addresses absent from the walked block chain");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Replays a random sequence of malloc/free/realloc operations against a
    /// small heap and re-checks every structural invariant after each step,
    /// plus the alignment guarantee on every pointer handed back.
    #[test]
    fn heap_invariants_hold_after_random_ops(ops in ops()) {
        let mut heap = Heap::new(VecPageSource::with_max_pages(16));
        let mut live: Vec<usize> = Vec::new();

        for op in ops {
            match op {
                Op::Malloc(size) => {
                    if let Ok(Some(p)) = heap.malloc(size) {
                        prop_assert_eq!(p % 16, 0, "malloc must return a 16-byte aligned pointer");
                        live.push(p);
                    }
                }
                Op::Free(i) => {
                    if !live.is_empty() {
                        let idx = i % live.len();
                        let p = live.remove(idx);
                        heap.free(p);
                    }
                }
                Op::Realloc(i, size) => {
                    if live.is_empty() {
                        if let Ok(Some(p)) = heap.realloc(None, size) {
                            prop_assert_eq!(p % 16, 0, "realloc must return a 16-byte aligned pointer");
                            live.push(p);
                        }
                        continue;
                    }
                    let idx = i % live.len();
                    let p = live.remove(idx);
                    match heap.realloc(Some(p), size) {
                        Ok(Some(new_p)) => {
                            prop_assert_eq!(new_p % 16, 0, "realloc must return a 16-byte aligned pointer");
                            live.push(new_p);
                        }
                        Ok(None) => {}
                        // Growth failed: the old block is untouched (spec.md
                        // §4.7), so it is still live.
                        Err(_) => live.push(p),
                    }
                }
            }
            check_invariants(&heap);
        }
    }
}
