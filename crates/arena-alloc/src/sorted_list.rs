//! Sorted free-list allocator.
//!
//! Free blocks form a singly linked list kept in ascending address order.
//! Allocation scans the list with the configured [`FitMode`]; deallocation
//! inserts the block at its address position and merges it with both
//! neighbours when they are adjacent.
//!
//! # Memory Layout
//!
//! ```text
//! Occupied block:                 Free block:
//! ┌──────┬──────────────────┐     ┌──────┬──────┬──────────────┐
//! │ size │ payload ...      │     │ size │ next │ unused ...   │
//! └──────┴──────────────────┘     └──────┴──────┴──────────────┘
//! ```
//!
//! Sizes include the header. Zero-sized requests are answered with a null
//! pointer and no block is created.

use alloc::vec::Vec;

use snafu::ensure;

use crate::{
    error::{AllocError, CorruptedSnafu, NotOccupiedSnafu},
    fit::{FitMode, FitSearch},
    heap::{Heap, NIL, WORD},
    index::{BlockInfo, FreeSpaceIndex},
};

const SIZE: usize = 0;
const NEXT: usize = 1;

/// Head of the address-ordered free list.
#[derive(Debug)]
pub struct SortedList {
    head: usize,
}

/// A free node together with its predecessor in the list.
#[derive(Debug, Clone, Copy)]
pub struct ListSlot {
    prev: usize,
    node: usize,
}

impl SortedList {
    fn next(heap: Heap, node: usize) -> usize {
        heap.read(node, NEXT)
    }

    fn set_next(&mut self, heap: Heap, prev: usize, node: usize) {
        if prev == NIL {
            self.head = node;
        } else {
            heap.write(prev, NEXT, node);
        }
    }

    /// Links `prev` to `next`, merging the two when `prev` ends where `next`
    /// starts.
    ///
    /// Returns the node that now follows whatever preceded `prev`.
    fn concat(heap: Heap, prev: usize, next: usize) -> usize {
        if prev == NIL {
            return next;
        }
        if next != NIL && prev + heap.read(prev, SIZE) == next {
            let merged = heap.read(prev, SIZE) + heap.read(next, SIZE);
            heap.write(prev, SIZE, merged);
            heap.write(prev, NEXT, heap.read(next, NEXT));
        } else {
            heap.write(prev, NEXT, next);
        }
        prev
    }

    fn check_size(heap: Heap, offset: usize) -> Result<usize, AllocError> {
        let size = heap.read(offset, SIZE);
        let fits = offset
            .checked_add(size)
            .is_some_and(|end| end <= heap.len());
        ensure!(
            size >= Self::MIN_BLOCK && size.is_multiple_of(WORD) && fits,
            CorruptedSnafu { offset, size }
        );
        Ok(size)
    }
}

impl FreeSpaceIndex for SortedList {
    const NAME: &'static str = "sorted free list";
    const OCCUPIED_HEADER: usize = WORD;
    const MIN_BLOCK: usize = 2 * WORD;
    const NULL_ON_ZERO: bool = true;

    type Candidate = ListSlot;

    fn init(heap: Heap) -> Self {
        heap.write(0, SIZE, heap.len());
        heap.write(0, NEXT, NIL);
        Self { head: 0 }
    }

    fn find_fit(&self, heap: Heap, mode: FitMode, needed: usize) -> Option<ListSlot> {
        let mut search = FitSearch::new(mode, needed);
        let mut prev = NIL;
        let mut node = self.head;
        while node != NIL {
            let slot = ListSlot { prev, node };
            if search.offer(heap.read(node, SIZE), slot).is_break() {
                break;
            }
            prev = node;
            node = Self::next(heap, node);
        }
        search.finish()
    }

    fn occupy(&mut self, heap: Heap, slot: ListSlot, needed: usize) -> usize {
        let ListSlot { prev, node } = slot;
        let size = heap.read(node, SIZE);
        let next = Self::next(heap, node);
        assert!(size >= needed, "free block {node} is too small");

        if size - needed >= Self::MIN_BLOCK {
            let remainder = node + needed;
            heap.write(remainder, SIZE, size - needed);
            heap.write(remainder, NEXT, next);
            self.set_next(heap, prev, remainder);
            heap.write(node, SIZE, needed);
        } else {
            self.set_next(heap, prev, next);
        }
        node
    }

    fn release(&mut self, heap: Heap, block: usize) -> Result<usize, AllocError> {
        ensure!(
            heap.has_words(block, 1),
            NotOccupiedSnafu { offset: block }
        );
        let size = Self::check_size(heap, block)?;

        // Find the last free node before the block.
        let mut prev = NIL;
        let mut next = self.head;
        while next != NIL && next < block {
            prev = next;
            next = Self::next(heap, next);
        }
        ensure!(next != block, NotOccupiedSnafu { offset: block });
        if prev != NIL {
            let prev_end = prev + heap.read(prev, SIZE);
            ensure!(prev_end <= block, NotOccupiedSnafu { offset: block });
        }
        ensure!(
            next == NIL || block + size <= next,
            CorruptedSnafu {
                offset: block,
                size
            }
        );

        heap.write(block, NEXT, NIL);
        let node = Self::concat(heap, block, next);
        if prev == NIL {
            self.head = node;
            Ok(heap.read(node, SIZE))
        } else {
            Self::concat(heap, prev, node);
            let merged = if Self::next(heap, prev) == node {
                node
            } else {
                prev
            };
            Ok(heap.read(merged, SIZE))
        }
    }

    fn blocks(&self, heap: Heap) -> Result<Vec<BlockInfo>, AllocError> {
        let mut blocks = Vec::new();
        let mut free = self.head;
        let mut offset = 0;
        while offset < heap.len() {
            ensure!(
                free == NIL || free >= offset,
                CorruptedSnafu {
                    offset: free,
                    size: 0_usize
                }
            );
            let size = Self::check_size(heap, offset)?;
            if offset == free {
                blocks.push(BlockInfo::free(offset, size));
                free = Self::next(heap, free);
            } else {
                blocks.push(BlockInfo::occupied(offset, size));
            }
            offset += size;
        }
        ensure!(
            free == NIL,
            CorruptedSnafu {
                offset: free,
                size: 0_usize
            }
        );
        Ok(blocks)
    }
}
