//! Boundary-tag allocator.
//!
//! Only occupied blocks carry metadata. They form a doubly linked list in
//! address order and every gap between two of them (plus the gaps at both
//! ends of the heap) is a hole available for allocation. Freeing a block
//! unlinks it, which merges its span with the neighbouring holes without any
//! extra work.
//!
//! ```text
//! ┌──────┬──────┬──────┬───────┬─────────────┐
//! │ size │ next │ prev │ owner │ payload ... │
//! └──────┴──────┴──────┴───────┴─────────────┘
//! ```
//!
//! `owner` holds the heap start address of the arena the block belongs to and
//! is cleared on release, which catches double frees and foreign pointers.

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
const PREV: usize = 2;
const OWNER: usize = 3;
const HEADER_WORDS: usize = 4;

/// Value written to the owner word of released blocks.
const RELEASED: usize = 0;

/// Head of the address-ordered list of occupied blocks.
#[derive(Debug)]
pub struct BoundaryTags {
    head: usize,
}

/// A gap between two occupied blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hole {
    start: usize,
    size: usize,
    /// Occupied block in front of the hole.
    prev: usize,
    /// Occupied block behind the hole.
    next: usize,
}

/// Iterator over the holes of a heap in address order.
struct Holes {
    heap: Heap,
    prev: usize,
    next: usize,
    done: bool,
}

impl Iterator for Holes {
    type Item = Hole;

    fn next(&mut self) -> Option<Hole> {
        while !self.done {
            let start = if self.prev == NIL {
                0
            } else {
                self.prev + self.heap.read(self.prev, SIZE)
            };
            let end = if self.next == NIL {
                self.done = true;
                self.heap.len()
            } else {
                self.next
            };
            let hole = Hole {
                start,
                size: end - start,
                prev: self.prev,
                next: self.next,
            };
            if self.next != NIL {
                self.prev = self.next;
                self.next = self.heap.read(self.next, NEXT);
            }
            if hole.size > 0 {
                return Some(hole);
            }
        }
        None
    }
}

impl BoundaryTags {
    fn holes(&self, heap: Heap) -> Holes {
        Holes {
            heap,
            prev: NIL,
            next: self.head,
            done: false,
        }
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

    fn is_owned(heap: Heap, offset: usize) -> bool {
        heap.has_words(offset, HEADER_WORDS) && heap.read(offset, OWNER) == heap.addr()
    }
}

impl FreeSpaceIndex for BoundaryTags {
    const NAME: &'static str = "boundary tag";
    const OCCUPIED_HEADER: usize = HEADER_WORDS * WORD;
    const MIN_BLOCK: usize = HEADER_WORDS * WORD;

    type Candidate = Hole;

    fn init(_heap: Heap) -> Self {
        Self { head: NIL }
    }

    fn find_fit(&self, heap: Heap, mode: FitMode, needed: usize) -> Option<Hole> {
        let mut search = FitSearch::new(mode, needed);
        for hole in self.holes(heap) {
            if search.offer(hole.size, hole).is_break() {
                break;
            }
        }
        search.finish()
    }

    fn occupy(&mut self, heap: Heap, hole: Hole, needed: usize) -> usize {
        assert!(hole.size >= needed, "hole at {} is too small", hole.start);
        let size = if hole.size - needed >= Self::MIN_BLOCK {
            needed
        } else {
            hole.size
        };

        let block = hole.start;
        heap.write(block, SIZE, size);
        heap.write(block, NEXT, hole.next);
        heap.write(block, PREV, hole.prev);
        heap.write(block, OWNER, heap.addr());
        if hole.prev == NIL {
            self.head = block;
        } else {
            heap.write(hole.prev, NEXT, block);
        }
        if hole.next != NIL {
            heap.write(hole.next, PREV, block);
        }
        block
    }

    fn release(&mut self, heap: Heap, block: usize) -> Result<usize, AllocError> {
        ensure!(
            Self::is_owned(heap, block),
            NotOccupiedSnafu { offset: block }
        );
        let size = Self::check_size(heap, block)?;
        let prev = heap.read(block, PREV);
        let next = heap.read(block, NEXT);

        let linked_from_prev = if prev == NIL {
            self.head == block
        } else {
            Self::is_owned(heap, prev) && heap.read(prev, NEXT) == block
        };
        let linked_from_next =
            next == NIL || (Self::is_owned(heap, next) && heap.read(next, PREV) == block);
        ensure!(
            linked_from_prev && linked_from_next,
            CorruptedSnafu {
                offset: block,
                size
            }
        );

        if prev == NIL {
            self.head = next;
        } else {
            heap.write(prev, NEXT, next);
        }
        if next != NIL {
            heap.write(next, PREV, prev);
        }
        heap.write(block, OWNER, RELEASED);

        let start = if prev == NIL {
            0
        } else {
            prev + heap.read(prev, SIZE)
        };
        let end = if next == NIL { heap.len() } else { next };
        Ok(end - start)
    }

    fn blocks(&self, heap: Heap) -> Result<Vec<BlockInfo>, AllocError> {
        let mut blocks = Vec::new();
        let mut offset = 0;
        let mut prev = NIL;
        let mut block = self.head;
        while block != NIL {
            let corrupted = CorruptedSnafu {
                offset: block,
                size: 0_usize,
            };
            ensure!(block >= offset && Self::is_owned(heap, block), corrupted);
            ensure!(heap.read(block, PREV) == prev, corrupted);
            let size = Self::check_size(heap, block)?;
            if block > offset {
                blocks.push(BlockInfo::free(offset, block - offset));
            }
            blocks.push(BlockInfo::occupied(block, size));
            offset = block + size;
            prev = block;
            block = heap.read(block, NEXT);
        }
        if offset < heap.len() {
            blocks.push(BlockInfo::free(offset, heap.len() - offset));
        }
        Ok(blocks)
    }
}
