//! Red-black tree allocator.
//!
//! Every block knows its physical neighbours, so freeing a block can merge it
//! with adjacent free blocks in constant time. Free blocks are additionally
//! kept in a red-black tree ordered by size (equal sizes go to the right)
//! whose links live in the free block's payload.
//!
//! # Memory Layout
//!
//! ```text
//! Occupied block:
//! ┌──────┬──────┬──────┬──────┬──────────────────────────────┐
//! │ meta │ size │ prev │ next │ payload ...                  │
//! └──────┴──────┴──────┴──────┴──────────────────────────────┘
//!
//! Free block:
//! ┌──────┬──────┬──────┬──────┬────────┬──────┬───────┬──────┐
//! │ meta │ size │ prev │ next │ parent │ left │ right │ ...  │
//! └──────┴──────┴──────┴──────┴────────┴──────┴───────┴──────┘
//! ```
//!
//! `prev` and `next` are the physically adjacent blocks, `parent`, `left` and
//! `right` are tree links. All of them are heap offsets, so an arena can be
//! copied byte for byte (see [`Arena::try_clone`]).

use alloc::vec::Vec;

use bitflags::bitflags;
use logger::error;
use snafu::ensure;

use crate::{
    arena::Arena,
    error::{AllocError, CorruptedSnafu, NotOccupiedSnafu, TreeInvariantSnafu},
    fit::{FitMode, FitSearch},
    heap::{Heap, NIL, WORD},
    index::{BlockInfo, FreeSpaceIndex},
};

const META: usize = 0;
const SIZE: usize = 1;
const PREV: usize = 2;
const NEXT: usize = 3;
const PARENT: usize = 4;
const LEFT: usize = 5;
const RIGHT: usize = 6;

bitflags! {
    /// State bits stored in the first header word of every block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Meta: usize {
        /// The block is handed out to a caller.
        const OCCUPIED = 1 << 0;
        /// Tree node colour; cleared means black.
        const RED = 1 << 1;
    }
}

/// Root of the tree of free blocks.
#[derive(Debug)]
pub struct RedBlackTree {
    root: usize,
}

impl RedBlackTree {
    /// Header flags of `node`.
    ///
    /// Unknown bits are kept so that [`release`](FreeSpaceIndex::release) can
    /// tell a damaged header from a valid one.
    ///
    /// # Panics
    ///
    /// Panics if `node` is not a word offset inside `heap`.
    fn meta(heap: Heap, node: usize) -> Meta {
        Meta::from_bits_retain(heap.read(node, META))
    }

    fn set_meta(heap: Heap, node: usize, meta: Meta) {
        heap.write(node, META, meta.bits());
    }

    /// `NIL` counts as black, as the leaves of the tree do.
    fn is_red(heap: Heap, node: usize) -> bool {
        node != NIL && Self::meta(heap, node).contains(Meta::RED)
    }

    /// Recolours `node`, leaving its `OCCUPIED` bit alone.
    fn set_red(heap: Heap, node: usize, red: bool) {
        let mut meta = Self::meta(heap, node);
        meta.set(Meta::RED, red);
        Self::set_meta(heap, node, meta);
    }

    fn size(heap: Heap, node: usize) -> usize {
        heap.read(node, SIZE)
    }

    fn parent(heap: Heap, node: usize) -> usize {
        heap.read(node, PARENT)
    }

    fn left(heap: Heap, node: usize) -> usize {
        heap.read(node, LEFT)
    }

    fn right(heap: Heap, node: usize) -> usize {
        heap.read(node, RIGHT)
    }

    /// Sets the parent link of `node`, doing nothing for `NIL`.
    ///
    /// Rotations and transplants move subtrees that may be empty, so callers
    /// pass `NIL` children through here instead of checking themselves.
    fn set_parent(heap: Heap, node: usize, parent: usize) {
        if node != NIL {
            heap.write(node, PARENT, parent);
        }
    }

    /// The smallest block of the subtree rooted at `node`.
    ///
    /// `node` must not be `NIL`.
    fn minimum(heap: Heap, mut node: usize) -> usize {
        while Self::left(heap, node) != NIL {
            node = Self::left(heap, node);
        }
        node
    }

    /// The next node of an in-order walk, or `NIL` after the largest block.
    ///
    /// Blocks of equal size are visited in insertion order, as
    /// [`insert`](Self::insert) sends equal keys to the right.
    fn successor(heap: Heap, mut node: usize) -> usize {
        let right = Self::right(heap, node);
        if right != NIL {
            return Self::minimum(heap, right);
        }
        let mut parent = Self::parent(heap, node);
        while parent != NIL && node == Self::right(heap, parent) {
            node = parent;
            parent = Self::parent(heap, parent);
        }
        parent
    }

    /// Points the link that referred to `old` at `new`.
    fn replace_child(&mut self, heap: Heap, parent: usize, old: usize, new: usize) {
        if parent == NIL {
            self.root = new;
        } else if Self::left(heap, parent) == old {
            heap.write(parent, LEFT, new);
        } else {
            heap.write(parent, RIGHT, new);
        }
    }

    /// Rotates the subtree at `x` to the left.
    ///
    /// The right child `y` of `x` takes its place and `x` becomes the left
    /// child of `y`. The former left subtree of `y` moves under `x`. Colours
    /// are not touched; the fixups recolour around the rotation.
    ///
    /// `x` must have a right child.
    fn rotate_left(&mut self, heap: Heap, x: usize) {
        let y = Self::right(heap, x);
        let inner = Self::left(heap, y);
        heap.write(x, RIGHT, inner);
        Self::set_parent(heap, inner, x);

        let parent = Self::parent(heap, x);
        heap.write(y, PARENT, parent);
        self.replace_child(heap, parent, x, y);

        heap.write(y, LEFT, x);
        heap.write(x, PARENT, y);
    }

    /// Mirror of [`rotate_left`](Self::rotate_left). `x` must have a left
    /// child.
    fn rotate_right(&mut self, heap: Heap, x: usize) {
        let y = Self::left(heap, x);
        let inner = Self::right(heap, y);
        heap.write(x, LEFT, inner);
        Self::set_parent(heap, inner, x);

        let parent = Self::parent(heap, x);
        heap.write(y, PARENT, parent);
        self.replace_child(heap, parent, x, y);

        heap.write(y, RIGHT, x);
        heap.write(x, PARENT, y);
    }

    /// Adds the free block `node` to the tree.
    fn insert(&mut self, heap: Heap, node: usize) {
        let key = Self::size(heap, node);
        let mut parent = NIL;
        let mut cursor = self.root;
        while cursor != NIL {
            parent = cursor;
            cursor = if key < Self::size(heap, cursor) {
                Self::left(heap, cursor)
            } else {
                Self::right(heap, cursor)
            };
        }

        Self::set_meta(heap, node, Meta::RED);
        heap.write(node, PARENT, parent);
        heap.write(node, LEFT, NIL);
        heap.write(node, RIGHT, NIL);
        if parent == NIL {
            self.root = node;
        } else if key < Self::size(heap, parent) {
            heap.write(parent, LEFT, node);
        } else {
            heap.write(parent, RIGHT, node);
        }
        self.insert_fixup(heap, node);
    }

    fn insert_fixup(&mut self, heap: Heap, mut node: usize) {
        while Self::is_red(heap, Self::parent(heap, node)) {
            let mut parent = Self::parent(heap, node);
            let grandparent = Self::parent(heap, parent);
            if parent == Self::left(heap, grandparent) {
                let uncle = Self::right(heap, grandparent);
                if Self::is_red(heap, uncle) {
                    Self::set_red(heap, parent, false);
                    Self::set_red(heap, uncle, false);
                    Self::set_red(heap, grandparent, true);
                    node = grandparent;
                    continue;
                }
                if node == Self::right(heap, parent) {
                    node = parent;
                    self.rotate_left(heap, node);
                    parent = Self::parent(heap, node);
                }
                Self::set_red(heap, parent, false);
                Self::set_red(heap, grandparent, true);
                self.rotate_right(heap, grandparent);
            } else {
                let uncle = Self::left(heap, grandparent);
                if Self::is_red(heap, uncle) {
                    Self::set_red(heap, parent, false);
                    Self::set_red(heap, uncle, false);
                    Self::set_red(heap, grandparent, true);
                    node = grandparent;
                    continue;
                }
                if node == Self::left(heap, parent) {
                    node = parent;
                    self.rotate_right(heap, node);
                    parent = Self::parent(heap, node);
                }
                Self::set_red(heap, parent, false);
                Self::set_red(heap, grandparent, true);
                self.rotate_left(heap, grandparent);
            }
        }
        Self::set_red(heap, self.root, false);
    }

    /// Puts `new` (possibly NIL) where `old` was in the tree.
    ///
    /// Only the link from the parent of `old` is rewritten. The children of
    /// `new` and the links of `old` are left for [`remove`](Self::remove) to
    /// fix up.
    fn transplant(&mut self, heap: Heap, old: usize, new: usize) {
        let parent = Self::parent(heap, old);
        self.replace_child(heap, parent, old, new);
        Self::set_parent(heap, new, parent);
    }

    /// Removes the free block `node` from the tree.
    fn remove(&mut self, heap: Heap, node: usize) {
        let left = Self::left(heap, node);
        let right = Self::right(heap, node);
        let mut removed_red = Self::is_red(heap, node);
        // `child` may be NIL, so its parent is tracked separately.
        let (child, child_parent);

        if left == NIL {
            child = right;
            child_parent = Self::parent(heap, node);
            self.transplant(heap, node, right);
        } else if right == NIL {
            child = left;
            child_parent = Self::parent(heap, node);
            self.transplant(heap, node, left);
        } else {
            let next = Self::minimum(heap, right);
            removed_red = Self::is_red(heap, next);
            child = Self::right(heap, next);
            if Self::parent(heap, next) == node {
                child_parent = next;
            } else {
                child_parent = Self::parent(heap, next);
                self.transplant(heap, next, child);
                heap.write(next, RIGHT, right);
                heap.write(right, PARENT, next);
            }
            self.transplant(heap, node, next);
            heap.write(next, LEFT, left);
            heap.write(left, PARENT, next);
            Self::set_red(heap, next, Self::is_red(heap, node));
        }

        if !removed_red {
            self.remove_fixup(heap, child, child_parent);
        }
    }

    fn remove_fixup(&mut self, heap: Heap, mut node: usize, mut parent: usize) {
        while node != self.root && !Self::is_red(heap, node) {
            if node == Self::left(heap, parent) {
                let mut sibling = Self::right(heap, parent);
                if Self::is_red(heap, sibling) {
                    Self::set_red(heap, sibling, false);
                    Self::set_red(heap, parent, true);
                    self.rotate_left(heap, parent);
                    sibling = Self::right(heap, parent);
                }
                if !Self::is_red(heap, Self::left(heap, sibling))
                    && !Self::is_red(heap, Self::right(heap, sibling))
                {
                    Self::set_red(heap, sibling, true);
                    node = parent;
                    parent = Self::parent(heap, node);
                    continue;
                }
                if !Self::is_red(heap, Self::right(heap, sibling)) {
                    Self::set_red(heap, Self::left(heap, sibling), false);
                    Self::set_red(heap, sibling, true);
                    self.rotate_right(heap, sibling);
                    sibling = Self::right(heap, parent);
                }
                Self::set_red(heap, sibling, Self::is_red(heap, parent));
                Self::set_red(heap, parent, false);
                Self::set_red(heap, Self::right(heap, sibling), false);
                self.rotate_left(heap, parent);
            } else {
                let mut sibling = Self::left(heap, parent);
                if Self::is_red(heap, sibling) {
                    Self::set_red(heap, sibling, false);
                    Self::set_red(heap, parent, true);
                    self.rotate_right(heap, parent);
                    sibling = Self::left(heap, parent);
                }
                if !Self::is_red(heap, Self::left(heap, sibling))
                    && !Self::is_red(heap, Self::right(heap, sibling))
                {
                    Self::set_red(heap, sibling, true);
                    node = parent;
                    parent = Self::parent(heap, node);
                    continue;
                }
                if !Self::is_red(heap, Self::left(heap, sibling)) {
                    Self::set_red(heap, Self::right(heap, sibling), false);
                    Self::set_red(heap, sibling, true);
                    self.rotate_left(heap, sibling);
                    sibling = Self::left(heap, parent);
                }
                Self::set_red(heap, sibling, Self::is_red(heap, parent));
                Self::set_red(heap, parent, false);
                Self::set_red(heap, Self::left(heap, sibling), false);
                self.rotate_right(heap, parent);
            }
            node = self.root;
        }
        if node != NIL {
            Self::set_red(heap, node, false);
        }
    }

    /// Merges the physically following block `next` into `node`.
    fn absorb_next(heap: Heap, node: usize, next: usize) {
        let size = Self::size(heap, node) + Self::size(heap, next);
        heap.write(node, SIZE, size);
        let after = heap.read(next, NEXT);
        heap.write(node, NEXT, after);
        if after != NIL {
            heap.write(after, PREV, node);
        }
    }

    fn is_free(heap: Heap, node: usize) -> bool {
        !Self::meta(heap, node).contains(Meta::OCCUPIED)
    }

    fn check_size(heap: Heap, offset: usize) -> Result<usize, AllocError> {
        let size = Self::size(heap, offset);
        let fits = offset
            .checked_add(size)
            .is_some_and(|end| end <= heap.len());
        ensure!(
            size >= Self::MIN_BLOCK && size.is_multiple_of(WORD) && fits,
            CorruptedSnafu { offset, size }
        );
        Ok(size)
    }

    /// Validates the subtree at `node` and returns its black height and node
    /// count.
    fn check_subtree(
        heap: Heap,
        node: usize,
        parent: usize,
        bounds: (usize, usize),
    ) -> Result<(usize, usize), AllocError> {
        if node == NIL {
            return Ok((1, 0));
        }
        let violation = |reason| TreeInvariantSnafu {
            offset: node,
            reason,
        };
        ensure!(
            heap.has_words(node, 7),
            violation("node header outside of the heap")
        );
        ensure!(
            Self::is_free(heap, node),
            violation("occupied block in the free tree")
        );
        ensure!(
            Self::parent(heap, node) == parent,
            violation("parent link does not match")
        );
        let size = Self::size(heap, node);
        ensure!(
            bounds.0 <= size && size <= bounds.1,
            violation("sizes are out of order")
        );

        let left = Self::left(heap, node);
        let right = Self::right(heap, node);
        if Self::is_red(heap, node) {
            ensure!(
                !Self::is_red(heap, left) && !Self::is_red(heap, right),
                violation("red node with a red child")
            );
        }
        let (left_height, left_count) = Self::check_subtree(heap, left, node, (bounds.0, size))?;
        let (right_height, right_count) =
            Self::check_subtree(heap, right, node, (size, bounds.1))?;
        ensure!(
            left_height == right_height,
            violation("black heights differ")
        );

        let height = left_height + usize::from(!Self::is_red(heap, node));
        Ok((height, left_count + right_count + 1))
    }

    fn check(&self, heap: Heap) -> Result<(), AllocError> {
        if self.root != NIL {
            ensure!(
                !Self::is_red(heap, self.root),
                TreeInvariantSnafu {
                    offset: self.root,
                    reason: "root is red"
                }
            );
        }
        let (_height, nodes) = Self::check_subtree(heap, self.root, NIL, (0, usize::MAX))?;

        let blocks = self.blocks(heap)?;
        let free = blocks.iter().filter(|block| !block.occupied).count();
        ensure!(
            free == nodes,
            TreeInvariantSnafu {
                offset: self.root,
                reason: "free block count differs from tree size"
            }
        );
        for pair in blocks.windows(2) {
            ensure!(
                pair[0].occupied || pair[1].occupied,
                TreeInvariantSnafu {
                    offset: pair[1].offset,
                    reason: "adjacent free blocks were not merged"
                }
            );
        }
        Ok(())
    }
}

impl FreeSpaceIndex for RedBlackTree {
    const NAME: &'static str = "red-black tree";
    const OCCUPIED_HEADER: usize = 4 * WORD;
    const MIN_BLOCK: usize = 7 * WORD;

    type Candidate = usize;

    fn init(heap: Heap) -> Self {
        heap.write(0, SIZE, heap.len());
        heap.write(0, PREV, NIL);
        heap.write(0, NEXT, NIL);
        let mut tree = Self { root: NIL };
        tree.insert(heap, 0);
        tree
    }

    fn find_fit(&self, heap: Heap, mode: FitMode, needed: usize) -> Option<usize> {
        if mode == FitMode::FirstFit {
            // Take the first node on the path that fits; larger sizes are to
            // the right.
            let mut node = self.root;
            while node != NIL {
                if Self::size(heap, node) >= needed {
                    return Some(node);
                }
                node = Self::right(heap, node);
            }
            return None;
        }

        let mut search = FitSearch::new(mode, needed);
        if self.root == NIL {
            return None;
        }
        let mut node = Self::minimum(heap, self.root);
        while node != NIL {
            if search.offer(Self::size(heap, node), node).is_break() {
                break;
            }
            node = Self::successor(heap, node);
        }
        search.finish()
    }

    fn occupy(&mut self, heap: Heap, node: usize, needed: usize) -> usize {
        let size = Self::size(heap, node);
        assert!(size >= needed, "free block {node} is too small");
        self.remove(heap, node);

        if size - needed >= Self::MIN_BLOCK {
            let remainder = node + needed;
            let next = heap.read(node, NEXT);
            Self::set_meta(heap, remainder, Meta::empty());
            heap.write(remainder, SIZE, size - needed);
            heap.write(remainder, PREV, node);
            heap.write(remainder, NEXT, next);
            if next != NIL {
                heap.write(next, PREV, remainder);
            }
            heap.write(node, NEXT, remainder);
            heap.write(node, SIZE, needed);
            self.insert(heap, remainder);
        }
        Self::set_meta(heap, node, Meta::OCCUPIED);
        node
    }

    fn release(&mut self, heap: Heap, block: usize) -> Result<usize, AllocError> {
        let occupied = heap.has_words(block, 4)
            && Meta::from_bits(heap.read(block, META)) == Some(Meta::OCCUPIED);
        ensure!(occupied, NotOccupiedSnafu { offset: block });
        let size = Self::check_size(heap, block)?;

        let prev = heap.read(block, PREV);
        let next = heap.read(block, NEXT);
        let linked = (prev == NIL
            || (prev < block && heap.has_words(prev, 4) && heap.read(prev, NEXT) == block))
            && (next == NIL
                || (next == block + size
                    && heap.has_words(next, 4)
                    && heap.read(next, PREV) == block));
        ensure!(
            linked,
            CorruptedSnafu {
                offset: block,
                size
            }
        );

        Self::set_meta(heap, block, Meta::empty());
        if next != NIL && Self::is_free(heap, next) {
            self.remove(heap, next);
            Self::absorb_next(heap, block, next);
        }
        let mut merged = block;
        if prev != NIL && Self::is_free(heap, prev) {
            self.remove(heap, prev);
            Self::absorb_next(heap, prev, block);
            merged = prev;
        }
        self.insert(heap, merged);
        Ok(Self::size(heap, merged))
    }

    fn blocks(&self, heap: Heap) -> Result<Vec<BlockInfo>, AllocError> {
        let mut blocks = Vec::new();
        let mut prev = NIL;
        let mut offset = 0;
        while offset < heap.len() {
            let size = Self::check_size(heap, offset)?;
            let meta = Meta::from_bits(heap.read(offset, META));
            let next = heap.read(offset, NEXT);
            let end = offset + size;
            let linked = heap.read(offset, PREV) == prev
                && (next == end || (next == NIL && end == heap.len()));
            ensure!(
                meta.is_some() && linked,
                CorruptedSnafu { offset, size }
            );
            if Self::is_free(heap, offset) {
                blocks.push(BlockInfo::free(offset, size));
            } else {
                blocks.push(BlockInfo::occupied(offset, size));
            }
            prev = offset;
            offset = end;
        }
        Ok(blocks)
    }
}

impl Arena<RedBlackTree> {
    /// Verifies the red-black properties of the free-block tree and its
    /// agreement with the physical block list.
    pub fn check_invariants(&self) -> Result<(), AllocError> {
        let log = self.log();
        self.with_region("check_invariants", |header, heap| {
            header
                .index
                .check(heap)
                .inspect_err(|err| error!(log, "{}: {err}", RedBlackTree::NAME))
        })
    }

    /// Creates an independent copy of the arena, contents included.
    ///
    /// The copy takes its memory from the same parent and reports to the same
    /// sink.
    pub fn try_clone(&self) -> Result<Self, AllocError> {
        self.duplicate()
    }
}
