//! The seam between the generic [`Arena`](crate::arena::Arena) and the three
//! ways of tracking free space.

use alloc::vec::Vec;

use crate::{
    error::AllocError,
    fit::FitMode,
    heap::{Heap, align_word},
};

/// One entry of an arena's block map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    /// Heap offset of the first header byte.
    pub offset: usize,
    /// Size of the block, header included.
    pub size: usize,
    pub occupied: bool,
}

impl BlockInfo {
    pub(crate) fn free(offset: usize, size: usize) -> Self {
        Self {
            offset,
            size,
            occupied: false,
        }
    }

    pub(crate) fn occupied(offset: usize, size: usize) -> Self {
        Self {
            offset,
            size,
            occupied: true,
        }
    }

    /// Heap offset one past the last byte of the block.
    #[must_use]
    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Free-space bookkeeping stored in the arena header.
///
/// Implementors are the strategy-specific part of the header (a list head or
/// a tree root) and keep all other state inside the heap blocks themselves.
/// Every method runs with the arena mutex held.
pub trait FreeSpaceIndex: Sized + Send + 'static {
    /// Human readable strategy name used in diagnostics.
    const NAME: &'static str;

    /// Header bytes in front of the payload of an occupied block.
    const OCCUPIED_HEADER: usize;

    /// Smallest block the strategy can represent.
    ///
    /// A split leaves a remainder only if it is at least this large.
    const MIN_BLOCK: usize;

    /// Whether zero-sized requests are answered with a null pointer.
    const NULL_ON_ZERO: bool = false;

    /// A free span chosen by [`find_fit`](Self::find_fit).
    type Candidate: Copy;

    /// Sets up an empty heap and returns the header state describing it.
    fn init(heap: Heap) -> Self;

    /// Searches for a free span of at least `needed` bytes.
    fn find_fit(&self, heap: Heap, mode: FitMode, needed: usize) -> Option<Self::Candidate>;

    /// Turns `candidate` into an occupied block of at least `needed` bytes and
    /// returns its heap offset.
    fn occupy(&mut self, heap: Heap, candidate: Self::Candidate, needed: usize) -> usize;

    /// Frees the occupied block at `block`, merging it with free neighbours.
    ///
    /// Returns the size of the resulting free span.
    fn release(&mut self, heap: Heap, block: usize) -> Result<usize, AllocError>;

    /// Lists every block in address order.
    fn blocks(&self, heap: Heap) -> Result<Vec<BlockInfo>, AllocError>;

    /// Block size needed to serve a payload of `size` bytes.
    fn block_size(size: usize) -> Option<usize> {
        align_word(size)?
            .checked_add(Self::OCCUPIED_HEADER)
            .map(|needed| needed.max(Self::MIN_BLOCK))
    }
}
