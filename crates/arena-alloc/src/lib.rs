//! Arena allocators over a single pre-allocated region.
//!
//! Each allocator obtains one contiguous block of memory up front (from a
//! parent [`MemoryResource`] or from the global allocator) and serves
//! variable-sized requests out of it. The allocators differ only in how they
//! track free space:
//!
//! | Allocator | Free-space index | Occupied header |
//! |-----------|------------------|-----------------|
//! | [`BoundaryTagAllocator`] | holes between an address-ordered list of occupied blocks | 4 words |
//! | [`RedBlackTreeAllocator`] | red-black tree of free blocks keyed by size | 4 words |
//! | [`SortedListAllocator`] | address-ordered singly linked free list | 1 word |
//!
//! All of them support first-fit, best-fit and worst-fit placement
//! ([`FitMode`]), split oversized free blocks, merge adjacent free blocks on
//! deallocation and can list their blocks ([`Arena::list_blocks`]).
//!
//! # Usage Example
//!
//! ```rust
//! use arena_alloc::{BoundaryTagAllocator, FitMode};
//!
//! let arena = BoundaryTagAllocator::new(1000, None, None, FitMode::FirstFit).unwrap();
//! let ptr = arena.allocate(100).unwrap();
//! assert!(!ptr.is_null());
//!
//! let blocks = arena.list_blocks().unwrap();
//! assert_eq!(blocks.len(), 2);
//! assert!(blocks[0].occupied);
//!
//! unsafe { arena.deallocate(ptr).unwrap() };
//! assert_eq!(arena.list_blocks().unwrap().len(), 1);
//! ```
//!
//! # Nesting
//!
//! Arenas implement [`MemoryResource`] themselves, so one arena can carve its
//! region out of another:
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use arena_alloc::{FitMode, MemoryResource, RedBlackTreeAllocator, SortedListAllocator};
//!
//! let outer: Arc<dyn MemoryResource> =
//!     Arc::new(RedBlackTreeAllocator::new(4096, None, None, FitMode::BestFit).unwrap());
//! let inner = SortedListAllocator::builder(512)
//!     .parent(Arc::clone(&outer))
//!     .build()
//!     .unwrap();
//! assert!(!inner.allocate(64).unwrap().is_null());
//! ```
//!
//! # Thread Safety
//!
//! Every arena holds its state behind a spin lock and is `Send + Sync`. All
//! operations take the lock for their whole duration; separate arenas never
//! contend with each other.

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

pub use self::{
    arena::{Arena, ArenaBuilder},
    boundary_tags::BoundaryTags,
    error::{AllocError, ErrorKind},
    fit::{FitMode, ParseFitModeError},
    heap::{HEAP_ALIGN, WORD},
    index::{BlockInfo, FreeSpaceIndex},
    red_black_tree::RedBlackTree,
    resource::{GlobalResource, MemoryResource, ResourceId},
    sorted_list::SortedList,
};

pub mod arena;
pub mod boundary_tags;
pub mod error;
pub mod fit;
mod header;
pub mod heap;
pub mod index;
pub mod red_black_tree;
pub mod resource;
pub mod sorted_list;

/// Allocator keeping boundary tags on occupied blocks only.
pub type BoundaryTagAllocator = Arena<BoundaryTags>;

/// Allocator keeping free blocks in a red-black tree ordered by size.
pub type RedBlackTreeAllocator = Arena<RedBlackTree>;

/// Allocator keeping free blocks in an address-ordered list.
pub type SortedListAllocator = Arena<SortedList>;
