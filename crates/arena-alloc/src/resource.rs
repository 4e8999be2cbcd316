//! The allocation contract arenas consume from their parent and expose to
//! their users.

use alloc::alloc::{alloc, dealloc};
use core::alloc::Layout;

use snafu::OptionExt as _;

use crate::{
    error::{AllocError, InvalidLayoutSnafu, OutOfMemorySnafu},
    heap::HEAP_ALIGN,
};

/// Identity of the memory a resource hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceId {
    /// The process-wide global allocator.
    Global,
    /// An arena, identified by the address of its memory.
    Arena(usize),
    /// An arena that has been moved out and manages nothing.
    Detached,
}

/// A source of raw memory blocks.
///
/// This is the contract an arena needs from its parent and, in turn, offers
/// to containers and to child arenas.
pub trait MemoryResource: Send + Sync {
    /// Allocates `size` bytes.
    fn allocate(&self, size: usize) -> Result<*mut u8, AllocError>;

    /// Returns a block obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `self.allocate(size)` and not been
    /// deallocated since. Null pointers are accepted and ignored.
    unsafe fn deallocate(&self, ptr: *mut u8, size: usize) -> Result<(), AllocError>;

    fn identity(&self) -> ResourceId;

    /// Two resources are equal if memory obtained from one can be returned to
    /// the other.
    fn is_equal(&self, other: &dyn MemoryResource) -> bool {
        match (self.identity(), other.identity()) {
            (ResourceId::Detached, _) | (_, ResourceId::Detached) => false,
            (this, that) => this == that,
        }
    }
}

/// The global allocator, used when an arena has no parent.
///
/// Blocks are aligned to [`HEAP_ALIGN`].
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalResource;

impl GlobalResource {
    fn layout(size: usize) -> Result<Layout, AllocError> {
        Layout::from_size_align(size, HEAP_ALIGN)
            .ok()
            .filter(|layout| layout.size() > 0)
            .context(InvalidLayoutSnafu { size })
    }
}

impl MemoryResource for GlobalResource {
    fn allocate(&self, size: usize) -> Result<*mut u8, AllocError> {
        let layout = Self::layout(size)?;
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            return OutOfMemorySnafu { requested: size }.fail();
        }
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: *mut u8, size: usize) -> Result<(), AllocError> {
        if ptr.is_null() {
            return Ok(());
        }
        let layout = Self::layout(size)?;
        unsafe { dealloc(ptr, layout) };
        Ok(())
    }

    fn identity(&self) -> ResourceId {
        ResourceId::Global
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use core::ptr;

    use super::*;

    #[test]
    fn global_round_trip() {
        let global = GlobalResource;
        let ptr = global.allocate(64).unwrap();
        assert!(ptr.addr().is_multiple_of(HEAP_ALIGN));
        unsafe {
            ptr.write_bytes(0x33, 64);
            global.deallocate(ptr, 64).unwrap();
        }
    }

    #[test]
    fn global_rejects_zero_size() {
        let err = GlobalResource.allocate(0).unwrap_err();
        assert!(err.kind().is_invalid_argument());
        assert!(matches!(err, AllocError::InvalidLayout { size: 0, .. }));
    }

    #[test]
    fn global_resources_are_equal() {
        assert!(GlobalResource.is_equal(&GlobalResource));
    }

    #[test]
    fn null_deallocation_is_ignored() {
        unsafe { GlobalResource.deallocate(ptr::null_mut(), 16).unwrap() };
    }
}
