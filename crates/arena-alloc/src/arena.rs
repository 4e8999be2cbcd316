//! The allocator skeleton shared by every free-space strategy.
//!
//! An [`Arena`] owns one contiguous region obtained from a parent
//! [`MemoryResource`] (or from the global allocator), writes an
//! [`ArenaHeader`] at its front and delegates every free-space decision to
//! its [`FreeSpaceIndex`]. All operations take the arena mutex for their
//! whole duration.
//!
//! # Moves
//!
//! Rust moves are plain memcpys and cannot take a lock, so the
//! lock-protected ownership transfer is exposed explicitly:
//!
//! - [`Arena::take`] moves the region into a new arena and leaves the source
//!   empty.
//! - [`Arena::assign_from`] releases the target's region and moves the
//!   source's region in, holding both mutexes. Arenas nested in one another
//!   are refused.
//!
//! Every operation on an empty arena fails with
//! [`AllocError::EmptyArena`]; dropping an empty arena does nothing.

use alloc::{sync::Arc, vec::Vec};
use core::{fmt, marker::PhantomData, ptr, ptr::NonNull};

use logger::{LogSink, debug, error, info, trace, warn};
use snafu::{OptionExt as _, ResultExt as _, ensure};
use snafu_utils::Report;
use spin::Mutex;

use crate::{
    error::{
        AllocError, EmptyArenaSnafu, InvalidLayoutSnafu, NestedAssignmentSnafu, OutOfBoundsSnafu,
        OutOfMemorySnafu, ParentAllocationSnafu, ZeroArenaSizeSnafu,
    },
    fit::FitMode,
    header::ArenaHeader,
    heap::{Heap, WORD, align_word},
    index::{BlockInfo, FreeSpaceIndex},
    resource::{GlobalResource, MemoryResource, ResourceId},
};

/// Memory owned by one arena: header followed by the heap.
struct Region {
    base: NonNull<u8>,
    total: usize,
    parent: Option<Arc<dyn MemoryResource>>,
}

// The region is only reachable through the arena mutex.
unsafe impl Send for Region {}

impl Region {
    /// Splits the region into its header and heap view.
    ///
    /// # Safety
    ///
    /// The region must have been initialized with an `ArenaHeader<I>`.
    unsafe fn parts<I>(&mut self) -> (&mut ArenaHeader<I>, Heap) {
        unsafe {
            let header = self.base.cast::<ArenaHeader<I>>().as_mut();
            let start = self.base.add(ArenaHeader::<I>::SIZE);
            let heap = Heap::new(start, header.heap_size());
            (header, heap)
        }
    }

    fn addr(&self) -> usize {
        self.base.addr().get()
    }

    fn contains(&self, addr: usize) -> bool {
        (self.addr()..self.addr() + self.total).contains(&addr)
    }

    /// Hands the memory back to where it came from.
    fn release(self, name: &str, log: Option<&dyn LogSink>) {
        let Self {
            base,
            total,
            parent,
        } = self;
        let result = match &parent {
            Some(parent) => unsafe { parent.deallocate(base.as_ptr(), total) },
            None => unsafe { GlobalResource.deallocate(base.as_ptr(), total) },
        };
        match result {
            Ok(()) => debug!(log, "{name}: returned {total} bytes at {base:p}"),
            Err(err) => error!(
                log,
                "{name}: failed to return {total} bytes at {base:p}\n{}",
                Report::new(err)
            ),
        }
    }
}

/// A heap allocator managing one arena with the strategy `I`.
pub struct Arena<I>
where
    I: FreeSpaceIndex,
{
    region: Mutex<Option<Region>>,
    sink: Option<Arc<dyn LogSink>>,
    _index: PhantomData<fn() -> I>,
}

impl<I> fmt::Debug for Arena<I>
where
    I: FreeSpaceIndex,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Arena");
        d.field("strategy", &I::NAME);
        match self.region.try_lock() {
            Some(region) => match region.as_ref() {
                Some(region) => d
                    .field("base", &region.base)
                    .field("total", &region.total),
                None => d.field("region", &"<empty>"),
            },
            None => d.field("region", &"<locked>"),
        };
        d.finish_non_exhaustive()
    }
}

impl<I> Drop for Arena<I>
where
    I: FreeSpaceIndex,
{
    fn drop(&mut self) {
        if let Some(region) = self.region.get_mut().take() {
            region.release(I::NAME, self.sink.as_deref());
        }
    }
}

impl<I> Arena<I>
where
    I: FreeSpaceIndex,
{
    /// Creates an arena with `arena_size` usable bytes.
    ///
    /// The memory (header included) comes from `parent`, or from the global
    /// allocator if `parent` is `None`. Diagnostics go to `sink` when present.
    ///
    /// The usable size is rounded up to a whole word and raised to
    /// [`FreeSpaceIndex::MIN_BLOCK`] if smaller, so every strategy has room
    /// for its initial free block.
    pub fn new(
        arena_size: usize,
        parent: Option<Arc<dyn MemoryResource>>,
        sink: Option<Arc<dyn LogSink>>,
        fit_mode: FitMode,
    ) -> Result<Self, AllocError> {
        let log = sink.as_deref();
        let name = I::NAME;
        trace!(log, "{name}: creating arena of {arena_size} bytes ({fit_mode})");
        if arena_size == 0 {
            error!(log, "{name}: refusing to create a zero sized arena");
        }
        ensure!(arena_size > 0, ZeroArenaSizeSnafu);

        let (heap_size, total) = align_word(arena_size)
            .map(|size| size.max(I::MIN_BLOCK))
            .and_then(|heap_size| {
                let total = ArenaHeader::<I>::SIZE.checked_add(heap_size)?;
                Some((heap_size, total))
            })
            .context(OutOfMemorySnafu {
                requested: arena_size,
            })?;

        let base = match &parent {
            Some(parent) => parent
                .allocate(total)
                .context(ParentAllocationSnafu { requested: total }),
            None => GlobalResource.allocate(total),
        }
        .inspect_err(|err| error!(log, "{name}: cannot obtain {total} bytes: {err}"))?;
        let Some(base) = NonNull::new(base) else {
            error!(log, "{name}: memory source returned null for {total} bytes");
            return OutOfMemorySnafu { requested: total }.fail();
        };
        let region = Region {
            base,
            total,
            parent,
        };
        if !base.addr().get().is_multiple_of(WORD) {
            error!(log, "{name}: memory at {base:p} is not word aligned");
            region.release(name, log);
            return InvalidLayoutSnafu { size: total }.fail();
        }
        debug!(log, "{name}: obtained {total} bytes at {base:p}");

        unsafe {
            let start = base.add(ArenaHeader::<I>::SIZE);
            let heap = Heap::new(start, heap_size);
            let index = I::init(heap);
            base.cast::<ArenaHeader<I>>()
                .write(ArenaHeader::new(fit_mode, heap_size, index));
        }
        info!(
            log,
            "{name}: arena ready, {heap_size} usable bytes, {} header bytes",
            ArenaHeader::<I>::SIZE
        );

        Ok(Self {
            region: Mutex::new(Some(region)),
            sink,
            _index: PhantomData,
        })
    }

    #[must_use]
    pub fn builder(arena_size: usize) -> ArenaBuilder<I> {
        ArenaBuilder::new(arena_size)
    }

    pub(crate) fn log(&self) -> Option<&dyn LogSink> {
        self.sink.as_deref()
    }

    /// Runs `f` on the header and heap with the arena mutex held.
    pub(crate) fn with_region<R, F>(&self, op: &str, f: F) -> Result<R, AllocError>
    where
        F: FnOnce(&mut ArenaHeader<I>, Heap) -> Result<R, AllocError>,
    {
        let mut region = self.region.lock();
        let Some(region) = region.as_mut() else {
            error!(self.log(), "{}: {op} on an empty arena", I::NAME);
            return EmptyArenaSnafu.fail();
        };
        let (header, heap) = unsafe { region.parts::<I>() };
        f(header, heap)
    }

    /// Allocates a block with room for `size` bytes.
    ///
    /// Returns a pointer just past the block header, aligned to a machine
    /// word. Strategies with [`FreeSpaceIndex::NULL_ON_ZERO`] answer
    /// zero-sized requests with a null pointer.
    pub fn allocate(&self, size: usize) -> Result<*mut u8, AllocError> {
        let log = self.log();
        let name = I::NAME;
        self.with_region("allocate", |header, heap| {
            trace!(log, "{name}: allocate {size} bytes");
            if size == 0 && I::NULL_ON_ZERO {
                debug!(log, "{name}: zero sized request answered with null");
                return Ok(ptr::null_mut());
            }

            let mode = header
                .fit_mode()
                .inspect_err(|err| error!(log, "{name}: {err}"))?;
            let Some(needed) = I::block_size(size).filter(|&needed| needed <= heap.len()) else {
                warn!(
                    log,
                    "{name}: {size} bytes can never fit in a {} byte heap",
                    heap.len()
                );
                return OutOfMemorySnafu { requested: size }.fail();
            };
            let Some(candidate) = header.index.find_fit(heap, mode, needed) else {
                warn!(log, "{name}: no free span of {needed} bytes ({mode})");
                return OutOfMemorySnafu { requested: size }.fail();
            };

            let block = header.index.occupy(heap, candidate, needed);
            debug!(
                log,
                "{name}: placed {size} bytes in block at offset {block} ({mode})"
            );
            Ok(heap.ptr_at(block + I::OCCUPIED_HEADER))
        })
    }

    /// Returns a block to the arena, merging it with free neighbours.
    ///
    /// A null pointer is ignored. Pointers outside the heap are rejected with
    /// [`AllocError::OutOfBounds`].
    ///
    /// # Safety
    ///
    /// A non-null `ptr` must have been returned by [`allocate`](Self::allocate)
    /// on this arena and must not have been deallocated since. The strategies
    /// detect some violations, but not all of them.
    pub unsafe fn deallocate(&self, ptr: *mut u8) -> Result<(), AllocError> {
        if ptr.is_null() {
            return Ok(());
        }
        let log = self.log();
        let name = I::NAME;
        self.with_region("deallocate", |header, heap| {
            trace!(log, "{name}: deallocate {ptr:p}");
            let block = heap
                .offset_of(ptr)
                .and_then(|offset| offset.checked_sub(I::OCCUPIED_HEADER))
                .filter(|&block| block < heap.len());
            let Some(block) = block else {
                error!(log, "{name}: {ptr:p} is outside of the heap");
                return OutOfBoundsSnafu { addr: ptr.addr() }.fail();
            };

            let freed = header
                .index
                .release(heap, block)
                .inspect_err(|err| error!(log, "{name}: cannot free {ptr:p}: {err}"))?;
            debug!(
                log,
                "{name}: freed block at offset {block}, free span is now {freed} bytes"
            );
            Ok(())
        })
    }

    /// Lists every block of the heap in address order.
    ///
    /// An empty arena yields an empty list (and an error log entry).
    pub fn list_blocks(&self) -> Result<Vec<BlockInfo>, AllocError> {
        let log = self.log();
        let name = I::NAME;
        let mut region = self.region.lock();
        let Some(region) = region.as_mut() else {
            error!(log, "{name}: listing blocks of an empty arena");
            return Ok(Vec::new());
        };
        let (header, heap) = unsafe { region.parts::<I>() };
        header
            .index
            .blocks(heap)
            .inspect_err(|err| error!(log, "{name}: heap walk failed: {err}"))
    }

    pub fn set_fit_mode(&self, fit_mode: FitMode) -> Result<(), AllocError> {
        let log = self.log();
        self.with_region("set_fit_mode", |header, _heap| {
            header.set_fit_mode(fit_mode);
            debug!(log, "{}: fit mode set to {fit_mode}", I::NAME);
            Ok(())
        })
    }

    pub fn fit_mode(&self) -> Result<FitMode, AllocError> {
        self.with_region("fit_mode", |header, _heap| header.fit_mode())
    }

    /// Usable heap bytes, block headers included.
    pub fn capacity(&self) -> Result<usize, AllocError> {
        self.with_region("capacity", |_header, heap| Ok(heap.len()))
    }

    /// Returns `true` if the arena has been moved out.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.region.lock().is_none()
    }

    /// Moves the arena into a new value, leaving `self` empty.
    ///
    /// The new arena reports to the same sink.
    #[must_use]
    pub fn take(&self) -> Self {
        let region = self.region.lock().take();
        if region.is_none() {
            warn!(self.log(), "{}: taking from an empty arena", I::NAME);
        }
        Self {
            region: Mutex::new(region),
            sink: self.sink.clone(),
            _index: PhantomData,
        }
    }

    /// Replaces the arena of `self` with the one of `source`.
    ///
    /// The previous arena of `self` is released first. Both mutexes are held
    /// for the whole operation and are acquired in address order, so two
    /// opposite assignments running concurrently cannot deadlock.
    ///
    /// Fails with [`AllocError::NestedAssignment`] if either arena lives
    /// inside the other, leaving both untouched. Releasing a child into the
    /// parent whose lock is held here would never return.
    pub fn assign_from(&self, source: &Self) -> Result<(), AllocError> {
        if ptr::eq(self, source) {
            return Ok(());
        }
        let (mut target, mut incoming) =
            if ptr::from_ref(self).addr() < ptr::from_ref(source).addr() {
                let target = self.region.lock();
                let incoming = source.region.lock();
                (target, incoming)
            } else {
                let incoming = source.region.lock();
                let target = self.region.lock();
                (target, incoming)
            };
        let nested = match (target.as_ref(), incoming.as_ref()) {
            (Some(previous), Some(next))
                if previous.contains(next.addr()) || next.contains(previous.addr()) =>
            {
                Some((previous.addr(), next.addr()))
            }
            _ => None,
        };
        if let Some((target_addr, source_addr)) = nested {
            error!(
                self.log(),
                "{}: refusing to assign between nested arenas at {target_addr:#x} and {source_addr:#x}",
                I::NAME
            );
            return NestedAssignmentSnafu {
                target: target_addr,
                source_addr,
            }
            .fail();
        }
        if let Some(previous) = target.take() {
            previous.release(I::NAME, self.log());
        }
        *target = incoming.take();
        debug!(self.log(), "{}: arena moved in by assignment", I::NAME);
        Ok(())
    }

    /// Copies the whole arena into a fresh region from the same parent.
    ///
    /// Only valid for strategies whose headers hold no absolute addresses.
    pub(crate) fn duplicate(&self) -> Result<Self, AllocError> {
        let log = self.log();
        let name = I::NAME;
        let mut guard = self.region.lock();
        let Some(region) = guard.as_mut() else {
            error!(log, "{name}: cloning an empty arena");
            return EmptyArenaSnafu.fail();
        };
        let total = region.total;
        let base = match &region.parent {
            Some(parent) => parent
                .allocate(total)
                .context(ParentAllocationSnafu { requested: total }),
            None => GlobalResource.allocate(total),
        }
        .inspect_err(|err| error!(log, "{name}: cannot obtain {total} bytes: {err}"))?;
        let base = NonNull::new(base).context(OutOfMemorySnafu { requested: total })?;
        unsafe {
            ptr::copy_nonoverlapping(region.base.as_ptr(), base.as_ptr(), total);
        }
        debug!(log, "{name}: copied {total} bytes to {base:p}");

        let copy = Region {
            base,
            total,
            parent: region.parent.clone(),
        };
        Ok(Self {
            region: Mutex::new(Some(copy)),
            sink: self.sink.clone(),
            _index: PhantomData,
        })
    }
}

impl<I> MemoryResource for Arena<I>
where
    I: FreeSpaceIndex,
{
    fn allocate(&self, size: usize) -> Result<*mut u8, AllocError> {
        Arena::<I>::allocate(self, size)
    }

    unsafe fn deallocate(&self, ptr: *mut u8, _size: usize) -> Result<(), AllocError> {
        unsafe { Arena::<I>::deallocate(self, ptr) }
    }

    fn identity(&self) -> ResourceId {
        self.region
            .lock()
            .as_ref()
            .map_or(ResourceId::Detached, |region| ResourceId::Arena(region.addr()))
    }
}

/// Step-by-step construction of an [`Arena`].
///
/// ```
/// use arena_alloc::{FitMode, SortedListAllocator};
///
/// let arena = SortedListAllocator::builder(4096)
///     .fit_mode(FitMode::BestFit)
///     .build()
///     .unwrap();
/// assert_eq!(arena.capacity().unwrap(), 4096);
/// ```
pub struct ArenaBuilder<I> {
    arena_size: usize,
    fit_mode: FitMode,
    parent: Option<Arc<dyn MemoryResource>>,
    sink: Option<Arc<dyn LogSink>>,
    _index: PhantomData<fn() -> I>,
}

impl<I> ArenaBuilder<I>
where
    I: FreeSpaceIndex,
{
    fn new(arena_size: usize) -> Self {
        Self {
            arena_size,
            fit_mode: FitMode::default(),
            parent: None,
            sink: None,
            _index: PhantomData,
        }
    }

    #[must_use]
    pub fn fit_mode(mut self, fit_mode: FitMode) -> Self {
        self.fit_mode = fit_mode;
        self
    }

    /// Takes the arena memory from `parent` instead of the global allocator.
    #[must_use]
    pub fn parent(mut self, parent: Arc<dyn MemoryResource>) -> Self {
        self.parent = Some(parent);
        self
    }

    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Arena<I>, AllocError> {
        Arena::new(self.arena_size, self.parent, self.sink, self.fit_mode)
    }
}
