#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]
#![cfg(test)]

use std::{
    ptr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use arena_alloc::{
    AllocError, Arena, BlockInfo, BoundaryTagAllocator, BoundaryTags, FitMode, FreeSpaceIndex,
    GlobalResource, MemoryResource, RedBlackTree, RedBlackTreeAllocator, ResourceId, SortedList,
};
use logger::{LogLevel, LogSink, MemorySink};

/// Instantiates a generic test body once per allocator.
macro_rules! for_each_allocator {
    ($($name:ident),* $(,)?) => {
        mod boundary_tags {
            $(
                #[test]
                fn $name() {
                    super::$name::<super::BoundaryTags>();
                }
            )*
        }
        mod red_black_tree {
            $(
                #[test]
                fn $name() {
                    super::$name::<super::RedBlackTree>();
                }
            )*
        }
        mod sorted_list {
            $(
                #[test]
                fn $name() {
                    super::$name::<super::SortedList>();
                }
            )*
        }
    };
}

for_each_allocator!(
    round_trip_preserves_contents,
    blocks_tile_the_heap,
    fit_mode_selects_span,
    free_order_does_not_matter,
    exhaustion_leaves_state_unchanged,
    take_moves_the_arena,
    assign_releases_previous_arena,
    nested_arena_returns_memory,
    assign_between_nested_arenas_is_refused,
    concurrent_use_keeps_heap_consistent,
    diagnostics_reach_the_sink,
    failing_parent_is_reported,
    foreign_pointer_is_out_of_bounds,
    equality_follows_identity,
);

fn block_size<I: FreeSpaceIndex>(size: usize) -> usize {
    I::block_size(size).unwrap()
}

fn new_arena<I: FreeSpaceIndex>(size: usize, mode: FitMode) -> Arena<I> {
    Arena::new(size, None, None, mode).unwrap()
}

fn assert_tiles(blocks: &[BlockInfo], capacity: usize) {
    let mut offset = 0;
    for block in blocks {
        assert_eq!(block.offset, offset, "gap or overlap in {blocks:?}");
        offset = block.end();
    }
    assert_eq!(offset, capacity);
}

fn assert_single_free<I: FreeSpaceIndex>(arena: &Arena<I>) {
    let capacity = arena.capacity().unwrap();
    assert_eq!(
        arena.list_blocks().unwrap(),
        [BlockInfo {
            offset: 0,
            size: capacity,
            occupied: false
        }]
    );
}

fn shared(sink: &Arc<MemorySink>) -> Arc<dyn LogSink> {
    let sink: Arc<MemorySink> = Arc::clone(sink);
    sink
}

fn as_resource<R>(resource: &Arc<R>) -> Arc<dyn MemoryResource>
where
    R: MemoryResource + 'static,
{
    let resource: Arc<R> = Arc::clone(resource);
    resource
}

/// Parent resource counting the bytes it has handed out.
#[derive(Debug, Default)]
struct CountingResource {
    live: AtomicUsize,
    fail_allocate: bool,
    fail_deallocate: bool,
}

impl MemoryResource for CountingResource {
    fn allocate(&self, size: usize) -> Result<*mut u8, AllocError> {
        if self.fail_allocate {
            // Asking the global resource for nothing yields a real error value.
            return GlobalResource.allocate(0);
        }
        let ptr = GlobalResource.allocate(size)?;
        self.live.fetch_add(size, Ordering::SeqCst);
        Ok(ptr)
    }

    unsafe fn deallocate(&self, ptr: *mut u8, size: usize) -> Result<(), AllocError> {
        unsafe { GlobalResource.deallocate(ptr, size)? };
        self.live.fetch_sub(size, Ordering::SeqCst);
        if self.fail_deallocate {
            return GlobalResource.allocate(0).map(|_| ());
        }
        Ok(())
    }

    fn identity(&self) -> ResourceId {
        ResourceId::Global
    }
}

fn round_trip_preserves_contents<I: FreeSpaceIndex>() {
    let sizes = [1, 7, 8, 24, 100, 333];
    for mode in FitMode::ALL {
        let arena = new_arena::<I>(4096, mode);
        let ptrs = sizes.map(|size| arena.allocate(size).unwrap());
        for (index, (&ptr, &size)) in ptrs.iter().zip(&sizes).enumerate() {
            assert!(!ptr.is_null(), "{mode}");
            assert!(ptr.addr().is_multiple_of(arena_alloc::WORD));
            unsafe { ptr.write_bytes(u8::try_from(index).unwrap(), size) };
        }
        for (index, (&ptr, &size)) in ptrs.iter().zip(&sizes).enumerate() {
            let payload = unsafe { std::slice::from_raw_parts(ptr, size) };
            assert!(
                payload.iter().all(|&byte| usize::from(byte) == index),
                "{mode}"
            );
        }
        // Free out of allocation order so merges happen on both sides.
        for index in [3, 0, 5, 1, 4, 2] {
            unsafe { arena.deallocate(ptrs[index]).unwrap() };
        }
        assert_single_free(&arena);
    }
}

fn blocks_tile_the_heap<I: FreeSpaceIndex>() {
    let arena = new_arena::<I>(3000, FitMode::BestFit);
    let mut live = vec![];
    for size in [10, 200, 30, 400, 50, 600, 70] {
        live.push(arena.allocate(size).unwrap());
    }
    for index in [5, 1, 3] {
        unsafe { arena.deallocate(live[index]).unwrap() };
    }
    arena.allocate(150).unwrap();

    let blocks = arena.list_blocks().unwrap();
    assert_tiles(&blocks, arena.capacity().unwrap());
    let occupied = blocks.iter().filter(|block| block.occupied).count();
    assert_eq!(occupied, 5);
    for block in &blocks {
        assert!(block.size >= I::MIN_BLOCK);
    }
}

fn fit_mode_selects_span<I: FreeSpaceIndex>() {
    // Free spans of H+200, H+400 and H+160 bytes, separated by occupied guards
    // and with no tail.
    let sizes = [200, 8, 400, 8, 160, 8];
    let capacity = sizes.iter().map(|&size| block_size::<I>(size)).sum();
    let expected = [
        (FitMode::FirstFit, 0),
        (FitMode::BestFit, 4),
        (FitMode::WorstFit, 2),
    ];
    for (mode, index) in expected {
        let arena = new_arena::<I>(capacity, FitMode::FirstFit);
        let ptrs = sizes.map(|size| arena.allocate(size).unwrap());
        for freed in [0, 2, 4] {
            unsafe { arena.deallocate(ptrs[freed]).unwrap() };
        }
        arena.set_fit_mode(mode).unwrap();
        assert_eq!(arena.fit_mode().unwrap(), mode);

        let ptr = arena.allocate(152).unwrap();
        if I::NAME == RedBlackTree::NAME && mode == FitMode::FirstFit {
            // Tree descent order is not address order.
            assert!([0, 2, 4].iter().any(|&index| ptrs[index] == ptr));
        } else {
            assert_eq!(ptr, ptrs[index], "{mode}");
        }
    }
}

fn free_order_does_not_matter<I: FreeSpaceIndex>() {
    let orders = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];
    for order in orders {
        let arena = new_arena::<I>(1024, FitMode::FirstFit);
        let ptrs = [64, 96, 128].map(|size| arena.allocate(size).unwrap());
        for index in order {
            unsafe { arena.deallocate(ptrs[index]).unwrap() };
            assert_tiles(&arena.list_blocks().unwrap(), 1024);
        }
        assert_single_free(&arena);
    }
}

fn exhaustion_leaves_state_unchanged<I: FreeSpaceIndex>() {
    let arena = new_arena::<I>(1024, FitMode::WorstFit);
    let err = arena.allocate(1024).unwrap_err();
    assert!(err.kind().is_out_of_memory());
    assert_single_free(&arena);

    let mut count = 0;
    loop {
        match arena.allocate(40) {
            Ok(_) => count += 1,
            Err(err) => {
                assert!(matches!(err, AllocError::OutOfMemory { requested: 40, .. }));
                break;
            }
        }
    }
    assert!(count >= 1024 / block_size::<I>(40) - 1);

    let before = arena.list_blocks().unwrap();
    assert!(arena.allocate(40).is_err());
    assert_eq!(arena.list_blocks().unwrap(), before);
}

fn take_moves_the_arena<I: FreeSpaceIndex>() {
    let source = new_arena::<I>(512, FitMode::BestFit);
    let ptr = source.allocate(32).unwrap();

    let target = source.take();
    assert!(source.is_empty());
    assert!(matches!(
        source.allocate(8).unwrap_err(),
        AllocError::EmptyArena { .. }
    ));
    assert!(source.fit_mode().unwrap_err().kind().is_invalid_argument());

    assert_eq!(target.fit_mode().unwrap(), FitMode::BestFit);
    unsafe { target.deallocate(ptr).unwrap() };
    assert_single_free(&target);

    // Taking from an empty arena yields another empty arena.
    assert!(source.take().is_empty());
}

fn assign_releases_previous_arena<I: FreeSpaceIndex>() {
    let parent = Arc::new(CountingResource::default());
    let first = Arena::<I>::builder(256)
        .parent(as_resource(&parent))
        .build()
        .unwrap();
    let second = Arena::<I>::builder(512)
        .parent(as_resource(&parent))
        .build()
        .unwrap();
    let both = parent.live.load(Ordering::SeqCst);
    let ptr = second.allocate(16).unwrap();

    first.assign_from(&second).unwrap();
    assert!(second.is_empty());
    assert_eq!(first.capacity().unwrap(), 512);
    assert!(parent.live.load(Ordering::SeqCst) < both);
    unsafe { first.deallocate(ptr).unwrap() };

    // Self-assignment keeps the arena.
    first.assign_from(&first).unwrap();
    assert_eq!(first.capacity().unwrap(), 512);

    drop(first);
    drop(second);
    assert_eq!(parent.live.load(Ordering::SeqCst), 0);
}

fn nested_arena_returns_memory<I: FreeSpaceIndex>() {
    let outer = Arc::new(RedBlackTreeAllocator::new(4096, None, None, FitMode::FirstFit).unwrap());
    {
        let inner = Arena::<I>::builder(1000)
            .parent(as_resource(&outer))
            .build()
            .unwrap();
        let ptr = inner.allocate(100).unwrap();
        assert!(!ptr.is_null());

        let blocks = outer.list_blocks().unwrap();
        assert!(blocks[0].occupied);
        assert!(blocks[0].size > 1000);
        outer.check_invariants().unwrap();
    }
    assert_single_free(&*outer);

    let err = Arena::<I>::builder(8192)
        .parent(as_resource(&outer))
        .build()
        .unwrap_err();
    assert!(matches!(err, AllocError::ParentAllocation { .. }));
    assert!(err.kind().is_out_of_memory());
}

fn assign_between_nested_arenas_is_refused<I: FreeSpaceIndex>() {
    let sink = Arc::new(MemorySink::new(LogLevel::Error));
    let parent = Arc::new(
        Arena::<I>::builder(4096)
            .sink(shared(&sink))
            .build()
            .unwrap(),
    );
    let child = Arena::<I>::builder(256)
        .parent(as_resource(&parent))
        .sink(shared(&sink))
        .build()
        .unwrap();
    let ptr = child.allocate(16).unwrap();

    let err = child.assign_from(&parent).unwrap_err();
    assert!(matches!(err, AllocError::NestedAssignment { .. }));
    assert!(err.kind().is_invalid_argument());
    let err = parent.assign_from(&child).unwrap_err();
    assert!(matches!(err, AllocError::NestedAssignment { .. }));
    assert!(sink.contains(LogLevel::Error, "nested arenas"));

    // Both arenas are untouched.
    assert_eq!(child.capacity().unwrap(), 256);
    assert_eq!(parent.capacity().unwrap(), 4096);
    unsafe { child.deallocate(ptr).unwrap() };
    assert_single_free(&child);

    // A sibling carved from the same parent is not nested.
    let sibling = Arena::<I>::builder(128)
        .parent(as_resource(&parent))
        .build()
        .unwrap();
    child.assign_from(&sibling).unwrap();
    assert_eq!(child.capacity().unwrap(), 128);
    drop(child);
    drop(sibling);
    assert_single_free(&*parent);
}

fn concurrent_use_keeps_heap_consistent<I: FreeSpaceIndex>() {
    let arena = Arc::new(new_arena::<I>(64 * 1024, FitMode::FirstFit));
    let handles: Vec<_> = (0..4_u8)
        .map(|id| {
            let arena = Arc::clone(&arena);
            thread::spawn(move || {
                for round in 0..200 {
                    let size = 16 + usize::from(id) * 8 + round % 64;
                    let ptr = arena.allocate(size).unwrap();
                    unsafe {
                        ptr.write_bytes(id, size);
                        assert!(std::slice::from_raw_parts(ptr, size).iter().all(|&b| b == id));
                        arena.deallocate(ptr).unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_single_free(&*arena);
}

fn diagnostics_reach_the_sink<I: FreeSpaceIndex>() {
    let sink = Arc::new(MemorySink::new(LogLevel::Debug));
    let arena = Arena::<I>::builder(256)
        .sink(shared(&sink))
        .build()
        .unwrap();
    assert!(sink.contains(LogLevel::Info, I::NAME));
    assert_eq!(sink.count(LogLevel::Trace), 0);

    let _ = arena.allocate(4096).unwrap_err();
    assert!(sink.contains(LogLevel::Warn, "can never fit"));

    let mut outside = [0_usize; 4];
    let err = unsafe { arena.deallocate(outside.as_mut_ptr().cast()) }.unwrap_err();
    assert!(matches!(err, AllocError::OutOfBounds { .. }));
    assert!(sink.contains(LogLevel::Error, "outside of the heap"));

    sink.clear();
    drop(arena);
    assert!(sink.contains(LogLevel::Debug, "returned"));
}

fn failing_parent_is_reported<I: FreeSpaceIndex>() {
    let sink = Arc::new(MemorySink::new(LogLevel::Trace));
    let broken = Arc::new(CountingResource {
        fail_allocate: true,
        ..CountingResource::default()
    });
    let err = Arena::<I>::builder(128)
        .parent(broken)
        .sink(shared(&sink))
        .build()
        .unwrap_err();
    assert!(matches!(err, AllocError::ParentAllocation { .. }));
    assert!(sink.contains(LogLevel::Error, "cannot obtain"));

    let leaky = Arc::new(CountingResource {
        fail_deallocate: true,
        ..CountingResource::default()
    });
    let arena = Arena::<I>::builder(128)
        .parent(as_resource(&leaky))
        .sink(shared(&sink))
        .build()
        .unwrap();
    sink.clear();
    drop(arena);
    assert!(sink.contains(LogLevel::Error, "failed to return"));
    assert_eq!(leaky.live.load(Ordering::SeqCst), 0);
}

fn foreign_pointer_is_out_of_bounds<I: FreeSpaceIndex>() {
    let arena = new_arena::<I>(256, FitMode::FirstFit);
    let other = new_arena::<I>(256, FitMode::FirstFit);
    let ptr = other.allocate(16).unwrap();
    let err = unsafe { arena.deallocate(ptr) }.unwrap_err();
    assert!(matches!(err, AllocError::OutOfBounds { .. }));
    unsafe {
        arena.deallocate(ptr::null_mut()).unwrap();
        other.deallocate(ptr).unwrap();
    }
}

fn equality_follows_identity<I: FreeSpaceIndex>() {
    let arena = new_arena::<I>(128, FitMode::FirstFit);
    let other = new_arena::<I>(128, FitMode::FirstFit);
    assert!(arena.is_equal(&arena));
    assert!(!arena.is_equal(&other));
    assert!(!arena.is_equal(&GlobalResource));
    assert!(GlobalResource.is_equal(&GlobalResource));

    let moved = arena.take();
    assert!(!arena.is_equal(&moved));
    assert!(moved.is_equal(&moved));
}

#[test]
fn sorted_list_answers_zero_with_null() {
    let arena = new_arena::<SortedList>(128, FitMode::FirstFit);
    assert!(arena.allocate(0).unwrap().is_null());
    assert_single_free(&arena);

    let arena = new_arena::<BoundaryTags>(128, FitMode::FirstFit);
    assert!(!arena.allocate(0).unwrap().is_null());
    let arena = new_arena::<RedBlackTree>(128, FitMode::FirstFit);
    assert!(!arena.allocate(0).unwrap().is_null());
}

#[test]
fn zero_sized_arena_is_rejected() {
    let err = Arena::<RedBlackTree>::new(0, None, None, FitMode::FirstFit).unwrap_err();
    assert!(matches!(err, AllocError::ZeroArenaSize { .. }));
    assert!(err.kind().is_invalid_argument());
}

#[test]
fn red_black_tree_survives_churn_in_every_mode() {
    let arena = new_arena::<RedBlackTree>(32 * 1024, FitMode::FirstFit);
    let mut state = 0x9e37_79b9_u32;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        usize::try_from(state).unwrap()
    };

    let mut live = vec![];
    for round in 0..2000 {
        if round % 100 == 0 {
            arena.set_fit_mode(FitMode::ALL[round / 100 % 3]).unwrap();
        }
        let value = next();
        if value % 5 < 2 && !live.is_empty() {
            let ptr = live.swap_remove(value % live.len());
            unsafe { arena.deallocate(ptr).unwrap() };
        } else if let Ok(ptr) = arena.allocate(value % 512) {
            assert!(!live.contains(&ptr));
            live.push(ptr);
        }
        if round % 50 == 0 {
            arena.check_invariants().unwrap();
        }
    }

    let copy = arena.try_clone().unwrap();
    copy.check_invariants().unwrap();
    assert_eq!(copy.list_blocks().unwrap(), arena.list_blocks().unwrap());

    for ptr in live {
        unsafe { arena.deallocate(ptr).unwrap() };
    }
    arena.check_invariants().unwrap();
    assert_single_free(&arena);
}

#[test]
fn documented_boundary_tag_scenario() {
    let arena = BoundaryTagAllocator::new(1000, None, None, FitMode::FirstFit).unwrap();
    let h1 = arena.allocate(100).unwrap();
    let h2 = arena.allocate(200).unwrap();
    let h3 = arena.allocate(300).unwrap();
    assert!(h1 < h2 && h2 < h3);

    let layout = |arena: &BoundaryTagAllocator| -> Vec<(usize, bool)> {
        arena
            .list_blocks()
            .unwrap()
            .iter()
            .map(|block| (block.size, block.occupied))
            .collect()
    };
    assert_eq!(
        layout(&arena),
        [(136, true), (232, true), (336, true), (296, false)]
    );

    unsafe { arena.deallocate(h2).unwrap() };
    assert_eq!(
        layout(&arena),
        [(136, true), (232, false), (336, true), (296, false)]
    );

    // The freed span is reused first.
    let h4 = arena.allocate(150).unwrap();
    assert_eq!(h4, h2);

    unsafe {
        arena.deallocate(h1).unwrap();
        arena.deallocate(h3).unwrap();
        arena.deallocate(h4).unwrap();
    }
    assert_single_free(&arena);
}
