//! Word-level view over the usable bytes of an arena.
//!
//! Block headers are arrays of `usize` words stored inside the heap itself.
//! [`Heap`] is the only place where those words are read or written through
//! raw pointers; everything above it works with heap-relative byte offsets.
//!
//! ```text
//! arena base
//! ┌───────────────┬──────────────────────────────────────────────┐
//! │ ArenaHeader   │ heap: blocks addressed by offset 0..len      │
//! └───────────────┴──────────────────────────────────────────────┘
//!                 ^ Heap::start
//! ```

use core::ptr::NonNull;

/// Size of one header word.
pub const WORD: usize = size_of::<usize>();

/// Alignment of the arena base and of the heap start.
pub const HEAP_ALIGN: usize = 16;

/// Offset value standing for "no block".
pub(crate) const NIL: usize = usize::MAX;

/// Rounds `size` up to the next multiple of [`WORD`].
pub(crate) fn align_word(size: usize) -> Option<usize> {
    size.checked_next_multiple_of(WORD)
}

/// Copyable handle to the heap area of one arena.
///
/// Every accessor asserts that the addressed word lies inside the heap and is
/// word aligned, so a corrupted link panics instead of touching foreign
/// memory.
#[derive(Debug, Clone, Copy)]
pub struct Heap {
    start: NonNull<u8>,
    len: usize,
}

impl Heap {
    /// Creates a view of `len` bytes starting at `start`.
    ///
    /// # Safety
    ///
    /// `start..start + len` must be valid for reads and writes, word aligned,
    /// and accessed only through this view while it is in use.
    pub(crate) unsafe fn new(start: NonNull<u8>, len: usize) -> Self {
        debug_assert!(start.addr().get().is_multiple_of(WORD));
        Self { start, len }
    }

    /// Number of usable bytes.
    #[must_use]
    pub fn len(self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.len == 0
    }

    /// Address of the first heap byte.
    #[must_use]
    pub fn addr(self) -> usize {
        self.start.addr().get()
    }

    fn word_ptr(self, offset: usize, field: usize) -> *mut usize {
        let pos = field
            .checked_mul(WORD)
            .and_then(|delta| offset.checked_add(delta))
            .filter(|pos| pos.checked_add(WORD).is_some_and(|end| end <= self.len));
        let Some(pos) = pos else {
            panic!(
                "header word {field} of block {offset} is outside of a {} byte heap",
                self.len
            );
        };
        assert!(
            pos.is_multiple_of(WORD),
            "unaligned header word at offset {pos}"
        );
        let byte = unsafe { self.start.as_ptr().add(pos) };
        #[expect(clippy::cast_ptr_alignment)]
        let word = byte.cast::<usize>();
        word
    }

    /// Reads header word `field` of the block starting at `offset`.
    pub(crate) fn read(self, offset: usize, field: usize) -> usize {
        unsafe { self.word_ptr(offset, field).read() }
    }

    /// Writes header word `field` of the block starting at `offset`.
    pub(crate) fn write(self, offset: usize, field: usize, value: usize) {
        unsafe { self.word_ptr(offset, field).write(value) }
    }

    /// Returns `true` if a header of `words` words starting at `offset` fits.
    pub(crate) fn has_words(self, offset: usize, words: usize) -> bool {
        offset.is_multiple_of(WORD)
            && words
                .checked_mul(WORD)
                .and_then(|size| offset.checked_add(size))
                .is_some_and(|end| end <= self.len)
    }

    /// Pointer to the byte at `offset`; `offset == len` yields the end pointer.
    pub(crate) fn ptr_at(self, offset: usize) -> *mut u8 {
        assert!(offset <= self.len, "offset {offset} beyond heap end");
        unsafe { self.start.as_ptr().add(offset) }
    }

    /// Heap offset of `ptr`, or `None` if it points outside `start..=end`.
    pub(crate) fn offset_of(self, ptr: *const u8) -> Option<usize> {
        ptr.addr()
            .checked_sub(self.addr())
            .filter(|&offset| offset <= self.len)
    }
}
