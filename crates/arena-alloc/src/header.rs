//! Metadata written at the front of every arena.

use crate::{error::AllocError, fit::FitMode, heap::HEAP_ALIGN};

/// Fixed-layout record at the arena base, followed by the heap.
///
/// ```text
/// ┌──────────┬───────────┬──────────────┬─────────┬────────── ─ ─
/// │ fit_mode │ heap_size │ index (I)    │ padding │ heap ...
/// └──────────┴───────────┴──────────────┴─────────┴────────── ─ ─
/// ```
///
/// The fit mode is stored as its raw discriminant and validated on every
/// read, so a damaged header is reported instead of being trusted.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct ArenaHeader<I> {
    fit_mode: usize,
    heap_size: usize,
    pub(crate) index: I,
}

impl<I> ArenaHeader<I> {
    /// Bytes reserved for the header, padded so the heap stays aligned.
    pub(crate) const SIZE: usize = size_of::<Self>().next_multiple_of(HEAP_ALIGN);

    pub(crate) fn new(fit_mode: FitMode, heap_size: usize, index: I) -> Self {
        Self {
            fit_mode: fit_mode.to_raw(),
            heap_size,
            index,
        }
    }

    pub(crate) fn fit_mode(&self) -> Result<FitMode, AllocError> {
        FitMode::from_raw(self.fit_mode)
    }

    pub(crate) fn set_fit_mode(&mut self, fit_mode: FitMode) {
        self.fit_mode = fit_mode.to_raw();
    }

    #[cfg(test)]
    pub(crate) fn set_raw_fit_mode(&mut self, raw: usize) {
        self.fit_mode = raw;
    }

    pub(crate) fn heap_size(&self) -> usize {
        self.heap_size
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn header_size_keeps_heap_aligned() {
        assert_eq!(ArenaHeader::<usize>::SIZE, 32);
        assert_eq!(ArenaHeader::<[usize; 2]>::SIZE, 32);
        assert_eq!(ArenaHeader::<[usize; 3]>::SIZE, 48);
    }

    #[test]
    fn fit_mode_is_validated() {
        let mut header = ArenaHeader::new(FitMode::BestFit, 128, 0_usize);
        assert_eq!(header.fit_mode().unwrap(), FitMode::BestFit);
        header.set_fit_mode(FitMode::WorstFit);
        assert_eq!(header.fit_mode().unwrap(), FitMode::WorstFit);
        header.set_raw_fit_mode(42);
        assert!(header.fit_mode().unwrap_err().kind().is_invalid_argument());
        assert_eq!(header.heap_size(), 128);
    }
}
