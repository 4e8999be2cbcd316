//! Error type shared by every allocator in this crate.

use alloc::boxed::Box;

use derive_more::IsVariant;
use snafu::Snafu;
use snafu_utils::Location;

/// Coarse classification of an [`AllocError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IsVariant)]
pub enum ErrorKind {
    /// The caller passed something the allocator cannot act on.
    InvalidArgument,
    /// Not enough memory, either in the arena or in its parent.
    OutOfMemory,
    /// Block bookkeeping inside the arena is inconsistent.
    Corrupted,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AllocError {
    #[snafu(display("arena size must be greater than zero"))]
    ZeroArenaSize {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("arena is empty (moved out or never initialized)"))]
    EmptyArena {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("unknown fit mode discriminant {value}"))]
    UnknownFitMode {
        value: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("pointer {addr:#x} is outside of the arena heap"))]
    OutOfBounds {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block at heap offset {offset} is not an occupied block of this arena"))]
    NotOccupied {
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("out of memory: cannot serve a request of {requested} bytes"))]
    OutOfMemory {
        requested: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("parent resource failed to provide {requested} bytes"))]
    ParentAllocation {
        requested: usize,
        #[snafu(implicit)]
        location: Location,
        #[snafu(source(from(AllocError, Box::new)))]
        source: Box<AllocError>,
    },
    #[snafu(display("invalid block at heap offset {offset}: size {size}"))]
    Corrupted {
        offset: usize,
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free-block tree violates its invariants at offset {offset}: {reason}"))]
    TreeInvariant {
        offset: usize,
        reason: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("arenas at {target:#x} and {source_addr:#x} are nested in one another"))]
    NestedAssignment {
        target: usize,
        source_addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("cannot describe a memory layout of {size} bytes"))]
    InvalidLayout {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl AllocError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ZeroArenaSize { .. }
            | Self::EmptyArena { .. }
            | Self::UnknownFitMode { .. }
            | Self::OutOfBounds { .. }
            | Self::NotOccupied { .. }
            | Self::NestedAssignment { .. }
            | Self::InvalidLayout { .. } => ErrorKind::InvalidArgument,
            Self::OutOfMemory { .. } | Self::ParentAllocation { .. } => ErrorKind::OutOfMemory,
            Self::Corrupted { .. } | Self::TreeInvariant { .. } => ErrorKind::Corrupted,
        }
    }

    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::ZeroArenaSize { location }
            | Self::EmptyArena { location }
            | Self::UnknownFitMode { location, .. }
            | Self::OutOfBounds { location, .. }
            | Self::NotOccupied { location, .. }
            | Self::OutOfMemory { location, .. }
            | Self::ParentAllocation { location, .. }
            | Self::Corrupted { location, .. }
            | Self::TreeInvariant { location, .. }
            | Self::NestedAssignment { location, .. }
            | Self::InvalidLayout { location, .. } => *location,
        }
    }
}
