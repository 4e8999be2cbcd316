//! Placement policies shared by all allocators.
//!
//! Each allocator enumerates its free spans in its own order and feeds them
//! to a [`FitSearch`], which keeps the candidate the selected [`FitMode`]
//! prefers:
//!
//! | mode       | picks                                   | stops early when       |
//! |------------|-----------------------------------------|------------------------|
//! | `FirstFit` | first span that is large enough         | a span fits            |
//! | `BestFit`  | smallest slack, first one on ties       | a span fits exactly    |
//! | `WorstFit` | largest slack, first one on ties        | never                  |

use alloc::string::{String, ToString as _};
use core::{ops::ControlFlow, str::FromStr};

use derive_more::{Display, IsVariant};
use snafu::Snafu;

use crate::error::{AllocError, UnknownFitModeSnafu};

/// Policy choosing which free span serves an allocation request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display, IsVariant)]
#[repr(usize)]
pub enum FitMode {
    #[default]
    #[display("first-fit")]
    FirstFit = 0,
    #[display("best-fit")]
    BestFit = 1,
    #[display("worst-fit")]
    WorstFit = 2,
}

impl FitMode {
    pub const ALL: [Self; 3] = [Self::FirstFit, Self::BestFit, Self::WorstFit];

    /// Raw discriminant as stored in the arena header.
    #[must_use]
    pub fn to_raw(self) -> usize {
        self as usize
    }

    /// Decodes a discriminant read back from an arena header.
    pub fn from_raw(value: usize) -> Result<Self, AllocError> {
        match value {
            0 => Ok(Self::FirstFit),
            1 => Ok(Self::BestFit),
            2 => Ok(Self::WorstFit),
            _ => UnknownFitModeSnafu { value }.fail(),
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("unknown fit mode `{input}`, expected `first`, `best` or `worst`"))]
pub struct ParseFitModeError {
    input: String,
}

impl FromStr for FitMode {
    type Err = ParseFitModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first" | "first-fit" => Ok(Self::FirstFit),
            "best" | "best-fit" => Ok(Self::BestFit),
            "worst" | "worst-fit" => Ok(Self::WorstFit),
            _ => ParseFitModeSnafu {
                input: s.to_string(),
            }
            .fail(),
        }
    }
}

/// Running selection of a free span for one request of `needed` bytes.
#[derive(Debug)]
pub(crate) struct FitSearch<T> {
    mode: FitMode,
    needed: usize,
    chosen: Option<(usize, T)>,
}

impl<T> FitSearch<T> {
    pub(crate) fn new(mode: FitMode, needed: usize) -> Self {
        Self {
            mode,
            needed,
            chosen: None,
        }
    }

    /// Considers a free span of `size` bytes.
    ///
    /// Returns [`ControlFlow::Break`] once no later span can be preferred.
    pub(crate) fn offer(&mut self, size: usize, candidate: T) -> ControlFlow<()> {
        let Some(slack) = size.checked_sub(self.needed) else {
            return ControlFlow::Continue(());
        };
        match self.mode {
            FitMode::FirstFit => {
                self.chosen = Some((slack, candidate));
                ControlFlow::Break(())
            }
            FitMode::BestFit => {
                if self.chosen.as_ref().is_none_or(|(best, _)| slack < *best) {
                    self.chosen = Some((slack, candidate));
                }
                if slack == 0 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            }
            FitMode::WorstFit => {
                if self.chosen.as_ref().is_none_or(|(worst, _)| slack > *worst) {
                    self.chosen = Some((slack, candidate));
                }
                ControlFlow::Continue(())
            }
        }
    }

    pub(crate) fn finish(self) -> Option<T> {
        self.chosen.map(|(_, candidate)| candidate)
    }
}
