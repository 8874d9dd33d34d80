//! This module contains a solver for partial escape analysis with scalar
//! replacement and redundant memory access elimination.
//!
//! The algorithm is based on Lukas Stadler., Thomas Würthinger., and Hanspeter Mössenböck.: Partial Escape Analysis and Scalar Replacement for Java:
//! CGO 2014: <https://dl.acm.org/doi/10.1145/2544137.2544157>
//!
//! Allocations whose shape is statically known are tracked as *virtual
//! objects*: their fields live as ordinary SSA values and the allocation
//! itself is deleted. An object stays virtual per control-flow path and
//! is *materialized* (turned back into a real allocation) only on paths
//! where it escapes. The same abstract-interpretation walk carries a read
//! cache mapping disambiguated memory locations to their last known
//! value, eliminating redundant loads and no-op stores.
//!
//! Analysis and mutation never interleave: the walk is read-only and
//! records deferred [`Effect`]s, which the driver commits once per
//! fixed-point iteration, followed by a dead code elimination pass.

mod block_state;
mod closure;
mod effects;
mod merge;
mod object_state;
mod solver;

pub use effects::{Effect, EffectList};
pub use solver::{Deadline, EaConfig, EscapeSolver};

use thiserror::Error;

/// Internal consistency violations. Any of these means the planned
/// transformation could be unsound; the routine's compilation must be
/// aborted rather than silently miscompiled. Conservative bail-outs
/// (unknown shapes, budget overruns, volatile accesses) are not errors;
/// the analysis simply leaves those operations alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EscapeError {
    #[error("deferred effect `{0}` lost its target")]
    DeadEffectTarget(&'static str),

    #[error("an ensure-virtualized object would be rematerialized")]
    EnsureVirtualizedViolated,

    #[error("phi input count doesn't match merge predecessors")]
    PhiInputCountMismatch,

    #[error("loop state failed to reach a fixed point")]
    LoopDidNotConverge,
}
