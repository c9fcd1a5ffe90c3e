//! Error taxonomy for kernel generation.
//!
//! Everything here is a *generation-time* failure surfaced by `bind`.
//! Invocation-precondition violations (null required pointers, oversized
//! extents) are contract violations and fail fast via assertions instead of
//! flowing through `Result` — a kernel must never produce silently wrong
//! numbers because a caller handed it garbage.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The configuration cannot be realized as a kernel at all.
    #[error("infeasible configuration: {0}")]
    InfeasibleConfig(String),

    /// Requested tile sizes need more vector registers than the target has.
    /// Never degraded to a truncated tiling.
    #[error("register budget exceeded: need {needed} vector registers, have {available}")]
    RegisterBudget { needed: usize, available: usize },

    /// Operand/accumulator data-type combination the generators do not
    /// implement.
    #[error("unsupported data type combination: {0}")]
    UnsupportedDataType(String),

    /// The host CPU lacks an instruction-set feature the generator needs.
    #[error("host ISA missing required feature: {0}")]
    UnsupportedIsa(&'static str),

    /// The assembler failed to produce machine code (e.g. an unresolved
    /// branch target). Indicates a generator bug, but is still reported
    /// rather than panicking so a failed bind cannot poison the registry.
    #[error("kernel assembly failed: {0}")]
    Assembly(String),

    /// The code buffer could not be allocated or made executable.
    #[error("executable buffer: {0}")]
    CodeBuffer(String),
}

pub type Result<T> = std::result::Result<T, Error>;
