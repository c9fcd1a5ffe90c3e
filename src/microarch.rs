//! Target description: vector geometry, register budget, prefetch tuning.
//!
//! Generation is specialized for x86-64 AVX2 + FMA. The constants here are
//! the single source of truth the register planner and the generators both
//! read, so a change in target geometry is a one-file change.

/// f32 (or i32) lanes per vector register.
pub const VLEN: usize = 8;

/// Bytes per vector register.
pub const VBYTES: usize = VLEN * 4;

/// Architectural vector registers (ymm0..ymm15).
pub const NUM_VEC_REGS: usize = 16;

/// Bytes ahead of the A/B stream pointers to prefetch inside the unrolled
/// reduction loop.
pub const PREFETCH_DIST: i32 = 256;

/// Cache line size, for spacing destination write-prefetches.
pub const CACHE_LINE: usize = 64;

/// K-loop unroll factor for the main reduction loop; the remainder loop
/// steps by one element.
pub const UNROLL_K: usize = 4;

/// Whether the host can execute the code this crate generates.
///
/// There is deliberately no slower fallback path: a host without AVX2/FMA
/// gets `Error::UnsupportedIsa` from `bind`, not different numerics.
pub fn has_required_isa() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        std::is_x86_feature_detected!("avx2") && std::is_x86_feature_detected!("fma")
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}
