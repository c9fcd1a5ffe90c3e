//! Generated kernel objects and the runtime invocation ABI.
//!
//! A generated kernel is called as a C-ABI function taking a single pointer
//! to an argument record. The record layout is `#[repr(C)]` and the
//! generators read field offsets with `offset_of!`, so the structs below are
//! the single source of truth for the ABI. Callers can pre-populate a
//! record once and vary only the data pointers between invocations.

use std::mem::offset_of;

use crate::config::KernelConfig;
use crate::executable::CodeBuffer;

/// One operand-tile pair of a batched reduction.
///
/// GEMM: `a` is the A tile, `b` the B tile. Convolution: `a` is the source,
/// `b` the weights.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TilePair {
    pub a: *const u8,
    pub b: *const u8,
}

/// Argument record for a generated GEMM kernel.
///
/// Operands are column-major; `lda`/`ldb`/`ldc` are leading dimensions in
/// elements. `m`, `n`, `k` are the runtime extents; the batch is reduced
/// per destination tile with a single final store. Offset-correction
/// pointers are read only when the configuration enabled them.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GemmArgs {
    pub batch: *const TilePair,
    pub batch_len: usize,
    pub c: *mut u8,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub lda: usize,
    pub ldb: usize,
    pub ldc: usize,
    pub row_offsets: *const i32,
    pub col_offsets: *const i32,
}

/// Argument record for a generated convolution kernel.
///
/// One invocation computes one output row. The caller pre-positions each
/// pair's source pointer at the first in-range input row (top/bottom
/// padding is pointer adjustment, not kernel logic) and passes the clipped
/// kernel-height trip count.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ConvArgs {
    pub batch: *const TilePair,
    pub batch_len: usize,
    pub dst: *mut u8,
    pub kh_len: usize,
}

pub(crate) const PAIR_A: usize = offset_of!(TilePair, a);
pub(crate) const PAIR_B: usize = offset_of!(TilePair, b);
pub(crate) const PAIR_SIZE: usize = std::mem::size_of::<TilePair>();

type KernelFn = unsafe extern "C" fn(*const u8);

/// One executable kernel, generated from exactly one configuration.
///
/// Immutable after creation: the code buffer is execute-only and the object
/// carries no mutable state, so any number of threads may invoke it
/// concurrently on disjoint data without locking.
pub struct GeneratedKernel {
    config: KernelConfig,
    code: CodeBuffer,
}

impl GeneratedKernel {
    pub(crate) fn new(config: KernelConfig, code: CodeBuffer) -> Self {
        GeneratedKernel { config, code }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Generated code size in bytes (page-rounded).
    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    fn entry(&self) -> KernelFn {
        // SAFETY: the buffer holds a complete function for this ABI,
        // produced by the generator that built `self`.
        unsafe { std::mem::transmute::<*const u8, KernelFn>(self.code.entry()) }
    }

    /// Invoke a GEMM kernel.
    ///
    /// # Safety
    /// All pointers must be valid for the extents and strides given, and
    /// the tiles of one invocation must not alias the destination of a
    /// concurrent one.
    ///
    /// # Panics
    /// On contract violations: wrong kernel kind, inconsistent extents or
    /// required null pointers. These are caller bugs; they fail fast
    /// instead of producing silently wrong numbers.
    pub unsafe fn invoke_gemm(&self, args: &GemmArgs) {
        let cfg = match &self.config {
            KernelConfig::Gemm(c) => c,
            KernelConfig::Conv(_) => panic!("GEMM invocation on a convolution kernel"),
        };
        let limit = i32::MAX as usize;
        assert!(
            args.m <= limit && args.n <= limit && args.k <= limit,
            "oversized extents"
        );
        if args.m > 0 && args.n > 0 && args.k > 0 {
            assert!(!args.c.is_null(), "null destination");
            assert!(args.lda >= args.m, "lda {} below m {}", args.lda, args.m);
            assert!(args.ldb >= args.k, "ldb {} below k {}", args.ldb, args.k);
            assert!(args.ldc >= args.m, "ldc {} below m {}", args.ldc, args.m);
            assert!(
                args.batch_len == 0 || !args.batch.is_null(),
                "null batch list"
            );
            assert!(
                !cfg.row_offsets || !args.row_offsets.is_null(),
                "row offsets enabled but pointer is null"
            );
            assert!(
                !cfg.col_offsets || !args.col_offsets.is_null(),
                "column offsets enabled but pointer is null"
            );
        }
        (self.entry())(args as *const GemmArgs as *const u8);
    }

    /// Invoke a convolution kernel for one output row.
    ///
    /// # Safety
    /// As for `invoke_gemm`: pointers valid for the configured geometry.
    pub unsafe fn invoke_conv(&self, args: &ConvArgs) {
        let cfg = match &self.config {
            KernelConfig::Conv(c) => c,
            KernelConfig::Gemm(_) => panic!("convolution invocation on a GEMM kernel"),
        };
        assert!(!args.dst.is_null(), "null destination");
        assert!(
            args.batch_len == 0 || !args.batch.is_null(),
            "null batch list"
        );
        assert!(
            args.kh_len <= cfg.kh,
            "kh_len {} exceeds configured kh {}",
            args.kh_len,
            cfg.kh
        );
        (self.entry())(args as *const ConvArgs as *const u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_records_are_pointer_packed() {
        // The generators hard-depend on 8-byte field granularity.
        assert_eq!(PAIR_A, 0);
        assert_eq!(PAIR_B, 8);
        assert_eq!(PAIR_SIZE, 16);
        assert_eq!(offset_of!(GemmArgs, batch_len), 8);
        assert_eq!(offset_of!(GemmArgs, col_offsets), 80);
        assert_eq!(offset_of!(ConvArgs, kh_len), 24);
    }
}
