//! GEMM microkernel generator.
//!
//! Emits `C[m,n] (op=) sum_k A[m,k]*B[k,n] [+ row_offset[m]] [+ col_offset[n]]`
//! over the runtime extents in the argument record. Operands are
//! column-major. The beta and offset-correction choices are baked into the
//! emitted code; the generated kernel never branches on them.
//!
//! Loop nest, outermost first:
//!
//!   N  in unroll_n columns, then a one-column tail loop
//!   M  in unroll_m rows, then one-vector rows, then a scalar row loop
//!   batch: one full K reduction per operand-tile pair, accumulators live
//!          across the whole batch, one store per (m,n) tile
//!   K  unrolled by UNROLL_K with a one-element remainder loop
//!
//! The integer path widens u8/s8 operands to i32 lanes before the
//! multiply-accumulate, which keeps results bit-exact on unpacked
//! column-major operands. Edge tiles narrower than a vector fall back to a
//! scalar row loop, so no load or store ever touches bytes outside the
//! caller's buffers.
//!
//! GPR roles:
//!
//!   0 args   1 A stream   2 B stream   3 C tile     4 C panel
//!   5 lda    6 ldb        7 ldc        8 M count    9 N count
//!   10 K count   11 batch count   12 batch cursor   13 column temp
//!   14 scratch
//!
//! Frame slots: 0 = A byte offset of the current M position, 1 = B byte
//! offset of the current N panel, 2 = column-offset byte offset.

use std::mem::offset_of;

use crate::config::GemmConfig;
use crate::error::Result;
use crate::kernel::{GemmArgs, PAIR_A, PAIR_B, PAIR_SIZE};
use crate::microarch::{PREFETCH_DIST, UNROLL_K, VLEN};
use crate::regalloc::RegisterPlan;

use super::avx2::Avx2Emitter;
use super::{BcastKind, CodeEmitter, Gpr, LoadKind, Mem, PrefetchHint, Scale, StoreKind, VReg};

const ARGS: Gpr = Gpr(0);
const A_PTR: Gpr = Gpr(1);
const B_PTR: Gpr = Gpr(2);
const C_TILE: Gpr = Gpr(3);
const C_PANEL: Gpr = Gpr(4);
const STRIDE_A: Gpr = Gpr(5);
const STRIDE_B: Gpr = Gpr(6);
const STRIDE_C: Gpr = Gpr(7);
const CNT_M: Gpr = Gpr(8);
const CNT_N: Gpr = Gpr(9);
const CNT_K: Gpr = Gpr(10);
const CNT_BATCH: Gpr = Gpr(11);
const BATCH: Gpr = Gpr(12);
const COL_TMP: Gpr = Gpr(13);
const SCRATCH: Gpr = Gpr(14);

const SLOT_A_OFF: u8 = 0;
const SLOT_B_OFF: u8 = 1;
const SLOT_COL_OFF: u8 = 2;

const OFF_BATCH: i32 = offset_of!(GemmArgs, batch) as i32;
const OFF_BATCH_LEN: i32 = offset_of!(GemmArgs, batch_len) as i32;
const OFF_C: i32 = offset_of!(GemmArgs, c) as i32;
const OFF_M: i32 = offset_of!(GemmArgs, m) as i32;
const OFF_N: i32 = offset_of!(GemmArgs, n) as i32;
const OFF_K: i32 = offset_of!(GemmArgs, k) as i32;
const OFF_LDA: i32 = offset_of!(GemmArgs, lda) as i32;
const OFF_LDB: i32 = offset_of!(GemmArgs, ldb) as i32;
const OFF_LDC: i32 = offset_of!(GemmArgs, ldc) as i32;
const OFF_ROW_OFFSETS: i32 = offset_of!(GemmArgs, row_offsets) as i32;
const OFF_COL_OFFSETS: i32 = offset_of!(GemmArgs, col_offsets) as i32;

/// Generate the machine code for one GEMM configuration.
pub fn generate(cfg: &GemmConfig) -> Result<Vec<u8>> {
    cfg.validate()?;
    let plan = RegisterPlan::for_gemm(cfg)?;
    let mut e = Avx2Emitter::new();
    emit_kernel(&mut e, cfg, &plan);
    e.finalize()
}

/// Width of one emitted tile.
#[derive(Clone, Copy, PartialEq, Eq)]
enum TileMode {
    /// `m_vecs` full vectors of rows.
    Vec(usize),
    /// One row, element-width operations only.
    Scalar,
}

/// Walks ascending column indices, materializing `base + stride*j`
/// addresses. Columns 0..=2 use direct scaled forms; higher columns advance
/// a temporary pointer in steps of two strides.
struct ColCursor {
    covered: usize,
}

impl ColCursor {
    fn new() -> Self {
        ColCursor { covered: 0 }
    }

    fn mem<E: CodeEmitter>(&mut self, e: &mut E, base: Gpr, stride: Gpr, j: usize, disp: i32) -> Mem {
        match j {
            0 => Mem::base(base, disp),
            1 => Mem::indexed(base, stride, Scale::X1, disp),
            2 => Mem::indexed(base, stride, Scale::X2, disp),
            _ => {
                let target = (j - 1) & !1; // largest even index below j
                while self.covered < target {
                    let src = if self.covered == 0 { base } else { COL_TMP };
                    e.lea(COL_TMP, Mem::indexed(src, stride, Scale::X2, 0));
                    self.covered += 2;
                }
                if j - self.covered == 1 {
                    Mem::indexed(COL_TMP, stride, Scale::X1, disp)
                } else {
                    Mem::indexed(COL_TMP, stride, Scale::X2, disp)
                }
            }
        }
    }
}

fn emit_kernel<E: CodeEmitter>(e: &mut E, cfg: &GemmConfig, plan: &RegisterPlan) {
    let esz_a = cfg.a_type.size_bytes();
    let esz_b = cfg.b_type.size_bytes();
    let shift_a = if esz_a == 4 { 2 } else { 0 };
    let shift_b = if esz_b == 4 { 2 } else { 0 };

    e.prologue();
    let l_ret = e.new_label();

    // Zero-sized extents are defined no-ops: return before any store.
    e.load(CNT_M, Mem::base(ARGS, OFF_M));
    e.jz(CNT_M, l_ret);
    e.load(CNT_N, Mem::base(ARGS, OFF_N));
    e.jz(CNT_N, l_ret);
    e.load(CNT_K, Mem::base(ARGS, OFF_K));
    e.jz(CNT_K, l_ret);

    // Element strides -> byte strides.
    e.load(STRIDE_A, Mem::base(ARGS, OFF_LDA));
    e.shl_imm(STRIDE_A, shift_a);
    e.load(STRIDE_B, Mem::base(ARGS, OFF_LDB));
    e.shl_imm(STRIDE_B, shift_b);
    e.load(STRIDE_C, Mem::base(ARGS, OFF_LDC));
    e.shl_imm(STRIDE_C, 2);

    e.load(C_PANEL, Mem::base(ARGS, OFF_C));
    e.mov_imm(SCRATCH, 0);
    e.spill(SLOT_B_OFF, SCRATCH);
    e.spill(SLOT_COL_OFF, SCRATCH);

    // ── N loop: full panels, then single columns ───────────────────────
    let l_n_tail = e.new_label();
    let l_n_main = e.new_label();
    e.bind_label(l_n_main);
    e.cmp_jb(CNT_N, cfg.unroll_n as i32, l_n_tail);
    emit_m_loops(e, cfg, plan, cfg.unroll_n);
    advance_n(e, cfg, cfg.unroll_n);
    e.sub_imm(CNT_N, cfg.unroll_n as i32);
    e.jmp(l_n_main);

    e.bind_label(l_n_tail);
    e.jz(CNT_N, l_ret);
    let l_n_rem = e.new_label();
    e.bind_label(l_n_rem);
    emit_m_loops(e, cfg, plan, 1);
    advance_n(e, cfg, 1);
    e.dec_jnz(CNT_N, l_n_rem);

    e.bind_label(l_ret);
    e.epilogue_ret();
}

/// Advance the C panel pointer, the B panel offset and the column-offset
/// cursor past `cols` columns.
fn advance_n<E: CodeEmitter>(e: &mut E, cfg: &GemmConfig, cols: usize) {
    for _ in 0..cols {
        e.add(C_PANEL, STRIDE_C);
    }
    e.reload(SCRATCH, SLOT_B_OFF);
    for _ in 0..cols {
        e.add(SCRATCH, STRIDE_B);
    }
    e.spill(SLOT_B_OFF, SCRATCH);
    if cfg.col_offsets {
        e.reload(SCRATCH, SLOT_COL_OFF);
        e.add_imm(SCRATCH, (cols * 4) as i32);
        e.spill(SLOT_COL_OFF, SCRATCH);
    }
}

/// The M loop family for one column count: full tiles, one-vector tiles,
/// scalar rows.
fn emit_m_loops<E: CodeEmitter>(e: &mut E, cfg: &GemmConfig, plan: &RegisterPlan, n_cols: usize) {
    let esz_a = cfg.a_type.size_bytes();

    e.load(CNT_M, Mem::base(ARGS, OFF_M));
    e.mov(C_TILE, C_PANEL);
    e.mov_imm(SCRATCH, 0);
    e.spill(SLOT_A_OFF, SCRATCH);

    let advance_m = |e: &mut E, rows: usize| {
        e.add_imm(C_TILE, (rows * 4) as i32);
        e.reload(SCRATCH, SLOT_A_OFF);
        e.add_imm(SCRATCH, (rows * esz_a) as i32);
        e.spill(SLOT_A_OFF, SCRATCH);
    };

    let l_vec = e.new_label();
    let l_full = e.new_label();
    e.bind_label(l_full);
    e.cmp_jb(CNT_M, cfg.unroll_m as i32, l_vec);
    emit_tile(e, cfg, plan, n_cols, TileMode::Vec(plan.m_vecs()));
    advance_m(e, cfg.unroll_m);
    e.sub_imm(CNT_M, cfg.unroll_m as i32);
    e.jmp(l_full);

    e.bind_label(l_vec);
    let l_scalar = e.new_label();
    if cfg.unroll_m > VLEN {
        let l_vec_top = e.new_label();
        e.bind_label(l_vec_top);
        e.cmp_jb(CNT_M, VLEN as i32, l_scalar);
        emit_tile(e, cfg, plan, n_cols, TileMode::Vec(1));
        advance_m(e, VLEN);
        e.sub_imm(CNT_M, VLEN as i32);
        e.jmp(l_vec_top);
    }

    e.bind_label(l_scalar);
    let l_done = e.new_label();
    e.jz(CNT_M, l_done);
    let l_scalar_top = e.new_label();
    e.bind_label(l_scalar_top);
    emit_tile(e, cfg, plan, n_cols, TileMode::Scalar);
    advance_m(e, 1);
    e.dec_jnz(CNT_M, l_scalar_top);
    e.bind_label(l_done);
}

/// One destination tile: accumulator init, the batch × K reduction, offset
/// correction, and a single store.
fn emit_tile<E: CodeEmitter>(
    e: &mut E,
    cfg: &GemmConfig,
    plan: &RegisterPlan,
    n_cols: usize,
    mode: TileMode,
) {
    let int_path = cfg.is_int();
    let (m_vecs, scalar) = match mode {
        TileMode::Vec(v) => (v, false),
        TileMode::Scalar => (1, true),
    };
    let acc_load = match (int_path, scalar) {
        (false, false) => LoadKind::F32Vec,
        (false, true) => LoadKind::F32Scalar,
        (true, false) => LoadKind::I32Vec,
        (true, true) => LoadKind::I32Scalar,
    };
    let acc_store = match (int_path, scalar) {
        (false, false) => StoreKind::F32Vec,
        (false, true) => StoreKind::F32Scalar,
        (true, false) => StoreKind::I32Vec,
        (true, true) => StoreKind::I32Scalar,
    };

    // 1. Accumulator init: overwrite semantics clear, accumulate semantics
    //    load the existing destination tile.
    if cfg.beta_zero {
        for j in 0..n_cols {
            for v in 0..m_vecs {
                e.vzero(VReg(plan.acc(v, j)), int_path);
            }
        }
    } else {
        let mut cur = ColCursor::new();
        for j in 0..n_cols {
            for v in 0..m_vecs {
                let m = cur.mem(e, C_TILE, STRIDE_C, j, (v * 32) as i32);
                e.vload(VReg(plan.acc(v, j)), m, acc_load);
            }
        }
    }

    // 2. Batch loop: one full K reduction per operand-tile pair.
    e.load(BATCH, Mem::base(ARGS, OFF_BATCH));
    e.load(CNT_BATCH, Mem::base(ARGS, OFF_BATCH_LEN));
    let l_batch_done = e.new_label();
    e.jz(CNT_BATCH, l_batch_done);
    let l_batch = e.new_label();
    e.bind_label(l_batch);
    {
        e.load(A_PTR, Mem::base(BATCH, PAIR_A as i32));
        e.reload(SCRATCH, SLOT_A_OFF);
        e.add(A_PTR, SCRATCH);
        e.load(B_PTR, Mem::base(BATCH, PAIR_B as i32));
        e.reload(SCRATCH, SLOT_B_OFF);
        e.add(B_PTR, SCRATCH);
        e.load(CNT_K, Mem::base(ARGS, OFF_K));

        // K main loop, unrolled; remainder runs one element at a time.
        let l_k_tail = e.new_label();
        let l_k_main = e.new_label();
        e.bind_label(l_k_main);
        e.cmp_jb(CNT_K, UNROLL_K as i32, l_k_tail);
        for step in 0..UNROLL_K {
            emit_k_step(e, cfg, plan, n_cols, m_vecs, scalar, step == 0);
        }
        e.sub_imm(CNT_K, UNROLL_K as i32);
        e.jmp(l_k_main);

        e.bind_label(l_k_tail);
        let l_k_done = e.new_label();
        e.jz(CNT_K, l_k_done);
        let l_k_rem = e.new_label();
        e.bind_label(l_k_rem);
        emit_k_step(e, cfg, plan, n_cols, m_vecs, scalar, false);
        e.dec_jnz(CNT_K, l_k_rem);
        e.bind_label(l_k_done);

        e.add_imm(BATCH, PAIR_SIZE as i32);
        e.dec_jnz(CNT_BATCH, l_batch);
    }
    e.bind_label(l_batch_done);

    // 3. Offset correction, once per tile (integer path only). The B
    //    broadcast slot is dead after the reduction and is reused here.
    if cfg.row_offsets {
        e.load(COL_TMP, Mem::base(ARGS, OFF_ROW_OFFSETS));
        e.reload(SCRATCH, SLOT_A_OFF);
        e.shl_imm(SCRATCH, 2); // A elements are bytes; offsets are i32
        e.add(COL_TMP, SCRATCH);
        for v in 0..m_vecs {
            let kind = if scalar {
                LoadKind::I32Scalar
            } else {
                LoadKind::I32Vec
            };
            e.vload(VReg(plan.b()), Mem::base(COL_TMP, (v * 32) as i32), kind);
            for j in 0..n_cols {
                let acc = VReg(plan.acc(v, j));
                e.vadd_i32(acc, acc, VReg(plan.b()));
            }
        }
    }
    if cfg.col_offsets {
        e.load(COL_TMP, Mem::base(ARGS, OFF_COL_OFFSETS));
        e.reload(SCRATCH, SLOT_COL_OFF);
        e.add(COL_TMP, SCRATCH);
        for j in 0..n_cols {
            e.vbroadcast(
                VReg(plan.b()),
                Mem::base(COL_TMP, (j * 4) as i32),
                BcastKind::I32,
            );
            for v in 0..m_vecs {
                let acc = VReg(plan.acc(v, j));
                e.vadd_i32(acc, acc, VReg(plan.b()));
            }
        }
    }

    // 4. Store, with a write prefetch per fresh destination cache line.
    let mut cur = ColCursor::new();
    for j in 0..n_cols {
        for v in 0..m_vecs {
            let m = cur.mem(e, C_TILE, STRIDE_C, j, (v * 32) as i32);
            if !scalar && v % 2 == 0 {
                e.prefetch(m, PrefetchHint::W);
            }
            e.vstore(m, VReg(plan.acc(v, j)), acc_store);
        }
    }
}

/// One K step: load the A vectors, then broadcast each B element and
/// accumulate into the tile column. Advances both stream pointers.
fn emit_k_step<E: CodeEmitter>(
    e: &mut E,
    cfg: &GemmConfig,
    plan: &RegisterPlan,
    n_cols: usize,
    m_vecs: usize,
    scalar: bool,
    with_prefetch: bool,
) {
    let int_path = cfg.is_int();
    let a_load = match (int_path, scalar) {
        (false, false) => LoadKind::F32Vec,
        (false, true) => LoadKind::F32Scalar,
        (true, false) => LoadKind::U8WidenVec,
        (true, true) => LoadKind::U8WidenScalar,
    };
    // Byte distance between consecutive row-vectors of one A column.
    let a_vec_step = (VLEN * cfg.a_type.size_bytes()) as i32;
    let b_bcast = if int_path { BcastKind::S8 } else { BcastKind::F32 };

    for v in 0..m_vecs {
        e.vload(VReg(plan.a(v)), Mem::base(A_PTR, v as i32 * a_vec_step), a_load);
    }
    if with_prefetch {
        e.prefetch(Mem::base(A_PTR, PREFETCH_DIST), PrefetchHint::T0);
        e.prefetch(Mem::base(B_PTR, PREFETCH_DIST), PrefetchHint::T0);
    }
    let mut cur = ColCursor::new();
    for j in 0..n_cols {
        let m = cur.mem(e, B_PTR, STRIDE_B, j, 0);
        e.vbroadcast(VReg(plan.b()), m, b_bcast);
        for v in 0..m_vecs {
            let acc = VReg(plan.acc(v, j));
            if int_path {
                e.vmuladd_i32(acc, VReg(plan.a(v)), VReg(plan.b()), VReg(plan.scratch()));
            } else {
                e.vfma_f32(acc, VReg(plan.a(v)), VReg(plan.b()));
            }
        }
    }
    e.add(A_PTR, STRIDE_A);
    e.add_imm(B_PTR, cfg.b_type.size_bytes() as i32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataType;

    fn int_cfg() -> GemmConfig {
        GemmConfig {
            a_type: DataType::U8,
            b_type: DataType::S8,
            acc_type: DataType::S32,
            ..GemmConfig::default()
        }
    }

    #[test]
    fn generates_code_for_all_variants() {
        for beta_zero in [false, true] {
            for (row, col) in [(false, false), (true, false), (false, true), (true, true)] {
                let cfg = GemmConfig {
                    beta_zero,
                    row_offsets: row,
                    col_offsets: col,
                    ..int_cfg()
                };
                let code = generate(&cfg).unwrap();
                assert!(!code.is_empty());
            }
        }
        let f32_cfg = GemmConfig::default();
        assert!(!generate(&f32_cfg).unwrap().is_empty());
    }

    #[test]
    fn generation_is_deterministic() {
        let cfg = int_cfg();
        assert_eq!(generate(&cfg).unwrap(), generate(&cfg).unwrap());
    }

    #[test]
    fn oversized_tile_fails_generation() {
        let cfg = GemmConfig {
            unroll_m: 32,
            ..int_cfg()
        };
        assert!(generate(&cfg).is_err());
    }
}
