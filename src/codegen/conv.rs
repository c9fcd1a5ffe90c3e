//! Direct-convolution microkernel generator.
//!
//! One generated kernel computes one output row:
//!
//!   O[oc, ow] += sum over (icb, kh, kw, ic) of
//!       W[oc, kh, kw, ic] * I[ic, kh, ow*stride + kw - l_pad]
//!
//! with out-of-range input columns contributing implicit zeros — there is
//! never a materialized padded buffer, and the skipping costs no runtime
//! branch: the in-bounds sub-range of every kernel-width offset is known at
//! generation time and only those multiply-accumulates are emitted.
//!
//! The output width is split at generation time into regions: blocks
//! touched by left padding, a steady-state run of full blocks (driven by a
//! runtime-counted loop when the run is long), blocks touched by right
//! padding, and a partial tail block. Per block: load the accumulators
//! once, reduce over every batch pair × ic block × kernel row, store once.
//! Kernel rows are a runtime-counted loop (`kh_len`, pre-clipped by the
//! caller for top/bottom padding); input channels are innermost.
//!
//! Kernel-width strategies, chosen per block at generation time: a
//! pad-aware unrolled walk whenever the block has any padded-out tap or the
//! kernel is narrow, and a tight runtime-counted loop for wide kernels in
//! the interior.
//!
//! GPR roles:
//!
//!   0 args   1 src block offset   2 dst   3 filt (icb)   4 src (icb)
//!   5 src row   6 filt row   7 kw src walker   8 batch count
//!   9 block count   10 kh count   11 icb count   12 batch cursor
//!   13 kw count   14 kw filt walker

use std::mem::offset_of;

use crate::config::{ConvConfig, SrcLayout};
use crate::error::{Error, Result};
use crate::kernel::{ConvArgs, PAIR_A, PAIR_B, PAIR_SIZE};
use crate::regalloc::ConvRegisterPlan;

use super::avx2::Avx2Emitter;
use super::{BcastKind, CodeEmitter, Gpr, LoadKind, Mem, StoreKind, VReg};

const ARGS: Gpr = Gpr(0);
const SRC_OFF: Gpr = Gpr(1);
const DST: Gpr = Gpr(2);
const FILT: Gpr = Gpr(3);
const SRC_ICB: Gpr = Gpr(4);
const SRC_ROW: Gpr = Gpr(5);
const FILT_ROW: Gpr = Gpr(6);
const KW_SRC: Gpr = Gpr(7);
const CNT_BATCH: Gpr = Gpr(8);
const CNT_BLK: Gpr = Gpr(9);
const CNT_KH: Gpr = Gpr(10);
const CNT_ICB: Gpr = Gpr(11);
const BATCH: Gpr = Gpr(12);
const KW_CNT: Gpr = Gpr(13);
const KW_FILT: Gpr = Gpr(14);

const OFF_BATCH: i32 = offset_of!(ConvArgs, batch) as i32;
const OFF_BATCH_LEN: i32 = offset_of!(ConvArgs, batch_len) as i32;
const OFF_DST: i32 = offset_of!(ConvArgs, dst) as i32;
const OFF_KH_LEN: i32 = offset_of!(ConvArgs, kh_len) as i32;

/// Narrower kernels always take the unrolled path; the loop only pays off
/// once there are enough width steps to amortize its overhead.
const KW_TIGHT_MIN: usize = 5;

/// Steady-state runs at least this long become a runtime-counted loop;
/// shorter runs are emitted unrolled.
const MIN_LOOP_BLOCKS: usize = 3;

/// Generate the machine code for one convolution configuration.
pub fn generate(cfg: &ConvConfig) -> Result<Vec<u8>> {
    cfg.validate()?;
    let plan = ConvRegisterPlan::for_conv(cfg)?;
    check_displacements_fit(cfg)?;
    let mut e = Avx2Emitter::new();
    emit_kernel(&mut e, cfg, &plan);
    e.finalize()
}

/// All emitted addressing is immediate displacements off walking pointers;
/// they must fit in 32 bits.
fn check_displacements_fit(cfg: &ConvConfig) -> Result<()> {
    let worst = [
        cfg.nb_oc_blocking * cfg.nb_ic * cfg.kh * cfg.kw * cfg.ic_block * cfg.oc_block * 4,
        cfg.ih * cfg.iw * cfg.ic_block * 4,
        cfg.nb_oc_blocking * cfg.oh * cfg.ow * cfg.oc_block * 4,
    ];
    if worst.iter().any(|&b| b > i32::MAX as usize) {
        return Err(Error::InfeasibleConfig(
            "tensor extents exceed the 32-bit displacement range".into(),
        ));
    }
    Ok(())
}

/// One register block of output positions.
#[derive(Debug, Clone, Copy)]
struct Block {
    first_out: usize,
    ur: usize,
}

impl Block {
    /// Input column of output `first_out + jj`, tap `ki` (may be negative
    /// or past the input under padding).
    fn col(&self, cfg: &ConvConfig, jj: usize, ki: usize) -> isize {
        ((self.first_out + jj) * cfg.stride_w + ki) as isize - cfg.l_pad as isize
    }

    fn active(&self, cfg: &ConvConfig, jj: usize, ki: usize) -> bool {
        let c = self.col(cfg, jj, ki);
        c >= 0 && (c as usize) < cfg.iw
    }

    fn fully_active(&self, cfg: &ConvConfig) -> bool {
        (0..self.ur).all(|jj| (0..cfg.kw).all(|ki| self.active(cfg, jj, ki)))
    }

    /// Leftmost in-range input column this block touches; the block's
    /// source pointer is positioned here.
    fn base_col(&self, cfg: &ConvConfig) -> usize {
        let origin = (self.first_out * cfg.stride_w) as isize - cfg.l_pad as isize;
        origin.max(0) as usize
    }
}

/// Byte strides derived from the configuration.
struct Strides {
    /// One input column.
    col: i32,
    /// One input row.
    row: i32,
    /// One input-channel block.
    src_icb: i32,
    /// Channel `ic` within an input pixel.
    src_ic: i32,
    /// One kernel row.
    filt_row: i32,
    /// One input-channel block of weights.
    filt_icb: i32,
    /// One kernel-width tap (tight loop).
    filt_kw: i32,
}

fn strides(cfg: &ConvConfig) -> Strides {
    let col = match cfg.src_layout {
        SrcLayout::Blocked => cfg.ic_block * 4,
        SrcLayout::Nchw => 4,
    } as i32;
    let src_ic = match cfg.src_layout {
        SrcLayout::Blocked => 4usize,
        SrcLayout::Nchw => cfg.ih * cfg.iw * 4,
    } as i32;
    Strides {
        col,
        row: cfg.iw as i32 * col,
        src_icb: (cfg.ih * cfg.iw * cfg.ic_block * 4) as i32,
        src_ic,
        filt_row: (cfg.kw * cfg.ic_block * cfg.oc_block * 4) as i32,
        filt_icb: (cfg.kh * cfg.kw * cfg.ic_block * cfg.oc_block * 4) as i32,
        filt_kw: (cfg.ic_block * cfg.oc_block * 4) as i32,
    }
}

fn emit_kernel<E: CodeEmitter>(e: &mut E, cfg: &ConvConfig, plan: &ConvRegisterPlan) {
    let st = strides(cfg);

    let n_full = cfg.ow / cfg.ur_w;
    let tail = cfg.ow % cfg.ur_w;
    let mut blocks: Vec<Block> = (0..n_full)
        .map(|b| Block {
            first_out: b * cfg.ur_w,
            ur: cfg.ur_w,
        })
        .collect();
    if tail > 0 {
        blocks.push(Block {
            first_out: n_full * cfg.ur_w,
            ur: tail,
        });
    }

    e.prologue();
    e.load(DST, Mem::base(ARGS, OFF_DST));
    e.mov_imm(SRC_OFF, 0);

    let mut cur_col = 0usize;
    let mut i = 0usize;
    while i < blocks.len() {
        let blk = blocks[i];

        // Maximal steady-state run: full blocks with every tap in range.
        let mut run = 0;
        while i + run < blocks.len()
            && blocks[i + run].ur == cfg.ur_w
            && blocks[i + run].fully_active(cfg)
        {
            run += 1;
        }

        if run >= MIN_LOOP_BLOCKS {
            let first = blocks[i];
            advance_src(e, &mut cur_col, first.base_col(cfg), st.col);
            e.mov_imm(CNT_BLK, run as i64);
            let l_ow = e.new_label();
            e.bind_label(l_ow);
            emit_block(e, cfg, plan, &st, &first);
            e.add_imm(DST, (cfg.ur_w * cfg.oc_block * 4) as i32);
            e.add_imm(SRC_OFF, cfg.ur_w as i32 * cfg.stride_w as i32 * st.col);
            e.dec_jnz(CNT_BLK, l_ow);
            cur_col += run * cfg.ur_w * cfg.stride_w;
            i += run;
        } else {
            advance_src(e, &mut cur_col, blk.base_col(cfg), st.col);
            emit_block(e, cfg, plan, &st, &blk);
            e.add_imm(DST, (blk.ur * cfg.oc_block * 4) as i32);
            i += 1;
        }
    }

    e.epilogue_ret();
}

fn advance_src<E: CodeEmitter>(e: &mut E, cur_col: &mut usize, target: usize, col_bytes: i32) {
    let delta = target as i64 - *cur_col as i64;
    e.add_imm(SRC_OFF, (delta * col_bytes as i64) as i32);
    *cur_col = target;
}

/// One output block: accumulator load, batch × icb × kh reduction, store.
fn emit_block<E: CodeEmitter>(
    e: &mut E,
    cfg: &ConvConfig,
    plan: &ConvRegisterPlan,
    st: &Strides,
    blk: &Block,
) {
    let dst_off =
        |ii: usize, jj: usize| ((ii * cfg.oh * cfg.ow + jj) * cfg.oc_block * 4) as i32;

    for ii in 0..cfg.nb_oc_blocking {
        for jj in 0..blk.ur {
            e.vload(
                VReg(plan.acc(ii, jj)),
                Mem::base(DST, dst_off(ii, jj)),
                LoadKind::F32Vec,
            );
        }
    }

    e.load(BATCH, Mem::base(ARGS, OFF_BATCH));
    e.load(CNT_BATCH, Mem::base(ARGS, OFF_BATCH_LEN));
    let l_batch_done = e.new_label();
    e.jz(CNT_BATCH, l_batch_done);
    let l_batch = e.new_label();
    e.bind_label(l_batch);
    {
        e.load(SRC_ICB, Mem::base(BATCH, PAIR_A as i32));
        e.add(SRC_ICB, SRC_OFF);
        e.load(FILT, Mem::base(BATCH, PAIR_B as i32));
        e.mov_imm(CNT_ICB, cfg.nb_ic as i64);
        let l_icb = e.new_label();
        e.bind_label(l_icb);
        {
            e.load(CNT_KH, Mem::base(ARGS, OFF_KH_LEN));
            let l_kh_done = e.new_label();
            e.jz(CNT_KH, l_kh_done);
            e.mov(SRC_ROW, SRC_ICB);
            e.mov(FILT_ROW, FILT);
            let l_kh = e.new_label();
            e.bind_label(l_kh);
            {
                let tight = blk.fully_active(cfg) && cfg.kw >= KW_TIGHT_MIN;
                if tight {
                    emit_kw_tight(e, cfg, plan, st, blk);
                } else {
                    emit_kw_unrolled(e, cfg, plan, st, blk);
                }
                e.add_imm(SRC_ROW, st.row);
                e.add_imm(FILT_ROW, st.filt_row);
                e.dec_jnz(CNT_KH, l_kh);
            }
            e.bind_label(l_kh_done);
            e.add_imm(SRC_ICB, st.src_icb);
            e.add_imm(FILT, st.filt_icb);
            e.dec_jnz(CNT_ICB, l_icb);
        }
        e.add_imm(BATCH, PAIR_SIZE as i32);
        e.dec_jnz(CNT_BATCH, l_batch);
    }
    e.bind_label(l_batch_done);

    for ii in 0..cfg.nb_oc_blocking {
        for jj in 0..blk.ur {
            e.vstore(
                Mem::base(DST, dst_off(ii, jj)),
                VReg(plan.acc(ii, jj)),
                StoreKind::F32Vec,
            );
        }
    }
}

/// Weight displacement of (oc block `ii`, tap `ki`, channel `ic`) from the
/// current kernel-row pointer.
fn filt_off(cfg: &ConvConfig, ii: usize, ki: usize, ic: usize) -> i32 {
    (((ii * cfg.nb_ic * cfg.kh * cfg.kw + ki) * cfg.ic_block + ic) * cfg.oc_block * 4) as i32
}

/// Pad-aware unrolled kernel-width reduction: for every tap, only the
/// output positions whose input column is statically in range get a
/// multiply-accumulate; padded-out taps simply emit nothing.
fn emit_kw_unrolled<E: CodeEmitter>(
    e: &mut E,
    cfg: &ConvConfig,
    plan: &ConvRegisterPlan,
    st: &Strides,
    blk: &Block,
) {
    let base = blk.base_col(cfg) as isize;
    for ki in 0..cfg.kw {
        let active: Vec<usize> = (0..blk.ur).filter(|&jj| blk.active(cfg, jj, ki)).collect();
        if active.is_empty() {
            continue;
        }
        for ic in 0..cfg.ic_block {
            for &jj in &active {
                let rel = (blk.col(cfg, jj, ki) - base) as i32;
                let off = rel * st.col + ic as i32 * st.src_ic;
                e.vbroadcast(VReg(plan.bcast(jj)), Mem::base(SRC_ROW, off), BcastKind::F32);
            }
            for ii in 0..cfg.nb_oc_blocking {
                e.vload(
                    VReg(plan.weight()),
                    Mem::base(FILT_ROW, filt_off(cfg, ii, ki, ic)),
                    LoadKind::F32Vec,
                );
                for &jj in &active {
                    e.vfma_f32(VReg(plan.acc(ii, jj)), VReg(plan.bcast(jj)), VReg(plan.weight()));
                }
            }
        }
    }
}

/// Tight runtime-counted kernel-width loop; every output position is
/// active, so the body is identical per tap and the walkers advance by one
/// column of input and one tap of weights.
fn emit_kw_tight<E: CodeEmitter>(
    e: &mut E,
    cfg: &ConvConfig,
    plan: &ConvRegisterPlan,
    st: &Strides,
    blk: &Block,
) {
    e.mov_imm(KW_CNT, cfg.kw as i64);
    e.mov(KW_SRC, SRC_ROW);
    e.mov(KW_FILT, FILT_ROW);
    let l_kw = e.new_label();
    e.bind_label(l_kw);
    for ic in 0..cfg.ic_block {
        for jj in 0..blk.ur {
            let rel = (jj * cfg.stride_w) as i32;
            let off = rel * st.col + ic as i32 * st.src_ic;
            e.vbroadcast(VReg(plan.bcast(jj)), Mem::base(KW_SRC, off), BcastKind::F32);
        }
        for ii in 0..cfg.nb_oc_blocking {
            e.vload(
                VReg(plan.weight()),
                Mem::base(KW_FILT, filt_off(cfg, ii, 0, ic)),
                LoadKind::F32Vec,
            );
            for jj in 0..blk.ur {
                e.vfma_f32(VReg(plan.acc(ii, jj)), VReg(plan.bcast(jj)), VReg(plan.weight()));
            }
        }
    }
    e.add_imm(KW_SRC, st.col);
    e.add_imm(KW_FILT, st.filt_kw);
    e.dec_jnz(KW_CNT, l_kw);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SrcLayout;

    fn base_cfg() -> ConvConfig {
        ConvConfig {
            src_layout: SrcLayout::Blocked,
            ur_w: 3,
            nb_oc_blocking: 1,
            oc_block: 8,
            ic_block: 8,
            nb_ic: 1,
            iw: 12,
            ih: 5,
            ow: 12,
            oh: 5,
            kw: 3,
            kh: 3,
            stride_w: 1,
            l_pad: 1,
            r_pad: 1,
        }
    }

    #[test]
    fn generates_code_for_both_layouts() {
        let mut cfg = base_cfg();
        assert!(!generate(&cfg).unwrap().is_empty());
        cfg.src_layout = SrcLayout::Nchw;
        assert!(!generate(&cfg).unwrap().is_empty());
    }

    #[test]
    fn generation_is_deterministic() {
        let cfg = base_cfg();
        assert_eq!(generate(&cfg).unwrap(), generate(&cfg).unwrap());
    }

    #[test]
    fn block_clipping_matches_padding() {
        let cfg = base_cfg();
        let first = Block { first_out: 0, ur: 3 };
        // Output 0, tap 0 reads column -1: padded out.
        assert!(!first.active(&cfg, 0, 0));
        assert!(first.active(&cfg, 0, 1));
        assert!(!first.fully_active(&cfg));
        let mid = Block { first_out: 3, ur: 3 };
        assert!(mid.fully_active(&cfg));
        assert_eq!(mid.base_col(&cfg), 2);
    }

    #[test]
    fn no_pad_unit_kernel_is_all_steady_state() {
        let cfg = ConvConfig {
            kw: 1,
            kh: 1,
            l_pad: 0,
            r_pad: 0,
            ..base_cfg()
        };
        cfg.validate().unwrap();
        for b in 0..cfg.ow / cfg.ur_w {
            let blk = Block {
                first_out: b * cfg.ur_w,
                ur: cfg.ur_w,
            };
            assert!(blk.fully_active(&cfg));
        }
    }
}
