//! Scalar reference implementations.
//!
//! Straightforward loop nests the generated kernels are checked against.
//! The integer path uses wrapping i32 arithmetic so it is bit-comparable
//! with the hardware; the f32 path uses `mul_add` in the same reduction
//! order as the emitted code, so differences stay within fused-rounding
//! noise.

use crate::config::{ConvConfig, SrcLayout};

/// Column-major index.
#[inline]
pub fn cm(i: usize, j: usize, ld: usize) -> usize {
    j * ld + i
}

/// Reference batched f32 GEMM. `beta_zero` clears the destination tile
/// before the reduction; otherwise the existing values are accumulated
/// into. Operands are column-major slices.
#[allow(clippy::too_many_arguments)]
pub fn ref_gemm_f32(
    m: usize,
    n: usize,
    k: usize,
    pairs: &[(&[f32], &[f32])],
    lda: usize,
    ldb: usize,
    c: &mut [f32],
    ldc: usize,
    beta_zero: bool,
) {
    if m == 0 || n == 0 || k == 0 {
        return;
    }
    for j in 0..n {
        for i in 0..m {
            let mut acc = if beta_zero { 0.0 } else { c[cm(i, j, ldc)] };
            for (a, b) in pairs {
                for p in 0..k {
                    acc = a[cm(i, p, lda)].mul_add(b[cm(p, j, ldb)], acc);
                }
            }
            c[cm(i, j, ldc)] = acc;
        }
    }
}

/// Reference batched widening-integer GEMM (u8 x s8 -> i32, wrapping), with
/// optional per-row/per-column offset correction applied once after the
/// reduction.
#[allow(clippy::too_many_arguments)]
pub fn ref_gemm_s32(
    m: usize,
    n: usize,
    k: usize,
    pairs: &[(&[u8], &[i8])],
    lda: usize,
    ldb: usize,
    c: &mut [i32],
    ldc: usize,
    beta_zero: bool,
    row_offsets: Option<&[i32]>,
    col_offsets: Option<&[i32]>,
) {
    if m == 0 || n == 0 || k == 0 {
        return;
    }
    for j in 0..n {
        for i in 0..m {
            let mut acc = if beta_zero { 0 } else { c[cm(i, j, ldc)] };
            for (a, b) in pairs {
                for p in 0..k {
                    let prod = (a[cm(i, p, lda)] as i32).wrapping_mul(b[cm(p, j, ldb)] as i32);
                    acc = acc.wrapping_add(prod);
                }
            }
            if let Some(r) = row_offsets {
                acc = acc.wrapping_add(r[i]);
            }
            if let Some(col) = col_offsets {
                acc = acc.wrapping_add(col[j]);
            }
            c[cm(i, j, ldc)] = acc;
        }
    }
}

/// Source-tensor element index for a convolution config.
pub fn src_index(cfg: &ConvConfig, icb: usize, ic: usize, iy: usize, ix: usize) -> usize {
    match cfg.src_layout {
        SrcLayout::Blocked => ((icb * cfg.ih + iy) * cfg.iw + ix) * cfg.ic_block + ic,
        SrcLayout::Nchw => (icb * cfg.ic_block + ic) * cfg.ih * cfg.iw + iy * cfg.iw + ix,
    }
}

/// Weight element index: `[ocb][icb][kh][kw][ic][oc]`.
pub fn wei_index(
    cfg: &ConvConfig,
    ii: usize,
    icb: usize,
    ky: usize,
    kx: usize,
    ic: usize,
    oc: usize,
) -> usize {
    ((((ii * cfg.nb_ic + icb) * cfg.kh + ky) * cfg.kw + kx) * cfg.ic_block + ic) * cfg.oc_block
        + oc
}

/// Destination element index: `[ocb][oh][ow][oc]`.
pub fn dst_index(cfg: &ConvConfig, ii: usize, oy: usize, ox: usize, oc: usize) -> usize {
    ((ii * cfg.oh + oy) * cfg.ow + ox) * cfg.oc_block + oc
}

/// Number of source elements one (src, weights) pair must provide.
pub fn src_len(cfg: &ConvConfig) -> usize {
    cfg.nb_ic * cfg.ih * cfg.iw * cfg.ic_block
}

pub fn wei_len(cfg: &ConvConfig) -> usize {
    cfg.nb_oc_blocking * cfg.nb_ic * cfg.kh * cfg.kw * cfg.ic_block * cfg.oc_block
}

pub fn dst_len(cfg: &ConvConfig) -> usize {
    cfg.nb_oc_blocking * cfg.oh * cfg.ow * cfg.oc_block
}

/// Reference direct convolution over the full output plane, accumulating
/// into `dst` (`O +=`), treating reads outside the input as zeros. Vertical
/// geometry: output row `oy` reads input rows `oy - t_pad + ky` with unit
/// height stride, rows outside `[0, ih)` padded out.
pub fn ref_conv(
    cfg: &ConvConfig,
    t_pad: usize,
    pairs: &[(&[f32], &[f32])],
    dst: &mut [f32],
) {
    for ii in 0..cfg.nb_oc_blocking {
        for oy in 0..cfg.oh {
            for ox in 0..cfg.ow {
                for (src, wei) in pairs {
                    for icb in 0..cfg.nb_ic {
                        for ky in 0..cfg.kh {
                            let iy = oy as isize + ky as isize - t_pad as isize;
                            if iy < 0 || iy >= cfg.ih as isize {
                                continue;
                            }
                            for kx in 0..cfg.kw {
                                let ix =
                                    (ox * cfg.stride_w + kx) as isize - cfg.l_pad as isize;
                                if ix < 0 || ix >= cfg.iw as isize {
                                    continue;
                                }
                                for ic in 0..cfg.ic_block {
                                    let s =
                                        src[src_index(cfg, icb, ic, iy as usize, ix as usize)];
                                    for oc in 0..cfg.oc_block {
                                        let w = wei[wei_index(cfg, ii, icb, ky, kx, ic, oc)];
                                        let d = &mut dst[dst_index(cfg, ii, oy, ox, oc)];
                                        *d = s.mul_add(w, *d);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ones_gemm_counts_k() {
        let m = 3;
        let n = 2;
        let k = 8;
        let a = vec![1u8; m * k];
        let b = vec![1i8; k * n];
        let mut c = vec![0i32; m * n];
        ref_gemm_s32(m, n, k, &[(&a, &b)], m, k, &mut c, m, true, None, None);
        assert!(c.iter().all(|&v| v == 8));
    }

    #[test]
    fn zero_extent_is_a_noop() {
        let mut c = vec![7.0f32; 4];
        ref_gemm_f32(0, 2, 2, &[], 1, 2, &mut c, 2, true);
        assert!(c.iter().all(|&v| v == 7.0));
    }
}
