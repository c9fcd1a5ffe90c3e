//! Shared helpers for the kernel test suites: deterministic data
//! generation, kernel drivers, and comparison utilities.

#![allow(dead_code)]

use primjit::validation;
use primjit::{ConvArgs, ConvConfig, GemmArgs, GemmConfig, KernelDescriptor, SrcLayout, TilePair};

/// Skip a test on hosts that cannot run the generated code.
#[macro_export]
macro_rules! skip_without_avx2 {
    () => {
        if !primjit::microarch::has_required_isa() {
            eprintln!("skipping: host lacks AVX2/FMA");
            return;
        }
    };
}

/// Small deterministic generator so failures reproduce exactly.
pub struct Lcg(pub u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Lcg(seed.wrapping_mul(0x9E3779B97F4A7C15) | 1)
    }

    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0
    }

    pub fn f32(&mut self) -> f32 {
        ((self.next() >> 40) as f32 / (1u64 << 24) as f32) * 4.0 - 2.0
    }

    pub fn u8(&mut self) -> u8 {
        (self.next() >> 56) as u8
    }

    pub fn i8(&mut self) -> i8 {
        (self.next() >> 56) as i8
    }

    pub fn fill_f32(&mut self, len: usize) -> Vec<f32> {
        (0..len).map(|_| self.f32()).collect()
    }

    pub fn fill_u8(&mut self, len: usize) -> Vec<u8> {
        (0..len).map(|_| self.u8()).collect()
    }

    pub fn fill_i8(&mut self, len: usize) -> Vec<i8> {
        (0..len).map(|_| self.i8()).collect()
    }

    pub fn fill_i32(&mut self, len: usize) -> Vec<i32> {
        (0..len).map(|_| (self.next() >> 48) as i16 as i32).collect()
    }
}

pub fn assert_close(got: &[f32], want: &[f32]) {
    assert_eq!(got.len(), want.len());
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        let tol = 1e-4_f32.max(w.abs() * 1e-5);
        assert!(
            (g - w).abs() <= tol,
            "mismatch at {i}: got {g}, want {w} (tol {tol})"
        );
    }
}

fn pair_ptrs<A, B>(pairs: &[(Vec<A>, Vec<B>)]) -> Vec<TilePair> {
    pairs
        .iter()
        .map(|(a, b)| TilePair {
            a: a.as_ptr() as *const u8,
            b: b.as_ptr() as *const u8,
        })
        .collect()
}

/// Drive a bound f32 GEMM kernel over `c_init`, returning the result.
#[allow(clippy::too_many_arguments)]
pub fn run_gemm_f32(
    cfg: GemmConfig,
    m: usize,
    n: usize,
    k: usize,
    pairs: &[(Vec<f32>, Vec<f32>)],
    lda: usize,
    ldb: usize,
    c_init: &[f32],
    ldc: usize,
) -> Vec<f32> {
    let desc = KernelDescriptor::bind(cfg).expect("bind");
    let mut c = c_init.to_vec();
    let tiles = pair_ptrs(pairs);
    let args = GemmArgs {
        batch: tiles.as_ptr(),
        batch_len: tiles.len(),
        c: c.as_mut_ptr() as *mut u8,
        m,
        n,
        k,
        lda,
        ldb,
        ldc,
        row_offsets: std::ptr::null(),
        col_offsets: std::ptr::null(),
    };
    unsafe { desc.invoke_gemm(&args) };
    c
}

/// Drive a bound integer GEMM kernel, with optional offset vectors.
#[allow(clippy::too_many_arguments)]
pub fn run_gemm_s32(
    cfg: GemmConfig,
    m: usize,
    n: usize,
    k: usize,
    pairs: &[(Vec<u8>, Vec<i8>)],
    lda: usize,
    ldb: usize,
    c_init: &[i32],
    ldc: usize,
    row_offsets: Option<&[i32]>,
    col_offsets: Option<&[i32]>,
) -> Vec<i32> {
    let desc = KernelDescriptor::bind(cfg).expect("bind");
    let mut c = c_init.to_vec();
    let tiles = pair_ptrs(pairs);
    let args = GemmArgs {
        batch: tiles.as_ptr(),
        batch_len: tiles.len(),
        c: c.as_mut_ptr() as *mut u8,
        m,
        n,
        k,
        lda,
        ldb,
        ldc,
        row_offsets: row_offsets.map_or(std::ptr::null(), |r| r.as_ptr()),
        col_offsets: col_offsets.map_or(std::ptr::null(), |r| r.as_ptr()),
    };
    unsafe { desc.invoke_gemm(&args) };
    c
}

/// Drive a bound convolution kernel over the whole output plane, one output
/// row per invocation, with vertical clipping computed the way the driver
/// layer does it: source/weight pointers pre-positioned, `kh_len` clipped.
pub fn run_conv(
    cfg: ConvConfig,
    t_pad: usize,
    pairs: &[(Vec<f32>, Vec<f32>)],
    dst_init: &[f32],
) -> Vec<f32> {
    let desc = KernelDescriptor::bind(cfg).expect("bind");
    let mut dst = dst_init.to_vec();
    let row_mult = match cfg.src_layout {
        SrcLayout::Blocked => cfg.ic_block,
        SrcLayout::Nchw => 1,
    };
    for oy in 0..cfg.oh {
        let kh_lo = t_pad.saturating_sub(oy);
        if kh_lo >= cfg.kh {
            continue;
        }
        let iy0 = oy + kh_lo - t_pad;
        if iy0 >= cfg.ih {
            continue;
        }
        let kh_len = (cfg.kh - kh_lo).min(cfg.ih - iy0);

        let src_off = iy0 * cfg.iw * row_mult;
        let wei_off = kh_lo * cfg.kw * cfg.ic_block * cfg.oc_block;
        let tiles: Vec<TilePair> = pairs
            .iter()
            .map(|(src, wei)| TilePair {
                a: unsafe { src.as_ptr().add(src_off) } as *const u8,
                b: unsafe { wei.as_ptr().add(wei_off) } as *const u8,
            })
            .collect();
        let dst_off = oy * cfg.ow * cfg.oc_block;
        let args = ConvArgs {
            batch: tiles.as_ptr(),
            batch_len: tiles.len(),
            dst: unsafe { dst.as_mut_ptr().add(dst_off) } as *mut u8,
            kh_len,
        };
        unsafe { desc.invoke_conv(&args) };
    }
    dst
}

/// Build random conv operands of the right sizes.
pub fn conv_data(cfg: &ConvConfig, batch: usize, seed: u64) -> Vec<(Vec<f32>, Vec<f32>)> {
    let mut rng = Lcg::new(seed);
    (0..batch)
        .map(|_| {
            (
                rng.fill_f32(validation::src_len(cfg)),
                rng.fill_f32(validation::wei_len(cfg)),
            )
        })
        .collect()
}
