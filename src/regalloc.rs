//! Register allocation plans.
//!
//! A plan is a pure, deterministic function from a configuration's tile
//! sizes to a role -> vector-slot table. Roles never alias while
//! simultaneously live, the same config always yields the same table (so
//! generated code is reproducible and cacheable by config identity), and a
//! tiling that does not fit the register file is rejected here — never
//! truncated.
//!
//! Slot layout for a GEMM tile (unroll_m = 16, unroll_n = 4, integer path):
//!
//!   ymm0..ymm7   : accumulators, column-major (j*m_vecs + v)
//!   ymm8..ymm9   : A-stream vectors (one per 8 rows)
//!   ymm10        : B broadcast
//!   ymm11        : widening dot-product scratch
//!
//! Slot layout for a conv block (ur_w = 3, nb_oc_blocking = 4):
//!
//!   ymm0..ymm11  : accumulators (ii*ur_w + jj)
//!   ymm12..ymm14 : input broadcasts (one per output position)
//!   ymm15        : weight vector

use crate::config::{ConvConfig, GemmConfig};
use crate::error::{Error, Result};
use crate::microarch::{NUM_VEC_REGS, VLEN};

/// GEMM role -> slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterPlan {
    m_vecs: usize,
    unroll_n: usize,
    a_base: u8,
    b_slot: u8,
    scratch_slot: Option<u8>,
}

impl RegisterPlan {
    pub fn for_gemm(cfg: &GemmConfig) -> Result<Self> {
        let m_vecs = cfg.unroll_m / VLEN;
        let accs = m_vecs * cfg.unroll_n;
        let scratch = usize::from(cfg.is_int());
        let needed = accs + m_vecs + 1 + scratch;
        if needed > NUM_VEC_REGS {
            return Err(Error::RegisterBudget {
                needed,
                available: NUM_VEC_REGS,
            });
        }
        let a_base = accs as u8;
        let b_slot = (accs + m_vecs) as u8;
        let scratch_slot = cfg.is_int().then_some(b_slot + 1);
        Ok(RegisterPlan {
            m_vecs,
            unroll_n: cfg.unroll_n,
            a_base,
            b_slot,
            scratch_slot,
        })
    }

    /// Accumulator slot for row-vector `v` of column `j`.
    pub fn acc(&self, v: usize, j: usize) -> u8 {
        debug_assert!(v < self.m_vecs && j < self.unroll_n);
        (j * self.m_vecs + v) as u8
    }

    /// A-stream slot for row-vector `v`.
    pub fn a(&self, v: usize) -> u8 {
        debug_assert!(v < self.m_vecs);
        self.a_base + v as u8
    }

    /// B broadcast slot. Also reused for the offset-correction vectors once
    /// the reduction is complete (the roles are never live together).
    pub fn b(&self) -> u8 {
        self.b_slot
    }

    /// Integer dot-product scratch slot.
    pub fn scratch(&self) -> u8 {
        self.scratch_slot.expect("scratch slot only exists on the integer path")
    }

    pub fn m_vecs(&self) -> usize {
        self.m_vecs
    }
}

/// Convolution role -> slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvRegisterPlan {
    ur_w: usize,
    nb_oc: usize,
    bcast_base: u8,
    weight_slot: u8,
}

impl ConvRegisterPlan {
    pub fn for_conv(cfg: &ConvConfig) -> Result<Self> {
        let accs = cfg.nb_oc_blocking * cfg.ur_w;
        let needed = accs + cfg.ur_w + 1;
        if needed > NUM_VEC_REGS {
            return Err(Error::RegisterBudget {
                needed,
                available: NUM_VEC_REGS,
            });
        }
        Ok(ConvRegisterPlan {
            ur_w: cfg.ur_w,
            nb_oc: cfg.nb_oc_blocking,
            bcast_base: accs as u8,
            weight_slot: (NUM_VEC_REGS - 1) as u8,
        })
    }

    /// Accumulator slot for oc block `ii`, output position `jj`.
    pub fn acc(&self, ii: usize, jj: usize) -> u8 {
        debug_assert!(ii < self.nb_oc && jj < self.ur_w);
        (ii * self.ur_w + jj) as u8
    }

    /// Input broadcast slot for output position `jj`.
    pub fn bcast(&self, jj: usize) -> u8 {
        debug_assert!(jj < self.ur_w);
        self.bcast_base + jj as u8
    }

    /// Weight vector slot.
    pub fn weight(&self) -> u8 {
        self.weight_slot
    }
}
