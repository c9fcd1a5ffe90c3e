//! Kernel configurations.
//!
//! A configuration fully describes one specialization. It is immutable,
//! hashable, and compared field-by-field: equal configs must produce
//! behaviorally identical kernels, which is what makes the config usable as
//! the registry cache key. All flag combinations (beta, offset correction,
//! padding strategy) are resolved once at generation time into which code is
//! emitted — generated kernels never branch on them.

use crate::error::{Error, Result};
use crate::microarch::VLEN;

/// Element data types the generators understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    U8,
    S8,
    S32,
}

impl DataType {
    pub fn size_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::S32 => 4,
            DataType::U8 | DataType::S8 => 1,
        }
    }
}

/// GEMM specialization: `C[m,n] (op=) sum_k A[m,k]*B[k,n]` plus optional
/// integer offset correction. Operands are column-major.
///
/// `unroll_m`/`unroll_n` fix the register tile; the runtime extents M, N, K
/// are free and arrive in the argument record at invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GemmConfig {
    pub a_type: DataType,
    pub b_type: DataType,
    pub acc_type: DataType,
    /// Rows per register tile; must be a non-zero multiple of the vector width.
    pub unroll_m: usize,
    /// Columns per register tile.
    pub unroll_n: usize,
    /// true: destination is overwritten; false: accumulated into.
    pub beta_zero: bool,
    /// Add `row_offsets[i]` to every element of row i after the reduction.
    pub row_offsets: bool,
    /// Add `col_offsets[j]` to every element of column j after the reduction.
    pub col_offsets: bool,
}

impl Default for GemmConfig {
    fn default() -> Self {
        GemmConfig {
            a_type: DataType::F32,
            b_type: DataType::F32,
            acc_type: DataType::F32,
            unroll_m: 16,
            unroll_n: 4,
            beta_zero: true,
            row_offsets: false,
            col_offsets: false,
        }
    }
}

impl GemmConfig {
    /// Whether this is the widening-integer path (u8 x s8 -> s32).
    pub fn is_int(&self) -> bool {
        self.acc_type == DataType::S32
    }

    pub fn validate(&self) -> Result<()> {
        match (self.a_type, self.b_type, self.acc_type) {
            (DataType::F32, DataType::F32, DataType::F32) => {
                if self.row_offsets || self.col_offsets {
                    return Err(Error::UnsupportedDataType(
                        "offset correction requires the integer path".into(),
                    ));
                }
            }
            (DataType::U8, DataType::S8, DataType::S32) => {}
            (a, b, c) => {
                return Err(Error::UnsupportedDataType(format!(
                    "{a:?} x {b:?} -> {c:?}"
                )))
            }
        }
        if self.unroll_m == 0 || self.unroll_m % VLEN != 0 {
            return Err(Error::InfeasibleConfig(format!(
                "unroll_m {} must be a non-zero multiple of {VLEN}",
                self.unroll_m
            )));
        }
        if self.unroll_n == 0 {
            return Err(Error::InfeasibleConfig("unroll_n must be non-zero".into()));
        }
        Ok(())
    }
}

/// Source-tensor memory format for convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SrcLayout {
    /// Planar: one `ih*iw` plane per channel.
    Nchw,
    /// Channel-blocked: `[h][w][ic_block]` interleaved groups.
    Blocked,
}

/// Direct-convolution specialization. All spatial parameters are fixed at
/// generation time; only the kernel-height trip count (clipped by top/bottom
/// padding) remains a runtime argument.
///
/// Layouts: src is `SrcLayout`-formatted per ic block; weights are
/// `[oc_block_idx][ic_block_idx][kh][kw][ic_block][oc_block]`; dst is
/// `[oc_block_idx][oh][ow][oc_block]`. One invocation computes one output
/// row for `nb_oc_blocking` oc blocks, reducing over `nb_ic` ic blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConvConfig {
    pub src_layout: SrcLayout,
    /// Output-width positions per register block.
    pub ur_w: usize,
    /// Output-channel blocks accumulated simultaneously.
    pub nb_oc_blocking: usize,
    /// Channels per output block; must equal the vector width.
    pub oc_block: usize,
    /// Channels per input block (innermost reduction).
    pub ic_block: usize,
    /// Input-channel blocks reduced per invocation.
    pub nb_ic: usize,
    pub iw: usize,
    pub ih: usize,
    pub ow: usize,
    pub oh: usize,
    pub kw: usize,
    pub kh: usize,
    pub stride_w: usize,
    pub l_pad: usize,
    pub r_pad: usize,
}

impl ConvConfig {
    /// Implied right padding for this geometry.
    pub fn expected_r_pad(&self) -> usize {
        let reach = (self.ow - 1) * self.stride_w + self.kw;
        reach.saturating_sub(self.iw + self.l_pad)
    }

    pub fn validate(&self) -> Result<()> {
        if self.oc_block != VLEN {
            return Err(Error::InfeasibleConfig(format!(
                "oc_block {} must equal the vector width {VLEN}",
                self.oc_block
            )));
        }
        let nonzero = [
            self.ur_w,
            self.nb_oc_blocking,
            self.ic_block,
            self.nb_ic,
            self.iw,
            self.ih,
            self.ow,
            self.oh,
            self.kw,
            self.kh,
            self.stride_w,
        ];
        if nonzero.iter().any(|&v| v == 0) {
            return Err(Error::InfeasibleConfig(
                "all shape and blocking parameters must be non-zero".into(),
            ));
        }
        if self.l_pad >= self.kw || self.r_pad >= self.kw {
            return Err(Error::InfeasibleConfig(format!(
                "padding ({}, {}) must be smaller than kw {}",
                self.l_pad, self.r_pad, self.kw
            )));
        }
        if self.r_pad != self.expected_r_pad() {
            return Err(Error::InfeasibleConfig(format!(
                "r_pad {} does not match geometry (expected {})",
                self.r_pad,
                self.expected_r_pad()
            )));
        }
        // Leftmost access of output 0 is column -l_pad; rightmost is covered
        // by the r_pad identity above. The first output must touch at least
        // one real column.
        if self.l_pad >= self.iw {
            return Err(Error::InfeasibleConfig(
                "l_pad must leave at least one input column in range".into(),
            ));
        }
        Ok(())
    }
}

/// One kernel specialization: the tagged-variant configuration resolved once
/// at generation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelConfig {
    Gemm(GemmConfig),
    Conv(ConvConfig),
}

impl KernelConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            KernelConfig::Gemm(c) => c.validate(),
            KernelConfig::Conv(c) => c.validate(),
        }
    }
}

impl From<GemmConfig> for KernelConfig {
    fn from(c: GemmConfig) -> Self {
        KernelConfig::Gemm(c)
    }
}

impl From<ConvConfig> for KernelConfig {
    fn from(c: ConvConfig) -> Self {
        KernelConfig::Conv(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_gemm() -> GemmConfig {
        GemmConfig {
            a_type: DataType::U8,
            b_type: DataType::S8,
            acc_type: DataType::S32,
            ..GemmConfig::default()
        }
    }

    #[test]
    fn default_gemm_is_valid() {
        GemmConfig::default().validate().unwrap();
        int_gemm().validate().unwrap();
    }

    #[test]
    fn rejects_bad_dtype_combo() {
        let cfg = GemmConfig {
            b_type: DataType::U8,
            ..GemmConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(Error::UnsupportedDataType(_))
        ));
    }

    #[test]
    fn rejects_offsets_on_f32() {
        let cfg = GemmConfig {
            row_offsets: true,
            ..GemmConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unaligned_unroll_m() {
        let cfg = GemmConfig {
            unroll_m: 12,
            ..GemmConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::InfeasibleConfig(_))));
    }

    #[test]
    fn conv_r_pad_must_match_geometry() {
        // ow=5, stride=1, kw=3, l_pad=1, iw=5 -> r_pad must be 1
        let mut cfg = ConvConfig {
            src_layout: SrcLayout::Blocked,
            ur_w: 3,
            nb_oc_blocking: 1,
            oc_block: 8,
            ic_block: 8,
            nb_ic: 1,
            iw: 5,
            ih: 5,
            ow: 5,
            oh: 5,
            kw: 3,
            kh: 3,
            stride_w: 1,
            l_pad: 1,
            r_pad: 1,
        };
        cfg.validate().unwrap();
        cfg.r_pad = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn equal_configs_hash_equal() {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let a = KernelConfig::Gemm(int_gemm());
        let b = KernelConfig::Gemm(int_gemm());
        assert_eq!(a, b);
        let mut ha = DefaultHasher::new();
        let mut hb = DefaultHasher::new();
        a.hash(&mut ha);
        b.hash(&mut hb);
        assert_eq!(ha.finish(), hb.finish());
    }
}
