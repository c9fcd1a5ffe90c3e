//! Code-emission capability interface.
//!
//! The GEMM and convolution generators are written against `CodeEmitter`, a
//! small virtual instruction set over logical register indices. The concrete
//! backend (`avx2`) maps logical GPRs to physical registers and emits real
//! machine code; the generator algorithms stay ISA-agnostic.
//!
//! Register model:
//! - `VReg(u8)` is a *physical* vector slot assigned by the register plan
//!   (the plan already validated the budget, so the emitter trusts it).
//! - `Gpr(u8)` is a logical general-purpose index 0..=14; the backend owns
//!   the mapping to physical registers. `Gpr(0)` is, by convention, the
//!   incoming argument-record pointer; `Gpr(14)` is a scratch register that
//!   byte-granular loads and broadcasts may clobber internally.

pub mod avx2;
pub mod conv;
pub mod gemm;

/// Physical vector-register slot (from a register plan).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VReg(pub u8);

/// Logical general-purpose register index (0..=14).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gpr(pub u8);

/// Branch target. Backends map the id to their own label machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(pub u32);

/// Index scaling for memory operands. Only the factors the generators use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scale {
    X1,
    X2,
}

/// `[base + index*scale + disp]` memory operand.
#[derive(Debug, Clone, Copy)]
pub struct Mem {
    pub base: Gpr,
    pub index: Option<(Gpr, Scale)>,
    pub disp: i32,
}

impl Mem {
    pub fn base(base: Gpr, disp: i32) -> Self {
        Mem {
            base,
            index: None,
            disp,
        }
    }

    pub fn indexed(base: Gpr, index: Gpr, scale: Scale, disp: i32) -> Self {
        Mem {
            base,
            index: Some((index, scale)),
            disp,
        }
    }
}

/// Vector load flavors. The widening forms zero-extend unsigned bytes into
/// 32-bit lanes; the scalar forms never read past the addressed element,
/// which is what makes them safe as edge-tile fallbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    F32Vec,
    I32Vec,
    F32Scalar,
    I32Scalar,
    /// 8 unsigned bytes -> 8 i32 lanes.
    U8WidenVec,
    /// 1 unsigned byte -> lane 0.
    U8WidenScalar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    F32Vec,
    I32Vec,
    F32Scalar,
    I32Scalar,
}

/// Broadcast flavors; `S8` sign-extends one byte into every 32-bit lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BcastKind {
    F32,
    I32,
    S8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchHint {
    /// Read stream, all cache levels.
    T0,
    /// Read, L2 and below.
    T1,
    /// Write intent.
    W,
}

/// Virtual instruction set the generators emit against.
///
/// Methods are infallible: operand validity (slot budget, logical GPR range)
/// was established by the register plan and the generator, and the backend
/// debug-asserts it.
pub trait CodeEmitter {
    // ── Labels and branches ────────────────────────────────────────────
    fn new_label(&mut self) -> Label;
    fn bind_label(&mut self, l: Label);
    fn jmp(&mut self, l: Label);
    /// Branch if `r` is zero.
    fn jz(&mut self, r: Gpr, l: Label);
    /// Decrement `r`, branch while non-zero.
    fn dec_jnz(&mut self, r: Gpr, l: Label);
    /// Branch if `r` (unsigned) is below `imm`.
    fn cmp_jb(&mut self, r: Gpr, imm: i32, l: Label);

    // ── Function frame ─────────────────────────────────────────────────
    fn prologue(&mut self);
    fn epilogue_ret(&mut self);

    // ── General-purpose registers ──────────────────────────────────────
    fn mov(&mut self, dst: Gpr, src: Gpr);
    fn mov_imm(&mut self, dst: Gpr, imm: i64);
    fn add(&mut self, dst: Gpr, src: Gpr);
    fn add_imm(&mut self, r: Gpr, imm: i32);
    fn sub_imm(&mut self, r: Gpr, imm: i32);
    fn shl_imm(&mut self, r: Gpr, amount: u8);
    /// 64-bit load: `dst = *(m)`.
    fn load(&mut self, dst: Gpr, m: Mem);
    fn lea(&mut self, dst: Gpr, m: Mem);
    /// Store `src` to the frame spill slot `slot`.
    fn spill(&mut self, slot: u8, src: Gpr);
    fn reload(&mut self, dst: Gpr, slot: u8);

    // ── Vector operations ──────────────────────────────────────────────
    fn vzero(&mut self, v: VReg, int_domain: bool);
    fn vload(&mut self, v: VReg, m: Mem, kind: LoadKind);
    fn vstore(&mut self, m: Mem, v: VReg, kind: StoreKind);
    fn vbroadcast(&mut self, v: VReg, m: Mem, kind: BcastKind);
    /// `acc += a * b` (fused, f32 lanes).
    fn vfma_f32(&mut self, acc: VReg, a: VReg, b: VReg);
    /// `acc += a * b` through `tmp` (exact i32 lanes).
    fn vmuladd_i32(&mut self, acc: VReg, a: VReg, b: VReg, tmp: VReg);
    /// `dst = a + b` (i32 lanes).
    fn vadd_i32(&mut self, dst: VReg, a: VReg, b: VReg);
    fn prefetch(&mut self, m: Mem, hint: PrefetchHint);
}
