//! AVX2 backend for the `CodeEmitter` interface.
//!
//! Instruction emission goes through `dynasm!` over a byte-vector assembler;
//! the finished code is copied into an executable `CodeBuffer` by the
//! caller. Prefetch hints have no dynamic-register form we need from the
//! macro layer, so they are pushed as raw bytes, the same way the teacher
//! backends emit encodings outside the macro set.
//!
//! Logical GPR map (index -> physical):
//!
//!   0 rdi   argument record (incoming, preserved)
//!   1 rsi   2 r8    3 r15   4 r12   5 r9    6 r10   7 r11
//!   8 r14   9 rbx  10 rcx  11 rdx  12 rbp  13 r13  14 rax (scratch)
//!
//! rsp never appears, so memory operands never need an explicit SIB base
//! special case. rax is clobbered by byte-granular loads/broadcasts.

use dynasm::dynasm;
use dynasmrt::x64::X64Relocation;
use dynasmrt::{DynamicLabel, DynasmApi, DynasmLabelApi, VecAssembler};

use crate::error::{Error, Result};

use super::{BcastKind, CodeEmitter, Gpr, Label, LoadKind, Mem, PrefetchHint, Scale, StoreKind, VReg};

const GPR_MAP: [u8; 15] = [7, 6, 8, 15, 12, 9, 10, 11, 14, 3, 1, 2, 5, 13, 0];

/// Frame spill slots reserved below the pushed callee-saved registers.
const SPILL_SLOTS: u8 = 4;

fn phys(r: Gpr) -> u8 {
    GPR_MAP[r.0 as usize]
}

/// Resolved memory operand (physical registers).
struct PhysMem {
    base: u8,
    index: Option<(u8, Scale)>,
    disp: i32,
}

fn resolve(m: Mem) -> PhysMem {
    PhysMem {
        base: phys(m.base),
        index: m.index.map(|(i, s)| (phys(i), s)),
        disp: m.disp,
    }
}

/// Expand one instruction over the three supported addressing forms.
macro_rules! mem_op {
    ($ops:expr, $m:expr, ($($pre:tt)*), ($($post:tt)*)) => {{
        let pm = resolve($m);
        let b = pm.base;
        let d = pm.disp;
        match pm.index {
            None => dynasm!($ops ; .arch x64 ; $($pre)* [Rq(b) + d] $($post)*),
            Some((x, Scale::X1)) => {
                dynasm!($ops ; .arch x64 ; $($pre)* [Rq(b) + Rq(x) + d] $($post)*)
            }
            Some((x, Scale::X2)) => {
                dynasm!($ops ; .arch x64 ; $($pre)* [Rq(b) + Rq(x) * 2 + d] $($post)*)
            }
        }
    }};
}

pub struct Avx2Emitter {
    ops: VecAssembler<X64Relocation>,
    labels: Vec<DynamicLabel>,
}

impl Avx2Emitter {
    pub fn new() -> Self {
        Avx2Emitter {
            ops: VecAssembler::new(0),
            labels: Vec::new(),
        }
    }

    /// Assemble and return the finished code bytes.
    pub fn finalize(self) -> Result<Vec<u8>> {
        self.ops
            .finalize()
            .map_err(|e| Error::Assembly(format!("{e:?}")))
    }

    fn dyn_label(&self, l: Label) -> DynamicLabel {
        self.labels[l.0 as usize]
    }

    /// prefetch encodings: 0F 18 /1 (t0), 0F 18 /2 (t1), 0F 0D /1 (w),
    /// mod=10 with disp32, optional SIB for indexed forms.
    fn prefetch_raw(&mut self, m: Mem, opcode: u8, ext: u8) {
        let pm = resolve(m);
        let mut rex = 0x40u8;
        if pm.base >= 8 {
            rex |= 0x01;
        }
        if let Some((i, _)) = pm.index {
            if i >= 8 {
                rex |= 0x02;
            }
        }
        if rex != 0x40 {
            self.ops.push(rex);
        }
        self.ops.push(0x0F);
        self.ops.push(opcode);
        match pm.index {
            None => {
                debug_assert_ne!(pm.base & 7, 4);
                self.ops.push(0x80 | (ext << 3) | (pm.base & 7));
            }
            Some((i, s)) => {
                self.ops.push(0x84 | (ext << 3));
                let ss = match s {
                    Scale::X1 => 0u8,
                    Scale::X2 => 1u8,
                };
                self.ops.push((ss << 6) | ((i & 7) << 3) | (pm.base & 7));
            }
        }
        for b in pm.disp.to_le_bytes() {
            self.ops.push(b);
        }
    }
}

impl Default for Avx2Emitter {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeEmitter for Avx2Emitter {
    fn new_label(&mut self) -> Label {
        let l = self.ops.new_dynamic_label();
        self.labels.push(l);
        Label(self.labels.len() as u32 - 1)
    }

    fn bind_label(&mut self, l: Label) {
        let dl = self.dyn_label(l);
        dynasm!(self.ops ; .arch x64 ; =>dl);
    }

    fn jmp(&mut self, l: Label) {
        let dl = self.dyn_label(l);
        dynasm!(self.ops ; .arch x64 ; jmp =>dl);
    }

    fn jz(&mut self, r: Gpr, l: Label) {
        let p = phys(r);
        let dl = self.dyn_label(l);
        dynasm!(self.ops ; .arch x64 ; test Rq(p), Rq(p) ; jz =>dl);
    }

    fn dec_jnz(&mut self, r: Gpr, l: Label) {
        let p = phys(r);
        let dl = self.dyn_label(l);
        dynasm!(self.ops ; .arch x64 ; dec Rq(p) ; jnz =>dl);
    }

    fn cmp_jb(&mut self, r: Gpr, imm: i32, l: Label) {
        let p = phys(r);
        let dl = self.dyn_label(l);
        dynasm!(self.ops ; .arch x64 ; cmp Rq(p), imm ; jb =>dl);
    }

    fn prologue(&mut self) {
        let frame = SPILL_SLOTS as i32 * 8;
        dynasm!(self.ops
            ; .arch x64
            ; push rbx
            ; push rbp
            ; push r12
            ; push r13
            ; push r14
            ; push r15
            ; sub rsp, frame
        );
    }

    fn epilogue_ret(&mut self) {
        let frame = SPILL_SLOTS as i32 * 8;
        dynasm!(self.ops
            ; .arch x64
            ; add rsp, frame
            ; pop r15
            ; pop r14
            ; pop r13
            ; pop r12
            ; pop rbp
            ; pop rbx
            ; ret
        );
    }

    fn mov(&mut self, dst: Gpr, src: Gpr) {
        if dst == src {
            return;
        }
        let (d, s) = (phys(dst), phys(src));
        dynasm!(self.ops ; .arch x64 ; mov Rq(d), Rq(s));
    }

    fn mov_imm(&mut self, dst: Gpr, imm: i64) {
        let d = phys(dst);
        if let Ok(imm32) = i32::try_from(imm) {
            dynasm!(self.ops ; .arch x64 ; mov Rq(d), imm32);
        } else {
            dynasm!(self.ops ; .arch x64 ; mov Rq(d), QWORD imm);
        }
    }

    fn add(&mut self, dst: Gpr, src: Gpr) {
        let (d, s) = (phys(dst), phys(src));
        dynasm!(self.ops ; .arch x64 ; add Rq(d), Rq(s));
    }

    fn add_imm(&mut self, r: Gpr, imm: i32) {
        if imm == 0 {
            return;
        }
        let p = phys(r);
        dynasm!(self.ops ; .arch x64 ; add Rq(p), imm);
    }

    fn sub_imm(&mut self, r: Gpr, imm: i32) {
        if imm == 0 {
            return;
        }
        let p = phys(r);
        dynasm!(self.ops ; .arch x64 ; sub Rq(p), imm);
    }

    fn shl_imm(&mut self, r: Gpr, amount: u8) {
        if amount == 0 {
            return;
        }
        let p = phys(r);
        dynasm!(self.ops ; .arch x64 ; shl Rq(p), amount as i8);
    }

    fn load(&mut self, dst: Gpr, m: Mem) {
        let d = phys(dst);
        mem_op!(self.ops, m, (mov Rq(d),), ());
    }

    fn lea(&mut self, dst: Gpr, m: Mem) {
        let d = phys(dst);
        mem_op!(self.ops, m, (lea Rq(d),), ());
    }

    fn spill(&mut self, slot: u8, src: Gpr) {
        debug_assert!(slot < SPILL_SLOTS);
        let s = phys(src);
        let off = slot as i32 * 8;
        dynasm!(self.ops ; .arch x64 ; mov [rsp + off], Rq(s));
    }

    fn reload(&mut self, dst: Gpr, slot: u8) {
        debug_assert!(slot < SPILL_SLOTS);
        let d = phys(dst);
        let off = slot as i32 * 8;
        dynasm!(self.ops ; .arch x64 ; mov Rq(d), [rsp + off]);
    }

    fn vzero(&mut self, v: VReg, int_domain: bool) {
        let v = v.0;
        if int_domain {
            dynasm!(self.ops ; .arch x64 ; vpxor Ry(v), Ry(v), Ry(v));
        } else {
            dynasm!(self.ops ; .arch x64 ; vxorps Ry(v), Ry(v), Ry(v));
        }
    }

    fn vload(&mut self, v: VReg, m: Mem, kind: LoadKind) {
        let v = v.0;
        match kind {
            LoadKind::F32Vec => mem_op!(self.ops, m, (vmovups Ry(v),), ()),
            LoadKind::I32Vec => mem_op!(self.ops, m, (vmovdqu Ry(v),), ()),
            LoadKind::F32Scalar => mem_op!(self.ops, m, (vmovss Rx(v),), ()),
            LoadKind::I32Scalar => mem_op!(self.ops, m, (vmovd Rx(v),), ()),
            LoadKind::U8WidenVec => {
                mem_op!(self.ops, m, (vmovq Rx(v), QWORD), ());
                dynasm!(self.ops ; .arch x64 ; vpmovzxbd Ry(v), Rx(v));
            }
            LoadKind::U8WidenScalar => {
                mem_op!(self.ops, m, (movzx eax, BYTE), ());
                dynasm!(self.ops ; .arch x64 ; vmovd Rx(v), eax);
            }
        }
    }

    fn vstore(&mut self, m: Mem, v: VReg, kind: StoreKind) {
        let v = v.0;
        match kind {
            StoreKind::F32Vec => mem_op!(self.ops, m, (vmovups), (, Ry(v))),
            StoreKind::I32Vec => mem_op!(self.ops, m, (vmovdqu), (, Ry(v))),
            StoreKind::F32Scalar => mem_op!(self.ops, m, (vmovss), (, Rx(v))),
            StoreKind::I32Scalar => mem_op!(self.ops, m, (vmovd), (, Rx(v))),
        }
    }

    fn vbroadcast(&mut self, v: VReg, m: Mem, kind: BcastKind) {
        let v = v.0;
        match kind {
            BcastKind::F32 => mem_op!(self.ops, m, (vbroadcastss Ry(v), DWORD), ()),
            BcastKind::I32 => mem_op!(self.ops, m, (vpbroadcastd Ry(v), DWORD), ()),
            BcastKind::S8 => {
                mem_op!(self.ops, m, (movsx eax, BYTE), ());
                dynasm!(self.ops
                    ; .arch x64
                    ; vmovd Rx(v), eax
                    ; vpbroadcastd Ry(v), Rx(v)
                );
            }
        }
    }

    fn vfma_f32(&mut self, acc: VReg, a: VReg, b: VReg) {
        let (acc, a, b) = (acc.0, a.0, b.0);
        dynasm!(self.ops ; .arch x64 ; vfmadd231ps Ry(acc), Ry(a), Ry(b));
    }

    fn vmuladd_i32(&mut self, acc: VReg, a: VReg, b: VReg, tmp: VReg) {
        let (acc, a, b, tmp) = (acc.0, a.0, b.0, tmp.0);
        dynasm!(self.ops
            ; .arch x64
            ; vpmulld Ry(tmp), Ry(a), Ry(b)
            ; vpaddd Ry(acc), Ry(acc), Ry(tmp)
        );
    }

    fn vadd_i32(&mut self, dst: VReg, a: VReg, b: VReg) {
        let (d, a, b) = (dst.0, a.0, b.0);
        dynasm!(self.ops ; .arch x64 ; vpaddd Ry(d), Ry(a), Ry(b));
    }

    fn prefetch(&mut self, m: Mem, hint: PrefetchHint) {
        match hint {
            PrefetchHint::T0 => self.prefetch_raw(m, 0x18, 1),
            PrefetchHint::T1 => self.prefetch_raw(m, 0x18, 2),
            PrefetchHint::W => self.prefetch_raw(m, 0x0D, 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_map_has_no_duplicates_and_no_rsp() {
        let mut seen = std::collections::HashSet::new();
        for &p in &GPR_MAP {
            assert_ne!(p, 4, "rsp must not be mapped");
            assert!(seen.insert(p));
        }
    }

    #[test]
    fn emits_a_callable_frame() {
        let mut e = Avx2Emitter::new();
        e.prologue();
        e.mov_imm(Gpr(14), 0);
        e.epilogue_ret();
        let code = e.finalize().unwrap();
        assert!(!code.is_empty());
        // ends with ret
        assert_eq!(*code.last().unwrap(), 0xC3);
    }

    #[test]
    fn prefetch_encodings_are_stable() {
        // prefetcht0 [rsi + 256] -> 0F 18 8E 00 01 00 00
        let mut e = Avx2Emitter::new();
        e.prefetch(Mem::base(Gpr(1), 256), PrefetchHint::T0);
        let code = e.finalize().unwrap();
        assert_eq!(code, vec![0x0F, 0x18, 0x8E, 0x00, 0x01, 0x00, 0x00]);

        // prefetchw [r15 + 0] -> 41 0F 0D 8F 00 00 00 00
        let mut e = Avx2Emitter::new();
        e.prefetch(Mem::base(Gpr(3), 0), PrefetchHint::W);
        let code = e.finalize().unwrap();
        assert_eq!(code, vec![0x41, 0x0F, 0x0D, 0x8F, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn forward_and_backward_labels_resolve() {
        let mut e = Avx2Emitter::new();
        let top = e.new_label();
        let out = e.new_label();
        e.prologue();
        e.mov_imm(Gpr(10), 4);
        e.bind_label(top);
        e.jz(Gpr(10), out);
        e.dec_jnz(Gpr(10), top);
        e.bind_label(out);
        e.epilogue_ret();
        assert!(e.finalize().is_ok());
    }
}
