//! Minimal x86-64 assembler for the matcher's code generator.
//!
//! Instructions are emitted into a growable byte vector. Branch targets
//! are [`CodeLabel`]s: rel32 jump displacements and abs64 address
//! immediates are recorded as fixups and resolved by [`Assembler::finalize`],
//! which copies the code into an [`ExecBuf`], patches absolute fixups
//! against the mapped base address, and flips the buffer to
//! read+execute.
//!
//! Only the instruction forms the matcher needs are provided; each
//! emitter encodes REX and ModR/M by hand in the usual way.

use crate::Error;
use crate::memory::ExecBuf;
use crate::registers::Gpr;
use rustc_hash::FxHashMap;

/// Encode a REX prefix.
#[inline]
pub(crate) const fn rex(w: bool, r: bool, x: bool, b: bool) -> u8 {
    0x40 | ((w as u8) << 3) | ((r as u8) << 2) | ((x as u8) << 1) | (b as u8)
}

/// Encode a ModR/M byte.
#[inline]
pub(crate) const fn modrm(mod_: u8, reg: u8, rm: u8) -> u8 {
    (mod_ << 6) | ((reg & 7) << 3) | (rm & 7)
}

/// A position in the emitted code, used as a jump or address target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeLabel(u32);

impl CodeLabel {
    /// The raw label id (diagnostics only).
    #[inline]
    pub const fn id(self) -> u32 {
        self.0
    }
}

/// A rel32 displacement awaiting its target.
#[derive(Debug)]
struct RelFixup {
    /// Offset of the 4 displacement bytes.
    at: usize,
    label: CodeLabel,
}

/// An abs64 address immediate awaiting the buffer base.
#[derive(Debug)]
struct AbsFixup {
    /// Offset of the 8 immediate bytes.
    at: usize,
    label: CodeLabel,
}

/// Code buffer with label resolution for emitting x64 instructions.
pub struct Assembler {
    code: Vec<u8>,
    next_label: u32,
    bound: FxHashMap<CodeLabel, usize>,
    rel_fixups: Vec<RelFixup>,
    abs_fixups: Vec<AbsFixup>,
}

impl Assembler {
    /// Create a new assembler.
    pub fn new() -> Self {
        Assembler {
            code: Vec::new(),
            next_label: 0,
            bound: FxHashMap::default(),
            rel_fixups: Vec::new(),
            abs_fixups: Vec::new(),
        }
    }

    /// Current emit offset.
    #[inline]
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Create a new label for a branch target.
    pub fn create_label(&mut self) -> CodeLabel {
        let label = CodeLabel(self.next_label);
        self.next_label += 1;
        label
    }

    /// Bind a label to the current emit position.
    pub fn bind_label(&mut self, label: CodeLabel) {
        debug_assert!(
            !self.bound.contains_key(&label),
            "label bound twice: {label:?}"
        );
        self.bound.insert(label, self.code.len());
    }

    // =========================================================================
    // Raw emission
    // =========================================================================

    #[inline]
    fn emit(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    #[inline]
    fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit a ModR/M memory operand `[base + disp]` for the given reg
    /// field, handling the RSP/R12 SIB escape and the RBP/R13
    /// displacement requirement.
    fn emit_mem(&mut self, reg: u8, base: Gpr, disp: i32) {
        let needs_disp = disp != 0 || base.needs_displacement();
        let (mod_, disp_bytes): (u8, usize) = if !needs_disp {
            (0b00, 0)
        } else if (-128..=127).contains(&disp) {
            (0b01, 1)
        } else {
            (0b10, 4)
        };

        if base.needs_sib_as_base() {
            self.emit_u8(modrm(mod_, reg, 0b100));
            // SIB: scale 1, no index, the real base.
            self.emit_u8(modrm(0b00, 0b100, base.low_bits()));
        } else {
            self.emit_u8(modrm(mod_, reg, base.low_bits()));
        }

        match disp_bytes {
            1 => self.emit_u8(disp as i8 as u8),
            4 => self.emit(&disp.to_le_bytes()),
            _ => {}
        }
    }

    // =========================================================================
    // Moves and stack
    // =========================================================================

    /// `push r64`
    pub fn push_r(&mut self, reg: Gpr) {
        if reg.high_bit() {
            self.emit_u8(rex(false, false, false, true));
        }
        self.emit_u8(0x50 + reg.low_bits());
    }

    /// `pop r64`
    pub fn pop_r(&mut self, reg: Gpr) {
        if reg.high_bit() {
            self.emit_u8(rex(false, false, false, true));
        }
        self.emit_u8(0x58 + reg.low_bits());
    }

    /// `mov dst, src` (64-bit)
    pub fn mov_rr(&mut self, dst: Gpr, src: Gpr) {
        self.emit_u8(rex(true, src.high_bit(), false, dst.high_bit()));
        self.emit_u8(0x89);
        self.emit_u8(modrm(0b11, src.low_bits(), dst.low_bits()));
    }

    /// `mov r64, imm64`
    pub fn mov_ri64(&mut self, dst: Gpr, imm: u64) {
        self.emit_u8(rex(true, false, false, dst.high_bit()));
        self.emit_u8(0xB8 + dst.low_bits());
        self.emit(&imm.to_le_bytes());
    }

    /// `mov r32, imm32` (zero-extends into the full register)
    pub fn mov_ri32(&mut self, dst: Gpr, imm: u32) {
        if dst.high_bit() {
            self.emit_u8(rex(false, false, false, true));
        }
        self.emit_u8(0xB8 + dst.low_bits());
        self.emit(&imm.to_le_bytes());
    }

    /// `mov r64, <label address>` — the 8 immediate bytes are patched
    /// with the label's absolute address at finalization.
    pub fn mov_label_addr(&mut self, dst: Gpr, label: CodeLabel) {
        self.emit_u8(rex(true, false, false, dst.high_bit()));
        self.emit_u8(0xB8 + dst.low_bits());
        self.abs_fixups.push(AbsFixup {
            at: self.code.len(),
            label,
        });
        self.emit(&0u64.to_le_bytes());
    }

    /// `xor r32, r32`
    pub fn xor_rr32(&mut self, dst: Gpr, src: Gpr) {
        if dst.high_bit() || src.high_bit() {
            self.emit_u8(rex(false, src.high_bit(), false, dst.high_bit()));
        }
        self.emit_u8(0x31);
        self.emit_u8(modrm(0b11, src.low_bits(), dst.low_bits()));
    }

    /// `movzx r32, byte [base]`
    pub fn movzx_r32_mem8(&mut self, dst: Gpr, base: Gpr) {
        if dst.high_bit() || base.high_bit() {
            self.emit_u8(rex(false, dst.high_bit(), false, base.high_bit()));
        }
        self.emit(&[0x0F, 0xB6]);
        self.emit_mem(dst.low_bits(), base, 0);
    }

    /// `lea r32, [base + disp]`
    pub fn lea_r32(&mut self, dst: Gpr, base: Gpr, disp: i32) {
        if dst.high_bit() || base.high_bit() {
            self.emit_u8(rex(false, dst.high_bit(), false, base.high_bit()));
        }
        self.emit_u8(0x8D);
        self.emit_mem(dst.low_bits(), base, disp);
    }

    // =========================================================================
    // Arithmetic and compares
    // =========================================================================

    /// `inc r64`
    pub fn inc_r(&mut self, reg: Gpr) {
        self.emit_u8(rex(true, false, false, reg.high_bit()));
        self.emit_u8(0xFF);
        self.emit_u8(modrm(0b11, 0, reg.low_bits()));
    }

    /// `add r64, imm8`
    pub fn add_ri8(&mut self, reg: Gpr, imm: i8) {
        self.emit_u8(rex(true, false, false, reg.high_bit()));
        self.emit_u8(0x83);
        self.emit_u8(modrm(0b11, 0, reg.low_bits()));
        self.emit_u8(imm as u8);
    }

    /// `cmp r64, r64`
    pub fn cmp_rr(&mut self, a: Gpr, b: Gpr) {
        self.emit_u8(rex(true, b.high_bit(), false, a.high_bit()));
        self.emit_u8(0x39);
        self.emit_u8(modrm(0b11, b.low_bits(), a.low_bits()));
    }

    /// `cmp byte [base], imm8`
    pub fn cmp_mem8_imm(&mut self, base: Gpr, imm: u8) {
        if base.high_bit() {
            self.emit_u8(rex(false, false, false, true));
        }
        self.emit_u8(0x80);
        self.emit_mem(7, base, 0);
        self.emit_u8(imm);
    }

    /// `cmp word [base], imm16`
    pub fn cmp_mem16_imm(&mut self, base: Gpr, imm: u16) {
        self.emit_u8(0x66);
        if base.high_bit() {
            self.emit_u8(rex(false, false, false, true));
        }
        self.emit_u8(0x81);
        self.emit_mem(7, base, 0);
        self.emit(&imm.to_le_bytes());
    }

    /// `cmp dword [base], imm32`
    pub fn cmp_mem32_imm(&mut self, base: Gpr, imm: u32) {
        if base.high_bit() {
            self.emit_u8(rex(false, false, false, true));
        }
        self.emit_u8(0x81);
        self.emit_mem(7, base, 0);
        self.emit(&imm.to_le_bytes());
    }

    /// `cmp r64, qword [base]`
    pub fn cmp_r_mem64(&mut self, reg: Gpr, base: Gpr) {
        self.emit_u8(rex(true, reg.high_bit(), false, base.high_bit()));
        self.emit_u8(0x3B);
        self.emit_mem(reg.low_bits(), base, 0);
    }

    /// `cmp r8, imm8` (low byte of the register)
    pub fn cmp_r8_imm(&mut self, reg: Gpr, imm: u8) {
        if reg.high_bit() {
            self.emit_u8(rex(false, false, false, true));
        }
        self.emit_u8(0x80);
        self.emit_u8(modrm(0b11, 7, reg.low_bits()));
        self.emit_u8(imm);
    }

    /// `test r8, r8`
    pub fn test_rr8(&mut self, a: Gpr, b: Gpr) {
        if a.high_bit() || b.high_bit() {
            self.emit_u8(rex(false, b.high_bit(), false, a.high_bit()));
        }
        self.emit_u8(0x84);
        self.emit_u8(modrm(0b11, b.low_bits(), a.low_bits()));
    }

    /// `or r8, r8`
    pub fn or_rr8(&mut self, dst: Gpr, src: Gpr) {
        if dst.high_bit() || src.high_bit() {
            self.emit_u8(rex(false, src.high_bit(), false, dst.high_bit()));
        }
        self.emit_u8(0x08);
        self.emit_u8(modrm(0b11, src.low_bits(), dst.low_bits()));
    }

    /// `sete r8`
    pub fn sete_r8(&mut self, reg: Gpr) {
        self.setcc_r8(0x94, reg);
    }

    /// `setbe r8` (unsigned below-or-equal)
    pub fn setbe_r8(&mut self, reg: Gpr) {
        self.setcc_r8(0x96, reg);
    }

    fn setcc_r8(&mut self, opcode: u8, reg: Gpr) {
        if reg.high_bit() {
            self.emit_u8(rex(false, false, false, true));
        }
        self.emit(&[0x0F, opcode]);
        self.emit_u8(modrm(0b11, 0, reg.low_bits()));
    }

    // =========================================================================
    // Control flow
    // =========================================================================

    /// `jmp rel32` to a label.
    pub fn jmp_label(&mut self, label: CodeLabel) {
        self.emit_u8(0xE9);
        self.rel32_fixup(label);
    }

    /// `je rel32` to a label.
    pub fn je_label(&mut self, label: CodeLabel) {
        self.emit(&[0x0F, 0x84]);
        self.rel32_fixup(label);
    }

    /// `jne rel32` to a label.
    pub fn jne_label(&mut self, label: CodeLabel) {
        self.emit(&[0x0F, 0x85]);
        self.rel32_fixup(label);
    }

    /// `jmp r64` (indirect)
    pub fn jmp_r(&mut self, reg: Gpr) {
        if reg.high_bit() {
            self.emit_u8(rex(false, false, false, true));
        }
        self.emit_u8(0xFF);
        self.emit_u8(modrm(0b11, 4, reg.low_bits()));
    }

    /// `ret`
    pub fn ret(&mut self) {
        self.emit_u8(0xC3);
    }

    fn rel32_fixup(&mut self, label: CodeLabel) {
        self.rel_fixups.push(RelFixup {
            at: self.code.len(),
            label,
        });
        self.emit(&0i32.to_le_bytes());
    }

    // =========================================================================
    // Finalization
    // =========================================================================

    /// Resolve every fixup, move the code into executable memory, and
    /// flip it to read+execute.
    pub fn finalize(mut self) -> Result<ExecBuf, Error> {
        for fixup in &self.rel_fixups {
            let target = *self
                .bound
                .get(&fixup.label)
                .ok_or(Error::UnboundLabel(fixup.label.id()))?;
            let rel = target as i64 - (fixup.at as i64 + 4);
            let rel: i32 = rel.try_into().map_err(|_| Error::JumpOutOfRange)?;
            self.code[fixup.at..fixup.at + 4].copy_from_slice(&rel.to_le_bytes());
        }

        let mut buf = ExecBuf::new(self.code.len()).map_err(Error::CodeAlloc)?;
        buf.write(&self.code);

        let base = buf.as_ptr() as u64;
        for fixup in &self.abs_fixups {
            let target = *self
                .bound
                .get(&fixup.label)
                .ok_or(Error::UnboundLabel(fixup.label.id()))?;
            buf.patch_u64(fixup.at, base + target as u64);
        }

        buf.make_executable().map_err(Error::CodeProtect)?;
        Ok(buf)
    }

    /// The bytes emitted so far (fixups unresolved), for tests.
    #[cfg(test)]
    pub(crate) fn code(&self) -> &[u8] {
        &self.code
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rex_w() {
        assert_eq!(rex(true, false, false, false), 0x48);
        assert_eq!(rex(true, true, false, true), 0x4D);
    }

    #[test]
    fn test_modrm_reg_reg() {
        assert_eq!(modrm(0b11, 3, 0), 0xD8);
    }

    #[test]
    fn test_encode_prologue_pair() {
        let mut asm = Assembler::new();
        asm.push_r(Gpr::Rbp);
        asm.mov_rr(Gpr::Rbp, Gpr::Rsp);
        assert_eq!(asm.code(), &[0x55, 0x48, 0x89, 0xE5]);
    }

    #[test]
    fn test_encode_push_pop_extended() {
        let mut asm = Assembler::new();
        asm.push_r(Gpr::R9);
        asm.pop_r(Gpr::R9);
        assert_eq!(asm.code(), &[0x41, 0x51, 0x41, 0x59]);
    }

    #[test]
    fn test_encode_cmp_mem8() {
        let mut asm = Assembler::new();
        asm.cmp_mem8_imm(Gpr::Rdi, b'a');
        assert_eq!(asm.code(), &[0x80, 0x3F, 0x61]);
    }

    #[test]
    fn test_encode_cmp_mem8_rcx_base() {
        let mut asm = Assembler::new();
        asm.cmp_mem8_imm(Gpr::Rcx, 0);
        assert_eq!(asm.code(), &[0x80, 0x39, 0x00]);
    }

    #[test]
    fn test_encode_inc_add() {
        let mut asm = Assembler::new();
        asm.inc_r(Gpr::Rdi);
        asm.add_ri8(Gpr::Rdi, 8);
        assert_eq!(asm.code(), &[0x48, 0xFF, 0xC7, 0x48, 0x83, 0xC7, 0x08]);
    }

    #[test]
    fn test_encode_movzx_lea() {
        let mut asm = Assembler::new();
        asm.movzx_r32_mem8(Gpr::Rdx, Gpr::Rdi);
        asm.lea_r32(Gpr::R8, Gpr::Rdx, -97);
        assert_eq!(asm.code(), &[0x0F, 0xB6, 0x17, 0x44, 0x8D, 0x42, 0x9F]);
    }

    #[test]
    fn test_encode_flag_ops() {
        let mut asm = Assembler::new();
        asm.sete_r8(Gpr::R8);
        asm.or_rr8(Gpr::Rax, Gpr::R8);
        asm.test_rr8(Gpr::Rax, Gpr::Rax);
        assert_eq!(
            asm.code(),
            &[0x41, 0x0F, 0x94, 0xC0, 0x44, 0x08, 0xC0, 0x84, 0xC0]
        );
    }

    #[test]
    fn test_encode_cmp_r_mem64() {
        let mut asm = Assembler::new();
        asm.cmp_r_mem64(Gpr::Rax, Gpr::Rdi);
        assert_eq!(asm.code(), &[0x48, 0x3B, 0x07]);
    }

    #[test]
    fn test_encode_jmp_indirect() {
        let mut asm = Assembler::new();
        asm.jmp_r(Gpr::R9);
        assert_eq!(asm.code(), &[0x41, 0xFF, 0xE1]);
    }

    #[test]
    fn test_encode_mem_sib_and_disp_bases() {
        // R12 forces a SIB byte, R13 forces a zero disp8.
        let mut asm = Assembler::new();
        asm.cmp_mem8_imm(Gpr::R12, 1);
        asm.cmp_mem8_imm(Gpr::R13, 2);
        assert_eq!(
            asm.code(),
            &[0x41, 0x80, 0x3C, 0x24, 0x01, 0x41, 0x80, 0x7D, 0x00, 0x02]
        );
    }

    #[test]
    fn test_backward_jump_resolution() {
        let mut asm = Assembler::new();
        let top = asm.create_label();
        asm.bind_label(top);
        asm.ret(); // offset 0
        asm.jmp_label(top); // offset 1, rel = 0 - (2 + 4) = -6
        asm.finalize_in_place_for_test();
        assert_eq!(&asm.code()[1..6], &[0xE9, 0xFA, 0xFF, 0xFF, 0xFF]);
    }

    impl Assembler {
        /// Resolve rel32 fixups without allocating executable memory.
        fn finalize_in_place_for_test(&mut self) {
            let fixups = std::mem::take(&mut self.rel_fixups);
            for fixup in fixups {
                let target = self.bound[&fixup.label];
                let rel = (target as i64 - (fixup.at as i64 + 4)) as i32;
                self.code[fixup.at..fixup.at + 4].copy_from_slice(&rel.to_le_bytes());
            }
        }
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn test_finalize_and_execute() {
        let mut asm = Assembler::new();
        let end = asm.create_label();
        asm.mov_ri32(Gpr::Rax, 7);
        asm.jmp_label(end);
        asm.mov_ri32(Gpr::Rax, 9); // skipped
        asm.bind_label(end);
        asm.ret();

        let buf = asm.finalize().expect("finalize should succeed");
        type Ret = unsafe extern "C" fn() -> i32;
        let f: Ret = unsafe { buf.as_fn() };
        assert_eq!(unsafe { f() }, 7);
    }

    #[test]
    fn test_unbound_label_is_an_error() {
        let mut asm = Assembler::new();
        let nowhere = asm.create_label();
        asm.jmp_label(nowhere);
        assert!(matches!(asm.finalize(), Err(Error::UnboundLabel(_))));
    }
}
