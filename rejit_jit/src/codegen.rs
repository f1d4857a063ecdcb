//! Lowering from the linear IR to x86-64 machine code.
//!
//! The emitted function implements a backtracking NFA executor with the
//! native call stack doubling as the thread stack:
//!
//! ```text
//! entry:        push rbp ; mov rbp, rsp ; jmp run
//! match_fail:   xor eax, eax                    ; falls through
//! match_return: mov rsp, rbp ; pop rbp ; ret
//! thread_fail:  cmp rsp, rbp ; je match_fail
//!               pop cursor ; pop r9 ; jmp r9
//! run:          ...one template per IR instruction...
//! ```
//!
//! `rbp` captures the no-more-threads sentinel: while `rsp` sits above
//! it, each pending thread is a `(resume address, saved cursor)` pair
//! with the cursor on top. Splits push a thread and continue; every
//! consuming template bails to `thread_fail` on mismatch, which resumes
//! the most recent thread via an indirect jump.
//!
//! The input cursor lives in the first argument register of the host C
//! convention. Scratch registers (RAX, RDX, R8, R9) are volatile under
//! both the System V and Windows x64 ABIs; no callee-saved register is
//! touched except RBP, which the prologue saves.

use crate::Error;
use crate::asm::{Assembler, CodeLabel};
use crate::memory::ExecBuf;
use crate::registers::{CallingConvention, Gpr};
use log::{debug, trace};
use rejit_compiler::ir::{Inst, Program};
use rustc_hash::FxHashMap;

/// Accumulator for charset membership and the split resume address.
const ACC: Gpr = Gpr::Rax;
/// Scratch register for byte loads.
const BYTE: Gpr = Gpr::Rdx;
/// Scratch register for per-range flags.
const FLAG: Gpr = Gpr::R8;
/// Scratch register for the resume address in `thread_fail`.
const RESUME: Gpr = Gpr::R9;

/// Lower a validated program to executable machine code.
pub fn emit(prog: &Program) -> Result<ExecBuf, Error> {
    CodeGenerator::new().gen(prog)
}

struct CodeGenerator {
    asm: Assembler,
    /// The input cursor: first argument register of the host ABI.
    cursor: Gpr,
}

impl CodeGenerator {
    fn new() -> Self {
        CodeGenerator {
            asm: Assembler::new(),
            cursor: CallingConvention::host().arg0(),
        }
    }

    fn gen(mut self, prog: &Program) -> Result<ExecBuf, Error> {
        // The accumulator doubles as the result register.
        debug_assert_eq!(ACC, CallingConvention::host().int_return_reg());
        debug!("lowering {} instruction(s), cursor in {}", prog.insts.len(), self.cursor);

        // One code label per IR label, created up front so forward
        // references resolve.
        let mut marks: FxHashMap<rejit_compiler::Label, CodeLabel> = FxHashMap::default();
        for inst in &prog.insts {
            if let Inst::Mark(l) = inst {
                marks.insert(*l, self.asm.create_label());
            }
        }

        let match_fail = self.asm.create_label();
        let match_return = self.asm.create_label();
        let thread_fail = self.asm.create_label();
        let run = self.asm.create_label();

        // Prologue: capture the thread-stack sentinel and skip the stubs.
        self.asm.push_r(Gpr::Rbp);
        self.asm.mov_rr(Gpr::Rbp, Gpr::Rsp);
        self.asm.jmp_label(run);

        // Overall failure: zero the result and fall into the epilogue.
        self.asm.bind_label(match_fail);
        self.asm.xor_rr32(ACC, ACC);

        self.asm.bind_label(match_return);
        self.asm.mov_rr(Gpr::Rsp, Gpr::Rbp);
        self.asm.pop_r(Gpr::Rbp);
        self.asm.ret();

        // Backtrack: resume the most recent thread, or give up when the
        // stack is back at the sentinel.
        self.asm.bind_label(thread_fail);
        self.asm.cmp_rr(Gpr::Rsp, Gpr::Rbp);
        self.asm.je_label(match_fail);
        self.asm.pop_r(self.cursor);
        self.asm.pop_r(RESUME);
        self.asm.jmp_r(RESUME);

        self.asm.bind_label(run);
        for (pc, inst) in prog.insts.iter().enumerate() {
            trace!("emit pc {pc} at code offset {}", self.asm.offset());
            self.emit_inst(prog, inst, &marks, thread_fail, match_return)?;
        }

        self.asm.finalize()
    }

    fn emit_inst(
        &mut self,
        prog: &Program,
        inst: &Inst,
        marks: &FxHashMap<rejit_compiler::Label, CodeLabel>,
        thread_fail: CodeLabel,
        match_return: CodeLabel,
    ) -> Result<(), Error> {
        let resolve = |l: &rejit_compiler::Label| -> Result<CodeLabel, Error> {
            marks.get(l).copied().ok_or(Error::UnboundLabel(l.id()))
        };

        match inst {
            Inst::Mark(l) => {
                let label = resolve(l)?;
                self.asm.bind_label(label);
            }

            Inst::Split { pri, alt } => {
                // Suspend a thread at `alt` with the current cursor,
                // then take the primary branch.
                self.asm.mov_label_addr(ACC, resolve(alt)?);
                self.asm.push_r(ACC);
                self.asm.push_r(self.cursor);
                self.asm.jmp_label(resolve(pri)?);
            }

            Inst::SplitOne { alt } => {
                self.asm.mov_label_addr(ACC, resolve(alt)?);
                self.asm.push_r(ACC);
                self.asm.push_r(self.cursor);
            }

            Inst::Single(b) => {
                self.asm.cmp_mem8_imm(self.cursor, *b);
                self.asm.jne_label(thread_fail);
                self.asm.inc_r(self.cursor);
            }

            Inst::Charset(ranges) => {
                // Accumulate membership flags in AL; a NUL byte can
                // never be a member.
                self.asm.xor_rr32(ACC, ACC);
                self.asm.movzx_r32_mem8(BYTE, self.cursor);
                self.asm.test_rr8(BYTE, BYTE);
                self.asm.je_label(thread_fail);
                for r in ranges {
                    if r.lo == r.hi {
                        self.asm.cmp_r8_imm(BYTE, r.lo);
                        self.asm.sete_r8(FLAG);
                    } else {
                        // Unsigned trick: b - lo <= hi - lo.
                        self.asm.lea_r32(FLAG, BYTE, -i32::from(r.lo));
                        self.asm.cmp_r8_imm(FLAG, r.hi - r.lo);
                        self.asm.setbe_r8(FLAG);
                    }
                    self.asm.or_rr8(ACC, FLAG);
                }
                self.asm.test_rr8(ACC, ACC);
                self.asm.je_label(thread_fail);
                self.asm.inc_r(self.cursor);
            }

            Inst::Any => {
                self.asm.cmp_mem8_imm(self.cursor, 0);
                self.asm.je_label(thread_fail);
                self.asm.inc_r(self.cursor);
            }

            Inst::Str(id) => {
                // Peel the literal off in 8/4/2/1-byte immediate
                // compares, advancing after each chunk.
                let mut rest = prog.literal(*id);
                while !rest.is_empty() {
                    if rest.len() >= 8 {
                        let chunk = u64::from_le_bytes(rest[..8].try_into().unwrap());
                        self.asm.mov_ri64(ACC, chunk);
                        self.asm.cmp_r_mem64(ACC, self.cursor);
                        self.asm.jne_label(thread_fail);
                        self.asm.add_ri8(self.cursor, 8);
                        rest = &rest[8..];
                    } else if rest.len() >= 4 {
                        let chunk = u32::from_le_bytes(rest[..4].try_into().unwrap());
                        self.asm.cmp_mem32_imm(self.cursor, chunk);
                        self.asm.jne_label(thread_fail);
                        self.asm.add_ri8(self.cursor, 4);
                        rest = &rest[4..];
                    } else if rest.len() >= 2 {
                        let chunk = u16::from_le_bytes(rest[..2].try_into().unwrap());
                        self.asm.cmp_mem16_imm(self.cursor, chunk);
                        self.asm.jne_label(thread_fail);
                        self.asm.add_ri8(self.cursor, 2);
                        rest = &rest[2..];
                    } else {
                        self.asm.cmp_mem8_imm(self.cursor, rest[0]);
                        self.asm.jne_label(thread_fail);
                        self.asm.inc_r(self.cursor);
                        rest = &rest[1..];
                    }
                }
            }

            Inst::Jump(l) => {
                self.asm.jmp_label(resolve(l)?);
            }

            Inst::Accept => {
                self.asm.mov_ri32(ACC, 1);
                self.asm.jmp_label(match_return);
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rejit_compiler::parse;

    fn emit_pattern(pattern: &str) -> ExecBuf {
        let prog = parse(pattern).expect("pattern should parse");
        emit(&prog).expect("codegen should succeed")
    }

    #[test]
    fn test_emit_produces_finalized_code() {
        let buf = emit_pattern("a(b|c)*d");
        assert!(buf.is_executable());
        assert!(!buf.is_empty());
    }

    #[test]
    fn test_emit_empty_pattern() {
        // Just the prologue, the stubs and ACCEPT.
        let buf = emit_pattern("");
        assert!(buf.is_executable());
    }

    #[test]
    fn test_emitted_code_starts_with_prologue() {
        let buf = emit_pattern("x");
        // push rbp ; mov rbp, rsp ; jmp run
        assert_eq!(&buf.as_slice()[..4], &[0x55, 0x48, 0x89, 0xE5]);
        assert_eq!(buf.as_slice()[4], 0xE9);
    }

    #[cfg(target_arch = "x86_64")]
    mod exec {
        use super::*;
        use std::os::raw::c_char;

        fn run(pattern: &str, input: &str) -> bool {
            let buf = emit_pattern(pattern);
            let mut bytes = input.as_bytes().to_vec();
            bytes.push(0);
            type Match = unsafe extern "C" fn(*const c_char) -> bool;
            let f: Match = unsafe { buf.as_fn() };
            unsafe { f(bytes.as_ptr() as *const c_char) }
        }

        #[test]
        fn test_single_byte() {
            assert!(run("a", "a"));
            assert!(!run("a", "b"));
            assert!(!run("a", ""));
        }

        #[test]
        fn test_backtracking_machine() {
            assert!(run("a*a", "aaa"));
            assert!(run("(a|ab)c", "abc"));
            assert!(!run("(a|ab)d", "abc"));
        }

        #[test]
        fn test_charset_machine() {
            assert!(run("[a-cx]", "b"));
            assert!(run("[a-cx]", "x"));
            assert!(!run("[a-cx]", "d"));
            assert!(!run("[a-cx]", ""));
        }

        #[test]
        fn test_stack_balanced_after_backtracking() {
            // Plenty of suspended threads are discarded on the way to a
            // match; the emitted epilogue must still unwind cleanly.
            for _ in 0..4 {
                assert!(run("(a|b)*c", "ababababc"));
            }
        }
    }
}
