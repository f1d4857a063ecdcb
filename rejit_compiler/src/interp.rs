//! Reference interpreter for the linear IR.
//!
//! Executes a program directly with an explicit backtrack stack,
//! mirroring the emitted machine code instruction for instruction:
//! the input is treated as NUL-terminated at its end, `Any` and
//! `Charset` refuse the terminator, and threads are resumed LIFO with
//! their saved cursor. Differential tests run this against the
//! compiled matcher.

use crate::ir::{Inst, Label, Program};
use rustc_hash::FxHashMap;

/// Match `input` against `prog` from position 0.
///
/// The byte at `input.len()` is taken to be the terminating NUL, so an
/// interior `\0` in `input` behaves exactly as it would for the
/// NUL-terminated buffer handed to the compiled matcher.
#[must_use]
pub fn matches(prog: &Program, input: &[u8]) -> bool {
    let marks: FxHashMap<Label, usize> = prog
        .insts
        .iter()
        .enumerate()
        .filter_map(|(pc, inst)| match inst {
            Inst::Mark(l) => Some((*l, pc)),
            _ => None,
        })
        .collect();

    let byte_at = |cursor: usize| -> u8 {
        input.get(cursor).copied().unwrap_or(0)
    };

    // Suspended threads: (resume pc, saved cursor), resumed LIFO.
    let mut stack: Vec<(usize, usize)> = Vec::new();
    let mut pc = 0;
    let mut cursor = 0;

    loop {
        let failed = match prog.insts.get(pc) {
            None => true,
            Some(Inst::Accept) => return true,
            Some(Inst::Mark(_)) => {
                pc += 1;
                false
            }
            Some(Inst::Jump(l)) => {
                pc = marks[l];
                false
            }
            Some(Inst::Split { pri, alt }) => {
                stack.push((marks[alt], cursor));
                pc = marks[pri];
                false
            }
            Some(Inst::SplitOne { alt }) => {
                stack.push((marks[alt], cursor));
                pc += 1;
                false
            }
            Some(Inst::Single(b)) => {
                if byte_at(cursor) == *b {
                    cursor += 1;
                    pc += 1;
                    false
                } else {
                    true
                }
            }
            Some(Inst::Charset(ranges)) => {
                let b = byte_at(cursor);
                if b != 0 && ranges.iter().any(|r| r.contains(b)) {
                    cursor += 1;
                    pc += 1;
                    false
                } else {
                    true
                }
            }
            Some(Inst::Any) => {
                if byte_at(cursor) != 0 {
                    cursor += 1;
                    pc += 1;
                    false
                } else {
                    true
                }
            }
            Some(Inst::Str(id)) => {
                let lit = prog.literal(*id);
                if lit.iter().enumerate().all(|(i, &b)| byte_at(cursor + i) == b) {
                    cursor += lit.len();
                    pc += 1;
                    false
                } else {
                    true
                }
            }
        };

        if failed {
            match stack.pop() {
                Some((resume_pc, saved_cursor)) => {
                    pc = resume_pc;
                    cursor = saved_cursor;
                }
                None => return false,
            }
        }
    }
}
