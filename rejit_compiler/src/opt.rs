//! Peephole optimizer over the linear IR.
//!
//! Two passes, run in a fixed order:
//!
//! 1. [`SplitJumpFusion`] — a two-way `Split` whose primary target is
//!    the label defined immediately after it becomes a one-way
//!    `SplitOne` with a fall-through primary branch.
//! 2. [`SingleFusion`] — maximal runs of consecutive `Single` matches
//!    collapse into one bulk `Str` match against a pooled literal.
//!
//! Both passes preserve every label definition, keep label references
//! one-to-one, and never move an instruction across a `Mark` or a
//! branch, so the program stays valid for the code generator.

use crate::ir::{Inst, Program};
use log::debug;

/// A single rewrite pass over a program.
pub trait Pass {
    /// Pass name for diagnostics.
    fn name(&self) -> &'static str;

    /// Rewrite the program in place, returning the number of rewrites.
    fn run(&self, prog: &mut Program) -> usize;
}

// =============================================================================
// split_jump_fusion
// =============================================================================

/// Turns `Split { pri, alt }` immediately followed by `Mark(pri)` into
/// `SplitOne { alt }`.
///
/// The quantifier and alternation lowering shapes place the primary
/// branch target right after the split, so the split's unconditional
/// jump to it is redundant; the `Mark` itself is preserved because other
/// branches may still target it.
pub struct SplitJumpFusion;

impl Pass for SplitJumpFusion {
    fn name(&self) -> &'static str {
        "split_jump_fusion"
    }

    fn run(&self, prog: &mut Program) -> usize {
        let mut fused = 0;
        for i in 0..prog.insts.len().saturating_sub(1) {
            let Inst::Split { pri, alt } = prog.insts[i] else {
                continue;
            };
            if prog.insts[i + 1] == Inst::Mark(pri) {
                prog.insts[i] = Inst::SplitOne { alt };
                fused += 1;
            }
        }
        fused
    }
}

// =============================================================================
// single_fusion
// =============================================================================

/// Collapses runs of two or more consecutive `Single` instructions into
/// one `Str` referencing the concatenated bytes in the string pool.
/// Lone `Single`s are left alone.
pub struct SingleFusion;

impl Pass for SingleFusion {
    fn name(&self) -> &'static str {
        "single_fusion"
    }

    fn run(&self, prog: &mut Program) -> usize {
        let insts = std::mem::take(&mut prog.insts);
        let mut out = Vec::with_capacity(insts.len());
        let mut fused = 0;

        let mut i = 0;
        while i < insts.len() {
            let run_end = match insts[i] {
                Inst::Single(_) => insts[i..]
                    .iter()
                    .position(|inst| !matches!(inst, Inst::Single(_)))
                    .map_or(insts.len(), |n| i + n),
                _ => i,
            };

            if run_end - i >= 2 {
                let bytes: Vec<u8> = insts[i..run_end]
                    .iter()
                    .map(|inst| match *inst {
                        Inst::Single(b) => b,
                        _ => unreachable!("run contains only Single"),
                    })
                    .collect();
                out.push(Inst::Str(prog.add_literal(bytes)));
                fused += 1;
                i = run_end;
            } else {
                out.push(insts[i].clone());
                i += 1;
            }
        }

        prog.insts = out;
        fused
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Runs the pass list in order, once each.
pub struct Optimizer {
    passes: Vec<Box<dyn Pass>>,
}

impl Optimizer {
    /// The default pipeline: fusion of split jumps, then literal runs.
    #[must_use]
    pub fn new() -> Self {
        Optimizer {
            passes: vec![Box::new(SplitJumpFusion), Box::new(SingleFusion)],
        }
    }

    /// Apply every pass to the program in place.
    pub fn run(&self, prog: &mut Program) {
        for pass in &self.passes {
            let rewrites = pass.run(prog);
            debug!("{}: {} rewrite(s)", pass.name(), rewrites);
        }
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
