//! Pattern front end and middle end for the rejit engine.
//!
//! - Recursive-descent parser lowering regex syntax to a linear,
//!   labeled instruction stream ([`parser`])
//! - The IR itself, its invariants, validation and diagnostic dump
//!   ([`ir`])
//! - Peephole optimizer: split/jump fusion and literal-run fusion
//!   ([`opt`])
//! - A reference interpreter used as the oracle in differential tests
//!   ([`interp`])
//!
//! The back end that lowers a [`Program`] to x86-64 machine code lives
//! in the `rejit_jit` crate.

pub mod cursor;
pub mod error;
pub mod interp;
pub mod ir;
pub mod opt;
pub mod parser;

pub use error::{IrError, ParseError};
pub use ir::{ByteRange, Inst, Label, Program, RangeList, StrId};
pub use opt::{Optimizer, Pass, SingleFusion, SplitJumpFusion};
pub use parser::{parse, parse_bytes};
