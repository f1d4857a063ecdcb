//! Compile-time error types.
//!
//! Parse errors carry the zero-based byte offset of the offending
//! construct so the caller can point at the pattern source. IR errors
//! are produced by [`Program::validate`](crate::ir::Program::validate)
//! and indicate a broken invariant in the instruction stream.

use crate::ir::{Label, StrId};
use thiserror::Error;

/// A syntax error in the pattern source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    /// A `\` with no byte after it.
    #[error("escape at end of pattern (byte {offset})")]
    DanglingEscape { offset: usize },

    /// A `(` whose group never sees the matching `)`.
    #[error("unterminated group opened at byte {offset}")]
    UnterminatedGroup { offset: usize },

    /// A `[` whose class never sees the closing `]`.
    #[error("unterminated character class opened at byte {offset}")]
    UnterminatedClass { offset: usize },

    /// `[]`, which matches nothing representable.
    #[error("empty character class at byte {offset}")]
    EmptyClass { offset: usize },

    /// A class range whose upper bound is not strictly above its lower bound.
    #[error("character range upper bound not above lower bound (byte {offset})")]
    InvertedRange { offset: usize },

    /// Input left over after the pattern was consumed, e.g. a stray `)`
    /// or a quantifier with nothing to repeat.
    #[error("unexpected trailing input at byte {offset}")]
    TrailingInput { offset: usize },
}

impl ParseError {
    /// The zero-based byte offset into the pattern source.
    #[inline]
    #[must_use]
    pub fn offset(&self) -> usize {
        match *self {
            ParseError::DanglingEscape { offset }
            | ParseError::UnterminatedGroup { offset }
            | ParseError::UnterminatedClass { offset }
            | ParseError::EmptyClass { offset }
            | ParseError::InvertedRange { offset }
            | ParseError::TrailingInput { offset } => offset,
        }
    }
}

/// A structural violation in an instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IrError {
    #[error("label {0} defined more than once")]
    DuplicateLabel(Label),

    #[error("label {0} referenced but never defined")]
    UndefinedLabel(Label),

    #[error("program does not end with ACCEPT")]
    MissingAccept,

    #[error("ACCEPT before the end of the program")]
    EarlyAccept,

    #[error("empty character set")]
    EmptyCharset,

    #[error("character ranges not sorted and disjoint")]
    UnorderedRanges,

    #[error("invalid character range {lo:#04x}-{hi:#04x}")]
    InvalidRange { lo: u8, hi: u8 },

    #[error("string literal index {0} out of bounds")]
    BadLiteral(StrId),
}
