//! Linear IR for compiled patterns.
//!
//! The parser lowers pattern syntax into a flat, ordered sequence of
//! tagged VM instructions plus a side pool of string literals. The
//! optimizer rewrites the sequence in place; the code generator lowers
//! it to machine code without further transformation.
//!
//! # Invariants
//! - Every label referenced by `Split`/`SplitOne`/`Jump` is defined by
//!   exactly one `Mark` in the stream.
//! - The stream ends with exactly one `Accept`, and `Accept` appears
//!   nowhere else.
//! - `Charset` ranges satisfy `lo <= hi`, are sorted by `lo`, and are
//!   pairwise disjoint.
//! - String-pool indices referenced by `Str` are in bounds; the pool is
//!   append-only, so indices stay stable for the program's lifetime.
//!
//! [`Program::validate`] checks all of the above and is run under
//! `debug_assertions` by the compilation entry points.

use crate::error::IrError;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use std::fmt;

// =============================================================================
// Labels and pool indices
// =============================================================================

/// An integer tag marking a position in the instruction stream.
///
/// Labels are allocated from a monotone counter owned by the parser and
/// are unique within a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub(crate) u32);

impl Label {
    /// Create a label with an explicit id (tests and builders).
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Label(id)
    }

    /// The raw label id.
    #[inline]
    #[must_use]
    pub const fn id(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Index of a literal in the string pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StrId(pub(crate) u32);

impl StrId {
    /// The raw pool index.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Character ranges
// =============================================================================

/// An inclusive byte range inside a character set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub lo: u8,
    pub hi: u8,
}

impl ByteRange {
    #[inline]
    #[must_use]
    pub const fn new(lo: u8, hi: u8) -> Self {
        ByteRange { lo, hi }
    }

    /// A single-byte range (`lo == hi`).
    #[inline]
    #[must_use]
    pub const fn single(b: u8) -> Self {
        ByteRange { lo: b, hi: b }
    }

    /// Check whether `b` lies in the range.
    #[inline]
    #[must_use]
    pub const fn contains(self, b: u8) -> bool {
        self.lo <= b && b <= self.hi
    }
}

/// Range list for a character set. Most classes hold only a few ranges,
/// so they live inline in the instruction.
pub type RangeList = SmallVec<[ByteRange; 4]>;

// =============================================================================
// Instructions
// =============================================================================

/// One VM instruction of the backtracking matcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inst {
    /// Continue at `pri`; push a backtrack thread resuming at `alt` with
    /// the current input cursor.
    Split { pri: Label, alt: Label },
    /// Push a backtrack thread resuming at `alt`; fall through.
    SplitOne { alt: Label },
    /// Match one exact byte and advance, or fail the thread.
    Single(u8),
    /// Match one byte against a sorted, disjoint range list and advance,
    /// or fail the thread. Never consumes the terminating NUL.
    Charset(RangeList),
    /// Match any byte except the terminating NUL and advance.
    Any,
    /// Match a fixed literal from the string pool and advance by its
    /// length, or fail the thread.
    Str(StrId),
    /// Transfer control to a label.
    Jump(Label),
    /// Define a label at the current stream position.
    Mark(Label),
    /// Signal overall match success.
    Accept,
}

// =============================================================================
// Program
// =============================================================================

/// An immutable-after-compilation pair of instruction stream and string
/// pool, produced by the parser and rewritten in place by the optimizer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    /// The flat, ordered instruction stream.
    pub insts: Vec<Inst>,
    /// Append-only store of literal byte sequences referenced by `Str`.
    pub pool: Vec<Vec<u8>>,
}

impl Program {
    /// Create an empty program.
    #[must_use]
    pub fn new() -> Self {
        Program::default()
    }

    /// Append a literal to the string pool and return its index.
    pub fn add_literal(&mut self, bytes: Vec<u8>) -> StrId {
        let id = StrId(self.pool.len() as u32);
        self.pool.push(bytes);
        id
    }

    /// Look up a pool literal.
    ///
    /// # Panics
    /// Panics if the id is out of bounds; validated programs never are.
    #[inline]
    #[must_use]
    pub fn literal(&self, id: StrId) -> &[u8] {
        &self.pool[id.index()]
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Check the structural invariants of the instruction stream.
    ///
    /// Returns the first violation found. Compilation entry points run
    /// this under `debug_assertions`; the test suite runs it over every
    /// parsed and optimized program.
    pub fn validate(&self) -> Result<(), IrError> {
        let mut defined = FxHashSet::default();
        for inst in &self.insts {
            if let Inst::Mark(l) = *inst {
                if !defined.insert(l) {
                    return Err(IrError::DuplicateLabel(l));
                }
            }
        }

        match self.insts.last() {
            Some(Inst::Accept) => {}
            _ => return Err(IrError::MissingAccept),
        }

        for (i, inst) in self.insts.iter().enumerate() {
            match inst {
                Inst::Accept if i + 1 != self.insts.len() => {
                    return Err(IrError::EarlyAccept);
                }
                Inst::Split { pri, alt } => {
                    for l in [*pri, *alt] {
                        if !defined.contains(&l) {
                            return Err(IrError::UndefinedLabel(l));
                        }
                    }
                }
                Inst::SplitOne { alt } => {
                    if !defined.contains(alt) {
                        return Err(IrError::UndefinedLabel(*alt));
                    }
                }
                Inst::Jump(l) => {
                    if !defined.contains(l) {
                        return Err(IrError::UndefinedLabel(*l));
                    }
                }
                Inst::Charset(ranges) => {
                    if ranges.is_empty() {
                        return Err(IrError::EmptyCharset);
                    }
                    for r in ranges {
                        if r.lo > r.hi {
                            return Err(IrError::InvalidRange { lo: r.lo, hi: r.hi });
                        }
                    }
                    for w in ranges.windows(2) {
                        // Sorted and disjoint: the next range must start
                        // strictly after the previous one ends.
                        if w[1].lo <= w[0].hi {
                            return Err(IrError::UnorderedRanges);
                        }
                    }
                }
                Inst::Str(id) => {
                    if id.index() >= self.pool.len() {
                        return Err(IrError::BadLiteral(*id));
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    // =========================================================================
    // Dump
    // =========================================================================

    /// Render a human-readable listing of the instruction stream.
    ///
    /// Labels sit unindented on their own lines; instructions are
    /// indented two spaces with their operands spelled out.
    #[must_use]
    pub fn dump(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        out.push_str("--------------------------\n");
        for inst in &self.insts {
            match inst {
                Inst::Split { pri, alt } => {
                    let _ = writeln!(out, "  SPLIT {pri} {alt}");
                }
                Inst::SplitOne { alt } => {
                    let _ = writeln!(out, "  SPLIT_ONE {alt}");
                }
                Inst::Single(b) => {
                    let _ = writeln!(out, "  SINGLE {}", DumpByte(*b));
                }
                Inst::Charset(ranges) => {
                    out.push_str("  CHARSET ");
                    for r in ranges {
                        if r.lo == r.hi {
                            let _ = write!(out, "{}", DumpByte(r.lo));
                        } else {
                            let _ = write!(out, "{}-{}", DumpByte(r.lo), DumpByte(r.hi));
                        }
                    }
                    out.push('\n');
                }
                Inst::Any => out.push_str("  ANY\n"),
                Inst::Str(id) => {
                    out.push_str("  STRING ");
                    for &b in self.literal(*id) {
                        let _ = write!(out, "{}", DumpByte(b));
                    }
                    out.push('\n');
                }
                Inst::Jump(l) => {
                    let _ = writeln!(out, "  JUMP {l}");
                }
                Inst::Mark(l) => {
                    let _ = writeln!(out, "{l}:");
                }
                Inst::Accept => out.push_str("  ACCEPT\n"),
            }
        }
        out
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dump())
    }
}

/// Printable-ASCII bytes render as themselves, everything else as `\x##`.
struct DumpByte(u8);

impl fmt::Display for DumpByte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_ascii_graphic() || self.0 == b' ' {
            write!(f, "{}", self.0 as char)
        } else {
            write!(f, "\\x{:02x}", self.0)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
