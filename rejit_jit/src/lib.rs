//! x86-64 JIT back end for the rejit engine.
//!
//! Compiles a pattern to native machine code at runtime and runs it
//! against NUL-terminated byte strings:
//!
//! - GPR definitions and host calling-convention selection
//!   ([`registers`])
//! - Page-aligned executable memory with the W^X write-then-finalize
//!   protocol ([`memory`])
//! - A minimal label-patching x64 assembler ([`asm`])
//! - The IR-to-machine-code lowering ([`codegen`])
//!
//! ```no_run
//! use rejit_jit::Regex;
//!
//! let re = Regex::new("(a|b)*abb").unwrap();
//! assert!(re.is_match("ababb"));
//! ```
//!
//! The matcher tests from position 0 (match-from-start); wrap a pattern
//! in `.*` to emulate searching. Matching is first-match backtracking,
//! not leftmost-longest.

pub mod asm;
pub mod codegen;
pub mod memory;
pub mod registers;

use log::debug;
use rejit_compiler::Optimizer;
use std::os::raw::c_char;
use thiserror::Error as ThisError;

pub use memory::ExecBuf;
pub use rejit_compiler::{IrError, ParseError, Program, parse};

/// Any failure on the way from pattern source to executable code.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The pattern does not parse.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The instruction stream violates an IR invariant.
    #[error(transparent)]
    Ir(#[from] IrError),

    /// Mapping executable memory failed.
    #[error("failed to allocate executable memory")]
    CodeAlloc(#[source] std::io::Error),

    /// Sealing the mapping read+execute failed.
    #[error("failed to make code memory executable")]
    CodeProtect(#[source] std::io::Error),

    /// A branch displacement exceeds the near-jump range.
    #[error("jump target out of 32-bit range")]
    JumpOutOfRange,

    /// An emitted branch references a label that was never bound.
    #[error("code label {0} never bound")]
    UnboundLabel(u32),
}

/// Compilation knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    /// Run the peephole passes before code generation.
    pub optimize: bool,
}

impl CompileOptions {
    /// Skip the optimizer; used by differential tests and `--no-opt`.
    #[must_use]
    pub const fn unoptimized() -> Self {
        CompileOptions { optimize: false }
    }
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions { optimize: true }
    }
}

/// A pattern compiled to native x86-64 code.
///
/// The IR is kept alongside the executable buffer so diagnostics
/// ([`Regex::dump`]) stay available after compilation; the emitted code
/// holds no references into it. Dropping the `Regex` unmaps the code.
#[derive(Debug)]
pub struct Regex {
    program: Program,
    code: ExecBuf,
}

impl Regex {
    /// Compile a pattern with default options.
    pub fn new(pattern: &str) -> Result<Regex, Error> {
        Regex::with_options(pattern, CompileOptions::default())
    }

    /// Compile a pattern: parse, validate (debug builds), optionally
    /// optimize, emit.
    pub fn with_options(pattern: &str, options: CompileOptions) -> Result<Regex, Error> {
        let mut program = rejit_compiler::parse(pattern)?;
        if cfg!(debug_assertions) {
            program.validate()?;
        }
        debug!(
            "parsed {:?}: {} instruction(s)",
            pattern,
            program.insts.len()
        );

        if options.optimize {
            Optimizer::new().run(&mut program);
            if cfg!(debug_assertions) {
                program.validate()?;
            }
            debug!("optimized down to {} instruction(s)", program.insts.len());
        }

        let code = codegen::emit(&program)?;
        debug!("emitted {} byte(s) of machine code", code.len());

        Ok(Regex { program, code })
    }

    /// Test whether the pattern matches `input` starting at position 0.
    #[must_use]
    pub fn is_match(&self, input: &str) -> bool {
        self.is_match_bytes(input.as_bytes())
    }

    /// Byte-slice variant of [`Regex::is_match`].
    ///
    /// The input is copied into a NUL-terminated scratch buffer with
    /// eight bytes of zero padding, since bulk literal compares read up
    /// to a qword at the cursor.
    #[must_use]
    pub fn is_match_bytes(&self, input: &[u8]) -> bool {
        let mut buf = Vec::with_capacity(input.len() + 8);
        buf.extend_from_slice(input);
        buf.resize(input.len() + 8, 0);
        unsafe { self.matches_ptr(buf.as_ptr() as *const c_char) }
    }

    /// Invoke the compiled matcher on a raw NUL-terminated buffer.
    ///
    /// # Safety
    /// `input` must point to a NUL-terminated byte sequence that stays
    /// readable for up to seven bytes past the terminator (bulk literal
    /// compares load whole qwords). Use [`Regex::is_match_bytes`] for a
    /// buffer the engine pads itself.
    #[must_use]
    pub unsafe fn matches_ptr(&self, input: *const c_char) -> bool {
        type Match = unsafe extern "C" fn(*const c_char) -> bool;
        let f: Match = unsafe { self.code.as_fn() };
        unsafe { f(input) }
    }

    /// The compiled program's IR.
    #[must_use]
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Human-readable IR listing.
    #[must_use]
    pub fn dump(&self) -> String {
        self.program.dump()
    }

    /// The raw emitted machine code.
    #[must_use]
    pub fn code_bytes(&self) -> &[u8] {
        self.code.as_slice()
    }
}

// =============================================================================
// Tests
// =============================================================================
