//! Command-line argument parser for the rejit driver.
//!
//! Hand-rolled for zero-overhead startup; the surface is small enough
//! that an argument-parsing dependency would outweigh the driver.

use std::fmt;

/// Usage text printed for `-h`/`--help` and on usage errors.
pub const USAGE: &str = "\
usage: rejit [options] <pattern> [input]

Compile <pattern> to native code and match it against [input] (or
standard input) from position 0. Exits 0 on match, 1 on no match.

options:
  --dump-ir     print the optimized instruction listing to stdout
  --no-opt      skip the peephole optimizer
  --emit-code   write the raw emitted machine bytes to stdout
  -h, --help    print this help
  -V, --version print the version
";

/// What the driver should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Compile and match.
    Run(Args),
    /// Print usage and exit successfully.
    PrintHelp,
    /// Print the version and exit successfully.
    PrintVersion,
}

/// Parsed driver arguments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Args {
    /// The pattern to compile.
    pub pattern: String,
    /// Input to match; standard input when absent.
    pub input: Option<String>,
    /// Print the instruction listing.
    pub dump_ir: bool,
    /// Skip the optimizer passes.
    pub no_opt: bool,
    /// Write raw machine code bytes to stdout.
    pub emit_code: bool,
}

/// A bad command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageError(pub String);

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parse the argument list (program name already stripped).
pub fn parse_args<I>(argv: I) -> Result<Mode, UsageError>
where
    I: IntoIterator<Item = String>,
{
    let mut args = Args::default();
    let mut positionals: Vec<String> = Vec::new();

    for arg in argv {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Mode::PrintHelp),
            "-V" | "--version" => return Ok(Mode::PrintVersion),
            "--dump-ir" => args.dump_ir = true,
            "--no-opt" => args.no_opt = true,
            "--emit-code" => args.emit_code = true,
            _ if arg.starts_with('-') && arg.len() > 1 => {
                return Err(UsageError(format!("unknown option: {arg}")));
            }
            _ => positionals.push(arg),
        }
    }

    let mut positionals = positionals.into_iter();
    args.pattern = positionals
        .next()
        .ok_or_else(|| UsageError("missing <pattern>".to_string()))?;
    args.input = positionals.next();

    if let Some(extra) = positionals.next() {
        return Err(UsageError(format!("unexpected argument: {extra}")));
    }

    Ok(Mode::Run(args))
}
