//! rejit: compile a regex to native code and run it.

mod args;

use args::{Args, Mode, USAGE};
use rejit_jit::{CompileOptions, Regex};
use std::io::{Read, Write};
use std::process::ExitCode;

/// The pattern matched the input.
const EXIT_MATCH: u8 = 0;
/// The pattern did not match.
const EXIT_NO_MATCH: u8 = 1;
/// Bad command line.
const EXIT_USAGE_ERROR: u8 = 2;
/// The pattern failed to compile.
const EXIT_COMPILE_ERROR: u8 = 65;

fn main() -> ExitCode {
    env_logger::init();

    let mode = match args::parse_args(std::env::args().skip(1)) {
        Ok(mode) => mode,
        Err(err) => {
            eprintln!("rejit: {err}");
            eprint!("{USAGE}");
            return ExitCode::from(EXIT_USAGE_ERROR);
        }
    };

    match mode {
        Mode::PrintHelp => {
            print!("{USAGE}");
            ExitCode::from(EXIT_MATCH)
        }
        Mode::PrintVersion => {
            println!("rejit {}", env!("CARGO_PKG_VERSION"));
            ExitCode::from(EXIT_MATCH)
        }
        Mode::Run(args) => run(&args),
    }
}

fn run(args: &Args) -> ExitCode {
    let options = if args.no_opt {
        CompileOptions::unoptimized()
    } else {
        CompileOptions::default()
    };

    let re = match Regex::with_options(&args.pattern, options) {
        Ok(re) => re,
        Err(err) => {
            eprintln!("rejit: {err}");
            return ExitCode::from(EXIT_COMPILE_ERROR);
        }
    };

    if args.dump_ir {
        print!("{}", re.dump());
    }

    if args.emit_code {
        let mut stdout = std::io::stdout().lock();
        if let Err(err) = stdout.write_all(re.code_bytes()).and_then(|()| stdout.flush()) {
            eprintln!("rejit: {err}");
            return ExitCode::from(EXIT_COMPILE_ERROR);
        }
    }

    let input = match &args.input {
        Some(input) => input.clone(),
        None => {
            let mut buf = String::new();
            if let Err(err) = std::io::stdin().read_to_string(&mut buf) {
                eprintln!("rejit: {err}");
                return ExitCode::from(EXIT_USAGE_ERROR);
            }
            // A trailing newline is shell plumbing, not input.
            if buf.ends_with('\n') {
                buf.pop();
            }
            buf
        }
    };

    if re.is_match(&input) {
        ExitCode::from(EXIT_MATCH)
    } else {
        ExitCode::from(EXIT_NO_MATCH)
    }
}
