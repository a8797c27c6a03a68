//! Purpose: `keel` CLI entry point.
//! Role: Parse the invocation, run it through the lifecycle, drain the
//! response stream, report failures.
//! Invariants: stdout carries only the response stream; diagnostics and help
//! go to stderr.
//! Invariants: Exit code 0 on success, 1 on any error.

use std::io;

use clap::error::ErrorKind as ClapErrorKind;

use keel::cli;
use keel::commands;
use keel::core::error::{Error, ErrorKind, error_causes, error_message, is_client_error};
use keel::lifecycle;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let root = commands::root();

    let matches = match cli::build(&root).try_get_matches() {
        Ok(matches) => matches,
        Err(err) => {
            // clap already renders help, version, and usage-bearing parse
            // errors; only the exit code is ours to pick. An explicit help
            // request succeeds, everything else is a usage failure.
            let _ = err.print();
            return match err.kind() {
                ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => 0,
                _ => 1,
            };
        }
    };

    let mut req = match cli::request_from_matches(&root, &matches) {
        Ok(req) => req,
        Err(err) => {
            print_error(&err);
            return 1;
        }
    };

    match lifecycle::run(&mut req, &root) {
        Ok(resp) => {
            let mut reader = resp.into_reader();
            match io::copy(&mut reader, &mut io::stdout()) {
                Ok(_) => 0,
                Err(err) => {
                    print_error(
                        &Error::new(ErrorKind::Io)
                            .with_message("failed to write response to stdout")
                            .with_source(err),
                    );
                    1
                }
            }
        }
        Err(err) => {
            print_error(&err);
            if is_client_error(&err) {
                eprintln!();
                eprint!("{}", cli::render_short_help(&root, req.path()));
            }
            1
        }
    }
}

fn print_error(err: &Error) {
    eprintln!("Error: {}", error_message(err));
    if let Some(hint) = err.hint() {
        eprintln!("  hint: {hint}");
    }
    for cause in error_causes(err) {
        eprintln!("  caused by: {cause}");
    }
}
