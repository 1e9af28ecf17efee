//! `bite` — run a Bite source file.

mod formatter;

use bite_runtime::RunOutcome;
use clap::Parser;
use formatter::{enrich_diagnostic, DiagnosticFormatter};
use std::path::PathBuf;
use std::process::ExitCode;

/// Exit code for a lex/parse/analysis failure (BSD `EX_DATAERR`).
const EX_DATAERR: u8 = 65;
/// Exit code for a runtime failure (BSD `EX_SOFTWARE`).
const EX_SOFTWARE: u8 = 70;

#[derive(Parser)]
#[command(name = "bite", about = "Run a Bite source file")]
struct Args {
    /// Path to the `.bite` source file to run
    path: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let source = match std::fs::read_to_string(&args.path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("bite: cannot read {}: {}", args.path.display(), e);
            return ExitCode::from(EX_SOFTWARE);
        }
    };

    let formatter = DiagnosticFormatter::auto();

    match bite_runtime::run_source(&source) {
        RunOutcome::Completed(value) => {
            println!("{}", value);
            ExitCode::SUCCESS
        }
        RunOutcome::LexError(diags) | RunOutcome::ParseError(diags) | RunOutcome::AnalysisError(diags) => {
            for diag in diags {
                formatter.emit(&enrich_diagnostic(diag, &source));
            }
            ExitCode::from(EX_DATAERR)
        }
        RunOutcome::RuntimeError(err) => {
            let diag = bite_runtime::Diagnostic::error(err.error.to_string(), err.span);
            formatter.emit(&enrich_diagnostic(diag, &source));
            ExitCode::from(EX_SOFTWARE)
        }
    }
}
