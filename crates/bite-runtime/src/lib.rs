//! Bite language runtime — lexer, parser, semantic analyzer, bytecode
//! compiler, and stack-based VM with a mark-sweep GC.
//!
//! [`run_source`] wires the whole pipeline together end to end. Embedders
//! who need finer control (inspecting diagnostics before running, reusing
//! an `Interner` across scripts, registering custom natives) should drive
//! the stages directly instead — every stage is its own public module.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod analyzer;
pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod diagnostic;
pub mod gc;
pub mod interner;
pub mod lexer;
pub mod native;
pub mod object;
pub mod parser;
pub mod span;
pub mod token;
pub mod value;
pub mod vm;

pub use analyzer::{AnalysisResult, Analyzer};
pub use ast::Program;
pub use bytecode::{disassemble, Bytecode, Opcode};
pub use compiler::compile;
pub use diagnostic::{sort_diagnostics, Diagnostic, DiagnosticLevel, RelatedLocation, DIAG_VERSION};
pub use gc::Gc;
pub use interner::{Interner, Symbol};
pub use lexer::Lexer;
pub use object::{Function, Heap};
pub use parser::Parser;
pub use span::Span;
pub use value::{RuntimeError, Value};
pub use vm::{Vm, VmError};

/// Outcome of [`run_source`]: either the program ran to completion, or it
/// failed at a specific named stage with the diagnostics/error that stage
/// produced.
pub enum RunOutcome {
    Completed(Value),
    LexError(Vec<Diagnostic>),
    ParseError(Vec<Diagnostic>),
    AnalysisError(Vec<Diagnostic>),
    RuntimeError(VmError),
}

/// Run a complete Bite source string: lex, parse, analyze, compile, then
/// execute on a fresh [`Vm`] with the standard natives registered.
///
/// Each stage that can fail stops the pipeline there rather than pressing
/// on with partial results — lexer/parser/analyzer diagnostics accumulate
/// independently of each other (spec §7), but a later stage never runs
/// over output from a failed earlier one.
pub fn run_source(source: &str) -> RunOutcome {
    let mut interner = Interner::new();

    let lexer = Lexer::new(source, &mut interner);
    let (tokens, lex_diagnostics) = lexer.tokenize();
    if lex_diagnostics.iter().any(|d| d.level == DiagnosticLevel::Error) {
        return RunOutcome::LexError(lex_diagnostics);
    }

    let parser = Parser::new(tokens, &interner);
    let (program, parse_diagnostics) = parser.parse();
    if parse_diagnostics.iter().any(|d| d.level == DiagnosticLevel::Error) {
        return RunOutcome::ParseError(parse_diagnostics);
    }

    let analyzer = Analyzer::new(&interner);
    let analysis = analyzer.analyze(&program);
    if analysis.has_errors() {
        return RunOutcome::AnalysisError(analysis.diagnostics);
    }

    let mut heap = Heap::new();
    let function = compile(&program, &analysis, &mut heap, &mut interner);

    let mut vm = Vm::new(heap, &mut interner);
    native::register_stdlib(&mut vm);
    match vm.run(function) {
        Ok(value) => RunOutcome::Completed(value),
        Err(err) => RunOutcome::RuntimeError(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_a_trivial_expression() {
        let RunOutcome::Completed(value) = run_source("1 + 2") else {
            panic!("expected the script to run to completion");
        };
        assert_eq!(value, Value::Int(3));
    }

    #[test]
    fn reports_lexer_errors_without_running() {
        match run_source("\"unterminated") {
            RunOutcome::LexError(diags) => assert!(!diags.is_empty()),
            _ => panic!("expected a lex error"),
        }
    }

    #[test]
    fn for_loop_iterates_an_exclusive_range() {
        let RunOutcome::Completed(value) = run_source(
            r#"
            let s = "";
            for i in 0..3 {
                s = s + "x";
            }
            s
            "#,
        ) else {
            panic!("expected the script to run to completion");
        };
        let Value::Str(s) = value else {
            panic!("expected a string result");
        };
        assert_eq!(&*s, "xxx");
    }

    #[test]
    fn inclusive_range_includes_its_end() {
        let RunOutcome::Completed(value) = run_source(
            r#"
            let count = 0;
            for i in 1...3 {
                count = count + i;
            }
            count
            "#,
        ) else {
            panic!("expected the script to run to completion");
        };
        assert_eq!(value, Value::Int(6));
    }

    #[test]
    fn arithmetic_follows_precedence() {
        let RunOutcome::Completed(value) = run_source("let x = 1 + 2 * 3; x") else {
            panic!("expected the script to run to completion");
        };
        assert_eq!(value, Value::Int(7));
    }

    #[test]
    fn closures_share_a_captured_local() {
        let RunOutcome::Completed(value) = run_source(
            "fun mk() { let i = 0; fun () { i = i + 1; i } } let c = mk(); c(); c(); c()",
        ) else {
            panic!("expected the script to run to completion");
        };
        assert_eq!(value, Value::Int(3));
    }

    #[test]
    fn instance_method_mutates_a_field_across_calls() {
        // spec's own grammar (`NAME (= expr)? ;` for a field) omits `let`
        // here, unlike the scenario prose's `let n = 0;`.
        let RunOutcome::Completed(value) = run_source(
            "class Counter { n = 0; bump() { n = n + 1; n } } let k = Counter(); k.bump(); k.bump()",
        ) else {
            panic!("expected the script to run to completion");
        };
        assert_eq!(value, Value::Int(2));
    }

    #[test]
    fn loop_break_carries_a_value() {
        let RunOutcome::Completed(value) = run_source("loop { break 42 }") else {
            panic!("expected the script to run to completion");
        };
        assert_eq!(value, Value::Int(42));
    }

    #[test]
    fn if_else_picks_the_true_branch() {
        let RunOutcome::Completed(value) = run_source(r#"if 1 < 2 { "yes" } else { "no" }"#) else {
            panic!("expected the script to run to completion");
        };
        let Value::Str(s) = value else {
            panic!("expected a string result");
        };
        assert_eq!(&*s, "yes");
    }

    #[test]
    fn override_method_calls_super() {
        let RunOutcome::Completed(value) = run_source(
            "class A { m() { 1 } } class B : A { override m() { super.m() + 1 } } B().m()",
        ) else {
            panic!("expected the script to run to completion");
        };
        assert_eq!(value, Value::Int(2));
    }
}
