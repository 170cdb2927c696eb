//! Public interface for running pyrite code.

use crate::ast::Module;
use crate::diag::{DiagKind, Diagnostic, Diagnostics};
use crate::eval::TreeEvaluator;
use crate::exc::{ExcRaise, RunError};
use crate::intern::Interner;
use crate::io::{CollectStringPrint, PrintWriter};
use crate::parse::parse_module;
use crate::print::print_module;
use crate::sema;
use crate::tracer::{EvalTracer, NoopTracer};
use crate::value::register_globals;

/// Primary interface for running pyrite code.
///
/// `Runner::new` lexes, parses, and analyzes the source; `run` evaluates
/// the module top level and then `main()` when one is defined.
///
/// # Example
/// ```
/// use pyrite::Runner;
///
/// let runner = Runner::new("print(1 + 2)".to_owned(), "demo.py").unwrap();
/// let output = runner.run_collect().unwrap();
/// assert_eq!(output, "3\n");
/// ```
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Runner {
    source: String,
    path: String,
    interner: Interner,
    module: Module,
}

impl Runner {
    /// Parses and analyzes the given source.
    ///
    /// Lex, parse, and sema diagnostics all stop execution before
    /// evaluation; they are returned together, one per line.
    pub fn new(source: String, path: &str) -> Result<Self, Diagnostics> {
        register_globals();
        let mut interner = Interner::new();
        let (mut module, diagnostics) = parse_module(&source, &mut interner);
        if !diagnostics.is_empty() {
            return Err(Diagnostics::new(path, diagnostics));
        }
        let sema_diagnostics = sema::analyze(&mut module, &mut interner);
        if !sema_diagnostics.is_empty() {
            return Err(Diagnostics::new(path, sema_diagnostics));
        }
        Ok(Self {
            source,
            path: path.to_owned(),
            interner,
            module,
        })
    }

    /// Runs the full front end and returns every diagnostic it produced,
    /// without constructing a runner. This is what `--sema-only` uses.
    pub fn check(source: &str, path: &str) -> Diagnostics {
        register_globals();
        let mut interner = Interner::new();
        let (mut module, mut diagnostics) = parse_module(source, &mut interner);
        diagnostics.extend(sema::analyze(&mut module, &mut interner));
        Diagnostics::new(path, diagnostics)
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn interner(&self) -> &Interner {
        &self.interner
    }

    /// Renders the analyzed AST, for `--dump-ast`.
    pub fn dump_ast(&self) -> String {
        print_module(&self.module, &self.interner)
    }

    /// Evaluates the module, routing `print` output through `writer`.
    pub fn run(&self, writer: &mut impl PrintWriter, tracer: &mut impl EvalTracer) -> Result<(), Diagnostics> {
        let mut evaluator = TreeEvaluator::new(&self.module, &self.interner, writer, tracer);
        let mut outcome = evaluator.run_module();
        if outcome.is_ok() {
            if let Some(main) = self.module.main {
                outcome = evaluator.run_main(main);
            }
        }
        match outcome {
            Ok(()) => Ok(()),
            Err(RunError::Exc(raise)) => Err(Diagnostics::new(&self.path, vec![self.exception_diagnostic(*raise)])),
            Err(RunError::Fatal(message)) => {
                // Internal invariant violation: report with the collected
                // stack trace.
                let mut text = message;
                for frame in evaluator.traces.iter().rev() {
                    let name = self.interner.get(frame.function);
                    text.push_str(&format!("; in {name} at {}", frame.span));
                }
                let span = evaluator.traces.last().map(|f| f.span).unwrap_or_default();
                Err(Diagnostics::new(
                    &self.path,
                    vec![Diagnostic::new(DiagKind::RuntimeError, text, span)],
                ))
            }
        }
    }

    /// Runs with a collecting writer and returns captured stdout.
    pub fn run_collect(&self) -> Result<String, Diagnostics> {
        let mut writer = CollectStringPrint::new();
        let mut tracer = NoopTracer;
        self.run(&mut writer, &mut tracer)?;
        Ok(writer.into_output())
    }

    fn exception_diagnostic(&self, raise: ExcRaise) -> Diagnostic {
        let kind = raise.exc.kind.diag_kind();
        // Kinds with their own diagnostic category keep a bare message;
        // everything else surfaces as RuntimeError prefixed with the
        // exception name.
        let direct = kind.to_string() == raise.exc.kind.to_string();
        let message = match (&raise.exc.message, direct) {
            (Some(m), true) => m.clone(),
            (None, true) => "unhandled exception".to_owned(),
            (Some(m), false) => format!("{}: {m}", raise.exc.kind),
            (None, false) => raise.exc.kind.to_string(),
        };
        Diagnostic::new(kind, message, raise.span)
    }

    /// Serializes the analyzed module to a compact binary format.
    pub fn dump(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Restores a runner serialized with [`Runner::dump`].
    pub fn load(bytes: &[u8]) -> Result<Self, postcard::Error> {
        register_globals();
        let mut runner: Self = postcard::from_bytes(bytes)?;
        runner.interner.rebuild_index();
        Ok(runner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_run() {
        let runner = Runner::new("print(1 + 2)".to_owned(), "test.py").unwrap();
        assert_eq!(runner.run_collect().unwrap(), "3\n");
        assert_eq!(runner.run_collect().unwrap(), "3\n");
    }

    #[test]
    fn dump_load_round_trips() {
        let runner = Runner::new("x = 2\nprint(x * 21)".to_owned(), "test.py").unwrap();
        let bytes = runner.dump().unwrap();
        let restored = Runner::load(&bytes).unwrap();
        assert_eq!(restored.run_collect().unwrap(), "42\n");
    }

    #[test]
    fn check_reports_everything_at_once() {
        let diagnostics = Runner::check("def f():\n    return x\ny = unknown\n", "test.py");
        assert!(diagnostics.len() >= 2);
        assert!(diagnostics.has_kind(DiagKind::NameError));
    }
}
