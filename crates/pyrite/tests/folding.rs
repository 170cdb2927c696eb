//! Partial-evaluation properties: constant folding, residuals, and the
//! binding watermark discipline.

use pyrite::ast::{ExprLoc, Stmt};
use pyrite::eval::{PartialResult, TreeEvaluator};
use pyrite::value::Value;
use pyrite::{CollectStringPrint, NoopTracer, Runner};

fn assign_value(runner: &Runner, index: usize) -> &ExprLoc {
    match &runner.module().body[index].stmt {
        Stmt::Assign { value, .. } => value,
        other => panic!("expected an assignment, got {other:?}"),
    }
}

#[test]
fn constant_expressions_fold_to_values() {
    let runner = Runner::new("y = (3 * 4 + 5) * 2\n".to_owned(), "test.py").unwrap();
    let mut writer = CollectStringPrint::new();
    let mut tracer = NoopTracer;
    let mut evaluator = TreeEvaluator::new(runner.module(), runner.interner(), &mut writer, &mut tracer);
    match evaluator.fold(assign_value(&runner, 0)) {
        PartialResult::Value(Value::Int(v)) => assert_eq!(v, 34),
        other => panic!("expected a folded integer, got {other:?}"),
    }
}

#[test]
fn folding_covers_strings_and_bools() {
    let runner = Runner::new("a = \"x\" + \"y\"\nb = True and 1 < 2\n".to_owned(), "test.py").unwrap();
    let mut writer = CollectStringPrint::new();
    let mut tracer = NoopTracer;
    let mut evaluator = TreeEvaluator::new(runner.module(), runner.interner(), &mut writer, &mut tracer);
    let folded = evaluator.fold(assign_value(&runner, 0));
    assert!(!folded.is_residual(), "string concat should fold: {folded:?}");
    match evaluator.fold(assign_value(&runner, 1)) {
        PartialResult::Value(Value::Bool(true)) => {}
        other => panic!("expected True, got {other:?}"),
    }
}

#[test]
fn unbound_names_stay_residual_until_bound() {
    let runner = Runner::new("x = 1\ny = x + 2\n".to_owned(), "test.py").unwrap();
    let mut writer = CollectStringPrint::new();
    let mut tracer = NoopTracer;
    let mut evaluator = TreeEvaluator::new(runner.module(), runner.interner(), &mut writer, &mut tracer);

    // Before the module body runs, `x` is unbound: the fold must return a
    // residual expression, not a value.
    let before = evaluator.fold(assign_value(&runner, 1));
    assert!(before.is_residual(), "expected a residual, got {before:?}");

    evaluator.run_module().expect("module body runs cleanly");
    match evaluator.fold(assign_value(&runner, 1)) {
        PartialResult::Value(Value::Int(v)) => assert_eq!(v, 3),
        other => panic!("expected a folded integer, got {other:?}"),
    }
}

#[test]
fn bindings_length_is_restored_around_calls() {
    let source = "def f(a):\n    b = a + 1\n    return b\nx = f(1)\ny = f(x)\n";
    let runner = Runner::new(source.to_owned(), "test.py").unwrap();
    let mut writer = CollectStringPrint::new();
    let mut tracer = NoopTracer;
    let mut evaluator = TreeEvaluator::new(runner.module(), runner.interner(), &mut writer, &mut tracer);

    let before = evaluator.bindings.len();
    evaluator.run_module().expect("module body runs cleanly");
    assert_eq!(
        evaluator.bindings.len(),
        before,
        "module-level binding count must be unchanged by calls"
    );
}
