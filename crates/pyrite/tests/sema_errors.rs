//! Semantic analysis diagnostics: collected, rendered, and non-fatal.

use pyrite::{DiagKind, Runner};

fn check(source: &str) -> String {
    Runner::check(source, "test.py").to_string()
}

#[test]
fn annotated_assignment_rejects_int_into_float() {
    let text = check("def f(a: i32) -> i32:\n    return a\nx: f32 = f(1)\n");
    assert!(text.contains("TypeError"), "got: {text}");
    assert!(text.contains("f32"), "got: {text}");
}

#[test]
fn unknown_name_is_a_name_error_with_position() {
    let text = check("def f():\n    return x\n");
    assert!(text.contains("NameError: x"), "got: {text}");
    assert!(text.starts_with("test.py:2:"), "got: {text}");
}

#[test]
fn attribute_miss_walks_bases_before_reporting() {
    let source = "\
class Base:
    a: i64
class Derived(Base):
    b: i64
d = Derived(1, 2)
print(d.a)
print(d.missing)
";
    let text = check(source);
    assert!(text.contains("AttributeError"), "got: {text}");
    assert!(text.contains("'missing'"), "got: {text}");
    assert!(!text.contains("'a'"), "inherited attribute should resolve: {text}");
}

#[test]
fn unsupported_operand_names_both_types() {
    let text = check("a = 1 + \"s\"\n");
    assert!(text.contains("UnsupportedOperand"), "got: {text}");
    assert!(text.contains("i64"), "got: {text}");
    assert!(text.contains("str"), "got: {text}");
}

#[test]
fn call_type_mismatch_reports_both_signatures() {
    let text = check("def f(a: i32) -> i32:\n    return a\nf(\"x\")\n");
    assert!(text.contains("TypeError"), "got: {text}");
    assert!(text.contains("(i32) -> i32"), "got: {text}");
}

#[test]
fn return_type_mismatch() {
    let text = check("def f() -> i32:\n    return \"s\"\n");
    assert!(text.contains("TypeError"), "got: {text}");
    assert!(text.contains("expected i32"), "got: {text}");
}

#[test]
fn import_reports_module_not_found() {
    let text = check("import os\n");
    assert!(text.contains("ModuleNotFoundError"), "got: {text}");
    assert!(text.contains("'os'"), "got: {text}");
}

#[test]
fn unresolved_nonlocal_is_an_error() {
    let text = check("def f():\n    nonlocal ghost\n");
    assert!(text.contains("SyntaxError"), "got: {text}");
    assert!(text.contains("ghost"), "got: {text}");
}

#[test]
fn one_file_yields_multiple_diagnostics() {
    let diagnostics = Runner::check("a = unknown_one\nb = unknown_two\nc = 1 + \"s\"\n", "test.py");
    assert!(diagnostics.len() >= 3, "got: {diagnostics}");
    assert!(diagnostics.has_kind(DiagKind::NameError));
    assert!(diagnostics.has_kind(DiagKind::UnsupportedOperand));
}

#[test]
fn forward_references_between_top_level_defs_resolve() {
    let diagnostics = Runner::check(
        "def even(n):\n    return True if n == 0 else odd(n - 1)\ndef odd(n):\n    return False if n == 0 else even(n - 1)\n",
        "test.py",
    );
    assert!(diagnostics.is_empty(), "got: {diagnostics}");
}

#[test]
fn sema_is_idempotent() {
    use pyrite::print::print_module;

    let source = "def f(a: i32) -> i32:\n    return a + 1\nclass P:\n    x: i64\np = P(2)\ny = f(3)\n";
    let mut interner = pyrite::intern::Interner::new();
    let (mut module, diagnostics) = pyrite::parse::parse_module(source, &mut interner);
    assert!(diagnostics.is_empty());

    let first = pyrite::sema::analyze(&mut module, &mut interner);
    assert!(first.is_empty(), "got: {first:?}");
    let printed_once = print_module(&module, &interner);
    let nlocals_once = module.module_nlocals;

    let second = pyrite::sema::analyze(&mut module, &mut interner);
    assert!(second.is_empty(), "got: {second:?}");
    assert_eq!(print_module(&module, &interner), printed_once);
    assert_eq!(module.module_nlocals, nlocals_once);
}

#[test]
fn syntax_errors_stop_before_evaluation() {
    let err = Runner::new("x = = 1\n".to_owned(), "test.py").expect_err("expected syntax errors");
    assert!(err.has_kind(DiagKind::SyntaxError));
}

#[test]
fn mixed_indentation_is_a_syntax_error() {
    let err = Runner::new("if a:\n \tpass\n".to_owned(), "test.py").expect_err("expected syntax errors");
    assert!(err.has_kind(DiagKind::SyntaxError), "got: {err}");
}
