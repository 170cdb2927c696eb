//! Grammar-level properties: operator precedence grouping and printer
//! stability over generated expressions.

use proptest::prelude::*;
use pyrite::intern::Interner;
use pyrite::parse::parse_module;
use pyrite::print::print_module;

fn normalize(source: &str) -> String {
    let mut interner = Interner::new();
    let (module, diagnostics) = parse_module(source, &mut interner);
    assert!(diagnostics.is_empty(), "{source:?} should parse: {diagnostics:?}");
    print_module(&module, &interner)
}

const BINARY_OPS: &[(&str, i8, bool)] = &[
    ("or", 3, true),
    ("and", 4, true),
    ("|", 7, true),
    ("^", 8, true),
    ("&", 9, true),
    ("<<", 10, true),
    (">>", 10, true),
    ("+", 11, true),
    ("-", 11, true),
    ("*", 12, true),
    ("/", 12, true),
    ("//", 12, true),
    ("%", 12, true),
    ("**", 14, false),
];

/// For p1 < p2, `a o1 b o2 c` groups as `a o1 (b o2 c)`; for p1 == p2 it
/// follows associativity.
#[test]
fn precedence_pairs_group_as_specified() {
    for &(o1, p1, _) in BINARY_OPS {
        for &(o2, p2, left2) in BINARY_OPS {
            let plain = normalize(&format!("x = a {o1} b {o2} c\n"));
            if p1 < p2 {
                let grouped = normalize(&format!("x = a {o1} (b {o2} c)\n"));
                assert_eq!(plain, grouped, "a {o1} b {o2} c should group right");
            } else if p1 == p2 {
                let expected = if left2 {
                    normalize(&format!("x = (a {o1} b) {o2} c\n"))
                } else {
                    normalize(&format!("x = a {o1} (b {o2} c)\n"))
                };
                assert_eq!(plain, expected, "a {o1} b {o2} c associativity");
            }
        }
    }
}

fn arb_expr() -> impl Strategy<Value = String> {
    let leaf = prop_oneof![
        Just("a".to_owned()),
        Just("b".to_owned()),
        Just("c".to_owned()),
        Just("1".to_owned()),
        Just("2".to_owned()),
        Just("30".to_owned()),
    ];
    leaf.prop_recursive(4, 32, 2, |inner| {
        let op = prop::sample::select(
            BINARY_OPS.iter().map(|(symbol, _, _)| *symbol).collect::<Vec<_>>(),
        );
        prop_oneof![
            (inner.clone(), op, inner.clone()).prop_map(|(l, o, r)| format!("{l} {o} {r}")),
            inner.prop_map(|e| format!("({e})")),
        ]
    })
}

proptest! {
    /// Printing is a normal form: parsing the printer's output and
    /// printing again changes nothing.
    #[test]
    fn printer_output_is_stable(expr in arb_expr()) {
        let source = format!("x = {expr}\n");
        let printed = normalize(&source);
        prop_assert_eq!(normalize(&printed), printed);
    }
}
