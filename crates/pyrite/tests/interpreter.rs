//! End-to-end interpreter scenarios: source in, captured stdout out.

use pyrite::Runner;

fn run(source: &str) -> String {
    let runner = Runner::new(source.to_owned(), "test.py").expect("source should analyze cleanly");
    runner.run_collect().expect("source should run cleanly")
}

fn run_err(source: &str) -> String {
    match Runner::new(source.to_owned(), "test.py") {
        Ok(runner) => runner
            .run_collect()
            .expect_err("expected a runtime diagnostic")
            .to_string(),
        Err(diagnostics) => diagnostics.to_string(),
    }
}

#[test]
fn annotated_function_call() {
    let out = run("def f(a: i32) -> i32:\n    return a\nx = f(1)\nprint(x)\n");
    assert_eq!(out, "1\n");
}

#[test]
fn arithmetic_precedence() {
    assert_eq!(run("a = 3 + 2 * 4\nprint(a)\n"), "11\n");
    assert_eq!(run("print(2 ** 10)\n"), "1024\n");
    assert_eq!(run("print(7 // 2, 7 % 2, 1 / 2)\n"), "3 1 0.5\n");
    assert_eq!(run("print(-2 ** 2)\n"), "-4\n");
}

#[test]
fn class_with_init() {
    let out = run("class P:\n    def __init__(self, x: i32):\n        self.x = x\np = P(2)\nprint(p.x)\n");
    assert_eq!(out, "2\n");
}

#[test]
fn attribute_constructor_from_declared_attrs() {
    let out = run("class Point:\n    x: i64\n    y: i64\np = Point(3, 4)\nprint(p.x + p.y)\n");
    assert_eq!(out, "7\n");
}

#[test]
fn try_except_catches_matching_type() {
    let out = run("try:\n    raise ValueError()\nexcept ValueError:\n    print(\"ok\")\n");
    assert_eq!(out, "ok\n");
}

#[test]
fn except_matches_by_subclass_not_equality() {
    let out = run("try:\n    x = 1 // 0\nexcept ArithmeticError:\n    print(\"caught\")\n");
    assert_eq!(out, "caught\n");
}

#[test]
fn unhandled_exception_surfaces_as_diagnostic() {
    let err = run_err("raise ValueError(\"boom\")\n");
    assert!(err.contains("RuntimeError"), "got: {err}");
    assert!(err.contains("ValueError: boom"), "got: {err}");
}

#[test]
fn finally_always_runs() {
    let out = run("def f():\n    try:\n        return 1\n    finally:\n        print(\"cleanup\")\nprint(f())\n");
    assert_eq!(out, "cleanup\n1\n");
}

#[test]
fn else_runs_without_exception() {
    let out = run("try:\n    x = 1\nexcept ValueError:\n    print(\"no\")\nelse:\n    print(\"else\")\n");
    assert_eq!(out, "else\n");
}

#[test]
fn with_exit_can_suppress() {
    let source = "\
class Guard:
    def __enter__(self):
        return self
    def __exit__(self, kind, value, line):
        return True
with Guard() as g:
    raise ValueError(\"boom\")
print(\"survived\")
";
    assert_eq!(run(source), "survived\n");
}

#[test]
fn with_exit_sees_the_exception_triple() {
    let source = "\
class Probe:
    def __enter__(self):
        return self
    def __exit__(self, kind, value, line):
        print(kind)
        return True
with Probe():
    raise ValueError(\"x\")
";
    assert_eq!(run(source), "ValueError\n");
}

#[test]
fn loops_and_ranges() {
    assert_eq!(run("total = 0\nfor i in range(5):\n    total += i\nprint(total)\n"), "10\n");
    let out = run("i = 0\nwhile i < 3:\n    print(i)\n    i += 1\n");
    assert_eq!(out, "0\n1\n2\n");
}

#[test]
fn break_skips_the_loop_else() {
    let out = run("for i in range(3):\n    if i == 1:\n        break\nelse:\n    print(\"else\")\nprint(\"done\")\n");
    assert_eq!(out, "done\n");
    let out = run("for i in range(3):\n    pass\nelse:\n    print(\"else\")\n");
    assert_eq!(out, "else\n");
}

#[test]
fn short_circuit_never_calls_the_rhs() {
    let source = "\
def boom():
    raise ValueError(\"no\")
print(False and boom())
print(True or boom())
print(0 == 1 == boom())
";
    assert_eq!(run(source), "False\nTrue\nFalse\n");
}

#[test]
fn chained_comparison_evaluates_middle_once() {
    assert_eq!(run("print(1 < 2 < 3)\nprint(1 < 2 > 5)\n"), "True\nFalse\n");
}

#[test]
fn strings_and_fstrings() {
    assert_eq!(run("x = 3\nprint(f\"x={x} twice={x * 2}\")\n"), "x=3 twice=6\n");
    assert_eq!(run("print(\"ab\" + \"cd\", \"ab\" * 2)\n"), "abcd abab\n");
    assert_eq!(run("print(\"-\".join([\"x\", \"y\", \"z\"]))\n"), "x-y-z\n");
    assert_eq!(run("print(\"a,b,c\".split(\",\"))\n"), "['a', 'b', 'c']\n");
}

#[test]
fn list_operations() {
    let out = run("xs = [1, 2]\nxs.append(3)\nprint(len(xs), xs[0], xs[-1])\nprint(xs[1:])\n");
    assert_eq!(out, "3 1 3\n[2, 3]\n");
}

#[test]
fn dict_operations() {
    let out = run("d = {\"a\": 1}\nd[\"b\"] = 2\nprint(d[\"b\"], len(d))\nprint(d.get(\"missing\", 0))\n");
    assert_eq!(out, "2 2\n0\n");
}

#[test]
fn comprehensions() {
    assert_eq!(run("print([x * x for x in range(4)])\n"), "[0, 1, 4, 9]\n");
    assert_eq!(run("print([x for x in range(6) if x % 2 == 0])\n"), "[0, 2, 4]\n");
    assert_eq!(run("d = {k: k * 2 for k in range(3)}\nprint(d[2])\n"), "4\n");
}

#[test]
fn tuple_unpacking_and_swap() {
    assert_eq!(run("a, b = 1, 2\na, b = b, a\nprint(a, b)\n"), "2 1\n");
    assert_eq!(run("first, *rest = [1, 2, 3, 4]\nprint(first, rest)\n"), "1 [2, 3, 4]\n");
}

#[test]
fn closures_capture_their_environment() {
    let source = "\
def make_adder(n):
    def add(x):
        return x + n
    return add
add2 = make_adder(2)
print(add2(40))
";
    assert_eq!(run(source), "42\n");
}

#[test]
fn nonlocal_rebinds_through_the_cell() {
    let source = "\
def counter():
    n = 0
    def bump():
        nonlocal n
        n = n + 1
        return n
    return bump
c = counter()
print(c())
print(c())
";
    assert_eq!(run(source), "1\n2\n");
}

#[test]
fn global_statement_targets_module_scope() {
    let source = "\
count = 0
def bump():
    global count
    count = count + 1
bump()
bump()
print(count)
";
    assert_eq!(run(source), "2\n");
}

#[test]
fn user_defined_dunder_add() {
    let source = "\
class Vec:
    def __init__(self, x: i64, y: i64):
        self.x = x
        self.y = y
    def __add__(self, other):
        return Vec(self.x + other.x, self.y + other.y)
v = Vec(1, 2) + Vec(3, 4)
print(v.x, v.y)
";
    assert_eq!(run(source), "4 6\n");
}

#[test]
fn methods_and_inheritance() {
    let source = "\
class Animal:
    def speak(self):
        return \"...\"
    def greet(self):
        return self.speak()
class Dog(Animal):
    def speak(self):
        return \"woof\"
d = Dog()
print(d.greet())
";
    assert_eq!(run(source), "woof\n");
}

#[test]
fn user_exception_classes_match_by_hierarchy() {
    let source = "\
class AppError(ValueError):
    pass
try:
    raise AppError(\"bad\")
except ValueError as e:
    print(\"caught\", e.message)
";
    assert_eq!(run(source), "caught bad\n");
}

#[test]
fn generators_buffer_their_yields() {
    let source = "\
def gen(n):
    i = 0
    while i < n:
        yield i
        i = i + 1
for v in gen(3):
    print(v)
";
    assert_eq!(run(source), "0\n1\n2\n");
}

#[test]
fn generator_next_and_stop_iteration() {
    let source = "\
def two():
    yield 1
    yield 2
g = two()
print(g.__next__())
print(g.__next__())
try:
    g.__next__()
except StopIteration:
    print(\"done\")
";
    assert_eq!(run(source), "1\n2\ndone\n");
}

#[test]
fn yield_from_delegates() {
    let source = "\
def inner():
    yield 1
    yield 2
def outer():
    yield 0
    yield from inner()
print([v for v in outer()])
";
    assert_eq!(run(source), "[0, 1, 2]\n");
}

#[test]
fn await_runs_the_coroutine() {
    let source = "\
async def work():
    return 41
async def main_task():
    value = await work()
    return value + 1
print(await main_task())
";
    assert_eq!(run(source), "42\n");
}

#[test]
fn match_statement_patterns() {
    let source = "\
def describe(x):
    match x:
        case 0:
            return \"zero\"
        case [a, b]:
            return \"pair\"
        case {\"k\": v}:
            return \"map\"
        case n if n > 10:
            return \"big\"
        case _:
            return \"other\"
print(describe(0))
print(describe([1, 2]))
print(describe({\"k\": 5}))
print(describe(42))
print(describe(7))
";
    assert_eq!(run(source), "zero\npair\nmap\nbig\nother\n");
}

#[test]
fn match_class_and_or_patterns() {
    let source = "\
class Point:
    x: i64
    y: i64
def kind(p):
    match p:
        case Point(0, 0):
            return \"origin\"
        case Point(x, y) if x == y:
            return \"diagonal\"
        case 1 | 2 | 3:
            return \"small\"
        case _:
            return \"other\"
print(kind(Point(0, 0)))
print(kind(Point(2, 2)))
print(kind(2))
print(kind(\"x\"))
";
    assert_eq!(run(source), "origin\ndiagonal\nsmall\nother\n");
}

#[test]
fn match_sequence_with_star() {
    let source = "\
match [1, 2, 3, 4]:
    case [first, *rest]:
        print(first, rest)
";
    assert_eq!(run(source), "1 [2, 3, 4]\n");
}

#[test]
fn lambdas_and_ternary() {
    assert_eq!(run("add = lambda x, y: x + y\nprint(add(2, 3))\n"), "5\n");
    assert_eq!(run("x = 5\nprint(\"big\" if x > 3 else \"small\")\n"), "big\n");
}

#[test]
fn walrus_binds_and_yields_the_value() {
    assert_eq!(run("y = (x := 3) + 1\nprint(x, y)\n"), "3 4\n");
}

#[test]
fn builtin_conversions_and_predicates() {
    assert_eq!(run("print(int(\"42\"), float(2), str(7) + \"!\")\n"), "42 2.0 7!\n");
    assert_eq!(run("print(isinstance(3, i64), isinstance(\"a\", str))\n"), "True True\n");
    assert_eq!(run("print(min(3, 1, 2), max([4, 7]), abs(-5))\n"), "1 7 5\n");
}

#[test]
fn default_arguments_apply_for_missing_parameters() {
    let source = "\
def greet(name, punct=\"!\"):
    return name + punct
print(greet(\"hi\"))
print(greet(\"hi\", \"?\"))
print(greet(name=\"yo\"))
";
    assert_eq!(run(source), "hi!\nhi?\nyo!\n");
}

#[test]
fn keyword_only_and_varargs() {
    let source = "\
def tally(*values, scale=1):
    total = 0
    for v in values:
        total += v
    return total * scale
print(tally(1, 2, 3))
print(tally(1, 2, 3, scale=2))
";
    assert_eq!(run(source), "6\n12\n");
}

#[test]
fn decorators_wrap_bottom_up() {
    let source = "\
def double(f):
    def wrapped(x):
        return f(x) * 2
    return wrapped
@double
def inc(x):
    return x + 1
print(inc(5))
";
    assert_eq!(run(source), "12\n");
}

#[test]
fn main_is_invoked_after_module_top_level() {
    let source = "\
print(\"module\")
def main():
    print(\"main\")
";
    assert_eq!(run(source), "module\nmain\n");
}

#[test]
fn recursion_works_and_overflow_is_caught() {
    let source = "\
def fact(n):
    if n <= 1:
        return 1
    return n * fact(n - 1)
print(fact(10))
";
    assert_eq!(run(source), "3628800\n");

    let err = run_err("def loop(n):\n    return loop(n + 1)\nloop(0)\n");
    assert!(err.contains("RecursionError"), "got: {err}");
}

#[test]
fn runtime_index_and_key_errors() {
    let err = run_err("xs = [1]\nprint(xs[5])\n");
    assert!(err.contains("IndexError"), "got: {err}");
    let err = run_err("d = {\"a\": 1}\nprint(d[\"b\"])\n");
    assert!(err.contains("KeyError"), "got: {err}");
}

#[test]
fn assert_raises_assertion_error() {
    let err = run_err("assert 1 == 2, \"mismatch\"\n");
    assert!(err.contains("AssertionError"), "got: {err}");
    assert!(err.contains("mismatch"), "got: {err}");
    assert_eq!(run("assert 1 == 1\nprint(\"ok\")\n"), "ok\n");
}

#[test]
fn bare_raise_reraises_the_handled_exception() {
    let err = run_err("try:\n    raise ValueError(\"first\")\nexcept ValueError:\n    raise\n");
    assert!(err.contains("ValueError: first"), "got: {err}");
}

#[test]
fn augmented_assignment_on_attributes_and_items() {
    let source = "\
class Box:
    v: i64
b = Box(10)
b.v += 5
xs = [1, 2]
xs[0] += 9
print(b.v, xs[0])
";
    assert_eq!(run(source), "15 10\n");
}

#[test]
fn docstrings_are_absorbed_not_executed() {
    let source = "\"\"\"module doc\"\"\"\ndef f():\n    \"\"\"fn doc\"\"\"\n    return 1\nprint(f())\n";
    assert_eq!(run(source), "1\n");
}

#[test]
fn nested_functions_see_parameters() {
    let source = "\
def outer(a):
    def inner(b):
        return a + b
    return inner(10)
print(outer(1))
";
    assert_eq!(run(source), "11\n");
}

#[test]
fn while_else_runs_on_normal_exit() {
    let out = run("i = 0\nwhile i < 2:\n    i += 1\nelse:\n    print(\"done\", i)\n");
    assert_eq!(out, "done 2\n");
}
