//! End-to-end compile-and-execute tests through the embedder API.

use pretty_assertions::assert_eq;
use tinscript::{CollectPrint, ErrorKind, ScriptContext, Value, VarType};

fn context() -> (ScriptContext, CollectPrint) {
    let output = CollectPrint::new();
    let mut ctx = ScriptContext::new("test", Box::new(output.clone())).unwrap();
    // keep test output quiet; errors come back through the Result
    ctx.set_error_sink(|_| {});
    (ctx, output)
}

#[test]
fn arithmetic_precedence() {
    let (mut ctx, output) = context();
    ctx.exec_command("int x = 1 + 2 * 3; Print(x);").unwrap();
    assert_eq!(output.lines(), vec!["7"]);
}

#[test]
fn parenthesized_expressions() {
    let (mut ctx, output) = context();
    ctx.exec_command("Print((1 + 2) * 3);").unwrap();
    assert_eq!(output.lines(), vec!["9"]);
}

#[test]
fn float_promotion() {
    let (mut ctx, output) = context();
    ctx.exec_command("float f = 1 + 0.5; Print(f);").unwrap();
    assert_eq!(output.lines(), vec!["1.5"]);
}

#[test]
fn integer_division_stays_integral() {
    let (mut ctx, output) = context();
    ctx.exec_command("Print(7 / 2);").unwrap();
    assert_eq!(output.lines(), vec!["3"]);
}

#[test]
fn while_loop_with_compound_assign() {
    let (mut ctx, output) = context();
    ctx.exec_command("int s = 0; int i = 0; while (i < 5) { s += i; ++i; } Print(s);")
        .unwrap();
    assert_eq!(output.lines(), vec!["10"]);
}

#[test]
fn for_loop_lowers_to_while() {
    let (mut ctx, output) = context();
    ctx.exec_command("int s = 0; for (int i = 1; i <= 4; ++i) { s += i; } Print(s);")
        .unwrap();
    assert_eq!(output.lines(), vec!["10"]);
}

#[test]
fn if_else_branches() {
    let (mut ctx, output) = context();
    ctx.exec_command("int x = 3; if (x > 5) { Print(\"big\"); } else { Print(\"small\"); }")
        .unwrap();
    ctx.exec_command("if (3 < 5) Print(\"yes\");").unwrap();
    assert_eq!(output.lines(), vec!["small", "yes"]);
}

#[test]
fn else_if_chain() {
    let (mut ctx, output) = context();
    ctx.exec_command(
        "int x = 2;\n\
         if (x == 1) { Print(\"one\"); }\n\
         else if (x == 2) { Print(\"two\"); }\n\
         else { Print(\"many\"); }",
    )
    .unwrap();
    assert_eq!(output.lines(), vec!["two"]);
}

#[test]
fn scripted_function_with_return() {
    let (mut ctx, output) = context();
    ctx.exec_command("int add(int a, int b) { return a + b; } Print(add(40, 2));")
        .unwrap();
    assert_eq!(output.lines(), vec!["42"]);
}

#[test]
fn string_argument_coerces_to_int() {
    let (mut ctx, output) = context();
    ctx.exec_command("int add(int a, int b) { return a + b; } Print(add(40, \"2\"));")
        .unwrap();
    assert_eq!(output.lines(), vec!["42"]);
}

#[test]
fn function_survives_across_commands() {
    let (mut ctx, output) = context();
    ctx.exec_command("int triple(int n) { return n * 3; }").unwrap();
    ctx.exec_command("Print(triple(14));").unwrap();
    assert_eq!(output.lines(), vec!["42"]);
}

#[test]
fn recursion() {
    let (mut ctx, output) = context();
    ctx.exec_command(
        "int fib(int n) { if (n < 2) { return n; } return fib(n - 1) + fib(n - 2); }\n\
         Print(fib(10));",
    )
    .unwrap();
    assert_eq!(output.lines(), vec!["55"]);
}

#[test]
fn void_function_without_explicit_return() {
    let (mut ctx, output) = context();
    ctx.exec_command("void hello() { Print(\"hi\"); } hello();").unwrap();
    assert_eq!(output.lines(), vec!["hi"]);
}

#[test]
fn locals_are_reentrant() {
    let (mut ctx, output) = context();
    ctx.exec_command(
        "int depth(int n) { int local = n * 10; if (n > 0) { depth(n - 1); } return local; }\n\
         Print(depth(3));",
    )
    .unwrap();
    // the outer call's local must survive the recursive calls
    assert_eq!(output.lines(), vec!["30"]);
}

#[test]
fn hashtable_entries() {
    let (mut ctx, output) = context();
    ctx.exec_command("hashtable t; t[\"alpha\"] = 1; t[\"beta\"] = 2; Print(t[\"alpha\"] + t[\"beta\"]);")
        .unwrap();
    assert_eq!(output.lines(), vec!["3"]);
}

#[test]
fn hashtable_multi_part_keys() {
    let (mut ctx, output) = context();
    ctx.exec_command(
        "hashtable grid; grid[\"x\", \"y\"] = 9; Print(grid[\"x\", \"y\"]);",
    )
    .unwrap();
    assert_eq!(output.lines(), vec!["9"]);
}

#[test]
fn hashtable_typed_entry_declaration() {
    let (mut ctx, output) = context();
    ctx.exec_command("hashtable t; float t[\"ratio\"]; t[\"ratio\"] = 1; Print(t[\"ratio\"]);")
        .unwrap();
    // declared float, so the int assignment converts
    assert_eq!(output.lines(), vec!["1.0"]);
}

#[test]
fn bitwise_operations() {
    let (mut ctx, output) = context();
    ctx.exec_command("Print(6 & 3); Print(6 | 3); Print(6 ^ 3); Print(1 << 4); Print(~0 & 255);")
        .unwrap();
    assert_eq!(output.lines(), vec!["2", "7", "5", "16", "255"]);
}

#[test]
fn bitwise_compound_assign() {
    let (mut ctx, output) = context();
    ctx.exec_command("int m = 6; m &= 3; Print(m); m <<= 2; Print(m);").unwrap();
    assert_eq!(output.lines(), vec!["2", "8"]);
}

#[test]
fn boolean_ops_do_not_short_circuit() {
    let (mut ctx, output) = context();
    // the right operand runs even when the left already decided the result
    ctx.exec_command(
        "int calls = 0;\n\
         bool touch() { calls += 1; return true; }\n\
         bool r = false && touch();\n\
         Print(calls); Print(r);",
    )
    .unwrap();
    assert_eq!(output.lines(), vec!["1", "false"]);
}

#[test]
fn unary_operators() {
    let (mut ctx, output) = context();
    ctx.exec_command("int x = 5; Print(-x); Print(!false); int y = ++x; Print(x); Print(y);")
        .unwrap();
    assert_eq!(output.lines(), vec!["-5", "true", "6", "6"]);
}

#[test]
fn modulo_wraps_negative_dividends() {
    let (mut ctx, output) = context();
    ctx.exec_command("Print(-3 % 5);").unwrap();
    assert_eq!(output.lines(), vec!["2"]);
}

#[test]
fn global_registered_variable_round_trip() {
    let (mut ctx, output) = context();
    ctx.register_global("frame_count", VarType::Int, Value::Int(9)).unwrap();
    ctx.exec_command("Print(frame_count); frame_count = 12;").unwrap();
    assert_eq!(output.lines(), vec!["9"]);
    assert_eq!(ctx.global_value("frame_count").unwrap(), Value::Int(12));
}

#[test]
fn registered_native_function_with_return() {
    let (mut ctx, output) = context();
    ctx.register_function("Double", &[VarType::Int], VarType::Int, |_ctx, _obj, args| {
        let Value::Int(n) = args[0] else { unreachable!() };
        Ok(Value::Int(n * 2))
    })
    .unwrap();
    ctx.exec_command("Print(Double(21));").unwrap();
    assert_eq!(output.lines(), vec!["42"]);
}

#[test]
fn determinism_across_fresh_contexts() {
    let program = "int acc = 0; int i = 0; while (i < 7) { acc += i * i; ++i; } Print(acc);";
    let (mut a, out_a) = context();
    let (mut b, out_b) = context();
    a.exec_command(program).unwrap();
    b.exec_command(program).unwrap();
    assert_eq!(out_a.lines(), out_b.lines());
}

// === error taxonomy ===

#[test]
fn undefined_variable_is_a_compile_error() {
    let (mut ctx, _output) = context();
    let err = ctx.exec_command("Print(missing);").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Compile);
}

#[test]
fn undefined_function_is_a_resolution_error() {
    let (mut ctx, _output) = context();
    let err = ctx.exec_command("NoSuchFunction();").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Resolution);
}

#[test]
fn divide_by_zero_is_a_type_error() {
    let (mut ctx, _output) = context();
    let err = ctx.exec_command("int z = 0; Print(1 / z);").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Type);
}

#[test]
fn shadowing_a_native_function_is_a_compile_error() {
    let (mut ctx, _output) = context();
    let err = ctx.exec_command("void Print(string s) { }").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Compile);
}

#[test]
fn runaway_recursion_exceeds_call_depth() {
    let (mut ctx, _output) = context();
    let err = ctx.exec_command("int spin(int n) { return spin(n + 1); } spin(0);").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Resource);
}

#[test]
fn return_outside_function_is_rejected() {
    let (mut ctx, _output) = context();
    let err = ctx.exec_command("return 1;").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Parse);
}

#[test]
fn parse_error_reports_line() {
    let (mut ctx, _output) = context();
    let err = ctx.exec_command("int x = 1;\nint y = @;").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Parse);
    assert_eq!(err.line, Some(2));
}

#[test]
fn error_recovery_keeps_context_usable() {
    let (mut ctx, output) = context();
    assert!(ctx.exec_command("Print(broken").is_err());
    ctx.exec_command("Print(\"still alive\");").unwrap();
    assert_eq!(output.lines(), vec!["still alive"]);
}
