//! Scheduler behavior: deferred dispatch, ordering, cancellation,
//! immediate execution, and host-initiated calls.

use std::any::Any;

use pretty_assertions::assert_eq;
use tinscript::{CollectPrint, ScriptContext, Value, VarType};

fn context() -> (ScriptContext, CollectPrint) {
    let output = CollectPrint::new();
    let mut ctx = ScriptContext::new("test", Box::new(output.clone())).unwrap();
    ctx.set_error_sink(|_| {});
    (ctx, output)
}

#[test]
fn scheduled_call_fires_at_its_time() {
    let (mut ctx, output) = context();
    ctx.exec_command("void SayHi() { Print(\"hi\"); }").unwrap();
    ctx.exec_command("int h = schedule(0, 200, \"SayHi\");").unwrap();

    ctx.update(0);
    assert_eq!(output.lines(), Vec::<String>::new());
    ctx.update(100);
    assert_eq!(output.lines(), Vec::<String>::new());
    ctx.update(250);
    assert_eq!(output.lines(), vec!["hi"]);
    // one-shot: a later tick does not fire again
    ctx.update(500);
    assert_eq!(output.lines(), vec!["hi"]);
}

#[test]
fn cancelled_request_never_fires() {
    let (mut ctx, output) = context();
    ctx.exec_command("void SayHi() { Print(\"hi\"); }").unwrap();
    ctx.exec_command("int h = schedule(0, 200, \"SayHi\"); ScheduleCancel(h);").unwrap();
    ctx.update(250);
    assert_eq!(output.lines(), Vec::<String>::new());
}

#[test]
fn earlier_times_fire_first() {
    let (mut ctx, output) = context();
    ctx.exec_command("void Tag(string s) { Print(s); }").unwrap();
    ctx.exec_command(
        "schedule(0, 300, \"Tag\", \"late\");\n\
         schedule(0, 100, \"Tag\", \"early\");\n\
         schedule(0, 100, \"Tag\", \"early2\");",
    )
    .unwrap();
    ctx.update(400);
    // earlier fire time first; ties keep enqueue order
    assert_eq!(output.lines(), vec!["early", "early2", "late"]);
}

#[test]
fn scheduled_arguments_are_staged() {
    let (mut ctx, output) = context();
    ctx.exec_command("void Report(int a, string b) { Print(a); Print(b); }").unwrap();
    ctx.exec_command("schedule(0, 10, \"Report\", 5 + 5, \"done\");").unwrap();
    ctx.update(10);
    assert_eq!(output.lines(), vec!["10", "done"]);
}

#[test]
fn scheduled_method_runs_on_its_object() {
    let (mut ctx, output) = context();
    ctx.register_class(
        "Counter",
        None,
        || Box::new(()) as Box<dyn Any>,
        |_native| {},
        &[("value", VarType::Int)],
    )
    .unwrap();
    ctx.exec_command("void Counter::Bump() { ++self.value; Print(self.value); }").unwrap();
    ctx.exec_command("object c = create Counter(\"c\"); schedule(c, 50, \"Bump\");").unwrap();
    ctx.update(50);
    assert_eq!(output.lines(), vec!["1"]);
}

#[test]
fn cancel_by_object_suppresses_pending_calls() {
    let (mut ctx, output) = context();
    ctx.register_class("Counter", None, || Box::new(()) as Box<dyn Any>, |_native| {}, &[])
        .unwrap();
    ctx.exec_command("void Counter::Ping() { Print(\"ping\"); }").unwrap();
    ctx.exec_command(
        "object c = create Counter(\"c\");\n\
         schedule(c, 50, \"Ping\");\n\
         schedule(c, 60, \"Ping\");\n\
         ScheduleCancelObject(c);",
    )
    .unwrap();
    ctx.update(100);
    assert_eq!(output.lines(), Vec::<String>::new());
}

#[test]
fn execute_runs_synchronously_and_returns_the_value() {
    let (mut ctx, output) = context();
    ctx.exec_command("int add(int a, int b) { return a + b; }").unwrap();
    ctx.exec_command("int r = execute(0, \"add\", 19, 23); Print(r);").unwrap();
    assert_eq!(output.lines(), vec!["42"]);
}

#[test]
fn stale_object_id_reports_an_error() {
    let (mut ctx, output) = context();
    ctx.register_class("Counter", None, || Box::new(()) as Box<dyn Any>, |_native| {}, &[])
        .unwrap();
    ctx.exec_command("void Counter::Ping() { Print(\"ping\"); }").unwrap();
    ctx.exec_command("object c = create Counter(\"c\"); schedule(c, 50, \"Ping\"); destroy c;")
        .unwrap();

    use std::cell::Cell;
    use std::rc::Rc;
    let errored = Rc::new(Cell::new(false));
    let flag = Rc::clone(&errored);
    ctx.set_error_sink(move |_err| flag.set(true));

    // the request still fires, resolves a stale id, and reports
    ctx.update(100);
    assert!(errored.get());
    assert_eq!(output.lines(), Vec::<String>::new());
}

#[test]
fn failing_request_does_not_block_later_ones() {
    let (mut ctx, output) = context();
    ctx.exec_command("void Ok() { Print(\"ok\"); }").unwrap();
    ctx.exec_command("schedule(0, 10, \"Missing\"); schedule(0, 20, \"Ok\");").unwrap();
    ctx.set_error_sink(|_| {});
    ctx.update(50);
    assert_eq!(output.lines(), vec!["ok"]);
}

#[test]
fn host_scheduled_repeating_call() {
    let (mut ctx, output) = context();
    ctx.exec_command("void Tick() { Print(\"tick\"); }").unwrap();
    ctx.schedule_call(0, 100, "Tick", &[], Some(100)).unwrap();

    ctx.update(100);
    ctx.update(200);
    ctx.update(300);
    assert_eq!(output.lines(), vec!["tick", "tick", "tick"]);
}

#[test]
fn host_cancel_stops_repeating_call() {
    let (mut ctx, output) = context();
    ctx.exec_command("void Tick() { Print(\"tick\"); }").unwrap();
    let id = ctx.schedule_call(0, 100, "Tick", &[], Some(100)).unwrap();
    ctx.update(100);
    ctx.cancel_schedule(id);
    ctx.update(200);
    ctx.update(300);
    assert_eq!(output.lines(), vec!["tick"]);
}

#[test]
fn host_calls_scripted_function_with_typed_args() {
    let (mut ctx, _output) = context();
    ctx.exec_command("float scale(float base, int factor) { return base * factor; }").unwrap();
    let result = ctx.call_function("scale", &[Value::Float(1.5), Value::Int(4)]).unwrap();
    assert_eq!(result, Value::Float(6.0));
}

#[test]
fn host_call_reaches_native_functions_too() {
    let (mut ctx, output) = context();
    let result = ctx.call_function("Print", &[Value::Int(7)]).unwrap();
    assert_eq!(result, Value::Int(0));
    assert_eq!(output.lines(), vec!["7"]);
}

#[test]
fn schedule_return_value_resolves_for_immediate_calls() {
    let (mut ctx, output) = context();
    ctx.exec_command("string label() { return \"alpha\"; }").unwrap();
    ctx.exec_command("string s = execute(0, \"label\"); Print(s);").unwrap();
    assert_eq!(output.lines(), vec!["alpha"]);
}
