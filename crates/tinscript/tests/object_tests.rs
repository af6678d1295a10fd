//! Objects, registered classes, namespace inheritance, and dynamic
//! variables, driven end-to-end from script source.

use std::any::Any;

use pretty_assertions::assert_eq;
use tinscript::{CollectPrint, ScriptContext, Value, VarType};

fn context() -> (ScriptContext, CollectPrint) {
    let output = CollectPrint::new();
    let mut ctx = ScriptContext::new("test", Box::new(output.clone())).unwrap();
    ctx.set_error_sink(|_| {});
    (ctx, output)
}

/// Host payload for the `Counter` class used across these tests.
struct CounterPayload {
    native_ticks: i32,
}

fn register_counter(ctx: &mut ScriptContext) {
    ctx.register_class(
        "Counter",
        None,
        || Box::new(CounterPayload { native_ticks: 0 }) as Box<dyn Any>,
        |_native| {},
        &[("value", VarType::Int)],
    )
    .unwrap();
}

#[test]
fn create_method_destroy_lifecycle() {
    let (mut ctx, output) = context();
    register_counter(&mut ctx);
    ctx.exec_command("void Counter::Inc() { ++self.value; }").unwrap();
    ctx.exec_command(
        "object c = create Counter(\"c\");\n\
         c.value = 10;\n\
         c.Inc();\n\
         c.Inc();\n\
         Print(c.value);\n\
         destroy c;",
    )
    .unwrap();
    assert_eq!(output.lines(), vec!["12"]);
    assert!(ctx.find_object_by_name("c").is_none());
}

#[test]
fn is_object_goes_false_after_destroy() {
    let (mut ctx, output) = context();
    register_counter(&mut ctx);
    ctx.exec_command(
        "object c = create Counter(\"c\");\n\
         Print(IsObject(c));\n\
         destroy c;\n\
         Print(IsObject(c));",
    )
    .unwrap();
    assert_eq!(output.lines(), vec!["true", "false"]);
}

#[test]
fn member_reads_through_method_and_host() {
    let (mut ctx, output) = context();
    register_counter(&mut ctx);
    ctx.exec_command("int Counter::Get() { return self.value; }").unwrap();
    ctx.exec_command("object c = create Counter(\"c\"); c.value = 7; Print(c.Get());")
        .unwrap();
    assert_eq!(output.lines(), vec!["7"]);

    let id = ctx.find_object_by_name("c").unwrap().id();
    let read = ctx.call_method(id, "Get", &[]).unwrap();
    assert_eq!(read, Value::Int(7));
}

#[test]
fn methods_resolve_through_parent_chain() {
    let (mut ctx, output) = context();
    ctx.register_class(
        "Base",
        None,
        || Box::new(()) as Box<dyn Any>,
        |_native| {},
        &[("tag", VarType::Int)],
    )
    .unwrap();
    ctx.register_class("Derived", Some("Base"), || Box::new(()) as Box<dyn Any>, |_native| {}, &[])
        .unwrap();

    ctx.exec_command("void Base::Describe() { Print(\"from base\"); }").unwrap();
    ctx.exec_command("object d = create Derived(\"d\"); d.Describe(); d.tag = 4; Print(d.tag);")
        .unwrap();
    assert_eq!(output.lines(), vec!["from base", "4"]);
}

#[test]
fn derived_method_overrides_base() {
    let (mut ctx, output) = context();
    ctx.register_class("Base", None, || Box::new(()) as Box<dyn Any>, |_native| {}, &[])
        .unwrap();
    ctx.register_class("Derived", Some("Base"), || Box::new(()) as Box<dyn Any>, |_native| {}, &[])
        .unwrap();
    ctx.exec_command("void Base::Who() { Print(\"base\"); } void Derived::Who() { Print(\"derived\"); }")
        .unwrap();
    ctx.exec_command("object d = create Derived(\"d\"); d.Who();").unwrap();
    // a namespaced call dispatches from a specific level of the chain
    ctx.exec_command("void Derived::Both() { Base::Who(); } object e = create Derived(\"e\"); e.Both();")
        .unwrap();
    assert_eq!(output.lines(), vec!["derived", "base"]);
}

#[test]
fn dynamic_variables_from_script_and_host() {
    let (mut ctx, output) = context();
    register_counter(&mut ctx);
    ctx.exec_command("void Counter::Arm() { int self.armed; self.armed = 1; }").unwrap();
    ctx.exec_command("object c = create Counter(\"c\"); c.Arm(); Print(c.armed);").unwrap();
    assert_eq!(output.lines(), vec!["1"]);

    let id = ctx.find_object_by_name("c").unwrap().id();
    ctx.add_dynamic_variable_named(id, "label", VarType::String).unwrap();
    ctx.exec_command("object c2 = FindObjectByName(\"c\"); c2.label = \"turret\"; Print(c2.label);")
        .unwrap();
    assert_eq!(output.lines(), vec!["1", "turret"]);
}

#[test]
fn add_dynamic_variable_builtin() {
    let (mut ctx, output) = context();
    register_counter(&mut ctx);
    ctx.exec_command(
        "object c = create Counter(\"c\");\n\
         AddDynamicVariable(c, \"hp\", \"int\");\n\
         c.hp = 250;\n\
         Print(c.hp);",
    )
    .unwrap();
    assert_eq!(output.lines(), vec!["250"]);
}

#[test]
fn native_method_reaches_host_payload() {
    let (mut ctx, output) = context();
    register_counter(&mut ctx);
    ctx.register_method("Counter", "NativeTick", &[], VarType::Int, |ctx, obj, _args| {
        let id = obj.expect("method always has an object");
        let payload = ctx
            .object_native_mut::<CounterPayload>(id)
            .expect("Counter payload present");
        payload.native_ticks += 1;
        Ok(Value::Int(payload.native_ticks))
    })
    .unwrap();
    ctx.exec_command("object c = create Counter(\"c\"); c.NativeTick(); Print(c.NativeTick());")
        .unwrap();
    assert_eq!(output.lines(), vec!["2"]);
}

#[test]
fn object_get_name_builtin() {
    let (mut ctx, output) = context();
    register_counter(&mut ctx);
    ctx.exec_command("object c = create Counter(\"gunner\"); Print(ObjectGetName(c));")
        .unwrap();
    assert_eq!(output.lines(), vec!["gunner"]);
}

#[test]
fn comparing_objects_compares_ids() {
    let (mut ctx, output) = context();
    register_counter(&mut ctx);
    ctx.exec_command(
        "object a = create Counter(\"a\");\n\
         object b = create Counter(\"b\");\n\
         object a2 = a;\n\
         Print(a == a2);\n\
         Print(a == b);\n\
         Print(a != b);",
    )
    .unwrap();
    assert_eq!(output.lines(), vec!["true", "false", "true"]);
}

#[test]
fn creating_an_unregistered_class_fails() {
    let (mut ctx, _output) = context();
    let err = ctx.exec_command("object g = create Ghost(\"g\");").unwrap_err();
    assert_eq!(err.kind, tinscript::ErrorKind::Resolution);
}

#[test]
fn missing_member_is_a_resolution_error() {
    let (mut ctx, _output) = context();
    register_counter(&mut ctx);
    ctx.exec_command("object c = create Counter(\"c\");").unwrap();
    let err = ctx.exec_command("Print(c.nonexistent);").unwrap_err();
    assert_eq!(err.kind, tinscript::ErrorKind::Resolution);
}

#[test]
fn destructor_receives_native_payload() {
    use std::cell::Cell;
    use std::rc::Rc;

    let (mut ctx, _output) = context();
    let destroyed = Rc::new(Cell::new(false));
    let flag = Rc::clone(&destroyed);
    ctx.register_class(
        "Tracked",
        None,
        || Box::new(41i32) as Box<dyn Any>,
        move |native| {
            let value = native.downcast::<i32>().expect("payload is an i32");
            assert_eq!(*value, 41);
            flag.set(true);
        },
        &[],
    )
    .unwrap();
    ctx.exec_command("object t = create Tracked(\"t\"); destroy t;").unwrap();
    assert!(destroyed.get());
}

#[test]
fn host_created_object_is_scriptable() {
    let (mut ctx, output) = context();
    register_counter(&mut ctx);
    let id = ctx.create_named_object("Counter", "boss").unwrap();
    assert!(ctx.find_object(id).is_some());
    ctx.exec_command("object b = FindObjectByName(\"boss\"); b.value = 99; Print(b.value);")
        .unwrap();
    assert_eq!(output.lines(), vec!["99"]);
}
