//! Compiled-cache and string-table persistence behavior.

use std::fs;

use pretty_assertions::assert_eq;
use tinscript::{CollectPrint, ScriptContext};

fn context() -> (ScriptContext, CollectPrint) {
    let output = CollectPrint::new();
    let mut ctx = ScriptContext::new("test", Box::new(output.clone())).unwrap();
    ctx.set_error_sink(|_| {});
    (ctx, output)
}

#[test]
fn exec_script_writes_and_reuses_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("game.ts");
    let cache = dir.path().join("game.tso");
    fs::write(&script, "Print(1 + 2 * 3);").unwrap();

    let (mut ctx, output) = context();
    ctx.exec_script(&script).unwrap();
    assert_eq!(output.lines(), vec!["7"]);
    assert!(cache.exists());

    // second run loads the cache; observable behavior is identical
    let (mut ctx2, output2) = context();
    ctx2.exec_script(&script).unwrap();
    assert_eq!(output2.lines(), vec!["7"]);
}

#[test]
fn stale_cache_is_recompiled() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("game.ts");
    let cache = dir.path().join("game.tso");
    fs::write(&script, "Print(\"first\");").unwrap();

    let (mut ctx, output) = context();
    ctx.exec_script(&script).unwrap();
    assert_eq!(output.lines(), vec!["first"]);

    // rewrite the source, then age the cache behind it
    fs::write(&script, "Print(\"second\");").unwrap();
    let old = std::time::SystemTime::now() - std::time::Duration::from_secs(600);
    let file = fs::OpenOptions::new().write(true).open(&cache).unwrap();
    file.set_modified(old).unwrap();
    drop(file);

    output.clear();
    ctx.exec_script(&script).unwrap();
    assert_eq!(output.lines(), vec!["second"]);
}

#[test]
fn cached_functions_survive_reload() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("lib.ts");
    fs::write(&script, "int add(int a, int b) { return a + b; }").unwrap();

    // first run compiles and caches; definitions register via bytecode
    let (mut ctx, output) = context();
    ctx.exec_script(&script).unwrap();
    ctx.exec_command("Print(add(40, 2));").unwrap();
    assert_eq!(output.lines(), vec!["42"]);

    // a fresh context executes from the cache; FuncDecl/ParamDecl ops
    // rebuild the function entry without the parser
    let (mut ctx2, output2) = context();
    ctx2.exec_script(&script).unwrap();
    ctx2.exec_command("Print(add(40, 2));").unwrap();
    assert_eq!(output2.lines(), vec!["42"]);
}

#[test]
fn string_table_round_trips_through_its_file() {
    let dir = tempfile::tempdir().unwrap();
    let table_path = dir.path().join("stringtable.txt");

    let (mut ctx, _output) = context();
    ctx.exec_command("int launch_delay = 3;").unwrap();
    let hash = tinscript::hash_string("launch_delay");
    ctx.save_string_table(&table_path).unwrap();

    let (mut ctx2, _output2) = context();
    assert_eq!(ctx2.unhash(hash), format!("<hash:0x{hash:08x}>"));
    ctx2.load_string_table(&table_path).unwrap();
    assert_eq!(ctx2.unhash(hash), "launch_delay");
}
