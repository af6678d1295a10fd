//! Script runner and interactive shell.
//!
//! `tin script.ts` executes a file (compiling through the `.tso` cache);
//! `tin` with no arguments reads statements from stdin. `--trace` prints
//! every dispatched opcode to stderr.

use std::env;
use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use tinscript::{ScriptContext, StdPrint, StderrTracer, Value, VarType};

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut trace = false;
    let mut scripts: Vec<String> = Vec::new();
    let mut updates: Vec<u32> = Vec::new();

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--trace" => trace = true,
            "--update" => {
                let Some(ms) = iter.next().and_then(|v| v.parse().ok()) else {
                    eprintln!("error: --update requires a millisecond timestamp");
                    return ExitCode::FAILURE;
                };
                updates.push(ms);
            }
            "--help" | "-h" => {
                print_usage();
                return ExitCode::SUCCESS;
            }
            other if other.starts_with('-') => {
                eprintln!("error: unknown option {other}");
                print_usage();
                return ExitCode::FAILURE;
            }
            script => scripts.push(script.to_owned()),
        }
    }

    let mut ctx = match ScriptContext::new("main", Box::new(StdPrint)) {
        Ok(ctx) => ctx,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };
    ctx.set_error_sink(|err| eprintln!("{err}"));
    if trace {
        ctx.set_tracer(Box::new(StderrTracer));
    }
    register_demo_bindings(&mut ctx);

    if scripts.is_empty() {
        return repl(&mut ctx);
    }

    let mut failed = false;
    for script in &scripts {
        if ctx.exec_script(script).is_err() {
            failed = true;
        }
    }
    for now in updates {
        ctx.update(now);
    }
    if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS }
}

fn repl(ctx: &mut ScriptContext) -> ExitCode {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        let _ = write!(stdout, "tin> ");
        let _ = stdout.flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => return ExitCode::SUCCESS,
            Ok(_) => {}
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            return ExitCode::SUCCESS;
        }
        if let Some(ms) = line.strip_prefix("update ").and_then(|v| v.parse::<u32>().ok()) {
            ctx.update(ms);
            continue;
        }
        // errors already went through the sink
        let _ = ctx.exec_command(line);
    }
}

/// A tiny host surface so the shell can exercise registration paths.
fn register_demo_bindings(ctx: &mut ScriptContext) {
    let _ = ctx.register_function("GetSimTime", &[], VarType::Int, |_ctx, _obj, _args| Ok(Value::Int(0)));
    let _ = ctx.register_class(
        "Entity",
        None,
        || Box::new(()) as Box<dyn std::any::Any>,
        |_native| {},
        &[("health", VarType::Int), ("speed", VarType::Float)],
    );
}

fn print_usage() {
    println!("usage: tin [--trace] [--update MS]... [script.ts]...");
    println!();
    println!("With no script, reads statements from stdin.");
    println!("  --trace      print every dispatched opcode to stderr");
    println!("  --update MS  run one scheduler tick at the given time");
}
