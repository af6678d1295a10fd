//! TinScript: an embeddable game-scripting language.
//!
//! Source text compiles to a word-addressed stack bytecode executed by an
//! embedded VM. Host functions, methods, globals, and object classes are
//! registered against a [`ScriptContext`] and become callable from
//! scripts; scripted functions can be invoked from the host with typed
//! arguments. A time-based scheduler drives deferred and periodic calls.
//!
//! ```no_run
//! use tinscript::{ScriptContext, StdPrint};
//!
//! let mut ctx = ScriptContext::new("main", Box::new(StdPrint)).unwrap();
//! ctx.exec_command("int x = 1 + 2 * 3; Print(x);").unwrap();
//! ctx.update(16);
//! ```

mod builtins;
mod bytecode;
mod cache;
mod context;
mod error;
mod function;
mod hash;
mod intern;
mod io;
mod namespace;
mod object;
mod parse;
mod schedule;
mod tracer;
mod value;
mod variable;

pub use crate::{
    bytecode::{disassemble, Opcode, CALL_STACK_DEPTH, EXEC_STACK_WORDS},
    context::{ScriptContext, MAX_REGISTERED_PARAMS},
    error::{ErrorKind, ScriptError, ScriptResult},
    function::{MAX_LOCAL_COUNT, MAX_PARAMETER_COUNT},
    hash::{hash_append, hash_string},
    io::{CollectPrint, PrintWriter, StdPrint},
    object::ObjectEntry,
    tracer::{CollectTracer, ExecTracer, NoopTracer, StderrTracer},
    value::{Value, VarType, MAX_TYPE_WORDS},
};
