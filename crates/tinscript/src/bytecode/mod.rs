//! Bytecode: opcode set, emitter, compiled blocks, tree lowering, and
//! the virtual machine.
//!
//! - `op` - opcode enum and disassembler
//! - `emit` - two-pass word emitter
//! - `code` - compiled `CodeBlock` (instructions + line table)
//! - `compiler` - compile tree and its `eval` lowering
//! - `vm` - execution and call stacks, dispatch loop, opcode handlers

pub use code::CodeBlock;
pub use compiler::{CompileTree, Compiler, NodeId, NodeKind};
pub use emit::Emitter;
pub use op::{disassemble, Opcode};
pub use vm::{CallStack, ExecStack, CALL_STACK_DEPTH, EXEC_STACK_WORDS};

pub(crate) use vm::{execute_block, invoke_top, schedule_param_name};

mod code;
mod compiler;
mod emit;
mod op;
mod vm;
