//! Resolution of popped stack entries.
//!
//! A popped entry is either a concrete value or one of the reference
//! markers (`__var`, `__hashvar`, `__member`, `__stackvar`,
//! `__podmember`). Reads resolve a reference to the value it addresses;
//! assignment pops the reference and writes through it.

use crate::bytecode::vm::stack::{CallStack, ExecStack, RawWords};
use crate::context::ScriptContext;
use crate::error::{ScriptError, ScriptResult};
use crate::value::{Value, VarType};

/// A decoded reference marker: where a value lives.
#[derive(Debug, Clone, Copy)]
pub enum StackRef {
    /// Global/local by `(ns_hash, func_hash, var_hash)`, with an extra
    /// hashtable key when popped as `__hashvar` (key 0 otherwise).
    Var { ns: u32, func: u32, var: u32, key: u32 },
    /// Object member by `(object_id, member_hash)`.
    Member { object_id: u32, var: u32 },
    /// Local slot by `(declared_type, frame_offset)`; the address is
    /// resolved against the executing frame at access time.
    StackSlot { ty: VarType, offset: u16 },
    /// Sub-field of a POD value; dereferencing fails unless a POD layout
    /// is registered, and no default context registers one.
    PodMember { ty: VarType, slot: u32 },
}

/// One popped stack entry, decoded but not yet resolved.
#[derive(Debug, Clone, Copy)]
pub enum Popped {
    Value(Value),
    Ref(StackRef),
}

/// Decodes a raw `(payload, type)` pair off the stack.
pub fn decode_entry(payload: &RawWords, ty: VarType) -> ScriptResult<Popped> {
    match ty {
        VarType::Var => Ok(Popped::Ref(StackRef::Var {
            ns: payload[0],
            func: payload[1],
            var: payload[2],
            key: 0,
        })),
        VarType::HashVar => Ok(Popped::Ref(StackRef::Var {
            ns: payload[0],
            func: payload[1],
            var: payload[2],
            key: payload[3],
        })),
        VarType::Member => Ok(Popped::Ref(StackRef::Member {
            object_id: payload[1],
            var: payload[0],
        })),
        VarType::StackVar => Ok(Popped::Ref(StackRef::StackSlot {
            ty: VarType::from_word(payload[0])?,
            offset: payload[1] as u16,
        })),
        VarType::PodMember => Ok(Popped::Ref(StackRef::PodMember {
            ty: VarType::from_word(payload[0])?,
            slot: payload[1],
        })),
        concrete => {
            let word = payload.first().copied().unwrap_or(0);
            Ok(Popped::Value(Value::decode_word(concrete, word)?))
        }
    }
}

/// Pops and decodes one entry without resolving references.
pub fn pop_entry(exec: &mut ExecStack) -> ScriptResult<Popped> {
    let (payload, ty) = exec.pop_raw()?;
    decode_entry(&payload, ty)
}

/// Pops one entry and resolves it to a value.
pub fn pop_value(ctx: &mut ScriptContext, exec: &mut ExecStack, calls: &CallStack) -> ScriptResult<Value> {
    match pop_entry(exec)? {
        Popped::Value(value) => Ok(value),
        Popped::Ref(r) => read_ref(ctx, exec, calls, &r),
    }
}

/// Pops one entry that must be a reference (assignment LHS).
pub fn pop_ref(exec: &mut ExecStack) -> ScriptResult<StackRef> {
    match pop_entry(exec)? {
        Popped::Ref(r) => Ok(r),
        Popped::Value(_) => Err(ScriptError::type_error("attempting to assign to a non-variable")),
    }
}

/// Reads the value a reference addresses.
pub fn read_ref(ctx: &mut ScriptContext, exec: &ExecStack, calls: &CallStack, r: &StackRef) -> ScriptResult<Value> {
    match *r {
        StackRef::Var { ns, func, var, key } => ctx.var_value(ns, func, var, key),
        StackRef::Member { object_id, var } => ctx.member_value(object_id, var),
        StackRef::StackSlot { ty, offset } => {
            let frame = calls
                .executing()
                .ok_or_else(|| ScriptError::resolution("no executing stack frame for a local variable"))?;
            let index = exec.slot_index(frame.stack_base, offset)?;
            Value::decode_word(ty, exec.read_slot(index)?)
        }
        StackRef::PodMember { .. } => Err(ScriptError::type_error(
            "POD member lookup failed: value has no registered members",
        )),
    }
}

/// Writes a value through a reference, converting to the target's
/// declared type.
pub fn write_ref(
    ctx: &mut ScriptContext,
    exec: &mut ExecStack,
    calls: &CallStack,
    r: &StackRef,
    value: Value,
) -> ScriptResult<()> {
    match *r {
        StackRef::Var { ns, func, var, key } => ctx.set_var_value(ns, func, var, key, value),
        StackRef::Member { object_id, var } => ctx.set_member_value(object_id, var, value),
        StackRef::StackSlot { ty, offset } => {
            let frame = calls
                .executing()
                .ok_or_else(|| ScriptError::resolution("no executing stack frame for a local variable"))?;
            let index = exec.slot_index(frame.stack_base, offset)?;
            let converted = value.convert(ty, &mut ctx.string_table)?;
            let word = converted
                .encode_words()
                .ok_or_else(|| ScriptError::internal("cannot store a void value"))?;
            exec.write_slot(index, word)
        }
        StackRef::PodMember { .. } => Err(ScriptError::type_error(
            "POD member lookup failed: value has no registered members",
        )),
    }
}

/// The declared type behind a reference, for compound assignment.
pub fn ref_type(ctx: &ScriptContext, r: &StackRef) -> ScriptResult<VarType> {
    match *r {
        StackRef::Var { ns, func, var, key } => ctx.var_type_of(ns, func, var, key),
        StackRef::Member { object_id, var } => ctx.member_type_of(object_id, var),
        StackRef::StackSlot { ty, .. } | StackRef::PodMember { ty, .. } => Ok(ty),
    }
}
