//! The virtual machine: a single-threaded loop over instruction words.
//!
//! Fetch the opcode word, dispatch to its handler, repeat until `Eof` or
//! until a `FuncReturn` unwinds the call that entered this loop. Handlers
//! share one contract: they advance the instruction pointer past their
//! operands, never corrupt the stacks on an error path (they return the
//! error instead), and have a fixed net stack effect.

mod math;
mod resolve;
mod stack;

pub use stack::{CallStack, ExecStack, CALL_STACK_DEPTH, EXEC_STACK_WORDS};

use std::rc::Rc;

use crate::bytecode::code::CodeBlock;
use crate::bytecode::op::Opcode;
use crate::context::ScriptContext;
use crate::error::{ScriptError, ScriptResult};
use crate::function::{FunctionImpl, NativeFn};
use crate::hash::{hash_append, hash_string};
use crate::value::{Value, VarType, MAX_TYPE_WORDS};

use resolve::{pop_entry, pop_value, Popped, StackRef};

/// What the dispatcher tells the run loop to do next.
enum Signal {
    Continue,
    /// A `FuncReturn` popped the frame this loop was entered for.
    Return,
    /// `Eof` reached.
    End,
}

fn fetch(block: &CodeBlock, ip: &mut usize) -> ScriptResult<u32> {
    let word = block
        .instructions()
        .get(*ip)
        .copied()
        .ok_or_else(|| ScriptError::internal("instruction pointer ran past the end of the block"))?;
    *ip += 1;
    Ok(word)
}

fn fetch_type(block: &CodeBlock, ip: &mut usize) -> ScriptResult<VarType> {
    VarType::from_word(fetch(block, ip)?)
}

/// Executes a block starting at a word offset until `Eof` or until the
/// call that entered here returns.
pub(crate) fn execute_block(
    ctx: &mut ScriptContext,
    block: &Rc<CodeBlock>,
    offset: usize,
    exec: &mut ExecStack,
    calls: &mut CallStack,
) -> ScriptResult<()> {
    let mut ip = offset;
    loop {
        let op_ip = ip;
        let op = Opcode::from_word(fetch(block, &mut ip)?)
            .map_err(|e| e.at(block.filename(), block.calc_line(op_ip)))?;
        ctx.trace_op(op.name(), block.calc_line(op_ip));
        let signal = dispatch(ctx, block, op, &mut ip, exec, calls)
            .map_err(|e| e.at(block.filename(), block.calc_line(op_ip)))?;
        match signal {
            Signal::Continue => {}
            Signal::Return | Signal::End => return Ok(()),
        }
    }
}

/// Calls the function on top of the call stack (frame already pushed and
/// marked executing; parameters staged).
///
/// Script functions recurse into their block's run loop and finish at
/// `FuncReturn`; native functions dispatch, push their return value, and
/// pop their own frame.
pub(crate) fn invoke_top(
    ctx: &mut ScriptContext,
    current_block: Option<&Rc<CodeBlock>>,
    exec: &mut ExecStack,
    calls: &mut CallStack,
) -> ScriptResult<()> {
    let frame = *calls
        .top()
        .ok_or_else(|| ScriptError::internal("function call with no call frame"))?;

    enum Target {
        Script {
            codeblock_hash: u32,
            offset: usize,
            param_copies: Vec<(u16, Value)>,
        },
        Native {
            dispatcher: NativeFn,
            args: Vec<Value>,
            return_type: VarType,
        },
    }

    let target = {
        let entry = ctx.find_function(frame.ns_hash, frame.func_hash)?;
        match entry.implementation() {
            FunctionImpl::Script {
                codeblock_hash,
                instr_offset,
            } => {
                let context = entry.context();
                let mut param_copies = Vec::with_capacity(context.parameter_count());
                for i in 0..context.parameter_count() {
                    let ve = context
                        .parameter(i)
                        .ok_or_else(|| ScriptError::internal("parameter list out of sync"))?;
                    let offset = ve.stack_offset().ok_or_else(|| {
                        ScriptError::internal(format!("stack offsets not initialized for {}()", entry.name()))
                    })?;
                    param_copies.push((offset, ve.value()?));
                }
                Target::Script {
                    codeblock_hash: *codeblock_hash,
                    offset: *instr_offset,
                    param_copies,
                }
            }
            FunctionImpl::Native { dispatcher } => Target::Native {
                dispatcher: dispatcher.clone(),
                args: entry.collect_arguments()?,
                return_type: entry.context().return_type(),
            },
        }
    };

    match target {
        Target::Script {
            codeblock_hash,
            offset,
            param_copies,
        } => {
            // copy staged parameter values into the reserved frame region;
            // void return slots have no payload and stay zeroed
            for (slot_offset, value) in param_copies {
                if let Some(word) = value.encode_words() {
                    let index = exec.slot_index(frame.stack_base, slot_offset)?;
                    exec.write_slot(index, word)?;
                }
            }

            let block = match current_block {
                Some(b) if b.filename_hash() == codeblock_hash => Rc::clone(b),
                _ => ctx.find_code_block(codeblock_hash)?,
            };
            execute_block(ctx, &block, offset, exec, calls)
        }
        Target::Native {
            dispatcher,
            args,
            return_type,
        } => {
            let object = if frame.object_id != 0 { Some(frame.object_id) } else { None };
            let returned = dispatcher(ctx, object, &args)?;

            // every function pushes exactly one value; void pushes int 0
            let pushed = if return_type == VarType::Void {
                Value::Int(0)
            } else {
                returned.convert(return_type, &mut ctx.string_table)?
            };
            exec.push_value(pushed)?;

            ctx.clear_function_parameters(frame.ns_hash, frame.func_hash)?;
            calls.pop()?;
            Ok(())
        }
    }
}

fn dispatch(
    ctx: &mut ScriptContext,
    block: &Rc<CodeBlock>,
    op: Opcode,
    ip: &mut usize,
    exec: &mut ExecStack,
    calls: &mut CallStack,
) -> ScriptResult<Signal> {
    match op {
        Opcode::Nop => Ok(Signal::Continue),

        Opcode::VarDecl => {
            let hash = fetch(block, ip)?;
            let ty = fetch_type(block, ip)?;
            if let Some(frame) = calls.top().copied() {
                ctx.declare_function_local(frame.ns_hash, frame.func_hash, hash, ty)?;
            } else {
                ctx.declare_global(hash, ty)?;
            }
            Ok(Signal::Continue)
        }

        Opcode::ParamDecl => {
            let hash = fetch(block, ip)?;
            let ty = fetch_type(block, ip)?;
            let frame = calls
                .top()
                .copied()
                .ok_or_else(|| ScriptError::internal("parameter declaration outside a function declaration"))?;
            ctx.declare_function_param(frame.ns_hash, frame.func_hash, hash, ty)?;
            Ok(Signal::Continue)
        }

        Opcode::Push => {
            let ty = fetch_type(block, ip)?;
            let mut payload = smallvec::SmallVec::<[u32; MAX_TYPE_WORDS]>::new();
            for _ in 0..ty.size_words() {
                payload.push(fetch(block, ip)?);
            }
            exec.push_raw(&payload, ty)?;
            Ok(Signal::Continue)
        }

        Opcode::PushParam => {
            let index = fetch(block, ip)? as usize;
            let frame = calls
                .top()
                .copied()
                .ok_or_else(|| ScriptError::resolution("assigning parameters outside a function call"))?;
            let (param_hash, param_count) = {
                let entry = ctx.find_function(frame.ns_hash, frame.func_hash)?;
                let count = entry.context().parameter_count();
                let hash = entry.context().parameter(index).map(|ve| ve.hash());
                (hash, count)
            };
            let Some(param_hash) = param_hash else {
                return Err(ScriptError::resource(format!(
                    "too many parameters in call: index {index} of {param_count}"
                )));
            };
            exec.push_raw(&[frame.ns_hash, frame.func_hash, param_hash], VarType::Var)?;
            Ok(Signal::Continue)
        }

        Opcode::PushLocalVar => {
            let ty_word = fetch(block, ip)?;
            let offset = fetch(block, ip)?;
            exec.push_raw(&[ty_word, offset], VarType::StackVar)?;
            Ok(Signal::Continue)
        }

        Opcode::PushLocalValue => {
            let ty = fetch_type(block, ip)?;
            let offset = fetch(block, ip)? as u16;
            let frame = calls
                .executing()
                .ok_or_else(|| ScriptError::resolution("no executing stack frame for a local variable"))?;
            let index = exec.slot_index(frame.stack_base, offset)?;
            let value = Value::decode_word(ty, exec.read_slot(index)?)?;
            exec.push_value(value)?;
            Ok(Signal::Continue)
        }

        Opcode::PushGlobalVar => {
            let ns = fetch(block, ip)?;
            let func = fetch(block, ip)?;
            let var = fetch(block, ip)?;
            exec.push_raw(&[ns, func, var], VarType::Var)?;
            Ok(Signal::Continue)
        }

        Opcode::PushGlobalValue => {
            let ns = fetch(block, ip)?;
            let func = fetch(block, ip)?;
            let var = fetch(block, ip)?;
            let value = ctx.var_value(ns, func, var, 0)?;
            exec.push_value(value)?;
            Ok(Signal::Continue)
        }

        Opcode::PushArrayVar => {
            let key = pop_array_key(ctx, exec, calls)?;
            let ns = fetch(block, ip)?;
            let func = fetch(block, ip)?;
            let var = fetch(block, ip)?;
            exec.push_raw(&[ns, func, var, key], VarType::HashVar)?;
            Ok(Signal::Continue)
        }

        Opcode::PushArrayValue => {
            let key = pop_array_key(ctx, exec, calls)?;
            let ns = fetch(block, ip)?;
            let func = fetch(block, ip)?;
            let var = fetch(block, ip)?;
            let value = ctx.var_value(ns, func, var, key)?;
            exec.push_value(value)?;
            Ok(Signal::Continue)
        }

        Opcode::PushMember => {
            let member = fetch(block, ip)?;
            let object_id = pop_object_id(ctx, exec, calls)?;
            exec.push_raw(&[member, object_id], VarType::Member)?;
            Ok(Signal::Continue)
        }

        Opcode::PushMemberVal => {
            let member = fetch(block, ip)?;
            let object_id = pop_object_id(ctx, exec, calls)?;
            let value = ctx.member_value(object_id, member)?;
            exec.push_value(value)?;
            Ok(Signal::Continue)
        }

        Opcode::PushPodMember | Opcode::PushPodMemberVal => {
            let member = fetch(block, ip)?;
            let _ = pop_entry(exec)?;
            Err(ScriptError::type_error(format!(
                "POD member {} lookup failed: value has no registered members",
                ctx.string_table.unhash(member)
            )))
        }

        Opcode::PushSelf => {
            let frame = calls
                .executing()
                .filter(|f| f.object_id != 0)
                .ok_or_else(|| ScriptError::resolution("self referenced outside a method"))?;
            let id = frame.object_id;
            exec.push_value(Value::Object(id))?;
            Ok(Signal::Continue)
        }

        Opcode::Pop => {
            exec.pop_raw()?;
            Ok(Signal::Continue)
        }

        Opcode::Add | Opcode::Sub | Opcode::Mult | Opcode::Div | Opcode::Mod => {
            math::exec_numerical_op(ctx, exec, calls, op)?;
            Ok(Signal::Continue)
        }

        Opcode::Assign
        | Opcode::AssignAdd
        | Opcode::AssignSub
        | Opcode::AssignMult
        | Opcode::AssignDiv
        | Opcode::AssignMod => {
            math::exec_assign_op(ctx, exec, calls, op)?;
            Ok(Signal::Continue)
        }

        Opcode::AssignLeftShift
        | Opcode::AssignRightShift
        | Opcode::AssignBitAnd
        | Opcode::AssignBitOr
        | Opcode::AssignBitXor => {
            math::exec_bit_assign_op(ctx, exec, calls, op)?;
            Ok(Signal::Continue)
        }

        Opcode::BitLeftShift | Opcode::BitRightShift | Opcode::BitAnd | Opcode::BitOr | Opcode::BitXor => {
            math::exec_bitwise_op(ctx, exec, calls, op)?;
            Ok(Signal::Continue)
        }

        Opcode::CompareEqual
        | Opcode::CompareNotEqual
        | Opcode::CompareLess
        | Opcode::CompareLessEqual
        | Opcode::CompareGreater
        | Opcode::CompareGreaterEqual => {
            math::exec_compare_op(ctx, exec, calls, op)?;
            Ok(Signal::Continue)
        }

        Opcode::BooleanAnd | Opcode::BooleanOr => {
            math::exec_boolean_op(ctx, exec, calls, op)?;
            Ok(Signal::Continue)
        }

        Opcode::UnaryPreInc
        | Opcode::UnaryPreDec
        | Opcode::UnaryNeg
        | Opcode::UnaryPos
        | Opcode::UnaryBitInvert
        | Opcode::UnaryNot => {
            math::exec_unary_op(ctx, exec, calls, op)?;
            Ok(Signal::Continue)
        }

        Opcode::Branch => {
            let delta = fetch(block, ip)? as i32;
            apply_branch(ip, delta)?;
            Ok(Signal::Continue)
        }

        Opcode::BranchTrue => {
            let delta = fetch(block, ip)? as i32;
            if pop_condition(ctx, exec, calls)? {
                apply_branch(ip, delta)?;
            }
            Ok(Signal::Continue)
        }

        Opcode::BranchFalse => {
            let delta = fetch(block, ip)? as i32;
            if !pop_condition(ctx, exec, calls)? {
                apply_branch(ip, delta)?;
            }
            Ok(Signal::Continue)
        }

        Opcode::FuncDecl => {
            let func_hash = fetch(block, ip)?;
            let ns_hash = fetch(block, ip)?;
            let offset = fetch(block, ip)? as usize;
            ctx.declare_script_function(ns_hash, func_hash, block.filename_hash(), offset)?;
            calls.push(ns_hash, func_hash, 0, exec.top(), block.calc_line(*ip))?;
            Ok(Signal::Continue)
        }

        Opcode::FuncDeclEnd => {
            let frame = calls.pop()?;
            ctx.find_function_mut(frame.ns_hash, frame.func_hash)?
                .context_mut()
                .init_stack_var_offsets();
            Ok(Signal::Continue)
        }

        Opcode::FuncCallArgs => {
            let ns_hash = fetch(block, ip)?;
            let func_hash = fetch(block, ip)?;
            let local_count = {
                let entry = ctx.find_function(ns_hash, func_hash).map_err(|_| {
                    ScriptError::resolution(format!("undefined function: {}()", ctx.string_table.unhash(func_hash)))
                })?;
                entry.is_script().then(|| entry.context().local_count())
            };
            ctx.clear_function_parameters(ns_hash, func_hash)?;
            calls.push(ns_hash, func_hash, 0, exec.top(), block.calc_line(*ip))?;
            if let Some(local_count) = local_count {
                exec.reserve(local_count * MAX_TYPE_WORDS)?;
            }
            Ok(Signal::Continue)
        }

        Opcode::MethodCallArgs => {
            let ns_hash = fetch(block, ip)?;
            let method_hash = fetch(block, ip)?;
            let object_id = pop_object_id(ctx, exec, calls)?;
            let object_ns = ctx
                .objects
                .find(object_id)
                .ok_or_else(|| ScriptError::resolution(format!("unable to find object {object_id}")))?
                .namespace_hash();
            let start_ns = if ns_hash != 0 { ns_hash } else { object_ns };
            let owner_ns = ctx.namespaces.find_method(start_ns, method_hash).ok_or_else(|| {
                ScriptError::resolution(format!(
                    "unable to find method {} for object {object_id}",
                    ctx.string_table.unhash(method_hash)
                ))
            })?;
            let local_count = {
                let entry = ctx.find_function(owner_ns, method_hash)?;
                entry.is_script().then(|| entry.context().local_count())
            };
            ctx.clear_function_parameters(owner_ns, method_hash)?;
            calls.push(owner_ns, method_hash, object_id, exec.top(), block.calc_line(*ip))?;
            if let Some(local_count) = local_count {
                exec.reserve(local_count * MAX_TYPE_WORDS)?;
            }
            Ok(Signal::Continue)
        }

        Opcode::FuncCall => {
            calls.begin_execution()?;
            invoke_top(ctx, Some(block), exec, calls)?;
            Ok(Signal::Continue)
        }

        Opcode::FuncReturn => {
            let frame = calls.pop()?;

            // preserve the return value across the local-region unreserve
            let (payload, ty) = exec.pop_raw()?;
            let local_count = ctx.find_function(frame.ns_hash, frame.func_hash)?.context().local_count();
            exec.unreserve(local_count * MAX_TYPE_WORDS)?;
            exec.push_raw(&payload, ty)?;

            ctx.clear_function_parameters(frame.ns_hash, frame.func_hash)?;
            Ok(Signal::Return)
        }

        Opcode::ArrayHash => {
            let part = pop_value(ctx, exec, calls)?;
            let part_hash = part.convert(VarType::String, &mut ctx.string_table)?;
            let Value::String(part_hash) = part_hash else {
                return Err(ScriptError::internal("string conversion produced a non-string"));
            };
            let text = ctx.string_table.unhash(part_hash);

            let current = pop_value(ctx, exec, calls)?;
            let Value::Int(current) = current else {
                return Err(ScriptError::type_error("array key accumulator must be an int"));
            };

            let mut hash = hash_append(current as u32, "_");
            hash = hash_append(hash, &text);
            exec.push_value(Value::Int(hash as i32))?;
            Ok(Signal::Continue)
        }

        Opcode::ArrayVarDecl => {
            let ty = fetch_type(block, ip)?;
            let key = pop_array_key(ctx, exec, calls)?;
            let popped = pop_entry(exec)?;
            let Popped::Ref(StackRef::Var { ns, func, var, key: 0 }) = popped else {
                return Err(ScriptError::type_error("expected a hashtable variable"));
            };
            ctx.declare_hashtable_entry(ns, func, var, key, ty)?;
            Ok(Signal::Continue)
        }

        Opcode::SelfVarDecl => {
            let var_hash = fetch(block, ip)?;
            let ty = fetch_type(block, ip)?;
            let frame = calls
                .top_method()
                .ok_or_else(|| ScriptError::resolution("cannot declare a self variable outside a method"))?;
            let object_id = frame.object_id;
            ctx.add_dynamic_variable(object_id, var_hash, ty)?;
            Ok(Signal::Continue)
        }

        Opcode::ScheduleBegin => {
            let immediate = fetch(block, ip)? != 0;
            let func = pop_value(ctx, exec, calls)?;
            let Value::Int(func_hash) = func else {
                return Err(ScriptError::type_error("schedule expects a function hash"));
            };
            let object_id = pop_object_id(ctx, exec, calls)?;
            let delay = pop_value(ctx, exec, calls)?;
            let Value::Int(delay) = delay else {
                return Err(ScriptError::type_error("schedule expects an int delay"));
            };
            ctx.scheduler.begin(object_id, delay, func_hash as u32, immediate)?;
            Ok(Signal::Continue)
        }

        Opcode::ScheduleParam => {
            let index = fetch(block, ip)? as usize;
            let value = pop_value(ctx, exec, calls)?;
            ctx.set_schedule_param(index, value)?;
            Ok(Signal::Continue)
        }

        Opcode::ScheduleEnd => {
            let request = ctx.scheduler.end()?;
            if request.immediate {
                let mut sched_context = request.context;
                ctx.execute_scheduled_call(request.object_id, request.func_hash, &mut sched_context)?;
                let returned = sched_context
                    .parameter(0)
                    .ok_or_else(|| ScriptError::internal("scheduled call lost its return slot"))?
                    .value()?;
                exec.push_value(returned)?;
            } else {
                let request_id = request.request_id;
                ctx.scheduler.enqueue(request);
                exec.push_value(Value::Int(request_id))?;
            }
            Ok(Signal::Continue)
        }

        Opcode::CreateObject => {
            let class_hash = fetch(block, ip)?;
            let name = pop_value(ctx, exec, calls)?;
            let name = name.convert(VarType::String, &mut ctx.string_table)?;
            let Value::String(name_hash) = name else {
                return Err(ScriptError::internal("string conversion produced a non-string"));
            };
            let id = ctx.create_object(class_hash, name_hash)?;
            exec.push_value(Value::Object(id))?;
            Ok(Signal::Continue)
        }

        Opcode::DestroyObject => {
            let object_id = pop_object_id(ctx, exec, calls)?;
            ctx.destroy_object(object_id)?;
            Ok(Signal::Continue)
        }

        Opcode::Eof => Ok(Signal::End),
    }
}

fn apply_branch(ip: &mut usize, delta: i32) -> ScriptResult<()> {
    let target = *ip as i64 + i64::from(delta);
    if target < 0 {
        return Err(ScriptError::internal("branch target before the start of the block"));
    }
    *ip = target as usize;
    Ok(())
}

fn pop_condition(ctx: &mut ScriptContext, exec: &mut ExecStack, calls: &CallStack) -> ScriptResult<bool> {
    let value = pop_value(ctx, exec, calls)?;
    match value.convert(VarType::Bool, &mut ctx.string_table)? {
        Value::Bool(b) => Ok(b),
        _ => Err(ScriptError::internal("bool conversion produced a non-bool")),
    }
}

fn pop_object_id(ctx: &mut ScriptContext, exec: &mut ExecStack, calls: &CallStack) -> ScriptResult<u32> {
    let value = pop_value(ctx, exec, calls)?;
    match value {
        Value::Object(id) => Ok(id),
        Value::Int(id) => Ok(id as u32),
        other => Err(ScriptError::type_error(format!(
            "expected an object on the stack, found {}",
            other.var_type().keyword()
        ))),
    }
}

fn pop_array_key(ctx: &mut ScriptContext, exec: &mut ExecStack, calls: &CallStack) -> ScriptResult<u32> {
    let value = pop_value(ctx, exec, calls)?;
    let Value::Int(key) = value else {
        return Err(ScriptError::type_error("hashtable key must resolve to an int hash"));
    };
    Ok(key as u32)
}

/// Convenience for the scheduler and host-call paths: hashes a
/// synthesized parameter name like `_2`.
pub(crate) fn schedule_param_name(index: usize) -> (String, u32) {
    let name = format!("_{index}");
    let hash = hash_string(&name);
    (name, hash)
}
