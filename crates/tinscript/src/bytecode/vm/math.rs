//! Arithmetic, comparison, boolean, bitwise, assignment, and unary
//! opcode implementations.
//!
//! Operands pop in reverse order (RHS first). When either operand is an
//! object only equality and boolean ops are legal; all-integer/bool
//! operand pairs compute in int; anything else promotes to float.
//! Comparisons compute `lhs - rhs` and push a bool from the sign.
//! Boolean and/or are not short-circuited: both operands were already
//! evaluated by the time the opcode runs.

use crate::bytecode::op::Opcode;
use crate::bytecode::vm::resolve::{pop_ref, pop_value, read_ref, ref_type, write_ref};
use crate::bytecode::vm::stack::{CallStack, ExecStack};
use crate::context::ScriptContext;
use crate::error::{ScriptError, ScriptResult};
use crate::value::{Value, VarType};

/// Result of a numeric binary op before it is pushed.
#[derive(Debug, Clone, Copy)]
enum BinResult {
    Int(i64),
    Float(f32),
}

impl BinResult {
    fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Float(f) => f64::from(f),
        }
    }
}

fn int_of(value: Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(i64::from(i)),
        Value::Bool(b) => Some(i64::from(b)),
        _ => None,
    }
}

fn float_of(value: Value) -> Option<f32> {
    match value {
        Value::Int(i) => Some(i as f32),
        Value::Bool(b) => Some(if b { 1.0 } else { 0.0 }),
        Value::Float(f) => Some(f),
        _ => None,
    }
}

/// Modulo with the dividend wrapped positive, matching script semantics.
fn wrapped_mod(lhs: i64, rhs: i64) -> ScriptResult<i64> {
    if rhs == 0 {
        return Err(ScriptError::type_error("mod divide by 0"));
    }
    let divisor = rhs.abs();
    Ok(lhs.rem_euclid(divisor))
}

/// Object operands: only equality and boolean ops, comparing ids and
/// treating existence as truthiness.
fn object_bin_op(ctx: &ScriptContext, op: Opcode, lhs: Value, rhs: Value) -> ScriptResult<i64> {
    let (Value::Object(id0), Value::Object(id1)) = (lhs, rhs) else {
        return Err(ScriptError::type_error(format!(
            "{} requires two object operands",
            op.name()
        )));
    };
    match op {
        Opcode::CompareEqual | Opcode::CompareNotEqual => Ok(i64::from(id0 != id1)),
        Opcode::BooleanAnd => {
            let both = ctx.objects.find(id0).is_some() && ctx.objects.find(id1).is_some();
            Ok(i64::from(both))
        }
        Opcode::BooleanOr => {
            let either = ctx.objects.find(id0).is_some() || ctx.objects.find(id1).is_some();
            Ok(i64::from(either))
        }
        _ => Err(ScriptError::type_error(format!(
            "cannot perform {} on object operands",
            op.name()
        ))),
    }
}

fn int_bin_op(op: Opcode, lhs: i64, rhs: i64) -> ScriptResult<i64> {
    match op {
        Opcode::Add => Ok(lhs.wrapping_add(rhs)),
        Opcode::Sub => Ok(lhs.wrapping_sub(rhs)),
        Opcode::Mult => Ok(lhs.wrapping_mul(rhs)),
        Opcode::Div => {
            if rhs == 0 {
                return Err(ScriptError::type_error("divide by 0"));
            }
            Ok(lhs / rhs)
        }
        Opcode::Mod => wrapped_mod(lhs, rhs),
        Opcode::CompareEqual
        | Opcode::CompareNotEqual
        | Opcode::CompareLess
        | Opcode::CompareLessEqual
        | Opcode::CompareGreater
        | Opcode::CompareGreaterEqual => Ok(lhs - rhs),
        Opcode::BooleanAnd => Ok(i64::from(lhs != 0 && rhs != 0)),
        Opcode::BooleanOr => Ok(i64::from(lhs != 0 || rhs != 0)),
        _ => Err(ScriptError::internal(format!("{} is not an integer binary op", op.name()))),
    }
}

fn float_bin_op(op: Opcode, lhs: f32, rhs: f32) -> ScriptResult<f32> {
    match op {
        Opcode::Add => Ok(lhs + rhs),
        Opcode::Sub => Ok(lhs - rhs),
        Opcode::Mult => Ok(lhs * rhs),
        Opcode::Div => {
            if rhs == 0.0 {
                return Err(ScriptError::type_error("divide by 0"));
            }
            Ok(lhs / rhs)
        }
        Opcode::Mod => Ok(wrapped_mod(lhs as i64, rhs as i64)? as f32),
        Opcode::CompareEqual
        | Opcode::CompareNotEqual
        | Opcode::CompareLess
        | Opcode::CompareLessEqual
        | Opcode::CompareGreater
        | Opcode::CompareGreaterEqual => Ok(lhs - rhs),
        Opcode::BooleanAnd => Ok(if lhs != 0.0 && rhs != 0.0 { 1.0 } else { 0.0 }),
        Opcode::BooleanOr => Ok(if lhs != 0.0 || rhs != 0.0 { 1.0 } else { 0.0 }),
        _ => Err(ScriptError::internal(format!("{} is not a float binary op", op.name()))),
    }
}

/// Pops both operands and combines them per the coercion rules.
fn numerical_bin_op(
    ctx: &mut ScriptContext,
    exec: &mut ExecStack,
    calls: &CallStack,
    op: Opcode,
) -> ScriptResult<BinResult> {
    // values come off the stack in reverse order
    let rhs = pop_value(ctx, exec, calls)?;
    let lhs = pop_value(ctx, exec, calls)?;

    if matches!(lhs, Value::Object(_)) || matches!(rhs, Value::Object(_)) {
        return object_bin_op(ctx, op, lhs, rhs).map(BinResult::Int);
    }

    if let (Some(l), Some(r)) = (int_of(lhs), int_of(rhs)) {
        return int_bin_op(op, l, r).map(BinResult::Int);
    }

    let (Some(l), Some(r)) = (float_of(lhs), float_of(rhs)) else {
        return Err(ScriptError::type_error(format!(
            "{} requires numeric operands",
            op.name()
        )));
    };
    float_bin_op(op, l, r).map(BinResult::Float)
}

/// Add/Sub/Mult/Div/Mod: pushes an int or float result.
pub fn exec_numerical_op(
    ctx: &mut ScriptContext,
    exec: &mut ExecStack,
    calls: &CallStack,
    op: Opcode,
) -> ScriptResult<()> {
    match numerical_bin_op(ctx, exec, calls, op)? {
        BinResult::Int(i) => exec.push_value(Value::Int(i as i32)),
        BinResult::Float(f) => exec.push_value(Value::Float(f)),
    }
}

/// BooleanAnd/BooleanOr: pushes a bool. Both operands were evaluated.
pub fn exec_boolean_op(
    ctx: &mut ScriptContext,
    exec: &mut ExecStack,
    calls: &CallStack,
    op: Opcode,
) -> ScriptResult<()> {
    let result = numerical_bin_op(ctx, exec, calls, op)?;
    exec.push_value(Value::Bool(result.as_f64() != 0.0))
}

/// Compare*: computes `lhs - rhs` and pushes the sign relation.
pub fn exec_compare_op(
    ctx: &mut ScriptContext,
    exec: &mut ExecStack,
    calls: &CallStack,
    op: Opcode,
) -> ScriptResult<()> {
    let diff = numerical_bin_op(ctx, exec, calls, op)?.as_f64();
    let result = match op {
        Opcode::CompareEqual => diff == 0.0,
        Opcode::CompareNotEqual => diff != 0.0,
        Opcode::CompareLess => diff < 0.0,
        Opcode::CompareLessEqual => diff <= 0.0,
        Opcode::CompareGreater => diff > 0.0,
        Opcode::CompareGreaterEqual => diff >= 0.0,
        _ => return Err(ScriptError::internal(format!("{} is not a comparison", op.name()))),
    };
    exec.push_value(Value::Bool(result))
}

/// Bitwise ops: int-only.
pub fn exec_bitwise_op(
    ctx: &mut ScriptContext,
    exec: &mut ExecStack,
    calls: &CallStack,
    op: Opcode,
) -> ScriptResult<()> {
    let rhs = pop_value(ctx, exec, calls)?;
    let lhs = pop_value(ctx, exec, calls)?;
    let (Value::Int(l), Value::Int(r)) = (lhs, rhs) else {
        return Err(ScriptError::type_error(format!("{} requires int operands", op.name())));
    };
    let result = bitwise_combine(op, l, r)?;
    exec.push_value(Value::Int(result))
}

fn bitwise_combine(op: Opcode, lhs: i32, rhs: i32) -> ScriptResult<i32> {
    Ok(match op {
        Opcode::BitLeftShift | Opcode::AssignLeftShift => lhs.wrapping_shl(rhs as u32),
        Opcode::BitRightShift | Opcode::AssignRightShift => lhs.wrapping_shr(rhs as u32),
        Opcode::BitAnd | Opcode::AssignBitAnd => lhs & rhs,
        Opcode::BitOr | Opcode::AssignBitOr => lhs | rhs,
        Opcode::BitXor | Opcode::AssignBitXor => lhs ^ rhs,
        _ => return Err(ScriptError::internal(format!("{} is not a bitwise op", op.name()))),
    })
}

/// Assign and the arithmetic compound-assigns.
///
/// Pops the value, pops the variable reference. Plain `Assign` converts
/// to the target's declared type and stores; compound forms combine via
/// float and convert back.
pub fn exec_assign_op(
    ctx: &mut ScriptContext,
    exec: &mut ExecStack,
    calls: &CallStack,
    op: Opcode,
) -> ScriptResult<()> {
    let value = pop_value(ctx, exec, calls)?;
    let target = pop_ref(exec)?;

    if op == Opcode::Assign {
        return write_ref(ctx, exec, calls, &target, value);
    }

    let current = read_ref(ctx, exec, calls, &target)?;
    let (Some(cur), Some(rhs)) = (float_of_or_convert(ctx, current)?, float_of_or_convert(ctx, value)?) else {
        return Err(ScriptError::type_error(format!("{} requires numeric operands", op.name())));
    };

    let combined = match op {
        Opcode::AssignAdd => cur + rhs,
        Opcode::AssignSub => cur - rhs,
        Opcode::AssignMult => cur * rhs,
        Opcode::AssignDiv => {
            if rhs == 0.0 {
                return Err(ScriptError::type_error("divide by 0"));
            }
            cur / rhs
        }
        Opcode::AssignMod => wrapped_mod(cur as i64, rhs as i64)? as f32,
        _ => return Err(ScriptError::internal(format!("{} is not an assign op", op.name()))),
    };

    let target_type = ref_type(ctx, &target)?;
    let converted = Value::Float(combined).convert(target_type, &mut ctx.string_table)?;
    write_ref(ctx, exec, calls, &target, converted)
}

fn float_of_or_convert(ctx: &mut ScriptContext, value: Value) -> ScriptResult<Option<f32>> {
    if let Some(f) = float_of(value) {
        return Ok(Some(f));
    }
    // strings holding numeric text participate through conversion
    if matches!(value, Value::String(_)) {
        let converted = value.convert(VarType::Float, &mut ctx.string_table)?;
        return Ok(float_of(converted));
    }
    Ok(None)
}

/// The bitwise compound-assigns: combine via int, convert back, store.
pub fn exec_bit_assign_op(
    ctx: &mut ScriptContext,
    exec: &mut ExecStack,
    calls: &CallStack,
    op: Opcode,
) -> ScriptResult<()> {
    let value = pop_value(ctx, exec, calls)?;
    let target = pop_ref(exec)?;

    let current = read_ref(ctx, exec, calls, &target)?;
    let cur = current.convert(VarType::Int, &mut ctx.string_table)?;
    let rhs = value.convert(VarType::Int, &mut ctx.string_table)?;
    let (Value::Int(l), Value::Int(r)) = (cur, rhs) else {
        return Err(ScriptError::type_error(format!("{} requires int operands", op.name())));
    };

    let combined = bitwise_combine(op, l, r)?;
    let target_type = ref_type(ctx, &target)?;
    let converted = Value::Int(combined).convert(target_type, &mut ctx.string_table)?;
    write_ref(ctx, exec, calls, &target, converted)
}

/// The unary ops. Pre-inc/dec write the new value back through the
/// reference before pushing it.
pub fn exec_unary_op(
    ctx: &mut ScriptContext,
    exec: &mut ExecStack,
    calls: &CallStack,
    op: Opcode,
) -> ScriptResult<()> {
    match op {
        Opcode::UnaryPreInc | Opcode::UnaryPreDec => {
            let target = pop_ref(exec)?;
            let current = read_ref(ctx, exec, calls, &target)?;
            let delta = if op == Opcode::UnaryPreInc { 1 } else { -1 };
            let updated = match current {
                Value::Int(i) => Value::Int(i.wrapping_add(delta)),
                Value::Float(f) => Value::Float(f + delta as f32),
                other => {
                    return Err(ScriptError::type_error(format!(
                        "{} supports only int and float, not {}",
                        op.name(),
                        other.var_type().keyword()
                    )));
                }
            };
            write_ref(ctx, exec, calls, &target, updated)?;
            exec.push_value(updated)
        }
        Opcode::UnaryNeg | Opcode::UnaryPos => {
            let value = pop_value(ctx, exec, calls)?;
            let result = match value {
                Value::Int(i) => Value::Int(if op == Opcode::UnaryNeg { i.wrapping_neg() } else { i }),
                Value::Float(f) => Value::Float(if op == Opcode::UnaryNeg { -f } else { f }),
                other => {
                    return Err(ScriptError::type_error(format!(
                        "{} supports only int and float, not {}",
                        op.name(),
                        other.var_type().keyword()
                    )));
                }
            };
            exec.push_value(result)
        }
        Opcode::UnaryBitInvert => {
            let value = pop_value(ctx, exec, calls)?;
            let Value::Int(i) = value else {
                return Err(ScriptError::type_error("~ requires an int operand"));
            };
            exec.push_value(Value::Int(!i))
        }
        Opcode::UnaryNot => {
            let value = pop_value(ctx, exec, calls)?;
            let Value::Bool(b) = value else {
                return Err(ScriptError::type_error("! requires a bool operand"));
            };
            exec.push_value(Value::Bool(!b))
        }
        _ => Err(ScriptError::internal(format!("{} is not a unary op", op.name()))),
    }
}
