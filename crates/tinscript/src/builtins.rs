//! The default host functions every context registers at construction.

use crate::context::ScriptContext;
use crate::error::{ScriptError, ScriptResult};
use crate::value::{Value, VarType};

/// Registers the baseline builtins; invoked once by `ScriptContext::new`.
pub(crate) fn register_builtins(ctx: &mut ScriptContext) -> ScriptResult<()> {
    ctx.register_function("Print", &[VarType::String], VarType::Void, |ctx, _obj, args| {
        let text = args[0].to_display(&ctx.string_table);
        ctx.print(&text);
        Ok(Value::Void)
    })?;

    ctx.register_function("IsObject", &[VarType::Object], VarType::Bool, |ctx, _obj, args| {
        let Value::Object(id) = args[0] else {
            return Err(ScriptError::internal("IsObject argument was not converted to object"));
        };
        Ok(Value::Bool(ctx.find_object(id).is_some()))
    })?;

    ctx.register_function(
        "FindObjectByName",
        &[VarType::String],
        VarType::Object,
        |ctx, _obj, args| {
            let Value::String(name_hash) = args[0] else {
                return Err(ScriptError::internal("FindObjectByName argument was not a string"));
            };
            let name = ctx.string_table.unhash(name_hash);
            let id = ctx.find_object_by_name(&name).map_or(0, |entry| entry.id());
            Ok(Value::Object(id))
        },
    )?;

    ctx.register_function("ObjectGetName", &[VarType::Object], VarType::String, |ctx, _obj, args| {
        let Value::Object(id) = args[0] else {
            return Err(ScriptError::internal("ObjectGetName argument was not an object"));
        };
        let name_hash = ctx
            .find_object(id)
            .ok_or_else(|| ScriptError::resolution(format!("unable to find object {id}")))?
            .name_hash();
        Ok(Value::String(name_hash))
    })?;

    ctx.register_function("ScheduleCancel", &[VarType::Int], VarType::Void, |ctx, _obj, args| {
        let Value::Int(request_id) = args[0] else {
            return Err(ScriptError::internal("ScheduleCancel argument was not an int"));
        };
        ctx.cancel_schedule(request_id);
        Ok(Value::Void)
    })?;

    ctx.register_function(
        "ScheduleCancelObject",
        &[VarType::Object],
        VarType::Void,
        |ctx, _obj, args| {
            let Value::Object(id) = args[0] else {
                return Err(ScriptError::internal("ScheduleCancelObject argument was not an object"));
            };
            ctx.cancel_object_schedules(id);
            Ok(Value::Void)
        },
    )?;

    ctx.register_function(
        "AddDynamicVariable",
        &[VarType::Object, VarType::String, VarType::String],
        VarType::Void,
        |ctx, _obj, args| {
            let (Value::Object(id), Value::String(name_hash), Value::String(type_hash)) = (args[0], args[1], args[2])
            else {
                return Err(ScriptError::internal("AddDynamicVariable arguments were not converted"));
            };
            let type_name = ctx.string_table.unhash(type_hash);
            let ty = VarType::from_keyword(&type_name)
                .ok_or_else(|| ScriptError::type_error(format!("unknown variable type {type_name}")))?;
            let name = ctx.string_table.unhash(name_hash);
            ctx.add_dynamic_variable_named(id, &name, ty)?;
            Ok(Value::Void)
        },
    )?;

    ctx.register_function(
        "LinkNamespaces",
        &[VarType::String, VarType::String],
        VarType::Void,
        |ctx, _obj, args| {
            let (Value::String(child_hash), Value::String(parent_hash)) = (args[0], args[1]) else {
                return Err(ScriptError::internal("LinkNamespaces arguments were not strings"));
            };
            let child = ctx.string_table.unhash(child_hash);
            let parent = ctx.string_table.unhash(parent_hash);
            ctx.link_namespaces(&child, &parent)?;
            Ok(Value::Void)
        },
    )?;

    ctx.register_function("ListObjects", &[], VarType::Void, |ctx, _obj, _args| {
        let lines: Vec<String> = ctx
            .objects
            .iter()
            .map(|entry| {
                format!(
                    "[{}] {} ({})",
                    entry.id(),
                    ctx.string_table.unhash(entry.name_hash()),
                    ctx.string_table.unhash(entry.namespace_hash()),
                )
            })
            .collect();
        for line in lines {
            ctx.print(&line);
        }
        Ok(Value::Void)
    })?;

    ctx.register_function("ListSchedules", &[], VarType::Void, |ctx, _obj, _args| {
        let lines: Vec<String> = ctx
            .scheduler
            .pending_summary()
            .into_iter()
            .map(|(request_id, fire_time, object_id, func_hash)| {
                format!(
                    "[{request_id}] at {fire_time}ms: {} (object {object_id})",
                    ctx.string_table.unhash(func_hash),
                )
            })
            .collect();
        for line in lines {
            ctx.print(&line);
        }
        Ok(Value::Void)
    })?;

    Ok(())
}
