//! Function contexts and function entries.
//!
//! A `FunctionContext` is the ordered parameter list plus local-variable
//! table of one function; parameter 0 is always the return slot. A
//! `FunctionEntry` binds a name hash in some namespace to either a script
//! body (codeblock hash + instruction offset) or a native dispatcher.

use std::rc::Rc;

use crate::context::ScriptContext;
use crate::error::{ScriptError, ScriptResult};
use crate::hash::hash_string;
use crate::intern::StringTable;
use crate::value::{Value, VarType};
use crate::variable::{VarTable, VariableEntry};

/// Parameter limit per function, including the return slot.
pub const MAX_PARAMETER_COUNT: usize = 16;

/// Local-variable limit per function (parameters included).
pub const MAX_LOCAL_COUNT: usize = 37;

/// Name of the implicit return parameter (index 0).
pub const RETURN_PARAM_NAME: &str = "__return";

/// Host function signature: context, `self` object id for methods, and the
/// declared parameter values in order (excluding the return slot).
pub type NativeFn = Rc<dyn Fn(&mut ScriptContext, Option<u32>, &[Value]) -> ScriptResult<Value>>;

/// Ordered parameters plus the local-variable table of one function.
#[derive(Debug, Default)]
pub struct FunctionContext {
    /// Parameter name hashes in declaration order; index 0 is the return
    /// slot. The entries themselves live in `locals`.
    parameters: smallvec::SmallVec<[u32; MAX_PARAMETER_COUNT]>,
    /// All parameter and local entries, keyed by name hash.
    locals: VarTable,
}

impl FunctionContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context whose return slot is already declared.
    #[must_use]
    pub fn with_return_type(ty: VarType) -> Self {
        let mut ctx = Self::new();
        ctx.add_parameter(RETURN_PARAM_NAME, hash_string(RETURN_PARAM_NAME), ty)
            .expect("return slot always fits");
        ctx
    }

    /// Appends a parameter. The first parameter added is the return slot.
    pub fn add_parameter(&mut self, name: &str, hash: u32, ty: VarType) -> ScriptResult<()> {
        if self.parameters.len() >= MAX_PARAMETER_COUNT {
            return Err(ScriptError::resource(format!(
                "parameter count exceeds {MAX_PARAMETER_COUNT}"
            )));
        }
        if self.locals.contains_key(&hash) {
            return Err(ScriptError::compile(format!("duplicate parameter: {name}")));
        }
        self.parameters.push(hash);
        self.locals.insert(hash, VariableEntry::new_parameter(name, hash, ty));
        Ok(())
    }

    /// Declares a parameter at a specific index, growing the list with
    /// placeholders as needed. Only the scheduler builds contexts this
    /// way, inferring each parameter's type from the pushed value.
    pub fn add_parameter_at(&mut self, index: usize, name: &str, hash: u32, ty: VarType) -> ScriptResult<()> {
        if index >= MAX_PARAMETER_COUNT {
            return Err(ScriptError::resource(format!(
                "parameter count exceeds {MAX_PARAMETER_COUNT}"
            )));
        }
        while self.parameters.len() <= index {
            self.parameters.push(0);
        }
        self.parameters[index] = hash;
        self.locals.insert(hash, VariableEntry::new_parameter(name, hash, ty));
        Ok(())
    }

    /// Declares a function-local variable.
    pub fn add_local(&mut self, name: &str, hash: u32, ty: VarType) -> ScriptResult<()> {
        if self.locals.len() >= MAX_LOCAL_COUNT {
            return Err(ScriptError::resource(format!("local variable count exceeds {MAX_LOCAL_COUNT}")));
        }
        if self.locals.contains_key(&hash) {
            return Err(ScriptError::compile(format!("duplicate local variable: {name}")));
        }
        // hashtable locals are entry-addressed (a stack slot cannot hold
        // an entry table); scalars resolve through the frame
        let entry = if ty == VarType::HashTable {
            VariableEntry::new(name, hash, ty)
        } else {
            VariableEntry::new_stack_local(name, hash, ty)
        };
        self.locals.insert(hash, entry);
        Ok(())
    }

    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    #[must_use]
    pub fn parameter(&self, index: usize) -> Option<&VariableEntry> {
        let hash = *self.parameters.get(index)?;
        self.locals.get(&hash)
    }

    pub fn parameter_mut(&mut self, index: usize) -> Option<&mut VariableEntry> {
        let hash = *self.parameters.get(index)?;
        self.locals.get_mut(&hash)
    }

    #[must_use]
    pub fn is_parameter(&self, hash: u32) -> bool {
        self.parameters.contains(&hash)
    }

    #[must_use]
    pub fn local(&self, hash: u32) -> Option<&VariableEntry> {
        self.locals.get(&hash)
    }

    pub fn local_mut(&mut self, hash: u32) -> Option<&mut VariableEntry> {
        self.locals.get_mut(&hash)
    }

    #[must_use]
    pub fn locals(&self) -> &VarTable {
        &self.locals
    }

    /// Number of stack slots a call to this function reserves.
    #[must_use]
    pub fn local_count(&self) -> usize {
        self.locals.len()
    }

    /// The declared return type (parameter 0), `Void` when undeclared.
    #[must_use]
    pub fn return_type(&self) -> VarType {
        self.parameter(0).map_or(VarType::Void, VariableEntry::var_type)
    }

    /// Assigns each parameter and local a consecutive frame slot.
    ///
    /// Runs at function-declaration end; the offsets it assigns are the
    /// ones `__stackvar` references resolve against on every call.
    pub fn init_stack_var_offsets(&mut self) {
        let mut offset: u16 = 0;
        for i in 0..self.parameters.len() {
            let hash = self.parameters[i];
            if let Some(entry) = self.locals.get_mut(&hash) {
                if entry.stack_offset().is_none() {
                    entry.set_stack_offset(offset);
                }
                offset += 1;
            }
        }
        let param_hashes: Vec<u32> = self.parameters.iter().copied().collect();
        for (hash, entry) in &mut self.locals {
            if param_hashes.contains(hash) {
                continue;
            }
            if entry.stack_offset().is_none() {
                entry.set_stack_offset(offset);
            }
            offset += 1;
        }
    }

    /// Zeroes every parameter cell, releasing string references.
    ///
    /// Calling a function without passing a parameter value is the same
    /// as passing 0; this also keeps the string table clear of values
    /// from completed calls.
    pub fn clear_parameters(&mut self, strings: &mut StringTable) {
        for i in 0..self.parameters.len() {
            let hash = self.parameters[i];
            if let Some(entry) = self.locals.get_mut(&hash) {
                entry.clear_value(strings);
            }
        }
    }
}

/// How a function entry is implemented.
pub enum FunctionImpl {
    /// Bytecode within a codeblock, located by filename hash + word offset.
    /// The offset is patched when the declaring `FuncDecl` executes.
    Script { codeblock_hash: u32, instr_offset: usize },
    /// A host function behind a dispatcher closure.
    Native { dispatcher: NativeFn },
}

impl std::fmt::Debug for FunctionImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Script {
                codeblock_hash,
                instr_offset,
            } => f
                .debug_struct("Script")
                .field("codeblock_hash", codeblock_hash)
                .field("instr_offset", instr_offset)
                .finish(),
            Self::Native { .. } => f.debug_struct("Native").finish_non_exhaustive(),
        }
    }
}

/// A named function in a namespace: context plus implementation.
#[derive(Debug)]
pub struct FunctionEntry {
    name: String,
    hash: u32,
    namespace_hash: u32,
    context: FunctionContext,
    implementation: FunctionImpl,
}

impl FunctionEntry {
    /// Creates a script function entry with an unpatched body offset.
    #[must_use]
    pub fn new_script(name: &str, hash: u32, namespace_hash: u32) -> Self {
        Self {
            name: name.to_owned(),
            hash,
            namespace_hash,
            context: FunctionContext::new(),
            implementation: FunctionImpl::Script {
                codeblock_hash: 0,
                instr_offset: 0,
            },
        }
    }

    /// Creates a native function entry from a declared signature and a
    /// dispatcher closure.
    #[must_use]
    pub fn new_native(name: &str, hash: u32, namespace_hash: u32, context: FunctionContext, dispatcher: NativeFn) -> Self {
        Self {
            name: name.to_owned(),
            hash,
            namespace_hash,
            context,
            implementation: FunctionImpl::Native { dispatcher },
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn hash(&self) -> u32 {
        self.hash
    }

    #[must_use]
    pub fn namespace_hash(&self) -> u32 {
        self.namespace_hash
    }

    #[must_use]
    pub fn is_script(&self) -> bool {
        matches!(self.implementation, FunctionImpl::Script { .. })
    }

    #[must_use]
    pub fn context(&self) -> &FunctionContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut FunctionContext {
        &mut self.context
    }

    #[must_use]
    pub fn implementation(&self) -> &FunctionImpl {
        &self.implementation
    }

    /// Points a script function at its body.
    pub fn set_codeblock_offset(&mut self, codeblock_hash: u32, offset: usize) -> ScriptResult<()> {
        match &mut self.implementation {
            FunctionImpl::Script {
                codeblock_hash: cb,
                instr_offset,
            } => {
                *cb = codeblock_hash;
                *instr_offset = offset;
                Ok(())
            }
            FunctionImpl::Native { .. } => Err(ScriptError::compile(format!(
                "there is already a registered native function {}()",
                self.name
            ))),
        }
    }

    /// The codeblock hash a script function's body lives in (0 = none).
    #[must_use]
    pub fn codeblock_hash(&self) -> u32 {
        match &self.implementation {
            FunctionImpl::Script { codeblock_hash, .. } => *codeblock_hash,
            FunctionImpl::Native { .. } => 0,
        }
    }

    /// Reads the staged parameter values 1..N as plain values.
    pub fn collect_arguments(&self) -> ScriptResult<Vec<Value>> {
        let mut args = Vec::with_capacity(self.context.parameter_count().saturating_sub(1));
        for i in 1..self.context.parameter_count() {
            let entry = self
                .context
                .parameter(i)
                .ok_or_else(|| ScriptError::internal("parameter list out of sync"))?;
            args.push(entry.value()?);
        }
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_slot_is_parameter_zero() {
        let ctx = FunctionContext::with_return_type(VarType::Int);
        assert_eq!(ctx.parameter_count(), 1);
        assert_eq!(ctx.return_type(), VarType::Int);
    }

    #[test]
    fn stack_offsets_are_consecutive_and_stable() {
        let mut ctx = FunctionContext::with_return_type(VarType::Int);
        ctx.add_parameter("a", hash_string("a"), VarType::Int).unwrap();
        ctx.add_parameter("b", hash_string("b"), VarType::Float).unwrap();
        ctx.add_local("tmp", hash_string("tmp"), VarType::Int).unwrap();
        ctx.init_stack_var_offsets();

        let offsets: Vec<u16> = (0..3)
            .map(|i| ctx.parameter(i).unwrap().stack_offset().unwrap())
            .collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        assert_eq!(ctx.local(hash_string("tmp")).unwrap().stack_offset(), Some(3));

        // re-running assigns identical offsets
        ctx.init_stack_var_offsets();
        assert_eq!(ctx.local(hash_string("tmp")).unwrap().stack_offset(), Some(3));
    }

    #[test]
    fn parameter_limit_is_enforced() {
        let mut ctx = FunctionContext::new();
        for i in 0..MAX_PARAMETER_COUNT {
            let name = format!("p{i}");
            ctx.add_parameter(&name, hash_string(&name), VarType::Int).unwrap();
        }
        let err = ctx.add_parameter("overflow", hash_string("overflow"), VarType::Int);
        assert!(err.is_err());
    }

    #[test]
    fn clear_parameters_zeroes_staged_values() {
        let mut strings = StringTable::new();
        let mut ctx = FunctionContext::with_return_type(VarType::Void);
        ctx.add_parameter("a", hash_string("a"), VarType::Int).unwrap();
        ctx.parameter_mut(1)
            .unwrap()
            .set_value(Value::Int(9), &mut strings)
            .unwrap();
        ctx.clear_parameters(&mut strings);
        assert_eq!(ctx.parameter(1).unwrap().value().unwrap(), Value::Int(0));
    }
}
