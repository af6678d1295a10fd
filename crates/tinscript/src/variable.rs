//! Named, typed storage cells.
//!
//! A `VariableEntry` is the unit of storage for globals, parameters,
//! object members, dynamic-bag entries, and hashtable entries. Stack
//! locals are the exception: their entry exists only at compile time to
//! carry a frame offset, and the live value resides in the reserved
//! region of the exec stack.
//!
//! String-typed cells hold the 32-bit hash, never the bytes; writes keep
//! the string-table refcounts balanced. Hashtable cells own a nested
//! table of entries, destroyed recursively with the entry itself.

use indexmap::IndexMap;

use crate::error::{ScriptError, ScriptResult};
use crate::intern::StringTable;
use crate::value::{Value, VarType};

/// Insertion-ordered table of variables keyed by name hash.
///
/// Iteration order is observable (block compilation, diagnostics dumps),
/// so the table preserves declaration order.
pub type VarTable = IndexMap<u32, VariableEntry, ahash::RandomState>;

/// Storage shape behind a variable entry.
#[derive(Debug)]
pub enum VarStorage {
    /// A scalar cell sized to the declared type.
    Cell(Value),
    /// A nested table of entries (hashtable variables).
    Table(VarTable),
    /// Compile-time only: the value lives at a frame-relative offset on
    /// the exec stack of the executing call.
    StackSlot,
}

/// A named, typed storage cell.
#[derive(Debug)]
pub struct VariableEntry {
    name: String,
    hash: u32,
    ty: VarType,
    storage: VarStorage,
    /// Frame-relative slot index; assigned by `init_stack_var_offsets`
    /// for parameters and locals, `None` for everything else.
    stack_offset: Option<u16>,
}

impl VariableEntry {
    /// Creates a script-owned scalar or hashtable entry, zero-initialized.
    #[must_use]
    pub fn new(name: &str, hash: u32, ty: VarType) -> Self {
        let storage = if ty == VarType::HashTable {
            VarStorage::Table(VarTable::default())
        } else {
            VarStorage::Cell(Value::default_for(ty))
        };
        Self {
            name: name.to_owned(),
            hash,
            ty,
            storage,
            stack_offset: None,
        }
    }

    /// Creates a compile-time entry for a function parameter or local.
    #[must_use]
    pub fn new_stack_local(name: &str, hash: u32, ty: VarType) -> Self {
        Self {
            name: name.to_owned(),
            hash,
            ty,
            storage: VarStorage::StackSlot,
            stack_offset: None,
        }
    }

    /// Creates a parameter entry: stack-addressed when the function body
    /// executes, but also carrying a staging cell the caller assigns into
    /// before the call copies values onto the stack.
    #[must_use]
    pub fn new_parameter(name: &str, hash: u32, ty: VarType) -> Self {
        Self {
            name: name.to_owned(),
            hash,
            ty,
            storage: VarStorage::Cell(Value::default_for(ty)),
            stack_offset: None,
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
    pub fn var_type(&self) -> VarType {
        self.ty
    }

    #[must_use]
    pub fn stack_offset(&self) -> Option<u16> {
        self.stack_offset
    }

    pub fn set_stack_offset(&mut self, offset: u16) {
        self.stack_offset = Some(offset);
    }

    /// Reads the scalar value.
    pub fn value(&self) -> ScriptResult<Value> {
        match &self.storage {
            VarStorage::Cell(v) => Ok(*v),
            VarStorage::Table(_) => Err(ScriptError::type_error(format!(
                "hashtable variable {} has no scalar value",
                self.name
            ))),
            VarStorage::StackSlot => Err(ScriptError::internal(format!(
                "stack local {} read through its compile-time entry",
                self.name
            ))),
        }
    }

    /// Writes the scalar value, converting to the declared type and
    /// keeping string refcounts balanced.
    pub fn set_value(&mut self, value: Value, strings: &mut StringTable) -> ScriptResult<()> {
        let converted = value.convert(self.ty, strings)?;
        match &mut self.storage {
            VarStorage::Cell(cell) => {
                if let Value::String(old) = *cell {
                    strings.decrement(old);
                }
                if let Value::String(new) = converted {
                    strings.increment(new);
                }
                *cell = converted;
                Ok(())
            }
            VarStorage::Table(_) => Err(ScriptError::type_error(format!(
                "cannot assign a scalar to hashtable variable {}",
                self.name
            ))),
            VarStorage::StackSlot => Err(ScriptError::internal(format!(
                "stack local {} written through its compile-time entry",
                self.name
            ))),
        }
    }

    /// Adopts the type and value of a scheduled call's result. The only
    /// sanctioned way a cell changes type after creation; used for the
    /// `__resolve`-typed return slot of scheduler contexts.
    pub fn resolve_value(&mut self, value: Value, strings: &mut StringTable) {
        if let VarStorage::Cell(cell) = &mut self.storage {
            if let Value::String(old) = *cell {
                strings.decrement(old);
            }
            if let Value::String(new) = value {
                strings.increment(new);
            }
            self.ty = value.var_type();
            *cell = value;
        }
    }

    /// Resets the cell to the type's zero value (parameter clearing).
    pub fn clear_value(&mut self, strings: &mut StringTable) {
        if let VarStorage::Cell(cell) = &mut self.storage {
            if let Value::String(old) = *cell {
                strings.decrement(old);
            }
            *cell = Value::default_for(self.ty);
        }
    }

    /// The nested entry table of a hashtable variable.
    pub fn table(&self) -> ScriptResult<&VarTable> {
        match &self.storage {
            VarStorage::Table(table) => Ok(table),
            _ => Err(ScriptError::type_error(format!("{} is not a hashtable", self.name))),
        }
    }

    pub fn table_mut(&mut self) -> ScriptResult<&mut VarTable> {
        match &mut self.storage {
            VarStorage::Table(table) => Ok(table),
            _ => Err(ScriptError::type_error(format!("{} is not a hashtable", self.name))),
        }
    }

    /// Releases string references held by this entry and, recursively, by
    /// a hashtable's nested entries. Called before the entry is dropped.
    pub fn release_strings(&mut self, strings: &mut StringTable) {
        match &mut self.storage {
            VarStorage::Cell(cell) => {
                if let Value::String(old) = *cell {
                    strings.decrement(old);
                }
            }
            VarStorage::Table(table) => {
                for (_, entry) in table.iter_mut() {
                    entry.release_strings(strings);
                }
            }
            VarStorage::StackSlot => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_converts_to_declared_type() {
        let mut strings = StringTable::new();
        let mut entry = VariableEntry::new("x", 1, VarType::Int);
        entry.set_value(Value::Float(3.9), &mut strings).unwrap();
        assert_eq!(entry.value().unwrap(), Value::Int(3));
    }

    #[test]
    fn type_is_immutable_after_creation() {
        let mut strings = StringTable::new();
        let mut entry = VariableEntry::new("x", 1, VarType::Int);
        entry.set_value(Value::Bool(true), &mut strings).unwrap();
        assert_eq!(entry.var_type(), VarType::Int);
        assert_eq!(entry.value().unwrap(), Value::Int(1));
    }

    #[test]
    fn string_writes_balance_refcounts() {
        let mut strings = StringTable::new();
        let first = strings.add("first").unwrap();
        let second = strings.add("second").unwrap();

        let mut entry = VariableEntry::new("s", 1, VarType::String);
        entry.set_value(Value::String(first), &mut strings).unwrap();
        entry.set_value(Value::String(second), &mut strings).unwrap();

        // the overwrite released the entry's reference to `first`;
        // releasing the intern-time reference makes it purgeable
        strings.decrement(first);
        strings.purge_unreferenced();
        assert_eq!(strings.get(first), None);
        assert_eq!(strings.get(second), Some("second"));
    }

    #[test]
    fn hashtable_storage_nests() {
        let mut table_var = VariableEntry::new("t", 1, VarType::HashTable);
        table_var
            .table_mut()
            .unwrap()
            .insert(7, VariableEntry::new("entry", 7, VarType::Int));
        assert_eq!(table_var.table().unwrap().len(), 1);
        assert!(table_var.value().is_err());
    }

    #[test]
    fn resolve_adopts_type() {
        let mut strings = StringTable::new();
        let mut entry = VariableEntry::new("ret", 1, VarType::Int);
        entry.resolve_value(Value::Float(1.5), &mut strings);
        assert_eq!(entry.var_type(), VarType::Float);
        assert_eq!(entry.value().unwrap(), Value::Float(1.5));
    }
}
