//! The object registry: script object ids bound to namespaces, member
//! storage, and the host's native payload.
//!
//! Object ids are monotonically assigned non-zero 32-bit integers. The
//! registry indexes entries by id and by name hash; ambiguous names are
//! allowed, and lookup-by-name returns the last-registered object.

use std::any::Any;

use ahash::AHashMap;

use crate::error::{ScriptError, ScriptResult};
use crate::intern::StringTable;
use crate::value::VarType;
use crate::variable::{VarTable, VariableEntry};

/// One live script object.
pub struct ObjectEntry {
    id: u32,
    name_hash: u32,
    namespace_hash: u32,
    /// Opaque payload produced by the registered class constructor.
    native: Option<Box<dyn Any>>,
    /// Storage for declared class members, materialized from the
    /// namespace chain's member declarations at creation.
    members: VarTable,
    /// The dynamic variable bag (`self.var` declarations and
    /// `AddDynamicVariable`).
    dynamic_vars: VarTable,
}

impl std::fmt::Debug for ObjectEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectEntry")
            .field("id", &self.id)
            .field("name_hash", &self.name_hash)
            .field("namespace_hash", &self.namespace_hash)
            .field("members", &self.members.len())
            .field("dynamic_vars", &self.dynamic_vars.len())
            .finish_non_exhaustive()
    }
}

impl ObjectEntry {
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn name_hash(&self) -> u32 {
        self.name_hash
    }

    #[must_use]
    pub fn namespace_hash(&self) -> u32 {
        self.namespace_hash
    }

    /// Borrows the native payload, downcast to the registered class type.
    #[must_use]
    pub fn native<T: 'static>(&self) -> Option<&T> {
        self.native.as_ref()?.downcast_ref::<T>()
    }

    pub fn native_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.native.as_mut()?.downcast_mut::<T>()
    }

    pub(crate) fn take_native(&mut self) -> Option<Box<dyn Any>> {
        self.native.take()
    }

    /// Finds a member or dynamic-bag entry by name hash.
    #[must_use]
    pub fn variable(&self, var_hash: u32) -> Option<&VariableEntry> {
        self.members.get(&var_hash).or_else(|| self.dynamic_vars.get(&var_hash))
    }

    pub fn variable_mut(&mut self, var_hash: u32) -> Option<&mut VariableEntry> {
        if self.members.contains_key(&var_hash) {
            return self.members.get_mut(&var_hash);
        }
        self.dynamic_vars.get_mut(&var_hash)
    }

    /// Adds a dynamic variable; re-adding an existing name with the same
    /// type is a no-op, with a different type an error.
    pub fn add_dynamic_variable(&mut self, name: &str, var_hash: u32, ty: VarType) -> ScriptResult<()> {
        if let Some(existing) = self.variable(var_hash) {
            if existing.var_type() == ty {
                return Ok(());
            }
            return Err(ScriptError::type_error(format!(
                "dynamic variable {name} already exists as {}",
                existing.var_type().keyword()
            )));
        }
        self.dynamic_vars.insert(var_hash, VariableEntry::new(name, var_hash, ty));
        Ok(())
    }

    /// Releases string references held by member and dynamic storage.
    pub(crate) fn release_strings(&mut self, strings: &mut StringTable) {
        for (_, entry) in &mut self.members {
            entry.release_strings(strings);
        }
        for (_, entry) in &mut self.dynamic_vars {
            entry.release_strings(strings);
        }
    }
}

/// Id/name dictionaries over all live objects.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: AHashMap<u32, ObjectEntry>,
    /// name hash -> id; last registered wins on collision.
    by_name: AHashMap<u32, u32>,
    next_id: u32,
}

impl ObjectRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new object, materializing its member storage from the
    /// given declarations, and returns its fresh id.
    pub fn create(
        &mut self,
        name_hash: u32,
        namespace_hash: u32,
        native: Option<Box<dyn Any>>,
        member_decls: &[(String, u32, VarType)],
    ) -> u32 {
        self.next_id += 1;
        let id = self.next_id;
        let mut members = VarTable::default();
        for (name, hash, ty) in member_decls {
            members.insert(*hash, VariableEntry::new(name, *hash, *ty));
        }
        self.objects.insert(
            id,
            ObjectEntry {
                id,
                name_hash,
                namespace_hash,
                native,
                members,
                dynamic_vars: VarTable::default(),
            },
        );
        if name_hash != 0 {
            self.by_name.insert(name_hash, id);
        }
        id
    }

    #[must_use]
    pub fn find(&self, id: u32) -> Option<&ObjectEntry> {
        self.objects.get(&id)
    }

    pub fn find_mut(&mut self, id: u32) -> Option<&mut ObjectEntry> {
        self.objects.get_mut(&id)
    }

    /// Looks up by name hash; the last-registered object wins.
    #[must_use]
    pub fn find_by_name(&self, name_hash: u32) -> Option<&ObjectEntry> {
        let id = *self.by_name.get(&name_hash)?;
        self.objects.get(&id)
    }

    /// Removes an object from all indices, returning the entry.
    pub fn remove(&mut self, id: u32) -> Option<ObjectEntry> {
        let entry = self.objects.remove(&id)?;
        if let Some(&indexed) = self.by_name.get(&entry.name_hash) {
            if indexed == id {
                self.by_name.remove(&entry.name_hash);
            }
        }
        Some(entry)
    }

    /// Iterates live objects in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &ObjectEntry> {
        self.objects.values()
    }

    /// Ids of every live object, for bulk teardown.
    #[must_use]
    pub fn ids(&self) -> Vec<u32> {
        self.objects.keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_string;

    #[test]
    fn ids_are_monotonic_and_non_zero() {
        let mut registry = ObjectRegistry::new();
        let a = registry.create(0, 0, None, &[]);
        let b = registry.create(0, 0, None, &[]);
        assert!(a > 0);
        assert_eq!(b, a + 1);
    }

    #[test]
    fn name_lookup_last_registered_wins() {
        let mut registry = ObjectRegistry::new();
        let name = hash_string("turret");
        let first = registry.create(name, 0, None, &[]);
        let second = registry.create(name, 0, None, &[]);
        assert_eq!(registry.find_by_name(name).unwrap().id(), second);

        registry.remove(second);
        // first still exists but the name index pointed at the removed one
        assert!(registry.find(first).is_some());
        assert!(registry.find_by_name(name).is_none());
    }

    #[test]
    fn member_storage_materializes_from_decls() {
        let mut registry = ObjectRegistry::new();
        let decls = vec![("value".to_owned(), hash_string("value"), VarType::Int)];
        let id = registry.create(0, hash_string("Counter"), None, &decls);
        let entry = registry.find(id).unwrap();
        assert!(entry.variable(hash_string("value")).is_some());
    }

    #[test]
    fn dynamic_variable_type_conflict_errors() {
        let mut registry = ObjectRegistry::new();
        let id = registry.create(0, 0, None, &[]);
        let entry = registry.find_mut(id).unwrap();
        let hash = hash_string("hp");
        entry.add_dynamic_variable("hp", hash, VarType::Int).unwrap();
        entry.add_dynamic_variable("hp", hash, VarType::Int).unwrap();
        assert!(entry.add_dynamic_variable("hp", hash, VarType::Float).is_err());
    }
}
