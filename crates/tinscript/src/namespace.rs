//! Namespaces: named bags of members and methods, chained by single
//! inheritance.
//!
//! The namespace dictionary is keyed by name hash; hash 0 is the global
//! namespace, which owns every global variable and unnamespaced function.
//! Method and member lookup walks the parent chain. Class registrations
//! record their parent by name and are hooked up in passes before
//! execution; a pass that makes no progress means a missing parent or a
//! cycle, which is fatal.

use std::any::Any;
use std::rc::Rc;

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::error::{ScriptError, ScriptResult};
use crate::function::FunctionEntry;
use crate::value::VarType;
use crate::variable::VarTable;

/// Insertion-ordered table of functions keyed by name hash.
pub type FuncTable = IndexMap<u32, FunctionEntry, ahash::RandomState>;

/// Host constructor: produces the native payload for a new object.
pub type CreateFn = Rc<dyn Fn() -> Box<dyn Any>>;

/// Host destructor: consumes the native payload of a destroyed object.
pub type DestroyFn = Rc<dyn Fn(Box<dyn Any>)>;

/// Hash of the global namespace (the empty name).
pub const GLOBAL_NS_HASH: u32 = 0;

/// A named bag of member declarations and methods, optionally chained to
/// a parent namespace and optionally backed by a registered class.
pub struct Namespace {
    name: String,
    hash: u32,
    parent: Option<u32>,
    /// Member declarations: name/type templates materialized into every
    /// created object of this class.
    members: VarTable,
    methods: FuncTable,
    create_fn: Option<CreateFn>,
    destroy_fn: Option<DestroyFn>,
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .field("hash", &self.hash)
            .field("parent", &self.parent)
            .field("members", &self.members.len())
            .field("methods", &self.methods.len())
            .finish_non_exhaustive()
    }
}

impl Namespace {
    #[must_use]
    pub fn new(name: &str, hash: u32) -> Self {
        Self {
            name: name.to_owned(),
            hash,
            parent: None,
            members: VarTable::default(),
            methods: FuncTable::default(),
            create_fn: None,
            destroy_fn: None,
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
    pub fn parent(&self) -> Option<u32> {
        self.parent
    }

    #[must_use]
    pub fn members(&self) -> &VarTable {
        &self.members
    }

    pub fn members_mut(&mut self) -> &mut VarTable {
        &mut self.members
    }

    #[must_use]
    pub fn methods(&self) -> &FuncTable {
        &self.methods
    }

    pub fn methods_mut(&mut self) -> &mut FuncTable {
        &mut self.methods
    }

    #[must_use]
    pub fn create_fn(&self) -> Option<&CreateFn> {
        self.create_fn.as_ref()
    }

    #[must_use]
    pub fn destroy_fn(&self) -> Option<&DestroyFn> {
        self.destroy_fn.as_ref()
    }

    pub fn set_class_fns(&mut self, create: Option<CreateFn>, destroy: Option<DestroyFn>) {
        self.create_fn = create;
        self.destroy_fn = destroy;
    }
}

/// A class registration awaiting parent hookup.
#[derive(Debug, Clone)]
struct PendingLink {
    child_hash: u32,
    parent_hash: u32,
    child_name: String,
    parent_name: String,
}

/// The namespace dictionary plus deferred parent links.
#[derive(Debug, Default)]
pub struct Namespaces {
    table: AHashMap<u32, Namespace>,
    pending_links: Vec<PendingLink>,
}

impl Namespaces {
    /// Creates the dictionary with the global namespace present.
    #[must_use]
    pub fn new() -> Self {
        let mut namespaces = Self::default();
        namespaces.table.insert(GLOBAL_NS_HASH, Namespace::new("", GLOBAL_NS_HASH));
        namespaces
    }

    #[must_use]
    pub fn find(&self, hash: u32) -> Option<&Namespace> {
        self.table.get(&hash)
    }

    pub fn find_mut(&mut self, hash: u32) -> Option<&mut Namespace> {
        self.table.get_mut(&hash)
    }

    #[must_use]
    pub fn global(&self) -> &Namespace {
        &self.table[&GLOBAL_NS_HASH]
    }

    pub fn global_mut(&mut self) -> &mut Namespace {
        self.table.get_mut(&GLOBAL_NS_HASH).expect("global namespace always exists")
    }

    /// Finds a namespace, creating an empty one when absent.
    pub fn find_or_create(&mut self, name: &str, hash: u32) -> &mut Namespace {
        self.table.entry(hash).or_insert_with(|| Namespace::new(name, hash))
    }

    /// Records a parent link for later hookup.
    pub fn defer_link(&mut self, child_name: &str, child_hash: u32, parent_name: &str, parent_hash: u32) {
        self.pending_links.push(PendingLink {
            child_hash,
            parent_hash,
            child_name: child_name.to_owned(),
            parent_name: parent_name.to_owned(),
        });
    }

    /// Links a child namespace to its parent immediately.
    ///
    /// Fails when either side is missing or the link would close a cycle.
    pub fn link(&mut self, child_hash: u32, parent_hash: u32) -> ScriptResult<()> {
        if self.table.get(&parent_hash).is_none() {
            return Err(ScriptError::link("parent namespace is not registered"));
        }
        // walking up from the parent must never reach the child
        let mut cursor = Some(parent_hash);
        while let Some(hash) = cursor {
            if hash == child_hash {
                return Err(ScriptError::link("namespace inheritance would form a cycle"));
            }
            cursor = self.table.get(&hash).and_then(Namespace::parent);
        }
        let child = self
            .table
            .get_mut(&child_hash)
            .ok_or_else(|| ScriptError::link("child namespace is not registered"))?;
        child.parent = Some(parent_hash);
        Ok(())
    }

    /// Hooks up every deferred link, iterating until the list drains or a
    /// pass makes no progress (missing parent or cycle).
    pub fn hookup_pending(&mut self) -> ScriptResult<()> {
        while !self.pending_links.is_empty() {
            let before = self.pending_links.len();
            let links = std::mem::take(&mut self.pending_links);
            for link in links {
                if self.table.contains_key(&link.parent_hash) {
                    self.link(link.child_hash, link.parent_hash)
                        .map_err(|e| ScriptError::link(format!("{} -> {}: {}", link.child_name, link.parent_name, e.message)))?;
                } else {
                    self.pending_links.push(link);
                }
            }
            if self.pending_links.len() == before {
                let names: Vec<String> = self
                    .pending_links
                    .iter()
                    .map(|l| format!("{} -> {}", l.child_name, l.parent_name))
                    .collect();
                return Err(ScriptError::link(format!(
                    "namespace hookup made no progress (missing parent or cycle): {}",
                    names.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Hashes of every registered namespace, the global one included.
    #[must_use]
    pub fn known_hashes(&self) -> Vec<u32> {
        self.table.keys().copied().collect()
    }

    /// Resolves a method by walking the parent chain from `start_ns`.
    /// Returns the hash of the namespace that owns the match.
    #[must_use]
    pub fn find_method(&self, start_ns: u32, func_hash: u32) -> Option<u32> {
        let mut cursor = Some(start_ns);
        while let Some(ns_hash) = cursor {
            let ns = self.table.get(&ns_hash)?;
            if ns.methods.contains_key(&func_hash) {
                return Some(ns_hash);
            }
            cursor = ns.parent;
        }
        None
    }

    /// Resolves a member declaration by walking the parent chain.
    #[must_use]
    pub fn find_member_decl(&self, start_ns: u32, var_hash: u32) -> Option<VarType> {
        let mut cursor = Some(start_ns);
        while let Some(ns_hash) = cursor {
            let ns = self.table.get(&ns_hash)?;
            if let Some(entry) = ns.members.get(&var_hash) {
                return Some(entry.var_type());
            }
            cursor = ns.parent;
        }
        None
    }

    /// Collects all member declarations along the chain, most-derived
    /// first. Used to materialize a new object's member storage.
    #[must_use]
    pub fn collect_member_decls(&self, start_ns: u32) -> Vec<(String, u32, VarType)> {
        let mut decls = Vec::new();
        let mut cursor = Some(start_ns);
        while let Some(ns_hash) = cursor {
            let Some(ns) = self.table.get(&ns_hash) else { break };
            for (hash, entry) in &ns.members {
                if !decls.iter().any(|(_, h, _)| h == hash) {
                    decls.push((entry.name().to_owned(), *hash, entry.var_type()));
                }
            }
            cursor = ns.parent;
        }
        decls
    }

    /// The most-derived constructor registered along the chain.
    #[must_use]
    pub fn find_create_fn(&self, start_ns: u32) -> Option<CreateFn> {
        let mut cursor = Some(start_ns);
        while let Some(ns_hash) = cursor {
            let ns = self.table.get(&ns_hash)?;
            if let Some(create) = &ns.create_fn {
                return Some(create.clone());
            }
            cursor = ns.parent;
        }
        None
    }

    /// The most-derived destructor registered along the chain.
    #[must_use]
    pub fn find_destroy_fn(&self, start_ns: u32) -> Option<DestroyFn> {
        let mut cursor = Some(start_ns);
        while let Some(ns_hash) = cursor {
            let ns = self.table.get(&ns_hash)?;
            if let Some(destroy) = &ns.destroy_fn {
                return Some(destroy.clone());
            }
            cursor = ns.parent;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_string;

    #[test]
    fn global_namespace_exists() {
        let namespaces = Namespaces::new();
        assert_eq!(namespaces.global().hash(), GLOBAL_NS_HASH);
    }

    #[test]
    fn link_rejects_cycles() {
        let mut namespaces = Namespaces::new();
        let a = hash_string("A");
        let b = hash_string("B");
        namespaces.find_or_create("A", a);
        namespaces.find_or_create("B", b);
        namespaces.link(b, a).unwrap();
        let err = namespaces.link(a, b).unwrap_err();
        assert!(err.message.contains("cycle"));
    }

    #[test]
    fn hookup_resolves_out_of_order_registrations() {
        let mut namespaces = Namespaces::new();
        let child = hash_string("Child");
        let parent = hash_string("Parent");
        namespaces.find_or_create("Child", child);
        namespaces.defer_link("Child", child, "Parent", parent);
        // parent registered after the child deferred its link
        namespaces.find_or_create("Parent", parent);
        namespaces.hookup_pending().unwrap();
        assert_eq!(namespaces.find(child).unwrap().parent(), Some(parent));
    }

    #[test]
    fn hookup_reports_missing_parent() {
        let mut namespaces = Namespaces::new();
        let child = hash_string("Orphan");
        namespaces.find_or_create("Orphan", child);
        namespaces.defer_link("Orphan", child, "Nowhere", hash_string("Nowhere"));
        let err = namespaces.hookup_pending().unwrap_err();
        assert!(err.message.contains("no progress"));
    }

    #[test]
    fn method_lookup_walks_parents() {
        let mut namespaces = Namespaces::new();
        let base = hash_string("Base");
        let derived = hash_string("Derived");
        let method = hash_string("Tick");
        namespaces.find_or_create("Base", base);
        namespaces.find_or_create("Derived", derived);
        namespaces.link(derived, base).unwrap();
        namespaces
            .find_mut(base)
            .unwrap()
            .methods_mut()
            .insert(method, FunctionEntry::new_script("Tick", method, base));
        assert_eq!(namespaces.find_method(derived, method), Some(base));
        assert_eq!(namespaces.find_method(base, hash_string("Missing")), None);
    }
}
