//! The top-level owner binding compiler, VM, and symbol system into one
//! embeddable instance.
//!
//! A `ScriptContext` owns the string table, the namespace dictionary and
//! global namespace, the object registry, the scheduler, and the registry
//! of compiled code blocks. All registration is explicit against a
//! context; there is no global state, and a context must stay on the
//! thread that created it.

use std::any::Any;
use std::path::Path;
use std::rc::Rc;

use ahash::AHashMap;

use crate::bytecode::{self, CallStack, CodeBlock, Compiler, ExecStack};
use crate::builtins::register_builtins;
use crate::cache;
use crate::error::{ScriptError, ScriptResult};
use crate::function::{FunctionContext, FunctionEntry, NativeFn};
use crate::hash::hash_string;
use crate::intern::StringTable;
use crate::io::PrintWriter;
use crate::namespace::{CreateFn, DestroyFn, Namespaces, GLOBAL_NS_HASH};
use crate::object::{ObjectEntry, ObjectRegistry};
use crate::parse::parse_program;
use crate::schedule::Scheduler;
use crate::tracer::ExecTracer;
use crate::value::{Value, VarType, MAX_TYPE_WORDS};
use crate::variable::VariableEntry;

/// Registered signatures support at most this many declared parameters.
pub const MAX_REGISTERED_PARAMS: usize = 8;

/// Where a variable lookup found its target.
enum VarOwner {
    /// Parameter or entry-addressed local of a function.
    FuncLocal { ns: u32, func: u32 },
    /// Member entry of a namespace (walking the parent chain).
    NsMember { owner_ns: u32 },
    /// The global namespace's variable table.
    Global,
}

/// One embeddable script runtime instance.
pub struct ScriptContext {
    name: String,
    pub(crate) string_table: StringTable,
    pub(crate) namespaces: Namespaces,
    pub(crate) objects: ObjectRegistry,
    pub(crate) scheduler: Scheduler,
    code_blocks: AHashMap<u32, Rc<CodeBlock>>,
    /// Distinguishes interactive statements: each gets its own block
    /// name so earlier commands' function bodies stay addressable.
    command_counter: u32,
    printer: Box<dyn PrintWriter>,
    tracer: Option<Box<dyn ExecTracer>>,
    error_sink: Option<Box<dyn Fn(&ScriptError)>>,
}

impl std::fmt::Debug for ScriptContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptContext")
            .field("name", &self.name)
            .field("strings", &self.string_table.len())
            .field("objects", &self.objects.len())
            .field("code_blocks", &self.code_blocks.len())
            .finish_non_exhaustive()
    }
}

impl ScriptContext {
    /// Creates a context with the default builtins registered.
    pub fn new(name: &str, printer: Box<dyn PrintWriter>) -> ScriptResult<Self> {
        let mut ctx = Self {
            name: name.to_owned(),
            string_table: StringTable::new(),
            namespaces: Namespaces::new(),
            objects: ObjectRegistry::new(),
            scheduler: Scheduler::new(),
            code_blocks: AHashMap::new(),
            command_counter: 0,
            printer,
            tracer: None,
            error_sink: None,
        };
        ctx.string_table.add(name)?;
        register_builtins(&mut ctx)?;
        Ok(ctx)
    }

    #[cfg(test)]
    pub(crate) fn default_for_tests() -> Self {
        Self::new("test", Box::new(crate::io::CollectPrint::new())).expect("test context")
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Installs a sink invoked with every error that reaches a statement
    /// boundary (the embedder's assert handler).
    pub fn set_error_sink(&mut self, sink: impl Fn(&ScriptError) + 'static) {
        self.error_sink = Some(Box::new(sink));
    }

    /// Installs an opcode tracer.
    pub fn set_tracer(&mut self, tracer: Box<dyn ExecTracer>) {
        self.tracer = Some(tracer);
    }

    pub(crate) fn trace_op(&mut self, op: &'static str, line: u32) {
        if let Some(tracer) = &mut self.tracer {
            tracer.on_op(op, line);
        }
    }

    /// Writes a line through the context's print writer.
    pub fn print(&mut self, line: &str) {
        self.printer.write_line(line);
    }

    /// Readable text for a name hash, for diagnostics.
    #[must_use]
    pub fn unhash(&self, hash: u32) -> String {
        self.string_table.unhash(hash)
    }

    /// Saves the string dictionary so later runs can unhash names.
    pub fn save_string_table(&self, path: &Path) -> ScriptResult<()> {
        self.string_table.save_file(path)
    }

    /// Loads a string dictionary written by a previous run.
    pub fn load_string_table(&mut self, path: &Path) -> ScriptResult<()> {
        self.string_table.load_file(path)
    }

    // --------------------------------------------------------------
    // execution entry points

    /// Compiles and executes one interactive statement.
    pub fn exec_command(&mut self, source: &str) -> ScriptResult<()> {
        self.command_counter += 1;
        let filename = format!("<stdin:{}>", self.command_counter);
        let result = self.exec_source(&filename, source);
        self.finish_statement(result)
    }

    /// Compiles (or loads from cache) and executes a script file.
    pub fn exec_script(&mut self, path: impl AsRef<Path>) -> ScriptResult<()> {
        let result = self.exec_script_inner(path.as_ref());
        self.finish_statement(result)
    }

    fn exec_script_inner(&mut self, path: &Path) -> ScriptResult<()> {
        let filename = path.to_string_lossy().into_owned();
        let filename_hash = self.string_table.add(&filename)?;

        if let Some(cache_path) = cache::cache_path(path) {
            if cache::cache_is_fresh(path, &cache_path) {
                let block = Rc::new(cache::load_block(&cache_path)?);
                return self.execute_new_block(block);
            }
            let source = std::fs::read_to_string(path)
                .map_err(|e| ScriptError::io(format!("unable to read {filename}: {e}")))?;
            let block = Rc::new(self.compile_source(&filename, filename_hash, &source)?);
            if let Err(err) = cache::save_block(&block, &cache_path) {
                // a stale or unwritable cache never blocks execution
                self.report_error(&err);
            }
            return self.execute_new_block(block);
        }

        let source = std::fs::read_to_string(path)
            .map_err(|e| ScriptError::io(format!("unable to read {filename}: {e}")))?;
        let block = Rc::new(self.compile_source(&filename, filename_hash, &source)?);
        self.execute_new_block(block)
    }

    fn exec_source(&mut self, filename: &str, source: &str) -> ScriptResult<()> {
        let filename_hash = self.string_table.add(filename)?;
        let block = Rc::new(self.compile_source(filename, filename_hash, source)?);
        self.execute_new_block(block)
    }

    /// Parses and compiles one source unit without executing it.
    pub(crate) fn compile_source(&mut self, filename: &str, filename_hash: u32, source: &str) -> ScriptResult<CodeBlock> {
        let program = parse_program(self, filename, source)?;
        let compiler = Compiler::new(self, &program.tree, filename, filename_hash, &program.globals);
        compiler.compile(program.root)
    }

    /// Registers, runs, and (when nothing references it) unregisters a
    /// freshly compiled block.
    fn execute_new_block(&mut self, block: Rc<CodeBlock>) -> ScriptResult<()> {
        let hash = block.filename_hash();
        self.code_blocks.insert(hash, Rc::clone(&block));

        let mut exec = ExecStack::new();
        let mut calls = CallStack::new();
        let result = bytecode::execute_block(self, &block, 0, &mut exec, &mut calls);

        if !self.block_in_use(hash) {
            self.code_blocks.remove(&hash);
        }
        result
    }

    /// True while any registered function's body lives in the block.
    fn block_in_use(&self, codeblock_hash: u32) -> bool {
        self.namespaces.known_hashes().into_iter().any(|ns_hash| {
            self.namespaces
                .find(ns_hash)
                .is_some_and(|ns| ns.methods().values().any(|f| f.codeblock_hash() == codeblock_hash))
        })
    }

    /// Routes an error through the sink and reclaims orphaned strings.
    fn finish_statement(&mut self, result: ScriptResult<()>) -> ScriptResult<()> {
        if let Err(err) = &result {
            self.report_error(err);
        }
        self.string_table.purge_unreferenced();
        result
    }

    fn report_error(&mut self, err: &ScriptError) {
        if let Some(sink) = &self.error_sink {
            sink(err);
        } else {
            self.printer.write_line(&err.to_string());
        }
    }

    /// Advances the scheduler clock and dispatches every due request.
    ///
    /// A failing scheduled call is reported through the error sink and
    /// does not block later requests.
    pub fn update(&mut self, now_ms: u32) {
        let due = self.scheduler.take_due(now_ms);
        for mut request in due {
            let outcome = self.execute_scheduled_call(request.object_id, request.func_hash, &mut request.context);
            if let Err(err) = outcome {
                self.report_error(&err);
            }
            // release any string references the staged parameters held
            let Self {
                string_table, ..
            } = self;
            for i in 0..request.context.parameter_count() {
                if let Some(entry) = request.context.parameter_mut(i) {
                    entry.release_strings(string_table);
                }
            }
            if request.repeat_period.is_some() {
                self.scheduler.reschedule_repeat(request);
            }
        }
        self.string_table.purge_unreferenced();
    }

    /// Invokes a scripted or native function from the host.
    ///
    /// Arguments are staged the way `schedule()` stages parameters; the
    /// return value adopts whatever type the function produced.
    pub fn call_function(&mut self, name: &str, args: &[Value]) -> ScriptResult<Value> {
        self.call_entry(0, name, args)
    }

    /// Invokes a method on an object from the host.
    pub fn call_method(&mut self, object_id: u32, name: &str, args: &[Value]) -> ScriptResult<Value> {
        self.call_entry(object_id, name, args)
    }

    fn call_entry(&mut self, object_id: u32, name: &str, args: &[Value]) -> ScriptResult<Value> {
        let func_hash = self.string_table.add(name)?;
        let mut params = FunctionContext::new();
        params.add_parameter_at(0, "__return", hash_string("__return"), VarType::Resolve)?;
        {
            let Self { string_table, .. } = self;
            for (i, value) in args.iter().enumerate() {
                let (pname, phash) = bytecode::schedule_param_name(i + 1);
                params.add_parameter_at(i + 1, &pname, phash, value.var_type())?;
                params
                    .parameter_mut(i + 1)
                    .expect("just added")
                    .set_value(*value, string_table)?;
            }
        }
        let result = self.execute_scheduled_call(object_id, func_hash, &mut params);
        self.finish_statement(result)?;
        params
            .parameter(0)
            .ok_or_else(|| ScriptError::internal("call lost its return slot"))?
            .value()
    }

    // --------------------------------------------------------------
    // registration

    /// Registers a host function callable from scripts.
    ///
    /// `params` is the declared signature (at most 8 parameters); values
    /// are converted to the declared types before dispatch.
    pub fn register_function(
        &mut self,
        name: &str,
        params: &[VarType],
        return_type: VarType,
        f: impl Fn(&mut Self, Option<u32>, &[Value]) -> ScriptResult<Value> + 'static,
    ) -> ScriptResult<()> {
        self.register_entry(GLOBAL_NS_HASH, name, params, return_type, Rc::new(f))
    }

    /// Registers a host method on a class namespace.
    pub fn register_method(
        &mut self,
        class: &str,
        name: &str,
        params: &[VarType],
        return_type: VarType,
        f: impl Fn(&mut Self, Option<u32>, &[Value]) -> ScriptResult<Value> + 'static,
    ) -> ScriptResult<()> {
        let class_hash = self.string_table.add(class)?;
        self.namespaces.find_or_create(class, class_hash);
        self.register_entry(class_hash, name, params, return_type, Rc::new(f))
    }

    fn register_entry(
        &mut self,
        ns_hash: u32,
        name: &str,
        params: &[VarType],
        return_type: VarType,
        dispatcher: NativeFn,
    ) -> ScriptResult<()> {
        if params.len() > MAX_REGISTERED_PARAMS {
            return Err(ScriptError::resource(format!(
                "registered signatures support at most {MAX_REGISTERED_PARAMS} parameters"
            )));
        }
        let hash = self.string_table.add(name)?;
        let mut context = FunctionContext::with_return_type(return_type);
        for (i, ty) in params.iter().enumerate() {
            if !ty.is_declarable() || *ty == VarType::Void || *ty == VarType::HashTable {
                return Err(ScriptError::type_error(format!(
                    "parameter {} of {name} has unsupported type {}",
                    i + 1,
                    ty.keyword()
                )));
            }
            let (pname, phash) = bytecode::schedule_param_name(i + 1);
            context.add_parameter(&pname, phash, *ty)?;
        }
        let ns = self
            .namespaces
            .find_mut(ns_hash)
            .ok_or_else(|| ScriptError::link("namespace disappeared during registration"))?;
        if ns.methods().contains_key(&hash) {
            return Err(ScriptError::compile(format!("duplicate registration of {name}()")));
        }
        ns.methods_mut()
            .insert(hash, FunctionEntry::new_native(name, hash, ns_hash, context, dispatcher));
        Ok(())
    }

    /// Registers a host class: constructor, destructor, and member
    /// declarations, optionally inheriting from a parent class.
    pub fn register_class(
        &mut self,
        name: &str,
        parent: Option<&str>,
        create: impl Fn() -> Box<dyn Any> + 'static,
        destroy: impl Fn(Box<dyn Any>) + 'static,
        members: &[(&str, VarType)],
    ) -> ScriptResult<()> {
        let hash = self.string_table.add(name)?;
        {
            let ns = self.namespaces.find_or_create(name, hash);
            ns.set_class_fns(
                Some(Rc::new(create) as CreateFn),
                Some(Rc::new(destroy) as DestroyFn),
            );
        }
        for (member_name, ty) in members {
            let member_hash = self.string_table.add(member_name)?;
            let ns = self
                .namespaces
                .find_mut(hash)
                .ok_or_else(|| ScriptError::link("namespace disappeared during registration"))?;
            ns.members_mut()
                .insert(member_hash, VariableEntry::new(member_name, member_hash, *ty));
        }
        if let Some(parent) = parent {
            let parent_hash = self.string_table.add(parent)?;
            self.namespaces.defer_link(name, hash, parent, parent_hash);
        }
        Ok(())
    }

    /// Registers a context-owned global variable readable and writable
    /// from both sides.
    pub fn register_global(&mut self, name: &str, ty: VarType, initial: Value) -> ScriptResult<()> {
        let hash = self.string_table.add(name)?;
        let Self {
            namespaces,
            string_table,
            ..
        } = self;
        let globals = namespaces.global_mut().members_mut();
        if globals.contains_key(&hash) {
            return Err(ScriptError::compile(format!("duplicate registration of global {name}")));
        }
        let mut entry = VariableEntry::new(name, hash, ty);
        if ty != VarType::HashTable {
            entry.set_value(initial, string_table)?;
        }
        globals.insert(hash, entry);
        Ok(())
    }

    /// Reads a global variable's value (host side).
    pub fn global_value(&self, name: &str) -> ScriptResult<Value> {
        let hash = hash_string(name);
        self.namespaces
            .global()
            .members()
            .get(&hash)
            .ok_or_else(|| ScriptError::resolution(format!("unknown global: {name}")))?
            .value()
    }

    /// Writes a global variable's value (host side).
    pub fn set_global_value(&mut self, name: &str, value: Value) -> ScriptResult<()> {
        let hash = hash_string(name);
        let Self {
            namespaces,
            string_table,
            ..
        } = self;
        namespaces
            .global_mut()
            .members_mut()
            .get_mut(&hash)
            .ok_or_else(|| ScriptError::resolution(format!("unknown global: {name}")))?
            .set_value(value, string_table)
    }

    /// Links a child namespace under a parent (single inheritance).
    pub fn link_namespaces(&mut self, child: &str, parent: &str) -> ScriptResult<()> {
        let child_hash = self.string_table.add(child)?;
        let parent_hash = self.string_table.add(parent)?;
        self.namespaces.find_or_create(child, child_hash);
        self.namespaces.find_or_create(parent, parent_hash);
        self.namespaces.link(child_hash, parent_hash)
    }

    // --------------------------------------------------------------
    // objects

    /// Finds a live object by id.
    #[must_use]
    pub fn find_object(&self, id: u32) -> Option<&ObjectEntry> {
        self.objects.find(id)
    }

    /// Finds a live object by name; the last registered wins.
    #[must_use]
    pub fn find_object_by_name(&self, name: &str) -> Option<&ObjectEntry> {
        self.objects.find_by_name(hash_string(name))
    }

    /// Borrows an object's native payload, downcast to its host type.
    pub fn object_native_mut<T: 'static>(&mut self, id: u32) -> Option<&mut T> {
        self.objects.find_mut(id)?.native_mut::<T>()
    }

    /// Creates an object of a registered (or script-linked) class.
    pub(crate) fn create_object(&mut self, class_hash: u32, name_hash: u32) -> ScriptResult<u32> {
        self.namespaces.hookup_pending()?;
        if self.namespaces.find(class_hash).is_none() {
            return Err(ScriptError::resolution(format!(
                "unknown class: {}",
                self.string_table.unhash(class_hash)
            )));
        }
        let create = self.namespaces.find_create_fn(class_hash).ok_or_else(|| {
            ScriptError::resolution(format!(
                "class {} has no registered constructor in its hierarchy",
                self.string_table.unhash(class_hash)
            ))
        })?;
        let native = create();
        let members = self.namespaces.collect_member_decls(class_hash);
        Ok(self.objects.create(name_hash, class_hash, Some(native), &members))
    }

    /// Host-side creation by class name.
    pub fn create_named_object(&mut self, class: &str, name: &str) -> ScriptResult<u32> {
        let class_hash = self.string_table.add(class)?;
        let name_hash = self.string_table.add(name)?;
        self.create_object(class_hash, name_hash)
    }

    /// Destroys an object: most-derived destructor, then removal from
    /// every index.
    pub fn destroy_object(&mut self, id: u32) -> ScriptResult<()> {
        let namespace_hash = self
            .objects
            .find(id)
            .ok_or_else(|| ScriptError::resolution(format!("unable to find object {id}")))?
            .namespace_hash();
        let destroy = self.namespaces.find_destroy_fn(namespace_hash);
        let mut entry = self
            .objects
            .remove(id)
            .ok_or_else(|| ScriptError::resolution(format!("unable to find object {id}")))?;
        entry.release_strings(&mut self.string_table);
        if let (Some(destroy), Some(native)) = (destroy, entry.take_native()) {
            destroy(native);
        }
        Ok(())
    }

    /// Adds a dynamic variable to an object's bag.
    pub(crate) fn add_dynamic_variable(&mut self, object_id: u32, var_hash: u32, ty: VarType) -> ScriptResult<()> {
        let name = self.string_table.unhash(var_hash);
        self.objects
            .find_mut(object_id)
            .ok_or_else(|| ScriptError::resolution(format!("unable to find object {object_id}")))?
            .add_dynamic_variable(&name, var_hash, ty)
    }

    /// Adds a dynamic variable by name (host side).
    pub fn add_dynamic_variable_named(&mut self, object_id: u32, name: &str, ty: VarType) -> ScriptResult<()> {
        let hash = self.string_table.add(name)?;
        self.add_dynamic_variable(object_id, hash, ty)
    }

    // --------------------------------------------------------------
    // scheduling (host side)

    /// Schedules a deferred call; `repeat_period` makes it periodic.
    pub fn schedule_call(
        &mut self,
        object_id: u32,
        delay_ms: u32,
        func_name: &str,
        args: &[Value],
        repeat_period: Option<u32>,
    ) -> ScriptResult<i32> {
        let func_hash = self.string_table.add(func_name)?;
        let mut context = FunctionContext::new();
        context.add_parameter_at(0, "__return", hash_string("__return"), VarType::Resolve)?;
        {
            let Self { string_table, .. } = self;
            for (i, value) in args.iter().enumerate() {
                let (pname, phash) = bytecode::schedule_param_name(i + 1);
                context.add_parameter_at(i + 1, &pname, phash, value.var_type())?;
                context
                    .parameter_mut(i + 1)
                    .expect("just added")
                    .set_value(*value, string_table)?;
            }
        }
        Ok(self
            .scheduler
            .enqueue_host_request(object_id, delay_ms, func_hash, repeat_period, context))
    }

    /// Cancels a pending scheduled request by id.
    pub fn cancel_schedule(&mut self, request_id: i32) {
        self.scheduler.cancel_request(request_id);
    }

    /// Cancels every pending request owned by an object.
    pub fn cancel_object_schedules(&mut self, object_id: u32) {
        self.scheduler.cancel_object(object_id);
    }

    // --------------------------------------------------------------
    // function entries (compiler/VM plumbing)

    pub(crate) fn find_function(&self, ns_hash: u32, func_hash: u32) -> ScriptResult<&FunctionEntry> {
        self.namespaces
            .find(ns_hash)
            .and_then(|ns| ns.methods().get(&func_hash))
            .ok_or_else(|| {
                ScriptError::resolution(format!("undefined function: {}()", self.string_table.unhash(func_hash)))
            })
    }

    pub(crate) fn find_function_mut(&mut self, ns_hash: u32, func_hash: u32) -> ScriptResult<&mut FunctionEntry> {
        let known = self
            .namespaces
            .find(ns_hash)
            .is_some_and(|ns| ns.methods().contains_key(&func_hash));
        if !known {
            return Err(ScriptError::resolution(format!(
                "undefined function: {}()",
                self.string_table.unhash(func_hash)
            )));
        }
        Ok(self
            .namespaces
            .find_mut(ns_hash)
            .and_then(|ns| ns.methods_mut().get_mut(&func_hash))
            .expect("checked above"))
    }

    /// Parse-time function definition: creates (or resets) the script
    /// entry with its declared return type.
    pub(crate) fn declare_parsed_function(
        &mut self,
        ns_hash: u32,
        ns_name: &str,
        name: &str,
        func_hash: u32,
        return_type: VarType,
    ) -> ScriptResult<()> {
        let ns = self.namespaces.find_or_create(ns_name, ns_hash);
        if let Some(existing) = ns.methods().get(&func_hash) {
            if !existing.is_script() {
                return Err(ScriptError::compile(format!(
                    "there is already a registered native function {name}()"
                )));
            }
        }
        // re-executing a definition replaces the previous one
        let mut entry = FunctionEntry::new_script(name, func_hash, ns_hash);
        entry
            .context_mut()
            .add_parameter("__return", hash_string("__return"), return_type)?;
        ns.methods_mut().insert(func_hash, entry);
        Ok(())
    }

    /// Runtime `FuncDecl`: find-or-create the script entry and point it
    /// at its body.
    pub(crate) fn declare_script_function(
        &mut self,
        ns_hash: u32,
        func_hash: u32,
        codeblock_hash: u32,
        offset: usize,
    ) -> ScriptResult<()> {
        let name = self.string_table.unhash(func_hash);
        let ns_name = self.string_table.unhash(ns_hash);
        let ns = self.namespaces.find_or_create(&ns_name, ns_hash);
        let entry = ns
            .methods_mut()
            .entry(func_hash)
            .or_insert_with(|| FunctionEntry::new_script(&name, func_hash, ns_hash));
        entry.set_codeblock_offset(codeblock_hash, offset)
    }

    /// Runtime `ParamDecl`: appends a parameter unless it already exists
    /// (re-declaration while re-executing a block).
    pub(crate) fn declare_function_param(&mut self, ns_hash: u32, func_hash: u32, hash: u32, ty: VarType) -> ScriptResult<()> {
        let name = self.string_table.unhash(hash);
        let context = self.find_function_mut(ns_hash, func_hash)?.context_mut();
        if context.is_parameter(hash) {
            return Ok(());
        }
        context.add_parameter(&name, hash, ty)
    }

    /// Runtime `VarDecl` inside a function declaration or body.
    pub(crate) fn declare_function_local(&mut self, ns_hash: u32, func_hash: u32, hash: u32, ty: VarType) -> ScriptResult<()> {
        let name = self.string_table.unhash(hash);
        let context = self.find_function_mut(ns_hash, func_hash)?.context_mut();
        if let Some(existing) = context.local(hash) {
            if existing.var_type() != ty {
                return Err(ScriptError::compile(format!(
                    "local {name} redeclared as {}",
                    ty.keyword()
                )));
            }
            return Ok(());
        }
        context.add_local(&name, hash, ty)
    }

    /// Runtime `VarDecl` at the top level: a block global.
    pub(crate) fn declare_global(&mut self, hash: u32, ty: VarType) -> ScriptResult<()> {
        let name = self.string_table.unhash(hash);
        let globals = self.namespaces.global_mut().members_mut();
        if let Some(existing) = globals.get(&hash) {
            if existing.var_type() != ty {
                return Err(ScriptError::compile(format!(
                    "global {name} redeclared as {}",
                    ty.keyword()
                )));
            }
            return Ok(());
        }
        globals.insert(hash, VariableEntry::new(&name, hash, ty));
        Ok(())
    }

    /// Runtime `ArrayVarDecl`: declares a typed hashtable entry.
    pub(crate) fn declare_hashtable_entry(
        &mut self,
        ns_hash: u32,
        func_hash: u32,
        var_hash: u32,
        key: u32,
        ty: VarType,
    ) -> ScriptResult<()> {
        let key_name = self.string_table.unhash(key);
        let owner = self
            .find_var_owner(ns_hash, func_hash, var_hash)
            .ok_or_else(|| ScriptError::resolution(format!("unknown variable {}", self.string_table.unhash(var_hash))))?;
        let entry = self
            .owner_entry_mut(&owner, var_hash)
            .ok_or_else(|| ScriptError::resolution("hashtable variable disappeared"))?;
        let table = entry.table_mut()?;
        if let Some(existing) = table.get(&key) {
            if existing.var_type() != ty {
                return Err(ScriptError::type_error(format!(
                    "hashtable entry already has type {}",
                    existing.var_type().keyword()
                )));
            }
            return Ok(());
        }
        table.insert(key, VariableEntry::new(&key_name, key, ty));
        Ok(())
    }

    pub(crate) fn clear_function_parameters(&mut self, ns_hash: u32, func_hash: u32) -> ScriptResult<()> {
        let Self {
            namespaces,
            string_table,
            ..
        } = self;
        let entry = namespaces
            .find_mut(ns_hash)
            .and_then(|ns| ns.methods_mut().get_mut(&func_hash))
            .ok_or_else(|| ScriptError::resolution("undefined function"))?;
        entry.context_mut().clear_parameters(string_table);
        Ok(())
    }

    pub(crate) fn find_code_block(&self, codeblock_hash: u32) -> ScriptResult<Rc<CodeBlock>> {
        self.code_blocks
            .get(&codeblock_hash)
            .cloned()
            .ok_or_else(|| ScriptError::resolution("function body's code block is no longer loaded"))
    }

    // --------------------------------------------------------------
    // variable resolution: function locals, then the namespace chain,
    // then globals, then the hashtable key descent

    fn find_var_owner(&self, ns_hash: u32, func_hash: u32, var_hash: u32) -> Option<VarOwner> {
        // 1. the function's local table
        if func_hash != 0 {
            if let Ok(entry) = self.find_function(ns_hash, func_hash) {
                if entry.context().local(var_hash).is_some() {
                    return Some(VarOwner::FuncLocal {
                        ns: ns_hash,
                        func: func_hash,
                    });
                }
            }
        }
        // 2. the namespace chain's members
        if ns_hash != 0 {
            let mut cursor = Some(ns_hash);
            while let Some(hash) = cursor {
                let ns = self.namespaces.find(hash)?;
                if ns.members().contains_key(&var_hash) {
                    return Some(VarOwner::NsMember { owner_ns: hash });
                }
                cursor = ns.parent();
            }
        }
        // 3. the global table
        if self.namespaces.global().members().contains_key(&var_hash) {
            return Some(VarOwner::Global);
        }
        None
    }

    fn owner_entry_mut(&mut self, owner: &VarOwner, var_hash: u32) -> Option<&mut VariableEntry> {
        match owner {
            VarOwner::FuncLocal { ns, func } => self
                .namespaces
                .find_mut(*ns)
                .and_then(|n| n.methods_mut().get_mut(func))
                .and_then(|f| f.context_mut().local_mut(var_hash)),
            VarOwner::NsMember { owner_ns } => self
                .namespaces
                .find_mut(*owner_ns)
                .and_then(|n| n.members_mut().get_mut(&var_hash)),
            VarOwner::Global => self.namespaces.global_mut().members_mut().get_mut(&var_hash),
        }
    }

    fn owner_entry(&self, owner: &VarOwner, var_hash: u32) -> Option<&VariableEntry> {
        match owner {
            VarOwner::FuncLocal { ns, func } => self
                .namespaces
                .find(*ns)
                .and_then(|n| n.methods().get(func))
                .and_then(|f| f.context().local(var_hash)),
            VarOwner::NsMember { owner_ns } => self.namespaces.find(*owner_ns).and_then(|n| n.members().get(&var_hash)),
            VarOwner::Global => self.namespaces.global().members().get(&var_hash),
        }
    }

    /// Reads a variable through the `(ns, func, var, key)` quadruple.
    pub(crate) fn var_value(&self, ns_hash: u32, func_hash: u32, var_hash: u32, key: u32) -> ScriptResult<Value> {
        let owner = self.find_var_owner(ns_hash, func_hash, var_hash).ok_or_else(|| {
            ScriptError::resolution(format!("unknown variable {}", self.string_table.unhash(var_hash)))
        })?;
        let entry = self
            .owner_entry(&owner, var_hash)
            .ok_or_else(|| ScriptError::resolution("variable disappeared"))?;
        if key != 0 || entry.var_type() == VarType::HashTable {
            let table = entry.table()?;
            let slot = table.get(&key).ok_or_else(|| {
                ScriptError::resolution(format!(
                    "hashtable {} has no entry for this key",
                    self.string_table.unhash(var_hash)
                ))
            })?;
            return slot.value();
        }
        entry.value()
    }

    /// Writes a variable through the `(ns, func, var, key)` quadruple.
    ///
    /// Assignment into a missing hashtable entry auto-declares it with
    /// the assigned value's type.
    pub(crate) fn set_var_value(
        &mut self,
        ns_hash: u32,
        func_hash: u32,
        var_hash: u32,
        key: u32,
        value: Value,
    ) -> ScriptResult<()> {
        let owner = self.find_var_owner(ns_hash, func_hash, var_hash).ok_or_else(|| {
            ScriptError::resolution(format!("unknown variable {}", self.string_table.unhash(var_hash)))
        })?;
        let key_name = self.string_table.unhash(key);
        let Self {
            namespaces,
            string_table,
            ..
        } = self;
        let entry = match &owner {
            VarOwner::FuncLocal { ns, func } => namespaces
                .find_mut(*ns)
                .and_then(|n| n.methods_mut().get_mut(func))
                .and_then(|f| f.context_mut().local_mut(var_hash)),
            VarOwner::NsMember { owner_ns } => namespaces.find_mut(*owner_ns).and_then(|n| n.members_mut().get_mut(&var_hash)),
            VarOwner::Global => namespaces.global_mut().members_mut().get_mut(&var_hash),
        }
        .ok_or_else(|| ScriptError::resolution("variable disappeared"))?;

        if key != 0 || entry.var_type() == VarType::HashTable {
            let table = entry.table_mut()?;
            let slot = table
                .entry(key)
                .or_insert_with(|| VariableEntry::new(&key_name, key, value.var_type()));
            return slot.set_value(value, string_table);
        }
        entry.set_value(value, string_table)
    }

    /// Declared type behind a `(ns, func, var, key)` reference.
    pub(crate) fn var_type_of(&self, ns_hash: u32, func_hash: u32, var_hash: u32, key: u32) -> ScriptResult<VarType> {
        let owner = self.find_var_owner(ns_hash, func_hash, var_hash).ok_or_else(|| {
            ScriptError::resolution(format!("unknown variable {}", self.string_table.unhash(var_hash)))
        })?;
        let entry = self
            .owner_entry(&owner, var_hash)
            .ok_or_else(|| ScriptError::resolution("variable disappeared"))?;
        if key != 0 || entry.var_type() == VarType::HashTable {
            let table = entry.table()?;
            return table
                .get(&key)
                .map(VariableEntry::var_type)
                .ok_or_else(|| ScriptError::resolution("hashtable has no entry for this key"));
        }
        Ok(entry.var_type())
    }

    // --------------------------------------------------------------
    // object member access

    pub(crate) fn member_value(&self, object_id: u32, var_hash: u32) -> ScriptResult<Value> {
        let entry = self
            .objects
            .find(object_id)
            .ok_or_else(|| ScriptError::resolution(format!("unable to find object {object_id}")))?;
        entry
            .variable(var_hash)
            .ok_or_else(|| {
                ScriptError::resolution(format!(
                    "object {object_id} has no member {}",
                    self.string_table.unhash(var_hash)
                ))
            })?
            .value()
    }

    pub(crate) fn set_member_value(&mut self, object_id: u32, var_hash: u32, value: Value) -> ScriptResult<()> {
        let Self {
            objects,
            string_table,
            ..
        } = self;
        let entry = objects
            .find_mut(object_id)
            .ok_or_else(|| ScriptError::resolution(format!("unable to find object {object_id}")))?;
        let member = entry.variable_mut(var_hash).ok_or_else(|| {
            ScriptError::resolution(format!(
                "object {object_id} has no member {}",
                string_table.unhash(var_hash)
            ))
        })?;
        member.set_value(value, string_table)
    }

    pub(crate) fn member_type_of(&self, object_id: u32, var_hash: u32) -> ScriptResult<VarType> {
        let entry = self
            .objects
            .find(object_id)
            .ok_or_else(|| ScriptError::resolution(format!("unable to find object {object_id}")))?;
        entry
            .variable(var_hash)
            .map(VariableEntry::var_type)
            .ok_or_else(|| {
                ScriptError::resolution(format!(
                    "object {object_id} has no member {}",
                    self.string_table.unhash(var_hash)
                ))
            })
    }

    // --------------------------------------------------------------
    // scheduled execution

    /// Stages one parameter of the schedule under construction, inferring
    /// its declared type from the pushed value.
    pub(crate) fn set_schedule_param(&mut self, index: usize, value: Value) -> ScriptResult<()> {
        let Self {
            scheduler,
            string_table,
            ..
        } = self;
        let request = scheduler.current_mut()?;
        let (name, hash) = bytecode::schedule_param_name(index);
        request.context.add_parameter_at(index, &name, hash, value.var_type())?;
        request
            .context
            .parameter_mut(index)
            .ok_or_else(|| ScriptError::internal("schedule parameter out of range"))?
            .set_value(value, string_table)
    }

    /// Runs a deferred or host-initiated call on fresh stacks.
    ///
    /// Parameters are copied from the prebuilt context into the target's
    /// declared parameters; the return value lands back in the prebuilt
    /// context's `__resolve` slot.
    pub(crate) fn execute_scheduled_call(
        &mut self,
        object_id: u32,
        func_hash: u32,
        params: &mut FunctionContext,
    ) -> ScriptResult<()> {
        // resolve the target: method through the object's chain, or a
        // global function
        let owner_ns = if object_id != 0 {
            let object_ns = self
                .objects
                .find(object_id)
                .ok_or_else(|| ScriptError::resolution(format!("unable to find object {object_id}")))?
                .namespace_hash();
            self.namespaces.find_method(object_ns, func_hash).ok_or_else(|| {
                ScriptError::resolution(format!(
                    "unable to find method {} for object {object_id}",
                    self.string_table.unhash(func_hash)
                ))
            })?
        } else {
            self.find_function(GLOBAL_NS_HASH, func_hash)?;
            GLOBAL_NS_HASH
        };

        // stage arguments into the target's declared parameters
        let src_count = params.parameter_count();
        {
            let Self {
                namespaces,
                string_table,
                ..
            } = self;
            let entry = namespaces
                .find_mut(owner_ns)
                .and_then(|ns| ns.methods_mut().get_mut(&func_hash))
                .ok_or_else(|| ScriptError::resolution("scheduled function disappeared"))?;
            let dst_count = entry.context().parameter_count();
            if src_count > dst_count {
                return Err(ScriptError::resource(format!(
                    "scheduled call passes {} arguments, function takes {}",
                    src_count - 1,
                    dst_count.saturating_sub(1)
                )));
            }
            for i in 1..dst_count {
                let staged = params.parameter(i).map(VariableEntry::value).transpose()?;
                let dst = entry
                    .context_mut()
                    .parameter_mut(i)
                    .ok_or_else(|| ScriptError::internal("parameter list out of sync"))?;
                match staged {
                    Some(value) => dst.set_value(value, string_table)?,
                    None => dst.clear_value(string_table),
                }
            }
        }

        let is_script = self.find_function(owner_ns, func_hash)?.is_script();
        let local_count = self.find_function(owner_ns, func_hash)?.context().local_count();

        let mut exec = ExecStack::new();
        let mut calls = CallStack::new();
        calls.push(owner_ns, func_hash, object_id, exec.top(), 0)?;
        if is_script {
            exec.reserve(local_count * MAX_TYPE_WORDS)?;
        }
        calls.begin_execution()?;

        bytecode::invoke_top(self, None, &mut exec, &mut calls)?;

        // every function pushed exactly one value; adopt it as the result
        let (payload, ty) = exec.pop_raw()?;
        let value = Value::decode_word(ty, payload.first().copied().unwrap_or(0))?;
        let Self { string_table, .. } = self;
        params
            .parameter_mut(0)
            .ok_or_else(|| ScriptError::internal("scheduled call lost its return slot"))?
            .resolve_value(value, string_table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_and_emit_passes_agree_on_real_programs() {
        let mut ctx = ScriptContext::default_for_tests();
        let source = "int acc = 0;\n\
                      int square(int n) { return n * n; }\n\
                      int i = 0;\n\
                      while (i < 4) { acc += square(i); ++i; }\n\
                      Print(acc);";
        // compile() verifies pass parity internally; a mismatch errors
        let block = ctx.compile_source("parity.ts", 1, source).unwrap();
        assert!(block.instruction_count() > 0);
        assert_eq!(
            *block.instructions().last().unwrap(),
            crate::bytecode::Opcode::Eof as u32
        );
    }

    #[test]
    fn compiling_the_same_source_twice_is_deterministic() {
        let source = "int add(int a, int b) { return a + b; } Print(add(1, 2));";
        let mut a = ScriptContext::default_for_tests();
        let mut b = ScriptContext::default_for_tests();
        let block_a = a.compile_source("same.ts", 9, source).unwrap();
        let block_b = b.compile_source("same.ts", 9, source).unwrap();
        assert_eq!(block_a.instructions(), block_b.instructions());
        assert_eq!(block_a.line_numbers(), block_b.line_numbers());
    }

    #[test]
    fn cache_round_trip_preserves_bytecode_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog.tso");

        let mut ctx = ScriptContext::default_for_tests();
        let source = "hashtable t; t[\"k\"] = 1; void f() { Print(t[\"k\"]); }";
        let direct = ctx.compile_source("prog.ts", 5, source).unwrap();

        cache::save_block(&direct, &path).unwrap();
        let loaded = cache::load_block(&path).unwrap();

        assert_eq!(loaded.instructions(), direct.instructions());
        assert_eq!(loaded.line_numbers(), direct.line_numbers());
        assert_eq!(loaded.filename(), direct.filename());
    }
}
