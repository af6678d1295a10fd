//! The compile tree and its lowering to bytecode.
//!
//! Nodes live in a per-compile arena indexed by `NodeId`; the root is a
//! `Nop` whose `next` chain is the top-level statement sequence. Every
//! node lowers through `eval`, which either counts or emits words
//! depending on the pass, and returns the word count it produced. A node
//! that needs its children's results always emits the children first
//! (postorder), so operands are on the exec stack before their operator
//! runs.
//!
//! `eval` receives a push kind: `Void` ("leave nothing"), `Var` ("leave a
//! variable reference", the assignment LHS), `Resolve` ("leave whatever
//! you have"), `HashTable` ("leave the hashtable variable itself"), or a
//! concrete type.

use crate::bytecode::code::CodeBlock;
use crate::bytecode::emit::Emitter;
use crate::bytecode::op::Opcode;
use crate::context::ScriptContext;
use crate::error::{ScriptError, ScriptResult};
use crate::value::{string_to_value, Value, VarType};
use crate::variable::VarTable;

/// Index of a node in its compile tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(u32);

/// Tagged node payload.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Traverses its sibling chain; the tree root and every statement
    /// list head is one of these.
    Nop,
    /// A literal token, converted to the requested type at emission.
    Literal { text: String, ty: VarType },
    /// A variable reference by name.
    Identifier { name: String, hash: u32 },
    /// A reference to parameter `index` of the call being assembled.
    ParamRef { index: u32 },
    SelfRef,
    ObjMember { hash: u32 },
    PodMember { hash: u32 },
    BinaryOp { op: Opcode, is_assign: bool },
    UnaryOp { op: Opcode },
    If,
    CondBranch,
    WhileLoop,
    FuncDecl { name: String, hash: u32, ns_name: String, ns_hash: u32 },
    FuncCall { name: String, hash: u32, ns_hash: u32, is_method: bool },
    FuncReturn,
    /// left = object expression, right = the method's `FuncCall` subtree.
    ObjMethod,
    ArrayHash,
    ArrayVarDecl { ty: VarType },
    SelfVarDecl { name: String, hash: u32, ty: VarType },
    /// left = delay expression, right = `SchedFunc` subtree.
    Schedule,
    /// left = target object expression, right = `SchedParam` chain.
    SchedFunc { func_hash: u32, immediate: bool },
    SchedParam { index: u32 },
    CreateObject { class_hash: u32 },
    DestroyObject,
}

/// One arena node: payload plus binary-tree links and a sibling chain.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub left: Option<NodeId>,
    pub right: Option<NodeId>,
    pub next: Option<NodeId>,
    pub line: u32,
}

/// Arena of compile-tree nodes; dropped once the block is built.
#[derive(Debug, Default)]
pub struct CompileTree {
    nodes: Vec<Node>,
}

impl CompileTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, kind: NodeKind, line: u32) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            kind,
            left: None,
            right: None,
            next: None,
            line,
        });
        id
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn set_left(&mut self, id: NodeId, child: NodeId) {
        self.nodes[id.0 as usize].left = Some(child);
    }

    pub fn set_right(&mut self, id: NodeId, child: NodeId) {
        self.nodes[id.0 as usize].right = Some(child);
    }

    pub fn set_next(&mut self, id: NodeId, next: NodeId) {
        self.nodes[id.0 as usize].next = Some(next);
    }
}

/// Where a compile-time variable lookup found its target.
enum VarLocation {
    /// A parameter or local of the enclosing function.
    Local { ty: VarType, offset: Option<u16> },
    /// A global: declared by this block or already in the context.
    Global { ty: VarType },
}

/// State threaded through one block compilation (both passes).
pub struct Compiler<'a> {
    ctx: &'a mut ScriptContext,
    tree: &'a CompileTree,
    filename: String,
    filename_hash: u32,
    /// Globals declared by this block at parse time; emitted as `VarDecl`
    /// instructions at the head of the block.
    block_globals: &'a VarTable,
    /// Function-definition stack: `(ns_hash, func_hash)` of the function
    /// bodies currently being lowered.
    func_stack: Vec<(u32, u32)>,
}

impl<'a> Compiler<'a> {
    pub fn new(
        ctx: &'a mut ScriptContext,
        tree: &'a CompileTree,
        filename: &str,
        filename_hash: u32,
        block_globals: &'a VarTable,
    ) -> Self {
        Self {
            ctx,
            tree,
            filename: filename.to_owned(),
            filename_hash,
            block_globals,
            func_stack: Vec::new(),
        }
    }

    /// Runs both passes over the tree and produces the finished block.
    ///
    /// The count-only pass sizes the buffer; the emit pass writes it. A
    /// size mismatch between the passes is a fatal internal error.
    pub fn compile(mut self, root: NodeId) -> ScriptResult<CodeBlock> {
        let mut counter = Emitter::counter();
        let mut counted = self.compile_global_var_table(&mut counter);
        counted += self.eval(root, VarType::Void, &mut counter)?;
        counted += counter.op(Opcode::Eof);

        let mut writer = Emitter::writer(counted);
        let mut written = self.compile_global_var_table(&mut writer);
        written += self.eval(root, VarType::Void, &mut writer)?;
        written += writer.op(Opcode::Eof);

        if counted != written {
            return Err(ScriptError::internal(format!(
                "compile pass mismatch for {}: counted {counted} words, wrote {written}",
                self.filename
            )));
        }

        let (instructions, line_numbers) = writer.finish();
        if instructions.len() != counted {
            return Err(ScriptError::internal(format!(
                "compile pass mismatch for {}: buffer holds {} of {counted} words",
                self.filename,
                instructions.len()
            )));
        }
        Ok(CodeBlock::new(&self.filename, self.filename_hash, instructions, line_numbers))
    }

    /// Emits `VarDecl` instructions for every global this block declares.
    fn compile_global_var_table(&mut self, emit: &mut Emitter) -> usize {
        let mut size = 0;
        for (hash, entry) in self.block_globals {
            size += emit.op(Opcode::VarDecl);
            size += emit.word(*hash);
            size += emit.word(entry.var_type() as u32);
        }
        size
    }

    /// Emits the parameter and local declarations of a function context,
    /// and initializes stack offsets on the emit pass.
    fn compile_function_context(&mut self, ns_hash: u32, func_hash: u32, emit: &mut Emitter) -> ScriptResult<usize> {
        let mut size = 0;

        let (params, locals): (Vec<(u32, VarType)>, Vec<(u32, VarType)>) = {
            let entry = self.ctx.find_function(ns_hash, func_hash)?;
            let context = entry.context();
            let params = (0..context.parameter_count())
                .filter_map(|i| context.parameter(i))
                .map(|ve| (ve.hash(), ve.var_type()))
                .collect();
            let locals = context
                .locals()
                .iter()
                .filter(|(hash, _)| !context.is_parameter(**hash))
                .map(|(hash, ve)| (*hash, ve.var_type()))
                .collect();
            (params, locals)
        };

        for (hash, ty) in params {
            size += emit.op(Opcode::ParamDecl);
            size += emit.word(hash);
            size += emit.word(ty as u32);
        }
        for (hash, ty) in locals {
            size += emit.op(Opcode::VarDecl);
            size += emit.word(hash);
            size += emit.word(ty as u32);
        }

        if !emit.is_count_only() {
            self.ctx
                .find_function_mut(ns_hash, func_hash)?
                .context_mut()
                .init_stack_var_offsets();
        }
        Ok(size)
    }

    /// Emits the full local-var dictionary at the head of a function
    /// body; executes as re-declaration no-ops but lets cache-loaded
    /// blocks rebuild the context without the parser.
    fn compile_local_var_table(&mut self, ns_hash: u32, func_hash: u32, emit: &mut Emitter) -> ScriptResult<usize> {
        let locals: Vec<(u32, VarType)> = {
            let entry = self.ctx.find_function(ns_hash, func_hash)?;
            let context = entry.context();
            context
                .locals()
                .iter()
                .filter(|(hash, _)| !context.is_parameter(**hash))
                .map(|(hash, ve)| (*hash, ve.var_type()))
                .collect()
        };
        let mut size = 0;
        for (hash, ty) in locals {
            size += emit.op(Opcode::VarDecl);
            size += emit.word(hash);
            size += emit.word(ty as u32);
        }
        Ok(size)
    }

    fn err(&self, line: u32, message: String) -> ScriptError {
        ScriptError::compile(message).at(&self.filename, line)
    }

    /// Evaluates the sibling chain starting at `id` (inclusive).
    fn eval_chain(&mut self, first: Option<NodeId>, emit: &mut Emitter) -> ScriptResult<usize> {
        let mut size = 0;
        let mut cursor = first;
        while let Some(id) = cursor {
            size += self.eval(id, VarType::Void, emit)?;
            if matches!(self.tree.node(id).kind, NodeKind::Nop) {
                // a Nop already evaluated the rest of the chain
                break;
            }
            cursor = self.tree.node(id).next;
        }
        Ok(size)
    }

    fn left_of(&self, id: NodeId, what: &str) -> ScriptResult<NodeId> {
        self.tree
            .node(id)
            .left
            .ok_or_else(|| self.err(self.tree.node(id).line, format!("{what} node with no left child")))
    }

    fn right_of(&self, id: NodeId, what: &str) -> ScriptResult<NodeId> {
        self.tree
            .node(id)
            .right
            .ok_or_else(|| self.err(self.tree.node(id).line, format!("{what} node with no right child")))
    }

    /// Resolves a variable name against the enclosing function, the
    /// block's own globals, and the context's global namespace.
    fn find_variable(&self, hash: u32) -> Option<VarLocation> {
        if let Some(&(ns_hash, func_hash)) = self.func_stack.last() {
            if let Ok(entry) = self.ctx.find_function(ns_hash, func_hash) {
                if let Some(ve) = entry.context().local(hash) {
                    return Some(VarLocation::Local {
                        ty: ve.var_type(),
                        offset: ve.stack_offset(),
                    });
                }
            }
        }
        if let Some(ve) = self.block_globals.get(&hash) {
            return Some(VarLocation::Global { ty: ve.var_type() });
        }
        if let Some(ve) = self.ctx.namespaces.global().members().get(&hash) {
            return Some(VarLocation::Global { ty: ve.var_type() });
        }
        None
    }

    /// Hash of the function currently being compiled (0 at top level).
    fn current_func_hash(&self) -> u32 {
        self.func_stack.last().map_or(0, |&(_, func)| func)
    }

    /// Lowers one node. Returns the number of words produced.
    pub fn eval(&mut self, id: NodeId, push: VarType, emit: &mut Emitter) -> ScriptResult<usize> {
        let node = self.tree.node(id).clone();
        emit.record_line(node.line);
        match node.kind {
            NodeKind::Nop => {
                let mut size = 0;
                let mut cursor = node.next;
                while let Some(next_id) = cursor {
                    size += self.eval(next_id, VarType::Void, emit)?;
                    if matches!(self.tree.node(next_id).kind, NodeKind::Nop) {
                        break;
                    }
                    cursor = self.tree.node(next_id).next;
                }
                Ok(size)
            }

            NodeKind::Literal { ref text, ty } => {
                if !push.wants_result() {
                    return Ok(0);
                }
                let mut size = emit.op(Opcode::Push);
                let push_type = if push == VarType::Resolve || push == VarType::Var { ty } else { push };
                size += emit.word(push_type as u32);
                let value = if push_type == VarType::String {
                    // interning takes the reference that keeps the
                    // constant alive for the block's lifetime
                    let hash = self.ctx.string_table.add(text)?;
                    Value::String(hash)
                } else {
                    string_to_value(text, push_type).map_err(|e| self.err(node.line, e.message))?
                };
                size += emit.value_words(&value);
                Ok(size)
            }

            NodeKind::ParamRef { index } => {
                if !push.wants_result() {
                    return Ok(0);
                }
                let mut size = emit.op(Opcode::PushParam);
                size += emit.word(index);
                Ok(size)
            }

            NodeKind::Identifier { ref name, hash } => {
                if !push.wants_result() {
                    return Ok(0);
                }
                let location = self
                    .find_variable(hash)
                    .ok_or_else(|| self.err(node.line, format!("undefined variable: {name}")))?;
                let func_hash = self.current_func_hash();
                let mut size = 0;

                let var_type = match &location {
                    VarLocation::Local { ty, .. } | VarLocation::Global { ty } => *ty,
                };

                // a hashtable used in non-hashtable context needs its key
                // subtree on the stack first
                if var_type == VarType::HashTable && push != VarType::HashTable {
                    let key = node.right.ok_or_else(|| {
                        self.err(node.line, format!("hashtable variable {name} is missing its key subtree"))
                    })?;
                    size += self.eval(key, VarType::Int, emit)?;
                }

                if push == VarType::Var || push == VarType::HashTable {
                    if var_type == VarType::HashTable && push != VarType::HashTable {
                        size += emit.op(Opcode::PushArrayVar);
                        size += emit.word(0);
                        size += emit.word(func_hash);
                        size += emit.word(hash);
                    } else {
                        match location {
                            // hashtables are entry-addressed even as
                            // function locals; only scalars live on the
                            // frame's stack region
                            VarLocation::Global { .. }
                            | VarLocation::Local {
                                ty: VarType::HashTable, ..
                            } => {
                                size += emit.op(Opcode::PushGlobalVar);
                                size += emit.word(0);
                                size += emit.word(func_hash);
                                size += emit.word(hash);
                            }
                            VarLocation::Local { ty, offset } => {
                                size += emit.op(Opcode::PushLocalVar);
                                size += emit.word(ty as u32);
                                let offset = offset.unwrap_or(u16::MAX);
                                if !emit.is_count_only() && offset == u16::MAX {
                                    return Err(
                                        self.err(node.line, format!("invalid stack offset for local var: {name}"))
                                    );
                                }
                                size += emit.word(u32::from(offset));
                            }
                        }
                    }
                } else if var_type == VarType::HashTable {
                    size += emit.op(Opcode::PushArrayValue);
                    size += emit.word(0);
                    size += emit.word(func_hash);
                    size += emit.word(hash);
                } else {
                    match location {
                        VarLocation::Global { .. } => {
                            size += emit.op(Opcode::PushGlobalValue);
                            size += emit.word(0);
                            size += emit.word(func_hash);
                            size += emit.word(hash);
                        }
                        VarLocation::Local { ty, offset } => {
                            size += emit.op(Opcode::PushLocalValue);
                            size += emit.word(ty as u32);
                            let offset = offset.unwrap_or(u16::MAX);
                            if !emit.is_count_only() && offset == u16::MAX {
                                return Err(self.err(node.line, format!("invalid stack offset for local var: {name}")));
                            }
                            size += emit.word(u32::from(offset));
                        }
                    }
                }
                Ok(size)
            }

            NodeKind::SelfRef => {
                if !push.wants_result() {
                    return Ok(0);
                }
                Ok(emit.op(Opcode::PushSelf))
            }

            NodeKind::ObjMember { hash } => {
                let left = self.left_of(id, "ObjMember")?;
                let mut size = self.eval(left, VarType::Object, emit)?;
                if push.wants_result() {
                    if push == VarType::Var {
                        size += emit.op(Opcode::PushMember);
                    } else {
                        size += emit.op(Opcode::PushMemberVal);
                    }
                    size += emit.word(hash);
                } else {
                    size += emit.op(Opcode::Pop);
                }
                Ok(size)
            }

            NodeKind::PodMember { hash } => {
                let left = self.left_of(id, "PodMember")?;
                let mut size = self.eval(left, push, emit)?;
                if push.wants_result() {
                    if push == VarType::Var {
                        size += emit.op(Opcode::PushPodMember);
                    } else {
                        size += emit.op(Opcode::PushPodMemberVal);
                    }
                    size += emit.word(hash);
                } else {
                    size += emit.op(Opcode::Pop);
                }
                Ok(size)
            }

            NodeKind::BinaryOp { op, is_assign } => {
                let left = self.left_of(id, "BinaryOp")?;
                let right = self.right_of(id, "BinaryOp")?;
                let child_push = if is_assign { VarType::Var } else { VarType::Resolve };
                let mut size = self.eval(left, child_push, emit)?;
                size += self.eval(right, VarType::Resolve, emit)?;
                size += emit.op(op);
                // a non-assign operator always pushes its result; discard
                // it when this is a bare expression statement
                if !is_assign && !push.wants_result() {
                    size += emit.op(Opcode::Pop);
                }
                Ok(size)
            }

            NodeKind::UnaryOp { op } => {
                let left = self.left_of(id, "UnaryOp")?;
                let child_push = if matches!(op, Opcode::UnaryPreInc | Opcode::UnaryPreDec) {
                    VarType::Var
                } else if push.wants_result() {
                    push
                } else {
                    VarType::Resolve
                };
                let mut size = self.eval(left, child_push, emit)?;
                size += emit.op(op);
                if !push.wants_result() {
                    size += emit.op(Opcode::Pop);
                }
                Ok(size)
            }

            NodeKind::If => {
                let left = self.left_of(id, "If")?;
                let right = self.right_of(id, "If")?;
                let mut size = self.eval(left, VarType::Bool, emit)?;
                size += self.eval(right, VarType::Void, emit)?;
                Ok(size)
            }

            NodeKind::CondBranch => {
                let mut size = emit.op(Opcode::BranchFalse);
                let (false_label, placeholder) = emit.placeholder();
                size += placeholder;

                // left subtree is the 'true' branch
                if let Some(true_branch) = node.left {
                    let before = size;
                    size += self.eval(true_branch, VarType::Void, emit)?;
                    // skip count covers the true body, plus the trailing
                    // unconditional branch when a false body follows
                    let mut jump = size - before;
                    if node.right.is_some() {
                        jump += 2;
                    }
                    emit.patch(false_label, jump as u32);
                }

                // right subtree is the 'false' branch
                if let Some(false_branch) = node.right {
                    size += emit.op(Opcode::Branch);
                    let (end_label, placeholder) = emit.placeholder();
                    size += placeholder;
                    let before = size;
                    size += self.eval(false_branch, VarType::Void, emit)?;
                    emit.patch(end_label, (size - before) as u32);
                }
                Ok(size)
            }

            NodeKind::WhileLoop => {
                let left = self.left_of(id, "WhileLoop")?;
                let right = self.right_of(id, "WhileLoop")?;

                // condition is re-evaluated at the top of every pass
                let mut size = self.eval(left, VarType::Bool, emit)?;

                size += emit.op(Opcode::BranchFalse);
                let (exit_label, placeholder) = emit.placeholder();
                size += placeholder;
                let body_start = size;

                size += self.eval(right, VarType::Void, emit)?;

                // back-branch lands at the start of the condition; the +2
                // covers the branch instruction itself
                let back = -((size + 2) as i32);
                size += emit.op(Opcode::Branch);
                size += emit.word(back as u32);

                emit.patch(exit_label, (size - body_start) as u32);
                Ok(size)
            }

            NodeKind::FuncDecl {
                ref name,
                hash,
                ref ns_name,
                ns_hash,
            } => {
                // the parser created the entry; it must exist, and it must
                // not shadow a registered native
                let entry = self
                    .ctx
                    .find_function(ns_hash, hash)
                    .map_err(|_| self.err(node.line, format!("undefined function: {name}")))?;
                if !entry.is_script() {
                    return Err(self.err(
                        node.line,
                        format!("there is already a registered native function {name}()"),
                    ));
                }
                let return_type = entry.context().return_type();
                let _ = ns_name;

                self.func_stack.push((ns_hash, hash));

                let mut size = emit.op(Opcode::FuncDecl);
                size += emit.word(hash);
                size += emit.word(ns_hash);
                let (offset_label, placeholder) = emit.placeholder();
                size += placeholder;

                size += self.compile_function_context(ns_hash, hash, emit)?;
                size += emit.op(Opcode::FuncDeclEnd);

                // top-level execution jumps over the body
                size += emit.op(Opcode::Branch);
                let (skip_label, placeholder) = emit.placeholder();
                size += placeholder;
                let body_start = size;

                if !emit.is_count_only() {
                    let body_offset = emit.offset();
                    emit.patch(offset_label, body_offset as u32);
                    let filename_hash = self.filename_hash;
                    self.ctx
                        .find_function_mut(ns_hash, hash)?
                        .set_codeblock_offset(filename_hash, body_offset)
                        .map_err(|e| self.err(node.line, e.message))?;
                }

                size += self.compile_local_var_table(ns_hash, hash, emit)?;

                let body = self.left_of(id, "FuncDecl")?;
                size += self.eval(body, return_type, emit)?;

                emit.patch(skip_label, (size - body_start) as u32);
                self.func_stack.pop();
                Ok(size)
            }

            NodeKind::FuncCall {
                name: _,
                hash,
                ns_hash,
                is_method,
            } => {
                let mut size = 0;
                if is_method {
                    size += emit.op(Opcode::MethodCallArgs);
                    size += emit.word(ns_hash);
                } else {
                    size += emit.op(Opcode::FuncCallArgs);
                    size += emit.word(ns_hash);
                }
                size += emit.word(hash);

                // argument assignments: one PushParam + expression + Assign
                // per argument, in order
                size += self.eval_chain(node.left, emit)?;

                size += emit.op(Opcode::FuncCall);
                if !push.wants_result() {
                    // every call pushes a return value
                    size += emit.op(Opcode::Pop);
                }
                Ok(size)
            }

            NodeKind::FuncReturn => {
                let &(ns_hash, func_hash) = self
                    .func_stack
                    .last()
                    .ok_or_else(|| self.err(node.line, "return outside of a function".to_owned()))?;
                let return_type = self.ctx.find_function(ns_hash, func_hash)?.context().return_type();

                let left = self.left_of(id, "FuncReturn")?;
                // void returns still push a value to keep the VM consistent
                let mut size = if return_type == VarType::Void {
                    self.eval(left, VarType::Int, emit)?
                } else {
                    self.eval(left, return_type, emit)?
                };
                size += emit.op(Opcode::FuncReturn);
                Ok(size)
            }

            NodeKind::ObjMethod => {
                let left = self.left_of(id, "ObjMethod")?;
                let right = self.right_of(id, "ObjMethod")?;
                let mut size = self.eval(left, VarType::Object, emit)?;
                size += self.eval(right, push, emit)?;
                Ok(size)
            }

            NodeKind::ArrayHash => {
                let left = self.left_of(id, "ArrayHash")?;
                let right = self.right_of(id, "ArrayHash")?;
                // left is the hash-in-progress, right the next key part
                let mut size = self.eval(left, VarType::Int, emit)?;
                size += self.eval(right, VarType::String, emit)?;
                size += emit.op(Opcode::ArrayHash);
                Ok(size)
            }

            NodeKind::ArrayVarDecl { ty } => {
                let left = self.left_of(id, "ArrayVarDecl")?;
                let right = self.right_of(id, "ArrayVarDecl")?;
                let mut size = self.eval(left, VarType::HashTable, emit)?;
                size += self.eval(right, VarType::Int, emit)?;
                size += emit.op(Opcode::ArrayVarDecl);
                size += emit.word(ty as u32);
                Ok(size)
            }

            NodeKind::SelfVarDecl { name: _, hash, ty } => {
                let mut size = emit.op(Opcode::SelfVarDecl);
                size += emit.word(hash);
                size += emit.word(ty as u32);
                Ok(size)
            }

            NodeKind::Schedule => {
                let left = self.left_of(id, "Schedule")?;
                let right = self.right_of(id, "Schedule")?;
                let mut size = self.eval(left, VarType::Int, emit)?;
                size += self.eval(right, push, emit)?;
                Ok(size)
            }

            NodeKind::SchedFunc { func_hash, immediate } => {
                let left = self.left_of(id, "SchedFunc")?;
                let mut size = self.eval(left, VarType::Object, emit)?;

                size += emit.op(Opcode::Push);
                size += emit.word(VarType::Int as u32);
                size += emit.word(func_hash);

                size += emit.op(Opcode::ScheduleBegin);
                size += emit.word(u32::from(immediate));

                size += self.eval_chain(node.right, emit)?;

                size += emit.op(Opcode::ScheduleEnd);
                if !push.wants_result() {
                    size += emit.op(Opcode::Pop);
                }
                Ok(size)
            }

            NodeKind::SchedParam { index } => {
                let left = self.left_of(id, "SchedParam")?;
                let mut size = self.eval(left, VarType::Resolve, emit)?;
                size += emit.op(Opcode::ScheduleParam);
                size += emit.word(index);
                Ok(size)
            }

            NodeKind::CreateObject { class_hash } => {
                let left = self.left_of(id, "CreateObject")?;
                let mut size = self.eval(left, VarType::String, emit)?;
                size += emit.op(Opcode::CreateObject);
                size += emit.word(class_hash);
                if !push.wants_result() {
                    size += emit.op(Opcode::Pop);
                }
                Ok(size)
            }

            NodeKind::DestroyObject => {
                let left = self.left_of(id, "DestroyObject")?;
                let mut size = self.eval(left, VarType::Object, emit)?;
                size += emit.op(Opcode::DestroyObject);
                Ok(size)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ScriptContext;

    fn empty_globals() -> VarTable {
        VarTable::default()
    }

    #[test]
    fn literal_statement_compiles_and_passes_parity() {
        let mut ctx = ScriptContext::default_for_tests();
        let mut tree = CompileTree::new();
        let root = tree.alloc(NodeKind::Nop, 0);
        let lit = tree.alloc(
            NodeKind::Literal {
                text: "7".to_owned(),
                ty: VarType::Int,
            },
            1,
        );
        tree.set_next(root, lit);

        let globals = empty_globals();
        let compiler = Compiler::new(&mut ctx, &tree, "<test>", 1, &globals);
        let block = compiler.compile(root).unwrap();
        // literal under a Void push emits nothing; only Eof remains
        assert_eq!(block.instructions(), &[Opcode::Eof as u32]);
    }

    #[test]
    fn binary_op_emits_postorder() {
        let mut ctx = ScriptContext::default_for_tests();
        let mut tree = CompileTree::new();
        let root = tree.alloc(NodeKind::Nop, 0);
        let add = tree.alloc(
            NodeKind::BinaryOp {
                op: Opcode::Add,
                is_assign: false,
            },
            1,
        );
        let one = tree.alloc(
            NodeKind::Literal {
                text: "1".to_owned(),
                ty: VarType::Int,
            },
            1,
        );
        let two = tree.alloc(
            NodeKind::Literal {
                text: "2".to_owned(),
                ty: VarType::Int,
            },
            1,
        );
        tree.set_left(add, one);
        tree.set_right(add, two);
        // wrap in a unary-neg so the Add's result is requested
        let neg = tree.alloc(NodeKind::UnaryOp { op: Opcode::UnaryNeg }, 1);
        tree.set_left(neg, add);
        tree.set_next(root, neg);

        let globals = empty_globals();
        let compiler = Compiler::new(&mut ctx, &tree, "<test>", 1, &globals);
        let block = compiler.compile(root).unwrap();
        assert_eq!(
            block.instructions(),
            &[
                Opcode::Push as u32,
                VarType::Int as u32,
                1,
                Opcode::Push as u32,
                VarType::Int as u32,
                2,
                Opcode::Add as u32,
                Opcode::UnaryNeg as u32,
                Opcode::Pop as u32,
                Opcode::Eof as u32,
            ]
        );
    }

    #[test]
    fn undefined_variable_is_a_compile_error() {
        let mut ctx = ScriptContext::default_for_tests();
        let mut tree = CompileTree::new();
        let root = tree.alloc(NodeKind::Nop, 0);
        let var = tree.alloc(
            NodeKind::Identifier {
                name: "missing".to_owned(),
                hash: crate::hash::hash_string("missing"),
            },
            2,
        );
        let neg = tree.alloc(NodeKind::UnaryOp { op: Opcode::UnaryNeg }, 2);
        tree.set_left(neg, var);
        tree.set_next(root, neg);

        let globals = empty_globals();
        let compiler = Compiler::new(&mut ctx, &tree, "<test>", 1, &globals);
        let err = compiler.compile(root).unwrap_err();
        assert!(err.message.contains("undefined variable"));
        assert_eq!(err.line, Some(2));
    }
}
