//! Lexer and recursive-descent parser.
//!
//! Produces the compile tree the two `eval` passes consume. Declarations
//! have parse-time effects: function definitions create their
//! `FunctionEntry` (parameters and locals included) so body compilation
//! can resolve names, and global declarations populate the block's
//! global-variable table.

use crate::bytecode::{CompileTree, NodeId, NodeKind, Opcode};
use crate::context::ScriptContext;
use crate::error::{ScriptError, ScriptResult};
use crate::hash::hash_string;
use crate::value::VarType;
use crate::variable::{VarTable, VariableEntry};

/// Everything the compiler needs from one parsed source unit.
pub struct ParsedProgram {
    pub tree: CompileTree,
    pub root: NodeId,
    /// Globals this block declares, emitted as `VarDecl` at block head.
    pub globals: VarTable,
}

/// Parses a source unit into a compile tree.
pub fn parse_program(ctx: &mut ScriptContext, filename: &str, source: &str) -> ScriptResult<ParsedProgram> {
    let tokens = lex(source).map_err(|mut e| {
        e.file = Some(filename.to_owned());
        e
    })?;
    let mut parser = Parser {
        ctx,
        tokens,
        pos: 0,
        filename: filename.to_owned(),
        tree: CompileTree::new(),
        globals: VarTable::default(),
        current_function: None,
    };
    let root = parser.tree.alloc(NodeKind::Nop, 0);
    let mut tail = root;
    while !parser.at_end() {
        let stmt = parser.parse_statement()?;
        parser.tree.set_next(tail, stmt);
        tail = parser.chain_tail(stmt);
    }
    Ok(ParsedProgram {
        tree: parser.tree,
        root,
        globals: parser.globals,
    })
}

// ------------------------------------------------------------------
// lexer

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Int(String),
    Float(String),
    Str(String),
    Punct(&'static str),
    Eof,
}

#[derive(Debug, Clone)]
struct Lexed {
    tok: Tok,
    line: u32,
}

/// Multi-character operators, longest first so maximal munch wins.
const PUNCTUATION: &[&str] = &[
    "<<=", ">>=", "==", "!=", "<=", ">=", "&&", "||", "<<", ">>", "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=",
    "++", "--", "::", "(", ")", "{", "}", "[", "]", ";", ",", ".", "+", "-", "*", "/", "%", "<", ">", "=", "!", "~",
    "&", "|", "^",
];

fn lex(source: &str) -> ScriptResult<Vec<Lexed>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0usize;
    let mut line = 1u32;

    while i < bytes.len() {
        let c = bytes[i];
        if c == b'\n' {
            line += 1;
            i += 1;
            continue;
        }
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        // line comments
        if c == b'/' && bytes.get(i + 1) == Some(&b'/') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        if c == b'"' {
            let start = i + 1;
            let mut j = start;
            while j < bytes.len() && bytes[j] != b'"' {
                if bytes[j] == b'\n' {
                    return Err(ScriptError::parse("unterminated string literal").at("", line));
                }
                j += 1;
            }
            if j >= bytes.len() {
                return Err(ScriptError::parse("unterminated string literal").at("", line));
            }
            let text = std::str::from_utf8(&bytes[start..j])
                .map_err(|_| ScriptError::parse("string literal is not valid utf-8"))?;
            tokens.push(Lexed {
                tok: Tok::Str(text.to_owned()),
                line,
            });
            i = j + 1;
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            if c == b'0' && bytes.get(i + 1) == Some(&b'x') {
                i += 2;
                while i < bytes.len() && bytes[i].is_ascii_hexdigit() {
                    i += 1;
                }
                let text = std::str::from_utf8(&bytes[start..i]).unwrap_or_default();
                tokens.push(Lexed {
                    tok: Tok::Int(text.to_owned()),
                    line,
                });
                continue;
            }
            let mut is_float = false;
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                if bytes[i] == b'.' {
                    if is_float || !bytes.get(i + 1).is_some_and(u8::is_ascii_digit) {
                        break;
                    }
                    is_float = true;
                }
                i += 1;
            }
            let text = std::str::from_utf8(&bytes[start..i]).unwrap_or_default();
            tokens.push(Lexed {
                tok: if is_float {
                    Tok::Float(text.to_owned())
                } else {
                    Tok::Int(text.to_owned())
                },
                line,
            });
            continue;
        }
        if c.is_ascii_alphabetic() || c == b'_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let text = std::str::from_utf8(&bytes[start..i]).unwrap_or_default();
            tokens.push(Lexed {
                tok: Tok::Ident(text.to_owned()),
                line,
            });
            continue;
        }
        let rest = &source[i..];
        let Some(p) = PUNCTUATION.iter().copied().find(|p| rest.starts_with(p)) else {
            return Err(ScriptError::parse(format!("unexpected character {:?}", c as char)).at("", line));
        };
        tokens.push(Lexed { tok: Tok::Punct(p), line });
        i += p.len();
    }

    tokens.push(Lexed { tok: Tok::Eof, line });
    Ok(tokens)
}

// ------------------------------------------------------------------
// parser

struct Parser<'ctx> {
    ctx: &'ctx mut ScriptContext,
    tokens: Vec<Lexed>,
    pos: usize,
    filename: String,
    tree: CompileTree,
    globals: VarTable,
    /// `(ns_hash, func_hash)` of the function whose body is being parsed.
    current_function: Option<(u32, u32)>,
}

impl Parser<'_> {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos].tok
    }

    fn peek_at(&self, ahead: usize) -> &Tok {
        let idx = (self.pos + ahead).min(self.tokens.len() - 1);
        &self.tokens[idx].tok
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos].line
    }

    fn at_end(&self) -> bool {
        matches!(self.peek(), Tok::Eof)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.tokens[self.pos].tok.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn err(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::parse(message).at(&self.filename, self.line())
    }

    /// Attaches the current position to an error from a lower layer,
    /// keeping its kind.
    fn at_here(&self, err: ScriptError) -> ScriptError {
        err.at(&self.filename, self.line())
    }

    fn eat_punct(&mut self, p: &str) -> ScriptResult<()> {
        if matches!(self.peek(), Tok::Punct(q) if *q == p) {
            self.advance();
            Ok(())
        } else {
            Err(self.err(format!("expected {p:?}, found {:?}", self.peek())))
        }
    }

    fn try_punct(&mut self, p: &str) -> bool {
        if matches!(self.peek(), Tok::Punct(q) if *q == p) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn try_keyword(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Tok::Ident(t) if t == word) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_ident(&mut self) -> ScriptResult<String> {
        match self.advance() {
            Tok::Ident(name) => Ok(name),
            other => Err(self.err(format!("expected an identifier, found {other:?}"))),
        }
    }

    /// Last node of a statement's sibling chain (statements are single
    /// nodes except `for` loops, which expand to init + loop).
    fn chain_tail(&self, id: NodeId) -> NodeId {
        let mut cursor = id;
        while let Some(next) = self.tree.node(cursor).next {
            cursor = next;
        }
        cursor
    }

    /// A type keyword at the cursor, when the token after it starts a
    /// declaration (identifier or `self`).
    fn peek_decl_type(&self) -> Option<VarType> {
        let Tok::Ident(word) = self.peek() else { return None };
        let ty = VarType::from_keyword(word)?;
        match self.peek_at(1) {
            Tok::Ident(_) => Some(ty),
            _ => None,
        }
    }

    // --------------------------------------------------------------
    // statements

    fn parse_statement(&mut self) -> ScriptResult<NodeId> {
        if let Some(ty) = self.peek_decl_type() {
            return self.parse_declaration(ty);
        }

        let line = self.line();
        if self.try_keyword("if") {
            return self.parse_if(line);
        }
        if self.try_keyword("while") {
            return self.parse_while(line);
        }
        if self.try_keyword("for") {
            return self.parse_for(line);
        }
        if self.try_keyword("return") {
            return self.parse_return(line);
        }
        if self.try_keyword("destroy") {
            let target = self.parse_expression()?;
            self.eat_punct(";")?;
            let node = self.tree.alloc(NodeKind::DestroyObject, line);
            self.tree.set_left(node, target);
            return Ok(node);
        }

        // bare expression statement
        let expr = self.parse_expression()?;
        self.eat_punct(";")?;
        Ok(expr)
    }

    /// A `{ ... }` block or a single statement; returns a `Nop` chain
    /// root either way.
    fn parse_block(&mut self) -> ScriptResult<NodeId> {
        let root = self.tree.alloc(NodeKind::Nop, self.line());
        let mut tail = root;
        if self.try_punct("{") {
            while !self.try_punct("}") {
                if self.at_end() {
                    return Err(self.err("unterminated block"));
                }
                let stmt = self.parse_statement()?;
                self.tree.set_next(tail, stmt);
                tail = self.chain_tail(stmt);
            }
        } else {
            let stmt = self.parse_statement()?;
            self.tree.set_next(tail, stmt);
        }
        Ok(root)
    }

    fn parse_if(&mut self, line: u32) -> ScriptResult<NodeId> {
        self.eat_punct("(")?;
        let condition = self.parse_expression()?;
        self.eat_punct(")")?;

        let true_branch = self.parse_block()?;
        let branch = self.tree.alloc(NodeKind::CondBranch, line);
        self.tree.set_left(branch, true_branch);
        if self.try_keyword("else") {
            let false_branch = if matches!(self.peek(), Tok::Ident(word) if word == "if") {
                // else-if: wrap the nested if in its own chain root
                let root = self.tree.alloc(NodeKind::Nop, self.line());
                let stmt = self.parse_statement()?;
                self.tree.set_next(root, stmt);
                root
            } else {
                self.parse_block()?
            };
            self.tree.set_right(branch, false_branch);
        }

        let node = self.tree.alloc(NodeKind::If, line);
        self.tree.set_left(node, condition);
        self.tree.set_right(node, branch);
        Ok(node)
    }

    fn parse_while(&mut self, line: u32) -> ScriptResult<NodeId> {
        self.eat_punct("(")?;
        let condition = self.parse_expression()?;
        self.eat_punct(")")?;
        let body = self.parse_block()?;

        let node = self.tree.alloc(NodeKind::WhileLoop, line);
        self.tree.set_left(node, condition);
        self.tree.set_right(node, body);
        Ok(node)
    }

    /// `for (init; cond; incr) body` lowers to `init; while (cond) {
    /// body; incr; }`.
    fn parse_for(&mut self, line: u32) -> ScriptResult<NodeId> {
        self.eat_punct("(")?;
        let init = if matches!(self.peek(), Tok::Punct(";")) {
            self.tree.alloc(NodeKind::Nop, line)
        } else if let Some(ty) = self.peek_decl_type() {
            // the declaration consumes its own terminating ';'
            let decl = self.parse_declaration(ty)?;
            return self.parse_for_rest(line, decl);
        } else {
            self.parse_expression()?
        };
        self.eat_punct(";")?;
        self.parse_for_rest(line, init)
    }

    fn parse_for_rest(&mut self, line: u32, init: NodeId) -> ScriptResult<NodeId> {
        let condition = if matches!(self.peek(), Tok::Punct(";")) {
            self.tree.alloc(
                NodeKind::Literal {
                    text: "true".to_owned(),
                    ty: VarType::Bool,
                },
                line,
            )
        } else {
            self.parse_expression()?
        };
        self.eat_punct(";")?;
        let increment = if matches!(self.peek(), Tok::Punct(")")) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.eat_punct(")")?;

        let body = self.parse_block()?;
        if let Some(increment) = increment {
            let tail = self.chain_tail(body);
            self.tree.set_next(tail, increment);
        }

        let loop_node = self.tree.alloc(NodeKind::WhileLoop, line);
        self.tree.set_left(loop_node, condition);
        self.tree.set_right(loop_node, body);

        self.tree.set_next(self.chain_tail(init), loop_node);
        Ok(init)
    }

    fn parse_return(&mut self, line: u32) -> ScriptResult<NodeId> {
        if self.current_function.is_none() {
            return Err(self.err("return outside of a function"));
        }
        let value = if matches!(self.peek(), Tok::Punct(";")) {
            // all functions return a value; void returns push int 0
            self.tree.alloc(
                NodeKind::Literal {
                    text: "0".to_owned(),
                    ty: VarType::Int,
                },
                line,
            )
        } else {
            self.parse_expression()?
        };
        self.eat_punct(";")?;
        let node = self.tree.alloc(NodeKind::FuncReturn, line);
        self.tree.set_left(node, value);
        Ok(node)
    }

    /// A statement starting with a type keyword: variable declaration,
    /// `self` dynamic-variable declaration, hashtable entry declaration,
    /// or function definition.
    fn parse_declaration(&mut self, ty: VarType) -> ScriptResult<NodeId> {
        let line = self.line();
        self.advance(); // the type keyword

        if self.try_keyword("self") {
            self.eat_punct(".")?;
            let name = self.expect_ident()?;
            self.eat_punct(";")?;
            let hash = self.ctx.string_table.add(&name)?;
            if self.current_function.is_none() {
                return Err(self.err("self variables can only be declared inside a method"));
            }
            return Ok(self.tree.alloc(NodeKind::SelfVarDecl { name, hash, ty }, line));
        }

        let first = self.expect_ident()?;

        // namespaced function definition: `type NS::Name(...)`
        if self.try_punct("::") {
            let method = self.expect_ident()?;
            return self.parse_function_def(ty, &first, &method, line);
        }

        // function definition: `type Name(...)`
        if matches!(self.peek(), Tok::Punct("(")) {
            return self.parse_function_def(ty, "", &first, line);
        }

        // hashtable entry declaration: `type table["key"];`
        if matches!(self.peek(), Tok::Punct("[")) {
            let table = self.variable_node(&first, line)?;
            let key = self.parse_index_chain(line)?;
            self.eat_punct(";")?;
            let node = self.tree.alloc(NodeKind::ArrayVarDecl { ty }, line);
            self.tree.set_left(node, table);
            self.tree.set_right(node, key);
            return Ok(node);
        }

        // plain variable declaration, with optional initializer
        if ty == VarType::Void {
            return Err(self.err(format!("cannot declare {first} as void")));
        }
        let hash = self.ctx.string_table.add(&first)?;
        if let Some((ns_hash, func_hash)) = self.current_function {
            self.ctx
                .find_function_mut(ns_hash, func_hash)?
                .context_mut()
                .add_local(&first, hash, ty)
                .map_err(|e| self.at_here(e))?;
        } else if self.globals.contains_key(&hash) {
            return Err(self.err(format!("duplicate declaration of {first}")));
        } else {
            self.globals.insert(hash, VariableEntry::new(&first, hash, ty));
        }

        if self.try_punct("=") {
            let value = self.parse_assignment_rhs()?;
            self.eat_punct(";")?;
            let target = self.variable_node(&first, line)?;
            let assign = self.tree.alloc(
                NodeKind::BinaryOp {
                    op: Opcode::Assign,
                    is_assign: true,
                },
                line,
            );
            self.tree.set_left(assign, target);
            self.tree.set_right(assign, value);
            Ok(assign)
        } else {
            self.eat_punct(";")?;
            Ok(self.tree.alloc(NodeKind::Nop, line))
        }
    }

    fn parse_function_def(&mut self, return_type: VarType, ns_name: &str, name: &str, line: u32) -> ScriptResult<NodeId> {
        if self.current_function.is_some() {
            return Err(self.err("function definitions cannot nest"));
        }
        let ns_hash = if ns_name.is_empty() {
            0
        } else {
            self.ctx.string_table.add(ns_name)?;
            hash_string(ns_name)
        };
        let func_hash = self.ctx.string_table.add(name)?;

        self.ctx
            .declare_parsed_function(ns_hash, ns_name, name, func_hash, return_type)
            .map_err(|e| self.at_here(e))?;

        self.eat_punct("(")?;
        if !self.try_punct(")") {
            loop {
                let Tok::Ident(type_word) = self.advance() else {
                    return Err(self.err("expected a parameter type"));
                };
                let Some(param_type) = VarType::from_keyword(&type_word) else {
                    return Err(self.err(format!("unknown parameter type {type_word}")));
                };
                let param_name = self.expect_ident()?;
                let param_hash = self.ctx.string_table.add(&param_name)?;
                self.ctx
                    .find_function_mut(ns_hash, func_hash)?
                    .context_mut()
                    .add_parameter(&param_name, param_hash, param_type)
                    .map_err(|e| self.at_here(e))?;
                if !self.try_punct(",") {
                    break;
                }
            }
            self.eat_punct(")")?;
        }

        self.current_function = Some((ns_hash, func_hash));
        let body = self.parse_block()?;

        // every function returns a value; bodies that fall off the end
        // get an implicit `return 0;`
        let zero = self.tree.alloc(
            NodeKind::Literal {
                text: "0".to_owned(),
                ty: VarType::Int,
            },
            self.line(),
        );
        let implicit_return = self.tree.alloc(NodeKind::FuncReturn, self.line());
        self.tree.set_left(implicit_return, zero);
        let tail = self.chain_tail(body);
        self.tree.set_next(tail, implicit_return);

        self.current_function = None;

        let node = self.tree.alloc(
            NodeKind::FuncDecl {
                name: name.to_owned(),
                hash: func_hash,
                ns_name: ns_name.to_owned(),
                ns_hash,
            },
            line,
        );
        self.tree.set_left(node, body);
        Ok(node)
    }

    // --------------------------------------------------------------
    // expressions

    fn parse_expression(&mut self) -> ScriptResult<NodeId> {
        let lhs = self.parse_binary(0)?;

        // assignment is right-associative and lowest precedence
        let assign_op = match self.peek() {
            Tok::Punct("=") => Some(Opcode::Assign),
            Tok::Punct("+=") => Some(Opcode::AssignAdd),
            Tok::Punct("-=") => Some(Opcode::AssignSub),
            Tok::Punct("*=") => Some(Opcode::AssignMult),
            Tok::Punct("/=") => Some(Opcode::AssignDiv),
            Tok::Punct("%=") => Some(Opcode::AssignMod),
            Tok::Punct("<<=") => Some(Opcode::AssignLeftShift),
            Tok::Punct(">>=") => Some(Opcode::AssignRightShift),
            Tok::Punct("&=") => Some(Opcode::AssignBitAnd),
            Tok::Punct("|=") => Some(Opcode::AssignBitOr),
            Tok::Punct("^=") => Some(Opcode::AssignBitXor),
            _ => None,
        };
        let Some(op) = assign_op else { return Ok(lhs) };
        let line = self.line();
        self.advance();
        let rhs = self.parse_assignment_rhs()?;
        let node = self.tree.alloc(NodeKind::BinaryOp { op, is_assign: true }, line);
        self.tree.set_left(node, lhs);
        self.tree.set_right(node, rhs);
        Ok(node)
    }

    fn parse_assignment_rhs(&mut self) -> ScriptResult<NodeId> {
        self.parse_expression()
    }

    fn binary_op_at(&self, min_precedence: u8) -> Option<(Opcode, u8)> {
        let (op, precedence) = match self.peek() {
            Tok::Punct("||") => (Opcode::BooleanOr, 1),
            Tok::Punct("&&") => (Opcode::BooleanAnd, 2),
            Tok::Punct("|") => (Opcode::BitOr, 3),
            Tok::Punct("^") => (Opcode::BitXor, 4),
            Tok::Punct("&") => (Opcode::BitAnd, 5),
            Tok::Punct("==") => (Opcode::CompareEqual, 6),
            Tok::Punct("!=") => (Opcode::CompareNotEqual, 6),
            Tok::Punct("<") => (Opcode::CompareLess, 7),
            Tok::Punct("<=") => (Opcode::CompareLessEqual, 7),
            Tok::Punct(">") => (Opcode::CompareGreater, 7),
            Tok::Punct(">=") => (Opcode::CompareGreaterEqual, 7),
            Tok::Punct("<<") => (Opcode::BitLeftShift, 8),
            Tok::Punct(">>") => (Opcode::BitRightShift, 8),
            Tok::Punct("+") => (Opcode::Add, 9),
            Tok::Punct("-") => (Opcode::Sub, 9),
            Tok::Punct("*") => (Opcode::Mult, 10),
            Tok::Punct("/") => (Opcode::Div, 10),
            Tok::Punct("%") => (Opcode::Mod, 10),
            _ => return None,
        };
        (precedence >= min_precedence).then_some((op, precedence))
    }

    fn parse_binary(&mut self, min_precedence: u8) -> ScriptResult<NodeId> {
        let mut lhs = self.parse_unary()?;
        while let Some((op, precedence)) = self.binary_op_at(min_precedence) {
            let line = self.line();
            self.advance();
            let rhs = self.parse_binary(precedence + 1)?;
            let node = self.tree.alloc(NodeKind::BinaryOp { op, is_assign: false }, line);
            self.tree.set_left(node, lhs);
            self.tree.set_right(node, rhs);
            lhs = node;
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> ScriptResult<NodeId> {
        let line = self.line();
        let op = match self.peek() {
            Tok::Punct("!") => Some(Opcode::UnaryNot),
            Tok::Punct("~") => Some(Opcode::UnaryBitInvert),
            Tok::Punct("-") => Some(Opcode::UnaryNeg),
            Tok::Punct("+") => Some(Opcode::UnaryPos),
            Tok::Punct("++") => Some(Opcode::UnaryPreInc),
            Tok::Punct("--") => Some(Opcode::UnaryPreDec),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            let node = self.tree.alloc(NodeKind::UnaryOp { op }, line);
            self.tree.set_left(node, operand);
            return Ok(node);
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> ScriptResult<NodeId> {
        let mut expr = self.parse_primary()?;
        let mut member_depth = 0u32;
        loop {
            if self.try_punct(".") {
                let line = self.line();
                let name = self.expect_ident()?;
                let hash = self.ctx.string_table.add(&name)?;
                if matches!(self.peek(), Tok::Punct("(")) {
                    // method invocation on the object expression
                    let call = self.parse_call_arguments(&name, hash, 0, true, line)?;
                    let node = self.tree.alloc(NodeKind::ObjMethod, line);
                    self.tree.set_left(node, expr);
                    self.tree.set_right(node, call);
                    expr = node;
                    member_depth = 0;
                } else {
                    // first level is an object member; deeper levels
                    // dereference sub-fields of the member's value
                    let kind = if member_depth == 0 {
                        NodeKind::ObjMember { hash }
                    } else {
                        NodeKind::PodMember { hash }
                    };
                    let node = self.tree.alloc(kind, line);
                    self.tree.set_left(node, expr);
                    expr = node;
                    member_depth += 1;
                }
                continue;
            }
            break;
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> ScriptResult<NodeId> {
        let line = self.line();
        match self.advance() {
            Tok::Int(text) => Ok(self.tree.alloc(NodeKind::Literal { text, ty: VarType::Int }, line)),
            Tok::Float(text) => Ok(self.tree.alloc(
                NodeKind::Literal {
                    text,
                    ty: VarType::Float,
                },
                line,
            )),
            Tok::Str(text) => {
                self.ctx.string_table.add(&text)?;
                Ok(self.tree.alloc(
                    NodeKind::Literal {
                        text,
                        ty: VarType::String,
                    },
                    line,
                ))
            }
            Tok::Punct("(") => {
                let inner = self.parse_expression()?;
                self.eat_punct(")")?;
                Ok(inner)
            }
            Tok::Ident(word) => match word.as_str() {
                "true" | "false" => Ok(self.tree.alloc(
                    NodeKind::Literal {
                        text: word,
                        ty: VarType::Bool,
                    },
                    line,
                )),
                "self" => Ok(self.tree.alloc(NodeKind::SelfRef, line)),
                "create" => self.parse_create(line),
                "schedule" => self.parse_schedule(false, line),
                "execute" => self.parse_schedule(true, line),
                _ => self.parse_identifier_expression(&word, line),
            },
            other => Err(self.err(format!("unexpected token {other:?}"))),
        }
    }

    /// `create ClassName("name")`
    fn parse_create(&mut self, line: u32) -> ScriptResult<NodeId> {
        let class_name = self.expect_ident()?;
        self.ctx.string_table.add(&class_name)?;
        let class_hash = hash_string(&class_name);
        self.eat_punct("(")?;
        let name = if self.try_punct(")") {
            self.tree.alloc(
                NodeKind::Literal {
                    text: String::new(),
                    ty: VarType::String,
                },
                line,
            )
        } else {
            let name = self.parse_expression()?;
            self.eat_punct(")")?;
            name
        };
        let node = self.tree.alloc(NodeKind::CreateObject { class_hash }, line);
        self.tree.set_left(node, name);
        Ok(node)
    }

    /// `schedule(obj, delay_ms, "Func", args...)` and its synchronous
    /// sibling `execute(obj, "Func", args...)`.
    fn parse_schedule(&mut self, immediate: bool, line: u32) -> ScriptResult<NodeId> {
        self.eat_punct("(")?;
        let object = self.parse_expression()?;
        self.eat_punct(",")?;
        let delay = if immediate {
            self.tree.alloc(
                NodeKind::Literal {
                    text: "0".to_owned(),
                    ty: VarType::Int,
                },
                line,
            )
        } else {
            let delay = self.parse_expression()?;
            self.eat_punct(",")?;
            delay
        };

        let func_hash = match self.advance() {
            Tok::Str(name) | Tok::Ident(name) => {
                self.ctx.string_table.add(&name)?;
                hash_string(&name)
            }
            other => return Err(self.err(format!("expected a function name, found {other:?}"))),
        };

        let params_root = self.tree.alloc(NodeKind::Nop, line);
        let mut tail = params_root;
        let mut index = 1u32;
        while self.try_punct(",") {
            let value = self.parse_expression()?;
            let param = self.tree.alloc(NodeKind::SchedParam { index }, line);
            self.tree.set_left(param, value);
            self.tree.set_next(tail, param);
            tail = param;
            index += 1;
        }
        self.eat_punct(")")?;

        let sched_func = self.tree.alloc(NodeKind::SchedFunc { func_hash, immediate }, line);
        self.tree.set_left(sched_func, object);
        self.tree.set_right(sched_func, params_root);

        let node = self.tree.alloc(NodeKind::Schedule, line);
        self.tree.set_left(node, delay);
        self.tree.set_right(node, sched_func);
        Ok(node)
    }

    /// An identifier in expression position: a call, a namespaced call,
    /// an indexed hashtable, or a plain variable reference.
    fn parse_identifier_expression(&mut self, name: &str, line: u32) -> ScriptResult<NodeId> {
        if self.try_punct("::") {
            // `NS::Method(...)`: a method dispatched from a specific
            // namespace. Inside a method the target is `self`; at
            // global scope the first argument supplies the object.
            let ns_hash = {
                self.ctx.string_table.add(name)?;
                hash_string(name)
            };
            let method = self.expect_ident()?;
            let method_hash = self.ctx.string_table.add(&method)?;
            self.eat_punct("(")?;

            // inside a method body this dispatches on `self` (the
            // super-call form); elsewhere the first argument is the object
            let in_method = self.current_function.is_some_and(|(ns, _)| ns != 0);
            let target = if in_method {
                self.tree.alloc(NodeKind::SelfRef, line)
            } else {
                let object = self.parse_expression()?;
                if !self.try_punct(",") && !matches!(self.peek(), Tok::Punct(")")) {
                    return Err(self.err("expected ',' after the object argument"));
                }
                object
            };
            let call = self.parse_call_arguments_inner(&method, method_hash, ns_hash, true, line)?;
            let node = self.tree.alloc(NodeKind::ObjMethod, line);
            self.tree.set_left(node, target);
            self.tree.set_right(node, call);
            return Ok(node);
        }

        if matches!(self.peek(), Tok::Punct("(")) {
            let hash = self.ctx.string_table.add(name)?;
            return self.parse_call_arguments(name, hash, 0, false, line);
        }

        self.variable_reference(name, line)
    }

    /// Parses `(` args `)` and builds a `FuncCall` node.
    fn parse_call_arguments(
        &mut self,
        name: &str,
        hash: u32,
        ns_hash: u32,
        is_method: bool,
        line: u32,
    ) -> ScriptResult<NodeId> {
        self.eat_punct("(")?;
        self.parse_call_arguments_inner(name, hash, ns_hash, is_method, line)
    }

    /// Continues after `(` (and, for namespaced methods, the consumed
    /// object argument).
    fn parse_call_arguments_inner(
        &mut self,
        name: &str,
        hash: u32,
        ns_hash: u32,
        is_method: bool,
        line: u32,
    ) -> ScriptResult<NodeId> {
        let args_root = self.tree.alloc(NodeKind::Nop, line);
        let mut tail = args_root;
        let mut index = 1u32;
        if !self.try_punct(")") {
            loop {
                let value = self.parse_expression()?;
                // each argument lowers to `param[i] = value`
                let target = self.tree.alloc(NodeKind::ParamRef { index }, line);
                let assign = self.tree.alloc(
                    NodeKind::BinaryOp {
                        op: Opcode::Assign,
                        is_assign: true,
                    },
                    line,
                );
                self.tree.set_left(assign, target);
                self.tree.set_right(assign, value);
                self.tree.set_next(tail, assign);
                tail = assign;
                index += 1;
                if !self.try_punct(",") {
                    break;
                }
            }
            self.eat_punct(")")?;
        }

        let node = self.tree.alloc(
            NodeKind::FuncCall {
                name: name.to_owned(),
                hash,
                ns_hash,
                is_method,
            },
            line,
        );
        self.tree.set_left(node, args_root);
        Ok(node)
    }

    /// A plain or indexed variable reference.
    fn variable_reference(&mut self, name: &str, line: u32) -> ScriptResult<NodeId> {
        let node = self.variable_node(name, line)?;
        if matches!(self.peek(), Tok::Punct("[")) {
            let key = self.parse_index_chain(line)?;
            self.tree.set_right(node, key);
        }
        Ok(node)
    }

    fn variable_node(&mut self, name: &str, line: u32) -> ScriptResult<NodeId> {
        let hash = self.ctx.string_table.add(name)?;
        Ok(self.tree.alloc(
            NodeKind::Identifier {
                name: name.to_owned(),
                hash,
            },
            line,
        ))
    }

    /// `[k1, k2, ...]`: builds the ArrayHash accumulation tree, seeded
    /// with the int 0.
    fn parse_index_chain(&mut self, line: u32) -> ScriptResult<NodeId> {
        self.eat_punct("[")?;
        let mut accumulated = self.tree.alloc(
            NodeKind::Literal {
                text: "0".to_owned(),
                ty: VarType::Int,
            },
            line,
        );
        loop {
            let part = self.parse_expression()?;
            let hash_node = self.tree.alloc(NodeKind::ArrayHash, line);
            self.tree.set_left(hash_node, accumulated);
            self.tree.set_right(hash_node, part);
            accumulated = hash_node;
            if !self.try_punct(",") {
                break;
            }
        }
        self.eat_punct("]")?;
        Ok(accumulated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lex_basic_tokens() {
        let tokens = lex("int x = 3; // comment\nx += 0x1f;").unwrap();
        let kinds: Vec<&Tok> = tokens.iter().map(|t| &t.tok).collect();
        assert!(matches!(kinds[0], Tok::Ident(w) if w == "int"));
        assert!(matches!(kinds[3], Tok::Int(w) if w == "3"));
        assert!(matches!(kinds[6], Tok::Punct("+=")));
        assert!(matches!(kinds[7], Tok::Int(w) if w == "0x1f"));
    }

    #[test]
    fn lex_tracks_lines() {
        let tokens = lex("a\nb\n\nc").unwrap();
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[1].line, 2);
        assert_eq!(tokens[2].line, 4);
    }

    #[test]
    fn lex_string_literal() {
        let tokens = lex("Print(\"hello world\");").unwrap();
        assert!(tokens.iter().any(|t| matches!(&t.tok, Tok::Str(s) if s == "hello world")));
    }

    #[test]
    fn lex_rejects_unterminated_string() {
        assert!(lex("\"oops").is_err());
    }

    #[test]
    fn float_vs_member_access() {
        let tokens = lex("1.5 a.b").unwrap();
        assert!(matches!(&tokens[0].tok, Tok::Float(f) if f == "1.5"));
        assert!(matches!(&tokens[2].tok, Tok::Punct(".")));
    }
}
