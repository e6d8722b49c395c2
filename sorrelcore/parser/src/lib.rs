/*

 ▄▄▄▄    ██▓    ▄▄▄       ▄████▄   ██ ▄█▀ ██▀███   █    ██   ██████  ██░ ██
▓█████▄ ▓██▒   ▒████▄    ▒██▀ ▀█   ██▄█▒ ▓██ ▒ ██▒ ██  ▓██▒▒██    ▒ ▓██░ ██▒
▒██▒ ▄██▒██░   ▒██  ▀█▄  ▒▓█    ▄ ▓███▄░ ▓██ ░▄█ ▒▓██  ▒██░░ ▓██▄   ▒██▀▀██░
▒██░█▀  ▒██░   ░██▄▄▄▄██ ▒▓▓▄ ▄██▒▓██ █▄ ▒██▀▀█▄  ▓▓█  ░██░  ▒   ██▒░▓█ ░██
░▓█  ▀█▓░██████▒▓█   ▓██▒▒ ▓███▀ ░▒██▒ █▄░██▓ ▒██▒▒▒█████▓ ▒██████▒▒░▓█▒░██▓
░▒▓███▀▒░ ▒░▓  ░▒▒   ▓▒█░░ ░▒ ▒  ░▒ ▒▒ ▓▒░ ▒▓ ░▒▓░░▒▓▒ ▒ ▒ ▒ ▒▓▒ ▒ ░ ▒ ░░▒░▒
▒░▒   ░ ░ ░ ▒  ░ ▒   ▒▒ ░  ░  ▒   ░ ░▒ ▒░  ░▒ ░ ▒░░░▒░ ░ ░ ░ ░▒  ░ ░ ▒ ░▒░ ░
 ░    ░   ░ ░    ░   ▒   ░        ░ ░░ ░   ░░   ░  ░░░ ░ ░ ░  ░  ░   ░  ░░ ░
 ░          ░  ░     ░  ░░ ░      ░  ░      ░        ░           ░   ░  ░  ░
      ░                  ░
Copyright (C) 2026, Blackrush LLC, All Rights Reserved
Created by Erik Olson, Tarpon Springs, Florida
For more information, visit BlackrushDrive.com

MIT License

Copyright (c) 2026 Erik Lee Olson for Blackrush, LLC

Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:

The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.

THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.

*/

//! Pushdown-automaton parser/compiler: a precomputed state table drives
//! statement structure, semantic callbacks build the command tree while
//! resolving scopes and overloads, and an explicit frame stack replaces
//! native call recursion for nested constructs.
use std::collections::HashMap;
use std::path::PathBuf;

use sorrel_ast::{
    AssignOp, BlockKind, Cmd, CmdBlock, ConstObj, FuncObj, ObjId, ObjKind, Object, TypeId,
    TypeKind, Unit, Workspace, T_ANY, T_ARR, T_BOOL, T_CHAR, T_INT, T_MAP, T_NONE, T_STR,
    T_STRUCT,
};
use sorrel_common::{Result, SorrelError};
use sorrel_lexer::{Lex, TokenKind};

mod expr;
mod table;

use expr::expr;
use table::{table, Flow, State};

/// Compile one source unit into the workspace.
pub fn compile_unit(ws: &mut Workspace, src: &str, path: &str) -> Result<()> {
    let lex = sorrel_lexer::tokenize(src)?;
    let unit = ws.units.len();
    let tok_pos = lex
        .tokens
        .iter()
        .map(|t| lex.line_col(t.span.start))
        .collect();
    ws.units.push(Unit { path: path.to_string(), tok_pos });
    Parser::new(ws, &lex, unit).drive()
}

/// Compile a unit from disk, transitively following `include`s and
/// deduplicating already-compiled paths.
pub fn compile_file(ws: &mut Workspace, path: &str) -> Result<()> {
    let canon = PathBuf::from(path)
        .canonicalize()
        .map_err(|e| SorrelError(format!("cannot open '{}': {}", path, e)))?;
    if ws.included.contains(&canon) {
        return Ok(());
    }
    ws.included.insert(canon.clone());
    let src = std::fs::read_to_string(&canon)
        .map_err(|e| SorrelError(format!("cannot read '{}': {}", path, e)))?;
    compile_unit(ws, &src, path)
}

struct Scope {
    block: CmdBlock,
    names: HashMap<String, usize>,
}

impl Scope {
    fn new(tok: u32) -> Self {
        Self { block: CmdBlock::new(BlockKind::Plain, tok), names: HashMap::new() }
    }
}

enum Origin {
    FnBody,
    IfArm,
    ElseArm,
    WhileBody,
    ForBody,
    SwitchCase,
    TryBody,
    CatchBody,
    SpawnBody { assign: Option<(u16, u16, u32)> },
}

struct PdaFrame {
    origin: Origin,
    oneline: bool,
}

enum Construct {
    If { children: Vec<Cmd>, tok: u32 },
    While { cond: Cmd, tok: u32 },
    For { container: Cmd, tok: u32 },
    Switch { children: Vec<Cmd>, subj: TypeId, has_default: bool, tok: u32 },
    Try { body: Option<Cmd>, tok: u32 },
}

#[derive(Default)]
struct PendingFn {
    name: String,
    tok: u32,
    pars: Vec<(String, TypeId)>,
    par_type: Option<TypeId>,
    ret: Option<TypeId>,
    any_ret: bool,
    is_run: bool,
    obj: Option<ObjId>,
    saved_loop_depth: usize,
}

#[derive(Default)]
struct PendingStruct {
    name: String,
    tok: u32,
    fields: Vec<(String, TypeId)>,
    field_type: Option<TypeId>,
}

pub struct Parser<'w, 'l> {
    ws: &'w mut Workspace,
    lex: &'l Lex,
    unit: usize,
    i: usize,
    scopes: Vec<Scope>,
    saved_scopes: Vec<Vec<Scope>>,
    frames: Vec<PdaFrame>,
    constructs: Vec<Construct>,
    fns: Vec<PendingFn>,
    decl: Option<PendingFn>,
    pending_struct: Option<PendingStruct>,
    pending_const: Option<(String, u32)>,
    loop_depth: usize,
    spawn_count: usize,
}

impl<'w, 'l> Parser<'w, 'l> {
    fn new(ws: &'w mut Workspace, lex: &'l Lex, unit: usize) -> Self {
        Self {
            ws,
            lex,
            unit,
            i: 0,
            scopes: Vec::new(),
            saved_scopes: Vec::new(),
            frames: Vec::new(),
            constructs: Vec::new(),
            fns: Vec::new(),
            decl: None,
            pending_struct: None,
            pending_const: None,
            loop_depth: 0,
            spawn_count: 0,
        }
    }

    /// The automaton driver: look up `table[state][token]`, fire the
    /// rule, honor whatever control transfer its callback asks for.
    fn drive(&mut self) -> Result<()> {
        let mut state = State::Unit;
        loop {
            let tok = self.peek();
            let rule = table()[state as usize][tok as usize];
            let Some(rule) = rule else {
                return Err(self.err_here(&format!(
                    "unexpected token '{}'",
                    self.describe_tok(self.i)
                )));
            };
            if !rule.again {
                self.i += 1;
            }
            let flow = match rule.enter {
                Some(cb) => cb(self)?,
                None => Flow::Ok,
            };
            match flow {
                Flow::Ok => state = rule.next,
                Flow::Redirect(s) => state = s,
                Flow::Stop => return Ok(()),
            }
        }
    }

    // --- token helpers ---

    fn peek(&self) -> TokenKind {
        self.lex.tokens[self.i].kind
    }

    fn peek_at(&self, i: usize) -> TokenKind {
        self.lex.tokens[i].kind
    }

    fn peek_past_newlines(&self) -> (usize, TokenKind) {
        let mut j = self.i;
        while self.lex.tokens[j].kind == TokenKind::NewLine {
            j += 1;
        }
        (j, self.lex.tokens[j].kind)
    }

    fn skip_newlines(&mut self) {
        while self.peek() == TokenKind::NewLine {
            self.i += 1;
        }
    }

    fn prev_tok(&self) -> u32 {
        (self.i - 1) as u32
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<usize> {
        if self.peek() == kind {
            let i = self.i;
            self.i += 1;
            Ok(i)
        } else {
            Err(self.err_here(&format!("expected {}", what)))
        }
    }

    fn describe_tok(&self, i: usize) -> String {
        match self.peek_at(i) {
            TokenKind::Eof => "end of file".to_string(),
            TokenKind::NewLine => "end of line".to_string(),
            _ => self.lex.token_text(i).to_string(),
        }
    }

    fn err_at(&self, tok: usize, msg: &str) -> SorrelError {
        let (line, col) = self.lex.token_line_col(tok.min(self.lex.tokens.len() - 1));
        SorrelError(format!("parse error at {}:{}: {}", line, col, msg))
    }

    fn err_here(&self, msg: &str) -> SorrelError {
        self.err_at(self.i, msg)
    }

    // --- scopes and variables ---

    fn declare_var(&mut self, name: &str, typ: TypeId, tok: usize) -> Result<(usize, usize)> {
        if self.ws.base_names.contains(name) {
            return Err(self.err_at(tok, &format!("cannot shadow '{}'", name)));
        }
        let block = self.scopes.len() - 1;
        let scope = self.scopes.last_mut().expect("no open scope");
        if scope.names.contains_key(name) {
            return Err(self.err_at(tok, &format!("variable '{}' already declared", name)));
        }
        let ord = scope.block.vars.len();
        scope.block.vars.push(typ);
        scope.block.var_names.push(name.to_string());
        scope.names.insert(name.to_string(), ord);
        Ok((block, ord))
    }

    fn resolve_var(&self, name: &str) -> Option<(usize, usize, TypeId)> {
        for (bi, scope) in self.scopes.iter().enumerate().rev() {
            if let Some(&ord) = scope.names.get(name) {
                return Some((bi, ord, scope.block.vars[ord]));
            }
        }
        None
    }

    fn make_var(&self, block: usize, ord: usize, typ: TypeId, tok: u32) -> Cmd {
        Cmd::Var { block: block as u16, slot: ord as u16, typ, tok, idx: Vec::new() }
    }

    fn append_stmt(&mut self, cmd: Cmd) {
        self.scopes
            .last_mut()
            .expect("statement outside block")
            .block
            .children
            .push(cmd);
    }

    fn assign_stmt(&self, target: Cmd, value: Cmd, tok: u32) -> Cmd {
        let mut blk = CmdBlock::new(BlockKind::Assign(AssignOp::Set), tok);
        blk.children = vec![target, value];
        Cmd::Block(blk)
    }

    /// Can a value of type `value` be stored in a slot of type `target`?
    fn assignable(&self, target: TypeId, value: TypeId) -> bool {
        if target == value || target == T_ANY {
            return true;
        }
        match self.ws.types[target].kind {
            TypeKind::Arr => target == T_ARR && self.ws.types[value].kind == TypeKind::Arr,
            TypeKind::Map => target == T_MAP && self.ws.types[value].kind == TypeKind::Map,
            _ => false,
        }
    }

    /// Type name, optionally `base.elem` for arrays and maps.
    fn parse_type(&mut self) -> Result<TypeId> {
        let i = self.i;
        let name = self.lex.token_text(i).to_string();
        let t = self
            .ws
            .type_by_name(&name)
            .ok_or_else(|| self.err_at(i, &format!("unknown type '{}'", name)))?;
        self.i += 1;
        if t == T_NONE || t == T_STRUCT {
            return Err(self.err_at(i, &format!("cannot use type '{}' here", name)));
        }
        if (t == T_ARR || t == T_MAP) && self.peek() == TokenKind::Dot {
            self.i += 1;
            let ei = self.expect(TokenKind::Ident, "element type name")?;
            let ename = self.lex.token_text(ei).to_string();
            let elem = self
                .ws
                .type_by_name(&ename)
                .ok_or_else(|| self.err_at(ei, &format!("unknown type '{}'", ename)))?;
            if elem == T_NONE || elem == T_STRUCT {
                return Err(self.err_at(ei, &format!("cannot use type '{}' here", ename)));
            }
            return Ok(if t == T_ARR { self.ws.arr_of(elem) } else { self.ws.map_of(elem) });
        }
        Ok(t)
    }

    /// Consume `{` (block body) or `:` (one-line body) and open a scope.
    fn open_body(&mut self, origin: Origin) -> Result<()> {
        self.skip_newlines();
        let oneline = match self.peek() {
            TokenKind::LBrace => false,
            TokenKind::Colon => true,
            _ => return Err(self.err_here("expected '{' or ':'")),
        };
        let tok = self.i as u32;
        self.i += 1;
        self.scopes.push(Scope::new(tok));
        self.frames.push(PdaFrame { origin, oneline });
        Ok(())
    }

    // --- block closing (the "back"/exit path of the automaton) ---

    /// Close the innermost block. `oneline` says which trigger fired
    /// (newline vs '}'); `allow_chain` permits elif/else continuation.
    fn close_current(&mut self, oneline: bool, allow_chain: bool) -> Result<Flow> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| self.err_here("unexpected '}'"))?;
        if frame.oneline != oneline {
            let msg = if oneline { "unexpected end of line" } else { "unexpected '}'" };
            return Err(self.err_here(msg));
        }
        let scope = self.scopes.pop().expect("no scope for open block");
        let blk = Cmd::Block(scope.block);
        match frame.origin {
            Origin::FnBody => self.close_fn(blk),
            Origin::IfArm => {
                match self.constructs.last_mut() {
                    Some(Construct::If { children, .. }) => children.push(blk),
                    _ => unreachable!("if arm without if construct"),
                }
                if allow_chain {
                    let (j, k) = self.peek_past_newlines();
                    if k == TokenKind::KwElif {
                        self.i = j + 1;
                        let cond = expr(self)?;
                        self.check_cond(&cond, "elif")?;
                        match self.constructs.last_mut() {
                            Some(Construct::If { children, .. }) => children.push(cond),
                            _ => unreachable!(),
                        }
                        self.open_body(Origin::IfArm)?;
                        return Ok(Flow::Redirect(State::Body));
                    }
                    if k == TokenKind::KwElse {
                        self.i = j + 1;
                        self.open_body(Origin::ElseArm)?;
                        return Ok(Flow::Redirect(State::Body));
                    }
                }
                self.finish_if()
            }
            Origin::ElseArm => {
                match self.constructs.last_mut() {
                    Some(Construct::If { children, .. }) => children.push(blk),
                    _ => unreachable!("else arm without if construct"),
                }
                self.finish_if()
            }
            Origin::WhileBody => {
                let (cond, tok) = match self.constructs.pop() {
                    Some(Construct::While { cond, tok }) => (cond, tok),
                    _ => unreachable!("while body without while construct"),
                };
                self.loop_depth -= 1;
                let mut node = CmdBlock::new(BlockKind::While, tok);
                node.children = vec![cond, blk];
                self.append_stmt(Cmd::Block(node));
                Ok(Flow::Redirect(State::Body))
            }
            Origin::ForBody => {
                let (container, tok) = match self.constructs.pop() {
                    Some(Construct::For { container, tok }) => (container, tok),
                    _ => unreachable!("for body without for construct"),
                };
                self.loop_depth -= 1;
                // the outer scope carries the loop variable and hidden slots
                let outer = self.scopes.pop().expect("for scope");
                let mut node = outer.block;
                node.kind = BlockKind::For;
                node.tok = tok;
                node.children = vec![container, blk];
                self.append_stmt(Cmd::Block(node));
                Ok(Flow::Redirect(State::Body))
            }
            Origin::SwitchCase => {
                match self.constructs.last_mut() {
                    Some(Construct::Switch { children, .. }) => children.push(blk),
                    _ => unreachable!("case body without switch construct"),
                }
                self.finish_switch()
            }
            Origin::TryBody => {
                match self.constructs.last_mut() {
                    Some(Construct::Try { body, .. }) => *body = Some(blk),
                    _ => unreachable!("try body without try construct"),
                }
                let (j, k) = self.peek_past_newlines();
                if k != TokenKind::KwCatch {
                    return Err(self.err_at(j, "expected 'catch'"));
                }
                self.i = j + 1;
                let name_i = self.expect(TokenKind::Ident, "catch variable name")?;
                let name = self.lex.token_text(name_i).to_string();
                self.skip_newlines();
                let brace = self.expect(TokenKind::LBrace, "'{'")?;
                self.scopes.push(Scope::new(brace as u32));
                self.declare_var(&name, T_STR, name_i)?;
                self.frames.push(PdaFrame { origin: Origin::CatchBody, oneline: false });
                Ok(Flow::Redirect(State::Body))
            }
            Origin::CatchBody => {
                let (body, tok) = match self.constructs.pop() {
                    Some(Construct::Try { body, tok }) => (body.expect("try body"), tok),
                    _ => unreachable!("catch body without try construct"),
                };
                let mut node = CmdBlock::new(BlockKind::Try, tok);
                node.children = vec![body, blk];
                self.append_stmt(Cmd::Block(node));
                Ok(Flow::Redirect(State::Body))
            }
            Origin::SpawnBody { assign } => {
                let pend = self.fns.pop().expect("spawn body without pending fn");
                self.loop_depth = pend.saved_loop_depth;
                let obj = pend.obj.expect("spawn object");
                let body = match blk {
                    Cmd::Block(b) => b,
                    _ => unreachable!(),
                };
                if let ObjKind::Func(f) = &mut self.ws.objects[obj].kind {
                    f.body = body;
                }
                self.scopes = self.saved_scopes.pop().expect("saved scopes");
                let call = Cmd::SpawnCall { obj, tok: pend.tok };
                match assign {
                    Some((block, slot, tok)) => {
                        let target = self.make_var(block as usize, slot as usize, T_INT, tok);
                        let stmt = self.assign_stmt(target, call, tok);
                        self.append_stmt(stmt);
                    }
                    None => self.append_stmt(call),
                }
                Ok(Flow::Redirect(State::Body))
            }
        }
    }

    fn finish_if(&mut self) -> Result<Flow> {
        let (children, tok) = match self.constructs.pop() {
            Some(Construct::If { children, tok }) => (children, tok),
            _ => unreachable!("finish_if without if construct"),
        };
        let mut node = CmdBlock::new(BlockKind::If, tok);
        node.children = children;
        self.append_stmt(Cmd::Block(node));
        Ok(Flow::Redirect(State::Body))
    }

    fn finish_switch(&mut self) -> Result<Flow> {
        let (children, tok) = match self.constructs.pop() {
            Some(Construct::Switch { children, tok, .. }) => (children, tok),
            _ => unreachable!("finish_switch without switch construct"),
        };
        let outer = self.scopes.pop().expect("switch scope");
        let mut node = outer.block;
        node.kind = BlockKind::Switch;
        node.tok = tok;
        node.children = children;
        self.append_stmt(Cmd::Block(node));
        Ok(Flow::Redirect(State::Body))
    }

    fn close_fn(&mut self, blk: Cmd) -> Result<Flow> {
        let pend = self.fns.pop().expect("fn body without pending fn");
        self.loop_depth = pend.saved_loop_depth;
        let body = match blk {
            Cmd::Block(b) => b,
            _ => unreachable!(),
        };
        if pend.ret.is_some() {
            let ends_with_return = matches!(
                body.children.last(),
                Some(Cmd::Block(b)) if b.kind == BlockKind::Return
            );
            if !ends_with_return {
                return Err(self.err_at(
                    pend.tok as usize,
                    &format!("function '{}' must end with a return statement", pend.name),
                ));
            }
        }
        let obj = pend.obj.expect("fn object");
        if let ObjKind::Func(f) = &mut self.ws.objects[obj].kind {
            f.body = body;
        }
        Ok(Flow::Redirect(State::Unit))
    }

    fn check_cond(&self, cond: &Cmd, what: &str) -> Result<()> {
        if cond.typ() != T_BOOL {
            return Err(self.err_at(cond.tok() as usize, &format!("{} condition must be bool", what)));
        }
        Ok(())
    }

    /// Force-close any open one-line blocks (no elif/else chaining).
    fn close_onelines(&mut self) -> Result<()> {
        while self.frames.last().map_or(false, |f| f.oneline) {
            self.close_current(true, false)?;
        }
        Ok(())
    }

    // --- statements ---

    fn stmt_expr(&mut self) -> Result<Flow> {
        let cmd = expr(self)?;
        self.append_stmt(cmd);
        Ok(Flow::Redirect(State::Body))
    }

    fn declaration(&mut self, typ: TypeId) -> Result<Flow> {
        let name_i = self.expect(TokenKind::Ident, "variable name")?;
        let name = self.lex.token_text(name_i).to_string();
        let (block, ord) = self.declare_var(&name, typ, name_i)?;
        if self.peek() != TokenKind::Assign {
            return Ok(Flow::Redirect(State::Body));
        }
        self.i += 1;
        match self.peek() {
            TokenKind::LBrace => {
                let init = self.parse_initializer(typ)?;
                let target = self.make_var(block, ord, typ, name_i as u32);
                let stmt = self.assign_stmt(target, init, name_i as u32);
                self.append_stmt(stmt);
                Ok(Flow::Redirect(State::Body))
            }
            TokenKind::KwSpawn => {
                if typ != T_INT {
                    return Err(self.err_here("spawn yields an int thread id"));
                }
                self.i += 1;
                self.spawn_open(Some((block as u16, ord as u16, name_i as u32)))
            }
            _ => {
                let value = expr(self)?;
                if !self.assignable(typ, value.typ()) {
                    return Err(self.err_at(
                        name_i,
                        &format!(
                            "cannot assign {} to {} '{}'",
                            self.ws.type_name(value.typ()),
                            self.ws.type_name(typ),
                            name
                        ),
                    ));
                }
                let target = self.make_var(block, ord, typ, name_i as u32);
                let stmt = self.assign_stmt(target, value, name_i as u32);
                self.append_stmt(stmt);
                Ok(Flow::Redirect(State::Body))
            }
        }
    }

    /// Brace initializer for the declared type, driven by an explicit
    /// frame stack so nesting costs no native recursion.
    fn parse_initializer(&mut self, typ: TypeId) -> Result<Cmd> {
        struct InitFrame {
            typ: TypeId,
            items: Vec<Cmd>,
            key: Option<Cmd>,
            tok: u32,
        }
        let open = self.expect(TokenKind::LBrace, "'{'")?;
        let mut stack = vec![InitFrame { typ, items: Vec::new(), key: None, tok: open as u32 }];
        loop {
            self.skip_newlines();
            let frame_typ = stack.last().unwrap().typ;
            let kind = self.ws.types[frame_typ].kind;
            match self.peek() {
                TokenKind::RBrace => {
                    self.i += 1;
                    let frame = stack.pop().unwrap();
                    let cmd = self.build_init(frame.typ, frame.items, frame.tok)?;
                    match stack.last_mut() {
                        Some(parent) => {
                            let ptyp = parent.typ;
                            let ptok = parent.tok;
                            let key = parent.key.take();
                            self.push_init_elem(ptyp, &mut parent.items, key, cmd, ptok)?;
                        }
                        None => return Ok(cmd),
                    }
                }
                TokenKind::Comma => {
                    self.i += 1;
                }
                TokenKind::LBrace => {
                    if kind == TypeKind::Map && stack.last().unwrap().key.is_none() {
                        return Err(self.err_here("map keys must be str"));
                    }
                    let et = self.init_elem_type(frame_typ, stack.last().unwrap().items.len())?;
                    if matches!(
                        self.ws.types[et].kind,
                        TypeKind::Int | TypeKind::Float | TypeKind::Bool | TypeKind::Char
                            | TypeKind::Str | TypeKind::Any | TypeKind::None
                    ) {
                        return Err(self.err_here("cannot infer type of nested initializer"));
                    }
                    let tok = self.i as u32;
                    self.i += 1;
                    stack.push(InitFrame { typ: et, items: Vec::new(), key: None, tok });
                }
                TokenKind::Eof => return Err(self.err_here("unterminated initializer")),
                _ => {
                    if kind == TypeKind::Map && stack.last().unwrap().key.is_none() {
                        let key = expr(self)?;
                        if key.typ() != T_STR {
                            return Err(self.err_at(key.tok() as usize, "map keys must be str"));
                        }
                        self.expect(TokenKind::Colon, "':' after map key")?;
                        stack.last_mut().unwrap().key = Some(key);
                    } else {
                        let value = expr(self)?;
                        let frame = stack.last_mut().unwrap();
                        let key = frame.key.take();
                        let (ftyp, ftok) = (frame.typ, frame.tok);
                        let items = &mut frame.items;
                        self.push_init_elem(ftyp, items, key, value, ftok)?;
                    }
                }
            }
        }
    }

    fn init_elem_type(&self, container: TypeId, items_so_far: usize) -> Result<TypeId> {
        let desc = &self.ws.types[container];
        Ok(match desc.kind {
            TypeKind::Arr => desc.elem.unwrap_or(T_ANY),
            TypeKind::Map => desc.elem.unwrap_or(T_ANY),
            TypeKind::Struct => {
                let idx = items_so_far;
                desc.fields
                    .get(idx)
                    .map(|(_, t)| *t)
                    .ok_or_else(|| SorrelError(format!(
                        "too many fields in '{}' initializer",
                        desc.name
                    )))?
            }
            TypeKind::Buf | TypeKind::Set => T_INT,
            _ => return Err(SorrelError(format!("'{}' takes no brace initializer", desc.name))),
        })
    }

    fn push_init_elem(
        &self,
        container: TypeId,
        items: &mut Vec<Cmd>,
        key: Option<Cmd>,
        value: Cmd,
        tok: u32,
    ) -> Result<()> {
        let desc = &self.ws.types[container];
        match desc.kind {
            TypeKind::Arr => {
                let elem = desc.elem.unwrap_or(T_ANY);
                if !self.assignable(elem, value.typ()) {
                    return Err(self.err_at(
                        value.tok() as usize,
                        &format!("array element must be {}", self.ws.type_name(elem)),
                    ));
                }
                items.push(value);
            }
            TypeKind::Map => {
                let elem = desc.elem.unwrap_or(T_ANY);
                let key = key.ok_or_else(|| self.err_at(tok as usize, "missing map key"))?;
                if !self.assignable(elem, value.typ()) {
                    return Err(self.err_at(
                        value.tok() as usize,
                        &format!("map value must be {}", self.ws.type_name(elem)),
                    ));
                }
                items.push(key);
                items.push(value);
            }
            TypeKind::Struct => {
                let idx = items.len();
                let (fname, ftyp) = desc
                    .fields
                    .get(idx)
                    .ok_or_else(|| self.err_at(
                        tok as usize,
                        &format!("too many fields in '{}' initializer", desc.name),
                    ))?;
                if !self.assignable(*ftyp, value.typ()) {
                    return Err(self.err_at(
                        value.tok() as usize,
                        &format!("field '{}' must be {}", fname, self.ws.type_name(*ftyp)),
                    ));
                }
                items.push(value);
            }
            TypeKind::Buf | TypeKind::Set => {
                if value.typ() != T_INT {
                    return Err(self.err_at(
                        value.tok() as usize,
                        &format!("{} elements must be int", desc.name),
                    ));
                }
                items.push(value);
            }
            _ => {
                return Err(self.err_at(
                    tok as usize,
                    &format!("'{}' takes no brace initializer", desc.name),
                ))
            }
        }
        Ok(())
    }

    fn build_init(&self, typ: TypeId, items: Vec<Cmd>, tok: u32) -> Result<Cmd> {
        let desc = &self.ws.types[typ];
        let kind = match desc.kind {
            TypeKind::Arr => BlockKind::InitArr,
            TypeKind::Map => BlockKind::InitMap,
            TypeKind::Struct => {
                if items.len() != desc.fields.len() {
                    return Err(self.err_at(
                        tok as usize,
                        &format!(
                            "'{}' initializer has {} fields, expected {}",
                            desc.name,
                            items.len(),
                            desc.fields.len()
                        ),
                    ));
                }
                BlockKind::InitStruct
            }
            TypeKind::Buf => BlockKind::InitBuf,
            TypeKind::Set => BlockKind::InitSet,
            _ => {
                return Err(self.err_at(
                    tok as usize,
                    &format!("'{}' takes no brace initializer", desc.name),
                ))
            }
        };
        let mut blk = CmdBlock::new(kind, tok);
        blk.children = items;
        blk.typ = typ;
        Ok(Cmd::Block(blk))
    }

    fn spawn_open(&mut self, assign: Option<(u16, u16, u32)>) -> Result<Flow> {
        let tok = self.prev_tok();
        self.skip_newlines();
        self.expect(TokenKind::LBrace, "'{' after spawn")?;
        let name = format!("spawn#{}", self.spawn_count);
        self.spawn_count += 1;
        let obj = self.ws.add_object(
            name.clone(),
            Object {
                name: name.clone(),
                kind: ObjKind::Func(FuncObj {
                    pars: Vec::new(),
                    ret: None,
                    any_ret: false,
                    body: CmdBlock::default(),
                    tok,
                    unit: self.unit,
                }),
            },
        )?;
        self.fns.push(PendingFn {
            name,
            tok,
            obj: Some(obj),
            saved_loop_depth: self.loop_depth,
            ..PendingFn::default()
        });
        self.loop_depth = 0;
        self.saved_scopes.push(std::mem::take(&mut self.scopes));
        self.scopes.push(Scope::new(tok));
        self.frames.push(PdaFrame { origin: Origin::SpawnBody { assign }, oneline: false });
        Ok(Flow::Redirect(State::Body))
    }

    fn include(&mut self, path: &str, tok: usize) -> Result<()> {
        let base = PathBuf::from(&self.ws.units[self.unit].path);
        let resolved = match base.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.join(path),
            _ => PathBuf::from(path),
        };
        let resolved = resolved.to_string_lossy().to_string();
        compile_file(self.ws, &resolved)
            .map_err(|e| self.err_at(tok, &format!("include '{}': {}", path, e)))
    }
}

// --- semantic actions (the table's enter callbacks) ---

pub(crate) fn cb_unit_eof(_p: &mut Parser) -> Result<Flow> {
    Ok(Flow::Stop)
}

pub(crate) fn cb_unit_func(p: &mut Parser) -> Result<Flow> {
    p.decl = Some(PendingFn { tok: p.prev_tok(), ..PendingFn::default() });
    Ok(Flow::Ok)
}

pub(crate) fn cb_unit_run(p: &mut Parser) -> Result<Flow> {
    p.decl = Some(PendingFn {
        name: "run".to_string(),
        tok: p.prev_tok(),
        any_ret: true,
        is_run: true,
        ..PendingFn::default()
    });
    Ok(Flow::Ok)
}

pub(crate) fn cb_unit_struct(p: &mut Parser) -> Result<Flow> {
    p.pending_struct = Some(PendingStruct { tok: p.prev_tok(), ..PendingStruct::default() });
    Ok(Flow::Ok)
}

pub(crate) fn cb_fn_name(p: &mut Parser) -> Result<Flow> {
    let i = p.i;
    p.i += 1;
    let name = p.lex.token_text(i).to_string();
    if let Some(d) = p.decl.as_mut() {
        d.name = name;
    }
    Ok(Flow::Ok)
}

pub(crate) fn cb_par_type(p: &mut Parser) -> Result<Flow> {
    let t = p.parse_type()?;
    if let Some(d) = p.decl.as_mut() {
        d.par_type = Some(t);
    }
    Ok(Flow::Ok)
}

pub(crate) fn cb_par_name(p: &mut Parser) -> Result<Flow> {
    let i = p.i;
    p.i += 1;
    let name = p.lex.token_text(i).to_string();
    let d = p.decl.as_mut().expect("no pending function");
    if d.pars.iter().any(|(n, _)| *n == name) {
        return Err(SorrelError(format!("duplicate parameter '{}'", name)));
    }
    let t = d.par_type.take().expect("parameter type");
    d.pars.push((name, t));
    Ok(Flow::Ok)
}

pub(crate) fn cb_ret_type(p: &mut Parser) -> Result<Flow> {
    let t = p.parse_type()?;
    if let Some(d) = p.decl.as_mut() {
        d.ret = Some(t);
        d.any_ret = false;
    }
    Ok(Flow::Ok)
}

pub(crate) fn cb_open_fn_body(p: &mut Parser) -> Result<Flow> {
    let mut pend = p.decl.take().expect("no pending function");
    let par_types: Vec<TypeId> = pend.pars.iter().map(|(_, t)| *t).collect();
    let key = if pend.is_run {
        "run".to_string()
    } else {
        p.ws.mangle(&pend.name, &par_types)
    };
    if p.ws.names.contains_key(&key) {
        let msg = if pend.is_run {
            "duplicate run block".to_string()
        } else {
            format!("function '{}' already defined", p.ws.signature(&pend.name, &par_types))
        };
        return Err(p.err_at(pend.tok as usize, &msg));
    }
    let obj = p.ws.add_object(
        key,
        Object {
            name: pend.name.clone(),
            kind: ObjKind::Func(FuncObj {
                pars: par_types,
                ret: pend.ret,
                any_ret: pend.any_ret,
                body: CmdBlock::default(),
                tok: pend.tok,
                unit: p.unit,
            }),
        },
    )?;
    if pend.is_run {
        if p.ws.entry.is_some() {
            return Err(p.err_at(pend.tok as usize, "duplicate run block"));
        }
        p.ws.entry = Some(obj);
    }
    pend.obj = Some(obj);
    p.scopes.push(Scope::new(pend.tok));
    let pars = pend.pars.clone();
    for (name, t) in &pars {
        p.declare_var(name, *t, pend.tok as usize)?;
    }
    pend.saved_loop_depth = p.loop_depth;
    p.loop_depth = 0;
    p.fns.push(pend);
    p.frames.push(PdaFrame { origin: Origin::FnBody, oneline: false });
    Ok(Flow::Ok)
}

pub(crate) fn cb_struct_name(p: &mut Parser) -> Result<Flow> {
    let i = p.i;
    p.i += 1;
    let name = p.lex.token_text(i).to_string();
    if let Some(s) = p.pending_struct.as_mut() {
        s.name = name;
    }
    Ok(Flow::Ok)
}

pub(crate) fn cb_field_type(p: &mut Parser) -> Result<Flow> {
    let t = p.parse_type()?;
    if let Some(s) = p.pending_struct.as_mut() {
        s.field_type = Some(t);
    }
    Ok(Flow::Ok)
}

pub(crate) fn cb_field_name(p: &mut Parser) -> Result<Flow> {
    let i = p.i;
    p.i += 1;
    let name = p.lex.token_text(i).to_string();
    let s = p.pending_struct.as_mut().expect("no pending struct");
    if s.fields.iter().any(|(n, _)| *n == name) {
        return Err(SorrelError(format!("duplicate field '{}'", name)));
    }
    let t = s.field_type.take().expect("field type");
    s.fields.push((name, t));
    Ok(Flow::Ok)
}

pub(crate) fn cb_struct_done(p: &mut Parser) -> Result<Flow> {
    let s = p.pending_struct.take().expect("no pending struct");
    p.ws
        .add_struct(&s.name, s.fields, s.tok)
        .map_err(|e| p.err_at(s.tok as usize, &e.0))?;
    Ok(Flow::Ok)
}

pub(crate) fn cb_const_name(p: &mut Parser) -> Result<Flow> {
    let i = p.i;
    p.i += 1;
    p.pending_const = Some((p.lex.token_text(i).to_string(), i as u32));
    Ok(Flow::Ok)
}

pub(crate) fn cb_const_value(p: &mut Parser) -> Result<Flow> {
    let (name, tok) = p.pending_const.take().expect("no pending const");
    let value = expr(p)?;
    if p.ws.names.contains_key(&name) {
        return Err(p.err_at(tok as usize, &format!("'{}' already defined", name)));
    }
    let typ = value.typ();
    p.ws.add_object(
        name.clone(),
        Object {
            name,
            kind: ObjKind::Const(ConstObj { typ, value, tok, unit: p.unit }),
        },
    )?;
    Ok(Flow::Ok)
}

pub(crate) fn cb_include(p: &mut Parser) -> Result<Flow> {
    let i = p.i;
    p.i += 1;
    let path = p.lex.token_text(i).to_string();
    p.include(&path, i)?;
    Ok(Flow::Ok)
}

pub(crate) fn cb_body_newline(p: &mut Parser) -> Result<Flow> {
    if p.frames.last().map_or(false, |f| f.oneline) {
        // a newline closes the innermost one-line block; further
        // enclosing one-line blocks see the same newline next round
        return p.close_current(true, true);
    }
    p.i += 1;
    Ok(Flow::Redirect(State::Body))
}

pub(crate) fn cb_body_eof(p: &mut Parser) -> Result<Flow> {
    p.close_onelines()?;
    Err(p.err_here("unexpected end of file: missing '}'"))
}

pub(crate) fn cb_close_block(p: &mut Parser) -> Result<Flow> {
    p.close_onelines()?;
    p.close_current(false, true)
}

pub(crate) fn cb_if(p: &mut Parser) -> Result<Flow> {
    let tok = p.prev_tok();
    let cond = expr(p)?;
    p.check_cond(&cond, "if")?;
    p.constructs.push(Construct::If { children: vec![cond], tok });
    p.open_body(Origin::IfArm)?;
    Ok(Flow::Redirect(State::Body))
}

pub(crate) fn cb_while(p: &mut Parser) -> Result<Flow> {
    let tok = p.prev_tok();
    let cond = expr(p)?;
    p.check_cond(&cond, "while")?;
    p.constructs.push(Construct::While { cond, tok });
    p.loop_depth += 1;
    p.open_body(Origin::WhileBody)?;
    Ok(Flow::Redirect(State::Body))
}

pub(crate) fn cb_for(p: &mut Parser) -> Result<Flow> {
    let tok = p.prev_tok();
    let name_i = p.expect(TokenKind::Ident, "loop variable name")?;
    let name = p.lex.token_text(name_i).to_string();
    p.expect(TokenKind::KwIn, "'in'")?;
    let container = expr(p)?;
    let elem = match p.ws.types[container.typ()].kind {
        TypeKind::Arr => p.ws.elem_of(container.typ()),
        TypeKind::Map => T_STR,
        TypeKind::Set => T_INT,
        TypeKind::Buf => T_INT,
        TypeKind::Str => T_CHAR,
        _ => {
            return Err(p.err_at(
                container.tok() as usize,
                &format!("cannot iterate over {}", p.ws.type_name(container.typ())),
            ))
        }
    };
    p.scopes.push(Scope::new(tok));
    p.declare_var(&name, elem, name_i)?;
    p.declare_var("#it", T_ARR, name_i)?;
    p.declare_var("#i", T_INT, name_i)?;
    p.constructs.push(Construct::For { container, tok });
    p.loop_depth += 1;
    p.open_body(Origin::ForBody)?;
    Ok(Flow::Redirect(State::Body))
}

pub(crate) fn cb_switch(p: &mut Parser) -> Result<Flow> {
    let tok = p.prev_tok();
    let subj = expr(p)?;
    let styp = subj.typ();
    if p.ws.find_func("==", &[styp, styp]).is_none() {
        return Err(p.err_at(
            subj.tok() as usize,
            &format!("switch subject must support '==', got {}", p.ws.type_name(styp)),
        ));
    }
    p.scopes.push(Scope::new(tok));
    let (block, ord) = p.declare_var("#sw", styp, tok as usize)?;
    let target = p.make_var(block, ord, styp, tok);
    let assign = p.assign_stmt(target, subj, tok);
    p.skip_newlines();
    p.expect(TokenKind::LBrace, "'{'")?;
    p.constructs.push(Construct::Switch {
        children: vec![assign],
        subj: styp,
        has_default: false,
        tok,
    });
    Ok(Flow::Ok)
}

pub(crate) fn cb_case_open(p: &mut Parser) -> Result<Flow> {
    let tok = p.prev_tok();
    let (styp, has_default) = match p.constructs.last() {
        Some(Construct::Switch { subj, has_default, .. }) => (*subj, *has_default),
        _ => return Err(p.err_here("'case' outside of switch")),
    };
    if has_default {
        return Err(p.err_at(tok as usize, "case after default"));
    }
    let (sb, so) = {
        // #sw lives in the innermost scope, declared first
        let block = p.scopes.len() - 1;
        (block, 0usize)
    };
    let mut cond: Option<Cmd> = None;
    loop {
        let value = expr(p)?;
        let eq = p
            .ws
            .find_func("==", &[styp, value.typ()])
            .ok_or_else(|| p.err_at(
                value.tok() as usize,
                &format!(
                    "case value type mismatch: {}",
                    p.ws.signature("==", &[styp, value.typ()])
                ),
            ))?;
        let subj = p.make_var(sb, so, styp, tok);
        let one = Cmd::Binary {
            obj: eq,
            left: Box::new(subj),
            right: Box::new(value),
            typ: T_BOOL,
            tok,
        };
        cond = Some(match cond {
            None => one,
            Some(prev) => {
                let mut or = CmdBlock::new(BlockKind::Or, tok);
                or.children = vec![prev, one];
                or.typ = T_BOOL;
                Cmd::Block(or)
            }
        });
        match p.peek() {
            TokenKind::Comma => {
                p.i += 1;
                continue;
            }
            TokenKind::Colon => {
                p.i += 1;
                break;
            }
            _ => return Err(p.err_here("expected ',' or ':' after case value")),
        }
    }
    match p.constructs.last_mut() {
        Some(Construct::Switch { children, .. }) => children.push(cond.expect("case condition")),
        _ => unreachable!(),
    }
    p.scopes.push(Scope::new(tok));
    p.frames.push(PdaFrame { origin: Origin::SwitchCase, oneline: false });
    Ok(Flow::Redirect(State::Body))
}

pub(crate) fn cb_default_open(p: &mut Parser) -> Result<Flow> {
    let tok = p.prev_tok();
    match p.constructs.last_mut() {
        Some(Construct::Switch { has_default, .. }) => {
            if *has_default {
                return Err(p.err_at(tok as usize, "duplicate default"));
            }
            *has_default = true;
        }
        _ => return Err(p.err_here("'default' outside of switch")),
    }
    p.expect(TokenKind::Colon, "':' after default")?;
    p.scopes.push(Scope::new(tok));
    p.frames.push(PdaFrame { origin: Origin::SwitchCase, oneline: false });
    Ok(Flow::Redirect(State::Body))
}

pub(crate) fn cb_case_boundary(p: &mut Parser) -> Result<Flow> {
    p.close_onelines()?;
    let frame = p
        .frames
        .pop()
        .ok_or_else(|| p.err_here("unexpected 'case'"))?;
    if !matches!(frame.origin, Origin::SwitchCase) {
        return Err(p.err_here("'case' outside of switch"));
    }
    let scope = p.scopes.pop().expect("case scope");
    match p.constructs.last_mut() {
        Some(Construct::Switch { children, .. }) => children.push(Cmd::Block(scope.block)),
        _ => unreachable!("case body without switch construct"),
    }
    Ok(Flow::Redirect(State::SwitchBody))
}

pub(crate) fn cb_switch_end(p: &mut Parser) -> Result<Flow> {
    p.finish_switch()
}

pub(crate) fn cb_return(p: &mut Parser) -> Result<Flow> {
    let tok = p.prev_tok();
    let pend = p.fns.last().expect("return outside function");
    let (ret, any_ret) = (pend.ret, pend.any_ret);
    let value = match p.peek() {
        TokenKind::NewLine | TokenKind::RBrace | TokenKind::Eof | TokenKind::KwCase
        | TokenKind::KwDefault => None,
        _ => Some(expr(p)?),
    };
    match (&value, ret) {
        (Some(v), Some(want)) => {
            if !p.assignable(want, v.typ()) {
                return Err(p.err_at(
                    v.tok() as usize,
                    &format!(
                        "return type mismatch: expected {}, got {}",
                        p.ws.type_name(want),
                        p.ws.type_name(v.typ())
                    ),
                ));
            }
        }
        (Some(_), None) if any_ret => {}
        (Some(_), None) => {
            return Err(p.err_at(tok as usize, "function returns no value"));
        }
        (None, Some(_)) => {
            return Err(p.err_at(tok as usize, "missing return value"));
        }
        (None, None) => {}
    }
    let mut blk = CmdBlock::new(BlockKind::Return, tok);
    if let Some(v) = value {
        blk.children.push(v);
    }
    p.append_stmt(Cmd::Block(blk));
    Ok(Flow::Redirect(State::Body))
}

pub(crate) fn cb_break(p: &mut Parser) -> Result<Flow> {
    if p.loop_depth == 0 {
        return Err(p.err_here("break used outside of loop"));
    }
    p.append_stmt(Cmd::Block(CmdBlock::new(BlockKind::Break, p.prev_tok())));
    Ok(Flow::Redirect(State::Body))
}

pub(crate) fn cb_continue(p: &mut Parser) -> Result<Flow> {
    if p.loop_depth == 0 {
        return Err(p.err_here("continue used outside of loop"));
    }
    p.append_stmt(Cmd::Block(CmdBlock::new(BlockKind::Continue, p.prev_tok())));
    Ok(Flow::Redirect(State::Body))
}

pub(crate) fn cb_try(p: &mut Parser) -> Result<Flow> {
    let tok = p.prev_tok();
    p.constructs.push(Construct::Try { body: None, tok });
    p.skip_newlines();
    p.expect(TokenKind::LBrace, "'{' after try")?;
    p.scopes.push(Scope::new(tok));
    p.frames.push(PdaFrame { origin: Origin::TryBody, oneline: false });
    Ok(Flow::Redirect(State::Body))
}

pub(crate) fn cb_spawn_stmt(p: &mut Parser) -> Result<Flow> {
    p.spawn_open(None)
}

pub(crate) fn cb_stmt_ident(p: &mut Parser) -> Result<Flow> {
    let text = p.lex.token_text(p.i);
    if p.ws.type_by_name(text).is_some() {
        let save = p.i;
        match p.parse_type() {
            Ok(typ) if p.peek() == TokenKind::Ident => return p.declaration(typ),
            _ => p.i = save,
        }
    }
    p.stmt_expr()
}

pub(crate) fn cb_stmt_expr(p: &mut Parser) -> Result<Flow> {
    p.stmt_expr()
}
