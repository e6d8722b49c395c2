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

//! Tree -> bytecode lowering and linking. Functions lower lazily, one
//! at a time, the first time the linker finds them reachable; forward
//! jumps are sized bottom-up by lowering each branch into its own
//! fragment before the jump that skips it is emitted.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use sorrel_ast::{
    stack_of, AssignOp, BlockKind, Cmd, CmdBlock, IdxStep, Lit, ObjKind, StackKind, TypeId,
    TypeKind, Workspace, T_ARR, T_INT,
};
use sorrel_bytecode::{
    pack_counts, word, word_imm_i16, Op, PosEntry, Program, StrPool, RES_ANY, RES_BOOL, RES_CHAR,
    RES_FLOAT, RES_INT, RES_NONE, RES_STR,
};
use sorrel_common::{Result, SorrelError};

pub mod service;

/// One lowered function or constant, in local (unlinked) form: a code
/// fragment with its own string pool, position entries and used set.
#[derive(Debug, Clone)]
pub struct Lowered {
    pub name: String,
    pub unit: usize,
    pub code: Vec<u32>,
    pub strings: Vec<String>,
    /// word indices holding local string-pool ids, remapped at link time
    pub str_refs: Vec<usize>,
    /// (offset, line, col) of every failable instruction
    pub pos: Vec<(u32, u32, u32)>,
    pub used: Vec<usize>,
}

/// An instruction fragment under assembly. Offsets inside `pos`,
/// `str_refs` and the break/continue sites shift when fragments are
/// spliced together.
#[derive(Default)]
struct Frag {
    code: Vec<u32>,
    pos: Vec<(u32, u32, u32)>,
    str_refs: Vec<usize>,
    breaks: Vec<usize>,
    conts: Vec<usize>,
}

impl Frag {
    fn len(&self) -> usize {
        self.code.len()
    }

    fn op(&mut self, op: Op) {
        self.code.push(word(op, 0));
    }

    fn op_imm(&mut self, op: Op, imm: u16) {
        self.code.push(word(op, imm));
    }

    fn op_rel(&mut self, op: Op, rel: i64) -> Result<()> {
        let rel = i16::try_from(rel).map_err(|_| SorrelError("block too large".into()))?;
        self.code.push(word_imm_i16(op, rel));
        Ok(())
    }

    fn word(&mut self, w: u32) {
        self.code.push(w);
    }

    fn push_i64(&mut self, v: i64) {
        let u = v as u64;
        self.code.push((u & 0xffff_ffff) as u32);
        self.code.push((u >> 32) as u32);
    }

    fn append(&mut self, other: Frag) {
        let base = self.code.len();
        self.code.extend_from_slice(&other.code);
        self.pos
            .extend(other.pos.iter().map(|(o, l, c)| (*o + base as u32, *l, *c)));
        self.str_refs.extend(other.str_refs.iter().map(|r| r + base));
        self.breaks.extend(other.breaks.iter().map(|r| r + base));
        self.conts.extend(other.conts.iter().map(|r| r + base));
    }
}

struct LoopCtx {
    depth: usize,
    tries: usize,
}

struct Gen<'a> {
    ws: &'a Workspace,
    unit: usize,
    strings: Vec<String>,
    smap: HashMap<String, u32>,
    used: Vec<usize>,
    used_set: HashSet<usize>,
    blocks: Vec<&'a CmdBlock>,
    loops: Vec<LoopCtx>,
    depth: usize,
    tries: usize,
    any_ret: bool,
    ret: Option<TypeId>,
}

fn res_kind_of(ws: &Workspace, t: TypeId) -> u16 {
    match ws.types[t].kind {
        TypeKind::Int => RES_INT,
        TypeKind::Bool => RES_BOOL,
        TypeKind::Char => RES_CHAR,
        TypeKind::Float => RES_FLOAT,
        TypeKind::Str => RES_STR,
        TypeKind::None => RES_NONE,
        _ => RES_ANY,
    }
}

fn box_op_for(ws: &Workspace, t: TypeId) -> Option<Op> {
    match ws.types[t].kind {
        TypeKind::Int => Some(Op::BoxInt),
        TypeKind::Bool => Some(Op::BoxBool),
        TypeKind::Char => Some(Op::BoxChar),
        TypeKind::Float => Some(Op::BoxFloat),
        TypeKind::Str => Some(Op::BoxStr),
        _ => None,
    }
}

fn unbox_op_for(ws: &Workspace, t: TypeId) -> Option<Op> {
    match ws.types[t].kind {
        TypeKind::Int | TypeKind::Bool | TypeKind::Char => Some(Op::UnboxInt),
        TypeKind::Float => Some(Op::UnboxFloat),
        TypeKind::Str => Some(Op::UnboxStr),
        _ => None,
    }
}

fn pop_op_for(kind: StackKind) -> Op {
    match kind {
        StackKind::Int => Op::PopI,
        StackKind::Float => Op::PopF,
        StackKind::Str => Op::PopS,
        StackKind::Any => Op::PopA,
    }
}

fn get_op_for(kind: StackKind) -> Op {
    match kind {
        StackKind::Int => Op::GetInt,
        StackKind::Float => Op::GetFloat,
        StackKind::Str => Op::GetStr,
        StackKind::Any => Op::GetAny,
    }
}

fn set_op_for(kind: StackKind) -> Op {
    match kind {
        StackKind::Int => Op::SetInt,
        StackKind::Float => Op::SetFloat,
        StackKind::Str => Op::SetStr,
        StackKind::Any => Op::SetAny,
    }
}

fn failable(op: Op) -> bool {
    matches!(op, Op::DivI | Op::ModI | Op::Shl | Op::Shr)
}

impl<'a> Gen<'a> {
    fn new(ws: &'a Workspace, unit: usize) -> Self {
        Self {
            ws,
            unit,
            strings: Vec::new(),
            smap: HashMap::new(),
            used: Vec::new(),
            used_set: HashSet::new(),
            blocks: Vec::new(),
            loops: Vec::new(),
            depth: 0,
            tries: 0,
            any_ret: false,
            ret: None,
        }
    }

    fn pos_of(&self, tok: u32) -> (u32, u32) {
        self.ws.units[self.unit].tok_pos[tok as usize]
    }

    fn mark(&self, f: &mut Frag, tok: u32) {
        let (line, col) = self.pos_of(tok);
        f.pos.push((f.len() as u32, line, col));
    }

    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&i) = self.smap.get(s) {
            return i;
        }
        let i = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.smap.insert(s.to_string(), i);
        i
    }

    fn use_obj(&mut self, obj: usize) {
        if self.used_set.insert(obj) {
            self.used.push(obj);
        }
    }

    fn var_slot(&self, block: u16, slot: u16) -> (StackKind, usize, usize, TypeId) {
        let blk = self.blocks[block as usize];
        let (kind, sslot) = blk.stack_slot(self.ws, slot as usize);
        let dist = self.depth - block as usize;
        (kind, sslot, dist, blk.vars[slot as usize])
    }

    fn var_imm(&self, dist: usize, sslot: usize) -> Result<u16> {
        if dist > 0xff || sslot > 0xff {
            return Err(SorrelError("too many nested blocks or variables".into()));
        }
        Ok(((dist as u16) << 8) | sslot as u16)
    }

    // --- expressions ---

    fn expr(&mut self, cmd: &'a Cmd) -> Result<Frag> {
        let mut f = Frag::default();
        match cmd {
            Cmd::Value { val, tok, .. } => match val {
                Lit::Int(v) => {
                    if let Ok(small) = i16::try_from(*v) {
                        f.op_rel(Op::PushImm, small as i64)?;
                    } else {
                        f.op(Op::PushInt);
                        f.push_i64(*v);
                    }
                }
                Lit::Float(v) => {
                    f.op(Op::PushFloat);
                    f.push_i64(v.to_bits() as i64);
                }
                Lit::Bool(b) => f.op_imm(Op::PushImm, *b as u16),
                Lit::Char(c) => {
                    f.op(Op::PushChar);
                    f.word(*c as u32);
                }
                Lit::Str(s) => {
                    let id = self.intern(s);
                    let _ = tok;
                    f.op(Op::PushStr);
                    f.str_refs.push(f.len());
                    f.word(id);
                }
            },
            Cmd::Var { block, slot, idx, tok, .. } => {
                f = self.var_read(*block, *slot, idx, *tok)?;
            }
            Cmd::ConstRef { obj, typ, tok } => {
                self.use_obj(*obj);
                self.mark(&mut f, *tok);
                f.op_imm(Op::ConstGet, res_kind_of(self.ws, *typ));
                f.word(*obj as u32);
            }
            Cmd::Unary { obj, operand, tok, .. } => {
                f = self.expr(operand)?;
                self.call_obj(&mut f, *obj, 1, *tok)?;
            }
            Cmd::Binary { obj, left, right, tok, .. } => {
                f = self.expr(left)?;
                f.append(self.expr(right)?);
                self.call_obj(&mut f, *obj, 2, *tok)?;
            }
            Cmd::AnyCall { obj, args, tok, .. } => {
                let fixed = match &self.ws.objects[*obj].kind {
                    ObjKind::Embed(e) if e.variadic => e.pars.len(),
                    _ => args.len(),
                };
                for (i, a) in args.iter().enumerate() {
                    f.append(self.expr(a)?);
                    if i >= fixed {
                        if let Some(op) = box_op_for(self.ws, a.typ()) {
                            f.op(op);
                        }
                    }
                }
                self.call_obj(&mut f, *obj, args.len(), *tok)?;
            }
            Cmd::SpawnCall { obj, tok } => {
                self.use_obj(*obj);
                self.mark(&mut f, *tok);
                f.op(Op::Spawn);
                f.word(*obj as u32);
            }
            Cmd::Block(b) => match b.kind {
                BlockKind::Ternary => f = self.ternary(b)?,
                BlockKind::And => f = self.short_circuit(b, Op::JzKeep)?,
                BlockKind::Or => f = self.short_circuit(b, Op::JnzKeep)?,
                BlockKind::InitArr => f = self.init_boxed(b, Op::InitArr)?,
                BlockKind::InitStruct => f = self.init_boxed(b, Op::InitStruct)?,
                BlockKind::InitMap => f = self.init_map(b)?,
                BlockKind::InitBuf => f = self.init_ints(b, Op::InitBuf)?,
                BlockKind::InitSet => f = self.init_ints(b, Op::InitSet)?,
                _ => return Err(SorrelError("statement block used as a value".into())),
            },
        }
        Ok(f)
    }

    fn call_obj(&mut self, f: &mut Frag, obj: usize, argc: usize, tok: u32) -> Result<()> {
        enum Target {
            FastOp(Op),
            Embed(usize),
            Func,
        }
        let target = match &self.ws.objects[obj].kind {
            ObjKind::Embed(e) => match e.op {
                Some(op) => Target::FastOp(op),
                None => Target::Embed(e.idx),
            },
            ObjKind::Func(_) => Target::Func,
            _ => return Err(SorrelError("call target is not callable".into())),
        };
        match target {
            Target::FastOp(op) => {
                if failable(op) {
                    self.mark(f, tok);
                }
                f.op(op);
            }
            Target::Embed(idx) => {
                self.mark(f, tok);
                f.op_imm(Op::CallEmbed, argc as u16);
                f.word(idx as u32);
            }
            Target::Func => {
                self.use_obj(obj);
                self.mark(f, tok);
                f.op(Op::CallFunc);
                f.word(obj as u32);
            }
        }
        Ok(())
    }

    fn var_read(&mut self, block: u16, slot: u16, idx: &'a [IdxStep], tok: u32) -> Result<Frag> {
        let mut f = Frag::default();
        let (kind, sslot, dist, decl) = self.var_slot(block, slot);
        f.op_imm(get_op_for(kind), self.var_imm(dist, sslot)?);
        if idx.is_empty() {
            return Ok(f);
        }
        let (cur, buf_last) = self.apply_steps(&mut f, decl, idx, tok)?;
        if !buf_last {
            if let Some(op) = unbox_op_for(self.ws, cur) {
                f.op(op);
            }
        }
        Ok(f)
    }

    /// Emit every index step; returns the chain-end type and whether the
    /// final step was a buf access (whose result is already an int).
    fn apply_steps(
        &mut self,
        f: &mut Frag,
        start: TypeId,
        steps: &'a [IdxStep],
        tok: u32,
    ) -> Result<(TypeId, bool)> {
        let mut cur = start;
        let mut buf_last = false;
        for step in steps {
            buf_last = false;
            match step {
                IdxStep::Arr(i) => {
                    f.append(self.expr(i)?);
                    self.mark(f, tok);
                    f.op(Op::IdxGetArr);
                    cur = self.ws.elem_of(cur);
                }
                IdxStep::Map(k) => {
                    f.append(self.expr(k)?);
                    self.mark(f, tok);
                    f.op(Op::IdxGetMap);
                    cur = self.ws.elem_of(cur);
                }
                IdxStep::Field(s) => {
                    self.mark(f, tok);
                    f.op_imm(Op::IdxGetFld, *s as u16);
                    cur = self.ws.types[cur].fields[*s].1;
                }
                IdxStep::Buf(i) => {
                    f.append(self.expr(i)?);
                    self.mark(f, tok);
                    f.op(Op::IdxGetBuf);
                    cur = T_INT;
                    buf_last = true;
                }
            }
        }
        Ok((cur, buf_last))
    }

    fn ternary(&mut self, b: &'a CmdBlock) -> Result<Frag> {
        let mut f = self.expr(&b.children[0])?;
        let then_f = self.expr(&b.children[1])?;
        let else_f = self.expr(&b.children[2])?;
        f.op_rel(Op::Jz, then_f.len() as i64 + 1)?;
        f.append(then_f);
        f.op_rel(Op::Jmp, else_f.len() as i64)?;
        f.append(else_f);
        Ok(f)
    }

    /// `&&` / `||`: the left operand always runs; the jump skips the
    /// right operand and keeps the deciding value as the result.
    fn short_circuit(&mut self, b: &'a CmdBlock, jump: Op) -> Result<Frag> {
        let mut f = self.expr(&b.children[0])?;
        let right = self.expr(&b.children[1])?;
        f.op_rel(jump, right.len() as i64)?;
        f.append(right);
        Ok(f)
    }

    fn init_boxed(&mut self, b: &'a CmdBlock, op: Op) -> Result<Frag> {
        let mut f = Frag::default();
        for child in &b.children {
            f.append(self.expr(child)?);
            if let Some(bx) = box_op_for(self.ws, child.typ()) {
                f.op(bx);
            }
        }
        f.op_imm(op, b.children.len() as u16);
        Ok(f)
    }

    fn init_map(&mut self, b: &'a CmdBlock) -> Result<Frag> {
        let mut f = Frag::default();
        for pair in b.children.chunks(2) {
            f.append(self.expr(&pair[0])?);
            f.append(self.expr(&pair[1])?);
            if let Some(bx) = box_op_for(self.ws, pair[1].typ()) {
                f.op(bx);
            }
        }
        f.op_imm(Op::InitMap, (b.children.len() / 2) as u16);
        Ok(f)
    }

    fn init_ints(&mut self, b: &'a CmdBlock, op: Op) -> Result<Frag> {
        let mut f = Frag::default();
        for child in &b.children {
            f.append(self.expr(child)?);
        }
        self.mark(&mut f, b.tok);
        f.op_imm(op, b.children.len() as u16);
        Ok(f)
    }

    // --- statements ---

    fn stmts(&mut self, children: &'a [Cmd]) -> Result<Frag> {
        let mut f = Frag::default();
        for child in children {
            f.append(self.stmt(child)?);
        }
        Ok(f)
    }

    fn stmt(&mut self, cmd: &'a Cmd) -> Result<Frag> {
        if let Cmd::Block(b) = cmd {
            match &b.kind {
                BlockKind::If => return self.if_stmt(b),
                BlockKind::While => return self.while_stmt(b),
                BlockKind::For => return self.for_stmt(b),
                BlockKind::Switch => return self.switch_stmt(b),
                BlockKind::Return => return self.return_stmt(b),
                BlockKind::Assign(op) => return self.assign_stmt(b, *op),
                BlockKind::IncDec(d) => return self.incdec_stmt(b, *d),
                BlockKind::Try => return self.try_stmt(b),
                BlockKind::Break => return self.break_stmt(),
                BlockKind::Continue => return self.continue_stmt(),
                BlockKind::Plain => return self.block(b),
                _ => {}
            }
        }
        // expression statement: evaluate, discard the value
        let typ = cmd.typ();
        let mut f = self.expr(cmd)?;
        if self.ws.types[typ].kind != TypeKind::None {
            f.op(pop_op_for(stack_of(self.ws.types[typ].kind)));
        }
        Ok(f)
    }

    /// A plain lexical block: open a transparent frame, run the
    /// children, close it.
    fn block(&mut self, b: &'a CmdBlock) -> Result<Frag> {
        self.blocks.push(b);
        self.depth += 1;
        let inner = self.stmts(&b.children);
        self.depth -= 1;
        self.blocks.pop();
        let inner = inner?;
        let (ni, nf, ns, na) = b.var_counts(self.ws);
        let mut f = Frag::default();
        f.op_imm(Op::BlkOpen, 0);
        f.word(pack_counts(ni, nf, ns, na));
        f.append(inner);
        f.op(Op::BlkClose);
        Ok(f)
    }

    fn if_stmt(&mut self, b: &'a CmdBlock) -> Result<Frag> {
        let has_else = b.children.len() % 2 == 1;
        let mut tail = if has_else {
            let else_blk = match b.children.last() {
                Some(Cmd::Block(eb)) => eb,
                _ => return Err(SorrelError("malformed if".into())),
            };
            self.block(else_blk)?
        } else {
            Frag::default()
        };
        let pair_n = b.children.len() / 2;
        for p in (0..pair_n).rev() {
            let cond = &b.children[p * 2];
            let arm = match &b.children[p * 2 + 1] {
                Cmd::Block(ab) => ab,
                _ => return Err(SorrelError("malformed if".into())),
            };
            let arm_f = self.block(arm)?;
            let mut f = self.expr(cond)?;
            let skip = arm_f.len() as i64 + if tail.len() > 0 { 1 } else { 0 };
            f.op_rel(Op::Jz, skip)?;
            f.append(arm_f);
            if tail.len() > 0 {
                f.op_rel(Op::Jmp, tail.len() as i64)?;
            }
            f.append(tail);
            tail = f;
        }
        Ok(tail)
    }

    fn while_stmt(&mut self, b: &'a CmdBlock) -> Result<Frag> {
        let cond = &b.children[0];
        let body = match &b.children[1] {
            Cmd::Block(bb) => bb,
            _ => return Err(SorrelError("malformed while".into())),
        };
        // the loop frame owns both the body's locals and the cycle budget
        self.blocks.push(body);
        self.depth += 1;
        self.loops.push(LoopCtx { depth: self.depth, tries: self.tries });
        let cond_f = self.expr(cond);
        let body_f = cond_f.and_then(|cf| self.stmts(&body.children).map(|bf| (cf, bf)));
        self.loops.pop();
        self.depth -= 1;
        self.blocks.pop();
        let (cond_f, body_f) = body_f?;

        let (ni, nf, ns, na) = body.var_counts(self.ws);
        let mut f = Frag::default();
        f.op_imm(Op::BlkOpen, 1);
        f.word(pack_counts(ni, nf, ns, na));
        let loop_start = f.len() as i64;
        f.append(cond_f);
        f.op_rel(Op::Jz, body_f.len() as i64 + 2)?;
        let body_base = f.len();
        f.append(body_f);
        let cont_at = f.len();
        self.mark(&mut f, b.tok);
        f.op(Op::Cycle);
        let back_at = f.len() as i64;
        f.op_rel(Op::Jmp, loop_start - (back_at + 1))?;
        let exit_at = f.len();
        f.op(Op::BlkClose);
        patch_loop_sites(&mut f, body_base, cont_at, exit_at)?;
        Ok(f)
    }

    fn for_stmt(&mut self, b: &'a CmdBlock) -> Result<Frag> {
        let container = &b.children[0];
        let body = match &b.children[1] {
            Cmd::Block(bb) => bb,
            _ => return Err(SorrelError("malformed for".into())),
        };
        let len_obj = self
            .ws
            .find_func("len", &[T_ARR])
            .ok_or_else(|| SorrelError("function not found: len(arr)".into()))?;
        // outer loop frame: the loop variable plus the hidden iterator slots
        self.blocks.push(b);
        self.depth += 1;
        self.loops.push(LoopCtx { depth: self.depth, tries: self.tries });

        let result = (|| {
            let elem = b.vars[0];
            let (vkind, vslot) = b.stack_slot(self.ws, 0);
            let (_, it_slot) = b.stack_slot(self.ws, 1);
            let (_, i_slot) = b.stack_slot(self.ws, 2);
            let container_f = self.expr(container)?;
            let body_f = self.block(body)?;

            let (ni, nf, ns, na) = b.var_counts(self.ws);
            let mut f = Frag::default();
            f.op_imm(Op::BlkOpen, 1);
            f.word(pack_counts(ni, nf, ns, na));
            f.append(container_f);
            // str containers travel the str stack; IterInit wants a boxed value
            if self.ws.types[container.typ()].kind == TypeKind::Str {
                f.op(Op::BoxStr);
            }
            f.op(Op::IterInit);
            f.op_imm(Op::SetAny, self.var_imm(0, it_slot)?);
            f.op_imm(Op::PushImm, 0);
            f.op_imm(Op::SetInt, self.var_imm(0, i_slot)?);
            let loop_start = f.len() as i64;
            // #i < len(#it)
            f.op_imm(Op::GetInt, self.var_imm(0, i_slot)?);
            f.op_imm(Op::GetAny, self.var_imm(0, it_slot)?);
            self.mark(&mut f, b.tok);
            f.op_imm(Op::CallEmbed, 1);
            match &self.ws.objects[len_obj].kind {
                ObjKind::Embed(e) => f.word(e.idx as u32),
                _ => return Err(SorrelError("len(arr) is not embedded".into())),
            }
            f.op(Op::LtI);
            // loop variable update + body + increment
            let mut rest = Frag::default();
            rest.op_imm(Op::GetAny, self.var_imm(0, it_slot)?);
            rest.op_imm(Op::GetInt, self.var_imm(0, i_slot)?);
            self.mark(&mut rest, b.tok);
            rest.op(Op::IdxGetArr);
            if let Some(op) = unbox_op_for(self.ws, elem) {
                rest.op(op);
            }
            rest.op_imm(set_op_for(vkind), self.var_imm(0, vslot)?);
            rest.append(body_f);
            let cont_at_rel = rest.len();
            rest.op_imm(Op::GetInt, self.var_imm(0, i_slot)?);
            rest.op_imm(Op::PushImm, 1);
            rest.op(Op::AddI);
            rest.op_imm(Op::SetInt, self.var_imm(0, i_slot)?);
            self.mark(&mut rest, b.tok);
            rest.op(Op::Cycle);

            f.op_rel(Op::Jz, rest.len() as i64 + 1)?;
            let body_base = f.len();
            let cont_at = body_base + cont_at_rel;
            f.append(rest);
            let back_at = f.len() as i64;
            f.op_rel(Op::Jmp, loop_start - (back_at + 1))?;
            let exit_at = f.len();
            f.op(Op::BlkClose);
            patch_loop_sites(&mut f, body_base, cont_at, exit_at)?;
            Ok(f)
        })();

        self.loops.pop();
        self.depth -= 1;
        self.blocks.pop();
        result
    }

    fn switch_stmt(&mut self, b: &'a CmdBlock) -> Result<Frag> {
        self.blocks.push(b);
        self.depth += 1;
        let result = (|| {
            let assign_f = self.stmt(&b.children[0])?;
            let rest = &b.children[1..];
            let has_default = rest.len() % 2 == 1;
            let mut tail = if has_default {
                let def = match rest.last() {
                    Some(Cmd::Block(db)) => db,
                    _ => return Err(SorrelError("malformed switch".into())),
                };
                self.block(def)?
            } else {
                Frag::default()
            };
            let pair_n = rest.len() / 2;
            for p in (0..pair_n).rev() {
                let cond = &rest[p * 2];
                let body = match &rest[p * 2 + 1] {
                    Cmd::Block(cb) => cb,
                    _ => return Err(SorrelError("malformed switch".into())),
                };
                let body_f = self.block(body)?;
                let mut f = self.expr(cond)?;
                let skip = body_f.len() as i64 + if tail.len() > 0 { 1 } else { 0 };
                f.op_rel(Op::Jz, skip)?;
                f.append(body_f);
                if tail.len() > 0 {
                    f.op_rel(Op::Jmp, tail.len() as i64)?;
                }
                f.append(tail);
                tail = f;
            }
            let mut f = Frag::default();
            let (ni, nf, ns, na) = b.var_counts(self.ws);
            f.op_imm(Op::BlkOpen, 0);
            f.word(pack_counts(ni, nf, ns, na));
            f.append(assign_f);
            f.append(tail);
            f.op(Op::BlkClose);
            Ok(f)
        })();
        self.depth -= 1;
        self.blocks.pop();
        result
    }

    fn return_stmt(&mut self, b: &'a CmdBlock) -> Result<Frag> {
        let mut f = Frag::default();
        match b.children.first() {
            Some(value) => {
                // the value still evaluates inside any enclosing try
                f.append(self.expr(value)?);
                if self.any_ret {
                    if let Some(bx) = box_op_for(self.ws, value.typ()) {
                        f.op(bx);
                    }
                }
                for _ in 0..self.tries {
                    f.op(Op::TryPop);
                }
                if self.any_ret {
                    f.op_imm(Op::Ret, RES_ANY);
                } else {
                    let kind = res_kind_of(self.ws, self.ret.unwrap_or(value.typ()));
                    f.op_imm(Op::Ret, kind);
                }
            }
            None => {
                for _ in 0..self.tries {
                    f.op(Op::TryPop);
                }
                f.op_imm(Op::Ret, RES_NONE);
            }
        }
        Ok(f)
    }

    fn assign_stmt(&mut self, b: &'a CmdBlock, op: AssignOp) -> Result<Frag> {
        let (target, value) = (&b.children[0], &b.children[1]);
        let Cmd::Var { block, slot, idx, tok, .. } = target else {
            return Err(SorrelError("invalid assignment target".into()));
        };
        let (kind, sslot, dist, decl) = self.var_slot(*block, *slot);
        let imm = self.var_imm(dist, sslot)?;
        let mut f = Frag::default();
        if idx.is_empty() {
            match op.base() {
                None => {
                    f.append(self.expr(value)?);
                    if kind == StackKind::Any {
                        if let Some(bx) = box_op_for(self.ws, value.typ()) {
                            f.op(bx);
                        }
                    }
                }
                Some(base) => {
                    f.op_imm(get_op_for(kind), imm);
                    f.append(self.expr(value)?);
                    self.emit_binop(&mut f, base, decl, value.typ(), *tok)?;
                }
            }
            f.op_imm(set_op_for(kind), imm);
            return Ok(f);
        }
        // chained write: container, leading reads, key, value, IdxSet
        let last = idx.last().expect("nonempty chain");
        let lead = &idx[..idx.len() - 1];
        f.op_imm(get_op_for(kind), imm);
        let (cont_typ, _) = self.apply_steps(&mut f, decl, lead, *tok)?;
        let elem_typ = match last {
            IdxStep::Arr(_) | IdxStep::Map(_) => self.ws.elem_of(cont_typ),
            IdxStep::Field(s) => self.ws.types[cont_typ].fields[*s].1,
            IdxStep::Buf(_) => T_INT,
        };
        match last {
            IdxStep::Arr(i) | IdxStep::Buf(i) => f.append(self.expr(i)?),
            IdxStep::Map(k) => f.append(self.expr(k)?),
            IdxStep::Field(_) => {}
        }
        match op.base() {
            None => f.append(self.expr(value)?),
            Some(base) => {
                // recompute the chain-end value, then apply the operator
                f.append(self.var_read(*block, *slot, idx, *tok)?);
                f.append(self.expr(value)?);
                self.emit_binop(&mut f, base, elem_typ, value.typ(), *tok)?;
            }
        }
        let is_buf = matches!(last, IdxStep::Buf(_));
        if !is_buf {
            if let Some(bx) = box_op_for(self.ws, if op.base().is_some() { elem_typ } else { value.typ() }) {
                f.op(bx);
            }
        }
        self.mark(&mut f, *tok);
        match last {
            IdxStep::Arr(_) => f.op(Op::IdxSetArr),
            IdxStep::Map(_) => f.op(Op::IdxSetMap),
            IdxStep::Field(s) => f.op_imm(Op::IdxSetFld, *s as u16),
            IdxStep::Buf(_) => f.op(Op::IdxSetBuf),
        }
        Ok(f)
    }

    fn emit_binop(
        &mut self,
        f: &mut Frag,
        name: &str,
        lt: TypeId,
        rt: TypeId,
        tok: u32,
    ) -> Result<()> {
        let obj = self.ws.find_func(name, &[lt, rt]).ok_or_else(|| {
            SorrelError(format!(
                "operator not found: {}",
                self.ws.signature(name, &[lt, rt])
            ))
        })?;
        self.call_obj(f, obj, 2, tok)
    }

    fn incdec_stmt(&mut self, b: &'a CmdBlock, delta: i8) -> Result<Frag> {
        let Cmd::Var { block, slot, .. } = &b.children[0] else {
            return Err(SorrelError("invalid assignment target".into()));
        };
        let (kind, sslot, dist, _) = self.var_slot(*block, *slot);
        let imm = self.var_imm(dist, sslot)?;
        let mut f = Frag::default();
        f.op_imm(get_op_for(kind), imm);
        f.op_imm(Op::PushImm, 1);
        f.op(if delta > 0 { Op::AddI } else { Op::SubI });
        f.op_imm(set_op_for(kind), imm);
        Ok(f)
    }

    fn try_stmt(&mut self, b: &'a CmdBlock) -> Result<Frag> {
        let body = match &b.children[0] {
            Cmd::Block(tb) => tb,
            _ => return Err(SorrelError("malformed try".into())),
        };
        let catch = match &b.children[1] {
            Cmd::Block(cb) => cb,
            _ => return Err(SorrelError("malformed try".into())),
        };
        self.tries += 1;
        let body_f = self.block(body);
        self.tries -= 1;
        let body_f = body_f?;

        // catch frame: first declared local receives the error message
        self.blocks.push(catch);
        self.depth += 1;
        let catch_children = self.stmts(&catch.children);
        self.depth -= 1;
        self.blocks.pop();
        let catch_children = catch_children?;
        let (ni, nf, ns, na) = catch.var_counts(self.ws);
        let mut catch_f = Frag::default();
        catch_f.op_imm(Op::BlkOpen, 0);
        catch_f.word(pack_counts(ni, nf, ns, na));
        catch_f.op(Op::PushErr);
        catch_f.op_imm(Op::SetStr, 0);
        catch_f.append(catch_children);
        catch_f.op(Op::BlkClose);

        let mut f = Frag::default();
        f.op_rel(Op::TryPush, body_f.len() as i64 + 2)?;
        f.append(body_f);
        f.op(Op::TryPop);
        f.op_rel(Op::Jmp, catch_f.len() as i64)?;
        f.append(catch_f);
        Ok(f)
    }

    fn break_stmt(&mut self) -> Result<Frag> {
        let lp = self
            .loops
            .last()
            .ok_or_else(|| SorrelError("break used outside of loop".into()))?;
        let mut f = Frag::default();
        for _ in 0..(self.tries - lp.tries) {
            f.op(Op::TryPop);
        }
        let frames = self.depth - lp.depth;
        if frames > 0 {
            f.op_imm(Op::PopBlk, frames as u16);
        }
        f.breaks.push(f.len());
        f.op_rel(Op::Jmp, 0)?;
        Ok(f)
    }

    fn continue_stmt(&mut self) -> Result<Frag> {
        let lp = self
            .loops
            .last()
            .ok_or_else(|| SorrelError("continue used outside of loop".into()))?;
        let mut f = Frag::default();
        for _ in 0..(self.tries - lp.tries) {
            f.op(Op::TryPop);
        }
        let frames = self.depth - lp.depth;
        if frames > 0 {
            f.op_imm(Op::PopBlk, frames as u16);
        }
        f.conts.push(f.len());
        f.op_rel(Op::Jmp, 0)?;
        Ok(f)
    }
}

/// Fill in break/continue jumps recorded inside `[body_base, ..)` once
/// the loop's exit and continue offsets are known.
fn patch_loop_sites(f: &mut Frag, body_base: usize, cont_at: usize, exit_at: usize) -> Result<()> {
    let breaks: Vec<usize> = f.breaks.iter().filter(|&&s| s >= body_base).copied().collect();
    f.breaks.retain(|&s| s < body_base);
    for site in breaks {
        let rel = i16::try_from(exit_at as i64 - (site as i64 + 1))
            .map_err(|_| SorrelError("block too large".into()))?;
        f.code[site] = word_imm_i16(Op::Jmp, rel);
    }
    let conts: Vec<usize> = f.conts.iter().filter(|&&s| s >= body_base).copied().collect();
    f.conts.retain(|&s| s < body_base);
    for site in conts {
        let rel = i16::try_from(cont_at as i64 - (site as i64 + 1))
            .map_err(|_| SorrelError("block too large".into()))?;
        f.code[site] = word_imm_i16(Op::Jmp, rel);
    }
    Ok(())
}

/// Lower one script function to local bytecode.
pub fn lower_fn(ws: &Workspace, obj: usize) -> Result<Lowered> {
    let name = ws.objects[obj].name.clone();
    let fobj = match &ws.objects[obj].kind {
        ObjKind::Func(f) => f,
        _ => return Err(SorrelError("not a function object".into())),
    };
    let mut r#gen = Gen::new(ws, fobj.unit);
    r#gen.any_ret = fobj.any_ret;
    r#gen.ret = fobj.ret;
    let mut par = (0usize, 0usize, 0usize, 0usize);
    for p in &fobj.pars {
        match stack_of(ws.types[*p].kind) {
            StackKind::Int => par.0 += 1,
            StackKind::Float => par.1 += 1,
            StackKind::Str => par.2 += 1,
            StackKind::Any => par.3 += 1,
        }
    }
    let total = fobj.body.var_counts(ws);
    let extra = (total.0 - par.0, total.1 - par.1, total.2 - par.2, total.3 - par.3);
    let mut f = Frag::default();
    f.op(Op::Entry);
    f.word(pack_counts(par.0, par.1, par.2, par.3));
    f.word(pack_counts(extra.0, extra.1, extra.2, extra.3));
    r#gen.blocks.push(&fobj.body);
    r#gen.depth = 0;
    f.append(r#gen.stmts(&fobj.body.children)?);
    if fobj.any_ret {
        f.op_imm(Op::PushImm, 0);
        f.op(Op::BoxInt);
        f.op_imm(Op::Ret, RES_ANY);
    } else if fobj.ret.is_none() {
        f.op_imm(Op::Ret, RES_NONE);
    }
    Ok(Lowered {
        name,
        unit: fobj.unit,
        code: f.code,
        strings: r#gen.strings,
        str_refs: f.str_refs,
        pos: f.pos,
        used: r#gen.used,
    })
}

/// Lower one named constant to a tiny code object whose return value
/// populates the shared constant cache on first use.
pub fn lower_const(ws: &Workspace, obj: usize) -> Result<Lowered> {
    let name = ws.objects[obj].name.clone();
    let cobj = match &ws.objects[obj].kind {
        ObjKind::Const(c) => c,
        _ => return Err(SorrelError("not a constant object".into())),
    };
    let mut r#gen = Gen::new(ws, cobj.unit);
    let mut f = Frag::default();
    f.op(Op::Entry);
    f.word(pack_counts(0, 0, 0, 0));
    f.word(pack_counts(0, 0, 0, 0));
    f.append(r#gen.expr(&cobj.value)?);
    f.op_imm(Op::Ret, res_kind_of(ws, cobj.typ));
    Ok(Lowered {
        name,
        unit: cobj.unit,
        code: f.code,
        strings: r#gen.strings,
        str_refs: f.str_refs,
        pos: f.pos,
        used: r#gen.used,
    })
}

/// Links programs, lowering each reachable function/constant once and
/// caching the result across repeated links.
pub struct Linker<'a> {
    ws: &'a Workspace,
    pub cache: HashMap<usize, Arc<Lowered>>,
}

impl<'a> Linker<'a> {
    pub fn new(ws: &'a Workspace) -> Self {
        Self { ws, cache: HashMap::new() }
    }

    fn lowered(&mut self, obj: usize) -> Result<Arc<Lowered>> {
        if let Some(low) = self.cache.get(&obj) {
            return Ok(low.clone());
        }
        let low = Arc::new(match &self.ws.objects[obj].kind {
            ObjKind::Func(_) => lower_fn(self.ws, obj)?,
            ObjKind::Const(_) => lower_const(self.ws, obj)?,
            _ => return Err(SorrelError("object has no code".into())),
        });
        self.cache.insert(obj, low.clone());
        Ok(low)
    }

    /// Link the program rooted at the unit's `run` entry: transitively
    /// append every used object's code exactly once, remapping string
    /// and position ids into the destination pool.
    pub fn link(&mut self) -> Result<Program> {
        let entry = self
            .ws
            .entry
            .ok_or_else(|| SorrelError("no run block in program".into()))?;
        let mut order: Vec<usize> = Vec::new();
        let mut seen: HashSet<usize> = HashSet::new();
        let mut work = vec![entry];
        seen.insert(entry);
        while let Some(obj) = work.pop() {
            let low = self.lowered(obj)?;
            order.push(obj);
            for &u in &low.used {
                if seen.insert(u) {
                    work.push(u);
                }
            }
        }
        let mut pool = StrPool::default();
        let mut code: Vec<u32> = Vec::new();
        let mut pos: Vec<PosEntry> = Vec::new();
        let mut funcs: HashMap<u32, u32> = HashMap::new();
        for obj in order {
            let low = self.cache[&obj].clone();
            let base = code.len();
            let mut body = low.code.clone();
            for &r in &low.str_refs {
                let local = body[r] as usize;
                body[r] = pool.intern(&low.strings[local]);
            }
            code.extend_from_slice(&body);
            let path_id = pool.intern(&self.ws.units[low.unit].path);
            let func_id = pool.intern(&low.name);
            for (off, line, col) in &low.pos {
                pos.push(PosEntry {
                    offset: base as u32 + off,
                    path: path_id,
                    func: func_id,
                    line: *line,
                    col: *col,
                });
            }
            funcs.insert(obj as u32, base as u32);
        }
        let entry_res = match &self.ws.objects[entry].kind {
            ObjKind::Func(f) => {
                if f.any_ret {
                    RES_ANY
                } else {
                    match f.ret {
                        Some(t) => res_kind_of(self.ws, t),
                        None => RES_NONE,
                    }
                }
            }
            _ => RES_NONE,
        };
        let entry_off = funcs[&(entry as u32)];
        Ok(Program {
            code,
            pool: pool.items,
            pos,
            funcs,
            entry: entry_off,
            entry_res,
        })
    }
}

/// One-shot convenience: link the workspace's entry program.
pub fn link(ws: &Workspace) -> Result<Program> {
    Linker::new(ws).link()
}
