//! Operator-precedence expression engine: an output list and an
//! operator buffer, with markers recording call/index openings so the
//! argument count can be recovered at the closing token.
use sorrel_ast::{
    AssignOp, BlockKind, Cmd, CmdBlock, IdxStep, Lit, ObjKind, TypeKind, T_BOOL, T_CHAR, T_FLOAT,
    T_INT, T_NONE, T_STR,
};
use sorrel_common::{Result, SorrelError};
use sorrel_lexer::TokenKind;

use crate::Parser;

enum EOp {
    Bin { name: &'static str, prio: u8, tok: u32 },
    Asn { op: AssignOp, tok: u32 },
    Un { name: &'static str, tok: u32 },
    Open,
    Call { name: String, tok: u32, mark: usize, argc: usize },
    Index { tok: u32, mark: usize },
    Tern1 { tok: u32 },
    Tern2 { tok: u32 },
}

fn top_prio(op: &EOp) -> Option<u8> {
    match op {
        EOp::Bin { prio, .. } => Some(*prio),
        EOp::Un { .. } => Some(70),
        EOp::Asn { .. } => Some(5),
        EOp::Tern1 { .. } | EOp::Tern2 { .. } => Some(7),
        EOp::Open | EOp::Call { .. } | EOp::Index { .. } => None,
    }
}

/// Copyable view of the operator-buffer top, so reduce loops can pop
/// without holding a borrow across the decision.
#[derive(Clone, Copy, PartialEq)]
enum Top {
    Empty,
    Open,
    Call,
    Index,
    Tern1,
    Tern2,
    Reducible(u8),
}

fn top_of(ops: &[EOp]) -> Top {
    match ops.last() {
        None => Top::Empty,
        Some(EOp::Open) => Top::Open,
        Some(EOp::Call { .. }) => Top::Call,
        Some(EOp::Index { .. }) => Top::Index,
        Some(EOp::Tern1 { .. }) => Top::Tern1,
        Some(EOp::Tern2 { .. }) => Top::Tern2,
        Some(EOp::Bin { prio, .. }) => Top::Reducible(*prio),
        Some(EOp::Un { .. }) => Top::Reducible(70),
        Some(EOp::Asn { .. }) => Top::Reducible(5),
    }
}

fn bin_of(kind: TokenKind) -> Option<(&'static str, u8)> {
    Some(match kind {
        TokenKind::OrOr => ("||", 10),
        TokenKind::AndAnd => ("&&", 15),
        TokenKind::Pipe => ("|", 20),
        TokenKind::Caret => ("^", 25),
        TokenKind::Amp => ("&", 30),
        TokenKind::Eq => ("==", 35),
        TokenKind::Ne => ("!=", 35),
        TokenKind::Lt => ("<", 40),
        TokenKind::Le => ("<=", 40),
        TokenKind::Gt => (">", 40),
        TokenKind::Ge => (">=", 40),
        TokenKind::Shl => ("<<", 45),
        TokenKind::Shr => (">>", 45),
        TokenKind::Plus => ("+", 50),
        TokenKind::Minus => ("-", 50),
        TokenKind::Star => ("*", 55),
        TokenKind::Slash => ("/", 55),
        TokenKind::Percent => ("%", 55),
        _ => return None,
    })
}

fn asn_of(kind: TokenKind) -> Option<AssignOp> {
    Some(match kind {
        TokenKind::Assign => AssignOp::Set,
        TokenKind::AddAssign => AssignOp::Add,
        TokenKind::SubAssign => AssignOp::Sub,
        TokenKind::MulAssign => AssignOp::Mul,
        TokenKind::DivAssign => AssignOp::Div,
        TokenKind::ModAssign => AssignOp::Mod,
        _ => return None,
    })
}

fn parse_int_text(text: &str) -> Option<i64> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else if let Some(oct) = text.strip_prefix("0o").or_else(|| text.strip_prefix("0O")) {
        i64::from_str_radix(oct, 8).ok()
    } else {
        text.parse().ok()
    }
}

pub(crate) fn expr(p: &mut Parser) -> Result<Cmd> {
    let mut out: Vec<Cmd> = Vec::new();
    let mut ops: Vec<EOp> = Vec::new();
    let mut operand = true;
    'scan: loop {
        let kind = p.peek();
        if kind == TokenKind::NewLine {
            let inside = ops
                .iter()
                .any(|o| matches!(o, EOp::Open | EOp::Call { .. } | EOp::Index { .. }));
            if operand || inside {
                p.i += 1;
                continue;
            }
            break;
        }
        if operand {
            match kind {
                TokenKind::IntLit => {
                    let i = take(p);
                    let text = p.lex.token_text(i);
                    let v = parse_int_text(text)
                        .ok_or_else(|| p.err_at(i, &format!("invalid number '{}'", text)))?;
                    out.push(Cmd::Value { val: Lit::Int(v), typ: T_INT, tok: i as u32 });
                    operand = false;
                }
                TokenKind::FloatLit => {
                    let i = take(p);
                    let text = p.lex.token_text(i);
                    let v: f64 = text
                        .parse()
                        .map_err(|_| p.err_at(i, &format!("invalid number '{}'", text)))?;
                    out.push(Cmd::Value { val: Lit::Float(v), typ: T_FLOAT, tok: i as u32 });
                    operand = false;
                }
                TokenKind::StrLit => {
                    let i = take(p);
                    let s = p.lex.token_text(i).to_string();
                    out.push(Cmd::Value { val: Lit::Str(s), typ: T_STR, tok: i as u32 });
                    operand = false;
                }
                TokenKind::CharLit => {
                    let i = take(p);
                    let c = p.lex.token_text(i).chars().next().unwrap_or('\0');
                    out.push(Cmd::Value { val: Lit::Char(c), typ: T_CHAR, tok: i as u32 });
                    operand = false;
                }
                TokenKind::KwTrue | TokenKind::KwFalse => {
                    let i = take(p);
                    let b = kind == TokenKind::KwTrue;
                    out.push(Cmd::Value { val: Lit::Bool(b), typ: T_BOOL, tok: i as u32 });
                    operand = false;
                }
                TokenKind::Ident => {
                    let i = take(p);
                    let name = p.lex.token_text(i).to_string();
                    if p.peek() == TokenKind::LParen {
                        p.i += 1;
                        ops.push(EOp::Call { name, tok: i as u32, mark: out.len(), argc: 0 });
                        // still expecting the first argument (or ')')
                    } else if let Some((b, o, t)) = p.resolve_var(&name) {
                        out.push(p.make_var(b, o, t, i as u32));
                        operand = false;
                    } else if let Some(&oid) = p.ws.names.get(&name) {
                        match &p.ws.objects[oid].kind {
                            ObjKind::Const(c) => {
                                out.push(Cmd::ConstRef { obj: oid, typ: c.typ, tok: i as u32 });
                                operand = false;
                            }
                            _ => {
                                return Err(p.err_at(i, &format!("'{}' is not a value", name)));
                            }
                        }
                    } else {
                        return Err(p.err_at(i, &format!("unknown identifier '{}'", name)));
                    }
                }
                TokenKind::Minus => {
                    let i = take(p);
                    ops.push(EOp::Un { name: "-", tok: i as u32 });
                }
                TokenKind::Not => {
                    let i = take(p);
                    ops.push(EOp::Un { name: "!", tok: i as u32 });
                }
                TokenKind::Tilde => {
                    let i = take(p);
                    ops.push(EOp::Un { name: "~", tok: i as u32 });
                }
                TokenKind::LParen => {
                    p.i += 1;
                    ops.push(EOp::Open);
                }
                TokenKind::RParen => {
                    // only a zero-argument call may close here
                    let zero_call = matches!(
                        ops.last(),
                        Some(EOp::Call { mark, argc: 0, .. }) if *mark == out.len()
                    );
                    if !zero_call {
                        return Err(p.err_here("unexpected ')'"));
                    }
                    p.i += 1;
                    let (name, tok, mark) = match ops.pop() {
                        Some(EOp::Call { name, tok, mark, .. }) => (name, tok, mark),
                        _ => unreachable!(),
                    };
                    finish_call(p, &mut out, name, tok, mark)?;
                    operand = false;
                }
                _ => {
                    return Err(p.err_here(&format!(
                        "unexpected token '{}' in expression",
                        p.describe_tok(p.i)
                    )))
                }
            }
        } else {
            if let Some(op) = asn_of(kind) {
                let i = take(p);
                reduce_while(p, &mut out, &mut ops, 5, true)?;
                ops.push(EOp::Asn { op, tok: i as u32 });
                operand = true;
                continue;
            }
            if let Some((name, prio)) = bin_of(kind) {
                let i = take(p);
                reduce_while(p, &mut out, &mut ops, prio, false)?;
                ops.push(EOp::Bin { name, prio, tok: i as u32 });
                operand = true;
                continue;
            }
            match kind {
                TokenKind::Question => {
                    let i = take(p);
                    reduce_while(p, &mut out, &mut ops, 7, true)?;
                    ops.push(EOp::Tern1 { tok: i as u32 });
                    operand = true;
                }
                TokenKind::Colon => {
                    // ':' belongs to a pending ternary, otherwise to the caller
                    let mut is_tern = false;
                    loop {
                        match top_of(&ops) {
                            Top::Reducible(pr) if pr > 7 => {
                                let op = ops.pop().unwrap();
                                apply(p, &mut out, op)?;
                            }
                            Top::Tern1 => {
                                is_tern = true;
                                break;
                            }
                            _ => break,
                        }
                    }
                    if !is_tern {
                        break 'scan;
                    }
                    let tok = match ops.pop() {
                        Some(EOp::Tern1 { tok }) => tok,
                        _ => unreachable!(),
                    };
                    p.i += 1;
                    ops.push(EOp::Tern2 { tok });
                    operand = true;
                }
                TokenKind::LBracket => {
                    let i = take(p);
                    match out.last() {
                        Some(Cmd::Var { .. }) => {}
                        _ => return Err(p.err_at(i, "only variables can be indexed")),
                    }
                    ops.push(EOp::Index { tok: i as u32, mark: out.len() });
                    operand = true;
                }
                TokenKind::RBracket => {
                    loop {
                        match top_of(&ops) {
                            Top::Empty => break 'scan,
                            Top::Index => break,
                            Top::Open | Top::Call => return Err(p.err_here("expected ')'")),
                            _ => {
                                let op = ops.pop().unwrap();
                                apply(p, &mut out, op)?;
                            }
                        }
                    }
                    let (mark, tok) = match ops.pop() {
                        Some(EOp::Index { mark, tok }) => (mark, tok),
                        _ => unreachable!(),
                    };
                    if out.len() != mark + 1 {
                        return Err(p.err_at(tok as usize, "expected index expression"));
                    }
                    p.i += 1;
                    let idx_cmd = out.pop().unwrap();
                    let var = out.last_mut().expect("index target");
                    attach_index(p, var, idx_cmd, tok)?;
                }
                TokenKind::Dot => {
                    p.i += 1;
                    let fi = p.expect(TokenKind::Ident, "field name")?;
                    let fname = p.lex.token_text(fi).to_string();
                    let var = match out.last_mut() {
                        Some(v @ Cmd::Var { .. }) => v,
                        _ => return Err(p.err_at(fi, "only variables have fields")),
                    };
                    attach_field(p, var, &fname, fi)?;
                }
                TokenKind::Inc | TokenKind::Dec => {
                    let i = take(p);
                    let delta: i8 = if kind == TokenKind::Inc { 1 } else { -1 };
                    let target = out.pop().expect("operand before ++/--");
                    match &target {
                        Cmd::Var { typ, idx, .. } if idx.is_empty() && *typ == T_INT => {}
                        _ => return Err(p.err_at(i, "invalid assignment target")),
                    }
                    let mut blk = CmdBlock::new(BlockKind::IncDec(delta), i as u32);
                    blk.children = vec![target];
                    out.push(Cmd::Block(blk));
                }
                TokenKind::Comma => {
                    loop {
                        match top_of(&ops) {
                            Top::Empty => break 'scan,
                            Top::Call => break,
                            Top::Open | Top::Index => return Err(p.err_here("unexpected ','")),
                            _ => {
                                let op = ops.pop().unwrap();
                                apply(p, &mut out, op)?;
                            }
                        }
                    }
                    if let Some(EOp::Call { mark, argc, tok, .. }) = ops.last_mut() {
                        *argc += 1;
                        if out.len() != *mark + *argc {
                            return Err(p.err_at(*tok as usize, "missing argument"));
                        }
                    }
                    p.i += 1;
                    operand = true;
                }
                TokenKind::RParen => {
                    loop {
                        match top_of(&ops) {
                            Top::Empty => break 'scan,
                            Top::Open | Top::Call => break,
                            Top::Index => return Err(p.err_here("expected ']'")),
                            _ => {
                                let op = ops.pop().unwrap();
                                apply(p, &mut out, op)?;
                            }
                        }
                    }
                    match ops.pop() {
                        Some(EOp::Open) => {
                            p.i += 1;
                        }
                        Some(EOp::Call { name, tok, mark, argc }) => {
                            let args_n = out.len() - mark;
                            let valid = (argc == 0 && args_n <= 1) || args_n == argc + 1;
                            if !valid {
                                return Err(p.err_at(tok as usize, "missing argument"));
                            }
                            p.i += 1;
                            finish_call(p, &mut out, name, tok, mark)?;
                        }
                        _ => unreachable!(),
                    }
                }
                _ => break,
            }
        }
    }
    // end of expression: drain the operator buffer
    while let Some(op) = ops.pop() {
        match op {
            EOp::Open | EOp::Call { .. } => return Err(p.err_here("expected ')'")),
            EOp::Index { .. } => return Err(p.err_here("expected ']'")),
            other => apply(p, &mut out, other)?,
        }
    }
    match out.len() {
        0 => Err(p.err_here("expected expression")),
        1 => Ok(out.pop().unwrap()),
        _ => Err(p.err_here("invalid expression")),
    }
}

fn take(p: &mut Parser) -> usize {
    let i = p.i;
    p.i += 1;
    i
}

fn reduce_while(
    p: &Parser,
    out: &mut Vec<Cmd>,
    ops: &mut Vec<EOp>,
    prio: u8,
    right: bool,
) -> Result<()> {
    loop {
        let reduce = match ops.last() {
            Some(op) => match top_prio(op) {
                Some(tp) => {
                    if right { tp > prio } else { tp >= prio }
                }
                None => false,
            },
            None => false,
        };
        if !reduce {
            return Ok(());
        }
        let op = ops.pop().unwrap();
        apply(p, out, op)?;
    }
}

fn apply(p: &Parser, out: &mut Vec<Cmd>, op: EOp) -> Result<()> {
    match op {
        EOp::Bin { name, tok, .. } => apply_bin(p, out, name, tok),
        EOp::Un { name, tok } => apply_un(p, out, name, tok),
        EOp::Asn { op, tok } => apply_asn(p, out, op, tok),
        EOp::Tern2 { tok } => apply_tern(p, out, tok),
        EOp::Tern1 { tok } => Err(p.err_at(tok as usize, "missing ':' in ternary")),
        EOp::Open | EOp::Call { .. } | EOp::Index { .. } => unreachable!("marker in apply"),
    }
}

fn pop2(p: &Parser, out: &mut Vec<Cmd>, tok: u32) -> Result<(Cmd, Cmd)> {
    let right = out
        .pop()
        .ok_or_else(|| p.err_at(tok as usize, "missing operand"))?;
    let left = out
        .pop()
        .ok_or_else(|| p.err_at(tok as usize, "missing operand"))?;
    Ok((left, right))
}

fn apply_bin(p: &Parser, out: &mut Vec<Cmd>, name: &'static str, tok: u32) -> Result<()> {
    let (left, right) = pop2(p, out, tok)?;
    let (lt, rt) = (left.typ(), right.typ());
    if lt == T_NONE || rt == T_NONE {
        return Err(p.err_at(tok as usize, "void value in expression"));
    }
    match name {
        "&&" | "||" => {
            if lt != T_BOOL || rt != T_BOOL {
                return Err(p.err_at(
                    tok as usize,
                    &format!("operator not found: {}", p.ws.signature(name, &[lt, rt])),
                ));
            }
            let kind = if name == "&&" { BlockKind::And } else { BlockKind::Or };
            let mut blk = CmdBlock::new(kind, tok);
            blk.children = vec![left, right];
            blk.typ = T_BOOL;
            out.push(Cmd::Block(blk));
            Ok(())
        }
        "!=" => synth_neg(p, out, "==", name, left, right, tok),
        "<=" => synth_neg(p, out, ">", name, left, right, tok),
        ">=" => synth_neg(p, out, "<", name, left, right, tok),
        _ => {
            let obj = p.ws.find_func(name, &[lt, rt]).ok_or_else(|| {
                p.err_at(
                    tok as usize,
                    &format!("operator not found: {}", p.ws.signature(name, &[lt, rt])),
                )
            })?;
            let typ = p.ws.result_of(obj);
            out.push(Cmd::Binary { obj, left: Box::new(left), right: Box::new(right), typ, tok });
            Ok(())
        }
    }
}

/// `!=`, `<=`, `>=` have no direct primitive op: combine the
/// complementary comparison with boolean negation.
fn synth_neg(
    p: &Parser,
    out: &mut Vec<Cmd>,
    base: &'static str,
    shown: &'static str,
    left: Cmd,
    right: Cmd,
    tok: u32,
) -> Result<()> {
    let (lt, rt) = (left.typ(), right.typ());
    let obj = p.ws.find_func(base, &[lt, rt]).ok_or_else(|| {
        p.err_at(
            tok as usize,
            &format!("operator not found: {}", p.ws.signature(shown, &[lt, rt])),
        )
    })?;
    let not_obj = p
        .ws
        .find_func("!", &[T_BOOL])
        .ok_or_else(|| SorrelError("operator not found: !(bool)".to_string()))?;
    let inner = Cmd::Binary { obj, left: Box::new(left), right: Box::new(right), typ: T_BOOL, tok };
    out.push(Cmd::Unary { obj: not_obj, operand: Box::new(inner), typ: T_BOOL, tok });
    Ok(())
}

fn apply_un(p: &Parser, out: &mut Vec<Cmd>, name: &'static str, tok: u32) -> Result<()> {
    let operand = out
        .pop()
        .ok_or_else(|| p.err_at(tok as usize, "missing operand"))?;
    let t = operand.typ();
    let obj = p.ws.find_func(name, &[t]).ok_or_else(|| {
        p.err_at(
            tok as usize,
            &format!("operator not found: {}", p.ws.signature(name, &[t])),
        )
    })?;
    let typ = p.ws.result_of(obj);
    out.push(Cmd::Unary { obj, operand: Box::new(operand), typ, tok });
    Ok(())
}

fn apply_asn(p: &Parser, out: &mut Vec<Cmd>, op: AssignOp, tok: u32) -> Result<()> {
    let (target, value) = {
        let (l, r) = pop2(p, out, tok)?;
        (l, r)
    };
    let tt = match &target {
        Cmd::Var { typ, .. } => *typ,
        _ => return Err(p.err_at(tok as usize, "invalid assignment target")),
    };
    match op.base() {
        None => {
            if !p.assignable(tt, value.typ()) {
                return Err(p.err_at(
                    tok as usize,
                    &format!(
                        "cannot assign {} to {}",
                        p.ws.type_name(value.typ()),
                        p.ws.type_name(tt)
                    ),
                ));
            }
        }
        Some(base) => {
            let obj = p.ws.find_func(base, &[tt, value.typ()]).ok_or_else(|| {
                p.err_at(
                    tok as usize,
                    &format!(
                        "operator not found: {}",
                        p.ws.signature(base, &[tt, value.typ()])
                    ),
                )
            })?;
            if p.ws.result_of(obj) != tt {
                return Err(p.err_at(tok as usize, "compound assignment changes the type"));
            }
        }
    }
    let mut blk = CmdBlock::new(BlockKind::Assign(op), tok);
    blk.children = vec![target, value];
    out.push(Cmd::Block(blk));
    Ok(())
}

fn apply_tern(p: &Parser, out: &mut Vec<Cmd>, tok: u32) -> Result<()> {
    let else_b = out
        .pop()
        .ok_or_else(|| p.err_at(tok as usize, "missing operand"))?;
    let then_b = out
        .pop()
        .ok_or_else(|| p.err_at(tok as usize, "missing operand"))?;
    let cond = out
        .pop()
        .ok_or_else(|| p.err_at(tok as usize, "missing operand"))?;
    if cond.typ() != T_BOOL {
        return Err(p.err_at(tok as usize, "ternary condition must be bool"));
    }
    if then_b.typ() != else_b.typ() {
        return Err(p.err_at(tok as usize, "ternary branches must have the same type"));
    }
    let typ = then_b.typ();
    let mut blk = CmdBlock::new(BlockKind::Ternary, tok);
    blk.children = vec![cond, then_b, else_b];
    blk.typ = typ;
    out.push(Cmd::Block(blk));
    Ok(())
}

fn finish_call(p: &Parser, out: &mut Vec<Cmd>, name: String, tok: u32, mark: usize) -> Result<()> {
    let args = out.split_off(mark);
    let arg_types: Vec<_> = args.iter().map(|a| a.typ()).collect();
    if arg_types.iter().any(|t| *t == T_NONE) {
        return Err(p.err_at(tok as usize, "void value in expression"));
    }
    let obj = p.ws.find_func(&name, &arg_types).ok_or_else(|| {
        p.err_at(
            tok as usize,
            &format!("function not found: {}", p.ws.signature(&name, &arg_types)),
        )
    })?;
    let typ = p.ws.result_of(obj);
    out.push(Cmd::AnyCall { obj, args, typ, tok });
    Ok(())
}

fn attach_index(p: &Parser, var: &mut Cmd, idx_cmd: Cmd, tok: u32) -> Result<()> {
    let Cmd::Var { typ, idx, .. } = var else {
        return Err(p.err_at(tok as usize, "only variables can be indexed"));
    };
    match p.ws.types[*typ].kind {
        TypeKind::Arr => {
            if idx_cmd.typ() != T_INT {
                return Err(p.err_at(idx_cmd.tok() as usize, "array index must be int"));
            }
            let elem = p.ws.elem_of(*typ);
            idx.push(IdxStep::Arr(Box::new(idx_cmd)));
            *typ = elem;
        }
        TypeKind::Map => {
            if idx_cmd.typ() != T_STR {
                return Err(p.err_at(idx_cmd.tok() as usize, "map keys must be str"));
            }
            let elem = p.ws.elem_of(*typ);
            idx.push(IdxStep::Map(Box::new(idx_cmd)));
            *typ = elem;
        }
        TypeKind::Buf => {
            if idx_cmd.typ() != T_INT {
                return Err(p.err_at(idx_cmd.tok() as usize, "buf index must be int"));
            }
            idx.push(IdxStep::Buf(Box::new(idx_cmd)));
            *typ = T_INT;
        }
        _ => {
            return Err(p.err_at(
                tok as usize,
                &format!("cannot index {}", p.ws.type_name(*typ)),
            ))
        }
    }
    Ok(())
}

fn attach_field(p: &Parser, var: &mut Cmd, fname: &str, fi: usize) -> Result<()> {
    let Cmd::Var { typ, idx, .. } = var else {
        return Err(p.err_at(fi, "only variables have fields"));
    };
    let desc = &p.ws.types[*typ];
    if desc.kind != TypeKind::Struct {
        return Err(p.err_at(fi, &format!("{} has no fields", desc.name)));
    }
    let slot = desc
        .field_slot(fname)
        .ok_or_else(|| p.err_at(fi, &format!("unknown field '{}' in {}", fname, desc.name)))?;
    let ftyp = desc.fields[slot].1;
    idx.push(IdxStep::Field(slot));
    *typ = ftyp;
    Ok(())
}
