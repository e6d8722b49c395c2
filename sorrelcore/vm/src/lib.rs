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

//! Stack-based bytecode interpreter. Values live on segregated typed
//! stacks (int also carries bool/char, then float, string, boxed); a
//! frame stack records per-stack base offsets, the loop budget, the
//! resume offset and whether a frame is a real function call or a
//! transparent block scope. Spawned threads get their own stacks and
//! frames but share the bytecode, pools and lock-guarded global tables.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use sorrel_bytecode::{
    decode, read_f64, read_i64, unpack_counts, EmbedDispatch, EmbedFn, Op, Program, RtShared,
    Settings, ThreadStatus, TypeTag, Value, RES_ANY, RES_BOOL, RES_CHAR, RES_FLOAT, RES_INT,
    RES_NONE, RES_STR,
};
use sorrel_common::{
    RtResult, RuntimeError, TraceLine, ERR_CYCLE, ERR_DEPTH, ERR_DIVZERO, ERR_EMBED, ERR_GENERIC,
    ERR_INDEX, ERR_KEY, ERR_SANDBOX, ERR_SHIFT, ERR_VALUE,
};

pub struct VM {
    prog: Arc<Program>,
    table: &'static [EmbedFn],
    shared: Arc<RtShared>,
}

impl VM {
    pub fn new(prog: Program, table: &'static [EmbedFn], settings: Settings) -> Self {
        Self {
            prog: Arc::new(prog),
            table,
            shared: Arc::new(RtShared::new(settings)),
        }
    }

    /// The shared tables (context map, thread table); hosts may seed the
    /// context before running.
    pub fn shared(&self) -> &Arc<RtShared> {
        &self.shared
    }

    /// Execute the linked program from its entry function.
    pub fn run(&self) -> RtResult<Value> {
        let (_, slot) = self.shared.threads.register();
        slot.set_status(ThreadStatus::Running);
        let mut rt = Runtime::new(
            self.prog.clone(),
            self.table,
            self.shared.clone(),
            Some(slot.clone()),
        );
        let res = rt.exec(self.prog.entry as usize);
        match &res {
            Ok(_) => slot.set_status(if rt.closed { ThreadStatus::Closed } else { ThreadStatus::Finished }),
            Err(e) => {
                *slot.error.lock().unwrap() = Some(e.clone());
                slot.set_status(ThreadStatus::Errored);
            }
        }
        res
    }
}

struct Frame {
    ib: usize,
    fb: usize,
    sb: usize,
    ab: usize,
    ret: usize,
    func: bool,
    is_loop: bool,
    cycle: u64,
    const_id: Option<u32>,
}

struct TryEntry {
    frames: usize,
    ib: usize,
    fb: usize,
    sb: usize,
    ab: usize,
    catch_ip: usize,
}

const ROOT_RET: usize = usize::MAX;

struct Runtime {
    prog: Arc<Program>,
    table: &'static [EmbedFn],
    shared: Arc<RtShared>,
    ints: Vec<i64>,
    floats: Vec<f64>,
    strs: Vec<String>,
    anys: Vec<Value>,
    frames: Vec<Frame>,
    tries: Vec<TryEntry>,
    depth: usize,
    slot: Option<Arc<sorrel_bytecode::ThreadSlot>>,
    err_msg: String,
    closed: bool,
}

impl Runtime {
    fn new(
        prog: Arc<Program>,
        table: &'static [EmbedFn],
        shared: Arc<RtShared>,
        slot: Option<Arc<sorrel_bytecode::ThreadSlot>>,
    ) -> Self {
        Self {
            prog,
            table,
            shared,
            ints: Vec::new(),
            floats: Vec::new(),
            strs: Vec::new(),
            anys: Vec::new(),
            frames: Vec::new(),
            tries: Vec::new(),
            depth: 0,
            slot,
            err_msg: String::new(),
            closed: false,
        }
    }

    fn pop_i(&mut self) -> RtResult<i64> {
        self.ints
            .pop()
            .ok_or_else(|| RuntimeError::new(ERR_GENERIC, "int stack underflow"))
    }

    fn pop_f(&mut self) -> RtResult<f64> {
        self.floats
            .pop()
            .ok_or_else(|| RuntimeError::new(ERR_GENERIC, "float stack underflow"))
    }

    fn pop_s(&mut self) -> RtResult<String> {
        self.strs
            .pop()
            .ok_or_else(|| RuntimeError::new(ERR_GENERIC, "str stack underflow"))
    }

    fn pop_a(&mut self) -> RtResult<Value> {
        self.anys
            .pop()
            .ok_or_else(|| RuntimeError::new(ERR_GENERIC, "any stack underflow"))
    }

    /// Resolve a runtime fault: unwind to the innermost valid try entry,
    /// or propagate with the call trace attached.
    fn raise(&mut self, at: usize, id: u16, msg: String, ip: &mut usize) -> RtResult<()> {
        while let Some(t) = self.tries.last() {
            if t.frames > self.frames.len() {
                self.tries.pop();
            } else {
                break;
            }
        }
        if let Some(t) = self.tries.pop() {
            self.frames.truncate(t.frames);
            self.ints.truncate(t.ib);
            self.floats.truncate(t.fb);
            self.strs.truncate(t.sb);
            self.anys.truncate(t.ab);
            self.depth = self.frames.iter().filter(|f| f.func).count();
            self.err_msg = msg;
            *ip = t.catch_ip;
            Ok(())
        } else {
            let mut e = RuntimeError::new(id, msg);
            e.trace = self.build_trace(at);
            Err(e)
        }
    }

    /// Map frame resume offsets through the position table, entry frame
    /// first, the failing instruction last.
    fn build_trace(&self, at: usize) -> Vec<TraceLine> {
        let mut lines = Vec::new();
        for fr in &self.frames {
            if fr.func && fr.ret != ROOT_RET {
                // the call instruction sits two words before its resume offset
                if let Some(pe) = self.prog.pos_at(fr.ret.saturating_sub(2) as u32) {
                    lines.push(self.trace_line(pe));
                }
            }
        }
        if let Some(pe) = self.prog.pos_at(at as u32) {
            lines.push(self.trace_line(pe));
        }
        lines
    }

    fn trace_line(&self, pe: &sorrel_bytecode::PosEntry) -> TraceLine {
        TraceLine {
            path: self.prog.pool[pe.path as usize].clone(),
            func: self.prog.pool[pe.func as usize].clone(),
            line: pe.line,
            col: pe.col,
        }
    }

    /// Safe dispatch point: honor posted close/pause requests. Returns
    /// false when the thread must stop.
    fn check_thread(&self) -> bool {
        match &self.slot {
            Some(slot) => {
                if slot.close.load(Ordering::Acquire) {
                    return false;
                }
                slot.park_if_paused()
            }
            None => true,
        }
    }

    fn push_zeros(&mut self, counts: u32) {
        let (ni, nf, ns, na) = unpack_counts(counts);
        self.ints.extend(std::iter::repeat(0).take(ni));
        self.floats.extend(std::iter::repeat(0.0).take(nf));
        self.strs.extend(std::iter::repeat_with(String::new).take(ns));
        self.anys.extend(std::iter::repeat_with(|| Value::Int(0)).take(na));
    }

    fn frame_at(&self, dist: usize) -> &Frame {
        &self.frames[self.frames.len() - 1 - dist]
    }

    fn exec(&mut self, start: usize) -> RtResult<Value> {
        self.frames.push(Frame {
            ib: 0,
            fb: 0,
            sb: 0,
            ab: 0,
            ret: ROOT_RET,
            func: true,
            is_loop: false,
            cycle: 0,
            const_id: None,
        });
        self.depth = 1;
        let prog = self.prog.clone();
        let code = &prog.code;
        let mut ip = start;
        loop {
            let word = code[ip];
            let (opw, imm) = decode(word);
            let op = match Op::from_u16(opw) {
                Ok(op) => op,
                Err(e) => {
                    self.raise(ip, ERR_GENERIC, e.0, &mut ip)?;
                    continue;
                }
            };
            match op {
                Op::PushImm => {
                    self.ints.push(imm as i16 as i64);
                    ip += 1;
                }
                Op::PushInt => {
                    self.ints.push(read_i64(code, ip + 1));
                    ip += 3;
                }
                Op::PushFloat => {
                    self.floats.push(read_f64(code, ip + 1));
                    ip += 3;
                }
                Op::PushStr => {
                    let idx = code[ip + 1] as usize;
                    self.strs.push(prog.pool[idx].clone());
                    ip += 2;
                }
                Op::PushChar => {
                    let c = char::from_u32(code[ip + 1]).unwrap_or('\0');
                    self.ints.push(c as i64);
                    ip += 2;
                }
                Op::GetInt | Op::GetFloat | Op::GetStr | Op::GetAny => {
                    let dist = (imm >> 8) as usize;
                    let slot = (imm & 0xff) as usize;
                    let fr = self.frame_at(dist);
                    match op {
                        Op::GetInt => {
                            let v = self.ints[fr.ib + slot];
                            self.ints.push(v);
                        }
                        Op::GetFloat => {
                            let v = self.floats[fr.fb + slot];
                            self.floats.push(v);
                        }
                        Op::GetStr => {
                            let v = self.strs[fr.sb + slot].clone();
                            self.strs.push(v);
                        }
                        _ => {
                            let v = self.anys[fr.ab + slot].clone();
                            self.anys.push(v);
                        }
                    }
                    ip += 1;
                }
                Op::SetInt | Op::SetFloat | Op::SetStr | Op::SetAny => {
                    let dist = (imm >> 8) as usize;
                    let slot = (imm & 0xff) as usize;
                    match op {
                        Op::SetInt => {
                            let v = self.pop_i()?;
                            let at = self.frame_at(dist).ib + slot;
                            self.ints[at] = v;
                        }
                        Op::SetFloat => {
                            let v = self.pop_f()?;
                            let at = self.frame_at(dist).fb + slot;
                            self.floats[at] = v;
                        }
                        Op::SetStr => {
                            let v = self.pop_s()?;
                            let at = self.frame_at(dist).sb + slot;
                            self.strs[at] = v;
                        }
                        _ => {
                            let v = self.pop_a()?;
                            let at = self.frame_at(dist).ab + slot;
                            self.anys[at] = v;
                        }
                    }
                    ip += 1;
                }
                Op::IdxGetArr => {
                    let idx = self.pop_i()?;
                    let cont = self.pop_a()?;
                    match cont {
                        Value::Arr(a) => {
                            let a = a.lock().unwrap();
                            match usize::try_from(idx).ok().and_then(|i| a.get(i)) {
                                Some(v) => {
                                    let v = v.clone();
                                    drop(a);
                                    self.anys.push(v);
                                    ip += 1;
                                }
                                None => {
                                    let n = a.len();
                                    drop(a);
                                    self.raise(
                                        ip,
                                        ERR_INDEX,
                                        format!("index {} out of range [{}]", idx, n),
                                        &mut ip,
                                    )?;
                                }
                            }
                        }
                        other => {
                            self.raise(
                                ip,
                                ERR_VALUE,
                                format!("expected arr, got {}", other.type_name()),
                                &mut ip,
                            )?;
                        }
                    }
                }
                Op::IdxGetMap => {
                    let key = self.pop_s()?;
                    let cont = self.pop_a()?;
                    match cont {
                        Value::Map(m) => {
                            let found = m.lock().unwrap().get(&key).cloned();
                            match found {
                                Some(v) => {
                                    self.anys.push(v);
                                    ip += 1;
                                }
                                None => {
                                    self.raise(
                                        ip,
                                        ERR_KEY,
                                        format!("key '{}' not found", key),
                                        &mut ip,
                                    )?;
                                }
                            }
                        }
                        other => {
                            self.raise(
                                ip,
                                ERR_VALUE,
                                format!("expected map, got {}", other.type_name()),
                                &mut ip,
                            )?;
                        }
                    }
                }
                Op::IdxGetFld => {
                    let cont = self.pop_a()?;
                    match cont {
                        Value::Struct(s) => {
                            let v = s.lock().unwrap()[imm as usize].clone();
                            self.anys.push(v);
                            ip += 1;
                        }
                        other => {
                            self.raise(
                                ip,
                                ERR_VALUE,
                                format!("expected struct, got {}", other.type_name()),
                                &mut ip,
                            )?;
                        }
                    }
                }
                Op::IdxGetBuf => {
                    let idx = self.pop_i()?;
                    let cont = self.pop_a()?;
                    match cont {
                        Value::Buf(b) => {
                            let b = b.lock().unwrap();
                            match usize::try_from(idx).ok().and_then(|i| b.get(i)) {
                                Some(v) => {
                                    let v = *v as i64;
                                    drop(b);
                                    self.ints.push(v);
                                    ip += 1;
                                }
                                None => {
                                    let n = b.len();
                                    drop(b);
                                    self.raise(
                                        ip,
                                        ERR_INDEX,
                                        format!("index {} out of range [{}]", idx, n),
                                        &mut ip,
                                    )?;
                                }
                            }
                        }
                        other => {
                            self.raise(
                                ip,
                                ERR_VALUE,
                                format!("expected buf, got {}", other.type_name()),
                                &mut ip,
                            )?;
                        }
                    }
                }
                Op::IdxSetArr => {
                    let val = self.pop_a()?;
                    let idx = self.pop_i()?;
                    let cont = self.pop_a()?;
                    match cont {
                        Value::Arr(a) => {
                            let mut a = a.lock().unwrap();
                            match usize::try_from(idx).ok().filter(|i| *i < a.len()) {
                                Some(i) => {
                                    a[i] = val;
                                    ip += 1;
                                }
                                None => {
                                    let n = a.len();
                                    drop(a);
                                    self.raise(
                                        ip,
                                        ERR_INDEX,
                                        format!("index {} out of range [{}]", idx, n),
                                        &mut ip,
                                    )?;
                                }
                            }
                        }
                        other => {
                            self.raise(
                                ip,
                                ERR_VALUE,
                                format!("expected arr, got {}", other.type_name()),
                                &mut ip,
                            )?;
                        }
                    }
                }
                Op::IdxSetMap => {
                    let val = self.pop_a()?;
                    let key = self.pop_s()?;
                    let cont = self.pop_a()?;
                    match cont {
                        Value::Map(m) => {
                            m.lock().unwrap().insert(key, val);
                            ip += 1;
                        }
                        other => {
                            self.raise(
                                ip,
                                ERR_VALUE,
                                format!("expected map, got {}", other.type_name()),
                                &mut ip,
                            )?;
                        }
                    }
                }
                Op::IdxSetFld => {
                    let val = self.pop_a()?;
                    let cont = self.pop_a()?;
                    match cont {
                        Value::Struct(s) => {
                            s.lock().unwrap()[imm as usize] = val;
                            ip += 1;
                        }
                        other => {
                            self.raise(
                                ip,
                                ERR_VALUE,
                                format!("expected struct, got {}", other.type_name()),
                                &mut ip,
                            )?;
                        }
                    }
                }
                Op::IdxSetBuf => {
                    let val = self.pop_i()?;
                    let idx = self.pop_i()?;
                    let cont = self.pop_a()?;
                    if !(0..=255).contains(&val) {
                        self.raise(ip, ERR_VALUE, format!("byte value {} out of range", val), &mut ip)?;
                        continue;
                    }
                    match cont {
                        Value::Buf(b) => {
                            let mut b = b.lock().unwrap();
                            match usize::try_from(idx).ok().filter(|i| *i < b.len()) {
                                Some(i) => {
                                    b[i] = val as u8;
                                    ip += 1;
                                }
                                None => {
                                    let n = b.len();
                                    drop(b);
                                    self.raise(
                                        ip,
                                        ERR_INDEX,
                                        format!("index {} out of range [{}]", idx, n),
                                        &mut ip,
                                    )?;
                                }
                            }
                        }
                        other => {
                            self.raise(
                                ip,
                                ERR_VALUE,
                                format!("expected buf, got {}", other.type_name()),
                                &mut ip,
                            )?;
                        }
                    }
                }
                Op::BoxInt => {
                    let v = self.pop_i()?;
                    self.anys.push(Value::Int(v));
                    ip += 1;
                }
                Op::BoxBool => {
                    let v = self.pop_i()?;
                    self.anys.push(Value::Bool(v != 0));
                    ip += 1;
                }
                Op::BoxChar => {
                    let v = self.pop_i()?;
                    let c = u32::try_from(v).ok().and_then(char::from_u32).unwrap_or('\0');
                    self.anys.push(Value::Char(c));
                    ip += 1;
                }
                Op::BoxFloat => {
                    let v = self.pop_f()?;
                    self.anys.push(Value::Float(v));
                    ip += 1;
                }
                Op::BoxStr => {
                    let v = self.pop_s()?;
                    self.anys.push(Value::Str(v));
                    ip += 1;
                }
                Op::UnboxInt => {
                    let v = self.pop_a()?;
                    match v {
                        Value::Int(i) => {
                            self.ints.push(i);
                            ip += 1;
                        }
                        Value::Bool(b) => {
                            self.ints.push(b as i64);
                            ip += 1;
                        }
                        Value::Char(c) => {
                            self.ints.push(c as i64);
                            ip += 1;
                        }
                        other => {
                            self.raise(
                                ip,
                                ERR_VALUE,
                                format!("expected int value, got {}", other.type_name()),
                                &mut ip,
                            )?;
                        }
                    }
                }
                Op::UnboxFloat => {
                    let v = self.pop_a()?;
                    match v {
                        Value::Float(f) => {
                            self.floats.push(f);
                            ip += 1;
                        }
                        other => {
                            self.raise(
                                ip,
                                ERR_VALUE,
                                format!("expected float value, got {}", other.type_name()),
                                &mut ip,
                            )?;
                        }
                    }
                }
                Op::UnboxStr => {
                    let v = self.pop_a()?;
                    match v {
                        Value::Str(s) => {
                            self.strs.push(s);
                            ip += 1;
                        }
                        other => {
                            self.raise(
                                ip,
                                ERR_VALUE,
                                format!("expected str value, got {}", other.type_name()),
                                &mut ip,
                            )?;
                        }
                    }
                }
                Op::AddI | Op::SubI | Op::MulI | Op::BitAnd | Op::BitOr | Op::BitXor
                | Op::EqI | Op::LtI | Op::GtI => {
                    let b = self.pop_i()?;
                    let a = self.pop_i()?;
                    let r = match op {
                        Op::AddI => a.wrapping_add(b),
                        Op::SubI => a.wrapping_sub(b),
                        Op::MulI => a.wrapping_mul(b),
                        Op::BitAnd => a & b,
                        Op::BitOr => a | b,
                        Op::BitXor => a ^ b,
                        Op::EqI => (a == b) as i64,
                        Op::LtI => (a < b) as i64,
                        _ => (a > b) as i64,
                    };
                    self.ints.push(r);
                    ip += 1;
                }
                Op::DivI | Op::ModI => {
                    let b = self.pop_i()?;
                    let a = self.pop_i()?;
                    if b == 0 {
                        self.raise(ip, ERR_DIVZERO, "divided by zero".to_string(), &mut ip)?;
                        continue;
                    }
                    let r = if op == Op::DivI { a.wrapping_div(b) } else { a.wrapping_rem(b) };
                    self.ints.push(r);
                    ip += 1;
                }
                Op::Shl | Op::Shr => {
                    let b = self.pop_i()?;
                    let a = self.pop_i()?;
                    if b < 0 {
                        self.raise(ip, ERR_SHIFT, format!("negative shift count {}", b), &mut ip)?;
                        continue;
                    }
                    let r = if b >= 64 {
                        if op == Op::Shl { 0 } else { a >> 63 }
                    } else if op == Op::Shl {
                        a << b
                    } else {
                        a >> b
                    };
                    self.ints.push(r);
                    ip += 1;
                }
                Op::NegI => {
                    let a = self.pop_i()?;
                    self.ints.push(a.wrapping_neg());
                    ip += 1;
                }
                Op::BitNot => {
                    let a = self.pop_i()?;
                    self.ints.push(!a);
                    ip += 1;
                }
                Op::NotB => {
                    let a = self.pop_i()?;
                    self.ints.push((a == 0) as i64);
                    ip += 1;
                }
                Op::AddF | Op::SubF | Op::MulF | Op::DivF => {
                    let b = self.pop_f()?;
                    let a = self.pop_f()?;
                    let r = match op {
                        Op::AddF => a + b,
                        Op::SubF => a - b,
                        Op::MulF => a * b,
                        _ => a / b,
                    };
                    self.floats.push(r);
                    ip += 1;
                }
                Op::NegF => {
                    let a = self.pop_f()?;
                    self.floats.push(-a);
                    ip += 1;
                }
                Op::EqF | Op::LtF | Op::GtF => {
                    let b = self.pop_f()?;
                    let a = self.pop_f()?;
                    let r = match op {
                        Op::EqF => a == b,
                        Op::LtF => a < b,
                        _ => a > b,
                    };
                    self.ints.push(r as i64);
                    ip += 1;
                }
                Op::ConcatS => {
                    let b = self.pop_s()?;
                    let mut a = self.pop_s()?;
                    a.push_str(&b);
                    self.strs.push(a);
                    ip += 1;
                }
                Op::EqS | Op::LtS | Op::GtS => {
                    let b = self.pop_s()?;
                    let a = self.pop_s()?;
                    let r = match op {
                        Op::EqS => a == b,
                        Op::LtS => a < b,
                        _ => a > b,
                    };
                    self.ints.push(r as i64);
                    ip += 1;
                }
                Op::Jmp => {
                    let rel = imm as i16 as i64;
                    if rel < 0 && !self.check_thread() {
                        self.closed = true;
                        return Ok(Value::Int(0));
                    }
                    ip = (ip as i64 + 1 + rel) as usize;
                }
                Op::Jz => {
                    let cond = self.pop_i()?;
                    if cond == 0 {
                        ip = (ip as i64 + 1 + imm as i16 as i64) as usize;
                    } else {
                        ip += 1;
                    }
                }
                Op::Jnz => {
                    let cond = self.pop_i()?;
                    if cond != 0 {
                        ip = (ip as i64 + 1 + imm as i16 as i64) as usize;
                    } else {
                        ip += 1;
                    }
                }
                Op::JzKeep => {
                    let top = *self
                        .ints
                        .last()
                        .ok_or_else(|| RuntimeError::new(ERR_GENERIC, "int stack underflow"))?;
                    if top == 0 {
                        ip = (ip as i64 + 1 + imm as i16 as i64) as usize;
                    } else {
                        self.ints.pop();
                        ip += 1;
                    }
                }
                Op::JnzKeep => {
                    let top = *self
                        .ints
                        .last()
                        .ok_or_else(|| RuntimeError::new(ERR_GENERIC, "int stack underflow"))?;
                    if top != 0 {
                        ip = (ip as i64 + 1 + imm as i16 as i64) as usize;
                    } else {
                        self.ints.pop();
                        ip += 1;
                    }
                }
                Op::CallFunc => {
                    if !self.check_thread() {
                        self.closed = true;
                        return Ok(Value::Int(0));
                    }
                    if self.depth >= self.shared.settings.depth_limit {
                        self.raise(
                            ip,
                            ERR_DEPTH,
                            format!("maximum call depth {} reached", self.shared.settings.depth_limit),
                            &mut ip,
                        )?;
                        continue;
                    }
                    let obj = code[ip + 1];
                    let Some(&target) = prog.funcs.get(&obj) else {
                        self.raise(ip, ERR_GENERIC, format!("unlinked function {}", obj), &mut ip)?;
                        continue;
                    };
                    self.frames.push(Frame {
                        ib: self.ints.len(),
                        fb: self.floats.len(),
                        sb: self.strs.len(),
                        ab: self.anys.len(),
                        ret: ip + 2,
                        func: true,
                        is_loop: false,
                        cycle: 0,
                        const_id: None,
                    });
                    self.depth += 1;
                    ip = target as usize;
                }
                Op::CallEmbed => {
                    let argc = imm as usize;
                    let idx = code[ip + 1] as usize;
                    let table = self.table;
                    let ef = &table[idx];
                    match self.call_embed(ef, argc) {
                        Ok(()) => ip += 2,
                        Err(e) => {
                            let id = if e.msg.starts_with("sandbox: ") { ERR_SANDBOX } else { e.id };
                            self.raise(ip, id, e.msg, &mut ip)?;
                        }
                    }
                }
                Op::Ret => {
                    let result = self.take_result(imm)?;
                    // unwind through transparent block scopes to the
                    // nearest function frame
                    while !self.frames.last().map_or(true, |f| f.func) {
                        self.frames.pop();
                    }
                    let fr = self
                        .frames
                        .pop()
                        .ok_or_else(|| RuntimeError::new(ERR_GENERIC, "return with no frame"))?;
                    self.ints.truncate(fr.ib);
                    self.floats.truncate(fr.fb);
                    self.strs.truncate(fr.sb);
                    self.anys.truncate(fr.ab);
                    self.depth -= 1;
                    if let Some(id) = fr.const_id {
                        let boxed = boxed_result(&result);
                        self.shared.consts.write().unwrap().insert(id, boxed);
                    }
                    if fr.ret == ROOT_RET {
                        return Ok(boxed_result(&result));
                    }
                    self.push_result(result);
                    ip = fr.ret;
                }
                Op::Entry => {
                    let pars = code[ip + 1];
                    let extra = code[ip + 2];
                    let (pi, pf, ps, pa) = unpack_counts(pars);
                    let fr = self.frames.last_mut().expect("entry without frame");
                    fr.ib -= pi;
                    fr.fb -= pf;
                    fr.sb -= ps;
                    fr.ab -= pa;
                    self.push_zeros(extra);
                    ip += 3;
                }
                Op::BlkOpen => {
                    let counts = code[ip + 1];
                    self.frames.push(Frame {
                        ib: self.ints.len(),
                        fb: self.floats.len(),
                        sb: self.strs.len(),
                        ab: self.anys.len(),
                        ret: 0,
                        func: false,
                        is_loop: imm == 1,
                        cycle: self.shared.settings.cycle_limit,
                        const_id: None,
                    });
                    self.push_zeros(counts);
                    ip += 2;
                }
                Op::BlkClose => {
                    let fr = self
                        .frames
                        .pop()
                        .ok_or_else(|| RuntimeError::new(ERR_GENERIC, "block close with no frame"))?;
                    self.ints.truncate(fr.ib);
                    self.floats.truncate(fr.fb);
                    self.strs.truncate(fr.sb);
                    self.anys.truncate(fr.ab);
                    ip += 1;
                }
                Op::PopBlk => {
                    for _ in 0..imm {
                        let fr = self
                            .frames
                            .pop()
                            .ok_or_else(|| RuntimeError::new(ERR_GENERIC, "unwind with no frame"))?;
                        self.ints.truncate(fr.ib);
                        self.floats.truncate(fr.fb);
                        self.strs.truncate(fr.sb);
                        self.anys.truncate(fr.ab);
                    }
                    ip += 1;
                }
                Op::Cycle => {
                    if !self.check_thread() {
                        self.closed = true;
                        return Ok(Value::Int(0));
                    }
                    let limit = self.shared.settings.cycle_limit;
                    if !self.frames.last().map_or(false, |f| f.is_loop) {
                        self.raise(ip, ERR_GENERIC, "cycle outside loop frame".to_string(), &mut ip)?;
                        continue;
                    }
                    let exhausted = {
                        let fr = self.frames.last_mut().expect("cycle without frame");
                        fr.cycle = fr.cycle.saturating_sub(1);
                        fr.cycle == 0
                    };
                    if exhausted {
                        self.raise(
                            ip,
                            ERR_CYCLE,
                            format!("maximum cycle count {} reached", limit),
                            &mut ip,
                        )?;
                        continue;
                    }
                    ip += 1;
                }
                Op::ConstGet => {
                    let id = code[ip + 1];
                    let cached = self.shared.consts.read().unwrap().get(&id).cloned();
                    match cached {
                        Some(v) => {
                            match self.push_boxed(imm, v) {
                                Ok(()) => ip += 2,
                                Err(e) => {
                                    self.raise(ip, e.id, e.msg, &mut ip)?;
                                }
                            }
                        }
                        None => {
                            let Some(&target) = prog.funcs.get(&id) else {
                                self.raise(ip, ERR_GENERIC, format!("unlinked constant {}", id), &mut ip)?;
                                continue;
                            };
                            self.frames.push(Frame {
                                ib: self.ints.len(),
                                fb: self.floats.len(),
                                sb: self.strs.len(),
                                ab: self.anys.len(),
                                ret: ip + 2,
                                func: true,
                                is_loop: false,
                                cycle: 0,
                                const_id: Some(id),
                            });
                            self.depth += 1;
                            ip = target as usize;
                        }
                    }
                }
                Op::Spawn => {
                    let obj = code[ip + 1];
                    let Some(&target) = prog.funcs.get(&obj) else {
                        self.raise(ip, ERR_GENERIC, format!("unlinked function {}", obj), &mut ip)?;
                        continue;
                    };
                    let (id, slot) = self.shared.threads.register();
                    let prog2 = self.prog.clone();
                    let shared2 = self.shared.clone();
                    let table2 = self.table;
                    let slot2 = slot.clone();
                    std::thread::spawn(move || {
                        slot2.set_status(ThreadStatus::Running);
                        let mut rt = Runtime::new(prog2, table2, shared2, Some(slot2.clone()));
                        match rt.exec(target as usize) {
                            Ok(_) => {
                                let st = if rt.closed { ThreadStatus::Closed } else { ThreadStatus::Finished };
                                slot2.set_status(st);
                            }
                            Err(e) => {
                                *slot2.error.lock().unwrap() = Some(e);
                                slot2.set_status(ThreadStatus::Errored);
                            }
                        }
                    });
                    self.ints.push(id);
                    ip += 2;
                }
                Op::PopI => {
                    self.pop_i()?;
                    ip += 1;
                }
                Op::PopF => {
                    self.pop_f()?;
                    ip += 1;
                }
                Op::PopS => {
                    self.pop_s()?;
                    ip += 1;
                }
                Op::PopA => {
                    self.pop_a()?;
                    ip += 1;
                }
                Op::InitArr => {
                    let n = imm as usize;
                    let items = self.anys.split_off(self.anys.len() - n);
                    self.anys.push(Value::arr(items));
                    ip += 1;
                }
                Op::InitStruct => {
                    let n = imm as usize;
                    let items = self.anys.split_off(self.anys.len() - n);
                    self.anys.push(Value::strukt(items));
                    ip += 1;
                }
                Op::InitMap => {
                    let n = imm as usize;
                    let vals = self.anys.split_off(self.anys.len() - n);
                    let keys = self.strs.split_off(self.strs.len() - n);
                    let map: HashMap<String, Value> = keys.into_iter().zip(vals).collect();
                    self.anys.push(Value::map(map));
                    ip += 1;
                }
                Op::InitBuf => {
                    let n = imm as usize;
                    let items = self.ints.split_off(self.ints.len() - n);
                    match items.iter().find(|v| !(0..=255).contains(*v)) {
                        Some(bad) => {
                            let bad = *bad;
                            self.raise(ip, ERR_VALUE, format!("byte value {} out of range", bad), &mut ip)?;
                        }
                        None => {
                            self.anys.push(Value::buf(items.into_iter().map(|v| v as u8).collect()));
                            ip += 1;
                        }
                    }
                }
                Op::InitSet => {
                    let n = imm as usize;
                    let items = self.ints.split_off(self.ints.len() - n);
                    let set: HashSet<i64> = items.into_iter().collect();
                    self.anys.push(Value::set(set));
                    ip += 1;
                }
                Op::IterInit => {
                    let cont = self.pop_a()?;
                    let snapshot = match cont {
                        Value::Arr(a) => a.lock().unwrap().clone(),
                        Value::Map(m) => {
                            let m = m.lock().unwrap();
                            let mut keys: Vec<String> = m.keys().cloned().collect();
                            keys.sort();
                            keys.into_iter().map(Value::Str).collect()
                        }
                        Value::Set(s) => {
                            let mut members: Vec<i64> = s.lock().unwrap().iter().copied().collect();
                            members.sort();
                            members.into_iter().map(Value::Int).collect()
                        }
                        Value::Buf(b) => b.lock().unwrap().iter().map(|v| Value::Int(*v as i64)).collect(),
                        Value::Str(s) => s.chars().map(Value::Char).collect(),
                        other => {
                            self.raise(
                                ip,
                                ERR_VALUE,
                                format!("cannot iterate over {}", other.type_name()),
                                &mut ip,
                            )?;
                            continue;
                        }
                    };
                    self.anys.push(Value::arr(snapshot));
                    ip += 1;
                }
                Op::TryPush => {
                    let rel = imm as i16 as i64;
                    self.tries.push(TryEntry {
                        frames: self.frames.len(),
                        ib: self.ints.len(),
                        fb: self.floats.len(),
                        sb: self.strs.len(),
                        ab: self.anys.len(),
                        catch_ip: (ip as i64 + 1 + rel) as usize,
                    });
                    ip += 1;
                }
                Op::TryPop => {
                    self.tries.pop();
                    ip += 1;
                }
                Op::PushErr => {
                    self.strs.push(std::mem::take(&mut self.err_msg));
                    ip += 1;
                }
                Op::Halt => {
                    return Ok(Value::Int(0));
                }
            }
        }
    }

    fn take_result(&mut self, kind: u16) -> RtResult<RetSlot> {
        Ok(match kind {
            RES_NONE => RetSlot::None,
            RES_INT => RetSlot::Int(self.pop_i()?),
            RES_BOOL => RetSlot::Bool(self.pop_i()? != 0),
            RES_CHAR => {
                let v = self.pop_i()?;
                RetSlot::Char(u32::try_from(v).ok().and_then(char::from_u32).unwrap_or('\0'))
            }
            RES_FLOAT => RetSlot::Float(self.pop_f()?),
            RES_STR => RetSlot::Str(self.pop_s()?),
            _ => RetSlot::Any(self.pop_a()?),
        })
    }

    fn push_result(&mut self, r: RetSlot) {
        match r {
            RetSlot::None => {}
            RetSlot::Int(v) => self.ints.push(v),
            RetSlot::Bool(v) => self.ints.push(v as i64),
            RetSlot::Char(v) => self.ints.push(v as i64),
            RetSlot::Float(v) => self.floats.push(v),
            RetSlot::Str(v) => self.strs.push(v),
            RetSlot::Any(v) => self.anys.push(v),
        }
    }

    fn push_boxed(&mut self, kind: u16, v: Value) -> RtResult<()> {
        match kind {
            RES_NONE => {}
            RES_INT | RES_BOOL | RES_CHAR => match v {
                Value::Int(i) => self.ints.push(i),
                Value::Bool(b) => self.ints.push(b as i64),
                Value::Char(c) => self.ints.push(c as i64),
                other => {
                    return Err(RuntimeError::new(
                        ERR_VALUE,
                        format!("expected int value, got {}", other.type_name()),
                    ))
                }
            },
            RES_FLOAT => match v {
                Value::Float(f) => self.floats.push(f),
                other => {
                    return Err(RuntimeError::new(
                        ERR_VALUE,
                        format!("expected float value, got {}", other.type_name()),
                    ))
                }
            },
            RES_STR => match v {
                Value::Str(s) => self.strs.push(s),
                other => {
                    return Err(RuntimeError::new(
                        ERR_VALUE,
                        format!("expected str value, got {}", other.type_name()),
                    ))
                }
            },
            _ => self.anys.push(v),
        }
        Ok(())
    }

    /// Generic argument marshalling for an embedded call: pop per the
    /// registered parameter tags, call, push the result per its tag.
    fn call_embed(&mut self, ef: &EmbedFn, argc: usize) -> RtResult<()> {
        let fixed = ef.pars.len();
        let mut args = vec![Value::Int(0); argc];
        for i in (0..argc).rev() {
            let tag = if i < fixed { ef.pars[i] } else { TypeTag::Any };
            args[i] = match tag {
                TypeTag::Int => Value::Int(self.pop_i()?),
                TypeTag::Bool => Value::Bool(self.pop_i()? != 0),
                TypeTag::Char => {
                    let v = self.pop_i()?;
                    Value::Char(u32::try_from(v).ok().and_then(char::from_u32).unwrap_or('\0'))
                }
                TypeTag::Float => Value::Float(self.pop_f()?),
                TypeTag::Str => Value::Str(self.pop_s()?),
                _ => self.pop_a()?,
            };
        }
        let result = match ef.dispatch {
            EmbedDispatch::Plain(f) => f(&args),
            EmbedDispatch::Ctx(f) => f(&self.shared, &args),
            EmbedDispatch::Op(_) => {
                return Err(RuntimeError::new(ERR_GENERIC, "fast-path op dispatched generically"))
            }
        };
        let value = result.map_err(|e| RuntimeError::new(ERR_EMBED, e.0))?;
        match ef.ret {
            TypeTag::None => {}
            TypeTag::Int => match value {
                Value::Int(i) => self.ints.push(i),
                other => {
                    return Err(RuntimeError::new(
                        ERR_VALUE,
                        format!("{} returned {}, expected int", ef.name, other.type_name()),
                    ))
                }
            },
            TypeTag::Bool => match value {
                Value::Bool(b) => self.ints.push(b as i64),
                Value::Int(i) => self.ints.push(i),
                other => {
                    return Err(RuntimeError::new(
                        ERR_VALUE,
                        format!("{} returned {}, expected bool", ef.name, other.type_name()),
                    ))
                }
            },
            TypeTag::Char => match value {
                Value::Char(c) => self.ints.push(c as i64),
                other => {
                    return Err(RuntimeError::new(
                        ERR_VALUE,
                        format!("{} returned {}, expected char", ef.name, other.type_name()),
                    ))
                }
            },
            TypeTag::Float => match value {
                Value::Float(f) => self.floats.push(f),
                other => {
                    return Err(RuntimeError::new(
                        ERR_VALUE,
                        format!("{} returned {}, expected float", ef.name, other.type_name()),
                    ))
                }
            },
            TypeTag::Str => match value {
                Value::Str(s) => self.strs.push(s),
                other => {
                    return Err(RuntimeError::new(
                        ERR_VALUE,
                        format!("{} returned {}, expected str", ef.name, other.type_name()),
                    ))
                }
            },
            _ => self.anys.push(value),
        }
        Ok(())
    }
}

enum RetSlot {
    None,
    Int(i64),
    Bool(bool),
    Char(char),
    Float(f64),
    Str(String),
    Any(Value),
}

fn boxed_result(r: &RetSlot) -> Value {
    match r {
        RetSlot::None => Value::Int(0),
        RetSlot::Int(v) => Value::Int(*v),
        RetSlot::Bool(v) => Value::Bool(*v),
        RetSlot::Char(v) => Value::Char(*v),
        RetSlot::Float(v) => Value::Float(*v),
        RetSlot::Str(v) => Value::Str(v.clone()),
        RetSlot::Any(v) => v.clone(),
    }
}
