//! The embedded-function catalogue: operator table entries carrying
//! fast-path opcodes, plus the leaf host procedures the VM dispatches
//! generically. The compiler consults this table for overload
//! resolution; the VM consults it for marshalling.
//!
//! Failures cross the boundary as `SorrelError`; messages starting with
//! "sandbox: " are raised with the sandbox error id, everything else
//! with the embedded-failure id.
use std::collections::HashSet;
use std::sync::atomic::Ordering;

use once_cell::sync::Lazy;
use sorrel_bytecode::{EmbedDispatch, EmbedFn, Op, RtShared, TypeTag, Value};
use sorrel_common::{Result, SorrelError};

const TI: TypeTag = TypeTag::Int;
const TF: TypeTag = TypeTag::Float;
const TB: TypeTag = TypeTag::Bool;
const TC: TypeTag = TypeTag::Char;
const TS: TypeTag = TypeTag::Str;
const TARR: TypeTag = TypeTag::Arr;
const TMAP: TypeTag = TypeTag::Map;
const TBUF: TypeTag = TypeTag::Buf;
const TSET: TypeTag = TypeTag::Set;
const TSTRUCT: TypeTag = TypeTag::Struct;
const TA: TypeTag = TypeTag::Any;
const TN: TypeTag = TypeTag::None;

fn op2(name: &'static str, pars: &'static [TypeTag], ret: TypeTag, op: Op) -> EmbedFn {
    EmbedFn {
        name,
        pars,
        ret,
        dispatch: EmbedDispatch::Op(op),
        variadic: false,
        var_tag: TN,
        needs_rt: false,
        can_fail: false,
    }
}

fn plain(
    name: &'static str,
    pars: &'static [TypeTag],
    ret: TypeTag,
    call: fn(&[Value]) -> Result<Value>,
    can_fail: bool,
) -> EmbedFn {
    EmbedFn {
        name,
        pars,
        ret,
        dispatch: EmbedDispatch::Plain(call),
        variadic: false,
        var_tag: TN,
        needs_rt: false,
        can_fail,
    }
}

fn ctxfn(
    name: &'static str,
    pars: &'static [TypeTag],
    ret: TypeTag,
    call: fn(&RtShared, &[Value]) -> Result<Value>,
    can_fail: bool,
) -> EmbedFn {
    EmbedFn {
        name,
        pars,
        ret,
        dispatch: EmbedDispatch::Ctx(call),
        variadic: false,
        var_tag: TN,
        needs_rt: true,
        can_fail,
    }
}

fn variadic(
    name: &'static str,
    pars: &'static [TypeTag],
    var_tag: TypeTag,
    ret: TypeTag,
    call: fn(&[Value]) -> Result<Value>,
) -> EmbedFn {
    EmbedFn {
        name,
        pars,
        ret,
        dispatch: EmbedDispatch::Plain(call),
        variadic: true,
        var_tag,
        needs_rt: false,
        can_fail: false,
    }
}

fn variadic_ctx(
    name: &'static str,
    pars: &'static [TypeTag],
    var_tag: TypeTag,
    ret: TypeTag,
    call: fn(&RtShared, &[Value]) -> Result<Value>,
    can_fail: bool,
) -> EmbedFn {
    EmbedFn {
        name,
        pars,
        ret,
        dispatch: EmbedDispatch::Ctx(call),
        variadic: true,
        var_tag,
        needs_rt: true,
        can_fail,
    }
}

/// The global registration table, built once.
pub fn registry() -> &'static [EmbedFn] {
    static TABLE: Lazy<Vec<EmbedFn>> = Lazy::new(build);
    &TABLE
}

fn build() -> Vec<EmbedFn> {
    vec![
        // int operators
        op2("+", &[TI, TI], TI, Op::AddI),
        op2("-", &[TI, TI], TI, Op::SubI),
        op2("*", &[TI, TI], TI, Op::MulI),
        op2("/", &[TI, TI], TI, Op::DivI),
        op2("%", &[TI, TI], TI, Op::ModI),
        op2("<<", &[TI, TI], TI, Op::Shl),
        op2(">>", &[TI, TI], TI, Op::Shr),
        op2("&", &[TI, TI], TI, Op::BitAnd),
        op2("|", &[TI, TI], TI, Op::BitOr),
        op2("^", &[TI, TI], TI, Op::BitXor),
        op2("==", &[TI, TI], TB, Op::EqI),
        op2("<", &[TI, TI], TB, Op::LtI),
        op2(">", &[TI, TI], TB, Op::GtI),
        op2("-", &[TI], TI, Op::NegI),
        op2("~", &[TI], TI, Op::BitNot),
        // bool / char comparisons ride the int stack
        op2("!", &[TB], TB, Op::NotB),
        op2("==", &[TB, TB], TB, Op::EqI),
        op2("==", &[TC, TC], TB, Op::EqI),
        op2("<", &[TC, TC], TB, Op::LtI),
        op2(">", &[TC, TC], TB, Op::GtI),
        // float operators
        op2("+", &[TF, TF], TF, Op::AddF),
        op2("-", &[TF, TF], TF, Op::SubF),
        op2("*", &[TF, TF], TF, Op::MulF),
        op2("/", &[TF, TF], TF, Op::DivF),
        op2("==", &[TF, TF], TB, Op::EqF),
        op2("<", &[TF, TF], TB, Op::LtF),
        op2(">", &[TF, TF], TB, Op::GtF),
        op2("-", &[TF], TF, Op::NegF),
        // string operators
        op2("+", &[TS, TS], TS, Op::ConcatS),
        op2("==", &[TS, TS], TB, Op::EqS),
        op2("<", &[TS, TS], TB, Op::LtS),
        op2(">", &[TS, TS], TB, Op::GtS),
        // conversions
        plain("str", &[TI], TS, fn_str, false),
        plain("str", &[TF], TS, fn_str, false),
        plain("str", &[TB], TS, fn_str, false),
        plain("str", &[TC], TS, fn_str, false),
        plain("str", &[TS], TS, fn_str, false),
        plain("str", &[TARR], TS, fn_str, false),
        plain("str", &[TMAP], TS, fn_str, false),
        plain("str", &[TBUF], TS, fn_str, false),
        plain("str", &[TSET], TS, fn_str, false),
        plain("str", &[TSTRUCT], TS, fn_str, false),
        plain("int", &[TS], TI, fn_int_of_str, true),
        plain("int", &[TF], TI, fn_int_of_float, false),
        plain("int", &[TC], TI, fn_int_of_char, false),
        plain("int", &[TB], TI, fn_int_of_bool, false),
        plain("float", &[TI], TF, fn_float_of_int, false),
        plain("float", &[TS], TF, fn_float_of_str, true),
        // console
        variadic("print", &[], TA, TN, fn_print),
        variadic("println", &[], TA, TN, fn_println),
        // inspection / strings / collections
        plain("len", &[TS], TI, fn_len, false),
        plain("len", &[TARR], TI, fn_len, false),
        plain("len", &[TMAP], TI, fn_len, false),
        plain("len", &[TBUF], TI, fn_len, false),
        plain("len", &[TSET], TI, fn_len, false),
        plain("upper", &[TS], TS, fn_upper, false),
        plain("lower", &[TS], TS, fn_lower, false),
        // any-typed trailing values go through the variadic tier
        variadic("append", &[TARR], TA, TN, fn_append),
        plain("keys", &[TMAP], TARR, fn_keys, false),
        plain("has", &[TSET, TI], TB, fn_has, false),
        // threads and time
        plain("sleep", &[TI], TN, fn_sleep, false),
        ctxfn("wait", &[TI], TN, fn_wait, true),
        ctxfn("pause", &[TI], TN, fn_pause, true),
        ctxfn("resume", &[TI], TN, fn_resume, true),
        ctxfn("close", &[TI], TN, fn_close, true),
        ctxfn("status", &[TI], TI, fn_status, true),
        // shared context map
        variadic_ctx("ctxset", &[TS], TA, TN, fn_ctxset, true),
        ctxfn("ctxget", &[TS], TA, fn_ctxget, true),
        ctxfn("ctxincr", &[TS], TI, fn_ctxincr, true),
        // sandboxed host access
        ctxfn("readfile", &[TS], TS, fn_readfile, true),
        ctxfn("writefile", &[TS, TS], TN, fn_writefile, true),
        ctxfn("shell", &[TS], TI, fn_shell, true),
        ctxfn("setenv", &[TS, TS], TN, fn_setenv, true),
    ]
}

// --- argument helpers ---

fn want_int(v: &Value) -> Result<i64> {
    match v {
        Value::Int(i) => Ok(*i),
        Value::Bool(b) => Ok(*b as i64),
        Value::Char(c) => Ok(*c as i64),
        other => Err(SorrelError(format!("expected int, got {}", other.type_name()))),
    }
}

fn want_str(v: &Value) -> Result<&str> {
    match v {
        Value::Str(s) => Ok(s),
        other => Err(SorrelError(format!("expected str, got {}", other.type_name()))),
    }
}

// --- conversions ---

fn fn_str(args: &[Value]) -> Result<Value> {
    Ok(Value::Str(args[0].to_string()))
}

fn fn_int_of_str(args: &[Value]) -> Result<Value> {
    let s = want_str(&args[0])?;
    s.trim()
        .parse::<i64>()
        .map(Value::Int)
        .map_err(|_| SorrelError(format!("cannot convert '{}' to int", s)))
}

fn fn_int_of_float(args: &[Value]) -> Result<Value> {
    match &args[0] {
        Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
        other => Err(SorrelError(format!("expected float, got {}", other.type_name()))),
    }
}

fn fn_int_of_char(args: &[Value]) -> Result<Value> {
    Ok(Value::Int(want_int(&args[0])?))
}

fn fn_int_of_bool(args: &[Value]) -> Result<Value> {
    Ok(Value::Int(want_int(&args[0])?))
}

fn fn_float_of_int(args: &[Value]) -> Result<Value> {
    Ok(Value::Float(want_int(&args[0])? as f64))
}

fn fn_float_of_str(args: &[Value]) -> Result<Value> {
    let s = want_str(&args[0])?;
    s.trim()
        .parse::<f64>()
        .map(Value::Float)
        .map_err(|_| SorrelError(format!("cannot convert '{}' to float", s)))
}

// --- console ---

fn joined(args: &[Value]) -> String {
    let parts: Vec<String> = args.iter().map(|v| v.to_string()).collect();
    parts.join(" ")
}

fn fn_print(args: &[Value]) -> Result<Value> {
    print!("{}", joined(args));
    Ok(Value::Int(0))
}

fn fn_println(args: &[Value]) -> Result<Value> {
    println!("{}", joined(args));
    Ok(Value::Int(0))
}

// --- strings / collections ---

fn fn_len(args: &[Value]) -> Result<Value> {
    let n = match &args[0] {
        Value::Str(s) => s.chars().count(),
        Value::Arr(a) => a.lock().unwrap().len(),
        Value::Map(m) => m.lock().unwrap().len(),
        Value::Buf(b) => b.lock().unwrap().len(),
        Value::Set(s) => s.lock().unwrap().len(),
        other => return Err(SorrelError(format!("len: unsupported type {}", other.type_name()))),
    };
    Ok(Value::Int(n as i64))
}

fn fn_upper(args: &[Value]) -> Result<Value> {
    Ok(Value::Str(want_str(&args[0])?.to_uppercase()))
}

fn fn_lower(args: &[Value]) -> Result<Value> {
    Ok(Value::Str(want_str(&args[0])?.to_lowercase()))
}

fn fn_append(args: &[Value]) -> Result<Value> {
    match &args[0] {
        Value::Arr(a) => {
            a.lock().unwrap().extend(args[1..].iter().cloned());
            Ok(Value::Int(0))
        }
        other => Err(SorrelError(format!("append: expected arr, got {}", other.type_name()))),
    }
}

fn fn_keys(args: &[Value]) -> Result<Value> {
    match &args[0] {
        Value::Map(m) => {
            let m = m.lock().unwrap();
            let mut keys: Vec<String> = m.keys().cloned().collect();
            keys.sort();
            Ok(Value::arr(keys.into_iter().map(Value::Str).collect()))
        }
        other => Err(SorrelError(format!("keys: expected map, got {}", other.type_name()))),
    }
}

fn fn_has(args: &[Value]) -> Result<Value> {
    match &args[0] {
        Value::Set(s) => Ok(Value::Bool(s.lock().unwrap().contains(&want_int(&args[1])?))),
        other => Err(SorrelError(format!("has: expected set, got {}", other.type_name()))),
    }
}

// --- threads and time ---

fn fn_sleep(args: &[Value]) -> Result<Value> {
    let ms = want_int(&args[0])?.max(0) as u64;
    std::thread::sleep(std::time::Duration::from_millis(ms));
    Ok(Value::Int(0))
}

fn thread_slot(rt: &RtShared, v: &Value) -> Result<std::sync::Arc<sorrel_bytecode::ThreadSlot>> {
    rt.threads.get(want_int(v)?).map_err(|e| SorrelError(e.msg))
}

fn fn_wait(rt: &RtShared, args: &[Value]) -> Result<Value> {
    thread_slot(rt, &args[0])?.wait_done();
    Ok(Value::Int(0))
}

fn fn_pause(rt: &RtShared, args: &[Value]) -> Result<Value> {
    thread_slot(rt, &args[0])?.pause.store(true, Ordering::Release);
    Ok(Value::Int(0))
}

fn fn_resume(rt: &RtShared, args: &[Value]) -> Result<Value> {
    let slot = thread_slot(rt, &args[0])?;
    slot.pause.store(false, Ordering::Release);
    slot.changed.notify_all();
    Ok(Value::Int(0))
}

fn fn_close(rt: &RtShared, args: &[Value]) -> Result<Value> {
    let slot = thread_slot(rt, &args[0])?;
    slot.close.store(true, Ordering::Release);
    slot.changed.notify_all();
    Ok(Value::Int(0))
}

fn fn_status(rt: &RtShared, args: &[Value]) -> Result<Value> {
    use sorrel_bytecode::ThreadStatus as Ts;
    let code = match thread_slot(rt, &args[0])?.status() {
        Ts::Queued => 0,
        Ts::Running => 1,
        Ts::Paused => 2,
        Ts::Waiting => 3,
        Ts::Finished => 4,
        Ts::Errored => 5,
        Ts::Closed => 6,
    };
    Ok(Value::Int(code))
}

// --- shared context map ---

fn fn_ctxset(rt: &RtShared, args: &[Value]) -> Result<Value> {
    if args.len() != 2 {
        return Err(SorrelError("ctxset expects a key and one value".into()));
    }
    rt.context
        .write()
        .unwrap()
        .insert(want_str(&args[0])?.to_string(), args[1].clone());
    Ok(Value::Int(0))
}

fn fn_ctxget(rt: &RtShared, args: &[Value]) -> Result<Value> {
    let key = want_str(&args[0])?;
    rt.context
        .read()
        .unwrap()
        .get(key)
        .cloned()
        .ok_or_else(|| SorrelError(format!("context key '{}' not found", key)))
}

/// Read-modify-write under a single write lock, so concurrent callers
/// never lose an update.
fn fn_ctxincr(rt: &RtShared, args: &[Value]) -> Result<Value> {
    let key = want_str(&args[0])?;
    let mut ctx = rt.context.write().unwrap();
    let next = match ctx.get(key) {
        Some(Value::Int(i)) => i + 1,
        Some(other) => {
            return Err(SorrelError(format!(
                "context key '{}' holds {}, not int",
                key,
                other.type_name()
            )))
        }
        None => 1,
    };
    ctx.insert(key.to_string(), Value::Int(next));
    Ok(Value::Int(next))
}

// --- sandboxed host access ---

fn fn_readfile(rt: &RtShared, args: &[Value]) -> Result<Value> {
    let path = want_str(&args[0])?;
    if rt.settings.sandbox {
        let n = rt.fs_reads.fetch_add(1, Ordering::SeqCst);
        if n >= rt.settings.fs_read_limit {
            return Err(SorrelError("sandbox: file read limit exceeded".into()));
        }
        if let Ok(meta) = std::fs::metadata(path) {
            if meta.len() > rt.settings.fs_size_limit {
                return Err(SorrelError("sandbox: file size limit exceeded".into()));
            }
        }
    }
    std::fs::read_to_string(path)
        .map(Value::Str)
        .map_err(|e| SorrelError(format!("readfile '{}': {}", path, e)))
}

fn fn_writefile(rt: &RtShared, args: &[Value]) -> Result<Value> {
    let path = want_str(&args[0])?;
    let body = want_str(&args[1])?;
    if rt.settings.sandbox {
        let n = rt.fs_writes.fetch_add(1, Ordering::SeqCst);
        if n >= rt.settings.fs_write_limit {
            return Err(SorrelError("sandbox: file write limit exceeded".into()));
        }
        if body.len() as u64 > rt.settings.fs_size_limit {
            return Err(SorrelError("sandbox: file size limit exceeded".into()));
        }
    }
    std::fs::write(path, body).map_err(|e| SorrelError(format!("writefile '{}': {}", path, e)))?;
    Ok(Value::Int(0))
}

fn fn_shell(rt: &RtShared, args: &[Value]) -> Result<Value> {
    if rt.settings.sandbox {
        return Err(SorrelError("sandbox: process spawning is disabled".into()));
    }
    let cmd = want_str(&args[0])?;
    let status = if cfg!(windows) {
        std::process::Command::new("cmd").arg("/C").arg(cmd).status()
    } else {
        std::process::Command::new("sh").arg("-c").arg(cmd).status()
    };
    let status = status.map_err(|e| SorrelError(format!("shell: {}", e)))?;
    Ok(Value::Int(status.code().unwrap_or(-1) as i64))
}

fn fn_setenv(rt: &RtShared, args: &[Value]) -> Result<Value> {
    if rt.settings.sandbox {
        return Err(SorrelError("sandbox: environment mutation is disabled".into()));
    }
    unsafe { std::env::set_var(want_str(&args[0])?, want_str(&args[1])?) };
    Ok(Value::Int(0))
}

/// Base table plus host extras, extras last so the ids of the standard
/// entries stay stable.
pub fn with_extras(extras: Vec<EmbedFn>) -> Vec<EmbedFn> {
    let mut table = build();
    table.extend(extras);
    table
}

/// Deduplicated names of every registered function, for diagnostics.
pub fn catalogue_names() -> Vec<&'static str> {
    let mut seen = HashSet::new();
    for ef in registry() {
        seen.insert(ef.name);
    }
    let mut names: Vec<&'static str> = seen.into_iter().collect();
    names.sort();
    names
}
