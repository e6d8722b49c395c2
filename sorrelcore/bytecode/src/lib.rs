//! Instruction words, string pool, position table and the linked Program.
//!
//! Every instruction is one u32 word: opcode in the low 16 bits, a small
//! immediate in the high 16. Wide immediates (i64/f64 constants, pool and
//! object ids) follow in one or two trailing words.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sorrel_common::{Result, SorrelError};

mod rt;
mod value;

pub use rt::{
    Settings, RtShared, ThreadSlot, ThreadStatus, ThreadTable,
};
pub use value::Value;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    // constants / literals
    PushImm    = 1,   // imm: i16 -> int stack
    PushInt    = 2,   // +2 words: i64 -> int stack
    PushFloat  = 3,   // +2 words: f64 bits -> float stack
    PushStr    = 4,   // +1 word: pool idx -> str stack
    PushChar   = 5,   // +1 word: char as u32 -> int stack

    // variables; imm packs (distance << 8) | slot
    GetInt     = 10,
    GetFloat   = 11,
    GetStr     = 12,
    GetAny     = 13,
    SetInt     = 14,
    SetFloat   = 15,
    SetStr     = 16,
    SetAny     = 17,

    // indexed access on boxed containers
    IdxGetArr  = 20,  // pop int idx, pop any arr -> push any
    IdxGetMap  = 21,  // pop str key, pop any map -> push any
    IdxGetFld  = 22,  // imm: field slot; pop any struct -> push any
    IdxGetBuf  = 23,  // pop int idx, pop any buf -> push int
    IdxSetArr  = 24,  // pop any val, pop int idx, pop any arr
    IdxSetMap  = 25,  // pop any val, pop str key, pop any map
    IdxSetFld  = 26,  // imm: field slot; pop any val, pop any struct
    IdxSetBuf  = 27,  // pop int val, pop int idx, pop any buf

    // moves between the typed stacks and the boxed stack
    BoxInt     = 30,
    BoxFloat   = 31,
    BoxStr     = 32,
    BoxBool    = 33,
    BoxChar    = 34,
    UnboxInt   = 35,  // Int/Bool/Char -> int stack
    UnboxFloat = 36,
    UnboxStr   = 37,

    // int arithmetic (bool/char ride the int stack)
    AddI       = 40,
    SubI       = 41,
    MulI       = 42,
    DivI       = 43,
    ModI       = 44,
    NegI       = 45,
    Shl        = 46,
    Shr        = 47,
    BitAnd     = 48,
    BitOr      = 49,
    BitXor     = 50,
    BitNot     = 51,
    EqI        = 52,
    LtI        = 53,
    GtI        = 54,
    NotB       = 55,

    // float arithmetic; comparisons land on the int stack
    AddF       = 56,
    SubF       = 57,
    MulF       = 58,
    DivF       = 59,
    NegF       = 60,
    EqF        = 61,
    LtF        = 62,
    GtF        = 63,

    // strings
    ConcatS    = 64,
    EqS        = 65,
    LtS        = 66,
    GtS        = 67,

    // control; jump immediates are signed word offsets from the next instruction
    Jmp        = 70,
    Jz         = 71,
    Jnz        = 72,
    JzKeep     = 73,  // short-circuit &&: keep false, else pop and fall through
    JnzKeep    = 74,  // short-circuit ||
    CallFunc   = 75,  // +1 word: object id
    CallEmbed  = 76,  // imm: argc; +1 word: registry index
    Ret        = 77,  // imm: result kind (RES_*)
    Entry      = 78,  // +2 words: packed parameter counts, packed extra-var counts
    BlkOpen    = 79,  // imm: kind (0 plain, 1 loop); +1 word: packed var counts
    BlkClose   = 80,
    PopBlk     = 81,  // imm: frames to pop (break/continue unwinding)
    Cycle      = 82,  // decrement the owning loop frame's budget
    ConstGet   = 83,  // imm: result kind; +1 word: object id
    Spawn      = 84,  // +1 word: object id -> push int thread id

    // statement-level value discards
    PopI       = 90,
    PopF       = 91,
    PopS       = 92,
    PopA       = 93,

    // composite initializers; elements arrive boxed
    InitArr    = 94,  // imm: element count
    InitMap    = 95,  // imm: pair count (str key + any value per pair)
    InitStruct = 96,  // imm: field count
    InitBuf    = 97,  // imm: byte count (from int stack)
    InitSet    = 98,  // imm: member count (from int stack)
    IterInit   = 99,  // pop any container -> push any arr snapshot of elements

    TryPush    = 101, // imm: signed word offset to the catch body
    TryPop     = 102,
    PushErr    = 103, // push the pending catch message onto the str stack

    Halt       = 255,
}

impl Op {
    pub fn from_u16(w: u16) -> Result<Op> {
        use Op::*;
        Ok(match w {
            1 => PushImm, 2 => PushInt, 3 => PushFloat, 4 => PushStr, 5 => PushChar,
            10 => GetInt, 11 => GetFloat, 12 => GetStr, 13 => GetAny,
            14 => SetInt, 15 => SetFloat, 16 => SetStr, 17 => SetAny,
            20 => IdxGetArr, 21 => IdxGetMap, 22 => IdxGetFld, 23 => IdxGetBuf,
            24 => IdxSetArr, 25 => IdxSetMap, 26 => IdxSetFld, 27 => IdxSetBuf,
            30 => BoxInt, 31 => BoxFloat, 32 => BoxStr, 33 => BoxBool, 34 => BoxChar,
            35 => UnboxInt, 36 => UnboxFloat, 37 => UnboxStr,
            40 => AddI, 41 => SubI, 42 => MulI, 43 => DivI, 44 => ModI, 45 => NegI,
            46 => Shl, 47 => Shr, 48 => BitAnd, 49 => BitOr, 50 => BitXor, 51 => BitNot,
            52 => EqI, 53 => LtI, 54 => GtI, 55 => NotB,
            56 => AddF, 57 => SubF, 58 => MulF, 59 => DivF, 60 => NegF,
            61 => EqF, 62 => LtF, 63 => GtF,
            64 => ConcatS, 65 => EqS, 66 => LtS, 67 => GtS,
            70 => Jmp, 71 => Jz, 72 => Jnz, 73 => JzKeep, 74 => JnzKeep,
            75 => CallFunc, 76 => CallEmbed, 77 => Ret, 78 => Entry,
            79 => BlkOpen, 80 => BlkClose, 81 => PopBlk, 82 => Cycle,
            83 => ConstGet, 84 => Spawn,
            90 => PopI, 91 => PopF, 92 => PopS, 93 => PopA,
            94 => InitArr, 95 => InitMap, 96 => InitStruct, 97 => InitBuf,
            98 => InitSet, 99 => IterInit,
            101 => TryPush, 102 => TryPop, 103 => PushErr,
            255 => Halt,
            other => return Err(SorrelError(format!("bad opcode {}", other))),
        })
    }
}

/// Result-kind tags used by Ret/ConstGet to say which stack carries the value.
pub const RES_NONE: u16 = 0;
pub const RES_INT: u16 = 1;
pub const RES_FLOAT: u16 = 2;
pub const RES_STR: u16 = 3;
pub const RES_ANY: u16 = 4;
pub const RES_BOOL: u16 = 5;
pub const RES_CHAR: u16 = 6;

pub fn word(op: Op, imm: u16) -> u32 {
    (op as u32) | ((imm as u32) << 16)
}

pub fn word_imm_i16(op: Op, imm: i16) -> u32 {
    (op as u32) | (((imm as u16) as u32) << 16)
}

pub fn decode(w: u32) -> (u16, u16) {
    ((w & 0xffff) as u16, (w >> 16) as u16)
}

/// Per-stack counts packed into one trailing word, one byte each:
/// int, float, str, any.
pub fn pack_counts(int_n: usize, float_n: usize, str_n: usize, any_n: usize) -> u32 {
    debug_assert!(int_n < 256 && float_n < 256 && str_n < 256 && any_n < 256);
    (int_n as u32) | ((float_n as u32) << 8) | ((str_n as u32) << 16) | ((any_n as u32) << 24)
}

pub fn unpack_counts(w: u32) -> (usize, usize, usize, usize) {
    (
        (w & 0xff) as usize,
        ((w >> 8) & 0xff) as usize,
        ((w >> 16) & 0xff) as usize,
        ((w >> 24) & 0xff) as usize,
    )
}

pub fn read_i64(code: &[u32], at: usize) -> i64 {
    let lo = code[at] as u64;
    let hi = code[at + 1] as u64;
    ((hi << 32) | lo) as i64
}

pub fn read_f64(code: &[u32], at: usize) -> f64 {
    f64::from_bits(read_i64(code, at) as u64)
}

/// Deduplicating string constant pool.
#[derive(Debug, Default, Clone)]
pub struct StrPool {
    pub items: Vec<String>,
    index: HashMap<String, u32>,
}

impl StrPool {
    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&i) = self.index.get(s) { return i; }
        let i = self.items.len() as u32;
        self.items.push(s.to_string());
        self.index.insert(s.to_string(), i);
        i
    }
    pub fn get(&self, i: u32) -> &str { &self.items[i as usize] }
}

/// Maps an instruction offset back to source. Ordered by offset so a
/// binary search finds the innermost entry for any failing instruction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PosEntry {
    pub offset: u32,
    pub path: u32, // string pool id
    pub func: u32, // string pool id
    pub line: u32,
    pub col: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    pub code: Vec<u32>,
    pub pool: Vec<String>,
    pub pos: Vec<PosEntry>,
    /// object id -> code offset, for every linked function/constant
    pub funcs: HashMap<u32, u32>,
    pub entry: u32,
    pub entry_res: u16,
}

impl Program {
    /// Innermost position entry covering `offset`, if any.
    pub fn pos_at(&self, offset: u32) -> Option<&PosEntry> {
        match self.pos.binary_search_by(|e| e.offset.cmp(&offset)) {
            Ok(i) => Some(&self.pos[i]),
            Err(0) => None,
            Err(i) => Some(&self.pos[i - 1]),
        }
    }
}

pub fn serialize_program(p: &Program) -> Result<Vec<u8>> {
    postcard::to_allocvec(p).map_err(|e| SorrelError(format!("serialize program: {}", e)))
}

pub fn deserialize_program(bytes: &[u8]) -> Result<Program> {
    postcard::from_bytes(bytes).map_err(|e| SorrelError(format!("deserialize program: {}", e)))
}

/// Type tags of the embedded-function ABI. Parametric kinds are matched
/// by their base kind; `Any` accepts every value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypeTag {
    None,
    Int,
    Float,
    Bool,
    Char,
    Str,
    Arr,
    Map,
    Buf,
    Set,
    Struct,
    Any,
}

pub enum EmbedDispatch {
    /// Fast path: the compiler emits this opcode instead of a call.
    Op(Op),
    Plain(fn(&[Value]) -> Result<Value>),
    Ctx(fn(&RtShared, &[Value]) -> Result<Value>),
}

/// One registration-table entry for a host-provided function.
pub struct EmbedFn {
    pub name: &'static str,
    pub pars: &'static [TypeTag],
    pub ret: TypeTag,
    pub dispatch: EmbedDispatch,
    /// trailing arguments beyond `pars` accepted, each compatible with `var_tag`
    pub variadic: bool,
    pub var_tag: TypeTag,
    pub needs_rt: bool,
    pub can_fail: bool,
}
