//! Command tree, type descriptors and the object namespace.
//!
//! The parser builds one `Cmd` tree per function; the namespace maps
//! mangled keys (`name#par1#par2`, variadic `name#...`) to objects.
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use sorrel_bytecode::{EmbedDispatch, EmbedFn, Op, TypeTag};
use sorrel_common::{Result, SorrelError};

pub type TypeId = usize;
pub type ObjId = usize;

// Primitive type ids seeded by Workspace::new, in this order.
pub const T_INT: TypeId = 0;
pub const T_FLOAT: TypeId = 1;
pub const T_BOOL: TypeId = 2;
pub const T_CHAR: TypeId = 3;
pub const T_STR: TypeId = 4;
pub const T_ARR: TypeId = 5;
pub const T_MAP: TypeId = 6;
pub const T_BUF: TypeId = 7;
pub const T_SET: TypeId = 8;
pub const T_ANY: TypeId = 9;
pub const T_STRUCT: TypeId = 10; // placeholder for overload tier 3
pub const T_NONE: TypeId = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
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
    None,
}

#[derive(Debug, Clone)]
pub struct TypeDesc {
    pub name: String,
    pub kind: TypeKind,
    /// element type of parametric kinds (arr, map)
    pub elem: Option<TypeId>,
    /// ordered struct fields
    pub fields: Vec<(String, TypeId)>,
}

impl TypeDesc {
    pub fn field_slot(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(n, _)| n == name)
    }
}

/// Which runtime value stack a type travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    Int,
    Float,
    Str,
    Any,
}

pub fn stack_of(kind: TypeKind) -> StackKind {
    match kind {
        TypeKind::Int | TypeKind::Bool | TypeKind::Char => StackKind::Int,
        TypeKind::Float => StackKind::Float,
        TypeKind::Str => StackKind::Str,
        _ => StackKind::Any,
    }
}

#[derive(Debug, Clone)]
pub enum Lit {
    Int(i64),
    Float(f64),
    Bool(bool),
    Char(char),
    Str(String),
}

/// One step of an index chain hanging off a variable reference.
#[derive(Debug, Clone)]
pub enum IdxStep {
    Arr(Box<Cmd>),
    Map(Box<Cmd>),
    Field(usize),
    Buf(Box<Cmd>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl AssignOp {
    pub fn base(self) -> Option<&'static str> {
        match self {
            AssignOp::Set => None,
            AssignOp::Add => Some("+"),
            AssignOp::Sub => Some("-"),
            AssignOp::Mul => Some("*"),
            AssignOp::Div => Some("/"),
            AssignOp::Mod => Some("%"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    Plain,
    If,
    While,
    For,
    Switch,
    Return,
    Break,
    Continue,
    Assign(AssignOp),
    IncDec(i8),
    Ternary,
    And,
    Or,
    InitArr,
    InitMap,
    InitStruct,
    InitBuf,
    InitSet,
    Try,
}

#[derive(Debug, Clone)]
pub struct CmdBlock {
    pub kind: BlockKind,
    pub children: Vec<Cmd>,
    /// types of locals declared in this block, in declaration order
    pub vars: Vec<TypeId>,
    pub var_names: Vec<String>,
    pub typ: TypeId,
    pub tok: u32,
}

impl CmdBlock {
    pub fn new(kind: BlockKind, tok: u32) -> Self {
        Self { kind, children: Vec::new(), vars: Vec::new(), var_names: Vec::new(), typ: T_NONE, tok }
    }

    /// Per-stack slot index of the `ordinal`-th local in this block.
    pub fn stack_slot(&self, ws: &Workspace, ordinal: usize) -> (StackKind, usize) {
        let kind = stack_of(ws.types[self.vars[ordinal]].kind);
        let slot = self.vars[..ordinal]
            .iter()
            .filter(|t| stack_of(ws.types[**t].kind) == kind)
            .count();
        (kind, slot)
    }

    /// Locals per stack: (int, float, str, any) counts.
    pub fn var_counts(&self, ws: &Workspace) -> (usize, usize, usize, usize) {
        let mut n = (0usize, 0usize, 0usize, 0usize);
        for t in &self.vars {
            match stack_of(ws.types[*t].kind) {
                StackKind::Int => n.0 += 1,
                StackKind::Float => n.1 += 1,
                StackKind::Str => n.2 += 1,
                StackKind::Any => n.3 += 1,
            }
        }
        n
    }
}

impl Default for CmdBlock {
    fn default() -> Self { CmdBlock::new(BlockKind::Plain, 0) }
}

#[derive(Debug, Clone)]
pub enum Cmd {
    Value { val: Lit, typ: TypeId, tok: u32 },
    Var { block: u16, slot: u16, typ: TypeId, tok: u32, idx: Vec<IdxStep> },
    ConstRef { obj: ObjId, typ: TypeId, tok: u32 },
    Unary { obj: ObjId, operand: Box<Cmd>, typ: TypeId, tok: u32 },
    Binary { obj: ObjId, left: Box<Cmd>, right: Box<Cmd>, typ: TypeId, tok: u32 },
    AnyCall { obj: ObjId, args: Vec<Cmd>, typ: TypeId, tok: u32 },
    /// `spawn { .. }`: the anonymous function object to launch
    SpawnCall { obj: ObjId, tok: u32 },
    Block(CmdBlock),
}

impl Cmd {
    pub fn typ(&self) -> TypeId {
        match self {
            Cmd::Value { typ, .. }
            | Cmd::Var { typ, .. }
            | Cmd::ConstRef { typ, .. }
            | Cmd::Unary { typ, .. }
            | Cmd::Binary { typ, .. }
            | Cmd::AnyCall { typ, .. } => *typ,
            Cmd::SpawnCall { .. } => T_INT,
            Cmd::Block(b) => b.typ,
        }
    }

    pub fn tok(&self) -> u32 {
        match self {
            Cmd::Value { tok, .. }
            | Cmd::Var { tok, .. }
            | Cmd::ConstRef { tok, .. }
            | Cmd::Unary { tok, .. }
            | Cmd::Binary { tok, .. }
            | Cmd::AnyCall { tok, .. }
            | Cmd::SpawnCall { tok, .. } => *tok,
            Cmd::Block(b) => b.tok,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FuncObj {
    pub pars: Vec<TypeId>,
    pub ret: Option<TypeId>,
    /// entry blocks without a declared type may return any value boxed
    pub any_ret: bool,
    pub body: CmdBlock,
    pub tok: u32,
    pub unit: usize,
}

#[derive(Debug, Clone)]
pub struct ConstObj {
    pub typ: TypeId,
    pub value: Cmd,
    pub tok: u32,
    pub unit: usize,
}

#[derive(Debug, Clone)]
pub struct EmbedObj {
    /// index into the host registry table
    pub idx: usize,
    pub pars: Vec<TypeId>,
    pub ret: Option<TypeId>,
    /// fast-path opcode when the dispatch id is a fixed instruction
    pub op: Option<Op>,
    pub variadic: bool,
    pub var_tag: TypeTag,
    pub can_fail: bool,
}

#[derive(Debug, Clone)]
pub enum ObjKind {
    TypeRef(TypeId),
    Const(ConstObj),
    Func(FuncObj),
    Embed(EmbedObj),
}

#[derive(Debug, Clone)]
pub struct Object {
    pub name: String,
    pub kind: ObjKind,
}

/// One compiled source unit: its path and a compact token -> (line, col)
/// table that outlives the Lex data, for building position tables.
#[derive(Debug, Clone)]
pub struct Unit {
    pub path: String,
    pub tok_pos: Vec<(u32, u32)>,
}

pub struct Workspace {
    pub types: Vec<TypeDesc>,
    tindex: HashMap<String, TypeId>,
    pub objects: Vec<Object>,
    pub names: HashMap<String, ObjId>,
    /// declared type/function/constant base names; locals must not shadow these
    pub base_names: HashSet<String>,
    pub units: Vec<Unit>,
    pub included: HashSet<PathBuf>,
    pub entry: Option<ObjId>,
}

impl Workspace {
    pub fn new() -> Self {
        let mut ws = Self {
            types: Vec::new(),
            tindex: HashMap::new(),
            objects: Vec::new(),
            names: HashMap::new(),
            base_names: HashSet::new(),
            units: Vec::new(),
            included: HashSet::new(),
            entry: None,
        };
        // seeding order must match the T_* constants
        ws.seed_type("int", TypeKind::Int);
        ws.seed_type("float", TypeKind::Float);
        ws.seed_type("bool", TypeKind::Bool);
        ws.seed_type("char", TypeKind::Char);
        ws.seed_type("str", TypeKind::Str);
        ws.seed_type("arr", TypeKind::Arr);
        ws.seed_type("map", TypeKind::Map);
        ws.seed_type("buf", TypeKind::Buf);
        ws.seed_type("set", TypeKind::Set);
        ws.seed_type("any", TypeKind::Any);
        ws.seed_type("struct", TypeKind::Struct);
        ws.seed_type("none", TypeKind::None);
        ws.types[T_ARR].elem = Some(T_ANY);
        ws.types[T_MAP].elem = Some(T_ANY);
        ws
    }

    fn seed_type(&mut self, name: &str, kind: TypeKind) {
        let id = self.types.len();
        self.types.push(TypeDesc { name: name.to_string(), kind, elem: None, fields: Vec::new() });
        self.tindex.insert(name.to_string(), id);
        self.base_names.insert(name.to_string());
    }

    pub fn type_by_name(&self, name: &str) -> Option<TypeId> {
        self.tindex.get(name).copied()
    }

    pub fn type_name(&self, t: TypeId) -> &str {
        &self.types[t].name
    }

    /// Intern `arr.<elem>`, reusing an existing descriptor by name.
    pub fn arr_of(&mut self, elem: TypeId) -> TypeId {
        self.parametric(TypeKind::Arr, "arr", elem)
    }

    pub fn map_of(&mut self, elem: TypeId) -> TypeId {
        self.parametric(TypeKind::Map, "map", elem)
    }

    fn parametric(&mut self, kind: TypeKind, base: &str, elem: TypeId) -> TypeId {
        if elem == T_ANY {
            return if kind == TypeKind::Arr { T_ARR } else { T_MAP };
        }
        let name = format!("{}.{}", base, self.types[elem].name);
        if let Some(&id) = self.tindex.get(&name) { return id; }
        let id = self.types.len();
        self.types.push(TypeDesc { name: name.clone(), kind, elem: Some(elem), fields: Vec::new() });
        self.tindex.insert(name, id);
        id
    }

    pub fn add_struct(&mut self, name: &str, fields: Vec<(String, TypeId)>, tok: u32) -> Result<TypeId> {
        if self.tindex.contains_key(name) || self.names.contains_key(name) {
            return Err(SorrelError(format!("type '{}' already defined", name)));
        }
        let _ = tok;
        let id = self.types.len();
        self.types.push(TypeDesc { name: name.to_string(), kind: TypeKind::Struct, elem: None, fields });
        self.tindex.insert(name.to_string(), id);
        self.base_names.insert(name.to_string());
        let obj = self.objects.len();
        self.objects.push(Object { name: name.to_string(), kind: ObjKind::TypeRef(id) });
        self.names.insert(name.to_string(), obj);
        Ok(id)
    }

    pub fn elem_of(&self, t: TypeId) -> TypeId {
        self.types[t].elem.unwrap_or(T_ANY)
    }

    pub fn type_tag(&self, t: TypeId) -> TypeTag {
        match self.types[t].kind {
            TypeKind::Int => TypeTag::Int,
            TypeKind::Float => TypeTag::Float,
            TypeKind::Bool => TypeTag::Bool,
            TypeKind::Char => TypeTag::Char,
            TypeKind::Str => TypeTag::Str,
            TypeKind::Arr => TypeTag::Arr,
            TypeKind::Map => TypeTag::Map,
            TypeKind::Buf => TypeTag::Buf,
            TypeKind::Set => TypeTag::Set,
            TypeKind::Struct => TypeTag::Struct,
            TypeKind::Any => TypeTag::Any,
            TypeKind::None => TypeTag::None,
        }
    }

    fn tag_type(&self, tag: TypeTag) -> TypeId {
        match tag {
            TypeTag::Int => T_INT,
            TypeTag::Float => T_FLOAT,
            TypeTag::Bool => T_BOOL,
            TypeTag::Char => T_CHAR,
            TypeTag::Str => T_STR,
            TypeTag::Arr => T_ARR,
            TypeTag::Map => T_MAP,
            TypeTag::Buf => T_BUF,
            TypeTag::Set => T_SET,
            TypeTag::Struct => T_STRUCT,
            TypeTag::Any => T_ANY,
            TypeTag::None => T_NONE,
        }
    }

    pub fn mangle(&self, name: &str, pars: &[TypeId]) -> String {
        let mut key = String::from(name);
        for p in pars {
            key.push('#');
            key.push_str(&self.types[*p].name);
        }
        key
    }

    pub fn variadic_key(name: &str) -> String {
        format!("{}#...", name)
    }

    /// Human-readable signature for "not found" diagnostics.
    pub fn signature(&self, name: &str, args: &[TypeId]) -> String {
        let pars: Vec<&str> = args.iter().map(|t| self.types[*t].name.as_str()).collect();
        format!("{}({})", name, pars.join(", "))
    }

    pub fn add_object(&mut self, key: String, obj: Object) -> Result<ObjId> {
        if self.names.contains_key(&key) {
            return Err(SorrelError(format!("'{}' already defined", key)));
        }
        let id = self.objects.len();
        self.base_names.insert(obj.name.clone());
        self.objects.push(obj);
        self.names.insert(key, id);
        Ok(id)
    }

    /// Overload resolution. Tier 1: exact type names. Tier 2: parametric
    /// kinds collapse to their base name. Tier 3: struct kinds collapse to
    /// the "struct" placeholder. Tier 4: variadic fallback.
    pub fn find_func(&self, name: &str, args: &[TypeId]) -> Option<ObjId> {
        let key = self.mangle(name, args);
        if let Some(&id) = self.names.get(&key) {
            return Some(id);
        }
        // tier 2: any-array / any-map wildcard
        let mut widened = false;
        let wide: Vec<TypeId> = args
            .iter()
            .map(|t| match self.types[*t].kind {
                TypeKind::Arr if *t != T_ARR => { widened = true; T_ARR }
                TypeKind::Map if *t != T_MAP => { widened = true; T_MAP }
                _ => *t,
            })
            .collect();
        if widened {
            if let Some(&id) = self.names.get(&self.mangle(name, &wide)) {
                return Some(id);
            }
        }
        // tier 3: struct placeholder
        let mut has_struct = false;
        let placed: Vec<TypeId> = wide
            .iter()
            .map(|t| match self.types[*t].kind {
                TypeKind::Struct if *t != T_STRUCT => { has_struct = true; T_STRUCT }
                _ => *t,
            })
            .collect();
        if has_struct {
            if let Some(&id) = self.names.get(&self.mangle(name, &placed)) {
                return Some(id);
            }
        }
        // tier 4: variadic fallback
        let id = *self.names.get(&Self::variadic_key(name))?;
        let (pars, var_tag) = match &self.objects[id].kind {
            ObjKind::Embed(e) if e.variadic => (&e.pars, e.var_tag),
            _ => return None,
        };
        if args.len() < pars.len() {
            return None;
        }
        for (par, arg) in pars.iter().zip(args) {
            if !self.par_accepts(*par, *arg) {
                return None;
            }
        }
        let tail = &args[pars.len()..];
        if tail.len() == 1 && self.types[tail[0]].kind == TypeKind::Arr {
            // a same-typed array may stand in for the trailing elements
            let elem = self.elem_of(tail[0]);
            if var_tag == TypeTag::Any || self.type_tag(elem) == var_tag {
                return Some(id);
            }
        }
        if tail.iter().all(|a| var_tag == TypeTag::Any || self.type_tag(*a) == var_tag) {
            return Some(id);
        }
        None
    }

    fn par_accepts(&self, par: TypeId, arg: TypeId) -> bool {
        if par == arg || par == T_ANY {
            return true;
        }
        match self.types[par].kind {
            TypeKind::Arr => par == T_ARR && self.types[arg].kind == TypeKind::Arr,
            TypeKind::Map => par == T_MAP && self.types[arg].kind == TypeKind::Map,
            TypeKind::Struct => par == T_STRUCT && self.types[arg].kind == TypeKind::Struct,
            _ => false,
        }
    }

    /// Result type of calling `obj`.
    pub fn result_of(&self, obj: ObjId) -> TypeId {
        match &self.objects[obj].kind {
            ObjKind::Func(f) => {
                if f.any_ret { T_ANY } else { f.ret.unwrap_or(T_NONE) }
            }
            ObjKind::Embed(e) => e.ret.unwrap_or(T_NONE),
            ObjKind::Const(c) => c.typ,
            ObjKind::TypeRef(_) => T_NONE,
        }
    }
}

impl Default for Workspace {
    fn default() -> Self { Self::new() }
}

/// Install the host registry into the namespace so overload resolution
/// and the lowering stage can see embedded functions and operators.
pub fn register_embedded(ws: &mut Workspace, table: &[EmbedFn]) -> Result<()> {
    for (idx, ef) in table.iter().enumerate() {
        let pars: Vec<TypeId> = ef.pars.iter().map(|t| ws.tag_type(*t)).collect();
        let ret = match ef.ret {
            TypeTag::None => None,
            tag => Some(ws.tag_type(tag)),
        };
        let op = match ef.dispatch {
            EmbedDispatch::Op(op) => Some(op),
            _ => None,
        };
        let key = if ef.variadic {
            Workspace::variadic_key(ef.name)
        } else {
            ws.mangle(ef.name, &pars)
        };
        let obj = Object {
            name: ef.name.to_string(),
            kind: ObjKind::Embed(EmbedObj {
                idx,
                pars,
                ret,
                op,
                variadic: ef.variadic,
                var_tag: ef.var_tag,
                can_fail: ef.can_fail,
            }),
        };
        ws.add_object(key, obj)?;
    }
    Ok(())
}
