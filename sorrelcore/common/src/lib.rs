#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Span { pub start: u32, pub end: u32 }
impl Span { pub fn new(start: usize, end: usize) -> Self { Self { start: start as u32, end: end as u32 } } }

#[derive(Debug, Clone)]
pub struct SorrelError(pub String);
impl std::fmt::Display for SorrelError { fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self.0) } }
impl std::error::Error for SorrelError {}

pub type Result<T> = std::result::Result<T, SorrelError>;

// Runtime error ids. Stable numbers so hosts can branch on them.
pub const ERR_GENERIC: u16 = 1;
pub const ERR_DIVZERO: u16 = 2;
pub const ERR_INDEX: u16 = 3;
pub const ERR_CYCLE: u16 = 4;
pub const ERR_DEPTH: u16 = 5;
pub const ERR_EMBED: u16 = 6;
pub const ERR_SHIFT: u16 = 7;
pub const ERR_SANDBOX: u16 = 8;
pub const ERR_THREAD: u16 = 9;
pub const ERR_KEY: u16 = 10;
pub const ERR_VALUE: u16 = 11;

/// One rendered frame of a runtime call trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceLine {
    pub path: String,
    pub func: String,
    pub line: u32,
    pub col: u32,
}

impl std::fmt::Display for TraceLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}:{}] {}", self.path, self.line, self.col, self.func)
    }
}

/// Runtime errors carry a numeric id, a message and the call trace,
/// innermost frame last.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub id: u16,
    pub msg: String,
    pub trace: Vec<TraceLine>,
}

impl RuntimeError {
    pub fn new(id: u16, msg: impl Into<String>) -> Self {
        Self { id, msg: msg.into(), trace: Vec::new() }
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error {}: {}", self.id, self.msg)?;
        for (i, line) in self.trace.iter().enumerate() {
            write!(f, "\n    {}", line)?;
            if let Some(next) = self.trace.get(i + 1) {
                write!(f, " -> {}", next.func)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

pub type RtResult<T> = std::result::Result<T, RuntimeError>;
