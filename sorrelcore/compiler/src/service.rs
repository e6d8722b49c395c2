use serde::{Deserialize, Serialize};

use sorrel_ast::{register_embedded, ObjKind, Workspace};
use sorrel_bytecode::EmbedFn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DiagnosticSeverity { Error, Warning, Information }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    pub line: u32,
    pub column: u32,
    pub severity: DiagnosticSeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SymbolKind { Function, Constant, Struct }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub name: String,
    pub kind: SymbolKind,
    pub line: u32,
    pub col: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CompilerDiagnostics {
    pub errors: Vec<Diagnostic>,
    pub symbols: Vec<SymbolInfo>,
}

/// One-shot front-end analysis for editor tooling: compile the source
/// and report either the error (with its position) or the declared
/// symbols.
pub fn analyze_source(source: &str, filename: &str, table: &[EmbedFn]) -> CompilerDiagnostics {
    let mut out = CompilerDiagnostics::default();
    let mut ws = Workspace::new();
    if let Err(e) = register_embedded(&mut ws, table) {
        out.errors.push(Diagnostic { message: e.0, line: 0, column: 0, severity: DiagnosticSeverity::Error });
        return out;
    }
    match sorrel_parser::compile_unit(&mut ws, source, filename) {
        Ok(()) => collect_symbols(&ws, &mut out.symbols),
        Err(e) => {
            let (line, column) = position_of(&e.0);
            out.errors.push(Diagnostic {
                message: e.0,
                line,
                column,
                severity: DiagnosticSeverity::Error,
            });
        }
    }
    out
}

/// Error messages carry their position as "... at L:C: ..."; pull it
/// back out for structured reporting.
fn position_of(msg: &str) -> (u32, u32) {
    let Some(at) = msg.find(" at ") else { return (0, 0) };
    let rest = &msg[at + 4..];
    let Some(colon_end) = rest.find(": ") else { return (0, 0) };
    let mut parts = rest[..colon_end].split(':');
    let line = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let col = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    (line, col)
}

fn collect_symbols(ws: &Workspace, syms: &mut Vec<SymbolInfo>) {
    for obj in &ws.objects {
        let (kind, tok, unit) = match &obj.kind {
            ObjKind::Func(f) => (SymbolKind::Function, f.tok, f.unit),
            ObjKind::Const(c) => (SymbolKind::Constant, c.tok, c.unit),
            ObjKind::TypeRef(_) => continue,
            ObjKind::Embed(_) => continue,
        };
        let (line, col) = ws.units[unit].tok_pos[tok as usize];
        syms.push(SymbolInfo { name: obj.name.clone(), kind, line, col });
    }
    for t in &ws.types {
        if t.kind == sorrel_ast::TypeKind::Struct && !t.fields.is_empty() {
            syms.push(SymbolInfo { name: t.name.clone(), kind: SymbolKind::Struct, line: 0, col: 0 });
        }
    }
}
