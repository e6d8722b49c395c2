//! The precomputed pushdown-automaton table: `table()[state][token] ->
//! Option<Rule>`. A missing entry is the default error rule. Rules with
//! `again` leave the triggering token for their callback (or the next
//! state) to consume; callbacks may redirect control to states the
//! table does not name.
use once_cell::sync::Lazy;
use sorrel_common::Result;
use sorrel_lexer::{TokenKind, TOKEN_KIND_COUNT};

use crate::Parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub(crate) enum State {
    Unit,
    FnName,
    FnParamOpen,
    FnParamType,
    FnParamName,
    FnParamNext,
    FnRet,
    FnBodyOpen,
    RunHead,
    StructName,
    StructOpen,
    StructField,
    StructFieldName,
    ConstName,
    ConstAssign,
    IncludePath,
    Body,
    SwitchBody,
}

pub(crate) const STATE_COUNT: usize = State::SwitchBody as usize + 1;

/// What a semantic action asks the driver to do next.
pub(crate) enum Flow {
    Ok,
    Redirect(State),
    Stop,
}

pub(crate) type Cb = for<'w, 'l> fn(&mut Parser<'w, 'l>) -> Result<Flow>;

#[derive(Clone, Copy)]
pub(crate) struct Rule {
    pub next: State,
    pub enter: Option<Cb>,
    /// leave the triggering token unconsumed
    pub again: bool,
}

type Row = [Option<Rule>; TOKEN_KIND_COUNT];

fn set(table: &mut Vec<Row>, st: State, tok: TokenKind, next: State, enter: Option<Cb>, again: bool) {
    table[st as usize][tok as usize] = Some(Rule { next, enter, again });
}

fn go(table: &mut Vec<Row>, st: State, tok: TokenKind, next: State) {
    set(table, st, tok, next, None, false);
}

pub(crate) fn table() -> &'static Vec<Row> {
    static TABLE: Lazy<Vec<Row>> = Lazy::new(build);
    &TABLE
}

fn build() -> Vec<Row> {
    use State::*;
    use TokenKind::*;
    let mut t: Vec<Row> = vec![[None; TOKEN_KIND_COUNT]; STATE_COUNT];

    // top level
    go(&mut t, Unit, NewLine, Unit);
    set(&mut t, Unit, KwFunc, FnName, Some(crate::cb_unit_func), false);
    set(&mut t, Unit, KwRun, RunHead, Some(crate::cb_unit_run), false);
    set(&mut t, Unit, KwStruct, StructName, Some(crate::cb_unit_struct), false);
    go(&mut t, Unit, KwConst, ConstName);
    go(&mut t, Unit, KwInclude, IncludePath);
    set(&mut t, Unit, Eof, Unit, Some(crate::cb_unit_eof), true);

    // function heads
    set(&mut t, FnName, Ident, FnParamOpen, Some(crate::cb_fn_name), true);
    go(&mut t, FnParamOpen, NewLine, FnParamOpen);
    go(&mut t, FnParamOpen, LParen, FnParamType);
    go(&mut t, FnParamType, NewLine, FnParamType);
    go(&mut t, FnParamType, RParen, FnRet);
    set(&mut t, FnParamType, Ident, FnParamName, Some(crate::cb_par_type), true);
    set(&mut t, FnParamName, Ident, FnParamNext, Some(crate::cb_par_name), true);
    go(&mut t, FnParamNext, Comma, FnParamType);
    go(&mut t, FnParamNext, RParen, FnRet);
    go(&mut t, FnRet, NewLine, FnRet);
    set(&mut t, FnRet, Ident, FnBodyOpen, Some(crate::cb_ret_type), true);
    set(&mut t, FnRet, LBrace, Body, Some(crate::cb_open_fn_body), false);
    go(&mut t, FnBodyOpen, NewLine, FnBodyOpen);
    set(&mut t, FnBodyOpen, LBrace, Body, Some(crate::cb_open_fn_body), false);
    go(&mut t, RunHead, NewLine, RunHead);
    set(&mut t, RunHead, Ident, FnBodyOpen, Some(crate::cb_ret_type), true);
    set(&mut t, RunHead, LBrace, Body, Some(crate::cb_open_fn_body), false);

    // struct declarations
    set(&mut t, StructName, Ident, StructOpen, Some(crate::cb_struct_name), true);
    go(&mut t, StructOpen, NewLine, StructOpen);
    go(&mut t, StructOpen, LBrace, StructField);
    go(&mut t, StructField, NewLine, StructField);
    set(&mut t, StructField, Ident, StructFieldName, Some(crate::cb_field_type), true);
    set(&mut t, StructField, RBrace, Unit, Some(crate::cb_struct_done), false);
    set(&mut t, StructFieldName, Ident, StructField, Some(crate::cb_field_name), true);

    // constants
    set(&mut t, ConstName, Ident, ConstAssign, Some(crate::cb_const_name), true);
    go(&mut t, ConstAssign, NewLine, ConstAssign);
    set(&mut t, ConstAssign, Assign, Unit, Some(crate::cb_const_value), false);

    // includes
    go(&mut t, IncludePath, NewLine, IncludePath);
    set(&mut t, IncludePath, StrLit, Unit, Some(crate::cb_include), true);

    // statements
    set(&mut t, Body, NewLine, Body, Some(crate::cb_body_newline), true);
    set(&mut t, Body, RBrace, Body, Some(crate::cb_close_block), false);
    set(&mut t, Body, KwIf, Body, Some(crate::cb_if), false);
    set(&mut t, Body, KwWhile, Body, Some(crate::cb_while), false);
    set(&mut t, Body, KwFor, Body, Some(crate::cb_for), false);
    set(&mut t, Body, KwSwitch, SwitchBody, Some(crate::cb_switch), false);
    set(&mut t, Body, KwReturn, Body, Some(crate::cb_return), false);
    set(&mut t, Body, KwBreak, Body, Some(crate::cb_break), false);
    set(&mut t, Body, KwContinue, Body, Some(crate::cb_continue), false);
    set(&mut t, Body, KwTry, Body, Some(crate::cb_try), false);
    set(&mut t, Body, KwSpawn, Body, Some(crate::cb_spawn_stmt), false);
    set(&mut t, Body, KwCase, SwitchBody, Some(crate::cb_case_boundary), true);
    set(&mut t, Body, KwDefault, SwitchBody, Some(crate::cb_case_boundary), true);
    set(&mut t, Body, Ident, Body, Some(crate::cb_stmt_ident), true);
    set(&mut t, Body, Eof, Body, Some(crate::cb_body_eof), true);
    for tok in [IntLit, FloatLit, StrLit, CharLit, KwTrue, KwFalse, LParen, Minus, Not, Tilde] {
        set(&mut t, Body, tok, Body, Some(crate::cb_stmt_expr), true);
    }

    // switch bodies
    go(&mut t, SwitchBody, NewLine, SwitchBody);
    set(&mut t, SwitchBody, KwCase, Body, Some(crate::cb_case_open), false);
    set(&mut t, SwitchBody, KwDefault, Body, Some(crate::cb_default_open), false);
    set(&mut t, SwitchBody, RBrace, Body, Some(crate::cb_switch_end), false);

    t
}
