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

//! Table-driven lexer: a finite-state table keyed by character class,
//! with an explicit state stack for nested string interpolation.
use sorrel_common::{Result, SorrelError, Span};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Ident,
    IntLit,
    FloatLit,
    CharLit,
    StrLit,
    // keywords
    KwFunc, KwRun, KwStruct, KwConst, KwInclude,
    KwIf, KwElif, KwElse, KwWhile, KwFor, KwIn,
    KwSwitch, KwCase, KwDefault,
    KwReturn, KwBreak, KwContinue,
    KwTry, KwCatch, KwSpawn,
    KwTrue, KwFalse,
    // brackets
    LParen, RParen, LBrace, RBrace, LBracket, RBracket,
    // punctuation
    Comma, Dot, Colon, Question,
    // assignment family
    Assign, AddAssign, SubAssign, MulAssign, DivAssign, ModAssign,
    // arithmetic
    Plus, Minus, Star, Slash, Percent,
    // comparisons
    Eq, Ne, Lt, Le, Gt, Ge,
    // logical / bitwise
    Not, AndAnd, OrOr, Amp, Pipe, Caret, Shl, Shr, Tilde,
    Inc, Dec,
    NewLine,
    Eof,
}

pub const TOKEN_KIND_COUNT: usize = TokenKind::Eof as usize + 1;

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    /// string-pool index for literal fragments and synthesized tokens
    pub pool: Option<u32>,
}

/// Owns the source text, the token sequence, the line-start offsets and
/// the pool of literal string fragments cooked during lexing.
#[derive(Debug, Clone)]
pub struct Lex {
    pub src: String,
    pub tokens: Vec<Token>,
    pub lines: Vec<u32>,
    pub strings: Vec<String>,
}

impl Lex {
    /// 1-based (line, column) of a byte offset.
    pub fn line_col(&self, offset: u32) -> (u32, u32) {
        let line = match self.lines.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        (line as u32 + 1, offset - self.lines[line] + 1)
    }

    pub fn token_line_col(&self, i: usize) -> (u32, u32) {
        self.line_col(self.tokens[i].span.start)
    }

    /// Text of a token: pooled for fragments/synthesized tokens, the
    /// source slice otherwise.
    pub fn token_text(&self, i: usize) -> &str {
        let t = &self.tokens[i];
        match t.pool {
            Some(p) => &self.strings[p as usize],
            None => &self.src[t.span.start as usize..t.span.end as usize],
        }
    }
}

// character classes, the columns of the state table
const C_SPACE: usize = 0;
const C_NL: usize = 1;
const C_LETTER: usize = 2;
const C_ZERO: usize = 3;
const C_DIGIT: usize = 4;
const C_QUOTE: usize = 5;
const C_APOS: usize = 6;
const C_OP: usize = 7;
const C_LPAREN: usize = 8;
const C_RPAREN: usize = 9;
const C_LBRACK: usize = 10;
const C_RBRACK: usize = 11;
const C_LBRACE: usize = 12;
const C_RBRACE: usize = 13;
const C_OTHER: usize = 14;
const C_EOF: usize = 15;
const NCLASS: usize = 16;

fn class_of(c: char) -> usize {
    match c {
        ' ' | '\t' | '\r' => C_SPACE,
        '\n' => C_NL,
        '0' => C_ZERO,
        '1'..='9' => C_DIGIT,
        '"' => C_QUOTE,
        '\'' => C_APOS,
        '(' => C_LPAREN,
        ')' => C_RPAREN,
        '[' => C_LBRACK,
        ']' => C_RBRACK,
        '{' => C_LBRACE,
        '}' => C_RBRACE,
        '+' | '-' | '*' | '/' | '%' | '=' | '<' | '>' | '!' | '&' | '|' | '^' | '~' | '?'
        | ':' | '.' | ',' => C_OP,
        c if c.is_alphabetic() || c == '_' => C_LETTER,
        _ => C_OTHER,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum St {
    Main,
    Ident,
    NumZero,
    NumInt,
    NumFloat,
    NumExpSign,
    NumExp,
    NumHex,
    NumOct,
    Str,
    CharLit,
    LineCmt,
    BlkCmt,
    BlkCmtStar,
}

#[derive(Clone, Copy)]
enum Act {
    /// consume the char, no token effect
    Skip,
    /// consume the char and open a new token at it
    Start,
    /// consume the char into the current token
    Push,
    /// close the current token and re-examine the char in the next state
    Back,
    /// per-state handling in the driver
    Special,
    Err(&'static str),
}

#[derive(Clone, Copy)]
struct Rule {
    next: St,
    act: Act,
}

const fn r(next: St, act: Act) -> Rule {
    Rule { next, act }
}

// rows of the transition table, one per state
static MAIN: [Rule; NCLASS] = [
    r(St::Main, Act::Skip),                       // space
    r(St::Main, Act::Special),                    // newline
    r(St::Ident, Act::Start),                     // letter
    r(St::NumZero, Act::Start),                   // zero
    r(St::NumInt, Act::Start),                    // digit
    r(St::Str, Act::Special),                     // quote
    r(St::CharLit, Act::Special),                 // apostrophe
    r(St::Main, Act::Special),                    // operator char
    r(St::Main, Act::Special),                    // (
    r(St::Main, Act::Special),                    // )
    r(St::Main, Act::Special),                    // [
    r(St::Main, Act::Special),                    // ]
    r(St::Main, Act::Special),                    // {
    r(St::Main, Act::Special),                    // }
    r(St::Main, Act::Err("unexpected character")), // other
    r(St::Main, Act::Special),                    // eof
];

static IDENT: [Rule; NCLASS] = [
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Ident, Act::Push),
    r(St::Ident, Act::Push),
    r(St::Ident, Act::Push),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Err("unexpected character")),
    r(St::Main, Act::Back),
];

const BAD_NUM: &str = "invalid number: trailing letter";

static NUM_ZERO: [Rule; NCLASS] = [
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::NumZero, Act::Special), // x / o / e prefixes, else error
    r(St::NumInt, Act::Push),
    r(St::NumInt, Act::Push),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::NumZero, Act::Special), // '.' may start a fraction
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Err("unexpected character")),
    r(St::Main, Act::Back),
];

static NUM_INT: [Rule; NCLASS] = [
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::NumInt, Act::Special), // exponent or error
    r(St::NumInt, Act::Push),
    r(St::NumInt, Act::Push),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::NumInt, Act::Special), // '.'
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Err("unexpected character")),
    r(St::Main, Act::Back),
];

static NUM_FLOAT: [Rule; NCLASS] = [
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::NumFloat, Act::Special), // exponent or error
    r(St::NumFloat, Act::Push),
    r(St::NumFloat, Act::Push),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Err("unexpected character")),
    r(St::Main, Act::Back),
];

static NUM_EXP_SIGN: [Rule; NCLASS] = [
    r(St::Main, Act::Err("invalid number: missing exponent")),
    r(St::Main, Act::Err("invalid number: missing exponent")),
    r(St::Main, Act::Err(BAD_NUM)),
    r(St::NumExp, Act::Push),
    r(St::NumExp, Act::Push),
    r(St::Main, Act::Err("invalid number: missing exponent")),
    r(St::Main, Act::Err("invalid number: missing exponent")),
    r(St::NumExpSign, Act::Special), // '+'/'-'
    r(St::Main, Act::Err("invalid number: missing exponent")),
    r(St::Main, Act::Err("invalid number: missing exponent")),
    r(St::Main, Act::Err("invalid number: missing exponent")),
    r(St::Main, Act::Err("invalid number: missing exponent")),
    r(St::Main, Act::Err("invalid number: missing exponent")),
    r(St::Main, Act::Err("invalid number: missing exponent")),
    r(St::Main, Act::Err("unexpected character")),
    r(St::Main, Act::Err("invalid number: missing exponent")),
];

static NUM_EXP: [Rule; NCLASS] = [
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Err(BAD_NUM)),
    r(St::NumExp, Act::Push),
    r(St::NumExp, Act::Push),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Err("unexpected character")),
    r(St::Main, Act::Back),
];

static NUM_HEX: [Rule; NCLASS] = [
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::NumHex, Act::Special), // a-f or error
    r(St::NumHex, Act::Push),
    r(St::NumHex, Act::Push),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Err("unexpected character")),
    r(St::Main, Act::Back),
];

static NUM_OCT: [Rule; NCLASS] = [
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Err(BAD_NUM)),
    r(St::NumOct, Act::Push),
    r(St::NumOct, Act::Special), // 1-7 only
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Back),
    r(St::Main, Act::Err("unexpected character")),
    r(St::Main, Act::Back),
];

static STR: [Rule; NCLASS] = [
    r(St::Str, Act::Special),
    r(St::Str, Act::Special),
    r(St::Str, Act::Special),
    r(St::Str, Act::Special),
    r(St::Str, Act::Special),
    r(St::Str, Act::Special),
    r(St::Str, Act::Special),
    r(St::Str, Act::Special),
    r(St::Str, Act::Special),
    r(St::Str, Act::Special),
    r(St::Str, Act::Special),
    r(St::Str, Act::Special),
    r(St::Str, Act::Special),
    r(St::Str, Act::Special),
    r(St::Str, Act::Special),
    r(St::Main, Act::Err("unterminated string")),
];

static CHARLIT: [Rule; NCLASS] = [
    r(St::CharLit, Act::Special),
    r(St::CharLit, Act::Special),
    r(St::CharLit, Act::Special),
    r(St::CharLit, Act::Special),
    r(St::CharLit, Act::Special),
    r(St::CharLit, Act::Special),
    r(St::CharLit, Act::Special),
    r(St::CharLit, Act::Special),
    r(St::CharLit, Act::Special),
    r(St::CharLit, Act::Special),
    r(St::CharLit, Act::Special),
    r(St::CharLit, Act::Special),
    r(St::CharLit, Act::Special),
    r(St::CharLit, Act::Special),
    r(St::CharLit, Act::Special),
    r(St::Main, Act::Err("unterminated character literal")),
];

static LINE_CMT: [Rule; NCLASS] = [
    r(St::LineCmt, Act::Skip),
    r(St::Main, Act::Special), // newline handled by Main
    r(St::LineCmt, Act::Skip),
    r(St::LineCmt, Act::Skip),
    r(St::LineCmt, Act::Skip),
    r(St::LineCmt, Act::Skip),
    r(St::LineCmt, Act::Skip),
    r(St::LineCmt, Act::Skip),
    r(St::LineCmt, Act::Skip),
    r(St::LineCmt, Act::Skip),
    r(St::LineCmt, Act::Skip),
    r(St::LineCmt, Act::Skip),
    r(St::LineCmt, Act::Skip),
    r(St::LineCmt, Act::Skip),
    r(St::LineCmt, Act::Skip),
    r(St::Main, Act::Special),
];

static BLK_CMT: [Rule; NCLASS] = [
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Special), // '*' may close
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::Main, Act::Err("unterminated comment")),
];

static BLK_CMT_STAR: [Rule; NCLASS] = [
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmtStar, Act::Special), // '/' closes, '*' stays
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::BlkCmt, Act::Skip),
    r(St::Main, Act::Err("unterminated comment")),
];

fn rules(st: St) -> &'static [Rule; NCLASS] {
    match st {
        St::Main => &MAIN,
        St::Ident => &IDENT,
        St::NumZero => &NUM_ZERO,
        St::NumInt => &NUM_INT,
        St::NumFloat => &NUM_FLOAT,
        St::NumExpSign => &NUM_EXP_SIGN,
        St::NumExp => &NUM_EXP,
        St::NumHex => &NUM_HEX,
        St::NumOct => &NUM_OCT,
        St::Str => &STR,
        St::CharLit => &CHARLIT,
        St::LineCmt => &LINE_CMT,
        St::BlkCmt => &BLK_CMT,
        St::BlkCmtStar => &BLK_CMT_STAR,
    }
}

fn keyword_or_ident(text: &str) -> TokenKind {
    match text {
        "func" => TokenKind::KwFunc,
        "run" => TokenKind::KwRun,
        "struct" => TokenKind::KwStruct,
        "const" => TokenKind::KwConst,
        "include" => TokenKind::KwInclude,
        "if" => TokenKind::KwIf,
        "elif" => TokenKind::KwElif,
        "else" => TokenKind::KwElse,
        "while" => TokenKind::KwWhile,
        "for" => TokenKind::KwFor,
        "in" => TokenKind::KwIn,
        "switch" => TokenKind::KwSwitch,
        "case" => TokenKind::KwCase,
        "default" => TokenKind::KwDefault,
        "return" => TokenKind::KwReturn,
        "break" => TokenKind::KwBreak,
        "continue" => TokenKind::KwContinue,
        "try" => TokenKind::KwTry,
        "catch" => TokenKind::KwCatch,
        "spawn" => TokenKind::KwSpawn,
        "true" => TokenKind::KwTrue,
        "false" => TokenKind::KwFalse,
        _ => TokenKind::Ident,
    }
}

fn two_char_op(a: char, b: char) -> Option<TokenKind> {
    Some(match (a, b) {
        ('+', '=') => TokenKind::AddAssign,
        ('-', '=') => TokenKind::SubAssign,
        ('*', '=') => TokenKind::MulAssign,
        ('/', '=') => TokenKind::DivAssign,
        ('%', '=') => TokenKind::ModAssign,
        ('=', '=') => TokenKind::Eq,
        ('!', '=') => TokenKind::Ne,
        ('<', '=') => TokenKind::Le,
        ('>', '=') => TokenKind::Ge,
        ('<', '<') => TokenKind::Shl,
        ('>', '>') => TokenKind::Shr,
        ('&', '&') => TokenKind::AndAnd,
        ('|', '|') => TokenKind::OrOr,
        ('+', '+') => TokenKind::Inc,
        ('-', '-') => TokenKind::Dec,
        _ => return None,
    })
}

fn one_char_op(a: char) -> Option<TokenKind> {
    Some(match a {
        '+' => TokenKind::Plus,
        '-' => TokenKind::Minus,
        '*' => TokenKind::Star,
        '/' => TokenKind::Slash,
        '%' => TokenKind::Percent,
        '=' => TokenKind::Assign,
        '<' => TokenKind::Lt,
        '>' => TokenKind::Gt,
        '!' => TokenKind::Not,
        '&' => TokenKind::Amp,
        '|' => TokenKind::Pipe,
        '^' => TokenKind::Caret,
        '~' => TokenKind::Tilde,
        '?' => TokenKind::Question,
        ':' => TokenKind::Colon,
        '.' => TokenKind::Dot,
        ',' => TokenKind::Comma,
        _ => return None,
    })
}

struct Scanner<'a> {
    src: &'a str,
    chars: Vec<(usize, char)>,
    i: usize,
    start: usize,
    lx: Lex,
    /// suspended-string stack: brace depth per open interpolation
    interp: Vec<u32>,
    frag: String,
    frag_pending_plus: bool,
    str_pool_idx: u32,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str) -> Self {
        let chars: Vec<(usize, char)> = src.char_indices().collect();
        let mut lines = vec![0u32];
        for (p, c) in &chars {
            if *c == '\n' {
                lines.push((*p + 1) as u32);
            }
        }
        let mut lx = Lex { src: src.to_string(), tokens: Vec::new(), lines, strings: Vec::new() };
        lx.strings.push("str".to_string()); // conversion name for interpolation lowering
        Self {
            src,
            chars,
            i: 0,
            start: 0,
            lx,
            interp: Vec::new(),
            frag: String::new(),
            frag_pending_plus: false,
            str_pool_idx: 0,
        }
    }

    fn cur(&self) -> (usize, char, usize) {
        if self.i < self.chars.len() {
            let (p, c) = self.chars[self.i];
            (p, c, class_of(c))
        } else {
            (self.src.len(), '\0', C_EOF)
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.i + 1).map(|(_, c)| *c)
    }

    fn err_at(&self, pos: usize, msg: &str) -> SorrelError {
        let (line, col) = self.lx.line_col(pos as u32);
        SorrelError(format!("lex error at {}:{}: {}", line, col, msg))
    }

    fn emit(&mut self, kind: TokenKind, start: usize, end: usize) {
        self.lx.tokens.push(Token { kind, span: Span::new(start, end), pool: None });
    }

    fn emit_synth(&mut self, kind: TokenKind, pos: usize, pool: Option<u32>) {
        self.lx.tokens.push(Token { kind, span: Span::new(pos, pos), pool });
    }

    fn intern(&mut self, s: String) -> u32 {
        let idx = self.lx.strings.len() as u32;
        self.lx.strings.push(s);
        idx
    }

    /// Close the token accumulated since `start` according to the state
    /// that accumulated it.
    fn emit_accum(&mut self, st: St, end: usize) -> Result<()> {
        let text = &self.src[self.start..end];
        let kind = match st {
            St::Ident => keyword_or_ident(text),
            St::NumZero | St::NumInt => TokenKind::IntLit,
            St::NumHex => {
                if text.len() <= 2 {
                    return Err(self.err_at(self.start, "invalid number: empty hex literal"));
                }
                TokenKind::IntLit
            }
            St::NumOct => {
                if text.len() <= 2 {
                    return Err(self.err_at(self.start, "invalid number: empty octal literal"));
                }
                TokenKind::IntLit
            }
            St::NumFloat | St::NumExp => TokenKind::FloatLit,
            _ => unreachable!("no accumulating token in {:?}", st),
        };
        self.emit(kind, self.start, end);
        Ok(())
    }

    fn run(mut self) -> Result<Lex> {
        let mut st = St::Main;
        loop {
            let (pos, c, cls) = self.cur();
            let rule = rules(st)[cls];
            match rule.act {
                Act::Skip => {
                    self.i += 1;
                    st = rule.next;
                }
                Act::Start => {
                    self.start = pos;
                    self.i += 1;
                    st = rule.next;
                }
                Act::Push => {
                    self.i += 1;
                    st = rule.next;
                }
                Act::Back => {
                    self.emit_accum(st, pos)?;
                    st = rule.next;
                }
                Act::Err(msg) => return Err(self.err_at(pos, msg)),
                Act::Special => {
                    if cls == C_EOF && st == St::Main {
                        self.emit(TokenKind::Eof, pos, pos);
                        return Ok(self.lx);
                    }
                    st = self.special(st, pos, c, cls)?;
                }
            }
        }
    }

    fn special(&mut self, st: St, pos: usize, c: char, cls: usize) -> Result<St> {
        match st {
            St::Main => self.main_special(pos, c, cls),
            St::NumZero => match c {
                'x' | 'X' => { self.i += 1; Ok(St::NumHex) }
                'o' | 'O' => { self.i += 1; Ok(St::NumOct) }
                'e' | 'E' => { self.i += 1; Ok(St::NumExpSign) }
                '.' if self.peek().map_or(false, |n| n.is_ascii_digit()) => {
                    self.i += 1;
                    Ok(St::NumFloat)
                }
                '.' | '+' | '-' | '*' | '/' | '%' | '=' | '<' | '>' | '!' | '&' | '|' | '^'
                | '~' | '?' | ':' | ',' => {
                    self.emit_accum(St::NumZero, pos)?;
                    Ok(St::Main)
                }
                _ => Err(self.err_at(pos, BAD_NUM)),
            },
            St::NumInt => match c {
                'e' | 'E' => { self.i += 1; Ok(St::NumExpSign) }
                '.' if self.peek().map_or(false, |n| n.is_ascii_digit()) => {
                    self.i += 1;
                    Ok(St::NumFloat)
                }
                c if c.is_alphabetic() || c == '_' => Err(self.err_at(pos, BAD_NUM)),
                _ => {
                    self.emit_accum(St::NumInt, pos)?;
                    Ok(St::Main)
                }
            },
            St::NumFloat => match c {
                'e' | 'E' => { self.i += 1; Ok(St::NumExpSign) }
                _ => Err(self.err_at(pos, BAD_NUM)),
            },
            St::NumExpSign => match c {
                '+' | '-' => { self.i += 1; Ok(St::NumExp) }
                _ => Err(self.err_at(pos, "invalid number: missing exponent")),
            },
            St::NumHex => match c {
                'a'..='f' | 'A'..='F' => { self.i += 1; Ok(St::NumHex) }
                _ => Err(self.err_at(pos, BAD_NUM)),
            },
            St::NumOct => match c {
                '1'..='7' => { self.i += 1; Ok(St::NumOct) }
                _ => Err(self.err_at(pos, "invalid number: bad octal digit")),
            },
            St::Str => self.str_special(pos, c),
            St::CharLit => self.char_special(pos),
            // return to Main without consuming: the newline (or Eof)
            // itself is Main's to tokenize
            St::LineCmt => Ok(St::Main),
            St::BlkCmt => {
                self.i += 1;
                Ok(if c == '*' { St::BlkCmtStar } else { St::BlkCmt })
            }
            St::BlkCmtStar => {
                self.i += 1;
                Ok(match c {
                    '/' => St::Main,
                    '*' => St::BlkCmtStar,
                    _ => St::BlkCmt,
                })
            }
            _ => unreachable!("special in {:?}", st),
        }
    }

    fn main_special(&mut self, pos: usize, c: char, cls: usize) -> Result<St> {
        match cls {
            C_NL => {
                self.emit(TokenKind::NewLine, pos, pos + 1);
                self.i += 1;
                Ok(St::Main)
            }
            C_LPAREN => { self.emit(TokenKind::LParen, pos, pos + 1); self.i += 1; Ok(St::Main) }
            C_RPAREN => { self.emit(TokenKind::RParen, pos, pos + 1); self.i += 1; Ok(St::Main) }
            C_LBRACK => { self.emit(TokenKind::LBracket, pos, pos + 1); self.i += 1; Ok(St::Main) }
            C_RBRACK => { self.emit(TokenKind::RBracket, pos, pos + 1); self.i += 1; Ok(St::Main) }
            C_LBRACE => {
                if let Some(depth) = self.interp.last_mut() {
                    *depth += 1;
                }
                self.emit(TokenKind::LBrace, pos, pos + 1);
                self.i += 1;
                Ok(St::Main)
            }
            C_RBRACE => {
                if let Some(depth) = self.interp.last_mut() {
                    *depth -= 1;
                    if *depth == 0 {
                        // interpolation closed: resume the suspended string
                        self.interp.pop();
                        self.emit_synth(TokenKind::RParen, pos, None);
                        self.i += 1;
                        self.frag.clear();
                        self.frag_pending_plus = true;
                        self.start = pos + 1;
                        return Ok(St::Str);
                    }
                }
                self.emit(TokenKind::RBrace, pos, pos + 1);
                self.i += 1;
                Ok(St::Main)
            }
            C_QUOTE => {
                self.i += 1;
                self.start = pos;
                self.frag.clear();
                self.frag_pending_plus = false;
                Ok(St::Str)
            }
            C_APOS => {
                self.i += 1;
                self.start = pos;
                Ok(St::CharLit)
            }
            C_OP => {
                if c == '/' {
                    match self.peek() {
                        Some('/') => { self.i += 2; return Ok(St::LineCmt); }
                        Some('*') => { self.i += 2; return Ok(St::BlkCmt); }
                        _ => {}
                    }
                }
                if let Some(n) = self.peek() {
                    if let Some(kind) = two_char_op(c, n) {
                        self.emit(kind, pos, pos + c.len_utf8() + n.len_utf8());
                        self.i += 2;
                        return Ok(St::Main);
                    }
                }
                match one_char_op(c) {
                    Some(kind) => {
                        self.emit(kind, pos, pos + c.len_utf8());
                        self.i += 1;
                        Ok(St::Main)
                    }
                    None => Err(self.err_at(pos, "unexpected character")),
                }
            }
            _ => unreachable!("main special class {}", cls),
        }
    }

    fn str_special(&mut self, pos: usize, c: char) -> Result<St> {
        match c {
            '"' => {
                // end of string: flush the final fragment
                if self.frag_pending_plus {
                    self.emit_synth(TokenKind::Plus, pos, None);
                }
                let frag = std::mem::take(&mut self.frag);
                let idx = self.intern(frag);
                self.emit(TokenKind::StrLit, self.start, pos + 1);
                self.lx.tokens.last_mut().unwrap().pool = Some(idx);
                self.i += 1;
                Ok(St::Main)
            }
            '\\' => {
                let next = self.peek().ok_or_else(|| self.err_at(pos, "unterminated string"))?;
                let cooked = match next {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '\\' => '\\',
                    '"' => '"',
                    '\'' => '\'',
                    '0' => '\0',
                    '#' => '#',
                    _ => return Err(self.err_at(pos, "invalid escape sequence")),
                };
                self.frag.push(cooked);
                self.i += 2;
                Ok(St::Str)
            }
            '#' if self.peek() == Some('{') => {
                // suspend string scanning, re-enter the expression state:
                // "a#{e}b" lowers to "a" + str( e ) + "b"
                if self.frag_pending_plus {
                    self.emit_synth(TokenKind::Plus, pos, None);
                }
                let frag = std::mem::take(&mut self.frag);
                let idx = self.intern(frag);
                self.emit(TokenKind::StrLit, self.start, pos);
                self.lx.tokens.last_mut().unwrap().pool = Some(idx);
                self.emit_synth(TokenKind::Plus, pos, None);
                self.emit_synth(TokenKind::Ident, pos, Some(self.str_pool_idx));
                self.emit_synth(TokenKind::LParen, pos, None);
                self.interp.push(1);
                self.i += 2;
                Ok(St::Main)
            }
            other => {
                self.frag.push(other);
                self.i += 1;
                Ok(St::Str)
            }
        }
    }

    fn char_special(&mut self, pos: usize) -> Result<St> {
        let (_, c, cls) = self.cur();
        if cls == C_EOF {
            return Err(self.err_at(pos, "unterminated character literal"));
        }
        let cooked = if c == '\\' {
            let next = self.peek().ok_or_else(|| self.err_at(pos, "unterminated character literal"))?;
            self.i += 2;
            match next {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '\\' => '\\',
                '"' => '"',
                '\'' => '\'',
                '0' => '\0',
                _ => return Err(self.err_at(pos, "invalid escape sequence")),
            }
        } else if c == '\'' {
            return Err(self.err_at(pos, "empty character literal"));
        } else {
            self.i += 1;
            c
        };
        let (pq, q, qcls) = self.cur();
        if qcls == C_EOF || q != '\'' {
            return Err(self.err_at(pq, "unterminated character literal"));
        }
        self.i += 1;
        let idx = self.intern(cooked.to_string());
        self.emit(TokenKind::CharLit, self.start, pq + 1);
        self.lx.tokens.last_mut().unwrap().pool = Some(idx);
        Ok(St::Main)
    }
}

/// Tokenize one source unit. Stops at the first error; the returned
/// sequence always ends with the Eof sentinel.
pub fn tokenize(src: &str) -> Result<Lex> {
    Scanner::new(src).run()
}
