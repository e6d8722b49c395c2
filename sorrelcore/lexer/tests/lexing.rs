use sorrel_lexer::{tokenize, TokenKind};

#[test]
fn tokenizing_is_deterministic() {
    let src = r#"func f(int a) int { return a + 1 } run { return f(2) * 3 }"#;
    let a = tokenize(src).expect("lex a");
    let b = tokenize(src).expect("lex b");
    assert_eq!(a.tokens.len(), b.tokens.len());
    for (x, y) in a.tokens.iter().zip(&b.tokens) {
        assert_eq!(x.kind, y.kind);
        assert_eq!(x.span, y.span);
    }
}

#[test]
fn spans_round_trip_to_source() {
    let src = "run { int count = 0x1F while count < 10 { count += 1 } }";
    let lex = tokenize(src).expect("lex");
    for (i, t) in lex.tokens.iter().enumerate() {
        if t.pool.is_none() && t.kind != TokenKind::Eof && t.kind != TokenKind::NewLine {
            let slice = &src[t.span.start as usize..t.span.end as usize];
            assert_eq!(slice, lex.token_text(i), "token {} span mismatch", i);
            assert!(!slice.is_empty());
        }
    }
    assert_eq!(lex.tokens.last().map(|t| t.kind), Some(TokenKind::Eof));
}

#[test]
fn keywords_operators_and_literals() {
    let lex = tokenize("func f(int a) int { return a != 1 }").expect("lex");
    let kinds: Vec<TokenKind> = lex.tokens.iter().map(|t| t.kind).collect();
    assert_eq!(
        kinds,
        vec![
            TokenKind::KwFunc,
            TokenKind::Ident,
            TokenKind::LParen,
            TokenKind::Ident,
            TokenKind::Ident,
            TokenKind::RParen,
            TokenKind::Ident,
            TokenKind::LBrace,
            TokenKind::KwReturn,
            TokenKind::Ident,
            TokenKind::Ne,
            TokenKind::IntLit,
            TokenKind::RBrace,
            TokenKind::Eof,
        ]
    );
}

#[test]
fn number_forms() {
    let lex = tokenize("run { return 0x1f + 0o17 + 42 }").expect("lex");
    let ints: Vec<&str> = lex
        .tokens
        .iter()
        .enumerate()
        .filter(|(_, t)| t.kind == TokenKind::IntLit)
        .map(|(i, _)| lex.token_text(i))
        .collect();
    assert_eq!(ints, vec!["0x1f", "0o17", "42"]);

    let lex = tokenize("run { return 1.5e3 }").expect("lex");
    assert!(lex.tokens.iter().any(|t| t.kind == TokenKind::FloatLit));
}

#[test]
fn interpolation_lowers_to_concatenation() {
    let lex = tokenize(r#"run { return "a#{x}b" }"#).expect("lex");
    let kinds: Vec<TokenKind> = lex.tokens.iter().map(|t| t.kind).collect();
    assert_eq!(
        kinds,
        vec![
            TokenKind::KwRun,
            TokenKind::LBrace,
            TokenKind::KwReturn,
            TokenKind::StrLit,  // "a"
            TokenKind::Plus,
            TokenKind::Ident,   // str
            TokenKind::LParen,
            TokenKind::Ident,   // x
            TokenKind::RParen,
            TokenKind::Plus,
            TokenKind::StrLit,  // "b"
            TokenKind::RBrace,
            TokenKind::Eof,
        ]
    );
    assert_eq!(lex.token_text(3), "a");
    assert_eq!(lex.token_text(5), "str");
    assert_eq!(lex.token_text(10), "b");
}

#[test]
fn nested_interpolation() {
    let lex = tokenize(r#"run { return "x#{ "y#{z}" }w" }"#).expect("lex");
    // both fragments of the inner string and the outer tail must appear
    let frags: Vec<&str> = lex
        .tokens
        .iter()
        .enumerate()
        .filter(|(_, t)| t.kind == TokenKind::StrLit)
        .map(|(i, _)| lex.token_text(i))
        .collect();
    assert!(frags.contains(&"x"));
    assert!(frags.contains(&"y"));
    assert!(frags.contains(&"w"));
}

#[test]
fn string_escapes() {
    let lex = tokenize(r#"run { return "a\n\t\"b\\" }"#).expect("lex");
    let i = lex
        .tokens
        .iter()
        .position(|t| t.kind == TokenKind::StrLit)
        .expect("string token");
    assert_eq!(lex.token_text(i), "a\n\t\"b\\");
}

#[test]
fn char_literals() {
    let lex = tokenize(r"run { return 'x' == '\n' }").expect("lex");
    let chars: Vec<&str> = lex
        .tokens
        .iter()
        .enumerate()
        .filter(|(_, t)| t.kind == TokenKind::CharLit)
        .map(|(i, _)| lex.token_text(i))
        .collect();
    assert_eq!(chars, vec!["x", "\n"]);
}

#[test]
fn comments_are_skipped() {
    let lex = tokenize("run { // line\n /* block\nstill */ return 1 }").expect("lex");
    assert!(lex.tokens.iter().any(|t| t.kind == TokenKind::KwReturn));
    assert!(lex.tokens.iter().all(|t| t.kind != TokenKind::Slash));
}

#[test]
fn first_error_aborts() {
    let err = tokenize(r#"run { return "open }"#).unwrap_err();
    assert!(err.0.contains("unterminated string"), "{}", err.0);

    let err = tokenize("run { return 12ab }").unwrap_err();
    assert!(err.0.contains("invalid number"), "{}", err.0);

    let err = tokenize("run { return @ }").unwrap_err();
    assert!(err.0.contains("unexpected character"), "{}", err.0);

    let err = tokenize("run { /* never closed").unwrap_err();
    assert!(err.0.contains("unterminated comment"), "{}", err.0);
}

#[test]
fn errors_carry_positions() {
    let err = tokenize("run {\n  return @\n}").unwrap_err();
    assert!(err.0.contains("2:"), "expected line 2 in: {}", err.0);
}

#[test]
fn line_col_mapping() {
    let lex = tokenize("a\nbb ccc").expect("lex");
    assert_eq!(lex.line_col(0), (1, 1));
    assert_eq!(lex.line_col(2), (2, 1));
    assert_eq!(lex.line_col(5), (2, 4));
}
