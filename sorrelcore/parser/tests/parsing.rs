use sorrel_ast::{register_embedded, BlockKind, Cmd, ObjKind, Workspace, T_INT, T_STR};
use sorrel_parser::compile_unit;

fn workspace_for(src: &str) -> Workspace {
    let mut ws = Workspace::new();
    register_embedded(&mut ws, sorrel_funcs::registry()).expect("register");
    compile_unit(&mut ws, src, "test.sor").expect("compile");
    ws
}

fn compile_err(src: &str) -> String {
    let mut ws = Workspace::new();
    register_embedded(&mut ws, sorrel_funcs::registry()).expect("register");
    compile_unit(&mut ws, src, "test.sor").unwrap_err().0
}

fn entry_children(ws: &Workspace) -> &[Cmd] {
    let entry = ws.entry.expect("run block");
    match &ws.objects[entry].kind {
        ObjKind::Func(f) => &f.body.children,
        _ => panic!("entry is not a function"),
    }
}

#[test]
fn precedence_groups_tighter_operator_first() {
    let ws = workspace_for("run { return 1 + 2 * 3 }");
    let children = entry_children(&ws);
    let ret = match &children[0] {
        Cmd::Block(b) if b.kind == BlockKind::Return => &b.children[0],
        other => panic!("expected return, got {:?}", other),
    };
    // the + node must own the * node as its right operand
    match ret {
        Cmd::Binary { left, right, .. } => {
            assert!(matches!(**left, Cmd::Value { .. }));
            assert!(matches!(**right, Cmd::Binary { .. }));
        }
        other => panic!("expected binary, got {:?}", other),
    }
}

#[test]
fn right_associative_assignment_rejected_as_value() {
    // nested assignment produces a void value, which cannot be assigned
    let err = compile_err("run { int a = 0 int b = 0 a = b = 1 }");
    assert!(err.contains("invalid") || err.contains("void") || err.contains("cannot assign"), "{}", err);
}

#[test]
fn overload_resolution_is_order_independent() {
    let a = workspace_for(
        "func f(int a) int { return a }\nfunc f(str s) str { return s }\nrun { return f(5) }",
    );
    let b = workspace_for(
        "func f(str s) str { return s }\nfunc f(int a) int { return a }\nrun { return f(5) }",
    );
    for ws in [&a, &b] {
        let by_int = ws.find_func("f", &[T_INT]).expect("f(int)");
        let by_str = ws.find_func("f", &[T_STR]).expect("f(str)");
        assert_ne!(by_int, by_str);
        match &ws.objects[by_int].kind {
            ObjKind::Func(f) => assert_eq!(f.pars, vec![T_INT]),
            _ => panic!("expected script function"),
        }
        match &ws.objects[by_str].kind {
            ObjKind::Func(f) => assert_eq!(f.pars, vec![T_STR]),
            _ => panic!("expected script function"),
        }
    }
}

#[test]
fn duplicate_overload_is_an_error() {
    let err = compile_err("func f(int a) int { return a }\nfunc f(int b) int { return b }\nrun { return 0 }");
    assert!(err.contains("already defined"), "{}", err);
}

#[test]
fn duplicate_variable_is_an_error() {
    let err = compile_err("run { int x = 1 int x = 2 }");
    assert!(err.contains("already declared"), "{}", err);
}

#[test]
fn shadowing_a_function_name_is_an_error() {
    let err = compile_err("func f() int { return 1 }\nrun { int f = 2 }");
    assert!(err.contains("cannot shadow"), "{}", err);
}

#[test]
fn inner_scopes_resolve_innermost_first() {
    let ws = workspace_for("run { int x = 1 if true { int y = 2 x = y } return x }");
    let children = entry_children(&ws);
    // the if arm assigns the outer x from the inner y
    let arm = match &children[1] {
        Cmd::Block(b) if b.kind == BlockKind::If => match &b.children[1] {
            Cmd::Block(arm) => arm,
            other => panic!("expected arm, got {:?}", other),
        },
        other => panic!("expected if, got {:?}", other),
    };
    let cross_scope = arm.children.iter().any(|c| match c {
        Cmd::Block(b) if matches!(b.kind, BlockKind::Assign(_)) => matches!(
            (&b.children[0], &b.children[1]),
            (Cmd::Var { block: 0, .. }, Cmd::Var { block: 1, .. })
        ),
        _ => false,
    });
    assert!(cross_scope, "expected an outer-x = inner-y assignment");
}

#[test]
fn unknown_identifier_is_an_error() {
    let err = compile_err("run { return nope }");
    assert!(err.contains("unknown identifier 'nope'"), "{}", err);
}

#[test]
fn operator_not_found_names_the_signature() {
    let err = compile_err(r#"run { return 1 + "a" }"#);
    assert!(err.contains("operator not found: +(int, str)"), "{}", err);
}

#[test]
fn function_not_found_names_the_signature() {
    let err = compile_err("run { return missing(1, 2.0) }");
    assert!(err.contains("function not found: missing(int, float)"), "{}", err);
}

#[test]
fn value_returning_function_must_end_with_return() {
    let err = compile_err("func g() int { int x = 1 }\nrun { return 0 }");
    assert!(err.contains("must end with a return"), "{}", err);
}

#[test]
fn ternary_branch_types_must_agree() {
    let err = compile_err(r#"run { return true ? 1 : "a" }"#);
    assert!(err.contains("same type"), "{}", err);
}

#[test]
fn increment_requires_addressable_operand() {
    let err = compile_err("run { 5++ }");
    assert!(err.contains("invalid assignment target"), "{}", err);
}

#[test]
fn assignment_requires_addressable_target() {
    let err = compile_err("run { 5 = 3 }");
    assert!(err.contains("invalid assignment target"), "{}", err);
}

#[test]
fn syntax_error_reports_the_offending_token() {
    let err = compile_err("run { ) }");
    assert!(err.contains("parse error"), "{}", err);
    assert!(err.contains(")") || err.contains("unexpected"), "{}", err);
}

#[test]
fn one_line_colon_blocks() {
    let ws = workspace_for("run { int x = 0 if true : x = 1\n return x }");
    let children = entry_children(&ws);
    assert!(matches!(&children[1], Cmd::Block(b) if b.kind == BlockKind::If));
}

#[test]
fn elif_else_chains() {
    let ws = workspace_for(
        "run { int x = 0 if x == 1 { x = 10 } elif x == 2 { x = 20 } else { x = 30 } return x }",
    );
    let children = entry_children(&ws);
    match &children[1] {
        Cmd::Block(b) if b.kind == BlockKind::If => {
            // two (cond, arm) pairs plus the else arm
            assert_eq!(b.children.len(), 5);
        }
        other => panic!("expected if, got {:?}", other),
    }
}

#[test]
fn switch_parses_to_guarded_arms() {
    let ws = workspace_for(
        "run { int x = 2 switch x { case 1, 2: x = 10 case 3: x = 20 default: x = 30 } return x }",
    );
    let children = entry_children(&ws);
    match &children[1] {
        Cmd::Block(b) if b.kind == BlockKind::Switch => {
            // subject assignment + 2 guarded arms + default body
            assert_eq!(b.children.len(), 1 + 2 * 2 + 1);
            assert_eq!(b.vars.len(), 1); // the hidden subject slot
        }
        other => panic!("expected switch, got {:?}", other),
    }
}

#[test]
fn struct_declarations_and_field_access() {
    let ws = workspace_for(
        "struct Point { int x int y }\nrun { Point p = {1, 2} p.x = 5 return p.x }",
    );
    let t = ws.type_by_name("Point").expect("Point type");
    assert_eq!(ws.types[t].fields.len(), 2);
}

#[test]
fn unknown_struct_field_is_an_error() {
    let err = compile_err("struct Point { int x }\nrun { Point p = {1} return p.z }");
    assert!(err.contains("unknown field 'z'"), "{}", err);
}

#[test]
fn spawn_needs_an_int_target() {
    let err = compile_err("run { str t = spawn { sleep(1) } }");
    assert!(err.contains("thread id"), "{}", err);
}

#[test]
fn break_outside_loop_is_an_error() {
    let err = compile_err("run { break }");
    assert!(err.contains("break used outside of loop"), "{}", err);
}

#[test]
fn includes_are_deduplicated() {
    let dir = std::env::temp_dir();
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let lib = dir.join(format!("sorrel_lib_{}.sor", stamp));
    let main = dir.join(format!("sorrel_main_{}.sor", stamp));
    std::fs::write(&lib, "func twice(int a) int { return a * 2 }\n").expect("write lib");
    std::fs::write(
        &main,
        format!(
            "include \"{}\"\ninclude \"{}\"\nrun {{ return twice(21) }}\n",
            lib.display(),
            lib.display()
        ),
    )
    .expect("write main");
    let mut ws = Workspace::new();
    register_embedded(&mut ws, sorrel_funcs::registry()).expect("register");
    sorrel_parser::compile_file(&mut ws, &main.to_string_lossy()).expect("compile with includes");
    assert!(ws.find_func("twice", &[T_INT]).is_some());
    let _ = std::fs::remove_file(&lib);
    let _ = std::fs::remove_file(&main);
}
