use sorrel_ast::{register_embedded, Workspace};
use sorrel_bytecode::{deserialize_program, serialize_program, Program};
use sorrel_compiler::Linker;
use sorrel_parser::compile_unit;

fn program_for(src: &str) -> Program {
    let mut ws = Workspace::new();
    register_embedded(&mut ws, sorrel_funcs::registry()).expect("register");
    compile_unit(&mut ws, src, "test.sor").expect("compile");
    sorrel_compiler::link(&ws).expect("link")
}

#[test]
fn string_pool_deduplicates() {
    let prog = program_for(r#"run { str a = "same" str b = "same" return a + b }"#);
    let hits = prog.pool.iter().filter(|s| s.as_str() == "same").count();
    assert_eq!(hits, 1);
}

#[test]
fn position_table_is_monotonic() {
    let prog = program_for(
        "func f(int a) int { return a / 2 }\nrun { int x = f(10) return x / 0 }",
    );
    assert!(!prog.pos.is_empty());
    for pair in prog.pos.windows(2) {
        assert!(pair[0].offset <= pair[1].offset);
    }
    // every entry's ids resolve against the pool
    for e in &prog.pos {
        assert!((e.path as usize) < prog.pool.len());
        assert!((e.func as usize) < prog.pool.len());
    }
}

#[test]
fn only_reachable_functions_are_linked() {
    let mut ws = Workspace::new();
    register_embedded(&mut ws, sorrel_funcs::registry()).expect("register");
    compile_unit(
        &mut ws,
        "func used() int { return 1 }\nfunc unused() int { return 2 }\nrun { return used() }",
        "test.sor",
    )
    .expect("compile");
    let prog = sorrel_compiler::link(&ws).expect("link");
    // entry + used() only
    assert_eq!(prog.funcs.len(), 2);
    assert!(prog.pool.iter().any(|s| s == "used"));
    assert!(!prog.pool.iter().any(|s| s == "unused"));
}

#[test]
fn repeated_links_reuse_the_lowering_cache() {
    let mut ws = Workspace::new();
    register_embedded(&mut ws, sorrel_funcs::registry()).expect("register");
    compile_unit(
        &mut ws,
        "func f(int a) int { return a + 1 }\nrun { return f(1) }",
        "test.sor",
    )
    .expect("compile");
    let mut linker = Linker::new(&ws);
    let first = linker.link().expect("first link");
    let cached = linker.cache.len();
    let second = linker.link().expect("second link");
    assert_eq!(linker.cache.len(), cached);
    assert_eq!(first.code, second.code);
    assert_eq!(first.pool, second.pool);
}

#[test]
fn program_image_round_trips() {
    let prog = program_for(r#"run { return "hello" }"#);
    let bytes = serialize_program(&prog).expect("serialize");
    let back = deserialize_program(&bytes).expect("deserialize");
    assert_eq!(prog.code, back.code);
    assert_eq!(prog.pool, back.pool);
    assert_eq!(prog.entry, back.entry);
    assert_eq!(prog.entry_res, back.entry_res);
    assert_eq!(prog.pos, back.pos);
}

#[test]
fn diagnostics_service_reports_positions() {
    let diags = sorrel_compiler::service::analyze_source(
        "run {\n  return nope\n}",
        "test.sor",
        sorrel_funcs::registry(),
    );
    assert_eq!(diags.errors.len(), 1);
    assert_eq!(diags.errors[0].line, 2);

    let ok = sorrel_compiler::service::analyze_source(
        "func f() int { return 1 }\nrun { return f() }",
        "test.sor",
        sorrel_funcs::registry(),
    );
    assert!(ok.errors.is_empty());
    assert!(ok.symbols.iter().any(|s| s.name == "f"));
}
