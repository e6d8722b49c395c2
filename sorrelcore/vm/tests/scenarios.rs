use sorrel_ast::{register_embedded, Workspace};
use sorrel_bytecode::{Settings, Value};
use sorrel_common::{
    RuntimeError, ERR_CYCLE, ERR_DEPTH, ERR_DIVZERO, ERR_INDEX, ERR_SANDBOX,
};
use sorrel_vm::VM;

fn run_with(src: &str, settings: Settings) -> Result<Value, RuntimeError> {
    let mut ws = Workspace::new();
    register_embedded(&mut ws, sorrel_funcs::registry()).expect("register");
    sorrel_parser::compile_unit(&mut ws, src, "test.sor").expect("compile");
    let prog = sorrel_compiler::link(&ws).expect("link");
    VM::new(prog, sorrel_funcs::registry(), settings).run()
}

fn run_src(src: &str) -> Result<Value, RuntimeError> {
    run_with(src, Settings::default())
}

fn int_of(v: Value) -> i64 {
    match v {
        Value::Int(i) => i,
        other => panic!("expected int, got {:?}", other),
    }
}

fn str_of(v: Value) -> String {
    match v {
        Value::Str(s) => s,
        other => panic!("expected str, got {:?}", other),
    }
}

#[test]
fn arithmetic_with_precedence() {
    let v = run_src("run { return 1 + 2 * 3 }").expect("run");
    assert_eq!(int_of(v), 7);
}

#[test]
fn while_loop_counts() {
    let v = run_src("run { int i = 0 while i < 3 { i += 1 } return i }").expect("run");
    assert_eq!(int_of(v), 3);
}

#[test]
fn division_by_zero_has_id_and_single_frame_trace() {
    let err = run_src("run { return 10 / 0 }").unwrap_err();
    assert_eq!(err.id, ERR_DIVZERO);
    assert!(err.msg.contains("divided by zero"));
    assert_eq!(err.trace.len(), 1);
    assert_eq!(err.trace[0].path, "test.sor");
    assert_eq!(err.trace[0].func, "run");
    assert_eq!(err.trace[0].line, 1);
}

#[test]
fn traces_chain_innermost_last() {
    let err = run_src(
        "func inner() int { return 1 / 0 }\nfunc outer() int { return inner() }\nrun { return outer() }",
    )
    .unwrap_err();
    assert_eq!(err.id, ERR_DIVZERO);
    assert_eq!(err.trace.len(), 3);
    assert_eq!(err.trace[0].func, "run");
    assert_eq!(err.trace[1].func, "outer");
    assert_eq!(err.trace[2].func, "inner");
}

#[test]
fn overloads_dispatch_by_argument_type() {
    let v = run_src(
        "func f(int a) int { return a * 2 }\nfunc f(str s) str { return s + \"!\" }\nrun { return f(5) }",
    )
    .expect("run");
    assert_eq!(int_of(v), 10);
    let v = run_src(
        "func f(int a) int { return a * 2 }\nfunc f(str s) str { return s + \"!\" }\nrun { return f(\"x\") }",
    )
    .expect("run");
    assert_eq!(str_of(v), "x!");
}

#[test]
fn cycle_budget_stops_runaway_loops() {
    let settings = Settings { cycle_limit: 1000, ..Settings::default() };
    let err = run_with("run { while true { } return 0 }", settings).unwrap_err();
    assert_eq!(err.id, ERR_CYCLE);
    assert!(err.msg.contains("1000"));
}

#[test]
fn cycle_budget_allows_exactly_the_configured_count() {
    // the loop body runs exactly cycle_limit times before the fault
    let settings = Settings { cycle_limit: 1000, ..Settings::default() };
    let v = run_with(
        "run { int n = 0 try { while true { n += 1 } } catch e { } return n }",
        settings,
    )
    .expect("run");
    assert_eq!(int_of(v), 1000);
}

#[test]
fn threads_share_the_context_map_without_lost_updates() {
    for _ in 0..8 {
        let v = run_src(
            "run {\n  ctxset(\"n\", 0)\n  int t1 = spawn { ctxincr(\"n\") }\n  int t2 = spawn { ctxincr(\"n\") }\n  wait(t1)\n  wait(t2)\n  return ctxget(\"n\")\n}",
        )
        .expect("run");
        assert_eq!(int_of(v), 2);
    }
}

#[test]
fn threads_with_independent_locals_do_not_interfere() {
    let v = run_src(
        "run {\n  int t1 = spawn { int i = 0 while i < 1000 { i += 1 } }\n  int t2 = spawn { int j = 0 while j < 1000 { j += 1 } }\n  wait(t1)\n  wait(t2)\n  return 1\n}",
    )
    .expect("run");
    assert_eq!(int_of(v), 1);
}

#[test]
fn finished_threads_report_their_status() {
    let v = run_src("run { int t = spawn { sleep(5) } wait(t) return status(t) }").expect("run");
    assert_eq!(int_of(v), 4); // Finished
}

#[test]
fn short_circuit_skips_the_right_operand() {
    let v = run_src(
        "func boom() int { return 1 / 0 }\nrun { if false && boom() == 1 { return 1 } return 2 }",
    )
    .expect("no fault when lhs is false");
    assert_eq!(int_of(v), 2);
    let v = run_src(
        "func boom() int { return 1 / 0 }\nrun { if true || boom() == 1 { return 1 } return 2 }",
    )
    .expect("no fault when lhs is true");
    assert_eq!(int_of(v), 1);
}

#[test]
fn ternary_selects_by_condition() {
    let v = run_src("run { int x = 3 return x > 2 ? \"big\" : \"small\" }").expect("run");
    assert_eq!(str_of(v), "big");
}

#[test]
fn string_interpolation_evaluates_inner_expressions() {
    let v = run_src("run { int x = 6 return \"v=#{x + 1}!\" }").expect("run");
    assert_eq!(str_of(v), "v=7!");
}

#[test]
fn for_loops_iterate_array_snapshots() {
    let v = run_src("run { arr.int xs = {1, 2, 3} int s = 0 for v in xs { s += v } return s }")
        .expect("run");
    assert_eq!(int_of(v), 6);
}

#[test]
fn break_and_continue_unwind_to_the_loop() {
    let v = run_src(
        "run {\n  arr.int xs = {1, 2, 3, 4}\n  int s = 0\n  for v in xs {\n    if v == 2 { continue }\n    if v == 4 { break }\n    s += v\n  }\n  return s\n}",
    )
    .expect("run");
    assert_eq!(int_of(v), 4);
}

#[test]
fn switch_matches_cases_and_default() {
    let src = "run { int x = IN switch x { case 1, 2: return 10 case 3: return 20 default: return 30 } return 0 }";
    for (input, want) in [(2, 10), (3, 20), (9, 30)] {
        let v = run_src(&src.replace("IN", &input.to_string())).expect("run");
        assert_eq!(int_of(v), want);
    }
}

#[test]
fn structs_and_field_assignment() {
    let v = run_src(
        "struct Point { int x int y }\nrun { Point p = {1, 2} p.x = 5 return p.x + p.y }",
    )
    .expect("run");
    assert_eq!(int_of(v), 7);
}

#[test]
fn maps_index_by_key() {
    let v = run_src(
        "run { map.int m = {\"a\": 1} m[\"b\"] = 2 return m[\"a\"] + m[\"b\"] }",
    )
    .expect("run");
    assert_eq!(int_of(v), 3);
}

#[test]
fn bufs_and_sets() {
    let v = run_src(
        "run { buf b = {1, 255} set s = {1, 5} return b[1] + len(s) + (has(s, 5) ? 1 : 0) }",
    )
    .expect("run");
    assert_eq!(int_of(v), 258);
}

#[test]
fn index_out_of_range_is_a_runtime_error() {
    let err = run_src("run { arr.int xs = {1} return xs[5] }").unwrap_err();
    assert_eq!(err.id, ERR_INDEX);
    assert!(err.msg.contains("out of range"));
}

#[test]
fn recursion_depth_is_capped() {
    let settings = Settings { depth_limit: 64, ..Settings::default() };
    let err = run_with(
        "func r(int n) int { return r(n + 1) }\nrun { return r(0) }",
        settings,
    )
    .unwrap_err();
    assert_eq!(err.id, ERR_DEPTH);
    assert!(err.trace.len() > 2);
}

#[test]
fn try_catches_embedded_failures() {
    let v = run_src(
        "run { try { int x = int(\"zz\") return x } catch e { return -1 } return 0 }",
    )
    .expect("run");
    assert_eq!(int_of(v), -1);
}

#[test]
fn catch_binds_the_error_message() {
    let v = run_src("run { try { return 1 / 0 } catch e { return e } return \"\" }").expect("run");
    assert!(str_of(v).contains("divided by zero"));
}

#[test]
fn constants_evaluate_lazily_and_cache() {
    let v = run_src("const LIMIT = 40 + 2\nrun { return LIMIT + LIMIT }").expect("run");
    assert_eq!(int_of(v), 84);
}

#[test]
fn typed_run_blocks_return_typed_results() {
    let v = run_src("run int { return 2 + 3 }").expect("run");
    assert_eq!(int_of(v), 5);
}

#[test]
fn sandbox_rejects_process_spawning_eagerly() {
    let settings = Settings { sandbox: true, ..Settings::default() };
    let err = run_with("run { return shell(\"echo hi\") }", settings).unwrap_err();
    assert_eq!(err.id, ERR_SANDBOX);
    let settings = Settings { sandbox: true, ..Settings::default() };
    let err = run_with("run { setenv(\"A\", \"B\") return 0 }", settings).unwrap_err();
    assert_eq!(err.id, ERR_SANDBOX);
}

#[test]
fn float_arithmetic() {
    let v = run_src("run { float a = 1.5 float b = 2.5 return a * b }").expect("run");
    match v {
        Value::Float(f) => assert!((f - 3.75).abs() < 1e-9),
        other => panic!("expected float, got {:?}", other),
    }
}

#[test]
fn compound_assignment_on_indexed_elements() {
    let v = run_src("run { arr.int xs = {1, 2} xs[1] += 40 return xs[1] }").expect("run");
    assert_eq!(int_of(v), 42);
}
