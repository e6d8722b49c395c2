use std::{env, fs};

use sorrel_ast::{register_embedded, Workspace};
use sorrel_bytecode::{deserialize_program, serialize_program, Program, Settings};
use sorrel_common::Result;
use sorrel_vm::VM;

// Map fun aliases → canonical commands
fn canonicalize(cmd: &str) -> &str {
    match cmd.to_ascii_lowercase().as_str() {
        // serious
        "run" => "run",
        "build" => "build",
        "check" => "check",
        "lex" => "lex",
        "funcs" => "funcs",
        // leafy
        "steep" => "run",
        "dry" => "build",
        "taste" => "check",
        "chop" => "lex",
        "pantry" => "funcs",
        _ => cmd,
    }
}

fn print_help() {
    println!("Sorrel CLI\n");
    println!("Commands (aliases in parentheses):");
    println!("  run   (steep)   Compile and run a .sor file, or run a built .sorx image");
    println!("  build (dry)     Compile a .sor file to a .sorx image");
    println!("  check (taste)   Compile only; report diagnostics");
    println!("  lex   (chop)    Dump tokens from a .sor file (debug)");
    println!("  funcs (pantry)  List the embedded function catalogue\n");
    println!("Options:");
    println!("  --cycles <n>    per-loop iteration budget");
    println!("  --depth <n>     maximum call depth");
    println!("  --sandbox       refuse process/env access, cap file access\n");
    println!("Usage:");
    println!("  sorrelc <command> [options] <file>");
}

struct Opts {
    settings: Settings,
    path: Option<String>,
}

fn parse_opts(args: &[String]) -> std::result::Result<Opts, String> {
    let mut settings = Settings::default();
    let mut path = None;
    let mut it = args.iter();
    while let Some(a) = it.next() {
        match a.as_str() {
            "--cycles" => {
                let v = it.next().ok_or("--cycles needs a value")?;
                settings.cycle_limit = v.parse().map_err(|_| format!("bad --cycles value '{}'", v))?;
            }
            "--depth" => {
                let v = it.next().ok_or("--depth needs a value")?;
                settings.depth_limit = v.parse().map_err(|_| format!("bad --depth value '{}'", v))?;
            }
            "--sandbox" => settings.sandbox = true,
            other if other.starts_with("--") => return Err(format!("unknown option '{}'", other)),
            other => {
                if path.is_some() {
                    return Err("more than one input file".to_string());
                }
                path = Some(other.to_string());
            }
        }
    }
    Ok(Opts { settings, path })
}

fn compile_to_program(path: &str) -> Result<Program> {
    let mut ws = Workspace::new();
    register_embedded(&mut ws, sorrel_funcs::registry())?;
    sorrel_parser::compile_file(&mut ws, path)?;
    sorrel_compiler::link(&ws)
}

fn cmd_run(opts: Opts) {
    let Some(path) = opts.path else {
        eprintln!("usage: sorrelc run [options] <file.sor>");
        std::process::exit(2)
    };
    let prog = if path.ends_with(".sorx") {
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) => {
                eprintln!("error: cannot read '{}': {}", path, e);
                std::process::exit(1)
            }
        };
        match deserialize_program(&bytes) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("error: {}", e);
                std::process::exit(1)
            }
        }
    } else {
        match compile_to_program(&path) {
            Ok(p) => p,
            Err(e) => {
                eprintln!("compile error: {}", e);
                std::process::exit(1)
            }
        }
    };
    let vm = VM::new(prog, sorrel_funcs::registry(), opts.settings);
    match vm.run() {
        Ok(value) => println!("{}", value),
        Err(e) => {
            eprintln!("runtime error: {}", e);
            std::process::exit(1);
        }
    }
}

fn cmd_build(opts: Opts) {
    let Some(path) = opts.path else {
        eprintln!("usage: sorrelc build <file.sor>");
        std::process::exit(2)
    };
    match compile_to_program(&path).and_then(|p| serialize_program(&p)) {
        Ok(bytes) => {
            let out = match path.strip_suffix(".sor") {
                Some(stem) => format!("{}.sorx", stem),
                None => format!("{}.sorx", path),
            };
            if let Err(e) = fs::write(&out, bytes) {
                eprintln!("error: cannot write '{}': {}", out, e);
                std::process::exit(1);
            }
            println!("built {}", out);
        }
        Err(e) => {
            eprintln!("compile error: {}", e);
            std::process::exit(1);
        }
    }
}

fn cmd_check(opts: Opts) {
    let Some(path) = opts.path else {
        eprintln!("usage: sorrelc check <file.sor>");
        std::process::exit(2)
    };
    let src = match fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: cannot read '{}': {}", path, e);
            std::process::exit(1)
        }
    };
    let diags = sorrel_compiler::service::analyze_source(&src, &path, sorrel_funcs::registry());
    if diags.errors.is_empty() {
        println!("ok: {} symbols", diags.symbols.len());
    } else {
        for d in &diags.errors {
            eprintln!("{}", d.message);
        }
        std::process::exit(1);
    }
}

fn cmd_lex(opts: Opts) {
    let Some(path) = opts.path else {
        eprintln!("usage: sorrelc lex <file.sor>");
        std::process::exit(2)
    };
    let src = match fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: cannot read '{}': {}", path, e);
            std::process::exit(1)
        }
    };
    match sorrel_lexer::tokenize(&src) {
        Ok(lex) => {
            for (i, t) in lex.tokens.iter().enumerate() {
                println!("{:?}\t'{}'\t@{}..{}", t.kind, lex.token_text(i), t.span.start, t.span.end);
            }
        }
        Err(e) => {
            eprintln!("lex error: {}", e);
            std::process::exit(1);
        }
    }
}

fn main() {
    let mut args = env::args().skip(1).collect::<Vec<_>>();
    if args.is_empty() || args[0] == "--help" || args[0] == "-h" {
        print_help();
        return;
    }
    let cmd = canonicalize(&args[0]).to_string();
    args.remove(0);
    let opts = match parse_opts(&args) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(2)
        }
    };
    match cmd.as_str() {
        "run" => cmd_run(opts),
        "build" => cmd_build(opts),
        "check" => cmd_check(opts),
        "lex" => cmd_lex(opts),
        "funcs" => {
            for name in sorrel_funcs::catalogue_names() {
                println!("{}", name);
            }
        }
        other => {
            eprintln!("unknown command '{}'; try --help", other);
            std::process::exit(2);
        }
    }
}
