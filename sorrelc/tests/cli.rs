use std::env;
use std::fs;
use std::process::Command;

fn sorrelc_exe() -> Option<std::path::PathBuf> {
    if let Ok(p) = env::var("CARGO_BIN_EXE_sorrelc") {
        return Some(std::path::PathBuf::from(p));
    }
    let md = env::var("CARGO_MANIFEST_DIR").ok()?;
    let mut p = std::path::PathBuf::from(md);
    p.pop(); // up to workspace root
    p.push("target");
    p.push("debug");
    if cfg!(windows) { p.push("sorrelc.exe"); } else { p.push("sorrelc"); }
    Some(p)
}

#[test]
fn run_command_executes_a_script() {
    let Some(exe) = sorrelc_exe() else { return };
    if !exe.exists() {
        eprintln!("sorrelc binary not found at {:?}; skipping test", exe);
        return;
    }

    let mut path = env::temp_dir();
    path.push(format!(
        "sorrelc_cli_{}.sor",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    fs::write(&path, "run { return 1 + 2 * 3 }\n").expect("write temp script");

    let output = Command::new(&exe)
        .arg("run")
        .arg(&path)
        .output()
        .expect("run sorrelc");
    assert!(output.status.success(), "sorrelc run failed: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.trim().ends_with('7'), "unexpected output:\n{}", stdout);

    let _ = fs::remove_file(&path);
}

#[test]
fn compile_errors_exit_nonzero() {
    let Some(exe) = sorrelc_exe() else { return };
    if !exe.exists() {
        return;
    }

    let mut path = env::temp_dir();
    path.push(format!(
        "sorrelc_bad_{}.sor",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    fs::write(&path, "run { return nope }\n").expect("write temp script");

    let output = Command::new(&exe)
        .arg("run")
        .arg(&path)
        .output()
        .expect("run sorrelc");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown identifier"), "stderr:\n{}", stderr);

    let _ = fs::remove_file(&path);
}
