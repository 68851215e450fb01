use anyhow::{Context, Result};
use std::process::Command;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: cargo xtask <command>");
        eprintln!("Commands:");
        eprintln!("  smoke    Run eventpipe-cli briefly against every provider and report the trace size");
        std::process::exit(1);
    }

    match args[1].as_str() {
        "smoke" => smoke(),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            std::process::exit(1);
        }
    }
}

/// Enables a catch-all session for a couple of seconds and reports how
/// many bytes landed in the trace file, as a quick end-to-end check that
/// the facade, buffer manager, and serializer are wired up correctly.
fn smoke() -> Result<()> {
    let dir = std::env::temp_dir();
    let trace_path = dir.join("eventpipe-xtask-smoke.nettrace");
    let _ = std::fs::remove_file(&trace_path);

    let mut child = Command::new("cargo")
        .args(["run", "--package", "eventpipe-cli", "--", "--providers", "*", "--output"])
        .arg(&trace_path)
        .spawn()
        .context("failed to launch eventpipe-cli")?;

    std::thread::sleep(std::time::Duration::from_secs(2));
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
    child.wait().context("eventpipe-cli did not exit cleanly")?;

    let size = std::fs::metadata(&trace_path).map(|m| m.len()).unwrap_or(0);
    if size == 0 {
        anyhow::bail!("smoke run produced an empty trace at {}", trace_path.display());
    }
    println!("smoke run wrote {size} bytes to {}", trace_path.display());
    Ok(())
}
