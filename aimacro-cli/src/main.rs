use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::Command;

use aimacro_core::stdlib::default_stdlib_root;
use aimacro_core::{CompileOptions, compile_source, emit_asm, emit_ir, write_image};
use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Emit {
    /// Static x86-64 ELF executable
    Exe,
    /// Lowered IR text
    Ir,
    /// Intel-syntax assembly listing
    Asm,
}

/// Compile AIMacro source into a static x86-64 Linux executable.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, help = "Source file (reads stdin when omitted)")]
    input: Option<PathBuf>,

    #[arg(
        short,
        long,
        help = "Output path (defaults to a.out for executables, stdout for text)"
    )]
    output: Option<PathBuf>,

    #[arg(
        long,
        value_name = "PATH",
        help = "Path to the library root (defaults to the bundled stdlib)",
        conflicts_with = "no_stdlib"
    )]
    stdlib: Option<PathBuf>,

    #[arg(long, help = "Compile without any library units")]
    no_stdlib: bool,

    #[arg(long, value_enum, default_value_t = Emit::Exe)]
    emit: Emit,

    #[arg(long, help = "Run the executable after writing it")]
    run: bool,

    #[arg(short, long, action = ArgAction::Count, help = "Raise the log level (repeatable)")]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    execute(cli)
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .init();
}

fn execute(cli: Cli) -> Result<()> {
    let options = if cli.no_stdlib {
        CompileOptions::default()
    } else {
        CompileOptions::with_stdlib(cli.stdlib.clone().unwrap_or_else(default_stdlib_root))
    };

    let (name, source) = match &cli.input {
        Some(path) => {
            let source = fs::read_to_string(path)
                .with_context(|| format!("failed to read input file {}", path.display()))?;
            (path.display().to_string(), source)
        }
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("failed to read source from stdin")?;
            ("<stdin>".to_string(), buffer)
        }
    };
    log::info!("compiling {name}");

    match cli.emit {
        Emit::Exe => {
            let artifact = compile_source(&name, &source, &options)
                .with_context(|| format!("failed to compile {name}"))?;
            if !artifact.warnings.is_empty() {
                eprintln!("{}", artifact.render_warnings());
            }
            let output = cli.output.unwrap_or_else(|| PathBuf::from("a.out"));
            create_parent(&output)?;
            write_image(&output, &artifact.image)?;
            log::info!("wrote {}", output.display());
            if cli.run {
                let code = run_executable(&output)?;
                println!("Program exited with {code}");
            }
        }
        Emit::Ir | Emit::Asm => {
            let emitted = match cli.emit {
                Emit::Ir => emit_ir(&name, &source, &options),
                _ => emit_asm(&name, &source, &options),
            };
            let text = emitted.with_context(|| format!("failed to compile {name}"))?;
            match &cli.output {
                Some(path) => write_output(path, text.as_bytes())?,
                None => print!("{text}"),
            }
            if cli.run {
                eprintln!("--run is ignored for text outputs");
            }
        }
    }

    Ok(())
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
    }
    Ok(())
}

fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    create_parent(path)?;
    fs::write(path, bytes)
        .with_context(|| format!("failed to write output file {}", path.display()))?;
    log::info!("wrote {}", path.display());
    Ok(())
}

fn run_executable(path: &Path) -> Result<i32> {
    // A bare file name would be looked up on PATH.
    let program = if path.components().count() == 1 {
        Path::new(".").join(path)
    } else {
        path.to_path_buf()
    };
    let status = Command::new(&program)
        .status()
        .with_context(|| format!("failed to run {}", program.display()))?;
    status
        .code()
        .with_context(|| format!("{} was terminated by a signal", program.display()))
}

#[cfg(test)]
mod tests {
    use assert_cmd::Command;
    use predicates::prelude::*;
    use std::fs;
    use tempfile::tempdir;

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn compiles_and_runs_executable() {
        let dir = tempdir().expect("tempdir");
        let input_path = dir.path().join("input.aim");
        fs::write(&input_path, "def main(): return 1 + 2; end;").expect("write input");
        let output_path = dir.path().join("out");

        Command::cargo_bin("aimacro")
            .expect("binary exists")
            .arg("--input")
            .arg(&input_path)
            .arg("--output")
            .arg(&output_path)
            .arg("--run")
            .assert()
            .success()
            .stdout(predicate::str::contains("Program exited with 3"));

        assert!(output_path.exists(), "executable was not created");
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn runs_programs_that_print() {
        let dir = tempdir().expect("tempdir");
        let input_path = dir.path().join("hello.aim");
        fs::write(
            &input_path,
            "name = \"world\";\nprint(f\"hello {name}\", max(3, 7));\n",
        )
        .expect("write input");

        Command::cargo_bin("aimacro")
            .expect("binary exists")
            .arg("-i")
            .arg(&input_path)
            .arg("-o")
            .arg(dir.path().join("hello"))
            .arg("--run")
            .assert()
            .success()
            .stdout(predicate::str::contains("hello world 7\nProgram exited with 0"));
    }

    #[test]
    fn emits_ir_to_a_file() {
        let dir = tempdir().expect("tempdir");
        let input_path = dir.path().join("input.aim");
        fs::write(&input_path, "def main(): return 2 * 3; end;").expect("write input");
        let output_path = dir.path().join("nested/out.ir");

        Command::cargo_bin("aimacro")
            .expect("binary exists")
            .arg("--input")
            .arg(&input_path)
            .arg("--output")
            .arg(&output_path)
            .arg("--emit")
            .arg("ir")
            .assert()
            .success();

        let ir = fs::read_to_string(&output_path).expect("read ir");
        assert!(ir.contains("func @main() -> i64"));
    }

    #[test]
    fn write_output_creates_missing_directories() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("a/b/listing.s");
        super::write_output(&path, b"main:\n").expect("write output");
        assert_eq!(fs::read_to_string(&path).expect("read back"), "main:\n");
    }

    #[test]
    fn emits_asm_from_stdin_to_stdout() {
        Command::cargo_bin("aimacro")
            .expect("binary exists")
            .arg("--no-stdlib")
            .arg("--emit")
            .arg("asm")
            .write_stdin("def main(): return 0; end;")
            .assert()
            .success()
            .stdout(predicate::str::contains("main:").and(predicate::str::contains("ret")));
    }

    #[test]
    fn supports_custom_stdlib_root() {
        let dir = tempdir().expect("tempdir");
        let stdlib_root = dir.path().join("lib");
        fs::create_dir_all(&stdlib_root).expect("create stdlib root");
        fs::write(stdlib_root.join("twice.aim"), "def twice(x): return x * 2; end;").expect("write library");

        Command::cargo_bin("aimacro")
            .expect("binary exists")
            .arg("--stdlib")
            .arg(&stdlib_root)
            .arg("--emit")
            .arg("ir")
            .write_stdin("def main(): return twice(21); end;")
            .assert()
            .success()
            .stdout(predicate::str::contains("func @twice("));
    }

    #[test]
    fn reports_missing_stdlib_root() {
        let dir = tempdir().expect("tempdir");

        Command::cargo_bin("aimacro")
            .expect("binary exists")
            .arg("--output")
            .arg(dir.path().join("out"))
            .arg("--stdlib")
            .arg(dir.path().join("missing"))
            .write_stdin("def main(): return 0; end;")
            .assert()
            .failure()
            .stderr(predicate::str::contains("library directory was not found"));
    }

    #[test]
    fn reports_diagnostics_and_writes_nothing() {
        let dir = tempdir().expect("tempdir");
        let input_path = dir.path().join("bad.aim");
        fs::write(&input_path, "def f(): return x; end;").expect("write input");
        let output_path = dir.path().join("out");

        Command::cargo_bin("aimacro")
            .expect("binary exists")
            .arg("--input")
            .arg(&input_path)
            .arg("--output")
            .arg(&output_path)
            .assert()
            .failure()
            .stderr(predicate::str::contains("UnboundNameError").and(predicate::str::contains("bad.aim:1:")));

        assert!(!output_path.exists(), "no artifact on failure");
    }

    #[test]
    fn stdlib_flags_conflict() {
        Command::cargo_bin("aimacro")
            .expect("binary exists")
            .arg("--no-stdlib")
            .arg("--stdlib")
            .arg("lib")
            .assert()
            .failure();
    }
}
