//! Pipeline orchestration.
//!
//! Every entry point runs the same front end (load libraries, parse all
//! units in parallel, resolve and type check, lower) and stops at the
//! first stage that reports an error. The back ends differ only in what
//! they return: IR text, an assembly listing or a linked image.

use std::fs;
use std::path::{Path, PathBuf};

use crate::ast::{Module, Program, StmtKind};
use crate::codegen::generate;
use crate::diagnostic::{Diagnostic, DiagnosticKind, has_errors, render_all};
use crate::emit::{Image, link};
use crate::error::CoreError;
use crate::ir::IrModule;
use crate::lower::lower;
use crate::parser::{ParseResult, parse_str};
use crate::span::{FileId, SourceMap};
use crate::stdlib::{StdlibFile, default_stdlib_root, load_stdlib_files};
use crate::typecheck::typecheck;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileOptions {
    /// Library root to compile against; `None` compiles the source alone.
    pub stdlib_root: Option<PathBuf>,
}

impl CompileOptions {
    /// Compile against the library directory shipped with the crate.
    pub fn bundled() -> Self {
        CompileOptions {
            stdlib_root: Some(default_stdlib_root()),
        }
    }

    pub fn with_stdlib(root: impl Into<PathBuf>) -> Self {
        CompileOptions {
            stdlib_root: Some(root.into()),
        }
    }
}

#[derive(Debug)]
pub struct CompilationArtifact {
    pub image: Image,
    pub stdlib: Vec<StdlibFile>,
    /// Warning-severity diagnostics of a successful compilation.
    pub warnings: Vec<Diagnostic>,
    sources: SourceMap,
}

impl CompilationArtifact {
    pub fn render_warnings(&self) -> String {
        render_all(&self.warnings, &self.sources)
    }
}

/// Output of the front end: everything up to and including lowering.
struct Lowered {
    ir: IrModule,
    stdlib: Vec<StdlibFile>,
    warnings: Vec<Diagnostic>,
    sources: SourceMap,
}

pub fn compile_source(
    name: &str,
    source: &str,
    options: &CompileOptions,
) -> Result<CompilationArtifact, CoreError> {
    let Lowered {
        ir,
        stdlib,
        mut warnings,
        sources,
    } = front_end(name, source, options)?;
    let compiled = generate(&ir).map_err(|d| halt("codegen", d, &mut warnings, &sources))?;
    log::debug!("generated {} function(s)", compiled.functions.len());
    let image = link(&compiled).map_err(|d| halt("link", d, &mut warnings, &sources))?;
    log::debug!("linked image of {} bytes, entry {:#x}", image.bytes.len(), image.entry);
    Ok(CompilationArtifact {
        image,
        stdlib,
        warnings,
        sources,
    })
}

pub fn compile_file(path: impl AsRef<Path>, options: &CompileOptions) -> Result<CompilationArtifact, CoreError> {
    let path = path.as_ref();
    let source = fs::read_to_string(path)?;
    compile_source(&path.display().to_string(), &source, options)
}

/// Lowered IR in its text form.
pub fn emit_ir(name: &str, source: &str, options: &CompileOptions) -> Result<String, CoreError> {
    let lowered = front_end(name, source, options)?;
    Ok(lowered.ir.to_string())
}

/// Intel-syntax listing of the generated machine code.
pub fn emit_asm(name: &str, source: &str, options: &CompileOptions) -> Result<String, CoreError> {
    let Lowered {
        ir,
        mut warnings,
        sources,
        ..
    } = front_end(name, source, options)?;
    let compiled = generate(&ir).map_err(|d| halt("codegen", d, &mut warnings, &sources))?;
    Ok(compiled.listing())
}

fn halt(stage: &str, mut errors: Vec<Diagnostic>, warnings: &mut Vec<Diagnostic>, sources: &SourceMap) -> CoreError {
    log::debug!("{stage} reported {} diagnostic(s); stopping", errors.len());
    let mut all = std::mem::take(warnings);
    all.append(&mut errors);
    CoreError::compile(all, sources)
}

fn front_end(name: &str, source: &str, options: &CompileOptions) -> Result<Lowered, CoreError> {
    let stdlib = match &options.stdlib_root {
        Some(root) => load_stdlib_files(root)?,
        None => Vec::new(),
    };

    let mut sources = SourceMap::new();
    sources.add(name, source);
    for file in &stdlib {
        sources.add(format!("stdlib/{}", file.path.display()), file.contents.clone());
    }

    let mut diagnostics = Vec::new();
    let mut modules = Vec::with_capacity(sources.len());
    for result in parse_units(&sources) {
        diagnostics.extend(result.diagnostics);
        modules.push(result.module);
    }
    let mut modules = modules.into_iter();
    let Some(main) = modules.next() else {
        return Err(CoreError::compile(diagnostics, &sources));
    };
    let libraries: Vec<Module> = modules.collect();
    for library in &libraries {
        check_library_unit(library, &mut diagnostics);
    }
    if has_errors(&diagnostics) {
        log::debug!("parsing failed; stopping");
        return Err(CoreError::compile(diagnostics, &sources));
    }

    let program = Program { main, libraries };
    let checked = typecheck(&program);
    diagnostics.extend(checked.diagnostics);
    let hir = match checked.module {
        Some(hir) if !has_errors(&diagnostics) => hir,
        _ => {
            log::debug!("name resolution or type checking failed; stopping");
            return Err(CoreError::compile(diagnostics, &sources));
        }
    };

    let ir = lower(&hir).map_err(|d| halt("lowering", d, &mut diagnostics, &sources))?;
    log::debug!(
        "lowered {} function(s), {} global(s), {} string(s)",
        ir.functions.len(),
        ir.globals.len(),
        ir.strings.len()
    );
    for warning in &diagnostics {
        log::warn!("{}", warning.render(&sources).trim_end());
    }
    Ok(Lowered {
        ir,
        stdlib,
        warnings: diagnostics,
        sources,
    })
}

/// Parse every unit of `sources` on its own thread, in file order.
fn parse_units(sources: &SourceMap) -> Vec<ParseResult> {
    let units: Vec<(FileId, &str)> = sources
        .ids()
        .filter_map(|id| sources.text(id).map(|text| (id, text)))
        .collect();
    std::thread::scope(|scope| {
        let handles: Vec<_> = units
            .iter()
            .map(|&(id, text)| scope.spawn(move || parse_str(id, text)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_else(|payload| std::panic::resume_unwind(payload)))
            .collect()
    })
}

fn check_library_unit(module: &Module, diagnostics: &mut Vec<Diagnostic>) {
    for item in &module.items {
        if !matches!(item.kind, StmtKind::FunctionDef(_)) {
            diagnostics.push(
                Diagnostic::error(
                    DiagnosticKind::ParseError,
                    "library units may only contain function definitions",
                    item.span,
                )
                .with_note("top-level statements belong in the main source"),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare() -> CompileOptions {
        CompileOptions::default()
    }

    #[test]
    fn compiling_twice_is_deterministic() {
        let source = "def main():\n  xs = [1, 2, 3];\n  print(f\"n = {len(xs)}\", 1.5);\n  return 0;\nend;";
        let first = compile_source("det.aim", source, &bare()).expect("compile");
        let second = compile_source("det.aim", source, &bare()).expect("compile");
        assert_eq!(first.image.bytes, second.image.bytes);
    }

    #[test]
    fn undefined_asm_placeholder_yields_one_codegen_error() {
        let source = "def main():\n  asm { mov rax, {nowhere} };\n  return 0;\nend;";
        let err = compile_source("raw.aim", source, &bare()).expect_err("should fail");
        let diags = err.diagnostics();
        assert_eq!(diags.len(), 1, "{diags:?}");
        assert_eq!(diags[0].kind, DiagnosticKind::CodegenError);
        assert!(diags[0].message.contains("nowhere"));
    }

    #[test]
    fn unbound_names_stop_before_lowering() {
        let err = compile_source("u.aim", "def f(): return x; end;", &bare()).expect_err("should fail");
        let diags = err.diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::UnboundNameError);
        assert!(err.to_string().contains("u.aim:1:"));
    }

    #[test]
    fn compile_file_names_diagnostics_after_the_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("prog.aim");
        fs::write(&path, "def main():\n  return 1 +\nend;\n").expect("write");
        let err = compile_file(&path, &bare()).expect_err("dangling operator");
        assert_eq!(err.diagnostics()[0].kind, DiagnosticKind::ParseError);
        assert!(err.to_string().contains("prog.aim:"));

        let missing = compile_file(dir.path().join("absent.aim"), &bare()).expect_err("no file");
        assert!(matches!(missing, CoreError::SourceIo(_)));
    }

    #[test]
    fn missing_library_root_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let options = CompileOptions::with_stdlib(dir.path().join("missing"));
        let err = compile_source("m.aim", "def main(): return 0; end;", &options).expect_err("should fail");
        assert!(matches!(err, CoreError::MissingStdlib(_)));
    }

    #[test]
    fn library_units_hold_definitions_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("bad.aim"), "x = 1;\n").expect("write");
        let options = CompileOptions::with_stdlib(dir.path());
        let err = compile_source("m.aim", "def main(): return 0; end;", &options).expect_err("should fail");
        assert_eq!(err.diagnostics()[0].kind, DiagnosticKind::ParseError);
        assert!(err.to_string().contains("stdlib/bad.aim"));
    }

    #[test]
    fn emits_ir_and_assembly_text() {
        let source = "def main(): return 1 + 2; end;";
        let ir = emit_ir("t.aim", source, &bare()).expect("ir");
        assert!(ir.contains("entry @main"));
        assert!(ir.contains("func @main() -> i64 {"));
        let asm = emit_asm("t.aim", source, &bare()).expect("asm");
        assert!(asm.contains("main:"));
        assert!(asm.contains("ret"));
    }

    #[test]
    fn bundled_library_is_available() {
        let artifact = compile_source("lib.aim", "print(abs(-4), max(2, 9));", &CompileOptions::bundled())
            .expect("compile");
        assert!(!artifact.stdlib.is_empty());
        assert!(artifact.image.symbols.contains_key("abs"));
        assert!(!artifact.image.symbols.contains_key("min"), "unused library functions are dropped");
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    mod run {
        use super::*;
        use crate::emit::write_image;
        use std::process::Command;

        fn run(source: &str, options: &CompileOptions) -> (i32, String) {
            let artifact = compile_source("run.aim", source, options).expect("compile");
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("prog");
            write_image(&path, &artifact.image).expect("write");
            let output = Command::new(&path).output().expect("run");
            let code = output.status.code().expect("exit code");
            (code, String::from_utf8(output.stdout).expect("utf8"))
        }

        #[test]
        fn main_return_value_is_the_exit_status() {
            let (code, stdout) = run("def main(): return 1 + 2; end;", &bare());
            assert_eq!(code, 3);
            assert!(stdout.is_empty());
        }

        #[test]
        fn prints_lists_strings_and_floats() {
            let source = "def main():\n  xs = [1, 2, 3];\n  total = 0;\n  for x in xs:\n    total = total + x;\n  end;\n  print(f\"total: {total}\", \"ok\");\n  print(2.5 / 2);\n  return 0;\nend;";
            let (code, stdout) = run(source, &bare());
            assert_eq!(code, 0);
            assert_eq!(stdout, "total: 6 ok\n1.25\n");
        }

        #[test]
        fn top_level_code_and_library_calls() {
            let source = "for i in range(3):\n  print(i);\nend;\nprint(abs(-4), max(2, 9));";
            let (code, stdout) = run(source, &CompileOptions::bundled());
            assert_eq!(code, 0);
            assert_eq!(stdout, "0\n1\n2\n4 9\n");
        }
    }
}
