//! Core of the AIMacro ahead-of-time compiler.
//!
//! AIMacro keeps Python's statement and expression syntax but closes every
//! block with `end;`, and lets source embed IR text (`ailang { }`) or raw
//! x86-64 instructions (`asm { }`). The pipeline is:
//!
//!   source .aim (+ library units)
//!     -> lexer        (tokens)
//!     -> parser       (AST, explicit block matching)
//!     -> name_resolve + typecheck (types + HIR)
//!     -> lower        (typed IR, `ailang` blocks spliced in)
//!     -> codegen      (linear-scan allocation, x86-64 encoding)
//!     -> emit         (runtime routines, static ELF64 image)
//!
//! The CLI, and anything else that drives the compiler, should go through
//! [`compiler`] rather than calling the stages directly.

// ---------------------------------------------------------------------
// Error handling and diagnostics
// ---------------------------------------------------------------------

pub mod span;
pub mod diagnostic;
pub mod error;

// ---------------------------------------------------------------------
// Front-end: lexing and parsing
// ---------------------------------------------------------------------

pub mod lexer;
pub mod parser;
pub mod ast;

// ---------------------------------------------------------------------
// Semantic layers: types, name resolution, type checking, HIR
// ---------------------------------------------------------------------

pub mod types;
pub mod name_resolve;
pub mod typecheck;
pub mod hir;

// ---------------------------------------------------------------------
// Builtins and stdlib integration
// ---------------------------------------------------------------------

pub mod builtins;
pub mod stdlib;

// ---------------------------------------------------------------------
// Middle: IR and lowering
// ---------------------------------------------------------------------

pub mod ir;
pub mod ir_text;
pub mod lower;

// ---------------------------------------------------------------------
// Back-end: machine code, runtime, emission and orchestration
// ---------------------------------------------------------------------

pub mod x86_64;
pub mod asm;
pub mod assemble;
pub mod regalloc;
pub mod codegen;
pub mod runtime;
pub mod emit;
pub mod compiler;

// ---------------------------------------------------------------------
// Public API re-exports
// ---------------------------------------------------------------------

pub use compiler::{CompilationArtifact, CompileOptions, compile_file, compile_source, emit_asm, emit_ir};
pub use diagnostic::{Diagnostic, DiagnosticKind};
pub use emit::{Image, write_image};
pub use error::CoreError;
