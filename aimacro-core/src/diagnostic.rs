//! Diagnostics shared by every compiler stage.

use std::fmt;

use crate::span::{SourceMap, Span};

/// Pipeline stage that owns a diagnostic kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Lex,
    Parse,
    Resolve,
    Lower,
    Codegen,
    Emit,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Lex => "lexing",
            Stage::Parse => "parsing",
            Stage::Resolve => "resolution",
            Stage::Lower => "lowering",
            Stage::Codegen => "code generation",
            Stage::Emit => "emission",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticKind {
    LexError,
    ParseError,
    UnboundNameError,
    TypeConflictError,
    LoweringError,
    CodegenError,
    EmitError,
}

impl DiagnosticKind {
    pub fn stage(self) -> Stage {
        match self {
            DiagnosticKind::LexError => Stage::Lex,
            DiagnosticKind::ParseError => Stage::Parse,
            DiagnosticKind::UnboundNameError | DiagnosticKind::TypeConflictError => Stage::Resolve,
            DiagnosticKind::LoweringError => Stage::Lower,
            DiagnosticKind::CodegenError => Stage::Codegen,
            DiagnosticKind::EmitError => Stage::Emit,
        }
    }

    /// Stable code printed next to the severity.
    pub fn code(self) -> &'static str {
        match self {
            DiagnosticKind::LexError => "E0101",
            DiagnosticKind::ParseError => "E0201",
            DiagnosticKind::UnboundNameError => "E0301",
            DiagnosticKind::TypeConflictError => "E0302",
            DiagnosticKind::LoweringError => "E0401",
            DiagnosticKind::CodegenError => "E0501",
            DiagnosticKind::EmitError => "E0601",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DiagnosticKind::LexError => "LexError",
            DiagnosticKind::ParseError => "ParseError",
            DiagnosticKind::UnboundNameError => "UnboundNameError",
            DiagnosticKind::TypeConflictError => "TypeConflictError",
            DiagnosticKind::LoweringError => "LoweringError",
            DiagnosticKind::CodegenError => "CodegenError",
            DiagnosticKind::EmitError => "EmitError",
        }
    }
}

impl fmt::Display for DiagnosticKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub severity: Severity,
    pub message: String,
    pub span: Span,
    pub notes: Vec<String>,
}

impl Diagnostic {
    pub fn error(kind: DiagnosticKind, message: impl Into<String>, span: Span) -> Self {
        Diagnostic {
            kind,
            severity: Severity::Error,
            message: message.into(),
            span,
            notes: Vec::new(),
        }
    }

    pub fn warning(kind: DiagnosticKind, message: impl Into<String>, span: Span) -> Self {
        Diagnostic {
            severity: Severity::Warning,
            ..Diagnostic::error(kind, message, span)
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// Render with file position and the offending source line.
    pub fn render(&self, sources: &SourceMap) -> String {
        let mut out = self.to_string();
        if let Some(loc) = sources.locate(self.span) {
            out.push_str(&format!("\n  --> {loc}"));
            if let Some(line) = sources.line_text(self.span) {
                let caret_pad = " ".repeat(loc.column.saturating_sub(1));
                let width = (self.span.len() as usize).clamp(1, line.len().max(1));
                out.push_str(&format!("\n   | {line}\n   | {caret_pad}{}", "^".repeat(width)));
            }
        }
        for note in &self.notes {
            out.push_str(&format!("\n   = note: {note}"));
        }
        out
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(
            f,
            "{severity}[{}] {}: {}",
            self.kind.code(),
            self.kind.name(),
            self.message
        )
    }
}

pub fn has_errors(diagnostics: &[Diagnostic]) -> bool {
    diagnostics.iter().any(Diagnostic::is_error)
}

pub fn render_all(diagnostics: &[Diagnostic], sources: &SourceMap) -> String {
    diagnostics
        .iter()
        .map(|d| d.render(sources))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_kind_code_and_position() {
        let mut map = SourceMap::new();
        let id = map.add("main.aim", "def f(): return x; end;");
        let diag = Diagnostic::error(
            DiagnosticKind::UnboundNameError,
            "name `x` is not defined",
            Span::new(id, 16, 17),
        );
        let text = diag.render(&map);
        assert!(text.starts_with("error[E0301] UnboundNameError: name `x` is not defined"));
        assert!(text.contains("--> main.aim:1:17"));
    }

    #[test]
    fn warnings_do_not_count_as_errors() {
        let warn = Diagnostic::warning(DiagnosticKind::TypeConflictError, "mixed list", Span::dummy());
        assert!(!has_errors(&[warn.clone()]));
        assert_eq!(DiagnosticKind::CodegenError.stage(), Stage::Codegen);
        assert!(has_errors(&[warn, Diagnostic::error(DiagnosticKind::ParseError, "x", Span::dummy())]));
    }
}
