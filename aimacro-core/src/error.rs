use std::path::PathBuf;

use thiserror::Error;

use crate::diagnostic::{Diagnostic, render_all};
use crate::span::SourceMap;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to read source: {0}")]
    SourceIo(#[from] std::io::Error),
    #[error("library directory was not found at {0}")]
    MissingStdlib(PathBuf),
    #[error("{rendered}")]
    Compile {
        diagnostics: Vec<Diagnostic>,
        rendered: String,
    },
    #[error("failed to write {path}: {source}")]
    Emit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CoreError {
    pub fn compile(diagnostics: Vec<Diagnostic>, sources: &SourceMap) -> Self {
        let rendered = render_all(&diagnostics, sources);
        CoreError::Compile {
            diagnostics,
            rendered,
        }
    }

    /// Diagnostics carried by a failed compilation, empty for I/O failures.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        match self {
            CoreError::Compile { diagnostics, .. } => diagnostics,
            _ => &[],
        }
    }
}
