//! Source positions.
//!
//! A `Span` is a half-open byte range inside one source file. Spans are
//! plain `Copy` values; turning them into `file:line:col` text requires the
//! `SourceMap` that owns the file contents.

use std::fmt;

/// Identifier of a source file registered in a [`SourceMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FileId(pub u32);

impl FileId {
    /// Marker for spans that do not point into any file (linker output etc).
    pub const NONE: FileId = FileId(u32::MAX);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Span {
    pub file: FileId,
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(file: FileId, start: u32, end: u32) -> Self {
        Span { file, start, end }
    }

    pub fn dummy() -> Self {
        Span::new(FileId::NONE, 0, 0)
    }

    pub fn is_dummy(&self) -> bool {
        self.file == FileId::NONE
    }

    /// Smallest span covering both `self` and `other`.
    pub fn join(self, other: Span) -> Span {
        if self.is_dummy() {
            return other;
        }
        if other.is_dummy() || other.file != self.file {
            return self;
        }
        Span::new(self.file, self.start.min(other.start), self.end.max(other.end))
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slice the covered text out of `source`.
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        source
            .get(self.start as usize..self.end as usize)
            .unwrap_or_default()
    }
}

/// Resolved human-readable position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[derive(Debug, Clone)]
struct SourceFile {
    name: String,
    text: String,
    line_starts: Vec<u32>,
}

/// Owns every source text of one compilation.
#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    files: Vec<SourceFile>,
}

impl SourceMap {
    pub fn new() -> Self {
        SourceMap { files: Vec::new() }
    }

    pub fn add(&mut self, name: impl Into<String>, text: impl Into<String>) -> FileId {
        let text = text.into();
        let mut line_starts = vec![0];
        for (i, b) in text.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i as u32 + 1);
            }
        }
        let id = FileId(self.files.len() as u32);
        self.files.push(SourceFile {
            name: name.into(),
            text,
            line_starts,
        });
        id
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = FileId> + '_ {
        (0..self.files.len() as u32).map(FileId)
    }

    pub fn name(&self, id: FileId) -> Option<&str> {
        self.files.get(id.0 as usize).map(|f| f.name.as_str())
    }

    pub fn text(&self, id: FileId) -> Option<&str> {
        self.files.get(id.0 as usize).map(|f| f.text.as_str())
    }

    /// 1-based line and column of the start of `span`.
    pub fn locate(&self, span: Span) -> Option<Location> {
        let file = self.files.get(span.file.0 as usize)?;
        let line_idx = match file.line_starts.binary_search(&span.start) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let line_start = file.line_starts[line_idx] as usize;
        let upto = file.text.get(line_start..span.start as usize).unwrap_or("");
        Some(Location {
            file: file.name.clone(),
            line: line_idx + 1,
            column: upto.chars().count() + 1,
        })
    }

    /// Full text of the line holding the start of `span`.
    pub fn line_text(&self, span: Span) -> Option<&str> {
        let file = self.files.get(span.file.0 as usize)?;
        let line_idx = match file.line_starts.binary_search(&span.start) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let start = file.line_starts[line_idx] as usize;
        let end = file
            .line_starts
            .get(line_idx + 1)
            .map(|e| *e as usize - 1)
            .unwrap_or(file.text.len());
        file.text.get(start..end).map(|l| l.trim_end_matches('\r'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locates_line_and_column() {
        let mut map = SourceMap::new();
        let id = map.add("main.aim", "x = 1;\ny = x + 2;\n");
        let loc = map.locate(Span::new(id, 11, 12)).expect("location");
        assert_eq!(loc.to_string(), "main.aim:2:5");
        assert_eq!(map.line_text(Span::new(id, 11, 12)), Some("y = x + 2;"));
    }

    #[test]
    fn join_covers_both_spans() {
        let a = Span::new(FileId(0), 4, 6);
        let b = Span::new(FileId(0), 1, 3);
        assert_eq!(a.join(b), Span::new(FileId(0), 1, 6));
        assert_eq!(Span::dummy().join(a), a);
    }
}
