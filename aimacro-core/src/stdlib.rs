use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::CoreError;

/// Extension of library units.
pub const LIBRARY_EXTENSION: &str = "aim";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdlibFile {
    /// Path relative to the library root.
    pub path: PathBuf,
    pub contents: String,
}

pub fn default_stdlib_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../stdlib")
}

/// Every `*.aim` file under `root`, sorted by relative path.
pub fn load_stdlib_files(root: impl AsRef<Path>) -> Result<Vec<StdlibFile>, CoreError> {
    let root = root.as_ref();
    if !root.is_dir() {
        return Err(CoreError::MissingStdlib(root.to_path_buf()));
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| match e.into_io_error() {
            Some(io) => CoreError::SourceIo(io),
            None => CoreError::MissingStdlib(root.to_path_buf()),
        })?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().is_some_and(|ext| ext == LIBRARY_EXTENSION) {
            let contents = fs::read_to_string(path)?;
            let relative = path.strip_prefix(root).unwrap_or(path).to_path_buf();
            files.push(StdlibFile {
                path: relative,
                contents,
            });
        }
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    log::debug!("loaded {} library unit(s) from {}", files.len(), root.display());
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_files_from_default_root() {
        let files = load_stdlib_files(default_stdlib_root()).expect("stdlib should load");
        assert!(!files.is_empty());
        assert!(files.iter().all(|f| f.path.extension().is_some_and(|e| e == "aim")));
    }

    #[test]
    fn walks_nested_directories_in_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("b")).expect("mkdir");
        fs::write(dir.path().join("b/inner.aim"), "def g(): return 2; end;").expect("write");
        fs::write(dir.path().join("a.aim"), "def f(): return 1; end;").expect("write");
        fs::write(dir.path().join("notes.txt"), "ignored").expect("write");
        let files = load_stdlib_files(dir.path()).expect("load");
        let paths: Vec<PathBuf> = files.into_iter().map(|f| f.path).collect();
        assert_eq!(paths, vec![PathBuf::from("a.aim"), PathBuf::from("b/inner.aim")]);
    }

    #[test]
    fn missing_root_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope");
        match load_stdlib_files(&missing) {
            Err(CoreError::MissingStdlib(path)) => assert_eq!(path, missing),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
