//! Linking and static ELF emission.
//!
//! The image has two `PT_LOAD` segments and no section headers:
//!
//! ```text
//! 0x400000  ELF header, program headers
//!           text: user functions, runtime routines, _start  (R+X)
//! next page data: globals, strings, runtime words           (R+W)
//! ```
//!
//! File offsets equal `vaddr - 0x400000`, so every segment is page
//! congruent without extra padding in memory.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;

use crate::assemble::{Relocation, assemble};
use crate::codegen::CompiledModule;
use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::error::CoreError;
use crate::runtime::{RUNTIME_DATA, START_SYMBOL, find_routine, start_stub};
use crate::span::Span;

pub const BASE_ADDRESS: u64 = 0x40_0000;
const PAGE_SIZE: u64 = 0x1000;
const ELF_HEADER_SIZE: usize = 64;
const PROGRAM_HEADER_SIZE: usize = 56;
const TEXT_ALIGN: usize = 16;

/// A linked executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub bytes: Vec<u8>,
    /// Address of every text and data symbol.
    pub symbols: BTreeMap<String, u64>,
    pub entry: u64,
}

struct Unit {
    name: String,
    code: Vec<u8>,
    relocations: Vec<Relocation>,
}

fn emit_error(message: impl Into<String>) -> Diagnostic {
    Diagnostic::error(DiagnosticKind::EmitError, message, Span::dummy())
}

fn align(value: usize, to: usize) -> usize {
    value.div_ceil(to) * to
}

/// Runtime routines reachable from `units`, assembled, sorted by name.
fn runtime_units(units: &[Unit], defined: &BTreeSet<String>) -> Result<Vec<Unit>, Vec<Diagnostic>> {
    let mut needed = BTreeSet::new();
    let mut queue: Vec<String> = units
        .iter()
        .flat_map(|u| u.relocations.iter().map(|r| r.symbol.clone()))
        .collect();
    let mut assembled = BTreeMap::new();
    while let Some(symbol) = queue.pop() {
        if defined.contains(&symbol) || needed.contains(&symbol) {
            continue;
        }
        let Some(routine) = find_routine(&symbol) else {
            continue;
        };
        needed.insert(symbol.clone());
        let out = routine
            .assemble()
            .map_err(|e| vec![emit_error(format!("runtime routine `{}`: {e}", routine.name))])?;
        queue.extend(out.relocations.iter().map(|r| r.symbol.clone()));
        assembled.insert(symbol, out);
    }
    Ok(assembled
        .into_iter()
        .map(|(name, out)| Unit {
            name,
            code: out.code,
            relocations: out.relocations,
        })
        .collect())
}

pub fn link(module: &CompiledModule) -> Result<Image, Vec<Diagnostic>> {
    let mut units: Vec<Unit> = module
        .functions
        .iter()
        .map(|f| Unit {
            name: f.name.clone(),
            code: f.code.clone(),
            relocations: f.relocations.clone(),
        })
        .collect();
    let stub = assemble(&start_stub(module.init.as_deref(), &module.entry))
        .map_err(|e| vec![emit_error(format!("entry stub: {e}"))])?;
    units.push(Unit {
        name: START_SYMBOL.to_string(),
        code: stub.code,
        relocations: stub.relocations,
    });

    let defined: BTreeSet<String> = units.iter().map(|u| u.name.clone()).collect();
    if defined.len() != units.len() {
        let mut seen = BTreeSet::new();
        let dup = units
            .iter()
            .find(|u| !seen.insert(u.name.as_str()))
            .map(|u| u.name.clone())
            .unwrap_or_default();
        return Err(vec![emit_error(format!("symbol `{dup}` is defined more than once"))]);
    }
    let runtime = runtime_units(&units, &defined)?;
    // Keep `_start` last: user functions, runtime, then the stub.
    let stub_unit = units.pop();
    units.extend(runtime);
    units.extend(stub_unit);
    log::debug!("linking {} text unit(s)", units.len());

    // Text layout.
    let mut data = module.data.clone();
    let mut data_symbols = module.data_symbols.clone();
    let referenced: BTreeSet<&str> = units
        .iter()
        .flat_map(|u| u.relocations.iter().map(|r| r.symbol.as_str()))
        .collect();
    for word in RUNTIME_DATA {
        if referenced.contains(word) {
            data_symbols.insert(word.to_string(), data.len());
            data.extend_from_slice(&[0; 8]);
        }
    }
    let phnum = if data.is_empty() { 1 } else { 2 };
    let header_size = ELF_HEADER_SIZE + PROGRAM_HEADER_SIZE * phnum;

    let mut text = vec![0u8; align(header_size, TEXT_ALIGN)];
    let mut symbols: BTreeMap<String, u64> = BTreeMap::new();
    let mut unit_offsets = Vec::with_capacity(units.len());
    for unit in &units {
        text.resize(align(text.len(), TEXT_ALIGN), 0xCC);
        unit_offsets.push(text.len());
        symbols.insert(unit.name.clone(), BASE_ADDRESS + text.len() as u64);
        text.extend_from_slice(&unit.code);
    }
    let text_end = text.len();
    let data_offset = align(text_end, PAGE_SIZE as usize);
    for (name, offset) in &data_symbols {
        if symbols.contains_key(name) {
            return Err(vec![emit_error(format!("symbol `{name}` is defined more than once"))]);
        }
        symbols.insert(name.clone(), BASE_ADDRESS + (data_offset + offset) as u64);
    }

    // Relocations.
    let mut errors = Vec::new();
    for (unit, &base) in units.iter().zip(&unit_offsets) {
        for reloc in &unit.relocations {
            let Some(&target) = symbols.get(&reloc.symbol) else {
                errors.push(Diagnostic::error(
                    DiagnosticKind::CodegenError,
                    format!("undefined symbol `{}` referenced from `{}`", reloc.symbol, unit.name),
                    Span::dummy(),
                ));
                continue;
            };
            let field = base + reloc.offset;
            let place = BASE_ADDRESS + field as u64;
            let value = target as i64 + reloc.addend - place as i64;
            match i32::try_from(value) {
                Ok(v) => text[field..field + 4].copy_from_slice(&v.to_le_bytes()),
                Err(_) => errors.push(emit_error(format!(
                    "relocation to `{}` is out of range",
                    reloc.symbol
                ))),
            }
        }
    }
    if !errors.is_empty() {
        return Err(errors);
    }

    let entry = symbols[START_SYMBOL];
    let mut bytes = text;
    write_headers(&mut bytes, entry, phnum, text_end, data_offset, data.len());
    if !data.is_empty() {
        bytes.resize(data_offset, 0);
        bytes.extend_from_slice(&data);
    }
    Ok(Image {
        bytes,
        symbols,
        entry,
    })
}

fn write_headers(
    bytes: &mut [u8],
    entry: u64,
    phnum: usize,
    text_size: usize,
    data_offset: usize,
    data_size: usize,
) {
    let mut header = Vec::with_capacity(ELF_HEADER_SIZE + PROGRAM_HEADER_SIZE * phnum);
    header.extend_from_slice(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0]);
    header.extend_from_slice(&[0; 8]);
    header.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    header.extend_from_slice(&0x3Eu16.to_le_bytes()); // x86-64
    header.extend_from_slice(&1u32.to_le_bytes());
    header.extend_from_slice(&entry.to_le_bytes());
    header.extend_from_slice(&(ELF_HEADER_SIZE as u64).to_le_bytes()); // phoff
    header.extend_from_slice(&0u64.to_le_bytes()); // shoff
    header.extend_from_slice(&0u32.to_le_bytes()); // flags
    header.extend_from_slice(&(ELF_HEADER_SIZE as u16).to_le_bytes());
    header.extend_from_slice(&(PROGRAM_HEADER_SIZE as u16).to_le_bytes());
    header.extend_from_slice(&(phnum as u16).to_le_bytes());
    header.extend_from_slice(&[0; 6]); // no section headers

    let mut segment = |flags: u32, offset: usize, size: usize| {
        header.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        header.extend_from_slice(&flags.to_le_bytes());
        header.extend_from_slice(&(offset as u64).to_le_bytes());
        let vaddr = BASE_ADDRESS + offset as u64;
        header.extend_from_slice(&vaddr.to_le_bytes());
        header.extend_from_slice(&vaddr.to_le_bytes());
        header.extend_from_slice(&(size as u64).to_le_bytes());
        header.extend_from_slice(&(size as u64).to_le_bytes());
        header.extend_from_slice(&PAGE_SIZE.to_le_bytes());
    };
    segment(5, 0, text_size);
    if phnum > 1 {
        segment(6, data_offset, data_size);
    }
    bytes[..header.len()].copy_from_slice(&header);
}

/// Write `image` to `path` atomically and mark it executable.
pub fn write_image(path: &Path, image: &Image) -> Result<(), CoreError> {
    let emit_err = |source: std::io::Error| CoreError::Emit {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(emit_err)?;
    file.write_all(&image.bytes).map_err(emit_err)?;
    file.flush().map_err(emit_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        file.as_file().set_permissions(perms).map_err(emit_err)?;
    }
    file.persist(path).map_err(|e| emit_err(e.error))?;
    log::debug!("wrote {} bytes to {}", image.bytes.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::generate;
    use crate::ir_text::parse_module;

    fn link_text(text: &str) -> Result<Image, Vec<Diagnostic>> {
        let module = generate(&parse_module(text).expect("parse")).expect("generate");
        link(&module)
    }

    fn u16_at(bytes: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([bytes[at], bytes[at + 1]])
    }

    fn u64_at(bytes: &[u8], at: usize) -> u64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[at..at + 8]);
        u64::from_le_bytes(word)
    }

    #[test]
    fn header_fields() {
        let image = link_text("entry @main\nfunc @main() -> i64 {\n  ret 3\n}").expect("link");
        let b = &image.bytes;
        assert_eq!(&b[..4], b"\x7fELF");
        assert_eq!(b[4], 2);
        assert_eq!(u16_at(b, 16), 2);
        assert_eq!(u16_at(b, 18), 0x3E);
        assert_eq!(u64_at(b, 24), image.entry);
        assert_eq!(u16_at(b, 56), 1, "no data segment");
        assert_eq!(image.symbols["main"], BASE_ADDRESS + 0x80);
        assert_eq!(image.entry, image.symbols["_start"]);
        assert!(image.entry > image.symbols["main"]);
        // Text segment covers the whole file.
        assert_eq!(u64_at(b, 64 + 32), b.len() as u64);
    }

    #[test]
    fn data_segment_and_runtime_words() {
        let image = link_text(
            "entry @main\nstring @str.0 = \"hi\"\nfunc @main() -> i64 {\n  call @__aim_print_str(@str.0)\n  ret 0\n}",
        )
        .expect("link");
        let b = &image.bytes;
        assert_eq!(u16_at(b, 56), 2);
        let data_ph = 64 + 56;
        let data_offset = u64_at(b, data_ph + 8);
        assert_eq!(data_offset % PAGE_SIZE, 0);
        assert_eq!(u64_at(b, data_ph + 16), BASE_ADDRESS + data_offset);
        assert_eq!(image.symbols["str.0"], BASE_ADDRESS + data_offset);
        assert!(image.symbols.contains_key("__aim_print_str"));
        assert!(image.symbols.contains_key("__aim_write"));
        // print does not allocate.
        assert!(!image.symbols.contains_key("__aim_heap.ptr"));
        assert!(!image.symbols.contains_key("__aim_alloc"));
    }

    #[test]
    fn relocations_point_at_their_targets() {
        let image = link_text(
            "entry @main\nfunc @main() -> i64 {\n  var %r: i64\n  %r = call @one()\n  ret %r\n}\nfunc @one() -> i64 {\n  ret 1\n}",
        )
        .expect("link");
        let main = (image.symbols["main"] - BASE_ADDRESS) as usize;
        let call_at = image.bytes[main..]
            .iter()
            .position(|&b| b == 0xE8)
            .expect("call")
            + main;
        let rel = i32::from_le_bytes([
            image.bytes[call_at + 1],
            image.bytes[call_at + 2],
            image.bytes[call_at + 3],
            image.bytes[call_at + 4],
        ]);
        let next = BASE_ADDRESS + call_at as u64 + 5;
        assert_eq!((next as i64 + rel as i64) as u64, image.symbols["one"]);
    }

    #[test]
    fn undefined_symbols_are_codegen_errors() {
        let errs = link_text("entry @main\nfunc @main() -> i64 {\n  call @nowhere()\n  ret 0\n}")
            .expect_err("undefined");
        assert_eq!(errs[0].kind, DiagnosticKind::CodegenError);
        assert!(errs[0].message.contains("nowhere"));
    }

    #[test]
    fn duplicate_symbols_are_rejected() {
        let errs = link_text("entry @main\nfunc @main() -> i64 {\n  ret 0\n}\nfunc @_start() -> i64 {\n  ret 0\n}")
            .expect_err("duplicate");
        assert!(errs[0].message.contains("_start"));
    }

    #[test]
    fn linking_is_deterministic() {
        let text = "entry @main\nstring @str.0 = \"x\"\nfunc @main() -> i64 {\n  var %s: ptr\n  %s = call @__aim_str_concat(@str.0, @str.0)\n  call @__aim_print_str(%s)\n  ret 0\n}";
        assert_eq!(link_text(text).expect("link"), link_text(text).expect("link"));
    }

    #[test]
    fn image_is_written_executable() {
        let image = link_text("entry @main\nfunc @main() -> i64 {\n  ret 0\n}").expect("link");
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out");
        write_image(&path, &image).expect("write");
        assert_eq!(std::fs::read(&path).expect("read"), image.bytes);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }
}
