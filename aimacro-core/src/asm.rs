//! Parser for Intel-syntax assembly text.
//!
//! Used for `asm { }` payloads (after placeholder substitution) and for
//! the hand written runtime routines. One instruction per line, labels
//! end with `:`, comments start with `;`, `#` or `//`.

use crate::x86_64::{AluOp, AsmError, Cond, MachInst, Mem, Reg, ShiftOp, SseOp, UnaryOp, Xmm};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Size {
    Byte,
    Qword,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Arg {
    Reg(Reg),
    Reg8(Reg),
    Xmm(Xmm),
    Imm(i64),
    Mem(Mem, Option<Size>),
    Sym(String),
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '$')
}

fn strip_comment(line: &str) -> &str {
    let mut end = line.len();
    for marker in [";", "#", "//"] {
        if let Some(i) = line.find(marker) {
            end = end.min(i);
        }
    }
    &line[..end]
}

pub fn parse_asm(text: &str) -> Result<Vec<MachInst>, AsmError> {
    let mut out = Vec::new();
    for (index, raw_line) in text.lines().enumerate() {
        let line_no = index + 1;
        let err = |message: String| AsmError::Syntax {
            line: line_no,
            message,
        };
        let mut line = strip_comment(raw_line).trim();

        // Leading labels, possibly several, possibly followed by an instruction.
        while let Some(colon) = line.find(':') {
            let name = line[..colon].trim();
            if name.is_empty() || !name.chars().all(is_ident_char) {
                break;
            }
            out.push(MachInst::Label(name.to_string()));
            line = line[colon + 1..].trim();
        }
        if line.is_empty() {
            continue;
        }

        let lower = line.to_ascii_lowercase();
        let (mnemonic, rest) = match lower.find(char::is_whitespace) {
            Some(i) => (&lower[..i], lower[i..].trim()),
            None => (lower.as_str(), ""),
        };
        // Symbols keep their original case.
        let rest_original = match line.find(char::is_whitespace) {
            Some(i) => line[i..].trim(),
            None => "",
        };
        let args = split_args(rest_original)
            .into_iter()
            .map(|a| parse_arg(a).map_err(&err))
            .collect::<Result<Vec<_>, _>>()?;
        out.push(select(mnemonic, rest, args).map_err(&err)?);
    }
    Ok(out)
}

fn split_args(text: &str) -> Vec<&str> {
    if text.is_empty() {
        return Vec::new();
    }
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(text[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(text[start..].trim());
    parts
}

fn parse_int(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest.trim()),
        None => (false, text),
    };
    let value = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        u64::from_str_radix(&hex.replace('_', ""), 16).ok()? as i64
    } else if let Some(bin) = digits.strip_prefix("0b") {
        u64::from_str_radix(&bin.replace('_', ""), 2).ok()? as i64
    } else if digits.len() == 3 && digits.starts_with('\'') && digits.ends_with('\'') {
        digits.as_bytes()[1] as i64
    } else {
        digits.replace('_', "").parse::<i64>().ok()?
    };
    Some(if negative { value.wrapping_neg() } else { value })
}

fn parse_arg(text: &str) -> Result<Arg, String> {
    let lower = text.to_ascii_lowercase();
    let mut size = None;
    let mut body = text;
    for (prefix, s) in [("qword ptr", Size::Qword), ("byte ptr", Size::Byte), ("qword", Size::Qword), ("byte", Size::Byte)] {
        if lower.starts_with(prefix) && text[prefix.len()..].trim_start().starts_with('[') {
            size = Some(s);
            body = text[prefix.len()..].trim();
            break;
        }
    }
    if lower.starts_with("dword") || lower.starts_with("word") {
        return Err(format!("operand size in `{text}` is not supported"));
    }
    if body.starts_with('[') {
        let inner = body
            .strip_prefix('[')
            .and_then(|b| b.strip_suffix(']'))
            .ok_or_else(|| format!("unterminated memory operand `{text}`"))?;
        return parse_mem(inner).map(|m| Arg::Mem(m, size));
    }
    let name = lower.trim();
    if let Some(r) = Reg::parse(name) {
        return Ok(Arg::Reg(r));
    }
    if let Some(r) = Reg::parse_byte(name) {
        return Ok(Arg::Reg8(r));
    }
    if let Some(x) = Xmm::parse(name) {
        return Ok(Arg::Xmm(x));
    }
    if let Some(v) = parse_int(text.trim()) {
        return Ok(Arg::Imm(v));
    }
    let sym = text.trim();
    if !sym.is_empty() && sym.chars().all(is_ident_char) {
        return Ok(Arg::Sym(sym.to_string()));
    }
    Err(format!("cannot parse operand `{text}`"))
}

fn parse_mem(inner: &str) -> Result<Mem, String> {
    let mut base: Option<Reg> = None;
    let mut index: Option<(Reg, u8)> = None;
    let mut disp: i64 = 0;
    let mut symbol: Option<String> = None;
    let mut rip = false;

    // Split into signed terms.
    let mut terms: Vec<(bool, String)> = Vec::new();
    let mut current = String::new();
    let mut negative = false;
    for c in inner.chars() {
        if c == '+' || c == '-' {
            if !current.trim().is_empty() {
                terms.push((negative, current.trim().to_string()));
            }
            current.clear();
            negative = c == '-';
        } else {
            current.push(c);
        }
    }
    if !current.trim().is_empty() {
        terms.push((negative, current.trim().to_string()));
    }

    for (negative, term) in terms {
        let lower = term.to_ascii_lowercase();
        if lower == "rip" {
            rip = true;
            continue;
        }
        if let Some((a, b)) = lower.split_once('*') {
            let (reg, scale) = match (Reg::parse(a.trim()), Reg::parse(b.trim())) {
                (Some(r), None) => (r, b.trim()),
                (None, Some(r)) => (r, a.trim()),
                _ => return Err(format!("invalid scaled index `{term}`")),
            };
            let scale: u8 = scale.parse().map_err(|_| format!("invalid scale in `{term}`"))?;
            if negative || index.is_some() {
                return Err(format!("invalid index in `[{inner}]`"));
            }
            index = Some((reg, scale));
            continue;
        }
        if let Some(reg) = Reg::parse(&lower) {
            if negative {
                return Err(format!("register `{term}` cannot be subtracted"));
            }
            if base.is_none() {
                base = Some(reg);
            } else if index.is_none() {
                index = Some((reg, 1));
            } else {
                return Err(format!("too many registers in `[{inner}]`"));
            }
            continue;
        }
        if let Some(v) = parse_int(&term) {
            disp += if negative { -v } else { v };
            continue;
        }
        if term.chars().all(is_ident_char) && !negative && symbol.is_none() {
            symbol = Some(term);
            continue;
        }
        return Err(format!("cannot parse `{term}` in memory operand"));
    }

    if let Some(sym) = symbol {
        if base.is_some() || index.is_some() || disp != 0 {
            return Err(format!("symbol `{sym}` can only be addressed rip-relative"));
        }
        return Ok(Mem::Rip(sym));
    }
    if rip {
        return Err("rip-relative operand needs a symbol".to_string());
    }
    let disp = i32::try_from(disp).map_err(|_| format!("displacement {disp} does not fit in 32 bits"))?;
    match (base, index) {
        (Some(base), index) => Ok(Mem::Base { base, index, disp }),
        (None, Some((reg, 1))) => Ok(Mem::Base {
            base: reg,
            index: None,
            disp,
        }),
        _ => Err(format!("memory operand `[{inner}]` has no base register")),
    }
}

fn imm32(v: i64) -> Result<i32, String> {
    i32::try_from(v).map_err(|_| format!("immediate {v} does not fit in 32 bits"))
}

fn select(mnemonic: &str, rest: &str, args: Vec<Arg>) -> Result<MachInst, String> {
    use Arg as A;
    let bad = || format!("unsupported operands for `{mnemonic}`");

    if let Some(op) = AluOp::parse(mnemonic) {
        return match args.as_slice() {
            [A::Reg(d), A::Reg(s)] => Ok(MachInst::Alu(op, *d, *s)),
            [A::Reg(d), A::Imm(i)] => Ok(MachInst::AluRI(op, *d, imm32(*i)?)),
            [A::Reg(d), A::Mem(m, _)] => Ok(MachInst::AluRM(op, *d, m.clone())),
            [A::Mem(m, _), A::Reg(s)] => Ok(MachInst::AluMR(op, m.clone(), *s)),
            [A::Mem(m, Some(Size::Qword)), A::Imm(i)] => Ok(MachInst::AluMI(op, m.clone(), imm32(*i)?)),
            _ => Err(bad()),
        };
    }
    if let Some(op) = ShiftOp::parse(mnemonic) {
        return match args.as_slice() {
            [A::Reg(r), A::Imm(n)] if (0..64).contains(n) => Ok(MachInst::Shift(op, *r, *n as u8)),
            [A::Reg(r), A::Reg8(Reg::Rcx)] => Ok(MachInst::ShiftCl(op, *r)),
            _ => Err(bad()),
        };
    }
    if let Some(op) = UnaryOp::parse(mnemonic) {
        return match args.as_slice() {
            [A::Reg(r)] => Ok(MachInst::Unary(op, *r)),
            _ => Err(bad()),
        };
    }
    if let Some(op) = SseOp::parse(mnemonic) {
        return match args.as_slice() {
            [A::Xmm(d), A::Xmm(s)] => Ok(MachInst::Sse(op, *d, *s)),
            _ => Err(bad()),
        };
    }

    match (mnemonic, args.as_slice()) {
        ("mov", [A::Reg(d), A::Reg(s)]) => Ok(MachInst::MovRR(*d, *s)),
        ("mov" | "movabs", [A::Reg(d), A::Imm(i)]) => Ok(MachInst::MovRI(*d, *i)),
        ("mov", [A::Reg(d), A::Mem(m, None | Some(Size::Qword))]) => Ok(MachInst::MovRM(*d, m.clone())),
        ("mov", [A::Mem(m, None | Some(Size::Qword)), A::Reg(s)]) => Ok(MachInst::MovMR(m.clone(), *s)),
        ("mov", [A::Mem(m, Some(Size::Qword)), A::Imm(i)]) => Ok(MachInst::MovMI(m.clone(), imm32(*i)?)),
        ("mov", [A::Mem(m, None | Some(Size::Byte)), A::Reg8(s)]) => Ok(MachInst::MovByteMR(m.clone(), *s)),
        ("mov", [A::Mem(m, Some(Size::Byte)), A::Imm(i)]) => Ok(MachInst::MovByteMI(m.clone(), *i as u8)),
        ("movzx", [A::Reg(d), A::Mem(m, Some(Size::Byte))]) => Ok(MachInst::MovzxRM8(*d, m.clone())),
        ("movzx", [A::Reg(d), A::Reg8(s)]) => Ok(MachInst::MovzxRR8(*d, *s)),
        ("lea", [A::Reg(d), A::Mem(m, _)]) => Ok(MachInst::Lea(*d, m.clone())),
        ("imul", [A::Reg(d), A::Reg(s)]) => Ok(MachInst::Imul(*d, *s)),
        ("test", [A::Reg(a), A::Reg(b)]) => Ok(MachInst::Test(*a, *b)),
        ("push", [A::Reg(r)]) => Ok(MachInst::Push(*r)),
        ("pop", [A::Reg(r)]) => Ok(MachInst::Pop(*r)),
        ("jmp", [A::Sym(t)]) => Ok(MachInst::Jmp(t.clone())),
        ("call", [A::Sym(t)]) => Ok(MachInst::Call(t.clone())),
        ("cqo", []) => Ok(MachInst::Cqo),
        ("ret", []) => Ok(MachInst::Ret),
        ("syscall", []) => Ok(MachInst::Syscall),
        ("nop", []) => Ok(MachInst::Nop),
        ("rep", _) if rest == "movsb" => Ok(MachInst::RepMovsb),
        ("rep", _) if rest == "stosb" => Ok(MachInst::RepStosb),
        ("movq", [A::Xmm(x), A::Reg(r)]) => Ok(MachInst::MovqXR(*x, *r)),
        ("movq", [A::Reg(r), A::Xmm(x)]) => Ok(MachInst::MovqRX(*r, *x)),
        ("ucomisd", [A::Xmm(a), A::Xmm(b)]) => Ok(MachInst::Ucomisd(*a, *b)),
        ("cvtsi2sd", [A::Xmm(x), A::Reg(r)]) => Ok(MachInst::Cvtsi2sd(*x, *r)),
        ("cvttsd2si", [A::Reg(r), A::Xmm(x)]) => Ok(MachInst::Cvttsd2si(*r, *x)),
        ("cvtsd2si", [A::Reg(r), A::Xmm(x)]) => Ok(MachInst::Cvtsd2si(*r, *x)),
        _ => {
            if let Some(cond) = mnemonic.strip_prefix("set").and_then(Cond::parse) {
                return match args.as_slice() {
                    [A::Reg8(r)] => Ok(MachInst::Setcc(cond, *r)),
                    _ => Err(bad()),
                };
            }
            if let Some(cond) = mnemonic.strip_prefix("cmov").and_then(Cond::parse) {
                return match args.as_slice() {
                    [A::Reg(d), A::Reg(s)] => Ok(MachInst::Cmov(cond, *d, *s)),
                    _ => Err(bad()),
                };
            }
            if let Some(cond) = mnemonic.strip_prefix('j').and_then(Cond::parse) {
                return match args.as_slice() {
                    [A::Sym(t)] => Ok(MachInst::Jcc(cond, t.clone())),
                    _ => Err(bad()),
                };
            }
            if matches!(
                mnemonic,
                "mov" | "movabs" | "movzx" | "lea" | "imul" | "test" | "push" | "pop" | "jmp" | "call"
                    | "cqo" | "ret" | "syscall" | "nop" | "rep" | "movq" | "ucomisd" | "cvtsi2sd"
                    | "cvttsd2si" | "cvtsd2si"
            ) {
                Err(bad())
            } else {
                Err(format!("unknown instruction `{mnemonic}`"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_labels_comments_and_case() {
        let insts = parse_asm(
            "start:  ; entry\n  MOV RAX, 60   # exit\n  xor rdi, rdi // status\n.done: syscall\n",
        )
        .expect("parse");
        assert_eq!(
            insts,
            vec![
                MachInst::Label("start".into()),
                MachInst::MovRI(Reg::Rax, 60),
                MachInst::Alu(AluOp::Xor, Reg::Rdi, Reg::Rdi),
                MachInst::Label(".done".into()),
                MachInst::Syscall,
            ]
        );
    }

    #[test]
    fn memory_operands() {
        let insts = parse_asm(
            "mov rax, qword ptr [rbp - 8]\nmov [rdi + rcx*8 + 16], rax\nlea rsi, [rip + str.0]\nmov byte ptr [rdi], 0x2d\nmovzx rax, byte ptr [rsi + rcx]",
        )
        .expect("parse");
        assert_eq!(insts[0], MachInst::MovRM(Reg::Rax, Mem::base(Reg::Rbp, -8)));
        assert_eq!(
            insts[1],
            MachInst::MovMR(
                Mem::Base {
                    base: Reg::Rdi,
                    index: Some((Reg::Rcx, 8)),
                    disp: 16
                },
                Reg::Rax
            )
        );
        assert_eq!(insts[2], MachInst::Lea(Reg::Rsi, Mem::Rip("str.0".into())));
        assert_eq!(insts[3], MachInst::MovByteMI(Mem::base(Reg::Rdi, 0), 0x2d));
        assert!(matches!(insts[4], MachInst::MovzxRM8(Reg::Rax, Mem::Base { index: Some((Reg::Rcx, 1)), .. })));
    }

    #[test]
    fn conditional_forms() {
        let insts = parse_asm("jnz .loop\nsetle al\ncmovl rax, rcx\nshl rax, cl").expect("parse");
        assert_eq!(insts[0], MachInst::Jcc(Cond::Ne, ".loop".into()));
        assert_eq!(insts[1], MachInst::Setcc(Cond::Le, Reg::Rax));
        assert_eq!(insts[2], MachInst::Cmov(Cond::L, Reg::Rax, Reg::Rcx));
        assert_eq!(insts[3], MachInst::ShiftCl(ShiftOp::Shl, Reg::Rax));
    }

    #[test]
    fn listing_reads_back() {
        let insts = parse_asm("mov qword ptr [rbp - 16], rbx\ncvtsi2sd xmm0, rax\nrep movsb\nmovabs rax, 4611686018427387904")
            .expect("parse");
        let text: Vec<String> = insts.iter().map(ToString::to_string).collect();
        assert_eq!(parse_asm(&text.join("\n")).expect("reparse"), insts);
    }

    #[test]
    fn errors_carry_line_numbers() {
        let err = parse_asm("nop\nfrobnicate rax").expect_err("unknown");
        assert_eq!(
            err,
            AsmError::Syntax {
                line: 2,
                message: "unknown instruction `frobnicate`".into()
            }
        );
        assert!(parse_asm("mov rax, dword ptr [rax]").is_err());
        assert!(parse_asm("mov rax, rbx, rcx").is_err());
        assert!(parse_asm("add rax, 0x100000000").is_err());
    }
}
