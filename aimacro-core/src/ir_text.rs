//! Reader for the IR text form.
//!
//! Accepts exactly what the `Display` impls in [`crate::ir`] print, plus
//! comments (`#` to end of line) and `;` as an alternative line break so
//! that short `ailang { ... }` blocks fit on one line.

use thiserror::Error;

use crate::ir::{
    BinOpKind, Instr, IrFunction, IrGlobal, IrModule, IrType, IrVar, Operand, Place, UnOpKind,
};
use crate::span::Span;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {message}")]
pub struct IrParseError {
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Word(String),
    Var(String),
    Global(String),
    Int(i64),
    Float(f64),
    Str(String),
    Punct(char),
    Arrow,
    Newline,
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Word(w) => format!("`{w}`"),
            Tok::Var(v) => format!("`%{v}`"),
            Tok::Global(g) => format!("`@{g}`"),
            Tok::Int(v) => format!("`{v}`"),
            Tok::Float(v) => format!("`{v:?}`"),
            Tok::Str(_) => "string".to_string(),
            Tok::Punct(c) => format!("`{c}`"),
            Tok::Arrow => "`->`".to_string(),
            Tok::Newline => "end of line".to_string(),
        }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '$')
}

fn tokenize(text: &str) -> Result<Vec<(Tok, usize)>, IrParseError> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = Vec::new();
    let mut line = 1;
    let mut i = 0;
    let err = |line: usize, message: String| IrParseError { line, message };

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' | ';' => {
                out.push((Tok::Newline, line));
                if c == '\n' {
                    line += 1;
                }
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '%' | '@' => {
                let start = i + 1;
                i = start;
                while i < chars.len() && is_name_char(chars[i]) {
                    i += 1;
                }
                if i == start {
                    return Err(err(line, format!("expected a name after `{c}`")));
                }
                let name: String = chars[start..i].iter().collect();
                out.push((if c == '%' { Tok::Var(name) } else { Tok::Global(name) }, line));
            }
            '"' => {
                i += 1;
                let mut s = String::new();
                loop {
                    let Some(&c) = chars.get(i) else {
                        return Err(err(line, "unterminated string".to_string()));
                    };
                    i += 1;
                    match c {
                        '"' => break,
                        '\n' => return Err(err(line, "unterminated string".to_string())),
                        '\\' => {
                            let Some(&e) = chars.get(i) else {
                                return Err(err(line, "unterminated string".to_string()));
                            };
                            i += 1;
                            match e {
                                'n' => s.push('\n'),
                                't' => s.push('\t'),
                                'r' => s.push('\r'),
                                '0' => s.push('\0'),
                                '\\' => s.push('\\'),
                                '"' => s.push('"'),
                                'u' => {
                                    let close = chars[i..]
                                        .iter()
                                        .position(|&c| c == '}')
                                        .ok_or_else(|| err(line, "bad unicode escape".to_string()))?;
                                    let hex: String = chars[i + 1..i + close].iter().collect();
                                    let ch = u32::from_str_radix(&hex, 16)
                                        .ok()
                                        .and_then(char::from_u32)
                                        .ok_or_else(|| err(line, "bad unicode escape".to_string()))?;
                                    s.push(ch);
                                    i += close + 1;
                                }
                                other => {
                                    return Err(err(line, format!("unknown escape `\\{other}`")));
                                }
                            }
                        }
                        c => s.push(c),
                    }
                }
                out.push((Tok::Str(s), line));
            }
            '-' if chars.get(i + 1) == Some(&'>') => {
                out.push((Tok::Arrow, line));
                i += 2;
            }
            c if c.is_ascii_digit()
                || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit() || *n == 'i' || *n == 'N')) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() {
                    let d = chars[i];
                    let exp_sign = (d == '+' || d == '-') && matches!(chars[i - 1], 'e' | 'E');
                    if d.is_ascii_alphanumeric() || d == '.' || d == '_' || exp_sign {
                        i += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
                out.push((number(&text).ok_or_else(|| err(line, format!("invalid number `{text}`")))?, line));
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == '.' => {
                let start = i;
                while i < chars.len() && is_name_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let tok = match word.as_str() {
                    "NaN" | "inf" => Tok::Float(word.parse::<f64>().unwrap_or(f64::NAN)),
                    _ => Tok::Word(word),
                };
                out.push((tok, line));
            }
            '(' | ')' | ',' | ':' | '=' | '{' | '}' => {
                out.push((Tok::Punct(c), line));
                i += 1;
            }
            other => return Err(err(line, format!("unexpected character `{other}`"))),
        }
    }
    out.push((Tok::Newline, line));
    Ok(out)
}

fn number(text: &str) -> Option<Tok> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let radix = match digits.get(..2) {
        Some("0x" | "0X") => Some(16),
        Some("0b" | "0B") => Some(2),
        Some("0o" | "0O") => Some(8),
        _ => None,
    };
    if let Some(radix) = radix {
        let magnitude = i128::from_str_radix(&digits[2..], radix).ok()?;
        let value = if negative { -magnitude } else { magnitude };
        return i64::try_from(value).ok().map(Tok::Int);
    }
    if let Ok(v) = text.parse::<i64>() {
        return Some(Tok::Int(v));
    }
    text.parse::<f64>().ok().map(Tok::Float)
}

struct Reader {
    toks: Vec<(Tok, usize)>,
    pos: usize,
}

impl Reader {
    fn new(text: &str) -> Result<Self, IrParseError> {
        Ok(Reader {
            toks: tokenize(text)?,
            pos: 0,
        })
    }

    fn peek(&self) -> &Tok {
        &self.toks[self.pos.min(self.toks.len() - 1)].0
    }

    fn peek_at(&self, n: usize) -> Option<&Tok> {
        self.toks.get(self.pos + n).map(|(t, _)| t)
    }

    fn line(&self) -> usize {
        self.toks[self.pos.min(self.toks.len() - 1)].1
    }

    fn at_end(&self) -> bool {
        self.pos >= self.toks.len()
    }

    fn next(&mut self) -> Tok {
        let tok = self.peek().clone();
        self.pos += 1;
        tok
    }

    fn error<T>(&self, message: impl Into<String>) -> Result<T, IrParseError> {
        Err(IrParseError {
            line: self.line(),
            message: message.into(),
        })
    }

    fn skip_newlines(&mut self) {
        while !self.at_end() && *self.peek() == Tok::Newline {
            self.pos += 1;
        }
    }

    fn expect_punct(&mut self, c: char) -> Result<(), IrParseError> {
        match self.peek() {
            Tok::Punct(p) if *p == c => {
                self.pos += 1;
                Ok(())
            }
            other => self.error(format!("expected `{c}`, found {}", other.describe())),
        }
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if matches!(self.peek(), Tok::Punct(p) if *p == c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_line_end(&mut self) -> Result<(), IrParseError> {
        match self.peek() {
            Tok::Newline => {
                self.pos += 1;
                Ok(())
            }
            Tok::Punct('}') => Ok(()),
            other => self.error(format!("expected end of line, found {}", other.describe())),
        }
    }

    fn word(&mut self) -> Result<String, IrParseError> {
        match self.next() {
            Tok::Word(w) => Ok(w),
            other => {
                self.pos -= 1;
                self.error(format!("expected a name, found {}", other.describe()))
            }
        }
    }

    fn global_name(&mut self) -> Result<String, IrParseError> {
        match self.next() {
            Tok::Global(g) => Ok(g),
            other => {
                self.pos -= 1;
                self.error(format!("expected `@name`, found {}", other.describe()))
            }
        }
    }

    fn var_name(&mut self) -> Result<String, IrParseError> {
        match self.next() {
            Tok::Var(v) => Ok(v),
            other => {
                self.pos -= 1;
                self.error(format!("expected `%name`, found {}", other.describe()))
            }
        }
    }

    fn ir_type(&mut self) -> Result<IrType, IrParseError> {
        let word = self.word()?;
        match IrType::parse(&word) {
            Some(ty) => Ok(ty),
            None => self.error(format!("unknown type `{word}`")),
        }
    }

    fn int(&mut self) -> Result<i64, IrParseError> {
        match self.next() {
            Tok::Int(v) => Ok(v),
            other => {
                self.pos -= 1;
                self.error(format!("expected an integer, found {}", other.describe()))
            }
        }
    }

    fn operand(&mut self) -> Result<Operand, IrParseError> {
        let op = match self.next() {
            Tok::Var(v) => Operand::Var(v),
            Tok::Global(g) => match g.strip_prefix("str.").and_then(|n| n.parse::<usize>().ok()) {
                Some(n) => Operand::Str(n),
                None => Operand::Global(g),
            },
            Tok::Int(v) => Operand::Int(v),
            Tok::Float(v) => Operand::Float(v),
            Tok::Word(w) if w == "true" => Operand::Bool(true),
            Tok::Word(w) if w == "false" => Operand::Bool(false),
            other => {
                self.pos -= 1;
                return self.error(format!("expected an operand, found {}", other.describe()));
            }
        };
        Ok(op)
    }

    fn place(&mut self) -> Result<Place, IrParseError> {
        match self.next() {
            Tok::Var(v) => Ok(Place::Var(v)),
            Tok::Global(g) => Ok(Place::Global(g)),
            other => {
                self.pos -= 1;
                self.error(format!("expected a destination, found {}", other.describe()))
            }
        }
    }

    /// `mnemonic.type`, split at the last dot.
    fn typed_mnemonic(&self, word: &str) -> Option<(String, IrType)> {
        let (name, ty) = word.rsplit_once('.')?;
        Some((name.to_string(), IrType::parse(ty)?))
    }

    fn call_rest(&mut self, dst: Option<Place>) -> Result<Instr, IrParseError> {
        let func = self.global_name()?;
        self.expect_punct('(')?;
        let mut args = Vec::new();
        if !self.eat_punct(')') {
            loop {
                args.push(self.operand()?);
                if self.eat_punct(')') {
                    break;
                }
                self.expect_punct(',')?;
            }
        }
        Ok(Instr::Call { dst, func, args })
    }

    fn raw_rest(&mut self, result: Option<Place>) -> Result<Instr, IrParseError> {
        match self.next() {
            Tok::Str(text) => Ok(Instr::RawEmit {
                text,
                span: Span::dummy(),
                result,
            }),
            other => {
                self.pos -= 1;
                self.error(format!("expected a string after `asm`, found {}", other.describe()))
            }
        }
    }

    /// Right-hand side of `dst = ...`.
    fn assignment(&mut self, dst: Place) -> Result<Instr, IrParseError> {
        let word = self.word()?;
        match word.as_str() {
            "call" => return self.call_rest(Some(dst)),
            "asm" => return self.raw_rest(Some(dst)),
            "alloc" => {
                let size = self.operand()?;
                return Ok(Instr::Alloc { dst, size });
            }
            _ => {}
        }
        let Some((name, ty)) = self.typed_mnemonic(&word) else {
            return self.error(format!("unknown instruction `{word}`"));
        };
        if name == "mov" {
            let src = self.operand()?;
            return Ok(Instr::Move { dst, ty, src });
        }
        if name == "load" {
            let base = self.operand()?;
            self.expect_punct(',')?;
            let offset = self.int()?;
            return Ok(Instr::Load {
                dst,
                ty,
                base,
                offset,
            });
        }
        if let Some(op) = UnOpKind::parse(&name) {
            let src = self.operand()?;
            return Ok(Instr::UnOp { dst, op, ty, src });
        }
        if let Some(op) = BinOpKind::parse(&name) {
            if !op.supports(ty) {
                return self.error(format!("`{name}` is not defined on `{ty}`"));
            }
            let lhs = self.operand()?;
            self.expect_punct(',')?;
            let rhs = self.operand()?;
            return Ok(Instr::BinOp {
                dst,
                op,
                ty,
                lhs,
                rhs,
            });
        }
        self.error(format!("unknown instruction `{word}`"))
    }

    fn instruction(&mut self) -> Result<Instr, IrParseError> {
        let instr = match self.peek().clone() {
            Tok::Var(_) | Tok::Global(_) => {
                let dst = self.place()?;
                self.expect_punct('=')?;
                self.assignment(dst)?
            }
            Tok::Word(word) => {
                if matches!(self.peek_at(1), Some(Tok::Punct(':'))) {
                    self.pos += 2;
                    return Ok(Instr::Label(word));
                }
                self.pos += 1;
                match word.as_str() {
                    "jmp" => Instr::Jump(self.word()?),
                    "br" => {
                        let cond = self.operand()?;
                        self.expect_punct(',')?;
                        let then_label = self.word()?;
                        self.expect_punct(',')?;
                        let else_label = self.word()?;
                        Instr::BranchIf {
                            cond,
                            then_label,
                            else_label,
                        }
                    }
                    "ret" => {
                        if matches!(self.peek(), Tok::Newline | Tok::Punct('}')) {
                            Instr::Return(None)
                        } else {
                            Instr::Return(Some(self.operand()?))
                        }
                    }
                    "free" => Instr::Free(self.operand()?),
                    "call" => self.call_rest(None)?,
                    "asm" => self.raw_rest(None)?,
                    other => {
                        let Some((name, ty)) = self.typed_mnemonic(other) else {
                            self.pos -= 1;
                            return self.error(format!("unknown instruction `{other}`"));
                        };
                        if name != "store" {
                            self.pos -= 1;
                            return self.error(format!("`{other}` needs a destination"));
                        }
                        let base = self.operand()?;
                        self.expect_punct(',')?;
                        let offset = self.int()?;
                        self.expect_punct(',')?;
                        let value = self.operand()?;
                        Instr::Store {
                            ty,
                            base,
                            offset,
                            value,
                        }
                    }
                }
            }
            other => return self.error(format!("expected an instruction, found {}", other.describe())),
        };
        self.expect_line_end()?;
        Ok(instr)
    }

    fn function(&mut self) -> Result<IrFunction, IrParseError> {
        let name = self.global_name()?;
        self.expect_punct('(')?;
        let mut params = Vec::new();
        if !self.eat_punct(')') {
            loop {
                let pname = self.var_name()?;
                self.expect_punct(':')?;
                params.push((pname, self.ir_type()?));
                if self.eat_punct(')') {
                    break;
                }
                self.expect_punct(',')?;
            }
        }
        if self.next() != Tok::Arrow {
            self.pos -= 1;
            return self.error("expected `->` after the parameter list");
        }
        let ret = self.ir_type()?;
        self.expect_punct('{')?;

        let mut vars = Vec::new();
        let mut body = Vec::new();
        loop {
            self.skip_newlines();
            if self.at_end() {
                return self.error(format!("function `@{name}` is missing `}}`"));
            }
            if self.eat_punct('}') {
                break;
            }
            if matches!(self.peek(), Tok::Word(w) if w == "var") {
                self.pos += 1;
                let vname = self.var_name()?;
                self.expect_punct(':')?;
                let ty = self.ir_type()?;
                vars.push(IrVar { name: vname, ty });
                self.expect_line_end()?;
                continue;
            }
            body.push(self.instruction()?);
        }
        Ok(IrFunction {
            name,
            params,
            ret,
            vars,
            body,
            span: Span::dummy(),
        })
    }
}

/// Parse a whole module as printed by `IrModule`'s `Display`.
pub fn parse_module(text: &str) -> Result<IrModule, IrParseError> {
    let mut r = Reader::new(text)?;
    let mut module = IrModule {
        functions: Vec::new(),
        globals: Vec::new(),
        strings: Vec::new(),
        entry: "main".to_string(),
        init: None,
    };
    loop {
        r.skip_newlines();
        if r.at_end() {
            break;
        }
        let keyword = r.word()?;
        match keyword.as_str() {
            "entry" => module.entry = r.global_name()?,
            "init" => module.init = Some(r.global_name()?),
            "global" => {
                let name = r.global_name()?;
                r.expect_punct(':')?;
                let ty = r.ir_type()?;
                module.globals.push(IrGlobal { name, ty });
            }
            "string" => {
                let index = match r.operand()? {
                    Operand::Str(n) => n,
                    _ => return r.error("expected `@str.N`"),
                };
                if index != module.strings.len() {
                    return r.error(format!("string constants must be numbered in order, expected @str.{}", module.strings.len()));
                }
                r.expect_punct('=')?;
                match r.next() {
                    Tok::Str(s) => module.strings.push(s),
                    other => return r.error(format!("expected a string, found {}", other.describe())),
                }
            }
            "func" => {
                module.functions.push(r.function()?);
                continue;
            }
            other => return r.error(format!("unexpected `{other}` at module level")),
        }
        r.expect_line_end()?;
    }
    Ok(module)
}

/// Parse a bare instruction sequence (the body of an `ailang` block).
pub fn parse_instructions(text: &str) -> Result<Vec<Instr>, IrParseError> {
    let mut r = Reader::new(text)?;
    let mut out = Vec::new();
    loop {
        r.skip_newlines();
        if r.at_end() {
            return Ok(out);
        }
        if matches!(r.peek(), Tok::Punct('}')) {
            return r.error("unexpected `}`");
        }
        out.push(r.instruction()?);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"entry @main
global @counter: i64
string @str.0 = "hi \"there\"\n"

func @add(%a: i64, %b: f64) -> f64 {
  var %t: f64
  var %ok: bool
  %t = itof.f64 %a
  %t = add.f64 %t, %b
  %ok = lt.f64 %t, 1.5
  br %ok, L0, L1
L0:
  call @__aim_print_str(@str.0)
  jmp L1
L1:
  @counter = mov.i64 -3
  %ok = asm "mov rax, {%t}"
  ret %t
}
"#;

    #[test]
    fn module_round_trips_through_text() {
        let module = parse_module(SAMPLE).expect("parse");
        assert_eq!(module.globals.len(), 1);
        assert_eq!(module.strings[0], "hi \"there\"\n");
        let printed = module.to_string();
        let reparsed = parse_module(&printed).expect("reparse");
        assert_eq!(module, reparsed);
    }

    #[test]
    fn semicolons_separate_instructions() {
        let instrs = parse_instructions("%x = mov.i64 1; %y = add.i64 %x, 0x10 # comment").expect("parse");
        assert_eq!(instrs.len(), 2);
        assert_eq!(
            instrs[1],
            Instr::BinOp {
                dst: Place::Var("y".into()),
                op: BinOpKind::Add,
                ty: IrType::I64,
                lhs: Operand::Var("x".into()),
                rhs: Operand::Int(16),
            }
        );
    }

    #[test]
    fn special_floats_parse() {
        let instrs = parse_instructions("%a = mov.f64 NaN\n%b = mov.f64 -inf\n%c = mov.f64 1e-7").expect("parse");
        let Instr::Move { src: Operand::Float(a), .. } = &instrs[0] else {
            panic!("expected move");
        };
        assert!(a.is_nan());
        assert_eq!(instrs[1].to_string(), "%b = mov.f64 -inf");
        assert_eq!(instrs[2].to_string(), "%c = mov.f64 1e-7");
    }

    #[test]
    fn reports_line_of_error() {
        let err = parse_instructions("%x = mov.i64 1\n%y = frob.i64 %x").expect_err("should fail");
        assert_eq!(err.line, 2);
        let err = parse_instructions("%x = mod.f64 %a, %b").expect_err("should fail");
        assert!(err.message.contains("not defined on `f64`"));
    }
}
