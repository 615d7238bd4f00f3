//! Low-level intermediate representation.
//!
//! The IR is a flat list of three-address instructions per function over
//! named slots (`%x`) and module globals (`@x`). Every value is a 64-bit
//! word; `IrType` only tells the code generator which instructions to
//! pick. The text form printed here is the same one `ailang` blocks are
//! written in and is read back by [`crate::ir_text`].

use std::fmt;

use crate::span::Span;
use crate::types::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IrType {
    I64,
    F64,
    Bool,
    Ptr,
}

impl IrType {
    pub fn name(self) -> &'static str {
        match self {
            IrType::I64 => "i64",
            IrType::F64 => "f64",
            IrType::Bool => "bool",
            IrType::Ptr => "ptr",
        }
    }

    pub fn parse(text: &str) -> Option<IrType> {
        match text {
            "i64" => Some(IrType::I64),
            "f64" => Some(IrType::F64),
            "bool" => Some(IrType::Bool),
            "ptr" => Some(IrType::Ptr),
            _ => None,
        }
    }

    /// Machine representation of a source type; unknown values are words.
    pub fn from_type(ty: &Type) -> IrType {
        match ty {
            Type::Float => IrType::F64,
            Type::Bool => IrType::Bool,
            Type::Str | Type::List(_) => IrType::Ptr,
            _ => IrType::I64,
        }
    }
}

impl fmt::Display for IrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Var(String),
    Global(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Address of string constant N.
    Str(usize),
}

impl Operand {
    pub fn var(&self) -> Option<&str> {
        match self {
            Operand::Var(name) => Some(name),
            _ => None,
        }
    }
}

impl From<&Place> for Operand {
    fn from(place: &Place) -> Self {
        match place {
            Place::Var(name) => Operand::Var(name.clone()),
            Place::Global(name) => Operand::Global(name.clone()),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Var(name) => write!(f, "%{name}"),
            Operand::Global(name) => write!(f, "@{name}"),
            Operand::Int(v) => write!(f, "{v}"),
            Operand::Float(v) => write!(f, "{v:?}"),
            Operand::Bool(b) => write!(f, "{b}"),
            Operand::Str(n) => write!(f, "@str.{n}"),
        }
    }
}

/// Destination of an instruction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Place {
    Var(String),
    Global(String),
}

impl Place {
    pub fn var(&self) -> Option<&str> {
        match self {
            Place::Var(name) => Some(name),
            Place::Global(_) => None,
        }
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Place::Var(name) => write!(f, "%{name}"),
            Place::Global(name) => write!(f, "@{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    /// Truncating division (f64: true division).
    Div,
    /// Truncating remainder.
    Rem,
    /// Division rounding towards negative infinity.
    FloorDiv,
    /// Remainder with the sign of the divisor.
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

const BIN_OPS: &[(BinOpKind, &str)] = &[
    (BinOpKind::Add, "add"),
    (BinOpKind::Sub, "sub"),
    (BinOpKind::Mul, "mul"),
    (BinOpKind::Div, "div"),
    (BinOpKind::Rem, "rem"),
    (BinOpKind::FloorDiv, "floordiv"),
    (BinOpKind::Mod, "mod"),
    (BinOpKind::And, "and"),
    (BinOpKind::Or, "or"),
    (BinOpKind::Xor, "xor"),
    (BinOpKind::Shl, "shl"),
    (BinOpKind::Shr, "shr"),
    (BinOpKind::Sar, "sar"),
    (BinOpKind::Eq, "eq"),
    (BinOpKind::Ne, "ne"),
    (BinOpKind::Lt, "lt"),
    (BinOpKind::Le, "le"),
    (BinOpKind::Gt, "gt"),
    (BinOpKind::Ge, "ge"),
];

impl BinOpKind {
    pub fn name(self) -> &'static str {
        BIN_OPS
            .iter()
            .find(|(op, _)| *op == self)
            .map(|(_, name)| *name)
            .unwrap_or("?")
    }

    pub fn parse(text: &str) -> Option<BinOpKind> {
        BIN_OPS.iter().find(|(_, name)| *name == text).map(|(op, _)| *op)
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOpKind::Eq | BinOpKind::Ne | BinOpKind::Lt | BinOpKind::Le | BinOpKind::Gt | BinOpKind::Ge
        )
    }

    /// Whether the operation exists on operands of type `ty`.
    pub fn supports(self, ty: IrType) -> bool {
        match ty {
            IrType::F64 => matches!(
                self,
                BinOpKind::Add | BinOpKind::Sub | BinOpKind::Mul | BinOpKind::Div
            ) || self.is_comparison(),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOpKind {
    Neg,
    /// Logical not: 1 when the operand is zero, else 0.
    Not,
    /// Signed integer to float.
    Itof,
    /// Float to signed integer, truncating.
    Ftoi,
}

impl UnOpKind {
    pub fn name(self) -> &'static str {
        match self {
            UnOpKind::Neg => "neg",
            UnOpKind::Not => "not",
            UnOpKind::Itof => "itof",
            UnOpKind::Ftoi => "ftoi",
        }
    }

    pub fn parse(text: &str) -> Option<UnOpKind> {
        match text {
            "neg" => Some(UnOpKind::Neg),
            "not" => Some(UnOpKind::Not),
            "itof" => Some(UnOpKind::Itof),
            "ftoi" => Some(UnOpKind::Ftoi),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Label(String),
    Move {
        dst: Place,
        ty: IrType,
        src: Operand,
    },
    /// `ty` is the operand type; comparisons produce a bool.
    BinOp {
        dst: Place,
        op: BinOpKind,
        ty: IrType,
        lhs: Operand,
        rhs: Operand,
    },
    /// `ty` is the result type.
    UnOp {
        dst: Place,
        op: UnOpKind,
        ty: IrType,
        src: Operand,
    },
    Call {
        dst: Option<Place>,
        func: String,
        args: Vec<Operand>,
    },
    BranchIf {
        cond: Operand,
        then_label: String,
        else_label: String,
    },
    Jump(String),
    Load {
        dst: Place,
        ty: IrType,
        base: Operand,
        offset: i64,
    },
    Store {
        ty: IrType,
        base: Operand,
        offset: i64,
        value: Operand,
    },
    Alloc {
        dst: Place,
        size: Operand,
    },
    Free(Operand),
    Return(Option<Operand>),
    /// Raw machine instructions; `{%x}`/`{@g}` placeholders are filled in
    /// by the code generator. `result` receives `rax` afterwards.
    RawEmit {
        text: String,
        span: Span,
        result: Option<Place>,
    },
}

impl Instr {
    /// Destination written by the instruction, if any.
    pub fn def(&self) -> Option<&Place> {
        match self {
            Instr::Move { dst, .. }
            | Instr::BinOp { dst, .. }
            | Instr::UnOp { dst, .. }
            | Instr::Load { dst, .. }
            | Instr::Alloc { dst, .. } => Some(dst),
            Instr::Call { dst, .. } => dst.as_ref(),
            Instr::RawEmit { result, .. } => result.as_ref(),
            _ => None,
        }
    }

    /// Operands read by the instruction (placeholders of raw blocks are
    /// reported by [`raw_placeholders`]).
    pub fn uses(&self) -> Vec<&Operand> {
        match self {
            Instr::Move { src, .. } | Instr::UnOp { src, .. } => vec![src],
            Instr::BinOp { lhs, rhs, .. } => vec![lhs, rhs],
            Instr::Call { args, .. } => args.iter().collect(),
            Instr::BranchIf { cond, .. } => vec![cond],
            Instr::Load { base, .. } => vec![base],
            Instr::Store { base, value, .. } => vec![base, value],
            Instr::Alloc { size, .. } => vec![size],
            Instr::Free(ptr) => vec![ptr],
            Instr::Return(Some(value)) => vec![value],
            _ => Vec::new(),
        }
    }

    /// Ends a basic block.
    pub fn is_terminator(&self) -> bool {
        matches!(self, Instr::BranchIf { .. } | Instr::Jump(_) | Instr::Return(_))
    }

    /// Labels control may transfer to.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Instr::BranchIf {
                then_label,
                else_label,
                ..
            } => vec![then_label, else_label],
            Instr::Jump(label) => vec![label],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    Var(String),
    Global(String),
}

/// `{%name}` and `{@name}` placeholders in raw text, in order.
pub fn raw_placeholders(text: &str) -> Vec<Placeholder> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            break;
        };
        let inner = after[..close].trim();
        if let Some(name) = inner.strip_prefix('%') {
            out.push(Placeholder::Var(name.to_string()));
        } else if let Some(name) = inner.strip_prefix('@') {
            out.push(Placeholder::Global(name.to_string()));
        }
        rest = &after[close + 1..];
    }
    out
}

fn write_args(f: &mut fmt::Formatter<'_>, args: &[Operand]) -> fmt::Result {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{arg}")?;
    }
    Ok(())
}

/// Quote a string the way the IR text parser reads it back.
pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            c if c.is_control() => out.push_str(&format!("\\u{{{:x}}}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instr::Label(name) => write!(f, "{name}:"),
            Instr::Move { dst, ty, src } => write!(f, "{dst} = mov.{ty} {src}"),
            Instr::BinOp {
                dst,
                op,
                ty,
                lhs,
                rhs,
            } => write!(f, "{dst} = {}.{ty} {lhs}, {rhs}", op.name()),
            Instr::UnOp { dst, op, ty, src } => write!(f, "{dst} = {}.{ty} {src}", op.name()),
            Instr::Call { dst, func, args } => {
                if let Some(dst) = dst {
                    write!(f, "{dst} = ")?;
                }
                write!(f, "call @{func}(")?;
                write_args(f, args)?;
                f.write_str(")")
            }
            Instr::BranchIf {
                cond,
                then_label,
                else_label,
            } => write!(f, "br {cond}, {then_label}, {else_label}"),
            Instr::Jump(label) => write!(f, "jmp {label}"),
            Instr::Load {
                dst,
                ty,
                base,
                offset,
            } => write!(f, "{dst} = load.{ty} {base}, {offset}"),
            Instr::Store {
                ty,
                base,
                offset,
                value,
            } => write!(f, "store.{ty} {base}, {offset}, {value}"),
            Instr::Alloc { dst, size } => write!(f, "{dst} = alloc {size}"),
            Instr::Free(ptr) => write!(f, "free {ptr}"),
            Instr::Return(Some(value)) => write!(f, "ret {value}"),
            Instr::Return(None) => f.write_str("ret"),
            Instr::RawEmit { text, result, .. } => {
                if let Some(dst) = result {
                    write!(f, "{dst} = ")?;
                }
                write!(f, "asm {}", quote(text))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrVar {
    pub name: String,
    pub ty: IrType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IrFunction {
    pub name: String,
    pub params: Vec<(String, IrType)>,
    pub ret: IrType,
    /// Slots other than parameters.
    pub vars: Vec<IrVar>,
    pub body: Vec<Instr>,
    pub span: Span,
}

impl IrFunction {
    pub fn var_type(&self, name: &str) -> Option<IrType> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, ty)| *ty)
            .or_else(|| self.vars.iter().find(|v| v.name == name).map(|v| v.ty))
    }
}

impl fmt::Display for IrFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "func @{}(", self.name)?;
        for (i, (name, ty)) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "%{name}: {ty}")?;
        }
        writeln!(f, ") -> {} {{", self.ret)?;
        for var in &self.vars {
            writeln!(f, "  var %{}: {}", var.name, var.ty)?;
        }
        for instr in &self.body {
            match instr {
                Instr::Label(_) => writeln!(f, "{instr}")?,
                _ => writeln!(f, "  {instr}")?,
            }
        }
        f.write_str("}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrGlobal {
    pub name: String,
    pub ty: IrType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IrModule {
    pub functions: Vec<IrFunction>,
    pub globals: Vec<IrGlobal>,
    pub strings: Vec<String>,
    pub entry: String,
    pub init: Option<String>,
}

impl IrModule {
    pub fn function(&self, name: &str) -> Option<&IrFunction> {
        self.functions.iter().find(|f| f.name == name)
    }
}

impl fmt::Display for IrModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "entry @{}", self.entry)?;
        if let Some(init) = &self.init {
            writeln!(f, "init @{init}")?;
        }
        for global in &self.globals {
            writeln!(f, "global @{}: {}", global.name, global.ty)?;
        }
        for (i, s) in self.strings.iter().enumerate() {
            writeln!(f, "string @str.{i} = {}", quote(s))?;
        }
        for func in &self.functions {
            writeln!(f)?;
            writeln!(f, "{func}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prints_instructions() {
        let add = Instr::BinOp {
            dst: Place::Var("0".into()),
            op: BinOpKind::Add,
            ty: IrType::I64,
            lhs: Operand::Var("a".into()),
            rhs: Operand::Int(1),
        };
        assert_eq!(add.to_string(), "%0 = add.i64 %a, 1");
        let call = Instr::Call {
            dst: None,
            func: "__aim_print_str".into(),
            args: vec![Operand::Str(3)],
        };
        assert_eq!(call.to_string(), "call @__aim_print_str(@str.3)");
        let store = Instr::Store {
            ty: IrType::F64,
            base: Operand::Var("p".into()),
            offset: 8,
            value: Operand::Float(2.0),
        };
        assert_eq!(store.to_string(), "store.f64 %p, 8, 2.0");
    }

    #[test]
    fn defs_and_uses() {
        let load = Instr::Load {
            dst: Place::Var("x".into()),
            ty: IrType::I64,
            base: Operand::Var("p".into()),
            offset: 0,
        };
        assert_eq!(load.def(), Some(&Place::Var("x".into())));
        assert_eq!(load.uses(), vec![&Operand::Var("p".into())]);
        assert!(Instr::Jump("L1".into()).is_terminator());
    }

    #[test]
    fn finds_raw_placeholders() {
        let found = raw_placeholders("mov rax, {%x}\nadd rax, {@count} ; {not}");
        assert_eq!(
            found,
            vec![Placeholder::Var("x".into()), Placeholder::Global("count".into())]
        );
    }

    #[test]
    fn float_ops_are_restricted() {
        assert!(BinOpKind::Add.supports(IrType::F64));
        assert!(BinOpKind::Lt.supports(IrType::F64));
        assert!(!BinOpKind::Mod.supports(IrType::F64));
        assert!(BinOpKind::Shl.supports(IrType::I64));
    }
}
