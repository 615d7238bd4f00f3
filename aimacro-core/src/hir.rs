//! Typed intermediate representation (HIR).
//!
//! HIR is what the resolver hands to lowering: every name is bound to a
//! concrete local or global, every expression carries its inferred type
//! and builtin calls are told apart from user calls.

use std::collections::BTreeMap;

use crate::ast::{BinaryOp, RawLang, UnaryOp};
use crate::builtins::BuiltinKind;
use crate::span::Span;
use crate::types::Type;

/// A whole resolved program.
#[derive(Debug, Clone, PartialEq)]
pub struct HirModule {
    pub functions: Vec<HirFunction>,
    pub globals: Vec<HirGlobal>,
    /// Function the program starts in (`main`, user written or synthetic).
    pub entry: String,
    /// Top-level statements run before a user written `main`.
    pub init: Option<String>,
}

impl HirModule {
    pub fn function(&self, name: &str) -> Option<&HirFunction> {
        self.functions.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HirGlobal {
    pub name: String,
    pub ty: Type,
    pub span: Span,
}

/// A local slot. `name` is unique inside its function, shadowed source
/// names get a `.N` suffix.
#[derive(Debug, Clone, PartialEq)]
pub struct HirLocal {
    pub name: String,
    pub source_name: String,
    pub ty: Type,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HirFunction {
    pub name: String,
    pub params: Vec<HirLocal>,
    pub result: Type,
    /// Every non-parameter local, in declaration order.
    pub locals: Vec<HirLocal>,
    pub body: Vec<HirStmt>,
    pub span: Span,
    /// Generated from top-level statements rather than written by the user.
    pub synthetic: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum VarRef {
    Local(String),
    Global(String),
}

impl VarRef {
    pub fn name(&self) -> &str {
        match self {
            VarRef::Local(n) | VarRef::Global(n) => n,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HirPlace {
    Var(VarRef),
    Index { base: HirExpr, index: HirExpr },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HirStmt {
    pub kind: HirStmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HirStmtKind {
    Assign { target: HirPlace, value: HirExpr },
    Expr(HirExpr),
    If {
        branches: Vec<(HirExpr, Vec<HirStmt>)>,
        else_body: Vec<HirStmt>,
    },
    While { cond: HirExpr, body: Vec<HirStmt> },
    For {
        var: VarRef,
        iter: HirExpr,
        body: Vec<HirStmt>,
    },
    Return(Option<HirExpr>),
    Break,
    Continue,
    Raw(HirRaw),
}

/// A raw block together with the names visible where it was written.
#[derive(Debug, Clone, PartialEq)]
pub struct HirRaw {
    pub lang: RawLang,
    pub payload: String,
    pub span: Span,
    /// Source name -> binding, for placeholder and name substitution.
    pub scope: BTreeMap<String, (VarRef, Type)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HirExpr {
    pub kind: HirExprKind,
    pub ty: Type,
    pub span: Span,
}

impl HirExpr {
    pub fn new(kind: HirExprKind, ty: Type, span: Span) -> Self {
        HirExpr { kind, ty, span }
    }

    pub fn error(span: Span) -> Self {
        HirExpr::new(HirExprKind::Error, Type::Error, span)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HirFStringPart {
    Text(String),
    Expr(HirExpr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum HirExprKind {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    NoneValue,
    Var(VarRef),
    Binary {
        op: BinaryOp,
        lhs: Box<HirExpr>,
        rhs: Box<HirExpr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<HirExpr>,
    },
    Call {
        callee: String,
        args: Vec<HirExpr>,
    },
    Builtin {
        kind: BuiltinKind,
        args: Vec<HirExpr>,
    },
    List(Vec<HirExpr>),
    Index {
        base: Box<HirExpr>,
        index: Box<HirExpr>,
    },
    FString(Vec<HirFStringPart>),
    /// A function name used as a value.
    FunctionRef(String),
    Raw(HirRaw),
    Error,
}
