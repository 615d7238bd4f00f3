//! Surface AST produced by the parser.
//!
//! Every node owns its children; there are no back-edges. Spans point at
//! the source text the node was parsed from.

use crate::span::{FileId, Span};

/// One parsed compilation unit (the main source or a library file).
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub file: FileId,
    pub items: Vec<Stmt>,
}

/// The main unit plus the library units it is compiled against.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub main: Module,
    pub libraries: Vec<Module>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ident {
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    FunctionDef(FunctionDef),
    If(IfStmt),
    While { cond: Expr, body: Vec<Stmt> },
    For { target: Ident, iter: Expr, body: Vec<Stmt> },
    Return(Option<Expr>),
    /// `target = value` or, with `op`, `target op= value`.
    Assign {
        target: AssignTarget,
        op: Option<BinaryOp>,
        value: Expr,
    },
    Expr(Expr),
    Break,
    Continue,
    Pass,
    Raw(RawBlock),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefKeyword {
    Def,
    Func,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub keyword: DefKeyword,
    pub name: Ident,
    pub params: Vec<Param>,
    pub ret: Option<TypeExpr>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: Ident,
    pub annotation: Option<TypeExpr>,
}

/// Written type annotation such as `int` or `list[str]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeExpr {
    pub kind: TypeExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeExprKind {
    Named(String),
    List(Box<TypeExpr>),
}

/// `if` / `elif` chain sharing one `end;`.
#[derive(Debug, Clone, PartialEq)]
pub struct IfStmt {
    pub branches: Vec<(Expr, Vec<Stmt>)>,
    pub else_body: Option<Vec<Stmt>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssignTarget {
    Name(Ident),
    Index { base: Expr, index: Expr },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawLang {
    Ailang,
    Asm,
}

impl RawLang {
    pub fn keyword(self) -> &'static str {
        match self {
            RawLang::Ailang => "ailang",
            RawLang::Asm => "asm",
        }
    }
}

/// Opaque escape-hatch payload. Only the stage owning `lang` reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    pub lang: RawLang,
    pub payload: String,
    pub payload_span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Literal(Literal),
    Name(String),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Call {
        callee: Ident,
        args: Vec<Expr>,
    },
    List(Vec<Expr>),
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    FString(Vec<FStringPart>),
    Raw(RawBlock),
    /// Placeholder left behind by a parse error.
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FStringPart {
    Text(String),
    Expr(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Mod => "%",
            BinaryOp::Pow => "**",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::NotEq | BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Plus,
    Not,
}

impl UnaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Neg => "-",
            UnaryOp::Plus => "+",
            UnaryOp::Not => "not",
        }
    }
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Expr { kind, span }
    }
}
