//! Static types of AIMacro values.
//!
//! Types are inferred, never declared except through optional
//! annotations. Inference works on a small lattice: `Unknown` sits
//! below every concrete type and `Error` absorbs everything so that one
//! mistake does not cascade into a wall of follow-up diagnostics.

use std::fmt;

use crate::ast::{BinaryOp, TypeExpr, TypeExprKind, UnaryOp};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Type {
    Int,
    Float,
    Bool,
    Str,
    List(Box<Type>),
    Function {
        params: Vec<Type>,
        result: Box<Type>,
    },
    /// Nothing is known yet. Code generation treats it as a machine word.
    Unknown,
    /// Result of an expression that already produced a diagnostic.
    Error,
}

impl Type {
    pub fn list(elem: Type) -> Type {
        Type::List(Box::new(elem))
    }

    pub fn function(params: Vec<Type>, result: Type) -> Type {
        Type::Function {
            params,
            result: Box::new(result),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Int | Type::Float | Type::Unknown)
    }

    /// Int-like for arithmetic that only exists on integers.
    pub fn is_integral(&self) -> bool {
        matches!(self, Type::Int | Type::Unknown | Type::Bool)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Type::Error)
    }

    /// Whether the value can be tested in `if`/`while`/`and`/`or`.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Type::Function { .. })
    }

    /// Contains no `Unknown` anywhere.
    pub fn is_concrete(&self) -> bool {
        match self {
            Type::Unknown => false,
            Type::List(elem) => elem.is_concrete(),
            Type::Function { params, result } => {
                params.iter().all(Type::is_concrete) && result.is_concrete()
            }
            _ => true,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Int => f.write_str("int"),
            Type::Float => f.write_str("float"),
            Type::Bool => f.write_str("bool"),
            Type::Str => f.write_str("str"),
            Type::List(elem) => write!(f, "list[{elem}]"),
            Type::Function { params, result } => {
                f.write_str("(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{p}")?;
                }
                write!(f, ") -> {result}")
            }
            Type::Unknown => f.write_str("unknown"),
            Type::Error => f.write_str("<error>"),
        }
    }
}

/// Least upper bound of two types, `None` when they conflict.
pub fn join(a: &Type, b: &Type) -> Option<Type> {
    match (a, b) {
        (Type::Error, _) | (_, Type::Error) => Some(Type::Error),
        (Type::Unknown, other) | (other, Type::Unknown) => Some(other.clone()),
        (Type::List(x), Type::List(y)) => join(x, y).map(Type::list),
        (
            Type::Function {
                params: pa,
                result: ra,
            },
            Type::Function {
                params: pb,
                result: rb,
            },
        ) => {
            if pa.len() != pb.len() {
                return None;
            }
            let params = pa
                .iter()
                .zip(pb)
                .map(|(x, y)| join(x, y))
                .collect::<Option<Vec<_>>>()?;
            Some(Type::function(params, join(ra, rb)?))
        }
        (x, y) if x == y => Some(x.clone()),
        _ => None,
    }
}

/// `value` may be stored where `target` is expected without changing it.
pub fn fits(target: &Type, value: &Type) -> bool {
    join(target, value).as_ref() == Some(target)
}

/// Result type of `lhs op rhs`, `Err` when the operands do not support it.
pub fn binary_result(op: BinaryOp, lhs: &Type, rhs: &Type) -> Result<Type, ()> {
    if lhs.is_error() || rhs.is_error() {
        return Ok(Type::Error);
    }
    match op {
        BinaryOp::And | BinaryOp::Or => {
            if lhs.is_truthy() && rhs.is_truthy() {
                Ok(Type::Bool)
            } else {
                Err(())
            }
        }
        BinaryOp::Eq | BinaryOp::NotEq => match (lhs, rhs) {
            (l, r) if l.is_numeric() && r.is_numeric() => Ok(Type::Bool),
            (Type::Bool, Type::Bool) | (Type::Str, Type::Str) => Ok(Type::Bool),
            _ => Err(()),
        },
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            if lhs.is_numeric() && rhs.is_numeric() {
                Ok(Type::Bool)
            } else {
                Err(())
            }
        }
        BinaryOp::Add => match (lhs, rhs) {
            (Type::Str, Type::Str) => Ok(Type::Str),
            (Type::List(_), Type::List(_)) => join(lhs, rhs).ok_or(()),
            (l, r) => numeric_result(l, r),
        },
        BinaryOp::Sub | BinaryOp::Mul => numeric_result(lhs, rhs),
        BinaryOp::Div => {
            if lhs.is_numeric() && rhs.is_numeric() {
                Ok(Type::Float)
            } else {
                Err(())
            }
        }
        BinaryOp::FloorDiv | BinaryOp::Mod | BinaryOp::Pow => {
            if matches!(lhs, Type::Int | Type::Unknown) && matches!(rhs, Type::Int | Type::Unknown) {
                Ok(Type::Int)
            } else {
                Err(())
            }
        }
    }
}

fn numeric_result(lhs: &Type, rhs: &Type) -> Result<Type, ()> {
    match (lhs, rhs) {
        (Type::Float, r) if r.is_numeric() => Ok(Type::Float),
        (l, Type::Float) if l.is_numeric() => Ok(Type::Float),
        (l, r) if l.is_numeric() && r.is_numeric() => Ok(Type::Int),
        _ => Err(()),
    }
}

pub fn unary_result(op: UnaryOp, operand: &Type) -> Result<Type, ()> {
    match (op, operand) {
        (_, Type::Error) => Ok(Type::Error),
        (UnaryOp::Not, t) if t.is_truthy() => Ok(Type::Bool),
        (UnaryOp::Neg | UnaryOp::Plus, Type::Float) => Ok(Type::Float),
        (UnaryOp::Neg | UnaryOp::Plus, Type::Int | Type::Unknown) => Ok(Type::Int),
        _ => Err(()),
    }
}

/// Resolve a written annotation.
pub fn from_annotation(expr: &TypeExpr) -> Result<Type, String> {
    match &expr.kind {
        TypeExprKind::Named(name) => match name.as_str() {
            "int" => Ok(Type::Int),
            "float" => Ok(Type::Float),
            "bool" => Ok(Type::Bool),
            "str" => Ok(Type::Str),
            "list" => Ok(Type::list(Type::Unknown)),
            "None" => Ok(Type::Unknown),
            other => Err(format!("unknown type `{other}`")),
        },
        TypeExprKind::List(inner) => from_annotation(inner).map(Type::list),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_refines_unknown() {
        assert_eq!(join(&Type::Unknown, &Type::Int), Some(Type::Int));
        assert_eq!(
            join(&Type::list(Type::Unknown), &Type::list(Type::Str)),
            Some(Type::list(Type::Str))
        );
        assert_eq!(join(&Type::Int, &Type::Float), None);
        assert_eq!(join(&Type::Error, &Type::Str), Some(Type::Error));
    }

    #[test]
    fn fits_is_one_directional() {
        assert!(fits(&Type::Int, &Type::Unknown));
        assert!(!fits(&Type::Unknown, &Type::Int));
        assert!(!fits(&Type::Int, &Type::Float));
    }

    #[test]
    fn arithmetic_promotes_to_float() {
        assert_eq!(binary_result(BinaryOp::Add, &Type::Int, &Type::Int), Ok(Type::Int));
        assert_eq!(binary_result(BinaryOp::Mul, &Type::Int, &Type::Float), Ok(Type::Float));
        assert_eq!(binary_result(BinaryOp::Div, &Type::Int, &Type::Int), Ok(Type::Float));
        assert_eq!(binary_result(BinaryOp::FloorDiv, &Type::Int, &Type::Int), Ok(Type::Int));
        assert!(binary_result(BinaryOp::Mod, &Type::Float, &Type::Int).is_err());
    }

    #[test]
    fn strings_and_lists() {
        assert_eq!(binary_result(BinaryOp::Add, &Type::Str, &Type::Str), Ok(Type::Str));
        assert!(binary_result(BinaryOp::Add, &Type::Str, &Type::Int).is_err());
        assert_eq!(binary_result(BinaryOp::Eq, &Type::Str, &Type::Str), Ok(Type::Bool));
        assert!(binary_result(BinaryOp::Lt, &Type::Str, &Type::Str).is_err());
        assert_eq!(
            binary_result(BinaryOp::Add, &Type::list(Type::Int), &Type::list(Type::Unknown)),
            Ok(Type::list(Type::Int))
        );
    }

    #[test]
    fn display_matches_annotation_syntax() {
        assert_eq!(Type::list(Type::list(Type::Float)).to_string(), "list[list[float]]");
        assert_eq!(Type::function(vec![Type::Int], Type::Bool).to_string(), "(int) -> bool");
    }
}
