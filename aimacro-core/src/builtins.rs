//! Built-in functions visible to every AIMacro program.
//!
//! Builtins have no source definition. The resolver types calls to them
//! through [`builtin_result`] and lowering maps each [`BuiltinKind`] to
//! IR or to a runtime routine.

use crate::types::Type;

/// Kind of builtin, used by lowering to decide how to expand a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinKind {
    /// Writes its arguments separated by spaces plus a newline to stdout.
    Print,
    /// Length of a string or list.
    Len,
    /// Text form of a scalar.
    Str,
    /// Truncating conversion to int.
    Int,
    /// Conversion to float.
    Float,
    /// `range(stop)`, `range(start, stop)` or `range(start, stop, step)`.
    Range,
    /// Terminates the process with the given status.
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinDescriptor {
    pub name: &'static str,
    pub min_args: usize,
    /// `None` means variadic.
    pub max_args: Option<usize>,
    pub kind: BuiltinKind,
}

impl BuiltinDescriptor {
    pub fn accepts(&self, count: usize) -> bool {
        count >= self.min_args && self.max_args.is_none_or(|max| count <= max)
    }

    /// Arity for diagnostics, e.g. `1 to 3`.
    pub fn arity(&self) -> String {
        match self.max_args {
            Some(max) if max == self.min_args => max.to_string(),
            Some(max) => format!("{} to {max}", self.min_args),
            None => format!("at least {}", self.min_args),
        }
    }
}

pub const BUILTINS: &[BuiltinDescriptor] = &[
    BuiltinDescriptor {
        name: "print",
        min_args: 0,
        max_args: None,
        kind: BuiltinKind::Print,
    },
    BuiltinDescriptor {
        name: "len",
        min_args: 1,
        max_args: Some(1),
        kind: BuiltinKind::Len,
    },
    BuiltinDescriptor {
        name: "str",
        min_args: 1,
        max_args: Some(1),
        kind: BuiltinKind::Str,
    },
    BuiltinDescriptor {
        name: "int",
        min_args: 1,
        max_args: Some(1),
        kind: BuiltinKind::Int,
    },
    BuiltinDescriptor {
        name: "float",
        min_args: 1,
        max_args: Some(1),
        kind: BuiltinKind::Float,
    },
    BuiltinDescriptor {
        name: "range",
        min_args: 1,
        max_args: Some(3),
        kind: BuiltinKind::Range,
    },
    BuiltinDescriptor {
        name: "exit",
        min_args: 1,
        max_args: Some(1),
        kind: BuiltinKind::Exit,
    },
];

pub fn find_builtin(name: &str) -> Option<&'static BuiltinDescriptor> {
    BUILTINS.iter().find(|b| b.name == name)
}

/// Result type of a builtin call given its argument types.
///
/// The error string is the diagnostic message.
pub fn builtin_result(kind: BuiltinKind, args: &[Type]) -> Result<Type, String> {
    if args.iter().any(Type::is_error) {
        return Ok(Type::Error);
    }
    match kind {
        BuiltinKind::Print => {
            if let Some(func) = args.iter().find(|t| matches!(t, Type::Function { .. })) {
                return Err(format!("cannot print a value of type `{func}`"));
            }
            Ok(Type::Unknown)
        }
        BuiltinKind::Len => match &args[0] {
            Type::Str | Type::List(_) | Type::Unknown => Ok(Type::Int),
            other => Err(format!("`len` expects a str or list, found `{other}`")),
        },
        BuiltinKind::Str => match &args[0] {
            Type::Function { .. } => Err("`str` cannot convert a function".to_string()),
            _ => Ok(Type::Str),
        },
        BuiltinKind::Int => match &args[0] {
            Type::Int | Type::Float | Type::Bool | Type::Unknown => Ok(Type::Int),
            other => Err(format!("`int` expects a number, found `{other}`")),
        },
        BuiltinKind::Float => match &args[0] {
            Type::Int | Type::Float | Type::Unknown => Ok(Type::Float),
            other => Err(format!("`float` expects a number, found `{other}`")),
        },
        BuiltinKind::Range => {
            if let Some(bad) = args.iter().find(|t| !matches!(t, Type::Int | Type::Unknown)) {
                return Err(format!("`range` expects int arguments, found `{bad}`"));
            }
            Ok(Type::list(Type::Int))
        }
        BuiltinKind::Exit => match &args[0] {
            Type::Int | Type::Unknown => Ok(Type::Unknown),
            other => Err(format!("`exit` expects an int status, found `{other}`")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_checks() {
        let range = find_builtin("range").expect("range");
        assert!(!range.accepts(0));
        assert!(range.accepts(3));
        assert!(!range.accepts(4));
        assert_eq!(range.arity(), "1 to 3");
        assert!(find_builtin("print").expect("print").accepts(7));
        assert!(find_builtin("open").is_none());
    }

    #[test]
    fn result_types() {
        assert_eq!(builtin_result(BuiltinKind::Len, &[Type::Str]), Ok(Type::Int));
        assert!(builtin_result(BuiltinKind::Len, &[Type::Int]).is_err());
        assert_eq!(
            builtin_result(BuiltinKind::Range, &[Type::Int, Type::Int]),
            Ok(Type::list(Type::Int))
        );
        assert_eq!(builtin_result(BuiltinKind::Float, &[Type::Int]), Ok(Type::Float));
        assert!(builtin_result(BuiltinKind::Range, &[Type::Float]).is_err());
    }
}
