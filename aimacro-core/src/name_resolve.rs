//! Lexical scopes for name resolution.
//!
//! Scopes live in an arena and refer to their parent by index; a child
//! is always pushed after its parent, so walking outwards only ever
//! visits lower indices.

use std::collections::BTreeMap;

use crate::span::Span;
use crate::types::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SymbolId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    Function,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Local,
    Parameter,
    Function,
    Global,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub ty: Type,
    /// Nesting depth of the declaring scope (module scope is 0).
    pub depth: usize,
    pub kind: SymbolKind,
    pub span: Span,
    /// Name used from HIR onwards; differs from `name` when shadowing.
    pub ir_name: String,
}

#[derive(Debug, Clone)]
pub struct Scope {
    pub kind: ScopeKind,
    pub parent: Option<ScopeId>,
    symbols: BTreeMap<String, SymbolId>,
}

#[derive(Debug, Clone)]
pub struct ScopeTree {
    scopes: Vec<Scope>,
    symbols: Vec<Symbol>,
}

impl Default for ScopeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeTree {
    /// A tree holding only the module scope.
    pub fn new() -> Self {
        ScopeTree {
            scopes: vec![Scope {
                kind: ScopeKind::Module,
                parent: None,
                symbols: BTreeMap::new(),
            }],
            symbols: Vec::new(),
        }
    }

    pub fn root(&self) -> ScopeId {
        ScopeId(0)
    }

    pub fn push(&mut self, parent: ScopeId, kind: ScopeKind) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        self.scopes.push(Scope {
            kind,
            parent: Some(parent),
            symbols: BTreeMap::new(),
        });
        id
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0]
    }

    pub fn depth(&self, mut id: ScopeId) -> usize {
        let mut depth = 0;
        while let Some(parent) = self.scopes[id.0].parent {
            depth += 1;
            id = parent;
        }
        depth
    }

    /// Declare `name` in `scope`, replacing an earlier binding there.
    pub fn declare(
        &mut self,
        scope: ScopeId,
        name: &str,
        ty: Type,
        kind: SymbolKind,
        span: Span,
        ir_name: String,
    ) -> SymbolId {
        let id = SymbolId(self.symbols.len());
        let depth = self.depth(scope);
        self.symbols.push(Symbol {
            name: name.to_string(),
            ty,
            depth,
            kind,
            span,
            ir_name,
        });
        self.scopes[scope.0].symbols.insert(name.to_string(), id);
        id
    }

    /// Walk outwards from `scope` to the module scope.
    pub fn lookup(&self, scope: ScopeId, name: &str) -> Option<SymbolId> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let s = &self.scopes[id.0];
            if let Some(sym) = s.symbols.get(name) {
                return Some(*sym);
            }
            current = s.parent;
        }
        None
    }

    /// Like [`ScopeTree::lookup`] but stops at the enclosing function scope.
    pub fn lookup_in_function(&self, scope: ScopeId, name: &str) -> Option<SymbolId> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let s = &self.scopes[id.0];
            if s.kind == ScopeKind::Module {
                return None;
            }
            if let Some(sym) = s.symbols.get(name) {
                return Some(*sym);
            }
            if s.kind == ScopeKind::Function {
                return None;
            }
            current = s.parent;
        }
        None
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.0]
    }

    /// Every name visible from `scope`, innermost binding wins.
    pub fn visible_names(&self, scope: ScopeId) -> BTreeMap<String, SymbolId> {
        let mut out = BTreeMap::new();
        let mut current = Some(scope);
        while let Some(id) = current {
            let s = &self.scopes[id.0];
            for (name, sym) in &s.symbols {
                out.entry(name.clone()).or_insert(*sym);
            }
            current = s.parent;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inner_scopes_shadow_outer_ones() {
        let mut tree = ScopeTree::new();
        let root = tree.root();
        tree.declare(root, "x", Type::Int, SymbolKind::Global, Span::dummy(), "x".into());
        let func = tree.push(root, ScopeKind::Function);
        let block = tree.push(func, ScopeKind::Block);
        let inner = tree.declare(block, "x", Type::Str, SymbolKind::Local, Span::dummy(), "x.1".into());

        assert_eq!(tree.lookup(block, "x"), Some(inner));
        assert_eq!(tree.symbol(inner).depth, 2);
        assert_eq!(tree.symbol(tree.lookup(func, "x").expect("global")).kind, SymbolKind::Global);
        assert_eq!(tree.lookup_in_function(func, "x"), None);
        assert_eq!(tree.visible_names(block)["x"], inner);
    }

    #[test]
    fn parents_precede_children() {
        let mut tree = ScopeTree::new();
        let a = tree.push(tree.root(), ScopeKind::Function);
        let b = tree.push(a, ScopeKind::Block);
        assert!(tree.scope(b).parent.expect("parent").0 < b.0);
        assert_eq!(tree.depth(b), 2);
    }
}
