//! Name resolution and type inference.
//!
//! Input is the parsed [`Program`] (main unit plus library units), output
//! is a [`HirModule`] in which every name is bound and every expression
//! is typed.
//!
//! Inference runs over the whole module to a fixed point. Each pass
//! re-checks every function with fresh scopes, reading the types the
//! previous pass settled on (parameter types, return types, globals) and
//! accumulating new ones. Once a pass leaves those tables unchanged its
//! diagnostics and HIR are final.
//!
//! 関数は単相 (monomorphic)。注釈のない引数は最初は `unknown` で、
//! 呼び出し側の実引数の型で精密化される。

use std::collections::{BTreeMap, BTreeSet};

use crate::ast::{
    AssignTarget, BinaryOp, Expr, ExprKind, FStringPart, FunctionDef, Ident, Literal, Program,
    RawBlock, Stmt, StmtKind, UnaryOp,
};
use crate::builtins::find_builtin;
use crate::diagnostic::{Diagnostic, DiagnosticKind, has_errors};
use crate::hir::{
    HirExpr, HirExprKind, HirFStringPart, HirFunction, HirGlobal, HirLocal, HirModule, HirPlace,
    HirRaw, HirStmt, HirStmtKind, VarRef,
};
use crate::name_resolve::{ScopeId, ScopeKind, ScopeTree, SymbolKind};
use crate::span::Span;
use crate::types::{Type, binary_result, fits, from_annotation, join, unary_result};

const MAX_PASSES: usize = 16;

/// Name of the routine holding top-level code when `main` is user written.
pub const INIT_FUNCTION: &str = "__aim_init";

/// Prefix reserved for compiler generated and runtime symbols.
pub const RESERVED_PREFIX: &str = "__aim_";

#[derive(Debug)]
pub struct TypeCheckResult {
    /// `None` when any error was reported.
    pub module: Option<HirModule>,
    pub diagnostics: Vec<Diagnostic>,
}

pub fn typecheck(program: &Program) -> TypeCheckResult {
    let mut diagnostics = Vec::new();
    let plan = collect(program, &mut diagnostics);
    if has_errors(&diagnostics) {
        return TypeCheckResult {
            module: None,
            diagnostics,
        };
    }

    let mut tables = Tables::initial(&plan);
    let mut pass = 0;
    loop {
        pass += 1;
        let mut checker = Checker::new(&plan, &tables);
        let module = checker.check_module();
        let next = checker.next;
        let stable = next == tables;
        if stable || pass >= MAX_PASSES {
            if stable {
                log::debug!("type inference settled after {pass} passes");
            } else {
                log::warn!("type inference stopped after {MAX_PASSES} passes without settling");
            }
            diagnostics.extend(checker.diagnostics);
            let module = if has_errors(&diagnostics) { None } else { Some(module) };
            return TypeCheckResult {
                module,
                diagnostics,
            };
        }
        tables = next;
    }
}

// ----------------------------------------------------------------------
// Pass 1: signatures, globals, entry point
// ----------------------------------------------------------------------

struct PlannedParam {
    name: String,
    span: Span,
    annotation: Option<Type>,
}

struct PlannedFunction<'a> {
    name: String,
    params: Vec<PlannedParam>,
    ret: Option<Type>,
    body: Vec<&'a Stmt>,
    span: Span,
    /// Body made of top-level statements; assignments bind globals.
    top_level: bool,
}

struct Plan<'a> {
    functions: Vec<PlannedFunction<'a>>,
    /// Callable functions by name (synthetic ones are not callable).
    index: BTreeMap<String, usize>,
    globals: BTreeMap<String, Span>,
    entry: String,
    init: Option<String>,
}

fn collect<'a>(program: &'a Program, diags: &mut Vec<Diagnostic>) -> Plan<'a> {
    let mut library_defs: BTreeMap<String, (&'a FunctionDef, Span)> = BTreeMap::new();
    let mut library_order: Vec<String> = Vec::new();
    for module in &program.libraries {
        for item in &module.items {
            if let StmtKind::FunctionDef(def) = &item.kind {
                let name = def.name.name.clone();
                if library_defs.contains_key(&name) {
                    diags.push(conflict(
                        def.name.span,
                        format!("library function `{name}` is defined more than once"),
                    ));
                    continue;
                }
                library_order.push(name.clone());
                library_defs.insert(name, (def, item.span));
            }
        }
    }

    let mut user_defs: Vec<(&'a FunctionDef, Span)> = Vec::new();
    let mut top: Vec<&'a Stmt> = Vec::new();
    for item in &program.main.items {
        match &item.kind {
            StmtKind::FunctionDef(def) => {
                let name = &def.name.name;
                if user_defs.iter().any(|(d, _)| &d.name.name == name) {
                    diags.push(conflict(def.name.span, format!("function `{name}` is defined more than once")));
                    continue;
                }
                if library_defs.remove(name).is_some() {
                    log::debug!("user function `{name}` overrides the library definition");
                    library_order.retain(|n| n != name);
                }
                user_defs.push((def, item.span));
            }
            _ => top.push(item),
        }
    }

    let mut functions = Vec::new();
    let defs = library_order
        .iter()
        .filter_map(|n| library_defs.get(n).copied())
        .chain(user_defs.iter().copied());
    for (def, span) in defs {
        check_function_name(&def.name, diags);
        let mut params = Vec::new();
        for param in &def.params {
            if params.iter().any(|p: &PlannedParam| p.name == param.name.name) {
                diags.push(conflict(
                    param.name.span,
                    format!("duplicate parameter `{}`", param.name.name),
                ));
            }
            let annotation = param
                .annotation
                .as_ref()
                .and_then(|a| resolve_annotation(a, diags));
            params.push(PlannedParam {
                name: param.name.name.clone(),
                span: param.name.span,
                annotation,
            });
        }
        if def.name.name == "main" && !params.is_empty() {
            diags.push(conflict(def.name.span, "`main` must not take parameters"));
        }
        let ret = def.ret.as_ref().and_then(|a| resolve_annotation(a, diags));
        functions.push(PlannedFunction {
            name: def.name.name.clone(),
            params,
            ret,
            body: def.body.iter().collect(),
            span,
            top_level: false,
        });
    }

    let mut index = BTreeMap::new();
    for (i, f) in functions.iter().enumerate() {
        index.insert(f.name.clone(), i);
    }

    let mut globals = BTreeMap::new();
    collect_globals(top.iter().copied(), &mut globals);

    let has_main = index.contains_key("main");
    let (entry, init) = if has_main {
        let init = (!top.is_empty()).then(|| INIT_FUNCTION.to_string());
        ("main".to_string(), init)
    } else {
        ("main".to_string(), None)
    };
    if !has_main || !top.is_empty() {
        let name = init.clone().unwrap_or_else(|| "main".to_string());
        let span = match (top.first(), top.last()) {
            (Some(first), Some(last)) => first.span.join(last.span),
            _ => Span::new(program.main.file, 0, 0),
        };
        functions.push(PlannedFunction {
            name,
            params: Vec::new(),
            ret: None,
            body: top,
            span,
            top_level: true,
        });
    }

    Plan {
        functions,
        index,
        globals,
        entry,
        init,
    }
}

fn check_function_name(name: &Ident, diags: &mut Vec<Diagnostic>) {
    if find_builtin(&name.name).is_some() {
        diags.push(conflict(
            name.span,
            format!("`{}` is a builtin and cannot be redefined", name.name),
        ));
    } else if name.name == "_start" || name.name.starts_with(RESERVED_PREFIX) {
        diags.push(conflict(
            name.span,
            format!("`{}` is reserved for the compiler", name.name),
        ));
    }
}

fn resolve_annotation(expr: &crate::ast::TypeExpr, diags: &mut Vec<Diagnostic>) -> Option<Type> {
    match from_annotation(expr) {
        Ok(ty) => Some(ty),
        Err(message) => {
            diags.push(conflict(expr.span, message));
            None
        }
    }
}

/// Every name bound by top-level code, including inside its blocks.
fn collect_globals<'s>(stmts: impl IntoIterator<Item = &'s Stmt>, out: &mut BTreeMap<String, Span>) {
    for stmt in stmts {
        match &stmt.kind {
            StmtKind::Assign {
                target: AssignTarget::Name(id),
                ..
            } => {
                out.entry(id.name.clone()).or_insert(id.span);
            }
            StmtKind::For { target, body, .. } => {
                out.entry(target.name.clone()).or_insert(target.span);
                collect_globals(body, out);
            }
            StmtKind::While { body, .. } => collect_globals(body, out),
            StmtKind::If(if_stmt) => {
                for (_, body) in &if_stmt.branches {
                    collect_globals(body, out);
                }
                if let Some(body) = &if_stmt.else_body {
                    collect_globals(body, out);
                }
            }
            _ => {}
        }
    }
}

fn conflict(span: Span, message: impl Into<String>) -> Diagnostic {
    Diagnostic::error(DiagnosticKind::TypeConflictError, message, span)
}

// ----------------------------------------------------------------------
// Fixed point tables
// ----------------------------------------------------------------------

/// Types carried from one inference pass to the next.
#[derive(Debug, Clone, PartialEq, Default)]
struct Tables {
    params: BTreeMap<String, Vec<Type>>,
    returns: BTreeMap<String, Type>,
    globals: BTreeMap<String, Type>,
    /// Keyed by (function, local name).
    locals: BTreeMap<(String, String), Type>,
}

impl Tables {
    fn initial(plan: &Plan<'_>) -> Self {
        let mut tables = Tables::default();
        for f in &plan.functions {
            tables.params.insert(
                f.name.clone(),
                f.params
                    .iter()
                    .map(|p| p.annotation.clone().unwrap_or(Type::Unknown))
                    .collect(),
            );
            tables
                .returns
                .insert(f.name.clone(), f.ret.clone().unwrap_or(Type::Unknown));
        }
        for name in plan.globals.keys() {
            tables.globals.insert(name.clone(), Type::Unknown);
        }
        tables
    }
}

/// Join `ty` into `slot`; on conflict the slot is left alone and its
/// type returned.
fn accumulate(slot: &mut Type, ty: &Type) -> Result<(), Type> {
    match join(slot, ty) {
        Some(joined) => {
            *slot = joined;
            Ok(())
        }
        None => Err(slot.clone()),
    }
}

/// Names bound by assignments and `for` targets anywhere in `stmt`.
fn collect_assigned(stmt: &Stmt, out: &mut BTreeSet<String>) {
    match &stmt.kind {
        StmtKind::Assign {
            target: AssignTarget::Name(ident),
            ..
        } => {
            out.insert(ident.name.clone());
        }
        StmtKind::For { target, body, .. } => {
            out.insert(target.name.clone());
            body.iter().for_each(|s| collect_assigned(s, out));
        }
        StmtKind::While { body, .. } => body.iter().for_each(|s| collect_assigned(s, out)),
        StmtKind::If(if_stmt) => {
            for (_, body) in &if_stmt.branches {
                body.iter().for_each(|s| collect_assigned(s, out));
            }
            if let Some(body) = &if_stmt.else_body {
                body.iter().for_each(|s| collect_assigned(s, out));
            }
        }
        _ => {}
    }
}

/// Type seen by reads: what this pass assigned, refined by what the
/// previous pass settled on when the two agree.
fn with_hint(hint: Option<&Type>, acc: &Type) -> Type {
    hint.and_then(|h| join(h, acc)).unwrap_or_else(|| acc.clone())
}

// ----------------------------------------------------------------------
// One inference pass
// ----------------------------------------------------------------------

struct Checker<'p, 'a> {
    plan: &'p Plan<'a>,
    prev: &'p Tables,
    next: Tables,
    diagnostics: Vec<Diagnostic>,

    // State of the function being checked.
    current: usize,
    scopes: ScopeTree,
    scope: ScopeId,
    shadow: BTreeMap<String, usize>,
    locals: Vec<HirLocal>,
    /// Names the current function assigns; they never refer to globals.
    assigned: BTreeSet<String>,
}

impl<'p, 'a> Checker<'p, 'a> {
    fn new(plan: &'p Plan<'a>, prev: &'p Tables) -> Self {
        let next = Tables::initial(plan);
        let scopes = ScopeTree::new();
        let scope = scopes.root();
        Checker {
            plan,
            prev,
            next,
            diagnostics: Vec::new(),
            current: 0,
            scopes,
            scope,
            shadow: BTreeMap::new(),
            locals: Vec::new(),
            assigned: BTreeSet::new(),
        }
    }

    fn func(&self) -> &'p PlannedFunction<'a> {
        &self.plan.functions[self.current]
    }

    fn error(&mut self, kind: DiagnosticKind, span: Span, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::error(kind, message, span));
    }

    fn conflict(&mut self, span: Span, message: impl Into<String>) {
        self.error(DiagnosticKind::TypeConflictError, span, message);
    }

    fn check_module(&mut self) -> HirModule {
        let mut functions = Vec::new();
        for i in 0..self.plan.functions.len() {
            functions.push(self.check_function(i));
        }
        let globals = self
            .plan
            .globals
            .iter()
            .map(|(name, span)| HirGlobal {
                name: name.clone(),
                ty: self.next.globals.get(name).cloned().unwrap_or(Type::Unknown),
                span: *span,
            })
            .collect();
        HirModule {
            functions,
            globals,
            entry: self.plan.entry.clone(),
            init: self.plan.init.clone(),
        }
    }

    fn check_function(&mut self, index: usize) -> HirFunction {
        let plan = self.plan;
        let func = &plan.functions[index];
        self.current = index;
        self.scopes = ScopeTree::new();
        self.shadow.clear();
        self.locals.clear();
        self.assigned.clear();
        if !func.top_level {
            for stmt in &func.body {
                collect_assigned(stmt, &mut self.assigned);
            }
        }

        let root = self.scopes.root();
        for f in plan.functions.iter().filter(|f| !f.top_level) {
            let sig = Type::function(
                self.prev.params[&f.name].clone(),
                self.prev.returns[&f.name].clone(),
            );
            self.scopes
                .declare(root, &f.name, sig, SymbolKind::Function, f.span, f.name.clone());
        }
        if !func.top_level {
            for (name, span) in &plan.globals {
                let ty = self.prev.globals.get(name).cloned().unwrap_or(Type::Unknown);
                self.scopes
                    .declare(root, name, ty, SymbolKind::Global, *span, name.clone());
            }
        }

        let fscope = self.scopes.push(root, ScopeKind::Function);
        self.scope = fscope;
        for (k, param) in func.params.iter().enumerate() {
            let ty = self.prev.params[&func.name][k].clone();
            self.scopes.declare(
                fscope,
                &param.name,
                ty,
                SymbolKind::Parameter,
                param.span,
                param.name.clone(),
            );
            self.shadow.insert(param.name.clone(), 0);
        }

        let body: Vec<HirStmt> = func
            .body
            .iter()
            .filter_map(|stmt| self.check_stmt(stmt))
            .collect();

        let params = func
            .params
            .iter()
            .enumerate()
            .map(|(k, p)| HirLocal {
                name: p.name.clone(),
                source_name: p.name.clone(),
                ty: with_hint(
                    self.prev.params[&func.name].get(k),
                    &self.next.params[&func.name][k],
                ),
                span: p.span,
            })
            .collect();
        let mut locals = std::mem::take(&mut self.locals);
        for local in &mut locals {
            let key = (func.name.clone(), local.name.clone());
            let acc = self.next.locals.get(&key).cloned().unwrap_or(Type::Unknown);
            local.ty = with_hint(self.prev.locals.get(&key), &acc);
        }

        HirFunction {
            name: func.name.clone(),
            params,
            result: self.next.returns[&func.name].clone(),
            locals,
            body,
            span: func.span,
            synthetic: func.top_level,
        }
    }

    // ------------------------------------------------------------------
    // Bindings
    // ------------------------------------------------------------------

    fn fresh_local_name(&mut self, name: &str) -> String {
        match self.shadow.get_mut(name) {
            Some(count) => {
                *count += 1;
                format!("{name}.{count}")
            }
            None => {
                self.shadow.insert(name.to_string(), 0);
                name.to_string()
            }
        }
    }

    /// Bind `ident` to a value of type `ty`, declaring it if needed.
    fn assign_to(&mut self, ident: &Ident, ty: &Type) -> Option<VarRef> {
        let name = &ident.name;
        if self.plan.index.contains_key(name) || find_builtin(name).is_some() {
            self.conflict(ident.span, format!("cannot assign to function `{name}`"));
            return None;
        }
        if self.func().top_level {
            return Some(self.assign_global(ident, ty));
        }

        let fn_name = self.func().name.clone();
        let Some(id) = self.scopes.lookup_in_function(self.scope, name) else {
            let ir_name = self.fresh_local_name(name);
            let key = (fn_name, ir_name.clone());
            let read = with_hint(self.prev.locals.get(&key), ty);
            self.next.locals.insert(key, ty.clone());
            self.scopes
                .declare(self.scope, name, read, SymbolKind::Local, ident.span, ir_name.clone());
            self.locals.push(HirLocal {
                name: ir_name.clone(),
                source_name: name.clone(),
                ty: ty.clone(),
                span: ident.span,
            });
            return Some(VarRef::Local(ir_name));
        };

        let symbol = self.scopes.symbol(id).clone();
        let outcome = match symbol.kind {
            SymbolKind::Parameter => {
                let k = self
                    .func()
                    .params
                    .iter()
                    .position(|p| p.name == symbol.name)
                    .unwrap_or_default();
                match &self.func().params[k].annotation {
                    Some(annotation) if !fits(annotation, ty) => Err(annotation.clone()),
                    Some(_) => Ok(()),
                    None => match self.next.params.get_mut(&fn_name) {
                        Some(slots) => accumulate(&mut slots[k], ty),
                        None => Ok(()),
                    },
                }
            }
            _ => {
                let slot = self
                    .next
                    .locals
                    .entry((fn_name, symbol.ir_name.clone()))
                    .or_insert(Type::Unknown);
                accumulate(slot, ty)
            }
        };
        match outcome {
            Ok(()) => {
                let read = join(&symbol.ty, ty).unwrap_or(symbol.ty);
                self.scopes.symbol_mut(id).ty = read;
            }
            Err(held) => self.conflict(
                ident.span,
                format!("cannot assign `{ty}` to `{name}`, which holds `{held}`"),
            ),
        }
        Some(VarRef::Local(symbol.ir_name))
    }

    fn assign_global(&mut self, ident: &Ident, ty: &Type) -> VarRef {
        let name = &ident.name;
        let slot = self
            .next
            .globals
            .entry(name.clone())
            .or_insert(Type::Unknown);
        if let Err(held) = accumulate(slot, ty) {
            self.conflict(
                ident.span,
                format!("cannot assign `{ty}` to `{name}`, which holds `{held}`"),
            );
        }
        let acc = self.next.globals[name].clone();
        let read = with_hint(self.prev.globals.get(name), &acc);
        let root = self.scopes.root();
        match self.scopes.lookup(root, name) {
            Some(id) => self.scopes.symbol_mut(id).ty = read,
            None => {
                self.scopes
                    .declare(root, name, read, SymbolKind::Global, ident.span, name.clone());
            }
        }
        VarRef::Global(name.clone())
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn check_block(&mut self, stmts: &[Stmt]) -> Vec<HirStmt> {
        let saved = self.scope;
        self.scope = self.scopes.push(saved, ScopeKind::Block);
        let out: Vec<HirStmt> = stmts.iter().filter_map(|s| self.check_stmt(s)).collect();
        self.scope = saved;
        out
    }

    fn check_condition(&mut self, expr: &Expr) -> HirExpr {
        let cond = self.check_expr(expr);
        if !cond.ty.is_truthy() {
            self.conflict(cond.span, format!("a value of type `{}` cannot be used as a condition", cond.ty));
            return HirExpr::error(cond.span);
        }
        cond
    }

    fn check_stmt(&mut self, stmt: &Stmt) -> Option<HirStmt> {
        let span = stmt.span;
        let kind = match &stmt.kind {
            StmtKind::FunctionDef(def) => {
                self.error(
                    DiagnosticKind::ParseError,
                    def.name.span,
                    "function definitions are only allowed at the top level",
                );
                return None;
            }
            StmtKind::If(if_stmt) => {
                let mut branches = Vec::new();
                for (cond, body) in &if_stmt.branches {
                    let cond = self.check_condition(cond);
                    let body = self.check_block(body);
                    branches.push((cond, body));
                }
                let else_body = match &if_stmt.else_body {
                    Some(body) => self.check_block(body),
                    None => Vec::new(),
                };
                HirStmtKind::If {
                    branches,
                    else_body,
                }
            }
            StmtKind::While { cond, body } => {
                let cond = self.check_condition(cond);
                let body = self.check_block(body);
                HirStmtKind::While { cond, body }
            }
            StmtKind::For { target, iter, body } => {
                let iter = self.check_expr(iter);
                let elem = match &iter.ty {
                    Type::List(elem) => (**elem).clone(),
                    Type::Str => Type::Str,
                    Type::Unknown => Type::Unknown,
                    Type::Error => Type::Error,
                    other => {
                        self.conflict(iter.span, format!("cannot iterate over a value of type `{other}`"));
                        Type::Error
                    }
                };
                let var = self.assign_to(target, &elem);
                let body = self.check_block(body);
                HirStmtKind::For {
                    var: var?,
                    iter,
                    body,
                }
            }
            StmtKind::Return(value) => {
                let value = value.as_ref().map(|v| self.check_expr(v));
                if let Some(v) = &value {
                    self.record_return(v);
                }
                HirStmtKind::Return(value)
            }
            StmtKind::Assign { target, op, value } => self.check_assign(target, *op, value, span)?,
            StmtKind::Expr(expr) => HirStmtKind::Expr(self.check_expr(expr)),
            StmtKind::Break => HirStmtKind::Break,
            StmtKind::Continue => HirStmtKind::Continue,
            StmtKind::Pass => return None,
            StmtKind::Raw(raw) => HirStmtKind::Raw(self.raw_snapshot(raw, span)),
        };
        Some(HirStmt { kind, span })
    }

    fn record_return(&mut self, value: &HirExpr) {
        let func = self.func();
        if let Some(annotation) = &func.ret {
            if !fits(annotation, &value.ty) {
                self.conflict(
                    value.span,
                    format!("`{}` is declared to return `{annotation}`, found `{}`", func.name, value.ty),
                );
            }
            return;
        }
        let slot = self
            .next
            .returns
            .entry(func.name.clone())
            .or_insert(Type::Unknown);
        if let Err(held) = accumulate(slot, &value.ty) {
            self.conflict(
                value.span,
                format!("`{}` already returns `{held}`, cannot also return `{}`", func.name, value.ty),
            );
        }
    }

    fn check_assign(
        &mut self,
        target: &AssignTarget,
        op: Option<BinaryOp>,
        value: &Expr,
        span: Span,
    ) -> Option<HirStmtKind> {
        let value = self.check_expr(value);
        match target {
            AssignTarget::Name(ident) => {
                let value = match op {
                    Some(op) => {
                        let current = self.check_name(&ident.name, ident.span);
                        self.binary(op, current, value, span)
                    }
                    None => value,
                };
                let var = self.assign_to(ident, &value.ty)?;
                Some(HirStmtKind::Assign {
                    target: HirPlace::Var(var),
                    value,
                })
            }
            AssignTarget::Index { base, index } => {
                let base = self.check_expr(base);
                let index = self.check_expr(index);
                let value = match op {
                    Some(op) => {
                        let current = self.index_expr(base.clone(), index.clone(), span);
                        self.binary(op, current, value, span)
                    }
                    None => value,
                };
                match &base.ty {
                    Type::List(elem) => {
                        if join(elem, &value.ty).is_none() {
                            self.conflict(
                                value.span,
                                format!("cannot store `{}` in a `{}`", value.ty, base.ty),
                            );
                        }
                    }
                    Type::Str => self.conflict(base.span, "strings are immutable"),
                    Type::Unknown | Type::Error => {}
                    other => self.conflict(
                        base.span,
                        format!("a value of type `{other}` does not support item assignment"),
                    ),
                }
                self.check_index_type(&index);
                Some(HirStmtKind::Assign {
                    target: HirPlace::Index { base, index },
                    value,
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn check_expr(&mut self, expr: &Expr) -> HirExpr {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Literal(lit) => match lit {
                Literal::Int(v) => HirExpr::new(HirExprKind::Int(*v), Type::Int, span),
                Literal::Float(v) => HirExpr::new(HirExprKind::Float(*v), Type::Float, span),
                Literal::Str(s) => HirExpr::new(HirExprKind::Str(s.clone()), Type::Str, span),
                Literal::Bool(b) => HirExpr::new(HirExprKind::Bool(*b), Type::Bool, span),
                Literal::None => HirExpr::new(HirExprKind::NoneValue, Type::Unknown, span),
            },
            ExprKind::Name(name) => self.check_name(name, span),
            ExprKind::Binary { op, lhs, rhs } => {
                let lhs = self.check_expr(lhs);
                let rhs = self.check_expr(rhs);
                self.binary(*op, lhs, rhs, span)
            }
            ExprKind::Unary { op, operand } => {
                let operand = self.check_expr(operand);
                self.unary(*op, operand, span)
            }
            ExprKind::Call { callee, args } => self.check_call(callee, args, span),
            ExprKind::List(items) => {
                let items: Vec<HirExpr> = items.iter().map(|e| self.check_expr(e)).collect();
                let mut elem = Some(Type::Unknown);
                for item in &items {
                    elem = elem.and_then(|t| join(&t, &item.ty));
                }
                let elem = match elem {
                    Some(t) => t,
                    None => {
                        self.diagnostics.push(Diagnostic::warning(
                            DiagnosticKind::TypeConflictError,
                            "list elements have different types; the list is typed `list[unknown]`",
                            span,
                        ));
                        Type::Unknown
                    }
                };
                HirExpr::new(HirExprKind::List(items), Type::list(elem), span)
            }
            ExprKind::Index { base, index } => {
                let base = self.check_expr(base);
                let index = self.check_expr(index);
                self.check_index_type(&index);
                self.index_expr(base, index, span)
            }
            ExprKind::FString(parts) => {
                let mut out = Vec::new();
                for part in parts {
                    match part {
                        FStringPart::Text(text) => out.push(HirFStringPart::Text(text.clone())),
                        FStringPart::Expr(e) => {
                            let e = self.check_expr(e);
                            if matches!(e.ty, Type::Function { .. }) {
                                self.conflict(e.span, "a function cannot be formatted");
                            }
                            out.push(HirFStringPart::Expr(e));
                        }
                    }
                }
                HirExpr::new(HirExprKind::FString(out), Type::Str, span)
            }
            ExprKind::Raw(raw) => {
                let raw = self.raw_snapshot(raw, span);
                HirExpr::new(HirExprKind::Raw(raw), Type::Unknown, span)
            }
            ExprKind::Error => HirExpr::error(span),
        }
    }

    fn check_name(&mut self, name: &str, span: Span) -> HirExpr {
        let Some(id) = self.scopes.lookup(self.scope, name) else {
            if find_builtin(name).is_some() {
                self.conflict(span, format!("builtin `{name}` cannot be used as a value"));
            } else {
                self.error(
                    DiagnosticKind::UnboundNameError,
                    span,
                    format!("name `{name}` is not defined"),
                );
            }
            return HirExpr::error(span);
        };
        if self.scopes.symbol(id).kind == SymbolKind::Global && self.assigned.contains(name) {
            self.error(
                DiagnosticKind::UnboundNameError,
                span,
                format!("local variable `{name}` is read before it is assigned"),
            );
            return HirExpr::error(span);
        }
        let symbol = self.scopes.symbol(id);
        let kind = match symbol.kind {
            SymbolKind::Global => HirExprKind::Var(VarRef::Global(symbol.ir_name.clone())),
            SymbolKind::Local | SymbolKind::Parameter => {
                HirExprKind::Var(VarRef::Local(symbol.ir_name.clone()))
            }
            SymbolKind::Function => HirExprKind::FunctionRef(symbol.name.clone()),
        };
        HirExpr::new(kind, symbol.ty.clone(), span)
    }

    fn binary(&mut self, op: BinaryOp, lhs: HirExpr, rhs: HirExpr, span: Span) -> HirExpr {
        let ty = match binary_result(op, &lhs.ty, &rhs.ty) {
            Ok(ty) => ty,
            Err(()) => {
                self.conflict(
                    span,
                    format!(
                        "unsupported operand types for `{}`: `{}` and `{}`",
                        op.symbol(),
                        lhs.ty,
                        rhs.ty
                    ),
                );
                Type::Error
            }
        };
        HirExpr::new(
            HirExprKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            ty,
            span,
        )
    }

    fn unary(&mut self, op: UnaryOp, operand: HirExpr, span: Span) -> HirExpr {
        let ty = match unary_result(op, &operand.ty) {
            Ok(ty) => ty,
            Err(()) => {
                self.conflict(
                    span,
                    format!("unsupported operand type for `{}`: `{}`", op.symbol(), operand.ty),
                );
                Type::Error
            }
        };
        HirExpr::new(
            HirExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            ty,
            span,
        )
    }

    fn check_index_type(&mut self, index: &HirExpr) {
        if !matches!(index.ty, Type::Int | Type::Bool | Type::Unknown | Type::Error) {
            self.conflict(index.span, format!("indices must be `int`, found `{}`", index.ty));
        }
    }

    fn index_expr(&mut self, base: HirExpr, index: HirExpr, span: Span) -> HirExpr {
        let ty = match &base.ty {
            Type::List(elem) => (**elem).clone(),
            Type::Str => Type::Str,
            Type::Unknown => Type::Unknown,
            Type::Error => Type::Error,
            other => {
                self.conflict(base.span, format!("a value of type `{other}` cannot be indexed"));
                Type::Error
            }
        };
        HirExpr::new(
            HirExprKind::Index {
                base: Box::new(base),
                index: Box::new(index),
            },
            ty,
            span,
        )
    }

    fn check_call(&mut self, callee: &Ident, args: &[Expr], span: Span) -> HirExpr {
        let args: Vec<HirExpr> = args.iter().map(|a| self.check_expr(a)).collect();
        let name = &callee.name;
        let bound = self
            .scopes
            .lookup(self.scope, name)
            .map(|id| self.scopes.symbol(id).kind);

        match bound {
            Some(SymbolKind::Function) => self.call_user(callee, args, span),
            Some(_) => {
                self.conflict(callee.span, format!("`{name}` is not a function"));
                HirExpr::error(span)
            }
            None => {
                let Some(builtin) = find_builtin(name) else {
                    self.error(
                        DiagnosticKind::UnboundNameError,
                        callee.span,
                        format!("function `{name}` is not defined"),
                    );
                    return HirExpr::error(span);
                };
                if !builtin.accepts(args.len()) {
                    self.conflict(
                        span,
                        format!(
                            "`{name}` takes {} argument(s), found {}",
                            builtin.arity(),
                            args.len()
                        ),
                    );
                    return HirExpr::error(span);
                }
                let types: Vec<Type> = args.iter().map(|a| a.ty.clone()).collect();
                let ty = match crate::builtins::builtin_result(builtin.kind, &types) {
                    Ok(ty) => ty,
                    Err(message) => {
                        self.conflict(span, message);
                        Type::Error
                    }
                };
                HirExpr::new(
                    HirExprKind::Builtin {
                        kind: builtin.kind,
                        args,
                    },
                    ty,
                    span,
                )
            }
        }
    }

    fn call_user(&mut self, callee: &Ident, args: Vec<HirExpr>, span: Span) -> HirExpr {
        let plan = self.plan;
        let name = &callee.name;
        let Some(target) = plan.index.get(name).map(|&i| &plan.functions[i]) else {
            self.error(
                DiagnosticKind::UnboundNameError,
                callee.span,
                format!("function `{name}` is not defined"),
            );
            return HirExpr::error(span);
        };
        if args.len() != target.params.len() {
            self.conflict(
                span,
                format!(
                    "`{name}` takes {} argument(s), found {}",
                    target.params.len(),
                    args.len()
                ),
            );
            return HirExpr::error(span);
        }

        for (k, (arg, param)) in args.iter().zip(&target.params).enumerate() {
            if arg.ty.is_error() {
                continue;
            }
            match &param.annotation {
                Some(annotation) => {
                    if !fits(annotation, &arg.ty) {
                        self.conflict(
                            arg.span,
                            format!(
                                "parameter `{}` of `{name}` is `{annotation}`, found `{}`",
                                param.name, arg.ty
                            ),
                        );
                    }
                }
                None => {
                    let outcome = match self.next.params.get_mut(name) {
                        Some(slots) => accumulate(&mut slots[k], &arg.ty),
                        None => Ok(()),
                    };
                    if let Err(held) = outcome {
                        self.conflict(
                            arg.span,
                            format!(
                                "parameter `{}` of `{name}` was inferred as `{held}` from an earlier call, found `{}`",
                                param.name, arg.ty
                            ),
                        );
                    }
                }
            }
        }

        let ty = self.prev.returns.get(name).cloned().unwrap_or(Type::Unknown);
        HirExpr::new(
            HirExprKind::Call {
                callee: name.clone(),
                args,
            },
            ty,
            span,
        )
    }

    fn raw_snapshot(&self, raw: &RawBlock, span: Span) -> HirRaw {
        let mut scope = BTreeMap::new();
        for (name, id) in self.scopes.visible_names(self.scope) {
            let symbol = self.scopes.symbol(id);
            let var = match symbol.kind {
                SymbolKind::Global => VarRef::Global(symbol.ir_name.clone()),
                SymbolKind::Local | SymbolKind::Parameter => VarRef::Local(symbol.ir_name.clone()),
                SymbolKind::Function => continue,
            };
            scope.insert(name, (var, symbol.ty.clone()));
        }
        HirRaw {
            lang: raw.lang,
            payload: raw.payload.clone(),
            span,
            scope,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Module;
    use crate::parser::parse_str;
    use crate::span::FileId;

    fn module(file: u32, source: &str) -> Module {
        let result = parse_str(FileId(file), source);
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
        result.module
    }

    fn check(source: &str) -> TypeCheckResult {
        typecheck(&Program {
            main: module(0, source),
            libraries: Vec::new(),
        })
    }

    fn check_ok(source: &str) -> HirModule {
        let result = check(source);
        assert!(!has_errors(&result.diagnostics), "{:?}", result.diagnostics);
        result.module.expect("module")
    }

    fn errors(source: &str) -> Vec<Diagnostic> {
        check(source)
            .diagnostics
            .into_iter()
            .filter(|d| d.is_error())
            .collect()
    }

    #[test]
    fn unbound_name_is_reported_once_at_the_reference() {
        let source = "def f(): return x; end;";
        let diags = errors(source);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::UnboundNameError);
        let at = source.find('x').expect("x") as u32;
        assert_eq!(diags[0].span.start, at);
    }

    #[test]
    fn parameters_are_refined_by_call_sites() {
        let hir = check_ok("def double(x):\n  return x * 2;\nend;\nprint(double(2.5));");
        let double = hir.function("double").expect("double");
        assert_eq!(double.params[0].ty, Type::Float);
        assert_eq!(double.result, Type::Float);
    }

    #[test]
    fn call_site_types_reach_parameters() {
        let hir = check_ok("def f(a, b): return a + b; end;\ndef main(): return f(1, 2); end;");
        let f = hir.function("f").expect("f");
        assert_eq!(f.params[0].ty, Type::Int);
        assert_eq!(f.params[1].ty, Type::Int);
        assert_eq!(f.result, Type::Int);

        let hir = check_ok("def scale(x):\n  y = x * 2.0;\n  return y;\nend;\nprint(scale(3.0));");
        let scale = hir.function("scale").expect("scale");
        assert_eq!(scale.params[0].ty, Type::Float);
        assert_eq!(scale.locals[0].ty, Type::Float);
    }

    #[test]
    fn assigned_name_shadowing_a_global_is_read_before_assignment() {
        let source = "g = 10;\ndef bump():\n  g = g + 1;\n  return g;\nend;\nprint(bump(), bump(), g);";
        let diags = errors(source);
        assert_eq!(diags.len(), 1, "{diags:?}");
        assert_eq!(diags[0].kind, DiagnosticKind::UnboundNameError);
        assert!(diags[0].message.contains("read before it is assigned"));
        let read = source.find("g + 1").expect("read") as u32;
        assert_eq!(diags[0].span.start, read);
    }

    #[test]
    fn functions_read_globals_they_never_assign() {
        let hir = check_ok("g = 10;\ndef peek(): return g + 1; end;\nprint(peek(), g);");
        assert_eq!(hir.function("peek").expect("peek").result, Type::Int);

        // Assigning first makes the name a plain local.
        check_ok("g = 10;\ndef fresh():\n  g = 1;\n  return g;\nend;\nprint(fresh(), g);");
    }

    #[test]
    fn conflicting_call_sites_are_rejected() {
        let source = "def f(x): return x; end;\ndef main():\n  a = f(1);\n  b = f(2.5);\n  return 0;\nend;";
        let diags = errors(source);
        assert_eq!(diags.len(), 1, "{diags:?}");
        assert_eq!(diags[0].kind, DiagnosticKind::TypeConflictError);
        assert_eq!(diags[0].span.start, source.find("2.5").expect("arg") as u32);
    }

    #[test]
    fn forward_references_resolve() {
        let hir = check_ok("def a(): return b() + 1; end;\ndef b(): return 41; end;\nprint(a());");
        assert_eq!(hir.function("a").expect("a").result, Type::Int);
    }

    #[test]
    fn top_level_code_becomes_main_or_init() {
        let hir = check_ok("x = 1;\nprint(x);");
        assert_eq!(hir.entry, "main");
        assert!(hir.init.is_none());
        assert!(hir.function("main").expect("main").synthetic);
        assert_eq!(hir.globals[0].name, "x");
        assert_eq!(hir.globals[0].ty, Type::Int);

        let hir = check_ok("x = 1;\ndef main(): return x; end;");
        assert_eq!(hir.init.as_deref(), Some(INIT_FUNCTION));
        assert!(!hir.function("main").expect("main").synthetic);
    }

    #[test]
    fn top_level_reads_need_an_earlier_assignment() {
        let diags = errors("print(y);\ny = 2;");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::UnboundNameError);
        // Functions may read globals assigned anywhere.
        check_ok("def show(): print(y); end;\ny = 2;\nshow();");
    }

    #[test]
    fn shadowed_block_locals_get_distinct_names() {
        let hir = check_ok(
            "def f(c):\n  if c:\n    t = 1;\n  end;\n  if c:\n    t = \"s\";\n  end;\n  return 0;\nend;\nf(True);",
        );
        let f = hir.function("f").expect("f");
        let names: Vec<(&str, &Type)> = f.locals.iter().map(|l| (l.name.as_str(), &l.ty)).collect();
        assert_eq!(names, vec![("t", &Type::Int), ("t.1", &Type::Str)]);
    }

    #[test]
    fn rebinding_with_a_different_type_conflicts() {
        let diags = errors("def f():\n  v = 1;\n  v = \"one\";\n  return 0;\nend;");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::TypeConflictError);
    }

    #[test]
    fn empty_list_is_refined_by_later_assignment() {
        let hir = check_ok("def f():\n  xs = [];\n  xs = xs + [1];\n  return xs;\nend;\nprint(len(f()));");
        assert_eq!(hir.function("f").expect("f").result, Type::list(Type::Int));
    }

    #[test]
    fn heterogeneous_list_is_a_warning() {
        let result = check("xs = [1, \"a\"];");
        assert!(!has_errors(&result.diagnostics));
        assert_eq!(result.diagnostics.len(), 1);
        let hir = result.module.expect("module");
        assert_eq!(hir.globals[0].ty, Type::list(Type::Unknown));
    }

    #[test]
    fn user_functions_override_library_ones() {
        let program = Program {
            main: module(0, "def abs(x): return 7; end;\nprint(abs(1));"),
            libraries: vec![module(1, "def abs(x):\n  if x < 0: return -x; end;\n  return x;\nend;")],
        };
        let result = typecheck(&program);
        assert!(!has_errors(&result.diagnostics), "{:?}", result.diagnostics);
        let hir = result.module.expect("module");
        let abs: Vec<_> = hir.functions.iter().filter(|f| f.name == "abs").collect();
        assert_eq!(abs.len(), 1);
        assert_eq!(abs[0].span.file, FileId(0));
    }

    #[test]
    fn builtins_cannot_be_redefined_or_misused() {
        assert_eq!(errors("def print(x): return x; end;").len(), 1);
        assert_eq!(errors("x = len(1, 2);").len(), 1);
        assert_eq!(errors("x = \"a\" - 1;").len(), 1);
    }

    #[test]
    fn raw_blocks_capture_visible_names() {
        let hir = check_ok("def f(a):\n  b = 2;\n  asm { mov rax, {a} };\n  return b;\nend;\nf(1);");
        let f = hir.function("f").expect("f");
        let HirStmtKind::Raw(raw) = &f.body[1].kind else {
            panic!("expected raw statement");
        };
        assert!(raw.scope.contains_key("a"));
        assert!(raw.scope.contains_key("b"));
        assert!(!raw.scope.contains_key("f"));
    }

    #[test]
    fn main_must_not_take_parameters() {
        assert_eq!(errors("def main(argc): return 0; end;").len(), 1);
    }
}
