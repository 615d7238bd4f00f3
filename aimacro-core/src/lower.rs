//! Lowering from HIR to IR.
//!
//! Control flow becomes labels and branches, aggregates become heap
//! blocks (`[len][elem0][elem1]...`, 8-byte words) and builtins become
//! IR sequences or calls into the runtime. Strings are constants in the
//! data section laid out as `[len][bytes]`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::ast::{BinaryOp, RawLang, UnaryOp};
use crate::builtins::BuiltinKind;
use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::hir::{
    HirExpr, HirExprKind, HirFStringPart, HirFunction, HirModule, HirPlace, HirRaw, HirStmt,
    HirStmtKind, VarRef,
};
use crate::ir::{
    BinOpKind, Instr, IrFunction, IrGlobal, IrModule, IrType, IrVar, Operand, Place, UnOpKind,
};
use crate::ir_text::parse_instructions;
use crate::span::Span;
use crate::types::Type;

// Runtime routines called from lowered code.
pub const RT_PRINT_STR: &str = "__aim_print_str";
pub const RT_INT_TO_STR: &str = "__aim_int_to_str";
pub const RT_FLOAT_TO_STR: &str = "__aim_float_to_str";
pub const RT_STR_CONCAT: &str = "__aim_str_concat";
pub const RT_LIST_CONCAT: &str = "__aim_list_concat";
pub const RT_STR_EQ: &str = "__aim_str_eq";
pub const RT_STR_INDEX: &str = "__aim_str_index";
pub const RT_CHECK_INDEX: &str = "__aim_check_index";
pub const RT_RANGE: &str = "__aim_range";
pub const RT_POW_INT: &str = "__aim_pow_int";
pub const RT_EXIT: &str = "__aim_exit";

pub fn lower(module: &HirModule) -> Result<IrModule, Vec<Diagnostic>> {
    let mut ctx = ModuleCtx {
        strings: Vec::new(),
        string_index: BTreeMap::new(),
        globals: module
            .globals
            .iter()
            .map(|g| (g.name.clone(), IrType::from_type(&g.ty)))
            .collect(),
        diagnostics: Vec::new(),
    };

    let mut functions = Vec::new();
    for func in &module.functions {
        functions.push(FunctionLowerer::new(&mut ctx, func).lower(func));
    }
    if !ctx.diagnostics.is_empty() {
        return Err(ctx.diagnostics);
    }

    let mut roots = vec![module.entry.clone()];
    roots.extend(module.init.iter().cloned());
    let functions = drop_unreachable(functions, &roots);

    Ok(IrModule {
        functions,
        globals: module
            .globals
            .iter()
            .map(|g| IrGlobal {
                name: g.name.clone(),
                ty: IrType::from_type(&g.ty),
            })
            .collect(),
        strings: ctx.strings,
        entry: module.entry.clone(),
        init: module.init.clone(),
    })
}

/// Keep only functions reachable from `roots` through calls (including
/// names mentioned in raw assembly). Order is preserved.
pub fn drop_unreachable(functions: Vec<IrFunction>, roots: &[String]) -> Vec<IrFunction> {
    let by_name: BTreeMap<&str, &IrFunction> =
        functions.iter().map(|f| (f.name.as_str(), f)).collect();
    let mut reachable: BTreeSet<String> = BTreeSet::new();
    let mut queue: VecDeque<&str> = roots.iter().map(String::as_str).collect();

    while let Some(name) = queue.pop_front() {
        let Some(func) = by_name.get(name) else {
            continue;
        };
        if !reachable.insert(name.to_string()) {
            continue;
        }
        for instr in &func.body {
            match instr {
                Instr::Call { func: callee, .. } => queue.push_back(callee),
                Instr::RawEmit { text, .. } => {
                    for word in text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.')) {
                        if by_name.contains_key(word) {
                            queue.push_back(word);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    let before = functions.len();
    let kept: Vec<IrFunction> = functions
        .into_iter()
        .filter(|f| reachable.contains(&f.name))
        .collect();
    if kept.len() < before {
        log::debug!("dropped {} unreachable function(s)", before - kept.len());
    }
    kept
}

struct ModuleCtx {
    strings: Vec<String>,
    string_index: BTreeMap<String, usize>,
    globals: BTreeMap<String, IrType>,
    diagnostics: Vec<Diagnostic>,
}

impl ModuleCtx {
    fn intern(&mut self, text: &str) -> usize {
        if let Some(&index) = self.string_index.get(text) {
            return index;
        }
        let index = self.strings.len();
        self.strings.push(text.to_string());
        self.string_index.insert(text.to_string(), index);
        index
    }
}

struct LoopLabels {
    continue_label: String,
    break_label: String,
}

struct FunctionLowerer<'c> {
    ctx: &'c mut ModuleCtx,
    vars: Vec<IrVar>,
    types: BTreeMap<String, IrType>,
    body: Vec<Instr>,
    next_temp: usize,
    next_label: usize,
    next_block: usize,
    loops: Vec<LoopLabels>,
}

impl<'c> FunctionLowerer<'c> {
    fn new(ctx: &'c mut ModuleCtx, func: &HirFunction) -> Self {
        let mut types = BTreeMap::new();
        for p in &func.params {
            types.insert(p.name.clone(), IrType::from_type(&p.ty));
        }
        let mut vars = Vec::new();
        for local in &func.locals {
            let ty = IrType::from_type(&local.ty);
            types.insert(local.name.clone(), ty);
            vars.push(IrVar {
                name: local.name.clone(),
                ty,
            });
        }
        FunctionLowerer {
            ctx,
            vars,
            types,
            body: Vec::new(),
            next_temp: 0,
            next_label: 0,
            next_block: 0,
            loops: Vec::new(),
        }
    }

    fn lower(mut self, func: &HirFunction) -> IrFunction {
        for stmt in &func.body {
            self.stmt(stmt);
        }
        if !matches!(self.body.last(), Some(Instr::Return(_))) {
            self.emit(Instr::Return(Some(Operand::Int(0))));
        }
        IrFunction {
            name: func.name.clone(),
            params: func
                .params
                .iter()
                .map(|p| (p.name.clone(), IrType::from_type(&p.ty)))
                .collect(),
            ret: IrType::from_type(&func.result),
            vars: self.vars,
            body: self.body,
            span: func.span,
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn error(&mut self, span: Span, message: impl Into<String>) {
        self.ctx
            .diagnostics
            .push(Diagnostic::error(DiagnosticKind::LoweringError, message, span));
    }

    fn emit(&mut self, instr: Instr) {
        self.body.push(instr);
    }

    fn temp(&mut self, ty: IrType) -> String {
        let name = self.next_temp.to_string();
        self.next_temp += 1;
        self.declare(&name, ty);
        name
    }

    fn declare(&mut self, name: &str, ty: IrType) {
        if self.types.insert(name.to_string(), ty).is_none() {
            self.vars.push(IrVar {
                name: name.to_string(),
                ty,
            });
        }
    }

    fn label(&mut self) -> String {
        let name = format!("L{}", self.next_label);
        self.next_label += 1;
        name
    }

    fn call(&mut self, func: &str, args: Vec<Operand>, ty: IrType) -> Operand {
        let dst = self.temp(ty);
        self.emit(Instr::Call {
            dst: Some(Place::Var(dst.clone())),
            func: func.to_string(),
            args,
        });
        Operand::Var(dst)
    }

    fn binop(&mut self, op: BinOpKind, ty: IrType, lhs: Operand, rhs: Operand) -> Operand {
        let result_ty = if op.is_comparison() { IrType::Bool } else { ty };
        let dst = self.temp(result_ty);
        self.emit(Instr::BinOp {
            dst: Place::Var(dst.clone()),
            op,
            ty,
            lhs,
            rhs,
        });
        Operand::Var(dst)
    }

    fn unop(&mut self, op: UnOpKind, ty: IrType, src: Operand) -> Operand {
        let dst = self.temp(ty);
        self.emit(Instr::UnOp {
            dst: Place::Var(dst.clone()),
            op,
            ty,
            src,
        });
        Operand::Var(dst)
    }

    fn place_type(&self, place: &Place) -> IrType {
        match place {
            Place::Var(name) => self.types.get(name).copied().unwrap_or(IrType::I64),
            Place::Global(name) => self.ctx.globals.get(name).copied().unwrap_or(IrType::I64),
        }
    }

    fn var_place(var: &VarRef) -> Place {
        match var {
            VarRef::Local(name) => Place::Var(name.clone()),
            VarRef::Global(name) => Place::Global(name.clone()),
        }
    }

    fn assign(&mut self, place: Place, src: Operand) {
        let ty = self.place_type(&place);
        self.emit(Instr::Move { dst: place, ty, src });
    }

    fn str_const(&mut self, text: &str) -> Operand {
        Operand::Str(self.ctx.intern(text))
    }

    fn to_f64(&mut self, value: Operand, ty: &Type) -> Operand {
        match (ty, &value) {
            (Type::Float, _) => value,
            (_, Operand::Int(v)) => Operand::Float(*v as f64),
            _ => self.unop(UnOpKind::Itof, IrType::F64, value),
        }
    }

    /// A `bool` operand that is true when `value` is truthy.
    fn truthy(&mut self, value: Operand, ty: &Type) -> Operand {
        match ty {
            Type::Bool => value,
            Type::Float => self.binop(BinOpKind::Ne, IrType::F64, value, Operand::Float(0.0)),
            Type::Str | Type::List(_) => {
                let len = self.temp(IrType::I64);
                self.emit(Instr::Load {
                    dst: Place::Var(len.clone()),
                    ty: IrType::I64,
                    base: value,
                    offset: 0,
                });
                self.binop(BinOpKind::Ne, IrType::I64, Operand::Var(len), Operand::Int(0))
            }
            _ => self.binop(BinOpKind::Ne, IrType::I64, value, Operand::Int(0)),
        }
    }

    /// Text form of a value, as `str()` produces it.
    fn str_of(&mut self, value: Operand, ty: &Type, span: Span) -> Option<Operand> {
        match ty {
            Type::Str => Some(value),
            Type::Float => Some(self.call(RT_FLOAT_TO_STR, vec![value], IrType::Ptr)),
            Type::Bool => {
                let out = self.temp(IrType::Ptr);
                let (yes, no, end) = (self.label(), self.label(), self.label());
                let text_true = self.str_const("True");
                let text_false = self.str_const("False");
                self.emit(Instr::BranchIf {
                    cond: value,
                    then_label: yes.clone(),
                    else_label: no.clone(),
                });
                self.emit(Instr::Label(yes));
                self.assign(Place::Var(out.clone()), text_true);
                self.emit(Instr::Jump(end.clone()));
                self.emit(Instr::Label(no));
                self.assign(Place::Var(out.clone()), text_false);
                self.emit(Instr::Label(end));
                Some(Operand::Var(out))
            }
            Type::List(_) => {
                self.error(span, "cannot convert a list to str");
                None
            }
            Type::Function { .. } => {
                self.error(span, "cannot convert a function to str");
                None
            }
            _ => Some(self.call(RT_INT_TO_STR, vec![value], IrType::Ptr)),
        }
    }

    /// Element address check and load for `base[index]` on a list.
    fn element_offset(&mut self, base: Operand, index: Operand) -> Operand {
        let checked = self.call(RT_CHECK_INDEX, vec![base.clone(), index], IrType::I64);
        let scaled = self.binop(BinOpKind::Mul, IrType::I64, checked, Operand::Int(8));
        self.binop(BinOpKind::Add, IrType::Ptr, base, scaled)
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn block(&mut self, stmts: &[HirStmt]) {
        for stmt in stmts {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &HirStmt) {
        match &stmt.kind {
            HirStmtKind::Assign { target, value } => {
                let Some(value_op) = self.expr(value) else {
                    return;
                };
                match target {
                    HirPlace::Var(var) => self.assign(Self::var_place(var), value_op),
                    HirPlace::Index { base, index } => {
                        let Some(base_op) = self.expr(base) else {
                            return;
                        };
                        let Some(index_op) = self.expr(index) else {
                            return;
                        };
                        let addr = self.element_offset(base_op, index_op);
                        self.emit(Instr::Store {
                            ty: IrType::from_type(&value.ty),
                            base: addr,
                            offset: 8,
                            value: value_op,
                        });
                    }
                }
            }
            HirStmtKind::Expr(expr) => {
                self.expr(expr);
            }
            HirStmtKind::If {
                branches,
                else_body,
            } => {
                let end = self.label();
                for (cond, body) in branches {
                    let Some(c) = self.expr(cond) else {
                        return;
                    };
                    let c = self.truthy(c, &cond.ty);
                    let (then_label, next) = (self.label(), self.label());
                    self.emit(Instr::BranchIf {
                        cond: c,
                        then_label: then_label.clone(),
                        else_label: next.clone(),
                    });
                    self.emit(Instr::Label(then_label));
                    self.block(body);
                    self.emit(Instr::Jump(end.clone()));
                    self.emit(Instr::Label(next));
                }
                self.block(else_body);
                self.emit(Instr::Label(end));
            }
            HirStmtKind::While { cond, body } => {
                let (head, body_label, end) = (self.label(), self.label(), self.label());
                self.emit(Instr::Label(head.clone()));
                let Some(c) = self.expr(cond) else {
                    return;
                };
                let c = self.truthy(c, &cond.ty);
                self.emit(Instr::BranchIf {
                    cond: c,
                    then_label: body_label.clone(),
                    else_label: end.clone(),
                });
                self.emit(Instr::Label(body_label));
                self.loops.push(LoopLabels {
                    continue_label: head.clone(),
                    break_label: end.clone(),
                });
                self.block(body);
                self.loops.pop();
                self.emit(Instr::Jump(head));
                self.emit(Instr::Label(end));
            }
            HirStmtKind::For { var, iter, body } => self.for_loop(var, iter, body),
            HirStmtKind::Return(value) => {
                let op = match value {
                    Some(v) => match self.expr(v) {
                        Some(op) => op,
                        None => return,
                    },
                    None => Operand::Int(0),
                };
                self.emit(Instr::Return(Some(op)));
            }
            HirStmtKind::Break => {
                if let Some(labels) = self.loops.last() {
                    let target = labels.break_label.clone();
                    self.emit(Instr::Jump(target));
                }
            }
            HirStmtKind::Continue => {
                if let Some(labels) = self.loops.last() {
                    let target = labels.continue_label.clone();
                    self.emit(Instr::Jump(target));
                }
            }
            HirStmtKind::Raw(raw) => {
                self.raw(raw, false);
            }
        }
    }

    fn for_loop(&mut self, var: &VarRef, iter: &HirExpr, body: &[HirStmt]) {
        if let HirExprKind::Builtin {
            kind: BuiltinKind::Range,
            args,
        } = &iter.kind
        {
            self.range_loop(var, args, iter.span, body);
            return;
        }

        let Some(seq_value) = self.expr(iter) else {
            return;
        };
        let seq = self.temp(IrType::Ptr);
        self.assign(Place::Var(seq.clone()), seq_value);
        let index = self.temp(IrType::I64);
        let len = self.temp(IrType::I64);
        self.assign(Place::Var(index.clone()), Operand::Int(0));
        self.emit(Instr::Load {
            dst: Place::Var(len.clone()),
            ty: IrType::I64,
            base: Operand::Var(seq.clone()),
            offset: 0,
        });

        let (head, body_label, step, end) = (self.label(), self.label(), self.label(), self.label());
        self.emit(Instr::Label(head.clone()));
        let more = self.binop(
            BinOpKind::Lt,
            IrType::I64,
            Operand::Var(index.clone()),
            Operand::Var(len),
        );
        self.emit(Instr::BranchIf {
            cond: more,
            then_label: body_label.clone(),
            else_label: end.clone(),
        });
        self.emit(Instr::Label(body_label));

        let item = if iter.ty == Type::Str {
            self.call(
                RT_STR_INDEX,
                vec![Operand::Var(seq), Operand::Var(index.clone())],
                IrType::Ptr,
            )
        } else {
            let elem_ty = match &iter.ty {
                Type::List(elem) => IrType::from_type(elem),
                _ => IrType::I64,
            };
            let scaled = self.binop(
                BinOpKind::Mul,
                IrType::I64,
                Operand::Var(index.clone()),
                Operand::Int(8),
            );
            let addr = self.binop(BinOpKind::Add, IrType::Ptr, Operand::Var(seq), scaled);
            let item = self.temp(elem_ty);
            self.emit(Instr::Load {
                dst: Place::Var(item.clone()),
                ty: elem_ty,
                base: addr,
                offset: 8,
            });
            Operand::Var(item)
        };
        self.assign(Self::var_place(var), item);

        self.loops.push(LoopLabels {
            continue_label: step.clone(),
            break_label: end.clone(),
        });
        self.block(body);
        self.loops.pop();

        self.emit(Instr::Label(step));
        self.emit(Instr::BinOp {
            dst: Place::Var(index.clone()),
            op: BinOpKind::Add,
            ty: IrType::I64,
            lhs: Operand::Var(index),
            rhs: Operand::Int(1),
        });
        self.emit(Instr::Jump(head));
        self.emit(Instr::Label(end));
    }

    /// `for v in range(...)`: a counting loop, nothing is allocated.
    fn range_loop(&mut self, var: &VarRef, args: &[HirExpr], span: Span, body: &[HirStmt]) {
        let step = match args.get(2) {
            None => 1,
            Some(arg) => match constant_int(arg) {
                Some(0) => {
                    self.error(arg.span, "`range` step must not be zero");
                    return;
                }
                Some(step) => step,
                None => {
                    self.error(arg.span, "`range` step must be an integer literal");
                    return;
                }
            },
        };
        let (start, stop) = match args {
            [stop] => (Some(Operand::Int(0)), self.expr(stop)),
            [start, stop, ..] => (self.expr(start), self.expr(stop)),
            [] => {
                self.error(span, "`range` needs at least one argument");
                return;
            }
        };
        let (Some(start), Some(stop)) = (start, stop) else {
            return;
        };

        let counter = self.temp(IrType::I64);
        let limit = self.temp(IrType::I64);
        self.assign(Place::Var(counter.clone()), start);
        self.assign(Place::Var(limit.clone()), stop);

        let (head, body_label, step_label, end) =
            (self.label(), self.label(), self.label(), self.label());
        self.emit(Instr::Label(head.clone()));
        let cmp = if step > 0 { BinOpKind::Lt } else { BinOpKind::Gt };
        let more = self.binop(
            cmp,
            IrType::I64,
            Operand::Var(counter.clone()),
            Operand::Var(limit),
        );
        self.emit(Instr::BranchIf {
            cond: more,
            then_label: body_label.clone(),
            else_label: end.clone(),
        });
        self.emit(Instr::Label(body_label));
        self.assign(Self::var_place(var), Operand::Var(counter.clone()));

        self.loops.push(LoopLabels {
            continue_label: step_label.clone(),
            break_label: end.clone(),
        });
        self.block(body);
        self.loops.pop();

        self.emit(Instr::Label(step_label));
        self.emit(Instr::BinOp {
            dst: Place::Var(counter.clone()),
            op: BinOpKind::Add,
            ty: IrType::I64,
            lhs: Operand::Var(counter),
            rhs: Operand::Int(step),
        });
        self.emit(Instr::Jump(head));
        self.emit(Instr::Label(end));
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    /// Lower an expression to an operand; `None` after reporting an error.
    fn expr(&mut self, expr: &HirExpr) -> Option<Operand> {
        let span = expr.span;
        let op = match &expr.kind {
            HirExprKind::Int(v) => Operand::Int(*v),
            HirExprKind::Float(v) => Operand::Float(*v),
            HirExprKind::Bool(b) => Operand::Bool(*b),
            HirExprKind::Str(s) => self.str_const(s),
            HirExprKind::NoneValue => Operand::Int(0),
            HirExprKind::Var(VarRef::Local(name)) => Operand::Var(name.clone()),
            HirExprKind::Var(VarRef::Global(name)) => Operand::Global(name.clone()),
            HirExprKind::FunctionRef(name) => {
                self.error(span, format!("function `{name}` cannot be used as a value"));
                return None;
            }
            HirExprKind::Binary { op, lhs, rhs } => return self.binary(*op, lhs, rhs, &expr.ty),
            HirExprKind::Unary { op, operand } => {
                let value = self.expr(operand)?;
                match op {
                    UnaryOp::Plus => value,
                    UnaryOp::Neg if expr.ty == Type::Float => {
                        let value = self.to_f64(value, &operand.ty);
                        self.unop(UnOpKind::Neg, IrType::F64, value)
                    }
                    UnaryOp::Neg => self.unop(UnOpKind::Neg, IrType::I64, value),
                    UnaryOp::Not => {
                        let t = self.truthy(value, &operand.ty);
                        self.unop(UnOpKind::Not, IrType::Bool, t)
                    }
                }
            }
            HirExprKind::Call { callee, args } => {
                let mut ops = Vec::new();
                for arg in args {
                    ops.push(self.expr(arg)?);
                }
                self.call(callee, ops, IrType::from_type(&expr.ty))
            }
            HirExprKind::Builtin { kind, args } => return self.builtin(*kind, args, span),
            HirExprKind::List(items) => {
                let mut ops = Vec::new();
                for item in items {
                    ops.push((self.expr(item)?, IrType::from_type(&item.ty)));
                }
                let list = self.temp(IrType::Ptr);
                self.emit(Instr::Alloc {
                    dst: Place::Var(list.clone()),
                    size: Operand::Int(8 + 8 * ops.len() as i64),
                });
                self.emit(Instr::Store {
                    ty: IrType::I64,
                    base: Operand::Var(list.clone()),
                    offset: 0,
                    value: Operand::Int(ops.len() as i64),
                });
                for (i, (value, ty)) in ops.into_iter().enumerate() {
                    self.emit(Instr::Store {
                        ty,
                        base: Operand::Var(list.clone()),
                        offset: 8 + 8 * i as i64,
                        value,
                    });
                }
                Operand::Var(list)
            }
            HirExprKind::Index { base, index } => {
                let base_op = self.expr(base)?;
                let index_op = self.expr(index)?;
                if base.ty == Type::Str {
                    self.call(RT_STR_INDEX, vec![base_op, index_op], IrType::Ptr)
                } else {
                    let addr = self.element_offset(base_op, index_op);
                    let ty = IrType::from_type(&expr.ty);
                    let dst = self.temp(ty);
                    self.emit(Instr::Load {
                        dst: Place::Var(dst.clone()),
                        ty,
                        base: addr,
                        offset: 8,
                    });
                    Operand::Var(dst)
                }
            }
            HirExprKind::FString(parts) => {
                let mut acc: Option<Operand> = None;
                for part in parts {
                    let piece = match part {
                        HirFStringPart::Text(text) => self.str_const(text),
                        HirFStringPart::Expr(e) => {
                            let value = self.expr(e)?;
                            self.str_of(value, &e.ty, e.span)?
                        }
                    };
                    acc = Some(match acc {
                        None => piece,
                        Some(prev) => self.call(RT_STR_CONCAT, vec![prev, piece], IrType::Ptr),
                    });
                }
                match acc {
                    Some(op) => op,
                    None => self.str_const(""),
                }
            }
            HirExprKind::Raw(raw) => return self.raw(raw, true),
            HirExprKind::Error => {
                self.error(span, "expression could not be typed");
                return None;
            }
        };
        Some(op)
    }

    fn binary(&mut self, op: BinaryOp, lhs: &HirExpr, rhs: &HirExpr, result: &Type) -> Option<Operand> {
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            return self.short_circuit(op, lhs, rhs);
        }
        let l = self.expr(lhs)?;
        let r = self.expr(rhs)?;
        let floats = lhs.ty == Type::Float || rhs.ty == Type::Float;

        if op.is_comparison() {
            let kind = comparison_kind(op);
            if lhs.ty == Type::Str && rhs.ty == Type::Str {
                let eq = self.call(RT_STR_EQ, vec![l, r], IrType::Bool);
                return Some(if op == BinaryOp::NotEq {
                    self.unop(UnOpKind::Not, IrType::Bool, eq)
                } else {
                    eq
                });
            }
            if floats {
                let l = self.to_f64(l, &lhs.ty);
                let r = self.to_f64(r, &rhs.ty);
                return Some(self.binop(kind, IrType::F64, l, r));
            }
            return Some(self.binop(kind, IrType::I64, l, r));
        }

        let value = match (op, result) {
            (BinaryOp::Add, Type::Str) => self.call(RT_STR_CONCAT, vec![l, r], IrType::Ptr),
            (BinaryOp::Add, Type::List(_)) => self.call(RT_LIST_CONCAT, vec![l, r], IrType::Ptr),
            (BinaryOp::Pow, _) => self.call(RT_POW_INT, vec![l, r], IrType::I64),
            (BinaryOp::Div, _) | (BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul, Type::Float) => {
                let l = self.to_f64(l, &lhs.ty);
                let r = self.to_f64(r, &rhs.ty);
                let kind = match op {
                    BinaryOp::Add => BinOpKind::Add,
                    BinaryOp::Sub => BinOpKind::Sub,
                    BinaryOp::Mul => BinOpKind::Mul,
                    _ => BinOpKind::Div,
                };
                self.binop(kind, IrType::F64, l, r)
            }
            (BinaryOp::Add, _) => self.binop(BinOpKind::Add, IrType::I64, l, r),
            (BinaryOp::Sub, _) => self.binop(BinOpKind::Sub, IrType::I64, l, r),
            (BinaryOp::Mul, _) => self.binop(BinOpKind::Mul, IrType::I64, l, r),
            (BinaryOp::FloorDiv, _) => self.binop(BinOpKind::FloorDiv, IrType::I64, l, r),
            (BinaryOp::Mod, _) => self.binop(BinOpKind::Mod, IrType::I64, l, r),
            _ => {
                self.error(lhs.span.join(rhs.span), format!("operator `{}` cannot be lowered here", op.symbol()));
                return None;
            }
        };
        Some(value)
    }

    fn short_circuit(&mut self, op: BinaryOp, lhs: &HirExpr, rhs: &HirExpr) -> Option<Operand> {
        let out = self.temp(IrType::Bool);
        let l = self.expr(lhs)?;
        let l = self.truthy(l, &lhs.ty);
        self.assign(Place::Var(out.clone()), l);
        let (rhs_label, end) = (self.label(), self.label());
        let (then_label, else_label) = if op == BinaryOp::And {
            (rhs_label.clone(), end.clone())
        } else {
            (end.clone(), rhs_label.clone())
        };
        self.emit(Instr::BranchIf {
            cond: Operand::Var(out.clone()),
            then_label,
            else_label,
        });
        self.emit(Instr::Label(rhs_label));
        let r = self.expr(rhs)?;
        let r = self.truthy(r, &rhs.ty);
        self.assign(Place::Var(out.clone()), r);
        self.emit(Instr::Label(end));
        Some(Operand::Var(out))
    }

    fn builtin(&mut self, kind: BuiltinKind, args: &[HirExpr], span: Span) -> Option<Operand> {
        match kind {
            BuiltinKind::Print => {
                let mut line: Option<Operand> = None;
                for arg in args {
                    let value = self.expr(arg)?;
                    let text = self.str_of(value, &arg.ty, arg.span)?;
                    line = Some(match line {
                        None => text,
                        Some(prev) => {
                            let space = self.str_const(" ");
                            let with_space = self.call(RT_STR_CONCAT, vec![prev, space], IrType::Ptr);
                            self.call(RT_STR_CONCAT, vec![with_space, text], IrType::Ptr)
                        }
                    });
                }
                let line = match line {
                    Some(line) => line,
                    None => self.str_const(""),
                };
                self.emit(Instr::Call {
                    dst: None,
                    func: RT_PRINT_STR.to_string(),
                    args: vec![line],
                });
                Some(Operand::Int(0))
            }
            BuiltinKind::Len => {
                let value = self.expr(&args[0])?;
                let dst = self.temp(IrType::I64);
                self.emit(Instr::Load {
                    dst: Place::Var(dst.clone()),
                    ty: IrType::I64,
                    base: value,
                    offset: 0,
                });
                Some(Operand::Var(dst))
            }
            BuiltinKind::Str => {
                let value = self.expr(&args[0])?;
                self.str_of(value, &args[0].ty, args[0].span)
            }
            BuiltinKind::Int => {
                let value = self.expr(&args[0])?;
                Some(match args[0].ty {
                    Type::Float => self.unop(UnOpKind::Ftoi, IrType::I64, value),
                    _ => value,
                })
            }
            BuiltinKind::Float => {
                let value = self.expr(&args[0])?;
                Some(self.to_f64(value, &args[0].ty))
            }
            BuiltinKind::Range => match args {
                [stop] => {
                    let stop = self.expr(stop)?;
                    Some(self.call(RT_RANGE, vec![Operand::Int(0), stop], IrType::Ptr))
                }
                [start, stop] => {
                    let start = self.expr(start)?;
                    let stop = self.expr(stop)?;
                    Some(self.call(RT_RANGE, vec![start, stop], IrType::Ptr))
                }
                _ => {
                    self.error(span, "`range` with a step can only be used directly in a `for` loop");
                    None
                }
            },
            BuiltinKind::Exit => {
                let code = self.expr(&args[0])?;
                self.emit(Instr::Call {
                    dst: None,
                    func: RT_EXIT.to_string(),
                    args: vec![code],
                });
                Some(Operand::Int(0))
            }
        }
    }

    // ------------------------------------------------------------------
    // Raw blocks
    // ------------------------------------------------------------------

    fn raw(&mut self, raw: &HirRaw, want_value: bool) -> Option<Operand> {
        match raw.lang {
            RawLang::Asm => {
                let text = substitute_asm_names(&raw.payload, raw);
                let result = if want_value {
                    Some(Place::Var(self.temp(IrType::I64)))
                } else {
                    None
                };
                let value = result.as_ref().map(Operand::from);
                self.emit(Instr::RawEmit {
                    text,
                    span: raw.span,
                    result,
                });
                Some(value.unwrap_or(Operand::Int(0)))
            }
            RawLang::Ailang => self.ailang(raw, want_value),
        }
    }

    fn ailang(&mut self, raw: &HirRaw, want_value: bool) -> Option<Operand> {
        let instrs = match parse_instructions(&raw.payload) {
            Ok(instrs) => instrs,
            Err(err) => {
                self.error(raw.span, format!("malformed ailang block: {err}"));
                return None;
            }
        };
        let block = self.next_block;
        self.next_block += 1;

        let labels: BTreeSet<String> = instrs
            .iter()
            .filter_map(|i| match i {
                Instr::Label(name) => Some(name.clone()),
                _ => None,
            })
            .collect();

        let mut renamer = AilangRenamer {
            block,
            scope: raw,
            labels: &labels,
            fresh: BTreeMap::new(),
            globals: &self.ctx.globals,
            strings: self.ctx.strings.len(),
            errors: Vec::new(),
        };
        let mut out = Vec::new();
        let mut last_def: Option<Place> = None;
        for instr in instrs {
            let instr = renamer.rename(instr);
            if let Some(place) = instr.def() {
                last_def = Some(place.clone());
            }
            out.push(instr);
        }
        let fresh = std::mem::take(&mut renamer.fresh);
        let errors = std::mem::take(&mut renamer.errors);
        if !errors.is_empty() {
            for message in errors {
                self.error(raw.span, message);
            }
            return None;
        }

        for (name, ty) in fresh.values() {
            self.declare(name, *ty);
        }
        for instr in out {
            let instr = match instr {
                Instr::RawEmit { text, result, .. } => Instr::RawEmit {
                    text,
                    span: raw.span,
                    result,
                },
                other => other,
            };
            self.emit(instr);
        }

        if !want_value {
            return Some(Operand::Int(0));
        }
        match last_def {
            Some(place) => Some(Operand::from(&place)),
            None => {
                self.error(raw.span, "ailang block used as a value defines no result");
                None
            }
        }
    }
}

fn comparison_kind(op: BinaryOp) -> BinOpKind {
    match op {
        BinaryOp::Eq => BinOpKind::Eq,
        BinaryOp::NotEq => BinOpKind::Ne,
        BinaryOp::Lt => BinOpKind::Lt,
        BinaryOp::LtEq => BinOpKind::Le,
        BinaryOp::Gt => BinOpKind::Gt,
        _ => BinOpKind::Ge,
    }
}

fn constant_int(expr: &HirExpr) -> Option<i64> {
    match &expr.kind {
        HirExprKind::Int(v) => Some(*v),
        HirExprKind::Unary {
            op: UnaryOp::Neg,
            operand,
        } => constant_int(operand).map(i64::wrapping_neg),
        HirExprKind::Unary {
            op: UnaryOp::Plus,
            operand,
        } => constant_int(operand),
        _ => None,
    }
}

/// Rewrite `{name}` for every visible variable into an IR placeholder.
fn substitute_asm_names(text: &str, raw: &HirRaw) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let name = after[..close].trim();
        match raw.scope.get(name) {
            Some((VarRef::Local(ir), _)) => out.push_str(&format!("{{%{ir}}}")),
            Some((VarRef::Global(g), _)) => out.push_str(&format!("{{@{g}}}")),
            None => {
                out.push('{');
                out.push_str(&after[..close]);
                out.push('}');
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}

/// Maps names inside one `ailang` block onto the enclosing function.
struct AilangRenamer<'r> {
    block: usize,
    scope: &'r HirRaw,
    labels: &'r BTreeSet<String>,
    /// Block-local name -> (function slot name, type).
    fresh: BTreeMap<String, (String, IrType)>,
    globals: &'r BTreeMap<String, IrType>,
    strings: usize,
    errors: Vec<String>,
}

impl AilangRenamer<'_> {
    fn label(&mut self, name: String) -> String {
        if self.labels.contains(&name) {
            format!("{name}.a{}", self.block)
        } else {
            self.errors
                .push(format!("label `{name}` is not defined in this ailang block"));
            name
        }
    }

    fn operand(&mut self, op: Operand) -> Operand {
        match op {
            Operand::Var(name) => {
                if let Some((var, _)) = self.scope.scope.get(&name) {
                    return match var {
                        VarRef::Local(ir) => Operand::Var(ir.clone()),
                        VarRef::Global(g) => Operand::Global(g.clone()),
                    };
                }
                match self.fresh.get(&name) {
                    Some((slot, _)) => Operand::Var(slot.clone()),
                    None => {
                        self.errors
                            .push(format!("`%{name}` is used before it is defined in this ailang block"));
                        Operand::Var(name)
                    }
                }
            }
            Operand::Global(name) => {
                if !self.globals.contains_key(&name) {
                    self.errors.push(format!("unknown global `@{name}`"));
                }
                Operand::Global(name)
            }
            Operand::Str(n) => {
                if n >= self.strings {
                    self.errors.push(format!("unknown string constant `@str.{n}`"));
                }
                Operand::Str(n)
            }
            other => other,
        }
    }

    fn place(&mut self, place: Place, ty: IrType) -> Place {
        match place {
            Place::Var(name) => {
                if let Some((var, _)) = self.scope.scope.get(&name) {
                    return match var {
                        VarRef::Local(ir) => Place::Var(ir.clone()),
                        VarRef::Global(g) => Place::Global(g.clone()),
                    };
                }
                let block = self.block;
                let (slot, _) = self
                    .fresh
                    .entry(name.clone())
                    .or_insert_with(|| (format!("{name}.a{block}"), ty));
                Place::Var(slot.clone())
            }
            Place::Global(name) => {
                if !self.globals.contains_key(&name) {
                    self.errors.push(format!("unknown global `@{name}`"));
                }
                Place::Global(name)
            }
        }
    }

    fn rename(&mut self, instr: Instr) -> Instr {
        match instr {
            Instr::Label(name) => Instr::Label(format!("{name}.a{}", self.block)),
            Instr::Move { dst, ty, src } => {
                let src = self.operand(src);
                Instr::Move {
                    dst: self.place(dst, ty),
                    ty,
                    src,
                }
            }
            Instr::BinOp {
                dst,
                op,
                ty,
                lhs,
                rhs,
            } => {
                let lhs = self.operand(lhs);
                let rhs = self.operand(rhs);
                let result_ty = if op.is_comparison() { IrType::Bool } else { ty };
                Instr::BinOp {
                    dst: self.place(dst, result_ty),
                    op,
                    ty,
                    lhs,
                    rhs,
                }
            }
            Instr::UnOp { dst, op, ty, src } => {
                let src = self.operand(src);
                Instr::UnOp {
                    dst: self.place(dst, ty),
                    op,
                    ty,
                    src,
                }
            }
            Instr::Call { dst, func, args } => {
                let args = args.into_iter().map(|a| self.operand(a)).collect();
                Instr::Call {
                    dst: dst.map(|d| self.place(d, IrType::I64)),
                    func,
                    args,
                }
            }
            Instr::BranchIf {
                cond,
                then_label,
                else_label,
            } => Instr::BranchIf {
                cond: self.operand(cond),
                then_label: self.label(then_label),
                else_label: self.label(else_label),
            },
            Instr::Jump(label) => Instr::Jump(self.label(label)),
            Instr::Load {
                dst,
                ty,
                base,
                offset,
            } => {
                let base = self.operand(base);
                Instr::Load {
                    dst: self.place(dst, ty),
                    ty,
                    base,
                    offset,
                }
            }
            Instr::Store {
                ty,
                base,
                offset,
                value,
            } => Instr::Store {
                ty,
                base: self.operand(base),
                offset,
                value: self.operand(value),
            },
            Instr::Alloc { dst, size } => {
                let size = self.operand(size);
                Instr::Alloc {
                    dst: self.place(dst, IrType::Ptr),
                    size,
                }
            }
            Instr::Free(ptr) => Instr::Free(self.operand(ptr)),
            Instr::Return(value) => Instr::Return(value.map(|v| self.operand(v))),
            Instr::RawEmit { text, span, result } => Instr::RawEmit {
                text,
                span,
                result: result.map(|r| self.place(r, IrType::I64)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Program;
    use crate::parser::parse_str;
    use crate::span::FileId;
    use crate::typecheck::typecheck;

    fn lower_source(source: &str) -> Result<IrModule, Vec<Diagnostic>> {
        let parsed = parse_str(FileId(0), source);
        assert!(parsed.diagnostics.is_empty(), "{:?}", parsed.diagnostics);
        let checked = typecheck(&Program {
            main: parsed.module,
            libraries: Vec::new(),
        });
        let hir = checked.module.expect("typecheck failed");
        lower(&hir)
    }

    fn lower_ok(source: &str) -> IrModule {
        lower_source(source).expect("lowering failed")
    }

    fn lower_err(source: &str) -> Vec<Diagnostic> {
        lower_source(source).expect_err("lowering should fail")
    }

    #[test]
    fn lowers_arithmetic_and_return() {
        let module = lower_ok("def main(): return 1 + 2; end;");
        let main = module.function("main").expect("main");
        assert!(main.body.iter().any(|i| matches!(i, Instr::BinOp { op: BinOpKind::Add, .. })));
        assert!(matches!(main.body.last(), Some(Instr::Return(Some(_)))));
    }

    #[test]
    fn printed_ir_reads_back() {
        let module = lower_ok(
            "def fact(n):\n  r = 1;\n  for i in range(1, n + 1):\n    r = r * i;\n  end;\n  return r;\nend;\nprint(f\"fact: {fact(5)}\", 2.5 / 2);",
        );
        let text = module.to_string();
        let reparsed = crate::ir_text::parse_module(&text).expect("reparse");
        assert_eq!(reparsed.functions.len(), module.functions.len());
        assert_eq!(reparsed.to_string(), text);
    }

    #[test]
    fn lowering_matches_hand_written_ir() {
        let module = lower_ok(
            "def add(a, b): return a + b; end;\ndef clamp(x):\n  if x < 0:\n    return 0;\n  end;\n  return x;\nend;\ndef main(): return add(clamp(5), 2); end;",
        );
        let expected = crate::ir_text::parse_module(
            r#"entry @main

func @add(%a: i64, %b: i64) -> i64 {
  var %0: i64
  %0 = add.i64 %a, %b
  ret %0
}

func @clamp(%x: i64) -> i64 {
  var %0: bool
  %0 = lt.i64 %x, 0
  br %0, L1, L2
L1:
  ret 0
  jmp L0
L2:
L0:
  ret %x
}

func @main() -> i64 {
  var %0: i64
  var %1: i64
  %0 = call @clamp(5)
  %1 = call @add(%0, 2)
  ret %1
}
"#,
        )
        .expect("hand-written ir");

        for name in ["add", "clamp", "main"] {
            let got = module.function(name).expect("lowered function");
            let want = expected.function(name).expect("expected function");
            assert_eq!(got.params, want.params, "params of {name}");
            assert_eq!(got.ret, want.ret, "return type of {name}");
            assert_eq!(got.vars, want.vars, "vars of {name}");
            assert_eq!(got.body, want.body, "body of {name}");
        }
        assert_eq!(module.entry, expected.entry);
    }

    #[test]
    fn range_step_must_be_a_nonzero_literal() {
        let diags = lower_err("def f(s):\n  for i in range(0, 10, s):\n    print(i);\n  end;\n  return 0;\nend;\nf(2);");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::LoweringError);
        let diags = lower_err("for i in range(0, 10, 0): print(i); end;");
        assert!(diags[0].message.contains("zero"));
        lower_ok("for i in range(10, 0, -2): print(i); end;");
    }

    #[test]
    fn function_values_and_list_strings_are_rejected() {
        let diags = lower_err("def g(): return 1; end;\nx = g;");
        assert!(diags[0].message.contains("cannot be used as a value"));
        let diags = lower_err("print(str([1, 2]));");
        assert!(diags[0].message.contains("list to str"));
    }

    #[test]
    fn ailang_names_map_to_locals_and_fresh_slots() {
        let module = lower_ok(
            "def f(a):\n  b = ailang {\n    %t = add.i64 %a, 1\n    %r = mul.i64 %t, 2\n  };\n  return b;\nend;\nprint(f(3));",
        );
        let f = module.function("f").expect("f");
        let names: Vec<&str> = f.vars.iter().map(|v| v.name.as_str()).collect();
        assert!(names.contains(&"t.a0"), "{names:?}");
        assert!(names.contains(&"r.a0"));
        assert!(f.body.iter().any(|i| matches!(
            i,
            Instr::BinOp { lhs: Operand::Var(v), .. } if v == "a"
        )));
    }

    #[test]
    fn ailang_errors() {
        let diags = lower_err("def f():\n  x = ailang { jmp nowhere };\n  return 0;\nend;");
        assert!(diags.iter().any(|d| d.message.contains("nowhere")));
        let diags = lower_err("def f():\n  ailang { %y = add.i64 %q, 1 };\n  return 0;\nend;");
        assert!(diags[0].message.contains("before it is defined"));
        let diags = lower_err("def f():\n  ailang { this is not ir };\n  return 0;\nend;");
        assert!(diags[0].message.contains("malformed ailang"));
    }

    #[test]
    fn asm_names_become_placeholders() {
        let module = lower_ok("def f(a):\n  asm { mov rax, {a}\n add rax, {missing} };\n  return a;\nend;\nf(1);");
        let f = module.function("f").expect("f");
        let text = f
            .body
            .iter()
            .find_map(|i| match i {
                Instr::RawEmit { text, .. } => Some(text.clone()),
                _ => None,
            })
            .expect("raw emit");
        assert!(text.contains("{%a}"));
        assert!(text.contains("{missing}"));
    }

    #[test]
    fn unreachable_functions_are_dropped() {
        let module = lower_ok("def used(): return 1; end;\ndef unused(): return 2; end;\nprint(used());");
        assert!(module.function("used").is_some());
        assert!(module.function("unused").is_none());
    }

    #[test]
    fn strings_are_interned_once() {
        let module = lower_ok("print(\"hi\");\nprint(\"hi\");");
        assert_eq!(module.strings.iter().filter(|s| *s == "hi").count(), 1);
    }
}
