//! IR to x86-64 code generation.
//!
//! Each IR value lives where the register allocator put it: a
//! callee-saved register or an 8-byte frame slot. Instructions are
//! translated one by one through the scratch registers `rax`/`rcx`
//! (`rdx`, `r10`, `xmm0`, `xmm1` where an operation needs more).
//!
//! Frame layout, after the prologue:
//!
//! ```text
//! [rbp + 16 + 8k]   stack argument k (arguments past the sixth)
//! [rbp + 8]         return address
//! [rbp]             caller rbp
//! [rbp - 8 * i]     saved callee registers, i = 1..=n
//! [rbp - 8 * (n + 1 + k)]  spill slot k
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use crate::asm::parse_asm;
use crate::assemble::{Relocation, assemble};
use crate::diagnostic::{Diagnostic, DiagnosticKind};
use crate::ir::{BinOpKind, Instr, IrFunction, IrModule, IrType, Operand, Place, UnOpKind};
use crate::regalloc::{Allocation, Location, allocate};
use crate::span::Span;
use crate::x86_64::{AluOp, Cond, MachInst, Mem, Reg, ShiftOp, SseOp, UnaryOp, Xmm};

pub const ALLOC_ROUTINE: &str = "__aim_alloc";
pub const FREE_ROUTINE: &str = "__aim_free";
const EPILOGUE: &str = ".epilogue";

pub fn global_symbol(name: &str) -> String {
    format!("g.{name}")
}

pub fn string_symbol(index: usize) -> String {
    format!("str.{index}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledFunction {
    pub name: String,
    pub insts: Vec<MachInst>,
    pub code: Vec<u8>,
    /// Relocations relative to the start of `code`.
    pub relocations: Vec<Relocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CompiledModule {
    pub functions: Vec<CompiledFunction>,
    pub data: Vec<u8>,
    pub data_symbols: BTreeMap<String, usize>,
    pub entry: String,
    pub init: Option<String>,
}

impl CompiledModule {
    /// Assembly listing of the generated code and data.
    pub fn listing(&self) -> String {
        let mut out = String::from("    .text\n");
        for func in &self.functions {
            let _ = writeln!(out, "\n{}:", func.name);
            for inst in &func.insts {
                match inst {
                    MachInst::Label(l) if l == &func.name => {}
                    MachInst::Label(_) => {
                        let _ = writeln!(out, "{inst}");
                    }
                    _ => {
                        let _ = writeln!(out, "    {inst}");
                    }
                }
            }
        }
        if !self.data.is_empty() {
            out.push_str("\n    .data\n");
            let mut symbols: Vec<(&String, &usize)> = self.data_symbols.iter().collect();
            symbols.sort_by_key(|(name, offset)| (**offset, (*name).clone()));
            for (i, (name, offset)) in symbols.iter().enumerate() {
                let offset = **offset;
                let end = symbols
                    .get(i + 1)
                    .map(|(_, next)| **next)
                    .unwrap_or(self.data.len());
                let _ = writeln!(out, "{name}:");
                let bytes = &self.data[offset..end];
                let words: Vec<String> = bytes
                    .chunks(8)
                    .map(|c| {
                        let mut word = [0u8; 8];
                        word[..c.len()].copy_from_slice(c);
                        format!("{:#x}", u64::from_le_bytes(word))
                    })
                    .collect();
                let _ = writeln!(out, "    .quad {}", words.join(", "));
            }
        }
        out
    }
}

/// Lay out globals then string constants (`[len][bytes]`, 8-aligned).
fn layout_data(module: &IrModule) -> (Vec<u8>, BTreeMap<String, usize>) {
    let mut data = Vec::new();
    let mut symbols = BTreeMap::new();
    for global in &module.globals {
        symbols.insert(global_symbol(&global.name), data.len());
        data.extend_from_slice(&[0; 8]);
    }
    for (i, s) in module.strings.iter().enumerate() {
        symbols.insert(string_symbol(i), data.len());
        data.extend_from_slice(&(s.len() as u64).to_le_bytes());
        data.extend_from_slice(s.as_bytes());
        while data.len() % 8 != 0 {
            data.push(0);
        }
    }
    (data, symbols)
}

pub fn generate(module: &IrModule) -> Result<CompiledModule, Vec<Diagnostic>> {
    let mut diagnostics = Vec::new();
    if module.function(&module.entry).is_none() {
        diagnostics.push(Diagnostic::error(
            DiagnosticKind::CodegenError,
            format!("entry function `{}` is not defined", module.entry),
            Span::dummy(),
        ));
        return Err(diagnostics);
    }

    let globals: BTreeSet<&str> = module.globals.iter().map(|g| g.name.as_str()).collect();
    let mut functions = Vec::new();
    for func in &module.functions {
        let alloc = allocate(func);
        log::trace!(
            "@{}: {} register(s), {} spill slot(s)",
            func.name,
            alloc.callee_saved.len(),
            alloc.spill_slots
        );
        let mut builder = FunctionGen::new(func, alloc, &globals, module.strings.len());
        builder.function();
        if !builder.errors.is_empty() {
            diagnostics.append(&mut builder.errors);
            continue;
        }
        match assemble(&builder.out) {
            Ok(assembled) => functions.push(CompiledFunction {
                name: func.name.clone(),
                insts: builder.out,
                code: assembled.code,
                relocations: assembled.relocations,
            }),
            Err(err) => diagnostics.push(Diagnostic::error(
                DiagnosticKind::CodegenError,
                format!("in function `{}`: {err}", func.name),
                func.span,
            )),
        }
    }
    if !diagnostics.is_empty() {
        return Err(diagnostics);
    }

    let (data, data_symbols) = layout_data(module);
    Ok(CompiledModule {
        functions,
        data,
        data_symbols,
        entry: module.entry.clone(),
        init: module.init.clone(),
    })
}

struct FunctionGen<'a> {
    func: &'a IrFunction,
    alloc: Allocation,
    globals: &'a BTreeSet<&'a str>,
    strings: usize,
    out: Vec<MachInst>,
    next_label: usize,
    next_raw: usize,
    errors: Vec<Diagnostic>,
}

impl<'a> FunctionGen<'a> {
    fn new(func: &'a IrFunction, alloc: Allocation, globals: &'a BTreeSet<&'a str>, strings: usize) -> Self {
        FunctionGen {
            func,
            alloc,
            globals,
            strings,
            out: Vec::new(),
            next_label: 0,
            next_raw: 0,
            errors: Vec::new(),
        }
    }

    fn error(&mut self, span: Span, message: impl Into<String>) {
        let span = if span.is_dummy() { self.func.span } else { span };
        self.errors
            .push(Diagnostic::error(DiagnosticKind::CodegenError, message, span));
    }

    fn emit(&mut self, inst: MachInst) {
        self.out.push(inst);
    }

    fn fresh_label(&mut self) -> String {
        let label = format!(".c{}", self.next_label);
        self.next_label += 1;
        label
    }

    fn ir_label(label: &str) -> String {
        format!(".{label}")
    }

    fn saved_count(&self) -> i32 {
        self.alloc.callee_saved.len() as i32
    }

    fn slot_mem(&self, slot: u32) -> Mem {
        Mem::base(Reg::Rbp, -8 * (self.saved_count() + 1 + slot as i32))
    }

    fn location(&self, var: &str) -> Option<Location> {
        self.alloc.location(var)
    }

    fn var_reg(&self, place: &Place) -> Option<Reg> {
        match place {
            Place::Var(name) => match self.location(name) {
                Some(Location::Reg(r)) => Some(r),
                _ => None,
            },
            Place::Global(_) => None,
        }
    }

    // ------------------------------------------------------------------
    // Frame
    // ------------------------------------------------------------------

    fn function(&mut self) {
        let func = self.func;
        self.emit(MachInst::Label(func.name.clone()));
        self.emit(MachInst::Push(Reg::Rbp));
        self.emit(MachInst::MovRR(Reg::Rbp, Reg::Rsp));
        for reg in self.alloc.callee_saved.clone() {
            self.emit(MachInst::Push(reg));
        }
        let slots = self.alloc.spill_slots as i32;
        let padding = if (self.saved_count() + slots) % 2 == 1 { 1 } else { 0 };
        let frame = 8 * (slots + padding);
        if frame > 0 {
            self.emit(MachInst::AluRI(AluOp::Sub, Reg::Rsp, frame));
        }

        for (i, (name, _)) in func.params.iter().enumerate() {
            let Some(loc) = self.location(name) else {
                continue;
            };
            let src = match Reg::ARGS.get(i) {
                Some(&reg) => reg,
                None => {
                    let offset = 16 + 8 * (i - Reg::ARGS.len()) as i32;
                    self.emit(MachInst::MovRM(Reg::Rax, Mem::base(Reg::Rbp, offset)));
                    Reg::Rax
                }
            };
            match loc {
                Location::Reg(r) => self.emit(MachInst::MovRR(r, src)),
                Location::Stack(k) => {
                    let mem = self.slot_mem(k);
                    self.emit(MachInst::MovMR(mem, src));
                }
            }
        }

        for (i, instr) in func.body.iter().enumerate() {
            let next = func.body.get(i + 1);
            self.instr(instr, next, i + 1 == func.body.len());
        }

        self.emit(MachInst::Label(EPILOGUE.to_string()));
        let saved = self.alloc.callee_saved.clone();
        self.emit(MachInst::Lea(Reg::Rsp, Mem::base(Reg::Rbp, -8 * saved.len() as i32)));
        for reg in saved.into_iter().rev() {
            self.emit(MachInst::Pop(reg));
        }
        self.emit(MachInst::Pop(Reg::Rbp));
        self.emit(MachInst::Ret);
    }

    // ------------------------------------------------------------------
    // Operands
    // ------------------------------------------------------------------

    fn load(&mut self, reg: Reg, op: &Operand) {
        match op {
            Operand::Var(name) => match self.location(name) {
                Some(Location::Reg(r)) => {
                    if r != reg {
                        self.emit(MachInst::MovRR(reg, r));
                    }
                }
                Some(Location::Stack(k)) => {
                    let mem = self.slot_mem(k);
                    self.emit(MachInst::MovRM(reg, mem));
                }
                // Never written on any path that reaches here.
                None => self.emit(MachInst::Alu(AluOp::Xor, reg, reg)),
            },
            Operand::Global(name) => {
                self.emit(MachInst::MovRM(reg, Mem::Rip(global_symbol(name))));
            }
            Operand::Int(v) => self.emit(MachInst::MovRI(reg, *v)),
            Operand::Float(v) => self.emit(MachInst::MovRI(reg, v.to_bits() as i64)),
            Operand::Bool(b) => self.emit(MachInst::MovRI(reg, i64::from(*b))),
            Operand::Str(n) => self.emit(MachInst::Lea(reg, Mem::Rip(string_symbol(*n)))),
        }
    }

    fn store(&mut self, place: &Place, reg: Reg) {
        match place {
            Place::Var(name) => match self.location(name) {
                Some(Location::Reg(r)) => {
                    if r != reg {
                        self.emit(MachInst::MovRR(r, reg));
                    }
                }
                Some(Location::Stack(k)) => {
                    let mem = self.slot_mem(k);
                    self.emit(MachInst::MovMR(mem, reg));
                }
                None => {}
            },
            Place::Global(name) => {
                self.emit(MachInst::MovMR(Mem::Rip(global_symbol(name)), reg));
            }
        }
    }

    // ------------------------------------------------------------------
    // Instructions
    // ------------------------------------------------------------------

    fn instr(&mut self, instr: &Instr, next: Option<&Instr>, last: bool) {
        let next_label = match next {
            Some(Instr::Label(l)) => Some(l.as_str()),
            _ => None,
        };
        match instr {
            Instr::Label(l) => self.emit(MachInst::Label(Self::ir_label(l))),
            Instr::Move { dst, src, .. } => {
                let target = self.var_reg(dst).unwrap_or(Reg::Rax);
                self.load(target, src);
                self.store(dst, target);
            }
            Instr::BinOp {
                dst,
                op,
                ty,
                lhs,
                rhs,
            } => {
                if *ty == IrType::F64 {
                    self.float_binop(*op, lhs, rhs);
                } else {
                    self.int_binop(*op, lhs, rhs);
                }
                self.store(dst, Reg::Rax);
            }
            Instr::UnOp { dst, op, ty, src } => {
                self.load(Reg::Rax, src);
                match op {
                    UnOpKind::Neg if *ty == IrType::F64 => {
                        self.emit(MachInst::MovRI(Reg::Rcx, i64::MIN));
                        self.emit(MachInst::Alu(AluOp::Xor, Reg::Rax, Reg::Rcx));
                    }
                    UnOpKind::Neg => self.emit(MachInst::Unary(UnaryOp::Neg, Reg::Rax)),
                    UnOpKind::Not => {
                        self.emit(MachInst::Test(Reg::Rax, Reg::Rax));
                        self.emit(MachInst::Setcc(Cond::E, Reg::Rax));
                        self.emit(MachInst::MovzxRR8(Reg::Rax, Reg::Rax));
                    }
                    UnOpKind::Itof => {
                        self.emit(MachInst::Cvtsi2sd(Xmm(0), Reg::Rax));
                        self.emit(MachInst::MovqRX(Reg::Rax, Xmm(0)));
                    }
                    UnOpKind::Ftoi => {
                        self.emit(MachInst::MovqXR(Xmm(0), Reg::Rax));
                        self.emit(MachInst::Cvttsd2si(Reg::Rax, Xmm(0)));
                    }
                }
                self.store(dst, Reg::Rax);
            }
            Instr::Call { dst, func, args } => {
                self.call(func, args);
                if let Some(dst) = dst {
                    self.store(dst, Reg::Rax);
                }
            }
            Instr::BranchIf {
                cond,
                then_label,
                else_label,
            } => {
                self.load(Reg::Rax, cond);
                self.emit(MachInst::Test(Reg::Rax, Reg::Rax));
                if next_label == Some(then_label.as_str()) {
                    self.emit(MachInst::Jcc(Cond::E, Self::ir_label(else_label)));
                } else {
                    self.emit(MachInst::Jcc(Cond::Ne, Self::ir_label(then_label)));
                    if next_label != Some(else_label.as_str()) {
                        self.emit(MachInst::Jmp(Self::ir_label(else_label)));
                    }
                }
            }
            Instr::Jump(label) => {
                if next_label != Some(label.as_str()) {
                    self.emit(MachInst::Jmp(Self::ir_label(label)));
                }
            }
            Instr::Load {
                dst, base, offset, ..
            } => {
                let Some(disp) = self.offset(*offset) else {
                    return;
                };
                self.load(Reg::Rax, base);
                self.emit(MachInst::MovRM(Reg::Rax, Mem::base(Reg::Rax, disp)));
                self.store(dst, Reg::Rax);
            }
            Instr::Store {
                base,
                offset,
                value,
                ..
            } => {
                let Some(disp) = self.offset(*offset) else {
                    return;
                };
                self.load(Reg::Rax, base);
                self.load(Reg::Rcx, value);
                self.emit(MachInst::MovMR(Mem::base(Reg::Rax, disp), Reg::Rcx));
            }
            Instr::Alloc { dst, size } => {
                self.call(ALLOC_ROUTINE, std::slice::from_ref(size));
                self.store(dst, Reg::Rax);
            }
            Instr::Free(ptr) => self.call(FREE_ROUTINE, std::slice::from_ref(ptr)),
            Instr::Return(value) => {
                match value {
                    Some(v) => self.load(Reg::Rax, v),
                    None => self.emit(MachInst::Alu(AluOp::Xor, Reg::Rax, Reg::Rax)),
                }
                if !last {
                    self.emit(MachInst::Jmp(EPILOGUE.to_string()));
                }
            }
            Instr::RawEmit { text, span, result } => {
                self.raw(text, *span);
                if let Some(result) = result {
                    self.store(result, Reg::Rax);
                }
            }
        }
    }

    fn offset(&mut self, offset: i64) -> Option<i32> {
        match i32::try_from(offset) {
            Ok(v) => Some(v),
            Err(_) => {
                self.error(self.func.span, format!("memory offset {offset} does not fit in 32 bits"));
                None
            }
        }
    }

    fn int_binop(&mut self, op: BinOpKind, lhs: &Operand, rhs: &Operand) {
        self.load(Reg::Rax, lhs);
        self.load(Reg::Rcx, rhs);
        let simple = match op {
            BinOpKind::Add => Some(AluOp::Add),
            BinOpKind::Sub => Some(AluOp::Sub),
            BinOpKind::And => Some(AluOp::And),
            BinOpKind::Or => Some(AluOp::Or),
            BinOpKind::Xor => Some(AluOp::Xor),
            _ => None,
        };
        if let Some(alu) = simple {
            self.emit(MachInst::Alu(alu, Reg::Rax, Reg::Rcx));
            return;
        }
        match op {
            BinOpKind::Mul => self.emit(MachInst::Imul(Reg::Rax, Reg::Rcx)),
            BinOpKind::Div | BinOpKind::Rem | BinOpKind::FloorDiv | BinOpKind::Mod => {
                self.emit(MachInst::Cqo);
                self.emit(MachInst::Unary(UnaryOp::Idiv, Reg::Rcx));
                if matches!(op, BinOpKind::FloorDiv | BinOpKind::Mod) {
                    // Round toward negative infinity when the signs differ.
                    let done = self.fresh_label();
                    self.emit(MachInst::Test(Reg::Rdx, Reg::Rdx));
                    self.emit(MachInst::Jcc(Cond::E, done.clone()));
                    self.emit(MachInst::MovRR(Reg::R10, Reg::Rdx));
                    self.emit(MachInst::Alu(AluOp::Xor, Reg::R10, Reg::Rcx));
                    self.emit(MachInst::Jcc(Cond::Ns, done.clone()));
                    if op == BinOpKind::FloorDiv {
                        self.emit(MachInst::AluRI(AluOp::Sub, Reg::Rax, 1));
                    } else {
                        self.emit(MachInst::Alu(AluOp::Add, Reg::Rdx, Reg::Rcx));
                    }
                    self.emit(MachInst::Label(done));
                }
                if matches!(op, BinOpKind::Rem | BinOpKind::Mod) {
                    self.emit(MachInst::MovRR(Reg::Rax, Reg::Rdx));
                }
            }
            BinOpKind::Shl | BinOpKind::Shr | BinOpKind::Sar => {
                let shift = match op {
                    BinOpKind::Shl => ShiftOp::Shl,
                    BinOpKind::Shr => ShiftOp::Shr,
                    _ => ShiftOp::Sar,
                };
                self.emit(MachInst::ShiftCl(shift, Reg::Rax));
            }
            _ => {
                let cond = match op {
                    BinOpKind::Eq => Cond::E,
                    BinOpKind::Ne => Cond::Ne,
                    BinOpKind::Lt => Cond::L,
                    BinOpKind::Le => Cond::Le,
                    BinOpKind::Gt => Cond::G,
                    _ => Cond::Ge,
                };
                self.emit(MachInst::Alu(AluOp::Cmp, Reg::Rax, Reg::Rcx));
                self.emit(MachInst::Setcc(cond, Reg::Rax));
                self.emit(MachInst::MovzxRR8(Reg::Rax, Reg::Rax));
            }
        }
    }

    fn float_binop(&mut self, op: BinOpKind, lhs: &Operand, rhs: &Operand) {
        self.load(Reg::Rax, lhs);
        self.load(Reg::Rcx, rhs);
        self.emit(MachInst::MovqXR(Xmm(0), Reg::Rax));
        self.emit(MachInst::MovqXR(Xmm(1), Reg::Rcx));
        let arith = match op {
            BinOpKind::Add => Some(SseOp::Add),
            BinOpKind::Sub => Some(SseOp::Sub),
            BinOpKind::Mul => Some(SseOp::Mul),
            BinOpKind::Div => Some(SseOp::Div),
            _ => None,
        };
        if let Some(sse) = arith {
            self.emit(MachInst::Sse(sse, Xmm(0), Xmm(1)));
            self.emit(MachInst::MovqRX(Reg::Rax, Xmm(0)));
            return;
        }
        // Unordered compares set CF, ZF and PF, so every test below is
        // false for NaN except `ne`.
        match op {
            BinOpKind::Gt | BinOpKind::Ge => {
                self.emit(MachInst::Ucomisd(Xmm(0), Xmm(1)));
                let cond = if op == BinOpKind::Gt { Cond::A } else { Cond::Ae };
                self.emit(MachInst::Setcc(cond, Reg::Rax));
            }
            BinOpKind::Lt | BinOpKind::Le => {
                self.emit(MachInst::Ucomisd(Xmm(1), Xmm(0)));
                let cond = if op == BinOpKind::Lt { Cond::A } else { Cond::Ae };
                self.emit(MachInst::Setcc(cond, Reg::Rax));
            }
            BinOpKind::Eq | BinOpKind::Ne => {
                self.emit(MachInst::Ucomisd(Xmm(0), Xmm(1)));
                let (zero, parity, combine) = if op == BinOpKind::Eq {
                    (Cond::E, Cond::Np, AluOp::And)
                } else {
                    (Cond::Ne, Cond::P, AluOp::Or)
                };
                self.emit(MachInst::Setcc(zero, Reg::Rax));
                self.emit(MachInst::Setcc(parity, Reg::Rcx));
                self.emit(MachInst::Alu(combine, Reg::Rax, Reg::Rcx));
            }
            other => {
                self.error(self.func.span, format!("`{}` is not supported on f64", other.name()));
                return;
            }
        }
        self.emit(MachInst::MovzxRR8(Reg::Rax, Reg::Rax));
    }

    /// System V call: six register arguments, the rest pushed right to left
    /// with `rsp` kept 16-byte aligned at the call.
    fn call(&mut self, func: &str, args: &[Operand]) {
        let stack_args = args.len().saturating_sub(Reg::ARGS.len());
        let padding = stack_args % 2;
        if padding == 1 {
            self.emit(MachInst::AluRI(AluOp::Sub, Reg::Rsp, 8));
        }
        for arg in args[Reg::ARGS.len().min(args.len())..].iter().rev() {
            self.load(Reg::Rax, arg);
            self.emit(MachInst::Push(Reg::Rax));
        }
        for (arg, &reg) in args.iter().zip(Reg::ARGS.iter()) {
            self.load(reg, arg);
        }
        self.emit(MachInst::Call(func.to_string()));
        let cleanup = 8 * (stack_args + padding) as i32;
        if cleanup > 0 {
            self.emit(MachInst::AluRI(AluOp::Add, Reg::Rsp, cleanup));
        }
    }

    // ------------------------------------------------------------------
    // Raw assembly
    // ------------------------------------------------------------------

    /// Text for a `{...}` placeholder, or `None` if it names nothing.
    fn placeholder(&self, inner: &str) -> Option<String> {
        if let Some(var) = inner.strip_prefix('%') {
            self.func.var_type(var)?;
            return match self.location(var)? {
                Location::Reg(r) => Some(r.name().to_string()),
                Location::Stack(k) => Some(format!("qword ptr {}", self.slot_mem(k))),
            };
        }
        if let Some(global) = inner.strip_prefix('@') {
            if self.globals.contains(global) {
                return Some(format!("qword ptr [rip + {}]", global_symbol(global)));
            }
            if let Some(n) = global.strip_prefix("str.").and_then(|n| n.parse::<usize>().ok()) {
                if n < self.strings {
                    return Some(string_symbol(n));
                }
            }
        }
        None
    }

    fn raw(&mut self, text: &str, span: Span) {
        let mut substituted = String::with_capacity(text.len());
        let mut undefined: Vec<String> = Vec::new();
        let mut rest = text;
        while let Some(open) = rest.find('{') {
            substituted.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let Some(close) = after.find('}') else {
                undefined.push(after.trim().to_string());
                rest = "";
                break;
            };
            let inner = after[..close].trim();
            match self.placeholder(inner) {
                Some(replacement) => substituted.push_str(&replacement),
                None => undefined.push(inner.to_string()),
            }
            rest = &after[close + 1..];
        }
        substituted.push_str(rest);

        if !undefined.is_empty() {
            let names: Vec<String> = undefined.iter().map(|n| format!("`{{{n}}}`")).collect();
            self.error(
                span,
                format!("undefined placeholder {} in asm block", names.join(", ")),
            );
            return;
        }

        let insts = match parse_asm(&substituted) {
            Ok(insts) => insts,
            Err(err) => {
                self.error(span, format!("in asm block: {err}"));
                return;
            }
        };
        let block = self.next_raw;
        self.next_raw += 1;
        let defined: BTreeSet<String> = insts
            .iter()
            .filter_map(|i| match i {
                MachInst::Label(l) => Some(l.clone()),
                _ => None,
            })
            .collect();
        for inst in insts {
            let renamed = inst.map_symbols(|name| {
                if defined.contains(&name) {
                    format!(".raw{block}.{}", name.trim_start_matches('.'))
                } else {
                    name
                }
            });
            self.emit(renamed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir_text::parse_module;

    fn generate_text(text: &str) -> Result<CompiledModule, Vec<Diagnostic>> {
        generate(&parse_module(text).expect("parse"))
    }

    fn function_text(module: &CompiledModule, name: &str) -> Vec<String> {
        module
            .functions
            .iter()
            .find(|f| f.name == name)
            .expect("function")
            .insts
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn prologue_and_epilogue_balance() {
        let module = generate_text(
            "entry @main\nfunc @main() -> i64 {\n  var %x: i64\n  %x = add.i64 1, 2\n  ret %x\n}",
        )
        .expect("generate");
        let text = function_text(&module, "main");
        assert_eq!(text[0], "main:");
        assert_eq!(text[1], "push rbp");
        assert_eq!(text[2], "mov rbp, rsp");
        assert_eq!(text[3], "push rbx");
        // One saved register: pad to keep rsp 16-byte aligned.
        assert_eq!(text[4], "sub rsp, 8");
        assert_eq!(text[text.len() - 4], "lea rsp, [rbp - 8]");
        assert_eq!(text[text.len() - 3], "pop rbx");
        assert_eq!(text[text.len() - 1], "ret");
        assert!(!text.iter().any(|t| t == "jmp .epilogue"));
    }

    #[test]
    fn data_holds_globals_then_strings() {
        let module = generate_text(
            "entry @main\nglobal @count: i64\nstring @str.0 = \"hey\"\nfunc @main() -> i64 {\n  @count = mov.i64 1\n  call @__aim_print_str(@str.0)\n  ret 0\n}",
        )
        .expect("generate");
        assert_eq!(module.data_symbols["g.count"], 0);
        assert_eq!(module.data_symbols["str.0"], 8);
        assert_eq!(&module.data[8..16], &3u64.to_le_bytes());
        assert_eq!(&module.data[16..19], b"hey");
        assert_eq!(module.data.len(), 24);
        let main = &module.functions[0];
        let symbols: Vec<&str> = main.relocations.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(symbols, ["g.count", "str.0", "__aim_print_str"]);
    }

    #[test]
    fn stack_arguments_keep_alignment() {
        let module = generate_text(
            "entry @main\nfunc @main() -> i64 {\n  var %r: i64\n  %r = call @seven(1, 2, 3, 4, 5, 6, 7)\n  ret %r\n}\nfunc @seven(%a: i64, %b: i64, %c: i64, %d: i64, %e: i64, %f: i64, %g: i64) -> i64 {\n  ret %g\n}",
        )
        .expect("generate");
        let main = function_text(&module, "main");
        let call = main.iter().position(|t| t == "call seven").expect("call");
        assert!(main[..call].contains(&"sub rsp, 8".to_string()));
        assert!(main[..call].contains(&"push rax".to_string()));
        assert_eq!(main[call + 1], "add rsp, 16");
        let seven = function_text(&module, "seven");
        assert!(seven.iter().any(|t| t == "mov rax, qword ptr [rbp + 16]"));
    }

    #[test]
    fn raw_placeholders_are_substituted_and_labels_renamed() {
        let module = generate_text(
            "entry @main\nfunc @main() -> i64 {\n  var %x: i64\n  %x = mov.i64 3\n  asm \"top: dec {%x}\\n jnz top\"\n  ret %x\n}",
        )
        .expect("generate");
        let main = function_text(&module, "main");
        assert!(main.iter().any(|t| t == ".raw0.top:"));
        assert!(main.iter().any(|t| t == "dec rbx"));
        assert!(main.iter().any(|t| t == "jne .raw0.top"));
    }

    #[test]
    fn undefined_placeholder_is_one_error() {
        let errs = generate_text(
            "entry @main\nfunc @main() -> i64 {\n  asm \"mov rax, {missing}\\n add rax, {%nope}\"\n  ret 0\n}",
        )
        .expect_err("undefined placeholder");
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].kind, DiagnosticKind::CodegenError);
        assert!(errs[0].message.contains("{missing}"));
        assert!(errs[0].message.contains("{%nope}"));
    }

    #[test]
    fn malformed_raw_assembly_is_reported() {
        let errs = generate_text("entry @main\nfunc @main() -> i64 {\n  asm \"bogus rax\"\n  ret 0\n}")
            .expect_err("bad asm");
        assert!(errs[0].message.contains("unknown instruction"));
    }

    #[test]
    fn float_comparisons_handle_unordered() {
        let module = generate_text(
            "entry @main\nfunc @main() -> i64 {\n  var %c: bool\n  %c = eq.f64 1.0, NaN\n  ret %c\n}",
        )
        .expect("generate");
        let main = function_text(&module, "main");
        assert!(main.iter().any(|t| t == "ucomisd xmm0, xmm1"));
        assert!(main.iter().any(|t| t == "setnp cl"));
    }

    #[test]
    fn floor_division_adjusts_toward_negative_infinity() {
        let module = generate_text(
            "entry @main\nfunc @main(%a: i64) -> i64 {\n  var %q: i64\n  %q = floordiv.i64 %a, 2\n  ret %q\n}",
        )
        .expect("generate");
        let main = function_text(&module, "main");
        let idiv = main.iter().position(|t| t == "idiv rcx").expect("idiv");
        assert_eq!(main[idiv - 1], "cqo");
        assert!(main[idiv..].contains(&"sub rax, 1".to_string()));
    }

    #[test]
    fn generation_is_deterministic() {
        let text = "entry @main\nfunc @main() -> i64 {\n  var %i: i64\n  var %c: bool\n  %i = mov.i64 0\nL0:\n  %c = lt.i64 %i, 10\n  br %c, L1, L2\nL1:\n  %i = add.i64 %i, 1\n  jmp L0\nL2:\n  ret %i\n}";
        let a = generate_text(text).expect("generate");
        let b = generate_text(text).expect("generate");
        assert_eq!(a, b);
    }

    #[test]
    fn missing_entry_is_an_error() {
        let errs = generate_text("entry @main\nfunc @other() -> i64 {\n  ret 0\n}").expect_err("no main");
        assert!(errs[0].message.contains("entry function"));
    }
}
