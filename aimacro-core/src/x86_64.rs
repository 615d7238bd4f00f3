//! x86-64 machine instructions and their binary encoding.
//!
//! Only the subset the code generator, the runtime and hand written
//! `asm` blocks need is modelled. Every general purpose operation is
//! 64-bit unless its name says otherwise (`MovByte*`, `Movzx*`, `Setcc`).

use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AsmError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("invalid memory operand: {0}")]
    Memory(String),
    #[error("label `{0}` is defined more than once")]
    DuplicateLabel(String),
    #[error("undefined label `{0}`")]
    UndefinedLabel(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reg {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

const REG_NAMES: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

const BYTE_NAMES: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b", "r12b",
    "r13b", "r14b", "r15b",
];

impl Reg {
    pub const ALL: [Reg; 16] = [
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rbx,
        Reg::Rsp,
        Reg::Rbp,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
    ];

    /// System V integer argument registers, in order.
    pub const ARGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

    pub fn code(self) -> u8 {
        self as u8
    }

    fn low(self) -> u8 {
        self.code() & 7
    }

    pub fn name(self) -> &'static str {
        REG_NAMES[self as usize]
    }

    pub fn byte_name(self) -> &'static str {
        BYTE_NAMES[self as usize]
    }

    pub fn parse(text: &str) -> Option<Reg> {
        REG_NAMES
            .iter()
            .position(|n| *n == text)
            .map(|i| Reg::ALL[i])
    }

    pub fn parse_byte(text: &str) -> Option<Reg> {
        BYTE_NAMES
            .iter()
            .position(|n| *n == text)
            .map(|i| Reg::ALL[i])
    }

    /// Byte access to spl/bpl/sil/dil needs a REX prefix.
    fn byte_needs_rex(self) -> bool {
        (4..8).contains(&self.code())
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Xmm(pub u8);

impl Xmm {
    pub fn parse(text: &str) -> Option<Xmm> {
        let n: u8 = text.strip_prefix("xmm")?.parse().ok()?;
        (n < 16).then_some(Xmm(n))
    }
}

impl fmt::Display for Xmm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xmm{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mem {
    /// `[base + index*scale + disp]`
    Base {
        base: Reg,
        index: Option<(Reg, u8)>,
        disp: i32,
    },
    /// `[rip + symbol]`
    Rip(String),
}

impl Mem {
    pub fn base(base: Reg, disp: i32) -> Mem {
        Mem::Base {
            base,
            index: None,
            disp,
        }
    }
}

impl fmt::Display for Mem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mem::Rip(sym) => write!(f, "[rip + {sym}]"),
            Mem::Base { base, index, disp } => {
                write!(f, "[{base}")?;
                if let Some((idx, scale)) = index {
                    write!(f, " + {idx}*{scale}")?;
                }
                match disp {
                    0 => {}
                    d if *d < 0 => write!(f, " - {}", -(*d as i64))?,
                    d => write!(f, " + {d}")?,
                }
                f.write_str("]")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cond {
    O,
    No,
    B,
    Ae,
    E,
    Ne,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
}

impl Cond {
    const ALL: [Cond; 16] = [
        Cond::O,
        Cond::No,
        Cond::B,
        Cond::Ae,
        Cond::E,
        Cond::Ne,
        Cond::Be,
        Cond::A,
        Cond::S,
        Cond::Ns,
        Cond::P,
        Cond::Np,
        Cond::L,
        Cond::Ge,
        Cond::Le,
        Cond::G,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        [
            "o", "no", "b", "ae", "e", "ne", "be", "a", "s", "ns", "p", "np", "l", "ge", "le", "g",
        ][self as usize]
    }

    pub fn negate(self) -> Cond {
        Cond::ALL[(self.code() ^ 1) as usize]
    }

    /// Accepts the canonical suffix and the usual aliases (`z`, `nz`, `c`...).
    pub fn parse(text: &str) -> Option<Cond> {
        let canonical = match text {
            "z" => "e",
            "nz" => "ne",
            "c" | "nae" => "b",
            "nc" | "nb" => "ae",
            "na" => "be",
            "nbe" => "a",
            "pe" => "p",
            "po" => "np",
            "nge" => "l",
            "nl" => "ge",
            "ng" => "le",
            "nle" => "g",
            other => other,
        };
        Cond::ALL.iter().copied().find(|c| c.name() == canonical)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AluOp {
    Add,
    Or,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    fn code(self) -> u8 {
        match self {
            AluOp::Add => 0,
            AluOp::Or => 1,
            AluOp::And => 4,
            AluOp::Sub => 5,
            AluOp::Xor => 6,
            AluOp::Cmp => 7,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AluOp::Add => "add",
            AluOp::Or => "or",
            AluOp::And => "and",
            AluOp::Sub => "sub",
            AluOp::Xor => "xor",
            AluOp::Cmp => "cmp",
        }
    }

    pub fn parse(text: &str) -> Option<AluOp> {
        [AluOp::Add, AluOp::Or, AluOp::And, AluOp::Sub, AluOp::Xor, AluOp::Cmp]
            .into_iter()
            .find(|op| op.name() == text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftOp {
    Shl,
    Shr,
    Sar,
}

impl ShiftOp {
    fn code(self) -> u8 {
        match self {
            ShiftOp::Shl => 4,
            ShiftOp::Shr => 5,
            ShiftOp::Sar => 7,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ShiftOp::Shl => "shl",
            ShiftOp::Shr => "shr",
            ShiftOp::Sar => "sar",
        }
    }

    pub fn parse(text: &str) -> Option<ShiftOp> {
        match text {
            "shl" | "sal" => Some(ShiftOp::Shl),
            "shr" => Some(ShiftOp::Shr),
            "sar" => Some(ShiftOp::Sar),
            _ => None,
        }
    }
}

/// Single register operand instructions of the F7/FF groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Neg,
    Mul,
    Div,
    Idiv,
    Inc,
    Dec,
}

impl UnaryOp {
    fn opcode_ext(self) -> (u8, u8) {
        match self {
            UnaryOp::Not => (0xF7, 2),
            UnaryOp::Neg => (0xF7, 3),
            UnaryOp::Mul => (0xF7, 4),
            UnaryOp::Div => (0xF7, 6),
            UnaryOp::Idiv => (0xF7, 7),
            UnaryOp::Inc => (0xFF, 0),
            UnaryOp::Dec => (0xFF, 1),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Not => "not",
            UnaryOp::Neg => "neg",
            UnaryOp::Mul => "mul",
            UnaryOp::Div => "div",
            UnaryOp::Idiv => "idiv",
            UnaryOp::Inc => "inc",
            UnaryOp::Dec => "dec",
        }
    }

    pub fn parse(text: &str) -> Option<UnaryOp> {
        [
            UnaryOp::Not,
            UnaryOp::Neg,
            UnaryOp::Mul,
            UnaryOp::Div,
            UnaryOp::Idiv,
            UnaryOp::Inc,
            UnaryOp::Dec,
        ]
        .into_iter()
        .find(|op| op.name() == text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SseOp {
    Add,
    Sub,
    Mul,
    Div,
    Sqrt,
}

impl SseOp {
    fn opcode(self) -> u8 {
        match self {
            SseOp::Add => 0x58,
            SseOp::Sub => 0x5C,
            SseOp::Mul => 0x59,
            SseOp::Div => 0x5E,
            SseOp::Sqrt => 0x51,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SseOp::Add => "addsd",
            SseOp::Sub => "subsd",
            SseOp::Mul => "mulsd",
            SseOp::Div => "divsd",
            SseOp::Sqrt => "sqrtsd",
        }
    }

    pub fn parse(text: &str) -> Option<SseOp> {
        [SseOp::Add, SseOp::Sub, SseOp::Mul, SseOp::Div, SseOp::Sqrt]
            .into_iter()
            .find(|op| op.name() == text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachInst {
    Label(String),
    MovRR(Reg, Reg),
    MovRI(Reg, i64),
    MovRM(Reg, Mem),
    MovMR(Mem, Reg),
    MovMI(Mem, i32),
    MovByteMR(Mem, Reg),
    MovByteMI(Mem, u8),
    MovzxRM8(Reg, Mem),
    MovzxRR8(Reg, Reg),
    Lea(Reg, Mem),
    Alu(AluOp, Reg, Reg),
    AluRI(AluOp, Reg, i32),
    AluRM(AluOp, Reg, Mem),
    AluMR(AluOp, Mem, Reg),
    AluMI(AluOp, Mem, i32),
    Imul(Reg, Reg),
    Shift(ShiftOp, Reg, u8),
    ShiftCl(ShiftOp, Reg),
    Unary(UnaryOp, Reg),
    Cqo,
    Setcc(Cond, Reg),
    Cmov(Cond, Reg, Reg),
    Test(Reg, Reg),
    Push(Reg),
    Pop(Reg),
    Jmp(String),
    Jcc(Cond, String),
    Call(String),
    Ret,
    Syscall,
    Nop,
    RepMovsb,
    RepStosb,
    MovqXR(Xmm, Reg),
    MovqRX(Reg, Xmm),
    Sse(SseOp, Xmm, Xmm),
    Ucomisd(Xmm, Xmm),
    Cvtsi2sd(Xmm, Reg),
    Cvttsd2si(Reg, Xmm),
    Cvtsd2si(Reg, Xmm),
}

impl MachInst {
    /// Target of a jump or call, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            MachInst::Jmp(t) | MachInst::Jcc(_, t) | MachInst::Call(t) => Some(t),
            _ => None,
        }
    }

    /// Jumps have a short (rel8) form.
    pub fn is_relaxable(&self) -> bool {
        matches!(self, MachInst::Jmp(_) | MachInst::Jcc(..))
    }

    pub fn mem(&self) -> Option<&Mem> {
        match self {
            MachInst::MovRM(_, m)
            | MachInst::MovMR(m, _)
            | MachInst::MovMI(m, _)
            | MachInst::MovByteMR(m, _)
            | MachInst::MovByteMI(m, _)
            | MachInst::MovzxRM8(_, m)
            | MachInst::Lea(_, m)
            | MachInst::AluRM(_, _, m)
            | MachInst::AluMR(_, m, _)
            | MachInst::AluMI(_, m, _) => Some(m),
            _ => None,
        }
    }

    /// Rename label and symbol references with `f`.
    pub fn map_symbols(self, mut f: impl FnMut(String) -> String) -> MachInst {
        let map_mem = |m: Mem, f: &mut dyn FnMut(String) -> String| match m {
            Mem::Rip(sym) => Mem::Rip(f(sym)),
            other => other,
        };
        match self {
            MachInst::Label(l) => MachInst::Label(f(l)),
            MachInst::Jmp(t) => MachInst::Jmp(f(t)),
            MachInst::Jcc(c, t) => MachInst::Jcc(c, f(t)),
            MachInst::Call(t) => MachInst::Call(f(t)),
            MachInst::MovRM(r, m) => MachInst::MovRM(r, map_mem(m, &mut f)),
            MachInst::MovMR(m, r) => MachInst::MovMR(map_mem(m, &mut f), r),
            MachInst::MovMI(m, i) => MachInst::MovMI(map_mem(m, &mut f), i),
            MachInst::MovByteMR(m, r) => MachInst::MovByteMR(map_mem(m, &mut f), r),
            MachInst::MovByteMI(m, i) => MachInst::MovByteMI(map_mem(m, &mut f), i),
            MachInst::MovzxRM8(r, m) => MachInst::MovzxRM8(r, map_mem(m, &mut f)),
            MachInst::Lea(r, m) => MachInst::Lea(r, map_mem(m, &mut f)),
            MachInst::AluRM(op, r, m) => MachInst::AluRM(op, r, map_mem(m, &mut f)),
            MachInst::AluMR(op, m, r) => MachInst::AluMR(op, map_mem(m, &mut f), r),
            MachInst::AluMI(op, m, i) => MachInst::AluMI(op, map_mem(m, &mut f), i),
            other => other,
        }
    }
}

impl fmt::Display for MachInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachInst::Label(l) => write!(f, "{l}:"),
            MachInst::MovRR(d, s) => write!(f, "mov {d}, {s}"),
            MachInst::MovRI(d, i) => {
                if i32::try_from(*i).is_ok() {
                    write!(f, "mov {d}, {i}")
                } else {
                    write!(f, "movabs {d}, {i}")
                }
            }
            MachInst::MovRM(d, m) => write!(f, "mov {d}, qword ptr {m}"),
            MachInst::MovMR(m, s) => write!(f, "mov qword ptr {m}, {s}"),
            MachInst::MovMI(m, i) => write!(f, "mov qword ptr {m}, {i}"),
            MachInst::MovByteMR(m, s) => write!(f, "mov byte ptr {m}, {}", s.byte_name()),
            MachInst::MovByteMI(m, i) => write!(f, "mov byte ptr {m}, {i}"),
            MachInst::MovzxRM8(d, m) => write!(f, "movzx {d}, byte ptr {m}"),
            MachInst::MovzxRR8(d, s) => write!(f, "movzx {d}, {}", s.byte_name()),
            MachInst::Lea(d, m) => write!(f, "lea {d}, {m}"),
            MachInst::Alu(op, d, s) => write!(f, "{} {d}, {s}", op.name()),
            MachInst::AluRI(op, d, i) => write!(f, "{} {d}, {i}", op.name()),
            MachInst::AluRM(op, d, m) => write!(f, "{} {d}, qword ptr {m}", op.name()),
            MachInst::AluMR(op, m, s) => write!(f, "{} qword ptr {m}, {s}", op.name()),
            MachInst::AluMI(op, m, i) => write!(f, "{} qword ptr {m}, {i}", op.name()),
            MachInst::Imul(d, s) => write!(f, "imul {d}, {s}"),
            MachInst::Shift(op, r, n) => write!(f, "{} {r}, {n}", op.name()),
            MachInst::ShiftCl(op, r) => write!(f, "{} {r}, cl", op.name()),
            MachInst::Unary(op, r) => write!(f, "{} {r}", op.name()),
            MachInst::Cqo => f.write_str("cqo"),
            MachInst::Setcc(c, r) => write!(f, "set{} {}", c.name(), r.byte_name()),
            MachInst::Cmov(c, d, s) => write!(f, "cmov{} {d}, {s}", c.name()),
            MachInst::Test(a, b) => write!(f, "test {a}, {b}"),
            MachInst::Push(r) => write!(f, "push {r}"),
            MachInst::Pop(r) => write!(f, "pop {r}"),
            MachInst::Jmp(t) => write!(f, "jmp {t}"),
            MachInst::Jcc(c, t) => write!(f, "j{} {t}", c.name()),
            MachInst::Call(t) => write!(f, "call {t}"),
            MachInst::Ret => f.write_str("ret"),
            MachInst::Syscall => f.write_str("syscall"),
            MachInst::Nop => f.write_str("nop"),
            MachInst::RepMovsb => f.write_str("rep movsb"),
            MachInst::RepStosb => f.write_str("rep stosb"),
            MachInst::MovqXR(x, r) => write!(f, "movq {x}, {r}"),
            MachInst::MovqRX(r, x) => write!(f, "movq {r}, {x}"),
            MachInst::Sse(op, d, s) => write!(f, "{} {d}, {s}", op.name()),
            MachInst::Ucomisd(a, b) => write!(f, "ucomisd {a}, {b}"),
            MachInst::Cvtsi2sd(x, r) => write!(f, "cvtsi2sd {x}, {r}"),
            MachInst::Cvttsd2si(r, x) => write!(f, "cvttsd2si {r}, {x}"),
            MachInst::Cvtsd2si(r, x) => write!(f, "cvtsd2si {r}, {x}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// A PC-relative field inside an encoded instruction.
///
/// The resolved field value is `address(target) + addend - address(field)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fixup {
    /// Offset of the field within the instruction.
    pub at: usize,
    pub target: String,
    pub addend: i64,
    /// Field width in bytes, 1 or 4.
    pub size: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub fixup: Option<Fixup>,
}

enum Rm<'a> {
    Reg(u8),
    Mem(&'a Mem),
}

struct Form<'a> {
    /// Mandatory prefix emitted before REX (0x66, 0xF2, 0xF3).
    prefix: Option<u8>,
    wide: bool,
    force_rex: bool,
    opcode: &'a [u8],
    reg: u8,
    rm: Rm<'a>,
    imm: &'a [u8],
}

fn encode_form(form: Form<'_>) -> Result<Encoded, AsmError> {
    let mut out = Vec::with_capacity(16);
    if let Some(p) = form.prefix {
        out.push(p);
    }

    let (rm_code, index_code) = match &form.rm {
        Rm::Reg(code) => (*code, 0),
        Rm::Mem(Mem::Base { base, index, .. }) => {
            (base.code(), index.map(|(r, _)| r.code()).unwrap_or(0))
        }
        Rm::Mem(Mem::Rip(_)) => (0, 0),
    };
    let rex = 0x40
        | (u8::from(form.wide) << 3)
        | ((form.reg >> 3) << 2)
        | ((index_code >> 3) << 1)
        | (rm_code >> 3);
    if rex != 0x40 || form.force_rex {
        out.push(rex);
    }
    out.extend_from_slice(form.opcode);

    let reg = (form.reg & 7) << 3;
    let mut fixup = None;
    match form.rm {
        Rm::Reg(code) => out.push(0xC0 | reg | (code & 7)),
        Rm::Mem(Mem::Rip(sym)) => {
            out.push(reg | 0b101);
            fixup = Some(Fixup {
                at: out.len(),
                target: sym.clone(),
                addend: -(4 + form.imm.len() as i64),
                size: 4,
            });
            out.extend_from_slice(&[0; 4]);
        }
        Rm::Mem(Mem::Base { base, index, disp }) => {
            let needs_disp8_zero = base.low() == 5;
            let mode: u8 = if *disp == 0 && !needs_disp8_zero {
                0b00
            } else if i8::try_from(*disp).is_ok() {
                0b01
            } else {
                0b10
            };
            match index {
                Some((idx, scale)) => {
                    if *idx == Reg::Rsp {
                        return Err(AsmError::Memory("rsp cannot be an index register".into()));
                    }
                    let scale_bits = match scale {
                        1 => 0,
                        2 => 1,
                        4 => 2,
                        8 => 3,
                        other => {
                            return Err(AsmError::Memory(format!("scale {other} is not 1, 2, 4 or 8")));
                        }
                    };
                    out.push((mode << 6) | reg | 0b100);
                    out.push((scale_bits << 6) | (idx.low() << 3) | base.low());
                }
                None if base.low() == 4 => {
                    out.push((mode << 6) | reg | 0b100);
                    out.push(0x24);
                }
                None => out.push((mode << 6) | reg | base.low()),
            }
            match mode {
                0b01 => out.push(*disp as i8 as u8),
                0b10 => out.extend_from_slice(&disp.to_le_bytes()),
                _ => {}
            }
        }
    }
    out.extend_from_slice(form.imm);
    Ok(Encoded { bytes: out, fixup })
}

fn wide<'a>(opcode: &'a [u8], reg: u8, rm: Rm<'a>, imm: &'a [u8]) -> Form<'a> {
    Form {
        prefix: None,
        wide: true,
        force_rex: false,
        opcode,
        reg,
        rm,
        imm,
    }
}

fn simple(bytes: &[u8]) -> Result<Encoded, AsmError> {
    Ok(Encoded {
        bytes: bytes.to_vec(),
        fixup: None,
    })
}

fn branch(opcode: &[u8], target: &str, size: u8) -> Result<Encoded, AsmError> {
    let mut bytes = opcode.to_vec();
    let at = bytes.len();
    bytes.extend(std::iter::repeat_n(0u8, size as usize));
    Ok(Encoded {
        bytes,
        fixup: Some(Fixup {
            at,
            target: target.to_string(),
            addend: -(size as i64),
            size,
        }),
    })
}

fn alu_imm(imm: i32) -> (u8, Vec<u8>) {
    match i8::try_from(imm) {
        Ok(b) => (0x83, vec![b as u8]),
        Err(_) => (0x81, imm.to_le_bytes().to_vec()),
    }
}

/// Encode one instruction. `short` selects the rel8 form of jumps.
pub fn encode(inst: &MachInst, short: bool) -> Result<Encoded, AsmError> {
    use MachInst as M;
    match inst {
        M::Label(_) => Ok(Encoded::default()),
        M::MovRR(d, s) => encode_form(wide(&[0x89], s.code(), Rm::Reg(d.code()), &[])),
        M::MovRI(d, imm) => match i32::try_from(*imm) {
            Ok(v) => encode_form(wide(&[0xC7], 0, Rm::Reg(d.code()), &v.to_le_bytes())),
            Err(_) => {
                let rex = 0x48 | (d.code() >> 3);
                let mut bytes = vec![rex, 0xB8 + d.low()];
                bytes.extend_from_slice(&imm.to_le_bytes());
                simple(&bytes)
            }
        },
        M::MovRM(d, m) => encode_form(wide(&[0x8B], d.code(), Rm::Mem(m), &[])),
        M::MovMR(m, s) => encode_form(wide(&[0x89], s.code(), Rm::Mem(m), &[])),
        M::MovMI(m, imm) => encode_form(wide(&[0xC7], 0, Rm::Mem(m), &imm.to_le_bytes())),
        M::MovByteMR(m, s) => encode_form(Form {
            wide: false,
            force_rex: s.byte_needs_rex(),
            ..wide(&[0x88], s.code(), Rm::Mem(m), &[])
        }),
        M::MovByteMI(m, imm) => encode_form(Form {
            wide: false,
            ..wide(&[0xC6], 0, Rm::Mem(m), &[*imm])
        }),
        M::MovzxRM8(d, m) => encode_form(wide(&[0x0F, 0xB6], d.code(), Rm::Mem(m), &[])),
        M::MovzxRR8(d, s) => encode_form(wide(&[0x0F, 0xB6], d.code(), Rm::Reg(s.code()), &[])),
        M::Lea(d, m) => encode_form(wide(&[0x8D], d.code(), Rm::Mem(m), &[])),
        M::Alu(op, d, s) => encode_form(wide(&[(op.code() << 3) | 1], s.code(), Rm::Reg(d.code()), &[])),
        M::AluRI(op, d, imm) => {
            let (opcode, bytes) = alu_imm(*imm);
            encode_form(wide(&[opcode], op.code(), Rm::Reg(d.code()), &bytes))
        }
        M::AluRM(op, d, m) => encode_form(wide(&[(op.code() << 3) | 3], d.code(), Rm::Mem(m), &[])),
        M::AluMR(op, m, s) => encode_form(wide(&[(op.code() << 3) | 1], s.code(), Rm::Mem(m), &[])),
        M::AluMI(op, m, imm) => {
            let (opcode, bytes) = alu_imm(*imm);
            encode_form(wide(&[opcode], op.code(), Rm::Mem(m), &bytes))
        }
        M::Imul(d, s) => encode_form(wide(&[0x0F, 0xAF], d.code(), Rm::Reg(s.code()), &[])),
        M::Shift(op, r, n) => encode_form(wide(&[0xC1], op.code(), Rm::Reg(r.code()), &[*n])),
        M::ShiftCl(op, r) => encode_form(wide(&[0xD3], op.code(), Rm::Reg(r.code()), &[])),
        M::Unary(op, r) => {
            let (opcode, ext) = op.opcode_ext();
            encode_form(wide(&[opcode], ext, Rm::Reg(r.code()), &[]))
        }
        M::Cqo => simple(&[0x48, 0x99]),
        M::Setcc(c, r) => encode_form(Form {
            wide: false,
            force_rex: r.byte_needs_rex(),
            ..wide(&[0x0F, 0x90 + c.code()], 0, Rm::Reg(r.code()), &[])
        }),
        M::Cmov(c, d, s) => encode_form(wide(&[0x0F, 0x40 + c.code()], d.code(), Rm::Reg(s.code()), &[])),
        M::Test(a, b) => encode_form(wide(&[0x85], b.code(), Rm::Reg(a.code()), &[])),
        M::Push(r) | M::Pop(r) => {
            let base = if matches!(inst, M::Push(_)) { 0x50 } else { 0x58 };
            if r.code() >= 8 {
                simple(&[0x41, base + r.low()])
            } else {
                simple(&[base + r.low()])
            }
        }
        M::Jmp(t) if short => branch(&[0xEB], t, 1),
        M::Jmp(t) => branch(&[0xE9], t, 4),
        M::Jcc(c, t) if short => branch(&[0x70 + c.code()], t, 1),
        M::Jcc(c, t) => branch(&[0x0F, 0x80 + c.code()], t, 4),
        M::Call(t) => branch(&[0xE8], t, 4),
        M::Ret => simple(&[0xC3]),
        M::Syscall => simple(&[0x0F, 0x05]),
        M::Nop => simple(&[0x90]),
        M::RepMovsb => simple(&[0xF3, 0xA4]),
        M::RepStosb => simple(&[0xF3, 0xAA]),
        M::MovqXR(x, r) => encode_form(Form {
            prefix: Some(0x66),
            ..wide(&[0x0F, 0x6E], x.0, Rm::Reg(r.code()), &[])
        }),
        M::MovqRX(r, x) => encode_form(Form {
            prefix: Some(0x66),
            ..wide(&[0x0F, 0x7E], x.0, Rm::Reg(r.code()), &[])
        }),
        M::Sse(op, d, s) => encode_form(Form {
            prefix: Some(0xF2),
            wide: false,
            ..wide(&[0x0F, op.opcode()], d.0, Rm::Reg(s.0), &[])
        }),
        M::Ucomisd(a, b) => encode_form(Form {
            prefix: Some(0x66),
            wide: false,
            ..wide(&[0x0F, 0x2E], a.0, Rm::Reg(b.0), &[])
        }),
        M::Cvtsi2sd(x, r) => encode_form(Form {
            prefix: Some(0xF2),
            ..wide(&[0x0F, 0x2A], x.0, Rm::Reg(r.code()), &[])
        }),
        M::Cvttsd2si(r, x) => encode_form(Form {
            prefix: Some(0xF2),
            ..wide(&[0x0F, 0x2C], r.code(), Rm::Reg(x.0), &[])
        }),
        M::Cvtsd2si(r, x) => encode_form(Form {
            prefix: Some(0xF2),
            ..wide(&[0x0F, 0x2D], r.code(), Rm::Reg(x.0), &[])
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(inst: MachInst) -> Vec<u8> {
        encode(&inst, false).expect("encode").bytes
    }

    #[test]
    fn moves() {
        assert_eq!(bytes(MachInst::MovRR(Reg::Rax, Reg::Rbx)), [0x48, 0x89, 0xD8]);
        assert_eq!(bytes(MachInst::MovRR(Reg::R12, Reg::Rax)), [0x49, 0x89, 0xC4]);
        assert_eq!(bytes(MachInst::MovRI(Reg::Rax, 60)), [0x48, 0xC7, 0xC0, 60, 0, 0, 0]);
        assert_eq!(
            bytes(MachInst::MovRI(Reg::Rax, 0x1_0000_0000)),
            [0x48, 0xB8, 0, 0, 0, 0, 1, 0, 0, 0]
        );
        assert_eq!(
            bytes(MachInst::MovRM(Reg::Rax, Mem::base(Reg::Rbp, -8))),
            [0x48, 0x8B, 0x45, 0xF8]
        );
        assert_eq!(
            bytes(MachInst::MovMR(Mem::base(Reg::Rsp, 0), Reg::Rdi)),
            [0x48, 0x89, 0x3C, 0x24]
        );
        assert_eq!(
            bytes(MachInst::MovRM(Reg::Rcx, Mem::base(Reg::R13, 0))),
            [0x49, 0x8B, 0x4D, 0x00]
        );
        assert_eq!(
            bytes(MachInst::MovByteMR(Mem::base(Reg::Rdi, 0), Reg::Rsi)),
            [0x40, 0x88, 0x37]
        );
    }

    #[test]
    fn indexed_memory() {
        let mem = Mem::Base {
            base: Reg::Rax,
            index: Some((Reg::Rcx, 8)),
            disp: 16,
        };
        assert_eq!(bytes(MachInst::Lea(Reg::Rdx, mem)), [0x48, 0x8D, 0x54, 0xC8, 0x10]);
        let bad = Mem::Base {
            base: Reg::Rax,
            index: Some((Reg::Rsp, 1)),
            disp: 0,
        };
        assert!(encode(&MachInst::Lea(Reg::Rax, bad), false).is_err());
    }

    #[test]
    fn rip_relative_fixup_accounts_for_immediate() {
        let enc = encode(&MachInst::MovMI(Mem::Rip("g.x".into()), 5), false).expect("encode");
        assert_eq!(enc.bytes.len(), 2 + 1 + 4 + 4);
        let fixup = enc.fixup.expect("fixup");
        assert_eq!(fixup.at, 3);
        assert_eq!(fixup.addend, -8);
        let enc = encode(&MachInst::Lea(Reg::Rax, Mem::Rip("str.0".into())), false).expect("encode");
        assert_eq!(enc.bytes[..3], [0x48, 0x8D, 0x05]);
        assert_eq!(enc.fixup.expect("fixup").addend, -4);
    }

    #[test]
    fn arithmetic() {
        assert_eq!(bytes(MachInst::Alu(AluOp::Add, Reg::Rax, Reg::Rcx)), [0x48, 0x01, 0xC8]);
        assert_eq!(bytes(MachInst::AluRI(AluOp::Sub, Reg::Rsp, 16)), [0x48, 0x83, 0xEC, 0x10]);
        assert_eq!(
            bytes(MachInst::AluRI(AluOp::Cmp, Reg::Rax, 1000)),
            [0x48, 0x81, 0xF8, 0xE8, 0x03, 0, 0]
        );
        assert_eq!(bytes(MachInst::Imul(Reg::Rax, Reg::R12)), [0x49, 0x0F, 0xAF, 0xC4]);
        assert_eq!(bytes(MachInst::Unary(UnaryOp::Idiv, Reg::Rcx)), [0x48, 0xF7, 0xF9]);
        assert_eq!(bytes(MachInst::Cqo), [0x48, 0x99]);
        assert_eq!(bytes(MachInst::Shift(ShiftOp::Shl, Reg::Rax, 3)), [0x48, 0xC1, 0xE0, 3]);
        assert_eq!(bytes(MachInst::Setcc(Cond::L, Reg::Rax)), [0x0F, 0x9C, 0xC0]);
        assert_eq!(bytes(MachInst::Setcc(Cond::E, Reg::Rsi)), [0x40, 0x0F, 0x94, 0xC6]);
        assert_eq!(bytes(MachInst::MovzxRR8(Reg::Rax, Reg::Rax)), [0x48, 0x0F, 0xB6, 0xC0]);
    }

    #[test]
    fn stack_and_control() {
        assert_eq!(bytes(MachInst::Push(Reg::Rbp)), [0x55]);
        assert_eq!(bytes(MachInst::Pop(Reg::R15)), [0x41, 0x5F]);
        assert_eq!(bytes(MachInst::Ret), [0xC3]);
        assert_eq!(bytes(MachInst::Syscall), [0x0F, 0x05]);
        let call = encode(&MachInst::Call("f".into()), false).expect("encode");
        assert_eq!(call.bytes, [0xE8, 0, 0, 0, 0]);
        assert_eq!(call.fixup.as_ref().map(|f| f.addend), Some(-4));
        let short = encode(&MachInst::Jcc(Cond::Ne, "x".into()), true).expect("encode");
        assert_eq!(short.bytes, [0x75, 0]);
        let long = encode(&MachInst::Jcc(Cond::Ne, "x".into()), false).expect("encode");
        assert_eq!(long.bytes, [0x0F, 0x85, 0, 0, 0, 0]);
    }

    #[test]
    fn sse() {
        assert_eq!(bytes(MachInst::MovqXR(Xmm(0), Reg::Rax)), [0x66, 0x48, 0x0F, 0x6E, 0xC0]);
        assert_eq!(bytes(MachInst::MovqRX(Reg::Rax, Xmm(1))), [0x66, 0x48, 0x0F, 0x7E, 0xC8]);
        assert_eq!(bytes(MachInst::Sse(SseOp::Add, Xmm(0), Xmm(1))), [0xF2, 0x0F, 0x58, 0xC1]);
        assert_eq!(bytes(MachInst::Ucomisd(Xmm(0), Xmm(1))), [0x66, 0x0F, 0x2E, 0xC1]);
        assert_eq!(bytes(MachInst::Cvtsi2sd(Xmm(0), Reg::Rax)), [0xF2, 0x48, 0x0F, 0x2A, 0xC0]);
        assert_eq!(bytes(MachInst::Cvttsd2si(Reg::Rax, Xmm(0))), [0xF2, 0x48, 0x0F, 0x2C, 0xC0]);
    }

    #[test]
    fn listing_format() {
        assert_eq!(
            MachInst::MovMR(Mem::base(Reg::Rbp, -16), Reg::Rbx).to_string(),
            "mov qword ptr [rbp - 16], rbx"
        );
        assert_eq!(MachInst::Jcc(Cond::Ge, ".c1".into()).to_string(), "jge .c1");
        assert_eq!(Cond::parse("nz"), Some(Cond::Ne));
        assert_eq!(Cond::L.negate(), Cond::Ge);
    }
}
