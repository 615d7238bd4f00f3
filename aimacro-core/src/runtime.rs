//! Runtime routines linked into every executable that needs them.
//!
//! The routines are written in the same Intel syntax `asm` blocks use and
//! follow the System V calling convention: arguments in `rdi`, `rsi`,
//! `rdx`..., result in `rax`. They only touch caller-saved registers.
//! Heap memory comes from a bump allocator that maps 1 MiB chunks with
//! `mmap`; nothing is ever unmapped before exit.

use crate::asm::parse_asm;
use crate::assemble::{Assembled, assemble};
use crate::x86_64::{AluOp, AsmError, MachInst, Reg};

pub const START_SYMBOL: &str = "_start";

/// Zero-initialised 8-byte data words owned by the runtime.
pub const RUNTIME_DATA: &[&str] = &["__aim_heap.ptr", "__aim_heap.end"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeRoutine {
    pub name: &'static str,
    pub source: &'static str,
}

impl RuntimeRoutine {
    pub fn assemble(&self) -> Result<Assembled, AsmError> {
        assemble(&parse_asm(self.source)?)
    }
}

pub fn find_routine(name: &str) -> Option<&'static RuntimeRoutine> {
    ROUTINES.iter().find(|r| r.name == name)
}

/// Process entry: run the initializer (if any) and `entry`, then exit
/// with `entry`'s return value as the status.
pub fn start_stub(init: Option<&str>, entry: &str) -> Vec<MachInst> {
    let mut insts = vec![
        MachInst::Label(START_SYMBOL.to_string()),
        MachInst::Alu(AluOp::Xor, Reg::Rbp, Reg::Rbp),
    ];
    if let Some(init) = init {
        insts.push(MachInst::Call(init.to_string()));
    }
    insts.extend([
        MachInst::Call(entry.to_string()),
        MachInst::MovRR(Reg::Rdi, Reg::Rax),
        MachInst::MovRI(Reg::Rax, 60),
        MachInst::Syscall,
    ]);
    insts
}

pub const ROUTINES: &[RuntimeRoutine] = &[
    RuntimeRoutine {
        name: "__aim_alloc",
        source: r"
__aim_alloc:
    lea rax, [rdi + 23]          ; size + header, rounded up to 16
    and rax, -16
    mov rcx, qword ptr [rip + __aim_heap.ptr]
    mov rdx, rcx
    add rdx, rax
    cmp rdx, qword ptr [rip + __aim_heap.end]
    ja .grow
    mov qword ptr [rip + __aim_heap.ptr], rdx
    mov qword ptr [rcx], rdi
    lea rax, [rcx + 8]
    ret
.grow:
    push rdi
    push rax
    mov rsi, 1048576
    cmp rax, rsi
    jbe .map
    mov rsi, rax
.map:
    push rsi
    mov rax, 9                   ; mmap(0, len, READ|WRITE, PRIVATE|ANONYMOUS, -1, 0)
    xor rdi, rdi
    mov rdx, 3
    mov r10, 34
    mov r8, -1
    xor r9, r9
    syscall
    pop rsi
    pop rdx
    pop rdi
    cmp rax, -4096
    ja .oom
    lea rcx, [rax + rdx]
    mov qword ptr [rip + __aim_heap.ptr], rcx
    add rsi, rax
    mov qword ptr [rip + __aim_heap.end], rsi
    mov qword ptr [rax], rdi
    add rax, 8
    ret
.oom:
    sub rsp, 16
    movabs rax, 0x724579726f6d654d   ; MemoryEr
    mov qword ptr [rsp], rax
    mov rax, 0x0a726f72              ; ror\n
    mov qword ptr [rsp + 8], rax
    mov rax, 1
    mov rdi, 2
    mov rsi, rsp
    mov rdx, 12
    syscall
    mov rax, 60
    mov rdi, 1
    syscall
",
    },
    RuntimeRoutine {
        name: "__aim_free",
        source: r"
__aim_free:
    ret                          ; bump allocated, released at exit
",
    },
    RuntimeRoutine {
        name: "__aim_write",
        source: r"
; __aim_write(ptr, len): write all bytes to stdout
__aim_write:
    mov rdx, rsi
    mov rsi, rdi
.again:
    test rdx, rdx
    je .done
    mov rax, 1
    mov rdi, 1
    syscall
    cmp rax, 0
    jle .done
    add rsi, rax
    sub rdx, rax
    jmp .again
.done:
    ret
",
    },
    RuntimeRoutine {
        name: "__aim_print_str",
        source: r"
__aim_print_str:
    mov rsi, qword ptr [rdi]
    add rdi, 8
    call __aim_write
    mov rax, 10
    push rax
    mov rdi, rsp
    mov rsi, 1
    call __aim_write
    pop rax
    ret
",
    },
    RuntimeRoutine {
        name: "__aim_str_from_bytes",
        source: r"
; __aim_str_from_bytes(ptr, len) -> str
__aim_str_from_bytes:
    push rdi
    push rsi
    lea rdi, [rsi + 8]
    call __aim_alloc
    pop rcx
    pop rsi
    mov qword ptr [rax], rcx
    lea rdi, [rax + 8]
    rep movsb
    ret
",
    },
    RuntimeRoutine {
        name: "__aim_int_to_str",
        source: r"
__aim_int_to_str:
    sub rsp, 32
    mov rax, rdi
    lea rsi, [rsp + 32]
    mov rcx, 10
    test rax, rax
    jns .digits
    neg rax                      ; unsigned division below handles i64::MIN
.digits:
    xor rdx, rdx
    div rcx
    add rdx, 48
    dec rsi
    mov byte ptr [rsi], dl
    test rax, rax
    jne .digits
    test rdi, rdi
    jns .emit
    dec rsi
    mov byte ptr [rsi], 45
.emit:
    lea rdx, [rsp + 32]
    sub rdx, rsi
    mov rdi, rsi
    mov rsi, rdx
    call __aim_str_from_bytes
    add rsp, 32
    ret
",
    },
    RuntimeRoutine {
        name: "__aim_float_to_str",
        source: r"
; Up to six decimals with trailing zeros trimmed; exponent form from 1e16.
__aim_float_to_str:
    sub rsp, 64
    movq xmm0, rdi
    ucomisd xmm0, xmm0
    jp .nan
    mov rax, rdi
    shl rax, 1
    shr rax, 1
    movabs rcx, 0x7ff0000000000000
    cmp rax, rcx
    je .inf
    movq xmm0, rax
    xor r11, r11
    movabs rcx, 0x4341c37937e08000   ; 1e16
    movq xmm1, rcx
    ucomisd xmm0, xmm1
    jb .fixed
    movabs rcx, 0x4024000000000000   ; 10.0
    movq xmm1, rcx
.scale:
    divsd xmm0, xmm1
    inc r11
    ucomisd xmm0, xmm1
    jae .scale
    jmp .scaled
.fixed:
    movabs rcx, 0x42a05ef39b200000   ; 9e12
    movq xmm1, rcx
    ucomisd xmm0, xmm1
    jb .scaled
    cvttsd2si r8, xmm0
    xor r9, r9
    mov r10, 1
    jmp .write
.scaled:
    movabs rcx, 0x412e848000000000   ; 1e6
    movq xmm1, rcx
    mulsd xmm0, xmm1
    cvtsd2si rax, xmm0
    mov rcx, 1000000
    xor rdx, rdx
    div rcx
    mov r8, rax
    mov r9, rdx
    mov r10, 6
.trim:
    cmp r10, 1
    je .write
    mov rax, r9
    xor rdx, rdx
    mov rcx, 10
    div rcx
    test rdx, rdx
    jne .write
    mov r9, rax
    dec r10
    jmp .trim
.write:
    lea rsi, [rsp + 64]
    mov rcx, 10
    test r11, r11
    je .fraction
    mov rax, r11
.exponent:
    xor rdx, rdx
    div rcx
    add rdx, 48
    dec rsi
    mov byte ptr [rsi], dl
    test rax, rax
    jne .exponent
    dec rsi
    mov byte ptr [rsi], 43
    dec rsi
    mov byte ptr [rsi], 101
    test r9, r9
    je .integer
.fraction:
    mov rax, r9
.fraction_digit:
    xor rdx, rdx
    div rcx
    add rdx, 48
    dec rsi
    mov byte ptr [rsi], dl
    dec r10
    jne .fraction_digit
    dec rsi
    mov byte ptr [rsi], 46
.integer:
    mov rax, r8
.integer_digit:
    xor rdx, rdx
    div rcx
    add rdx, 48
    dec rsi
    mov byte ptr [rsi], dl
    test rax, rax
    jne .integer_digit
    jmp .sign
.nan:
    lea rsi, [rsp + 61]
    mov byte ptr [rsi], 110
    mov byte ptr [rsi + 1], 97
    mov byte ptr [rsi + 2], 110
    jmp .emit
.inf:
    lea rsi, [rsp + 61]
    mov byte ptr [rsi], 105
    mov byte ptr [rsi + 1], 110
    mov byte ptr [rsi + 2], 102
.sign:
    test rdi, rdi
    jns .emit
    dec rsi
    mov byte ptr [rsi], 45
.emit:
    lea rdx, [rsp + 64]
    sub rdx, rsi
    mov rdi, rsi
    mov rsi, rdx
    call __aim_str_from_bytes
    add rsp, 64
    ret
",
    },
    RuntimeRoutine {
        name: "__aim_str_concat",
        source: r"
__aim_str_concat:
    push rdi
    push rsi
    mov rax, qword ptr [rdi]
    add rax, qword ptr [rsi]
    push rax
    lea rdi, [rax + 8]
    call __aim_alloc
    pop rcx
    mov qword ptr [rax], rcx
    pop rsi
    pop rdx
    lea rdi, [rax + 8]
    mov rcx, qword ptr [rdx]
    push rsi
    lea rsi, [rdx + 8]
    rep movsb
    pop rsi
    mov rcx, qword ptr [rsi]
    add rsi, 8
    rep movsb
    ret
",
    },
    RuntimeRoutine {
        name: "__aim_list_concat",
        source: r"
__aim_list_concat:
    push rdi
    push rsi
    mov rax, qword ptr [rdi]
    add rax, qword ptr [rsi]
    push rax
    mov rdi, rax
    shl rdi, 3
    add rdi, 8
    call __aim_alloc
    pop rcx
    mov qword ptr [rax], rcx
    pop rsi
    pop rdx
    lea rdi, [rax + 8]
    mov rcx, qword ptr [rdx]
    shl rcx, 3
    push rsi
    lea rsi, [rdx + 8]
    rep movsb
    pop rsi
    mov rcx, qword ptr [rsi]
    shl rcx, 3
    add rsi, 8
    rep movsb
    ret
",
    },
    RuntimeRoutine {
        name: "__aim_str_eq",
        source: r"
__aim_str_eq:
    mov rcx, qword ptr [rdi]
    cmp rcx, qword ptr [rsi]
    jne .differ
    add rdi, 8
    add rsi, 8
.next:
    test rcx, rcx
    je .same
    movzx rax, byte ptr [rdi]
    movzx rdx, byte ptr [rsi]
    cmp rax, rdx
    jne .differ
    inc rdi
    inc rsi
    dec rcx
    jmp .next
.same:
    mov rax, 1
    ret
.differ:
    xor rax, rax
    ret
",
    },
    RuntimeRoutine {
        name: "__aim_str_index",
        source: r"
; one-byte string at index rsi
__aim_str_index:
    push rdi
    call __aim_check_index
    pop rdi
    lea rdi, [rdi + rax + 8]
    mov rsi, 1
    jmp __aim_str_from_bytes
",
    },
    RuntimeRoutine {
        name: "__aim_check_index",
        source: r"
; __aim_check_index(seq, i) -> i, with negative i counted from the end
__aim_check_index:
    mov rax, rsi
    mov rcx, qword ptr [rdi]
    test rax, rax
    jns .check
    add rax, rcx
.check:
    cmp rax, rcx
    jae .fail
    ret
.fail:
    sub rsp, 16
    movabs rax, 0x7272457865646e49   ; IndexErr
    mov qword ptr [rsp], rax
    mov rax, 0x0a726f                ; or\n
    mov qword ptr [rsp + 8], rax
    mov rax, 1
    mov rdi, 2
    mov rsi, rsp
    mov rdx, 11
    syscall
    mov rax, 60
    mov rdi, 1
    syscall
",
    },
    RuntimeRoutine {
        name: "__aim_range",
        source: r"
; __aim_range(start, stop) -> list[int]
__aim_range:
    mov rcx, rsi
    sub rcx, rdi
    test rcx, rcx
    jg .sized
    xor rcx, rcx
.sized:
    push rdi
    push rcx
    mov rdi, rcx
    shl rdi, 3
    add rdi, 8
    call __aim_alloc
    pop rcx
    pop rdx
    mov qword ptr [rax], rcx
    xor rsi, rsi
.fill:
    cmp rsi, rcx
    jge .done
    mov qword ptr [rax + rsi*8 + 8], rdx
    inc rdx
    inc rsi
    jmp .fill
.done:
    ret
",
    },
    RuntimeRoutine {
        name: "__aim_pow_int",
        source: r"
; square and multiply; negative exponents give 0, overflow wraps
__aim_pow_int:
    mov rax, 1
    test rsi, rsi
    js .negative
.next:
    test rsi, rsi
    je .done
    mov rcx, rsi
    and rcx, 1
    je .square
    imul rax, rdi
.square:
    imul rdi, rdi
    shr rsi, 1
    jmp .next
.done:
    ret
.negative:
    xor rax, rax
    ret
",
    },
    RuntimeRoutine {
        name: "__aim_exit",
        source: r"
__aim_exit:
    mov rax, 60
    syscall
",
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::is_local_label;

    #[test]
    fn every_routine_assembles() {
        for routine in ROUTINES {
            let out = routine
                .assemble()
                .unwrap_or_else(|e| panic!("{}: {e}", routine.name));
            assert_eq!(out.labels.get(routine.name), Some(&0), "{}", routine.name);
            for reloc in &out.relocations {
                let known = find_routine(&reloc.symbol).is_some()
                    || RUNTIME_DATA.contains(&reloc.symbol.as_str());
                assert!(known, "{} references `{}`", routine.name, reloc.symbol);
                assert!(!is_local_label(&reloc.symbol));
            }
        }
    }

    #[test]
    fn routine_names_are_reserved() {
        for routine in ROUTINES {
            assert!(routine.name.starts_with(crate::typecheck::RESERVED_PREFIX));
        }
        assert!(find_routine("__aim_print_str").is_some());
        assert!(find_routine("print").is_none());
    }

    #[test]
    fn start_stub_calls_init_then_entry() {
        let stub = start_stub(Some("__aim_init"), "main");
        let calls: Vec<&str> = stub.iter().filter_map(MachInst::target).collect();
        assert_eq!(calls, ["__aim_init", "main"]);
        let out = assemble(&stub).expect("assemble");
        assert_eq!(out.relocations.len(), 2);
        assert_eq!(out.code.last(), Some(&0x05));
    }
}
