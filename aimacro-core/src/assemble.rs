//! Two-pass assembler with jump relaxation.
//!
//! Jumps to local labels start in their short (rel8) form. Offsets are
//! recomputed and any jump whose displacement no longer fits is widened
//! until nothing changes. Widening only grows code, so the loop ends.
//! References to names that are not labels of this unit become
//! relocations, resolved by the linker.

use std::collections::BTreeMap;

use crate::x86_64::{AsmError, MachInst, encode};

/// A PC-relative reference to a symbol outside the assembled unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    /// Offset of the 32-bit field in the unit's code.
    pub offset: usize,
    pub symbol: String,
    pub addend: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Assembled {
    pub code: Vec<u8>,
    pub relocations: Vec<Relocation>,
    pub labels: BTreeMap<String, usize>,
}

/// Labels starting with `.` are local and must be defined in the unit.
pub fn is_local_label(name: &str) -> bool {
    name.starts_with('.')
}

pub fn assemble(insts: &[MachInst]) -> Result<Assembled, AsmError> {
    let mut defined: BTreeMap<&str, usize> = BTreeMap::new();
    for (i, inst) in insts.iter().enumerate() {
        if let MachInst::Label(name) = inst {
            if defined.insert(name, i).is_some() {
                return Err(AsmError::DuplicateLabel(name.clone()));
            }
        }
    }
    for inst in insts {
        if let Some(target) = inst.target() {
            if is_local_label(target) && !defined.contains_key(target) {
                return Err(AsmError::UndefinedLabel(target.to_string()));
            }
        }
    }

    let mut short: Vec<bool> = insts
        .iter()
        .map(|inst| inst.is_relaxable() && inst.target().is_some_and(|t| defined.contains_key(t)))
        .collect();

    let mut passes = 0;
    let (offsets, labels) = loop {
        passes += 1;
        let mut offsets = Vec::with_capacity(insts.len());
        let mut lens = Vec::with_capacity(insts.len());
        let mut labels = BTreeMap::new();
        let mut at = 0usize;
        for (i, inst) in insts.iter().enumerate() {
            let len = encode(inst, short[i])?.bytes.len();
            if let MachInst::Label(name) = inst {
                labels.insert(name.clone(), at);
            }
            offsets.push(at);
            lens.push(len);
            at += len;
        }

        let mut changed = false;
        for (i, inst) in insts.iter().enumerate() {
            if !short[i] {
                continue;
            }
            let Some(target) = inst.target().and_then(|t| labels.get(t)) else {
                continue;
            };
            let rel = *target as i64 - (offsets[i] + lens[i]) as i64;
            if i8::try_from(rel).is_err() {
                short[i] = false;
                changed = true;
            }
        }
        if !changed {
            break (offsets, labels);
        }
    };
    log::trace!("assembled {} instructions in {passes} pass(es)", insts.len());

    let mut code = Vec::new();
    let mut relocations = Vec::new();
    for (i, inst) in insts.iter().enumerate() {
        let encoded = encode(inst, short[i])?;
        debug_assert_eq!(code.len(), offsets[i]);
        let start = code.len();
        code.extend_from_slice(&encoded.bytes);
        let Some(fixup) = encoded.fixup else {
            continue;
        };
        let field = start + fixup.at;
        match labels.get(&fixup.target) {
            Some(&target) => {
                let rel = target as i64 + fixup.addend - field as i64;
                match fixup.size {
                    1 => code[field] = rel as i8 as u8,
                    _ => code[field..field + 4].copy_from_slice(&(rel as i32).to_le_bytes()),
                }
            }
            None => relocations.push(Relocation {
                offset: field,
                symbol: fixup.target,
                addend: fixup.addend,
            }),
        }
    }

    Ok(Assembled {
        code,
        relocations,
        labels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x86_64::{Cond, Reg};

    #[test]
    fn short_jumps_stay_short() {
        let out = assemble(&[
            MachInst::Label(".top".into()),
            MachInst::Nop,
            MachInst::Jcc(Cond::Ne, ".top".into()),
        ])
        .expect("assemble");
        assert_eq!(out.code, [0x90, 0x75, 0xFD]);
    }

    #[test]
    fn far_jumps_are_widened() {
        let mut insts = vec![MachInst::Jmp(".end".into())];
        insts.extend(std::iter::repeat_n(MachInst::Nop, 200));
        insts.push(MachInst::Label(".end".into()));
        insts.push(MachInst::Ret);
        let out = assemble(&insts).expect("assemble");
        assert_eq!(out.code[0], 0xE9);
        assert_eq!(i32::from_le_bytes([out.code[1], out.code[2], out.code[3], out.code[4]]), 200);
        assert_eq!(out.labels[".end"], 205);
    }

    #[test]
    fn widening_one_jump_can_widen_another() {
        // `.a` is in rel8 range only while the jump to `.b` stays short.
        let mut insts = vec![MachInst::Jmp(".a".into()), MachInst::Jmp(".b".into())];
        insts.extend(std::iter::repeat_n(MachInst::Nop, 124));
        insts.push(MachInst::Label(".a".into()));
        insts.extend(std::iter::repeat_n(MachInst::Nop, 4));
        insts.push(MachInst::Label(".b".into()));
        let out = assemble(&insts).expect("assemble");
        let rel32 = |at: usize| i32::from_le_bytes([out.code[at], out.code[at + 1], out.code[at + 2], out.code[at + 3]]);
        assert_eq!(out.code[0], 0xE9);
        assert_eq!(out.code[5], 0xE9);
        assert_eq!(out.labels[".a"], 134);
        assert_eq!(out.labels[".b"], 138);
        assert_eq!(rel32(1), 129);
        assert_eq!(rel32(6), 128);
    }

    #[test]
    fn external_symbols_become_relocations() {
        let out = assemble(&[MachInst::Call("__aim_alloc".into()), MachInst::Ret]).expect("assemble");
        assert_eq!(
            out.relocations,
            vec![Relocation {
                offset: 1,
                symbol: "__aim_alloc".into(),
                addend: -4
            }]
        );
    }

    #[test]
    fn label_errors() {
        let dup = assemble(&[MachInst::Label(".x".into()), MachInst::Label(".x".into())]);
        assert_eq!(dup, Err(AsmError::DuplicateLabel(".x".into())));
        let missing = assemble(&[MachInst::Jmp(".nowhere".into())]);
        assert_eq!(missing, Err(AsmError::UndefinedLabel(".nowhere".into())));
        assert!(assemble(&[MachInst::MovRI(Reg::Rax, 1)]).is_ok());
    }
}
