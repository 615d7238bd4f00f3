//! Linear-scan register allocation.
//!
//! Every IR variable gets one live interval covering all positions where
//! it may be live (holes are not tracked). Intervals are scanned in start
//! order; when no register is free the interval ending last is spilled to
//! a stack slot. Only callee-saved registers are handed out, so values
//! survive calls without extra saves.

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::{Instr, IrFunction, Operand, Place, Placeholder, raw_placeholders};
use crate::x86_64::Reg;

/// Registers available to the allocator, in preference order.
pub const ALLOCATABLE: [Reg; 5] = [Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Reg(Reg),
    /// Index of an 8-byte spill slot in the frame.
    Stack(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub var: String,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Allocation {
    pub locations: BTreeMap<String, Location>,
    /// Allocatable registers actually used, in [`ALLOCATABLE`] order.
    pub callee_saved: Vec<Reg>,
    pub spill_slots: u32,
}

impl Allocation {
    pub fn location(&self, var: &str) -> Option<Location> {
        self.locations.get(var).copied()
    }
}

fn operand_var(op: &Operand) -> Option<&str> {
    match op {
        Operand::Var(name) => Some(name),
        _ => None,
    }
}

/// Variables read by an instruction, including raw placeholders.
fn instr_uses(instr: &Instr) -> Vec<String> {
    let mut out: Vec<String> = instr
        .uses()
        .into_iter()
        .filter_map(operand_var)
        .map(str::to_string)
        .collect();
    if let Instr::RawEmit { text, .. } = instr {
        for p in raw_placeholders(text) {
            if let Placeholder::Var(name) = p {
                out.push(name);
            }
        }
    }
    out
}

/// Variables written by an instruction. Raw placeholders may be written
/// by the assembly, so they count as definitions too.
fn instr_defs(instr: &Instr) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(Place::Var(name)) = instr.def() {
        out.push(name.clone());
    }
    if let Instr::RawEmit { text, .. } = instr {
        for p in raw_placeholders(text) {
            if let Placeholder::Var(name) = p {
                out.push(name);
            }
        }
    }
    out
}

struct Block {
    start: usize,
    end: usize,
    succs: Vec<usize>,
}

fn basic_blocks(body: &[Instr]) -> Vec<Block> {
    let mut starts = BTreeSet::new();
    starts.insert(0);
    for (i, instr) in body.iter().enumerate() {
        if matches!(instr, Instr::Label(_)) {
            starts.insert(i);
        }
        if instr.is_terminator() {
            starts.insert(i + 1);
        }
    }
    let starts: Vec<usize> = starts.into_iter().filter(|&s| s < body.len()).collect();

    let label_block: BTreeMap<&str, usize> = starts
        .iter()
        .enumerate()
        .filter_map(|(b, &s)| match &body[s] {
            Instr::Label(name) => Some((name.as_str(), b)),
            _ => None,
        })
        .collect();

    let mut blocks = Vec::with_capacity(starts.len());
    for (b, &start) in starts.iter().enumerate() {
        let end = starts.get(b + 1).copied().unwrap_or(body.len());
        let last = &body[end - 1];
        let mut succs: Vec<usize> = last
            .targets()
            .into_iter()
            .filter_map(|t| label_block.get(t).copied())
            .collect();
        if !last.is_terminator() && b + 1 < starts.len() {
            succs.push(b + 1);
        }
        blocks.push(Block { start, end, succs });
    }
    blocks
}

/// Live intervals over positions: parameters are defined at 0 and
/// instruction `i` sits at position `i + 1`.
pub fn live_intervals(func: &IrFunction) -> Vec<Interval> {
    let body = &func.body;
    let blocks = basic_blocks(body);

    let mut gen_sets: Vec<BTreeSet<String>> = Vec::with_capacity(blocks.len());
    let mut kill_sets: Vec<BTreeSet<String>> = Vec::with_capacity(blocks.len());
    for block in &blocks {
        let mut gen_set = BTreeSet::new();
        let mut kill = BTreeSet::new();
        for instr in &body[block.start..block.end] {
            for u in instr_uses(instr) {
                if !kill.contains(&u) {
                    gen_set.insert(u);
                }
            }
            kill.extend(instr_defs(instr));
        }
        gen_sets.push(gen_set);
        kill_sets.push(kill);
    }

    let mut live_in: Vec<BTreeSet<String>> = vec![BTreeSet::new(); blocks.len()];
    let mut live_out: Vec<BTreeSet<String>> = vec![BTreeSet::new(); blocks.len()];
    let mut changed = true;
    while changed {
        changed = false;
        for b in (0..blocks.len()).rev() {
            let mut out = BTreeSet::new();
            for &s in &blocks[b].succs {
                out.extend(live_in[s].iter().cloned());
            }
            let mut inn: BTreeSet<String> = out.difference(&kill_sets[b]).cloned().collect();
            inn.extend(gen_sets[b].iter().cloned());
            if inn != live_in[b] || out != live_out[b] {
                live_in[b] = inn;
                live_out[b] = out;
                changed = true;
            }
        }
    }

    let mut ranges: BTreeMap<String, (usize, usize)> = BTreeMap::new();
    let mut touch = |var: &str, pos: usize| {
        let entry = ranges.entry(var.to_string()).or_insert((pos, pos));
        entry.0 = entry.0.min(pos);
        entry.1 = entry.1.max(pos);
    };
    for (name, _) in &func.params {
        touch(name, 0);
    }
    for (b, block) in blocks.iter().enumerate() {
        for var in &live_in[b] {
            touch(var, block.start + 1);
        }
        for var in &live_out[b] {
            touch(var, block.end);
        }
        for (i, instr) in body[block.start..block.end].iter().enumerate() {
            let pos = block.start + i + 1;
            for var in instr_uses(instr).iter().chain(instr_defs(instr).iter()) {
                touch(var, pos);
            }
        }
    }

    let mut intervals: Vec<Interval> = ranges
        .into_iter()
        .map(|(var, (start, end))| Interval { var, start, end })
        .collect();
    intervals.sort_by(|a, b| (a.start, a.end, &a.var).cmp(&(b.start, b.end, &b.var)));
    intervals
}

pub fn allocate(func: &IrFunction) -> Allocation {
    allocate_with(func, &ALLOCATABLE)
}

/// Linear scan over `regs`. Deterministic for a given function.
pub fn allocate_with(func: &IrFunction, regs: &[Reg]) -> Allocation {
    let intervals = live_intervals(func);
    let mut locations = BTreeMap::new();
    let mut free: Vec<Reg> = regs.to_vec();
    // (end, var, reg)
    let mut active: Vec<(usize, String, Reg)> = Vec::new();
    let mut spill_slots = 0u32;
    let mut used = BTreeSet::new();

    for interval in &intervals {
        active.retain(|(end, _, reg)| {
            if *end < interval.start {
                free.push(*reg);
                false
            } else {
                true
            }
        });
        free.sort_by_key(|r| regs.iter().position(|x| x == r));

        if !free.is_empty() {
            let reg = free.remove(0);
            used.insert(reg);
            locations.insert(interval.var.clone(), Location::Reg(reg));
            active.push((interval.end, interval.var.clone(), reg));
            continue;
        }

        let victim = active
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| (a.0, &a.1).cmp(&(b.0, &b.1)))
            .map(|(i, _)| i);
        match victim {
            Some(i) if active[i].0 > interval.end => {
                let (_, var, reg) = active.remove(i);
                locations.insert(var, Location::Stack(spill_slots));
                spill_slots += 1;
                locations.insert(interval.var.clone(), Location::Reg(reg));
                active.push((interval.end, interval.var.clone(), reg));
            }
            _ => {
                locations.insert(interval.var.clone(), Location::Stack(spill_slots));
                spill_slots += 1;
            }
        }
    }

    if spill_slots > 0 {
        log::debug!("@{}: {spill_slots} value(s) spilled", func.name);
    }
    Allocation {
        locations,
        callee_saved: regs.iter().copied().filter(|r| used.contains(r)).collect(),
        spill_slots,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir_text::parse_module;

    fn function(text: &str) -> IrFunction {
        let module = parse_module(&format!("entry @f\n{text}")).expect("parse");
        module.functions.into_iter().next().expect("function")
    }

    #[test]
    fn straight_line_code_uses_registers() {
        let f = function(
            "func @f(%a: i64) -> i64 {\n  var %b: i64\n  %b = add.i64 %a, 1\n  ret %b\n}",
        );
        let alloc = allocate(&f);
        assert_eq!(alloc.spill_slots, 0);
        assert!(matches!(alloc.location("a"), Some(Location::Reg(_))));
        assert!(matches!(alloc.location("b"), Some(Location::Reg(_))));
        assert_eq!(alloc.callee_saved, vec![Reg::Rbx, Reg::R12]);
    }

    #[test]
    fn registers_are_reused_after_an_interval_ends() {
        let f = function(
            "func @f() -> i64 {\n  var %a: i64\n  var %b: i64\n  %a = mov.i64 1\n  call @g(%a)\n  %b = mov.i64 2\n  ret %b\n}",
        );
        let alloc = allocate(&f);
        assert_eq!(alloc.location("a"), Some(Location::Reg(Reg::Rbx)));
        assert_eq!(alloc.location("b"), Some(Location::Reg(Reg::Rbx)));
    }

    #[test]
    fn pressure_spills_the_furthest_interval() {
        let mut text = String::from("func @f() -> i64 {\n");
        for i in 0..7 {
            text.push_str(&format!("  var %v{i}: i64\n"));
        }
        text.push_str("  var %s: i64\n");
        for i in 0..7 {
            text.push_str(&format!("  %v{i} = mov.i64 {i}\n"));
        }
        text.push_str("  %s = mov.i64 0\n");
        // v0 is used last, so it lives longest.
        for i in (0..7).rev() {
            text.push_str(&format!("  %s = add.i64 %s, %v{i}\n"));
        }
        text.push_str("  ret %s\n}");
        let alloc = allocate(&function(&text));
        let spilled: Vec<&String> = alloc
            .locations
            .iter()
            .filter(|(_, loc)| matches!(loc, Location::Stack(_)))
            .map(|(var, _)| var)
            .collect();
        assert_eq!(alloc.spill_slots as usize, spilled.len());
        assert!(spilled.len() >= 3, "{spilled:?}");
        assert!(spilled.iter().any(|v| v.as_str() == "v0"));
        assert_eq!(alloc.callee_saved.len(), 5);
    }

    #[test]
    fn values_live_across_a_loop_cover_the_whole_loop() {
        let f = function(
            "func @f(%n: i64) -> i64 {\n  var %i: i64\n  var %c: bool\n  %i = mov.i64 0\nL0:\n  %c = lt.i64 %i, %n\n  br %c, L1, L2\nL1:\n  %i = add.i64 %i, 1\n  jmp L0\nL2:\n  ret %i\n}",
        );
        let intervals = live_intervals(&f);
        let n = intervals.iter().find(|iv| iv.var == "n").expect("n");
        let jump_pos = f.body.iter().position(|i| matches!(i, Instr::Jump(_))).expect("jmp") + 1;
        assert_eq!(n.start, 0);
        assert!(n.end >= jump_pos, "{n:?}");
    }

    #[test]
    fn raw_placeholders_count_as_uses() {
        let f = function(
            "func @f() -> i64 {\n  var %x: i64\n  %x = mov.i64 5\n  asm \"add {%x}, 1\"\n  ret 0\n}",
        );
        let intervals = live_intervals(&f);
        let x = intervals.iter().find(|iv| iv.var == "x").expect("x");
        assert_eq!((x.start, x.end), (1, 2));
    }
}
