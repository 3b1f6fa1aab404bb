/// Peephole optimizer: fuses, folds, and compacts bytecode while preserving
/// jump correctness (spec §4.2).
///
/// Grounded on `axm/src/optimizer.rs`'s pipeline shape (`OptConfig`,
/// `optimize`, `compact_nops`'s old-index→new-index remap) but the passes
/// themselves are the exact seven `spec.md` names, operating on the
/// operand-rich `InstructionLine`/`Value` model rather than packed 32-bit
/// instructions.

use std::collections::HashMap;

use crate::instruction::{Addr, InstructionLine, Op};
use crate::symbol::SymbolTable;
use crate::value::Value;

#[derive(Debug, Clone)]
pub struct OptConfig {
    pub fuse_goto_conditionals: bool,
    pub remove_const_temp_registers: bool,
    pub fuse_compound_assignments: bool,
    pub fuse_simple_assignments: bool,
    pub fuse_push_params: bool,
    pub convert_increments_decrements: bool,
    pub fuse_comparison_branches: bool,
}

impl Default for OptConfig {
    fn default() -> Self {
        OptConfig {
            fuse_goto_conditionals: true,
            remove_const_temp_registers: true,
            fuse_compound_assignments: true,
            fuse_simple_assignments: true,
            fuse_push_params: true,
            convert_increments_decrements: true,
            fuse_comparison_branches: true,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct OptStats {
    pub instructions_before: usize,
    pub instructions_after: usize,
    pub constants_folded: usize,
    pub instructions_fused: usize,
}

/// Re-scan `[start_index, code.len())` after a parser-emitted chunk and
/// run the fixed-order pass pipeline, then a single bottom-up compaction
/// over the whole program (spec §4.2: "OptimizeChunk... rescans only
/// [start_index, end)"; compaction must still see every address in the
/// program, since a removal can shift addresses the earlier chunk refers
/// to via forward jumps).
pub fn optimize_chunk(
    code: &mut Vec<InstructionLine>,
    symbols: &mut SymbolTable,
    start_index: Addr,
    cfg: &OptConfig,
) -> OptStats {
    let mut stats = OptStats {
        instructions_before: code.len(),
        ..Default::default()
    };

    if cfg.fuse_goto_conditionals {
        stats.instructions_fused += fuse_goto_conditionals(code, start_index);
    }
    if cfg.remove_const_temp_registers {
        stats.constants_folded += remove_const_temp_registers(code, start_index);
    }
    if cfg.fuse_compound_assignments {
        stats.instructions_fused += fuse_compound_assignments(code, start_index);
    }
    if cfg.fuse_simple_assignments {
        stats.instructions_fused += fuse_simple_assignments(code, start_index);
    }
    if cfg.fuse_push_params {
        stats.instructions_fused += fuse_push_params(code, start_index);
    }
    if cfg.convert_increments_decrements {
        convert_increments_decrements(code, start_index);
    }
    if cfg.fuse_comparison_branches {
        stats.instructions_fused += fuse_comparison_branches(code, start_index);
    }

    compact_and_realign(code, symbols);
    stats.instructions_after = code.len();
    stats
}

// ---------------------------------------------------------------------------
// Pass 1 — FuseGotoConditionals
// ---------------------------------------------------------------------------

/// `Eq/NotEq TempN, a, b` + `GotoIfTrue/False target, TempN` →
/// `BranchIfEqual/NotEqual target, a, b`; the comparison becomes `Skip`.
fn fuse_goto_conditionals(code: &mut [InstructionLine], start: Addr) -> usize {
    let mut fused = 0;
    let mut i = start;
    while i + 1 < code.len() {
        let (cmp_temp_id, branch_op, a, b) = {
            let cmp = &code[i];
            let branch = &code[i + 1];
            let is_cmp = matches!(cmp.op, Op::Equal | Op::NotEqual);
            let is_branch = matches!(branch.op, Op::GotoIfTrue | Op::GotoIfFalse);
            if !is_cmp || !is_branch {
                i += 1;
                continue;
            }
            let Some(Value::Temp { id, .. }) = cmp.lhs.clone() else {
                i += 1;
                continue;
            };
            let Some(Value::Temp { id: cond_id, .. }) = branch.rhs.clone() else {
                i += 1;
                continue;
            };
            if id != cond_id {
                i += 1;
                continue;
            }
            (id, branch.op, cmp.rhs.clone(), cmp.rhs2.clone())
        };
        let _ = cmp_temp_id;
        let target = code[i + 1].jump_target();
        let Some(target) = target else {
            i += 1;
            continue;
        };
        let cmp_op = code[i].op;
        let fused_op = match (cmp_op, branch_op) {
            (Op::Equal, Op::GotoIfTrue) | (Op::NotEqual, Op::GotoIfFalse) => Op::BranchIfEqual,
            (Op::NotEqual, Op::GotoIfTrue) | (Op::Equal, Op::GotoIfFalse) => Op::BranchIfNotEqual,
            _ => unreachable!(),
        };
        let mut new_instr = InstructionLine::new(fused_op);
        new_instr.set_jump_target(target);
        new_instr.rhs = a;
        new_instr.rhs2 = b;
        new_instr.debug = code[i].debug.clone();
        code[i] = new_instr;
        code[i + 1] = InstructionLine::skip();
        fused += 1;
        i += 2;
    }
    fused
}

// ---------------------------------------------------------------------------
// Pass 2 — RemoveConstTempRegisters
// ---------------------------------------------------------------------------

/// Fold single-assign temps that hold a literal constant into every use
/// site, then remove the defining instruction (spec §4.2 pass 2 / §8
/// "Constant folding safety").
fn remove_const_temp_registers(code: &mut [InstructionLine], start: Addr) -> usize {
    let mut assign_count: HashMap<u32, u32> = HashMap::new();
    let mut defining_index: HashMap<u32, usize> = HashMap::new();
    let mut constant_for: HashMap<u32, Value> = HashMap::new();

    for i in start..code.len() {
        if code[i].op == Op::Assign {
            if let Some(Value::Temp { id, .. }) = &code[i].lhs {
                *assign_count.entry(*id).or_insert(0) += 1;
                defining_index.insert(*id, i);
                if let Some(rhs) = &code[i].rhs {
                    if rhs.is_foldable_constant() {
                        constant_for.insert(*id, rhs.clone());
                    }
                }
            }
        }
    }

    let foldable: Vec<(u32, usize, Value)> = assign_count
        .iter()
        .filter(|(_, count)| **count == 1)
        .filter_map(|(id, _)| {
            let constant = constant_for.get(id)?.clone();
            let idx = *defining_index.get(id)?;
            Some((*id, idx, constant))
        })
        .collect();

    if foldable.is_empty() {
        return 0;
    }

    let subst: HashMap<u32, Value> = foldable.iter().map(|(id, _, v)| (*id, v.clone())).collect();
    let defs: std::collections::HashSet<usize> = foldable.iter().map(|(_, idx, _)| *idx).collect();

    fn substitute(slot: &mut Option<Value>, subst: &HashMap<u32, Value>) {
        if let Some(Value::Temp { id, .. }) = slot {
            if let Some(c) = subst.get(id) {
                *slot = Some(c.clone());
            }
        }
    }

    for i in start..code.len() {
        if defs.contains(&i) {
            continue;
        }
        substitute(&mut code[i].rhs, &subst);
        substitute(&mut code[i].rhs2, &subst);
        substitute(&mut code[i].rhs3, &subst);
    }

    for idx in &defs {
        code[*idx] = InstructionLine::skip();
    }

    defs.len()
}

// ---------------------------------------------------------------------------
// Pass 3 — FuseCompoundAssignments
// ---------------------------------------------------------------------------

fn arith_to_assign_op(op: Op) -> Option<Op> {
    match op {
        Op::Add => Some(Op::AddAssign),
        Op::Sub => Some(Op::SubAssign),
        Op::Mul => Some(Op::MulAssign),
        Op::Div => Some(Op::DivAssign),
        Op::Mod => Some(Op::ModAssign),
        _ => None,
    }
}

/// `Add TempN, T_{N-1}, v` + `Assign Var, TempN` → `AddAssign Var, T_{N-1}, v`.
fn fuse_compound_assignments(code: &mut [InstructionLine], start: Addr) -> usize {
    let mut fused = 0;
    let mut i = start;
    while i + 1 < code.len() {
        let Some(assign_op) = arith_to_assign_op(code[i].op) else {
            i += 1;
            continue;
        };
        let Some(Value::Temp { id: def_id, .. }) = code[i].lhs.clone() else {
            i += 1;
            continue;
        };
        let next = &code[i + 1];
        if next.op != Op::Assign {
            i += 1;
            continue;
        }
        let Some(Value::Temp { id: use_id, .. }) = next.rhs.clone() else {
            i += 1;
            continue;
        };
        if def_id != use_id {
            i += 1;
            continue;
        }
        let dest_var = next.lhs.clone();
        let a = code[i].rhs.clone();
        let b = code[i].rhs2.clone();
        let mut fused_instr = InstructionLine::new(assign_op);
        fused_instr.lhs = dest_var;
        fused_instr.rhs = a;
        fused_instr.rhs2 = b;
        fused_instr.debug = code[i].debug.clone();
        code[i] = fused_instr;
        code[i + 1] = InstructionLine::skip();
        fused += 1;
        i += 2;
    }
    fused
}

// ---------------------------------------------------------------------------
// Pass 4 — FuseSimpleAssignments
// ---------------------------------------------------------------------------

fn destinations_independent(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Temp { id: x, .. }, Value::Temp { id: y, .. }) => x != y,
        (Value::Variable { register_index: x, is_global: gx, .. }, Value::Variable { register_index: y, is_global: gy, .. }) => {
            x != y || gx != gy
        }
        _ => true,
    }
}

/// Two consecutive `Assign` with independent destinations fuse into
/// `AssignTwo dst1, src1, dst2, src2` — an optimizer-only instruction
/// (spec §4.1).
fn fuse_simple_assignments(code: &mut [InstructionLine], start: Addr) -> usize {
    let mut fused = 0;
    let mut i = start;
    while i + 1 < code.len() {
        if code[i].op != Op::Assign || code[i + 1].op != Op::Assign {
            i += 1;
            continue;
        }
        let (Some(dst1), Some(dst2)) = (code[i].lhs.clone(), code[i + 1].lhs.clone()) else {
            i += 1;
            continue;
        };
        if !destinations_independent(&dst1, &dst2) {
            i += 1;
            continue;
        }
        let src1 = code[i].rhs.clone();
        let src2 = code[i + 1].rhs.clone();
        let mut instr = InstructionLine::new(Op::AssignTwo);
        instr.lhs = Some(dst1);
        instr.rhs = src1;
        instr.rhs2 = Some(dst2);
        instr.rhs3 = src2;
        instr.debug = code[i].debug.clone();
        code[i] = instr;
        code[i + 1] = InstructionLine::skip();
        fused += 1;
        i += 2;
    }
    fused
}

// ---------------------------------------------------------------------------
// Pass 5 — FusePushParams
// ---------------------------------------------------------------------------

/// Runs of 2/3/4 consecutive `PushParam` collapse into a single packed
/// instruction (spec §4.2 pass 5).
fn fuse_push_params(code: &mut [InstructionLine], start: Addr) -> usize {
    let mut fused = 0;
    let mut i = start;
    while i < code.len() {
        if code[i].op != Op::PushParam {
            i += 1;
            continue;
        }
        let mut run_end = i;
        while run_end + 1 < code.len() && code[run_end + 1].op == Op::PushParam && run_end - i < 3 {
            run_end += 1;
        }
        let run_len = run_end - i + 1;
        if run_len < 2 {
            i += 1;
            continue;
        }
        let (op, slots) = match run_len {
            2 => (Op::PushTwoParams, 2),
            3 => (Op::PushThreeParams, 3),
            _ => (Op::PushFourParams, 4),
        };
        let mut values: Vec<Option<Value>> = (i..=run_end).map(|k| code[k].lhs.clone()).collect();
        while values.len() < 4 {
            values.push(None);
        }
        let mut instr = InstructionLine::new(op);
        instr.lhs = values[0].take();
        instr.rhs = values[1].take();
        instr.rhs2 = values[2].take();
        instr.rhs3 = values[3].take();
        instr.debug = code[i].debug.clone();
        code[i] = instr;
        for k in (i + 1)..=run_end {
            code[k] = InstructionLine::skip();
        }
        fused += 1;
        let _ = slots;
        i = run_end + 1;
    }
    fused
}

// ---------------------------------------------------------------------------
// Pass 6 — ConvertToIncrementsDecrements
// ---------------------------------------------------------------------------

/// `Add Var, Var, 1` → `Increment Var`; `Sub Var, Var, 1` → `Decrement
/// Var`. Resolved in place, no renumbering needed. Both directions are
/// handled per spec §9's open-question resolution, requiring `Lhs == Rhs`.
fn convert_increments_decrements(code: &mut [InstructionLine], start: Addr) {
    for i in start..code.len() {
        let (op, lhs, rhs, rhs2) = {
            let instr = &code[i];
            (instr.op, instr.lhs.clone(), instr.rhs.clone(), instr.rhs2.clone())
        };
        let new_op = match op {
            Op::Add => Op::Increment,
            Op::Sub => Op::Decrement,
            _ => continue,
        };
        let (Some(lhs), Some(rhs), Some(Value::Number(n))) = (lhs, rhs, rhs2) else {
            continue;
        };
        if lhs != rhs || n != 1.0 {
            continue;
        }
        let debug = code[i].debug.clone();
        let mut instr = InstructionLine::new(new_op);
        instr.lhs = Some(lhs);
        instr.debug = debug;
        code[i] = instr;
    }
}

// ---------------------------------------------------------------------------
// Pass 7 — FuseComparisonBranches
// ---------------------------------------------------------------------------

/// Maps every (comparison, branch-on-true/false) pair to its fused branch
/// opcode, including the swapped variants (spec §4.2 pass 7: "GreaterThan
/// + GotoIfFalse → BranchIfLessOrEqual").
fn comparison_branch_table(cmp: Op, branch_true: bool) -> Option<Op> {
    use Op::*;
    Some(match (cmp, branch_true) {
        (LessThan, true) => BranchIfLessThan,
        (LessThan, false) => BranchIfGreaterOrEqual,
        (GreaterThan, true) => BranchIfGreaterThan,
        (GreaterThan, false) => BranchIfLessOrEqual,
        (LessEqual, true) => BranchIfLessOrEqual,
        (LessEqual, false) => BranchIfGreaterThan,
        (GreaterEqual, true) => BranchIfGreaterOrEqual,
        (GreaterEqual, false) => BranchIfLessThan,
        (Equal, true) => BranchIfEqual,
        (Equal, false) => BranchIfNotEqual,
        (NotEqual, true) => BranchIfNotEqual,
        (NotEqual, false) => BranchIfEqual,
        _ => return None,
    })
}

fn fuse_comparison_branches(code: &mut [InstructionLine], start: Addr) -> usize {
    let mut fused = 0;
    let mut i = start;
    while i + 1 < code.len() {
        let cmp_op = code[i].op;
        let is_comparison = matches!(
            cmp_op,
            Op::LessThan | Op::GreaterThan | Op::LessEqual | Op::GreaterEqual | Op::Equal | Op::NotEqual
        );
        if !is_comparison {
            i += 1;
            continue;
        }
        let branch = &code[i + 1];
        let branch_true = match branch.op {
            Op::GotoIfTrue => true,
            Op::GotoIfFalse => false,
            _ => {
                i += 1;
                continue;
            }
        };
        let Some(Value::Temp { id: def_id, .. }) = code[i].lhs.clone() else {
            i += 1;
            continue;
        };
        let Some(Value::Temp { id: cond_id, .. }) = code[i + 1].rhs.clone() else {
            i += 1;
            continue;
        };
        if def_id != cond_id {
            i += 1;
            continue;
        }
        let Some(target) = code[i + 1].jump_target() else {
            i += 1;
            continue;
        };
        let Some(fused_op) = comparison_branch_table(cmp_op, branch_true) else {
            i += 1;
            continue;
        };
        let a = code[i].rhs.clone();
        let b = code[i].rhs2.clone();
        let mut instr = InstructionLine::new(fused_op);
        instr.set_jump_target(target);
        instr.rhs = a;
        instr.rhs2 = b;
        instr.debug = code[i].debug.clone();
        code[i] = instr;
        code[i + 1] = InstructionLine::skip();
        fused += 1;
        i += 2;
    }
    fused
}

// ---------------------------------------------------------------------------
// Compaction & address realignment
// ---------------------------------------------------------------------------

/// Remove every `Skip` instruction, then patch every absolute address in
/// the program to account for the shift. Bottom-up by construction: the
/// `old_to_new` table is built once over the whole list, so every
/// dependent field is remapped through the same function regardless of
/// traversal order (spec §4.2, §9 "Address-patching fanout").
pub fn compact_and_realign(code: &mut Vec<InstructionLine>, symbols: &mut SymbolTable) {
    let len = code.len();
    let mut old_to_new = vec![0usize; len + 1];
    let mut next = 0usize;
    for (i, instr) in code.iter().enumerate() {
        old_to_new[i] = next;
        if !instr.is_skip() {
            next += 1;
        }
    }
    old_to_new[len] = next;

    if next == len {
        return; // nothing removed, no patching needed
    }

    let map_addr = |old: Addr| -> Addr {
        let clamped = old.min(len);
        old_to_new[clamped]
    };

    fn patch_value(v: &mut Value, map_addr: &dyn Fn(Addr) -> Addr) {
        match v {
            Value::TryCatch { catch_address, end_address } => {
                *catch_address = map_addr(*catch_address);
                *end_address = map_addr(*end_address);
            }
            Value::Function(f) | Value::Lambda(f) => {
                let f = std::rc::Rc::make_mut(f);
                f.start_address = map_addr(f.start_address);
                f.end_address = map_addr(f.end_address);
            }
            Value::Range { start, end } => {
                patch_value(start, map_addr);
                patch_value(end, map_addr);
            }
            Value::ElementAccess { target, index } => {
                patch_value(target, map_addr);
                patch_value(index, map_addr);
            }
            Value::PropertyAccess { target, .. } => patch_value(target, map_addr),
            _ => {}
        }
    }

    let mut new_code = Vec::with_capacity(next);
    for instr in code.drain(..) {
        if instr.is_skip() {
            continue;
        }
        let mut instr = instr;
        if let Some(target) = instr.jump_target() {
            instr.set_jump_target(map_addr(target));
        }
        for slot in [&mut instr.lhs, &mut instr.rhs, &mut instr.rhs2, &mut instr.rhs3] {
            if let Some(v) = slot {
                patch_value(v, &map_addr);
            }
        }
        new_code.push(instr);
    }
    *code = new_code;

    symbols.for_each_address_mut(|addr| {
        *addr = map_addr(*addr);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::DebugInfo;

    fn temp(id: u32, reg: u32) -> Value {
        Value::Temp { id, register_index: reg }
    }

    fn var(name: &str, reg: u32) -> Value {
        Value::Variable { name: name.to_string(), register_index: reg, is_global: false, solid: false }
    }

    #[test]
    fn goto_conditionals_fuse_into_branch() {
        let mut code = vec![
            InstructionLine::new(Op::Equal).with_lhs(temp(0, 0)).with_rhs(var("a", 1)).with_rhs2(Value::Number(1.0)),
            {
                let mut i = InstructionLine::new(Op::GotoIfTrue);
                i.set_jump_target(10);
                i.rhs = Some(temp(0, 0));
                i
            },
        ];
        let fused = fuse_goto_conditionals(&mut code, 0);
        assert_eq!(fused, 1);
        assert_eq!(code[0].op, Op::BranchIfEqual);
        assert!(code[1].is_skip());
        assert_eq!(code[0].jump_target(), Some(10));
    }

    #[test]
    fn const_temp_is_propagated_and_removed() {
        let mut code = vec![
            InstructionLine::new(Op::Assign).with_lhs(temp(0, 0)).with_rhs(Value::Number(42.0)),
            InstructionLine::new(Op::Add).with_lhs(var("x", 1)).with_rhs(var("x", 1)).with_rhs2(temp(0, 0)),
        ];
        let folded = remove_const_temp_registers(&mut code, 0);
        assert_eq!(folded, 1);
        assert!(code[0].is_skip());
        assert_eq!(code[1].rhs2, Some(Value::Number(42.0)));
    }

    #[test]
    fn multi_assigned_temp_is_not_folded() {
        let mut code = vec![
            InstructionLine::new(Op::Assign).with_lhs(temp(0, 0)).with_rhs(Value::Number(1.0)),
            InstructionLine::new(Op::Assign).with_lhs(temp(0, 0)).with_rhs(Value::Number(2.0)),
            InstructionLine::new(Op::Add).with_lhs(var("x", 1)).with_rhs(var("x", 1)).with_rhs2(temp(0, 0)),
        ];
        let folded = remove_const_temp_registers(&mut code, 0);
        assert_eq!(folded, 0);
    }

    #[test]
    fn compound_assignment_fuses() {
        let mut code = vec![
            InstructionLine::new(Op::Add).with_lhs(temp(0, 0)).with_rhs(var("x", 1)).with_rhs2(Value::Number(1.0)),
            InstructionLine::new(Op::Assign).with_lhs(var("x", 1)).with_rhs(temp(0, 0)),
        ];
        let fused = fuse_compound_assignments(&mut code, 0);
        assert_eq!(fused, 1);
        assert_eq!(code[0].op, Op::AddAssign);
        assert!(code[1].is_skip());
    }

    #[test]
    fn increment_rewrite_requires_matching_lhs_rhs() {
        let mut code = vec![InstructionLine::new(Op::Add).with_lhs(var("x", 1)).with_rhs(var("x", 1)).with_rhs2(Value::Number(1.0))];
        convert_increments_decrements(&mut code, 0);
        assert_eq!(code[0].op, Op::Increment);

        let mut code2 = vec![InstructionLine::new(Op::Add).with_lhs(var("x", 1)).with_rhs(var("y", 2)).with_rhs2(Value::Number(1.0))];
        convert_increments_decrements(&mut code2, 0);
        assert_eq!(code2[0].op, Op::Add, "different lhs/rhs must not be rewritten");
    }

    #[test]
    fn push_params_batch_into_packed_instruction() {
        let mut code = vec![
            InstructionLine::new(Op::PushParam).with_lhs(Value::Number(1.0)),
            InstructionLine::new(Op::PushParam).with_lhs(Value::Number(2.0)),
            InstructionLine::new(Op::PushParam).with_lhs(Value::Number(3.0)),
        ];
        let fused = fuse_push_params(&mut code, 0);
        assert_eq!(fused, 1);
        assert_eq!(code[0].op, Op::PushThreeParams);
        assert!(code[1].is_skip() && code[2].is_skip());
    }

    #[test]
    fn compaction_shifts_jump_targets_past_removed_instructions() {
        let mut symbols = SymbolTable::new();
        let mut code = vec![
            InstructionLine::skip(),
            {
                let mut i = InstructionLine::new(Op::Goto);
                i.set_jump_target(2);
                i
            },
            InstructionLine::new(Op::Terminate),
        ];
        compact_and_realign(&mut code, &mut symbols);
        assert_eq!(code.len(), 2);
        assert_eq!(code[0].jump_target(), Some(1));
        let _ = DebugInfo::default();
    }
}
