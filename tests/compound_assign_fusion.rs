//! Spec §8 end-to-end scenario 5: `a = a + 1` compiles down to a single
//! fused `AddAssign`/`Increment`, and running that fused loop body a
//! million times still lands on the exact expected count.

use fluence::conf::FluenceConf;
use fluence::instruction::{InstructionLine, Op};
use fluence::optimizer::{self, OptConfig};
use fluence::symbol::SymbolTable;
use fluence::value::Value;
use fluence::vm::Vm;

fn temp(id: u32) -> Value {
    Value::Temp { id, register_index: id }
}

fn global_var(name: &str, reg: u32) -> Value {
    Value::Variable { name: name.to_string(), register_index: reg, is_global: true, solid: false }
}

#[test]
fn add_one_assignment_fuses_into_a_single_compound_op() {
    let mut code = vec![
        InstructionLine::new(Op::Add).with_lhs(temp(0)).with_rhs(global_var("a", 0)).with_rhs2(Value::Number(1.0)),
        InstructionLine::new(Op::Assign).with_lhs(global_var("a", 0)).with_rhs(temp(0)),
    ];
    let mut symbols = SymbolTable::new();
    optimizer::optimize_chunk(&mut code, &mut symbols, 0, &OptConfig::default());

    assert_eq!(code.len(), 1, "the temp-assign pair must collapse to one instruction");
    assert!(matches!(code[0].op, Op::AddAssign | Op::Increment));
}

#[test]
fn fused_increment_loop_reaches_one_million_after_a_million_iterations() {
    let mut code = vec![
        InstructionLine::new(Op::Assign).with_lhs(global_var("a", 0)).with_rhs(Value::Number(0.0)),
        InstructionLine::new(Op::Assign).with_lhs(global_var("i", 1)).with_rhs(Value::Number(0.0)),
        // 2: loop head
        InstructionLine::new(Op::LessThan).with_lhs(temp(0)).with_rhs(global_var("i", 1)).with_rhs2(Value::Number(1_000_000.0)),
        {
            let mut i = InstructionLine::new(Op::GotoIfFalse);
            i.set_jump_target(9);
            i.rhs = Some(temp(0));
            i
        },
        InstructionLine::new(Op::Add).with_lhs(temp(1)).with_rhs(global_var("a", 0)).with_rhs2(Value::Number(1.0)),
        InstructionLine::new(Op::Assign).with_lhs(global_var("a", 0)).with_rhs(temp(1)),
        InstructionLine::new(Op::Add).with_lhs(temp(2)).with_rhs(global_var("i", 1)).with_rhs2(Value::Number(1.0)),
        InstructionLine::new(Op::Assign).with_lhs(global_var("i", 1)).with_rhs(temp(2)),
        {
            let mut i = InstructionLine::new(Op::Goto);
            i.set_jump_target(2);
            i
        },
        // 9: end
        InstructionLine::new(Op::Terminate),
    ];
    let mut symbols = SymbolTable::new();
    symbols.declare_global("a", false);
    symbols.declare_global("i", false);
    optimizer::optimize_chunk(&mut code, &mut symbols, 0, &OptConfig::default());

    // both compound updates inside the loop body should have fused away.
    assert!(code.iter().any(|i| matches!(i.op, Op::AddAssign | Op::Increment)));

    let mut vm = Vm::new(code, symbols, 2, FluenceConf::defaults());
    vm.register_global_name("a", 0);
    vm.run_until_done().expect("a million-iteration fused loop must still run to completion");
    assert_eq!(vm.get_global("a").as_number().unwrap().as_i64(), 1_000_000);
}
