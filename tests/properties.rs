//! Spec §8 "Properties" — checked directly against the public API rather
//! than as an exhaustive round-trip grid: iterator totality over both
//! iteration directions, numeric promotion across every subtype pairing,
//! and readonly invariance leaving the variable's original value intact.

use fluence::conf::FluenceConf;
use fluence::instruction::{InstructionLine, Op};
use fluence::symbol::SymbolTable;
use fluence::value::{NumberKind, Value};
use fluence::vm::Vm;

fn temp(id: u32) -> Value {
    Value::Temp { id, register_index: id }
}

fn global_var(name: &str, reg: u32) -> Value {
    Value::Variable { name: name.to_string(), register_index: reg, is_global: true, solid: false }
}

/// Drive a `NewRange`/`NewIterator`/`IterNext` loop from `start` to `end`
/// and count how many values came back before exhaustion.
fn count_range_iterations(start: f64, end: f64) -> i64 {
    let code = vec![
        InstructionLine::new(Op::NewRange).with_lhs(temp(0)).with_rhs(Value::Number(start)).with_rhs2(Value::Number(end)),
        InstructionLine::new(Op::NewIterator).with_lhs(temp(1)).with_rhs(temp(0)),
        InstructionLine::new(Op::Assign).with_lhs(global_var("count", 0)).with_rhs(Value::Number(0.0)),
        // 3: loop head
        InstructionLine::new(Op::IterNext).with_lhs(temp(2)).with_rhs(temp(1)).with_rhs2(temp(3)),
        {
            let mut i = InstructionLine::new(Op::GotoIfFalse);
            i.set_jump_target(8);
            i.rhs = Some(temp(3));
            i
        },
        InstructionLine::new(Op::Add).with_lhs(temp(4)).with_rhs(global_var("count", 0)).with_rhs2(Value::Number(1.0)),
        InstructionLine::new(Op::Assign).with_lhs(global_var("count", 0)).with_rhs(temp(4)),
        {
            let mut i = InstructionLine::new(Op::Goto);
            i.set_jump_target(3);
            i
        },
        InstructionLine::new(Op::Terminate),
    ];
    let mut vm = Vm::new(code, SymbolTable::new(), 1, FluenceConf::defaults());
    vm.register_global_name("count", 0);
    vm.run_until_done().expect("range iteration must run to completion");
    vm.get_global("count").as_number().unwrap().as_i64()
}

#[test]
fn iterator_totality_ascending_descending_and_singleton() {
    assert_eq!(count_range_iterations(1.0, 100.0), 100, "ascending range is |b-a|+1 inclusive");
    assert_eq!(count_range_iterations(10.0, 1.0), 10, "descending range is |b-a|+1 inclusive");
    assert_eq!(count_range_iterations(5.0, 5.0), 1, "a==b yields exactly one value");
}

#[test]
fn numeric_promotion_matches_the_table_for_every_subtype_pairing() {
    use NumberKind::*;
    let pairs = [
        (Int32, Int32, Int32),
        (Int32, Int64, Int64),
        (Int64, Int64, Int64),
        (Int32, Float32, Float64),
        (Float32, Float32, Float32),
        (Int64, Float64, Float64),
        (Float32, Float64, Float64),
    ];
    for (a, b, expected) in pairs {
        assert_eq!(NumberKind::promote(a, b), expected, "{a:?} promote {b:?}");
        assert_eq!(NumberKind::promote(b, a), expected, "promotion must be symmetric");
    }
}

#[test]
fn division_always_yields_float64_regardless_of_operand_subtypes() {
    // spec §4.1: Div's result kind is always Float64, even for two Int32s.
    let code = vec![
        InstructionLine::new(Op::Div).with_lhs(global_var("q", 0)).with_rhs(Value::Number(7.0)).with_rhs2(Value::Number(2.0)),
        InstructionLine::new(Op::Terminate),
    ];
    let mut vm = Vm::new(code, SymbolTable::new(), 1, FluenceConf::defaults());
    vm.register_global_name("q", 0);
    vm.run_until_done().expect("integer division must run to completion");
    let q = vm.get_global("q").as_number().unwrap();
    assert_eq!(q.kind, NumberKind::Float64);
    assert_eq!(q.as_f64(), 3.5);
}

#[test]
fn readonly_write_leaves_the_original_value_untouched() {
    let x = Value::Variable { name: "x".to_string(), register_index: 0, is_global: true, solid: true };
    let code = vec![
        InstructionLine::new(Op::Assign).with_lhs(x.clone()).with_rhs(Value::Number(3.0)),
        InstructionLine::new(Op::Assign).with_lhs(x).with_rhs(Value::Number(4.0)),
        InstructionLine::new(Op::Terminate),
    ];
    let mut symbols = SymbolTable::new();
    symbols.declare_global("x", true);
    let mut vm = Vm::new(code, symbols, 1, FluenceConf::defaults());
    vm.register_global_name("x", 0);

    let result = vm.run_until_done();
    assert!(result.is_err());
    assert_eq!(vm.get_global("x").as_number().unwrap().as_i64(), 3, "the rejected write must not take effect");
}
