//! Spec §8 end-to-end scenarios 3 and 4, exercised through the embedding
//! facade (`Runtime`/`CompiledProgram`) rather than the bare `Vm`, so the
//! host-facing compile/run surface gets its own coverage.

use fluence::errors::RuntimeError;
use fluence::instruction::{InstructionLine, Op};
use fluence::runtime::{CompiledProgram, Runtime};
use fluence::symbol::SymbolTable;
use fluence::value::Value;
use fluence::vm::VmState;

fn solid_var(name: &str, reg: u32) -> Value {
    Value::Variable { name: name.to_string(), register_index: reg, is_global: true, solid: true }
}

#[test]
fn solid_violation_reports_readonly_error_and_leaves_vm_in_error_state() {
    // solid x := 3; x := 4
    let code = vec![
        InstructionLine::new(Op::Assign).with_lhs(solid_var("x", 0)).with_rhs(Value::Number(3.0)),
        InstructionLine::new(Op::Assign).with_lhs(solid_var("x", 0)).with_rhs(Value::Number(4.0)),
        InstructionLine::new(Op::Terminate),
    ];
    let mut symbols = SymbolTable::new();
    symbols.declare_global("x", true);

    let mut rt = Runtime::with_defaults();
    rt.compile(CompiledProgram { code, symbols, global_register_count: 1 }, false).unwrap();
    rt.vm_mut().register_global_name("x", 0);

    let err = rt.run_until_done().expect_err("second write to a solid variable must fail");
    assert!(matches!(err.source, RuntimeError::ReadonlyViolation { ref name } if name == "x"));
    assert_eq!(rt.state(), Some(VmState::Error));
    // the variable keeps its first, valid value — the failed write never happened
    assert_eq!(rt.get_global("x").as_number().unwrap().as_i64(), 3);
}

#[test]
fn division_by_zero_inside_try_block_is_caught_and_program_finishes() {
    // try { result := 1 / 0 } catch { result := -1 }
    let dividend_reg = Value::Temp { id: 0, register_index: 0 };
    let result = Value::Variable { name: "result".to_string(), register_index: 0, is_global: true, solid: false };

    let code = vec![
        {
            let mut i = InstructionLine::new(Op::TryBlock);
            i.lhs = Some(Value::TryCatch { catch_address: 3, end_address: 4 });
            i
        },
        InstructionLine::new(Op::Div).with_lhs(dividend_reg).with_rhs(Value::Number(1.0)).with_rhs2(Value::Number(0.0)),
        {
            let mut i = InstructionLine::new(Op::Goto);
            i.set_jump_target(5);
            i
        },
        // 3: catch handler
        InstructionLine::new(Op::CatchBlock),
        InstructionLine::new(Op::Assign).with_lhs(result.clone()).with_rhs(Value::Number(-1.0)),
        InstructionLine::new(Op::Terminate),
    ];
    let mut symbols = SymbolTable::new();
    symbols.declare_global("result", false);

    let mut rt = Runtime::with_defaults();
    rt.compile(CompiledProgram { code, symbols, global_register_count: 1 }, false).unwrap();
    rt.vm_mut().register_global_name("result", 0);

    rt.run_until_done().expect("the division error must be caught, not escape");
    assert_eq!(rt.state(), Some(VmState::Finished));
    assert_eq!(rt.get_global("result").as_number().unwrap().as_i64(), -1);
}
