//! Spec §8 end-to-end scenario 6 / Testable Property "Ref-parameter
//! round-trip": `func inc(ref v) { v = v + 1 }; x := 5; inc(ref x); print(x)`
//! must observe `x == 6` after the call returns.

use std::rc::Rc;

use fluence::conf::FluenceConf;
use fluence::instruction::{InstructionLine, Op};
use fluence::symbol::{FunctionSymbol, SymbolTable};
use fluence::value::{FunctionValue, Value};
use fluence::vm::Vm;

fn temp(id: u32) -> Value {
    Value::Temp { id, register_index: id }
}

fn local_param(name: &str, reg: u32) -> Value {
    Value::Variable { name: name.to_string(), register_index: reg, is_global: false, solid: false }
}

fn global_var(name: &str, reg: u32) -> Value {
    Value::Variable { name: name.to_string(), register_index: reg, is_global: true, solid: false }
}

#[test]
fn ref_parameter_write_is_visible_to_the_caller_after_return() {
    let inc_fn = Rc::new(FunctionValue {
        name: "inc".to_string(),
        start_address: 5,
        end_address: 8,
        arity: 1,
        param_names: vec!["v".to_string()],
        ref_params: vec![true],
    });

    let mut symbols = SymbolTable::new();
    symbols.declare_global("x", false);
    symbols.declare_function(
        "inc",
        1,
        FunctionSymbol {
            mangled_name: "inc__1".to_string(),
            display_name: "inc".to_string(),
            arity: 1,
            start_address: 5,
            end_address: 8,
            register_count: 1,
            ref_params: vec![true],
        },
    );

    let code = vec![
        // 0: x := 5
        InstructionLine::new(Op::Assign).with_lhs(global_var("x", 0)).with_rhs(Value::Number(5.0)),
        // 1: take a reference to x, push it, call inc(ref x)
        InstructionLine::new(Op::LoadAddress).with_lhs(temp(0)).with_rhs(global_var("x", 0)),
        InstructionLine::new(Op::PushParam).with_lhs(temp(0)),
        InstructionLine::new(Op::CallFunction).with_rhs(Value::Function(inc_fn)).with_rhs2(Value::Number(1.0)),
        InstructionLine::new(Op::Terminate),
        // 5: inc(v) — v = v + 1; return
        InstructionLine::new(Op::Add).with_lhs(temp(1)).with_rhs(local_param("v", 0)).with_rhs2(Value::Number(1.0)),
        InstructionLine::new(Op::Assign).with_lhs(local_param("v", 0)).with_rhs(temp(1)),
        InstructionLine::new(Op::Return),
    ];

    let mut vm = Vm::new(code, symbols, 1, FluenceConf::defaults());
    vm.register_global_name("x", 0);
    vm.run_until_done().expect("inc(ref x) should run to completion");
    assert_eq!(vm.get_global("x").as_number().unwrap().as_i64(), 6);
}
