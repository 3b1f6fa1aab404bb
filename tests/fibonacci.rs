//! Spec §8 end-to-end scenario 1: recursive Fibonacci via `CallFunction`/
//! `Return`, exercised entirely through the public VM API (no lexer/parser —
//! the instruction list below is exactly what a front-end would emit).

use std::rc::Rc;

use fluence::conf::FluenceConf;
use fluence::instruction::{InstructionLine, Op};
use fluence::symbol::{FunctionSymbol, SymbolTable};
use fluence::value::{FunctionValue, Value};
use fluence::vm::Vm;

fn local(id: u32) -> Value {
    Value::Temp { id, register_index: id }
}

fn param(reg: u32) -> Value {
    Value::Variable { name: "n".to_string(), register_index: reg, is_global: false, solid: false }
}

fn global(name: &str, reg: u32) -> Value {
    Value::Variable { name: name.to_string(), register_index: reg, is_global: true, solid: false }
}

#[test]
fn fib_of_ten_via_recursive_call_function_is_fifty_five() {
    let fib_fn = Rc::new(FunctionValue {
        name: "fib".to_string(),
        start_address: 3,
        end_address: 14,
        arity: 1,
        param_names: vec!["n".to_string()],
        ref_params: vec![false],
    });

    let mut symbols = SymbolTable::new();
    symbols.declare_global("result", false);
    symbols.declare_function(
        "fib",
        1,
        FunctionSymbol {
            mangled_name: "fib__1".to_string(),
            display_name: "fib".to_string(),
            arity: 1,
            start_address: 3,
            end_address: 14,
            register_count: 6,
            ref_params: vec![false],
        },
    );

    let code = vec![
        // 0: top level — result := fib(10)
        InstructionLine::new(Op::PushParam).with_lhs(Value::Number(10.0)),
        InstructionLine::new(Op::CallFunction)
            .with_lhs(global("result", 0))
            .with_rhs(Value::Function(fib_fn.clone()))
            .with_rhs2(Value::Number(1.0)),
        InstructionLine::new(Op::Terminate),
        // 3: fib(n) — if n < 2 return n
        InstructionLine::new(Op::LessThan).with_lhs(local(0)).with_rhs(param(0)).with_rhs2(Value::Number(2.0)),
        {
            let mut i = InstructionLine::new(Op::GotoIfFalse);
            i.set_jump_target(6);
            i.rhs = Some(local(0));
            i
        },
        InstructionLine::new(Op::Return).with_rhs(param(0)),
        // 6: return fib(n-1) + fib(n-2)
        InstructionLine::new(Op::Sub).with_lhs(local(1)).with_rhs(param(0)).with_rhs2(Value::Number(1.0)),
        InstructionLine::new(Op::PushParam).with_lhs(local(1)),
        InstructionLine::new(Op::CallFunction)
            .with_lhs(local(2))
            .with_rhs(Value::Function(fib_fn.clone()))
            .with_rhs2(Value::Number(1.0)),
        InstructionLine::new(Op::Sub).with_lhs(local(3)).with_rhs(param(0)).with_rhs2(Value::Number(2.0)),
        InstructionLine::new(Op::PushParam).with_lhs(local(3)),
        InstructionLine::new(Op::CallFunction)
            .with_lhs(local(4))
            .with_rhs(Value::Function(fib_fn.clone()))
            .with_rhs2(Value::Number(1.0)),
        InstructionLine::new(Op::Add).with_lhs(local(5)).with_rhs(local(2)).with_rhs2(local(4)),
        InstructionLine::new(Op::Return).with_rhs(local(5)),
    ];

    let mut vm = Vm::new(code, symbols, 1, FluenceConf::defaults());
    vm.register_global_name("result", 0);
    vm.run_until_done().expect("fib(10) should run to completion");
    assert_eq!(vm.get_global("result").as_number().unwrap().as_i64(), 55);
}
