/// Instruction model — the three-address register bytecode representation.
///
/// `InstructionLine` pairs an opcode with up to four operand slots (spec
/// §4.1) plus an optional cached `SpecializedHandler` (attached lazily by
/// the inline-cache manager, §4.3) and source-location debug info (§7).
/// Grounded on the teacher's `Op`/`Instr` split in `bytecode.rs`, but with
/// operand slots generalized from packed register bytes to full `Value`s —
/// Fluence's operands carry names, addresses and nested descriptors that
/// don't fit in a byte.

use std::fmt;

use crate::inline_cache::SpecializedHandler;
use crate::value::Value;

/// An absolute index into the final instruction list. Jump targets,
/// function start/end, and try/catch targets are all `Addr`s — the
/// optimizer's compaction pass is the single place responsible for keeping
/// every one of these correct (spec §4.2, §9 "Address-patching fanout").
pub type Addr = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    // Control
    Skip,
    Goto,
    GotoIfTrue,
    GotoIfFalse,
    BranchIfEqual,
    BranchIfNotEqual,
    BranchIfLessThan,
    BranchIfGreaterThan,
    BranchIfLessOrEqual,
    BranchIfGreaterOrEqual,
    Return,
    Terminate,

    // State
    Assign,
    AssignTwo,

    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Power,
    Negate,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    ModAssign,
    Increment,
    Decrement,
    IncrementIntUnrestricted,

    // Logical / comparison
    Not,
    And,
    Or,
    Equal,
    NotEqual,
    LessThan,
    GreaterThan,
    LessEqual,
    GreaterEqual,

    // Bitwise
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    BitwiseNot,
    LShift,
    RShift,

    // Iteration
    NewIterator,
    IterNext,

    // Calls
    PushParam,
    PushTwoParams,
    PushThreeParams,
    PushFourParams,
    CallFunction,
    CallMethod,
    CallStatic,
    NewLambda,
    LoadAddress,

    // Objects
    NewInstance,
    GetField,
    SetField,
    GetStatic,
    SetStatic,
    ToString,
    GetType,

    // Collections
    NewList,
    NewRange,
    PushElement,
    GetElement,
    SetElement,
    GetLength,

    // Exceptions
    TryBlock,
    CatchBlock,

    // Markers
    SectionGlobal,
}

impl Op {
    pub fn name(self) -> &'static str {
        use Op::*;
        match self {
            Skip => "Skip",
            Goto => "Goto",
            GotoIfTrue => "GotoIfTrue",
            GotoIfFalse => "GotoIfFalse",
            BranchIfEqual => "BranchIfEqual",
            BranchIfNotEqual => "BranchIfNotEqual",
            BranchIfLessThan => "BranchIfLessThan",
            BranchIfGreaterThan => "BranchIfGreaterThan",
            BranchIfLessOrEqual => "BranchIfLessOrEqual",
            BranchIfGreaterOrEqual => "BranchIfGreaterOrEqual",
            Return => "Return",
            Terminate => "Terminate",
            Assign => "Assign",
            AssignTwo => "AssignTwo",
            Add => "Add",
            Sub => "Sub",
            Mul => "Mul",
            Div => "Div",
            Mod => "Mod",
            Power => "Power",
            Negate => "Negate",
            AddAssign => "AddAssign",
            SubAssign => "SubAssign",
            MulAssign => "MulAssign",
            DivAssign => "DivAssign",
            ModAssign => "ModAssign",
            Increment => "Increment",
            Decrement => "Decrement",
            IncrementIntUnrestricted => "IncrementIntUnrestricted",
            Not => "Not",
            And => "And",
            Or => "Or",
            Equal => "Equal",
            NotEqual => "NotEqual",
            LessThan => "LessThan",
            GreaterThan => "GreaterThan",
            LessEqual => "LessEqual",
            GreaterEqual => "GreaterEqual",
            BitwiseAnd => "BitwiseAnd",
            BitwiseOr => "BitwiseOr",
            BitwiseXor => "BitwiseXor",
            BitwiseNot => "BitwiseNot",
            LShift => "LShift",
            RShift => "RShift",
            NewIterator => "NewIterator",
            IterNext => "IterNext",
            PushParam => "PushParam",
            PushTwoParams => "PushTwoParams",
            PushThreeParams => "PushThreeParams",
            PushFourParams => "PushFourParams",
            CallFunction => "CallFunction",
            CallMethod => "CallMethod",
            CallStatic => "CallStatic",
            NewLambda => "NewLambda",
            LoadAddress => "LoadAddress",
            NewInstance => "NewInstance",
            GetField => "GetField",
            SetField => "SetField",
            GetStatic => "GetStatic",
            SetStatic => "SetStatic",
            ToString => "ToString",
            GetType => "GetType",
            NewList => "NewList",
            NewRange => "NewRange",
            PushElement => "PushElement",
            GetElement => "GetElement",
            SetElement => "SetElement",
            GetLength => "GetLength",
            TryBlock => "TryBlock",
            CatchBlock => "CatchBlock",
            SectionGlobal => "SectionGlobal",
        }
    }

    pub fn is_jump(self) -> bool {
        use Op::*;
        matches!(
            self,
            Goto | GotoIfTrue
                | GotoIfFalse
                | BranchIfEqual
                | BranchIfNotEqual
                | BranchIfLessThan
                | BranchIfGreaterThan
                | BranchIfLessOrEqual
                | BranchIfGreaterOrEqual
        )
    }

    /// Is this one of the ops the inline-cache manager will specialize
    /// after observing its operand shapes (spec §4.3): arithmetic, fused
    /// comparison-branches, element access, iterator-next, and direct
    /// function calls.
    pub fn is_specializable(self) -> bool {
        use Op::*;
        matches!(
            self,
            Add | Sub
                | Mul
                | Div
                | Mod
                | Power
                | BranchIfEqual
                | BranchIfNotEqual
                | BranchIfLessThan
                | BranchIfGreaterThan
                | BranchIfLessOrEqual
                | BranchIfGreaterOrEqual
                | GetElement
                | IterNext
                | CallFunction
                | CallStatic
        )
    }
}

/// Source-location debug info carried by every instruction (spec §7).
#[derive(Debug, Clone, Default)]
pub struct DebugInfo {
    pub line: u32,
    pub column: u32,
    pub project_file_index: u32,
}

/// One bytecode instruction: an opcode plus up to four operand slots.
///
/// `Lhs` is the destination for pure operations, a jump address for
/// branches, or the object being assigned-into for field/element writes
/// (spec §4.1). The `specialized` slot is populated lazily by the VM/IC
/// manager and is never set by the optimizer or parser.
pub struct InstructionLine {
    pub op: Op,
    pub lhs: Option<Value>,
    pub rhs: Option<Value>,
    pub rhs2: Option<Value>,
    pub rhs3: Option<Value>,
    pub debug: DebugInfo,
    pub specialized: Option<SpecializedHandler>,
}

impl fmt::Debug for InstructionLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstructionLine")
            .field("op", &self.op)
            .field("lhs", &self.lhs)
            .field("rhs", &self.rhs)
            .field("rhs2", &self.rhs2)
            .field("rhs3", &self.rhs3)
            .field("debug", &self.debug)
            .field("specialized", &self.specialized.is_some())
            .finish()
    }
}

impl Clone for InstructionLine {
    /// Specialization is dropped on clone — a cloned instruction is
    /// observationally equivalent but must re-specialize independently
    /// (mirrors `Proto::clone` discarding per-site caches in the teacher).
    fn clone(&self) -> Self {
        InstructionLine {
            op: self.op,
            lhs: self.lhs.clone(),
            rhs: self.rhs.clone(),
            rhs2: self.rhs2.clone(),
            rhs3: self.rhs3.clone(),
            debug: self.debug.clone(),
            specialized: None,
        }
    }
}

impl InstructionLine {
    pub fn new(op: Op) -> Self {
        InstructionLine {
            op,
            lhs: None,
            rhs: None,
            rhs2: None,
            rhs3: None,
            debug: DebugInfo::default(),
            specialized: None,
        }
    }

    pub fn with_lhs(mut self, v: Value) -> Self {
        self.lhs = Some(v);
        self
    }
    pub fn with_rhs(mut self, v: Value) -> Self {
        self.rhs = Some(v);
        self
    }
    pub fn with_rhs2(mut self, v: Value) -> Self {
        self.rhs2 = Some(v);
        self
    }
    pub fn with_rhs3(mut self, v: Value) -> Self {
        self.rhs3 = Some(v);
        self
    }
    pub fn with_debug(mut self, line: u32, column: u32) -> Self {
        self.debug.line = line;
        self.debug.column = column;
        self
    }

    /// A jump/branch instruction's destination address, if any. Lhs
    /// doubles as the address slot for control-flow ops (spec §4.1).
    pub fn jump_target(&self) -> Option<Addr> {
        if !self.op.is_jump() {
            return None;
        }
        match &self.lhs {
            Some(Value::Number(n)) => Some(*n as Addr),
            _ => None,
        }
    }

    pub fn set_jump_target(&mut self, addr: Addr) {
        self.lhs = Some(Value::Number(addr as f64));
    }

    /// Placeholder no-op used by the optimizer while compacting (spec §4.2,
    /// §9: "use Skip/null placeholders to avoid O(n^2) removals").
    pub fn skip() -> Self {
        InstructionLine::new(Op::Skip)
    }

    pub fn is_skip(&self) -> bool {
        self.op == Op::Skip
    }

    /// One disassembly row, matching the fixed-width column format in §6:
    /// `INDEX(D4) | OPCODE(25) | LHS(40) | RHS(55) | RHS2(40) | RHS3(40)`.
    pub fn dump_row(&self, index: usize) -> String {
        fn col(v: &Option<Value>, width: usize) -> String {
            let s = v.as_ref().map(|v| v.bytecode_string()).unwrap_or_else(|| "null".to_string());
            format!("{:<width$}", s, width = width)
        }
        format!(
            "{:04} | {:<25} | {} | {} | {} | {}",
            index,
            self.op.name(),
            col(&self.lhs, 40),
            col(&self.rhs, 55),
            col(&self.rhs2, 40),
            col(&self.rhs3, 40),
        )
    }
}

/// Dump a whole instruction list using the §6 disassembly format.
pub fn dump_bytecode(code: &[InstructionLine]) -> String {
    let mut out = String::new();
    for (i, instr) in code.iter().enumerate() {
        out.push_str(&instr.dump_row(i));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_is_a_noop_marker() {
        assert!(InstructionLine::skip().is_skip());
        assert!(!InstructionLine::new(Op::Add).is_skip());
    }

    #[test]
    fn jump_target_round_trips() {
        let mut instr = InstructionLine::new(Op::Goto);
        instr.set_jump_target(42);
        assert_eq!(instr.jump_target(), Some(42));
    }

    #[test]
    fn dump_row_renders_null_for_missing_operands() {
        let instr = InstructionLine::new(Op::Return);
        let row = instr.dump_row(0);
        assert!(row.contains("null"));
        assert!(row.starts_with("0000"));
    }
}
