/// Inline-cache manager: builds `SpecializedHandler`s for arithmetic,
/// comparison-branch, element-access, iterator-next and call sites after
/// their first execution (spec §4.3).
///
/// Grounded on the teacher's `inline_cache.rs` (V8/CPython-3.11-flavored
/// `Shape`/`IcState`/`PropIC`/`CallIC`/`BinopIC`/`TypeFeedback` design),
/// generalized from property-slot caching to the register-resolving
/// closures this spec's operand-rich `InstructionLine` needs. Per the
/// design notes (§9), handlers are plain enums dispatched by `match` in
/// the VM rather than boxed closures — no per-instruction heap
/// allocation, built once and mutated in place.

use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::instruction::{Addr, Op};
use crate::value::{FunctionValue, NumberKind, RuntimeValue};

/// Where a specialized handler's operand lives, resolved once at build
/// time instead of re-resolved by name/kind on every execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperandSite {
    LocalRegister(usize),
    GlobalRegister(usize),
    Constant(ConstNumeric),
}

/// A constant numeric payload baked into the handler at build time
/// (spec §4.3: "for constant×constant, the closure stores a precomputed
/// result").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstNumeric {
    pub kind: NumberKind,
    pub bits: f64,
}

/// Destination of a specialized write, plus whether the runtime readonly
/// check may be skipped (spec §4.3/§9: skip only when statically a temp
/// or a known non-readonly local — never skip the enforcement itself).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriteSite {
    pub register: usize,
    pub is_global: bool,
    pub assigns_variable_safely: bool,
}

/// A handler attached directly to an `InstructionLine` once its operand
/// shapes stabilize. The VM's dispatch loop runs these via `match`
/// instead of generic opcode handling (spec §4.4).
#[derive(Debug, Clone)]
pub enum SpecializedHandler {
    /// Binary numeric op with both operand sites resolved.
    BinaryNumeric {
        op: Op,
        dst: WriteSite,
        lhs: OperandSite,
        rhs: OperandSite,
    },
    /// Both operands were constants at build time; the result is baked in.
    ConstantFold { dst: WriteSite, result: RuntimeValue },
    /// A fused comparison-branch (`BranchIf...`) with resolved operands.
    ComparisonBranch {
        op: Op,
        target: Addr,
        lhs: OperandSite,
        rhs: OperandSite,
    },
    /// `GetElement dst, coll, idx` with the collection's shape observed
    /// to be a dense list (so bounds-check + direct index is safe).
    ElementAccessList { dst: WriteSite, coll: OperandSite, idx: OperandSite },
    /// `IterNext` specialized to a list/range-backed iterator (the two
    /// shapes most hot loops hit; strings fall back to generic).
    IterNextFast { iter: OperandSite, val_dst: WriteSite, flag_dst: WriteSite },
    /// `CallFunction` resolved to a concrete, still-live function symbol;
    /// skips the Function/Lambda/Closure resolution match on every call.
    CallDirect { function: Rc<FunctionValue>, argc: usize },
}

/// IC lifecycle state, mirrored from the teacher's adaptive-interpreter
/// model but tracked per call site rather than per shape-cache slot,
/// since Fluence specializes the *instruction*, not a shared PIC table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcState {
    Uninitialized,
    Monomorphic,
    Polymorphic(u8),
    Megamorphic,
}

const IC_MAX_POLY: u8 = 4;

/// Per-operand type feedback, folded across executions the way
/// `TypeFeedback::observe` does in the teacher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFeedback {
    Unknown,
    Int,
    Float,
    Mixed,
}

impl TypeFeedback {
    pub fn observe(self, kind: NumberKind) -> TypeFeedback {
        let new = match kind {
            NumberKind::Int32 | NumberKind::Int64 => TypeFeedback::Int,
            NumberKind::Float32 | NumberKind::Float64 => TypeFeedback::Float,
        };
        match (self, new) {
            (TypeFeedback::Unknown, any) => any,
            (a, b) if a == b => a,
            _ => TypeFeedback::Mixed,
        }
    }
}

/// Type feedback accumulator for one specializable call site. Lives
/// alongside the instruction while it is still in the "observe, don't
/// specialize yet" phase; once a shape is stable the VM builds a
/// `SpecializedHandler` and this record is no longer consulted.
#[derive(Debug, Clone)]
pub struct BinopFeedback {
    pub lhs: TypeFeedback,
    pub rhs: TypeFeedback,
    pub observations: u32,
    pub state: IcState,
}

impl BinopFeedback {
    pub fn new() -> Self {
        BinopFeedback {
            lhs: TypeFeedback::Unknown,
            rhs: TypeFeedback::Unknown,
            observations: 0,
            state: IcState::Uninitialized,
        }
    }

    /// Record one execution's operand kinds. Returns `true` once the site
    /// has seen enough stable observations to specialize.
    pub fn observe(&mut self, lhs_kind: NumberKind, rhs_kind: NumberKind) -> bool {
        self.lhs = self.lhs.observe(lhs_kind);
        self.rhs = self.rhs.observe(rhs_kind);
        self.observations += 1;
        self.state = match self.state {
            IcState::Uninitialized => IcState::Monomorphic,
            IcState::Monomorphic if self.lhs == TypeFeedback::Mixed || self.rhs == TypeFeedback::Mixed => {
                IcState::Polymorphic(2)
            }
            IcState::Monomorphic => IcState::Monomorphic,
            IcState::Polymorphic(n) if n + 1 >= IC_MAX_POLY => IcState::Megamorphic,
            IcState::Polymorphic(n) => IcState::Polymorphic(n + 1),
            IcState::Megamorphic => IcState::Megamorphic,
        };
        // Spec §4.3: specialize "on the first execution". We keep one
        // observation of slack so a site that immediately shows mixed
        // types on its very first hit doesn't thrash into a handler
        // that's invalidated on its second.
        self.observations >= 1 && self.state != IcState::Megamorphic
    }
}

impl Default for BinopFeedback {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide counter used when Fluence needs a fresh shape id for
/// struct instances (kept for parity with the teacher's hidden-class
/// design, used by the VM's `Instance` bookkeeping rather than by this
/// module directly).
pub static NEXT_SHAPE_ID: AtomicU32 = AtomicU32::new(1);

pub fn next_shape_id() -> u32 {
    NEXT_SHAPE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Running totals the VM can expose for diagnostics (spec SPEC_FULL.md §B:
/// "opcode/IC statistics surface", grounded on `profiler.rs`/the teacher's
/// `ICTable::print_stats`). Not consulted by the dispatch loop itself.
#[derive(Debug, Default, Clone)]
pub struct ICStats {
    pub specialized_count: u64,
    pub deoptimized_count: u64,
    pub generic_dispatch_count: u64,
}

impl ICStats {
    pub fn record_specialize(&mut self) {
        self.specialized_count += 1;
    }
    pub fn record_deopt(&mut self) {
        self.deoptimized_count += 1;
    }
    pub fn record_generic(&mut self) {
        self.generic_dispatch_count += 1;
    }

    pub fn dump(&self) -> String {
        format!(
            "IC stats: specialized={} deoptimized={} generic={}",
            self.specialized_count, self.deoptimized_count, self.generic_dispatch_count
        )
    }
}

/// Build a specialized handler for a binary numeric op once both operand
/// sites and a stable type-feedback shape are known.
///
/// Callers must only invoke this when `dst.assigns_variable_safely` is
/// true — i.e. the destination is statically a temp or a non-readonly
/// local (spec §4.3: "the builder refuses to produce a handler that
/// writes to a readonly destination"). A solid-variable destination
/// always runs the generic handler, which performs the readonly check on
/// every execution.
pub fn build_binary_numeric(op: Op, dst: WriteSite, lhs: OperandSite, rhs: OperandSite) -> Option<SpecializedHandler> {
    debug_assert!(dst.assigns_variable_safely, "caller must gate on assigns_variable_safely before building");
    if let (OperandSite::Constant(a), OperandSite::Constant(b)) = (lhs, rhs) {
        let result = fold_constants(op, a, b)?;
        return Some(SpecializedHandler::ConstantFold { dst, result });
    }
    Some(SpecializedHandler::BinaryNumeric { op, dst, lhs, rhs })
}

/// Build a specialized handler for a fused comparison-branch site
/// (`BranchIf...`). Unlike arithmetic there is no destination register to
/// protect, so this always succeeds once both operand sites resolve.
pub fn build_comparison_branch(op: Op, target: Addr, lhs: OperandSite, rhs: OperandSite) -> SpecializedHandler {
    SpecializedHandler::ComparisonBranch { op, target, lhs, rhs }
}

/// Build a specialized handler for `GetElement` once the collection has
/// been observed to be a dense list (spec §4.3 element-access category).
pub fn build_element_access_list(dst: WriteSite, coll: OperandSite, idx: OperandSite) -> SpecializedHandler {
    SpecializedHandler::ElementAccessList { dst, coll, idx }
}

/// Build a specialized handler for `IterNext` once the iterator's source
/// has been observed to be a range or a list (spec §4.3 iterator-next
/// category; strings keep using the generic path).
pub fn build_iter_next_fast(iter: OperandSite, val_dst: WriteSite, flag_dst: WriteSite) -> SpecializedHandler {
    SpecializedHandler::IterNextFast { iter, val_dst, flag_dst }
}

/// Build a specialized handler for a `CallFunction`/`CallStatic` site whose
/// target was already a statically-known function value, not a dynamic
/// closure (spec §4.3 function-call category).
pub fn build_call_direct(function: Rc<FunctionValue>, argc: usize) -> SpecializedHandler {
    SpecializedHandler::CallDirect { function, argc }
}

fn fold_constants(op: Op, a: ConstNumeric, b: ConstNumeric) -> Option<RuntimeValue> {
    let (x, y) = (a.bits, b.bits);
    let widest = NumberKind::promote(a.kind, b.kind);
    let raw = match op {
        Op::Add => x + y,
        Op::Sub => x - y,
        Op::Mul => x * y,
        Op::Div => {
            if y == 0.0 {
                return None;
            }
            x / y
        }
        Op::Mod => x % y,
        Op::Power => x.powf(y),
        _ => return None,
    };
    let kind = if op == Op::Div { NumberKind::Float64 } else { widest };
    let number = match kind {
        NumberKind::Int32 => crate::value::Number::int32(raw as i32),
        NumberKind::Int64 => crate::value::Number::int64(raw as i64),
        NumberKind::Float32 => crate::value::Number::float32(raw as f32),
        NumberKind::Float64 => crate::value::Number::float64(raw),
    };
    Some(RuntimeValue::Number(number))
}
