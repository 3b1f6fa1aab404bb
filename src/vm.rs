/// Register-based virtual machine: frame/register/operand-stack
/// management, call/return, the iterator protocol, and inline-cached
/// dispatch (spec §4.4, §5).
///
/// Grounded on `vm_core.rs`'s `VmCore`/`Frame`/`Val` shape — an explicit
/// `Vec<Frame>` call stack instead of Rust recursion, fetch-advance-
/// dispatch loop, `Val`-to-host conversion helpers — generalized from a
/// stack machine over a flat `Val` enum to the spec's register machine
/// over `RuntimeValue`, `InstructionLine`, and `SymbolTable`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::conf::FluenceConf;
use crate::errors::{RuntimeError, RuntimeErrorReport, StackFrameTrace};
use crate::inline_cache::{
    self, BinopFeedback, ConstNumeric, ICStats, OperandSite, SpecializedHandler, WriteSite,
};
use crate::instruction::{Addr, InstructionLine, Op};
use crate::pool::{self, Pool};
use crate::symbol::{self, SymbolTable};
use crate::value::{
    FunctionValue, HeapObject, Instance, IterDirection, IteratorObj, Number, NumberKind, RangeObj,
    RefCell_, RuntimeValue, Value,
};

/// Sentinel `frame_depth` meaning "the global register array", used by
/// by-reference parameter bindings (spec §4.4 `LoadAddress`).
pub const GLOBAL_FRAME_DEPTH: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    NotStarted,
    Running,
    Paused,
    Finished,
    Error,
}

struct TryHandler {
    catch_address: Addr,
    operand_stack_depth: usize,
}

/// Per-invocation record: registers, return address, ref-parameter
/// bindings, and destination register (glossary: "Call frame").
struct CallFrame {
    function_name: String,
    return_ip: Addr,
    dest_register: Option<usize>,
    dest_is_global: bool,
    registers: Vec<RuntimeValue>,
    solid_initialized: Vec<bool>,
    ref_bindings: HashMap<usize, RefCell_>,
    try_handlers: Vec<TryHandler>,
}

impl CallFrame {
    fn reset(&mut self, function_name: String, return_ip: Addr, register_count: usize) {
        self.function_name = function_name;
        self.return_ip = return_ip;
        self.dest_register = None;
        self.dest_is_global = false;
        self.registers.clear();
        self.registers.resize(register_count, RuntimeValue::Nil);
        self.solid_initialized.clear();
        self.solid_initialized.resize(register_count, false);
        self.ref_bindings.clear();
        self.try_handlers.clear();
    }
}

/// Host-provided sinks (spec §6: "a single-callable taking/returning a
/// string"). Left unset by default; embedders wire these up after
/// construction.
#[derive(Default)]
pub struct HostSinks {
    pub on_output_line: Option<Box<dyn FnMut(&str)>>,
    pub on_output: Option<Box<dyn FnMut(&str)>>,
    pub on_error_output: Option<Box<dyn FnMut(&str)>>,
    pub on_input: Option<Box<dyn FnMut() -> String>>,
}

pub struct Vm {
    code: Vec<InstructionLine>,
    symbols: SymbolTable,
    frames: Vec<CallFrame>,
    globals: Vec<RuntimeValue>,
    global_initialized: Vec<bool>,
    global_names: HashMap<String, usize>,
    operand_stack: Vec<RuntimeValue>,
    ip: Addr,
    state: VmState,
    conf: FluenceConf,
    stop_requested: bool,
    frame_pool: Pool<CallFrame>,
    list_pool: Pool<Rc<HeapObject>>,
    binop_feedback: HashMap<Addr, BinopFeedback>,
    ic_stats: ICStats,
    allowed_intrinsic_libraries: std::collections::HashSet<String>,
    project_files: Vec<String>,
    pub sinks: HostSinks,
    last_error: Option<RuntimeErrorReport>,
}

impl Vm {
    pub fn new(code: Vec<InstructionLine>, symbols: SymbolTable, global_register_count: usize, conf: FluenceConf) -> Self {
        let frame_pool_cap = conf.get_usize("frame_pool_capacity", 256);
        Vm {
            code,
            symbols,
            frames: Vec::with_capacity(64),
            globals: vec![RuntimeValue::Nil; global_register_count],
            global_initialized: vec![false; global_register_count],
            global_names: HashMap::new(),
            operand_stack: Vec::with_capacity(64),
            ip: 0,
            state: VmState::NotStarted,
            conf,
            stop_requested: false,
            frame_pool: Pool::new(frame_pool_cap),
            list_pool: Pool::new(frame_pool_cap),
            binop_feedback: HashMap::new(),
            ic_stats: ICStats::default(),
            allowed_intrinsic_libraries: std::collections::HashSet::new(),
            project_files: Vec::new(),
            sinks: HostSinks::default(),
            last_error: None,
        }
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn ic_stats(&self) -> &ICStats {
        &self.ic_stats
    }

    pub fn last_error(&self) -> Option<&RuntimeErrorReport> {
        self.last_error.as_ref()
    }

    // ── Host embedding API (spec §6) ─────────────────────────────────────

    pub fn register_global_name(&mut self, name: impl Into<String>, register_index: usize) {
        self.global_names.insert(name.into(), register_index);
    }

    pub fn get_global(&self, name: &str) -> RuntimeValue {
        self.global_names
            .get(name)
            .map(|&idx| self.globals.get(idx).cloned().unwrap_or(RuntimeValue::Nil))
            .unwrap_or(RuntimeValue::Nil)
    }

    pub fn set_global(&mut self, name: &str, value: RuntimeValue) {
        if let Some(&idx) = self.global_names.get(name) {
            self.set_global_reg(idx, value);
        }
    }

    pub fn add_allowed_intrinsic_libraries(&mut self, names: impl IntoIterator<Item = String>) {
        self.allowed_intrinsic_libraries.extend(names);
    }

    pub fn remove_allowed_intrinsic_libraries(&mut self, names: impl IntoIterator<Item = String>) {
        for n in names {
            self.allowed_intrinsic_libraries.remove(&n);
        }
    }

    pub fn clear_allowed_intrinsic_libraries(&mut self) {
        self.allowed_intrinsic_libraries.clear();
    }

    pub fn is_library_allowed(&self, name: &str) -> bool {
        self.allowed_intrinsic_libraries.contains(name)
    }

    /// Project file-path table an instruction's `DebugInfo::project_file_index`
    /// indexes into (spec §7), set by `Runtime::compile_project`.
    pub fn set_project_files(&mut self, files: Vec<String>) {
        self.project_files = files;
    }

    pub fn reset(&mut self) {
        self.frames.clear();
        for g in &mut self.globals {
            *g = RuntimeValue::Nil;
        }
        for flag in &mut self.global_initialized {
            *flag = false;
        }
        self.operand_stack.clear();
        self.ip = 0;
        self.state = VmState::NotStarted;
        self.stop_requested = false;
        self.last_error = None;
    }

    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    // ── Cooperative scheduling (spec §5) ─────────────────────────────────

    pub fn run_until_done(&mut self) -> Result<(), RuntimeErrorReport> {
        loop {
            self.run_for(Duration::from_secs(3600))?;
            if self.state == VmState::Finished || self.state == VmState::Error {
                break;
            }
        }
        match self.last_error.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Runs until `deadline` elapses or the program finishes/errors,
    /// checking the deadline and the cooperative `Stop()` flag every
    /// `deadline_check_interval` instructions (spec §5). Instructions are
    /// atomic with respect to cancellation: the check happens only
    /// between full instruction executions.
    pub fn run_for(&mut self, budget: Duration) -> Result<(), RuntimeErrorReport> {
        if self.state == VmState::NotStarted {
            self.push_top_level_frame();
            self.state = VmState::Running;
        } else if self.state == VmState::Paused {
            self.state = VmState::Running;
        } else {
            return Ok(());
        }

        let check_interval = self.conf.get_usize("deadline_check_interval", 4096).max(1) as u64;
        let deadline = Instant::now() + budget;
        let mut since_check: u64 = 0;

        loop {
            if self.frames.is_empty() {
                self.state = VmState::Finished;
                return Ok(());
            }
            match self.step() {
                Ok(()) => {}
                Err(report) => {
                    self.state = VmState::Error;
                    self.last_error = Some(report.clone());
                    return Err(report);
                }
            }
            if self.state != VmState::Running {
                return Ok(());
            }
            since_check += 1;
            if since_check >= check_interval {
                since_check = 0;
                if self.stop_requested {
                    self.stop_requested = false;
                    self.state = VmState::Finished;
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    self.state = VmState::Paused;
                    return Ok(());
                }
            }
        }
    }

    fn push_top_level_frame(&mut self) {
        let register_count = self.conf.get_usize("top_level_register_count", 64);
        let mut frame = self.frame_pool.acquire(
            || CallFrame {
                function_name: "<main>".to_string(),
                return_ip: 0,
                dest_register: None,
                dest_is_global: false,
                registers: Vec::new(),
                solid_initialized: Vec::new(),
                ref_bindings: HashMap::new(),
                try_handlers: Vec::new(),
            },
            |_| {},
        );
        frame.reset("<main>".to_string(), self.code.len(), register_count);
        self.frames.push(frame);
    }

    // ── Register access ───────────────────────────────────────────────────

    fn cur_frame(&self) -> &CallFrame {
        self.frames.last().expect("step() called with no active frame")
    }

    fn cur_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("step() called with no active frame")
    }

    fn get_local(&self, reg: usize) -> RuntimeValue {
        self.cur_frame().registers.get(reg).cloned().unwrap_or(RuntimeValue::Nil)
    }

    fn set_local(&mut self, reg: usize, value: RuntimeValue) {
        let old = {
            let frame = self.cur_frame_mut();
            if reg < frame.registers.len() {
                Some(std::mem::replace(&mut frame.registers[reg], value))
            } else {
                None
            }
        };
        if let Some(old) = old {
            self.try_reclaim_list(old);
        }
    }

    fn get_global_reg(&self, reg: usize) -> RuntimeValue {
        self.globals.get(reg).cloned().unwrap_or(RuntimeValue::Nil)
    }

    fn set_global_reg(&mut self, reg: usize, value: RuntimeValue) {
        if reg < self.globals.len() {
            let old = std::mem::replace(&mut self.globals[reg], value);
            self.try_reclaim_list(old);
        }
    }

    /// Like `set_local` but targeting an arbitrary ancestor frame by
    /// index, for by-reference parameter writeback (spec §4.4 `LoadAddress`
    /// bindings resolved on return) that isn't necessarily the current frame.
    fn set_frame_reg(&mut self, frame_depth: usize, reg: usize, value: RuntimeValue) {
        let old = match self.frames.get_mut(frame_depth) {
            Some(frame) if reg < frame.registers.len() => Some(std::mem::replace(&mut frame.registers[reg], value)),
            _ => None,
        };
        if let Some(old) = old {
            self.try_reclaim_list(old);
        }
    }

    /// Spec §5 `TryReturnRegisterReferenceToPool`: when a register holding
    /// a pooled list is overwritten, the old backing allocation returns to
    /// the pool before the new value lands, as long as nothing else still
    /// holds a reference to it. Other heap shapes (instances, closures,
    /// strings) aren't pooled — they're dropped normally via `Rc`.
    fn try_reclaim_list(&mut self, old: RuntimeValue) {
        if let RuntimeValue::Object(rc) = old {
            if matches!(rc.as_ref(), HeapObject::List(_)) {
                pool::try_reclaim(rc, &mut self.list_pool);
            }
        }
    }

    fn literal_to_runtime(v: &Value) -> RuntimeValue {
        match v {
            Value::Number(n) => RuntimeValue::Number(numeric_literal(*n)),
            Value::Str(s) => RuntimeValue::from_str(s.as_str()),
            Value::Char(c) => RuntimeValue::Object(Rc::new(HeapObject::Char(*c))),
            Value::Bool(b) => RuntimeValue::Boolean(*b),
            Value::Nil => RuntimeValue::Nil,
            _ => RuntimeValue::Nil,
        }
    }

    fn resolve_read(&self, v: &Value) -> RuntimeValue {
        match v {
            Value::Temp { register_index, .. } => self.get_local(*register_index as usize),
            Value::Variable { register_index, is_global, .. } => {
                if *is_global {
                    self.get_global_reg(*register_index as usize)
                } else {
                    self.get_local(*register_index as usize)
                }
            }
            literal => Self::literal_to_runtime(literal),
        }
    }

    /// Every write path enforces the readonly check (spec §4.4, §9): a
    /// `solid` variable may be written exactly once. Specialized handlers
    /// only ever target destinations where `Value::assigns_safely()` was
    /// true at build time, so they never need to call this — but this is
    /// still the *only* place a write to a named variable happens, which
    /// is what keeps the invariant total.
    fn write_value(&mut self, target: &Value, value: RuntimeValue) -> Result<(), RuntimeError> {
        match target {
            Value::Temp { register_index, .. } => {
                self.set_local(*register_index as usize, value);
                Ok(())
            }
            Value::Variable { register_index, is_global, solid, name } => {
                let reg = *register_index as usize;
                if *is_global {
                    if *solid {
                        if self.global_initialized.get(reg).copied().unwrap_or(false) {
                            return Err(RuntimeError::ReadonlyViolation { name: name.clone() });
                        }
                        if reg < self.global_initialized.len() {
                            self.global_initialized[reg] = true;
                        }
                    }
                    self.set_global_reg(reg, value);
                } else {
                    if *solid {
                        let already = self.cur_frame().solid_initialized.get(reg).copied().unwrap_or(false);
                        if already {
                            return Err(RuntimeError::ReadonlyViolation { name: name.clone() });
                        }
                        let frame = self.cur_frame_mut();
                        if reg < frame.solid_initialized.len() {
                            frame.solid_initialized[reg] = true;
                        }
                    }
                    self.set_local(reg, value);
                }
                Ok(())
            }
            _ => Err(RuntimeError::TypeMismatch {
                expected: "assignable location".to_string(),
                found: "expression".to_string(),
            }),
        }
    }

    fn operand_site(&self, v: &Value) -> Option<OperandSite> {
        match v {
            Value::Temp { register_index, .. } => Some(OperandSite::LocalRegister(*register_index as usize)),
            Value::Variable { register_index, is_global, .. } => Some(if *is_global {
                OperandSite::GlobalRegister(*register_index as usize)
            } else {
                OperandSite::LocalRegister(*register_index as usize)
            }),
            Value::Number(n) => {
                let num = numeric_literal(*n);
                Some(OperandSite::Constant(ConstNumeric { kind: num.kind, bits: num.bits }))
            }
            _ => None,
        }
    }

    fn read_site(&self, site: OperandSite) -> RuntimeValue {
        match site {
            OperandSite::LocalRegister(r) => self.get_local(r),
            OperandSite::GlobalRegister(r) => self.get_global_reg(r),
            OperandSite::Constant(c) => RuntimeValue::Number(Number::from_kind(c.kind, c.bits)),
        }
    }

    fn write_site(&mut self, site: WriteSite, value: RuntimeValue) {
        if site.is_global {
            self.set_global_reg(site.register, value);
        } else {
            self.set_local(site.register, value);
        }
    }

    // ── Arithmetic ─────────────────────────────────────────────────────────

    fn numeric_binary(op: Op, a: Number, b: Number) -> Result<Number, RuntimeError> {
        let widest = NumberKind::promote(a.kind, b.kind);
        let (x, y) = (a.as_f64(), b.as_f64());
        let raw = match op {
            Op::Add => x + y,
            Op::Sub => x - y,
            Op::Mul => x * y,
            Op::Div => {
                if y == 0.0 {
                    return Err(RuntimeError::DivisionByZero);
                }
                x / y
            }
            Op::Mod => x % y,
            Op::Power => x.powf(y),
            _ => unreachable!("non-arithmetic op routed to numeric_binary"),
        };
        let kind = if op == Op::Div { NumberKind::Float64 } else { widest };
        Ok(Number::from_kind(kind, raw))
    }

    fn as_number(v: &RuntimeValue, role: &str) -> Result<Number, RuntimeError> {
        v.as_number().ok_or_else(|| RuntimeError::TypeMismatch {
            expected: format!("Number ({role})"),
            found: v.type_name().to_string(),
        })
    }

    // ── Specialization ────────────────────────────────────────────────────

    fn write_site_for(dst: &Value) -> Option<WriteSite> {
        match dst {
            Value::Temp { register_index, .. } => Some(WriteSite { register: *register_index as usize, is_global: false, assigns_variable_safely: true }),
            Value::Variable { register_index, is_global, .. } => {
                Some(WriteSite { register: *register_index as usize, is_global: *is_global, assigns_variable_safely: true })
            }
            _ => None,
        }
    }

    /// Record this execution's operand kinds and, once `BinopFeedback`
    /// reports the site has a stable shape (spec §4.3: "based on
    /// first-observed operand kinds"), build a `BinaryNumeric`/
    /// `ConstantFold` handler for it.
    fn try_specialize_binary(&mut self, idx: Addr, op: Op, dst: &Value, lhs: &Value, rhs: &Value, lhs_kind: NumberKind, rhs_kind: NumberKind) {
        let stable = self.binop_feedback.entry(idx).or_default().observe(lhs_kind, rhs_kind);
        if !stable || !dst.assigns_safely() {
            return;
        }
        let (Some(lsite), Some(rsite)) = (self.operand_site(lhs), self.operand_site(rhs)) else {
            return;
        };
        let Some(write_site) = Self::write_site_for(dst) else { return };
        if let Some(handler) = inline_cache::build_binary_numeric(op, write_site, lsite, rsite) {
            self.code[idx].specialized = Some(handler);
            self.binop_feedback.remove(&idx);
            self.ic_stats.record_specialize();
        }
    }

    /// Spec §4.3 "comparison branches": a fused `BranchIf...` site
    /// specializes once both operand sites resolve. No destination
    /// register is involved, so there's nothing to gate on.
    fn try_specialize_comparison_branch(&mut self, idx: Addr, op: Op, target: Addr, lhs: &Value, rhs: &Value) {
        let (Some(lsite), Some(rsite)) = (self.operand_site(lhs), self.operand_site(rhs)) else {
            return;
        };
        self.code[idx].specialized = Some(inline_cache::build_comparison_branch(op, target, lsite, rsite));
        self.ic_stats.record_specialize();
    }

    /// Spec §4.3 "element access": specialize `GetElement` once the
    /// collection has been observed to be a dense list.
    fn try_specialize_element_access(&mut self, idx: Addr, dst: &Value, coll: &Value, elem_idx: &Value) {
        if !dst.assigns_safely() {
            return;
        }
        let (Some(csite), Some(isite)) = (self.operand_site(coll), self.operand_site(elem_idx)) else {
            return;
        };
        let Some(write_site) = Self::write_site_for(dst) else { return };
        self.code[idx].specialized = Some(inline_cache::build_element_access_list(write_site, csite, isite));
        self.ic_stats.record_specialize();
    }

    /// Spec §4.3 "iterator-next": specialize `IterNext` once its source has
    /// been observed to be a range or a list (the caller has already
    /// checked the shape before calling this).
    fn try_specialize_iter_next(&mut self, idx: Addr, val_dst: &Value, iter: &Value, flag_dst: &Value) {
        if !val_dst.assigns_safely() || !flag_dst.assigns_safely() {
            return;
        }
        let Some(iter_site) = self.operand_site(iter) else { return };
        let (Some(val_site), Some(flag_site)) = (Self::write_site_for(val_dst), Self::write_site_for(flag_dst)) else {
            return;
        };
        self.code[idx].specialized = Some(inline_cache::build_iter_next_fast(iter_site, val_site, flag_site));
        self.ic_stats.record_specialize();
    }

    /// Spec §4.3 "function call": a `CallFunction`/`CallStatic` site whose
    /// target resolved directly to a `Value::Function` (not a dynamic
    /// closure) specializes to skip that resolution on future calls.
    fn try_specialize_call(&mut self, idx: Addr, function: Rc<FunctionValue>, argc: usize) {
        self.code[idx].specialized = Some(inline_cache::build_call_direct(function, argc));
        self.ic_stats.record_specialize();
    }

    fn run_specialized(&mut self, idx: Addr, handler: SpecializedHandler) -> Result<(), RuntimeError> {
        match handler {
            SpecializedHandler::ConstantFold { dst, result } => {
                self.write_site(dst, result);
                Ok(())
            }
            SpecializedHandler::BinaryNumeric { op, dst, lhs, rhs } => {
                let a = self.read_site(lhs);
                let b = self.read_site(rhs);
                match (a.as_number(), b.as_number()) {
                    (Some(a), Some(b)) => {
                        let result = Self::numeric_binary(op, a, b)?;
                        self.write_site(dst, RuntimeValue::Number(result));
                        Ok(())
                    }
                    _ => {
                        // Shape invalidated: deoptimize and fall back once.
                        self.code[idx].specialized = None;
                        self.ic_stats.record_deopt();
                        self.dispatch_generic(idx)
                    }
                }
            }
            SpecializedHandler::ComparisonBranch { op, target, lhs, rhs } => {
                let a = self.read_site(lhs);
                let b = self.read_site(rhs);
                let taken = compare(op, &a, &b)?;
                if taken {
                    self.ip = target;
                }
                Ok(())
            }
            SpecializedHandler::ElementAccessList { dst, coll, idx: idx_site } => {
                let coll_val = self.read_site(coll);
                let RuntimeValue::Object(o) = &coll_val else {
                    self.code[idx].specialized = None;
                    self.ic_stats.record_deopt();
                    return self.dispatch_generic(idx);
                };
                let HeapObject::List(cell) = o.as_ref() else {
                    self.code[idx].specialized = None;
                    self.ic_stats.record_deopt();
                    return self.dispatch_generic(idx);
                };
                let elem_idx = self.read_site(idx_site).as_number().map(|n| n.as_i64()).unwrap_or(-1);
                let items = cell.borrow();
                let len = items.len();
                if elem_idx < 0 || elem_idx as usize >= len {
                    return Err(RuntimeError::IndexOutOfRange { index: elem_idx, length: len });
                }
                let value = items[elem_idx as usize].clone();
                drop(items);
                self.write_site(dst, value);
                Ok(())
            }
            SpecializedHandler::IterNextFast { iter, val_dst, flag_dst } => {
                let iter_val = self.read_site(iter);
                let RuntimeValue::Object(o) = &iter_val else {
                    self.code[idx].specialized = None;
                    self.ic_stats.record_deopt();
                    return self.dispatch_generic(idx);
                };
                let HeapObject::Iterator(cell) = o.as_ref() else {
                    self.code[idx].specialized = None;
                    self.ic_stats.record_deopt();
                    return self.dispatch_generic(idx);
                };
                let mut it = cell.borrow_mut();
                if it.exhausted {
                    drop(it);
                    self.write_site(val_dst, RuntimeValue::Nil);
                    self.write_site(flag_dst, RuntimeValue::Boolean(false));
                    return Ok(());
                }
                let still_fast = matches!(&it.source, RuntimeValue::Object(o) if matches!(o.as_ref(), HeapObject::Range(_) | HeapObject::List(_)));
                if !still_fast {
                    drop(it);
                    self.code[idx].specialized = None;
                    self.ic_stats.record_deopt();
                    return self.dispatch_generic(idx);
                }
                let (value, has_more, next_cursor) = Self::iter_advance(&it.source, it.cursor, it.direction);
                it.cursor = next_cursor;
                if !has_more {
                    it.exhausted = true;
                }
                drop(it);
                self.write_site(val_dst, value);
                self.write_site(flag_dst, RuntimeValue::Boolean(has_more));
                Ok(())
            }
            SpecializedHandler::CallDirect { function, argc } => {
                let dst = self.code[idx].lhs.clone();
                self.invoke(function, dst, argc)
            }
        }
    }

    // ── Fetch/dispatch ────────────────────────────────────────────────────

    fn step(&mut self) -> Result<(), RuntimeErrorReport> {
        if self.ip >= self.code.len() {
            return self.do_return(None).map_err(|e| self.build_report(e, self.ip));
        }
        let idx = self.ip;
        self.ip += 1;
        let specialized = self.code[idx].specialized.clone();
        let result = if let Some(handler) = specialized {
            self.run_specialized(idx, handler)
        } else {
            self.ic_stats.record_generic();
            self.dispatch_generic(idx)
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => self.unwind_or_report(err, idx),
        }
    }

    fn unwind_or_report(&mut self, err: RuntimeError, fault_ip: Addr) -> Result<(), RuntimeErrorReport> {
        loop {
            let Some(frame) = self.frames.last_mut() else {
                return Err(self.build_report(err, fault_ip));
            };
            if let Some(handler) = frame.try_handlers.pop() {
                self.operand_stack.truncate(handler.operand_stack_depth);
                self.ip = handler.catch_address;
                return Ok(());
            }
            let frame = self.frames.pop().expect("checked non-empty above");
            self.frame_pool.release(frame);
            if self.frames.is_empty() {
                return Err(self.build_report(err, fault_ip));
            }
        }
    }

    /// Builds the source-location trace for a fault (spec §7): the
    /// innermost frame's location is the faulting instruction itself;
    /// every caller frame's location is its call site, one instruction
    /// before the address execution resumes at on return.
    fn build_report(&self, err: RuntimeError, fault_ip: Addr) -> RuntimeErrorReport {
        let frame_count = self.frames.len();
        let trace: Vec<StackFrameTrace> = self
            .frames
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let call_ip = if i + 1 == frame_count { fault_ip } else { self.frames[i + 1].return_ip.saturating_sub(1) };
                let debug = self.code.get(call_ip).map(|instr| &instr.debug);
                let file = debug.and_then(|d| self.project_files.get(d.project_file_index as usize).cloned());
                StackFrameTrace {
                    function_name: f.function_name.clone(),
                    ip: call_ip,
                    line: debug.map(|d| d.line).unwrap_or(0),
                    column: debug.map(|d| d.column).unwrap_or(0),
                    file,
                }
            })
            .collect();
        let locals_snapshot = self
            .frames
            .last()
            .map(|f| {
                f.registers
                    .iter()
                    .map(|r| RuntimeErrorReport::truncate_value(&r.display()))
                    .collect()
            })
            .unwrap_or_default();
        let operand_stack_snapshot = self
            .operand_stack
            .iter()
            .map(|v| RuntimeErrorReport::truncate_value(&v.display()))
            .collect();
        RuntimeErrorReport {
            function_name: self.frames.last().map(|f| f.function_name.clone()).unwrap_or_default(),
            ip: self.ip,
            locals_snapshot,
            operand_stack_snapshot,
            trace,
            source: err,
        }
    }

    fn dispatch_generic(&mut self, idx: Addr) -> Result<(), RuntimeError> {
        let op = self.code[idx].op;
        let lhs = self.code[idx].lhs.clone();
        let rhs = self.code[idx].rhs.clone();
        let rhs2 = self.code[idx].rhs2.clone();
        let rhs3 = self.code[idx].rhs3.clone();

        match op {
            Op::Skip | Op::SectionGlobal => Ok(()),

            Op::Goto => {
                self.ip = self.code[idx].jump_target().unwrap_or(self.ip);
                Ok(())
            }
            Op::GotoIfTrue | Op::GotoIfFalse => {
                let cond = self.resolve_read(rhs.as_ref().expect("cond operand"));
                let want = op == Op::GotoIfTrue;
                if cond.is_truthy() == want {
                    self.ip = self.code[idx].jump_target().unwrap_or(self.ip);
                }
                Ok(())
            }
            Op::BranchIfEqual
            | Op::BranchIfNotEqual
            | Op::BranchIfLessThan
            | Op::BranchIfGreaterThan
            | Op::BranchIfLessOrEqual
            | Op::BranchIfGreaterOrEqual => {
                let a = self.resolve_read(rhs.as_ref().expect("lhs operand"));
                let b = self.resolve_read(rhs2.as_ref().expect("rhs operand"));
                let target = self.code[idx].jump_target().unwrap_or(self.ip);
                if compare(op, &a, &b)? {
                    self.ip = target;
                }
                self.try_specialize_comparison_branch(idx, op, target, rhs.as_ref().unwrap(), rhs2.as_ref().unwrap());
                Ok(())
            }
            Op::Return => {
                let v = rhs.as_ref().map(|v| self.resolve_read(v));
                self.do_return(v)
            }
            Op::Terminate => {
                self.frames.clear();
                Ok(())
            }

            Op::Assign => {
                let v = self.resolve_read(rhs.as_ref().expect("assign src"));
                self.write_value(lhs.as_ref().expect("assign dst"), v)
            }
            Op::AssignTwo => {
                let v1 = self.resolve_read(rhs.as_ref().expect("assign2 src1"));
                self.write_value(lhs.as_ref().expect("assign2 dst1"), v1)?;
                let v2 = self.resolve_read(rhs3.as_ref().expect("assign2 src2"));
                self.write_value(rhs2.as_ref().expect("assign2 dst2"), v2)
            }

            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod | Op::Power => {
                let a = Self::as_number(&self.resolve_read(rhs.as_ref().expect("lhs")), "lhs")?;
                let b = Self::as_number(&self.resolve_read(rhs2.as_ref().expect("rhs")), "rhs")?;
                let result = Self::numeric_binary(op, a, b)?;
                let dst = lhs.as_ref().expect("dst");
                self.write_value(dst, RuntimeValue::Number(result))?;
                self.try_specialize_binary(idx, op, dst, rhs.as_ref().unwrap(), rhs2.as_ref().unwrap(), a.kind, b.kind);
                Ok(())
            }
            Op::Negate => {
                let a = Self::as_number(&self.resolve_read(rhs.as_ref().expect("operand")), "operand")?;
                let negated = Number::from_kind(a.kind, -a.as_f64());
                self.write_value(lhs.as_ref().expect("dst"), RuntimeValue::Number(negated))
            }
            Op::AddAssign | Op::SubAssign | Op::MulAssign | Op::DivAssign | Op::ModAssign => {
                let arith = match op {
                    Op::AddAssign => Op::Add,
                    Op::SubAssign => Op::Sub,
                    Op::MulAssign => Op::Mul,
                    Op::DivAssign => Op::Div,
                    Op::ModAssign => Op::Mod,
                    _ => unreachable!(),
                };
                let a = Self::as_number(&self.resolve_read(rhs.as_ref().expect("lhs")), "lhs")?;
                let b = Self::as_number(&self.resolve_read(rhs2.as_ref().expect("rhs")), "rhs")?;
                let result = Self::numeric_binary(arith, a, b)?;
                self.write_value(lhs.as_ref().expect("var"), RuntimeValue::Number(result))
            }
            Op::Increment | Op::Decrement => {
                let var = lhs.as_ref().expect("var");
                let cur = Self::as_number(&self.resolve_read(var), "var")?;
                let delta = if op == Op::Increment { 1.0 } else { -1.0 };
                let result = Number::from_kind(cur.kind, cur.as_f64() + delta);
                self.write_value(var, RuntimeValue::Number(result))
            }
            Op::IncrementIntUnrestricted => {
                // Loop-counter fast path: skips the readonly check entirely
                // (spec §4.1) because the compiler only ever emits this for
                // provably non-readonly loop counters.
                let var = lhs.as_ref().expect("var");
                let cur = Self::as_number(&self.resolve_read(var), "var")?;
                let result = Number::from_kind(cur.kind, cur.as_f64() + 1.0);
                match var {
                    Value::Temp { register_index, .. } => self.set_local(*register_index as usize, RuntimeValue::Number(result)),
                    Value::Variable { register_index, is_global, .. } => {
                        if *is_global {
                            self.set_global_reg(*register_index as usize, RuntimeValue::Number(result));
                        } else {
                            self.set_local(*register_index as usize, RuntimeValue::Number(result));
                        }
                    }
                    _ => {}
                }
                Ok(())
            }

            Op::Not => {
                let a = self.resolve_read(rhs.as_ref().expect("operand"));
                self.write_value(lhs.as_ref().expect("dst"), RuntimeValue::Boolean(!a.is_truthy()))
            }
            Op::And => {
                let a = self.resolve_read(rhs.as_ref().expect("lhs"));
                let b = self.resolve_read(rhs2.as_ref().expect("rhs"));
                self.write_value(lhs.as_ref().expect("dst"), RuntimeValue::Boolean(a.is_truthy() && b.is_truthy()))
            }
            Op::Or => {
                let a = self.resolve_read(rhs.as_ref().expect("lhs"));
                let b = self.resolve_read(rhs2.as_ref().expect("rhs"));
                self.write_value(lhs.as_ref().expect("dst"), RuntimeValue::Boolean(a.is_truthy() || b.is_truthy()))
            }
            Op::Equal | Op::NotEqual | Op::LessThan | Op::GreaterThan | Op::LessEqual | Op::GreaterEqual => {
                let a = self.resolve_read(rhs.as_ref().expect("lhs"));
                let b = self.resolve_read(rhs2.as_ref().expect("rhs"));
                let result = compare(op, &a, &b)?;
                self.write_value(lhs.as_ref().expect("dst"), RuntimeValue::Boolean(result))
            }

            Op::BitwiseAnd | Op::BitwiseOr | Op::BitwiseXor | Op::LShift | Op::RShift => {
                let a = Self::as_number(&self.resolve_read(rhs.as_ref().expect("lhs")), "lhs")?.as_i64();
                let b = Self::as_number(&self.resolve_read(rhs2.as_ref().expect("rhs")), "rhs")?.as_i64();
                let result = match op {
                    Op::BitwiseAnd => a & b,
                    Op::BitwiseOr => a | b,
                    Op::BitwiseXor => a ^ b,
                    Op::LShift => a << (b & 63),
                    Op::RShift => a >> (b & 63),
                    _ => unreachable!(),
                };
                self.write_value(lhs.as_ref().expect("dst"), RuntimeValue::Number(Number::int64(result)))
            }
            Op::BitwiseNot => {
                let a = Self::as_number(&self.resolve_read(rhs.as_ref().expect("operand")), "operand")?.as_i64();
                self.write_value(lhs.as_ref().expect("dst"), RuntimeValue::Number(Number::int64(!a)))
            }

            Op::NewIterator => self.op_new_iterator(lhs, rhs),
            Op::IterNext => self.op_iter_next(idx, lhs, rhs, rhs2),

            Op::PushParam => {
                let v = self.resolve_read(lhs.as_ref().expect("pushed value"));
                self.operand_stack.push(v);
                Ok(())
            }
            Op::PushTwoParams | Op::PushThreeParams | Op::PushFourParams => {
                for slot in [&lhs, &rhs, &rhs2, &rhs3] {
                    if let Some(v) = slot {
                        let rv = self.resolve_read(v);
                        self.operand_stack.push(rv);
                    }
                }
                Ok(())
            }
            Op::LoadAddress => self.op_load_address(lhs, rhs),
            Op::CallFunction | Op::CallStatic => self.op_call_function(idx, lhs, rhs, rhs2),
            Op::CallMethod => self.op_call_method(lhs, rhs, rhs2, rhs3),
            Op::NewLambda => {
                if let Some(Value::Lambda(f)) = rhs.clone() {
                    let closure = RuntimeValue::Object(Rc::new(HeapObject::Closure(f)));
                    self.write_value(lhs.as_ref().expect("dst"), closure)
                } else {
                    Err(RuntimeError::TypeMismatch { expected: "lambda descriptor".into(), found: "other".into() })
                }
            }

            Op::NewInstance => self.op_new_instance(lhs, rhs),
            Op::GetField => self.op_get_field(lhs, rhs, rhs2),
            Op::SetField => self.op_set_field(lhs, rhs, rhs2),
            Op::GetStatic => self.op_get_static(lhs, rhs, rhs2),
            Op::SetStatic => self.op_set_static(lhs, rhs, rhs2),
            Op::ToString => {
                let a = self.resolve_read(rhs.as_ref().expect("operand"));
                self.write_value(lhs.as_ref().expect("dst"), RuntimeValue::from_str(a.display()))
            }
            Op::GetType => {
                let a = self.resolve_read(rhs.as_ref().expect("operand"));
                self.write_value(lhs.as_ref().expect("dst"), RuntimeValue::from_str(a.type_name()))
            }

            Op::NewList => {
                let list = self.list_pool.acquire(
                    || Rc::new(HeapObject::List(RefCell::new(Vec::new()))),
                    |rc: &mut Rc<HeapObject>| {
                        if let Some(HeapObject::List(cell)) = Rc::get_mut(rc) {
                            cell.borrow_mut().clear();
                        }
                    },
                );
                self.write_value(lhs.as_ref().expect("dst"), RuntimeValue::Object(list))
            }
            Op::NewRange => self.op_new_range(lhs, rhs, rhs2),
            Op::PushElement => self.op_push_element(lhs, rhs),
            Op::GetElement => self.op_get_element(idx, lhs, rhs, rhs2),
            Op::SetElement => self.op_set_element(lhs, rhs, rhs2),
            Op::GetLength => self.op_get_length(lhs, rhs),

            Op::TryBlock => {
                if let Some(Value::TryCatch { catch_address, .. }) = lhs {
                    self.cur_frame_mut().try_handlers.push(TryHandler {
                        catch_address,
                        operand_stack_depth: self.operand_stack.len(),
                    });
                }
                Ok(())
            }
            Op::CatchBlock => {
                self.cur_frame_mut().try_handlers.pop();
                Ok(())
            }
        }
    }

    fn op_new_iterator(&mut self, lhs: Option<Value>, rhs: Option<Value>) -> Result<(), RuntimeError> {
        let source = self.resolve_read(rhs.as_ref().expect("iterable"));
        let (cursor, direction) = match &source {
            RuntimeValue::Object(o) => match o.as_ref() {
                HeapObject::Range(r) => (r.start, r.direction),
                _ => (0, IterDirection::Ascending),
            },
            _ => (0, IterDirection::Ascending),
        };
        let iter_obj = IteratorObj { source, cursor, direction, exhausted: false };
        self.write_value(
            lhs.as_ref().expect("dst"),
            RuntimeValue::Object(Rc::new(HeapObject::Iterator(RefCell::new(iter_obj)))),
        )
    }

    /// Advance one iterator step given its source, cursor and direction.
    /// Shared by the generic dispatch (which must handle every source
    /// shape) and `IterNextFast` (Range/List only, spec §4.3).
    fn iter_advance(source: &RuntimeValue, cur: i64, direction: IterDirection) -> (RuntimeValue, bool, i64) {
        match source {
            RuntimeValue::Object(o) => match o.as_ref() {
                HeapObject::Range(r) => {
                    let within = match direction {
                        IterDirection::Ascending => cur <= r.end,
                        IterDirection::Descending => cur >= r.end,
                    };
                    if within {
                        let next = match direction {
                            IterDirection::Ascending => cur + 1,
                            IterDirection::Descending => cur - 1,
                        };
                        (RuntimeValue::Number(Number::int64(cur)), true, next)
                    } else {
                        (RuntimeValue::Nil, false, cur)
                    }
                }
                HeapObject::List(list) => {
                    let items = list.borrow();
                    let idx = cur as usize;
                    if idx < items.len() {
                        (items[idx].clone(), true, cur + 1)
                    } else {
                        (RuntimeValue::Nil, false, cur)
                    }
                }
                HeapObject::Str(s) => match s.chars().nth(cur as usize) {
                    Some(ch) => (RuntimeValue::Object(Rc::new(HeapObject::Char(ch))), true, cur + 1),
                    None => (RuntimeValue::Nil, false, cur),
                },
                _ => (RuntimeValue::Nil, false, cur),
            },
            _ => (RuntimeValue::Nil, false, cur),
        }
    }

    fn op_iter_next(&mut self, idx: Addr, lhs: Option<Value>, rhs: Option<Value>, rhs2: Option<Value>) -> Result<(), RuntimeError> {
        let iter_val = self.resolve_read(rhs.as_ref().expect("iterator"));
        let RuntimeValue::Object(obj) = &iter_val else {
            return Err(RuntimeError::TypeMismatch { expected: "Iterator".into(), found: iter_val.type_name().to_string() });
        };
        let HeapObject::Iterator(cell) = obj.as_ref() else {
            return Err(RuntimeError::TypeMismatch { expected: "Iterator".into(), found: obj.type_name().to_string() });
        };
        let mut iter = cell.borrow_mut();
        if iter.exhausted {
            drop(iter);
            self.write_value(lhs.as_ref().expect("val dst"), RuntimeValue::Nil)?;
            return self.write_value(rhs2.as_ref().expect("flag dst"), RuntimeValue::Boolean(false));
        }
        let cur = iter.cursor;
        let direction = iter.direction;
        // Compute the next value and cursor entirely from owned/borrowed
        // reads first; `iter` itself is only mutated afterward, once every
        // borrow taken during this match has gone out of scope.
        let fast_shape = matches!(&iter.source, RuntimeValue::Object(o) if matches!(o.as_ref(), HeapObject::Range(_) | HeapObject::List(_)));
        let (value, has_more, next_cursor) = Self::iter_advance(&iter.source, cur, direction);
        iter.cursor = next_cursor;
        if !has_more {
            iter.exhausted = true;
        }
        drop(iter);
        self.write_value(lhs.as_ref().expect("val dst"), value)?;
        self.write_value(rhs2.as_ref().expect("flag dst"), RuntimeValue::Boolean(has_more))?;
        if fast_shape {
            self.try_specialize_iter_next(idx, lhs.as_ref().unwrap(), rhs.as_ref().unwrap(), rhs2.as_ref().unwrap());
        }
        Ok(())
    }

    fn op_new_range(&mut self, lhs: Option<Value>, rhs: Option<Value>, rhs2: Option<Value>) -> Result<(), RuntimeError> {
        let a = Self::as_number(&self.resolve_read(rhs.as_ref().expect("start")), "start")?.as_i64();
        let b = Self::as_number(&self.resolve_read(rhs2.as_ref().expect("end")), "end")?.as_i64();
        let direction = if b >= a { IterDirection::Ascending } else { IterDirection::Descending };
        let range = RangeObj { start: a, end: b, direction };
        self.write_value(lhs.as_ref().expect("dst"), RuntimeValue::Object(Rc::new(HeapObject::Range(range))))
    }

    fn op_push_element(&mut self, lhs: Option<Value>, rhs: Option<Value>) -> Result<(), RuntimeError> {
        let list_val = self.resolve_read(lhs.as_ref().expect("list"));
        let v = self.resolve_read(rhs.as_ref().expect("value"));
        match &list_val {
            RuntimeValue::Object(o) => match o.as_ref() {
                HeapObject::List(cell) => {
                    cell.borrow_mut().push(v);
                    Ok(())
                }
                _ => Err(RuntimeError::TypeMismatch { expected: "List".into(), found: o.type_name().to_string() }),
            },
            other => Err(RuntimeError::TypeMismatch { expected: "List".into(), found: other.type_name().to_string() }),
        }
    }

    fn op_get_element(&mut self, idx: Addr, lhs: Option<Value>, rhs: Option<Value>, rhs2: Option<Value>) -> Result<(), RuntimeError> {
        let coll = self.resolve_read(rhs.as_ref().expect("collection"));
        let elem_idx = Self::as_number(&self.resolve_read(rhs2.as_ref().expect("index")), "index")?.as_i64();
        let mut is_list = false;
        let value = match &coll {
            RuntimeValue::Object(o) => match o.as_ref() {
                HeapObject::List(cell) => {
                    is_list = true;
                    let items = cell.borrow();
                    let len = items.len();
                    if elem_idx < 0 || elem_idx as usize >= len {
                        return Err(RuntimeError::IndexOutOfRange { index: elem_idx, length: len });
                    }
                    items[elem_idx as usize].clone()
                }
                HeapObject::Str(s) => {
                    let len = s.chars().count();
                    if elem_idx < 0 || elem_idx as usize >= len {
                        return Err(RuntimeError::IndexOutOfRange { index: elem_idx, length: len });
                    }
                    RuntimeValue::Object(Rc::new(HeapObject::Char(s.chars().nth(elem_idx as usize).unwrap())))
                }
                _ => return Err(RuntimeError::TypeMismatch { expected: "List or String".into(), found: o.type_name().to_string() }),
            },
            other => return Err(RuntimeError::TypeMismatch { expected: "List or String".into(), found: other.type_name().to_string() }),
        };
        let dst = lhs.as_ref().expect("dst");
        self.write_value(dst, value)?;
        if is_list {
            self.try_specialize_element_access(idx, dst, rhs.as_ref().unwrap(), rhs2.as_ref().unwrap());
        }
        Ok(())
    }

    fn op_set_element(&mut self, lhs: Option<Value>, rhs: Option<Value>, rhs2: Option<Value>) -> Result<(), RuntimeError> {
        let coll = self.resolve_read(lhs.as_ref().expect("collection"));
        let idx = Self::as_number(&self.resolve_read(rhs.as_ref().expect("index")), "index")?.as_i64();
        let v = self.resolve_read(rhs2.as_ref().expect("value"));
        match &coll {
            RuntimeValue::Object(o) => match o.as_ref() {
                HeapObject::List(cell) => {
                    let mut items = cell.borrow_mut();
                    let len = items.len();
                    if idx < 0 || idx as usize >= len {
                        return Err(RuntimeError::IndexOutOfRange { index: idx, length: len });
                    }
                    items[idx as usize] = v;
                    Ok(())
                }
                _ => Err(RuntimeError::TypeMismatch { expected: "List".into(), found: o.type_name().to_string() }),
            },
            other => Err(RuntimeError::TypeMismatch { expected: "List".into(), found: other.type_name().to_string() }),
        }
    }

    fn op_get_length(&mut self, lhs: Option<Value>, rhs: Option<Value>) -> Result<(), RuntimeError> {
        let coll = self.resolve_read(rhs.as_ref().expect("collection"));
        let len = match &coll {
            RuntimeValue::Object(o) => match o.as_ref() {
                HeapObject::List(cell) => cell.borrow().len(),
                HeapObject::Str(s) => s.chars().count(),
                _ => return Err(RuntimeError::TypeMismatch { expected: "List or String".into(), found: o.type_name().to_string() }),
            },
            other => return Err(RuntimeError::TypeMismatch { expected: "List or String".into(), found: other.type_name().to_string() }),
        };
        self.write_value(lhs.as_ref().expect("dst"), RuntimeValue::Number(Number::int64(len as i64)))
    }

    fn op_new_instance(&mut self, lhs: Option<Value>, rhs: Option<Value>) -> Result<(), RuntimeError> {
        let name = match rhs {
            Some(Value::Str(s)) => s,
            _ => return Err(RuntimeError::TypeMismatch { expected: "struct name".into(), found: "other".into() }),
        };
        let instance = Instance { struct_name: Rc::from(name.as_str()), fields: RefCell::new(HashMap::new()) };
        self.write_value(lhs.as_ref().expect("dst"), RuntimeValue::Object(Rc::new(HeapObject::Instance(instance))))
    }

    fn op_get_field(&mut self, lhs: Option<Value>, rhs: Option<Value>, rhs2: Option<Value>) -> Result<(), RuntimeError> {
        let receiver = self.resolve_read(rhs.as_ref().expect("receiver"));
        let field = match rhs2 {
            Some(Value::Str(s)) => s,
            _ => return Err(RuntimeError::TypeMismatch { expected: "field name".into(), found: "other".into() }),
        };
        match &receiver {
            RuntimeValue::Object(o) => match o.as_ref() {
                HeapObject::Instance(inst) => {
                    let value = inst.fields.borrow().get(&field).cloned().unwrap_or(RuntimeValue::Nil);
                    self.write_value(lhs.as_ref().expect("dst"), value)
                }
                _ => Err(RuntimeError::TypeMismatch { expected: "Instance".into(), found: o.type_name().to_string() }),
            },
            other => Err(RuntimeError::TypeMismatch { expected: "Instance".into(), found: other.type_name().to_string() }),
        }
    }

    fn op_set_field(&mut self, lhs: Option<Value>, rhs: Option<Value>, rhs2: Option<Value>) -> Result<(), RuntimeError> {
        let receiver = self.resolve_read(lhs.as_ref().expect("receiver"));
        let field = match rhs {
            Some(Value::Str(s)) => s,
            _ => return Err(RuntimeError::TypeMismatch { expected: "field name".into(), found: "other".into() }),
        };
        let v = self.resolve_read(rhs2.as_ref().expect("value"));
        match &receiver {
            RuntimeValue::Object(o) => match o.as_ref() {
                HeapObject::Instance(inst) => {
                    inst.fields.borrow_mut().insert(field, v);
                    Ok(())
                }
                _ => Err(RuntimeError::TypeMismatch { expected: "Instance".into(), found: o.type_name().to_string() }),
            },
            other => Err(RuntimeError::TypeMismatch { expected: "Instance".into(), found: other.type_name().to_string() }),
        }
    }

    fn op_get_static(&mut self, lhs: Option<Value>, rhs: Option<Value>, rhs2: Option<Value>) -> Result<(), RuntimeError> {
        let (struct_name, field) = match (rhs, rhs2) {
            (Some(Value::Str(s)), Some(Value::Str(f))) => (s, f),
            _ => return Err(RuntimeError::TypeMismatch { expected: "struct/field names".into(), found: "other".into() }),
        };
        let key = symbol::mangle(&format!("{struct_name}::{field}"), 0);
        let value = self
            .symbols
            .structs
            .get(&struct_name)
            .and_then(|_| self.global_names.get(&key))
            .map(|&idx| self.get_global_reg(idx))
            .unwrap_or(RuntimeValue::Nil);
        self.write_value(lhs.as_ref().expect("dst"), value)
    }

    fn op_set_static(&mut self, lhs: Option<Value>, rhs: Option<Value>, rhs2: Option<Value>) -> Result<(), RuntimeError> {
        let (struct_name, field) = match (lhs, rhs) {
            (Some(Value::Str(s)), Some(Value::Str(f))) => (s, f),
            _ => return Err(RuntimeError::TypeMismatch { expected: "struct/field names".into(), found: "other".into() }),
        };
        let v = self.resolve_read(rhs2.as_ref().expect("value"));
        let key = symbol::mangle(&format!("{struct_name}::{field}"), 0);
        if let Some(&idx) = self.global_names.get(&key) {
            self.set_global_reg(idx, v);
        }
        Ok(())
    }

    fn op_load_address(&mut self, lhs: Option<Value>, rhs: Option<Value>) -> Result<(), RuntimeError> {
        let target = rhs.as_ref().expect("ref target");
        let refcell = match target {
            Value::Variable { register_index, is_global: true, .. } => {
                RefCell_ { frame_depth: GLOBAL_FRAME_DEPTH, register_index: *register_index }
            }
            Value::Variable { register_index, is_global: false, .. } | Value::Temp { register_index, .. } => {
                RefCell_ { frame_depth: self.frames.len().saturating_sub(1), register_index: *register_index }
            }
            _ => return Err(RuntimeError::TypeMismatch { expected: "variable".into(), found: "expression".into() }),
        };
        self.write_value(lhs.as_ref().expect("dst"), RuntimeValue::Object(Rc::new(HeapObject::RefCellValue(refcell))))
    }

    fn pop_args(&mut self, n: usize) -> Vec<RuntimeValue> {
        let start = self.operand_stack.len().saturating_sub(n);
        self.operand_stack.split_off(start)
    }

    fn op_call_function(&mut self, idx: Addr, lhs: Option<Value>, rhs: Option<Value>, rhs2: Option<Value>) -> Result<(), RuntimeError> {
        let is_static_target = matches!(rhs, Some(Value::Function(_)));
        let fn_value = match rhs {
            Some(Value::Function(f)) => f,
            Some(Value::Lambda(f)) => f,
            other => {
                let resolved = other.as_ref().map(|v| self.resolve_read(v)).unwrap_or(RuntimeValue::Nil);
                if let RuntimeValue::Object(o) = &resolved {
                    if let HeapObject::Closure(f) = o.as_ref() {
                        f.clone()
                    } else {
                        return Err(RuntimeError::TypeMismatch { expected: "Function".into(), found: o.type_name().to_string() });
                    }
                } else {
                    return Err(RuntimeError::UndefinedName { name: "<call target>".into() });
                }
            }
        };
        let argc = match rhs2 {
            Some(Value::Number(n)) => n as usize,
            _ => fn_value.arity,
        };
        if is_static_target {
            self.try_specialize_call(idx, fn_value.clone(), argc);
        }
        self.invoke(fn_value, lhs, argc)
    }

    fn op_call_method(
        &mut self,
        lhs: Option<Value>,
        rhs: Option<Value>,
        rhs2: Option<Value>,
        rhs3: Option<Value>,
    ) -> Result<(), RuntimeError> {
        let receiver = self.resolve_read(rhs.as_ref().expect("receiver"));
        let method_name = match rhs2 {
            Some(Value::Str(s)) => s,
            _ => return Err(RuntimeError::TypeMismatch { expected: "method name".into(), found: "other".into() }),
        };
        let argc = match rhs3 {
            Some(Value::Number(n)) => n as usize,
            _ => 0,
        };
        let RuntimeValue::Object(obj) = &receiver else {
            return Err(RuntimeError::TypeMismatch { expected: "Instance".into(), found: receiver.type_name().to_string() });
        };
        let HeapObject::Instance(inst) = obj.as_ref() else {
            return Err(RuntimeError::TypeMismatch { expected: "Instance".into(), found: obj.type_name().to_string() });
        };
        let struct_name = inst.struct_name.to_string();
        let method = self
            .symbols
            .structs
            .get(&struct_name)
            .and_then(|s| s.methods.get(&method_name))
            .map(|m| m.function.clone());
        let Some(method) = method else {
            return Err(RuntimeError::UndefinedName { name: format!("{struct_name}.{method_name}") });
        };
        self.operand_stack.push(receiver.clone());
        let fn_value = Rc::new(FunctionValue {
            name: method.display_name,
            start_address: method.start_address,
            end_address: method.end_address,
            arity: method.arity + 1,
            param_names: Vec::new(),
            ref_params: method.ref_params,
        });
        self.invoke(fn_value, lhs, argc + 1)
    }

    fn invoke(&mut self, fn_value: Rc<FunctionValue>, dst: Option<Value>, argc: usize) -> Result<(), RuntimeError> {
        let mut args = self.pop_args(argc);
        let register_count = symbol::mangle(&fn_value.name, fn_value.arity);
        let register_count = self
            .symbols
            .functions
            .get(&register_count)
            .map(|f| f.register_count)
            .unwrap_or_else(|| fn_value.param_names.len().max(args.len()).max(1));

        let caller_depth = self.frames.len().saturating_sub(1);
        let mut new_frame = self.frame_pool.acquire(
            || CallFrame {
                function_name: String::new(),
                return_ip: 0,
                dest_register: None,
                dest_is_global: false,
                registers: Vec::new(),
                solid_initialized: Vec::new(),
                ref_bindings: HashMap::new(),
                try_handlers: Vec::new(),
            },
            |_| {},
        );
        new_frame.reset(fn_value.name.clone(), self.ip, register_count);

        for (i, arg) in args.drain(..).enumerate() {
            let is_ref = fn_value.ref_params.get(i).copied().unwrap_or(false);
            if is_ref {
                if let RuntimeValue::Object(o) = &arg {
                    if let HeapObject::RefCellValue(refcell) = o.as_ref() {
                        let current = if refcell.frame_depth == GLOBAL_FRAME_DEPTH {
                            self.get_global_reg(refcell.register_index as usize)
                        } else {
                            self.frames
                                .get(refcell.frame_depth)
                                .and_then(|f| f.registers.get(refcell.register_index as usize))
                                .cloned()
                                .unwrap_or(RuntimeValue::Nil)
                        };
                        new_frame.registers[i] = current;
                        new_frame.ref_bindings.insert(
                            i,
                            RefCell_ { frame_depth: refcell.frame_depth, register_index: refcell.register_index },
                        );
                        continue;
                    }
                }
                return Err(RuntimeError::TypeMismatch { expected: "reference".into(), found: arg.type_name().to_string() });
            }
            new_frame.registers[i] = arg;
        }

        let (dest_register, dest_is_global) = match &dst {
            Some(Value::Temp { register_index, .. }) => (Some(*register_index as usize), false),
            Some(Value::Variable { register_index, is_global, .. }) => (Some(*register_index as usize), *is_global),
            _ => (None, false),
        };
        new_frame.dest_register = dest_register;
        new_frame.dest_is_global = dest_is_global;

        let _ = caller_depth;
        self.frames.push(new_frame);
        self.ip = fn_value.start_address;
        Ok(())
    }

    fn do_return(&mut self, value: Option<RuntimeValue>) -> Result<(), RuntimeError> {
        let Some(frame) = self.frames.pop() else {
            return Ok(());
        };
        let return_ip = frame.return_ip;
        let dest_register = frame.dest_register;
        let dest_is_global = frame.dest_is_global;
        let ref_bindings = frame.ref_bindings.clone();
        let final_registers = frame.registers.clone();
        self.frame_pool.release(frame);

        for (formal_reg, target) in ref_bindings {
            let value = final_registers.get(formal_reg).cloned().unwrap_or(RuntimeValue::Nil);
            if target.frame_depth == GLOBAL_FRAME_DEPTH {
                self.set_global_reg(target.register_index as usize, value);
            } else {
                self.set_frame_reg(target.frame_depth, target.register_index as usize, value);
            }
        }

        self.ip = return_ip;
        if let Some(reg) = dest_register {
            let v = value.unwrap_or(RuntimeValue::Nil);
            if dest_is_global {
                self.set_global_reg(reg, v);
            } else {
                self.set_local(reg, v);
            }
        }
        Ok(())
    }
}

fn numeric_literal(n: f64) -> Number {
    if n.fract() == 0.0 && n.abs() <= i32::MAX as f64 {
        Number::int32(n as i32)
    } else {
        Number::float64(n)
    }
}

fn compare(op: Op, a: &RuntimeValue, b: &RuntimeValue) -> Result<bool, RuntimeError> {
    match op {
        Op::Equal | Op::BranchIfEqual => Ok(a.value_eq(b)),
        Op::NotEqual | Op::BranchIfNotEqual => Ok(!a.value_eq(b)),
        Op::LessThan | Op::BranchIfLessThan => Ok(ordered(a, b)?.0 < ordered(a, b)?.1),
        Op::GreaterThan | Op::BranchIfGreaterThan => {
            let (x, y) = ordered(a, b)?;
            Ok(x > y)
        }
        Op::LessEqual | Op::BranchIfLessOrEqual => {
            let (x, y) = ordered(a, b)?;
            Ok(x <= y)
        }
        Op::GreaterEqual | Op::BranchIfGreaterOrEqual => {
            let (x, y) = ordered(a, b)?;
            Ok(x >= y)
        }
        _ => unreachable!("non-comparison op routed to compare()"),
    }
}

fn ordered(a: &RuntimeValue, b: &RuntimeValue) -> Result<(f64, f64), RuntimeError> {
    let x = a.as_number().ok_or_else(|| RuntimeError::TypeMismatch { expected: "Number".into(), found: a.type_name().to_string() })?;
    let y = b.as_number().ok_or_else(|| RuntimeError::TypeMismatch { expected: "Number".into(), found: b.type_name().to_string() })?;
    Ok((x.as_f64(), y.as_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::InstructionLine;

    fn local(reg: u32) -> Value {
        Value::Temp { id: reg, register_index: reg }
    }

    fn var(name: &str, reg: u32, solid: bool) -> Value {
        Value::Variable { name: name.to_string(), register_index: reg, is_global: true, solid }
    }

    fn make_vm(code: Vec<InstructionLine>, registers: usize) -> Vm {
        let mut conf = FluenceConf::defaults();
        conf.set("top_level_register_count", registers.to_string());
        Vm::new(code, SymbolTable::new(), 8, conf)
    }

    #[test]
    fn range_iteration_accumulates_expected_sum() {
        // s := 0; for i in 1..5 { s += i }  (sum 1..5 inclusive = 15)
        let code = vec![
            InstructionLine::new(Op::Assign).with_lhs(var("s", 0, false)).with_rhs(Value::Number(0.0)),
            InstructionLine::new(Op::NewRange).with_lhs(local(1)).with_rhs(Value::Number(1.0)).with_rhs2(Value::Number(5.0)),
            InstructionLine::new(Op::NewIterator).with_lhs(local(2)).with_rhs(local(1)),
            // loop: idx 3
            InstructionLine::new(Op::IterNext).with_lhs(local(3)).with_rhs(local(2)).with_rhs2(local(4)),
            {
                let mut i = InstructionLine::new(Op::GotoIfFalse);
                i.set_jump_target(7);
                i.rhs = Some(local(4));
                i
            },
            InstructionLine::new(Op::AddAssign).with_lhs(var("s", 0, false)).with_rhs(var("s", 0, false)).with_rhs2(local(3)),
            {
                let mut i = InstructionLine::new(Op::Goto);
                i.set_jump_target(3);
                i
            },
            InstructionLine::new(Op::Terminate),
        ];
        let mut vm = make_vm(code, 8);
        vm.run_until_done().unwrap();
        assert_eq!(vm.get_global_for_test(0), 15.0);
    }

    #[test]
    fn solid_variable_rejects_second_write() {
        let code = vec![
            InstructionLine::new(Op::Assign).with_lhs(var("x", 0, true)).with_rhs(Value::Number(3.0)),
            InstructionLine::new(Op::Assign).with_lhs(var("x", 0, true)).with_rhs(Value::Number(4.0)),
            InstructionLine::new(Op::Terminate),
        ];
        let mut vm = make_vm(code, 4);
        let result = vm.run_until_done();
        assert!(result.is_err());
        match result {
            Err(report) => assert!(matches!(report.source, RuntimeError::ReadonlyViolation { .. })),
            _ => unreachable!(),
        }
    }

    #[test]
    fn division_by_zero_inside_try_is_caught() {
        let code = vec![
            {
                let mut i = InstructionLine::new(Op::TryBlock);
                i.lhs = Some(Value::TryCatch { catch_address: 3, end_address: 4 });
                i
            },
            InstructionLine::new(Op::Div).with_lhs(local(0)).with_rhs(Value::Number(1.0)).with_rhs2(Value::Number(0.0)),
            {
                let mut i = InstructionLine::new(Op::Goto);
                i.set_jump_target(4);
                i
            },
            InstructionLine::new(Op::CatchBlock),
            InstructionLine::new(Op::Terminate),
        ];
        let mut vm = make_vm(code, 4);
        let result = vm.run_until_done();
        assert!(result.is_ok());
        assert_eq!(vm.state(), VmState::Finished);
    }

    impl Vm {
        fn get_global_for_test(&self, reg: usize) -> f64 {
            self.globals.get(reg).and_then(|v| v.as_number()).map(|n| n.as_f64()).unwrap_or(0.0)
        }
    }
}
