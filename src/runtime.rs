/// Embedding facade: wires configuration and a compiled program together
/// into one `Vm` and exposes the per-instance host API (spec §6).
///
/// Grounded on the teacher's `runtime.rs` (`Runtime::new`/native-function
/// registration wiring a `VmCore` to a `conf::AxConf`), generalized from a
/// tree-walk runtime to one that owns a register `Vm`. `Compile`/
/// `CompileProject` accept an already-built instruction list and symbol
/// table rather than source text: the lexer/parser are external
/// collaborators (spec §1) this crate only consumes the contract of.

use std::time::Duration;

use crate::conf::FluenceConf;
use crate::errors::{CompileError, RuntimeErrorReport};
use crate::instruction::InstructionLine;
use crate::symbol::SymbolTable;
use crate::value::RuntimeValue;
use crate::vm::{Vm, VmState};

/// A compiled program: the instruction list, its symbol table, and the
/// number of global registers the table allocated. This is exactly what an
/// external lexer/parser/compiler must hand back (spec §1's "their
/// contracts with the core").
pub struct CompiledProgram {
    pub code: Vec<InstructionLine>,
    pub symbols: SymbolTable,
    pub global_register_count: usize,
}

/// One source file tracked by a multi-file project compile (spec §6
/// `CompileProject`); instructions reference files by index via
/// `DebugInfo::project_file_index`.
pub struct ProjectFile {
    pub path: String,
    pub source: String,
}

pub struct Runtime {
    conf: FluenceConf,
    vm: Option<Vm>,
    project_files: Vec<String>,
}

impl Runtime {
    pub fn new(conf: FluenceConf) -> Self {
        Runtime { conf, vm: None, project_files: Vec::new() }
    }

    pub fn with_defaults() -> Self {
        Runtime::new(FluenceConf::defaults())
    }

    pub fn conf(&self) -> &FluenceConf {
        &self.conf
    }

    pub fn conf_mut(&mut self) -> &mut FluenceConf {
        &mut self.conf
    }

    /// `Compile(source, allow_partial)` (spec §6). The core has no lexer or
    /// parser; an embedder that does owns the actual source-to-program step
    /// and calls this with the result. `allow_partial` is accepted for
    /// interface parity but unused here — partial-compile recovery is a
    /// front-end concern.
    pub fn compile(&mut self, program: CompiledProgram, _allow_partial: bool) -> Result<(), CompileError> {
        let vm = Vm::new(program.code, program.symbols, program.global_register_count, self.conf.clone());
        self.vm = Some(vm);
        Ok(())
    }

    /// `CompileProject(root_dir, allow_partial)`: multi-file variant. The
    /// file list becomes the project file-path table every instruction's
    /// `project_file_index` indexes into (spec §7).
    pub fn compile_project(
        &mut self,
        files: Vec<ProjectFile>,
        program: CompiledProgram,
        allow_partial: bool,
    ) -> Result<(), CompileError> {
        self.project_files = files.into_iter().map(|f| f.path).collect();
        self.compile(program, allow_partial)?;
        self.vm_mut().set_project_files(self.project_files.clone());
        Ok(())
    }

    pub fn project_files(&self) -> &[String] {
        &self.project_files
    }

    pub fn vm_mut(&mut self) -> &mut Vm {
        self.vm.as_mut().expect("Runtime::compile must be called before running")
    }

    pub fn run_until_done(&mut self) -> Result<(), RuntimeErrorReport> {
        self.vm_mut().run_until_done()
    }

    pub fn run_for(&mut self, budget: Duration) -> Result<(), RuntimeErrorReport> {
        self.vm_mut().run_for(budget)
    }

    pub fn stop(&mut self) {
        if let Some(vm) = self.vm.as_mut() {
            vm.stop();
        }
    }

    pub fn reset(&mut self) {
        if let Some(vm) = self.vm.as_mut() {
            vm.reset();
        }
    }

    pub fn state(&self) -> Option<VmState> {
        self.vm.as_ref().map(|v| v.state())
    }

    pub fn get_global(&self, name: &str) -> RuntimeValue {
        self.vm.as_ref().map(|v| v.get_global(name)).unwrap_or(RuntimeValue::Nil)
    }

    pub fn set_global(&mut self, name: &str, value: RuntimeValue) {
        self.vm_mut().set_global(name, value);
    }

    pub fn add_allowed_intrinsic_libraries(&mut self, names: impl IntoIterator<Item = String>) {
        self.vm_mut().add_allowed_intrinsic_libraries(names);
    }

    pub fn remove_allowed_intrinsic_libraries(&mut self, names: impl IntoIterator<Item = String>) {
        self.vm_mut().remove_allowed_intrinsic_libraries(names);
    }

    pub fn clear_allowed_intrinsic_libraries(&mut self) {
        self.vm_mut().clear_allowed_intrinsic_libraries();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Op;

    #[test]
    fn a_freshly_compiled_program_runs_to_completion() {
        let mut rt = Runtime::with_defaults();
        let code = vec![InstructionLine::new(Op::Terminate)];
        let program = CompiledProgram { code, symbols: SymbolTable::new(), global_register_count: 1 };
        rt.compile(program, false).unwrap();
        rt.run_until_done().unwrap();
        assert_eq!(rt.state(), Some(VmState::Finished));
    }

    #[test]
    fn set_global_then_get_global_round_trips() {
        let mut rt = Runtime::with_defaults();
        let code = vec![InstructionLine::new(Op::Terminate)];
        let program = CompiledProgram { code, symbols: SymbolTable::new(), global_register_count: 1 };
        rt.compile(program, false).unwrap();
        rt.vm_mut().register_global_name("counter", 0);
        rt.set_global("counter", RuntimeValue::from_str("hi"));
        assert_eq!(rt.get_global("counter").display(), "hi");
    }
}
