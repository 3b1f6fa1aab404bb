/// Symbol tables & lexical scopes.
///
/// Grounded on `compiler.rs`'s `RegAlloc`/`GlobalTable` split: locals get a
/// stable register index at scope-resolution time, globals get an index
/// into the process-wide global array, and functions/structs get mangled
/// names (`name__arity`, spec §2/glossary "Mangling") so arity-overloaded
/// definitions coexist in one table. Register-count bookkeeping is also
/// what the optimizer consults when it walks "every scope" during
/// compaction (spec §4.2).

use std::collections::HashMap;

use crate::instruction::Addr;

/// Encode a base name with its arity so overloads-by-arity coexist.
pub fn mangle(name: &str, arity: usize) -> String {
    format!("{name}__{arity}")
}

#[derive(Debug, Clone)]
pub struct FunctionSymbol {
    pub mangled_name: String,
    pub display_name: String,
    pub arity: usize,
    pub start_address: Addr,
    pub end_address: Addr,
    pub register_count: usize,
    pub ref_params: Vec<bool>,
}

#[derive(Debug, Clone)]
pub struct MethodSymbol {
    pub function: FunctionSymbol,
    pub struct_name: String,
}

#[derive(Debug, Clone)]
pub struct StructSymbol {
    pub name: String,
    pub constructor: Option<FunctionSymbol>,
    pub methods: HashMap<String, MethodSymbol>,
    pub field_names: Vec<String>,
}

/// One local/global variable binding.
#[derive(Debug, Clone)]
pub struct VariableSymbol {
    pub name: String,
    pub register_index: usize,
    pub is_global: bool,
    /// `solid` per spec §3: writable exactly once, at declaration.
    pub solid: bool,
    pub initialized: bool,
}

/// A single lexical block: its own locals, layered over the enclosing
/// function's. Mirrors `RegAlloc`'s `push_scope`/`pop_scope` save-point,
/// generalized from a register high-water-mark to full symbol visibility.
#[derive(Debug, Default)]
struct Scope {
    locals: HashMap<String, VariableSymbol>,
}

/// Per-function register allocator + lexical scope chain.
///
/// One `FunctionScope` is live while the compiler is emitting a function
/// body; `finish()` hands back the register count the VM's call frame
/// must allocate (spec §4.4: "local register array sized to the
/// function's register count").
pub struct FunctionScope {
    scopes: Vec<Scope>,
    next_register: usize,
    high_water: usize,
    free_temps: Vec<usize>,
}

impl FunctionScope {
    pub fn new() -> Self {
        FunctionScope {
            scopes: vec![Scope::default()],
            next_register: 0,
            high_water: 0,
            free_temps: Vec::new(),
        }
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(Scope::default());
    }

    pub fn pop_scope(&mut self) {
        self.scopes.pop();
        assert!(!self.scopes.is_empty(), "popped the function's outermost scope");
    }

    fn bump_high_water(&mut self, reg: usize) {
        if reg + 1 > self.high_water {
            self.high_water = reg + 1;
        }
    }

    pub fn declare_local(&mut self, name: impl Into<String>, solid: bool) -> usize {
        let reg = self.next_register;
        self.next_register += 1;
        self.bump_high_water(reg);
        let name = name.into();
        self.scopes
            .last_mut()
            .expect("function scope never empty")
            .locals
            .insert(
                name.clone(),
                VariableSymbol {
                    name,
                    register_index: reg,
                    is_global: false,
                    solid,
                    initialized: false,
                },
            );
        reg
    }

    /// Allocate a scratch register for an intermediate value. Temps are
    /// reused via a free-list once their owning expression completes —
    /// `RegAlloc::alloc_temp`/`free_temp`'s pattern, generalized to also
    /// track the function-wide high-water mark the frame size needs.
    pub fn alloc_temp(&mut self) -> usize {
        if let Some(reg) = self.free_temps.pop() {
            return reg;
        }
        let reg = self.next_register;
        self.next_register += 1;
        self.bump_high_water(reg);
        reg
    }

    pub fn free_temp(&mut self, reg: usize) {
        self.free_temps.push(reg);
    }

    pub fn lookup_local(&self, name: &str) -> Option<&VariableSymbol> {
        for scope in self.scopes.iter().rev() {
            if let Some(sym) = scope.locals.get(name) {
                return Some(sym);
            }
        }
        None
    }

    pub fn lookup_local_mut(&mut self, name: &str) -> Option<&mut VariableSymbol> {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(sym) = scope.locals.get_mut(name) {
                return Some(sym);
            }
        }
        None
    }

    /// Register count the VM must allocate for this function's frame.
    pub fn register_count(&self) -> usize {
        self.high_water
    }
}

impl Default for FunctionScope {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide table: globals, functions (mangled by arity), structs.
/// Lives for the lifetime of the program; its address fields are the ones
/// the optimizer patches during compaction (spec §4.2 point 4).
#[derive(Debug, Default)]
pub struct SymbolTable {
    pub globals: HashMap<String, VariableSymbol>,
    pub functions: HashMap<String, FunctionSymbol>,
    pub structs: HashMap<String, StructSymbol>,
    next_global_register: usize,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    pub fn declare_global(&mut self, name: impl Into<String>, solid: bool) -> usize {
        let reg = self.next_global_register;
        self.next_global_register += 1;
        let name = name.into();
        self.globals.insert(
            name.clone(),
            VariableSymbol {
                name,
                register_index: reg,
                is_global: true,
                solid,
                initialized: false,
            },
        );
        reg
    }

    pub fn declare_function(&mut self, name: &str, arity: usize, sym: FunctionSymbol) {
        self.functions.insert(mangle(name, arity), sym);
    }

    pub fn lookup_function(&self, name: &str, arity: usize) -> Option<&FunctionSymbol> {
        self.functions.get(&mangle(name, arity))
    }

    /// Visit every `Addr` field reachable from this table — the exact set
    /// the optimizer's compaction pass must patch (spec §4.2: "all
    /// FunctionSymbol start/end, all struct constructors and methods,
    /// across global scope and every registered namespace").
    pub fn for_each_address_mut(&mut self, mut f: impl FnMut(&mut Addr)) {
        let mut visited: std::collections::HashSet<String> = std::collections::HashSet::new();
        for (key, func) in self.functions.iter_mut() {
            if visited.insert(key.clone()) {
                f(&mut func.start_address);
                f(&mut func.end_address);
            }
        }
        for strct in self.structs.values_mut() {
            if let Some(ctor) = &mut strct.constructor {
                let key = format!("{}::{}", strct.name, ctor.mangled_name);
                if visited.insert(key) {
                    f(&mut ctor.start_address);
                    f(&mut ctor.end_address);
                }
            }
            for (mname, method) in strct.methods.iter_mut() {
                let key = format!("{}::{}", strct.name, mname);
                if visited.insert(key) {
                    f(&mut method.function.start_address);
                    f(&mut method.function.end_address);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mangle_encodes_arity() {
        assert_eq!(mangle("fib", 1), "fib__1");
        assert_eq!(mangle("add", 2), "add__2");
    }

    #[test]
    fn temps_are_reused_from_the_free_list() {
        let mut scope = FunctionScope::new();
        let t0 = scope.alloc_temp();
        scope.free_temp(t0);
        let t1 = scope.alloc_temp();
        assert_eq!(t0, t1, "freed temp register should be recycled");
    }

    #[test]
    fn high_water_mark_reflects_peak_register_usage() {
        let mut scope = FunctionScope::new();
        scope.declare_local("a", false);
        let t = scope.alloc_temp();
        scope.free_temp(t);
        scope.declare_local("b", false);
        assert_eq!(scope.register_count(), 3);
    }

    #[test]
    fn inner_scope_shadows_outer_without_losing_it() {
        let mut scope = FunctionScope::new();
        scope.declare_local("x", false);
        scope.push_scope();
        scope.declare_local("x", false);
        let inner = scope.lookup_local("x").unwrap().register_index;
        scope.pop_scope();
        let outer = scope.lookup_local("x").unwrap().register_index;
        assert_ne!(inner, outer);
    }

    #[test]
    fn address_visitor_patches_every_function_exactly_once() {
        let mut table = SymbolTable::new();
        table.declare_function(
            "f",
            0,
            FunctionSymbol {
                mangled_name: mangle("f", 0),
                display_name: "f".into(),
                arity: 0,
                start_address: 10,
                end_address: 20,
                register_count: 1,
                ref_params: vec![],
            },
        );
        table.for_each_address_mut(|a| {
            if *a > 5 {
                *a -= 1;
            }
        });
        let f = table.lookup_function("f", 0).unwrap();
        assert_eq!((f.start_address, f.end_address), (9, 19));
    }
}
