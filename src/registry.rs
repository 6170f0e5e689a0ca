//! Registration of module types, singletons, mutators and package
//! contexts.
//!
//! Registration is a one-shot operation: a [`Registry`] is populated
//! before parsing begins and then consumed by the engine, which makes
//! late registration impossible by construction.

use std::sync::Arc;

use indexmap::IndexMap;
use smol_str::SmolStr;

use crate::module::{Module, Singleton};
use crate::mutate::{BottomUpMutatorFn, EarlyMutatorFn, TopDownMutatorFn};
use crate::ninja_defs::{ComputedVar, PoolParams, RuleParams};
use crate::props::PropertyReceiver;

/// A freshly created module: its logic plus the receivers the binder
/// fills, in the order the factory wants them consulted.
pub struct NewModule {
    pub logic: Arc<dyn Module>,
    pub receivers: Vec<PropertyReceiver>,
}

pub type ModuleFactory = Box<dyn Fn() -> NewModule + Send + Sync>;
pub type SingletonFactory = Box<dyn Fn() -> Arc<dyn Singleton> + Send + Sync>;

pub(crate) struct ModuleTypeInfo {
    pub factory: ModuleFactory,
    /// Whether modules of this type participate in the primary stage.
    pub bootstrap: bool,
}

pub(crate) struct MutatorInfo<F> {
    pub name: SmolStr,
    pub func: F,
}

/// A handle to a registered package context, used by generators to scope
/// their emissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageId(pub(crate) usize);

pub(crate) enum PackageVar {
    Literal(String),
    Computed(ComputedVar),
}

pub(crate) struct PackageDef {
    pub path: SmolStr,
    pub imports: Vec<SmolStr>,
    pub vars: Vec<(SmolStr, PackageVar)>,
    pub rules: Vec<(SmolStr, RuleParams, Vec<SmolStr>)>,
    pub pools: Vec<(SmolStr, PoolParams)>,
}

/// The registry a primary builder populates before handing control to the
/// engine.
#[derive(Default)]
pub struct Registry {
    pub(crate) module_types: IndexMap<SmolStr, ModuleTypeInfo>,
    pub(crate) singletons: Vec<(SmolStr, SingletonFactory)>,
    pub(crate) early_mutators: Vec<MutatorInfo<EarlyMutatorFn>>,
    pub(crate) bottom_up_mutators: Vec<MutatorInfo<BottomUpMutatorFn>>,
    pub(crate) top_down_mutators: Vec<MutatorInfo<TopDownMutatorFn>>,
    pub(crate) packages: Vec<PackageDef>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module type. Panics on a duplicate type name: type
    /// registration happens at startup, before any user input is read.
    pub fn register_module_type(
        &mut self,
        name: &str,
        factory: impl Fn() -> NewModule + Send + Sync + 'static,
    ) {
        self.insert_module_type(name, Box::new(factory), false);
    }

    /// Register a module type that participates in the primary stage.
    pub fn register_bootstrap_module_type(
        &mut self,
        name: &str,
        factory: impl Fn() -> NewModule + Send + Sync + 'static,
    ) {
        self.insert_module_type(name, Box::new(factory), true);
    }

    fn insert_module_type(&mut self, name: &str, factory: ModuleFactory, bootstrap: bool) {
        let prev = self
            .module_types
            .insert(SmolStr::new(name), ModuleTypeInfo { factory, bootstrap });
        if prev.is_some() {
            panic!("module type {name:?} registered twice");
        }
    }

    /// Register a singleton. Singletons run after all modules, in
    /// registration order.
    pub fn register_singleton(
        &mut self,
        name: &str,
        factory: impl Fn() -> Arc<dyn Singleton> + Send + Sync + 'static,
    ) {
        if self.singletons.iter().any(|(n, _)| n == name) {
            panic!("singleton {name:?} registered twice");
        }
        self.singletons.push((SmolStr::new(name), Box::new(factory)));
    }

    /// Register a mutator that runs before dependency resolution.
    /// Registration order is execution order.
    pub fn register_early_mutator(&mut self, name: &str, func: EarlyMutatorFn) {
        check_mutator_name(&self.early_mutators, name);
        self.early_mutators.push(MutatorInfo {
            name: SmolStr::new(name),
            func,
        });
    }

    /// Register a mutator that runs bottom-up over the resolved graph.
    pub fn register_bottom_up_mutator(&mut self, name: &str, func: BottomUpMutatorFn) {
        check_mutator_name(&self.bottom_up_mutators, name);
        self.bottom_up_mutators.push(MutatorInfo {
            name: SmolStr::new(name),
            func,
        });
    }

    /// Register a mutator that runs top-down after all bottom-up passes.
    pub fn register_top_down_mutator(&mut self, name: &str, func: TopDownMutatorFn) {
        check_mutator_name(&self.top_down_mutators, name);
        self.top_down_mutators.push(MutatorInfo {
            name: SmolStr::new(name),
            func,
        });
    }

    /// Declare a package context. The returned handle scopes variable,
    /// rule and pool definitions and generator emissions.
    pub fn package(&mut self, path: &str) -> PackageId {
        if let Some(i) = self.packages.iter().position(|p| p.path == path) {
            return PackageId(i);
        }
        self.packages.push(PackageDef {
            path: SmolStr::new(path),
            imports: Vec::new(),
            vars: Vec::new(),
            rules: Vec::new(),
            pools: Vec::new(),
        });
        PackageId(self.packages.len() - 1)
    }

    /// Make another package's definitions addressable as
    /// `${other.name}` from strings parsed in `pkg`.
    pub fn import(&mut self, pkg: PackageId, other_path: &str) {
        self.packages[pkg.0].imports.push(SmolStr::new(other_path));
    }

    /// Define a constant-string variable in a package.
    pub fn static_variable(&mut self, pkg: PackageId, name: &str, value: &str) {
        self.packages[pkg.0]
            .vars
            .push((SmolStr::new(name), PackageVar::Literal(value.to_string())));
    }

    /// Define a variable computed from the configuration object at
    /// emission time.
    pub fn variable_func(&mut self, pkg: PackageId, name: &str, func: ComputedVar) {
        self.packages[pkg.0]
            .vars
            .push((SmolStr::new(name), PackageVar::Computed(func)));
    }

    /// Define a rule in a package. `args` lists the argument names build
    /// statements of this rule may set.
    pub fn static_rule(&mut self, pkg: PackageId, name: &str, params: RuleParams, args: &[&str]) {
        self.packages[pkg.0].rules.push((
            SmolStr::new(name),
            params,
            args.iter().map(|a| SmolStr::new(a)).collect(),
        ));
    }

    /// Define a pool in a package.
    pub fn static_pool(&mut self, pkg: PackageId, name: &str, params: PoolParams) {
        self.packages[pkg.0].pools.push((SmolStr::new(name), params));
    }
}

fn check_mutator_name<F>(list: &[MutatorInfo<F>], name: &str) {
    if list.iter().any(|m| m.name == name) {
        panic!("mutator {name:?} registered twice");
    }
}
