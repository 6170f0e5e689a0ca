//! The build-action generation phase.
//!
//! Modules are dispatched to a worker pool as the generators of
//! everything they depend on complete, so `depends-on` implies
//! `ran-before`. Each invocation gets its own context and accumulates
//! rule, variable, pool and build definitions locally; the coordinator
//! merges them in module-declaration order once the phase drains, which
//! keeps emission deterministic regardless of completion order.
//!
//! Generators perform no I/O of their own: file-system access goes
//! through the glob cache, and all side effects are confined to the
//! context.

use std::any::Any;
use std::path::PathBuf;
use std::sync::{Arc, mpsc};

use indexmap::{IndexMap, IndexSet};
use rayon::Scope;
use smol_str::SmolStr;
use tracing::{debug, info};

use crate::config::Config;
use crate::glob::{GlobCache, GlobError, GlobResult};
use crate::graph::{ModuleError, ModuleGraph, ModuleId};
use crate::module::DepTag;
use crate::ninja_defs::{
    BuildDef, BuildParams, Definitions, DepsFormat, PHONY_RULE, PoolId, PoolParams, RuleId,
    RuleParams, VariableId,
};
use crate::ninja_string::{NinjaString, NinjaStringError, Resolved, VarLookup, is_builtin};
use crate::props::{BindError, PropertyReceiver};
use crate::registry::PackageId;
use crate::scope::{Def, ScopeError, ScopeId, ScopeTable};
use crate::source::SourceTree;

/// An error produced by a generator. Wrapped into the owning module's
/// error slot and surfaced in bulk at the end of the phase.
#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    NinjaString(#[from] NinjaStringError),

    #[error(transparent)]
    Glob(#[from] GlobError),

    #[error(transparent)]
    Scope(#[from] ScopeError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("build statement sets argument {arg:?} not declared by rule {rule:?}")]
    UnknownRuleArg { rule: SmolStr, arg: SmolStr },

    #[error("rule is not visible from this context")]
    RuleNotVisible,
}

impl GenerateError {
    pub fn msg(message: impl Into<String>) -> Self {
        GenerateError::Message(message.into())
    }
}

/// A package context known to the engine: its path and its scope.
#[derive(Debug)]
pub(crate) struct PackageInfo {
    pub path: SmolStr,
    pub scope: ScopeId,
}

/// State shared read-only by every generator invocation.
pub(crate) struct GenShared<'a> {
    pub graph: &'a ModuleGraph,
    pub defs: &'a Definitions,
    pub scopes: &'a ScopeTable,
    pub packages: &'a [PackageInfo],
    pub config: &'a Config,
    pub user_config: &'a (dyn Any + Send + Sync),
    pub glob: &'a GlobCache,
    pub source: &'a dyn SourceTree,
    pub blueprint_files: &'a [PathBuf],
}

/// Where a batch of emitted definitions came from.
#[derive(Debug, Clone)]
pub(crate) enum ActionOwner {
    Module(ModuleId),
    Singleton(SmolStr),
}

#[derive(Debug)]
pub(crate) struct LocalVar {
    pub name: SmolStr,
    pub value: NinjaString,
}

#[derive(Debug)]
pub(crate) struct LocalRule {
    pub name: SmolStr,
    pub scope: ScopeId,
    pub command: NinjaString,
    pub description: Option<NinjaString>,
    pub depfile: Option<NinjaString>,
    pub deps: DepsFormat,
    pub generator: bool,
    pub restat: bool,
    pub rspfile: Option<NinjaString>,
    pub rspfile_content: Option<NinjaString>,
    pub pool: Option<PoolId>,
    pub args: IndexSet<SmolStr>,
}

#[derive(Debug)]
pub(crate) struct LocalPool {
    pub name: SmolStr,
    pub comment: Option<String>,
    pub depth: i32,
}

/// Definitions emitted by one module or singleton. Ids minted here carry
/// the context's owner ordinal, so they never collide with another
/// context's and no locking is needed during the parallel phase.
#[derive(Debug)]
pub(crate) struct LocalActions {
    pub owner: u32,
    pub from: ActionOwner,
    pub vars: Vec<LocalVar>,
    pub rules: Vec<LocalRule>,
    pub pools: Vec<LocalPool>,
    pub builds: Vec<BuildDef>,
    /// Extra files generation depends on, fed into the depfile of the
    /// manifest-regeneration rule.
    pub file_deps: Vec<String>,
}

impl LocalActions {
    fn new(owner: u32, from: ActionOwner) -> Self {
        Self {
            owner,
            from,
            vars: Vec::new(),
            rules: Vec::new(),
            pools: Vec::new(),
            builds: Vec::new(),
            file_deps: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
            && self.rules.is_empty()
            && self.pools.is_empty()
            && self.builds.is_empty()
    }
}

/// Resolves names for strings parsed inside an emission context: rule
/// arguments pass through verbatim, local definitions shadow the
/// package scope, and Ninja's own builtins catch what is left.
struct LocalResolver<'a> {
    shared: &'a GenShared<'a>,
    scope: ScopeId,
    actions: &'a LocalActions,
    args: &'a [SmolStr],
}

impl VarLookup for LocalResolver<'_> {
    fn lookup_var(&self, pkg: Option<&str>, name: &str) -> Result<Resolved, NinjaStringError> {
        if let Some(pkg) = pkg {
            return match self.shared.scopes.lookup_qualified(self.scope, pkg, name) {
                Some(Def::Variable(id)) => Ok(Resolved::Variable(id)),
                Some(_) => Err(NinjaStringError::UndefinedVariable(SmolStr::new(name))),
                None => {
                    if self.shared.scopes.import(self.scope, pkg).is_none() {
                        Err(NinjaStringError::PackageNotImported(SmolStr::new(pkg)))
                    } else {
                        Err(NinjaStringError::UndefinedVariable(SmolStr::new(name)))
                    }
                }
            };
        }

        if self.args.iter().any(|a| a == name) {
            return Ok(Resolved::Verbatim(SmolStr::new(name)));
        }
        if let Some(idx) = self.actions.vars.iter().rposition(|v| v.name == name) {
            return Ok(Resolved::Variable(VariableId::new(self.actions.owner, idx)));
        }
        match self.shared.scopes.lookup(self.scope, name) {
            Some(Def::Variable(id)) => Ok(Resolved::Variable(id)),
            _ if is_builtin(name) => Ok(Resolved::Verbatim(SmolStr::new(name))),
            _ => Err(NinjaStringError::UndefinedVariable(SmolStr::new(name))),
        }
    }
}

/// Emit operations shared by module and singleton contexts.
macro_rules! emit_ops {
    ($ty:ident) => {
        impl $ty<'_> {
            fn package_scope(&self, pkg: PackageId) -> ScopeId {
                self.shared.packages[pkg.0].scope
            }

            fn parse(&self, pkg: PackageId, s: &str) -> Result<NinjaString, GenerateError> {
                self.parse_with(pkg, s, &[])
            }

            fn parse_with(
                &self,
                pkg: PackageId,
                s: &str,
                args: &[SmolStr],
            ) -> Result<NinjaString, GenerateError> {
                let resolver = LocalResolver {
                    shared: self.shared,
                    scope: self.package_scope(pkg),
                    actions: &self.actions,
                    args,
                };
                Ok(NinjaString::parse(s, &resolver)?)
            }

            /// Define a module-local (or singleton-local) variable.
            pub fn variable(
                &mut self,
                pkg: PackageId,
                name: &str,
                value: &str,
            ) -> Result<VariableId, GenerateError> {
                if self.actions.vars.iter().any(|v| v.name == name) {
                    return Err(GenerateError::msg(format!(
                        "variable {name:?} is already defined in this context"
                    )));
                }
                let value = self.parse(pkg, value)?;
                let id = VariableId::new(self.actions.owner, self.actions.vars.len());
                self.actions.vars.push(LocalVar {
                    name: SmolStr::new(name),
                    value,
                });
                Ok(id)
            }

            /// Define a local rule. `args` lists the argument names build
            /// statements of this rule may set.
            pub fn rule(
                &mut self,
                pkg: PackageId,
                name: &str,
                params: RuleParams,
                args: &[&str],
            ) -> Result<RuleId, GenerateError> {
                if self.actions.rules.iter().any(|r| r.name == name) {
                    return Err(GenerateError::msg(format!(
                        "rule {name:?} is already defined in this context"
                    )));
                }
                let scope = self.package_scope(pkg);
                let pool = match &params.pool {
                    None => None,
                    Some(pool_name) => {
                        match self.shared.scopes.lookup(scope, pool_name) {
                            Some(Def::Pool(id)) => Some(id),
                            _ => {
                                return Err(GenerateError::msg(format!(
                                    "pool {pool_name:?} is not defined"
                                )));
                            }
                        }
                    }
                };
                let arg_names: Vec<SmolStr> = args.iter().map(|a| SmolStr::new(a)).collect();
                let parse = |s: Option<&str>| -> Result<Option<NinjaString>, GenerateError> {
                    s.map(|s| self.parse_with(pkg, s, &arg_names)).transpose()
                };
                let rule = LocalRule {
                    name: SmolStr::new(name),
                    scope,
                    command: self.parse_with(pkg, &params.command, &arg_names)?,
                    description: parse(params.description.as_deref())?,
                    depfile: parse(params.depfile.as_deref())?,
                    deps: params.deps,
                    generator: params.generator,
                    restat: params.restat,
                    rspfile: parse(params.rspfile.as_deref())?,
                    rspfile_content: parse(params.rspfile_content.as_deref())?,
                    pool,
                    args: arg_names.into_iter().collect(),
                };
                let id = RuleId::new(self.actions.owner, self.actions.rules.len());
                self.actions.rules.push(rule);
                Ok(id)
            }

            /// Define a local pool.
            pub fn pool(
                &mut self,
                _pkg: PackageId,
                name: &str,
                params: PoolParams,
            ) -> Result<PoolId, GenerateError> {
                if self.actions.pools.iter().any(|p| p.name == name) {
                    return Err(GenerateError::msg(format!(
                        "pool {name:?} is already defined in this context"
                    )));
                }
                let id = PoolId::new(self.actions.owner, self.actions.pools.len());
                self.actions.pools.push(LocalPool {
                    name: SmolStr::new(name),
                    comment: params.comment,
                    depth: params.depth,
                });
                Ok(id)
            }

            /// Emit a build statement. The rule must be the built-in
            /// phony rule, a package rule, or a rule this context
            /// defined; its argument mapping is checked against the
            /// rule's declared argument names.
            pub fn build(
                &mut self,
                pkg: PackageId,
                rule: RuleId,
                params: BuildParams,
            ) -> Result<(), GenerateError> {
                let declared = if rule == PHONY_RULE {
                    None
                } else if rule.owner() == 0 {
                    Some(&self.shared.defs.rules[rule.index()].args)
                } else if rule.owner() == self.actions.owner {
                    Some(&self.actions.rules[rule.index()].args)
                } else {
                    return Err(GenerateError::RuleNotVisible);
                };
                if let Some(declared) = declared {
                    for (arg, _) in &params.args {
                        if !declared.contains(arg.as_str()) {
                            let name = if rule.owner() == 0 {
                                self.shared.defs.rules[rule.index()].name.clone()
                            } else {
                                self.actions.rules[rule.index()].name.clone()
                            };
                            return Err(GenerateError::UnknownRuleArg {
                                rule: name,
                                arg: SmolStr::new(arg),
                            });
                        }
                    }
                } else if !params.args.is_empty() {
                    return Err(GenerateError::msg(
                        "phony builds cannot set rule arguments".to_string(),
                    ));
                }

                let parse_all = |ctx: &Self, paths: &[String]| -> Result<Vec<NinjaString>, GenerateError> {
                    paths.iter().map(|p| ctx.parse(pkg, p)).collect()
                };

                let mut args = IndexMap::new();
                for (name, value) in &params.args {
                    args.insert(SmolStr::new(name), self.parse(pkg, value)?);
                }

                let build = BuildDef {
                    comment: params.comment.clone(),
                    rule,
                    outputs: parse_all(self, &params.outputs)?,
                    implicit_outputs: parse_all(self, &params.implicit_outputs)?,
                    inputs: parse_all(self, &params.inputs)?,
                    implicits: parse_all(self, &params.implicits)?,
                    order_only: parse_all(self, &params.order_only)?,
                    validations: parse_all(self, &params.validations)?,
                    args,
                    default: params.default,
                };
                self.actions.builds.push(build);
                Ok(())
            }

            /// Look up a rule defined statically in a package context.
            pub fn package_rule(
                &self,
                pkg: PackageId,
                name: &str,
            ) -> Result<RuleId, GenerateError> {
                match self.shared.scopes.lookup(self.package_scope(pkg), name) {
                    Some(Def::Rule(id)) => Ok(id),
                    _ => Err(GenerateError::msg(format!(
                        "rule {name:?} is not defined in package {:?}",
                        self.shared.packages[pkg.0].path
                    ))),
                }
            }

            /// Record an extra file the generated manifest depends on.
            pub fn add_ninja_file_deps(&mut self, deps: impl IntoIterator<Item = String>) {
                self.actions.file_deps.extend(deps);
            }

            /// Query the glob cache. The result is recorded and will be
            /// re-checked by the glob manifest on subsequent runs.
            pub fn glob(
                &self,
                pattern: &str,
                excludes: &[String],
            ) -> Result<Arc<GlobResult>, GenerateError> {
                Ok(self.shared.glob.glob_in(self.shared.source, pattern, excludes)?)
            }

            pub fn config(&self) -> &dyn Any {
                self.shared.user_config
            }

            pub fn engine_config(&self) -> &Config {
                self.shared.config
            }
        }
    };
}

/// The context handed to [`crate::module::Module::generate`].
pub struct ModuleContext<'a> {
    shared: &'a GenShared<'a>,
    module: ModuleId,
    actions: LocalActions,
}

emit_ops!(ModuleContext);

impl ModuleContext<'_> {
    pub fn module_name(&self) -> &SmolStr {
        self.shared.graph.module_name(self.module)
    }

    pub fn module_dir(&self) -> &str {
        &self.shared.graph.data(self.module).dir
    }

    pub fn module_type(&self) -> &SmolStr {
        &self.shared.graph.data(self.module).type_name
    }

    pub fn module_id(&self) -> ModuleId {
        self.module
    }

    pub fn variations(&self) -> &[(SmolStr, SmolStr)] {
        &self.shared.graph.data(self.module).variations
    }

    pub fn properties(&self) -> &[PropertyReceiver] {
        &self.shared.graph.data(self.module).receivers
    }

    /// The dependency names that failed to resolve, for modules that
    /// opted in to handling them.
    pub fn missing_deps(&self) -> &[SmolStr] {
        self.shared.graph.missing_deps(self.module)
    }

    pub fn visit_direct_deps(&self, visit: impl FnMut(ModuleId, &dyn DepTag)) {
        self.shared.graph.visit_direct_deps(self.module, visit);
    }

    pub fn visit_deps_depth_first(&self, visit: impl FnMut(ModuleId, &dyn DepTag)) {
        self.shared.graph.visit_deps_depth_first(self.module, visit);
    }

    pub fn dep_name(&self, dep: ModuleId) -> &SmolStr {
        self.shared.graph.module_name(dep)
    }

    pub fn dep_dir(&self, dep: ModuleId) -> &str {
        &self.shared.graph.data(dep).dir
    }

    pub fn dep_type(&self, dep: ModuleId) -> &SmolStr {
        &self.shared.graph.data(dep).type_name
    }

    pub fn dep_properties(&self, dep: ModuleId) -> &[PropertyReceiver] {
        &self.shared.graph.data(dep).receivers
    }

    /// Publish a fact about this module for its dependents to read.
    /// Dependents' generators are guaranteed to run after this one.
    pub fn publish(&self, key: &str, value: impl Into<String>) {
        self.shared
            .graph
            .data(self.module)
            .scratch
            .lock()
            .unwrap()
            .insert(SmolStr::new(key), value.into());
    }

    /// Read a fact a dependency published while generating.
    pub fn dep_published(&self, dep: ModuleId, key: &str) -> Option<String> {
        self.shared
            .graph
            .data(dep)
            .scratch
            .lock()
            .unwrap()
            .get(key)
            .cloned()
    }
}

/// The context handed to [`crate::module::Singleton::generate`].
/// Singletons run sequentially after every module has generated.
pub struct SingletonContext<'a> {
    shared: &'a GenShared<'a>,
    name: SmolStr,
    actions: LocalActions,
}

emit_ops!(SingletonContext);

impl SingletonContext<'_> {
    pub fn singleton_name(&self) -> &SmolStr {
        &self.name
    }

    /// Visit the first variant of every module group, in declaration
    /// order.
    pub fn visit_all_modules(&self, mut visit: impl FnMut(ModuleId)) {
        for group in 0..self.shared.graph.groups.len() {
            visit(self.shared.graph.groups[group].variants[0]);
        }
    }

    /// Visit every variant of every module.
    pub fn visit_all_module_variants(&self, mut visit: impl FnMut(ModuleId)) {
        for id in self.shared.graph.modules() {
            visit(id);
        }
    }

    pub fn module_name(&self, id: ModuleId) -> &SmolStr {
        self.shared.graph.module_name(id)
    }

    pub fn module_dir(&self, id: ModuleId) -> &str {
        &self.shared.graph.data(id).dir
    }

    pub fn module_type(&self, id: ModuleId) -> &SmolStr {
        &self.shared.graph.data(id).type_name
    }

    pub fn module_properties(&self, id: ModuleId) -> &[PropertyReceiver] {
        &self.shared.graph.data(id).receivers
    }

    pub fn module_published(&self, id: ModuleId, key: &str) -> Option<String> {
        self.shared
            .graph
            .data(id)
            .scratch
            .lock()
            .unwrap()
            .get(key)
            .cloned()
    }

    /// Every Blueprints file parsed this run.
    pub fn blueprint_files(&self) -> &[PathBuf] {
        self.shared.blueprint_files
    }

    /// Every glob observed so far, for wiring the manifest's
    /// regeneration dependencies.
    pub fn glob_results(&self) -> Vec<Arc<GlobResult>> {
        self.shared.glob.results()
    }
}

struct WorkerResult {
    module: ModuleId,
    actions: LocalActions,
    error: Option<GenerateError>,
}

/// Run every module generator, worker-pool parallel, respecting
/// dependency order; then run singletons sequentially. Returns the
/// emitted actions in deterministic module-declaration order.
#[tracing::instrument(skip_all)]
pub(crate) fn run_generators(
    shared: &GenShared<'_>,
    singletons: &[(SmolStr, Arc<dyn crate::module::Singleton>)],
    errors: &mut Vec<ModuleError>,
) -> Vec<LocalActions> {
    let graph = shared.graph;
    let module_count = graph.module_count();

    // Distinct-dependency counts and reverse adjacency drive the
    // in-degree-zero dispatch.
    let mut pending_deps: Vec<usize> = vec![0; module_count];
    let mut dependents: Vec<Vec<ModuleId>> = vec![Vec::new(); module_count];
    for id in graph.modules() {
        let mut distinct: IndexSet<ModuleId> = IndexSet::new();
        graph.visit_direct_deps(id, |dep, _| {
            distinct.insert(dep);
        });
        pending_deps[id.0] = distinct.len();
        for dep in distinct {
            dependents[dep.0].push(id);
        }
    }

    let mut pending: IndexSet<ModuleId> = graph
        .modules()
        .filter(|id| pending_deps[id.0] == 0)
        .collect();

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(shared.config.parallelism)
        .build()
        .expect("failed to build generator thread pool");

    let mut results: Vec<Option<LocalActions>> = Vec::with_capacity(module_count);
    results.resize_with(module_count, || None);

    let (tx, rx) = mpsc::channel::<WorkerResult>();
    pool.in_place_scope(|scope| {
        let mut running = 0usize;
        let mut finished = 0usize;

        loop {
            while let Some(id) = pending.pop() {
                start_module(shared, scope, id, tx.clone());
                running += 1;
            }

            if finished == module_count {
                break;
            }
            if running == 0 {
                panic!(
                    "no generators are running, but not all modules are finished. \
                     This is a bug."
                );
            }

            let msg = rx.recv().expect("generator channel closed unexpectedly");
            running -= 1;
            finished += 1;

            if let Some(error) = msg.error {
                errors.push(graph.module_error(msg.module, error.to_string()));
            }
            results[msg.module.0] = Some(msg.actions);

            for &dependent in &dependents[msg.module.0] {
                pending_deps[dependent.0] -= 1;
                if pending_deps[dependent.0] == 0 {
                    pending.insert(dependent);
                }
            }
        }
    });
    drop(tx);

    info!(modules = module_count, "module generation finished");

    // Merge in declaration order: group order, then variant order within
    // the group.
    let mut ordered: Vec<ModuleId> = graph.modules().collect();
    ordered.sort_by_key(|&id| {
        let group = graph.data(id).group;
        let position = graph
            .group(group)
            .variants
            .iter()
            .position(|&v| v == id)
            .expect("variant not listed in its group. This is a bug.");
        (group.0, position)
    });

    let mut actions: Vec<LocalActions> = ordered
        .into_iter()
        .map(|id| results[id.0].take().expect("missing generator result. This is a bug."))
        .collect();

    // Singletons run one at a time, after all modules.
    for (i, (name, singleton)) in singletons.iter().enumerate() {
        debug!("running singleton {name:?}");
        let owner = (module_count + i + 1) as u32;
        let mut ctx = SingletonContext {
            shared,
            name: name.clone(),
            actions: LocalActions::new(owner, ActionOwner::Singleton(name.clone())),
        };
        if let Err(e) = singleton.generate(&mut ctx) {
            errors.push(ModuleError {
                module: name.clone(),
                variant: String::new(),
                file: SmolStr::new_static("<singleton>"),
                line: 0,
                message: e.to_string(),
            });
        }
        actions.push(ctx.actions);
    }

    actions
}

fn start_module<'scope>(
    shared: &'scope GenShared<'scope>,
    scope: &Scope<'scope>,
    id: ModuleId,
    tx: mpsc::Sender<WorkerResult>,
) {
    scope.spawn(move |_| {
        let data = shared.graph.data(id);
        let owner = (id.0 + 1) as u32;
        let mut ctx = ModuleContext {
            shared,
            module: id,
            actions: LocalActions::new(owner, ActionOwner::Module(id)),
        };

        // Outside the bootstrap module set the primary stage treats
        // module types as opaque: parsed and resolved, but silent.
        let skip = shared.config.stage == crate::config::Stage::Primary && !data.bootstrap;
        let error = if skip {
            None
        } else {
            debug!("generating {}", shared.graph.display_name(id));
            data.logic.generate(&mut ctx).err()
        };

        tx.send(WorkerResult {
            module: id,
            actions: ctx.actions,
            error,
        })
        .expect("failed to send generator result");
    });
}
