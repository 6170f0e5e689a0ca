//! The engine: owns every table and drives the phases in order.
//!
//! Parse Blueprints files into the module table, bind properties, run
//! early mutators, resolve dependencies, run the mutator pipeline, run
//! generators, then serialize. Each phase accumulates user errors and
//! reports them in bulk, so one run surfaces as many problems as it can.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use smol_str::SmolStr;
use tracing::info;

use crate::config::Config;
use crate::generate::{GenShared, LocalActions, PackageInfo, run_generators};
use crate::glob::{GlobCache, GlobError, GlobResult};
use crate::graph::{
    ModuleData, ModuleError, ModuleGraph, ModuleId, NameInterface, ResolveError,
    SimpleNameInterface,
};
use crate::module::Singleton;
use crate::mutate::{self, MutateState};
use crate::ninja_defs::{
    Definitions, PoolDef, RuleDef, RuleParams, VariableDef, VariableId, VariableValue,
};
use crate::ninja_string::{NinjaString, NinjaStringError, VarLookup};
use crate::ninja_writer::{self, WriteError};
use crate::parser::{self, Definition, ParseError};
use crate::props::{self, BindError, PropertyReceiver, PropertySchema};
use crate::registry::{PackageVar, Registry};
use crate::scope::{Def, ROOT_SCOPE, ScopeError, ScopeTable};
use crate::source::SourceTree;

/// Any user-visible error the engine can produce.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error("package {package}: {name}: {source}")]
    PackageDef {
        package: SmolStr,
        name: SmolStr,
        #[source]
        source: NinjaStringError,
    },

    #[error("package {package}: {source}")]
    PackageScope {
        package: SmolStr,
        #[source]
        source: ScopeError,
    },

    #[error("package {package} imports unregistered package {import}")]
    UnknownImport { package: SmolStr, import: SmolStr },

    #[error("package {package}: rule {rule} uses undefined pool {pool:?}")]
    UnknownPool {
        package: SmolStr,
        rule: SmolStr,
        pool: String,
    },

    #[error("{file}:{pos}: unknown module type {type_name:?}")]
    UnknownModuleType {
        file: SmolStr,
        pos: crate::parser::Pos,
        type_name: SmolStr,
    },

    #[error("{file}:{pos}: module is missing the name property")]
    MissingName {
        file: SmolStr,
        pos: crate::parser::Pos,
    },

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Glob(#[from] GlobError),

    #[error("{0}")]
    Controller(String),
}

/// The schema every module gets in front of its own receivers: the
/// module's name and its declarative dependencies.
fn base_schema() -> Arc<PropertySchema> {
    static SCHEMA: OnceLock<Arc<PropertySchema>> = OnceLock::new();
    SCHEMA
        .get_or_init(|| {
            PropertySchema::builder()
                .string("name")
                .string_list("deps")
                .build()
        })
        .clone()
}

pub(crate) fn with_base_receiver(receivers: Vec<PropertyReceiver>) -> Vec<PropertyReceiver> {
    let mut all = Vec::with_capacity(receivers.len() + 1);
    all.push(PropertyReceiver::new(base_schema()));
    all.extend(receivers);
    all
}

/// Resolves names in package-level definitions. `args` carries the
/// declared argument names when a rule body is being parsed; they and
/// the Ninja builtins pass through verbatim.
struct ScopeResolver<'a> {
    scopes: &'a ScopeTable,
    scope: crate::scope::ScopeId,
    args: &'a [SmolStr],
}

impl VarLookup for ScopeResolver<'_> {
    fn lookup_var(
        &self,
        pkg: Option<&str>,
        name: &str,
    ) -> Result<crate::ninja_string::Resolved, NinjaStringError> {
        use crate::ninja_string::Resolved;
        if let Some(pkg) = pkg {
            if self.scopes.import(self.scope, pkg).is_none() {
                return Err(NinjaStringError::PackageNotImported(SmolStr::new(pkg)));
            }
            return match self.scopes.lookup_qualified(self.scope, pkg, name) {
                Some(Def::Variable(id)) => Ok(Resolved::Variable(id)),
                _ => Err(NinjaStringError::UndefinedVariable(SmolStr::new(name))),
            };
        }
        if self.args.iter().any(|a| a == name) || crate::ninja_string::is_builtin(name) {
            return Ok(Resolved::Verbatim(SmolStr::new(name)));
        }
        match self.scopes.lookup(self.scope, name) {
            Some(Def::Variable(id)) => Ok(Resolved::Variable(id)),
            _ => Err(NinjaStringError::UndefinedVariable(SmolStr::new(name))),
        }
    }
}

/// The engine value a primary builder owns. Tests instantiate
/// independent engines; nothing here is process-global.
impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

pub struct Engine {
    registry: Registry,
    config: Config,
    user_config: Arc<dyn Any + Send + Sync>,
    source: Arc<dyn SourceTree>,
    scopes: ScopeTable,
    defs: Definitions,
    packages: Vec<PackageInfo>,
    graph: ModuleGraph,
    names: Box<dyn NameInterface>,
    glob: GlobCache,
    parsed_files: Vec<PathBuf>,
    actions: Vec<LocalActions>,
    subninjas: Vec<String>,
}

impl Engine {
    /// Materialize the registry's package contexts and produce an engine
    /// ready to parse. Fails if package definitions do not resolve.
    pub fn new(
        registry: Registry,
        config: Config,
        user_config: Arc<dyn Any + Send + Sync>,
        source: Arc<dyn SourceTree>,
    ) -> Result<Self, Vec<EngineError>> {
        let mut scopes = ScopeTable::new();
        let mut defs = Definitions::new();
        let mut errors: Vec<EngineError> = Vec::new();

        // The environment surface, visible to every rule.
        for (name, value) in [
            ("SRCDIR", config.srcdir.to_string_lossy().into_owned()),
            ("OUTDIR", config.outdir.to_string_lossy().into_owned()),
            ("TOP", config.top.to_string_lossy().into_owned()),
        ] {
            let id = defs.add_var(VariableDef {
                name: SmolStr::new_static(name),
                scope: ROOT_SCOPE,
                value: VariableValue::Literal(NinjaString::literal(value)),
            });
            scopes
                .add(ROOT_SCOPE, SmolStr::new_static(name), Def::Variable(id))
                .expect("fresh root scope rejected an environment variable. This is a bug.");
        }

        // Package scopes first, so imports can point anywhere.
        let mut packages = Vec::with_capacity(registry.packages.len());
        for def in &registry.packages {
            let scope = scopes.new_child(ROOT_SCOPE);
            packages.push(PackageInfo {
                path: def.path.clone(),
                scope,
            });
        }

        for (i, def) in registry.packages.iter().enumerate() {
            for import in &def.imports {
                let Some(target) = packages.iter().position(|p| p.path == *import) else {
                    errors.push(EngineError::UnknownImport {
                        package: def.path.clone(),
                        import: import.clone(),
                    });
                    continue;
                };
                let alias = import.rsplit('/').next().unwrap_or(import.as_str());
                if let Err(e) =
                    scopes.add_import(packages[i].scope, SmolStr::new(alias), packages[target].scope)
                {
                    errors.push(EngineError::PackageScope {
                        package: def.path.clone(),
                        source: e,
                    });
                }
            }
        }

        // Variables bind in one pass and parse in a second, so values
        // may reference variables defined later or in other packages.
        let mut var_ids: Vec<Vec<VariableId>> = Vec::with_capacity(registry.packages.len());
        for (i, def) in registry.packages.iter().enumerate() {
            let mut ids = Vec::with_capacity(def.vars.len());
            for (name, _) in &def.vars {
                let id = defs.add_var(VariableDef {
                    name: name.clone(),
                    scope: packages[i].scope,
                    value: VariableValue::Pending,
                });
                if let Err(e) = scopes.add(packages[i].scope, name.clone(), Def::Variable(id)) {
                    errors.push(EngineError::PackageScope {
                        package: def.path.clone(),
                        source: e,
                    });
                }
                ids.push(id);
            }
            var_ids.push(ids);
        }
        for (i, def) in registry.packages.iter().enumerate() {
            for (j, (name, value)) in def.vars.iter().enumerate() {
                let resolved = match value {
                    PackageVar::Computed(func) => VariableValue::Computed(func.clone()),
                    PackageVar::Literal(text) => {
                        let resolver = ScopeResolver {
                            scopes: &scopes,
                            scope: packages[i].scope,
                            args: &[],
                        };
                        match NinjaString::parse(text, &resolver) {
                            Ok(ns) => VariableValue::Literal(ns),
                            Err(e) => {
                                errors.push(EngineError::PackageDef {
                                    package: def.path.clone(),
                                    name: name.clone(),
                                    source: e,
                                });
                                continue;
                            }
                        }
                    }
                };
                defs.vars[var_ids[i][j].index()].value = resolved;
            }
        }

        // Pools before rules, so rules can name them.
        for (i, def) in registry.packages.iter().enumerate() {
            for (name, params) in &def.pools {
                let id = defs.add_pool(PoolDef {
                    name: name.clone(),
                    scope: packages[i].scope,
                    comment: params.comment.clone(),
                    depth: params.depth,
                });
                if let Err(e) = scopes.add(packages[i].scope, name.clone(), Def::Pool(id)) {
                    errors.push(EngineError::PackageScope {
                        package: def.path.clone(),
                        source: e,
                    });
                }
            }
        }

        for (i, def) in registry.packages.iter().enumerate() {
            for (name, params, args) in &def.rules {
                match materialize_rule(&scopes, packages[i].scope, &def.path, name, params, args) {
                    Ok(rule) => {
                        let id = defs.add_rule(rule);
                        if let Err(e) = scopes.add(packages[i].scope, name.clone(), Def::Rule(id)) {
                            errors.push(EngineError::PackageScope {
                                package: def.path.clone(),
                                source: e,
                            });
                        }
                    }
                    Err(e) => errors.push(e),
                }
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        let glob = GlobCache::new(&config.srcdir);
        Ok(Self {
            registry,
            config,
            user_config,
            source,
            scopes,
            defs,
            packages,
            graph: ModuleGraph::default(),
            names: Box::new(SimpleNameInterface::default()),
            glob,
            parsed_files: Vec::new(),
            actions: Vec::new(),
            subninjas: Vec::new(),
        })
    }

    /// Replace the default single-namespace name policy.
    pub fn set_name_interface(&mut self, names: Box<dyn NameInterface>) {
        assert!(
            self.graph.module_count() == 0,
            "name interface changed after modules were added. This is a bug."
        );
        self.names = names;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn glob_cache(&self) -> &GlobCache {
        &self.glob
    }

    /// Every Blueprints file parsed so far, for the generation depfile.
    pub fn parsed_files(&self) -> &[PathBuf] {
        &self.parsed_files
    }

    /// Extra file dependencies generators recorded.
    pub fn generated_file_deps(&self) -> Vec<String> {
        let mut deps: Vec<String> = self
            .actions
            .iter()
            .flat_map(|a| a.file_deps.iter().cloned())
            .collect();
        deps.sort();
        deps.dedup();
        deps
    }

    pub fn glob_results(&self) -> Vec<Arc<GlobResult>> {
        self.glob.results()
    }

    /// Include another manifest from the generated one.
    pub fn add_subninja(&mut self, path: impl Into<String>) {
        self.subninjas.push(path.into());
    }

    /// Resolve a module by name, for tests and singletons.
    pub fn module_by_name(&self, name: &str) -> Option<ModuleId> {
        let group = self.names.resolve("", name)?;
        Some(self.graph.group(group).variants[0])
    }

    /// All variants of a module, in creation order.
    pub fn module_variants(&self, name: &str) -> Vec<ModuleId> {
        match self.names.resolve("", name) {
            Some(group) => self.graph.group(group).variants.clone(),
            None => Vec::new(),
        }
    }

    pub fn graph(&self) -> &ModuleGraph {
        &self.graph
    }

    /// The registered module type names, in registration order.
    pub fn registered_module_types(&self) -> Vec<SmolStr> {
        self.registry.module_types.keys().cloned().collect()
    }

    /// Parse `root_files` and everything their directives reach, then
    /// create and bind one module per module call.
    #[tracing::instrument(skip_all)]
    pub fn parse_blueprints(&mut self, root_files: &[PathBuf]) -> Result<(), Vec<EngineError>> {
        let tree = parser::parse_tree(
            root_files,
            &self.config.srcdir,
            &self.config.blueprint_name,
            self.source.as_ref(),
        );
        let mut errors: Vec<EngineError> = tree.errors.into_iter().map(EngineError::from).collect();
        self.parsed_files.extend(tree.parsed);

        for file in &tree.files {
            let dir = Path::new(file.name.as_str())
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            for def in &file.defs {
                let Definition::Module(call) = def else {
                    continue;
                };
                let Some(info) = self.registry.module_types.get(&call.type_name) else {
                    errors.push(EngineError::UnknownModuleType {
                        file: file.name.clone(),
                        pos: call.type_pos,
                        type_name: call.type_name.clone(),
                    });
                    continue;
                };
                let new = (info.factory)();
                let bootstrap = info.bootstrap;
                let mut receivers = with_base_receiver(new.receivers);

                let mut bind_errors = Vec::new();
                props::bind(
                    &mut receivers,
                    &call.props,
                    &file.name,
                    self.config.target_os,
                    &mut bind_errors,
                );
                errors.extend(bind_errors.into_iter().map(EngineError::from));

                let Some(name) = receivers[0].values().string("name").map(SmolStr::new) else {
                    errors.push(EngineError::MissingName {
                        file: file.name.clone(),
                        pos: call.type_pos,
                    });
                    continue;
                };
                let static_deps: Vec<SmolStr> = receivers[0]
                    .values()
                    .string_list("deps")
                    .iter()
                    .map(SmolStr::new)
                    .collect();

                let result = self.graph.add_module(
                    name,
                    |group| ModuleData {
                        group,
                        type_name: call.type_name.clone(),
                        logic: new.logic,
                        receivers,
                        variations: Vec::new(),
                        file: file.name.clone(),
                        line: call.type_pos.line,
                        dir: SmolStr::new(&dir),
                        static_deps,
                        deps: Vec::new(),
                        missing: Vec::new(),
                        errors: Vec::new(),
                        bootstrap,
                        scratch: Default::default(),
                    },
                    self.names.as_mut(),
                );
                if let Err(e) = result {
                    errors.push(e.into());
                }
            }
        }

        info!(
            files = self.parsed_files.len(),
            modules = self.graph.module_count(),
            "blueprints parsed"
        );
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Run early mutators, resolve dependencies, check for cycles, then
    /// run the bottom-up and top-down mutator pipeline.
    #[tracing::instrument(skip_all)]
    pub fn resolve(&mut self) -> Result<(), Vec<EngineError>> {
        let mut errors: Vec<ResolveError> = Vec::new();

        let mut state = MutateState {
            graph: &mut self.graph,
            names: self.names.as_mut(),
            config: self.user_config.as_ref(),
            target_os: self.config.target_os,
        };
        mutate::run_early_mutators(&mut state, &self.registry, &mut errors);
        if !errors.is_empty() {
            return Err(errors.into_iter().map(EngineError::from).collect());
        }

        self.graph
            .resolve_dependencies(self.user_config.as_ref(), self.names.as_ref(), &mut errors);
        if !errors.is_empty() {
            return Err(errors.into_iter().map(EngineError::from).collect());
        }

        let order = match self.graph.check_cycles() {
            Ok(order) => order,
            Err(cycle_errors) => {
                return Err(cycle_errors.into_iter().map(EngineError::from).collect());
            }
        };

        let mut state = MutateState {
            graph: &mut self.graph,
            names: self.names.as_mut(),
            config: self.user_config.as_ref(),
            target_os: self.config.target_os,
        };
        let _order = mutate::run_mutators(&mut state, &self.registry, order, &mut errors);
        if !errors.is_empty() {
            return Err(errors.into_iter().map(EngineError::from).collect());
        }
        Ok(())
    }

    fn shared(&self) -> GenShared<'_> {
        GenShared {
            graph: &self.graph,
            defs: &self.defs,
            scopes: &self.scopes,
            packages: &self.packages,
            config: &self.config,
            user_config: self.user_config.as_ref(),
            glob: &self.glob,
            source: self.source.as_ref(),
            blueprint_files: &self.parsed_files,
        }
    }

    /// Run every module generator in dependency order, then singletons.
    #[tracing::instrument(skip_all)]
    pub fn generate(&mut self) -> Result<(), Vec<EngineError>> {
        let singletons: Vec<(SmolStr, Arc<dyn Singleton>)> = self
            .registry
            .singletons
            .iter()
            .map(|(name, factory)| (name.clone(), factory()))
            .collect();

        let mut errors: Vec<ModuleError> = Vec::new();
        let actions = run_generators(&self.shared(), &singletons, &mut errors);
        if !errors.is_empty() {
            return Err(errors.into_iter().map(EngineError::from).collect());
        }
        self.actions = actions;
        Ok(())
    }

    /// Render the manifest text.
    pub fn manifest(&self) -> Result<String, EngineError> {
        Ok(ninja_writer::emit(
            &self.shared(),
            &self.actions,
            &self.subninjas,
        )?)
    }

    /// Render and atomically write the manifest. Returns whether the
    /// file changed; unchanged files keep their mtime.
    pub fn write_manifest(&self, path: &Path) -> Result<bool, EngineError> {
        let contents = self.manifest()?;
        Ok(ninja_writer::write_ninja_file(path, &contents)?)
    }

    /// Every output path the generated build statements produce.
    pub fn target_files(&self) -> Vec<String> {
        ninja_writer::target_files(&self.shared(), &self.actions)
    }
}

fn materialize_rule(
    scopes: &ScopeTable,
    scope: crate::scope::ScopeId,
    package: &SmolStr,
    name: &SmolStr,
    params: &RuleParams,
    args: &[SmolStr],
) -> Result<RuleDef, EngineError> {
    let resolver = ScopeResolver {
        scopes,
        scope,
        args,
    };
    let parse = |s: &str| {
        NinjaString::parse(s, &resolver).map_err(|e| EngineError::PackageDef {
            package: package.clone(),
            name: name.clone(),
            source: e,
        })
    };
    let parse_opt = |s: &Option<String>| s.as_deref().map(parse).transpose();

    let pool = match &params.pool {
        None => None,
        Some(pool_name) => match scopes.lookup(scope, pool_name) {
            Some(Def::Pool(id)) => Some(id),
            _ => {
                return Err(EngineError::UnknownPool {
                    package: package.clone(),
                    rule: name.clone(),
                    pool: pool_name.clone(),
                });
            }
        },
    };

    Ok(RuleDef {
        name: name.clone(),
        scope,
        command: parse(&params.command)?,
        description: parse_opt(&params.description)?,
        depfile: parse_opt(&params.depfile)?,
        deps: params.deps,
        generator: params.generator,
        restat: params.restat,
        rspfile: parse_opt(&params.rspfile)?,
        rspfile_content: parse_opt(&params.rspfile_content)?,
        pool,
        args: args.iter().cloned().collect(),
    })
}
