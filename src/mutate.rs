//! The staged mutator pipeline.
//!
//! Mutators run in three flavors, always in this global order: early
//! (before dependency resolution), bottom-up (a module's dependencies
//! have already been visited), then top-down. Within a pass mutators see
//! a snapshot of the graph; everything except variant splitting is
//! enqueued and committed at pass end in a deterministic order, and the
//! graph is re-checked for cycles at every pass boundary.

use std::any::Any;

use smol_str::SmolStr;
use tracing::{debug, info};

use crate::graph::{ModuleGraph, ModuleId, NameInterface, ResolveError};
use crate::module::DepTagRef;
use crate::parser::Property;
use crate::props::{self, PropertyReceiver};
use crate::registry::Registry;

pub type EarlyMutatorFn = Box<dyn Fn(&mut EarlyMutatorContext<'_, '_>) + Send + Sync>;
pub type BottomUpMutatorFn = Box<dyn Fn(&mut BottomUpMutatorContext<'_, '_>) + Send + Sync>;
pub type TopDownMutatorFn = Box<dyn Fn(&mut TopDownMutatorContext<'_, '_>) + Send + Sync>;

/// Everything a mutator pass needs mutable access to. The registry is
/// carried separately so its mutator closures can borrow it while a
/// context holds this state.
pub(crate) struct MutateState<'a> {
    pub graph: &'a mut ModuleGraph,
    pub names: &'a mut dyn NameInterface,
    pub config: &'a dyn Any,
    pub target_os: &'a str,
}

/// Side effects enqueued during a pass, committed at its end.
enum PendingOp {
    AddDep {
        from: ModuleId,
        name: SmolStr,
        variations: Vec<(SmolStr, SmolStr)>,
        tag: DepTagRef,
    },
    AddReverseDep {
        src: ModuleId,
        dest_name: SmolStr,
        tag: DepTagRef,
    },
    Replace {
        by: ModuleId,
        name: SmolStr,
    },
    Rename {
        module: ModuleId,
        new: SmolStr,
    },
    NewModule {
        requested_by: ModuleId,
        type_name: SmolStr,
        props: Vec<Property>,
    },
}

/// Shared behavior of all mutator contexts: module info access and the
/// per-module error slot.
macro_rules! common_context {
    ($ty:ident) => {
        impl $ty<'_, '_> {
            pub fn module_name(&self) -> SmolStr {
                self.state.graph.module_name(self.module).clone()
            }

            pub fn module_dir(&self) -> SmolStr {
                SmolStr::new(&self.state.graph.data(self.module).dir)
            }

            pub fn module_type(&self) -> SmolStr {
                self.state.graph.data(self.module).type_name.clone()
            }

            pub fn variations(&self) -> Vec<(SmolStr, SmolStr)> {
                self.state.graph.data(self.module).variations.clone()
            }

            pub fn properties(&self) -> &[PropertyReceiver] {
                &self.state.graph.data(self.module).receivers
            }

            pub fn properties_mut(&mut self) -> &mut [PropertyReceiver] {
                &mut self.state.graph.data_mut(self.module).receivers
            }

            /// Properties of another variant, for diverging the copies a
            /// split produced.
            pub fn variant_properties_mut(&mut self, id: ModuleId) -> &mut [PropertyReceiver] {
                &mut self.state.graph.data_mut(id).receivers
            }

            pub fn config(&self) -> &dyn Any {
                self.state.config
            }

            /// Record an error against the current module. The pass keeps
            /// running; accumulated errors fail the pipeline at pass end.
            pub fn errorf(&mut self, message: impl Into<String>) {
                let err = self.state.graph.module_error(self.module, message);
                self.state.graph.data_mut(self.module).errors.push(err);
            }
        }
    };
}

/// Context for early mutators, which run before dependency resolution
/// and may only split modules and adjust properties.
pub struct EarlyMutatorContext<'a, 'b> {
    state: &'b mut MutateState<'a>,
    module: ModuleId,
}

common_context!(EarlyMutatorContext);

impl EarlyMutatorContext<'_, '_> {
    /// Split the current module along a new dimension. Returns the
    /// variants in value order; the current module becomes the first.
    pub fn create_variations(&mut self, dim: &str, values: &[&str]) -> Vec<ModuleId> {
        split(self.state, self.module, dim, values, false)
    }

    pub fn create_local_variations(&mut self, dim: &str, values: &[&str]) -> Vec<ModuleId> {
        split(self.state, self.module, dim, values, true)
    }
}

/// Context for bottom-up mutators. The current module's dependencies
/// have already been visited in this pass.
pub struct BottomUpMutatorContext<'a, 'b> {
    state: &'b mut MutateState<'a>,
    module: ModuleId,
    pending: &'b mut Vec<PendingOp>,
}

common_context!(BottomUpMutatorContext);

impl BottomUpMutatorContext<'_, '_> {
    pub fn create_variations(&mut self, dim: &str, values: &[&str]) -> Vec<ModuleId> {
        split(self.state, self.module, dim, values, false)
    }

    pub fn create_local_variations(&mut self, dim: &str, values: &[&str]) -> Vec<ModuleId> {
        split(self.state, self.module, dim, values, true)
    }

    /// Add a dependency on `name`, resolved at pass end.
    pub fn add_dependency(&mut self, name: &str, tag: DepTagRef) {
        self.pending.push(PendingOp::AddDep {
            from: self.module,
            name: SmolStr::new(name),
            variations: Vec::new(),
            tag,
        });
    }

    /// Add a dependency on a specific variant of `name`. The pairs
    /// override automatic variant matching, which local splits require.
    pub fn add_variation_dependency(
        &mut self,
        variations: &[(&str, &str)],
        name: &str,
        tag: DepTagRef,
    ) {
        self.pending.push(PendingOp::AddDep {
            from: self.module,
            name: SmolStr::new(name),
            variations: variations
                .iter()
                .map(|(d, v)| (SmolStr::new(d), SmolStr::new(v)))
                .collect(),
            tag,
        });
    }

    /// Enqueue an edge from the module named `dest_name` to the current
    /// module. All reverse edges added during a pass are sorted by source
    /// module name and applied atomically at pass end.
    pub fn add_reverse_dependency(&mut self, dest_name: &str, tag: DepTagRef) {
        self.pending.push(PendingOp::AddReverseDep {
            src: self.module,
            dest_name: SmolStr::new(dest_name),
            tag,
        });
    }

    /// Redirect every edge targeting the identically-varianted module of
    /// `name` to the current module, at pass end.
    pub fn replace_dependencies(&mut self, name: &str) {
        self.pending.push(PendingOp::Replace {
            by: self.module,
            name: SmolStr::new(name),
        });
    }

    /// Change the current module's name. The new name becomes visible
    /// only after the pass completes.
    pub fn rename(&mut self, new_name: &str) {
        self.pending.push(PendingOp::Rename {
            module: self.module,
            new: SmolStr::new(new_name),
        });
    }

    /// Create a brand-new module at pass end. `props` is a synthesized
    /// property map in AST shape; [`crate::props::to_value`] helps build
    /// one from existing values.
    pub fn create_module(&mut self, type_name: &str, props: Vec<Property>) {
        self.pending.push(PendingOp::NewModule {
            requested_by: self.module,
            type_name: SmolStr::new(type_name),
            props,
        });
    }

    pub fn visit_direct_deps(&self, visit: impl FnMut(ModuleId, &dyn crate::module::DepTag)) {
        self.state.graph.visit_direct_deps(self.module, visit);
    }

    pub fn visit_deps_depth_first(
        &self,
        visit: impl FnMut(ModuleId, &dyn crate::module::DepTag),
    ) {
        self.state.graph.visit_deps_depth_first(self.module, visit);
    }

    pub fn graph(&self) -> &ModuleGraph {
        self.state.graph
    }
}

/// Context for top-down mutators. May create modules and walk transitive
/// dependencies, but may not split.
pub struct TopDownMutatorContext<'a, 'b> {
    state: &'b mut MutateState<'a>,
    module: ModuleId,
    pending: &'b mut Vec<PendingOp>,
}

common_context!(TopDownMutatorContext);

impl TopDownMutatorContext<'_, '_> {
    pub fn create_module(&mut self, type_name: &str, props: Vec<Property>) {
        self.pending.push(PendingOp::NewModule {
            requested_by: self.module,
            type_name: SmolStr::new(type_name),
            props,
        });
    }

    pub fn visit_direct_deps(&self, visit: impl FnMut(ModuleId, &dyn crate::module::DepTag)) {
        self.state.graph.visit_direct_deps(self.module, visit);
    }

    pub fn walk_deps(&self, visit: impl FnMut(ModuleId, ModuleId) -> bool) {
        self.state.graph.walk_deps(self.module, visit);
    }

    pub fn graph(&self) -> &ModuleGraph {
        self.state.graph
    }
}

fn split(
    state: &mut MutateState<'_>,
    module: ModuleId,
    dim: &str,
    values: &[&str],
    local: bool,
) -> Vec<ModuleId> {
    match state.graph.split_variants(module, dim, values, local) {
        Ok(ids) => ids,
        Err(e) => {
            let err = state.graph.module_error(module, e.to_string());
            state.graph.data_mut(module).errors.push(err);
            vec![module]
        }
    }
}

/// Run all early mutator passes, in registration order, over every
/// module in declaration order.
#[tracing::instrument(skip_all)]
pub(crate) fn run_early_mutators(
    state: &mut MutateState<'_>,
    registry: &Registry,
    errors: &mut Vec<ResolveError>,
) {
    for mutator in &registry.early_mutators {
        debug!("early mutator pass {:?}", mutator.name);
        let snapshot: Vec<ModuleId> = state.graph.modules().collect();
        for module in snapshot {
            let mut ctx = EarlyMutatorContext {
                state: &mut *state,
                module,
            };
            (mutator.func)(&mut ctx);
        }
        collect_module_errors(state.graph, errors);
    }
}

/// Run all bottom-up mutator passes over the resolved graph, then all
/// top-down passes. Each pass commits its side effects and re-checks for
/// cycles before the next begins.
#[tracing::instrument(skip_all)]
pub(crate) fn run_mutators(
    state: &mut MutateState<'_>,
    registry: &Registry,
    mut order: Vec<ModuleId>,
    errors: &mut Vec<ResolveError>,
) -> Vec<ModuleId> {
    for mutator in &registry.bottom_up_mutators {
        debug!("bottom-up mutator pass {:?}", mutator.name);
        let mut pending = Vec::new();
        for &module in &order {
            let mut ctx = BottomUpMutatorContext {
                state: &mut *state,
                module,
                pending: &mut pending,
            };
            (mutator.func)(&mut ctx);
        }
        order = end_pass(state, registry, pending, errors);
        if !errors.is_empty() {
            return order;
        }
    }

    for mutator in &registry.top_down_mutators {
        debug!("top-down mutator pass {:?}", mutator.name);
        let mut pending = Vec::new();
        for &module in order.iter().rev() {
            let mut ctx = TopDownMutatorContext {
                state: &mut *state,
                module,
                pending: &mut pending,
            };
            (mutator.func)(&mut ctx);
        }
        order = end_pass(state, registry, pending, errors);
        if !errors.is_empty() {
            return order;
        }
    }

    info!(
        modules = state.graph.module_count(),
        "mutator pipeline finished"
    );
    order
}

/// Commit a pass's side effects in deterministic order: new modules,
/// forward dependencies, reverse dependencies (sorted by source name),
/// replacements, renames. Then re-check for cycles.
fn end_pass(
    state: &mut MutateState<'_>,
    registry: &Registry,
    pending: Vec<PendingOp>,
    errors: &mut Vec<ResolveError>,
) -> Vec<ModuleId> {
    let mut add_deps = Vec::new();
    let mut reverse = Vec::new();
    let mut replaces = Vec::new();
    let mut renames = Vec::new();

    for op in pending {
        match op {
            PendingOp::NewModule {
                requested_by,
                type_name,
                props,
            } => create_module(state, registry, requested_by, &type_name, &props, errors),
            PendingOp::AddDep { .. } => add_deps.push(op),
            PendingOp::AddReverseDep {
                src,
                dest_name,
                tag,
            } => reverse.push((src, dest_name, tag)),
            PendingOp::Replace { by, name } => replaces.push((by, name)),
            PendingOp::Rename { module, new } => renames.push((module, new)),
        }
    }

    for op in add_deps {
        let PendingOp::AddDep {
            from,
            name,
            variations,
            tag,
        } = op
        else {
            unreachable!()
        };
        if let Err(e) = state
            .graph
            .add_dependency(from, &name, tag, &variations, state.names)
        {
            errors.push(e);
        }
    }

    // Reverse edges are applied in source-name order so the resulting
    // edge lists do not depend on mutator visit order.
    reverse.sort_by(|a, b| a.1.cmp(&b.1));
    for (src, dest_name, tag) in reverse {
        let src_variations = state.graph.data(src).variations.clone();
        let Some(group) = state.names.resolve(&state.graph.data(src).dir, &dest_name) else {
            let data = state.graph.data(src);
            errors.push(ResolveError::UnknownModule {
                file: data.file.clone(),
                line: data.line,
                module: state.graph.module_name(src).clone(),
                dep: dest_name,
            });
            continue;
        };
        let dest = state
            .graph
            .find_matching_variant(group, &src_variations, &[])
            .expect("default variant matching failed for a reverse dependency. This is a bug.");
        state
            .graph
            .data_mut(dest)
            .deps
            .push(crate::graph::Edge { target: src, tag });
    }

    for (by, name) in replaces {
        let Some(group) = state.names.resolve(&state.graph.data(by).dir, &name) else {
            errors.push(state.graph.module_error(by, format!(
                "cannot replace dependencies on unknown module {name:?}"
            )).into());
            continue;
        };
        let by_variations = state.graph.data(by).variations.clone();
        let target = state
            .graph
            .group(group)
            .variants
            .iter()
            .copied()
            .find(|&v| state.graph.data(v).variations == by_variations);
        let Some(target) = target else {
            errors.push(state.graph.module_error(by, format!(
                "no variant of {name:?} matches for dependency replacement"
            )).into());
            continue;
        };
        // The replacing module's own edges keep pointing at the original,
        // or the replacement would sever it from what it wraps.
        for id in state.graph.modules().collect::<Vec<_>>() {
            if id == by {
                continue;
            }
            for edge in &mut state.graph.data_mut(id).deps {
                if edge.target == target {
                    edge.target = by;
                }
            }
        }
        debug!("redirected dependencies on {name:?} to {}", state.graph.display_name(by));
    }

    for (module, new) in renames {
        let group = state.graph.data(module).group;
        let old = state.graph.group(group).name.clone();
        if let Err(_existing) = state.names.rename(&old, new.clone(), group) {
            errors.push(state.graph.module_error(module, format!(
                "cannot rename {old:?} to {new:?}: name is already taken"
            )).into());
            continue;
        }
        state.graph.groups[group.0].name = new;
    }

    collect_module_errors(state.graph, errors);

    match state.graph.check_cycles() {
        Ok(order) => order,
        Err(cycle_errors) => {
            errors.extend(cycle_errors);
            Vec::new()
        }
    }
}

fn create_module(
    state: &mut MutateState<'_>,
    registry: &Registry,
    requested_by: ModuleId,
    type_name: &SmolStr,
    props: &[Property],
    errors: &mut Vec<ResolveError>,
) {
    let Some(info) = registry.module_types.get(type_name) else {
        errors.push(state.graph.module_error(requested_by, format!(
            "cannot create module of unknown type {type_name:?}"
        )).into());
        return;
    };
    let new = (info.factory)();
    let bootstrap = info.bootstrap;

    let mut receivers = crate::engine::with_base_receiver(new.receivers);
    let mut bind_errors = Vec::new();
    let file = state.graph.data(requested_by).file.clone();
    props::bind(
        &mut receivers,
        props,
        &file,
        state.target_os,
        &mut bind_errors,
    );
    if !bind_errors.is_empty() {
        for e in bind_errors {
            errors.push(state.graph.module_error(requested_by, e.to_string()).into());
        }
        return;
    }

    let Some(name) = receivers[0].values().string("name").map(SmolStr::new) else {
        errors.push(state.graph.module_error(requested_by, format!(
            "created module of type {type_name:?} has no name"
        )).into());
        return;
    };
    let static_deps: Vec<SmolStr> = receivers[0]
        .values()
        .string_list("deps")
        .iter()
        .map(SmolStr::new)
        .collect();

    let dir = state.graph.data(requested_by).dir.clone();
    let line = state.graph.data(requested_by).line;
    let result = state.graph.add_module(
        name.clone(),
        |group| crate::graph::ModuleData {
            group,
            type_name: type_name.clone(),
            logic: new.logic,
            receivers,
            variations: Vec::new(),
            file,
            line,
            dir,
            static_deps: static_deps.clone(),
            deps: Vec::new(),
            missing: Vec::new(),
            errors: Vec::new(),
            bootstrap,
            scratch: Default::default(),
        },
        state.names,
    );
    let id = match result {
        Ok(id) => id,
        Err(e) => {
            errors.push(e);
            return;
        }
    };

    for dep in static_deps {
        let tag: DepTagRef = std::sync::Arc::new(crate::module::StaticDepTag);
        if let Err(e) = state.graph.add_dependency(id, &dep, tag, &[], state.names) {
            errors.push(e);
        }
    }
    debug!("created module {name} of type {type_name}");
}

/// Drain every module's error slot into the pass error list.
fn collect_module_errors(graph: &mut ModuleGraph, errors: &mut Vec<ResolveError>) {
    for id in 0..graph.module_count() {
        let slot = &mut graph.modules[id].errors;
        errors.extend(slot.drain(..).map(ResolveError::from));
    }
}
