//! The module graph: groups, variants, and tagged dependency edges.
//!
//! Modules are held in arenas and addressed by index, so edge rewriting
//! during mutation is cheap and never invalidates other references. A
//! group holds every variant of a logically-same module; a variant is
//! addressed by its ordered variation vector.

use std::any::Any;
use std::sync::{Arc, Mutex};

use indexmap::{IndexMap, IndexSet};
use petgraph::graph::{DiGraph, NodeIndex};
use smol_str::SmolStr;
use tracing::debug;

use crate::module::{DepTag, DepTagRef, Module, StaticDepTag};
use crate::props::PropertyReceiver;

/// An index that uniquely identifies a module variant in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub(crate) usize);

/// An index that uniquely identifies a module group in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub(crate) usize);

/// A directed dependency edge, carrying an opaque tag. Multiple edges
/// between the same pair with distinct tags are allowed.
#[derive(Debug, Clone)]
pub(crate) struct Edge {
    pub target: ModuleId,
    pub tag: DepTagRef,
}

/// An error charged to a specific module. Collected in the module's error
/// slot and surfaced in bulk at pass boundaries.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{file}:{line}: module {module:?}{variant}: {message}")]
pub struct ModuleError {
    pub module: SmolStr,
    pub variant: String,
    pub file: SmolStr,
    pub line: u32,
    pub message: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    #[error("{file}:{line}: module {module:?} depends on undefined module {dep:?}")]
    UnknownModule {
        file: SmolStr,
        line: u32,
        module: SmolStr,
        dep: SmolStr,
    },

    #[error("{file}:{line}: module {name:?} already defined in {prev_file}:{prev_line}")]
    DuplicateModule {
        file: SmolStr,
        line: u32,
        name: SmolStr,
        prev_file: SmolStr,
        prev_line: u32,
    },

    #[error("dependency cycle: {}", cycle_display(.cycle))]
    Cycle { cycle: Vec<SmolStr> },

    #[error("{file}:{line}: module {module:?} depends on itself")]
    SelfCycle {
        file: SmolStr,
        line: u32,
        module: SmolStr,
    },

    #[error("module {module:?} split again on {dim:?} with different values")]
    SplitMismatch { module: SmolStr, dim: SmolStr },

    #[error("module {module:?} has no variant matching the requested variations of {dep:?}")]
    NoMatchingVariant { module: SmolStr, dep: SmolStr },

    #[error(transparent)]
    Module(#[from] ModuleError),
}

fn cycle_display(cycle: &[SmolStr]) -> String {
    let mut parts: Vec<&str> = cycle.iter().map(|s| s.as_str()).collect();
    parts.sort();
    parts.join(" -> ")
}

/// The process-wide policy mapping unqualified names to module groups.
/// Within one namespace, group names are unique.
pub trait NameInterface: Send + Sync {
    /// Register a name. Returns the existing group on a duplicate.
    fn add(&mut self, name: SmolStr, group: GroupId) -> Result<(), GroupId>;

    /// Resolve a name referenced from a module in `from_dir`.
    fn resolve(&self, from_dir: &str, name: &str) -> Option<GroupId>;

    /// Move a group to a new name. Returns the occupying group if the new
    /// name is taken.
    fn rename(&mut self, old: &str, new: SmolStr, group: GroupId) -> Result<(), GroupId>;
}

/// The default name interface: one flat namespace.
#[derive(Debug, Default)]
pub struct SimpleNameInterface {
    names: IndexMap<SmolStr, GroupId>,
}

impl NameInterface for SimpleNameInterface {
    fn add(&mut self, name: SmolStr, group: GroupId) -> Result<(), GroupId> {
        match self.names.get(&name) {
            Some(existing) => Err(*existing),
            None => {
                self.names.insert(name, group);
                Ok(())
            }
        }
    }

    fn resolve(&self, _from_dir: &str, name: &str) -> Option<GroupId> {
        self.names.get(name).copied()
    }

    fn rename(&mut self, old: &str, new: SmolStr, group: GroupId) -> Result<(), GroupId> {
        if let Some(existing) = self.names.get(&new) {
            return Err(*existing);
        }
        self.names.shift_remove(old);
        self.names.insert(new, group);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SplitRecord {
    pub dim: SmolStr,
    pub values: Vec<SmolStr>,
    /// Local splits do not participate in automatic variant matching.
    pub local: bool,
}

#[derive(Debug)]
pub(crate) struct GroupData {
    pub name: SmolStr,
    pub variants: Vec<ModuleId>,
    pub splits: Vec<SplitRecord>,
}

pub(crate) struct ModuleData {
    pub group: GroupId,
    pub type_name: SmolStr,
    pub logic: Arc<dyn Module>,
    pub receivers: Vec<PropertyReceiver>,
    pub variations: Vec<(SmolStr, SmolStr)>,
    pub file: SmolStr,
    pub line: u32,
    pub dir: SmolStr,
    /// Names from the declarative `deps` property.
    pub static_deps: Vec<SmolStr>,
    pub deps: Vec<Edge>,
    pub missing: Vec<SmolStr>,
    pub errors: Vec<ModuleError>,
    pub bootstrap: bool,
    /// Facts published during generation for dependents to read.
    pub scratch: Mutex<IndexMap<SmolStr, String>>,
}

impl std::fmt::Debug for ModuleData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleData")
            .field("type_name", &self.type_name)
            .field("variations", &self.variations)
            .field("file", &self.file)
            .field("line", &self.line)
            .field("deps", &self.deps)
            .finish_non_exhaustive()
    }
}

/// The context handed to [`Module::dynamic_dependencies`].
pub struct DynamicDepsContext<'a> {
    pub(crate) graph: &'a ModuleGraph,
    pub(crate) module: ModuleId,
    pub(crate) config: &'a dyn Any,
}

impl DynamicDepsContext<'_> {
    pub fn module_name(&self) -> &SmolStr {
        self.graph.module_name(self.module)
    }

    pub fn module_dir(&self) -> &str {
        &self.graph.data(self.module).dir
    }

    pub fn properties(&self) -> &[PropertyReceiver] {
        &self.graph.data(self.module).receivers
    }

    pub fn config(&self) -> &dyn Any {
        self.config
    }
}

/// The module graph. Starts as one variant per parsed module; mutator
/// passes may split variants and rewrite edges.
#[derive(Debug, Default)]
pub struct ModuleGraph {
    pub(crate) modules: Vec<ModuleData>,
    pub(crate) groups: Vec<GroupData>,
}

impl ModuleGraph {
    pub(crate) fn data(&self, id: ModuleId) -> &ModuleData {
        &self.modules[id.0]
    }

    pub(crate) fn data_mut(&mut self, id: ModuleId) -> &mut ModuleData {
        &mut self.modules[id.0]
    }

    pub(crate) fn group(&self, id: GroupId) -> &GroupData {
        &self.groups[id.0]
    }

    pub fn module_name(&self, id: ModuleId) -> &SmolStr {
        &self.groups[self.modules[id.0].group.0].name
    }

    /// `name` plus the variation vector, for error messages.
    pub fn display_name(&self, id: ModuleId) -> String {
        let data = &self.modules[id.0];
        let name = self.module_name(id);
        if data.variations.is_empty() {
            name.to_string()
        } else {
            let vars: Vec<String> = data
                .variations
                .iter()
                .map(|(d, v)| format!("{d}:{v}"))
                .collect();
            format!("{name}({})", vars.join(","))
        }
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn modules(&self) -> impl Iterator<Item = ModuleId> {
        (0..self.modules.len()).map(ModuleId)
    }

    pub(crate) fn module_error(&self, id: ModuleId, message: impl Into<String>) -> ModuleError {
        let data = &self.modules[id.0];
        ModuleError {
            module: self.module_name(id).clone(),
            variant: if data.variations.is_empty() {
                String::new()
            } else {
                format!(" ({})", self.display_name(id))
            },
            file: data.file.clone(),
            line: data.line,
            message: message.into(),
        }
    }

    /// Add a new group with its initial variant (empty variation vector).
    pub(crate) fn add_module(
        &mut self,
        name: SmolStr,
        data_for: impl FnOnce(GroupId) -> ModuleData,
        names: &mut dyn NameInterface,
    ) -> Result<ModuleId, ResolveError> {
        let group_id = GroupId(self.groups.len());
        let module_id = ModuleId(self.modules.len());
        let data = data_for(group_id);

        if let Err(existing) = names.add(name.clone(), group_id) {
            let prev = self.data(self.groups[existing.0].variants[0]);
            return Err(ResolveError::DuplicateModule {
                file: data.file.clone(),
                line: data.line,
                name,
                prev_file: prev.file.clone(),
                prev_line: prev.line,
            });
        }

        self.groups.push(GroupData {
            name,
            variants: vec![module_id],
            splits: Vec::new(),
        });
        self.modules.push(data);
        Ok(module_id)
    }

    /// Find the variant of `group` a module with `variations` should
    /// depend on: for each recorded split, the source's value for that
    /// dimension if it names one of the split values, the first value
    /// otherwise. `explicit` pairs override both.
    pub(crate) fn find_matching_variant(
        &self,
        group: GroupId,
        variations: &[(SmolStr, SmolStr)],
        explicit: &[(SmolStr, SmolStr)],
    ) -> Option<ModuleId> {
        let data = &self.groups[group.0];
        let mut desired: Vec<(SmolStr, SmolStr)> = Vec::with_capacity(data.splits.len());
        for split in &data.splits {
            let from_explicit = explicit
                .iter()
                .find(|(d, _)| *d == split.dim)
                .map(|(_, v)| v);
            let from_source = variations
                .iter()
                .find(|(d, _)| *d == split.dim)
                .map(|(_, v)| v)
                .filter(|v| split.values.contains(*v));
            let value = match (from_explicit, split.local) {
                (Some(v), _) => v.clone(),
                (None, true) => split.values[0].clone(),
                (None, false) => from_source
                    .cloned()
                    .unwrap_or_else(|| split.values[0].clone()),
            };
            desired.push((split.dim.clone(), value));
        }

        data.variants
            .iter()
            .copied()
            .find(|&variant| self.modules[variant.0].variations == desired)
    }

    /// Add an edge from `from` to the matching variant of the group named
    /// `name`. Returns `Ok(None)` when the name is unknown and the module
    /// has opted in to handling missing dependencies.
    pub(crate) fn add_dependency(
        &mut self,
        from: ModuleId,
        name: &SmolStr,
        tag: DepTagRef,
        explicit: &[(SmolStr, SmolStr)],
        names: &dyn NameInterface,
    ) -> Result<Option<ModuleId>, ResolveError> {
        let from_data = &self.modules[from.0];
        let Some(group) = names.resolve(&from_data.dir, name) else {
            if from_data.logic.handles_missing_deps() {
                debug!(
                    "module {} is missing dependency {name}",
                    self.display_name(from)
                );
                self.modules[from.0].missing.push(name.clone());
                return Ok(None);
            }
            return Err(ResolveError::UnknownModule {
                file: from_data.file.clone(),
                line: from_data.line,
                module: self.module_name(from).clone(),
                dep: name.clone(),
            });
        };

        let target = self.find_matching_variant(group, &self.modules[from.0].variations, explicit);
        let Some(target) = target else {
            return Err(ResolveError::NoMatchingVariant {
                module: self.groups[group.0].name.clone(),
                dep: self.module_name(from).clone(),
            });
        };
        self.modules[from.0].deps.push(Edge { target, tag });
        Ok(Some(target))
    }

    /// Resolve static `deps` and dynamic dependencies for every module.
    /// Errors accumulate per module.
    #[tracing::instrument(skip_all)]
    pub(crate) fn resolve_dependencies(
        &mut self,
        config: &dyn Any,
        names: &dyn NameInterface,
        errors: &mut Vec<ResolveError>,
    ) {
        for id in 0..self.modules.len() {
            let id = ModuleId(id);
            let mut wanted: Vec<SmolStr> = self.modules[id.0].static_deps.clone();
            let dynamic = {
                let logic = self.modules[id.0].logic.clone();
                let ctx = DynamicDepsContext {
                    graph: self,
                    module: id,
                    config,
                };
                logic.dynamic_dependencies(&ctx)
            };
            wanted.extend(dynamic);

            for name in wanted {
                let tag: DepTagRef = Arc::new(StaticDepTag);
                if let Err(e) = self.add_dependency(id, &name, tag, &[], names) {
                    errors.push(e);
                }
            }
        }
    }

    /// Split `module` along `dim` into one variant per value. The module
    /// itself becomes the first value's variant; properties are deep
    /// copied into the others. Returns the variant ids in value order.
    pub(crate) fn split_variants(
        &mut self,
        module: ModuleId,
        dim: &str,
        values: &[&str],
        local: bool,
    ) -> Result<Vec<ModuleId>, ResolveError> {
        assert!(!values.is_empty(), "split with no values. This is a bug.");
        let group = self.modules[module.0].group;
        let dim = SmolStr::new(dim);
        let values: Vec<SmolStr> = values.iter().map(|v| SmolStr::new(v)).collect();

        // Record the split on the group once; every variant split later in
        // the same pass must agree.
        match self.groups[group.0].splits.iter().find(|s| s.dim == dim) {
            Some(existing) if existing.values != values || existing.local != local => {
                return Err(ResolveError::SplitMismatch {
                    module: self.module_name(module).clone(),
                    dim,
                });
            }
            Some(_) => {}
            None => self.groups[group.0].splits.push(SplitRecord {
                dim: dim.clone(),
                values: values.clone(),
                local,
            }),
        }

        // The original becomes the first value's variant in place.
        self.modules[module.0]
            .variations
            .push((dim.clone(), values[0].clone()));

        let mut created = vec![module];
        for value in &values[1..] {
            let src = &self.modules[module.0];
            let mut variations = src.variations.clone();
            *variations.last_mut().unwrap() = (dim.clone(), value.clone());
            let copy = ModuleData {
                group: src.group,
                type_name: src.type_name.clone(),
                logic: src.logic.clone(),
                receivers: src.receivers.clone(),
                variations,
                file: src.file.clone(),
                line: src.line,
                dir: src.dir.clone(),
                static_deps: src.static_deps.clone(),
                deps: src.deps.clone(),
                missing: src.missing.clone(),
                errors: Vec::new(),
                bootstrap: src.bootstrap,
                scratch: Mutex::new(src.scratch.lock().unwrap().clone()),
            };
            let id = ModuleId(self.modules.len());
            self.modules.push(copy);
            self.groups[group.0].variants.push(id);
            created.push(id);
        }

        // Outgoing edges of every new variant (and the original) are
        // re-matched against the targets' split records, so a variant
        // follows its own value into targets split on the same dimension.
        for &variant in &created {
            let variations = self.modules[variant.0].variations.clone();
            let targets: Vec<GroupId> = self.modules[variant.0]
                .deps
                .iter()
                .map(|e| self.modules[e.target.0].group)
                .collect();
            for (i, target_group) in targets.into_iter().enumerate() {
                let new_target = self
                    .find_matching_variant(target_group, &variations, &[])
                    .expect("default variant matching failed after a split. This is a bug.");
                self.modules[variant.0].deps[i].target = new_target;
            }
        }

        // Incoming edges follow the source's value for the new dimension;
        // sources without one keep pointing at the first variant. Local
        // splits skip this entirely.
        if !local {
            for source in 0..self.modules.len() {
                if created.contains(&ModuleId(source)) {
                    continue;
                }
                let source_value = self.modules[source]
                    .variations
                    .iter()
                    .find(|(d, _)| *d == dim)
                    .map(|(_, v)| v.clone());
                let Some(value) = source_value else { continue };
                let Some(pos) = values.iter().position(|v| *v == value) else {
                    continue;
                };
                let new_target = created[pos];
                for edge in &mut self.modules[source].deps {
                    if edge.target == module {
                        edge.target = new_target;
                    }
                }
            }
        }

        debug!(
            "split {} on {dim:?} into {} variants",
            self.groups[group.0].name,
            values.len()
        );
        Ok(created)
    }

    /// Check for cycles and compute a dependencies-first order over all
    /// modules. Any SCC of size > 1 or self-loop is an error naming the
    /// modules involved.
    #[tracing::instrument(skip_all)]
    pub(crate) fn check_cycles(&self) -> Result<Vec<ModuleId>, Vec<ResolveError>> {
        let mut graph: DiGraph<ModuleId, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = self.modules().map(|id| graph.add_node(id)).collect();
        for id in self.modules() {
            for edge in &self.modules[id.0].deps {
                graph.add_edge(nodes[id.0], nodes[edge.target.0], ());
            }
        }

        let sccs = petgraph::algo::tarjan_scc(&graph);
        let mut order = Vec::with_capacity(self.modules.len());
        let mut errors = Vec::new();
        for scc in sccs {
            if scc.len() > 1 {
                let cycle: Vec<SmolStr> = scc
                    .iter()
                    .map(|&n| SmolStr::new(self.display_name(graph[n])))
                    .collect();
                errors.push(ResolveError::Cycle { cycle });
                continue;
            }
            let id = graph[scc[0]];
            if self.modules[id.0].deps.iter().any(|e| e.target == id) {
                let data = &self.modules[id.0];
                errors.push(ResolveError::SelfCycle {
                    file: data.file.clone(),
                    line: data.line,
                    module: self.module_name(id).clone(),
                });
                continue;
            }
            order.push(id);
        }

        if errors.is_empty() {
            Ok(order)
        } else {
            Err(errors)
        }
    }

    /// Visit each outgoing edge of `module` once. Multi-edges yield
    /// multiple visits with their distinct tags.
    pub fn visit_direct_deps(
        &self,
        module: ModuleId,
        mut visit: impl FnMut(ModuleId, &dyn DepTag),
    ) {
        for edge in &self.modules[module.0].deps {
            visit(edge.target, edge.tag.as_ref());
        }
    }

    /// Depth-first transitive closure, visiting each module at most once.
    /// The tag passed for a module is the one on the first edge that
    /// discovered it.
    pub fn visit_deps_depth_first(
        &self,
        module: ModuleId,
        mut visit: impl FnMut(ModuleId, &dyn DepTag),
    ) {
        let mut visited: IndexSet<ModuleId> = IndexSet::new();
        let mut stack: Vec<(ModuleId, DepTagRef)> = self.modules[module.0]
            .deps
            .iter()
            .rev()
            .map(|e| (e.target, e.tag.clone()))
            .collect();
        while let Some((id, tag)) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            visit(id, tag.as_ref());
            for edge in self.modules[id.0].deps.iter().rev() {
                if !visited.contains(&edge.target) {
                    stack.push((edge.target, edge.tag.clone()));
                }
            }
        }
    }

    /// Walk transitive dependencies top-down. `visit` receives each
    /// `(child, parent)` pair once; returning `true` continues into the
    /// child's own dependencies.
    pub fn walk_deps(&self, module: ModuleId, mut visit: impl FnMut(ModuleId, ModuleId) -> bool) {
        let mut visited: IndexSet<ModuleId> = IndexSet::new();
        self.walk_deps_inner(module, &mut visited, &mut visit);
    }

    fn walk_deps_inner(
        &self,
        parent: ModuleId,
        visited: &mut IndexSet<ModuleId>,
        visit: &mut impl FnMut(ModuleId, ModuleId) -> bool,
    ) {
        for i in 0..self.modules[parent.0].deps.len() {
            let child = self.modules[parent.0].deps[i].target;
            if !visited.insert(child) {
                continue;
            }
            if visit(child, parent) {
                self.walk_deps_inner(child, visited, visit);
            }
        }
    }

    /// The missing dependency names recorded for a module that opted in
    /// to handling them.
    pub fn missing_deps(&self, module: ModuleId) -> &[SmolStr] {
        &self.modules[module.0].missing
    }

    /// The variation vector of a module variant.
    pub fn variations(&self, module: ModuleId) -> &[(SmolStr, SmolStr)] {
        &self.modules[module.0].variations
    }

    /// The type name a module was created under.
    pub fn module_type_name(&self, module: ModuleId) -> &SmolStr {
        &self.modules[module.0].type_name
    }
}
