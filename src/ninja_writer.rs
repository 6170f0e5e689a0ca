//! Serialization of the collected definitions into a Ninja manifest.
//!
//! Output order: header comment, global variables, package-qualified
//! variables, pool definitions, rule definitions, default variable
//! assignments, per-module sections (local definitions and build
//! statements in module-declaration order), singleton sections, then
//! `default` lines. Within the variable, pool and rule categories
//! entries are sorted lexicographically by their written name.

use std::io;
use std::path::Path;

use indexmap::IndexMap;
use smol_str::SmolStr;

use crate::generate::{ActionOwner, GenShared, LocalActions, LocalRule};
use crate::graph::ModuleGraph;
use crate::ninja_defs::{
    BuildDef, Definitions, DepsFormat, PHONY_RULE, PoolId, RuleId, VariableId, VariableValue,
};
use crate::ninja_string::{Escape, NinjaString, VarNames, escape};
use crate::scope::ScopeId;

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("computing variable {name}: {message}")]
    ComputedVariable { name: SmolStr, message: String },

    #[error("writing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Maps identities to written names: package definitions render
/// `alias.name`, module-local definitions `m.<module>.name`, singleton
/// definitions `s.<singleton>.name`, root-scope definitions plain.
pub(crate) struct NameView<'a> {
    defs: &'a Definitions,
    actions: &'a [LocalActions],
    by_owner: IndexMap<u32, usize>,
    scope_alias: IndexMap<ScopeId, String>,
    owner_prefix: IndexMap<u32, String>,
}

impl<'a> NameView<'a> {
    pub(crate) fn new(
        defs: &'a Definitions,
        packages: &[crate::generate::PackageInfo],
        actions: &'a [LocalActions],
        graph: &ModuleGraph,
    ) -> Self {
        // Package aliases: the last path segment, disambiguated with a
        // numeric suffix on collision, assigned in package order.
        let mut scope_alias: IndexMap<ScopeId, String> = IndexMap::new();
        let mut taken: Vec<String> = Vec::new();
        for pkg in packages {
            let base = pkg
                .path
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or("pkg");
            let mut alias = base.to_string();
            let mut n = 1;
            while taken.contains(&alias) {
                alias = format!("{base}_{n}");
                n += 1;
            }
            taken.push(alias.clone());
            scope_alias.insert(pkg.scope, alias);
        }

        let mut by_owner = IndexMap::new();
        let mut owner_prefix = IndexMap::new();
        for (i, actions) in actions.iter().enumerate() {
            by_owner.insert(actions.owner, i);
            let prefix = match &actions.from {
                ActionOwner::Module(id) => format!("m.{}", mangle(&graph.display_name(*id))),
                ActionOwner::Singleton(name) => format!("s.{}", mangle(name)),
            };
            owner_prefix.insert(actions.owner, prefix);
        }

        Self {
            defs,
            actions,
            by_owner,
            scope_alias,
            owner_prefix,
        }
    }

    fn local(&self, owner: u32) -> &LocalActions {
        &self.actions[self.by_owner[&owner]]
    }

    fn prefix(&self, owner: u32) -> &str {
        &self.owner_prefix[&owner]
    }

    pub(crate) fn rule_name(&self, id: RuleId) -> String {
        if id == PHONY_RULE {
            return "phony".to_string();
        }
        if id.owner() == 0 {
            let def = &self.defs.rules[id.index()];
            match self.scope_alias.get(&def.scope) {
                Some(alias) => format!("{alias}.{}", def.name),
                None => def.name.to_string(),
            }
        } else {
            let rule = &self.local(id.owner()).rules[id.index()];
            format!("{}.{}", self.prefix(id.owner()), rule.name)
        }
    }

    pub(crate) fn pool_name(&self, id: PoolId) -> String {
        if id.owner() == 0 {
            let def = &self.defs.pools[id.index()];
            match self.scope_alias.get(&def.scope) {
                Some(alias) => format!("{alias}.{}", def.name),
                None => def.name.to_string(),
            }
        } else {
            let pool = &self.local(id.owner()).pools[id.index()];
            format!("{}.{}", self.prefix(id.owner()), pool.name)
        }
    }
}

impl VarNames for NameView<'_> {
    fn var_name(&self, id: VariableId) -> String {
        if id.owner() == 0 {
            let def = &self.defs.vars[id.index()];
            match self.scope_alias.get(&def.scope) {
                Some(alias) => format!("{alias}.{}", def.name),
                None => def.name.to_string(),
            }
        } else {
            let var = &self.local(id.owner()).vars[id.index()];
            format!("{}.{}", self.prefix(id.owner()), var.name)
        }
    }
}

/// Replace characters Ninja identifiers cannot carry.
fn mangle(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Render the complete manifest.
pub(crate) fn emit(
    shared: &GenShared<'_>,
    actions: &[LocalActions],
    subninjas: &[String],
) -> Result<String, WriteError> {
    let names = NameView::new(shared.defs, shared.packages, actions, shared.graph);
    let mut out = String::new();

    out.push_str("# This file is generated. Do not edit by hand; changes will\n");
    out.push_str("# be overwritten by the next generation.\n\n");
    out.push_str("ninja_required_version = 1.8\n");

    emit_global_variables(&mut out, shared, &names)?;
    emit_pools(&mut out, actions, &names);
    emit_rules(&mut out, shared, &names);

    // Default variable assignments.
    out.push('\n');
    out.push_str(&format!(
        "builddir = {}\n",
        escape(&shared.config.ninja_build_dir.to_string_lossy(), Escape::Input)
    ));

    let mut defaults: Vec<String> = Vec::new();
    for local in actions {
        if local.is_empty() {
            continue;
        }
        emit_section(&mut out, shared.graph, local, &names, &mut defaults);
    }

    for subninja in subninjas {
        out.push('\n');
        out.push_str(&format!("subninja {}\n", escape(subninja, Escape::Input)));
    }

    if !defaults.is_empty() {
        out.push('\n');
        for d in defaults {
            out.push_str(&format!("default {d}\n"));
        }
    }

    Ok(out)
}

fn emit_global_variables(
    out: &mut String,
    shared: &GenShared<'_>,
    names: &NameView<'_>,
) -> Result<(), WriteError> {
    // Root-scope variables first, then package variables; each chunk
    // sorted by written name.
    let mut root: Vec<(String, String)> = Vec::new();
    let mut packaged: Vec<(String, String)> = Vec::new();
    for (i, def) in shared.defs.vars.iter().enumerate() {
        let id = VariableId::new(0, i);
        let value = match &def.value {
            VariableValue::Pending => {
                panic!("variable {:?} never received a value. This is a bug.", def.name)
            }
            VariableValue::Literal(ns) => ns.render(names, Escape::None),
            VariableValue::Computed(func) => {
                func(shared.user_config).map_err(|e| WriteError::ComputedVariable {
                    name: def.name.clone(),
                    message: e.to_string(),
                })?
            }
        };
        let written = names.var_name(id);
        if def.scope == crate::scope::ROOT_SCOPE {
            root.push((written, value));
        } else {
            packaged.push((written, value));
        }
    }
    root.sort();
    packaged.sort();

    if !root.is_empty() {
        out.push('\n');
        for (name, value) in root {
            out.push_str(&format!("{name} = {value}\n"));
        }
    }
    if !packaged.is_empty() {
        out.push('\n');
        for (name, value) in packaged {
            out.push_str(&format!("{name} = {value}\n"));
        }
    }
    Ok(())
}

fn emit_pools(out: &mut String, actions: &[LocalActions], names: &NameView<'_>) {
    let mut pools: Vec<(String, Option<String>, i32)> = Vec::new();
    for (i, def) in names.defs.pools.iter().enumerate() {
        let id = PoolId::new(0, i);
        pools.push((names.pool_name(id), def.comment.clone(), def.depth));
    }
    for local in actions {
        for (i, pool) in local.pools.iter().enumerate() {
            let id = PoolId::new(local.owner, i);
            pools.push((names.pool_name(id), pool.comment.clone(), pool.depth));
        }
    }
    pools.sort();

    for (name, comment, depth) in pools {
        out.push('\n');
        if let Some(comment) = comment {
            for line in comment.lines() {
                out.push_str(&format!("# {line}\n"));
            }
        }
        out.push_str(&format!("pool {name}\n    depth = {depth}\n"));
    }
}

fn emit_rules(out: &mut String, shared: &GenShared<'_>, names: &NameView<'_>) {
    // Package rules only; module-local rules are written inside their
    // module's section.
    let mut rules: Vec<(String, usize)> = Vec::new();
    for (i, _) in shared.defs.rules.iter().enumerate() {
        let id = RuleId::new(0, i);
        if id == PHONY_RULE {
            continue;
        }
        rules.push((names.rule_name(id), i));
    }
    rules.sort();

    for (written, i) in rules {
        let def = &shared.defs.rules[i];
        out.push('\n');
        out.push_str(&format!("rule {written}\n"));
        rule_body(
            out,
            names,
            &def.command,
            def.description.as_ref(),
            def.depfile.as_ref(),
            def.deps,
            def.generator,
            def.restat,
            def.rspfile.as_ref(),
            def.rspfile_content.as_ref(),
            def.pool,
        );
    }
}

#[allow(clippy::too_many_arguments)]
fn rule_body(
    out: &mut String,
    names: &NameView<'_>,
    command: &NinjaString,
    description: Option<&NinjaString>,
    depfile: Option<&NinjaString>,
    deps: DepsFormat,
    generator: bool,
    restat: bool,
    rspfile: Option<&NinjaString>,
    rspfile_content: Option<&NinjaString>,
    pool: Option<PoolId>,
) {
    out.push_str(&format!("    command = {}\n", command.render(names, Escape::None)));
    if let Some(description) = description {
        out.push_str(&format!(
            "    description = {}\n",
            description.render(names, Escape::None)
        ));
    }
    if let Some(depfile) = depfile {
        out.push_str(&format!(
            "    depfile = {}\n",
            depfile.render(names, Escape::None)
        ));
    }
    if let Some(keyword) = deps.keyword() {
        out.push_str(&format!("    deps = {keyword}\n"));
    }
    if generator {
        out.push_str("    generator = 1\n");
    }
    if restat {
        out.push_str("    restat = 1\n");
    }
    if let Some(rspfile) = rspfile {
        out.push_str(&format!(
            "    rspfile = {}\n",
            rspfile.render(names, Escape::None)
        ));
    }
    if let Some(content) = rspfile_content {
        out.push_str(&format!(
            "    rspfile_content = {}\n",
            content.render(names, Escape::None)
        ));
    }
    if let Some(pool) = pool {
        out.push_str(&format!("    pool = {}\n", names.pool_name(pool)));
    }
}

fn emit_section(
    out: &mut String,
    graph: &ModuleGraph,
    local: &LocalActions,
    names: &NameView<'_>,
    defaults: &mut Vec<String>,
) {
    out.push('\n');
    out.push_str("# # # # # # # # # # # # # # # # # # # # # # # # # #\n");
    match &local.from {
        ActionOwner::Module(id) => {
            let data = graph.data(*id);
            out.push_str(&format!("# Module:   {}\n", graph.module_name(*id)));
            if !data.variations.is_empty() {
                let variant: Vec<String> = data
                    .variations
                    .iter()
                    .map(|(d, v)| format!("{d}:{v}"))
                    .collect();
                out.push_str(&format!("# Variant:  {}\n", variant.join(",")));
            }
            out.push_str(&format!("# Type:     {}\n", data.type_name));
            out.push_str(&format!("# Defined:  {}:{}\n", data.file, data.line));
        }
        ActionOwner::Singleton(name) => {
            out.push_str(&format!("# Singleton: {name}\n"));
        }
    }

    for (i, var) in local.vars.iter().enumerate() {
        let id = VariableId::new(local.owner, i);
        out.push_str(&format!(
            "{} = {}\n",
            names.var_name(id),
            var.value.render(names, Escape::None)
        ));
    }

    for (i, rule) in local.rules.iter().enumerate() {
        let id = RuleId::new(local.owner, i);
        emit_local_rule(out, names, rule, id);
    }

    for build in &local.builds {
        emit_build(out, names, build, defaults);
    }
}

fn emit_local_rule(out: &mut String, names: &NameView<'_>, rule: &LocalRule, id: RuleId) {
    out.push('\n');
    out.push_str(&format!("rule {}\n", names.rule_name(id)));
    rule_body(
        out,
        names,
        &rule.command,
        rule.description.as_ref(),
        rule.depfile.as_ref(),
        rule.deps,
        rule.generator,
        rule.restat,
        rule.rspfile.as_ref(),
        rule.rspfile_content.as_ref(),
        rule.pool,
    );
}

fn emit_build(
    out: &mut String,
    names: &NameView<'_>,
    build: &BuildDef,
    defaults: &mut Vec<String>,
) {
    if let Some(comment) = &build.comment {
        out.push('\n');
        for line in comment.lines() {
            out.push_str(&format!("# {line}\n"));
        }
    } else {
        out.push('\n');
    }

    let render_list = |list: &[NinjaString], escape: Escape| -> Vec<String> {
        list.iter().map(|s| s.render(names, escape)).collect()
    };

    let outputs = render_list(&build.outputs, Escape::Output);
    let mut line = format!("build {}", outputs.join(" "));
    if !build.implicit_outputs.is_empty() {
        line.push_str(" | ");
        line.push_str(&render_list(&build.implicit_outputs, Escape::Output).join(" "));
    }
    line.push_str(&format!(": {}", names.rule_name(build.rule)));
    for input in render_list(&build.inputs, Escape::Input) {
        line.push(' ');
        line.push_str(&input);
    }
    if !build.implicits.is_empty() {
        line.push_str(" | ");
        line.push_str(&render_list(&build.implicits, Escape::Input).join(" "));
    }
    if !build.order_only.is_empty() {
        line.push_str(" || ");
        line.push_str(&render_list(&build.order_only, Escape::Input).join(" "));
    }
    if !build.validations.is_empty() {
        line.push_str(" |@ ");
        line.push_str(&render_list(&build.validations, Escape::Input).join(" "));
    }
    out.push_str(&line);
    out.push('\n');

    for (name, value) in &build.args {
        out.push_str(&format!("    {name} = {}\n", value.render(names, Escape::None)));
    }

    if build.default {
        defaults.extend(outputs);
    }
}

/// Every output path the collected build statements produce, unescaped.
/// Feeds the staleness collector's live-target set.
pub(crate) fn target_files(shared: &GenShared<'_>, actions: &[LocalActions]) -> Vec<String> {
    let names = NameView::new(shared.defs, shared.packages, actions, shared.graph);
    let mut out = Vec::new();
    for local in actions {
        for build in &local.builds {
            for output in build.outputs.iter().chain(&build.implicit_outputs) {
                out.push(output.render(&names, Escape::None));
            }
        }
    }
    out
}

/// Write `contents` to `path` atomically. If the file already holds the
/// same bytes it is left untouched, preserving its mtime so restat-style
/// checks downstream see no change. Returns whether the file changed.
pub fn write_ninja_file(path: &Path, contents: &str) -> Result<bool, WriteError> {
    let io_err = |source: io::Error| WriteError::Io {
        path: path.display().to_string(),
        source,
    };

    if let Ok(existing) = std::fs::read_to_string(path)
        && existing == contents
    {
        return Ok(false);
    }

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(io_err)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    io::Write::write_all(&mut tmp, contents.as_bytes()).map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(true)
}
