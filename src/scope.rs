//! Scopes for Ninja-level definitions.
//!
//! Scopes form a tree rooted at an empty global scope. Each package
//! context introduces a child scope whose members are addressable both
//! unqualified from within the package and as `${pkg.name}` from outside,
//! through the importing scope's import table. Module-local scopes hang
//! off the scope of the package that emitted them.

use indexmap::IndexMap;
use smol_str::SmolStr;

use crate::ninja_defs::{PoolId, RuleId, VariableId};

/// An index that uniquely identifies a scope in the scope table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(pub(crate) usize);

/// The global root scope.
pub const ROOT_SCOPE: ScopeId = ScopeId(0);

/// A definition bound to a name in a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Def {
    Variable(VariableId),
    Rule(RuleId),
    Pool(PoolId),
}

impl Def {
    pub(crate) fn describe(&self) -> &'static str {
        match self {
            Def::Variable(_) => "variable",
            Def::Rule(_) => "rule",
            Def::Pool(_) => "pool",
        }
    }
}

#[derive(Debug, Default)]
struct ScopeData {
    parent: Option<ScopeId>,
    entries: IndexMap<SmolStr, Def>,
    imports: IndexMap<SmolStr, ScopeId>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScopeError {
    #[error("{kind} {name:?} is already defined in this scope")]
    Duplicate { name: SmolStr, kind: &'static str },

    #[error("package {0:?} is already imported")]
    DuplicateImport(SmolStr),

    #[error("import of {0:?} would form a cycle")]
    ImportCycle(SmolStr),
}

/// The scope tree. Owns only name bindings; definition bodies live in
/// [`crate::ninja_defs::Definitions`].
#[derive(Debug)]
pub struct ScopeTable {
    scopes: Vec<ScopeData>,
}

impl Default for ScopeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeTable {
    /// Create a table holding only the empty global root scope.
    pub fn new() -> Self {
        Self {
            scopes: vec![ScopeData::default()],
        }
    }

    pub fn new_child(&mut self, parent: ScopeId) -> ScopeId {
        let id = ScopeId(self.scopes.len());
        self.scopes.push(ScopeData {
            parent: Some(parent),
            entries: IndexMap::new(),
            imports: IndexMap::new(),
        });
        id
    }

    pub fn parent(&self, scope: ScopeId) -> Option<ScopeId> {
        self.scopes[scope.0].parent
    }

    /// Bind `name` in `scope`. Names are unique within a scope across all
    /// definition kinds.
    pub fn add(&mut self, scope: ScopeId, name: SmolStr, def: Def) -> Result<(), ScopeError> {
        let entries = &mut self.scopes[scope.0].entries;
        if let Some(existing) = entries.get(&name) {
            return Err(ScopeError::Duplicate {
                name,
                kind: existing.describe(),
            });
        }
        entries.insert(name, def);
        Ok(())
    }

    /// Look `name` up in `scope`, walking parent scopes.
    pub fn lookup(&self, scope: ScopeId, name: &str) -> Option<Def> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let data = &self.scopes[id.0];
            if let Some(def) = data.entries.get(name) {
                return Some(*def);
            }
            current = data.parent;
        }
        None
    }

    /// Make the members of `target` addressable as `${alias.name}` from
    /// within `scope`.
    pub fn add_import(
        &mut self,
        scope: ScopeId,
        alias: SmolStr,
        target: ScopeId,
    ) -> Result<(), ScopeError> {
        if self.scopes[scope.0].imports.contains_key(&alias) {
            return Err(ScopeError::DuplicateImport(alias));
        }
        // Reject chains that lead back here.
        let mut stack = vec![target];
        let mut visited = Vec::new();
        while let Some(id) = stack.pop() {
            if id == scope {
                return Err(ScopeError::ImportCycle(alias));
            }
            if visited.contains(&id) {
                continue;
            }
            visited.push(id);
            stack.extend(self.scopes[id.0].imports.values().copied());
        }
        self.scopes[scope.0].imports.insert(alias, target);
        Ok(())
    }

    /// Resolve the scope an alias refers to, walking parent scopes.
    pub fn import(&self, scope: ScopeId, alias: &str) -> Option<ScopeId> {
        let mut current = Some(scope);
        while let Some(id) = current {
            let data = &self.scopes[id.0];
            if let Some(target) = data.imports.get(alias) {
                return Some(*target);
            }
            current = data.parent;
        }
        None
    }

    /// Qualified lookup: resolve `alias` through the import table, then
    /// look `name` up inside that scope alone.
    pub fn lookup_qualified(&self, scope: ScopeId, alias: &str, name: &str) -> Option<Def> {
        let target = self.import(scope, alias)?;
        self.scopes[target.0].entries.get(name).copied()
    }

    pub fn entries(&self, scope: ScopeId) -> impl Iterator<Item = (&SmolStr, Def)> {
        self.scopes[scope.0].entries.iter().map(|(k, v)| (k, *v))
    }
}
