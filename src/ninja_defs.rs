//! Rule, pool, variable and build-statement definitions.
//!
//! Identities are packed ids: the high half names the owner (0 for the
//! engine-wide tables populated from package contexts, `n + 1` for the
//! n-th emission context), the low half is an index into that owner's
//! arena. Emission contexts can therefore mint local definitions without
//! synchronizing with each other.

use std::any::Any;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use smol_str::SmolStr;

use crate::ninja_string::NinjaString;
use crate::scope::ScopeId;

macro_rules! packed_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            pub(crate) fn new(owner: u32, index: usize) -> Self {
                Self(((owner as u64) << 32) | index as u64)
            }

            /// 0 is the engine-wide table; `n + 1` is emission context n.
            pub(crate) fn owner(self) -> u32 {
                (self.0 >> 32) as u32
            }

            pub(crate) fn index(self) -> usize {
                (self.0 & u32::MAX as u64) as usize
            }
        }
    };
}

packed_id! {
    /// Identity of a variable definition.
    VariableId
}
packed_id! {
    /// Identity of a rule definition.
    RuleId
}
packed_id! {
    /// Identity of a pool definition.
    PoolId
}

/// The owner half of ids in the engine-wide tables.
pub(crate) const GLOBAL_OWNER: u32 = 0;

/// The built-in `phony` rule. Always defined; never written out.
pub const PHONY_RULE: RuleId = RuleId(0);

/// How Ninja interprets a rule's depfile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepsFormat {
    #[default]
    None,
    Gcc,
    Msvc,
}

impl DepsFormat {
    pub(crate) fn keyword(self) -> Option<&'static str> {
        match self {
            DepsFormat::None => None,
            DepsFormat::Gcc => Some("gcc"),
            DepsFormat::Msvc => Some("msvc"),
        }
    }
}

/// A variable value computed from the configuration object at emission
/// time.
pub type ComputedVar =
    Arc<dyn Fn(&dyn Any) -> Result<String, Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

pub(crate) enum VariableValue {
    Literal(NinjaString),
    Computed(ComputedVar),
    /// A placeholder while package variables bind before their values
    /// parse; never survives engine construction.
    Pending,
}

impl std::fmt::Debug for VariableValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VariableValue::Literal(v) => f.debug_tuple("Literal").field(v).finish(),
            VariableValue::Computed(v) => {
                let ptr = Arc::as_ptr(v);
                f.debug_tuple("Computed").field(&ptr).finish()
            }
            VariableValue::Pending => f.debug_tuple("Pending").finish(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct VariableDef {
    pub name: SmolStr,
    pub scope: ScopeId,
    pub value: VariableValue,
}

/// Rule parameters as supplied by callers. Strings are parsed against the
/// defining scope when the rule is materialized.
#[derive(Debug, Clone, Default)]
pub struct RuleParams {
    pub command: String,
    pub description: Option<String>,
    pub depfile: Option<String>,
    pub deps: DepsFormat,
    pub generator: bool,
    pub restat: bool,
    pub rspfile: Option<String>,
    pub rspfile_content: Option<String>,
    /// Name of a pool visible from the defining scope.
    pub pool: Option<String>,
}

#[derive(Debug)]
pub(crate) struct RuleDef {
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
    /// Argument names build statements of this rule may set.
    pub args: IndexSet<SmolStr>,
}

/// Pool parameters as supplied by callers.
#[derive(Debug, Clone, Default)]
pub struct PoolParams {
    pub comment: Option<String>,
    pub depth: i32,
}

#[derive(Debug)]
pub(crate) struct PoolDef {
    pub name: SmolStr,
    pub scope: ScopeId,
    pub comment: Option<String>,
    pub depth: i32,
}

/// Build-statement parameters as supplied by generators. Paths and
/// argument values may contain `$` references; they are parsed against
/// the emitting context's scope.
#[derive(Debug, Clone, Default)]
pub struct BuildParams {
    pub comment: Option<String>,
    pub outputs: Vec<String>,
    pub implicit_outputs: Vec<String>,
    pub inputs: Vec<String>,
    pub implicits: Vec<String>,
    pub order_only: Vec<String>,
    pub validations: Vec<String>,
    pub args: Vec<(String, String)>,
    /// Also emit the outputs as a `default` target.
    pub default: bool,
}

#[derive(Debug)]
pub(crate) struct BuildDef {
    pub comment: Option<String>,
    pub rule: RuleId,
    pub outputs: Vec<NinjaString>,
    pub implicit_outputs: Vec<NinjaString>,
    pub inputs: Vec<NinjaString>,
    pub implicits: Vec<NinjaString>,
    pub order_only: Vec<NinjaString>,
    pub validations: Vec<NinjaString>,
    /// Keyed by the rule's declared argument names.
    pub args: IndexMap<SmolStr, NinjaString>,
    pub default: bool,
}

/// The engine-wide definition tables (owner 0), populated from package
/// contexts before parsing begins.
#[derive(Debug)]
pub struct Definitions {
    pub(crate) vars: Vec<VariableDef>,
    pub(crate) rules: Vec<RuleDef>,
    pub(crate) pools: Vec<PoolDef>,
}

impl Default for Definitions {
    fn default() -> Self {
        Self::new()
    }
}

impl Definitions {
    pub fn new() -> Self {
        // Slot 0 is the built-in phony rule so PHONY_RULE is always valid.
        let phony = RuleDef {
            name: SmolStr::new_static("phony"),
            scope: crate::scope::ROOT_SCOPE,
            command: NinjaString::default(),
            description: None,
            depfile: None,
            deps: DepsFormat::None,
            generator: false,
            restat: false,
            rspfile: None,
            rspfile_content: None,
            pool: None,
            args: IndexSet::new(),
        };
        Self {
            vars: Vec::new(),
            rules: vec![phony],
            pools: Vec::new(),
        }
    }

    pub(crate) fn add_var(&mut self, def: VariableDef) -> VariableId {
        let id = VariableId::new(GLOBAL_OWNER, self.vars.len());
        self.vars.push(def);
        id
    }

    pub(crate) fn add_rule(&mut self, def: RuleDef) -> RuleId {
        let id = RuleId::new(GLOBAL_OWNER, self.rules.len());
        self.rules.push(def);
        id
    }

    pub(crate) fn add_pool(&mut self, def: PoolDef) -> PoolId {
        let id = PoolId::new(GLOBAL_OWNER, self.pools.len());
        self.pools.push(def);
        id
    }
}
