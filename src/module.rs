//! The module and singleton traits, and dependency tags.

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use smol_str::SmolStr;

use crate::generate::{GenerateError, ModuleContext, SingletonContext};
use crate::graph::DynamicDepsContext;

/// An opaque identity value carried by a dependency edge. Callers define
/// their own tag types; queries downcast through [`Any`].
pub trait DepTag: Any + Debug + Send + Sync {}

pub type DepTagRef = Arc<dyn DepTag>;

/// The tag used for edges created from the declarative `deps` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticDepTag;

impl DepTag for StaticDepTag {}

/// A logical build unit. Factories registered under a type name return
/// one of these together with the property receivers the binder fills.
///
/// A module is never mutated by its own generator; all structural change
/// happens in mutator passes, and property divergence between variants
/// lives in the per-variant receivers rather than in the module value
/// itself.
pub trait Module: Any + Send + Sync {
    /// Emit this module's build actions. Runs once per variant, in
    /// dependency order, possibly in parallel with unrelated modules.
    fn generate(&self, ctx: &mut ModuleContext<'_>) -> Result<(), GenerateError>;

    /// Additional dependency names discovered from bound properties.
    /// Called once during dependency resolution.
    fn dynamic_dependencies(&self, ctx: &DynamicDepsContext<'_>) -> Vec<SmolStr> {
        let _ = ctx;
        Vec::new()
    }

    /// Opt in to resolving missing dependencies to an empty slot instead
    /// of failing resolution. The module can then inspect them through
    /// its generation context.
    fn handles_missing_deps(&self) -> bool {
        false
    }
}

/// A build-action producer that runs once after all modules.
pub trait Singleton: Send + Sync {
    fn generate(&self, ctx: &mut SingletonContext<'_>) -> Result<(), GenerateError>;
}
