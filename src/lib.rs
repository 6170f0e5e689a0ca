pub mod bootstrap;
pub mod config;
pub mod engine;
pub mod generate;
pub mod glob;
pub mod graph;
pub mod module;
pub mod mutate;
pub mod ninja_defs;
pub mod ninja_string;
pub mod ninja_writer;
pub mod parser;
pub mod props;
pub mod registry;
pub mod scope;
pub mod source;

// Re-exports for convenience
pub use config::{Config, Stage};
pub use engine::{Engine, EngineError};
pub use generate::{GenerateError, ModuleContext, SingletonContext};
pub use graph::{GroupId, ModuleGraph, ModuleId, NameInterface, SimpleNameInterface};
pub use module::{DepTag, DepTagRef, Module, Singleton, StaticDepTag};
pub use ninja_defs::{BuildParams, DepsFormat, PoolParams, RuleParams};
pub use props::{PropValue, PropertyReceiver, PropertySchema};
pub use registry::{NewModule, PackageId, Registry};
pub use source::{LocalSourceTree, SourceTree};
