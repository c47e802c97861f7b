//! kiln: an incremental build engine.
//!
//! A [`Dag`] owns a set of named [`Task`]s and their dependency edges.
//! Each task fires a persistent [`Product`] from a templated [`Source`]
//! and a set of [`Params`]. Rendering decides what each task should do
//! this session; building performs the work through a [`Runner`]; every
//! externally observable status change ripples to direct dependents
//! through the DAG's propagation.

pub mod core;
pub mod testing;

pub use crate::core::client::Client;
pub use crate::core::dag::{Dag, DagError, TaskGroup, Upstream, UpstreamEntry};
pub use crate::core::hook::{Hook, HookArgs, HookContext, HookParam, TaskView};
pub use crate::core::params::{Params, ParamsError, PRODUCT_KEY, UPSTREAM_KEY};
pub use crate::core::product::{Metadata, MetaProduct, NullProduct, Product, ProductError};
pub use crate::core::source::{Source, SourceError, TemplatedSource};
pub use crate::core::status::TaskStatus;
pub use crate::core::task::{
    BuildError, BuildReport, ConfigError, GracefulStop, OutdatedState, RenderError, RunContext,
    RunError, Runner, Task, TaskError, TaskSnapshot,
};
pub use crate::core::template::TemplateError;
pub use crate::core::types::TaskName;
