//! Core engine: tasks, products, sources, params, hooks and the DAG.

pub mod client;
pub mod dag;
pub mod hook;
pub mod params;
pub mod product;
pub mod source;
pub mod status;
pub mod task;
pub mod template;
pub mod types;
