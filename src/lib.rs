//! # dag-serving
//!
//! Execution core of an inference server that serves directed acyclic graphs of
//! model and custom-kernel steps as a single endpoint.
//!
//! ## Architecture
//!
//! - [`PipelineFactory`] maps pipeline names to [`PipelineDefinition`]s.
//! - A definition validates its nodes and connections into an [`ExecutionPlan`]
//!   and builds request-bound [`Pipeline`] instances from it.
//! - A pipeline runs its nodes in dependency order, splitting demultiplexer
//!   outputs into branches and stacking them back at gather points.
//! - Custom nodes call externally supplied kernels through the C ABI in
//!   [`custom_node`]; every library-owned allocation is released on every path.
//! - [`sequence`] tracks stateful sessions and evicts idle ones in the background.
//! - [`ServableManager`] owns all of the above and applies JSON configuration.

pub mod config;
pub mod custom_node;
pub mod manager;
pub mod model;
pub(crate) mod nodes;
pub mod pipeline;
pub mod pipeline_definition;
pub mod pipeline_factory;
pub mod sequence;
pub mod status;
#[cfg(test)]
pub(crate) mod testing;
pub mod types;
pub mod validation;

pub use config::{ConfigError, EngineConfig};
pub use custom_node::{CustomNodeLibraryManager, NodeLibrary};
pub use manager::{LoadError, ServableManager};
pub use model::{ModelBackend, ModelSignature, NoModelBackend};
pub use pipeline::Pipeline;
pub use pipeline_definition::{Dependencies, PipelineDefinition};
pub use pipeline_factory::PipelineFactory;
pub use status::StatusCode;
pub use types::{Buffer, PredictRequest, PredictResponse, Precision};
pub use validation::ExecutionPlan;
