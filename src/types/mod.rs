//! Shared data types: buffers, request/response, node descriptors and definition lifecycle.

mod buffer;
mod definition_state;
mod node_info;
mod precision;
mod request;

pub use buffer::{Buffer, BufferError};
pub(crate) use buffer::expected_content_len;
pub use definition_state::{DefinitionEvent, PipelineDefinitionState, PipelineDefinitionStatus};
pub use node_info::{
  Connections, DemultiplyCount, ENTRY_NODE_NAME, EXIT_NODE_NAME, InputPairs, NodeInfo, NodeKind,
  connect,
};
pub use precision::{Precision, UnknownPrecision};
pub use request::{PredictRequest, PredictResponse};
