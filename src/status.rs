//! Status codes surfaced by the registry, validation, execution and sequence layers.
//!
//! Success is `Ok(..)`; every variant here is a failure. Codes are grouped by
//! where they are raised so operators can tell a malformed graph from a buggy
//! external kernel.

use thiserror::Error;

/// Failure status of a registry, validation, execution or sequence operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum StatusCode {
  // Registry
  #[error("pipeline definition already exists")]
  DefinitionAlreadyExists,
  #[error("pipeline definition with requested name does not exist")]
  DefinitionNameMissing,
  #[error("pipeline definition is not loaded yet")]
  DefinitionNotLoadedYet,

  // Validation (configuration errors)
  #[error("pipeline node name is duplicated")]
  PipelineNodeNameDuplicate,
  #[error("pipeline must have exactly one entry and one exit node")]
  PipelineMissingEntryOrExit,
  #[error("pipeline refers to a node that does not exist")]
  PipelineNodeReferingToMissingNode,
  #[error("pipeline connects to a node input that does not exist")]
  PipelineConnectionToMissingNodeInput,
  #[error("pipeline refers to a node output that does not exist")]
  PipelineNodeReferingToMissingDataSource,
  #[error("pipeline connects the same node input more than once")]
  PipelineDuplicateInputName,
  #[error("pipeline node has no connected inputs")]
  PipelineNodeWithoutInputs,
  #[error("not all node inputs are connected")]
  PipelineNotAllInputsConnected,
  #[error("pipeline contains a cycle")]
  PipelineCycleFound,
  #[error("pipeline node refers to a model that is not available")]
  PipelineNodeReferingToMissingModel,
  #[error("pipeline node refers to a custom node library that is not loaded")]
  PipelineDefinitionInvalidNodeLibrary,
  #[error("demultiplexer and gather nodes are not paired correctly")]
  PipelineDemultiplexerGatherMismatch,
  #[error("demultiply count is invalid")]
  PipelineInvalidDemultiplyCount,

  // Request
  #[error("invalid request format")]
  InvalidRequestFormat,
  #[error("declared pipeline output was never produced")]
  InvalidMissingOutput,
  #[error("node did not produce an output consumed by the pipeline")]
  NodeMissingOutput,

  // Demultiplexing at run time
  #[error("demultiplexer output does not match configured demultiply count")]
  PipelineDemultiplyCountMismatch,
  #[error("demultiplexer produced no branches")]
  PipelineDemultiplexerNoResults,
  #[error("gathered branch buffers differ in shape or precision")]
  PipelineGatherShapeMismatch,

  // Custom node library boundary
  #[error("custom node library execution failed")]
  NodeLibraryExecutionFailed,
  #[error("custom node library returned corrupted outputs handle")]
  NodeLibraryOutputsCorrupted,
  #[error("custom node library returned corrupted number of outputs")]
  NodeLibraryOutputsCorruptedCount,
  #[error("custom node library did not return an output consumed by the pipeline")]
  NodeLibraryMissingOutput,
  #[error("custom node library returned output with invalid precision")]
  NodeLibraryInvalidPrecision,
  #[error("custom node library returned output with invalid shape")]
  NodeLibraryInvalidShape,
  #[error("custom node library returned output with invalid content size")]
  NodeLibraryInvalidContentSize,
  #[error("custom node library metadata call failed")]
  NodeLibraryMetadataFailed,

  // Resources
  #[error("custom node library failed to load")]
  NodeLibraryLoadFailed,
  #[error("path is invalid or escapes the allowed root")]
  PathInvalid,

  // Model backend
  #[error("model inference failed")]
  ModelExecutionFailed,

  // Sequences
  #[error("sequence with provided id does not exist")]
  SequenceMissing,
  #[error("sequence with provided id already exists")]
  SequenceAlreadyExists,
  #[error("sequence with provided id has been terminated")]
  SequenceTerminated,
  #[error("max sequence number has been reached")]
  MaxSequenceNumberReached,
  #[error("sequence manager is already registered")]
  SequenceManagerAlreadyRegistered,
  #[error("sequence manager is not registered")]
  SequenceManagerMissing,
}

impl StatusCode {
  /// True for failures raised at the custom node library boundary.
  pub fn is_node_library_error(&self) -> bool {
    matches!(
      self,
      StatusCode::NodeLibraryExecutionFailed
        | StatusCode::NodeLibraryOutputsCorrupted
        | StatusCode::NodeLibraryOutputsCorruptedCount
        | StatusCode::NodeLibraryMissingOutput
        | StatusCode::NodeLibraryInvalidPrecision
        | StatusCode::NodeLibraryInvalidShape
        | StatusCode::NodeLibraryInvalidContentSize
        | StatusCode::NodeLibraryMetadataFailed
    )
  }
}
