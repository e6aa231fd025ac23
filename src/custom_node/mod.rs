//! Custom node libraries: the C ABI, the validated call wrapper and the library registry.

mod abi;
mod library_manager;
mod node_library;
#[cfg(test)]
mod node_library_test;

pub use abi::{
  CustomNodeParam, CustomNodeTensor, CustomNodeTensorInfo, EXECUTE_SYMBOL, ExecuteFn,
  GET_INPUTS_INFO_SYMBOL, GET_OUTPUTS_INFO_SYMBOL, MetadataFn, RELEASE_SYMBOL, ReleaseFn,
};
pub use library_manager::CustomNodeLibraryManager;
pub use node_library::{NodeLibrary, NodeParameters, TensorInfo};
