//! Custom node: one call into a custom node library, on the blocking pool.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::error;

use crate::custom_node::{NodeLibrary, NodeParameters};
use crate::status::StatusCode;
use crate::types::Buffer;

#[derive(Debug)]
pub(crate) struct CustomNode {
  name: String,
  library: NodeLibrary,
  parameters: Arc<NodeParameters>,
  inputs: Vec<String>,
  outputs: Arc<BTreeSet<String>>,
}

impl CustomNode {
  pub(crate) fn new(
    name: String,
    library: NodeLibrary,
    parameters: Arc<NodeParameters>,
    inputs: Vec<String>,
    outputs: Arc<BTreeSet<String>>,
  ) -> Self {
    Self {
      name,
      library,
      parameters,
      inputs,
      outputs,
    }
  }

  pub(crate) fn name(&self) -> &str {
    &self.name
  }

  pub(crate) fn declared_inputs(&self) -> &[String] {
    &self.inputs
  }

  pub(crate) fn declared_outputs(&self) -> &BTreeSet<String> {
    &self.outputs
  }

  pub(crate) async fn run(
    &self,
    inputs: HashMap<String, Buffer>,
  ) -> Result<HashMap<String, Buffer>, StatusCode> {
    let name = self.name.clone();
    let library = self.library.clone();
    let parameters = Arc::clone(&self.parameters);
    let outputs = Arc::clone(&self.outputs);
    tokio::task::spawn_blocking(move || library.execute(&name, &inputs, &parameters, &outputs))
      .await
      .map_err(|e| {
        error!(node = %self.name, error = %e, "custom node task did not complete");
        StatusCode::NodeLibraryExecutionFailed
      })?
  }
}
