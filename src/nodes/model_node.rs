//! Model node: one inference step on the external backend.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use tracing::{error, instrument};

use crate::model::ModelBackend;
use crate::status::StatusCode;
use crate::types::Buffer;

pub(crate) struct ModelNode {
  name: String,
  model_name: String,
  version: Option<u64>,
  backend: Arc<dyn ModelBackend>,
  inputs: Vec<String>,
  outputs: Arc<BTreeSet<String>>,
}

impl fmt::Debug for ModelNode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ModelNode")
      .field("name", &self.name)
      .field("model_name", &self.model_name)
      .field("version", &self.version)
      .finish()
  }
}

impl ModelNode {
  pub(crate) fn new(
    name: String,
    model_name: String,
    version: Option<u64>,
    backend: Arc<dyn ModelBackend>,
    inputs: Vec<String>,
    outputs: Arc<BTreeSet<String>>,
  ) -> Self {
    Self {
      name,
      model_name,
      version,
      backend,
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

  #[instrument(level = "trace", skip(self, inputs), fields(node = %self.name, model = %self.model_name))]
  pub(crate) async fn run(
    &self,
    inputs: HashMap<String, Buffer>,
  ) -> Result<HashMap<String, Buffer>, StatusCode> {
    self
      .backend
      .infer(&self.model_name, self.version, inputs)
      .await
      .inspect_err(|status| error!(node = %self.name, %status, "model inference failed"))
  }
}
