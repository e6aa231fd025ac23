//! Entry node: seeds the pipeline with buffers taken from the request.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::error;

use crate::status::StatusCode;
use crate::types::{Buffer, PredictRequest};
use crate::validation::InputSpec;

#[derive(Debug)]
pub(crate) struct EntryNode<'a> {
  name: String,
  request: &'a PredictRequest,
  /// Pipeline input names.
  outputs: Arc<BTreeSet<String>>,
  /// What the nodes fed by each pipeline input accept.
  specs: Arc<HashMap<String, Vec<InputSpec>>>,
}

impl<'a> EntryNode<'a> {
  pub(crate) fn new(
    name: String,
    request: &'a PredictRequest,
    outputs: Arc<BTreeSet<String>>,
    specs: Arc<HashMap<String, Vec<InputSpec>>>,
  ) -> Self {
    Self {
      name,
      request,
      outputs,
      specs,
    }
  }

  pub(crate) fn name(&self) -> &str {
    &self.name
  }

  pub(crate) fn declared_outputs(&self) -> &BTreeSet<String> {
    &self.outputs
  }

  /// Copies every pipeline input out of the request; buffers share the request's memory.
  ///
  /// Each input must match the precision and shape its consumers declare.
  pub(crate) fn run(&self) -> Result<HashMap<String, Buffer>, StatusCode> {
    self
      .outputs
      .iter()
      .map(|name| {
        let buffer = self.request.inputs.get(name).ok_or_else(|| {
          error!(input = %name, "request is missing pipeline input");
          StatusCode::InvalidRequestFormat
        })?;
        let specs = self.specs.get(name).map(Vec::as_slice).unwrap_or_default();
        if let Some(spec) = specs.iter().find(|spec| !spec.accepts(buffer)) {
          error!(
            input = %name,
            precision = %buffer.precision(),
            shape = ?buffer.shape(),
            expected_precision = ?spec.precision,
            expected_shape = ?spec.shape,
            "request input does not match what the pipeline accepts"
          );
          return Err(StatusCode::InvalidRequestFormat);
        }
        Ok((name.clone(), buffer.clone()))
      })
      .collect()
  }
}
