//! Exit node: collects the buffers that make up the response.

use std::collections::HashMap;

use crate::types::Buffer;

#[derive(Debug)]
pub(crate) struct ExitNode {
  name: String,
  /// Pipeline output names.
  inputs: Vec<String>,
}

impl ExitNode {
  pub(crate) fn new(name: String, inputs: Vec<String>) -> Self {
    Self { name, inputs }
  }

  pub(crate) fn name(&self) -> &str {
    &self.name
  }

  pub(crate) fn declared_inputs(&self) -> &[String] {
    &self.inputs
  }

  /// Hands its inputs back; the instance writes them into the response once execution ends.
  pub(crate) fn run(&self, inputs: HashMap<String, Buffer>) -> HashMap<String, Buffer> {
    inputs
  }
}
