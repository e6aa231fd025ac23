//! Request/response boundary consumed by the entry and exit nodes.

use std::collections::HashMap;

use super::Buffer;

/// Named input buffers of one client request.
#[derive(Debug, Clone, Default)]
pub struct PredictRequest {
  pub inputs: HashMap<String, Buffer>,
}

impl PredictRequest {
  pub fn new() -> Self {
    Self::default()
  }

  /// Adds (or replaces) a named input, builder style.
  pub fn with_input(mut self, name: impl Into<String>, buffer: Buffer) -> Self {
    self.inputs.insert(name.into(), buffer);
    self
  }
}

/// Named output buffers written by the exit node.
#[derive(Debug, Clone, Default)]
pub struct PredictResponse {
  pub outputs: HashMap<String, Buffer>,
}
