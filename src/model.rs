//! Interface to the external model-inference backend.
//!
//! The engine only needs a model's signature (for validation) and a way to run one
//! inference step on named buffers.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::status::StatusCode;
use crate::types::{Buffer, Precision};

/// Declared signature of one model version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelSignature {
  /// Input name → element type.
  pub inputs: HashMap<String, Precision>,
  /// Output name → element type.
  pub outputs: HashMap<String, Precision>,
}

impl ModelSignature {
  pub fn new<I, O>(inputs: I, outputs: O) -> Self
  where
    I: IntoIterator<Item = (&'static str, Precision)>,
    O: IntoIterator<Item = (&'static str, Precision)>,
  {
    Self {
      inputs: inputs
        .into_iter()
        .map(|(n, p)| (n.to_string(), p))
        .collect(),
      outputs: outputs
        .into_iter()
        .map(|(n, p)| (n.to_string(), p))
        .collect(),
    }
  }
}

/// External inference backend executing single model steps.
#[async_trait]
pub trait ModelBackend: Send + Sync {
  /// Signature of `name` at `version` (`None` = default version), or `None` if not served.
  fn signature(&self, name: &str, version: Option<u64>) -> Option<ModelSignature>;

  /// Runs one inference step.
  async fn infer(
    &self,
    name: &str,
    version: Option<u64>,
    inputs: HashMap<String, Buffer>,
  ) -> Result<HashMap<String, Buffer>, StatusCode>;
}

/// Backend serving no models; pipelines built from custom nodes only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoModelBackend;

#[async_trait]
impl ModelBackend for NoModelBackend {
  fn signature(&self, _name: &str, _version: Option<u64>) -> Option<ModelSignature> {
    None
  }

  async fn infer(
    &self,
    _name: &str,
    _version: Option<u64>,
    _inputs: HashMap<String, Buffer>,
  ) -> Result<HashMap<String, Buffer>, StatusCode> {
    Err(StatusCode::PipelineNodeReferingToMissingModel)
  }
}
