//! Pipeline definition: a named graph template with its lifecycle state.
//!
//! A successful validation produces an immutable [ExecutionPlan]. Instances hold the plan
//! they were created from, so reloading or retiring the definition never disturbs
//! executions already in flight. The last good plan keeps serving new requests while a
//! replacement validates; it is dropped only when validation fails or on retirement.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, instrument};

use crate::custom_node::CustomNodeLibraryManager;
use crate::model::ModelBackend;
use crate::pipeline::Pipeline;
use crate::status::StatusCode;
use crate::types::{
  Connections, DefinitionEvent, NodeInfo, NodeKind, PipelineDefinitionState,
  PipelineDefinitionStatus, PredictRequest, PredictResponse,
};
use crate::validation::{ExecutionPlan, validate};

/// Collaborators consulted by validation and execution.
#[derive(Clone)]
pub struct Dependencies {
  pub models: Arc<dyn ModelBackend>,
  pub libraries: Arc<CustomNodeLibraryManager>,
}

impl Dependencies {
  pub fn new(models: Arc<dyn ModelBackend>, libraries: Arc<CustomNodeLibraryManager>) -> Self {
    Self { models, libraries }
  }
}

impl fmt::Debug for Dependencies {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Dependencies").finish_non_exhaustive()
  }
}

#[derive(Debug)]
struct Inner {
  nodes: Vec<NodeInfo>,
  connections: Connections,
  /// Plan served to new requests; `None` until a validation passes and after one fails.
  plan: Option<Arc<ExecutionPlan>>,
  status: PipelineDefinitionStatus,
  /// Bumped by every successful reload; a validation started on an older shape is discarded.
  generation: u64,
}

/// Named graph template registered in the [crate::PipelineFactory].
#[derive(Debug)]
pub struct PipelineDefinition {
  name: String,
  inner: RwLock<Inner>,
}

impl PipelineDefinition {
  pub fn new(name: impl Into<String>, nodes: Vec<NodeInfo>, connections: Connections) -> Self {
    Self {
      name: name.into(),
      inner: RwLock::new(Inner {
        nodes,
        connections,
        plan: None,
        status: PipelineDefinitionStatus::default(),
        generation: 0,
      }),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn status(&self) -> PipelineDefinitionStatus {
    self.inner.read().status
  }

  pub fn state(&self) -> PipelineDefinitionState {
    self.status().state()
  }

  /// Validates the current shape and makes the definition available on success.
  #[instrument(level = "trace", skip(self, deps), fields(pipeline = %self.name))]
  pub fn validate(&self, deps: &Dependencies) -> Result<(), StatusCode> {
    let (nodes, connections, generation) = {
      let mut inner = self.inner.write();
      if inner.status.is_retired() {
        return Err(StatusCode::DefinitionNameMissing);
      }
      inner.status.handle(DefinitionEvent::ValidationStarted);
      (inner.nodes.clone(), inner.connections.clone(), inner.generation)
    };
    let result = validate(&self.name, &nodes, &connections, deps);
    let mut inner = self.inner.write();
    if inner.generation != generation || inner.status.is_retired() {
      return result.map(|_| ());
    }
    match result {
      Ok(plan) => {
        inner.plan = Some(Arc::new(plan));
        inner.status.handle(DefinitionEvent::ValidationPassed);
        info!(pipeline = %self.name, "pipeline definition is available");
        Ok(())
      }
      Err(status) => {
        inner.plan = None;
        inner.status.handle(DefinitionEvent::ValidationFailed);
        error!(pipeline = %self.name, %status, "pipeline definition validation failed");
        Err(status)
      }
    }
  }

  /// Replaces the shape after validating the replacement.
  ///
  /// The current plan keeps serving while the replacement validates and is swapped only
  /// on success. On failure the previous shape is kept but the definition stops serving
  /// until a later validation succeeds.
  #[instrument(level = "trace", skip(self, deps, nodes, connections), fields(pipeline = %self.name))]
  pub fn reload(
    &self,
    deps: &Dependencies,
    nodes: Vec<NodeInfo>,
    connections: Connections,
  ) -> Result<(), StatusCode> {
    {
      let mut inner = self.inner.write();
      if inner.status.is_retired() {
        return Err(StatusCode::DefinitionNameMissing);
      }
      inner.status.handle(DefinitionEvent::ReloadStarted);
    }
    let result = validate(&self.name, &nodes, &connections, deps);
    let mut inner = self.inner.write();
    match result {
      Ok(plan) => {
        inner.nodes = nodes;
        inner.connections = connections;
        inner.plan = Some(Arc::new(plan));
        inner.generation += 1;
        inner.status.handle(DefinitionEvent::ValidationPassed);
        info!(pipeline = %self.name, "pipeline definition reloaded");
        Ok(())
      }
      Err(status) => {
        inner.plan = None;
        inner.status.handle(DefinitionEvent::ValidationFailed);
        error!(pipeline = %self.name, %status, "pipeline definition reload failed");
        Err(status)
      }
    }
  }

  /// Retires the definition; idempotent and irreversible.
  pub fn retire(&self) {
    let mut inner = self.inner.write();
    if inner.status.is_retired() {
      return;
    }
    inner.status.handle(DefinitionEvent::Retire);
    inner.plan = None;
    info!(pipeline = %self.name, "pipeline definition retired");
  }

  /// Plan new instances are built from, if any.
  pub fn plan(&self) -> Option<Arc<ExecutionPlan>> {
    self.inner.read().plan.clone()
  }

  pub fn uses_model(&self, model: &str) -> bool {
    self
      .inner
      .read()
      .nodes
      .iter()
      .any(|n| n.kind == NodeKind::Model && n.model_name.as_deref() == Some(model))
  }

  /// Flags the definition for revalidation when it references `model`.
  ///
  /// The current plan keeps serving until the revalidation outcome is known.
  pub fn notify_used_model_changed(&self, model: &str) -> bool {
    if !self.uses_model(model) {
      return false;
    }
    let mut inner = self.inner.write();
    inner.status.handle(DefinitionEvent::UsedModelChanged);
    info!(pipeline = %self.name, model, "used model changed, revalidation required");
    !inner.status.is_retired()
  }

  /// Builds an instance bound to `request` and `response`.
  ///
  /// Served from the current plan in every state but retired, including while a
  /// validation or reload is in progress.
  pub fn create<'a>(
    &self,
    deps: &Dependencies,
    request: &'a PredictRequest,
    response: &'a mut PredictResponse,
  ) -> Result<Pipeline<'a>, StatusCode> {
    let plan = {
      let inner = self.inner.read();
      if inner.status.is_retired() {
        return Err(StatusCode::DefinitionNameMissing);
      }
      match &inner.plan {
        Some(plan) => Arc::clone(plan),
        None => {
          info!(pipeline = %self.name, state = %inner.status.state(), "pipeline definition is not loaded");
          return Err(StatusCode::DefinitionNotLoadedYet);
        }
      }
    };
    Ok(Pipeline::new(&self.name, plan, deps, request, response))
  }
}
