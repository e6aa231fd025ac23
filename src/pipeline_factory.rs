//! Registry of pipeline definitions keyed by pipeline name.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, instrument};

use crate::pipeline::Pipeline;
use crate::pipeline_definition::{Dependencies, PipelineDefinition};
use crate::status::StatusCode;
use crate::types::{Connections, NodeInfo, PipelineDefinitionStatus, PredictRequest, PredictResponse};

/// Thread-safe map of pipeline definitions.
///
/// Lookups take the shared lock; registration, reload and retirement take it exclusively.
/// Validation runs without the lock held.
#[derive(Debug, Default)]
pub struct PipelineFactory {
  definitions: RwLock<HashMap<String, Arc<PipelineDefinition>>>,
}

impl PipelineFactory {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn exists(&self, name: &str) -> bool {
    self.definitions.read().contains_key(name)
  }

  pub fn find(&self, name: &str) -> Option<Arc<PipelineDefinition>> {
    self.definitions.read().get(name).cloned()
  }

  /// Registers and validates a new definition.
  ///
  /// A retired definition of the same name is replaced. A definition that fails
  /// validation is not registered.
  #[instrument(level = "trace", skip(self, nodes, connections, deps))]
  pub fn create_definition(
    &self,
    name: &str,
    nodes: Vec<NodeInfo>,
    connections: Connections,
    deps: &Dependencies,
  ) -> Result<(), StatusCode> {
    let is_taken = |definitions: &HashMap<String, Arc<PipelineDefinition>>| {
      definitions
        .get(name)
        .is_some_and(|d| !d.status().is_retired())
    };
    if is_taken(&*self.definitions.read()) {
      error!(pipeline = name, "pipeline definition is already created");
      return Err(StatusCode::DefinitionAlreadyExists);
    }
    let definition = Arc::new(PipelineDefinition::new(name, nodes, connections));
    definition.validate(deps).inspect_err(|status| {
      error!(pipeline = name, %status, "loading pipeline definition failed");
    })?;
    let mut definitions = self.definitions.write();
    if is_taken(&*definitions) {
      error!(pipeline = name, "pipeline definition was created concurrently");
      return Err(StatusCode::DefinitionAlreadyExists);
    }
    definitions.insert(name.to_string(), definition);
    info!(pipeline = name, "loading pipeline definition succeeded");
    Ok(())
  }

  /// Replaces the shape of a registered definition.
  ///
  /// A retired definition is superseded by a fresh one built from the new shape.
  #[instrument(level = "trace", skip(self, nodes, connections, deps))]
  pub fn reload_definition(
    &self,
    name: &str,
    nodes: Vec<NodeInfo>,
    connections: Connections,
    deps: &Dependencies,
  ) -> Result<(), StatusCode> {
    let Some(definition) = self.find(name) else {
      error!(pipeline = name, "requested to reload pipeline definition that does not exist");
      return Err(StatusCode::DefinitionNameMissing);
    };
    if !definition.status().is_retired() {
      return definition.reload(deps, nodes, connections);
    }
    let fresh = Arc::new(PipelineDefinition::new(name, nodes, connections));
    let result = fresh.validate(deps);
    let mut definitions = self.definitions.write();
    if definitions
      .get(name)
      .is_some_and(|current| Arc::ptr_eq(current, &definition))
    {
      definitions.insert(name.to_string(), fresh);
    }
    result
  }

  /// Retires every definition whose name is not in `names`; idempotent.
  pub fn retire_other_than(&self, names: &HashSet<String>) {
    let definitions = self.definitions.write();
    for (name, definition) in definitions.iter() {
      if !names.contains(name) && !definition.status().is_retired() {
        definition.retire();
      }
    }
  }

  /// Revalidates every definition flagged as needing it; failures are logged only.
  pub fn revalidate_pipelines(&self, deps: &Dependencies) {
    let flagged: Vec<Arc<PipelineDefinition>> = self
      .definitions
      .read()
      .values()
      .filter(|d| d.status().is_revalidation_required())
      .cloned()
      .collect();
    for definition in flagged {
      match definition.validate(deps) {
        Ok(()) => debug!(pipeline = definition.name(), "revalidation succeeded"),
        Err(status) => error!(pipeline = definition.name(), %status, "revalidation failed"),
      }
    }
  }

  /// Flags every definition using `model` for revalidation; returns how many were flagged.
  pub fn notify_model_changed(&self, model: &str) -> usize {
    self
      .definitions
      .read()
      .values()
      .filter(|d| d.notify_used_model_changed(model))
      .count()
  }

  /// Name → status snapshot.
  pub fn statuses(&self) -> BTreeMap<String, PipelineDefinitionStatus> {
    self
      .definitions
      .read()
      .iter()
      .map(|(name, d)| (name.clone(), d.status()))
      .collect()
  }

  /// Builds an instance of `name` bound to `request` and `response`.
  ///
  /// The registry lock is released before the instance is built.
  pub fn create<'a>(
    &self,
    name: &str,
    deps: &Dependencies,
    request: &'a PredictRequest,
    response: &'a mut PredictResponse,
  ) -> Result<Pipeline<'a>, StatusCode> {
    let definition = self.find(name).ok_or_else(|| {
      info!(pipeline = name, "pipeline with requested name does not exist");
      StatusCode::DefinitionNameMissing
    })?;
    definition.create(deps, request, response)
  }
}
