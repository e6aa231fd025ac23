//! Process-scoped owner of the registry, libraries and sequence watcher.
//!
//! Construct one [`ServableManager`] at startup, feed it configurations through
//! [`load_config`](ServableManager::load_config), and call
//! [`shutdown`](ServableManager::shutdown) before the runtime stops.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, instrument};

use crate::config::{ConfigError, EngineConfig};
use crate::custom_node::CustomNodeLibraryManager;
use crate::model::ModelBackend;
use crate::pipeline_definition::Dependencies;
use crate::pipeline_factory::PipelineFactory;
use crate::sequence::GlobalSequencesViewer;
use crate::status::StatusCode;
use crate::types::{PipelineDefinitionStatus, PredictRequest, PredictResponse};

/// One part of a configuration that could not be applied.
#[derive(Debug, Error)]
pub enum LoadError {
  #[error("custom node library {name}: {status}")]
  Library { name: String, status: StatusCode },
  #[error("pipeline {name}: {status}")]
  Pipeline { name: String, status: StatusCode },
  #[error(transparent)]
  Config(#[from] ConfigError),
}

#[derive(Debug)]
pub struct ServableManager {
  deps: Dependencies,
  factory: PipelineFactory,
  sequences: GlobalSequencesViewer,
}

impl ServableManager {
  /// Manager whose libraries must resolve under `library_root` when one is given.
  pub fn new(models: Arc<dyn ModelBackend>, library_root: Option<PathBuf>) -> Self {
    let libraries = Arc::new(CustomNodeLibraryManager::new(library_root));
    Self::with_dependencies(Dependencies::new(models, libraries))
  }

  pub fn with_dependencies(deps: Dependencies) -> Self {
    Self {
      deps,
      factory: PipelineFactory::new(),
      sequences: GlobalSequencesViewer::new(),
    }
  }

  pub fn dependencies(&self) -> &Dependencies {
    &self.deps
  }

  pub fn libraries(&self) -> &CustomNodeLibraryManager {
    &self.deps.libraries
  }

  pub fn factory(&self) -> &PipelineFactory {
    &self.factory
  }

  pub fn sequences(&self) -> &GlobalSequencesViewer {
    &self.sequences
  }

  /// Applies a full replacement configuration.
  ///
  /// Libraries are loaded first, then pipelines are created or reloaded, then
  /// pipelines absent from `config` are retired. A failing library or pipeline
  /// does not stop the rest of the configuration from being applied. Returns
  /// every failure; an empty list means the whole configuration is active.
  #[instrument(level = "trace", skip(self, config))]
  pub fn load_config(&self, config: &EngineConfig) -> Vec<LoadError> {
    let mut failures = Vec::new();

    for library in &config.custom_node_library_config_list {
      if let Err(status) = self.deps.libraries.load_library(&library.name, &library.base_path) {
        error!(library = %library.name, %status, "loading custom node library failed");
        failures.push(LoadError::Library {
          name: library.name.clone(),
          status,
        });
      }
    }

    let mut names = HashSet::new();
    for pipeline in &config.pipeline_config_list {
      names.insert(pipeline.name.clone());
      let (nodes, connections) = match pipeline.to_definition() {
        Ok(definition) => definition,
        Err(e) => {
          error!(pipeline = %pipeline.name, error = %e, "pipeline config is invalid");
          failures.push(e.into());
          continue;
        }
      };
      let result = if self.factory.exists(&pipeline.name) {
        self
          .factory
          .reload_definition(&pipeline.name, nodes, connections, &self.deps)
      } else {
        self
          .factory
          .create_definition(&pipeline.name, nodes, connections, &self.deps)
      };
      if let Err(status) = result {
        failures.push(LoadError::Pipeline {
          name: pipeline.name.clone(),
          status,
        });
      }
    }
    self.factory.retire_other_than(&names);

    self
      .sequences
      .set_fixed_interval(config.sequence_watcher_interval());
    info!(
      pipelines = names.len(),
      failures = failures.len(),
      "configuration applied"
    );
    failures
  }

  /// Flags pipelines using `model` and revalidates them; returns how many were flagged.
  pub fn notify_model_changed(&self, model: &str) -> usize {
    let flagged = self.factory.notify_model_changed(model);
    if flagged > 0 {
      self.factory.revalidate_pipelines(&self.deps);
    }
    flagged
  }

  pub fn statuses(&self) -> BTreeMap<String, PipelineDefinitionStatus> {
    self.factory.statuses()
  }

  /// Runs one request through the named pipeline.
  pub async fn execute(
    &self,
    pipeline: &str,
    request: &PredictRequest,
  ) -> Result<PredictResponse, StatusCode> {
    let mut response = PredictResponse::default();
    self
      .factory
      .create(pipeline, &self.deps, request, &mut response)?
      .execute()
      .await?;
    Ok(response)
  }

  /// Starts the sequence timeout watcher on the current runtime.
  pub fn start(&self) {
    self.sequences.start_watcher();
  }

  /// Stops the sequence timeout watcher and waits for it to exit.
  pub async fn shutdown(&self) {
    self.sequences.join().await;
    info!("servable manager shut down");
  }
}
