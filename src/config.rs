//! JSON server configuration: custom node libraries and pipeline definitions.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::types::{
  Connections, DemultiplyCount, ENTRY_NODE_NAME, EXIT_NODE_NAME, NodeInfo, connect,
};

/// Reason a configuration could not be loaded or converted.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config file {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("malformed config: {0}")]
  Json(#[from] serde_json::Error),
  #[error("invalid pipeline {pipeline}: {reason}")]
  Invalid { pipeline: String, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
  #[serde(default)]
  pub custom_node_library_config_list: Vec<LibraryConfig>,
  #[serde(default)]
  pub pipeline_config_list: Vec<PipelineConfig>,
  /// Fixed period of the sequence timeout watcher; derived from timeouts when absent.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub sequence_watcher_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryConfig {
  pub name: String,
  pub base_path: PathBuf,
}

/// Producer of a consumed buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
  pub node_name: String,
  pub data_item: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
  pub data_item: String,
  pub alias: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
  #[serde(rename = "custom")]
  Custom,
  #[serde(rename = "DL model")]
  Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
  pub name: String,
  #[serde(rename = "type")]
  pub kind: NodeType,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub library_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub model_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub version: Option<u64>,
  #[serde(default)]
  pub params: BTreeMap<String, String>,
  /// Each entry maps one input name to its producer.
  #[serde(default)]
  pub inputs: Vec<HashMap<String, DataSource>>,
  #[serde(default)]
  pub outputs: Vec<OutputConfig>,
  /// `-1` selects dynamic demultiplication.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub demultiply_count: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub gather_from_node: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
  pub name: String,
  #[serde(default)]
  pub inputs: Vec<String>,
  #[serde(default)]
  pub nodes: Vec<NodeConfig>,
  /// Each entry maps one pipeline output name to its producer.
  #[serde(default)]
  pub outputs: Vec<HashMap<String, DataSource>>,
  /// Demultiplexer gathered by the exit node.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub gather_from_node: Option<String>,
}

impl EngineConfig {
  #[instrument(level = "trace")]
  pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
    let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Ok(serde_json::from_slice(&bytes)?)
  }

  #[allow(clippy::should_implement_trait)]
  pub fn from_str(json: &str) -> Result<Self, ConfigError> {
    Ok(serde_json::from_str(json)?)
  }

  pub fn sequence_watcher_interval(&self) -> Option<Duration> {
    self.sequence_watcher_interval_ms.map(Duration::from_millis)
  }
}

impl PipelineConfig {
  /// Converts to node descriptors (entry first, exit last) and the connection table.
  pub fn to_definition(&self) -> Result<(Vec<NodeInfo>, Connections), ConfigError> {
    let mut nodes = Vec::with_capacity(self.nodes.len() + 2);
    let mut connections = Connections::new();
    nodes.push(NodeInfo::entry(ENTRY_NODE_NAME, self.inputs.iter().cloned()));

    for node in &self.nodes {
      let mut info = match node.kind {
        NodeType::Custom => {
          let library = node
            .library_name
            .as_deref()
            .ok_or_else(|| self.invalid(format!("custom node {} has no library_name", node.name)))?;
          NodeInfo::custom(&node.name, library, node.params.clone())
        }
        NodeType::Model => {
          let model = node
            .model_name
            .as_deref()
            .ok_or_else(|| self.invalid(format!("model node {} has no model_name", node.name)))?;
          NodeInfo::model(&node.name, model, node.version)
        }
      };
      for output in &node.outputs {
        info = info.with_alias(&output.alias, &output.data_item);
      }
      if let Some(count) = node.demultiply_count {
        info = info.with_demultiply(self.demultiply_count(&node.name, count)?);
      }
      if let Some(gather) = &node.gather_from_node {
        info = info.with_gather_from(gather);
      }
      for input in &node.inputs {
        for (name, source) in input {
          connect(
            &mut connections,
            &source.node_name,
            &node.name,
            [(source.data_item.as_str(), name.as_str())],
          );
        }
      }
      nodes.push(info);
    }

    let mut exit = NodeInfo::exit(EXIT_NODE_NAME);
    if let Some(gather) = &self.gather_from_node {
      exit = exit.with_gather_from(gather);
    }
    for output in &self.outputs {
      for (name, source) in output {
        connect(
          &mut connections,
          &source.node_name,
          EXIT_NODE_NAME,
          [(source.data_item.as_str(), name.as_str())],
        );
      }
    }
    nodes.push(exit);
    Ok((nodes, connections))
  }

  fn demultiply_count(&self, node: &str, count: i64) -> Result<DemultiplyCount, ConfigError> {
    if count == -1 {
      return Ok(DemultiplyCount::Dynamic);
    }
    u32::try_from(count)
      .map(DemultiplyCount::Fixed)
      .map_err(|_| self.invalid(format!("node {node} has invalid demultiply_count {count}")))
  }

  fn invalid(&self, reason: String) -> ConfigError {
    ConfigError::Invalid {
      pipeline: self.name.clone(),
      reason,
    }
  }
}
