//! Node descriptors and connection tables of a pipeline definition.

use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Name of the entry node in configuration files.
pub const ENTRY_NODE_NAME: &str = "request";
/// Name of the exit node in configuration files.
pub const EXIT_NODE_NAME: &str = "response";

/// Kind of a pipeline node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
  Entry,
  Exit,
  Model,
  Custom,
}

/// How many branches a demultiplexing node fans out into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemultiplyCount {
  /// Leading dimension of every output must equal this count.
  Fixed(u32),
  /// Branch count is taken from the leading dimension at run time.
  Dynamic,
}

/// Descriptor of one node, owned by its pipeline definition.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfo {
  pub kind: NodeKind,
  pub name: String,
  pub model_name: Option<String>,
  /// `None` selects the backend's default version.
  pub model_version: Option<u64>,
  pub library_name: Option<String>,
  pub parameters: BTreeMap<String, String>,
  /// Alias under which an output is consumed → real output name produced by the node.
  ///
  /// For the entry node the keys are the pipeline input names.
  pub output_aliases: HashMap<String, String>,
  pub demultiply_count: Option<DemultiplyCount>,
  /// Demultiplexing nodes whose branches this node gathers back.
  pub gather_from: BTreeSet<String>,
}

impl NodeInfo {
  fn with_kind(kind: NodeKind, name: impl Into<String>) -> Self {
    Self {
      kind,
      name: name.into(),
      model_name: None,
      model_version: None,
      library_name: None,
      parameters: BTreeMap::new(),
      output_aliases: HashMap::new(),
      demultiply_count: None,
      gather_from: BTreeSet::new(),
    }
  }

  /// Entry node exposing the given pipeline inputs.
  pub fn entry<I, S>(name: impl Into<String>, inputs: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let mut info = Self::with_kind(NodeKind::Entry, name);
    for input in inputs {
      let input = input.into();
      info.output_aliases.insert(input.clone(), input);
    }
    info
  }

  pub fn exit(name: impl Into<String>) -> Self {
    Self::with_kind(NodeKind::Exit, name)
  }

  pub fn model(name: impl Into<String>, model_name: impl Into<String>, version: Option<u64>) -> Self {
    let mut info = Self::with_kind(NodeKind::Model, name);
    info.model_name = Some(model_name.into());
    info.model_version = version;
    info
  }

  pub fn custom<I, K, V>(name: impl Into<String>, library_name: impl Into<String>, parameters: I) -> Self
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
  {
    let mut info = Self::with_kind(NodeKind::Custom, name);
    info.library_name = Some(library_name.into());
    info.parameters = parameters
      .into_iter()
      .map(|(k, v)| (k.into(), v.into()))
      .collect();
    info
  }

  pub fn with_alias(mut self, alias: impl Into<String>, output: impl Into<String>) -> Self {
    self.output_aliases.insert(alias.into(), output.into());
    self
  }

  pub fn with_demultiply(mut self, count: DemultiplyCount) -> Self {
    self.demultiply_count = Some(count);
    self
  }

  pub fn with_gather_from(mut self, node: impl Into<String>) -> Self {
    self.gather_from.insert(node.into());
    self
  }

  /// Real output name for a consumed alias; unaliased names map to themselves.
  pub fn real_output_name<'a>(&'a self, alias: &'a str) -> &'a str {
    self
      .output_aliases
      .get(alias)
      .map(String::as_str)
      .unwrap_or(alias)
  }
}

/// `(source output alias, destination input name)` pairs of one edge.
pub type InputPairs = Vec<(String, String)>;

/// Destination node → source node → buffer pairs.
pub type Connections = HashMap<String, HashMap<String, InputPairs>>;

/// Adds buffer pairs flowing from `source` into `destination`.
pub fn connect<I, A, B>(connections: &mut Connections, source: &str, destination: &str, pairs: I)
where
  I: IntoIterator<Item = (A, B)>,
  A: Into<String>,
  B: Into<String>,
{
  connections
    .entry(destination.to_string())
    .or_default()
    .entry(source.to_string())
    .or_default()
    .extend(pairs.into_iter().map(|(a, b)| (a.into(), b.into())));
}
