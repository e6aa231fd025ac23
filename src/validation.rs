//! Graph validation: turns node descriptors and connections into an [ExecutionPlan].
//!
//! Every configuration error is caught here; execution only sees plans that passed.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{error, instrument, trace};

use crate::custom_node::{NodeLibrary, NodeParameters};
use crate::pipeline_definition::Dependencies;
use crate::status::StatusCode;
use crate::types::{Buffer, Connections, DemultiplyCount, NodeInfo, NodeKind, Precision};

/// What a node input accepts, as declared by the model or library behind it.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct InputSpec {
  pub precision: Option<Precision>,
  /// Dimension `0` matches any size.
  pub shape: Option<Vec<u64>>,
}

impl InputSpec {
  pub(crate) fn accepts(&self, buffer: &Buffer) -> bool {
    if self.precision.is_some_and(|p| p != buffer.precision()) {
      return false;
    }
    match &self.shape {
      None => true,
      Some(shape) => {
        shape.len() == buffer.shape().len()
          && shape
            .iter()
            .zip(buffer.shape())
            .all(|(expected, actual)| *expected == 0 || expected == actual)
      }
    }
  }
}

/// Kind-specific runtime data resolved during validation.
#[derive(Debug, Clone)]
pub(crate) enum Binding {
  Entry {
    /// Pipeline input name → what every consumer of it accepts.
    inputs: Arc<HashMap<String, Vec<InputSpec>>>,
  },
  Exit,
  Model {
    model_name: String,
    version: Option<u64>,
  },
  Custom {
    library: NodeLibrary,
    parameters: Arc<NodeParameters>,
  },
}

/// Buffers flowing from one node into one downstream node.
#[derive(Debug, Clone)]
pub(crate) struct Edge {
  pub target: usize,
  /// `(real output name, destination input name)`.
  pub pairs: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub(crate) struct PlanNode {
  pub info: NodeInfo,
  pub binding: Binding,
  /// Connected input names, sorted.
  pub inputs: Vec<String>,
  /// Real output names consumed downstream (pipeline inputs for the entry node).
  pub outputs: Arc<BTreeSet<String>>,
  pub edges: Vec<Edge>,
  /// Branch levels collapsed when this node gathers its inputs.
  pub gather_depth: usize,
}

/// Validated, immutable shape of a pipeline, shared by every instance built from it.
#[derive(Debug)]
pub struct ExecutionPlan {
  nodes: Vec<PlanNode>,
  entry: usize,
  exit: usize,
}

impl ExecutionPlan {
  pub(crate) fn nodes(&self) -> &[PlanNode] {
    &self.nodes
  }

  pub(crate) fn entry(&self) -> usize {
    self.entry
  }

  pub(crate) fn exit(&self) -> usize {
    self.exit
  }

  /// Pipeline input names.
  pub fn inputs(&self) -> impl Iterator<Item = &str> {
    self.nodes[self.entry].outputs.iter().map(String::as_str)
  }

  /// Pipeline output names.
  pub fn outputs(&self) -> impl Iterator<Item = &str> {
    self.nodes[self.exit].inputs.iter().map(String::as_str)
  }
}

/// Names a node accepts and produces, per its kind.
struct Signature {
  /// `None` for the exit node, which accepts any name.
  inputs: Option<HashMap<String, InputSpec>>,
  outputs: HashSet<String>,
}

fn resolve(info: &NodeInfo, deps: &Dependencies) -> Result<(Binding, Signature), StatusCode> {
  match info.kind {
    NodeKind::Entry => Ok((
      Binding::Entry {
        inputs: Arc::default(),
      },
      Signature {
        inputs: Some(HashMap::new()),
        outputs: info.output_aliases.keys().cloned().collect(),
      },
    )),
    NodeKind::Exit => Ok((
      Binding::Exit,
      Signature {
        inputs: None,
        outputs: HashSet::new(),
      },
    )),
    NodeKind::Model => {
      let model_name = info
        .model_name
        .clone()
        .ok_or(StatusCode::PipelineNodeReferingToMissingModel)?;
      let signature = deps
        .models
        .signature(&model_name, info.model_version)
        .ok_or_else(|| {
          error!(node = %info.name, model = %model_name, "model is not available");
          StatusCode::PipelineNodeReferingToMissingModel
        })?;
      Ok((
        Binding::Model {
          model_name,
          version: info.model_version,
        },
        Signature {
          inputs: Some(
            signature
              .inputs
              .into_iter()
              .map(|(name, precision)| {
                let spec = InputSpec {
                  precision: precision.is_specified().then_some(precision),
                  shape: None,
                };
                (name, spec)
              })
              .collect(),
          ),
          outputs: signature.outputs.into_keys().collect(),
        },
      ))
    }
    NodeKind::Custom => {
      let library = info
        .library_name
        .as_deref()
        .and_then(|name| deps.libraries.get_library(name))
        .ok_or_else(|| {
          error!(node = %info.name, library = ?info.library_name, "custom node library is not loaded");
          StatusCode::PipelineDefinitionInvalidNodeLibrary
        })?;
      let parameters = NodeParameters::new(&info.parameters)?;
      let inputs = library.inputs_info(&parameters)?;
      let outputs = library.outputs_info(&parameters)?;
      Ok((
        Binding::Custom {
          library,
          parameters: Arc::new(parameters),
        },
        Signature {
          inputs: Some(
            inputs
              .into_iter()
              .map(|t| {
                let spec = InputSpec {
                  precision: t.precision.is_specified().then_some(t.precision),
                  shape: (!t.shape.is_empty()).then_some(t.shape),
                };
                (t.name, spec)
              })
              .collect(),
          ),
          outputs: outputs.into_iter().map(|t| t.name).collect(),
        },
      ))
    }
  }
}

/// Validates the graph and builds its execution plan.
#[instrument(level = "trace", skip(nodes, connections, deps))]
pub(crate) fn validate(
  pipeline: &str,
  nodes: &[NodeInfo],
  connections: &Connections,
  deps: &Dependencies,
) -> Result<ExecutionPlan, StatusCode> {
  let mut index = HashMap::with_capacity(nodes.len());
  for (i, node) in nodes.iter().enumerate() {
    if index.insert(node.name.as_str(), i).is_some() {
      error!(pipeline, node = %node.name, "duplicated node name");
      return Err(StatusCode::PipelineNodeNameDuplicate);
    }
  }
  let single = |kind: NodeKind| {
    let mut found = nodes.iter().enumerate().filter(|(_, n)| n.kind == kind);
    match (found.next(), found.next()) {
      (Some((i, _)), None) => Ok(i),
      _ => Err(StatusCode::PipelineMissingEntryOrExit),
    }
  };
  let entry = single(NodeKind::Entry)?;
  let exit = single(NodeKind::Exit)?;

  let resolved = nodes
    .iter()
    .map(|n| resolve(n, deps))
    .collect::<Result<Vec<_>, _>>()?;

  // Destination index → (source index, pairs).
  let mut incoming: Vec<Vec<(usize, Vec<(String, String)>)>> = vec![Vec::new(); nodes.len()];
  let mut consumed: Vec<BTreeSet<String>> = vec![BTreeSet::new(); nodes.len()];
  for (destination, sources) in connections {
    let &d = index.get(destination.as_str()).ok_or_else(|| {
      error!(pipeline, node = %destination, "connection to missing node");
      StatusCode::PipelineNodeReferingToMissingNode
    })?;
    if d == entry {
      error!(pipeline, "entry node cannot have inputs");
      return Err(StatusCode::PipelineConnectionToMissingNodeInput);
    }
    let mut seen_inputs = HashSet::new();
    for (source, pairs) in sources {
      let &s = index.get(source.as_str()).ok_or_else(|| {
        error!(pipeline, node = %source, "connection from missing node");
        StatusCode::PipelineNodeReferingToMissingNode
      })?;
      let mut real_pairs = Vec::with_capacity(pairs.len());
      for (alias, input) in pairs {
        if !seen_inputs.insert(input.as_str()) {
          error!(pipeline, node = %destination, input = %input, "input connected twice");
          return Err(StatusCode::PipelineDuplicateInputName);
        }
        if let Some(accepted) = &resolved[d].1.inputs
          && !accepted.contains_key(input)
        {
          error!(pipeline, node = %destination, input = %input, "node has no such input");
          return Err(StatusCode::PipelineConnectionToMissingNodeInput);
        }
        let real = nodes[s].real_output_name(alias).to_string();
        if !resolved[s].1.outputs.contains(&real) {
          error!(pipeline, node = %source, output = %real, "node does not produce output");
          return Err(StatusCode::PipelineNodeReferingToMissingDataSource);
        }
        consumed[s].insert(real.clone());
        real_pairs.push((real, input.clone()));
      }
      if !real_pairs.is_empty() {
        incoming[d].push((s, real_pairs));
      }
    }
  }

  for (i, node) in nodes.iter().enumerate() {
    if i == entry {
      continue;
    }
    if incoming[i].is_empty() {
      error!(pipeline, node = %node.name, "node has no inputs");
      return Err(StatusCode::PipelineNodeWithoutInputs);
    }
    if let Some(accepted) = &resolved[i].1.inputs {
      let connected: HashSet<&str> = incoming[i]
        .iter()
        .flat_map(|(_, pairs)| pairs.iter().map(|(_, input)| input.as_str()))
        .collect();
      if accepted.keys().any(|a| !connected.contains(a.as_str())) {
        error!(pipeline, node = %node.name, "not all node inputs are connected");
        return Err(StatusCode::PipelineNotAllInputsConnected);
      }
    }
  }

  let order = topological_order(&incoming, nodes.len()).ok_or_else(|| {
    error!(pipeline, "pipeline contains a cycle");
    StatusCode::PipelineCycleFound
  })?;
  let gather_depths = branch_structure(pipeline, nodes, &index, &incoming, &order, entry, exit)?;

  let mut outgoing: Vec<Vec<Edge>> = vec![Vec::new(); nodes.len()];
  for (d, sources) in incoming.iter().enumerate() {
    for (s, pairs) in sources {
      outgoing[*s].push(Edge {
        target: d,
        pairs: pairs.clone(),
      });
    }
  }
  consumed[entry].extend(nodes[entry].output_aliases.keys().cloned());

  let mut entry_specs: HashMap<String, Vec<InputSpec>> = HashMap::new();
  for edge in &outgoing[entry] {
    let Some(accepted) = &resolved[edge.target].1.inputs else {
      continue;
    };
    for (output, input) in &edge.pairs {
      if let Some(spec) = accepted.get(input) {
        entry_specs.entry(output.clone()).or_default().push(spec.clone());
      }
    }
  }
  let mut entry_specs = Some(Arc::new(entry_specs));

  let plan_nodes = nodes
    .iter()
    .zip(resolved)
    .zip(incoming)
    .zip(outgoing)
    .zip(consumed)
    .zip(gather_depths)
    .map(
      |(((((info, (mut binding, _)), incoming), edges), outputs), gather_depth)| {
        if let Binding::Entry { inputs } = &mut binding
          && let Some(specs) = entry_specs.take()
        {
          *inputs = specs;
        }
        let mut inputs: Vec<String> = incoming
          .into_iter()
          .flat_map(|(_, pairs)| pairs.into_iter().map(|(_, input)| input))
          .collect();
        inputs.sort();
        PlanNode {
          info: info.clone(),
          binding,
          inputs,
          outputs: Arc::new(outputs),
          edges,
          gather_depth,
        }
      },
    )
    .collect();
  trace!(pipeline, nodes = nodes.len(), "pipeline validated");
  Ok(ExecutionPlan {
    nodes: plan_nodes,
    entry,
    exit,
  })
}

/// Kahn's algorithm; `None` when the graph has a cycle.
fn topological_order(incoming: &[Vec<(usize, Vec<(String, String)>)>], len: usize) -> Option<Vec<usize>> {
  let mut in_degree = vec![0usize; len];
  let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); len];
  for (d, sources) in incoming.iter().enumerate() {
    for (s, _) in sources {
      in_degree[d] += 1;
      dependents[*s].push(d);
    }
  }
  let mut ready: VecDeque<usize> = (0..len).filter(|i| in_degree[*i] == 0).collect();
  let mut order = Vec::with_capacity(len);
  while let Some(n) = ready.pop_front() {
    order.push(n);
    for &d in &dependents[n] {
      in_degree[d] -= 1;
      if in_degree[d] == 0 {
        ready.push_back(d);
      }
    }
  }
  (order.len() == len).then_some(order)
}

/// Checks demultiplexer/gather pairing and returns each node's gather depth.
///
/// Every node carries the stack of demultiplexers whose branches it runs in. All sources
/// of a node must share one stack; a gather node pops exactly the demultiplexers it names
/// from the top of that stack; the exit node must end with an empty stack.
fn branch_structure(
  pipeline: &str,
  nodes: &[NodeInfo],
  index: &HashMap<&str, usize>,
  incoming: &[Vec<(usize, Vec<(String, String)>)>],
  order: &[usize],
  entry: usize,
  exit: usize,
) -> Result<Vec<usize>, StatusCode> {
  let mut output_stacks: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
  let mut gather_depths = vec![0usize; nodes.len()];
  for &n in order {
    let node = &nodes[n];
    if let Some(count) = node.demultiply_count {
      if n == entry || n == exit || count == DemultiplyCount::Fixed(0) {
        error!(pipeline, node = %node.name, ?count, "invalid demultiply count");
        return Err(StatusCode::PipelineInvalidDemultiplyCount);
      }
    }
    let mut stacks = incoming[n].iter().map(|(s, _)| &output_stacks[*s]);
    let stack = match stacks.next() {
      Some(first) => {
        if stacks.any(|other| other != first) {
          error!(pipeline, node = %node.name, "inputs come from different demultiplexer branches");
          return Err(StatusCode::PipelineDemultiplexerGatherMismatch);
        }
        first.clone()
      }
      None => Vec::new(),
    };
    let gathered = node
      .gather_from
      .iter()
      .map(|g| {
        index.get(g.as_str()).copied().ok_or_else(|| {
          error!(pipeline, node = %node.name, gather_from = %g, "gather from missing node");
          StatusCode::PipelineNodeReferingToMissingNode
        })
      })
      .collect::<Result<BTreeSet<usize>, _>>()?;
    let depth = gathered.len();
    if depth > stack.len()
      || stack[stack.len() - depth..].iter().copied().collect::<BTreeSet<_>>() != gathered
    {
      error!(pipeline, node = %node.name, "gather does not match enclosing demultiplexers");
      return Err(StatusCode::PipelineDemultiplexerGatherMismatch);
    }
    let mut out = stack[..stack.len() - depth].to_vec();
    if n == exit && !out.is_empty() {
      error!(pipeline, "pipeline output is not gathered back from demultiplexed branches");
      return Err(StatusCode::PipelineDemultiplexerGatherMismatch);
    }
    if node.demultiply_count.is_some() {
      out.push(n);
    }
    gather_depths[n] = depth;
    output_stacks[n] = out;
  }
  Ok(gather_depths)
}
