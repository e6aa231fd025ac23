//! Pipeline instance: one request-bound execution of a validated plan.
//!
//! Nodes run as soon as all their inputs are present. Independent ready nodes and
//! demultiplexed branches are driven concurrently on the calling task; custom node calls
//! move to the blocking pool. The first failure aborts the instance.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tracing::{debug, error, instrument};

use crate::nodes::Node;
use crate::pipeline_definition::Dependencies;
use crate::status::StatusCode;
use crate::types::{Buffer, DemultiplyCount, PredictRequest, PredictResponse};
use crate::validation::{ExecutionPlan, PlanNode};

/// Position of one execution inside nested demultiplexer branches: `(index, total)` per
/// level, outermost first.
type SessionKey = Vec<(u32, u32)>;

/// Inputs collected so far for one `(node, session)` pair.
#[derive(Default)]
struct PendingInputs {
  /// Branch totals of the levels being gathered.
  totals: Vec<u32>,
  received: usize,
  buffers: HashMap<String, BTreeMap<Vec<u32>, Buffer>>,
}

impl PendingInputs {
  fn new(totals: Vec<u32>) -> Self {
    Self {
      totals,
      ..Self::default()
    }
  }

  fn branches(&self) -> usize {
    self.totals.iter().map(|t| *t as usize).product()
  }

  fn insert(&mut self, input: &str, branch: Vec<u32>, buffer: Buffer) {
    let slot = self.buffers.entry(input.to_string()).or_default();
    if slot.insert(branch, buffer).is_none() {
      self.received += 1;
    }
  }

  fn is_complete(&self, input_count: usize) -> bool {
    self.received == input_count * self.branches()
  }

  /// Final inputs; gathered inputs are stacked in branch order.
  fn assemble(self) -> Result<HashMap<String, Buffer>, StatusCode> {
    let leading: Vec<u64> = self.totals.iter().map(|t| u64::from(*t)).collect();
    self
      .buffers
      .into_iter()
      .map(|(name, parts)| {
        let buffer = if leading.is_empty() {
          parts.into_values().next()
        } else {
          Buffer::stack(&parts.values().collect::<Vec<_>>(), &leading)
        };
        buffer
          .map(|b| (name, b))
          .ok_or(StatusCode::PipelineGatherShapeMismatch)
      })
      .collect()
  }
}

/// Request-bound execution of a pipeline.
#[derive(Debug)]
pub struct Pipeline<'a> {
  name: String,
  plan: Arc<ExecutionPlan>,
  nodes: Vec<Node<'a>>,
  response: &'a mut PredictResponse,
}

impl<'a> Pipeline<'a> {
  pub(crate) fn new(
    name: &str,
    plan: Arc<ExecutionPlan>,
    deps: &Dependencies,
    request: &'a PredictRequest,
    response: &'a mut PredictResponse,
  ) -> Self {
    let nodes = plan
      .nodes()
      .iter()
      .map(|n| Node::bind(n, &deps.models, request))
      .collect();
    Self {
      name: name.to_string(),
      plan,
      nodes,
      response,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Runs the pipeline and writes the exit node's buffers into the response.
  #[instrument(level = "trace", skip(self), fields(pipeline = %self.name))]
  pub async fn execute(&mut self) -> Result<(), StatusCode> {
    let plan: &ExecutionPlan = &self.plan;
    let nodes: &[Node<'a>] = &self.nodes;
    let mut pending: HashMap<(usize, SessionKey), PendingInputs> = HashMap::new();
    let mut running = FuturesUnordered::new();
    let mut exit_outputs = None;

    running.push(run_node(nodes, plan.entry(), SessionKey::new(), HashMap::new()));
    while let Some((index, key, result)) = running.next().await {
      let outputs = result.inspect_err(|status| {
        error!(pipeline = %self.name, node = nodes[index].name(), %status, "node execution failed");
      })?;
      if index == plan.exit() {
        exit_outputs = Some(outputs);
        continue;
      }
      if let Some(missing) = nodes[index]
        .declared_outputs()
        .find(|name| !outputs.contains_key(*name))
      {
        error!(pipeline = %self.name, node = nodes[index].name(), output = missing, "node did not produce output");
        return Err(StatusCode::NodeMissingOutput);
      }
      let node = &plan.nodes()[index];
      for (branch_key, branch_outputs) in branch(node, key, outputs)? {
        for edge in &node.edges {
          let target = &plan.nodes()[edge.target];
          let split = branch_key
            .len()
            .checked_sub(target.gather_depth)
            .ok_or(StatusCode::PipelineDemultiplexerGatherMismatch)?;
          let (exec_key, suffix) = branch_key.split_at(split);
          let totals: Vec<u32> = suffix.iter().map(|(_, total)| *total).collect();
          let slot_key = (edge.target, exec_key.to_vec());
          let slot = pending
            .entry(slot_key.clone())
            .or_insert_with(|| PendingInputs::new(totals.clone()));
          if slot.totals != totals {
            error!(pipeline = %self.name, node = %target.info.name, "gathered branches differ in count");
            return Err(StatusCode::PipelineGatherShapeMismatch);
          }
          let indices: Vec<u32> = suffix.iter().map(|(i, _)| *i).collect();
          for (output, input) in &edge.pairs {
            let buffer = branch_outputs.get(output).ok_or_else(|| {
              error!(pipeline = %self.name, node = %node.info.name, %output, "node did not produce output");
              StatusCode::NodeMissingOutput
            })?;
            slot.insert(input, indices.clone(), buffer.clone());
          }
          if slot.is_complete(nodes[edge.target].declared_inputs().len()) {
            let Some(ready) = pending.remove(&slot_key) else {
              continue;
            };
            debug!(pipeline = %self.name, node = nodes[edge.target].name(), session = ?slot_key.1, "node ready");
            running.push(run_node(nodes, edge.target, slot_key.1, ready.assemble()?));
          }
        }
      }
    }

    let outputs = exit_outputs.ok_or_else(|| {
      error!(pipeline = %self.name, "pipeline finished without reaching its exit node");
      StatusCode::InvalidMissingOutput
    })?;
    for name in plan.outputs() {
      if !outputs.contains_key(name) {
        return Err(StatusCode::InvalidMissingOutput);
      }
    }
    self.response.outputs.extend(outputs);
    Ok(())
  }
}

async fn run_node<'n>(
  nodes: &'n [Node<'_>],
  index: usize,
  key: SessionKey,
  inputs: HashMap<String, Buffer>,
) -> (usize, SessionKey, Result<HashMap<String, Buffer>, StatusCode>) {
  let result = nodes[index].run(inputs).await;
  (index, key, result)
}

/// Splits a demultiplexing node's outputs into per-branch output sets.
///
/// Non-demultiplexing nodes yield their outputs unchanged under `key`.
fn branch(
  node: &PlanNode,
  key: SessionKey,
  outputs: HashMap<String, Buffer>,
) -> Result<Vec<(SessionKey, HashMap<String, Buffer>)>, StatusCode> {
  let Some(count) = node.info.demultiply_count else {
    return Ok(vec![(key, outputs)]);
  };
  let mut split: Vec<(&String, Vec<Buffer>)> = Vec::with_capacity(node.outputs.len());
  for name in node.outputs.iter() {
    let buffer = outputs.get(name).ok_or(StatusCode::NodeMissingOutput)?;
    let parts = buffer.split_leading().ok_or_else(|| {
      error!(node = %node.info.name, output = %name, shape = ?buffer.shape(), "cannot demultiply output");
      StatusCode::PipelineDemultiplyCountMismatch
    })?;
    split.push((name, parts));
  }
  let total = match (count, split.first()) {
    (_, None) => return Ok(Vec::new()),
    (DemultiplyCount::Fixed(n), _) => n as usize,
    (DemultiplyCount::Dynamic, Some((_, parts))) => parts.len(),
  };
  if split.iter().any(|(_, parts)| parts.len() != total) {
    error!(node = %node.info.name, ?count, "demultiplexer outputs do not match branch count");
    return Err(StatusCode::PipelineDemultiplyCountMismatch);
  }
  if total == 0 {
    error!(node = %node.info.name, "demultiplexer produced no branches");
    return Err(StatusCode::PipelineDemultiplexerNoResults);
  }
  let total_u32 = u32::try_from(total).map_err(|_| StatusCode::PipelineDemultiplyCountMismatch)?;
  let mut branches: Vec<(SessionKey, HashMap<String, Buffer>)> = (0..total_u32)
    .map(|i| {
      let mut branch_key = key.clone();
      branch_key.push((i, total_u32));
      (branch_key, HashMap::with_capacity(split.len()))
    })
    .collect();
  for (name, parts) in split {
    for ((_, outputs), part) in branches.iter_mut().zip(parts) {
      outputs.insert(name.clone(), part);
    }
  }
  debug!(node = %node.info.name, branches = total, "demultiplexed outputs");
  Ok(branches)
}
