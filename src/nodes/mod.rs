//! Compute nodes of a pipeline instance.
//!
//! The node set is closed: every instance is built from the four kinds below and driven
//! through the same `declared_inputs` / `declared_outputs` / `run` interface.

mod custom_node;
mod entry_node;
mod exit_node;
mod model_node;

use std::collections::HashMap;
use std::sync::Arc;

pub(crate) use custom_node::CustomNode;
pub(crate) use entry_node::EntryNode;
pub(crate) use exit_node::ExitNode;
pub(crate) use model_node::ModelNode;

use crate::model::ModelBackend;
use crate::status::StatusCode;
use crate::types::{Buffer, PredictRequest};
use crate::validation::{Binding, PlanNode};

/// One node of a pipeline instance, bound to the request it serves.
#[derive(Debug)]
pub(crate) enum Node<'a> {
  Entry(EntryNode<'a>),
  Exit(ExitNode),
  Model(ModelNode),
  Custom(CustomNode),
}

impl<'a> Node<'a> {
  /// Binds a validated node to `request` and the dependencies it calls into.
  pub(crate) fn bind(
    plan: &PlanNode,
    models: &Arc<dyn ModelBackend>,
    request: &'a PredictRequest,
  ) -> Self {
    let name = plan.info.name.clone();
    let inputs = plan.inputs.clone();
    let outputs = Arc::clone(&plan.outputs);
    match &plan.binding {
      Binding::Entry { inputs: specs } => {
        Node::Entry(EntryNode::new(name, request, outputs, Arc::clone(specs)))
      }
      Binding::Exit => Node::Exit(ExitNode::new(name, inputs)),
      Binding::Model {
        model_name,
        version,
      } => Node::Model(ModelNode::new(
        name,
        model_name.clone(),
        *version,
        Arc::clone(models),
        inputs,
        outputs,
      )),
      Binding::Custom {
        library,
        parameters,
      } => Node::Custom(CustomNode::new(
        name,
        library.clone(),
        Arc::clone(parameters),
        inputs,
        outputs,
      )),
    }
  }

  pub(crate) fn name(&self) -> &str {
    match self {
      Node::Entry(n) => n.name(),
      Node::Exit(n) => n.name(),
      Node::Model(n) => n.name(),
      Node::Custom(n) => n.name(),
    }
  }

  /// Input names the node waits for before it runs.
  pub(crate) fn declared_inputs(&self) -> &[String] {
    match self {
      Node::Entry(_) => &[],
      Node::Exit(n) => n.declared_inputs(),
      Node::Model(n) => n.declared_inputs(),
      Node::Custom(n) => n.declared_inputs(),
    }
  }

  /// Output names consumed from the node; empty for the exit node.
  pub(crate) fn declared_outputs(&self) -> impl Iterator<Item = &str> {
    let outputs = match self {
      Node::Entry(n) => Some(n.declared_outputs()),
      Node::Exit(_) => None,
      Node::Model(n) => Some(n.declared_outputs()),
      Node::Custom(n) => Some(n.declared_outputs()),
    };
    outputs.into_iter().flatten().map(String::as_str)
  }

  /// Runs the node on a complete set of inputs.
  pub(crate) async fn run(
    &self,
    inputs: HashMap<String, Buffer>,
  ) -> Result<HashMap<String, Buffer>, StatusCode> {
    match self {
      Node::Entry(n) => n.run(),
      Node::Exit(n) => Ok(n.run(inputs)),
      Node::Model(n) => n.run(inputs).await,
      Node::Custom(n) => n.run(inputs).await,
    }
  }
}
