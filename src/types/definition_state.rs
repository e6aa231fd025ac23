//! Lifecycle state machine of a pipeline definition.

use std::fmt;

use serde::Serialize;

/// Lifecycle state of a pipeline definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineDefinitionState {
  Building,
  Validating,
  Available,
  /// Last validation failed; eligible for retry via reload or revalidation.
  ValidationFailed,
  RevalidationRequired,
  Retired,
}

/// Input to the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefinitionEvent {
  ValidationStarted,
  /// Validation of a freshly supplied replacement shape.
  ReloadStarted,
  ValidationPassed,
  ValidationFailed,
  UsedModelChanged,
  Retire,
}

/// State plus the "revalidation required" flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineDefinitionStatus {
  state: PipelineDefinitionState,
  revalidation_required: bool,
}

impl Default for PipelineDefinitionStatus {
  fn default() -> Self {
    Self {
      state: PipelineDefinitionState::Building,
      revalidation_required: false,
    }
  }
}

impl PipelineDefinitionStatus {
  pub fn state(&self) -> PipelineDefinitionState {
    self.state
  }

  pub fn is_available(&self) -> bool {
    self.state == PipelineDefinitionState::Available
  }

  pub fn is_retired(&self) -> bool {
    self.state == PipelineDefinitionState::Retired
  }

  pub fn is_revalidation_required(&self) -> bool {
    self.revalidation_required
  }

  /// Applies `event`; retirement is terminal and absorbs every later event.
  pub fn handle(&mut self, event: DefinitionEvent) {
    use PipelineDefinitionState as S;
    if self.state == S::Retired {
      return;
    }
    match event {
      DefinitionEvent::ValidationStarted => self.state = S::Validating,
      DefinitionEvent::ReloadStarted => {
        self.revalidation_required = false;
        self.state = S::Validating;
      }
      DefinitionEvent::ValidationPassed => {
        self.revalidation_required = false;
        self.state = S::Available;
      }
      DefinitionEvent::ValidationFailed => {
        self.state = if self.revalidation_required {
          S::RevalidationRequired
        } else {
          S::ValidationFailed
        };
      }
      DefinitionEvent::UsedModelChanged => {
        self.revalidation_required = true;
        self.state = S::RevalidationRequired;
      }
      DefinitionEvent::Retire => {
        self.revalidation_required = false;
        self.state = S::Retired;
      }
    }
  }
}

impl fmt::Display for PipelineDefinitionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      PipelineDefinitionState::Building => "BUILDING",
      PipelineDefinitionState::Validating => "VALIDATING",
      PipelineDefinitionState::Available => "AVAILABLE",
      PipelineDefinitionState::ValidationFailed => "VALIDATION_FAILED",
      PipelineDefinitionState::RevalidationRequired => "REVALIDATION_REQUIRED",
      PipelineDefinitionState::Retired => "RETIRED",
    };
    write!(f, "{}", s)
  }
}
