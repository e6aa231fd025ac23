//! One stateful client session.

use std::collections::HashMap;

use tokio::time::Instant;

use crate::types::Buffer;

/// Named state buffers carried between requests of one session.
pub type SequenceMemoryState = HashMap<String, Buffer>;

#[derive(Debug, Clone)]
pub struct Sequence {
  id: u64,
  memory_state: SequenceMemoryState,
  last_activity: Instant,
  terminated: bool,
}

impl Sequence {
  pub fn new(id: u64) -> Self {
    Self {
      id,
      memory_state: SequenceMemoryState::new(),
      last_activity: Instant::now(),
      terminated: false,
    }
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn memory_state(&self) -> &SequenceMemoryState {
    &self.memory_state
  }

  /// Replaces the stored state and counts as activity.
  pub fn update_memory_state(&mut self, state: SequenceMemoryState) {
    self.memory_state = state;
    self.touch();
  }

  pub fn last_activity(&self) -> Instant {
    self.last_activity
  }

  pub fn touch(&mut self) {
    self.last_activity = Instant::now();
  }

  pub fn is_terminated(&self) -> bool {
    self.terminated
  }

  pub(crate) fn terminate(&mut self) {
    self.terminated = true;
  }
}
