//! Session table of one stateful graph.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument};

use super::sequence::{Sequence, SequenceMemoryState};
use crate::status::StatusCode;

/// Sequence control input carried by a stateful request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum SequenceControl {
  #[default]
  NoControl = 0,
  Start = 1,
  End = 2,
}

impl TryFrom<u32> for SequenceControl {
  type Error = StatusCode;

  fn try_from(value: u32) -> Result<Self, Self::Error> {
    match value {
      0 => Ok(Self::NoControl),
      1 => Ok(Self::Start),
      2 => Ok(Self::End),
      _ => Err(StatusCode::InvalidRequestFormat),
    }
  }
}

#[derive(Debug)]
pub struct SequenceManager {
  timeout: Duration,
  max_sequence_number: usize,
  sequences: Mutex<HashMap<u64, Sequence>>,
}

impl SequenceManager {
  pub fn new(timeout: Duration, max_sequence_number: usize) -> Self {
    Self {
      timeout,
      max_sequence_number,
      sequences: Mutex::new(HashMap::new()),
    }
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }

  pub fn max_sequence_number(&self) -> usize {
    self.max_sequence_number
  }

  pub fn len(&self) -> usize {
    self.sequences.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.sequences.lock().is_empty()
  }

  pub fn has_sequence(&self, id: u64) -> Result<(), StatusCode> {
    let sequences = self.sequences.lock();
    match sequences.get(&id) {
      None => Err(StatusCode::SequenceMissing),
      Some(sequence) if sequence.is_terminated() => Err(StatusCode::SequenceTerminated),
      Some(_) => Ok(()),
    }
  }

  /// Applies a request's control input to the session table.
  ///
  /// Start creates the session, NoControl requires a live one and refreshes
  /// it, End marks it terminated so later requests fail until it is removed.
  #[instrument(level = "trace", skip(self))]
  pub fn process_control(
    &self,
    control: SequenceControl,
    id: u64,
  ) -> Result<(), StatusCode> {
    let mut sequences = self.sequences.lock();
    match control {
      SequenceControl::Start => {
        if sequences.contains_key(&id) {
          return Err(StatusCode::SequenceAlreadyExists);
        }
        if sequences.len() >= self.max_sequence_number {
          return Err(StatusCode::MaxSequenceNumberReached);
        }
        sequences.insert(id, Sequence::new(id));
        debug!(sequence_id = id, "sequence created");
        Ok(())
      }
      SequenceControl::NoControl | SequenceControl::End => {
        let sequence = sequences.get_mut(&id).ok_or(StatusCode::SequenceMissing)?;
        if sequence.is_terminated() {
          return Err(StatusCode::SequenceTerminated);
        }
        sequence.touch();
        if control == SequenceControl::End {
          sequence.terminate();
          debug!(sequence_id = id, "sequence terminated");
        }
        Ok(())
      }
    }
  }

  pub fn memory_state(&self, id: u64) -> Result<SequenceMemoryState, StatusCode> {
    self
      .sequences
      .lock()
      .get(&id)
      .map(|sequence| sequence.memory_state().clone())
      .ok_or(StatusCode::SequenceMissing)
  }

  pub fn update_memory_state(
    &self,
    id: u64,
    state: SequenceMemoryState,
  ) -> Result<(), StatusCode> {
    let mut sequences = self.sequences.lock();
    let sequence = sequences.get_mut(&id).ok_or(StatusCode::SequenceMissing)?;
    sequence.update_memory_state(state);
    Ok(())
  }

  pub fn remove_sequence(&self, id: u64) -> Result<(), StatusCode> {
    match self.sequences.lock().remove(&id) {
      Some(_) => {
        debug!(sequence_id = id, "sequence removed");
        Ok(())
      }
      None => Err(StatusCode::SequenceMissing),
    }
  }

  /// Evicts sessions idle for longer than the timeout as of `scan_start`.
  ///
  /// Sessions touched at or after `scan_start` are never evicted.
  #[instrument(level = "trace", skip(self))]
  pub fn remove_timed_out_sequences(&self, scan_start: Instant) -> usize {
    let mut sequences = self.sequences.lock();
    let before = sequences.len();
    sequences.retain(|_, sequence| {
      let last_activity = sequence.last_activity();
      last_activity >= scan_start || scan_start.duration_since(last_activity) <= self.timeout
    });
    let removed = before - sequences.len();
    if removed > 0 {
      debug!(removed, "timed out sequences evicted");
    }
    removed
  }
}
