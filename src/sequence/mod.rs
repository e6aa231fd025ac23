//! Stateful session tracking.
//!
//! Each stateful graph owns a [`SequenceManager`]; the process-wide
//! [`GlobalSequencesViewer`] watches every registered manager and evicts idle
//! sessions on a periodic background task.

mod global_sequences_viewer;
#[allow(clippy::module_inception)]
mod sequence;
mod sequence_manager;

pub use global_sequences_viewer::{DEFAULT_SEQUENCE_TIMEOUT, GlobalSequencesViewer};
pub use sequence::{Sequence, SequenceMemoryState};
pub use sequence_manager::{SequenceControl, SequenceManager};
