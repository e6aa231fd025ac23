//! Process-wide view over every stateful graph's session table.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument};

use super::sequence_manager::SequenceManager;
use crate::status::StatusCode;

/// Idle timeout assumed when no stricter manager is registered.
pub const DEFAULT_SEQUENCE_TIMEOUT: Duration = Duration::from_secs(60);

const MIN_WATCHER_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
struct Shared {
  managers: Mutex<BTreeMap<String, Arc<SequenceManager>>>,
  fixed_interval: Mutex<Option<Duration>>,
}

impl Shared {
  fn watcher_interval(&self) -> Duration {
    if let Some(interval) = *self.fixed_interval.lock() {
      return interval.max(MIN_WATCHER_INTERVAL);
    }
    self
      .managers
      .lock()
      .values()
      .map(|manager| manager.timeout() / 2)
      .fold(DEFAULT_SEQUENCE_TIMEOUT / 2, Duration::min)
      .max(MIN_WATCHER_INTERVAL)
  }

  fn remove_timed_out_sequences(&self) -> usize {
    let scan_start = Instant::now();
    let managers: Vec<Arc<SequenceManager>> = self.managers.lock().values().cloned().collect();
    managers
      .iter()
      .map(|manager| manager.remove_timed_out_sequences(scan_start))
      .sum()
  }
}

#[derive(Debug)]
struct Watcher {
  exit: oneshot::Sender<()>,
  handle: JoinHandle<()>,
}

/// Registry of session tables plus the background eviction task.
///
/// The watcher is started with [`start_watcher`](Self::start_watcher) and must
/// be stopped with [`join`](Self::join) during teardown.
#[derive(Debug, Default)]
pub struct GlobalSequencesViewer {
  shared: Arc<Shared>,
  watcher: Mutex<Option<Watcher>>,
}

impl GlobalSequencesViewer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Viewer whose watcher wakes on a fixed period instead of half the lowest timeout.
  pub fn with_interval(interval: Duration) -> Self {
    let viewer = Self::default();
    viewer.set_fixed_interval(Some(interval));
    viewer
  }

  /// Overrides the scan period; `None` restores the timeout-derived period.
  ///
  /// A running watcher picks up the change after its current sleep.
  pub fn set_fixed_interval(&self, interval: Option<Duration>) {
    *self.shared.fixed_interval.lock() = interval;
  }

  #[instrument(level = "trace", skip(self, manager))]
  pub fn register_manager(
    &self,
    id: &str,
    manager: Arc<SequenceManager>,
  ) -> Result<(), StatusCode> {
    let mut managers = self.shared.managers.lock();
    if managers.contains_key(id) {
      debug!(manager = id, "sequence manager already registered");
      return Err(StatusCode::SequenceManagerAlreadyRegistered);
    }
    managers.insert(id.to_string(), manager);
    Ok(())
  }

  #[instrument(level = "trace", skip(self))]
  pub fn unregister_manager(&self, id: &str) -> Result<(), StatusCode> {
    match self.shared.managers.lock().remove(id) {
      Some(_) => Ok(()),
      None => {
        debug!(manager = id, "sequence manager not registered");
        Err(StatusCode::SequenceManagerMissing)
      }
    }
  }

  pub fn manager(&self, id: &str) -> Option<Arc<SequenceManager>> {
    self.shared.managers.lock().get(id).cloned()
  }

  /// Current scan period: the fixed interval, or half of the lowest registered timeout.
  pub fn watcher_interval(&self) -> Duration {
    self.shared.watcher_interval()
  }

  /// Runs one eviction pass over every registered table. Returns the number evicted.
  pub fn remove_timed_out_sequences(&self) -> usize {
    self.shared.remove_timed_out_sequences()
  }

  pub fn is_watching(&self) -> bool {
    self.watcher.lock().is_some()
  }

  /// Spawns the eviction task on the current tokio runtime. No-op if already running.
  pub fn start_watcher(&self) {
    let mut watcher = self.watcher.lock();
    if watcher.is_some() {
      return;
    }
    let (exit, mut exit_rx) = oneshot::channel();
    let shared = Arc::clone(&self.shared);
    let handle = tokio::spawn(async move {
      info!("sequence timeout watcher started");
      loop {
        let period = shared.watcher_interval();
        tokio::select! {
          _ = &mut exit_rx => break,
          _ = tokio::time::sleep(period) => {
            debug!("sequence watcher check cycle");
            shared.remove_timed_out_sequences();
          }
        }
      }
      info!("sequence timeout watcher stopped");
    });
    *watcher = Some(Watcher { exit, handle });
  }

  /// Signals the watcher to exit and waits for it.
  pub async fn join(&self) {
    let Some(Watcher { exit, handle }) = self.watcher.lock().take() else {
      return;
    };
    let _ = exit.send(());
    if let Err(e) = handle.await {
      error!(error = %e, "sequence watcher task failed");
    }
  }
}
